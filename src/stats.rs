//! 전송 통계
//!
//! 여러 태스크(Duplicater, 수신 어댑터)가 동시에 갱신하므로 원자 카운터로 둔다.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// 경로 통계
#[derive(Debug)]
pub struct PathStats {
    /// 시작 시간
    start_time: Instant,

    /// Duplicater에 들어온 데이터그램 수
    sent_datagrams: AtomicU64,

    /// 터널이 받아들인 사본 수 (원본 포함)
    sent_copies: AtomicU64,

    /// 송신 바이트 (사본 포함)
    sent_bytes: AtomicU64,

    /// 폴백 큐로 보낸 데이터그램 수
    fallbacks: AtomicU64,

    /// 수신 후 전달된 고유 데이터그램 수
    delivered: AtomicU64,

    /// 수신 바이트 (중복 제외)
    delivered_bytes: AtomicU64,

    /// 중복으로 버린 데이터그램 수
    duplicates: AtomicU64,
}

/// 특정 시점의 통계 값
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub sent_datagrams: u64,
    pub sent_copies: u64,
    pub sent_bytes: u64,
    pub fallbacks: u64,
    pub delivered: u64,
    pub delivered_bytes: u64,
    pub duplicates: u64,
}

impl PathStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            sent_datagrams: AtomicU64::new(0),
            sent_copies: AtomicU64::new(0),
            sent_bytes: AtomicU64::new(0),
            fallbacks: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            delivered_bytes: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
        }
    }

    /// 데이터그램 1개 송신 결과 기록
    pub fn record_send(&self, copies: usize, size: usize) {
        self.sent_datagrams.fetch_add(1, Ordering::Relaxed);
        self.sent_copies.fetch_add(copies as u64, Ordering::Relaxed);
        self.sent_bytes
            .fetch_add((copies * size) as u64, Ordering::Relaxed);
    }

    /// 폴백 기록
    pub fn record_fallback(&self) {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    /// 고유 데이터그램 수신 기록
    pub fn record_delivered(&self, size: usize) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        self.delivered_bytes.fetch_add(size as u64, Ordering::Relaxed);
    }

    /// 중복 기록
    pub fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sent_datagrams: self.sent_datagrams.load(Ordering::Relaxed),
            sent_copies: self.sent_copies.load(Ordering::Relaxed),
            sent_bytes: self.sent_bytes.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            delivered_bytes: self.delivered_bytes.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
        }
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        let s = self.snapshot();
        format!(
            "Elapsed: {:.2}s | Sent: {} ({} copies, x{:.2}) | Fallback: {} | Delivered: {} | Dup: {:.2}%",
            self.elapsed().as_secs_f64(),
            s.sent_datagrams,
            s.sent_copies,
            s.redundancy(),
            s.fallbacks,
            s.delivered,
            s.duplicate_rate() * 100.0,
        )
    }
}

impl Default for PathStats {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsSnapshot {
    /// 데이터그램당 평균 사본 수
    pub fn redundancy(&self) -> f64 {
        if self.sent_datagrams == 0 {
            return 0.0;
        }
        self.sent_copies as f64 / self.sent_datagrams as f64
    }

    /// 수신 프레임 중 중복 비율
    pub fn duplicate_rate(&self) -> f64 {
        let total = self.delivered + self.duplicates;
        if total == 0 {
            return 0.0;
        }
        self.duplicates as f64 / total as f64
    }
}
