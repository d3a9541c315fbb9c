//! 신뢰성 스트림 어댑터 (가짜 데이터그램 인터페이스)
//!
//! 외부 신뢰성 전송 엔진이 UDP 소켓 대신 사용하는 송수신 쌍.
//!
//! - 송신: `u32 시퀀스 ID | 페이로드`로 감싸 Duplicater 입력 큐로
//! - 수신: 모든 터널이 채우는 수신 큐에서 꺼내 ID를 떼고 중복 제거
//!
//! 중복 제거는 세션마다 여기서 한 번만 한다.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use crate::pool::{BufItem, Pool};
use crate::stats::PathStats;
use crate::{Error, Result, COMMAND_SIGN};

/// 첫 번째 집합을 비우는 수락 횟수
const FIRST_RESET: usize = 100;

/// 두 번째 집합을 비우고 카운터를 초기화하는 수락 횟수
const SECOND_RESET: usize = 200;

/// 회전 중복 제거 윈도우
///
/// 두 집합이 번갈아 비워지므로 최근 수락된 ID 중 최소 99개(최대 199개)를 기억한다.
#[derive(Debug, Default)]
pub struct DedupWindow {
    first: HashSet<u32>,
    second: HashSet<u32>,
    accepted: usize,
}

impl DedupWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// 처음 보는 ID면 기록하고 true
    pub fn accept(&mut self, id: u32) -> bool {
        if self.first.contains(&id) || self.second.contains(&id) {
            return false;
        }

        self.first.insert(id);
        self.second.insert(id);
        self.accepted += 1;

        if self.accepted == FIRST_RESET {
            self.first.clear();
        } else if self.accepted == SECOND_RESET {
            self.second.clear();
            self.accepted = 0;
        }
        true
    }
}

/// 어댑터 (송신/수신 쌍으로 분리해서 사용)
pub struct ReliableStreamAdapter {
    outbound: mpsc::Sender<BufItem>,
    inbound: mpsc::Receiver<BufItem>,
    stats: Arc<PathStats>,
}

impl ReliableStreamAdapter {
    /// `outbound`는 Duplicater 입력, `inbound`는 세션 공용 수신 큐
    pub fn new(outbound: mpsc::Sender<BufItem>, inbound: mpsc::Receiver<BufItem>, stats: Arc<PathStats>) -> Self {
        Self {
            outbound,
            inbound,
            stats,
        }
    }

    pub fn split(self) -> (DatagramSender, DatagramReceiver) {
        (
            DatagramSender {
                outbound: self.outbound,
                pool: Pool::data(),
                next_id: 0,
            },
            DatagramReceiver {
                inbound: self.inbound,
                window: DedupWindow::new(),
                current: None,
                stats: self.stats,
            },
        )
    }
}

/// 송신 쪽
pub struct DatagramSender {
    outbound: mpsc::Sender<BufItem>,
    pool: Arc<Pool>,
    next_id: u32,
}

impl DatagramSender {
    /// 최대 페이로드 크기
    pub fn max_payload(&self) -> usize {
        self.pool.capacity() - 4
    }

    fn next_sequence(&mut self) -> u32 {
        if self.next_id == COMMAND_SIGN {
            self.next_id = self.next_id.wrapping_add(1);
        }
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        id
    }

    /// 데이터그램 하나 송신
    pub async fn send_to(&mut self, payload: &[u8]) -> Result<usize> {
        if payload.len() > self.max_payload() {
            return Err(Error::BufferOverflow {
                need: payload.len(),
                free: self.max_payload(),
            });
        }

        let mut buf = self.pool.get();
        buf.append_u32(self.next_sequence())?.append(payload)?;
        self.outbound
            .send(buf)
            .await
            .map_err(|_| Error::ConnectionClosed)?;
        Ok(payload.len())
    }

    #[cfg(test)]
    fn with_next_id(mut self, id: u32) -> Self {
        self.next_id = id;
        self
    }
}

/// 수신 쪽
pub struct DatagramReceiver {
    inbound: mpsc::Receiver<BufItem>,
    window: DedupWindow,

    /// 읽다 만 데이터그램
    current: Option<BufItem>,

    stats: Arc<PathStats>,
}

impl DatagramReceiver {
    /// 다음 고유 데이터그램을 `out`으로 읽기
    ///
    /// `out`이 작으면 나머지는 다음 호출에서 이어서 읽는다.
    pub async fn recv_from(&mut self, out: &mut [u8]) -> Result<usize> {
        loop {
            if let Some(buf) = self.current.as_mut() {
                let n = buf.read(out);
                if buf.is_empty() {
                    self.current = None;
                }
                return Ok(n);
            }

            let mut buf = self.inbound.recv().await.ok_or(Error::ConnectionClosed)?;
            let Some(id) = buf.read_u32() else {
                debug!("짧은 데이터그램 버림: {} 바이트", buf.size());
                continue;
            };

            if !self.window.accept(id) {
                self.stats.record_duplicate();
                continue;
            }
            self.stats.record_delivered(buf.size());
            if !buf.is_empty() {
                self.current = Some(buf);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn adapter() -> (DatagramSender, DatagramReceiver, mpsc::Receiver<BufItem>, mpsc::Sender<BufItem>, Arc<PathStats>) {
        let (out_tx, out_rx) = mpsc::channel(16);
        let (in_tx, in_rx) = mpsc::channel(16);
        let stats = Arc::new(PathStats::new());
        let (tx, rx) = ReliableStreamAdapter::new(out_tx, in_rx, stats.clone()).split();
        (tx, rx, out_rx, in_tx, stats)
    }

    fn framed(id: u32, payload: &[u8]) -> BufItem {
        let mut buf = Pool::data().get();
        buf.append_u32(id).unwrap().append(payload).unwrap();
        buf
    }

    #[tokio::test]
    async fn test_send_to_prepends_sequence() {
        let (mut tx, _rx, mut out, _in, _) = adapter();
        tx.send_to(b"a").await.unwrap();
        tx.send_to(b"bc").await.unwrap();

        let mut first = out.recv().await.unwrap();
        assert_eq!(first.read_u32(), Some(0));
        assert_eq!(first.data(), b"a");
        let mut second = out.recv().await.unwrap();
        assert_eq!(second.read_u32(), Some(1));
        assert_eq!(second.data(), b"bc");
    }

    #[tokio::test]
    async fn test_sequence_skips_command_sign() {
        let (tx, _rx, mut out, _in, _) = adapter();
        let mut tx = tx.with_next_id(COMMAND_SIGN - 1);
        tx.send_to(b"1").await.unwrap();
        tx.send_to(b"2").await.unwrap();

        assert_eq!(out.recv().await.unwrap().read_u32(), Some(COMMAND_SIGN - 1));
        assert_eq!(out.recv().await.unwrap().read_u32(), Some(COMMAND_SIGN + 1));
    }

    #[tokio::test]
    async fn test_oversize_payload_rejected() {
        let (mut tx, _rx, _out, _in, _) = adapter();
        let big = vec![0u8; tx.max_payload() + 1];
        assert!(matches!(tx.send_to(&big).await, Err(Error::BufferOverflow { .. })));
    }

    #[tokio::test]
    async fn test_duplicates_delivered_once() {
        let (_tx, mut rx, _out, in_tx, stats) = adapter();
        in_tx.send(framed(5, b"five")).await.unwrap();
        in_tx.send(framed(5, b"five")).await.unwrap();
        in_tx.send(framed(6, b"six")).await.unwrap();

        let mut out = [0u8; 64];
        let n = rx.recv_from(&mut out).await.unwrap();
        assert_eq!(&out[..n], b"five");
        let n = rx.recv_from(&mut out).await.unwrap();
        assert_eq!(&out[..n], b"six");

        let s = stats.snapshot();
        assert_eq!(s.delivered, 2);
        assert_eq!(s.duplicates, 1);
    }

    #[tokio::test]
    async fn test_partial_reads_drain_current() {
        let (_tx, mut rx, _out, in_tx, _) = adapter();
        in_tx.send(framed(1, b"abcdef")).await.unwrap();
        in_tx.send(framed(2, b"g")).await.unwrap();

        let mut out = [0u8; 4];
        assert_eq!(rx.recv_from(&mut out).await.unwrap(), 4);
        assert_eq!(&out, b"abcd");
        let n = rx.recv_from(&mut out).await.unwrap();
        assert_eq!(&out[..n], b"ef");
        let n = rx.recv_from(&mut out).await.unwrap();
        assert_eq!(&out[..n], b"g");
    }

    #[tokio::test]
    async fn test_short_frames_are_skipped() {
        let (_tx, mut rx, _out, in_tx, _) = adapter();
        let mut short = Pool::data().get();
        short.append(&[1, 2]).unwrap();
        in_tx.send(short).await.unwrap();
        in_tx.send(framed(9, b"ok")).await.unwrap();

        let mut out = [0u8; 8];
        let n = rx.recv_from(&mut out).await.unwrap();
        assert_eq!(&out[..n], b"ok");
    }

    #[tokio::test]
    async fn test_closed_queue() {
        let (_tx, mut rx, _out, in_tx, _) = adapter();
        drop(in_tx);
        let mut out = [0u8; 8];
        assert!(matches!(rx.recv_from(&mut out).await, Err(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_send_to_closed_duplicater() {
        let (mut tx, _rx, out, _in, _) = adapter();
        drop(out);
        assert!(matches!(tx.send_to(b"x").await, Err(Error::ConnectionClosed)));
    }

    #[test]
    fn test_window_rotation() {
        let mut window = DedupWindow::new();
        assert!((0..150).all(|id| window.accept(id)));
        // 150개 수락 후에도 두 번째 집합이 전부 기억
        assert!((0..150).all(|id| !window.accept(id)));

        assert!((150..260).all(|id| window.accept(id)));
        // 윈도우 밖으로 밀려난 ID는 다시 수락됨
        assert!((0..50).all(|id| window.accept(id)));
        // 최근 ID는 여전히 거부
        assert!((200..260).all(|id| !window.accept(id)));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// 윈도우 안에서 재전송된 ID는 정확히 한 번만 수락
        #[test]
        fn prop_dedup_idempotent(
            ids in prop::collection::hash_set(any::<u32>(), 1..90),
            replays in 1usize..4,
            seed in any::<u64>(),
        ) {
            let ids: Vec<u32> = ids.into_iter().collect();
            let mut stream = Vec::new();
            for r in 0..=replays {
                // 라운드마다 순서를 섞는다
                let shift = (seed as usize).wrapping_add(r) % ids.len();
                stream.extend(ids.iter().cycle().skip(shift).take(ids.len()).copied());
            }

            let mut window = DedupWindow::new();
            let accepted = stream.iter().filter(|&&id| window.accept(id)).count();
            prop_assert_eq!(accepted, ids.len());
        }
    }
}
