//! 선택적 중복 전송
//!
//! 송신 데이터그램마다 RTT 순위 상위 N개 터널로 사본을 보낸다.
//! `N = clamp(F, 1, 생존 터널 수)`. 한 곳도 받지 못하면 폴백 큐로 넘긴다.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::config::Config;
use crate::pool::BufItem;
use crate::stats::PathStats;
use crate::tunnel::{Tunnel, TunnelRegistry};

/// 중복 전송기
pub struct Duplicater {
    /// 목표 복제 수 F
    factor: AtomicUsize,
    stats: Arc<PathStats>,
}

/// 순위가 매겨진 터널 목록
#[derive(Default)]
struct Ranking {
    version: Option<u64>,
    tunnels: Vec<Arc<Tunnel>>,
    alive: usize,
}

impl Ranking {
    fn rebuild(&mut self, version: u64, snapshot: &[Arc<Tunnel>]) {
        self.tunnels = rank(snapshot);
        self.alive = self.tunnels.iter().filter(|t| t.is_alive()).count();
        self.version = Some(version);
    }
}

/// 실효 RTT 오름차순 정렬 (닫힌 터널 제외, 같은 값은 원래 순서 유지)
pub fn rank(tunnels: &[Arc<Tunnel>]) -> Vec<Arc<Tunnel>> {
    let mut ranked: Vec<_> = tunnels.iter().filter(|t| !t.is_closed()).cloned().collect();
    ranked.sort_by_key(|t| t.effective_rtt());
    ranked
}

impl Duplicater {
    /// 송신 루프 시작
    pub fn spawn(
        registry: Arc<TunnelRegistry>,
        input: mpsc::Receiver<BufItem>,
        fallback: mpsc::Sender<BufItem>,
        stats: Arc<PathStats>,
        config: &Config,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let duplicater = Arc::new(Self {
            factor: AtomicUsize::new(config.duplicate_num.max(1)),
            stats,
        });

        tokio::spawn(duplicater.clone().run(
            registry,
            input,
            fallback,
            config.send_probe_timeout(),
            config.rerank_interval(),
            shutdown,
        ));
        duplicater
    }

    pub fn factor(&self) -> usize {
        self.factor.load(Ordering::Relaxed)
    }

    /// 복제 수 변경 (최소 1)
    pub fn set_factor(&self, factor: usize) {
        self.factor.store(factor.max(1), Ordering::Relaxed);
        info!("Duplicater 복제 수: {}", factor.max(1));
    }

    async fn run(
        self: Arc<Self>,
        registry: Arc<TunnelRegistry>,
        mut input: mpsc::Receiver<BufItem>,
        fallback: mpsc::Sender<BufItem>,
        wait: Duration,
        rerank_interval: Duration,
        shutdown: CancellationToken,
    ) {
        let mut ranking = Ranking::default();
        let mut ticker = tokio::time::interval(rerank_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let (version, snapshot) = registry.snapshot();
                    ranking.rebuild(version, &snapshot);
                }
                buf = input.recv() => {
                    let Some(buf) = buf else { break };

                    let seen = ranking.version.unwrap_or(u64::MAX);
                    if let Some((version, snapshot)) = registry.snapshot_if_changed(seen) {
                        ranking.rebuild(version, &snapshot);
                    }

                    let n = self.factor().min(ranking.alive).max(1);
                    let size = buf.size();
                    match fan_out(buf, &ranking.tunnels, n, wait).await {
                        Ok(sent) => {
                            trace!("데이터그램 {}개 터널로 전송", sent);
                            self.stats.record_send(sent, size);
                        }
                        Err(buf) => {
                            self.stats.record_fallback();
                            tokio::select! {
                                _ = shutdown.cancelled() => break,
                                r = fallback.send(buf) => if r.is_err() { break },
                            }
                        }
                    }
                }
            }
        }
        debug!("Duplicater 종료: {}", self.stats.summary());
    }
}

/// 순위대로 시도하며 최대 `n`개 터널에 전달
///
/// 상위 터널이 받지 못하면 목록 아래쪽 터널로 계속 내려가며 `n`개를 채운다.
/// 마지막 사본은 원본을 그대로 넘기고, 실패한 시도의 버퍼는 다음 터널에 재사용한다.
/// 한 곳도 받지 못하면 원본을 돌려준다.
pub async fn fan_out(
    buf: BufItem,
    tunnels: &[Arc<Tunnel>],
    n: usize,
    wait: Duration,
) -> std::result::Result<usize, BufItem> {
    let mut original = Some(buf);
    let mut in_hand: Option<BufItem> = None;
    let mut sent = 0;

    for tunnel in tunnels {
        if sent == n {
            break;
        }

        let item = match in_hand.take() {
            Some(item) => item,
            None if sent + 1 == n => match original.take() {
                Some(item) => item,
                None => break,
            },
            None => match original.as_ref() {
                Some(item) => item.copy(),
                None => break,
            },
        };

        match tunnel.try_send(item, wait).await {
            Ok(()) => sent += 1,
            Err(item) => in_hand = Some(item),
        }
    }

    if sent > 0 {
        return Ok(sent);
    }
    match original.or(in_hand) {
        Some(buf) => Err(buf),
        None => Ok(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{is_command, read_frame};
    use crate::pool::Pool;
    use crate::tunnel::tests::fixture;
    use crate::DATA_BUF_SIZE;
    use tokio::io::DuplexStream;

    fn test_config(duplicate_num: usize) -> Config {
        Config {
            duplicate_num,
            close_grace_ms: 10,
            ..Config::default()
        }
    }

    fn datagram(bytes: &[u8]) -> BufItem {
        let mut buf = Pool::data().get();
        buf.append(bytes).unwrap();
        buf
    }

    /// 피어 쪽에서 다음 데이터 프레임 읽기 (커맨드 건너뜀, 시간 초과 시 None)
    async fn next_data(peer: &mut DuplexStream, within: Duration) -> Option<Vec<u8>> {
        let pool = Pool::data();
        tokio::time::timeout(within, async {
            loop {
                let frame = read_frame(peer, &pool, DATA_BUF_SIZE).await.ok()?;
                if !is_command(frame.data()) {
                    return Some(frame.data().to_vec());
                }
            }
        })
        .await
        .ok()
        .flatten()
    }

    #[tokio::test]
    async fn test_top_two_by_rtt_receive_copies() {
        let f = fixture(test_config(2));
        let registry = TunnelRegistry::new();

        let mut peers = Vec::new();
        for (id, rtt) in [(1, 90), (2, 10), (3, 50)] {
            let tunnel = Tunnel::new(id, &f.shared);
            let (a, peer) = tokio::io::duplex(64 * 1024);
            tunnel.add_link(1, Box::new(a));
            tunnel.set_rtt(rtt);
            registry.insert(tunnel);
            peers.push((rtt, peer));
        }

        let (input_tx, input_rx) = mpsc::channel(8);
        let (fallback_tx, _fallback_rx) = mpsc::channel(8);
        let stats = Arc::new(PathStats::new());
        let _dup = Duplicater::spawn(
            registry.clone(),
            input_rx,
            fallback_tx,
            stats.clone(),
            &f.shared.config,
            f.shared.shutdown.clone(),
        );

        input_tx.send(datagram(b"payload")).await.unwrap();

        for (rtt, peer) in peers.iter_mut() {
            let got = next_data(peer, Duration::from_millis(300)).await;
            if *rtt == 90 {
                assert!(got.is_none(), "rtt 90 터널은 받지 않아야 함");
            } else {
                assert_eq!(got.as_deref(), Some(&b"payload"[..]));
            }
        }
        assert_eq!(stats.snapshot().sent_copies, 2);
        assert_eq!(stats.snapshot().fallbacks, 0);
    }

    #[tokio::test]
    async fn test_fan_out_bounded_by_tunnel_count() {
        let f = fixture(test_config(5));
        let mut tunnels = Vec::new();
        let mut peers = Vec::new();
        for id in 1..=2 {
            let tunnel = Tunnel::new(id, &f.shared);
            let (a, peer) = tokio::io::duplex(64 * 1024);
            tunnel.add_link(1, Box::new(a));
            tunnels.push(tunnel);
            peers.push(peer);
        }

        let sent = fan_out(datagram(b"x"), &rank(&tunnels), 5, Duration::from_millis(30))
            .await
            .unwrap();
        assert_eq!(sent, 2);
        for peer in peers.iter_mut() {
            assert_eq!(next_data(peer, Duration::from_millis(300)).await, Some(b"x".to_vec()));
        }
    }

    #[tokio::test]
    async fn test_dead_tunnel_skipped_for_next() {
        let f = fixture(test_config(1));
        let dead = Tunnel::new(1, &f.shared);
        let live = Tunnel::new(2, &f.shared);
        let (a, mut peer) = tokio::io::duplex(64 * 1024);
        live.add_link(1, Box::new(a));
        dead.set_rtt(1);
        live.set_rtt(100);

        // 링크 없는 터널이 1순위여도 다음 터널로 넘어간다
        let ranked = rank(&[dead.clone(), live.clone()]);
        assert_eq!(ranked[0].id(), 1);
        let sent = fan_out(datagram(b"y"), &ranked, 1, Duration::from_millis(30))
            .await
            .unwrap();
        assert_eq!(sent, 1);
        assert!(!dead.is_alive());
        assert_eq!(next_data(&mut peer, Duration::from_millis(300)).await, Some(b"y".to_vec()));

        // 이제 비생존 터널은 센티널 RTT로 뒤로 밀린다
        assert_eq!(rank(&[dead, live])[0].id(), 2);
    }

    #[tokio::test]
    async fn test_demoted_tunnel_rejoins_after_ping_reply() {
        use crate::command::{Command, Ping};
        use crate::now_millis;

        let config = Config {
            rerank_interval_ms: 20,
            ..test_config(2)
        };
        let f = fixture(config);
        let codec = f.shared.codec.clone();
        let registry = TunnelRegistry::new();

        let mut peers = Vec::new();
        for (id, rtt) in [(1, 10), (2, 20)] {
            let tunnel = Tunnel::new(id, &f.shared);
            let (a, peer) = tokio::io::duplex(64 * 1024);
            tunnel.add_link(1, Box::new(a));
            tunnel.set_rtt(rtt);
            registry.insert(tunnel);
            peers.push(peer);
        }
        // 한 번의 송신 시간 초과로 강등된 상태
        let demoted = registry.get(2).unwrap();
        demoted.set_alive(false);

        let (input_tx, input_rx) = mpsc::channel(8);
        let (fallback_tx, _fallback_rx) = mpsc::channel(8);
        let stats = Arc::new(PathStats::new());
        let _dup = Duplicater::spawn(
            registry.clone(),
            input_rx,
            fallback_tx,
            stats.clone(),
            &f.shared.config,
            f.shared.shutdown.clone(),
        );

        // 강등된 터널로 ping 에코 도착
        let echo = Ping {
            client_id: 7,
            tunnel_id: 2,
            id: 0,
            step: 2,
            send_time: now_millis() - 20,
        };
        codec
            .write_command(&mut peers[1], &Command::Ping(echo))
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while !demoted.is_alive() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        // 재정렬 주기 대기
        tokio::time::sleep(Duration::from_millis(80)).await;

        input_tx.send(datagram(b"both")).await.unwrap();
        for peer in peers.iter_mut() {
            assert_eq!(next_data(peer, Duration::from_millis(500)).await, Some(b"both".to_vec()));
        }
        assert_eq!(stats.snapshot().sent_copies, 2);
    }

    #[tokio::test]
    async fn test_zero_deliveries_go_to_fallback() {
        let f = fixture(test_config(2));
        let registry = TunnelRegistry::new();
        registry.insert(Tunnel::new(1, &f.shared));

        let (input_tx, input_rx) = mpsc::channel(8);
        let (fallback_tx, mut fallback_rx) = mpsc::channel(8);
        let stats = Arc::new(PathStats::new());
        let _dup = Duplicater::spawn(
            registry,
            input_rx,
            fallback_tx,
            stats.clone(),
            &f.shared.config,
            f.shared.shutdown.clone(),
        );

        input_tx.send(datagram(b"lost?")).await.unwrap();
        let buf = tokio::time::timeout(Duration::from_secs(1), fallback_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(buf.data(), b"lost?");
        assert_eq!(stats.snapshot().fallbacks, 1);
    }

    #[tokio::test]
    async fn test_no_tunnels_returns_original() {
        let buf = datagram(b"z");
        let back = fan_out(buf, &[], 3, Duration::from_millis(1)).await.unwrap_err();
        assert_eq!(back.data(), b"z");
    }

    #[tokio::test]
    async fn test_set_factor() {
        let f = fixture(test_config(2));
        let (_tx, rx) = mpsc::channel(1);
        let (fallback_tx, _fallback_rx) = mpsc::channel(1);
        let dup = Duplicater::spawn(
            TunnelRegistry::new(),
            rx,
            fallback_tx,
            Arc::new(PathStats::new()),
            &f.shared.config,
            f.shared.shutdown.clone(),
        );
        assert_eq!(dup.factor(), 2);
        dup.set_factor(0);
        assert_eq!(dup.factor(), 1);
        dup.set_factor(4);
        assert_eq!(dup.factor(), 4);
    }
}
