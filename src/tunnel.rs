//! 터널 (경로 그룹)
//!
//! 같은 경로(프록시)를 공유하는 물리 링크 묶음. 링크들은 터널 전용 송신 큐를 나눠 소비한다.
//! 터널은 2단계 Ping으로 RTT를 측정하고, Duplicater의 송신 시도로 생존 여부가 갱신된다.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::bus::{CommandBus, Subscription};
use crate::command::{Command, CommandCodec, CommandType, Ping};
use crate::config::Config;
use crate::dialer::BoxedStream;
use crate::link::{shared_receiver, LinkContext, PhysicalLink, SharedReceiver};
use crate::pool::BufItem;
use crate::{now_millis, ClientId, LinkId, TunnelId, UNREACHABLE_RTT_MS};

/// 세션 내 모든 터널이 공유하는 자원
#[derive(Clone)]
pub struct TunnelShared {
    pub client_id: ClientId,

    /// 세션 공용 수신 큐
    pub inbound: mpsc::Sender<BufItem>,

    /// 세션 공용 폴백 송신 큐
    pub fallback: SharedReceiver,

    pub bus: Arc<CommandBus>,
    pub codec: Arc<CommandCodec>,
    pub config: Config,

    /// 세션 종료 토큰
    pub shutdown: CancellationToken,
}

/// 터널
pub struct Tunnel {
    id: TunnelId,
    client_id: ClientId,

    /// 링크 ID → 링크
    links: Mutex<HashMap<LinkId, Arc<PhysicalLink>>>,

    /// 링크 생성용 컨텍스트
    link_ctx: LinkContext,

    /// 터널 전용 송신 큐
    out_tx: mpsc::Sender<BufItem>,

    /// 마지막 측정 RTT (밀리초)
    rtt_ms: AtomicU64,

    /// 마지막 송신 시도 성공 여부 (ping 응답으로도 복귀)
    alive: AtomicBool,

    ping_seq: AtomicU32,
    config: Config,
    shutdown: CancellationToken,
}

impl Tunnel {
    /// 터널 생성 후 RTT 측정 루프 시작
    pub fn new(id: TunnelId, shared: &TunnelShared) -> Arc<Self> {
        let shutdown = shared.shutdown.child_token();
        let (out_tx, out_rx) = mpsc::channel(shared.config.tunnel_queue_size.max(1));

        let link_ctx = LinkContext {
            client_id: shared.client_id,
            tunnel_id: id,
            inbound: shared.inbound.clone(),
            outbound: shared_receiver(out_rx),
            fallback: shared.fallback.clone(),
            bus: shared.bus.clone(),
            codec: shared.codec.clone(),
            close_grace: shared.config.close_grace(),
            command_queue_size: shared.config.command_queue_size,
            shutdown: shutdown.clone(),
        };

        let tunnel = Arc::new(Self {
            id,
            client_id: shared.client_id,
            links: Mutex::new(HashMap::new()),
            link_ctx,
            out_tx,
            rtt_ms: AtomicU64::new(0),
            alive: AtomicBool::new(true),
            ping_seq: AtomicU32::new(0),
            config: shared.config.clone(),
            shutdown,
        });

        let pings = shared.bus.subscribe(&[CommandType::Ping], 16);
        tokio::spawn(tunnel.clone().probe_loop(pings));

        debug!("터널 생성: client {} tunnel {}", tunnel.client_id, id);
        tunnel
    }

    pub fn id(&self) -> TunnelId {
        self.id
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// 연결을 링크로 감싸 등록. 같은 ID의 기존 링크는 먼저 제거하고 닫는다.
    pub fn add_link(self: &Arc<Self>, id: LinkId, stream: BoxedStream) -> Arc<PhysicalLink> {
        let link = PhysicalLink::spawn(id, stream, &self.link_ctx);

        {
            let mut links = self.links.lock();
            if let Some(old) = links.remove(&id) {
                old.close();
            }
            links.insert(id, link.clone());
        }
        self.alive.store(true, Ordering::Release);

        // 링크가 죽으면 맵에서 제거 (교체된 경우 새 링크는 건드리지 않음)
        let tunnel = self.clone();
        let watched = link.clone();
        tokio::spawn(async move {
            watched.closed().await;
            tunnel.detach(&watched);
        });

        info!(
            "링크 추가: client {} tunnel {} link {}",
            self.client_id, self.id, id
        );
        self.send_ping();
        link
    }

    fn detach(&self, link: &Arc<PhysicalLink>) {
        let mut links = self.links.lock();
        if links.get(&link.id()).is_some_and(|cur| Arc::ptr_eq(cur, link)) {
            links.remove(&link.id());
        }
    }

    /// 링크 제거 및 종료
    pub fn remove_link(&self, id: LinkId) -> bool {
        let link = self.links.lock().remove(&id);
        match link {
            Some(link) => {
                link.close();
                true
            }
            None => false,
        }
    }

    /// 모든 링크 제거 (프록시 교체 시)
    pub fn remove_all(&self) {
        let links: Vec<_> = self.links.lock().drain().map(|(_, l)| l).collect();
        for link in links {
            link.close();
        }
    }

    /// 터널 종료
    pub fn close(&self) {
        self.alive.store(false, Ordering::Release);
        self.shutdown.cancel();
        self.remove_all();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn link_count(&self) -> usize {
        self.links.lock().len()
    }

    pub fn link(&self, id: LinkId) -> Option<Arc<PhysicalLink>> {
        self.links.lock().get(&id).cloned()
    }

    /// 첫 번째로 받아주는 링크에 커맨드 전송
    pub fn send_command(&self, command: Command) -> bool {
        let links: Vec<_> = self.links.lock().values().cloned().collect();
        links
            .iter()
            .any(|link| link.try_send_command(command.clone()))
    }

    /// 제한 시간 내 터널 송신 큐에 넣기
    ///
    /// 성공하면 생존, 실패하면 비생존으로 표시하고 버퍼를 돌려준다.
    pub async fn try_send(&self, buf: BufItem, wait: Duration) -> std::result::Result<(), BufItem> {
        if self.is_closed() || self.link_count() == 0 {
            self.alive.store(false, Ordering::Release);
            return Err(buf);
        }

        match self.out_tx.send_timeout(buf, wait).await {
            Ok(()) => {
                self.alive.store(true, Ordering::Release);
                Ok(())
            }
            Err(SendTimeoutError::Timeout(buf)) | Err(SendTimeoutError::Closed(buf)) => {
                self.alive.store(false, Ordering::Release);
                Err(buf)
            }
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// 마지막 측정 RTT (밀리초, 측정 전이면 0)
    pub fn rtt_ms(&self) -> u64 {
        self.rtt_ms.load(Ordering::Relaxed)
    }

    /// 순위 계산용 RTT (비생존이면 센티널)
    pub fn effective_rtt(&self) -> u64 {
        if self.is_alive() {
            self.rtt_ms()
        } else {
            UNREACHABLE_RTT_MS
        }
    }

    #[cfg(test)]
    pub(crate) fn set_rtt(&self, ms: u64) {
        self.rtt_ms.store(ms, Ordering::Relaxed);
    }

    #[cfg(test)]
    pub(crate) fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::Release);
    }

    fn send_ping(&self) {
        let ping = Ping {
            client_id: self.client_id,
            tunnel_id: self.id,
            id: self.ping_seq.fetch_add(1, Ordering::Relaxed),
            step: 1,
            send_time: now_millis(),
        };
        if !self.send_command(Command::Ping(ping)) {
            debug!("tunnel {} ping 전송 실패 (링크 없음)", self.id);
        }
    }

    fn on_ping(&self, ping: Ping) {
        if ping.client_id != self.client_id || ping.tunnel_id != self.id {
            return;
        }

        match ping.step {
            1 => {
                let echo = Ping { step: 2, ..ping };
                self.send_command(Command::Ping(echo));
            }
            2 => {
                let rtt = (now_millis() - ping.send_time).max(0) as u64;
                self.rtt_ms.store(rtt, Ordering::Relaxed);
                // 에코가 돌아왔으면 경로는 살아 있다
                if !self.alive.swap(true, Ordering::AcqRel) {
                    debug!("tunnel {} ping 응답으로 생존 복귀", self.id);
                }
                debug!("tunnel {} rtt {}ms", self.id, rtt);
            }
            other => debug!("tunnel {} 알 수 없는 ping step {}", self.id, other),
        }
    }

    async fn probe_loop(self: Arc<Self>, mut pings: Subscription) {
        let mut next = Instant::now();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep_until(next) => {
                    self.send_ping();
                    next = Instant::now() + self.config.next_ping_interval();
                }
                cmd = pings.recv() => match cmd {
                    Some(Command::Ping(ping)) => self.on_ping(ping),
                    Some(_) => {}
                    None => break,
                },
            }
        }
    }
}

struct RegistryInner {
    tunnels: BTreeMap<TunnelId, Arc<Tunnel>>,
    snapshot: Arc<[Arc<Tunnel>]>,
    version: u64,
}

impl RegistryInner {
    fn publish(&mut self) {
        self.snapshot = self.tunnels.values().cloned().collect();
        self.version += 1;
    }
}

/// 세션별 터널 목록
///
/// 변경될 때마다 버전이 올라가고 불변 스냅샷이 새로 만들어진다.
pub struct TunnelRegistry {
    inner: RwLock<RegistryInner>,
}

impl TunnelRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(RegistryInner {
                tunnels: BTreeMap::new(),
                snapshot: Arc::from(Vec::new()),
                version: 0,
            }),
        })
    }

    /// 등록 (같은 ID의 기존 터널은 닫는다)
    pub fn insert(&self, tunnel: Arc<Tunnel>) {
        let old = {
            let mut inner = self.inner.write();
            let old = inner.tunnels.insert(tunnel.id(), tunnel);
            inner.publish();
            old
        };
        if let Some(old) = old {
            old.close();
        }
    }

    /// 없으면 생성해서 등록
    pub fn get_or_insert_with<F>(&self, id: TunnelId, create: F) -> Arc<Tunnel>
    where
        F: FnOnce() -> Arc<Tunnel>,
    {
        let mut inner = self.inner.write();
        if let Some(tunnel) = inner.tunnels.get(&id) {
            if !tunnel.is_closed() {
                return tunnel.clone();
            }
        }
        let tunnel = create();
        inner.tunnels.insert(id, tunnel.clone());
        inner.publish();
        tunnel
    }

    pub fn get(&self, id: TunnelId) -> Option<Arc<Tunnel>> {
        self.inner.read().tunnels.get(&id).cloned()
    }

    /// 제거 후 닫기
    pub fn remove(&self, id: TunnelId) -> Option<Arc<Tunnel>> {
        let removed = {
            let mut inner = self.inner.write();
            let removed = inner.tunnels.remove(&id);
            if removed.is_some() {
                inner.publish();
            }
            removed
        };
        if let Some(tunnel) = &removed {
            tunnel.close();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.read().tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn version(&self) -> u64 {
        self.inner.read().version
    }

    /// 현재 스냅샷과 버전
    pub fn snapshot(&self) -> (u64, Arc<[Arc<Tunnel>]>) {
        let inner = self.inner.read();
        (inner.version, inner.snapshot.clone())
    }

    /// 버전이 바뀌었을 때만 스냅샷 반환
    pub fn snapshot_if_changed(&self, seen: u64) -> Option<(u64, Arc<[Arc<Tunnel>]>)> {
        let inner = self.inner.read();
        (inner.version != seen).then(|| (inner.version, inner.snapshot.clone()))
    }

    /// 모든 터널에 커맨드 전송. 전송된 터널 수를 반환한다.
    pub fn broadcast(&self, command: &Command) -> usize {
        let (_, tunnels) = self.snapshot();
        tunnels
            .iter()
            .filter(|t| t.send_command(command.clone()))
            .count()
    }

    /// 모든 터널 닫기
    pub fn close_all(&self) {
        let tunnels: Vec<_> = {
            let mut inner = self.inner.write();
            let tunnels = std::mem::take(&mut inner.tunnels);
            inner.publish();
            tunnels.into_values().collect()
        };
        for tunnel in tunnels {
            tunnel.close();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::command::read_frame;
    use crate::pool::Pool;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    pub(crate) struct Fixture {
        pub shared: TunnelShared,
        pub inbound_rx: mpsc::Receiver<BufItem>,
        pub fallback_tx: mpsc::Sender<BufItem>,
    }

    pub(crate) fn fixture(config: Config) -> Fixture {
        let (inbound, inbound_rx) = mpsc::channel(config.inbound_queue_size);
        let (fallback_tx, fallback_rx) = mpsc::channel(config.fallback_queue_size);
        Fixture {
            shared: TunnelShared {
                client_id: 7,
                inbound,
                fallback: shared_receiver(fallback_rx),
                bus: CommandBus::new(),
                codec: Arc::new(CommandCodec::new("k")),
                config,
                shutdown: CancellationToken::new(),
            },
            inbound_rx,
            fallback_tx,
        }
    }

    fn test_config() -> Config {
        Config {
            close_grace_ms: 10,
            ..Config::default()
        }
    }

    /// 피어 쪽에서 다음 커맨드 읽기 (데이터 프레임은 건너뜀)
    async fn next_command(peer: &mut DuplexStream, codec: &CommandCodec) -> Command {
        let pool = Pool::data();
        loop {
            let mut frame = read_frame(peer, &pool, crate::DATA_BUF_SIZE).await.unwrap();
            if crate::command::is_command(frame.data()) {
                return codec.decode_buf(&mut frame).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_add_link_replaces_previous_occupant() {
        let f = fixture(test_config());
        let tunnel = Tunnel::new(1, &f.shared);

        let (a, _pa) = tokio::io::duplex(4096);
        let (b, _pb) = tokio::io::duplex(4096);
        let first = tunnel.add_link(5, Box::new(a));
        let second = tunnel.add_link(5, Box::new(b));

        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert_eq!(tunnel.link_count(), 1);
        assert!(Arc::ptr_eq(&tunnel.link(5).unwrap(), &second));

        // 닫힌 이전 링크의 정리 작업이 새 링크를 지우면 안 됨
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(tunnel.link_count(), 1);
    }

    #[tokio::test]
    async fn test_dead_link_is_detached() {
        let f = fixture(test_config());
        let tunnel = Tunnel::new(1, &f.shared);
        let (a, pa) = tokio::io::duplex(4096);
        let link = tunnel.add_link(1, Box::new(a));
        drop(pa);

        tokio::time::timeout(Duration::from_secs(2), link.closed())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(tunnel.link_count(), 0);
    }

    #[tokio::test]
    async fn test_try_send_without_links_marks_dead() {
        let f = fixture(test_config());
        let tunnel = Tunnel::new(1, &f.shared);
        assert!(tunnel.is_alive());

        let buf = Pool::data().get();
        assert!(tunnel.try_send(buf, Duration::from_millis(5)).await.is_err());
        assert!(!tunnel.is_alive());
        assert_eq!(tunnel.effective_rtt(), UNREACHABLE_RTT_MS);
    }

    #[tokio::test]
    async fn test_try_send_timeout_clears_alive() {
        let config = Config {
            tunnel_queue_size: 1,
            ..test_config()
        };
        let f = fixture(config);
        let tunnel = Tunnel::new(1, &f.shared);

        // 피어가 읽지 않는 작은 버퍼: 링크 송신이 막힌다
        let (a, _pa) = tokio::io::duplex(64);
        tunnel.add_link(1, Box::new(a));

        let mut failed = None;
        for _ in 0..6 {
            let mut buf = Pool::data().get();
            buf.append(&[1u8; 512]).unwrap();
            if let Err(buf) = tunnel.try_send(buf, Duration::from_millis(20)).await {
                failed = Some(buf);
                break;
            }
        }

        let returned = failed.expect("큐가 막혀야 함");
        assert_eq!(returned.size(), 512);
        assert!(!tunnel.is_alive());
    }

    #[tokio::test]
    async fn test_ping_echo_and_rtt() {
        let f = fixture(test_config());
        let codec = f.shared.codec.clone();
        let tunnel = Tunnel::new(3, &f.shared);
        let (a, mut peer) = tokio::io::duplex(64 * 1024);
        tunnel.add_link(1, Box::new(a));

        // 피어의 step 1 → step 2 에코
        let probe = Ping {
            client_id: 7,
            tunnel_id: 3,
            id: 99,
            step: 1,
            send_time: 1234,
        };
        codec
            .write_command(&mut peer, &Command::Ping(probe.clone()))
            .await
            .unwrap();
        loop {
            if let Command::Ping(p) = next_command(&mut peer, &codec).await {
                if p.step == 2 {
                    assert_eq!(p, Ping { step: 2, ..probe.clone() });
                    break;
                }
            }
        }

        // 다른 터널 ID는 무시, 일치하는 step 2는 RTT 갱신
        let foreign = Ping {
            client_id: 7,
            tunnel_id: 4,
            id: 1,
            step: 2,
            send_time: now_millis() - 500,
        };
        let own = Ping {
            tunnel_id: 3,
            send_time: now_millis() - 40,
            ..foreign.clone()
        };
        codec.write_command(&mut peer, &Command::Ping(foreign)).await.unwrap();
        codec.write_command(&mut peer, &Command::Ping(own)).await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while tunnel.rtt_ms() == 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let rtt = tunnel.rtt_ms();
        assert!((40..500).contains(&rtt), "rtt {rtt}");
    }

    #[tokio::test]
    async fn test_ping_reply_restores_alive() {
        let config = Config {
            tunnel_queue_size: 1,
            ..test_config()
        };
        let f = fixture(config);
        let codec = f.shared.codec.clone();
        let tunnel = Tunnel::new(2, &f.shared);
        let (a, mut peer) = tokio::io::duplex(64);
        tunnel.add_link(1, Box::new(a));

        // 송신이 막혀 한 번 비생존으로 강등
        for _ in 0..6 {
            let mut buf = Pool::data().get();
            buf.append(&[1u8; 512]).unwrap();
            if tunnel.try_send(buf, Duration::from_millis(20)).await.is_err() {
                break;
            }
        }
        assert!(!tunnel.is_alive());
        assert_eq!(tunnel.effective_rtt(), UNREACHABLE_RTT_MS);

        // 수신 방향은 정상: 돌아온 ping 에코가 생존을 되살린다
        let echo = Ping {
            client_id: 7,
            tunnel_id: 2,
            id: 0,
            step: 2,
            send_time: now_millis() - 15,
        };
        codec.write_command(&mut peer, &Command::Ping(echo)).await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while !tunnel.is_alive() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(tunnel.is_alive());
        assert!(tunnel.effective_rtt() < UNREACHABLE_RTT_MS);
    }

    #[tokio::test]
    async fn test_close_closes_links() {
        let f = fixture(test_config());
        let tunnel = Tunnel::new(1, &f.shared);
        let (a, mut pa) = tokio::io::duplex(4096);
        let link = tunnel.add_link(1, Box::new(a));

        tunnel.close();
        assert!(link.is_closed());
        assert!(tunnel.is_closed());
        assert_eq!(tunnel.link_count(), 0);

        let mut rest = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), pa.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        let _ = pa.shutdown().await;
    }

    #[tokio::test]
    async fn test_registry_snapshot_versioning() {
        let f = fixture(test_config());
        let registry = TunnelRegistry::new();
        let (v0, snap) = registry.snapshot();
        assert!(snap.is_empty());
        assert!(registry.snapshot_if_changed(v0).is_none());

        let t1 = registry.get_or_insert_with(1, || Tunnel::new(1, &f.shared));
        let again = registry.get_or_insert_with(1, || Tunnel::new(1, &f.shared));
        assert!(Arc::ptr_eq(&t1, &again));

        let (v1, snap) = registry.snapshot_if_changed(v0).unwrap();
        assert_eq!(snap.len(), 1);
        assert!(registry.snapshot_if_changed(v1).is_none());

        registry.insert(Tunnel::new(2, &f.shared));
        let (v2, snap) = registry.snapshot_if_changed(v1).unwrap();
        assert_eq!(snap.len(), 2);

        registry.remove(1);
        assert!(t1.is_closed());
        let (_, snap) = registry.snapshot_if_changed(v2).unwrap();
        assert_eq!(snap.iter().map(|t| t.id()).collect::<Vec<_>>(), vec![2]);
    }
}
