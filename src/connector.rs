//! 링크 수명 관리
//!
//! 링크 슬롯 하나를 계속 채워 두는 상태 머신:
//!
//! ```text
//! Connecting → Handshaking → Attached → (링크 종료) → Backoff → Connecting
//!                  └ NeedLogin 응답 → NeedsLogin (종료, 재시도 없음)
//! ```
//!
//! 동시에 진행 중인 연결 시도는 항상 하나 이하다.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::command::{write_u32, Command, CommandCodec, CommandType, Handshake, HandshakeCode};
use crate::config::Config;
use crate::dialer::Dialer;
use crate::tunnel::Tunnel;
use crate::{ClientId, Error, LinkId, Result, TunnelId, NEW_CONNECTION_KEY};

/// 링크 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Handshaking,
    Attached,
    Backoff,
    /// 서버가 세션을 모름 (재로그인 필요)
    NeedsLogin,
    Stopped,
}

impl LinkState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LinkState::NeedsLogin | LinkState::Stopped)
    }
}

/// 로그인으로 받은 핸드쉐이크 자격 정보
#[derive(Debug, Clone)]
pub struct LinkCredentials {
    pub client_uuid: String,
    pub client_id: ClientId,
    pub connect_key: String,
    pub key: String,
}

/// 핸드쉐이크 수행 (프리앰블 + Handshake → HandshakeReply)
pub async fn handshake<S>(
    stream: &mut S,
    codec: &CommandCodec,
    creds: &LinkCredentials,
    tunnel_id: TunnelId,
    link_id: LinkId,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_u32(stream, NEW_CONNECTION_KEY).await?;

    let request = Handshake {
        client_uuid: creds.client_uuid.clone(),
        client_id: creds.client_id,
        tunnel_id,
        conn_id: link_id,
        connect_key: creds.connect_key.clone(),
        key: creds.key.clone(),
    };
    codec
        .write_command(stream, &Command::Handshake(request))
        .await?;

    match codec
        .expect_command(stream, CommandType::HandshakeReply)
        .await?
    {
        Command::HandshakeReply(reply) => match reply.code {
            HandshakeCode::Success => Ok(()),
            HandshakeCode::NeedLogin => Err(Error::NeedLogin),
        },
        _ => Err(Error::Protocol("HandshakeReply 아님".into())),
    }
}

/// 링크 관리자 핸들
pub struct LinkManager {
    tunnel_id: TunnelId,
    link_id: LinkId,
    state: watch::Receiver<LinkState>,
    shutdown: CancellationToken,
}

impl LinkManager {
    /// 관리 루프 시작
    pub fn spawn<D: Dialer>(
        link_id: LinkId,
        dialer: Arc<D>,
        tunnel: Arc<Tunnel>,
        creds: Arc<LinkCredentials>,
        codec: Arc<CommandCodec>,
        config: &Config,
        parent: &CancellationToken,
    ) -> Self {
        let (state_tx, state) = watch::channel(LinkState::Connecting);
        let shutdown = parent.child_token();

        let worker = Worker {
            tunnel_id: tunnel.id(),
            link_id,
            dialer,
            tunnel,
            creds,
            codec,
            connect_timeout: config.connect_timeout(),
            handshake_timeout: config.handshake_timeout(),
            backoff: config.reconnect_backoff(),
            state_tx,
            shutdown: shutdown.clone(),
        };
        let tunnel_id = worker.tunnel_id;
        tokio::spawn(worker.run());

        Self {
            tunnel_id,
            link_id,
            state,
            shutdown,
        }
    }

    pub fn tunnel_id(&self) -> TunnelId {
        self.tunnel_id
    }

    pub fn link_id(&self) -> LinkId {
        self.link_id
    }

    /// 현재 상태
    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// 상태 변화 구독
    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.state.clone()
    }

    /// 관리 중지 (현재 링크도 닫힌다)
    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for LinkManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct Worker<D> {
    tunnel_id: TunnelId,
    link_id: LinkId,
    dialer: Arc<D>,
    tunnel: Arc<Tunnel>,
    creds: Arc<LinkCredentials>,
    codec: Arc<CommandCodec>,
    connect_timeout: Duration,
    handshake_timeout: Duration,
    backoff: Duration,
    state_tx: watch::Sender<LinkState>,
    shutdown: CancellationToken,
}

impl<D: Dialer> Worker<D> {
    fn set_state(&self, state: LinkState) {
        let prev = self.state_tx.send_replace(state);
        if prev != state {
            info!(
                "tunnel {} link {}: {:?} → {:?}",
                self.tunnel_id, self.link_id, prev, state
            );
        }
    }

    /// 대기 (중지되면 false)
    async fn wait_backoff(&self) -> bool {
        self.set_state(LinkState::Backoff);
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(self.backoff) => true,
        }
    }

    async fn run(self) {
        while !self.shutdown.is_cancelled() {
            self.set_state(LinkState::Connecting);
            let connected = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                r = tokio::time::timeout(self.connect_timeout, self.dialer.connect()) => {
                    r.unwrap_or(Err(Error::Timeout("connect")))
                }
            };
            let mut stream = match connected {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(
                        "tunnel {} link {} {} 연결 실패: {}",
                        self.tunnel_id,
                        self.link_id,
                        self.dialer.name(),
                        e
                    );
                    if self.wait_backoff().await {
                        continue;
                    }
                    break;
                }
            };

            self.set_state(LinkState::Handshaking);
            let shaken = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                r = tokio::time::timeout(
                    self.handshake_timeout,
                    handshake(&mut stream, &self.codec, &self.creds, self.tunnel_id, self.link_id),
                ) => r.unwrap_or(Err(Error::Timeout("handshake"))),
            };
            match shaken {
                Ok(()) => {}
                Err(Error::NeedLogin) => {
                    warn!(
                        "tunnel {} link {} 핸드쉐이크 거부: 로그인 필요",
                        self.tunnel_id, self.link_id
                    );
                    self.set_state(LinkState::NeedsLogin);
                    return;
                }
                Err(e) => {
                    warn!(
                        "tunnel {} link {} 핸드쉐이크 실패: {}",
                        self.tunnel_id, self.link_id, e
                    );
                    if self.wait_backoff().await {
                        continue;
                    }
                    break;
                }
            }

            let link = self.tunnel.add_link(self.link_id, stream);
            self.set_state(LinkState::Attached);
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    link.close();
                    break;
                }
                _ = link.closed() => {}
            }

            if !self.wait_backoff().await {
                break;
            }
        }
        self.set_state(LinkState::Stopped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::HandshakeReply;
    use crate::dialer::BoxedStream;
    use crate::tunnel::tests::fixture;
    use std::future::Future;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, DuplexStream};
    use tokio::sync::mpsc;

    /// 연결마다 duplex 쌍을 만들고 서버 쪽 끝을 채널로 넘기는 다이얼러
    struct ScriptDialer {
        servers: mpsc::UnboundedSender<DuplexStream>,
        attempts: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        fail_odd: bool,
    }

    impl ScriptDialer {
        fn new(fail_odd: bool) -> (Arc<Self>, mpsc::UnboundedReceiver<DuplexStream>) {
            let (servers, rx) = mpsc::unbounded_channel();
            let dialer = Arc::new(Self {
                servers,
                attempts: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                fail_odd,
            });
            (dialer, rx)
        }
    }

    impl Dialer for ScriptDialer {
        fn connect(&self) -> impl Future<Output = Result<BoxedStream>> + Send {
            async move {
                let n = self.attempts.fetch_add(1, Ordering::SeqCst);
                let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_in_flight.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                self.in_flight.fetch_sub(1, Ordering::SeqCst);

                if self.fail_odd && n % 2 == 1 {
                    return Err(Error::Io(std::io::ErrorKind::ConnectionRefused.into()));
                }
                let (client, server) = tokio::io::duplex(64 * 1024);
                self.servers
                    .send(server)
                    .map_err(|_| Error::ConnectionClosed)?;
                Ok(Box::new(client) as BoxedStream)
            }
        }

        fn name(&self) -> String {
            "script".into()
        }
    }

    /// 핸드쉐이크에 `code`로 응답하고 `hold` 후 연결을 끊는 가짜 서버
    fn fake_server(
        mut servers: mpsc::UnboundedReceiver<DuplexStream>,
        codec: Arc<CommandCodec>,
        code: HandshakeCode,
        hold: Duration,
    ) -> Arc<AtomicUsize> {
        let served = Arc::new(AtomicUsize::new(0));
        let counter = served.clone();
        tokio::spawn(async move {
            while let Some(mut conn) = servers.recv().await {
                assert_eq!(conn.read_u32().await.unwrap(), NEW_CONNECTION_KEY);
                let cmd = codec
                    .expect_command(&mut conn, CommandType::Handshake)
                    .await
                    .unwrap();
                let Command::Handshake(hs) = cmd else { unreachable!() };
                let reply = HandshakeReply {
                    client_uuid: hs.client_uuid,
                    code,
                };
                codec
                    .write_command(&mut conn, &Command::HandshakeReply(reply))
                    .await
                    .unwrap();
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    tokio::time::sleep(hold).await;
                    drop(conn);
                });
            }
        });
        served
    }

    fn test_config() -> Config {
        Config {
            reconnect_backoff_ms: 10,
            connect_timeout_ms: 200,
            handshake_timeout_ms: 100,
            close_grace_ms: 10,
            ..Config::default()
        }
    }

    fn creds() -> Arc<LinkCredentials> {
        Arc::new(LinkCredentials {
            client_uuid: "uuid".into(),
            client_id: 7,
            connect_key: "ck".into(),
            key: "k".into(),
        })
    }

    #[tokio::test]
    async fn test_need_login_is_terminal() {
        let f = fixture(test_config());
        let tunnel = Tunnel::new(1, &f.shared);
        let (dialer, servers) = ScriptDialer::new(false);
        fake_server(servers, f.shared.codec.clone(), HandshakeCode::NeedLogin, Duration::ZERO);

        let mgr = LinkManager::spawn(
            1,
            dialer.clone(),
            tunnel.clone(),
            creds(),
            f.shared.codec.clone(),
            &f.shared.config,
            &f.shared.shutdown,
        );

        let mut state = mgr.subscribe();
        tokio::time::timeout(
            Duration::from_secs(2),
            state.wait_for(|s| *s == LinkState::NeedsLogin),
        )
        .await
        .unwrap()
        .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(dialer.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(mgr.state(), LinkState::NeedsLogin);
        assert_eq!(tunnel.link_count(), 0);
    }

    #[tokio::test]
    async fn test_reconnects_after_failures_and_link_death() {
        let f = fixture(test_config());
        let tunnel = Tunnel::new(1, &f.shared);
        let (dialer, servers) = ScriptDialer::new(true);
        let served = fake_server(
            servers,
            f.shared.codec.clone(),
            HandshakeCode::Success,
            Duration::from_millis(30),
        );

        let mgr = LinkManager::spawn(
            2,
            dialer.clone(),
            tunnel,
            creds(),
            f.shared.codec.clone(),
            &f.shared.config,
            &f.shared.shutdown,
        );

        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while served.load(Ordering::SeqCst) < 3 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(served.load(Ordering::SeqCst) >= 3);
        assert!(dialer.attempts.load(Ordering::SeqCst) >= 5);
        assert_eq!(dialer.max_in_flight.load(Ordering::SeqCst), 1);
        assert!(!mgr.state().is_terminal());
    }

    #[tokio::test]
    async fn test_handshake_timeout_backs_off() {
        let f = fixture(test_config());
        let tunnel = Tunnel::new(1, &f.shared);
        let (dialer, mut servers) = ScriptDialer::new(false);

        // 응답하지 않는 서버 (연결만 유지)
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Some(conn) = servers.recv().await {
                held.push(conn);
            }
        });

        let _mgr = LinkManager::spawn(
            1,
            dialer.clone(),
            tunnel.clone(),
            creds(),
            f.shared.codec.clone(),
            &f.shared.config,
            &f.shared.shutdown,
        );

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(dialer.attempts.load(Ordering::SeqCst) >= 2);
        assert_eq!(tunnel.link_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_closes_attached_link() {
        let f = fixture(test_config());
        let tunnel = Tunnel::new(1, &f.shared);
        let (dialer, servers) = ScriptDialer::new(false);
        fake_server(
            servers,
            f.shared.codec.clone(),
            HandshakeCode::Success,
            Duration::from_secs(60),
        );

        let mgr = LinkManager::spawn(
            4,
            dialer,
            tunnel.clone(),
            creds(),
            f.shared.codec.clone(),
            &f.shared.config,
            &f.shared.shutdown,
        );
        let mut state = mgr.subscribe();
        tokio::time::timeout(
            Duration::from_secs(2),
            state.wait_for(|s| *s == LinkState::Attached),
        )
        .await
        .unwrap()
        .unwrap();
        let link = tunnel.link(4).unwrap();

        mgr.stop();
        tokio::time::timeout(
            Duration::from_secs(2),
            state.wait_for(|s| *s == LinkState::Stopped),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(link.is_closed());
    }
}
