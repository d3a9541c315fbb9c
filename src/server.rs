//! 서버 수신기
//!
//! 새 업스트림 연결은 프리앰블 다음 첫 커맨드로 용도가 정해진다.
//!
//! - `Idle`: 아무 것도 하지 않고 닫음
//! - `TestPing`: 두 번 에코 (클라이언트의 프록시 지연 측정)
//! - `Login`: 자격 확인 후 세션 생성, 연결 키 발급
//! - `Handshake`: 기존 세션의 터널에 링크로 편입
//!
//! 로그인된 세션마다 [`Transport`]가 하나씩 있고, 새 세션은 어댑터와 함께 채널로 전달된다.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::RngCore;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::CommandBus;
use crate::command::{
    read_u32, Command, CommandCodec, CommandType, Handshake, HandshakeCode, HandshakeReply, Login, LoginCode,
    LoginReply,
};
use crate::config::{Config, ServerConfig, UserEntry};
use crate::datagram::ReliableStreamAdapter;
use crate::dialer::BoxedStream;
use crate::link::PhysicalLink;
use crate::stats::PathStats;
use crate::transport::Transport;
use crate::{command, ClientId, Error, LinkId, Result, TunnelId, NEW_CONNECTION_KEY};

/// 사용자 자격 확인
pub trait CredentialStore: Send + Sync + 'static {
    /// `password_hash`는 [`command::hash_password`] 결과
    fn check_password(&self, user_name: &str, password_hash: &str) -> bool;

    fn check_auth_code(&self, _user_name: &str, _auth_code: u32) -> bool {
        true
    }
}

/// 설정 파일의 사용자 목록
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    /// 사용자 이름 → 비밀번호 해시
    users: HashMap<String, String>,
}

impl StaticCredentials {
    pub fn new(users: &[UserEntry]) -> Self {
        Self {
            users: users
                .iter()
                .map(|u| (u.username.clone(), command::hash_password(&u.username, &u.password)))
                .collect(),
        }
    }
}

impl CredentialStore for StaticCredentials {
    fn check_password(&self, user_name: &str, password_hash: &str) -> bool {
        self.users.get(user_name).is_some_and(|h| h == password_hash)
    }
}

/// 연결 키: hex(md5(uuid || 랜덤 16바이트))
fn new_connect_key(uuid: &str) -> String {
    let mut salt = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt);
    let mut k = Vec::with_capacity(uuid.len() + salt.len());
    k.extend_from_slice(uuid.as_bytes());
    k.extend_from_slice(&salt);
    format!("{:x}", md5::compute(k))
}

/// 프리앰블 확인 후 첫 커맨드 읽기
async fn read_first(codec: &CommandCodec, stream: &mut BoxedStream) -> Result<Command> {
    let preamble = read_u32(stream).await?;
    if preamble != NEW_CONNECTION_KEY {
        return Err(Error::Protocol(format!("잘못된 프리앰블: {preamble:08X}")));
    }
    codec.read_command(stream).await
}

/// 로그인된 클라이언트 세션 (서버 쪽)
pub struct ServerSession {
    uuid: String,
    user_name: String,
    client_id: ClientId,
    connect_key: String,
    compress: bool,
    transport: Transport,
}

impl ServerSession {
    fn spawn(login: &Login, client_id: ClientId, transport: Transport) -> Arc<Self> {
        let session = Arc::new(Self {
            uuid: login.client_uuid.clone(),
            user_name: login.user_name.clone(),
            client_id,
            connect_key: new_connect_key(&login.client_uuid),
            compress: login.compress,
            transport,
        });

        // 클라이언트의 Logout 알림이 오면 세션 종료
        let mut logout = session.transport.bus().subscribe(&[CommandType::Logout], 4);
        let weak = Arc::downgrade(&session);
        let shutdown = session.transport.shutdown_token().clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    command = logout.recv() => {
                        let Some(Command::Logout(notice)) = command else { break };
                        let Some(session) = weak.upgrade() else { break };
                        if notice.client_uuid == session.uuid {
                            info!("client {} 로그아웃", session.client_id);
                            session.close();
                            break;
                        }
                    }
                }
            }
        });
        session
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn connect_key(&self) -> &str {
        &self.connect_key
    }

    pub fn compress(&self) -> bool {
        self.compress
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn stats(&self) -> &Arc<PathStats> {
        self.transport.stats()
    }

    /// 핸드쉐이크를 마친 연결을 터널에 편입
    pub fn attach(&self, tunnel_id: TunnelId, link_id: LinkId, stream: BoxedStream) -> Arc<PhysicalLink> {
        self.transport.tunnel(tunnel_id).add_link(link_id, stream)
    }

    pub fn is_closed(&self) -> bool {
        self.transport.is_closed()
    }

    pub async fn closed(&self) {
        self.transport.closed().await
    }

    pub fn close(&self) {
        if !self.transport.is_closed() {
            info!("client {} 세션 종료: {}", self.client_id, self.transport.stats().summary());
        }
        self.transport.close();
    }
}

/// 새로 로그인한 세션과 그 데이터 어댑터
pub struct NewSession {
    pub session: Arc<ServerSession>,
    pub adapter: ReliableStreamAdapter,
}

#[derive(Default)]
struct SessionTable {
    by_uuid: HashMap<String, Arc<ServerSession>>,
    /// 사용자 이름 → uuid
    by_user: HashMap<String, String>,
}

/// 업스트림 연결 수신기
pub struct Acceptor {
    key: String,
    ping_url: String,
    config: Config,
    codec: Arc<CommandCodec>,
    credentials: Arc<dyn CredentialStore>,
    sessions: Mutex<SessionTable>,
    next_client_id: AtomicU32,
    new_sessions: mpsc::Sender<NewSession>,
    shutdown: CancellationToken,
}

impl Acceptor {
    pub fn new(
        config: &ServerConfig,
        credentials: Arc<dyn CredentialStore>,
        parent: &CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<NewSession>) {
        let (tx, rx) = mpsc::channel(config.transport.command_queue_size.max(1));
        let codec = CommandCodec::new(&config.key).with_max_len(config.transport.max_command_len);
        let acceptor = Arc::new(Self {
            key: config.key.clone(),
            ping_url: config.ping_url.clone(),
            config: config.transport.clone(),
            codec: Arc::new(codec),
            credentials,
            sessions: Mutex::new(SessionTable::default()),
            next_client_id: AtomicU32::new(1),
            new_sessions: tx,
            shutdown: parent.child_token(),
        });
        (acceptor, rx)
    }

    /// 리스너에서 연결을 받아 처리 (종료될 때까지)
    pub async fn serve(self: &Arc<Self>, listener: TcpListener) -> Result<()> {
        info!("서버 수신 대기: {}", listener.local_addr()?);
        loop {
            let (stream, peer) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted?,
            };
            stream.set_nodelay(true)?;

            let acceptor = self.clone();
            tokio::spawn(async move {
                if let Err(e) = acceptor.handle_connection(Box::new(stream)).await {
                    debug!("{} 연결 처리 실패: {}", peer, e);
                }
            });
        }
        Ok(())
    }

    pub fn session(&self, uuid: &str) -> Option<Arc<ServerSession>> {
        self.sessions.lock().by_uuid.get(uuid).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().by_uuid.len()
    }

    /// 모든 세션과 수신 종료
    pub fn close(&self) {
        self.shutdown.cancel();
        let sessions: Vec<_> = self.sessions.lock().by_uuid.drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.close();
        }
    }

    /// 새 연결 하나 처리
    ///
    /// 에러를 반환하면 응답 없이 연결을 닫은 것이다.
    pub async fn handle_connection(self: &Arc<Self>, mut stream: BoxedStream) -> Result<()> {
        let timeout = self.config.handshake_timeout();
        let first = tokio::time::timeout(timeout, read_first(&self.codec, &mut stream))
            .await
            .map_err(|_| Error::Timeout("first command"))??;

        match first {
            Command::Idle => Ok(()),
            Command::TestPing(ping) => {
                // 두 번 에코
                self.codec
                    .write_command(&mut stream, &Command::TestPing(ping))
                    .await?;
                let again = tokio::time::timeout(
                    timeout,
                    self.codec.expect_command(&mut stream, CommandType::TestPing),
                )
                .await
                .map_err(|_| Error::Timeout("test ping"))??;
                self.codec.write_command(&mut stream, &again).await
            }
            Command::Login(login) => self.on_login(stream, login).await,
            Command::Handshake(handshake) => self.on_handshake(stream, handshake).await,
            other => Err(Error::Protocol(format!(
                "새 연결의 첫 커맨드로 올 수 없음: {:?}",
                other.command_type()
            ))),
        }
    }

    async fn on_login(self: &Arc<Self>, mut stream: BoxedStream, login: Login) -> Result<()> {
        if login.key != self.key {
            warn!("로그인 키 불일치: {}", login.user_name);
            return Err(Error::InvalidKey);
        }
        let code = if !self.credentials.check_auth_code(&login.user_name, login.auth_code) {
            LoginCode::ErrAuthCode
        } else if !self.credentials.check_password(&login.user_name, &login.password) {
            LoginCode::ErrAuthority
        } else {
            LoginCode::Success
        };
        if code != LoginCode::Success {
            warn!("로그인 거부: {} ({:?})", login.user_name, code);
            let reply = LoginReply {
                client_uuid: login.client_uuid,
                client_id: 0,
                connect_key: String::new(),
                code,
                ping_url: String::new(),
            };
            return self
                .codec
                .write_command(&mut stream, &Command::LoginReply(reply))
                .await;
        }
        if self.session(&login.client_uuid).is_some() {
            return Err(Error::Protocol(format!("이미 로그인된 uuid: {}", login.client_uuid)));
        }

        let client_id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let (transport, adapter) = Transport::new(
            client_id,
            CommandBus::new(),
            self.codec.clone(),
            &self.config,
            &self.shutdown,
        );
        let session = ServerSession::spawn(&login, client_id, transport);

        let replaced = {
            let mut table = self.sessions.lock();
            let old = table
                .by_user
                .insert(login.user_name.clone(), session.uuid.clone())
                .and_then(|uuid| table.by_uuid.remove(&uuid));
            table.by_uuid.insert(session.uuid.clone(), session.clone());
            old
        };
        if let Some(old) = replaced {
            info!("{} 재로그인, 이전 client {} 종료", login.user_name, old.client_id);
            old.close();
        }
        self.watch_session(&session);

        let reply = LoginReply {
            client_uuid: session.uuid.clone(),
            client_id,
            connect_key: session.connect_key.clone(),
            code: LoginCode::Success,
            ping_url: self.ping_url.clone(),
        };
        self.codec
            .write_command(&mut stream, &Command::LoginReply(reply))
            .await?;
        info!("로그인: {} → client {}", session.user_name, client_id);

        let new = NewSession {
            session: session.clone(),
            adapter,
        };
        if self.new_sessions.send(new).await.is_err() {
            session.close();
            return Err(Error::ChannelError);
        }
        Ok(())
    }

    async fn on_handshake(self: &Arc<Self>, mut stream: BoxedStream, handshake: Handshake) -> Result<()> {
        let Some(session) = self.session(&handshake.client_uuid) else {
            debug!("알 수 없는 uuid 핸드쉐이크: {}", handshake.client_uuid);
            let reply = HandshakeReply {
                client_uuid: handshake.client_uuid,
                code: HandshakeCode::NeedLogin,
            };
            return self
                .codec
                .write_command(&mut stream, &Command::HandshakeReply(reply))
                .await;
        };

        if handshake.key != self.key
            || handshake.connect_key != session.connect_key
            || handshake.client_id != session.client_id
        {
            warn!("client {} 핸드쉐이크 키 불일치", session.client_id);
            return Err(Error::InvalidKey);
        }

        let reply = HandshakeReply {
            client_uuid: handshake.client_uuid,
            code: HandshakeCode::Success,
        };
        self.codec
            .write_command(&mut stream, &Command::HandshakeReply(reply))
            .await?;
        session.attach(handshake.tunnel_id, handshake.conn_id, stream);
        Ok(())
    }

    /// 세션이 닫히면 테이블에서 제거
    fn watch_session(self: &Arc<Self>, session: &Arc<ServerSession>) {
        let acceptor = Arc::downgrade(self);
        let session = session.clone();
        tokio::spawn(async move {
            session.closed().await;
            if let Some(acceptor) = acceptor.upgrade() {
                acceptor.forget(&session);
            }
        });
    }

    fn forget(&self, session: &Arc<ServerSession>) {
        let mut table = self.sessions.lock();
        if table
            .by_uuid
            .get(&session.uuid)
            .is_some_and(|s| Arc::ptr_eq(s, session))
        {
            table.by_uuid.remove(&session.uuid);
        }
        if table.by_user.get(&session.user_name) == Some(&session.uuid) {
            table.by_user.remove(&session.user_name);
        }
    }
}
