//! 클라이언트 세션
//!
//! 1. 프록시 지연 측정 후 사용할 프록시 선택
//! 2. 프록시를 차례로 시도하며 로그인
//! 3. 선택된 프록시마다 경로 그룹 (터널 1개 + 링크 관리자 `conn_num`개) 생성
//! 4. 링크가 하나라도 붙으면 Running
//!
//! 진행 상황은 `watch` 채널로 공개된다.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::CommandBus;
use crate::command::{write_u32, hash_password, Command, CommandCodec, CommandType, Login, LoginCode, LoginReply, Logout};
use crate::config::{ClientConfig, ProxyInfo};
use crate::connector::{LinkCredentials, LinkManager, LinkState};
use crate::datagram::ReliableStreamAdapter;
use crate::dialer::{test_ping, Dialer, UpstreamDialer};
use crate::transport::{best_rtt, Transport};
use crate::{Error, Result, TunnelId, NEW_CONNECTION_KEY, UNREACHABLE_RTT_MS};

/// 진행 단계
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusStep {
    Initializing,
    AcquiringPaths,
    LoggingIn,
    ConnectingUpstream,
    CheckingConnection,
    Running,
    Failed,
}

/// 세션 상태
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientStatus {
    pub step: StatusStep,

    /// 생존 터널 중 최소 RTT (밀리초)
    pub best_rtt_ms: u64,

    /// 실패 사유
    pub error: Option<String>,
}

impl Default for ClientStatus {
    fn default() -> Self {
        Self {
            step: StatusStep::Initializing,
            best_rtt_ms: UNREACHABLE_RTT_MS,
            error: None,
        }
    }
}

/// 사용하지 않는 프록시 보관소
#[derive(Debug, Default)]
pub struct ProxyPool {
    spare: Mutex<VecDeque<ProxyInfo>>,
}

impl ProxyPool {
    pub fn new(proxies: impl IntoIterator<Item = ProxyInfo>) -> Self {
        Self {
            spare: Mutex::new(proxies.into_iter().collect()),
        }
    }

    /// 다음 프록시 꺼내기
    pub fn get(&self) -> Option<ProxyInfo> {
        self.spare.lock().pop_front()
    }

    /// 프록시 반납 (맨 뒤로)
    pub fn put(&self, proxy: ProxyInfo) {
        self.spare.lock().push_back(proxy);
    }

    pub fn len(&self) -> usize {
        self.spare.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 로그인 요청 한 번 (새 연결에서 Login → LoginReply)
pub async fn login<D: Dialer>(dialer: &D, codec: &CommandCodec, request: &Login, timeout: Duration) -> Result<LoginReply> {
    let reply = tokio::time::timeout(timeout, login_exchange(dialer, codec, request))
        .await
        .map_err(|_| Error::Timeout("login"))??;
    match reply.code {
        LoginCode::Success => Ok(reply),
        code => Err(Error::LoginRejected(code)),
    }
}

async fn login_exchange<D: Dialer>(dialer: &D, codec: &CommandCodec, request: &Login) -> Result<LoginReply> {
    let mut stream = dialer.connect().await?;
    write_u32(&mut stream, NEW_CONNECTION_KEY).await?;
    codec
        .write_command(&mut stream, &Command::Login(request.clone()))
        .await?;
    match codec
        .expect_command(&mut stream, CommandType::LoginReply)
        .await?
    {
        Command::LoginReply(reply) => Ok(reply),
        _ => Err(Error::Protocol("LoginReply 아님".into())),
    }
}

/// 프록시 하나에 대한 경로 그룹
struct PathGroup {
    tunnel_id: TunnelId,
    proxy: ProxyInfo,
    managers: Vec<LinkManager>,
}

struct Running {
    transport: Transport,
    creds: Arc<LinkCredentials>,
    groups: Vec<PathGroup>,
    pool: ProxyPool,
}

/// 클라이언트 세션
pub struct ClientSession {
    config: ClientConfig,
    uuid: String,
    codec: Arc<CommandCodec>,
    status_tx: watch::Sender<ClientStatus>,
    running: Mutex<Option<Running>>,
    shutdown: CancellationToken,
}

impl ClientSession {
    pub fn new(config: ClientConfig) -> Self {
        let codec = Arc::new(CommandCodec::new(&config.key).with_max_len(config.transport.max_command_len));
        let (status_tx, _) = watch::channel(ClientStatus::default());
        Self {
            config,
            uuid: uuid::Uuid::new_v4().to_string(),
            codec,
            status_tx,
            running: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// 상태 구독
    pub fn status(&self) -> watch::Receiver<ClientStatus> {
        self.status_tx.subscribe()
    }

    fn set_step(&self, step: StatusStep) {
        self.status_tx.send_modify(|s| s.step = step);
        info!("세션 상태: {:?}", step);
    }

    fn fail(&self, err: &Error) {
        self.status_tx.send_modify(|s| {
            s.step = StatusStep::Failed;
            s.error = Some(err.to_string());
        });
        warn!("세션 실패: {}", err);
    }

    fn dialer(&self, proxy: &ProxyInfo) -> UpstreamDialer {
        UpstreamDialer::from_proxy(proxy, &self.config.server)
    }

    /// 세션 시작. 성공하면 외부 엔진용 어댑터를 반환한다.
    pub async fn start(&self) -> Result<ReliableStreamAdapter> {
        match self.try_start().await {
            Ok(adapter) => Ok(adapter),
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    async fn try_start(&self) -> Result<ReliableStreamAdapter> {
        self.set_step(StatusStep::AcquiringPaths);
        let ranked = self.rank_proxies().await;

        self.set_step(StatusStep::LoggingIn);
        let reply = self.login_any(&ranked).await?;
        info!("로그인 성공: client {}", reply.client_id);

        self.set_step(StatusStep::ConnectingUpstream);
        let creds = Arc::new(LinkCredentials {
            client_uuid: self.uuid.clone(),
            client_id: reply.client_id,
            connect_key: reply.connect_key,
            key: self.config.key.clone(),
        });
        let (transport, adapter) = Transport::new(
            reply.client_id,
            CommandBus::new(),
            self.codec.clone(),
            &self.config.transport,
            &self.shutdown,
        );

        let selected = self.config.selected_count();
        let mut proxies = ranked.into_iter();
        let groups: Vec<PathGroup> = proxies
            .by_ref()
            .take(selected)
            .enumerate()
            .map(|(i, proxy)| self.spawn_group(i as TunnelId, proxy, &transport, &creds))
            .collect();
        let pool = ProxyPool::new(proxies);

        let managers: Vec<_> = groups
            .iter()
            .flat_map(|g| g.managers.iter().map(|m| m.subscribe()))
            .collect();
        *self.running.lock() = Some(Running {
            transport,
            creds,
            groups,
            pool,
        });

        self.set_step(StatusStep::CheckingConnection);
        self.wait_attached(managers).await?;

        self.set_step(StatusStep::Running);
        self.spawn_monitor();
        Ok(adapter)
    }

    /// 프록시별 지연 측정 후 빠른 순 정렬 (실패한 프록시는 뒤로)
    async fn rank_proxies(&self) -> Vec<ProxyInfo> {
        let timeout = self.config.transport.connect_timeout();
        let mut probes = JoinSet::new();
        for (i, proxy) in self.config.proxies.iter().enumerate() {
            let dialer = self.dialer(proxy);
            let codec = self.codec.clone();
            probes.spawn(async move { (i, test_ping(&dialer, &codec, timeout).await) });
        }

        let mut latency = vec![Duration::MAX; self.config.proxies.len()];
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok((i, Ok(rtt))) => latency[i] = rtt,
                Ok((i, Err(e))) => warn!("프록시 {} 측정 실패: {}", self.config.proxies[i].addr.address(), e),
                Err(e) => warn!("측정 태스크 실패: {}", e),
            }
        }

        let mut ranked: Vec<(Duration, ProxyInfo)> = latency
            .into_iter()
            .zip(self.config.proxies.iter().cloned())
            .collect();
        ranked.sort_by_key(|(rtt, _)| *rtt);
        ranked.into_iter().map(|(_, p)| p).collect()
    }

    /// 프록시를 차례로 시도 (인증 거부면 즉시 중단)
    async fn login_any(&self, proxies: &[ProxyInfo]) -> Result<LoginReply> {
        let request = Login {
            auth_code: self.config.auth_code,
            user_name: self.config.username.clone(),
            password: hash_password(&self.config.username, &self.config.password),
            client_uuid: self.uuid.clone(),
            compress: self.config.compress,
            key: self.config.key.clone(),
        };
        let timeout = self.config.transport.handshake_timeout();

        let mut last = Error::Config("프록시 없음".into());
        for (i, proxy) in proxies.iter().enumerate() {
            if i > 0 {
                info!("{:?} 후 다음 프록시로 재시도", self.config.transport.reconnect_backoff());
                tokio::select! {
                    _ = self.shutdown.cancelled() => return Err(Error::ConnectionClosed),
                    _ = tokio::time::sleep(self.config.transport.reconnect_backoff()) => {}
                }
            }

            match login(&self.dialer(proxy), &self.codec, &request, timeout).await {
                Ok(reply) => return Ok(reply),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!("로그인 실패 ({}): {}", proxy.addr.address(), e);
                    last = e;
                }
            }
        }
        Err(last)
    }

    fn spawn_group(
        &self,
        tunnel_id: TunnelId,
        proxy: ProxyInfo,
        transport: &Transport,
        creds: &Arc<LinkCredentials>,
    ) -> PathGroup {
        let tunnel = transport.tunnel(tunnel_id);
        let dialer = Arc::new(self.dialer(&proxy));
        let managers = (0..proxy.conn_num)
            .map(|link_id| {
                LinkManager::spawn(
                    link_id as u32,
                    dialer.clone(),
                    tunnel.clone(),
                    creds.clone(),
                    self.codec.clone(),
                    &self.config.transport,
                    transport.shutdown_token(),
                )
            })
            .collect();

        info!(
            "경로 그룹 {}: {} (링크 {}개)",
            tunnel_id,
            dialer.name(),
            proxy.conn_num
        );
        PathGroup {
            tunnel_id,
            proxy,
            managers,
        }
    }

    /// 링크가 하나라도 붙을 때까지 대기
    async fn wait_attached(&self, states: Vec<watch::Receiver<LinkState>>) -> Result<()> {
        let limit = self.config.transport.connect_timeout() + self.config.transport.handshake_timeout();
        let deadline = tokio::time::Instant::now() + limit * 2;
        let mut tick = tokio::time::interval(Duration::from_millis(50));

        loop {
            if states.iter().any(|s| *s.borrow() == LinkState::Attached) {
                return Ok(());
            }
            if !states.is_empty() && states.iter().all(|s| *s.borrow() == LinkState::NeedsLogin) {
                return Err(Error::NeedLogin);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout("upstream"));
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(Error::ConnectionClosed),
                _ = tick.tick() => {}
            }
        }
    }

    /// 최소 RTT 갱신 및 전 링크 NeedsLogin 감지
    fn spawn_monitor(&self) {
        let Some((states, registry)) = self.running.lock().as_ref().map(|r| {
            let states: Vec<_> = r
                .groups
                .iter()
                .flat_map(|g| g.managers.iter().map(|m| m.subscribe()))
                .collect();
            (states, r.transport.registry().clone())
        }) else {
            return;
        };

        let status_tx = self.status_tx.clone();
        let shutdown = self.shutdown.clone();
        let interval = self.config.transport.rerank_interval();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => {}
                }

                let best = best_rtt(&registry.snapshot().1);
                status_tx.send_if_modified(|s| {
                    let changed = s.best_rtt_ms != best;
                    s.best_rtt_ms = best;
                    changed
                });

                if !states.is_empty() && states.iter().all(|s| *s.borrow() == LinkState::NeedsLogin) {
                    status_tx.send_modify(|s| {
                        s.step = StatusStep::Failed;
                        s.error = Some(Error::NeedLogin.to_string());
                    });
                    warn!("모든 링크가 로그인 필요 상태");
                    break;
                }
            }
        });
    }

    /// 경로 그룹의 프록시 교체 (기존 프록시는 예비로 반납)
    pub fn change_proxy(&self, tunnel_id: TunnelId) -> Result<()> {
        let mut guard = self.running.lock();
        let running = guard.as_mut().ok_or(Error::ConnectionClosed)?;
        let index = running
            .groups
            .iter()
            .position(|g| g.tunnel_id == tunnel_id)
            .ok_or_else(|| Error::Config(format!("경로 그룹 없음: {tunnel_id}")))?;
        let next = running
            .pool
            .get()
            .ok_or_else(|| Error::Config("예비 프록시 없음".into()))?;

        let old = running.groups.swap_remove(index);
        for manager in &old.managers {
            manager.stop();
        }
        running.transport.tunnel(tunnel_id).remove_all();
        running.pool.put(old.proxy);

        let group = self.spawn_group(tunnel_id, next, &running.transport, &running.creds);
        running.groups.push(group);
        Ok(())
    }

    /// 현재 경로 그룹 (터널 ID, 프록시 이름)
    pub fn path_groups(&self) -> Vec<(TunnelId, String)> {
        self.running
            .lock()
            .as_ref()
            .map(|r| {
                r.groups
                    .iter()
                    .map(|g| (g.tunnel_id, self.dialer(&g.proxy).name()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// 예비 프록시 수
    pub fn spare_proxies(&self) -> usize {
        self.running.lock().as_ref().map_or(0, |r| r.pool.len())
    }

    /// 복제 수 변경
    pub fn set_duplicate_num(&self, n: usize) {
        if let Some(r) = self.running.lock().as_ref() {
            r.transport.duplicater().set_factor(n);
        }
    }

    /// 통계 요약
    pub fn summary(&self) -> Option<String> {
        self.running
            .lock()
            .as_ref()
            .map(|r| r.transport.stats().summary())
    }

    /// 로그아웃 알림 후 종료
    pub fn stop(&self) {
        if let Some(running) = self.running.lock().take() {
            let logout = Command::Logout(Logout {
                user_name: self.config.username.clone(),
                client_uuid: self.uuid.clone(),
            });
            let sent = running.transport.broadcast(&logout);
            info!("로그아웃 알림 {}개 터널, {}", sent, running.transport.stats().summary());
            running.transport.close();
        }
        self.shutdown.cancel();
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
