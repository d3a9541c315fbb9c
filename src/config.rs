//! 전송 설정 및 JSON 설정 파일

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result, MAX_COMMAND_LEN};

/// 전송 계층 설정
///
/// 시간 값은 모두 밀리초 정수로 저장한다.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// 패킷당 목표 복제 수 (1이면 중복 전송 없음)
    pub duplicate_num: usize,

    /// 터널별 송신 시도 대기 시간 (생존 확인용)
    pub send_probe_timeout_ms: u64,

    /// 재연결 대기 시간 (고정 backoff)
    pub reconnect_backoff_ms: u64,

    /// 업스트림 연결 타임아웃
    pub connect_timeout_ms: u64,

    /// 핸드쉐이크 타임아웃
    pub handshake_timeout_ms: u64,

    /// RTT 측정 주기 하한
    pub ping_interval_min_ms: u64,

    /// RTT 측정 주기 상한
    pub ping_interval_max_ms: u64,

    /// Duplicater 터널 재정렬 주기
    pub rerank_interval_ms: u64,

    /// 링크 종료 시 남은 커맨드 전송 전 대기 시간
    pub close_grace_ms: u64,

    /// 수신 데이터그램 큐 크기 (모든 터널 공용)
    pub inbound_queue_size: usize,

    /// 송신 데이터그램 큐 크기 (어댑터 → Duplicater)
    pub outbound_queue_size: usize,

    /// 터널 전용 송신 큐 크기
    pub tunnel_queue_size: usize,

    /// 폴백 송신 큐 크기 (모든 링크 공용)
    pub fallback_queue_size: usize,

    /// 링크별 커맨드 큐 크기
    pub command_queue_size: usize,

    /// 커맨드 프레임 최대 길이
    pub max_command_len: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            duplicate_num: 2,
            send_probe_timeout_ms: 30,
            reconnect_backoff_ms: 5000,
            connect_timeout_ms: 5000,
            handshake_timeout_ms: 5000,
            ping_interval_min_ms: 5000,
            ping_interval_max_ms: 10_000,
            rerank_interval_ms: 1000,
            close_grace_ms: 1000,
            inbound_queue_size: 128,
            outbound_queue_size: 32,
            tunnel_queue_size: 8,
            fallback_queue_size: 8,
            command_queue_size: 8,
            max_command_len: MAX_COMMAND_LEN,
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 저지연 설정 (모든 경로로 복제, 짧은 타임아웃)
    pub fn low_latency() -> Self {
        Self {
            duplicate_num: 8,
            send_probe_timeout_ms: 10,
            reconnect_backoff_ms: 2000,
            connect_timeout_ms: 3000,
            handshake_timeout_ms: 3000,
            ping_interval_min_ms: 2000,
            ping_interval_max_ms: 4000,
            rerank_interval_ms: 500,
            ..Self::default()
        }
    }

    /// 불안정한 네트워크용 설정
    pub fn unstable_network() -> Self {
        Self {
            duplicate_num: 3,
            send_probe_timeout_ms: 50,
            connect_timeout_ms: 10_000,
            handshake_timeout_ms: 10_000,
            inbound_queue_size: 256,
            outbound_queue_size: 64,
            tunnel_queue_size: 16,
            ..Self::default()
        }
    }

    /// 설정 값 검증
    pub fn validate(&self) -> Result<()> {
        if self.duplicate_num == 0 {
            return Err(Error::Config("duplicate_num은 1 이상이어야 함".into()));
        }
        if self.ping_interval_min_ms > self.ping_interval_max_ms {
            return Err(Error::Config(
                "ping_interval_min_ms > ping_interval_max_ms".into(),
            ));
        }
        let queues = [
            self.inbound_queue_size,
            self.outbound_queue_size,
            self.tunnel_queue_size,
            self.fallback_queue_size,
            self.command_queue_size,
        ];
        if queues.iter().any(|&n| n == 0) {
            return Err(Error::Config("큐 크기는 1 이상이어야 함".into()));
        }
        Ok(())
    }

    pub fn send_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.send_probe_timeout_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn rerank_interval(&self) -> Duration {
        Duration::from_millis(self.rerank_interval_ms)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }

    /// 다음 RTT 측정까지의 임의 대기 시간
    pub fn next_ping_interval(&self) -> Duration {
        use rand::Rng;
        let ms = rand::thread_rng().gen_range(self.ping_interval_min_ms..=self.ping_interval_max_ms);
        Duration::from_millis(ms)
    }
}

/// 호스트 + 포트
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddrInfo {
    pub host: String,
    pub port: u16,
}

impl AddrInfo {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// "host:port" 형식 주소
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// 업스트림 다이얼러 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    /// 서버로 직접 TCP 연결
    Direct,
    /// SOCKS5 프록시 경유
    Socks5,
}

fn default_conn_num() -> usize {
    1
}

/// 업스트림 프록시 정보
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyInfo {
    #[serde(flatten)]
    pub addr: AddrInfo,

    #[serde(default)]
    pub name: String,

    #[serde(rename = "type")]
    pub kind: ProxyKind,

    #[serde(default, rename = "loginname")]
    pub login_name: String,

    #[serde(default)]
    pub password: String,

    /// 이 프록시를 통해 유지할 링크 수
    #[serde(default = "default_conn_num", rename = "connnum")]
    pub conn_num: usize,
}

impl ProxyInfo {
    /// 직접 연결용 프록시 정보
    pub fn direct(conn_num: usize) -> Self {
        Self {
            addr: AddrInfo::new("", 0),
            name: "direct".into(),
            kind: ProxyKind::Direct,
            login_name: String::new(),
            password: String::new(),
            conn_num,
        }
    }
}

/// 클라이언트 설정 파일
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub username: String,
    pub password: String,

    /// 최종 서버 주소
    pub server: AddrInfo,

    /// 업스트림 프록시 목록 (선호 순서)
    pub proxies: Vec<ProxyInfo>,

    /// 동시에 사용할 프록시 수 (0이면 전체)
    #[serde(default, rename = "selectnum")]
    pub select_num: usize,

    #[serde(default)]
    pub compress: bool,

    /// 커맨드 난독화 공유 키
    pub key: String,

    #[serde(default, rename = "authcode")]
    pub auth_code: u32,

    #[serde(default)]
    pub transport: Config,
}

impl ClientConfig {
    /// JSON 파일에서 로드
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        let cfg: Self = serde_json::from_reader(BufReader::new(file))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.proxies.is_empty() {
            return Err(Error::Config("proxies 비어 있음".into()));
        }
        if self.proxies.iter().any(|p| p.conn_num == 0) {
            return Err(Error::Config("connnum은 1 이상이어야 함".into()));
        }
        self.transport.validate()
    }

    /// 실제로 선택할 프록시 수
    pub fn selected_count(&self) -> usize {
        if self.select_num == 0 {
            self.proxies.len()
        } else {
            self.select_num.min(self.proxies.len())
        }
    }
}

/// 서버 사용자 항목
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserEntry {
    pub username: String,
    pub password: String,
}

/// 서버 설정 파일
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub listen: String,
    pub key: String,

    #[serde(default)]
    pub users: Vec<UserEntry>,

    #[serde(default, rename = "pingurl")]
    pub ping_url: String,

    #[serde(default)]
    pub transport: Config,
}

impl ServerConfig {
    /// JSON 파일에서 로드
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        let cfg: Self = serde_json::from_reader(BufReader::new(file))?;
        cfg.transport.validate()?;
        Ok(cfg)
    }
}
