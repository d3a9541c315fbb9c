//! # MPR (Multi-Path Relay)
//!
//! 여러 개의 불안정한 중계(relay) 연결을 하나의 신뢰성 있는 바이트 스트림으로 묶는 전송 계층
//!
//! ## 핵심 특징
//! - **멀티패스**: 프록시/주소/네트워크 경로가 서로 다른 여러 링크로 동시 전송
//! - **선택적 중복 전송**: RTT 순위 상위 N개 터널로 같은 패킷을 복제
//! - **정확히 한 번 조립**: 시퀀스 ID + 회전 윈도우로 중복 패킷 제거
//! - **자동 재연결**: 링크별 상태 머신 (connect → handshake → attached → backoff)
//! - **RTT 측정**: 터널별 2단계 ping 커맨드
//! - **커맨드 코덱**: 길이 프리픽스 + 서명 헤더 + XOR 난독화 JSON
//!
//! ## 데이터 흐름
//! 애플리케이션 → (외부) 신뢰성 엔진 → [`datagram`] → [`duplicater`] → N개 [`tunnel`]
//! → N개 [`link`] → 네트워크. 수신은 그 역순이며 중복 제거는 [`datagram`]에서 한 번만 수행된다.
//!
//! 클라이언트는 [`session::ClientSession`], 서버는 [`server::Acceptor`]로 세션을 만든다.

pub mod bus;
pub mod command;
pub mod config;
pub mod connector;
pub mod datagram;
pub mod dialer;
pub mod duplicater;
pub mod error;
pub mod link;
pub mod pool;
pub mod server;
pub mod session;
pub mod stats;
pub mod transport;
pub mod tunnel;

pub use bus::{CommandBus, Subscription};
pub use command::{Command, CommandCodec, CommandType};
pub use config::{ClientConfig, Config, ProxyInfo, ProxyKind, ServerConfig};
pub use connector::{LinkCredentials, LinkManager, LinkState};
pub use datagram::{DatagramReceiver, DatagramSender, DedupWindow, ReliableStreamAdapter};
pub use dialer::{BoxedStream, Dialer, UpstreamDialer};
pub use duplicater::Duplicater;
pub use error::{Error, Result};
pub use link::PhysicalLink;
pub use pool::{BufItem, Pool};
pub use server::{Acceptor, CredentialStore, NewSession, ServerSession, StaticCredentials};
pub use session::{ClientSession, ClientStatus, ProxyPool, StatusStep};
pub use stats::PathStats;
pub use transport::Transport;
pub use tunnel::{Tunnel, TunnelRegistry};

/// 클라이언트 세션 ID (서버가 로그인 시 발급)
pub type ClientId = u32;

/// 터널 ID (클라이언트 세션 내에서 유일)
pub type TunnelId = u32;

/// 링크 ID (터널 내에서 유일)
pub type LinkId = u32;

/// 커맨드 서명 헤더 (데이터 프레임과 구분용)
pub const COMMAND_SIGN: u32 = 0x4D50_5243; // "MPRC"

/// 새 업스트림 연결의 프리앰블
pub const NEW_CONNECTION_KEY: u32 = 0x00FF_EEFF;

/// 데이터 버퍼 크기 (프레임 최대 길이)
pub const DATA_BUF_SIZE: usize = 32 * 1024;

/// 커맨드 프레임 최대 길이
pub const MAX_COMMAND_LEN: usize = 4096;

/// 응답 없는 터널의 RTT 센티널 (밀리초)
pub const UNREACHABLE_RTT_MS: u64 = 1_000_000;

/// 현재 시각 (UNIX epoch 기준 밀리초)
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
