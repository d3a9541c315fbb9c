//! 에러 타입 정의

use thiserror::Error;

use crate::command::{CommandType, LoginCode};

/// MPR 에러 타입
///
/// - 일시적 I/O: `Io`, `Timeout`, `ConnectionClosed` (링크 관리자가 재시도)
/// - 프로토콜: `Protocol`, `InvalidSignHeader`, `UnknownCommand`, `FrameTooLarge`, `Json`
/// - 인증: `NeedLogin`, `LoginRejected`, `InvalidKey`
/// - 자원: `BufferOverflow`, `PoolMismatch`
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON 에러: {0}")]
    Json(#[from] serde_json::Error),

    #[error("타임아웃: {0}")]
    Timeout(&'static str),

    #[error("프로토콜 에러: {0}")]
    Protocol(String),

    #[error("유효하지 않은 서명 헤더: expected {expected:08X}, got {got:08X}")]
    InvalidSignHeader { expected: u32, got: u32 },

    #[error("알 수 없는 커맨드 타입: {0}")]
    UnknownCommand(u32),

    #[error("커맨드 타입 불일치: expected {expected:?}, got {got:?}")]
    UnexpectedCommand {
        expected: CommandType,
        got: CommandType,
    },

    #[error("프레임 길이 초과: {len} > {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("버퍼 오버플로우: {need} 바이트 필요, 여유 {free} 바이트")]
    BufferOverflow { need: usize, free: usize },

    #[error("풀 불일치: 버퍼 용량 {buf_cap}, 풀 용량 {pool_cap}")]
    PoolMismatch { buf_cap: usize, pool_cap: usize },

    #[error("로그인 필요 (서버 재시작 가능성)")]
    NeedLogin,

    #[error("로그인 거부: {0:?}")]
    LoginRejected(LoginCode),

    #[error("유효하지 않은 키")]
    InvalidKey,

    #[error("설정 에러: {0}")]
    Config(String),

    #[error("채널 에러")]
    ChannelError,

    #[error("연결 종료")]
    ConnectionClosed,
}

impl Error {
    /// 재시도해도 의미 없는 인증 계열 에러 여부
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::NeedLogin | Error::LoginRejected(_) | Error::InvalidKey
        )
    }
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
