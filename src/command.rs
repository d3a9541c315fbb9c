//! 컨트롤 커맨드 정의 및 코덱
//!
//! 와이어 포맷 (빅엔디언):
//! `u32 길이 | u32 서명 헤더 | u32 커맨드 타입 | XOR(JSON)`
//!
//! 길이는 자기 자신을 제외한 바이트 수. 데이터 프레임은 `u32 길이 | 바이트` 형식을 공유하며
//! 앞 4바이트가 서명 헤더와 같지 않으므로 커맨드와 구분된다.

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::pool::{BufItem, Pool};
use crate::{ClientId, Error, LinkId, Result, TunnelId, COMMAND_SIGN, MAX_COMMAND_LEN};

/// 커맨드 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CommandType {
    /// 아무 동작 없음
    Idle = 1,

    /// 프록시 지연 측정 (새 연결에서 2회 에코)
    TestPing = 2,

    /// 로그인
    Login = 3,

    /// 로그인 응답
    LoginReply = 4,

    /// 링크 핸드쉐이크
    Handshake = 5,

    /// 핸드쉐이크 응답
    HandshakeReply = 6,

    /// 터널 RTT 측정
    Ping = 7,

    /// 로그아웃 알림
    Logout = 8,
}

impl TryFrom<u32> for CommandType {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        Ok(match value {
            1 => CommandType::Idle,
            2 => CommandType::TestPing,
            3 => CommandType::Login,
            4 => CommandType::LoginReply,
            5 => CommandType::Handshake,
            6 => CommandType::HandshakeReply,
            7 => CommandType::Ping,
            8 => CommandType::Logout,
            other => return Err(Error::UnknownCommand(other)),
        })
    }
}

/// 로그인 응답 코드
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum LoginCode {
    Success = 0,
    ErrAuthCode = 1,
    ErrAuthority = 2,
}

impl TryFrom<u32> for LoginCode {
    type Error = String;

    fn try_from(value: u32) -> std::result::Result<Self, String> {
        match value {
            0 => Ok(LoginCode::Success),
            1 => Ok(LoginCode::ErrAuthCode),
            2 => Ok(LoginCode::ErrAuthority),
            other => Err(format!("unknown login code {other}")),
        }
    }
}

impl From<LoginCode> for u32 {
    fn from(code: LoginCode) -> u32 {
        code as u32
    }
}

/// 핸드쉐이크 응답 코드
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum HandshakeCode {
    Success = 0,
    NeedLogin = 1,
}

impl TryFrom<u32> for HandshakeCode {
    type Error = String;

    fn try_from(value: u32) -> std::result::Result<Self, String> {
        match value {
            0 => Ok(HandshakeCode::Success),
            1 => Ok(HandshakeCode::NeedLogin),
            other => Err(format!("unknown handshake code {other}")),
        }
    }
}

impl From<HandshakeCode> for u32 {
    fn from(code: HandshakeCode) -> u32 {
        code as u32
    }
}

/// 프록시 지연 측정
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestPing {
    #[serde(rename = "SendTime")]
    pub send_time: i64,
}

/// 로그인 요청
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Login {
    #[serde(rename = "AuthCode")]
    pub auth_code: u32,
    #[serde(rename = "UserName")]
    pub user_name: String,
    /// 비밀번호 해시 ([`hash_password`])
    #[serde(rename = "PassWord")]
    pub password: String,
    #[serde(rename = "ClientUUID")]
    pub client_uuid: String,
    #[serde(rename = "Compress")]
    pub compress: bool,
    /// 공유 키
    #[serde(rename = "Key")]
    pub key: String,
}

/// 로그인 응답
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginReply {
    #[serde(rename = "ClientUUID")]
    pub client_uuid: String,
    #[serde(rename = "ClientID")]
    pub client_id: ClientId,
    /// 세션별 연결 키 (핸드쉐이크 시 제출)
    #[serde(rename = "ConnectKey")]
    pub connect_key: String,
    #[serde(rename = "Code")]
    pub code: LoginCode,
    #[serde(rename = "PingURL", default)]
    pub ping_url: String,
}

/// 링크 핸드쉐이크
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    #[serde(rename = "ClientUUID")]
    pub client_uuid: String,
    #[serde(rename = "ClientID")]
    pub client_id: ClientId,
    #[serde(rename = "TunnelID")]
    pub tunnel_id: TunnelId,
    #[serde(rename = "ConnID")]
    pub conn_id: LinkId,
    #[serde(rename = "ConnectKey")]
    pub connect_key: String,
    #[serde(rename = "Key")]
    pub key: String,
}

/// 핸드쉐이크 응답
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeReply {
    #[serde(rename = "ClientUUID")]
    pub client_uuid: String,
    #[serde(rename = "Code")]
    pub code: HandshakeCode,
}

/// 터널 RTT 측정 (step 1: 요청, step 2: 에코)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    #[serde(rename = "ClientID")]
    pub client_id: ClientId,
    #[serde(rename = "TunnelID")]
    pub tunnel_id: TunnelId,
    #[serde(rename = "ID")]
    pub id: u32,
    #[serde(rename = "Step")]
    pub step: u8,
    #[serde(rename = "SendTime")]
    pub send_time: i64,
}

/// 로그아웃 알림
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Logout {
    #[serde(rename = "UserName")]
    pub user_name: String,
    #[serde(rename = "ClientUUID")]
    pub client_uuid: String,
}

/// 통합 커맨드 enum
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Idle,
    TestPing(TestPing),
    Login(Login),
    LoginReply(LoginReply),
    Handshake(Handshake),
    HandshakeReply(HandshakeReply),
    Ping(Ping),
    Logout(Logout),
}

impl Command {
    /// 커맨드 타입 반환
    pub fn command_type(&self) -> CommandType {
        match self {
            Command::Idle => CommandType::Idle,
            Command::TestPing(_) => CommandType::TestPing,
            Command::Login(_) => CommandType::Login,
            Command::LoginReply(_) => CommandType::LoginReply,
            Command::Handshake(_) => CommandType::Handshake,
            Command::HandshakeReply(_) => CommandType::HandshakeReply,
            Command::Ping(_) => CommandType::Ping,
            Command::Logout(_) => CommandType::Logout,
        }
    }

    fn to_json(&self) -> Result<Vec<u8>> {
        let json = match self {
            Command::Idle => b"{}".to_vec(),
            Command::TestPing(c) => serde_json::to_vec(c)?,
            Command::Login(c) => serde_json::to_vec(c)?,
            Command::LoginReply(c) => serde_json::to_vec(c)?,
            Command::Handshake(c) => serde_json::to_vec(c)?,
            Command::HandshakeReply(c) => serde_json::to_vec(c)?,
            Command::Ping(c) => serde_json::to_vec(c)?,
            Command::Logout(c) => serde_json::to_vec(c)?,
        };
        Ok(json)
    }

    fn from_json(ty: CommandType, json: &[u8]) -> Result<Self> {
        Ok(match ty {
            CommandType::Idle => {
                serde_json::from_slice::<serde::de::IgnoredAny>(json)?;
                Command::Idle
            }
            CommandType::TestPing => Command::TestPing(serde_json::from_slice(json)?),
            CommandType::Login => Command::Login(serde_json::from_slice(json)?),
            CommandType::LoginReply => Command::LoginReply(serde_json::from_slice(json)?),
            CommandType::Handshake => Command::Handshake(serde_json::from_slice(json)?),
            CommandType::HandshakeReply => Command::HandshakeReply(serde_json::from_slice(json)?),
            CommandType::Ping => Command::Ping(serde_json::from_slice(json)?),
            CommandType::Logout => Command::Logout(serde_json::from_slice(json)?),
        })
    }
}

/// 반복 키 XOR (키가 비어 있으면 그대로)
pub fn xor(data: &mut [u8], key: &[u8]) {
    if key.is_empty() {
        return;
    }
    for (b, k) in data.iter_mut().zip(key.iter().cycle()) {
        *b ^= k;
    }
}

/// 비밀번호 해시: hex(md5(username || sha256(password)))
pub fn hash_password(user_name: &str, password: &str) -> String {
    use sha2::{Digest, Sha256};

    let p = Sha256::digest(password.as_bytes());
    let mut k = Vec::with_capacity(user_name.len() + p.len());
    k.extend_from_slice(user_name.as_bytes());
    k.extend_from_slice(&p);
    format!("{:x}", md5::compute(k))
}

/// 프레임이 커맨드인지 확인 (길이 필드 제외한 프레임 기준)
pub fn is_command(frame: &[u8]) -> bool {
    frame.len() >= 8 && frame[..4] == COMMAND_SIGN.to_be_bytes()
}

/// 커맨드 프레임의 타입 확인
pub fn peek_command_type(frame: &[u8]) -> Option<CommandType> {
    if !is_command(frame) {
        return None;
    }
    let ty = u32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]);
    CommandType::try_from(ty).ok()
}

pub async fn read_u32<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u32> {
    Ok(reader.read_u32().await?)
}

pub async fn write_u32<W: AsyncWrite + Unpin>(writer: &mut W, n: u32) -> Result<()> {
    writer.write_u32(n).await?;
    Ok(())
}

/// 길이 프리픽스 프레임 읽기
///
/// 길이가 0이거나 `max_len` 또는 풀 용량을 넘으면 버퍼 할당 전에 실패한다.
pub async fn read_frame<R>(reader: &mut R, pool: &std::sync::Arc<Pool>, max_len: usize) -> Result<BufItem>
where
    R: AsyncRead + Unpin,
{
    let len = read_u32(reader).await? as usize;
    let max = max_len.min(pool.capacity());
    if len == 0 {
        return Err(Error::Protocol("빈 프레임".into()));
    }
    if len > max {
        return Err(Error::FrameTooLarge { len, max });
    }

    let mut buf = pool.get();
    buf.read_n_from(reader, len).await?;
    Ok(buf)
}

/// 커맨드 코덱
///
/// 난독화 키와 최대 길이를 가진다. 세션마다 하나를 만들어 `Arc`로 공유한다.
#[derive(Debug, Clone)]
pub struct CommandCodec {
    key: Vec<u8>,
    max_len: usize,
}

impl CommandCodec {
    pub fn new(key: impl AsRef<[u8]>) -> Self {
        Self {
            key: key.as_ref().to_vec(),
            max_len: MAX_COMMAND_LEN,
        }
    }

    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// 길이 필드를 포함한 전체 프레임으로 인코딩
    pub fn encode(&self, command: &Command) -> Result<BytesMut> {
        let mut payload = command.to_json()?;
        xor(&mut payload, &self.key);

        let body_len = 8 + payload.len();
        if body_len > self.max_len {
            return Err(Error::FrameTooLarge {
                len: body_len,
                max: self.max_len,
            });
        }

        let mut frame = BytesMut::with_capacity(4 + body_len);
        frame.put_u32(body_len as u32);
        frame.put_u32(COMMAND_SIGN);
        frame.put_u32(command.command_type() as u32);
        frame.put_slice(&payload);
        Ok(frame)
    }

    /// 프레임 디코딩 (길이 필드 제외). 페이로드는 제자리에서 XOR 복호화된다.
    pub fn decode(&self, frame: &mut [u8]) -> Result<Command> {
        if frame.len() < 8 {
            return Err(Error::Protocol(format!("커맨드 프레임이 너무 짧음: {}", frame.len())));
        }

        let sign = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
        if sign != COMMAND_SIGN {
            return Err(Error::InvalidSignHeader {
                expected: COMMAND_SIGN,
                got: sign,
            });
        }

        let ty = CommandType::try_from(u32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]))?;
        let payload = &mut frame[8..];
        xor(payload, &self.key);
        Command::from_json(ty, payload)
    }

    /// 풀 버퍼에 담긴 프레임 디코딩
    pub fn decode_buf(&self, buf: &mut BufItem) -> Result<Command> {
        self.decode(buf.data_mut())
    }

    /// 커맨드 쓰기
    pub async fn write_command<W>(&self, writer: &mut W, command: &Command) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let frame = self.encode(command)?;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    /// 커맨드 읽기
    pub async fn read_command<R>(&self, reader: &mut R) -> Result<Command>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = read_frame(reader, &Pool::data(), self.max_len).await?;
        self.decode_buf(&mut buf)
    }

    /// 특정 타입의 커맨드 읽기 (다른 타입이면 프로토콜 에러)
    pub async fn expect_command<R>(&self, reader: &mut R, expected: CommandType) -> Result<Command>
    where
        R: AsyncRead + Unpin,
    {
        let command = self.read_command(reader).await?;
        if command.command_type() != expected {
            return Err(Error::UnexpectedCommand {
                expected,
                got: command.command_type(),
            });
        }
        Ok(command)
    }
}
