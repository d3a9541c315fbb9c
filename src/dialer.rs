//! 업스트림 다이얼러
//!
//! - `Direct`: 서버로 직접 TCP 연결
//! - `Socks5`: SOCKS5 프록시 경유 (무인증 / 사용자명-비밀번호)

use std::future::Future;
use std::net::IpAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::command::{write_u32, Command, CommandCodec, CommandType, TestPing};
use crate::config::{AddrInfo, ProxyInfo, ProxyKind};
use crate::{now_millis, Error, Result, NEW_CONNECTION_KEY};

/// 링크가 사용할 수 있는 양방향 스트림
pub trait LinkStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> LinkStream for T {}

/// 타입이 지워진 연결
pub type BoxedStream = Box<dyn LinkStream>;

/// 업스트림 연결 생성기
pub trait Dialer: Send + Sync + 'static {
    /// 서버까지의 새 스트림 연결
    fn connect(&self) -> impl Future<Output = Result<BoxedStream>> + Send;

    /// 로그용 이름
    fn name(&self) -> String;
}

/// 설정 기반 다이얼러
#[derive(Debug, Clone)]
pub enum UpstreamDialer {
    Direct {
        target: AddrInfo,
    },
    Socks5 {
        proxy: AddrInfo,
        target: AddrInfo,
        auth: Option<(String, String)>,
    },
}

impl UpstreamDialer {
    /// 프록시 정보와 최종 서버 주소로 생성
    pub fn from_proxy(proxy: &ProxyInfo, server: &AddrInfo) -> Self {
        match proxy.kind {
            ProxyKind::Direct => UpstreamDialer::Direct {
                target: server.clone(),
            },
            ProxyKind::Socks5 => {
                let auth = if proxy.login_name.is_empty() {
                    None
                } else {
                    Some((proxy.login_name.clone(), proxy.password.clone()))
                };
                UpstreamDialer::Socks5 {
                    proxy: proxy.addr.clone(),
                    target: server.clone(),
                    auth,
                }
            }
        }
    }

    async fn dial(&self) -> Result<BoxedStream> {
        match self {
            UpstreamDialer::Direct { target } => {
                let stream = TcpStream::connect(target.address()).await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
            UpstreamDialer::Socks5 {
                proxy,
                target,
                auth,
            } => {
                let mut stream = TcpStream::connect(proxy.address()).await?;
                stream.set_nodelay(true)?;
                socks5_handshake(&mut stream, target, auth.as_ref()).await?;
                Ok(Box::new(stream))
            }
        }
    }
}

impl Dialer for UpstreamDialer {
    fn connect(&self) -> impl Future<Output = Result<BoxedStream>> + Send {
        self.dial()
    }

    fn name(&self) -> String {
        match self {
            UpstreamDialer::Direct { target } => format!("direct://{}", target.address()),
            UpstreamDialer::Socks5 { proxy, .. } => format!("socks5://{}", proxy.address()),
        }
    }
}

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const METHOD_NONE: u8 = 0xFF;

/// SOCKS5 CONNECT 협상 (RFC 1928 / RFC 1929)
pub async fn socks5_handshake<S>(stream: &mut S, target: &AddrInfo, auth: Option<&(String, String)>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // 인증 방식 선택
    if auth.is_some() {
        stream
            .write_all(&[SOCKS_VERSION, 2, METHOD_NO_AUTH, METHOD_USER_PASS])
            .await?;
    } else {
        stream.write_all(&[SOCKS_VERSION, 1, METHOD_NO_AUTH]).await?;
    }

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply[0] != SOCKS_VERSION {
        return Err(Error::Protocol(format!("SOCKS 버전 불일치: {}", reply[0])));
    }

    match (reply[1], auth) {
        (METHOD_NO_AUTH, _) => {}
        (METHOD_USER_PASS, Some((user, pass))) => {
            if user.len() > 255 || pass.len() > 255 {
                return Err(Error::Config("SOCKS 사용자명/비밀번호가 너무 김".into()));
            }
            let mut req = Vec::with_capacity(3 + user.len() + pass.len());
            req.push(0x01);
            req.push(user.len() as u8);
            req.extend_from_slice(user.as_bytes());
            req.push(pass.len() as u8);
            req.extend_from_slice(pass.as_bytes());
            stream.write_all(&req).await?;

            let mut status = [0u8; 2];
            stream.read_exact(&mut status).await?;
            if status[1] != 0 {
                return Err(Error::Protocol("SOCKS 인증 실패".into()));
            }
        }
        (METHOD_NONE, _) => {
            return Err(Error::Protocol("SOCKS 사용 가능한 인증 방식 없음".into()));
        }
        (other, _) => {
            return Err(Error::Protocol(format!("SOCKS 인증 방식 거부: {other}")));
        }
    }

    // CONNECT 요청
    let mut req = vec![SOCKS_VERSION, 0x01, 0x00];
    match target.host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            req.push(0x01);
            req.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            req.push(0x04);
            req.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            if target.host.len() > 255 {
                return Err(Error::Config(format!("호스트 이름이 너무 김: {}", target.host)));
            }
            req.push(0x03);
            req.push(target.host.len() as u8);
            req.extend_from_slice(target.host.as_bytes());
        }
    }
    req.extend_from_slice(&target.port.to_be_bytes());
    stream.write_all(&req).await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[1] != 0 {
        return Err(Error::Protocol(format!("SOCKS CONNECT 실패: {}", head[1])));
    }

    // 바인드 주소 건너뛰기
    let addr_len = match head[3] {
        0x01 => 4,
        0x04 => 16,
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize
        }
        other => return Err(Error::Protocol(format!("SOCKS 주소 타입 오류: {other}"))),
    };
    let mut skip = vec![0u8; addr_len + 2];
    stream.read_exact(&mut skip).await?;

    Ok(())
}

/// 다이얼러 지연 측정
///
/// 새 연결에서 TestPing을 두 번 주고받고 두 번째 왕복 시간을 반환한다.
pub async fn test_ping<D: Dialer>(dialer: &D, codec: &CommandCodec, timeout: Duration) -> Result<Duration> {
    let rtt = tokio::time::timeout(timeout, ping_once(dialer, codec))
        .await
        .map_err(|_| Error::Timeout("test ping"))??;
    debug!("{} test ping {:?}", dialer.name(), rtt);
    Ok(rtt)
}

async fn ping_once<D: Dialer>(dialer: &D, codec: &CommandCodec) -> Result<Duration> {
    let mut stream = dialer.connect().await?;
    write_u32(&mut stream, NEW_CONNECTION_KEY).await?;

    let first = Command::TestPing(TestPing::default());
    codec.write_command(&mut stream, &first).await?;
    codec.expect_command(&mut stream, CommandType::TestPing).await?;

    let second = Command::TestPing(TestPing {
        send_time: now_millis(),
    });
    codec.write_command(&mut stream, &second).await?;
    match codec.expect_command(&mut stream, CommandType::TestPing).await? {
        Command::TestPing(reply) => {
            let ms = (now_millis() - reply.send_time).max(0) as u64;
            Ok(Duration::from_millis(ms))
        }
        _ => Err(Error::Protocol("TestPing 응답 아님".into())),
    }
}
