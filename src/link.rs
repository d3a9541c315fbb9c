//! 물리 링크
//!
//! 릴레이까지의 스트림 연결 하나. 수신 루프와 송신 루프 두 태스크로 동작한다.
//!
//! - 수신: `u32 길이 | 바이트` 프레임을 읽어 커맨드는 버스로, 데이터는 터널 수신 큐로
//! - 송신: 터널 전용 큐 / 세션 폴백 큐 / 링크 커맨드 큐를 우선순위 없이 다중화
//!
//! 어느 한쪽 루프가 실패하면 링크는 정확히 한 번 닫힌다. 재시도는 하지 않는다.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::bus::CommandBus;
use crate::command::{self, Command, CommandCodec};
use crate::dialer::BoxedStream;
use crate::pool::{BufItem, Pool};
use crate::{ClientId, Error, LinkId, Result, TunnelId, DATA_BUF_SIZE};

/// 여러 링크가 나눠 소비하는 송신 큐
pub type SharedReceiver = Arc<tokio::sync::Mutex<mpsc::Receiver<BufItem>>>;

pub fn shared_receiver(rx: mpsc::Receiver<BufItem>) -> SharedReceiver {
    Arc::new(tokio::sync::Mutex::new(rx))
}

/// 링크 생성 시 터널이 넘겨주는 공유 자원
#[derive(Clone)]
pub struct LinkContext {
    pub client_id: ClientId,
    pub tunnel_id: TunnelId,

    /// 세션 공용 수신 큐
    pub inbound: mpsc::Sender<BufItem>,

    /// 터널 전용 송신 큐
    pub outbound: SharedReceiver,

    /// 세션 공용 폴백 송신 큐
    pub fallback: SharedReceiver,

    pub bus: Arc<CommandBus>,
    pub codec: Arc<CommandCodec>,

    /// 종료 시 남은 커맨드 전송 제한 시간
    pub close_grace: Duration,

    pub command_queue_size: usize,

    /// 상위(터널) 종료 토큰
    pub shutdown: CancellationToken,
}

/// 물리 링크
pub struct PhysicalLink {
    client_id: ClientId,
    tunnel_id: TunnelId,
    id: LinkId,

    /// 커맨드 송신 큐
    cmd_tx: mpsc::Sender<Command>,

    /// 종료 신호 (터널 토큰의 자식)
    shutdown: CancellationToken,

    closed: AtomicBool,
}

impl PhysicalLink {
    /// 연결을 감싸 수신/송신 루프를 시작
    pub fn spawn(id: LinkId, stream: BoxedStream, ctx: &LinkContext) -> Arc<Self> {
        let (cmd_tx, cmd_rx) = mpsc::channel(ctx.command_queue_size.max(1));
        let link = Arc::new(Self {
            client_id: ctx.client_id,
            tunnel_id: ctx.tunnel_id,
            id,
            cmd_tx,
            shutdown: ctx.shutdown.child_token(),
            closed: AtomicBool::new(false),
        });

        let (reader, writer) = tokio::io::split(stream);
        tokio::spawn(link.clone().recv_loop(reader, ctx.clone()));
        tokio::spawn(link.clone().send_loop(writer, cmd_rx, ctx.clone()));

        debug!(
            "링크 시작: client {} tunnel {} link {}",
            link.client_id, link.tunnel_id, link.id
        );
        link
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn tunnel_id(&self) -> TunnelId {
        self.tunnel_id
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// 링크가 닫힐 때까지 대기
    pub async fn closed(&self) {
        self.shutdown.cancelled().await
    }

    /// 커맨드 큐에 넣기 (가득 찼거나 닫혔으면 false)
    pub fn try_send_command(&self, command: Command) -> bool {
        !self.is_closed() && self.cmd_tx.try_send(command).is_ok()
    }

    /// 커맨드 큐에 넣기 (자리가 날 때까지 대기)
    pub async fn send_command(&self, command: Command) -> Result<()> {
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(Error::ConnectionClosed),
            r = self.cmd_tx.send(command) => r.map_err(|_| Error::ConnectionClosed),
        }
    }

    /// 링크 종료 (여러 번 호출해도 한 번만 동작)
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!(
                "링크 종료: client {} tunnel {} link {}",
                self.client_id, self.tunnel_id, self.id
            );
        }
        self.shutdown.cancel();
    }

    async fn recv_loop(self: Arc<Self>, mut reader: ReadHalf<BoxedStream>, ctx: LinkContext) {
        let pool = Pool::data();

        let result: Result<()> = async {
            loop {
                let mut buf = tokio::select! {
                    _ = self.shutdown.cancelled() => return Ok(()),
                    r = command::read_frame(&mut reader, &pool, DATA_BUF_SIZE) => r?,
                };

                if command::is_command(buf.data()) {
                    let cmd = ctx.codec.decode_buf(&mut buf)?;
                    drop(buf);
                    ctx.bus.publish(cmd);
                    continue;
                }

                tokio::select! {
                    _ = self.shutdown.cancelled() => return Ok(()),
                    r = ctx.inbound.send(buf) => r.map_err(|_| Error::ChannelError)?,
                }
            }
        }
        .await;

        if let Err(e) = result {
            debug!("링크 {} 수신 종료: {}", self.id, e);
        }
        self.close();
    }

    async fn send_loop(
        self: Arc<Self>,
        mut writer: WriteHalf<BoxedStream>,
        mut cmd_rx: mpsc::Receiver<Command>,
        ctx: LinkContext,
    ) {
        // 프레임을 쓰는 도중 종료되면 false
        let result: Result<bool> = async {
            loop {
                let frame = tokio::select! {
                    _ = self.shutdown.cancelled() => return Ok(true),
                    cmd = cmd_rx.recv() => match cmd {
                        Some(cmd) => Outgoing::Command(cmd),
                        None => return Ok(true),
                    },
                    buf = recv_shared(&ctx.outbound) => match buf {
                        Some(buf) => Outgoing::Data(buf),
                        None => return Ok(true),
                    },
                    buf = recv_shared(&ctx.fallback) => match buf {
                        Some(buf) => Outgoing::Data(buf),
                        None => return Ok(true),
                    },
                };

                // 피어가 읽지 않아 막힌 쓰기도 종료 신호로 풀린다
                tokio::select! {
                    biased;
                    r = frame.write_to(&mut writer, &ctx.codec) => r?,
                    _ = self.shutdown.cancelled() => return Ok(false),
                }
            }
        }
        .await;

        let clean = match result {
            Ok(clean) => clean,
            Err(e) => {
                debug!("링크 {} 송신 종료: {}", self.id, e);
                false
            }
        };
        self.close();

        // 남은 커맨드 (로그아웃 알림 등) 전송 후 연결 닫기, 전체를 close_grace로 제한
        let teardown = async {
            if clean {
                while let Ok(cmd) = cmd_rx.try_recv() {
                    if ctx.codec.write_command(&mut writer, &cmd).await.is_err() {
                        break;
                    }
                }
            }
            let _ = writer.shutdown().await;
        };
        if tokio::time::timeout(ctx.close_grace, teardown).await.is_err() {
            debug!("링크 {} 종료 유예 시간 초과", self.id);
        }
    }
}

/// 송신 루프가 쓸 프레임
enum Outgoing {
    Command(Command),
    Data(BufItem),
}

impl Outgoing {
    async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W, codec: &CommandCodec) -> Result<()> {
        match self {
            Outgoing::Command(cmd) => codec.write_command(writer, cmd).await,
            Outgoing::Data(buf) => write_data(writer, buf).await,
        }
    }
}

async fn recv_shared(rx: &SharedReceiver) -> Option<BufItem> {
    rx.lock().await.recv().await
}

/// 데이터 프레임 쓰기
pub async fn write_data<W: AsyncWrite + Unpin>(writer: &mut W, buf: &BufItem) -> Result<()> {
    writer.write_u32(buf.size() as u32).await?;
    writer.write_all(buf.data()).await?;
    writer.flush().await?;
    Ok(())
}
