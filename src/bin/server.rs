//! MPR 서버 - Multi-Path Relay
//!
//! 클라이언트 세션을 받아 각 세션의 데이터그램을 그대로 되돌려 보낸다 (에코).
//!
//! 사용법:
//!   cargo run --release --bin mpr-server -- -c server.json [OPTIONS]

use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use mpr::{Acceptor, NewSession, ServerConfig, StaticCredentials};

/// 명령행 옵션
struct Args {
    config_path: PathBuf,
    listen: Option<String>,
}

fn parse_args() -> Result<Args, String> {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = Args {
        config_path: PathBuf::from("server.json"),
        listen: None,
    };

    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1);
        match args[i].as_str() {
            "--config" | "-c" => {
                let v = value.ok_or("--config 값 필요")?;
                parsed.config_path = PathBuf::from(v);
                i += 1;
            }
            "--listen" | "-l" => {
                let v = value.ok_or("--listen 값 필요")?;
                parsed.listen = Some(v.clone());
                i += 1;
            }
            "--help" | "-h" => {
                println!(
                    r#"MPR Server - Multi-Path Relay 서버

클라이언트 로그인/링크 핸드쉐이크를 받고, 세션별 데이터그램을 에코

사용법:
  cargo run --release --bin mpr-server -- [OPTIONS]

옵션:
  -c, --config <PATH>    설정 파일 (기본: server.json)
  -l, --listen <ADDR>    수신 주소 (설정 파일 값 덮어쓰기)
  -h, --help             이 도움말 출력

예시:
  cargo run --release --bin mpr-server -- -c server.json -l 0.0.0.0:7000
"#
                );
                std::process::exit(0);
            }
            other => return Err(format!("알 수 없는 옵션: {other}")),
        }
        i += 1;
    }

    Ok(parsed)
}

/// 세션 하나의 데이터그램 에코
async fn echo(new: NewSession) {
    let NewSession { session, adapter } = new;
    let (mut tx, mut rx) = adapter.split();
    let mut buf = vec![0u8; tx.max_payload()];

    loop {
        tokio::select! {
            _ = session.closed() => break,
            received = rx.recv_from(&mut buf) => {
                let n = match received {
                    Ok(n) => n,
                    Err(_) => break,
                };
                if let Err(e) = tx.send_to(&buf[..n]).await {
                    warn!("client {} 에코 실패: {}", session.client_id(), e);
                    break;
                }
            }
        }
    }
    info!("client {} 에코 종료: {}", session.client_id(), session.stats().summary());
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정 (RUST_LOG, 기본 info)
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = parse_args()?;
    let mut config = ServerConfig::load(&args.config_path)?;
    if let Some(listen) = args.listen {
        config.listen = listen;
    }

    info!("MPR Server starting...");
    info!("Users: {}", config.users.len());

    let shutdown = CancellationToken::new();
    let credentials = Arc::new(StaticCredentials::new(&config.users));
    let (acceptor, mut sessions) = Acceptor::new(&config, credentials, &shutdown);
    let listener = TcpListener::bind(&config.listen).await?;

    let serve = {
        let acceptor = acceptor.clone();
        tokio::spawn(async move { acceptor.serve(listener).await })
    };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            new = sessions.recv() => match new {
                Some(new) => {
                    info!("새 세션: {} (client {})", new.session.user_name(), new.session.client_id());
                    tokio::spawn(echo(new));
                }
                None => break,
            },
        }
    }

    acceptor.close();
    shutdown.cancel();
    if let Ok(Err(e)) = serve.await {
        warn!("수신 종료 에러: {}", e);
    }
    info!("MPR Server stopped");
    Ok(())
}
