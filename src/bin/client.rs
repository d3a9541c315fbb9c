//! MPR 클라이언트 - Multi-Path Relay
//!
//! 여러 프록시 경로로 서버와 세션을 맺고, 표준 입력 한 줄을 데이터그램 하나로 보낸다.
//! 서버에서 받은 데이터그램은 표준 출력으로 쓴다.
//!
//! 사용법:
//!   cargo run --release --bin mpr-client -- -c client.json [OPTIONS]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use mpr::{ClientConfig, ClientSession, StatusStep};

/// 명령행 옵션
#[derive(Default)]
struct Args {
    config_path: PathBuf,
    duplicate_num: Option<usize>,
    select_num: Option<usize>,
    stats_interval: Option<Duration>,
}

fn parse_args() -> Result<Args, String> {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = Args {
        config_path: PathBuf::from("client.json"),
        ..Args::default()
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
            "--duplicate" | "-d" => {
                let v = value.ok_or("--duplicate 값 필요")?;
                parsed.duplicate_num = Some(v.parse().map_err(|_| "유효한 숫자 필요")?);
                i += 1;
            }
            "--select" | "-s" => {
                let v = value.ok_or("--select 값 필요")?;
                parsed.select_num = Some(v.parse().map_err(|_| "유효한 숫자 필요")?);
                i += 1;
            }
            "--stats" => {
                let v = value.ok_or("--stats 값 필요")?;
                let secs: u64 = v.parse().map_err(|_| "유효한 숫자 필요")?;
                parsed.stats_interval = Some(Duration::from_secs(secs.max(1)));
                i += 1;
            }
            "--help" | "-h" => {
                println!(
                    r#"MPR Client - Multi-Path Relay 클라이언트

여러 프록시 경로를 하나의 세션으로 묶고 RTT 상위 경로로 데이터그램을 복제 전송

사용법:
  cargo run --release --bin mpr-client -- [OPTIONS]

옵션:
  -c, --config <PATH>    설정 파일 (기본: client.json)
  -d, --duplicate <N>    패킷당 복제 수 (설정 파일 값 덮어쓰기)
  -s, --select <N>       동시에 사용할 프록시 수 (0 = 전체)
  --stats <SECS>         통계 출력 주기 (초)
  -h, --help             이 도움말 출력

예시:
  # 기본 실행
  cargo run --release --bin mpr-client -- -c client.json

  # 3중 복제, 프록시 4개 사용
  cargo run --release --bin mpr-client -- -c client.json -d 3 -s 4
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

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정 (RUST_LOG, 기본 info)
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = parse_args()?;
    let mut config = ClientConfig::load(&args.config_path)?;
    if let Some(n) = args.duplicate_num {
        config.transport.duplicate_num = n;
    }
    if let Some(n) = args.select_num {
        config.select_num = n;
    }
    config.validate()?;

    info!("MPR Client starting...");
    info!("Server: {}", config.server.address());
    info!("Proxies: {} (select {})", config.proxies.len(), config.selected_count());
    info!("Duplicate: {}", config.transport.duplicate_num);

    let session = Arc::new(ClientSession::new(config));
    let adapter = session.start().await?;
    let (mut tx, mut rx) = adapter.split();

    // 세션 상태 출력
    let mut status = session.status();
    let status_task = tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let s = status.borrow_and_update().clone();
            match s.step {
                StatusStep::Failed => {
                    warn!("세션 실패: {}", s.error.unwrap_or_default());
                    break;
                }
                _ => info!("상태: {:?}, best rtt {}ms", s.step, s.best_rtt_ms),
            }
        }
    });

    // 수신 → 표준 출력
    let recv_task = tokio::spawn(async move {
        let mut buf = vec![0u8; mpr::DATA_BUF_SIZE];
        loop {
            match rx.recv_from(&mut buf).await {
                Ok(n) => println!("{}", String::from_utf8_lossy(&buf[..n])),
                Err(e) => {
                    info!("수신 종료: {}", e);
                    break;
                }
            }
        }
    });

    if let Some(interval) = args.stats_interval {
        let session = session.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match session.summary() {
                    Some(summary) => info!("{}", summary),
                    None => break,
                }
            }
        });
    }

    // 표준 입력 → 송신
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => match line? {
                Some(line) => {
                    if let Err(e) = tx.send_to(line.as_bytes()).await {
                        warn!("송신 실패: {}", e);
                        break;
                    }
                }
                None => break,
            },
        }
    }

    if let Some(summary) = session.summary() {
        info!("{}", summary);
    }
    session.stop();
    recv_task.abort();
    status_task.abort();
    info!("MPR Client stopped");
    Ok(())
}
