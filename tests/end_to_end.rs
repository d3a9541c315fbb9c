//! 루프백 서버 + 클라이언트 세션 통합 테스트

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use mpr::command::LoginCode;
use mpr::config::{AddrInfo, UserEntry};
use mpr::{
    Acceptor, ClientConfig, ClientSession, Config, Error, NewSession, ProxyInfo, ServerConfig, StaticCredentials,
    StatusStep,
};

const WAIT: Duration = Duration::from_secs(5);

fn transport_config() -> Config {
    Config {
        duplicate_num: 2,
        close_grace_ms: 10,
        reconnect_backoff_ms: 100,
        connect_timeout_ms: 1000,
        handshake_timeout_ms: 1000,
        ..Config::default()
    }
}

async fn start_server() -> (Arc<Acceptor>, mpsc::Receiver<NewSession>, u16, CancellationToken) {
    let config = ServerConfig {
        listen: "127.0.0.1:0".into(),
        key: "e2e-key".into(),
        users: vec![UserEntry {
            username: "bob".into(),
            password: "secret".into(),
        }],
        ping_url: String::new(),
        transport: transport_config(),
    };
    let shutdown = CancellationToken::new();
    let credentials = Arc::new(StaticCredentials::new(&config.users));
    let (acceptor, sessions) = Acceptor::new(&config, credentials, &shutdown);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let serving = acceptor.clone();
    tokio::spawn(async move { serving.serve(listener).await });
    (acceptor, sessions, port, shutdown)
}

fn client_config(port: u16, password: &str) -> ClientConfig {
    ClientConfig {
        username: "bob".into(),
        password: password.into(),
        server: AddrInfo::new("127.0.0.1", port),
        proxies: vec![ProxyInfo::direct(2), ProxyInfo::direct(1)],
        select_num: 0,
        compress: false,
        key: "e2e-key".into(),
        auth_code: 0,
        transport: transport_config(),
    }
}

#[tokio::test]
async fn test_datagrams_cross_both_directions_once() {
    let (acceptor, mut sessions, port, shutdown) = start_server().await;

    let client = ClientSession::new(client_config(port, "secret"));
    let adapter = tokio::time::timeout(WAIT, client.start()).await.unwrap().unwrap();
    assert_eq!(client.status().borrow().step, StatusStep::Running);
    assert_eq!(client.path_groups().len(), 2);

    let server = tokio::time::timeout(WAIT, sessions.recv()).await.unwrap().unwrap();
    assert_eq!(server.session.user_name(), "bob");
    assert_eq!(acceptor.session_count(), 1);

    let (mut client_tx, mut client_rx) = adapter.split();
    let (mut server_tx, mut server_rx) = server.adapter.split();

    // 클라이언트 → 서버
    let sent: BTreeSet<Vec<u8>> = (0..20u8).map(|i| vec![i; 100 + i as usize]).collect();
    for payload in &sent {
        client_tx.send_to(payload).await.unwrap();
    }
    let mut buf = vec![0u8; 4096];
    let mut received = BTreeSet::new();
    while received.len() < sent.len() {
        let n = tokio::time::timeout(WAIT, server_rx.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(received.insert(buf[..n].to_vec()), "같은 데이터그램이 두 번 전달됨");
    }
    assert_eq!(received, sent);

    // 남은 사본은 모두 버려진다
    let extra = tokio::time::timeout(Duration::from_millis(300), server_rx.recv_from(&mut buf)).await;
    assert!(extra.is_err());
    let stats = server.session.stats().snapshot();
    assert_eq!(stats.delivered, sent.len() as u64);

    // 서버 → 클라이언트
    server_tx.send_to(b"pong").await.unwrap();
    let n = tokio::time::timeout(WAIT, client_rx.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], b"pong");

    // 종료하면 서버 세션도 닫힌다
    client.stop();
    tokio::time::timeout(WAIT, server.session.closed()).await.unwrap();
    shutdown.cancel();
}

#[tokio::test]
async fn test_wrong_password_rejected() {
    let (acceptor, _sessions, port, shutdown) = start_server().await;

    let client = ClientSession::new(client_config(port, "guess"));
    let result = tokio::time::timeout(WAIT, client.start()).await.unwrap();
    assert!(matches!(result, Err(Error::LoginRejected(LoginCode::ErrAuthority))));
    assert_eq!(client.status().borrow().step, StatusStep::Failed);
    assert_eq!(acceptor.session_count(), 0);
    shutdown.cancel();
}

#[tokio::test]
async fn test_relogin_replaces_server_session() {
    let (_acceptor, mut sessions, port, shutdown) = start_server().await;

    let first = ClientSession::new(client_config(port, "secret"));
    let _a = tokio::time::timeout(WAIT, first.start()).await.unwrap().unwrap();
    let first_server = sessions.recv().await.unwrap();

    let second = ClientSession::new(client_config(port, "secret"));
    let _b = tokio::time::timeout(WAIT, second.start()).await.unwrap().unwrap();
    let second_server = sessions.recv().await.unwrap();

    assert!(first_server.session.is_closed());
    assert!(!second_server.session.is_closed());
    assert_ne!(first_server.session.client_id(), second_server.session.client_id());

    second.stop();
    first.stop();
    shutdown.cancel();
}
