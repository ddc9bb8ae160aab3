//! Authentication outcomes and the authorization gate on file operations.
//!
//! # Coverage
//! - Shipped credentials authenticate; wrong passwords are rejected.
//! - The anonymous user is admitted but cannot drive file operations.
//! - Unknown clients are refused before any effect.
//! - A TOML credential file replaces the shipped directory.

use std::time::Duration;

use rm_protocol::{Address, ClientPayload, FilePayload, Payload};
use rm_test_utils::TestPeer;
use server::{NodeStatus, ServerConfig, ServerNode};
use tokio::sync::watch;

const WAIT: Duration = Duration::from_secs(2);

struct TestServer {
    addr: Address,
    storage: tempfile::TempDir,
    _status: watch::Receiver<NodeStatus>,
    _shutdown: watch::Sender<bool>,
}

async fn start_server(users_file: Option<&str>) -> TestServer {
    let storage = tempfile::tempdir().unwrap();
    let mut cfg = ServerConfig::new(Address::new("127.0.0.1", 0), storage.path().join("root"));
    if let Some(toml) = users_file {
        let path = storage.path().join("users.toml");
        std::fs::write(&path, toml).unwrap();
        cfg.users_file = Some(path);
    }
    let (node, status) = ServerNode::start(cfg).await.expect("server start");
    let addr = node.local_addr().clone();
    let (shutdown, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        node.run(shutdown_rx).await.expect("server error");
    });
    TestServer {
        addr,
        storage,
        _status: status,
        _shutdown: shutdown,
    }
}

async fn knock(peer: &mut TestPeer, server: &Address) -> Vec<Address> {
    peer.request(&[server.clone()], Payload::Client(ClientPayload::Knock))
        .await
        .unwrap();
    match peer.recv(WAIT).await.expect("SET_SERVERS").payload {
        Payload::Client(ClientPayload::SetServers { servers }) => servers,
        other => panic!("expected SET_SERVERS, got {other:?}"),
    }
}

async fn auth(peer: &mut TestPeer, servers: &[Address], user: &str, pass: &str) -> bool {
    peer.request(
        servers,
        Payload::Client(ClientPayload::Auth {
            username: user.to_owned(),
            password: pass.to_owned(),
        }),
    )
    .await
    .unwrap();
    match peer.recv(WAIT).await.expect("AUTH_SUCCESS").payload {
        Payload::Client(ClientPayload::AuthSuccess { success }) => success,
        other => panic!("expected AUTH_SUCCESS, got {other:?}"),
    }
}

async fn expect_file_error(
    peer: &mut TestPeer,
    servers: &[Address],
    op: FilePayload,
    needle: &str,
) {
    peer.request(servers, Payload::File(op)).await.unwrap();
    match peer.recv(WAIT).await.expect("error reply").payload {
        Payload::Client(ClientPayload::Error { error }) => assert_eq!(error, needle),
        other => panic!("expected CLIENT/ERROR, got {other:?}"),
    }
}

fn watched(path: &str) -> FilePayload {
    FilePayload::Watched {
        path: path.to_owned(),
    }
}

#[tokio::test]
async fn shipped_credentials_authenticate() {
    let server = start_server(None).await;
    let mut peer = TestPeer::bind().await;
    let servers = knock(&mut peer, &server.addr).await;
    assert!(auth(&mut peer, &servers, "sar", "sar").await);
}

#[tokio::test]
async fn wrong_password_is_rejected() {
    let server = start_server(None).await;
    let mut peer = TestPeer::bind().await;
    let servers = knock(&mut peer, &server.addr).await;
    assert!(!auth(&mut peer, &servers, "sar", "wrong").await);

    // the failed record still exists server-side, at the rejected level:
    // operations stay forbidden
    expect_file_error(
        &mut peer,
        &servers,
        watched("docs"),
        "permission denied: not allowed",
    )
    .await;
}

#[tokio::test]
async fn anonymous_is_admitted_but_cannot_write() {
    let server = start_server(None).await;
    let mut peer = TestPeer::bind().await;
    let servers = knock(&mut peer, &server.addr).await;
    assert!(auth(&mut peer, &servers, "anonymous", "whatever").await);

    expect_file_error(
        &mut peer,
        &servers,
        watched("docs"),
        "permission denied: not allowed",
    )
    .await;
    assert!(!server.storage.path().join("root/docs").exists());
}

#[tokio::test]
async fn unknown_client_is_refused() {
    let server = start_server(None).await;
    let mut peer = TestPeer::bind().await;
    let servers = knock(&mut peer, &server.addr).await;

    // no AUTH at all
    expect_file_error(
        &mut peer,
        &servers,
        watched("docs"),
        "permission denied: unknown client",
    )
    .await;
    assert!(!server.storage.path().join("root/docs").exists());
}

#[tokio::test]
async fn credential_file_replaces_the_directory() {
    let server = start_server(Some("[users]\nalice = \"secret\"\n")).await;
    let mut peer = TestPeer::bind().await;
    let servers = knock(&mut peer, &server.addr).await;

    assert!(auth(&mut peer, &servers, "alice", "secret").await);

    let mut other = TestPeer::bind().await;
    let servers = knock(&mut other, &server.addr).await;
    assert!(
        !auth(&mut other, &servers, "sar", "sar").await,
        "shipped credentials are gone once a file is supplied"
    );
}
