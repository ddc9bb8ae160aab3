//! Path-escape attempts are refused before touching disk.

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

async fn start_server() -> TestServer {
    let storage = tempfile::tempdir().unwrap();
    // the mirrored tree lives one level down so escapes into the outer
    // tempdir are observable
    let root = storage.path().join("root");
    let cfg = ServerConfig::new(Address::new("127.0.0.1", 0), root);
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

async fn authed_peer(server: &Address) -> (TestPeer, Vec<Address>) {
    let mut peer = TestPeer::bind().await;
    peer.request(&[server.clone()], Payload::Client(ClientPayload::Knock))
        .await
        .unwrap();
    let servers = match peer.recv(WAIT).await.expect("SET_SERVERS").payload {
        Payload::Client(ClientPayload::SetServers { servers }) => servers,
        other => panic!("expected SET_SERVERS, got {other:?}"),
    };
    peer.request(
        &servers,
        Payload::Client(ClientPayload::Auth {
            username: "sar".to_owned(),
            password: "sar".to_owned(),
        }),
    )
    .await
    .unwrap();
    match peer.recv(WAIT).await.expect("AUTH_SUCCESS").payload {
        Payload::Client(ClientPayload::AuthSuccess { success }) => assert!(success),
        other => panic!("expected AUTH_SUCCESS, got {other:?}"),
    }
    (peer, servers)
}

async fn expect_error(peer: &mut TestPeer, servers: &[Address], op: FilePayload, needle: &str) {
    peer.request(servers, Payload::File(op)).await.unwrap();
    let reply = peer.recv(WAIT).await.expect("an error reply should arrive");
    match reply.payload {
        Payload::Client(ClientPayload::Error { error }) => {
            assert_eq!(error, needle);
        }
        other => panic!("expected CLIENT/ERROR, got {other:?}"),
    }
}

/// `CREATED ../etc/passwd` is answered with a permission error and leaves
/// the filesystem untouched.
#[tokio::test]
async fn parent_escape_is_refused() {
    let server = start_server().await;
    let (mut peer, servers) = authed_peer(&server.addr).await;

    expect_error(
        &mut peer,
        &servers,
        FilePayload::Created {
            src_path: "../etc/passwd".to_owned(),
            is_directory: false,
        },
        "permission denied: bad path",
    )
    .await;

    assert!(
        !server.storage.path().join("etc").exists(),
        "nothing may be written outside the root"
    );
}

/// Escapes hidden behind legitimate-looking prefixes are caught as well.
#[tokio::test]
async fn nested_escape_is_refused() {
    let server = start_server().await;
    let (mut peer, servers) = authed_peer(&server.addr).await;

    expect_error(
        &mut peer,
        &servers,
        FilePayload::Watched {
            path: "docs/../../evil".to_owned(),
        },
        "permission denied: bad path",
    )
    .await;
    assert!(!server.storage.path().join("evil").exists());

    // absolute paths fall outside the root by definition
    expect_error(
        &mut peer,
        &servers,
        FilePayload::Created {
            src_path: "/tmp/evil".to_owned(),
            is_directory: false,
        },
        "permission denied: bad path",
    )
    .await;
}

/// A MOVED whose destination escapes is refused without moving the source.
#[tokio::test]
async fn move_destination_escape_is_refused() {
    let server = start_server().await;
    let (mut peer, servers) = authed_peer(&server.addr).await;

    peer.request(
        &servers,
        Payload::File(FilePayload::Created {
            src_path: "a.txt".to_owned(),
            is_directory: false,
        }),
    )
    .await
    .unwrap();
    assert!(peer.settle(WAIT).await);

    expect_error(
        &mut peer,
        &servers,
        FilePayload::Moved {
            src_path: "a.txt".to_owned(),
            dest_path: "../stolen.txt".to_owned(),
            is_directory: false,
        },
        "permission denied: bad path",
    )
    .await;

    assert!(server.storage.path().join("root/a.txt").is_file());
    assert!(!server.storage.path().join("stolen.txt").exists());
}
