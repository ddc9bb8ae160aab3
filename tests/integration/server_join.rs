//! Group membership: joining replicas, convergence, client discovery.
//!
//! # Coverage
//! - Join handshake: CONNECT -> INITIALIZE -> ADD_SERVER; both replicas end
//!   with the same membership set.
//! - A client running against the group is told about the new replica and
//!   subsequent operations land on every mirrored tree.

use std::collections::HashSet;
use std::time::Duration;

use rm_protocol::{Address, ClientPayload, FilePayload, Payload};
use rm_test_utils::{wait_for, TestPeer};
use server::{NodeStatus, ServerConfig, ServerNode, ServerState};
use tokio::sync::watch;

const WAIT: Duration = Duration::from_secs(3);

struct TestServer {
    addr: Address,
    storage: tempfile::TempDir,
    status: watch::Receiver<NodeStatus>,
    _shutdown: watch::Sender<bool>,
}

async fn start_server(join: Option<&Address>) -> TestServer {
    let storage = tempfile::tempdir().unwrap();
    let mut cfg = ServerConfig::new(Address::new("127.0.0.1", 0), storage.path());
    cfg.join = join.cloned();
    let (mut node, status) = ServerNode::start(cfg).await.expect("server start");
    let addr = node.local_addr().clone();
    if let Some(leader) = join {
        node.connect(leader).await.expect("join connect failed");
    }
    let (shutdown, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        node.run(shutdown_rx).await.expect("server error");
    });
    TestServer {
        addr,
        storage,
        status,
        _shutdown: shutdown,
    }
}

fn server_set(status: &watch::Receiver<NodeStatus>) -> HashSet<Address> {
    status.borrow().servers.iter().cloned().collect()
}

/// Scenario: S1 running, S2 starts with --join S1. Both replicas end up
/// holding the membership set {S1, S2}.
#[tokio::test]
async fn joiner_and_leader_converge_on_membership() {
    let s1 = start_server(None).await;
    let s2 = start_server(Some(&s1.addr)).await;

    assert!(
        wait_for(WAIT, || s2.status.borrow().state == ServerState::Running).await,
        "joiner should finish the handshake"
    );

    let expected: HashSet<Address> = [s1.addr.clone(), s2.addr.clone()].into_iter().collect();
    assert_eq!(server_set(&s2.status), expected);
    assert!(
        wait_for(WAIT, || server_set(&s1.status) == expected).await,
        "leader should learn about the joiner"
    );
}

/// Scenario: a client is told about a replica that joins later, and a
/// subsequent operation lands on both mirrored trees.
#[tokio::test]
async fn client_discovers_joining_replica() {
    let s1 = start_server(None).await;

    // client connects and authenticates while the group is just {S1}
    let mut peer = TestPeer::bind().await;
    peer.request(&[s1.addr.clone()], Payload::Client(ClientPayload::Knock))
        .await
        .unwrap();
    let mut servers = match peer.recv(WAIT).await.expect("SET_SERVERS").payload {
        Payload::Client(ClientPayload::SetServers { servers }) => servers,
        other => panic!("expected SET_SERVERS, got {other:?}"),
    };
    assert_eq!(servers, vec![s1.addr.clone()]);
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

    // S2 joins; its introduction is delivered to the client individually
    let s2 = start_server(Some(&s1.addr)).await;
    let note = peer.recv(WAIT).await.expect("ADD_SERVER should arrive");
    match note.payload {
        Payload::Client(ClientPayload::AddServer { server }) => {
            assert_eq!(server, s2.addr);
            servers.push(server);
        }
        other => panic!("expected ADD_SERVER, got {other:?}"),
    }

    // the next operations are broadcast to the grown group
    for op in [
        FilePayload::Watched {
            path: "docs".to_owned(),
        },
        FilePayload::Created {
            src_path: "docs/a.txt".to_owned(),
            is_directory: false,
        },
        FilePayload::Modified {
            src_path: "docs/a.txt".to_owned(),
            is_directory: false,
            new_content: Some(b"everywhere".to_vec()),
        },
    ] {
        peer.request(&servers, Payload::File(op)).await.unwrap();
        assert!(peer.settle(WAIT).await, "operation should be acknowledged");
    }

    for replica in [&s1, &s2] {
        let mirrored = replica.storage.path().join("docs/a.txt");
        assert!(
            wait_for(WAIT, || std::fs::read(&mirrored)
                .is_ok_and(|bytes| bytes == b"everywhere"))
            .await,
            "every replica must hold the bytes"
        );
    }
}

/// The group snapshot carries authenticated clients: a replica that joins
/// after AUTH can authorize that client's operations by itself.
#[tokio::test]
async fn joiner_inherits_the_client_map() {
    let s1 = start_server(None).await;

    let mut peer = TestPeer::bind().await;
    peer.request(&[s1.addr.clone()], Payload::Client(ClientPayload::Knock))
        .await
        .unwrap();
    let _ = peer.recv(WAIT).await.expect("SET_SERVERS");
    peer.request(
        &[s1.addr.clone()],
        Payload::Client(ClientPayload::Auth {
            username: "sar".to_owned(),
            password: "sar".to_owned(),
        }),
    )
    .await
    .unwrap();
    let _ = peer.recv(WAIT).await.expect("AUTH_SUCCESS");

    let s2 = start_server(Some(&s1.addr)).await;
    // consume the ADD_SERVER introduction
    let _ = peer.recv(WAIT).await.expect("ADD_SERVER");

    // an operation sent to the joiner alone must pass its authorization gate
    peer.request(
        &[s2.addr.clone()],
        Payload::File(FilePayload::Watched {
            path: "inherited".to_owned(),
        }),
    )
    .await
    .unwrap();
    assert!(peer.settle(WAIT).await, "joiner should acknowledge");
    assert!(s2.storage.path().join("inherited").is_dir());
}
