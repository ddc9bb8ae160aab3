//! Acknowledgement deadlines: a silent server fails the operation.

use std::time::Duration;

use client::{ClientConfig, ClientError, ClientNode};
use rm_comm::CommError;
use rm_protocol::{Address, FilePayload, Payload};
use rm_test_utils::TestPeer;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// A listener that accepts connections and never answers -- the server that
/// "silently drops" requests.
async fn silent_server() -> Address {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = Address::new("127.0.0.1", listener.local_addr().unwrap().port());
    tokio::spawn(async move {
        let mut conns = Vec::new();
        loop {
            if let Ok((stream, _)) = listener.accept().await {
                conns.push(stream);
            }
        }
    });
    addr
}

/// A request that is never acknowledged expires on tick and its pending
/// entry is gone afterwards.
#[tokio::test]
async fn unacknowledged_request_times_out() {
    let server = silent_server().await;
    let mut peer = TestPeer::bind_with_timeout(Duration::from_millis(200)).await;

    peer.request(
        &[server],
        Payload::File(FilePayload::Modified {
            src_path: "a.txt".to_owned(),
            is_directory: false,
            new_content: Some(b"unheard".to_vec()),
        }),
    )
    .await
    .unwrap();
    assert!(peer.comm.is_awaiting_ack());

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timeout should have fired by now"
        );
        match peer.comm.tick() {
            Ok(()) => tokio::time::sleep(Duration::from_millis(20)).await,
            Err(CommError::AckTimeout(_)) => break,
            Err(other) => panic!("expected AckTimeout, got {other:?}"),
        }
    }
    assert!(!peer.comm.is_awaiting_ack(), "expired entry must be removed");
}

/// The client runtime treats an expired handshake as fatal: `run` returns
/// the timeout error (the binary then exits non-zero).
#[tokio::test]
async fn client_session_dies_on_ack_timeout() {
    let server = silent_server().await;
    let mut cfg = ClientConfig::new(server);
    cfg.ack_timeout = Duration::from_millis(200);

    let (mut node, _status) = ClientNode::start(cfg).await.unwrap();
    node.connect().await.expect("the knock itself still sends");

    let (_shutdown, shutdown_rx) = watch::channel(false);
    let outcome = tokio::time::timeout(Duration::from_secs(3), node.run(shutdown_rx))
        .await
        .expect("run should return once the deadline passes");
    match outcome {
        Err(ClientError::Comm(CommError::AckTimeout(_))) => {}
        other => panic!("expected a fatal ack timeout, got {other:?}"),
    }
}
