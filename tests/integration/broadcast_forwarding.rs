//! Reliable broadcast under originator failure.
//!
//! Scenario: the originator reaches one member of a three-peer recipient
//! set and then "crashes" (never sends again). The eager re-forward at the
//! reached peer must get the message to everyone, and nobody may deliver it
//! more than once.

use std::time::Duration;

use rm_comm::Transport;
use rm_protocol::{
    Address, BroadcastMeta, ClientPayload, Message, MessageId, Payload,
};
use rm_test_utils::TestPeer;

/// Count how many times `peer` delivers upward within the window.
async fn count_deliveries(peer: &mut TestPeer) -> usize {
    let mut count = 0;
    // first wait is generous; once traffic dries up the loop exits fast
    while peer.recv(Duration::from_millis(800)).await.is_some() {
        count += 1;
    }
    count
}

#[tokio::test]
async fn partial_send_is_masked_by_eager_forwarding() {
    let mut a = TestPeer::bind().await;
    let mut b = TestPeer::bind().await;
    let mut c = TestPeer::bind().await;
    let recipients = vec![a.addr(), b.addr(), c.addr()];

    // the "crashing" originator: a bare transport that stamps the broadcast
    // metadata itself and reaches only peer A before going quiet
    let (originator, _rx) = Transport::bind(Address::new("127.0.0.1", 0))
        .await
        .unwrap();
    let mut message = Message::new(Payload::Client(ClientPayload::Error {
        error: "probe".to_owned(),
    }));
    message.meta.broadcast = Some(BroadcastMeta {
        sender: originator.local().clone(),
        message_id: MessageId {
            instance: 42,
            counter: 7,
        },
        to: recipients.clone(),
    });
    originator.send(&a.addr(), message).await.unwrap();
    drop(originator);

    // every peer delivers exactly once, despite A, B and C all re-forwarding
    assert_eq!(count_deliveries(&mut a).await, 1, "peer A");
    assert_eq!(count_deliveries(&mut b).await, 1, "peer B");
    assert_eq!(count_deliveries(&mut c).await, 1, "peer C");
}

/// Same wiring, but the originator is a live peer broadcasting normally:
/// still exactly-once everywhere, and no self-delivery at the sender.
#[tokio::test]
async fn full_broadcast_delivers_exactly_once_per_peer() {
    let mut a = TestPeer::bind().await;
    let mut b = TestPeer::bind().await;
    let mut c = TestPeer::bind().await;
    let recipients = vec![b.addr(), c.addr()];

    a.send(
        &recipients,
        Payload::Client(ClientPayload::Error {
            error: "probe".to_owned(),
        }),
    )
    .await
    .unwrap();

    assert_eq!(count_deliveries(&mut b).await, 1, "peer B");
    assert_eq!(count_deliveries(&mut c).await, 1, "peer C");
    assert_eq!(count_deliveries(&mut a).await, 0, "sender must not deliver");
}
