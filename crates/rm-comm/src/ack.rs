//! Request/response discipline on top of reliable broadcast.
//!
//! Outgoing requests are stamped with a correlation id and tracked against a
//! deadline; replies carry `for_message_id` and release the pending entry.
//! Because the pending entry is consumed exactly once, the duplicates that
//! eager forwarding produces at the broadcast layer cannot cause duplicate
//! application effects -- the second copy finds no entry and is dropped as
//! stale. This is where at-least-once transport becomes at-most-once
//! delivery to the application.

use std::collections::VecDeque;
use std::time::Duration;

use rm_protocol::{AckMeta, Address, ClientPayload, Message, Payload};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::broadcast::Broadcaster;
use crate::CommError;

pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(10);

pub struct AckManager {
    broadcaster: Broadcaster,
    timeout: Duration,
    next_ack_id: u64,
    // insertion order equals deadline order because the timeout is fixed
    pending: VecDeque<(u64, Instant)>,
}

impl AckManager {
    /// Bind the full stack on `addr`.
    pub async fn bind(
        addr: Address,
        timeout: Duration,
    ) -> Result<(Self, mpsc::Receiver<Message>), CommError> {
        let (broadcaster, rx) = Broadcaster::bind(addr).await?;
        Ok((
            AckManager {
                broadcaster,
                timeout,
                next_ack_id: 0,
                pending: VecDeque::new(),
            },
            rx,
        ))
    }

    pub fn local(&self) -> &Address {
        self.broadcaster.local()
    }

    /// True while any request is still waiting for its acknowledgement.
    /// Callers with ordering requirements gate their next send on this.
    pub fn is_awaiting_ack(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Broadcast `message`, optionally registering an acknowledgement
    /// deadline for it.
    pub async fn r_broadcast(
        &mut self,
        to: &[Address],
        mut message: Message,
        expect_ack: bool,
    ) -> Result<(), CommError> {
        if expect_ack {
            let id = self.next_ack_id;
            self.next_ack_id += 1;
            message.meta.ack = Some(AckMeta::Expect { message_id: id });
            self.broadcaster.r_broadcast(to, message).await?;
            self.pending.push_back((id, Instant::now() + self.timeout));
        } else {
            self.broadcaster.r_broadcast(to, message).await?;
        }
        Ok(())
    }

    /// Acknowledge `request` with a bare `CLIENT/ACK`.
    pub async fn acknowledge(&mut self, request: &Message) -> Result<(), CommError> {
        self.acknowledge_with_message(Message::new(Payload::Client(ClientPayload::Ack)), request)
            .await
    }

    /// Acknowledge `request` with a reply that carries its own payload; the
    /// reply doubles as the ack.
    pub async fn acknowledge_with_message(
        &mut self,
        mut reply: Message,
        request: &Message,
    ) -> Result<(), CommError> {
        let origin = request.origin().ok_or(CommError::MissingOrigin)?.clone();
        let Some(AckMeta::Expect { message_id }) = request.meta.ack else {
            return Err(CommError::MissingAckMeta);
        };
        reply.meta.ack = Some(AckMeta::AckFor {
            for_message_id: message_id,
        });
        self.broadcaster.r_broadcast(&[origin], reply).await
    }

    /// Expire overdue pending entries. Call once per scheduler turn; an
    /// expiry fails the whole operation the entry belonged to.
    pub fn tick(&mut self) -> Result<(), CommError> {
        while let Some(&(id, deadline)) = self.pending.front() {
            if deadline > Instant::now() {
                break;
            }
            self.pending.pop_front();
            return Err(CommError::AckTimeout(id));
        }
        Ok(())
    }

    /// Run the receive path on one inbound message.
    ///
    /// Broadcast-layer filtering happens first (echo/duplicate drop plus
    /// eager re-forward); then the ack policy decides what travels upward:
    /// plain messages and first-time requests pass through, replies release
    /// their pending entry and pass through unless they are the bare ACK,
    /// stale replies are dropped.
    pub async fn deliver(&mut self, message: Message) -> Option<Message> {
        let message = self.broadcaster.r_deliver(message).await?;
        match message.meta.ack {
            None | Some(AckMeta::Expect { .. }) => Some(message),
            Some(AckMeta::AckFor { for_message_id }) => {
                if self.release(for_message_id) {
                    if matches!(message.payload, Payload::Client(ClientPayload::Ack)) {
                        None
                    } else {
                        Some(message)
                    }
                } else {
                    debug!(id = for_message_id, "stale acknowledgement dropped");
                    None
                }
            }
        }
    }

    fn release(&mut self, id: u64) -> bool {
        match self.pending.iter().position(|(pending, _)| *pending == id) {
            Some(index) => {
                self.pending.remove(index);
                true
            }
            None => false,
        }
    }
}
