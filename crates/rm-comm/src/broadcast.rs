//! Reliable broadcast by eager forwarding.
//!
//! Every receiver of a fresh message re-forwards it to the rest of the
//! recipient set before delivering it upward, so a message survives the
//! original sender crashing after reaching a strict subset. Duplicate
//! suppression keys on the broadcast [`MessageId`], which is minted once by
//! the originator and preserved by every hop -- the rewritten `sender` field
//! only names the last hop and must not participate in the key.

use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use rm_protocol::{Address, BroadcastMeta, Message, MessageId};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::transport::Transport;
use crate::CommError;

pub struct Broadcaster {
    transport: Transport,
    instance: u64,
    counter: u64,
    seen: HashSet<MessageId>,
}

impl Broadcaster {
    /// Bind the underlying transport and wrap it.
    pub async fn bind(addr: Address) -> Result<(Self, mpsc::Receiver<Message>), CommError> {
        let (transport, rx) = Transport::bind(addr).await?;
        let instance = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Ok((
            Broadcaster {
                transport,
                instance,
                counter: 0,
                seen: HashSet::new(),
            },
            rx,
        ))
    }

    pub fn local(&self) -> &Address {
        self.transport.local()
    }

    fn next_id(&mut self) -> MessageId {
        let id = MessageId {
            instance: self.instance,
            counter: self.counter,
        };
        self.counter += 1;
        id
    }

    /// Reliably broadcast `message` to `to`.
    ///
    /// Partial failures are logged and tolerated; zero successful sends is
    /// [`CommError::NoDeliveries`].
    pub async fn r_broadcast(
        &mut self,
        to: &[Address],
        mut message: Message,
    ) -> Result<(), CommError> {
        message.meta.broadcast = Some(BroadcastMeta {
            sender: self.local().clone(),
            message_id: self.next_id(),
            to: to.to_vec(),
        });
        if self.fan_out(to, &message).await == 0 {
            return Err(CommError::NoDeliveries);
        }
        Ok(())
    }

    /// Best-effort fan-out; returns the number of recipients reached.
    async fn fan_out(&self, to: &[Address], message: &Message) -> usize {
        let mut delivered = 0;
        for recipient in to {
            match self.transport.send(recipient, message.clone()).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(recipient = %recipient, error = %e, "broadcast partially failed");
                }
            }
        }
        delivered
    }

    /// Run the receive side of the protocol on one inbound message.
    ///
    /// Returns the message when it should be delivered upward; `None` for
    /// own echoes, duplicates, and frames missing broadcast metadata.
    pub async fn r_deliver(&mut self, mut message: Message) -> Option<Message> {
        let Some(meta) = message.meta.broadcast.as_mut() else {
            warn!(
                command = message.command(),
                "dropping message without broadcast metadata"
            );
            return None;
        };

        if meta.sender == *self.transport.local() {
            return None;
        }
        if !self.seen.insert(meta.message_id) {
            debug!(id = %meta.message_id, "duplicate broadcast dropped");
            return None;
        }

        // forward to everyone else before delivering, masking a crashed
        // original sender
        meta.sender = self.transport.local().clone();
        let others: Vec<Address> = meta
            .to
            .iter()
            .filter(|addr| *addr != self.transport.local())
            .cloned()
            .collect();
        if !others.is_empty() {
            self.fan_out(&others, &message).await;
        }
        Some(message)
    }
}
