//! A bare protocol peer: the full comm stack plus its inbound receiver.
//!
//! Suites use it to play the client (or a server) at the message level --
//! send requests, watch what comes back up through the delivery policy, and
//! drive ticks by hand.

use std::time::Duration;

use rm_comm::ack::DEFAULT_ACK_TIMEOUT;
use rm_comm::{AckManager, CommError};
use rm_protocol::{Address, Message, Payload};
use tokio::sync::mpsc;

pub struct TestPeer {
    pub comm: AckManager,
    inbox: mpsc::Receiver<Message>,
}

impl TestPeer {
    pub async fn bind() -> Self {
        Self::bind_with_timeout(DEFAULT_ACK_TIMEOUT).await
    }

    pub async fn bind_with_timeout(timeout: Duration) -> Self {
        let (comm, inbox) = AckManager::bind(Address::new("127.0.0.1", 0), timeout)
            .await
            .expect("failed to bind test peer");
        TestPeer { comm, inbox }
    }

    pub fn addr(&self) -> Address {
        self.comm.local().clone()
    }

    /// Broadcast `payload` to `to` expecting an acknowledgement.
    pub async fn request(&mut self, to: &[Address], payload: Payload) -> Result<(), CommError> {
        self.comm
            .r_broadcast(to, Message::new(payload), true)
            .await
    }

    /// Broadcast `payload` to `to` without registering a deadline.
    pub async fn send(&mut self, to: &[Address], payload: Payload) -> Result<(), CommError> {
        self.comm
            .r_broadcast(to, Message::new(payload), false)
            .await
    }

    /// Next message the stack delivers upward within `timeout`.
    ///
    /// Raw inbound traffic keeps being processed the whole time, so acks
    /// release pending entries and duplicates are dropped even when this
    /// returns `None`.
    pub async fn recv(&mut self, timeout: Duration) -> Option<Message> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let raw = tokio::time::timeout_at(deadline, self.inbox.recv())
                .await
                .ok()??;
            if let Some(message) = self.comm.deliver(raw).await {
                return Some(message);
            }
        }
    }

    /// Process inbound traffic until no request is pending; `false` when
    /// `timeout` passes first.
    pub async fn settle(&mut self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.comm.is_awaiting_ack() {
            match tokio::time::timeout_at(deadline, self.inbox.recv()).await {
                Ok(Some(raw)) => {
                    let _ = self.comm.deliver(raw).await;
                }
                _ => return !self.comm.is_awaiting_ack(),
            }
        }
        true
    }
}
