// rm-comm: The three-tier group communication stack.
//
// transport  -- framed point-to-point delivery over short-lived TCP streams
// broadcast  -- reliable broadcast by eager forwarding at every receiver
// ack        -- request/response discipline with bounded-time acknowledgement
//
// Each layer stamps its own `meta` section on outgoing messages and consumes
// it on the way back up; params pass through untouched. A node owns one
// `AckManager` (which owns the layers beneath) plus the inbound receiver
// returned at bind time, and drives everything from a single select loop.

pub mod ack;
pub mod broadcast;
pub mod transport;

pub use ack::AckManager;
pub use broadcast::Broadcaster;
pub use transport::Transport;

use rm_protocol::Address;

/// Errors surfaced by the communication stack.
#[derive(Debug, thiserror::Error)]
pub enum CommError {
    #[error("peer {0} unreachable")]
    Unreachable(Address),
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("broadcast reached no recipients")]
    NoDeliveries,
    #[error("ack {0} timed out")]
    AckTimeout(u64),
    #[error("request carries no ack id to reply to")]
    MissingAckMeta,
    #[error("message carries no origin address")]
    MissingOrigin,
}
