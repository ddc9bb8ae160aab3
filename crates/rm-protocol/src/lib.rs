// rm-protocol: Wire format and message model for the mirroring group.
//
// Every message on the wire is one self-delimiting value tree (see `wire`);
// the typed message layer (`message`) maps (topic, command) pairs onto enum
// variants and validates params on receive, so nothing downstream touches
// raw value trees.

pub mod message;
pub mod value;
pub mod wire;

pub use message::{
    AckMeta, Address, BroadcastMeta, ClientPayload, FilePayload, Message, MessageId, Meta,
    OriginMeta, Payload, ProtocolError, ReplicationPayload, Topic,
};
pub use value::Value;
pub use wire::WireError;
