//! rusty-mirror: replicated file mirroring over a reliable-broadcast group.
//!
//! The workspace members do the actual work -- `rm-protocol` (wire format and
//! message model), `rm-comm` (transport / reliable broadcast / ack manager),
//! and the `server` and `client` services. This root crate exists to host
//! the end-to-end suites under `tests/integration/`.
