//! Server configuration, assembled from the command line.

use std::path::PathBuf;
use std::time::Duration;

use rm_comm::ack::DEFAULT_ACK_TIMEOUT;
use rm_protocol::Address;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind; doubles as this replica's identity in the group.
    pub address: Address,
    /// Root of the mirrored tree. Created if absent.
    pub storage_dir: PathBuf,
    /// Leader of an existing group to join; `None` starts a fresh group.
    pub join: Option<Address>,
    /// Optional TOML credential file replacing the compiled-in directory.
    pub users_file: Option<PathBuf>,
    pub ack_timeout: Duration,
}

impl ServerConfig {
    pub fn new(address: Address, storage_dir: impl Into<PathBuf>) -> Self {
        ServerConfig {
            address,
            storage_dir: storage_dir.into(),
            join: None,
            users_file: None,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
        }
    }
}
