//! Client configuration, assembled from the command line.

use std::path::PathBuf;
use std::time::Duration;

use rm_comm::ack::DEFAULT_ACK_TIMEOUT;
use rm_protocol::Address;

/// Default identity when no credentials are supplied; servers grant it the
/// lowest non-rejected level, which cannot drive file operations.
pub const ANONYMOUS_USERNAME: &str = "anonymous";

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// First server to knock on; the rest of the group is learned from it.
    pub server: Address,
    /// Local bind address. The default takes an ephemeral port on loopback;
    /// point the host somewhere routable when servers run on other machines,
    /// because replies are addressed to it.
    pub bind: Address,
    pub username: String,
    pub password: String,
    /// Directories to mirror, registered once authentication succeeds.
    pub watch_dirs: Vec<PathBuf>,
    pub ack_timeout: Duration,
}

impl ClientConfig {
    pub fn new(server: Address) -> Self {
        ClientConfig {
            server,
            bind: Address::new("127.0.0.1", 0),
            username: ANONYMOUS_USERNAME.to_owned(),
            password: String::new(),
            watch_dirs: Vec::new(),
            ack_timeout: DEFAULT_ACK_TIMEOUT,
        }
    }
}
