// client: Watches local directories and streams every change to the group.
//
// The node walks started -> connecting -> authenticating -> running, then
// feeds filesystem events through a FIFO queue with at most one operation in
// flight -- that single rule is what gives every replica the same per-client
// order of effects.

pub mod config;
pub mod node;
pub mod watcher;

pub use config::ClientConfig;
pub use node::{ClientError, ClientNode, ClientState, ClientStatus};
pub use watcher::FsEvent;

use tokio::sync::watch;
use tracing::info;

/// Start a client from `cfg` and drive it until shutdown or a fatal error.
pub async fn run(cfg: ClientConfig, shutdown: watch::Receiver<bool>) -> Result<(), ClientError> {
    let (mut node, _status) = ClientNode::start(cfg).await?;
    info!(addr = %node.local_addr(), "client ready");
    node.connect().await?;
    node.run(shutdown).await
}
