// server: One replica of the mirroring group.
//
// Holds a full copy of every watched tree under its storage root, applies
// every client operation delivered through the group communication stack,
// and takes part in the membership protocol so new replicas can join a
// running group.

pub mod config;
pub mod node;
pub mod storage;
pub mod users;

pub use config::ServerConfig;
pub use node::{NodeStatus, ServerError, ServerNode, ServerState};

use tokio::sync::watch;
use tracing::info;

/// Start a replica from `cfg` and drive it until shutdown or a fatal error.
///
/// The first server of a group runs immediately; with `join` set the node
/// performs the join handshake against the given leader before serving.
pub async fn run(cfg: ServerConfig, shutdown: watch::Receiver<bool>) -> Result<(), ServerError> {
    let join = cfg.join.clone();
    let (mut node, _status) = ServerNode::start(cfg).await?;
    info!(addr = %node.local_addr(), "server listening");
    if let Some(leader) = join {
        node.connect(&leader).await?;
    }
    node.run(shutdown).await
}
