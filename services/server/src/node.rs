//! The replica node: lifecycle state machine, message dispatch, membership.
//!
//! A node is driven by a single select loop -- inbound messages, the
//! timeout tick, and shutdown. All state lives on this task; the layers
//! below only ever hand it complete, validated messages.

use std::collections::HashMap;

use rm_comm::{AckManager, CommError};
use rm_protocol::{
    Address, ClientPayload, FilePayload, Message, Payload, ReplicationPayload,
};
use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, MissedTickBehavior};
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::storage::{Storage, StorageError};
use crate::users::{AccessLevel, UserDirectory, UsersError};

const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Replica lifecycle. The first server of a group starts in `Running`;
/// a joiner walks the whole chain and any failure on the way is fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Started,
    Connecting,
    Joining,
    Running,
}

/// Snapshot published on every state or membership change.
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub state: ServerState,
    pub servers: Vec<Address>,
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("communication: {0}")]
    Comm(#[from] CommError),
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
    #[error("credentials: {0}")]
    Users(#[from] UsersError),
    #[error("{command} not valid in state {state:?}")]
    UnexpectedMessage {
        command: &'static str,
        state: ServerState,
    },
}

pub struct ServerNode {
    comm: AckManager,
    inbox: mpsc::Receiver<Message>,
    state: ServerState,
    servers: Vec<Address>,
    clients: HashMap<Address, AccessLevel>,
    storage: Storage,
    users: UserDirectory,
    status: watch::Sender<NodeStatus>,
}

impl ServerNode {
    /// Bind the communication stack and open the mirrored tree.
    ///
    /// Also returns a watch on the node's state and server list, which is
    /// what the membership tests (and any future UI) observe.
    pub async fn start(
        cfg: ServerConfig,
    ) -> Result<(Self, watch::Receiver<NodeStatus>), ServerError> {
        let storage = Storage::open(&cfg.storage_dir)?;
        let users = match &cfg.users_file {
            Some(path) => UserDirectory::from_toml_file(path)?,
            None => UserDirectory::default(),
        };
        let (comm, inbox) = AckManager::bind(cfg.address, cfg.ack_timeout).await?;

        // a joiner holds off on everything until INITIALIZE replaces its
        // world view; the group founder serves immediately
        let (state, servers) = if cfg.join.is_some() {
            (ServerState::Started, Vec::new())
        } else {
            (ServerState::Running, vec![comm.local().clone()])
        };
        info!(state = ?state, "server node starting");

        let (status, status_rx) = watch::channel(NodeStatus {
            state,
            servers: servers.clone(),
        });
        Ok((
            ServerNode {
                comm,
                inbox,
                state,
                servers,
                clients: HashMap::new(),
                storage,
                users,
                status,
            },
            status_rx,
        ))
    }

    pub fn local_addr(&self) -> &Address {
        self.comm.local()
    }

    /// Ask `leader` for the group snapshot; the join continues when
    /// INITIALIZE arrives and aborts if the ack deadline passes first.
    pub async fn connect(&mut self, leader: &Address) -> Result<(), ServerError> {
        if self.state != ServerState::Started {
            return Err(ServerError::UnexpectedMessage {
                command: "connect",
                state: self.state,
            });
        }
        info!(leader = %leader, "connecting to server group");
        let message = Message::new(Payload::Replication(ReplicationPayload::Connect));
        self.comm
            .r_broadcast(&[leader.clone()], message, true)
            .await?;
        self.set_state(ServerState::Connecting);
        Ok(())
    }

    /// Drive the node until shutdown or a fatal error.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), ServerError> {
        let mut tick = tokio::time::interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    // a dropped sender also means the owner is gone
                    if changed.is_err() || *shutdown.borrow() {
                        info!("shutting down");
                        return Ok(());
                    }
                }
                _ = tick.tick() => {
                    // pending acks only exist during a join, so an expiry
                    // always means the join failed
                    self.comm.tick()?;
                }
                inbound = self.inbox.recv() => {
                    let Some(raw) = inbound else { return Ok(()) };
                    if let Some(message) = self.comm.deliver(raw).await {
                        self.route(message).await?;
                    }
                }
            }
        }
    }

    fn set_state(&mut self, state: ServerState) {
        info!(from = ?self.state, to = ?state, "state changed");
        self.state = state;
        self.publish_status();
    }

    fn publish_status(&self) {
        let _ = self.status.send(NodeStatus {
            state: self.state,
            servers: self.servers.clone(),
        });
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    async fn route(&mut self, message: Message) -> Result<(), ServerError> {
        match &message.payload {
            Payload::Client(ClientPayload::Knock) => self.on_knock(&message).await,
            Payload::Client(ClientPayload::Auth { username, password }) => {
                self.on_auth(&message, username, password).await
            }
            Payload::Replication(ReplicationPayload::Connect) => {
                self.on_replica_connect(&message).await
            }
            Payload::Replication(ReplicationPayload::Initialize { servers, clients }) => {
                self.on_initialize(servers.clone(), clients.clone()).await
            }
            Payload::Replication(ReplicationPayload::AddServer { server }) => {
                self.on_replica_added(server.clone());
                Ok(())
            }
            Payload::File(op) => self.on_file(&message, op).await,
            other => {
                warn!(
                    topic = %other.topic(),
                    command = other.command(),
                    "no handler for message"
                );
                self.reply_error(
                    &message,
                    format!("not implemented: {}/{}", other.topic(), other.command()),
                )
                .await;
                Ok(())
            }
        }
    }

    async fn on_knock(&mut self, request: &Message) -> Result<(), ServerError> {
        if let Some(client) = request.origin() {
            info!(client = %client, "client knocked");
        }
        let reply = Message::new(Payload::Client(ClientPayload::SetServers {
            servers: self.servers.clone(),
        }));
        self.reply(request, reply).await;
        Ok(())
    }

    async fn on_auth(
        &mut self,
        request: &Message,
        username: &str,
        password: &str,
    ) -> Result<(), ServerError> {
        let Some(client) = request.origin().cloned() else {
            warn!("auth request without origin");
            return Ok(());
        };
        let level = self.users.check(username, password);
        info!(client = %client, user = username, level = ?level, "client authenticating");
        self.clients.insert(client, level);
        let reply = Message::new(Payload::Client(ClientPayload::AuthSuccess {
            success: level != AccessLevel::Unauthenticated,
        }));
        self.reply(request, reply).await;
        Ok(())
    }

    async fn on_replica_connect(&mut self, request: &Message) -> Result<(), ServerError> {
        if let Some(joiner) = request.origin() {
            info!(joiner = %joiner, "connection request from new server");
        }
        let clients = self
            .clients
            .iter()
            .map(|(addr, level)| (addr.clone(), level.as_wire()))
            .collect();
        let reply = Message::new(Payload::Replication(ReplicationPayload::Initialize {
            servers: self.servers.clone(),
            clients,
        }));
        info!("initializing new server");
        self.reply(request, reply).await;
        Ok(())
    }

    async fn on_initialize(
        &mut self,
        servers: Vec<Address>,
        clients: Vec<(Address, i64)>,
    ) -> Result<(), ServerError> {
        if self.state != ServerState::Connecting {
            return Err(ServerError::UnexpectedMessage {
                command: "replication/initialize",
                state: self.state,
            });
        }
        self.servers = servers;
        self.clients = clients
            .into_iter()
            .filter_map(|(addr, level)| match AccessLevel::from_wire(level) {
                Some(level) => Some((addr, level)),
                None => {
                    warn!(client = %addr, level, "unknown access level in snapshot, dropping");
                    None
                }
            })
            .collect();
        info!(
            servers = ?self.servers.iter().map(ToString::to_string).collect::<Vec<_>>(),
            clients = self.clients.len(),
            "initialized from group snapshot"
        );
        self.set_state(ServerState::Joining);
        self.introduce().await
    }

    /// Announce this replica to every known client and server, then serve.
    async fn introduce(&mut self) -> Result<(), ServerError> {
        info!("joining server group");
        let own = self.local_addr().clone();

        // sent individually: a shared recipient set would make the clients
        // forward to each other
        let client_note = Message::new(Payload::Client(ClientPayload::AddServer {
            server: own.clone(),
        }));
        for client in self.clients.keys().cloned().collect::<Vec<_>>() {
            if let Err(e) = self
                .comm
                .r_broadcast(&[client.clone()], client_note.clone(), false)
                .await
            {
                warn!(client = %client, error = %e, "failed to introduce to client");
            }
        }

        let peers = self.servers.clone();
        let server_note = Message::new(Payload::Replication(ReplicationPayload::AddServer {
            server: own.clone(),
        }));
        self.comm.r_broadcast(&peers, server_note, false).await?;

        self.servers.push(own);
        self.set_state(ServerState::Running);
        Ok(())
    }

    fn on_replica_added(&mut self, server: Address) {
        if self.servers.contains(&server) {
            return;
        }
        info!(server = %server, "attaching new server to group");
        self.servers.push(server);
        self.publish_status();
    }

    async fn on_file(&mut self, request: &Message, op: &FilePayload) -> Result<(), ServerError> {
        if !self
            .enforce_authorization(request, AccessLevel::Authorized)
            .await
        {
            return Ok(());
        }
        match self.storage.apply(op) {
            Ok(()) => self.ack(request).await,
            Err(e) => {
                warn!(command = request.command(), error = %e, "file effect failed");
                self.reply_error(request, e.to_string()).await;
            }
        }
        Ok(())
    }

    /// Gate a handler on the client's access level; on refusal the error
    /// reply doubles as the ack and the session continues.
    async fn enforce_authorization(&mut self, request: &Message, min: AccessLevel) -> bool {
        let Some(client) = request.origin().cloned() else {
            warn!("request without origin");
            return false;
        };
        match self.clients.get(&client) {
            None => {
                self.reply_error(request, "permission denied: unknown client".to_owned())
                    .await;
                false
            }
            Some(level) if *level < min => {
                self.reply_error(request, "permission denied: not allowed".to_owned())
                    .await;
                false
            }
            Some(_) => true,
        }
    }

    // -----------------------------------------------------------------------
    // Replies -- failures here mean the requester is gone, which is its
    // problem, not the group's; log and carry on.
    // -----------------------------------------------------------------------

    async fn ack(&mut self, request: &Message) {
        if let Err(e) = self.comm.acknowledge(request).await {
            warn!(error = %e, "failed to acknowledge");
        }
    }

    async fn reply(&mut self, request: &Message, reply: Message) {
        if let Err(e) = self.comm.acknowledge_with_message(reply, request).await {
            warn!(error = %e, "failed to reply");
        }
    }

    async fn reply_error(&mut self, request: &Message, error: String) {
        let reply = Message::new(Payload::Client(ClientPayload::Error { error }));
        self.reply(request, reply).await;
    }
}
