//! The client node: lifecycle state machine and the outbound queue.
//!
//! Filesystem events enqueue without waiting; the queue drains strictly in
//! FIFO order with at most one operation in flight, gated on the ack
//! manager. Combined with the broadcast layer's per-sender ordering this
//! yields the same per-client order of file effects on every replica.

use std::collections::VecDeque;

use notify::RecommendedWatcher;
use rm_comm::{AckManager, CommError};
use rm_protocol::{Address, ClientPayload, FilePayload, Message, Payload};
use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, MissedTickBehavior};
use tracing::{info, warn};

use crate::config::ClientConfig;
use crate::watcher::{self, FsEvent};

const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Client lifecycle: linear, no back-edges; failures terminate the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Started,
    Connecting,
    Authenticating,
    Running,
}

/// Snapshot published on every state or server-list change.
#[derive(Debug, Clone)]
pub struct ClientStatus {
    pub state: ClientState,
    pub servers: Vec<Address>,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("communication: {0}")]
    Comm(#[from] CommError),
    #[error("credentials rejected by the group")]
    AuthRejected,
    #[error("watcher: {0}")]
    Watch(#[from] notify::Error),
    #[error("watch path {0:?} has no directory name")]
    BadWatchDir(std::path::PathBuf),
    #[error("{command} not valid in state {state:?}")]
    UnexpectedMessage {
        command: &'static str,
        state: ClientState,
    },
}

pub struct ClientNode {
    cfg: ClientConfig,
    comm: AckManager,
    inbox: mpsc::Receiver<Message>,
    state: ClientState,
    servers: Vec<Address>,
    queue: VecDeque<FilePayload>,
    event_tx: mpsc::UnboundedSender<FsEvent>,
    events: mpsc::UnboundedReceiver<FsEvent>,
    // kept alive for as long as the node runs; dropping one stops its dir
    watchers: Vec<RecommendedWatcher>,
    status: watch::Sender<ClientStatus>,
}

impl ClientNode {
    pub async fn start(
        cfg: ClientConfig,
    ) -> Result<(Self, watch::Receiver<ClientStatus>), ClientError> {
        let (comm, inbox) = AckManager::bind(cfg.bind.clone(), cfg.ack_timeout).await?;
        let (event_tx, events) = mpsc::unbounded_channel();
        let (status, status_rx) = watch::channel(ClientStatus {
            state: ClientState::Started,
            servers: Vec::new(),
        });
        Ok((
            ClientNode {
                cfg,
                comm,
                inbox,
                state: ClientState::Started,
                servers: Vec::new(),
                queue: VecDeque::new(),
                event_tx,
                events,
                watchers: Vec::new(),
                status,
            },
            status_rx,
        ))
    }

    pub fn local_addr(&self) -> &Address {
        self.comm.local()
    }

    /// Handle on the event channel the watchers feed; anything sent here
    /// enters the outbound queue as if the OS had reported it.
    pub fn event_sender(&self) -> mpsc::UnboundedSender<FsEvent> {
        self.event_tx.clone()
    }

    /// Knock on the configured server to request the group's server list.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        if self.state != ClientState::Started {
            return Err(ClientError::UnexpectedMessage {
                command: "connect",
                state: self.state,
            });
        }
        info!(server = %self.cfg.server, "connecting");
        let knock = Message::new(Payload::Client(ClientPayload::Knock));
        self.comm
            .r_broadcast(&[self.cfg.server.clone()], knock, true)
            .await?;
        self.set_state(ClientState::Connecting);
        Ok(())
    }

    /// Drive the node until shutdown or a fatal error. Ack timeouts are
    /// fatal: the session has lost its one in-flight request.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), ClientError> {
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
                    self.comm.tick()?;
                    self.drain().await?;
                }
                Some(event) = self.events.recv() => {
                    self.enqueue(event);
                }
                inbound = self.inbox.recv() => {
                    let Some(raw) = inbound else { return Ok(()) };
                    if let Some(message) = self.comm.deliver(raw).await {
                        self.handle(message).await?;
                    }
                }
            }
        }
    }

    fn set_state(&mut self, state: ClientState) {
        info!(from = ?self.state, to = ?state, "state changed");
        self.state = state;
        self.publish_status();
    }

    fn publish_status(&self) {
        let _ = self.status.send(ClientStatus {
            state: self.state,
            servers: self.servers.clone(),
        });
    }

    fn enqueue(&mut self, event: FsEvent) {
        self.queue.push_back(event.into());
    }

    /// Pop the queue head when nothing is in flight and broadcast it to the
    /// whole group.
    async fn drain(&mut self) -> Result<(), ClientError> {
        if self.state != ClientState::Running || self.comm.is_awaiting_ack() {
            return Ok(());
        }
        let Some(op) = self.queue.pop_front() else {
            return Ok(());
        };
        let message = Message::new(Payload::File(op));
        info!(command = message.command(), "sending file operation");
        let servers = self.servers.clone();
        self.comm.r_broadcast(&servers, message, true).await?;
        Ok(())
    }

    async fn handle(&mut self, message: Message) -> Result<(), ClientError> {
        match message.payload {
            Payload::Client(ClientPayload::SetServers { servers }) => {
                if self.state != ClientState::Connecting {
                    return Err(ClientError::UnexpectedMessage {
                        command: "client/set_servers",
                        state: self.state,
                    });
                }
                info!(count = servers.len(), "received server list");
                self.servers = servers;
                self.publish_status();
                self.authenticate().await
            }
            Payload::Client(ClientPayload::AuthSuccess { success }) => {
                if self.state != ClientState::Authenticating {
                    return Err(ClientError::UnexpectedMessage {
                        command: "client/auth_success",
                        state: self.state,
                    });
                }
                if !success {
                    return Err(ClientError::AuthRejected);
                }
                info!("authenticated");
                self.set_state(ClientState::Running);
                self.register_watches()
            }
            Payload::Client(ClientPayload::AddServer { server }) => {
                if !self.servers.contains(&server) {
                    info!(server = %server, "new server joined the group");
                    self.servers.push(server);
                    self.publish_status();
                }
                Ok(())
            }
            Payload::Client(ClientPayload::Error { error }) => {
                // replied errors already released the in-flight request;
                // the session itself goes on
                warn!(error = %error, "server reported an error");
                Ok(())
            }
            other => {
                warn!(
                    topic = %other.topic(),
                    command = other.command(),
                    "unexpected message"
                );
                Ok(())
            }
        }
    }

    /// Send credentials to every server in the freshly-learned list, so each
    /// replica records this client itself.
    async fn authenticate(&mut self) -> Result<(), ClientError> {
        info!(user = %self.cfg.username, "authenticating");
        let auth = Message::new(Payload::Client(ClientPayload::Auth {
            username: self.cfg.username.clone(),
            password: self.cfg.password.clone(),
        }));
        let servers = self.servers.clone();
        self.comm.r_broadcast(&servers, auth, true).await?;
        self.set_state(ClientState::Authenticating);
        Ok(())
    }

    /// Attach a watcher per configured directory and announce each one.
    fn register_watches(&mut self) -> Result<(), ClientError> {
        for dir in self.cfg.watch_dirs.clone() {
            let name = watcher::watch_name(&dir).ok_or(ClientError::BadWatchDir(dir.clone()))?;
            let handle = watcher::watch_dir(&dir, self.event_tx.clone())?;
            self.watchers.push(handle);
            info!(dir = %dir.display(), as_path = %name, "watching directory");
            self.queue.push_back(FilePayload::Watched { path: name });
        }
        Ok(())
    }
}
