//! Typed message model: (topic, command) pairs as enum variants.
//!
//! Params are validated against the per-command schema on receive, so a
//! handler never sees a half-formed message. Middleware metadata (`meta`)
//! travels beside the params and is never mixed into them: the transport
//! stamps the origin, the broadcast layer stamps sender/id/recipients, the
//! ack manager stamps its correlation ids.

use std::fmt;
use std::str::FromStr;

use crate::value::Value;
use crate::wire::{self, WireError};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("wire: {0}")]
    Wire(#[from] WireError),
    #[error("message is not a mapping")]
    NotAMapping,
    #[error("unknown topic {0:?}")]
    UnknownTopic(String),
    #[error("unknown command {command:?} for topic {topic}")]
    UnknownCommand { topic: Topic, command: String },
    #[error("missing param {0:?}")]
    MissingParam(&'static str),
    #[error("param {0:?} has the wrong type")]
    BadParam(&'static str),
    #[error("malformed address value")]
    BadAddress,
    #[error("malformed {0} metadata")]
    BadMeta(&'static str),
}

// ---------------------------------------------------------------------------
// Addresses
// ---------------------------------------------------------------------------

/// Network identity of a node: the address its transport is bound to.
///
/// Equality is structural on (host, port); hosts are compared as the literal
/// strings the nodes were configured with, no name resolution happens here.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Address {
            host: host.into(),
            port,
        }
    }

    pub(crate) fn to_value(&self) -> Value {
        Value::List(vec![
            Value::Str(self.host.clone()),
            Value::Int(i64::from(self.port)),
        ])
    }

    pub(crate) fn from_value(value: &Value) -> Result<Self, ProtocolError> {
        let items = value.as_list().ok_or(ProtocolError::BadAddress)?;
        let [host, port] = items else {
            return Err(ProtocolError::BadAddress);
        };
        let host = host.as_str().ok_or(ProtocolError::BadAddress)?;
        let port = port
            .as_int()
            .and_then(|p| u16::try_from(p).ok())
            .ok_or(ProtocolError::BadAddress)?;
        Ok(Address::new(host, port))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Address {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("{s:?} is not host:port"))?;
        if host.is_empty() {
            return Err(format!("{s:?} has an empty host"));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| format!("{port:?} is not a valid port"))?;
        Ok(Address::new(host, port))
    }
}

// ---------------------------------------------------------------------------
// Topics and payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    Client,
    File,
    Replication,
}

impl Topic {
    pub fn as_str(self) -> &'static str {
        match self {
            Topic::Client => "client",
            Topic::File => "file",
            Topic::Replication => "replication",
        }
    }

    fn parse(s: &str) -> Result<Self, ProtocolError> {
        match s {
            "client" => Ok(Topic::Client),
            "file" => Ok(Topic::File),
            "replication" => Ok(Topic::Replication),
            other => Err(ProtocolError::UnknownTopic(other.to_owned())),
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session-control traffic between clients and servers.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientPayload {
    Knock,
    Auth { username: String, password: String },
    AuthSuccess { success: bool },
    SetServers { servers: Vec<Address> },
    AddServer { server: Address },
    Ack,
    Error { error: String },
}

/// Replicated filesystem effects.
#[derive(Debug, Clone, PartialEq)]
pub enum FilePayload {
    Watched {
        path: String,
    },
    Created {
        src_path: String,
        is_directory: bool,
    },
    Deleted {
        src_path: String,
        is_directory: bool,
    },
    Modified {
        src_path: String,
        is_directory: bool,
        /// `None` when the file vanished before its content could be read;
        /// the effect is then a no-op.
        new_content: Option<Vec<u8>>,
    },
    Moved {
        src_path: String,
        dest_path: String,
        is_directory: bool,
    },
}

/// Server-to-server group membership traffic.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicationPayload {
    Connect,
    /// Snapshot handed to a joiner: the server list plus the client map
    /// flattened to (address, access-level-integer) pairs, because mapping
    /// keys on the wire are strings.
    Initialize {
        servers: Vec<Address>,
        clients: Vec<(Address, i64)>,
    },
    AddServer {
        server: Address,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Client(ClientPayload),
    File(FilePayload),
    Replication(ReplicationPayload),
}

impl Payload {
    pub fn topic(&self) -> Topic {
        match self {
            Payload::Client(_) => Topic::Client,
            Payload::File(_) => Topic::File,
            Payload::Replication(_) => Topic::Replication,
        }
    }

    pub fn command(&self) -> &'static str {
        match self {
            Payload::Client(p) => match p {
                ClientPayload::Knock => "knock",
                ClientPayload::Auth { .. } => "auth",
                ClientPayload::AuthSuccess { .. } => "auth_success",
                ClientPayload::SetServers { .. } => "set_servers",
                ClientPayload::AddServer { .. } => "add_server",
                ClientPayload::Ack => "ack",
                ClientPayload::Error { .. } => "error",
            },
            Payload::File(p) => match p {
                FilePayload::Watched { .. } => "watched",
                FilePayload::Created { .. } => "created",
                FilePayload::Deleted { .. } => "deleted",
                FilePayload::Modified { .. } => "modified",
                FilePayload::Moved { .. } => "moved",
            },
            Payload::Replication(p) => match p {
                ReplicationPayload::Connect => "connect",
                ReplicationPayload::Initialize { .. } => "initialize",
                ReplicationPayload::AddServer { .. } => "add_server",
            },
        }
    }

    fn params_value(&self) -> Value {
        match self {
            Payload::Client(p) => match p {
                ClientPayload::Knock | ClientPayload::Ack => Value::Map(vec![]),
                ClientPayload::Auth { username, password } => Value::Map(vec![
                    ("username".to_owned(), username.as_str().into()),
                    ("password".to_owned(), password.as_str().into()),
                ]),
                ClientPayload::AuthSuccess { success } => {
                    Value::Map(vec![("success".to_owned(), (*success).into())])
                }
                ClientPayload::SetServers { servers } => Value::Map(vec![(
                    "servers".to_owned(),
                    Value::List(servers.iter().map(Address::to_value).collect()),
                )]),
                ClientPayload::AddServer { server } => {
                    Value::Map(vec![("server".to_owned(), server.to_value())])
                }
                ClientPayload::Error { error } => {
                    Value::Map(vec![("error".to_owned(), error.as_str().into())])
                }
            },
            Payload::File(p) => match p {
                FilePayload::Watched { path } => {
                    Value::Map(vec![("path".to_owned(), path.as_str().into())])
                }
                FilePayload::Created {
                    src_path,
                    is_directory,
                }
                | FilePayload::Deleted {
                    src_path,
                    is_directory,
                } => Value::Map(vec![
                    ("src_path".to_owned(), src_path.as_str().into()),
                    ("is_directory".to_owned(), (*is_directory).into()),
                ]),
                FilePayload::Modified {
                    src_path,
                    is_directory,
                    new_content,
                } => Value::Map(vec![
                    ("src_path".to_owned(), src_path.as_str().into()),
                    ("is_directory".to_owned(), (*is_directory).into()),
                    ("new_content".to_owned(), new_content.clone().into()),
                ]),
                FilePayload::Moved {
                    src_path,
                    dest_path,
                    is_directory,
                } => Value::Map(vec![
                    ("src_path".to_owned(), src_path.as_str().into()),
                    ("dest_path".to_owned(), dest_path.as_str().into()),
                    ("is_directory".to_owned(), (*is_directory).into()),
                ]),
            },
            Payload::Replication(p) => match p {
                ReplicationPayload::Connect => Value::Map(vec![]),
                ReplicationPayload::Initialize { servers, clients } => Value::Map(vec![
                    (
                        "servers".to_owned(),
                        Value::List(servers.iter().map(Address::to_value).collect()),
                    ),
                    (
                        "clients".to_owned(),
                        Value::List(
                            clients
                                .iter()
                                .map(|(addr, level)| {
                                    Value::List(vec![addr.to_value(), Value::Int(*level)])
                                })
                                .collect(),
                        ),
                    ),
                ]),
                ReplicationPayload::AddServer { server } => {
                    Value::Map(vec![("server".to_owned(), server.to_value())])
                }
            },
        }
    }

    fn from_wire(topic: Topic, command: &str, params: &Value) -> Result<Self, ProtocolError> {
        let unknown = || ProtocolError::UnknownCommand {
            topic,
            command: command.to_owned(),
        };
        match topic {
            Topic::Client => {
                let payload = match command {
                    "knock" => ClientPayload::Knock,
                    "ack" => ClientPayload::Ack,
                    "auth" => ClientPayload::Auth {
                        username: req_str(params, "username")?.to_owned(),
                        password: req_str(params, "password")?.to_owned(),
                    },
                    "auth_success" => ClientPayload::AuthSuccess {
                        success: req_bool(params, "success")?,
                    },
                    "set_servers" => ClientPayload::SetServers {
                        servers: req_addr_list(params, "servers")?,
                    },
                    "add_server" => ClientPayload::AddServer {
                        server: Address::from_value(req(params, "server")?)?,
                    },
                    "error" => ClientPayload::Error {
                        error: req_str(params, "error")?.to_owned(),
                    },
                    _ => return Err(unknown()),
                };
                Ok(Payload::Client(payload))
            }
            Topic::File => {
                let payload = match command {
                    "watched" => FilePayload::Watched {
                        path: req_str(params, "path")?.to_owned(),
                    },
                    "created" => FilePayload::Created {
                        src_path: req_str(params, "src_path")?.to_owned(),
                        is_directory: req_bool(params, "is_directory")?,
                    },
                    "deleted" => FilePayload::Deleted {
                        src_path: req_str(params, "src_path")?.to_owned(),
                        is_directory: req_bool(params, "is_directory")?,
                    },
                    "modified" => {
                        let content = req(params, "new_content")?;
                        let new_content = if content.is_null() {
                            None
                        } else {
                            Some(
                                content
                                    .as_binary()
                                    .ok_or(ProtocolError::BadParam("new_content"))?
                                    .to_vec(),
                            )
                        };
                        FilePayload::Modified {
                            src_path: req_str(params, "src_path")?.to_owned(),
                            is_directory: req_bool(params, "is_directory")?,
                            new_content,
                        }
                    }
                    "moved" => FilePayload::Moved {
                        src_path: req_str(params, "src_path")?.to_owned(),
                        dest_path: req_str(params, "dest_path")?.to_owned(),
                        is_directory: req_bool(params, "is_directory")?,
                    },
                    _ => return Err(unknown()),
                };
                Ok(Payload::File(payload))
            }
            Topic::Replication => {
                let payload = match command {
                    "connect" => ReplicationPayload::Connect,
                    "initialize" => {
                        let mut clients = Vec::new();
                        for pair in req(params, "clients")?
                            .as_list()
                            .ok_or(ProtocolError::BadParam("clients"))?
                        {
                            let items =
                                pair.as_list().ok_or(ProtocolError::BadParam("clients"))?;
                            let [addr, level] = items else {
                                return Err(ProtocolError::BadParam("clients"));
                            };
                            clients.push((
                                Address::from_value(addr)?,
                                level.as_int().ok_or(ProtocolError::BadParam("clients"))?,
                            ));
                        }
                        ReplicationPayload::Initialize {
                            servers: req_addr_list(params, "servers")?,
                            clients,
                        }
                    }
                    "add_server" => ReplicationPayload::AddServer {
                        server: Address::from_value(req(params, "server")?)?,
                    },
                    _ => return Err(unknown()),
                };
                Ok(Payload::Replication(payload))
            }
        }
    }
}

fn req<'a>(params: &'a Value, key: &'static str) -> Result<&'a Value, ProtocolError> {
    params.get(key).ok_or(ProtocolError::MissingParam(key))
}

fn req_str<'a>(params: &'a Value, key: &'static str) -> Result<&'a str, ProtocolError> {
    req(params, key)?
        .as_str()
        .ok_or(ProtocolError::BadParam(key))
}

fn req_bool(params: &Value, key: &'static str) -> Result<bool, ProtocolError> {
    req(params, key)?
        .as_bool()
        .ok_or(ProtocolError::BadParam(key))
}

fn req_addr_list(params: &Value, key: &'static str) -> Result<Vec<Address>, ProtocolError> {
    req(params, key)?
        .as_list()
        .ok_or(ProtocolError::BadParam(key))?
        .iter()
        .map(Address::from_value)
        .collect()
}

// ---------------------------------------------------------------------------
// Middleware metadata
// ---------------------------------------------------------------------------

/// Globally-unique broadcast id: (node instance, node-local counter).
///
/// The instance half is assigned at node start, so counters restart safely
/// across process restarts without colliding with ids minted before.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId {
    pub instance: u64,
    pub counter: u64,
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.instance, self.counter)
    }
}

/// Stamped by the transport on every send: the address replies go to.
#[derive(Debug, Clone, PartialEq)]
pub struct OriginMeta {
    pub origin: Address,
}

/// Stamped by the reliable broadcast layer.
#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastMeta {
    /// Last hop, rewritten by every forwarder. Duplicate suppression keys on
    /// `message_id`, which survives forwarding untouched.
    pub sender: Address,
    pub message_id: MessageId,
    /// Full recipient set of the original broadcast; receivers eagerly
    /// re-forward to everyone here but themselves.
    pub to: Vec<Address>,
}

/// Stamped by the ack manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMeta {
    /// Request that wants an acknowledgement under this id.
    Expect { message_id: u64 },
    /// Reply releasing the pending entry with this id.
    AckFor { for_message_id: u64 },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Meta {
    pub origin: Option<OriginMeta>,
    pub broadcast: Option<BroadcastMeta>,
    pub ack: Option<AckMeta>,
}

impl Meta {
    fn to_value(&self) -> Value {
        let mut entries = Vec::new();
        if let Some(origin) = &self.origin {
            entries.push((
                "sendreceive".to_owned(),
                Value::Map(vec![("origin".to_owned(), origin.origin.to_value())]),
            ));
        }
        if let Some(bcast) = &self.broadcast {
            entries.push((
                "r_broadcast".to_owned(),
                Value::Map(vec![
                    ("sender".to_owned(), bcast.sender.to_value()),
                    (
                        "message_id".to_owned(),
                        Value::List(vec![
                            Value::Int(bcast.message_id.instance as i64),
                            Value::Int(bcast.message_id.counter as i64),
                        ]),
                    ),
                    (
                        "to".to_owned(),
                        Value::List(bcast.to.iter().map(Address::to_value).collect()),
                    ),
                ]),
            ));
        }
        if let Some(ack) = &self.ack {
            let entry = match ack {
                AckMeta::Expect { message_id } => {
                    ("message_id".to_owned(), Value::Int(*message_id as i64))
                }
                AckMeta::AckFor { for_message_id } => (
                    "for_message_id".to_owned(),
                    Value::Int(*for_message_id as i64),
                ),
            };
            entries.push(("ack_manager".to_owned(), Value::Map(vec![entry])));
        }
        Value::Map(entries)
    }

    fn from_value(value: &Value) -> Result<Self, ProtocolError> {
        let mut meta = Meta::default();
        if let Some(sr) = value.get("sendreceive") {
            let origin = sr
                .get("origin")
                .ok_or(ProtocolError::BadMeta("sendreceive"))?;
            meta.origin = Some(OriginMeta {
                origin: Address::from_value(origin)?,
            });
        }
        if let Some(rb) = value.get("r_broadcast") {
            let bad = || ProtocolError::BadMeta("r_broadcast");
            let sender = Address::from_value(rb.get("sender").ok_or_else(bad)?)?;
            let id = rb
                .get("message_id")
                .and_then(Value::as_list)
                .ok_or_else(bad)?;
            let [instance, counter] = id else {
                return Err(bad());
            };
            let message_id = MessageId {
                instance: instance
                    .as_int()
                    .and_then(|i| u64::try_from(i).ok())
                    .ok_or_else(bad)?,
                counter: counter
                    .as_int()
                    .and_then(|i| u64::try_from(i).ok())
                    .ok_or_else(bad)?,
            };
            let to = rb
                .get("to")
                .and_then(Value::as_list)
                .ok_or_else(bad)?
                .iter()
                .map(Address::from_value)
                .collect::<Result<Vec<_>, _>>()?;
            meta.broadcast = Some(BroadcastMeta {
                sender,
                message_id,
                to,
            });
        }
        if let Some(am) = value.get("ack_manager") {
            let as_id = |v: &Value| {
                v.as_int()
                    .and_then(|i| u64::try_from(i).ok())
                    .ok_or(ProtocolError::BadMeta("ack_manager"))
            };
            meta.ack = Some(if let Some(id) = am.get("message_id") {
                AckMeta::Expect {
                    message_id: as_id(id)?,
                }
            } else if let Some(id) = am.get("for_message_id") {
                AckMeta::AckFor {
                    for_message_id: as_id(id)?,
                }
            } else {
                return Err(ProtocolError::BadMeta("ack_manager"));
            });
        }
        Ok(meta)
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// One unit of wire traffic: a typed payload plus middleware metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub payload: Payload,
    pub meta: Meta,
}

impl Message {
    pub fn new(payload: Payload) -> Self {
        Message {
            payload,
            meta: Meta::default(),
        }
    }

    pub fn topic(&self) -> Topic {
        self.payload.topic()
    }

    pub fn command(&self) -> &'static str {
        self.payload.command()
    }

    /// The address this message was sent from, if the transport stamped one.
    pub fn origin(&self) -> Option<&Address> {
        self.meta.origin.as_ref().map(|m| &m.origin)
    }

    pub fn encode(&self) -> Vec<u8> {
        let value = Value::Map(vec![
            ("topic".to_owned(), self.topic().as_str().into()),
            ("command".to_owned(), self.command().into()),
            ("params".to_owned(), self.payload.params_value()),
            ("meta".to_owned(), self.meta.to_value()),
        ]);
        wire::to_bytes(&value)
    }

    /// Decode one message from the front of `buf`; returns the bytes
    /// consumed. [`WireError::Incomplete`] (wrapped) means wait for more
    /// input; everything else poisons the connection.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), ProtocolError> {
        let (value, used) = wire::decode(buf)?;
        if !matches!(value, Value::Map(_)) {
            return Err(ProtocolError::NotAMapping);
        }
        let topic = Topic::parse(
            value
                .get("topic")
                .and_then(Value::as_str)
                .ok_or(ProtocolError::MissingParam("topic"))?,
        )?;
        let command = value
            .get("command")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingParam("command"))?;
        let params = value
            .get("params")
            .ok_or(ProtocolError::MissingParam("params"))?;
        let meta = value
            .get("meta")
            .ok_or(ProtocolError::MissingParam("meta"))?;
        Ok((
            Message {
                payload: Payload::from_wire(topic, command, params)?,
                meta: Meta::from_value(meta)?,
            },
            used,
        ))
    }
}
