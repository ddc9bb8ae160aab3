//! Framed point-to-point message delivery over TCP.
//!
//! Sends open a short-lived outbound connection per message, write one
//! encoded frame, and close; a stuck peer therefore delays only that one
//! send, bounded by the connect timeout. The accept side buffers per
//! connection and hands complete decoded messages to the inbound channel.
//! A connection that closes mid-frame has its partial buffer discarded; a
//! malformed frame closes the connection. Nothing partial travels upward.

use std::time::Duration;

use rm_protocol::{Address, Message, OriginMeta, ProtocolError, WireError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::CommError;

const INBOUND_CHANNEL_BOUND: usize = 128;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// One endpoint of the mirroring group.
///
/// The bound address doubles as the node's identity: it is stamped as the
/// origin of every outgoing message, so the configured host must be one that
/// peers can route back to.
pub struct Transport {
    local: Address,
}

impl Transport {
    /// Bind a passive endpoint and start accepting inbound connections.
    ///
    /// Returns the transport plus the stream of decoded inbound messages.
    /// Binding port 0 picks an ephemeral port, reflected in `local()`.
    pub async fn bind(addr: Address) -> Result<(Self, mpsc::Receiver<Message>), CommError> {
        let listener = TcpListener::bind((addr.host.as_str(), addr.port)).await?;
        let local = Address::new(addr.host, listener.local_addr()?.port());
        let (tx, rx) = mpsc::channel(INBOUND_CHANNEL_BOUND);
        tokio::spawn(accept_loop(listener, tx));
        Ok((Transport { local }, rx))
    }

    /// The address this transport is bound to (and stamps as origin).
    pub fn local(&self) -> &Address {
        &self.local
    }

    /// Deliver one message to `to` over a fresh connection.
    ///
    /// `CommError::Unreachable` is the liveness signal consumed by the
    /// broadcast layer.
    pub async fn send(&self, to: &Address, mut message: Message) -> Result<(), CommError> {
        message.meta.origin = Some(OriginMeta {
            origin: self.local.clone(),
        });
        let frame = message.encode();

        let connect = TcpStream::connect((to.host.as_str(), to.port));
        let mut stream = match tokio::time::timeout(CONNECT_TIMEOUT, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                return Err(CommError::Unreachable(to.clone()));
            }
            Ok(Err(e)) => return Err(CommError::Io(e)),
            Err(_) => return Err(CommError::Unreachable(to.clone())),
        };
        stream.write_all(&frame).await?;
        stream.shutdown().await?;
        debug!(to = %to, command = message.command(), "sent message");
        Ok(())
    }
}

async fn accept_loop(listener: TcpListener, tx: mpsc::Sender<Message>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(peer = %peer, "inbound connection");
                tokio::spawn(read_connection(stream, tx.clone()));
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
            }
        }
    }
}

async fn read_connection(mut stream: TcpStream, tx: mpsc::Sender<Message>) {
    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = match stream.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "read failed, closing connection");
                return;
            }
        };
        buf.extend_from_slice(&chunk[..n]);

        // drain every complete frame currently buffered
        loop {
            match Message::decode(&buf) {
                Ok((message, used)) => {
                    buf.drain(..used);
                    if tx.send(message).await.is_err() {
                        // node loop is gone, nothing left to deliver to
                        return;
                    }
                }
                Err(ProtocolError::Wire(WireError::Incomplete)) => break,
                Err(e) => {
                    warn!(error = %e, "malformed frame, closing connection");
                    return;
                }
            }
        }
    }
    if !buf.is_empty() {
        debug!(bytes = buf.len(), "discarding partial frame at EOF");
    }
}
