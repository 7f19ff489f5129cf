//! The message-queue transport seam.
//!
//! The relay talks to all of its peers (storage nodes, the blockchain
//! RPC, notifier services, the front-end) over a message-queue style
//! transport with named endpoints and per-connection auth levels.  The
//! transport itself is external; this module defines the
//! [`MessageQueue`] trait the orchestrator is written against, plus
//! [`LocalHub`], an in-process implementation used by the test-suite
//! and for same-process wiring.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::warn;

pub type ConnectionId = u64;

/// Authorization granted to a connection, ordered weakest first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum AuthLevel {
    None,
    Basic,
    Admin,
}

#[derive(Debug, Error)]
pub enum MqError {
    #[error("connection failed: {0}")]
    ConnectFailed(String),
    #[error("request timed out")]
    Timeout,
    #[error("peer disconnected")]
    Disconnected,
    #[error("unknown connection")]
    UnknownConnection,
}

/// One-shot reply slot for request endpoints.  Cloneable so a dispatch
/// wrapper can keep a fallback handle; the first `send` wins.
#[derive(Clone)]
pub struct Replier {
    tx: Arc<Mutex<Option<oneshot::Sender<Vec<Bytes>>>>>,
}

impl Replier {
    pub fn new() -> (Self, oneshot::Receiver<Vec<Bytes>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    pub fn send(&self, parts: Vec<Bytes>) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(parts);
        }
    }
}

/// An incoming endpoint invocation.
pub struct Message {
    /// The connection it arrived on; also the target for any replies or
    /// follow-up commands to the same peer.
    pub conn: ConnectionId,
    pub endpoint: String,
    /// Auth level the receiving listener granted this connection.
    pub auth: AuthLevel,
    pub parts: Vec<Bytes>,
    /// Present for request endpoints.
    pub replier: Option<Replier>,
}

/// Dispatcher installed on a listening peer.
pub type Handler = Arc<dyn Fn(Message) + Send + Sync>;

/// Outbound surface of the transport.
#[async_trait]
pub trait MessageQueue: Send + Sync + 'static {
    /// Opens a connection to the peer at `addr`.
    async fn connect(&self, addr: &str) -> Result<ConnectionId, MqError>;

    fn disconnect(&self, conn: ConnectionId);

    /// Sends a request and waits for the reply.
    async fn request(
        &self,
        conn: ConnectionId,
        endpoint: &str,
        parts: Vec<Bytes>,
    ) -> Result<Vec<Bytes>, MqError>;

    /// Fire-and-forget command.
    fn send(&self, conn: ConnectionId, endpoint: &str, parts: Vec<Bytes>);
}

// ---------------------------------------------------------------------------
// In-process implementation

struct NodeEntry {
    dispatcher: Handler,
    /// Auth granted to peers connecting to this node.
    grant: AuthLevel,
}

struct ConnEntry {
    initiator: String,
    target: String,
}

/// An in-process hub of named peers.  Each [`LocalPeer`] is registered
/// under an address; connections between peers are bidirectional, so a
/// message handler can issue requests back over `msg.conn` exactly as
/// the real transport allows.
pub struct LocalHub {
    nodes: Mutex<HashMap<String, NodeEntry>>,
    conns: Mutex<HashMap<ConnectionId, ConnEntry>>,
    next_conn: AtomicU64,
    request_timeout: Mutex<Duration>,
}

impl LocalHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            nodes: Mutex::new(HashMap::new()),
            conns: Mutex::new(HashMap::new()),
            next_conn: AtomicU64::new(1),
            request_timeout: Mutex::new(Duration::from_secs(15)),
        })
    }

    /// Shortens (or lengthens) the request timeout; mostly for tests.
    pub fn set_request_timeout(&self, timeout: Duration) {
        *self.request_timeout.lock() = timeout;
    }

    /// Registers a peer at `addr`.  `grant` is the auth level handed to
    /// connections made *to* this peer; `dispatcher` receives every
    /// message addressed to it.
    pub fn peer(
        self: &Arc<Self>,
        addr: &str,
        grant: AuthLevel,
        dispatcher: Handler,
    ) -> Arc<LocalPeer> {
        self.nodes.lock().insert(
            addr.to_string(),
            NodeEntry {
                dispatcher,
                grant,
            },
        );
        Arc::new(LocalPeer {
            hub: self.clone(),
            addr: addr.to_string(),
        })
    }

    /// Registers a client-only peer (no inbound endpoints).
    pub fn client(self: &Arc<Self>, addr: &str) -> Arc<LocalPeer> {
        self.peer(addr, AuthLevel::None, Arc::new(|_msg| {}))
    }

    fn route(&self, from: &str, conn: ConnectionId) -> Result<(String, AuthLevel), MqError> {
        let conns = self.conns.lock();
        let entry = conns.get(&conn).ok_or(MqError::UnknownConnection)?;
        let dest = if entry.initiator == from {
            entry.target.clone()
        } else {
            entry.initiator.clone()
        };
        drop(conns);
        let nodes = self.nodes.lock();
        let node = nodes.get(&dest).ok_or(MqError::Disconnected)?;
        Ok((dest, node.grant))
    }

    fn dispatcher_of(&self, addr: &str) -> Option<Handler> {
        self.nodes.lock().get(addr).map(|n| n.dispatcher.clone())
    }
}

/// One named endpoint of a [`LocalHub`].
pub struct LocalPeer {
    hub: Arc<LocalHub>,
    addr: String,
}

impl LocalPeer {
    pub fn addr(&self) -> &str {
        &self.addr
    }
}

#[async_trait]
impl MessageQueue for LocalPeer {
    async fn connect(&self, addr: &str) -> Result<ConnectionId, MqError> {
        if !self.hub.nodes.lock().contains_key(addr) {
            return Err(MqError::ConnectFailed(format!("no peer at {addr}")));
        }
        let id = self.hub.next_conn.fetch_add(1, Ordering::Relaxed);
        self.hub.conns.lock().insert(
            id,
            ConnEntry {
                initiator: self.addr.clone(),
                target: addr.to_string(),
            },
        );
        Ok(id)
    }

    fn disconnect(&self, conn: ConnectionId) {
        self.hub.conns.lock().remove(&conn);
    }

    async fn request(
        &self,
        conn: ConnectionId,
        endpoint: &str,
        parts: Vec<Bytes>,
    ) -> Result<Vec<Bytes>, MqError> {
        // The auth attached to the message is what *we* were granted by
        // the destination listener.
        let (dest, granted) = self.hub.route(&self.addr, conn)?;
        let dispatcher = self
            .hub
            .dispatcher_of(&dest)
            .ok_or(MqError::Disconnected)?;
        let (replier, rx) = Replier::new();
        dispatcher(Message {
            conn,
            endpoint: endpoint.to_string(),
            auth: granted,
            parts,
            replier: Some(replier),
        });
        let timeout = *self.hub.request_timeout.lock();
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(MqError::Disconnected),
            Err(_) => Err(MqError::Timeout),
        }
    }

    fn send(&self, conn: ConnectionId, endpoint: &str, parts: Vec<Bytes>) {
        let routed = self
            .hub
            .route(&self.addr, conn)
            .and_then(|(dest, granted)| {
                self.hub
                    .dispatcher_of(&dest)
                    .map(|d| (d, granted))
                    .ok_or(MqError::Disconnected)
            });
        match routed {
            Ok((dispatcher, granted)) => dispatcher(Message {
                conn,
                endpoint: endpoint.to_string(),
                auth: granted,
                parts,
                replier: None,
            }),
            Err(err) => warn!(endpoint, %err, "dropping command"),
        }
    }
}
