//! Peer sessions: one persistent link per configured application server or directory user.

mod options;
mod packet;
mod session;
mod transport;

pub use options::PeerTransportOptions;
pub use session::PeerSessionHandle;
pub(crate) use session::{PeerSessionArgs, spawn_session};

use serde::Serialize;
use std::fmt;
use tether_schema::Envelope;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Identity of one peer session, stable across reconnects of its transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SessionId(Uuid);

impl SessionId {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// An envelope sent over a loopback link.
#[derive(Debug, Clone)]
pub struct LoopbackFrame {
    pub session: SessionId,
    pub envelope: Envelope,
}

/// How sessions reach their peer.
#[derive(Clone, Default)]
pub enum PeerLink {
    /// Socket.IO over a websocket to the peer URL, reconnecting with backoff.
    #[default]
    WebSocket,
    /// In-process channel. The session counts as connected as soon as it starts.
    Loopback(mpsc::UnboundedSender<LoopbackFrame>),
}
