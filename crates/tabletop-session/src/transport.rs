#![forbid(unsafe_code)]

//! Point-to-point transport abstraction.
//!
//! A transport has one identity on the signalling network ([`PeerId`]) and
//! any number of data connections to other identities. Connection lifecycle
//! and inbound data are reported as [`TransportEvent`]s that the session
//! drains with [`Transport::poll_events`]; nothing is delivered by callback.
//!
//! ```text
//! connect(remote) ──▶ ConnectionId ── … ──▶ Open ──▶ Data* ──▶ Close
//!                                      └──▶ Error (never opened)
//! ```
//!
//! Sending on a connection that is closed, unknown or not yet open is a
//! silent no-op.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use tabletop_state::PlayerId;

/// Identity of an endpoint on the signalling network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Validate and wrap an identifier: non-empty, no whitespace.
    pub fn parse(raw: &str) -> Result<Self, TransportError> {
        let raw = raw.trim();
        if raw.is_empty() || raw.chars().any(char::is_whitespace) {
            return Err(TransportError::InvalidPeerId(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The player id used for this endpoint in the game state.
    #[must_use]
    pub fn to_player_id(&self) -> PlayerId {
        PlayerId::new(self.0.as_str())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PeerId {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// A session is identified by its host's transport identity.
pub type SessionId = PeerId;

/// Handle of one data connection, unique per transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Transport failures surfaced to the session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// No endpoint with this identity is reachable on the signalling network.
    #[error("peer '{0}' is unavailable")]
    PeerUnavailable(String),
    #[error("connection {0} is closed")]
    ConnectionClosed(ConnectionId),
    #[error("invalid peer id '{0}'")]
    InvalidPeerId(String),
    /// The transport has not been opened or was shut down.
    #[error("transport is not open")]
    NotOpen,
    /// The signalling network could not be reached.
    #[error("signalling network unreachable")]
    Unreachable,
}

/// Lifecycle and data notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A connection completed its handshake. `remote` is the other end.
    Open { conn: ConnectionId, remote: PeerId },
    Data { conn: ConnectionId, payload: Vec<u8> },
    Close { conn: ConnectionId },
    /// A failure, optionally tied to one connection.
    Error {
        conn: Option<ConnectionId>,
        error: TransportError,
    },
    /// The transport lost its signalling identity; existing connections may survive.
    Disconnected,
}

/// A point-to-point message transport.
pub trait Transport {
    /// Register on the signalling network and return the local identity.
    fn open(&mut self) -> Result<PeerId, TransportError>;

    /// The local identity, once open.
    fn local_id(&self) -> Option<PeerId>;

    /// Start connecting to `remote`. Completion is reported as an `Open` event.
    fn connect(&mut self, remote: &PeerId) -> Result<ConnectionId, TransportError>;

    /// Queue `payload` on `conn`. A no-op when the connection is not open.
    fn send(&mut self, conn: ConnectionId, payload: Vec<u8>);

    fn close(&mut self, conn: ConnectionId);

    /// Drain pending events in arrival order.
    fn poll_events(&mut self) -> Vec<TransportEvent>;

    /// Re-register the local identity after `Disconnected`.
    fn reconnect(&mut self) -> Result<(), TransportError>;

    /// Close every connection and leave the signalling network.
    fn shutdown(&mut self);
}
