#![forbid(unsafe_code)]

use thiserror::Error;

use tabletop_state::{ActionError, TreeError, UndoError};

use crate::persistence::StorageError;
use crate::transport::TransportError;
use crate::wire::CodecError;

/// Failures returned by [`GameSession`](crate::GameSession) operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("action: {0}")]
    Action(#[from] ActionError),
    #[error("undo: {0}")]
    Undo(#[from] UndoError),
    #[error("state: {0}")]
    Tree(#[from] TreeError),
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
    #[error("codec: {0}")]
    Codec(#[from] CodecError),
    /// A peer tried to reach the host before its connection opened and the
    /// request could not be queued.
    #[error("not connected to a host")]
    NotConnected,
}

pub type SessionResult<T> = Result<T, SessionError>;
