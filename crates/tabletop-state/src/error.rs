#![forbid(unsafe_code)]

//! Error types for the state tree, undo history and game actions.
//!
//! # Failure Modes
//!
//! | Error | Cause | Session impact |
//! |-------|-------|----------------|
//! | [`TreeError`] | Bad path, wrong container, (de)serialization | Mutation rejected, tree unchanged |
//! | [`UndoError::NothingToUndo`] | `undo()` on empty stack | Caller contract violation, stacks unchanged |
//! | [`UndoError::Patch`] | Inverse patch no longer applies | Group stays on its stack |
//! | [`ActionError`] | Handler rejected the request | Propagated to the caller |

use thiserror::Error;

use crate::model::EntityId;
use crate::path::Path;

/// Errors raised while reading or mutating a [`StateTree`](crate::StateTree).
#[derive(Debug, Error)]
pub enum TreeError {
    /// No value exists at the path.
    #[error("no value at path '{0}'")]
    PathNotFound(Path),
    /// The parent of the path is a scalar and cannot hold children.
    #[error("value at '{0}' is not an object or array")]
    NotAContainer(Path),
    /// Array segment is not a valid index for the array.
    #[error("invalid array index '{index}' at '{path}'")]
    InvalidIndex { path: Path, index: String },
    /// The root node cannot be removed.
    #[error("the root node cannot be removed")]
    RemoveRoot,
    /// A path string did not start with '/'.
    #[error("malformed path '{0}'")]
    MalformedPath(String),
    /// A value could not be converted to or from its typed form.
    #[error("value at '{path}' does not match the expected shape: {source}")]
    Shape {
        path: Path,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors raised by the undo manager.
#[derive(Debug, Error)]
pub enum UndoError {
    /// `undo()` was called with an empty undo stack.
    #[error("nothing to undo")]
    NothingToUndo,
    /// `redo()` was called with an empty redo stack.
    #[error("nothing to redo")]
    NothingToRedo,
    /// Replaying a stored patch list failed; the group stays where it was.
    #[error("undo history no longer applies to the tree: {0}")]
    Patch(#[source] TreeError),
    /// A persisted undo history could not be decoded.
    #[error("undo history snapshot is invalid: {0}")]
    Snapshot(#[source] serde_json::Error),
}

/// Errors raised while executing a game action.
#[derive(Debug, Error)]
pub enum ActionError {
    /// No handler is registered under the requested name.
    #[error("unknown action '{0}'")]
    UnknownAction(String),
    /// The request payload does not have the shape the action expects.
    #[error("invalid payload for '{action}': {reason}")]
    InvalidPayload { action: String, reason: String },
    /// The action refers to an entity that does not exist.
    #[error("entity '{0}' not found")]
    EntityNotFound(EntityId),
    /// The action is valid but not allowed in the current state.
    #[error("action rejected: {0}")]
    Rejected(String),
    /// A flow step or end was requested for a flow that is not running.
    #[error("flow {0} is not running")]
    FlowNotRunning(u64),
    /// The underlying tree mutation failed.
    #[error(transparent)]
    Tree(#[from] TreeError),
}

impl ActionError {
    /// Build an [`ActionError::InvalidPayload`] from anything displayable.
    pub fn payload(action: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::InvalidPayload {
            action: action.into(),
            reason: reason.to_string(),
        }
    }
}
