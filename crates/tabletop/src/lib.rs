#![forbid(unsafe_code)]

//! Tabletop public facade crate.
//!
//! Re-exports the state and session crates behind one dependency and offers
//! a prelude for embedding programs. Logging setup lives in [`logging`].
//!
//! ```no_run
//! use tabletop::prelude::*;
//!
//! let net = MemoryNetwork::new();
//! let mut host = GameSession::create_or_join(SessionConfig::default(), net.transport(), None)?;
//! let mut peer = GameSession::create_or_join(
//!     SessionConfig::default(),
//!     net.transport(),
//!     Some(host.session_id().clone()),
//! )?;
//! let now = web_time::Instant::now();
//! host.pump(now);
//! peer.pump(now);
//! # Ok::<(), tabletop::Error>(())
//! ```

pub mod logging;

// --- State re-exports ------------------------------------------------------

pub use tabletop_state::{
    Action, ActionError, ActionRegistry, ActionRequest, Entity, EntityId, EntityKind, GameState,
    HistoryConfig, Patch, PatchPair, Path, Placeable, Player, PlayerId, Position, StateTree, Store,
    TreeError, UndoError, UndoManager,
};

// --- Session re-exports ----------------------------------------------------

pub use tabletop_session::{
    BackoffStrategy, ConfigError, FileStorage, GameSession, MemoryNetwork, MemoryStorage,
    MemoryTransport, PeerId, RetryPolicy, SessionConfig, SessionError, SessionEvent, SessionId,
    StorageBackend, StorageError, Transport, TransportError, TransportEvent,
};

// --- Errors ---------------------------------------------------------------

/// Top-level error type for tabletop programs.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Logging(#[from] logging::LoggingError),
    /// The configuration loaded but did not validate.
    #[error("invalid configuration: {}", .0.join("; "))]
    InvalidConfig(Vec<String>),
}

/// Standard result type for tabletop APIs.
pub type Result<T> = std::result::Result<T, Error>;

/// Load a TOML config file and reject it unless it validates.
pub fn load_config(path: impl AsRef<std::path::Path>) -> Result<SessionConfig> {
    let config = SessionConfig::from_toml_file(path)?;
    let problems = config.validate();
    if problems.is_empty() {
        Ok(config)
    } else {
        Err(Error::InvalidConfig(problems))
    }
}

// --- Prelude --------------------------------------------------------------

pub mod prelude {
    pub use crate::{
        ActionRequest, EntityId, EntityKind, Error, GameSession, MemoryNetwork, PeerId, Result,
        SessionConfig, SessionEvent, Store,
    };

    pub use crate::{session, state};
}

pub use tabletop_session as session;
pub use tabletop_state as state;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_config_lists_every_problem() {
        let err = Error::InvalidConfig(vec!["a must be > 0".into(), "b is blank".into()]);
        assert_eq!(
            err.to_string(),
            "invalid configuration: a must be > 0; b is blank"
        );
    }

    #[test]
    fn prelude_is_enough_to_host() {
        use crate::prelude::*;

        let net = MemoryNetwork::new();
        let mut host =
            GameSession::create_or_join(SessionConfig::default(), net.transport(), None)
                .expect("host starts");
        assert!(host.is_host());
        assert!(host.pump(web_time::Instant::now()).is_empty());
    }
}
