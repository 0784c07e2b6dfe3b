#![forbid(unsafe_code)]

//! Session configuration.
//!
//! Every field has a default, so a config file only needs to name what it
//! changes:
//!
//! ```toml
//! player_name = "Ada"
//! broadcast_debounce_ms = 16
//!
//! [history]
//! max_depth = 50
//!
//! [reconnect]
//! max_retries = 3
//! backoff = { kind = "fixed", delay_ms = 500 }
//! ```

use std::path::Path as FsPath;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use web_time::Duration;

use tabletop_state::{HistoryConfig, Path};

use crate::retry::RetryPolicy;

/// Errors that can occur when loading a session configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Tunables for one [`GameSession`](crate::GameSession).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Display name of the local player. Hosts default to `Host`.
    pub player_name: Option<String>,

    /// Quiet time before a burst of host mutations is broadcast as one state.
    pub broadcast_debounce_ms: u64,

    /// Time between the two steps of a dice roll.
    pub roll_duration_ms: u64,

    /// Undo history limits.
    pub history: HistoryConfig,

    /// Backoff for re-registering with the signalling network.
    pub reconnect: RetryPolicy,

    /// Subtree whose mutations are undoable.
    pub undo_scope: String,

    /// Seed for dice and shuffles. Random when absent.
    pub rng_seed: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            player_name: None,
            broadcast_debounce_ms: 16,
            roll_duration_ms: 600,
            history: HistoryConfig::default(),
            reconnect: RetryPolicy::default(),
            undo_scope: "/entities".into(),
            rng_seed: None,
        }
    }
}

impl SessionConfig {
    /// Load from a TOML string.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    /// Load from a TOML file on disk.
    pub fn from_toml_file(path: impl AsRef<FsPath>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    /// Load from a JSON string.
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(s)?)
    }

    /// Load from a JSON file on disk.
    pub fn from_json_file(path: impl AsRef<FsPath>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&content)
    }

    /// Validate all parameters are within acceptable ranges.
    ///
    /// Returns a list of validation errors. An empty list means the config
    /// is valid.
    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if let Some(name) = &self.player_name
            && name.trim().is_empty()
        {
            errors.push("player_name must not be blank".into());
        }

        if self.history.max_depth == 0 {
            errors.push("history.max_depth must be > 0".into());
        }

        // A roll that settles instantly would never be observed as rolling.
        if self.roll_duration_ms == 0 {
            errors.push("roll_duration_ms must be > 0".into());
        }

        match Path::parse(&self.undo_scope) {
            Ok(path) if path.is_root() => {
                errors.push("undo_scope must not be the root (selection would become undoable)".into());
            }
            Ok(_) => {}
            Err(err) => errors.push(format!("undo_scope is not a valid path: {err}")),
        }

        self.reconnect.validate("reconnect", &mut errors);
        errors
    }

    #[must_use]
    pub fn broadcast_debounce(&self) -> Duration {
        Duration::from_millis(self.broadcast_debounce_ms)
    }

    #[must_use]
    pub fn roll_duration(&self) -> Duration {
        Duration::from_millis(self.roll_duration_ms)
    }

    /// The undo scope as a path, falling back to `/entities` when invalid.
    #[must_use]
    pub fn undo_scope_path(&self) -> Path {
        Path::parse(&self.undo_scope)
            .ok()
            .filter(|path| !path.is_root())
            .unwrap_or_else(tabletop_state::model::paths::entities)
    }
}
