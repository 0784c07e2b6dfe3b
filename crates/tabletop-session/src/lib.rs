#![forbid(unsafe_code)]

//! # Tabletop Session
//!
//! Host/peer replication of the game state over point-to-point transports.
//!
//! # Key Components
//!
//! - [`GameSession`]: role selection (`create_or_join`), action routing and
//!   the `pump` loop that drives everything else
//! - [`HostChannel`] / [`PeerChannel`]: full-state replication, debounced
//!   fan-out on the host, snapshot reconciliation on peers
//! - [`Transport`]: the connection abstraction; [`MemoryNetwork`] provides an
//!   in-process implementation with fault injection
//! - [`StorageBackend`]: named-blob persistence of the tree and undo history
//! - [`SessionConfig`]: TOML/JSON configuration with validation
//!
//! # Role in the workspace
//!
//! `tabletop-session` sits on top of `tabletop-state`. The state crate knows
//! nothing about networking; this crate decides who may mutate the tree and
//! how changes travel.

pub mod config;
pub mod error;
pub mod memory;
pub mod persistence;
pub mod replication;
pub mod retry;
pub mod session;
pub mod transport;
pub mod wire;

pub use config::{ConfigError, SessionConfig};
pub use error::{SessionError, SessionResult};
pub use memory::{MemoryNetwork, MemoryTransport};
pub use persistence::{FileStorage, MemoryStorage, StorageBackend, StorageError, StorageResult};
pub use replication::{HostChannel, PeerChannel, PeerState};
pub use retry::{BackoffStrategy, ReconnectSchedule, RetryPolicy};
pub use session::{GameSession, SessionEvent};
pub use transport::{ConnectionId, PeerId, SessionId, Transport, TransportError, TransportEvent};
pub use wire::CodecError;
