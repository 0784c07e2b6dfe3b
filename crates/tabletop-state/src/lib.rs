#![forbid(unsafe_code)]

//! Tabletop State
//!
//! The authoritative game-state tree and everything that mutates it:
//! patches, change publication, patch recording, undo/redo and the action
//! tracking middleware.
//!
//! # Key Components
//!
//! - [`StateTree`] - JSON document with atomic patch application and change publication
//! - [`Patch`] / [`PatchPair`] - field-level changes and their inverses
//! - [`PatchRecorder`] - captures committed patches while an action runs
//! - [`UndoManager`] / [`UndoStore`] - grouped, serializable undo/redo history
//! - [`ActionTracker`] / [`ActionCx`] - root-action correlation across nested calls and flows
//! - [`Store`] - the per-runtime context bundling tree, history and tracking
//! - [`ActionRegistry`] - built-in game actions dispatched by name
//!
//! # Role in the workspace
//! `tabletop-session` owns one [`Store`] per runtime. On the host it runs
//! action requests through the [`ActionRegistry`] and broadcasts the tree;
//! on a peer it only ever applies snapshots, which are never recorded.

pub mod actions;
pub mod error;
pub mod model;
pub mod patch;
pub mod path;
pub mod reactive;
pub mod store;
pub mod tracking;
pub mod tree;
pub mod undo;

pub use actions::{ActionRegistry, ActionRequest, DiceRoll, begin_roll, roll_value, settle_roll};
pub use error::{ActionError, TreeError, UndoError};
pub use model::{Entity, EntityId, EntityKind, GameState, Placeable, Player, PlayerId, Position};
pub use patch::{Patch, PatchPair};
pub use path::Path;
pub use reactive::{Debouncer, DirtyFlag, SubscriberList, Subscription};
pub use store::{FlowId, Store};
pub use tracking::{Action, ActionCx, ActionId, ActionPhase, ActionTracker};
pub use tree::StateTree;
pub use undo::{
    HistoryConfig, PatchRecorder, RecorderOptions, RecordingSwitch, UndoEvent, UndoGroup,
    UndoManager, UndoStore,
};
