#![forbid(unsafe_code)]

//! Patch-based undo/redo.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────┐  batches  ┌────────────────┐  UndoEvent  ┌─────────────┐
//! │   StateTree    │ ────────▶ │ PatchRecorder  │ ──────────▶ │ UndoManager │
//! └────────────────┘           └────────────────┘ (tracker)   │  UndoStore  │
//!         ▲                                                   └──────┬──────┘
//!         └──────────── inverse / forward patches (replay) ──────────┘
//! ```
//!
//! - [`recorder`]: observes committed batches while an action runs
//! - [`store`]: serializable undo/redo stacks of [`UndoGroup`]s
//! - [`manager`]: grouping plus replay against the live tree
//!
//! Replays hold the shared [`RecordingSwitch`] suspended, so undoing never
//! creates history of its own.

pub mod manager;
pub mod recorder;
pub mod store;

pub use manager::UndoManager;
pub use recorder::{
    BatchFilter, PatchRecorder, RecordedEvent, RecorderOptions, RecordingSwitch, SuspendGuard,
};
pub use store::{HistoryConfig, UndoEvent, UndoGroup, UndoStore};
