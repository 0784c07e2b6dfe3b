#![forbid(unsafe_code)]

//! Serializable undo/redo stacks of patch groups.
//!
//! # Invariants
//!
//! 1. `undo.len() <= config.max_depth` after every push.
//! 2. A push outside an open group clears the redo stack.
//! 3. While a group is open, pushes land in the group buffer; closing the
//!    outermost group moves a non-empty buffer onto the undo stack as one
//!    entry (clearing redo).
//!
//! ```text
//! add(e1) add(e2)          start  add(e3) add(e4)  end
//! ┌──────────────────┐     ┌─────────────────────────────┐
//! │ undo: [e1] [e2]  │ ──▶ │ undo: [e1] [e2] [e3 e4]     │
//! └──────────────────┘     └─────────────────────────────┘
//! ```

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::patch::Patch;
use crate::path::Path;

/// One root action's accumulated patches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UndoEvent {
    pub target_path: Path,
    pub action_name: String,
    /// Forward patches in the order they were committed.
    pub patches: Vec<Patch>,
    /// `inverse_patches[i]` undoes `patches[i]`; apply them in reverse.
    pub inverse_patches: Vec<Patch>,
}

/// Events undone and redone as a single step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UndoGroup {
    pub events: Vec<UndoEvent>,
}

impl UndoGroup {
    #[must_use]
    pub fn single(event: UndoEvent) -> Self {
        Self {
            events: vec![event],
        }
    }

    /// Name of the most recent action in the group.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.events.last().map(|e| e.action_name.as_str())
    }
}

/// Limits for the undo history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Maximum number of groups kept on the undo stack.
    pub max_depth: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { max_depth: 100 }
    }
}

impl HistoryConfig {
    #[must_use]
    pub fn new(max_depth: usize) -> Self {
        Self { max_depth }
    }

    /// No depth limit (for testing).
    #[must_use]
    pub fn unlimited() -> Self {
        Self {
            max_depth: usize::MAX,
        }
    }
}

/// Undo and redo stacks (newest at the back) plus the open group buffer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UndoStore {
    undo: VecDeque<UndoGroup>,
    redo: VecDeque<UndoGroup>,
    // An open group belongs to a live interaction; only closed groups persist.
    #[serde(skip)]
    group_depth: u32,
    #[serde(skip)]
    group_buffer: Vec<UndoEvent>,
    #[serde(skip)]
    config: HistoryConfig,
}

impl UndoStore {
    #[must_use]
    pub fn new(config: HistoryConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn config(&self) -> &HistoryConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: HistoryConfig) {
        self.config = config;
        self.enforce_depth();
    }

    /// Record a finished action.
    pub fn add_undo(&mut self, event: UndoEvent) {
        if self.is_grouping() {
            self.group_buffer.push(event);
            return;
        }
        self.push_group(UndoGroup::single(event));
    }

    pub fn start_group(&mut self) {
        self.group_depth += 1;
    }

    /// Close one level of grouping. Returns `true` when a group was pushed.
    pub fn end_group(&mut self) -> bool {
        if self.group_depth == 0 {
            return false;
        }
        self.group_depth -= 1;
        if self.group_depth > 0 || self.group_buffer.is_empty() {
            return false;
        }
        let events = std::mem::take(&mut self.group_buffer);
        self.push_group(UndoGroup { events });
        true
    }

    #[must_use]
    pub fn is_grouping(&self) -> bool {
        self.group_depth > 0
    }

    /// Events buffered in the open group.
    #[must_use]
    pub fn pending_group_len(&self) -> usize {
        self.group_buffer.len()
    }

    #[must_use]
    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    #[must_use]
    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    #[must_use]
    pub fn undo_depth(&self) -> usize {
        self.undo.len()
    }

    #[must_use]
    pub fn redo_depth(&self) -> usize {
        self.redo.len()
    }

    #[must_use]
    pub fn peek_undo(&self) -> Option<&UndoGroup> {
        self.undo.back()
    }

    #[must_use]
    pub fn peek_redo(&self) -> Option<&UndoGroup> {
        self.redo.back()
    }

    pub(crate) fn pop_undo(&mut self) -> Option<UndoGroup> {
        self.undo.pop_back()
    }

    pub(crate) fn pop_redo(&mut self) -> Option<UndoGroup> {
        self.redo.pop_back()
    }

    /// Return a replayed group to the undo stack without touching redo.
    pub(crate) fn restore_undo(&mut self, group: UndoGroup) {
        self.undo.push_back(group);
        self.enforce_depth();
    }

    pub(crate) fn restore_redo(&mut self, group: UndoGroup) {
        self.redo.push_back(group);
    }

    /// Drop all history, including an open group's buffer.
    pub fn clear(&mut self) {
        self.undo.clear();
        self.redo.clear();
        self.group_buffer.clear();
        self.group_depth = 0;
    }

    fn push_group(&mut self, group: UndoGroup) {
        self.redo.clear();
        self.undo.push_back(group);
        self.enforce_depth();
    }

    fn enforce_depth(&mut self) {
        while self.undo.len() > self.config.max_depth {
            self.undo.pop_front();
        }
    }
}
