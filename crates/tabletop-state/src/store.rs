#![forbid(unsafe_code)]

//! The explicitly constructed state context.
//!
//! A [`Store`] bundles the tree, the undo manager and the action tracker.
//! One exists per runtime; every component receives it by reference instead
//! of reaching for a global.
//!
//! Synchronous actions go through [`Store::run`]. Asynchronous ones are
//! flows: [`begin_flow`](Store::begin_flow), any number of
//! [`flow_step`](Store::flow_step)s with other work interleaved between them,
//! then [`end_flow`](Store::end_flow). An action that fails or panics is
//! still finished and its already-recorded patches are still pushed.

use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};

use serde_json::Value;

use crate::error::{ActionError, TreeError, UndoError};
use crate::model::paths;
use crate::path::Path;
use crate::tracking::{Action, ActionCx, ActionId, ActionTracker};
use crate::tree::StateTree;
use crate::undo::{HistoryConfig, UndoManager};

/// Handle of a running flow.
pub type FlowId = ActionId;

/// Tree, undo history and action tracking for one runtime.
#[derive(Debug)]
pub struct Store {
    tree: StateTree,
    undo: UndoManager,
    tracker: ActionTracker,
}

impl Store {
    /// Undoable scope defaults to `/entities`.
    #[must_use]
    pub fn new(tree: StateTree, history: HistoryConfig) -> Self {
        Self::with_scope(tree, history, paths::entities())
    }

    #[must_use]
    pub fn with_scope(tree: StateTree, history: HistoryConfig, scope: Path) -> Self {
        let undo = UndoManager::new(history);
        let tracker = ActionTracker::new(scope, undo.recording_switch());
        Self {
            tree,
            undo,
            tracker,
        }
    }

    #[must_use]
    pub fn tree(&self) -> &StateTree {
        &self.tree
    }

    /// Untracked access; writes made here never enter the undo history.
    pub fn tree_mut(&mut self) -> &mut StateTree {
        &mut self.tree
    }

    #[must_use]
    pub fn undo_manager(&self) -> &UndoManager {
        &self.undo
    }

    pub fn undo_manager_mut(&mut self) -> &mut UndoManager {
        &mut self.undo
    }

    #[must_use]
    pub fn tracker(&self) -> &ActionTracker {
        &self.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut ActionTracker {
        &mut self.tracker
    }

    /// Run a synchronous root action.
    pub fn run<R>(
        &mut self,
        action: Action,
        f: impl FnOnce(&mut ActionCx<'_>) -> Result<R, ActionError>,
    ) -> Result<R, ActionError> {
        let id = self.tracker.start(&self.tree, action);
        let result = self.step(id, f);
        self.finish(id);
        match result {
            Ok(result) => result,
            Err(payload) => resume_unwind(payload),
        }
    }

    /// Start an asynchronous root action. Nothing is recorded until a step runs.
    pub fn begin_flow(&mut self, action: Action) -> FlowId {
        self.tracker.start(&self.tree, action)
    }

    /// Run one step of a flow.
    ///
    /// A panicking step finishes the flow before the panic propagates.
    pub fn flow_step<R>(
        &mut self,
        flow: FlowId,
        f: impl FnOnce(&mut ActionCx<'_>) -> Result<R, ActionError>,
    ) -> Result<R, ActionError> {
        if !self.tracker.is_active(flow) {
            return Err(ActionError::FlowNotRunning(flow.raw()));
        }
        match self.step(flow, f) {
            Ok(result) => result,
            Err(payload) => {
                self.finish(flow);
                resume_unwind(payload)
            }
        }
    }

    /// Finish a flow and push its accumulated patches as one undo event.
    pub fn end_flow(&mut self, flow: FlowId) -> Result<(), ActionError> {
        if !self.tracker.is_active(flow) {
            return Err(ActionError::FlowNotRunning(flow.raw()));
        }
        self.finish(flow);
        Ok(())
    }

    #[must_use]
    pub fn is_flow_running(&self, flow: FlowId) -> bool {
        self.tracker.is_active(flow)
    }

    fn step<R>(
        &mut self,
        id: ActionId,
        f: impl FnOnce(&mut ActionCx<'_>) -> Result<R, ActionError>,
    ) -> std::thread::Result<Result<R, ActionError>> {
        self.tracker.resume(id);
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            let mut cx = ActionCx::new(&mut self.tree, &mut self.tracker, id);
            f(&mut cx)
        }));
        self.tracker.suspend(id);
        outcome
    }

    fn finish(&mut self, id: ActionId) {
        if let Some(event) = self.tracker.finish(id) {
            self.undo.add_undo(event);
        }
    }

    pub fn undo(&mut self) -> Result<(), UndoError> {
        self.undo.undo(&mut self.tree)
    }

    pub fn redo(&mut self) -> Result<(), UndoError> {
        self.undo.redo(&mut self.tree)
    }

    #[must_use]
    pub fn can_undo(&self) -> bool {
        self.undo.can_undo()
    }

    #[must_use]
    pub fn can_redo(&self) -> bool {
        self.undo.can_redo()
    }

    pub fn start_group(&mut self) {
        self.undo.start_group();
    }

    pub fn end_group(&mut self) {
        self.undo.end_group();
    }

    /// Run `f` with every finished action collected into one undo step.
    ///
    /// The group is closed even if `f` panics.
    pub fn undo_group<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        self.undo.start_group();
        let result = catch_unwind(AssertUnwindSafe(|| f(self)));
        self.undo.end_group();
        match result {
            Ok(value) => value,
            Err(payload) => resume_unwind(payload),
        }
    }

    /// Reconcile the tree with a full snapshot. Never recorded.
    pub fn apply_snapshot(&mut self, snapshot: Value) -> Result<usize, TreeError> {
        self.tree.apply_snapshot(snapshot)
    }
}
