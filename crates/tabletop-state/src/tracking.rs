#![forbid(unsafe_code)]

//! Action tracking middleware.
//!
//! Every root action gets its own [`PatchRecorder`]. The recorder only
//! records while its resume counter is positive, so a flow that is parked
//! between steps never captures patches from unrelated actions that run in
//! the meantime.
//!
//! ```text
//! Idle ──start──▶ Started ──resume──▶ Resumed ◀──┐
//!                                       │        │ resume
//!                                    suspend     │
//!                                       ▼        │
//!                                   Suspended ───┘
//!                                       │
//!                                    finish ──▶ Finished (recorder disposed)
//! ```
//!
//! Nested actions invoked through [`ActionCx::call`] do not start a recorder
//! of their own; they resume and suspend the root's.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, trace};

use crate::error::{ActionError, TreeError};
use crate::patch::Patch;
use crate::path::Path;
use crate::tree::StateTree;
use crate::undo::{PatchRecorder, RecorderOptions, RecordingSwitch, UndoEvent};

/// Identifier of a tracked root action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActionId(u64);

impl ActionId {
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A named invocation against a target path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    pub name: String,
    pub target: Path,
}

impl Action {
    #[must_use]
    pub fn new(name: impl Into<String>, target: Path) -> Self {
        Self {
            name: name.into(),
            target,
        }
    }
}

/// Lifecycle phase of a root action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionPhase {
    Idle,
    Started,
    Resumed,
    Suspended,
    Finished,
}

/// Observer of phase transitions.
pub type PhaseListener = Box<dyn FnMut(ActionId, &Action, ActionPhase)>;

struct TrackedAction {
    action: Action,
    recorder: PatchRecorder,
    phase: ActionPhase,
}

/// Correlates root actions with their patch recorders.
pub struct ActionTracker {
    next_id: u64,
    active: BTreeMap<ActionId, TrackedAction>,
    scope: Path,
    switch: RecordingSwitch,
    listener: Option<PhaseListener>,
}

impl fmt::Debug for ActionTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionTracker")
            .field("active", &self.active.len())
            .field("scope", &self.scope.to_string())
            .finish()
    }
}

impl ActionTracker {
    /// Track actions whose undoable patches live under `scope`.
    #[must_use]
    pub fn new(scope: Path, switch: RecordingSwitch) -> Self {
        Self {
            next_id: 1,
            active: BTreeMap::new(),
            scope,
            switch,
            listener: None,
        }
    }

    #[must_use]
    pub fn scope(&self) -> &Path {
        &self.scope
    }

    pub fn set_listener(&mut self, listener: impl FnMut(ActionId, &Action, ActionPhase) + 'static) {
        self.listener = Some(Box::new(listener));
    }

    /// Begin tracking a root action. Recording starts on the first resume.
    pub fn start(&mut self, tree: &StateTree, action: Action) -> ActionId {
        let id = ActionId(self.next_id);
        self.next_id += 1;

        let scope = self.scope.clone();
        let switch = self.switch.clone();
        let recorder = PatchRecorder::attach(
            tree,
            RecorderOptions::default().with_filter(move |batch| {
                !switch.is_suspended()
                    && batch.iter().all(|pair| pair.patch.path().starts_with(&scope))
            }),
        );
        self.active.insert(
            id,
            TrackedAction {
                action,
                recorder,
                phase: ActionPhase::Idle,
            },
        );
        self.transition(id, ActionPhase::Started);
        id
    }

    /// Increment the action's resume counter. Returns `false` if `id` is not active.
    pub fn resume(&mut self, id: ActionId) -> bool {
        let Some(tracked) = self.active.get(&id) else {
            return false;
        };
        tracked.recorder.resume();
        self.transition(id, ActionPhase::Resumed);
        true
    }

    pub fn suspend(&mut self, id: ActionId) -> bool {
        let Some(tracked) = self.active.get(&id) else {
            return false;
        };
        tracked.recorder.suspend();
        self.transition(id, ActionPhase::Suspended);
        true
    }

    /// Stop tracking and collect the action's patches into one event.
    ///
    /// Returns `None` when the action recorded nothing or was not active.
    pub fn finish(&mut self, id: ActionId) -> Option<UndoEvent> {
        self.transition(id, ActionPhase::Finished);
        let TrackedAction {
            action,
            mut recorder,
            ..
        } = self.active.remove(&id)?;
        recorder.dispose();

        let events = recorder.take_events();
        if events.is_empty() {
            return None;
        }
        let mut patches = Vec::new();
        let mut inverse_patches = Vec::new();
        for event in events {
            patches.extend(event.patches);
            inverse_patches.extend(event.inverse_patches);
        }
        Some(UndoEvent {
            target_path: action.target,
            action_name: action.name,
            patches,
            inverse_patches,
        })
    }

    #[must_use]
    pub fn is_active(&self, id: ActionId) -> bool {
        self.active.contains_key(&id)
    }

    #[must_use]
    pub fn phase(&self, id: ActionId) -> ActionPhase {
        self.active
            .get(&id)
            .map_or(ActionPhase::Idle, |tracked| tracked.phase)
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    fn transition(&mut self, id: ActionId, phase: ActionPhase) {
        let Some(tracked) = self.active.get_mut(&id) else {
            return;
        };
        tracked.phase = phase;
        if matches!(phase, ActionPhase::Started | ActionPhase::Finished) {
            debug!(
                target: "tabletop.tracking",
                id = id.raw(),
                action = %tracked.action.name,
                phase = ?phase,
                events = tracked.recorder.event_count(),
                "action phase"
            );
        } else {
            trace!(
                target: "tabletop.tracking",
                id = id.raw(),
                depth = tracked.recorder.depth(),
                phase = ?phase,
                "action phase"
            );
        }
        if let Some(listener) = self.listener.as_mut() {
            listener(id, &tracked.action, phase);
        }
    }
}

/// Mutation context handed to action bodies.
///
/// Writes go straight to the tree; the root action's recorder picks them up.
pub struct ActionCx<'a> {
    tree: &'a mut StateTree,
    tracker: &'a mut ActionTracker,
    root: ActionId,
    depth: u32,
}

impl<'a> ActionCx<'a> {
    pub(crate) fn new(tree: &'a mut StateTree, tracker: &'a mut ActionTracker, root: ActionId) -> Self {
        Self {
            tree,
            tracker,
            root,
            depth: 0,
        }
    }

    #[must_use]
    pub fn tree(&self) -> &StateTree {
        &*self.tree
    }

    #[must_use]
    pub fn root(&self) -> ActionId {
        self.root
    }

    /// Nesting depth; 0 for the root action's body.
    #[must_use]
    pub fn depth(&self) -> u32 {
        self.depth
    }

    #[must_use]
    pub fn get(&self, path: &Path) -> Option<&Value> {
        self.tree.get(path)
    }

    pub fn get_as<T: DeserializeOwned>(&self, path: &Path) -> Result<T, TreeError> {
        self.tree.get_as(path)
    }

    pub fn set(&mut self, path: &Path, value: Value) -> Result<(), TreeError> {
        self.tree.set(path, value)
    }

    pub fn set_as<T: Serialize + ?Sized>(&mut self, path: &Path, value: &T) -> Result<(), TreeError> {
        self.tree.set_as(path, value)
    }

    pub fn remove(&mut self, path: &Path) -> Result<Value, TreeError> {
        self.tree.remove(path)
    }

    pub fn push(&mut self, path: &Path, value: Value) -> Result<usize, TreeError> {
        self.tree.push(path, value)
    }

    pub fn apply(&mut self, patches: &[Patch]) -> Result<(), TreeError> {
        self.tree.apply(patches)
    }

    /// Invoke a nested action. It records into the root action's event.
    pub fn call<R>(
        &mut self,
        action: Action,
        f: impl FnOnce(&mut ActionCx<'_>) -> Result<R, ActionError>,
    ) -> Result<R, ActionError> {
        trace!(
            target: "tabletop.tracking",
            root = self.root.raw(),
            nested = %action.name,
            depth = self.depth + 1,
            "nested action"
        );
        self.tracker.resume(self.root);
        let result = {
            let mut child = ActionCx {
                tree: &mut *self.tree,
                tracker: &mut *self.tracker,
                root: self.root,
                depth: self.depth + 1,
            };
            f(&mut child)
        };
        self.tracker.suspend(self.root);
        result
    }
}

impl fmt::Debug for ActionCx<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionCx")
            .field("root", &self.root)
            .field("depth", &self.depth)
            .finish()
    }
}
