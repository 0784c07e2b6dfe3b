#![forbid(unsafe_code)]

//! Undo manager: replays stored patch groups against the live tree.
//!
//! Undo pops the newest group and applies its events' inverse patch lists
//! newest event first; each event's list is one atomic
//! [`StateTree::apply`]. Redo applies the forward lists oldest first. Both
//! run with the shared [`RecordingSwitch`] suspended so the replay never
//! records new history.
//!
//! # Failure Modes
//!
//! | Failure | Cause | Outcome |
//! |---------|-------|---------|
//! | `NothingToUndo` / `NothingToRedo` | Empty stack | Stacks unchanged |
//! | `Patch` | Tree no longer matches the history (e.g. replaced by a snapshot) | Partially replayed events rolled back, group stays on its stack |

use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};

use serde_json::Value;
use tracing::{debug, debug_span, warn};

use super::recorder::RecordingSwitch;
use super::store::{HistoryConfig, UndoEvent, UndoGroup, UndoStore};
use crate::error::UndoError;
use crate::patch::Patch;
use crate::tree::StateTree;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Replay {
    Undo,
    Redo,
}

impl Replay {
    fn patches(self, event: &UndoEvent) -> Vec<Patch> {
        match self {
            Self::Undo => event.inverse_patches.iter().rev().cloned().collect(),
            Self::Redo => event.patches.clone(),
        }
    }

    fn opposite(self) -> Self {
        match self {
            Self::Undo => Self::Redo,
            Self::Redo => Self::Undo,
        }
    }
}

/// Undo/redo over a [`StateTree`].
#[derive(Debug, Default)]
pub struct UndoManager {
    store: UndoStore,
    switch: RecordingSwitch,
}

impl UndoManager {
    #[must_use]
    pub fn new(config: HistoryConfig) -> Self {
        Self {
            store: UndoStore::new(config),
            switch: RecordingSwitch::new(),
        }
    }

    #[must_use]
    pub fn store(&self) -> &UndoStore {
        &self.store
    }

    /// Switch that recorders consult; suspended during replay.
    #[must_use]
    pub fn recording_switch(&self) -> RecordingSwitch {
        self.switch.clone()
    }

    /// Store a finished action's patches.
    pub fn add_undo(&mut self, event: UndoEvent) {
        debug!(
            target: "tabletop.undo",
            action = %event.action_name,
            patches = event.patches.len(),
            grouping = self.store.is_grouping(),
            "undo event added"
        );
        self.store.add_undo(event);
    }

    pub fn start_group(&mut self) {
        self.store.start_group();
    }

    pub fn end_group(&mut self) {
        if self.store.end_group() {
            debug!(
                target: "tabletop.undo",
                depth = self.store.undo_depth(),
                "undo group closed"
            );
        }
    }

    /// Run `f` inside a group. The group is closed even if `f` panics.
    pub fn undo_group<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        self.start_group();
        let result = catch_unwind(AssertUnwindSafe(|| f(self)));
        self.end_group();
        match result {
            Ok(value) => value,
            Err(payload) => resume_unwind(payload),
        }
    }

    pub fn undo(&mut self, tree: &mut StateTree) -> Result<(), UndoError> {
        let group = self.store.pop_undo().ok_or(UndoError::NothingToUndo)?;
        let group = self.replay(tree, group, Replay::Undo)?;
        self.store.restore_redo(group);
        Ok(())
    }

    pub fn redo(&mut self, tree: &mut StateTree) -> Result<(), UndoError> {
        let group = self.store.pop_redo().ok_or(UndoError::NothingToRedo)?;
        let group = self.replay(tree, group, Replay::Redo)?;
        self.store.restore_undo(group);
        Ok(())
    }

    /// Apply `group` in `direction`. On failure the events already replayed
    /// are rolled back and the group is returned to the stack it came from.
    fn replay(
        &mut self,
        tree: &mut StateTree,
        group: UndoGroup,
        direction: Replay,
    ) -> Result<UndoGroup, UndoError> {
        let _span = debug_span!(
            "undo.replay",
            direction = ?direction,
            events = group.events.len(),
        )
        .entered();
        let _guard = self.switch.suspend();

        let order: Vec<usize> = match direction {
            Replay::Undo => (0..group.events.len()).rev().collect(),
            Replay::Redo => (0..group.events.len()).collect(),
        };
        for (done, &index) in order.iter().enumerate() {
            let patches = direction.patches(&group.events[index]);
            if let Err(err) = tree.apply(&patches) {
                warn!(
                    target: "tabletop.undo",
                    action = %group.events[index].action_name,
                    error = %err,
                    "history replay failed; rolling back"
                );
                for &undone in order[..done].iter().rev() {
                    let back = direction.opposite().patches(&group.events[undone]);
                    if let Err(rollback) = tree.apply(&back) {
                        warn!(target: "tabletop.undo", error = %rollback, "rollback failed");
                    }
                }
                match direction {
                    Replay::Undo => self.store.restore_undo(group),
                    Replay::Redo => self.store.restore_redo(group),
                }
                return Err(UndoError::Patch(err));
            }
        }
        debug!(
            target: "tabletop.undo",
            direction = ?direction,
            undo_depth = self.store.undo_depth(),
            redo_depth = self.store.redo_depth(),
            "history replayed"
        );
        Ok(group)
    }

    #[must_use]
    pub fn can_undo(&self) -> bool {
        self.store.can_undo()
    }

    #[must_use]
    pub fn can_redo(&self) -> bool {
        self.store.can_redo()
    }

    #[must_use]
    pub fn undo_depth(&self) -> usize {
        self.store.undo_depth()
    }

    #[must_use]
    pub fn redo_depth(&self) -> usize {
        self.store.redo_depth()
    }

    /// Name of the action `undo()` would revert.
    #[must_use]
    pub fn next_undo_name(&self) -> Option<&str> {
        self.store.peek_undo().and_then(UndoGroup::name)
    }

    #[must_use]
    pub fn next_redo_name(&self) -> Option<&str> {
        self.store.peek_redo().and_then(UndoGroup::name)
    }

    pub fn clear(&mut self) {
        self.store.clear();
    }

    /// Document form of both stacks for persistence.
    pub fn serialize(&self) -> Result<Value, UndoError> {
        serde_json::to_value(&self.store).map_err(UndoError::Snapshot)
    }

    /// Replace both stacks with a persisted history.
    ///
    /// The configured depth limit is kept and enforced on the loaded stacks.
    pub fn apply_snapshot(&mut self, snapshot: Value) -> Result<(), UndoError> {
        let mut store: UndoStore = serde_json::from_value(snapshot).map_err(UndoError::Snapshot)?;
        store.set_config(self.store.config().clone());
        self.store = store;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::Path;
    use serde_json::json;

    use std::sync::{Arc, Mutex};
    use tracing_subscriber::layer::SubscriberExt;

    fn p(s: &str) -> Path {
        Path::parse(s).unwrap()
    }

    fn set_event(name: &str, path: &str, from: Value, to: Value) -> UndoEvent {
        UndoEvent {
            target_path: p(path),
            action_name: name.to_string(),
            patches: vec![Patch::Replace {
                path: p(path),
                value: to,
            }],
            inverse_patches: vec![Patch::Replace {
                path: p(path),
                value: from,
            }],
        }
    }

    fn tree_with_x(x: i64) -> StateTree {
        StateTree::new(json!({"x": x, "y": 0}))
    }

    #[test]
    fn undo_on_empty_stack_fails_without_touching_stacks() {
        let mut manager = UndoManager::default();
        let mut tree = tree_with_x(0);
        assert!(matches!(manager.undo(&mut tree), Err(UndoError::NothingToUndo)));
        assert!(matches!(manager.redo(&mut tree), Err(UndoError::NothingToRedo)));
        assert_eq!(manager.undo_depth(), 0);
        assert_eq!(manager.redo_depth(), 0);
    }

    #[test]
    fn undo_then_redo_moves_group_between_stacks() {
        let mut manager = UndoManager::default();
        let mut tree = tree_with_x(1);
        manager.add_undo(set_event("bump", "/x", json!(0), json!(1)));

        manager.undo(&mut tree).unwrap();
        assert_eq!(tree.root()["x"], json!(0));
        assert!(!manager.can_undo());
        assert!(manager.can_redo());
        assert_eq!(manager.next_redo_name(), Some("bump"));

        manager.redo(&mut tree).unwrap();
        assert_eq!(tree.root()["x"], json!(1));
        assert!(manager.can_undo());
        assert!(!manager.can_redo());
    }

    #[test]
    fn group_undoes_events_newest_first() {
        let mut manager = UndoManager::default();
        let mut tree = tree_with_x(2);
        manager.undo_group(|m| {
            m.add_undo(set_event("a", "/x", json!(0), json!(1)));
            m.add_undo(set_event("b", "/x", json!(1), json!(2)));
        });
        assert_eq!(manager.undo_depth(), 1);
        manager.undo(&mut tree).unwrap();
        assert_eq!(tree.root()["x"], json!(0));
        assert_eq!(tree.version(), 2);
    }

    #[test]
    fn group_closes_when_body_panics() {
        let mut manager = UndoManager::default();
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            manager.undo_group(|m| {
                m.add_undo(set_event("a", "/x", json!(0), json!(1)));
                if m.store().is_grouping() {
                    panic!("boom");
                }
            });
        }));
        assert!(outcome.is_err());
        assert!(!manager.store().is_grouping());
        assert_eq!(manager.undo_depth(), 1);
    }

    #[test]
    fn failed_replay_rolls_back_and_keeps_group() {
        let mut manager = UndoManager::default();
        let mut tree = tree_with_x(1);
        manager.undo_group(|m| {
            m.add_undo(UndoEvent {
                target_path: p("/gone"),
                action_name: "stale".into(),
                patches: vec![Patch::Add {
                    path: p("/gone"),
                    value: json!(true),
                }],
                inverse_patches: vec![Patch::Remove { path: p("/gone") }],
            });
            m.add_undo(set_event("bump", "/x", json!(0), json!(1)));
        });

        let err = manager.undo(&mut tree);
        assert!(matches!(err, Err(UndoError::Patch(_))));
        assert_eq!(tree.root()["x"], json!(1));
        assert_eq!(manager.undo_depth(), 1);
        assert!(!manager.can_redo());
    }

    #[test]
    fn replay_suspends_the_recording_switch() {
        let mut manager = UndoManager::default();
        let mut tree = tree_with_x(1);
        let switch = manager.recording_switch();
        let seen = std::rc::Rc::new(std::cell::Cell::new(false));
        let probe = std::rc::Rc::clone(&seen);
        let _sub = tree.subscribe(move |_| probe.set(switch.is_suspended()));
        manager.add_undo(set_event("bump", "/x", json!(0), json!(1)));
        manager.undo(&mut tree).unwrap();
        assert!(seen.get());
        assert!(!manager.recording_switch().is_suspended());
    }

    #[test]
    fn serialize_and_apply_snapshot_restore_history() {
        let mut manager = UndoManager::default();
        manager.add_undo(set_event("bump", "/x", json!(0), json!(1)));
        let doc = manager.serialize().unwrap();

        let mut restored = UndoManager::new(HistoryConfig::new(10));
        restored.apply_snapshot(doc).unwrap();
        assert_eq!(restored.next_undo_name(), Some("bump"));
        assert_eq!(restored.store().config().max_depth, 10);

        assert!(matches!(
            restored.apply_snapshot(json!("nope")),
            Err(UndoError::Snapshot(_))
        ));
    }

    #[test]
    fn snapshot_taken_mid_group_restores_closed_history_only() {
        let mut manager = UndoManager::default();
        manager.add_undo(set_event("place", "/x", json!(0), json!(1)));
        manager.start_group();
        manager.add_undo(set_event("drag", "/x", json!(1), json!(2)));
        let doc = manager.serialize().unwrap();

        let mut restored = UndoManager::default();
        restored.apply_snapshot(doc).unwrap();
        assert!(!restored.store().is_grouping());
        assert_eq!(restored.store().pending_group_len(), 0);
        assert_eq!(restored.undo_depth(), 1);
        assert_eq!(restored.next_undo_name(), Some("place"));

        restored.add_undo(set_event("bump", "/x", json!(1), json!(3)));
        assert_eq!(restored.undo_depth(), 2);
    }

    #[derive(Clone, Default)]
    struct Targets(Arc<Mutex<Vec<String>>>);

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for Targets {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
            self.0
                .lock()
                .unwrap()
                .push(event.metadata().target().to_string());
        }
    }

    #[test]
    fn replay_logs_under_undo_target() {
        let targets = Targets::default();
        let subscriber = tracing_subscriber::registry().with(targets.clone());
        tracing::subscriber::with_default(subscriber, || {
            let mut manager = UndoManager::default();
            let mut tree = tree_with_x(1);
            manager.add_undo(set_event("bump", "/x", json!(0), json!(1)));
            manager.undo(&mut tree).unwrap();
        });
        let targets = targets.0.lock().unwrap();
        assert!(targets.iter().any(|t| t == "tabletop.undo"));
    }
}
