#![forbid(unsafe_code)]

//! Patch recorder: captures forward/inverse patches committed to a tree.
//!
//! A [`PatchRecorder`] subscribes to a [`StateTree`] and, while recording,
//! turns every committed batch into one [`RecordedEvent`]. An optional batch
//! filter decides which batches are kept; the action tracker uses it to
//! restrict recording to the undoable subtree and to honour the global
//! [`RecordingSwitch`] raised while undo/redo replays patches.
//!
//! # Invariants
//!
//! 1. Events are appended in commit order.
//! 2. `is_recording()` after `resume`/`suspend` is `true` iff more resumes
//!    than suspends have been seen.
//! 3. Nothing is recorded after [`dispose`](PatchRecorder::dispose);
//!    disposing twice is a no-op.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use crate::patch::{Patch, PatchPair};
use crate::reactive::Subscription;
use crate::tree::StateTree;

/// Predicate over a committed patch batch.
pub type BatchFilter = Box<dyn Fn(&[PatchPair]) -> bool>;

/// Patches produced by one committed batch.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    pub patches: Vec<Patch>,
    /// `inverse_patches[i]` undoes `patches[i]`.
    pub inverse_patches: Vec<Patch>,
}

impl RecordedEvent {
    fn from_batch(batch: &[PatchPair]) -> Self {
        let (patches, inverse_patches) = batch
            .iter()
            .map(|pair| (pair.patch.clone(), pair.inverse.clone()))
            .unzip();
        Self {
            patches,
            inverse_patches,
        }
    }
}

/// Attach-time options.
#[derive(Default)]
pub struct RecorderOptions {
    /// Initial value of the recording flag.
    pub recording: bool,
    pub filter: Option<BatchFilter>,
}

impl RecorderOptions {
    #[must_use]
    pub fn recording() -> Self {
        Self {
            recording: true,
            filter: None,
        }
    }

    #[must_use]
    pub fn with_filter(mut self, filter: impl Fn(&[PatchPair]) -> bool + 'static) -> Self {
        self.filter = Some(Box::new(filter));
        self
    }
}

impl fmt::Debug for RecorderOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecorderOptions")
            .field("recording", &self.recording)
            .field("filter", &self.filter.is_some())
            .finish()
    }
}

#[derive(Debug, Default)]
struct RecorderState {
    events: Vec<RecordedEvent>,
    recording: bool,
    depth: u32,
}

struct RecorderInner {
    state: RefCell<RecorderState>,
    filter: Option<BatchFilter>,
}

impl RecorderInner {
    fn observe(&self, batch: &[PatchPair]) {
        if !self.state.borrow().recording {
            return;
        }
        if let Some(filter) = &self.filter
            && !filter(batch)
        {
            return;
        }
        self.state
            .borrow_mut()
            .events
            .push(RecordedEvent::from_batch(batch));
    }
}

/// Records patch batches committed to a tree while its flag is raised.
pub struct PatchRecorder {
    inner: Rc<RecorderInner>,
    subscription: Option<Subscription>,
}

impl fmt::Debug for PatchRecorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.borrow();
        f.debug_struct("PatchRecorder")
            .field("events", &state.events.len())
            .field("recording", &state.recording)
            .field("depth", &state.depth)
            .field("disposed", &self.subscription.is_none())
            .finish()
    }
}

impl PatchRecorder {
    /// Start observing `tree`.
    #[must_use]
    pub fn attach(tree: &StateTree, options: RecorderOptions) -> Self {
        let inner = Rc::new(RecorderInner {
            state: RefCell::new(RecorderState {
                recording: options.recording,
                ..RecorderState::default()
            }),
            filter: options.filter,
        });
        let sink = Rc::clone(&inner);
        let subscription = tree.subscribe(move |batch| sink.observe(batch));
        Self {
            inner,
            subscription: Some(subscription),
        }
    }

    /// Events recorded so far.
    #[must_use]
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.inner.state.borrow().events.clone()
    }

    #[must_use]
    pub fn event_count(&self) -> usize {
        self.inner.state.borrow().events.len()
    }

    /// Move the recorded events out, leaving the recorder empty.
    pub fn take_events(&mut self) -> Vec<RecordedEvent> {
        std::mem::take(&mut self.inner.state.borrow_mut().events)
    }

    pub fn set_recording(&self, recording: bool) {
        self.inner.state.borrow_mut().recording = recording;
    }

    #[must_use]
    pub fn is_recording(&self) -> bool {
        self.inner.state.borrow().recording
    }

    /// Increment the resume counter and start recording.
    pub fn resume(&self) {
        let mut state = self.inner.state.borrow_mut();
        state.depth += 1;
        state.recording = true;
    }

    /// Decrement the resume counter; recording stops when it reaches zero.
    pub fn suspend(&self) {
        let mut state = self.inner.state.borrow_mut();
        state.depth = state.depth.saturating_sub(1);
        state.recording = state.depth > 0;
    }

    #[must_use]
    pub fn depth(&self) -> u32 {
        self.inner.state.borrow().depth
    }

    /// Stop observing the tree. Safe to call more than once.
    pub fn dispose(&mut self) {
        if self.subscription.take().is_some() {
            self.inner.state.borrow_mut().recording = false;
        }
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.subscription.is_none()
    }
}

/// Process-wide "recording suspended" switch.
///
/// Cloned into every recorder filter; undo and redo hold a [`SuspendGuard`]
/// while replaying so the replay itself is never recorded.
#[derive(Debug, Clone, Default)]
pub struct RecordingSwitch(Rc<Cell<u32>>);

impl RecordingSwitch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Suspend recording until the returned guard is dropped.
    pub fn suspend(&self) -> SuspendGuard {
        self.0.set(self.0.get() + 1);
        SuspendGuard(self.clone())
    }

    #[must_use]
    pub fn is_suspended(&self) -> bool {
        self.0.get() > 0
    }
}

/// Re-enables recording on drop.
#[must_use = "recording resumes as soon as the guard is dropped"]
#[derive(Debug)]
pub struct SuspendGuard(RecordingSwitch);

impl Drop for SuspendGuard {
    fn drop(&mut self) {
        let count = &(self.0).0;
        count.set(count.get().saturating_sub(1));
    }
}
