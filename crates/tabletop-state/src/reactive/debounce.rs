#![forbid(unsafe_code)]

//! Coalescing of bursts of change notifications.
//!
//! A [`Debouncer`] turns many "something changed" marks into a single
//! firing. Marks are cheap (`Rc<Cell<bool>>` through a [`DirtyFlag`]) so they
//! can be raised from subscriber callbacks; the owner polls with an explicit
//! `now` and fires once the window has elapsed since the first unflushed mark.
//!
//! The window is measured from the first mark, not the last, so a continuous
//! drag still produces updates at a bounded rate.
//!
//! ```text
//! mark  mark mark            mark
//!  │     │    │               │
//!  ├─────window────┤          ├─────window────┤
//!                  fire                       fire
//! ```

use std::cell::Cell;
use std::rc::Rc;

use web_time::{Duration, Instant};

/// Shared "dirty" bit raised by change observers.
#[derive(Debug, Clone, Default)]
pub struct DirtyFlag(Rc<Cell<bool>>);

impl DirtyFlag {
    /// Raise the flag.
    pub fn mark(&self) {
        self.0.set(true);
    }

    /// Read and clear the flag.
    pub fn take(&self) -> bool {
        self.0.replace(false)
    }

    #[must_use]
    pub fn is_marked(&self) -> bool {
        self.0.get()
    }
}

/// Fires at most once per window for any number of marks.
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    flag: DirtyFlag,
    pending_since: Option<Instant>,
    fired: u64,
}

impl Debouncer {
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            flag: DirtyFlag::default(),
            pending_since: None,
            fired: 0,
        }
    }

    /// A handle that observers use to mark changes.
    #[must_use]
    pub fn flag(&self) -> DirtyFlag {
        self.flag.clone()
    }

    pub fn mark(&self) {
        self.flag.mark();
    }

    /// Whether a firing is owed (marked but not yet fired).
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.pending_since.is_some() || self.flag.is_marked()
    }

    /// Returns `true` exactly when the coalesced work should run now.
    pub fn poll(&mut self, now: Instant) -> bool {
        if self.flag.take() && self.pending_since.is_none() {
            self.pending_since = Some(now);
        }
        match self.pending_since {
            Some(since) if now.saturating_duration_since(since) >= self.window => {
                self.pending_since = None;
                self.fired += 1;
                true
            }
            _ => false,
        }
    }

    /// Drop any owed firing (used after an out-of-band flush).
    pub fn reset(&mut self) {
        self.flag.take();
        self.pending_since = None;
    }

    /// Number of times [`poll`](Self::poll) has fired.
    #[must_use]
    pub fn fired(&self) -> u64 {
        self.fired
    }

    #[must_use]
    pub fn window(&self) -> Duration {
        self.window
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_debouncer_never_fires() {
        let mut d = Debouncer::new(Duration::from_millis(10));
        assert!(!d.poll(Instant::now()));
        assert!(!d.is_pending());
    }

    #[test]
    fn zero_window_fires_on_first_poll() {
        let mut d = Debouncer::new(Duration::ZERO);
        d.mark();
        assert!(d.poll(Instant::now()));
        assert!(!d.poll(Instant::now()));
        assert_eq!(d.fired(), 1);
    }

    #[test]
    fn burst_of_marks_fires_once_after_window() {
        let start = Instant::now();
        let mut d = Debouncer::new(Duration::from_millis(50));
        let flag = d.flag();

        flag.mark();
        assert!(!d.poll(start));
        flag.mark();
        flag.mark();
        assert!(!d.poll(start + Duration::from_millis(20)));
        assert!(d.poll(start + Duration::from_millis(50)));
        assert!(!d.poll(start + Duration::from_millis(200)));
        assert_eq!(d.fired(), 1);
    }

    #[test]
    fn reset_discards_pending_work() {
        let mut d = Debouncer::new(Duration::ZERO);
        d.mark();
        d.reset();
        assert!(!d.poll(Instant::now()));
    }
}
