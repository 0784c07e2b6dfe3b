#![forbid(unsafe_code)]

//! Publish/subscribe list with RAII subscription guards.
//!
//! # Design
//!
//! Callbacks are stored as `Weak` references; the strong `Rc` lives inside the
//! [`Subscription`] guard handed back to the subscriber. Dropping the guard
//! unsubscribes. Dead entries are pruned lazily on the next
//! [`notify`](SubscriberList::notify).
//!
//! # Invariants
//!
//! 1. Subscribers are notified in registration order.
//! 2. A callback is never invoked after its guard was dropped.
//! 3. Subscribing from inside a callback is allowed; the new subscriber is
//!    first notified on the following publish.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

type CallbackRc<T> = Rc<dyn Fn(&T)>;
type CallbackWeak<T> = Weak<dyn Fn(&T)>;

/// Ordered list of weakly held subscriber callbacks.
pub struct SubscriberList<T: ?Sized> {
    subscribers: RefCell<Vec<CallbackWeak<T>>>,
}

impl<T: ?Sized> Default for SubscriberList<T> {
    fn default() -> Self {
        Self {
            subscribers: RefCell::new(Vec::new()),
        }
    }
}

impl<T: ?Sized> fmt::Debug for SubscriberList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberList")
            .field("subscriber_count", &self.subscribers.borrow().len())
            .finish()
    }
}

impl<T: ?Sized + 'static> SubscriberList<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback. Dropping the returned guard unsubscribes it.
    pub fn subscribe(&self, callback: impl Fn(&T) + 'static) -> Subscription {
        let strong: CallbackRc<T> = Rc::new(callback);
        self.subscribers.borrow_mut().push(Rc::downgrade(&strong));
        Subscription {
            _guard: Box::new(strong),
        }
    }

    /// Invoke every live subscriber with `value` and prune dead entries.
    ///
    /// Returns the number of callbacks invoked.
    pub fn notify(&self, value: &T) -> usize {
        let callbacks: Vec<CallbackRc<T>> = {
            let mut subs = self.subscribers.borrow_mut();
            subs.retain(|w| w.strong_count() > 0);
            subs.iter().filter_map(Weak::upgrade).collect()
        };
        for cb in &callbacks {
            cb(value);
        }
        callbacks.len()
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.subscribers
            .borrow()
            .iter()
            .filter(|w| w.strong_count() > 0)
            .count()
    }
}

/// RAII guard for a subscriber callback.
///
/// Holds the only strong reference to the callback; once dropped the
/// publisher can no longer upgrade its weak entry.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    _guard: Box<dyn Any>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}
