#![forbid(unsafe_code)]

//! Explicit publish/subscribe primitives.
//!
//! State-tree commits publish their patch batches through a
//! [`SubscriberList`]; consumers that only care that *something* changed
//! (the host's full-state broadcast) mark a [`Debouncer`] and poll it from
//! the event loop.

pub mod debounce;
pub mod subscribers;

pub use debounce::{Debouncer, DirtyFlag};
pub use subscribers::{SubscriberList, Subscription};
