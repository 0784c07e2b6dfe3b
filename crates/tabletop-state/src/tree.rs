#![forbid(unsafe_code)]

//! The mutable, hierarchical game-state tree.
//!
//! [`StateTree`] owns a single JSON document. Every committed mutation is
//! published to subscribers as a batch of [`PatchPair`]s, which is what the
//! patch recorder and the host's broadcast reaction consume.
//!
//! # Invariants
//!
//! 1. `version` increments by exactly 1 per committed batch.
//! 2. A mutation that leaves the document unchanged commits nothing.
//! 3. [`apply`](StateTree::apply) is atomic: either all patches commit as
//!    one batch or the tree is left untouched.
//! 4. Subscribers observe batches in commit order.
//!
//! # Snapshots
//!
//! [`apply_snapshot`](StateTree::apply_snapshot) reconciles an incoming full
//! document against the live one, matching nodes by their `"id"` field:
//!
//! - nodes (objects with an `id`) keep live fields the snapshot omits;
//! - collections (objects without an `id`) take their membership from the
//!   snapshot, so entries the host removed disappear;
//! - nodes whose ids differ are replaced wholesale.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::trace;

use crate::error::TreeError;
use crate::patch::{self, Patch, PatchPair};
use crate::path::Path;
use crate::reactive::{SubscriberList, Subscription};

/// The game-state document plus its change publisher.
pub struct StateTree {
    root: Value,
    version: u64,
    observers: SubscriberList<[PatchPair]>,
}

impl std::fmt::Debug for StateTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateTree")
            .field("version", &self.version)
            .field("observers", &self.observers.live_count())
            .finish()
    }
}

impl Default for StateTree {
    fn default() -> Self {
        Self::new(Value::Object(Map::new()))
    }
}

impl StateTree {
    /// Create a tree owning `root`.
    #[must_use]
    pub fn new(root: Value) -> Self {
        Self {
            root,
            version: 0,
            observers: SubscriberList::new(),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Value {
        &self.root
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Clone of the full document, suitable for serialization.
    #[must_use]
    pub fn snapshot(&self) -> Value {
        self.root.clone()
    }

    #[must_use]
    pub fn get(&self, path: &Path) -> Option<&Value> {
        patch::resolve(&self.root, path)
    }

    #[must_use]
    pub fn contains(&self, path: &Path) -> bool {
        self.get(path).is_some()
    }

    /// Deserialize the value at `path` into `T`.
    pub fn get_as<T: DeserializeOwned>(&self, path: &Path) -> Result<T, TreeError> {
        let value = self
            .get(path)
            .ok_or_else(|| TreeError::PathNotFound(path.clone()))?;
        T::deserialize(value).map_err(|source| TreeError::Shape {
            path: path.clone(),
            source,
        })
    }

    /// Write `value` at `path`, adding the key if it does not exist.
    ///
    /// The parent must exist. Writing an equal value is a no-op.
    pub fn set(&mut self, path: &Path, value: Value) -> Result<(), TreeError> {
        let patch = match self.get(path) {
            Some(current) if *current == value => return Ok(()),
            Some(_) => Patch::Replace {
                path: path.clone(),
                value,
            },
            None => Patch::Add {
                path: path.clone(),
                value,
            },
        };
        let pair = patch::apply_patch(&mut self.root, &patch)?;
        self.commit(vec![pair]);
        Ok(())
    }

    /// Serialize `value` and write it at `path`.
    pub fn set_as<T: Serialize + ?Sized>(&mut self, path: &Path, value: &T) -> Result<(), TreeError> {
        let value = serde_json::to_value(value).map_err(|source| TreeError::Shape {
            path: path.clone(),
            source,
        })?;
        self.set(path, value)
    }

    /// Remove and return the value at `path`.
    pub fn remove(&mut self, path: &Path) -> Result<Value, TreeError> {
        let pair = patch::apply_patch(&mut self.root, &Patch::Remove { path: path.clone() })?;
        let removed = match &pair.inverse {
            Patch::Add { value, .. } => value.clone(),
            _ => Value::Null,
        };
        self.commit(vec![pair]);
        Ok(removed)
    }

    /// Append `value` to the array at `path`, returning its index.
    pub fn push(&mut self, path: &Path, value: Value) -> Result<usize, TreeError> {
        let pair = patch::apply_patch(
            &mut self.root,
            &Patch::Add {
                path: path.child("-"),
                value,
            },
        )?;
        let index = pair
            .patch
            .path()
            .last()
            .and_then(|seg| seg.parse().ok())
            .unwrap_or_default();
        self.commit(vec![pair]);
        Ok(index)
    }

    /// Apply `patches` atomically as a single committed batch.
    pub fn apply(&mut self, patches: &[Patch]) -> Result<(), TreeError> {
        if patches.is_empty() {
            return Ok(());
        }
        let mut scratch = self.root.clone();
        let pairs = patch::apply_patches(&mut scratch, patches)?;
        self.root = scratch;
        self.commit(pairs);
        Ok(())
    }

    /// Reconcile the live document with a full snapshot.
    ///
    /// Returns the number of field-level patches that were committed.
    pub fn apply_snapshot(&mut self, snapshot: Value) -> Result<usize, TreeError> {
        let target = reconcile(&self.root, snapshot);
        let patches = patch::diff(&self.root, &target);
        let count = patches.len();
        self.apply(&patches)?;
        Ok(count)
    }

    /// Locate the node whose `"id"` equals `id`.
    #[must_use]
    pub fn find_node(&self, id: &str) -> Option<Path> {
        fn walk(node: &Value, at: &Path, id: &str) -> Option<Path> {
            match node {
                Value::Object(map) => {
                    if map.get("id").and_then(Value::as_str) == Some(id) {
                        return Some(at.clone());
                    }
                    map.iter()
                        .find_map(|(k, v)| walk(v, &at.child(k.as_str()), id))
                }
                Value::Array(items) => items
                    .iter()
                    .enumerate()
                    .find_map(|(i, v)| walk(v, &at.child(i.to_string()), id)),
                _ => None,
            }
        }
        walk(&self.root, &Path::root(), id)
    }

    /// Observe committed patch batches.
    pub fn subscribe(&self, callback: impl Fn(&[PatchPair]) + 'static) -> Subscription {
        self.observers.subscribe(callback)
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.observers.live_count()
    }

    fn commit(&mut self, pairs: Vec<PatchPair>) {
        if pairs.is_empty() {
            return;
        }
        self.version += 1;
        trace!(
            target: "tabletop.tree",
            version = self.version,
            patches = pairs.len(),
            first = %pairs[0].patch.path(),
            "tree commit"
        );
        self.observers.notify(&pairs);
    }
}

fn reconcile(live: &Value, incoming: Value) -> Value {
    match (live, incoming) {
        (Value::Object(current), Value::Object(mut next)) => {
            let is_node = current.contains_key("id") || next.contains_key("id");
            if is_node && current.get("id") != next.get("id") {
                return Value::Object(next);
            }
            let mut out = Map::new();
            if is_node {
                for (key, value) in current {
                    let merged = match next.remove(key) {
                        Some(incoming) => reconcile(value, incoming),
                        None => value.clone(),
                    };
                    out.insert(key.clone(), merged);
                }
                out.extend(next);
            } else {
                for (key, incoming) in next {
                    let merged = match current.get(&key) {
                        Some(value) => reconcile(value, incoming),
                        None => incoming,
                    };
                    out.insert(key, merged);
                }
            }
            Value::Object(out)
        }
        (_, incoming) => incoming,
    }
}
