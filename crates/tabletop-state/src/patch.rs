#![forbid(unsafe_code)]

//! Field-level change patches.
//!
//! Patches use the JSON-patch shape (`{"op": "replace", "path": .., "value": ..}`)
//! restricted to `add`, `replace` and `remove`. Applying a patch yields a
//! [`PatchPair`]: the normalized forward patch plus the patch that inverts it.
//!
//! # Invariants
//!
//! 1. For a pair `(p, q)` produced by [`apply_patch`], applying `q` right
//!    after `p` restores the document exactly.
//! 2. Applying a forward sequence and then its inverses in reverse order is a
//!    no-op (round-trip law).
//! 3. `diff(a, b)` applied to `a` yields `b`.
//!
//! Array `add` accepts the `-` segment (append); the recorded forward patch
//! always carries the concrete index.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::TreeError;
use crate::path::Path;

/// One change at a path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Patch {
    /// Insert into an object (or overwrite) or insert into an array.
    Add { path: Path, value: Value },
    /// Overwrite an existing value.
    Replace { path: Path, value: Value },
    /// Delete an existing value.
    Remove { path: Path },
}

impl Patch {
    /// The path the patch targets.
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::Add { path, .. } | Self::Replace { path, .. } | Self::Remove { path } => path,
        }
    }

    /// Short operation name for logging.
    #[must_use]
    pub fn op(&self) -> &'static str {
        match self {
            Self::Add { .. } => "add",
            Self::Replace { .. } => "replace",
            Self::Remove { .. } => "remove",
        }
    }
}

/// A committed change and the patch that reverts it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchPair {
    pub patch: Patch,
    pub inverse: Patch,
}

/// Apply one patch in place and return the normalized pair.
///
/// On error the document is unchanged.
pub fn apply_patch(doc: &mut Value, patch: &Patch) -> Result<PatchPair, TreeError> {
    let path = patch.path();
    let Some(parent_path) = path.parent() else {
        return apply_at_root(doc, patch);
    };
    let key = path.last().unwrap_or_default().to_string();
    let parent = resolve_mut(doc, &parent_path)?;

    match parent {
        Value::Object(map) => apply_in_object(map, path, &key, patch),
        Value::Array(items) => apply_in_array(items, &parent_path, &key, patch),
        _ => Err(TreeError::NotAContainer(parent_path)),
    }
}

/// Apply patches in order, stopping at the first failure.
///
/// Not atomic: callers that need all-or-nothing semantics apply to a scratch
/// copy first (see [`StateTree::apply`](crate::StateTree::apply)).
pub fn apply_patches(doc: &mut Value, patches: &[Patch]) -> Result<Vec<PatchPair>, TreeError> {
    patches.iter().map(|p| apply_patch(doc, p)).collect()
}

/// Compute the patches that turn `old` into `new`.
///
/// Objects carrying different `"id"` values are treated as different nodes
/// and replaced wholesale. Arrays of different length are replaced.
#[must_use]
pub fn diff(old: &Value, new: &Value) -> Vec<Patch> {
    let mut out = Vec::new();
    diff_into(&Path::root(), old, new, &mut out);
    out
}

fn diff_into(path: &Path, old: &Value, new: &Value, out: &mut Vec<Patch>) {
    if old == new {
        return;
    }
    match (old, new) {
        (Value::Object(a), Value::Object(b)) if a.get("id") == b.get("id") => {
            for (key, va) in a {
                match b.get(key) {
                    Some(vb) => diff_into(&path.child(key.as_str()), va, vb, out),
                    None => out.push(Patch::Remove {
                        path: path.child(key.as_str()),
                    }),
                }
            }
            for (key, vb) in b {
                if !a.contains_key(key) {
                    out.push(Patch::Add {
                        path: path.child(key.as_str()),
                        value: vb.clone(),
                    });
                }
            }
        }
        (Value::Array(a), Value::Array(b)) if a.len() == b.len() => {
            for (idx, (va, vb)) in a.iter().zip(b).enumerate() {
                diff_into(&path.child(idx.to_string()), va, vb, out);
            }
        }
        _ => out.push(Patch::Replace {
            path: path.clone(),
            value: new.clone(),
        }),
    }
}

/// Walk to the value at `path`.
pub(crate) fn resolve<'a>(doc: &'a Value, path: &Path) -> Option<&'a Value> {
    path.segments().iter().try_fold(doc, |node, seg| match node {
        Value::Object(map) => map.get(seg),
        Value::Array(items) => seg.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn resolve_mut<'a>(doc: &'a mut Value, path: &Path) -> Result<&'a mut Value, TreeError> {
    let mut node = doc;
    for seg in path.segments() {
        node = match node {
            Value::Object(map) => map.get_mut(seg),
            Value::Array(items) => seg.parse::<usize>().ok().and_then(|i| items.get_mut(i)),
            _ => None,
        }
        .ok_or_else(|| TreeError::PathNotFound(path.clone()))?;
    }
    Ok(node)
}

fn apply_at_root(doc: &mut Value, patch: &Patch) -> Result<PatchPair, TreeError> {
    match patch {
        Patch::Add { value, .. } | Patch::Replace { value, .. } => {
            let old = std::mem::replace(doc, value.clone());
            Ok(PatchPair {
                patch: Patch::Replace {
                    path: Path::root(),
                    value: value.clone(),
                },
                inverse: Patch::Replace {
                    path: Path::root(),
                    value: old,
                },
            })
        }
        Patch::Remove { .. } => Err(TreeError::RemoveRoot),
    }
}

fn apply_in_object(
    map: &mut Map<String, Value>,
    path: &Path,
    key: &str,
    patch: &Patch,
) -> Result<PatchPair, TreeError> {
    match patch {
        Patch::Add { value, .. } => {
            let forward = if map.contains_key(key) {
                Patch::Replace {
                    path: path.clone(),
                    value: value.clone(),
                }
            } else {
                Patch::Add {
                    path: path.clone(),
                    value: value.clone(),
                }
            };
            let inverse = match map.insert(key.to_string(), value.clone()) {
                Some(old) => Patch::Replace {
                    path: path.clone(),
                    value: old,
                },
                None => Patch::Remove { path: path.clone() },
            };
            Ok(PatchPair {
                patch: forward,
                inverse,
            })
        }
        Patch::Replace { value, .. } => {
            let slot = map
                .get_mut(key)
                .ok_or_else(|| TreeError::PathNotFound(path.clone()))?;
            let old = std::mem::replace(slot, value.clone());
            Ok(PatchPair {
                patch: patch.clone(),
                inverse: Patch::Replace {
                    path: path.clone(),
                    value: old,
                },
            })
        }
        Patch::Remove { .. } => {
            let old = map
                .remove(key)
                .ok_or_else(|| TreeError::PathNotFound(path.clone()))?;
            Ok(PatchPair {
                patch: patch.clone(),
                inverse: Patch::Add {
                    path: path.clone(),
                    value: old,
                },
            })
        }
    }
}

fn apply_in_array(
    items: &mut Vec<Value>,
    parent: &Path,
    key: &str,
    patch: &Patch,
) -> Result<PatchPair, TreeError> {
    let bad_index = || TreeError::InvalidIndex {
        path: parent.clone(),
        index: key.to_string(),
    };
    let index = if key == "-" && matches!(patch, Patch::Add { .. }) {
        items.len()
    } else {
        key.parse::<usize>().map_err(|_| bad_index())?
    };
    let at = parent.child(index.to_string());

    match patch {
        Patch::Add { value, .. } => {
            if index > items.len() {
                return Err(bad_index());
            }
            items.insert(index, value.clone());
            Ok(PatchPair {
                patch: Patch::Add {
                    path: at.clone(),
                    value: value.clone(),
                },
                inverse: Patch::Remove { path: at },
            })
        }
        Patch::Replace { value, .. } => {
            let slot = items.get_mut(index).ok_or_else(bad_index)?;
            let old = std::mem::replace(slot, value.clone());
            Ok(PatchPair {
                patch: Patch::Replace {
                    path: at.clone(),
                    value: value.clone(),
                },
                inverse: Patch::Replace {
                    path: at,
                    value: old,
                },
            })
        }
        Patch::Remove { .. } => {
            if index >= items.len() {
                return Err(bad_index());
            }
            let old = items.remove(index);
            Ok(PatchPair {
                patch: Patch::Remove { path: at.clone() },
                inverse: Patch::Add {
                    path: at,
                    value: old,
                },
            })
        }
    }
}
