//! Top-level patches and their application to snapshots.

use crate::equality::equal;
use crate::error::{Result, StoreError};
use crate::types::{Snapshot, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A sparse set of top-level changes: `Some` writes a key, `None` removes it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Patch {
    changes: BTreeMap<String, Option<Value>>,
}

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    /// A patch touching a single key.
    pub fn single(key: impl Into<String>, value: Option<Value>) -> Self {
        let mut patch = Self::new();
        patch.changes.insert(key.into(), value);
        patch
    }

    /// Build a merge patch from an object payload.
    pub fn from_value(payload: Value) -> Result<Self> {
        match payload {
            Value::Object(obj) => {
                let changes = Arc::try_unwrap(obj)
                    .unwrap_or_else(|shared| (*shared).clone())
                    .into_iter()
                    .map(|(k, v)| (k, Some(v)))
                    .collect();
                Ok(Self { changes })
            }
            other => Err(StoreError::Validation(format!(
                "dispatch payload must be an object, got {}",
                other.type_name()
            ))),
        }
    }

    /// Builder-style write.
    pub fn set(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.changes.insert(key.into(), Some(value.into()));
        self
    }

    /// Builder-style removal.
    pub fn remove(mut self, key: impl Into<String>) -> Self {
        self.changes.insert(key.into(), None);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Option<Value>) {
        self.changes.insert(key.into(), value);
    }

    /// `None` when the key is untouched, `Some(None)` when it is removed.
    pub fn get(&self, key: &str) -> Option<Option<&Value>> {
        self.changes.get(key).map(Option::as_ref)
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.changes.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&Value>)> {
        self.changes.iter().map(|(k, v)| (k.as_str(), v.as_ref()))
    }

    /// Fold `later` into this patch; keys in `later` win.
    pub fn merge(&mut self, later: Patch) {
        self.changes.extend(later.changes);
    }

    /// Fold a sequence of patches in order.
    pub fn fold(patches: impl IntoIterator<Item = Patch>) -> Patch {
        patches.into_iter().fold(Patch::new(), |mut acc, p| {
            acc.merge(p);
            acc
        })
    }

    /// The changed top-level keys between `prev` and `next`, compared by
    /// identity.
    pub fn diff(prev: &Snapshot, next: &Snapshot) -> Patch {
        let mut patch = Patch::new();
        for (k, v) in next.as_object() {
            match prev.get(k) {
                Some(old) if old.same(v) => {}
                _ => patch.insert(k.clone(), Some(v.clone())),
            }
        }
        for k in prev.keys() {
            if !next.contains_key(k) {
                patch.insert(k, None);
            }
        }
        patch
    }
}

/// Shallow-merge `patch` into `current`.
///
/// Keys whose new value is equal to the current one keep the current
/// reference. Returns `None` when nothing effectively changed.
pub fn apply_patch(current: &Snapshot, patch: &Patch) -> Option<Snapshot> {
    let mut next: Option<crate::types::Object> = None;

    for (key, change) in patch.iter() {
        let existing = current.get(key);
        match change {
            Some(value) => {
                if existing.map(|cur| equal(cur, value)).unwrap_or(false) {
                    continue;
                }
                next.get_or_insert_with(|| current.as_object().clone())
                    .insert(key.to_string(), value.clone());
            }
            None => {
                if existing.is_some() {
                    next.get_or_insert_with(|| current.as_object().clone())
                        .remove(key);
                }
            }
        }
    }

    next.map(|obj| Snapshot::from_object(Arc::new(obj)))
}
