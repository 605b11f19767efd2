//! Mutable staging copy of a snapshot used by transactions.

use super::path::{child_mut, get_at_path, set_at_path, Path};
use crate::error::{Result, StoreError};
use crate::types::{Snapshot, Value};

/// A copy-on-write working copy of the state.
///
/// Only the containers a recipe actually writes through are copied; all
/// other branches stay shared with the snapshot the draft started from.
pub struct Draft {
    base: Snapshot,
    root: Value,
}

impl Draft {
    pub(crate) fn new(base: Snapshot) -> Self {
        let root = base.to_value();
        Self { base, root }
    }

    /// Read the current draft value at `path`.
    pub fn get(&self, path: impl Into<Path>) -> Option<&Value> {
        let path: Path = path.into();
        get_at_path(&self.root, &path)
    }

    /// Write a value at `path`, creating intermediate objects.
    pub fn set(&mut self, path: impl Into<Path>, value: impl Into<Value>) -> Result<()> {
        let path: Path = path.into();
        self.root = set_at_path(&self.root, &path, Some(value.into()))?;
        Ok(())
    }

    /// Remove the value at `path`, returning it.
    pub fn remove(&mut self, path: impl Into<Path>) -> Result<Option<Value>> {
        let path = path.into();
        let removed = get_at_path(&self.root, &path).cloned();
        if removed.is_some() {
            self.root = set_at_path(&self.root, &path, None)?;
        }
        Ok(removed)
    }

    /// Replace the value at `path` with the updater's result; `None`
    /// removes it.
    pub fn update<F>(&mut self, path: impl Into<Path>, f: F) -> Result<()>
    where
        F: FnOnce(Option<&Value>) -> Option<Value>,
    {
        let path = path.into();
        let next = f(get_at_path(&self.root, &path));
        self.root = set_at_path(&self.root, &path, next)?;
        Ok(())
    }

    /// Mutable access to an existing value, copying each container on the
    /// way down that is still shared.
    pub fn get_mut(&mut self, path: impl Into<Path>) -> Option<&mut Value> {
        let path = path.into();
        if path.is_empty() {
            return None;
        }
        path.iter()
            .try_fold(&mut self.root, |node, seg| child_mut(node, seg))
    }

    /// The draft as a value.
    pub fn root(&self) -> &Value {
        &self.root
    }

    /// True when no container has been copied since the draft was created.
    pub fn is_untouched(&self) -> bool {
        self.root.same(&self.base.to_value())
    }

    pub(crate) fn finish(self) -> Result<Snapshot> {
        Snapshot::from_value(self.root)
            .ok_or_else(|| StoreError::Transaction("draft root is no longer an object".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snap(j: serde_json::Value) -> Snapshot {
        Snapshot::from_value(Value::from(j)).unwrap()
    }

    #[test]
    fn test_untouched_draft_keeps_identity() {
        let base = snap(json!({"a": 1}));
        let draft = Draft::new(base.clone());
        assert!(draft.is_untouched());
        assert!(draft.finish().unwrap().same(&base));
    }

    #[test]
    fn test_writes_do_not_leak_into_base() {
        let base = snap(json!({"todos": [{"done": false}], "other": {"k": 1}}));
        let mut draft = Draft::new(base.clone());

        draft.set("todos.0.done", true).unwrap();
        let next = draft.finish().unwrap();

        assert_eq!(base.to_json()["todos"][0]["done"], json!(false));
        assert_eq!(next.to_json()["todos"][0]["done"], json!(true));
        assert!(base.get("other").unwrap().same(next.get("other").unwrap()));
    }

    #[test]
    fn test_get_mut_copies_on_write() {
        let base = snap(json!({"list": [1, 2, 3]}));
        let mut draft = Draft::new(base.clone());

        draft
            .get_mut("list")
            .and_then(Value::as_array_mut)
            .unwrap()
            .push(Value::from(4));

        assert_eq!(draft.get("list").unwrap().to_json(), json!([1, 2, 3, 4]));
        assert_eq!(base.get("list").unwrap().to_json(), json!([1, 2, 3]));
        assert!(draft.get_mut("missing.path").is_none());
    }

    #[test]
    fn test_update_and_remove() {
        let base = snap(json!({"count": 1, "tmp": true}));
        let mut draft = Draft::new(base);

        draft
            .update("count", |v| v.and_then(Value::as_i64).map(|n| Value::from(n + 1)))
            .unwrap();
        let removed = draft.remove("tmp").unwrap();

        assert_eq!(removed.and_then(|v| v.as_bool()), Some(true));
        assert_eq!(draft.finish().unwrap().to_json(), json!({"count": 2}));
    }
}
