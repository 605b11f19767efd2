//! Path addressing inside a state tree.

use super::operations::Patch;
use crate::error::{Result, StoreError};
use crate::types::{Object, Value};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

/// One step of a [`Path`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

impl PathSegment {
    /// The segment as an object key.
    pub fn as_key(&self) -> String {
        match self {
            PathSegment::Key(k) => k.clone(),
            PathSegment::Index(i) => i.to_string(),
        }
    }

    /// The segment as an array index, if it is one or parses as one.
    pub fn as_index(&self) -> Option<usize> {
        match self {
            PathSegment::Key(k) => k.parse().ok(),
            PathSegment::Index(i) => Some(*i),
        }
    }

    /// Candidate keys for an associative map: the key as given, then the
    /// numeric-string / number counterpart.
    fn map_keys(&self) -> [Option<Value>; 2] {
        match self {
            PathSegment::Key(k) => [
                Some(Value::from(k.as_str())),
                k.parse::<i64>().ok().map(Value::from),
            ],
            PathSegment::Index(i) => [Some(Value::from(*i)), Some(Value::from(i.to_string()))],
        }
    }

    /// The key a new map entry is stored under.
    fn map_key(&self) -> Value {
        match self {
            PathSegment::Key(k) => Value::from(k.as_str()),
            PathSegment::Index(i) => Value::from(*i),
        }
    }
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Key(k) => write!(f, "{}", k),
            PathSegment::Index(i) => write!(f, "{}", i),
        }
    }
}

impl From<&str> for PathSegment {
    fn from(s: &str) -> Self {
        PathSegment::Key(s.to_string())
    }
}

impl From<String> for PathSegment {
    fn from(s: String) -> Self {
        PathSegment::Key(s)
    }
}

impl From<usize> for PathSegment {
    fn from(i: usize) -> Self {
        PathSegment::Index(i)
    }
}

/// Ordered list of keys/indices identifying a location in a snapshot.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Path(Vec<PathSegment>);

impl Path {
    pub fn new(segments: Vec<PathSegment>) -> Self {
        Path(segments)
    }

    /// Parse a dotted path. Purely numeric segments become indices.
    pub fn parse(dotted: &str) -> Self {
        Path(
            dotted
                .split('.')
                .filter(|s| !s.is_empty())
                .map(|s| match s.parse::<usize>() {
                    Ok(i) => PathSegment::Index(i),
                    Err(_) => PathSegment::Key(s.to_string()),
                })
                .collect(),
        )
    }

    pub fn push(&mut self, segment: impl Into<PathSegment>) {
        self.0.push(segment.into());
    }
}

impl Deref for Path {
    type Target = [PathSegment];

    fn deref(&self) -> &[PathSegment] {
        &self.0
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, seg) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            write!(f, "{}", seg)?;
        }
        Ok(())
    }
}

impl From<&str> for Path {
    fn from(s: &str) -> Self {
        Path::parse(s)
    }
}

impl From<String> for Path {
    fn from(s: String) -> Self {
        Path::parse(&s)
    }
}

impl From<Vec<PathSegment>> for Path {
    fn from(segments: Vec<PathSegment>) -> Self {
        Path(segments)
    }
}

impl From<&[&str]> for Path {
    fn from(keys: &[&str]) -> Self {
        Path(keys.iter().map(|k| PathSegment::from(*k)).collect())
    }
}

impl<const N: usize> From<[&str; N]> for Path {
    fn from(keys: [&str; N]) -> Self {
        Path(keys.iter().map(|k| PathSegment::from(*k)).collect())
    }
}

/// Step one segment into a value.
pub fn child<'a>(value: &'a Value, segment: &PathSegment) -> Option<&'a Value> {
    match value {
        Value::Object(obj) => object_child(obj, segment),
        Value::Array(items) => segment.as_index().and_then(|i| items.get(i)),
        Value::Map(entries) => map_position(entries, segment).map(|pos| &entries[pos].1),
        _ => None,
    }
}

/// Copy-on-write step into a value. Containers along the way are only
/// copied when the child exists.
pub(crate) fn child_mut<'a>(value: &'a mut Value, segment: &PathSegment) -> Option<&'a mut Value> {
    child(value, segment)?;
    match value {
        Value::Object(obj) => Arc::make_mut(obj).get_mut(&segment.as_key()),
        Value::Array(items) => {
            let index = segment.as_index()?;
            Arc::make_mut(items).get_mut(index)
        }
        Value::Map(entries) => {
            let pos = map_position(entries, segment)?;
            Arc::make_mut(entries).get_mut(pos).map(|entry| &mut entry.1)
        }
        _ => None,
    }
}

fn map_position(entries: &[(Value, Value)], segment: &PathSegment) -> Option<usize> {
    segment
        .map_keys()
        .into_iter()
        .flatten()
        .find_map(|key| entries.iter().position(|(k, _)| k.same(&key)))
}

pub(crate) fn object_child<'a>(obj: &'a Object, segment: &PathSegment) -> Option<&'a Value> {
    match segment {
        PathSegment::Key(k) => obj.get(k),
        PathSegment::Index(i) => obj.get(&i.to_string()),
    }
}

/// Read the value at `path`. `None` on any missing or non-traversable
/// segment. The empty path addresses `value` itself.
pub fn get_at_path<'a>(value: &'a Value, path: &[PathSegment]) -> Option<&'a Value> {
    path.iter().try_fold(value, |node, seg| child(node, seg))
}

/// Write (`Some`) or remove (`None`) the value at `path`, returning a new
/// root that shares every untouched branch with `root`.
///
/// Missing intermediate containers are created as objects. Removing from
/// an array splices the element out. Writing the identical value, or
/// removing something that is not there, returns `root` itself.
pub fn set_at_path(root: &Value, path: &[PathSegment], value: Option<Value>) -> Result<Value> {
    let (head, rest) = path
        .split_first()
        .ok_or_else(|| StoreError::InvalidPath("empty path".to_string()))?;

    let mut node = root.clone();
    write_child(&mut node, head, rest, value)?;
    Ok(node)
}

fn write_child(
    node: &mut Value,
    segment: &PathSegment,
    rest: &[PathSegment],
    value: Option<Value>,
) -> Result<()> {
    let Some((next_seg, next_rest)) = rest.split_first() else {
        return assign(node, segment, value);
    };

    let current = child(node, segment).cloned();
    let mut next = match current {
        Some(Value::Null) | None => {
            if value.is_none() {
                return Ok(());
            }
            Value::Object(Arc::new(Object::new()))
        }
        Some(v @ (Value::Object(_) | Value::Array(_) | Value::Map(_))) => v,
        Some(other) => {
            return Err(StoreError::InvalidPath(format!(
                "cannot traverse {} at '{}'",
                other.type_name(),
                segment
            )))
        }
    };

    let before = next.clone();
    write_child(&mut next, next_seg, next_rest, value)?;
    if next.same(&before) {
        return Ok(());
    }
    drop(before);
    assign(node, segment, Some(next))
}

fn assign(node: &mut Value, segment: &PathSegment, value: Option<Value>) -> Result<()> {
    match node {
        Value::Object(obj) => {
            let key = segment.as_key();
            match value {
                Some(v) => {
                    if obj.get(&key).map(|cur| cur.same(&v)).unwrap_or(false) {
                        return Ok(());
                    }
                    Arc::make_mut(obj).insert(key, v);
                }
                None => {
                    if obj.contains_key(&key) {
                        Arc::make_mut(obj).remove(&key);
                    }
                }
            }
            Ok(())
        }
        Value::Array(items) => {
            let index = segment.as_index().ok_or_else(|| {
                StoreError::InvalidPath(format!("'{}' is not an array index", segment))
            })?;
            match value {
                Some(v) => {
                    if items.get(index).map(|cur| cur.same(&v)).unwrap_or(false) {
                        return Ok(());
                    }
                    if index > items.len() {
                        return Err(StoreError::InvalidPath(format!(
                            "index {} is past the end of an array of length {}",
                            index,
                            items.len()
                        )));
                    }
                    let items = Arc::make_mut(items);
                    if index < items.len() {
                        items[index] = v;
                    } else {
                        items.push(v);
                    }
                }
                None => {
                    if index < items.len() {
                        Arc::make_mut(items).remove(index);
                    }
                }
            }
            Ok(())
        }
        Value::Map(entries) => {
            let position = map_position(entries, segment);
            match (value, position) {
                (Some(v), Some(pos)) => {
                    if !entries[pos].1.same(&v) {
                        Arc::make_mut(entries)[pos].1 = v;
                    }
                }
                (Some(v), None) => Arc::make_mut(entries).push((segment.map_key(), v)),
                (None, Some(pos)) => {
                    Arc::make_mut(entries).remove(pos);
                }
                (None, None) => {}
            }
            Ok(())
        }
        other => Err(StoreError::InvalidPath(format!(
            "cannot write into {} at '{}'",
            other.type_name(),
            segment
        ))),
    }
}

/// The smallest patch that turns the previous root into `new_root` after
/// a write at `path`: the top-level branch along `path`, whose siblings
/// are already shared with the previous tree.
pub fn build_minimal_diff(new_root: &Value, path: &[PathSegment]) -> Result<Patch> {
    let head = path
        .first()
        .ok_or_else(|| StoreError::InvalidPath("empty path".to_string()))?;
    let key = head.as_key();
    let branch = new_root.as_object().and_then(|obj| obj.get(&key)).cloned();
    Ok(Patch::single(key, branch))
}
