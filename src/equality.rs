//! Multi-tier value comparison.
//!
//! Change detection runs on every committed update, so the comparison is
//! ordered cheapest first:
//!
//! 1. identity (`Value::same`), the dominant case because unchanged
//!    branches keep their allocation across snapshots;
//! 2. scalar comparison;
//! 3. one shallow pass over the container, comparing children by
//!    identity and only descending into children that are containers;
//! 4. a full recursive comparison that tracks visited pointer pairs.

use crate::types::Value;
use std::collections::HashSet;
use std::sync::Arc;

/// Structural equality with identity and shallow fast paths.
pub fn equal(a: &Value, b: &Value) -> bool {
    if a.same(b) {
        return true;
    }

    match (a, b) {
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(p, q)| child_equal(p, q))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter().all(|(k, p)| match y.get(k) {
                    Some(q) => child_equal(p, q),
                    None => false,
                })
        }
        (Value::Map(x), Value::Map(y)) => {
            x.len() == y.len()
                && x.iter().all(|(k, p)| match map_lookup(y, k) {
                    Some(q) => child_equal(p, q),
                    None => false,
                })
        }
        (Value::Bytes(x), Value::Bytes(y)) => x[..] == y[..],
        _ => false,
    }
}

/// Compare one level deep: children must be identical.
pub fn shallow_equal(a: &Value, b: &Value) -> bool {
    if a.same(b) {
        return true;
    }

    match (a, b) {
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(p, q)| p.same(q))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, p)| y.get(k).map(|q| p.same(q)).unwrap_or(false))
        }
        (Value::Map(x), Value::Map(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, p)| map_lookup(y, k).map(|q| p.same(q)).unwrap_or(false))
        }
        (Value::Bytes(x), Value::Bytes(y)) => x[..] == y[..],
        _ => false,
    }
}

/// Full recursive comparison.
///
/// Container pairs already on the comparison path are treated as equal
/// when revisited, which keeps the walk linear in the number of distinct
/// pairs even when sub-trees are shared many times.
pub fn deep_equal(a: &Value, b: &Value) -> bool {
    DeepCompare::default().compare(a, b)
}

/// True when there is no previous tuple, the arity changed, or any
/// element differs.
pub fn have_inputs_changed(prev: Option<&[Value]>, next: &[Value]) -> bool {
    match prev {
        None => true,
        Some(prev) => {
            prev.len() != next.len() || prev.iter().zip(next.iter()).any(|(p, n)| !equal(p, n))
        }
    }
}

fn child_equal(p: &Value, q: &Value) -> bool {
    p.same(q) || (p.is_container() && q.is_container() && deep_equal(p, q))
}

fn map_lookup<'a>(entries: &'a [(Value, Value)], key: &Value) -> Option<&'a Value> {
    entries
        .iter()
        .find(|(k, _)| k.same(key))
        .or_else(|| {
            key.is_container()
                .then(|| entries.iter().find(|(k, _)| deep_equal(k, key)))
                .flatten()
        })
        .map(|(_, v)| v)
}

#[derive(Default)]
struct DeepCompare {
    visited: HashSet<(usize, usize)>,
}

impl DeepCompare {
    fn compare(&mut self, a: &Value, b: &Value) -> bool {
        if a.same(b) {
            return true;
        }

        match (a, b) {
            (Value::Array(x), Value::Array(y)) => {
                if !self.enter(addr(x), addr(y)) {
                    return true;
                }
                x.len() == y.len() && x.iter().zip(y.iter()).all(|(p, q)| self.compare(p, q))
            }
            (Value::Object(x), Value::Object(y)) => {
                if !self.enter(addr(x), addr(y)) {
                    return true;
                }
                x.len() == y.len()
                    && x.iter().all(|(k, p)| match y.get(k) {
                        Some(q) => self.compare(p, q),
                        None => false,
                    })
            }
            (Value::Map(x), Value::Map(y)) => {
                if !self.enter(addr(x), addr(y)) {
                    return true;
                }
                x.len() == y.len()
                    && x.iter().all(|(k, p)| {
                        // Key probes may fail, so they must not mark pairs as visited.
                        let found = y.iter().find(|(yk, _)| deep_equal(k, yk));
                        match found {
                            Some((_, q)) => self.compare(p, q),
                            None => false,
                        }
                    })
            }
            (Value::Bytes(x), Value::Bytes(y)) => x[..] == y[..],
            _ => false,
        }
    }

    /// Returns false when the pair was already visited.
    fn enter(&mut self, a: usize, b: usize) -> bool {
        self.visited.insert((a, b))
    }
}

fn addr<T: ?Sized>(arc: &Arc<T>) -> usize {
    Arc::as_ptr(arc) as *const () as usize
}
