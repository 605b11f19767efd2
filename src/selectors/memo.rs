//! Memoized selector instances.

use crate::equality::have_inputs_changed;
use crate::store::Store;
use crate::types::{SelectorId, Snapshot, Value};
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use super::types::{Combiner, Extractor};

pub(crate) enum Source<T> {
    Single(Extractor<T>),
    Combined {
        inputs: Vec<Arc<MemoizedSelector<Value>>>,
        combiner: Combiner<T>,
    },
}

struct Memo<T> {
    snapshot: Option<Snapshot>,
    inputs: Option<Vec<Value>>,
    result: Option<T>,
}

impl<T> Default for Memo<T> {
    fn default() -> Self {
        Self {
            snapshot: None,
            inputs: None,
            result: None,
        }
    }
}

/// A selector bound to a store, caching its last result.
///
/// A single selector returns the cached result while the snapshot is the
/// same reference. A combined selector re-evaluates its inputs on a new
/// snapshot and only calls the combiner when an input changed.
pub struct MemoizedSelector<T> {
    id: SelectorId,
    store: Store,
    source: Source<T>,
    memo: Mutex<Memo<T>>,
    computations: AtomicU64,
    active: AtomicBool,
    last_accessed: Mutex<Instant>,
}

impl<T: Clone> MemoizedSelector<T> {
    pub(crate) fn new(id: SelectorId, store: Store, source: Source<T>) -> Self {
        let now = store.scheduler().now();
        Self {
            id,
            store,
            source,
            memo: Mutex::new(Memo::default()),
            computations: AtomicU64::new(0),
            active: AtomicBool::new(true),
            last_accessed: Mutex::new(now),
        }
    }

    pub fn id(&self) -> SelectorId {
        self.id
    }

    /// Evaluate against the store's current state.
    pub fn select(&self) -> T {
        let snapshot = self.store.get_state();
        self.select_from(&snapshot)
    }

    /// Evaluate against a given snapshot.
    pub fn select_from(&self, snapshot: &Snapshot) -> T {
        self.touch();

        {
            let memo = self.memo.lock();
            if let (Some(last), Some(result)) = (&memo.snapshot, &memo.result) {
                if last.same(snapshot) {
                    return result.clone();
                }
            }
        }

        match &self.source {
            Source::Single(extractor) => {
                let result = extractor(snapshot);
                self.computations.fetch_add(1, Ordering::Relaxed);

                let mut memo = self.memo.lock();
                memo.snapshot = Some(snapshot.clone());
                memo.result = Some(result.clone());
                result
            }
            Source::Combined { inputs, combiner } => {
                let values: Vec<Value> = inputs.iter().map(|i| i.select_from(snapshot)).collect();

                {
                    let mut memo = self.memo.lock();
                    if !have_inputs_changed(memo.inputs.as_deref(), &values) {
                        if let Some(result) = memo.result.clone() {
                            memo.snapshot = Some(snapshot.clone());
                            return result;
                        }
                    }
                }

                let result = combiner(&values);
                self.computations.fetch_add(1, Ordering::Relaxed);

                let mut memo = self.memo.lock();
                memo.snapshot = Some(snapshot.clone());
                memo.inputs = Some(values);
                memo.result = Some(result.clone());
                result
            }
        }
    }

    pub(crate) fn touch(&self) {
        *self.last_accessed.lock() = self.store.scheduler().now();
        self.active.store(true, Ordering::Release);
    }
}

impl<T> MemoizedSelector<T> {
    /// How many times the extractor or combiner ran.
    pub fn computations(&self) -> u64 {
        self.computations.load(Ordering::Relaxed)
    }

    pub fn last_accessed(&self) -> Instant {
        *self.last_accessed.lock()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Drop the cached result and snapshot and mark inactive. The next
    /// call recomputes.
    pub fn cleanup(&self) {
        *self.memo.lock() = Memo::default();
        self.active.store(false, Ordering::Release);
    }
}

impl<T> fmt::Debug for MemoizedSelector<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoizedSelector")
            .field("id", &self.id)
            .field("computations", &self.computations())
            .field("active", &self.is_active())
            .finish()
    }
}

/// Type-erased view of a cached selector, used for eviction.
pub(crate) trait CachedSelector: Send + Sync {
    fn last_accessed(&self) -> Instant;

    fn cleanup(&self);

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T> CachedSelector for MemoizedSelector<T>
where
    T: Send + Sync + 'static,
{
    fn last_accessed(&self) -> Instant {
        MemoizedSelector::last_accessed(self)
    }

    fn cleanup(&self) {
        MemoizedSelector::cleanup(self)
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
