//! Parameterized selectors.

use crate::scheduler::TimerId;
use crate::store::Store;
use crate::types::{SelectorId, Snapshot};
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::debug;

use super::memo::{MemoizedSelector, Source};

static NEXT_UNIQUE_KEY: AtomicU64 = AtomicU64::new(1);

/// Cache key for a parameter value.
///
/// The JSON encoding of `params`: scalars keep their type (`1` and `"1"`
/// differ) and object keys come out sorted. Parameters that cannot be
/// serialized get a fresh unique token so they never share an entry.
pub fn param_key<P: Serialize + ?Sized>(params: &P) -> String {
    stable_key(params).unwrap_or_else(|| {
        format!(
            "__unique__:{}",
            NEXT_UNIQUE_KEY.fetch_add(1, Ordering::Relaxed)
        )
    })
}

fn stable_key<P: Serialize + ?Sized>(params: &P) -> Option<String> {
    serde_json::to_value(params)
        .ok()
        .map(|value| value.to_string())
}

type ParamFn<P, T> = Arc<dyn Fn(&Snapshot, &P) -> T + Send + Sync>;

pub(crate) struct ParamInner<P, T> {
    id: SelectorId,
    store: Store,
    compute: ParamFn<P, T>,
    ttl: Duration,
    sweep_interval: Duration,
    cache: Mutex<LruCache<String, Arc<MemoizedSelector<T>>>>,
    sweep_timer: Mutex<Option<TimerId>>,
}

/// A family of memoized selectors, one per distinct parameter value.
pub struct ParameterizedSelector<P, T> {
    inner: Arc<ParamInner<P, T>>,
}

impl<P, T> Clone for ParameterizedSelector<P, T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P, T> ParameterizedSelector<P, T>
where
    P: Serialize + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(
        id: SelectorId,
        store: Store,
        compute: ParamFn<P, T>,
        capacity: usize,
        ttl: Duration,
        sweep_interval: Duration,
    ) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Arc::new(ParamInner {
                id,
                store,
                compute,
                ttl,
                sweep_interval,
                cache: Mutex::new(LruCache::new(capacity)),
                sweep_timer: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> SelectorId {
        self.inner.id
    }

    pub(crate) fn family(&self) -> Weak<dyn ParamFamily> {
        let family: Weak<ParamInner<P, T>> = Arc::downgrade(&self.inner);
        family
    }

    /// The memoized selector for `params`, created on first use.
    pub fn get(&self, params: &P) -> Arc<MemoizedSelector<T>> {
        let Some(key) = stable_key(params) else {
            return Arc::new(self.build(params));
        };

        let mut cache = self.inner.cache.lock();
        if let Some(selector) = cache.get(&key) {
            selector.touch();
            return Arc::clone(selector);
        }

        let selector = Arc::new(self.build(params));
        cache.put(key, Arc::clone(&selector));
        drop(cache);

        self.ensure_sweep();
        selector
    }

    /// Evaluate the selector for `params` against the current state.
    pub fn select(&self, params: &P) -> T {
        self.get(params).select()
    }

    fn build(&self, params: &P) -> MemoizedSelector<T> {
        let compute = Arc::clone(&self.inner.compute);
        let params = params.clone();
        MemoizedSelector::new(
            self.inner.id,
            self.inner.store.clone(),
            Source::Single(Arc::new(move |snapshot: &Snapshot| compute(snapshot, &params))),
        )
    }

    fn ensure_sweep(&self) {
        let mut timer = self.inner.sweep_timer.lock();
        if timer.is_some() {
            return;
        }
        let weak: Weak<ParamInner<P, T>> = Arc::downgrade(&self.inner);
        *timer = Some(
            self.inner
                .store
                .scheduler()
                .schedule_interval(self.inner.sweep_interval, move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.sweep();
                    }
                }),
        );
    }

    /// Remove entries unused for longer than the TTL.
    pub fn sweep(&self) -> usize {
        self.inner.sweep()
    }

    pub fn len(&self) -> usize {
        self.inner.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.cache.lock().is_empty()
    }

    /// Whether the periodic sweep is scheduled.
    pub fn is_sweeping(&self) -> bool {
        self.inner.sweep_timer.lock().is_some()
    }

    pub fn clear(&self) {
        self.inner.cache.lock().clear();
        self.inner.stop_sweep();
    }
}

impl<P, T> ParamInner<P, T> {
    fn sweep(&self) -> usize {
        let now = self.store.scheduler().now();
        let mut cache = self.cache.lock();

        let expired: Vec<String> = cache
            .iter()
            .filter(|(_, selector)| {
                now.saturating_duration_since(selector.last_accessed()) > self.ttl
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            if let Some(selector) = cache.pop(key) {
                selector.cleanup();
            }
        }

        let empty = cache.is_empty();
        drop(cache);

        if !expired.is_empty() {
            debug!(selector = %self.id, removed = expired.len(), "parameter cache swept");
        }
        if empty {
            self.stop_sweep();
        }
        expired.len()
    }

    fn stop_sweep(&self) {
        if let Some(id) = self.sweep_timer.lock().take() {
            self.store.scheduler().cancel(id);
        }
    }
}

/// A parameterized family as seen by the manager that created it.
pub(crate) trait ParamFamily: Send + Sync {
    /// Drop every cached entry and stop the sweep.
    fn shut_down(&self);
}

impl<P, T> ParamFamily for ParamInner<P, T>
where
    P: Send + Sync,
    T: Send + Sync,
{
    fn shut_down(&self) {
        let entries: Vec<_> = {
            let mut cache = self.cache.lock();
            let entries = cache.iter().map(|(_, s)| Arc::clone(s)).collect();
            cache.clear();
            entries
        };
        for selector in entries {
            selector.cleanup();
        }
        self.stop_sweep();
    }
}

impl<P, T> Drop for ParamInner<P, T> {
    fn drop(&mut self) {
        self.stop_sweep();
    }
}

impl<P, T> fmt::Debug for ParameterizedSelector<P, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParameterizedSelector")
            .field("id", &self.inner.id)
            .field("entries", &self.inner.cache.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    #[test]
    fn test_param_key_is_stable_and_typed() {
        assert_eq!(param_key(&1), "1");
        assert_eq!(param_key("1"), "\"1\"");
        assert_ne!(param_key(&1), param_key("1"));

        let mut a = BTreeMap::new();
        a.insert("b", 2);
        a.insert("a", 1);
        assert_eq!(param_key(&a), r#"{"a":1,"b":2}"#);
        assert_eq!(param_key(&json!({"z": 1, "a": 2})), r#"{"a":2,"z":1}"#);
    }

    #[test]
    fn test_unserializable_params_get_unique_keys() {
        let mut bad = std::collections::HashMap::new();
        bad.insert(vec![1u8], 1);
        let first = param_key(&bad);
        let second = param_key(&bad);
        assert!(first.starts_with("__unique__:"));
        assert_ne!(first, second);
    }
}
