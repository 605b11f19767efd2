//! Selector manager: selector cache, dependency subscriptions and eviction.

use crate::error::{catch_panic, Result, StoreError};
use crate::scheduler::TimerId;
use crate::state::{get_at_path, Path};
use crate::store::{ListenerHandle, Store};
use crate::types::{SelectorId, Snapshot, SubscriptionId, Value};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::debug;

use super::memo::{CachedSelector, MemoizedSelector, Source};
use super::params::{ParamFamily, ParameterizedSelector};
use super::types::{
    DependencyOptions, EqualityFn, Selector, SelectorConfig, SelectorKind, SubscriptionHandle,
    ValueListener,
};

/// Cached selectors, keyed by selector id then by input selector ids.
type SelectorCache = HashMap<SelectorId, HashMap<Vec<SelectorId>, Arc<dyn CachedSelector>>>;

/// Type-erased view of a dependency subscription.
trait ActiveSubscription: Send + Sync {
    fn deactivate(&self);
}

struct Pending<T> {
    timer: TimerId,
    /// Value when the unfired window opened.
    from: T,
    latest: T,
}

struct Watch<T> {
    last: T,
    pending: Option<Pending<T>>,
}

/// A listener fed by a memoized selector.
struct DependencySubscription<T> {
    id: SubscriptionId,
    store: Store,
    selector: Arc<MemoizedSelector<T>>,
    listener: ValueListener<T>,
    equals: EqualityFn<T>,
    debounce: Option<Duration>,
    watch: Mutex<Watch<T>>,
    active: AtomicBool,
    store_listener: Mutex<Option<ListenerHandle>>,
}

impl<T> DependencySubscription<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn on_change(self: &Arc<Self>, next: &Snapshot) {
        if !self.active.load(Ordering::Acquire) {
            return;
        }

        let value = match catch_panic(|| self.selector.select_from(next)) {
            Ok(value) => value,
            Err(message) => return self.report("select", message),
        };

        let previous = self.watch.lock().last.clone();
        let changed = match catch_panic(|| !(self.equals)(&previous, &value)) {
            Ok(changed) => changed,
            Err(message) => return self.report("equals", message),
        };
        if !changed {
            return;
        }

        match self.debounce {
            None => {
                self.watch.lock().last = value.clone();
                self.deliver(&value, &previous);
            }
            Some(delay) => self.defer(previous, value, delay),
        }
    }

    /// Open or extend the debounce window.
    fn defer(self: &Arc<Self>, previous: T, value: T, delay: Duration) {
        let scheduler = self.store.scheduler();
        let mut watch = self.watch.lock();
        watch.last = value.clone();

        match &mut watch.pending {
            Some(pending) => {
                pending.latest = value;
                if !scheduler.reschedule(pending.timer, delay) {
                    pending.timer = self.schedule_flush(delay);
                }
            }
            None => {
                let timer = self.schedule_flush(delay);
                watch.pending = Some(Pending {
                    timer,
                    from: previous,
                    latest: value,
                });
            }
        }
    }

    fn schedule_flush(self: &Arc<Self>, delay: Duration) -> TimerId {
        let weak: Weak<Self> = Arc::downgrade(self);
        self.store.scheduler().schedule(delay, move || {
            if let Some(subscription) = weak.upgrade() {
                subscription.flush();
            }
        })
    }

    fn flush(&self) {
        let Some(pending) = self.watch.lock().pending.take() else {
            return;
        };
        if !self.active.load(Ordering::Acquire) {
            return;
        }

        match catch_panic(|| (self.equals)(&pending.from, &pending.latest)) {
            Ok(true) => {}
            Ok(false) => self.deliver(&pending.latest, &pending.from),
            Err(message) => self.report("equals", message),
        }
    }

    fn deliver(&self, next: &T, prev: &T) {
        if let Err(message) = catch_panic(|| (self.listener)(next, prev)) {
            self.report("listener", message);
        }
    }

    fn report(&self, operation: &'static str, message: String) {
        self.store.report_error(StoreError::Subscription {
            id: self.id,
            operation,
            message,
        });
    }
}

impl<T> ActiveSubscription for DependencySubscription<T>
where
    T: Send + Sync,
{
    fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
        if let Some(handle) = self.store_listener.lock().take() {
            handle.unsubscribe();
        }
        if let Some(pending) = self.watch.lock().pending.take() {
            self.store.scheduler().cancel(pending.timer);
        }
    }
}

pub(crate) struct ManagerInner {
    store: Store,
    config: SelectorConfig,
    cache: Mutex<SelectorCache>,
    subscriptions: Mutex<HashMap<SubscriptionId, Arc<dyn ActiveSubscription>>>,
    next_subscription: AtomicU64,
    next_param_id: AtomicU64,
    eviction_timer: Mutex<Option<TimerId>>,
    families: Mutex<Vec<Weak<dyn ParamFamily>>>,
    disposed: AtomicBool,
}

impl ManagerInner {
    pub(crate) fn remove_subscription(&self, id: SubscriptionId) -> bool {
        let removed = self.subscriptions.lock().remove(&id);
        match removed {
            Some(subscription) => {
                subscription.deactivate();
                true
            }
            None => false,
        }
    }

    fn evict_inactive(&self) -> usize {
        let now = self.store.scheduler().now();
        let threshold = self.config.inactivity_threshold;
        let mut evicted: Vec<Arc<dyn CachedSelector>> = Vec::new();

        let empty = {
            let mut cache = self.cache.lock();
            for by_inputs in cache.values_mut() {
                by_inputs.retain(|_, entry| {
                    let idle = now.saturating_duration_since(entry.last_accessed()) > threshold;
                    if idle {
                        evicted.push(Arc::clone(entry));
                    }
                    !idle
                });
            }
            cache.retain(|_, by_inputs| !by_inputs.is_empty());
            cache.is_empty()
        };

        for entry in &evicted {
            entry.cleanup();
        }
        if !evicted.is_empty() {
            debug!(store = %self.store.name(), evicted = evicted.len(), "inactive selectors evicted");
        }
        if empty {
            self.stop_eviction();
        }
        evicted.len()
    }

    fn stop_eviction(&self) {
        if let Some(id) = self.eviction_timer.lock().take() {
            self.store.scheduler().cancel(id);
        }
    }

    fn shutdown(&self) {
        let subscriptions: Vec<_> = self.subscriptions.lock().drain().map(|(_, s)| s).collect();
        for subscription in subscriptions {
            subscription.deactivate();
        }

        let cached: Vec<_> = self
            .cache
            .lock()
            .drain()
            .flat_map(|(_, by_inputs)| by_inputs.into_values())
            .collect();
        for entry in cached {
            entry.cleanup();
        }

        let families: Vec<_> = self.families.lock().drain(..).collect();
        for family in families.iter().filter_map(Weak::upgrade) {
            family.shut_down();
        }

        self.stop_eviction();
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Builds memoized selectors over one store and manages dependency
/// subscriptions on them.
///
/// Dropping the manager disposes it.
pub struct SelectorManager {
    inner: Arc<ManagerInner>,
}

impl SelectorManager {
    pub fn new(store: &Store, config: SelectorConfig) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                store: store.clone(),
                config,
                cache: Mutex::new(HashMap::new()),
                subscriptions: Mutex::new(HashMap::new()),
                next_subscription: AtomicU64::new(1),
                next_param_id: AtomicU64::new(1),
                eviction_timer: Mutex::new(None),
                families: Mutex::new(Vec::new()),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    pub fn config(&self) -> &SelectorConfig {
        &self.inner.config
    }

    // --- Selectors ---

    /// The cached instance of `selector`, created on first use.
    pub fn memoize<T>(&self, selector: &Selector<T>) -> Arc<MemoizedSelector<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        let inputs = selector.input_ids();

        let cached = self
            .inner
            .cache
            .lock()
            .get(&selector.id())
            .and_then(|by_inputs| by_inputs.get(&inputs))
            .cloned();
        if let Some(entry) = cached {
            if let Ok(memo) = entry.into_any().downcast::<MemoizedSelector<T>>() {
                return memo;
            }
        }

        let source = match selector.kind.as_ref() {
            SelectorKind::Single(extractor) => Source::Single(Arc::clone(extractor)),
            SelectorKind::Combined { inputs, combiner } => Source::Combined {
                inputs: inputs.iter().map(|input| self.memoize(input)).collect(),
                combiner: Arc::clone(combiner),
            },
        };
        let memo = Arc::new(MemoizedSelector::new(
            selector.id(),
            self.inner.store.clone(),
            source,
        ));

        let entry: Arc<dyn CachedSelector> = memo.clone();
        self.inner
            .cache
            .lock()
            .entry(selector.id())
            .or_default()
            .insert(inputs, entry);

        self.ensure_eviction();
        memo
    }

    /// Evaluate `selector` against the current state.
    pub fn select<T>(&self, selector: &Selector<T>) -> T
    where
        T: Clone + Send + Sync + 'static,
    {
        self.memoize(selector).select()
    }

    /// A selector family keyed by serialized parameters.
    pub fn parameterized<P, T, F>(&self, compute: F) -> ParameterizedSelector<P, T>
    where
        P: serde::Serialize + Clone + Send + Sync + 'static,
        T: Clone + Send + Sync + 'static,
        F: Fn(&Snapshot, &P) -> T + Send + Sync + 'static,
    {
        let config = &self.inner.config;
        let family = ParameterizedSelector::new(
            SelectorId(self.inner.next_param_id.fetch_add(1, Ordering::Relaxed)),
            self.inner.store.clone(),
            Arc::new(compute),
            config.param_cache_capacity,
            config.param_ttl,
            config.param_sweep_interval,
        );

        let mut families = self.inner.families.lock();
        families.retain(|f| f.strong_count() > 0);
        families.push(family.family());
        drop(families);

        family
    }

    // --- Subscriptions ---

    /// Call `listener(next, prev)` whenever the value of `selector` changes.
    pub fn subscribe<T, F>(
        &self,
        selector: &Selector<T>,
        listener: F,
        options: DependencyOptions<T>,
    ) -> Result<SubscriptionHandle>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
        F: Fn(&T, &T) + Send + Sync + 'static,
    {
        if self.inner.disposed.load(Ordering::Acquire) {
            return Err(StoreError::Selector("selector manager is disposed".to_string()));
        }

        let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::SeqCst));
        let memo = self.memoize(selector);
        let initial = catch_panic(|| memo.select()).map_err(|message| {
            StoreError::Subscription {
                id,
                operation: "select",
                message,
            }
        })?;

        let equals: EqualityFn<T> = options
            .equals
            .unwrap_or_else(|| Arc::new(|a: &T, b: &T| a == b));

        let subscription = Arc::new(DependencySubscription {
            id,
            store: self.inner.store.clone(),
            selector: memo,
            listener: Arc::new(listener),
            equals,
            debounce: options.debounce,
            watch: Mutex::new(Watch {
                last: initial.clone(),
                pending: None,
            }),
            active: AtomicBool::new(true),
            store_listener: Mutex::new(None),
        });

        if options.immediate {
            subscription.deliver(&initial, &initial);
        }

        let weak = Arc::downgrade(&subscription);
        let handle = self.inner.store.subscribe(move |next, _prev| {
            if let Some(subscription) = weak.upgrade() {
                subscription.on_change(next);
            }
        });
        *subscription.store_listener.lock() = Some(handle);

        self.inner.subscriptions.lock().insert(id, subscription);
        debug!(store = %self.inner.store.name(), subscription = %id, "dependency subscription added");

        Ok(SubscriptionHandle {
            id,
            manager: Arc::downgrade(&self.inner),
        })
    }

    /// Subscribe to the value at `path`; `None` when it is absent.
    pub fn watch_path<F>(
        &self,
        path: impl Into<Path>,
        listener: F,
        options: DependencyOptions<Option<Value>>,
    ) -> Result<SubscriptionHandle>
    where
        F: Fn(&Option<Value>, &Option<Value>) + Send + Sync + 'static,
    {
        let path: Path = path.into();
        let selector = Selector::new(move |snapshot: &Snapshot| {
            let root = snapshot.to_value();
            get_at_path(&root, &path).cloned()
        });
        self.subscribe(&selector, listener, options)
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.lock().len()
    }

    // --- Eviction ---

    fn ensure_eviction(&self) {
        let mut timer = self.inner.eviction_timer.lock();
        if timer.is_some() {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        *timer = Some(
            self.inner
                .store
                .scheduler()
                .schedule_interval(self.inner.config.eviction_interval, move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.evict_inactive();
                    }
                }),
        );
    }

    /// Remove cached selectors idle beyond the inactivity threshold.
    pub fn evict_inactive(&self) -> usize {
        self.inner.evict_inactive()
    }

    /// Number of cached selectors.
    pub fn active_selector_count(&self) -> usize {
        self.inner.cache.lock().values().map(HashMap::len).sum()
    }

    /// Whether the eviction interval is scheduled.
    pub fn is_evicting(&self) -> bool {
        self.inner.eviction_timer.lock().is_some()
    }

    /// Stop every subscription, drop the cache and cancel timers.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.shutdown();
        debug!(store = %self.inner.store.name(), "selector manager disposed");
    }
}

impl fmt::Debug for SelectorManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectorManager")
            .field("store", &self.inner.store.name())
            .field("selectors", &self.active_selector_count())
            .field("subscriptions", &self.subscription_count())
            .finish()
    }
}
