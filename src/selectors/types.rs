//! Selector definitions and subscription configuration.

use crate::types::{SelectorId, Snapshot, SubscriptionId, Value};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use super::manager::ManagerInner;

static NEXT_SELECTOR_ID: AtomicU64 = AtomicU64::new(1);

/// Extracts a derived value from a snapshot.
pub type Extractor<T> = Arc<dyn Fn(&Snapshot) -> T + Send + Sync>;

/// Combines the outputs of input selectors.
pub type Combiner<T> = Arc<dyn Fn(&[Value]) -> T + Send + Sync>;

/// Custom change detection for dependency subscriptions.
pub type EqualityFn<T> = Arc<dyn Fn(&T, &T) -> bool + Send + Sync>;

/// Dependency listener, called with `(next, prev)`.
pub type ValueListener<T> = Arc<dyn Fn(&T, &T) + Send + Sync>;

/// Configuration for a [`SelectorManager`](super::SelectorManager).
#[derive(Clone, Debug)]
pub struct SelectorConfig {
    /// Cached selectors unused for longer than this are evicted.
    /// Default: 5 minutes
    pub inactivity_threshold: Duration,

    /// How often the eviction pass runs.
    /// Default: 60 seconds
    pub eviction_interval: Duration,

    /// Parameterized entries unused for longer than this are swept.
    /// Default: 5 minutes
    pub param_ttl: Duration,

    /// How often parameterized caches are swept.
    /// Default: 60 seconds
    pub param_sweep_interval: Duration,

    /// Max entries per parameterized selector.
    /// Default: 256
    pub param_cache_capacity: usize,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            inactivity_threshold: Duration::from_secs(5 * 60),
            eviction_interval: Duration::from_secs(60),
            param_ttl: Duration::from_secs(5 * 60),
            param_sweep_interval: Duration::from_secs(60),
            param_cache_capacity: 256,
        }
    }
}

pub(crate) enum SelectorKind<T> {
    Single(Extractor<T>),
    Combined {
        inputs: Vec<Selector<Value>>,
        combiner: Combiner<T>,
    },
}

/// A selector definition.
///
/// Closures have no identity of their own, so every definition carries a
/// [`SelectorId`]; clones share it and hit the same cache entry.
pub struct Selector<T> {
    id: SelectorId,
    pub(crate) kind: Arc<SelectorKind<T>>,
}

impl<T> Selector<T> {
    /// A single-input selector.
    pub fn new<F>(extractor: F) -> Self
    where
        F: Fn(&Snapshot) -> T + Send + Sync + 'static,
    {
        Self::with_kind(SelectorKind::Single(Arc::new(extractor)))
    }

    /// A selector whose `combiner` only runs when the outputs of `inputs`
    /// change.
    pub fn combine<F>(inputs: Vec<Selector<Value>>, combiner: F) -> Self
    where
        F: Fn(&[Value]) -> T + Send + Sync + 'static,
    {
        Self::with_kind(SelectorKind::Combined {
            inputs,
            combiner: Arc::new(combiner),
        })
    }

    fn with_kind(kind: SelectorKind<T>) -> Self {
        Self {
            id: SelectorId(NEXT_SELECTOR_ID.fetch_add(1, Ordering::Relaxed)),
            kind: Arc::new(kind),
        }
    }

    pub fn id(&self) -> SelectorId {
        self.id
    }

    /// Ids of the input selectors; empty for a single selector.
    pub fn input_ids(&self) -> Vec<SelectorId> {
        match self.kind.as_ref() {
            SelectorKind::Single(_) => Vec::new(),
            SelectorKind::Combined { inputs, .. } => inputs.iter().map(Selector::id).collect(),
        }
    }
}

impl<T> Clone for Selector<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            kind: Arc::clone(&self.kind),
        }
    }
}

impl<T> fmt::Debug for Selector<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Selector")
            .field("id", &self.id)
            .field("inputs", &self.input_ids())
            .finish()
    }
}

/// Options for a dependency subscription.
pub struct DependencyOptions<T> {
    /// Change detection. `PartialEq` when `None`.
    pub equals: Option<EqualityFn<T>>,

    /// Deliver at most once per quiet window of this length.
    pub debounce: Option<Duration>,

    /// Call the listener once with `(initial, initial)` on subscribe.
    pub immediate: bool,
}

impl<T> DependencyOptions<T> {
    pub fn debounced(delay: Duration) -> Self {
        Self {
            debounce: Some(delay),
            ..Default::default()
        }
    }

    pub fn immediate() -> Self {
        Self {
            immediate: true,
            ..Default::default()
        }
    }

    pub fn with_equals<F>(mut self, equals: F) -> Self
    where
        F: Fn(&T, &T) -> bool + Send + Sync + 'static,
    {
        self.equals = Some(Arc::new(equals));
        self
    }
}

impl<T> Default for DependencyOptions<T> {
    fn default() -> Self {
        Self {
            equals: None,
            debounce: None,
            immediate: false,
        }
    }
}

impl<T> Clone for DependencyOptions<T> {
    fn clone(&self) -> Self {
        Self {
            equals: self.equals.clone(),
            debounce: self.debounce,
            immediate: self.immediate,
        }
    }
}

impl<T> fmt::Debug for DependencyOptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DependencyOptions")
            .field("equals", &self.equals.is_some())
            .field("debounce", &self.debounce)
            .field("immediate", &self.immediate)
            .finish()
    }
}

/// Handle to a dependency subscription.
pub struct SubscriptionHandle {
    pub(crate) id: SubscriptionId,
    pub(crate) manager: Weak<ManagerInner>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Stop the subscription and cancel any pending debounced delivery.
    /// Idempotent; returns whether it was still active.
    pub fn unsubscribe(&self) -> bool {
        match self.manager.upgrade() {
            Some(manager) => manager.remove_subscription(self.id),
            None => false,
        }
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .finish()
    }
}
