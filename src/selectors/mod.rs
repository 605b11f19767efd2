//! Derived values over a store.
//!
//! This module provides memoized selectors and subscriptions to them:
//! - Single selectors, cached on snapshot identity
//! - Combined selectors, recomputed only when an input changes
//! - Parameterized selector families with an LRU/TTL cache
//! - Dependency subscriptions with custom equality and debouncing
//!
//! Cached selectors idle beyond the configured threshold are evicted by
//! an interval timer on the store's scheduler.
//!
//! # Example
//!
//! ```ignore
//! let manager = SelectorManager::new(&store, SelectorConfig::default());
//!
//! let todos = Selector::new(|s: &Snapshot| s.get("todos").cloned().unwrap_or_default());
//! let open = Selector::combine(vec![todos], |inputs: &[Value]| {
//!     inputs[0].as_array().map(|t| t.len()).unwrap_or(0)
//! });
//!
//! let handle = manager.subscribe(
//!     &open,
//!     |next, prev| println!("open todos: {} -> {}", prev, next),
//!     DependencyOptions::debounced(Duration::from_millis(100)),
//! )?;
//!
//! // Debounced deliveries run from the store's timers.
//! store.tick();
//! ```

mod manager;
mod memo;
mod params;
mod types;

pub use manager::SelectorManager;
pub use memo::MemoizedSelector;
pub use params::{param_key, ParameterizedSelector};
pub use types::{
    Combiner, DependencyOptions, EqualityFn, Extractor, Selector, SelectorConfig,
    SubscriptionHandle, ValueListener,
};
