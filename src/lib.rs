//! # Snapstore
//!
//! A reactive state container built on structurally shared snapshots.
//!
//! ## Core Concepts
//!
//! - **Snapshots**: Immutable object trees; an update copies only the
//!   changed branch and shares everything else by reference
//! - **Equality**: Identity first, then shallow, then cycle-safe deep
//!   comparison
//! - **Store**: Dispatch, path updates, transactions and batches, with
//!   synchronous listener notification
//! - **History**: Bounded undo/redo over committed snapshots
//! - **Selectors**: Memoized derived values and change subscriptions
//!
//! ## Example
//!
//! ```ignore
//! use snapstore::{Store, StoreConfig};
//! use serde_json::json;
//!
//! let store = Store::new(json!({"count": 0}), StoreConfig::default())?;
//!
//! store.subscribe(|next, prev| {
//!     println!("{:?} -> {:?}", prev.get("count"), next.get("count"));
//! });
//!
//! store.dispatch(json!({"count": 1}));
//! store.update_path("count", |c| c.and_then(|c| c.as_i64()).map(|n| (n + 1).into()));
//! store.undo(1);
//! ```

pub mod equality;
pub mod error;
pub mod history;
pub mod persistence;
pub mod plugins;
pub mod scheduler;
pub mod selectors;
pub mod state;
pub mod store;
pub mod sync;
pub mod types;

// Re-exports
pub use equality::{deep_equal, equal, have_inputs_changed, shallow_equal};
pub use error::{ErrorKind, Result, StoreError};
pub use history::{History, HistoryDirection, DEFAULT_HISTORY_LIMIT};
pub use persistence::{MemoryPersistence, Persistence};
pub use plugins::{FnPlugin, Hook, HookOutcome, Plugin};
pub use scheduler::{Clock, ManualClock, Scheduler, SystemClock, TimerId};
pub use selectors::{
    param_key, DependencyOptions, MemoizedSelector, ParameterizedSelector, Selector,
    SelectorConfig, SelectorManager, SubscriptionHandle,
};
pub use state::{
    apply_patch, build_minimal_diff, get_at_path, set_at_path, Draft, Patch, Path, PathSegment,
};
pub use store::{
    Action, ErrorHandler, Listener, ListenerHandle, PendingThunk, Store, StoreConfig, Thunk,
};
pub use sync::{SyncBridge, SyncHub, SyncMessage};
pub use types::*;
