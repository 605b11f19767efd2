//! Error types for the state container.

use crate::types::{ListenerId, SubscriptionId};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use thiserror::Error;

/// Main error type for store operations.
#[derive(Clone, Debug, Error)]
pub enum StoreError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Plugin '{plugin}' failed during {hook}: {message}")]
    Middleware {
        plugin: String,
        hook: &'static str,
        message: String,
    },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Sync error: {0}")]
    Sync(String),

    #[error("Listener {id} failed: {message}")]
    Listener { id: ListenerId, message: String },

    #[error("Subscription {id} failed during {operation}: {message}")]
    Subscription {
        id: SubscriptionId,
        operation: &'static str,
        message: String,
    },

    #[error("Selector error: {0}")]
    Selector(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Store error: {0}")]
    Store(String),
}

/// Coarse classification of a [`StoreError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    Transaction,
    Middleware,
    Persistence,
    Sync,
    Store,
}

impl StoreError {
    /// The taxonomy bucket this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Validation(_) | StoreError::InvalidPath(_) => ErrorKind::Validation,
            StoreError::Transaction(_) => ErrorKind::Transaction,
            StoreError::Middleware { .. } => ErrorKind::Middleware,
            StoreError::Persistence(_) => ErrorKind::Persistence,
            StoreError::Sync(_) => ErrorKind::Sync,
            StoreError::Listener { .. }
            | StoreError::Subscription { .. }
            | StoreError::Selector(_)
            | StoreError::Serialization(_)
            | StoreError::Store(_) => ErrorKind::Store,
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Run user-supplied code, turning a panic into its message.
pub(crate) fn catch_panic<T>(f: impl FnOnce() -> T) -> std::result::Result<T, String> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(panic_message)
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}
