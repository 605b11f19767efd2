//! Persistence collaborator interface.

use crate::error::{Result, StoreError};
use crate::types::{Snapshot, Value};
use parking_lot::Mutex;

/// Storage backend for snapshots.
///
/// The store calls `persist` after each committed change, `load` once at
/// construction (the result is merged over the initial state) and
/// `remove` from [`Store::clear_persisted`](crate::Store::clear_persisted).
/// Failures are reported through the error channel and never abort the
/// store operation that triggered them.
pub trait Persistence: Send + Sync {
    fn persist(&self, snapshot: &Snapshot) -> Result<()>;

    /// A partial state object, or `None` when nothing was stored.
    fn load(&self) -> Result<Option<Value>>;

    fn remove(&self) -> Result<()>;
}

/// Keeps the last persisted snapshot as JSON text in memory.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    stored: Mutex<Option<String>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with an already stored value.
    pub fn with_value(value: &Value) -> Result<Self> {
        Ok(Self {
            stored: Mutex::new(Some(serde_json::to_string(value)?)),
        })
    }

    /// The raw stored JSON.
    pub fn raw(&self) -> Option<String> {
        self.stored.lock().clone()
    }
}

impl Persistence for MemoryPersistence {
    fn persist(&self, snapshot: &Snapshot) -> Result<()> {
        let encoded = serde_json::to_string(snapshot)?;
        *self.stored.lock() = Some(encoded);
        Ok(())
    }

    fn load(&self) -> Result<Option<Value>> {
        match self.stored.lock().as_deref() {
            Some(raw) => serde_json::from_str(raw)
                .map(Some)
                .map_err(|e| StoreError::Persistence(e.to_string())),
            None => Ok(None),
        }
    }

    fn remove(&self) -> Result<()> {
        *self.stored.lock() = None;
        Ok(())
    }
}
