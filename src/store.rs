//! Main Store struct tying all components together.

use crate::equality::deep_equal;
use crate::error::{catch_panic, Result, StoreError};
use crate::history::{History, HistoryDirection, DEFAULT_HISTORY_LIMIT};
use crate::persistence::Persistence;
use crate::plugins::{Hook, HookOutcome, Plugin, PluginHost};
use crate::scheduler::{Clock, Scheduler, SystemClock};
use crate::state::{apply_patch, build_minimal_diff, get_at_path, set_at_path, Draft, Patch, Path};
use crate::sync::{SyncBridge, SyncMessage};
use crate::types::{ListenerId, Snapshot, Value};
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tracing::{debug, error, warn};

/// Raw change listener, called with `(next, prev)`.
pub type Listener = Arc<dyn Fn(&Snapshot, &Snapshot) + Send + Sync>;

/// The error channel.
pub type ErrorHandler = Arc<dyn Fn(&StoreError) + Send + Sync>;

/// A deferred operation run against the store.
pub type Thunk = Box<dyn FnOnce(&Store) -> Result<Option<Value>>>;

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// An asynchronous thunk in flight, created by [`Store::run_async`].
#[must_use = "futures do nothing unless polled"]
pub struct PendingThunk<Fut> {
    store: Store,
    future: Option<Pin<Box<Fut>>>,
}

impl<Fut, T> Future for PendingThunk<Fut>
where
    Fut: Future<Output = Result<T>>,
{
    type Output = Option<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        let this = self.get_mut();
        let Some(future) = this.future.as_mut() else {
            return Poll::Ready(None);
        };

        let polled = catch_panic(|| future.as_mut().poll(cx));
        let outcome = match polled {
            Ok(Poll::Pending) => return Poll::Pending,
            Ok(Poll::Ready(Ok(value))) => Some(value),
            Ok(Poll::Ready(Err(e))) => {
                this.store.report_error(e);
                None
            }
            Err(panic) => {
                this.store
                    .report_error(StoreError::Store(format!("thunk panicked: {}", panic)));
                None
            }
        };
        this.future = None;
        Poll::Ready(outcome)
    }
}

impl<Fut> fmt::Debug for PendingThunk<Fut> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingThunk")
            .field("store", &self.store.name())
            .field("done", &self.future.is_none())
            .finish()
    }
}

/// Store configuration.
#[derive(Clone)]
pub struct StoreConfig {
    /// Name used in log output.
    pub name: String,

    /// Identity used to tag and filter sync messages. Generated when `None`.
    pub instance_id: Option<String>,

    /// Maximum retained history entries.
    pub history_limit: usize,

    /// Whether undo/redo history is kept at all.
    pub enable_history: bool,

    /// Storage collaborator.
    pub persistence: Option<Arc<dyn Persistence>>,

    /// Lifecycle plugins, in call order.
    pub plugins: Vec<Arc<dyn Plugin>>,

    /// Error channel. Errors are logged when `None`.
    pub on_error: Option<ErrorHandler>,

    /// Cross-instance sync transport.
    pub sync: Option<Arc<SyncBridge>>,

    /// Time source for timers.
    pub clock: Arc<dyn Clock>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            name: "store".to_string(),
            instance_id: None,
            history_limit: DEFAULT_HISTORY_LIMIT,
            enable_history: true,
            persistence: None,
            plugins: Vec::new(),
            on_error: None,
            sync: None,
            clock: Arc::new(SystemClock),
        }
    }
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("name", &self.name)
            .field("instance_id", &self.instance_id)
            .field("history_limit", &self.history_limit)
            .field("enable_history", &self.enable_history)
            .field("persistence", &self.persistence.is_some())
            .field("plugins", &self.plugins.len())
            .field("on_error", &self.on_error.is_some())
            .field("sync", &self.sync.is_some())
            .finish()
    }
}

/// What can be dispatched.
pub enum Action {
    /// Shallow merge of an object payload.
    Merge(Value),
    /// Pre-built top-level patch.
    Patch(Patch),
    /// Deferred operation receiving the store.
    Thunk(Thunk),
}

impl Action {
    pub fn thunk<F>(f: F) -> Self
    where
        F: FnOnce(&Store) -> Result<Option<Value>> + 'static,
    {
        Action::Thunk(Box::new(f))
    }
}

impl From<Value> for Action {
    fn from(v: Value) -> Self {
        Action::Merge(v)
    }
}

impl From<serde_json::Value> for Action {
    fn from(v: serde_json::Value) -> Self {
        Action::Merge(Value::from(v))
    }
}

impl From<Patch> for Action {
    fn from(p: Patch) -> Self {
        Action::Patch(p)
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Merge(v) => f.debug_tuple("Merge").field(v).finish(),
            Action::Patch(p) => f.debug_tuple("Patch").field(p).finish(),
            Action::Thunk(_) => write!(f, "Thunk"),
        }
    }
}

/// Result of pushing a patch through the commit pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CommitOutcome {
    Applied,
    Queued,
    Unchanged,
    Vetoed,
    Inactive,
}

/// Where a committed snapshot came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CommitKind {
    Local,
    History,
    Sync,
    Reset,
}

impl CommitKind {
    fn records_history(self) -> bool {
        matches!(self, CommitKind::Local | CommitKind::Sync)
    }

    fn persists(self) -> bool {
        !matches!(self, CommitKind::Sync)
    }

    fn publishes(self) -> bool {
        !matches!(self, CommitKind::Sync)
    }
}

struct ListenerEntry {
    id: ListenerId,
    listener: Listener,
}

#[derive(Default)]
struct BatchState {
    depth: usize,
    queue: Vec<Patch>,
}

struct StoreInner {
    name: String,
    instance_id: String,
    initial: Snapshot,
    state: RwLock<Snapshot>,

    /// Serializes mutating operations. Re-entrant so listeners, thunks and
    /// recipes can call back into the store on the same thread.
    write_lock: ReentrantMutex<()>,

    batch: Mutex<BatchState>,
    history: Option<Mutex<History>>,
    listeners: RwLock<Vec<ListenerEntry>>,
    next_listener_id: AtomicU64,
    plugins: PluginHost,
    persistence: Option<Arc<dyn Persistence>>,
    sync: Option<Arc<SyncBridge>>,
    on_error: Option<ErrorHandler>,
    scheduler: Arc<Scheduler>,
    destroyed: AtomicBool,
}

/// The state container.
///
/// Cloning a `Store` yields another handle to the same container.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

/// Handle returned by [`Store::subscribe`].
pub struct ListenerHandle {
    id: ListenerId,
    store: Weak<StoreInner>,
}

impl ListenerHandle {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Remove the listener. Idempotent; returns whether it was registered.
    pub fn unsubscribe(&self) -> bool {
        match self.store.upgrade() {
            Some(inner) => {
                let mut listeners = inner.listeners.write();
                let before = listeners.len();
                listeners.retain(|entry| entry.id != self.id);
                listeners.len() != before
            }
            None => false,
        }
    }
}

impl Store {
    /// Create a store from an object-valued initial state.
    pub fn new(initial: impl Into<Value>, config: StoreConfig) -> Result<Self> {
        let initial = Snapshot::from_value(initial.into()).ok_or_else(|| {
            StoreError::Validation("initial state must be an object".to_string())
        })?;

        let instance_id = config.instance_id.unwrap_or_else(|| {
            format!(
                "{}-{}-{}",
                config.name,
                std::process::id(),
                NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed)
            )
        });

        let history = config
            .enable_history
            .then(|| Mutex::new(History::new(config.history_limit)));

        let store = Self {
            inner: Arc::new(StoreInner {
                name: config.name,
                instance_id,
                initial: initial.clone(),
                state: RwLock::new(initial),
                write_lock: ReentrantMutex::new(()),
                batch: Mutex::new(BatchState::default()),
                history,
                listeners: RwLock::new(Vec::new()),
                next_listener_id: AtomicU64::new(1),
                plugins: PluginHost::new(config.plugins),
                persistence: config.persistence,
                sync: config.sync,
                on_error: config.on_error,
                scheduler: Arc::new(Scheduler::new(config.clock)),
                destroyed: AtomicBool::new(false),
            }),
        };

        store.load_persisted();
        if let Some(history) = &store.inner.history {
            history.lock().reseed(store.inner.state.read().clone());
        }

        debug!(store = %store.inner.name, instance = %store.inner.instance_id, "store created");
        Ok(store)
    }

    /// Merge persisted state over the initial state.
    fn load_persisted(&self) {
        let Some(backend) = &self.inner.persistence else {
            return;
        };

        let loaded = match catch_panic(|| backend.load()) {
            Ok(Ok(loaded)) => loaded,
            Ok(Err(e)) => {
                self.report_error(as_persistence_error(e));
                return;
            }
            Err(panic) => {
                self.report_error(StoreError::Persistence(format!("load panicked: {}", panic)));
                return;
            }
        };

        let mut hook = Hook::OnLoad { loaded };
        self.run_hook(&mut hook);
        let Hook::OnLoad { loaded: Some(loaded) } = hook else {
            return;
        };

        match Patch::from_value(loaded) {
            Ok(patch) => {
                let mut state = self.inner.state.write();
                if let Some(next) = apply_patch(&state, &patch) {
                    *state = next;
                }
                debug!(store = %self.inner.name, keys = patch.len(), "persisted state loaded");
            }
            Err(_) => self.report_error(StoreError::Persistence(
                "persisted state is not an object".to_string(),
            )),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    /// The scheduler that runs this store's timers.
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.inner.scheduler
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }

    /// Whether two handles refer to the same container.
    pub fn ptr_eq(&self, other: &Store) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // --- Reads ---

    /// The current snapshot.
    ///
    /// Inside a batch this is the state as if every queued patch had
    /// already been applied; nothing is committed by reading it.
    pub fn get_state(&self) -> Snapshot {
        let mut snapshot = self.inner.state.read().clone();
        let batch = self.inner.batch.lock();
        if batch.depth > 0 {
            for patch in &batch.queue {
                if let Some(next) = apply_patch(&snapshot, patch) {
                    snapshot = next;
                }
            }
        }
        snapshot
    }

    // --- Dispatch ---

    /// Dispatch a merge payload, a patch or a thunk.
    ///
    /// Returns the thunk's result; merges and patches return `None`.
    /// Invalid payloads and failing thunks are reported, never returned.
    pub fn dispatch(&self, action: impl Into<Action>) -> Option<Value> {
        if self.is_destroyed() {
            return None;
        }

        match action.into() {
            Action::Merge(payload) => {
                match Patch::from_value(payload) {
                    Ok(patch) => {
                        self.commit_patch(patch);
                    }
                    Err(e) => self.report_error(e),
                }
                None
            }
            Action::Patch(patch) => {
                self.commit_patch(patch);
                None
            }
            Action::Thunk(thunk) => self.run(thunk).flatten(),
        }
    }

    /// Shallow-merge an object payload. Returns whether the state changed
    /// (or the payload was queued in an open batch).
    pub fn merge(&self, payload: impl Into<Value>) -> bool {
        if self.is_destroyed() {
            return false;
        }
        match Patch::from_value(payload.into()) {
            Ok(patch) => matches!(
                self.commit_patch(patch),
                CommitOutcome::Applied | CommitOutcome::Queued
            ),
            Err(e) => {
                self.report_error(e);
                false
            }
        }
    }

    /// Run a typed thunk against this store, reporting its error.
    pub fn run<T, F>(&self, thunk: F) -> Option<T>
    where
        F: FnOnce(&Store) -> Result<T>,
    {
        if self.is_destroyed() {
            return None;
        }
        match catch_panic(|| thunk(self)) {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                self.report_error(e);
                None
            }
            Err(panic) => {
                self.report_error(StoreError::Store(format!("thunk panicked: {}", panic)));
                None
            }
        }
    }

    /// Start an asynchronous thunk.
    ///
    /// The thunk gets its own `Store` handle and its future runs on
    /// whatever executor polls the returned [`PendingThunk`]. Every call
    /// it makes re-enters the synchronous pipeline. An `Err` or a panic
    /// is reported on the error channel and resolves to `None`.
    pub fn run_async<T, F, Fut>(&self, thunk: F) -> PendingThunk<Fut>
    where
        F: FnOnce(Store) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let future = if self.is_destroyed() {
            None
        } else {
            match catch_panic(|| thunk(self.clone())) {
                Ok(future) => Some(Box::pin(future)),
                Err(panic) => {
                    self.report_error(StoreError::Store(format!("thunk panicked: {}", panic)));
                    None
                }
            }
        };
        PendingThunk {
            store: self.clone(),
            future,
        }
    }

    /// Dispatch an asynchronous thunk, forwarding its value.
    pub fn dispatch_async<F, Fut>(&self, thunk: F) -> impl Future<Output = Option<Value>>
    where
        F: FnOnce(Store) -> Fut,
        Fut: Future<Output = Result<Option<Value>>>,
    {
        let pending = self.run_async(thunk);
        async move { pending.await.flatten() }
    }

    // --- Path updates ---

    /// Replace the value at `path` with `updater(current)`.
    ///
    /// `None` removes the key (or splices the array element). Returning
    /// the identical value is a no-op. Returns whether a change was
    /// committed or queued.
    pub fn update_path<F>(&self, path: impl Into<Path>, updater: F) -> bool
    where
        F: FnOnce(Option<&Value>) -> Option<Value>,
    {
        if self.is_destroyed() {
            return false;
        }
        let _guard = self.inner.write_lock.lock();
        let path = path.into();
        if path.is_empty() {
            self.report_error(StoreError::InvalidPath("empty path".to_string()));
            return false;
        }

        let root = self.get_state().to_value();
        let existing = get_at_path(&root, &path);

        let next = match catch_panic(|| updater(existing)) {
            Ok(next) => next,
            Err(panic) => {
                self.report_error(StoreError::Store(format!(
                    "updater for '{}' panicked: {}",
                    path, panic
                )));
                return false;
            }
        };

        match (&next, existing) {
            (Some(n), Some(e)) if n.same(e) => return false,
            (None, None) => return false,
            _ => {}
        }

        let diff = set_at_path(&root, &path, next).and_then(|new_root| {
            if new_root.same(&root) {
                Ok(None)
            } else {
                build_minimal_diff(&new_root, &path).map(Some)
            }
        });

        match diff {
            Ok(Some(diff)) => matches!(
                self.commit_patch(diff),
                CommitOutcome::Applied | CommitOutcome::Queued
            ),
            Ok(None) => false,
            Err(e) => {
                self.report_error(e);
                false
            }
        }
    }

    /// Assign a literal value at `path`.
    pub fn set_path(&self, path: impl Into<Path>, value: impl Into<Value>) -> bool {
        let value = value.into();
        self.update_path(path, move |_| Some(value))
    }

    /// Remove the value at `path`.
    pub fn remove_path(&self, path: impl Into<Path>) -> bool {
        self.update_path(path, |_| None)
    }

    // --- Transactions and batches ---

    /// Run `recipe` against a draft of the current state and commit the
    /// changed top-level keys as one patch.
    ///
    /// Returns `false`, leaving the state untouched, when the recipe fails
    /// or panics, or when a plugin vetoes the transaction.
    pub fn transaction<F>(&self, recipe: F) -> bool
    where
        F: FnOnce(&mut Draft) -> Result<()>,
    {
        if self.is_destroyed() {
            return false;
        }
        let _guard = self.inner.write_lock.lock();

        if self.run_hook(&mut Hook::TransactionStart) == HookOutcome::Veto {
            warn!(store = %self.inner.name, "transaction vetoed by plugin");
            return false;
        }

        let base = self.get_state();
        let mut draft = Draft::new(base.clone());
        let finished = match catch_panic(|| recipe(&mut draft)) {
            Ok(Ok(())) => draft.finish(),
            Ok(Err(e)) => Err(as_transaction_error(e)),
            Err(panic) => Err(StoreError::Transaction(format!("recipe panicked: {}", panic))),
        };

        let success = match finished {
            Ok(next) if next.same(&base) => true,
            Ok(next) => {
                let patch = Patch::diff(&base, &next);
                !matches!(
                    self.commit_patch(patch),
                    CommitOutcome::Vetoed | CommitOutcome::Inactive
                )
            }
            Err(e) => {
                self.report_error(e);
                false
            }
        };

        self.run_hook(&mut Hook::TransactionEnd { success });
        success
    }

    /// Coalesce every dispatch made inside `f` into a single commit.
    ///
    /// Nested batches are absorbed into the outermost one. When `f` fails
    /// or panics, the patches it queued are dropped.
    pub fn batch<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Store) -> Result<T>,
    {
        if self.is_destroyed() {
            return f(self);
        }
        let _guard = self.inner.write_lock.lock();

        let (outermost, mark) = {
            let mut batch = self.inner.batch.lock();
            batch.depth += 1;
            (batch.depth == 1, batch.queue.len())
        };

        if outermost && self.run_hook(&mut Hook::BatchStart) == HookOutcome::Veto {
            self.inner.batch.lock().depth -= 1;
            warn!(store = %self.inner.name, "batch vetoed by plugin");
            return Err(StoreError::Store("batch vetoed by plugin".to_string()));
        }

        let result = catch_panic(|| f(self));
        let failed = !matches!(result, Ok(Ok(_)));

        let queued = {
            let mut batch = self.inner.batch.lock();
            batch.depth = batch.depth.saturating_sub(1);
            if failed {
                batch.queue.truncate(mark);
            }
            if batch.depth == 0 {
                std::mem::take(&mut batch.queue)
            } else {
                Vec::new()
            }
        };

        if outermost && !self.is_destroyed() {
            let committed = if queued.is_empty() {
                false
            } else {
                let count = queued.len();
                let combined = Patch::fold(queued);
                debug!(store = %self.inner.name, patches = count, keys = combined.len(), "flushing batch");
                self.commit_patch(combined) == CommitOutcome::Applied
            };
            self.run_hook(&mut Hook::BatchEnd { committed });
        }

        match result {
            Ok(result) => result,
            Err(panic) => {
                let e = StoreError::Store(format!("batch function panicked: {}", panic));
                self.report_error(e.clone());
                Err(e)
            }
        }
    }

    // --- History ---

    pub fn undo(&self, steps: usize) -> bool {
        self.navigate(HistoryDirection::Undo, steps)
    }

    pub fn redo(&self, steps: usize) -> bool {
        self.navigate(HistoryDirection::Redo, steps)
    }

    pub fn can_undo(&self, steps: usize) -> bool {
        self.inner
            .history
            .as_ref()
            .map(|h| h.lock().can_undo(steps))
            .unwrap_or(false)
    }

    pub fn can_redo(&self, steps: usize) -> bool {
        self.inner
            .history
            .as_ref()
            .map(|h| h.lock().can_redo(steps))
            .unwrap_or(false)
    }

    pub fn history_len(&self) -> usize {
        self.inner
            .history
            .as_ref()
            .map(|h| h.lock().len())
            .unwrap_or(0)
    }

    /// Retained history entries, oldest first.
    pub fn history_entries(&self) -> Vec<Snapshot> {
        self.inner
            .history
            .as_ref()
            .map(|h| h.lock().entries().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop all history and start again from the current state.
    pub fn clear_history(&self) {
        if let Some(history) = &self.inner.history {
            let current = self.inner.state.read().clone();
            history.lock().reseed(current);
        }
    }

    fn navigate(&self, direction: HistoryDirection, steps: usize) -> bool {
        if self.is_destroyed() {
            return false;
        }
        let Some(history) = &self.inner.history else {
            return false;
        };
        let _guard = self.inner.write_lock.lock();

        if self.inner.batch.lock().depth > 0 {
            warn!(store = %self.inner.name, direction = direction.as_str(), "history navigation ignored inside batch");
            return false;
        }

        let possible = {
            let h = history.lock();
            match direction {
                HistoryDirection::Undo => h.can_undo(steps),
                HistoryDirection::Redo => h.can_redo(steps),
            }
        };
        if !possible {
            return false;
        }

        if self.run_hook(&mut Hook::BeforeHistory { direction, steps }) == HookOutcome::Veto {
            warn!(store = %self.inner.name, direction = direction.as_str(), "history navigation vetoed by plugin");
            return false;
        }

        let target = {
            let mut h = history.lock();
            let target = match direction {
                HistoryDirection::Undo => h.undo(steps),
                HistoryDirection::Redo => h.redo(steps),
            };
            if target.is_some() {
                h.begin_replay();
            }
            target
        };
        let Some(target) = target else {
            return false;
        };

        let prev = self.inner.state.read().clone();
        if !target.same(&prev) {
            self.commit(target.clone(), prev, CommitKind::History);
        }
        history.lock().end_replay();

        self.run_hook(&mut Hook::AfterHistory {
            direction,
            snapshot: target,
        });
        true
    }

    // --- Lifecycle ---

    /// Restore the initial state and restart history from it.
    pub fn reset(&self) {
        if self.is_destroyed() {
            return;
        }
        let _guard = self.inner.write_lock.lock();
        self.inner.batch.lock().queue.clear();

        let initial = self.inner.initial.clone();
        if let Some(history) = &self.inner.history {
            history.lock().reseed(initial.clone());
        }

        let prev = self.inner.state.read().clone();
        if !initial.same(&prev) {
            self.commit(initial, prev, CommitKind::Reset);
        }
    }

    /// Tear the store down. Listeners are dropped and timers cancelled;
    /// every later mutating call is a no-op.
    pub fn destroy(&self) {
        let _guard = self.inner.write_lock.lock();
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.listeners.write().clear();
        self.inner.batch.lock().queue.clear();
        self.inner.scheduler.clear();
        debug!(store = %self.inner.name, "store destroyed");
    }

    // --- Listeners ---

    /// Register a raw `(next, prev)` listener.
    pub fn subscribe<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&Snapshot, &Snapshot) + Send + Sync + 'static,
    {
        let id = ListenerId(self.inner.next_listener_id.fetch_add(1, Ordering::SeqCst));
        if !self.is_destroyed() {
            self.inner.listeners.write().push(ListenerEntry {
                id,
                listener: Arc::new(listener),
            });
        }
        ListenerHandle {
            id,
            store: Arc::downgrade(&self.inner),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.read().len()
    }

    // --- Collaborators ---

    /// Apply a full snapshot published by another instance.
    ///
    /// Ignored when it originates from this instance or is deep-equal to
    /// the current state. Returns whether it was applied.
    pub fn apply_external_update(&self, origin: &str, snapshot: Value) -> bool {
        if self.is_destroyed() {
            return false;
        }
        if origin == self.inner.instance_id {
            return false;
        }
        let _guard = self.inner.write_lock.lock();

        let mut hook = Hook::OnSync {
            origin: origin.to_string(),
            incoming: snapshot,
        };
        if self.run_hook(&mut hook) == HookOutcome::Veto {
            warn!(store = %self.inner.name, origin, "sync update vetoed by plugin");
            return false;
        }
        let Hook::OnSync { incoming, .. } = hook else {
            return false;
        };

        let Some(next) = Snapshot::from_value(incoming) else {
            self.report_error(StoreError::Sync(format!(
                "update from '{}' is not an object",
                origin
            )));
            return false;
        };

        let prev = self.inner.state.read().clone();
        if deep_equal(&prev.to_value(), &next.to_value()) {
            return false;
        }

        self.commit(next, prev, CommitKind::Sync);
        true
    }

    /// Drive the store: apply inbound sync messages, then run due timers.
    /// Returns the number of units of work done.
    pub fn tick(&self) -> usize {
        if self.is_destroyed() {
            return 0;
        }

        let mut work = 0;
        if let Some(sync) = &self.inner.sync {
            for message in sync.drain() {
                if self.apply_external_update(&message.origin, message.snapshot) {
                    work += 1;
                }
            }
        }
        work + self.inner.scheduler.run_pending()
    }

    /// Ask the persistence collaborator to forget stored state.
    pub fn clear_persisted(&self) {
        let Some(backend) = &self.inner.persistence else {
            return;
        };
        match catch_panic(|| backend.remove()) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => self.report_error(as_persistence_error(e)),
            Err(panic) => {
                self.report_error(StoreError::Persistence(format!("remove panicked: {}", panic)))
            }
        }
    }

    // --- Pipeline ---

    fn commit_patch(&self, patch: Patch) -> CommitOutcome {
        let _guard = self.inner.write_lock.lock();
        if self.is_destroyed() {
            return CommitOutcome::Inactive;
        }

        {
            let mut batch = self.inner.batch.lock();
            if batch.depth > 0 {
                batch.queue.push(patch);
                return CommitOutcome::Queued;
            }
        }

        let prev = self.inner.state.read().clone();
        let mut hook = Hook::BeforeStateChange {
            patch,
            prev: prev.clone(),
        };
        if self.run_hook(&mut hook) == HookOutcome::Veto {
            warn!(store = %self.inner.name, "state change vetoed by plugin");
            return CommitOutcome::Vetoed;
        }
        let Hook::BeforeStateChange { patch, .. } = hook else {
            return CommitOutcome::Vetoed;
        };

        match apply_patch(&prev, &patch) {
            Some(next) => {
                self.commit(next, prev, CommitKind::Local);
                CommitOutcome::Applied
            }
            None => {
                debug!(store = %self.inner.name, keys = patch.len(), "dispatch produced no change");
                CommitOutcome::Unchanged
            }
        }
    }

    fn commit(&self, next: Snapshot, prev: Snapshot, kind: CommitKind) {
        *self.inner.state.write() = next.clone();

        if kind.records_history() {
            if let Some(history) = &self.inner.history {
                history.lock().record(next.clone());
            }
        }

        debug!(store = %self.inner.name, kind = ?kind, "state committed");

        self.notify(&next, &prev);
        self.run_hook(&mut Hook::AfterStateChange {
            next: next.clone(),
            prev,
        });

        if kind.persists() {
            self.persist(&next);
        }

        if kind.publishes() {
            if let Some(sync) = &self.inner.sync {
                let message = SyncMessage {
                    origin: self.inner.instance_id.clone(),
                    snapshot: next.to_value(),
                };
                if let Err(e) = sync.publish(message) {
                    self.report_error(e);
                }
            }
        }
    }

    fn notify(&self, next: &Snapshot, prev: &Snapshot) {
        let listeners: Vec<(ListenerId, Listener)> = self
            .inner
            .listeners
            .read()
            .iter()
            .map(|entry| (entry.id, Arc::clone(&entry.listener)))
            .collect();

        for (id, listener) in listeners {
            if let Err(message) = catch_panic(|| listener(next, prev)) {
                self.report_error(StoreError::Listener { id, message });
            }
        }
    }

    fn persist(&self, snapshot: &Snapshot) {
        let Some(backend) = &self.inner.persistence else {
            return;
        };

        let mut hook = Hook::BeforePersist {
            snapshot: snapshot.clone(),
        };
        if self.run_hook(&mut hook) == HookOutcome::Veto {
            debug!(store = %self.inner.name, "persist skipped by plugin");
            return;
        }
        let Hook::BeforePersist { snapshot } = hook else {
            return;
        };

        let success = match catch_panic(|| backend.persist(&snapshot)) {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                self.report_error(as_persistence_error(e));
                false
            }
            Err(panic) => {
                self.report_error(StoreError::Persistence(format!("persist panicked: {}", panic)));
                false
            }
        };

        self.run_hook(&mut Hook::AfterPersist { snapshot, success });
    }

    fn run_hook(&self, hook: &mut Hook) -> HookOutcome {
        if self.inner.plugins.is_empty() {
            return HookOutcome::Continue;
        }
        let run = self.inner.plugins.run(hook);
        for e in run.errors {
            self.report_error(e);
        }
        run.outcome
    }

    /// Send an error to the `OnError` hooks and the error channel.
    pub(crate) fn report_error(&self, err: StoreError) {
        if !self.inner.plugins.is_empty() {
            let mut hook = Hook::OnError { error: err.clone() };
            for e in self.inner.plugins.run(&mut hook).errors {
                error!(store = %self.inner.name, error = %e, "plugin failed while handling an error");
            }
        }

        match &self.inner.on_error {
            Some(handler) => {
                if let Err(panic) = catch_panic(|| handler(&err)) {
                    error!(store = %self.inner.name, error = %err, panic = %panic, "error handler panicked");
                }
            }
            None => {
                error!(store = %self.inner.name, kind = ?err.kind(), error = %err, "store error");
            }
        }
    }
}

fn as_persistence_error(e: StoreError) -> StoreError {
    match e {
        StoreError::Persistence(_) => e,
        other => StoreError::Persistence(other.to_string()),
    }
}

fn as_transaction_error(e: StoreError) -> StoreError {
    match e {
        StoreError::Transaction(_) => e,
        other => StoreError::Transaction(other.to_string()),
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("name", &self.inner.name)
            .field("instance_id", &self.inner.instance_id)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn store(initial: serde_json::Value) -> Store {
        Store::new(initial, StoreConfig::default()).unwrap()
    }

    #[test]
    fn test_initial_state_must_be_object() {
        let result = Store::new(json!([1, 2]), StoreConfig::default());
        assert!(matches!(result, Err(StoreError::Validation(_))));
    }

    #[test]
    fn test_merge_notifies_with_prev() {
        let store = store(json!({"count": 0}));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        store.subscribe(move |next, prev| {
            s.lock().push((
                next.get("count").and_then(Value::as_i64),
                prev.get("count").and_then(Value::as_i64),
            ));
        });

        store.dispatch(json!({"count": 1}));
        assert_eq!(*seen.lock(), vec![(Some(1), Some(0))]);
    }

    #[test]
    fn test_equal_merge_is_noop() {
        let store = store(json!({"user": {"name": "ada"}}));
        let before = store.get_state();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        store.subscribe(move |_, _| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!store.merge(json!({"user": {"name": "ada"}})));
        assert!(store.get_state().same(&before));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.history_len(), 1);
    }

    #[test]
    fn test_thunk_result_is_forwarded() {
        let store = store(json!({"count": 2}));
        let result = store.dispatch(Action::thunk(|s: &Store| {
            let n = s.get_state().get("count").and_then(Value::as_i64).unwrap_or(0);
            s.dispatch(json!({"count": n * 10}));
            Ok(Some(Value::from("done")))
        }));

        assert_eq!(result.as_ref().and_then(Value::as_str), Some("done"));
        assert_eq!(store.get_state().get("count").and_then(Value::as_i64), Some(20));
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let store = store(json!({}));
        let handle = store.subscribe(|_, _| {});
        assert_eq!(store.listener_count(), 1);
        assert!(handle.unsubscribe());
        assert!(!handle.unsubscribe());
        assert_eq!(store.listener_count(), 0);
    }

    #[test]
    fn test_destroyed_store_ignores_writes() {
        let store = store(json!({"a": 1}));
        store.destroy();
        assert!(store.is_destroyed());
        assert!(!store.merge(json!({"a": 2})));
        assert!(!store.set_path("a", 3));
        assert!(!store.transaction(|d| d.set("a", 4)));
        assert_eq!(store.get_state().get("a").and_then(Value::as_i64), Some(1));
    }

    #[test]
    fn test_listener_reentry_on_same_thread() {
        let store = store(json!({"count": 0, "echo": 0}));
        let handle_store = store.clone();
        store.subscribe(move |next, prev| {
            let count = next.get("count").and_then(Value::as_i64);
            if count != prev.get("count").and_then(Value::as_i64) {
                handle_store.set_path("echo", count.unwrap_or(0));
            }
        });

        store.set_path("count", 5);
        assert_eq!(store.get_state().get("echo").and_then(Value::as_i64), Some(5));
    }
}
