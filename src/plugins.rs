//! Lifecycle hooks.
//!
//! Plugins observe a closed set of [`Hook`] events. A plugin may rewrite
//! the payload of the event it receives in place, and may veto a
//! `Before*`/`*Start` event by returning [`HookOutcome::Veto`]. Plugins
//! run in registration order; one that fails or panics is reported and
//! skipped without affecting the others.

use crate::error::{catch_panic, Result, StoreError};
use crate::history::HistoryDirection;
use crate::state::Patch;
use crate::types::{Snapshot, Value};
use std::fmt;
use std::sync::Arc;

/// Events delivered to plugins.
#[derive(Clone, Debug)]
pub enum Hook {
    /// A patch is about to be merged. Rewriting `patch` changes what is
    /// applied.
    BeforeStateChange { patch: Patch, prev: Snapshot },
    /// A change was committed and listeners have run.
    AfterStateChange { next: Snapshot, prev: Snapshot },
    /// A snapshot is about to be persisted. Rewriting `snapshot` changes
    /// what is written.
    BeforePersist { snapshot: Snapshot },
    AfterPersist { snapshot: Snapshot, success: bool },
    /// State was read from persistence at startup.
    OnLoad { loaded: Option<Value> },
    /// A snapshot arrived from another instance.
    OnSync { origin: String, incoming: Value },
    BeforeHistory { direction: HistoryDirection, steps: usize },
    AfterHistory { direction: HistoryDirection, snapshot: Snapshot },
    BatchStart,
    BatchEnd { committed: bool },
    TransactionStart,
    TransactionEnd { success: bool },
    OnError { error: StoreError },
}

impl Hook {
    pub fn name(&self) -> &'static str {
        match self {
            Hook::BeforeStateChange { .. } => "before_state_change",
            Hook::AfterStateChange { .. } => "after_state_change",
            Hook::BeforePersist { .. } => "before_persist",
            Hook::AfterPersist { .. } => "after_persist",
            Hook::OnLoad { .. } => "on_load",
            Hook::OnSync { .. } => "on_sync",
            Hook::BeforeHistory { .. } => "before_history",
            Hook::AfterHistory { .. } => "after_history",
            Hook::BatchStart => "batch_start",
            Hook::BatchEnd { .. } => "batch_end",
            Hook::TransactionStart => "transaction_start",
            Hook::TransactionEnd { .. } => "transaction_end",
            Hook::OnError { .. } => "on_error",
        }
    }

    /// Whether a veto from this hook cancels the operation.
    pub fn can_veto(&self) -> bool {
        matches!(
            self,
            Hook::BeforeStateChange { .. }
                | Hook::BeforePersist { .. }
                | Hook::BeforeHistory { .. }
                | Hook::OnSync { .. }
                | Hook::BatchStart
                | Hook::TransactionStart
        )
    }
}

/// What a plugin wants to happen after handling a hook.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum HookOutcome {
    #[default]
    Continue,
    Veto,
}

/// A lifecycle observer.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn on_hook(&self, hook: &mut Hook) -> Result<HookOutcome>;
}

/// Adapter turning a closure into a [`Plugin`].
pub struct FnPlugin<F> {
    name: String,
    handler: F,
}

impl<F> FnPlugin<F>
where
    F: Fn(&mut Hook) -> Result<HookOutcome> + Send + Sync,
{
    pub fn new(name: impl Into<String>, handler: F) -> Self {
        Self {
            name: name.into(),
            handler,
        }
    }
}

impl<F> Plugin for FnPlugin<F>
where
    F: Fn(&mut Hook) -> Result<HookOutcome> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn on_hook(&self, hook: &mut Hook) -> Result<HookOutcome> {
        (self.handler)(hook)
    }
}

/// Result of running one hook through every plugin.
#[derive(Debug, Default)]
pub(crate) struct HookRun {
    pub outcome: HookOutcome,
    pub errors: Vec<StoreError>,
}

/// Registered plugins, in order.
#[derive(Clone, Default)]
pub(crate) struct PluginHost {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginHost {
    pub fn new(plugins: Vec<Arc<dyn Plugin>>) -> Self {
        Self { plugins }
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Deliver `hook` to each plugin. The first honoured veto stops the
    /// remaining plugins.
    pub fn run(&self, hook: &mut Hook) -> HookRun {
        let mut run = HookRun::default();

        for plugin in &self.plugins {
            let hook_name = hook.name();
            let result = catch_panic(|| plugin.on_hook(hook));
            let message = match result {
                Ok(Ok(HookOutcome::Veto)) if hook.can_veto() => {
                    run.outcome = HookOutcome::Veto;
                    break;
                }
                Ok(Ok(_)) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(panic) => panic,
            };
            run.errors.push(StoreError::Middleware {
                plugin: plugin.name().to_string(),
                hook: hook_name,
                message,
            });
        }

        run
    }
}

impl fmt::Debug for PluginHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.plugins.iter().map(|p| p.name().to_string()))
            .finish()
    }
}
