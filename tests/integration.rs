//! Integration tests for the state container.

use parking_lot::Mutex;
use serde_json::json;
use snapstore::{
    Action, FnPlugin, Hook, HookOutcome, MemoryPersistence, Patch, Persistence, Snapshot, Store,
    StoreConfig, StoreError, SyncHub, Value,
};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};

fn test_store(initial: serde_json::Value) -> Store {
    Store::new(initial, StoreConfig::default()).unwrap()
}

fn int(snapshot: &Snapshot, key: &str) -> Option<i64> {
    snapshot.get(key).and_then(Value::as_i64)
}

fn counter(store: &Store) -> Arc<AtomicUsize> {
    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    store.subscribe(move |_, _| {
        c.fetch_add(1, Ordering::SeqCst);
    });
    calls
}

// --- Realistic Workflow Tests ---

#[test]
fn test_counter_scenario() {
    let store = test_store(json!({"count": 0}));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = seen.clone();
    store.subscribe(move |next, prev| {
        s.lock().push((int(next, "count"), int(prev, "count")));
    });

    store.dispatch(json!({"count": 1}));
    assert_eq!(*seen.lock(), vec![(Some(1), Some(0))]);

    store.update_path(["count"], |c| {
        c.and_then(Value::as_i64).map(|n| Value::from(n + 1))
    });
    assert_eq!(int(&store.get_state(), "count"), Some(2));

    assert!(store.undo(1));
    assert_eq!(int(&store.get_state(), "count"), Some(1));

    assert!(store.redo(1));
    assert_eq!(int(&store.get_state(), "count"), Some(2));
}

#[test]
fn test_todo_list_workflow() {
    let store = test_store(json!({
        "todos": [],
        "filter": "all",
    }));

    for title in ["write tests", "review", "ship"] {
        store.update_path("todos", |todos| {
            let mut items = todos.and_then(Value::as_array).map(<[Value]>::to_vec).unwrap_or_default();
            items.push(Value::from(json!({"title": title, "done": false})));
            Some(Value::array(items))
        });
    }
    assert!(store.set_path("todos.1.done", true));
    assert!(store.remove_path("todos.0"));

    let state = store.get_state().to_json();
    assert_eq!(
        state["todos"],
        json!([
            {"title": "review", "done": true},
            {"title": "ship", "done": false},
        ])
    );
    assert_eq!(state["filter"], json!("all"));
}

// --- Structural Sharing ---

#[test]
fn test_untouched_keys_keep_their_reference() {
    let store = test_store(json!({
        "user": {"name": "ada", "tags": ["a", "b"]},
        "settings": {"theme": "dark"},
        "items": [1, 2, 3],
    }));
    let before = store.get_state();

    store.set_path("user.name", "grace");
    let after = store.get_state();

    assert!(after.get("settings").unwrap().same(before.get("settings").unwrap()));
    assert!(after.get("items").unwrap().same(before.get("items").unwrap()));
    assert!(!after.get("user").unwrap().same(before.get("user").unwrap()));

    let tags_before = before.get("user").unwrap().get("tags").unwrap();
    let tags_after = after.get("user").unwrap().get("tags").unwrap();
    assert!(tags_after.same(tags_before));
}

#[test]
fn test_published_snapshot_is_never_mutated() {
    let store = test_store(json!({"list": [1, 2]}));
    let held = store.get_state();

    store.update_path("list.0", |_| Some(Value::from(100)));
    store.transaction(|draft| {
        if let Some(list) = draft.get_mut("list").and_then(Value::as_array_mut) {
            list.push(Value::from(3));
        }
        Ok(())
    });

    assert_eq!(held.to_json(), json!({"list": [1, 2]}));
    assert_eq!(store.get_state().to_json(), json!({"list": [100, 2, 3]}));
}

// --- No-op Updates ---

#[test]
fn test_identity_update_is_noop() {
    let store = test_store(json!({"a": {"b": [1, 2]}, "c": 1}));
    let calls = counter(&store);
    let before = store.get_state();

    for path in ["a", "a.b", "a.b.0", "c", "missing"] {
        assert!(!store.update_path(path, |v| v.cloned()));
    }

    assert!(store.get_state().same(&before));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(store.history_len(), 1);
}

#[test]
fn test_structurally_equal_merge_keeps_references() {
    let store = test_store(json!({"config": {"retries": 3}, "n": 1}));
    let before = store.get_state();

    store.dispatch(json!({"config": {"retries": 3}, "n": 2}));
    let after = store.get_state();

    assert!(after.get("config").unwrap().same(before.get("config").unwrap()));
    assert_eq!(int(&after, "n"), Some(2));
}

// --- Dispatch ---

#[test]
fn test_patch_action_removes_keys() {
    let store = test_store(json!({"a": 1, "b": 2}));
    store.dispatch(Patch::new().remove("a").set("c", 3));
    assert_eq!(store.get_state().to_json(), json!({"b": 2, "c": 3}));
}

#[test]
fn test_thunk_can_drive_the_store() {
    let store = test_store(json!({"loading": false, "items": []}));
    let result = store.dispatch(Action::thunk(|s: &Store| {
        s.dispatch(json!({"loading": true}));
        s.batch(|s| {
            s.set_path("items", Value::from(json!(["x", "y"])));
            s.set_path("loading", false);
            Ok(())
        })?;
        Ok(Some(Value::from(s.get_state().get("items").and_then(Value::as_array).map(|a| a.len()).unwrap_or(0))))
    }));

    assert_eq!(result.and_then(|v| v.as_u64()), Some(2));
    assert_eq!(store.get_state().to_json(), json!({"loading": false, "items": ["x", "y"]}));
}

#[test]
fn test_typed_run() {
    let store = test_store(json!({"n": 20}));
    let doubled = store.run(|s| Ok(int(&s.get_state(), "n").unwrap_or(0) * 2));
    assert_eq!(doubled, Some(40));
}

#[test]
fn test_store_clone_from_another_thread() {
    let store = test_store(json!({"n": 0}));
    let remote = store.clone();
    std::thread::spawn(move || {
        for _ in 0..10 {
            remote.update_path("n", |n| n.and_then(Value::as_i64).map(|n| Value::from(n + 1)));
        }
    })
    .join()
    .unwrap();

    assert_eq!(int(&store.get_state(), "n"), Some(10));
}

// --- Async Thunks ---

struct NoopWaker;

impl Wake for NoopWaker {
    fn wake(self: Arc<Self>) {}
}

fn poll_once<F: Future + Unpin>(future: &mut F) -> Poll<F::Output> {
    let waker = Waker::from(Arc::new(NoopWaker));
    let mut cx = Context::from_waker(&waker);
    Pin::new(future).poll(&mut cx)
}

fn block_on<F: Future>(future: F) -> F::Output {
    let mut future = Box::pin(future);
    loop {
        if let Poll::Ready(output) = poll_once(&mut future) {
            return output;
        }
    }
}

/// Pending on the first poll, ready on the second.
struct YieldOnce(bool);

impl Future for YieldOnce {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.0 {
            return Poll::Ready(());
        }
        self.0 = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

#[test]
fn test_async_thunk_runs_when_polled() {
    let store = test_store(json!({"n": 0}));
    let calls = counter(&store);

    let mut pending = Box::pin(store.dispatch_async(|s| async move {
        s.dispatch(json!({"n": 1}));
        YieldOnce(false).await;
        s.dispatch(json!({"n": 2}));
        Ok(Some(Value::from("done")))
    }));
    assert_eq!(int(&store.get_state(), "n"), Some(0));

    assert!(poll_once(&mut pending).is_pending());
    assert_eq!(int(&store.get_state(), "n"), Some(1));

    let result = block_on(pending);
    assert_eq!(result.as_ref().and_then(Value::as_str), Some("done"));
    assert_eq!(int(&store.get_state(), "n"), Some(2));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_async_thunk_failures_are_reported() {
    let errors = Arc::new(Mutex::new(Vec::new()));
    let e = errors.clone();
    let store = Store::new(
        json!({"n": 0}),
        StoreConfig {
            on_error: Some(Arc::new(move |err: &StoreError| e.lock().push(err.clone()))),
            ..Default::default()
        },
    )
    .unwrap();

    let rejected = store.dispatch_async(|s| async move {
        s.dispatch(json!({"n": 1}));
        YieldOnce(false).await;
        Err(StoreError::Sync("offline".into()))
    });
    assert!(block_on(rejected).is_none());

    let panicked = store.run_async(|_| async move {
        YieldOnce(false).await;
        if true {
            panic!("async thunk blew up");
        }
        Ok(1)
    });
    assert_eq!(block_on(panicked), None);

    assert_eq!(int(&store.get_state(), "n"), Some(1));
    let errors = errors.lock();
    assert_eq!(errors.len(), 2);
    assert!(matches!(&errors[0], StoreError::Sync(m) if m == "offline"));
    assert!(matches!(&errors[1], StoreError::Store(m) if m.contains("async thunk blew up")));
}

#[test]
fn test_typed_async_run() {
    let store = test_store(json!({"items": [1, 2, 3]}));
    let len = store.run_async(|s| async move {
        YieldOnce(false).await;
        Ok(s.get_state().get("items").and_then(Value::as_array).map(|a| a.len()))
    });
    assert_eq!(block_on(len), Some(Some(3)));

    store.destroy();
    let after = store.run_async(|_| async { Ok(1) });
    assert_eq!(block_on(after), None);
}

// --- Batches ---

#[test]
fn test_batch_coalesces_notifications() {
    let store = test_store(json!({}));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = seen.clone();
    store.subscribe(move |next, _| s.lock().push(next.to_json()));

    store
        .batch(|s| {
            s.dispatch(json!({"a": 1}));
            s.dispatch(json!({"b": 2}));
            Ok(())
        })
        .unwrap();

    assert_eq!(*seen.lock(), vec![json!({"a": 1, "b": 2})]);
    assert_eq!(store.history_len(), 2);
}

#[test]
fn test_batch_reads_virtual_state() {
    let store = test_store(json!({"n": 1}));
    let calls = counter(&store);

    store
        .batch(|s| {
            s.dispatch(json!({"n": 2}));
            assert_eq!(int(&s.get_state(), "n"), Some(2));
            s.update_path("n", |n| n.and_then(Value::as_i64).map(|n| Value::from(n * 10)));
            assert_eq!(calls.load(Ordering::SeqCst), 0);
            Ok(())
        })
        .unwrap();

    assert_eq!(int(&store.get_state(), "n"), Some(20));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_nested_batches_flush_once() {
    let store = test_store(json!({}));
    let calls = counter(&store);

    store
        .batch(|s| {
            s.dispatch(json!({"a": 1}));
            s.batch(|s| {
                s.dispatch(json!({"b": 2}));
                Ok(())
            })?;
            assert_eq!(calls.load(Ordering::SeqCst), 0);
            s.dispatch(json!({"a": 3}));
            Ok(())
        })
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.get_state().to_json(), json!({"a": 3, "b": 2}));
}

#[test]
fn test_failed_batch_applies_nothing() {
    let store = test_store(json!({"a": 0}));
    let calls = counter(&store);

    let result: Result<(), StoreError> = store.batch(|s| {
        s.dispatch(json!({"a": 1}));
        Err(StoreError::Store("abort".into()))
    });

    assert!(result.is_err());
    assert_eq!(int(&store.get_state(), "a"), Some(0));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_failed_inner_batch_keeps_outer_work() {
    let store = test_store(json!({}));
    store
        .batch(|s| {
            s.dispatch(json!({"outer": true}));
            let inner: Result<(), StoreError> = s.batch(|s| {
                s.dispatch(json!({"inner": true}));
                Err(StoreError::Store("inner failed".into()))
            });
            assert!(inner.is_err());
            Ok(())
        })
        .unwrap();

    assert_eq!(store.get_state().to_json(), json!({"outer": true}));
}

// --- Transactions ---

#[test]
fn test_transaction_commits_changed_keys_only() {
    let store = test_store(json!({"a": {"x": 1}, "b": {"y": 2}}));
    let before = store.get_state();

    assert!(store.transaction(|draft| {
        draft.set("a.x", 10)?;
        draft.set("c", "new")?;
        Ok(())
    }));

    let after = store.get_state();
    assert_eq!(after.to_json(), json!({"a": {"x": 10}, "b": {"y": 2}, "c": "new"}));
    assert!(after.get("b").unwrap().same(before.get("b").unwrap()));
    assert_eq!(store.history_len(), 2);
}

#[test]
fn test_unchanged_transaction_is_noop() {
    let store = test_store(json!({"a": 1}));
    let calls = counter(&store);
    let before = store.get_state();

    assert!(store.transaction(|draft| {
        assert_eq!(draft.get("a").and_then(Value::as_i64), Some(1));
        Ok(())
    }));

    assert!(store.get_state().same(&before));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_transaction_is_atomic() {
    let store = test_store(json!({"a": 1, "b": 2}));
    let before = store.get_state();

    let ok = store.transaction(|draft| {
        draft.set("a", 100)?;
        draft.remove("b")?;
        Err(StoreError::Validation("rejected".into()))
    });
    assert!(!ok);
    assert!(store.get_state().same(&before));

    let ok = store.transaction(|draft| {
        draft.set("a", 100)?;
        panic!("recipe exploded");
    });
    assert!(!ok);
    assert!(store.get_state().same(&before));
}

// --- History ---

#[test]
fn test_history_is_bounded() {
    let store = Store::new(
        json!({"n": 0}),
        StoreConfig {
            history_limit: 5,
            ..Default::default()
        },
    )
    .unwrap();

    for n in 1..=12 {
        store.dispatch(json!({ "n": n }));
    }

    let entries = store.history_entries();
    assert_eq!(entries.len(), 5);
    assert_eq!(int(&entries[0], "n"), Some(8));
    assert_eq!(int(&entries[4], "n"), Some(12));
    assert!(store.can_undo(4));
    assert!(!store.can_undo(5));
}

#[test]
fn test_undo_redo_multiple_steps() {
    let store = test_store(json!({"n": 0}));
    for n in 1..=4 {
        store.dispatch(json!({ "n": n }));
    }

    assert!(store.undo(3));
    assert_eq!(int(&store.get_state(), "n"), Some(1));
    assert!(!store.undo(2));
    assert!(store.redo(2));
    assert_eq!(int(&store.get_state(), "n"), Some(3));
    assert!(!store.redo(0));
}

#[test]
fn test_new_change_after_undo_drops_redo() {
    let store = test_store(json!({"n": 0}));
    store.dispatch(json!({"n": 1}));
    store.dispatch(json!({"n": 2}));
    store.undo(1);
    store.dispatch(json!({"n": 5}));

    assert!(!store.can_redo(1));
    store.undo(1);
    assert_eq!(int(&store.get_state(), "n"), Some(1));
}

#[test]
fn test_undo_notifies_listeners_without_recording() {
    let store = test_store(json!({"n": 0}));
    store.dispatch(json!({"n": 1}));
    let calls = counter(&store);

    store.undo(1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.history_len(), 2);
}

#[test]
fn test_history_disabled() {
    let store = Store::new(
        json!({"n": 0}),
        StoreConfig {
            enable_history: false,
            ..Default::default()
        },
    )
    .unwrap();
    store.dispatch(json!({"n": 1}));
    assert!(!store.can_undo(1));
    assert!(!store.undo(1));
    assert_eq!(store.history_len(), 0);
}

#[test]
fn test_reset_restores_initial_state() {
    let store = test_store(json!({"n": 0}));
    store.dispatch(json!({"n": 1, "extra": true}));
    let calls = counter(&store);

    store.reset();
    assert_eq!(store.get_state().to_json(), json!({"n": 0}));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.history_len(), 1);
    assert!(!store.can_undo(1));
}

#[test]
fn test_clear_history_keeps_state() {
    let store = test_store(json!({"n": 0}));
    store.dispatch(json!({"n": 1}));
    store.clear_history();
    assert!(!store.can_undo(1));
    assert_eq!(int(&store.get_state(), "n"), Some(1));
}

// --- Persistence ---

#[test]
fn test_persisted_state_is_merged_at_startup() {
    let backend = Arc::new(MemoryPersistence::with_value(&Value::from(json!({"theme": "dark"}))).unwrap());
    let store = Store::new(
        json!({"theme": "light", "lang": "en"}),
        StoreConfig {
            persistence: Some(backend.clone()),
            ..Default::default()
        },
    )
    .unwrap();

    assert_eq!(store.get_state().to_json(), json!({"theme": "dark", "lang": "en"}));
    assert!(!store.can_undo(1));

    store.dispatch(json!({"lang": "fr"}));
    let stored: serde_json::Value = serde_json::from_str(&backend.raw().unwrap()).unwrap();
    assert_eq!(stored, json!({"theme": "dark", "lang": "fr"}));

    store.clear_persisted();
    assert!(backend.load().unwrap().is_none());
}

// --- Plugins ---

#[test]
fn test_plugin_transforms_and_vetoes() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let l = log.clone();
    let store = Store::new(
        json!({"n": 0}),
        StoreConfig {
            plugins: vec![
                Arc::new(FnPlugin::new("guard", |hook: &mut Hook| {
                    if let Hook::BeforeStateChange { patch, .. } = hook {
                        if patch.get("locked").is_some() {
                            return Ok(HookOutcome::Veto);
                        }
                        patch.insert("touched", Some(Value::from(true)));
                    }
                    Ok(HookOutcome::Continue)
                })),
                Arc::new(FnPlugin::new("log", move |hook: &mut Hook| {
                    l.lock().push(hook.name());
                    Ok(HookOutcome::Continue)
                })),
            ],
            ..Default::default()
        },
    )
    .unwrap();

    store.dispatch(json!({"n": 1}));
    assert_eq!(store.get_state().to_json(), json!({"n": 1, "touched": true}));

    store.dispatch(json!({"locked": true}));
    assert!(store.get_state().get("locked").is_none());

    let log = log.lock();
    assert_eq!(&log[..2], &["before_state_change", "after_state_change"]);
    assert_eq!(log.len(), 2);
}

#[test]
fn test_batch_and_transaction_hooks() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let l = log.clone();
    let store = Store::new(
        json!({}),
        StoreConfig {
            plugins: vec![Arc::new(FnPlugin::new("log", move |hook: &mut Hook| {
                match hook {
                    Hook::BatchEnd { committed } => l.lock().push(format!("batch_end:{}", committed)),
                    Hook::TransactionEnd { success } => {
                        l.lock().push(format!("transaction_end:{}", success))
                    }
                    other => l.lock().push(other.name().to_string()),
                }
                Ok(HookOutcome::Continue)
            }))],
            ..Default::default()
        },
    )
    .unwrap();

    store
        .batch(|s| {
            s.dispatch(json!({"a": 1}));
            Ok(())
        })
        .unwrap();
    store.transaction(|_| Err(StoreError::Store("no".into())));

    let log = log.lock();
    assert_eq!(
        *log,
        vec![
            "batch_start",
            "before_state_change",
            "after_state_change",
            "batch_end:true",
            "transaction_start",
            "on_error",
            "transaction_end:false",
        ]
    );
}

// --- Sync ---

#[test]
fn test_two_instances_stay_in_sync() {
    let hub = SyncHub::new();
    let a = Store::new(
        json!({"n": 0}),
        StoreConfig {
            name: "a".into(),
            sync: Some(Arc::new(hub.connect())),
            ..Default::default()
        },
    )
    .unwrap();
    let b_backend = Arc::new(MemoryPersistence::new());
    let b = Store::new(
        json!({"n": 0}),
        StoreConfig {
            name: "b".into(),
            sync: Some(Arc::new(hub.connect())),
            persistence: Some(b_backend.clone()),
            ..Default::default()
        },
    )
    .unwrap();
    let b_calls = counter(&b);

    a.dispatch(json!({"n": 7}));
    assert_eq!(int(&b.get_state(), "n"), Some(0));

    assert_eq!(b.tick(), 1);
    assert_eq!(int(&b.get_state(), "n"), Some(7));
    assert_eq!(b_calls.load(Ordering::SeqCst), 1);
    assert!(b.can_undo(1));
    assert!(b_backend.raw().is_none());

    // B applied A's update without republishing it.
    assert_eq!(a.tick(), 0);
    assert_eq!(int(&a.get_state(), "n"), Some(7));
}

#[test]
fn test_publisher_does_not_queue_its_own_updates() {
    let hub = SyncHub::new();
    let bridge = Arc::new(hub.connect());
    let peer = hub.connect();
    let store = Store::new(
        json!({"n": 0}),
        StoreConfig {
            sync: Some(bridge.clone()),
            ..Default::default()
        },
    )
    .unwrap();

    for i in 1..=500 {
        store.dispatch(json!({ "n": i }));
    }

    assert!(bridge.drain().is_empty());
    assert_eq!(peer.drain().len(), 500);
}

#[test]
fn test_external_update_from_self_is_ignored() {
    let store = test_store(json!({"n": 0}));
    let id = store.instance_id().to_string();
    assert!(!store.apply_external_update(&id, Value::from(json!({"n": 1}))));
    assert!(store.apply_external_update("other", Value::from(json!({"n": 1}))));
    assert!(!store.apply_external_update("other", Value::from(json!({"n": 1}))));
    assert_eq!(int(&store.get_state(), "n"), Some(1));
}

// --- Lifecycle ---

#[test]
fn test_destroy_is_terminal() {
    let store = test_store(json!({"n": 0}));
    let calls = counter(&store);
    store.destroy();

    assert_eq!(store.listener_count(), 0);
    assert!(store.dispatch(json!({"n": 1})).is_none());
    assert!(!store.undo(1));
    store.reset();
    assert_eq!(int(&store.get_state(), "n"), Some(0));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}
