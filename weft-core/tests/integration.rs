//! End-to-end tests for the build graph
//!
//! These drive the whole pipeline the way the orchestrator does: a
//! file-backed keyed collection, a chain of derivation stages, a
//! terminal effect persisting artifacts, and quiescence detection for
//! build-complete signaling.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use dashmap::DashMap;
use tokio::sync::Notify;

use weft_core::{
    apply_change, join, Effect, FileRecord, KeyedCollection, LazyResource, Outcome,
    PropertyStore, Runtime, TaskError, TaskState,
};

type Artifacts = Arc<Mutex<BTreeMap<String, String>>>;

fn record(path: &str, content: &str) -> FileRecord {
    FileRecord::new(path, content, SystemTime::UNIX_EPOCH)
}

/// The full pipeline: files -> render -> bundle -> persisted artifacts,
/// with incremental rebuilds and removals flowing to the output.
#[tokio::test]
async fn full_build_pipeline() {
    let rt = Runtime::new();
    let files: KeyedCollection<PathBuf, FileRecord> = KeyedCollection::new(&rt);

    apply_change(&files, record("a.md", "alpha")).unwrap();
    apply_change(&files, record("b.md", "beta")).unwrap();

    let render_counts: Arc<DashMap<String, i32>> = Arc::new(DashMap::new());
    let render_counts2 = render_counts.clone();
    let rendered = files.derive(move |key: PathBuf, file: FileRecord| {
        let counts = render_counts2.clone();
        async move {
            *counts.entry(key.display().to_string()).or_insert(0) += 1;
            Ok(file.content.to_uppercase())
        }
    });
    let bundled = rendered.derive(|key: PathBuf, page: String| async move {
        Ok(format!("{}:{page}", key.display()))
    });

    let artifacts: Artifacts = Arc::new(Mutex::new(BTreeMap::new()));
    let artifacts2 = artifacts.clone();
    let bundled2 = bundled.clone();
    let _writer = Effect::new(&rt, move || {
        let mut out = BTreeMap::new();
        for (key, task) in bundled2.iter() {
            if let TaskState::Ok(artifact) = task.state() {
                out.insert(key.display().to_string(), artifact);
            }
        }
        *artifacts2.lock().unwrap() = out;
    });

    rt.await_quiescence().await;
    {
        let artifacts = artifacts.lock().unwrap();
        assert_eq!(artifacts.get("a.md").unwrap(), "a.md:ALPHA");
        assert_eq!(artifacts.get("b.md").unwrap(), "b.md:BETA");
    }
    assert_eq!(*render_counts.get("a.md").unwrap(), 1);
    assert_eq!(*render_counts.get("b.md").unwrap(), 1);

    // Incremental rebuild: only the changed file re-renders.
    apply_change(&files, record("b.md", "beta 2")).unwrap();
    rt.await_quiescence().await;
    {
        let artifacts = artifacts.lock().unwrap();
        assert_eq!(artifacts.get("b.md").unwrap(), "b.md:BETA 2");
    }
    assert_eq!(*render_counts.get("a.md").unwrap(), 1);
    assert_eq!(*render_counts.get("b.md").unwrap(), 2);

    // Removal drops the artifact.
    weft_core::apply_removal(&files, &PathBuf::from("a.md"));
    rt.await_quiescence().await;
    {
        let artifacts = artifacts.lock().unwrap();
        assert!(artifacts.get("a.md").is_none());
        assert_eq!(artifacts.len(), 1);
    }

    // The artifact manifest is plain data.
    let manifest = serde_json::to_string(&*artifacts.lock().unwrap()).unwrap();
    assert_eq!(manifest, r#"{"b.md":"b.md:BETA 2"}"#);
}

/// Reading field K and writing field J never re-runs the reader;
/// writing K re-runs it exactly once per batch.
#[test]
fn property_store_field_isolation() {
    let rt = Runtime::new();
    let store = PropertyStore::new(
        &rt,
        [("title", "A".to_string()), ("base_url", "/".to_string())],
    );

    let runs = Arc::new(AtomicI32::new(0));
    let runs2 = runs.clone();
    let store2 = store.clone();
    let _effect = Effect::new(&rt, move || {
        runs2.fetch_add(1, Ordering::SeqCst);
        store2.get("base_url");
    });
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    store.set("title", "B".to_string());
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    store.set("base_url", "/x".to_string());
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

/// A metadata-only update (identical content) must not rebuild.
#[tokio::test]
async fn identical_content_never_rebuilds() {
    let rt = Runtime::new();
    let files: KeyedCollection<String, String> = KeyedCollection::new(&rt);
    files.insert("page".into(), "body".into()).unwrap();

    let builds = Arc::new(AtomicI32::new(0));
    let builds2 = builds.clone();
    let _stage = files.derive(move |_key: String, value: String| {
        let builds = builds2.clone();
        async move {
            builds.fetch_add(1, Ordering::SeqCst);
            Ok(value)
        }
    });
    rt.await_quiescence().await;
    assert_eq!(builds.load(Ordering::SeqCst), 1);

    files.update(&"page".into(), "changed".into()).unwrap();
    rt.await_quiescence().await;
    assert_eq!(builds.load(Ordering::SeqCst), 2);

    // Same content twice: only the first triggers.
    files.update(&"page".into(), "changed".into()).unwrap();
    files.update(&"page".into(), "changed".into()).unwrap();
    rt.await_quiescence().await;
    assert_eq!(builds.load(Ordering::SeqCst), 2);
}

/// Quiescence is not reached while any task is pending, including tasks
/// triggered by another task's settlement in the same cascade.
#[tokio::test]
async fn quiescence_waits_for_cascades() {
    let rt = Runtime::new();
    let files: KeyedCollection<String, String> = KeyedCollection::new(&rt);
    files.insert("k".into(), "v".into()).unwrap();

    let gate = Arc::new(Notify::new());
    let gate2 = gate.clone();
    let first = files.derive(move |_key: String, value: String| {
        let gate = gate2.clone();
        async move {
            gate.notified().await;
            Ok(value)
        }
    });
    let second = first.derive(|_key: String, value: String| async move { Ok(format!("[{value}]")) });

    let done = Arc::new(AtomicBool::new(false));
    let done2 = done.clone();
    let rt2 = rt.clone();
    let waiter = tokio::spawn(async move {
        rt2.await_quiescence().await;
        done2.store(true, Ordering::SeqCst);
    });

    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert!(!done.load(Ordering::SeqCst), "quiescent while first stage pending");

    gate.notify_one();
    waiter.await.unwrap();
    assert!(done.load(Ordering::SeqCst));
    assert_eq!(
        second.get(&"k".into()).unwrap().state_untracked(),
        TaskState::Ok("[v]".to_string())
    );
}

/// A two-stage chain observed by one live effect activates the root
/// collection's resource exactly once; detaching the effect deactivates
/// it exactly once.
#[tokio::test]
async fn liveness_flows_through_derivation_chains() {
    let rt = Runtime::new();
    let files: KeyedCollection<String, String> = KeyedCollection::new(&rt);

    let activations = Arc::new(AtomicI32::new(0));
    let deactivations = Arc::new(AtomicI32::new(0));
    let activations2 = activations.clone();
    let deactivations2 = deactivations.clone();
    files.attach_resource(LazyResource::new(
        move || {
            activations2.fetch_add(1, Ordering::SeqCst);
            Ok(())
        },
        move || {
            deactivations2.fetch_add(1, Ordering::SeqCst);
        },
    ));

    files.insert("a".into(), "1".into()).unwrap();
    let first = files.derive(|_k: String, v: String| async move { Ok(v) });
    let second = first.derive(|_k: String, v: String| async move { Ok(v) });
    rt.await_quiescence().await;

    // Nothing live yet: the watcher stays off.
    assert_eq!(activations.load(Ordering::SeqCst), 0);

    let second2 = second.clone();
    let effect = Effect::new(&rt, move || {
        for (_key, task) in second2.iter() {
            task.state();
        }
    });
    assert_eq!(activations.load(Ordering::SeqCst), 1);
    assert_eq!(deactivations.load(Ordering::SeqCst), 0);

    // Re-runs keep the subscription stable.
    files.update(&"a".into(), "2".into()).unwrap();
    rt.await_quiescence().await;
    assert_eq!(activations.load(Ordering::SeqCst), 1);

    effect.dispose();
    assert_eq!(activations.load(Ordering::SeqCst), 1);
    assert_eq!(deactivations.load(Ordering::SeqCst), 1);
}

/// One key settling Err does not block sibling keys' Ok results from
/// reaching the terminal consumer.
#[tokio::test]
async fn errors_are_isolated_per_key() {
    let rt = Runtime::new();
    let files: KeyedCollection<String, String> = KeyedCollection::new(&rt);
    files.insert("a".into(), "1".into()).unwrap();
    files.insert("b".into(), "2".into()).unwrap();
    files.insert("c".into(), "3".into()).unwrap();

    let stage = files.derive(|key: String, value: String| async move {
        if key == "b" {
            Err(TaskError::transform("unparsable front matter"))
        } else {
            Ok(value)
        }
    });

    let delivered: Artifacts = Arc::new(Mutex::new(BTreeMap::new()));
    let failed: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let delivered2 = delivered.clone();
    let failed2 = failed.clone();
    let stage2 = stage.clone();
    let _consumer = Effect::new(&rt, move || {
        let mut out = BTreeMap::new();
        let mut errs = Vec::new();
        for (key, task) in stage2.iter() {
            match task.state() {
                TaskState::Ok(value) => {
                    out.insert(key, value);
                }
                TaskState::Err(_) => errs.push(key),
                TaskState::Pending => {}
            }
        }
        *delivered2.lock().unwrap() = out;
        *failed2.lock().unwrap() = errs;
    });

    rt.await_quiescence().await;

    let delivered = delivered.lock().unwrap();
    assert_eq!(delivered.len(), 2);
    assert_eq!(delivered.get("a").unwrap(), "1");
    assert_eq!(delivered.get("c").unwrap(), "3");
    assert_eq!(*failed.lock().unwrap(), vec!["b".to_string()]);
}

/// The dispatcher joins a frontier into a single decision for
/// all-or-nothing consumers.
#[tokio::test]
async fn dispatch_over_a_frontier() {
    let rt = Runtime::new();
    let files: KeyedCollection<String, String> = KeyedCollection::new(&rt);
    files.insert("a".into(), "1".into()).unwrap();
    files.insert("b".into(), "2".into()).unwrap();

    let stage = files.derive(|_k: String, v: String| async move { Ok(v) });
    rt.await_quiescence().await;

    let tasks: Vec<_> = stage.iter().map(|(_, task)| task).collect();
    match join(tasks.iter()) {
        Outcome::Ready(values) => assert_eq!(values, vec!["1".to_string(), "2".to_string()]),
        other => panic!("expected Ready, got {other:?}"),
    }
}

/// Continuous mode: after the initial build settles, the graph stays
/// live and the terminal effect keeps re-running per change.
#[tokio::test]
async fn continuous_mode_observes_rebuilds() {
    let rt = Runtime::new();
    let files: KeyedCollection<String, String> = KeyedCollection::new(&rt);
    files.insert("page".into(), "one".into()).unwrap();

    let stage = files.derive(|_k: String, v: String| async move { Ok(v) });

    let stage2 = stage.clone();
    let observer = Effect::new(&rt, move || {
        for (_key, task) in stage2.iter() {
            task.state();
        }
    });

    // Initial-build confirmation.
    rt.await_quiescence().await;
    let baseline = observer.run_count();

    files.update(&"page".into(), "two".into()).unwrap();
    rt.await_quiescence().await;
    assert!(observer.run_count() > baseline);

    // Still answers quiescence later in the session.
    rt.await_quiescence().await;
}
