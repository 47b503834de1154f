//! Burst Coalescing
//!
//! Some sources fire many events per logical change (editors write a
//! file several times per save; watchers report create+modify pairs).
//! [`coalesce`] wraps a per-item transform so its future first sleeps
//! out a quiet window: every re-invalidation inside the window
//! supersedes the sleeping generation, so N rapid events collapse into
//! one execution of the wrapped transform.
//!
//! The wrapped closure is still a plain transform usable with
//! `KeyedCollection::derive` and `Stage::derive`.

use std::future::Future;
use std::time::Duration;

use crate::error::TaskError;

use super::TaskFuture;

/// Wrap `transform` so rapid re-invalidations within `window` produce a
/// single execution.
pub fn coalesce<K, V, B, F, Fut>(window: Duration, transform: F) -> impl Fn(K, V) -> TaskFuture<B>
where
    K: Send + 'static,
    V: Send + 'static,
    B: Send + 'static,
    F: Fn(K, V) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<B, TaskError>> + Send + 'static,
{
    move |key, value| {
        let work = transform(key, value);
        Box::pin(async move {
            // Constructing the inner future does no work; nothing runs
            // until the window has passed without a newer generation.
            tokio::time::sleep(window).await;
            work.await
        }) as TaskFuture<B>
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::keyed::KeyedCollection;
    use crate::reactive::runtime::Runtime;
    use crate::task::TaskState;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn burst_of_updates_runs_transform_once() {
        let rt = Runtime::new();
        let files: KeyedCollection<String, String> = KeyedCollection::new(&rt);

        let executions = Arc::new(AtomicI32::new(0));
        let executions2 = executions.clone();
        let stage = files.derive(coalesce(
            Duration::from_millis(100),
            move |_key: String, value: String| {
                let executions = executions2.clone();
                async move {
                    executions.fetch_add(1, Ordering::SeqCst);
                    Ok(value.to_uppercase())
                }
            },
        ));

        files.insert("page".into(), "a".into()).unwrap();
        files.update(&"page".into(), "ab".into()).unwrap();
        files.update(&"page".into(), "abc".into()).unwrap();

        rt.await_quiescence().await;

        let task = stage.get(&"page".into()).expect("task for key");
        assert_eq!(task.state_untracked(), TaskState::Ok("ABC".to_string()));
        assert_eq!(executions.load(Ordering::SeqCst), 1);
    }
}
