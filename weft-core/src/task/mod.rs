//! Async Derived Task
//!
//! A Task is a graph node computed by an asynchronous function. Its
//! visible state is one of `Pending`, `Ok(value)` or `Err(error)`, with
//! no stale-value-while-revalidating mode: consumers see either a fresh
//! result or `Pending`.
//!
//! # Body Shape
//!
//! The body is a *synchronous* closure run under dependency tracking. It
//! reads upstream values and returns the future for the actual work:
//!
//! ```rust,ignore
//! let task = Task::new(&rt, move |_ctx| {
//!     let record = files.get(&path).ok_or(Halt::Pending)?;
//!     Ok(Box::pin(async move { render(record).await }) as TaskFuture<Page>)
//! });
//! ```
//!
//! Reading another Task inside the body uses [`Task::read`], which
//! short-circuits with `Halt::Pending` when the upstream is still
//! pending (propagating backpressure without invoking the async work)
//! and `Halt::Failed` when it settled with an error. All upstream reads
//! happen at invocation start, after the batch has fully propagated to
//! synchronous nodes, so the task observes consistent state.
//!
//! # Generations
//!
//! Every restart advances a monotonic generation, sets the superseded
//! generation's cancellation flag and aborts its future. The abort is
//! best-effort; the correctness guarantee is the generation check at
//! delivery, which suppresses any stale completion that outruns it.
//!
//! # Failure
//!
//! A panic in the body or the future settles the task as
//! `Err(TaskError::Panicked)`; the graph itself never unwinds.

pub mod coalesce;
pub mod dispatch;

use std::fmt::Debug;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};

use crate::error::TaskError;
use crate::graph::node::{NodeKind, SourceId};
use crate::reactive::runtime::{ReactiveNode, Runtime};
use crate::reactive::subscriber::SubscriberId;

pub use dispatch::{join, Outcome};

/// The future a task body hands back for the asynchronous part of its
/// work.
pub type TaskFuture<T> = Pin<Box<dyn Future<Output = Result<T, TaskError>> + Send>>;

/// The visible result of a task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskState<T> {
    /// No result yet, or just invalidated.
    Pending,
    /// The latest generation completed.
    Ok(T),
    /// The latest generation failed.
    Err(TaskError),
}

impl<T> TaskState<T> {
    pub fn is_pending(&self) -> bool {
        matches!(self, TaskState::Pending)
    }

    pub fn is_settled(&self) -> bool {
        !self.is_pending()
    }
}

/// Why a task body stopped before producing its future.
#[derive(Debug, Clone, PartialEq)]
pub enum Halt {
    /// An upstream task is still pending; this task stays pending too.
    Pending,
    /// An upstream task failed, or the body itself gave up.
    Failed(TaskError),
}

impl From<TaskError> for Halt {
    fn from(error: TaskError) -> Self {
        Halt::Failed(error)
    }
}

/// Handed to the body on each invocation: the generation it belongs to
/// and the flag that flips when that generation is superseded.
pub struct TaskContext {
    generation: u64,
    cancelled: Arc<AtomicBool>,
}

impl TaskContext {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// A clonable flag the future can poll cooperatively.
    pub fn cancel_flag(&self) -> CancelFlag {
        CancelFlag(self.cancelled.clone())
    }
}

/// Cancellation flag for one task generation.
#[derive(Clone)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

type Body<T> = Box<dyn Fn(&TaskContext) -> Result<TaskFuture<T>, Halt> + Send + Sync>;

/// An async derived node with a tri-state result.
pub struct Task<T>
where
    T: Clone + Send + Sync + 'static,
{
    runtime: Runtime,
    inner: Arc<TaskInner<T>>,
}

struct TaskInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    weak_self: Weak<TaskInner<T>>,
    runtime: Runtime,
    subscriber: SubscriberId,
    source: SourceId,
    body: Body<T>,
    cell: RwLock<TaskCell<T>>,
    retired: AtomicBool,
}

struct TaskCell<T> {
    state: TaskState<T>,
    generation: u64,
    cancel: Arc<AtomicBool>,
    abort: Option<tokio::task::AbortHandle>,
}

impl<T> Task<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a task and run its first generation immediately.
    ///
    /// Must be called inside a tokio runtime: the async part of the
    /// body is spawned onto it.
    pub fn new<F>(runtime: &Runtime, body: F) -> Self
    where
        F: Fn(&TaskContext) -> Result<TaskFuture<T>, Halt> + Send + Sync + 'static,
    {
        let subscriber = SubscriberId::new();
        let source = runtime.register_source(Some(subscriber));
        let inner = Arc::new_cyclic(|weak| TaskInner {
            weak_self: weak.clone(),
            runtime: runtime.clone(),
            subscriber,
            source,
            body: Box::new(body),
            cell: RwLock::new(TaskCell {
                state: TaskState::Pending,
                generation: 0,
                cancel: Arc::new(AtomicBool::new(false)),
                abort: None,
            }),
            retired: AtomicBool::new(false),
        });
        runtime.register_subscriber(
            subscriber,
            Arc::downgrade(&inner) as Weak<dyn ReactiveNode>,
            NodeKind::Task,
            Some(source),
            false,
        );
        runtime.pending_increment();
        inner.restart(runtime);
        Self {
            runtime: runtime.clone(),
            inner,
        }
    }

    /// Read the full tri-state result, registering a dependency.
    pub fn state(&self) -> TaskState<T> {
        self.runtime.track_read(self.inner.source);
        self.inner
            .cell
            .read()
            .expect("task cell lock poisoned")
            .state
            .clone()
    }

    /// Read for use inside another task's body: unwraps `Ok`,
    /// short-circuits `Pending` and propagates `Err`.
    pub fn read(&self) -> Result<T, Halt> {
        match self.state() {
            TaskState::Ok(value) => Ok(value),
            TaskState::Pending => Err(Halt::Pending),
            TaskState::Err(error) => Err(Halt::Failed(error)),
        }
    }

    /// Read the state without establishing a dependency.
    pub fn state_untracked(&self) -> TaskState<T> {
        self.inner
            .cell
            .read()
            .expect("task cell lock poisoned")
            .state
            .clone()
    }

    /// The current generation number.
    pub fn generation(&self) -> u64 {
        self.inner
            .cell
            .read()
            .expect("task cell lock poisoned")
            .generation
    }

    /// Permanently cancel the task and remove it from the graph.
    /// Called when the owning collection key is removed.
    pub(crate) fn retire(&self) {
        if self.inner.retired.swap(true, Ordering::SeqCst) {
            return;
        }
        let was_pending = {
            let mut cell = self.inner.cell.write().expect("task cell lock poisoned");
            cell.cancel.store(true, Ordering::SeqCst);
            if let Some(abort) = cell.abort.take() {
                abort.abort();
            }
            cell.generation += 1;
            cell.state.is_pending()
        };
        if was_pending {
            // It will never settle; release its quiescence hold.
            self.runtime.pending_decrement();
        }
        self.runtime.drop_subscriber(self.inner.subscriber);
        self.runtime.retire_source(self.inner.source);
    }
}

impl<T> TaskInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Start a new generation. Returns whether the visible state
    /// changed (a settled task going back to pending, or a synchronous
    /// settlement).
    fn restart(&self, rt: &Runtime) -> bool {
        if self.retired.load(Ordering::SeqCst) {
            return false;
        }
        let (ctx, was_settled) = {
            let mut cell = self.cell.write().expect("task cell lock poisoned");
            cell.cancel.store(true, Ordering::SeqCst);
            if let Some(abort) = cell.abort.take() {
                abort.abort();
            }
            cell.generation += 1;
            let was_settled = cell.state.is_settled();
            if was_settled {
                rt.pending_increment();
                cell.state = TaskState::Pending;
            }
            cell.cancel = Arc::new(AtomicBool::new(false));
            (
                TaskContext {
                    generation: cell.generation,
                    cancelled: cell.cancel.clone(),
                },
                was_settled,
            )
        };
        let generation = ctx.generation;
        tracing::trace!(generation, "task restart");

        let outcome = rt.tracked_run(self.subscriber, || {
            catch_unwind(AssertUnwindSafe(|| (self.body)(&ctx)))
        });
        match outcome {
            Ok(Ok(future)) => {
                self.spawn(rt, generation, future);
                was_settled
            }
            Ok(Err(Halt::Pending)) => was_settled,
            Ok(Err(Halt::Failed(error))) => {
                self.settle_sync(rt, generation, TaskState::Err(error));
                true
            }
            Err(_) => {
                tracing::error!("task body panicked");
                self.settle_sync(rt, generation, TaskState::Err(TaskError::Panicked));
                true
            }
        }
    }

    /// Settle without spawning (error short-circuits and panics).
    fn settle_sync(&self, rt: &Runtime, generation: u64, state: TaskState<T>) {
        {
            let mut cell = self.cell.write().expect("task cell lock poisoned");
            if cell.generation != generation || cell.state.is_settled() {
                return;
            }
            cell.state = state;
            cell.abort = None;
        }
        rt.bump_version(self.source);
        rt.pending_decrement();
    }

    fn spawn(&self, rt: &Runtime, generation: u64, future: TaskFuture<T>) {
        let work = tokio::spawn(future);
        {
            let mut cell = self.cell.write().expect("task cell lock poisoned");
            if cell.generation == generation {
                cell.abort = Some(work.abort_handle());
            } else {
                work.abort();
                return;
            }
        }
        let weak = self.weak_self.clone();
        let rt = rt.clone();
        tokio::spawn(async move {
            let outcome = match work.await {
                Ok(result) => result,
                Err(join_error) if join_error.is_panic() => Err(TaskError::Panicked),
                Err(_) => return, // aborted: this generation was superseded
            };
            if let Some(task) = weak.upgrade() {
                task.deliver(&rt, generation, outcome);
            }
        });
    }

    /// Accept an async completion, but only if its generation is still
    /// current. The pending counter is released only after the
    /// settlement's own propagation pass, so quiescence is never
    /// observed mid-cascade.
    fn deliver(&self, rt: &Runtime, generation: u64, outcome: Result<T, TaskError>) {
        let accepted = {
            let mut cell = self.cell.write().expect("task cell lock poisoned");
            if cell.generation != generation {
                tracing::trace!(generation, "stale task completion suppressed");
                false
            } else {
                cell.state = match outcome {
                    Ok(value) => TaskState::Ok(value),
                    Err(error) => TaskState::Err(error),
                };
                cell.abort = None;
                true
            }
        };
        if accepted {
            rt.mark_changed(self.source);
            rt.pending_decrement();
        }
    }
}

impl<T> ReactiveNode for TaskInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn invalidate(&self, rt: &Runtime) -> Option<SourceId> {
        if self.retired.load(Ordering::SeqCst) {
            return None;
        }
        if self.restart(rt) {
            Some(self.source)
        } else {
            None
        }
    }
}

impl<T> Clone for Task<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            runtime: self.runtime.clone(),
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Debug for Task<T>
where
    T: Clone + Send + Sync + Debug + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.inner.source.raw())
            .field("state", &self.state_untracked())
            .field("generation", &self.generation())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::signal::Signal;
    use std::sync::atomic::AtomicI32;
    use tokio::sync::Notify;

    #[tokio::test]
    async fn task_settles_ok() {
        let rt = Runtime::new();
        let input = Signal::new(&rt, 3);

        let input2 = input.clone();
        let task = Task::new(&rt, move |_ctx| {
            let value = input2.get();
            Ok(Box::pin(async move { Ok(value * 2) }) as TaskFuture<i32>)
        });

        assert!(task.state_untracked().is_pending());
        rt.await_quiescence().await;
        assert_eq!(task.state_untracked(), TaskState::Ok(6));
    }

    #[tokio::test]
    async fn task_restarts_on_input_change() {
        let rt = Runtime::new();
        let input = Signal::new(&rt, 1);

        let input2 = input.clone();
        let task = Task::new(&rt, move |_ctx| {
            let value = input2.get();
            Ok(Box::pin(async move { Ok(value + 10) }) as TaskFuture<i32>)
        });

        rt.await_quiescence().await;
        assert_eq!(task.state_untracked(), TaskState::Ok(11));

        input.set(5);
        rt.await_quiescence().await;
        assert_eq!(task.state_untracked(), TaskState::Ok(15));
        assert!(task.generation() >= 2);
    }

    #[tokio::test]
    async fn pending_upstream_short_circuits_without_running_body_work() {
        let rt = Runtime::new();
        let gate = Arc::new(Notify::new());

        let gate2 = gate.clone();
        let upstream = Task::new(&rt, move |_ctx| {
            let gate = gate2.clone();
            Ok(Box::pin(async move {
                gate.notified().await;
                Ok(1)
            }) as TaskFuture<i32>)
        });

        let downstream_work = Arc::new(AtomicI32::new(0));
        let downstream_work2 = downstream_work.clone();
        let upstream2 = upstream.clone();
        let downstream = Task::new(&rt, move |_ctx| {
            let value = upstream2.read()?;
            let work = downstream_work2.clone();
            Ok(Box::pin(async move {
                work.fetch_add(1, Ordering::SeqCst);
                Ok(value + 1)
            }) as TaskFuture<i32>)
        });

        tokio::task::yield_now().await;
        assert!(downstream.state_untracked().is_pending());
        assert_eq!(downstream_work.load(Ordering::SeqCst), 0);

        gate.notify_one();
        rt.await_quiescence().await;
        assert_eq!(downstream.state_untracked(), TaskState::Ok(2));
        assert_eq!(downstream_work.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn upstream_error_propagates() {
        let rt = Runtime::new();

        let upstream = Task::new(&rt, move |_ctx| {
            Ok(Box::pin(async move {
                Err::<i32, _>(TaskError::transform("bad input"))
            }) as TaskFuture<i32>)
        });

        let upstream2 = upstream.clone();
        let downstream = Task::new(&rt, move |_ctx| {
            let value = upstream2.read()?;
            Ok(Box::pin(async move { Ok(value + 1) }) as TaskFuture<i32>)
        });

        rt.await_quiescence().await;
        assert!(matches!(
            downstream.state_untracked(),
            TaskState::Err(TaskError::Transform(_))
        ));
    }

    #[tokio::test]
    async fn stale_generation_never_wins() {
        let rt = Runtime::new();
        let input = Signal::new(&rt, "slow".to_string());
        let gate = Arc::new(Notify::new());

        let input2 = input.clone();
        let gate2 = gate.clone();
        let task = Task::new(&rt, move |_ctx| {
            let value = input2.get();
            let gate = gate2.clone();
            Ok(Box::pin(async move {
                if value == "slow" {
                    gate.notified().await;
                }
                Ok(value.to_uppercase())
            }) as TaskFuture<String>)
        });

        tokio::task::yield_now().await;
        assert!(task.state_untracked().is_pending());

        // Supersede the in-flight generation before it completes.
        input.set("fast".to_string());
        rt.await_quiescence().await;
        assert_eq!(task.state_untracked(), TaskState::Ok("FAST".to_string()));

        // Even if the first generation were released now, its result
        // must never surface.
        gate.notify_one();
        tokio::task::yield_now().await;
        assert_eq!(task.state_untracked(), TaskState::Ok("FAST".to_string()));
    }

    #[tokio::test]
    async fn panicking_future_settles_as_error() {
        let rt = Runtime::new();

        let task = Task::new(&rt, move |_ctx| {
            Ok(Box::pin(async move {
                if true {
                    panic!("render exploded");
                }
                Ok(0)
            }) as TaskFuture<i32>)
        });

        rt.await_quiescence().await;
        assert_eq!(task.state_untracked(), TaskState::Err(TaskError::Panicked));
    }

    #[tokio::test]
    async fn cancellation_flag_reaches_the_future() {
        let rt = Runtime::new();
        let input = Signal::new(&rt, 1);
        let observed = Arc::new(AtomicI32::new(-1));

        let input2 = input.clone();
        let observed2 = observed.clone();
        let _task = Task::new(&rt, move |ctx| {
            let value = input2.get();
            let flag = ctx.cancel_flag();
            let observed = observed2.clone();
            Ok(Box::pin(async move {
                if !flag.is_cancelled() {
                    observed.store(value, Ordering::SeqCst);
                }
                Ok(value)
            }) as TaskFuture<i32>)
        });

        rt.await_quiescence().await;
        assert_eq!(observed.load(Ordering::SeqCst), 1);
    }
}
