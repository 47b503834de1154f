//! Result Dispatch
//!
//! Joining a set of tasks into a single decision is how terminal
//! consumers branch on build state. [`join`] reads the state of *every*
//! task given to it, and the reads are tracked, so the caller's
//! dependency on each task survives no matter which branch the caller
//! then takes.
//! An effect dispatching over tasks can therefore never lose its
//! subscription to a source that happened to be pending on one run.
//!
//! Precedence follows the build contract: any error wins, then any
//! pending, otherwise all values are unwrapped in input order.

use crate::error::TaskError;

use super::{Task, TaskState};

/// The joint result of a set of tasks.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    /// Every task settled `Ok`; values in input order.
    Ready(Vec<T>),
    /// At least one task is still pending (and none failed).
    Pending,
    /// At least one task failed; the first error in input order.
    Failed(TaskError),
}

impl<T> Outcome<T> {
    pub fn is_ready(&self) -> bool {
        matches!(self, Outcome::Ready(_))
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Outcome::Pending)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Outcome::Failed(_))
    }
}

/// Join the current states of `tasks`, reading (and tracking) all of
/// them.
pub fn join<'a, T, I>(tasks: I) -> Outcome<T>
where
    T: Clone + Send + Sync + 'static,
    I: IntoIterator<Item = &'a Task<T>>,
{
    let mut values = Vec::new();
    let mut first_error: Option<TaskError> = None;
    let mut any_pending = false;

    // Read every state before deciding, so all dependencies register.
    for task in tasks {
        match task.state() {
            TaskState::Ok(value) => values.push(value),
            TaskState::Pending => any_pending = true,
            TaskState::Err(error) => {
                if first_error.is_none() {
                    first_error = Some(error);
                }
            }
        }
    }

    if let Some(error) = first_error {
        Outcome::Failed(error)
    } else if any_pending {
        Outcome::Pending
    } else {
        Outcome::Ready(values)
    }
}
