//! Copyright (c) 2023 University of New Hampshire
//! SPDX-License-Identifier: MIT

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::{TaskId, TaskStatus};
use crate::task_trait::TaskIdentifier;

/// Every way a task, or an operation on a task, can fail.
///
/// The enum is serializable because a failure is part of a task's record: a
/// child that failed yesterday must surface the same error to its parent on
/// every later re-entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum TaskError {
    /// A task id was looked up that no record exists for
    #[error("no task with id {0}")]
    InvalidTaskId(TaskId),

    /// Creation was attempted with an id the store already knows.
    ///
    /// Distinct from [`TaskError::InvalidTaskId`] so callers can branch on
    /// "already known" versus "new" without a second lookup.
    #[error("task {0} already exists")]
    TaskExists(TaskId),

    /// A state transition was attempted from a status that does not allow it
    #[error("task {id} has status {actual:?}, expected one of [{expected}]")]
    InvalidTaskStatus {
        id: TaskId,
        actual: TaskStatus,
        expected: String,
    },

    /// A non-blocking lock acquisition failed where exclusive access was
    /// required
    #[error("task {0} is locked by another worker")]
    LockedTask(TaskId),

    /// Task arguments (or a task result) could not be canonicalized to a
    /// structural value
    #[error("arguments are not serializable: {0}")]
    ArgumentNotSerializable(String),

    /// A child task surfaced its failure to the enclosing task; `error`
    /// carries the child's own recorded failure
    #[error("child task {child} failed: {error}")]
    ChildFailed { child: TaskId, error: Box<TaskError> },

    /// Two different cached helpers within one task body share a key
    #[error("cache key {key:?} in task {task} is already bound to {bound_to}")]
    CacheKeyConflict {
        task: TaskId,
        key: String,
        bound_to: String,
    },

    /// A task-scoped operation ran with no enclosing task body
    #[error("no ambient task: this operation may only be called from within a task body")]
    NoAmbientTask,

    /// A `(name, version)` pair was registered twice
    #[error("{0} is already registered")]
    AlreadyRegistered(TaskIdentifier),

    /// A task body signalled failure with its own message
    #[error("{0}")]
    Reason(String),

    /// The task body panicked; the panic was caught by the runtime and its
    /// payload is contained within
    #[error("task panicked: {0}")]
    Panic(String),

    /// The runtime itself misbehaved (a record that no longer decodes, a
    /// missing registration for a stored task, ...)
    #[error("internal runtime error: {0}")]
    Internal(String),
}

impl TaskError {
    pub fn reason(msg: impl Into<String>) -> Self {
        Self::Reason(msg.into())
    }

    pub(crate) fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// What a task invocation hands back when it does not hand back a value.
///
/// [`Interrupt::Suspend`] is a control signal, not a failure: it means a
/// child of the running task is not done yet, and unwinds the body (via `?`)
/// to the dispatcher entry, which parks the task until the child completes.
/// User code must propagate it untouched: a body that intercepts `Suspend`
/// and carries on leaves its task permanently parked, and the runtime makes
/// no attempt to rescue such tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interrupt {
    /// A child is still in flight; re-run the body once it lands
    Suspend,

    /// A real failure; recorded on the task and surfaced to its parent
    Fail(TaskError),
}

impl From<TaskError> for Interrupt {
    fn from(value: TaskError) -> Self {
        Interrupt::Fail(value)
    }
}

/// The return channel of every task body and every nested task call.
pub type TaskResult<T> = Result<T, Interrupt>;
