//! Copyright (c) 2023 University of New Hampshire
//! SPDX-License-Identifier: MIT

//! The re-entrancy engine.
//!
//! A task invocation behaves differently depending on where it happens. At
//! the top of a worker's stack (the dispatcher popped this task's id) the
//! wrapper drives the user body and settles the record from its outcome.
//! Inside another task's body, the wrapper never runs anything: it answers
//! from the child's record when the child is terminal, and otherwise queues
//! the child and suspends the caller.
//!
//! Re-entry then works by replay. When a child completes it re-enqueues its
//! parent; the parent body re-runs from the top, every already-settled child
//! call short-circuits to its recorded outcome (child ids are deterministic,
//! so the calls resolve to the same records), and execution walks forward to
//! the next unsatisfied child or to completion.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::context::{self, Context};
use crate::errors::{Interrupt, TaskError, TaskResult};
use crate::runtime::Runtime;
use crate::store::{TaskHandle, TaskId, TaskStatus};
use crate::task_trait::{Runnable, TaskIdentifier};

/// Canonicalize a task's arguments to a structural value.
///
/// Maps serialize with keys in lexicographic order, so equal argument
/// mappings canonicalize identically regardless of insertion order.
pub(crate) fn canonical_args<T: Serialize>(task: &T) -> Result<Value, TaskError> {
    serde_json::to_value(task).map_err(|e| TaskError::ArgumentNotSerializable(e.to_string()))
}

/// The default child identity: a digest over name, version, parent id and
/// canonical arguments.
pub(crate) fn deterministic_task_id(
    ident: &TaskIdentifier,
    parent: Option<&TaskId>,
    args: &Value,
) -> TaskId {
    let mut hasher = Sha256::new();

    hasher.update(ident.name().as_bytes());
    hasher.update([0u8]);
    hasher.update(ident.version().to_le_bytes());
    if let Some(parent) = parent {
        hasher.update(parent.as_str().as_bytes());
    }
    hasher.update([0u8]);
    hasher.update(args.to_string().as_bytes());

    TaskId::from_digest(&hasher.finalize())
}

/// Create a top-level record for `task` if its id is unknown and hand the id
/// to the queue. The one code path by which new top-level work enters the
/// runtime; [`Runtime::submit`] is a thin wrapper around it.
pub(crate) fn submit_top_level<T: Runnable>(rt: &Runtime, task: &T) -> Result<TaskId, TaskError> {
    let args = canonical_args(task)?;
    let id = task.task_id(None)?;

    if !rt.store().exists(&id) {
        match rt
            .store()
            .create_top_level(T::identifier(), args, id.clone(), T::retry_count())
        {
            Ok(_) => info!("submitted task {id} ({})", T::identifier()),
            // a concurrent submit of the same logical task won the insert
            Err(TaskError::TaskExists(_)) => {}
            Err(e) => return Err(e),
        }
    }

    rt.queue().put(id.clone());
    Ok(id)
}

/// Invoke `task`, in whichever mode the ambient context dictates.
pub(crate) fn invoke<T: Runnable>(rt: &Arc<Runtime>, task: &T) -> TaskResult<T::Output> {
    let args = canonical_args(task)?;

    // take (read + clear) the dispatched id so nested calls don't inherit it
    let dispatched = context::take_dispatched_id();
    let parent = context::parent_task_id();

    let task_id = match dispatched {
        // the dispatcher handed us this id: this is a resume
        Some(id) => id,
        None => task.task_id(parent.as_ref())?,
    };

    match parent {
        Some(parent_id) => nested_call::<T>(rt, task_id, parent_id, args),
        None => top_of_stack(rt, task, task_id),
    }
}

/// Mode 1: the running body of `parent_id` invoked another task.
fn nested_call<T: Runnable>(
    rt: &Arc<Runtime>,
    task_id: TaskId,
    parent_id: TaskId,
    args: Value,
) -> TaskResult<T::Output> {
    if rt.store().exists(&task_id) {
        let handle = rt.store().handle(&task_id)?;
        let guard = handle.lock();

        return match guard.status {
            TaskStatus::Success => {
                let result = guard
                    .result
                    .clone()
                    .ok_or_else(|| TaskError::internal(format!("task {task_id} succeeded without a result")))?;

                serde_json::from_value(result).map_err(|e| {
                    TaskError::internal(format!("result of task {task_id} no longer decodes: {e}"))
                        .into()
                })
            }
            TaskStatus::Failed => {
                let error = guard
                    .error
                    .clone()
                    .unwrap_or_else(|| TaskError::internal("failed task with no recorded error"));

                Err(Interrupt::Fail(TaskError::ChildFailed {
                    child: task_id.clone(),
                    error: Box::new(error),
                }))
            }
            status => {
                // already queued or running; its completion will wake us
                debug!("child {task_id} is {status:?}, suspending parent {parent_id}");
                Err(Interrupt::Suspend)
            }
        };
    }

    let handle = match rt.store().create_child(
        T::identifier(),
        args,
        &parent_id,
        task_id.clone(),
        T::retry_count(),
    ) {
        Ok(handle) => handle,
        Err(TaskError::TaskExists(_)) => {
            // lost a race with another creator; the record is live now
            debug!("child {task_id} appeared concurrently, suspending parent {parent_id}");
            return Err(Interrupt::Suspend);
        }
        Err(e) => return Err(e.into()),
    };

    let mut guard = handle.try_lock()?;
    rt.queue().put(task_id.clone());
    guard.set_status(TaskStatus::Pending)?;
    drop(guard);

    debug!("queued child {task_id} under parent {parent_id}, suspending");
    Err(Interrupt::Suspend)
}

/// Mode 2: the dispatcher entered this task with an id it popped.
fn top_of_stack<T: Runnable>(
    rt: &Arc<Runtime>,
    task: &T,
    task_id: TaskId,
) -> TaskResult<T::Output> {
    // queued ids are created before they are queued, so an unknown id here
    // surfaces as InvalidTaskId rather than being silently re-created
    let handle = rt.store().handle(&task_id)?;

    let mut guard = match handle.try_lock() {
        Ok(guard) => guard,
        Err(_) => {
            // another worker holds the record right now. Lock hold times are
            // a few field writes, so hand the delivery back to the queue
            // rather than losing it.
            debug!("task {task_id} is locked, requeueing this delivery");
            rt.queue().put(task_id);
            return Err(Interrupt::Suspend);
        }
    };

    if guard.status.is_terminal() {
        // redelivered after completion: answer from the record, run nothing
        return match guard.status {
            TaskStatus::Success => {
                let result = guard
                    .result
                    .clone()
                    .ok_or_else(|| TaskError::internal(format!("task {task_id} succeeded without a result")))?;

                serde_json::from_value(result).map_err(|e| {
                    TaskError::internal(format!("result of task {task_id} no longer decodes: {e}"))
                        .into()
                })
            }
            _ => {
                let error = guard
                    .error
                    .clone()
                    .unwrap_or_else(|| TaskError::internal("failed task with no recorded error"));
                Err(Interrupt::Fail(error))
            }
        };
    }

    if !guard.has_status_in(&[TaskStatus::Created, TaskStatus::Pending, TaskStatus::Retrying]) {
        // Running: another worker is mid-pass. A child may have completed
        // after that pass read it, so the pass re-checks on settle instead
        // of this delivery being dropped.
        debug!("task {task_id} is {:?}, deferring this delivery", guard.status);
        guard.note_redelivery();
        return Err(Interrupt::Suspend);
    }

    guard.set_status(TaskStatus::Running)?;
    let parent_id = guard.parent_id.clone();

    // release the record before the body runs: nested calls take this lock
    drop(guard);

    debug!("running task {}", task.summarize(&task_id));

    let ctx = Context::new(rt.clone());
    let saved = context::swap_parent_task_id(Some(task_id.clone()));
    let outcome = catch_unwind(AssertUnwindSafe(|| task.run(&ctx)));
    context::swap_parent_task_id(saved);

    settle::<T>(rt, handle, task_id, parent_id, outcome)
}

/// Write a finished pass's outcome back to the record and wake whoever needs
/// waking.
fn settle<T: Runnable>(
    rt: &Arc<Runtime>,
    handle: TaskHandle,
    task_id: TaskId,
    parent_id: Option<TaskId>,
    outcome: std::thread::Result<TaskResult<T::Output>>,
) -> TaskResult<T::Output> {
    match outcome {
        Ok(Ok(value)) => match serde_json::to_value(&value) {
            Ok(encoded) => {
                handle.lock().set_result(encoded)?;
                info!("task {task_id} succeeded");
                wake_parent(rt, &parent_id);
                Ok(value)
            }
            Err(e) => Err(fail_or_retry(
                rt,
                &handle,
                task_id,
                parent_id,
                TaskError::ArgumentNotSerializable(e.to_string()),
            )),
        },

        Ok(Err(Interrupt::Suspend)) => {
            // a child is in flight; it will re-enqueue us when it lands,
            // so the parent is deliberately not woken here
            let mut guard = handle.lock();
            guard.set_status(TaskStatus::Pending)?;
            let replay = guard.take_redelivery();
            drop(guard);

            if replay {
                // a wake-up arrived mid-pass and was deferred to us
                rt.queue().put(task_id.clone());
            }

            debug!("task {task_id} parked on an unfinished child");
            Err(Interrupt::Suspend)
        }

        Ok(Err(Interrupt::Fail(error @ TaskError::ChildFailed { .. }))) => {
            handle.lock().set_error(error.clone())?;
            warn!("task {task_id} failed: {error}");
            wake_parent(rt, &parent_id);
            Err(Interrupt::Fail(error))
        }

        Ok(Err(Interrupt::Fail(error))) => {
            Err(fail_or_retry(rt, &handle, task_id, parent_id, error))
        }

        Err(payload) => {
            let error = TaskError::Panic(panic_message(payload));
            Err(fail_or_retry(rt, &handle, task_id, parent_id, error))
        }
    }
}

/// A failure of the task's own body: consume a retry if any are left,
/// otherwise record the failure and wake the parent.
fn fail_or_retry(
    rt: &Arc<Runtime>,
    handle: &TaskHandle,
    task_id: TaskId,
    parent_id: Option<TaskId>,
    error: TaskError,
) -> Interrupt {
    let mut guard = handle.lock();

    if guard.take_retry() {
        let remaining = guard.retries_left;
        if let Err(e) = guard.set_status(TaskStatus::Retrying) {
            return Interrupt::Fail(e);
        }
        drop(guard);

        warn!("task {task_id} failed ({error}), retrying ({remaining} attempts left)");
        rt.queue().put(task_id);
        Interrupt::Suspend
    } else {
        if let Err(e) = guard.set_error(error.clone()) {
            return Interrupt::Fail(e);
        }
        drop(guard);

        warn!("task {task_id} failed: {error}");
        wake_parent(rt, &parent_id);
        Interrupt::Fail(error)
    }
}

fn wake_parent(rt: &Arc<Runtime>, parent_id: &Option<TaskId>) {
    if let Some(parent) = parent_id {
        debug!("waking parent {parent}");
        rt.queue().put(parent.clone());
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast_ref::<&'static str>() {
        Some(s) => (*s).to_owned(),
        None => match payload.downcast_ref::<String>() {
            Some(s) => s.clone(),
            None => "Box<dyn Any>".to_owned(),
        },
    }
}

/// The "wrapped function" stored in the registry for one task type.
pub(crate) fn dispatch_entry<T: Runnable>(
    rt: &Arc<Runtime>,
    data: Value,
) -> Result<(), TaskError> {
    let task: T = serde_json::from_value(data).map_err(|e| {
        TaskError::internal(format!(
            "stored arguments for {} no longer decode: {e}",
            T::identifier()
        ))
    })?;

    match invoke(rt, &task) {
        // a recorded failure is a settled task, not a dispatcher problem
        Ok(_) | Err(Interrupt::Suspend) => Ok(()),
        Err(Interrupt::Fail(error)) => {
            debug!("task settled with failure: {error}");
            Ok(())
        }
    }
}

/// Attempt every thunk in order, then settle on the collected outcomes with
/// priority: some other failure > a child failure > suspension. Only if
/// every thunk produced a value does the whole combinator produce the value
/// list.
///
/// Attempting all thunks before suspending is what fans children out: each
/// not-yet-known child gets created and queued in the same pass, so they
/// execute concurrently while the parent is parked. A thunk that consumes an
/// earlier thunk's value simply suspends the pass at that point, which is
/// how serial dependencies fall out.
pub fn run_in_parallel<T, I, F>(thunks: I) -> TaskResult<Vec<T>>
where
    I: IntoIterator<Item = F>,
    F: FnOnce() -> TaskResult<T>,
{
    let mut values = Vec::new();
    let mut suspended = false;
    let mut child_failure = None;
    let mut other_failure = None;

    for thunk in thunks {
        match thunk() {
            Ok(value) => values.push(value),
            Err(Interrupt::Suspend) => suspended = true,
            Err(Interrupt::Fail(error @ TaskError::ChildFailed { .. })) => {
                child_failure = Some(error)
            }
            Err(Interrupt::Fail(error)) => other_failure = Some(error),
        }
    }

    if let Some(error) = other_failure {
        Err(Interrupt::Fail(error))
    } else if let Some(error) = child_failure {
        Err(Interrupt::Fail(error))
    } else if suspended {
        Err(Interrupt::Suspend)
    } else {
        Ok(values)
    }
}
