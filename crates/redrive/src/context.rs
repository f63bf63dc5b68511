//! Copyright (c) 2023 University of New Hampshire
//! SPDX-License-Identifier: MIT

use std::cell::RefCell;
use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use crate::errors::{TaskError, TaskResult};
use crate::runtime::Runtime;
use crate::store::{CacheEntry, TaskId};
use crate::task_trait::Runnable;
use crate::wrapper;

// The two ambient slots of a worker thread.
//
// DISPATCHED_TASK_ID is set by the dispatcher right before it invokes the
// entry for a popped id, and taken (read + cleared) by the wrapper on entry
// so nested child invocations never inherit it. PARENT_TASK_ID is set by the
// wrapper around the user body; while it is set, task invocations on this
// thread are nested calls.
thread_local! {
    static DISPATCHED_TASK_ID: RefCell<Option<TaskId>> = const { RefCell::new(None) };
    static PARENT_TASK_ID: RefCell<Option<TaskId>> = const { RefCell::new(None) };
}

pub(crate) fn set_dispatched_id(id: Option<TaskId>) {
    DISPATCHED_TASK_ID.with(|slot| *slot.borrow_mut() = id);
}

pub(crate) fn take_dispatched_id() -> Option<TaskId> {
    DISPATCHED_TASK_ID.with(|slot| slot.borrow_mut().take())
}

pub(crate) fn parent_task_id() -> Option<TaskId> {
    PARENT_TASK_ID.with(|slot| slot.borrow().clone())
}

pub(crate) fn swap_parent_task_id(id: Option<TaskId>) -> Option<TaskId> {
    PARENT_TASK_ID.with(|slot| std::mem::replace(&mut *slot.borrow_mut(), id))
}

/// Runtime facilities handed to every task body.
///
/// The context is how the store, queue and registry reach user code without
/// being globals: the wrapper constructs one per execution pass from the
/// runtime that is driving it.
pub struct Context {
    rt: Arc<Runtime>,
}

impl Context {
    pub(crate) fn new(rt: Arc<Runtime>) -> Self {
        Self { rt }
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.rt
    }

    /// The id of the enclosing task, when a body is running on this thread.
    pub fn task_id(&self) -> Option<TaskId> {
        parent_task_id()
    }

    /// Invoke a child task from within a task body.
    ///
    /// Never blocks. Returns the child's value if it already succeeded,
    /// fails with [`TaskError::ChildFailed`] if it already failed, and
    /// otherwise queues the child (first encounter only) and suspends the
    /// calling body. Propagate the result with `?`.
    pub fn call<T: Runnable>(&self, task: T) -> TaskResult<T::Output> {
        wrapper::invoke(&self.rt, &task)
    }

    /// Memoize a locally computed value under `key` in the enclosing task's
    /// record, so it survives re-entry.
    ///
    /// The helper runs at most once per task: later passes (and later calls
    /// in the same pass) get the recorded value back. Keys are unique within
    /// a task, so a second helper reusing the key fails with
    /// [`TaskError::CacheKeyConflict`]. Outside a task body this fails with
    /// [`TaskError::NoAmbientTask`].
    pub fn cached<V, F>(&self, key: &str, f: F) -> Result<V, TaskError>
    where
        V: Serialize + DeserializeOwned,
        F: FnOnce() -> V,
    {
        let task_id = parent_task_id().ok_or(TaskError::NoAmbientTask)?;
        let origin = std::any::type_name::<F>();
        let handle = self.rt.store().handle(&task_id)?;

        {
            let guard = handle.lock();
            if let Some(entry) = guard.cache_get(key) {
                if entry.origin() != origin {
                    return Err(TaskError::CacheKeyConflict {
                        task: task_id,
                        key: key.to_owned(),
                        bound_to: entry.origin().to_owned(),
                    });
                }
                debug!("task {task_id} cache hit for {key:?}");
                return serde_json::from_value(entry.value.clone()).map_err(|e| {
                    TaskError::internal(format!(
                        "cache entry {key:?} of task {task_id} no longer decodes: {e}"
                    ))
                });
            }
        }

        // only one pass of a task runs at a time, so nothing races us
        // between the miss above and the write below; the helper itself
        // stays outside the record lock
        let value = f();
        let encoded = serde_json::to_value(&value)
            .map_err(|e| TaskError::ArgumentNotSerializable(e.to_string()))?;

        handle.lock().cache_set(key, CacheEntry::new(encoded, origin));
        Ok(value)
    }
}
