//! Copyright (c) 2023 University of New Hampshire
//! SPDX-License-Identifier: MIT

use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{info, warn};

use crate::dispatcher::Dispatcher;
use crate::errors::TaskError;
use crate::queue::WorkQueue;
use crate::registry::{DispatchEntry, Registry};
use crate::store::{TaskId, TaskRecord, TaskStatus, TaskStore};
use crate::task_trait::Runnable;
use crate::wrapper;

/// The owning handle on the whole runtime: store, queue, registry and
/// executor pool live here and nowhere else. Construct one, register the
/// task types it will drive, start it, submit work.
pub struct Runtime {
    store: TaskStore,
    queue: WorkQueue,
    registry: Registry,
    dispatcher: Mutex<Option<Dispatcher>>,
}

impl Runtime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            store: TaskStore::new(),
            queue: WorkQueue::new(),
            registry: Registry::new(),
            dispatcher: Mutex::new(None),
        })
    }

    /// Register a task type under its `(name, version)` identifier.
    pub fn register<T: Runnable>(&self) -> Result<(), TaskError> {
        self.registry.insert(
            T::identifier(),
            DispatchEntry {
                run: wrapper::dispatch_entry::<T>,
            },
        )
    }

    /// Create a top-level record for `task` (unless one already exists for
    /// its id) and queue it. Returns the id to wait on.
    pub fn submit<T: Runnable>(&self, task: T) -> Result<TaskId, TaskError> {
        wrapper::submit_top_level(self, &task)
    }

    /// Re-queue an id the store already knows. Ids without records are
    /// rejected so the queue never holds orphans.
    pub fn enqueue(&self, id: &TaskId) -> Result<(), TaskError> {
        if !self.store.exists(id) {
            return Err(TaskError::InvalidTaskId(id.clone()));
        }

        self.queue.put(id.clone());
        Ok(())
    }

    /// Block until the task reaches a terminal state; returns its result or
    /// surfaces its recorded error.
    pub fn wait_for(&self, id: &TaskId) -> Result<Value, TaskError> {
        let record = self.store.handle(id)?.wait_terminal();

        match record.status {
            TaskStatus::Success => record
                .result
                .ok_or_else(|| TaskError::internal(format!("task {id} succeeded without a result"))),
            _ => Err(record
                .error
                .unwrap_or_else(|| TaskError::internal(format!("task {id} failed without a recorded error")))),
        }
    }

    /// [`Runtime::wait_for`], decoded to a concrete type.
    pub fn wait_for_as<V: DeserializeOwned>(&self, id: &TaskId) -> Result<V, TaskError> {
        let value = self.wait_for(id)?;

        serde_json::from_value(value)
            .map_err(|e| TaskError::internal(format!("result of task {id} does not decode: {e}")))
    }

    pub fn status_of(&self, id: &TaskId) -> Result<TaskStatus, TaskError> {
        Ok(self.store.handle(id)?.lock().status)
    }

    pub fn record_of(&self, id: &TaskId) -> Result<TaskRecord, TaskError> {
        Ok(self.store.handle(id)?.lock().snapshot())
    }

    /// Start `worker_count` executor threads draining the queue.
    pub fn start(self: &Arc<Self>, worker_count: usize) {
        let mut dispatcher = self.dispatcher.lock();

        if dispatcher.is_some() {
            warn!("dispatcher is already running");
            return;
        }

        info!("starting {worker_count} workers");
        *dispatcher = Some(Dispatcher::start(self, worker_count));
    }

    /// Stop the executor pool. Safe to call more than once.
    pub fn stop(&self) {
        if let Some(dispatcher) = self.dispatcher.lock().take() {
            info!("stopping dispatcher");
            dispatcher.stop();
        }
    }

    /// A header with the store and queue sizes, then one line per known
    /// task, for operator eyes.
    pub fn summarize(&self) -> String {
        let mut lines = vec![format!(
            "{} tasks known, {} deliveries queued",
            self.store.task_count(),
            self.queue.depth()
        )];

        lines.extend(
            self.store
                .snapshot_all()
                .iter()
                .map(|record| record.summarize()),
        );

        lines.join("\n")
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    pub(crate) fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.registry
    }
}
