//! Copyright (c) 2023 University of New Hampshire
//! SPDX-License-Identifier: MIT

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use itertools::Itertools;
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::errors::TaskError;
use crate::task_trait::TaskIdentifier;

/// Opaque task identity, stable across re-executions of the same logical
/// task.
///
/// Child ids are a digest of `(name, version, parent_id, arguments)`, so the
/// same call from the same parent collides with the existing record instead
/// of spawning a new one. Top-level tasks that want a fresh run per
/// submission use [`TaskId::random`] instead.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub(crate) fn from_digest(digest: &[u8]) -> Self {
        Self(base16ct::lower::encode_string(digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Created,
    Pending,
    Running,
    Retrying,
    Success,
    Failed,
}

impl TaskStatus {
    /// Terminal statuses are absorbing: no transition leaves them.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failed)
    }
}

/// One memoized value in a task's local cache, tagged with the type path of
/// the helper that produced it so a second helper reusing the key is caught
/// at use-time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub value: Value,
    origin: String,
}

impl CacheEntry {
    pub(crate) fn new(value: Value, origin: &str) -> Self {
        Self {
            value,
            origin: origin.to_owned(),
        }
    }

    pub(crate) fn origin(&self) -> &str {
        &self.origin
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub ident: TaskIdentifier,
    pub status: TaskStatus,
    pub data: Value,
    pub result: Option<Value>,
    pub error: Option<TaskError>,
    pub parent_id: Option<TaskId>,
    pub cache: BTreeMap<String, CacheEntry>,
    pub retries_left: u32,

    // a delivery arrived while a pass was mid-body; the settling pass owes
    // the queue one re-enqueue. Runtime state, not part of the persisted
    // record.
    #[serde(skip)]
    pub(crate) redelivered: bool,
}

impl TaskRecord {
    fn new(
        id: TaskId,
        ident: TaskIdentifier,
        data: Value,
        parent_id: Option<TaskId>,
        retries: u32,
    ) -> Self {
        Self {
            id,
            ident,
            status: TaskStatus::Created,
            data,
            result: None,
            error: None,
            parent_id,
            cache: BTreeMap::new(),
            retries_left: retries,
            redelivered: false,
        }
    }

    pub fn summarize(&self) -> String {
        format!(
            "{:width$} {:width2$} {}",
            format!("{:?}", self.status),
            self.ident.to_string(),
            self.id,
            width = 10,
            width2 = 40
        )
    }
}

#[derive(Debug)]
struct TaskSlot {
    record: Mutex<TaskRecord>,
    // notified exactly when the record goes terminal
    done: Condvar,
}

/// A refcounted reference to one task's slot. All record access goes through
/// [`TaskHandle::lock`] / [`TaskHandle::try_lock`], so holding the record's
/// lock is not a convention but the only way in.
#[derive(Clone, Debug)]
pub struct TaskHandle {
    id: TaskId,
    slot: Arc<TaskSlot>,
}

impl TaskHandle {
    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn lock(&self) -> TaskGuard<'_> {
        TaskGuard {
            record: self.slot.record.lock(),
            done: &self.slot.done,
        }
    }

    pub fn try_lock(&self) -> Result<TaskGuard<'_>, TaskError> {
        match self.slot.record.try_lock() {
            Some(record) => Ok(TaskGuard {
                record,
                done: &self.slot.done,
            }),
            None => Err(TaskError::LockedTask(self.id.clone())),
        }
    }

    /// Blocks until the record is terminal, then returns a snapshot of it.
    pub fn wait_terminal(&self) -> TaskRecord {
        let mut record = self.slot.record.lock();
        while !record.status.is_terminal() {
            self.slot.done.wait(&mut record);
        }
        record.clone()
    }
}

/// Exclusive access to one task record. Mutations validate the status
/// machine: terminal states are only entered through [`TaskGuard::set_result`]
/// / [`TaskGuard::set_error`] and never left.
#[derive(Debug)]
pub struct TaskGuard<'a> {
    record: MutexGuard<'a, TaskRecord>,
    done: &'a Condvar,
}

impl std::ops::Deref for TaskGuard<'_> {
    type Target = TaskRecord;

    fn deref(&self) -> &Self::Target {
        &self.record
    }
}

impl TaskGuard<'_> {
    pub fn snapshot(&self) -> TaskRecord {
        self.record.clone()
    }

    pub fn set_status(&mut self, status: TaskStatus) -> Result<(), TaskError> {
        if status.is_terminal() {
            return Err(TaskError::internal(
                "terminal states are entered via set_result/set_error",
            ));
        }
        if self.record.status.is_terminal() {
            return Err(self.bad_status(&[
                TaskStatus::Created,
                TaskStatus::Pending,
                TaskStatus::Running,
                TaskStatus::Retrying,
            ]));
        }
        debug!("task {} status {:?} -> {:?}", self.record.id, self.record.status, status);
        self.record.status = status;
        Ok(())
    }

    pub fn set_result(&mut self, result: Value) -> Result<(), TaskError> {
        if self.record.status.is_terminal() {
            return Err(self.bad_status(&[TaskStatus::Running]));
        }
        debug!("task {} result recorded", self.record.id);
        self.record.result = Some(result);
        self.record.status = TaskStatus::Success;
        self.done.notify_all();
        Ok(())
    }

    pub fn set_error(&mut self, error: TaskError) -> Result<(), TaskError> {
        if self.record.status.is_terminal() {
            return Err(self.bad_status(&[TaskStatus::Running]));
        }
        debug!("task {} error recorded: {error}", self.record.id);
        self.record.error = Some(error);
        self.record.status = TaskStatus::Failed;
        self.done.notify_all();
        Ok(())
    }

    pub fn has_status_in(&self, allowed: &[TaskStatus]) -> bool {
        allowed.contains(&self.record.status)
    }

    pub fn expect_status_in(&self, allowed: &[TaskStatus]) -> Result<(), TaskError> {
        if self.has_status_in(allowed) {
            Ok(())
        } else {
            Err(self.bad_status(allowed))
        }
    }

    /// A delivery found this record mid-pass; the pass must re-check after
    /// it settles instead of letting the delivery vanish.
    pub(crate) fn note_redelivery(&mut self) {
        debug!("task {} was redelivered while running", self.record.id);
        self.record.redelivered = true;
    }

    pub(crate) fn take_redelivery(&mut self) -> bool {
        std::mem::take(&mut self.record.redelivered)
    }

    /// Consumes one retry if any are left.
    pub(crate) fn take_retry(&mut self) -> bool {
        if self.record.retries_left > 0 {
            self.record.retries_left -= 1;
            true
        } else {
            false
        }
    }

    pub fn cache_has(&self, key: &str) -> bool {
        self.record.cache.contains_key(key)
    }

    pub fn cache_get(&self, key: &str) -> Option<&CacheEntry> {
        self.record.cache.get(key)
    }

    pub fn cache_set(&mut self, key: &str, entry: CacheEntry) {
        debug!("task {} cache key {key:?} set", self.record.id);
        self.record.cache.insert(key.to_owned(), entry);
    }

    fn bad_status(&self, expected: &[TaskStatus]) -> TaskError {
        TaskError::InvalidTaskStatus {
            id: self.record.id.clone(),
            actual: self.record.status,
            expected: expected.iter().map(|s| format!("{s:?}")).join(", "),
        }
    }
}

/// The in-memory task store: `task_id` → record, one lock per record.
///
/// Records are never deleted; the store is monotonic. An on-disk or
/// networked backend replaces this type behind the same handle/guard
/// surface.
pub struct TaskStore {
    tasks: DashMap<TaskId, Arc<TaskSlot>>,
}

impl TaskStore {
    pub(crate) fn new() -> Self {
        Self {
            tasks: DashMap::new(),
        }
    }

    pub fn exists(&self, id: &TaskId) -> bool {
        self.tasks.contains_key(id)
    }

    pub fn handle(&self, id: &TaskId) -> Result<TaskHandle, TaskError> {
        match self.tasks.get(id) {
            Some(slot) => Ok(TaskHandle {
                id: id.clone(),
                slot: slot.clone(),
            }),
            None => Err(TaskError::InvalidTaskId(id.clone())),
        }
    }

    pub(crate) fn create_child(
        &self,
        ident: TaskIdentifier,
        data: Value,
        parent_id: &TaskId,
        id: TaskId,
        retries: u32,
    ) -> Result<TaskHandle, TaskError> {
        // a dangling parent_id would orphan the wake-up chain
        if !self.exists(parent_id) {
            return Err(TaskError::InvalidTaskId(parent_id.clone()));
        }

        let record = TaskRecord::new(id, ident, data, Some(parent_id.clone()), retries);
        self.insert(record)
    }

    pub(crate) fn create_top_level(
        &self,
        ident: TaskIdentifier,
        data: Value,
        id: TaskId,
        retries: u32,
    ) -> Result<TaskHandle, TaskError> {
        let record = TaskRecord::new(id, ident, data, None, retries);
        self.insert(record)
    }

    fn insert(&self, record: TaskRecord) -> Result<TaskHandle, TaskError> {
        let id = record.id.clone();

        match self.tasks.entry(id.clone()) {
            Entry::Occupied(_) => Err(TaskError::TaskExists(id)),
            Entry::Vacant(vacant) => {
                debug!("created task {id}, {}", record.ident);
                let slot = Arc::new(TaskSlot {
                    record: Mutex::new(record),
                    done: Condvar::new(),
                });
                vacant.insert(slot.clone());
                Ok(TaskHandle { id, slot })
            }
        }
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn snapshot_all(&self) -> Vec<TaskRecord> {
        let mut records: Vec<TaskRecord> = self
            .tasks
            .iter()
            .map(|entry| entry.value().record.lock().clone())
            .collect();

        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ident() -> TaskIdentifier {
        TaskIdentifier::named("store test task")
    }

    fn store_with_task(id: &str) -> (TaskStore, TaskHandle) {
        let store = TaskStore::new();
        let handle = store
            .create_top_level(ident(), json!({"k": 1}), TaskId(id.into()), 0)
            .unwrap();
        (store, handle)
    }

    #[test]
    fn creation_rejects_colliding_ids_distinctly() {
        let (store, _handle) = store_with_task("a");

        let err = store
            .create_top_level(ident(), json!(null), TaskId("a".into()), 0)
            .unwrap_err();

        assert!(matches!(err, TaskError::TaskExists(_)));
    }

    #[test]
    fn child_creation_requires_a_known_parent() {
        let store = TaskStore::new();

        let err = store
            .create_child(
                ident(),
                json!(null),
                &TaskId("nobody".into()),
                TaskId("c".into()),
                0,
            )
            .unwrap_err();

        assert!(matches!(err, TaskError::InvalidTaskId(_)));
    }

    #[test]
    fn terminal_statuses_are_absorbing() {
        let (_store, handle) = store_with_task("a");

        let mut guard = handle.lock();
        guard.set_status(TaskStatus::Running).unwrap();
        guard.set_result(json!(7)).unwrap();

        assert!(guard.set_status(TaskStatus::Pending).is_err());
        assert!(guard.set_result(json!(8)).is_err());
        assert!(guard.set_error(TaskError::reason("nope")).is_err());
        assert_eq!(guard.status, TaskStatus::Success);
        assert_eq!(guard.result, Some(json!(7)));
    }

    #[test]
    fn result_iff_success_error_iff_failed() {
        let (store, handle) = store_with_task("a");

        {
            let mut guard = handle.lock();
            guard.set_error(TaskError::reason("broken")).unwrap();
        }

        let handle = store.handle(&TaskId("a".into())).unwrap();
        let record = handle.lock().snapshot();
        assert_eq!(record.status, TaskStatus::Failed);
        assert!(record.result.is_none());
        assert!(record.error.is_some());

        let guard = handle.lock();
        assert!(guard.expect_status_in(&[TaskStatus::Failed]).is_ok());
        assert!(matches!(
            guard.expect_status_in(&[TaskStatus::Success]),
            Err(TaskError::InvalidTaskStatus { .. })
        ));
    }

    #[test]
    fn cache_round_trips() {
        let (_store, handle) = store_with_task("a");

        let mut guard = handle.lock();
        assert!(!guard.cache_has("seed"));

        guard.cache_set("seed", CacheEntry::new(json!(42), "tests::seed_helper"));

        assert!(guard.cache_has("seed"));
        assert_eq!(guard.cache_get("seed").unwrap().value, json!(42));
        assert_eq!(guard.cache_get("seed").unwrap().origin(), "tests::seed_helper");
    }

    #[test]
    fn try_lock_reports_contention() {
        let (_store, handle) = store_with_task("a");

        let _held = handle.lock();
        let err = handle.try_lock().unwrap_err();

        assert!(matches!(err, TaskError::LockedTask(_)));
    }

    #[test]
    fn wait_terminal_returns_once_done() {
        let (_store, handle) = store_with_task("a");

        let waiter = handle.clone();
        let joiner = std::thread::spawn(move || waiter.wait_terminal());

        std::thread::sleep(std::time::Duration::from_millis(20));
        handle.lock().set_result(json!(3)).unwrap();

        let record = joiner.join().unwrap();
        assert_eq!(record.result, Some(json!(3)));
    }
}
