//! Copyright (c) 2023 University of New Hampshire
//! SPDX-License-Identifier: MIT

use std::any::type_name;
use std::fmt;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::context::Context;
use crate::errors::{TaskError, TaskResult};
use crate::store::TaskId;
use crate::wrapper;

/// Values that can cross a task boundary: arguments and outputs both live in
/// the store as structural values and come back on every re-entry.
pub trait TaskSafe:
    fmt::Debug + Send + Sync + Clone + Serialize + DeserializeOwned + 'static
{
}

impl<T> TaskSafe for T where
    T: fmt::Debug + Send + Sync + Clone + Serialize + DeserializeOwned + 'static
{
}

/// A user task type: the struct fields are the invocation arguments, `run`
/// is the body.
///
/// Bodies must be written for replay: every pass starts from the top, nested
/// [`Context::call`]s short-circuit to their recorded outcomes, and local
/// nondeterminism (random draws, timestamps) goes through
/// [`Context::cached`] so it is pinned across passes. A body either returns
/// a value, fails, or suspends; suspension is produced by a nested call and
/// must be propagated with `?`, never swallowed.
pub trait Runnable:
    Send + Sync + Clone + fmt::Debug + Serialize + DeserializeOwned + 'static
{
    type Output: TaskSafe;

    fn run(&self, context: &Context) -> TaskResult<Self::Output>;

    fn identifier() -> TaskIdentifier {
        TaskIdentifier::of::<Self>()
    }

    /// How many times the runtime re-runs this task after a failure of its
    /// own body before recording it `Failed`. A failure surfaced from a
    /// child is never retried: replay is deterministic, so the child's
    /// outcome cannot change.
    fn retry_count() -> u32 {
        0
    }

    /// The identity of one invocation of this task.
    ///
    /// The default is a stable digest of `(name, version, parent id,
    /// canonical arguments)`, which is what makes re-entry idempotent:
    /// the same call from the same parent resolves to the same record.
    /// Override to [`TaskId::random`] for top-level tasks that should run
    /// fresh on every submission.
    fn task_id(&self, parent: Option<&TaskId>) -> Result<TaskId, TaskError> {
        let args = wrapper::canonical_args(self)?;
        Ok(wrapper::deterministic_task_id(
            &Self::identifier(),
            parent,
            &args,
        ))
    }

    /// Provided with the id of the wrapping task
    fn summarize(&self, id: &TaskId) -> String {
        format!("Task {} with ID {id}", type_name::<Self>())
    }
}

/// Names one registered function: `(name, version)`.
#[derive(PartialEq, Eq, Hash, Clone, Serialize, Deserialize, Debug)]
pub struct TaskIdentifier {
    name: String,
    version: u64,
}

impl TaskIdentifier {
    pub fn named(name: &'static str) -> Self {
        Self {
            name: name.into(),
            version: 1,
        }
    }

    pub fn versioned(self, version: u64) -> Self {
        Self { version, ..self }
    }

    /// Development default: the fully qualified type path at version 1.
    ///
    /// Type paths move with refactors and version 1 never changes on its
    /// own, so production task types should pin both with
    /// [`TaskIdentifier::named`] and [`TaskIdentifier::versioned`]. A
    /// renamed type otherwise silently becomes a *different* task with a
    /// fresh identity and none of its recorded history.
    pub fn of<T: ?Sized>() -> Self {
        Self {
            name: type_name::<T>().to_owned(),
            version: 1,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> u64 {
        self.version
    }
}

impl fmt::Display for TaskIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} v{}", self.name, self.version)
    }
}
