// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

//! A durable task orchestration runtime.
//!
//! User task types run as a tree of checkpointed units. Every task owns a
//! persisted record (identity, status, arguments, result, a local cache),
//! and a parent is re-entered whenever one of its children completes: the
//! body re-runs from the top, already-settled child calls short-circuit to
//! their recorded outcomes, and execution walks forward until the next
//! unfinished child suspends it again or it completes. Child identities are
//! deterministic digests of `(name, version, parent, arguments)`, which is
//! what makes the replay idempotent.
//!
//! ```ignore
//! let rt = redrive::init(4);
//! rt.register::<MyTask>()?;
//! let id = rt.submit(MyTask { step: 1 })?;
//! let out = rt.wait_for(&id)?;
//! ```
//!
//! The store is in-memory and the runtime is single-process; the store's
//! handle/guard surface is the seam where a persistent backend would slot
//! in.

pub mod context;
pub mod errors;
pub mod queue;
pub mod registry;
pub mod runtime;
pub mod store;
pub mod task_trait;
pub mod wrapper;

mod dispatcher;


use std::sync::Arc;

use crate::runtime::Runtime;

pub mod prelude {
    pub use crate::context::Context;
    pub use crate::errors::{Interrupt, TaskError, TaskResult};
    pub use crate::runtime::Runtime;
    pub use crate::store::{TaskId, TaskStatus};
    pub use crate::task_trait::{Runnable, TaskIdentifier};
    pub use crate::wrapper::run_in_parallel;

    pub use serde::{Deserialize, Serialize};
}

/// Construct a runtime and start its executor pool in one call.
pub fn init(worker_count: usize) -> Arc<Runtime> {
    let rt = Runtime::new();
    rt.start(worker_count);
    rt
}
