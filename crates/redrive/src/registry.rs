//! Copyright (c) 2023 University of New Hampshire
//! SPDX-License-Identifier: MIT

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::debug;

use crate::errors::TaskError;
use crate::runtime::Runtime;
use crate::task_trait::TaskIdentifier;

/// The erased entry point for one registered task type: deserializes the
/// concrete type from the stored arguments and hands it to the wrapper.
pub(crate) type DispatchFn = fn(&Arc<Runtime>, Value) -> Result<(), TaskError>;

#[derive(Clone, Copy)]
pub(crate) struct DispatchEntry {
    pub(crate) run: DispatchFn,
}

/// `(name, version)` → wrapped function.
///
/// Registration happens once at startup; after that the map is effectively
/// read-only and lookups are uncontended.
pub struct Registry {
    tasks: RwLock<HashMap<TaskIdentifier, DispatchEntry>>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn insert(
        &self,
        ident: TaskIdentifier,
        entry: DispatchEntry,
    ) -> Result<(), TaskError> {
        let mut tasks = self.tasks.write();

        if tasks.contains_key(&ident) {
            return Err(TaskError::AlreadyRegistered(ident));
        }

        debug!("registered {ident}");
        tasks.insert(ident, entry);
        Ok(())
    }

    pub(crate) fn get(&self, ident: &TaskIdentifier) -> Option<DispatchEntry> {
        self.tasks.read().get(ident).copied()
    }

    pub fn contains(&self, ident: &TaskIdentifier) -> bool {
        self.tasks.read().contains_key(ident)
    }
}
