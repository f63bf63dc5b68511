//! Copyright (c) 2023 University of New Hampshire
//! SPDX-License-Identifier: MIT

use rand::Rng;
use redrive::prelude::*;
use tracing::debug;

use crate::FetchValue;

/// Fetch `v1`, derive the second key from what came back, fetch that, and
/// add the two. The second fetch can only be issued after the first lands,
/// so this exercises the serial re-entry path: one pass per child plus the
/// finishing pass.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AddTwoRandomValuesSerial;

impl Runnable for AddTwoRandomValuesSerial {
    type Output = i64;

    fn identifier() -> TaskIdentifier {
        TaskIdentifier::named("add_two_random_values_serial").versioned(1)
    }

    // no arguments, and a fresh run is wanted per submission
    fn task_id(&self, _parent: Option<&TaskId>) -> Result<TaskId, TaskError> {
        Ok(TaskId::random())
    }

    fn run(&self, context: &Context) -> TaskResult<Self::Output> {
        let first = context.call(FetchValue { key: "v1".into() })?;

        let second_key = format!("v{}", first + 1);
        debug!("first fetch gave {first}, following up with {second_key}");

        let second = context.call(FetchValue { key: second_key })?;

        Ok(first + second)
    }
}

/// Draw two random keys, fetch both in one parallel pass, and add the
/// results.
///
/// The draws are pinned in the task cache so every re-entry fetches the same
/// keys. Keys are drawn from `1..=4` against a map that only holds `v1` to
/// `v3`, so roughly half of the submissions exercise the child-failure path
/// end to end.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AddTwoRandomValuesParallel;

impl Runnable for AddTwoRandomValuesParallel {
    type Output = i64;

    fn identifier() -> TaskIdentifier {
        TaskIdentifier::named("add_two_random_values_parallel").versioned(1)
    }

    fn task_id(&self, _parent: Option<&TaskId>) -> Result<TaskId, TaskError> {
        Ok(TaskId::random())
    }

    fn run(&self, context: &Context) -> TaskResult<Self::Output> {
        let first = context.cached("first-key", || rand::thread_rng().gen_range(1..=4))?;
        let second = context.cached("second-key", || rand::thread_rng().gen_range(1..=4))?;

        let keys = [format!("v{first}"), format!("v{second}")];

        let values = run_in_parallel(
            keys.into_iter()
                .map(|key| move || context.call(FetchValue { key })),
        )?;

        Ok(values.into_iter().sum())
    }
}
