//! Copyright (c) 2023 University of New Hampshire
//! SPDX-License-Identifier: MIT

//! Demo workflows for the runtime: a tiny key/value fixture and the task
//! types the worker binary submits against it.

use std::collections::HashMap;

use lazy_static::lazy_static;
use maplit::hashmap;
use redrive::prelude::*;

pub mod fetch_value;
pub mod random_sums;

pub use fetch_value::FetchValue;
pub use random_sums::{AddTwoRandomValuesParallel, AddTwoRandomValuesSerial};

lazy_static! {
    /// The backing map the demo tasks fetch from.
    pub static ref INFO_STORE: HashMap<&'static str, i64> = hashmap! {
        "v1" => 1,
        "v2" => 2,
        "v3" => 3,
    };
}

/// Register every demo task type with a runtime.
pub fn register_all(rt: &Runtime) -> Result<(), TaskError> {
    rt.register::<FetchValue>()?;
    rt.register::<AddTwoRandomValuesSerial>()?;
    rt.register::<AddTwoRandomValuesParallel>()?;

    Ok(())
}
