//! Copyright (c) 2023 University of New Hampshire
//! SPDX-License-Identifier: MIT

use redrive::prelude::*;
use tracing::debug;

use crate::INFO_STORE;

/// Look one key up in the fixture map.
#[derive(Serialize, Deserialize, Debug, Clone, Hash, PartialEq, Eq)]
pub struct FetchValue {
    pub key: String,
}

impl Runnable for FetchValue {
    type Output = i64;

    fn identifier() -> TaskIdentifier {
        TaskIdentifier::named("fetch_value").versioned(1)
    }

    fn run(&self, _context: &Context) -> TaskResult<Self::Output> {
        let value = INFO_STORE
            .get(self.key.as_str())
            .copied()
            .ok_or_else(|| TaskError::reason(format!("no value stored under key {:?}", self.key)))?;

        debug!("fetched {value} for key {}", self.key);
        Ok(value)
    }
}
