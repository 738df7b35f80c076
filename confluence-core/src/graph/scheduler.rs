//! Ready Scheduler
//!
//! The scheduler decides which pending requirement runs next.
//!
//! # Algorithm
//!
//! The graph drains its pending list with a fixpoint iteration:
//!
//! 1. Scan the pending list from the front
//! 2. Take the first requirement whose inputs are all resolved
//! 3. Dispatch it, which may resolve names or append new requirements
//! 4. Restart the scan from the front
//! 5. Stop when a full scan finds nothing ready
//!
//! Worst case this is quadratic in the number of pending requirements, which
//! is fine for the small, short-lived graphs built per call.
//!
//! While the graph is canceled, only requirements waiting on exactly the error
//! channel are eligible. Everything else stays pending and is never removed.

use indexmap::IndexMap;
use serde_json::Value;

use super::node::Requirement;

/// Ordered list of requirements waiting for their inputs.
#[derive(Debug, Default)]
pub(crate) struct PendingList {
    requirements: Vec<Requirement>,
}

impl PendingList {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Append a requirement. It is picked up by the next scan.
    pub(crate) fn push(&mut self, requirement: Requirement) {
        self.requirements.push(requirement);
    }

    /// Remove and return the earliest-inserted ready requirement together with
    /// its arguments.
    pub(crate) fn take_ready(
        &mut self,
        resolved: &IndexMap<String, Value>,
        canceled: bool,
    ) -> Option<(Requirement, Vec<Value>)> {
        let (index, args) = self
            .requirements
            .iter()
            .enumerate()
            .find_map(|(index, req)| req.ready_args(resolved, canceled).map(|args| (index, args)))?;

        Some((self.requirements.remove(index), args))
    }

    /// Number of requirements still waiting.
    pub(crate) fn len(&self) -> usize {
        self.requirements.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }
}
