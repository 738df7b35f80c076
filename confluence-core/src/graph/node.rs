//! Graph Nodes
//!
//! This module defines the pending units of work that live in a graph and the
//! names they are keyed by.

use std::fmt;

use indexmap::IndexMap;
use serde_json::Value;
use smallvec::SmallVec;

use super::producer::Producer;
use crate::error::FlowError;

/// Reserved name carrying failures. Resolving it cancels the graph.
pub const ERROR: &str = "error";

/// Prefix of generated anonymous names.
pub const FORK_PREFIX: &str = "fork:";

/// Generated name of an anonymous node, returned by `fork`.
///
/// Handles are unique within the graph that issued them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ForkHandle(String);

impl ForkHandle {
    pub(crate) fn new(counter: u64) -> Self {
        Self(format!("{FORK_PREFIX}{counter}"))
    }

    /// The generated name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ForkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ForkHandle {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<ForkHandle> for String {
    fn from(handle: ForkHandle) -> Self {
        handle.0
    }
}

impl From<&ForkHandle> for String {
    fn from(handle: &ForkHandle) -> Self {
        handle.0.clone()
    }
}

/// A dependency passed to `fork`.
///
/// Names are waited on as they are. Anything else is first wrapped in its own
/// anonymous node, so `fork` accepts raw values and producers as inputs.
pub enum Dep {
    /// An existing name: a fork handle or a caller-chosen name.
    Name(String),

    /// A value or producer to wrap in an anonymous node.
    Produce(Producer),
}

impl Dep {
    /// Depend on a name.
    pub fn name(name: impl Into<String>) -> Self {
        Dep::Name(name.into())
    }

    /// Depend on a literal value.
    pub fn value(value: Value) -> Self {
        Dep::Produce(Producer::Literal(value))
    }
}

impl From<ForkHandle> for Dep {
    fn from(handle: ForkHandle) -> Self {
        Dep::Name(handle.0)
    }
}

impl From<&ForkHandle> for Dep {
    fn from(handle: &ForkHandle) -> Self {
        Dep::Name(handle.0.clone())
    }
}

impl From<Value> for Dep {
    fn from(value: Value) -> Self {
        Dep::value(value)
    }
}

impl From<Producer> for Dep {
    fn from(producer: Producer) -> Self {
        Dep::Produce(producer)
    }
}

impl fmt::Debug for Dep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dep::Name(name) => f.debug_tuple("Name").field(name).finish(),
            Dep::Produce(producer) => f.debug_tuple("Produce").field(producer).finish(),
        }
    }
}

/// What a requirement does once it is ready.
#[derive(Debug)]
pub(crate) enum Payload {
    /// Invoke or record a producer.
    Produce(Producer),

    /// Resolve the error channel with a typed error.
    Raise(FlowError),
}

/// A pending unit of work.
#[derive(Debug)]
pub(crate) struct Requirement {
    /// Names that must be resolved first. Order defines argument order.
    pub(crate) requires: SmallVec<[String; 4]>,

    /// Name the result is published under.
    pub(crate) provides: Option<String>,

    pub(crate) payload: Payload,
}

impl Requirement {
    pub(crate) fn new(
        requires: SmallVec<[String; 4]>,
        provides: Option<String>,
        payload: Payload,
    ) -> Self {
        Self { requires, provides, payload }
    }

    /// True if the requirement waits on exactly the error channel.
    ///
    /// Only such handlers stay eligible after the graph is canceled.
    pub(crate) fn is_error_handler(&self) -> bool {
        self.requires.len() == 1 && self.requires[0] == ERROR
    }

    /// True if any input is the error channel.
    pub(crate) fn consumes_error(&self) -> bool {
        self.requires.iter().any(|name| name == ERROR)
    }

    /// Collect the arguments if every input is resolved and the requirement
    /// is allowed to run.
    pub(crate) fn ready_args(
        &self,
        resolved: &IndexMap<String, Value>,
        canceled: bool,
    ) -> Option<Vec<Value>> {
        if canceled && !self.is_error_handler() {
            return None;
        }
        self.requires
            .iter()
            .map(|name| resolved.get(name).cloned())
            .collect()
    }
}
