//! Producers
//!
//! A producer is whatever a requirement runs once its inputs are resolved. The
//! shape is chosen by the caller when the producer is built, never guessed at
//! dispatch time.

use std::fmt;
use std::rc::Rc;

use serde_json::Value;

use super::engine::Graph;
use crate::completion::{Completion, Fire};
use crate::error::FlowError;

type SyncFn = Box<dyn FnOnce(Vec<Value>) -> Producer>;
type CallbackFn = Box<dyn FnOnce(Vec<Value>, Done)>;
type ChainedFn = Box<dyn FnOnce(Vec<Value>) -> Completion>;

/// How a requirement produces its value.
pub enum Producer {
    /// A plain value, recorded as-is.
    Literal(Value),

    /// Called with the arguments. Whatever it returns is resolved again under
    /// the same name.
    Sync(SyncFn),

    /// Called with the arguments and a [`Done`] to report the result with,
    /// now or later.
    Callback(CallbackFn),

    /// Called with the arguments. The returned completion's failure goes to
    /// the error channel and its first success value to the provided name.
    Chained(ChainedFn),

    /// A terminal sink. Fired with the arguments on the success path, or with
    /// the graph's error when the requirement consumes the error channel.
    Nested(Rc<dyn Fire>),
}

impl Producer {
    /// Wrap a synchronous step.
    pub fn sync<F, R>(f: F) -> Self
    where
        F: FnOnce(Vec<Value>) -> R + 'static,
        R: Into<Producer>,
    {
        Producer::Sync(Box::new(move |args| f(args).into()))
    }

    /// Wrap a callback-style step.
    pub fn callback<F>(f: F) -> Self
    where
        F: FnOnce(Vec<Value>, Done) + 'static,
    {
        Producer::Callback(Box::new(f))
    }

    /// Wrap a step that reports through a completion.
    pub fn chained<F>(f: F) -> Self
    where
        F: FnOnce(Vec<Value>) -> Completion + 'static,
    {
        Producer::Chained(Box::new(f))
    }

    /// Fire `target` when the requirement runs.
    pub fn fire_into(target: impl Fire + 'static) -> Self {
        Producer::Nested(Rc::new(target))
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Producer::Literal(_) => "literal",
            Producer::Sync(_) => "sync",
            Producer::Callback(_) => "callback",
            Producer::Chained(_) => "chained",
            Producer::Nested(_) => "nested",
        }
    }
}

impl From<Value> for Producer {
    fn from(value: Value) -> Self {
        Producer::Literal(value)
    }
}

impl From<()> for Producer {
    fn from(_: ()) -> Self {
        Producer::Literal(Value::Null)
    }
}

impl From<Completion> for Producer {
    fn from(completion: Completion) -> Self {
        Producer::Nested(Rc::new(completion))
    }
}

impl fmt::Debug for Producer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Producer::Literal(value) => f.debug_tuple("Literal").field(value).finish(),
            other => write!(f, "Producer::{}", other.kind()),
        }
    }
}

/// Single-use completion callback handed to [`Producer::Callback`].
///
/// Holding a `Done` keeps its graph alive, so it can be moved into a timer or
/// an I/O task and called when the work finishes.
pub struct Done {
    graph: Graph,
    provides: Option<String>,
}

impl Done {
    pub(crate) fn new(graph: Graph, provides: Option<String>) -> Self {
        Self { graph, provides }
    }

    /// Report the outcome.
    pub fn finish(self, result: Result<Value, FlowError>) {
        match result {
            Ok(value) => self.ok(value),
            Err(err) => self.err(err),
        }
    }

    /// Report success.
    pub fn ok(self, value: Value) {
        self.graph.publish(self.provides, Producer::Literal(value));
    }

    /// Report failure.
    pub fn err(self, error: impl Into<FlowError>) {
        self.graph.error(error);
    }

    /// Name the result will be published under.
    pub fn provides(&self) -> Option<&str> {
        self.provides.as_deref()
    }
}

impl fmt::Debug for Done {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Done").field("provides", &self.provides).finish()
    }
}
