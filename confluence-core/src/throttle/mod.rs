//! Throttling
//!
//! A throttle limits how many forked units of work run at once. Forks issued
//! through a [`Throttled`] gate wait for their inputs, then for a token, and
//! only then run their producer.
//!
//! # Queues
//!
//! A queue is either private to one gate or shared by name. Named queues live
//! in a [`ThrottleRegistry`], which is owned by whoever composes the graphs and
//! handed to each graph at construction. Every graph built from the same
//! registry competes for the same tokens.
//!
//! # Hand-off
//!
//! Waiters are admitted first come, first served. A released token is reserved
//! for the next waiter immediately, but the waiter's continuation is handed to
//! the registry's [`Executor`]: [`InlineExecutor`] by default,
//! [`TokioExecutor`] inside a `LocalSet`, or [`ManualExecutor`] in tests.
//!
//! # Tokens and failure
//!
//! An admitted fork's token is kept by its graph until the fork's result
//! arrives. A graph that fails or is canceled gives back every token it holds,
//! and one admitted after that is given back on arrival.

mod executor;
mod gate;
mod registry;

pub use executor::{Executor, InlineExecutor, ManualExecutor, Task, TokioExecutor};
pub use gate::Throttled;
pub use registry::{Permit, Throttle, ThrottleRegistry};

/// Identity of the state a throttle gate admits through.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueueKey {
    /// Fresh state owned by the gate.
    Private,

    /// A named queue from the graph's registry.
    Shared(String),
}

impl From<&str> for QueueKey {
    fn from(name: &str) -> Self {
        QueueKey::Shared(name.to_owned())
    }
}

impl From<String> for QueueKey {
    fn from(name: String) -> Self {
        QueueKey::Shared(name)
    }
}

impl From<Option<String>> for QueueKey {
    fn from(name: Option<String>) -> Self {
        name.map_or(QueueKey::Private, QueueKey::Shared)
    }
}
