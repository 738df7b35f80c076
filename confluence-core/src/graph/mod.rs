//! Dependency Graph
//!
//! This module implements the dataflow graph: callers declare which names a
//! unit of work requires and which name it provides, and the graph runs the
//! work once its inputs are resolved.
//!
//! # Overview
//!
//! A graph holds:
//!
//! - a pending list of requirements, in insertion order
//! - a write-once mapping from resolved names to values
//! - a counter for generating anonymous `fork:<n>` names
//! - a cancellation flag
//!
//! `fork` is the composition primitive: it registers work under a fresh name
//! and returns that name, so the result can be required by further forks.
//!
//! # Failures
//!
//! The reserved `"error"` name carries failures. Resolving it cancels the
//! graph: from then on only requirements waiting on exactly `"error"` run.
//! This lets error handlers (typically a completion that reports back to a
//! caller) fire while all unrelated progress stops.
//!
//! # Design Decisions
//!
//! 1. Producers are a closed enum picked by the caller, not inferred from the
//!    shape of a value at dispatch time.
//!
//! 2. Everything is single-threaded. Asynchronous work reports back through a
//!    [`Done`] and re-enters the scheduler from its own completion.

mod engine;
mod node;
mod producer;
mod scheduler;

pub use engine::{Graph, GraphBridge, WeakGraph};
pub use node::{Dep, ForkHandle, ERROR, FORK_PREFIX};
pub use producer::{Done, Producer};
