//! Confluence Core
//!
//! This crate provides a minimal dataflow-style task orchestrator. It
//! implements:
//!
//! - A dependency graph that runs producers once the names they require are
//!   resolved
//! - Single-shot completions with option accumulation, used to hand results
//!   back to callers
//! - Throttle gates limiting how many forked units of work run at once
//!
//! Everything runs cooperatively on one thread. Producers that do real
//! asynchronous work (timers, network I/O) report back through a callback,
//! which re-enters the scheduler.
//!
//! # Architecture
//!
//! - `graph`: requirements, producers and the scheduler loop
//! - `completion`: single-firing results and their option buckets
//! - `throttle`: token gates, the registry of named queues, deferred hand-off
//! - `config`: serde-loadable throttle settings
//!
//! # Example
//!
//! ```rust,ignore
//! use confluence_core::{Completion, Graph, Producer};
//! use serde_json::json;
//!
//! let result = Completion::new();
//! let graph = Graph::new();
//! graph.on_error(result.clone());
//!
//! let client = graph.fork_value(Producer::callback(|_, done| connect(done)));
//! let keys = graph.fork([&client], Producer::callback(|args, done| list_keys(&args[0], done)));
//! graph.require([&keys], result.clone());
//!
//! result.on(|values| println!("keys: {values:?}"));
//! ```

pub mod completion;
pub mod config;
pub mod error;
pub mod graph;
pub mod throttle;

pub use completion::{Completion, CompletionState, Fire, OptionEntry, Options, Outcome};
pub use config::{RegistryConfig, ThrottleConfig};
pub use error::{FlowError, Result};
pub use graph::{Dep, Done, ForkHandle, Graph, GraphBridge, Producer, WeakGraph, ERROR};
pub use throttle::{
    Executor, InlineExecutor, ManualExecutor, QueueKey, ThrottleRegistry, Throttled, TokioExecutor,
};
