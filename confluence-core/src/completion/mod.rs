//! Chainable Completions
//!
//! This module implements the single-shot result object that graphs use to
//! publish terminal results to their callers.
//!
//! # Concepts
//!
//! ## Completion
//!
//! A [`Completion`] is pending until it is fired exactly once, either with an
//! error or with a list of result values. Listeners registered with `on` and
//! `on_error` run on that transition and are then discarded.
//!
//! ## Options
//!
//! Before it fires, a completion collects options into `set`, `append` and
//! `unset` buckets. Producers read them to decide how to do their work (a
//! store write might read a `ttl`, a request might read a `session`).
//!
//! ## Setters
//!
//! Flags and explicit setters are installed under method-like names
//! (`setVerbose`, `limit`) and invoked with [`Completion::call`], so a
//! collaborator can advertise which knobs it understands.

mod options;
mod result;

pub use options::{OptionEntry, Options};
pub use result::{Completion, CompletionState, Fire, Outcome};
