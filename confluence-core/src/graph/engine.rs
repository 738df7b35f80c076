//! Graph Engine
//!
//! The engine owns the per-invocation state of a graph and runs the scheduler
//! whenever something is required or provided.
//!
//! # How It Works
//!
//! 1. `require_and_provide` appends a requirement to the pending list.
//!
//! 2. The scheduler loop repeatedly takes the first ready requirement and
//!    dispatches its producer.
//!
//! 3. Producers publish results under names, which makes further requirements
//!    ready. Asynchronous producers publish later through their [`Done`], and
//!    that re-enters the loop.
//!
//! # Re-entrancy
//!
//! Producers run with no borrow of the graph state held, so they are free to
//! call back into the graph. A call that arrives while the loop is already
//! draining only appends; the outer loop picks the new requirement up.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use indexmap::IndexMap;
use serde_json::Value;
use smallvec::SmallVec;
use tracing::{debug, error, trace, warn};

use super::node::{Dep, ForkHandle, Payload, Requirement, ERROR};
use super::producer::{Done, Producer};
use super::scheduler::PendingList;
use crate::completion::{Completion, Fire, Outcome};
use crate::config::ThrottleConfig;
use crate::error::{FlowError, Result};
use crate::throttle::{Permit, QueueKey, ThrottleRegistry, Throttled};

struct GraphState {
    /// Last generated anonymous name.
    counter: u64,

    pending: PendingList,

    /// Write-once mapping of resolved names.
    resolved: IndexMap<String, Value>,

    /// Typed copy of the value resolved under [`ERROR`].
    error: Option<FlowError>,

    canceled: bool,

    /// Whether the scheduler loop is currently on the stack.
    draining: bool,

    registry: ThrottleRegistry,

    /// Throttle tokens held by admitted forks, keyed by result name. Given
    /// back when the fork finishes or the graph stops.
    held: IndexMap<String, Permit>,
}

/// A dataflow graph.
///
/// Clones share state. Everything runs on the calling thread.
///
/// # Example
///
/// ```rust,ignore
/// let graph = Graph::new();
///
/// let five = graph.fork_value(json!(5));
/// let doubled = graph.fork([&five], Producer::sync(|args| json!(args[0].as_i64().unwrap() * 2)));
///
/// assert_eq!(graph.value(&doubled), Some(json!(10)));
/// ```
#[derive(Clone)]
pub struct Graph {
    state: Rc<RefCell<GraphState>>,
}

/// Non-owning handle to a [`Graph`].
///
/// Closures stored inside a graph hold this instead of a `Graph` so the graph
/// does not keep itself alive.
#[derive(Clone)]
pub struct WeakGraph {
    state: Weak<RefCell<GraphState>>,
}

impl WeakGraph {
    /// Get the graph back if it is still alive.
    pub fn upgrade(&self) -> Option<Graph> {
        self.state.upgrade().map(|state| Graph { state })
    }
}

/// Clears the draining flag even if a producer panics.
struct DrainGuard<'a> {
    graph: &'a Graph,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.graph.state.borrow_mut().draining = false;
    }
}

impl Graph {
    /// Create an empty graph with its own throttle registry.
    pub fn new() -> Self {
        Self::with_registry(ThrottleRegistry::new())
    }

    /// Create an empty graph whose named throttles come from `registry`.
    ///
    /// Graphs built from clones of one registry share named throttle queues.
    pub fn with_registry(registry: ThrottleRegistry) -> Self {
        Self {
            state: Rc::new(RefCell::new(GraphState {
                counter: 0,
                pending: PendingList::new(),
                resolved: IndexMap::new(),
                error: None,
                canceled: false,
                draining: false,
                registry,
                held: IndexMap::new(),
            })),
        }
    }

    /// Get a non-owning handle.
    pub fn downgrade(&self) -> WeakGraph {
        WeakGraph {
            state: Rc::downgrade(&self.state),
        }
    }

    // ------------------------------------------------------------------
    // Declaring work
    // ------------------------------------------------------------------

    /// Register a requirement and run everything that is ready.
    pub fn require_and_provide<I, N>(
        &self,
        requires: I,
        provides: Option<&str>,
        producer: impl Into<Producer>,
    ) -> &Self
    where
        I: IntoIterator<Item = N>,
        N: AsRef<str>,
    {
        let requires = requires.into_iter().map(|n| n.as_ref().to_owned()).collect();
        self.push(Requirement::new(
            requires,
            provides.map(str::to_owned),
            Payload::Produce(producer.into()),
        ));
        self.run_ready();
        self
    }

    /// Run `producer` once every name in `requires` is resolved, discarding
    /// its result.
    pub fn require<I, N>(&self, requires: I, producer: impl Into<Producer>) -> &Self
    where
        I: IntoIterator<Item = N>,
        N: AsRef<str>,
    {
        self.require_and_provide(requires, None, producer)
    }

    /// Publish `producer`'s result under `name`.
    pub fn provide(&self, name: impl Into<String>, producer: impl Into<Producer>) -> &Self {
        self.publish(Some(name.into()), producer.into());
        self
    }

    /// Resolve the error channel, canceling the graph.
    pub fn error(&self, error: impl Into<FlowError>) -> &Self {
        self.push(Requirement::new(
            SmallVec::new(),
            Some(ERROR.to_owned()),
            Payload::Raise(error.into()),
        ));
        self.run_ready();
        self
    }

    /// Run `producer` with the error once the error channel resolves.
    pub fn on_error(&self, producer: impl Into<Producer>) -> &Self {
        self.require([ERROR], producer)
    }

    /// Stop scheduling everything but error handlers, without raising an error.
    ///
    /// Work already handed to a producer is not interrupted, but throttle
    /// tokens held by this graph are given back.
    pub fn cancel(&self) -> &Self {
        debug!("graph canceled");
        let released = {
            let mut state = self.state.borrow_mut();
            state.canceled = true;
            std::mem::take(&mut state.held)
        };
        Self::give_back(released);
        self
    }

    /// Run `producer` once every dependency is resolved and publish the result
    /// under a fresh anonymous name.
    ///
    /// Dependencies that are not names are wrapped in their own anonymous
    /// nodes first.
    pub fn fork<I, D>(&self, deps: I, producer: impl Into<Producer>) -> ForkHandle
    where
        I: IntoIterator<Item = D>,
        D: Into<Dep>,
    {
        let handle = self.next_handle();
        let requires = self.intern(deps);
        self.push(Requirement::new(
            requires,
            Some(handle.as_str().to_owned()),
            Payload::Produce(producer.into()),
        ));
        self.run_ready();
        handle
    }

    /// Fork with no dependencies.
    pub fn fork_value(&self, producer: impl Into<Producer>) -> ForkHandle {
        self.fork(std::iter::empty::<Dep>(), producer)
    }

    /// Open a throttle gate over this graph.
    ///
    /// [`QueueKey::Shared`] queues live in the graph's registry and are shared
    /// with every graph using the same registry. [`QueueKey::Private`] gets
    /// state of its own.
    pub fn throttle(&self, max: usize, queue: impl Into<QueueKey>) -> Result<Throttled> {
        let registry = self.state.borrow().registry.clone();
        let throttle = match queue.into() {
            QueueKey::Shared(name) => registry.get_or_create(&name, max)?,
            QueueKey::Private => registry.private(max)?,
        };
        Ok(Throttled::new(self.clone(), throttle))
    }

    /// Open a throttle gate described by `config`.
    pub fn throttle_with(&self, config: &ThrottleConfig) -> Result<Throttled> {
        self.throttle(config.max, config.key())
    }

    /// A [`Fire`] target that feeds an outcome into this graph: success
    /// publishes the first result under `name`, failure raises the error.
    pub fn bridge(&self, name: impl Into<String>) -> GraphBridge {
        GraphBridge {
            graph: self.clone(),
            name: name.into(),
        }
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    /// The value resolved under `name`.
    pub fn value(&self, name: impl AsRef<str>) -> Option<Value> {
        self.state.borrow().resolved.get(name.as_ref()).cloned()
    }

    /// Whether `name` is resolved.
    pub fn is_resolved(&self, name: impl AsRef<str>) -> bool {
        self.state.borrow().resolved.contains_key(name.as_ref())
    }

    /// Resolved names in resolution order.
    pub fn resolved_names(&self) -> Vec<String> {
        self.state.borrow().resolved.keys().cloned().collect()
    }

    /// The error the graph failed with, if any.
    pub fn failure(&self) -> Option<FlowError> {
        self.state.borrow().error.clone()
    }

    pub fn is_canceled(&self) -> bool {
        self.state.borrow().canceled
    }

    /// Requirements still waiting, including those suppressed by cancellation.
    pub fn pending_count(&self) -> usize {
        self.state.borrow().pending.len()
    }

    /// The registry this graph opens named throttles from.
    pub fn registry(&self) -> ThrottleRegistry {
        self.state.borrow().registry.clone()
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    pub(crate) fn publish(&self, provides: Option<String>, producer: Producer) {
        self.push(Requirement::new(
            SmallVec::new(),
            provides,
            Payload::Produce(producer),
        ));
        self.run_ready();
    }

    /// Keep `permit` until [`Graph::release_permit`] is called for `key` or
    /// the graph stops. A stopped graph gives the permit straight back and
    /// returns false.
    pub(crate) fn hold_permit(&self, key: String, permit: Permit) -> bool {
        let mut state = self.state.borrow_mut();
        if state.canceled {
            drop(state);
            trace!(key = %key, "graph stopped; returning throttle token");
            drop(permit);
            return false;
        }
        state.held.insert(key, permit);
        true
    }

    pub(crate) fn release_permit(&self, key: &str) {
        let permit = self.state.borrow_mut().held.shift_remove(key);
        drop(permit);
    }

    /// Tokens still held by admitted forks.
    pub fn held_permits(&self) -> usize {
        self.state.borrow().held.len()
    }

    /// Drop permits with no borrow of the graph held; a release may admit a
    /// waiter of this same graph.
    fn give_back(permits: IndexMap<String, Permit>) {
        if !permits.is_empty() {
            debug!(count = permits.len(), "returning throttle tokens");
        }
        drop(permits);
    }

    /// Reserve a fresh anonymous name without registering anything under it.
    pub(crate) fn next_handle(&self) -> ForkHandle {
        let mut state = self.state.borrow_mut();
        state.counter += 1;
        ForkHandle::new(state.counter)
    }

    /// Turn dependencies into names, wrapping non-names in anonymous nodes.
    /// The wrappers are queued but the scheduler is not run.
    pub(crate) fn intern<I, D>(&self, deps: I) -> SmallVec<[String; 4]>
    where
        I: IntoIterator<Item = D>,
        D: Into<Dep>,
    {
        deps.into_iter()
            .map(|dep| match dep.into() {
                Dep::Name(name) => name,
                Dep::Produce(producer) => {
                    let handle = self.next_handle();
                    let name = String::from(handle);
                    self.push(Requirement::new(
                        SmallVec::new(),
                        Some(name.clone()),
                        Payload::Produce(producer),
                    ));
                    name
                }
            })
            .collect()
    }

    fn push(&self, requirement: Requirement) {
        self.state.borrow_mut().pending.push(requirement);
    }

    /// Drain the pending list until a full scan finds nothing ready.
    fn run_ready(&self) {
        {
            let mut state = self.state.borrow_mut();
            if state.draining {
                return;
            }
            state.draining = true;
        }
        let _guard = DrainGuard { graph: self };

        loop {
            let next = {
                let mut state = self.state.borrow_mut();
                let GraphState {
                    pending,
                    resolved,
                    canceled,
                    ..
                } = &mut *state;
                pending.take_ready(resolved, *canceled)
            };
            match next {
                Some((requirement, args)) => self.dispatch(requirement, args),
                None => break,
            }
        }
    }

    fn dispatch(&self, requirement: Requirement, args: Vec<Value>) {
        let consumes_error = requirement.consumes_error();
        let Requirement {
            requires,
            provides,
            payload,
        } = requirement;

        let producer = match payload {
            Payload::Raise(err) => return self.resolve_error(err),
            Payload::Produce(producer) => producer,
        };

        trace!(
            kind = producer.kind(),
            requires = ?requires.as_slice(),
            provides = provides.as_deref().unwrap_or("-"),
            "dispatching requirement"
        );

        match producer {
            Producer::Nested(target) => {
                if consumes_error {
                    let err = self.failure().unwrap_or(FlowError::Abandoned);
                    let results = requires
                        .iter()
                        .zip(args)
                        .filter(|(name, _)| name.as_str() != ERROR)
                        .map(|(_, value)| value)
                        .collect();
                    target.fire(Some(err), results);
                } else {
                    target.fire(None, args);
                }
            }
            Producer::Chained(start) => {
                let completion = start(args);
                self.follow(completion, provides);
            }
            Producer::Literal(value) => match provides {
                Some(name) if name == ERROR => self.resolve_error(FlowError::from_value(&value)),
                Some(name) => self.resolve(name, value),
                None => {}
            },
            Producer::Callback(start) => start(args, Done::new(self.clone(), provides)),
            Producer::Sync(step) => {
                let next = step(args);
                self.publish(provides, next);
            }
        }
    }

    /// Route a chained completion's outcome back into the graph.
    fn follow(&self, completion: Completion, provides: Option<String>) {
        if let Some(outcome) = completion.outcome() {
            self.settle(outcome, provides);
            return;
        }

        let graph = self.clone();
        completion.on_error(move |err| {
            graph.error(err.clone());
        });
        let graph = self.clone();
        completion.on(move |values| {
            graph.settle(Ok(values.to_vec()), provides);
        });
    }

    fn settle(&self, outcome: Outcome, provides: Option<String>) {
        match outcome {
            Ok(values) => {
                let first = values.into_iter().next().unwrap_or(Value::Null);
                self.publish(provides, Producer::Literal(first));
            }
            Err(err) => {
                self.error(err);
            }
        }
    }

    fn resolve(&self, name: String, value: Value) {
        let mut state = self.state.borrow_mut();
        if state.resolved.contains_key(&name) {
            drop(state);
            error!(name = %name, "name resolved twice");
            self.resolve_error(FlowError::AlreadyResolved(name));
            return;
        }
        state.resolved.insert(name, value);
    }

    fn resolve_error(&self, err: FlowError) {
        let mut state = self.state.borrow_mut();
        if let Some(first) = &state.error {
            warn!(error = %err, first = %first, "graph already failed; ignoring error");
            return;
        }
        debug!(error = %err, "graph failed; canceling");
        state
            .resolved
            .insert(ERROR.to_owned(), Value::String(err.to_string()));
        state.error = Some(err);
        state.canceled = true;
        let released = std::mem::take(&mut state.held);
        drop(state);
        Self::give_back(released);
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("Graph")
            .field("resolved", &state.resolved)
            .field("pending", &state.pending.len())
            .field("canceled", &state.canceled)
            .field("held", &state.held.len())
            .finish()
    }
}

/// Feeds a terminal outcome into a nested graph. See [`Graph::bridge`].
#[derive(Debug, Clone)]
pub struct GraphBridge {
    graph: Graph,
    name: String,
}

impl Fire for GraphBridge {
    fn fire(&self, error: Option<FlowError>, results: Vec<Value>) {
        match error {
            Some(err) => {
                self.graph.error(err);
            }
            None => {
                let first = results.into_iter().next().unwrap_or(Value::Null);
                self.graph.provide(self.name.clone(), first);
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
