//! Throttled forks.

use std::ops::Deref;
use std::rc::Rc;

use serde_json::Value;

use super::registry::Throttle;
use crate::graph::{Dep, ForkHandle, Graph, Producer};

/// A graph whose `fork` waits for a throttle token.
///
/// Everything except `fork` and `fork_value` goes straight to the underlying
/// graph through `Deref`.
#[derive(Debug, Clone)]
pub struct Throttled {
    graph: Graph,
    throttle: Rc<Throttle>,
}

impl Throttled {
    pub(crate) fn new(graph: Graph, throttle: Rc<Throttle>) -> Self {
        Self { graph, throttle }
    }

    /// The throttle this gate admits through.
    pub fn throttle(&self) -> &Rc<Throttle> {
        &self.throttle
    }

    /// The underlying graph.
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Like [`Graph::fork`], but `producer` only runs while holding a token.
    ///
    /// Once the dependencies resolve, the fork queues for a token. When
    /// admitted it forks `producer` for real, and when that result arrives
    /// it releases the token and publishes the result under the returned
    /// name. The graph keeps the token meanwhile and gives it back if it
    /// fails, is canceled or is dropped first.
    pub fn fork<I, D>(&self, deps: I, producer: impl Into<Producer>) -> ForkHandle
    where
        I: IntoIterator<Item = D>,
        D: Into<Dep>,
    {
        let graph = &self.graph;
        let producer = producer.into();
        let result = graph.next_handle();
        let gate = graph.next_handle();
        let inputs = graph.intern(deps);

        // Queue for a token once the inputs are available.
        let throttle = Rc::clone(&self.throttle);
        let weak = graph.downgrade();
        let holder = String::from(&result);
        let gate_name = gate.clone();
        graph.require(&inputs, Producer::sync(move |_| {
            throttle.acquire(Box::new(move |granted| {
                let Some(graph) = weak.upgrade() else {
                    return;
                };
                if graph.hold_permit(holder, granted) {
                    graph.provide(gate_name, Value::Null);
                }
            }));
        }));

        // Admitted: run the real work, then release and publish.
        let weak = graph.downgrade();
        let result_name = result.clone();
        graph.require([&gate], Producer::sync(move |_| {
            let Some(graph) = weak.upgrade() else {
                return;
            };
            let work = graph.fork(inputs.into_iter().map(Dep::Name), producer);
            let weak = graph.downgrade();
            graph.require([&work], Producer::sync(move |mut args: Vec<Value>| {
                if let Some(graph) = weak.upgrade() {
                    graph.release_permit(result_name.as_str());
                    graph.provide(result_name, args.pop().unwrap_or(Value::Null));
                }
            }));
        }));

        result
    }

    /// Throttled fork with no dependencies.
    pub fn fork_value(&self, producer: impl Into<Producer>) -> ForkHandle {
        self.fork(std::iter::empty::<Dep>(), producer)
    }
}

impl Deref for Throttled {
    type Target = Graph;

    fn deref(&self) -> &Graph {
        &self.graph
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Done;
    use std::cell::RefCell;
    use crate::throttle::{ManualExecutor, QueueKey, ThrottleRegistry};
    use serde_json::json;

    fn parked() -> (Rc<RefCell<Vec<Done>>>, impl Fn() -> Producer) {
        let parked: Rc<RefCell<Vec<Done>>> = Rc::default();
        let parked_clone = parked.clone();
        let make = move || {
            let parked = parked_clone.clone();
            Producer::callback(move |_, done| parked.borrow_mut().push(done))
        };
        (parked, make)
    }

    fn graph() -> (Graph, ManualExecutor) {
        let executor = ManualExecutor::new();
        let graph = Graph::with_registry(ThrottleRegistry::with_executor(executor.clone()));
        (graph, executor)
    }

    #[test]
    fn second_fork_waits_for_first_to_finish() {
        let (graph, executor) = graph();
        let gate = graph.throttle(1, QueueKey::Private).unwrap();
        let (parked, work) = parked();

        let first = gate.fork_value(work());
        let second = gate.fork_value(work());

        assert_eq!(parked.borrow().len(), 1);
        assert_eq!(gate.throttle().queued(), 1);

        let done = parked.borrow_mut().remove(0);
        done.ok(json!("a"));
        assert_eq!(graph.value(&first), Some(json!("a")));
        // Handed off, but the second unit only starts on the next tick.
        assert!(parked.borrow().is_empty());

        executor.run_until_idle();
        assert_eq!(parked.borrow().len(), 1);

        let done = parked.borrow_mut().remove(0);
        done.ok(json!("b"));
        assert_eq!(graph.value(&second), Some(json!("b")));
        assert_eq!(gate.throttle().in_flight(), 0);
    }

    #[test]
    fn waits_for_dependencies_before_queueing() {
        let (graph, _executor) = graph();
        let gate = graph.throttle(1, QueueKey::Private).unwrap();

        let out = gate.fork(
            [Dep::name("input")],
            Producer::sync(|args: Vec<Value>| json!(args[0].as_i64().unwrap_or_default() + 1)),
        );
        assert_eq!(gate.throttle().in_flight(), 0);

        graph.provide("input", json!(41));
        assert_eq!(graph.value(&out), Some(json!(42)));
        assert_eq!(gate.throttle().in_flight(), 0);
    }

    #[test]
    fn failure_releases_held_tokens() {
        let (graph, _executor) = graph();
        let gate = graph.throttle(2, "shared").unwrap();
        let (parked, work) = parked();

        gate.fork_value(work());
        assert_eq!(gate.throttle().in_flight(), 1);

        parked.borrow_mut().remove(0).err("connection reset");

        assert!(graph.is_canceled());
        assert_eq!(gate.throttle().in_flight(), 0);
    }

    #[test]
    fn shared_queue_spans_graphs() {
        let executor = ManualExecutor::new();
        let registry = ThrottleRegistry::with_executor(executor.clone());
        let one = Graph::with_registry(registry.clone());
        let two = Graph::with_registry(registry.clone());
        let (parked, work) = parked();

        one.throttle(1, "api").unwrap().fork_value(work());
        let later = two.throttle(1, "api").unwrap().fork_value(work());

        assert_eq!(parked.borrow().len(), 1);
        parked.borrow_mut().remove(0).ok(json!(1));
        executor.run_until_idle();

        assert_eq!(parked.borrow().len(), 1);
        parked.borrow_mut().remove(0).ok(json!(2));
        assert_eq!(two.value(&later), Some(json!(2)));
    }

    #[test]
    fn dropped_graph_gives_its_token_back() {
        let executor = ManualExecutor::new();
        let registry = ThrottleRegistry::with_executor(executor.clone());
        let throttle = registry.get_or_create("q", 1).unwrap();

        {
            let graph = Graph::with_registry(registry.clone());
            graph.throttle(1, "q").unwrap().fork_value(Producer::callback(|_, _done| {}));
        }

        assert_eq!(throttle.in_flight(), 0);
    }

    #[test]
    fn failed_graph_hands_late_tokens_back() {
        let executor = ManualExecutor::new();
        let registry = ThrottleRegistry::with_executor(executor.clone());
        let failing = Graph::with_registry(registry.clone());
        let other = Graph::with_registry(registry.clone());
        let (parked, work) = parked();

        let gate = failing.throttle(1, "api").unwrap();
        gate.fork_value(work());
        gate.fork_value(work());
        assert_eq!(gate.throttle().queued(), 1);

        let done = parked.borrow_mut().remove(0);
        done.err("connection reset");
        // The queued fork is admitted into a graph that already failed.
        executor.run_until_idle();

        assert!(failing.is_canceled());
        assert!(parked.borrow().is_empty());
        assert_eq!(failing.held_permits(), 0);
        assert_eq!(gate.throttle().in_flight(), 0);

        let out = other.throttle(1, "api").unwrap().fork_value(json!("next"));
        assert_eq!(other.value(&out), Some(json!("next")));
    }

    #[test]
    fn finished_forks_leave_nothing_pending() {
        let (graph, executor) = graph();
        let gate = graph.throttle(4, QueueKey::Private).unwrap();

        let outputs: Vec<_> = (0..100).map(|i| gate.fork_value(json!(i))).collect();
        executor.run_until_idle();

        assert_eq!(graph.pending_count(), 0);
        assert_eq!(graph.held_permits(), 0);
        assert_eq!(graph.value(&outputs[99]), Some(json!(99)));
    }

    #[test]
    fn cancel_gives_tokens_back() {
        let (graph, _executor) = graph();
        let gate = graph.throttle(1, QueueKey::Private).unwrap();
        let (_parked, work) = parked();

        gate.fork_value(work());
        assert_eq!(graph.held_permits(), 1);

        graph.cancel();
        assert_eq!(graph.held_permits(), 0);
        assert_eq!(gate.throttle().in_flight(), 0);
    }

    #[test]
    fn default_graph_hands_off_without_a_runtime() {
        let graph = Graph::new();
        let gate = graph.throttle(1, QueueKey::Private).unwrap();
        let (parked, work) = parked();

        let first = gate.fork_value(work());
        let second = gate.fork_value(work());
        assert_eq!(parked.borrow().len(), 1);

        let done = parked.borrow_mut().remove(0);
        done.ok(json!("a"));
        assert_eq!(graph.value(&first), Some(json!("a")));
        assert_eq!(parked.borrow().len(), 1);

        let done = parked.borrow_mut().remove(0);
        done.ok(json!("b"));
        assert_eq!(graph.value(&second), Some(json!("b")));
        assert_eq!(gate.throttle().in_flight(), 0);
    }

    #[test]
    fn deref_exposes_the_graph() {
        let (graph, _executor) = graph();
        let gate = graph.throttle(1, QueueKey::Private).unwrap();
        gate.provide("x", json!(1));
        assert_eq!(graph.value("x"), Some(json!(1)));
    }
}
