//! Completion Implementation
//!
//! A Completion is a single-shot result: it starts pending, transitions once
//! to success or failure, and notifies the listeners and waiters registered up
//! to that point.
//!
//! # Single Firing
//!
//! 1. `on` / `on_error` register listeners while the completion is pending.
//!
//! 2. `fire` moves the state out of `Pending`, takes every listener and waiter
//!    out of the completion, and only then invokes them.
//!
//! 3. A second `fire` is ignored, and listeners attached afterwards are dropped
//!    without being called.
//!
//! Waiters created by [`Completion::wait`] are the exception to (3): they observe
//! the terminal state even when they are created after the transition.

use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::rc::Rc;

use indexmap::IndexMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use super::options::{flag_setter_name, OptionEntry, Options, Setter};
use crate::error::{FlowError, Result};

/// Terminal result delivered to waiters.
pub type Outcome = std::result::Result<Vec<Value>, FlowError>;

type DoneListener = Box<dyn FnOnce(&[Value])>;
type ErrorListener = Box<dyn FnOnce(&FlowError)>;

/// Something that can receive a terminal `(error, results)` pair.
///
/// Graphs dispatch to a `Fire` target as the last step of a chain: the success
/// path passes the resolved arguments, the error path passes the graph's error.
pub trait Fire {
    /// Deliver the terminal outcome.
    fn fire(&self, error: Option<FlowError>, results: Vec<Value>);
}

/// State of a completion.
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionState {
    /// Not fired yet.
    Pending,

    /// Fired without an error.
    Succeeded(Vec<Value>),

    /// Fired with an error.
    Failed(FlowError),
}

impl CompletionState {
    fn outcome(&self) -> Option<Outcome> {
        match self {
            CompletionState::Pending => None,
            CompletionState::Succeeded(values) => Some(Ok(values.clone())),
            CompletionState::Failed(err) => Some(Err(err.clone())),
        }
    }
}

struct Inner {
    state: CompletionState,
    done_listeners: Vec<DoneListener>,
    error_listeners: Vec<ErrorListener>,
    waiters: Vec<oneshot::Sender<Outcome>>,
    options: Options,
    setters: IndexMap<String, Setter>,
}

/// A single-firing success/failure result with option accumulation.
///
/// Clones share state.
///
/// # Example
///
/// ```rust,ignore
/// let done = Completion::new();
/// done.set("ttl", json!(30)).on(|values| println!("stored {values:?}"));
///
/// done.succeed(vec![json!("OK")]);
/// ```
#[derive(Clone)]
pub struct Completion {
    inner: Rc<RefCell<Inner>>,
}

impl Completion {
    /// Create a pending completion with empty option buckets.
    pub fn new() -> Self {
        Self::with_options(Options::default())
    }

    /// Create a pending completion whose `set` bucket starts with `defaults`.
    pub fn with_defaults(defaults: IndexMap<String, Value>) -> Self {
        Self::with_options(Options::with_defaults(defaults))
    }

    fn with_options(options: Options) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                state: CompletionState::Pending,
                done_listeners: Vec::new(),
                error_listeners: Vec::new(),
                waiters: Vec::new(),
                options,
                setters: IndexMap::new(),
            })),
        }
    }

    // ------------------------------------------------------------------
    // Options
    // ------------------------------------------------------------------

    /// Record `name = value` in the `set` bucket.
    pub fn set(&self, name: impl Into<String>, value: Value) -> &Self {
        self.inner.borrow_mut().options.set.insert(name.into(), value);
        self
    }

    /// Merge every pair into the `set` bucket.
    pub fn set_many<I, K>(&self, entries: I) -> &Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let mut inner = self.inner.borrow_mut();
        inner
            .options
            .set
            .extend(entries.into_iter().map(|(k, v)| (k.into(), v)));
        drop(inner);
        self
    }

    /// Record `name = value` in the `append` bucket.
    pub fn append(&self, name: impl Into<String>, value: Value) -> &Self {
        self.inner
            .borrow_mut()
            .options
            .append
            .insert(name.into(), value);
        self
    }

    /// Merge every pair into the `append` bucket.
    pub fn append_many<I, K>(&self, entries: I) -> &Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let mut inner = self.inner.borrow_mut();
        inner
            .options
            .append
            .extend(entries.into_iter().map(|(k, v)| (k.into(), v)));
        drop(inner);
        self
    }

    /// Mark `name` as unset.
    pub fn unset(&self, name: impl Into<String>) -> &Self {
        self.inner.borrow_mut().options.unset.insert(name.into());
        self
    }

    /// What each bucket currently holds for `name`.
    pub fn get_option(&self, name: &str) -> OptionEntry {
        self.inner.borrow().options.entry(name)
    }

    /// Snapshot of all buckets.
    pub fn options(&self) -> Options {
        self.inner.borrow().options.clone()
    }

    // ------------------------------------------------------------------
    // Setters
    // ------------------------------------------------------------------

    /// Install boolean setters for the `name` option.
    ///
    /// With neither `setter` nor `resetter` given, installs `set<Name>` and
    /// `reset<Name>`. Otherwise installs only the names given.
    pub fn add_flag(&self, name: &str, setter: Option<&str>, resetter: Option<&str>) -> &Self {
        let (setter, resetter) = match (setter, resetter) {
            (None, None) => (
                Some(flag_setter_name("set", name)),
                Some(flag_setter_name("reset", name)),
            ),
            (s, r) => (s.map(str::to_owned), r.map(str::to_owned)),
        };

        let mut inner = self.inner.borrow_mut();
        if let Some(setter) = setter {
            let flag = Setter::Flag { option: name.to_owned(), enable: true };
            inner.setters.insert(setter, flag);
        }
        if let Some(resetter) = resetter {
            let flag = Setter::Flag { option: name.to_owned(), enable: false };
            inner.setters.insert(resetter, flag);
        }
        drop(inner);
        self
    }

    /// Install default flag setters for every name.
    pub fn add_flags<S: AsRef<str>>(&self, names: &[S]) -> &Self {
        for name in names {
            self.add_flag(name.as_ref(), None, None);
        }
        self
    }

    /// Install setters that write their argument into `set` under their own name.
    pub fn add_explicit_setters<S: AsRef<str>>(&self, names: &[S]) -> &Self {
        let mut inner = self.inner.borrow_mut();
        for name in names {
            let name = name.as_ref().to_owned();
            inner
                .setters
                .insert(name.clone(), Setter::Explicit { option: name });
        }
        drop(inner);
        self
    }

    /// Invoke an installed setter by name.
    pub fn call(&self, setter: &str, arg: Option<Value>) -> Result<&Self> {
        let mut inner = self.inner.borrow_mut();
        let installed = inner
            .setters
            .get(setter)
            .cloned()
            .ok_or_else(|| FlowError::UnknownSetter(setter.to_owned()))?;
        installed.apply(&mut inner.options, arg);
        drop(inner);
        Ok(self)
    }

    /// Whether a setter is installed under `setter`.
    pub fn has_setter(&self, setter: &str) -> bool {
        self.inner.borrow().setters.contains_key(setter)
    }

    // ------------------------------------------------------------------
    // Firing
    // ------------------------------------------------------------------

    /// Register a success listener. Ignored once the completion has fired.
    pub fn on<F>(&self, listener: F) -> &Self
    where
        F: FnOnce(&[Value]) + 'static,
    {
        let mut inner = self.inner.borrow_mut();
        if inner.state == CompletionState::Pending {
            inner.done_listeners.push(Box::new(listener));
        } else {
            trace!("completion already fired; dropping success listener");
        }
        drop(inner);
        self
    }

    /// Register a failure listener. Ignored once the completion has fired.
    pub fn on_error<F>(&self, listener: F) -> &Self
    where
        F: FnOnce(&FlowError) + 'static,
    {
        let mut inner = self.inner.borrow_mut();
        if inner.state == CompletionState::Pending {
            inner.error_listeners.push(Box::new(listener));
        } else {
            trace!("completion already fired; dropping error listener");
        }
        drop(inner);
        self
    }

    /// Fire the completion.
    ///
    /// `Some(error)` fails it, `None` succeeds it with `results`. Only the
    /// first call has any effect.
    pub fn fire(&self, error: Option<FlowError>, results: Vec<Value>) {
        let outcome = match error {
            Some(err) => Err(err),
            None => Ok(results),
        };

        let (done_listeners, error_listeners, waiters) = {
            let mut inner = self.inner.borrow_mut();
            if inner.state != CompletionState::Pending {
                debug!("completion already fired; ignoring");
                return;
            }
            inner.state = match &outcome {
                Ok(values) => CompletionState::Succeeded(values.clone()),
                Err(err) => CompletionState::Failed(err.clone()),
            };
            (
                std::mem::take(&mut inner.done_listeners),
                std::mem::take(&mut inner.error_listeners),
                std::mem::take(&mut inner.waiters),
            )
        };

        match &outcome {
            Ok(values) => {
                for listener in done_listeners {
                    listener(values);
                }
            }
            Err(err) => {
                if error_listeners.is_empty() && waiters.is_empty() {
                    warn!(error = %err, "completion failed with nobody listening");
                }
                for listener in error_listeners {
                    listener(err);
                }
            }
        }

        for waiter in waiters {
            // The receiving future may have been dropped.
            let _ = waiter.send(outcome.clone());
        }
    }

    /// Fire successfully.
    pub fn succeed(&self, results: Vec<Value>) {
        self.fire(None, results);
    }

    /// Fire with an error.
    pub fn fail(&self, error: impl Into<FlowError>) {
        self.fire(Some(error.into()), Vec::new());
    }

    /// The terminal outcome, if fired.
    pub fn outcome(&self) -> Option<Outcome> {
        self.inner.borrow().state.outcome()
    }

    /// Current state.
    pub fn state(&self) -> CompletionState {
        self.inner.borrow().state.clone()
    }

    /// Whether the completion has fired.
    pub fn is_fired(&self) -> bool {
        self.inner.borrow().state != CompletionState::Pending
    }

    /// Wait for the terminal outcome.
    ///
    /// Resolves to [`FlowError::Abandoned`] if every handle is dropped first.
    pub fn wait(&self) -> impl Future<Output = Outcome> + 'static {
        let mut inner = self.inner.borrow_mut();
        let ready = inner.state.outcome();
        let receiver = if ready.is_none() {
            let (tx, rx) = oneshot::channel();
            inner.waiters.push(tx);
            Some(rx)
        } else {
            None
        };
        drop(inner);

        async move {
            match (ready, receiver) {
                (Some(outcome), _) => outcome,
                (None, Some(rx)) => rx.await.unwrap_or(Err(FlowError::Abandoned)),
                (None, None) => Err(FlowError::Abandoned),
            }
        }
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

impl Fire for Completion {
    fn fire(&self, error: Option<FlowError>, results: Vec<Value>) {
        Completion::fire(self, error, results);
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Completion")
            .field("state", &inner.state)
            .field("options", &inner.options)
            .field("listeners", &(inner.done_listeners.len() + inner.error_listeners.len()))
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::Cell;

    #[test]
    fn fires_success_once() {
        let completion = Completion::new();
        let calls = Rc::new(Cell::new(0));

        let calls_clone = calls.clone();
        completion.on(move |values| {
            assert_eq!(values, &[json!(1), json!(2)]);
            calls_clone.set(calls_clone.get() + 1);
        });

        completion.succeed(vec![json!(1), json!(2)]);
        completion.succeed(vec![json!(3)]);

        assert_eq!(calls.get(), 1);
        assert_eq!(completion.outcome(), Some(Ok(vec![json!(1), json!(2)])));
    }

    #[test]
    fn listener_attached_after_firing_never_runs() {
        let completion = Completion::new();
        completion.succeed(vec![]);

        let called = Rc::new(Cell::new(false));
        let called_clone = called.clone();
        completion.on(move |_| called_clone.set(true));

        assert!(!called.get());
    }

    #[test]
    fn failure_wraps_error_and_skips_success_listeners() {
        let completion = Completion::new();
        let seen = Rc::new(RefCell::new(None));
        let succeeded = Rc::new(Cell::new(false));

        let seen_clone = seen.clone();
        let succeeded_clone = succeeded.clone();
        completion
            .on(move |_| succeeded_clone.set(true))
            .on_error(move |err| *seen_clone.borrow_mut() = Some(err.clone()));

        completion.fire(Some(FlowError::wrap("boom")), vec![json!(1)]);

        assert!(!succeeded.get());
        assert_eq!(*seen.borrow(), Some(FlowError::Failed("boom".into())));
        assert_eq!(completion.state(), CompletionState::Failed(FlowError::Failed("boom".into())));
    }

    #[test]
    fn second_fire_does_not_change_state() {
        let completion = Completion::new();
        completion.fail("first");
        completion.succeed(vec![json!("late")]);
        assert_eq!(completion.outcome(), Some(Err(FlowError::Failed("first".into()))));
    }

    #[test]
    fn options_are_readable_before_firing() {
        let completion = Completion::with_defaults(IndexMap::from([("ttl".to_string(), json!(60))]));
        completion
            .set("ttl", json!(30))
            .append("tags", json!(["a"]))
            .unset("session");

        let ttl = completion.get_option("ttl");
        assert_eq!(ttl.set, Some(json!(30)));
        assert!(completion.get_option("session").unset);
        assert_eq!(completion.options().append["tags"], json!(["a"]));
        assert!(!completion.is_fired());
    }

    #[test]
    fn set_many_merges_and_last_write_wins() {
        let completion = Completion::new();
        completion.set("a", json!(1));
        completion.set_many([("a", json!(2)), ("b", json!(3))]);
        completion.append_many([("c", json!(4))]);

        let options = completion.options();
        assert_eq!(options.set["a"], json!(2));
        assert_eq!(options.set["b"], json!(3));
        assert_eq!(options.append["c"], json!(4));
    }

    #[test]
    fn default_flag_setters_are_installed() {
        let completion = Completion::new();
        completion.add_flags(&["verbose"]);

        assert!(completion.has_setter("setVerbose"));
        assert!(completion.has_setter("resetVerbose"));

        completion.call("setVerbose", None).unwrap();
        assert_eq!(completion.get_option("verbose").set, Some(json!(true)));

        completion.call("resetVerbose", None).unwrap();
        assert_eq!(completion.get_option("verbose").set, Some(json!(false)));
    }

    #[test]
    fn custom_flag_names_install_only_what_is_given() {
        let completion = Completion::new();
        completion.add_flag("cache", Some("useCache"), None);

        assert!(completion.has_setter("useCache"));
        assert!(!completion.has_setter("resetCache"));
        assert!(!completion.has_setter("setCache"));
    }

    #[test]
    fn explicit_setters_write_into_set_bucket() {
        let completion = Completion::new();
        completion.add_explicit_setters(&["limit", "offset"]);

        completion
            .call("limit", Some(json!(10)))
            .unwrap()
            .call("offset", Some(json!(20)))
            .unwrap();

        assert_eq!(completion.options().set["limit"], json!(10));
        assert_eq!(completion.options().set["offset"], json!(20));
    }

    #[test]
    fn unknown_setter_is_an_error() {
        let completion = Completion::new();
        let err = completion.call("nope", None).unwrap_err();
        assert_eq!(err, FlowError::UnknownSetter("nope".into()));
    }

    #[tokio::test]
    async fn wait_resolves_on_fire() {
        let completion = Completion::new();
        let pending = completion.wait();
        completion.succeed(vec![json!("ok")]);
        assert_eq!(pending.await, Ok(vec![json!("ok")]));
    }

    #[tokio::test]
    async fn wait_after_fire_sees_outcome() {
        let completion = Completion::new();
        completion.fail("gone");
        assert_eq!(completion.wait().await, Err(FlowError::Failed("gone".into())));
    }

    #[tokio::test]
    async fn dropping_unfired_completion_abandons_waiters() {
        let completion = Completion::new();
        let pending = completion.wait();
        drop(completion);
        assert_eq!(pending.await, Err(FlowError::Abandoned));
    }
}
