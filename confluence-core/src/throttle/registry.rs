//! Throttle state and the registry of named queues.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;
use tracing::debug;

use super::executor::{Executor, InlineExecutor};
use crate::config::RegistryConfig;
use crate::error::{FlowError, Result};

/// Continuation run when a waiter is admitted.
pub(crate) type Waiter = Box<dyn FnOnce(Permit)>;

struct ThrottleState {
    max: usize,

    /// Tokens currently held, including ones handed to a deferred waiter.
    count: usize,

    waiters: VecDeque<Waiter>,
}

/// Counting gate admitting at most `max` holders at once.
///
/// Waiters are admitted in FIFO order. A freed token is reserved for the head
/// waiter immediately and delivered on the executor's next tick.
pub struct Throttle {
    name: Option<String>,
    state: RefCell<ThrottleState>,
    executor: Rc<dyn Executor>,
}

impl Throttle {
    pub(crate) fn new(name: Option<String>, max: usize, executor: Rc<dyn Executor>) -> Result<Rc<Self>> {
        if max == 0 {
            return Err(FlowError::InvalidCapacity);
        }
        Ok(Rc::new(Self {
            name,
            state: RefCell::new(ThrottleState {
                max,
                count: 0,
                waiters: VecDeque::new(),
            }),
            executor,
        }))
    }

    /// Queue name, `None` for private throttles.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn max(&self) -> usize {
        self.state.borrow().max
    }

    /// Tokens currently held.
    pub fn in_flight(&self) -> usize {
        self.state.borrow().count
    }

    /// Waiters not yet admitted.
    pub fn queued(&self) -> usize {
        self.state.borrow().waiters.len()
    }

    /// Change the capacity. Raising it admits queued waiters right away.
    pub(crate) fn set_max(self: &Rc<Self>, max: usize) -> Result<()> {
        if max == 0 {
            return Err(FlowError::InvalidCapacity);
        }
        let previous = std::mem::replace(&mut self.state.borrow_mut().max, max);
        if previous != max {
            debug!(queue = self.name().unwrap_or("-"), previous, max, "throttle capacity changed");
        }
        self.admit_waiting();
        Ok(())
    }

    /// Run `grant` with a permit, now if a token is free, otherwise once one
    /// is released.
    pub(crate) fn acquire(self: &Rc<Self>, grant: Waiter) {
        let mut state = self.state.borrow_mut();
        if state.count < state.max {
            state.count += 1;
            drop(state);
            grant(Permit::new(Rc::clone(self)));
        } else {
            state.waiters.push_back(grant);
            debug!(
                queue = self.name().unwrap_or("-"),
                queued = state.waiters.len(),
                "throttle full; waiting for a token"
            );
        }
    }

    fn release(self: &Rc<Self>) {
        {
            let mut state = self.state.borrow_mut();
            state.count = state.count.saturating_sub(1);
        }
        self.admit_waiting();
    }

    fn admit_waiting(self: &Rc<Self>) {
        loop {
            let waiter = {
                let mut state = self.state.borrow_mut();
                if state.count >= state.max {
                    return;
                }
                let Some(waiter) = state.waiters.pop_front() else {
                    return;
                };
                state.count += 1;
                waiter
            };
            debug!(queue = self.name().unwrap_or("-"), "handing token to next waiter");
            let permit = Permit::new(Rc::clone(self));
            self.executor.defer(Box::new(move || waiter(permit)));
        }
    }
}

impl fmt::Debug for Throttle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("Throttle")
            .field("name", &self.name)
            .field("max", &state.max)
            .field("count", &state.count)
            .field("queued", &state.waiters.len())
            .finish()
    }
}

/// A held throttle token. Dropping it releases the token.
pub struct Permit {
    throttle: Rc<Throttle>,
}

impl Permit {
    fn new(throttle: Rc<Throttle>) -> Self {
        Self { throttle }
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.throttle.release();
    }
}

impl fmt::Debug for Permit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Permit")
            .field("queue", &self.throttle.name())
            .finish()
    }
}

struct RegistryInner {
    queues: RefCell<IndexMap<String, Rc<Throttle>>>,
    executor: Rc<dyn Executor>,
}

/// Registry of named throttle queues.
///
/// Clones share the registry. Graphs built from the same registry share every
/// named queue; the registry outlives any one graph.
#[derive(Clone)]
pub struct ThrottleRegistry {
    inner: Rc<RegistryInner>,
}

impl ThrottleRegistry {
    /// Create an empty registry that hands tokens over with an
    /// [`InlineExecutor`], which needs no runtime.
    pub fn new() -> Self {
        Self::with_executor(InlineExecutor)
    }

    /// Create an empty registry that hands tokens over on `executor`.
    pub fn with_executor(executor: impl Executor + 'static) -> Self {
        Self {
            inner: Rc::new(RegistryInner {
                queues: RefCell::new(IndexMap::new()),
                executor: Rc::new(executor),
            }),
        }
    }

    /// Create a registry with the queues in `config` pre-initialized.
    pub fn from_config(config: &RegistryConfig, executor: impl Executor + 'static) -> Result<Self> {
        let registry = Self::with_executor(executor);
        for (name, max) in &config.queues {
            registry.initialize(name, *max)?;
        }
        Ok(registry)
    }

    /// Get the named queue, creating it if needed.
    ///
    /// An existing queue takes on `max` as its new capacity.
    pub fn get_or_create(&self, name: &str, max: usize) -> Result<Rc<Throttle>> {
        if let Some(throttle) = self.get(name) {
            throttle.set_max(max)?;
            return Ok(throttle);
        }
        let throttle = Throttle::new(Some(name.to_owned()), max, Rc::clone(&self.inner.executor))?;
        self.inner
            .queues
            .borrow_mut()
            .insert(name.to_owned(), Rc::clone(&throttle));
        Ok(throttle)
    }

    /// Create the named queue unless it already exists.
    pub fn initialize(&self, name: &str, max: usize) -> Result<()> {
        if self.get(name).is_none() {
            self.get_or_create(name, max)?;
        }
        Ok(())
    }

    /// A throttle that is not registered under any name.
    pub fn private(&self, max: usize) -> Result<Rc<Throttle>> {
        Throttle::new(None, max, Rc::clone(&self.inner.executor))
    }

    /// Get an existing queue.
    pub fn get(&self, name: &str) -> Option<Rc<Throttle>> {
        self.inner.queues.borrow().get(name).cloned()
    }

    /// Number of named queues.
    pub fn len(&self) -> usize {
        self.inner.queues.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ThrottleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ThrottleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThrottleRegistry")
            .field("queues", &*self.inner.queues.borrow())
            .finish()
    }
}
