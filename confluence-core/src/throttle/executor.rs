//! Deferred execution for throttle hand-offs.
//!
//! A released token is reserved for the next waiter right away, but the
//! waiter's continuation is handed to an [`Executor`]. It runs only after the
//! throttle has finished its own bookkeeping, and continuations deferred by
//! other continuations are queued rather than nested.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

/// A unit of deferred work.
pub type Task = Box<dyn FnOnce()>;

/// Runs tasks on a later tick of the current thread.
pub trait Executor {
    /// Run `task` after the current call stack unwinds.
    fn defer(&self, task: Task);
}

thread_local! {
    static INLINE_QUEUE: RefCell<VecDeque<Task>> = RefCell::new(VecDeque::new());
    static INLINE_DRAINING: Cell<bool> = const { Cell::new(false) };
}

/// Clears the draining flag even if a task panics.
struct InlineDrain;

impl Drop for InlineDrain {
    fn drop(&mut self) {
        INLINE_DRAINING.with(|draining| draining.set(false));
    }
}

/// Runs deferred tasks on the current thread without a runtime.
///
/// Tasks go to a thread-local queue, which the outermost `defer` on the stack
/// drains. A task deferred while draining is appended and run by that same
/// loop, never nested inside the task that deferred it. This is the default
/// for [`ThrottleRegistry::new`].
///
/// [`ThrottleRegistry::new`]: super::ThrottleRegistry::new
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn defer(&self, task: Task) {
        INLINE_QUEUE.with(|queue| queue.borrow_mut().push_back(task));
        if INLINE_DRAINING.with(|draining| draining.replace(true)) {
            return;
        }
        let _guard = InlineDrain;

        while let Some(task) = INLINE_QUEUE.with(|queue| queue.borrow_mut().pop_front()) {
            task();
        }
    }
}

/// Defers onto the tokio `LocalSet` the caller is running in, so a hand-off
/// waits for the next turn of the local task queue.
///
/// Deferring outside of a `LocalSet` panics, as `tokio::task::spawn_local`
/// does. Only pass it to [`ThrottleRegistry::with_executor`] for graphs that
/// always run inside one.
///
/// [`ThrottleRegistry::with_executor`]: super::ThrottleRegistry::with_executor
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioExecutor;

impl Executor for TokioExecutor {
    fn defer(&self, task: Task) {
        tokio::task::spawn_local(async move { task() });
    }
}

/// Queues tasks until [`ManualExecutor::run_until_idle`] is called.
///
/// Clones share the queue. Useful in tests and when embedding graphs in a
/// loop that is not driven by tokio.
#[derive(Clone, Default)]
pub struct ManualExecutor {
    queue: Rc<RefCell<VecDeque<Task>>>,
}

impl ManualExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run queued tasks, including ones queued while running, until the queue
    /// is empty. Returns how many ran.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        loop {
            let next = self.queue.borrow_mut().pop_front();
            match next {
                Some(task) => {
                    task();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }

    /// Run at most one queued task. Returns whether one ran.
    pub fn tick(&self) -> bool {
        let next = self.queue.borrow_mut().pop_front();
        next.map(|task| task()).is_some()
    }

    /// Number of tasks waiting.
    pub fn queued(&self) -> usize {
        self.queue.borrow().len()
    }
}

impl Executor for ManualExecutor {
    fn defer(&self, task: Task) {
        self.queue.borrow_mut().push_back(task);
    }
}

impl fmt::Debug for ManualExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualExecutor")
            .field("queued", &self.queued())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_executor_defers_until_run() {
        let executor = ManualExecutor::new();
        let runs = Rc::new(Cell::new(0));

        let runs_clone = runs.clone();
        executor.defer(Box::new(move || runs_clone.set(runs_clone.get() + 1)));
        assert_eq!(runs.get(), 0);
        assert_eq!(executor.queued(), 1);

        assert_eq!(executor.run_until_idle(), 1);
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn tasks_queued_while_running_are_drained() {
        let executor = ManualExecutor::new();
        let runs = Rc::new(Cell::new(0));

        let inner = executor.clone();
        let runs_clone = runs.clone();
        executor.defer(Box::new(move || {
            let runs_inner = runs_clone.clone();
            inner.defer(Box::new(move || runs_inner.set(runs_inner.get() + 1)));
            runs_clone.set(runs_clone.get() + 1);
        }));

        assert!(executor.tick());
        assert_eq!(executor.queued(), 1);
        assert_eq!(executor.run_until_idle(), 1);
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn inline_executor_runs_nested_defers_after_the_current_task() {
        let order = Rc::new(RefCell::new(Vec::new()));

        let outer = order.clone();
        InlineExecutor.defer(Box::new(move || {
            let inner = outer.clone();
            InlineExecutor.defer(Box::new(move || inner.borrow_mut().push("inner")));
            outer.borrow_mut().push("outer");
        }));

        assert_eq!(*order.borrow(), vec!["outer", "inner"]);
        assert!(!INLINE_DRAINING.with(Cell::get));
    }

    #[tokio::test]
    async fn tokio_executor_runs_on_local_set() {
        let local = tokio::task::LocalSet::new();
        let ran = Rc::new(Cell::new(false));

        let ran_clone = ran.clone();
        local
            .run_until(async move {
                TokioExecutor.defer(Box::new(move || ran_clone.set(true)));
                tokio::task::yield_now().await;
            })
            .await;
        local.await;

        assert!(ran.get());
    }
}
