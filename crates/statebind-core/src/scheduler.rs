#![forbid(unsafe_code)]

//! Cooperative scheduling: microtasks, local futures, timers and a clock.
//!
//! Containers never reach for a global event loop. Everything that defers
//! work (derived recomputation, asynchronous initializers, resource debounce
//! and retention, throttled writes) receives a [`Scheduler`] handle at
//! construction and talks to it through the [`Executor`] trait.
//!
//! Two executors ship with the crate:
//!
//! - [`ManualExecutor`]: deterministic, driven explicitly by the caller with
//!   a virtual clock. Used in tests and by embedders with their own loop.
//! - `TokioExecutor` (feature `tokio`): runs on the current thread's
//!   `tokio::task::LocalSet`.
//!
//! # Invariants
//!
//! 1. Microtasks run in FIFO order, and all queued microtasks run before any
//!    timer fires.
//! 2. Timers fire in due-time order; timers with equal due time fire in
//!    registration order.
//! 3. A cleared timer never fires.
//!
//! # Failure Modes
//!
//! - Driving a [`ManualExecutor`] from inside one of its own futures
//!   panics on the `RefCell` guarding the pool.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

use ahash::AHashMap;
use futures::channel::oneshot;
use futures::executor::{LocalPool, LocalSpawner};
use futures::future::LocalBoxFuture;
use futures::task::LocalSpawnExt;
use futures::FutureExt;

/// Deferred unit of work.
pub type Task = Box<dyn FnOnce()>;

/// Handle returned by [`Executor::set_timeout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl TimerId {
    /// Wrap a raw id; for custom [`Executor`] implementations.
    #[must_use]
    pub const fn from_raw(id: u64) -> Self {
        Self(id)
    }

    /// Raw numeric id.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

/// Backend that actually runs deferred work.
pub trait Executor {
    /// Run `task` after the current synchronous work, before any timer.
    fn queue_microtask(&self, task: Task);

    /// Drive `future` to completion on this thread.
    fn spawn(&self, future: LocalBoxFuture<'static, ()>);

    /// Run `task` once `delay` has elapsed.
    fn set_timeout(&self, delay: Duration, task: Task) -> TimerId;

    /// Cancel a timer. Returns `false` if it already fired or was cleared.
    fn clear_timeout(&self, id: TimerId) -> bool;

    /// Monotonic time since the executor was created.
    fn now(&self) -> Duration;
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Shared, cloneable handle to an [`Executor`].
#[derive(Clone)]
pub struct Scheduler {
    executor: Rc<dyn Executor>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("now", &self.now())
            .finish()
    }
}

impl Scheduler {
    /// Wrap an executor.
    pub fn new(executor: impl Executor + 'static) -> Self {
        Self {
            executor: Rc::new(executor),
        }
    }

    /// Wrap an already shared executor.
    pub fn from_rc(executor: Rc<dyn Executor>) -> Self {
        Self { executor }
    }

    pub fn queue_microtask(&self, task: impl FnOnce() + 'static) {
        self.executor.queue_microtask(Box::new(task));
    }

    pub fn spawn(&self, future: impl Future<Output = ()> + 'static) {
        self.executor.spawn(future.boxed_local());
    }

    pub fn set_timeout(&self, delay: Duration, task: impl FnOnce() + 'static) -> TimerId {
        self.executor.set_timeout(delay, Box::new(task))
    }

    pub fn clear_timeout(&self, id: TimerId) -> bool {
        self.executor.clear_timeout(id)
    }

    #[must_use]
    pub fn now(&self) -> Duration {
        self.executor.now()
    }

    /// Future completing after `delay`.
    pub fn sleep(&self, delay: Duration) -> impl Future<Output = ()> + use<> {
        let (tx, rx) = oneshot::channel::<()>();
        self.set_timeout(delay, move || {
            let _ = tx.send(());
        });
        rx.map(|_| ())
    }
}

// ---------------------------------------------------------------------------
// ManualExecutor
// ---------------------------------------------------------------------------

struct ManualInner {
    microtasks: RefCell<VecDeque<Task>>,
    pool: RefCell<LocalPool>,
    spawner: LocalSpawner,
    clock: Cell<Duration>,
    timers: RefCell<BTreeMap<(Duration, u64), Task>>,
    due: RefCell<AHashMap<u64, Duration>>,
    next_timer: Cell<u64>,
}

/// Deterministic executor with a virtual clock.
///
/// Nothing runs until the owner calls [`run_until_stalled`] or
/// [`advance`]. Clones share the same queues.
///
/// [`run_until_stalled`]: ManualExecutor::run_until_stalled
/// [`advance`]: ManualExecutor::advance
#[derive(Clone)]
pub struct ManualExecutor {
    inner: Rc<ManualInner>,
}

impl Default for ManualExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ManualExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualExecutor")
            .field("now", &self.inner.clock.get())
            .field("microtasks", &self.inner.microtasks.borrow().len())
            .field("timers", &self.inner.timers.borrow().len())
            .finish()
    }
}

impl ManualExecutor {
    #[must_use]
    pub fn new() -> Self {
        let pool = LocalPool::new();
        let spawner = pool.spawner();
        Self {
            inner: Rc::new(ManualInner {
                microtasks: RefCell::new(VecDeque::new()),
                pool: RefCell::new(pool),
                spawner,
                clock: Cell::new(Duration::ZERO),
                timers: RefCell::new(BTreeMap::new()),
                due: RefCell::new(AHashMap::new()),
                next_timer: Cell::new(0),
            }),
        }
    }

    /// A [`Scheduler`] backed by this executor.
    #[must_use]
    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(self.clone())
    }

    /// Run queued microtasks (including ones queued meanwhile). Returns how many ran.
    pub fn run_microtasks(&self) -> usize {
        let mut ran = 0;
        loop {
            let next = self.inner.microtasks.borrow_mut().pop_front();
            let Some(task) = next else {
                return ran;
            };
            task();
            ran += 1;
        }
    }

    /// Run microtasks and poll spawned futures until neither makes progress.
    pub fn run_until_stalled(&self) {
        loop {
            self.run_microtasks();
            self.inner.pool.borrow_mut().run_until_stalled();
            if self.inner.microtasks.borrow().is_empty() {
                return;
            }
        }
    }

    /// Move the virtual clock forward by `by`, firing due timers in order.
    ///
    /// Pending work is flushed before each timer and once more at the end.
    pub fn advance(&self, by: Duration) {
        let target = self.inner.clock.get() + by;
        loop {
            self.run_until_stalled();
            let next = {
                let mut timers = self.inner.timers.borrow_mut();
                let first = timers.first_key_value().map(|(key, _)| *key);
                match first {
                    Some((due, id)) if due <= target => {
                        timers.remove(&(due, id)).map(|task| (due, id, task))
                    }
                    _ => None,
                }
            };
            let Some((due, id, task)) = next else {
                break;
            };
            self.inner.due.borrow_mut().remove(&id);
            self.inner.clock.set(due);
            task();
        }
        self.inner.clock.set(target);
        self.run_until_stalled();
    }

    /// Number of armed timers.
    #[must_use]
    pub fn pending_timers(&self) -> usize {
        self.inner.timers.borrow().len()
    }

    /// Number of queued microtasks.
    #[must_use]
    pub fn pending_microtasks(&self) -> usize {
        self.inner.microtasks.borrow().len()
    }
}

impl Executor for ManualExecutor {
    fn queue_microtask(&self, task: Task) {
        self.inner.microtasks.borrow_mut().push_back(task);
    }

    fn spawn(&self, future: LocalBoxFuture<'static, ()>) {
        if let Err(err) = self.inner.spawner.spawn_local(future) {
            tracing::error!(
                target: "statebind::scheduler",
                message = "failed to spawn local future",
                error = %err,
            );
        }
    }

    fn set_timeout(&self, delay: Duration, task: Task) -> TimerId {
        let id = self.inner.next_timer.get();
        self.inner.next_timer.set(id + 1);
        let due = self.inner.clock.get() + delay;
        self.inner.timers.borrow_mut().insert((due, id), task);
        self.inner.due.borrow_mut().insert(id, due);
        TimerId(id)
    }

    fn clear_timeout(&self, id: TimerId) -> bool {
        let Some(due) = self.inner.due.borrow_mut().remove(&id.0) else {
            return false;
        };
        self.inner.timers.borrow_mut().remove(&(due, id.0)).is_some()
    }

    fn now(&self) -> Duration {
        self.inner.clock.get()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
