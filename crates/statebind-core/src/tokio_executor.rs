#![forbid(unsafe_code)]

//! [`Executor`] backed by a tokio `LocalSet`.
//!
//! Every method calls `tokio::task::spawn_local`, so the executor must be
//! used from inside `LocalSet::run_until` (or a task spawned on a
//! `LocalSet`); anywhere else tokio panics.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use ahash::AHashMap;
use futures::future::LocalBoxFuture;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::scheduler::{Executor, Task, TimerId};

/// Executor running on the current thread's tokio `LocalSet`.
pub struct TokioExecutor {
    origin: Instant,
    next_timer: Cell<u64>,
    timers: Rc<RefCell<AHashMap<u64, AbortHandle>>>,
}

impl Default for TokioExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TokioExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokioExecutor")
            .field("timers", &self.timers.borrow().len())
            .finish()
    }
}

impl TokioExecutor {
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            next_timer: Cell::new(0),
            timers: Rc::new(RefCell::new(AHashMap::new())),
        }
    }
}

impl Executor for TokioExecutor {
    fn queue_microtask(&self, task: Task) {
        tokio::task::spawn_local(async move { task() });
    }

    fn spawn(&self, future: LocalBoxFuture<'static, ()>) {
        tokio::task::spawn_local(future);
    }

    fn set_timeout(&self, delay: Duration, task: Task) -> TimerId {
        let id = self.next_timer.get();
        self.next_timer.set(id + 1);
        let timers = Rc::clone(&self.timers);
        let handle = tokio::task::spawn_local(async move {
            tokio::time::sleep(delay).await;
            timers.borrow_mut().remove(&id);
            task();
        });
        self.timers.borrow_mut().insert(id, handle.abort_handle());
        TimerId::from_raw(id)
    }

    fn clear_timeout(&self, id: TimerId) -> bool {
        match self.timers.borrow_mut().remove(&id.get()) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    fn now(&self) -> Duration {
        Instant::now().duration_since(self.origin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;
    use tokio::task::LocalSet;

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn timers_and_microtasks_run_on_local_set() {
        LocalSet::new()
            .run_until(async {
                let sched = Scheduler::new(TokioExecutor::new());
                let order = Rc::new(RefCell::new(Vec::new()));

                let o = Rc::clone(&order);
                sched.set_timeout(Duration::from_millis(50), move || o.borrow_mut().push("timer"));
                let o = Rc::clone(&order);
                sched.queue_microtask(move || o.borrow_mut().push("micro"));

                tokio::time::sleep(Duration::from_millis(10)).await;
                assert_eq!(*order.borrow(), vec!["micro"]);
                tokio::time::sleep(Duration::from_millis(50)).await;
                assert_eq!(*order.borrow(), vec!["micro", "timer"]);
                assert!(sched.now() >= Duration::from_millis(60));
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn cleared_timer_is_aborted() {
        LocalSet::new()
            .run_until(async {
                let sched = Scheduler::new(TokioExecutor::new());
                let fired = Rc::new(Cell::new(false));
                let f = Rc::clone(&fired);
                let id = sched.set_timeout(Duration::from_millis(5), move || f.set(true));
                assert!(sched.clear_timeout(id));
                tokio::time::sleep(Duration::from_millis(20)).await;
                assert!(!fired.get());
                assert!(!sched.clear_timeout(id));
            })
            .await;
    }
}
