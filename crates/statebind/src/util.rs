#![forbid(unsafe_code)]

//! Small helpers over the container traits.

use std::cell::RefCell;
use std::pin::pin;
use std::rc::Rc;
use std::time::Duration;

use futures::channel::oneshot;
use futures::future::{self, Either};

use statebind_core::{Scheduler, StateResult, subscriber};

use crate::contract::{StateRead, StateSyncRead};

/// Timeout commonly used with [`await_value`].
pub const DEFAULT_AWAIT_TIMEOUT: Duration = Duration::from_millis(500);

/// Wait until `state` holds `Ok(value)`, or until `timeout` passes.
///
/// The current value counts. Returns whether the value was seen in time.
pub async fn await_value<T>(
    scheduler: &Scheduler,
    state: &dyn StateRead<T>,
    value: T,
    timeout: Duration,
) -> bool
where
    T: PartialEq + 'static,
{
    let (tx, rx) = oneshot::channel::<()>();
    let tx = Rc::new(RefCell::new(Some(tx)));
    let sub = state.subscribe(
        subscriber(move |current: &StateResult<T>| {
            if matches!(current, Ok(current) if *current == value)
                && let Some(tx) = tx.borrow_mut().take()
            {
                let _ = tx.send(());
            }
        }),
        true,
    );
    let sleep = pin!(scheduler.sleep(timeout));
    let reached = match future::select(rx, sleep).await {
        Either::Left((seen, _)) => seen.is_ok(),
        Either::Right(((), _)) => false,
    };
    state.unsubscribe(&sub);
    reached
}

/// Whether both containers hold equal `Ok` values.
pub async fn compare<T: PartialEq + Clone + 'static>(
    a: &dyn StateRead<T>,
    b: &dyn StateRead<T>,
) -> bool {
    let first = a.value().await;
    let second = b.value().await;
    matches!((first, second), (Ok(x), Ok(y)) if x == y)
}

/// Synchronous [`compare`].
pub fn compare_sync<T: PartialEq>(a: &dyn StateSyncRead<T>, b: &dyn StateSyncRead<T>) -> bool {
    matches!((a.get(), b.get()), (Ok(x), Ok(y)) if x == y)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::SyncState;
    use statebind_core::{ManualExecutor, StateError};

    #[test]
    fn compare_sync_requires_equal_ok_values() {
        let a = SyncState::new(Ok(1));
        let b = SyncState::new(Ok(1));
        assert!(compare_sync(&a, &b));
        b.set_ok(2);
        assert!(!compare_sync(&a, &b));
        b.set_err(StateError::new("TEST", "broken"));
        assert!(!compare_sync(&a, &b));
    }

    #[test]
    fn compare_reads_both_values() {
        let a = SyncState::new(Ok("x"));
        let b = SyncState::new(Ok("x"));
        assert!(futures::executor::block_on(compare(&a, &b)));
    }

    #[test]
    fn await_value_sees_later_update() {
        let exec = ManualExecutor::new();
        let state = SyncState::new(Ok(0));
        let outcome = Rc::new(RefCell::new(None));

        let sched = exec.scheduler();
        let watched = state.clone();
        let sink = Rc::clone(&outcome);
        exec.scheduler().spawn(async move {
            let seen = await_value(&sched, &watched, 3, DEFAULT_AWAIT_TIMEOUT).await;
            *sink.borrow_mut() = Some(seen);
        });
        exec.run_until_stalled();
        assert_eq!(state.subscriber_count(), 1);
        state.set_ok(3);
        exec.run_until_stalled();
        assert_eq!(*outcome.borrow(), Some(true));
        assert_eq!(state.subscriber_count(), 0);
    }

    #[test]
    fn await_value_times_out() {
        let exec = ManualExecutor::new();
        let state = SyncState::new(Ok(0));
        let outcome = Rc::new(RefCell::new(None));

        let sched = exec.scheduler();
        let watched = state.clone();
        let sink = Rc::clone(&outcome);
        exec.scheduler().spawn(async move {
            let seen = await_value(&sched, &watched, 3, Duration::from_millis(50)).await;
            *sink.borrow_mut() = Some(seen);
        });
        exec.advance(Duration::from_millis(50));
        assert_eq!(*outcome.borrow(), Some(false));
    }
}
