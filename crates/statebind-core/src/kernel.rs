#![forbid(unsafe_code)]

//! Subscription kernel: subscriber bookkeeping, fan-out dispatch and pending
//! reads.
//!
//! Every container embeds one [`Subscribers<T>`] and, when its value can
//! arrive later, one [`PendingReads<T>`]. The kernel knows nothing about
//! where values come from; it only decides who hears about them.
//!
//! # Invariants
//!
//! 1. A subscriber (compared by `Rc` pointer) is registered at most once.
//! 2. The "first subscriber" hook runs before the subscriber is inserted;
//!    the "last subscriber" hook runs after it is removed.
//! 3. Dispatch visits subscribers in registration order.
//! 4. A subscriber removed during a dispatch is not called for the rest of
//!    that dispatch; one added during a dispatch is not called until the next.
//! 5. A panicking subscriber never prevents later subscribers from running.
//!
//! # Failure Modes
//!
//! - Duplicate subscribe / unknown unsubscribe: logged at `warn`, no-op.
//! - Subscriber panic: caught with `catch_unwind`, logged at `error`.
//!   This requires `panic = "unwind"`; with `panic = "abort"` the process
//!   aborts instead.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use crate::error::StateResult;

/// A function notified with every value a container emits.
///
/// Identity is the `Rc` allocation: clone the handle to unsubscribe later.
pub type Subscriber<T> = Rc<dyn Fn(&StateResult<T>)>;

/// A one-shot callback waiting for a container's current or eventual value.
pub type ReadCallback<T> = Box<dyn FnOnce(&StateResult<T>)>;

/// Wrap a closure into a [`Subscriber`].
pub fn subscriber<T>(f: impl Fn(&StateResult<T>) + 'static) -> Subscriber<T> {
    Rc::new(f)
}

/// Extract a printable message from a panic payload.
fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Run `f`, logging instead of propagating a panic. Returns `false` if it panicked.
pub fn run_isolated(context: &'static str, f: impl FnOnce()) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => true,
        Err(payload) => {
            tracing::error!(
                target: "statebind::kernel",
                message = "subscriber panicked",
                context,
                panic = panic_message(payload.as_ref()),
            );
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Subscribers
// ---------------------------------------------------------------------------

/// Ordered, duplicate-free subscriber set with isolated fan-out.
pub struct Subscribers<T> {
    list: RefCell<Vec<Subscriber<T>>>,
}

impl<T> Default for Subscribers<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Subscribers<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscribers")
            .field("count", &self.len())
            .finish()
    }
}

impl<T> Subscribers<T> {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self {
            list: RefCell::new(Vec::new()),
        }
    }

    /// Number of registered subscribers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.list.borrow().len()
    }

    /// Whether nobody is subscribed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.list.borrow().is_empty()
    }

    /// Whether `subscriber` is registered.
    #[must_use]
    pub fn contains(&self, subscriber: &Subscriber<T>) -> bool {
        self.list
            .borrow()
            .iter()
            .any(|existing| Rc::ptr_eq(existing, subscriber))
    }

    /// Register `subscriber`.
    ///
    /// `on_first` runs before insertion when the set was empty. Returns
    /// `false` (and logs) if the subscriber was already registered.
    pub fn insert(&self, subscriber: &Subscriber<T>, on_first: impl FnOnce()) -> bool {
        if self.contains(subscriber) {
            tracing::warn!(
                target: "statebind::kernel",
                message = "function already registered as subscriber",
                count = self.len(),
            );
            return false;
        }
        if self.is_empty() {
            on_first();
        }
        self.list.borrow_mut().push(Rc::clone(subscriber));
        true
    }

    /// Deregister `subscriber`.
    ///
    /// `on_last` runs after removal when the set became empty. Returns
    /// `false` (and logs) if the subscriber was not registered.
    pub fn remove(&self, subscriber: &Subscriber<T>, on_last: impl FnOnce()) -> bool {
        let removed = {
            let mut list = self.list.borrow_mut();
            match list.iter().position(|existing| Rc::ptr_eq(existing, subscriber)) {
                Some(index) => {
                    list.remove(index);
                    true
                }
                None => false,
            }
        };
        if !removed {
            tracing::warn!(
                target: "statebind::kernel",
                message = "subscriber not found",
                count = self.len(),
            );
            return false;
        }
        if self.is_empty() {
            on_last();
        }
        true
    }

    /// Call every subscriber with `value`.
    ///
    /// Iterates a snapshot so subscribers may (un)subscribe re-entrantly.
    pub fn dispatch(&self, value: &StateResult<T>) {
        let snapshot: Vec<Subscriber<T>> = self.list.borrow().clone();
        for subscriber in &snapshot {
            if snapshot.len() > 1 && !self.contains(subscriber) {
                continue;
            }
            run_isolated("dispatch", || subscriber(value));
        }
    }
}

// ---------------------------------------------------------------------------
// PendingReads
// ---------------------------------------------------------------------------

/// Reads waiting for a value that has not arrived yet.
pub struct PendingReads<T> {
    queue: RefCell<Vec<ReadCallback<T>>>,
}

impl<T> Default for PendingReads<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for PendingReads<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingReads")
            .field("waiting", &self.len())
            .finish()
    }
}

impl<T> PendingReads<T> {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            queue: RefCell::new(Vec::new()),
        }
    }

    /// Queue a read.
    pub fn push(&self, callback: ReadCallback<T>) {
        self.queue.borrow_mut().push(callback);
    }

    /// Number of queued reads.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.borrow().len()
    }

    /// Whether no read is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.borrow().is_empty()
    }

    /// Resolve every queued read with `value`, in queue order.
    ///
    /// Reads queued while resolving stay queued for the next call.
    pub fn resolve(&self, value: &StateResult<T>) {
        let waiting = std::mem::take(&mut *self.queue.borrow_mut());
        for callback in waiting {
            run_isolated("pending read", || callback(value));
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StateError;
    use std::cell::Cell;

    fn recorder(log: &Rc<RefCell<Vec<String>>>, name: &'static str) -> Subscriber<i32> {
        let log = Rc::clone(log);
        subscriber(move |value: &StateResult<i32>| {
            log.borrow_mut().push(format!("{name}:{:?}", value.as_ref().ok()));
        })
    }

    #[test]
    fn insert_rejects_duplicates() {
        let subs = Subscribers::<i32>::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let a = recorder(&log, "a");
        assert!(subs.insert(&a, || {}));
        assert!(!subs.insert(&a, || {}));
        assert_eq!(subs.len(), 1);
        subs.dispatch(&Ok(1));
        assert_eq!(*log.borrow(), vec!["a:Some(1)"]);
    }

    #[test]
    fn hooks_fire_on_transitions_only() {
        let subs = Subscribers::<i32>::new();
        let first = Cell::new(0);
        let last = Cell::new(0);
        let log = Rc::new(RefCell::new(Vec::new()));
        let a = recorder(&log, "a");
        let b = recorder(&log, "b");

        subs.insert(&a, || first.set(first.get() + 1));
        subs.insert(&b, || first.set(first.get() + 1));
        assert_eq!(first.get(), 1);

        subs.remove(&a, || last.set(last.get() + 1));
        assert_eq!(last.get(), 0);
        subs.remove(&b, || last.set(last.get() + 1));
        assert_eq!(last.get(), 1);
        assert!(subs.is_empty());
    }

    #[test]
    fn first_hook_runs_before_insertion() {
        let subs = Rc::new(Subscribers::<i32>::new());
        let seen_len = Cell::new(usize::MAX);
        let a = subscriber(|_: &StateResult<i32>| {});
        subs.insert(&a, || seen_len.set(subs.len()));
        assert_eq!(seen_len.get(), 0);
    }

    #[test]
    fn remove_unknown_is_noop() {
        let subs = Subscribers::<i32>::new();
        let a = subscriber(|_: &StateResult<i32>| {});
        let fired = Cell::new(false);
        assert!(!subs.remove(&a, || fired.set(true)));
        assert!(!fired.get());
    }

    #[test]
    fn dispatch_isolates_panics() {
        let subs = Subscribers::<i32>::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let a = recorder(&log, "a");
        let b = subscriber(|_: &StateResult<i32>| panic!("broken listener"));
        let c = recorder(&log, "c");
        subs.insert(&a, || {});
        subs.insert(&b, || {});
        subs.insert(&c, || {});

        subs.dispatch(&Ok(7));
        assert_eq!(*log.borrow(), vec!["a:Some(7)", "c:Some(7)"]);
    }

    #[test]
    fn dispatch_order_is_registration_order() {
        let subs = Subscribers::<i32>::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        for name in ["x", "y", "z"] {
            subs.insert(&recorder(&log, name), || {});
        }
        subs.dispatch(&Err(StateError::new("TEST", "t")));
        assert_eq!(*log.borrow(), vec!["x:None", "y:None", "z:None"]);
    }

    #[test]
    fn subscriber_removed_mid_dispatch_is_skipped() {
        let subs = Rc::new(Subscribers::<i32>::new());
        let log = Rc::new(RefCell::new(Vec::new()));
        let late = recorder(&log, "late");
        let late_handle = Rc::clone(&late);
        let subs_handle = Rc::clone(&subs);
        let remover = subscriber(move |_: &StateResult<i32>| {
            subs_handle.remove(&late_handle, || {});
        });
        subs.insert(&remover, || {});
        subs.insert(&late, || {});

        subs.dispatch(&Ok(1));
        assert!(log.borrow().is_empty());
        assert_eq!(subs.len(), 1);
    }

    #[test]
    fn pending_reads_resolve_once_in_order() {
        let reads = PendingReads::<i32>::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        for tag in 0..3 {
            let log = Rc::clone(&log);
            reads.push(Box::new(move |v: &StateResult<i32>| {
                log.borrow_mut().push((tag, *v.as_ref().unwrap()));
            }));
        }
        assert_eq!(reads.len(), 3);
        reads.resolve(&Ok(9));
        reads.resolve(&Ok(10));
        assert_eq!(*log.borrow(), vec![(0, 9), (1, 9), (2, 9)]);
        assert!(reads.is_empty());
    }

    #[test]
    fn run_isolated_reports_panics() {
        assert!(run_isolated("test", || {}));
        assert!(!run_isolated("test", || panic!("boom")));
    }
}
