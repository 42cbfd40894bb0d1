#![forbid(unsafe_code)]

//! Synchronous containers: the value is always available.
//!
//! [`SyncState`] is read-only for everyone but its owner; [`SyncStateWrite`]
//! also accepts writes through a [`Setter`]. Both come in a [`Fallible`]
//! and a [`Guaranteed`] flavor.
//!
//! # Invariants
//!
//! 1. Every owner `set*` call notifies, even if the value did not change.
//! 2. Notification happens synchronously inside the `set*` call.
//! 3. Without a setter, `write` fails with `NWRT` and stores nothing.
//!
//! # Example
//!
//! ```
//! use statebind::prelude::*;
//!
//! let state = SyncStateWrite::new(Ok(2)).with_setter(Setter::pass_through());
//! assert_eq!(state.write_sync(4), Ok(()));
//! assert_eq!(state.get(), Ok(4));
//! ```

use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;

use futures::future::{self, LocalBoxFuture};

use statebind_core::{Helper, ReadCallback, Related, StateError, StateResult, Subscriber, Subscribers};

use crate::contract::{
    Fallible, Family, Guaranteed, HelperSlot, Outcome, PassThrough, Setter, StateKind, StateOwner,
    StateRead, StateSyncRead, StateWrite, StateWriteSync, guaranteed_ok, subscribe_with,
    write_through_value,
};

// ---------------------------------------------------------------------------
// SyncState
// ---------------------------------------------------------------------------

struct SyncInner<T> {
    value: RefCell<StateResult<T>>,
    related: RefCell<Option<Related>>,
    subs: Subscribers<T>,
}

/// Read-only synchronous container.
pub struct SyncState<T, O = Fallible> {
    inner: Rc<SyncInner<T>>,
    _outcome: PhantomData<O>,
}

/// [`SyncState`] that never holds an error.
pub type SyncStateOk<T> = SyncState<T, Guaranteed>;

impl<T, O> Clone for SyncState<T, O> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
            _outcome: PhantomData,
        }
    }
}

impl<T: fmt::Debug, O: Outcome> fmt::Debug for SyncState<T, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncState")
            .field("value", &self.inner.value.borrow())
            .field("subscribers", &self.inner.subs.len())
            .field("guaranteed", &O::GUARANTEED)
            .finish()
    }
}

impl<T: Clone + 'static, O: Outcome> SyncState<T, O> {
    fn from_result(init: StateResult<T>) -> Self {
        Self {
            inner: Rc::new(SyncInner {
                value: RefCell::new(init),
                related: RefCell::new(None),
                subs: Subscribers::new(),
            }),
            _outcome: PhantomData,
        }
    }

    /// Attach metadata reported by `related()`.
    #[must_use]
    pub fn with_related(self, related: Related) -> Self {
        *self.inner.related.borrow_mut() = Some(related);
        self
    }

    /// Store `value` and notify subscribers.
    pub fn set_ok(&self, value: T) {
        self.store(Ok(value));
    }

    fn store(&self, value: StateResult<T>) {
        *self.inner.value.borrow_mut() = value.clone();
        self.inner.subs.dispatch(&value);
    }
}

impl<T: Clone + 'static> SyncState<T, Fallible> {
    #[must_use]
    pub fn new(init: StateResult<T>) -> Self {
        Self::from_result(init)
    }

    /// Replace the value and notify subscribers.
    pub fn set(&self, value: StateResult<T>) {
        self.store(value);
    }

    pub fn set_err(&self, err: StateError) {
        self.store(Err(err));
    }
}

impl<T: Clone + 'static> SyncState<T, Guaranteed> {
    #[must_use]
    pub fn new_ok(init: T) -> Self {
        Self::from_result(Ok(init))
    }

    #[must_use]
    pub fn get_ok(&self) -> T {
        guaranteed_ok(self.get())
    }
}

impl<T: Clone + 'static, O: Outcome> StateRead<T> for SyncState<T, O> {
    fn kind(&self) -> StateKind {
        StateKind::new(Family::Sync, true, O::GUARANTEED, false)
    }

    fn then(&self, callback: ReadCallback<T>) {
        callback(&self.get());
    }

    fn subscribe(&self, subscriber: Subscriber<T>, run_immediately: bool) -> Subscriber<T> {
        subscribe_with(&self.inner.subs, subscriber, run_immediately, || {}, |cb| {
            self.then(cb);
        })
    }

    fn unsubscribe(&self, subscriber: &Subscriber<T>) {
        self.inner.subs.remove(subscriber, || {});
    }

    fn in_use(&self) -> bool {
        !self.inner.subs.is_empty()
    }

    fn has_subscriber(&self, subscriber: &Subscriber<T>) -> bool {
        self.inner.subs.contains(subscriber)
    }

    fn subscriber_count(&self) -> usize {
        self.inner.subs.len()
    }

    fn related(&self) -> Option<Related> {
        self.inner.related.borrow().clone()
    }

    fn try_get(&self) -> Option<StateResult<T>> {
        Some(self.get())
    }
}

impl<T: Clone + 'static, O: Outcome> StateSyncRead<T> for SyncState<T, O> {
    fn get(&self) -> StateResult<T> {
        self.inner.value.borrow().clone()
    }
}

impl<T: Clone + 'static, O: Outcome> StateOwner<T> for SyncState<T, O> {
    fn set_ok(&self, value: T) {
        SyncState::set_ok(self, value);
    }
}

// ---------------------------------------------------------------------------
// SyncStateWrite
// ---------------------------------------------------------------------------

struct SyncWriteInner<T, W, O> {
    value: RefCell<StateResult<T>>,
    setter: RefCell<Option<Setter<SyncStateWrite<T, W, O>, T, W>>>,
    helper: RefCell<HelperSlot<W>>,
    subs: Subscribers<T>,
}

/// Write-capable synchronous container.
///
/// `W` is the type accepted by `write`; it equals `T` unless a custom
/// [`Setter`] converts between them.
pub struct SyncStateWrite<T, W = T, O = Fallible> {
    inner: Rc<SyncWriteInner<T, W, O>>,
}

/// [`SyncStateWrite`] that never holds an error.
pub type SyncStateWriteOk<T, W = T> = SyncStateWrite<T, W, Guaranteed>;

impl<T, W, O> Clone for SyncStateWrite<T, W, O> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: fmt::Debug, W, O: Outcome> fmt::Debug for SyncStateWrite<T, W, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncStateWrite")
            .field("value", &self.inner.value.borrow())
            .field("subscribers", &self.inner.subs.len())
            .field("writable", &self.inner.setter.borrow().is_some())
            .finish()
    }
}

impl<T, W, O> SyncStateWrite<T, W, O>
where
    T: Clone + 'static,
    W: Clone + 'static,
    O: Outcome,
{
    fn from_result(init: StateResult<T>) -> Self {
        Self {
            inner: Rc::new(SyncWriteInner {
                value: RefCell::new(init),
                setter: RefCell::new(None),
                helper: RefCell::new(HelperSlot::default()),
                subs: Subscribers::new(),
            }),
        }
    }

    #[must_use]
    pub fn with_setter(self, setter: Setter<Self, T, W>) -> Self {
        self.set_setter(Some(setter));
        self
    }

    #[must_use]
    pub fn with_helper(self, helper: impl Helper<W> + 'static) -> Self {
        *self.inner.helper.borrow_mut() = HelperSlot::new(Some(Rc::new(helper)));
        self
    }

    /// Replace (or remove) the setter at runtime.
    pub fn set_setter(&self, setter: Option<Setter<Self, T, W>>) {
        *self.inner.setter.borrow_mut() = setter;
    }

    pub fn set_ok(&self, value: T) {
        self.store(Ok(value));
    }

    fn store(&self, value: StateResult<T>) {
        *self.inner.value.borrow_mut() = value.clone();
        self.inner.subs.dispatch(&value);
    }
}

impl<T: Clone + 'static, W: Clone + 'static> SyncStateWrite<T, W, Fallible> {
    /// Container without setter; add one with [`with_setter`](Self::with_setter).
    #[must_use]
    pub fn new(init: StateResult<T>) -> Self {
        Self::from_result(init)
    }

    pub fn set(&self, value: StateResult<T>) {
        self.store(value);
    }

    pub fn set_err(&self, err: StateError) {
        self.store(Err(err));
    }
}

impl<T: Clone + 'static, W: Clone + 'static> SyncStateWrite<T, W, Guaranteed> {
    #[must_use]
    pub fn new_ok(init: T) -> Self {
        Self::from_result(Ok(init))
    }

    #[must_use]
    pub fn get_ok(&self) -> T {
        guaranteed_ok(self.get())
    }
}

impl<T, W, O> StateRead<T> for SyncStateWrite<T, W, O>
where
    T: Clone + 'static,
    W: Clone + 'static,
    O: Outcome,
{
    fn kind(&self) -> StateKind {
        StateKind::new(
            Family::Sync,
            true,
            O::GUARANTEED,
            self.inner.setter.borrow().is_some(),
        )
    }

    fn then(&self, callback: ReadCallback<T>) {
        callback(&self.get());
    }

    fn subscribe(&self, subscriber: Subscriber<T>, run_immediately: bool) -> Subscriber<T> {
        subscribe_with(&self.inner.subs, subscriber, run_immediately, || {}, |cb| {
            self.then(cb);
        })
    }

    fn unsubscribe(&self, subscriber: &Subscriber<T>) {
        self.inner.subs.remove(subscriber, || {});
    }

    fn in_use(&self) -> bool {
        !self.inner.subs.is_empty()
    }

    fn has_subscriber(&self, subscriber: &Subscriber<T>) -> bool {
        self.inner.subs.contains(subscriber)
    }

    fn subscriber_count(&self) -> usize {
        self.inner.subs.len()
    }

    fn related(&self) -> Option<Related> {
        self.inner.helper.borrow().related()
    }

    fn try_get(&self) -> Option<StateResult<T>> {
        Some(self.get())
    }
}

impl<T, W, O> StateSyncRead<T> for SyncStateWrite<T, W, O>
where
    T: Clone + 'static,
    W: Clone + 'static,
    O: Outcome,
{
    fn get(&self) -> StateResult<T> {
        self.inner.value.borrow().clone()
    }
}

impl<T, W, O> StateWrite<T, W> for SyncStateWrite<T, W, O>
where
    T: Clone + 'static,
    W: Clone + 'static,
    O: Outcome,
{
    fn write(&self, value: W) -> LocalBoxFuture<'static, StateResult<()>> {
        Box::pin(future::ready(self.write_sync(value)))
    }

    fn check(&self, value: &W) -> Option<String> {
        self.inner.helper.borrow().check(value)
    }

    fn limit(&self, value: &W) -> Option<W> {
        self.inner.helper.borrow().limit(value)
    }
}

impl<T, W, O> StateWriteSync<T, W> for SyncStateWrite<T, W, O>
where
    T: Clone + 'static,
    W: Clone + 'static,
    O: Outcome,
{
    fn write_sync(&self, value: W) -> StateResult<()> {
        let setter = self.inner.setter.borrow().clone();
        let Some(setter) = setter else {
            return Err(StateError::not_writable());
        };
        let old = self.get();
        setter.apply(value, self, &old)
    }
}

impl<T, W, O> StateOwner<T> for SyncStateWrite<T, W, O>
where
    T: Clone + 'static,
    W: Clone + 'static,
    O: Outcome,
{
    fn set_ok(&self, value: T) {
        SyncStateWrite::set_ok(self, value);
    }
}

impl<T, O> PassThrough<T, T> for SyncStateWrite<T, T, O>
where
    T: Clone + PartialEq + 'static,
    O: Outcome,
{
    fn write_through(&self, value: T, old: &StateResult<T>) -> StateResult<()> {
        write_through_value(self, value, old)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use statebind_core::{NumberHelper, subscriber};
    use std::cell::Cell;

    fn recorder<T: Clone + 'static>() -> (Subscriber<T>, Rc<RefCell<Vec<StateResult<T>>>>) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&log);
        (
            subscriber(move |v: &StateResult<T>| sink.borrow_mut().push(v.clone())),
            log,
        )
    }

    #[test]
    fn set_then_get_round_trips() {
        let state = SyncState::new(Ok(1));
        state.set(Ok(5));
        assert_eq!(state.get(), Ok(5));
        assert_eq!(block_on(state.value()), Ok(5));
    }

    #[test]
    fn every_set_notifies() {
        let state = SyncState::new(Ok(1));
        let (sub, log) = recorder();
        state.subscribe(sub, false);
        state.set_ok(1);
        state.set_ok(1);
        state.set_err(StateError::new("COMM", "offline"));
        assert_eq!(log.borrow().len(), 3);
        assert!(log.borrow()[2].is_err());
    }

    #[test]
    fn immediate_subscribe_delivers_current_value() {
        let state = SyncStateOk::new_ok("ready".to_string());
        let (sub, log) = recorder();
        state.subscribe(sub, true);
        assert_eq!(*log.borrow(), vec![Ok("ready".to_string())]);
        assert_eq!(state.get_ok(), "ready");
    }

    #[test]
    fn duplicate_subscribe_is_ignored() {
        let state = SyncState::new(Ok(0));
        let (sub, log) = recorder();
        state.subscribe(Rc::clone(&sub), false);
        state.subscribe(Rc::clone(&sub), true);
        assert_eq!(state.subscriber_count(), 1);
        assert!(log.borrow().is_empty());
        state.set_ok(3);
        assert_eq!(log.borrow().len(), 1);
        state.unsubscribe(&sub);
        assert!(!state.in_use());
        assert!(!state.has_subscriber(&sub));
    }

    #[test]
    fn kind_reports_flavor() {
        let ro = SyncState::new(Ok(1));
        assert_eq!(ro.kind(), StateKind::new(Family::Sync, true, false, false));
        let rw: SyncStateWriteOk<i32> = SyncStateWrite::new_ok(1).with_setter(Setter::pass_through());
        assert_eq!(rw.kind(), StateKind::new(Family::Sync, true, true, true));
    }

    #[test]
    fn write_without_setter_is_rejected() {
        let state: SyncStateWrite<i32> = SyncStateWrite::new(Ok(1));
        let err = state.write_sync(2).unwrap_err();
        assert!(err.is(statebind_core::error::CODE_NOT_WRITABLE));
        assert_eq!(state.get(), Ok(1));
        assert!(!state.kind().writable);
    }

    #[test]
    fn pass_through_skips_equal_values() {
        let state = SyncStateWrite::new(Ok(2)).with_setter(Setter::pass_through());
        let (sub, log) = recorder();
        state.subscribe(sub, false);
        assert_eq!(state.write_sync(2), Ok(()));
        assert!(log.borrow().is_empty());
        assert_eq!(block_on(state.write(4)), Ok(()));
        assert_eq!(*log.borrow(), vec![Ok(4)]);
    }

    #[test]
    fn pass_through_applies_limiter() {
        let state = SyncStateWrite::new(Ok(0.0))
            .with_setter(Setter::pass_through())
            .with_helper(NumberHelper::range(0.0, 10.0));
        assert_eq!(state.write_sync(25.0), Ok(()));
        assert_eq!(state.get(), Ok(10.0));
        assert!(state.check(&25.0).is_some());
        assert_eq!(state.limit(&-1.0), Some(0.0));
        assert!(matches!(state.related(), Some(Related::Number { .. })));
    }

    struct RejectOdd;

    impl Helper<i32> for RejectOdd {
        fn limit(&self, value: &i32) -> Option<i32> {
            (value % 2 == 0).then_some(*value)
        }

        fn check(&self, value: &i32) -> Option<String> {
            (value % 2 != 0).then(|| format!("{value} is odd"))
        }
    }

    #[test]
    fn rejected_write_keeps_previous_value() {
        let state = SyncStateWrite::new(Ok(2))
            .with_setter(Setter::pass_through())
            .with_helper(RejectOdd);
        let err = state.write_sync(3).unwrap_err();
        assert!(err.is(statebind_core::error::CODE_LIMITED));
        assert_eq!(state.get(), Ok(2));
    }

    #[test]
    fn custom_setter_converts_types() {
        let calls = Rc::new(Cell::new(0));
        let seen = Rc::clone(&calls);
        let state: SyncStateWrite<u32, String> = SyncStateWrite::new(Ok(0)).with_setter(
            Setter::custom(move |text: String, owner: &SyncStateWrite<u32, String>, old| {
                seen.set(seen.get() + 1);
                assert_eq!(*old, Ok(0));
                let parsed = text
                    .parse::<u32>()
                    .map_err(|err| StateError::new("PARS", err.to_string()))?;
                owner.set_ok(parsed);
                Ok(())
            }),
        );
        assert_eq!(state.write_sync("12".into()), Ok(()));
        assert_eq!(state.get(), Ok(12));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn setter_can_be_replaced_at_runtime() {
        let state = SyncStateWrite::new(Ok(1));
        assert!(state.write_sync(2).is_err());
        state.set_setter(Some(Setter::pass_through()));
        assert_eq!(state.write_sync(2), Ok(()));
        state.set_setter(None);
        assert!(state.write_sync(3).is_err());
        assert_eq!(state.get(), Ok(2));
    }

    #[test]
    fn write_scenario_survives_resubscribe() {
        let state = SyncStateWrite::new(Ok(2)).with_setter(Setter::pass_through());
        let (sub, log) = recorder();
        state.subscribe(Rc::clone(&sub), true);
        assert_eq!(*log.borrow(), vec![Ok(2)]);
        assert_eq!(block_on(state.write(4)), Ok(()));
        assert_eq!(state.get(), Ok(4));
        state.unsubscribe(&sub);

        let (again, log) = recorder();
        state.subscribe(again, true);
        assert_eq!(*log.borrow(), vec![Ok(4)]);
    }

    #[test]
    fn read_only_related_is_configurable() {
        let state = SyncState::new(Ok(1)).with_related(Related::Text {
            max_length: Some(4),
            max_bytes: None,
        });
        assert!(matches!(state.related(), Some(Related::Text { .. })));
    }
}
