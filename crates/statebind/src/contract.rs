#![forbid(unsafe_code)]

//! The contract every container implements.
//!
//! Readers see [`StateRead`] (and [`StateSyncRead`] when the value is always
//! available); write-capable containers add [`StateWrite`] and, when writes
//! complete synchronously, [`StateWriteSync`]. Owners use the inherent
//! `set`/`set_ok`/`set_err` methods of the concrete type, or [`StateOwner`]
//! when generic code needs to commit a value.
//!
//! Concrete variants are told apart through [`StateKind`], never by type
//! tests.
//!
//! # Invariants
//!
//! 1. `subscribe(f, true)` delivers the current or eventual value to `f`
//!    exactly once through [`StateRead::then`], in addition to later updates.
//! 2. A [`Guaranteed`] container never stores an `Err`.
//! 3. A write rejected by a limiter leaves the stored value untouched.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use futures::channel::oneshot;
use futures::future::LocalBoxFuture;

use statebind_core::kernel::run_isolated;
use statebind_core::{Helper, ReadCallback, Related, StateError, StateResult, Subscriber, Subscribers};

// ---------------------------------------------------------------------------
// Kind discriminant
// ---------------------------------------------------------------------------

/// Implementation family of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    Sync,
    Lazy,
    Delayed,
    Resource,
    Collected,
    Array,
    Proxy,
}

/// Tagged description of a container, reported by [`StateRead::kind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StateKind {
    pub family: Family,
    /// `get()` is always available.
    pub sync: bool,
    /// The value is never `Err`.
    pub guaranteed: bool,
    /// Writes reach a setter or write action.
    pub writable: bool,
}

impl StateKind {
    #[must_use]
    pub const fn new(family: Family, sync: bool, guaranteed: bool, writable: bool) -> Self {
        Self {
            family,
            sync,
            guaranteed,
            writable,
        }
    }

    /// Whether the container emits [`ArrayDiff`](crate::array::ArrayDiff) values.
    #[must_use]
    pub const fn is_array(&self) -> bool {
        matches!(self.family, Family::Array)
    }
}

// ---------------------------------------------------------------------------
// Outcome markers
// ---------------------------------------------------------------------------

mod sealed {
    pub trait Sealed {}
    impl Sealed for super::Fallible {}
    impl Sealed for super::Guaranteed {}
}

/// Type-level marker for whether a container may hold `Err`.
pub trait Outcome: sealed::Sealed + 'static {
    const GUARANTEED: bool;
}

/// The container may hold `Err`; its owner gets `set` and `set_err`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Fallible;

/// The container always holds `Ok`; its owner only gets `set_ok`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Guaranteed;

impl Outcome for Fallible {
    const GUARANTEED: bool = false;
}

impl Outcome for Guaranteed {
    const GUARANTEED: bool = true;
}

/// Unwrap a value held by a [`Guaranteed`] container.
pub(crate) fn guaranteed_ok<T>(value: StateResult<T>) -> T {
    match value {
        Ok(value) => value,
        Err(err) => unreachable!("guaranteed container holds an error: {err}"),
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Read side shared by every container.
pub trait StateRead<T> {
    /// Which variant this is.
    fn kind(&self) -> StateKind;

    /// Call `callback` with the current value, or queue it until one exists.
    fn then(&self, callback: ReadCallback<T>);

    /// Register `subscriber`; with `run_immediately` it also receives the
    /// current or eventual value once. Returns the subscriber for later
    /// [`unsubscribe`](StateRead::unsubscribe).
    fn subscribe(&self, subscriber: Subscriber<T>, run_immediately: bool) -> Subscriber<T>;

    /// Deregister `subscriber`.
    fn unsubscribe(&self, subscriber: &Subscriber<T>);

    /// Whether at least one subscriber is registered.
    fn in_use(&self) -> bool;

    fn has_subscriber(&self, subscriber: &Subscriber<T>) -> bool;

    fn subscriber_count(&self) -> usize;

    /// Side-channel metadata, `None` without a helper.
    fn related(&self) -> Option<Related> {
        None
    }

    /// The value if it is available right now.
    fn try_get(&self) -> Option<StateResult<T>> {
        None
    }

    /// Future resolving with the current or eventual value.
    fn value(&self) -> ValueFuture<T>
    where
        T: Clone + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.then(Box::new(move |value: &StateResult<T>| {
            let _ = tx.send(value.clone());
        }));
        ValueFuture { rx }
    }
}

/// Containers whose value is always available.
pub trait StateSyncRead<T>: StateRead<T> {
    fn get(&self) -> StateResult<T>;
}

/// Write side of write-capable containers.
pub trait StateWrite<T, W>: StateRead<T> {
    /// Request a change; resolves once the write is committed or rejected.
    fn write(&self, value: W) -> LocalBoxFuture<'static, StateResult<()>>;

    /// Why `value` would be adjusted, if it would.
    fn check(&self, value: &W) -> Option<String>;

    /// `value` adjusted to the allowed domain, `None` if rejected.
    fn limit(&self, value: &W) -> Option<W>;
}

/// Write-capable containers that commit synchronously.
pub trait StateWriteSync<T, W>: StateWrite<T, W> {
    fn write_sync(&self, value: W) -> StateResult<()>;
}

/// Owner-side commit used by generic setters.
pub trait StateOwner<T> {
    fn set_ok(&self, value: T);
}

/// Type-erase a container handle for heterogeneous use.
pub fn dyn_read<T, S>(state: &S) -> Rc<dyn StateRead<T>>
where
    S: StateRead<T> + Clone + 'static,
{
    Rc::new(state.clone())
}

/// Type-erase a write-capable container handle.
pub fn dyn_write<T, W, S>(state: &S) -> Rc<dyn StateWrite<T, W>>
where
    S: StateWrite<T, W> + Clone + 'static,
{
    Rc::new(state.clone())
}

/// Shared `subscribe` body: insert, then deliver through `then` if asked.
pub(crate) fn subscribe_with<T: 'static>(
    subs: &Subscribers<T>,
    subscriber: Subscriber<T>,
    run_immediately: bool,
    on_first: impl FnOnce(),
    then: impl FnOnce(ReadCallback<T>),
) -> Subscriber<T> {
    if subs.insert(&subscriber, on_first) && run_immediately {
        let immediate = Rc::clone(&subscriber);
        then(Box::new(move |value: &StateResult<T>| {
            run_isolated("immediate delivery", || immediate(value));
        }));
    }
    subscriber
}

// ---------------------------------------------------------------------------
// ValueFuture
// ---------------------------------------------------------------------------

/// Future returned by [`StateRead::value`].
///
/// Resolves with `Err(DROP)` if the container drops the pending read.
#[must_use = "futures do nothing unless polled"]
pub struct ValueFuture<T> {
    rx: oneshot::Receiver<StateResult<T>>,
}

impl<T> fmt::Debug for ValueFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueFuture").finish_non_exhaustive()
    }
}

impl<T> Future for ValueFuture<T> {
    type Output = StateResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(value)) => Poll::Ready(value),
            Poll::Ready(Err(_canceled)) => Poll::Ready(Err(StateError::dropped())),
            Poll::Pending => Poll::Pending,
        }
    }
}

// ---------------------------------------------------------------------------
// Subscription guard
// ---------------------------------------------------------------------------

/// Subscribes on creation and unsubscribes on drop.
pub struct Subscription<T: 'static> {
    state: Rc<dyn StateRead<T>>,
    subscriber: Subscriber<T>,
}

impl<T: 'static> Subscription<T> {
    pub fn new(
        state: Rc<dyn StateRead<T>>,
        subscriber: Subscriber<T>,
        run_immediately: bool,
    ) -> Self {
        let subscriber = state.subscribe(subscriber, run_immediately);
        Self { state, subscriber }
    }

    /// The registered subscriber.
    #[must_use]
    pub fn subscriber(&self) -> &Subscriber<T> {
        &self.subscriber
    }
}

impl<T: 'static> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("kind", &self.state.kind())
            .finish()
    }
}

impl<T: 'static> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.state.unsubscribe(&self.subscriber);
    }
}

// ---------------------------------------------------------------------------
// Setter
// ---------------------------------------------------------------------------

type SetterFn<C, T, W> = dyn Fn(W, &C, &StateResult<T>) -> StateResult<()>;

/// How a write-capable container turns a written `W` into a stored `T`.
///
/// The function receives the written value, the container itself (to call
/// owner methods on) and the value before the write.
pub struct Setter<C, T, W> {
    apply: Rc<SetterFn<C, T, W>>,
}

impl<C, T, W> Clone for Setter<C, T, W> {
    fn clone(&self) -> Self {
        Self {
            apply: Rc::clone(&self.apply),
        }
    }
}

impl<C, T, W> fmt::Debug for Setter<C, T, W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Setter(..)")
    }
}

impl<C, T, W> Setter<C, T, W> {
    /// Setter running `apply` for every write.
    pub fn custom(apply: impl Fn(W, &C, &StateResult<T>) -> StateResult<()> + 'static) -> Self {
        Self {
            apply: Rc::new(apply),
        }
    }

    pub(crate) fn apply(&self, value: W, container: &C, old: &StateResult<T>) -> StateResult<()> {
        (self.apply)(value, container, old)
    }
}

impl<C, T, W> Setter<C, T, W>
where
    C: PassThrough<T, W> + 'static,
    T: 'static,
    W: 'static,
{
    /// Let the container commit written values itself.
    ///
    /// For scalar containers (`W = T`) writing the current `Ok` value is a
    /// silent success; other values pass through the limiter and are
    /// committed with `set_ok`. Array containers apply the written
    /// [`ArrayWrite`](crate::array::ArrayWrite).
    #[must_use]
    pub fn pass_through() -> Self {
        Self::custom(|value: W, container: &C, old: &StateResult<T>| {
            container.write_through(value, old)
        })
    }
}

/// Containers that know how to commit a written value without a custom setter.
pub trait PassThrough<T, W> {
    fn write_through(&self, value: W, old: &StateResult<T>) -> StateResult<()>;
}

/// Scalar pass-through: skip equal values, limit, then `set_ok`.
pub(crate) fn write_through_value<C, T>(container: &C, value: T, old: &StateResult<T>) -> StateResult<()>
where
    C: StateWrite<T, T> + StateOwner<T>,
    T: PartialEq,
{
    if let Ok(current) = old
        && *current == value
    {
        return Ok(());
    }
    let limited = container
        .limit(&value)
        .ok_or_else(|| StateError::limited("Value rejected by limiter"))?;
    container.set_ok(limited);
    Ok(())
}

// ---------------------------------------------------------------------------
// Helper slot
// ---------------------------------------------------------------------------

/// Optional [`Helper`] with the "no helper" defaults applied.
pub(crate) struct HelperSlot<W> {
    helper: Option<Rc<dyn Helper<W>>>,
}

impl<W> Default for HelperSlot<W> {
    fn default() -> Self {
        Self { helper: None }
    }
}

impl<W> Clone for HelperSlot<W> {
    fn clone(&self) -> Self {
        Self {
            helper: self.helper.clone(),
        }
    }
}

impl<W: Clone> HelperSlot<W> {
    pub(crate) fn new(helper: Option<Rc<dyn Helper<W>>>) -> Self {
        Self { helper }
    }

    pub(crate) fn is_set(&self) -> bool {
        self.helper.is_some()
    }

    pub(crate) fn limit(&self, value: &W) -> Option<W> {
        match &self.helper {
            Some(helper) => helper.limit(value),
            None => Some(value.clone()),
        }
    }

    pub(crate) fn check(&self, value: &W) -> Option<String> {
        self.helper.as_ref().and_then(|helper| helper.check(value))
    }

    pub(crate) fn related(&self) -> Option<Related> {
        self.helper.as_ref().and_then(|helper| helper.related())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use statebind_core::NumberHelper;

    #[test]
    fn kinds_compare_by_value() {
        let a = StateKind::new(Family::Array, true, false, false);
        assert!(a.is_array());
        assert_ne!(a, StateKind::new(Family::Sync, true, false, false));
    }

    #[test]
    fn outcome_markers_report_guarantee() {
        assert!(Guaranteed::GUARANTEED);
        assert!(!Fallible::GUARANTEED);
    }

    #[test]
    fn helper_slot_defaults_without_helper() {
        let slot = HelperSlot::<f64>::default();
        assert!(!slot.is_set());
        assert_eq!(slot.limit(&3.5), Some(3.5));
        assert_eq!(slot.check(&3.5), None);
        assert!(slot.related().is_none());
    }

    #[test]
    fn helper_slot_delegates() {
        let slot = HelperSlot::new(Some(Rc::new(NumberHelper::range(0.0, 1.0)) as Rc<dyn Helper<f64>>));
        assert_eq!(slot.limit(&3.5), Some(1.0));
        assert!(slot.check(&3.5).is_some());
        assert!(slot.related().is_some());
    }

    #[test]
    fn value_future_reports_dropped_reads() {
        let (tx, rx) = oneshot::channel::<StateResult<u8>>();
        drop(tx);
        let result = block_on(ValueFuture { rx });
        assert_eq!(result, Err(StateError::dropped()));
    }
}
