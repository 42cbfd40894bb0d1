#![forbid(unsafe_code)]

//! Containers mirroring a remote resource.
//!
//! A resource container never produces values itself. Its owner supplies
//! three hooks and answers them through a [`ResourceOwner`]:
//!
//! - `fetch_once` runs when a reader needs a value and the buffer is stale;
//!   the owner answers with [`ResourceOwner::update_single`].
//! - `on_connect` runs when the container gains its first subscriber; the
//!   owner then pushes updates with [`ResourceOwner::update_resource`].
//! - `on_disconnect` runs after the last subscriber left; pushes stop.
//!
//! # Timing
//!
//! ```text
//! subscribe 0→1 ──debounce──▶ on_connect
//! unsubscribe 1→0 ──retention──▶ on_disconnect
//! update_* ──validity──▶ buffer stale
//! ```
//!
//! # Invariants
//!
//! 1. Connect and disconnect strictly alternate, starting with connect.
//! 2. Leaving before the debounce fires cancels the connect; no disconnect
//!    follows.
//! 3. Re-subscribing inside the retention window cancels the disconnect and
//!    does not reconnect.
//! 4. All reads queued while a fetch is in flight share that fetch.
//! 5. Every write issued inside one throttle window resolves with the result
//!    of the single write action run for that window.
//!
//! # Failure Modes
//!
//! - A `fetch_once` hook that never answers leaves reads pending; dropping
//!   the container resolves them with `Err(DROP)`.
//! - A connection torn down before its first push hands the reads waiting on
//!   it to `fetch_once`.
//! - Writes on a container without a write action fail with `NWRT`.

use std::cell::{Cell, RefCell};
use std::env;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::rc::{Rc, Weak};
use std::time::Duration;

use futures::FutureExt;
use futures::channel::oneshot;
use futures::future::{self, LocalBoxFuture};

use statebind_core::{
    Helper, PendingReads, ReadCallback, Related, Scheduler, StateError, StateResult, Subscriber,
    Subscribers, TimerId,
};

use crate::contract::{
    Fallible, Family, Guaranteed, HelperSlot, Outcome, StateKind, StateRead, StateWrite,
    subscribe_with,
};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Env var overriding [`ResourceTiming::debounce`], in milliseconds.
pub const ENV_DEBOUNCE_MS: &str = "STATEBIND_RESOURCE_DEBOUNCE_MS";
/// Env var overriding [`ResourceTiming::validity`], in milliseconds.
pub const ENV_VALIDITY_MS: &str = "STATEBIND_RESOURCE_VALIDITY_MS";
/// Env var overriding [`ResourceTiming::retention`], in milliseconds.
pub const ENV_RETENTION_MS: &str = "STATEBIND_RESOURCE_RETENTION_MS";

/// Delays applied by a resource container. All zero by default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceTiming {
    /// Delay before connecting and before each one-shot fetch.
    pub debounce: Duration,
    /// How long a buffered value answers reads without fetching.
    pub validity: Duration,
    /// Delay before disconnecting after the last subscriber left.
    pub retention: Duration,
}

impl ResourceTiming {
    #[must_use]
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    #[must_use]
    pub fn with_validity(mut self, validity: Duration) -> Self {
        self.validity = validity;
        self
    }

    #[must_use]
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Defaults overridden by the `STATEBIND_RESOURCE_*_MS` environment
    /// variables. Values that do not parse as milliseconds are ignored.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut timing = Self::default();
        if let Some(val) = lookup(ENV_DEBOUNCE_MS)
            && let Ok(ms) = val.trim().parse::<u64>()
        {
            timing.debounce = Duration::from_millis(ms);
        }
        if let Some(val) = lookup(ENV_VALIDITY_MS)
            && let Ok(ms) = val.trim().parse::<u64>()
        {
            timing.validity = Duration::from_millis(ms);
        }
        if let Some(val) = lookup(ENV_RETENTION_MS)
            && let Ok(ms) = val.trim().parse::<u64>()
        {
            timing.retention = Duration::from_millis(ms);
        }
        timing
    }
}

/// How [`ResourceStateWrite::write`] reaches the write action.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WriteMode {
    /// Every write runs the action.
    #[default]
    Immediate,
    /// Writes inside one `interval` collapse into one action with the last
    /// value.
    Throttled { interval: Duration },
}

// ---------------------------------------------------------------------------
// Core
// ---------------------------------------------------------------------------

type Hook<T, O> = Rc<dyn Fn(&ResourceOwner<T, O>)>;

struct Hooks<T, O> {
    fetch_once: Hook<T, O>,
    on_connect: Option<Hook<T, O>>,
    on_disconnect: Option<Hook<T, O>>,
}

struct ResourceCore<T, O> {
    scheduler: Scheduler,
    timing: Cell<ResourceTiming>,
    hooks: RefCell<Hooks<T, O>>,
    buffer: RefCell<Option<StateResult<T>>>,
    valid_until: Cell<Option<Duration>>,
    fetching: Cell<bool>,
    connected: Cell<bool>,
    connect_timer: Cell<Option<TimerId>>,
    retention_timer: Cell<Option<TimerId>>,
    reads: PendingReads<T>,
    subs: Subscribers<T>,
    _outcome: PhantomData<O>,
}

/// Owner handle passed to the resource hooks.
///
/// Cloning is cheap; a clone may be moved into the future that answers a
/// fetch.
pub struct ResourceOwner<T, O = Fallible> {
    core: Rc<ResourceCore<T, O>>,
}

impl<T, O> Clone for ResourceOwner<T, O> {
    fn clone(&self) -> Self {
        Self {
            core: Rc::clone(&self.core),
        }
    }
}

impl<T: fmt::Debug, O> fmt::Debug for ResourceOwner<T, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceOwner")
            .field("buffer", &self.core.buffer.borrow())
            .field("connected", &self.core.connected.get())
            .field("fetching", &self.core.fetching.get())
            .field("subscribers", &self.core.subs.len())
            .finish()
    }
}

impl<T: Clone + 'static, O: Outcome> ResourceOwner<T, O> {
    fn new(scheduler: Scheduler, fetch_once: Hook<T, O>) -> Self {
        Self {
            core: Rc::new(ResourceCore {
                scheduler,
                timing: Cell::new(ResourceTiming::default()),
                hooks: RefCell::new(Hooks {
                    fetch_once,
                    on_connect: None,
                    on_disconnect: None,
                }),
                buffer: RefCell::new(None),
                valid_until: Cell::new(None),
                fetching: Cell::new(false),
                connected: Cell::new(false),
                connect_timer: Cell::new(None),
                retention_timer: Cell::new(None),
                reads: PendingReads::new(),
                subs: Subscribers::new(),
                _outcome: PhantomData,
            }),
        }
    }

    fn weak(&self) -> Weak<ResourceCore<T, O>> {
        Rc::downgrade(&self.core)
    }

    fn upgrade(core: &Weak<ResourceCore<T, O>>) -> Option<Self> {
        core.upgrade().map(|core| Self { core })
    }

    /// Answer a `fetch_once` call.
    pub fn update_single_ok(&self, value: T) {
        self.commit(Ok(value), "single");
    }

    /// Push an update from the live connection.
    pub fn update_resource_ok(&self, value: T) {
        self.commit(Ok(value), "resource");
    }

    /// Last value received, kept across disconnects.
    #[must_use]
    pub fn buffer(&self) -> Option<StateResult<T>> {
        self.core.buffer.borrow().clone()
    }

    /// Whether `on_connect` ran without a matching `on_disconnect` yet.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.core.connected.get()
    }

    #[must_use]
    pub fn scheduler(&self) -> &Scheduler {
        &self.core.scheduler
    }

    /// Whether both handles belong to the same container.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.core, &other.core)
    }

    fn commit(&self, value: StateResult<T>, source: &'static str) {
        let core = &self.core;
        let validity = core.timing.get().validity;
        core.valid_until
            .set(Some(core.scheduler.now().saturating_add(validity)));
        core.fetching.set(false);
        *core.buffer.borrow_mut() = Some(value.clone());
        tracing::trace!(
            target: "statebind::resource",
            message = "resource updated",
            source,
            waiting = core.reads.len(),
        );
        core.reads.resolve(&value);
        core.subs.dispatch(&value);
    }

    fn fresh(&self) -> Option<StateResult<T>> {
        let valid_until = self.core.valid_until.get()?;
        if self.core.scheduler.now() > valid_until {
            return None;
        }
        self.core.buffer.borrow().clone()
    }

    fn then(&self, callback: ReadCallback<T>) {
        if let Some(value) = self.fresh() {
            callback(&value);
            return;
        }
        self.core.reads.push(callback);
        self.request();
    }

    /// Start a one-shot fetch unless a value is already on its way.
    fn request(&self) {
        if self.core.fetching.get() {
            return;
        }
        self.core.fetching.set(true);
        let debounce = self.core.timing.get().debounce;
        if debounce.is_zero() {
            self.fetch();
        } else {
            let weak = self.weak();
            self.core.scheduler.set_timeout(debounce, move || {
                if let Some(owner) = Self::upgrade(&weak) {
                    owner.fetch();
                }
            });
        }
    }

    fn fetch(&self) {
        tracing::debug!(target: "statebind::resource", message = "fetching resource once");
        let hook = Rc::clone(&self.core.hooks.borrow().fetch_once);
        hook(self);
    }

    fn on_first(&self) {
        if let Some(timer) = self.core.retention_timer.take() {
            self.core.scheduler.clear_timeout(timer);
            tracing::debug!(
                target: "statebind::resource",
                message = "resubscribed inside retention, keeping connection",
            );
            return;
        }
        // The connection is expected to deliver the first value.
        self.core.fetching.set(true);
        let debounce = self.core.timing.get().debounce;
        if debounce.is_zero() {
            self.connect();
        } else {
            let weak = self.weak();
            let timer = self.core.scheduler.set_timeout(debounce, move || {
                if let Some(owner) = Self::upgrade(&weak) {
                    owner.core.connect_timer.set(None);
                    owner.connect();
                }
            });
            self.core.connect_timer.set(Some(timer));
        }
    }

    fn on_last(&self) {
        if let Some(timer) = self.core.connect_timer.take() {
            self.core.scheduler.clear_timeout(timer);
            tracing::debug!(target: "statebind::resource", message = "connect cancelled by debounce");
            self.stop_waiting_on_connection();
            return;
        }
        if !self.core.connected.get() {
            return;
        }
        let retention = self.core.timing.get().retention;
        if retention.is_zero() {
            self.disconnect();
        } else {
            let weak = self.weak();
            let timer = self.core.scheduler.set_timeout(retention, move || {
                if let Some(owner) = Self::upgrade(&weak) {
                    owner.core.retention_timer.set(None);
                    owner.disconnect();
                }
            });
            self.core.retention_timer.set(Some(timer));
        }
    }

    fn connect(&self) {
        self.core.connected.set(true);
        tracing::debug!(target: "statebind::resource", message = "resource connecting");
        let hook = self.core.hooks.borrow().on_connect.clone();
        if let Some(hook) = hook {
            hook(self);
        }
    }

    fn disconnect(&self) {
        self.core.connected.set(false);
        tracing::debug!(target: "statebind::resource", message = "resource disconnecting");
        let hook = self.core.hooks.borrow().on_disconnect.clone();
        if let Some(hook) = hook {
            hook(self);
        }
        self.stop_waiting_on_connection();
    }

    /// The connection is gone before it answered; reads still waiting on it
    /// fall back to a fetch, later reads start their own.
    fn stop_waiting_on_connection(&self) {
        self.core.fetching.set(false);
        if !self.core.reads.is_empty() {
            self.core.fetching.set(true);
            self.fetch();
        }
    }

    fn subscribe(&self, subscriber: Subscriber<T>, run_immediately: bool) -> Subscriber<T> {
        subscribe_with(
            &self.core.subs,
            subscriber,
            run_immediately,
            || self.on_first(),
            // Every commit is dispatched, so a subscriber without a fresh
            // value hears the eventual one through dispatch alone.
            |cb| match self.fresh() {
                Some(value) => cb(&value),
                None => self.request(),
            },
        )
    }

    fn unsubscribe(&self, subscriber: &Subscriber<T>) {
        self.core.subs.remove(subscriber, || self.on_last());
    }
}

impl<T: Clone + 'static> ResourceOwner<T, Fallible> {
    /// Answer a `fetch_once` call.
    pub fn update_single(&self, value: StateResult<T>) {
        self.commit(value, "single");
    }

    /// Push an update from the live connection.
    pub fn update_resource(&self, value: StateResult<T>) {
        self.commit(value, "resource");
    }
}

fn hook<T, O>(f: impl Fn(&ResourceOwner<T, O>) + 'static) -> Hook<T, O> {
    Rc::new(f)
}

// ---------------------------------------------------------------------------
// ResourceState
// ---------------------------------------------------------------------------

/// Read-only resource container.
pub struct ResourceState<T, O = Fallible> {
    owner: ResourceOwner<T, O>,
    related: Option<Related>,
}

/// [`ResourceState`] that never holds an error.
pub type ResourceStateOk<T> = ResourceState<T, Guaranteed>;

impl<T, O> Clone for ResourceState<T, O> {
    fn clone(&self) -> Self {
        Self {
            owner: self.owner.clone(),
            related: self.related.clone(),
        }
    }
}

impl<T: fmt::Debug, O> fmt::Debug for ResourceState<T, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ResourceState").field(&self.owner).finish()
    }
}

impl<T: Clone + 'static, O: Outcome> ResourceState<T, O> {
    /// Resource answering reads through `fetch_once`.
    pub fn new(scheduler: Scheduler, fetch_once: impl Fn(&ResourceOwner<T, O>) + 'static) -> Self {
        Self {
            owner: ResourceOwner::new(scheduler, hook(fetch_once)),
            related: None,
        }
    }

    #[must_use]
    pub fn with_on_connect(self, f: impl Fn(&ResourceOwner<T, O>) + 'static) -> Self {
        self.owner.core.hooks.borrow_mut().on_connect = Some(hook(f));
        self
    }

    #[must_use]
    pub fn with_on_disconnect(self, f: impl Fn(&ResourceOwner<T, O>) + 'static) -> Self {
        self.owner.core.hooks.borrow_mut().on_disconnect = Some(hook(f));
        self
    }

    #[must_use]
    pub fn with_timing(self, timing: ResourceTiming) -> Self {
        self.owner.core.timing.set(timing);
        self
    }

    #[must_use]
    pub fn with_related(mut self, related: Related) -> Self {
        self.related = Some(related);
        self
    }

    /// Handle for answering fetches and pushing updates.
    #[must_use]
    pub fn owner(&self) -> ResourceOwner<T, O> {
        self.owner.clone()
    }

    #[must_use]
    pub fn buffer(&self) -> Option<StateResult<T>> {
        self.owner.buffer()
    }
}

impl<T: Clone + 'static, O: Outcome> StateRead<T> for ResourceState<T, O> {
    fn kind(&self) -> StateKind {
        StateKind::new(Family::Resource, false, O::GUARANTEED, false)
    }

    fn then(&self, callback: ReadCallback<T>) {
        self.owner.then(callback);
    }

    fn subscribe(&self, subscriber: Subscriber<T>, run_immediately: bool) -> Subscriber<T> {
        self.owner.subscribe(subscriber, run_immediately)
    }

    fn unsubscribe(&self, subscriber: &Subscriber<T>) {
        self.owner.unsubscribe(subscriber);
    }

    fn in_use(&self) -> bool {
        !self.owner.core.subs.is_empty()
    }

    fn has_subscriber(&self, subscriber: &Subscriber<T>) -> bool {
        self.owner.core.subs.contains(subscriber)
    }

    fn subscriber_count(&self) -> usize {
        self.owner.core.subs.len()
    }

    fn related(&self) -> Option<Related> {
        self.related.clone()
    }

    fn try_get(&self) -> Option<StateResult<T>> {
        self.owner.fresh()
    }
}

// ---------------------------------------------------------------------------
// ResourceStateWrite
// ---------------------------------------------------------------------------

type WriteAction<T, W, O> = Rc<dyn Fn(W, &ResourceOwner<T, O>) -> LocalBoxFuture<'static, StateResult<()>>>;

struct Throttle<W> {
    timer: Option<TimerId>,
    latest: Option<W>,
    waiters: Vec<oneshot::Sender<StateResult<()>>>,
}

impl<W> Default for Throttle<W> {
    fn default() -> Self {
        Self {
            timer: None,
            latest: None,
            waiters: Vec::new(),
        }
    }
}

struct WriteInner<T, W, O> {
    owner: ResourceOwner<T, O>,
    action: RefCell<Option<WriteAction<T, W, O>>>,
    mode: Cell<WriteMode>,
    helper: RefCell<HelperSlot<W>>,
    throttle: RefCell<Throttle<W>>,
}

/// Write-capable resource container.
///
/// Writes run the owner's write action; the value comes back through
/// `update_resource` or a later fetch, never from the write itself.
pub struct ResourceStateWrite<T, W = T, O = Fallible> {
    inner: Rc<WriteInner<T, W, O>>,
}

/// [`ResourceStateWrite`] that never holds an error.
pub type ResourceStateWriteOk<T, W = T> = ResourceStateWrite<T, W, Guaranteed>;

impl<T, W, O> Clone for ResourceStateWrite<T, W, O> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: fmt::Debug, W, O> fmt::Debug for ResourceStateWrite<T, W, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceStateWrite")
            .field("owner", &self.inner.owner)
            .field("mode", &self.inner.mode.get())
            .field("throttled_writes", &self.inner.throttle.borrow().waiters.len())
            .finish()
    }
}

impl<T, W, O> ResourceStateWrite<T, W, O>
where
    T: Clone + 'static,
    W: Clone + 'static,
    O: Outcome,
{
    pub fn new(scheduler: Scheduler, fetch_once: impl Fn(&ResourceOwner<T, O>) + 'static) -> Self {
        Self {
            inner: Rc::new(WriteInner {
                owner: ResourceOwner::new(scheduler, hook(fetch_once)),
                action: RefCell::new(None),
                mode: Cell::new(WriteMode::Immediate),
                helper: RefCell::new(HelperSlot::default()),
                throttle: RefCell::new(Throttle::default()),
            }),
        }
    }

    #[must_use]
    pub fn with_on_connect(self, f: impl Fn(&ResourceOwner<T, O>) + 'static) -> Self {
        self.inner.owner.core.hooks.borrow_mut().on_connect = Some(hook(f));
        self
    }

    #[must_use]
    pub fn with_on_disconnect(self, f: impl Fn(&ResourceOwner<T, O>) + 'static) -> Self {
        self.inner.owner.core.hooks.borrow_mut().on_disconnect = Some(hook(f));
        self
    }

    #[must_use]
    pub fn with_timing(self, timing: ResourceTiming) -> Self {
        self.inner.owner.core.timing.set(timing);
        self
    }

    /// Action run for each write (or each throttle window).
    #[must_use]
    pub fn with_write_action<F>(self, action: impl Fn(W, &ResourceOwner<T, O>) -> F + 'static) -> Self
    where
        F: Future<Output = StateResult<()>> + 'static,
    {
        let action: WriteAction<T, W, O> = Rc::new(
            move |value: W, owner: &ResourceOwner<T, O>| -> LocalBoxFuture<'static, StateResult<()>> {
                action(value, owner).boxed_local()
            },
        );
        *self.inner.action.borrow_mut() = Some(action);
        self
    }

    #[must_use]
    pub fn with_write_mode(self, mode: WriteMode) -> Self {
        self.inner.mode.set(mode);
        self
    }

    #[must_use]
    pub fn with_helper(self, helper: impl Helper<W> + 'static) -> Self {
        *self.inner.helper.borrow_mut() = HelperSlot::new(Some(Rc::new(helper)));
        self
    }

    #[must_use]
    pub fn owner(&self) -> ResourceOwner<T, O> {
        self.inner.owner.clone()
    }

    #[must_use]
    pub fn buffer(&self) -> Option<StateResult<T>> {
        self.inner.owner.buffer()
    }

    fn run_action(&self, value: W) -> LocalBoxFuture<'static, StateResult<()>> {
        let action = self.inner.action.borrow().clone();
        match action {
            Some(action) => action(value, &self.inner.owner),
            None => Box::pin(future::ready(Err(StateError::not_writable()))),
        }
    }

    fn throttled(&self, value: W, interval: Duration) -> LocalBoxFuture<'static, StateResult<()>> {
        let (tx, rx) = oneshot::channel();
        let mut throttle = self.inner.throttle.borrow_mut();
        throttle.latest = Some(value);
        throttle.waiters.push(tx);
        if throttle.timer.is_none() {
            let weak = Rc::downgrade(&self.inner);
            let timer = self.inner.owner.core.scheduler.set_timeout(interval, move || {
                if let Some(inner) = weak.upgrade() {
                    Self { inner }.flush();
                }
            });
            throttle.timer = Some(timer);
        }
        Box::pin(rx.map(|reply| reply.unwrap_or_else(|_| Err(StateError::dropped()))))
    }

    fn flush(&self) {
        let (latest, waiters) = {
            let mut throttle = self.inner.throttle.borrow_mut();
            throttle.timer = None;
            (throttle.latest.take(), std::mem::take(&mut throttle.waiters))
        };
        let Some(value) = latest else {
            return;
        };
        tracing::debug!(
            target: "statebind::resource",
            message = "throttled write flushed",
            coalesced = waiters.len(),
        );
        let pending = self.run_action(value);
        self.inner.owner.core.scheduler.spawn(async move {
            let result = pending.await;
            for waiter in waiters {
                let _ = waiter.send(result.clone());
            }
        });
    }
}

impl<T, W, O> StateRead<T> for ResourceStateWrite<T, W, O>
where
    T: Clone + 'static,
    W: Clone + 'static,
    O: Outcome,
{
    fn kind(&self) -> StateKind {
        StateKind::new(
            Family::Resource,
            false,
            O::GUARANTEED,
            self.inner.action.borrow().is_some(),
        )
    }

    fn then(&self, callback: ReadCallback<T>) {
        self.inner.owner.then(callback);
    }

    fn subscribe(&self, subscriber: Subscriber<T>, run_immediately: bool) -> Subscriber<T> {
        self.inner.owner.subscribe(subscriber, run_immediately)
    }

    fn unsubscribe(&self, subscriber: &Subscriber<T>) {
        self.inner.owner.unsubscribe(subscriber);
    }

    fn in_use(&self) -> bool {
        !self.inner.owner.core.subs.is_empty()
    }

    fn has_subscriber(&self, subscriber: &Subscriber<T>) -> bool {
        self.inner.owner.core.subs.contains(subscriber)
    }

    fn subscriber_count(&self) -> usize {
        self.inner.owner.core.subs.len()
    }

    fn related(&self) -> Option<Related> {
        self.inner.helper.borrow().related()
    }

    fn try_get(&self) -> Option<StateResult<T>> {
        self.inner.owner.fresh()
    }
}

impl<T, W, O> StateWrite<T, W> for ResourceStateWrite<T, W, O>
where
    T: Clone + 'static,
    W: Clone + 'static,
    O: Outcome,
{
    fn write(&self, value: W) -> LocalBoxFuture<'static, StateResult<()>> {
        if self.inner.action.borrow().is_none() {
            return Box::pin(future::ready(Err(StateError::not_writable())));
        }
        let Some(value) = self.limit(&value) else {
            return Box::pin(future::ready(Err(StateError::limited("Value rejected by limiter"))));
        };
        match self.inner.mode.get() {
            WriteMode::Immediate => self.run_action(value),
            WriteMode::Throttled { interval } => self.throttled(value, interval),
        }
    }

    fn check(&self, value: &W) -> Option<String> {
        self.inner.helper.borrow().check(value)
    }

    fn limit(&self, value: &W) -> Option<W> {
        self.inner.helper.borrow().limit(value)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use statebind_core::{ManualExecutor, NumberHelper, subscriber};

    #[derive(Default)]
    struct Calls {
        fetches: Cell<u32>,
        connects: Cell<u32>,
        disconnects: Cell<u32>,
    }

    fn resource(exec: &ManualExecutor, timing: ResourceTiming) -> (ResourceState<i32>, Rc<Calls>) {
        let calls = Rc::new(Calls::default());
        let (f, c, d) = (Rc::clone(&calls), Rc::clone(&calls), Rc::clone(&calls));
        let state = ResourceState::new(exec.scheduler(), move |owner: &ResourceOwner<i32>| {
            f.fetches.set(f.fetches.get() + 1);
            owner.update_single(Ok(f.fetches.get() as i32 * 10));
        })
        .with_on_connect(move |owner: &ResourceOwner<i32>| {
            c.connects.set(c.connects.get() + 1);
            owner.update_resource(Ok(100));
        })
        .with_on_disconnect(move |_: &ResourceOwner<i32>| d.disconnects.set(d.disconnects.get() + 1))
        .with_timing(timing);
        (state, calls)
    }

    fn record(log: &Rc<RefCell<Vec<StateResult<i32>>>>) -> Subscriber<i32> {
        let log = Rc::clone(log);
        subscriber(move |v: &StateResult<i32>| log.borrow_mut().push(v.clone()))
    }

    #[test]
    fn timing_from_lookup_ignores_invalid_values() {
        let timing = ResourceTiming::from_lookup(|key| match key {
            ENV_DEBOUNCE_MS => Some("25".into()),
            ENV_VALIDITY_MS => Some("soon".into()),
            ENV_RETENTION_MS => Some(" 300 ".into()),
            _ => None,
        });
        assert_eq!(timing.debounce, Duration::from_millis(25));
        assert_eq!(timing.validity, Duration::ZERO);
        assert_eq!(timing.retention, Duration::from_millis(300));
    }

    #[test]
    fn connect_and_disconnect_follow_reference_count() {
        let exec = ManualExecutor::new();
        let (state, calls) = resource(&exec, ResourceTiming::default());
        let log = Rc::new(RefCell::new(Vec::new()));
        // The connect hook runs before insertion; immediate delivery reads
        // the value it pushed.
        let a = state.subscribe(record(&log), true);
        let b = state.subscribe(subscriber(|_: &StateResult<i32>| {}), false);
        assert_eq!(calls.connects.get(), 1);
        assert_eq!(*log.borrow(), vec![Ok(100)]);
        state.unsubscribe(&a);
        assert_eq!(calls.disconnects.get(), 0);
        state.unsubscribe(&b);
        assert_eq!(calls.disconnects.get(), 1);
        assert_eq!(state.buffer(), Some(Ok(100)));
    }

    #[test]
    fn debounce_cancels_connect() {
        let exec = ManualExecutor::new();
        let timing = ResourceTiming::default().with_debounce(Duration::from_millis(50));
        let (state, calls) = resource(&exec, timing);
        let sub = state.subscribe(subscriber(|_: &StateResult<i32>| {}), false);
        exec.advance(Duration::from_millis(20));
        state.unsubscribe(&sub);
        exec.advance(Duration::from_millis(100));
        assert_eq!(calls.connects.get(), 0);
        assert_eq!(calls.disconnects.get(), 0);
    }

    #[test]
    fn read_after_silent_connection_fetches() {
        let exec = ManualExecutor::new();
        let fetches = Rc::new(Cell::new(0));
        let counter = Rc::clone(&fetches);
        let state = ResourceState::new(exec.scheduler(), move |owner: &ResourceOwner<i32>| {
            counter.set(counter.get() + 1);
            owner.update_single(Ok(7));
        })
        .with_on_connect(|_: &ResourceOwner<i32>| {});
        let sub = state.subscribe(subscriber(|_: &StateResult<i32>| {}), false);
        state.unsubscribe(&sub);

        let got = Rc::new(RefCell::new(None));
        let sink = Rc::clone(&got);
        state.then(Box::new(move |v: &StateResult<i32>| *sink.borrow_mut() = Some(v.clone())));
        exec.advance(Duration::from_secs(10));
        assert_eq!(fetches.get(), 1);
        assert_eq!(*got.borrow(), Some(Ok(7)));
    }

    #[test]
    fn read_pending_on_connection_survives_disconnect() {
        let exec = ManualExecutor::new();
        let state = ResourceState::new(exec.scheduler(), |owner: &ResourceOwner<i32>| {
            owner.update_single(Ok(3));
        })
        .with_on_connect(|_: &ResourceOwner<i32>| {});
        let sub = state.subscribe(subscriber(|_: &StateResult<i32>| {}), false);
        let got = Rc::new(RefCell::new(None));
        let sink = Rc::clone(&got);
        state.then(Box::new(move |v: &StateResult<i32>| *sink.borrow_mut() = Some(v.clone())));
        assert_eq!(*got.borrow(), None);
        state.unsubscribe(&sub);
        assert_eq!(*got.borrow(), Some(Ok(3)));
    }

    #[test]
    fn retention_suppresses_reconnect() {
        let exec = ManualExecutor::new();
        let timing = ResourceTiming::default().with_retention(Duration::from_millis(200));
        let (state, calls) = resource(&exec, timing);
        let sub = state.subscribe(subscriber(|_: &StateResult<i32>| {}), false);
        state.unsubscribe(&sub);
        exec.advance(Duration::from_millis(100));
        let sub = state.subscribe(sub, false);
        exec.advance(Duration::from_millis(500));
        assert_eq!(calls.connects.get(), 1);
        assert_eq!(calls.disconnects.get(), 0);
        state.unsubscribe(&sub);
        exec.advance(Duration::from_millis(200));
        assert_eq!(calls.disconnects.get(), 1);
    }

    #[test]
    fn reads_share_one_debounced_fetch() {
        let exec = ManualExecutor::new();
        let timing = ResourceTiming::default()
            .with_debounce(Duration::from_millis(10))
            .with_validity(Duration::from_millis(100));
        let (state, calls) = resource(&exec, timing);
        let first = state.value();
        let second = state.value();
        assert_eq!(calls.fetches.get(), 0);
        exec.advance(Duration::from_millis(10));
        assert_eq!(calls.fetches.get(), 1);
        assert_eq!(futures::executor::block_on(first), Ok(10));
        assert_eq!(futures::executor::block_on(second), Ok(10));

        // Inside validity: buffered.
        assert_eq!(state.try_get(), Some(Ok(10)));
        exec.advance(Duration::from_millis(200));
        assert_eq!(state.try_get(), None);
        let third = state.value();
        exec.advance(Duration::from_millis(10));
        assert_eq!(futures::executor::block_on(third), Ok(20));
        assert_eq!(calls.fetches.get(), 2);
    }

    #[test]
    fn immediate_writes_run_the_action() {
        let exec = ManualExecutor::new();
        let written = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&written);
        let state: ResourceStateWrite<f64> =
            ResourceStateWrite::new(exec.scheduler(), |_: &ResourceOwner<f64>| {})
                .with_helper(NumberHelper::range(0.0, 10.0))
                .with_write_action(move |value: f64, owner: &ResourceOwner<f64>| {
                    sink.borrow_mut().push(value);
                    owner.update_resource(Ok(value));
                    future::ready(Ok(()))
                });
        assert!(state.kind().writable);
        let result = futures::executor::block_on(state.write(42.0));
        assert_eq!(result, Ok(()));
        assert_eq!(*written.borrow(), vec![10.0]);
        assert_eq!(state.buffer(), Some(Ok(10.0)));
    }

    #[test]
    fn write_without_action_is_not_writable() {
        let exec = ManualExecutor::new();
        let state: ResourceStateWrite<i32> =
            ResourceStateWrite::new(exec.scheduler(), |_: &ResourceOwner<i32>| {});
        assert!(!state.kind().writable);
        let err = futures::executor::block_on(state.write(1)).unwrap_err();
        assert!(err.is(statebind_core::error::CODE_NOT_WRITABLE));
    }

    #[test]
    fn throttled_writes_coalesce() {
        let exec = ManualExecutor::new();
        let actions = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&actions);
        let state: ResourceStateWrite<i32> =
            ResourceStateWrite::new(exec.scheduler(), |_: &ResourceOwner<i32>| {})
                .with_write_mode(WriteMode::Throttled {
                    interval: Duration::from_millis(30),
                })
                .with_write_action(move |value: i32, _: &ResourceOwner<i32>| {
                    sink.borrow_mut().push(value);
                    future::ready(Ok(()))
                });
        let results = Rc::new(RefCell::new(Vec::new()));
        for value in [1, 2, 3] {
            let write = state.write(value);
            let results = Rc::clone(&results);
            exec.scheduler().spawn(async move {
                let result = write.await;
                results.borrow_mut().push(result);
            });
        }
        exec.run_until_stalled();
        assert!(actions.borrow().is_empty());
        exec.advance(Duration::from_millis(30));
        assert_eq!(*actions.borrow(), vec![3]);
        assert_eq!(*results.borrow(), vec![Ok(()), Ok(()), Ok(())]);
    }
}
