#![forbid(unsafe_code)]

//! Containers whose value is produced on first use.
//!
//! - [`LazyState`] / [`LazyStateWrite`]: a synchronous initializer runs on the
//!   first `get`, `then` or `write`; afterwards the container behaves exactly
//!   like a [`SyncState`](crate::sync::SyncState).
//! - [`DelayedState`] / [`DelayedStateWrite`]: an asynchronous initializer is
//!   spawned on the [`Scheduler`] on the first `then`, immediate `subscribe`
//!   or `write`. Reads and writes issued meanwhile are queued.
//!
//! Delayed stages move one way only:
//!
//! ```text
//! Uninit ──first use──▶ Pending ──initializer done / owner set──▶ Resolved
//! ```
//!
//! # Invariants
//!
//! 1. The initializer runs at most once, no matter how many reads or writes
//!    arrive before it completes.
//! 2. Resolved is permanent; unsubscribing and resubscribing never
//!    re-initializes.
//! 3. Queued writes replay in the order they were issued, after the queued
//!    reads resolve.
//! 4. An owner `set` before resolution wins; the initializer's later result
//!    is discarded.
//!
//! # Failure Modes
//!
//! - An initializer that reads its own container synchronously gets
//!   `Err(LAZY)` instead of recursing.
//! - Dropping a delayed container with queued reads or writes resolves them
//!   with `Err(DROP)`. The spawned initializer still runs to completion.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::rc::Rc;

use futures::FutureExt;
use futures::channel::oneshot;
use futures::future::{self, LocalBoxFuture};

use statebind_core::{
    Helper, PendingReads, ReadCallback, Related, Scheduler, StateError, StateResult, Subscriber,
    Subscribers,
};

use crate::contract::{
    Fallible, Family, Guaranteed, HelperSlot, Outcome, PassThrough, Setter, StateKind, StateOwner,
    StateRead, StateSyncRead, StateWrite, StateWriteSync, guaranteed_ok, subscribe_with,
    write_through_value,
};

/// Code reported when an initializer reads its own container.
pub const CODE_REENTRANT_INIT: &str = "LAZY";

/// Code reported by a synchronous write before the value resolved.
pub const CODE_NOT_RESOLVED: &str = "PEND";

type SyncInit<T> = Box<dyn FnOnce() -> StateResult<T>>;
type AsyncInit<T> = Box<dyn FnOnce() -> LocalBoxFuture<'static, StateResult<T>>>;

// ---------------------------------------------------------------------------
// LazyCore
// ---------------------------------------------------------------------------

struct LazyCore<T> {
    value: RefCell<Option<StateResult<T>>>,
    init: RefCell<Option<SyncInit<T>>>,
    subs: Subscribers<T>,
}

impl<T: Clone + 'static> LazyCore<T> {
    fn new(init: SyncInit<T>) -> Self {
        Self {
            value: RefCell::new(None),
            init: RefCell::new(Some(init)),
            subs: Subscribers::new(),
        }
    }

    fn get(&self) -> StateResult<T> {
        if let Some(value) = self.value.borrow().as_ref() {
            return value.clone();
        }
        let init = self.init.borrow_mut().take();
        let Some(init) = init else {
            tracing::warn!(
                target: "statebind::lazy",
                message = "lazy state read during its own initialization",
            );
            return Err(StateError::new(
                CODE_REENTRANT_INIT,
                "State read during its own initialization",
            ));
        };
        let value = init();
        tracing::trace!(target: "statebind::lazy", message = "lazy state initialized");
        // The initializer may have called `set` on us; that value wins.
        let mut slot = self.value.borrow_mut();
        slot.get_or_insert(value).clone()
    }

    fn store(&self, value: StateResult<T>) {
        if self.init.borrow_mut().take().is_some() {
            tracing::trace!(
                target: "statebind::lazy",
                message = "initializer discarded by owner set",
            );
        }
        *self.value.borrow_mut() = Some(value.clone());
        self.subs.dispatch(&value);
    }

    fn is_initialized(&self) -> bool {
        self.value.borrow().is_some()
    }
}

// ---------------------------------------------------------------------------
// LazyState
// ---------------------------------------------------------------------------

/// Read-only container with a synchronous initializer.
pub struct LazyState<T, O = Fallible> {
    core: Rc<LazyCore<T>>,
    related: Option<Related>,
    _outcome: PhantomData<O>,
}

/// [`LazyState`] that never holds an error.
pub type LazyStateOk<T> = LazyState<T, Guaranteed>;

impl<T, O> Clone for LazyState<T, O> {
    fn clone(&self) -> Self {
        Self {
            core: Rc::clone(&self.core),
            related: self.related.clone(),
            _outcome: PhantomData,
        }
    }
}

impl<T: fmt::Debug, O: Outcome> fmt::Debug for LazyState<T, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyState")
            .field("value", &self.core.value.borrow())
            .field("subscribers", &self.core.subs.len())
            .finish()
    }
}

impl<T: Clone + 'static, O: Outcome> LazyState<T, O> {
    fn from_init(init: SyncInit<T>) -> Self {
        Self {
            core: Rc::new(LazyCore::new(init)),
            related: None,
            _outcome: PhantomData,
        }
    }

    #[must_use]
    pub fn with_related(mut self, related: Related) -> Self {
        self.related = Some(related);
        self
    }

    /// Whether the initializer has run (or was discarded by `set`).
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.core.is_initialized()
    }

    pub fn set_ok(&self, value: T) {
        self.core.store(Ok(value));
    }
}

impl<T: Clone + 'static> LazyState<T, Fallible> {
    pub fn new(init: impl FnOnce() -> StateResult<T> + 'static) -> Self {
        Self::from_init(Box::new(init))
    }

    pub fn set(&self, value: StateResult<T>) {
        self.core.store(value);
    }

    pub fn set_err(&self, err: StateError) {
        self.core.store(Err(err));
    }
}

impl<T: Clone + 'static> LazyState<T, Guaranteed> {
    pub fn new_ok(init: impl FnOnce() -> T + 'static) -> Self {
        Self::from_init(Box::new(move || Ok(init())))
    }

    #[must_use]
    pub fn get_ok(&self) -> T {
        guaranteed_ok(self.core.get())
    }
}

impl<T: Clone + 'static, O: Outcome> StateRead<T> for LazyState<T, O> {
    fn kind(&self) -> StateKind {
        StateKind::new(Family::Lazy, true, O::GUARANTEED, false)
    }

    fn then(&self, callback: ReadCallback<T>) {
        callback(&self.core.get());
    }

    fn subscribe(&self, subscriber: Subscriber<T>, run_immediately: bool) -> Subscriber<T> {
        subscribe_with(&self.core.subs, subscriber, run_immediately, || {}, |cb| {
            self.then(cb);
        })
    }

    fn unsubscribe(&self, subscriber: &Subscriber<T>) {
        self.core.subs.remove(subscriber, || {});
    }

    fn in_use(&self) -> bool {
        !self.core.subs.is_empty()
    }

    fn has_subscriber(&self, subscriber: &Subscriber<T>) -> bool {
        self.core.subs.contains(subscriber)
    }

    fn subscriber_count(&self) -> usize {
        self.core.subs.len()
    }

    fn related(&self) -> Option<Related> {
        self.related.clone()
    }

    fn try_get(&self) -> Option<StateResult<T>> {
        Some(self.core.get())
    }
}

impl<T: Clone + 'static, O: Outcome> StateSyncRead<T> for LazyState<T, O> {
    fn get(&self) -> StateResult<T> {
        self.core.get()
    }
}

// ---------------------------------------------------------------------------
// LazyStateWrite
// ---------------------------------------------------------------------------

struct LazyWriteInner<T, W, O> {
    core: LazyCore<T>,
    setter: RefCell<Option<Setter<LazyStateWrite<T, W, O>, T, W>>>,
    helper: RefCell<HelperSlot<W>>,
}

/// Write-capable container with a synchronous initializer.
pub struct LazyStateWrite<T, W = T, O = Fallible> {
    inner: Rc<LazyWriteInner<T, W, O>>,
}

/// [`LazyStateWrite`] that never holds an error.
pub type LazyStateWriteOk<T, W = T> = LazyStateWrite<T, W, Guaranteed>;

impl<T, W, O> Clone for LazyStateWrite<T, W, O> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: fmt::Debug, W, O: Outcome> fmt::Debug for LazyStateWrite<T, W, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyStateWrite")
            .field("value", &self.inner.core.value.borrow())
            .field("subscribers", &self.inner.core.subs.len())
            .finish()
    }
}

impl<T, W, O> LazyStateWrite<T, W, O>
where
    T: Clone + 'static,
    W: Clone + 'static,
    O: Outcome,
{
    fn from_init(init: SyncInit<T>) -> Self {
        Self {
            inner: Rc::new(LazyWriteInner {
                core: LazyCore::new(init),
                setter: RefCell::new(None),
                helper: RefCell::new(HelperSlot::default()),
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

    pub fn set_setter(&self, setter: Option<Setter<Self, T, W>>) {
        *self.inner.setter.borrow_mut() = setter;
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.inner.core.is_initialized()
    }

    pub fn set_ok(&self, value: T) {
        self.inner.core.store(Ok(value));
    }
}

impl<T: Clone + 'static, W: Clone + 'static> LazyStateWrite<T, W, Fallible> {
    pub fn new(init: impl FnOnce() -> StateResult<T> + 'static) -> Self {
        Self::from_init(Box::new(init))
    }

    pub fn set(&self, value: StateResult<T>) {
        self.inner.core.store(value);
    }

    pub fn set_err(&self, err: StateError) {
        self.inner.core.store(Err(err));
    }
}

impl<T: Clone + 'static, W: Clone + 'static> LazyStateWrite<T, W, Guaranteed> {
    pub fn new_ok(init: impl FnOnce() -> T + 'static) -> Self {
        Self::from_init(Box::new(move || Ok(init())))
    }

    #[must_use]
    pub fn get_ok(&self) -> T {
        guaranteed_ok(self.inner.core.get())
    }
}

impl<T, W, O> StateRead<T> for LazyStateWrite<T, W, O>
where
    T: Clone + 'static,
    W: Clone + 'static,
    O: Outcome,
{
    fn kind(&self) -> StateKind {
        StateKind::new(
            Family::Lazy,
            true,
            O::GUARANTEED,
            self.inner.setter.borrow().is_some(),
        )
    }

    fn then(&self, callback: ReadCallback<T>) {
        callback(&self.inner.core.get());
    }

    fn subscribe(&self, subscriber: Subscriber<T>, run_immediately: bool) -> Subscriber<T> {
        subscribe_with(&self.inner.core.subs, subscriber, run_immediately, || {}, |cb| {
            self.then(cb);
        })
    }

    fn unsubscribe(&self, subscriber: &Subscriber<T>) {
        self.inner.core.subs.remove(subscriber, || {});
    }

    fn in_use(&self) -> bool {
        !self.inner.core.subs.is_empty()
    }

    fn has_subscriber(&self, subscriber: &Subscriber<T>) -> bool {
        self.inner.core.subs.contains(subscriber)
    }

    fn subscriber_count(&self) -> usize {
        self.inner.core.subs.len()
    }

    fn related(&self) -> Option<Related> {
        self.inner.helper.borrow().related()
    }

    fn try_get(&self) -> Option<StateResult<T>> {
        Some(self.inner.core.get())
    }
}

impl<T, W, O> StateSyncRead<T> for LazyStateWrite<T, W, O>
where
    T: Clone + 'static,
    W: Clone + 'static,
    O: Outcome,
{
    fn get(&self) -> StateResult<T> {
        self.inner.core.get()
    }
}

impl<T, W, O> StateWrite<T, W> for LazyStateWrite<T, W, O>
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

impl<T, W, O> StateWriteSync<T, W> for LazyStateWrite<T, W, O>
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
        let old = self.inner.core.get();
        setter.apply(value, self, &old)
    }
}

impl<T, W, O> StateOwner<T> for LazyStateWrite<T, W, O>
where
    T: Clone + 'static,
    W: Clone + 'static,
    O: Outcome,
{
    fn set_ok(&self, value: T) {
        LazyStateWrite::set_ok(self, value);
    }
}

impl<T, O> PassThrough<T, T> for LazyStateWrite<T, T, O>
where
    T: Clone + PartialEq + 'static,
    O: Outcome,
{
    fn write_through(&self, value: T, old: &StateResult<T>) -> StateResult<()> {
        write_through_value(self, value, old)
    }
}

// ---------------------------------------------------------------------------
// DelayedCore
// ---------------------------------------------------------------------------

enum Stage<T> {
    Uninit,
    Pending,
    Resolved(StateResult<T>),
}

impl<T> Stage<T> {
    fn name(&self) -> &'static str {
        match self {
            Self::Uninit => "uninit",
            Self::Pending => "pending",
            Self::Resolved(_) => "resolved",
        }
    }
}

struct DelayedCore<T> {
    stage: RefCell<Stage<T>>,
    init: RefCell<Option<AsyncInit<T>>>,
    reads: PendingReads<T>,
    subs: Subscribers<T>,
    scheduler: Scheduler,
}

impl<T: Clone + 'static> DelayedCore<T> {
    fn new(scheduler: Scheduler, init: AsyncInit<T>) -> Self {
        Self {
            stage: RefCell::new(Stage::Uninit),
            init: RefCell::new(Some(init)),
            reads: PendingReads::new(),
            subs: Subscribers::new(),
            scheduler,
        }
    }

    fn resolved(&self) -> Option<StateResult<T>> {
        match &*self.stage.borrow() {
            Stage::Resolved(value) => Some(value.clone()),
            _ => None,
        }
    }

    /// Spawn the initializer if nothing has started it yet.
    fn start(&self, done: impl FnOnce(StateResult<T>) + 'static) {
        {
            let mut stage = self.stage.borrow_mut();
            if !matches!(*stage, Stage::Uninit) {
                return;
            }
            *stage = Stage::Pending;
        }
        let init = self.init.borrow_mut().take();
        let Some(init) = init else {
            return;
        };
        tracing::debug!(target: "statebind::lazy", message = "delayed initializer started");
        let pending = init();
        self.scheduler.spawn(async move {
            done(pending.await);
        });
    }

    /// Commit the initializer's result unless the owner already set a value.
    fn complete(&self, value: StateResult<T>) -> bool {
        {
            let mut stage = self.stage.borrow_mut();
            if !matches!(*stage, Stage::Pending) {
                tracing::debug!(
                    target: "statebind::lazy",
                    message = "delayed initializer result discarded",
                    stage = stage.name(),
                );
                return false;
            }
            *stage = Stage::Resolved(value.clone());
        }
        tracing::debug!(target: "statebind::lazy", message = "delayed state resolved");
        self.reads.resolve(&value);
        true
    }

    /// Owner-side commit: resolves queued reads and notifies subscribers.
    fn store(&self, value: StateResult<T>) {
        self.init.borrow_mut().take();
        *self.stage.borrow_mut() = Stage::Resolved(value.clone());
        self.reads.resolve(&value);
        self.subs.dispatch(&value);
    }

    fn then(&self, callback: ReadCallback<T>) -> bool {
        match self.resolved() {
            Some(value) => {
                callback(&value);
                false
            }
            None => {
                self.reads.push(callback);
                true
            }
        }
    }
}

// ---------------------------------------------------------------------------
// DelayedState
// ---------------------------------------------------------------------------

/// Read-only container with an asynchronous initializer.
pub struct DelayedState<T, O = Fallible> {
    core: Rc<DelayedCore<T>>,
    related: Option<Related>,
    _outcome: PhantomData<O>,
}

/// [`DelayedState`] that never holds an error.
pub type DelayedStateOk<T> = DelayedState<T, Guaranteed>;

impl<T, O> Clone for DelayedState<T, O> {
    fn clone(&self) -> Self {
        Self {
            core: Rc::clone(&self.core),
            related: self.related.clone(),
            _outcome: PhantomData,
        }
    }
}

impl<T, O: Outcome> fmt::Debug for DelayedState<T, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelayedState")
            .field("stage", &self.core.stage.borrow().name())
            .field("waiting", &self.core.reads.len())
            .field("subscribers", &self.core.subs.len())
            .finish()
    }
}

impl<T: Clone + 'static, O: Outcome> DelayedState<T, O> {
    fn from_init(scheduler: Scheduler, init: AsyncInit<T>) -> Self {
        Self {
            core: Rc::new(DelayedCore::new(scheduler, init)),
            related: None,
            _outcome: PhantomData,
        }
    }

    #[must_use]
    pub fn with_related(mut self, related: Related) -> Self {
        self.related = Some(related);
        self
    }

    /// Whether a value is available.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        matches!(*self.core.stage.borrow(), Stage::Resolved(_))
    }

    pub fn set_ok(&self, value: T) {
        self.core.store(Ok(value));
    }

    fn start(&self) {
        let core = Rc::downgrade(&self.core);
        self.core.start(move |value| {
            if let Some(core) = core.upgrade() {
                core.complete(value);
            }
        });
    }
}

impl<T: Clone + 'static> DelayedState<T, Fallible> {
    pub fn new<F>(scheduler: Scheduler, init: impl FnOnce() -> F + 'static) -> Self
    where
        F: Future<Output = StateResult<T>> + 'static,
    {
        Self::from_init(scheduler, Box::new(move || init().boxed_local()))
    }

    pub fn set(&self, value: StateResult<T>) {
        self.core.store(value);
    }

    pub fn set_err(&self, err: StateError) {
        self.core.store(Err(err));
    }
}

impl<T: Clone + 'static> DelayedState<T, Guaranteed> {
    pub fn new_ok<F>(scheduler: Scheduler, init: impl FnOnce() -> F + 'static) -> Self
    where
        F: Future<Output = T> + 'static,
    {
        Self::from_init(scheduler, Box::new(move || init().map(Ok).boxed_local()))
    }
}

impl<T: Clone + 'static, O: Outcome> StateRead<T> for DelayedState<T, O> {
    fn kind(&self) -> StateKind {
        StateKind::new(Family::Delayed, self.is_resolved(), O::GUARANTEED, false)
    }

    fn then(&self, callback: ReadCallback<T>) {
        if self.core.then(callback) {
            self.start();
        }
    }

    fn subscribe(&self, subscriber: Subscriber<T>, run_immediately: bool) -> Subscriber<T> {
        subscribe_with(&self.core.subs, subscriber, run_immediately, || {}, |cb| {
            self.then(cb);
        })
    }

    fn unsubscribe(&self, subscriber: &Subscriber<T>) {
        self.core.subs.remove(subscriber, || {});
    }

    fn in_use(&self) -> bool {
        !self.core.subs.is_empty()
    }

    fn has_subscriber(&self, subscriber: &Subscriber<T>) -> bool {
        self.core.subs.contains(subscriber)
    }

    fn subscriber_count(&self) -> usize {
        self.core.subs.len()
    }

    fn related(&self) -> Option<Related> {
        self.related.clone()
    }

    fn try_get(&self) -> Option<StateResult<T>> {
        self.core.resolved()
    }
}

// ---------------------------------------------------------------------------
// DelayedStateWrite
// ---------------------------------------------------------------------------

type QueuedWrite<W> = (W, oneshot::Sender<StateResult<()>>);

struct DelayedWriteInner<T, W, O> {
    core: DelayedCore<T>,
    writes: RefCell<VecDeque<QueuedWrite<W>>>,
    setter: RefCell<Option<Setter<DelayedStateWrite<T, W, O>, T, W>>>,
    helper: RefCell<HelperSlot<W>>,
}

/// Write-capable container with an asynchronous initializer.
///
/// Writes issued before the value resolves are queued and replayed through
/// the setter, in order, once it does.
pub struct DelayedStateWrite<T, W = T, O = Fallible> {
    inner: Rc<DelayedWriteInner<T, W, O>>,
}

/// [`DelayedStateWrite`] that never holds an error.
pub type DelayedStateWriteOk<T, W = T> = DelayedStateWrite<T, W, Guaranteed>;

impl<T, W, O> Clone for DelayedStateWrite<T, W, O> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T, W, O: Outcome> fmt::Debug for DelayedStateWrite<T, W, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelayedStateWrite")
            .field("stage", &self.inner.core.stage.borrow().name())
            .field("waiting", &self.inner.core.reads.len())
            .field("queued_writes", &self.inner.writes.borrow().len())
            .field("subscribers", &self.inner.core.subs.len())
            .finish()
    }
}

impl<T, W, O> DelayedStateWrite<T, W, O>
where
    T: Clone + 'static,
    W: Clone + 'static,
    O: Outcome,
{
    fn from_init(scheduler: Scheduler, init: AsyncInit<T>) -> Self {
        Self {
            inner: Rc::new(DelayedWriteInner {
                core: DelayedCore::new(scheduler, init),
                writes: RefCell::new(VecDeque::new()),
                setter: RefCell::new(None),
                helper: RefCell::new(HelperSlot::default()),
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

    pub fn set_setter(&self, setter: Option<Setter<Self, T, W>>) {
        *self.inner.setter.borrow_mut() = setter;
    }

    #[must_use]
    pub fn is_resolved(&self) -> bool {
        matches!(*self.inner.core.stage.borrow(), Stage::Resolved(_))
    }

    pub fn set_ok(&self, value: T) {
        self.store(Ok(value));
    }

    fn store(&self, value: StateResult<T>) {
        let was_resolved = self.is_resolved();
        self.inner.core.store(value);
        if !was_resolved {
            self.replay_writes();
        }
    }

    fn start(&self) {
        let inner = Rc::downgrade(&self.inner);
        self.inner.core.start(move |value| {
            if let Some(inner) = inner.upgrade() {
                let state = Self { inner };
                if state.inner.core.complete(value) {
                    state.replay_writes();
                }
            }
        });
    }

    fn apply_write(&self, value: W) -> StateResult<()> {
        let setter = self.inner.setter.borrow().clone();
        let Some(setter) = setter else {
            return Err(StateError::not_writable());
        };
        let old = self
            .inner
            .core
            .resolved()
            .unwrap_or_else(|| Err(StateError::new(CODE_NOT_RESOLVED, "State not resolved")));
        setter.apply(value, self, &old)
    }

    fn replay_writes(&self) {
        loop {
            let next = self.inner.writes.borrow_mut().pop_front();
            let Some((value, reply)) = next else {
                return;
            };
            let _ = reply.send(self.apply_write(value));
        }
    }
}

impl<T: Clone + 'static, W: Clone + 'static> DelayedStateWrite<T, W, Fallible> {
    pub fn new<F>(scheduler: Scheduler, init: impl FnOnce() -> F + 'static) -> Self
    where
        F: Future<Output = StateResult<T>> + 'static,
    {
        Self::from_init(scheduler, Box::new(move || init().boxed_local()))
    }

    pub fn set(&self, value: StateResult<T>) {
        self.store(value);
    }

    pub fn set_err(&self, err: StateError) {
        self.store(Err(err));
    }
}

impl<T: Clone + 'static, W: Clone + 'static> DelayedStateWrite<T, W, Guaranteed> {
    pub fn new_ok<F>(scheduler: Scheduler, init: impl FnOnce() -> F + 'static) -> Self
    where
        F: Future<Output = T> + 'static,
    {
        Self::from_init(scheduler, Box::new(move || init().map(Ok).boxed_local()))
    }
}

impl<T, W, O> StateRead<T> for DelayedStateWrite<T, W, O>
where
    T: Clone + 'static,
    W: Clone + 'static,
    O: Outcome,
{
    fn kind(&self) -> StateKind {
        StateKind::new(
            Family::Delayed,
            self.is_resolved(),
            O::GUARANTEED,
            self.inner.setter.borrow().is_some(),
        )
    }

    fn then(&self, callback: ReadCallback<T>) {
        if self.inner.core.then(callback) {
            self.start();
        }
    }

    fn subscribe(&self, subscriber: Subscriber<T>, run_immediately: bool) -> Subscriber<T> {
        subscribe_with(&self.inner.core.subs, subscriber, run_immediately, || {}, |cb| {
            self.then(cb);
        })
    }

    fn unsubscribe(&self, subscriber: &Subscriber<T>) {
        self.inner.core.subs.remove(subscriber, || {});
    }

    fn in_use(&self) -> bool {
        !self.inner.core.subs.is_empty()
    }

    fn has_subscriber(&self, subscriber: &Subscriber<T>) -> bool {
        self.inner.core.subs.contains(subscriber)
    }

    fn subscriber_count(&self) -> usize {
        self.inner.core.subs.len()
    }

    fn related(&self) -> Option<Related> {
        self.inner.helper.borrow().related()
    }

    fn try_get(&self) -> Option<StateResult<T>> {
        self.inner.core.resolved()
    }
}

impl<T, W, O> StateWrite<T, W> for DelayedStateWrite<T, W, O>
where
    T: Clone + 'static,
    W: Clone + 'static,
    O: Outcome,
{
    fn write(&self, value: W) -> LocalBoxFuture<'static, StateResult<()>> {
        if self.inner.setter.borrow().is_none() {
            return Box::pin(future::ready(Err(StateError::not_writable())));
        }
        if self.is_resolved() {
            return Box::pin(future::ready(self.apply_write(value)));
        }
        let (reply, rx) = oneshot::channel();
        self.inner.writes.borrow_mut().push_back((value, reply));
        self.start();
        Box::pin(rx.map(|reply| reply.unwrap_or_else(|_| Err(StateError::dropped()))))
    }

    fn check(&self, value: &W) -> Option<String> {
        self.inner.helper.borrow().check(value)
    }

    fn limit(&self, value: &W) -> Option<W> {
        self.inner.helper.borrow().limit(value)
    }
}

/// Commits only once resolved. Before that it starts the initializer and
/// fails with `PEND`; use `write` to queue instead.
impl<T, W, O> StateWriteSync<T, W> for DelayedStateWrite<T, W, O>
where
    T: Clone + 'static,
    W: Clone + 'static,
    O: Outcome,
{
    fn write_sync(&self, value: W) -> StateResult<()> {
        if self.inner.setter.borrow().is_none() {
            return Err(StateError::not_writable());
        }
        if !self.is_resolved() {
            self.start();
            return Err(StateError::new(CODE_NOT_RESOLVED, "State not resolved"));
        }
        self.apply_write(value)
    }
}

impl<T, W, O> StateOwner<T> for DelayedStateWrite<T, W, O>
where
    T: Clone + 'static,
    W: Clone + 'static,
    O: Outcome,
{
    fn set_ok(&self, value: T) {
        DelayedStateWrite::set_ok(self, value);
    }
}

impl<T, O> PassThrough<T, T> for DelayedStateWrite<T, T, O>
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
    use statebind_core::{ManualExecutor, subscriber};
    use std::cell::Cell;
    use std::time::Duration;

    fn counter() -> (Rc<Cell<u32>>, Rc<Cell<u32>>) {
        let count = Rc::new(Cell::new(0));
        (Rc::clone(&count), count)
    }

    fn collect<T: Clone + 'static>() -> (ReadCallback<T>, Rc<RefCell<Vec<StateResult<T>>>>) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&log);
        (
            Box::new(move |v: &StateResult<T>| sink.borrow_mut().push(v.clone())),
            log,
        )
    }

    #[test]
    fn lazy_runs_initializer_once() {
        let (calls, seen) = counter();
        let state = LazyState::new(move || {
            calls.set(calls.get() + 1);
            Ok(10)
        });
        assert!(!state.is_initialized());
        assert_eq!(seen.get(), 0);
        assert_eq!(state.get(), Ok(10));
        let (cb, log) = collect();
        state.then(cb);
        assert_eq!(state.get(), Ok(10));
        assert_eq!(seen.get(), 1);
        assert_eq!(*log.borrow(), vec![Ok(10)]);
        assert_eq!(state.kind().family, Family::Lazy);
    }

    #[test]
    fn lazy_set_before_use_discards_initializer() {
        let (calls, seen) = counter();
        let state = LazyState::new(move || {
            calls.set(calls.get() + 1);
            Ok(1)
        });
        state.set_ok(7);
        assert_eq!(state.get(), Ok(7));
        assert_eq!(seen.get(), 0);
    }

    #[test]
    fn lazy_guaranteed_get_ok() {
        let state = LazyStateOk::new_ok(|| "boot".to_string());
        assert_eq!(state.get_ok(), "boot");
    }

    #[test]
    fn lazy_write_initializes_before_setter() {
        let (calls, seen) = counter();
        let state = LazyStateWrite::new(move || {
            calls.set(calls.get() + 1);
            Ok(3)
        })
        .with_setter(Setter::pass_through());
        // Equal to the initial value, so nothing is committed.
        assert_eq!(state.write_sync(3), Ok(()));
        assert_eq!(seen.get(), 1);
        assert_eq!(state.write_sync(5), Ok(()));
        assert_eq!(state.get(), Ok(5));
        assert_eq!(seen.get(), 1);
    }

    #[test]
    fn lazy_reentrant_read_reports_error() {
        let slot: Rc<RefCell<Option<LazyState<i32>>>> = Rc::new(RefCell::new(None));
        let inner_slot = Rc::clone(&slot);
        let state = LazyState::new(move || {
            let me = inner_slot.borrow().clone();
            match me {
                Some(me) => me.get().map(|v| v + 1),
                None => Ok(0),
            }
        });
        *slot.borrow_mut() = Some(state.clone());
        let err = state.get().unwrap_err();
        assert!(err.is(CODE_REENTRANT_INIT));
    }

    fn delayed_value(
        exec: &ManualExecutor,
        calls: Rc<Cell<u32>>,
        delay: Duration,
        value: i32,
    ) -> DelayedState<i32> {
        let sched = exec.scheduler();
        let timer = sched.clone();
        DelayedState::new(sched, move || {
            calls.set(calls.get() + 1);
            async move {
                timer.sleep(delay).await;
                Ok(value)
            }
        })
    }

    #[test]
    fn delayed_does_not_start_until_read() {
        let exec = ManualExecutor::new();
        let (calls, seen) = counter();
        let state = delayed_value(&exec, calls, Duration::from_millis(5), 1);
        state.subscribe(subscriber(|_: &StateResult<i32>| {}), false);
        exec.advance(Duration::from_millis(50));
        assert_eq!(seen.get(), 0);
        assert_eq!(state.try_get(), None);
        assert!(!state.kind().sync);
    }

    #[test]
    fn delayed_shares_one_initialization() {
        let exec = ManualExecutor::new();
        let (calls, seen) = counter();
        let state = delayed_value(&exec, calls, Duration::from_millis(10), 42);
        let (a, log_a) = collect();
        let (b, log_b) = collect();
        state.then(a);
        state.then(b);
        exec.run_until_stalled();
        assert!(log_a.borrow().is_empty());
        exec.advance(Duration::from_millis(10));
        assert_eq!(*log_a.borrow(), vec![Ok(42)]);
        assert_eq!(*log_b.borrow(), vec![Ok(42)]);
        assert_eq!(seen.get(), 1);
        assert_eq!(state.try_get(), Some(Ok(42)));
        assert!(state.kind().sync);
    }

    #[test]
    fn delayed_resolved_is_permanent() {
        let exec = ManualExecutor::new();
        let (calls, seen) = counter();
        let state = delayed_value(&exec, calls, Duration::ZERO, 9);
        let sub = state.subscribe(subscriber(|_: &StateResult<i32>| {}), true);
        exec.advance(Duration::ZERO);
        state.unsubscribe(&sub);
        let (cb, log) = collect();
        state.subscribe(subscriber(|_: &StateResult<i32>| {}), true);
        state.then(cb);
        assert_eq!(*log.borrow(), vec![Ok(9)]);
        assert_eq!(seen.get(), 1);
    }

    #[test]
    fn owner_set_wins_over_initializer() {
        let exec = ManualExecutor::new();
        let (calls, _) = counter();
        let state = delayed_value(&exec, calls, Duration::from_millis(10), 1);
        let (cb, log) = collect();
        state.then(cb);
        state.set_ok(5);
        assert_eq!(*log.borrow(), vec![Ok(5)]);
        exec.advance(Duration::from_millis(10));
        assert_eq!(state.try_get(), Some(Ok(5)));
    }

    #[test]
    fn delayed_writes_queue_and_replay_in_order() {
        let exec = ManualExecutor::new();
        let sched = exec.scheduler();
        let timer = sched.clone();
        let (calls, seen) = counter();
        let state: DelayedStateWrite<i32> = DelayedStateWrite::new(sched, move || {
            calls.set(calls.get() + 1);
            async move {
                timer.sleep(Duration::from_millis(5)).await;
                Ok(0)
            }
        })
        .with_setter(Setter::pass_through());

        let order = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&order);
        state.subscribe(
            subscriber(move |v: &StateResult<i32>| sink.borrow_mut().push(v.clone())),
            false,
        );

        let results = Rc::new(RefCell::new(Vec::new()));
        for value in [1, 2] {
            let write = state.write(value);
            let results = Rc::clone(&results);
            exec.scheduler().spawn(async move {
                let outcome = write.await;
                results.borrow_mut().push((value, outcome));
            });
        }
        exec.run_until_stalled();
        assert!(results.borrow().is_empty());
        exec.advance(Duration::from_millis(5));

        assert_eq!(seen.get(), 1);
        assert_eq!(*order.borrow(), vec![Ok(1), Ok(2)]);
        assert_eq!(results.borrow().len(), 2);
        assert!(results.borrow().iter().all(|(_, outcome)| outcome.is_ok()));
        assert_eq!(state.try_get(), Some(Ok(2)));
    }

    #[test]
    fn delayed_write_without_setter_fails_fast() {
        let exec = ManualExecutor::new();
        let state: DelayedStateWrite<i32> =
            DelayedStateWrite::new(exec.scheduler(), || async { Ok(1) });
        let result = futures::executor::block_on(state.write(3));
        assert!(result.unwrap_err().is(statebind_core::error::CODE_NOT_WRITABLE));
        assert!(!state.is_resolved());
    }

    #[test]
    fn delayed_write_sync_commits_once_resolved() {
        let exec = ManualExecutor::new();
        let timer = exec.scheduler();
        let (calls, seen) = counter();
        let state: DelayedStateWrite<i32> = DelayedStateWrite::new(exec.scheduler(), move || {
            calls.set(calls.get() + 1);
            async move {
                timer.sleep(Duration::from_millis(5)).await;
                Ok(0)
            }
        })
        .with_setter(Setter::pass_through());

        let early = state.write_sync(4).unwrap_err();
        assert!(early.is(CODE_NOT_RESOLVED));
        assert_eq!(seen.get(), 1, "the rejected write still starts the initializer");
        exec.advance(Duration::from_millis(5));
        assert_eq!(state.try_get(), Some(Ok(0)));

        assert_eq!(state.write_sync(4), Ok(()));
        assert_eq!(state.try_get(), Some(Ok(4)));
    }

    #[test]
    fn delayed_reports_related_metadata() {
        let exec = ManualExecutor::new();
        let (calls, _) = counter();
        let plain = delayed_value(&exec, Rc::clone(&calls), Duration::ZERO, 1);
        assert!(plain.related().is_none());
        let labelled = delayed_value(&exec, calls, Duration::ZERO, 1).with_related(Related::Text {
            max_length: Some(8),
            max_bytes: None,
        });
        assert!(matches!(labelled.related(), Some(Related::Text { .. })));
        assert!(matches!(labelled.clone().related(), Some(Related::Text { .. })));
    }

    #[test]
    fn dropped_container_fails_pending_value() {
        let exec = ManualExecutor::new();
        let (calls, _) = counter();
        let state = delayed_value(&exec, calls, Duration::from_millis(10), 1);
        let pending = state.value();
        drop(state);
        exec.advance(Duration::from_millis(10));
        let result = futures::executor::block_on(pending);
        assert_eq!(result, Err(StateError::dropped()));
    }
}
