#![forbid(unsafe_code)]

//! Containers forwarding to another container.
//!
//! A proxy holds no value of its own. Reads go to the source and pass through
//! an optional transform; the proxy subscribes to its source only while it
//! has subscribers itself, and keeps the last mapped value while it does.
//! Owners may retarget the proxy or swap its transform at any time; current
//! subscribers then receive the value read through the new configuration.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use futures::future::LocalBoxFuture;

use statebind_core::{ReadCallback, Related, StateResult, Subscriber, Subscribers, subscriber};

use crate::contract::{Family, StateKind, StateRead, StateWrite, subscribe_with};

type Transform<I, T> = Rc<dyn Fn(&StateResult<I>) -> StateResult<T>>;

// ---------------------------------------------------------------------------
// Core
// ---------------------------------------------------------------------------

struct ProxyCore<I, T, S: ?Sized> {
    source: RefCell<Rc<S>>,
    transform: RefCell<Transform<I, T>>,
    upstream: RefCell<Option<Subscriber<I>>>,
    buffer: RefCell<Option<StateResult<T>>>,
    subs: Subscribers<T>,
}

impl<I, T, S> ProxyCore<I, T, S>
where
    I: 'static,
    T: Clone + 'static,
    S: StateRead<I> + ?Sized + 'static,
{
    fn new(source: Rc<S>, transform: Transform<I, T>) -> Rc<Self> {
        Rc::new(Self {
            source: RefCell::new(source),
            transform: RefCell::new(transform),
            upstream: RefCell::new(None),
            buffer: RefCell::new(None),
            subs: Subscribers::new(),
        })
    }

    fn source(&self) -> Rc<S> {
        Rc::clone(&self.source.borrow())
    }

    fn transform(&self) -> Transform<I, T> {
        Rc::clone(&self.transform.borrow())
    }

    fn attach(self: &Rc<Self>, run_immediately: bool) {
        let weak: Weak<Self> = Rc::downgrade(self);
        let sub = subscriber(move |value: &StateResult<I>| {
            if let Some(core) = weak.upgrade() {
                let mapped = (core.transform())(value);
                *core.buffer.borrow_mut() = Some(mapped.clone());
                core.subs.dispatch(&mapped);
            }
        });
        *self.upstream.borrow_mut() = Some(Rc::clone(&sub));
        self.source().subscribe(sub, run_immediately);
        tracing::trace!(target: "statebind::proxy", message = "proxy attached to source");
    }

    fn detach(&self) {
        let sub = self.upstream.borrow_mut().take();
        if let Some(sub) = sub {
            self.source().unsubscribe(&sub);
        }
        self.buffer.borrow_mut().take();
        tracing::trace!(target: "statebind::proxy", message = "proxy detached from source");
    }

    /// Apply a configuration change, re-reading through it when in use.
    fn reconfigure(self: &Rc<Self>, change: impl FnOnce(&Self)) {
        let active = !self.subs.is_empty();
        if active {
            self.detach();
        }
        change(self);
        if active {
            self.attach(true);
        }
    }

    fn then(&self, callback: ReadCallback<T>) {
        let buffered = self.buffer.borrow().clone();
        if let Some(value) = buffered {
            callback(&value);
            return;
        }
        let transform = self.transform();
        self.source()
            .then(Box::new(move |value: &StateResult<I>| callback(&transform(value))));
    }

    fn subscribe(self: &Rc<Self>, subscriber: Subscriber<T>, run_immediately: bool) -> Subscriber<T> {
        subscribe_with(
            &self.subs,
            subscriber,
            run_immediately,
            || self.attach(false),
            |cb| self.then(cb),
        )
    }

    fn unsubscribe(&self, subscriber: &Subscriber<T>) {
        self.subs.remove(subscriber, || self.detach());
    }

    fn try_get(&self) -> Option<StateResult<T>> {
        if let Some(value) = self.buffer.borrow().clone() {
            return Some(value);
        }
        self.source().try_get().map(|value| (self.transform())(&value))
    }

    fn kind(&self, writable: bool) -> StateKind {
        let source = self.source().kind();
        StateKind::new(Family::Proxy, source.sync, source.guaranteed, writable)
    }
}

fn identity<T: Clone + 'static>() -> Transform<T, T> {
    Rc::new(|value: &StateResult<T>| value.clone())
}

// ---------------------------------------------------------------------------
// ProxyState
// ---------------------------------------------------------------------------

/// Read-only proxy of a `StateRead<I>` source, exposing `T`.
pub struct ProxyState<I, T = I> {
    core: Rc<ProxyCore<I, T, dyn StateRead<I>>>,
}

impl<I, T> Clone for ProxyState<I, T> {
    fn clone(&self) -> Self {
        Self {
            core: Rc::clone(&self.core),
        }
    }
}

impl<I, T> fmt::Debug for ProxyState<I, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyState")
            .field("attached", &self.core.upstream.borrow().is_some())
            .field("subscribers", &self.core.subs.len())
            .finish()
    }
}

impl<T: Clone + 'static> ProxyState<T, T> {
    /// Proxy passing values through unchanged.
    pub fn new(source: Rc<dyn StateRead<T>>) -> Self {
        Self {
            core: ProxyCore::new(source, identity()),
        }
    }
}

impl<I: 'static, T: Clone + 'static> ProxyState<I, T> {
    /// Proxy mapping every value with `transform`.
    pub fn with_transform(
        source: Rc<dyn StateRead<I>>,
        transform: impl Fn(&StateResult<I>) -> StateResult<T> + 'static,
    ) -> Self {
        Self {
            core: ProxyCore::new(source, Rc::new(transform)),
        }
    }

    /// Retarget to `source`.
    pub fn set_source(&self, source: Rc<dyn StateRead<I>>) {
        self.core
            .reconfigure(|core| *core.source.borrow_mut() = source);
    }

    pub fn set_transform(&self, transform: impl Fn(&StateResult<I>) -> StateResult<T> + 'static) {
        let transform: Transform<I, T> = Rc::new(transform);
        self.core
            .reconfigure(|core| *core.transform.borrow_mut() = transform);
    }
}

impl<I: 'static, T: Clone + 'static> StateRead<T> for ProxyState<I, T> {
    fn kind(&self) -> StateKind {
        self.core.kind(false)
    }

    fn then(&self, callback: ReadCallback<T>) {
        self.core.then(callback);
    }

    fn subscribe(&self, subscriber: Subscriber<T>, run_immediately: bool) -> Subscriber<T> {
        self.core.subscribe(subscriber, run_immediately)
    }

    fn unsubscribe(&self, subscriber: &Subscriber<T>) {
        self.core.unsubscribe(subscriber);
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
        self.core.source().related()
    }

    fn try_get(&self) -> Option<StateResult<T>> {
        self.core.try_get()
    }
}

// ---------------------------------------------------------------------------
// ProxyStateWrite
// ---------------------------------------------------------------------------

/// Proxy of a write-capable source; writes pass through unchanged.
pub struct ProxyStateWrite<I, T = I, W = I> {
    core: Rc<ProxyCore<I, T, dyn StateWrite<I, W>>>,
}

impl<I, T, W> Clone for ProxyStateWrite<I, T, W> {
    fn clone(&self) -> Self {
        Self {
            core: Rc::clone(&self.core),
        }
    }
}

impl<I, T, W> fmt::Debug for ProxyStateWrite<I, T, W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyStateWrite")
            .field("attached", &self.core.upstream.borrow().is_some())
            .field("subscribers", &self.core.subs.len())
            .finish()
    }
}

impl<T: Clone + 'static, W: 'static> ProxyStateWrite<T, T, W> {
    pub fn new(source: Rc<dyn StateWrite<T, W>>) -> Self {
        Self {
            core: ProxyCore::new(source, identity()),
        }
    }
}

impl<I: 'static, T: Clone + 'static, W: 'static> ProxyStateWrite<I, T, W> {
    pub fn with_transform(
        source: Rc<dyn StateWrite<I, W>>,
        transform: impl Fn(&StateResult<I>) -> StateResult<T> + 'static,
    ) -> Self {
        Self {
            core: ProxyCore::new(source, Rc::new(transform)),
        }
    }

    pub fn set_source(&self, source: Rc<dyn StateWrite<I, W>>) {
        self.core
            .reconfigure(|core| *core.source.borrow_mut() = source);
    }

    pub fn set_transform(&self, transform: impl Fn(&StateResult<I>) -> StateResult<T> + 'static) {
        let transform: Transform<I, T> = Rc::new(transform);
        self.core
            .reconfigure(|core| *core.transform.borrow_mut() = transform);
    }
}

impl<I: 'static, T: Clone + 'static, W: 'static> StateRead<T> for ProxyStateWrite<I, T, W> {
    fn kind(&self) -> StateKind {
        let writable = self.core.source().kind().writable;
        self.core.kind(writable)
    }

    fn then(&self, callback: ReadCallback<T>) {
        self.core.then(callback);
    }

    fn subscribe(&self, subscriber: Subscriber<T>, run_immediately: bool) -> Subscriber<T> {
        self.core.subscribe(subscriber, run_immediately)
    }

    fn unsubscribe(&self, subscriber: &Subscriber<T>) {
        self.core.unsubscribe(subscriber);
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
        self.core.source().related()
    }

    fn try_get(&self) -> Option<StateResult<T>> {
        self.core.try_get()
    }
}

impl<I: 'static, T: Clone + 'static, W: 'static> StateWrite<T, W> for ProxyStateWrite<I, T, W> {
    fn write(&self, value: W) -> LocalBoxFuture<'static, StateResult<()>> {
        self.core.source().write(value)
    }

    fn check(&self, value: &W) -> Option<String> {
        self.core.source().check(value)
    }

    fn limit(&self, value: &W) -> Option<W> {
        self.core.source().limit(value)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
