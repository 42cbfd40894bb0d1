#![forbid(unsafe_code)]

//! Scripted remote endpoint backing resource containers in tests.
//!
//! A [`ScriptedRemote`] plays the server side of a resource: it holds the
//! authoritative value, answers one-shot fetches after a fixed latency,
//! pushes updates to every connected container and applies writes. Every
//! interaction is counted so scenarios can assert on traffic.
//!
//! # Invariants
//!
//! 1. Fetch replies and write acknowledgements arrive `latency` after the
//!    request, on the container's scheduler.
//! 2. Only connected owners receive pushes.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use futures::FutureExt;
use futures::channel::oneshot;
use statebind::{ResourceOwner, ResourceState, ResourceStateWrite, ResourceTiming, WriteMode};
use statebind_core::{Scheduler, StateError, StateResult};

/// Request counters of a [`ScriptedRemote`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Traffic {
    pub fetches: u32,
    pub connects: u32,
    pub disconnects: u32,
    pub writes: u32,
}

struct RemoteInner<T> {
    scheduler: Scheduler,
    value: RefCell<StateResult<T>>,
    latency: Cell<Duration>,
    traffic: Cell<Traffic>,
    connected: RefCell<Vec<ResourceOwner<T>>>,
    written: RefCell<Vec<T>>,
}

/// Simulated server for one resource.
pub struct ScriptedRemote<T> {
    inner: Rc<RemoteInner<T>>,
}

impl<T> Clone for ScriptedRemote<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for ScriptedRemote<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedRemote")
            .field("value", &self.inner.value.borrow())
            .field("traffic", &self.inner.traffic.get())
            .field("connected", &self.inner.connected.borrow().len())
            .finish()
    }
}

impl<T: Clone + 'static> ScriptedRemote<T> {
    pub fn new(scheduler: Scheduler, initial: StateResult<T>) -> Self {
        Self {
            inner: Rc::new(RemoteInner {
                scheduler,
                value: RefCell::new(initial),
                latency: Cell::new(Duration::ZERO),
                traffic: Cell::new(Traffic::default()),
                connected: RefCell::new(Vec::new()),
                written: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Delay applied to fetch replies and write acknowledgements.
    #[must_use]
    pub fn with_latency(self, latency: Duration) -> Self {
        self.inner.latency.set(latency);
        self
    }

    #[must_use]
    pub fn traffic(&self) -> Traffic {
        self.inner.traffic.get()
    }

    /// Values accepted by the write endpoint, in arrival order.
    #[must_use]
    pub fn written(&self) -> Vec<T> {
        self.inner.written.borrow().clone()
    }

    #[must_use]
    pub fn value(&self) -> StateResult<T> {
        self.inner.value.borrow().clone()
    }

    /// Change the server value and push it to every connected container.
    pub fn push(&self, value: StateResult<T>) {
        *self.inner.value.borrow_mut() = value.clone();
        let owners = self.inner.connected.borrow().clone();
        for owner in owners {
            owner.update_resource(value.clone());
        }
    }

    /// Read-only resource container backed by this remote.
    #[must_use]
    pub fn resource(&self, timing: ResourceTiming) -> ResourceState<T> {
        let (fetch, connect, disconnect) = (self.clone(), self.clone(), self.clone());
        ResourceState::new(self.inner.scheduler.clone(), move |owner: &ResourceOwner<T>| {
            fetch.answer_fetch(owner);
        })
        .with_on_connect(move |owner: &ResourceOwner<T>| connect.accept(owner))
        .with_on_disconnect(move |owner: &ResourceOwner<T>| disconnect.release(owner))
        .with_timing(timing)
    }

    /// Write-capable resource container; writes update the server value
    /// and are echoed back through the connection.
    #[must_use]
    pub fn resource_write(&self, timing: ResourceTiming, mode: WriteMode) -> ResourceStateWrite<T> {
        let (fetch, connect, disconnect, write) =
            (self.clone(), self.clone(), self.clone(), self.clone());
        ResourceStateWrite::new(self.inner.scheduler.clone(), move |owner: &ResourceOwner<T>| {
            fetch.answer_fetch(owner);
        })
        .with_on_connect(move |owner: &ResourceOwner<T>| connect.accept(owner))
        .with_on_disconnect(move |owner: &ResourceOwner<T>| disconnect.release(owner))
        .with_timing(timing)
        .with_write_mode(mode)
        .with_write_action(move |value: T, _owner: &ResourceOwner<T>| write.accept_write(value))
    }

    fn bump(&self, f: impl FnOnce(&mut Traffic)) {
        let mut traffic = self.inner.traffic.get();
        f(&mut traffic);
        self.inner.traffic.set(traffic);
    }

    fn answer_fetch(&self, owner: &ResourceOwner<T>) {
        self.bump(|t| t.fetches += 1);
        let remote = self.clone();
        let owner = owner.clone();
        self.inner
            .scheduler
            .set_timeout(self.inner.latency.get(), move || {
                owner.update_single(remote.value());
            });
    }

    fn accept(&self, owner: &ResourceOwner<T>) {
        self.bump(|t| t.connects += 1);
        self.inner.connected.borrow_mut().push(owner.clone());
        // A fresh connection starts with the current server value, unless it
        // closed before that value went out.
        let remote = self.clone();
        let owner = owner.clone();
        self.inner
            .scheduler
            .set_timeout(self.inner.latency.get(), move || {
                if remote.holds(&owner) {
                    owner.update_resource(remote.value());
                }
            });
    }

    fn holds(&self, owner: &ResourceOwner<T>) -> bool {
        self.inner
            .connected
            .borrow()
            .iter()
            .any(|held| held.same_as(owner))
    }

    fn release(&self, owner: &ResourceOwner<T>) {
        self.bump(|t| t.disconnects += 1);
        let mut connected = self.inner.connected.borrow_mut();
        let before = connected.len();
        connected.retain(|held| !held.same_as(owner));
        if connected.len() == before {
            tracing::warn!(target: "statebind::harness", message = "disconnect for unknown owner");
        }
    }

    fn accept_write(&self, value: T) -> impl Future<Output = StateResult<()>> + use<T> {
        self.bump(|t| t.writes += 1);
        let (tx, rx) = oneshot::channel();
        let remote = self.clone();
        self.inner
            .scheduler
            .set_timeout(self.inner.latency.get(), move || {
                remote.inner.written.borrow_mut().push(value.clone());
                remote.push(Ok(value));
                let _ = tx.send(Ok(()));
            });
        rx.map(|ack| ack.unwrap_or_else(|_| Err(StateError::dropped())))
    }
}

