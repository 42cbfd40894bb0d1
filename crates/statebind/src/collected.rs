#![forbid(unsafe_code)]

//! Containers deriving their value from other containers.
//!
//! A [`CollectedState`] recomputes its value from N inputs with a transform.
//! Inputs may share one type ([`CollectedState::new`]) or differ
//! ([`CollectedState::from2`], [`CollectedState::from3`]); either way they
//! are held as type-erased slots that buffer the latest value of their input.
//!
//! # Lifecycle
//!
//! ```text
//! inactive ──first subscriber──▶ activating ──every input delivered──▶ active
//!    ▲                                                                  │
//!    └───────────────────────────── last subscriber ────────────────────┘
//! ```
//!
//! # Invariants
//!
//! 1. The first value is computed only after every input delivered once
//!    (the barrier); reads issued before that are queued.
//! 2. After the barrier, any number of input updates inside one task cause
//!    exactly one recomputation, one microtask later, from the final values.
//!    With a single input, updates propagate synchronously.
//! 3. An inactive container holds no input subscriptions and no buffers.
//! 4. Callbacks from a previous activation never touch the current one.
//!
//! # Failure Modes
//!
//! - No inputs: every read yields `Err(NOST)`. Guaranteed containers take
//!   their first input separately and cannot be built empty.
//! - Leaving before the barrier: queued reads are answered by a one-shot
//!   read of the inputs instead.
//! - A transform that panics propagates to whoever triggered the
//!   recomputation; in the microtask path that is the executor.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::marker::PhantomData;
use std::rc::{Rc, Weak};

use statebind_core::{
    PendingReads, ReadCallback, Scheduler, StateError, StateResult, Subscriber, Subscribers,
    subscriber,
};

use crate::contract::{
    Fallible, Family, Guaranteed, Outcome, StateKind, StateRead, guaranteed_ok, subscribe_with,
};

// ---------------------------------------------------------------------------
// Input slots
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Buffers filled by the live subscriptions.
    Live,
    /// Buffers filled by a one-shot read while inactive.
    Once,
}

type Notify = Rc<dyn Fn(bool)>;

struct Slot<I> {
    state: Rc<dyn StateRead<I>>,
    live: RefCell<Option<StateResult<I>>>,
    once: RefCell<Option<StateResult<I>>>,
    subscriber: RefCell<Option<Subscriber<I>>>,
    /// Bumped on every attach and detach; deliveries from an older
    /// subscription are dropped.
    epoch: Cell<u64>,
    /// Whether the current subscription delivered yet.
    seen: Cell<bool>,
}

impl<I: Clone + 'static> Slot<I> {
    fn new(state: Rc<dyn StateRead<I>>) -> Rc<Self> {
        Rc::new(Self {
            state,
            live: RefCell::new(None),
            once: RefCell::new(None),
            subscriber: RefCell::new(None),
            epoch: Cell::new(0),
            seen: Cell::new(false),
        })
    }

    fn value(&self, phase: Phase) -> Option<StateResult<I>> {
        match phase {
            Phase::Live => self.live.borrow().clone(),
            Phase::Once => self.once.borrow().clone(),
        }
    }
}

/// Type-erased view of a [`Slot`].
trait ErasedSlot {
    /// Subscribe with immediate delivery; `notify(first)` after each value.
    fn attach(self: Rc<Self>, notify: Notify);
    fn detach(&self);
    /// One-shot read into the `Once` buffer, then `done()`.
    fn read_once(self: Rc<Self>, done: Rc<dyn Fn()>);
    /// Fill the `Once` buffer from `try_get`; false if no value is available.
    fn load_now(&self) -> bool;
    fn clear_once(&self);
}

impl<I: Clone + 'static> ErasedSlot for Slot<I> {
    fn attach(self: Rc<Self>, notify: Notify) {
        let epoch = self.epoch.get() + 1;
        self.epoch.set(epoch);
        self.seen.set(false);
        let slot = Rc::downgrade(&self);
        let sub = subscriber(move |value: &StateResult<I>| {
            let Some(slot) = slot.upgrade() else {
                return;
            };
            // An immediate read queued by a detached subscription can still
            // land here once the input resolves.
            if slot.epoch.get() != epoch {
                return;
            }
            *slot.live.borrow_mut() = Some(value.clone());
            notify(!slot.seen.replace(true));
        });
        *self.subscriber.borrow_mut() = Some(Rc::clone(&sub));
        self.state.subscribe(sub, true);
    }

    fn detach(&self) {
        self.epoch.set(self.epoch.get() + 1);
        self.seen.set(false);
        let sub = self.subscriber.borrow_mut().take();
        if let Some(sub) = sub {
            self.state.unsubscribe(&sub);
        }
        self.live.borrow_mut().take();
    }

    fn read_once(self: Rc<Self>, done: Rc<dyn Fn()>) {
        let slot = Rc::clone(&self);
        self.state.then(Box::new(move |value: &StateResult<I>| {
            *slot.once.borrow_mut() = Some(value.clone());
            done();
        }));
    }

    fn load_now(&self) -> bool {
        match self.state.try_get() {
            Some(value) => {
                *self.once.borrow_mut() = Some(value);
                true
            }
            None => false,
        }
    }

    fn clear_once(&self) {
        self.once.borrow_mut().take();
    }
}

type Compute<R> = Rc<dyn Fn(Phase) -> Option<StateResult<R>>>;

struct Sources<R> {
    slots: Vec<Rc<dyn ErasedSlot>>,
    compute: Compute<R>,
}

impl<R: 'static> Sources<R> {
    fn uniform<I: Clone + 'static>(
        inputs: Vec<Rc<dyn StateRead<I>>>,
        transform: impl Fn(&[StateResult<I>]) -> StateResult<R> + 'static,
    ) -> Self {
        let typed: Vec<Rc<Slot<I>>> = inputs.into_iter().map(Slot::new).collect();
        let slots = typed
            .iter()
            .map(|slot| Rc::clone(slot) as Rc<dyn ErasedSlot>)
            .collect();
        let compute: Compute<R> = Rc::new(move |phase| {
            let values: Option<Vec<StateResult<I>>> =
                typed.iter().map(|slot| slot.value(phase)).collect();
            values.map(|values| transform(&values))
        });
        Self { slots, compute }
    }

    fn pair<A, B>(
        a: Rc<dyn StateRead<A>>,
        b: Rc<dyn StateRead<B>>,
        transform: impl Fn(&StateResult<A>, &StateResult<B>) -> StateResult<R> + 'static,
    ) -> Self
    where
        A: Clone + 'static,
        B: Clone + 'static,
    {
        let (a, b) = (Slot::new(a), Slot::new(b));
        let slots: Vec<Rc<dyn ErasedSlot>> = vec![Rc::clone(&a) as _, Rc::clone(&b) as _];
        let compute: Compute<R> = Rc::new(move |phase| {
            let (a, b) = (a.value(phase)?, b.value(phase)?);
            Some(transform(&a, &b))
        });
        Self { slots, compute }
    }

    fn triple<A, B, C>(
        a: Rc<dyn StateRead<A>>,
        b: Rc<dyn StateRead<B>>,
        c: Rc<dyn StateRead<C>>,
        transform: impl Fn(&StateResult<A>, &StateResult<B>, &StateResult<C>) -> StateResult<R>
        + 'static,
    ) -> Self
    where
        A: Clone + 'static,
        B: Clone + 'static,
        C: Clone + 'static,
    {
        let (a, b, c) = (Slot::new(a), Slot::new(b), Slot::new(c));
        let slots: Vec<Rc<dyn ErasedSlot>> =
            vec![Rc::clone(&a) as _, Rc::clone(&b) as _, Rc::clone(&c) as _];
        let compute: Compute<R> = Rc::new(move |phase| {
            let (a, b, c) = (a.value(phase)?, b.value(phase)?, c.value(phase)?);
            Some(transform(&a, &b, &c))
        });
        Self { slots, compute }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

struct CollectedInner<R> {
    scheduler: Scheduler,
    sources: RefCell<Sources<R>>,
    buffer: RefCell<Option<StateResult<R>>>,
    active: Cell<bool>,
    /// Bumped on every deactivation and rebind.
    generation: Cell<u64>,
    delivered: Cell<usize>,
    recompute_queued: Cell<bool>,
    gathering: Cell<bool>,
    reads: PendingReads<R>,
    subs: Subscribers<R>,
}

impl<R: Clone + 'static> CollectedInner<R> {
    fn slots(&self) -> Vec<Rc<dyn ErasedSlot>> {
        self.sources.borrow().slots.clone()
    }

    fn compute(&self, phase: Phase) -> Option<StateResult<R>> {
        let compute = Rc::clone(&self.sources.borrow().compute);
        compute(phase)
    }

    fn activate(self: &Rc<Self>) {
        self.active.set(true);
        self.delivered.set(0);
        let slots = self.slots();
        if slots.is_empty() {
            *self.buffer.borrow_mut() = Some(Err(StateError::no_states()));
            return;
        }
        tracing::debug!(
            target: "statebind::collected",
            message = "collected state activating",
            inputs = slots.len(),
        );
        let generation = self.generation.get();
        for slot in slots {
            let weak = Rc::downgrade(self);
            slot.attach(Rc::new(move |first| {
                if let Some(inner) = weak.upgrade()
                    && inner.generation.get() == generation
                {
                    inner.input_changed(first);
                }
            }));
        }
    }

    fn deactivate(&self) {
        self.generation.set(self.generation.get() + 1);
        self.active.set(false);
        for slot in self.slots() {
            slot.detach();
        }
        self.buffer.borrow_mut().take();
        self.delivered.set(0);
        self.recompute_queued.set(false);
        tracing::debug!(target: "statebind::collected", message = "collected state deactivated");
    }

    /// Deactivate after the last subscriber left. Reads still waiting on the
    /// barrier fall back to a one-shot read.
    fn release(self: &Rc<Self>) {
        self.deactivate();
        if !self.reads.is_empty() && !self.gathering.get() {
            self.gather();
        }
    }

    fn barrier_passed(&self) -> bool {
        self.delivered.get() >= self.sources.borrow().slots.len()
    }

    fn input_changed(self: &Rc<Self>, first: bool) {
        if !self.barrier_passed() {
            if first {
                self.delivered.set(self.delivered.get() + 1);
            }
            if self.barrier_passed() {
                self.pass_barrier();
            }
            return;
        }
        if self.sources.borrow().slots.len() == 1 {
            self.recompute();
            return;
        }
        if self.recompute_queued.replace(true) {
            return;
        }
        let weak: Weak<Self> = Rc::downgrade(self);
        let generation = self.generation.get();
        self.scheduler.queue_microtask(move || {
            if let Some(inner) = weak.upgrade()
                && inner.generation.get() == generation
            {
                inner.recompute_queued.set(false);
                inner.recompute();
            }
        });
    }

    fn pass_barrier(&self) {
        let Some(value) = self.compute(Phase::Live) else {
            return;
        };
        tracing::trace!(
            target: "statebind::collected",
            message = "collected barrier passed",
            waiting = self.reads.len(),
        );
        *self.buffer.borrow_mut() = Some(value.clone());
        self.reads.resolve(&value);
    }

    fn recompute(&self) {
        let Some(value) = self.compute(Phase::Live) else {
            return;
        };
        tracing::trace!(target: "statebind::collected", message = "collected state recomputed");
        *self.buffer.borrow_mut() = Some(value.clone());
        self.subs.dispatch(&value);
    }

    fn then(self: &Rc<Self>, callback: ReadCallback<R>) {
        let buffered = self.buffer.borrow().clone();
        if let Some(value) = buffered {
            callback(&value);
            return;
        }
        if self.sources.borrow().slots.is_empty() {
            callback(&Err(StateError::no_states()));
            return;
        }
        self.reads.push(callback);
        if !self.active.get() && !self.gathering.get() {
            self.gather();
        }
    }

    /// One-shot read of every input while inactive.
    fn gather(self: &Rc<Self>) {
        let slots = self.slots();
        self.gathering.set(true);
        let remaining = Rc::new(Cell::new(slots.len()));
        let generation = self.generation.get();
        for slot in slots {
            let weak = Rc::downgrade(self);
            let remaining = Rc::clone(&remaining);
            slot.read_once(Rc::new(move || {
                remaining.set(remaining.get().saturating_sub(1));
                if remaining.get() > 0 {
                    return;
                }
                if let Some(inner) = weak.upgrade() {
                    inner.gathered(generation);
                }
            }));
        }
    }

    fn gathered(self: &Rc<Self>, generation: u64) {
        self.gathering.set(false);
        if self.generation.get() != generation {
            // Inputs were rebound meanwhile; read the new ones.
            if !self.reads.is_empty() && !self.active.get() {
                self.gather();
            }
            return;
        }
        let value = self.compute(Phase::Once);
        for slot in self.slots() {
            slot.clear_once();
        }
        if let Some(value) = value {
            self.reads.resolve(&value);
        }
    }

    fn try_get(&self) -> Option<StateResult<R>> {
        if let Some(value) = self.buffer.borrow().clone() {
            return Some(value);
        }
        let slots = self.slots();
        if slots.is_empty() {
            return Some(Err(StateError::no_states()));
        }
        if self.active.get() {
            return None;
        }
        let ready = slots.iter().all(|slot| slot.load_now());
        let value = if ready { self.compute(Phase::Once) } else { None };
        for slot in &slots {
            slot.clear_once();
        }
        value
    }

    fn rebind(self: &Rc<Self>, sources: Sources<R>) {
        let active = self.active.get();
        if active {
            self.deactivate();
        } else {
            self.generation.set(self.generation.get() + 1);
        }
        *self.sources.borrow_mut() = sources;
        if active {
            self.activate();
        }
    }
}

// ---------------------------------------------------------------------------
// CollectedState
// ---------------------------------------------------------------------------

/// Read-only container derived from other containers.
pub struct CollectedState<R, O = Fallible> {
    inner: Rc<CollectedInner<R>>,
    _outcome: PhantomData<O>,
}

/// [`CollectedState`] whose transform never fails.
pub type CollectedStateOk<R> = CollectedState<R, Guaranteed>;

impl<R, O> Clone for CollectedState<R, O> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
            _outcome: PhantomData,
        }
    }
}

impl<R: fmt::Debug, O> fmt::Debug for CollectedState<R, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectedState")
            .field("inputs", &self.inner.sources.borrow().slots.len())
            .field("active", &self.inner.active.get())
            .field("buffer", &self.inner.buffer.borrow())
            .field("subscribers", &self.inner.subs.len())
            .finish()
    }
}

impl<R: Clone + 'static, O: Outcome> CollectedState<R, O> {
    fn from_sources(scheduler: Scheduler, sources: Sources<R>) -> Self {
        Self {
            inner: Rc::new(CollectedInner {
                scheduler,
                sources: RefCell::new(sources),
                buffer: RefCell::new(None),
                active: Cell::new(false),
                generation: Cell::new(0),
                delivered: Cell::new(0),
                recompute_queued: Cell::new(false),
                gathering: Cell::new(false),
                reads: PendingReads::new(),
                subs: Subscribers::new(),
            }),
            _outcome: PhantomData,
        }
    }

    /// Whether the container currently subscribes to its inputs.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.active.get()
    }

    #[must_use]
    pub fn input_count(&self) -> usize {
        self.inner.sources.borrow().slots.len()
    }
}

impl<R: Clone + 'static> CollectedState<R, Fallible> {
    /// Derive from homogeneous inputs.
    pub fn new<I: Clone + 'static>(
        scheduler: Scheduler,
        inputs: Vec<Rc<dyn StateRead<I>>>,
        transform: impl Fn(&[StateResult<I>]) -> StateResult<R> + 'static,
    ) -> Self {
        Self::from_sources(scheduler, Sources::uniform(inputs, transform))
    }

    pub fn from2<A: Clone + 'static, B: Clone + 'static>(
        scheduler: Scheduler,
        a: Rc<dyn StateRead<A>>,
        b: Rc<dyn StateRead<B>>,
        transform: impl Fn(&StateResult<A>, &StateResult<B>) -> StateResult<R> + 'static,
    ) -> Self {
        Self::from_sources(scheduler, Sources::pair(a, b, transform))
    }

    pub fn from3<A: Clone + 'static, B: Clone + 'static, C: Clone + 'static>(
        scheduler: Scheduler,
        a: Rc<dyn StateRead<A>>,
        b: Rc<dyn StateRead<B>>,
        c: Rc<dyn StateRead<C>>,
        transform: impl Fn(&StateResult<A>, &StateResult<B>, &StateResult<C>) -> StateResult<R>
        + 'static,
    ) -> Self {
        Self::from_sources(scheduler, Sources::triple(a, b, c, transform))
    }

    /// Swap inputs and transform; an active container re-activates.
    pub fn set_inputs<I: Clone + 'static>(
        &self,
        inputs: Vec<Rc<dyn StateRead<I>>>,
        transform: impl Fn(&[StateResult<I>]) -> StateResult<R> + 'static,
    ) {
        self.inner.rebind(Sources::uniform(inputs, transform));
    }
}

impl<R: Clone + 'static> CollectedState<R, Guaranteed> {
    /// Derive from homogeneous inputs with an infallible transform.
    ///
    /// Takes at least one input: `first`, then `rest` in order.
    pub fn new_ok<I: Clone + 'static>(
        scheduler: Scheduler,
        first: Rc<dyn StateRead<I>>,
        rest: Vec<Rc<dyn StateRead<I>>>,
        transform: impl Fn(&[StateResult<I>]) -> R + 'static,
    ) -> Self {
        Self::from_sources(
            scheduler,
            Sources::uniform(non_empty(first, rest), move |values| Ok(transform(values))),
        )
    }

    pub fn from2_ok<A: Clone + 'static, B: Clone + 'static>(
        scheduler: Scheduler,
        a: Rc<dyn StateRead<A>>,
        b: Rc<dyn StateRead<B>>,
        transform: impl Fn(&StateResult<A>, &StateResult<B>) -> R + 'static,
    ) -> Self {
        Self::from_sources(
            scheduler,
            Sources::pair(a, b, move |a, b| Ok(transform(a, b))),
        )
    }

    pub fn set_inputs_ok<I: Clone + 'static>(
        &self,
        first: Rc<dyn StateRead<I>>,
        rest: Vec<Rc<dyn StateRead<I>>>,
        transform: impl Fn(&[StateResult<I>]) -> R + 'static,
    ) {
        self.inner.rebind(Sources::uniform(non_empty(first, rest), move |values| {
            Ok(transform(values))
        }));
    }

    /// Current value when one is available now.
    #[must_use]
    pub fn try_get_ok(&self) -> Option<R> {
        self.inner.try_get().map(guaranteed_ok)
    }
}

fn non_empty<I>(
    first: Rc<dyn StateRead<I>>,
    rest: Vec<Rc<dyn StateRead<I>>>,
) -> Vec<Rc<dyn StateRead<I>>> {
    let mut inputs = Vec::with_capacity(rest.len() + 1);
    inputs.push(first);
    inputs.extend(rest);
    inputs
}

impl<R: Clone + 'static, O: Outcome> StateRead<R> for CollectedState<R, O> {
    fn kind(&self) -> StateKind {
        StateKind::new(Family::Collected, false, O::GUARANTEED, false)
    }

    fn then(&self, callback: ReadCallback<R>) {
        self.inner.then(callback);
    }

    fn subscribe(&self, subscriber: Subscriber<R>, run_immediately: bool) -> Subscriber<R> {
        subscribe_with(
            &self.inner.subs,
            subscriber,
            run_immediately,
            || self.inner.activate(),
            |cb| self.inner.then(cb),
        )
    }

    fn unsubscribe(&self, subscriber: &Subscriber<R>) {
        self.inner.subs.remove(subscriber, || self.inner.release());
    }

    fn in_use(&self) -> bool {
        !self.inner.subs.is_empty()
    }

    fn has_subscriber(&self, subscriber: &Subscriber<R>) -> bool {
        self.inner.subs.contains(subscriber)
    }

    fn subscriber_count(&self) -> usize {
        self.inner.subs.len()
    }

    fn try_get(&self) -> Option<StateResult<R>> {
        self.inner.try_get()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::dyn_read;
    use crate::lazy::DelayedState;
    use crate::sync::SyncState;
    use statebind_core::ManualExecutor;
    use std::time::Duration;

    fn sum(values: &[StateResult<i32>]) -> StateResult<i32> {
        values.iter().try_fold(0, |acc, v| v.as_ref().map(|v| acc + v).map_err(Clone::clone))
    }

    fn recorder() -> (Subscriber<i32>, Rc<RefCell<Vec<StateResult<i32>>>>) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&log);
        (
            subscriber(move |v: &StateResult<i32>| sink.borrow_mut().push(v.clone())),
            log,
        )
    }

    #[test]
    fn empty_inputs_report_no_states() {
        let exec = ManualExecutor::new();
        let state = CollectedState::new(exec.scheduler(), Vec::<Rc<dyn StateRead<i32>>>::new(), sum);
        let err = futures::executor::block_on(state.value()).unwrap_err();
        assert!(err.is(statebind_core::error::CODE_NO_STATES));
        assert_eq!(state.try_get(), Some(Err(StateError::no_states())));
    }

    #[test]
    fn inactive_read_is_one_shot() {
        let exec = ManualExecutor::new();
        let a = SyncState::new(Ok(2));
        let b = SyncState::new(Ok(3));
        let state = CollectedState::new(exec.scheduler(), vec![dyn_read(&a), dyn_read(&b)], sum);
        assert_eq!(futures::executor::block_on(state.value()), Ok(5));
        assert_eq!(state.try_get(), Some(Ok(5)));
        assert!(!state.is_active());
        assert_eq!(a.subscriber_count(), 0);
    }

    #[test]
    fn updates_in_one_task_coalesce() {
        let exec = ManualExecutor::new();
        let a = SyncState::new(Ok(1));
        let b = SyncState::new(Ok(1));
        let state = CollectedState::new(exec.scheduler(), vec![dyn_read(&a), dyn_read(&b)], sum);
        let (sub, log) = recorder();
        state.subscribe(sub, true);
        assert_eq!(*log.borrow(), vec![Ok(2)]);

        a.set_ok(10);
        b.set_ok(20);
        a.set_ok(30);
        assert_eq!(log.borrow().len(), 1);
        assert_eq!(exec.run_microtasks(), 1);
        assert_eq!(*log.borrow(), vec![Ok(2), Ok(50)]);
    }

    #[test]
    fn single_input_propagates_synchronously() {
        let exec = ManualExecutor::new();
        let a = SyncState::new(Ok(4));
        let state = CollectedState::new(exec.scheduler(), vec![dyn_read(&a)], sum);
        let (sub, log) = recorder();
        state.subscribe(sub, false);
        a.set_ok(5);
        assert_eq!(*log.borrow(), vec![Ok(5)]);
        assert_eq!(exec.pending_microtasks(), 0);
    }

    #[test]
    fn barrier_waits_for_every_input() {
        let exec = ManualExecutor::new();
        let fast = SyncState::new(Ok(1));
        let timer = exec.scheduler();
        let slow = DelayedState::new(exec.scheduler(), move || async move {
            timer.sleep(Duration::from_millis(20)).await;
            Ok(2)
        });
        let state = CollectedState::new(
            exec.scheduler(),
            vec![dyn_read(&fast), dyn_read(&slow)],
            sum,
        );
        let (sub, log) = recorder();
        state.subscribe(sub, true);
        let pending = state.value();
        exec.run_until_stalled();
        assert!(log.borrow().is_empty());
        assert_eq!(state.try_get(), None);

        exec.advance(Duration::from_millis(20));
        assert_eq!(*log.borrow(), vec![Ok(3)]);
        assert_eq!(futures::executor::block_on(pending), Ok(3));
    }

    #[test]
    fn leaving_before_barrier_answers_reads_and_recovers() {
        let exec = ManualExecutor::new();
        let fast = SyncState::new(Ok(1));
        let timer = exec.scheduler();
        let slow = DelayedState::new(exec.scheduler(), move || async move {
            timer.sleep(Duration::from_millis(20)).await;
            Ok(2)
        });
        let state = CollectedState::new(
            exec.scheduler(),
            vec![dyn_read(&fast), dyn_read(&slow)],
            sum,
        );

        let (first, _) = recorder();
        let first = state.subscribe(first, true);
        let early = Rc::new(RefCell::new(None));
        let sink = Rc::clone(&early);
        state.then(Box::new(move |v: &StateResult<i32>| *sink.borrow_mut() = Some(v.clone())));
        state.unsubscribe(&first);
        assert!(!state.is_active());

        exec.advance(Duration::from_millis(20));
        assert_eq!(*early.borrow(), Some(Ok(3)));

        let (second, log) = recorder();
        state.subscribe(second, true);
        exec.run_until_stalled();
        assert_eq!(*log.borrow(), vec![Ok(3)]);

        fast.set_ok(10);
        exec.run_until_stalled();
        assert_eq!(*log.borrow(), vec![Ok(3), Ok(12)]);
        assert_eq!(state.try_get(), Some(Ok(12)));
    }

    #[test]
    fn guaranteed_takes_first_input_separately() {
        let exec = ManualExecutor::new();
        let a = SyncState::new(Ok(2));
        let b = SyncState::new(Ok(5));
        let state = CollectedStateOk::new_ok(
            exec.scheduler(),
            dyn_read(&a),
            vec![dyn_read(&b)],
            |values: &[StateResult<i32>]| {
                values.iter().filter_map(|v| v.as_ref().ok()).product::<i32>()
            },
        );
        assert_eq!(state.input_count(), 2);
        assert_eq!(state.try_get_ok(), Some(10));

        state.set_inputs_ok(dyn_read(&b), Vec::new(), |values: &[StateResult<i32>]| {
            values.len() as i32
        });
        assert_eq!(state.input_count(), 1);
        assert_eq!(state.try_get_ok(), Some(1));
    }

    #[test]
    fn last_unsubscribe_releases_inputs() {
        let exec = ManualExecutor::new();
        let a = SyncState::new(Ok(1));
        let b = SyncState::new(Ok(2));
        let state = CollectedState::new(exec.scheduler(), vec![dyn_read(&a), dyn_read(&b)], sum);
        let (sub, _) = recorder();
        let sub = state.subscribe(sub, true);
        assert_eq!(a.subscriber_count(), 1);
        a.set_ok(7);
        state.unsubscribe(&sub);
        assert_eq!(a.subscriber_count(), 0);
        assert_eq!(b.subscriber_count(), 0);
        // The queued recomputation belongs to the old activation.
        exec.run_microtasks();
        assert!(!state.is_active());
    }

    #[test]
    fn heterogeneous_inputs() {
        let exec = ManualExecutor::new();
        let count = SyncState::new(Ok(3_u32));
        let label = SyncState::new(Ok("x".to_string()));
        let state = CollectedStateOk::from2_ok(
            exec.scheduler(),
            dyn_read(&count),
            dyn_read(&label),
            |n, s| match (n, s) {
                (Ok(n), Ok(s)) => s.repeat(*n as usize),
                _ => String::new(),
            },
        );
        assert_eq!(state.try_get_ok(), Some("xxx".to_string()));
        assert!(state.kind().guaranteed);
    }

    #[test]
    fn rebinding_active_container_reactivates() {
        let exec = ManualExecutor::new();
        let a = SyncState::new(Ok(1));
        let b = SyncState::new(Ok(100));
        let state = CollectedState::new(exec.scheduler(), vec![dyn_read(&a)], sum);
        let (sub, log) = recorder();
        state.subscribe(sub, true);
        state.set_inputs(vec![dyn_read(&b)], sum);
        assert_eq!(a.subscriber_count(), 0);
        assert_eq!(b.subscriber_count(), 1);
        b.set_ok(101);
        assert_eq!(*log.borrow(), vec![Ok(1), Ok(101)]);
        assert_eq!(state.try_get(), Some(Ok(101)));
    }
}
