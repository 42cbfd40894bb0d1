#![forbid(unsafe_code)]

//! Ordered-collection container emitting incremental diffs.
//!
//! An [`ArrayState`] publishes [`ArrayDiff`] values instead of whole arrays:
//! every mutator reports the smallest positional change that turns the
//! previous array into the new one, together with a shared snapshot of the
//! result. Consumers either read the snapshot or replay the diff onto their
//! own vector with [`apply_diff`] / [`apply_diff_with`].
//!
//! # Invariants
//!
//! 1. Replaying every emitted diff, in order, onto a copy of the initial
//!    array yields the current array.
//! 2. `Changed` diffs never alter the length.
//! 3. Mutators that change nothing emit nothing.
//! 4. Indices are clamped to the array; no mutator panics on bad input.
//!
//! # Failure Modes
//!
//! - A fallible array holding `Err` keeps an empty buffer; the next mutator
//!   clears the error and starts from that empty array.

use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;

use futures::future::{self, LocalBoxFuture};

use statebind_core::{
    Helper, ReadCallback, Related, StateError, StateResult, Subscriber, Subscribers,
};

use crate::contract::{
    Fallible, Family, Guaranteed, HelperSlot, Outcome, PassThrough, Setter, StateKind, StateRead,
    StateSyncRead, StateWrite, StateWriteSync, guaranteed_ok, subscribe_with,
};

// ---------------------------------------------------------------------------
// Diffs
// ---------------------------------------------------------------------------

/// What an [`ArrayDiff`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiffKind {
    /// Everything from `index` on was replaced by `items`.
    None,
    /// `items` were inserted at `index`.
    Added,
    /// `items` were removed starting at `index`.
    Removed,
    /// The slice at `index` was overwritten with `items`.
    Changed,
}

/// One change to an array, plus the array after the change.
#[derive(Clone, PartialEq)]
pub struct ArrayDiff<E> {
    kind: DiffKind,
    index: usize,
    items: Vec<E>,
    array: Rc<Vec<E>>,
}

impl<E: fmt::Debug> fmt::Debug for ArrayDiff<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArrayDiff")
            .field("kind", &self.kind)
            .field("index", &self.index)
            .field("items", &self.items)
            .field("len", &self.array.len())
            .finish()
    }
}

impl<E> ArrayDiff<E> {
    #[must_use]
    pub fn new(kind: DiffKind, index: usize, items: Vec<E>, array: Rc<Vec<E>>) -> Self {
        Self {
            kind,
            index,
            items,
            array,
        }
    }

    #[must_use]
    pub fn kind(&self) -> DiffKind {
        self.kind
    }

    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    #[must_use]
    pub fn items(&self) -> &[E] {
        &self.items
    }

    /// The array after this change.
    #[must_use]
    pub fn array(&self) -> &[E] {
        &self.array
    }

    /// Shared handle to the snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Rc<Vec<E>> {
        Rc::clone(&self.array)
    }
}

/// A change requested through [`StateWrite::write`] on an array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArrayWrite<E> {
    Added { index: usize, items: Vec<E> },
    Removed { index: usize, count: usize },
    Changed { index: usize, items: Vec<E> },
}

/// Replay `diff` onto `target`.
pub fn apply_diff<E: Clone>(target: &mut Vec<E>, diff: &ArrayDiff<E>) {
    apply_diff_with(target, diff, E::clone);
}

/// Replay `diff` onto `target`, mapping each item with `transform`.
pub fn apply_diff_with<A, E>(
    target: &mut Vec<A>,
    diff: &ArrayDiff<E>,
    mut transform: impl FnMut(&E) -> A,
) {
    let index = diff.index.min(target.len());
    match diff.kind {
        DiffKind::None => {
            target.truncate(index);
            target.extend(diff.items.iter().map(transform));
        }
        DiffKind::Added => {
            let mapped: Vec<A> = diff.items.iter().map(transform).collect();
            target.splice(index..index, mapped);
        }
        DiffKind::Removed => {
            let end = index.saturating_add(diff.items.len()).min(target.len());
            target.drain(index..end);
        }
        DiffKind::Changed => {
            for (slot, item) in target[index..].iter_mut().zip(&diff.items) {
                *slot = transform(item);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ArrayState
// ---------------------------------------------------------------------------

struct ArrayInner<E, O> {
    items: RefCell<Rc<Vec<E>>>,
    error: RefCell<Option<StateError>>,
    setter: RefCell<Option<Setter<ArrayState<E, O>, ArrayDiff<E>, ArrayWrite<E>>>>,
    helper: RefCell<HelperSlot<ArrayWrite<E>>>,
    related: RefCell<Option<Related>>,
    subs: Subscribers<ArrayDiff<E>>,
}

/// Array container; its owner mutates it through the methods below.
pub struct ArrayState<E, O = Fallible> {
    inner: Rc<ArrayInner<E, O>>,
    _outcome: PhantomData<O>,
}

/// [`ArrayState`] that never holds an error.
pub type ArrayStateOk<E> = ArrayState<E, Guaranteed>;

impl<E, O> Clone for ArrayState<E, O> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
            _outcome: PhantomData,
        }
    }
}

impl<E: fmt::Debug, O> fmt::Debug for ArrayState<E, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArrayState")
            .field("items", &self.inner.items.borrow())
            .field("error", &self.inner.error.borrow())
            .field("subscribers", &self.inner.subs.len())
            .finish()
    }
}

impl<E: Clone + 'static, O: Outcome> ArrayState<E, O> {
    fn from_parts(items: Vec<E>, error: Option<StateError>) -> Self {
        Self {
            inner: Rc::new(ArrayInner {
                items: RefCell::new(Rc::new(items)),
                error: RefCell::new(error),
                setter: RefCell::new(None),
                helper: RefCell::new(HelperSlot::default()),
                related: RefCell::new(None),
                subs: Subscribers::new(),
            }),
            _outcome: PhantomData,
        }
    }

    #[must_use]
    pub fn with_setter(self, setter: Setter<Self, ArrayDiff<E>, ArrayWrite<E>>) -> Self {
        self.set_setter(Some(setter));
        self
    }

    #[must_use]
    pub fn with_helper(self, helper: impl Helper<ArrayWrite<E>> + 'static) -> Self {
        *self.inner.helper.borrow_mut() = HelperSlot::new(Some(Rc::new(helper)));
        self
    }

    #[must_use]
    pub fn with_related(self, related: Related) -> Self {
        *self.inner.related.borrow_mut() = Some(related);
        self
    }

    pub fn set_setter(&self, setter: Option<Setter<Self, ArrayDiff<E>, ArrayWrite<E>>>) {
        *self.inner.setter.borrow_mut() = setter;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.items.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.items.borrow().is_empty()
    }

    /// Copy of the current items (empty while holding an error).
    #[must_use]
    pub fn to_vec(&self) -> Vec<E> {
        self.inner.items.borrow().as_ref().clone()
    }

    /// Replace the whole array.
    pub fn set_ok(&self, items: Vec<E>) {
        self.inner.error.borrow_mut().take();
        *self.inner.items.borrow_mut() = Rc::new(items);
        let diff = self.full_diff();
        self.inner.subs.dispatch(&Ok(diff));
    }

    /// Append `items`; returns the new length.
    pub fn push(&self, items: impl IntoIterator<Item = E>) -> usize {
        let index = self.len();
        self.insert_at(index, items.into_iter().collect());
        self.len()
    }

    /// Remove and return the last item.
    pub fn pop(&self) -> Option<E> {
        let len = self.len();
        if len == 0 {
            return None;
        }
        self.remove_range(len - 1, 1).pop()
    }

    /// Remove and return the first item.
    pub fn shift(&self) -> Option<E> {
        if self.is_empty() {
            return None;
        }
        self.remove_range(0, 1).pop()
    }

    /// Prepend `items`; returns the new length.
    pub fn unshift(&self, items: impl IntoIterator<Item = E>) -> usize {
        self.insert_at(0, items.into_iter().collect());
        self.len()
    }

    /// Remove `delete_count` items at `start`, then insert `items` there.
    /// Returns the removed items.
    pub fn splice(
        &self,
        start: usize,
        delete_count: usize,
        items: impl IntoIterator<Item = E>,
    ) -> Vec<E> {
        let start = start.min(self.len());
        let removed = self.remove_range(start, delete_count);
        self.insert_at(start, items.into_iter().collect());
        removed
    }

    /// Overwrite the slice at `index`; items past the end are dropped.
    /// Returns how many items were overwritten.
    pub fn replace(&self, index: usize, items: Vec<E>) -> usize {
        let written = {
            let mut slot = self.inner.items.borrow_mut();
            let len = slot.len();
            let index = index.min(len);
            let count = items.len().min(len - index);
            if count == 0 {
                return 0;
            }
            let array = Rc::make_mut(&mut *slot);
            array[index..index + count].clone_from_slice(&items[..count]);
            (index, items[..count].to_vec())
        };
        let count = written.1.len();
        self.emit(DiffKind::Changed, written.0, written.1);
        count
    }

    /// Replay a diff read from another array container and re-emit it.
    ///
    /// `transform` maps the source items to this array's items. An `Err`
    /// read is stored on fallible arrays and ignored on guaranteed ones.
    pub fn apply_read<B>(
        &self,
        read: &StateResult<ArrayDiff<B>>,
        transform: impl FnOnce(&[B], DiffKind) -> Vec<E>,
    ) {
        let diff = match read {
            Ok(diff) => diff,
            Err(err) => {
                if O::GUARANTEED {
                    tracing::warn!(
                        target: "statebind::array",
                        message = "error read ignored by guaranteed array",
                        code = err.code(),
                    );
                } else {
                    self.store_err(err.clone());
                }
                return;
            }
        };
        let items = transform(diff.items(), diff.kind());
        match diff.kind() {
            DiffKind::None => {
                let mut all = self.to_vec();
                all.truncate(diff.index().min(all.len()));
                all.extend(items);
                self.set_ok(all);
            }
            DiffKind::Added => self.insert_at(diff.index(), items),
            DiffKind::Removed => {
                self.remove_range(diff.index(), diff.items().len());
            }
            DiffKind::Changed => {
                self.replace(diff.index(), items);
            }
        }
    }

    fn full_diff(&self) -> ArrayDiff<E> {
        let array = Rc::clone(&self.inner.items.borrow());
        ArrayDiff::new(DiffKind::None, 0, array.as_ref().clone(), array)
    }

    fn current(&self) -> StateResult<ArrayDiff<E>> {
        match self.inner.error.borrow().clone() {
            Some(err) => Err(err),
            None => Ok(self.full_diff()),
        }
    }

    fn clear_error(&self) {
        if self.inner.error.borrow_mut().take().is_some() {
            tracing::debug!(target: "statebind::array", message = "array error cleared by mutation");
        }
    }

    fn insert_at(&self, index: usize, items: Vec<E>) {
        if items.is_empty() {
            return;
        }
        self.clear_error();
        let index = {
            let mut slot = self.inner.items.borrow_mut();
            let index = index.min(slot.len());
            Rc::make_mut(&mut *slot).splice(index..index, items.iter().cloned());
            index
        };
        self.emit(DiffKind::Added, index, items);
    }

    fn remove_range(&self, index: usize, count: usize) -> Vec<E> {
        let (index, removed) = {
            let mut slot = self.inner.items.borrow_mut();
            let index = index.min(slot.len());
            let end = index.saturating_add(count).min(slot.len());
            if index == end {
                return Vec::new();
            }
            let removed: Vec<E> = Rc::make_mut(&mut *slot).drain(index..end).collect();
            (index, removed)
        };
        self.clear_error();
        self.emit(DiffKind::Removed, index, removed.clone());
        removed
    }

    fn emit(&self, kind: DiffKind, index: usize, items: Vec<E>) {
        let array = Rc::clone(&self.inner.items.borrow());
        self.inner
            .subs
            .dispatch(&Ok(ArrayDiff::new(kind, index, items, array)));
    }

    fn store_err(&self, err: StateError) {
        *self.inner.items.borrow_mut() = Rc::new(Vec::new());
        *self.inner.error.borrow_mut() = Some(err.clone());
        self.inner.subs.dispatch(&Err(err));
    }

    fn apply_write(&self, write: ArrayWrite<E>) {
        match write {
            ArrayWrite::Added { index, items } => self.insert_at(index, items),
            ArrayWrite::Removed { index, count } => {
                self.remove_range(index, count);
            }
            ArrayWrite::Changed { index, items } => {
                self.replace(index, items);
            }
        }
    }
}

impl<E: Clone + PartialEq + 'static, O: Outcome> ArrayState<E, O> {
    /// Remove every item equal to `value`, one `Removed` diff per
    /// contiguous run. Returns how many items were removed.
    pub fn remove_all_of(&self, value: &E) -> usize {
        let mut removed = 0;
        let mut index = 0;
        loop {
            let run = {
                let items = self.inner.items.borrow();
                let Some(offset) = items[index.min(items.len())..].iter().position(|item| item == value) else {
                    break;
                };
                let start = index + offset;
                let len = items[start..].iter().take_while(|item| *item == value).count();
                (start, len)
            };
            removed += self.remove_range(run.0, run.1).len();
            index = run.0;
        }
        removed
    }
}

impl<E: Clone + 'static> ArrayState<E, Fallible> {
    pub fn new(init: StateResult<Vec<E>>) -> Self {
        match init {
            Ok(items) => Self::from_parts(items, None),
            Err(err) => Self::from_parts(Vec::new(), Some(err)),
        }
    }

    pub fn set(&self, value: StateResult<Vec<E>>) {
        match value {
            Ok(items) => self.set_ok(items),
            Err(err) => self.store_err(err),
        }
    }

    pub fn set_err(&self, err: StateError) {
        self.store_err(err);
    }
}

impl<E: Clone + 'static> ArrayState<E, Guaranteed> {
    pub fn new_ok(items: Vec<E>) -> Self {
        Self::from_parts(items, None)
    }

    #[must_use]
    pub fn get_ok(&self) -> ArrayDiff<E> {
        guaranteed_ok(self.current())
    }
}

impl<E: Clone + 'static, O: Outcome> StateRead<ArrayDiff<E>> for ArrayState<E, O> {
    fn kind(&self) -> StateKind {
        StateKind::new(
            Family::Array,
            true,
            O::GUARANTEED,
            self.inner.setter.borrow().is_some(),
        )
    }

    fn then(&self, callback: ReadCallback<ArrayDiff<E>>) {
        callback(&self.current());
    }

    fn subscribe(
        &self,
        subscriber: Subscriber<ArrayDiff<E>>,
        run_immediately: bool,
    ) -> Subscriber<ArrayDiff<E>> {
        subscribe_with(&self.inner.subs, subscriber, run_immediately, || {}, |cb| {
            self.then(cb);
        })
    }

    fn unsubscribe(&self, subscriber: &Subscriber<ArrayDiff<E>>) {
        self.inner.subs.remove(subscriber, || {});
    }

    fn in_use(&self) -> bool {
        !self.inner.subs.is_empty()
    }

    fn has_subscriber(&self, subscriber: &Subscriber<ArrayDiff<E>>) -> bool {
        self.inner.subs.contains(subscriber)
    }

    fn subscriber_count(&self) -> usize {
        self.inner.subs.len()
    }

    fn related(&self) -> Option<Related> {
        self.inner
            .helper
            .borrow()
            .related()
            .or_else(|| self.inner.related.borrow().clone())
    }

    fn try_get(&self) -> Option<StateResult<ArrayDiff<E>>> {
        Some(self.current())
    }
}

impl<E: Clone + 'static, O: Outcome> StateSyncRead<ArrayDiff<E>> for ArrayState<E, O> {
    fn get(&self) -> StateResult<ArrayDiff<E>> {
        self.current()
    }
}

impl<E: Clone + 'static, O: Outcome> StateWrite<ArrayDiff<E>, ArrayWrite<E>> for ArrayState<E, O> {
    fn write(&self, value: ArrayWrite<E>) -> LocalBoxFuture<'static, StateResult<()>> {
        Box::pin(future::ready(self.write_sync(value)))
    }

    fn check(&self, value: &ArrayWrite<E>) -> Option<String> {
        self.inner.helper.borrow().check(value)
    }

    fn limit(&self, value: &ArrayWrite<E>) -> Option<ArrayWrite<E>> {
        self.inner.helper.borrow().limit(value)
    }
}

impl<E: Clone + 'static, O: Outcome> StateWriteSync<ArrayDiff<E>, ArrayWrite<E>>
    for ArrayState<E, O>
{
    fn write_sync(&self, value: ArrayWrite<E>) -> StateResult<()> {
        let setter = self.inner.setter.borrow().clone();
        let Some(setter) = setter else {
            return Err(StateError::not_writable());
        };
        let old = self.current();
        setter.apply(value, self, &old)
    }
}

impl<E: Clone + 'static, O: Outcome> PassThrough<ArrayDiff<E>, ArrayWrite<E>> for ArrayState<E, O> {
    fn write_through(
        &self,
        value: ArrayWrite<E>,
        _old: &StateResult<ArrayDiff<E>>,
    ) -> StateResult<()> {
        let limited = self
            .limit(&value)
            .ok_or_else(|| StateError::limited("Value rejected by limiter"))?;
        self.apply_write(limited);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
