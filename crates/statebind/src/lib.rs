#![forbid(unsafe_code)]

//! Reactive state containers.
//!
//! Every container holds a [`StateResult`], notifies subscribers when it
//! changes, and can be awaited. Variants differ in where the value comes
//! from:
//!
//! | Container | Value source |
//! |---|---|
//! | [`SyncState`] / [`SyncStateWrite`] | the owner, always available |
//! | [`LazyState`] / [`LazyStateWrite`] | a synchronous initializer on first use |
//! | [`DelayedState`] / [`DelayedStateWrite`] | an asynchronous initializer on first use |
//! | [`ResourceState`] / [`ResourceStateWrite`] | a remote resource behind owner hooks |
//! | [`CollectedState`] | a transform over other containers |
//! | [`ArrayState`] | an owned vector, published as [`ArrayDiff`]s |
//! | [`ProxyState`] / [`ProxyStateWrite`] | another container |
//!
//! All containers are single-threaded handles (`Rc` inside); cloning a
//! container clones the handle. Deferred work runs on an explicit
//! [`Scheduler`].
//!
//! # Quick start
//!
//! ```
//! use std::cell::RefCell;
//! use std::rc::Rc;
//! use statebind::prelude::*;
//!
//! let temperature = SyncStateOk::new_ok(21.5_f64);
//! let seen = Rc::new(RefCell::new(Vec::new()));
//! let sink = Rc::clone(&seen);
//! let sub = temperature.subscribe(
//!     subscriber(move |v: &StateResult<f64>| sink.borrow_mut().push(v.clone())),
//!     true,
//! );
//! temperature.set_ok(22.0);
//! temperature.unsubscribe(&sub);
//! assert_eq!(*seen.borrow(), vec![Ok(21.5), Ok(22.0)]);
//! ```

pub mod array;
pub mod collected;
pub mod contract;
pub mod lazy;
pub mod proxy;
pub mod resource;
pub mod sync;
pub mod util;

pub use array::{ArrayDiff, ArrayState, ArrayStateOk, ArrayWrite, DiffKind, apply_diff, apply_diff_with};
pub use collected::{CollectedState, CollectedStateOk};
pub use contract::{
    Fallible, Family, Guaranteed, Outcome, PassThrough, Setter, StateKind, StateOwner, StateRead,
    StateSyncRead, StateWrite, StateWriteSync, Subscription, ValueFuture, dyn_read, dyn_write,
};
pub use lazy::{
    DelayedState, DelayedStateOk, DelayedStateWrite, DelayedStateWriteOk, LazyState, LazyStateOk,
    LazyStateWrite, LazyStateWriteOk,
};
pub use proxy::{ProxyState, ProxyStateWrite};
pub use resource::{
    ResourceOwner, ResourceState, ResourceStateOk, ResourceStateWrite, ResourceStateWriteOk,
    ResourceTiming, WriteMode,
};
pub use sync::{SyncState, SyncStateOk, SyncStateWrite, SyncStateWriteOk};
pub use util::{DEFAULT_AWAIT_TIMEOUT, await_value, compare, compare_sync};

pub use statebind_core::{
    EnumEntry, EnumHelper, Executor, Helper, ManualExecutor, NumberHelper, ReadCallback, Related,
    Scheduler, StateError, StateResult, Subscriber, TextHelper, subscriber,
};
#[cfg(feature = "tokio")]
pub use statebind_core::TokioExecutor;

/// Everything needed to build and consume containers.
pub mod prelude {
    pub use crate::array::{ArrayDiff, ArrayState, ArrayStateOk, ArrayWrite, DiffKind, apply_diff};
    pub use crate::collected::{CollectedState, CollectedStateOk};
    pub use crate::contract::{
        Fallible, Guaranteed, Setter, StateKind, StateOwner, StateRead, StateSyncRead, StateWrite,
        StateWriteSync, Subscription, dyn_read, dyn_write,
    };
    pub use crate::lazy::{DelayedState, DelayedStateWrite, LazyState, LazyStateWrite};
    pub use crate::proxy::{ProxyState, ProxyStateWrite};
    pub use crate::resource::{
        ResourceOwner, ResourceState, ResourceStateWrite, ResourceTiming, WriteMode,
    };
    pub use crate::sync::{SyncState, SyncStateOk, SyncStateWrite, SyncStateWriteOk};
    pub use statebind_core::{
        ManualExecutor, NumberHelper, Scheduler, StateError, StateResult, Subscriber, subscriber,
    };
}
