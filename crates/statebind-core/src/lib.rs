#![forbid(unsafe_code)]

//! Core of statebind: error model, subscription kernel, write helpers and
//! the cooperative scheduler the containers defer work to.

pub mod error;
pub mod helper;
pub mod kernel;
pub mod scheduler;
#[cfg(feature = "tokio")]
pub mod tokio_executor;

pub use error::{StateError, StateResult};
pub use helper::{EnumEntry, EnumHelper, Helper, NumberHelper, Related, TextHelper};
pub use kernel::{PendingReads, ReadCallback, Subscriber, Subscribers, subscriber};
pub use scheduler::{Executor, ManualExecutor, Scheduler, Task, TimerId};
#[cfg(feature = "tokio")]
pub use tokio_executor::TokioExecutor;
