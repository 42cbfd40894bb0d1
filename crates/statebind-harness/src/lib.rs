#![forbid(unsafe_code)]

//! Test harness and reference fixtures for statebind.
//!
//! - [`recorder`]: subscribers that keep every delivery for assertions.
//! - [`remote`]: a scripted server side for resource containers.
//! - [`logging`]: test log setup and a capturing `tracing` layer.

pub mod logging;
pub mod recorder;
pub mod remote;

pub use logging::{CapturedEvent, LogCapture, init_test_logging};
pub use recorder::Recorder;
pub use remote::{ScriptedRemote, Traffic};
