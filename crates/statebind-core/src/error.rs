#![forbid(unsafe_code)]

//! Error model shared by every container.
//!
//! Domain failures are data: a container stores and emits
//! [`StateResult<T>`], never panics to signal a bad value. [`StateError`]
//! pairs a short machine-readable `code` with a human-readable `reason`.

use std::borrow::Cow;

use thiserror::Error;

/// Result type stored and emitted by every container.
pub type StateResult<T> = std::result::Result<T, StateError>;

/// Code used when a write reaches a container without a setter.
pub const CODE_NOT_WRITABLE: &str = "NWRT";
/// Code used when a limiter rejects a written value.
pub const CODE_LIMITED: &str = "LIMT";
/// Code used when a derived container has no inputs.
pub const CODE_NO_STATES: &str = "NOST";
/// Code used when a container is dropped while reads are still pending.
pub const CODE_DROPPED: &str = "DROP";

/// Structured error carried by `Err` values.
///
/// `code` is at most four ASCII letters by convention; `reason` is meant for
/// humans and may be shown in the UI.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Error)]
#[error("{reason} ({code})")]
pub struct StateError {
    code: Cow<'static, str>,
    reason: Cow<'static, str>,
}

impl StateError {
    /// Create an error from a code and a reason.
    #[must_use]
    pub fn new(code: impl Into<Cow<'static, str>>, reason: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code: code.into(),
            reason: reason.into(),
        }
    }

    /// The write reached a container that has no setter.
    #[must_use]
    pub fn not_writable() -> Self {
        Self::new(CODE_NOT_WRITABLE, "State not writable")
    }

    /// The limiter refused the written value.
    #[must_use]
    pub fn limited(reason: impl Into<Cow<'static, str>>) -> Self {
        Self::new(CODE_LIMITED, reason)
    }

    /// A derived container was read without any inputs.
    #[must_use]
    pub fn no_states() -> Self {
        Self::new(CODE_NO_STATES, "No states registered")
    }

    /// The container went away before a pending read resolved.
    #[must_use]
    pub fn dropped() -> Self {
        Self::new(CODE_DROPPED, "State dropped before the value resolved")
    }

    /// Machine-readable code.
    #[must_use]
    pub fn code(&self) -> &str {
        &self.code
    }

    /// Human-readable reason.
    #[must_use]
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Whether this error carries `code`.
    #[must_use]
    pub fn is(&self, code: &str) -> bool {
        self.code == code
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_code_and_reason() {
        let err = StateError::new("COMM", "controller offline");
        assert_eq!(err.to_string(), "controller offline (COMM)");
        assert_eq!(err.code(), "COMM");
        assert_eq!(err.reason(), "controller offline");
    }

    #[test]
    fn well_known_constructors_use_their_codes() {
        assert!(StateError::not_writable().is(CODE_NOT_WRITABLE));
        assert!(StateError::limited("too big").is(CODE_LIMITED));
        assert!(StateError::no_states().is(CODE_NO_STATES));
        assert!(StateError::dropped().is(CODE_DROPPED));
        assert_eq!(StateError::no_states().reason(), "No states registered");
    }

    #[test]
    fn owned_strings_are_accepted() {
        let reason = format!("value {} out of range", 12);
        let err = StateError::new(String::from("RNGE"), reason);
        assert_eq!(err.reason(), "value 12 out of range");
        assert_eq!(err.clone(), err);
    }
}
