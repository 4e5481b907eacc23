//! Error handling system
//!
//! Errors raised by the operation kernel. Lifecycle misuse (reference count
//! underflow, use after release, stale handles) is reported through
//! [`AddressablesError`] instead of panicking, and operation failures carry an
//! [`OperationException`] payload that is shared with listeners and handlers.

use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::handle::Handle;

/// Result type for kernel operations
pub type Result<T> = std::result::Result<T, AddressablesError>;

/// Failure payload attached to an operation that failed (or failed silently).
///
/// Cloning is cheap: the optional inner exception is shared.
#[derive(Error, Debug, Clone, PartialEq)]
pub struct OperationException {
    message: String,
    #[source]
    inner: Option<Arc<OperationException>>,
}

impl OperationException {
    /// Create an exception with a message
    pub fn new<S: Into<String>>(message: S) -> Self {
        Self {
            message: message.into(),
            inner: None,
        }
    }

    /// Create an exception wrapping the exception that caused it
    pub fn with_inner<S: Into<String>>(message: S, inner: OperationException) -> Self {
        Self {
            message: message.into(),
            inner: Some(Arc::new(inner)),
        }
    }

    /// Exception message
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The exception this one wraps, if any
    pub fn inner(&self) -> Option<&OperationException> {
        self.inner.as_deref()
    }

    /// Walk the exception chain from outermost to innermost
    pub fn chain(&self) -> impl Iterator<Item = &OperationException> {
        std::iter::successors(Some(self), |e| e.inner())
    }
}

impl fmt::Display for OperationException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            Some(inner) => write!(f, "{}, inner: {}", self.message, inner),
            None => f.write_str(&self.message),
        }
    }
}

/// Main error type for the operation kernel
#[derive(Error, Debug, Clone)]
pub enum AddressablesError {
    #[error("Invalid handle: {handle:?} does not refer to an operation")]
    InvalidHandle { handle: Handle },

    #[error("Cannot increment reference count on operation {handle:?} because it has already been destroyed")]
    UseAfterRelease { handle: Handle },

    #[error("Cannot decrement reference count for operation {handle:?} because it is already 0")]
    ReferenceCountUnderflow { handle: Handle },

    #[error("Result type mismatch for {handle:?}: expected {expected}")]
    ResultTypeMismatch {
        handle: Handle,
        expected: &'static str,
    },

    #[error("Result of {handle:?} is not available (status: {status})")]
    ResultUnavailable { handle: Handle, status: String },

    #[error("Operation {handle:?} is busy executing and cannot be re-entered")]
    OperationBusy { handle: Handle },

    #[error("{platform} does not support synchronous loading. Please do not use wait_for_completion on the {platform} platform.")]
    SynchronousWaitUnsupported { platform: String },

    #[error("wait_for_completion on {handle:?} was called from inside an update and cannot make progress")]
    ReentrantWait { handle: Handle },

    #[error("wait_for_completion gave up after {spins} spins without the operation finishing")]
    WaitStalled { spins: usize },

    #[error("Operation failed: {0}")]
    Operation(#[from] OperationException),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl AddressablesError {
    /// Create an invalid handle error
    pub fn invalid_handle(handle: Handle) -> Self {
        Self::InvalidHandle { handle }
    }

    /// Create a use-after-release error
    pub fn use_after_release(handle: Handle) -> Self {
        Self::UseAfterRelease { handle }
    }

    /// Create a reference count underflow error
    pub fn underflow(handle: Handle) -> Self {
        Self::ReferenceCountUnderflow { handle }
    }

    /// Create a synchronous wait error for a platform
    pub fn synchronous_wait_unsupported<S: Into<String>>(platform: S) -> Self {
        Self::SynchronousWaitUnsupported {
            platform: platform.into(),
        }
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config(message.into())
    }

    /// Check if this error is a violation of the handle/reference-count contract
    pub fn is_programming_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidHandle { .. }
                | Self::UseAfterRelease { .. }
                | Self::ReferenceCountUnderflow { .. }
                | Self::ResultTypeMismatch { .. }
                | Self::OperationBusy { .. }
                | Self::ReentrantWait { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_exception_chain() {
        let root = OperationException::new("bundle missing");
        let outer = OperationException::with_inner("group failed", root.clone());

        let messages: Vec<_> = outer.chain().map(|e| e.message().to_string()).collect();
        assert_eq!(messages, vec!["group failed", "bundle missing"]);
        assert_eq!(outer.inner(), Some(&root));
        assert!(outer.source().is_some());
        assert_eq!(outer.to_string(), "group failed, inner: bundle missing");
    }

    #[test]
    fn test_error_classification() {
        let h = Handle::default();
        assert!(AddressablesError::underflow(h).is_programming_error());
        assert!(AddressablesError::use_after_release(h).is_programming_error());
        assert!(AddressablesError::ReentrantWait { handle: h }.is_programming_error());
        assert!(!AddressablesError::synchronous_wait_unsupported("WebGL").is_programming_error());
        assert!(!AddressablesError::from(OperationException::new("x")).is_programming_error());
    }

    #[test]
    fn test_error_display() {
        let err = AddressablesError::synchronous_wait_unsupported("WebGL");
        let msg = format!("{}", err);
        assert!(msg.contains("WebGL does not support synchronous loading"));
    }
}
