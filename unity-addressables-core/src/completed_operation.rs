//! Pre-completed operations
//!
//! Wrap an already known result (or failure) in an operation so callers can
//! treat it like any other handle.

use crate::error::{OperationException, Result};
use crate::handle::{AsyncOperationHandle, Handle};
use crate::operation::{AsyncOperation, OperationContext};
use crate::resource_manager::ResourceManager;

/// Operation that completes with a fixed outcome as soon as it runs
pub struct CompletedOperation<T> {
    result: Option<T>,
    error: Option<OperationException>,
}

impl<T> CompletedOperation<T> {
    /// Succeeds with `result` when `error` is `None`, fails otherwise
    pub fn new(result: T, error: Option<OperationException>) -> Self {
        Self {
            result: Some(result),
            error,
        }
    }
}

impl<T: 'static> AsyncOperation for CompletedOperation<T> {
    type Output = T;

    fn execute(&mut self, ctx: &OperationContext<'_, T>) {
        let Some(result) = self.result.take() else {
            return;
        };
        let error = self.error.take();
        let success = error.is_none();
        // Only fails if the handle went stale, in which case nobody is listening.
        let _ = ctx.complete(result, success, error);
    }

    fn debug_name(&self) -> String {
        "CompletedOperation".to_string()
    }
}

impl ResourceManager {
    /// Operation already completed with `result`. It succeeds if `error_msg`
    /// is empty and fails with that message otherwise.
    pub fn create_completed_operation<T: 'static>(
        &self,
        result: T,
        error_msg: &str,
    ) -> Result<AsyncOperationHandle<T>> {
        let error = (!error_msg.is_empty()).then(|| OperationException::new(error_msg));
        self.create_completed_operation_with_exception(result, error)
    }

    /// Operation already completed with `result`, failed when `exception` is set.
    pub fn create_completed_operation_with_exception<T: 'static>(
        &self,
        result: T,
        exception: Option<OperationException>,
    ) -> Result<AsyncOperationHandle<T>> {
        self.start_operation(CompletedOperation::new(result, exception), Handle::INVALID)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::AsyncOperationStatus;
    use std::time::Duration;

    #[test]
    fn test_empty_message_succeeds() {
        let rm = ResourceManager::new();
        let h = rm.create_completed_operation("catalog".to_string(), "").unwrap();
        assert_eq!(rm.result(h).unwrap(), "catalog");
        assert_eq!(rm.reference_count(h.typeless()).unwrap(), 1);
        assert_eq!(rm.debug_name(h.typeless()).unwrap(), "CompletedOperation");
    }

    #[test]
    fn test_message_fails() {
        let rm = ResourceManager::new();
        let h = rm.create_completed_operation(0u8, "no catalog").unwrap();
        let h = h.typeless();
        assert_eq!(rm.status(h).unwrap(), AsyncOperationStatus::Failed);
        assert_eq!(
            rm.operation_exception(h).unwrap().unwrap().message(),
            "no catalog"
        );
        // The start reference is held until the deferred flush.
        assert_eq!(rm.reference_count(h).unwrap(), 2);
        rm.update(Duration::ZERO);
        assert_eq!(rm.reference_count(h).unwrap(), 1);
    }
}
