//! Unity Addressables
//!
//! A Rust implementation of the asynchronous operation kernel that underlies
//! the Unity Addressables runtime: reference-counted operations, deferred
//! completion callbacks, dependency ordering and group composition.
//!
//! The kernel lives in `unity-addressables-core`; this crate re-exports it and
//! adds a [`prelude`] for hosts.
//!
//! # Examples
//!
//! ```rust
//! use std::time::Duration;
//! use unity_addressables::prelude::*;
//!
//! let rm = ResourceManager::new();
//! let catalog = rm.create_completed_operation("catalog.json".to_string(), "")?;
//! let settings = rm.create_completed_operation(3u32, "")?;
//!
//! // The group takes over one reference on each child.
//! let init = rm.create_group_operation([catalog.typeless(), settings.typeless()], GroupOperationSettings::default())?;
//! rm.update(Duration::from_millis(16));
//!
//! assert_eq!(rm.status(init.typeless())?, AsyncOperationStatus::Succeeded);
//! rm.release(init)?;
//! assert_eq!(rm.operation_count(), 0);
//!
//! # Ok::<(), unity_addressables::AddressablesError>(())
//! ```

// Re-export from the core crate
pub use unity_addressables_core::{
    completed_operation, config, delegate_list, diagnostics, error, group_operation, handle,
    metrics, operation, resource_manager, scheduler, task, AddressablesError, AsyncOperation,
    AsyncOperationHandle, AsyncOperationStatus, CallbackId, CompletedOperation, DelegateList,
    DependencyStatus, DiagnosticEvent, DiagnosticEventType, FailurePolicy, FlushReport,
    GroupOperation, GroupOperationSettings, Handle, OperationContext, OperationException,
    OperationTask, ResourceManager, ResourceManagerConfig, Result, Scheduler,
    StatisticsSnapshot, TaskResult, VERSION,
};

#[cfg(feature = "async")]
pub use unity_addressables_core::{async_driver, drive_task, drive_until_done, drive_while};

/// Commonly used types for hosts and operation providers
pub mod prelude {
    pub use unity_addressables_core::{
        AddressablesError, AsyncOperation, AsyncOperationHandle, AsyncOperationStatus,
        FailurePolicy, GroupOperationSettings, Handle, OperationContext, OperationException,
        ResourceManager, ResourceManagerConfig,
    };

    #[cfg(feature = "async")]
    pub use unity_addressables_core::{drive_task, drive_until_done};
}
