//! Unity Addressables Core
//!
//! The asynchronous operation kernel behind the Addressables runtime:
//! reference-counted operations addressed by generational handles, deferred
//! and batched completion callbacks, dependency ordering and group
//! composition, all driven by a host tick on a single thread.
//!
//! # Key Features
//!
//! - **Explicit lifetimes**: manual reference counting with stale-handle
//!   detection; misuse is an error, never a crash
//! - **Deferred completion**: failures and late subscribers are dispatched in
//!   a batched flush on the next tick
//! - **Callback safety**: add/remove while invoking, panics caught and logged
//! - **Composition**: dependencies and group operations with fail-fast or
//!   collect-all policies
//!
//! # Quick Start
//!
//! ```rust
//! use std::time::Duration;
//! use unity_addressables_core::{AsyncOperation, Handle, OperationContext, ResourceManager};
//!
//! struct LoadText(&'static str);
//!
//! impl AsyncOperation for LoadText {
//!     type Output = String;
//!
//!     fn execute(&mut self, ctx: &OperationContext<'_, String>) {
//!         let _ = ctx.succeed(self.0.to_string());
//!     }
//! }
//!
//! let rm = ResourceManager::new();
//! let handle = rm.start_operation(LoadText("hello"), Handle::INVALID)?;
//! rm.update(Duration::from_millis(16));
//! assert_eq!(rm.result(handle)?, "hello");
//! rm.release(handle)?;
//! # Ok::<(), unity_addressables_core::AddressablesError>(())
//! ```

#[cfg(feature = "async")]
pub mod async_driver;
pub mod completed_operation;
pub mod config;
pub mod delegate_list;
pub mod diagnostics;
pub mod error;
pub mod group_operation;
pub mod handle;
pub mod metrics;
pub mod operation;
pub mod resource_manager;
pub mod scheduler;
pub mod task;

// Re-export main types
#[cfg(feature = "async")]
pub use async_driver::{drive_task, drive_until_done, drive_while};
pub use completed_operation::CompletedOperation;
pub use config::ResourceManagerConfig;
pub use delegate_list::{CallbackId, DelegateList};
pub use diagnostics::{DiagnosticEvent, DiagnosticEventType};
pub use error::{AddressablesError, OperationException, Result};
pub use group_operation::{FailurePolicy, GroupOperation, GroupOperationSettings};
pub use handle::{AsyncOperationHandle, Handle};
pub use metrics::{OperationStatistics, StatisticsSnapshot};
pub use operation::{AsyncOperation, AsyncOperationStatus, OperationContext};
pub use resource_manager::{
    CompletedCallback, DependencyStatus, DestroyedCallback, DiagnosticCallback,
    ExceptionHandler, ResourceManager, UpdateCallback,
};
pub use scheduler::{Action, ActionId, FlushReport, Scheduler};
pub use task::{OperationTask, TaskResult};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
