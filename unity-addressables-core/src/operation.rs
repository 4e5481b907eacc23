//! Operation contract
//!
//! Work providers implement [`AsyncOperation`]. The manager owns the
//! implementation, decides when its work entry point may run (after its
//! dependency reached a terminal state) and tracks status, result, error and
//! reference count on its behalf. The implementation reports back through the
//! [`OperationContext`] it is handed.

use serde::{Deserialize, Serialize};
use std::any::TypeId;
use std::fmt;
use std::time::Duration;

use crate::error::{OperationException, Result};
use crate::handle::{AsyncOperationHandle, Handle};
use crate::resource_manager::ResourceManager;

/// Lifecycle status of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AsyncOperationStatus {
    /// Not finished yet
    #[default]
    None,
    /// Finished successfully (possibly with a silent failure attached)
    Succeeded,
    /// Finished with an error
    Failed,
}

impl AsyncOperationStatus {
    /// True for the terminal states
    pub fn is_done(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for AsyncOperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "None",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// A unit of asynchronous work driven by a [`ResourceManager`].
///
/// Only [`execute`](AsyncOperation::execute) is required. It runs once the
/// dependency passed to `start` is done (or immediately if there is none) and
/// must eventually lead to [`OperationContext::complete`], either directly or
/// from a callback, an update tick or an external caller.
pub trait AsyncOperation: 'static {
    /// Result type
    type Output: 'static;

    /// Work entry point.
    fn execute(&mut self, ctx: &OperationContext<'_, Self::Output>);

    /// Name used in logs, diagnostics and default error messages.
    fn debug_name(&self) -> String {
        short_type_name(std::any::type_name::<Self>()).to_string()
    }

    /// Progress while running, between 0.0 and 1.0.
    fn progress(&self, _rm: &ResourceManager) -> f32 {
        0.0
    }

    /// Handles this operation depends on, for reference-graph walks.
    fn dependencies(&self) -> Vec<Handle> {
        Vec::new()
    }

    /// Release references held on dependencies. Called when the operation
    /// fails with `release_dependencies_on_failure`.
    fn release_dependencies(&mut self, _rm: &ResourceManager) {}

    /// Called when the reference count reaches zero, before the slot is recycled.
    fn on_release(&mut self, _rm: &ResourceManager) {}

    /// Opt into per-tick [`update`](AsyncOperation::update) calls once the
    /// work entry point has run, until the operation completes.
    fn wants_updates(&self) -> bool {
        false
    }

    /// Per-tick hook for operations that poll for completion.
    fn update(&mut self, _ctx: &OperationContext<'_, Self::Output>, _delta: Duration) {}

    /// Called on every spin of `wait_for_completion` before the manager ticks,
    /// so the operation can drive its own dependencies synchronously.
    fn on_wait_for_completion(&mut self, _ctx: &OperationContext<'_, Self::Output>) {}
}

/// Access to the manager from inside an operation's hooks.
pub struct OperationContext<'a, T> {
    rm: &'a ResourceManager,
    handle: AsyncOperationHandle<T>,
}

impl<'a, T: 'static> OperationContext<'a, T> {
    pub(crate) fn new(rm: &'a ResourceManager, handle: Handle) -> Self {
        Self {
            rm,
            handle: handle.typed(),
        }
    }

    /// The manager running this operation
    pub fn manager(&self) -> &'a ResourceManager {
        self.rm
    }

    /// This operation's handle
    pub fn handle(&self) -> AsyncOperationHandle<T> {
        self.handle
    }

    /// Whether the operation already reached a terminal state
    pub fn is_done(&self) -> bool {
        self.rm.is_done(self.handle.typeless()).unwrap_or(true)
    }

    /// See [`ResourceManager::complete`]
    pub fn complete(
        &self,
        result: T,
        success: bool,
        error: Option<OperationException>,
    ) -> Result<()> {
        self.rm.complete(self.handle, result, success, error)
    }

    /// Complete with an error message; an empty message means no error.
    pub fn complete_with_message(&self, result: T, success: bool, message: &str) -> Result<()> {
        let error = (!message.is_empty()).then(|| OperationException::new(message));
        self.rm.complete(self.handle, result, success, error)
    }

    /// Complete successfully
    pub fn succeed(&self, result: T) -> Result<()> {
        self.complete(result, true, None)
    }

    /// Complete as failed
    pub fn fail(&self, result: T, error: OperationException) -> Result<()> {
        self.complete(result, false, Some(error))
    }
}

/// Object-safe view of an [`AsyncOperation`] stored by the manager.
pub(crate) trait ErasedOperation {
    fn execute(&mut self, rm: &ResourceManager, handle: Handle);
    fn update(&mut self, rm: &ResourceManager, handle: Handle, delta: Duration);
    fn on_wait_for_completion(&mut self, rm: &ResourceManager, handle: Handle);
    fn debug_name(&self) -> String;
    fn progress(&self, rm: &ResourceManager) -> f32;
    fn dependencies(&self) -> Vec<Handle>;
    fn release_dependencies(&mut self, rm: &ResourceManager);
    fn on_release(&mut self, rm: &ResourceManager);
    fn wants_updates(&self) -> bool;
}

impl<O: AsyncOperation> ErasedOperation for O {
    fn execute(&mut self, rm: &ResourceManager, handle: Handle) {
        AsyncOperation::execute(self, &OperationContext::new(rm, handle));
    }

    fn update(&mut self, rm: &ResourceManager, handle: Handle, delta: Duration) {
        AsyncOperation::update(self, &OperationContext::new(rm, handle), delta);
    }

    fn on_wait_for_completion(&mut self, rm: &ResourceManager, handle: Handle) {
        AsyncOperation::on_wait_for_completion(self, &OperationContext::new(rm, handle));
    }

    fn debug_name(&self) -> String {
        AsyncOperation::debug_name(self)
    }

    fn progress(&self, rm: &ResourceManager) -> f32 {
        AsyncOperation::progress(self, rm)
    }

    fn dependencies(&self) -> Vec<Handle> {
        AsyncOperation::dependencies(self)
    }

    fn release_dependencies(&mut self, rm: &ResourceManager) {
        AsyncOperation::release_dependencies(self, rm)
    }

    fn on_release(&mut self, rm: &ResourceManager) {
        AsyncOperation::on_release(self, rm)
    }

    fn wants_updates(&self) -> bool {
        AsyncOperation::wants_updates(self)
    }
}

/// Runtime type of an operation's output, checked when results are stored or read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct OutputType {
    pub id: TypeId,
    pub name: &'static str,
}

impl OutputType {
    pub fn of<T: 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }
}

/// Strip module paths and generic arguments: `a::b::Load<c::D>` -> `Load`.
pub(crate) fn short_type_name(full: &str) -> &str {
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}
