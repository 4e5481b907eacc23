//! Resource manager
//!
//! Owns every operation in an arena of recyclable slots addressed by
//! generational [`Handle`]s and drives their lifecycle:
//!
//! - `start` takes a start-time reference and runs the work entry point now,
//!   or once the dependency completes (successfully or not);
//! - `complete` is the single transition into a terminal state. Successful
//!   operations invoke their completion callbacks immediately; failed ones are
//!   queued and their callbacks run at the next deferred flush;
//! - a callback added to an operation that is already done is always
//!   dispatched through the deferred queue, never inline;
//! - when the reference count returns to zero the destruction callbacks run,
//!   the operation's release hook runs and the slot is recycled with a new
//!   version, which invalidates outstanding handles.
//!
//! Everything happens on the thread that calls into the manager. No internal
//! borrow is held while user code (operations, callbacks, handlers) runs, so
//! that code may call back into the manager freely.

use std::any::{Any, TypeId};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::time::Duration;
use tracing::{debug, error, instrument, trace, warn};

use crate::config::ResourceManagerConfig;
use crate::delegate_list::{panic_message, CallbackId, DelegateList};
use crate::diagnostics::{DiagnosticEvent, DiagnosticEventType};
use crate::error::{AddressablesError, OperationException, Result};
use crate::handle::{AsyncOperationHandle, Handle};
use crate::metrics::{OperationStatistics, StatisticsSnapshot};
use crate::operation::{AsyncOperation, AsyncOperationStatus, ErasedOperation, OutputType};
use crate::scheduler::Scheduler;
use crate::task::OperationTask;

/// Completion listener
pub type CompletedCallback = dyn FnMut(&ResourceManager, Handle);
/// Destruction listener
pub type DestroyedCallback = dyn FnMut(&ResourceManager, Handle);
/// Per-tick listener receiving the tick delta
pub type UpdateCallback = dyn FnMut(&ResourceManager, Duration);
/// Diagnostic event observer
pub type DiagnosticCallback = dyn FnMut(&DiagnosticEvent);
/// Sink for operation exceptions
pub type ExceptionHandler = dyn FnMut(Handle, &OperationException);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingHook {
    ReleaseDependencies,
    Release,
}

struct OperationRecord {
    status: AsyncOperationStatus,
    result: Option<Box<dyn Any>>,
    error: Option<OperationException>,
    reference_count: u32,
    is_running: bool,
    has_executed: bool,
    holds_start_reference: bool,
    in_deferred_queue: bool,
    /// Destroyed while its behavior was checked out; vacated at check-in.
    retired: bool,
    output: OutputType,
    debug_name: String,
    completed: Rc<DelegateList<CompletedCallback>>,
    destroyed: Rc<DelegateList<DestroyedCallback>>,
    /// `None` while a hook of the operation is running.
    behavior: Option<Box<dyn ErasedOperation>>,
    pending_hooks: Vec<PendingHook>,
    update_subscription: Option<CallbackId>,
    cache_key: Option<String>,
}

impl OperationRecord {
    fn new(behavior: Box<dyn ErasedOperation>, output: OutputType, debug_name: String) -> Self {
        Self {
            status: AsyncOperationStatus::None,
            result: None,
            error: None,
            reference_count: 1,
            is_running: false,
            has_executed: false,
            holds_start_reference: false,
            in_deferred_queue: false,
            retired: false,
            output,
            debug_name,
            completed: Rc::new(DelegateList::new("completed")),
            destroyed: Rc::new(DelegateList::new("destroyed")),
            behavior: Some(behavior),
            pending_hooks: Vec::new(),
            update_subscription: None,
            cache_key: None,
        }
    }
}

struct Slot {
    version: u32,
    record: Option<OperationRecord>,
}

#[derive(Default)]
struct OperationArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl OperationArena {
    fn insert(&mut self, record: OperationRecord) -> Handle {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.record = Some(record);
            return Handle::new(index, slot.version);
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            version: 0,
            record: Some(record),
        });
        Handle::new(index, 0)
    }

    /// True if the handle names a slot this arena handed out at some point
    fn was_issued(&self, handle: Handle) -> bool {
        handle.is_valid()
            && self
                .slots
                .get(handle.index() as usize)
                .is_some_and(|slot| handle.version() <= slot.version)
    }

    fn record(&self, handle: Handle) -> Result<&OperationRecord> {
        match self.slots.get(handle.index() as usize) {
            Some(Slot {
                version,
                record: Some(record),
            }) if *version == handle.version() && !record.retired => Ok(record),
            _ => Err(AddressablesError::invalid_handle(handle)),
        }
    }

    fn record_mut(&mut self, handle: Handle) -> Result<&mut OperationRecord> {
        match self.slots.get_mut(handle.index() as usize) {
            Some(Slot {
                version,
                record: Some(record),
            }) if *version == handle.version() && !record.retired => Ok(record),
            _ => Err(AddressablesError::invalid_handle(handle)),
        }
    }

    /// Record at `index` regardless of version or retirement
    fn record_at_mut(&mut self, index: u32) -> Option<&mut OperationRecord> {
        self.slots.get_mut(index as usize)?.record.as_mut()
    }

    fn bump_version(&mut self, index: u32) {
        if let Some(slot) = self.slots.get_mut(index as usize) {
            slot.version = slot.version.wrapping_add(1);
        }
    }

    fn vacate(&mut self, index: u32) -> Option<OperationRecord> {
        let record = self.slots.get_mut(index as usize)?.record.take()?;
        self.free.push(index);
        self.live -= 1;
        Some(record)
    }
}

/// Aggregate completion state of an operation and everything it depends on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DependencyStatus {
    /// Operations in the graph, including the root
    pub total: usize,
    /// Of those, how many are done
    pub done: usize,
}

impl DependencyStatus {
    /// True when every operation in the graph is done
    pub fn is_done(&self) -> bool {
        self.done == self.total
    }

    /// Fraction of done operations
    pub fn percent(&self) -> f32 {
        if self.total == 0 {
            1.0
        } else {
            self.done as f32 / self.total as f32
        }
    }
}

/// Reference-counted async operation kernel.
pub struct ResourceManager {
    config: ResourceManagerConfig,
    operations: RefCell<OperationArena>,
    scheduler: Scheduler<ResourceManager>,
    update_callbacks: DelegateList<UpdateCallback>,
    diagnostic_callbacks: DelegateList<DiagnosticCallback>,
    exception_handler: RefCell<Option<Box<ExceptionHandler>>>,
    exception_handler_epoch: Cell<u64>,
    operation_cache: RefCell<HashMap<String, Handle>>,
    updating: Cell<bool>,
    statistics: OperationStatistics,
}

impl ResourceManager {
    /// Create a manager with default configuration
    pub fn new() -> Self {
        Self::build(ResourceManagerConfig::default())
    }

    /// Create a manager with a validated configuration
    pub fn with_config(config: ResourceManagerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: ResourceManagerConfig) -> Self {
        let exception_handler: Option<Box<ExceptionHandler>> = if config.log_operation_exceptions {
            Some(Box::new(|handle: Handle, exception: &OperationException| {
                error!(handle = ?handle, "{}", exception);
            }))
        } else {
            None
        };

        Self {
            scheduler: Scheduler::new(config.max_flush_passes),
            config,
            operations: RefCell::new(OperationArena::default()),
            update_callbacks: DelegateList::new("update"),
            diagnostic_callbacks: DelegateList::new("diagnostics"),
            exception_handler: RefCell::new(exception_handler),
            exception_handler_epoch: Cell::new(0),
            operation_cache: RefCell::new(HashMap::new()),
            updating: Cell::new(false),
            statistics: OperationStatistics::default(),
        }
    }

    /// Manager configuration
    pub fn config(&self) -> &ResourceManagerConfig {
        &self.config
    }

    /// The deferred action scheduler, for delayed actions and `wait`
    pub fn scheduler(&self) -> &Scheduler<ResourceManager> {
        &self.scheduler
    }

    /// Lifecycle counters
    pub fn statistics(&self) -> StatisticsSnapshot {
        self.statistics.snapshot()
    }

    /// Number of operations that have not been destroyed
    pub fn operation_count(&self) -> usize {
        self.operations.borrow().live
    }

    // ----------------------------------------------------------------------
    // Creation and start
    // ----------------------------------------------------------------------

    /// Allocate an operation with reference count 1. It does nothing until started.
    pub fn create_operation<O: AsyncOperation>(
        &self,
        operation: O,
    ) -> AsyncOperationHandle<O::Output> {
        let debug_name = AsyncOperation::debug_name(&operation);
        let record = OperationRecord::new(
            Box::new(operation),
            OutputType::of::<O::Output>(),
            debug_name,
        );
        let handle = self.operations.borrow_mut().insert(record);
        OperationStatistics::bump(&self.statistics.created);
        trace!(handle = ?handle, "operation created");
        handle.typed()
    }

    /// Create and start an operation in one step
    pub fn start_operation<O: AsyncOperation>(
        &self,
        operation: O,
        dependency: Handle,
    ) -> Result<AsyncOperationHandle<O::Output>> {
        let handle = self.create_operation(operation);
        self.start(handle.typeless(), dependency)?;
        Ok(handle)
    }

    /// Start a created operation.
    ///
    /// Takes a reference that is released when the operation completes. If
    /// `dependency` is invalid, stale or already done the work entry point
    /// runs before this returns; otherwise it runs when the dependency
    /// completes, whatever its outcome.
    #[instrument(level = "debug", skip(self))]
    pub fn start(&self, handle: Handle, dependency: Handle) -> Result<()> {
        let count = {
            let mut ops = self.operations.borrow_mut();
            let record = ops.record_mut(handle)?;
            if record.is_running || record.status.is_done() {
                return Err(AddressablesError::OperationBusy { handle });
            }
            if record.reference_count == 0 {
                return Err(AddressablesError::use_after_release(handle));
            }
            record.is_running = true;
            record.has_executed = false;
            record.holds_start_reference = true;
            record.reference_count += 1;
            record.reference_count
        };
        OperationStatistics::bump(&self.statistics.started);
        self.post_event(handle, DiagnosticEventType::AsyncOperationCreate, 0, None);
        self.post_event(handle, DiagnosticEventType::AsyncOperationPercentComplete, 0, None);
        self.post_event(
            handle,
            DiagnosticEventType::AsyncOperationReferenceCount,
            count as i32,
            None,
        );

        if dependency.is_valid() && matches!(self.is_done(dependency), Ok(false)) {
            debug!(handle = ?handle, dependency = ?dependency, "waiting on dependency");
            self.add_completed_callback(dependency, move |rm, _| {
                if let Err(e) = rm.invoke_execute(handle) {
                    warn!(handle = ?handle, "dependency completed but operation could not run: {}", e);
                }
            })?;
            Ok(())
        } else {
            self.invoke_execute(handle)
        }
    }

    /// Run the work entry point and subscribe update receivers.
    fn invoke_execute(&self, handle: Handle) -> Result<()> {
        let mut behavior = self.checkout(handle)?;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| behavior.execute(self, handle)));
        let wants_updates = behavior.wants_updates();
        self.checkin(handle.index(), behavior);

        if let Err(payload) = outcome {
            let message = panic_message(payload.as_ref());
            error!(handle = ?handle, "Exception thrown in operation execute: {}", message);
            let exception =
                OperationException::new(format!("Exception thrown in execute: {}", message));
            self.complete_erased(
                handle,
                None,
                false,
                Some(exception),
                self.config.release_dependencies_on_failure,
            )?;
        }

        let subscribe = {
            let mut ops = self.operations.borrow_mut();
            match ops.record_mut(handle) {
                Ok(record) => {
                    record.has_executed = true;
                    wants_updates
                        && !record.status.is_done()
                        && record.update_subscription.is_none()
                }
                Err(_) => false,
            }
        };
        if subscribe {
            let id = self
                .update_callbacks
                .add(Box::new(move |rm: &ResourceManager, delta: Duration| {
                    rm.update_operation(handle, delta)
                }));
            if let Ok(record) = self.operations.borrow_mut().record_mut(handle) {
                record.update_subscription = Some(id);
            }
        }
        Ok(())
    }

    fn update_operation(&self, handle: Handle, delta: Duration) {
        match self.checkout(handle) {
            Ok(mut behavior) => {
                let outcome =
                    panic::catch_unwind(AssertUnwindSafe(|| behavior.update(self, handle, delta)));
                self.checkin(handle.index(), behavior);
                if let Err(payload) = outcome {
                    error!(
                        handle = ?handle,
                        "Exception thrown in operation update: {}",
                        panic_message(payload.as_ref())
                    );
                }
            }
            Err(e) => trace!(handle = ?handle, "skipping update: {}", e),
        }
    }

    // ----------------------------------------------------------------------
    // Behavior check-out / check-in
    // ----------------------------------------------------------------------

    fn checkout(&self, handle: Handle) -> Result<Box<dyn ErasedOperation>> {
        let mut ops = self.operations.borrow_mut();
        ops.record_mut(handle)?
            .behavior
            .take()
            .ok_or(AddressablesError::OperationBusy { handle })
    }

    /// Return a behavior to its slot, running hooks queued while it was out.
    fn checkin(&self, index: u32, mut behavior: Box<dyn ErasedOperation>) {
        loop {
            let debug_name = behavior.debug_name();
            let hooks = {
                let mut ops = self.operations.borrow_mut();
                let Some(record) = ops.record_at_mut(index) else {
                    return;
                };
                if record.pending_hooks.is_empty() {
                    if record.retired {
                        let vacated = ops.vacate(index);
                        drop(ops);
                        drop(vacated);
                        drop(behavior);
                    } else {
                        record.debug_name = debug_name;
                        record.behavior = Some(behavior);
                    }
                    return;
                }
                std::mem::take(&mut record.pending_hooks)
            };
            for hook in hooks {
                self.run_hook(behavior.as_mut(), hook);
            }
        }
    }

    fn run_hook(&self, behavior: &mut dyn ErasedOperation, hook: PendingHook) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| match hook {
            PendingHook::ReleaseDependencies => behavior.release_dependencies(self),
            PendingHook::Release => behavior.on_release(self),
        }));
        if let Err(payload) = outcome {
            error!(hook = ?hook, "Exception thrown in operation hook: {}", panic_message(payload.as_ref()));
        }
    }

    /// Run `hook` now, or when the behavior is checked back in.
    fn run_or_defer_hook(&self, handle: Handle, hook: PendingHook) {
        let behavior = {
            let mut ops = self.operations.borrow_mut();
            let Ok(record) = ops.record_mut(handle) else {
                return;
            };
            match record.behavior.take() {
                Some(behavior) => behavior,
                None => {
                    record.pending_hooks.push(hook);
                    return;
                }
            }
        };
        let mut behavior = behavior;
        self.run_hook(behavior.as_mut(), hook);
        self.checkin(handle.index(), behavior);
    }

    // ----------------------------------------------------------------------
    // Completion
    // ----------------------------------------------------------------------

    /// Complete the operation, releasing dependencies on failure according to
    /// the configured default. See [`complete_with_options`](Self::complete_with_options).
    pub fn complete<T: 'static>(
        &self,
        handle: AsyncOperationHandle<T>,
        result: T,
        success: bool,
        error: Option<OperationException>,
    ) -> Result<()> {
        self.complete_with_options(
            handle,
            result,
            success,
            error,
            self.config.release_dependencies_on_failure,
        )
    }

    /// Move the operation into a terminal state. A no-op if it is already done.
    ///
    /// `success = true` with an error is a silent failure: listeners see a
    /// succeeded operation but the error still reaches the exception handler.
    /// On success the completion callbacks run now and the start-time
    /// reference is released; on failure both happen at the next deferred flush.
    pub fn complete_with_options<T: 'static>(
        &self,
        handle: AsyncOperationHandle<T>,
        result: T,
        success: bool,
        error: Option<OperationException>,
        release_dependencies_on_failure: bool,
    ) -> Result<()> {
        let handle = handle.typeless();
        {
            let ops = self.operations.borrow();
            let record = ops.record(handle)?;
            if record.output.id != TypeId::of::<T>() {
                return Err(AddressablesError::ResultTypeMismatch {
                    handle,
                    expected: record.output.name,
                });
            }
        }
        self.complete_erased(
            handle,
            Some(Box::new(result)),
            success,
            error,
            release_dependencies_on_failure,
        )
    }

    fn complete_erased(
        &self,
        handle: Handle,
        result: Option<Box<dyn Any>>,
        success: bool,
        error: Option<OperationException>,
        release_dependencies_on_failure: bool,
    ) -> Result<()> {
        let (update_subscription, error, held_start_reference, cache_key) = {
            let mut ops = self.operations.borrow_mut();
            let record = ops.record_mut(handle)?;
            if record.status.is_done() {
                return Ok(());
            }
            record.result = result;
            record.status = if success {
                AsyncOperationStatus::Succeeded
            } else {
                AsyncOperationStatus::Failed
            };
            record.is_running = false;

            let error = if !success || error.is_some() {
                Some(match error {
                    Some(e) if !e.message().is_empty() => e,
                    _ => OperationException::new(format!(
                        "Unknown error in AsyncOperation : {}",
                        record.debug_name
                    )),
                })
            } else {
                None
            };
            record.error = error.clone();
            (
                record.update_subscription.take(),
                error,
                std::mem::replace(&mut record.holds_start_reference, false),
                if success { None } else { record.cache_key.clone() },
            )
        };

        if let Some(id) = update_subscription {
            self.update_callbacks.remove(id);
        }
        self.post_event(handle, DiagnosticEventType::AsyncOperationPercentComplete, 1, None);
        self.post_event(handle, DiagnosticEventType::AsyncOperationComplete, 0, None);
        if let Some(exception) = &error {
            self.report_exception(handle, exception);
        }

        if success {
            OperationStatistics::bump(&self.statistics.succeeded);
            if error.is_some() {
                OperationStatistics::bump(&self.statistics.silent_failures);
            }
            debug!(handle = ?handle, silent_failure = error.is_some(), "operation succeeded");
            self.invoke_completion_event(handle);
            if held_start_reference {
                self.decrement_reference_count(handle)?;
            }
        } else {
            OperationStatistics::bump(&self.statistics.failed);
            debug!(handle = ?handle, "operation failed");
            if release_dependencies_on_failure {
                self.run_or_defer_hook(handle, PendingHook::ReleaseDependencies);
            }
            self.post_event(
                handle,
                DiagnosticEventType::AsyncOperationFail,
                0,
                error.as_ref().map(|e| e.to_string()),
            );
            if let Some(key) = cache_key {
                self.evict_cached(&key, handle);
            }
            // The start-time reference, if any, is released by the deferred flush.
            self.register_to_complete_list(handle, !held_start_reference);
        }
        Ok(())
    }

    /// Queue the operation's completion callbacks for the next flush, once.
    fn register_to_complete_list(&self, handle: Handle, increment_reference_count: bool) {
        let count = {
            let mut ops = self.operations.borrow_mut();
            let Ok(record) = ops.record_mut(handle) else {
                return;
            };
            if !record.status.is_done() || record.in_deferred_queue || record.reference_count == 0
            {
                return;
            }
            record.in_deferred_queue = true;
            if increment_reference_count {
                record.reference_count += 1;
            }
            record.reference_count
        };
        if increment_reference_count {
            self.post_event(
                handle,
                DiagnosticEventType::AsyncOperationReferenceCount,
                count as i32,
                None,
            );
        }
        self.scheduler.add_action(
            Duration::ZERO,
            Box::new(move |rm: &ResourceManager| rm.execute_deferred_completion(handle)),
        );
    }

    fn execute_deferred_completion(&self, handle: Handle) {
        OperationStatistics::bump(&self.statistics.deferred_callbacks);
        self.invoke_completion_event(handle);
        if let Ok(record) = self.operations.borrow_mut().record_mut(handle) {
            record.in_deferred_queue = false;
        }
        if let Err(e) = self.decrement_reference_count(handle) {
            error!(handle = ?handle, "deferred completion could not release its reference: {}", e);
        }
    }

    fn invoke_completion_event(&self, handle: Handle) {
        let list = match self.operations.borrow().record(handle) {
            Ok(record) => record.completed.clone(),
            Err(_) => return,
        };
        list.invoke_with(|callback| callback(self, handle));
        list.clear();
    }

    // ----------------------------------------------------------------------
    // Listeners
    // ----------------------------------------------------------------------

    /// Subscribe to completion. If the operation is already done the callback
    /// runs at the next deferred flush.
    pub fn add_completed_callback(
        &self,
        handle: Handle,
        callback: impl FnMut(&ResourceManager, Handle) + 'static,
    ) -> Result<CallbackId> {
        let list = self.operations.borrow().record(handle)?.completed.clone();
        let id = list.add(Box::new(callback));
        self.register_to_complete_list(handle, true);
        Ok(id)
    }

    /// Typed form of [`add_completed_callback`](Self::add_completed_callback)
    pub fn on_completed<T: 'static>(
        &self,
        handle: AsyncOperationHandle<T>,
        mut callback: impl FnMut(&ResourceManager, AsyncOperationHandle<T>) + 'static,
    ) -> Result<CallbackId> {
        self.add_completed_callback(handle.typeless(), move |rm, h| callback(rm, h.typed()))
    }

    /// Unsubscribe a completion callback. Returns false if it was not subscribed.
    pub fn remove_completed_callback(&self, handle: Handle, id: CallbackId) -> Result<bool> {
        let list = self.operations.borrow().record(handle)?.completed.clone();
        Ok(list.remove(id))
    }

    /// Subscribe to destruction (reference count reaching zero)
    pub fn add_destroyed_callback(
        &self,
        handle: Handle,
        callback: impl FnMut(&ResourceManager, Handle) + 'static,
    ) -> Result<CallbackId> {
        let list = self.operations.borrow().record(handle)?.destroyed.clone();
        Ok(list.add(Box::new(callback)))
    }

    /// Unsubscribe a destruction callback
    pub fn remove_destroyed_callback(&self, handle: Handle, id: CallbackId) -> Result<bool> {
        let list = self.operations.borrow().record(handle)?.destroyed.clone();
        Ok(list.remove(id))
    }

    /// Future resolving once the operation's completion callbacks are dispatched
    pub fn task<T: Clone + 'static>(
        &self,
        handle: AsyncOperationHandle<T>,
    ) -> Result<OperationTask<T>> {
        let (sender, task) = OperationTask::channel();
        let mut sender = Some(sender);
        self.on_completed(handle, move |rm, h| {
            let Some(sender) = sender.take() else {
                return;
            };
            let outcome = match rm.status(h.typeless()) {
                Ok(AsyncOperationStatus::Succeeded) => rm
                    .result(h)
                    .map_err(|e| OperationException::new(e.to_string())),
                _ => Err(rm
                    .operation_exception(h.typeless())
                    .ok()
                    .flatten()
                    .unwrap_or_else(|| OperationException::new("Operation failed"))),
            };
            // The receiver may have been dropped; nobody is waiting then.
            let _ = sender.send(outcome);
        })?;
        Ok(task)
    }

    // ----------------------------------------------------------------------
    // Reference counting
    // ----------------------------------------------------------------------

    /// Add a reference. Fails if the operation was already destroyed.
    pub fn increment_reference_count(&self, handle: Handle) -> Result<()> {
        let count = {
            let mut ops = self.operations.borrow_mut();
            let issued = ops.was_issued(handle);
            let record = match ops.record_mut(handle) {
                Ok(record) if record.reference_count > 0 => record,
                _ if issued => return Err(AddressablesError::use_after_release(handle)),
                _ => return Err(AddressablesError::invalid_handle(handle)),
            };
            record.reference_count += 1;
            record.reference_count
        };
        self.post_event(
            handle,
            DiagnosticEventType::AsyncOperationReferenceCount,
            count as i32,
            None,
        );
        Ok(())
    }

    /// Drop a reference. Reaching zero destroys the operation.
    pub fn decrement_reference_count(&self, handle: Handle) -> Result<()> {
        let count = {
            let mut ops = self.operations.borrow_mut();
            let issued = ops.was_issued(handle);
            let record = match ops.record_mut(handle) {
                Ok(record) if record.reference_count > 0 => record,
                _ if issued => return Err(AddressablesError::underflow(handle)),
                _ => return Err(AddressablesError::invalid_handle(handle)),
            };
            record.reference_count -= 1;
            record.reference_count
        };
        self.post_event(
            handle,
            DiagnosticEventType::AsyncOperationReferenceCount,
            count as i32,
            None,
        );
        if count == 0 {
            self.destroy(handle);
        }
        Ok(())
    }

    /// Alias for [`decrement_reference_count`](Self::decrement_reference_count)
    pub fn release(&self, handle: impl Into<Handle>) -> Result<()> {
        self.decrement_reference_count(handle.into())
    }

    fn destroy(&self, handle: Handle) {
        self.post_event(handle, DiagnosticEventType::AsyncOperationDestroy, 0, None);
        OperationStatistics::bump(&self.statistics.destroyed);
        debug!(handle = ?handle, "operation destroyed");

        let (destroyed, cache_key, update_subscription) = {
            let mut ops = self.operations.borrow_mut();
            let Ok(record) = ops.record_mut(handle) else {
                return;
            };
            (
                record.destroyed.clone(),
                record.cache_key.take(),
                record.update_subscription.take(),
            )
        };
        if let Some(id) = update_subscription {
            self.update_callbacks.remove(id);
        }
        destroyed.invoke_with(|callback| callback(self, handle));
        destroyed.clear();
        if let Some(key) = cache_key {
            self.evict_cached(&key, handle);
        }

        let (behavior, released) = {
            let mut ops = self.operations.borrow_mut();
            let Ok(record) = ops.record_mut(handle) else {
                return;
            };
            record.retired = true;
            record.pending_hooks.push(PendingHook::Release);
            let released = (record.result.take(), record.error.take());
            record.status = AsyncOperationStatus::None;
            let behavior = record.behavior.take();
            ops.bump_version(handle.index());
            (behavior, released)
        };
        drop(released);
        // A checked-out behavior runs the release hook when its holder checks it in.
        if let Some(behavior) = behavior {
            self.checkin(handle.index(), behavior);
        }
    }

    // ----------------------------------------------------------------------
    // Queries
    // ----------------------------------------------------------------------

    /// True if the handle names a live operation at its current version
    pub fn is_valid(&self, handle: impl Into<Handle>) -> bool {
        self.operations.borrow().record(handle.into()).is_ok()
    }

    /// Current status
    pub fn status(&self, handle: Handle) -> Result<AsyncOperationStatus> {
        Ok(self.operations.borrow().record(handle)?.status)
    }

    /// True once the status is Succeeded or Failed
    pub fn is_done(&self, handle: Handle) -> Result<bool> {
        Ok(self.status(handle)?.is_done())
    }

    /// True between `start` and `complete`
    pub fn is_running(&self, handle: Handle) -> Result<bool> {
        Ok(self.operations.borrow().record(handle)?.is_running)
    }

    /// True once the work entry point ran
    pub fn has_executed(&self, handle: Handle) -> Result<bool> {
        Ok(self.operations.borrow().record(handle)?.has_executed)
    }

    /// True while completion callbacks are queued for the next flush
    pub fn has_pending_completion(&self, handle: Handle) -> Result<bool> {
        Ok(self.operations.borrow().record(handle)?.in_deferred_queue)
    }

    /// Current reference count
    pub fn reference_count(&self, handle: Handle) -> Result<u32> {
        Ok(self.operations.borrow().record(handle)?.reference_count)
    }

    /// Failure payload, set on failure or silent failure
    pub fn operation_exception(&self, handle: Handle) -> Result<Option<OperationException>> {
        Ok(self.operations.borrow().record(handle)?.error.clone())
    }

    /// Debug name of the operation
    pub fn debug_name(&self, handle: Handle) -> Result<String> {
        Ok(self.operations.borrow().record(handle)?.debug_name.clone())
    }

    /// Result of a succeeded operation
    pub fn result<T: Clone + 'static>(&self, handle: AsyncOperationHandle<T>) -> Result<T> {
        let handle = handle.typeless();
        let ops = self.operations.borrow();
        let record = ops.record(handle)?;
        if record.status != AsyncOperationStatus::Succeeded {
            return Err(AddressablesError::ResultUnavailable {
                handle,
                status: record.status.to_string(),
            });
        }
        let Some(result) = record.result.as_ref() else {
            return Err(AddressablesError::ResultUnavailable {
                handle,
                status: record.status.to_string(),
            });
        };
        result
            .downcast_ref::<T>()
            .cloned()
            .ok_or(AddressablesError::ResultTypeMismatch {
                handle,
                expected: record.output.name,
            })
    }

    /// Progress between 0.0 and 1.0; 1.0 once done
    pub fn percent_complete(&self, handle: Handle) -> Result<f32> {
        if self.is_done(handle)? {
            return Ok(1.0);
        }
        let Ok(behavior) = self.checkout(handle) else {
            return Ok(0.0);
        };
        let progress = panic::catch_unwind(AssertUnwindSafe(|| behavior.progress(self)))
            .unwrap_or(0.0);
        self.checkin(handle.index(), behavior);
        Ok(progress.clamp(0.0, 1.0))
    }

    /// Direct dependencies reported by the operation
    pub fn dependencies(&self, handle: Handle) -> Result<Vec<Handle>> {
        let behavior = self.checkout(handle)?;
        let dependencies = behavior.dependencies();
        self.checkin(handle.index(), behavior);
        Ok(dependencies)
    }

    /// Every operation reachable through dependencies, excluding `handle`
    /// itself, in discovery order. Cycles are visited once.
    pub fn dependency_closure(&self, handle: Handle) -> Result<Vec<Handle>> {
        let mut visited = HashSet::from([handle]);
        let mut order = Vec::new();
        let mut stack = self.dependencies(handle)?;
        stack.reverse();
        while let Some(next) = stack.pop() {
            if !visited.insert(next) {
                continue;
            }
            order.push(next);
            if let Ok(mut children) = self.dependencies(next) {
                children.reverse();
                stack.extend(children);
            }
        }
        Ok(order)
    }

    /// Completion state of `handle` and its dependency graph
    pub fn dependency_status(&self, handle: Handle) -> Result<DependencyStatus> {
        let mut status = DependencyStatus {
            total: 1,
            done: usize::from(self.is_done(handle)?),
        };
        for dependency in self.dependency_closure(handle)? {
            status.total += 1;
            // Released dependencies count as finished.
            if self.is_done(dependency).unwrap_or(true) {
                status.done += 1;
            }
        }
        Ok(status)
    }

    // ----------------------------------------------------------------------
    // Driving
    // ----------------------------------------------------------------------

    /// One host tick: run update receivers, then flush deferred work until
    /// quiescent. Ignored when called from inside a tick.
    pub fn update(&self, delta: Duration) {
        if self.updating.replace(true) {
            trace!("update ignored: already inside a tick");
            return;
        }
        self.update_callbacks.invoke_with(|callback| callback(self, delta));
        let report = self.scheduler.tick(self, delta);
        OperationStatistics::add(&self.statistics.flush_passes, report.passes as u64);
        self.updating.set(false);
    }

    /// Block until the operation is done by pumping [`update`](Self::update).
    ///
    /// Fails with `SynchronousWaitUnsupported` on hosts configured without
    /// blocking waits, and with `WaitStalled` once `max_wait_spins` is used up.
    /// Called from inside a tick it cannot pump, so an operation the hook did
    /// not finish fails with `ReentrantWait`.
    #[instrument(level = "debug", skip(self))]
    pub fn wait_for_completion(&self, handle: Handle) -> Result<()> {
        if !self.config.synchronous_wait_supported {
            return Err(AddressablesError::synchronous_wait_unsupported(
                self.config.platform.clone(),
            ));
        }
        if !self.is_valid(handle) {
            return Err(AddressablesError::invalid_handle(handle));
        }

        let mut spins = 0usize;
        loop {
            let state = {
                let ops = self.operations.borrow();
                ops.record(handle)
                    .map(|record| (record.status.is_done(), record.in_deferred_queue))
            };
            match state {
                // Released while we were pumping: it finished.
                Err(_) => return Ok(()),
                Ok((true, queued)) => {
                    if queued && !self.updating.get() {
                        self.update(Duration::ZERO);
                    }
                    return Ok(());
                }
                Ok((false, _)) => {
                    if let Ok(mut behavior) = self.checkout(handle) {
                        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                            behavior.on_wait_for_completion(self, handle)
                        }));
                        self.checkin(handle.index(), behavior);
                        if let Err(payload) = outcome {
                            error!(
                                handle = ?handle,
                                "Exception thrown while waiting: {}",
                                panic_message(payload.as_ref())
                            );
                        }
                    }
                }
            }

            if self.is_done(handle).unwrap_or(true) {
                continue;
            }
            if self.updating.get() {
                warn!(handle = ?handle, "wait_for_completion called from inside a tick");
                return Err(AddressablesError::ReentrantWait { handle });
            }
            self.update(Duration::ZERO);
            spins += 1;
            if self.config.max_wait_spins.is_some_and(|limit| spins >= limit)
                && !self.is_done(handle).unwrap_or(true)
            {
                warn!(handle = ?handle, spins, "wait_for_completion stalled");
                return Err(AddressablesError::WaitStalled { spins });
            }
        }
    }

    // ----------------------------------------------------------------------
    // Operation cache
    // ----------------------------------------------------------------------

    /// Start an operation shared under `key`. While a live operation is cached
    /// under the key it is returned with an extra reference instead.
    pub fn start_cached_operation<O: AsyncOperation>(
        &self,
        key: impl Into<String>,
        operation: O,
        dependency: Handle,
    ) -> Result<AsyncOperationHandle<O::Output>> {
        let key = key.into();
        let cached = self.operation_cache.borrow().get(&key).copied();
        if let Some(existing) = cached {
            if self.is_valid(existing) {
                let output = self.operations.borrow().record(existing)?.output;
                if output != OutputType::of::<O::Output>() {
                    return Err(AddressablesError::ResultTypeMismatch {
                        handle: existing,
                        expected: output.name,
                    });
                }
                self.increment_reference_count(existing)?;
                debug!(key = %key, handle = ?existing, "operation cache hit");
                return Ok(existing.typed());
            }
            self.operation_cache.borrow_mut().remove(&key);
        }

        let handle = self.create_operation(operation);
        if let Ok(record) = self.operations.borrow_mut().record_mut(handle.typeless()) {
            record.cache_key = Some(key.clone());
        }
        self.operation_cache
            .borrow_mut()
            .insert(key, handle.typeless());
        self.start(handle.typeless(), dependency)?;
        Ok(handle)
    }

    /// Live operation cached under `key`
    pub fn cached_operation(&self, key: &str) -> Option<Handle> {
        let cached = self.operation_cache.borrow().get(key).copied()?;
        self.is_valid(cached).then_some(cached)
    }

    fn evict_cached(&self, key: &str, handle: Handle) {
        let mut cache = self.operation_cache.borrow_mut();
        if cache.get(key) == Some(&handle) {
            cache.remove(key);
            trace!(key, handle = ?handle, "evicted cached operation");
        }
    }

    // ----------------------------------------------------------------------
    // Diagnostics and exceptions
    // ----------------------------------------------------------------------

    /// Replace the exception handler
    pub fn set_exception_handler(
        &self,
        handler: impl FnMut(Handle, &OperationException) + 'static,
    ) {
        self.replace_exception_handler(Some(Box::new(handler)));
    }

    /// Remove the exception handler; operation exceptions are then dropped.
    pub fn clear_exception_handler(&self) {
        self.replace_exception_handler(None);
    }

    fn replace_exception_handler(&self, handler: Option<Box<ExceptionHandler>>) {
        *self.exception_handler.borrow_mut() = handler;
        self.exception_handler_epoch
            .set(self.exception_handler_epoch.get() + 1);
    }

    fn report_exception(&self, handle: Handle, exception: &OperationException) {
        let epoch = self.exception_handler_epoch.get();
        let handler = self.exception_handler.borrow_mut().take();
        let Some(mut handler) = handler else {
            return;
        };
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(handle, exception)));
        if self.exception_handler_epoch.get() == epoch {
            *self.exception_handler.borrow_mut() = Some(handler);
        }
        if let Err(payload) = outcome {
            error!("Exception thrown in exception handler: {}", panic_message(payload.as_ref()));
        }
    }

    /// Observe diagnostic events (only posted with `post_profiler_events`)
    pub fn register_diagnostic_callback(
        &self,
        callback: impl FnMut(&DiagnosticEvent) + 'static,
    ) -> CallbackId {
        self.diagnostic_callbacks.add(Box::new(callback))
    }

    /// Stop observing diagnostic events
    pub fn unregister_diagnostic_callback(&self, id: CallbackId) -> bool {
        self.diagnostic_callbacks.remove(id)
    }

    fn post_event(
        &self,
        handle: Handle,
        kind: DiagnosticEventType,
        value: i32,
        context: Option<String>,
    ) {
        if !self.config.post_profiler_events || self.diagnostic_callbacks.is_empty() {
            return;
        }
        let debug_name = self
            .operations
            .borrow()
            .record(handle)
            .map(|record| record.debug_name.clone())
            .unwrap_or_default();
        let event = DiagnosticEvent {
            handle,
            debug_name,
            kind,
            value,
            context,
            time: self.scheduler.now(),
        };
        self.diagnostic_callbacks.invoke_with(|callback| callback(&event));
    }
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceManager")
            .field("platform", &self.config.platform)
            .field("operations", &self.operation_count())
            .field("scheduler", &self.scheduler)
            .field("update_receivers", &self.update_callbacks.len())
            .finish()
    }
}
