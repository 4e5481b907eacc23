//! Operation lifecycle tests
//!
//! Status transitions, reference counting, completion callback timing,
//! dependency ordering and failure routing through the public manager API.

use proptest::prelude::*;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;
use unity_addressables_core::{
    AddressablesError, AsyncOperation, AsyncOperationStatus, DiagnosticEventType, Handle,
    OperationContext, OperationException, ResourceManager, ResourceManagerConfig,
};

/// Completed from the outside by the test
struct Pending;

impl AsyncOperation for Pending {
    type Output = u32;

    fn execute(&mut self, _ctx: &OperationContext<'_, u32>) {}
}

/// Records whether its work entry point ran
struct Tracked {
    executed: Rc<Cell<bool>>,
}

impl AsyncOperation for Tracked {
    type Output = ();

    fn execute(&mut self, ctx: &OperationContext<'_, ()>) {
        self.executed.set(true);
        ctx.succeed(()).unwrap();
    }
}

/// Counts release hook invocations
struct ReleaseCounter {
    released: Rc<Cell<u32>>,
}

impl AsyncOperation for ReleaseCounter {
    type Output = u32;

    fn execute(&mut self, _ctx: &OperationContext<'_, u32>) {}

    fn on_release(&mut self, _rm: &ResourceManager) {
        self.released.set(self.released.get() + 1);
    }
}

fn counter() -> (Rc<Cell<u32>>, impl FnMut(&ResourceManager, Handle) + 'static) {
    let count = Rc::new(Cell::new(0));
    let c = count.clone();
    (count, move |_: &ResourceManager, _: Handle| c.set(c.get() + 1))
}

/// Test that IsDone follows the status
#[test]
fn test_is_done_tracks_status() {
    let rm = ResourceManager::new();

    let ok = rm.start_operation(Pending, Handle::INVALID).unwrap();
    let bad = rm.start_operation(Pending, Handle::INVALID).unwrap();
    for h in [ok, bad] {
        assert_eq!(rm.status(h.typeless()).unwrap(), AsyncOperationStatus::None);
        assert!(!rm.is_done(h.typeless()).unwrap());
        assert!(rm.is_running(h.typeless()).unwrap());
    }

    rm.complete(ok, 1, true, None).unwrap();
    rm.complete(bad, 0, false, Some(OperationException::new("boom")))
        .unwrap();

    assert_eq!(rm.status(ok.typeless()).unwrap(), AsyncOperationStatus::Succeeded);
    assert_eq!(rm.status(bad.typeless()).unwrap(), AsyncOperationStatus::Failed);
    assert!(rm.is_done(ok.typeless()).unwrap());
    assert!(rm.is_done(bad.typeless()).unwrap());
    assert!(!rm.is_running(bad.typeless()).unwrap());
}

/// Test reference count errors on destroyed operations
#[test]
fn test_reference_count_misuse_is_an_error() {
    let rm = ResourceManager::new();
    let h = rm.create_operation(Pending).typeless();
    assert_eq!(rm.reference_count(h).unwrap(), 1);

    rm.decrement_reference_count(h).unwrap();
    assert!(!rm.is_valid(h));

    let err = rm.decrement_reference_count(h).unwrap_err();
    assert!(matches!(err, AddressablesError::ReferenceCountUnderflow { .. }));
    assert!(err.is_programming_error());

    let err = rm.increment_reference_count(h).unwrap_err();
    assert!(matches!(err, AddressablesError::UseAfterRelease { .. }));

    let err = rm.decrement_reference_count(Handle::INVALID).unwrap_err();
    assert!(matches!(err, AddressablesError::InvalidHandle { .. }));
}

/// Test that a stale handle cannot touch the operation recycled into its slot
#[test]
fn test_stale_handle_does_not_affect_new_operation() {
    let rm = ResourceManager::new();
    let old = rm.create_operation(Pending).typeless();
    rm.release(old).unwrap();

    let new = rm.create_operation(Pending).typeless();
    assert_eq!(old.index(), new.index());

    assert!(rm.release(old).is_err());
    assert!(rm.is_valid(new));
    assert_eq!(rm.reference_count(new).unwrap(), 1);
}

proptest! {
    /// Balanced increment/decrement sequences destroy exactly once at zero
    #[test]
    fn prop_reference_count_returns_to_zero(steps in prop::collection::vec(any::<bool>(), 0..64)) {
        let rm = ResourceManager::new();
        let h = rm.create_operation(Pending).typeless();
        let (destroyed, on_destroyed) = counter();
        rm.add_destroyed_callback(h, on_destroyed).unwrap();

        let mut expected = 1u32;
        for increment in steps {
            if increment || expected == 1 {
                rm.increment_reference_count(h).unwrap();
                expected += 1;
            } else {
                rm.decrement_reference_count(h).unwrap();
                expected -= 1;
            }
            prop_assert_eq!(rm.reference_count(h).unwrap(), expected);
            prop_assert_eq!(destroyed.get(), 0);
        }

        while expected > 0 {
            rm.decrement_reference_count(h).unwrap();
            expected -= 1;
        }
        prop_assert_eq!(destroyed.get(), 1);
        prop_assert!(!rm.is_valid(h));
        prop_assert!(rm.decrement_reference_count(h).is_err());
        prop_assert!(rm.increment_reference_count(h).is_err());
        prop_assert_eq!(destroyed.get(), 1);
    }
}

/// Test that listeners registered before success fire inline
#[test]
fn test_success_callbacks_fire_inline_in_subscription_order() {
    let rm = ResourceManager::new();
    let h = rm.start_operation(Pending, Handle::INVALID).unwrap();
    let order = Rc::new(RefCell::new(Vec::new()));

    for tag in ["first", "second", "third"] {
        let order = order.clone();
        rm.add_completed_callback(h.typeless(), move |_, _| order.borrow_mut().push(tag))
            .unwrap();
    }

    rm.complete(h, 7, true, None).unwrap();
    assert_eq!(*order.borrow(), vec!["first", "second", "third"]);

    rm.update(Duration::ZERO);
    assert_eq!(order.borrow().len(), 3);
    assert_eq!(rm.reference_count(h.typeless()).unwrap(), 1);
}

/// Test that failure callbacks wait for the deferred flush
#[test]
fn test_failure_callbacks_are_deferred() {
    let rm = ResourceManager::new();
    let h = rm.start_operation(Pending, Handle::INVALID).unwrap().typeless();
    let (fired, callback) = counter();
    rm.add_completed_callback(h, callback).unwrap();

    rm.complete(h.typed::<u32>(), 0, false, Some(OperationException::new("offline")))
        .unwrap();
    assert_eq!(fired.get(), 0);
    assert!(rm.has_pending_completion(h).unwrap());
    assert_eq!(rm.reference_count(h).unwrap(), 2);

    rm.update(Duration::ZERO);
    assert_eq!(fired.get(), 1);
    assert!(!rm.has_pending_completion(h).unwrap());
    assert_eq!(rm.reference_count(h).unwrap(), 1);
}

/// Test a listener added after completion fires once, through the deferred queue
#[test]
fn test_late_listener_fires_once_at_flush() {
    let rm = ResourceManager::new();
    let h = rm.start_operation(Pending, Handle::INVALID).unwrap();
    rm.complete(h, 3, true, None).unwrap();

    let (fired, callback) = counter();
    rm.add_completed_callback(h.typeless(), callback).unwrap();
    assert_eq!(fired.get(), 0, "must not fire inline");
    // The queued dispatch holds a reference until it runs.
    assert_eq!(rm.reference_count(h.typeless()).unwrap(), 2);

    rm.update(Duration::ZERO);
    assert_eq!(fired.get(), 1);
    rm.update(Duration::ZERO);
    assert_eq!(fired.get(), 1);
    assert_eq!(rm.reference_count(h.typeless()).unwrap(), 1);
}

/// Test an operation is queued for deferred dispatch only once
#[test]
fn test_deferred_registration_happens_once() {
    let rm = ResourceManager::new();
    let h = rm.start_operation(Pending, Handle::INVALID).unwrap().typeless();
    rm.complete(h.typed::<u32>(), 0, false, None).unwrap();

    let (first, a) = counter();
    let (second, b) = counter();
    rm.add_completed_callback(h, a).unwrap();
    rm.add_completed_callback(h, b).unwrap();
    assert_eq!(rm.scheduler().pending(), 1);
    assert_eq!(rm.reference_count(h).unwrap(), 2);

    rm.update(Duration::ZERO);
    assert_eq!((first.get(), second.get()), (1, 1));
    assert_eq!(rm.reference_count(h).unwrap(), 1);
}

/// Test removing a completion callback before it fires
#[test]
fn test_remove_completed_callback() {
    let rm = ResourceManager::new();
    let h = rm.start_operation(Pending, Handle::INVALID).unwrap();
    let (fired, callback) = counter();
    let id = rm.add_completed_callback(h.typeless(), callback).unwrap();

    assert!(rm.remove_completed_callback(h.typeless(), id).unwrap());
    assert!(!rm.remove_completed_callback(h.typeless(), id).unwrap());
    rm.complete(h, 1, true, None).unwrap();
    assert_eq!(fired.get(), 0);
}

/// Test completing twice keeps the first outcome
#[test]
fn test_second_complete_is_ignored() {
    let rm = ResourceManager::new();
    let h = rm.start_operation(Pending, Handle::INVALID).unwrap();
    rm.complete(h, 1, true, None).unwrap();
    rm.complete(h, 2, false, Some(OperationException::new("late")))
        .unwrap();

    assert_eq!(rm.result(h).unwrap(), 1);
    assert_eq!(rm.status(h.typeless()).unwrap(), AsyncOperationStatus::Succeeded);
    assert_eq!(rm.statistics().failed, 0);
}

/// Test that the result is only readable after success
#[test]
fn test_result_requires_success() {
    let rm = ResourceManager::new();
    let h = rm.start_operation(Pending, Handle::INVALID).unwrap();
    assert!(matches!(
        rm.result(h),
        Err(AddressablesError::ResultUnavailable { .. })
    ));

    rm.complete(h, 0, false, None).unwrap();
    assert!(rm.result(h).is_err());
}

/// Test dependency timing for invalid, done and pending dependencies
#[test]
fn test_dependency_ordering() {
    let rm = ResourceManager::new();

    // Test 1: invalid dependency runs immediately
    let executed = Rc::new(Cell::new(false));
    rm.start_operation(Tracked { executed: executed.clone() }, Handle::INVALID)
        .unwrap();
    assert!(executed.get());

    // Test 2: done dependency runs immediately
    let done = rm.create_completed_operation(1u32, "").unwrap();
    let executed = Rc::new(Cell::new(false));
    rm.start_operation(Tracked { executed: executed.clone() }, done.typeless())
        .unwrap();
    assert!(executed.get());

    // Test 3: pending dependency that fails runs at the deferred flush
    let dep = rm.start_operation(Pending, Handle::INVALID).unwrap();
    let executed = Rc::new(Cell::new(false));
    let dependent = rm
        .start_operation(Tracked { executed: executed.clone() }, dep.typeless())
        .unwrap();
    assert!(!executed.get());
    assert!(!rm.has_executed(dependent.typeless()).unwrap());

    rm.complete(dep, 0, false, Some(OperationException::new("dep failed")))
        .unwrap();
    assert!(!executed.get());
    rm.update(Duration::ZERO);
    assert!(executed.get());
    assert!(rm.has_executed(dependent.typeless()).unwrap());

    // Test 4: pending dependency that succeeds runs once it completes
    let dep = rm.start_operation(Pending, Handle::INVALID).unwrap();
    let executed = Rc::new(Cell::new(false));
    rm.start_operation(Tracked { executed: executed.clone() }, dep.typeless())
        .unwrap();
    assert!(!executed.get());
    rm.complete(dep, 1, true, None).unwrap();
    assert!(executed.get());
}

/// Test silent failures are reported as success but still reach the handler
#[test]
fn test_silent_failure_routes_to_exception_handler() {
    let rm = ResourceManager::new();
    let reported = Rc::new(RefCell::new(Vec::new()));
    let r = reported.clone();
    rm.set_exception_handler(move |_, e| r.borrow_mut().push(e.message().to_string()));

    let h = rm.start_operation(Pending, Handle::INVALID).unwrap();
    let seen_status = Rc::new(Cell::new(AsyncOperationStatus::None));
    let s = seen_status.clone();
    rm.add_completed_callback(h.typeless(), move |rm, h| s.set(rm.status(h).unwrap()))
        .unwrap();

    rm.complete(h, 5, true, Some(OperationException::new("partial catalog")))
        .unwrap();

    assert_eq!(seen_status.get(), AsyncOperationStatus::Succeeded);
    assert_eq!(*reported.borrow(), vec!["partial catalog".to_string()]);
    assert_eq!(rm.result(h).unwrap(), 5);
    assert_eq!(rm.statistics().silent_failures, 1);
}

/// Test a failure without a message gets a default one
#[test]
fn test_failure_without_message_gets_default() {
    let rm = ResourceManager::new();
    let reported = Rc::new(Cell::new(0));
    let r = reported.clone();
    rm.set_exception_handler(move |_, _| r.set(r.get() + 1));

    let h = rm.start_operation(Pending, Handle::INVALID).unwrap();
    rm.complete(h, 0, false, None).unwrap();

    let exception = rm.operation_exception(h.typeless()).unwrap().unwrap();
    assert_eq!(exception.message(), "Unknown error in AsyncOperation : Pending");
    assert_eq!(reported.get(), 1);

    rm.clear_exception_handler();
    let h = rm.start_operation(Pending, Handle::INVALID).unwrap();
    rm.complete(h, 0, false, None).unwrap();
    assert_eq!(reported.get(), 1);
}

/// Test destruction callbacks and the release hook run once
#[test]
fn test_release_inside_completion_callback() {
    let rm = ResourceManager::new();
    let released = Rc::new(Cell::new(0));
    let h = rm
        .start_operation(ReleaseCounter { released: released.clone() }, Handle::INVALID)
        .unwrap();
    let (destroyed, on_destroyed) = counter();
    rm.add_destroyed_callback(h.typeless(), on_destroyed).unwrap();
    rm.add_completed_callback(h.typeless(), |rm, h| rm.release(h).unwrap())
        .unwrap();

    rm.complete(h, 1, true, None).unwrap();

    assert!(!rm.is_valid(h));
    assert_eq!(destroyed.get(), 1);
    assert_eq!(released.get(), 1);
    assert_eq!(rm.operation_count(), 0);
    let stats = rm.statistics();
    assert_eq!(stats.live(), 0);
}

/// Test an operation that completes and is released during its own execute
#[test]
fn test_destroyed_while_executing() {
    struct SelfReleasing {
        released: Rc<Cell<u32>>,
    }

    impl AsyncOperation for SelfReleasing {
        type Output = ();

        fn execute(&mut self, ctx: &OperationContext<'_, ()>) {
            ctx.succeed(()).unwrap();
            ctx.manager().release(ctx.handle()).unwrap();
        }

        fn on_release(&mut self, _rm: &ResourceManager) {
            self.released.set(self.released.get() + 1);
        }
    }

    let rm = ResourceManager::new();
    let released = Rc::new(Cell::new(0));
    let h = rm
        .start_operation(SelfReleasing { released: released.clone() }, Handle::INVALID)
        .unwrap();

    assert!(!rm.is_valid(h));
    assert_eq!(released.get(), 1);
    assert_eq!(rm.operation_count(), 0);

    // The slot is reusable afterwards.
    let next = rm.create_operation(Pending);
    assert_eq!(next.typeless().index(), h.typeless().index());
    assert!(rm.is_valid(next));
}

/// Test that restarting a running operation is rejected
#[test]
fn test_start_twice_is_busy() {
    let rm = ResourceManager::new();
    let h = rm.start_operation(Pending, Handle::INVALID).unwrap();
    let err = rm.start(h.typeless(), Handle::INVALID).unwrap_err();
    assert!(matches!(err, AddressablesError::OperationBusy { .. }));
}

/// Test per-tick updates stop once the operation completes
#[test]
fn test_update_receiver_unsubscribes_on_completion() {
    struct Polling {
        ticks: Rc<Cell<u32>>,
        elapsed: Duration,
    }

    impl AsyncOperation for Polling {
        type Output = Duration;

        fn execute(&mut self, _ctx: &OperationContext<'_, Duration>) {}

        fn wants_updates(&self) -> bool {
            true
        }

        fn update(&mut self, ctx: &OperationContext<'_, Duration>, delta: Duration) {
            self.ticks.set(self.ticks.get() + 1);
            self.elapsed += delta;
            if self.elapsed >= Duration::from_millis(48) {
                ctx.succeed(self.elapsed).unwrap();
            }
        }
    }

    let rm = ResourceManager::new();
    let ticks = Rc::new(Cell::new(0));
    let h = rm
        .start_operation(
            Polling {
                ticks: ticks.clone(),
                elapsed: Duration::ZERO,
            },
            Handle::INVALID,
        )
        .unwrap();

    for _ in 0..5 {
        rm.update(Duration::from_millis(16));
    }
    assert_eq!(ticks.get(), 3);
    assert_eq!(rm.result(h).unwrap(), Duration::from_millis(48));
}

/// Test diagnostic events are posted in lifecycle order
#[test]
fn test_diagnostic_events() {
    let rm = ResourceManager::with_config(ResourceManagerConfig::for_editor()).unwrap();
    let events = Rc::new(RefCell::new(Vec::new()));
    let e = events.clone();
    let id = rm.register_diagnostic_callback(move |event| e.borrow_mut().push(event.kind));

    let h = rm.start_operation(Pending, Handle::INVALID).unwrap();
    rm.complete(h, 1, true, None).unwrap();
    rm.release(h).unwrap();

    let kinds = events.borrow().clone();
    assert_eq!(kinds.first(), Some(&DiagnosticEventType::AsyncOperationCreate));
    assert_eq!(kinds.last(), Some(&DiagnosticEventType::AsyncOperationDestroy));
    assert!(kinds.contains(&DiagnosticEventType::AsyncOperationComplete));
    assert!(!kinds.contains(&DiagnosticEventType::AsyncOperationFail));

    assert!(rm.unregister_diagnostic_callback(id));
    let before = events.borrow().len();
    rm.start_operation(Pending, Handle::INVALID).unwrap();
    assert_eq!(events.borrow().len(), before);
}

/// Test percent-complete events report 0 on start and 1 on completion
#[test]
fn test_diagnostic_percent_complete_values() {
    let rm = ResourceManager::with_config(ResourceManagerConfig::for_editor()).unwrap();
    let values = Rc::new(RefCell::new(Vec::new()));
    let v = values.clone();
    rm.register_diagnostic_callback(move |event| {
        if event.kind == DiagnosticEventType::AsyncOperationPercentComplete {
            v.borrow_mut().push(event.value);
        }
    });

    let h = rm.start_operation(Pending, Handle::INVALID).unwrap();
    rm.complete(h, 1, true, None).unwrap();
    assert_eq!(*values.borrow(), vec![0, 1]);
}

/// Test diagnostics stay silent unless enabled
#[test]
fn test_diagnostic_events_disabled_by_default() {
    let rm = ResourceManager::new();
    let count = Rc::new(Cell::new(0));
    let c = count.clone();
    rm.register_diagnostic_callback(move |_| c.set(c.get() + 1));
    rm.create_completed_operation(1u8, "").unwrap();
    assert_eq!(count.get(), 0);
}

/// Test shared operations under a cache key
#[test]
fn test_operation_cache_shares_and_evicts() {
    let rm = ResourceManager::new();

    let first = rm
        .start_cached_operation("catalog", Pending, Handle::INVALID)
        .unwrap();
    let second = rm
        .start_cached_operation("catalog", Pending, Handle::INVALID)
        .unwrap();
    assert_eq!(first, second);
    // creator + start + second request
    assert_eq!(rm.reference_count(first.typeless()).unwrap(), 3);
    assert_eq!(rm.cached_operation("catalog"), Some(first.typeless()));

    rm.complete(first, 0, false, Some(OperationException::new("404")))
        .unwrap();
    assert_eq!(rm.cached_operation("catalog"), None);

    let retry = rm
        .start_cached_operation("catalog", Pending, Handle::INVALID)
        .unwrap();
    assert_ne!(retry, first);
}

/// Test cached operations are evicted on destruction
#[test]
fn test_operation_cache_evicts_on_destroy() {
    let rm = ResourceManager::new();
    let h = rm
        .start_cached_operation("settings", Pending, Handle::INVALID)
        .unwrap();
    rm.complete(h, 1, true, None).unwrap();
    assert_eq!(rm.cached_operation("settings"), Some(h.typeless()));

    rm.release(h).unwrap();
    assert_eq!(rm.cached_operation("settings"), None);
}

/// Test that panicking progress hooks report zero
#[test]
fn test_percent_complete() {
    struct HalfWay;

    impl AsyncOperation for HalfWay {
        type Output = ();

        fn execute(&mut self, _ctx: &OperationContext<'_, ()>) {}

        fn progress(&self, _rm: &ResourceManager) -> f32 {
            0.5
        }
    }

    struct Broken;

    impl AsyncOperation for Broken {
        type Output = ();

        fn execute(&mut self, _ctx: &OperationContext<'_, ()>) {}

        fn progress(&self, _rm: &ResourceManager) -> f32 {
            panic!("progress unavailable")
        }
    }

    let rm = ResourceManager::new();
    let half = rm.start_operation(HalfWay, Handle::INVALID).unwrap();
    let broken = rm.start_operation(Broken, Handle::INVALID).unwrap();

    assert_eq!(rm.percent_complete(half.typeless()).unwrap(), 0.5);
    assert_eq!(rm.percent_complete(broken.typeless()).unwrap(), 0.0);

    rm.complete(half, (), true, None).unwrap();
    assert_eq!(rm.percent_complete(half.typeless()).unwrap(), 1.0);
}

/// Test invalid configuration is rejected
#[test]
fn test_with_config_validates() {
    let config = ResourceManagerConfig {
        max_flush_passes: 0,
        ..Default::default()
    };
    assert!(matches!(
        ResourceManager::with_config(config),
        Err(AddressablesError::Config(_))
    ));
}
