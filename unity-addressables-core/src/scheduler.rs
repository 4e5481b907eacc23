//! Deferred action scheduler
//!
//! Single-threaded driver for work that must run "later in this tick" or after
//! a delay. Ready actions live in two alternating bins: a flush swaps the
//! active bin and runs the one it swapped out, so anything scheduled while
//! flushing lands in the other bin and is picked up by the next pass of the
//! same flush. Passes repeat until no new work appears, bounded by
//! `max_flush_passes`.
//!
//! Delayed actions are kept sorted by fire time and are moved into the active
//! bin once the scheduler clock reaches them. The clock only advances through
//! [`Scheduler::tick`].

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};
use tracing::{debug, error, trace};

use crate::delegate_list::panic_message;

/// Work item run with the scheduler's context
pub type Action<C> = Box<dyn FnOnce(&C)>;

/// Identifier returned when an action is scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActionId(u64);

struct ScheduledAction<C: ?Sized> {
    id: ActionId,
    invocation_time: Duration,
    action: Action<C>,
}

impl<C: ?Sized> fmt::Debug for ScheduledAction<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} @{:?}", self.id, self.invocation_time)
    }
}

/// What a single [`Scheduler::tick`] did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Actions invoked
    pub invoked: usize,
    /// Bin swaps performed
    pub passes: usize,
    /// True when the pass limit stopped the flush with work still queued
    pub truncated: bool,
}

struct Inner<C: ?Sized> {
    bins: [Vec<ScheduledAction<C>>; 2],
    delayed: VecDeque<ScheduledAction<C>>,
    collection_index: usize,
    now: Duration,
    next_id: u64,
    flushing: bool,
}

/// Double-buffered deferred action queue with a sorted delayed list.
pub struct Scheduler<C: ?Sized> {
    max_flush_passes: usize,
    inner: RefCell<Inner<C>>,
}

impl<C: ?Sized> Scheduler<C> {
    /// Create a scheduler whose flushes stop after `max_flush_passes` bin swaps.
    pub fn new(max_flush_passes: usize) -> Self {
        Self {
            max_flush_passes: max_flush_passes.max(1),
            inner: RefCell::new(Inner {
                bins: [Vec::new(), Vec::new()],
                delayed: VecDeque::new(),
                collection_index: 0,
                now: Duration::ZERO,
                next_id: 0,
                flushing: false,
            }),
        }
    }

    /// Scheduler clock: the sum of all tick deltas
    pub fn now(&self) -> Duration {
        self.inner.borrow().now
    }

    /// True while a flush is running
    pub fn is_flushing(&self) -> bool {
        self.inner.borrow().flushing
    }

    /// Number of ready and delayed actions
    pub fn pending(&self) -> usize {
        let inner = self.inner.borrow();
        inner.bins[0].len() + inner.bins[1].len() + inner.delayed.len()
    }

    /// True if any action is waiting to run
    pub fn is_active(&self) -> bool {
        self.pending() > 0
    }

    /// Schedule `action`. With a zero delay it runs at the next flush;
    /// otherwise once the clock has advanced by at least `delay`.
    pub fn add_action(&self, delay: Duration, action: Action<C>) -> ActionId {
        let mut inner = self.inner.borrow_mut();
        let id = ActionId(inner.next_id);
        inner.next_id += 1;
        let scheduled = ScheduledAction {
            id,
            invocation_time: inner.now.saturating_add(delay),
            action,
        };

        if delay.is_zero() {
            let index = inner.collection_index;
            inner.bins[index].push(scheduled);
        } else {
            // Scan from the tail: later fire times are the common case.
            let mut position = inner.delayed.len();
            while position > 0
                && inner.delayed[position - 1].invocation_time > scheduled.invocation_time
            {
                position -= 1;
            }
            inner.delayed.insert(position, scheduled);
        }
        id
    }

    /// Advance the clock by `delta`, promote due delayed actions and flush
    /// until quiescent. A tick issued from inside a flush does nothing.
    pub fn tick(&self, context: &C, delta: Duration) -> FlushReport {
        let mut report = FlushReport::default();
        {
            let mut inner = self.inner.borrow_mut();
            if inner.flushing {
                return report;
            }
            inner.flushing = true;
            inner.now = inner.now.saturating_add(delta);

            let now = inner.now;
            let index = inner.collection_index;
            while inner
                .delayed
                .front()
                .is_some_and(|d| d.invocation_time <= now)
            {
                if let Some(due) = inner.delayed.pop_front() {
                    inner.bins[index].push(due);
                }
            }
        }

        loop {
            let (invoke_index, mut batch) = {
                let mut inner = self.inner.borrow_mut();
                let invoke_index = inner.collection_index;
                inner.collection_index = (invoke_index + 1) % 2;
                (invoke_index, std::mem::take(&mut inner.bins[invoke_index]))
            };

            for scheduled in batch.drain(..) {
                let ScheduledAction { id, action, .. } = scheduled;
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| action(context)));
                if let Err(payload) = outcome {
                    error!(
                        action = ?id,
                        "Exception thrown in deferred action: {}",
                        panic_message(payload.as_ref())
                    );
                }
                report.invoked += 1;
            }
            report.passes += 1;

            let mut inner = self.inner.borrow_mut();
            // Hand the emptied allocation back unless new work already claimed the bin.
            if inner.bins[invoke_index].is_empty() {
                inner.bins[invoke_index] = batch;
            }
            let active = inner.collection_index;
            if inner.bins[active].is_empty() {
                break;
            }
            if report.passes >= self.max_flush_passes {
                error!(
                    passes = report.passes,
                    remaining = inner.bins[active].len(),
                    "Deferred flush did not settle; remaining actions wait for the next tick"
                );
                report.truncated = true;
                break;
            }
        }

        self.inner.borrow_mut().flushing = false;
        if report.invoked > 0 {
            trace!(invoked = report.invoked, passes = report.passes, "scheduler flushed");
        }
        report
    }

    /// Pump the scheduler until it is idle or `timeout` of wall time has
    /// passed (`Duration::ZERO` waits without limit). Each iteration advances
    /// the clock by `time_advance`. Returns true if the scheduler went idle.
    ///
    /// A wait issued from inside a flush cannot pump and returns false at once.
    pub fn wait(&self, context: &C, timeout: Duration, time_advance: Duration) -> bool {
        if !self.is_active() {
            return true;
        }
        if self.is_flushing() {
            debug!("scheduler wait ignored: already inside a flush");
            return false;
        }
        let started = Instant::now();
        loop {
            self.tick(context, time_advance);
            if !self.is_active() {
                return true;
            }
            if !timeout.is_zero() && started.elapsed() >= timeout {
                return false;
            }
        }
    }

    /// Drop every pending action without running it
    pub fn clear(&self) {
        let dropped = {
            let mut inner = self.inner.borrow_mut();
            let [a, b] = &mut inner.bins;
            let mut dropped: Vec<_> = a.drain(..).chain(b.drain(..)).collect();
            dropped.extend(inner.delayed.drain(..));
            dropped
        };
        drop(dropped);
    }
}

impl<C: ?Sized> fmt::Debug for Scheduler<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Scheduler")
            .field("now", &inner.now)
            .field("ready", &(inner.bins[0].len() + inner.bins[1].len()))
            .field("delayed", &inner.delayed)
            .field("flushing", &inner.flushing)
            .finish()
    }
}
