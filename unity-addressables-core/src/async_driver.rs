//! Tokio host driver
//!
//! Ticks a [`ResourceManager`] from a `tokio` interval for hosts that have no
//! frame loop of their own. The manager is single-threaded, so the driver runs
//! on the current task (use a current-thread runtime or a `LocalSet`).

use std::future::Future;
use std::time::Duration;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, instrument};

use crate::error::{AddressablesError, Result};
use crate::handle::Handle;
use crate::operation::AsyncOperationStatus;
use crate::resource_manager::ResourceManager;
use crate::task::{OperationTask, TaskResult};

const MIN_PERIOD: Duration = Duration::from_millis(1);

fn ticker(period: Duration) -> time::Interval {
    let mut interval = time::interval(period.max(MIN_PERIOD));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Tick `rm` every `period` until `handle` is done and its completion
/// callbacks have been dispatched. Returns the terminal status.
#[instrument(level = "debug", skip(rm))]
pub async fn drive_until_done(
    rm: &ResourceManager,
    handle: Handle,
    period: Duration,
) -> Result<AsyncOperationStatus> {
    if !rm.is_valid(handle) {
        return Err(AddressablesError::invalid_handle(handle));
    }

    let mut interval = ticker(period);
    let mut last = Instant::now();
    let mut ticks = 0u64;
    loop {
        interval.tick().await;
        let now = Instant::now();
        rm.update(now - last);
        last = now;
        ticks += 1;

        let status = rm.status(handle)?;
        if status.is_done() {
            if rm.has_pending_completion(handle)? {
                rm.update(Duration::ZERO);
            }
            debug!(ticks, status = %status, "operation finished");
            return Ok(status);
        }
    }
}

/// Await `task` while ticking `rm` every `period`.
pub async fn drive_task<T>(
    rm: &ResourceManager,
    task: OperationTask<T>,
    period: Duration,
) -> TaskResult<T> {
    let mut interval = ticker(period);
    let mut last = Instant::now();
    tokio::pin!(task);
    loop {
        tokio::select! {
            biased;
            outcome = &mut task => return outcome,
            _ = interval.tick() => {
                let now = Instant::now();
                rm.update(now - last);
                last = now;
            }
        }
    }
}

/// Drive `rm` while awaiting an arbitrary future, e.g. several tasks joined.
pub async fn drive_while<F: Future>(rm: &ResourceManager, future: F, period: Duration) -> F::Output {
    let mut interval = ticker(period);
    let mut last = Instant::now();
    tokio::pin!(future);
    loop {
        tokio::select! {
            biased;
            output = &mut future => return output,
            _ = interval.tick() => {
                let now = Instant::now();
                rm.update(now - last);
                last = now;
            }
        }
    }
}
