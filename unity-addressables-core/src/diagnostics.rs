//! Diagnostic events
//!
//! Observer-only events describing operation lifecycles. They are posted only
//! when `post_profiler_events` is enabled and never influence control flow.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::handle::Handle;

/// Kind of lifecycle event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiagnosticEventType {
    /// Operation was started
    AsyncOperationCreate,
    /// Progress changed; `value` is 0 when started and 1 once complete
    AsyncOperationPercentComplete,
    /// Operation reached a terminal state
    AsyncOperationComplete,
    /// Operation failed; `context` holds the exception text
    AsyncOperationFail,
    /// Reference count changed; `value` is the new count
    AsyncOperationReferenceCount,
    /// Reference count reached zero and the operation was recycled
    AsyncOperationDestroy,
}

/// A single diagnostic event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticEvent {
    /// Operation the event refers to
    pub handle: Handle,
    /// Debug name of the operation at the time of the event
    pub debug_name: String,
    /// Event kind
    pub kind: DiagnosticEventType,
    /// Kind-specific value
    pub value: i32,
    /// Optional text payload
    pub context: Option<String>,
    /// Scheduler clock when the event was posted
    pub time: Duration,
}

impl fmt::Display for DiagnosticEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:?}] {:?} {} = {}",
            self.time, self.kind, self.debug_name, self.value
        )?;
        if let Some(context) = &self.context {
            write!(f, " ({})", context)?;
        }
        Ok(())
    }
}
