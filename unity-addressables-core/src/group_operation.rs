//! Group operations
//!
//! A [`GroupOperation`] completes once every child operation is terminal.
//! The group owns one reference on each child and gives them back exactly
//! once: when it fails (if configured to) or when the group itself is
//! destroyed, whichever comes first.

use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::rc::Rc;
use tracing::{debug, trace, warn};

use crate::error::{OperationException, Result};
use crate::handle::{AsyncOperationHandle, Handle};
use crate::operation::{AsyncOperation, AsyncOperationStatus, OperationContext};
use crate::resource_manager::ResourceManager;

/// How child failures affect the group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FailurePolicy {
    /// Any failed (or invalid) child fails the group
    #[default]
    FailFast,
    /// The group succeeds; child failures are reported as a silent failure
    CollectAll,
}

/// Group behavior settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupOperationSettings {
    pub policy: FailurePolicy,
    /// Give the children back as soon as the group fails
    pub release_dependencies_on_failure: bool,
}

impl Default for GroupOperationSettings {
    fn default() -> Self {
        Self {
            policy: FailurePolicy::FailFast,
            release_dependencies_on_failure: true,
        }
    }
}

impl GroupOperationSettings {
    /// Settings tolerating child failures
    pub fn collect_all() -> Self {
        Self {
            policy: FailurePolicy::CollectAll,
            ..Self::default()
        }
    }
}

/// Composite operation over child handles. Its result is the child list.
pub struct GroupOperation {
    children: Vec<Handle>,
    settings: GroupOperationSettings,
    /// Child handles whose references this group still holds
    held: Vec<Handle>,
}

impl GroupOperation {
    /// Take ownership of one reference on each child.
    pub fn new(children: Vec<Handle>, settings: GroupOperationSettings) -> Self {
        Self {
            held: children.iter().copied().filter(|h| h.is_valid()).collect(),
            children,
            settings,
        }
    }

    fn finish(
        rm: &ResourceManager,
        group: AsyncOperationHandle<Vec<Handle>>,
        children: &[Handle],
        settings: GroupOperationSettings,
    ) {
        let mut failures = Vec::new();
        for &child in children {
            match rm.status(child) {
                Ok(AsyncOperationStatus::Failed) => failures.push(
                    rm.operation_exception(child)
                        .ok()
                        .flatten()
                        .unwrap_or_else(|| OperationException::new("Dependency failed")),
                ),
                Ok(_) => {}
                Err(_) => failures.push(OperationException::new(format!(
                    "Dependency {:?} is not a valid operation",
                    child
                ))),
            }
        }

        let outcome = match (failures.into_iter().next(), settings.policy) {
            (None, _) => rm.complete(group, children.to_vec(), true, None),
            (Some(first), FailurePolicy::FailFast) => {
                debug!(group = ?group.typeless(), "group failed because a dependency failed");
                rm.complete_with_options(
                    group,
                    children.to_vec(),
                    false,
                    Some(OperationException::with_inner(
                        "GroupOperation failed because one of its dependencies failed",
                        first,
                    )),
                    settings.release_dependencies_on_failure,
                )
            }
            (Some(first), FailurePolicy::CollectAll) => rm.complete(
                group,
                children.to_vec(),
                true,
                Some(OperationException::with_inner(
                    "GroupOperation completed with failed dependencies",
                    first,
                )),
            ),
        };
        if let Err(e) = outcome {
            trace!(group = ?group.typeless(), "group could not complete: {}", e);
        }
    }
}

impl AsyncOperation for GroupOperation {
    type Output = Vec<Handle>;

    fn execute(&mut self, ctx: &OperationContext<'_, Vec<Handle>>) {
        let rm = ctx.manager();
        let group = ctx.handle();
        let pending: Vec<Handle> = self
            .children
            .iter()
            .copied()
            .filter(|&child| matches!(rm.is_done(child), Ok(false)))
            .collect();

        if pending.is_empty() {
            Self::finish(rm, group, &self.children, self.settings);
            return;
        }

        let remaining = Rc::new(Cell::new(pending.len()));
        let children: Rc<[Handle]> = self.children.clone().into();
        let settings = self.settings;
        for child in pending {
            let counter = remaining.clone();
            let children = children.clone();
            let subscribed = rm.add_completed_callback(child, move |rm, _| {
                let left = counter.get().saturating_sub(1);
                counter.set(left);
                if left == 0 {
                    Self::finish(rm, group, &children, settings);
                }
            });
            if let Err(e) = subscribed {
                warn!(child = ?child, "could not subscribe to group child: {}", e);
                remaining.set(remaining.get().saturating_sub(1));
            }
        }
        if remaining.get() == 0 {
            Self::finish(rm, group, &self.children, self.settings);
        }
    }

    fn debug_name(&self) -> String {
        format!("GroupOperation ({} children)", self.children.len())
    }

    fn progress(&self, rm: &ResourceManager) -> f32 {
        if self.children.is_empty() {
            return 1.0;
        }
        let total: f32 = self
            .children
            .iter()
            .map(|&child| rm.percent_complete(child).unwrap_or(1.0))
            .sum();
        total / self.children.len() as f32
    }

    fn dependencies(&self) -> Vec<Handle> {
        self.held.clone()
    }

    fn release_dependencies(&mut self, rm: &ResourceManager) {
        for child in self.held.drain(..) {
            if let Err(e) = rm.release(child) {
                warn!(child = ?child, "group could not release dependency: {}", e);
            }
        }
    }

    fn on_release(&mut self, rm: &ResourceManager) {
        self.release_dependencies(rm);
    }
}

impl ResourceManager {
    /// Create and start a group over `children`, taking over one reference on
    /// each of them.
    pub fn create_group_operation<I, H>(
        &self,
        children: I,
        settings: GroupOperationSettings,
    ) -> Result<AsyncOperationHandle<Vec<Handle>>>
    where
        I: IntoIterator<Item = H>,
        H: Into<Handle>,
    {
        let children: Vec<Handle> = children.into_iter().map(Into::into).collect();
        self.start_operation(GroupOperation::new(children, settings), Handle::INVALID)
    }
}
