//! Dependency resolution.
//!
//! A spawned task waits on a counter of unfinished predecessors. The counter
//! starts one above the number of predecessors and that extra unit is only
//! released once every predecessor has been attached, so a predecessor
//! completing halfway through registration can never fire the task early.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::engine::Engine;
use crate::engine::TaskHandle;
use crate::engine::cell::Attach;
use crate::error::TaskFailure;
use crate::node::TaskState;

impl Engine {
    pub(crate) fn register(self: &Arc<Self>, handle: &TaskHandle, dependencies: &[TaskHandle]) {
        handle
            .0
            .pending
            .store(dependencies.len() + 1, Ordering::SeqCst);

        for dependency in dependencies {
            match dependency.attach(handle) {
                Attach::Satisfied => self.satisfy(handle),
                Attach::Failed(origin) => self.cascade(handle, &origin),
                Attach::Pending => {}
            }
        }

        self.satisfy(handle);
    }

    /// Releases one unit of the wait counter, making the task ready when it
    /// was the last one.
    fn satisfy(self: &Arc<Self>, handle: &TaskHandle) {
        if handle.0.pending.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }

        if handle.transition(TaskState::Waiting, TaskState::Ready) {
            tracing::trace!(task = %handle.id(), name = handle.name(), "ready");
            self.run_ready(handle);
        }
    }

    pub(crate) fn complete(self: &Arc<Self>, handle: &TaskHandle) {
        let (dependents, scopes) = {
            let mut inner = handle.lock();
            if inner.state != Some(TaskState::Running) {
                return;
            }

            inner.state = Some(TaskState::Completed);
            (
                std::mem::take(&mut inner.dependents),
                std::mem::take(&mut inner.scopes),
            )
        };

        tracing::debug!(task = %handle.id(), name = handle.name(), "completed");

        for dependent in &dependents {
            self.satisfy(dependent);
        }

        for scope in scopes {
            scope.leave(None);
        }
    }

    /// Fails a running task and every task transitively waiting on it.
    pub(crate) fn fail(&self, handle: &TaskHandle, failure: TaskFailure) {
        self.fail_from(handle, failure, TaskState::Running);
    }

    fn cascade(&self, handle: &TaskHandle, origin: &TaskFailure) {
        let failure = TaskFailure::Cascaded {
            task: handle.id(),
            name: handle.name().to_string(),
            origin: Box::new(origin.root().clone()),
        };

        self.fail_from(handle, failure, TaskState::Waiting);
    }

    fn fail_from(&self, handle: &TaskHandle, failure: TaskFailure, from: TaskState) {
        let mut work = vec![(handle.clone(), failure, from)];

        while let Some((handle, failure, from)) = work.pop() {
            let (dependents, scopes) = {
                let mut inner = handle.lock();
                if inner.state != Some(from) {
                    continue;
                }

                inner.state = Some(TaskState::Failed);
                inner.failure = Some(failure.clone());
                inner.node = None;
                (
                    std::mem::take(&mut inner.dependents),
                    std::mem::take(&mut inner.scopes),
                )
            };

            if failure.is_cascaded() {
                tracing::debug!(task = %handle.id(), "{failure}");
            } else {
                tracing::warn!(task = %handle.id(), "{failure}");
            }

            let origin = failure.root();
            for dependent in dependents {
                let cascaded = TaskFailure::Cascaded {
                    task: dependent.id(),
                    name: dependent.name().to_string(),
                    origin: Box::new(origin.clone()),
                };
                work.push((dependent, cascaded, TaskState::Waiting));
            }

            for scope in scopes {
                scope.leave(Some(&failure));
            }
        }
    }
}
