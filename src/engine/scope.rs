use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::builder::TaskDef;
use crate::device::DeviceId;
use crate::engine::Engine;
use crate::error::{JoinError, TaskFailure};

const HELP_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Default)]
struct ScopeCounts {
    live: usize,
    spawned: usize,
    completed: usize,
    failures: Vec<TaskFailure>,
}

/// Bookkeeping of a single join scope, shared with every task spawned in it.
pub(crate) struct ScopeState {
    counts: Mutex<ScopeCounts>,
    drained: Condvar,
    span: tracing::Span,
}

impl ScopeState {
    fn new(span: tracing::Span) -> Arc<Self> {
        Arc::new(Self {
            counts: Mutex::new(ScopeCounts::default()),
            drained: Condvar::new(),
            span,
        })
    }

    fn lock(&self) -> MutexGuard<'_, ScopeCounts> {
        self.counts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn enter(&self) {
        let mut counts = self.lock();
        counts.live += 1;
        counts.spawned += 1;
        self.span.pb_set_length(counts.spawned as u64);
    }

    /// Called once per task when it reaches a terminal state.
    pub(crate) fn leave(&self, failure: Option<&TaskFailure>) {
        let mut counts = self.lock();
        counts.live -= 1;

        match failure {
            Some(failure) => counts.failures.push(failure.clone()),
            None => counts.completed += 1,
        }

        self.span.pb_inc(1);

        if counts.live == 0 {
            self.drained.notify_all();
        }
    }

    fn wait(&self) -> Drained {
        let mut counts = self.lock();

        while counts.live > 0 {
            counts = self
                .drained
                .wait(counts)
                .unwrap_or_else(PoisonError::into_inner);
        }

        Drained::take(&mut counts)
    }

    /// Like `wait`, but calls `help` between checks. When it finds nothing to
    /// do the thread sleeps until the scope drains or `HELP_INTERVAL` passes.
    ///
    /// Once `closed` reports a shutdown, nothing queued will run anymore and
    /// the tasks still live are counted as abandoned.
    fn wait_helping(
        &self,
        mut help: impl FnMut() -> bool,
        closed: impl Fn() -> bool,
    ) -> Drained {
        loop {
            {
                let counts = self.lock();
                if counts.live == 0 {
                    break;
                }
            }

            if help() {
                continue;
            }

            let mut counts = self.lock();
            if counts.live == 0 {
                break;
            }

            if closed() {
                let abandoned = counts.live;
                let mut drained = Drained::take(&mut counts);
                drained.abandoned = abandoned;
                return drained;
            }

            let _ = self
                .drained
                .wait_timeout(counts, HELP_INTERVAL)
                .unwrap_or_else(PoisonError::into_inner);
        }

        self.wait()
    }
}

struct Drained {
    completed: usize,
    failures: Vec<TaskFailure>,
    abandoned: usize,
}

impl Drained {
    fn take(counts: &mut ScopeCounts) -> Self {
        Self {
            completed: counts.completed,
            failures: std::mem::take(&mut counts.failures),
            abandoned: 0,
        }
    }
}

/// Summary of a join scope that closed without failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinReport {
    /// Wall-clock time from opening the scope until its last task finished.
    pub elapsed: Duration,
    /// Number of tasks spawned in the scope.
    pub completed: usize,
}

/// A region of code whose end waits for every task spawned inside it.
///
/// Obtained from [`Runtime::join`](crate::Runtime::join) or from
/// [`TaskContext::join`](crate::TaskContext::join). Tasks spawned through
/// [`JoinScope::task`] belong to the scope. Dependencies may point anywhere,
/// including tasks of an enclosing scope.
pub struct JoinScope<'rt> {
    engine: &'rt Arc<Engine>,
    state: Arc<ScopeState>,
    depth: usize,
    helper: Option<DeviceId>,
}

impl<'rt> JoinScope<'rt> {
    /// Starts the definition of a task belonging to this scope.
    pub fn task(&self) -> TaskDef<'_> {
        TaskDef::new(self.engine, Some(&self.state))
    }

    /// Opens a nested scope and blocks until it drains.
    pub fn join<R>(&self, f: impl FnOnce(&JoinScope<'_>) -> R) -> Result<R, JoinError> {
        run_scope(self.engine, self.depth + 1, self.helper, f).map(|(value, _)| value)
    }

    /// Nesting level, `0` for a scope opened directly on the runtime.
    pub fn depth(&self) -> usize {
        self.depth
    }
}

/// Runs `f` inside a fresh scope, then waits for the scope to drain.
///
/// A panic inside `f` is re-raised only after every task spawned before it
/// has finished, so no task outlives the scope it was spawned in. A scope
/// opened from a task body passes its device as `helper`, and that device
/// keeps running queued tasks while the scope drains.
pub(crate) fn run_scope<R>(
    engine: &Arc<Engine>,
    depth: usize,
    helper: Option<DeviceId>,
    f: impl FnOnce(&JoinScope<'_>) -> R,
) -> Result<(R, JoinReport), JoinError> {
    let span = tracing::span!(Level::INFO, "join", depth);
    if depth == 0 {
        span.pb_set_style(&engine.scope_style);
        span.pb_set_message("Running tasks...");
    }
    let _enter = span.enter();

    let state = ScopeState::new(span.clone());
    let scope = JoinScope {
        engine,
        state: Arc::clone(&state),
        depth,
        helper,
    };

    let start = Instant::now();
    let result = panic::catch_unwind(AssertUnwindSafe(|| f(&scope)));
    let Drained {
        completed,
        failures,
        abandoned,
    } = match helper {
        Some(device) => {
            state.wait_helping(|| engine.help(device, &state), || engine.is_shutdown())
        }
        None => state.wait(),
    };
    let elapsed = start.elapsed();

    let value = match result {
        Ok(value) => value,
        Err(payload) => panic::resume_unwind(payload),
    };

    if depth == 0 && engine.config.report_timing {
        println!("{}", crate::utils::timing_line(elapsed));
    }

    tracing::info!(
        depth,
        completed,
        failed = failures.len(),
        abandoned,
        elapsed = ?elapsed,
        "join scope closed"
    );

    if !failures.is_empty() || abandoned > 0 {
        return Err(JoinError {
            failures,
            abandoned,
        });
    }

    Ok((value, JoinReport { elapsed, completed }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::TaskHandle;
    use std::thread;

    #[test]
    fn test_wait_returns_immediately_when_empty() {
        let state = ScopeState::new(tracing::Span::none());
        assert_eq!(state.wait().completed, 0);
    }

    #[test]
    fn test_wait_blocks_until_drained() {
        let state = ScopeState::new(tracing::Span::none());
        state.enter();
        state.enter();

        let worker = {
            let state = Arc::clone(&state);
            thread::spawn(move || {
                state.leave(None);
                state.leave(None);
            })
        };

        let drained = state.wait();
        worker.join().unwrap();

        assert_eq!(drained.completed, 2);
        assert!(drained.failures.is_empty());
    }

    #[test]
    fn test_wait_helping_runs_helper_until_drained() {
        let state = ScopeState::new(tracing::Span::none());
        state.enter();
        state.enter();

        let mut calls = 0;
        let drained = state.wait_helping(
            || {
                calls += 1;
                state.leave(None);
                true
            },
            || false,
        );

        assert_eq!(calls, 2);
        assert_eq!(drained.completed, 2);
        assert_eq!(drained.abandoned, 0);
    }

    #[test]
    fn test_wait_helping_gives_up_after_shutdown() {
        let state = ScopeState::new(tracing::Span::none());
        state.enter();
        state.enter();
        state.leave(None);

        let drained = state.wait_helping(|| false, || true);

        assert_eq!(drained.completed, 1);
        assert_eq!(drained.abandoned, 1);
    }

    #[test]
    fn test_membership_ends_with_the_task() {
        let scope = ScopeState::new(tracing::Span::none());
        let other = ScopeState::new(tracing::Span::none());
        let handle = TaskHandle::anonymous(None);

        handle.lock().scopes.push(Arc::clone(&scope));
        assert!(handle.belongs_to(&scope));
        assert!(!handle.belongs_to(&other));

        handle.lock().scopes.clear();
        assert!(!handle.belongs_to(&scope));
    }
}
