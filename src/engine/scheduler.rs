use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Instant;

use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::context::TaskContext;
use crate::device::{DeviceId, DeviceInfo};
use crate::diagnostics::TaskRecord;
use crate::engine::{Engine, ScopeState, TaskHandle};
use crate::error::{DataError, RuntimeError, SpawnError, TaskFailure};
use crate::memory::BufferRegion;
use crate::node::{Access, Constraint, Placement, TaskNode, TaskState};
use crate::tracker::Movement;

#[derive(Default)]
struct QueueState {
    entries: VecDeque<TaskHandle>,
    closed: bool,
}

/// Ready queue of a single device.
///
/// A task may sit in several queues at once, the first worker to claim it
/// runs it and the others drop their entry.
pub(crate) struct SlotQueue {
    state: Mutex<QueueState>,
    available: Condvar,
    load: AtomicUsize,
}

impl SlotQueue {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            available: Condvar::new(),
            load: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, handle: TaskHandle) {
        let mut state = self.lock();
        state.entries.push_back(handle);
        self.load.fetch_add(1, Ordering::Relaxed);
        self.available.notify_one();
    }

    /// Blocks until an entry is available. Returns `None` once closed.
    fn pop(&self) -> Option<TaskHandle> {
        let mut state = self.lock();

        loop {
            if state.closed {
                return None;
            }

            if let Some(handle) = state.entries.pop_front() {
                return Some(handle);
            }

            state = self
                .available
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Removes the first entry matching `filter`, leaving the others in
    /// place for the worker.
    fn take_where(&self, filter: impl Fn(&TaskHandle) -> bool) -> Option<TaskHandle> {
        let mut state = self.lock();
        if state.closed {
            return None;
        }

        let position = state.entries.iter().position(filter)?;
        state.entries.remove(position)
    }

    fn done(&self) {
        self.load.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn close(&self) {
        self.lock().closed = true;
        self.available.notify_all();
    }

    /// Entries queued or running on this device.
    pub(crate) fn load(&self) -> usize {
        self.load.load(Ordering::Relaxed)
    }
}

impl Engine {
    /// Devices a placement allows, ignoring where the data currently lives.
    pub(crate) fn candidates(&self, placement: &Placement, footprint: u64) -> Vec<DeviceId> {
        let allowed = |device: &DeviceInfo| match placement {
            Placement::Any | Placement::Near(_) => true,
            Placement::Class(class) => device.class == *class,
            Placement::Classes(classes) => classes.contains(&device.class),
            Placement::Device(id) => device.id == *id,
            Placement::Devices(ids) => ids.contains(&device.id),
        };

        self.devices
            .iter()
            .filter(|device| allowed(device) && device.fits(footprint))
            .map(|device| device.id)
            .collect()
    }

    pub(crate) fn validate(&self, placement: &Placement, footprint: u64) -> Result<(), SpawnError> {
        match placement {
            Placement::Device(id) if id.index() >= self.devices.len() => Err(
                SpawnError::InvalidPlacement(format!("device {id} does not exist")),
            ),
            Placement::Classes(classes) if classes.is_empty() => Err(
                SpawnError::InvalidPlacement("empty set of device classes".to_string()),
            ),
            Placement::Devices(ids) if ids.is_empty() => Err(SpawnError::InvalidPlacement(
                "empty set of devices".to_string(),
            )),
            _ if self.candidates(placement, footprint).is_empty() => {
                Err(SpawnError::InvalidPlacement(format!(
                    "no device satisfies {placement:?} with a footprint of {footprint} bytes"
                )))
            }
            _ => Ok(()),
        }
    }

    /// Orders the devices a ready task should be offered to.
    ///
    /// Among the allowed devices only those holding the canonical copy of the
    /// largest number of the task's inputs are kept, the least loaded first.
    fn select(&self, constraint: &Constraint) -> Vec<DeviceId> {
        if let Placement::Device(id) = constraint.placement {
            return vec![id];
        }

        let mut candidates = self.candidates(&constraint.placement, constraint.footprint);

        if let Placement::Near(regions) = &constraint.placement {
            let near: Vec<_> = candidates
                .iter()
                .copied()
                .filter(|id| {
                    regions
                        .iter()
                        .any(|region| self.tracker.canonical(region) == Some(*id))
                })
                .collect();

            if !near.is_empty() {
                candidates = near;
            }
        }

        if candidates.len() > 1 && !constraint.inputs.is_empty() {
            let homes: Vec<_> = constraint
                .inputs
                .iter()
                .map(|region| self.tracker.canonical(region))
                .collect();
            let score = |id: DeviceId| homes.iter().filter(|home| **home == Some(id)).count();

            let best = candidates.iter().map(|id| score(*id)).max().unwrap_or(0);
            candidates.retain(|id| score(*id) == best);
        }

        candidates.sort_by_key(|id| self.slots[id.index()].load());
        candidates
    }

    /// Offers a task that just became ready to the queues of its devices.
    pub(crate) fn run_ready(&self, handle: &TaskHandle) {
        let Some(constraint) = handle.constraint() else {
            return;
        };

        let targets = self.select(&constraint);
        tracing::trace!(task = %handle.id(), ?targets, "queued");

        for id in targets {
            self.slots[id.index()].push(handle.clone());
        }
    }

    fn work(self: Arc<Self>, device: DeviceId) {
        let slot = &self.slots[device.index()];

        while let Some(handle) = slot.pop() {
            if let Some(node) = handle.claim(device) {
                self.dispatch(device, &handle, node);
            }

            slot.done();
        }

        tracing::trace!(%device, "worker stopped");
    }

    /// Runs one entry of `device`'s queue spawned in `scope` on the calling
    /// thread, if there is one. Used by task bodies waiting on a nested join
    /// scope. Entries of other scopes stay queued, so the helping stack only
    /// grows with the nesting depth of scopes.
    pub(crate) fn help(self: &Arc<Self>, device: DeviceId, scope: &Arc<ScopeState>) -> bool {
        let slot = &self.slots[device.index()];
        let Some(handle) = slot.take_where(|handle| handle.belongs_to(scope)) else {
            return false;
        };

        if let Some(node) = handle.claim(device) {
            self.dispatch(device, &handle, node);
        }

        slot.done();
        true
    }

    fn dispatch(self: &Arc<Self>, device: DeviceId, handle: &TaskHandle, node: TaskNode) {
        let info = &self.devices[device.index()];
        let name = node.name.to_string();

        let span = tracing::span!(Level::INFO, "task", id = %handle.id(), name = %name, device = %info);
        span.pb_set_style(&self.task_style);
        span.pb_set_message(&format!("Running {name} on {info}"));
        let _enter = span.enter();

        let start = Instant::now();
        let result = self.execute(handle, info, node, span.clone());
        let duration = start.elapsed();

        self.record(TaskRecord {
            id: handle.id(),
            name,
            device,
            start,
            duration,
            state: match result {
                Ok(()) => TaskState::Completed,
                Err(_) => TaskState::Failed,
            },
        });

        match result {
            Ok(()) => self.complete(handle),
            Err(failure) => self.fail(handle, failure),
        }
    }

    fn execute(
        self: &Arc<Self>,
        handle: &TaskHandle,
        device: &DeviceInfo,
        node: TaskNode,
        span: tracing::Span,
    ) -> Result<(), TaskFailure> {
        let outputs: Vec<BufferRegion> = node.outputs().copied().collect();
        let TaskNode {
            name,
            accesses,
            movement,
            body,
            ..
        } = node;

        let movement = movement.unwrap_or(self.config.movement);

        if movement == Movement::Automatic {
            self.stage(&accesses, device.id)
                .map_err(|error| TaskFailure::Data {
                    task: handle.id(),
                    name: name.to_string(),
                    error,
                })?;
        }

        let context = TaskContext::new(self, handle, device, span);

        // Tracker state is only mutated under its own locks.
        let output = match panic::catch_unwind(AssertUnwindSafe(|| body(&context))) {
            Ok(result) => result,
            Err(panic) => Err(anyhow::anyhow!(crate::utils::panic_message(panic.as_ref()))),
        };

        output.map_err(|error| TaskFailure::Body {
            task: handle.id(),
            name: name.to_string(),
            error: Arc::new(error),
        })?;

        if movement == Movement::Automatic {
            for region in &outputs {
                self.tracker.record_write(region, device.id);
            }
        }

        Ok(())
    }

    /// Makes the regions a task touches resident on `device` before it runs.
    ///
    /// Write-only regions are only brought over when they already hold data,
    /// so a partial write keeps the bytes it doesn't touch.
    fn stage(&self, accesses: &[Access], device: DeviceId) -> Result<(), DataError> {
        accesses
            .par_iter()
            .filter(|access| {
                access.mode.reads() || self.tracker.canonical(&access.region).is_some()
            })
            .try_for_each(|access| {
                self.tracker
                    .ensure_resident(&access.region, device)
                    .map(|_| ())
            })
    }
}

/// Starts one named worker thread per device.
pub(crate) fn start_workers(engine: &Arc<Engine>) -> Result<Vec<JoinHandle<()>>, RuntimeError> {
    let mut workers = Vec::with_capacity(engine.devices.len());

    for device in &engine.devices {
        let name = format!("{}-{}{}", engine.config.thread_name, device.class, device.ordinal);
        let id = device.id;
        let worker = Arc::clone(engine);

        match std::thread::Builder::new()
            .name(name)
            .spawn(move || worker.work(id))
        {
            Ok(handle) => workers.push(handle),
            Err(err) => {
                engine.close();
                for handle in workers {
                    let _ = handle.join();
                }
                return Err(err.into());
            }
        }
    }

    Ok(workers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::device::{self, DeviceClass};
    use crate::memory::{ArrayId, BufferRegion, HostMemory};

    fn engine(classes: &[(DeviceClass, Option<u64>)]) -> Engine {
        let devices = device::from_classes(classes.iter().copied());
        Engine::new(Config::default(), devices, Arc::new(HostMemory::new())).unwrap()
    }

    fn constraint(placement: Placement, inputs: Vec<BufferRegion>) -> Constraint {
        Constraint {
            placement,
            footprint: 0,
            inputs,
        }
    }

    #[test]
    fn test_candidates_by_class() {
        let engine = engine(&[
            (DeviceClass::Gpu, None),
            (DeviceClass::Cpu, None),
            (DeviceClass::Cpu, None),
        ]);

        assert_eq!(
            engine.candidates(&Placement::Class(DeviceClass::Cpu), 0),
            vec![DeviceId(1), DeviceId(2)]
        );
        assert_eq!(engine.candidates(&Placement::Any, 0).len(), 3);
    }

    #[test]
    fn test_validate_rejects_unsatisfiable() {
        let engine = engine(&[(DeviceClass::Cpu, Some(16))]);

        assert!(engine.validate(&Placement::Any, 16).is_ok());
        assert!(matches!(
            engine.validate(&Placement::Any, 17),
            Err(SpawnError::InvalidPlacement(_))
        ));
        assert!(matches!(
            engine.validate(&Placement::Class(DeviceClass::Gpu), 0),
            Err(SpawnError::InvalidPlacement(_))
        ));
        assert!(matches!(
            engine.validate(&Placement::Device(DeviceId(4)), 0),
            Err(SpawnError::InvalidPlacement(_))
        ));
        assert!(matches!(
            engine.validate(&Placement::Devices(vec![]), 0),
            Err(SpawnError::InvalidPlacement(_))
        ));
    }

    #[test]
    fn test_select_prefers_data_home() {
        let engine = engine(&[(DeviceClass::Cpu, None), (DeviceClass::Cpu, None)]);
        let a = BufferRegion::new(ArrayId(1), 0..4);
        let b = BufferRegion::new(ArrayId(2), 0..4);

        engine.tracker.record_write(&a, DeviceId(1));
        engine.tracker.record_write(&b, DeviceId(1));

        let targets = engine.select(&constraint(Placement::Any, vec![a, b]));
        assert_eq!(targets, vec![DeviceId(1)]);
    }

    #[test]
    fn test_select_ties_ordered_by_load() {
        let engine = engine(&[(DeviceClass::Cpu, None), (DeviceClass::Cpu, None)]);
        engine.slots[0].push(TaskHandle::anonymous(None));

        let targets = engine.select(&constraint(Placement::Any, vec![]));
        assert_eq!(targets, vec![DeviceId(1), DeviceId(0)]);
    }

    #[test]
    fn test_select_manual_device_ignores_data() {
        let engine = engine(&[(DeviceClass::Cpu, None), (DeviceClass::Cpu, None)]);
        let a = BufferRegion::new(ArrayId(1), 0..4);
        engine.tracker.record_write(&a, DeviceId(1));

        let targets = engine.select(&constraint(Placement::Device(DeviceId(0)), vec![a]));
        assert_eq!(targets, vec![DeviceId(0)]);
    }

    #[test]
    fn test_select_near_falls_back_to_any() {
        let engine = engine(&[(DeviceClass::Cpu, None), (DeviceClass::Gpu, None)]);
        let a = BufferRegion::new(ArrayId(1), 0..4);

        let targets = engine.select(&constraint(Placement::Near(vec![a]), vec![]));
        assert_eq!(targets.len(), 2);

        engine.tracker.record_write(&a, DeviceId(1));
        let targets = engine.select(&constraint(Placement::Near(vec![a]), vec![]));
        assert_eq!(targets, vec![DeviceId(1)]);
    }

    #[test]
    fn test_queue_close_wakes_worker() {
        let queue = Arc::new(SlotQueue::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || queue.pop().is_none())
        };

        queue.close();
        assert!(waiter.join().unwrap());
    }
}
