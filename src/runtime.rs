use std::sync::{Arc, PoisonError};
use std::thread::JoinHandle;

use console::style;

use crate::builder::TaskDef;
use crate::config::Config;
use crate::device::{self, DeviceClass, DeviceId, DeviceInfo};
use crate::diagnostics::Diagnostics;
use crate::engine::scheduler::start_workers;
use crate::engine::scope::run_scope;
use crate::engine::{Engine, JoinReport, JoinScope};
use crate::error::{DataError, JoinError, RuntimeError};
use crate::memory::{BufferRegion, DeviceMemory, HostMemory};
use crate::tracker::DataTracker;

/// The scheduler together with its device pool.
///
/// Creating a runtime enumerates the devices and starts one worker thread per
/// device. Dropping it stops the workers, tasks still queued at that point
/// are abandoned, so the usual shape of a program is a single top-level
/// [`Runtime::join`] that waits for everything it spawned.
///
/// ```rust,no_run
/// use shikumi::{Config, Runtime};
///
/// let runtime = Runtime::new(Config::default().with_env()).unwrap();
///
/// runtime
///     .join(|scope| {
///         let a = scope.task().name("a").run(|_| Ok(())).unwrap();
///         scope.task().name("b").depends_on(&a).run(|_| Ok(())).unwrap();
///     })
///     .unwrap();
/// ```
pub struct Runtime {
    engine: Arc<Engine>,
    workers: Vec<JoinHandle<()>>,
}

impl Runtime {
    /// Starts a runtime over the devices described by `config`, backed by
    /// host memory.
    pub fn new(config: Config) -> Result<Self, RuntimeError> {
        let devices = device::enumerate(&config);
        Self::from_parts(config, devices, Arc::new(HostMemory::new()))
    }

    /// Starts a runtime over an explicit device list and memory backend.
    pub fn from_parts(
        config: Config,
        devices: Vec<DeviceInfo>,
        memory: Arc<dyn DeviceMemory>,
    ) -> Result<Self, RuntimeError> {
        crate::utils::init_logging()?;

        if devices.is_empty() {
            return Err(RuntimeError::NoDevices);
        }

        let summary = devices
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");

        eprintln!(
            "Running {} on {} device(s): {}",
            style("shikumi").red(),
            style(devices.len()).blue(),
            summary
        );

        let engine = Arc::new(Engine::new(config, devices, memory)?);
        let workers = start_workers(&engine)?;

        tracing::info!(devices = engine.devices.len(), "runtime started");

        Ok(Self { engine, workers })
    }

    pub fn devices(&self) -> &[DeviceInfo] {
        &self.engine.devices
    }

    /// Looks up the `ordinal`-th device of a class.
    pub fn device(&self, class: DeviceClass, ordinal: usize) -> Option<&DeviceInfo> {
        self.engine
            .devices
            .iter()
            .find(|device| device.class == class && device.ordinal == ordinal)
    }

    pub fn config(&self) -> &Config {
        &self.engine.config
    }

    /// Starts the definition of a task outside of any join scope.
    pub fn task(&self) -> TaskDef<'_> {
        TaskDef::new(&self.engine, None)
    }

    /// Opens a top-level join scope, runs `f` in it and blocks until every
    /// task spawned through the scope has finished.
    ///
    /// Failures of any of those tasks are collected into the returned
    /// [`JoinError`]. When `report_timing` is enabled the elapsed time is
    /// printed to stdout as `Time elapsed: <seconds>`.
    pub fn join<R>(&self, f: impl FnOnce(&JoinScope<'_>) -> R) -> Result<R, JoinError> {
        self.join_report(f).map(|(value, _)| value)
    }

    /// Like [`Runtime::join`], also returning how long the scope took.
    pub fn join_report<R>(
        &self,
        f: impl FnOnce(&JoinScope<'_>) -> R,
    ) -> Result<(R, JoinReport), JoinError> {
        run_scope(&self.engine, 0, None, f)
    }

    /// Seeds the canonical copy of `region` on `device`.
    pub fn place(&self, region: &BufferRegion, device: DeviceId, bytes: &[u8]) -> Result<(), DataError> {
        if device.index() >= self.engine.devices.len() {
            return Err(DataError::UnknownDevice(device));
        }

        self.engine.tracker.write(region, device, bytes)
    }

    /// Reads the canonical copy of `region`, wherever it lives.
    pub fn read(&self, region: &BufferRegion) -> Result<Vec<u8>, DataError> {
        self.engine.tracker.read_canonical(region)
    }

    pub fn tracker(&self) -> &DataTracker {
        &self.engine.tracker
    }

    /// Snapshot of everything executed and declared so far.
    ///
    /// Execution records and dependency edges accumulate for the lifetime of
    /// the runtime. Records can be dropped between top-level joins with
    /// [`Runtime::clear_records`]. Edges are kept, since a task spawned later
    /// may still close a cycle through them.
    pub fn diagnostics(&self) -> Diagnostics {
        let records = self
            .engine
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let graph = self
            .engine
            .graph
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        Diagnostics {
            records,
            movement: self.engine.tracker.stats(),
            edges: graph.edges.all_edges().map(|(a, b, _)| (a, b)).collect(),
            names: graph.names.clone(),
        }
    }

    /// Drops the execution records collected so far.
    pub fn clear_records(&self) {
        self.engine
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Stops the workers and waits for them to exit.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if self.workers.is_empty() {
            return;
        }

        self.engine.close();

        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                tracing::error!("A device worker panicked");
            }
        }

        tracing::info!("runtime stopped");
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.stop();
    }
}
