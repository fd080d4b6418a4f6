use std::sync::Arc;

use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::builder::TaskDef;
use crate::device::{DeviceId, DeviceInfo};
use crate::engine::scope::run_scope;
use crate::engine::{Engine, JoinScope, TaskHandle};
use crate::error::{DataError, JoinError};
use crate::memory::BufferRegion;
use crate::node::TaskId;

/// What a running task body can see and do.
///
/// The context is only valid while the body runs. It gives access to the
/// executing device and to the data location tracker, and lets the body
/// spawn further tasks or open a nested join scope.
pub struct TaskContext<'a> {
    engine: &'a Arc<Engine>,
    handle: &'a TaskHandle,
    device: &'a DeviceInfo,
    span: tracing::Span,
}

impl<'a> TaskContext<'a> {
    pub(crate) fn new(
        engine: &'a Arc<Engine>,
        handle: &'a TaskHandle,
        device: &'a DeviceInfo,
        span: tracing::Span,
    ) -> Self {
        Self {
            engine,
            handle,
            device,
            span,
        }
    }

    pub fn id(&self) -> TaskId {
        self.handle.id()
    }

    pub fn name(&self) -> &str {
        self.handle.name()
    }

    pub fn handle(&self) -> &TaskHandle {
        self.handle
    }

    /// The device this task is executing on.
    pub fn device(&self) -> &DeviceInfo {
        self.device
    }

    /// Makes sure the executing device holds a valid copy of `region`.
    pub fn ensure_resident(&self, region: &BufferRegion) -> Result<DeviceId, DataError> {
        self.engine.tracker.ensure_resident(region, self.device.id)
    }

    /// Records that this task wrote `region` on the executing device.
    pub fn record_write(&self, region: &BufferRegion) {
        self.engine.tracker.record_write(region, self.device.id);
    }

    /// Reads the executing device's copy of `region`.
    pub fn read(&self, region: &BufferRegion) -> Result<Vec<u8>, DataError> {
        self.engine.tracker.read(region, self.device.id)
    }

    /// Stores new contents for `region` on the executing device.
    pub fn write(&self, region: &BufferRegion, bytes: &[u8]) -> Result<(), DataError> {
        self.engine.tracker.write(region, self.device.id, bytes)
    }

    /// Starts the definition of a task outside of any join scope.
    pub fn task(&self) -> TaskDef<'_> {
        TaskDef::new(self.engine, None)
    }

    /// Opens a join scope and waits until it drains. Meanwhile the executing
    /// device keeps running tasks from its own queue.
    pub fn join<R>(&self, f: impl FnOnce(&JoinScope<'_>) -> R) -> Result<R, JoinError> {
        run_scope(self.engine, 1, Some(self.device.id), f).map(|(value, _)| value)
    }

    /// Updates the message shown next to this task's progress spinner.
    pub fn set_message(&self, message: &str) {
        self.span.pb_set_message(message);
    }
}
