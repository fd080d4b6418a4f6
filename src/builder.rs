use std::borrow::Cow;
use std::collections::HashSet;
use std::sync::Arc;

use crate::context::TaskContext;
use crate::device::DeviceId;
use crate::engine::{self, Dependencies, Engine, ScopeState, TaskHandle};
use crate::error::SpawnError;
use crate::memory::BufferRegion;
use crate::node::{Access, AccessMode, Placement, TaskNode};
use crate::tracker::Movement;

/// Definition of a task, spawned by [`TaskDef::run`].
///
/// ```rust,no_run
/// use shikumi::{Config, DeviceClass, Runtime, TaskSpace};
///
/// let runtime = Runtime::new(Config::default()).unwrap();
/// let t = TaskSpace::new("t");
///
/// runtime
///     .join(|scope| {
///         for i in 0..4 {
///             scope
///                 .task()
///                 .id(&t.get(i).unwrap())
///                 .depends_on(t.resolve(0..i))
///                 .placement(DeviceClass::Cpu)
///                 .run(move |ctx| {
///                     println!("{} on {}", ctx.name(), ctx.device());
///                     Ok(())
///                 })
///                 .unwrap();
///         }
///     })
///     .unwrap();
/// ```
pub struct TaskDef<'a> {
    engine: &'a Arc<Engine>,
    scope: Option<&'a Arc<ScopeState>>,
    handle: Option<TaskHandle>,
    name: Option<Cow<'static, str>>,
    dependencies: Vec<TaskHandle>,
    placement: Placement,
    footprint: Option<u64>,
    accesses: Vec<Access>,
    movement: Option<Movement>,
}

impl<'a> TaskDef<'a> {
    pub(crate) fn new(engine: &'a Arc<Engine>, scope: Option<&'a Arc<ScopeState>>) -> Self {
        Self {
            engine,
            scope,
            handle: None,
            name: None,
            dependencies: Vec::new(),
            placement: Placement::Any,
            footprint: None,
            accesses: Vec::new(),
            movement: None,
        }
    }

    /// Binds the task to a handle, usually one resolved from a task space.
    /// Without it the task gets a fresh anonymous handle.
    pub fn id(mut self, handle: &TaskHandle) -> Self {
        self.handle = Some(handle.clone());
        self
    }

    /// Label used in logs and diagnostics, defaults to the handle's name.
    pub fn name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Adds predecessors. May be called repeatedly, duplicates are ignored.
    pub fn depends_on(mut self, dependencies: impl Dependencies) -> Self {
        dependencies.collect(&mut self.dependencies);
        self
    }

    pub fn placement(mut self, placement: impl Into<Placement>) -> Self {
        self.placement = placement.into();
        self
    }

    /// Pins the task to a single device.
    pub fn on(self, device: DeviceId) -> Self {
        self.placement(Placement::Device(device))
    }

    /// Memory the task needs on its device. Defaults to the total size of the
    /// declared regions.
    pub fn footprint(mut self, bytes: u64) -> Self {
        self.footprint = Some(bytes);
        self
    }

    pub fn reads(self, region: BufferRegion) -> Self {
        self.access(region, AccessMode::Read)
    }

    pub fn writes(self, region: BufferRegion) -> Self {
        self.access(region, AccessMode::Write)
    }

    pub fn updates(self, region: BufferRegion) -> Self {
        self.access(region, AccessMode::ReadWrite)
    }

    fn access(mut self, region: BufferRegion, mode: AccessMode) -> Self {
        self.accesses.push(Access { region, mode });
        self
    }

    /// Overrides the runtime's data movement policy for this task.
    pub fn movement(mut self, movement: Movement) -> Self {
        self.movement = Some(movement);
        self
    }

    /// Spawns the task. Returns as soon as it is registered, the body runs
    /// later on a worker.
    pub fn run<F>(self, body: F) -> Result<TaskHandle, SpawnError>
    where
        F: FnOnce(&TaskContext<'_>) -> anyhow::Result<()> + Send + 'static,
    {
        let handle = self
            .handle
            .unwrap_or_else(|| TaskHandle::anonymous(self.name.as_deref()));
        let name = self
            .name
            .unwrap_or_else(|| Cow::Owned(handle.name().to_string()));
        let footprint = self
            .footprint
            .unwrap_or_else(|| declared_bytes(&self.accesses));

        let node = TaskNode {
            name,
            dependencies: engine::flatten(&self.dependencies),
            placement: self.placement,
            footprint,
            accesses: self.accesses,
            movement: self.movement,
            body: Box::new(body),
        };

        self.engine.spawn(handle, node, self.scope)
    }
}

fn declared_bytes(accesses: &[Access]) -> u64 {
    let mut seen = HashSet::new();

    accesses
        .iter()
        .filter(|access| seen.insert(access.region))
        .map(|access| access.region.extent() as u64)
        .sum()
}
