use std::borrow::Cow;
use std::fmt::{Display, Formatter};
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::context::TaskContext;
use crate::device::{DeviceClass, DeviceId};
use crate::engine::TaskHandle;
use crate::memory::BufferRegion;
use crate::tracker::Movement;

/// Process-unique identity of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TaskId(NonZeroU64);

impl TaskId {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);

        let id = COUNTER.fetch_add(1, Ordering::Relaxed);
        let Some(id) = NonZeroU64::new(id) else {
            Self::exhausted();
        };

        Self(id)
    }

    #[cold]
    fn exhausted() -> ! {
        panic!("failed to generate unique task ID: bitspace exhausted")
    }

    pub fn as_u64(&self) -> u64 {
        self.0.get()
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle of a spawned task.
///
/// ```text
/// Waiting -> Ready -> Running -> Completed
///    |                   |
///    +-------------------+------> Failed
/// ```
///
/// Transitions only move forward, terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TaskState {
    Waiting,
    Ready,
    Running,
    Completed,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_advance_to(self, next: TaskState) -> bool {
        use TaskState::*;

        matches!(
            (self, next),
            (Waiting, Ready)
                | (Waiting, Failed)
                | (Ready, Running)
                | (Running, Completed)
                | (Running, Failed)
        )
    }
}

impl Display for TaskState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Where a task may execute.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Placement {
    /// Any device.
    #[default]
    Any,
    /// Any device of the class.
    Class(DeviceClass),
    /// Any device of any listed class.
    Classes(Vec<DeviceClass>),
    /// Exactly this device, bypassing the locality heuristic.
    Device(DeviceId),
    /// Any of the listed devices.
    Devices(Vec<DeviceId>),
    /// Any device holding the canonical copy of one of the regions when the
    /// task becomes ready, or any device if none of them is held anywhere.
    Near(Vec<BufferRegion>),
}

impl From<DeviceClass> for Placement {
    fn from(class: DeviceClass) -> Self {
        Placement::Class(class)
    }
}

impl From<DeviceId> for Placement {
    fn from(device: DeviceId) -> Self {
        Placement::Device(device)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
    ReadWrite,
}

impl AccessMode {
    pub fn reads(self) -> bool {
        matches!(self, AccessMode::Read | AccessMode::ReadWrite)
    }

    pub fn writes(self) -> bool {
        matches!(self, AccessMode::Write | AccessMode::ReadWrite)
    }
}

/// A region a task declares it reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Access {
    pub region: BufferRegion,
    pub mode: AccessMode,
}

/// Executable body of a task.
pub type Body = Box<dyn for<'a> FnOnce(&TaskContext<'a>) -> anyhow::Result<()> + Send>;

/// One unit of schedulable work, bound to a handle when spawned.
pub(crate) struct TaskNode {
    pub name: Cow<'static, str>,
    pub dependencies: Vec<TaskHandle>,
    pub placement: Placement,
    pub footprint: u64,
    pub accesses: Vec<Access>,
    pub movement: Option<Movement>,
    pub body: Body,
}

impl TaskNode {
    pub fn inputs(&self) -> impl Iterator<Item = &BufferRegion> {
        self.accesses
            .iter()
            .filter(|access| access.mode.reads())
            .map(|access| &access.region)
    }

    pub fn outputs(&self) -> impl Iterator<Item = &BufferRegion> {
        self.accesses
            .iter()
            .filter(|access| access.mode.writes())
            .map(|access| &access.region)
    }
}

/// The part of a node the scheduler needs to pick a device, kept in the task
/// cell after the body moved to a worker.
#[derive(Debug, Clone)]
pub(crate) struct Constraint {
    pub placement: Placement,
    pub footprint: u64,
    pub inputs: Vec<BufferRegion>,
}

impl From<&TaskNode> for Constraint {
    fn from(node: &TaskNode) -> Self {
        Self {
            placement: node.placement.clone(),
            footprint: node.footprint,
            inputs: node.inputs().copied().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ArrayId;

    #[test]
    fn test_forward_transitions() {
        use TaskState::*;

        assert!(Waiting.can_advance_to(Ready));
        assert!(Ready.can_advance_to(Running));
        assert!(Running.can_advance_to(Completed));
        assert!(Running.can_advance_to(Failed));
        assert!(Waiting.can_advance_to(Failed));
    }

    #[test]
    fn test_no_backward_or_terminal_transitions() {
        use TaskState::*;

        assert!(!Ready.can_advance_to(Waiting));
        assert!(!Running.can_advance_to(Ready));
        assert!(!Ready.can_advance_to(Failed));
        assert!(!Completed.can_advance_to(Failed));
        assert!(!Failed.can_advance_to(Completed));
        assert!(!Waiting.can_advance_to(Running));
        assert!(Completed.is_terminal() && Failed.is_terminal());
    }

    #[test]
    fn test_task_ids_unique() {
        let ids: std::collections::HashSet<_> = (0..64).map(|_| TaskId::next()).collect();
        assert_eq!(ids.len(), 64);
    }

    #[test]
    fn test_access_modes() {
        let region = BufferRegion::new(ArrayId(0), 0..8);
        let accesses = [
            Access { region, mode: AccessMode::Read },
            Access { region, mode: AccessMode::Write },
            Access { region, mode: AccessMode::ReadWrite },
        ];

        let reads = accesses.iter().filter(|a| a.mode.reads()).count();
        let writes = accesses.iter().filter(|a| a.mode.writes()).count();
        assert_eq!((reads, writes), (2, 2));
    }

    fn noop(_: &TaskContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    #[test]
    fn test_node_inputs_and_outputs() {
        let a = BufferRegion::new(ArrayId(0), 0..8);
        let b = BufferRegion::new(ArrayId(0), 8..16);
        let c = BufferRegion::new(ArrayId(1), 0..4);

        let node = TaskNode {
            name: Cow::Borrowed("node"),
            dependencies: vec![],
            placement: Placement::Any,
            footprint: 0,
            accesses: vec![
                Access { region: a, mode: AccessMode::Read },
                Access { region: b, mode: AccessMode::Write },
                Access { region: c, mode: AccessMode::ReadWrite },
            ],
            movement: None,
            body: Box::new(noop),
        };

        assert_eq!(node.inputs().copied().collect::<Vec<_>>(), vec![a, c]);
        assert_eq!(node.outputs().copied().collect::<Vec<_>>(), vec![b, c]);
    }
}
