use std::fmt::{Debug, Formatter};
use std::hash::{Hash, Hasher};
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::device::DeviceId;
use crate::engine::scope::ScopeState;
use crate::error::TaskFailure;
use crate::key::TaskKey;
use crate::node::{Constraint, TaskId, TaskNode, TaskState};

/// The identity of a task slot.
///
/// A handle exists before the task does: resolving a key creates one, and
/// other tasks may depend on it right away. Spawning binds a body to it, at
/// most once. Cloning is cheap, clones compare equal by task id.
#[derive(Clone)]
pub struct TaskHandle(pub(crate) Arc<TaskCell>);

pub(crate) struct TaskCell {
    pub id: TaskId,
    pub name: String,
    pub key: Option<TaskKey>,
    /// Predecessors not completed yet, plus one while registration runs.
    pub pending: AtomicUsize,
    pub inner: Mutex<CellInner>,
}

#[derive(Default)]
pub(crate) struct CellInner {
    /// `None` until a body is bound.
    pub state: Option<TaskState>,
    pub node: Option<TaskNode>,
    pub constraint: Option<Constraint>,
    pub dependents: Vec<TaskHandle>,
    /// Set together with the `Failed` state.
    pub failure: Option<TaskFailure>,
    pub scopes: Vec<Arc<ScopeState>>,
    pub device: Option<DeviceId>,
}

pub(crate) enum Attach {
    Satisfied,
    Failed(TaskFailure),
    Pending,
}

impl TaskHandle {
    fn from_cell(id: TaskId, name: String, key: Option<TaskKey>) -> Self {
        Self(Arc::new(TaskCell {
            id,
            name,
            key,
            pending: AtomicUsize::new(0),
            inner: Mutex::new(CellInner::default()),
        }))
    }

    pub(crate) fn keyed(space: &str, key: TaskKey) -> Self {
        Self::from_cell(TaskId::next(), format!("{space}{key}"), Some(key))
    }

    /// A handle outside of any task space.
    pub(crate) fn anonymous(name: Option<&str>) -> Self {
        let id = TaskId::next();
        let name = match name {
            Some(name) => name.to_string(),
            None => format!("task{id}"),
        };
        Self::from_cell(id, name, None)
    }

    pub fn id(&self) -> TaskId {
        self.0.id
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn key(&self) -> Option<&TaskKey> {
        self.0.key.as_ref()
    }

    /// Current state, `None` while no task has been spawned for the handle.
    pub fn state(&self) -> Option<TaskState> {
        self.lock().state
    }

    pub fn is_spawned(&self) -> bool {
        self.state().is_some()
    }

    pub fn failure(&self) -> Option<TaskFailure> {
        self.lock().failure.clone()
    }

    /// The device the task was dispatched to.
    pub fn device(&self) -> Option<DeviceId> {
        self.lock().device
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, CellInner> {
        self.0.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves the task from `from` to `to`, failing if it is not in `from`.
    pub(crate) fn transition(&self, from: TaskState, to: TaskState) -> bool {
        debug_assert!(from.can_advance_to(to));
        let mut inner = self.lock();

        if inner.state == Some(from) {
            inner.state = Some(to);
            true
        } else {
            false
        }
    }

    /// Registers `dependent` to be notified when this task finishes, unless it
    /// already has.
    pub(crate) fn attach(&self, dependent: &TaskHandle) -> Attach {
        let mut inner = self.lock();

        if let Some(failure) = &inner.failure {
            return Attach::Failed(failure.clone());
        }

        if inner.state == Some(TaskState::Completed) {
            return Attach::Satisfied;
        }

        inner.dependents.push(dependent.clone());
        Attach::Pending
    }

    /// Claims a ready task for `device`. Only the first claim succeeds, the
    /// other queues holding the task see `None` and skip it.
    pub(crate) fn claim(&self, device: DeviceId) -> Option<TaskNode> {
        let mut inner = self.lock();

        if inner.state != Some(TaskState::Ready) {
            return None;
        }

        inner.state = Some(TaskState::Running);
        inner.device = Some(device);
        inner.node.take()
    }

    /// Whether the task was spawned in `scope` and has not finished yet.
    pub(crate) fn belongs_to(&self, scope: &Arc<ScopeState>) -> bool {
        self.lock()
            .scopes
            .iter()
            .any(|entered| Arc::ptr_eq(entered, scope))
    }

    pub(crate) fn constraint(&self) -> Option<Constraint> {
        self.lock().constraint.clone()
    }
}

impl PartialEq for TaskHandle {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for TaskHandle {}

impl Hash for TaskHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

impl Debug for TaskHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.0.id)
            .field("name", &self.0.name)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unbound_handle() {
        let handle = TaskHandle::anonymous(None);
        assert_eq!(handle.state(), None);
        assert!(!handle.is_spawned());
        assert!(handle.name().starts_with("task#"));
    }

    #[test]
    fn test_attach_to_pending_then_completed() {
        let producer = TaskHandle::anonymous(Some("producer"));
        let consumer = TaskHandle::anonymous(Some("consumer"));

        assert!(matches!(producer.attach(&consumer), Attach::Pending));
        assert_eq!(producer.lock().dependents.len(), 1);

        producer.lock().state = Some(TaskState::Completed);
        assert!(matches!(producer.attach(&consumer), Attach::Satisfied));
    }

    #[test]
    fn test_claim_once() {
        let handle = TaskHandle::anonymous(None);
        handle.lock().state = Some(TaskState::Ready);

        // no node bound, but the state still moves exactly once
        assert!(handle.claim(DeviceId(0)).is_none());
        assert_eq!(handle.state(), Some(TaskState::Running));
        assert_eq!(handle.device(), Some(DeviceId(0)));
        assert!(!handle.transition(TaskState::Ready, TaskState::Running));
    }
}
