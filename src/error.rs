use std::fmt::{Display, Formatter};
use std::sync::Arc;

use thiserror::Error;

use crate::device::DeviceId;
use crate::memory::BufferRegion;
use crate::node::TaskId;

/// Errors reported synchronously to the caller of `spawn`.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("Task '{task}' has already been spawned")]
    DuplicateSpawn { task: String },

    #[error("Invalid placement: {0}")]
    InvalidPlacement(String),

    #[error("Spawning task '{task}' would close a dependency cycle")]
    DependencyCycle { task: String },

    #[error("The runtime is shutting down")]
    Shutdown,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("Key expression expands to {0} keys, expected exactly one")]
    Ambiguous(usize),
}

/// Errors raised by the data location tracker and device memory.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DataError {
    #[error("Region {0} has never been written, there is no canonical copy to move")]
    NoCanonicalCopy(BufferRegion),

    #[error("Region {region} has no buffer on {device}")]
    MissingBuffer { region: BufferRegion, device: DeviceId },

    #[error("Region {region} is not resident on {device}")]
    NotResident { region: BufferRegion, device: DeviceId },

    #[error("Region {region} spans {expected} bytes, got {actual}")]
    ExtentMismatch {
        region: BufferRegion,
        expected: usize,
        actual: usize,
    },

    #[error("Unknown device {0}")]
    UnknownDevice(DeviceId),
}

/// A runtime failure of a single task.
///
/// Failures never get retried. They travel along dependency edges, every
/// dependent of a failed task fails with [`TaskFailure::Cascaded`], and they
/// are re-raised when the enclosing join scope closes.
#[derive(Debug, Clone)]
pub enum TaskFailure {
    /// The body returned an error or panicked.
    Body {
        task: TaskId,
        name: String,
        error: Arc<anyhow::Error>,
    },
    /// Implicit data movement failed before the body could run.
    Data {
        task: TaskId,
        name: String,
        error: DataError,
    },
    /// A predecessor failed, so this task never ran.
    Cascaded {
        task: TaskId,
        name: String,
        origin: Box<TaskFailure>,
    },
}

impl TaskFailure {
    pub fn task(&self) -> TaskId {
        match self {
            TaskFailure::Body { task, .. }
            | TaskFailure::Data { task, .. }
            | TaskFailure::Cascaded { task, .. } => *task,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            TaskFailure::Body { name, .. }
            | TaskFailure::Data { name, .. }
            | TaskFailure::Cascaded { name, .. } => name,
        }
    }

    /// The failure that started the cascade, `self` for a direct failure.
    pub fn root(&self) -> &TaskFailure {
        match self {
            TaskFailure::Cascaded { origin, .. } => origin.root(),
            other => other,
        }
    }

    pub fn is_cascaded(&self) -> bool {
        matches!(self, TaskFailure::Cascaded { .. })
    }
}

impl Display for TaskFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskFailure::Body { name, error, .. } => write!(f, "Task '{name}': {error}"),
            TaskFailure::Data { name, error, .. } => {
                write!(f, "Task '{name}': data movement failed: {error}")
            }
            TaskFailure::Cascaded { name, origin, .. } => {
                write!(f, "Task '{name}': predecessor '{}' failed", origin.name())
            }
        }
    }
}

impl std::error::Error for TaskFailure {}

/// Aggregate failure surfaced when a join scope closes.
#[derive(Debug, Clone)]
pub struct JoinError {
    pub failures: Vec<TaskFailure>,
    /// Tasks of the scope that never finished because the runtime shut down
    /// while the scope was draining.
    pub abandoned: usize,
}

impl JoinError {
    /// Failures that originated in a body or in data movement, skipping the
    /// cascaded ones.
    pub fn roots(&self) -> impl Iterator<Item = &TaskFailure> {
        self.failures.iter().filter(|failure| !failure.is_cascaded())
    }
}

impl Display for JoinError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{} task(s) failed inside the join scope:", self.failures.len())?;
        for failure in &self.failures {
            writeln!(f, "  - {failure}")?;
        }
        if self.abandoned > 0 {
            writeln!(f, "{} task(s) abandoned by shutdown", self.abandoned)?;
        }
        Ok(())
    }
}

impl std::error::Error for JoinError {}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("No devices available for scheduling")]
    NoDevices,

    #[error("Couldn't parse configuration.\n{0}")]
    Config(#[from] serde_json::Error),

    #[error("Couldn't start a device worker.\n{0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid progress style template.\n{0}")]
    Template(#[from] indicatif::style::TemplateError),
}
