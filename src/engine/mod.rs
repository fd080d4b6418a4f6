//! The moving parts of the runtime.
//!
//! [`Engine`] is the state shared between the application thread and the
//! device workers. Its behaviour is split by concern:
//!
//! * `resolver` turns predecessors into a wait count and fires dependents,
//! * `scheduler` owns the per-device ready queues and the workers,
//! * `scope` implements the join barrier.

mod cell;
mod resolver;
pub(crate) mod scheduler;
pub(crate) mod scope;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use indicatif::ProgressStyle;
use petgraph::Direction;
use petgraph::algo::has_path_connecting;
use petgraph::graphmap::DiGraphMap;

use crate::config::Config;
use crate::device::DeviceInfo;
use crate::diagnostics::TaskRecord;
use crate::error::{RuntimeError, SpawnError};
use crate::memory::DeviceMemory;
use crate::node::{Constraint, TaskId, TaskNode, TaskState};
use crate::tracker::DataTracker;

pub use crate::engine::cell::TaskHandle;
pub use crate::engine::scope::{JoinReport, JoinScope};

pub(crate) use crate::engine::scheduler::SlotQueue;
pub(crate) use crate::engine::scope::ScopeState;

/// Every dependency edge declared so far, used for cycle detection and
/// diagnostics.
pub(crate) struct TaskGraph {
    pub edges: DiGraphMap<TaskId, ()>,
    pub names: HashMap<TaskId, String>,
}

impl Default for TaskGraph {
    fn default() -> Self {
        Self {
            edges: DiGraphMap::new(),
            names: HashMap::new(),
        }
    }
}

pub(crate) struct Engine {
    pub config: Config,
    pub devices: Vec<DeviceInfo>,
    pub slots: Vec<SlotQueue>,
    pub tracker: DataTracker,
    pub graph: Mutex<TaskGraph>,
    pub records: Mutex<Vec<TaskRecord>>,
    pub task_style: ProgressStyle,
    pub scope_style: ProgressStyle,
    shutdown: AtomicBool,
}

impl Engine {
    pub(crate) fn new(
        config: Config,
        devices: Vec<DeviceInfo>,
        memory: Arc<dyn DeviceMemory>,
    ) -> Result<Self, RuntimeError> {
        Ok(Self {
            slots: devices.iter().map(|_| SlotQueue::new()).collect(),
            tracker: DataTracker::new(memory),
            graph: Mutex::new(TaskGraph::default()),
            records: Mutex::new(Vec::new()),
            task_style: crate::utils::get_style_task()?,
            scope_style: crate::utils::get_style_scope()?,
            shutdown: AtomicBool::new(false),
            config,
            devices,
        })
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Stops accepting tasks and wakes every worker so it can exit.
    pub(crate) fn close(&self) {
        self.shutdown.store(true, Ordering::Release);
        for slot in &self.slots {
            slot.close();
        }
    }

    /// Binds `node` to `handle` and registers it with the resolver.
    ///
    /// Never blocks on other tasks and never runs the body inline.
    pub(crate) fn spawn(
        self: &Arc<Self>,
        handle: TaskHandle,
        node: TaskNode,
        scope: Option<&Arc<ScopeState>>,
    ) -> Result<TaskHandle, SpawnError> {
        if self.is_shutdown() {
            return Err(SpawnError::Shutdown);
        }

        self.validate(&node.placement, node.footprint)?;
        let dependencies = node.dependencies.clone();

        {
            let mut inner = handle.lock();

            if inner.state.is_some() {
                return Err(SpawnError::DuplicateSpawn {
                    task: handle.name().to_string(),
                });
            }

            self.link(&handle, &node.name, &dependencies)?;

            inner.constraint = Some(Constraint::from(&node));
            inner.node = Some(node);
            inner.state = Some(TaskState::Waiting);

            if let Some(scope) = scope {
                scope.enter();
                inner.scopes.push(Arc::clone(scope));
            }
        }

        tracing::debug!(
            task = %handle.id(),
            name = handle.name(),
            dependencies = dependencies.len(),
            "spawned"
        );

        self.register(&handle, &dependencies);
        Ok(handle)
    }

    fn link(
        &self,
        handle: &TaskHandle,
        name: &str,
        dependencies: &[TaskHandle],
    ) -> Result<(), SpawnError> {
        let mut graph = self.graph.lock().unwrap_or_else(PoisonError::into_inner);
        let id = handle.id();

        // Only a task somebody already depends on can close a cycle.
        let referenced = graph.edges.contains_node(id)
            && graph
                .edges
                .neighbors_directed(id, Direction::Outgoing)
                .next()
                .is_some();

        for dependency in dependencies {
            let cycle = dependency.id() == id
                || (referenced && has_path_connecting(&graph.edges, id, dependency.id(), None));

            if cycle {
                return Err(SpawnError::DependencyCycle {
                    task: handle.name().to_string(),
                });
            }
        }

        graph.edges.add_node(id);
        graph.names.insert(id, name.to_string());

        for dependency in dependencies {
            graph.edges.add_edge(dependency.id(), id, ());
            graph
                .names
                .entry(dependency.id())
                .or_insert_with(|| dependency.name().to_string());
        }

        Ok(())
    }

    pub(crate) fn record(&self, record: TaskRecord) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }
}

/// Anything that can be declared as the dependencies of a task.
///
/// Implemented for handles, references, vectors, slices, arrays, options and
/// tuples of those (up to eight), so the result of [`TaskSpace::resolve`]
/// and single handles can be mixed freely:
///
/// ```rust,no_run
/// # use shikumi::{Config, Runtime, TaskSpace};
/// # let runtime = Runtime::new(Config::default()).unwrap();
/// let solve = TaskSpace::new("solve");
/// let gemm = TaskSpace::new("gemm");
/// let j = 3;
///
/// runtime.task()
///     .id(&solve.get((j, 0)).unwrap())
///     .depends_on((gemm.resolve((j, 0..j)), solve.get((0, 0)).unwrap()))
///     .run(|_| Ok(()))
///     .unwrap();
/// ```
///
/// [`TaskSpace::resolve`]: crate::TaskSpace::resolve
pub trait Dependencies {
    /// Appends every handle, in declaration order, to `out`.
    fn collect(&self, out: &mut Vec<TaskHandle>);
}

/// Flattens dependencies into a list without duplicates, keeping the first
/// occurrence of every task.
pub(crate) fn flatten(dependencies: &[TaskHandle]) -> Vec<TaskHandle> {
    let mut seen = HashSet::with_capacity(dependencies.len());

    dependencies
        .iter()
        .filter(|handle| seen.insert(handle.id()))
        .cloned()
        .collect()
}

impl Dependencies for () {
    fn collect(&self, _: &mut Vec<TaskHandle>) {}
}

impl Dependencies for TaskHandle {
    fn collect(&self, out: &mut Vec<TaskHandle>) {
        out.push(self.clone());
    }
}

impl<D> Dependencies for &D
where
    D: Dependencies + ?Sized,
{
    fn collect(&self, out: &mut Vec<TaskHandle>) {
        (**self).collect(out);
    }
}

impl<D> Dependencies for [D]
where
    D: Dependencies,
{
    fn collect(&self, out: &mut Vec<TaskHandle>) {
        for item in self {
            item.collect(out);
        }
    }
}

impl<D, const N: usize> Dependencies for [D; N]
where
    D: Dependencies,
{
    fn collect(&self, out: &mut Vec<TaskHandle>) {
        self.as_slice().collect(out);
    }
}

impl<D> Dependencies for Vec<D>
where
    D: Dependencies,
{
    fn collect(&self, out: &mut Vec<TaskHandle>) {
        self.as_slice().collect(out);
    }
}

impl<D> Dependencies for Option<D>
where
    D: Dependencies,
{
    fn collect(&self, out: &mut Vec<TaskHandle>) {
        if let Some(item) = self {
            item.collect(out);
        }
    }
}

macro_rules! impl_deps {
    ($($D:ident),*) => {
        #[allow(non_snake_case)]
        impl<$($D),*> Dependencies for ($($D,)*)
        where
            $($D: Dependencies),*
        {
            fn collect(&self, out: &mut Vec<TaskHandle>) {
                let ($($D,)*) = self;
                $($D.collect(out);)*
            }
        }
    };
}

impl_deps!(A);
impl_deps!(A, B);
impl_deps!(A, B, C);
impl_deps!(A, B, C, D);
impl_deps!(A, B, C, D, E);
impl_deps!(A, B, C, D, E, F);
impl_deps!(A, B, C, D, E, F, G);
impl_deps!(A, B, C, D, E, F, G, H);
