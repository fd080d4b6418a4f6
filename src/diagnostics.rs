use std::collections::HashMap;
use std::fmt::Write;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::device::DeviceId;
use crate::node::{TaskId, TaskState};
use crate::tracker::MovementStats;

/// Execution record of a single dispatched task.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub id: TaskId,
    pub name: String,
    pub device: DeviceId,
    pub start: Instant,
    pub duration: Duration,
    /// `Completed` or `Failed`.
    pub state: TaskState,
}

/// Snapshot of what the runtime has executed so far.
///
/// Returned by [`Runtime::diagnostics`](crate::Runtime::diagnostics).
#[derive(Debug, Default)]
pub struct Diagnostics {
    /// Dispatched tasks in dispatch completion order.
    pub records: Vec<TaskRecord>,
    /// Data moved between devices.
    pub movement: MovementStats,
    pub(crate) edges: Vec<(TaskId, TaskId)>,
    pub(crate) names: HashMap<TaskId, String>,
}

#[derive(Serialize)]
struct JsonRecord<'a> {
    id: u64,
    name: &'a str,
    device: DeviceId,
    start_us: u64,
    duration_us: u64,
    state: TaskState,
}

#[derive(Serialize)]
struct JsonReport<'a> {
    tasks: Vec<JsonRecord<'a>>,
    movement: MovementStats,
}

impl Diagnostics {
    pub fn record(&self, id: TaskId) -> Option<&TaskRecord> {
        self.records.iter().find(|record| record.id == id)
    }

    /// Total number of declared dependency edges.
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Renders the task graph as a Mermaid diagram, color-coded by duration.
    ///
    /// * **Green**: Fast
    /// * **Yellow**: Moderate
    /// * **Red**: Slow
    /// * **Grey**: Failed
    /// * **Blue**: Never dispatched
    pub fn render_mermaid(&self) -> String {
        let mut f = String::new();
        let _ = writeln!(f, "graph LR");

        let (min, max) = self.duration_bounds();
        let times: HashMap<_, _> = self.records.iter().map(|r| (r.id, r)).collect();

        let mut ids: Vec<_> = self.names.keys().copied().collect();
        ids.sort();

        for id in ids {
            let name = self.names[&id].replace('"', "#quot;");
            let node = id.as_u64();

            let (label, color) = match times.get(&id) {
                Some(record) if record.state == TaskState::Failed => {
                    (format!("failed on {}", record.device), "#BBBBBB".to_string())
                }
                Some(record) => {
                    let secs = record.duration.as_secs_f64();
                    let t = (secs - min) / (max - min);
                    (
                        format!("{:.2?} on {}", record.duration, record.device),
                        heat(t),
                    )
                }
                None => ("not run".to_string(), "#ADD8E6".to_string()),
            };

            let _ = writeln!(f, "    {node}[\"{name}\\n{label}\"]");
            let _ = writeln!(f, "    style {node} fill:{color}");
        }

        for (source, target) in &self.edges {
            let _ = writeln!(f, "    {} --> {}", source.as_u64(), target.as_u64());
        }

        f
    }

    fn duration_bounds(&self) -> (f64, f64) {
        let secs = self.records.iter().map(|r| r.duration.as_secs_f64());
        let min = secs.clone().fold(f64::MAX, f64::min);
        let max = secs.fold(f64::MIN, f64::max);

        if min > max {
            return (0.0, 1.0);
        }

        // all tasks took the same time
        if (max - min).abs() < f64::EPSILON {
            return (min, min + 1.0);
        }

        (min, max)
    }

    /// Serializes the execution records as JSON, with start times relative
    /// to the first dispatched task.
    pub fn to_json(&self) -> serde_json::Result<String> {
        let origin = self.records.iter().map(|r| r.start).min();

        let tasks = self
            .records
            .iter()
            .map(|record| JsonRecord {
                id: record.id.as_u64(),
                name: &record.name,
                device: record.device,
                start_us: origin
                    .map(|origin| record.start.duration_since(origin).as_micros() as u64)
                    .unwrap_or(0),
                duration_us: record.duration.as_micros() as u64,
                state: record.state,
            })
            .collect();

        serde_json::to_string_pretty(&JsonReport {
            tasks,
            movement: self.movement,
        })
    }
}

/// Green at 0.0, yellow at 0.5, red at 1.0.
fn heat(t: f64) -> String {
    let t = t.clamp(0.0, 1.0);

    let (r, g) = if t < 0.5 {
        ((255.0 * t * 2.0) as u8, 255)
    } else {
        (255, (255.0 * (1.0 - (t - 0.5) * 2.0)) as u8)
    };

    format!("#{r:02X}{g:02X}00")
}
