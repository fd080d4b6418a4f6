use serde::Deserialize;

use crate::error::RuntimeError;
use crate::tracker::Movement;

/// Environment variable that truncates the enumerated device list.
pub const ENV_DEVICES: &str = "N_DEVICES";

/// Runtime configuration.
///
/// Can be assembled with the builder-style setters or parsed from JSON, and
/// every field has a default.
///
/// ```rust
/// use shikumi::{Config, Movement};
///
/// let config = Config::from_json(r#"{ "cpus": 2, "gpus": 1, "movement": "manual" }"#).unwrap();
/// assert_eq!(config.movement, Movement::Manual);
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Number of CPU device slots, defaults to the available parallelism.
    pub cpus: Option<usize>,
    /// Number of GPU device slots.
    pub gpus: usize,
    /// Per-slot memory capacity of CPU devices in bytes.
    pub cpu_memory: Option<u64>,
    /// Per-slot memory capacity of GPU devices in bytes.
    pub gpu_memory: Option<u64>,
    /// Upper bound on the number of devices used.
    pub max_devices: Option<usize>,
    /// Default data movement policy for tasks that don't choose one.
    pub movement: Movement,
    /// Print the elapsed time when a top-level join scope closes.
    pub report_timing: bool,
    /// Prefix for worker thread names.
    pub thread_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cpus: None,
            gpus: 0,
            cpu_memory: None,
            gpu_memory: None,
            max_devices: None,
            movement: Movement::Automatic,
            report_timing: true,
            thread_name: String::from("shikumi"),
        }
    }
}

impl Config {
    pub fn from_json(json: &str) -> Result<Self, RuntimeError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Applies overrides from the process environment.
    pub fn with_env(self) -> Self {
        match std::env::var(ENV_DEVICES) {
            Ok(value) => self.with_devices_override(&value),
            Err(_) => self,
        }
    }

    fn with_devices_override(mut self, value: &str) -> Self {
        match value.trim().parse::<usize>() {
            Ok(max) => self.max_devices = Some(max),
            Err(err) => tracing::warn!("Ignoring {ENV_DEVICES}={value:?}: {err}"),
        }
        self
    }

    pub fn cpus(mut self, cpus: usize) -> Self {
        self.cpus = Some(cpus);
        self
    }

    pub fn gpus(mut self, gpus: usize) -> Self {
        self.gpus = gpus;
        self
    }

    pub fn cpu_memory(mut self, bytes: u64) -> Self {
        self.cpu_memory = Some(bytes);
        self
    }

    pub fn gpu_memory(mut self, bytes: u64) -> Self {
        self.gpu_memory = Some(bytes);
        self
    }

    pub fn max_devices(mut self, max: usize) -> Self {
        self.max_devices = Some(max);
        self
    }

    pub fn movement(mut self, movement: Movement) -> Self {
        self.movement = movement;
        self
    }

    pub fn report_timing(mut self, report: bool) -> Self {
        self.report_timing = report;
        self
    }

    pub fn thread_name(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name = prefix.into();
        self
    }
}
