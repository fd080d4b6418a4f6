//! The fixed pool of compute devices.
//!
//! Devices are enumerated once, when the runtime starts, and the list is never
//! modified afterwards. Every device gets exactly one worker and one ready
//! queue in the scheduler.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::config::Config;

/// Identity of a device slot, its position in the enumerated device list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub(crate) u32);

impl DeviceId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl Display for DeviceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Cpu,
    Gpu,
}

impl Display for DeviceClass {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceClass::Cpu => f.write_str("cpu"),
            DeviceClass::Gpu => f.write_str("gpu"),
        }
    }
}

/// A single schedulable execution context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub class: DeviceClass,
    /// Position of the device among the devices of the same class.
    pub ordinal: usize,
    /// Memory capacity in bytes, `None` when unbounded.
    pub memory: Option<u64>,
}

impl DeviceInfo {
    /// Whether a task with the given footprint fits into this device.
    pub fn fits(&self, footprint: u64) -> bool {
        self.memory.is_none_or(|capacity| footprint <= capacity)
    }
}

impl Display for DeviceInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.class, self.ordinal)
    }
}

/// Builds a device list from explicit classes, numbering them in order.
pub fn from_classes(classes: impl IntoIterator<Item = (DeviceClass, Option<u64>)>) -> Vec<DeviceInfo> {
    let mut cpus = 0;
    let mut gpus = 0;

    classes
        .into_iter()
        .enumerate()
        .map(|(i, (class, memory))| {
            let counter = match class {
                DeviceClass::Cpu => &mut cpus,
                DeviceClass::Gpu => &mut gpus,
            };
            let ordinal = *counter;
            *counter += 1;

            DeviceInfo {
                id: DeviceId(i as u32),
                class,
                ordinal,
                memory,
            }
        })
        .collect()
}

/// Enumerates the devices described by the configuration.
///
/// GPUs come first, then CPU cores, and the list is truncated to
/// `max_devices` when set.
pub fn enumerate(config: &Config) -> Vec<DeviceInfo> {
    let cpus = config.cpus.unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    });

    let classes = std::iter::repeat_n((DeviceClass::Gpu, config.gpu_memory), config.gpus)
        .chain(std::iter::repeat_n((DeviceClass::Cpu, config.cpu_memory), cpus));

    let classes: Vec<_> = match config.max_devices {
        Some(max) => classes.take(max).collect(),
        None => classes.collect(),
    };

    from_classes(classes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enumerate_orders_gpus_first() {
        let config = Config::default().cpus(2).gpus(2);
        let devices = enumerate(&config);

        let classes: Vec<_> = devices.iter().map(|d| d.class).collect();
        assert_eq!(
            classes,
            vec![
                DeviceClass::Gpu,
                DeviceClass::Gpu,
                DeviceClass::Cpu,
                DeviceClass::Cpu
            ]
        );
        assert_eq!(devices[3].to_string(), "cpu:1");
        assert_eq!(devices[3].id, DeviceId(3));
    }

    #[test]
    fn test_enumerate_truncates() {
        let config = Config::default().cpus(4).gpus(1).max_devices(2);
        let devices = enumerate(&config);

        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].class, DeviceClass::Gpu);
        assert_eq!(devices[1].class, DeviceClass::Cpu);
    }

    #[test]
    fn test_fits() {
        let devices = from_classes([(DeviceClass::Gpu, Some(1024)), (DeviceClass::Cpu, None)]);
        assert!(devices[0].fits(1024));
        assert!(!devices[0].fits(1025));
        assert!(devices[1].fits(u64::MAX));
    }
}
