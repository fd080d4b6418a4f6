#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod builder;
mod config;
mod context;
mod device;
mod diagnostics;
mod engine;
mod error;
mod key;
mod memory;
mod node;
mod runtime;
mod tracker;
mod utils;

pub use crate::builder::TaskDef;
pub use crate::config::{Config, ENV_DEVICES};
pub use crate::context::TaskContext;
pub use crate::device::{DeviceClass, DeviceId, DeviceInfo, enumerate, from_classes};
pub use crate::diagnostics::{Diagnostics, TaskRecord};
pub use crate::engine::{Dependencies, JoinReport, JoinScope, TaskHandle};
pub use crate::error::*;
pub use crate::key::{Component, IntoComponent, KeyExpr, KeyPart, TaskKey, TaskSpace, expand};
pub use crate::memory::{ArrayId, BufferRegion, DeviceMemory, HostMemory, partition};
pub use crate::node::{Access, AccessMode, Body, Placement, TaskId, TaskState};
pub use crate::runtime::Runtime;
pub use crate::tracker::{DataTracker, Movement, MovementStats};
