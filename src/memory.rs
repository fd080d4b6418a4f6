//! Buffer regions and the device memory they live in.
//!
//! The scheduler never does array algebra. It only needs to know how large a
//! region is and how to copy its bytes from one device to another, which is
//! what [`DeviceMemory`] provides.

use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::ops::Range;
use std::sync::{Arc, Mutex, PoisonError};

use crate::device::DeviceId;
use crate::error::DataError;

/// Identity of a logical array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArrayId(pub u64);

impl Display for ArrayId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "a{}", self.0)
    }
}

/// A contiguous byte slice of a logical array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferRegion {
    pub array: ArrayId,
    pub start: usize,
    pub end: usize,
}

impl BufferRegion {
    pub fn new(array: ArrayId, bounds: Range<usize>) -> Self {
        debug_assert!(bounds.start <= bounds.end);
        Self {
            array,
            start: bounds.start,
            end: bounds.end,
        }
    }

    /// Size of the region in bytes.
    pub fn extent(&self) -> usize {
        self.end - self.start
    }

    pub fn bounds(&self) -> Range<usize> {
        self.start..self.end
    }
}

impl Display for BufferRegion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}..{}]", self.array, self.start, self.end)
    }
}

/// Splits `len` bytes of an array into `parts` contiguous regions.
///
/// Leftover bytes go to the leading regions, so extents differ by at most
/// one byte. Asking for more parts than bytes yields empty trailing regions.
pub fn partition(array: ArrayId, len: usize, parts: usize) -> Vec<BufferRegion> {
    if parts == 0 {
        return vec![];
    }

    let base = len / parts;
    let extra = len % parts;
    let mut start = 0;

    (0..parts)
        .map(|i| {
            let size = base + usize::from(i < extra);
            let region = BufferRegion::new(array, start..start + size);
            start += size;
            region
        })
        .collect()
}

/// Storage of region copies on the devices.
///
/// The data location tracker decides *when* bytes move, an implementation of
/// this trait decides *how*.
pub trait DeviceMemory: Send + Sync {
    /// Copies the region's bytes from one device to another.
    fn copy(&self, region: &BufferRegion, from: DeviceId, to: DeviceId) -> Result<(), DataError>;

    fn read(&self, region: &BufferRegion, device: DeviceId) -> Result<Vec<u8>, DataError>;

    fn write(&self, region: &BufferRegion, device: DeviceId, bytes: &[u8]) -> Result<(), DataError>;

    /// Called when the copy on `device` became stale and can be dropped.
    fn release(&self, _: &BufferRegion, _: DeviceId) {}
}

/// Device memory backed by host allocations, one buffer per region per device.
#[derive(Default)]
pub struct HostMemory {
    buffers: Mutex<HashMap<(BufferRegion, DeviceId), Arc<[u8]>>>,
}

impl HostMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of buffers currently allocated across all devices.
    pub fn allocations(&self) -> usize {
        self.buffers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl DeviceMemory for HostMemory {
    fn copy(&self, region: &BufferRegion, from: DeviceId, to: DeviceId) -> Result<(), DataError> {
        let mut buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);

        let source = buffers
            .get(&(*region, from))
            .cloned()
            .ok_or(DataError::MissingBuffer {
                region: *region,
                device: from,
            })?;

        // Replicas are read-only until the next write, so sharing the
        // allocation is indistinguishable from a deep copy.
        buffers.insert((*region, to), source);
        Ok(())
    }

    fn read(&self, region: &BufferRegion, device: DeviceId) -> Result<Vec<u8>, DataError> {
        let buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);

        buffers
            .get(&(*region, device))
            .map(|buffer| buffer.to_vec())
            .ok_or(DataError::MissingBuffer {
                region: *region,
                device,
            })
    }

    fn write(&self, region: &BufferRegion, device: DeviceId, bytes: &[u8]) -> Result<(), DataError> {
        if bytes.len() != region.extent() {
            return Err(DataError::ExtentMismatch {
                region: *region,
                expected: region.extent(),
                actual: bytes.len(),
            });
        }

        let mut buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
        buffers.insert((*region, device), Arc::from(bytes));
        Ok(())
    }

    fn release(&self, region: &BufferRegion, device: DeviceId) {
        let mut buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
        buffers.remove(&(*region, device));
    }
}
