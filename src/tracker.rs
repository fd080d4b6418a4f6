//! Data location tracking.
//!
//! For every buffer region the tracker knows which devices hold a valid copy
//! and which single device holds the canonical (most recently written) one.
//! A write makes the writer the sole holder, every other copy turns stale at
//! that instant.
//!
//! Each region has its own lock. Copies are performed while holding it, so a
//! concurrent write to the same region waits until the copy is recorded and
//! no device ever observes a stale replica after the write went through.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::device::DeviceId;
use crate::error::DataError;
use crate::memory::{BufferRegion, DeviceMemory};

/// Whether the runtime moves declared regions on behalf of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Movement {
    /// Inputs are made resident before the body runs and declared outputs are
    /// recorded as written on the executing device afterwards.
    #[default]
    Automatic,
    /// Nothing moves implicitly, the body calls `ensure_resident` and
    /// `record_write` itself.
    Manual,
}

#[derive(Debug, Default)]
struct Residency {
    canonical: Option<DeviceId>,
    valid: BTreeSet<DeviceId>,
}

/// Counters of the data moved so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MovementStats {
    pub copies: u64,
    pub bytes: u64,
}

pub struct DataTracker {
    regions: Mutex<HashMap<BufferRegion, Arc<Mutex<Residency>>>>,
    memory: Arc<dyn DeviceMemory>,
    copies: AtomicU64,
    bytes: AtomicU64,
}

impl DataTracker {
    pub fn new(memory: Arc<dyn DeviceMemory>) -> Self {
        Self {
            regions: Mutex::new(HashMap::new()),
            memory,
            copies: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
        }
    }

    fn entry(&self, region: &BufferRegion) -> Arc<Mutex<Residency>> {
        let mut regions = self.regions.lock().unwrap_or_else(PoisonError::into_inner);
        regions.entry(*region).or_default().clone()
    }

    fn lookup(&self, region: &BufferRegion) -> Option<Arc<Mutex<Residency>>> {
        let regions = self.regions.lock().unwrap_or_else(PoisonError::into_inner);
        regions.get(region).cloned()
    }

    fn lock(entry: &Mutex<Residency>) -> MutexGuard<'_, Residency> {
        entry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes sure `device` holds a valid copy of `region`, copying it from the
    /// canonical holder when it doesn't. Returns the device now holding it.
    pub fn ensure_resident(
        &self,
        region: &BufferRegion,
        device: DeviceId,
    ) -> Result<DeviceId, DataError> {
        let entry = self.entry(region);
        let mut residency = Self::lock(&entry);
        self.make_resident(&mut residency, region, device)?;
        Ok(device)
    }

    fn make_resident(
        &self,
        residency: &mut Residency,
        region: &BufferRegion,
        device: DeviceId,
    ) -> Result<(), DataError> {
        if residency.valid.contains(&device) {
            return Ok(());
        }

        let source = residency
            .canonical
            .ok_or(DataError::NoCanonicalCopy(*region))?;

        self.memory.copy(region, source, device)?;
        residency.valid.insert(device);

        self.copies.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(region.extent() as u64, Ordering::Relaxed);
        tracing::debug!(%region, from = %source, to = %device, "copied region");

        Ok(())
    }

    /// Marks `device` as the sole, canonical holder of `region`.
    pub fn record_write(&self, region: &BufferRegion, device: DeviceId) {
        let entry = self.entry(region);
        let mut residency = Self::lock(&entry);
        self.invalidate_others(&mut residency, region, device);
    }

    fn invalidate_others(&self, residency: &mut Residency, region: &BufferRegion, device: DeviceId) {
        let stale = std::mem::take(&mut residency.valid);
        for holder in stale.into_iter().filter(|holder| *holder != device) {
            self.memory.release(region, holder);
        }

        residency.valid.insert(device);
        residency.canonical = Some(device);
        tracing::debug!(%region, %device, "recorded write");
    }

    /// Reads the copy of `region` held by `device`, failing if that copy is
    /// missing or stale.
    pub fn read(&self, region: &BufferRegion, device: DeviceId) -> Result<Vec<u8>, DataError> {
        let entry = self.lookup(region).ok_or(DataError::NotResident {
            region: *region,
            device,
        })?;
        let residency = Self::lock(&entry);

        if !residency.valid.contains(&device) {
            return Err(DataError::NotResident {
                region: *region,
                device,
            });
        }

        self.memory.read(region, device)
    }

    /// Stores new contents for `region` on `device` and records the write.
    pub fn write(&self, region: &BufferRegion, device: DeviceId, bytes: &[u8]) -> Result<(), DataError> {
        let entry = self.entry(region);
        let mut residency = Self::lock(&entry);
        self.memory.write(region, device, bytes)?;
        self.invalidate_others(&mut residency, region, device);
        Ok(())
    }

    /// Reads the canonical copy from wherever it currently lives.
    pub fn read_canonical(&self, region: &BufferRegion) -> Result<Vec<u8>, DataError> {
        let entry = self
            .lookup(region)
            .ok_or(DataError::NoCanonicalCopy(*region))?;
        let residency = Self::lock(&entry);

        let device = residency
            .canonical
            .ok_or(DataError::NoCanonicalCopy(*region))?;

        self.memory.read(region, device)
    }

    pub fn canonical(&self, region: &BufferRegion) -> Option<DeviceId> {
        let entry = self.lookup(region)?;
        let residency = Self::lock(&entry);
        residency.canonical
    }

    /// Devices holding a valid copy of the region, in id order.
    pub fn holders(&self, region: &BufferRegion) -> Vec<DeviceId> {
        match self.lookup(region) {
            Some(entry) => Self::lock(&entry).valid.iter().copied().collect(),
            None => vec![],
        }
    }

    pub fn is_resident(&self, region: &BufferRegion, device: DeviceId) -> bool {
        self.lookup(region)
            .is_some_and(|entry| Self::lock(&entry).valid.contains(&device))
    }

    pub fn stats(&self) -> MovementStats {
        MovementStats {
            copies: self.copies.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
        }
    }
}
