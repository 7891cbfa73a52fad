//! Device placement for new workers.

use std::collections::VecDeque;

use crate::model::Device;

/// Decides which device a new worker binds to and takes the device back
/// when the worker dies.
///
/// Not synchronized: the pool mutates it under its own lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    /// One worker per listed GPU, no oversubscription.
    Gpu {
        devices: Vec<u32>,
        free: VecDeque<u32>,
    },
    /// A fixed number of CPU workers, no device bookkeeping.
    Cpu { workers: usize },
}

impl Placement {
    pub fn gpu(devices: Vec<u32>) -> Self {
        let free = devices.iter().copied().collect();
        Placement::Gpu { devices, free }
    }

    pub fn cpu(workers: usize) -> Self {
        Placement::Cpu { workers }
    }

    pub fn is_gpu(&self) -> bool {
        matches!(self, Placement::Gpu { .. })
    }

    /// Number of workers this placement supports.
    pub fn capacity(&self) -> usize {
        match self {
            Placement::Gpu { devices, .. } => devices.len(),
            Placement::Cpu { workers } => *workers,
        }
    }

    /// Picks the device for a new worker. `None` when every GPU is taken.
    pub fn claim(&mut self) -> Option<Device> {
        match self {
            Placement::Gpu { free, .. } => free.pop_front().map(Device::Gpu),
            Placement::Cpu { .. } => Some(Device::Cpu),
        }
    }

    /// Returns the device of a dead worker to the free list.
    pub fn reclaim(&mut self, device: Device) {
        if let (Placement::Gpu { devices, free }, Device::Gpu(id)) = (self, device) {
            if devices.contains(&id) && !free.contains(&id) {
                free.push_back(id);
            }
        }
    }

    /// GPUs not bound to a worker, in claim order.
    pub fn free_devices(&self) -> Vec<Device> {
        match self {
            Placement::Gpu { free, .. } => free.iter().copied().map(Device::Gpu).collect(),
            Placement::Cpu { .. } => Vec::new(),
        }
    }
}

impl std::fmt::Display for Placement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Placement::Gpu { devices, .. } => write!(f, "gpu {:?}", devices),
            Placement::Cpu { workers } => write!(f, "cpu x{}", workers),
        }
    }
}
