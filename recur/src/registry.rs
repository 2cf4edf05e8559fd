//! Device → kernel set lookup.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::trace;

use crate::device::Device;
use crate::error::{Error, Result};
use crate::kernels::Kernels;

/// Holds at most one kernel set per device.
#[derive(Default)]
pub struct KernelRegistry {
    sets: HashMap<Device, Arc<dyn Kernels>>,
}

impl KernelRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a kernel set under its own device.
    ///
    /// # Errors
    /// Returns `DuplicateKernel` if the device already has a set.
    pub fn register(&mut self, kernels: Arc<dyn Kernels>) -> Result<()> {
        let device = kernels.device();
        if self.sets.contains_key(&device) {
            return Err(Error::DuplicateKernel(device));
        }
        trace!(%device, "registered kernel set");
        self.sets.insert(device, kernels);
        Ok(())
    }

    /// Kernel set for `device`.
    ///
    /// # Errors
    /// Returns `Dispatch` when nothing is registered for the device.
    pub fn resolve(&self, device: Device) -> Result<Arc<dyn Kernels>> {
        self.sets
            .get(&device)
            .cloned()
            .ok_or_else(|| Error::dispatch("kernel set", device))
    }

    #[must_use]
    pub fn contains(&self, device: Device) -> bool {
        self.sets.contains_key(&device)
    }

    /// Registered devices, in no particular order.
    pub fn devices(&self) -> impl Iterator<Item = Device> + '_ {
        self.sets.keys().copied()
    }
}
