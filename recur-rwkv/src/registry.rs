//! The process-wide kernel registry.

use std::sync::{Arc, OnceLock};

use tracing::trace;

use recur::KernelRegistry;
use recur_cpu::CpuKernels;
use recur_export::NcnnKernels;

static DEFAULT: OnceLock<KernelRegistry> = OnceLock::new();

/// Registry holding every kernel set this crate ships: eager CPU and the
/// ncnn export tracer. Built on first use and read-only afterwards.
///
/// # Panics
/// Panics if two built-in kernel sets claim the same device.
pub fn default_registry() -> &'static KernelRegistry {
    DEFAULT.get_or_init(|| {
        let mut registry = KernelRegistry::new();
        registry
            .register(Arc::new(CpuKernels))
            .expect("cpu kernels registered twice");
        registry
            .register(Arc::new(NcnnKernels))
            .expect("ncnn kernels registered twice");
        trace!(devices = registry.devices().count(), "default kernel registry built");
        registry
    })
}
