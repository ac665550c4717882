//! Compute device selection for training ranks
//!
//! Each training rank binds exactly one device. CPU ranks are unlimited;
//! CUDA ranks take consecutive devices starting at the configured one, so a
//! world of `n` ranks needs `n` devices from `first` on.

use crate::config::Settings;
use crate::context::{use_cuda, CudaGuard};
use crate::{Error, Result};

/// Information about one accelerator adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Adapter name
    pub name: String,
    /// Backend label (Vulkan, Metal, ...)
    pub backend: String,
}

/// Enumerate accelerator adapters.
#[cfg(feature = "gpu")]
#[must_use]
pub fn detect() -> Vec<DeviceInfo> {
    let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        ..Default::default()
    });
    instance
        .enumerate_adapters(wgpu::Backends::all())
        .iter()
        .filter(|adapter| adapter.get_info().device_type != wgpu::DeviceType::Cpu)
        .map(|adapter| {
            let info = adapter.get_info();
            DeviceInfo {
                name: info.name,
                backend: format!("{:?}", info.backend),
            }
        })
        .collect()
}

/// Enumerate accelerator adapters (none without the `gpu` feature).
#[cfg(not(feature = "gpu"))]
#[must_use]
pub fn detect() -> Vec<DeviceInfo> {
    Vec::new()
}

/// Where training ranks run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    /// Host CPU
    Cpu,
    /// CUDA devices `first..available`
    Cuda {
        /// Device of rank 0
        first: usize,
        /// Devices present on the host
        available: usize,
    },
}

impl Device {
    /// Device from settings: CPU unless `FOUNDATION_CUDA` names a device.
    ///
    /// Without adapter enumeration only the configured device is assumed.
    #[must_use]
    pub fn from_settings(settings: &Settings) -> Self {
        match settings.cuda {
            None => Self::Cpu,
            Some(first) => {
                let detected = detect().len();
                Self::Cuda {
                    first,
                    available: detected.max(first + 1),
                }
            }
        }
    }

    /// Ensure `world_size` ranks each get a device.
    ///
    /// # Errors
    /// Returns `InsufficientDevices` when too few CUDA devices remain
    pub fn check(&self, world_size: usize) -> Result<()> {
        match *self {
            Self::Cpu => Ok(()),
            Self::Cuda { first, available } => {
                let remaining = available.saturating_sub(first);
                if remaining < world_size {
                    return Err(Error::InsufficientDevices {
                        required: world_size,
                        available: remaining,
                    });
                }
                Ok(())
            }
        }
    }

    /// Device id of `rank`, `None` on CPU
    #[must_use]
    pub const fn rank_device(&self, rank: usize) -> Option<usize> {
        match *self {
            Self::Cpu => None,
            Self::Cuda { first, .. } => Some(first + rank),
        }
    }

    /// Bind `rank`'s device for the guard's lifetime; CPU ranks bind nothing.
    #[must_use]
    pub fn bind(&self, rank: usize) -> Option<CudaGuard> {
        self.rank_device(rank).map(|device| use_cuda(Some(device)))
    }
}
