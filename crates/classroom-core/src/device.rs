use candle_core::Device;
use tracing::{info, warn};

use crate::error::CoreResult;

/// Where the caller would like tensors to live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceRequest {
    Cpu,
    /// First usable accelerator; `ordinal` selects the CUDA device.
    Gpu { ordinal: usize },
}

impl DeviceRequest {
    pub fn from_flags(prefer_gpu: bool, ordinal: usize) -> Self {
        if prefer_gpu {
            Self::Gpu { ordinal }
        } else {
            Self::Cpu
        }
    }

    /// Acquire the requested device, falling back to CPU whenever the
    /// accelerator is missing or was not compiled in.
    pub fn resolve(self) -> CoreResult<Device> {
        let Self::Gpu { ordinal } = self else {
            info!("Using CPU device");
            return Ok(Device::Cpu);
        };

        #[cfg(feature = "cuda")]
        match Device::new_cuda(ordinal) {
            Ok(dev) => {
                info!(ordinal, "Using CUDA device");
                return Ok(dev);
            }
            Err(e) => warn!(error = %e, "CUDA unavailable, falling back to CPU"),
        }

        #[cfg(feature = "metal")]
        match Device::new_metal(0) {
            Ok(dev) => {
                info!("Using Metal device");
                return Ok(dev);
            }
            Err(e) => warn!(error = %e, "Metal unavailable, falling back to CPU"),
        }

        #[cfg(not(any(feature = "cuda", feature = "metal")))]
        warn!(
            ordinal,
            "--gpu has no effect: rebuild with `--features cuda` or `--features metal`"
        );

        Ok(Device::Cpu)
    }
}

/// Short label for log lines and `inspect` output.
pub fn device_name(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "CPU",
        Device::Cuda(_) => "CUDA",
        Device::Metal(_) => "Metal",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_request_resolves_to_cpu() {
        let device = DeviceRequest::from_flags(false, 3).resolve().unwrap();
        assert!(matches!(device, Device::Cpu));
    }

    #[test]
    fn test_from_flags_keeps_ordinal() {
        assert_eq!(DeviceRequest::from_flags(true, 2), DeviceRequest::Gpu { ordinal: 2 });
        assert_eq!(DeviceRequest::from_flags(false, 2), DeviceRequest::Cpu);
    }

    #[cfg(not(any(feature = "cuda", feature = "metal")))]
    #[test]
    fn test_gpu_request_without_backend_falls_back() {
        let device = DeviceRequest::Gpu { ordinal: 0 }.resolve().unwrap();
        assert!(matches!(device, Device::Cpu));
    }

    #[test]
    fn test_device_name_cpu() {
        assert_eq!(device_name(&Device::Cpu), "CPU");
    }
}
