//! # Device Detection
//!
//! Picks the compute device for model inference from the `models.device`
//! setting. Any GPU that cannot be opened falls back to the CPU, so a CPU-only
//! host runs unchanged with `device = "cuda"`.

use candle_core::Device;
use serde::Serialize;
use std::sync::OnceLock;
use tracing::{debug, info, warn};

/// Cached auto-detected device
static BEST_DEVICE: OnceLock<Device> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DevicePreference {
    #[default]
    Auto,
    Cpu,
    /// CUDA GPU 0, CPU if unavailable
    Cuda,
    /// Apple Metal GPU 0, CPU if unavailable
    Metal,
}

impl std::str::FromStr for DevicePreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "auto" | "automatic" => Ok(DevicePreference::Auto),
            "cpu" => Ok(DevicePreference::Cpu),
            "cuda" | "gpu" => Ok(DevicePreference::Cuda),
            "metal" | "mps" => Ok(DevicePreference::Metal),
            _ => Err(format!("Unknown device preference: {}", s)),
        }
    }
}

pub struct DeviceManager;

impl DeviceManager {
    pub fn get_device(preference: DevicePreference) -> Device {
        match preference {
            DevicePreference::Auto => Self::get_best_device(),
            DevicePreference::Cpu => Device::Cpu,
            DevicePreference::Cuda => Self::get_cuda_device().unwrap_or_else(|| {
                warn!("CUDA requested but not available, falling back to CPU");
                Device::Cpu
            }),
            DevicePreference::Metal => Self::get_metal_device().unwrap_or_else(|| {
                warn!("Metal requested but not available, falling back to CPU");
                Device::Cpu
            }),
        }
    }

    pub fn get_best_device() -> Device {
        BEST_DEVICE.get_or_init(Self::detect_best_device).clone()
    }

    fn detect_best_device() -> Device {
        info!("Detecting best available compute device...");

        if let Some(cuda_device) = Self::get_cuda_device() {
            info!("Selected CUDA GPU for model inference");
            return cuda_device;
        }

        if let Some(metal_device) = Self::get_metal_device() {
            info!("Selected Metal GPU for model inference");
            return metal_device;
        }

        info!("Using CPU for model inference (no GPU acceleration available)");
        Device::Cpu
    }

    fn get_cuda_device() -> Option<Device> {
        match Device::new_cuda(0) {
            Ok(device) => Some(device),
            Err(e) => {
                debug!("CUDA not available: {}", e);
                None
            }
        }
    }

    fn get_metal_device() -> Option<Device> {
        match Device::new_metal(0) {
            Ok(device) => Some(device),
            Err(e) => {
                debug!("Metal not available: {}", e);
                None
            }
        }
    }

    pub fn get_summary(current: &Device) -> DeviceSummary {
        let cuda_available = Self::get_cuda_device().is_some();
        let metal_available = Self::get_metal_device().is_some();
        DeviceSummary {
            cuda_available,
            metal_available,
            gpu_available: cuda_available || metal_available,
            current_device: device_name(current).to_string(),
        }
    }
}

/// Device availability, reported by the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSummary {
    pub cuda_available: bool,
    pub metal_available: bool,
    pub gpu_available: bool,
    pub current_device: String,
}

/// Short lowercase name of a device.
pub fn device_name(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "cpu",
        Device::Cuda(_) => "cuda",
        Device::Metal(_) => "metal",
    }
}

/// Resolve a `models.device` string, treating unknown values as `auto`.
pub fn create_device_from_string(device_str: &str) -> Device {
    match device_str.parse::<DevicePreference>() {
        Ok(preference) => DeviceManager::get_device(preference),
        Err(_) => {
            warn!("Invalid device preference '{}', using auto", device_str);
            DeviceManager::get_best_device()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_preference_parsing() {
        assert_eq!("auto".parse::<DevicePreference>().unwrap(), DevicePreference::Auto);
        assert_eq!("CPU".parse::<DevicePreference>().unwrap(), DevicePreference::Cpu);
        assert_eq!("cuda".parse::<DevicePreference>().unwrap(), DevicePreference::Cuda);
        assert_eq!("mps".parse::<DevicePreference>().unwrap(), DevicePreference::Metal);
        assert!("tpu".parse::<DevicePreference>().is_err());
    }

    #[test]
    fn test_cpu_preference() {
        let device = DeviceManager::get_device(DevicePreference::Cpu);
        assert!(matches!(device, Device::Cpu));
        assert_eq!(device_name(&device), "cpu");
    }

    #[test]
    fn test_summary_reports_current_device() {
        let summary = DeviceManager::get_summary(&Device::Cpu);
        assert_eq!(summary.current_device, "cpu");
        assert_eq!(summary.gpu_available, summary.cuda_available || summary.metal_available);
    }
}
