use candle_core::{DType, Device};
use std::str::FromStr;

use crate::errors::{LoadError, Result};
use crate::options::{LoaderOptions, OffloadMode};

// Configuration detection from build.rs
#[cfg(all(has_metal, not(force_cpu)))]
pub const DEFAULT_DEVICE: &str = "metal";

#[cfg(all(has_cuda, not(has_metal), not(force_cpu)))]
pub const DEFAULT_DEVICE: &str = "cuda";

#[cfg(any(force_cpu, not(any(has_metal, has_cuda))))]
pub const DEFAULT_DEVICE: &str = "cpu";

/// Device backends compiled into this build
pub fn available_devices() -> Vec<&'static str> {
    let mut devices = vec!["cpu"];
    if cfg!(all(feature = "cuda", not(force_cpu))) {
        devices.push("cuda");
    }
    if cfg!(all(feature = "metal", not(force_cpu))) {
        devices.push("metal");
    }
    devices
}

/// Resolve a device name (`auto`, `cpu`, `cuda`, `cuda:N`, `metal`).
pub fn resolve_device(name: &str) -> Result<Device> {
    let name = name.trim().to_lowercase();
    match name.as_str() {
        "" | "auto" => Ok(best_device()),
        "cpu" => Ok(Device::Cpu),
        "metal" => {
            if cfg!(not(feature = "metal")) {
                return Err(LoadError::BackendUnavailable {
                    backend: "metal",
                    reason: "not compiled in, rebuild with the `metal` feature".to_string(),
                });
            }
            Ok(Device::new_metal(0)?)
        }
        other if other == "cuda" || other.starts_with("cuda:") => {
            if cfg!(not(feature = "cuda")) {
                return Err(LoadError::BackendUnavailable {
                    backend: "cuda",
                    reason: "not compiled in, rebuild with the `cuda` feature".to_string(),
                });
            }
            let ordinal = match other.strip_prefix("cuda:") {
                Some(idx) => idx
                    .parse::<usize>()
                    .map_err(|_| LoadError::msg(format!("invalid cuda ordinal in '{name}'")))?,
                None => 0,
            };
            Ok(Device::new_cuda(ordinal)?)
        }
        other => Err(LoadError::msg(format!("unknown device '{other}'"))),
    }
}

/// Best device available at runtime, falling back to CPU.
pub fn best_device() -> Device {
    if cfg!(force_cpu) {
        return Device::Cpu;
    }
    #[cfg(feature = "metal")]
    {
        if let Ok(device) = Device::new_metal(0) {
            return device;
        }
    }
    #[cfg(feature = "cuda")]
    {
        if let Ok(device) = Device::new_cuda(0) {
            return device;
        }
    }
    Device::Cpu
}

/// Parse a dtype name. Accepts candle names and the common torch spellings.
pub fn parse_dtype(name: &str) -> Result<DType> {
    let normalized = match name.trim().to_lowercase().as_str() {
        "fp32" | "float32" | "float" => "f32".to_string(),
        "fp16" | "float16" | "half" => "f16".to_string(),
        "bfloat16" => "bf16".to_string(),
        other => other.to_string(),
    };
    DType::from_str(&normalized).map_err(|_| LoadError::msg(format!("unknown dtype '{name}'")))
}

/// Compute device named by the options.
pub fn compute_device(options: &LoaderOptions) -> Result<Device> {
    resolve_device(&options.device)
}

/// Device freshly loaded components should land on: the compute device
/// unless offloading keeps them on the host.
pub fn offload_device(options: &LoaderOptions) -> Result<Device> {
    match options.diffusers_offload_mode {
        OffloadMode::None => compute_device(options),
        OffloadMode::Model | OffloadMode::Sequential => Ok(Device::Cpu),
    }
}

/// Best-effort release of device memory after a load.
///
/// Candle frees buffers as soon as the owning tensors drop, so this only
/// waits for outstanding kernels; failures are logged and swallowed.
pub fn release_memory(device: &Device, force: bool) {
    if device.is_cpu() && !force {
        return;
    }
    match device.synchronize() {
        Ok(()) => tracing::debug!(device = ?device.location(), force, "released device memory"),
        Err(e) => tracing::warn!(error = %e, "device synchronize failed"),
    }
}
