//! Compute device selection.
//!
//! The device is resolved once at process start and passed explicitly to the trainer,
//! the validation loop and the inference loop.

use candle_core::{
    utils::{cuda_is_available, metal_is_available},
    Device,
};
use serde::{Deserialize, Serialize};

use crate::TrainingError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DevicePreference {
    /// Metal, then CUDA, then CPU.
    #[default]
    Auto,
    Cpu,
    Cuda,
    Metal,
}

/// Resolves the preference strictly: an unavailable accelerator is an error.
pub fn try_device(preference: DevicePreference, ordinal: usize) -> Result<Device, TrainingError> {
    match preference {
        DevicePreference::Cpu => Ok(Device::Cpu),
        DevicePreference::Cuda => {
            if !cuda_is_available() {
                return Err(TrainingError::DeviceUnavailable(
                    "CUDA support is not available in this build or on this host".into(),
                ));
            }
            Device::new_cuda(ordinal).map_err(|err| {
                TrainingError::DeviceUnavailable(format!("CUDA device #{ordinal}: {err}"))
            })
        }
        DevicePreference::Metal => {
            if !metal_is_available() {
                return Err(TrainingError::DeviceUnavailable(
                    "Metal support is not available in this build or on this host".into(),
                ));
            }
            Device::new_metal(ordinal).map_err(|err| {
                TrainingError::DeviceUnavailable(format!("Metal device #{ordinal}: {err}"))
            })
        }
        DevicePreference::Auto => try_device(DevicePreference::Metal, ordinal)
            .or_else(|_| try_device(DevicePreference::Cuda, ordinal))
            .or_else(|_| try_device(DevicePreference::Cpu, ordinal)),
    }
}

/// Resolves the preference, falling back to the CPU when the accelerator is missing.
pub fn select_device(preference: DevicePreference, ordinal: usize) -> Device {
    log::debug!(
        "device detection: cuda_available={} metal_available={}",
        cuda_is_available(),
        metal_is_available()
    );
    let device = match try_device(preference, ordinal) {
        Ok(device) => device,
        Err(err) => {
            log::warn!("{err}; falling back to CPU");
            Device::Cpu
        }
    };
    log::info!(
        "device selected: is_cuda={} is_metal={} is_cpu={}",
        device.is_cuda(),
        device.is_metal(),
        device.is_cpu()
    );
    device
}
