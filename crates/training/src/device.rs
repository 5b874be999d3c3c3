use candle_core::{
    utils::{cuda_is_available, metal_is_available},
    Device,
};
use tracing::{info, warn};

use crate::config::DevicePreference;

/// Picks Metal, then CUDA, then CPU. GPU backends need the matching cargo feature.
pub fn select_device(preference: DevicePreference) -> Device {
    if preference == DevicePreference::Cpu {
        info!("device: CPU (forced by configuration)");
        return Device::Cpu;
    }

    let cuda_available = cuda_is_available();
    let metal_available = metal_is_available();
    info!(cuda_available, metal_available, "device detection");

    if metal_available {
        match Device::new_metal(0) {
            Ok(device) => {
                info!("device: Metal GPU #0");
                return device;
            }
            Err(err) => warn!(error = %err, "failed to initialize Metal, falling back"),
        }
    }
    if cuda_available {
        match Device::new_cuda(0) {
            Ok(device) => {
                info!("device: CUDA GPU #0");
                return device;
            }
            Err(err) => warn!(error = %err, "CUDA reported available but initialization failed"),
        }
    }
    info!("device: CPU");
    Device::Cpu
}

/// Seeds the device RNG; CPU has none to seed, so failures are only logged.
pub fn seed_device(device: &Device, seed: u64) {
    if let Err(err) = device.set_seed(seed) {
        warn!(error = %err, "device RNG not seeded");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_preference_is_honoured() {
        assert!(select_device(DevicePreference::Cpu).is_cpu());
    }
}
