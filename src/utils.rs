//! Utility functions shared by training and prediction

/// Compute device selection
pub mod device {
    use candle_core::Device;
    use tracing::{info, warn};

    /// CUDA device 0 when available (and not `force_cpu`), else CPU
    pub fn select_device(force_cpu: bool) -> Device {
        if force_cpu {
            info!("Using CPU");
            return Device::Cpu;
        }
        match Device::cuda_if_available(0) {
            Ok(device) => {
                info!("Using {}", describe(&device));
                device
            }
            Err(e) => {
                warn!("CUDA probe failed ({}), falling back to CPU", e);
                Device::Cpu
            }
        }
    }

    /// Short human-readable device name
    pub fn describe(device: &Device) -> &'static str {
        match device {
            Device::Cpu => "CPU",
            Device::Cuda(_) => "CUDA GPU",
            Device::Metal(_) => "Metal GPU",
        }
    }
}

/// File I/O utilities
pub mod io {
    use anyhow::{Context, Result};
    use std::fs;
    use std::path::Path;

    /// Write through a temporary sibling file, then rename over `path`
    pub fn write_file_atomic<P: AsRef<Path>>(path: P, content: &[u8]) -> Result<()> {
        let path = path.as_ref();
        let temp_path = path.with_extension("tmp");

        fs::write(&temp_path, content).with_context(|| format!("Failed to write {:?}", temp_path))?;
        fs::rename(&temp_path, path).with_context(|| format!("Failed to move {:?} into place", path))?;

        Ok(())
    }
}
