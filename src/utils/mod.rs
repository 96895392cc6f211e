use std::path::{Path, PathBuf};
use tch::{Device, Tensor};

pub mod checkpoint;
pub mod config;

// A simple wrapper around File::open adding details about the
// problematic file.
pub(crate) fn file_open<P: AsRef<Path>>(path: P) -> anyhow::Result<std::fs::File> {
    std::fs::File::open(path.as_ref()).map_err(|e| {
        let context = format!("error opening {:?}", path.as_ref().to_string_lossy());
        anyhow::Error::new(e).context(context)
    })
}

pub(crate) fn dims5(xs: &Tensor) -> (i64, i64, i64, i64, i64) {
    match *xs.size().as_slice() {
        [b, c, d, h, w] => (b, c, d, h, w),
        ref size => panic!("expected a 5 dimension tensor, got {size:?}"),
    }
}

/// The directory used for datasets and run artifacts when no explicit path
/// is given: the `VOLGEN_DATA_DIR` environment variable if set, otherwise a
/// subdirectory of the system temp directory.
pub fn data_dir() -> PathBuf {
    match std::env::var_os("VOLGEN_DATA_DIR") {
        Some(dir) => PathBuf::from(dir),
        None => std::env::temp_dir().join("volgen"),
    }
}

/// Explicit device selection, replacing ambient globals: named components
/// can be pinned to the CPU while everything else runs on the accelerator.
pub struct DeviceSetup {
    accelerator_device: Device,
    cpu: Vec<String>,
}

impl DeviceSetup {
    pub fn new(cpu: Vec<String>) -> Self {
        let accelerator_device =
            if tch::utils::has_mps() { Device::Mps } else { Device::cuda_if_available() };
        Self { accelerator_device, cpu }
    }

    pub fn get(&self, name: &str) -> Device {
        if self.cpu.iter().any(|c| c == "all" || c == name) {
            Device::Cpu
        } else {
            self.accelerator_device
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_pinning_overrides_the_accelerator() {
        let setup = DeviceSetup::new(vec!["unet".to_string()]);
        assert_eq!(setup.get("unet"), Device::Cpu);
        let setup = DeviceSetup::new(vec!["all".to_string()]);
        assert_eq!(setup.get("anything"), Device::Cpu);
    }
}
