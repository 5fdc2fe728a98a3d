//! Input device enumeration and strict lookup.

use anyhow::Result;
use cpal::traits::{DeviceTrait, HostTrait};
use log::debug;

use crate::error::DeviceError;

/// A named capture device, for host-side pickers.
pub struct CpalDeviceInfo {
    pub name: String,
    pub device: cpal::Device,
}

/// Enumerate the host's input devices. Devices whose names cannot be
/// read are skipped.
pub fn list_input_devices() -> Result<Vec<CpalDeviceInfo>> {
    let host = cpal::default_host();
    let devices = host.input_devices()?;

    let mut infos = Vec::new();
    for device in devices {
        match device.name() {
            Ok(name) => infos.push(CpalDeviceInfo { name, device }),
            Err(e) => debug!("skipping unnameable input device: {}", e),
        }
    }
    Ok(infos)
}

/// Resolve a capture device by name, or the host default when no name
/// is given. A named device that is missing is an error; a different
/// device is never silently substituted for the one the user picked.
pub fn find_input_device(name: Option<&str>) -> Result<cpal::Device, DeviceError> {
    match name {
        None => cpal::default_host()
            .default_input_device()
            .ok_or(DeviceError::NoDefaultDevice),
        Some(wanted) => {
            let devices = list_input_devices().map_err(|e| DeviceError::Unsupported {
                name: wanted.to_string(),
                reason: e.to_string(),
            })?;
            devices
                .into_iter()
                .find(|d| d.name == wanted)
                .map(|d| d.device)
                .ok_or_else(|| DeviceError::NotFound(wanted.to_string()))
        }
    }
}
