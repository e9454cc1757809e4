use std::collections::HashSet;
use std::ffi::CString;

use hidapi::{HidApi, HidDevice};

use crate::error::DeviceCandidates;
use crate::{LightError, Result};

/// Identity of one enumerated HID interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HidDeviceInfo {
    pub path: String,
    pub serial_number: String,
}

/// An opened HID interface plus the identity backfilled from the OS.
///
/// The `HidApi` context must outlive the device handle, so it travels with
/// it.
pub(crate) struct OpenedHid {
    pub api: HidApi,
    pub device: HidDevice,
    pub path: Option<String>,
    pub serial_number: Option<String>,
}

/// List matching interfaces, deduplicated by OS path (hidapi reports some
/// interfaces more than once).
pub(crate) fn enumerate(api: &HidApi, vid: u16, pid: u16) -> Vec<HidDeviceInfo> {
    let mut seen = HashSet::new();
    let mut devices = Vec::new();
    for info in api.device_list() {
        if info.vendor_id() != vid || info.product_id() != pid {
            continue;
        }
        let path = info.path().to_string_lossy().into_owned();
        if seen.insert(path.clone()) {
            devices.push(HidDeviceInfo {
                path,
                serial_number: info.serial_number().unwrap_or_default().to_string(),
            });
        }
    }
    devices
}

/// Enumerate, disambiguate, and open one matching HID interface.
///
/// With more than one candidate the caller must have supplied a device path
/// or a serial number; otherwise the candidates are reported back in the
/// error. The resolved path and serial are backfilled from the opened
/// handle where the OS provides them.
pub(crate) fn open_interface(
    vid: u16,
    pid: u16,
    device_path: Option<&str>,
    serial_number: Option<&str>,
) -> Result<OpenedHid> {
    let api = HidApi::new()?;

    let candidates = enumerate(&api, vid, pid);
    if candidates.is_empty() {
        return Err(LightError::NotFound { vid, pid });
    }
    if candidates.len() > 1 && device_path.is_none() && serial_number.is_none() {
        return Err(LightError::Ambiguous(DeviceCandidates(
            candidates
                .into_iter()
                .map(|c| (c.path, c.serial_number))
                .collect(),
        )));
    }

    let device = if let Some(path) = device_path {
        let cpath = CString::new(path)
            .map_err(|_| LightError::InvalidArgument(format!("device path {path:?}")))?;
        api.open_path(&cpath)
            .map_err(|err| LightError::Open(format!("path {path}: {err}")))?
    } else if let Some(serial) = serial_number {
        api.open_serial(vid, pid, serial)
            .map_err(|err| LightError::Open(format!("serial {serial}: {err}")))?
    } else {
        api.open(vid, pid)
            .map_err(|err| LightError::Open(format!("{vid:04x}:{pid:04x}: {err}")))?
    };

    let (path, serial_number) = match device.get_device_info() {
        Ok(info) => (
            Some(info.path().to_string_lossy().into_owned()),
            info.serial_number().map(str::to_string),
        ),
        Err(err) => {
            log::debug!("could not backfill device identity: {err}");
            (device_path.map(str::to_string), serial_number.map(str::to_string))
        }
    };

    Ok(OpenedHid {
        api,
        device,
        path,
        serial_number,
    })
}
