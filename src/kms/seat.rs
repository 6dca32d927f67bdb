//! Picks the primary KMS device of a seat from the udev `drm` subsystem.

use std::ffi::OsStr;
use std::io;
use std::path::{Path, PathBuf};

use rustix::io::Errno;

use super::device::Device;
use super::resources::KmsDevice;
use crate::error::{os_error, KmsError};

pub const DEFAULT_SEAT: &str = "seat0";

/// A `cardN` node as udev reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuCandidate {
    pub devnode: PathBuf,
    pub seat: String,
    pub boot_vga: bool,
    pub sysnum: Option<usize>,
    pub devnum: Option<u64>,
}

/// Devices without an `ID_SEAT` property belong to the default seat.
fn seat_name(id_seat: Option<&OsStr>) -> String {
    id_seat
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| DEFAULT_SEAT.to_owned())
}

/// All DRM card nodes, in udev enumeration order.
pub fn enumerate_candidates() -> io::Result<Vec<GpuCandidate>> {
    let mut enumerator = udev::Enumerator::new()?;
    enumerator.match_subsystem("drm")?;
    enumerator.match_sysname("card[0-9]*")?;

    let mut candidates = Vec::new();
    for dev in enumerator.scan_devices()? {
        let Some(devnode) = dev.devnode() else {
            continue;
        };
        let seat = seat_name(dev.property_value("ID_SEAT"));
        let boot_vga = match dev.parent_with_subsystem("pci") {
            Ok(Some(pci)) => pci.attribute_value("boot_vga").is_some_and(|v| v == "1"),
            Ok(None) => false,
            Err(e) => {
                tracing::debug!("{}: no PCI parent: {e}", devnode.display());
                false
            }
        };
        candidates.push(GpuCandidate {
            devnode: devnode.to_path_buf(),
            seat,
            boot_vga,
            sysnum: dev.sysnum(),
            devnum: dev.devnum().map(u64::from),
        });
    }
    Ok(candidates)
}

/// Choose the primary device among `candidates` on `seat`.
///
/// The first device that `qualify` accepts is held; a later boot-VGA device
/// that also qualifies replaces it and ends the search. Non-boot-VGA devices
/// seen after a device is held are not even tried.
pub fn select_primary<T, F>(
    candidates: impl IntoIterator<Item = GpuCandidate>,
    seat: &str,
    mut qualify: F,
) -> Option<T>
where
    F: FnMut(&GpuCandidate) -> Option<T>,
{
    let mut primary = None;
    for candidate in candidates {
        let node = candidate.devnode.display();
        if candidate.seat != seat {
            tracing::debug!("{node}: on {}, not {seat}", candidate.seat);
            continue;
        }
        if !candidate.boot_vga && primary.is_some() {
            tracing::debug!("{node}: already have a primary device, skipping");
            continue;
        }
        let Some(qualified) = qualify(&candidate) else {
            tracing::debug!("{node}: not usable for modesetting");
            continue;
        };
        if candidate.boot_vga {
            tracing::debug!("{node}: boot VGA device");
            return Some(qualified);
        }
        primary = Some(qualified);
    }
    primary
}

/// Open `path` and confirm it exposes CRTCs, connectors and encoders.
pub fn open_kms_device(path: &Path) -> Result<Device, KmsError> {
    let device = Device::open(path).map_err(|source| KmsError::DeviceOpenFailed {
        path: path.to_path_buf(),
        source,
    })?;
    let res = device
        .resources()
        .map_err(|e| KmsError::query(format!("resources of {}", path.display()), e))?;
    if !res.is_kms_capable() {
        tracing::debug!(
            "{}: {} crtcs, {} connectors, {} encoders",
            path.display(),
            res.crtcs.len(),
            res.connectors.len(),
            res.encoders.len()
        );
        return Err(KmsError::CapabilityUnsupported {
            capability: "modesetting",
            source: os_error(Errno::OPNOTSUPP),
        });
    }
    Ok(device)
}

/// Primary modesetting device of `seat`.
pub fn select_device(seat: &str) -> Result<Device, KmsError> {
    let candidates = enumerate_candidates().unwrap_or_else(|e| {
        tracing::warn!("udev enumeration failed: {e}");
        Vec::new()
    });

    let device = select_primary(candidates, seat, |c| match open_kms_device(&c.devnode) {
        Ok(device) => Some(device.with_identity(c.sysnum, c.devnum)),
        Err(e) => {
            tracing::debug!("{}: {:#}", c.devnode.display(), anyhow::Error::new(e));
            None
        }
    })
    .ok_or_else(|| KmsError::NoPrimaryDeviceFound {
        seat: seat.to_owned(),
    })?;

    tracing::info!("using {} on {seat}", device.path().display());
    Ok(device)
}
