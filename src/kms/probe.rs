use rustix::io::Errno;

use super::device::Capabilities;
use super::resources::{Capability, KmsDevice, PRIME_CAP_EXPORT, PRIME_CAP_IMPORT};
use crate::error::{os_error, KmsError};

/// Check that the device can allocate CPU-writable scanout buffers.
///
/// Dumb-buffer support is mandatory. PRIME support is only recorded: the
/// dumb and shm paths work without it.
pub fn probe<D: KmsDevice + ?Sized>(device: &D) -> Result<Capabilities, KmsError> {
    match device.capability(Capability::DumbBuffer) {
        Ok(0) => {
            return Err(KmsError::CapabilityUnsupported {
                capability: "DRM_CAP_DUMB_BUFFER",
                source: os_error(Errno::OPNOTSUPP),
            })
        }
        Ok(_) => {}
        Err(source) => {
            return Err(KmsError::CapabilityUnsupported {
                capability: "DRM_CAP_DUMB_BUFFER",
                source,
            })
        }
    }

    let prime = device.capability(Capability::Prime).unwrap_or_else(|e| {
        tracing::debug!("DRM_CAP_PRIME query failed: {e}");
        0
    });
    let caps = Capabilities {
        dumb_buffer: true,
        prime_import: prime & PRIME_CAP_IMPORT != 0,
        prime_export: prime & PRIME_CAP_EXPORT != 0,
    };
    if !caps.prime_import {
        tracing::warn!("PRIME import not supported; fd-backed buffers cannot be scanned out");
    }
    if !caps.prime_export {
        tracing::warn!("PRIME export not supported; buffers cannot be shared as dma-bufs");
    }
    Ok(caps)
}
