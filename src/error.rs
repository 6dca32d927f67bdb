use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by device discovery, buffer allocation and modesetting.
///
/// Every variant except [`KmsError::NoPrimaryDeviceFound`] keeps the
/// originating system error as its source.
#[derive(Debug, Error)]
pub enum KmsError {
    #[error("cannot open DRM device {}", path.display())]
    DeviceOpenFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("device does not support {capability}")]
    CapabilityUnsupported {
        capability: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("no KMS-capable DRM device found on {seat}")]
    NoPrimaryDeviceFound { seat: String },

    #[error("failed to query {what}")]
    ResourceQueryFailed {
        what: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to allocate {width}x{height} buffer")]
    BufferAllocationFailed {
        width: u32,
        height: u32,
        #[source]
        source: io::Error,
    },

    #[error("failed to map buffer")]
    BufferMapFailed {
        #[source]
        source: io::Error,
    },

    #[error("failed to export buffer")]
    BufferExportFailed {
        #[source]
        source: io::Error,
    },

    #[error("display rejected {width}x{height} framebuffer")]
    FramebufferRegistrationFailed {
        width: u32,
        height: u32,
        #[source]
        source: io::Error,
    },

    #[error("failed to program CRTC {crtc}")]
    ModesetCommitFailed {
        crtc: u32,
        #[source]
        source: io::Error,
    },

    #[error("failed to restore CRTC {crtc}")]
    ModesetRestoreFailed {
        crtc: u32,
        #[source]
        source: io::Error,
    },
}

impl KmsError {
    pub(crate) fn query(what: impl Into<String>, source: io::Error) -> Self {
        KmsError::ResourceQueryFailed {
            what: what.into(),
            source,
        }
    }

    /// The raw errno behind this error, if the system reported one.
    pub fn errno(&self) -> Option<i32> {
        match self {
            KmsError::NoPrimaryDeviceFound { .. } => None,
            KmsError::DeviceOpenFailed { source, .. }
            | KmsError::CapabilityUnsupported { source, .. }
            | KmsError::ResourceQueryFailed { source, .. }
            | KmsError::BufferAllocationFailed { source, .. }
            | KmsError::BufferMapFailed { source }
            | KmsError::BufferExportFailed { source }
            | KmsError::FramebufferRegistrationFailed { source, .. }
            | KmsError::ModesetCommitFailed { source, .. }
            | KmsError::ModesetRestoreFailed { source, .. } => source.raw_os_error(),
        }
    }
}

/// Convert a rustix errno into the `io::Error` carried by [`KmsError`].
pub(crate) fn os_error(errno: rustix::io::Errno) -> io::Error {
    io::Error::from_raw_os_error(errno.raw_os_error())
}
