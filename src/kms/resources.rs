//! Plain-data view of the KMS objects the modesetting core works with, and
//! the device operations it needs.
//!
//! The real implementation sits on top of the `drm` crate (see
//! [`super::device::Device`]); tests substitute an in-memory device.

use std::ffi::CStr;
use std::io;
use std::os::fd::{BorrowedFd, OwnedFd};

use drm_fourcc::DrmFourcc;

use super::mmap::MemoryMap;

/// A display mode exactly as the kernel describes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeInfo {
    pub clock: u32,
    pub hdisplay: u16,
    pub hsync_start: u16,
    pub hsync_end: u16,
    pub htotal: u16,
    pub hskew: u16,
    pub vdisplay: u16,
    pub vsync_start: u16,
    pub vsync_end: u16,
    pub vtotal: u16,
    pub vscan: u16,
    pub vrefresh: u32,
    pub flags: u32,
    pub mode_type: u32,
    pub name: [u8; 32],
}

impl ModeInfo {
    pub fn size(&self) -> (u32, u32) {
        (u32::from(self.hdisplay), u32::from(self.vdisplay))
    }

    pub fn name(&self) -> &str {
        CStr::from_bytes_until_nul(&self.name)
            .ok()
            .and_then(|s| s.to_str().ok())
            .unwrap_or("")
    }
}

impl std::fmt::Display for ModeInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}@{}", self.hdisplay, self.vdisplay, self.vrefresh)
    }
}

/// Object ids reported by `GETRESOURCES`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resources {
    pub connectors: Vec<u32>,
    pub encoders: Vec<u32>,
    pub crtcs: Vec<u32>,
}

impl Resources {
    /// A device can drive a display only if it exposes all three object kinds.
    pub fn is_kms_capable(&self) -> bool {
        !self.crtcs.is_empty() && !self.connectors.is_empty() && !self.encoders.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorInfo {
    pub id: u32,
    pub name: String,
    pub connected: bool,
    pub current_encoder: Option<u32>,
    pub modes: Vec<ModeInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderInfo {
    pub id: u32,
    pub crtc: Option<u32>,
}

/// Current configuration of a CRTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrtcState {
    pub id: u32,
    pub framebuffer: Option<u32>,
    pub position: (u32, u32),
    pub mode: Option<ModeInfo>,
}

/// Driver capabilities the core queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    DumbBuffer,
    Prime,
}

pub const PRIME_CAP_IMPORT: u64 = 0x1;
pub const PRIME_CAP_EXPORT: u64 = 0x2;

/// Result of `CREATE_DUMB`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumbAllocation {
    pub handle: u32,
    pub pitch: u32,
    pub size: u64,
}

/// Arguments for `ADDFB2`. Unused planes have a zero handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramebufferPlanes {
    pub width: u32,
    pub height: u32,
    pub format: DrmFourcc,
    pub handles: [u32; 4],
    pub pitches: [u32; 4],
    pub offsets: [u32; 4],
}

/// Operations the modesetting core performs on a DRM device.
///
/// Object ids are the raw `u32` ids the kernel hands out.
pub trait KmsDevice {
    fn resources(&self) -> io::Result<Resources>;
    fn connector(&self, id: u32) -> io::Result<ConnectorInfo>;
    fn encoder(&self, id: u32) -> io::Result<EncoderInfo>;
    fn crtc(&self, id: u32) -> io::Result<CrtcState>;

    /// Legacy `SETCRTC`. `None` framebuffer and mode disable the CRTC.
    fn set_crtc(
        &self,
        crtc: u32,
        framebuffer: Option<u32>,
        position: (u32, u32),
        connectors: &[u32],
        mode: Option<&ModeInfo>,
    ) -> io::Result<()>;

    fn capability(&self, cap: Capability) -> io::Result<u64>;

    fn create_dumb_buffer(&self, width: u32, height: u32, bpp: u32) -> io::Result<DumbAllocation>;
    fn map_dumb_buffer(&self, handle: u32, len: usize) -> io::Result<MemoryMap>;
    fn destroy_dumb_buffer(&self, handle: u32) -> io::Result<()>;

    fn export_prime(&self, handle: u32) -> io::Result<OwnedFd>;
    fn import_prime(&self, fd: BorrowedFd<'_>) -> io::Result<u32>;
    fn close_buffer_handle(&self, handle: u32) -> io::Result<()>;

    fn add_framebuffer(&self, planes: &FramebufferPlanes) -> io::Result<u32>;
    fn remove_framebuffer(&self, framebuffer: u32) -> io::Result<()>;
}
