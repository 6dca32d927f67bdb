use std::ffi::c_char;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};

use drm::control::{
    self, connector, crtc, framebuffer, Device as ControlDevice, Mode, RawResourceHandle,
};
use drm::{Device as BasicDevice, DriverCapability};

use super::mmap::MemoryMap;
use super::resources::{
    Capability, ConnectorInfo, CrtcState, DumbAllocation, EncoderInfo, FramebufferPlanes,
    KmsDevice, ModeInfo, Resources,
};
use crate::error::os_error;

/// Capability bits recorded by [`super::probe::probe`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub dumb_buffer: bool,
    pub prime_import: bool,
    pub prime_export: bool,
}

/// An opened DRM card node. The descriptor is closed when the device drops.
#[derive(Debug)]
pub struct Device {
    file: File,
    path: PathBuf,
    sysnum: Option<usize>,
    devnum: Option<u64>,
    capabilities: Capabilities,
}

impl AsFd for Device {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl BasicDevice for Device {}
impl ControlDevice for Device {}

impl Device {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Device {
            file,
            path: path.to_path_buf(),
            sysnum: None,
            devnum: None,
            capabilities: Capabilities::default(),
        })
    }

    /// Attach the udev identity of the node.
    pub fn with_identity(mut self, sysnum: Option<usize>, devnum: Option<u64>) -> Self {
        self.sysnum = sysnum;
        self.devnum = devnum;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sysnum(&self) -> Option<usize> {
        self.sysnum
    }

    pub fn devnum(&self) -> Option<u64> {
        self.devnum
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn set_capabilities(&mut self, capabilities: Capabilities) {
        self.capabilities = capabilities;
    }

    /// A second descriptor for the same open file description, for GBM.
    pub fn try_clone_file(&self) -> io::Result<File> {
        self.file.try_clone()
    }
}

fn handle<T: From<RawResourceHandle>>(id: u32) -> io::Result<T> {
    control::from_u32(id).ok_or_else(|| os_error(rustix::io::Errno::INVAL))
}

fn mode_from_drm(mode: &Mode) -> ModeInfo {
    let (hdisplay, vdisplay) = mode.size();
    let (hsync_start, hsync_end, htotal) = mode.hsync();
    let (vsync_start, vsync_end, vtotal) = mode.vsync();
    let mut name = [0u8; 32];
    let bytes = mode.name().to_bytes();
    let n = bytes.len().min(name.len() - 1);
    name[..n].copy_from_slice(&bytes[..n]);
    ModeInfo {
        clock: mode.clock(),
        hdisplay,
        hsync_start,
        hsync_end,
        htotal,
        hskew: mode.hskew(),
        vdisplay,
        vsync_start,
        vsync_end,
        vtotal,
        vscan: mode.vscan(),
        vrefresh: mode.vrefresh(),
        flags: mode.flags().bits(),
        mode_type: mode.mode_type().bits(),
        name,
    }
}

fn mode_to_drm(mode: &ModeInfo) -> Mode {
    Mode::from(drm_ffi::drm_mode_modeinfo {
        clock: mode.clock,
        hdisplay: mode.hdisplay,
        hsync_start: mode.hsync_start,
        hsync_end: mode.hsync_end,
        htotal: mode.htotal,
        hskew: mode.hskew,
        vdisplay: mode.vdisplay,
        vsync_start: mode.vsync_start,
        vsync_end: mode.vsync_end,
        vtotal: mode.vtotal,
        vscan: mode.vscan,
        vrefresh: mode.vrefresh,
        flags: mode.flags,
        type_: mode.mode_type,
        name: mode.name.map(|b| b as c_char),
    })
}

impl KmsDevice for Device {
    fn resources(&self) -> io::Result<Resources> {
        let res = self.resource_handles()?;
        Ok(Resources {
            connectors: res.connectors().iter().map(|&h| u32::from(h)).collect(),
            encoders: res.encoders().iter().map(|&h| u32::from(h)).collect(),
            crtcs: res.crtcs().iter().map(|&h| u32::from(h)).collect(),
        })
    }

    fn connector(&self, id: u32) -> io::Result<ConnectorInfo> {
        let info = self.get_connector(handle(id)?, false)?;
        Ok(ConnectorInfo {
            id,
            name: format!("{info}"),
            connected: info.state() == connector::State::Connected,
            current_encoder: info.current_encoder().map(u32::from),
            modes: info.modes().iter().map(mode_from_drm).collect(),
        })
    }

    fn encoder(&self, id: u32) -> io::Result<EncoderInfo> {
        let info = self.get_encoder(handle(id)?)?;
        Ok(EncoderInfo {
            id,
            crtc: info.crtc().map(u32::from),
        })
    }

    fn crtc(&self, id: u32) -> io::Result<CrtcState> {
        let info = self.get_crtc(handle(id)?)?;
        Ok(CrtcState {
            id,
            framebuffer: info.framebuffer().map(u32::from),
            position: info.position(),
            mode: info.mode().as_ref().map(mode_from_drm),
        })
    }

    fn set_crtc(
        &self,
        crtc: u32,
        framebuffer: Option<u32>,
        position: (u32, u32),
        connectors: &[u32],
        mode: Option<&ModeInfo>,
    ) -> io::Result<()> {
        let fb = framebuffer
            .map(handle::<framebuffer::Handle>)
            .transpose()?;
        let conns = connectors
            .iter()
            .map(|&id| handle::<connector::Handle>(id))
            .collect::<io::Result<Vec<_>>>()?;
        ControlDevice::set_crtc(
            self,
            handle::<crtc::Handle>(crtc)?,
            fb,
            position,
            &conns,
            mode.map(mode_to_drm),
        )
    }

    fn capability(&self, cap: Capability) -> io::Result<u64> {
        let cap = match cap {
            Capability::DumbBuffer => DriverCapability::DumbBuffer,
            Capability::Prime => DriverCapability::Prime,
        };
        self.get_driver_capability(cap)
    }

    fn create_dumb_buffer(&self, width: u32, height: u32, bpp: u32) -> io::Result<DumbAllocation> {
        let create = drm_ffi::mode::dumbbuffer::create(self.as_fd(), width, height, bpp, 0)?;
        Ok(DumbAllocation {
            handle: create.handle,
            pitch: create.pitch,
            size: create.size,
        })
    }

    fn map_dumb_buffer(&self, handle: u32, len: usize) -> io::Result<MemoryMap> {
        let map = drm_ffi::mode::dumbbuffer::map(self.as_fd(), handle, 0, 0)?;
        MemoryMap::shared(self.as_fd(), map.offset, len)
    }

    fn destroy_dumb_buffer(&self, handle: u32) -> io::Result<()> {
        drm_ffi::mode::dumbbuffer::destroy(self.as_fd(), handle)?;
        Ok(())
    }

    fn export_prime(&self, id: u32) -> io::Result<OwnedFd> {
        self.buffer_to_prime_fd(handle(id)?, drm::CLOEXEC | drm::RDWR)
    }

    fn import_prime(&self, fd: BorrowedFd<'_>) -> io::Result<u32> {
        self.prime_fd_to_buffer(fd).map(u32::from)
    }

    fn close_buffer_handle(&self, id: u32) -> io::Result<()> {
        self.close_buffer(handle(id)?)
    }

    fn add_framebuffer(&self, planes: &FramebufferPlanes) -> io::Result<u32> {
        let cmd = drm_ffi::mode::add_fb2(
            self.as_fd(),
            planes.width,
            planes.height,
            planes.format as u32,
            &planes.handles,
            &planes.pitches,
            &planes.offsets,
            &[0; 4],
            0,
        )?;
        Ok(cmd.fb_id)
    }

    fn remove_framebuffer(&self, framebuffer: u32) -> io::Result<()> {
        self.destroy_framebuffer(handle(framebuffer)?)
    }
}
