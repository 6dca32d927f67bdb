//! In-memory stand-in for a DRM card, used by unit tests.

use std::cell::{Ref, RefCell, RefMut};
use std::collections::{BTreeMap, BTreeSet};
use std::ffi::c_void;
use std::fs::File;
use std::io;
use std::os::fd::{BorrowedFd, OwnedFd};

use drm_fourcc::DrmFourcc;
use rustix::io::Errno;
use rustix::mm::MsyncFlags;

use super::mmap::MemoryMap;
use super::resources::{
    Capability, ConnectorInfo, CrtcState, DumbAllocation, EncoderInfo, FramebufferPlanes,
    KmsDevice, ModeInfo, Resources, PRIME_CAP_EXPORT, PRIME_CAP_IMPORT,
};
use crate::error::os_error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    SetCrtc { crtc: u32, fb: Option<u32> },
    AddFb(u32),
    RemoveFb(u32),
    DestroyDumb(u32),
    CloseHandle(u32),
}

pub struct FakeState {
    pub dumb_cap: u64,
    pub prime_cap: u64,
    pub fail_cap_query: bool,
    pub fail_resources: bool,
    pub fail_create_dumb: bool,
    pub fail_add_fb: bool,
    pub fail_set_crtc: BTreeSet<u32>,
    /// Dumb buffer pitches are rounded up to this many bytes.
    pub pitch_align: u32,
    /// Report this pitch for every dumb buffer, whatever the width.
    pub pitch_override: Option<u32>,
    pub connectors: Vec<ConnectorInfo>,
    pub encoders: Vec<EncoderInfo>,
    pub crtcs: BTreeMap<u32, CrtcState>,
    pub dumb_buffers: BTreeMap<u32, u64>,
    /// Address and length of the last mapping handed out per dumb buffer.
    pub dumb_mappings: BTreeMap<u32, (usize, usize)>,
    /// Dumb buffers that were destroyed while still mapped.
    pub destroyed_while_mapped: Vec<u32>,
    pub imported: BTreeSet<u32>,
    pub framebuffers: BTreeMap<u32, FramebufferPlanes>,
    pub removed_framebuffers: BTreeSet<u32>,
    pub events: Vec<Event>,
    next_id: u32,
}

pub struct FakeDevice {
    state: RefCell<FakeState>,
}

pub fn test_mode(width: u16, height: u16, vrefresh: u32) -> ModeInfo {
    let mut name = [0u8; 32];
    let text = format!("{width}x{height}");
    name[..text.len()].copy_from_slice(text.as_bytes());
    ModeInfo {
        clock: u32::from(width) * u32::from(height) * vrefresh / 1000,
        hdisplay: width,
        hsync_start: width + 48,
        hsync_end: width + 80,
        htotal: width + 160,
        hskew: 0,
        vdisplay: height,
        vsync_start: height + 3,
        vsync_end: height + 8,
        vtotal: height + 45,
        vscan: 0,
        vrefresh,
        flags: 0,
        mode_type: 0,
        name,
    }
}

impl FakeDevice {
    pub fn new() -> Self {
        FakeDevice {
            state: RefCell::new(FakeState {
                dumb_cap: 1,
                prime_cap: PRIME_CAP_IMPORT | PRIME_CAP_EXPORT,
                fail_cap_query: false,
                fail_resources: false,
                fail_create_dumb: false,
                fail_add_fb: false,
                fail_set_crtc: BTreeSet::new(),
                pitch_align: 64,
                pitch_override: None,
                connectors: Vec::new(),
                encoders: Vec::new(),
                crtcs: BTreeMap::new(),
                dumb_buffers: BTreeMap::new(),
                dumb_mappings: BTreeMap::new(),
                destroyed_while_mapped: Vec::new(),
                imported: BTreeSet::new(),
                framebuffers: BTreeMap::new(),
                removed_framebuffers: BTreeSet::new(),
                events: Vec::new(),
                next_id: 1000,
            }),
        }
    }

    pub fn state(&self) -> Ref<'_, FakeState> {
        self.state.borrow()
    }

    pub fn state_mut(&self) -> RefMut<'_, FakeState> {
        self.state.borrow_mut()
    }

    /// Add a connected output driven through `encoder` by `crtc`, which
    /// currently shows framebuffer `crtc + 500` at `modes[0]`.
    pub fn add_output(&self, connector: u32, encoder: u32, crtc: u32, modes: Vec<ModeInfo>) {
        let mut st = self.state_mut();
        st.crtcs.insert(
            crtc,
            CrtcState {
                id: crtc,
                framebuffer: Some(crtc + 500),
                position: (0, 0),
                mode: modes.first().copied(),
            },
        );
        if !st.encoders.iter().any(|e| e.id == encoder) {
            st.encoders.push(EncoderInfo {
                id: encoder,
                crtc: Some(crtc),
            });
        }
        st.connectors.push(ConnectorInfo {
            id: connector,
            name: format!("Virtual-{connector}"),
            connected: true,
            current_encoder: Some(encoder),
            modes,
        });
    }

    pub fn add_disconnected(&self, connector: u32) {
        self.state_mut().connectors.push(ConnectorInfo {
            id: connector,
            name: format!("Virtual-{connector}"),
            connected: false,
            current_encoder: None,
            modes: Vec::new(),
        });
    }

    pub fn live_framebuffers(&self) -> usize {
        self.state().framebuffers.len()
    }

    pub fn live_dumb_buffers(&self) -> usize {
        self.state().dumb_buffers.len()
    }
}

/// `msync` fails with `ENOMEM` once the range is no longer mapped.
fn is_mapped(addr: usize, len: usize) -> bool {
    // SAFETY: msync only inspects the range; it never dereferences it.
    unsafe { rustix::mm::msync(addr as *mut c_void, len, MsyncFlags::ASYNC) }.is_ok()
}

fn errno(e: Errno) -> io::Error {
    os_error(e)
}

impl FakeState {
    fn alloc_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }
}

impl KmsDevice for FakeDevice {
    fn resources(&self) -> io::Result<Resources> {
        let st = self.state();
        if st.fail_resources {
            return Err(errno(Errno::ACCESS));
        }
        Ok(Resources {
            connectors: st.connectors.iter().map(|c| c.id).collect(),
            encoders: st.encoders.iter().map(|e| e.id).collect(),
            crtcs: st.crtcs.keys().copied().collect(),
        })
    }

    fn connector(&self, id: u32) -> io::Result<ConnectorInfo> {
        self.state()
            .connectors
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .ok_or_else(|| errno(Errno::NOENT))
    }

    fn encoder(&self, id: u32) -> io::Result<EncoderInfo> {
        self.state()
            .encoders
            .iter()
            .find(|e| e.id == id)
            .copied()
            .ok_or_else(|| errno(Errno::NOENT))
    }

    fn crtc(&self, id: u32) -> io::Result<CrtcState> {
        self.state()
            .crtcs
            .get(&id)
            .copied()
            .ok_or_else(|| errno(Errno::NOENT))
    }

    fn set_crtc(
        &self,
        crtc: u32,
        framebuffer: Option<u32>,
        position: (u32, u32),
        _connectors: &[u32],
        mode: Option<&ModeInfo>,
    ) -> io::Result<()> {
        let mut st = self.state_mut();
        if st.fail_set_crtc.contains(&crtc) {
            return Err(errno(Errno::INVAL));
        }
        if let Some(fb) = framebuffer {
            if st.removed_framebuffers.contains(&fb) {
                return Err(errno(Errno::NOENT));
            }
        }
        let state = st.crtcs.get_mut(&crtc).ok_or_else(|| errno(Errno::NOENT))?;
        state.framebuffer = framebuffer;
        state.position = position;
        state.mode = mode.copied();
        st.events.push(Event::SetCrtc {
            crtc,
            fb: framebuffer,
        });
        Ok(())
    }

    fn capability(&self, cap: Capability) -> io::Result<u64> {
        let st = self.state();
        if st.fail_cap_query {
            return Err(errno(Errno::INVAL));
        }
        Ok(match cap {
            Capability::DumbBuffer => st.dumb_cap,
            Capability::Prime => st.prime_cap,
        })
    }

    fn create_dumb_buffer(&self, width: u32, height: u32, bpp: u32) -> io::Result<DumbAllocation> {
        let mut st = self.state_mut();
        if st.fail_create_dumb || width == 0 || height == 0 {
            return Err(errno(Errno::NOMEM));
        }
        let align = st.pitch_align;
        let pitch = st
            .pitch_override
            .unwrap_or_else(|| (width * bpp / 8).div_ceil(align) * align);
        let size = u64::from(pitch) * u64::from(height);
        let handle = st.alloc_id();
        st.dumb_buffers.insert(handle, size);
        Ok(DumbAllocation {
            handle,
            pitch,
            size,
        })
    }

    fn map_dumb_buffer(&self, handle: u32, len: usize) -> io::Result<MemoryMap> {
        let size = *self
            .state()
            .dumb_buffers
            .get(&handle)
            .ok_or_else(|| errno(Errno::NOENT))?;
        if len as u64 > size {
            return Err(errno(Errno::INVAL));
        }
        let map = MemoryMap::anonymous(len)?;
        self.state_mut()
            .dumb_mappings
            .insert(handle, (map.as_slice().as_ptr() as usize, len));
        Ok(map)
    }

    fn destroy_dumb_buffer(&self, handle: u32) -> io::Result<()> {
        let mut st = self.state_mut();
        st.dumb_buffers
            .remove(&handle)
            .ok_or_else(|| errno(Errno::NOENT))?;
        if let Some((addr, len)) = st.dumb_mappings.remove(&handle) {
            if is_mapped(addr, len) {
                st.destroyed_while_mapped.push(handle);
            }
        }
        st.events.push(Event::DestroyDumb(handle));
        Ok(())
    }

    fn export_prime(&self, handle: u32) -> io::Result<OwnedFd> {
        if !self.state().dumb_buffers.contains_key(&handle) {
            return Err(errno(Errno::NOENT));
        }
        Ok(File::open("/dev/null")?.into())
    }

    fn import_prime(&self, _fd: BorrowedFd<'_>) -> io::Result<u32> {
        let mut st = self.state_mut();
        if st.prime_cap & PRIME_CAP_IMPORT == 0 {
            return Err(errno(Errno::NOSYS));
        }
        let handle = st.alloc_id();
        st.imported.insert(handle);
        Ok(handle)
    }

    fn close_buffer_handle(&self, handle: u32) -> io::Result<()> {
        let mut st = self.state_mut();
        if !st.imported.remove(&handle) {
            return Err(errno(Errno::NOENT));
        }
        st.events.push(Event::CloseHandle(handle));
        Ok(())
    }

    fn add_framebuffer(&self, planes: &FramebufferPlanes) -> io::Result<u32> {
        let mut st = self.state_mut();
        if st.fail_add_fb || planes.format != DrmFourcc::Xrgb8888 {
            return Err(errno(Errno::INVAL));
        }
        let handle = planes.handles[0];
        if !st.dumb_buffers.contains_key(&handle) && !st.imported.contains(&handle) {
            return Err(errno(Errno::NOENT));
        }
        if planes.pitches[0] < planes.width * 4 {
            return Err(errno(Errno::INVAL));
        }
        let fb = st.alloc_id();
        st.framebuffers.insert(fb, *planes);
        st.events.push(Event::AddFb(fb));
        Ok(fb)
    }

    fn remove_framebuffer(&self, framebuffer: u32) -> io::Result<()> {
        let mut st = self.state_mut();
        st.framebuffers
            .remove(&framebuffer)
            .ok_or_else(|| errno(Errno::NOENT))?;
        st.removed_framebuffers.insert(framebuffer);
        st.events.push(Event::RemoveFb(framebuffer));
        Ok(())
    }
}
