//! Scanout buffer allocation.
//!
//! Three backends share the [`BufferAllocator`] interface:
//! - [`dumb::DumbAllocator`]: `CREATE_DUMB` buffers, any KMS driver.
//! - [`gbm::GbmAllocator`]: GBM buffer objects, possibly multi-planar.
//! - [`shm::ShmAllocator`]: anonymous POSIX shared memory for headless use
//!   or handing pixels to another process.
//!
//! All buffers are XRGB8888, mapped for CPU writes and zeroed on creation.

pub mod dumb;
pub mod gbm;
pub mod shm;

use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use rustix::io::Errno;

use super::mmap::MemoryMap;
use super::pixel_format;
use super::resources::{FramebufferPlanes, KmsDevice};
use crate::error::{os_error, KmsError};

/// GBM and ADDFB2 both cap buffers at four planes.
pub const MAX_PLANES: usize = 4;

/// Backend-specific storage behind a [`Buffer`].
pub enum Storage {
    Dumb { handle: u32 },
    Gbm(::gbm::BufferObject<()>),
    Shm { fd: OwnedFd },
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Storage::Dumb { handle } => write!(f, "Dumb({handle})"),
            Storage::Gbm(_) => f.write_str("Gbm"),
            Storage::Shm { fd } => write!(f, "Shm({fd:?})"),
        }
    }
}

/// A CPU-mapped XRGB8888 pixel buffer.
#[derive(Debug)]
pub struct Buffer {
    width: u32,
    height: u32,
    stride: u32,
    size: usize,
    storage: Storage,
    map: Option<MemoryMap>,
    exported: Vec<OwnedFd>,
}

impl Buffer {
    fn new(width: u32, height: u32, stride: u32, storage: Storage, mut map: MemoryMap) -> Self {
        map.as_mut_slice().fill(0);
        Buffer {
            width,
            height,
            stride,
            size: stride as usize * height as usize,
            storage,
            map: Some(map),
            exported: Vec::new(),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Bytes per row, at least `width * 4`.
    pub fn stride(&self) -> u32 {
        self.stride
    }

    /// Always `stride * height`.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    #[cfg(test)]
    pub fn pixels(&self) -> Option<&[u8]> {
        self.map.as_ref().map(|m| &m.as_slice()[..self.size])
    }

    pub fn pixels_mut(&mut self) -> Option<&mut [u8]> {
        let size = self.size;
        self.map.as_mut().map(|m| &mut m.as_mut_slice()[..size])
    }

    /// First file descriptor produced by [`BufferAllocator::export`], if any.
    pub fn exported_fd(&self) -> Option<BorrowedFd<'_>> {
        self.exported.first().map(|fd| fd.as_fd())
    }

    fn attach_export(&mut self, fd: OwnedFd) {
        self.exported.push(fd);
    }

    /// Drop the CPU mapping and any exported descriptors, returning the
    /// storage that still has to be released.
    fn unmap(mut self) -> Storage {
        self.map = None;
        self.exported.clear();
        self.storage
    }
}

/// Where the display subsystem finds one plane's memory.
#[derive(Debug)]
pub enum PlaneSource {
    /// A GEM handle already valid on the device.
    Handle(u32),
    /// A dma-buf or shm descriptor the device has to import.
    Fd(OwnedFd),
}

#[derive(Debug)]
pub struct PlaneExport {
    pub source: PlaneSource,
    pub pitch: u32,
    pub offset: u32,
}

/// Display-importable description of a buffer.
#[derive(Debug, Default)]
pub struct BufferExport {
    pub planes: Vec<PlaneExport>,
}

impl BufferExport {
    pub fn single(source: PlaneSource, pitch: u32) -> Self {
        BufferExport {
            planes: vec![PlaneExport {
                source,
                pitch,
                offset: 0,
            }],
        }
    }
}

/// Common contract of the buffer backends.
pub trait BufferAllocator {
    fn name(&self) -> &'static str;

    /// Allocate, map and zero a `width` x `height` buffer.
    fn create(&mut self, width: u32, height: u32) -> Result<Buffer, KmsError>;

    /// Produce the handles needed to register `buffer` as a framebuffer.
    /// Shareable descriptors are attached to the buffer.
    fn export(&mut self, buffer: &mut Buffer) -> Result<BufferExport, KmsError>;

    /// Unmap, then release the backend storage.
    fn destroy(&mut self, buffer: Buffer);

    /// Buffers created and not yet destroyed.
    fn outstanding(&self) -> usize;

    /// Release backend-wide resources. A no-op when already closed.
    fn close(&mut self);
}

/// Owns a freshly created buffer and destroys it unless [`ScopedBuffer::keep`]
/// is called.
pub struct ScopedBuffer<'a, A: BufferAllocator + ?Sized> {
    allocator: &'a mut A,
    buffer: Option<Buffer>,
}

impl<'a, A: BufferAllocator + ?Sized> ScopedBuffer<'a, A> {
    pub fn create(allocator: &'a mut A, width: u32, height: u32) -> Result<Self, KmsError> {
        let buffer = allocator.create(width, height)?;
        Ok(ScopedBuffer {
            allocator,
            buffer: Some(buffer),
        })
    }

    pub fn buffer(&self) -> &Buffer {
        self.buffer.as_ref().expect("buffer taken before drop")
    }

    pub fn export(&mut self) -> Result<BufferExport, KmsError> {
        let buffer = self.buffer.as_mut().expect("buffer taken before drop");
        self.allocator.export(buffer)
    }

    pub fn keep(mut self) -> Buffer {
        self.buffer.take().expect("buffer taken before drop")
    }
}

impl<A: BufferAllocator + ?Sized> Drop for ScopedBuffer<'_, A> {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.allocator.destroy(buffer);
        }
    }
}

fn registration_failed(buffer: &Buffer, source: io::Error) -> KmsError {
    KmsError::FramebufferRegistrationFailed {
        width: buffer.width(),
        height: buffer.height(),
        source,
    }
}

/// Register `export` as an XRGB8888 framebuffer the size of `buffer`.
///
/// Descriptor-backed planes are imported through PRIME first; those
/// temporary handles are closed once `ADDFB2` has returned.
pub fn create_framebuffer<D: KmsDevice + ?Sized>(
    device: &D,
    buffer: &Buffer,
    export: BufferExport,
) -> Result<u32, KmsError> {
    if export.planes.is_empty() || export.planes.len() > MAX_PLANES {
        return Err(registration_failed(buffer, os_error(Errno::INVAL)));
    }

    let mut planes = FramebufferPlanes {
        width: buffer.width(),
        height: buffer.height(),
        format: pixel_format::FORMAT,
        handles: [0; MAX_PLANES],
        pitches: [0; MAX_PLANES],
        offsets: [0; MAX_PLANES],
    };
    let mut imported = Vec::new();
    let mut result = Ok(());
    for (i, plane) in export.planes.iter().enumerate() {
        let handle = match &plane.source {
            PlaneSource::Handle(h) => *h,
            PlaneSource::Fd(fd) => match device.import_prime(fd.as_fd()) {
                Ok(h) => {
                    imported.push(h);
                    h
                }
                Err(e) => {
                    result = Err(e);
                    break;
                }
            },
        };
        planes.handles[i] = handle;
        planes.pitches[i] = plane.pitch;
        planes.offsets[i] = plane.offset;
    }

    let fb = result.and_then(|()| device.add_framebuffer(&planes));

    for handle in imported {
        if let Err(e) = device.close_buffer_handle(handle) {
            tracing::debug!("closing imported handle {handle} failed: {e}");
        }
    }

    let fb = fb.map_err(|e| registration_failed(buffer, e))?;
    tracing::debug!(
        "framebuffer {fb}: {}x{} stride={}",
        buffer.width(),
        buffer.height(),
        buffer.stride()
    );
    Ok(fb)
}
