use std::io;
use std::os::fd::OwnedFd;

use rand::distr::Alphanumeric;
use rand::Rng;
use rustix::fs::Mode;
use rustix::io::Errno;
use rustix::shm::{self, ShmOFlags};

use crate::error::{os_error, KmsError};
use crate::kms::mmap::MemoryMap;
use crate::kms::pixel_format;

use super::{Buffer, BufferAllocator, BufferExport, PlaneSource, Storage};

const NAME_PREFIX: &str = "/kmsmode-";
const NAME_SUFFIX_LEN: usize = 6;

/// Total `shm_open` attempts before giving up on name collisions.
pub const NAME_ATTEMPTS: usize = 100;

/// Anonymous shared memory, for headless runs or handing pixels to another
/// process. The object is unlinked as soon as it is opened.
#[derive(Default)]
pub struct ShmAllocator {
    outstanding: usize,
}

impl ShmAllocator {
    pub fn new() -> Self {
        Self::default()
    }
}

fn random_name(rng: &mut impl Rng) -> String {
    let suffix: String = (0..NAME_SUFFIX_LEN)
        .map(|_| char::from(rng.sample(Alphanumeric)))
        .collect();
    format!("{NAME_PREFIX}{suffix}")
}

/// Call `open` with fresh random names until one does not collide.
///
/// Only `EEXIST` is retried, at most [`NAME_ATTEMPTS`] calls in total.
pub fn open_unique<F>(mut open: F) -> io::Result<(OwnedFd, String)>
where
    F: FnMut(&str) -> rustix::io::Result<OwnedFd>,
{
    let mut rng = rand::rng();
    for attempt in 1..=NAME_ATTEMPTS {
        let name = random_name(&mut rng);
        match open(&name) {
            Ok(fd) => return Ok((fd, name)),
            Err(Errno::EXIST) => tracing::trace!("shm name {name} taken (attempt {attempt})"),
            Err(e) => return Err(os_error(e)),
        }
    }
    Err(os_error(Errno::EXIST))
}

/// Create an unlinked shm object of `len` bytes.
fn allocate_shm_file(len: u64) -> io::Result<OwnedFd> {
    let (fd, name) = open_unique(|name| {
        shm::shm_open(
            name,
            ShmOFlags::CREATE | ShmOFlags::EXCL | ShmOFlags::RDWR,
            Mode::RUSR | Mode::WUSR,
        )
    })?;
    if let Err(e) = shm::shm_unlink(name.as_str()) {
        tracing::warn!("shm_unlink({name}) failed: {e}");
    }
    loop {
        match rustix::fs::ftruncate(&fd, len) {
            Ok(()) => return Ok(fd),
            Err(Errno::INTR) => continue,
            Err(e) => return Err(os_error(e)),
        }
    }
}

/// Stride and size of a tightly packed XRGB8888 image, `None` on overflow.
pub fn layout(width: u32, height: u32) -> Option<(u32, usize)> {
    let stride = pixel_format::min_stride(width)?;
    let size = (stride as usize).checked_mul(height as usize)?;
    Some((stride, size))
}

impl BufferAllocator for ShmAllocator {
    fn name(&self) -> &'static str {
        "shm"
    }

    fn create(&mut self, width: u32, height: u32) -> Result<Buffer, KmsError> {
        let alloc_failed = |source| KmsError::BufferAllocationFailed {
            width,
            height,
            source,
        };
        let (stride, size) =
            layout(width, height).ok_or_else(|| alloc_failed(os_error(Errno::OVERFLOW)))?;
        let fd = allocate_shm_file(size as u64).map_err(alloc_failed)?;
        let map =
            MemoryMap::shared(&fd, 0, size).map_err(|source| KmsError::BufferMapFailed { source })?;

        self.outstanding += 1;
        tracing::debug!("shm buffer: {width}x{height} stride={stride}");
        Ok(Buffer::new(width, height, stride, Storage::Shm { fd }, map))
    }

    fn export(&mut self, buffer: &mut Buffer) -> Result<BufferExport, KmsError> {
        let export_failed = |source| KmsError::BufferExportFailed { source };
        let Storage::Shm { fd } = &buffer.storage else {
            return Err(export_failed(io::Error::other("not a shm buffer")));
        };
        let for_display = fd.try_clone().map_err(export_failed)?;
        if buffer.exported.is_empty() {
            let shared = fd.try_clone().map_err(export_failed)?;
            buffer.exported.push(shared);
        }
        Ok(BufferExport::single(
            PlaneSource::Fd(for_display),
            buffer.stride(),
        ))
    }

    fn destroy(&mut self, buffer: Buffer) {
        match buffer.unmap() {
            Storage::Shm { fd } => drop(fd),
            other => tracing::error!("shm allocator asked to free {other:?}"),
        }
        self.outstanding = self.outstanding.saturating_sub(1);
    }

    fn outstanding(&self) -> usize {
        self.outstanding
    }

    fn close(&mut self) {
        if self.outstanding > 0 {
            tracing::warn!("closing shm allocator with {} live buffers", self.outstanding);
        }
    }
}
