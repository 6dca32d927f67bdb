use std::fs::File;
use std::io;

use gbm::{BufferObject, BufferObjectFlags};
use rustix::io::Errno;

use crate::error::{os_error, KmsError};
use crate::kms::device::Device;
use crate::kms::mmap::MemoryMap;
use crate::kms::pixel_format;

use super::{Buffer, BufferAllocator, BufferExport, PlaneExport, PlaneSource, Storage, MAX_PLANES};

/// Buffer objects from the platform graphics-memory allocator.
///
/// CPU access goes through the object's dma-buf descriptor, so the buffer
/// is requested with `WRITE` usage to keep it linear.
pub struct GbmAllocator {
    gbm: Option<gbm::Device<File>>,
    outstanding: usize,
}

fn gbm_error<E: std::error::Error + Send + Sync + 'static>(e: E) -> io::Error {
    io::Error::other(e)
}

/// Number of planes to export, rejecting layouts ADDFB2 cannot describe.
pub fn check_plane_count(planes: u32) -> io::Result<usize> {
    match planes as usize {
        0 => Err(os_error(Errno::INVAL)),
        n if n > MAX_PLANES => Err(os_error(Errno::TOOBIG)),
        n => Ok(n),
    }
}

/// Planes whose dma-buf fd still has to be attached, given how many fds the
/// buffer already holds.
fn extra_planes_to_export(attached: usize, planes: usize) -> std::ops::Range<usize> {
    attached.max(1)..planes
}

/// Per-plane handle/stride/offset, or the combined single-plane layout when
/// the driver cannot report planes individually.
fn plane_layout(bo: &BufferObject<()>, planes: usize) -> io::Result<Vec<PlaneExport>> {
    let per_plane = (0..planes as i32)
        .map(|i| {
            let handle = bo.handle_for_plane(i).map_err(gbm_error)?;
            Ok(PlaneExport {
                // SAFETY: GEM handles are reported through the 32-bit member.
                source: PlaneSource::Handle(unsafe { handle.s32 } as u32),
                pitch: bo.stride_for_plane(i).map_err(gbm_error)?,
                offset: bo.offset(i).map_err(gbm_error)?,
            })
        })
        .collect::<io::Result<Vec<_>>>();

    match per_plane {
        Ok(layout) => Ok(layout),
        Err(e) => {
            tracing::debug!("per-plane export unavailable ({e}), using combined handle");
            let handle = bo.handle().map_err(gbm_error)?;
            Ok(vec![PlaneExport {
                // SAFETY: as above.
                source: PlaneSource::Handle(unsafe { handle.s32 } as u32),
                pitch: bo.stride().map_err(gbm_error)?,
                offset: bo.offset(0).map_err(gbm_error)?,
            }])
        }
    }
}

impl GbmAllocator {
    pub fn new(device: &Device) -> Result<Self, KmsError> {
        let open_failed = |source| KmsError::DeviceOpenFailed {
            path: device.path().to_path_buf(),
            source,
        };
        let file = device.try_clone_file().map_err(open_failed)?;
        let gbm = gbm::Device::new(file).map_err(open_failed)?;
        if !device.capabilities().prime_export {
            tracing::warn!("GBM buffers need PRIME export for CPU mapping");
        }
        tracing::info!("GBM allocator on {}", device.path().display());
        Ok(GbmAllocator {
            gbm: Some(gbm),
            outstanding: 0,
        })
    }
}

impl BufferAllocator for GbmAllocator {
    fn name(&self) -> &'static str {
        "gbm"
    }

    fn create(&mut self, width: u32, height: u32) -> Result<Buffer, KmsError> {
        let alloc_failed = |source| KmsError::BufferAllocationFailed {
            width,
            height,
            source,
        };
        let gbm = self
            .gbm
            .as_ref()
            .ok_or_else(|| alloc_failed(os_error(Errno::BADF)))?;

        let bo = gbm
            .create_buffer_object::<()>(
                width,
                height,
                pixel_format::FORMAT,
                BufferObjectFlags::RENDERING | BufferObjectFlags::SCANOUT | BufferObjectFlags::WRITE,
            )
            .map_err(alloc_failed)?;

        let planes = bo.plane_count().map_err(gbm_error).map_err(alloc_failed)?;
        check_plane_count(planes).map_err(alloc_failed)?;
        let stride = bo.stride().map_err(gbm_error).map_err(alloc_failed)?;
        if !pixel_format::min_stride(width).is_some_and(|min| stride >= min) {
            return Err(alloc_failed(os_error(Errno::INVAL)));
        }

        let fd = bo
            .fd()
            .map_err(|e| KmsError::BufferMapFailed { source: gbm_error(e) })?;
        let size = stride as usize * height as usize;
        let map =
            MemoryMap::shared(&fd, 0, size).map_err(|source| KmsError::BufferMapFailed { source })?;

        self.outstanding += 1;
        tracing::debug!("gbm buffer: {width}x{height} stride={stride} planes={planes}");
        let mut buffer = Buffer::new(width, height, stride, Storage::Gbm(bo), map);
        buffer.attach_export(fd);
        Ok(buffer)
    }

    fn export(&mut self, buffer: &mut Buffer) -> Result<BufferExport, KmsError> {
        let export_failed = |source| KmsError::BufferExportFailed { source };
        let Storage::Gbm(bo) = &buffer.storage else {
            return Err(export_failed(io::Error::other("not a GBM buffer")));
        };

        let planes = bo.plane_count().map_err(gbm_error).map_err(export_failed)?;
        let planes = check_plane_count(planes).map_err(export_failed)?;
        let layout = plane_layout(bo, planes).map_err(export_failed)?;

        // Plane 0's descriptor was attached at creation; the rest only on
        // the first export.
        for i in extra_planes_to_export(buffer.exported.len(), planes) {
            match bo.fd_for_plane(i as i32) {
                Ok(fd) => buffer.exported.push(fd),
                Err(e) => tracing::debug!("no dma-buf fd for plane {i}: {e}"),
            }
        }

        Ok(BufferExport { planes: layout })
    }

    fn destroy(&mut self, buffer: Buffer) {
        match buffer.unmap() {
            Storage::Gbm(bo) => drop(bo),
            other => tracing::error!("gbm allocator asked to free {other:?}"),
        }
        self.outstanding = self.outstanding.saturating_sub(1);
    }

    fn outstanding(&self) -> usize {
        self.outstanding
    }

    fn close(&mut self) {
        if self.outstanding > 0 {
            tracing::warn!("closing gbm allocator with {} live buffers", self.outstanding);
            return;
        }
        if self.gbm.take().is_some() {
            tracing::debug!("gbm device released");
        }
    }
}
