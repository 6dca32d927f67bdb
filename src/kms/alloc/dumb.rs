use rustix::io::Errno;

use crate::error::{os_error, KmsError};
use crate::kms::pixel_format;
use crate::kms::resources::KmsDevice;

use super::{Buffer, BufferAllocator, BufferExport, PlaneSource, Storage};

/// Driver-allocated `CREATE_DUMB` buffers, mapped through the card fd.
///
/// Works on every KMS driver. The GEM handle is only valid on the owning
/// device; a PRIME fd is attached on export when the driver allows it.
pub struct DumbAllocator<'d, D: KmsDevice + ?Sized> {
    device: &'d D,
    outstanding: usize,
}

impl<'d, D: KmsDevice + ?Sized> DumbAllocator<'d, D> {
    pub fn new(device: &'d D) -> Self {
        DumbAllocator {
            device,
            outstanding: 0,
        }
    }
}

impl<D: KmsDevice + ?Sized> BufferAllocator for DumbAllocator<'_, D> {
    fn name(&self) -> &'static str {
        "dumb"
    }

    fn create(&mut self, width: u32, height: u32) -> Result<Buffer, KmsError> {
        let alloc = self
            .device
            .create_dumb_buffer(width, height, pixel_format::BITS_PER_PIXEL)
            .map_err(|source| KmsError::BufferAllocationFailed {
                width,
                height,
                source,
            })?;

        let pitch_ok = pixel_format::min_stride(width).is_some_and(|min| alloc.pitch >= min);
        let size = match (alloc.pitch as usize).checked_mul(height as usize) {
            Some(size) if pitch_ok && alloc.size >= size as u64 => size,
            _ => {
                tracing::warn!(
                    "driver returned pitch={} size={} for {width}x{height}",
                    alloc.pitch,
                    alloc.size
                );
                if let Err(e) = self.device.destroy_dumb_buffer(alloc.handle) {
                    tracing::warn!("destroying dumb buffer {} failed: {e}", alloc.handle);
                }
                return Err(KmsError::BufferAllocationFailed {
                    width,
                    height,
                    source: os_error(Errno::INVAL),
                });
            }
        };

        let map = match self.device.map_dumb_buffer(alloc.handle, size) {
            Ok(map) => map,
            Err(source) => {
                if let Err(e) = self.device.destroy_dumb_buffer(alloc.handle) {
                    tracing::warn!("destroying dumb buffer {} failed: {e}", alloc.handle);
                }
                return Err(KmsError::BufferMapFailed { source });
            }
        };

        self.outstanding += 1;
        tracing::debug!(
            "dumb buffer {}: {width}x{height} pitch={}",
            alloc.handle,
            alloc.pitch
        );
        Ok(Buffer::new(
            width,
            height,
            alloc.pitch,
            Storage::Dumb {
                handle: alloc.handle,
            },
            map,
        ))
    }

    fn export(&mut self, buffer: &mut Buffer) -> Result<BufferExport, KmsError> {
        let Storage::Dumb { handle } = *buffer.storage() else {
            return Err(KmsError::BufferExportFailed {
                source: std::io::Error::other("not a dumb buffer"),
            });
        };
        if buffer.exported_fd().is_none() {
            match self.device.export_prime(handle) {
                Ok(fd) => buffer.attach_export(fd),
                Err(e) => tracing::debug!("PRIME export of dumb buffer {handle} failed: {e}"),
            }
        }
        Ok(BufferExport::single(
            PlaneSource::Handle(handle),
            buffer.stride(),
        ))
    }

    fn destroy(&mut self, buffer: Buffer) {
        match buffer.unmap() {
            Storage::Dumb { handle } => {
                if let Err(e) = self.device.destroy_dumb_buffer(handle) {
                    tracing::warn!("destroying dumb buffer {handle} failed: {e}");
                }
            }
            other => tracing::error!("dumb allocator asked to free {other:?}"),
        }
        self.outstanding = self.outstanding.saturating_sub(1);
    }

    fn outstanding(&self) -> usize {
        self.outstanding
    }

    fn close(&mut self) {
        if self.outstanding > 0 {
            tracing::warn!("closing dumb allocator with {} live buffers", self.outstanding);
        }
    }
}
