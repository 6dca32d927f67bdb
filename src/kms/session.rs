//! One modesetting run on one device: scan, commit, then put everything back.

use super::alloc::BufferAllocator;
use super::modeset::{self, BindingState};
use super::resources::KmsDevice;
use super::scan::{scan_connectors, OutputBinding, ScanReport};
use crate::error::KmsError;

/// Owns every binding made on a device plus the allocator that backs them.
///
/// Dropping the session tears it down if [`Session::teardown`] was not
/// called explicitly.
pub struct Session<'d, D: KmsDevice + ?Sized> {
    device: &'d D,
    allocator: Box<dyn BufferAllocator + 'd>,
    bindings: Vec<OutputBinding>,
    torn_down: bool,
}

impl<'d, D: KmsDevice + ?Sized> Session<'d, D> {
    pub fn new(device: &'d D, allocator: Box<dyn BufferAllocator + 'd>) -> Self {
        tracing::debug!("session using {} buffers", allocator.name());
        Session {
            device,
            allocator,
            bindings: Vec::new(),
            torn_down: false,
        }
    }

    pub fn scan(&mut self) -> Result<ScanReport, KmsError> {
        scan_connectors(self.device, self.allocator.as_mut(), &mut self.bindings)
    }

    /// Commit every unbound binding. Returns how many are now on screen.
    pub fn commit_all(&mut self) -> usize {
        let mut committed = 0;
        for binding in &mut self.bindings {
            if binding.state != BindingState::Unbound {
                continue;
            }
            match modeset::commit(self.device, binding) {
                Ok(()) => committed += 1,
                Err(e) => {
                    let errno = e.errno();
                    tracing::warn!(
                        errno = ?errno,
                        "{}: {:#}",
                        binding.connector_name,
                        anyhow::Error::new(e)
                    )
                }
            }
        }
        committed
    }

    pub fn bindings(&self) -> &[OutputBinding] {
        &self.bindings
    }

    pub fn bindings_mut(&mut self) -> &mut [OutputBinding] {
        &mut self.bindings
    }

    pub fn allocator_name(&self) -> &'static str {
        self.allocator.name()
    }

    /// Undo everything in reverse: restore CRTCs, drop framebuffers, free
    /// buffers, then close the allocator. Safe to call more than once.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        while let Some(mut binding) = self.bindings.pop() {
            if let Err(e) = modeset::restore(self.device, &mut binding) {
                tracing::warn!("{}: {:#}", binding.connector_name, anyhow::Error::new(e));
            }
            if let Err(e) = self.device.remove_framebuffer(binding.framebuffer) {
                tracing::warn!("removing framebuffer {} failed: {e}", binding.framebuffer);
            }
            self.allocator.destroy(binding.buffer);
        }
        let leaked = self.allocator.outstanding();
        if leaked > 0 {
            tracing::warn!("{leaked} {} buffer(s) outlived their bindings", self.allocator.name());
        }
        self.allocator.close();
        tracing::info!("session torn down");
    }
}

impl<D: KmsDevice + ?Sized> Drop for Session<'_, D> {
    fn drop(&mut self) {
        self.teardown();
    }
}
