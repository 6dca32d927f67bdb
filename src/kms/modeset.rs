//! Legacy single-CRTC modesetting: commit a binding's framebuffer and put
//! the previous configuration back on exit.

use super::resources::{CrtcState, KmsDevice, ModeInfo};
use super::scan::OutputBinding;
use crate::error::KmsError;

/// Commit state of one [`OutputBinding`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingState {
    Unbound,
    Committed,
    Restored,
}

/// CRTC configuration captured right before we took the CRTC over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SavedCrtc {
    pub crtc: u32,
    pub framebuffer: Option<u32>,
    pub position: (u32, u32),
    pub mode: Option<ModeInfo>,
}

impl From<CrtcState> for SavedCrtc {
    fn from(state: CrtcState) -> Self {
        SavedCrtc {
            crtc: state.id,
            framebuffer: state.framebuffer,
            position: state.position,
            mode: state.mode,
        }
    }
}

/// Save the CRTC's current state, then scan out the binding's framebuffer at
/// (0, 0). On failure the binding stays [`BindingState::Unbound`].
pub fn commit<D: KmsDevice + ?Sized>(
    device: &D,
    binding: &mut OutputBinding,
) -> Result<(), KmsError> {
    let current = device
        .crtc(binding.crtc)
        .map_err(|e| KmsError::query(format!("CRTC {}", binding.crtc), e))?;
    binding.saved = Some(SavedCrtc::from(current));

    if let Err(source) = device.set_crtc(
        binding.crtc,
        Some(binding.framebuffer),
        (0, 0),
        &[binding.connector],
        Some(&binding.mode),
    ) {
        binding.saved = None;
        return Err(KmsError::ModesetCommitFailed {
            crtc: binding.crtc,
            source,
        });
    }

    binding.state = BindingState::Committed;
    tracing::info!(
        "{}: CRTC {} showing framebuffer {} at {}",
        binding.connector_name,
        binding.crtc,
        binding.framebuffer,
        binding.mode
    );
    Ok(())
}

/// Reprogram the CRTC with its saved state and release that state.
///
/// The binding is marked restored even when the kernel refuses, so teardown
/// can carry on with the remaining bindings.
pub fn restore<D: KmsDevice + ?Sized>(
    device: &D,
    binding: &mut OutputBinding,
) -> Result<(), KmsError> {
    let Some(saved) = binding.saved.take() else {
        return Ok(());
    };
    binding.state = BindingState::Restored;

    let connectors: &[u32] = if saved.mode.is_some() {
        std::slice::from_ref(&binding.connector)
    } else {
        &[]
    };
    device
        .set_crtc(
            saved.crtc,
            saved.framebuffer,
            saved.position,
            connectors,
            saved.mode.as_ref(),
        )
        .map_err(|source| KmsError::ModesetRestoreFailed {
            crtc: saved.crtc,
            source,
        })?;

    tracing::debug!(
        "CRTC {} restored to framebuffer {:?}",
        saved.crtc,
        saved.framebuffer
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kms::alloc::dumb::DumbAllocator;
    use crate::kms::alloc::BufferAllocator;
    use crate::kms::fake::{test_mode, FakeDevice};
    use crate::kms::scan::scan_connectors;

    fn bound(dev: &FakeDevice) -> (DumbAllocator<'_, FakeDevice>, Vec<OutputBinding>) {
        let mut alloc = DumbAllocator::new(dev);
        let mut bindings = Vec::new();
        scan_connectors(dev, &mut alloc, &mut bindings).unwrap();
        (alloc, bindings)
    }

    fn release(dev: &FakeDevice, alloc: &mut DumbAllocator<'_, FakeDevice>, bindings: Vec<OutputBinding>) {
        for b in bindings.into_iter().rev() {
            dev.remove_framebuffer(b.framebuffer).unwrap();
            alloc.destroy(b.buffer);
        }
    }

    #[test]
    fn commit_then_restore_round_trips_crtc_state() {
        let dev = FakeDevice::new();
        let prior_mode = test_mode(1280, 720, 60);
        dev.add_output(1, 2, 3, vec![test_mode(1920, 1080, 60), prior_mode]);
        {
            let mut st = dev.state_mut();
            let crtc = st.crtcs.get_mut(&3).unwrap();
            crtc.position = (16, 32);
            crtc.mode = Some(prior_mode);
        }
        let before = dev.crtc(3).unwrap();

        let (mut alloc, mut bindings) = bound(&dev);
        let binding = &mut bindings[0];
        commit(&dev, binding).unwrap();
        assert_eq!(binding.state, BindingState::Committed);
        let live = dev.crtc(3).unwrap();
        assert_eq!(live.framebuffer, Some(binding.framebuffer));
        assert_eq!(live.position, (0, 0));
        assert_eq!(live.mode, Some(test_mode(1920, 1080, 60)));

        restore(&dev, binding).unwrap();
        assert_eq!(binding.state, BindingState::Restored);
        assert!(binding.saved.is_none());
        assert_eq!(dev.crtc(3).unwrap(), before);

        release(&dev, &mut alloc, bindings);
    }

    #[test]
    fn restoring_a_disabled_crtc_disables_it_again() {
        let dev = FakeDevice::new();
        dev.add_output(1, 2, 3, vec![test_mode(800, 600, 60)]);
        {
            let mut st = dev.state_mut();
            let crtc = st.crtcs.get_mut(&3).unwrap();
            crtc.framebuffer = None;
            crtc.mode = None;
        }
        let (mut alloc, mut bindings) = bound(&dev);
        commit(&dev, &mut bindings[0]).unwrap();
        restore(&dev, &mut bindings[0]).unwrap();
        let crtc = dev.crtc(3).unwrap();
        assert_eq!(crtc.framebuffer, None);
        assert_eq!(crtc.mode, None);
        release(&dev, &mut alloc, bindings);
    }

    #[test]
    fn failed_commit_leaves_binding_unbound() {
        let dev = FakeDevice::new();
        dev.add_output(1, 2, 3, vec![test_mode(800, 600, 60)]);
        let (mut alloc, mut bindings) = bound(&dev);
        dev.state_mut().fail_set_crtc.insert(3);

        let err = commit(&dev, &mut bindings[0]).unwrap_err();
        assert!(matches!(err, KmsError::ModesetCommitFailed { crtc: 3, .. }));
        assert_eq!(err.errno(), Some(rustix::io::Errno::INVAL.raw_os_error()));
        assert_eq!(bindings[0].state, BindingState::Unbound);
        assert!(bindings[0].saved.is_none());

        // Nothing was saved, so there is nothing to restore.
        restore(&dev, &mut bindings[0]).unwrap();
        assert_eq!(bindings[0].state, BindingState::Unbound);
        release(&dev, &mut alloc, bindings);
    }

    #[test]
    fn failed_restore_still_releases_saved_state() {
        let dev = FakeDevice::new();
        dev.add_output(1, 2, 3, vec![test_mode(800, 600, 60)]);
        let (mut alloc, mut bindings) = bound(&dev);
        commit(&dev, &mut bindings[0]).unwrap();
        dev.state_mut().fail_set_crtc.insert(3);

        let err = restore(&dev, &mut bindings[0]).unwrap_err();
        assert!(matches!(err, KmsError::ModesetRestoreFailed { crtc: 3, .. }));
        assert!(bindings[0].saved.is_none());
        assert_eq!(bindings[0].state, BindingState::Restored);
        release(&dev, &mut alloc, bindings);
    }
}
