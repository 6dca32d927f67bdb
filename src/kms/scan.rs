use super::alloc::{create_framebuffer, Buffer, BufferAllocator, ScopedBuffer};
use super::modeset::{BindingState, SavedCrtc};
use super::resources::{ConnectorInfo, KmsDevice, ModeInfo};
use crate::error::KmsError;

/// A connected output with its own CRTC, mode, buffer and framebuffer.
#[derive(Debug)]
pub struct OutputBinding {
    pub connector: u32,
    pub connector_name: String,
    pub crtc: u32,
    pub mode: ModeInfo,
    pub framebuffer: u32,
    pub buffer: Buffer,
    pub saved: Option<SavedCrtc>,
    pub state: BindingState,
}

/// Outcome of a full pass over the device's connectors.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanReport {
    pub connectors: usize,
    pub bound: usize,
    pub skipped: usize,
}

/// The driver lists its preferred mode first.
pub fn select_mode(modes: &[ModeInfo]) -> Option<&ModeInfo> {
    modes.first()
}

/// CRTC currently driven through the connector's active encoder.
fn current_crtc<D: KmsDevice + ?Sized>(
    device: &D,
    conn: &ConnectorInfo,
) -> Result<Option<u32>, KmsError> {
    let Some(enc_id) = conn.current_encoder else {
        return Ok(None);
    };
    let enc = device
        .encoder(enc_id)
        .map_err(|e| KmsError::query(format!("encoder {enc_id}"), e))?;
    Ok(enc.crtc)
}

fn bind_connector<D, A>(
    device: &D,
    allocator: &mut A,
    claimed: &[OutputBinding],
    id: u32,
) -> Result<Option<OutputBinding>, KmsError>
where
    D: KmsDevice + ?Sized,
    A: BufferAllocator + ?Sized,
{
    let conn = device
        .connector(id)
        .map_err(|e| KmsError::query(format!("connector {id}"), e))?;
    if !conn.connected {
        tracing::debug!("{}: not connected", conn.name);
        return Ok(None);
    }

    let Some(crtc) = current_crtc(device, &conn)? else {
        tracing::info!("{}: no active encoder/CRTC, leaving undriven", conn.name);
        return Ok(None);
    };
    if claimed.iter().any(|b| b.crtc == crtc) {
        tracing::info!("{}: CRTC {crtc} already in use, leaving undriven", conn.name);
        return Ok(None);
    }

    let Some(&mode) = select_mode(&conn.modes) else {
        tracing::warn!("{}: no modes reported", conn.name);
        return Ok(None);
    };
    let (width, height) = mode.size();
    tracing::info!("{}: mode {} ({mode}) on CRTC {crtc}", conn.name, mode.name());

    let mut buffer = ScopedBuffer::create(allocator, width, height)?;
    let export = buffer.export()?;
    let framebuffer = create_framebuffer(device, buffer.buffer(), export)?;

    Ok(Some(OutputBinding {
        connector: conn.id,
        connector_name: conn.name,
        crtc,
        mode,
        framebuffer,
        buffer: buffer.keep(),
        saved: None,
        state: BindingState::Unbound,
    }))
}

/// Pair every usable connector with a CRTC and a scanout framebuffer,
/// appending the results to `bindings`.
///
/// A connector that cannot be bound is skipped and whatever was acquired for
/// it is released; only failing to enumerate the device is an error.
pub fn scan_connectors<D, A>(
    device: &D,
    allocator: &mut A,
    bindings: &mut Vec<OutputBinding>,
) -> Result<ScanReport, KmsError>
where
    D: KmsDevice + ?Sized,
    A: BufferAllocator + ?Sized,
{
    let res = device
        .resources()
        .map_err(|e| KmsError::query("DRM resources", e))?;

    let mut report = ScanReport::default();
    for &id in &res.connectors {
        report.connectors += 1;
        match bind_connector(device, allocator, bindings, id) {
            Ok(Some(binding)) => {
                report.bound += 1;
                bindings.push(binding);
            }
            Ok(None) => report.skipped += 1,
            Err(e) => {
                report.skipped += 1;
                tracing::warn!("connector {id} skipped: {:#}", anyhow::Error::new(e));
            }
        }
    }

    tracing::info!(
        "scanned {} connector(s): {} bound, {} skipped",
        report.connectors,
        report.bound,
        report.skipped
    );
    Ok(report)
}
