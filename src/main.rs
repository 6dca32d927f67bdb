mod config;
mod error;
mod kms;
mod present;

use std::os::fd::AsRawFd;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use config::{Backend, Config};
use kms::alloc::dumb::DumbAllocator;
use kms::alloc::gbm::GbmAllocator;
use kms::alloc::shm::ShmAllocator;
use kms::alloc::{Buffer, BufferAllocator};
use kms::device::Device;
use kms::modeset::BindingState;
use kms::session::Session;
use kms::{probe, seat};

/// Open the requested node, or the seat's primary GPU, and check that it can
/// scan out dumb buffers.
fn open_device(config: &Config) -> Result<Device> {
    let mut device = match &config.device {
        Some(path) => seat::open_kms_device(path)
            .with_context(|| format!("{} is not usable for modesetting", path.display()))?,
        None => seat::select_device(&config.seat)
            .with_context(|| format!("No display device on {}", config.seat))?,
    };
    let capabilities = probe::probe(&device)
        .with_context(|| format!("{} cannot be used", device.path().display()))?;
    device.set_capabilities(capabilities);
    tracing::info!(
        "{} (card{}, devnum {:?}): {:?}",
        device.path().display(),
        device.sysnum().map_or_else(|| "?".to_owned(), |n| n.to_string()),
        device.devnum(),
        device.capabilities()
    );
    Ok(device)
}

/// Shared-memory buffer with nothing on screen, for machines without KMS.
async fn run_headless(config: &Config, duration: Duration) -> Result<()> {
    let (width, height) = config.size;
    let mut allocator = ShmAllocator::new();
    let mut buffer = allocator
        .create(width, height)
        .context("Failed to allocate shared memory buffer")?;
    let export = allocator
        .export(&mut buffer)
        .context("Failed to export shared memory buffer")?;
    drop(export);
    tracing::info!(
        "headless {width}x{height} buffer, stride {}, {} bytes, shared as fd {:?}",
        buffer.stride(),
        buffer.size(),
        buffer.exported_fd().map(|fd| fd.as_raw_fd())
    );

    present::run(&mut [&mut buffer], config.fps, duration).await;

    allocator.destroy(buffer);
    allocator.close();
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = Config::parse();
    let duration = Duration::from_secs(config.duration);

    if config.backend == Backend::Shm {
        return run_headless(&config, duration).await;
    }

    let device = open_device(&config)?;
    let allocator: Box<dyn BufferAllocator + '_> = match config.backend {
        Backend::Gbm => Box::new(GbmAllocator::new(&device).context("Failed to set up GBM")?),
        Backend::Dumb | Backend::Shm => Box::new(DumbAllocator::new(&device)),
    };

    // Dropping the session on any early return puts the CRTCs back.
    let mut session = Session::new(&device, allocator);
    let report = session.scan().context("Failed to enumerate outputs")?;
    let lit = session.commit_all();
    tracing::info!(
        "{lit} of {} connector(s) lit ({} bound) using {} buffers",
        report.connectors,
        session.bindings().len(),
        session.allocator_name()
    );

    if lit == 0 {
        tracing::warn!("Nothing to show: no connected output could be driven");
    } else {
        let mut buffers: Vec<&mut Buffer> = session
            .bindings_mut()
            .iter_mut()
            .filter(|b| b.state == BindingState::Committed)
            .map(|b| &mut b.buffer)
            .collect();
        present::run(&mut buffers, config.fps, duration).await;
    }

    session.teardown();
    Ok(())
}
