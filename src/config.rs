use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// Scanout buffer backend.
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// Kernel dumb buffers, mapped through the card node
    Dumb,
    /// GBM buffer objects, mapped through their dma-buf
    Gbm,
    /// POSIX shared memory, no display (headless)
    Shm,
}

#[derive(Parser, Debug)]
#[command(
    name = "kmsmode",
    about = "Light up every connected display with a dumb, GBM or shm scanout buffer"
)]
pub struct Config {
    /// DRM device path (e.g. /dev/dri/card0). Picks the seat's primary GPU if not specified.
    #[arg(short, long)]
    pub device: Option<PathBuf>,

    /// Seat whose GPUs are considered
    #[arg(short, long, env = "XDG_SEAT", default_value = "seat0")]
    pub seat: String,

    /// Buffer backend
    #[arg(short, long, value_enum, default_value_t = Backend::Dumb)]
    pub backend: Backend,

    /// Seconds to keep the outputs lit (0 = until Ctrl+C)
    #[arg(short = 't', long, default_value_t = 5)]
    pub duration: u64,

    /// Repaints per second
    #[arg(short, long, default_value_t = 30)]
    pub fps: u32,

    /// Buffer size for headless shm mode, as WIDTHxHEIGHT
    #[arg(long, value_parser = parse_size, default_value = "1920x1080")]
    pub size: (u32, u32),
}

/// Largest width or height accepted on the command line.
const MAX_DIMENSION: u32 = 16384;

fn parse_size(s: &str) -> Result<(u32, u32), String> {
    let (w, h) = s
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got {s:?}"))?;
    let w: u32 = w.trim().parse().map_err(|e| format!("bad width {w:?}: {e}"))?;
    let h: u32 = h.trim().parse().map_err(|e| format!("bad height {h:?}: {e}"))?;
    if w == 0 || h == 0 {
        return Err(format!("size must be non-zero, got {w}x{h}"));
    }
    if w > MAX_DIMENSION || h > MAX_DIMENSION {
        return Err(format!("size {w}x{h} exceeds {MAX_DIMENSION}x{MAX_DIMENSION}"));
    }
    Ok((w, h))
}
