//! Keeps committed outputs busy with a slowly cycling solid colour.

use std::time::Duration;

use tokio::time::{self, Instant, MissedTickBehavior};

use crate::kms::alloc::Buffer;
use crate::kms::pixel_format;

/// Colour for frame number `frame`.
pub fn frame_colour(frame: u64) -> u32 {
    let t = (frame % 256) as u8;
    pixel_format::xrgb(t, t.wrapping_add(85), t.wrapping_add(170))
}

/// Fill every mapped buffer with `pixel`. Returns how many were painted.
pub fn paint(buffers: &mut [&mut Buffer], pixel: u32) -> usize {
    let mut painted = 0;
    for buffer in buffers.iter_mut() {
        let (width, height, stride) = (buffer.width(), buffer.height(), buffer.stride());
        if let Some(pixels) = buffer.pixels_mut() {
            pixel_format::fill_rows(pixels, width, height, stride, pixel);
            painted += 1;
        }
    }
    painted
}

/// Repaint at `fps` until `duration` passes (zero means no limit) or Ctrl+C.
/// Returns the number of frames drawn.
pub async fn run(buffers: &mut [&mut Buffer], fps: u32, duration: Duration) -> u64 {
    let period = Duration::from_secs(1) / fps.max(1);
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let deadline = (!duration.is_zero()).then(|| Instant::now() + duration);
    let expired = async {
        match deadline {
            Some(at) => time::sleep_until(at).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(expired);
    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);

    tracing::info!(
        "presenting to {} buffer(s) at {fps} fps for {}",
        buffers.len(),
        if deadline.is_some() {
            format!("{duration:?}")
        } else {
            "ever".to_owned()
        }
    );

    let mut frames = 0u64;
    loop {
        tokio::select! {
            biased;
            result = &mut interrupted => {
                if let Err(e) = result {
                    tracing::warn!("Ctrl+C handler failed: {e}");
                }
                tracing::info!("interrupted, shutting down...");
                break;
            }
            _ = &mut expired => {
                tracing::debug!("presentation time elapsed");
                break;
            }
            _ = ticker.tick() => {
                paint(buffers, frame_colour(frames));
                frames += 1;
            }
        }
    }
    tracing::info!("presented {frames} frame(s)");
    frames
}
