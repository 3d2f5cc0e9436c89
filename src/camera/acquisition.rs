use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

use super::source::FrameSource;
use crate::shm::{ControlBlock, FrameSlot, TimestampQueue};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AcquisitionStats {
    pub frames: u64,
    pub failed_fetches: u64,
    pub encode_errors: u64,
    pub dropped_timestamps: u64,
}

/// Acquisition loop. Runs until the shared shutdown flag or the local
/// `interrupt` is set.
///
/// Each fetched frame is written into the raw-frame slot before its
/// timestamp is queued, so a tracker that pops a timestamp always finds
/// that frame or a newer one. Failed fetches are skipped without backoff.
pub fn run_acquisition(
    source: &mut dyn FrameSource,
    raw: &mut FrameSlot,
    queue: &TimestampQueue,
    control: &ControlBlock,
    interrupt: &AtomicBool,
) -> Result<AcquisitionStats> {
    source.initialize()?;
    info!(source = source.name(), "acquisition started");

    let mut stats = AcquisitionStats::default();
    while !control.shutdown_requested() && !interrupt.load(Ordering::Relaxed) {
        let timed = match source.fetch_image() {
            Ok(Some(timed)) => timed,
            Ok(None) => {
                stats.failed_fetches += 1;
                continue;
            }
            Err(e) => {
                debug!(error = %e, "fetch failed");
                stats.failed_fetches += 1;
                continue;
            }
        };

        if let Err(e) = raw.write(timed.frame.view()) {
            if stats.encode_errors == 0 {
                warn!(error = %e, "frame does not fit the raw frame region, skipping");
            }
            stats.encode_errors += 1;
            continue;
        }
        if !queue.try_push(timed.timestamp) {
            stats.dropped_timestamps += 1;
        }
        stats.frames += 1;
        control.add_frames_acquired(1);
    }

    if let Err(e) = source.close() {
        warn!(error = %e, "failed to close frame source");
    }
    info!(
        frames = stats.frames,
        failed = stats.failed_fetches,
        dropped = stats.dropped_timestamps,
        "acquisition stopped"
    );
    Ok(stats)
}
