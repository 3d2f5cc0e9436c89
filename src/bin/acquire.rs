//! Acquisition process: pulls frames from the configured source into the
//! raw frame region and queues their capture timestamps.
//!
//! Started by `minizftt`, which must have created the shared regions first.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::info;

use minizf::camera::run_acquisition;
use minizf::config::Config;
use minizf::frame::max_pixels;
use minizf::shm::{ControlBlock, FrameSlot, Region, ShmLayout, TimestampQueue};

const DEFAULT_CONFIG: &str = "minizf.toml";

fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG.to_string());
    let config = Config::load_or_default(&config_path)?;
    let _guard = minizf::logging::init("minizf-acquire", &config.log)?;
    info!("Acquisition ({})", env!("GIT_VERSION"));

    let interrupt = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&interrupt))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&interrupt))?;

    // 設定サイズがリージョンに収まらないなら最初に落とす
    if let Some((width, height)) = config.camera.fixed_dims() {
        let capacity = max_pixels(config.shm.frame_capacity);
        if width * height > capacity {
            bail!(
                "camera frames of {}x{} do not fit shm.frame_capacity ({} pixels)",
                width,
                height,
                capacity
            );
        }
    }

    let layout = ShmLayout::from_config(&config);
    let mut raw = FrameSlot::attach(&layout, Region::RawFrame)?;
    let queue = TimestampQueue::attach(&layout)?;
    let control = ControlBlock::attach(&layout)?;

    let mut source = config.camera.build().context("failed to build frame source")?;
    let stats = run_acquisition(source.as_mut(), &mut raw, &queue, &control, &interrupt)?;
    info!(?stats, "acquisition process exiting");
    Ok(())
}
