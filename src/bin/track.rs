//! Tracking process: tracks the tail in every queued frame and hosts the
//! angle stream for the downstream stimulus process.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::info;

use minizf::channel::AngleHost;
use minizf::config::Config;
use minizf::shm::ShmLayout;
use minizf::tracker::{TrackingWorker, WorkerOptions};

const DEFAULT_CONFIG: &str = "minizf.toml";

fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG.to_string());
    let config = Config::load_or_default(&config_path)?;
    let _guard = minizf::logging::init("minizf-track", &config.log)?;
    info!("Tracking ({})", env!("GIT_VERSION"));

    let interrupt = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&interrupt))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&interrupt))?;

    let layout = ShmLayout::from_config(&config);
    let host = AngleHost::bind(&config.channel.addr())?;
    let options = WorkerOptions {
        accept_timeout: Duration::from_millis(config.channel.accept_timeout_ms),
        poll_interval: Duration::from_micros(config.shm.poll_interval_us),
        verbose: config.log.verbose,
    };
    let worker = TrackingWorker::attach(&layout, host, config.tracking.clone(), options)?;
    let stats = worker.run(&interrupt)?;
    info!(?stats, "tracking process exiting");
    Ok(())
}
