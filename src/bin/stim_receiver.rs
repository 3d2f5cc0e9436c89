//! Stimulus-side receiver: connects to the tracking process, feeds the tail
//! angle stream into the swim estimator at the stimulus frame rate, logs
//! bouts and optionally records everything to CSV.
//!
//! Console: `c` reconnect, `q` quit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{info, warn};

use minizf::channel::{AngleReceiver, ConnectionEvent};
use minizf::config::Config;
use minizf::estimator::SwimEstimator;
use minizf::recorder::SwimRecorder;

const DEFAULT_CONFIG: &str = "minizf.toml";

fn spawn_console(reconnect: Arc<AtomicBool>, quit: Arc<AtomicBool>) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut line = String::new();
        loop {
            line.clear();
            match stdin.read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            match line.trim() {
                "c" | "C" => reconnect.store(true, Ordering::Relaxed),
                "q" | "Q" => {
                    quit.store(true, Ordering::Relaxed);
                    break;
                }
                "" => {}
                other => eprintln!("unknown command: {} (c = reconnect, q = quit)", other),
            }
        }
    });
}

fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG.to_string());
    let config = Config::load_or_default(&config_path)?;
    let _guard = minizf::logging::init("minizf-stimrx", &config.log)?;
    info!("Stimulus receiver ({})", env!("GIT_VERSION"));

    let quit = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&quit))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&quit))?;
    let reconnect = Arc::new(AtomicBool::new(false));
    spawn_console(Arc::clone(&reconnect), Arc::clone(&quit));

    let mut recorder = match &config.stimulus.record_path {
        Some(path) => {
            let recorder = SwimRecorder::create(path, config.stimulus.flush_every)?;
            info!(path = %recorder.path().display(), "recording swim estimate");
            Some(recorder)
        }
        None => None,
    };

    let mut estimator = SwimEstimator::new(config.estimator.clone());
    let mut receiver = AngleReceiver::new(
        config.channel.addr(),
        Duration::from_millis(config.channel.connect_timeout_ms),
    )?;
    let events = receiver.subscribe();
    receiver.open_connection();

    let period = Duration::from_secs_f64(1.0 / config.stimulus.frame_rate as f64);
    let mut next_tick = Instant::now() + period;
    let mut received = 0u64;

    while !quit.load(Ordering::Relaxed) {
        if reconnect.swap(false, Ordering::Relaxed) {
            if receiver.is_connected() {
                info!("already connected");
            } else {
                receiver.open_connection();
            }
        }
        for event in events.try_iter() {
            match event {
                ConnectionEvent::Connected(peer) => info!(%peer, "receiving tail angles"),
                ConnectionEvent::Lost => warn!("connection to tracker lost (enter `c` to reconnect)"),
            }
        }

        let samples = receiver.read_data();
        received += samples.len() as u64;
        for sample in &samples {
            estimator.register_new_data(sample.timestamp, sample.delta_angle);
        }

        let was_in_bout = estimator.in_bout();
        estimator.update_swim_estimate();
        if estimator.in_bout() && !was_in_bout {
            info!(onset = ?estimator.bout_onset(), vigor = estimator.vigor(), "bout onset");
        }
        if let Some(bias) = estimator.take_bias_event() {
            info!(bias, "bout bias");
        }

        if let Some(recorder) = recorder.as_mut() {
            for sample in &samples {
                recorder.record(
                    sample.timestamp,
                    sample.delta_angle,
                    estimator.vigor(),
                    estimator.bias(),
                )?;
            }
        }

        // 刺激フレームの周期に合わせる。遅れたら追いつこうとしない
        let now = Instant::now();
        if next_tick > now {
            std::thread::sleep(next_tick - now);
            next_tick += period;
        } else {
            next_tick = now + period;
        }
    }

    receiver.close();
    if let Some(recorder) = recorder.as_mut() {
        recorder.flush()?;
        info!(rows = recorder.rows(), path = %recorder.path().display(), "recording closed");
    }
    info!(received, "stimulus receiver exiting");
    Ok(())
}
