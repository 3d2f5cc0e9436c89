//! Supervisor: owns the shared regions, runs the acquisition and tracking
//! processes and relays console commands to them.
//!
//! Console (one command per line):
//!   c               request a connection from the stimulus side
//!   set <key> <v>   replace the tracking parameter snapshot
//!   p               print the current tracking parameters
//!   q               quit
//!
//! SIGUSR1 also requests a connection.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use minizf::config::{Config, TrackerParams};
use minizf::shm::{RegionSet, ShmLayout};

const DEFAULT_CONFIG: &str = "minizf.toml";
const ACQUIRE_EXE: &str = "minizf-acquire";
const TRACK_EXE: &str = "minizf-track";

#[derive(Debug)]
enum ConsoleCommand {
    Connect,
    Set(String, String),
    Print,
    Quit,
}

fn parse_command(line: &str) -> Option<std::result::Result<ConsoleCommand, String>> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let cmd = match parts.as_slice() {
        [] => return None,
        ["c"] => ConsoleCommand::Connect,
        ["p"] => ConsoleCommand::Print,
        ["q"] => ConsoleCommand::Quit,
        ["set", key, value] => ConsoleCommand::Set(key.to_string(), value.to_string()),
        ["set", ..] => return Some(Err("usage: set <key> <value>".to_string())),
        [other, ..] => return Some(Err(format!("unknown command: {}", other))),
    };
    Some(Ok(cmd))
}

/// stdin を読むスレッド。EOF で終了する (バックグラウンド起動時など)
fn spawn_console(tx: mpsc::UnboundedSender<ConsoleCommand>) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut line = String::new();
        loop {
            line.clear();
            match stdin.read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            match parse_command(&line) {
                Some(Ok(cmd)) => {
                    if tx.send(cmd).is_err() {
                        break;
                    }
                }
                Some(Err(msg)) => eprintln!("[input] {}", msg),
                None => {}
            }
        }
    });
}

/// Path of a sibling executable built from this package.
fn worker_exe(name: &str) -> Result<PathBuf> {
    let current = std::env::current_exe().context("cannot locate supervisor executable")?;
    Ok(current.with_file_name(format!("{}{}", name, std::env::consts::EXE_SUFFIX)))
}

fn spawn_worker(name: &str, config_path: &str) -> Result<Child> {
    let exe = worker_exe(name)?;
    let child = Command::new(&exe)
        .arg(config_path)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to start {}", exe.display()))?;
    info!(worker = name, pid = ?child.id(), "worker started");
    Ok(child)
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Waits up to `grace` for the worker, then kills it.
async fn stop_worker(name: &str, child: &mut Child, grace: Duration) {
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => info!(worker = name, %status, "worker exited"),
        Ok(Err(e)) => warn!(worker = name, error = %e, "failed to wait for worker"),
        Err(_) => {
            warn!(worker = name, "worker did not stop in time, killing");
            if let Err(e) = child.kill().await {
                error!(worker = name, error = %e, "failed to kill worker");
            }
        }
    }
}

fn apply_set(
    regions: &mut RegionSet,
    params: &mut TrackerParams,
    trace_capacity: usize,
    key: &str,
    value: &str,
) -> Result<()> {
    let mut next = params.clone();
    next.set(key, value)?;
    next.validate(trace_capacity)?;
    regions.params.publish(&next)?;
    *params = next;
    Ok(())
}

#[derive(Default)]
struct Counters {
    acquired: u64,
    tracked: u64,
    dropped: u64,
}

fn log_status(regions: &RegionSet, last: &mut Counters, since: Instant) {
    let secs = since.elapsed().as_secs_f64().max(1e-3);
    let now = Counters {
        acquired: regions.control.frames_acquired(),
        tracked: regions.control.frames_tracked(),
        dropped: regions.queue.dropped(),
    };
    info!(
        acquire_fps = %format!("{:.1}", (now.acquired - last.acquired) as f64 / secs),
        track_fps = %format!("{:.1}", (now.tracked - last.tracked) as f64 / secs),
        dropped = now.dropped - last.dropped,
        queued = regions.queue.len(),
        connected = regions.control.is_connected(),
        "status"
    );
    *last = now;
}

enum Exit {
    Requested,
    WorkerDied(&'static str, std::io::Result<ExitStatus>),
}

async fn supervise(
    config: &Config,
    layout: &ShmLayout,
    regions: &mut RegionSet,
    acquire: &mut Child,
    track: &mut Child,
) -> Exit {
    let (tx, mut console) = mpsc::unbounded_channel();
    spawn_console(tx);

    let usr1 = Arc::new(AtomicBool::new(false));
    #[cfg(unix)]
    if let Err(e) = signal_hook::flag::register(signal_hook::consts::SIGUSR1, Arc::clone(&usr1)) {
        warn!(error = %e, "SIGUSR1 handler unavailable");
    }

    let mut params = config.tracking.clone();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut status_tick = tokio::time::interval(Duration::from_secs(1));
    let mut flag_tick = tokio::time::interval(Duration::from_millis(100));
    let mut last = Counters::default();
    let mut last_at = Instant::now();

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("signal received, shutting down");
                return Exit::Requested;
            }
            status = acquire.wait() => return Exit::WorkerDied(ACQUIRE_EXE, status),
            status = track.wait() => return Exit::WorkerDied(TRACK_EXE, status),
            Some(cmd) = console.recv() => match cmd {
                ConsoleCommand::Connect => {
                    info!("connection requested");
                    regions.control.request_connection();
                }
                ConsoleCommand::Set(key, value) => {
                    match apply_set(regions, &mut params, layout.trace_length, &key, &value) {
                        Ok(()) => info!(%key, %value, "tracking parameters published"),
                        Err(e) => warn!(error = %format!("{:#}", e), "parameters not changed"),
                    }
                }
                ConsoleCommand::Print => println!("{:#?}", params),
                ConsoleCommand::Quit => {
                    info!("quit requested");
                    return Exit::Requested;
                }
            },
            _ = flag_tick.tick() => {
                if usr1.swap(false, Ordering::Relaxed) {
                    info!("SIGUSR1: connection requested");
                    regions.control.request_connection();
                }
                if regions.control.take_connection_lost() {
                    warn!("connection to the stimulus side lost (enter `c` to retry)");
                }
            }
            _ = status_tick.tick() => {
                log_status(regions, &mut last, last_at);
                last_at = Instant::now();
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG.to_string());
    let config = Config::load_or_default(&config_path)?;
    let _guard = minizf::logging::init("minizftt", &config.log)?;
    info!("minizf supervisor ({})", env!("GIT_VERSION"));
    info!(config = %config_path, source = ?config.camera, "configuration loaded");

    let layout = ShmLayout::from_config(&config);
    let mut regions = RegionSet::create_all(&layout)?;
    regions.params.publish(&config.tracking)?;
    info!(dir = %layout.dir.display(), prefix = %layout.prefix, "shared regions created");

    let result = run_workers(&config, &config_path, &layout, &mut regions).await;

    drop(regions);
    match layout.unlink_all() {
        Ok(removed) => info!(removed, "shared regions unlinked"),
        Err(e) => error!(error = %format!("{:#}", e), "failed to unlink shared regions"),
    }
    result
}

async fn run_workers(
    config: &Config,
    config_path: &str,
    layout: &ShmLayout,
    regions: &mut RegionSet,
) -> Result<()> {
    // トラッカーを先に起動し、キューが溜まる前に消費を始める
    let mut track = spawn_worker(TRACK_EXE, config_path)?;
    let mut acquire = match spawn_worker(ACQUIRE_EXE, config_path) {
        Ok(child) => child,
        Err(e) => {
            regions.control.request_shutdown();
            stop_worker(TRACK_EXE, &mut track, grace(config)).await;
            return Err(e);
        }
    };

    let exit = supervise(config, layout, regions, &mut acquire, &mut track).await;
    regions.control.request_shutdown();

    let failure = match exit {
        Exit::Requested => None,
        Exit::WorkerDied(name, status) => {
            let status = status.map(|s| s.to_string()).unwrap_or_else(|e| e.to_string());
            error!(worker = name, %status, "worker exited unexpectedly");
            Some(anyhow::anyhow!("{} exited unexpectedly ({})", name, status))
        }
    };

    stop_worker(ACQUIRE_EXE, &mut acquire, grace(config)).await;
    stop_worker(TRACK_EXE, &mut track, grace(config)).await;
    info!(
        acquired = regions.control.frames_acquired(),
        tracked = regions.control.frames_tracked(),
        dropped = regions.queue.dropped(),
        "supervisor stopped"
    );

    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn grace(config: &Config) -> Duration {
    Duration::from_millis(config.shm.shutdown_grace_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command() {
        assert!(matches!(parse_command("c\n"), Some(Ok(ConsoleCommand::Connect))));
        assert!(matches!(parse_command("  q "), Some(Ok(ConsoleCommand::Quit))));
        assert!(parse_command("\n").is_none());
        match parse_command("set n_segments 5") {
            Some(Ok(ConsoleCommand::Set(k, v))) => assert_eq!((k.as_str(), v.as_str()), ("n_segments", "5")),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(parse_command("set n_segments"), Some(Err(_))));
        assert!(matches!(parse_command("x"), Some(Err(_))));
    }
}
