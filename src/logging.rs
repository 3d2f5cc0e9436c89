use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LogConfig;

/// `logs/<process>_<YYYYmmdd_HHMMSS>.log`
pub fn log_file_path(dir: &Path, process: &str) -> PathBuf {
    let ts = chrono::Local::now().format("%Y%m%d_%H%M%S");
    dir.join(format!("{}_{}.log", process, ts))
}

/// プロセスごとのログ初期化。stderr とログファイルの両方に出す。
/// 返り値の guard は main の終わりまで保持すること (drop でファイルに flush)
pub fn init(process: &str, config: &LogConfig) -> Result<WorkerGuard> {
    std::fs::create_dir_all(&config.dir)
        .with_context(|| format!("failed to create log directory {}", config.dir.display()))?;
    let path = log_file_path(&config.dir, process);
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open log file {}", path.display()))?;
    let (writer, guard) = tracing_appender::non_blocking(file);

    let level = if config.verbose { "debug" } else { config.level.as_str() };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(
            fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_thread_names(true),
        )
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize logging: {}", e))?;

    tracing::info!(
        process,
        version = env!("GIT_VERSION"),
        log_file = %path.display(),
        "logging initialized"
    );
    Ok(guard)
}
