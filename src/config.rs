use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::camera::SourceSpec;

/// セグメント位置リージョンに格納できる最大点数 (base を含む)
pub const MAX_SEGMENT_POINTS: usize = 10;

/// ボックスフィルタの最大サイズ
pub const MAX_FILTER_SIZE: usize = 255;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub shm: ShmConfig,
    #[serde(default)]
    pub camera: SourceSpec,
    #[serde(default)]
    pub tracking: TrackerParams,
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub estimator: EstimatorConfig,
    #[serde(default)]
    pub stimulus: StimulusConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShmConfig {
    /// 共有メモリファイルを置くディレクトリ
    #[serde(default = "default_shm_dir")]
    pub dir: PathBuf,
    /// リージョン名のプレフィックス (`<prefix>_raw_frame` など)
    #[serde(default = "default_shm_prefix")]
    pub prefix: String,
    /// フレームリージョンのバイト容量 (トレーラー込み)
    #[serde(default = "default_frame_capacity")]
    pub frame_capacity: usize,
    /// タイムスタンプキューの容量
    #[serde(default = "default_timestamp_queue_capacity")]
    pub timestamp_queue_capacity: usize,
    /// ワーカーがアイドル時にスリープする時間 (µs)
    #[serde(default = "default_poll_interval_us")]
    pub poll_interval_us: u64,
    /// シャットダウン要求後、子プロセスの終了を待つ時間
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

fn default_shm_dir() -> PathBuf {
    if cfg!(target_os = "linux") {
        PathBuf::from("/dev/shm")
    } else {
        std::env::temp_dir()
    }
}
fn default_shm_prefix() -> String { "minizf".to_string() }
fn default_frame_capacity() -> usize { 1_000_000 }
fn default_timestamp_queue_capacity() -> usize { 16 }
fn default_poll_interval_us() -> u64 { 200 }
fn default_shutdown_grace_ms() -> u64 { 2000 }

impl Default for ShmConfig {
    fn default() -> Self {
        Self {
            dir: default_shm_dir(),
            prefix: default_shm_prefix(),
            frame_capacity: default_frame_capacity(),
            timestamp_queue_capacity: default_timestamp_queue_capacity(),
            poll_interval_us: default_poll_interval_us(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

/// Tracking parameter snapshot.
///
/// Crosses the process boundary as a whole (see `shm::ParamMailbox`);
/// the tracking worker never patches individual fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerParams {
    /// 尾の付け根 (前処理後の座標系)
    #[serde(default = "default_base_x")]
    pub base_x: f64,
    #[serde(default = "default_base_y")]
    pub base_y: f64,
    /// 静止時の尾の先端 (前処理後の座標系)
    #[serde(default = "default_tip_x")]
    pub tip_x: f64,
    #[serde(default = "default_tip_y")]
    pub tip_y: f64,
    #[serde(default = "default_n_segments")]
    pub n_segments: usize,
    /// 重心探索の半径 (px)
    #[serde(default = "default_search_area")]
    pub search_area: f64,
    #[serde(default = "default_image_scale")]
    pub image_scale: f64,
    #[serde(default = "default_filter_size")]
    pub filter_size: usize,
    #[serde(default = "default_color_invert")]
    pub color_invert: bool,
    #[serde(default)]
    pub clip_threshold: u8,
    #[serde(default = "default_angle_trace_length")]
    pub angle_trace_length: usize,
}

fn default_base_x() -> f64 { 10.0 }
fn default_base_y() -> f64 { 10.0 }
fn default_tip_x() -> f64 { 100.0 }
fn default_tip_y() -> f64 { 100.0 }
fn default_n_segments() -> usize { 7 }
fn default_search_area() -> f64 { 15.0 }
fn default_image_scale() -> f64 { 1.0 }
fn default_filter_size() -> usize { 3 }
fn default_color_invert() -> bool { true }
fn default_angle_trace_length() -> usize { 1000 }

impl Default for TrackerParams {
    fn default() -> Self {
        Self {
            base_x: default_base_x(),
            base_y: default_base_y(),
            tip_x: default_tip_x(),
            tip_y: default_tip_y(),
            n_segments: default_n_segments(),
            search_area: default_search_area(),
            image_scale: default_image_scale(),
            filter_size: default_filter_size(),
            color_invert: default_color_invert(),
            clip_threshold: 0,
            angle_trace_length: default_angle_trace_length(),
        }
    }
}

impl TrackerParams {
    pub fn base(&self) -> (f64, f64) {
        (self.base_x, self.base_y)
    }

    pub fn tip(&self) -> (f64, f64) {
        (self.tip_x, self.tip_y)
    }

    /// Checks the snapshot against the fixed region geometry.
    /// `trace_capacity` is the slot count of the angle history region.
    pub fn validate(&self, trace_capacity: usize) -> Result<()> {
        let coords = [self.base_x, self.base_y, self.tip_x, self.tip_y];
        if coords.iter().any(|v| !v.is_finite()) {
            bail!("base/tip coordinates must be finite: {:?}", coords);
        }
        if self.base() == self.tip() {
            bail!("base and tip must differ (both at {:?})", self.base());
        }
        if self.n_segments == 0 || self.n_segments >= MAX_SEGMENT_POINTS {
            bail!(
                "n_segments must be in 1..={}, got {}",
                MAX_SEGMENT_POINTS - 1,
                self.n_segments
            );
        }
        if !(self.search_area.is_finite() && self.search_area > 0.0) {
            bail!("search_area must be positive, got {}", self.search_area);
        }
        if !(self.image_scale.is_finite() && self.image_scale > 0.0 && self.image_scale <= 4.0) {
            bail!("image_scale must be in (0, 4], got {}", self.image_scale);
        }
        if self.filter_size == 0 || self.filter_size > MAX_FILTER_SIZE {
            bail!(
                "filter_size must be in 1..={}, got {}",
                MAX_FILTER_SIZE,
                self.filter_size
            );
        }
        if self.filter_size > 1 && self.filter_size % 2 == 0 {
            bail!("filter_size must be odd, got {}", self.filter_size);
        }
        if self.angle_trace_length != trace_capacity {
            bail!(
                "angle_trace_length is fixed at {} by the angle history region, got {}",
                trace_capacity,
                self.angle_trace_length
            );
        }
        Ok(())
    }

    /// コンソールの `set <key> <value>` 用。値のパースのみ行い、検証は呼び出し側で
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let value = value.trim();
        match key {
            "base_x" => self.base_x = parse(key, value)?,
            "base_y" => self.base_y = parse(key, value)?,
            "tip_x" => self.tip_x = parse(key, value)?,
            "tip_y" => self.tip_y = parse(key, value)?,
            "n_segments" => self.n_segments = parse(key, value)?,
            "search_area" => self.search_area = parse(key, value)?,
            "image_scale" => self.image_scale = parse(key, value)?,
            "filter_size" => self.filter_size = parse(key, value)?,
            "color_invert" => self.color_invert = parse(key, value)?,
            "clip_threshold" => self.clip_threshold = parse(key, value)?,
            "angle_trace_length" => self.angle_trace_length = parse(key, value)?,
            other => bail!("unknown tracking parameter `{}`", other),
        }
        Ok(())
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse::<T>()
        .map_err(|e| anyhow::anyhow!("invalid value `{}` for {}: {}", value, key, e))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    #[serde(default = "default_channel_host")]
    pub host: String,
    #[serde(default = "default_channel_port")]
    pub port: u16,
    /// 明示的な接続要求1回あたり、ピアを待つ最大時間
    #[serde(default = "default_accept_timeout_ms")]
    pub accept_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_channel_host() -> String { "127.0.0.1".to_string() }
fn default_channel_port() -> u16 { 6000 }
fn default_accept_timeout_ms() -> u64 { 2000 }
fn default_connect_timeout_ms() -> u64 { 1000 }

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            host: default_channel_host(),
            port: default_channel_port(),
            accept_timeout_ms: default_accept_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl ChannelConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EstimatorConfig {
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// vigor (角度の標準偏差) を計算する窓 [s]
    #[serde(default = "default_vigor_window")]
    pub vigor_window: f64,
    /// bout 開始から bias を計算するまでの窓 [s]
    #[serde(default = "default_bias_window")]
    pub bias_window: f64,
    #[serde(default = "default_bias_baseline_window")]
    pub bias_baseline_window: f64,
    #[serde(default = "default_vigor_threshold")]
    pub vigor_threshold: f64,
}

fn default_buffer_size() -> usize { 300 }
fn default_vigor_window() -> f64 { 0.05 }
fn default_bias_window() -> f64 { 0.07 }
fn default_bias_baseline_window() -> f64 { 0.05 }
fn default_vigor_threshold() -> f64 { 0.05 }

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            vigor_window: default_vigor_window(),
            bias_window: default_bias_window(),
            bias_baseline_window: default_bias_baseline_window(),
            vigor_threshold: default_vigor_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StimulusConfig {
    /// 刺激フレームレート。estimator はこのレートで更新される
    #[serde(default = "default_frame_rate")]
    pub frame_rate: u32,
    /// 指定すると受信サンプルと推定値を CSV に記録する
    #[serde(default)]
    pub record_path: Option<PathBuf>,
    #[serde(default = "default_flush_every")]
    pub flush_every: usize,
}

fn default_frame_rate() -> u32 { 60 }
fn default_flush_every() -> usize { 500 }

impl Default for StimulusConfig {
    fn default() -> Self {
        Self {
            frame_rate: default_frame_rate(),
            record_path: None,
            flush_every: default_flush_every(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_dir")]
    pub dir: PathBuf,
    /// `RUST_LOG` が無いときのフィルタ
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub verbose: bool,
}

fn default_log_dir() -> PathBuf { PathBuf::from("logs") }
fn default_log_level() -> String { "info".to_string() }

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: default_log_dir(),
            level: default_log_level(),
            verbose: false,
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// ファイルが無ければデフォルト設定。壊れたファイルはエラー
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            let config = Self::default();
            config.validate()?;
            Ok(config)
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.shm.prefix.is_empty() || self.shm.prefix.contains('/') {
            bail!("shm.prefix must be a non-empty name without '/'");
        }
        if self.shm.frame_capacity <= crate::frame::TRAILER_LEN {
            bail!("shm.frame_capacity too small: {}", self.shm.frame_capacity);
        }
        if self.shm.timestamp_queue_capacity < 2 {
            bail!("shm.timestamp_queue_capacity must be at least 2");
        }
        self.tracking
            .validate(self.tracking.angle_trace_length)
            .context("invalid [tracking] section")?;
        if self.tracking.angle_trace_length == 0 {
            bail!("tracking.angle_trace_length must be positive");
        }
        let e = &self.estimator;
        if e.buffer_size == 0 {
            bail!("estimator.buffer_size must be positive");
        }
        for (name, v) in [
            ("vigor_window", e.vigor_window),
            ("bias_window", e.bias_window),
            ("bias_baseline_window", e.bias_baseline_window),
        ] {
            if !(v.is_finite() && v > 0.0) {
                bail!("estimator.{} must be positive, got {}", name, v);
            }
        }
        if self.stimulus.frame_rate == 0 {
            bail!("stimulus.frame_rate must be positive");
        }
        Ok(())
    }
}
