use anyhow::{bail, Result};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use super::synthetic::SyntheticTailSource;
use crate::clock;
use crate::frame::Frame;

/// A frame together with the monotonic time it was captured.
#[derive(Debug, Clone)]
pub struct TimedFrame {
    pub frame: Frame,
    pub timestamp: f64,
}

/// Frame source contract.
///
/// Sources are built from a [`SourceSpec`] inside the process that uses
/// them; device handles and other resources are acquired in `initialize`,
/// never in the constructor.
pub trait FrameSource: Send {
    fn name(&self) -> &str;

    fn initialize(&mut self) -> Result<()>;

    /// `Ok(None)` is a failed fetch; the caller skips it.
    fn fetch_image(&mut self) -> Result<Option<TimedFrame>>;

    fn close(&mut self) -> Result<()>;
}

/// Construction parameters for a frame source. This is what crosses the
/// process boundary (as part of the TOML config); `build` runs in the
/// acquisition process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum SourceSpec {
    /// Random 8-bit frames.
    Noise {
        #[serde(default = "default_width")]
        width: usize,
        #[serde(default = "default_height")]
        height: usize,
        #[serde(default = "default_fps")]
        fps: f64,
    },
    /// Rendered tail that swims in periodic bouts.
    Synthetic {
        #[serde(default = "default_width")]
        width: usize,
        #[serde(default = "default_height")]
        height: usize,
        #[serde(default = "default_fps")]
        fps: f64,
        #[serde(default)]
        scene: SceneSpec,
    },
    /// OpenCV `VideoCapture` device, converted to grayscale.
    #[cfg(feature = "camera")]
    Opencv {
        #[serde(default)]
        index: i32,
        #[serde(default)]
        width: Option<u32>,
        #[serde(default)]
        height: Option<u32>,
        #[serde(default)]
        fps: Option<u32>,
    },
}

fn default_width() -> usize { 128 }
fn default_height() -> usize { 128 }
fn default_fps() -> f64 { 200.0 }

impl Default for SourceSpec {
    fn default() -> Self {
        SourceSpec::Synthetic {
            width: default_width(),
            height: default_height(),
            fps: default_fps(),
            scene: SceneSpec::default(),
        }
    }
}

/// 合成尾画像のジオメトリと泳ぎのスケジュール
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneSpec {
    #[serde(default = "default_scene_base")]
    pub base: (f64, f64),
    #[serde(default = "default_scene_tip")]
    pub tip: (f64, f64),
    #[serde(default = "default_tail_width")]
    pub tail_width: f64,
    /// bout の開始間隔 [s]
    #[serde(default = "default_bout_period")]
    pub bout_period: f64,
    #[serde(default = "default_bout_duration")]
    pub bout_duration: f64,
    /// 尾の振動数 [Hz]
    #[serde(default = "default_beat_frequency")]
    pub beat_frequency: f64,
    /// 先端での曲がり角の振幅 [rad]
    #[serde(default = "default_amplitude")]
    pub amplitude: f64,
    /// bout 中の片寄り (bias の元) [rad]
    #[serde(default = "default_turn_offset")]
    pub turn_offset: f64,
}

fn default_scene_base() -> (f64, f64) { (10.0, 10.0) }
fn default_scene_tip() -> (f64, f64) { (100.0, 100.0) }
fn default_tail_width() -> f64 { 5.0 }
fn default_bout_period() -> f64 { 2.0 }
fn default_bout_duration() -> f64 { 0.3 }
fn default_beat_frequency() -> f64 { 20.0 }
fn default_amplitude() -> f64 { 0.6 }
fn default_turn_offset() -> f64 { 0.2 }

impl Default for SceneSpec {
    fn default() -> Self {
        Self {
            base: default_scene_base(),
            tip: default_scene_tip(),
            tail_width: default_tail_width(),
            bout_period: default_bout_period(),
            bout_duration: default_bout_duration(),
            beat_frequency: default_beat_frequency(),
            amplitude: default_amplitude(),
            turn_offset: default_turn_offset(),
        }
    }
}

impl SourceSpec {
    pub fn build(&self) -> Result<Box<dyn FrameSource>> {
        if let Some((w, h)) = self.fixed_dims() {
            if w == 0 || h == 0 {
                bail!("camera frame size must be positive, got {}x{}", w, h);
            }
        }
        Ok(match self {
            SourceSpec::Noise { width, height, fps } => {
                Box::new(NoiseSource::new(*width, *height, *fps))
            }
            SourceSpec::Synthetic { width, height, fps, scene } => {
                Box::new(SyntheticTailSource::new(*width, *height, *fps, scene.clone()))
            }
            #[cfg(feature = "camera")]
            SourceSpec::Opencv { index, width, height, fps } => Box::new(
                super::capture::OpenCvSource::new(*index, *width, *height, *fps),
            ),
        })
    }

    /// `(width, height)` for sources that render at a configured size.
    pub fn fixed_dims(&self) -> Option<(usize, usize)> {
        match self {
            SourceSpec::Noise { width, height, .. } | SourceSpec::Synthetic { width, height, .. } => {
                Some((*width, *height))
            }
            #[cfg(feature = "camera")]
            SourceSpec::Opencv { .. } => None,
        }
    }
}

/// Sleeps so that consecutive frames are spaced at `1/fps`.
/// A non-positive fps means "as fast as possible".
pub(crate) struct Pacer {
    interval: Option<Duration>,
    next: Option<Instant>,
}

impl Pacer {
    pub(crate) fn new(fps: f64) -> Self {
        let interval = (fps.is_finite() && fps > 0.0).then(|| Duration::from_secs_f64(1.0 / fps));
        Self { interval, next: None }
    }

    pub(crate) fn wait(&mut self) {
        let Some(interval) = self.interval else {
            return;
        };
        let now = Instant::now();
        let next = self.next.unwrap_or(now);
        if next > now {
            std::thread::sleep(next - now);
        }
        // 大きく遅れたら追いつこうとせず基準を取り直す
        self.next = Some(if now > next + interval { now + interval } else { next + interval });
    }
}

/// Random frames. Useful for load testing the pipeline without a camera.
pub struct NoiseSource {
    width: usize,
    height: usize,
    pacer: Pacer,
    rng: Option<StdRng>,
}

impl NoiseSource {
    pub fn new(width: usize, height: usize, fps: f64) -> Self {
        Self {
            width,
            height,
            pacer: Pacer::new(fps),
            rng: None,
        }
    }
}

impl FrameSource for NoiseSource {
    fn name(&self) -> &str {
        "noise"
    }

    fn initialize(&mut self) -> Result<()> {
        self.rng = Some(StdRng::from_entropy());
        Ok(())
    }

    fn fetch_image(&mut self) -> Result<Option<TimedFrame>> {
        let Some(rng) = self.rng.as_mut() else {
            bail!("noise source used before initialize()");
        };
        self.pacer.wait();
        let mut pixels = vec![0u8; self.width * self.height];
        rng.fill_bytes(&mut pixels);
        let frame = Frame::from_shape_vec((self.height, self.width), pixels)?;
        Ok(Some(TimedFrame {
            frame,
            timestamp: clock::monotonic_secs(),
        }))
    }

    fn close(&mut self) -> Result<()> {
        self.rng = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noise_requires_initialize() {
        let mut source = NoiseSource::new(8, 4, 0.0);
        assert!(source.fetch_image().is_err());
        source.initialize().unwrap();
        let first = source.fetch_image().unwrap().unwrap();
        assert_eq!(first.frame.dim(), (4, 8));
        let second = source.fetch_image().unwrap().unwrap();
        assert!(second.timestamp >= first.timestamp);
        source.close().unwrap();
        assert!(source.fetch_image().is_err());
    }

    #[test]
    fn test_build_named_source() {
        let source = SourceSpec::Noise { width: 16, height: 16, fps: 0.0 };
        assert_eq!(source.build().unwrap().name(), "noise");
        assert_eq!(SourceSpec::default().build().unwrap().name(), "synthetic");

        let empty = SourceSpec::Noise { width: 0, height: 16, fps: 0.0 };
        assert!(empty.build().is_err());
    }

    #[test]
    fn test_synthetic_source_from_toml() {
        let source: SourceSpec = toml::from_str(
            r#"
            source = "synthetic"
            width = 200
            [scene]
            amplitude = 0.3
            "#,
        )
        .unwrap();
        let SourceSpec::Synthetic { width, height, scene, .. } = source else {
            panic!("expected synthetic source");
        };
        assert_eq!((width, height), (200, 128));
        assert_eq!(scene.amplitude, 0.3);
        assert_eq!(scene.tip, (100.0, 100.0));
    }

    #[test]
    fn test_pacer_spaces_frames() {
        let mut pacer = Pacer::new(200.0);
        let start = Instant::now();
        for _ in 0..5 {
            pacer.wait();
        }
        // 1 回目は即時、残り 4 回で 20ms
        assert!(start.elapsed() >= Duration::from_millis(19));
    }
}
