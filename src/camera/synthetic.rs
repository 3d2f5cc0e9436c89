//! 合成カメラ: 明るい背景に暗い尾を描き、周期的に bout を起こす。
//! `color_invert = true` の前処理と組み合わせると尾が明るくなり、
//! そのまま追跡できる。

use anyhow::{bail, Result};
use ndarray::Array2;
use std::f64::consts::PI;

use super::source::{FrameSource, Pacer, SceneSpec, TimedFrame};
use crate::clock;
use crate::frame::Frame;

const BACKGROUND: u8 = 200;
const TAIL: u8 = 30;
const STEP: f64 = 0.5;

/// Static geometry of the rendered tail.
#[derive(Debug, Clone)]
pub struct TailScene {
    width: usize,
    height: usize,
    shape: SceneSpec,
}

impl TailScene {
    pub fn new(width: usize, height: usize, shape: SceneSpec) -> Self {
        Self { width, height, shape }
    }

    /// Centerline from base toward tip, with the heading turning
    /// quadratically so the tip ends up `bend` radians off the rest pose.
    pub fn centerline(&self, bend: f64) -> Vec<(f64, f64)> {
        let (bx, by) = self.shape.base;
        let (tx, ty) = self.shape.tip;
        let length = ((tx - bx).powi(2) + (ty - by).powi(2)).sqrt();
        if length == 0.0 {
            return vec![(bx, by)];
        }
        let heading = (ty - by).atan2(tx - bx);
        let steps = (length / STEP).ceil() as usize;
        let ds = length / steps as f64;

        let mut points = Vec::with_capacity(steps + 1);
        let (mut x, mut y) = (bx, by);
        points.push((x, y));
        for i in 0..steps {
            let s = (i as f64 + 0.5) * ds;
            let theta = heading + bend * (s / length).powi(2);
            x += ds * theta.cos();
            y += ds * theta.sin();
            points.push((x, y));
        }
        points
    }

    pub fn render(&self, bend: f64) -> Frame {
        let mut frame = Array2::from_elem((self.height, self.width), BACKGROUND);
        let r = self.shape.tail_width / 2.0;
        let r2 = r * r;
        for (px, py) in self.centerline(bend) {
            let x0 = (px - r).floor().max(0.0) as usize;
            let y0 = (py - r).floor().max(0.0) as usize;
            let x1 = ((px + r).ceil() as isize).min(self.width as isize - 1);
            let y1 = ((py + r).ceil() as isize).min(self.height as isize - 1);
            if x1 < 0 || y1 < 0 {
                continue;
            }
            for y in y0..=y1 as usize {
                for x in x0..=x1 as usize {
                    let d2 = (x as f64 - px).powi(2) + (y as f64 - py).powi(2);
                    if d2 <= r2 {
                        frame[[y, x]] = TAIL;
                    }
                }
            }
        }
        frame
    }
}

/// Tip bend at `t` seconds after start: an offset oscillation during the
/// first `bout_duration` of every `bout_period`, straight otherwise.
pub fn bend_at(shape: &SceneSpec, t: f64) -> f64 {
    if shape.bout_period <= 0.0 {
        return 0.0;
    }
    let phase = t.rem_euclid(shape.bout_period);
    if phase >= shape.bout_duration {
        return 0.0;
    }
    shape.turn_offset + shape.amplitude * (2.0 * PI * shape.beat_frequency * phase).sin()
}

pub struct SyntheticTailSource {
    scene: TailScene,
    pacer: Pacer,
    started: Option<f64>,
}

impl SyntheticTailSource {
    pub fn new(width: usize, height: usize, fps: f64, shape: SceneSpec) -> Self {
        Self {
            scene: TailScene::new(width, height, shape),
            pacer: Pacer::new(fps),
            started: None,
        }
    }
}

impl FrameSource for SyntheticTailSource {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn initialize(&mut self) -> Result<()> {
        self.started = Some(clock::monotonic_secs());
        Ok(())
    }

    fn fetch_image(&mut self) -> Result<Option<TimedFrame>> {
        let Some(started) = self.started else {
            bail!("synthetic source used before initialize()");
        };
        self.pacer.wait();
        let timestamp = clock::monotonic_secs();
        let bend = bend_at(&self.scene.shape, timestamp - started);
        Ok(Some(TimedFrame {
            frame: self.scene.render(bend),
            timestamp,
        }))
    }

    fn close(&mut self) -> Result<()> {
        self.started = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_straight_tail_covers_diagonal() {
        let scene = TailScene::new(128, 128, SceneSpec::default());
        let frame = scene.render(0.0);
        assert_eq!(frame.dim(), (128, 128));
        assert_eq!(frame[[10, 10]], TAIL);
        assert_eq!(frame[[55, 55]], TAIL);
        assert_eq!(frame[[100, 100]], TAIL);
        assert_eq!(frame[[10, 100]], BACKGROUND);
        assert_eq!(frame[[120, 5]], BACKGROUND);
    }

    #[test]
    fn test_centerline_keeps_length() {
        let scene = TailScene::new(128, 128, SceneSpec::default());
        let expected = (2.0f64 * 90.0 * 90.0).sqrt();
        for bend in [0.0, 0.5, -0.8] {
            let points = scene.centerline(bend);
            let length: f64 = points
                .windows(2)
                .map(|w| ((w[1].0 - w[0].0).powi(2) + (w[1].1 - w[0].1).powi(2)).sqrt())
                .sum();
            assert!((length - expected).abs() < 1e-6, "bend={} length={}", bend, length);
        }
    }

    #[test]
    fn test_bend_moves_tip() {
        let scene = TailScene::new(128, 128, SceneSpec::default());
        let straight = *scene.centerline(0.0).last().unwrap();
        let bent = *scene.centerline(0.5).last().unwrap();
        assert!((straight.0 - 100.0).abs() < 1e-6 && (straight.1 - 100.0).abs() < 1e-6);
        assert!((bent.0 - straight.0).abs() > 5.0);
    }

    #[test]
    fn test_bout_schedule() {
        let shape = SceneSpec::default();
        assert_eq!(bend_at(&shape, 0.5), 0.0);
        assert_eq!(bend_at(&shape, 1.9), 0.0);
        // bout 中は turn_offset を中心に振動
        assert!((bend_at(&shape, 2.0) - shape.turn_offset).abs() < 1e-9);
        let quarter = 2.0 + 0.25 / shape.beat_frequency;
        assert!((bend_at(&shape, quarter) - (shape.turn_offset + shape.amplitude)).abs() < 1e-9);
    }

    #[test]
    fn test_source_lifecycle() {
        let mut source = SyntheticTailSource::new(64, 64, 0.0, SceneSpec::default());
        assert!(source.fetch_image().is_err());
        source.initialize().unwrap();
        let frame = source.fetch_image().unwrap().unwrap();
        assert_eq!(frame.frame.dim(), (64, 64));
        assert!(frame.timestamp > 0.0);
        source.close().unwrap();
    }
}
