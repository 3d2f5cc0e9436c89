//! Fictive swim estimate from the tail angle stream.
//!
//! * vigor: standard deviation of the angle over the last `vigor_window`
//! * bout: an interval with vigor above `vigor_threshold`
//! * bias: mean angle over the first `bias_window` of a bout, minus the
//!   mean over the `bias_baseline_window` right before it

use crate::config::EstimatorConfig;

pub struct SwimEstimator {
    config: EstimatorConfig,
    timestamps: Vec<f64>,
    angles: Vec<f64>,
    /// 最新サンプルのスロット
    index: Option<usize>,
    vigor: f64,
    bias: f64,
    in_bout: bool,
    bout_onset_t: f64,
    bias_pending: bool,
    bias_event: Option<f64>,
}

impl SwimEstimator {
    pub fn new(config: EstimatorConfig) -> Self {
        let size = config.buffer_size.max(1);
        Self {
            config,
            timestamps: vec![0.0; size],
            angles: vec![0.0; size],
            index: None,
            vigor: 0.0,
            bias: 0.0,
            in_bout: false,
            bout_onset_t: 0.0,
            bias_pending: false,
            bias_event: None,
        }
    }

    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    /// Overwrites the next slot of the ring.
    pub fn register_new_data(&mut self, timestamp: f64, angle: f64) {
        let next = self.index.map_or(0, |i| (i + 1) % self.timestamps.len());
        self.timestamps[next] = timestamp;
        self.angles[next] = angle;
        self.index = Some(next);
    }

    /// Latest registered timestamp, the estimator's notion of "now".
    pub fn now(&self) -> Option<f64> {
        self.index.map(|i| self.timestamps[i])
    }

    /// Called once per stimulus frame, independent of the sample rate.
    pub fn update_swim_estimate(&mut self) {
        let Some(now) = self.now() else {
            return;
        };
        let c = &self.config;
        let (vigor_window, threshold) = (c.vigor_window, c.vigor_threshold);
        let (bias_window, baseline_window) = (c.bias_window, c.bias_baseline_window);

        self.vigor = self.window_std(|t| t > now - vigor_window);

        if !self.in_bout && self.vigor > threshold {
            self.in_bout = true;
            self.bout_onset_t = now;
            self.bias_pending = true;
            self.bias = 0.0;
        }
        if self.vigor < threshold {
            self.in_bout = false;
        }

        if self.bias_pending && now > self.bout_onset_t + bias_window {
            // 半開区間 [split, now): 最新サンプル (t == now) は含めない
            let split = now - bias_window;
            let early = self.window_mean(|t| t >= split && t < now);
            let baseline = self.window_mean(|t| t >= split - baseline_window && t < split);
            self.bias = early - baseline;
            self.bias_pending = false;
            self.bias_event = Some(self.bias);
        }
    }

    pub fn vigor(&self) -> f64 {
        self.vigor
    }

    /// Bias of the current or last bout; 0.0 until it has been computed.
    pub fn bias(&self) -> f64 {
        self.bias
    }

    pub fn in_bout(&self) -> bool {
        self.in_bout
    }

    pub fn bias_pending(&self) -> bool {
        self.bias_pending
    }

    /// Timestamp at which the current/last bout was detected.
    pub fn bout_onset(&self) -> Option<f64> {
        (self.bout_onset_t > 0.0).then_some(self.bout_onset_t)
    }

    /// The newly computed bias, once per bout.
    pub fn take_bias_event(&mut self) -> Option<f64> {
        self.bias_event.take()
    }

    /// Angles of written, non-NaN slots whose timestamp passes `keep`.
    fn window(&self, keep: impl Fn(f64) -> bool) -> Vec<f64> {
        self.timestamps
            .iter()
            .zip(&self.angles)
            .filter(|&(&t, &a)| t > 0.0 && !a.is_nan() && keep(t))
            .map(|(_, &a)| a)
            .collect()
    }

    fn window_mean(&self, keep: impl Fn(f64) -> bool) -> f64 {
        mean(&self.window(keep))
    }

    /// Population standard deviation.
    fn window_std(&self, keep: impl Fn(f64) -> bool) -> f64 {
        let values = self.window(keep);
        if values.is_empty() {
            return 0.0;
        }
        let m = mean(&values);
        let var = values.iter().map(|a| (a - m).powi(2)).sum::<f64>() / values.len() as f64;
        var.sqrt()
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    const RATE: f64 = 200.0;
    const TICK: f64 = 1.0 / 60.0;

    fn approx_eq(a: f64, b: f64, eps: f64) -> bool {
        (a - b).abs() < eps
    }

    fn bout_angle(t: f64) -> f64 {
        if (1.0..=1.3).contains(&t) {
            0.15 + 0.2 * (2.0 * PI * 20.0 * (t - 1.0)).sin()
        } else {
            0.0
        }
    }

    fn samples() -> Vec<(f64, f64)> {
        (1..=(2.0 * RATE) as usize)
            .map(|i| {
                let t = i as f64 / RATE;
                (t, bout_angle(t))
            })
            .collect()
    }

    fn mean_in(samples: &[(f64, f64)], lo: f64, hi: f64) -> f64 {
        let inside: Vec<f64> = samples
            .iter()
            .filter(|(t, _)| *t >= lo && *t < hi)
            .map(|(_, a)| *a)
            .collect();
        inside.iter().sum::<f64>() / inside.len() as f64
    }

    #[test]
    fn test_bout_onset_and_single_bias() {
        let config = EstimatorConfig::default();
        let mut est = SwimEstimator::new(config.clone());
        let all = samples();

        let mut next = 0;
        let mut onsets = Vec::new();
        let mut events = Vec::new();
        let mut tick = 0.0;
        while tick < 2.0 {
            tick += TICK;
            while next < all.len() && all[next].0 <= tick {
                est.register_new_data(all[next].0, all[next].1);
                next += 1;
            }
            let was_in_bout = est.in_bout();
            est.update_swim_estimate();
            if est.in_bout() && !was_in_bout {
                onsets.push(est.bout_onset().unwrap());
            }
            if let Some(bias) = est.take_bias_event() {
                events.push((est.now().unwrap(), bias));
            }
        }

        assert_eq!(onsets.len(), 1, "onsets: {:?}", onsets);
        assert!(approx_eq(onsets[0], 1.0, TICK + 1e-9), "onset at {}", onsets[0]);

        assert_eq!(events.len(), 1, "bias events: {:?}", events);
        let (t_bias, bias) = events[0];
        let due = onsets[0] + config.bias_window;
        assert!(t_bias > due && t_bias <= due + TICK + 1e-9, "bias at {} (due {})", t_bias, due);

        let split = t_bias - config.bias_window;
        let expected = mean_in(&all, split, t_bias)
            - mean_in(&all, split - config.bias_baseline_window, split);
        assert!(approx_eq(bias, expected, 1e-12), "bias {} expected {}", bias, expected);
        assert!(bias.abs() > 1e-6);

        // 計算後の bias は次の bout まで保持される
        assert!(!est.in_bout());
        assert_eq!(est.bias(), bias);
    }

    #[test]
    fn test_flat_stream_never_bouts() {
        let mut est = SwimEstimator::new(EstimatorConfig::default());
        for i in 1..400 {
            est.register_new_data(i as f64 / RATE, 0.3);
            est.update_swim_estimate();
            assert!(!est.in_bout());
        }
        assert_eq!(est.vigor(), 0.0);
        assert_eq!(est.bias(), 0.0);
        assert!(est.take_bias_event().is_none());
    }

    #[test]
    fn test_update_before_data_is_noop() {
        let mut est = SwimEstimator::new(EstimatorConfig::default());
        est.update_swim_estimate();
        assert_eq!(est.vigor(), 0.0);
        assert!(est.now().is_none());
        assert!(est.bout_onset().is_none());
    }

    #[test]
    fn test_vigor_is_population_std_of_window() {
        let mut est = SwimEstimator::new(EstimatorConfig::default());
        // 窓 (0.05s) の外
        est.register_new_data(1.0, 5.0);
        for (t, a) in [(1.96, 1.0), (1.98, -1.0), (2.0, f64::NAN)] {
            est.register_new_data(t, a);
        }
        est.update_swim_estimate();
        // NaN は無視 -> [1, -1] の std = 1
        assert!(approx_eq(est.vigor(), 1.0, 1e-12));
        assert!(est.in_bout());
        assert!(est.bias_pending());
    }

    #[test]
    fn test_ring_overwrites_oldest() {
        let config = EstimatorConfig {
            buffer_size: 4,
            vigor_window: 100.0,
            ..EstimatorConfig::default()
        };
        let mut est = SwimEstimator::new(config);
        for i in 1..=4 {
            est.register_new_data(i as f64, 10.0);
        }
        for i in 5..=8 {
            est.register_new_data(i as f64, 0.0);
        }
        est.update_swim_estimate();
        // 10.0 のサンプルは全て上書き済み
        assert_eq!(est.vigor(), 0.0);
        assert_eq!(est.now(), Some(8.0));
    }
}
