//! Automatic sweep trajectory.
//!
//! `pan(t) = A·sin(ωt)` and `tilt(t) = A·sin(ωt + φ)`, sampled once per tick.
//! The trajectory is an infinite iterator; [`SweepTrajectory::restart`] puts
//! it back at `t = 0`.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::position::{Position, MAX_ANGLE};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SweepConfig {
    /// Peak angle in degrees, at most 90
    pub amplitude: f64,
    /// Angular frequency ω in rad/s
    pub angular_frequency: f64,
    /// Phase offset φ of the tilt axis in radians
    pub phase: f64,
    /// Time between two samples
    #[serde(with = "crate::serde_millis")]
    pub tick: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            amplitude: MAX_ANGLE,
            angular_frequency: 2.0,
            phase: 0.0,
            tick: Duration::from_millis(100),
        }
    }
}

impl SweepConfig {
    /// Amplitude limited to [0, 90]
    pub fn effective_amplitude(&self) -> f64 {
        if self.amplitude.is_nan() {
            0.0
        } else {
            self.amplitude.abs().min(MAX_ANGLE)
        }
    }

    /// Largest change of either axis between two consecutive samples.
    ///
    /// `|d/dt A·sin(ωt)| <= A·ω`, so one tick moves at most `A·ω·tick`.
    pub fn max_step(&self) -> f64 {
        self.effective_amplitude() * self.angular_frequency.abs() * self.tick.as_secs_f64()
    }
}

#[derive(Debug, Clone)]
pub struct SweepTrajectory {
    config: SweepConfig,
    step: u64,
}

impl SweepTrajectory {
    pub fn new(config: SweepConfig) -> Self {
        Self { config, step: 0 }
    }

    pub fn config(&self) -> &SweepConfig {
        &self.config
    }

    /// Sample the trajectory at `t` seconds
    pub fn at(&self, t: f64) -> Position {
        let a = self.config.effective_amplitude();
        let wt = self.config.angular_frequency * t;
        // clamped() only guards against rounding at the peaks
        Position::clamped(a * wt.sin(), a * (wt + self.config.phase).sin())
    }

    /// Go back to t = 0
    pub fn restart(&mut self) {
        self.step = 0;
    }

    /// Time of the sample that `next()` will return
    pub fn elapsed(&self) -> f64 {
        self.step as f64 * self.config.tick.as_secs_f64()
    }
}

impl Iterator for SweepTrajectory {
    type Item = Position;

    fn next(&mut self) -> Option<Position> {
        let p = self.at(self.elapsed());
        self.step += 1;
        Some(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_at_center_without_phase() {
        let mut sweep = SweepTrajectory::new(SweepConfig::default());
        assert_eq!(sweep.next(), Some(Position::CENTER));
    }

    #[test]
    fn test_bounded_and_continuous() {
        let config = SweepConfig {
            amplitude: 90.0,
            angular_frequency: 2.0,
            phase: std::f64::consts::FRAC_PI_2,
            tick: Duration::from_millis(100),
        };
        let bound = config.max_step() + 1e-9;
        let samples: Vec<Position> = SweepTrajectory::new(config).take(2000).collect();

        for p in &samples {
            assert!(p.pan().abs() <= 90.0);
            assert!(p.tilt().abs() <= 90.0);
        }
        for w in samples.windows(2) {
            assert!(w[0].max_axis_distance(&w[1]) <= bound);
        }
        // It actually reaches the peaks
        assert!(samples.iter().any(|p| p.pan() > 89.0));
        assert!(samples.iter().any(|p| p.pan() < -89.0));
    }

    #[test]
    fn test_amplitude_capped() {
        let config = SweepConfig {
            amplitude: 400.0,
            ..SweepConfig::default()
        };
        assert_eq!(config.effective_amplitude(), 90.0);
        let sweep = SweepTrajectory::new(config);
        let quarter = std::f64::consts::FRAC_PI_2 / config.angular_frequency;
        assert!((sweep.at(quarter).pan() - 90.0).abs() < 1e-9);
    }

    #[test]
    fn test_restart() {
        let mut sweep = SweepTrajectory::new(SweepConfig::default());
        let first: Vec<Position> = sweep.by_ref().take(5).collect();
        sweep.restart();
        let again: Vec<Position> = sweep.take(5).collect();
        assert_eq!(first, again);
    }

    #[test]
    fn test_phase_offset() {
        let config = SweepConfig {
            phase: std::f64::consts::FRAC_PI_2,
            ..SweepConfig::default()
        };
        let p = SweepTrajectory::new(config).at(0.0);
        assert_eq!(p.pan(), 0.0);
        assert!((p.tilt() - 90.0).abs() < 1e-9);
    }
}
