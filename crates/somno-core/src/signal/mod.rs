//! Vital signs from the bed-frame gyroscope
//!
//! The three angular-rate axes are band-pass filtered twice, once for the
//! respiratory band and once for the cardiac band, then mixed into two
//! composite signals:
//!
//! - **RRS** (respiratory): zero crossings give the breathing rate,
//! - **CRS** (cardiac): peaks give heart rate and the mean beat interval.
//!
//! Accelerometer axes are carried in the window but not used here.

pub mod cardiac;
pub mod filter;
pub mod respiration;

use serde::Serialize;
use thiserror::Error;

use crate::sensors::{MotionSample, Stamped};
use filter::{Biquad, FILTFILT_PADDING, detrend};

/// Respiratory pass band in Hz.
pub const RESPIRATORY_BAND: (f64, f64) = (0.1, 0.7);
/// Cardiac pass band in Hz.
pub const CARDIAC_BAND: (f64, f64) = (0.8, 3.0);

/// RRS mixing weights for `[gx, gy, gz]`.
pub const RRS_WEIGHTS: [f64; 3] = [0.7, 0.22, 0.0775];
/// CRS mixing weights for `[gx, gy, gz]`.
pub const CRS_WEIGHTS: [f64; 3] = [0.54633, 0.31161, 0.15108];

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProcessingError {
    #[error("sample rate {0} Hz is too low for the cardiac band")]
    InvalidSampleRate(f64),
    #[error("motion sample {index} holds a non-finite value")]
    NonFiniteSample { index: usize },
    #[error("window {window} failed: {reason}")]
    Window { window: u64, reason: String },
}

/// Per-window vital signs. `None` means the estimator had too little to
/// work with; it is never folded into zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct VitalMetrics {
    /// Breaths per minute.
    pub respiratory_rate: Option<f64>,
    /// Beats per minute.
    pub heart_rate: Option<f64>,
    /// Mean inter-beat interval in seconds.
    pub heart_rate_variability: Option<f64>,
}

/// Everything computed for one window, kept for the debug dump.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SignalAnalysis {
    pub rrs: Vec<f64>,
    pub crs: Vec<f64>,
    pub crossings: Vec<usize>,
    pub peaks: Vec<usize>,
    pub metrics: VitalMetrics,
}

#[derive(Debug, Clone)]
pub struct SignalProcessor {
    sample_rate_hz: f64,
    respiratory: Biquad,
    cardiac: Biquad,
}

impl SignalProcessor {
    pub fn new(sample_rate_hz: f64) -> Result<Self, ProcessingError> {
        if !(sample_rate_hz.is_finite() && sample_rate_hz > 2.0 * CARDIAC_BAND.1) {
            return Err(ProcessingError::InvalidSampleRate(sample_rate_hz));
        }
        Ok(Self {
            sample_rate_hz,
            respiratory: Biquad::bandpass(RESPIRATORY_BAND.0, RESPIRATORY_BAND.1, sample_rate_hz),
            cardiac: Biquad::bandpass(CARDIAC_BAND.0, CARDIAC_BAND.1, sample_rate_hz),
        })
    }

    pub fn sample_rate_hz(&self) -> f64 {
        self.sample_rate_hz
    }

    /// Vital signs only.
    pub fn process(&self, motion: &[Stamped<MotionSample>]) -> Result<VitalMetrics, ProcessingError> {
        self.analyze(motion).map(|a| a.metrics)
    }

    /// Run both estimators and keep the intermediate signals.
    pub fn analyze(
        &self,
        motion: &[Stamped<MotionSample>],
    ) -> Result<SignalAnalysis, ProcessingError> {
        if let Some(index) = motion.iter().position(|s| !s.value.is_finite()) {
            return Err(ProcessingError::NonFiniteSample { index });
        }
        if motion.len() <= FILTFILT_PADDING {
            return Ok(SignalAnalysis::default());
        }

        let axes: [Vec<f64>; 3] = core::array::from_fn(|axis| {
            motion
                .iter()
                .map(|s| f64::from(s.value.gyro()[axis]))
                .collect()
        });

        let rrs = detrend(&self.composite(&self.respiratory, &axes, RRS_WEIGHTS));
        let crs = self.composite(&self.cardiac, &axes, CRS_WEIGHTS);

        let breaths = respiration::count_breaths(&rrs, self.sample_rate_hz);
        let distance = (cardiac::MIN_PEAK_DISTANCE_SECS * self.sample_rate_hz).round() as usize;
        let peaks = cardiac::find_peaks(&crs, 0.0, distance);
        let beats = cardiac::beat_stats(&peaks, self.sample_rate_hz);

        let metrics = VitalMetrics {
            respiratory_rate: breaths.as_ref().and_then(|b| b.rate_per_minute()),
            heart_rate: beats.map(|b| b.heart_rate_bpm),
            heart_rate_variability: beats.map(|b| b.mean_interval_secs),
        };

        Ok(SignalAnalysis {
            crossings: breaths
                .map(|b| b.crossings.iter().map(|c| c.index).collect())
                .unwrap_or_default(),
            rrs,
            crs,
            peaks,
            metrics,
        })
    }

    fn composite(&self, filter: &Biquad, axes: &[Vec<f64>; 3], weights: [f64; 3]) -> Vec<f64> {
        let mut out = vec![0.0; axes[0].len()];
        for (axis, weight) in axes.iter().zip(weights) {
            // Length was checked against the padding above.
            let Some(filtered) = filter.filtfilt(axis) else {
                continue;
            };
            for (acc, v) in out.iter_mut().zip(filtered) {
                *acc += weight * v;
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone, Utc};
    use core::f64::consts::PI;

    const FS: f64 = 20.0;

    fn motion(secs: f64, gyro: impl Fn(f64) -> [f64; 3]) -> Vec<Stamped<MotionSample>> {
        let start = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        (0..(secs * FS) as usize)
            .map(|i| {
                let t = i as f64 / FS;
                let g = gyro(t);
                Stamped::new(
                    start + TimeDelta::milliseconds((t * 1000.0) as i64),
                    MotionSample([g[0] as f32, g[1] as f32, g[2] as f32, 0.0, 0.0, 1.0]),
                )
            })
            .collect()
    }

    #[test]
    fn test_breathing_and_heartbeat() {
        let processor = SignalProcessor::new(FS).unwrap();
        // One 60 s window: 0.3 Hz breathing with a weaker 1.2 Hz heartbeat.
        let samples = motion(60.0, |t| {
            let breath = (2.0 * PI * 0.3 * t).sin();
            let beat = 0.3 * (2.0 * PI * 1.2 * t).sin();
            [breath + beat, 0.5 * breath + beat, 0.1 * breath + beat]
        });
        assert_eq!(samples.len(), 1200);

        let analysis = processor.analyze(&samples).unwrap();
        assert_eq!(analysis.rrs.len(), 1200);
        assert_eq!(analysis.crs.len(), 1200);

        let rr = analysis.metrics.respiratory_rate.unwrap();
        assert!((rr - 18.0).abs() < 1.8, "respiratory rate {}", rr);
        let hr = analysis.metrics.heart_rate.unwrap();
        assert!((hr - 72.0).abs() < 7.2, "heart rate {}", hr);
        let hrv = analysis.metrics.heart_rate_variability.unwrap();
        assert!((hrv - 60.0 / 72.0).abs() < 0.09, "hrv {}", hrv);
    }

    #[test]
    fn test_still_bed_is_undefined_not_zero() {
        let processor = SignalProcessor::new(FS).unwrap();
        let metrics = processor.process(&motion(60.0, |_| [0.0; 3])).unwrap();
        assert_eq!(metrics.respiratory_rate, None);
        assert_eq!(metrics.heart_rate, None);
        assert_eq!(metrics.heart_rate_variability, None);
    }

    #[test]
    fn test_short_window_is_undefined() {
        let processor = SignalProcessor::new(FS).unwrap();
        let metrics = processor.process(&motion(0.3, |t| [t, t, t])).unwrap();
        assert_eq!(metrics, VitalMetrics::default());
        assert_eq!(processor.process(&[]).unwrap(), VitalMetrics::default());
    }

    #[test]
    fn test_non_finite_sample_fails_window() {
        let processor = SignalProcessor::new(FS).unwrap();
        let mut samples = motion(10.0, |_| [0.1; 3]);
        samples[42].value.0[1] = f32::NAN;
        assert_eq!(
            processor.process(&samples),
            Err(ProcessingError::NonFiniteSample { index: 42 })
        );
    }

    #[test]
    fn test_rejects_low_sample_rate() {
        assert!(matches!(
            SignalProcessor::new(5.0),
            Err(ProcessingError::InvalidSampleRate(_))
        ));
    }
}
