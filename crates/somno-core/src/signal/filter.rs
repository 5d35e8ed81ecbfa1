//! Biquad IIR filtering
//!
//! Band-pass sections are designed with the bilinear transform (RBJ audio
//! cookbook, constant 0 dB peak gain) and applied forward then backward so
//! the output has no phase delay.

use core::f64::consts::PI;

/// Samples of odd extension added at each end before zero-phase filtering
/// (three times the filter order + 1, as is customary for a biquad).
pub const FILTFILT_PADDING: usize = 9;

/// Normalised second-order section.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Biquad {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
}

impl Biquad {
    /// Band-pass between `low_hz` and `high_hz`.
    ///
    /// Centre frequency is the geometric mean of the edges and
    /// `Q = f0 / (high - low)`.
    pub fn bandpass(low_hz: f64, high_hz: f64, sample_rate_hz: f64) -> Self {
        assert!(
            0.0 < low_hz && low_hz < high_hz && high_hz < sample_rate_hz / 2.0,
            "band edges must satisfy 0 < low < high < Nyquist"
        );

        let f0 = (low_hz * high_hz).sqrt();
        let q = f0 / (high_hz - low_hz);
        let omega = 2.0 * PI * f0 / sample_rate_hz;
        let alpha = omega.sin() / (2.0 * q);

        let a0 = 1.0 + alpha;
        Self {
            b0: alpha / a0,
            b1: 0.0,
            b2: -alpha / a0,
            a1: -2.0 * omega.cos() / a0,
            a2: (1.0 - alpha) / a0,
        }
    }

    /// DC gain `H(1)`.
    fn dc_gain(&self) -> f64 {
        (self.b0 + self.b1 + self.b2) / (1.0 + self.a1 + self.a2)
    }

    /// Transposed direct form II state for a unit step already in steady state.
    fn steady_state(&self) -> [f64; 2] {
        let g = self.dc_gain();
        [g - self.b0, self.b2 - self.a2 * g]
    }

    /// Run the section over `input` starting from state `z`.
    fn run(&self, input: &[f64], mut z: [f64; 2]) -> Vec<f64> {
        input
            .iter()
            .map(|&x| {
                let y = self.b0 * x + z[0];
                z[0] = self.b1 * x - self.a1 * y + z[1];
                z[1] = self.b2 * x - self.a2 * y;
                y
            })
            .collect()
    }

    /// Zero-phase forward-backward filtering.
    ///
    /// Returns `None` when the input is not longer than the edge padding.
    pub fn filtfilt(&self, input: &[f64]) -> Option<Vec<f64>> {
        let n = input.len();
        if n <= FILTFILT_PADDING {
            return None;
        }

        let padded = odd_extend(input, FILTFILT_PADDING);
        let zi = self.steady_state();

        let first = padded[0];
        let forward = self.run(&padded, [zi[0] * first, zi[1] * first]);

        let mut reversed: Vec<f64> = forward.into_iter().rev().collect();
        let last = reversed[0];
        reversed = self.run(&reversed, [zi[0] * last, zi[1] * last]);
        reversed.reverse();

        Some(reversed[FILTFILT_PADDING..FILTFILT_PADDING + n].to_vec())
    }
}

/// Point-reflect `pad` samples around each end.
fn odd_extend(x: &[f64], pad: usize) -> Vec<f64> {
    let n = x.len();
    let mut out = Vec::with_capacity(n + 2 * pad);
    out.extend((1..=pad).rev().map(|i| 2.0 * x[0] - x[i]));
    out.extend_from_slice(x);
    out.extend((1..=pad).map(|i| 2.0 * x[n - 1] - x[n - 1 - i]));
    out
}

/// Remove the least-squares straight line from `signal`.
pub fn detrend(signal: &[f64]) -> Vec<f64> {
    let n = signal.len();
    if n < 2 {
        return vec![0.0; n];
    }

    let nf = n as f64;
    let mean_x = (nf - 1.0) / 2.0;
    let mean_y = signal.iter().sum::<f64>() / nf;

    let (mut sxy, mut sxx) = (0.0, 0.0);
    for (i, &y) in signal.iter().enumerate() {
        let dx = i as f64 - mean_x;
        sxy += dx * (y - mean_y);
        sxx += dx * dx;
    }
    let slope = sxy / sxx;

    signal
        .iter()
        .enumerate()
        .map(|(i, &y)| y - (mean_y + slope * (i as f64 - mean_x)))
        .collect()
}
