//! Respiratory rate from zero crossings of the respiratory composite

/// Crossings closer than this many samples are merged (about 1 s at 20 Hz).
pub const MIN_CROSSING_SEPARATION: usize = 20;

/// Offset used on each side of a crossing to estimate its slope.
pub const SLOPE_OFFSET: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    Rising,
    Falling,
}

/// A zero crossing kept after debouncing and slope classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Crossing {
    pub index: usize,
    pub polarity: Polarity,
}

/// Sample indices where the sign changes between consecutive samples.
///
/// A sample that is exactly zero counts as a change.
pub fn zero_crossings(signal: &[f64]) -> Vec<usize> {
    (1..signal.len())
        .filter(|&i| signal[i - 1] * signal[i] <= 0.0)
        .collect()
}

/// Drop crossings that fall within `min_separation` of the last kept one.
pub fn debounce(crossings: &[usize], min_separation: usize) -> Vec<usize> {
    let mut kept: Vec<usize> = Vec::with_capacity(crossings.len());
    for &idx in crossings {
        match kept.last() {
            Some(&last) if idx - last < min_separation => {}
            _ => kept.push(idx),
        }
    }
    kept
}

/// Slope direction around `index`, `None` for a flat neighbourhood.
fn polarity_at(signal: &[f64], index: usize) -> Option<Polarity> {
    let before = signal[index.saturating_sub(SLOPE_OFFSET)];
    let after = signal[(index + SLOPE_OFFSET).min(signal.len() - 1)];
    let slope = after - before;
    if slope > 0.0 {
        Some(Polarity::Rising)
    } else if slope < 0.0 {
        Some(Polarity::Falling)
    } else {
        None
    }
}

/// Keep only crossings whose polarity alternates.
///
/// Two consecutive crossings of the same polarity are a double trigger; the
/// later one is discarded.
pub fn alternating_crossings(signal: &[f64], crossings: &[usize]) -> Vec<Crossing> {
    let mut accepted: Vec<Crossing> = Vec::with_capacity(crossings.len());
    for &index in crossings {
        let Some(polarity) = polarity_at(signal, index) else {
            continue;
        };
        if accepted.last().is_some_and(|c| c.polarity == polarity) {
            continue;
        }
        accepted.push(Crossing { index, polarity });
    }
    accepted
}

/// Outcome of the breath counter.
#[derive(Debug, Clone, PartialEq)]
pub struct BreathCount {
    pub crossings: Vec<Crossing>,
    pub breaths: usize,
    /// Seconds between the first and the last counted crossing.
    pub span_secs: f64,
}

impl BreathCount {
    pub fn rate_per_minute(&self) -> Option<f64> {
        (self.breaths > 0 && self.span_secs > 0.0)
            .then(|| self.breaths as f64 * 60.0 / self.span_secs)
    }
}

/// Count complete breaths in a detrended respiratory composite.
///
/// Each breath is a pair of alternating crossings after the first one, so
/// `n` accepted crossings give `(n - 1) / 2` breaths. Returns `None` with
/// fewer than three accepted crossings.
pub fn count_breaths(signal: &[f64], sample_rate_hz: f64) -> Option<BreathCount> {
    let raw = zero_crossings(signal);
    let debounced = debounce(&raw, MIN_CROSSING_SEPARATION);
    let crossings = alternating_crossings(signal, &debounced);
    if crossings.len() < 3 {
        return None;
    }

    let breaths = (crossings.len() - 1) / 2;
    let first = crossings[0].index;
    let last = crossings[2 * breaths].index;
    let span_secs = (last - first) as f64 / sample_rate_hz;

    Some(BreathCount {
        crossings,
        breaths,
        span_secs,
    })
}

/// Breaths per minute, `None` when undefined.
pub fn respiratory_rate(signal: &[f64], sample_rate_hz: f64) -> Option<f64> {
    count_breaths(signal, sample_rate_hz)?.rate_per_minute()
}
