//! Heart rate and beat-interval variability from peaks of the cardiac composite

/// Minimum spacing between two detected beats.
pub const MIN_PEAK_DISTANCE_SECS: f64 = 0.5;

/// Local maxima strictly above `min_height`, at least `min_distance` samples
/// apart.
///
/// Flat tops count once, at the middle of the plateau. When two peaks are
/// closer than `min_distance` the taller one survives.
pub fn find_peaks(signal: &[f64], min_height: f64, min_distance: usize) -> Vec<usize> {
    let candidates = local_maxima(signal)
        .into_iter()
        .filter(|&i| signal[i] > min_height)
        .collect::<Vec<_>>();

    if min_distance <= 1 || candidates.len() < 2 {
        return candidates;
    }

    // Visit candidates tallest first and suppress neighbours within range.
    let mut order: Vec<usize> = (0..candidates.len()).collect();
    order.sort_by(|&a, &b| signal[candidates[b]].total_cmp(&signal[candidates[a]]));

    let mut keep = vec![true; candidates.len()];
    for &k in &order {
        if !keep[k] {
            continue;
        }
        let centre = candidates[k];
        for j in (0..k).rev() {
            if centre - candidates[j] >= min_distance {
                break;
            }
            keep[j] = false;
        }
        for j in k + 1..candidates.len() {
            if candidates[j] - centre >= min_distance {
                break;
            }
            keep[j] = false;
        }
    }

    candidates
        .into_iter()
        .zip(keep)
        .filter_map(|(idx, kept)| kept.then_some(idx))
        .collect()
}

fn local_maxima(signal: &[f64]) -> Vec<usize> {
    let mut peaks = Vec::new();
    let n = signal.len();
    let mut i = 1;
    while i + 1 < n {
        if signal[i - 1] < signal[i] {
            let mut ahead = i + 1;
            while ahead + 1 < n && signal[ahead] == signal[i] {
                ahead += 1;
            }
            if signal[ahead] < signal[i] {
                peaks.push((i + ahead - 1) / 2);
                i = ahead;
            }
        }
        i += 1;
    }
    peaks
}

/// Heart rate and mean beat interval derived from one set of peaks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BeatStats {
    pub heart_rate_bpm: f64,
    pub mean_interval_secs: f64,
}

/// Beats per minute and mean inter-beat interval.
///
/// `None` with fewer than two peaks or a non-positive span.
pub fn beat_stats(peaks: &[usize], sample_rate_hz: f64) -> Option<BeatStats> {
    let (&first, &last) = (peaks.first()?, peaks.last()?);
    if peaks.len() < 2 || last <= first {
        return None;
    }

    let span_secs = (last - first) as f64 / sample_rate_hz;
    let intervals = peaks.len() - 1;
    Some(BeatStats {
        heart_rate_bpm: intervals as f64 * 60.0 / span_secs,
        // Mean of consecutive differences telescopes to span / intervals.
        mean_interval_secs: span_secs / intervals as f64,
    })
}
