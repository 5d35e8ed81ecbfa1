//! Occupancy gate and per-frame feature extraction

use thiserror::Error;

use super::BodySide;
use crate::sensors::PressureFrame;

/// Any raw reading above this means the mat is unloaded or saturated.
pub const GATE_MAX_READING: f64 = 5000.0;
pub const GATE_MAX_STD: f64 = 700.0;
pub const GATE_MAX_VARIANCE: f64 = 60000.0;

/// Coverage threshold as a fraction of the clipped frame maximum.
const COVERAGE_FRACTION: f64 = 150.0 / 255.0;

/// Upper clip applied after standardisation.
const CLIP_PERCENTILE: f64 = 75.0;

const SSIM_K1: f64 = 0.01;
const SSIM_K2: f64 = 0.03;
const SSIM_MAX_WINDOW: usize = 7;

/// Names of the extracted features, in [`FeatureVector`] order.
pub const FEATURE_NAMES: [&str; 13] = [
    "std",
    "kurtosis",
    "coverage_total",
    "coverage_reg1",
    "coverage_reg2",
    "coverage_reg3",
    "coverage_reg4",
    "coverage_reg5",
    "coverage_reg6",
    "symmetry",
    "balance",
    "cm_x",
    "cm_y",
];

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FrameError {
    #[error("frame has zero variance")]
    ZeroVariance,
    #[error("clipped frame has no mass")]
    ZeroMass,
    #[error("feature {0} is not finite")]
    NonFinite(&'static str),
    #[error("scoring failed: {0}")]
    Scoring(String),
}

/// Dense row-major matrix of readings.
#[derive(Debug, Clone, PartialEq)]
pub struct Grid {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl Grid {
    pub fn new(rows: usize, cols: usize, data: Vec<f64>) -> Self {
        debug_assert_eq!(rows * cols, data.len());
        Self { rows, cols, data }
    }

    pub fn from_frame(frame: &PressureFrame) -> Self {
        let rows = frame.rows().len();
        let cols = frame.rows().first().map_or(0, |r| r.len());
        let data = frame
            .rows()
            .iter()
            .flat_map(|r| r.iter().map(|&v| f64::from(v)))
            .collect();
        Self::new(rows, cols, data)
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn at(&self, row: usize, col: usize) -> f64 {
        self.data[row * self.cols + col]
    }

    pub fn values(&self) -> &[f64] {
        &self.data
    }

    fn map(&self, f: impl Fn(f64) -> f64) -> Self {
        Self::new(self.rows, self.cols, self.data.iter().map(|&v| f(v)).collect())
    }

    /// Copy of `rows x cols` starting at `(row0, col0)`.
    fn block(&self, row0: usize, col0: usize, rows: usize, cols: usize) -> Self {
        let mut data = Vec::with_capacity(rows * cols);
        for r in row0..row0 + rows {
            for c in col0..col0 + cols {
                data.push(self.at(r, c));
            }
        }
        Self::new(rows, cols, data)
    }

    fn mirror_cols(&self) -> Self {
        let mut data = Vec::with_capacity(self.data.len());
        for r in 0..self.rows {
            for c in (0..self.cols).rev() {
                data.push(self.at(r, c));
            }
        }
        Self::new(self.rows, self.cols, data)
    }

    /// Rotate by 180 degrees (flip both axes).
    pub fn flip_both(&self) -> Self {
        let mut data = self.data.clone();
        data.reverse();
        Self::new(self.rows, self.cols, data)
    }

    pub fn max(&self) -> f64 {
        self.data.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }

    pub fn min(&self) -> f64 {
        self.data.iter().copied().fold(f64::INFINITY, f64::min)
    }

    pub fn mean(&self) -> f64 {
        self.data.iter().sum::<f64>() / self.data.len() as f64
    }

    /// Population variance.
    pub fn variance(&self) -> f64 {
        let mean = self.mean();
        self.data.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / self.data.len() as f64
    }

    fn count_above(&self, threshold: f64) -> usize {
        self.data.iter().filter(|&&v| v > threshold).count()
    }
}

/// Raw-frame statistics used by the occupancy gate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameStats {
    pub max: f64,
    pub std: f64,
    pub variance: f64,
}

impl FrameStats {
    pub fn of(grid: &Grid) -> Self {
        let variance = grid.variance();
        Self {
            max: grid.max(),
            std: variance.sqrt(),
            variance,
        }
    }

    /// True when the frame should be labelled empty without scoring.
    pub fn is_unoccupied(&self) -> bool {
        self.max > GATE_MAX_READING || self.std > GATE_MAX_STD || self.variance > GATE_MAX_VARIANCE
    }
}

/// Extracted features, laid out as [`FEATURE_NAMES`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureVector(pub [f64; FEATURE_NAMES.len()]);

impl FeatureVector {
    pub fn get(&self, name: &str) -> Option<f64> {
        FEATURE_NAMES
            .iter()
            .position(|&n| n == name)
            .map(|i| self.0[i])
    }
}

/// Compute the feature vector of an occupied frame.
///
/// `std` and `kurtosis` describe the raw frame; every other feature is
/// computed on the standardised, clipped and side-normalised frame.
pub fn extract(raw: &Grid, side: BodySide) -> Result<FeatureVector, FrameError> {
    let variance = raw.variance();
    if variance <= 0.0 {
        return Err(FrameError::ZeroVariance);
    }
    let std = variance.sqrt();
    let kurtosis = excess_kurtosis(raw, variance);

    let mut clipped = clip_to_percentile(&standardize(raw, std), CLIP_PERCENTILE);
    if side == BodySide::Left {
        clipped = clipped.flip_both();
    }

    let threshold = clipped.max() * COVERAGE_FRACTION;
    let coverage_total = clipped.count_above(threshold) as f64;
    let regions = region_coverage(&clipped, threshold);
    let symmetry = symmetry(&clipped);
    let balance = balance(&clipped, threshold);
    let (cm_x, cm_y) = centre_of_mass(&clipped)?;

    let features = FeatureVector([
        std,
        kurtosis,
        coverage_total,
        regions[0],
        regions[1],
        regions[2],
        regions[3],
        regions[4],
        regions[5],
        symmetry,
        balance,
        cm_x,
        cm_y,
    ]);
    if let Some(i) = features.0.iter().position(|v| !v.is_finite()) {
        return Err(FrameError::NonFinite(FEATURE_NAMES[i]));
    }
    Ok(features)
}

/// Fisher kurtosis with population moments.
fn excess_kurtosis(grid: &Grid, variance: f64) -> f64 {
    let mean = grid.mean();
    let m4 = grid.values().iter().map(|v| (v - mean).powi(4)).sum::<f64>() / grid.values().len() as f64;
    m4 / (variance * variance) - 3.0
}

/// Z-score, then shift so the minimum is zero.
fn standardize(grid: &Grid, std: f64) -> Grid {
    let mean = grid.mean();
    let z = grid.map(|v| (v - mean) / std);
    let min = z.min();
    z.map(|v| v - min)
}

fn clip_to_percentile(grid: &Grid, q: f64) -> Grid {
    let upper = percentile(grid.values(), q);
    grid.map(|v| v.clamp(0.0, upper))
}

/// Percentile with linear interpolation between closest ranks.
pub fn percentile(values: &[f64], q: f64) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let pos = q / 100.0 * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = (lo + 1).min(sorted.len() - 1);
    let frac = pos - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

/// Thresholded cell counts of a 2 x 3 grid of regions, row-major.
fn region_coverage(grid: &Grid, threshold: f64) -> [f64; 6] {
    let height = grid.rows() / 2;
    let width = (grid.cols() - 1) / 3;
    core::array::from_fn(|i| {
        let (r, c) = (i / 3, i % 3);
        grid.block(r * height, c * width, height, width)
            .count_above(threshold) as f64
    })
}

/// Structural similarity of the left half against the mirrored right half.
fn symmetry(grid: &Grid) -> f64 {
    let half = grid.cols() / 2;
    let width = half.min(grid.cols() - half);
    let left = grid.block(0, 0, grid.rows(), width);
    let right = grid.block(0, half, grid.rows(), width);
    let range = right.max() - right.min();
    ssim(&left, &right.mirror_cols(), range)
}

/// Mean SSIM over every fully contained uniform window.
///
/// Zero when the halves are too small for a 3x3 window or flat.
fn ssim(a: &Grid, b: &Grid, data_range: f64) -> f64 {
    let mut win = SSIM_MAX_WINDOW.min(a.rows()).min(a.cols());
    if win % 2 == 0 {
        win -= 1;
    }
    if win < 3 || data_range <= 0.0 {
        return 0.0;
    }

    let c1 = (SSIM_K1 * data_range).powi(2);
    let c2 = (SSIM_K2 * data_range).powi(2);
    let np = (win * win) as f64;
    let cov_norm = np / (np - 1.0);

    let mut total = 0.0;
    let mut count = 0usize;
    for r0 in 0..=a.rows() - win {
        for c0 in 0..=a.cols() - win {
            let (mut ux, mut uy, mut uxx, mut uyy, mut uxy) = (0.0, 0.0, 0.0, 0.0, 0.0);
            for r in r0..r0 + win {
                for c in c0..c0 + win {
                    let (x, y) = (a.at(r, c), b.at(r, c));
                    ux += x;
                    uy += y;
                    uxx += x * x;
                    uyy += y * y;
                    uxy += x * y;
                }
            }
            let (ux, uy) = (ux / np, uy / np);
            let vx = cov_norm * (uxx / np - ux * ux);
            let vy = cov_norm * (uyy / np - uy * uy);
            let vxy = cov_norm * (uxy / np - ux * uy);

            total += ((2.0 * ux * uy + c1) * (2.0 * vxy + c2))
                / ((ux * ux + uy * uy + c1) * (vx + vy + c2));
            count += 1;
        }
    }
    total / count as f64
}

/// `(left - right) / (left + right)` of thresholded cells.
fn balance(grid: &Grid, threshold: f64) -> f64 {
    let half = grid.cols() / 2;
    let left = grid.block(0, 0, grid.rows(), half).count_above(threshold) as f64;
    let right = grid
        .block(0, half, grid.rows(), grid.cols() - half)
        .count_above(threshold) as f64;
    if left == right {
        0.0
    } else {
        (left - right) / (left + right)
    }
}

/// Intensity-weighted centre `(x, y)` in cell coordinates.
fn centre_of_mass(grid: &Grid) -> Result<(f64, f64), FrameError> {
    let total: f64 = grid.values().iter().sum();
    if total <= 0.0 {
        return Err(FrameError::ZeroMass);
    }
    let (mut x, mut y) = (0.0, 0.0);
    for r in 0..grid.rows() {
        for c in 0..grid.cols() {
            let v = grid.at(r, c);
            x += c as f64 * v;
            y += r as f64 * v;
        }
    }
    Ok((x / total, y / total))
}
