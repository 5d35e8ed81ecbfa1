//! Sample types and the sensor source contract
//!
//! The hardware drivers (pressure matrix shift registers, the SPI IMU, the
//! I2C hygrometer) live outside this crate. They only need to push
//! timestamped [`SensorPayload`]s into a [`SampleSink`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wall-clock timestamp attached to every sample.
pub type Timestamp = DateTime<Utc>;

/// Rows of the pressure mat.
pub const PRESSURE_ROWS: usize = 16;
/// Columns of the pressure mat.
pub const PRESSURE_COLS: usize = 12;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SensorError {
    #[error("{sensor}: reading out of range ({details})")]
    OutOfRange {
        sensor: &'static str,
        details: String,
    },
    #[error("{sensor}: initialization failed ({details})")]
    InitializationFailed {
        sensor: &'static str,
        details: String,
    },
}

/// Which acquisition channel a sample belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Pressure,
    Motion,
    Environment,
}

/// One full scan of the pressure mat, raw ADC counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PressureFrame {
    cells: Vec<[u16; PRESSURE_COLS]>,
}

impl PressureFrame {
    pub fn new(cells: [[u16; PRESSURE_COLS]; PRESSURE_ROWS]) -> Self {
        Self {
            cells: cells.to_vec(),
        }
    }

    /// Build a frame from a generator called with `(row, col)`.
    pub fn from_fn(mut f: impl FnMut(usize, usize) -> u16) -> Self {
        let cells = (0..PRESSURE_ROWS)
            .map(|r| core::array::from_fn(|c| f(r, c)))
            .collect();
        Self { cells }
    }

    pub fn rows(&self) -> &[[u16; PRESSURE_COLS]] {
        &self.cells
    }

    pub fn get(&self, row: usize, col: usize) -> u16 {
        self.cells[row][col]
    }
}

/// One IMU reading: angular rate (dps) then acceleration (g).
///
/// Layout is `[gx, gy, gz, ax, ay, az]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotionSample(pub [f32; 6]);

impl MotionSample {
    pub fn gyro(&self) -> [f32; 3] {
        [self.0[0], self.0[1], self.0[2]]
    }

    pub fn accel(&self) -> [f32; 3] {
        [self.0[3], self.0[4], self.0[5]]
    }

    pub fn is_finite(&self) -> bool {
        self.0.iter().all(|v| v.is_finite())
    }
}

/// Ambient reading from the hygrometer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentReading {
    pub temperature_celsius: f32,
    pub humidity_percent: f32,
}

/// Channel-specific payload of a sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SensorPayload {
    Pressure(PressureFrame),
    Motion(MotionSample),
    Environment(EnvironmentReading),
}

impl SensorPayload {
    pub fn channel(&self) -> ChannelKind {
        match self {
            Self::Pressure(_) => ChannelKind::Pressure,
            Self::Motion(_) => ChannelKind::Motion,
            Self::Environment(_) => ChannelKind::Environment,
        }
    }

    /// Reject readings no working sensor can produce. Pressure counts are
    /// unsigned and always accepted.
    pub fn check_range(&self, sensor: &'static str) -> Result<(), SensorError> {
        let details = match self {
            Self::Pressure(_) => return Ok(()),
            Self::Motion(sample) if !sample.is_finite() => format!("non-finite motion {:?}", sample.0),
            Self::Environment(r) if !r.temperature_celsius.is_finite() => {
                format!("temperature {}", r.temperature_celsius)
            }
            Self::Environment(r) if !(0.0..=100.0).contains(&r.humidity_percent) => {
                format!("humidity {}", r.humidity_percent)
            }
            _ => return Ok(()),
        };
        Err(SensorError::OutOfRange { sensor, details })
    }
}

/// A payload stamped with its acquisition time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stamped<T> {
    pub timestamp: Timestamp,
    pub value: T,
}

impl<T> Stamped<T> {
    pub fn new(timestamp: Timestamp, value: T) -> Self {
        Self { timestamp, value }
    }
}

/// Receiver side of the acquisition path.
///
/// Implementations must never block on downstream processing.
pub trait SampleSink: Send + Sync {
    fn on_sample(&self, timestamp: Timestamp, payload: SensorPayload);

    /// A failed read. The sample is dropped and acquisition continues.
    fn on_error(&self, error: SensorError) {
        log::warn!("[sensors] dropped sample: {}", error);
    }
}

/// Something that produces samples on its own schedule.
pub trait SensorSource: Send {
    fn name(&self) -> &'static str;

    /// Begin pushing samples into `sink`. Must return promptly.
    fn start(&mut self, sink: std::sync::Arc<dyn SampleSink>) -> Result<(), SensorError>;

    /// Stop producing samples and release the worker thread, if any.
    fn stop(&mut self);
}
