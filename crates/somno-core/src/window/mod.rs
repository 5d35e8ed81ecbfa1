//! Fixed-duration sample windows
//!
//! An [`ActiveWindow`] only ever grows. Closing it consumes the value and
//! yields a [`Window`], which has no mutating methods at all, so a snapshot
//! handed downstream cannot change after rotation.

mod aggregator;

pub use aggregator::*;

use serde::Serialize;

use crate::sensors::{
    EnvironmentReading, MotionSample, PressureFrame, SensorPayload, Stamped, Timestamp,
};

/// The window currently receiving samples.
#[derive(Debug, Clone)]
pub struct ActiveWindow {
    start: Timestamp,
    pressure: Vec<Stamped<PressureFrame>>,
    motion: Vec<Stamped<MotionSample>>,
    environment: Vec<Stamped<EnvironmentReading>>,
}

impl ActiveWindow {
    pub fn new(start: Timestamp) -> Self {
        Self {
            start,
            // One minute of 1 Hz pressure and 20 Hz motion
            pressure: Vec::with_capacity(64),
            motion: Vec::with_capacity(1280),
            environment: Vec::with_capacity(4),
        }
    }

    pub fn start(&self) -> Timestamp {
        self.start
    }

    /// Append a sample to its channel.
    pub fn push(&mut self, timestamp: Timestamp, payload: SensorPayload) {
        match payload {
            SensorPayload::Pressure(frame) => self.pressure.push(Stamped::new(timestamp, frame)),
            SensorPayload::Motion(sample) => self.motion.push(Stamped::new(timestamp, sample)),
            SensorPayload::Environment(reading) => {
                self.environment.push(Stamped::new(timestamp, reading))
            }
        }
    }

    pub fn sample_count(&self) -> usize {
        self.pressure.len() + self.motion.len() + self.environment.len()
    }

    /// Seal the window. `id` is the rotation sequence number.
    pub fn close(self, id: u64, end: Timestamp) -> Window {
        Window {
            id,
            start: self.start,
            end,
            pressure: self.pressure,
            motion: self.motion,
            environment: self.environment,
        }
    }
}

/// A closed, read-only window snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct Window {
    id: u64,
    start: Timestamp,
    end: Timestamp,
    pressure: Vec<Stamped<PressureFrame>>,
    motion: Vec<Stamped<MotionSample>>,
    environment: Vec<Stamped<EnvironmentReading>>,
}

impl Window {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn start(&self) -> Timestamp {
        self.start
    }

    pub fn end(&self) -> Timestamp {
        self.end
    }

    pub fn duration(&self) -> chrono::TimeDelta {
        self.end - self.start
    }

    pub fn pressure(&self) -> &[Stamped<PressureFrame>] {
        &self.pressure
    }

    pub fn motion(&self) -> &[Stamped<MotionSample>] {
        &self.motion
    }

    pub fn environment(&self) -> &[Stamped<EnvironmentReading>] {
        &self.environment
    }

    pub fn sample_count(&self) -> usize {
        self.pressure.len() + self.motion.len() + self.environment.len()
    }

    /// Mean temperature, `None` when the window holds no environment samples.
    pub fn mean_temperature(&self) -> Option<f64> {
        mean(
            self.environment
                .iter()
                .map(|s| f64::from(s.value.temperature_celsius)),
        )
    }

    /// Mean relative humidity, `None` when the window holds no environment samples.
    pub fn mean_humidity(&self) -> Option<f64> {
        mean(
            self.environment
                .iter()
                .map(|s| f64::from(s.value.humidity_percent)),
        )
    }
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    (count > 0).then(|| sum / count as f64)
}
