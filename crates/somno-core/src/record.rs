use serde::Serialize;

use crate::position::PositionSummary;
use crate::sensors::Timestamp;
use crate::signal::VitalMetrics;
use crate::window::Window;

/// Everything derived from one closed window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessedRecord {
    pub window_id: u64,
    /// Start of the window.
    pub init_timestamp: Timestamp,
    /// End of the window.
    pub finish_timestamp: Timestamp,
    pub vitals: VitalMetrics,
    pub position: PositionSummary,
    /// Mean temperature in degrees Celsius.
    pub temperature: Option<f64>,
    /// Mean relative humidity in percent.
    pub humidity: Option<f64>,
}

impl ProcessedRecord {
    pub fn new(window: &Window, vitals: VitalMetrics, position: PositionSummary) -> Self {
        Self {
            window_id: window.id(),
            init_timestamp: window.start(),
            finish_timestamp: window.end(),
            vitals,
            position,
            temperature: window.mean_temperature(),
            humidity: window.mean_humidity(),
        }
    }
}
