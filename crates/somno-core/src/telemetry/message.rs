//! Wire schema of the broker protocol

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::position::BodySide;
use crate::record::ProcessedRecord;

/// Pressure-map region codes reported in `pm`.
pub const PRESSURE_REGIONS: [&str; 6] = ["00", "01", "02", "10", "11", "12"];

pub fn init_topic(client_id: &str) -> String {
    format!("sb/init/{}", client_id)
}

pub fn response_topic(client_id: &str) -> String {
    format!("sb/response/{}", client_id)
}

pub fn record_topic(client_id: &str) -> String {
    format!("sb/record/{}", client_id)
}

/// Handshake payload sent on the init topic.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct InitMessage {
    #[serde(rename = "s")]
    pub client_id: String,
}

/// One processed record as published on the record topic.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TelemetryMessage {
    #[serde(rename = "s")]
    pub client_id: String,
    /// `"1"` for the first record of a session, `"0"` afterwards.
    pub init: String,
    #[serde(rename = "ev")]
    pub event: String,
    /// Unix seconds, corrected by the broker time offset.
    #[serde(rename = "t")]
    pub unix_time: i64,
    pub data: RecordData,
}

/// Metric block of a [`TelemetryMessage`]. Undefined metrics are empty
/// strings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RecordData {
    /// Temperature.
    pub te: String,
    /// Humidity.
    pub hu: String,
    /// Heart rate.
    pub hf: String,
    /// Breathing rate.
    pub bf: String,
    /// Noise level.
    pub no: String,
    /// Position index.
    pub ps: String,
    /// Pressure map regions.
    pub pm: BTreeMap<String, String>,
    pub sk: String,
    pub iq: BTreeMap<String, String>,
}

fn int_str(value: Option<f64>) -> String {
    value
        .filter(|v| v.is_finite())
        .map(|v| format!("{}", v.round() as i64))
        .unwrap_or_default()
}

impl TelemetryMessage {
    pub fn from_record(
        client_id: &str,
        record: &ProcessedRecord,
        first_in_session: bool,
        unix_time: i64,
        noise_level: &str,
    ) -> Self {
        let data = RecordData {
            te: int_str(record.temperature),
            hu: int_str(record.humidity),
            hf: int_str(record.vitals.heart_rate),
            bf: int_str(record.vitals.respiratory_rate),
            no: noise_level.to_string(),
            ps: record
                .position
                .index()
                .map(|i| i.to_string())
                .unwrap_or_default(),
            pm: PRESSURE_REGIONS
                .iter()
                .map(|code| (code.to_string(), "0".to_string()))
                .collect(),
            sk: "1".into(),
            iq: BTreeMap::new(),
        };

        Self {
            client_id: client_id.to_string(),
            init: if first_in_session { "1" } else { "0" }.into(),
            event: "0".into(),
            unix_time,
            data,
        }
    }
}

#[derive(Error, Debug)]
pub enum ControlMessageError {
    #[error("not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("expected a JSON object")]
    NotAnObject,
    #[error("field {field} has an invalid value: {value}")]
    InvalidField { field: &'static str, value: String },
    #[error("no recognised field")]
    Empty,
}

/// Broker acknowledgment on the response topic.
///
/// Either field alone is a valid acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlMessage {
    /// Broker clock in unix seconds.
    pub time: Option<i64>,
    pub side: Option<BodySide>,
}

impl ControlMessage {
    pub fn parse(payload: &[u8]) -> Result<Self, ControlMessageError> {
        let value: Value = serde_json::from_slice(payload)?;
        let Value::Object(fields) = value else {
            return Err(ControlMessageError::NotAnObject);
        };

        let time = fields
            .get("t")
            .map(|v| {
                let parsed = match v {
                    Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
                    Value::String(s) => s.trim().parse::<i64>().ok(),
                    _ => None,
                };
                parsed.ok_or_else(|| ControlMessageError::InvalidField {
                    field: "t",
                    value: v.to_string(),
                })
            })
            .transpose()?;

        let side = fields
            .get("side")
            .map(|v| {
                v.as_str()
                    .and_then(BodySide::parse)
                    .ok_or_else(|| ControlMessageError::InvalidField {
                        field: "side",
                        value: v.to_string(),
                    })
            })
            .transpose()?;

        if time.is_none() && side.is_none() {
            return Err(ControlMessageError::Empty);
        }
        Ok(Self { time, side })
    }
}
