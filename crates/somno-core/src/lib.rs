//! Hardware-independent core of the somno bed telemetry node
//!
//! This crate contains everything between the sensor drivers and the
//! broker: fixed-duration windowing of pressure, motion and environment
//! samples, background reduction of each window to vital signs and a sleep
//! position, and store-and-forward delivery of the results over MQTT.
//!
//! Sensor drivers and process bootstrap live in the host binary; they only
//! see the [`sensors::SensorSource`] and [`sensors::SampleSink`] traits.

pub mod config;
pub mod pipeline;
pub mod position;
pub mod processing;
pub mod record;
pub mod schedule;
pub mod sensors;
pub mod signal;
pub mod storage;
pub mod telemetry;
pub mod window;
