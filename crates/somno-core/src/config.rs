use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::position::BodySide;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct NodeConfig {
    /// Identifier used in every topic and message.
    pub client_id: String,
    pub broker: BrokerConfig,
    pub pipeline: PipelineConfig,
    pub storage: StorageConfig,
    pub model: ModelConfig,
    /// Noise level reported on the wire until an audio channel exists.
    pub noise_level: String,
    /// Initial body side; the broker may change it at runtime.
    pub body_side: BodySide,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            client_id: "000001".into(),
            broker: BrokerConfig::default(),
            pipeline: PipelineConfig::default(),
            storage: StorageConfig::default(),
            model: ModelConfig::default(),
            noise_level: "10".into(),
            body_side: BodySide::Right,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keepalive_secs: u64,
    pub reconnect_backoff_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            username: None,
            password: None,
            keepalive_secs: 60,
            reconnect_backoff_secs: 5,
        }
    }
}

impl BrokerConfig {
    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_secs(self.reconnect_backoff_secs)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub rotation_period_ms: u64,
    pub queue_capacity: usize,
    /// Pause between two processed windows.
    pub processing_throttle_ms: u64,
    pub drain_interval_secs: u64,
    pub shutdown_grace_secs: u64,
    pub motion_sample_rate_hz: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            rotation_period_ms: 60_000,
            queue_capacity: 8,
            processing_throttle_ms: 500,
            drain_interval_secs: 30,
            shutdown_grace_secs: 10,
            motion_sample_rate_hz: 20.0,
        }
    }
}

impl PipelineConfig {
    pub fn rotation_period(&self) -> Duration {
        Duration::from_millis(self.rotation_period_ms)
    }

    pub fn processing_throttle(&self) -> Duration {
        Duration::from_millis(self.processing_throttle_ms)
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_secs(self.drain_interval_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    pub backup_root: PathBuf,
    pub debug_dump_root: PathBuf,
    pub debug_dump: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backup_root: PathBuf::from("Backups"),
            debug_dump_root: PathBuf::from("DataStorage"),
            debug_dump: false,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ModelConfig {
    pub artifact: PathBuf,
    pub features: PathBuf,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            artifact: PathBuf::from("PositionModel/model.json"),
            features: PathBuf::from("PositionModel/features.txt"),
        }
    }
}
