//! Node configuration: defaults, an optional JSON file, then `SOMNO_*`
//! environment overrides.

use std::path::PathBuf;
use std::str::FromStr;

use log::info;
use somno_core::config::NodeConfig;
use somno_core::position::BodySide;
use thiserror::Error;

/// Points at a JSON file holding a full or partial [`NodeConfig`].
pub const CONFIG_FILE_VAR: &str = "SOMNO_CONFIG";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: &'static str, value: String },
}

/// Load from the process environment.
pub fn load() -> Result<NodeConfig, ConfigError> {
    load_with(|key| std::env::var(key).ok())
}

/// Load using `lookup` to read variables.
pub fn load_with(lookup: impl Fn(&str) -> Option<String>) -> Result<NodeConfig, ConfigError> {
    let mut config = match lookup(CONFIG_FILE_VAR) {
        Some(path) => {
            let path = PathBuf::from(path);
            let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;
            info!("[config] loaded {}", path.display());
            serde_json::from_str(&text).map_err(|source| ConfigError::Parse { path, source })?
        }
        None => NodeConfig::default(),
    };
    apply_overrides(&mut config, &lookup)?;
    Ok(config)
}

fn parse<T: FromStr>(key: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue { key, value })
}

fn apply_overrides(
    config: &mut NodeConfig,
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    macro_rules! set {
        ($key:literal => $field:expr) => {
            if let Some(value) = lookup($key) {
                $field = parse($key, value)?;
            }
        };
    }

    if let Some(id) = lookup("SOMNO_CLIENT_ID") {
        config.client_id = id;
    }
    set!("SOMNO_BROKER_HOST" => config.broker.host);
    set!("SOMNO_BROKER_PORT" => config.broker.port);
    if let Some(user) = lookup("SOMNO_BROKER_USERNAME") {
        config.broker.username = Some(user);
    }
    if let Some(password) = lookup("SOMNO_BROKER_PASSWORD") {
        config.broker.password = Some(password);
    }
    set!("SOMNO_KEEPALIVE_SECS" => config.broker.keepalive_secs);
    set!("SOMNO_RECONNECT_BACKOFF_SECS" => config.broker.reconnect_backoff_secs);

    set!("SOMNO_ROTATION_PERIOD_MS" => config.pipeline.rotation_period_ms);
    set!("SOMNO_QUEUE_CAPACITY" => config.pipeline.queue_capacity);
    set!("SOMNO_PROCESSING_THROTTLE_MS" => config.pipeline.processing_throttle_ms);
    set!("SOMNO_DRAIN_INTERVAL_SECS" => config.pipeline.drain_interval_secs);
    set!("SOMNO_SHUTDOWN_GRACE_SECS" => config.pipeline.shutdown_grace_secs);
    set!("SOMNO_MOTION_SAMPLE_RATE_HZ" => config.pipeline.motion_sample_rate_hz);

    set!("SOMNO_BACKUP_ROOT" => config.storage.backup_root);
    set!("SOMNO_DEBUG_DUMP_ROOT" => config.storage.debug_dump_root);
    set!("SOMNO_DEBUG_DUMP" => config.storage.debug_dump);
    set!("SOMNO_MODEL" => config.model.artifact);
    set!("SOMNO_FEATURES" => config.model.features);

    if let Some(noise) = lookup("SOMNO_NOISE_LEVEL") {
        config.noise_level = noise;
    }
    if let Some(value) = lookup("SOMNO_BODY_SIDE") {
        config.body_side = BodySide::parse(&value).ok_or(ConfigError::InvalidValue {
            key: "SOMNO_BODY_SIDE",
            value,
        })?;
    }

    if config.pipeline.queue_capacity == 0 {
        return Err(ConfigError::InvalidValue {
            key: "SOMNO_QUEUE_CAPACITY",
            value: "0".into(),
        });
    }
    if config.pipeline.drain_interval_secs == 0 {
        return Err(ConfigError::InvalidValue {
            key: "SOMNO_DRAIN_INTERVAL_SECS",
            value: "0".into(),
        });
    }
    if config.pipeline.rotation_period_ms == 0 {
        return Err(ConfigError::InvalidValue {
            key: "SOMNO_ROTATION_PERIOD_MS",
            value: "0".into(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_environment() {
        assert_eq!(load_with(env(&[])).unwrap(), NodeConfig::default());
    }

    #[test]
    fn test_environment_overrides() {
        let config = load_with(env(&[
            ("SOMNO_CLIENT_ID", "000042"),
            ("SOMNO_BROKER_HOST", "broker.local"),
            ("SOMNO_BROKER_PORT", "8883"),
            ("SOMNO_ROTATION_PERIOD_MS", "30000"),
            ("SOMNO_DEBUG_DUMP", "true"),
            ("SOMNO_BODY_SIDE", "L"),
        ]))
        .unwrap();

        assert_eq!(config.client_id, "000042");
        assert_eq!(config.broker.host, "broker.local");
        assert_eq!(config.broker.port, 8883);
        assert_eq!(config.pipeline.rotation_period_ms, 30_000);
        assert!(config.storage.debug_dump);
        assert_eq!(config.body_side, BodySide::Left);
        assert_eq!(config.pipeline.queue_capacity, 8);
    }

    #[test]
    fn test_invalid_values_fail() {
        let err = load_with(env(&[("SOMNO_BROKER_PORT", "not-a-port")])).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { key: "SOMNO_BROKER_PORT", .. }
        ));
        assert!(load_with(env(&[("SOMNO_BODY_SIDE", "up")])).is_err());
        assert!(load_with(env(&[("SOMNO_QUEUE_CAPACITY", "0")])).is_err());
        assert!(matches!(
            load_with(env(&[("SOMNO_DRAIN_INTERVAL_SECS", "0")])).unwrap_err(),
            ConfigError::InvalidValue { key: "SOMNO_DRAIN_INTERVAL_SECS", .. }
        ));
        assert!(load_with(env(&[("SOMNO_DRAIN_INTERVAL_SECS", "1")])).is_ok());
    }

    #[test]
    fn test_file_then_environment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.json");
        std::fs::write(
            &path,
            r#"{"client_id": "000007", "broker": {"host": "10.0.0.2"}, "pipeline": {"queue_capacity": 4}}"#,
        )
        .unwrap();

        let path = path.to_string_lossy().into_owned();
        let config = load_with(env(&[
            (CONFIG_FILE_VAR, path.as_str()),
            ("SOMNO_QUEUE_CAPACITY", "16"),
        ]))
        .unwrap();

        assert_eq!(config.client_id, "000007");
        assert_eq!(config.broker.host, "10.0.0.2");
        assert_eq!(config.broker.port, 1883);
        assert_eq!(config.pipeline.queue_capacity, 16);
    }

    #[test]
    fn test_unreadable_file_is_an_error() {
        let err = load_with(env(&[(CONFIG_FILE_VAR, "/nonexistent/somno.json")])).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
