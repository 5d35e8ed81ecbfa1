//! Host binary for the somno bed telemetry node.
//!
//! Wires synthetic sensor sources into the somno-core pipeline and delivers
//! processed windows to an MQTT broker. Runs until Ctrl-C, then shuts down
//! in order so that nothing accepted is lost.
//!
//! # Environment
//!
//! | Variable          | Meaning                                       |
//! |-------------------|-----------------------------------------------|
//! | `SOMNO_CONFIG`    | JSON config file applied before overrides     |
//! | `SOMNO_CLIENT_ID` | Client id used in topics and messages         |
//! | `SOMNO_BROKER_*`  | Broker host, port, username, password         |
//! | `SOMNO_MODEL`     | Position model artifact                       |
//! | `SOMNO_FEATURES`  | Feature list for the model                    |
//! | `RUST_LOG`        | Log filter, `info` by default                 |
//!
//! See [`settings`] for the full list.

mod settings;
mod synthetic;

use std::process::ExitCode;
use std::sync::Arc;

use log::{error, info, warn};
use somno_core::config::NodeConfig;
use somno_core::pipeline::{NodeError, Pipeline};
use somno_core::position::{
    ClassifierLoadError, PositionClassifier, SharedBodySide, load_linear_model,
};
use somno_core::sensors::SensorSource;
use somno_core::signal::{ProcessingError, SignalProcessor};
use somno_core::storage::{BackupStore, DebugDump};
use somno_core::telemetry::{MqttTransport, TelemetryPublisher};
use thiserror::Error;

use settings::ConfigError;
use synthetic::SyntheticSource;

#[derive(Error, Debug)]
enum StartupError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("position model: {0}")]
    Model(#[from] ClassifierLoadError),
    #[error("signal processor: {0}")]
    Processing(#[from] ProcessingError),
    #[error("{0}")]
    Node(#[from] NodeError),
    #[error("cannot install signal handler: {0}")]
    Signal(#[from] ctrlc::Error),
    #[error("cannot spawn MQTT session: {0}")]
    Session(#[source] std::io::Error),
}

fn main() -> ExitCode {
    // A missing .env file is normal.
    let dotenv = dotenvy::dotenv();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Ok(path) = dotenv {
        info!("[node] loaded {}", path.display());
    }

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("[node] {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<(), StartupError> {
    let config = settings::load()?;
    info!(
        "[node] client {} -> {}:{}",
        config.client_id, config.broker.host, config.broker.port
    );

    let side = SharedBodySide::new(config.body_side);
    let (layout, model) = load_linear_model(&config.model.artifact, &config.model.features)?;
    info!(
        "[node] position model {} with {} features",
        config.model.artifact.display(),
        layout.len()
    );
    let classifier = PositionClassifier::new(layout, Arc::new(model), side.clone())?;
    let processor = SignalProcessor::new(config.pipeline.motion_sample_rate_hz)?;
    let debug_dump = open_debug_dump(&config);

    let (transport, session) = MqttTransport::new(&config.client_id, &config.broker);
    let publisher = Arc::new(TelemetryPublisher::new(
        transport.clone(),
        config.client_id.clone(),
        config.noise_level.clone(),
        BackupStore::new(&config.storage.backup_root),
        side,
    ));

    let (session_stop, session_stop_rx) = crossbeam_channel::bounded::<()>(0);
    let session = session
        .spawn(publisher.clone(), session_stop_rx)
        .map_err(StartupError::Session)?;

    let sources: Vec<Box<dyn SensorSource>> = vec![
        Box::new(SyntheticSource::pressure()),
        Box::new(SyntheticSource::motion(config.pipeline.motion_sample_rate_hz)),
        Box::new(SyntheticSource::environment()),
    ];
    let mut pipeline = Pipeline::start(
        &config.pipeline,
        processor,
        classifier,
        publisher,
        sources,
        debug_dump,
    )?;

    let (interrupt, interrupted) = crossbeam_channel::bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = interrupt.try_send(());
    })?;
    info!("[node] running, Ctrl-C to stop");
    let _ = interrupted.recv();

    info!("[node] interrupt received");
    let report = pipeline.shutdown(config.pipeline.shutdown_grace());
    info!(
        "[node] final drain: {} backup(s), {} queued; {} message(s) left on disk",
        report.final_drain.backups_sent, report.final_drain.memory_sent, report.persisted
    );

    transport.disconnect();
    drop(session_stop);
    if session.join().is_err() {
        warn!("[node] MQTT session thread panicked");
    }
    info!("[node] stopped");
    Ok(())
}

/// Debug dumps are optional; failing to create the folder only disables them.
fn open_debug_dump(config: &NodeConfig) -> Option<DebugDump> {
    if !config.storage.debug_dump {
        return None;
    }
    match DebugDump::create(&config.storage.debug_dump_root) {
        Ok(dump) => Some(dump),
        Err(e) => {
            warn!("[node] debug dump disabled: {}", e);
            None
        }
    }
}
