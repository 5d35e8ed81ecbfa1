//! Thread wiring of the whole node
//!
//! ```text
//! sources ──► WindowAggregator ──rotation──► ProcessingQueue ──► worker
//!                                                               │
//!                                  records (bounded channel)   ◄┘
//!                                          │
//!                         ingest loop ──► TelemetryPublisher ◄── drain ticker
//! ```

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Sender, select};
use log::{error, info, warn};
use thiserror::Error;

use crate::config::PipelineConfig;
use crate::position::PositionClassifier;
use crate::processing::{ProcessingQueue, ProcessingWorker};
use crate::record::ProcessedRecord;
use crate::sensors::{SampleSink, SensorError, SensorSource};
use crate::signal::SignalProcessor;
use crate::storage::DebugDump;
use crate::telemetry::{DrainReport, TelemetryPublisher, Transport};
use crate::window::{RotationTimer, WindowAggregator};

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("cannot spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("sensor source {name} failed to start: {source}")]
    Source {
        name: &'static str,
        #[source]
        source: SensorError,
    },
}

fn spawn_err(name: &'static str) -> impl FnOnce(std::io::Error) -> NodeError {
    move |source| NodeError::Spawn { name, source }
}

/// What happened during [`Pipeline::shutdown`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Id of the window closed by the final rotation, if any.
    pub final_window: Option<u64>,
    pub final_drain: DrainReport,
    /// Messages written to backup because they could not be delivered.
    pub persisted: usize,
}

/// Running node: every stage on its own thread.
pub struct Pipeline<T: Transport + 'static> {
    aggregator: Arc<WindowAggregator>,
    queue: Arc<ProcessingQueue>,
    publisher: Arc<TelemetryPublisher<T>>,
    sources: Vec<Box<dyn SensorSource>>,
    rotation: Option<RotationTimer>,
    worker: Option<JoinHandle<()>>,
    ingest: Option<JoinHandle<()>>,
    ticker_stop: Option<Sender<()>>,
    ticker: Option<JoinHandle<()>>,
}

impl<T: Transport + 'static> Pipeline<T> {
    /// Spawn the processing, ingest, drain and rotation threads, then start
    /// every sensor source against the aggregator.
    pub fn start(
        config: &PipelineConfig,
        processor: SignalProcessor,
        classifier: PositionClassifier,
        publisher: Arc<TelemetryPublisher<T>>,
        sources: Vec<Box<dyn SensorSource>>,
        debug_dump: Option<DebugDump>,
    ) -> Result<Self, NodeError> {
        let queue = Arc::new(ProcessingQueue::new(config.queue_capacity));
        let aggregator = Arc::new(WindowAggregator::new(queue.clone()));
        let (records_tx, records_rx) =
            crossbeam_channel::bounded::<ProcessedRecord>(config.queue_capacity.max(1));

        let mut worker = ProcessingWorker::new(
            queue.clone(),
            processor,
            classifier,
            config.processing_throttle(),
            records_tx,
        );
        if let Some(dump) = debug_dump {
            worker = worker.with_debug_dump(dump);
        }
        let worker = worker.spawn().map_err(spawn_err("processing"))?;

        let ingest = {
            let publisher = publisher.clone();
            std::thread::Builder::new()
                .name("telemetry-ingest".into())
                .spawn(move || {
                    for record in records_rx.iter() {
                        publisher.enqueue(&record);
                    }
                    info!("[pipeline] ingest loop finished");
                })
                .map_err(spawn_err("ingest"))?
        };

        let (ticker_stop, stop_rx) = crossbeam_channel::bounded::<()>(0);
        let ticker = {
            let publisher = publisher.clone();
            let interval = config.drain_interval();
            std::thread::Builder::new()
                .name("drain-ticker".into())
                .spawn(move || {
                    let tick = crossbeam_channel::tick(interval);
                    loop {
                        select! {
                            recv(tick) -> _ => {
                                publisher.drain();
                            }
                            recv(stop_rx) -> _ => break,
                        }
                    }
                })
                .map_err(spawn_err("drain ticker"))?
        };

        let rotation = RotationTimer::spawn(aggregator.clone(), config.rotation_period())
            .map_err(spawn_err("rotation"))?;

        let mut pipeline = Self {
            aggregator,
            queue,
            publisher,
            sources: Vec::with_capacity(sources.len()),
            rotation: Some(rotation),
            worker: Some(worker),
            ingest: Some(ingest),
            ticker_stop: Some(ticker_stop),
            ticker: Some(ticker),
        };

        let sink: Arc<dyn SampleSink> = pipeline.aggregator.clone();
        for mut source in sources {
            let name = source.name();
            if let Err(source_err) = source.start(sink.clone()) {
                error!("[pipeline] source {} failed to start: {}", name, source_err);
                pipeline.shutdown(Duration::ZERO);
                return Err(NodeError::Source {
                    name,
                    source: source_err,
                });
            }
            info!("[pipeline] source {} started", name);
            pipeline.sources.push(source);
        }

        info!(
            "[pipeline] running: window {:?}, queue {}, drain every {:?}",
            config.rotation_period(),
            config.queue_capacity,
            config.drain_interval()
        );
        Ok(pipeline)
    }

    pub fn aggregator(&self) -> &Arc<WindowAggregator> {
        &self.aggregator
    }

    pub fn queue(&self) -> &Arc<ProcessingQueue> {
        &self.queue
    }

    pub fn publisher(&self) -> &Arc<TelemetryPublisher<T>> {
        &self.publisher
    }

    /// Orderly stop.
    ///
    /// Sources and the rotation timer stop first, the active window gets one
    /// final rotation, the queue drains until `grace` elapses, and whatever
    /// cannot be delivered ends up in backup.
    pub fn shutdown(&mut self, grace: Duration) -> ShutdownReport {
        info!("[pipeline] shutting down (grace {:?})", grace);
        let mut report = ShutdownReport::default();

        for source in &mut self.sources {
            source.stop();
        }
        self.sources.clear();

        if let Some(mut rotation) = self.rotation.take() {
            rotation.stop();
            report.final_window = self.aggregator.rotate();
        }

        self.queue.close(Some(Instant::now() + grace));
        join("processing", self.worker.take());
        join("ingest", self.ingest.take());

        report.final_drain = self.publisher.drain();
        report.persisted = self.publisher.persist_pending();

        self.ticker_stop.take();
        join("drain ticker", self.ticker.take());

        info!(
            "[pipeline] stopped: final window {:?}, {} persisted for later delivery",
            report.final_window, report.persisted
        );
        report
    }
}

fn join(name: &str, handle: Option<JoinHandle<()>>) {
    if let Some(handle) = handle {
        if handle.join().is_err() {
            warn!("[pipeline] {} thread panicked", name);
        }
    }
}
