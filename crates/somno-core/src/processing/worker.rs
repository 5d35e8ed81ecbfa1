use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use log::{debug, error, info, warn};

use super::ProcessingQueue;
use crate::position::PositionClassifier;
use crate::record::ProcessedRecord;
use crate::signal::{ProcessingError, SignalProcessor};
use crate::storage::{DebugDump, PerformanceCounters};
use crate::window::Window;

/// Single consumer of the processing queue.
///
/// Each window is reduced to one [`ProcessedRecord`] or skipped entirely on
/// error. A fixed pause between windows bounds CPU load on the device.
pub struct ProcessingWorker {
    queue: Arc<ProcessingQueue>,
    processor: SignalProcessor,
    classifier: PositionClassifier,
    throttle: Duration,
    output: Sender<ProcessedRecord>,
    dump: Option<DebugDump>,
}

impl ProcessingWorker {
    pub fn new(
        queue: Arc<ProcessingQueue>,
        processor: SignalProcessor,
        classifier: PositionClassifier,
        throttle: Duration,
        output: Sender<ProcessedRecord>,
    ) -> Self {
        Self {
            queue,
            processor,
            classifier,
            throttle,
            output,
            dump: None,
        }
    }

    /// Write a diagnostic file for every processed window.
    pub fn with_debug_dump(mut self, dump: DebugDump) -> Self {
        self.dump = Some(dump);
        self
    }

    /// Reduce one window. Nothing is emitted on error.
    pub fn process(&self, window: &Window) -> Result<ProcessedRecord, ProcessingError> {
        let started = Instant::now();
        let analysis = self
            .processor
            .analyze(window.motion())
            .map_err(|e| ProcessingError::Window {
                window: window.id(),
                reason: e.to_string(),
            })?;
        let position = self.classifier.classify_window(window.pressure());
        let record = ProcessedRecord::new(window, analysis.metrics, position);

        if let Some(dump) = &self.dump {
            let counters = PerformanceCounters {
                processing_ms: started.elapsed().as_secs_f64() * 1000.0,
                queue_depth: self.queue.len(),
                evicted_windows: self.queue.evicted(),
            };
            match dump.write(window, &analysis, &position, counters) {
                Ok(path) => debug!("[worker] dumped window {} to {}", window.id(), path.display()),
                Err(e) => warn!("[worker] debug dump failed for window {}: {}", window.id(), e),
            }
        }
        Ok(record)
    }

    /// Drain the queue until it is closed and empty.
    pub fn run(self) {
        info!("[worker] started");
        while let Some(window) = self.queue.pop() {
            match self.process(&window) {
                Ok(record) => {
                    info!(
                        "[worker] window {}: rr={:?} hr={:?} hrv={:?} position={:?}",
                        record.window_id,
                        record.vitals.respiratory_rate,
                        record.vitals.heart_rate,
                        record.vitals.heart_rate_variability,
                        record.position.label,
                    );
                    if self.output.send(record).is_err() {
                        error!("[worker] record consumer is gone, stopping");
                        break;
                    }
                }
                Err(e) => error!("[worker] skipped: {}", e),
            }

            if !self.queue.is_closed() {
                std::thread::sleep(self.throttle);
            }
        }
        info!("[worker] stopped");
    }

    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("window-processing".into())
            .spawn(move || self.run())
    }
}
