use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::Utc;
use crossbeam_channel::Sender;
use log::{debug, info, warn};
use parking_lot::Mutex;

use super::{ActiveWindow, Window};
use crate::processing::ProcessingQueue;
use crate::schedule::run_periodic;
use crate::sensors::{SampleSink, SensorPayload, Timestamp};

/// Owns the single active window and hands closed windows to the
/// processing queue.
///
/// The lock is held only for an append or a swap, never while a window is
/// being processed, so ingestion cannot stall on a processing backlog.
///
/// ## Rotation
///
/// 1. stamp `end = now` on the active window,
/// 2. swap in a fresh window starting at `now`,
/// 3. push the closed window onto the queue (evicting the oldest pending
///    window if the queue is full).
pub struct WindowAggregator {
    active: Mutex<Option<ActiveWindow>>,
    queue: Arc<ProcessingQueue>,
    next_id: AtomicU64,
    rotations: AtomicU64,
}

impl WindowAggregator {
    pub fn new(queue: Arc<ProcessingQueue>) -> Self {
        Self {
            active: Mutex::new(None),
            queue,
            next_id: AtomicU64::new(1),
            rotations: AtomicU64::new(0),
        }
    }

    /// Append a sample to the active window, opening one if needed.
    pub fn push(&self, timestamp: Timestamp, payload: SensorPayload) {
        let mut active = self.active.lock();
        active
            .get_or_insert_with(|| ActiveWindow::new(timestamp))
            .push(timestamp, payload);
    }

    /// Rotate using the wall clock.
    pub fn rotate(&self) -> Option<u64> {
        self.rotate_at(Utc::now())
    }

    /// Close the active window at `now` and enqueue it.
    ///
    /// Returns the id of the closed window, or `None` when no sample has
    /// arrived yet.
    pub fn rotate_at(&self, now: Timestamp) -> Option<u64> {
        let closed = {
            let mut active = self.active.lock();
            active.replace(ActiveWindow::new(now))
        };

        let Some(closed) = closed else {
            debug!("[aggregator] rotation with no samples yet");
            return None;
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let window = closed.close(id, now);
        self.rotations.fetch_add(1, Ordering::Relaxed);
        info!(
            "[aggregator] closed window {} ({} samples, {} -> {})",
            id,
            window.sample_count(),
            window.start().format("%H:%M:%S%.3f"),
            window.end().format("%H:%M:%S%.3f"),
        );

        if let Some(evicted) = self.queue.push(window) {
            warn!(
                "[aggregator] processing queue full, dropped unprocessed window {} ({} samples)",
                evicted.id(),
                evicted.sample_count()
            );
        }
        Some(id)
    }

    /// Number of windows closed so far.
    pub fn rotations(&self) -> u64 {
        self.rotations.load(Ordering::Relaxed)
    }

    /// Number of closed windows evicted from a full queue.
    pub fn evictions(&self) -> u64 {
        self.queue.evicted()
    }

    /// Samples waiting in the active window.
    pub fn pending_samples(&self) -> usize {
        self.active
            .lock()
            .as_ref()
            .map_or(0, ActiveWindow::sample_count)
    }
}

impl SampleSink for WindowAggregator {
    fn on_sample(&self, timestamp: Timestamp, payload: SensorPayload) {
        self.push(timestamp, payload);
    }
}

/// Dedicated thread that rotates the aggregator on a fixed period,
/// independent of sample arrival.
pub struct RotationTimer {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl RotationTimer {
    pub fn spawn(aggregator: Arc<WindowAggregator>, period: Duration) -> std::io::Result<Self> {
        let (stop, stop_rx) = crossbeam_channel::bounded::<()>(0);
        let handle = std::thread::Builder::new()
            .name("window-rotation".into())
            .spawn(move || {
                info!("[rotation] rotating every {:?}", period);
                run_periodic(period, &stop_rx, || {
                    aggregator.rotate();
                });
                info!("[rotation] stopped");
            })?;

        Ok(Self {
            stop: Some(stop),
            handle: Some(handle),
        })
    }

    /// Stop the timer and wait for the thread to exit.
    pub fn stop(&mut self) {
        self.stop.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("[rotation] timer thread panicked");
            }
        }
    }
}

impl Drop for RotationTimer {
    fn drop(&mut self) {
        self.stop();
    }
}
