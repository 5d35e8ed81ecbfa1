use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use chrono::{Local, NaiveDate, Utc};
use log::{debug, error, info, warn};
use parking_lot::Mutex;

use super::message::{self, ControlMessage, ControlMessageError, InitMessage, TelemetryMessage};
use super::transport::{PublishError, Transport};
use crate::position::SharedBodySide;
use crate::record::ProcessedRecord;
use crate::storage::{BackupError, BackupStore};

/// Connection state as seen by the publisher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LinkState {
    #[default]
    Disconnected,
    Connecting,
    Connected {
        /// Armed by the broker acknowledgment.
        initialized: bool,
    },
}

impl LinkState {
    pub fn is_initialized(self) -> bool {
        matches!(self, LinkState::Connected { initialized: true })
    }
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub backups_sent: usize,
    pub backups_quarantined: usize,
    pub memory_sent: usize,
    /// False when a failure left items for the next pass.
    pub complete: bool,
}

/// Store-and-forward delivery of telemetry messages.
///
/// Messages are never dropped between creation and either a confirmed
/// publish or a backup file. Ordering is oldest first across both stores:
/// backups always drain before the in-memory outbox, and the outbox is
/// spilled to backup in FIFO order.
///
/// The backup store mutex also serialises drains, spills and ingestion so
/// they never interleave partial appends or removals.
pub struct TelemetryPublisher<T: Transport> {
    transport: T,
    client_id: String,
    noise_level: String,
    state: Mutex<LinkState>,
    outbox: Mutex<VecDeque<TelemetryMessage>>,
    backups: Mutex<BackupStore>,
    first_record: AtomicBool,
    /// Broker clock minus local clock, seconds.
    clock_offset: AtomicI64,
    side: SharedBodySide,
}

impl<T: Transport> TelemetryPublisher<T> {
    pub fn new(
        transport: T,
        client_id: impl Into<String>,
        noise_level: impl Into<String>,
        backups: BackupStore,
        side: SharedBodySide,
    ) -> Self {
        warn_stale_backups(&backups, Local::now().date_naive());
        Self {
            transport,
            client_id: client_id.into(),
            noise_level: noise_level.into(),
            state: Mutex::new(LinkState::Disconnected),
            outbox: Mutex::new(VecDeque::new()),
            backups: Mutex::new(backups),
            first_record: AtomicBool::new(true),
            clock_offset: AtomicI64::new(0),
            side,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn state(&self) -> LinkState {
        *self.state.lock()
    }

    /// Messages waiting in memory.
    pub fn outbox_len(&self) -> usize {
        self.outbox.lock().len()
    }

    pub fn clock_offset(&self) -> i64 {
        self.clock_offset.load(Ordering::Relaxed)
    }

    /// Publish raw bytes, logging the outcome.
    pub fn send(&self, topic: &str, payload: &[u8]) -> Result<(), PublishError> {
        match self.transport.publish(topic, payload) {
            Ok(()) => {
                debug!("[publisher] sent {} bytes to {}", payload.len(), topic);
                Ok(())
            }
            Err(e) => {
                error!("[publisher] publish to {} failed: {}", topic, e);
                Err(e)
            }
        }
    }

    /// Wrap a record and route it: straight to backup while the handshake
    /// is pending, otherwise into the outbox followed by an immediate flush.
    pub fn enqueue(&self, record: &ProcessedRecord) {
        let first = self.first_record.swap(false, Ordering::Relaxed);
        let unix_time = Utc::now().timestamp() + self.clock_offset();
        let message = TelemetryMessage::from_record(
            &self.client_id,
            record,
            first,
            unix_time,
            &self.noise_level,
        );

        let mut store = self.backups.lock();
        if !self.state().is_initialized() {
            // Older messages stuck in memory go to disk first, or this one
            // waits behind them.
            self.spill_locked(&mut store);
            let mut outbox = self.outbox.lock();
            if !outbox.is_empty() {
                warn!(
                    "[publisher] backups unavailable, window {} queued behind {} in memory",
                    record.window_id,
                    outbox.len()
                );
                outbox.push_back(message);
                return;
            }
            drop(outbox);

            match store.persist(&message) {
                Ok(path) => debug!(
                    "[publisher] link not ready, window {} backed up to {}",
                    record.window_id,
                    path.display()
                ),
                Err(e) => {
                    error!(
                        "[publisher] backup of window {} failed, keeping it in memory: {}",
                        record.window_id, e
                    );
                    self.outbox.lock().push_back(message);
                }
            }
            return;
        }

        self.outbox.lock().push_back(message);
        let report = self.drain_locked(&mut store);
        if !report.complete {
            self.spill_locked(&mut store);
        }
    }

    pub fn on_transport_connecting(&self) {
        *self.state.lock() = LinkState::Connecting;
        info!("[publisher] connecting");
    }

    /// Subscribe to the response topic and send the init message.
    ///
    /// The link stays uninitialized until [`on_external_ack`](Self::on_external_ack).
    pub fn on_transport_connected(&self) {
        *self.state.lock() = LinkState::Connected { initialized: false };
        info!("[publisher] connected, waiting for broker acknowledgment");

        let response = message::response_topic(&self.client_id);
        if let Err(e) = self.transport.subscribe(&response) {
            error!("[publisher] subscribe to {} failed: {}", response, e);
        }

        let init = InitMessage {
            client_id: self.client_id.clone(),
        };
        match serde_json::to_vec(&init) {
            Ok(payload) => {
                if self.send(&message::init_topic(&self.client_id), &payload).is_ok() {
                    info!("[publisher] init message sent");
                }
            }
            Err(e) => error!("[publisher] cannot encode init message: {}", e),
        }
    }

    /// Drop to `Disconnected` and move the outbox to disk.
    pub fn on_transport_disconnected(&self) {
        let previous = std::mem::replace(&mut *self.state.lock(), LinkState::Disconnected);
        if previous != LinkState::Disconnected {
            warn!("[publisher] link lost");
        }
        let mut store = self.backups.lock();
        self.spill_locked(&mut store);
    }

    /// Apply a broker message from the response topic.
    ///
    /// A valid message updates the clock offset and/or body side and arms
    /// `initialized` when connected. Malformed messages change nothing.
    pub fn on_external_ack(&self, payload: &[u8]) -> Result<ControlMessage, ControlMessageError> {
        let control = ControlMessage::parse(payload).inspect_err(|e| {
            warn!("[publisher] ignoring malformed control message: {}", e);
        })?;

        if let Some(t) = control.time {
            let offset = t - Utc::now().timestamp();
            self.clock_offset.store(offset, Ordering::Relaxed);
            info!("[publisher] time sync, offset {} s", offset);
        }
        if let Some(side) = control.side {
            self.side.set(side);
            info!("[publisher] body side set to {:?}", side);
        }

        let mut state = self.state.lock();
        match *state {
            LinkState::Connected { initialized: false } => {
                *state = LinkState::Connected { initialized: true };
                info!("[publisher] handshake complete");
            }
            LinkState::Connected { initialized: true } => {}
            other => debug!("[publisher] acknowledgment while {:?}", other),
        }
        Ok(control)
    }

    /// Deliver backups, then the outbox. Stops at the first failure.
    ///
    /// While the link is not initialized this only retries moving the
    /// outbox to backup.
    pub fn drain(&self) -> DrainReport {
        let mut store = self.backups.lock();
        if !self.state().is_initialized() {
            self.spill_locked(&mut store);
        }
        self.drain_locked(&mut store)
    }

    /// Move everything left in memory to backup, e.g. at shutdown.
    pub fn persist_pending(&self) -> usize {
        let mut store = self.backups.lock();
        self.spill_locked(&mut store)
    }

    fn drain_locked(&self, store: &mut BackupStore) -> DrainReport {
        let mut report = DrainReport::default();
        if !self.state().is_initialized() {
            debug!("[publisher] drain skipped, link not initialized");
            return report;
        }

        let topic = message::record_topic(&self.client_id);

        let pending = match store.pending_today() {
            Ok(pending) => pending,
            Err(e) => {
                error!("[publisher] cannot list backups: {}", e);
                return report;
            }
        };
        if !pending.is_empty() {
            info!("[publisher] draining {} backup(s)", pending.len());
        }
        for path in pending {
            let message = match BackupStore::load(&path) {
                Ok(message) => message,
                Err(BackupError::Corrupt { .. }) => {
                    if BackupStore::quarantine(&path).is_ok() {
                        report.backups_quarantined += 1;
                        continue;
                    }
                    return report;
                }
                Err(e) => {
                    error!("[publisher] {}", e);
                    return report;
                }
            };
            if !self.publish_message(&topic, &message) {
                return report;
            }
            if let Err(e) = BackupStore::remove(&path) {
                // Delivered but still on disk: stop before it can be sent twice in one pass.
                error!("[publisher] sent backup could not be removed: {}", e);
                return report;
            }
            report.backups_sent += 1;
        }
        if let Err(e) = store.prune_empty(Local::now().date_naive()) {
            warn!("[publisher] {}", e);
        }

        loop {
            let Some(message) = self.outbox.lock().front().cloned() else {
                break;
            };
            if !self.publish_message(&topic, &message) {
                return report;
            }
            self.outbox.lock().pop_front();
            report.memory_sent += 1;
        }

        report.complete = true;
        if report.backups_sent + report.memory_sent > 0 {
            info!(
                "[publisher] drained {} backup(s) and {} queued message(s)",
                report.backups_sent, report.memory_sent
            );
        }
        report
    }

    fn publish_message(&self, topic: &str, message: &TelemetryMessage) -> bool {
        match serde_json::to_vec(message) {
            Ok(payload) => self.send(topic, &payload).is_ok(),
            Err(e) => {
                error!("[publisher] cannot encode message: {}", e);
                false
            }
        }
    }

    fn spill_locked(&self, store: &mut BackupStore) -> usize {
        let mut outbox = self.outbox.lock();
        let mut spilled = 0;
        while let Some(message) = outbox.pop_front() {
            if let Err(e) = store.persist(&message) {
                error!("[publisher] spill to backup failed, {} message(s) stay in memory: {}", outbox.len() + 1, e);
                outbox.push_front(message);
                break;
            }
            spilled += 1;
        }
        if spilled > 0 {
            info!("[publisher] moved {} queued message(s) to backup", spilled);
        }
        spilled
    }
}

/// Backups are only drained for the current date. Older ones stay on disk
/// for manual recovery; say so once at startup. Returns the file count.
fn warn_stale_backups(store: &BackupStore, today: NaiveDate) -> usize {
    match store.stale_sessions(today) {
        Ok(stale) => {
            for (folder, count) in &stale {
                warn!(
                    "[publisher] {} backup(s) in {} are from another date and will not be sent",
                    count,
                    folder.display()
                );
            }
            stale.iter().map(|(_, count)| count).sum()
        }
        Err(e) => {
            warn!("[publisher] cannot scan for stale backups: {}", e);
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::{BodySide, PositionSummary};
    use crate::signal::VitalMetrics;
    use std::sync::Arc;

    #[derive(Default)]
    struct MockTransport {
        sent: Mutex<Vec<(String, Vec<u8>)>>,
        subscriptions: Mutex<Vec<String>>,
        /// Publishes allowed before failing; `None` never fails.
        budget: Mutex<Option<usize>>,
    }

    impl MockTransport {
        fn records(&self) -> Vec<TelemetryMessage> {
            self.sent
                .lock()
                .iter()
                .filter(|(topic, _)| topic.starts_with("sb/record/"))
                .map(|(_, payload)| serde_json::from_slice(payload).unwrap())
                .collect()
        }
    }

    impl Transport for MockTransport {
        fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), PublishError> {
            let mut budget = self.budget.lock();
            if let Some(left) = budget.as_mut() {
                if *left == 0 {
                    return Err(PublishError::Transport("injected".into()));
                }
                *left -= 1;
            }
            self.sent.lock().push((topic.to_string(), payload.to_vec()));
            Ok(())
        }

        fn subscribe(&self, topic: &str) -> Result<(), PublishError> {
            self.subscriptions.lock().push(topic.to_string());
            Ok(())
        }
    }

    fn record(id: u64) -> ProcessedRecord {
        let now = Utc::now();
        ProcessedRecord {
            window_id: id,
            init_timestamp: now,
            finish_timestamp: now,
            vitals: VitalMetrics {
                respiratory_rate: Some(id as f64),
                ..VitalMetrics::default()
            },
            position: PositionSummary::default(),
            temperature: None,
            humidity: None,
        }
    }

    fn publisher(dir: &std::path::Path) -> TelemetryPublisher<Arc<MockTransport>> {
        TelemetryPublisher::new(
            Arc::new(MockTransport::default()),
            "000001",
            "10",
            BackupStore::new(dir),
            SharedBodySide::default(),
        )
    }

    fn handshake<T: Transport>(publisher: &TelemetryPublisher<T>) {
        publisher.on_transport_connecting();
        publisher.on_transport_connected();
        publisher.on_external_ack(br#"{"side": "R"}"#).unwrap();
    }

    #[test]
    fn test_connect_subscribes_and_sends_init() {
        let dir = tempfile::tempdir().unwrap();
        let publisher = publisher(dir.path());
        publisher.on_transport_connected();

        let transport = publisher.transport();
        assert_eq!(*transport.subscriptions.lock(), vec!["sb/response/000001".to_string()]);
        let sent = transport.sent.lock();
        assert_eq!(sent[0].0, "sb/init/000001");
        assert_eq!(sent[0].1, br#"{"s":"000001"}"#.to_vec());
        assert_eq!(publisher.state(), LinkState::Connected { initialized: false });
    }

    #[test]
    fn test_uninitialized_records_go_to_backup() {
        let dir = tempfile::tempdir().unwrap();
        let publisher = publisher(dir.path());
        publisher.on_transport_connected();

        for id in 1..=3 {
            publisher.enqueue(&record(id));
        }
        assert!(publisher.transport().records().is_empty());
        assert_eq!(publisher.backups.lock().pending_today().unwrap().len(), 3);
        assert_eq!(publisher.drain(), DrainReport::default());
    }

    #[test]
    fn test_malformed_ack_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let publisher = publisher(dir.path());
        publisher.on_transport_connected();

        assert!(publisher.on_external_ack(b"garbage").is_err());
        assert!(publisher.on_external_ack(b"{\"x\": 1}").is_err());
        assert_eq!(publisher.state(), LinkState::Connected { initialized: false });
    }

    #[test]
    fn test_ack_applies_time_and_side() {
        let dir = tempfile::tempdir().unwrap();
        let publisher = publisher(dir.path());
        publisher.on_transport_connected();

        let broker_time = Utc::now().timestamp() + 3600;
        let payload = format!(r#"{{"t": {}, "side": "left"}}"#, broker_time);
        publisher.on_external_ack(payload.as_bytes()).unwrap();

        assert!(publisher.state().is_initialized());
        assert!((publisher.clock_offset() - 3600).abs() <= 1);
        assert_eq!(publisher.side.get(), BodySide::Left);

        publisher.enqueue(&record(1));
        let sent = publisher.transport().records();
        assert!((sent[0].unix_time - broker_time).abs() <= 2);
    }

    #[test]
    fn test_initialized_sends_immediately_with_init_flag_once() {
        let dir = tempfile::tempdir().unwrap();
        let publisher = publisher(dir.path());
        handshake(&publisher);

        publisher.enqueue(&record(1));
        publisher.enqueue(&record(2));

        let sent = publisher.transport().records();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].init, "1");
        assert_eq!(sent[1].init, "0");
        assert_eq!(publisher.outbox_len(), 0);
    }

    #[test]
    fn test_failed_immediate_send_is_backed_up() {
        let dir = tempfile::tempdir().unwrap();
        let publisher = publisher(dir.path());
        handshake(&publisher);
        *publisher.transport().budget.lock() = Some(0);

        publisher.enqueue(&record(1));
        assert_eq!(publisher.outbox_len(), 0);
        assert_eq!(publisher.backups.lock().pending_today().unwrap().len(), 1);

        *publisher.transport().budget.lock() = None;
        let report = publisher.drain();
        assert_eq!(report.backups_sent, 1);
        assert!(report.complete);
        assert!(publisher.backups.lock().pending_today().unwrap().is_empty());
    }

    #[test]
    fn test_disconnect_spills_outbox_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let publisher = publisher(dir.path());
        // Backup writes fail while the root is a file, so messages stay in memory.
        let blocked = dir.path().join("blocked");
        std::fs::write(&blocked, b"").unwrap();
        let publisher = TelemetryPublisher {
            backups: Mutex::new(BackupStore::new(blocked.join("inner"))),
            ..publisher
        };

        publisher.enqueue(&record(1));
        publisher.enqueue(&record(2));
        assert_eq!(publisher.outbox_len(), 2);

        *publisher.backups.lock() = BackupStore::new(dir.path().join("ok"));
        publisher.on_transport_disconnected();
        assert_eq!(publisher.outbox_len(), 0);

        let pending = publisher.backups.lock().pending_today().unwrap();
        let ids: Vec<String> = pending
            .iter()
            .map(|p| BackupStore::load(p).unwrap().data.bf)
            .collect();
        assert_eq!(ids, vec!["1".to_string(), "2".to_string()]);
    }

    #[test]
    fn test_stale_backups_reported_but_not_drained() {
        let dir = tempfile::tempdir().unwrap();
        let today = Local::now().date_naive();
        let last_week = today - chrono::TimeDelta::days(7);
        let mut old_run = BackupStore::new(dir.path());
        let message = TelemetryMessage::from_record("000001", &record(1), true, 0, "10");
        old_run.persist_at(&message, last_week.and_hms_opt(22, 0, 0).unwrap()).unwrap();

        assert_eq!(warn_stale_backups(&BackupStore::new(dir.path()), today), 1);

        let publisher = publisher(dir.path());
        handshake(&publisher);
        assert_eq!(publisher.drain().backups_sent, 0);
        assert!(publisher.transport().records().is_empty());
        assert_eq!(publisher.backups.lock().stale_sessions(today).unwrap().len(), 1);
    }

    /// Publisher whose backup root is a plain file, so every write fails.
    fn blocked_publisher(dir: &std::path::Path) -> TelemetryPublisher<Arc<MockTransport>> {
        let blocked = dir.join("blocked");
        std::fs::write(&blocked, b"").unwrap();
        publisher(&blocked.join("inner"))
    }

    #[test]
    fn test_backup_recovery_keeps_creation_order() {
        let dir = tempfile::tempdir().unwrap();
        let publisher = blocked_publisher(dir.path());

        publisher.enqueue(&record(1));
        assert_eq!(publisher.outbox_len(), 1);

        // Disk comes back: the stuck message is written before the new one.
        *publisher.backups.lock() = BackupStore::new(dir.path().join("ok"));
        publisher.enqueue(&record(2));
        assert_eq!(publisher.outbox_len(), 0);

        handshake(&publisher);
        let report = publisher.drain();
        assert_eq!(report.backups_sent, 2);
        let sent: Vec<String> = publisher
            .transport()
            .records()
            .into_iter()
            .map(|m| m.data.bf)
            .collect();
        assert_eq!(sent, vec!["1".to_string(), "2".to_string()]);
    }

    #[test]
    fn test_records_queue_behind_unpersisted_ones() {
        let dir = tempfile::tempdir().unwrap();
        let publisher = blocked_publisher(dir.path());

        publisher.enqueue(&record(1));
        publisher.enqueue(&record(2));
        assert_eq!(publisher.outbox_len(), 2);
        assert_eq!(publisher.drain(), DrainReport::default());
        assert_eq!(publisher.outbox_len(), 2);
    }

    #[test]
    fn test_drain_tick_retries_backup_while_uninitialized() {
        let dir = tempfile::tempdir().unwrap();
        let publisher = blocked_publisher(dir.path());
        publisher.on_transport_connected();

        publisher.enqueue(&record(1));
        assert_eq!(publisher.outbox_len(), 1);

        *publisher.backups.lock() = BackupStore::new(dir.path().join("ok"));
        let report = publisher.drain();
        assert!(!report.complete);
        assert_eq!(publisher.outbox_len(), 0);
        assert_eq!(publisher.backups.lock().pending_today().unwrap().len(), 1);
        assert!(publisher.transport().records().is_empty());
    }
}
