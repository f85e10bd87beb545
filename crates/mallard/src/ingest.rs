//! The per-topic ingest worker.
//!
//! One worker task per topic consumes records in offset order and drives
//! resolve -> decode -> shape -> insert, strictly serial with respect to
//! the topic's table. Per-record failures are logged, counted, and
//! skipped; a rejected insert is fatal and marks the topic degraded. The
//! worker answers sync barriers against the high-water marks observed when
//! the barrier was requested.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::EngineError;
use crate::decode::decode_cell;
use crate::row::shape_row;
use crate::schema::resolver::SchemaResolver;
use crate::schema::Role;
use crate::source::{LogSource, SourceRecord};
use crate::table::{TableManager, TopicBinding};

/// How often processed offsets are committed back to the source.
const COMMIT_INTERVAL: Duration = Duration::from_secs(5);

/// The lifecycle state of a topic's ingest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicStatus {
    /// The worker is consuming records.
    Running,
    /// Ingest halted on a fatal condition; the table stays queryable at
    /// the last committed offset.
    Degraded,
    /// The worker exited cleanly.
    Stopped,
}

const STATUS_RUNNING: u8 = 0;
const STATUS_DEGRADED: u8 = 1;
const STATUS_STOPPED: u8 = 2;

/// Ingest counters for one topic.
#[derive(Debug, Default)]
pub struct IngestMetrics {
    rows: AtomicU64,
    decode_errors: AtomicU64,
    bad_rows: AtomicU64,
    bytes: AtomicU64,
}

impl IngestMetrics {
    fn record_row(&self, bytes: u64) {
        self.rows.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    fn record_bad_row(&self) {
        self.bad_rows.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a point-in-time snapshot.
    #[must_use]
    pub fn snapshot(&self) -> IngestMetricsSnapshot {
        IngestMetricsSnapshot {
            rows: self.rows.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            bad_rows: self.bad_rows.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time snapshot of a topic's ingest counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestMetricsSnapshot {
    /// Rows inserted.
    pub rows: u64,
    /// Records skipped on decode failures.
    pub decode_errors: u64,
    /// Records skipped on row-shape failures.
    pub bad_rows: u64,
    /// Payload bytes processed into rows.
    pub bytes: u64,
}

pub(crate) enum WorkerCommand {
    Sync(oneshot::Sender<()>),
}

/// Handle to a running topic worker.
pub struct WorkerHandle {
    topic: String,
    cmd_tx: mpsc::UnboundedSender<WorkerCommand>,
    status: Arc<AtomicU8>,
    metrics: Arc<IngestMetrics>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerHandle {
    /// The worker's topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// The topic's ingest status.
    #[must_use]
    pub fn status(&self) -> TopicStatus {
        match self.status.load(Ordering::Relaxed) {
            STATUS_DEGRADED => TopicStatus::Degraded,
            STATUS_STOPPED => TopicStatus::Stopped,
            _ => TopicStatus::Running,
        }
    }

    /// A snapshot of the topic's ingest counters.
    #[must_use]
    pub fn metrics(&self) -> IngestMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Requests a sync barrier; the receiver resolves when the worker has
    /// caught up to the high-water marks observed at request time.
    ///
    /// Returns `None` for a worker that is no longer consuming.
    pub(crate) fn request_sync(&self) -> Option<oneshot::Receiver<()>> {
        let (tx, rx) = oneshot::channel();
        match self.cmd_tx.send(WorkerCommand::Sync(tx)) {
            Ok(()) => Some(rx),
            Err(_) => None,
        }
    }

    pub(crate) fn take_join(&self) -> Option<JoinHandle<()>> {
        self.join.lock().take()
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("topic", &self.topic)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// Spawns the ingest worker for one topic.
pub(crate) fn spawn_worker(
    topic: String,
    source: Box<dyn LogSource>,
    resolver: Arc<SchemaResolver>,
    tables: TableManager,
    shutdown: watch::Receiver<bool>,
) -> WorkerHandle {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let status = Arc::new(AtomicU8::new(STATUS_RUNNING));
    let metrics = Arc::new(IngestMetrics::default());

    let worker = Worker {
        topic: topic.clone(),
        source,
        resolver,
        tables,
        shutdown,
        cmd_rx,
        status: status.clone(),
        metrics: metrics.clone(),
        binding: None,
        progress: HashMap::new(),
        pending_syncs: Vec::new(),
    };
    let join = tokio::spawn(worker.run());

    WorkerHandle {
        topic,
        cmd_tx,
        status,
        metrics,
        join: Mutex::new(Some(join)),
    }
}

struct Worker {
    topic: String,
    source: Box<dyn LogSource>,
    resolver: Arc<SchemaResolver>,
    tables: TableManager,
    shutdown: watch::Receiver<bool>,
    cmd_rx: mpsc::UnboundedReceiver<WorkerCommand>,
    status: Arc<AtomicU8>,
    metrics: Arc<IngestMetrics>,
    binding: Option<TopicBinding>,
    /// Last processed offset per partition.
    progress: HashMap<i32, i64>,
    pending_syncs: Vec<(HashMap<i32, i64>, oneshot::Sender<()>)>,
}

impl Worker {
    async fn run(mut self) {
        info!(topic = %self.topic, "ingest worker started");
        let mut last_commit = Instant::now();

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    debug!(topic = %self.topic, "shutdown observed");
                    break;
                }
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(WorkerCommand::Sync(reply)) => self.handle_sync(reply).await,
                    None => break,
                },
                record = self.source.next() => match record {
                    Ok(Some(record)) => {
                        if !self.process_record(record).await {
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!(topic = %self.topic, "source exhausted");
                        break;
                    }
                    Err(e) => {
                        warn!(topic = %self.topic, error = %e, "source error");
                    }
                },
            }

            if last_commit.elapsed() >= COMMIT_INTERVAL {
                if let Err(e) = self.source.commit().await {
                    warn!(topic = %self.topic, error = %e, "offset commit failed");
                }
                last_commit = Instant::now();
            }
        }

        if let Err(e) = self.source.commit().await {
            warn!(topic = %self.topic, error = %e, "final offset commit failed");
        }
        self.status
            .compare_exchange(
                STATUS_RUNNING,
                STATUS_STOPPED,
                Ordering::Relaxed,
                Ordering::Relaxed,
            )
            .ok();
        for (_, reply) in self.pending_syncs.drain(..) {
            let _ = reply.send(());
        }
        info!(topic = %self.topic, "ingest worker stopped");
    }

    /// Processes one record; returns `false` when the worker must stop.
    async fn process_record(&mut self, record: SourceRecord) -> bool {
        if self.binding.is_none() {
            let key_schema = self.resolver.resolve(&self.topic, Role::Key).await;
            let value_schema = self.resolver.resolve(&self.topic, Role::Value).await;
            match self
                .tables
                .bind_topic(&self.topic, &key_schema, &value_schema)
            {
                Ok(binding) => self.binding = Some(binding),
                Err(e) => {
                    error!(topic = %self.topic, error = %e, "failed to bind topic, marking degraded");
                    self.status.store(STATUS_DEGRADED, Ordering::Relaxed);
                    return false;
                }
            }
        }
        let Some(binding) = self.binding.as_ref() else {
            return false;
        };

        let payload_bytes =
            (record.key.as_ref().map_or(0, Vec::len) + record.value.as_ref().map_or(0, Vec::len))
                as u64;

        let row = decode_cell(&binding.key_schema, &binding.key_column, record.key.as_deref())
            .and_then(|key| {
                let value = decode_cell(
                    &binding.value_schema,
                    &binding.value_column,
                    record.value.as_deref(),
                )?;
                shape_row(key, value, &binding.value_column)
            });

        match row {
            Ok(row) => {
                if let Err(e) = self.tables.insert(binding, &row) {
                    // The failed record stays uncommitted for replay.
                    error!(topic = %self.topic, error = %e, "insert rejected, marking degraded");
                    self.status.store(STATUS_DEGRADED, Ordering::Relaxed);
                    return false;
                }
                self.metrics.record_row(payload_bytes);
            }
            Err(EngineError::BadRow(reason)) => {
                warn!(topic = %self.topic, partition = record.partition, offset = record.offset,
                    reason = %reason, "skipping malformed row");
                self.metrics.record_bad_row();
            }
            Err(e) => {
                warn!(topic = %self.topic, partition = record.partition, offset = record.offset,
                    error = %e, "skipping undecodable record");
                self.metrics.record_decode_error();
            }
        }

        self.record_progress(&record);
        true
    }

    fn record_progress(&mut self, record: &SourceRecord) {
        self.progress.insert(record.partition, record.offset);
        self.source.mark_processed(record.partition, record.offset);
        self.resolve_pending_syncs();
    }

    async fn handle_sync(&mut self, reply: oneshot::Sender<()>) {
        match self.source.high_water_marks().await {
            Ok(marks) => {
                if caught_up(&self.progress, &marks) {
                    let _ = reply.send(());
                } else {
                    self.pending_syncs.push((marks, reply));
                }
            }
            Err(e) => {
                warn!(topic = %self.topic, error = %e, "could not fetch high-water marks for sync");
                let _ = reply.send(());
            }
        }
    }

    fn resolve_pending_syncs(&mut self) {
        let mut i = 0;
        while i < self.pending_syncs.len() {
            if caught_up(&self.progress, &self.pending_syncs[i].0) {
                let (_, reply) = self.pending_syncs.remove(i);
                let _ = reply.send(());
            } else {
                i += 1;
            }
        }
    }
}

/// Whether `progress` covers the captured high-water `marks`.
fn caught_up(progress: &HashMap<i32, i64>, marks: &HashMap<i32, i64>) -> bool {
    marks.iter().all(|(partition, high)| {
        *high <= 0
            || progress
                .get(partition)
                .is_some_and(|offset| offset + 1 >= *high)
    })
}
