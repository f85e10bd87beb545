//! The engine facade.
//!
//! [`IngestEngine`] owns the process-wide lifecycle: `configure` ->
//! `init` -> `sync`/queries -> `close`. Init opens the embedded analytic
//! engine, constructs the schema resolver, and starts one ingest worker
//! per declared topic. The facade also owns the process-wide singleton
//! accessor used by embedding front-ends.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use duckdb::Connection;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::ingest::{spawn_worker, IngestMetricsSnapshot, TopicStatus, WorkerHandle};
use crate::kafka::KafkaSourceFactory;
use crate::schema::resolver::SchemaResolver;
use crate::source::SourceFactory;
use crate::table::TableManager;

const STATE_UNINITIALIZED: u8 = 0;
const STATE_CONFIGURED: u8 = 1;
const STATE_RUNNING: u8 = 2;
const STATE_CLOSED: u8 = 3;

fn state_name(state: u8) -> &'static str {
    match state {
        STATE_CONFIGURED => "Configured",
        STATE_RUNNING => "Running",
        STATE_CLOSED => "Closed",
        _ => "Uninitialized",
    }
}

static INSTANCE: Lazy<Mutex<Option<Arc<IngestEngine>>>> = Lazy::new(|| Mutex::new(None));

/// Builds an [`IngestEngine`], optionally overriding the source factory.
pub struct EngineBuilder {
    source_factory: Arc<dyn SourceFactory>,
}

impl EngineBuilder {
    /// Replaces the log-source factory (tests inject an in-memory source).
    #[must_use]
    pub fn source_factory(mut self, factory: Arc<dyn SourceFactory>) -> Self {
        self.source_factory = factory;
        self
    }

    /// Builds the engine in the `Uninitialized` state.
    #[must_use]
    pub fn build(self) -> IngestEngine {
        IngestEngine {
            state: AtomicU8::new(STATE_UNINITIALIZED),
            source_factory: self.source_factory,
            config: Mutex::new(None),
            resolver: Mutex::new(None),
            tables: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
            shutdown_tx: Mutex::new(None),
        }
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            source_factory: Arc::new(KafkaSourceFactory),
        }
    }
}

/// The ingest-and-query engine facade.
pub struct IngestEngine {
    state: AtomicU8,
    source_factory: Arc<dyn SourceFactory>,
    config: Mutex<Option<Arc<EngineConfig>>>,
    resolver: Mutex<Option<Arc<SchemaResolver>>>,
    tables: Mutex<Option<TableManager>>,
    workers: Mutex<Vec<Arc<WorkerHandle>>>,
    shutdown_tx: Mutex<Option<watch::Sender<bool>>>,
}

impl IngestEngine {
    /// Starts building an engine.
    #[must_use]
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    /// Returns the process-wide engine, constructing it lazily.
    #[must_use]
    pub fn instance() -> Arc<IngestEngine> {
        INSTANCE
            .lock()
            .get_or_insert_with(|| Arc::new(Self::builder().build()))
            .clone()
    }

    /// Closes and discards the process-wide engine, if one exists.
    pub async fn close_instance() {
        let engine = INSTANCE.lock().take();
        if let Some(engine) = engine {
            match engine.close().await {
                Ok(()) | Err(EngineError::Lifecycle { .. }) => {}
                Err(e) => warn!(error = %e, "could not close engine instance"),
            }
        }
    }

    /// Applies a configuration. Idempotent overwrite before `init`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] for an invalid configuration and
    /// [`EngineError::Lifecycle`] once the engine has been initialized.
    pub fn configure(&self, config: EngineConfig) -> Result<(), EngineError> {
        config.validate()?;
        let state = self.state.load(Ordering::Acquire);
        if state != STATE_UNINITIALIZED && state != STATE_CONFIGURED {
            return Err(self.lifecycle_error("Uninitialized or Configured"));
        }
        *self.config.lock() = Some(Arc::new(config));
        self.state.store(STATE_CONFIGURED, Ordering::Release);
        Ok(())
    }

    /// Applies a configuration from a raw key-value map.
    ///
    /// # Errors
    ///
    /// As [`IngestEngine::configure`].
    pub fn configure_map(&self, raw: &HashMap<String, String>) -> Result<(), EngineError> {
        self.configure(EngineConfig::from_map(raw)?)
    }

    /// Opens the analytic engine, constructs the resolver, and starts one
    /// worker per declared topic.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Lifecycle`] unless the engine is
    /// `Configured` (a second `init` fails), [`EngineError::Sink`] when
    /// the analytic engine cannot be opened, and [`EngineError::Source`]
    /// when a topic source cannot be created.
    #[allow(clippy::unused_async)] // worker spawning needs the runtime
    pub async fn init(&self) -> Result<(), EngineError> {
        let config = {
            let state = self.state.load(Ordering::Acquire);
            if state != STATE_CONFIGURED {
                return Err(self.lifecycle_error("Configured"));
            }
            self.config
                .lock()
                .clone()
                .ok_or_else(|| EngineError::Config("engine has no configuration".into()))?
        };

        let conn = Connection::open_in_memory()?;
        let tables = TableManager::new(Arc::new(Mutex::new(conn)));
        let resolver = Arc::new(SchemaResolver::new(config.clone()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut workers = Vec::with_capacity(config.topics().len());
        for topic in config.topics() {
            match self.source_factory.create(topic, &config) {
                Ok(source) => workers.push(Arc::new(spawn_worker(
                    topic.clone(),
                    source,
                    resolver.clone(),
                    tables.clone(),
                    shutdown_rx.clone(),
                ))),
                Err(e) => {
                    // Unwind the workers already started.
                    let _ = shutdown_tx.send(true);
                    resolver.close();
                    return Err(e);
                }
            }
        }

        *self.tables.lock() = Some(tables);
        *self.resolver.lock() = Some(resolver);
        *self.workers.lock() = workers;
        *self.shutdown_tx.lock() = Some(shutdown_tx);
        self.state.store(STATE_RUNNING, Ordering::Release);
        info!(topics = config.topics().len(), "engine initialized");
        Ok(())
    }

    /// Blocks until every worker has caught up to the high-water marks
    /// observed when the barrier was requested.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Lifecycle`] unless the engine is `Running`.
    pub async fn sync(&self) -> Result<(), EngineError> {
        if self.state.load(Ordering::Acquire) != STATE_RUNNING {
            return Err(self.lifecycle_error("Running"));
        }
        let workers: Vec<Arc<WorkerHandle>> = self.workers.lock().clone();

        // Request every barrier first so all workers observe marks close
        // to the call time, then await them.
        let barriers: Vec<_> = workers
            .iter()
            .filter_map(|worker| worker.request_sync())
            .collect();
        for barrier in barriers {
            let _ = barrier.await;
        }
        Ok(())
    }

    /// Stops workers, drains pending inserts, and closes the analytic
    /// engine. Per-resource close failures are logged, not propagated.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Lifecycle`] unless the engine is `Running`.
    pub async fn close(&self) -> Result<(), EngineError> {
        if self.state.load(Ordering::Acquire) != STATE_RUNNING {
            return Err(self.lifecycle_error("Running"));
        }

        if let Some(shutdown) = self.shutdown_tx.lock().take() {
            let _ = shutdown.send(true);
        }
        let workers: Vec<Arc<WorkerHandle>> = self.workers.lock().drain(..).collect();
        for worker in &workers {
            if let Some(join) = worker.take_join() {
                if let Err(e) = join.await {
                    warn!(topic = worker.topic(), error = %e, "worker join failed");
                }
            }
        }

        if let Some(resolver) = self.resolver.lock().take() {
            resolver.close();
        }
        *self.tables.lock() = None;
        *self.config.lock() = None;

        self.state.store(STATE_CLOSED, Ordering::Release);
        info!("engine closed");
        Ok(())
    }

    /// Returns the analytic engine connection for queries.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Lifecycle`] unless the engine is `Running`.
    pub fn connection(&self) -> Result<Arc<Mutex<Connection>>, EngineError> {
        if self.state.load(Ordering::Acquire) != STATE_RUNNING {
            return Err(self.lifecycle_error("Running"));
        }
        self.tables
            .lock()
            .as_ref()
            .map(TableManager::connection)
            .ok_or_else(|| self.lifecycle_error("Running"))
    }

    /// Returns a topic's ingest status, if the topic is declared.
    #[must_use]
    pub fn topic_status(&self, topic: &str) -> Option<TopicStatus> {
        self.workers
            .lock()
            .iter()
            .find(|w| w.topic() == topic)
            .map(|w| w.status())
    }

    /// Returns a topic's ingest counters, if the topic is declared.
    #[must_use]
    pub fn topic_metrics(&self, topic: &str) -> Option<IngestMetricsSnapshot> {
        self.workers
            .lock()
            .iter()
            .find(|w| w.topic() == topic)
            .map(|w| w.metrics())
    }

    /// Returns `true` once `init` has completed and before `close`.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_RUNNING
    }

    fn lifecycle_error(&self, expected: &str) -> EngineError {
        EngineError::Lifecycle {
            expected: expected.to_string(),
            actual: state_name(self.state.load(Ordering::Acquire)).to_string(),
        }
    }
}

impl std::fmt::Debug for IngestEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestEngine")
            .field(
                "state",
                &state_name(self.state.load(Ordering::Acquire)),
            )
            .field("workers", &self.workers.lock().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{PrimitiveTag, SerdeSpec};
    use crate::testing::MockLogBroker;

    fn configured_engine(broker: Arc<MockLogBroker>) -> IngestEngine {
        let engine = IngestEngine::builder().source_factory(broker).build();
        engine
            .configure(
                EngineConfig::new()
                    .with_topic("t")
                    .with_value_serde("t", SerdeSpec::Primitive(PrimitiveTag::Long)),
            )
            .unwrap();
        engine
    }

    #[tokio::test]
    async fn operations_in_wrong_state_fail() {
        let engine = IngestEngine::builder().build();
        assert!(matches!(
            engine.init().await,
            Err(EngineError::Lifecycle { .. })
        ));
        assert!(matches!(
            engine.connection(),
            Err(EngineError::Lifecycle { .. })
        ));
    }

    #[test]
    fn configure_rejects_empty_topics() {
        let engine = IngestEngine::builder().build();
        assert!(matches!(
            engine.configure(EngineConfig::new()),
            Err(EngineError::Config(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn double_init_fails() {
        let broker = MockLogBroker::new();
        let engine = configured_engine(broker);
        engine.init().await.unwrap();
        assert!(matches!(engine.init().await, Err(EngineError::Lifecycle { .. })));
        engine.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sync_requires_running() {
        let broker = MockLogBroker::new();
        let engine = configured_engine(broker);
        assert!(matches!(
            engine.sync().await,
            Err(EngineError::Lifecycle { .. })
        ));
        engine.init().await.unwrap();
        engine.sync().await.unwrap();
        engine.close().await.unwrap();
        assert!(matches!(
            engine.sync().await,
            Err(EngineError::Lifecycle { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn close_is_terminal() {
        let broker = MockLogBroker::new();
        let engine = configured_engine(broker);
        engine.init().await.unwrap();
        engine.close().await.unwrap();
        assert!(matches!(
            engine.close().await,
            Err(EngineError::Lifecycle { .. })
        ));
        assert!(!engine.is_running());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn configure_is_an_idempotent_overwrite() {
        let broker = MockLogBroker::new();
        let engine = IngestEngine::builder().source_factory(broker).build();
        engine
            .configure(EngineConfig::new().with_topic("a"))
            .unwrap();
        engine
            .configure(EngineConfig::new().with_topic("b"))
            .unwrap();
        engine.init().await.unwrap();
        assert!(engine.topic_status("b").is_some());
        assert!(engine.topic_status("a").is_none());
        engine.close().await.unwrap();
    }
}
