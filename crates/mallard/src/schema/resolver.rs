//! Schema resolution and the binding cache.
//!
//! [`SchemaResolver`] turns a `(topic, role)` pair into a
//! [`ResolvedSchema`] by following the topic's serde directive, consulting
//! the registry where needed. Results are cached for the lifetime of the
//! engine with single-flight semantics: concurrent callers for the same
//! binding wait on the in-flight resolution instead of racing a duplicate.
//!
//! Resolution never fails outward: when a schema cannot be fetched or
//! parsed, the binding deliberately falls back to the `binary` serde so
//! ingest stays available.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::schema::registry::{parse_schema_text, RegistryClient};
use crate::schema::{PrimitiveTag, ResolvedSchema, Role, SerdeSpec};

type CacheKey = (String, Role);

/// Resolves and caches schema bindings per `(topic, role)`.
pub struct SchemaResolver {
    config: Arc<EngineConfig>,
    registry: Option<RegistryClient>,
    cache: Mutex<HashMap<CacheKey, Arc<OnceCell<ResolvedSchema>>>>,
    /// Ids handed to inline schemas the registry never saw. Counts down
    /// from -1 so they can never collide with registry ids.
    inline_ids: AtomicI32,
}

impl SchemaResolver {
    /// Creates a resolver for the given configuration, opening a registry
    /// client when a URL is configured.
    #[must_use]
    pub fn new(config: Arc<EngineConfig>) -> Self {
        let registry = RegistryClient::from_urls(config.schema_registry_urls());
        Self {
            config,
            registry,
            cache: Mutex::new(HashMap::new()),
            inline_ids: AtomicI32::new(0),
        }
    }

    /// Returns the registry client, if remote resolution is enabled.
    #[must_use]
    pub fn registry(&self) -> Option<&RegistryClient> {
        self.registry.as_ref()
    }

    /// Resolves the binding for a topic role, from cache when available.
    pub async fn resolve(&self, topic: &str, role: Role) -> ResolvedSchema {
        let cell = {
            let mut cache = self.cache.lock();
            cache
                .entry((topic.to_string(), role))
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };
        cell.get_or_init(|| self.resolve_uncached(topic, role))
            .await
            .clone()
    }

    /// Drops registry resources, including any mock scope state.
    pub fn close(&self) {
        if let Some(registry) = &self.registry {
            registry.close();
        }
    }

    async fn resolve_uncached(&self, topic: &str, role: Role) -> ResolvedSchema {
        let spec = self.config.serde_for(topic, role);
        let subject = role.subject(topic);

        match spec {
            SerdeSpec::Primitive(tag) => ResolvedSchema::Primitive(tag),
            SerdeSpec::Latest => match self.fetch_latest(&subject).await {
                Ok(resolved) => resolved,
                Err(e) => self.fall_back(&subject, &e),
            },
            SerdeSpec::ById(id) => match self.fetch_by_id(id).await {
                Ok(resolved) => resolved,
                Err(e) => self.fall_back(&subject, &e),
            },
            SerdeSpec::Inline {
                family,
                schema,
                refs,
            } => {
                let parsed = match (&self.registry, refs.is_empty()) {
                    (Some(registry), _) => registry.parse(family, &schema, &refs).await,
                    (None, true) => parse_schema_text(family, &schema, &[]),
                    (None, false) => Err(EngineError::Resolve(
                        "inline schema references require a registry".into(),
                    )),
                };
                match parsed {
                    Ok(parsed) => {
                        let id = self.next_inline_id();
                        debug!(subject = %subject, id, "parsed inline schema");
                        ResolvedSchema::Parsed {
                            id,
                            schema: Arc::new(parsed),
                        }
                    }
                    Err(e) => self.fall_back(&subject, &e),
                }
            }
        }
    }

    async fn fetch_latest(&self, subject: &str) -> Result<ResolvedSchema, EngineError> {
        let registry = self.registry.as_ref().ok_or_else(|| {
            EngineError::Resolve("no schema registry configured".into())
        })?;
        let held = registry.latest_for_subject(subject).await?;
        let parsed = registry.parse(held.family, &held.schema, &held.refs).await?;
        Ok(ResolvedSchema::Parsed {
            id: held.id,
            schema: Arc::new(parsed),
        })
    }

    async fn fetch_by_id(&self, id: i32) -> Result<ResolvedSchema, EngineError> {
        let registry = self.registry.as_ref().ok_or_else(|| {
            EngineError::Resolve("no schema registry configured".into())
        })?;
        let held = registry.by_id(id).await?;
        let parsed = registry.parse(held.family, &held.schema, &held.refs).await?;
        Ok(ResolvedSchema::Parsed {
            id,
            schema: Arc::new(parsed),
        })
    }

    /// The availability policy: an unresolvable binding becomes `binary`.
    fn fall_back(&self, subject: &str, cause: &EngineError) -> ResolvedSchema {
        warn!(subject = %subject, error = %cause, "schema resolution failed, falling back to binary");
        ResolvedSchema::Primitive(PrimitiveTag::Binary)
    }

    fn next_inline_id(&self) -> i32 {
        self.inline_ids.fetch_sub(1, Ordering::Relaxed) - 1
    }
}

impl std::fmt::Debug for SchemaResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaResolver")
            .field("registry", &self.registry)
            .field("cached_bindings", &self.cache.lock().len())
            .finish()
    }
}
