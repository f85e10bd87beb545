//! Engine configuration.
//!
//! [`EngineConfig`] is built from a string key-value map. Recognized keys
//! are validated into typed fields; everything else is forwarded unchanged
//! to the log-source and registry clients.

use std::collections::HashMap;

use crate::error::EngineError;
use crate::schema::{Role, SerdeSpec};

/// Configuration key listing the topics to ingest.
pub const TOPICS: &str = "topics";
/// Configuration key for the schema registry endpoint(s).
pub const SCHEMA_REGISTRY_URL: &str = "schema.registry.url";
/// Configuration key mapping topics to key serde directives.
pub const KEY_SERDES: &str = "key.serdes";
/// Configuration key mapping topics to value serde directives.
pub const VALUE_SERDES: &str = "value.serdes";
/// Configuration key for the log-source consumer group id.
pub const GROUP_ID: &str = "kafka.group.id";
/// Default consumer group id.
pub const DEFAULT_GROUP_ID: &str = "kawai-1";

/// Typed engine configuration.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    topics: Vec<String>,
    schema_registry_urls: Vec<String>,
    key_serdes: HashMap<String, SerdeSpec>,
    value_serdes: HashMap<String, SerdeSpec>,
    group_id: String,
    passthrough: HashMap<String, String>,
}

impl EngineConfig {
    /// Builds a configuration from a raw key-value map.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] for a missing `topics` key or a
    /// malformed serde directive.
    pub fn from_map(raw: &HashMap<String, String>) -> Result<Self, EngineError> {
        let topics: Vec<String> = raw
            .get(TOPICS)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        if topics.is_empty() {
            return Err(EngineError::Config(format!("missing or empty '{TOPICS}'")));
        }

        let schema_registry_urls = raw
            .get(SCHEMA_REGISTRY_URL)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|u| !u.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let key_serdes = parse_serde_map(raw.get(KEY_SERDES).map(String::as_str))?;
        let value_serdes = parse_serde_map(raw.get(VALUE_SERDES).map(String::as_str))?;

        let group_id = raw
            .get(GROUP_ID)
            .cloned()
            .unwrap_or_else(|| DEFAULT_GROUP_ID.to_string());

        let recognized = [TOPICS, SCHEMA_REGISTRY_URL, KEY_SERDES, VALUE_SERDES, GROUP_ID];
        let passthrough = raw
            .iter()
            .filter(|(k, _)| !recognized.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok(Self {
            topics,
            schema_registry_urls,
            key_serdes,
            value_serdes,
            group_id,
            passthrough,
        })
    }

    /// Starts an empty programmatic configuration.
    #[must_use]
    pub fn new() -> Self {
        Self {
            group_id: DEFAULT_GROUP_ID.to_string(),
            ..Self::default()
        }
    }

    /// Adds a topic to ingest.
    #[must_use]
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topics.push(topic.into());
        self
    }

    /// Sets the schema registry URL.
    #[must_use]
    pub fn with_registry_url(mut self, url: impl Into<String>) -> Self {
        self.schema_registry_urls = vec![url.into()];
        self
    }

    /// Sets the serde directive for a topic key.
    #[must_use]
    pub fn with_key_serde(mut self, topic: impl Into<String>, spec: SerdeSpec) -> Self {
        self.key_serdes.insert(topic.into(), spec);
        self
    }

    /// Sets the serde directive for a topic value.
    #[must_use]
    pub fn with_value_serde(mut self, topic: impl Into<String>, spec: SerdeSpec) -> Self {
        self.value_serdes.insert(topic.into(), spec);
        self
    }

    /// Sets the consumer group id.
    #[must_use]
    pub fn with_group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = group_id.into();
        self
    }

    /// Sets a pass-through client property.
    #[must_use]
    pub fn with_property(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.passthrough.insert(key.into(), value.into());
        self
    }

    /// Validates a programmatically built configuration.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] when no topics are declared.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.topics.is_empty() {
            return Err(EngineError::Config(format!("missing or empty '{TOPICS}'")));
        }
        Ok(())
    }

    /// The topics to ingest.
    #[must_use]
    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    /// The configured registry endpoints; empty disables remote resolution.
    #[must_use]
    pub fn schema_registry_urls(&self) -> &[String] {
        &self.schema_registry_urls
    }

    /// The consumer group id.
    #[must_use]
    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Unrecognized keys, forwarded to the underlying clients.
    #[must_use]
    pub fn passthrough(&self) -> &HashMap<String, String> {
        &self.passthrough
    }

    /// The serde directive for a topic role, with the spec'd defaults:
    /// `binary` for keys, `latest` for values.
    #[must_use]
    pub fn serde_for(&self, topic: &str, role: Role) -> SerdeSpec {
        match role {
            Role::Key => self
                .key_serdes
                .get(topic)
                .cloned()
                .unwrap_or(SerdeSpec::Primitive(crate::schema::PrimitiveTag::Binary)),
            Role::Value => self
                .value_serdes
                .get(topic)
                .cloned()
                .unwrap_or(SerdeSpec::Latest),
        }
    }
}

fn parse_serde_map(raw: Option<&str>) -> Result<HashMap<String, SerdeSpec>, EngineError> {
    let mut map = HashMap::new();
    let Some(raw) = raw else {
        return Ok(map);
    };
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (topic, directive) = entry.split_once('=').ok_or_else(|| {
            EngineError::Config(format!("invalid serde mapping '{entry}'"))
        })?;
        map.insert(topic.trim().to_string(), directive.trim().parse()?);
    }
    Ok(map)
}
