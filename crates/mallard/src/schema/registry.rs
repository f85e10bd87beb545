//! Schema registry client.
//!
//! [`RegistryClient`] is a lightweight async REST client for the registry's
//! subject/id lookup API, with a by-id cache and support for named schema
//! references. URLs of the sentinel form `mock://<scope>` select a
//! process-local mock registry whose state lives until the scope is dropped
//! on engine close.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::EngineError;
use crate::schema::{JsonSchemaDoc, ParsedSchema, SchemaFamily, SchemaReference};

/// File name given to the root schema when compiling descriptor schemas.
const ROOT_PROTO_FILE: &str = "__root__.proto";

/// A schema as held by the registry.
#[derive(Debug, Clone)]
pub struct SubjectSchema {
    /// The registry-assigned schema id.
    pub id: i32,
    /// The schema family.
    pub family: SchemaFamily,
    /// The schema text.
    pub schema: String,
    /// Named references to other subjects.
    pub refs: Vec<SchemaReference>,
}

// -- Registry REST API body types --

fn default_schema_type() -> String {
    "AVRO".to_string()
}

#[derive(Debug, Serialize, Deserialize)]
struct ReferenceDto {
    name: String,
    subject: String,
    version: i32,
}

#[derive(Deserialize)]
struct SchemaByIdResponse {
    schema: String,
    #[serde(default = "default_schema_type")]
    #[serde(rename = "schemaType")]
    schema_type: String,
    #[serde(default)]
    references: Vec<ReferenceDto>,
}

#[derive(Deserialize)]
struct SchemaVersionResponse {
    id: i32,
    schema: String,
    #[serde(default = "default_schema_type")]
    #[serde(rename = "schemaType")]
    schema_type: String,
    #[serde(default)]
    references: Vec<ReferenceDto>,
}

#[derive(Serialize)]
struct RegisterSchemaRequest {
    schema: String,
    #[serde(rename = "schemaType")]
    schema_type: String,
    references: Vec<ReferenceDto>,
}

#[derive(Deserialize)]
struct RegisterSchemaResponse {
    id: i32,
}

// -- Mock registry scopes --

#[derive(Debug, Default)]
struct MockScope {
    schemas: HashMap<i32, SubjectSchema>,
    /// Subject to schema ids, index + 1 being the version.
    subjects: HashMap<String, Vec<i32>>,
    next_id: i32,
}

static MOCK_SCOPES: Lazy<Mutex<HashMap<String, MockScope>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

enum Backend {
    Remote {
        http: reqwest::Client,
        base_url: String,
    },
    Mock {
        scope: String,
    },
}

/// Async client for the schema registry, `subject -> schema` and
/// `id -> schema`.
pub struct RegistryClient {
    backend: Backend,
    /// Cache of schemas fetched by id.
    by_id_cache: Mutex<HashMap<i32, Arc<SubjectSchema>>>,
}

impl RegistryClient {
    /// Creates a client for the first configured URL, or `None` when no
    /// URL is configured (remote resolution disabled).
    ///
    /// A URL of the form `mock://<scope>` selects the process-local mock
    /// registry.
    #[must_use]
    pub fn from_urls(urls: &[String]) -> Option<Self> {
        let url = urls.iter().find(|u| !u.is_empty())?;
        let backend = match url.strip_prefix("mock://") {
            Some(scope) if !scope.is_empty() => Backend::Mock {
                scope: scope.to_string(),
            },
            _ => Backend::Remote {
                http: reqwest::Client::new(),
                base_url: url.trim_end_matches('/').to_string(),
            },
        };
        Some(Self {
            backend,
            by_id_cache: Mutex::new(HashMap::new()),
        })
    }

    /// Returns `true` when this client talks to a mock scope.
    #[must_use]
    pub fn is_mock(&self) -> bool {
        matches!(self.backend, Backend::Mock { .. })
    }

    /// Fetches the latest schema version for a subject.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Resolve`] if the subject is unknown or the
    /// registry is unreachable.
    pub async fn latest_for_subject(&self, subject: &str) -> Result<SubjectSchema, EngineError> {
        match &self.backend {
            Backend::Mock { scope } => with_scope(scope, |state| {
                let id = state
                    .subjects
                    .get(subject)
                    .and_then(|versions| versions.last().copied())
                    .ok_or_else(|| {
                        EngineError::Resolve(format!("unknown subject '{subject}'"))
                    })?;
                Ok(state.schemas[&id].clone())
            }),
            Backend::Remote { http, base_url } => {
                let url = format!("{base_url}/subjects/{subject}/versions/latest");
                let resp: SchemaVersionResponse = get_json(http, &url).await?;
                self.cache_and_convert(resp.id, resp.schema_type, resp.schema, resp.references)
            }
        }
    }

    /// Fetches a specific schema version for a subject.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Resolve`] if the version is unknown or the
    /// registry is unreachable.
    pub async fn schema_version(
        &self,
        subject: &str,
        version: i32,
    ) -> Result<SubjectSchema, EngineError> {
        match &self.backend {
            Backend::Mock { scope } => with_scope(scope, |state| {
                let id = usize::try_from(version)
                    .ok()
                    .and_then(|v| v.checked_sub(1))
                    .and_then(|idx| state.subjects.get(subject).and_then(|v| v.get(idx)))
                    .copied()
                    .ok_or_else(|| {
                        EngineError::Resolve(format!(
                            "unknown version {version} for subject '{subject}'"
                        ))
                    })?;
                Ok(state.schemas[&id].clone())
            }),
            Backend::Remote { http, base_url } => {
                let url = format!("{base_url}/subjects/{subject}/versions/{version}");
                let resp: SchemaVersionResponse = get_json(http, &url).await?;
                self.cache_and_convert(resp.id, resp.schema_type, resp.schema, resp.references)
            }
        }
    }

    /// Fetches a schema by its global id. Results are cached.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Resolve`] if the id is unknown or the
    /// registry is unreachable.
    pub async fn by_id(&self, id: i32) -> Result<SubjectSchema, EngineError> {
        if let Some(cached) = self.by_id_cache.lock().get(&id) {
            return Ok(cached.as_ref().clone());
        }
        match &self.backend {
            Backend::Mock { scope } => with_scope(scope, |state| {
                state
                    .schemas
                    .get(&id)
                    .cloned()
                    .ok_or_else(|| EngineError::Resolve(format!("unknown schema id {id}")))
            }),
            Backend::Remote { http, base_url } => {
                let url = format!("{base_url}/schemas/ids/{id}");
                let resp: SchemaByIdResponse = get_json(http, &url).await?;
                self.cache_and_convert(id, resp.schema_type, resp.schema, resp.references)
            }
        }
    }

    /// Registers a schema under a subject, returning the assigned id.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Resolve`] if the registry rejects the schema
    /// or is unreachable.
    pub async fn register_schema(
        &self,
        subject: &str,
        family: SchemaFamily,
        schema: &str,
        refs: Vec<SchemaReference>,
    ) -> Result<i32, EngineError> {
        match &self.backend {
            Backend::Mock { scope } => {
                let mut scopes = MOCK_SCOPES.lock();
                let state = scopes.entry(scope.clone()).or_default();
                state.next_id += 1;
                let id = state.next_id;
                state.schemas.insert(
                    id,
                    SubjectSchema {
                        id,
                        family,
                        schema: schema.to_string(),
                        refs,
                    },
                );
                state.subjects.entry(subject.to_string()).or_default().push(id);
                Ok(id)
            }
            Backend::Remote { http, base_url } => {
                let url = format!("{base_url}/subjects/{subject}/versions");
                let body = RegisterSchemaRequest {
                    schema: schema.to_string(),
                    schema_type: family.as_str().to_string(),
                    references: refs
                        .into_iter()
                        .map(|r| ReferenceDto {
                            name: r.name,
                            subject: r.subject,
                            version: r.version,
                        })
                        .collect(),
                };
                let resp = http
                    .post(&url)
                    .json(&body)
                    .send()
                    .await
                    .map_err(|e| EngineError::Resolve(format!("registry: {e}")))?;
                if !resp.status().is_success() {
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();
                    return Err(EngineError::Resolve(format!(
                        "registry register failed: {status} {text}"
                    )));
                }
                let result: RegisterSchemaResponse = resp
                    .json()
                    .await
                    .map_err(|e| EngineError::Resolve(format!("bad register response: {e}")))?;
                Ok(result.id)
            }
        }
    }

    /// Parses schema text in the given family, resolving named references
    /// through this registry.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Resolve`] if a reference cannot be fetched
    /// or the text cannot be parsed.
    pub async fn parse(
        &self,
        family: SchemaFamily,
        schema: &str,
        refs: &[SchemaReference],
    ) -> Result<ParsedSchema, EngineError> {
        let mut named = Vec::new();
        let mut seen = HashSet::new();
        self.collect_references(refs, &mut named, &mut seen).await?;
        parse_schema_text(family, schema, &named)
    }

    /// Drops any process-local state held for this client's mock scope.
    pub fn close(&self) {
        if let Backend::Mock { scope } = &self.backend {
            MOCK_SCOPES.lock().remove(scope);
            debug!(scope = %scope, "dropped mock registry scope");
        }
    }

    /// Resolves references depth-first so dependencies precede dependents.
    fn collect_references<'a>(
        &'a self,
        refs: &'a [SchemaReference],
        named: &'a mut Vec<(String, String)>,
        seen: &'a mut HashSet<String>,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<(), EngineError>> + Send + 'a>,
    > {
        Box::pin(async move {
            for reference in refs {
                if !seen.insert(reference.name.clone()) {
                    continue;
                }
                let resolved = self
                    .schema_version(&reference.subject, reference.version)
                    .await?;
                self.collect_references(&resolved.refs, named, seen).await?;
                named.push((reference.name.clone(), resolved.schema));
            }
            Ok(())
        })
    }

    fn cache_and_convert(
        &self,
        id: i32,
        schema_type: String,
        schema: String,
        references: Vec<ReferenceDto>,
    ) -> Result<SubjectSchema, EngineError> {
        let family: SchemaFamily = schema_type.parse().map_err(|e: EngineError| {
            EngineError::Resolve(format!("registry returned {e}"))
        })?;
        let resolved = SubjectSchema {
            id,
            family,
            schema,
            refs: references
                .into_iter()
                .map(|r| SchemaReference {
                    name: r.name,
                    subject: r.subject,
                    version: r.version,
                })
                .collect(),
        };
        self.by_id_cache
            .lock()
            .insert(id, Arc::new(resolved.clone()));
        Ok(resolved)
    }
}

impl std::fmt::Debug for RegistryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let target = match &self.backend {
            Backend::Remote { base_url, .. } => base_url.clone(),
            Backend::Mock { scope } => format!("mock://{scope}"),
        };
        f.debug_struct("RegistryClient")
            .field("target", &target)
            .field("cached_ids", &self.by_id_cache.lock().len())
            .finish()
    }
}

fn with_scope<T>(
    scope: &str,
    f: impl FnOnce(&MockScope) -> Result<T, EngineError>,
) -> Result<T, EngineError> {
    let scopes = MOCK_SCOPES.lock();
    match scopes.get(scope) {
        Some(state) => f(state),
        None => Err(EngineError::Resolve(format!(
            "empty mock registry scope '{scope}'"
        ))),
    }
}

async fn get_json<T: serde::de::DeserializeOwned>(
    http: &reqwest::Client,
    url: &str,
) -> Result<T, EngineError> {
    let resp = http
        .get(url)
        .send()
        .await
        .map_err(|e| EngineError::Resolve(format!("registry: {e}")))?;
    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        return Err(EngineError::Resolve(format!(
            "registry request failed: {status} {text}"
        )));
    }
    resp.json::<T>()
        .await
        .map_err(|e| EngineError::Resolve(format!("bad registry response: {e}")))
}

/// Parses schema text against an already-resolved reference environment.
///
/// `named` holds `(reference name, schema text)` pairs, dependencies first.
///
/// # Errors
///
/// Returns [`EngineError::Resolve`] if the text cannot be parsed in the
/// given family.
pub fn parse_schema_text(
    family: SchemaFamily,
    schema: &str,
    named: &[(String, String)],
) -> Result<ParsedSchema, EngineError> {
    match family {
        SchemaFamily::Avro => {
            let mut inputs: Vec<&str> = named.iter().map(|(_, text)| text.as_str()).collect();
            inputs.push(schema);
            let mut parsed = apache_avro::Schema::parse_list(&inputs)
                .map_err(|e| EngineError::Resolve(format!("invalid avro schema: {e}")))?;
            parsed
                .pop()
                .ok_or_else(|| EngineError::Resolve("empty avro schema list".into()))
                .map(ParsedSchema::Avro)
        }
        SchemaFamily::Json => {
            let root: serde_json::Value = serde_json::from_str(schema)
                .map_err(|e| EngineError::Resolve(format!("invalid json schema: {e}")))?;
            let mut refs = HashMap::new();
            for (name, text) in named {
                let value: serde_json::Value = serde_json::from_str(text).map_err(|e| {
                    EngineError::Resolve(format!("invalid json schema reference '{name}': {e}"))
                })?;
                refs.insert(name.clone(), value);
            }
            Ok(ParsedSchema::Json(JsonSchemaDoc { root, refs }))
        }
        SchemaFamily::Protobuf => parse_protobuf(schema, named),
    }
}

struct MemoryFileResolver {
    files: HashMap<String, String>,
}

impl protox::file::FileResolver for MemoryFileResolver {
    fn open_file(&self, name: &str) -> Result<protox::file::File, protox::Error> {
        match self.files.get(name) {
            Some(source) => protox::file::File::from_source(name, source),
            None => Err(protox::Error::file_not_found(name)),
        }
    }
}

fn parse_protobuf(
    schema: &str,
    named: &[(String, String)],
) -> Result<ParsedSchema, EngineError> {
    let mut files = HashMap::new();
    for (name, text) in named {
        files.insert(name.clone(), text.clone());
    }
    files.insert(ROOT_PROTO_FILE.to_string(), schema.to_string());

    let mut resolver = protox::file::ChainFileResolver::new();
    resolver.add(protox::file::GoogleFileResolver::new());
    resolver.add(MemoryFileResolver { files });

    let mut compiler = protox::Compiler::with_file_resolver(resolver);
    compiler.include_imports(true);
    compiler
        .open_file(ROOT_PROTO_FILE)
        .map_err(|e| EngineError::Resolve(format!("invalid protobuf schema: {e}")))?;

    let encoded = compiler.encode_file_descriptor_set();
    let pool = prost_reflect::DescriptorPool::decode(encoded.as_slice())
        .map_err(|e| EngineError::Resolve(format!("invalid descriptor set: {e}")))?;

    let message = pool
        .files()
        .find(|f| f.name() == ROOT_PROTO_FILE)
        .and_then(|f| f.messages().next())
        .ok_or_else(|| {
            EngineError::Resolve("protobuf schema declares no message".into())
        })?;
    Ok(ParsedSchema::Protobuf(message))
}
