//! Schema model: serde directives, parsed schemas, resolved bindings.
//!
//! A topic's key and value are each governed by a [`SerdeSpec`] directive.
//! Leaf directives name a primitive wire format; the rest resolve (possibly
//! through the registry) to a [`ParsedSchema`] in one of three families.
//! [`ResolvedSchema`] is the cached outcome of that resolution.

pub mod registry;
pub mod resolver;

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use base64::Engine as _;

use crate::error::EngineError;

/// The role of a payload within a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// The record key.
    Key,
    /// The record value.
    Value,
}

impl Role {
    /// Returns the role name used in registry subjects.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Key => "key",
            Role::Value => "value",
        }
    }

    /// Returns the registry subject for a topic under this role.
    #[must_use]
    pub fn subject(self, topic: &str) -> String {
        format!("{topic}-{}", self.as_str())
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A class of schema languages sharing the wire convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchemaFamily {
    /// Record-oriented (Avro).
    Avro,
    /// JSON-Schema-oriented.
    Json,
    /// Message-descriptor-oriented (Protobuf).
    Protobuf,
}

impl SchemaFamily {
    /// Returns the family name as reported by the registry.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SchemaFamily::Avro => "AVRO",
            SchemaFamily::Json => "JSON",
            SchemaFamily::Protobuf => "PROTOBUF",
        }
    }
}

impl FromStr for SchemaFamily {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "AVRO" => Ok(SchemaFamily::Avro),
            "JSON" => Ok(SchemaFamily::Json),
            "PROTOBUF" | "PROTO" => Ok(SchemaFamily::Protobuf),
            other => Err(EngineError::Config(format!(
                "unknown schema type: '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for SchemaFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A leaf wire format that needs no schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveTag {
    /// Big-endian 16-bit integer.
    Short,
    /// Big-endian 32-bit integer.
    Int,
    /// Big-endian 64-bit integer.
    Long,
    /// Big-endian 32-bit float.
    Float,
    /// Big-endian 64-bit float.
    Double,
    /// UTF-8 string.
    String,
    /// Raw bytes.
    Binary,
}

impl PrimitiveTag {
    /// Returns the directive literal for this tag.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            PrimitiveTag::Short => "short",
            PrimitiveTag::Int => "int",
            PrimitiveTag::Long => "long",
            PrimitiveTag::Float => "float",
            PrimitiveTag::Double => "double",
            PrimitiveTag::String => "string",
            PrimitiveTag::Binary => "binary",
        }
    }
}

impl std::fmt::Display for PrimitiveTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named reference to a subschema registered under another subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaReference {
    /// The name the referencing schema uses.
    pub name: String,
    /// The registry subject holding the referenced schema.
    pub subject: String,
    /// The referenced version.
    pub version: i32,
}

/// A serde directive for one topic role.
///
/// Parsed from the literal forms
/// `short|int|long|float|double|string|binary`, `latest`, `id:<int>`, or
/// `inline:<type>:<base64-schema>[+name=subject:version…]`.
#[derive(Debug, Clone, PartialEq)]
pub enum SerdeSpec {
    /// Decode with a primitive wire format; no registry I/O.
    Primitive(PrimitiveTag),
    /// Look up the latest schema for the `<topic>-<role>` subject.
    Latest,
    /// Fetch the schema with this registry id.
    ById(i32),
    /// Parse an inline schema, with optional named references.
    Inline {
        /// The schema family.
        family: SchemaFamily,
        /// The decoded schema text.
        schema: String,
        /// Named references, resolved through the registry.
        refs: Vec<SchemaReference>,
    },
}

impl FromStr for SerdeSpec {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "short" => return Ok(SerdeSpec::Primitive(PrimitiveTag::Short)),
            "int" => return Ok(SerdeSpec::Primitive(PrimitiveTag::Int)),
            "long" => return Ok(SerdeSpec::Primitive(PrimitiveTag::Long)),
            "float" => return Ok(SerdeSpec::Primitive(PrimitiveTag::Float)),
            "double" => return Ok(SerdeSpec::Primitive(PrimitiveTag::Double)),
            "string" => return Ok(SerdeSpec::Primitive(PrimitiveTag::String)),
            "binary" => return Ok(SerdeSpec::Primitive(PrimitiveTag::Binary)),
            "latest" => return Ok(SerdeSpec::Latest),
            _ => {}
        }

        if let Some(id) = s.strip_prefix("id:") {
            let id: i32 = id
                .parse()
                .map_err(|_| EngineError::Config(format!("invalid schema id in '{s}'")))?;
            return Ok(SerdeSpec::ById(id));
        }

        if let Some(rest) = s.strip_prefix("inline:") {
            let (family, payload) = rest.split_once(':').ok_or_else(|| {
                EngineError::Config(format!("invalid inline serde directive '{s}'"))
            })?;
            let family: SchemaFamily = family.parse()?;

            let mut parts = payload.split('+');
            let encoded = parts.next().unwrap_or_default();
            let schema = base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok())
                .ok_or_else(|| {
                    EngineError::Config(format!("invalid base64 schema in '{s}'"))
                })?;

            let mut refs = Vec::new();
            for part in parts {
                let (name, target) = part.split_once('=').ok_or_else(|| {
                    EngineError::Config(format!("invalid schema reference '{part}'"))
                })?;
                let (subject, version) = target.split_once(':').ok_or_else(|| {
                    EngineError::Config(format!("invalid schema reference '{part}'"))
                })?;
                let version: i32 = version.parse().map_err(|_| {
                    EngineError::Config(format!("invalid reference version in '{part}'"))
                })?;
                refs.push(SchemaReference {
                    name: name.to_string(),
                    subject: subject.to_string(),
                    version,
                });
            }

            return Ok(SerdeSpec::Inline {
                family,
                schema,
                refs,
            });
        }

        Err(EngineError::Config(format!("unknown serde directive '{s}'")))
    }
}

/// A parsed JSON Schema document plus its reference environment.
#[derive(Debug, Clone)]
pub struct JsonSchemaDoc {
    /// The root schema document.
    pub root: serde_json::Value,
    /// Externally referenced schemas, keyed by reference name.
    pub refs: HashMap<String, serde_json::Value>,
}

/// A parsed structural schema in one of the supported families.
#[derive(Debug, Clone)]
pub enum ParsedSchema {
    /// A record-oriented schema.
    Avro(apache_avro::Schema),
    /// A JSON-Schema document.
    Json(JsonSchemaDoc),
    /// A message descriptor.
    Protobuf(prost_reflect::MessageDescriptor),
}

impl ParsedSchema {
    /// Returns the schema's family tag.
    #[must_use]
    pub fn family(&self) -> SchemaFamily {
        match self {
            ParsedSchema::Avro(_) => SchemaFamily::Avro,
            ParsedSchema::Json(_) => SchemaFamily::Json,
            ParsedSchema::Protobuf(_) => SchemaFamily::Protobuf,
        }
    }
}

/// The resolved binding for one `(topic, role)`.
#[derive(Debug, Clone)]
pub enum ResolvedSchema {
    /// Decode with a primitive wire format.
    Primitive(PrimitiveTag),
    /// Decode through a parsed structural schema.
    Parsed {
        /// The schema id: registry-assigned, or negative for inline
        /// schemas with no registry id.
        id: i32,
        /// The parsed schema.
        schema: Arc<ParsedSchema>,
    },
}

impl ResolvedSchema {
    /// Returns `true` if this binding decodes schema-bearing payloads.
    #[must_use]
    pub fn is_parsed(&self) -> bool {
        matches!(self, ResolvedSchema::Parsed { .. })
    }
}
