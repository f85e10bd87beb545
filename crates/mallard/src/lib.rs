//! # Mallard
//!
//! An ingest-and-query bridge: point it at a set of Kafka topics, declare
//! how each topic's key and value are interpreted, and every record is
//! continuously materialized as a row in a DuckDB table whose columns are
//! derived from the record's schema. Queries run locally against the
//! embedded database.
//!
//! ## Pipeline
//!
//! ```text
//! log source -> raw record
//!   -> schema resolver   (serde directive, registry, cache)
//!   -> decoder           (wire header + family decode)
//!   -> row shaper        (value tree -> positional row)
//!   -> table manager     (prepared insert per topic)
//! ```
//!
//! One worker per topic keeps inserts serial in partition-offset order;
//! [`engine::IngestEngine`] owns the process-wide lifecycle.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![cfg_attr(
    test,
    allow(
        clippy::float_cmp,
        clippy::unreadable_literal,
        clippy::too_many_lines,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )
)]

/// Engine error types.
pub mod error;

/// Engine configuration.
pub mod config;

/// Typed, recursive column definitions and DDL rendering.
pub mod column;

/// Decoded cell values and positional row shaping.
pub mod row;

/// Schema model, registry client, and the binding resolver.
pub mod schema;

/// Schema-to-column translation per family.
pub mod translate;

/// Wire-format decoding.
pub mod decode;

/// Per-topic tables and prepared inserts.
pub mod table;

/// The log source abstraction.
pub mod source;

/// Kafka log source.
pub mod kafka;

/// The per-topic ingest worker.
pub mod ingest;

/// The engine facade and process-wide lifecycle.
pub mod engine;

/// In-memory mocks and payload helpers for tests.
pub mod testing;

pub use column::{ColumnDef, ColumnKind, ColumnStrategy, PrimKind};
pub use config::EngineConfig;
pub use engine::{EngineBuilder, IngestEngine};
pub use error::{DecodeError, EngineError, SchemaError};
pub use ingest::{IngestMetricsSnapshot, TopicStatus};
pub use row::{CellValue, Row};
pub use schema::{ParsedSchema, PrimitiveTag, ResolvedSchema, Role, SchemaFamily, SerdeSpec};
