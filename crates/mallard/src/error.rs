//! Engine error types.
//!
//! Provides a unified error hierarchy for the ingest pipeline:
//! - `EngineError`: Top-level error for engine and worker operations
//! - `SchemaError`: Schema translation produced an impossible column
//! - `DecodeError`: A wire payload could not be decoded

use thiserror::Error;

/// Errors that can occur during engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Missing or malformed configuration option. Fatal at `init()`.
    #[error("configuration error: {0}")]
    Config(String),

    /// Schema translation produced an impossible column.
    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),

    /// The registry was unreachable or returned an unusable schema.
    ///
    /// Recovered locally by falling back to the `binary` serde for the
    /// affected binding; surfaced only when no fallback applies.
    #[error("schema resolution failed: {0}")]
    Resolve(String),

    /// A wire payload could not be decoded. Per-record, skipped, counted.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// The decoded value tree does not fit the column shape.
    #[error("row shape error: {0}")]
    BadRow(String),

    /// The analytic engine rejected a statement. Worker-fatal.
    #[error("sink error: {0}")]
    Sink(#[from] duckdb::Error),

    /// Error reading from the log source.
    #[error("source error: {0}")]
    Source(String),

    /// Operation attempted in the wrong facade state.
    #[error("invalid lifecycle state: expected {expected}, got {actual}")]
    Lifecycle {
        /// The state the operation requires.
        expected: String,
        /// The state the engine was in.
        actual: String,
    },
}

/// Errors raised when a schema cannot be translated to a column definition.
#[derive(Debug, Error)]
pub enum SchemaError {
    /// A named schema refers to itself, directly or through other names.
    /// The target row type is finite, so recursion cannot be represented.
    #[error("recursive schema reference to '{0}'")]
    Recursion(String),

    /// A product schema declared no fields.
    #[error("struct '{0}' has no fields")]
    EmptyStruct(String),

    /// A field or branch name is empty or duplicated within its container.
    #[error("invalid name '{name}' in {container}: names must be unique and non-empty")]
    BadName {
        /// The struct or union the name appears in.
        container: String,
        /// The offending name.
        name: String,
    },

    /// Decimal precision or scale out of bounds.
    #[error("invalid decimal bounds: precision {precision}, scale {scale}")]
    DecimalBounds {
        /// Declared precision.
        precision: u32,
        /// Declared scale.
        scale: u32,
    },

    /// An enumeration declared no symbols.
    #[error("enum '{0}' has no symbols")]
    EmptyEnum(String),

    /// A named reference could not be resolved in the schema environment.
    #[error("unresolved schema reference '{0}'")]
    UnresolvedReference(String),

    /// The schema uses a construct the column model cannot express.
    #[error("unsupported schema shape: {0}")]
    Unsupported(String),
}

/// Errors raised while decoding a single wire payload.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The payload does not start with the `0x00` magic byte.
    #[error("unknown magic byte 0x{0:02x}")]
    BadMagic(u8),

    /// The payload ended before the expected content.
    #[error("payload truncated: {0}")]
    Truncated(String),

    /// A union value carried a tag that is not a branch of the column.
    #[error("unknown union tag '{0}'")]
    UnknownUnionTag(String),

    /// An enum value is not one of the declared symbols.
    #[error("unknown enum symbol '{0}'")]
    UnknownSymbol(String),

    /// A fixed-width value had the wrong length.
    #[error("fixed value of {got} bytes, expected {expected}")]
    FixedLength {
        /// Declared width.
        expected: usize,
        /// Observed width.
        got: usize,
    },

    /// The record-oriented family decoder failed.
    #[error("avro decode error: {0}")]
    Avro(String),

    /// The JSON family decoder failed.
    #[error("json decode error: {0}")]
    Json(String),

    /// The descriptor family decoder failed.
    #[error("protobuf decode error: {0}")]
    Protobuf(String),

    /// A string payload was not valid UTF-8.
    #[error("invalid utf-8 payload: {0}")]
    Utf8(String),
}
