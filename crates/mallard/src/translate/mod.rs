//! Schema-to-column translation and family value shaping.
//!
//! One translator per schema family, dispatched on the family tag: the set
//! of families is closed, so translation is a match, not a trait object.
//! Each family module implements the pure schema-to-[`ColumnDef`]
//! translation and the decode-side shaping of its native value tree into
//! [`CellValue`]s.

pub(crate) mod avro;
pub(crate) mod json;
pub(crate) mod proto;

use crate::column::ColumnDef;
use crate::error::{EngineError, SchemaError};
use crate::row::CellValue;
use crate::schema::ParsedSchema;

/// Translates a parsed schema into its root column definition.
///
/// This is a pure function of `(schema, is_key)` and is stable across runs.
///
/// # Errors
///
/// Returns [`SchemaError`] when the schema cannot be expressed as a finite
/// column, e.g. on recursive references.
pub fn to_column(schema: &ParsedSchema, _is_key: bool) -> Result<ColumnDef, SchemaError> {
    let column = match schema {
        ParsedSchema::Avro(avro) => avro::to_column(avro)?,
        ParsedSchema::Json(doc) => json::to_column(doc)?,
        ParsedSchema::Protobuf(message) => proto::to_column(message)?,
    };
    column.validate()?;
    Ok(column)
}

/// Decodes a schema-bearing payload body and shapes it by the column.
///
/// # Errors
///
/// Returns [`EngineError::Decode`] when the body cannot be decoded in the
/// schema's family, or [`EngineError::BadRow`] when the decoded value tree
/// does not fit the column shape.
pub fn decode_body(
    schema: &ParsedSchema,
    body: &[u8],
    column: &ColumnDef,
) -> Result<CellValue, EngineError> {
    match schema {
        ParsedSchema::Avro(avro) => avro::decode_body(avro, body, column),
        ParsedSchema::Json(_) => json::decode_body(body, column),
        ParsedSchema::Protobuf(message) => proto::decode_body(message, body, column),
    }
}
