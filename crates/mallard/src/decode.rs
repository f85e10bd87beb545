//! Wire-format decoding.
//!
//! Schema-bearing payloads carry the header `0x00 || schema-id:be32 ||
//! body`; the body is decoded by the resolved schema's family. Primitive
//! serdes own the whole payload: fixed-width big-endian numbers, UTF-8
//! strings, or raw bytes.

use tracing::trace;

use crate::column::{ColumnDef, PrimKind};
use crate::error::{DecodeError, EngineError};
use crate::row::CellValue;
use crate::schema::{PrimitiveTag, ResolvedSchema};
use crate::translate;

/// The magic byte marking a schema-bearing wire payload.
pub const MAGIC_BYTE: u8 = 0x00;

/// Size of the wire header: magic byte plus big-endian 32-bit schema id.
pub const WIRE_HEADER_SIZE: usize = 5;

/// A split schema-bearing payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WirePayload<'a> {
    /// The writer schema id carried by the payload.
    pub schema_id: i32,
    /// The encoded body.
    pub body: &'a [u8],
}

/// Splits a schema-bearing payload into its id and body.
///
/// # Errors
///
/// Returns [`DecodeError::BadMagic`] when the first byte is not `0x00` and
/// [`DecodeError::Truncated`] when the header is incomplete.
pub fn split_wire(payload: &[u8]) -> Result<WirePayload<'_>, DecodeError> {
    let first = *payload
        .first()
        .ok_or_else(|| DecodeError::Truncated("empty schema-bearing payload".into()))?;
    if first != MAGIC_BYTE {
        return Err(DecodeError::BadMagic(first));
    }
    if payload.len() < WIRE_HEADER_SIZE {
        return Err(DecodeError::Truncated(format!(
            "{} bytes, need {WIRE_HEADER_SIZE} for the wire header",
            payload.len()
        )));
    }
    let schema_id = i32::from_be_bytes([payload[1], payload[2], payload[3], payload[4]]);
    Ok(WirePayload {
        schema_id,
        body: &payload[WIRE_HEADER_SIZE..],
    })
}

/// Returns the column definition for a primitive serde tag.
///
/// Primitive payloads may be null (tombstones, absent keys), so the
/// columns are nullable.
#[must_use]
pub fn column_for_tag(tag: PrimitiveTag) -> ColumnDef {
    let kind = match tag {
        PrimitiveTag::Short => PrimKind::Int16,
        PrimitiveTag::Int => PrimKind::Int32,
        PrimitiveTag::Long => PrimKind::Int64,
        PrimitiveTag::Float => PrimKind::Float32,
        PrimitiveTag::Double => PrimKind::Float64,
        PrimitiveTag::String => PrimKind::Utf8,
        PrimitiveTag::Binary => PrimKind::Bytes,
    };
    ColumnDef::prim(kind).nullable()
}

/// Decodes a primitive payload.
///
/// # Errors
///
/// Returns [`DecodeError::Truncated`] when a fixed-width payload has the
/// wrong length, or [`DecodeError::Utf8`] for an invalid string.
pub fn decode_primitive(tag: PrimitiveTag, payload: &[u8]) -> Result<CellValue, DecodeError> {
    fn fixed<const N: usize>(tag: PrimitiveTag, payload: &[u8]) -> Result<[u8; N], DecodeError> {
        payload.try_into().map_err(|_| {
            DecodeError::Truncated(format!(
                "{tag} payload of {} bytes, expected {N}",
                payload.len()
            ))
        })
    }

    Ok(match tag {
        PrimitiveTag::Short => CellValue::Int16(i16::from_be_bytes(fixed(tag, payload)?)),
        PrimitiveTag::Int => CellValue::Int32(i32::from_be_bytes(fixed(tag, payload)?)),
        PrimitiveTag::Long => CellValue::Int64(i64::from_be_bytes(fixed(tag, payload)?)),
        PrimitiveTag::Float => CellValue::Float32(f32::from_be_bytes(fixed(tag, payload)?)),
        PrimitiveTag::Double => CellValue::Float64(f64::from_be_bytes(fixed(tag, payload)?)),
        PrimitiveTag::String => CellValue::Str(
            std::str::from_utf8(payload)
                .map_err(|e| DecodeError::Utf8(e.to_string()))?
                .to_string(),
        ),
        PrimitiveTag::Binary => CellValue::Bytes(payload.to_vec()),
    })
}

/// Decodes one payload against its resolved schema and column.
///
/// A null or empty payload decodes to a NULL cell without touching the
/// magic byte.
///
/// # Errors
///
/// Returns [`EngineError::Decode`] for wire or family decode failures and
/// [`EngineError::BadRow`] when the decoded tree does not fit the column.
pub fn decode_cell(
    resolved: &ResolvedSchema,
    column: &ColumnDef,
    payload: Option<&[u8]>,
) -> Result<CellValue, EngineError> {
    let Some(payload) = payload else {
        return Ok(CellValue::Null);
    };
    if payload.is_empty() {
        return Ok(CellValue::Null);
    }

    match resolved {
        ResolvedSchema::Primitive(tag) => Ok(decode_primitive(*tag, payload)?),
        ResolvedSchema::Parsed { id, schema } => {
            let wire = split_wire(payload)?;
            if wire.schema_id != *id {
                // Provenance only; the decode uses the resolved schema.
                trace!(
                    payload_id = wire.schema_id,
                    resolved_id = id,
                    "payload written with a different schema id"
                );
            }
            translate::decode_body(schema, wire.body, column)
        }
    }
}
