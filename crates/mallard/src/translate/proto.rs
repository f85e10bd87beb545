//! Message-descriptor (Protobuf) translation and value shaping.
//!
//! Messages become structs in field-number order, real oneofs become
//! tagged unions, map fields become maps, repeated fields become lists,
//! and `google.protobuf.Timestamp` lands in the timestamp column kind.

use prost_reflect::{
    DynamicMessage, FieldDescriptor, Kind, MapKey, MessageDescriptor, ReflectMessage,
    Value as ProtoValue,
};

use crate::column::{ColumnDef, ColumnKind, PrimKind};
use crate::error::{DecodeError, EngineError, SchemaError};
use crate::row::CellValue;

const WELL_KNOWN_TIMESTAMP: &str = "google.protobuf.Timestamp";

/// Translates a message descriptor into a column definition.
pub(crate) fn to_column(message: &MessageDescriptor) -> Result<ColumnDef, SchemaError> {
    let mut visiting = Vec::new();
    translate_message(message, &mut visiting)
}

/// Decodes an encoded message body and shapes it by the column.
pub(crate) fn decode_body(
    message: &MessageDescriptor,
    body: &[u8],
    column: &ColumnDef,
) -> Result<CellValue, EngineError> {
    let decoded = DynamicMessage::decode(message.clone(), body)
        .map_err(|e| DecodeError::Protobuf(e.to_string()))?;
    shape_message(&decoded, column)
}

fn translate_message(
    message: &MessageDescriptor,
    visiting: &mut Vec<String>,
) -> Result<ColumnDef, SchemaError> {
    let full_name = message.full_name().to_string();
    if visiting.contains(&full_name) {
        return Err(SchemaError::Recursion(full_name));
    }
    visiting.push(full_name.clone());

    let mut fields = Vec::new();
    let mut grouped_oneofs = std::collections::HashSet::new();

    for field in message.fields() {
        if let Some(oneof) = field.containing_oneof() {
            // proto3 optional is a synthetic single-field oneof.
            if field.field_descriptor_proto().proto3_optional() {
                fields.push((
                    field.name().to_string(),
                    translate_field(&field, visiting)?.nullable(),
                ));
                continue;
            }
            if !grouped_oneofs.insert(oneof.name().to_string()) {
                continue;
            }
            let mut branches = Vec::new();
            for member in oneof.fields() {
                branches.push((
                    member.name().to_string(),
                    translate_field(&member, visiting)?,
                ));
            }
            // An unset oneof decodes to a NULL cell.
            fields.push((oneof.name().to_string(), ColumnDef::union(branches)?.nullable()));
            continue;
        }
        fields.push((field.name().to_string(), translate_field(&field, visiting)?));
    }

    visiting.pop();
    ColumnDef::record(full_name, fields)
}

fn translate_field(
    field: &FieldDescriptor,
    visiting: &mut Vec<String>,
) -> Result<ColumnDef, SchemaError> {
    if field.is_map() {
        let entry = match field.kind() {
            Kind::Message(entry) => entry,
            other => {
                return Err(SchemaError::Unsupported(format!(
                    "map field with non-message entry {other:?}"
                )))
            }
        };
        let key_field = entry.map_entry_key_field();
        let value_field = entry.map_entry_value_field();
        return ColumnDef::map(
            translate_kind(&key_field.kind(), visiting)?,
            translate_kind(&value_field.kind(), visiting)?,
        );
    }
    if field.is_list() {
        return Ok(ColumnDef::list(translate_kind(&field.kind(), visiting)?));
    }
    translate_kind(&field.kind(), visiting)
}

fn translate_kind(
    kind: &Kind,
    visiting: &mut Vec<String>,
) -> Result<ColumnDef, SchemaError> {
    Ok(match kind {
        Kind::Bool => ColumnDef::prim(PrimKind::Bool),
        Kind::Int32 | Kind::Sint32 | Kind::Sfixed32 => ColumnDef::prim(PrimKind::Int32),
        Kind::Int64 | Kind::Sint64 | Kind::Sfixed64 => ColumnDef::prim(PrimKind::Int64),
        Kind::Uint32 | Kind::Fixed32 => ColumnDef::prim(PrimKind::UInt32),
        Kind::Uint64 | Kind::Fixed64 => ColumnDef::prim(PrimKind::UInt64),
        Kind::Float => ColumnDef::prim(PrimKind::Float32),
        Kind::Double => ColumnDef::prim(PrimKind::Float64),
        Kind::String => ColumnDef::prim(PrimKind::Utf8),
        Kind::Bytes => ColumnDef::prim(PrimKind::Bytes),
        Kind::Enum(descriptor) => {
            let symbols = descriptor.values().map(|v| v.name().to_string()).collect();
            ColumnDef::enumeration(descriptor.full_name().to_string(), symbols)?
        }
        Kind::Message(message) if message.full_name() == WELL_KNOWN_TIMESTAMP => {
            ColumnDef::prim(PrimKind::TimestampMicros)
        }
        // Submessages may be absent on the wire.
        Kind::Message(message) => translate_message(message, visiting)?.nullable(),
    })
}

fn shape_message(message: &DynamicMessage, column: &ColumnDef) -> Result<CellValue, EngineError> {
    let fields = match column.kind() {
        ColumnKind::Struct(fields) => fields,
        ColumnKind::Prim(PrimKind::TimestampMicros) => {
            return Ok(CellValue::TimestampMicros(timestamp_micros(message)?));
        }
        other => {
            return Err(EngineError::BadRow(format!(
                "protobuf message for column {other:?}"
            )))
        }
    };

    let descriptor = message.descriptor();
    let mut shaped = Vec::with_capacity(fields.len());
    for (name, field_col) in fields {
        if let ColumnKind::Union(branches) = field_col.kind() {
            if let Some(oneof) = descriptor.oneofs().find(|o| o.name() == name) {
                let mut cell = CellValue::Null;
                for member in oneof.fields() {
                    if message.has_field(&member) {
                        let branch_col = branches
                            .iter()
                            .find(|(tag, _)| tag == member.name())
                            .map(|(_, col)| col)
                            .ok_or_else(|| {
                                EngineError::Decode(DecodeError::UnknownUnionTag(
                                    member.name().to_string(),
                                ))
                            })?;
                        cell = CellValue::Union {
                            tag: member.name().to_string(),
                            value: Box::new(shape_value(
                                &message.get_field(&member),
                                &member.kind(),
                                branch_col,
                            )?),
                        };
                        break;
                    }
                }
                shaped.push((name.clone(), cell));
                continue;
            }
        }

        let field = descriptor.get_field_by_name(name).ok_or_else(|| {
            EngineError::BadRow(format!("message lacks field '{name}'"))
        })?;
        if field.supports_presence() && !message.has_field(&field) {
            shaped.push((name.clone(), CellValue::Null));
            continue;
        }
        shaped.push((
            name.clone(),
            shape_value(&message.get_field(&field), &field.kind(), field_col)?,
        ));
    }
    Ok(CellValue::Struct(shaped))
}

#[allow(clippy::too_many_lines)]
fn shape_value(
    value: &ProtoValue,
    kind: &Kind,
    column: &ColumnDef,
) -> Result<CellValue, EngineError> {
    match value {
        ProtoValue::Bool(b) => Ok(CellValue::Bool(*b)),
        ProtoValue::I32(v) => Ok(CellValue::Int32(*v)),
        ProtoValue::I64(v) => Ok(CellValue::Int64(*v)),
        ProtoValue::U32(v) => Ok(CellValue::UInt32(*v)),
        ProtoValue::U64(v) => Ok(CellValue::UInt64(*v)),
        ProtoValue::F32(v) => Ok(CellValue::Float32(*v)),
        ProtoValue::F64(v) => Ok(CellValue::Float64(*v)),
        ProtoValue::String(s) => Ok(CellValue::Str(s.clone())),
        ProtoValue::Bytes(b) => Ok(CellValue::Bytes(b.to_vec())),
        ProtoValue::EnumNumber(number) => {
            let Kind::Enum(descriptor) = kind else {
                return Err(EngineError::BadRow(format!(
                    "enum number {number} for non-enum field"
                )));
            };
            let symbol = descriptor
                .get_value(*number)
                .map(|v| v.name().to_string())
                .ok_or_else(|| DecodeError::UnknownSymbol(number.to_string()))?;
            match column.kind() {
                ColumnKind::Enum { symbols, .. } if symbols.contains(&symbol) => {
                    Ok(CellValue::Enum(symbol))
                }
                ColumnKind::Enum { .. } => Err(DecodeError::UnknownSymbol(symbol).into()),
                _ => Ok(CellValue::Str(symbol)),
            }
        }
        ProtoValue::Message(inner) => shape_message(inner, column),
        ProtoValue::List(items) => {
            let item_col = match column.kind() {
                ColumnKind::List(item) => item,
                other => {
                    return Err(EngineError::BadRow(format!(
                        "repeated field for column {other:?}"
                    )))
                }
            };
            items
                .iter()
                .map(|item| shape_value(item, kind, item_col))
                .collect::<Result<Vec<_>, _>>()
                .map(CellValue::List)
        }
        ProtoValue::Map(entries) => {
            let (key_col, value_col) = match column.kind() {
                ColumnKind::Map(key, value) => (key, value),
                other => {
                    return Err(EngineError::BadRow(format!(
                        "map field for column {other:?}"
                    )))
                }
            };
            let value_kind = match kind {
                Kind::Message(entry) => entry.map_entry_value_field().kind(),
                other => {
                    return Err(EngineError::BadRow(format!(
                        "map value for non-entry kind {other:?}"
                    )))
                }
            };
            let mut pairs: Vec<(&MapKey, &ProtoValue)> = entries.iter().collect();
            pairs.sort_by_key(|(k, _)| map_key_order(k));
            pairs
                .into_iter()
                .map(|(k, v)| {
                    Ok((
                        shape_map_key(k, key_col),
                        shape_value(v, &value_kind, value_col)?,
                    ))
                })
                .collect::<Result<Vec<_>, EngineError>>()
                .map(CellValue::Map)
        }
    }
}

fn shape_map_key(key: &MapKey, _column: &ColumnDef) -> CellValue {
    match key {
        MapKey::Bool(b) => CellValue::Bool(*b),
        MapKey::I32(v) => CellValue::Int32(*v),
        MapKey::I64(v) => CellValue::Int64(*v),
        MapKey::U32(v) => CellValue::UInt32(*v),
        MapKey::U64(v) => CellValue::UInt64(*v),
        MapKey::String(s) => CellValue::Str(s.clone()),
    }
}

fn map_key_order(key: &MapKey) -> String {
    match key {
        MapKey::Bool(b) => b.to_string(),
        MapKey::I32(v) => format!("{v:020}"),
        MapKey::I64(v) => format!("{v:020}"),
        MapKey::U32(v) => format!("{v:020}"),
        MapKey::U64(v) => format!("{v:020}"),
        MapKey::String(s) => s.clone(),
    }
}

fn timestamp_micros(message: &DynamicMessage) -> Result<i64, EngineError> {
    let descriptor = message.descriptor();
    let seconds = descriptor
        .get_field_by_name("seconds")
        .map(|f| message.get_field(&f).as_i64().unwrap_or(0))
        .unwrap_or(0);
    let nanos = descriptor
        .get_field_by_name("nanos")
        .map(|f| i64::from(message.get_field(&f).as_i32().unwrap_or(0)))
        .unwrap_or(0);
    Ok(seconds.saturating_mul(1_000_000).saturating_add(nanos / 1000))
}
