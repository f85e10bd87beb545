//! JSON-Schema translation and value shaping.
//!
//! Supports the structural subset of JSON Schema: `type`, `properties` +
//! `required`, `items`, `additionalProperties` (string-keyed maps),
//! `enum` over strings, `oneOf` (tagged unions), `$ref` into `$defs` /
//! `definitions` or the external reference environment, and `["T","null"]`
//! type arrays for optionals.

use serde_json::Value as Json;

use crate::column::{ColumnDef, ColumnKind, PrimKind};
use crate::error::{DecodeError, EngineError, SchemaError};
use crate::row::CellValue;
use crate::schema::JsonSchemaDoc;

/// Translates a JSON Schema document into a column definition.
pub(crate) fn to_column(doc: &JsonSchemaDoc) -> Result<ColumnDef, SchemaError> {
    let mut visiting = Vec::new();
    translate(&doc.root, doc, &mut visiting)
}

/// Decodes a JSON text body and shapes it by the column.
pub(crate) fn decode_body(body: &[u8], column: &ColumnDef) -> Result<CellValue, EngineError> {
    let value: Json =
        serde_json::from_slice(body).map_err(|e| DecodeError::Json(e.to_string()))?;
    shape(&value, column)
}

fn translate(
    node: &Json,
    doc: &JsonSchemaDoc,
    visiting: &mut Vec<String>,
) -> Result<ColumnDef, SchemaError> {
    let obj = node
        .as_object()
        .ok_or_else(|| SchemaError::Unsupported(format!("json schema node {node}")))?;

    if let Some(reference) = obj.get("$ref").and_then(Json::as_str) {
        if visiting.iter().any(|r| r == reference) {
            return Err(SchemaError::Recursion(reference.to_string()));
        }
        visiting.push(reference.to_string());
        let target = resolve_ref(reference, doc)
            .ok_or_else(|| SchemaError::UnresolvedReference(reference.to_string()))?;
        let column = translate(&target, doc, visiting)?;
        visiting.pop();
        return Ok(column);
    }

    if let Some(symbols) = obj.get("enum").and_then(Json::as_array) {
        let name = obj
            .get("title")
            .and_then(Json::as_str)
            .unwrap_or("enum")
            .to_string();
        let symbols: Option<Vec<String>> = symbols
            .iter()
            .map(|s| s.as_str().map(String::from))
            .collect();
        let symbols = symbols.ok_or_else(|| {
            SchemaError::Unsupported("json enum with non-string symbols".into())
        })?;
        return ColumnDef::enumeration(name, symbols);
    }

    if let Some(members) = obj.get("oneOf").and_then(Json::as_array) {
        return translate_one_of(members, doc, visiting);
    }

    match obj.get("type") {
        Some(Json::String(type_name)) => {
            translate_typed(type_name, obj, doc, visiting)
        }
        Some(Json::Array(types)) => {
            let non_null: Vec<&str> = types
                .iter()
                .filter_map(Json::as_str)
                .filter(|t| *t != "null")
                .collect();
            let has_null = non_null.len() != types.len();
            match non_null.as_slice() {
                [single] => {
                    let column = translate_typed(single, obj, doc, visiting)?;
                    Ok(if has_null { column.nullable() } else { column })
                }
                _ => Err(SchemaError::Unsupported(format!(
                    "json type array {types:?}"
                ))),
            }
        }
        None if obj.contains_key("properties") => {
            translate_typed("object", obj, doc, visiting)
        }
        _ => Err(SchemaError::Unsupported(format!("json schema node {node}"))),
    }
}

fn translate_typed(
    type_name: &str,
    obj: &serde_json::Map<String, Json>,
    doc: &JsonSchemaDoc,
    visiting: &mut Vec<String>,
) -> Result<ColumnDef, SchemaError> {
    match type_name {
        "null" => Ok(ColumnDef::null()),
        "boolean" => Ok(ColumnDef::prim(PrimKind::Bool)),
        // "int" is accepted as a loose alias of "integer".
        "integer" | "int" => Ok(ColumnDef::prim(PrimKind::Int64)),
        "number" => Ok(ColumnDef::prim(PrimKind::Float64)),
        "string" => Ok(ColumnDef::prim(PrimKind::Utf8)),
        "array" => {
            let items = obj.get("items").ok_or_else(|| {
                SchemaError::Unsupported("json array schema without items".into())
            })?;
            Ok(ColumnDef::list(translate(items, doc, visiting)?))
        }
        "object" => {
            if let Some(properties) = obj.get("properties").and_then(Json::as_object) {
                let required: Vec<&str> = obj
                    .get("required")
                    .and_then(Json::as_array)
                    .map(|r| r.iter().filter_map(Json::as_str).collect())
                    .unwrap_or_default();
                let name = obj
                    .get("title")
                    .and_then(Json::as_str)
                    .unwrap_or("object")
                    .to_string();
                let mut fields = Vec::with_capacity(properties.len());
                for (field_name, field_schema) in properties {
                    let mut column = translate(field_schema, doc, visiting)?;
                    if !required.contains(&field_name.as_str()) {
                        column = column.nullable();
                    }
                    fields.push((field_name.clone(), column));
                }
                return ColumnDef::record(name, fields);
            }
            if let Some(additional) = obj.get("additionalProperties") {
                if additional.is_object() {
                    return ColumnDef::map(
                        ColumnDef::prim(PrimKind::Utf8),
                        translate(additional, doc, visiting)?,
                    );
                }
            }
            Err(SchemaError::Unsupported(
                "json object schema without properties or typed additionalProperties".into(),
            ))
        }
        other => Err(SchemaError::Unsupported(format!("json type '{other}'"))),
    }
}

fn translate_one_of(
    members: &[Json],
    doc: &JsonSchemaDoc,
    visiting: &mut Vec<String>,
) -> Result<ColumnDef, SchemaError> {
    let mut branches = Vec::with_capacity(members.len());
    let mut has_null = false;
    for (i, member) in members.iter().enumerate() {
        let column = translate(member, doc, visiting)?;
        if matches!(column.kind(), ColumnKind::Null) {
            has_null = true;
            branches.push(("null".to_string(), column));
            continue;
        }
        let tag = member
            .get("title")
            .and_then(Json::as_str)
            .map_or_else(|| format!("alt{i}"), String::from);
        branches.push((tag, column));
    }

    if has_null && branches.len() == 2 {
        let sibling = branches
            .into_iter()
            .find(|(_, c)| !matches!(c.kind(), ColumnKind::Null))
            .map(|(_, c)| c)
            .ok_or_else(|| SchemaError::Unsupported("oneOf of only null".into()))?;
        return Ok(sibling.nullable());
    }

    let union = ColumnDef::union(branches)?;
    Ok(if has_null { union.nullable() } else { union })
}

fn resolve_ref(reference: &str, doc: &JsonSchemaDoc) -> Option<Json> {
    for prefix in ["#/$defs/", "#/definitions/"] {
        if let Some(name) = reference.strip_prefix(prefix) {
            let section = prefix.trim_start_matches("#/").trim_end_matches('/');
            return doc.root.get(section)?.get(name).cloned();
        }
    }
    doc.refs.get(reference).cloned()
}

/// Walks a decoded JSON value against the column definition.
pub(crate) fn shape(value: &Json, column: &ColumnDef) -> Result<CellValue, EngineError> {
    if value.is_null() {
        return Ok(CellValue::Null);
    }

    match column.kind() {
        ColumnKind::Prim(PrimKind::Bool) => value
            .as_bool()
            .map(CellValue::Bool)
            .ok_or_else(|| mismatch("boolean", value)),
        ColumnKind::Prim(PrimKind::Int64) => value
            .as_i64()
            .map(CellValue::Int64)
            .ok_or_else(|| mismatch("integer", value)),
        ColumnKind::Prim(PrimKind::Float64) => value
            .as_f64()
            .map(CellValue::Float64)
            .ok_or_else(|| mismatch("number", value)),
        ColumnKind::Prim(PrimKind::Utf8) => value
            .as_str()
            .map(|s| CellValue::Str(s.to_string()))
            .ok_or_else(|| mismatch("string", value)),
        ColumnKind::Prim(PrimKind::Uuid) => value
            .as_str()
            .and_then(|s| s.parse().ok())
            .map(CellValue::Uuid)
            .ok_or_else(|| mismatch("uuid", value)),
        ColumnKind::Prim(PrimKind::Bytes) => value
            .as_str()
            .map(|s| CellValue::Bytes(s.as_bytes().to_vec()))
            .ok_or_else(|| mismatch("string", value)),
        ColumnKind::Enum { symbols, .. } => {
            let symbol = value.as_str().ok_or_else(|| mismatch("enum", value))?;
            if symbols.iter().any(|s| s == symbol) {
                Ok(CellValue::Enum(symbol.to_string()))
            } else {
                Err(DecodeError::UnknownSymbol(symbol.to_string()).into())
            }
        }
        ColumnKind::List(item) => {
            let items = value.as_array().ok_or_else(|| mismatch("array", value))?;
            items
                .iter()
                .map(|v| shape(v, item))
                .collect::<Result<Vec<_>, _>>()
                .map(CellValue::List)
        }
        ColumnKind::Map(_, value_col) => {
            let entries = value.as_object().ok_or_else(|| mismatch("object", value))?;
            entries
                .iter()
                .map(|(k, v)| Ok((CellValue::Str(k.clone()), shape(v, value_col)?)))
                .collect::<Result<Vec<_>, EngineError>>()
                .map(CellValue::Map)
        }
        ColumnKind::Struct(fields) => {
            let entries = value.as_object().ok_or_else(|| mismatch("object", value))?;
            let mut shaped = Vec::with_capacity(fields.len());
            for (name, field_col) in fields {
                match entries.get(name) {
                    Some(v) => shaped.push((name.clone(), shape(v, field_col)?)),
                    None if field_col.is_nullable() => {
                        shaped.push((name.clone(), CellValue::Null));
                    }
                    None => {
                        return Err(EngineError::BadRow(format!(
                            "missing json property '{name}'"
                        )))
                    }
                }
            }
            Ok(CellValue::Struct(shaped))
        }
        ColumnKind::Union(branches) => {
            // Structural discrimination: first branch that accepts the value.
            for (tag, branch_col) in branches {
                if matches!(branch_col.kind(), ColumnKind::Null) {
                    continue;
                }
                if let Ok(shaped) = shape(value, branch_col) {
                    return Ok(CellValue::Union {
                        tag: tag.clone(),
                        value: Box::new(shaped),
                    });
                }
            }
            Err(DecodeError::UnknownUnionTag(value.to_string()).into())
        }
        other => Err(EngineError::BadRow(format!(
            "json value {value} for column {other:?}"
        ))),
    }
}

fn mismatch(expected: &str, value: &Json) -> EngineError {
    EngineError::BadRow(format!("expected json {expected}, got {value}"))
}
