//! Record-oriented (Avro) schema translation and value shaping.

use std::collections::HashMap;

use apache_avro::schema::Schema as AvroSchema;
use apache_avro::types::Value as AvroValue;

use crate::column::{ColumnDef, ColumnKind, PrimKind};
use crate::error::{DecodeError, EngineError, SchemaError};
use crate::row::CellValue;

/// Translates an Avro schema into a column definition.
pub(crate) fn to_column(schema: &AvroSchema) -> Result<ColumnDef, SchemaError> {
    let mut names = HashMap::new();
    collect_named(schema, &mut names);
    let mut visiting = Vec::new();
    translate(schema, &names, &mut visiting)
}

/// Decodes an Avro binary datum and shapes it by the column.
pub(crate) fn decode_body(
    schema: &AvroSchema,
    body: &[u8],
    column: &ColumnDef,
) -> Result<CellValue, EngineError> {
    let mut reader = body;
    let value = apache_avro::from_avro_datum(schema, &mut reader, None)
        .map_err(|e| DecodeError::Avro(e.to_string()))?;
    shape(value, column)
}

/// Registers every named schema reachable from `schema` under its fullname.
fn collect_named<'a>(schema: &'a AvroSchema, names: &mut HashMap<String, &'a AvroSchema>) {
    match schema {
        AvroSchema::Record(record) => {
            names.insert(record.name.to_string(), schema);
            for field in &record.fields {
                collect_named(&field.schema, names);
            }
        }
        AvroSchema::Enum(inner) => {
            names.insert(inner.name.to_string(), schema);
        }
        AvroSchema::Fixed(inner) => {
            names.insert(inner.name.to_string(), schema);
        }
        AvroSchema::Array(inner) => collect_named(&inner.items, names),
        AvroSchema::Map(inner) => collect_named(&inner.types, names),
        AvroSchema::Union(union) => {
            for variant in union.variants() {
                collect_named(variant, names);
            }
        }
        AvroSchema::Decimal(decimal) => collect_named(&decimal.inner, names),
        _ => {}
    }
}

fn translate(
    schema: &AvroSchema,
    names: &HashMap<String, &AvroSchema>,
    visiting: &mut Vec<String>,
) -> Result<ColumnDef, SchemaError> {
    match schema {
        AvroSchema::Null => Ok(ColumnDef::null()),
        AvroSchema::Boolean => Ok(ColumnDef::prim(PrimKind::Bool)),
        AvroSchema::Int => Ok(ColumnDef::prim(PrimKind::Int32)),
        AvroSchema::Long => Ok(ColumnDef::prim(PrimKind::Int64)),
        AvroSchema::Float => Ok(ColumnDef::prim(PrimKind::Float32)),
        AvroSchema::Double => Ok(ColumnDef::prim(PrimKind::Float64)),
        AvroSchema::Bytes => Ok(ColumnDef::prim(PrimKind::Bytes)),
        AvroSchema::String => Ok(ColumnDef::prim(PrimKind::Utf8)),
        AvroSchema::Uuid => Ok(ColumnDef::prim(PrimKind::Uuid)),
        AvroSchema::Date => Ok(ColumnDef::prim(PrimKind::Date)),
        AvroSchema::TimeMillis => Ok(ColumnDef::prim(PrimKind::Int32)),
        AvroSchema::TimeMicros => Ok(ColumnDef::prim(PrimKind::Int64)),
        AvroSchema::TimestampMillis
        | AvroSchema::TimestampMicros
        | AvroSchema::TimestampNanos
        | AvroSchema::LocalTimestampMillis
        | AvroSchema::LocalTimestampMicros
        | AvroSchema::LocalTimestampNanos => Ok(ColumnDef::prim(PrimKind::TimestampMicros)),
        AvroSchema::Decimal(decimal) => {
            let precision = u32::try_from(decimal.precision).unwrap_or(u32::MAX);
            let scale = u32::try_from(decimal.scale).unwrap_or(u32::MAX);
            ColumnDef::decimal(precision, scale)
        }
        AvroSchema::Array(inner) => {
            Ok(ColumnDef::list(translate(&inner.items, names, visiting)?))
        }
        AvroSchema::Map(inner) => ColumnDef::map(
            ColumnDef::prim(PrimKind::Utf8),
            translate(&inner.types, names, visiting)?,
        ),
        AvroSchema::Union(union) => {
            let variants = union.variants();
            let non_null: Vec<&AvroSchema> = variants
                .iter()
                .filter(|v| !matches!(v, AvroSchema::Null))
                .collect();
            let has_null = non_null.len() != variants.len();

            // The idiomatic optional collapses to its sibling.
            if has_null && non_null.len() == 1 {
                return Ok(translate(non_null[0], names, visiting)?.nullable());
            }

            let mut branches = Vec::with_capacity(variants.len());
            for variant in variants {
                branches.push((branch_tag(variant), translate(variant, names, visiting)?));
            }
            let union_col = ColumnDef::union(branches)?;
            Ok(if has_null { union_col.nullable() } else { union_col })
        }
        AvroSchema::Record(record) => {
            let fullname = record.name.to_string();
            visiting.push(fullname.clone());
            let mut fields = Vec::with_capacity(record.fields.len());
            for field in &record.fields {
                fields.push((
                    field.name.clone(),
                    translate(&field.schema, names, visiting)?,
                ));
            }
            visiting.pop();
            ColumnDef::record(fullname, fields)
        }
        AvroSchema::Enum(inner) => {
            ColumnDef::enumeration(inner.name.to_string(), inner.symbols.clone())
        }
        AvroSchema::Fixed(inner) => Ok(ColumnDef::fixed(inner.size)),
        AvroSchema::Ref { name } => {
            let fullname = name.to_string();
            if visiting.contains(&fullname) {
                return Err(SchemaError::Recursion(fullname));
            }
            let target = names
                .get(&fullname)
                .ok_or_else(|| SchemaError::UnresolvedReference(fullname.clone()))?;
            translate(target, names, visiting)
        }
        other => Err(SchemaError::Unsupported(format!("avro schema {other:?}"))),
    }
}

/// Returns the union branch tag for a variant schema.
fn branch_tag(schema: &AvroSchema) -> String {
    match schema {
        AvroSchema::Null => "null".to_string(),
        AvroSchema::Boolean => "boolean".to_string(),
        AvroSchema::Int => "int".to_string(),
        AvroSchema::Long => "long".to_string(),
        AvroSchema::Float => "float".to_string(),
        AvroSchema::Double => "double".to_string(),
        AvroSchema::Bytes => "bytes".to_string(),
        AvroSchema::String => "string".to_string(),
        AvroSchema::Array(_) => "array".to_string(),
        AvroSchema::Map(_) => "map".to_string(),
        AvroSchema::Record(record) => record.name.to_string(),
        AvroSchema::Enum(inner) => inner.name.to_string(),
        AvroSchema::Fixed(inner) => inner.name.to_string(),
        AvroSchema::Ref { name } => name.to_string(),
        AvroSchema::Uuid => "uuid".to_string(),
        AvroSchema::Date => "date".to_string(),
        AvroSchema::Decimal(_) => "decimal".to_string(),
        other => format!("{other:?}").to_lowercase(),
    }
}

/// Walks a decoded Avro value against the column definition.
#[allow(clippy::too_many_lines)]
pub(crate) fn shape(value: AvroValue, column: &ColumnDef) -> Result<CellValue, EngineError> {
    match value {
        AvroValue::Null => Ok(CellValue::Null),
        AvroValue::Union(idx, inner) => shape_union(idx, *inner, column),
        AvroValue::Boolean(b) => Ok(CellValue::Bool(b)),
        AvroValue::Int(v) => Ok(CellValue::Int32(v)),
        AvroValue::Long(v) => match column.kind() {
            ColumnKind::Prim(PrimKind::TimestampMicros) => Ok(CellValue::TimestampMicros(v)),
            _ => Ok(CellValue::Int64(v)),
        },
        AvroValue::Float(v) => Ok(CellValue::Float32(v)),
        AvroValue::Double(v) => Ok(CellValue::Float64(v)),
        AvroValue::Bytes(b) => Ok(CellValue::Bytes(b)),
        AvroValue::String(s) => match column.kind() {
            ColumnKind::Enum { symbols, .. } => {
                if symbols.contains(&s) {
                    Ok(CellValue::Enum(s))
                } else {
                    Err(DecodeError::UnknownSymbol(s).into())
                }
            }
            _ => Ok(CellValue::Str(s)),
        },
        AvroValue::Fixed(len, bytes) => {
            if let ColumnKind::Fixed(expected) = column.kind() {
                if len != *expected {
                    return Err(DecodeError::FixedLength {
                        expected: *expected,
                        got: len,
                    }
                    .into());
                }
            }
            Ok(CellValue::Bytes(bytes))
        }
        AvroValue::Enum(_, symbol) => match column.kind() {
            ColumnKind::Enum { symbols, .. } if symbols.contains(&symbol) => {
                Ok(CellValue::Enum(symbol))
            }
            ColumnKind::Enum { .. } => Err(DecodeError::UnknownSymbol(symbol).into()),
            _ => Ok(CellValue::Str(symbol)),
        },
        AvroValue::Array(items) => {
            let item_col = match column.kind() {
                ColumnKind::List(item) => item,
                other => {
                    return Err(EngineError::BadRow(format!(
                        "avro array for non-list column {other:?}"
                    )))
                }
            };
            items
                .into_iter()
                .map(|item| shape(item, item_col))
                .collect::<Result<Vec<_>, _>>()
                .map(CellValue::List)
        }
        AvroValue::Map(entries) => {
            let value_col = match column.kind() {
                ColumnKind::Map(_, value) => value,
                other => {
                    return Err(EngineError::BadRow(format!(
                        "avro map for non-map column {other:?}"
                    )))
                }
            };
            let mut pairs: Vec<(String, AvroValue)> = entries.into_iter().collect();
            pairs.sort_by(|(a, _), (b, _)| a.cmp(b));
            pairs
                .into_iter()
                .map(|(k, v)| Ok((CellValue::Str(k), shape(v, value_col)?)))
                .collect::<Result<Vec<_>, EngineError>>()
                .map(CellValue::Map)
        }
        AvroValue::Record(mut cells) => {
            let fields = match column.kind() {
                ColumnKind::Struct(fields) => fields,
                other => {
                    return Err(EngineError::BadRow(format!(
                        "avro record for non-struct column {other:?}"
                    )))
                }
            };
            let mut shaped = Vec::with_capacity(fields.len());
            for (name, field_col) in fields {
                let found = cells
                    .iter()
                    .position(|(cell_name, _)| cell_name == name)
                    .map(|i| cells.remove(i).1);
                match found {
                    Some(value) => shaped.push((name.clone(), shape(value, field_col)?)),
                    None if field_col.is_nullable() => {
                        shaped.push((name.clone(), CellValue::Null));
                    }
                    None => {
                        return Err(EngineError::BadRow(format!(
                            "missing avro record field '{name}'"
                        )))
                    }
                }
            }
            Ok(CellValue::Struct(shaped))
        }
        AvroValue::Date(days) => Ok(CellValue::Date(days)),
        AvroValue::TimeMillis(v) => Ok(CellValue::Int32(v)),
        AvroValue::TimeMicros(v) => Ok(CellValue::Int64(v)),
        AvroValue::TimestampMillis(v) | AvroValue::LocalTimestampMillis(v) => {
            Ok(CellValue::TimestampMicros(v.saturating_mul(1000)))
        }
        AvroValue::TimestampMicros(v) | AvroValue::LocalTimestampMicros(v) => {
            Ok(CellValue::TimestampMicros(v))
        }
        AvroValue::TimestampNanos(v) | AvroValue::LocalTimestampNanos(v) => {
            Ok(CellValue::TimestampMicros(v / 1000))
        }
        AvroValue::Uuid(u) => Ok(CellValue::Uuid(u)),
        AvroValue::Decimal(decimal) => {
            let scale = match column.kind() {
                ColumnKind::Decimal { scale, .. } => *scale,
                other => {
                    return Err(EngineError::BadRow(format!(
                        "avro decimal for non-decimal column {other:?}"
                    )))
                }
            };
            let bytes = <Vec<u8>>::try_from(&decimal)
                .map_err(|e| DecodeError::Avro(e.to_string()))?;
            Ok(CellValue::Decimal {
                unscaled: be_bytes_to_i128(&bytes)?,
                scale,
            })
        }
        other => Err(EngineError::BadRow(format!(
            "unsupported avro value {other:?}"
        ))),
    }
}

fn shape_union(idx: u32, inner: AvroValue, column: &ColumnDef) -> Result<CellValue, EngineError> {
    match column.kind() {
        ColumnKind::Union(branches) => {
            let (tag, branch_col) =
                branches.get(idx as usize).ok_or_else(|| {
                    EngineError::Decode(DecodeError::UnknownUnionTag(idx.to_string()))
                })?;
            if matches!(branch_col.kind(), ColumnKind::Null) {
                return Ok(CellValue::Null);
            }
            Ok(CellValue::Union {
                tag: tag.clone(),
                value: Box::new(shape(inner, branch_col)?),
            })
        }
        // A two-branch [null, T] union collapsed to nullable T.
        _ => shape(inner, column),
    }
}

/// Interprets big-endian two's-complement bytes as an `i128`.
fn be_bytes_to_i128(bytes: &[u8]) -> Result<i128, EngineError> {
    if bytes.len() > 16 {
        return Err(EngineError::BadRow(format!(
            "decimal unscaled value of {} bytes exceeds 128 bits",
            bytes.len()
        )));
    }
    let negative = bytes.first().is_some_and(|b| b & 0x80 != 0);
    let mut buf = [if negative { 0xff } else { 0x00 }; 16];
    buf[16 - bytes.len()..].copy_from_slice(bytes);
    Ok(i128::from_be_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::ColumnStrategy;

    fn parse(json: &str) -> AvroSchema {
        AvroSchema::parse_str(json).unwrap()
    }

    #[test]
    fn primitive_schema_mapping() {
        assert_eq!(
            to_column(&parse(r#""int""#)).unwrap(),
            ColumnDef::prim(PrimKind::Int32)
        );
        assert_eq!(
            to_column(&parse(r#""string""#)).unwrap(),
            ColumnDef::prim(PrimKind::Utf8)
        );
        assert_eq!(
            to_column(&parse(r#""bytes""#)).unwrap(),
            ColumnDef::prim(PrimKind::Bytes)
        );
    }

    #[test]
    fn record_preserves_field_order() {
        let schema = parse(
            r#"{"type":"record","name":"r","fields":[
                {"name":"a","type":"int"},
                {"name":"b","type":"string"}
            ]}"#,
        );
        let column = to_column(&schema).unwrap();
        match column.kind() {
            ColumnKind::Struct(fields) => {
                assert_eq!(fields[0].0, "a");
                assert_eq!(fields[1].0, "b");
            }
            other => panic!("expected struct, got {other:?}"),
        }
    }

    #[test]
    fn optional_union_collapses_to_nullable_sibling() {
        let schema = parse(r#"["null", "string"]"#);
        let column = to_column(&schema).unwrap();
        assert_eq!(column.kind(), &ColumnKind::Prim(PrimKind::Utf8));
        assert_eq!(column.strategy(), &ColumnStrategy::Nullable);
    }

    #[test]
    fn wider_union_keeps_null_tag() {
        let schema = parse(r#"["null", "string", "long"]"#);
        let column = to_column(&schema).unwrap();
        match column.kind() {
            ColumnKind::Union(branches) => {
                assert_eq!(branches[0].0, "null");
                assert_eq!(branches[1].0, "string");
                assert_eq!(branches[2].0, "long");
            }
            other => panic!("expected union, got {other:?}"),
        }
        assert!(column.is_nullable());
    }

    #[test]
    fn logical_types_map_to_columns() {
        let schema = parse(
            r#"{"type":"record","name":"r","fields":[
                {"name":"price","type":{"type":"bytes","logicalType":"decimal","precision":10,"scale":2}},
                {"name":"day","type":{"type":"int","logicalType":"date"}},
                {"name":"at","type":{"type":"long","logicalType":"timestamp-micros"}},
                {"name":"tag","type":{"type":"string","logicalType":"uuid"}}
            ]}"#,
        );
        let column = to_column(&schema).unwrap();
        match column.kind() {
            ColumnKind::Struct(fields) => {
                assert_eq!(
                    fields[0].1.kind(),
                    &ColumnKind::Decimal {
                        precision: 10,
                        scale: 2
                    }
                );
                assert_eq!(fields[1].1.kind(), &ColumnKind::Prim(PrimKind::Date));
                assert_eq!(
                    fields[2].1.kind(),
                    &ColumnKind::Prim(PrimKind::TimestampMicros)
                );
                assert_eq!(fields[3].1.kind(), &ColumnKind::Prim(PrimKind::Uuid));
            }
            other => panic!("expected struct, got {other:?}"),
        }
    }

    #[test]
    fn enum_fixed_array_map() {
        let schema = parse(
            r#"{"type":"record","name":"r","fields":[
                {"name":"e","type":{"type":"enum","name":"E","symbols":["A","B"]}},
                {"name":"f","type":{"type":"fixed","name":"F","size":16}},
                {"name":"l","type":{"type":"array","items":"long"}},
                {"name":"m","type":{"type":"map","values":"double"}}
            ]}"#,
        );
        let column = to_column(&schema).unwrap();
        match column.kind() {
            ColumnKind::Struct(fields) => {
                assert!(matches!(fields[0].1.kind(), ColumnKind::Enum { .. }));
                assert_eq!(fields[1].1.kind(), &ColumnKind::Fixed(16));
                assert!(matches!(fields[2].1.kind(), ColumnKind::List(_)));
                assert!(matches!(fields[3].1.kind(), ColumnKind::Map(_, _)));
            }
            other => panic!("expected struct, got {other:?}"),
        }
    }

    #[test]
    fn recursive_record_is_rejected() {
        let schema = parse(
            r#"{"type":"record","name":"Node","fields":[
                {"name":"next","type":["null","Node"]}
            ]}"#,
        );
        assert!(matches!(
            to_column(&schema),
            Err(SchemaError::Recursion(name)) if name == "Node"
        ));
    }

    #[test]
    fn nonrecursive_reference_resolves() {
        let schema = parse(
            r#"{"type":"record","name":"Pair","fields":[
                {"name":"left","type":{"type":"record","name":"P","fields":[{"name":"x","type":"int"}]}},
                {"name":"right","type":"P"}
            ]}"#,
        );
        let column = to_column(&schema).unwrap();
        match column.kind() {
            ColumnKind::Struct(fields) => {
                assert_eq!(fields[0].1.kind(), fields[1].1.kind());
            }
            other => panic!("expected struct, got {other:?}"),
        }
    }

    #[test]
    fn translation_is_deterministic() {
        let text = r#"{"type":"record","name":"r","fields":[
            {"name":"a","type":["null","int"]},
            {"name":"b","type":{"type":"map","values":"string"}}
        ]}"#;
        assert_eq!(
            to_column(&parse(text)).unwrap(),
            to_column(&parse(text)).unwrap()
        );
    }

    #[test]
    fn decode_round_trips_a_record() {
        let schema = parse(
            r#"{"type":"record","name":"r","fields":[
                {"name":"a","type":"int"},
                {"name":"b","type":"string"}
            ]}"#,
        );
        let column = to_column(&schema).unwrap();
        let datum = apache_avro::to_avro_datum(
            &schema,
            AvroValue::Record(vec![
                ("a".to_string(), AvroValue::Int(7)),
                ("b".to_string(), AvroValue::String("x".to_string())),
            ]),
        )
        .unwrap();

        let cell = decode_body(&schema, &datum, &column).unwrap();
        assert_eq!(
            cell,
            CellValue::Struct(vec![
                ("a".to_string(), CellValue::Int32(7)),
                ("b".to_string(), CellValue::Str("x".to_string())),
            ])
        );
    }

    #[test]
    fn decode_optional_union() {
        let schema = parse(r#"["null", "string"]"#);
        let column = to_column(&schema).unwrap();

        let some = apache_avro::to_avro_datum(
            &schema,
            AvroValue::Union(1, Box::new(AvroValue::String("hi".to_string()))),
        )
        .unwrap();
        assert_eq!(
            decode_body(&schema, &some, &column).unwrap(),
            CellValue::Str("hi".to_string())
        );

        let none =
            apache_avro::to_avro_datum(&schema, AvroValue::Union(0, Box::new(AvroValue::Null)))
                .unwrap();
        assert_eq!(decode_body(&schema, &none, &column).unwrap(), CellValue::Null);
    }

    #[test]
    fn decode_decimal_preserves_exact_value() {
        let schema = parse(
            r#"{"type":"bytes","logicalType":"decimal","precision":10,"scale":2}"#,
        );
        let column = to_column(&schema).unwrap();
        let unscaled: i128 = 12345;
        let bytes = unscaled.to_be_bytes();
        // Minimal two's-complement representation.
        let datum = apache_avro::to_avro_datum(
            &schema,
            AvroValue::Decimal(apache_avro::Decimal::from(&bytes[14..])),
        )
        .unwrap();
        assert_eq!(
            decode_body(&schema, &datum, &column).unwrap(),
            CellValue::Decimal {
                unscaled: 12345,
                scale: 2
            }
        );
    }

    #[test]
    fn decode_unknown_enum_symbol_fails() {
        let column = ColumnDef::enumeration("E", vec!["A".to_string()]).unwrap();
        let err = shape(AvroValue::Enum(1, "B".to_string()), &column).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Decode(DecodeError::UnknownSymbol(_))
        ));
    }

    #[test]
    fn fixed_length_is_enforced() {
        let column = ColumnDef::fixed(4);
        let err = shape(AvroValue::Fixed(2, vec![1, 2]), &column).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Decode(DecodeError::FixedLength { expected: 4, got: 2 })
        ));
    }

    #[test]
    fn negative_decimal_bytes() {
        assert_eq!(be_bytes_to_i128(&[0xff, 0x85]).unwrap(), -123);
        assert_eq!(be_bytes_to_i128(&[0x00, 0x7b]).unwrap(), 123);
        assert_eq!(be_bytes_to_i128(&[0x85]).unwrap(), -123);
    }
}
