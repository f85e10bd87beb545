//! Per-topic tables and prepared inserts.
//!
//! [`TableManager`] creates (or verifies) one analytic table per topic and
//! executes the prepared insert for each shaped row. The table layout is a
//! single leading `rowkey` column followed by the value columns from
//! [`ColumnDef::flatten_top_level`]; the insert arity comes from that same
//! flattening at creation time.
//!
//! Primitive cells bind as native driver values. Decimal, enum, uuid, and
//! composite cells bind as dialect text, and the prepared insert wraps
//! those parameters in an explicit `CAST(? AS <type>)` so the engine
//! parses the text with the column's own literal syntax.
//!
//! Top-level table columns are rendered nullable regardless of the
//! translated strategy: the log may deliver tombstones, which materialize
//! as all-null value rows.

use std::sync::Arc;

use duckdb::types::{TimeUnit, Value as DuckValue};
use duckdb::Connection;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::column::{quote_ident, ColumnDef, ColumnKind, PrimKind};
use crate::decode::column_for_tag;
use crate::error::EngineError;
use crate::row::{format_decimal, CellValue, Row};
use crate::schema::ResolvedSchema;
use crate::translate;

/// Name of the leading key column of every topic table.
pub const KEY_COLUMN: &str = "rowkey";

/// The immutable binding between a topic and its table.
#[derive(Debug, Clone)]
pub struct TopicBinding {
    /// The topic, used verbatim as the table name.
    pub topic: String,
    /// The resolved key schema.
    pub key_schema: ResolvedSchema,
    /// The resolved value schema.
    pub value_schema: ResolvedSchema,
    /// The key column definition.
    pub key_column: ColumnDef,
    /// The value column definition.
    pub value_column: ColumnDef,
    /// The flattened positional value columns.
    pub value_fields: Vec<(String, ColumnDef)>,
    /// The `CREATE TABLE` DDL that was issued.
    pub create_ddl: String,
    /// The prepared insert statement text.
    pub insert_sql: String,
    /// The insert arity: `1 + |value columns|`.
    pub insert_arity: usize,
}

/// Creates tables and executes prepared inserts against the analytic
/// engine.
#[derive(Clone)]
pub struct TableManager {
    conn: Arc<Mutex<Connection>>,
}

impl TableManager {
    /// Wraps a shared analytic engine connection.
    #[must_use]
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Derives the binding for a topic and creates or verifies its table.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Schema`] when translation fails,
    /// [`EngineError::Sink`] when the DDL is rejected, and
    /// [`EngineError::Config`] when an existing table has a different
    /// arity.
    pub fn bind_topic(
        &self,
        topic: &str,
        key_schema: &ResolvedSchema,
        value_schema: &ResolvedSchema,
    ) -> Result<TopicBinding, EngineError> {
        let key_column = column_for(key_schema, true)?;
        let value_column = column_for(value_schema, false)?;
        let value_fields = value_column.flatten_top_level()?;

        let mut columns = Vec::with_capacity(1 + value_fields.len());
        columns.push(format!(
            "{} {}",
            quote_ident(KEY_COLUMN),
            key_column.type_ddl()
        ));
        for (name, column) in &value_fields {
            columns.push(format!("{} {}", quote_ident(name), column.type_ddl()));
        }

        let create_ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quote_ident(topic),
            columns.join(", ")
        );
        let insert_arity = 1 + value_fields.len();
        let mut params = Vec::with_capacity(insert_arity);
        params.push(placeholder_for(&key_column));
        for (_, column) in &value_fields {
            params.push(placeholder_for(column));
        }
        let insert_sql = format!(
            "INSERT INTO {} VALUES ({})",
            quote_ident(topic),
            params.join(", ")
        );

        {
            let conn = self.conn.lock();
            conn.execute_batch(&create_ddl)?;

            let actual: i64 = conn.query_row(
                "SELECT count(*) FROM pragma_table_info(?)",
                [topic],
                |row| row.get(0),
            )?;
            if actual != insert_arity as i64 {
                return Err(EngineError::Config(format!(
                    "table '{topic}' exists with {actual} columns, expected {insert_arity}"
                )));
            }
        }

        info!(topic, arity = insert_arity, ddl = %create_ddl, "bound topic table");
        Ok(TopicBinding {
            topic: topic.to_string(),
            key_schema: key_schema.clone(),
            value_schema: value_schema.clone(),
            key_column,
            value_column,
            value_fields,
            create_ddl,
            insert_sql,
            insert_arity,
        })
    }

    /// Executes the prepared insert for one row.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::BadRow`] on an arity mismatch and
    /// [`EngineError::Sink`] when the engine rejects the insert.
    pub fn insert(&self, binding: &TopicBinding, row: &Row) -> Result<(), EngineError> {
        if row.len() != binding.insert_arity {
            return Err(EngineError::BadRow(format!(
                "row of {} cells for insert arity {}",
                row.len(),
                binding.insert_arity
            )));
        }
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&binding.insert_sql)?;
        stmt.execute(duckdb::params_from_iter(row.iter().map(cell_to_param)))?;
        debug!(topic = %binding.topic, "inserted row");
        Ok(())
    }

    /// Returns the shared connection, for queries against ingested tables.
    #[must_use]
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        self.conn.clone()
    }
}

impl std::fmt::Debug for TableManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableManager").finish_non_exhaustive()
    }
}

fn column_for(resolved: &ResolvedSchema, is_key: bool) -> Result<ColumnDef, EngineError> {
    match resolved {
        ResolvedSchema::Primitive(tag) => Ok(column_for_tag(*tag)),
        ResolvedSchema::Parsed { schema, .. } => {
            Ok(translate::to_column(schema, is_key)?)
        }
    }
}

/// Returns the insert placeholder for one column: bare for columns bound
/// as native driver values, an explicit cast for columns bound as text.
fn placeholder_for(column: &ColumnDef) -> String {
    match column.kind() {
        ColumnKind::Prim(PrimKind::Uuid) => format!("CAST(? AS {})", column.type_ddl()),
        ColumnKind::Prim(_) | ColumnKind::Fixed(_) => "?".to_string(),
        _ => format!("CAST(? AS {})", column.type_ddl()),
    }
}

/// Converts a cell to a driver value.
///
/// Decimal, enum, uuid, and composite cells become dialect text; the
/// matching insert placeholder casts them to the column type.
fn cell_to_param(cell: &CellValue) -> DuckValue {
    match cell {
        CellValue::Null => DuckValue::Null,
        CellValue::Bool(b) => DuckValue::Boolean(*b),
        CellValue::Int8(v) => DuckValue::TinyInt(*v),
        CellValue::Int16(v) => DuckValue::SmallInt(*v),
        CellValue::Int32(v) => DuckValue::Int(*v),
        CellValue::Int64(v) => DuckValue::BigInt(*v),
        CellValue::UInt8(v) => DuckValue::UTinyInt(*v),
        CellValue::UInt16(v) => DuckValue::USmallInt(*v),
        CellValue::UInt32(v) => DuckValue::UInt(*v),
        CellValue::UInt64(v) => DuckValue::UBigInt(*v),
        CellValue::Float32(v) => DuckValue::Float(*v),
        CellValue::Float64(v) => DuckValue::Double(*v),
        CellValue::Str(s) => DuckValue::Text(s.clone()),
        CellValue::Bytes(b) => DuckValue::Blob(b.clone()),
        CellValue::Date(days) => DuckValue::Date32(*days),
        CellValue::TimestampMicros(v) => DuckValue::Timestamp(TimeUnit::Microsecond, *v),
        CellValue::Uuid(u) => DuckValue::Text(u.to_string()),
        CellValue::Decimal { unscaled, scale } => {
            DuckValue::Text(format_decimal(*unscaled, *scale))
        }
        CellValue::Enum(symbol) => DuckValue::Text(symbol.clone()),
        composite @ (CellValue::List(_)
        | CellValue::Map(_)
        | CellValue::Struct(_)
        | CellValue::Union { .. }) => DuckValue::Text(literal_text(composite)),
    }
}

/// Renders a cell as a dialect text literal, for nested positions.
fn literal_text(cell: &CellValue) -> String {
    match cell {
        CellValue::Null => "NULL".to_string(),
        CellValue::Bool(b) => b.to_string(),
        CellValue::Int8(v) => v.to_string(),
        CellValue::Int16(v) => v.to_string(),
        CellValue::Int32(v) => v.to_string(),
        CellValue::Int64(v) => v.to_string(),
        CellValue::UInt8(v) => v.to_string(),
        CellValue::UInt16(v) => v.to_string(),
        CellValue::UInt32(v) => v.to_string(),
        CellValue::UInt64(v) => v.to_string(),
        CellValue::Float32(v) => v.to_string(),
        CellValue::Float64(v) => v.to_string(),
        CellValue::Str(s) | CellValue::Enum(s) => quote_text(s),
        CellValue::Bytes(b) => quote_text(&hex_blob(b)),
        CellValue::Date(days) => quote_text(&civil_date(*days)),
        CellValue::TimestampMicros(v) => quote_text(&civil_timestamp(*v)),
        CellValue::Uuid(u) => quote_text(&u.to_string()),
        CellValue::Decimal { unscaled, scale } => format_decimal(*unscaled, *scale),
        CellValue::List(items) => {
            let parts: Vec<String> = items.iter().map(literal_text).collect();
            format!("[{}]", parts.join(", "))
        }
        CellValue::Map(entries) => {
            let parts: Vec<String> = entries
                .iter()
                .map(|(k, v)| format!("{}={}", map_key_text(k), literal_text(v)))
                .collect();
            format!("{{{}}}", parts.join(", "))
        }
        CellValue::Struct(fields) => {
            let parts: Vec<String> = fields
                .iter()
                .map(|(name, v)| format!("{}: {}", quote_text(name), literal_text(v)))
                .collect();
            format!("{{{}}}", parts.join(", "))
        }
        // The engine re-discriminates a union cast from text by member
        // type, so the literal is the inner value.
        CellValue::Union { value, .. } => literal_text(value),
    }
}

fn map_key_text(key: &CellValue) -> String {
    match key {
        CellValue::Str(s) | CellValue::Enum(s) => s.clone(),
        other => literal_text(other),
    }
}

fn quote_text(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

fn hex_blob(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 4);
    for b in bytes {
        out.push_str(&format!("\\x{b:02X}"));
    }
    out
}

/// Civil date for a day offset from the Unix epoch.
fn civil_date(days: i32) -> String {
    // Howard Hinnant's civil_from_days.
    let z = i64::from(days) + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };
    format!("{y:04}-{m:02}-{d:02}")
}

fn civil_timestamp(micros: i64) -> String {
    let days = micros.div_euclid(86_400_000_000);
    let in_day = micros.rem_euclid(86_400_000_000);
    let seconds = in_day / 1_000_000;
    let sub = in_day % 1_000_000;
    let (h, m, s) = (seconds / 3600, (seconds / 60) % 60, seconds % 60);
    #[allow(clippy::cast_possible_truncation)]
    let date = civil_date(days as i32);
    format!("{date} {h:02}:{m:02}:{s:02}.{sub:06}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::PrimitiveTag;

    fn manager() -> TableManager {
        TableManager::new(Arc::new(Mutex::new(
            Connection::open_in_memory().unwrap(),
        )))
    }

    fn primitive(tag: PrimitiveTag) -> ResolvedSchema {
        ResolvedSchema::Primitive(tag)
    }

    fn parsed_avro(schema_text: &str) -> ResolvedSchema {
        let parsed = crate::schema::registry::parse_schema_text(
            crate::schema::SchemaFamily::Avro,
            schema_text,
            &[],
        )
        .unwrap();
        ResolvedSchema::Parsed {
            id: -1,
            schema: Arc::new(parsed),
        }
    }

    #[test]
    fn binds_a_primitive_topic() {
        let tables = manager();
        let binding = tables
            .bind_topic(
                "raw",
                &primitive(PrimitiveTag::Binary),
                &primitive(PrimitiveTag::Long),
            )
            .unwrap();
        assert_eq!(binding.insert_arity, 2);
        assert_eq!(
            binding.create_ddl,
            "CREATE TABLE IF NOT EXISTS \"raw\" (\"rowkey\" BLOB, \"value\" BIGINT)"
        );
        assert_eq!(binding.insert_sql, "INSERT INTO \"raw\" VALUES (?, ?)");
    }

    #[test]
    fn insert_and_read_back() {
        let tables = manager();
        let binding = tables
            .bind_topic(
                "t",
                &primitive(PrimitiveTag::String),
                &primitive(PrimitiveTag::Long),
            )
            .unwrap();

        tables
            .insert(
                &binding,
                &vec![CellValue::Str("k".to_string()), CellValue::Int64(7)],
            )
            .unwrap();
        tables
            .insert(&binding, &vec![CellValue::Null, CellValue::Null])
            .unwrap();

        let conn = tables.connection();
        let conn = conn.lock();
        let count: i64 = conn
            .query_row("SELECT count(*) FROM \"t\"", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 2);
        let value: i64 = conn
            .query_row(
                "SELECT \"value\" FROM \"t\" WHERE \"rowkey\" = 'k'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn arity_mismatch_is_rejected() {
        let tables = manager();
        let binding = tables
            .bind_topic(
                "t",
                &primitive(PrimitiveTag::Binary),
                &primitive(PrimitiveTag::Long),
            )
            .unwrap();
        let err = tables
            .insert(&binding, &vec![CellValue::Null])
            .unwrap_err();
        assert!(matches!(err, EngineError::BadRow(_)));
    }

    #[test]
    fn existing_table_with_wrong_arity_is_a_config_error() {
        let tables = manager();
        {
            let conn = tables.connection();
            let conn = conn.lock();
            conn.execute_batch("CREATE TABLE \"t\" (a INTEGER, b INTEGER, c INTEGER)")
                .unwrap();
        }
        let err = tables
            .bind_topic(
                "t",
                &primitive(PrimitiveTag::Binary),
                &primitive(PrimitiveTag::Long),
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn root_list_column_round_trips() {
        let tables = manager();
        let binding = tables
            .bind_topic(
                "tl",
                &primitive(PrimitiveTag::Binary),
                &parsed_avro(r#"{"type":"array","items":"long"}"#),
            )
            .unwrap();
        assert_eq!(
            binding.insert_sql,
            "INSERT INTO \"tl\" VALUES (?, CAST(? AS BIGINT[]))"
        );

        tables
            .insert(
                &binding,
                &vec![
                    CellValue::Null,
                    CellValue::List(vec![
                        CellValue::Int64(5),
                        CellValue::Int64(6),
                        CellValue::Int64(7),
                    ]),
                ],
            )
            .unwrap();
        tables
            .insert(&binding, &vec![CellValue::Null, CellValue::List(vec![])])
            .unwrap();

        let conn = tables.connection();
        let conn = conn.lock();
        let rows: Vec<(i64, Option<i64>)> = conn
            .prepare("SELECT len(\"value\"), \"value\"[1] FROM \"tl\" ORDER BY 1 DESC")
            .unwrap()
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(rows, vec![(3, Some(5)), (0, None)]);

        // The empty list lands as a sequence, not as null.
        let nulls: i64 = conn
            .query_row(
                "SELECT count(*) FROM \"tl\" WHERE \"value\" IS NULL",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(nulls, 0);
    }

    #[test]
    fn root_map_column_round_trips() {
        let tables = manager();
        let binding = tables
            .bind_topic(
                "tm",
                &primitive(PrimitiveTag::Binary),
                &parsed_avro(r#"{"type":"map","values":"long"}"#),
            )
            .unwrap();
        assert_eq!(
            binding.insert_sql,
            "INSERT INTO \"tm\" VALUES (?, CAST(? AS MAP(VARCHAR, BIGINT)))"
        );

        tables
            .insert(
                &binding,
                &vec![
                    CellValue::Null,
                    CellValue::Map(vec![
                        (CellValue::Str("k1".to_string()), CellValue::Int64(10)),
                        (CellValue::Str("k2".to_string()), CellValue::Int64(20)),
                    ]),
                ],
            )
            .unwrap();

        let conn = tables.connection();
        let conn = conn.lock();
        let (size, k1): (i64, Option<i64>) = conn
            .query_row(
                "SELECT CAST(cardinality(\"value\") AS BIGINT), \"value\"['k1'] FROM \"tm\"",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(size, 2);
        assert_eq!(k1, Some(10));
    }

    #[test]
    fn decimal_binds_exactly_through_text() {
        let tables = manager();
        {
            let conn = tables.connection();
            let conn = conn.lock();
            conn.execute_batch("CREATE TABLE d (price DECIMAL(10, 2))")
                .unwrap();
            let mut stmt = conn
                .prepare("INSERT INTO d VALUES (CAST(? AS DECIMAL(10, 2)))")
                .unwrap();
            stmt.execute([cell_to_param(&CellValue::Decimal {
                unscaled: 12345,
                scale: 2,
            })])
            .unwrap();
            let text: String = conn
                .query_row("SELECT CAST(price AS VARCHAR) FROM d", [], |row| {
                    row.get(0)
                })
                .unwrap();
            assert_eq!(text, "123.45");
        }
    }

    #[test]
    fn literal_rendering() {
        assert_eq!(
            literal_text(&CellValue::List(vec![
                CellValue::Int32(1),
                CellValue::Int32(2)
            ])),
            "[1, 2]"
        );
        assert_eq!(
            literal_text(&CellValue::Struct(vec![
                ("a".to_string(), CellValue::Int32(1)),
                ("b".to_string(), CellValue::Str("x'y".to_string())),
            ])),
            "{'a': 1, 'b': 'x''y'}"
        );
        assert_eq!(
            literal_text(&CellValue::Map(vec![(
                CellValue::Str("k".to_string()),
                CellValue::Int64(3)
            )])),
            "{k=3}"
        );
        assert_eq!(
            literal_text(&CellValue::Union {
                tag: "s".to_string(),
                value: Box::new(CellValue::Str("v".to_string())),
            }),
            "'v'"
        );
    }

    #[test]
    fn civil_date_formatting() {
        assert_eq!(civil_date(0), "1970-01-01");
        assert_eq!(civil_date(19_723), "2024-01-01");
        assert_eq!(civil_date(-1), "1969-12-31");
        assert_eq!(
            civil_timestamp(1_700_000_000_000_000),
            "2023-11-14 22:13:20.000000"
        );
    }
}
