//! Decoded cell values and positional row shaping.
//!
//! [`CellValue`] is the decoded counterpart of [`ColumnDef`]: family
//! decoders produce a cell tree shaped by the resolved column, and
//! [`shape_row`] applies the top-level flattening contract to produce the
//! positional row `[key, value-col-1, …, value-col-k]`.

use crate::column::{ColumnDef, ColumnKind};
use crate::error::EngineError;

/// A decoded value, shaped by a [`ColumnDef`].
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    /// SQL NULL.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed 8-bit integer.
    Int8(i8),
    /// Signed 16-bit integer.
    Int16(i16),
    /// Signed 32-bit integer.
    Int32(i32),
    /// Signed 64-bit integer.
    Int64(i64),
    /// Unsigned 8-bit integer.
    UInt8(u8),
    /// Unsigned 16-bit integer.
    UInt16(u16),
    /// Unsigned 32-bit integer.
    UInt32(u32),
    /// Unsigned 64-bit integer.
    UInt64(u64),
    /// 32-bit float.
    Float32(f32),
    /// 64-bit float.
    Float64(f64),
    /// UTF-8 string.
    Str(String),
    /// Byte string (variable or fixed width).
    Bytes(Vec<u8>),
    /// Days since the Unix epoch.
    Date(i32),
    /// Microseconds since the Unix epoch.
    TimestampMicros(i64),
    /// UUID.
    Uuid(uuid::Uuid),
    /// Exact decimal as an unscaled integer plus scale.
    Decimal {
        /// The unscaled value.
        unscaled: i128,
        /// Number of fractional digits.
        scale: u32,
    },
    /// An enum symbol.
    Enum(String),
    /// A decoded sequence of shaped items.
    List(Vec<CellValue>),
    /// A decoded sequence of shaped key/value pairs, insertion-ordered.
    Map(Vec<(CellValue, CellValue)>),
    /// A positional tuple in field order.
    Struct(Vec<(String, CellValue)>),
    /// A discriminated branch value.
    Union {
        /// The inhabited branch's tag.
        tag: String,
        /// The shaped branch value.
        value: Box<CellValue>,
    },
}

impl CellValue {
    /// Returns `true` for SQL NULL.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }
}

/// A positional row matching a prepared insert.
pub type Row = Vec<CellValue>;

/// Renders a decimal cell as its canonical text form, e.g. `-123.45`.
#[must_use]
pub fn format_decimal(unscaled: i128, scale: u32) -> String {
    if scale == 0 {
        return unscaled.to_string();
    }
    let negative = unscaled < 0;
    let digits = unscaled.unsigned_abs().to_string();
    let scale = scale as usize;
    let (int_part, frac_part) = if digits.len() > scale {
        let split = digits.len() - scale;
        (digits[..split].to_string(), digits[split..].to_string())
    } else {
        ("0".to_string(), format!("{digits:0>scale$}"))
    };
    let sign = if negative { "-" } else { "" };
    format!("{sign}{int_part}.{frac_part}")
}

/// Shapes a decoded key and value into the positional row.
///
/// When the value column is a `Struct`, its top-level fields follow the key
/// positionally; a null value yields nulls for every value column. For any
/// other value column the row is `[key, value]`.
///
/// # Errors
///
/// Returns [`EngineError::BadRow`] when the value tree does not fit the
/// column shape, including a missing field for a non-nullable column.
pub fn shape_row(
    key: CellValue,
    value: CellValue,
    value_column: &ColumnDef,
) -> Result<Row, EngineError> {
    let mut row = Vec::new();
    row.push(key);

    match value_column.kind() {
        ColumnKind::Struct(fields) => match value {
            CellValue::Null => {
                row.extend(std::iter::repeat(CellValue::Null).take(fields.len()));
            }
            CellValue::Struct(mut cells) => {
                for (name, col) in fields {
                    let found = cells
                        .iter()
                        .position(|(cell_name, _)| cell_name == name)
                        .map(|i| cells.remove(i).1);
                    match found {
                        Some(cell) => row.push(cell),
                        None if col.is_nullable() => row.push(CellValue::Null),
                        None => {
                            return Err(EngineError::BadRow(format!(
                                "missing value for non-nullable column '{name}'"
                            )))
                        }
                    }
                }
            }
            other => {
                return Err(EngineError::BadRow(format!(
                    "expected a struct value for a struct column, got {other:?}"
                )))
            }
        },
        _ => row.push(value),
    }

    Ok(row)
}
