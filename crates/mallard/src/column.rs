//! Typed, recursive column definitions and their DDL rendering.
//!
//! [`ColumnDef`] is the relational half of the schema translation: a closed
//! algebra over primitives, decimals, fixed-width bytes, enums, lists, maps,
//! structs, and tagged unions. Every node carries a [`ColumnStrategy`]
//! describing its nullability. Rendering to the analytic engine's dialect is
//! a pure function, and [`ColumnDef::flatten_top_level`] yields the
//! positional schema of a row.

use crate::error::SchemaError;

/// Primitive column kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimKind {
    /// Boolean.
    Bool,
    /// Signed 8-bit integer.
    Int8,
    /// Signed 16-bit integer.
    Int16,
    /// Signed 32-bit integer.
    Int32,
    /// Signed 64-bit integer.
    Int64,
    /// Unsigned 8-bit integer.
    UInt8,
    /// Unsigned 16-bit integer.
    UInt16,
    /// Unsigned 32-bit integer.
    UInt32,
    /// Unsigned 64-bit integer.
    UInt64,
    /// 32-bit float.
    Float32,
    /// 64-bit float.
    Float64,
    /// UTF-8 string.
    Utf8,
    /// Variable-length byte string.
    Bytes,
    /// Calendar date (days since the Unix epoch).
    Date,
    /// Microseconds since the Unix epoch.
    TimestampMicros,
    /// UUID.
    Uuid,
}

impl PrimKind {
    /// Returns the dialect type name for this primitive.
    #[must_use]
    pub fn ddl(self) -> &'static str {
        match self {
            PrimKind::Bool => "BOOLEAN",
            PrimKind::Int8 => "TINYINT",
            PrimKind::Int16 => "SMALLINT",
            PrimKind::Int32 => "INTEGER",
            PrimKind::Int64 => "BIGINT",
            PrimKind::UInt8 => "UTINYINT",
            PrimKind::UInt16 => "USMALLINT",
            PrimKind::UInt32 => "UINTEGER",
            PrimKind::UInt64 => "UBIGINT",
            PrimKind::Float32 => "FLOAT",
            PrimKind::Float64 => "DOUBLE",
            PrimKind::Utf8 => "VARCHAR",
            PrimKind::Bytes => "BLOB",
            PrimKind::Date => "DATE",
            PrimKind::TimestampMicros => "TIMESTAMP",
            PrimKind::Uuid => "UUID",
        }
    }
}

/// Nullability strategy carried by every column.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ColumnStrategy {
    /// The column rejects nulls. This is the default.
    #[default]
    NotNull,
    /// The column accepts nulls.
    Nullable,
    /// The column fills missing values with a default expression.
    Default(String),
}

impl ColumnStrategy {
    /// Renders the strategy as a DDL suffix (empty for [`Nullable`]).
    ///
    /// [`Nullable`]: ColumnStrategy::Nullable
    #[must_use]
    pub fn ddl_suffix(&self) -> String {
        match self {
            ColumnStrategy::NotNull => " NOT NULL".to_string(),
            ColumnStrategy::Nullable => String::new(),
            ColumnStrategy::Default(expr) => format!(" DEFAULT ({expr})"),
        }
    }
}

/// The shape of a column, without its nullability strategy.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnKind {
    /// A primitive column.
    Prim(PrimKind),
    /// An exact decimal with `precision` total digits, `scale` of them
    /// fractional.
    Decimal {
        /// Total digits, `1..=38`.
        precision: u32,
        /// Fractional digits, `<= precision`.
        scale: u32,
    },
    /// A byte string of exactly `n` bytes.
    Fixed(usize),
    /// An ordered set of symbols, compared by string.
    Enum {
        /// The enum's declared name.
        name: String,
        /// The symbols, in declaration order.
        symbols: Vec<String>,
    },
    /// A variable-length sequence.
    List(Box<ColumnDef>),
    /// An association from a stringifiable key to a value.
    Map(Box<ColumnDef>, Box<ColumnDef>),
    /// A product of named fields; order carries semantic position.
    Struct(Vec<(String, ColumnDef)>),
    /// A tagged union; at most one branch inhabited.
    Union(Vec<(String, ColumnDef)>),
    /// The null type. Valid only as a union branch, where it marks the
    /// dedicated `null` tag.
    Null,
}

/// A typed, recursive description of one relational column.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDef {
    kind: ColumnKind,
    strategy: ColumnStrategy,
}

impl ColumnDef {
    /// A primitive column with the default strategy.
    #[must_use]
    pub fn prim(kind: PrimKind) -> Self {
        Self {
            kind: ColumnKind::Prim(kind),
            strategy: ColumnStrategy::NotNull,
        }
    }

    /// An exact decimal column.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::DecimalBounds`] unless
    /// `1 <= precision <= 38` and `scale <= precision`.
    pub fn decimal(precision: u32, scale: u32) -> Result<Self, SchemaError> {
        if precision == 0 || precision > 38 || scale > precision {
            return Err(SchemaError::DecimalBounds { precision, scale });
        }
        Ok(Self {
            kind: ColumnKind::Decimal { precision, scale },
            strategy: ColumnStrategy::NotNull,
        })
    }

    /// A fixed-width byte column of exactly `n` bytes.
    #[must_use]
    pub fn fixed(n: usize) -> Self {
        Self {
            kind: ColumnKind::Fixed(n),
            strategy: ColumnStrategy::NotNull,
        }
    }

    /// An enumeration column over `symbols`.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::EmptyEnum`] for an empty symbol list and
    /// [`SchemaError::BadName`] for duplicate or empty symbols.
    pub fn enumeration(
        name: impl Into<String>,
        symbols: Vec<String>,
    ) -> Result<Self, SchemaError> {
        let name = name.into();
        if symbols.is_empty() {
            return Err(SchemaError::EmptyEnum(name));
        }
        check_unique(&name, symbols.iter().map(String::as_str))?;
        Ok(Self {
            kind: ColumnKind::Enum { name, symbols },
            strategy: ColumnStrategy::NotNull,
        })
    }

    /// A list column over `item`.
    #[must_use]
    pub fn list(item: ColumnDef) -> Self {
        Self {
            kind: ColumnKind::List(Box::new(item)),
            strategy: ColumnStrategy::NotNull,
        }
    }

    /// A map column from `key` to `value`.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::Unsupported`] if the key is not a
    /// stringifiable primitive or an enum.
    pub fn map(key: ColumnDef, value: ColumnDef) -> Result<Self, SchemaError> {
        let key_ok = matches!(
            key.kind,
            ColumnKind::Prim(
                PrimKind::Utf8
                    | PrimKind::Bool
                    | PrimKind::Int8
                    | PrimKind::Int16
                    | PrimKind::Int32
                    | PrimKind::Int64
                    | PrimKind::UInt8
                    | PrimKind::UInt16
                    | PrimKind::UInt32
                    | PrimKind::UInt64
                    | PrimKind::Uuid
            ) | ColumnKind::Enum { .. }
        );
        if !key_ok {
            return Err(SchemaError::Unsupported(format!(
                "map key must be a stringifiable primitive or enum, got {:?}",
                key.kind
            )));
        }
        Ok(Self {
            kind: ColumnKind::Map(Box::new(key), Box::new(value)),
            strategy: ColumnStrategy::NotNull,
        })
    }

    /// A struct column over ordered named fields.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::EmptyStruct`] for an empty field list and
    /// [`SchemaError::BadName`] for duplicate or empty field names.
    pub fn record(
        name: impl Into<String>,
        fields: Vec<(String, ColumnDef)>,
    ) -> Result<Self, SchemaError> {
        let name = name.into();
        if fields.is_empty() {
            return Err(SchemaError::EmptyStruct(name));
        }
        check_unique(&name, fields.iter().map(|(n, _)| n.as_str()))?;
        Ok(Self {
            kind: ColumnKind::Struct(fields),
            strategy: ColumnStrategy::NotNull,
        })
    }

    /// A tagged-union column over ordered named branches.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::BadName`] for duplicate or empty branch tags
    /// and [`SchemaError::Unsupported`] for a union with no branches.
    pub fn union(branches: Vec<(String, ColumnDef)>) -> Result<Self, SchemaError> {
        if branches.is_empty() {
            return Err(SchemaError::Unsupported("union with no branches".into()));
        }
        check_unique("union", branches.iter().map(|(n, _)| n.as_str()))?;
        Ok(Self {
            kind: ColumnKind::Union(branches),
            strategy: ColumnStrategy::NotNull,
        })
    }

    /// The null type; valid only as a union branch.
    #[must_use]
    pub fn null() -> Self {
        Self {
            kind: ColumnKind::Null,
            strategy: ColumnStrategy::Nullable,
        }
    }

    /// Replaces the nullability strategy.
    #[must_use]
    pub fn with_strategy(mut self, strategy: ColumnStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Marks the column nullable.
    #[must_use]
    pub fn nullable(self) -> Self {
        self.with_strategy(ColumnStrategy::Nullable)
    }

    /// Returns the column's shape.
    #[must_use]
    pub fn kind(&self) -> &ColumnKind {
        &self.kind
    }

    /// Returns the column's nullability strategy.
    #[must_use]
    pub fn strategy(&self) -> &ColumnStrategy {
        &self.strategy
    }

    /// Returns `true` if the column accepts nulls.
    #[must_use]
    pub fn is_nullable(&self) -> bool {
        !matches!(self.strategy, ColumnStrategy::NotNull)
    }

    /// Renders the column type in the analytic engine's dialect, without
    /// any strategy suffix. Compound types nest.
    #[must_use]
    pub fn type_ddl(&self) -> String {
        match &self.kind {
            ColumnKind::Prim(kind) => kind.ddl().to_string(),
            ColumnKind::Decimal { precision, scale } => {
                format!("DECIMAL({precision}, {scale})")
            }
            ColumnKind::Fixed(_) => "BLOB".to_string(),
            ColumnKind::Enum { symbols, .. } => {
                let syms: Vec<String> = symbols.iter().map(|s| quote_literal(s)).collect();
                format!("ENUM({})", syms.join(", "))
            }
            ColumnKind::List(item) => format!("{}[]", item.type_ddl()),
            ColumnKind::Map(key, value) => {
                format!("MAP({}, {})", key.type_ddl(), value.type_ddl())
            }
            ColumnKind::Struct(fields) => {
                let cols: Vec<String> = fields
                    .iter()
                    .map(|(name, col)| format!("{} {}", quote_ident(name), col.type_ddl()))
                    .collect();
                format!("STRUCT({})", cols.join(", "))
            }
            ColumnKind::Union(branches) => {
                let members: Vec<String> = branches
                    .iter()
                    .filter(|(_, col)| !matches!(col.kind, ColumnKind::Null))
                    .map(|(tag, col)| format!("{} {}", quote_ident(tag), col.type_ddl()))
                    .collect();
                format!("UNION({})", members.join(", "))
            }
            // Only reachable through a hand-built invalid tree; validation
            // rejects Null outside a union branch.
            ColumnKind::Null => "NULL".to_string(),
        }
    }

    /// Renders the full column DDL: type plus strategy suffix.
    #[must_use]
    pub fn render_ddl(&self) -> String {
        format!("{}{}", self.type_ddl(), self.strategy.ddl_suffix())
    }

    /// Yields the positional schema of a row rooted at this column.
    ///
    /// A root `Struct` flattens to its fields verbatim; any other root
    /// yields a single synthetic `("value", column)` entry.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError`] if the column tree violates its invariants.
    pub fn flatten_top_level(&self) -> Result<Vec<(String, ColumnDef)>, SchemaError> {
        self.validate()?;
        match &self.kind {
            ColumnKind::Struct(fields) => Ok(fields.clone()),
            _ => Ok(vec![("value".to_string(), self.clone())]),
        }
    }

    /// Checks the invariants of the whole column tree.
    ///
    /// # Errors
    ///
    /// Returns the first violation found.
    pub fn validate(&self) -> Result<(), SchemaError> {
        self.validate_inner(false)
    }

    fn validate_inner(&self, null_ok: bool) -> Result<(), SchemaError> {
        match &self.kind {
            ColumnKind::Prim(_) => Ok(()),
            ColumnKind::Decimal { precision, scale } => {
                if *precision == 0 || *precision > 38 || scale > precision {
                    Err(SchemaError::DecimalBounds {
                        precision: *precision,
                        scale: *scale,
                    })
                } else {
                    Ok(())
                }
            }
            ColumnKind::Fixed(_) => Ok(()),
            ColumnKind::Enum { name, symbols } => {
                if symbols.is_empty() {
                    return Err(SchemaError::EmptyEnum(name.clone()));
                }
                check_unique(name, symbols.iter().map(String::as_str))
            }
            ColumnKind::List(item) => item.validate_inner(false),
            ColumnKind::Map(key, value) => {
                key.validate_inner(false)?;
                value.validate_inner(false)
            }
            ColumnKind::Struct(fields) => {
                if fields.is_empty() {
                    return Err(SchemaError::EmptyStruct("struct".into()));
                }
                check_unique("struct", fields.iter().map(|(n, _)| n.as_str()))?;
                for (_, col) in fields {
                    col.validate_inner(false)?;
                }
                Ok(())
            }
            ColumnKind::Union(branches) => {
                if branches.is_empty() {
                    return Err(SchemaError::Unsupported("union with no branches".into()));
                }
                check_unique("union", branches.iter().map(|(n, _)| n.as_str()))?;
                for (_, col) in branches {
                    col.validate_inner(true)?;
                }
                Ok(())
            }
            ColumnKind::Null => {
                if null_ok {
                    Ok(())
                } else {
                    Err(SchemaError::Unsupported(
                        "null type outside a union branch".into(),
                    ))
                }
            }
        }
    }
}

/// Quotes an identifier for the dialect.
#[must_use]
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quotes a string literal for the dialect.
#[must_use]
pub fn quote_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

fn check_unique<'a>(
    container: &str,
    names: impl Iterator<Item = &'a str>,
) -> Result<(), SchemaError> {
    let mut seen = std::collections::HashSet::new();
    for name in names {
        if name.is_empty() || !seen.insert(name) {
            return Err(SchemaError::BadName {
                container: container.to_string(),
                name: name.to_string(),
            });
        }
    }
    Ok(())
}
