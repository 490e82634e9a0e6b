use pgwire::api::results::{FieldFormat, FieldInfo};
use postgres_types::Type;
use rusqlite::types::Value;

/// A result column as reported by the engine: name plus the declared type
/// of the underlying table column, if any. Expression columns carry no
/// declared type and fall back to value-based inference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub decl_type: Option<String>,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, decl_type: Option<String>) -> Self {
        ColumnDef {
            name: name.into(),
            decl_type,
        }
    }
}

/// Map a SQLite declared column type to a postgres type OID.
///
/// Matching is on the first word of the declaration, case-insensitive, so
/// `VARCHAR(255)` and `varchar collate nocase` both resolve to VARCHAR.
/// Unknown declarations resolve to TEXT; call sites that need row values
/// to stay client-decodable should prefer [`value_to_pg`] when no
/// declaration is available.
pub fn decl_type_to_pg(decl: &str) -> Type {
    let first = decl
        .split(|c: char| c == '(' || c.is_whitespace())
        .next()
        .unwrap_or(decl);
    match first.to_ascii_uppercase().as_str() {
        "SMALLINT" | "INT2" => Type::INT2,
        "INT4" | "MEDIUMINT" => Type::INT4,
        "INT" | "INTEGER" | "BIGINT" | "INT8" => Type::INT8,
        "TEXT" | "CLOB" | "CHAR" | "CHARACTER" => Type::TEXT,
        "VARCHAR" => Type::VARCHAR,
        "BLOB" | "BYTEA" => Type::BYTEA,
        "REAL" | "FLOAT" | "DOUBLE" | "FLOAT8" => Type::FLOAT8,
        "NUMERIC" | "DECIMAL" => Type::NUMERIC,
        "BOOL" | "BOOLEAN" => Type::BOOL,
        "DATE" => Type::DATE,
        "DATETIME" | "TIMESTAMP" => Type::TIMESTAMP,
        _ => Type::TEXT,
    }
}

/// Infer a postgres type OID from a concrete runtime value. Used for
/// columns the engine exposes without a declared type (expressions,
/// pragma output).
pub fn value_to_pg(value: &Value) -> Type {
    match value {
        Value::Integer(_) => Type::INT8,
        Value::Real(_) => Type::FLOAT8,
        Value::Text(_) => Type::TEXT,
        Value::Blob(_) => Type::BYTEA,
        Value::Null => Type::TEXT,
    }
}

/// OID for a `$n` argument column name resolved through the schema probe.
///
/// The parser emits the literal strings `boolean` and `blob` for
/// type-coerced anonymous parameters; everything else that misses the
/// schema defaults to TEXT so the client can always send it.
pub fn arg_column_fallback(name: &str) -> Type {
    match name {
        "boolean" => Type::BOOL,
        "blob" => Type::BYTEA,
        _ => Type::TEXT,
    }
}

/// Resolve one column's OID: the declared type when present, otherwise
/// a sample value from the first row. A column with neither resolves to
/// INT8: these are computed rows the client must still be able to decode
/// numerically.
pub fn resolve_column_type(col: &ColumnDef, value: Option<&Value>) -> Type {
    match &col.decl_type {
        Some(decl) => decl_type_to_pg(decl),
        None => match value {
            Some(Value::Null) | None => Type::INT8,
            Some(value) => value_to_pg(value),
        },
    }
}

/// Build the wire field descriptors for a result set.
pub fn columns_to_fields(
    columns: &[ColumnDef],
    first_row: Option<&[Value]>,
    format: FieldFormat,
) -> Vec<FieldInfo> {
    columns
        .iter()
        .enumerate()
        .map(|(i, col)| {
            let pg_type = resolve_column_type(col, first_row.and_then(|row| row.get(i)));
            FieldInfo::new(col.name.clone(), None, None, pg_type, format)
        })
        .collect()
}
