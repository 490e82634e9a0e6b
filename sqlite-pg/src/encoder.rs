use pgwire::api::results::DataRowEncoder;
use pgwire::error::PgWireResult;
use postgres_types::Type;
use rusqlite::types::Value;

/// Encode one engine value into the current data row.
///
/// The wire format (text or binary) is decided by the field descriptor the
/// encoder was built with; this function only picks the Rust value whose
/// codec matches the field's OID. Values that do not match their declared
/// OID are coerced through their textual form rather than rejected, since
/// the engine stores dynamically typed columns.
pub fn encode_value(
    encoder: &mut DataRowEncoder,
    value: &Value,
    pg_type: &Type,
) -> PgWireResult<()> {
    match pg_type {
        &Type::BOOL => match value {
            Value::Null => encoder.encode_field(&None::<bool>),
            Value::Integer(i) => encoder.encode_field(&(*i != 0)),
            Value::Text(s) => {
                let b = matches!(s.as_str(), "t" | "true" | "TRUE" | "1");
                encoder.encode_field(&b)
            }
            other => encoder.encode_field(&text_form(other)),
        },
        &Type::INT2 => match value {
            Value::Null => encoder.encode_field(&None::<i16>),
            Value::Integer(i) => encoder.encode_field(&(*i as i16)),
            other => encoder.encode_field(&text_form(other)),
        },
        &Type::INT4 => match value {
            Value::Null => encoder.encode_field(&None::<i32>),
            Value::Integer(i) => encoder.encode_field(&(*i as i32)),
            other => encoder.encode_field(&text_form(other)),
        },
        &Type::INT8 => match value {
            Value::Null => encoder.encode_field(&None::<i64>),
            Value::Integer(i) => encoder.encode_field(i),
            Value::Real(f) => encoder.encode_field(&(*f as i64)),
            other => encoder.encode_field(&text_form(other)),
        },
        &Type::FLOAT8 => match value {
            Value::Null => encoder.encode_field(&None::<f64>),
            Value::Real(f) => encoder.encode_field(f),
            Value::Integer(i) => encoder.encode_field(&(*i as f64)),
            other => encoder.encode_field(&text_form(other)),
        },
        &Type::BYTEA => match value {
            Value::Null => encoder.encode_field(&None::<&[u8]>),
            Value::Blob(b) => encoder.encode_field(&b.as_slice()),
            Value::Text(s) => encoder.encode_field(&s.as_bytes()),
            other => encoder.encode_field(&text_form(other)),
        },
        // NUMERIC, DATE and TIMESTAMP values travel in their engine text
        // form; the remaining types are textual by nature.
        _ => match value {
            Value::Null => encoder.encode_field(&None::<&str>),
            Value::Text(s) => encoder.encode_field(&s.as_str()),
            other => encoder.encode_field(&text_form(other)),
        },
    }
}

fn text_form(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Integer(i) => i.to_string(),
        Value::Real(f) => f.to_string(),
        Value::Text(s) => s.clone(),
        Value::Blob(b) => b.iter().map(|byte| format!("{byte:02x}")).collect(),
    }
}
