use pgwire::api::portal::Portal;
use pgwire::error::PgWireResult;
use postgres_types::Type;
use rusqlite::types::Value;

/// Decode the Bind parameters of a portal into engine values, one per
/// declared OID.
///
/// Byteas keep their raw bytes; date and timestamp parameters keep the
/// client's text form, which the engine stores verbatim. Types outside
/// the map decode as text.
pub fn decode_parameters<S: Clone>(portal: &Portal<S>, types: &[Type]) -> PgWireResult<Vec<Value>> {
    let mut values = Vec::with_capacity(types.len());
    for (idx, pg_type) in types.iter().enumerate() {
        let value = match *pg_type {
            Type::BOOL => portal
                .parameter::<bool>(idx, pg_type)?
                .map(|b| Value::Integer(b as i64)),
            Type::INT2 => portal
                .parameter::<i16>(idx, pg_type)?
                .map(|i| Value::Integer(i as i64)),
            Type::INT4 => portal
                .parameter::<i32>(idx, pg_type)?
                .map(|i| Value::Integer(i as i64)),
            Type::INT8 => portal.parameter::<i64>(idx, pg_type)?.map(Value::Integer),
            Type::FLOAT4 => portal
                .parameter::<f32>(idx, pg_type)?
                .map(|f| Value::Real(f as f64)),
            Type::FLOAT8 => portal.parameter::<f64>(idx, pg_type)?.map(Value::Real),
            Type::BYTEA => portal.parameter::<Vec<u8>>(idx, pg_type)?.map(Value::Blob),
            _ => portal.parameter::<String>(idx, pg_type)?.map(Value::Text),
        };
        values.push(value.unwrap_or(Value::Null));
    }
    Ok(values)
}
