//! Scalar information functions clients call during startup.

use std::path::Path;

use rusqlite::functions::FunctionFlags;
use rusqlite::Connection;

/// The identity reported to clients. There is no authentication, so every
/// session runs as the same fixed role.
const SESSION_USER: &str = "sqlite";

const VERSION: &str =
    "PostgreSQL 14.9 (sqlite-postgres 0.3.0) on x86_64-pc-linux-gnu, 64-bit";

pub(crate) fn register_functions(conn: &Connection, data_dir: &Path) -> rusqlite::Result<()> {
    let deterministic = FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC;

    conn.create_scalar_function("current_catalog", 0, deterministic, |_ctx| {
        Ok("main".to_string())
    })?;
    conn.create_scalar_function("current_schema", 0, deterministic, |_ctx| {
        Ok("public".to_string())
    })?;
    for name in ["current_user", "session_user", "user"] {
        conn.create_scalar_function(name, 0, deterministic, |_ctx| {
            Ok(SESSION_USER.to_string())
        })?;
    }
    conn.create_scalar_function("version", 0, deterministic, |_ctx| Ok(VERSION.to_string()))?;
    conn.create_scalar_function("format_type", 2, deterministic, |_ctx| {
        Ok(String::new())
    })?;
    conn.create_scalar_function("show", 1, deterministic, |_ctx| Ok(String::new()))?;

    let dir = data_dir.to_path_buf();
    conn.create_scalar_function(
        "pg_total_relation_size",
        1,
        FunctionFlags::SQLITE_UTF8,
        move |ctx| {
            let name: String = ctx.get(0)?;
            let size = std::fs::metadata(crate::database_path(&dir, &name))
                .map(|m| m.len() as i64)
                .unwrap_or(-1);
            Ok(size)
        },
    )?;

    Ok(())
}
