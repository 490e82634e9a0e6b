//! A synthesized `pg_catalog` schema for sqlite databases.
//!
//! Postgres clients introspect the server through `pg_catalog` tables and
//! a handful of information functions before they run any user query.
//! This crate attaches an in-memory `pg_catalog` schema to a sqlite
//! connection and populates it with virtual tables and scalar functions
//! that answer those probes well enough for psql, pgx and libpq-based
//! drivers to proceed.

use std::path::{Path, PathBuf};

use rusqlite::Connection;

mod functions;
mod tables;

pub use tables::PG_CATALOG_TABLES;

/// Attach and populate the `pg_catalog` schema on `conn`.
///
/// Safe to call more than once on the same connection: a second ATTACH
/// reports the schema name as already in use, which is not an error here.
pub fn setup_pg_catalog(conn: &Connection, data_dir: &Path) -> rusqlite::Result<()> {
    attach_catalog(conn)?;
    tables::register_tables(conn, data_dir)?;
    functions::register_functions(conn, data_dir)?;
    Ok(())
}

fn attach_catalog(conn: &Connection) -> rusqlite::Result<()> {
    match conn.execute_batch("ATTACH DATABASE ':memory:' AS pg_catalog") {
        Ok(()) => Ok(()),
        Err(e) if e.to_string().contains("already in use") => Ok(()),
        Err(e) => Err(e),
    }
}

/// Enumerate the logical databases under `data_dir`: every regular
/// `*.db` file, hidden files excluded, identified by basename.
pub fn list_databases(data_dir: &Path) -> Vec<String> {
    let mut names = Vec::new();
    if let Ok(entries) = std::fs::read_dir(data_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) != Some("db") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if !stem.is_empty() && !stem.starts_with('.') {
                    names.push(stem.to_string());
                }
            }
        }
    }
    names.sort();
    names
}

/// Path of the database file backing logical database `name`.
pub fn database_path(data_dir: &Path, name: &str) -> PathBuf {
    data_dir.join(format!("{name}.db"))
}
