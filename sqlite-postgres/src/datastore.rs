//! Per-database engine access.
//!
//! Every logical database is one file under the data directory, opened
//! twice: a read-write connection that is the single writer, and a
//! read-only connection for queries. The writer connection is guarded by
//! an owned mutex so an open transaction reserves it for one session,
//! which is how the engine's one-writer rule maps onto concurrent
//! sessions.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use rusqlite::types::Value;
use rusqlite::{Connection, OpenFlags};
use sqlite_pg::ColumnDef;
use tokio::sync::{Mutex, OwnedMutexGuard};

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(3000);

/// A database name is acceptable when it is non-empty and cannot escape
/// the data directory.
pub fn valid_database_name(name: &str) -> bool {
    !name.is_empty() && !name.contains("..") && !name.contains('/') && !name.contains('\\')
}

/// True when the engine reports a uniqueness violation, which clients
/// must see as SQLSTATE 23505.
pub fn is_unique_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, msg) => {
            e.code == rusqlite::ErrorCode::ConstraintViolation
                && msg
                    .as_deref()
                    .map(|m| m.contains("UNIQUE") || m.contains("PRIMARY KEY"))
                    .unwrap_or(true)
        }
        _ => false,
    }
}

/// A fully collected query result.
#[derive(Debug)]
pub struct ResultSet {
    pub columns: Vec<ColumnDef>,
    pub rows: Vec<Vec<Value>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointMode {
    Restart,
    Truncate,
}

impl CheckpointMode {
    fn pragma(&self) -> &'static str {
        match self {
            CheckpointMode::Restart => "PRAGMA wal_checkpoint(RESTART)",
            CheckpointMode::Truncate => "PRAGMA wal_checkpoint(TRUNCATE)",
        }
    }
}

pub struct Datastore {
    name: String,
    path: PathBuf,
    rw: Arc<Mutex<Connection>>,
    ro: Arc<Mutex<Connection>>,
}

impl Datastore {
    /// Open (and create if needed) the database file for `name`.
    pub fn open(data_dir: &Path, name: &str) -> rusqlite::Result<Datastore> {
        let path = sqlite_pg_catalog::database_path(data_dir, name);

        let rw = Connection::open(&path)?;
        rw.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
        rw.pragma_update(None, "journal_mode", "WAL")?;
        rw.pragma_update(None, "synchronous", "OFF")?;
        rw.pragma_update(None, "wal_autocheckpoint", 0)?;

        // External readers only see committed data once the WAL side file
        // exists; force its creation on a fresh database.
        let wal_path = path.with_extension("db-wal");
        if !wal_path.exists() {
            rw.execute_batch("BEGIN IMMEDIATE; ROLLBACK;")?;
        }

        sqlite_pg_catalog::setup_pg_catalog(&rw, data_dir)?;

        // The reader is a second connection so queries stay off the
        // single writer. The catalog has to attach before query_only
        // locks the connection down, since attaching inherits the
        // connection mode.
        let ro = Connection::open_with_flags(
            &path,
            OpenFlags::default() | OpenFlags::SQLITE_OPEN_SHARED_CACHE,
        )?;
        ro.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
        sqlite_pg_catalog::setup_pg_catalog(&ro, data_dir)?;
        ro.pragma_update(None, "query_only", true)?;

        debug!("opened datastore {name} at {}", path.display());
        Ok(Datastore {
            name: name.to_string(),
            path,
            rw: Arc::new(Mutex::new(rw)),
            ro: Arc::new(Mutex::new(ro)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The engine's own read-only predicate on a statement text.
    /// Statements that fail to prepare count as writes.
    pub async fn stmt_readonly(&self, sql: &str) -> bool {
        let conn = self.ro.lock().await;
        match conn.prepare(sql) {
            Ok(stmt) => stmt.readonly(),
            Err(_) => false,
        }
    }

    /// Execute a statement on the read-write connection.
    pub async fn exec(&self, sql: &str, params: &[Value]) -> rusqlite::Result<usize> {
        let conn = self.rw.lock().await;
        run_exec(&conn, sql, params)
    }

    /// Run a query, routed to the read-only connection when the statement
    /// is read-only.
    pub async fn query(&self, sql: &str, params: &[Value]) -> rusqlite::Result<ResultSet> {
        let handle = if self.stmt_readonly(sql).await {
            &self.ro
        } else {
            &self.rw
        };
        let conn = handle.lock().await;
        run_query(&conn, sql, params)
    }

    /// Start a local transaction, reserving the writer connection until
    /// commit or rollback.
    pub async fn begin(&self) -> rusqlite::Result<LocalTransaction> {
        let guard = self.rw.clone().lock_owned().await;
        LocalTransaction::begin(guard)
    }

    /// Run a WAL checkpoint, failing unless the log was fully
    /// checkpointed. The busy timeout is raised to `timeout` for the
    /// duration and restored after.
    pub async fn checkpoint(
        &self,
        mode: CheckpointMode,
        timeout: Duration,
    ) -> rusqlite::Result<()> {
        let conn = self.rw.lock().await;
        conn.busy_timeout(timeout)?;
        let result = conn.query_row(mode.pragma(), [], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
            ))
        });
        conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
        let (busy, log_frames, checkpointed) = result?;
        if busy != 0 || log_frames != checkpointed {
            return Err(rusqlite::Error::ModuleError(format!(
                "checkpoint incomplete: busy={busy} log={log_frames} checkpointed={checkpointed}"
            )));
        }
        Ok(())
    }

    pub async fn vacuum(&self) -> rusqlite::Result<()> {
        let conn = self.rw.lock().await;
        conn.execute_batch("VACUUM")
    }

    pub async fn vacuum_into(&self, path: &Path) -> rusqlite::Result<()> {
        let conn = self.rw.lock().await;
        conn.execute("VACUUM INTO ?1", [path.to_string_lossy()])?;
        Ok(())
    }

    pub async fn busy_timeout(&self, timeout: Duration) -> rusqlite::Result<()> {
        self.rw.lock().await.busy_timeout(timeout)?;
        self.ro.lock().await.busy_timeout(timeout)
    }

    /// Resolve argument columns to their declared types through the
    /// schema of the referenced tables.
    pub async fn arg_column_types(
        &self,
        tables: &[String],
        arg_columns: &[String],
    ) -> rusqlite::Result<HashMap<String, String>> {
        if arg_columns.is_empty() {
            return Ok(HashMap::new());
        }

        let table_filter = if tables.is_empty() {
            "name NOT LIKE 'sqlite_%'".to_string()
        } else {
            format!("tableName IN ({})", quoted_list(tables))
        };
        let sql = format!(
            "WITH tables AS (SELECT name AS tableName, sql FROM sqlite_master \
             WHERE type = 'table' AND {table_filter}) \
             SELECT fields.name, fields.type \
             FROM tables CROSS JOIN pragma_table_info(tables.tableName) AS fields \
             WHERE fields.name IN ({}) \
             GROUP BY fields.name",
            quoted_list(arg_columns)
        );

        let conn = self.ro.lock().await;
        let mut stmt = conn.prepare(&sql)?;
        let mut out = HashMap::new();
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let name: String = row.get(0)?;
            let decl: String = row.get(1)?;
            out.insert(name, decl);
        }
        Ok(out)
    }

    /// Describe the result columns of `sql` without executing it.
    pub async fn describe(&self, sql: &str) -> rusqlite::Result<Vec<ColumnDef>> {
        let conn = self.ro.lock().await;
        let stmt = conn.prepare(sql)?;
        Ok(column_defs(&stmt))
    }
}

/// An open transaction holding the writer connection.
pub struct LocalTransaction {
    guard: OwnedMutexGuard<Connection>,
    open: bool,
}

impl LocalTransaction {
    fn begin(guard: OwnedMutexGuard<Connection>) -> rusqlite::Result<Self> {
        guard.execute_batch("BEGIN")?;
        Ok(LocalTransaction { guard, open: true })
    }

    pub fn exec(&self, sql: &str, params: &[Value]) -> rusqlite::Result<usize> {
        run_exec(&self.guard, sql, params)
    }

    pub fn query(&self, sql: &str, params: &[Value]) -> rusqlite::Result<ResultSet> {
        run_query(&self.guard, sql, params)
    }

    pub fn commit(mut self) -> rusqlite::Result<()> {
        self.open = false;
        self.guard.execute_batch("COMMIT")
    }

    pub fn rollback(mut self) -> rusqlite::Result<()> {
        self.open = false;
        self.guard.execute_batch("ROLLBACK")
    }
}

impl Drop for LocalTransaction {
    fn drop(&mut self) {
        if self.open {
            let _ = self.guard.execute_batch("ROLLBACK");
        }
    }
}

fn run_exec(conn: &Connection, sql: &str, params: &[Value]) -> rusqlite::Result<usize> {
    let mut stmt = conn.prepare(sql)?;
    bind_params(&mut stmt, params)?;
    if stmt.column_count() == 0 {
        return stmt.raw_execute();
    }
    // Some non-query statements still produce rows (wal_checkpoint and
    // friends); drain them and report the change count.
    let mut rows = stmt.raw_query();
    while rows.next()?.is_some() {}
    Ok(conn.changes() as usize)
}

fn run_query(conn: &Connection, sql: &str, params: &[Value]) -> rusqlite::Result<ResultSet> {
    let mut stmt = conn.prepare(sql)?;
    let columns = column_defs(&stmt);
    bind_params(&mut stmt, params)?;
    let column_count = columns.len();

    let mut rows = Vec::new();
    let mut result = stmt.raw_query();
    while let Some(row) = result.next()? {
        let mut values = Vec::with_capacity(column_count);
        for i in 0..column_count {
            values.push(row.get::<_, Value>(i)?);
        }
        rows.push(values);
    }
    Ok(ResultSet { columns, rows })
}

fn bind_params(stmt: &mut rusqlite::Statement<'_>, params: &[Value]) -> rusqlite::Result<()> {
    for (i, value) in params.iter().enumerate() {
        stmt.raw_bind_parameter(i + 1, value)?;
    }
    Ok(())
}

fn column_defs(stmt: &rusqlite::Statement<'_>) -> Vec<ColumnDef> {
    stmt.columns()
        .iter()
        .map(|col| ColumnDef::new(col.name(), col.decl_type().map(|t| t.to_string())))
        .collect()
}

fn quoted_list(items: &[String]) -> String {
    items
        .iter()
        .map(|item| format!("'{}'", item.replace('\'', "''")))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Process-wide map from database name to its open datastore, plus the
/// system database holding replica configuration.
pub struct Registry {
    data_dir: PathBuf,
    stores: Mutex<HashMap<String, Arc<Datastore>>>,
}

impl Registry {
    pub fn new(data_dir: impl Into<PathBuf>) -> io::Result<Registry> {
        let data_dir = data_dir.into();
        let meta = std::fs::metadata(&data_dir)?;
        if !meta.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotADirectory,
                format!("{} is not a directory", data_dir.display()),
            ));
        }
        Ok(Registry {
            data_dir,
            stores: Mutex::new(HashMap::new()),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub async fn open(&self, name: &str) -> rusqlite::Result<Arc<Datastore>> {
        let mut stores = self.stores.lock().await;
        if let Some(store) = stores.get(name) {
            return Ok(store.clone());
        }
        let store = Arc::new(Datastore::open(&self.data_dir, name)?);
        stores.insert(name.to_string(), store.clone());
        Ok(store)
    }

    pub async fn close_all(&self) {
        self.stores.lock().await.clear();
    }

    /// Open the system database and make sure its schema exists.
    pub fn open_system(&self) -> rusqlite::Result<SystemDb> {
        let conn = Connection::open(self.data_dir.join(".system.db"))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS replicas (\
             id INTEGER PRIMARY KEY, addr TEXT NOT NULL, db TEXT NOT NULL)",
        )?;
        Ok(SystemDb { conn: Mutex::new(conn) })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replica {
    pub id: i64,
    pub addr: String,
    pub db: String,
}

/// Replica configuration storage.
pub struct SystemDb {
    conn: Mutex<Connection>,
}

impl SystemDb {
    pub async fn replicas(&self) -> rusqlite::Result<Vec<Replica>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT id, addr, db FROM replicas ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok(Replica {
                id: row.get(0)?,
                addr: row.get(1)?,
                db: row.get(2)?,
            })
        })?;
        rows.collect()
    }

    pub async fn add_replica(&self, addr: &str, db: &str) -> rusqlite::Result<i64> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO replicas (addr, db) VALUES (?1, ?2)",
            [addr, db],
        )?;
        Ok(conn.last_insert_rowid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("sqlite-postgres-ds-{tag}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_database_name_validation() {
        assert!(valid_database_name("mydb"));
        assert!(valid_database_name("my_db-1"));
        assert!(!valid_database_name(""));
        assert!(!valid_database_name("../etc/passwd"));
        assert!(!valid_database_name("a/b"));
    }

    #[tokio::test]
    async fn test_exec_and_query_roundtrip() {
        let dir = scratch_dir("roundtrip");
        let store = Datastore::open(&dir, "cars").unwrap();
        store
            .exec(
                "CREATE TABLE cars (brand TEXT, model TEXT, year INTEGER)",
                &[],
            )
            .await
            .unwrap();
        let n = store
            .exec(
                "INSERT INTO cars (brand, model, year) VALUES ($1, $2, $3)",
                &[
                    Value::Text("skoda".into()),
                    Value::Text("octavia".into()),
                    Value::Integer(2021),
                ],
            )
            .await
            .unwrap();
        assert_eq!(n, 1);

        let result = store
            .query(
                "SELECT brand, model, year FROM cars WHERE brand = $1",
                &[Value::Text("skoda".into())],
            )
            .await
            .unwrap();
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows[0][2], Value::Integer(2021));
        assert_eq!(result.columns[2].decl_type.as_deref(), Some("INTEGER"));
    }

    #[tokio::test]
    async fn test_stmt_readonly_predicate() {
        let dir = scratch_dir("readonly");
        let store = Datastore::open(&dir, "t").unwrap();
        store.exec("CREATE TABLE t (k TEXT)", &[]).await.unwrap();
        assert!(store.stmt_readonly("SELECT * FROM t").await);
        assert!(!store.stmt_readonly("INSERT INTO t VALUES ('x')").await);
        assert!(!store.stmt_readonly("not even sql").await);
    }

    #[tokio::test]
    async fn test_transaction_rollback_hides_writes() {
        let dir = scratch_dir("txn");
        let store = Datastore::open(&dir, "t").unwrap();
        store.exec("CREATE TABLE t (k TEXT, v TEXT)", &[]).await.unwrap();

        let tx = store.begin().await.unwrap();
        tx.exec(
            "INSERT INTO t (k, v) VALUES ($1, $2)",
            &[Value::Text("a".into()), Value::Text("1".into())],
        )
        .unwrap();
        tx.rollback().unwrap();

        let result = store.query("SELECT * FROM t", &[]).await.unwrap();
        assert!(result.rows.is_empty());
    }

    #[tokio::test]
    async fn test_transaction_commit_persists() {
        let dir = scratch_dir("txn-commit");
        let store = Datastore::open(&dir, "t").unwrap();
        store.exec("CREATE TABLE t (k TEXT)", &[]).await.unwrap();

        let tx = store.begin().await.unwrap();
        tx.exec("INSERT INTO t (k) VALUES ($1)", &[Value::Text("a".into())])
            .unwrap();
        tx.commit().unwrap();

        let result = store.query("SELECT * FROM t", &[]).await.unwrap();
        assert_eq!(result.rows.len(), 1);
    }

    #[tokio::test]
    async fn test_unique_violation_detection() {
        let dir = scratch_dir("unique");
        let store = Datastore::open(&dir, "t").unwrap();
        store
            .exec("CREATE TABLE t (k TEXT PRIMARY KEY)", &[])
            .await
            .unwrap();
        store
            .exec("INSERT INTO t (k) VALUES ('a')", &[])
            .await
            .unwrap();
        let err = store
            .exec("INSERT INTO t (k) VALUES ('a')", &[])
            .await
            .unwrap_err();
        assert!(is_unique_violation(&err));
    }

    #[tokio::test]
    async fn test_arg_column_type_probe() {
        let dir = scratch_dir("probe");
        let store = Datastore::open(&dir, "books").unwrap();
        store
            .exec(
                "CREATE TABLE books (title TEXT, primary_author VARCHAR(100), year INTEGER)",
                &[],
            )
            .await
            .unwrap();
        let types = store
            .arg_column_types(
                &["books".to_string()],
                &["title".to_string(), "primary_author".to_string()],
            )
            .await
            .unwrap();
        assert_eq!(types.get("title").map(String::as_str), Some("TEXT"));
        assert_eq!(
            types.get("primary_author").map(String::as_str),
            Some("VARCHAR(100)")
        );
    }

    #[tokio::test]
    async fn test_checkpoint_truncate() {
        let dir = scratch_dir("checkpoint");
        let store = Datastore::open(&dir, "t").unwrap();
        store.exec("CREATE TABLE t (k TEXT)", &[]).await.unwrap();
        store
            .checkpoint(CheckpointMode::Truncate, Duration::from_secs(10))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_registry_caches_datastores() {
        let dir = scratch_dir("registry");
        let registry = Registry::new(&dir).unwrap();
        let a = registry.open("x").await.unwrap();
        let b = registry.open("x").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_system_db_replicas() {
        let dir = scratch_dir("system");
        let registry = Registry::new(&dir).unwrap();
        let system = registry.open_system().unwrap();
        assert!(system.replicas().await.unwrap().is_empty());
        system.add_replica("10.0.0.2:5432", "app").await.unwrap();
        let replicas = system.replicas().await.unwrap();
        assert_eq!(replicas.len(), 1);
        assert_eq!(replicas[0].addr, "10.0.0.2:5432");
        assert_eq!(replicas[0].db, "app");
    }
}
