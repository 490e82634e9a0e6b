//! Per-session statement execution.
//!
//! Each session owns at most one local transaction and, when the cluster
//! has a remote peer, one remote transaction; the two are created
//! together on BEGIN and cleared together on COMMIT, ROLLBACK or error.
//! Write forwarding order depends on the node role: a primary executes
//! locally first and then mirrors the surviving writes, a replica
//! forwards to its primary before touching the local copy. Remote
//! failures are logged and never undo local state.

use std::sync::Arc;

use log::{error, warn};

use crate::datastore::{is_unique_violation, Datastore, LocalTransaction, ResultSet};
use crate::replication::{Cluster, RemoteTransaction, Role};
use crate::sql::{Command, Statement};

/// SQLSTATE for engine uniqueness violations surfaced on INSERT.
const SQLSTATE_UNIQUE_VIOLATION: &str = "23505";

#[derive(Debug)]
pub struct ExecError {
    pub message: String,
    pub sqlstate: Option<String>,
}

impl ExecError {
    fn new(message: impl Into<String>) -> Self {
        ExecError {
            message: message.into(),
            sqlstate: None,
        }
    }
}

/// Outcome of one statement.
pub enum StatementResult {
    Rows(ResultSet),
    Complete {
        command: Command,
        rows_affected: usize,
    },
    Error(ExecError),
}

impl StatementResult {
    fn is_error(&self) -> bool {
        matches!(self, StatementResult::Error(_))
    }
}

pub struct SessionExecutor {
    datastore: Arc<Datastore>,
    cluster: Arc<Cluster>,
    local_tx: Option<LocalTransaction>,
    remote_tx: Option<RemoteTransaction>,
}

impl SessionExecutor {
    pub fn new(datastore: Arc<Datastore>, cluster: Arc<Cluster>) -> SessionExecutor {
        SessionExecutor {
            datastore,
            cluster,
            local_tx: None,
            remote_tx: None,
        }
    }

    /// Execute a batched statement list, one result per statement.
    pub async fn request(&mut self, stmts: Vec<Statement>) -> Vec<StatementResult> {
        let role = self.cluster.role();

        if role == Role::Replica {
            for stmt in &stmts {
                if self.forwardable(stmt).await {
                    self.forward(stmt).await;
                }
            }
        }

        let mut results = Vec::with_capacity(stmts.len());
        for stmt in &stmts {
            results.push(self.execute_one(stmt).await);
        }

        if role == Role::Primary && self.cluster.has_remote().await {
            for (stmt, result) in stmts.iter().zip(results.iter()) {
                if result.is_error() {
                    continue;
                }
                if self.forwardable(stmt).await {
                    self.forward(stmt).await;
                }
            }
        }

        results
    }

    /// Writes travel to the peer; transaction control and reads do not.
    async fn forwardable(&self, stmt: &Statement) -> bool {
        !stmt.command.is_transaction()
            && stmt.command != Command::Select
            && !self.datastore.stmt_readonly(&stmt.sql).await
    }

    async fn forward(&mut self, stmt: &Statement) {
        let sql = stmt.sql_for_remote();
        let outcome = match &self.remote_tx {
            Some(tx) => tx.exec(&sql).await,
            None => self.cluster.exec(self.datastore.name(), &sql).await,
        };
        if let Err(e) = outcome {
            error!(
                "replication of statement to remote failed for {}: {e}",
                self.datastore.name()
            );
        }
    }

    async fn execute_one(&mut self, stmt: &Statement) -> StatementResult {
        match stmt.command {
            Command::Begin => self.begin().await,
            Command::Commit => self.finish(true).await,
            Command::Rollback => self.finish(false).await,
            _ => self.execute_data(stmt).await,
        }
    }

    async fn begin(&mut self) -> StatementResult {
        if self.local_tx.is_some() {
            return StatementResult::Error(ExecError::new("transaction already active"));
        }
        match self.datastore.begin().await {
            Ok(tx) => self.local_tx = Some(tx),
            Err(e) => return StatementResult::Error(ExecError::new(e.to_string())),
        }
        if self.cluster.has_remote().await {
            match self.cluster.begin(self.datastore.name()).await {
                Ok(tx) => self.remote_tx = Some(tx),
                Err(e) => warn!(
                    "could not open remote transaction for {}: {e}",
                    self.datastore.name()
                ),
            }
        }
        StatementResult::Complete {
            command: Command::Begin,
            rows_affected: 0,
        }
    }

    async fn finish(&mut self, commit: bool) -> StatementResult {
        let Some(local) = self.local_tx.take() else {
            return StatementResult::Error(ExecError::new("no active transaction"));
        };
        let remote = self.remote_tx.take();
        let command = if commit {
            Command::Commit
        } else {
            Command::Rollback
        };

        let local_result = if commit { local.commit() } else { local.rollback() };

        // Local first on the primary, mirroring execution order; the
        // replica already forwarded, so its remote side resolves first.
        if let Some(remote) = remote {
            let remote_result = if commit {
                remote.commit().await
            } else {
                remote.rollback().await
            };
            if let Err(e) = remote_result {
                error!(
                    "remote transaction {} failed for {}: {e}",
                    command.tag(),
                    self.datastore.name()
                );
            }
        }

        match local_result {
            Ok(()) => StatementResult::Complete {
                command,
                rows_affected: 0,
            },
            Err(e) => StatementResult::Error(ExecError::new(e.to_string())),
        }
    }

    async fn execute_data(&mut self, stmt: &Statement) -> StatementResult {
        let outcome = if stmt.returns_rows {
            let result = match &self.local_tx {
                Some(tx) => tx.query(&stmt.sql, &stmt.parameters),
                None => self.datastore.query(&stmt.sql, &stmt.parameters).await,
            };
            result.map(StatementResult::Rows)
        } else {
            let result = match &self.local_tx {
                Some(tx) => tx.exec(&stmt.sql, &stmt.parameters),
                None => self.datastore.exec(&stmt.sql, &stmt.parameters).await,
            };
            result.map(|rows_affected| StatementResult::Complete {
                command: stmt.command,
                rows_affected,
            })
        };

        match outcome {
            Ok(result) => result,
            Err(e) => {
                let sqlstate = if stmt.command == Command::Insert && is_unique_violation(&e) {
                    Some(SQLSTATE_UNIQUE_VIOLATION.to_string())
                } else {
                    None
                };

                // A failure mid-transaction aborts it on both sides.
                if let Some(local) = self.local_tx.take() {
                    if let Err(rollback_err) = local.rollback() {
                        warn!("rollback after error failed: {rollback_err}");
                    }
                }
                if let Some(remote) = self.remote_tx.take() {
                    if let Err(rollback_err) = remote.rollback().await {
                        warn!("remote rollback after error failed: {rollback_err}");
                    }
                }

                StatementResult::Error(ExecError {
                    message: e.to_string(),
                    sqlstate,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::sql::parse;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir =
            std::env::temp_dir().join(format!("sqlite-postgres-exec-{tag}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    async fn executor(tag: &str, role: Role) -> SessionExecutor {
        let dir = scratch_dir(tag);
        let datastore = Arc::new(Datastore::open(&dir, "test").unwrap());
        datastore
            .exec("CREATE TABLE t (k TEXT PRIMARY KEY, v TEXT)", &[])
            .await
            .unwrap();
        SessionExecutor::new(datastore, Arc::new(Cluster::new(role)))
    }

    fn stmts(sql: &str) -> Vec<Statement> {
        parse(sql).unwrap()
    }

    #[tokio::test]
    async fn test_insert_then_select() {
        let mut exec = executor("insert-select", Role::Primary).await;

        let results = exec
            .request(stmts("INSERT INTO t (k, v) VALUES ('a', '1')"))
            .await;
        assert!(matches!(
            results[0],
            StatementResult::Complete {
                command: Command::Insert,
                rows_affected: 1
            }
        ));

        let results = exec.request(stmts("SELECT k, v FROM t")).await;
        match &results[0] {
            StatementResult::Rows(set) => assert_eq!(set.rows.len(), 1),
            _ => panic!("expected rows"),
        }
    }

    #[tokio::test]
    async fn test_transaction_rollback_discards_insert() {
        let mut exec = executor("txn-rollback", Role::Primary).await;

        let results = exec
            .request(stmts(
                "BEGIN; INSERT INTO t (k, v) VALUES ('a', '1'); ROLLBACK",
            ))
            .await;
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| !r.is_error()));

        let results = exec.request(stmts("SELECT * FROM t")).await;
        match &results[0] {
            StatementResult::Rows(set) => assert!(set.rows.is_empty()),
            _ => panic!("expected rows"),
        }
    }

    #[tokio::test]
    async fn test_nested_begin_is_error() {
        let mut exec = executor("nested-begin", Role::Primary).await;
        let results = exec.request(stmts("BEGIN; BEGIN")).await;
        assert!(!results[0].is_error());
        match &results[1] {
            StatementResult::Error(e) => {
                assert!(e.message.contains("transaction already active"))
            }
            _ => panic!("expected error"),
        }
    }

    #[tokio::test]
    async fn test_commit_without_transaction_is_error() {
        let mut exec = executor("orphan-commit", Role::Primary).await;
        let results = exec.request(stmts("COMMIT")).await;
        match &results[0] {
            StatementResult::Error(e) => assert!(e.message.contains("no active transaction")),
            _ => panic!("expected error"),
        }
    }

    #[tokio::test]
    async fn test_unique_violation_maps_to_sqlstate() {
        let mut exec = executor("unique", Role::Primary).await;
        exec.request(stmts("INSERT INTO t (k, v) VALUES ('a', '1')"))
            .await;
        let results = exec
            .request(stmts("INSERT INTO t (k, v) VALUES ('a', '2')"))
            .await;
        match &results[0] {
            StatementResult::Error(e) => {
                assert_eq!(e.sqlstate.as_deref(), Some("23505"))
            }
            _ => panic!("expected error"),
        }
    }

    #[tokio::test]
    async fn test_error_inside_transaction_rolls_back() {
        let mut exec = executor("txn-error", Role::Primary).await;
        exec.request(stmts("INSERT INTO t (k, v) VALUES ('a', '1')"))
            .await;

        let results = exec
            .request(stmts(
                "BEGIN; INSERT INTO t (k, v) VALUES ('b', '2'); INSERT INTO t (k, v) VALUES ('a', 'dup')",
            ))
            .await;
        assert!(results[2].is_error());

        // transaction is gone and the first insert of the batch with it
        let results = exec.request(stmts("COMMIT")).await;
        assert!(results[0].is_error());
        let results = exec.request(stmts("SELECT * FROM t WHERE k = 'b'")).await;
        match &results[0] {
            StatementResult::Rows(set) => assert!(set.rows.is_empty()),
            _ => panic!("expected rows"),
        }
    }

    #[tokio::test]
    async fn test_replica_without_remote_still_executes_locally() {
        let mut exec = executor("replica-local", Role::Replica).await;
        let results = exec
            .request(stmts("INSERT INTO t (k, v) VALUES ('a', '1')"))
            .await;
        assert!(!results[0].is_error());
        let results = exec.request(stmts("SELECT * FROM t")).await;
        match &results[0] {
            StatementResult::Rows(set) => assert_eq!(set.rows.len(), 1),
            _ => panic!("expected rows"),
        }
    }
}
