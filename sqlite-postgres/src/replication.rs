//! Cluster role and write forwarding.
//!
//! A replica forwards writes to its primary, and a primary mirrors
//! committed writes to a registered replica, both over the ordinary
//! postgres wire in simple-query mode. Each target database gets a pool
//! of exactly one connection so forwarded statements arrive in the order
//! they were issued.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

use deadpool_postgres::{
    Config, ManagerConfig, Object, Pool, PoolConfig, RecyclingMethod, Runtime,
};
use log::{debug, warn};
use tokio::sync::RwLock;
use tokio_postgres::NoTls;

const REPLICATION_USER: &str = "replication";
const MAX_POOL_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);
const PING_ATTEMPTS: usize = 3;
const PING_SPACING: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Primary,
    Replica,
}

#[derive(Debug)]
pub enum ReplicationError {
    /// No pool exists (or can exist) for the requested database.
    NoPool(String),
    Pool(String),
    Remote(tokio_postgres::Error),
}

impl fmt::Display for ReplicationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicationError::NoPool(db) => write!(f, "no replication pool for database {db}"),
            ReplicationError::Pool(msg) => write!(f, "replication pool error: {msg}"),
            ReplicationError::Remote(e) => write!(f, "remote error: {e}"),
        }
    }
}

impl std::error::Error for ReplicationError {}

impl From<tokio_postgres::Error> for ReplicationError {
    fn from(e: tokio_postgres::Error) -> Self {
        ReplicationError::Remote(e)
    }
}

struct Entry {
    pool: Pool,
    created: Instant,
}

/// Process-lifetime cluster state: the node role, the remote peer, and
/// one lazily created pool per forwarded database.
pub struct Cluster {
    role: AtomicU8,
    remote: RwLock<Option<(String, u16)>>,
    pools: RwLock<HashMap<String, Entry>>,
}

impl Cluster {
    pub fn new(role: Role) -> Cluster {
        Cluster {
            role: AtomicU8::new(role as u8),
            remote: RwLock::new(None),
            pools: RwLock::new(HashMap::new()),
        }
    }

    pub fn role(&self) -> Role {
        if self.role.load(Ordering::Relaxed) == Role::Replica as u8 {
            Role::Replica
        } else {
            Role::Primary
        }
    }

    pub async fn set_remote(&self, host: impl Into<String>, port: u16) {
        *self.remote.write().await = Some((host.into(), port));
    }

    pub async fn has_remote(&self) -> bool {
        self.remote.read().await.is_some()
    }

    /// Execute one statement on the remote peer.
    pub async fn exec(&self, db: &str, sql: &str) -> Result<(), ReplicationError> {
        let client = self.acquire(db).await?;
        client.simple_query(sql).await?;
        Ok(())
    }

    /// Start a remote transaction on the peer's copy of `db`.
    pub async fn begin(&self, db: &str) -> Result<RemoteTransaction, ReplicationError> {
        let client = self.acquire(db).await?;
        client.simple_query("BEGIN").await?;
        Ok(RemoteTransaction { client, open: true })
    }

    /// Close every pool. Used at server stop.
    pub async fn clear(&self) {
        self.pools.write().await.clear();
    }

    async fn acquire(&self, db: &str) -> Result<Object, ReplicationError> {
        let pool = self.pool_for(db).await?;
        let client = pool
            .get()
            .await
            .map_err(|e| ReplicationError::Pool(e.to_string()))?;

        for attempt in 1..=PING_ATTEMPTS {
            match client.simple_query("-- ping").await {
                Ok(_) => return Ok(client),
                Err(e) if attempt < PING_ATTEMPTS => {
                    debug!("replication ping {attempt} failed for {db}: {e}");
                    tokio::time::sleep(PING_SPACING).await;
                }
                Err(e) => {
                    warn!("dropping dead replication connection for {db}: {e}");
                    let _ = Object::take(client);
                    return Err(ReplicationError::Remote(e));
                }
            }
        }
        unreachable!("ping loop returns on success or final failure")
    }

    async fn pool_for(&self, db: &str) -> Result<Pool, ReplicationError> {
        let (host, port) = self
            .remote
            .read()
            .await
            .clone()
            .ok_or_else(|| ReplicationError::NoPool(db.to_string()))?;

        {
            let pools = self.pools.read().await;
            if let Some(entry) = pools.get(db) {
                if entry.created.elapsed() < MAX_POOL_LIFETIME {
                    return Ok(entry.pool.clone());
                }
            }
        }

        let mut pools = self.pools.write().await;
        // Re-check under the write lock; another task may have built it.
        if let Some(entry) = pools.get(db) {
            if entry.created.elapsed() < MAX_POOL_LIFETIME {
                return Ok(entry.pool.clone());
            }
        }

        let pool = build_pool(&host, port, db)?;
        debug!("created replication pool for {db} at {host}:{port}");
        pools.insert(
            db.to_string(),
            Entry {
                pool: pool.clone(),
                created: Instant::now(),
            },
        );
        Ok(pool)
    }
}

fn build_pool(host: &str, port: u16, db: &str) -> Result<Pool, ReplicationError> {
    let mut cfg = Config::new();
    cfg.host = Some(host.to_string());
    cfg.port = Some(port);
    cfg.dbname = Some(db.to_string());
    cfg.user = Some(REPLICATION_USER.to_string());
    cfg.password = Some(REPLICATION_USER.to_string());
    cfg.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Verified,
    });
    cfg.pool = Some(PoolConfig::new(1));
    cfg.create_pool(Some(Runtime::Tokio1), NoTls)
        .map_err(|e| ReplicationError::Pool(e.to_string()))
}

/// An open transaction on the remote peer.
pub struct RemoteTransaction {
    client: Object,
    open: bool,
}

impl RemoteTransaction {
    pub async fn exec(&self, sql: &str) -> Result<(), ReplicationError> {
        self.client.simple_query(sql).await?;
        Ok(())
    }

    pub async fn commit(mut self) -> Result<(), ReplicationError> {
        self.open = false;
        self.client.simple_query("COMMIT").await?;
        Ok(())
    }

    pub async fn rollback(mut self) -> Result<(), ReplicationError> {
        self.open = false;
        self.client.simple_query("ROLLBACK").await?;
        Ok(())
    }
}

impl Drop for RemoteTransaction {
    fn drop(&mut self) {
        if self.open {
            // The connection goes back to the pool with the transaction
            // unresolved; the peer rolls it back when the session resets.
            warn!("remote transaction dropped without commit or rollback");
        }
    }
}
