mod handlers;

pub mod datastore;
pub mod executor;
pub mod replication;
pub mod sql;

use std::io::{Error as IOError, ErrorKind};
use std::sync::Arc;

use getset::{Getters, Setters, WithSetters};
use log::{info, warn};
use pgwire::tokio::process_socket;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};

use crate::datastore::Registry;
use crate::replication::{Cluster, Role};
pub use handlers::{HandlerFactory, Parser, SessionService, SessionStatement};

/// re-exports
pub use pgwire;
pub use sqlite_pg;
pub use sqlite_pg_catalog;

#[derive(Getters, Setters, WithSetters, Debug)]
#[getset(get = "pub", set = "pub", set_with = "pub")]
pub struct ServerOptions {
    host: String,
    port: u16,
    data_dir: String,
    /// Address of the primary this node replicates from. Setting it
    /// makes the node a replica.
    replica_of: Option<String>,
}

impl ServerOptions {
    pub fn new() -> ServerOptions {
        ServerOptions::default()
    }
}

impl Default for ServerOptions {
    fn default() -> Self {
        ServerOptions {
            host: "127.0.0.1".to_string(),
            port: 5432,
            data_dir: "./data".to_string(),
            replica_of: None,
        }
    }
}

/// Build the process-lifetime cluster state from the options: the node
/// role, the remote peer for a replica, and for a primary the first
/// registered replica from the system database.
pub async fn bootstrap_cluster(
    registry: &Registry,
    opts: &ServerOptions,
) -> Result<Arc<Cluster>, IOError> {
    let cluster = match &opts.replica_of {
        Some(addr) => {
            let (host, port) = split_addr(addr)?;
            let cluster = Cluster::new(Role::Replica);
            cluster.set_remote(host, port).await;
            cluster
        }
        None => {
            let cluster = Cluster::new(Role::Primary);
            let system = registry.open_system().map_err(IOError::other)?;
            let replicas = system.replicas().await.map_err(IOError::other)?;
            if let Some(replica) = replicas.first() {
                let (host, port) = split_addr(&replica.addr)?;
                cluster.set_remote(host, port).await;
                info!("replicating writes to {} for {}", replica.addr, replica.db);
            }
            cluster
        }
    };
    Ok(Arc::new(cluster))
}

fn split_addr(addr: &str) -> Result<(String, u16), IOError> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| IOError::new(ErrorKind::InvalidInput, format!("invalid address {addr}")))?;
    let port = port
        .parse::<u16>()
        .map_err(|e| IOError::new(ErrorKind::InvalidInput, e))?;
    Ok((host.to_string(), port))
}

/// Serve the data directory with the postgres protocol until the process
/// exits.
pub async fn serve(
    registry: Arc<Registry>,
    cluster: Arc<Cluster>,
    opts: &ServerOptions,
) -> Result<(), IOError> {
    let (_tx, rx) = watch::channel(false);
    serve_with_shutdown(registry, cluster, opts, rx).await
}

/// Serve until `shutdown` fires, then close the listener and every
/// tracked session, wait for the session tasks to finish, clear the
/// replication pools and drop the open datastores. Session-task errors
/// are aggregated into the returned error.
pub async fn serve_with_shutdown(
    registry: Arc<Registry>,
    cluster: Arc<Cluster>,
    opts: &ServerOptions,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), IOError> {
    let server_addr = format!("{}:{}", opts.host, opts.port);
    let listener = TcpListener::bind(&server_addr).await?;
    info!("Listening on {server_addr} (unencrypted)");

    // Every session task lives in this set; a task leaves it when its
    // connection ends, and all remaining tasks are closed and joined at
    // shutdown.
    let mut sessions: JoinSet<Result<(), IOError>> = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("shutting down");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, _addr)) => {
                        // Handler state is per connection: prepared
                        // statements, portals and transactions live and
                        // die with the socket.
                        let factory =
                            Arc::new(HandlerFactory::new(registry.clone(), cluster.clone()));
                        sessions.spawn(process_socket(socket, None, factory));
                    }
                    Err(e) => {
                        warn!("Error accept socket: {e}");
                    }
                }
            }
            Some(finished) = sessions.join_next() => {
                if let Err(e) = session_outcome(finished) {
                    warn!("Session ended with error: {e}");
                }
            }
        }
    }

    drop(listener);
    sessions.abort_all();

    let mut errors = Vec::new();
    while let Some(finished) = sessions.join_next().await {
        if let Err(e) = session_outcome(finished) {
            warn!("Session ended with error: {e}");
            errors.push(e.to_string());
        }
    }

    cluster.clear().await;
    registry.close_all().await;

    if errors.is_empty() {
        Ok(())
    } else {
        Err(IOError::other(format!(
            "{} session task(s) failed: {}",
            errors.len(),
            errors.join("; ")
        )))
    }
}

/// Flatten a joined session task into its terminal error, treating
/// shutdown cancellation as clean.
fn session_outcome(finished: Result<Result<(), IOError>, JoinError>) -> Result<(), IOError> {
    match finished {
        Ok(result) => result,
        Err(e) if e.is_cancelled() => Ok(()),
        Err(e) => Err(IOError::other(e)),
    }
}
