use std::sync::Arc;

use env_logger::Env;
use log::info;
use sqlite_postgres::datastore::Registry;
use sqlite_postgres::{bootstrap_cluster, serve_with_shutdown, ServerOptions};
use structopt::StructOpt;
use tokio::sync::watch;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "sqlite-postgres",
    about = "A postgres interface for sqlite database files. Serve every .db file in a directory as a database."
)]
struct Opt {
    /// Directory holding the database files
    #[structopt(long("data-dir"), short("d"), env = "DATA_DIR", default_value = "./data")]
    data_dir: String,
    /// Port the server listens to, default to 5432
    #[structopt(short, default_value = "5432")]
    port: u16,
    /// Host address the server listens to, default to 127.0.0.1
    #[structopt(long("host"), default_value = "127.0.0.1")]
    host: String,
    /// Primary address (host:port) to forward writes to; makes this node
    /// a replica
    #[structopt(long("replica-of"))]
    replica_of: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(
        Env::default().default_filter_or("sqlite_postgres=info,sqlite_postgres_cli=info"),
    )
    .init();

    let opts = Opt::from_args();

    std::fs::create_dir_all(&opts.data_dir)
        .map_err(|e| format!("Failed to create data directory {}: {e}", opts.data_dir))?;
    let registry = Arc::new(Registry::new(&opts.data_dir)?);

    let server_options = ServerOptions::new()
        .with_host(opts.host)
        .with_port(opts.port)
        .with_data_dir(opts.data_dir)
        .with_replica_of(opts.replica_of);

    let cluster = bootstrap_cluster(&registry, &server_options).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received ctrl-c");
            let _ = shutdown_tx.send(true);
        }
    });

    serve_with_shutdown(registry, cluster, &server_options, shutdown_rx)
        .await
        .map_err(|e| format!("Failed to run server: {e}"))?;

    Ok(())
}
