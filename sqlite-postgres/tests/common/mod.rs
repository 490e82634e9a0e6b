#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use pgwire::api::ClientInfo;
use sqlite_postgres::datastore::Registry;
use sqlite_postgres::replication::{Cluster, Role};
use sqlite_postgres::SessionService;

pub struct MockClient {
    metadata: HashMap<String, String>,
}

impl MockClient {
    pub fn new() -> Self {
        Self {
            metadata: HashMap::new(),
        }
    }
}

impl ClientInfo for MockClient {
    fn socket_addr(&self) -> std::net::SocketAddr {
        "127.0.0.1:5432".parse().unwrap()
    }

    fn is_secure(&self) -> bool {
        false
    }

    fn protocol_version(&self) -> pgwire::messages::ProtocolVersion {
        pgwire::messages::ProtocolVersion::PROTOCOL3_0
    }

    fn set_protocol_version(&mut self, _version: pgwire::messages::ProtocolVersion) {}

    fn pid_and_secret_key(&self) -> (i32, pgwire::messages::startup::SecretKey) {
        (0, pgwire::messages::startup::SecretKey::I32(0))
    }

    fn set_pid_and_secret_key(
        &mut self,
        _pid: i32,
        _secret_key: pgwire::messages::startup::SecretKey,
    ) {
    }

    fn state(&self) -> pgwire::api::PgWireConnectionState {
        pgwire::api::PgWireConnectionState::ReadyForQuery
    }

    fn set_state(&mut self, _new_state: pgwire::api::PgWireConnectionState) {}

    fn transaction_status(&self) -> pgwire::messages::response::TransactionStatus {
        pgwire::messages::response::TransactionStatus::Idle
    }

    fn set_transaction_status(
        &mut self,
        _new_status: pgwire::messages::response::TransactionStatus,
    ) {
    }

    fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut HashMap<String, String> {
        &mut self.metadata
    }

    fn client_certificates<'a>(&self) -> Option<&[rustls_pki_types::CertificateDer<'a>]> {
        None
    }
}

pub fn scratch_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "sqlite-postgres-it-{tag}-{}",
        std::process::id()
    ));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

pub struct TestServer {
    pub data_dir: PathBuf,
    pub registry: Arc<Registry>,
    pub service: SessionService,
}

/// Build a primary-role session service over a scratch data directory
/// with the session opened on `database`.
pub async fn setup_service(tag: &str, database: &str) -> TestServer {
    let data_dir = scratch_dir(tag);
    let registry = Arc::new(Registry::new(&data_dir).unwrap());
    let cluster = Arc::new(Cluster::new(Role::Primary));
    let service = SessionService::new(registry.clone(), cluster);
    service.open_session(database).await.unwrap();
    TestServer {
        data_dir,
        registry,
        service,
    }
}
