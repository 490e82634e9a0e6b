use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{stream, Sink};
use log::{debug, info};
use pgwire::api::auth::{
    finish_authentication, save_startup_parameters_to_metadata, DefaultServerParameterProvider,
    StartupHandler,
};
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DescribePortalResponse, DescribeStatementResponse, FieldInfo, QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::{ClientInfo, ErrorHandler, PgWireServerHandlers, Type, METADATA_DATABASE};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::{PgWireBackendMessage, PgWireFrontendMessage};
use sqlite_pg::datatypes::{arg_column_fallback, resolve_column_type};
use sqlite_pg::{decode_parameters, decl_type_to_pg, RowEncoder};
use tokio::sync::Mutex;

use crate::datastore::{valid_database_name, Datastore, Registry, ResultSet};
use crate::executor::{ExecError, SessionExecutor, StatementResult};
use crate::replication::Cluster;
use crate::sql::{self, Command};

/// A parsed statement held in the prepared-statement store, together
/// with its resolved parameter types.
#[derive(Debug, Clone)]
pub struct SessionStatement {
    stmt: sql::Statement,
    param_types: Vec<Type>,
}

impl SessionStatement {
    fn empty() -> Self {
        SessionStatement {
            stmt: sql::Statement {
                sql: String::new(),
                command: Command::Unknown,
                tables: Vec::new(),
                arg_columns: Vec::new(),
                returns_rows: false,
                parameters: Vec::new(),
            },
            param_types: Vec::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.stmt.sql.is_empty()
    }
}

struct Session {
    datastore: Arc<Datastore>,
    executor: SessionExecutor,
}

type SharedSession = Arc<Mutex<Option<Session>>>;

/// One factory is built per accepted socket, so prepared statements,
/// portals and transaction state never leak across connections.
pub struct HandlerFactory {
    pub session_service: Arc<SessionService>,
}

impl HandlerFactory {
    pub fn new(registry: Arc<Registry>, cluster: Arc<Cluster>) -> Self {
        HandlerFactory {
            session_service: Arc::new(SessionService::new(registry, cluster)),
        }
    }
}

impl PgWireServerHandlers for HandlerFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.session_service.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.session_service.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        Arc::new(StartupValidator {
            registry: self.session_service.registry.clone(),
            cluster: self.session_service.cluster.clone(),
            session: self.session_service.session.clone(),
        })
    }

    fn error_handler(&self) -> Arc<impl ErrorHandler> {
        Arc::new(LoggingErrorHandler)
    }
}

struct LoggingErrorHandler;

impl ErrorHandler for LoggingErrorHandler {
    fn on_error<C>(&self, _client: &C, error: &mut PgWireError)
    where
        C: ClientInfo,
    {
        info!("Sending error: {error}")
    }
}

/// Validates the startup `database` parameter and opens the session's
/// datastore before authentication completes.
struct StartupValidator {
    registry: Arc<Registry>,
    cluster: Arc<Cluster>,
    session: SharedSession,
}

#[async_trait]
impl StartupHandler for StartupValidator {
    async fn on_startup<C>(
        &self,
        client: &mut C,
        message: PgWireFrontendMessage,
    ) -> PgWireResult<()>
    where
        C: ClientInfo + Sink<PgWireBackendMessage> + Unpin + Send,
        C::Error: Debug,
        PgWireError: From<<C as Sink<PgWireBackendMessage>>::Error>,
    {
        if let PgWireFrontendMessage::Startup(ref startup) = message {
            save_startup_parameters_to_metadata(client, startup);

            let database = client
                .metadata()
                .get(METADATA_DATABASE)
                .cloned()
                .unwrap_or_default();
            if !valid_database_name(&database) {
                return Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                    "FATAL".to_string(),
                    "3D000".to_string(),
                    format!("invalid database name \"{database}\""),
                ))));
            }

            let datastore = self
                .registry
                .open(&database)
                .await
                .map_err(|e| PgWireError::ApiError(Box::new(e)))?;
            let executor = SessionExecutor::new(datastore.clone(), self.cluster.clone());
            *self.session.lock().await = Some(Session {
                datastore,
                executor,
            });

            finish_authentication(client, &DefaultServerParameterProvider::default()).await?;
        }
        Ok(())
    }
}

/// The pgwire handler backed by a session's datastore and executor.
pub struct SessionService {
    registry: Arc<Registry>,
    cluster: Arc<Cluster>,
    session: SharedSession,
    parser: Arc<Parser>,
}

impl SessionService {
    pub fn new(registry: Arc<Registry>, cluster: Arc<Cluster>) -> SessionService {
        let session: SharedSession = Arc::new(Mutex::new(None));
        let parser = Arc::new(Parser {
            session: session.clone(),
        });
        SessionService {
            registry,
            cluster,
            session,
            parser,
        }
    }

    /// Open the session without going through the startup flow.
    pub async fn open_session(&self, database: &str) -> rusqlite::Result<()> {
        let datastore = self.registry.open(database).await?;
        let executor = SessionExecutor::new(datastore.clone(), self.cluster.clone());
        *self.session.lock().await = Some(Session {
            datastore,
            executor,
        });
        Ok(())
    }

    fn no_session_error() -> PgWireError {
        PgWireError::UserError(Box::new(ErrorInfo::new(
            "FATAL".to_string(),
            "08P01".to_string(),
            "no database selected for this session".to_string(),
        )))
    }

    /// `-- …ping` markers are zero-cost health checks.
    fn is_ping(query: &str) -> bool {
        let trimmed = query.trim();
        trimmed.starts_with("--") && trimmed.ends_with("ping")
    }

    fn create_database_name(query: &str) -> Option<String> {
        let trimmed = query.trim().trim_end_matches(';').trim();
        let mut words = trimmed.split_whitespace();
        if !words.next()?.eq_ignore_ascii_case("CREATE") {
            return None;
        }
        if !words.next()?.eq_ignore_ascii_case("DATABASE") {
            return None;
        }
        let name = words.next()?.trim_matches('"').trim_matches('\'');
        (!name.is_empty()).then(|| name.to_string())
    }

    /// Describe the result columns without executing: preparing the
    /// statement is enough for the engine to report names and declared
    /// types.
    async fn describe_fields(
        &self,
        stmt: &sql::Statement,
        format: &Format,
    ) -> PgWireResult<Vec<FieldInfo>> {
        if !stmt.returns_rows {
            return Ok(Vec::new());
        }

        let datastore = {
            let guard = self.session.lock().await;
            let session = guard.as_ref().ok_or_else(Self::no_session_error)?;
            session.datastore.clone()
        };
        let columns = datastore
            .describe(&stmt.sql)
            .await
            .map_err(|e| PgWireError::ApiError(Box::new(e)))?;

        Ok(columns
            .iter()
            .enumerate()
            .map(|(i, col)| {
                FieldInfo::new(
                    col.name.clone(),
                    None,
                    None,
                    resolve_column_type(col, None),
                    format.format_for(i),
                )
            })
            .collect())
    }
}

fn exec_error_info(e: ExecError) -> ErrorInfo {
    ErrorInfo::new(
        "ERROR".to_string(),
        e.sqlstate.unwrap_or_else(|| "XX000".to_string()),
        e.message,
    )
}

fn tag_for(command: Command, rows_affected: usize) -> Tag {
    match command {
        Command::Insert => Tag::new("INSERT").with_oid(0).with_rows(rows_affected),
        Command::Update | Command::Delete => Tag::new(command.tag()).with_rows(rows_affected),
        _ => Tag::new(command.tag()),
    }
}

/// Encode a collected result set, honoring the per-column result format
/// the portal negotiated.
fn encode_result(result: ResultSet, format: &Format) -> QueryResponse {
    let fields: Vec<FieldInfo> = result
        .columns
        .iter()
        .enumerate()
        .map(|(i, col)| {
            let value = result.rows.first().and_then(|row| row.get(i));
            FieldInfo::new(
                col.name.clone(),
                None,
                None,
                resolve_column_type(col, value),
                format.format_for(i),
            )
        })
        .collect();
    let fields = Arc::new(fields);

    let mut encoder = RowEncoder::new(result.rows, fields.clone());
    let mut rows = Vec::new();
    while let Some(row) = encoder.next_row() {
        rows.push(row);
    }
    QueryResponse::new(fields, Box::pin(stream::iter(rows)))
}

fn statement_response(result: StatementResult, format: &Format) -> Response {
    match result {
        StatementResult::Rows(set) => Response::Query(encode_result(set, format)),
        StatementResult::Complete {
            command,
            rows_affected,
        } => Response::Execution(tag_for(command, rows_affected)),
        StatementResult::Error(e) => Response::Error(Box::new(exec_error_info(e))),
    }
}

#[async_trait]
impl SimpleQueryHandler for SessionService {
    async fn do_query<C>(&self, _client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        debug!("Received query: {query}");

        if Self::is_ping(query) {
            return Ok(vec![Response::Execution(Tag::new("SELECT").with_rows(1))]);
        }

        if let Some(name) = Self::create_database_name(query) {
            self.registry
                .open(&name)
                .await
                .map_err(|e| PgWireError::ApiError(Box::new(e)))?;
            return Ok(vec![Response::Execution(Tag::new("CREATE DATABASE"))]);
        }

        let rewritten = sql::rewrite(query);
        let statements = sql::parse(&rewritten).map_err(|e| PgWireError::ApiError(Box::new(e)))?;
        if statements.is_empty() {
            return Ok(vec![Response::EmptyQuery]);
        }

        let mut guard = self.session.lock().await;
        let session = guard.as_mut().ok_or_else(Self::no_session_error)?;
        let results = session.executor.request(statements).await;

        Ok(results
            .into_iter()
            .map(|result| statement_response(result, &Format::UnifiedText))
            .collect())
    }
}

#[async_trait]
impl ExtendedQueryHandler for SessionService {
    type Statement = SessionStatement;
    type QueryParser = Parser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.parser.clone()
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        let statement = &target.statement;
        if statement.is_empty() {
            return Ok(DescribeStatementResponse::new(Vec::new(), Vec::new()));
        }

        let fields = self
            .describe_fields(&statement.stmt, &Format::UnifiedText)
            .await?;
        Ok(DescribeStatementResponse::new(
            statement.param_types.clone(),
            fields,
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        let statement = &target.statement.statement;
        if statement.is_empty() {
            return Ok(DescribePortalResponse::new(Vec::new()));
        }

        let fields = self
            .describe_fields(&statement.stmt, &target.result_column_format)
            .await?;
        Ok(DescribePortalResponse::new(fields))
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        let statement = &portal.statement.statement;
        debug!("Received execute extended query: {}", statement.stmt.sql);

        if statement.is_empty() {
            return Ok(Response::EmptyQuery);
        }

        let expected = statement.stmt.num_params();
        if portal.parameters.len() != expected {
            return Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".to_string(),
                "08P01".to_string(),
                format!(
                    "bind message supplies {} parameters, but prepared statement requires {}",
                    portal.parameters.len(),
                    expected
                ),
            ))));
        }

        let mut stmt = statement.stmt.clone();
        stmt.parameters = decode_parameters(portal, &statement.param_types)?;

        let mut guard = self.session.lock().await;
        let session = guard.as_mut().ok_or_else(Self::no_session_error)?;
        let mut results = session.executor.request(vec![stmt]).await;
        drop(guard);

        match results.remove(0) {
            StatementResult::Error(e) => Err(PgWireError::UserError(Box::new(exec_error_info(e)))),
            result => Ok(statement_response(result, &portal.result_column_format)),
        }
    }
}

/// Rewrites, parses and parameter-types the SQL of a Parse message.
pub struct Parser {
    session: SharedSession,
}

#[async_trait]
impl QueryParser for Parser {
    type Statement = SessionStatement;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        types: &[Type],
    ) -> PgWireResult<Self::Statement> {
        debug!("Received parse extended query: {sql}");

        let rewritten = sql::rewrite(sql);
        let mut statements =
            sql::parse(&rewritten).map_err(|e| PgWireError::ApiError(Box::new(e)))?;

        // An empty Parse is legal; it binds and executes as a no-op.
        if statements.is_empty() {
            return Ok(SessionStatement::empty());
        }
        if statements.len() > 1 {
            return Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".to_string(),
                "26P00".to_string(),
                "cannot insert multiple commands into a prepared statement".to_string(),
            ))));
        }

        let stmt = statements.remove(0);
        let param_types = if !types.is_empty() && types.len() >= stmt.num_params() {
            types.to_vec()
        } else {
            self.infer_param_types(&stmt).await?
        };

        Ok(SessionStatement { stmt, param_types })
    }
}

impl Parser {
    /// Resolve one OID per `$n` by looking its argument column up in the
    /// schema of the statement's tables.
    async fn infer_param_types(&self, stmt: &sql::Statement) -> PgWireResult<Vec<Type>> {
        if stmt.arg_columns.is_empty() {
            return Ok(Vec::new());
        }

        let datastore = {
            let guard = self.session.lock().await;
            let session = guard
                .as_ref()
                .ok_or_else(SessionService::no_session_error)?;
            session.datastore.clone()
        };

        let decl_types = datastore
            .arg_column_types(&stmt.tables, &stmt.arg_columns)
            .await
            .map_err(|e| PgWireError::ApiError(Box::new(e)))?;

        Ok(stmt
            .arg_columns
            .iter()
            .map(|column| match decl_types.get(column) {
                Some(decl) => decl_type_to_pg(decl),
                None => arg_column_fallback(column),
            })
            .collect())
    }
}
