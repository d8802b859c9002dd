use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::{self, ClubAuthSource, ROLE_KEY, SESSION_USER_KEY};
use crate::club::ClubManager;
use crate::config::ClubConfig;
use crate::engine::{Engine, Slot};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command};

pub struct ClubHandler {
    clubs: Arc<ClubManager>,
    query_parser: Arc<ClubQueryParser>,
}

impl ClubHandler {
    pub fn new(clubs: Arc<ClubManager>) -> Self {
        Self {
            clubs,
            query_parser: Arc::new(ClubQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.clubs.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("club error: {e}"),
            )))
        })
    }

    /// Parse, run and time one statement on behalf of the connected session.
    async fn run<C: ClientInfo>(&self, client: &mut C, query: &str) -> PgWireResult<Response> {
        let engine = self.resolve_engine(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = command_label(&cmd);

        let started = Instant::now();
        let result = self.execute_command(client, &engine, cmd).await;
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result
    }

    async fn execute_command<C: ClientInfo>(
        &self,
        client: &mut C,
        engine: &Engine,
        cmd: Command,
    ) -> PgWireResult<Response> {
        match cmd {
            Command::SetAuthorization { user } => {
                let metadata = client.metadata_mut();
                match user {
                    Some(user) => metadata.insert(SESSION_USER_KEY.to_string(), user),
                    None => metadata.remove(SESSION_USER_KEY),
                };
                Ok(Response::Execution(Tag::new("SET")))
            }
            Command::SetRole { role } => {
                client
                    .metadata_mut()
                    .insert(ROLE_KEY.to_string(), role.as_str().to_string());
                Ok(Response::Execution(Tag::new("SET")))
            }
            Command::SelectSlots(req) => {
                let caller = auth::auth_context(client.metadata());
                let slots = engine
                    .available_slots(&caller, req)
                    .await
                    .map_err(engine_err)?;
                slot_rows(&engine.config, slots)
            }
            Command::SelectActivities {
                day,
                location_id,
                coach_id,
            } => {
                let activities = engine
                    .activities_on(day, location_id.as_deref(), coach_id.as_deref())
                    .await;
                activity_rows(activities)
            }
            Command::SelectActivity { id } => {
                let activity = engine.get_activity(id).await.map_err(engine_err)?;
                activity_rows(vec![activity])
            }
            Command::InsertBooking(req) => {
                let caller = auth::auth_context(client.metadata());
                let activity = engine
                    .create_booking(&caller, req)
                    .await
                    .map_err(engine_err)?;
                activity_rows(vec![activity])
            }
            Command::InsertBlock(req) => {
                let caller = auth::auth_context(client.metadata());
                let blocks = engine
                    .create_block(&caller, req)
                    .await
                    .map_err(engine_err)?;
                activity_rows(blocks)
            }
            Command::ChangeStatus { id, status } => {
                let caller = auth::auth_context(client.metadata());
                let activity = engine
                    .change_status(&caller, id, status)
                    .await
                    .map_err(engine_err)?;
                activity_rows(vec![activity])
            }
            Command::DeleteActivity { id } => {
                let caller = auth::auth_context(client.metadata());
                engine
                    .delete_activity(&caller, id)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
        }
    }
}

// ── Result sets ──────────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn slot_schema() -> Vec<FieldInfo> {
    vec![
        field("time", Type::INT8),
        field("local_time", Type::VARCHAR),
        field("max_duration", Type::INT8),
        field("bookable", Type::BOOL),
        field("locked", Type::BOOL),
        field("whole_day", Type::BOOL),
        field("occupied_by", Type::VARCHAR),
    ]
}

fn activity_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("owner_id", Type::VARCHAR),
        field("coach_id", Type::VARCHAR),
        field("location_id", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
        field("status", Type::VARCHAR),
        field("category", Type::VARCHAR),
        field("notes", Type::VARCHAR),
        field("participant_count", Type::INT8),
        field("table_count", Type::INT8),
        field("reminder_sent", Type::BOOL),
    ]
}

/// `max_duration` goes out in minutes; free-slot lengths are minute multiples.
fn slot_rows(config: &ClubConfig, slots: Vec<Slot>) -> PgWireResult<Response> {
    let schema = Arc::new(slot_schema());
    let rows: Vec<PgWireResult<_>> = slots
        .into_iter()
        .map(|slot| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&slot.time)?;
            encoder.encode_field(&config.format_local(slot.time))?;
            encoder.encode_field(&(slot.max_duration() / MINUTE))?;
            encoder.encode_field(&slot.bookable)?;
            encoder.encode_field(&slot.locked)?;
            encoder.encode_field(&slot.whole_day)?;
            encoder.encode_field(&slot.occupied_by().map(|id| id.to_string()))?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn activity_rows(activities: Vec<Activity>) -> PgWireResult<Response> {
    let schema = Arc::new(activity_schema());
    let rows: Vec<PgWireResult<_>> = activities
        .into_iter()
        .map(|a| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&a.id.to_string())?;
            encoder.encode_field(&a.owner_id)?;
            encoder.encode_field(&a.coach_id)?;
            encoder.encode_field(&a.location_id)?;
            encoder.encode_field(&a.span.start)?;
            encoder.encode_field(&a.span.end)?;
            encoder.encode_field(&a.status.as_str().to_string())?;
            encoder.encode_field(&a.category.as_str().to_string())?;
            encoder.encode_field(&a.notes)?;
            encoder.encode_field(&a.participant_count.map(i64::from))?;
            encoder.encode_field(&a.table_count.map(i64::from))?;
            encoder.encode_field(&a.reminder_sent)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

/// Result columns for a statement text, before parameters are bound.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    if upper.trim_start().starts_with("DELETE") || upper.trim_start().starts_with("SET") {
        vec![]
    } else if upper.contains("SLOTS") {
        slot_schema()
    } else if ["ACTIVITIES", "BOOKINGS", "BLOCKS", "STATUS_CHANGES"]
        .iter()
        .any(|t| upper.contains(t))
    {
        activity_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for ClubHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(client, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct ClubQueryParser;

#[async_trait]
impl QueryParser for ClubQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for ClubHandler {
    type Statement = String;
    type QueryParser = ClubQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(portal);
        self.run(client, &sql).await
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            result_schema(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
/// Highest index first, so `$1` never eats the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct ClubServerHandlers {
    handler: Arc<ClubHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<ClubAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl ClubServerHandlers {
    pub fn new(clubs: Arc<ClubManager>, password: String) -> Self {
        let auth_source = ClubAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(ClubHandler::new(clubs)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for ClubServerHandlers {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    clubs: Arc<ClubManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let handlers = Arc::new(ClubServerHandlers::new(clubs, password));
    pgwire::tokio::process_socket(socket, tls, handlers).await
}

fn engine_err(e: crate::engine::EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        e.sqlstate().into(),
        client_message(&e),
    )))
}

/// Storage failures are logged server-side; clients only see that one happened.
fn client_message(e: &crate::engine::EngineError) -> String {
    match e {
        crate::engine::EngineError::WalError(_) => "internal storage error".into(),
        other => other.to_string(),
    }
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
