use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::NaiveTime;
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

use crate::auth::ChairbookAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, BookingFilter, Command};

pub struct ChairbookHandler {
    engine: Arc<Engine>,
    query_parser: Arc<ChairbookQueryParser>,
}

impl ChairbookHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(ChairbookQueryParser),
        }
    }

    /// Parse and execute one statement, recording query metrics.
    async fn run(&self, query: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        self.run_command(cmd).await
    }

    async fn run_command(&self, cmd: Command) -> PgWireResult<Response> {
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertUser { id, phone } => {
                engine.register_user(id, phone).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertBarber { id, phone } => {
                engine.register_barber(id, phone).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertService { service } => {
                engine.upsert_service(service).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::DeleteService { id } => {
                engine.remove_service(id).await.map_err(engine_err)?;
                Ok(deleted(1))
            }
            Command::InsertTemplate {
                barber_id,
                day_of_week,
                hours,
            } => {
                engine
                    .configure_template(barber_id, day_of_week, hours)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertOverride {
                barber_id,
                date,
                hours,
                closed_slots,
                fully_closed,
            } => {
                engine
                    .set_override(barber_id, date, hours, closed_slots, fully_closed)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::DeleteOverride { barber_id, date } => {
                engine.remove_override(barber_id, date).await.map_err(engine_err)?;
                Ok(deleted(1))
            }
            Command::InsertClosedSlots {
                barber_id,
                date,
                slots,
            } => {
                engine
                    .add_closed_slots(barber_id, date, &slots)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(slots.len()))
            }
            Command::DeleteClosedSlots {
                barber_id,
                date,
                slot,
            } => {
                match slot {
                    Some(slot) => engine.remove_closed_slots(barber_id, date, &[slot]).await,
                    None => engine.clear_closed_slots(barber_id, date).await,
                }
                .map_err(engine_err)?;
                Ok(deleted(1))
            }
            Command::InsertDateStatus {
                barber_id,
                date,
                open,
            } => {
                engine
                    .set_date_open(barber_id, date, open)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertBooking {
                id,
                barber_id,
                user_id,
                service_id,
                date,
                start,
            } => {
                engine
                    .book_appointment(id, barber_id, user_id, service_id, date, start)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::DeleteBooking { id } => {
                engine.cancel_appointment(id).await.map_err(engine_err)?;
                Ok(deleted(1))
            }
            Command::SelectAvailability {
                barber_id,
                date,
                service_id,
            } => {
                let times = engine
                    .available_start_times(barber_id, date, service_id)
                    .await
                    .map_err(engine_err)?;
                let (barber, day) = (barber_id.to_string(), date.to_string());
                rows(availability_schema(), times, |enc, t| {
                    enc.encode_field(&barber)?;
                    enc.encode_field(&day)?;
                    enc.encode_field(&fmt_time(t))
                })
            }
            Command::SelectBookings { filter } => {
                let bookings = match filter {
                    BookingFilter::Barber { barber_id, date } => engine.list_bookings(barber_id, date).await,
                    BookingFilter::User { user_id } => engine.list_bookings_for_user(user_id).await,
                    BookingFilter::Id { id } => engine.get_booking(id).await.into_iter().collect(),
                };
                rows(bookings_schema(), bookings, |enc, b| {
                    enc.encode_field(&b.id.to_string())?;
                    enc.encode_field(&b.barber_id.to_string())?;
                    enc.encode_field(&b.user_id.to_string())?;
                    enc.encode_field(&b.service_id.to_string())?;
                    enc.encode_field(&b.date.to_string())?;
                    enc.encode_field(&fmt_time(b.start))?;
                    enc.encode_field(&fmt_time(b.end))
                })
            }
            Command::SelectTemplates { barber_id } => {
                let templates = engine.get_templates(barber_id).await;
                rows(templates_schema(), templates, |enc, t| {
                    enc.encode_field(&t.barber_id.to_string())?;
                    enc.encode_field(&i32::from(t.day_of_week))?;
                    encode_hours(enc, Some(&t.hours))
                })
            }
            Command::SelectOverride { barber_id, date } => {
                let found = engine.get_override(barber_id, date).await;
                rows(overrides_schema(), found.into_iter().collect(), |enc, ov| {
                    enc.encode_field(&barber_id.to_string())?;
                    enc.encode_field(&date.to_string())?;
                    encode_hours(enc, ov.hours.as_ref())?;
                    enc.encode_field(&ov.fully_closed)?;
                    enc.encode_field(&closed_slots_json(&ov))
                })
            }
            Command::SelectUser { phone } => {
                let found = engine.find_user_by_phone(&phone);
                rows(users_schema(), found.into_iter().collect(), |enc, id| {
                    enc.encode_field(&id.to_string())?;
                    enc.encode_field(&phone)
                })
            }
            Command::SelectServices { barber_id } => {
                let services = engine.active_services(barber_id);
                rows(services_schema(), services, |enc, s| {
                    enc.encode_field(&s.id.to_string())?;
                    enc.encode_field(&s.barber_id.to_string())?;
                    enc.encode_field(&s.name)?;
                    enc.encode_field(&(s.duration_slots as i32))?;
                    enc.encode_field(&(s.price_cents as i64))?;
                    enc.encode_field(&s.active)
                })
            }
        }
    }
}

fn inserted(n: usize) -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(n))
}

fn deleted(n: usize) -> Response {
    Response::Execution(Tag::new("DELETE").with_rows(n))
}

fn fmt_time(t: NaiveTime) -> String {
    t.format("%H:%M").to_string()
}

/// Encode `items` as a row set under `schema`.
fn rows<T>(
    schema: Vec<FieldInfo>,
    items: Vec<T>,
    encode: impl Fn(&mut DataRowEncoder, T) -> PgWireResult<()>,
) -> PgWireResult<Response> {
    let schema = Arc::new(schema);
    let data: Vec<PgWireResult<_>> = items
        .into_iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(data))))
}

/// Five window/interval columns; NULL when the hours are inherited.
fn encode_hours(enc: &mut DataRowEncoder, hours: Option<&WorkingHours>) -> PgWireResult<()> {
    let h = hours.copied();
    enc.encode_field(&h.map(|h| fmt_time(h.morning.start)))?;
    enc.encode_field(&h.map(|h| fmt_time(h.morning.end)))?;
    enc.encode_field(&h.map(|h| fmt_time(h.afternoon.start)))?;
    enc.encode_field(&h.map(|h| fmt_time(h.afternoon.end)))?;
    enc.encode_field(&h.map(|h| h.interval_minutes as i32))
}

/// Closed slots as a JSON array of `"HH:MM"` strings.
fn closed_slots_json(ov: &ScheduleOverride) -> String {
    let slots: Vec<String> = ov.closed_slots.iter().map(|t| fmt_time(*t)).collect();
    serde_json::Value::from(slots).to_string()
}

// ── Result schemas ───────────────────────────────────────────────

fn text(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn typed(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![text("barber_id"), text("date"), text("start_time")]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("barber_id"),
        text("user_id"),
        text("service_id"),
        text("date"),
        text("start_time"),
        text("end_time"),
    ]
}

fn hours_columns() -> Vec<FieldInfo> {
    vec![
        text("am_start"),
        text("am_end"),
        text("pm_start"),
        text("pm_end"),
        typed("interval_minutes", Type::INT4),
    ]
}

fn templates_schema() -> Vec<FieldInfo> {
    let mut schema = vec![text("barber_id"), typed("day_of_week", Type::INT4)];
    schema.extend(hours_columns());
    schema
}

fn overrides_schema() -> Vec<FieldInfo> {
    let mut schema = vec![text("barber_id"), text("date")];
    schema.extend(hours_columns());
    schema.push(typed("closed", Type::BOOL));
    schema.push(typed("closed_slots", Type::JSON));
    schema
}

fn services_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("barber_id"),
        text("name"),
        typed("duration", Type::INT4),
        typed("price_cents", Type::INT8),
        typed("active", Type::BOOL),
    ]
}

fn users_schema() -> Vec<FieldInfo> {
    vec![text("id"), text("phone")]
}

/// Result columns for a statement, judged by the table it selects from.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    match sql::select_table(sql).as_deref() {
        Some("availability") => availability_schema(),
        Some("bookings") => bookings_schema(),
        Some("templates") => templates_schema(),
        Some("overrides") => overrides_schema(),
        Some("services") => services_schema(),
        Some("users") => users_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for ChairbookHandler {
    async fn do_query<C>(
        &self,
        _client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        // Statements run in order; the first failure ends the batch.
        let commands = sql::parse_script(query).map_err(sql_err)?;
        let mut responses = Vec::with_capacity(commands.len());
        for cmd in commands {
            responses.push(self.run_command(cmd).await?);
        }
        Ok(responses)
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct ChairbookQueryParser;

#[async_trait]
impl QueryParser for ChairbookQueryParser {
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
impl ExtendedQueryHandler for ChairbookHandler {
    type Statement = String;
    type QueryParser = ChairbookQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(&portal.statement.statement, &portal.parameters);
        self.run(&sql).await
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

/// Highest `$N` placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
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

fn quote_param(param: Option<&Bytes>) -> String {
    match param {
        Some(bytes) => format!("'{}'", String::from_utf8_lossy(bytes).replace('\'', "''")),
        None => "NULL".to_string(),
    }
}

/// Replace each `$N` placeholder with the bound parameter as a quoted literal.
///
/// One left-to-right pass: text inside `'...'` literals is copied untouched, and
/// substituted values are never rescanned. Placeholders with no bound value stay as written.
fn substitute_params(sql: &str, params: &[Option<Bytes>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.char_indices().peekable();
    let mut in_literal = false;
    while let Some((i, c)) = chars.next() {
        if in_literal || c != '$' {
            if c == '\'' {
                in_literal = !in_literal;
            }
            out.push(c);
            continue;
        }
        let digits_start = i + 1;
        let mut digits_end = digits_start;
        while let Some(&(j, d)) = chars.peek() {
            if !d.is_ascii_digit() {
                break;
            }
            digits_end = j + 1;
            chars.next();
        }
        let index = sql[digits_start..digits_end].parse::<usize>().ok();
        match index.and_then(|n| n.checked_sub(1)).and_then(|k| params.get(k)) {
            Some(param) => out.push_str(&quote_param(param.as_ref())),
            None => out.push_str(&sql[i..digits_end]),
        }
    }
    out
}

// ── Connection ───────────────────────────────────────────────────

pub struct ChairbookFactory {
    handler: Arc<ChairbookHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<ChairbookAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl ChairbookFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        let auth_source = ChairbookAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(ChairbookHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for ChairbookFactory {
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
    engine: Arc<Engine>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = ChairbookFactory::new(engine, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

/// SQLSTATE for each engine failure.
fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::InvalidDate(_)
        | EngineError::InvalidDayOfWeek(_)
        | EngineError::InvalidStartTime
        | EngineError::InvalidTimeInterval(_)
        | EngineError::InvalidDuration(_) => "22023",
        EngineError::TimeSlotNotFound(_)
        | EngineError::ServiceNotFound(_)
        | EngineError::UserNotFound(_)
        | EngineError::BarberNotFound(_)
        | EngineError::BookingNotFound(_) => "P0002",
        EngineError::TimeSlotNotAvailable => "23P01",
        EngineError::AlreadyExists(_) | EngineError::PhoneInUse(_) => "23505",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
