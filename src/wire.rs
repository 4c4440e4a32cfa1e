use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono_tz::Tz;
use futures::Sink;
use futures::stream;
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
use tracing::debug;

use crate::auth::BookdAuthSource;
use crate::engine::{Engine, EngineError, Proposal, Window};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command};
use crate::timezone;

pub struct BookdHandler {
    engine: Arc<Engine>,
    query_parser: Arc<BookdQueryParser>,
}

impl BookdHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(BookdQueryParser),
        }
    }

    /// The connecting user name is the caller identity (`customer:<ulid>`,
    /// `professional:<ulid>`, `admin`, `gateway`).
    fn resolve_actor<C: ClientInfo>(&self, client: &C) -> PgWireResult<Actor> {
        let user = client.metadata().get("user").cloned().unwrap_or_default();
        Actor::parse(&user).ok_or_else(|| {
            metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
            user_error("28000", format!("unrecognised identity: {user:?}"))
        })
    }

    async fn run(&self, actor: Actor, sql: &str) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(actor, cmd).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        result
    }

    async fn execute_command(&self, actor: Actor, cmd: Command) -> PgWireResult<Vec<Response>> {
        let engine = &self.engine;
        match cmd {
            Command::InsertProfile { id, kind, timezone } => {
                require_operator(&actor, "manage profiles")?;
                engine.create_profile(id, kind, timezone).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::SetWeeklyHours { rows } => {
                require_operator(&actor, "set weekly hours")?;
                let count = rows.len();
                engine.set_weekdays(rows).await.map_err(engine_err)?;
                Ok(inserted(count))
            }
            Command::UpdatePreference {
                resource_id,
                preference,
            } => {
                require_operator(&actor, "change availability preference")?;
                engine
                    .set_preference(resource_id, preference)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertBlockedRange {
                id,
                resource_id,
                span,
                reason,
            } => {
                require_operator(&actor, "block time")?;
                engine
                    .add_blocked_range(id, resource_id, span, reason)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::DeleteBlockedRange { id } => {
                require_operator(&actor, "unblock time")?;
                engine.remove_blocked_range(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertProject { project } => {
                require_operator(&actor, "publish projects")?;
                engine.publish_project(project).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertBooking { booking } => {
                engine.create_booking(actor, booking).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertQuote { booking_id, quote } => {
                engine
                    .submit_quote(booking_id, actor, quote)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertQuoteResponse {
                booking_id,
                response,
            } => {
                engine
                    .respond_to_quote(booking_id, actor, response)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::ReopenRfq { booking_id } => {
                engine.reopen_rfq(booking_id, actor).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertTransition {
                booking_id,
                status,
                refund_cents,
            } => {
                engine
                    .update_status(booking_id, actor, status, refund_cents)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertConfirmation { booking_id, start } => {
                engine
                    .confirm_booking(booking_id, actor, start)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertPaymentCallback {
                booking_id,
                outcome,
            } => {
                engine
                    .payment_callback(booking_id, actor, outcome)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::RetryPayment { booking_id } => {
                engine.retry_payment(booking_id, actor).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertAnswers { booking_id, answers } => {
                let count = answers.len();
                engine
                    .submit_post_booking_answers(booking_id, actor, answers)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(count))
            }
            Command::SelectBooking { id } => {
                let booking = engine.get_booking(id).await.map_err(engine_err)?;
                require_party(&actor, &booking)?;
                let schema = Arc::new(booking_schema());
                let row = encode_booking(&schema, &booking);
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(vec![row]),
                ))])
            }
            Command::SelectPayment { booking_id } => {
                let booking = engine.get_booking(booking_id).await.map_err(engine_err)?;
                require_party(&actor, &booking)?;
                let payment = engine
                    .payment_for_booking(booking_id)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(payment_schema());
                let rows: Vec<_> = payment
                    .iter()
                    .map(|p| encode_payment(&schema, p))
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectProposals {
                project_id,
                subproject_index,
                viewer_tz,
            } => {
                let project = engine.get_project(project_id).map_err(engine_err)?;
                let company_tz = engine
                    .profile_snapshot(project.company_id)
                    .await
                    .map_err(engine_err)?
                    .timezone;
                let proposal = engine
                    .get_schedule_proposals(project_id, subproject_index)
                    .await
                    .map_err(engine_err)?;
                let labels = Labels {
                    company_tz,
                    viewer_tz: viewer_tz.unwrap_or(company_tz),
                    mode: proposal.mode(),
                };
                let schema = Arc::new(proposal_schema());
                let rows = encode_proposal(&schema, &proposal, &labels);
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectFreeSpans {
                resource_id,
                start,
                end,
            } => {
                let spans = engine
                    .free_spans(resource_id, Span::new(start, end))
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(free_spans_schema());
                let rid = resource_id.to_string();
                let rows: Vec<PgWireResult<_>> = spans
                    .into_iter()
                    .map(|span| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&rid)?;
                        encoder.encode_field(&span.start)?;
                        encoder.encode_field(&span.end)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
        }
    }
}

fn inserted(rows: usize) -> Vec<Response> {
    vec![Response::Execution(Tag::new("INSERT").with_rows(rows))]
}

/// Calendar, profile and project writes belong to professionals and admins.
fn require_operator(actor: &Actor, action: &str) -> PgWireResult<()> {
    match actor {
        Actor::Professional(_) | Actor::Admin => Ok(()),
        _ => Err(engine_err(EngineError::Forbidden {
            role: actor.role(),
            action: action.into(),
        })),
    }
}

/// Bookings are visible to their two parties, admins and the gateway.
fn require_party(actor: &Actor, booking: &Booking) -> PgWireResult<()> {
    let allowed = match actor {
        Actor::Customer(id) => *id == booking.customer_id,
        Actor::Professional(id) => *id == booking.professional_id,
        Actor::Admin | Actor::Gateway | Actor::System => true,
    };
    if allowed {
        Ok(())
    } else {
        Err(engine_err(EngineError::Forbidden {
            role: actor.role(),
            action: "read this booking".into(),
        }))
    }
}

// ── Result schemas ───────────────────────────────────────────────

fn text(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int8(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn booking_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("status"),
        text("booking_type"),
        text("customer_id"),
        text("professional_id"),
        text("project_id"),
        int8("subproject_index"),
        int8("quote_amount"),
        text("currency"),
        int8("requested_start"),
        int8("scheduled_start"),
        int8("scheduled_end"),
        text("assigned_resources"),
        text("payment_id"),
        int8("version"),
        int8("updated_at"),
    ]
}

fn payment_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("booking_id"),
        text("status"),
        int8("amount"),
        text("currency"),
        int8("refunded_amount"),
        int8("capture_attempts"),
        text("gateway_reference"),
    ]
}

fn proposal_schema() -> Vec<FieldInfo> {
    vec![
        text("kind"),
        text("mode"),
        int8("earliest_bookable"),
        int8("start"),
        int8("end"),
        int8("execution_end"),
        text("resources"),
        text("start_label"),
        text("end_label"),
    ]
}

fn free_spans_schema() -> Vec<FieldInfo> {
    vec![text("resource_id"), int8("start"), int8("end")]
}

/// Pick the result schema for a statement without executing it.
fn schema_for(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    if !upper.contains("SELECT") {
        return vec![];
    }
    if upper.contains("SCHEDULE_PROPOSALS") {
        proposal_schema()
    } else if upper.contains("FREE_SPANS") {
        free_spans_schema()
    } else if upper.contains("PAYMENTS") {
        payment_schema()
    } else if upper.contains("BOOKINGS") {
        booking_schema()
    } else {
        vec![]
    }
}

// ── Row encoding ─────────────────────────────────────────────────

fn join_ids(ids: &[ulid::Ulid]) -> String {
    ids.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(",")
}

fn encode_booking(
    schema: &Arc<Vec<FieldInfo>>,
    b: &Booking,
) -> PgWireResult<pgwire::messages::data::DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&b.id.to_string())?;
    encoder.encode_field(&b.status.as_str())?;
    encoder.encode_field(&match b.booking_type {
        BookingType::Professional => "professional",
        BookingType::Project => "project",
    })?;
    encoder.encode_field(&b.customer_id.to_string())?;
    encoder.encode_field(&b.professional_id.to_string())?;
    encoder.encode_field(&b.project_id.map(|id| id.to_string()))?;
    encoder.encode_field(&b.subproject_index.map(|i| i as i64))?;
    encoder.encode_field(&b.quote.as_ref().map(|q| q.amount_cents as i64))?;
    encoder.encode_field(&b.quote.as_ref().map(|q| q.currency.clone()))?;
    encoder.encode_field(&b.requested_start)?;
    encoder.encode_field(&b.scheduled.as_ref().map(|s| s.start))?;
    encoder.encode_field(&b.scheduled.as_ref().map(|s| s.end))?;
    encoder.encode_field(&join_ids(&b.assigned_resources))?;
    encoder.encode_field(&b.payment_id.map(|id| id.to_string()))?;
    encoder.encode_field(&(b.version as i64))?;
    encoder.encode_field(&b.updated_at)?;
    Ok(encoder.take_row())
}

fn encode_payment(
    schema: &Arc<Vec<FieldInfo>>,
    p: &Payment,
) -> PgWireResult<pgwire::messages::data::DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&p.id.to_string())?;
    encoder.encode_field(&p.booking_id.to_string())?;
    encoder.encode_field(&p.status.as_str())?;
    encoder.encode_field(&(p.amount_cents as i64))?;
    encoder.encode_field(&p.currency)?;
    encoder.encode_field(&(p.refunded_cents as i64))?;
    encoder.encode_field(&(p.capture_attempts as i64))?;
    encoder.encode_field(&p.gateway_reference)?;
    Ok(encoder.take_row())
}

struct Labels {
    company_tz: Tz,
    viewer_tz: Tz,
    mode: TimeMode,
}

impl Labels {
    fn label(&self, ms: Ms) -> String {
        timezone::project(ms, self.company_tz, self.viewer_tz, self.mode)
    }
}

fn encode_window(
    schema: &Arc<Vec<FieldInfo>>,
    kind: &str,
    earliest_bookable: Ms,
    w: &Window,
    labels: &Labels,
) -> PgWireResult<pgwire::messages::data::DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&kind)?;
    encoder.encode_field(&labels.mode.as_str())?;
    encoder.encode_field(&earliest_bookable)?;
    encoder.encode_field(&Some(w.start))?;
    encoder.encode_field(&Some(w.end))?;
    encoder.encode_field(&Some(w.execution_end))?;
    encoder.encode_field(&join_ids(&w.resources))?;
    encoder.encode_field(&Some(labels.label(w.start)))?;
    encoder.encode_field(&Some(labels.label(w.end)))?;
    Ok(encoder.take_row())
}

fn encode_proposal(
    schema: &Arc<Vec<FieldInfo>>,
    proposal: &Proposal,
    labels: &Labels,
) -> Vec<PgWireResult<pgwire::messages::data::DataRow>> {
    match proposal {
        Proposal::Available(p) => {
            let mut rows = vec![encode_window(
                schema,
                "earliest",
                p.earliest_bookable,
                &p.earliest,
                labels,
            )];
            if let Some(shortest) = &p.shortest_throughput {
                rows.push(encode_window(
                    schema,
                    "shortest_throughput",
                    p.earliest_bookable,
                    shortest,
                    labels,
                ));
            }
            rows
        }
        Proposal::NoAvailability {
            earliest_bookable,
            searched_until,
            ..
        } => vec![encode_no_availability(
            schema,
            *earliest_bookable,
            *searched_until,
            labels,
        )],
    }
}

fn encode_no_availability(
    schema: &Arc<Vec<FieldInfo>>,
    earliest_bookable: Ms,
    searched_until: Ms,
    labels: &Labels,
) -> PgWireResult<pgwire::messages::data::DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&"no_availability")?;
    encoder.encode_field(&labels.mode.as_str())?;
    encoder.encode_field(&earliest_bookable)?;
    encoder.encode_field(&None::<i64>)?;
    encoder.encode_field(&searched_until)?;
    encoder.encode_field(&None::<i64>)?;
    encoder.encode_field(&"")?;
    encoder.encode_field(&None::<String>)?;
    encoder.encode_field(&Some(labels.label(searched_until)))?;
    Ok(encoder.take_row())
}

#[async_trait]
impl SimpleQueryHandler for BookdHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let actor = self.resolve_actor(client)?;
        self.run(actor, query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct BookdQueryParser;

#[async_trait]
impl QueryParser for BookdQueryParser {
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
        Ok(schema_for(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for BookdHandler {
    type Statement = String;
    type QueryParser = BookdQueryParser;

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
        let actor = self.resolve_actor(client)?;
        let sql = substitute_params(portal);
        let mut responses = self.run(actor, &sql).await?;
        Ok(responses.remove(0))
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
            schema_for(&target.statement),
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
        Ok(DescribePortalResponse::new(schema_for(
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
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i > start
                && let Ok(n) = sql[start..i].parse::<usize>()
            {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
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

pub struct BookdFactory {
    handler: Arc<BookdHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<BookdAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl BookdFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        let auth_source = BookdAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(BookdHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for BookdFactory {
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
    let factory = BookdFactory::new(engine, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

/// SQLSTATE for an engine error.
pub fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Conflict { .. } => "40001",
        EngineError::Forbidden { .. } => "42501",
        EngineError::Validation { .. } | EngineError::LimitExceeded(_) => "22023",
        EngineError::NotFound(_) => "P0002",
        _ => "P0001",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    let mut message = e.to_string();
    if let EngineError::Conflict {
        fresh: Some(fresh), ..
    } = &e
        && let Some(w) = fresh.earliest()
    {
        message.push_str(&format!("; next available start {}", w.start));
    }
    debug!(code = sqlstate(&e), "{message}");
    user_error(sqlstate(&e), message)
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
