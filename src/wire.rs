use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldInfo,
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

use crate::auth::{AccessPolicy, SlotbookAuthSource};
use crate::engine::{BookingRequest, Engine, EngineError, ErrorKind, Removal, today};
use crate::limits::MAX_RESULT_ROWS;
use crate::model::*;
use crate::observability;
use crate::sql::{self, BookingFilter, Command, SlotLength, SqlError};

// ── Result tables ────────────────────────────────────────────────

#[derive(Clone, Copy)]
enum Col {
    Text,
    Int4,
    Int8,
    Float8,
    Bool,
}

impl Col {
    fn pg_type(self) -> Type {
        match self {
            Col::Text => Type::VARCHAR,
            Col::Int4 => Type::INT4,
            Col::Int8 => Type::INT8,
            Col::Float8 => Type::FLOAT8,
            Col::Bool => Type::BOOL,
        }
    }
}

const AVAILABILITY_COLUMNS: &[(&str, Col)] = &[("available", Col::Bool), ("reason", Col::Text)];

const SLOT_COLUMNS: &[(&str, Col)] = &[("time", Col::Text)];

const SCHEDULE_COLUMNS: &[(&str, Col)] = &[
    ("master_id", Col::Text),
    ("day_of_week", Col::Int4),
    ("start_time", Col::Text),
    ("end_time", Col::Text),
    ("is_available", Col::Bool),
];

const SERVICE_COLUMNS: &[(&str, Col)] = &[
    ("id", Col::Text),
    ("title", Col::Text),
    ("description", Col::Text),
    ("duration", Col::Int8),
    ("price", Col::Int8),
    ("is_active", Col::Bool),
    ("category_id", Col::Text),
];

const MASTER_COLUMNS: &[(&str, Col)] = &[
    ("id", Col::Text),
    ("name", Col::Text),
    ("bio", Col::Text),
    ("experience_years", Col::Int4),
    ("rating", Col::Float8),
    ("is_active", Col::Bool),
];

const BOOKING_COLUMNS: &[(&str, Col)] = &[
    ("id", Col::Text),
    ("user_id", Col::Text),
    ("service_id", Col::Text),
    ("master_id", Col::Text),
    ("date", Col::Text),
    ("time", Col::Text),
    ("status", Col::Text),
    ("admin_comment", Col::Text),
    ("created_at", Col::Int8),
    ("updated_at", Col::Int8),
];

const STATUS_CHANGE_COLUMNS: &[(&str, Col)] = &[
    ("booking_id", Col::Text),
    ("old_status", Col::Text),
    ("new_status", Col::Text),
    ("actor_id", Col::Text),
    ("comment", Col::Text),
    ("changed_at", Col::Int8),
];

const BOOKING_STATS_COLUMNS: &[(&str, Col)] = &[
    ("total", Col::Int8),
    ("pending", Col::Int8),
    ("confirmed", Col::Int8),
    ("rejected", Col::Int8),
    ("completed", Col::Int8),
    ("cancelled", Col::Int8),
    ("active", Col::Int8),
];

const ADMIN_STATS_COLUMNS: &[(&str, Col)] = &[
    ("today_bookings", Col::Int8),
    ("pending_bookings", Col::Int8),
    ("confirmed_bookings", Col::Int8),
    ("completed_bookings", Col::Int8),
    ("total_revenue", Col::Int8),
];

fn table_columns(table: &str) -> &'static [(&'static str, Col)] {
    match table {
        "availability" => AVAILABILITY_COLUMNS,
        "slots" => SLOT_COLUMNS,
        "schedules" => SCHEDULE_COLUMNS,
        "services" | "master_services" => SERVICE_COLUMNS,
        "masters" => MASTER_COLUMNS,
        "bookings" => BOOKING_COLUMNS,
        "status_changes" => STATUS_CHANGE_COLUMNS,
        "booking_stats" => BOOKING_STATS_COLUMNS,
        "admin_stats" => ADMIN_STATS_COLUMNS,
        _ => &[],
    }
}

fn fields(columns: &[(&str, Col)], format: &Format) -> Vec<FieldInfo> {
    columns
        .iter()
        .enumerate()
        .map(|(i, (name, col))| {
            FieldInfo::new((*name).into(), None, None, col.pg_type(), format.format_for(i))
        })
        .collect()
}

fn schema(columns: &[(&str, Col)], format: &Format) -> Arc<Vec<FieldInfo>> {
    Arc::new(fields(columns, format))
}

/// Result schema of a SELECT, for Describe. Empty for anything else.
fn describe_schema(sql: &str, format: &Format) -> Vec<FieldInfo> {
    match sql::select_table(sql) {
        Some(table) => fields(table_columns(&table), format),
        None => Vec::new(),
    }
}

fn query_response<T>(
    schema: Arc<Vec<FieldInfo>>,
    items: &[T],
    encode: impl Fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> Response {
    let rows: Vec<PgWireResult<_>> = items
        .iter()
        .take(MAX_RESULT_ROWS)
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn opt_id(id: Option<ulid::Ulid>) -> Option<String> {
    id.map(|id| id.to_string())
}

fn encode_service(encoder: &mut DataRowEncoder, s: &Service) -> PgWireResult<()> {
    encoder.encode_field(&s.id.to_string())?;
    encoder.encode_field(&s.title)?;
    encoder.encode_field(&s.description)?;
    encoder.encode_field(&i64::from(s.duration_minutes))?;
    encoder.encode_field(&s.price)?;
    encoder.encode_field(&s.is_active)?;
    encoder.encode_field(&opt_id(s.category_id))
}

fn encode_master(encoder: &mut DataRowEncoder, m: &Master) -> PgWireResult<()> {
    encoder.encode_field(&m.id.to_string())?;
    encoder.encode_field(&m.name)?;
    encoder.encode_field(&m.bio)?;
    encoder.encode_field(&i32::from(m.experience_years))?;
    encoder.encode_field(&m.rating)?;
    encoder.encode_field(&m.is_active)
}

fn encode_booking(encoder: &mut DataRowEncoder, b: &Booking) -> PgWireResult<()> {
    encoder.encode_field(&b.id.to_string())?;
    encoder.encode_field(&b.user_id.to_string())?;
    encoder.encode_field(&b.service_id.to_string())?;
    encoder.encode_field(&opt_id(b.master_id))?;
    encoder.encode_field(&b.date.to_string())?;
    encoder.encode_field(&b.time.to_string())?;
    encoder.encode_field(&b.status.as_str().to_string())?;
    encoder.encode_field(&b.admin_comment)?;
    encoder.encode_field(&b.created_at)?;
    encoder.encode_field(&b.updated_at)
}

fn encode_status_change(encoder: &mut DataRowEncoder, c: &StatusChange) -> PgWireResult<()> {
    encoder.encode_field(&c.booking_id.to_string())?;
    encoder.encode_field(&c.from.as_str().to_string())?;
    encoder.encode_field(&c.to.as_str().to_string())?;
    encoder.encode_field(&c.actor_id.to_string())?;
    encoder.encode_field(&c.comment)?;
    encoder.encode_field(&c.at)
}

fn encode_counts(encoder: &mut DataRowEncoder, counts: &[i64]) -> PgWireResult<()> {
    for n in counts {
        encoder.encode_field(n)?;
    }
    Ok(())
}

fn count(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

// ── Handler ──────────────────────────────────────────────────────

pub struct SlotbookHandler {
    engine: Arc<Engine>,
    policy: Arc<AccessPolicy>,
    query_parser: Arc<SlotbookQueryParser>,
}

impl SlotbookHandler {
    pub fn new(engine: Arc<Engine>, policy: Arc<AccessPolicy>) -> Self {
        Self {
            engine,
            policy,
            query_parser: Arc::new(SlotbookQueryParser),
        }
    }

    fn resolve_actor<C: ClientInfo>(&self, client: &C) -> PgWireResult<Actor> {
        let user = client.metadata().get("user").map(String::as_str).unwrap_or_default();
        self.policy.resolve_actor(user)
    }

    /// Parse, run and meter one statement.
    async fn run_sql<C: ClientInfo>(
        &self,
        client: &C,
        query: &str,
        format: &Format,
    ) -> PgWireResult<Response> {
        let actor = self.resolve_actor(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);

        let start = Instant::now();
        let result = self.execute_command(&actor, cmd, format).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        if let Err(e) = &result {
            debug!(actor_id = %actor.id, "{label} failed: {e}");
        }
        result
    }

    async fn execute_command(
        &self,
        actor: &Actor,
        cmd: Command,
        format: &Format,
    ) -> PgWireResult<Response> {
        let engine = self.engine.as_ref();
        match cmd {
            Command::UpsertService {
                id,
                title,
                duration_minutes,
                price,
                is_active,
                description,
                category_id,
            } => {
                require_admin(actor)?;
                let service = Service {
                    id,
                    title,
                    description,
                    price,
                    duration_minutes,
                    is_active,
                    category_id,
                };
                engine.save_service(service).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteService { id } => {
                require_admin(actor)?;
                engine.delete_service(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::UpsertMaster {
                id,
                name,
                bio,
                experience_years,
                is_active,
                rating,
            } => {
                require_admin(actor)?;
                let master = Master {
                    id,
                    name,
                    bio,
                    experience_years,
                    rating: 0.0,
                    is_active,
                };
                engine
                    .save_master(master, rating)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteMaster { id } => {
                require_admin(actor)?;
                engine.delete_master(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::LinkMasterService {
                master_id,
                service_id,
            } => {
                require_admin(actor)?;
                let linked = engine
                    .link_master_service(master_id, service_id)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(usize::from(linked))))
            }
            Command::UnlinkMasterService {
                master_id,
                service_id,
            } => {
                require_admin(actor)?;
                let unlinked = engine
                    .unlink_master_service(master_id, service_id)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(usize::from(unlinked))))
            }
            Command::ReplaceSchedule { master_id, entries } => {
                require_admin(actor)?;
                let week = engine
                    .replace_master_schedule(master_id, entries)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(week.len())))
            }
            Command::ClearSchedule { master_id } => {
                require_admin(actor)?;
                let before = engine
                    .get_master_schedule(master_id)
                    .await
                    .map_err(engine_err)?
                    .len();
                engine
                    .replace_master_schedule(master_id, Vec::new())
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(before)))
            }
            Command::InsertBooking {
                id,
                service_id,
                master_id,
                date,
                time,
            } => {
                engine
                    .create_booking(BookingRequest {
                        id,
                        user_id: actor.id,
                        service_id,
                        master_id,
                        date,
                        time,
                    })
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::InsertStatusChange {
                booking_id,
                status,
                comment,
            } => {
                engine
                    .transition_status(booking_id, status, comment, actor)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteBooking { id } => {
                let tag = match engine.delete_booking(id, actor).await.map_err(engine_err)? {
                    Removal::Deleted => Tag::new("DELETE"),
                    Removal::Cancelled(_) => Tag::new("UPDATE"),
                };
                Ok(Response::Execution(tag.with_rows(1)))
            }
            Command::SelectAvailability {
                master_id,
                date,
                time,
            } => {
                let availability = engine
                    .check_availability(master_id, date, time)
                    .await
                    .map_err(engine_err)?;
                Ok(query_response(
                    schema(AVAILABILITY_COLUMNS, format),
                    &[availability],
                    |encoder, a| {
                        encoder.encode_field(&a.is_available())?;
                        encoder.encode_field(&a.reason().map(|r| r.to_string()))
                    },
                ))
            }
            Command::SelectSlots {
                master_id,
                date,
                length,
            } => {
                let slots = match length {
                    SlotLength::Minutes(minutes) => {
                        engine.list_available_slots(master_id, date, minutes).await
                    }
                    SlotLength::Service(service_id) => {
                        engine.list_slots_for_service(master_id, date, service_id).await
                    }
                }
                .map_err(engine_err)?;
                Ok(query_response(schema(SLOT_COLUMNS, format), &slots, |encoder, t| {
                    encoder.encode_field(&t.to_string())
                }))
            }
            Command::SelectSchedule { master_id } => {
                let week = engine
                    .get_master_schedule(master_id)
                    .await
                    .map_err(engine_err)?;
                let master = master_id.to_string();
                Ok(query_response(schema(SCHEDULE_COLUMNS, format), &week, |encoder, e| {
                    encoder.encode_field(&master)?;
                    encoder.encode_field(&i32::from(e.day_of_week))?;
                    encoder.encode_field(&e.start.to_string())?;
                    encoder.encode_field(&e.end.to_string())?;
                    encoder.encode_field(&e.is_available)
                }))
            }
            Command::SelectServices => {
                let services = engine.list_services(!actor.is_admin());
                Ok(query_response(schema(SERVICE_COLUMNS, format), &services, encode_service))
            }
            Command::SelectMasters { service_id } => {
                let masters = engine.list_masters(!actor.is_admin(), service_id).await;
                Ok(query_response(schema(MASTER_COLUMNS, format), &masters, encode_master))
            }
            Command::SelectMasterServices { master_id } => {
                let services = engine
                    .get_master_services(master_id)
                    .await
                    .map_err(engine_err)?;
                Ok(query_response(schema(SERVICE_COLUMNS, format), &services, encode_service))
            }
            Command::SelectBookings { filter } => {
                let bookings = self.visible_bookings(actor, filter).await?;
                Ok(query_response(schema(BOOKING_COLUMNS, format), &bookings, encode_booking))
            }
            Command::SelectStatusChanges { booking_id } => {
                // Admins can still read the history of a hard-deleted booking.
                let history = if actor.is_admin() {
                    engine.booking_history(booking_id)
                } else {
                    engine
                        .booking_details(booking_id, actor)
                        .await
                        .map_err(engine_err)?
                        .history
                };
                Ok(query_response(
                    schema(STATUS_CHANGE_COLUMNS, format),
                    &history,
                    encode_status_change,
                ))
            }
            Command::SelectBookingStats { user_id } => {
                let user_id = user_id.unwrap_or(actor.id);
                if user_id != actor.id && !actor.is_admin() {
                    return Err(engine_err(EngineError::Forbidden(
                        "statistics of another user",
                    )));
                }
                let s = engine.user_booking_stats(user_id).await;
                let counts = [
                    count(s.total),
                    count(s.pending),
                    count(s.confirmed),
                    count(s.rejected),
                    count(s.completed),
                    count(s.cancelled),
                    count(s.active),
                ];
                Ok(query_response(
                    schema(BOOKING_STATS_COLUMNS, format),
                    &[counts],
                    |encoder, c| encode_counts(encoder, c),
                ))
            }
            Command::SelectAdminStats => {
                require_admin(actor)?;
                let s = engine.admin_stats(today()).await;
                let counts = [
                    count(s.today_bookings),
                    count(s.pending_bookings),
                    count(s.confirmed_bookings),
                    count(s.completed_bookings),
                    s.total_revenue,
                ];
                Ok(query_response(
                    schema(ADMIN_STATS_COLUMNS, format),
                    &[counts],
                    |encoder, c| encode_counts(encoder, c),
                ))
            }
        }
    }

    /// Admins see every booking; customers only their own.
    async fn visible_bookings(
        &self,
        actor: &Actor,
        filter: BookingFilter,
    ) -> PgWireResult<Vec<Booking>> {
        let engine = self.engine.as_ref();
        if let BookingFilter::Id(id) = filter {
            let details = engine.booking_details(id, actor).await.map_err(engine_err)?;
            return Ok(vec![details.booking]);
        }
        if actor.is_admin() {
            return Ok(match filter {
                BookingFilter::Status(status) => engine.all_bookings(Some(status)).await,
                BookingFilter::Date(date) => engine.bookings_on(date).await,
                BookingFilter::All | BookingFilter::Id(_) => engine.all_bookings(None).await,
            });
        }
        let mut own = engine.user_bookings(actor.id).await;
        match filter {
            BookingFilter::Status(status) => own.retain(|b| b.status == status),
            BookingFilter::Date(date) => {
                own.retain(|b| b.date == date);
                own.sort_by_key(|b| (b.time, b.id));
            }
            BookingFilter::All | BookingFilter::Id(_) => {}
        }
        Ok(own)
    }
}

#[async_trait]
impl SimpleQueryHandler for SlotbookHandler {
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
        let response = self.run_sql(&*client, query, &Format::UnifiedText).await?;
        Ok(vec![response])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotbookQueryParser;

#[async_trait]
impl QueryParser for SlotbookQueryParser {
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
        column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(describe_schema(stmt, column_format.unwrap_or(&Format::UnifiedText)))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SlotbookHandler {
    type Statement = String;
    type QueryParser = SlotbookQueryParser;

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
        self.run_sql(&*client, &sql, &portal.result_column_format)
            .await
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
            describe_schema(&target.statement, &Format::UnifiedText),
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
        Ok(DescribePortalResponse::new(describe_schema(
            &target.statement.statement,
            &target.result_column_format,
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
            if let Ok(n) = sql[start..i].parse::<usize>() {
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
    let params: Vec<Option<&[u8]>> = portal.parameters.iter().map(|p| p.as_deref()).collect();
    bind_params(&portal.statement.statement, &params)
}

/// One left-to-right pass over `sql`. Bound values are quoted and never
/// rescanned; `$N` inside a quoted literal or identifier is left alone, and so
/// is a `$N` with no bound value.
fn bind_params(sql: &str, params: &[Option<&[u8]>]) -> String {
    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len());
    let mut quote: Option<u8> = None;
    let mut copied = 0;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) => {
                if b == q {
                    quote = None;
                }
                i += 1;
            }
            None if b == b'\'' || b == b'"' => {
                quote = Some(b);
                i += 1;
            }
            None if b == b'$' => {
                let digits_start = i + 1;
                let mut j = digits_start;
                while j < bytes.len() && bytes[j].is_ascii_digit() {
                    j += 1;
                }
                let bound = sql[digits_start..j]
                    .parse::<usize>()
                    .ok()
                    .and_then(|n| n.checked_sub(1))
                    .and_then(|idx| params.get(idx));
                match bound {
                    Some(param) => {
                        out.push_str(&sql[copied..i]);
                        match param {
                            Some(value) => {
                                let text = String::from_utf8_lossy(value);
                                out.push('\'');
                                out.push_str(&text.replace('\'', "''"));
                                out.push('\'');
                            }
                            None => out.push_str("NULL"),
                        }
                        copied = j;
                        i = j;
                    }
                    None => i += 1,
                }
            }
            None => i += 1,
        }
    }
    out.push_str(&sql[copied..]);
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotbookFactory {
    handler: Arc<SlotbookHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<SlotbookAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SlotbookFactory {
    pub fn new(engine: Arc<Engine>, policy: Arc<AccessPolicy>) -> Self {
        let auth_source = SlotbookAuthSource::new(policy.clone());
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SlotbookHandler::new(engine, policy)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotbookFactory {
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
    policy: Arc<AccessPolicy>,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = SlotbookFactory::new(engine, policy);
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

/// SQLSTATE for each engine error class.
fn sqlstate(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Validation => "22023",
        ErrorKind::NotFound => "P0002",
        ErrorKind::Conflict => "23505",
        ErrorKind::Forbidden => "42501",
        ErrorKind::Storage => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(e.kind()), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = match e {
        SqlError::BadLiteral(_) => "22007",
        _ => "42601",
    };
    user_error(code, e.to_string())
}

fn require_admin(actor: &Actor) -> PgWireResult<()> {
    if actor.is_admin() {
        Ok(())
    } else {
        Err(engine_err(EngineError::Forbidden("admin only")))
    }
}
