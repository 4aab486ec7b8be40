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
use tracing::debug;

use crate::auth::AgendaAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, SqlError};
use crate::tenant::TenantManager;

pub struct AgendaHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<AgendaQueryParser>,
}

impl AgendaHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(AgendaQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "3D000".into(),
                format!("tenant error: {e}"),
            )))
        })
    }

    async fn run(&self, engine: &Engine, sql: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = command_label(&cmd);
        debug!("{}: {label}", engine.slug);

        let started = Instant::now();
        let result = self.execute_command(engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Response> {
        match cmd {
            Command::SelectTenant => {
                let info = engine.tenant_info().await;
                rows(tenant_schema(), [info], |enc, info| {
                    enc.encode_field(&info.slug)?;
                    enc.encode_field(&info.settings.display_name)?;
                    enc.encode_field(&i32_of(info.settings.slot_minutes))?;
                    enc.encode_field(&i32_of(info.settings.lead_minutes))?;
                    enc.encode_field(&(info.offering_count as i64))?;
                    enc.encode_field(&(info.professional_count as i64))
                })
            }
            Command::UpdateSettings {
                display_name,
                slot_minutes,
                lead_minutes,
            } => {
                engine
                    .update_settings(display_name, slot_minutes, lead_minutes)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted())
            }
            Command::SetWeeklyHours { professional_id, hours } => {
                engine
                    .set_weekly_hours(professional_id, hours)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted())
            }
            Command::SelectWeeklyHours { professional_id } => {
                let week = engine.weekly_hours(professional_id).await;
                rows(weekly_hours_schema(), week, |enc, entry| {
                    enc.encode_field(&entry.professional_id.map(|id| id.to_string()))?;
                    enc.encode_field(&entry.hours.weekday.to_string().to_lowercase())?;
                    enc.encode_field(&entry.hours.start.format("%H:%M").to_string())?;
                    enc.encode_field(&entry.hours.end.format("%H:%M").to_string())?;
                    enc.encode_field(&entry.hours.day_off)
                })
            }
            Command::SetLunchBreak { lunch } => {
                engine.set_lunch_break(lunch).await.map_err(engine_err)?;
                Ok(inserted())
            }
            Command::SelectLunchBreak => {
                let lunch = engine.lunch_break().await;
                rows(lunch_schema(), [lunch], |enc, lunch| {
                    enc.encode_field(&lunch.active)?;
                    enc.encode_field(&lunch.start.format("%H:%M").to_string())?;
                    enc.encode_field(&lunch.end.format("%H:%M").to_string())
                })
            }
            Command::UpsertSpecialDay { day } => {
                engine.upsert_special_day(day).await.map_err(engine_err)?;
                Ok(inserted())
            }
            Command::DeleteSpecialDay { id } => {
                engine.remove_special_day(id).await.map_err(engine_err)?;
                Ok(deleted())
            }
            Command::SelectSpecialDays => {
                let days = engine.special_days().await;
                rows(special_days_schema(), days, |enc, day| {
                    enc.encode_field(&day.id.to_string())?;
                    enc.encode_field(&day.date.to_string())?;
                    enc.encode_field(&day.day_off)?;
                    enc.encode_field(&day.start.map(|t| t.format("%H:%M").to_string()))?;
                    enc.encode_field(&day.end.map(|t| t.format("%H:%M").to_string()))
                })
            }
            Command::SaveOffering { offering } => {
                engine.save_offering(offering).await.map_err(engine_err)?;
                Ok(inserted())
            }
            Command::DeleteOffering { id } => {
                engine.remove_offering(id).await.map_err(engine_err)?;
                Ok(deleted())
            }
            Command::SelectOfferings { professional_id } => {
                let offerings = engine.offerings(professional_id).await.map_err(engine_err)?;
                rows(offerings_schema(), offerings, |enc, offering| {
                    enc.encode_field(&offering.id.to_string())?;
                    enc.encode_field(&offering.name)?;
                    enc.encode_field(&i32_of(offering.minutes))?;
                    enc.encode_field(&offering.price_cents)
                })
            }
            Command::SaveProfessional { professional } => {
                engine.save_professional(professional).await.map_err(engine_err)?;
                Ok(inserted())
            }
            Command::DeleteProfessional { id } => {
                engine.remove_professional(id).await.map_err(engine_err)?;
                Ok(deleted())
            }
            Command::SelectProfessionals { agenda_only } => {
                let professionals = engine.professionals(agenda_only).await;
                rows(professionals_schema(), professionals, |enc, p| {
                    enc.encode_field(&p.id.to_string())?;
                    enc.encode_field(&p.name)?;
                    enc.encode_field(&p.login)?;
                    enc.encode_field(&p.show_in_agenda)?;
                    enc.encode_field(&join_ids(&p.excluded_offering_ids))
                })
            }
            Command::SelectSlots {
                date,
                lines,
                professional_id,
            } => {
                let slots = engine
                    .available_slots(date, &lines, professional_id)
                    .await
                    .map_err(engine_err)?;
                rows(slots_schema(), slots, |enc, slot| {
                    enc.encode_field(&format_datetime(slot.start))?;
                    enc.encode_field(&slot.label)
                })
            }
            Command::InsertAppointment { appointment } => {
                engine.commit_booking(appointment).await.map_err(engine_err)?;
                Ok(inserted())
            }
            Command::SelectAppointments { date, professional_id } => {
                let appointments = engine.appointments(date, professional_id).await;
                rows(appointments_schema(), appointments, encode_appointment)
            }
            Command::CompleteAppointment {
                id,
                payment_method,
                lines,
            } => {
                let completion = engine
                    .complete_appointment(id, lines, payment_method)
                    .await
                    .map_err(engine_err)?;
                rows(completions_schema(), [completion], |enc, c| {
                    enc.encode_field(&c.appointment.id.to_string())?;
                    enc.encode_field(&c.appointment.status.as_str())?;
                    enc.encode_field(&c.appointment.payment_method.map(|m| m.as_str()))?;
                    enc.encode_field(&c.appointment.price_cents())?;
                    enc.encode_field(&c.credit.map(|credit| credit.id.to_string()))?;
                    enc.encode_field(&c.credit_error)
                })
            }
            Command::CancelAppointment { id } => {
                engine.cancel_appointment(id).await.map_err(engine_err)?;
                Ok(inserted())
            }
            Command::RescheduleAppointment { id, start } => {
                engine
                    .reschedule_appointment(id, start)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted())
            }
            Command::DeleteAppointment { id } => {
                engine.delete_appointment(id).await.map_err(engine_err)?;
                Ok(deleted())
            }
            Command::InsertCredit { credit } => {
                engine.open_credit(credit).await.map_err(engine_err)?;
                Ok(inserted())
            }
            Command::DeleteCredit { id } => {
                engine.delete_credit(id).await.map_err(engine_err)?;
                Ok(deleted())
            }
            Command::SelectCredits { pending_only } => {
                let credits = engine.list_credits(pending_only).await;
                rows(credits_schema(), credits, |enc, credit| {
                    enc.encode_field(&credit.id.to_string())?;
                    enc.encode_field(&credit.client_name)?;
                    enc.encode_field(&credit.phone)?;
                    enc.encode_field(&credit.appointment_id.map(|id| id.to_string()))?;
                    enc.encode_field(&credit.description)?;
                    enc.encode_field(&credit.original_cents)?;
                    enc.encode_field(&credit.remaining_cents)?;
                    enc.encode_field(&(credit.payments.len() as i64))?;
                    enc.encode_field(&format_datetime(credit.created_at))
                })
            }
            Command::InsertCreditPayment {
                id,
                credit_id,
                amount_cents,
                method,
            } => {
                engine
                    .add_credit_payment(id, credit_id, amount_cents, method)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted())
            }
        }
    }
}

fn inserted() -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(1))
}

fn deleted() -> Response {
    Response::Execution(Tag::new("DELETE").with_rows(1))
}

/// Encode `items` as a row set against `schema`.
fn rows<T>(
    schema: Vec<FieldInfo>,
    items: impl IntoIterator<Item = T>,
    encode: impl Fn(&mut DataRowEncoder, T) -> PgWireResult<()>,
) -> PgWireResult<Response> {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<_>> = items
        .into_iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn encode_appointment(enc: &mut DataRowEncoder, appointment: Appointment) -> PgWireResult<()> {
    let services: Vec<&str> = appointment
        .lines
        .iter()
        .flat_map(|l| l.offerings.iter().map(|o| o.name.as_str()))
        .collect();
    let pets: Vec<&str> = appointment
        .lines
        .iter()
        .filter_map(|l| l.pet.as_ref().map(|p| p.name.as_str()))
        .collect();
    enc.encode_field(&appointment.id.to_string())?;
    enc.encode_field(&appointment.professional_id.map(|id| id.to_string()))?;
    enc.encode_field(&appointment.client_name)?;
    enc.encode_field(&appointment.phone)?;
    enc.encode_field(&format_datetime(appointment.start))?;
    enc.encode_field(&format_datetime(appointment.span().end))?;
    enc.encode_field(&i32_of(appointment.minutes))?;
    enc.encode_field(&appointment.status.as_str())?;
    enc.encode_field(&appointment.payment_method.map(|m| m.as_str()))?;
    enc.encode_field(&appointment.price_cents())?;
    enc.encode_field(&services.join(", "))?;
    enc.encode_field(&(!pets.is_empty()).then(|| pets.join(", ")))?;
    enc.encode_field(&appointment.credit_id.map(|id| id.to_string()))
}

fn format_datetime(ms: Ms) -> String {
    ms_datetime(ms)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ms.to_string())
}

fn join_ids(ids: &[ulid::Ulid]) -> String {
    ids.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(",")
}

fn i32_of(v: u32) -> i32 {
    i32::try_from(v).unwrap_or(i32::MAX)
}

// ── Result schemas ───────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn tenant_schema() -> Vec<FieldInfo> {
    vec![
        field("slug", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("slot_minutes", Type::INT4),
        field("lead_minutes", Type::INT4),
        field("offerings", Type::INT8),
        field("professionals", Type::INT8),
    ]
}

fn weekly_hours_schema() -> Vec<FieldInfo> {
    vec![
        field("professional_id", Type::VARCHAR),
        field("day", Type::VARCHAR),
        field("start", Type::VARCHAR),
        field("end", Type::VARCHAR),
        field("day_off", Type::BOOL),
    ]
}

fn lunch_schema() -> Vec<FieldInfo> {
    vec![
        field("active", Type::BOOL),
        field("start", Type::VARCHAR),
        field("end", Type::VARCHAR),
    ]
}

fn special_days_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("date", Type::VARCHAR),
        field("day_off", Type::BOOL),
        field("start", Type::VARCHAR),
        field("end", Type::VARCHAR),
    ]
}

fn offerings_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("minutes", Type::INT4),
        field("price_cents", Type::INT8),
    ]
}

fn professionals_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("login", Type::VARCHAR),
        field("show_in_agenda", Type::BOOL),
        field("excluded", Type::VARCHAR),
    ]
}

fn slots_schema() -> Vec<FieldInfo> {
    vec![field("start", Type::VARCHAR), field("label", Type::VARCHAR)]
}

fn appointments_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("professional_id", Type::VARCHAR),
        field("client_name", Type::VARCHAR),
        field("phone", Type::VARCHAR),
        field("start", Type::VARCHAR),
        field("end", Type::VARCHAR),
        field("minutes", Type::INT4),
        field("status", Type::VARCHAR),
        field("payment_method", Type::VARCHAR),
        field("price_cents", Type::INT8),
        field("services", Type::VARCHAR),
        field("pets", Type::VARCHAR),
        field("credit_id", Type::VARCHAR),
    ]
}

fn completions_schema() -> Vec<FieldInfo> {
    vec![
        field("appointment_id", Type::VARCHAR),
        field("status", Type::VARCHAR),
        field("payment_method", Type::VARCHAR),
        field("price_cents", Type::INT8),
        field("credit_id", Type::VARCHAR),
        field("credit_error", Type::VARCHAR),
    ]
}

fn credits_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("client_name", Type::VARCHAR),
        field("phone", Type::VARCHAR),
        field("appointment_id", Type::VARCHAR),
        field("description", Type::VARCHAR),
        field("original_cents", Type::INT8),
        field("remaining_cents", Type::INT8),
        field("payments", Type::INT8),
        field("created_at", Type::VARCHAR),
    ]
}

/// Columns a statement returns; empty for commands that only report a tag.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    match sql::result_table(sql).as_deref() {
        Some("tenant") => tenant_schema(),
        Some("weekly_hours") => weekly_hours_schema(),
        Some("lunch_break") => lunch_schema(),
        Some("special_days") => special_days_schema(),
        Some("offerings") => offerings_schema(),
        Some("professionals") => professionals_schema(),
        Some("slots") => slots_schema(),
        Some("appointments") => appointments_schema(),
        Some("completions") => completions_schema(),
        Some("credits") => credits_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for AgendaHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        Ok(vec![self.run(&engine, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct AgendaQueryParser;

#[async_trait]
impl QueryParser for AgendaQueryParser {
    type Statement = String;

    async fn parse_sql<C>(&self, _client: &C, sql: &str, _types: &[Option<Type>]) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(&self, stmt: &String, _column_format: Option<&Format>) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for AgendaHandler {
    type Statement = String;
    type QueryParser = AgendaQueryParser;

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
        let engine = self.resolve_engine(client)?;
        let sql = substitute_params(portal);
        self.run(&engine, &sql).await
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
        Ok(DescribeStatementResponse::new(param_types, result_schema(&target.statement)))
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
        Ok(DescribePortalResponse::new(result_schema(&target.statement.statement)))
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
    let params: Vec<Option<String>> = portal
        .parameters
        .iter()
        .map(|p| p.as_ref().map(|bytes| String::from_utf8_lossy(bytes).into_owned()))
        .collect();
    substitute(&portal.statement.statement, &params)
}

/// One pass over the statement text: each `$N` is replaced as it is read, so
/// bound values are never scanned for placeholders themselves.
fn substitute(sql: &str, params: &[Option<String>]) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut rest = sql;
    while let Some(pos) = rest.find('$') {
        result.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let digits = after.bytes().take_while(u8::is_ascii_digit).count();
        let param = after[..digits]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|i| params.get(i));
        match param {
            Some(Some(text)) => {
                result.push('\'');
                result.push_str(&text.replace('\'', "''"));
                result.push('\'');
            }
            Some(None) => result.push_str("NULL"),
            None => result.push_str(&rest[pos..pos + 1 + digits]),
        }
        rest = &after[digits..];
    }
    result.push_str(rest);
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct AgendaFactory {
    handler: Arc<AgendaHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<AgendaAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl AgendaFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = AgendaAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(AgendaHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(auth_source, param_provider)),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for AgendaFactory {
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
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(AgendaFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        e.sqlstate().into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        e.sqlstate().into(),
        e.to_string(),
    )))
}
