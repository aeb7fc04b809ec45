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
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::messages::data::DataRow;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::{PtAuthSource, caller_from_login};
use crate::directory::InMemoryDirectory;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, SqlError};

pub struct PtHandler {
    engine: Arc<Engine>,
    directory: Arc<InMemoryDirectory>,
    query_parser: Arc<PtQueryParser>,
}

impl PtHandler {
    pub fn new(engine: Arc<Engine>, directory: Arc<InMemoryDirectory>) -> Self {
        Self {
            engine,
            directory,
            query_parser: Arc::new(PtQueryParser),
        }
    }

    fn resolve_caller<C: ClientInfo>(&self, client: &C) -> PgWireResult<Caller> {
        let user = client.metadata().get("user").cloned().unwrap_or_default();
        caller_from_login(&user).ok_or_else(|| {
            metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "28000".into(),
                format!("unknown role {user:?} (expected admin, trainer:<name> or member:<id>)"),
            )))
        })
    }

    /// Parse, run and time one statement.
    async fn run(&self, caller: &Caller, sql: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(caller, cmd).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result
    }

    async fn execute_command(&self, caller: &Caller, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertMember { id, display_name } => {
                if !matches!(caller, Caller::Admin) {
                    return Err(engine_err(EngineError::Forbidden("member registration is admin only")));
                }
                if id.trim().is_empty() {
                    return Err(engine_err(EngineError::InvalidParty("member id is empty")));
                }
                self.directory.register(&id, display_name.as_deref());
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::SaveAvailabilityTemplate { template } => {
                engine
                    .save_availability_template(caller, template)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteAvailabilityTemplate { id } => {
                engine
                    .remove_availability_template(caller, id)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertUnavailabilityTemplate { template } => {
                engine
                    .create_unavailability_template(caller, template)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteUnavailabilityTemplate { id } => {
                engine
                    .remove_unavailability_template(caller, id)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertSessionProduct { product } => {
                engine
                    .create_session_product(caller, product)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteSessionProduct { id } => {
                engine
                    .remove_session_product(caller, id)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::ClaimClassCell { date, time } => {
                let claimed = engine
                    .claim_class_cell(caller, date, time)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(usize::from(claimed))))
            }
            Command::ReleaseClassCell { date, time } => {
                let released = engine
                    .release_class_cell(caller, date, time)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(usize::from(released))))
            }
            Command::InsertBooking { request } => {
                let id = request.id();
                let row = match engine.commit_booking(caller, request).await {
                    Ok(receipt) => BookingRow {
                        booking_id: receipt.booking_id,
                        ok: true,
                        reason: None,
                        balance: receipt.balance,
                    },
                    Err(e @ EngineError::WalError(_)) => return Err(engine_err(e)),
                    Err(e) => BookingRow {
                        booking_id: id,
                        ok: false,
                        reason: Some(e.reason().to_string()),
                        balance: match e {
                            EngineError::InsufficientCredit { balance, .. } => Some(balance),
                            _ => None,
                        },
                    },
                };
                let schema = Arc::new(booking_result_schema());
                let rows = vec![encode_booking_row(&schema, &row)];
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::InsertRecurringOpenBookings { request } => {
                let report = engine
                    .generate_recurring_open_bookings(caller, request)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(recurring_schema());
                let ids: Vec<String> = report.booking_ids.iter().map(|id| id.to_string()).collect();
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&(report.inserted as i64))?;
                encoder.encode_field(&(report.total as i64))?;
                encoder.encode_field(&serde_json::json!(ids).to_string())?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::GrantCredits {
                member,
                tier,
                amount,
                reason,
            } => {
                engine
                    .grant_credits(caller, &member, tier, amount, reason)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::CancelBooking { id } => {
                let outcome = engine.cancel_booking(caller, id).await.map_err(engine_err)?;
                let rows = match outcome {
                    CancelOutcome::Cancelled { .. } => 1,
                    CancelOutcome::AlreadyCancelled => 0,
                };
                Ok(Response::Execution(Tag::new("DELETE").with_rows(rows)))
            }
            Command::SettleOpenBookings { now } => {
                let report = engine
                    .settle_open_bookings(caller, now)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(settlement_schema());
                let mut rows = Vec::with_capacity(report.alerts.len() + 1);
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&(report.processed as i64))?;
                encoder.encode_field(&(report.docked as i64))?;
                encoder.encode_field(&None::<String>)?;
                encoder.encode_field(&None::<i64>)?;
                encoder.encode_field(&None::<i64>)?;
                rows.push(Ok(encoder.take_row()));
                for alert in &report.alerts {
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&None::<i64>)?;
                    encoder.encode_field(&None::<i64>)?;
                    encoder.encode_field(&alert.member)?;
                    encoder.encode_field(&i64::from(alert.tier.minutes()))?;
                    encoder.encode_field(&alert.balance)?;
                    rows.push(Ok(encoder.take_row()));
                }
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectBlocks { from, to, trainer } => {
                let views = engine
                    .list_blocks(caller, from, to, trainer.as_deref())
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(blocks_schema());
                let rows: Vec<PgWireResult<DataRow>> = views
                    .iter()
                    .map(|view| {
                        let block = &view.block;
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&block.template_id.to_string())?;
                        encoder.encode_field(&block.trainer)?;
                        encoder.encode_field(&block.date.to_string())?;
                        encoder.encode_field(&format_hhmm(block.span.start))?;
                        encoder.encode_field(&format_hhmm(block.span.end))?;
                        encoder.encode_field(&block.description)?;
                        for tier in Tier::ALL {
                            encoder.encode_field(&starts_json(view.starts_for(tier)))?;
                        }
                        encoder.encode_field(&view.my_booking.as_ref().map(|b| b.id.to_string()))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectSegments { from, to, trainer } => {
                let blocks = engine
                    .block_segments(caller, from, to, trainer.as_deref())
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(segments_schema());
                let mut rows: Vec<PgWireResult<DataRow>> = Vec::new();
                for entry in &blocks {
                    for seg in &entry.segments {
                        let (kind, booking_id, label) = match &seg.kind {
                            SegmentKind::Free => ("free", None, None),
                            SegmentKind::Booked { booking_id, occupant } => {
                                ("booked", Some(booking_id.to_string()), Some(occupant.clone()))
                            }
                            SegmentKind::Unavailable { reason } => ("unavailable", None, Some(reason.clone())),
                        };
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&entry.block.template_id.to_string())?;
                        encoder.encode_field(&entry.block.trainer)?;
                        encoder.encode_field(&entry.block.date.to_string())?;
                        encoder.encode_field(&format_hhmm(seg.span.start))?;
                        encoder.encode_field(&format_hhmm(seg.span.end))?;
                        encoder.encode_field(&kind.to_string())?;
                        encoder.encode_field(&booking_id)?;
                        encoder.encode_field(&label)?;
                        rows.push(Ok(encoder.take_row()));
                    }
                }
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectCreditBalance { member, tier } => {
                let balances = engine
                    .credit_balances(caller, &member)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(balance_schema());
                let tiers: Vec<Tier> = match tier {
                    Some(t) => vec![t],
                    None => Tier::ALL.to_vec(),
                };
                let rows: Vec<PgWireResult<DataRow>> = tiers
                    .into_iter()
                    .map(|t| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&member)?;
                        encoder.encode_field(&i64::from(t.minutes()))?;
                        encoder.encode_field(&balances[t.index()])?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectPtOccupancy { date, time } => {
                let pt = engine.is_pt_occupied(date, time).await;
                let class = engine.is_class_occupied(date, time).await;
                let schema = Arc::new(occupancy_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&date.to_string())?;
                encoder.encode_field(&format_hhmm(engine.policy().cell_of(time)))?;
                encoder.encode_field(&pt)?;
                encoder.encode_field(&class)?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectBooking { id } => {
                let booking = engine.get_booking(caller, id).await.map_err(engine_err)?;
                let schema = Arc::new(booking_schema());
                let rows = vec![encode_booking(&schema, &booking)];
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectLedgerAudit => {
                let drift = engine.audit_ledgers(caller).await.map_err(engine_err)?;
                let schema = Arc::new(audit_schema());
                let rows: Vec<PgWireResult<DataRow>> = drift
                    .iter()
                    .map(|d| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&d.member)?;
                        encoder.encode_field(&i64::from(d.tier.minutes()))?;
                        encoder.encode_field(&d.cached)?;
                        encoder.encode_field(&d.actual)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
        }
    }
}

struct BookingRow {
    booking_id: ulid::Ulid,
    ok: bool,
    reason: Option<String>,
    balance: Option<i64>,
}

fn encode_booking_row(schema: &Arc<Vec<FieldInfo>>, row: &BookingRow) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&row.booking_id.to_string())?;
    encoder.encode_field(&row.ok)?;
    encoder.encode_field(&row.reason)?;
    encoder.encode_field(&row.balance)?;
    Ok(encoder.take_row())
}

fn encode_booking(schema: &Arc<Vec<FieldInfo>>, b: &Booking) -> PgWireResult<DataRow> {
    let (member, guest) = match &b.party {
        Party::Member(m) => (Some(m.clone()), None),
        Party::Guest(g) => (None, Some(g.clone())),
    };
    let docked = match b.kind {
        BookingKind::Open { credit_docked, .. } => Some(credit_docked),
        _ => None,
    };
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&b.id.to_string())?;
    encoder.encode_field(&b.modality().label().to_string())?;
    encoder.encode_field(&b.trainer)?;
    encoder.encode_field(&b.date.to_string())?;
    encoder.encode_field(&format_hhmm(b.start))?;
    encoder.encode_field(&i64::from(b.tier.minutes()))?;
    encoder.encode_field(&i64::from(b.reserved))?;
    encoder.encode_field(&member)?;
    encoder.encode_field(&guest)?;
    encoder.encode_field(&b.payment.as_str().to_string())?;
    encoder.encode_field(&docked)?;
    encoder.encode_field(&b.product_id().map(|id| id.to_string()))?;
    encoder.encode_field(&b.template_id().map(|id| id.to_string()))?;
    Ok(encoder.take_row())
}

fn starts_json(starts: &[Minute]) -> String {
    let times: Vec<String> = starts.iter().map(|&m| format_hhmm(m)).collect();
    serde_json::json!(times).to_string()
}

// ── Result schemas ───────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn booking_result_schema() -> Vec<FieldInfo> {
    vec![
        field("booking_id", Type::VARCHAR),
        field("ok", Type::BOOL),
        field("reason", Type::VARCHAR),
        field("balance", Type::INT8),
    ]
}

fn recurring_schema() -> Vec<FieldInfo> {
    vec![
        field("inserted", Type::INT8),
        field("total", Type::INT8),
        field("booking_ids", Type::VARCHAR),
    ]
}

fn settlement_schema() -> Vec<FieldInfo> {
    vec![
        field("processed", Type::INT8),
        field("docked", Type::INT8),
        field("member_id", Type::VARCHAR),
        field("duration", Type::INT8),
        field("balance", Type::INT8),
    ]
}

fn blocks_schema() -> Vec<FieldInfo> {
    vec![
        field("template_id", Type::VARCHAR),
        field("trainer", Type::VARCHAR),
        field("date", Type::VARCHAR),
        field("start_time", Type::VARCHAR),
        field("end_time", Type::VARCHAR),
        field("description", Type::VARCHAR),
        field("starts_30", Type::VARCHAR),
        field("starts_60", Type::VARCHAR),
        field("starts_90", Type::VARCHAR),
        field("my_booking_id", Type::VARCHAR),
    ]
}

fn segments_schema() -> Vec<FieldInfo> {
    vec![
        field("template_id", Type::VARCHAR),
        field("trainer", Type::VARCHAR),
        field("date", Type::VARCHAR),
        field("start_time", Type::VARCHAR),
        field("end_time", Type::VARCHAR),
        field("kind", Type::VARCHAR),
        field("booking_id", Type::VARCHAR),
        field("label", Type::VARCHAR),
    ]
}

fn balance_schema() -> Vec<FieldInfo> {
    vec![
        field("member_id", Type::VARCHAR),
        field("duration", Type::INT8),
        field("balance", Type::INT8),
    ]
}

fn occupancy_schema() -> Vec<FieldInfo> {
    vec![
        field("date", Type::VARCHAR),
        field("cell", Type::VARCHAR),
        field("pt_occupied", Type::BOOL),
        field("class_occupied", Type::BOOL),
    ]
}

fn booking_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("modality", Type::VARCHAR),
        field("trainer", Type::VARCHAR),
        field("date", Type::VARCHAR),
        field("start_time", Type::VARCHAR),
        field("duration", Type::INT8),
        field("reserved", Type::INT8),
        field("member_id", Type::VARCHAR),
        field("guest_name", Type::VARCHAR),
        field("payment", Type::VARCHAR),
        field("credit_docked", Type::BOOL),
        field("product_id", Type::VARCHAR),
        field("template_id", Type::VARCHAR),
    ]
}

fn audit_schema() -> Vec<FieldInfo> {
    vec![
        field("member_id", Type::VARCHAR),
        field("duration", Type::INT8),
        field("cached", Type::INT8),
        field("actual", Type::INT8),
    ]
}

/// Result columns for a statement before its parameters are bound. Only the
/// target table matters, so a keyword scan is enough.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_lowercase();
    let lower = lower.trim_start();
    let target = |table: &str| {
        lower
            .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .any(|word| word == table)
    };
    if lower.starts_with("insert") {
        if target("recurring_open_bookings") {
            recurring_schema()
        } else if target("block_bookings") || target("open_bookings") || target("slot_bookings") {
            booking_result_schema()
        } else {
            vec![]
        }
    } else if lower.starts_with("select") {
        if target("settle_open_bookings") {
            settlement_schema()
        } else if target("blocks") {
            blocks_schema()
        } else if target("segments") {
            segments_schema()
        } else if target("credit_balance") {
            balance_schema()
        } else if target("pt_occupancy") {
            occupancy_schema()
        } else if target("bookings") {
            booking_schema()
        } else if target("ledger_audit") {
            audit_schema()
        } else {
            vec![]
        }
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for PtHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let caller = self.resolve_caller(client)?;
        Ok(vec![self.run(&caller, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct PtQueryParser;

#[async_trait]
impl QueryParser for PtQueryParser {
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
impl ExtendedQueryHandler for PtHandler {
    type Statement = String;
    type QueryParser = PtQueryParser;

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
        let caller = self.resolve_caller(client)?;
        let sql = bind_params(&portal.statement.statement, &portal.parameters);
        self.run(&caller, &sql).await
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

/// Bind $1, $2, ... to text-format parameter values in one left-to-right
/// pass over the statement. Bound values are never rescanned, quoted literals
/// are copied through, and unmatched placeholders are left as written.
fn bind_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        match c {
            '\'' => {
                out.push(c);
                // '' inside a literal is an escaped quote; it reopens at once.
                for (_, c) in chars.by_ref() {
                    out.push(c);
                    if c == '\'' {
                        break;
                    }
                }
            }
            '$' => {
                let digits_start = i + 1;
                let mut digits_end = digits_start;
                while let Some(&(j, d)) = chars.peek()
                    && d.is_ascii_digit()
                {
                    digits_end = j + 1;
                    chars.next();
                }
                let index = sql[digits_start..digits_end].parse::<usize>().ok();
                match index.and_then(|n| n.checked_sub(1)).and_then(|n| params.get(n)) {
                    Some(Some(bytes)) => {
                        let text = String::from_utf8_lossy(bytes.as_ref());
                        out.push('\'');
                        out.push_str(&text.replace('\'', "''"));
                        out.push('\'');
                    }
                    Some(None) => out.push_str("NULL"),
                    None => out.push_str(&sql[i..digits_end]),
                }
            }
            _ => out.push(c),
        }
    }
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct PtFactory {
    handler: Arc<PtHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<PtAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl PtFactory {
    pub fn new(engine: Arc<Engine>, directory: Arc<InMemoryDirectory>, password: String) -> Self {
        let auth_source = PtAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(PtHandler::new(engine, directory)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(auth_source, param_provider)),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for PtFactory {
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
    directory: Arc<InMemoryDirectory>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(PtFactory::new(engine, directory, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "P0001".into(),
        format!("{}: {e}", e.reason()),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = match e {
        SqlError::Invalid { .. } => "22023",
        _ => "42601",
    };
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        e.to_string(),
    )))
}
