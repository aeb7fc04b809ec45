use std::collections::HashMap;

use chrono::{NaiveDate, NaiveDateTime};
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertMember {
        id: MemberId,
        display_name: Option<String>,
    },
    /// Inserting an existing id replaces the template.
    SaveAvailabilityTemplate {
        template: AvailabilityTemplate,
    },
    DeleteAvailabilityTemplate {
        id: Ulid,
    },
    InsertUnavailabilityTemplate {
        template: UnavailabilityTemplate,
    },
    DeleteUnavailabilityTemplate {
        id: Ulid,
    },
    InsertSessionProduct {
        product: SessionProduct,
    },
    DeleteSessionProduct {
        id: Ulid,
    },
    ClaimClassCell {
        date: NaiveDate,
        time: Minute,
    },
    ReleaseClassCell {
        date: NaiveDate,
        time: Minute,
    },
    InsertBooking {
        request: BookingRequest,
    },
    InsertRecurringOpenBookings {
        request: RecurringOpenRequest,
    },
    GrantCredits {
        member: MemberId,
        tier: Tier,
        amount: i64,
        reason: LedgerReason,
    },
    CancelBooking {
        id: Ulid,
    },
    SettleOpenBookings {
        now: NaiveDateTime,
    },
    SelectBlocks {
        from: NaiveDate,
        to: NaiveDate,
        trainer: Option<TrainerId>,
    },
    SelectSegments {
        from: NaiveDate,
        to: NaiveDate,
        trainer: Option<TrainerId>,
    },
    SelectCreditBalance {
        member: MemberId,
        tier: Option<Tier>,
    },
    SelectPtOccupancy {
        date: NaiveDate,
        time: Minute,
    },
    SelectBooking {
        id: Ulid,
    },
    SelectLedgerAudit,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

/// One VALUES row keyed by lower-cased column name. SQL NULL reads as absent.
struct Row {
    table: &'static str,
    values: HashMap<String, Expr>,
}

impl Row {
    fn get(&self, col: &str) -> Option<&Expr> {
        self.values
            .get(col)
            .filter(|e| !matches!(extract_value(e), Some(Value::Null)))
    }

    fn required(&self, col: &'static str) -> Result<&Expr, SqlError> {
        self.get(col).ok_or(SqlError::MissingColumn(self.table, col))
    }

    fn ulid(&self, col: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid_expr(self.required(col)?)
    }

    fn text(&self, col: &'static str) -> Result<String, SqlError> {
        parse_text_expr(self.required(col)?)
    }

    fn opt_text(&self, col: &str) -> Result<Option<String>, SqlError> {
        self.get(col).map(parse_text_expr).transpose()
    }

    fn i64(&self, col: &'static str) -> Result<i64, SqlError> {
        parse_i64_expr(self.required(col)?)
    }

    fn date(&self, col: &'static str) -> Result<NaiveDate, SqlError> {
        parse_date_expr(self.required(col)?)
    }

    fn time(&self, col: &'static str) -> Result<Minute, SqlError> {
        parse_time_expr(self.required(col)?)
    }

    fn tier(&self, col: &'static str) -> Result<Tier, SqlError> {
        parse_tier_expr(self.required(col)?)
    }

    fn payment(&self) -> Result<PaymentMode, SqlError> {
        match self.opt_text("payment")? {
            None => Ok(PaymentMode::Credit),
            Some(s) => PaymentMode::parse(&s)
                .ok_or_else(|| SqlError::Parse(format!("payment must be 'paid' or 'credit', got {s:?}"))),
        }
    }

    /// `[start_time, end_time)` as a span.
    fn span(&self) -> Result<Span, SqlError> {
        let start = self.time("start_time")?;
        let end = self.time("end_time")?;
        Span::try_new(start, end).ok_or_else(|| SqlError::Invalid {
            reason: "invalid_time",
            detail: format!("end_time {} must be after start_time {}", format_hhmm(end), format_hhmm(start)),
        })
    }

    /// `days_of_week` CSV, falling back to the single `day_of_week` column.
    fn weekdays(&self) -> Result<WeekdaySet, SqlError> {
        let csv = self.opt_text("days_of_week")?;
        let single = match self.get("day_of_week") {
            Some(e) => Some(parse_weekday_expr(e)?),
            None => None,
        };
        WeekdaySet::from_columns(csv.as_deref(), single).ok_or_else(|| SqlError::Invalid {
            reason: "invalid_weekdays",
            detail: format!("no valid weekday in {:?} / {:?}", csv, single),
        })
    }

    /// `member_id` or `guest_name`, exactly one.
    fn party(&self) -> Result<Party, SqlError> {
        match (self.opt_text("member_id")?, self.opt_text("guest_name")?) {
            (Some(m), None) => Ok(Party::Member(m)),
            (None, Some(g)) => Ok(Party::Guest(g)),
            _ => Err(SqlError::Invalid {
                reason: "invalid_party",
                detail: "exactly one of member_id and guest_name is required".into(),
            }),
        }
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let table: &'static str = match table.as_str() {
        "members" => "members",
        "availability_templates" => "availability_templates",
        "unavailability_templates" => "unavailability_templates",
        "session_products" => "session_products",
        "class_cells" => "class_cells",
        "block_bookings" => "block_bookings",
        "open_bookings" => "open_bookings",
        "slot_bookings" => "slot_bookings",
        "recurring_open_bookings" => "recurring_open_bookings",
        "credit_ledger" => "credit_ledger",
        _ => return Err(SqlError::UnknownTable(table)),
    };
    let row = extract_row(insert, table)?;

    match table {
        "members" => Ok(Command::InsertMember {
            id: row.text("id")?,
            display_name: row.opt_text("display_name")?,
        }),
        "availability_templates" => Ok(Command::SaveAvailabilityTemplate {
            template: AvailabilityTemplate {
                id: row.ulid("id")?,
                trainer: row.text("trainer")?,
                days: row.weekdays()?,
                span: row.span()?,
                description: row.opt_text("description")?,
            },
        }),
        "unavailability_templates" => Ok(Command::InsertUnavailabilityTemplate {
            template: UnavailabilityTemplate {
                id: row.ulid("id")?,
                // An empty trainer means the whole facility.
                trainer: row.opt_text("trainer")?.filter(|t| !t.trim().is_empty()),
                days: row.weekdays()?,
                span: row.span()?,
                reason: row.opt_text("reason")?.unwrap_or_default(),
            },
        }),
        "session_products" => {
            let instance = match (row.get("date"), row.get("start_time")) {
                (None, None) => None,
                (Some(_), Some(_)) => Some(SessionInstance {
                    date: row.date("date")?,
                    start: row.time("start_time")?,
                }),
                _ => {
                    return Err(SqlError::Parse(
                        "session_products: date and start_time go together".into(),
                    ));
                }
            };
            Ok(Command::InsertSessionProduct {
                product: SessionProduct {
                    id: row.ulid("id")?,
                    trainer: row.text("trainer")?,
                    name: row.opt_text("name")?,
                    tier: row.tier("duration")?,
                    instance,
                },
            })
        }
        "class_cells" => Ok(Command::ClaimClassCell {
            date: row.date("date")?,
            time: row.time("time")?,
        }),
        "block_bookings" => Ok(Command::InsertBooking {
            request: BookingRequest::Block {
                id: row.ulid("id")?,
                template_id: row.ulid("template_id")?,
                date: row.date("date")?,
                start: row.time("start_time")?,
                tier: row.tier("duration")?,
                member: row.text("member_id")?,
                payment: row.payment()?,
            },
        }),
        "open_bookings" => Ok(Command::InsertBooking {
            request: BookingRequest::Open {
                id: row.ulid("id")?,
                product_id: row.ulid("product_id")?,
                date: row.date("date")?,
                start: row.time("start_time")?,
                tier: row.get("duration").map(parse_tier_expr).transpose()?,
                party: row.party()?,
                payment: row.payment()?,
            },
        }),
        "slot_bookings" => Ok(Command::InsertBooking {
            request: BookingRequest::Slot {
                id: row.ulid("id")?,
                product_id: row.ulid("product_id")?,
                member: row.text("member_id")?,
                payment: row.payment()?,
            },
        }),
        "recurring_open_bookings" => {
            let weeks = row.i64("weeks")?;
            Ok(Command::InsertRecurringOpenBookings {
                request: RecurringOpenRequest {
                    product_id: row.ulid("product_id")?,
                    party: row.party()?,
                    weekday: parse_weekday_expr(row.required("day_of_week")?)?,
                    start: row.time("start_time")?,
                    from: row.date("from_date")?,
                    weeks: u32::try_from(weeks.max(0)).unwrap_or(u32::MAX),
                },
            })
        }
        "credit_ledger" => {
            let reason = row.opt_text("reason")?.unwrap_or_else(|| "purchase".into());
            Ok(Command::GrantCredits {
                member: row.text("member_id")?,
                tier: row.tier("duration")?,
                amount: row.i64("amount")?,
                reason: LedgerReason::parse_grant(&reason).ok_or_else(|| {
                    SqlError::Parse(format!("reason must be 'purchase' or 'complimentary', got {reason:?}"))
                })?,
            })
        }
        _ => Err(SqlError::UnknownTable(table.to_string())),
    }
}

fn extract_row(insert: &ast::Insert, table: &'static str) -> Result<Row, SqlError> {
    if insert.columns.is_empty() {
        return Err(SqlError::Parse(format!("{table}: column list required")));
    }
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    let exprs = match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [row] => row,
            [] => return Err(SqlError::Parse("empty VALUES".into())),
            _ => return Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => return Err(SqlError::Parse("expected VALUES".into())),
    };
    if exprs.len() != insert.columns.len() {
        return Err(SqlError::WrongArity(table, insert.columns.len(), exprs.len()));
    }
    let values = insert
        .columns
        .iter()
        .map(|c| c.value.to_lowercase())
        .zip(exprs.iter().cloned())
        .collect();
    Ok(Row { table, values })
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = collect_filters(delete.selection.as_ref())?;

    match table.as_str() {
        "availability_templates" => Ok(Command::DeleteAvailabilityTemplate {
            id: filters.ulid("id")?,
        }),
        "unavailability_templates" => Ok(Command::DeleteUnavailabilityTemplate {
            id: filters.ulid("id")?,
        }),
        "session_products" => Ok(Command::DeleteSessionProduct {
            id: filters.ulid("id")?,
        }),
        "class_cells" => Ok(Command::ReleaseClassCell {
            date: parse_date_expr(filters.eq("date")?)?,
            time: parse_time_expr(filters.eq("time")?)?,
        }),
        "bookings" | "block_bookings" | "open_bookings" | "slot_bookings" => {
            Ok(Command::CancelBooking {
                id: filters.ulid("id")?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;
    let filters = collect_filters(select.selection.as_ref())?;

    match table.as_str() {
        "blocks" | "segments" => {
            let (from, to) = filters.date_range()?;
            let trainer = filters.opt_eq("trainer").map(parse_text_expr).transpose()?;
            if table == "blocks" {
                Ok(Command::SelectBlocks { from, to, trainer })
            } else {
                Ok(Command::SelectSegments { from, to, trainer })
            }
        }
        "credit_balance" => Ok(Command::SelectCreditBalance {
            member: parse_text_expr(filters.eq("member_id")?)?,
            tier: filters.opt_eq("duration").map(parse_tier_expr).transpose()?,
        }),
        "pt_occupancy" => Ok(Command::SelectPtOccupancy {
            date: parse_date_expr(filters.eq("date")?)?,
            time: parse_time_expr(filters.eq("time")?)?,
        }),
        "bookings" => Ok(Command::SelectBooking {
            id: filters.ulid("id")?,
        }),
        "settle_open_bookings" => {
            let raw = parse_text_expr(filters.eq("now")?)?;
            let now = parse_datetime(&raw).ok_or_else(|| SqlError::Invalid {
                reason: "invalid_time",
                detail: format!("expected 'YYYY-MM-DD HH:MM', got {raw:?}"),
            })?;
            Ok(Command::SettleOpenBookings { now })
        }
        "ledger_audit" => Ok(Command::SelectLedgerAudit),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    GtEq,
    LtEq,
}

/// Conjunction of `column <op> value` predicates from a WHERE clause.
struct Filters(Vec<(String, Op, Expr)>);

impl Filters {
    fn find(&self, col: &str, op: Op) -> Option<&Expr> {
        self.0
            .iter()
            .find(|(c, o, _)| c == col && *o == op)
            .map(|(_, _, e)| e)
    }

    fn opt_eq(&self, col: &str) -> Option<&Expr> {
        self.find(col, Op::Eq)
    }

    fn eq(&self, col: &'static str) -> Result<&Expr, SqlError> {
        self.opt_eq(col).ok_or(SqlError::MissingFilter(col))
    }

    fn ulid(&self, col: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid_expr(self.eq(col)?)
    }

    /// `date = d`, or `date >= from AND date <= to`.
    fn date_range(&self) -> Result<(NaiveDate, NaiveDate), SqlError> {
        if let Some(e) = self.opt_eq("date") {
            let d = parse_date_expr(e)?;
            return Ok((d, d));
        }
        let from = self.find("date", Op::GtEq).ok_or(SqlError::MissingFilter("date >="))?;
        let to = self.find("date", Op::LtEq).ok_or(SqlError::MissingFilter("date <="))?;
        Ok((parse_date_expr(from)?, parse_date_expr(to)?))
    }
}

fn collect_filters(selection: Option<&Expr>) -> Result<Filters, SqlError> {
    let mut out = Vec::new();
    if let Some(expr) = selection {
        collect_into(expr, &mut out)?;
    }
    Ok(Filters(out))
}

fn collect_into(expr: &Expr, out: &mut Vec<(String, Op, Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_into(inner, out),
        Expr::BinaryOp { left, op, right } => {
            let op = match op {
                ast::BinaryOperator::And => {
                    collect_into(left, out)?;
                    return collect_into(right, out);
                }
                ast::BinaryOperator::Eq => Op::Eq,
                ast::BinaryOperator::GtEq => Op::GtEq,
                ast::BinaryOperator::LtEq => Op::LtEq,
                other => return Err(SqlError::Unsupported(format!("operator {other}"))),
            };
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Parse(format!("expected column on the left of {expr}")))?;
            out.push((col, op, (**right).clone()));
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_text_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(s.clone()),
        Some(other) => Err(SqlError::Parse(format!("expected string, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_text_expr(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_i64_expr(expr)?);
    }
    let s = parse_text_expr(expr)?;
    s.trim()
        .parse()
        .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}")))
}

fn parse_date_expr(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_text_expr(expr)?;
    parse_date(&s).ok_or_else(|| SqlError::Invalid {
        reason: "invalid_date",
        detail: format!("expected 'YYYY-MM-DD', got {s:?}"),
    })
}

fn parse_time_expr(expr: &Expr) -> Result<Minute, SqlError> {
    let s = parse_text_expr(expr)?;
    parse_hhmm(&s).ok_or_else(|| SqlError::Invalid {
        reason: "invalid_time",
        detail: format!("expected 'HH:MM', got {s:?}"),
    })
}

fn parse_tier_expr(expr: &Expr) -> Result<Tier, SqlError> {
    let minutes = parse_i64_expr(expr)?;
    Tier::from_minutes(minutes).ok_or_else(|| SqlError::Invalid {
        reason: "invalid_duration",
        detail: format!("duration must be 30, 60 or 90, got {minutes}"),
    })
}

fn parse_weekday_expr(expr: &Expr) -> Result<u8, SqlError> {
    let d = parse_i64_expr(expr)?;
    u8::try_from(d)
        .ok()
        .filter(|d| *d <= 6)
        .ok_or_else(|| SqlError::Invalid {
            reason: "invalid_weekdays",
            detail: format!("weekday must be 0 (Sun) to 6 (Sat), got {d}"),
        })
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingColumn(&'static str, &'static str),
    MissingFilter(&'static str),
    /// Well-formed SQL carrying a value the domain rejects.
    Invalid {
        reason: &'static str,
        detail: String,
    },
}

impl SqlError {
    pub fn reason(&self) -> &'static str {
        match self {
            SqlError::Invalid { reason, .. } => reason,
            _ => "syntax_error",
        }
    }
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(t, col) => write!(f, "{t}: missing column {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::Invalid { reason, detail } => write!(f, "{reason}: {detail}"),
        }
    }
}

impl std::error::Error for SqlError {}
