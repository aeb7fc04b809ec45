use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::{format_hhmm, Minute, Span, Tier};

#[derive(Debug)]
pub enum EngineError {
    InvalidTime(String),
    InvalidDate(String),
    InvalidDuration(i64),
    InvalidWeekdays(String),
    InvalidRange(String),
    InvalidParty(&'static str),
    InvalidAmount(i64),
    UnknownTemplate(Ulid),
    UnknownProduct(Ulid),
    ProductKindMismatch(Ulid),
    DurationMismatch { expected: Tier, got: Tier },
    MemberNotFound(String),
    Forbidden(&'static str),
    NotFound(Ulid),
    AlreadyExists(Ulid),
    OutsideBlock { start: Minute, block: Span },
    SlotUnavailable(String),
    SlotAlreadyClaimed(Ulid),
    ClassConflict { date: NaiveDate, cell: Minute },
    InsufficientCredit { tier: Tier, balance: i64 },
    InUse(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// Stable machine-readable code, surfaced to clients next to the message.
    pub fn reason(&self) -> &'static str {
        match self {
            EngineError::InvalidTime(_) => "invalid_time",
            EngineError::InvalidDate(_) => "invalid_date",
            EngineError::InvalidDuration(_) => "invalid_duration",
            EngineError::InvalidWeekdays(_) => "invalid_weekdays",
            EngineError::InvalidRange(_) => "invalid_range",
            EngineError::InvalidParty(_) => "invalid_party",
            EngineError::InvalidAmount(_) => "invalid_amount",
            EngineError::UnknownTemplate(_) => "unknown_template",
            EngineError::UnknownProduct(_) => "unknown_product",
            EngineError::ProductKindMismatch(_) => "product_kind_mismatch",
            EngineError::DurationMismatch { .. } => "duration_mismatch",
            EngineError::MemberNotFound(_) => "member_not_found",
            EngineError::Forbidden(_) => "forbidden",
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::OutsideBlock { .. } => "outside_block",
            EngineError::SlotUnavailable(_) => "slot_unavailable",
            EngineError::SlotAlreadyClaimed(_) => "slot_already_claimed",
            EngineError::ClassConflict { .. } => "class_conflict",
            EngineError::InsufficientCredit { .. } => "insufficient_credit",
            EngineError::InUse(_) => "in_use",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "storage_error",
        }
    }

    /// State moved under the caller; refreshing availability and retrying
    /// may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::OutsideBlock { .. }
                | EngineError::SlotUnavailable(_)
                | EngineError::SlotAlreadyClaimed(_)
                | EngineError::ClassConflict { .. }
                | EngineError::InsufficientCredit { .. }
        )
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidTime(s) => write!(f, "invalid time of day: {s}"),
            EngineError::InvalidDate(s) => write!(f, "invalid date: {s}"),
            EngineError::InvalidDuration(d) => {
                write!(f, "duration must be 30, 60 or 90 minutes, got {d}")
            }
            EngineError::InvalidWeekdays(s) => write!(f, "invalid weekday set: {s}"),
            EngineError::InvalidRange(s) => write!(f, "invalid range: {s}"),
            EngineError::InvalidParty(msg) => write!(f, "invalid party: {msg}"),
            EngineError::InvalidAmount(a) => write!(f, "invalid credit amount: {a}"),
            EngineError::UnknownTemplate(id) => write!(f, "unknown template: {id}"),
            EngineError::UnknownProduct(id) => write!(f, "unknown session product: {id}"),
            EngineError::ProductKindMismatch(id) => {
                write!(f, "session product {id} cannot be booked this way")
            }
            EngineError::DurationMismatch { expected, got } => {
                write!(f, "product is a {expected}-minute session, requested {got}")
            }
            EngineError::MemberNotFound(id) => write!(f, "member not found: {id}"),
            EngineError::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::OutsideBlock { start, block } => write!(
                f,
                "start {} is outside block {block}; refresh and retry",
                format_hhmm(*start)
            ),
            EngineError::SlotUnavailable(detail) => {
                write!(f, "slot no longer available ({detail}); refresh and retry")
            }
            EngineError::SlotAlreadyClaimed(id) => {
                write!(f, "session {id} is already booked")
            }
            EngineError::ClassConflict { date, cell } => {
                write!(f, "class scheduled at {date} {}", format_hhmm(*cell))
            }
            EngineError::InsufficientCredit { tier, balance } => write!(
                f,
                "insufficient credit for {tier}-minute sessions (balance {balance})"
            ),
            EngineError::InUse(id) => write!(f, "{id} is referenced by active bookings"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
