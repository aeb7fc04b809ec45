use std::fmt;

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Minute of day: 0 is midnight, 1440 is the end of the day.
pub type Minute = i32;

pub const MINUTES_PER_DAY: Minute = 1440;

/// Trainers are identified by their calendar name.
pub type TrainerId = String;

/// Opaque member id owned by the member directory.
pub type MemberId = String;

/// Half-open interval `[start, end)` in minutes of day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Minute,
    pub end: Minute,
}

impl Span {
    pub fn new(start: Minute, end: Minute) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Checked constructor for untrusted input.
    pub fn try_new(start: Minute, end: Minute) -> Option<Self> {
        if 0 <= start && start < end && end <= MINUTES_PER_DAY {
            Some(Self { start, end })
        } else {
            None
        }
    }

    pub fn len(&self) -> Minute {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_minute(&self, m: Minute) -> bool {
        self.start <= m && m < self.end
    }

    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Intersection with `bounds`, if non-empty.
    pub fn clip(&self, bounds: &Span) -> Option<Span> {
        let start = self.start.max(bounds.start);
        let end = self.end.min(bounds.end);
        (start < end).then_some(Span { start, end })
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", format_hhmm(self.start), format_hhmm(self.end))
    }
}

/// Session length a credit is denominated in. Tiers are not fungible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Tier {
    Min30,
    Min60,
    Min90,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Min30, Tier::Min60, Tier::Min90];

    pub fn minutes(self) -> Minute {
        match self {
            Tier::Min30 => 30,
            Tier::Min60 => 60,
            Tier::Min90 => 90,
        }
    }

    pub fn from_minutes(minutes: i64) -> Option<Tier> {
        match minutes {
            30 => Some(Tier::Min30),
            60 => Some(Tier::Min60),
            90 => Some(Tier::Min90),
            _ => None,
        }
    }

    pub fn index(self) -> usize {
        match self {
            Tier::Min30 => 0,
            Tier::Min60 => 1,
            Tier::Min90 => 2,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.minutes())
    }
}

// ── Weekdays ─────────────────────────────────────────────────────

/// Set of weekdays, bit `i` set for weekday `i` (0 = Sunday .. 6 = Saturday).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct WeekdaySet(u8);

impl WeekdaySet {
    pub const EMPTY: WeekdaySet = WeekdaySet(0);

    pub fn single(day: u8) -> Option<Self> {
        (day <= 6).then(|| WeekdaySet(1 << day))
    }

    pub fn from_days(days: impl IntoIterator<Item = u8>) -> Self {
        let mut bits = 0u8;
        for d in days {
            if d <= 6 {
                bits |= 1 << d;
            }
        }
        WeekdaySet(bits)
    }

    /// Parse a comma-separated list like `"1,3,5"`. Entries outside 0–6 or
    /// not numeric are ignored.
    pub fn parse_csv(csv: &str) -> Self {
        Self::from_days(
            csv.split(',')
                .filter_map(|part| part.trim().parse::<u8>().ok()),
        )
    }

    /// Build from the two stored columns. A CSV list with at least one valid
    /// day wins over the single-day fallback.
    pub fn from_columns(csv: Option<&str>, fallback: Option<u8>) -> Option<Self> {
        if let Some(csv) = csv.filter(|s| !s.trim().is_empty()) {
            let parsed = Self::parse_csv(csv);
            if !parsed.is_empty() {
                return Some(parsed);
            }
        }
        fallback.and_then(Self::single)
    }

    pub fn contains(self, day: u8) -> bool {
        day <= 6 && self.0 & (1 << day) != 0
    }

    pub fn contains_date(self, date: NaiveDate) -> bool {
        self.contains(weekday_index(date))
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn days(self) -> impl Iterator<Item = u8> {
        (0..=6u8).filter(move |d| self.contains(*d))
    }

    pub fn to_csv(self) -> String {
        self.days()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// 0 = Sunday .. 6 = Saturday.
pub fn weekday_index(date: NaiveDate) -> u8 {
    date.weekday().num_days_from_sunday() as u8
}

// ── Text formats ─────────────────────────────────────────────────

/// Parse a 24-hour `HH:MM` time of day. `24:00` is accepted as end of day.
pub fn parse_hhmm(s: &str) -> Option<Minute> {
    let (h, m) = s.trim().split_once(':')?;
    if h.is_empty() || h.len() > 2 || m.len() != 2 {
        return None;
    }
    let h: Minute = h.parse().ok()?;
    let m: Minute = m.parse().ok()?;
    if !(0..60).contains(&m) {
        return None;
    }
    match h {
        0..=23 => Some(h * 60 + m),
        24 if m == 0 => Some(MINUTES_PER_DAY),
        _ => None,
    }
}

pub fn format_hhmm(m: Minute) -> String {
    format!("{:02}:{:02}", m / 60, m % 60)
}

/// Parse `YYYY-MM-DD`.
pub fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok()
}

/// Parse `YYYY-MM-DD HH:MM` (a `T` separator is also accepted).
pub fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    let (date, time) = s.split_once(' ').or_else(|| s.split_once('T'))?;
    let date = parse_date(date)?;
    let minute = parse_hhmm(time.get(..5).unwrap_or(time))?;
    at_minute(date, minute)
}

/// The instant `minute` minutes after midnight on `date`.
pub fn at_minute(date: NaiveDate, minute: Minute) -> Option<NaiveDateTime> {
    let midnight = date.and_time(NaiveTime::MIN);
    midnight.checked_add_signed(chrono::Duration::minutes(i64::from(minute)))
}

// ── Templates & products ─────────────────────────────────────────

/// Weekly recurring window in which a trainer takes block bookings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityTemplate {
    pub id: Ulid,
    pub trainer: TrainerId,
    pub days: WeekdaySet,
    pub span: Span,
    pub description: Option<String>,
}

/// Weekly recurring exclusion window. `trainer: None` blocks every trainer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnavailabilityTemplate {
    pub id: Ulid,
    pub trainer: Option<TrainerId>,
    pub days: WeekdaySet,
    pub span: Span,
    pub reason: String,
}

impl UnavailabilityTemplate {
    pub fn applies_to(&self, trainer: &str) -> bool {
        self.trainer.as_deref().is_none_or(|t| t == trainer)
    }
}

/// A bookable PT product. Without an instance it backs open bookings; with a
/// dated instance it is a single claimable legacy slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionProduct {
    pub id: Ulid,
    pub trainer: TrainerId,
    pub name: Option<String>,
    pub tier: Tier,
    pub instance: Option<SessionInstance>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInstance {
    pub date: NaiveDate,
    pub start: Minute,
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaymentMode {
    Paid,
    Credit,
}

impl PaymentMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "paid" => Some(PaymentMode::Paid),
            "credit" => Some(PaymentMode::Credit),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PaymentMode::Paid => "paid",
            PaymentMode::Credit => "credit",
        }
    }
}

/// Who the session is for. Guests only exist on open bookings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Party {
    Member(MemberId),
    Guest(String),
}

impl Party {
    pub fn member(&self) -> Option<&str> {
        match self {
            Party::Member(id) => Some(id),
            Party::Guest(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Modality {
    Block,
    Open,
    Slot,
}

impl Modality {
    pub fn label(self) -> &'static str {
        match self {
            Modality::Block => "pt_block_booking",
            Modality::Open => "pt_open_booking",
            Modality::Slot => "pt_slot_booking",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingKind {
    Block { template_id: Ulid },
    /// `credit_docked` flips once, when the settlement pass has processed it.
    Open { product_id: Ulid, credit_docked: bool },
    Slot { product_id: Ulid },
}

/// A committed PT booking of any modality.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub trainer: TrainerId,
    pub date: NaiveDate,
    pub start: Minute,
    pub tier: Tier,
    /// Minutes withheld from the calendar; `>= tier.minutes()`.
    pub reserved: Minute,
    pub party: Party,
    pub payment: PaymentMode,
    pub kind: BookingKind,
}

impl Booking {
    pub fn session_span(&self) -> Span {
        Span::new(self.start, self.start + self.tier.minutes())
    }

    pub fn reserved_span(&self) -> Span {
        Span::new(self.start, self.start + self.reserved)
    }

    pub fn modality(&self) -> Modality {
        match self.kind {
            BookingKind::Block { .. } => Modality::Block,
            BookingKind::Open { .. } => Modality::Open,
            BookingKind::Slot { .. } => Modality::Slot,
        }
    }

    pub fn product_id(&self) -> Option<Ulid> {
        match self.kind {
            BookingKind::Open { product_id, .. } | BookingKind::Slot { product_id } => {
                Some(product_id)
            }
            BookingKind::Block { .. } => None,
        }
    }

    pub fn template_id(&self) -> Option<Ulid> {
        match self.kind {
            BookingKind::Block { template_id } => Some(template_id),
            _ => None,
        }
    }
}

// ── Ledger ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerReason {
    Purchase,
    Complimentary,
    Booking(Modality),
    BookingCancel(Modality),
    /// Post-session dock of a paid open booking by the settlement pass.
    SessionDock,
}

impl LedgerReason {
    pub fn label(&self) -> String {
        match self {
            LedgerReason::Purchase => "purchase".into(),
            LedgerReason::Complimentary => "complimentary".into(),
            LedgerReason::Booking(m) => m.label().into(),
            LedgerReason::BookingCancel(m) => format!("{}_cancel", m.label()),
            LedgerReason::SessionDock => "pt_open_booking_after_session".into(),
        }
    }

    /// Reasons a grant may carry.
    pub fn parse_grant(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "purchase" => Some(LedgerReason::Purchase),
            "complimentary" => Some(LedgerReason::Complimentary),
            _ => None,
        }
    }
}

/// Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Ulid,
    pub member: MemberId,
    pub tier: Tier,
    pub amount: i64,
    pub reason: LedgerReason,
    /// Booking this entry debits or refunds.
    pub reference: Option<Ulid>,
    pub recorded_at: i64,
}

// ── Caller ───────────────────────────────────────────────────────

/// Identity of whoever invokes an operation. Passed explicitly everywhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    Admin,
    Trainer(TrainerId),
    Member(MemberId),
}

impl Caller {
    pub fn is_staff(&self) -> bool {
        matches!(self, Caller::Admin | Caller::Trainer(_))
    }
}

/// The WAL record format. One event per state change; a booking and its
/// ledger debit travel in the same record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    AvailabilityTemplateSaved {
        template: AvailabilityTemplate,
    },
    AvailabilityTemplateRemoved {
        id: Ulid,
    },
    UnavailabilityTemplateSaved {
        template: UnavailabilityTemplate,
    },
    UnavailabilityTemplateRemoved {
        id: Ulid,
    },
    SessionProductSaved {
        product: SessionProduct,
    },
    SessionProductRemoved {
        id: Ulid,
    },
    ClassCellClaimed {
        date: NaiveDate,
        cell: Minute,
    },
    ClassCellReleased {
        date: NaiveDate,
        cell: Minute,
    },
    BookingCommitted {
        booking: Booking,
        debit: Option<LedgerEntry>,
    },
    BookingCancelled {
        id: Ulid,
        trainer: TrainerId,
        date: NaiveDate,
        refund: Option<LedgerEntry>,
    },
    LedgerEntryRecorded {
        entry: LedgerEntry,
    },
    OpenBookingSettled {
        id: Ulid,
        trainer: TrainerId,
        date: NaiveDate,
        dock: Option<LedgerEntry>,
    },
}

// ── Requests ─────────────────────────────────────────────────────

/// A prospective booking, tagged by modality.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookingRequest {
    Block {
        id: Ulid,
        template_id: Ulid,
        date: NaiveDate,
        start: Minute,
        tier: Tier,
        member: MemberId,
        payment: PaymentMode,
    },
    Open {
        id: Ulid,
        product_id: Ulid,
        date: NaiveDate,
        start: Minute,
        /// Must match the product's tier when given.
        tier: Option<Tier>,
        party: Party,
        payment: PaymentMode,
    },
    Slot {
        id: Ulid,
        product_id: Ulid,
        member: MemberId,
        payment: PaymentMode,
    },
}

impl BookingRequest {
    pub fn id(&self) -> Ulid {
        match self {
            BookingRequest::Block { id, .. }
            | BookingRequest::Open { id, .. }
            | BookingRequest::Slot { id, .. } => *id,
        }
    }

    pub fn modality(&self) -> Modality {
        match self {
            BookingRequest::Block { .. } => Modality::Block,
            BookingRequest::Open { .. } => Modality::Open,
            BookingRequest::Slot { .. } => Modality::Slot,
        }
    }

    pub fn payment(&self) -> PaymentMode {
        match self {
            BookingRequest::Block { payment, .. }
            | BookingRequest::Open { payment, .. }
            | BookingRequest::Slot { payment, .. } => *payment,
        }
    }
}

/// Partial edit of an availability template; `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AvailabilityPatch {
    pub trainer: Option<TrainerId>,
    pub days: Option<WeekdaySet>,
    pub start: Option<Minute>,
    pub end: Option<Minute>,
    pub description: Option<Option<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecurringOpenRequest {
    pub product_id: Ulid,
    pub party: Party,
    pub weekday: u8,
    pub start: Minute,
    pub from: NaiveDate,
    pub weeks: u32,
}

// ── Query result types ───────────────────────────────────────────

/// A template expanded onto one date. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub template_id: Ulid,
    pub trainer: TrainerId,
    pub date: NaiveDate,
    pub span: Span,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockView {
    pub block: Block,
    /// Bookable starts, indexed by `Tier::index`.
    pub starts: [Vec<Minute>; 3],
    /// The caller's own booking inside this block, if any.
    pub my_booking: Option<Booking>,
}

impl BlockView {
    pub fn starts_for(&self, tier: Tier) -> &[Minute] {
        &self.starts[tier.index()]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentKind {
    Free,
    Booked { booking_id: Ulid, occupant: String },
    Unavailable { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub span: Span,
    pub kind: SegmentKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSegments {
    pub block: Block,
    pub segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReceipt {
    pub booking_id: Ulid,
    pub trainer: TrainerId,
    pub date: NaiveDate,
    pub start: Minute,
    pub reserved: Minute,
    /// Balance after the debit, for credit-funded bookings.
    pub balance: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled {
        booking_id: Ulid,
        refunded: bool,
        balance: Option<i64>,
    },
    AlreadyCancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Saved {
    Created,
    Updated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditAlert {
    pub member: MemberId,
    pub tier: Tier,
    pub balance: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettlementReport {
    pub processed: usize,
    pub docked: usize,
    pub alerts: Vec<CreditAlert>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecurringReport {
    pub inserted: usize,
    pub total: usize,
    pub booking_ids: Vec<Ulid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerDrift {
    pub member: MemberId,
    pub tier: Tier,
    pub cached: i64,
    pub actual: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        parse_date(s).unwrap()
    }

    #[test]
    fn span_basics() {
        let s = Span::new(540, 600);
        assert_eq!(s.len(), 60);
        assert!(s.contains_minute(540));
        assert!(s.contains_minute(599));
        assert!(!s.contains_minute(600)); // half-open
    }

    #[test]
    fn span_overlap_and_clip() {
        let a = Span::new(540, 600);
        let b = Span::new(570, 630);
        let c = Span::new(600, 660);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent
        assert_eq!(b.clip(&a), Some(Span::new(570, 600)));
        assert_eq!(c.clip(&a), None);
    }

    #[test]
    fn span_try_new_rejects_bad_bounds() {
        assert!(Span::try_new(600, 540).is_none());
        assert!(Span::try_new(600, 600).is_none());
        assert!(Span::try_new(-5, 30).is_none());
        assert!(Span::try_new(1400, 1450).is_none());
        assert_eq!(Span::try_new(0, 1440), Some(Span::new(0, 1440)));
    }

    #[test]
    fn tier_from_minutes() {
        assert_eq!(Tier::from_minutes(30), Some(Tier::Min30));
        assert_eq!(Tier::from_minutes(90), Some(Tier::Min90));
        assert_eq!(Tier::from_minutes(45), None);
        assert_eq!(Tier::from_minutes(0), None);
    }

    #[test]
    fn hhmm_parsing() {
        assert_eq!(parse_hhmm("09:00"), Some(540));
        assert_eq!(parse_hhmm("9:30"), Some(570));
        assert_eq!(parse_hhmm("23:59"), Some(1439));
        assert_eq!(parse_hhmm("24:00"), Some(1440));
        assert_eq!(parse_hhmm("24:30"), None);
        assert_eq!(parse_hhmm("12:60"), None);
        assert_eq!(parse_hhmm("noon"), None);
        assert_eq!(parse_hhmm("12:5"), None);
        assert_eq!(format_hhmm(615), "10:15");
        assert_eq!(format_hhmm(0), "00:00");
    }

    #[test]
    fn datetime_parsing() {
        let dt = parse_datetime("2024-06-03 11:05").unwrap();
        assert_eq!(dt, at_minute(date("2024-06-03"), 665).unwrap());
        assert_eq!(parse_datetime("2024-06-03T11:05"), Some(dt));
        assert!(parse_datetime("2024-06-03").is_none());
        assert!(parse_datetime("2024-13-03 10:00").is_none());
    }

    #[test]
    fn weekday_index_is_sunday_based() {
        assert_eq!(weekday_index(date("2024-06-02")), 0); // Sunday
        assert_eq!(weekday_index(date("2024-06-03")), 1); // Monday
        assert_eq!(weekday_index(date("2024-06-08")), 6); // Saturday
    }

    #[test]
    fn weekday_csv_wins_over_fallback() {
        let set = WeekdaySet::from_columns(Some("1,3,5"), Some(2)).unwrap();
        assert!(set.contains(1) && set.contains(3) && set.contains(5));
        assert!(!set.contains(2));
        assert_eq!(set.to_csv(), "1,3,5");
    }

    #[test]
    fn weekday_blank_or_invalid_csv_falls_back() {
        assert_eq!(
            WeekdaySet::from_columns(Some("  "), Some(2)),
            WeekdaySet::single(2)
        );
        assert_eq!(
            WeekdaySet::from_columns(Some("9,x"), Some(4)),
            WeekdaySet::single(4)
        );
        assert_eq!(WeekdaySet::from_columns(None, None), None);
        assert_eq!(WeekdaySet::from_columns(None, Some(7)), None);
    }

    #[test]
    fn weekday_csv_ignores_out_of_range_entries() {
        let set = WeekdaySet::parse_csv("0, 6, 7, -1");
        assert_eq!(set.days().collect::<Vec<_>>(), vec![0, 6]);
    }

    #[test]
    fn unavailability_scope() {
        let facility = UnavailabilityTemplate {
            id: Ulid::new(),
            trainer: None,
            days: WeekdaySet::single(1).unwrap(),
            span: Span::new(720, 780),
            reason: "Cleaning".into(),
        };
        assert!(facility.applies_to("alex"));
        let own = UnavailabilityTemplate {
            trainer: Some("alex".into()),
            ..facility
        };
        assert!(own.applies_to("alex"));
        assert!(!own.applies_to("sam"));
    }

    #[test]
    fn ledger_reason_labels() {
        assert_eq!(
            LedgerReason::BookingCancel(Modality::Block).label(),
            "pt_block_booking_cancel"
        );
        assert_eq!(LedgerReason::Booking(Modality::Open).label(), "pt_open_booking");
        assert_eq!(LedgerReason::parse_grant("Purchase"), Some(LedgerReason::Purchase));
        assert_eq!(LedgerReason::parse_grant("refund"), None);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::BookingCommitted {
            booking: Booking {
                id: Ulid::new(),
                trainer: "alex".into(),
                date: date("2024-06-03"),
                start: 540,
                tier: Tier::Min60,
                reserved: 75,
                party: Party::Member("m-1".into()),
                payment: PaymentMode::Credit,
                kind: BookingKind::Block {
                    template_id: Ulid::new(),
                },
            },
            debit: None,
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
