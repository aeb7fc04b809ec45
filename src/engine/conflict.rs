use std::collections::BTreeSet;

use chrono::NaiveDate;

use crate::limits::*;
use crate::model::*;
use crate::policy::SchedulingPolicy;

use super::intervals::{free_interval_at, free_intervals};
use super::EngineError;

pub(crate) fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

pub(crate) fn validate_name(name: &str, what: &'static str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::InvalidParty(what));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

/// The session span for a start, rejecting sessions that run past midnight.
pub(crate) fn session_span(start: Minute, tier: Tier) -> Result<Span, EngineError> {
    Span::try_new(start, start + tier.minutes())
        .ok_or_else(|| EngineError::InvalidTime(format_hhmm(start)))
}

/// Spans a class claim occupies on the timetable grid.
fn class_spans<'a>(
    cells: &'a BTreeSet<Minute>,
    policy: &'a SchedulingPolicy,
) -> impl Iterator<Item = Span> + 'a {
    cells.iter().map(move |&c| Span::new(c, c + policy.grid))
}

// ── Block path ───────────────────────────────────────────

/// Everything that removes time from a trainer's blocks on one date:
/// reserved ranges of the trainer's bookings (every modality), applicable
/// unavailability and claimed class cells.
pub(crate) fn block_exclusions(
    bookings: &[Booking],
    unavailable: &[&UnavailabilityTemplate],
    class_cells: &BTreeSet<Minute>,
    policy: &SchedulingPolicy,
) -> Vec<Span> {
    let mut spans: Vec<Span> = bookings.iter().map(Booking::reserved_span).collect();
    spans.extend(unavailable.iter().map(|u| u.span));
    spans.extend(class_spans(class_cells, policy));
    spans
}

/// Re-check a block booking start against live state. Returns the minutes to
/// reserve.
pub(crate) fn check_block_fit(
    block: &Block,
    start: Minute,
    tier: Tier,
    exclusions: &[Span],
    policy: &SchedulingPolicy,
) -> Result<Minute, EngineError> {
    if !block.span.contains_minute(start) {
        return Err(EngineError::OutsideBlock {
            start,
            block: block.span,
        });
    }
    let free = free_intervals(block.span, exclusions);
    let Some(interval) = free_interval_at(&free, start) else {
        return Err(EngineError::SlotUnavailable(format!(
            "{} is already taken",
            format_hhmm(start)
        )));
    };
    let remaining = interval.end - start;
    policy.reserved_minutes(tier, remaining).ok_or_else(|| {
        EngineError::SlotUnavailable(format!(
            "only {remaining} free minutes from {}",
            format_hhmm(start)
        ))
    })
}

// ── Open / slot path ─────────────────────────────────────

/// Guard for open and legacy slot bookings on `date`. `bookings` are the
/// trainer's active bookings that day.
pub(crate) fn check_open_slot(
    date: NaiveDate,
    session: Span,
    bookings: &[Booking],
    unavailable: &[&UnavailabilityTemplate],
    class_cells: &BTreeSet<Minute>,
    policy: &SchedulingPolicy,
) -> Result<(), EngineError> {
    if let Some(cell) = policy.cells(session).find(|c| class_cells.contains(c)) {
        return Err(EngineError::ClassConflict { date, cell });
    }
    if let Some(u) = unavailable.iter().find(|u| u.span.overlaps(&session)) {
        return Err(EngineError::SlotUnavailable(format!(
            "unavailable {}: {}",
            u.span, u.reason
        )));
    }
    let buffer = policy.open_buffer;
    for other in bookings {
        if other.reserved_span().overlaps(&session) {
            return Err(EngineError::SlotUnavailable(format!(
                "overlaps booking {} at {}",
                other.id,
                other.reserved_span()
            )));
        }
        let other_end = other.session_span().end;
        if other_end < session.start && session.start < other_end + buffer {
            return Err(EngineError::SlotUnavailable(format!(
                "starts within {buffer} minutes of a session ending {}",
                format_hhmm(other_end)
            )));
        }
        if session.end < other.start && other.start < session.end + buffer {
            return Err(EngineError::SlotUnavailable(format!(
                "ends within {buffer} minutes of a session starting {}",
                format_hhmm(other.start)
            )));
        }
    }
    Ok(())
}

// ── Class path ───────────────────────────────────────────

/// Whether any PT booking's reserved range touches the grid cell at `cell`.
pub(crate) fn pt_occupies_cell(bookings: &[Booking], cell: Minute, policy: &SchedulingPolicy) -> bool {
    let cell_span = Span::new(cell, cell + policy.grid);
    bookings.iter().any(|b| b.reserved_span().overlaps(&cell_span))
}
