use crate::model::*;
use crate::policy::SchedulingPolicy;

// ── Free intervals ───────────────────────────────────────────────

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end {
                last.end = last.end.max(span.end);
                continue;
            }
        merged.push(span);
    }
    merged
}

/// `base` minus `to_remove`. Both inputs sorted by start; `to_remove` may overlap.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}

/// Gaps left in `block` once `exclusions` (reserved bookings, unavailability,
/// class cells) are clipped to it and removed. Ordered and disjoint.
pub fn free_intervals(block: Span, exclusions: &[Span]) -> Vec<Span> {
    let mut clipped: Vec<Span> = exclusions.iter().filter_map(|e| e.clip(&block)).collect();
    clipped.sort_by_key(|s| s.start);
    let merged = merge_overlapping(&clipped);
    subtract_intervals(&[block], &merged)
}

// ── Bookable starts ──────────────────────────────────────────────

/// Starts offered for `tier` inside one free interval. Strides by the tier's
/// reserve; a trailing gap of exactly the session length is also offered.
pub fn bookable_starts(free: Span, tier: Tier, policy: &SchedulingPolicy) -> Vec<Minute> {
    let duration = tier.minutes();
    let need = policy.reserve(tier);
    if free.len() < duration {
        return Vec::new();
    }
    let mut starts = Vec::new();
    let mut s = free.start;
    while s + need <= free.end {
        starts.push(s);
        s += need;
    }
    if free.end - s == duration {
        starts.push(s);
    }
    starts
}

/// Bookable starts across all free intervals of a block, sorted and deduplicated.
pub fn block_starts(free: &[Span], tier: Tier, policy: &SchedulingPolicy) -> Vec<Minute> {
    let mut starts: Vec<Minute> = free
        .iter()
        .flat_map(|f| bookable_starts(*f, tier, policy))
        .collect();
    starts.sort_unstable();
    starts.dedup();
    starts
}

/// The free interval containing `start`, if any.
pub fn free_interval_at(free: &[Span], start: Minute) -> Option<Span> {
    free.iter().copied().find(|f| f.contains_minute(start))
}
