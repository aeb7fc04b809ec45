use chrono::NaiveDate;

use crate::model::*;

// ── Template expansion ───────────────────────────────────────────

/// Every date in `[from, to]`, inclusive. Empty when `to < from`.
pub fn dates_in_range(from: NaiveDate, to: NaiveDate) -> impl Iterator<Item = NaiveDate> {
    from.iter_days().take_while(move |d| *d <= to)
}

/// The occurrence of `template` on `date`, if its weekday set includes it.
pub fn block_on(template: &AvailabilityTemplate, date: NaiveDate) -> Option<Block> {
    template.days.contains_date(date).then(|| Block {
        template_id: template.id,
        trainer: template.trainer.clone(),
        date,
        span: template.span,
        description: template.description.clone(),
    })
}

/// Expand availability templates into dated blocks, ordered by date, then
/// trainer, then start time.
pub fn expand_availability<'a>(
    templates: impl IntoIterator<Item = &'a AvailabilityTemplate>,
    from: NaiveDate,
    to: NaiveDate,
) -> Vec<Block> {
    let templates: Vec<&AvailabilityTemplate> = templates.into_iter().collect();
    let mut blocks = Vec::new();
    for date in dates_in_range(from, to) {
        blocks.extend(templates.iter().filter_map(|t| block_on(t, date)));
    }
    blocks.sort_by(|a, b| {
        a.date
            .cmp(&b.date)
            .then_with(|| a.trainer.cmp(&b.trainer))
            .then_with(|| a.span.start.cmp(&b.span.start))
            .then_with(|| a.template_id.cmp(&b.template_id))
    });
    blocks
}

/// Unavailability windows in force for `trainer` on `date`, ordered by start.
/// Facility-wide templates apply to every trainer.
pub fn unavailable_on<'a>(
    templates: impl IntoIterator<Item = &'a UnavailabilityTemplate>,
    trainer: &str,
    date: NaiveDate,
) -> Vec<&'a UnavailabilityTemplate> {
    let mut hits: Vec<&UnavailabilityTemplate> = templates
        .into_iter()
        .filter(|t| t.days.contains_date(date) && t.applies_to(trainer))
        .collect();
    hits.sort_by_key(|t| (t.span.start, t.id));
    hits
}
