use chrono::{NaiveDate, NaiveDateTime};
use dashmap::mapref::entry::Entry;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{block_exclusions, check_block_fit, check_open_slot, pt_occupies_cell, session_span, validate_name};
use super::expand::{block_on, unavailable_on};
use super::ledger::{booking_debit, cancel_refund, entry};
use super::{Catalog, Engine, EngineError};

// ── Authorization ────────────────────────────────────────

pub(super) fn require_admin(caller: &Caller, what: &'static str) -> Result<(), EngineError> {
    match caller {
        Caller::Admin => Ok(()),
        _ => Err(EngineError::Forbidden(what)),
    }
}

/// Admin, or the trainer who owns the calendar.
pub(super) fn require_calendar(caller: &Caller, trainer: &str) -> Result<(), EngineError> {
    match caller {
        Caller::Admin => Ok(()),
        Caller::Trainer(t) if t == trainer => Ok(()),
        Caller::Trainer(_) => Err(EngineError::Forbidden("trainers may only manage their own calendar")),
        Caller::Member(_) => Err(EngineError::Forbidden("members cannot manage calendars")),
    }
}

/// Staff may act for any member; a member only for themselves.
pub(super) fn require_member_access(caller: &Caller, member: &str) -> Result<(), EngineError> {
    match caller {
        Caller::Admin | Caller::Trainer(_) => Ok(()),
        Caller::Member(m) if m == member => Ok(()),
        Caller::Member(_) => Err(EngineError::Forbidden("members may only act for themselves")),
    }
}

fn validate_trainer(trainer: &str) -> Result<(), EngineError> {
    if trainer.trim().is_empty() {
        return Err(EngineError::InvalidParty("trainer name is empty"));
    }
    if trainer.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("trainer name too long"));
    }
    Ok(())
}

fn validate_template(trainer: Option<&str>, days: WeekdaySet, span: Span) -> Result<(), EngineError> {
    if let Some(t) = trainer {
        validate_trainer(t)?;
    }
    if days.is_empty() {
        return Err(EngineError::InvalidWeekdays("no weekdays selected".into()));
    }
    if Span::try_new(span.start, span.end).is_none() {
        return Err(EngineError::InvalidTime(format!(
            "{}-{}",
            format_hhmm(span.start),
            format_hhmm(span.end)
        )));
    }
    Ok(())
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum PutMode {
    Create,
    Replace,
    Upsert,
}

/// What a commit resolved the request to, before the partition is locked.
struct Target {
    trainer: TrainerId,
    date: NaiveDate,
    start: Minute,
    tier: Tier,
    kind: BookingKind,
    block: Option<Block>,
}

// ── Booking id claims ───────────────────────────────────

/// Holds a booking id for one commit attempt; released on drop.
struct IdClaim<'a> {
    engine: &'a Engine,
    id: Ulid,
}

impl<'a> IdClaim<'a> {
    /// Fails when the id is in flight elsewhere, active or cancelled.
    fn acquire(engine: &'a Engine, id: Ulid) -> Result<Self, EngineError> {
        match engine.pending_ids.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(());
            }
        }
        let claim = Self { engine, id };
        // Checked after claiming: a finished commit indexes the id before
        // it releases its claim.
        if engine.booking_index.contains_key(&id) || engine.cancelled.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        Ok(claim)
    }
}

impl Drop for IdClaim<'_> {
    fn drop(&mut self) {
        self.engine.pending_ids.remove(&self.id);
    }
}

impl Engine {
    // ── Availability templates ───────────────────────────

    pub async fn create_availability_template(
        &self,
        caller: &Caller,
        template: AvailabilityTemplate,
    ) -> Result<(), EngineError> {
        self.put_availability_template(caller, template, PutMode::Create)
            .await
            .map(|_| ())
    }

    /// Create or replace. A replacement is refused while any active booking
    /// made against the template would no longer fit its new shape.
    pub async fn save_availability_template(
        &self,
        caller: &Caller,
        template: AvailabilityTemplate,
    ) -> Result<Saved, EngineError> {
        self.put_availability_template(caller, template, PutMode::Upsert)
            .await
    }

    pub async fn update_availability_template(
        &self,
        caller: &Caller,
        id: Ulid,
        patch: AvailabilityPatch,
    ) -> Result<AvailabilityTemplate, EngineError> {
        let current = self
            .catalog
            .read()
            .await
            .availability
            .get(&id)
            .cloned()
            .ok_or(EngineError::UnknownTemplate(id))?;
        let start = patch.start.unwrap_or(current.span.start);
        let end = patch.end.unwrap_or(current.span.end);
        let span = Span::try_new(start, end).ok_or_else(|| {
            EngineError::InvalidTime(format!("{}-{}", format_hhmm(start), format_hhmm(end)))
        })?;
        let updated = AvailabilityTemplate {
            id,
            trainer: patch.trainer.unwrap_or(current.trainer),
            days: patch.days.unwrap_or(current.days),
            span,
            description: patch.description.unwrap_or(current.description),
        };
        self.put_availability_template(caller, updated.clone(), PutMode::Replace)
            .await?;
        Ok(updated)
    }

    async fn put_availability_template(
        &self,
        caller: &Caller,
        template: AvailabilityTemplate,
        mode: PutMode,
    ) -> Result<Saved, EngineError> {
        validate_template(Some(&template.trainer), template.days, template.span)?;
        if let Some(d) = &template.description
            && d.len() > MAX_DESCRIPTION_LEN
        {
            return Err(EngineError::LimitExceeded("description too long"));
        }
        require_calendar(caller, &template.trainer)?;

        let _gate = self.gate.read().await;
        let mut catalog = self.catalog.write().await;
        let saved = match (catalog.availability.get(&template.id), mode) {
            (Some(_), PutMode::Create) => return Err(EngineError::AlreadyExists(template.id)),
            (None, PutMode::Replace) => return Err(EngineError::UnknownTemplate(template.id)),
            (Some(existing), _) => {
                require_calendar(caller, &existing.trainer)?;
                let existing = existing.clone();
                self.ensure_template_reshape_ok(&existing, &template).await?;
                Saved::Updated
            }
            (None, _) => {
                if catalog.availability.len() >= MAX_AVAILABILITY_TEMPLATES {
                    return Err(EngineError::LimitExceeded("too many availability templates"));
                }
                Saved::Created
            }
        };

        let event = Event::AvailabilityTemplateSaved {
            template: template.clone(),
        };
        self.wal_append(&event).await?;
        catalog.apply(&event);
        info!(
            "availability template {} {:?}: {} {} on {}",
            template.id,
            saved,
            template.trainer,
            template.span,
            template.days.to_csv()
        );
        Ok(saved)
    }

    /// Active bookings made against `template` (any date).
    async fn template_bookings(&self, template: &AvailabilityTemplate) -> Vec<Booking> {
        let days: Vec<_> = self
            .days
            .iter()
            .filter(|e| e.key().0 == template.trainer)
            .map(|e| e.value().clone())
            .collect();
        let mut found = Vec::new();
        for day in days {
            let guard = day.read().await;
            found.extend(
                guard
                    .bookings
                    .iter()
                    .filter(|b| b.template_id() == Some(template.id))
                    .cloned(),
            );
        }
        found
    }

    async fn ensure_template_reshape_ok(
        &self,
        current: &AvailabilityTemplate,
        next: &AvailabilityTemplate,
    ) -> Result<(), EngineError> {
        for booking in self.template_bookings(current).await {
            let fits = booking.trainer == next.trainer
                && next.days.contains_date(booking.date)
                && next.span.contains_span(&booking.reserved_span());
            if !fits {
                return Err(EngineError::InUse(current.id));
            }
        }
        Ok(())
    }

    pub async fn remove_availability_template(&self, caller: &Caller, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.gate.read().await;
        let mut catalog = self.catalog.write().await;
        let template = catalog
            .availability
            .get(&id)
            .cloned()
            .ok_or(EngineError::UnknownTemplate(id))?;
        require_calendar(caller, &template.trainer)?;
        if !self.template_bookings(&template).await.is_empty() {
            return Err(EngineError::InUse(id));
        }
        let event = Event::AvailabilityTemplateRemoved { id };
        self.wal_append(&event).await?;
        catalog.apply(&event);
        info!("availability template {id} removed");
        Ok(())
    }

    // ── Unavailability templates ─────────────────────────

    pub async fn create_unavailability_template(
        &self,
        caller: &Caller,
        template: UnavailabilityTemplate,
    ) -> Result<(), EngineError> {
        validate_template(template.trainer.as_deref(), template.days, template.span)?;
        if template.reason.len() > MAX_DESCRIPTION_LEN {
            return Err(EngineError::LimitExceeded("reason too long"));
        }
        match &template.trainer {
            Some(t) => require_calendar(caller, t)?,
            None => require_admin(caller, "facility-wide unavailability is admin only")?,
        }

        let _gate = self.gate.read().await;
        let mut catalog = self.catalog.write().await;
        if catalog.unavailability.contains_key(&template.id) {
            return Err(EngineError::AlreadyExists(template.id));
        }
        if catalog.unavailability.len() >= MAX_UNAVAILABILITY_TEMPLATES {
            return Err(EngineError::LimitExceeded("too many unavailability templates"));
        }
        let event = Event::UnavailabilityTemplateSaved {
            template: template.clone(),
        };
        self.wal_append(&event).await?;
        catalog.apply(&event);
        info!(
            "unavailability {} for {}: {} on {} ({})",
            template.id,
            template.trainer.as_deref().unwrap_or("all trainers"),
            template.span,
            template.days.to_csv(),
            template.reason
        );
        Ok(())
    }

    pub async fn remove_unavailability_template(&self, caller: &Caller, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.gate.read().await;
        let mut catalog = self.catalog.write().await;
        let template = catalog
            .unavailability
            .get(&id)
            .ok_or(EngineError::UnknownTemplate(id))?;
        match &template.trainer {
            Some(t) => require_calendar(caller, t)?,
            None => require_admin(caller, "facility-wide unavailability is admin only")?,
        }
        let event = Event::UnavailabilityTemplateRemoved { id };
        self.wal_append(&event).await?;
        catalog.apply(&event);
        Ok(())
    }

    // ── Session products ─────────────────────────────────

    pub async fn create_session_product(&self, caller: &Caller, product: SessionProduct) -> Result<(), EngineError> {
        require_admin(caller, "session products are admin only")?;
        validate_trainer(&product.trainer)?;
        if let Some(name) = &product.name
            && name.len() > MAX_NAME_LEN
        {
            return Err(EngineError::LimitExceeded("product name too long"));
        }
        if let Some(instance) = product.instance {
            session_span(instance.start, product.tier)?;
        }

        let _gate = self.gate.read().await;
        let mut catalog = self.catalog.write().await;
        if catalog.products.contains_key(&product.id) {
            return Err(EngineError::AlreadyExists(product.id));
        }
        if catalog.products.len() >= MAX_SESSION_PRODUCTS {
            return Err(EngineError::LimitExceeded("too many session products"));
        }
        let event = Event::SessionProductSaved { product };
        self.wal_append(&event).await?;
        catalog.apply(&event);
        Ok(())
    }

    pub async fn remove_session_product(&self, caller: &Caller, id: Ulid) -> Result<(), EngineError> {
        require_admin(caller, "session products are admin only")?;
        let _gate = self.gate.read().await;
        let mut catalog = self.catalog.write().await;
        let product = catalog
            .products
            .get(&id)
            .cloned()
            .ok_or(EngineError::UnknownProduct(id))?;
        let days: Vec<_> = self
            .days
            .iter()
            .filter(|e| e.key().0 == product.trainer)
            .map(|e| e.value().clone())
            .collect();
        for day in days {
            if day.read().await.bookings.iter().any(|b| b.product_id() == Some(id)) {
                return Err(EngineError::InUse(id));
            }
        }
        let event = Event::SessionProductRemoved { id };
        self.wal_append(&event).await?;
        catalog.apply(&event);
        Ok(())
    }

    // ── Class cells ──────────────────────────────────────

    /// Record a class occurrence in the grid cell containing `time`.
    /// Returns `false` (nothing written) when PT already occupies the cell.
    pub async fn claim_class_cell(&self, caller: &Caller, date: NaiveDate, time: Minute) -> Result<bool, EngineError> {
        require_admin(caller, "class timetable is admin only")?;
        if !(0..MINUTES_PER_DAY).contains(&time) {
            return Err(EngineError::InvalidTime(format_hhmm(time)));
        }
        let cell = self.policy.cell_of(time);

        let _gate = self.gate.read().await;
        let class_day = self.class_day(date);
        let mut class = class_day.write().await;
        if class.cells.contains(&cell) {
            return Ok(true);
        }
        for day in self.trainer_days_on(date) {
            let guard = day.read().await;
            if pt_occupies_cell(&guard.bookings, cell, &self.policy) {
                debug!("class claim {date} {} skipped: PT booked for {}", format_hhmm(cell), guard.trainer);
                return Ok(false);
            }
        }
        let event = Event::ClassCellClaimed { date, cell };
        self.wal_append(&event).await?;
        class.cells.insert(cell);
        Ok(true)
    }

    pub async fn release_class_cell(&self, caller: &Caller, date: NaiveDate, time: Minute) -> Result<bool, EngineError> {
        require_admin(caller, "class timetable is admin only")?;
        let cell = self.policy.cell_of(time);
        let _gate = self.gate.read().await;
        let Some(class_day) = self.class_days.get(&date).map(|d| d.value().clone()) else {
            return Ok(false);
        };
        let mut class = class_day.write().await;
        if !class.cells.contains(&cell) {
            return Ok(false);
        }
        let event = Event::ClassCellReleased { date, cell };
        self.wal_append(&event).await?;
        class.cells.remove(&cell);
        Ok(true)
    }

    // ── Credits ──────────────────────────────────────────

    /// Add credits to a member's tier. Returns the new balance.
    pub async fn grant_credits(
        &self,
        caller: &Caller,
        member: &str,
        tier: Tier,
        amount: i64,
        reason: LedgerReason,
    ) -> Result<i64, EngineError> {
        require_admin(caller, "credit grants are admin only")?;
        if !matches!(reason, LedgerReason::Purchase | LedgerReason::Complimentary) {
            return Err(EngineError::InvalidRange(
                "grant reason must be purchase or complimentary".into(),
            ));
        }
        if amount < 1 || amount > MAX_GRANT_AMOUNT {
            return Err(EngineError::InvalidAmount(amount));
        }
        if self.directory.lookup(member).await.is_none() {
            return Err(EngineError::MemberNotFound(member.to_string()));
        }

        let _gate = self.gate.read().await;
        let ledger = self.ledger(member);
        let mut ledger = ledger.lock().await;
        let grant = entry(member, tier, amount, reason, None);
        let event = Event::LedgerEntryRecorded {
            entry: grant.clone(),
        };
        self.wal_append(&event).await?;
        ledger.record(grant);
        let balance = ledger.balance(tier);
        info!("granted {amount} x {tier}-minute credits to {member} ({}), balance {balance}", reason.label());
        Ok(balance)
    }

    // ── Booking commit ───────────────────────────────────

    /// Validate, re-check against live state and persist one booking (with
    /// its credit debit, if credit-funded) as a single unit.
    pub async fn commit_booking(&self, caller: &Caller, request: BookingRequest) -> Result<CommitReceipt, EngineError> {
        let modality = request.modality();
        let id = request.id();
        let result = self.commit_inner(caller, request).await;
        match &result {
            Ok(receipt) => {
                metrics::counter!(crate::observability::BOOKINGS_COMMITTED_TOTAL, "modality" => modality.label())
                    .increment(1);
                info!(
                    "{} {id} committed: {} {} {} reserved {}m",
                    modality.label(),
                    receipt.trainer,
                    receipt.date,
                    format_hhmm(receipt.start),
                    receipt.reserved
                );
            }
            Err(e) => {
                metrics::counter!(crate::observability::BOOKINGS_REJECTED_TOTAL, "reason" => e.reason())
                    .increment(1);
                debug!("{} {id} rejected: {e}", modality.label());
            }
        }
        result
    }

    async fn commit_inner(&self, caller: &Caller, request: BookingRequest) -> Result<CommitReceipt, EngineError> {
        let id = request.id();
        let _claim = IdClaim::acquire(self, id)?;
        let payment = request.payment();
        let party = match &request {
            BookingRequest::Block { member, .. } | BookingRequest::Slot { member, .. } => {
                Party::Member(member.clone())
            }
            BookingRequest::Open { party, .. } => party.clone(),
        };
        match &party {
            Party::Guest(name) => {
                validate_name(name, "guest name is empty")?;
                if payment == PaymentMode::Credit {
                    return Err(EngineError::InvalidParty("guests cannot pay with credit"));
                }
                if matches!(caller, Caller::Member(_)) {
                    return Err(EngineError::Forbidden("members cannot book for guests"));
                }
            }
            Party::Member(member) => {
                if let Caller::Member(me) = caller
                    && me != member
                {
                    return Err(EngineError::Forbidden("members may only book for themselves"));
                }
                if self.directory.lookup(member).await.is_none() {
                    return Err(EngineError::MemberNotFound(member.clone()));
                }
            }
        }

        let _gate = self.gate.read().await;
        let catalog = self.catalog.read().await;
        let target = resolve_target(&catalog, &request)?;
        if let Caller::Trainer(_) = caller {
            require_calendar(caller, &target.trainer)?;
        }
        let session = session_span(target.start, target.tier)?;
        let unavailable = unavailable_on(catalog.unavailability.values(), &target.trainer, target.date);

        let class_day = self.class_day(target.date);
        let class = class_day.read().await;
        let day = self.trainer_day(&target.trainer, target.date);
        let mut day = day.write().await;
        if day.bookings.len() >= MAX_BOOKINGS_PER_DAY {
            return Err(EngineError::LimitExceeded("too many bookings for this trainer on this date"));
        }

        let reserved = match (&target.kind, &target.block) {
            (BookingKind::Block { .. }, Some(block)) => {
                let exclusions = block_exclusions(&day.bookings, &unavailable, &class.cells, &self.policy);
                check_block_fit(block, target.start, target.tier, &exclusions, &self.policy)?
            }
            (BookingKind::Slot { product_id }, _) => {
                if day.bookings.iter().any(|b| b.product_id() == Some(*product_id)) {
                    return Err(EngineError::SlotAlreadyClaimed(*product_id));
                }
                check_open_slot(target.date, session, &day.bookings, &unavailable, &class.cells, &self.policy)?;
                session.len()
            }
            _ => {
                check_open_slot(target.date, session, &day.bookings, &unavailable, &class.cells, &self.policy)?;
                session.len()
            }
        };

        let booking = Booking {
            id,
            trainer: target.trainer,
            date: target.date,
            start: target.start,
            tier: target.tier,
            reserved,
            party,
            payment,
            kind: target.kind,
        };
        let debit = booking_debit(&booking);

        let ledger = booking.party.member().map(|m| self.ledger(m));
        let mut ledger = match (&ledger, &debit) {
            (Some(l), Some(_)) => Some(l.lock().await),
            _ => None,
        };
        if let Some(l) = &ledger {
            let balance = l.balance(booking.tier);
            if balance < 1 {
                return Err(EngineError::InsufficientCredit {
                    tier: booking.tier,
                    balance,
                });
            }
        }

        let event = Event::BookingCommitted {
            booking: booking.clone(),
            debit: debit.clone(),
        };
        self.wal_append(&event).await?;

        let mut balance = None;
        if let (Some(l), Some(d)) = (ledger.as_mut(), debit) {
            l.record(d);
            balance = Some(l.balance(booking.tier));
        }
        let receipt = CommitReceipt {
            booking_id: id,
            trainer: booking.trainer.clone(),
            date: booking.date,
            start: booking.start,
            reserved: booking.reserved,
            balance,
        };
        self.apply_commit(&mut day, booking);
        Ok(receipt)
    }

    // ── Cancellation ─────────────────────────────────────

    /// Cancel any booking, reversing an outstanding credit debit. Repeating
    /// the cancel is a no-op.
    pub async fn cancel_booking(&self, caller: &Caller, id: Ulid) -> Result<CancelOutcome, EngineError> {
        let _gate = self.gate.read().await;
        if self.cancelled.contains_key(&id) {
            return Ok(CancelOutcome::AlreadyCancelled);
        }
        let (trainer, date) = self
            .booking_index
            .get(&id)
            .map(|k| k.value().clone())
            .ok_or(EngineError::NotFound(id))?;
        let day = self.trainer_day(&trainer, date);
        let mut day = day.write().await;
        let Some(booking) = day.get(id).cloned() else {
            // Lost a race with another cancel.
            return if self.cancelled.contains_key(&id) {
                Ok(CancelOutcome::AlreadyCancelled)
            } else {
                Err(EngineError::NotFound(id))
            };
        };
        match caller {
            Caller::Admin => {}
            Caller::Trainer(_) => require_calendar(caller, &booking.trainer)?,
            Caller::Member(m) => {
                if booking.party.member() != Some(m.as_str()) {
                    return Err(EngineError::Forbidden("members may only cancel their own bookings"));
                }
            }
        }

        let ledger = booking.party.member().map(|m| self.ledger(m));
        let mut ledger = match &ledger {
            Some(l) => Some(l.lock().await),
            None => None,
        };
        let refund = ledger.as_ref().and_then(|l| cancel_refund(l, &booking));

        let event = Event::BookingCancelled {
            id,
            trainer: trainer.clone(),
            date,
            refund: refund.clone(),
        };
        self.wal_append(&event).await?;
        self.apply_cancel(&mut day, id);

        let refunded = refund.is_some();
        let mut balance = None;
        if let Some(l) = ledger.as_mut() {
            if let Some(r) = refund {
                l.record(r);
            }
            balance = Some(l.balance(booking.tier));
        }
        metrics::counter!(crate::observability::BOOKINGS_CANCELLED_TOTAL).increment(1);
        info!("{} {id} cancelled (refunded: {refunded})", booking.modality().label());
        Ok(CancelOutcome::Cancelled {
            booking_id: id,
            refunded,
            balance,
        })
    }

    // ── Settlement ───────────────────────────────────────

    /// Post-session pass over elapsed member open bookings. Paid sessions dock
    /// one credit when the member has one; every processed booking is flagged
    /// so a rerun never touches it again.
    pub async fn settle_open_bookings(&self, caller: &Caller, now: NaiveDateTime) -> Result<SettlementReport, EngineError> {
        require_admin(caller, "settlement is admin only")?;
        let _gate = self.gate.read().await;

        let mut keys: Vec<_> = self
            .days
            .iter()
            .filter(|e| e.key().1 <= now.date())
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        keys.sort_by(|a, b| (a.0.1, &a.0.0).cmp(&(b.0.1, &b.0.0)));

        let mut report = SettlementReport::default();
        for ((trainer, date), day) in keys {
            let mut day = day.write().await;
            let due: Vec<Booking> = day
                .bookings
                .iter()
                .filter(|b| matches!(b.kind, BookingKind::Open { credit_docked: false, .. }))
                .filter(|b| b.party.member().is_some())
                .filter(|b| at_minute(b.date, b.session_span().end).is_some_and(|end| end <= now))
                .cloned()
                .collect();

            for booking in due {
                let Some(member) = booking.party.member() else { continue };
                let ledger = self.ledger(member);
                let mut ledger = ledger.lock().await;
                let before = ledger.balance(booking.tier);
                let dock = (booking.payment == PaymentMode::Paid && before >= 1).then(|| {
                    entry(member, booking.tier, -1, LedgerReason::SessionDock, Some(booking.id))
                });

                let event = Event::OpenBookingSettled {
                    id: booking.id,
                    trainer: trainer.clone(),
                    date,
                    dock: dock.clone(),
                };
                self.wal_append(&event).await?;
                self.apply_settled(&mut day, booking.id);
                let docked = dock.is_some();
                if let Some(d) = dock {
                    ledger.record(d);
                    report.docked += 1;
                }
                report.processed += 1;

                let balance = ledger.balance(booking.tier);
                if balance == 0 || (docked && balance == 1) {
                    warn!("member {member} is low on {}-minute credits: {balance} left", booking.tier);
                    metrics::counter!(crate::observability::CREDIT_ALERTS_TOTAL).increment(1);
                    report.alerts.push(CreditAlert {
                        member: member.to_string(),
                        tier: booking.tier,
                        balance,
                    });
                }
            }
        }
        info!(
            "settlement at {now}: processed {}, docked {}, {} alerts",
            report.processed,
            report.docked,
            report.alerts.len()
        );
        Ok(report)
    }

    // ── Recurring open bookings ──────────────────────────

    /// Book the same weekly open session for up to `MAX_RECURRING_WEEKS`
    /// weeks. Dates that fail the guard are skipped, not fatal.
    pub async fn generate_recurring_open_bookings(
        &self,
        caller: &Caller,
        request: RecurringOpenRequest,
    ) -> Result<RecurringReport, EngineError> {
        require_admin(caller, "recurring generation is admin only")?;
        if request.weekday > 6 {
            return Err(EngineError::InvalidWeekdays(request.weekday.to_string()));
        }
        let weeks = request.weeks.clamp(1, MAX_RECURRING_WEEKS);
        let tier = {
            let catalog = self.catalog.read().await;
            let product = catalog
                .products
                .get(&request.product_id)
                .ok_or(EngineError::UnknownProduct(request.product_id))?;
            if product.instance.is_some() {
                return Err(EngineError::ProductKindMismatch(product.id));
            }
            product.tier
        };

        let offset = (i64::from(request.weekday) - i64::from(weekday_index(request.from))).rem_euclid(7);
        let first = request.from + chrono::Duration::days(offset);

        let mut report = RecurringReport::default();
        for week in 0..i64::from(weeks) {
            let date = first + chrono::Duration::weeks(week);
            report.total += 1;
            let attempt = BookingRequest::Open {
                id: Ulid::new(),
                product_id: request.product_id,
                date,
                start: request.start,
                tier: Some(tier),
                party: request.party.clone(),
                payment: PaymentMode::Paid,
            };
            match self.commit_booking(caller, attempt).await {
                Ok(receipt) => {
                    report.inserted += 1;
                    report.booking_ids.push(receipt.booking_id);
                }
                Err(e @ EngineError::WalError(_)) => return Err(e),
                Err(e) => debug!("recurring booking on {date} skipped: {e}"),
            }
        }
        info!(
            "recurring open bookings for product {}: {}/{} inserted",
            request.product_id, report.inserted, report.total
        );
        Ok(report)
    }
}

fn resolve_target(catalog: &Catalog, request: &BookingRequest) -> Result<Target, EngineError> {
    match request {
        BookingRequest::Block {
            template_id,
            date,
            start,
            tier,
            ..
        } => {
            let template = catalog
                .availability
                .get(template_id)
                .ok_or(EngineError::UnknownTemplate(*template_id))?;
            let block = block_on(template, *date).ok_or_else(|| {
                EngineError::InvalidDate(format!("template {template_id} has no block on {date}"))
            })?;
            Ok(Target {
                trainer: template.trainer.clone(),
                date: *date,
                start: *start,
                tier: *tier,
                kind: BookingKind::Block {
                    template_id: *template_id,
                },
                block: Some(block),
            })
        }
        BookingRequest::Open {
            product_id,
            date,
            start,
            tier,
            ..
        } => {
            let product = catalog
                .products
                .get(product_id)
                .ok_or(EngineError::UnknownProduct(*product_id))?;
            if product.instance.is_some() {
                return Err(EngineError::ProductKindMismatch(*product_id));
            }
            if let Some(tier) = tier
                && *tier != product.tier
            {
                return Err(EngineError::DurationMismatch {
                    expected: product.tier,
                    got: *tier,
                });
            }
            Ok(Target {
                trainer: product.trainer.clone(),
                date: *date,
                start: *start,
                tier: product.tier,
                kind: BookingKind::Open {
                    product_id: *product_id,
                    credit_docked: false,
                },
                block: None,
            })
        }
        BookingRequest::Slot { product_id, .. } => {
            let product = catalog
                .products
                .get(product_id)
                .ok_or(EngineError::UnknownProduct(*product_id))?;
            let instance = product
                .instance
                .ok_or(EngineError::ProductKindMismatch(*product_id))?;
            Ok(Target {
                trainer: product.trainer.clone(),
                date: instance.date,
                start: instance.start,
                tier: product.tier,
                kind: BookingKind::Slot {
                    product_id: *product_id,
                },
                block: None,
            })
        }
    }
}
