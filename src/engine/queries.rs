use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{block_exclusions, pt_occupies_cell};
use super::expand::{expand_availability, unavailable_on};
use super::intervals::{block_starts, free_intervals};
use super::mutations::{require_admin, require_member_access};
use super::{Engine, EngineError};

/// Live state of one trainer-date, copied out so no lock outlives the read.
struct DaySnapshot {
    bookings: Vec<Booking>,
    class_cells: BTreeSet<Minute>,
}

fn check_range(from: NaiveDate, to: NaiveDate) -> Result<(), EngineError> {
    if to < from {
        return Err(EngineError::InvalidRange(format!("{from} is after {to}")));
    }
    if (to - from).num_days() + 1 > MAX_QUERY_DAYS {
        return Err(EngineError::LimitExceeded("date range too wide"));
    }
    Ok(())
}

impl Engine {
    async fn snapshot_day(&self, trainer: &str, date: NaiveDate) -> DaySnapshot {
        let class_cells = match self.class_days.get(&date).map(|d| d.value().clone()) {
            Some(day) => day.read().await.cells.clone(),
            None => BTreeSet::new(),
        };
        let bookings = match self.existing_trainer_day(trainer, date) {
            Some(day) => day.read().await.bookings.clone(),
            None => Vec::new(),
        };
        DaySnapshot {
            bookings,
            class_cells,
        }
    }

    /// Expanded blocks in `[from, to]` with bookable starts per tier. For a
    /// member caller each block also carries that member's booking in it.
    pub async fn list_blocks(
        &self,
        caller: &Caller,
        from: NaiveDate,
        to: NaiveDate,
        trainer: Option<&str>,
    ) -> Result<Vec<BlockView>, EngineError> {
        check_range(from, to)?;
        let catalog = self.catalog.read().await;
        let blocks = expand_availability(
            catalog
                .availability
                .values()
                .filter(|t| trainer.is_none_or(|name| t.trainer == name)),
            from,
            to,
        );

        let mut snapshots: HashMap<(TrainerId, NaiveDate), DaySnapshot> = HashMap::new();
        let mut views = Vec::with_capacity(blocks.len());
        for block in blocks {
            let key = (block.trainer.clone(), block.date);
            if !snapshots.contains_key(&key) {
                let snap = self.snapshot_day(&block.trainer, block.date).await;
                snapshots.insert(key.clone(), snap);
            }
            let Some(snap) = snapshots.get(&key) else { continue };

            let unavailable = unavailable_on(catalog.unavailability.values(), &block.trainer, block.date);
            let exclusions = block_exclusions(&snap.bookings, &unavailable, &snap.class_cells, &self.policy);
            let free = free_intervals(block.span, &exclusions);
            let starts = Tier::ALL.map(|tier| block_starts(&free, tier, &self.policy));

            let my_booking = match caller {
                Caller::Member(me) => snap
                    .bookings
                    .iter()
                    .find(|b| {
                        b.template_id() == Some(block.template_id)
                            && b.party.member() == Some(me.as_str())
                            && block.span.contains_minute(b.start)
                    })
                    .cloned(),
                _ => None,
            };

            views.push(BlockView {
                block,
                starts,
                my_booking,
            });
        }
        Ok(views)
    }

    /// Staff view: each block split into free, booked and unavailable segments.
    pub async fn block_segments(
        &self,
        caller: &Caller,
        from: NaiveDate,
        to: NaiveDate,
        trainer: Option<&str>,
    ) -> Result<Vec<BlockSegments>, EngineError> {
        check_range(from, to)?;
        let trainer = match caller {
            Caller::Admin => trainer,
            Caller::Trainer(me) => match trainer {
                Some(t) if t != me.as_str() => {
                    return Err(EngineError::Forbidden("trainers may only view their own segments"));
                }
                _ => Some(me.as_str()),
            },
            Caller::Member(_) => return Err(EngineError::Forbidden("segments are staff only")),
        };

        let mut out = Vec::new();
        let mut member_bookings: HashSet<Ulid> = HashSet::new();
        {
            let catalog = self.catalog.read().await;
            let blocks = expand_availability(
                catalog
                    .availability
                    .values()
                    .filter(|t| trainer.is_none_or(|name| t.trainer == name)),
                from,
                to,
            );
            for block in blocks {
                let snap = self.snapshot_day(&block.trainer, block.date).await;
                let unavailable = unavailable_on(catalog.unavailability.values(), &block.trainer, block.date);
                let exclusions = block_exclusions(&snap.bookings, &unavailable, &snap.class_cells, &self.policy);

                let mut segments: Vec<Segment> = free_intervals(block.span, &exclusions)
                    .into_iter()
                    .map(|span| Segment {
                        span,
                        kind: SegmentKind::Free,
                    })
                    .collect();
                for b in &snap.bookings {
                    if let Some(span) = b.reserved_span().clip(&block.span) {
                        let occupant = match &b.party {
                            Party::Guest(name) => name.clone(),
                            Party::Member(id) => {
                                member_bookings.insert(b.id);
                                id.clone()
                            }
                        };
                        segments.push(Segment {
                            span,
                            kind: SegmentKind::Booked {
                                booking_id: b.id,
                                occupant,
                            },
                        });
                    }
                }
                for u in &unavailable {
                    if let Some(span) = u.span.clip(&block.span) {
                        segments.push(Segment {
                            span,
                            kind: SegmentKind::Unavailable {
                                reason: u.reason.clone(),
                            },
                        });
                    }
                }
                for &cell in &snap.class_cells {
                    if let Some(span) = Span::new(cell, cell + self.policy.grid).clip(&block.span) {
                        segments.push(Segment {
                            span,
                            kind: SegmentKind::Unavailable {
                                reason: "class".into(),
                            },
                        });
                    }
                }
                segments.sort_by_key(|s| (s.span.start, s.span.end));
                out.push(BlockSegments { block, segments });
            }
        }

        // Swap member ids for directory names once every lock is released.
        let mut names: HashMap<MemberId, String> = HashMap::new();
        for seg in out.iter_mut().flat_map(|b| b.segments.iter_mut()) {
            let SegmentKind::Booked { booking_id, occupant } = &mut seg.kind else { continue };
            if !member_bookings.contains(booking_id) {
                continue;
            }
            if let Some(name) = names.get(occupant.as_str()) {
                *occupant = name.clone();
                continue;
            }
            if let Some(profile) = self.directory.lookup(occupant).await
                && let Some(display) = profile.display_name
            {
                names.insert(occupant.clone(), display.clone());
                *occupant = display;
            }
        }
        Ok(out)
    }

    pub async fn credit_balance(&self, caller: &Caller, member: &str, tier: Tier) -> Result<i64, EngineError> {
        Ok(self.credit_balances(caller, member).await?[tier.index()])
    }

    /// Balances for all three tiers, indexed by `Tier::index`.
    pub async fn credit_balances(&self, caller: &Caller, member: &str) -> Result<[i64; 3], EngineError> {
        require_member_access(caller, member)?;
        let Some(ledger) = self.ledgers.get(member).map(|l| l.value().clone()) else {
            return Ok([0; 3]);
        };
        Ok(ledger.lock().await.balances())
    }

    /// Recompute every member's balances from their entries and report any
    /// tier where the cached value disagrees.
    pub async fn audit_ledgers(&self, caller: &Caller) -> Result<Vec<LedgerDrift>, EngineError> {
        require_admin(caller, "ledger audit is admin only")?;
        let ledgers: Vec<_> = self.ledgers.iter().map(|e| e.value().clone()).collect();
        let mut drift = Vec::new();
        for ledger in ledgers {
            drift.extend(ledger.lock().await.drift());
        }
        drift.sort_by(|a, b| (&a.member, a.tier).cmp(&(&b.member, b.tier)));
        Ok(drift)
    }

    /// Whether any PT booking touches the class grid cell containing `time`.
    pub async fn is_pt_occupied(&self, date: NaiveDate, time: Minute) -> bool {
        let cell = self.policy.cell_of(time);
        for day in self.trainer_days_on(date) {
            if pt_occupies_cell(&day.read().await.bookings, cell, &self.policy) {
                return true;
            }
        }
        false
    }

    pub async fn is_class_occupied(&self, date: NaiveDate, time: Minute) -> bool {
        let cell = self.policy.cell_of(time);
        match self.class_days.get(&date).map(|d| d.value().clone()) {
            Some(day) => day.read().await.cells.contains(&cell),
            None => false,
        }
    }

    pub async fn get_booking(&self, caller: &Caller, id: Ulid) -> Result<Booking, EngineError> {
        let (trainer, date) = self
            .booking_index
            .get(&id)
            .map(|k| k.value().clone())
            .ok_or(EngineError::NotFound(id))?;
        let day = self
            .existing_trainer_day(&trainer, date)
            .ok_or(EngineError::NotFound(id))?;
        let booking = day
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        let allowed = match caller {
            Caller::Admin => true,
            Caller::Trainer(t) => *t == booking.trainer,
            Caller::Member(m) => booking.party.member() == Some(m.as_str()),
        };
        if !allowed {
            return Err(EngineError::NotFound(id));
        }
        Ok(booking)
    }

    pub fn is_cancelled(&self, id: Ulid) -> bool {
        self.cancelled.contains_key(&id)
    }

    /// Active bookings of `trainer` on `date`, by start time.
    pub async fn bookings_on(&self, trainer: &str, date: NaiveDate) -> Vec<Booking> {
        match self.existing_trainer_day(trainer, date) {
            Some(day) => day.read().await.bookings.clone(),
            None => Vec::new(),
        }
    }
}
