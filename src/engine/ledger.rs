use ulid::Ulid;

use crate::model::*;

use super::conflict::now_ms;

/// Append-only credit history of one member with cached per-tier balances.
#[derive(Debug)]
pub struct MemberLedger {
    member: MemberId,
    entries: Vec<LedgerEntry>,
    balances: [i64; 3],
}

impl MemberLedger {
    pub fn new(member: MemberId) -> Self {
        Self {
            member,
            entries: Vec::new(),
            balances: [0; 3],
        }
    }

    pub fn member(&self) -> &str {
        &self.member
    }

    pub fn record(&mut self, entry: LedgerEntry) {
        self.balances[entry.tier.index()] += entry.amount;
        self.entries.push(entry);
    }

    /// Cached balance for `tier`.
    pub fn balance(&self, tier: Tier) -> i64 {
        self.balances[tier.index()]
    }

    pub fn balances(&self) -> [i64; 3] {
        self.balances
    }

    /// Balance for `tier` summed from the entries themselves.
    pub fn recompute(&self, tier: Tier) -> i64 {
        self.entries
            .iter()
            .filter(|e| e.tier == tier)
            .map(|e| e.amount)
            .sum()
    }

    /// Net amount of every entry tied to `booking`. Negative while a debit
    /// is outstanding.
    pub fn net_for_booking(&self, booking: Ulid) -> i64 {
        self.entries
            .iter()
            .filter(|e| e.reference == Some(booking))
            .map(|e| e.amount)
            .sum()
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    /// Tiers whose cached balance disagrees with the entries.
    pub fn drift(&self) -> Vec<LedgerDrift> {
        Tier::ALL
            .into_iter()
            .filter_map(|tier| {
                let cached = self.balance(tier);
                let actual = self.recompute(tier);
                (cached != actual).then(|| LedgerDrift {
                    member: self.member.clone(),
                    tier,
                    cached,
                    actual,
                })
            })
            .collect()
    }

    /// Test hook: corrupt the cache to exercise drift detection.
    #[cfg(test)]
    pub(super) fn skew_cache(&mut self, tier: Tier, delta: i64) {
        self.balances[tier.index()] += delta;
    }
}

pub(super) fn entry(
    member: &str,
    tier: Tier,
    amount: i64,
    reason: LedgerReason,
    reference: Option<Ulid>,
) -> LedgerEntry {
    LedgerEntry {
        id: Ulid::new(),
        member: member.to_string(),
        tier,
        amount,
        reason,
        reference,
        recorded_at: now_ms(),
    }
}

/// The single `-1` written alongside a credit-funded booking.
pub(super) fn booking_debit(booking: &Booking) -> Option<LedgerEntry> {
    if booking.payment != PaymentMode::Credit {
        return None;
    }
    let member = booking.party.member()?;
    Some(entry(
        member,
        booking.tier,
        -1,
        LedgerReason::Booking(booking.modality()),
        Some(booking.id),
    ))
}

/// Reversal for a cancelled booking: whatever is still owed on it, never more.
pub(super) fn cancel_refund(ledger: &MemberLedger, booking: &Booking) -> Option<LedgerEntry> {
    let outstanding = ledger.net_for_booking(booking.id);
    (outstanding < 0).then(|| {
        entry(
            ledger.member(),
            booking.tier,
            -outstanding,
            LedgerReason::BookingCancel(booking.modality()),
            Some(booking.id),
        )
    })
}
