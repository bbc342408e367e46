//! Group order aggregate and lifecycle state machine.
//!
//! All mutation here is pure and synchronous; the ledger wraps it in a
//! per-group exclusive section and persists the result. Cached totals and
//! tier are recomputed on every applied mutation so no caller can observe a
//! half-updated total/tier pair.
//!
//! Lifecycle: OPEN -> COMPLETE when the accumulated quantity reaches the
//! deepest tier's minimum AND the distinct active vendor count reaches the
//! supplier's minimum group size (both required; quantity alone never closes
//! a group) -- or OPEN -> EXPIRED when the deadline passes first. Terminal
//! states are frozen.

use std::sync::Arc;
use uuid::Uuid;

use crate::error::EngineError;
use crate::models::{Commitment, CommitmentStatus, GroupSnapshot, GroupState, Offer};
use crate::pricing::resolve_tier;
use crate::settlement::{settlement_id_for, SettlementLine, SettlementOutcome, SettlementRecord};

/// Quantity caps, enforced before any mutation. Street-vendor commitments
/// are tens of units; the caps keep every u32 total far from overflow, so
/// tier resolution and per-vendor charges stay exact.
pub const MAX_COMMITMENT_QUANTITY: u32 = 10_000;
pub const MAX_GROUP_QUANTITY: u32 = 50_000;

#[derive(Debug, Clone)]
pub struct GroupOrder {
    pub id: String,
    pub offer: Arc<Offer>,
    pub created_at: i64,
    pub deadline: i64,
    /// Append-only: withdrawn rows stay; a re-join adds a new row.
    pub commitments: Vec<Commitment>,
    pub total_quantity: u32,
    pub tier_index: i32,
    pub unit_price_paise: i64,
    pub state: GroupState,
    /// Monotone version, bumped on every applied mutation. Used by the
    /// store to reject stale writes after a restart.
    pub seq: u64,
}

impl GroupOrder {
    /// Opens a fresh group order for the offer's key. Creation counts as the
    /// first version (`seq == 1`).
    pub fn open(offer: Arc<Offer>, now: i64) -> Self {
        let deadline = now + offer.window_secs;
        let (unit_price_paise, tier_index) = resolve_tier(&offer, 0);
        Self {
            id: Uuid::new_v4().to_string(),
            offer,
            created_at: now,
            deadline,
            commitments: Vec::new(),
            total_quantity: 0,
            tier_index,
            unit_price_paise,
            state: GroupState::Open,
            seq: 1,
        }
    }

    fn active_index(&self, vendor_id: &str) -> Option<usize> {
        self.commitments
            .iter()
            .position(|c| c.status == CommitmentStatus::Active && c.vendor_id == vendor_id)
    }

    /// Distinct active vendors. One ACTIVE commitment per vendor is an
    /// aggregate invariant, so the active row count is the vendor count.
    pub fn member_count(&self) -> u32 {
        self.commitments
            .iter()
            .filter(|c| c.status == CommitmentStatus::Active)
            .count() as u32
    }

    fn recompute(&mut self) {
        self.total_quantity = self
            .commitments
            .iter()
            .filter(|c| c.status == CommitmentStatus::Active)
            .map(|c| c.quantity)
            .sum();
        let (price, index) = resolve_tier(&self.offer, self.total_quantity);
        self.unit_price_paise = price;
        self.tier_index = index;
    }

    /// Evaluates the COMPLETE transition after an add-like action. Returns
    /// true when this call performed the transition.
    fn maybe_complete(&mut self) -> bool {
        if self.state != GroupState::Open {
            return false;
        }
        let Some(target) = self.offer.completion_quantity() else {
            // Base-price-only offers never complete; they expire.
            return false;
        };
        if self.total_quantity >= target && self.member_count() >= self.offer.min_vendors {
            self.state = GroupState::Complete;
            return true;
        }
        false
    }

    fn guard_open(&self) -> Result<(), EngineError> {
        if self.state.is_terminal() {
            // A terminal group is superseded, never reused: the next join on
            // this key opens a fresh window.
            return Err(EngineError::WindowClosed {
                retry_forms_new_group: true,
            });
        }
        Ok(())
    }

    /// Adds a new ACTIVE commitment for the vendor.
    pub fn join(&mut self, vendor_id: &str, quantity: u32, now: i64) -> Result<(), EngineError> {
        self.guard_open()?;
        if quantity == 0 || quantity > MAX_COMMITMENT_QUANTITY {
            return Err(EngineError::InvalidQuantity { quantity });
        }
        if self.active_index(vendor_id).is_some() {
            return Err(EngineError::AlreadyCommitted {
                vendor_id: vendor_id.to_string(),
            });
        }
        if u64::from(self.total_quantity) + u64::from(quantity) > u64::from(MAX_GROUP_QUANTITY) {
            return Err(EngineError::InvalidQuantity { quantity });
        }

        self.commitments.push(Commitment {
            vendor_id: vendor_id.to_string(),
            quantity,
            joined_at: now,
            updated_at: now,
            status: CommitmentStatus::Active,
        });
        self.recompute();
        self.maybe_complete();
        self.seq += 1;
        Ok(())
    }

    /// Replaces the vendor's active quantity in place (no double count).
    pub fn modify(&mut self, vendor_id: &str, quantity: u32, now: i64) -> Result<(), EngineError> {
        self.guard_open()?;
        if quantity == 0 || quantity > MAX_COMMITMENT_QUANTITY {
            return Err(EngineError::InvalidQuantity { quantity });
        }
        let idx = self.active_index(vendor_id).ok_or_else(|| {
            EngineError::not_found(format!("active commitment for vendor {}", vendor_id))
        })?;
        let remainder = self.total_quantity - self.commitments[idx].quantity;
        if u64::from(remainder) + u64::from(quantity) > u64::from(MAX_GROUP_QUANTITY) {
            return Err(EngineError::InvalidQuantity { quantity });
        }

        self.commitments[idx].quantity = quantity;
        self.commitments[idx].updated_at = now;
        self.recompute();
        self.maybe_complete();
        self.seq += 1;
        Ok(())
    }

    /// Marks the vendor's commitment WITHDRAWN. Withdrawal never completes a
    /// group, but a previously-met tier downgrades immediately.
    pub fn withdraw(&mut self, vendor_id: &str, now: i64) -> Result<(), EngineError> {
        self.guard_open()?;
        let idx = self.active_index(vendor_id).ok_or_else(|| {
            EngineError::not_found(format!("active commitment for vendor {}", vendor_id))
        })?;

        self.commitments[idx].status = CommitmentStatus::Withdrawn;
        self.commitments[idx].updated_at = now;
        self.recompute();
        self.seq += 1;
        Ok(())
    }

    /// OPEN -> EXPIRED, releasing all commitments (no charge). Idempotent:
    /// returns false without mutation when the group is already terminal.
    pub fn close_expired(&mut self) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = GroupState::Expired;
        self.seq += 1;
        true
    }

    /// Terminal snapshot for billing/delivery. Must only be called once the
    /// group is terminal; line order is join order.
    pub fn settlement(&self, now: i64) -> SettlementRecord {
        debug_assert!(self.state.is_terminal());
        let (outcome, unit_price_paise, lines) = match self.state {
            GroupState::Complete => {
                let lines = self
                    .commitments
                    .iter()
                    .filter(|c| c.status == CommitmentStatus::Active)
                    .map(|c| SettlementLine {
                        vendor_id: c.vendor_id.clone(),
                        quantity: c.quantity,
                        charge_paise: i64::from(c.quantity) * self.unit_price_paise,
                    })
                    .collect();
                (
                    SettlementOutcome::Complete,
                    Some(self.unit_price_paise),
                    lines,
                )
            }
            _ => (SettlementOutcome::Expired, None, Vec::new()),
        };

        SettlementRecord {
            settlement_id: settlement_id_for(&self.id),
            group_id: self.id.clone(),
            offer_id: self.offer.id.clone(),
            cell: self.offer.cell.clone(),
            outcome,
            unit_price_paise,
            lines,
            settled_at: now,
        }
    }

    pub fn snapshot(&self) -> GroupSnapshot {
        GroupSnapshot {
            group_id: self.id.clone(),
            offer_id: self.offer.id.clone(),
            cell: self.offer.cell.clone(),
            state: self.state,
            member_count: self.member_count(),
            min_vendors: self.offer.min_vendors,
            total_quantity: self.total_quantity,
            completion_quantity: self.offer.completion_quantity(),
            unit_price_paise: self.unit_price_paise,
            tier_index: self.tier_index,
            base_price_paise: self.offer.base_price_paise,
            created_at: self.created_at,
            deadline: self.deadline,
            seq: self.seq,
        }
    }

    /// Aggregate invariant check used by tests: cached total equals the sum
    /// of active commitment quantities.
    #[cfg(test)]
    fn assert_consistent(&self) {
        let expected: u32 = self
            .commitments
            .iter()
            .filter(|c| c.status == CommitmentStatus::Active)
            .map(|c| c.quantity)
            .sum();
        assert_eq!(self.total_quantity, expected);
        let (price, index) = resolve_tier(&self.offer, self.total_quantity);
        assert_eq!(self.unit_price_paise, price);
        assert_eq!(self.tier_index, index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PriceTier;

    const T0: i64 = 1_700_000_000;

    fn rice_offer() -> Arc<Offer> {
        Arc::new(Offer {
            id: "rice-basmati-25kg".into(),
            supplier: "FreshFarm Supplies".into(),
            product: "Premium Basmati Rice".into(),
            unit_label: "25kg bag".into(),
            base_price_paise: 120_000,
            tiers: vec![PriceTier {
                min_quantity: 3,
                unit_price_paise: 100_000,
            }],
            cell: "110001".into(),
            window_secs: 8 * 3600,
            min_vendors: 3,
        })
    }

    #[test]
    fn three_vendors_complete_the_rice_group() {
        let mut group = GroupOrder::open(rice_offer(), T0);
        assert_eq!(group.deadline, T0 + 8 * 3600);

        group.join("raju-chaat", 1, T0).unwrap();
        group.assert_consistent();
        assert_eq!(group.total_quantity, 1);
        assert_eq!(group.unit_price_paise, 120_000);
        assert_eq!(group.state, GroupState::Open);

        group.join("anita-dosa", 1, T0 + 60).unwrap();
        assert_eq!(group.total_quantity, 2);
        assert_eq!(group.unit_price_paise, 120_000);

        group.join("mohan-juice", 1, T0 + 120).unwrap();
        group.assert_consistent();
        assert_eq!(group.total_quantity, 3);
        assert_eq!(group.member_count(), 3);
        assert_eq!(group.unit_price_paise, 100_000);
        assert_eq!(group.tier_index, 0);
        assert_eq!(group.state, GroupState::Complete);

        let record = group.settlement(T0 + 120);
        assert_eq!(record.unit_price_paise, Some(100_000));
        assert_eq!(record.lines.len(), 3);
        for line in &record.lines {
            assert_eq!(line.charge_paise, 100_000);
        }
        // Line order is join order.
        assert_eq!(record.lines[0].vendor_id, "raju-chaat");
        assert_eq!(record.lines[2].vendor_id, "mohan-juice");
    }

    #[test]
    fn quantity_alone_does_not_complete() {
        // One vendor buying 10 bags crosses the tier but not the minimum
        // group size of 3 distinct vendors.
        let mut group = GroupOrder::open(rice_offer(), T0);
        group.join("raju-chaat", 10, T0).unwrap();
        assert_eq!(group.state, GroupState::Open);
        assert_eq!(group.unit_price_paise, 100_000); // tier price still applies to the pool
    }

    #[test]
    fn vendor_count_alone_does_not_complete() {
        let mut offer = (*rice_offer()).clone();
        offer.tiers = vec![PriceTier {
            min_quantity: 10,
            unit_price_paise: 100_000,
        }];
        let mut group = GroupOrder::open(Arc::new(offer), T0);
        group.join("raju-chaat", 1, T0).unwrap();
        group.join("anita-dosa", 1, T0).unwrap();
        group.join("mohan-juice", 1, T0).unwrap();
        assert_eq!(group.member_count(), 3);
        assert_eq!(group.state, GroupState::Open);
    }

    #[test]
    fn modify_replaces_without_double_count() {
        let mut group = GroupOrder::open(rice_offer(), T0);
        group.join("raju-chaat", 2, T0).unwrap();
        group.join("anita-dosa", 1, T0).unwrap();

        group.modify("raju-chaat", 5, T0 + 60).unwrap();
        group.assert_consistent();
        assert_eq!(group.total_quantity, 6);
        assert_eq!(group.commitments.len(), 2);
    }

    #[test]
    fn duplicate_join_and_missing_modify_are_rejected() {
        let mut group = GroupOrder::open(rice_offer(), T0);
        group.join("raju-chaat", 1, T0).unwrap();

        let err = group.join("raju-chaat", 1, T0).unwrap_err();
        assert_eq!(err.code(), "already_committed");

        let err = group.modify("anita-dosa", 2, T0).unwrap_err();
        assert_eq!(err.code(), "not_found");

        let err = group.withdraw("anita-dosa", T0).unwrap_err();
        assert_eq!(err.code(), "not_found");

        let err = group.join("anita-dosa", 0, T0).unwrap_err();
        assert_eq!(err.code(), "invalid_quantity");

        // Rejected calls must not bump the version or the totals.
        assert_eq!(group.seq, 2);
        assert_eq!(group.total_quantity, 1);
    }

    #[test]
    fn oversized_quantities_are_rejected_before_mutation() {
        let mut group = GroupOrder::open(rice_offer(), T0);

        // A huge first commitment is rejected outright, so a later small
        // join can never push the total past u32 range.
        let err = group.join("raju-chaat", u32::MAX, T0).unwrap_err();
        assert_eq!(err.code(), "invalid_quantity");
        let err = group.join("raju-chaat", MAX_COMMITMENT_QUANTITY + 1, T0).unwrap_err();
        assert_eq!(err.code(), "invalid_quantity");

        group.join("raju-chaat", MAX_COMMITMENT_QUANTITY, T0).unwrap();
        group.join("anita-dosa", 2, T0).unwrap();
        group.assert_consistent();
        assert_eq!(group.total_quantity, MAX_COMMITMENT_QUANTITY + 2);

        let err = group.modify("anita-dosa", u32::MAX, T0).unwrap_err();
        assert_eq!(err.code(), "invalid_quantity");
        group.assert_consistent();
        assert_eq!(group.total_quantity, MAX_COMMITMENT_QUANTITY + 2);
    }

    #[test]
    fn group_total_cap_bounds_joins_and_modifies() {
        let mut offer = (*rice_offer()).clone();
        offer.min_vendors = 100; // keep the group open while it fills
        let mut group = GroupOrder::open(Arc::new(offer), T0);

        for vendor in ["v0", "v1", "v2", "v3"] {
            group.join(vendor, MAX_COMMITMENT_QUANTITY, T0).unwrap();
        }
        group.join("v4", 3_000, T0).unwrap();
        group.join("v5", 1, T0).unwrap();
        group.assert_consistent();

        // 43_001 committed; another full-cap commitment would cross the
        // group cap, whether joined or modified into place.
        let err = group.join("v6", MAX_COMMITMENT_QUANTITY, T0).unwrap_err();
        assert_eq!(err.code(), "invalid_quantity");
        let err = group
            .modify("v5", MAX_COMMITMENT_QUANTITY, T0)
            .unwrap_err();
        assert_eq!(err.code(), "invalid_quantity");

        // Staying at or under the cap is fine.
        group.modify("v5", 5_000, T0).unwrap();
        group.assert_consistent();
        assert_eq!(group.total_quantity, 48_000);
    }

    #[test]
    fn withdraw_downgrades_tier_and_rejoin_appends() {
        let mut offer = (*rice_offer()).clone();
        offer.min_vendors = 4; // keep the group open past the tier quantity
        let mut group = GroupOrder::open(Arc::new(offer), T0);

        group.join("raju-chaat", 2, T0).unwrap();
        group.join("anita-dosa", 2, T0).unwrap();
        assert_eq!(group.unit_price_paise, 100_000);

        group.withdraw("anita-dosa", T0 + 60).unwrap();
        group.assert_consistent();
        assert_eq!(group.total_quantity, 2);
        assert_eq!(group.unit_price_paise, 120_000); // tier lost immediately
        assert_eq!(group.tier_index, -1);
        assert_eq!(group.state, GroupState::Open);

        // Re-join creates a new commitment record; history is preserved.
        group.join("anita-dosa", 1, T0 + 120).unwrap();
        assert_eq!(group.commitments.len(), 3);
        assert_eq!(group.member_count(), 2);
        assert_eq!(
            group.commitments[1].status,
            CommitmentStatus::Withdrawn
        );
    }

    #[test]
    fn withdraw_never_completes() {
        let mut offer = (*rice_offer()).clone();
        offer.min_vendors = 2;
        let mut group = GroupOrder::open(Arc::new(offer), T0);
        group.join("raju-chaat", 2, T0).unwrap();
        group.join("anita-dosa", 1, T0).unwrap();
        assert_eq!(group.state, GroupState::Complete);

        // Terminal group rejects everything with the retry hint.
        let err = group.withdraw("raju-chaat", T0).unwrap_err();
        match err {
            EngineError::WindowClosed {
                retry_forms_new_group,
            } => assert!(retry_forms_new_group),
            other => panic!("expected WindowClosed, got {:?}", other),
        }
    }

    #[test]
    fn close_expired_is_idempotent() {
        let mut group = GroupOrder::open(rice_offer(), T0);
        group.join("raju-chaat", 1, T0).unwrap();
        let seq_before = group.seq;

        assert!(group.close_expired());
        assert_eq!(group.state, GroupState::Expired);
        assert_eq!(group.seq, seq_before + 1);

        // Second firing is a no-op.
        assert!(!group.close_expired());
        assert_eq!(group.seq, seq_before + 1);

        let record = group.settlement(T0 + 8 * 3600);
        assert_eq!(record.outcome, SettlementOutcome::Expired);
        assert!(record.lines.is_empty());
        assert_eq!(record.unit_price_paise, None);
    }

    #[test]
    fn complete_group_is_frozen() {
        let mut group = GroupOrder::open(rice_offer(), T0);
        group.join("raju-chaat", 1, T0).unwrap();
        group.join("anita-dosa", 1, T0).unwrap();
        group.join("mohan-juice", 1, T0).unwrap();
        assert_eq!(group.state, GroupState::Complete);

        assert!(group.join("sita-snacks", 1, T0).is_err());
        assert!(group.modify("raju-chaat", 4, T0).is_err());
        // Late expiry timer firing after completion is harmless.
        assert!(!group.close_expired());
        assert_eq!(group.state, GroupState::Complete);
    }

    #[test]
    fn modify_can_trigger_completion() {
        let mut offer4 = (*rice_offer()).clone();
        offer4.tiers[0].min_quantity = 4;
        let mut group = GroupOrder::open(Arc::new(offer4), T0);
        group.join("raju-chaat", 1, T0).unwrap();
        group.join("anita-dosa", 1, T0).unwrap();
        group.join("mohan-juice", 1, T0).unwrap();
        assert_eq!(group.state, GroupState::Open);

        group.modify("raju-chaat", 2, T0 + 60).unwrap();
        assert_eq!(group.state, GroupState::Complete);
        assert_eq!(group.total_quantity, 4);
    }

    #[test]
    fn snapshot_mirrors_aggregate() {
        let mut group = GroupOrder::open(rice_offer(), T0);
        group.join("raju-chaat", 2, T0).unwrap();
        let snap = group.snapshot();
        assert_eq!(snap.group_id, group.id);
        assert_eq!(snap.member_count, 1);
        assert_eq!(snap.total_quantity, 2);
        assert_eq!(snap.completion_quantity, Some(3));
        assert_eq!(snap.unit_price_paise, 120_000);
        assert_eq!(snap.deadline, T0 + 8 * 3600);
        assert_eq!(snap.seq, 2);
    }
}
