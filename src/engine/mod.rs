//! Aggregation engine: thin orchestration above the ledger.
//!
//! Validates vendor input against the offer (quantity, home cell), lazily
//! opens group orders through the ledger's creation guard, schedules one
//! expiry check per group, and turns every terminal transition into exactly
//! one settlement dispatch. Settlement emission and websocket fan-out happen
//! after the ledger's exclusive section has been released.

pub mod expiry;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::catalog::{OfferCatalog, VendorDirectory};
use crate::error::EngineError;
use crate::ledger::group_order::MAX_COMMITMENT_QUANTITY;
use crate::ledger::{Applied, Ledger};
use crate::models::{Clock, GroupOrderKey, GroupSnapshot, Offer, WsServerEvent};
use crate::settlement::SettlementDispatcher;
use expiry::ExpiryScheduler;

pub struct AggregationEngine {
    ledger: Arc<Ledger>,
    catalog: Arc<dyn OfferCatalog>,
    directory: Arc<dyn VendorDirectory>,
    dispatcher: Arc<SettlementDispatcher>,
    scheduler: Arc<ExpiryScheduler>,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<WsServerEvent>,
}

impl AggregationEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ledger: Arc<Ledger>,
        catalog: Arc<dyn OfferCatalog>,
        directory: Arc<dyn VendorDirectory>,
        dispatcher: Arc<SettlementDispatcher>,
        clock: Arc<dyn Clock>,
        events: broadcast::Sender<WsServerEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            ledger,
            catalog,
            directory,
            dispatcher,
            scheduler: ExpiryScheduler::new(),
            clock,
            events,
        })
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn catalog(&self) -> &Arc<dyn OfferCatalog> {
        &self.catalog
    }

    /// Re-arms expiry checks for groups recovered from storage after a
    /// restart. Past-due deadlines fire immediately.
    pub fn reschedule_recovered(
        self: &Arc<Self>,
        recovered: Vec<(GroupOrderKey, String, i64)>,
    ) {
        for (key, group_id, deadline) in recovered {
            info!(key = %key, group_id = %group_id, deadline, "rescheduling recovered group");
            self.schedule_expiry(&key, &group_id, deadline);
        }
    }

    /// Resolves the offer and enforces vendor/offer cell consistency.
    fn resolve(&self, offer_id: &str, vendor_id: &str) -> Result<Arc<Offer>, EngineError> {
        let offer = self
            .catalog
            .offer(offer_id)
            .ok_or_else(|| EngineError::not_found(format!("offer {}", offer_id)))?;
        let vendor_cell = self
            .directory
            .home_cell(vendor_id)
            .ok_or_else(|| EngineError::not_found(format!("vendor {}", vendor_id)))?;
        if vendor_cell != offer.cell {
            return Err(EngineError::CellMismatch {
                vendor_cell,
                offer_cell: offer.cell.clone(),
            });
        }
        Ok(offer)
    }

    pub async fn join(
        self: &Arc<Self>,
        offer_id: &str,
        vendor_id: &str,
        quantity: u32,
    ) -> Result<GroupSnapshot, EngineError> {
        // Rejected before the ledger is touched.
        if quantity == 0 || quantity > MAX_COMMITMENT_QUANTITY {
            return Err(EngineError::InvalidQuantity { quantity });
        }
        let offer = self.resolve(offer_id, vendor_id)?;
        let key = GroupOrderKey::new(&offer.id, &offer.cell);

        let applied = self.ledger.join(&offer, vendor_id, quantity).await?;
        Ok(self.finish(&key, applied))
    }

    pub async fn modify(
        self: &Arc<Self>,
        offer_id: &str,
        vendor_id: &str,
        quantity: u32,
    ) -> Result<GroupSnapshot, EngineError> {
        if quantity == 0 || quantity > MAX_COMMITMENT_QUANTITY {
            return Err(EngineError::InvalidQuantity { quantity });
        }
        let offer = self.resolve(offer_id, vendor_id)?;
        let key = GroupOrderKey::new(&offer.id, &offer.cell);

        let applied = self.ledger.modify(&key, vendor_id, quantity).await?;
        Ok(self.finish(&key, applied))
    }

    pub async fn withdraw(
        self: &Arc<Self>,
        offer_id: &str,
        vendor_id: &str,
    ) -> Result<GroupSnapshot, EngineError> {
        let offer = self.resolve(offer_id, vendor_id)?;
        let key = GroupOrderKey::new(&offer.id, &offer.cell);

        let applied = self.ledger.withdraw(&key, vendor_id).await?;
        Ok(self.finish(&key, applied))
    }

    /// Live snapshot for progress-bar consumers; no cell check because a
    /// read is harmless across cells.
    pub async fn snapshot(
        &self,
        offer_id: &str,
        cell: &str,
    ) -> Result<GroupSnapshot, EngineError> {
        let key = GroupOrderKey::new(offer_id, cell);
        self.ledger
            .snapshot(&key)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("group order for {}", key)))
    }

    /// Deadline expiry entry point, invoked by the scheduler (and directly
    /// by tests). Safe to call repeatedly.
    pub async fn close_expired(
        self: &Arc<Self>,
        key: &GroupOrderKey,
        group_id: &str,
    ) -> Result<(), EngineError> {
        let Some(applied) = self.ledger.close_expired(key, group_id).await? else {
            return Ok(());
        };
        info!(key = %key, group_id = %group_id, "group order expired");
        self.finish(key, applied);
        Ok(())
    }

    /// Post-exclusive-section side effects: expiry scheduling for new
    /// groups, settlement dispatch for terminal transitions, snapshot
    /// fan-out. Only the operation that performed a transition carries its
    /// settlement, so dispatch happens at most once per group here; the
    /// store backstop catches restart replays.
    fn finish(self: &Arc<Self>, key: &GroupOrderKey, applied: Applied) -> GroupSnapshot {
        let Applied {
            snapshot,
            settlement,
            opened,
        } = applied;

        if let Some((group_id, deadline)) = opened {
            self.schedule_expiry(key, &group_id, deadline);
        }

        if let Some(record) = settlement {
            self.scheduler.cancel(&record.group_id);
            if let Err(e) = self.dispatcher.dispatch(record) {
                // The transition is already durable; a failed emission is
                // recoverable by replaying the settlements table.
                error!(key = %key, error = %e, "settlement dispatch failed");
            }
        }

        let _ = self.events.send(WsServerEvent::GroupUpdate(snapshot.clone()));
        snapshot
    }

    fn schedule_expiry(self: &Arc<Self>, key: &GroupOrderKey, group_id: &str, deadline: i64) {
        let delay_secs = (deadline - self.clock.now_ts()).max(0) as u64;
        let weak = Arc::downgrade(self);
        let key = key.clone();
        let id = group_id.to_string();
        self.scheduler.schedule(
            group_id,
            Duration::from_secs(delay_secs),
            async move {
                let Some(engine) = weak.upgrade() else {
                    return;
                };
                if let Err(e) = engine.close_expired(&key, &id).await {
                    warn!(key = %key, group_id = %id, error = %e, "expiry close failed");
                }
            },
        );
    }
}
