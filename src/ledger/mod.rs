//! Group Order Ledger: the single authority over group order state.
//!
//! Every group order's mutable state lives behind its own `tokio::sync::Mutex`
//! in a sharded key map, so operations on the same group are serialized while
//! different groups proceed in parallel. The exclusive section is acquired
//! with bounded `try_lock` retries (exhaustion surfaces as transient `Busy`)
//! and contains no await points: mutation is clone-apply-persist-swap, so a
//! failed sqlite write leaves the in-memory aggregate untouched and no caller
//! ever observes a half-updated total/tier pair.

pub mod group_order;
pub mod store;

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::catalog::OfferCatalog;
use crate::error::EngineError;
use crate::models::{Clock, GroupOrderKey, GroupSnapshot, Offer};
use crate::settlement::SettlementRecord;
use group_order::GroupOrder;
use store::LedgerStore;

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub lock_retry_attempts: u32,
    pub lock_retry_delay_ms: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            lock_retry_attempts: 50,
            lock_retry_delay_ms: 2,
        }
    }
}

/// Outcome of an applied ledger operation.
#[derive(Debug)]
pub struct Applied {
    pub snapshot: GroupSnapshot,
    /// Present exactly when this operation performed the terminal
    /// transition; the caller (aggregation engine) emits it.
    pub settlement: Option<SettlementRecord>,
    /// `(group_id, deadline)` when this operation opened a fresh group;
    /// the caller schedules its expiry check.
    pub opened: Option<(String, i64)>,
}

struct Slot {
    current: Option<GroupOrder>,
    /// Set once a join has observed the current terminal group and been
    /// turned away with the retry hint; the next join supersedes it.
    terminal_observed: bool,
}

pub struct Ledger {
    slots: RwLock<HashMap<GroupOrderKey, Arc<Mutex<Slot>>>>,
    store: Arc<LedgerStore>,
    clock: Arc<dyn Clock>,
    cfg: LedgerConfig,
}

impl Ledger {
    pub fn new(store: Arc<LedgerStore>, clock: Arc<dyn Clock>, cfg: LedgerConfig) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            store,
            clock,
            cfg,
        }
    }

    pub fn store(&self) -> &Arc<LedgerStore> {
        &self.store
    }

    /// Loads OPEN groups from storage after a restart. Returns
    /// `(key, group_id, deadline)` per group so the engine can reschedule
    /// expiry checks (past-due deadlines fire immediately).
    pub fn recover(&self, catalog: &dyn OfferCatalog) -> anyhow::Result<Vec<(GroupOrderKey, String, i64)>> {
        let groups = self.store.load_open_groups(catalog)?;
        let mut recovered = Vec::with_capacity(groups.len());
        let mut slots = self.slots.write();
        for group in groups {
            let key = GroupOrderKey::new(&group.offer.id, &group.offer.cell);
            recovered.push((key.clone(), group.id.clone(), group.deadline));
            slots.insert(
                key,
                Arc::new(Mutex::new(Slot {
                    current: Some(group),
                    terminal_observed: false,
                })),
            );
        }
        if !recovered.is_empty() {
            info!(groups = recovered.len(), "open group orders recovered from storage");
        }
        Ok(recovered)
    }

    /// Get-or-insert the slot for a key. The map write lock makes slot
    /// creation race-free: at most one slot (and so at most one OPEN group)
    /// per key even under concurrent first joiners.
    fn slot(&self, key: &GroupOrderKey) -> Arc<Mutex<Slot>> {
        if let Some(slot) = self.slots.read().get(key) {
            return slot.clone();
        }
        self.slots
            .write()
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(Slot {
                    current: None,
                    terminal_observed: false,
                }))
            })
            .clone()
    }

    /// Acquires a group's exclusive section with bounded transparent
    /// retries. A caller cancelled here has had no effect; once the guard is
    /// held the operation runs to completion.
    async fn acquire(&self, key: &GroupOrderKey) -> Result<OwnedMutexGuard<Slot>, EngineError> {
        let slot = self.slot(key);
        for attempt in 0..self.cfg.lock_retry_attempts {
            match slot.clone().try_lock_owned() {
                Ok(guard) => return Ok(guard),
                Err(_) => {
                    debug!(key = %key, attempt, "group order contended, retrying");
                    tokio::time::sleep(Duration::from_millis(self.cfg.lock_retry_delay_ms)).await;
                }
            }
        }
        warn!(key = %key, "lock retries exhausted, returning busy");
        Err(EngineError::Busy)
    }

    /// Applies a mutation to the current group: clone, mutate, persist with
    /// an optimistic seq check, then swap in. All-or-nothing.
    fn apply<F>(
        &self,
        guard: &mut OwnedMutexGuard<Slot>,
        now: i64,
        mutate: F,
    ) -> Result<Applied, EngineError>
    where
        F: FnOnce(&mut GroupOrder) -> Result<(), EngineError>,
    {
        let current = guard
            .current
            .as_ref()
            .ok_or_else(|| EngineError::not_found("group order"))?;

        let prev_seq = current.seq;
        let mut next = current.clone();
        mutate(&mut next)?;

        self.store
            .persist_group(&next, prev_seq)
            .map_err(EngineError::Internal)?;

        let settlement = next.state.is_terminal().then(|| next.settlement(now));
        let snapshot = next.snapshot();
        guard.current = Some(next);
        guard.terminal_observed = false;

        Ok(Applied {
            snapshot,
            settlement,
            opened: None,
        })
    }

    /// Opens a fresh group for the key and applies the first join to it in
    /// one durable write.
    fn open_and_join(
        &self,
        guard: &mut OwnedMutexGuard<Slot>,
        offer: &Arc<Offer>,
        vendor_id: &str,
        quantity: u32,
        now: i64,
    ) -> Result<Applied, EngineError> {
        let mut group = GroupOrder::open(offer.clone(), now);
        group.join(vendor_id, quantity, now)?;

        self.store
            .persist_group(&group, 0)
            .map_err(EngineError::Internal)?;

        let opened = Some((group.id.clone(), group.deadline));
        let settlement = group.state.is_terminal().then(|| group.settlement(now));
        let snapshot = group.snapshot();
        guard.current = Some(group);
        guard.terminal_observed = false;

        Ok(Applied {
            snapshot,
            settlement,
            opened,
        })
    }

    /// Join the OPEN group for the offer's key, lazily opening one.
    ///
    /// A join that finds the current group already terminal is turned away
    /// once with `WindowClosed` and the retry hint (the tie-break loser path);
    /// the next join for the key supersedes the terminal group with a fresh
    /// window.
    pub async fn join(
        &self,
        offer: &Arc<Offer>,
        vendor_id: &str,
        quantity: u32,
    ) -> Result<Applied, EngineError> {
        let key = GroupOrderKey::new(&offer.id, &offer.cell);
        let mut guard = self.acquire(&key).await?;
        let now = self.clock.now_ts();

        let supersede = match guard.current.as_ref() {
            None => true,
            Some(g) if g.state.is_terminal() => {
                if !guard.terminal_observed {
                    guard.terminal_observed = true;
                    return Err(EngineError::WindowClosed {
                        retry_forms_new_group: true,
                    });
                }
                true
            }
            Some(_) => false,
        };

        if supersede {
            self.open_and_join(&mut guard, offer, vendor_id, quantity, now)
        } else {
            self.apply(&mut guard, now, |g| g.join(vendor_id, quantity, now))
        }
    }

    pub async fn modify(
        &self,
        key: &GroupOrderKey,
        vendor_id: &str,
        quantity: u32,
    ) -> Result<Applied, EngineError> {
        let mut guard = self.acquire(key).await?;
        let now = self.clock.now_ts();
        self.apply(&mut guard, now, |g| g.modify(vendor_id, quantity, now))
    }

    pub async fn withdraw(
        &self,
        key: &GroupOrderKey,
        vendor_id: &str,
    ) -> Result<Applied, EngineError> {
        let mut guard = self.acquire(key).await?;
        let now = self.clock.now_ts();
        self.apply(&mut guard, now, |g| g.withdraw(vendor_id, now))
    }

    /// Deadline-driven expiry for a specific group id. Idempotent: returns
    /// `None` (no settlement, nothing to emit) when the group is already
    /// terminal, superseded, or unknown; refuses to fire before the deadline.
    pub async fn close_expired(
        &self,
        key: &GroupOrderKey,
        group_id: &str,
    ) -> Result<Option<Applied>, EngineError> {
        let mut guard = self.acquire(key).await?;
        let now = self.clock.now_ts();

        let Some(current) = guard.current.as_ref() else {
            return Ok(None);
        };
        if current.id != group_id || current.state.is_terminal() {
            return Ok(None);
        }
        if now < current.deadline {
            warn!(key = %key, group_id = %group_id, "expiry fired before deadline, ignoring");
            return Ok(None);
        }

        let applied = self.apply(&mut guard, now, |g| {
            g.close_expired();
            Ok(())
        })?;
        Ok(Some(applied))
    }

    /// Live snapshot of the key's current group (open or most recent
    /// terminal), for progress-bar style consumers.
    pub async fn snapshot(&self, key: &GroupOrderKey) -> Result<Option<GroupSnapshot>, EngineError> {
        let guard = self.acquire(key).await?;
        Ok(guard.current.as_ref().map(|g| g.snapshot()))
    }

    /// Best-effort snapshots of every OPEN group (websocket replay on
    /// connect). Contended slots are skipped rather than awaited.
    pub fn open_snapshots(&self) -> Vec<GroupSnapshot> {
        let slots: Vec<_> = self.slots.read().values().cloned().collect();
        let mut out = Vec::new();
        for slot in slots {
            if let Ok(guard) = slot.try_lock() {
                if let Some(g) = guard.current.as_ref() {
                    if !g.state.is_terminal() {
                        out.push(g.snapshot());
                    }
                }
            }
        }
        out
    }

    #[cfg(test)]
    async fn hold_slot_for_test(&self, key: &GroupOrderKey) -> OwnedMutexGuard<Slot> {
        self.slot(key).lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::StaticCatalog;
    use crate::models::{GroupState, ManualClock};

    const T0: i64 = 1_700_000_000;

    fn ledger_with_clock() -> (Arc<Ledger>, Arc<ManualClock>, StaticCatalog) {
        let store = Arc::new(LedgerStore::in_memory().unwrap());
        let clock = Arc::new(ManualClock::new(T0));
        let ledger = Arc::new(Ledger::new(
            store,
            clock.clone(),
            LedgerConfig::default(),
        ));
        (ledger, clock, StaticCatalog::seed())
    }

    #[tokio::test]
    async fn first_join_opens_a_group() {
        let (ledger, _clock, catalog) = ledger_with_clock();
        let offer = catalog.offer("rice-basmati-25kg").unwrap();

        let applied = ledger.join(&offer, "raju-chaat", 1).await.unwrap();
        assert!(applied.opened.is_some());
        assert!(applied.settlement.is_none());
        assert_eq!(applied.snapshot.state, GroupState::Open);
        assert_eq!(applied.snapshot.total_quantity, 1);
        assert_eq!(applied.snapshot.deadline, T0 + 8 * 3600);

        // Second joiner lands in the same group.
        let applied = ledger.join(&offer, "anita-dosa", 1).await.unwrap();
        assert!(applied.opened.is_none());
        assert_eq!(applied.snapshot.total_quantity, 2);
    }

    #[tokio::test]
    async fn completing_join_carries_the_settlement() {
        let (ledger, _clock, catalog) = ledger_with_clock();
        let offer = catalog.offer("rice-basmati-25kg").unwrap();

        ledger.join(&offer, "raju-chaat", 1).await.unwrap();
        ledger.join(&offer, "anita-dosa", 1).await.unwrap();
        let applied = ledger.join(&offer, "mohan-juice", 1).await.unwrap();

        assert_eq!(applied.snapshot.state, GroupState::Complete);
        assert_eq!(applied.snapshot.unit_price_paise, 100_000);
        let settlement = applied.settlement.expect("completing join emits settlement");
        assert_eq!(settlement.lines.len(), 3);

        // The next join observes the closed window once, then a retry opens
        // a fresh group.
        let err = ledger.join(&offer, "sita-snacks", 1).await.unwrap_err();
        match err {
            EngineError::WindowClosed {
                retry_forms_new_group,
            } => assert!(retry_forms_new_group),
            other => panic!("expected WindowClosed, got {:?}", other),
        }

        let applied = ledger.join(&offer, "sita-snacks", 1).await.unwrap();
        assert!(applied.opened.is_some());
        assert_eq!(applied.snapshot.state, GroupState::Open);
        assert_eq!(applied.snapshot.total_quantity, 1);
    }

    #[tokio::test]
    async fn concurrent_joins_complete_exactly_once() {
        let (ledger, _clock, catalog) = ledger_with_clock();
        let offer = catalog.offer("rice-basmati-25kg").unwrap();

        let mut handles = Vec::new();
        for vendor in ["raju-chaat", "anita-dosa", "mohan-juice"] {
            let ledger = ledger.clone();
            let offer = offer.clone();
            handles.push(tokio::spawn(async move {
                ledger.join(&offer, vendor, 1).await
            }));
        }

        let mut complete_seen = 0;
        for handle in handles {
            let applied = handle.await.unwrap().expect("all three joins apply");
            if applied.snapshot.state == GroupState::Complete {
                complete_seen += 1;
                assert!(applied.settlement.is_some());
            } else {
                assert!(applied.settlement.is_none());
            }
        }
        assert_eq!(complete_seen, 1);
    }

    #[tokio::test]
    async fn modify_and_withdraw_roundtrip() {
        let (ledger, _clock, catalog) = ledger_with_clock();
        let offer = catalog.offer("rice-basmati-25kg").unwrap();
        let key = GroupOrderKey::new(&offer.id, &offer.cell);

        ledger.join(&offer, "raju-chaat", 2).await.unwrap();
        let applied = ledger.modify(&key, "raju-chaat", 5).await.unwrap();
        assert_eq!(applied.snapshot.total_quantity, 5);

        let applied = ledger.withdraw(&key, "raju-chaat").await.unwrap();
        assert_eq!(applied.snapshot.total_quantity, 0);
        assert_eq!(applied.snapshot.member_count, 0);
        assert_eq!(applied.snapshot.state, GroupState::Open);

        // Unknown key and unknown vendor are NotFound.
        let other = GroupOrderKey::new("nope", "110001");
        assert_eq!(
            ledger.modify(&other, "raju-chaat", 1).await.unwrap_err().code(),
            "not_found"
        );
        assert_eq!(
            ledger.withdraw(&key, "raju-chaat").await.unwrap_err().code(),
            "not_found"
        );
    }

    #[tokio::test]
    async fn expiry_respects_deadline_and_is_idempotent() {
        let (ledger, clock, catalog) = ledger_with_clock();
        let offer = catalog.offer("rice-basmati-25kg").unwrap();
        let key = GroupOrderKey::new(&offer.id, &offer.cell);

        let applied = ledger.join(&offer, "raju-chaat", 1).await.unwrap();
        let (group_id, deadline) = applied.opened.unwrap();

        // Too early: refused.
        assert!(ledger
            .close_expired(&key, &group_id)
            .await
            .unwrap()
            .is_none());

        clock.set(deadline);
        let applied = ledger
            .close_expired(&key, &group_id)
            .await
            .unwrap()
            .expect("deadline reached");
        assert_eq!(applied.snapshot.state, GroupState::Expired);
        let settlement = applied.settlement.unwrap();
        assert!(settlement.lines.is_empty());

        // Duplicate firing: no-op, no second settlement.
        assert!(ledger
            .close_expired(&key, &group_id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn stale_expiry_for_superseded_group_is_ignored() {
        let (ledger, clock, catalog) = ledger_with_clock();
        let offer = catalog.offer("rice-basmati-25kg").unwrap();
        let key = GroupOrderKey::new(&offer.id, &offer.cell);

        let applied = ledger.join(&offer, "raju-chaat", 1).await.unwrap();
        let (old_id, deadline) = applied.opened.unwrap();

        clock.set(deadline);
        ledger.close_expired(&key, &old_id).await.unwrap().unwrap();

        // Retry-once, then a fresh group forms.
        assert!(ledger.join(&offer, "raju-chaat", 1).await.is_err());
        let applied = ledger.join(&offer, "raju-chaat", 1).await.unwrap();
        let (new_id, _) = applied.opened.unwrap();
        assert_ne!(new_id, old_id);

        // A very late timer for the old group must not touch the new one.
        assert!(ledger
            .close_expired(&key, &old_id)
            .await
            .unwrap()
            .is_none());
        let snap = ledger.snapshot(&key).await.unwrap().unwrap();
        assert_eq!(snap.group_id, new_id);
        assert_eq!(snap.state, GroupState::Open);
    }

    #[tokio::test]
    async fn contended_slot_surfaces_busy() {
        let store = Arc::new(LedgerStore::in_memory().unwrap());
        let clock = Arc::new(ManualClock::new(T0));
        let ledger = Arc::new(Ledger::new(
            store,
            clock,
            LedgerConfig {
                lock_retry_attempts: 2,
                lock_retry_delay_ms: 1,
            },
        ));
        let catalog = StaticCatalog::seed();
        let offer = catalog.offer("rice-basmati-25kg").unwrap();
        let key = GroupOrderKey::new(&offer.id, &offer.cell);

        let _held = ledger.hold_slot_for_test(&key).await;
        let err = ledger.join(&offer, "raju-chaat", 1).await.unwrap_err();
        assert_eq!(err.code(), "busy");
    }

    #[tokio::test]
    async fn recovery_reloads_open_groups() {
        let catalog = StaticCatalog::seed();
        let store = Arc::new(LedgerStore::in_memory().unwrap());
        let clock = Arc::new(ManualClock::new(T0));

        let group_id = {
            let ledger = Ledger::new(store.clone(), clock.clone(), LedgerConfig::default());
            let offer = catalog.offer("rice-basmati-25kg").unwrap();
            let applied = ledger.join(&offer, "raju-chaat", 2).await.unwrap();
            applied.snapshot.group_id
        };

        // A new ledger over the same store picks the group back up.
        let ledger = Ledger::new(store, clock, LedgerConfig::default());
        let recovered = ledger.recover(&catalog).unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].1, group_id);

        let key = GroupOrderKey::new("rice-basmati-25kg", "110001");
        let snap = ledger.snapshot(&key).await.unwrap().unwrap();
        assert_eq!(snap.group_id, group_id);
        assert_eq!(snap.total_quantity, 2);
        assert_eq!(snap.state, GroupState::Open);
    }
}
