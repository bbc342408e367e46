//! SQLite persistence for group orders, commitments, and settlements.
//!
//! Writes happen inside a group's exclusive section, so every method here is
//! synchronous (parking_lot mutex around one WAL connection, short critical
//! sections). Group rows carry a monotone `seq`; updates are optimistic
//! (`WHERE seq = ?`) so a stale in-memory aggregate after a restart can
//! never clobber newer state.

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use crate::catalog::OfferCatalog;
use crate::ledger::group_order::GroupOrder;
use crate::models::{Commitment, CommitmentStatus, GroupState};
use crate::pricing::resolve_tier;
use crate::settlement::{SettlementLine, SettlementOutcome, SettlementRecord};

pub struct LedgerStore {
    conn: Arc<Mutex<Connection>>,
}

impl LedgerStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open ledger db")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON").ok();
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store for tests.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory ledger db")?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS group_orders (
                id TEXT PRIMARY KEY,
                offer_id TEXT NOT NULL,
                cell TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                deadline INTEGER NOT NULL,
                state TEXT NOT NULL,
                total_quantity INTEGER NOT NULL,
                tier_index INTEGER NOT NULL,
                unit_price_paise INTEGER NOT NULL,
                seq INTEGER NOT NULL
            )",
            [],
        )?;
        // The exactly-one-OPEN-group-per-key invariant, enforced durably.
        conn.execute(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_one_open_group
             ON group_orders(offer_id, cell) WHERE state = 'open'",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_group_orders_key
             ON group_orders(offer_id, cell, created_at DESC)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS commitments (
                group_id TEXT NOT NULL,
                idx INTEGER NOT NULL,
                vendor_id TEXT NOT NULL,
                quantity INTEGER NOT NULL,
                joined_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                status TEXT NOT NULL,
                PRIMARY KEY (group_id, idx)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_commitments_vendor
             ON commitments(vendor_id, joined_at DESC)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS settlements (
                settlement_id TEXT PRIMARY KEY,
                group_id TEXT NOT NULL UNIQUE,
                offer_id TEXT NOT NULL,
                cell TEXT NOT NULL,
                outcome TEXT NOT NULL,
                unit_price_paise INTEGER,
                lines TEXT NOT NULL,
                settled_at INTEGER NOT NULL
            )",
            [],
        )?;
        Ok(())
    }

    /// Writes a group order and its full commitment history in one
    /// transaction. `prev_seq == 0` means creation (INSERT); otherwise an
    /// optimistic UPDATE that fails on a stale sequence.
    pub fn persist_group(&self, group: &GroupOrder, prev_seq: u64) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        if prev_seq == 0 {
            tx.execute(
                "INSERT INTO group_orders
                 (id, offer_id, cell, created_at, deadline, state,
                  total_quantity, tier_index, unit_price_paise, seq)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    group.id,
                    group.offer.id,
                    group.offer.cell,
                    group.created_at,
                    group.deadline,
                    group.state.as_str(),
                    group.total_quantity,
                    group.tier_index,
                    group.unit_price_paise,
                    group.seq as i64,
                ],
            )
            .context("insert group order")?;
        } else {
            let updated = tx.execute(
                "UPDATE group_orders SET
                    state = ?1, total_quantity = ?2, tier_index = ?3,
                    unit_price_paise = ?4, seq = ?5
                 WHERE id = ?6 AND seq = ?7",
                params![
                    group.state.as_str(),
                    group.total_quantity,
                    group.tier_index,
                    group.unit_price_paise,
                    group.seq as i64,
                    group.id,
                    prev_seq as i64,
                ],
            )?;
            if updated == 0 {
                bail!(
                    "stale write rejected for group {} (expected seq {})",
                    group.id,
                    prev_seq
                );
            }
        }

        for (idx, c) in group.commitments.iter().enumerate() {
            tx.execute(
                "INSERT OR REPLACE INTO commitments
                 (group_id, idx, vendor_id, quantity, joined_at, updated_at, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    group.id,
                    idx as i64,
                    c.vendor_id,
                    c.quantity,
                    c.joined_at,
                    c.updated_at,
                    c.status.as_str(),
                ],
            )
            .context("upsert commitment")?;
        }

        tx.commit().context("commit group order write")?;
        Ok(())
    }

    /// Loads all OPEN group orders for restart recovery, re-hydrating each
    /// aggregate from its commitment history. Groups whose offer is no
    /// longer in the catalog are skipped with a warning (they can only be
    /// expired by hand).
    pub fn load_open_groups(&self, catalog: &dyn OfferCatalog) -> Result<Vec<GroupOrder>> {
        let conn = self.conn.lock();

        let mut stmt = conn.prepare_cached(
            "SELECT id, offer_id, created_at, deadline, state, seq
             FROM group_orders WHERE state = 'open' ORDER BY created_at ASC",
        )?;
        let rows: Vec<(String, String, i64, i64, String, i64)> = stmt
            .query_map([], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            })?
            .collect::<std::result::Result<_, _>>()?;

        let mut commitment_stmt = conn.prepare_cached(
            "SELECT vendor_id, quantity, joined_at, updated_at, status
             FROM commitments WHERE group_id = ?1 ORDER BY idx ASC",
        )?;

        let mut groups = Vec::with_capacity(rows.len());
        for (id, offer_id, created_at, deadline, state, seq) in rows {
            let Some(offer) = catalog.offer(&offer_id) else {
                warn!(group_id = %id, offer_id = %offer_id, "open group references unknown offer, skipping");
                continue;
            };
            let Some(state) = GroupState::parse(&state) else {
                warn!(group_id = %id, state = %state, "unknown group state, skipping");
                continue;
            };

            let mut commitments = Vec::new();
            for row in commitment_stmt.query_map(params![id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, u32>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })? {
                let (vendor_id, quantity, joined_at, updated_at, status) =
                    row.context("read commitment row")?;
                let Some(status) = CommitmentStatus::parse(&status) else {
                    warn!(group_id = %id, vendor_id = %vendor_id, status = %status, "unknown commitment status, skipping row");
                    continue;
                };
                commitments.push(Commitment {
                    vendor_id,
                    quantity,
                    joined_at,
                    updated_at,
                    status,
                });
            }

            // Recompute cached totals from history rather than trusting the
            // stored caches; the seq column stays authoritative.
            let total_quantity: u32 = commitments
                .iter()
                .filter(|c| c.status == CommitmentStatus::Active)
                .map(|c| c.quantity)
                .sum();
            let (unit_price_paise, tier_index) = resolve_tier(&offer, total_quantity);

            groups.push(GroupOrder {
                id,
                offer,
                created_at,
                deadline,
                commitments,
                total_quantity,
                tier_index,
                unit_price_paise,
                state,
                seq: seq as u64,
            });
        }

        Ok(groups)
    }

    /// Durable exactly-once backstop for settlement emission. Returns true
    /// when the record was newly inserted, false when the group was already
    /// settled.
    pub fn insert_settlement(&self, rec: &SettlementRecord) -> Result<bool> {
        let lines = serde_json::to_string(&rec.lines).context("serialize settlement lines")?;
        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO settlements
             (settlement_id, group_id, offer_id, cell, outcome, unit_price_paise, lines, settled_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                rec.settlement_id,
                rec.group_id,
                rec.offer_id,
                rec.cell,
                rec.outcome.as_str(),
                rec.unit_price_paise,
                lines,
                rec.settled_at,
            ],
        )?;
        Ok(inserted > 0)
    }

    pub fn settlement_for_group(&self, group_id: &str) -> Result<Option<SettlementRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT settlement_id, group_id, offer_id, cell, outcome, unit_price_paise, lines, settled_at
             FROM settlements WHERE group_id = ?1 LIMIT 1",
        )?;
        let mut rows = stmt.query(params![group_id])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };

        let outcome: String = row.get(4)?;
        let lines: String = row.get(6)?;
        let lines: Vec<SettlementLine> =
            serde_json::from_str(&lines).context("parse settlement lines")?;
        Ok(Some(SettlementRecord {
            settlement_id: row.get(0)?,
            group_id: row.get(1)?,
            offer_id: row.get(2)?,
            cell: row.get(3)?,
            outcome: SettlementOutcome::parse(&outcome)
                .ok_or_else(|| anyhow::anyhow!("unknown settlement outcome {}", outcome))?,
            unit_price_paise: row.get(5)?,
            lines,
            settled_at: row.get(7)?,
        }))
    }

    /// Most recent commitment rows for a vendor, newest first. Powers the
    /// vendor "my orders" view.
    pub fn vendor_history(
        &self,
        vendor_id: &str,
        limit: u32,
    ) -> Result<Vec<(String, Commitment)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT group_id, vendor_id, quantity, joined_at, updated_at, status
             FROM commitments WHERE vendor_id = ?1
             ORDER BY joined_at DESC LIMIT ?2",
        )?;
        let mut rows = Vec::new();
        for row in stmt.query_map(params![vendor_id, limit], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, u32>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, String>(5)?,
            ))
        })? {
            let (group_id, vendor_id, quantity, joined_at, updated_at, status) =
                row.context("read commitment history row")?;
            let Some(status) = CommitmentStatus::parse(&status) else {
                warn!(group_id = %group_id, vendor_id = %vendor_id, status = %status, "unknown commitment status, skipping row");
                continue;
            };
            rows.push((
                group_id,
                Commitment {
                    vendor_id,
                    quantity,
                    joined_at,
                    updated_at,
                    status,
                },
            ));
        }
        Ok(rows)
    }

    #[cfg(test)]
    pub fn group_seq(&self, group_id: &str) -> Result<Option<i64>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT seq FROM group_orders WHERE id = ?1")?;
        let mut rows = stmt.query(params![group_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    /// Map of offer id -> open group id, used by tests and diagnostics.
    pub fn open_group_ids(&self) -> Result<HashMap<String, String>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("SELECT offer_id, id FROM group_orders WHERE state = 'open'")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<std::result::Result<_, _>>()?;
        Ok(rows)
    }
}
