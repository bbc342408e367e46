//! Settlement records and the dispatcher that hands them downstream.
//!
//! A settlement record is the terminal, immutable outcome of one group
//! order. The aggregation engine builds it at the moment of the terminal
//! transition (never from a later poll) and the dispatcher emits it exactly
//! once: a deterministic settlement id plus an `INSERT OR IGNORE` in the
//! ledger store make duplicate emission a logged no-op. Emission happens
//! after the group's exclusive section is released and never blocks it.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ledger::store::LedgerStore;
use crate::models::WsServerEvent;

/// Deterministic settlement id: one group order settles at most once, so
/// the id is derived from the group id alone.
pub fn settlement_id_for(group_id: &str) -> String {
    Uuid::new_v5(
        &Uuid::NAMESPACE_URL,
        format!("groupgrocer:settlement:{}", group_id).as_bytes(),
    )
    .to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementOutcome {
    Complete,
    Expired,
}

impl SettlementOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementOutcome::Complete => "complete",
            SettlementOutcome::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "complete" => Some(SettlementOutcome::Complete),
            "expired" => Some(SettlementOutcome::Expired),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementLine {
    pub vendor_id: String,
    pub quantity: u32,
    pub charge_paise: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementRecord {
    pub settlement_id: String,
    pub group_id: String,
    pub offer_id: String,
    pub cell: String,
    pub outcome: SettlementOutcome,
    /// Frozen tier price for COMPLETE; None for EXPIRED.
    pub unit_price_paise: Option<i64>,
    /// Per-vendor charges in join order; empty for EXPIRED.
    pub lines: Vec<SettlementLine>,
    pub settled_at: i64,
}

/// Downstream consumer callback (billing, delivery dispatch). Deliveries
/// are fire-and-forget; a failing sink is logged and retried by the
/// collaborator's own machinery, not ours.
#[async_trait]
pub trait SettlementSink: Send + Sync {
    fn name(&self) -> &str;
    async fn deliver(&self, record: &SettlementRecord) -> anyhow::Result<()>;
}

pub struct SettlementDispatcher {
    store: Arc<LedgerStore>,
    /// Dedicated stream for billing/delivery collaborators.
    tx: broadcast::Sender<SettlementRecord>,
    /// Shared websocket event stream for UI watchers.
    events: broadcast::Sender<WsServerEvent>,
    sinks: RwLock<Vec<Arc<dyn SettlementSink>>>,
}

impl SettlementDispatcher {
    pub fn new(
        store: Arc<LedgerStore>,
        events: broadcast::Sender<WsServerEvent>,
        capacity: usize,
    ) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            store,
            tx,
            events,
            sinks: RwLock::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SettlementRecord> {
        self.tx.subscribe()
    }

    pub fn register_sink(&self, sink: Arc<dyn SettlementSink>) {
        info!(sink = sink.name(), "settlement sink registered");
        self.sinks.write().push(sink);
    }

    /// Emits a settlement record. Returns true when this call was the one
    /// that emitted it; a duplicate (late expiry timer, replay on restart)
    /// is persisted-away and produces no downstream traffic.
    pub fn dispatch(&self, record: SettlementRecord) -> anyhow::Result<bool> {
        if !self.store.insert_settlement(&record)? {
            debug!(
                group_id = %record.group_id,
                "settlement already emitted, skipping duplicate"
            );
            return Ok(false);
        }

        info!(
            group_id = %record.group_id,
            outcome = record.outcome.as_str(),
            vendors = record.lines.len(),
            "settlement emitted"
        );

        // Stream consumers; a lagging receiver drops events on its side.
        let _ = self.tx.send(record.clone());
        let _ = self.events.send(WsServerEvent::Settlement(record.clone()));

        for sink in self.sinks.read().iter().cloned() {
            let record = record.clone();
            tokio::spawn(async move {
                if let Err(e) = sink.deliver(&record).await {
                    warn!(
                        sink = sink.name(),
                        group_id = %record.group_id,
                        error = %e,
                        "settlement sink delivery failed"
                    );
                }
            });
        }

        Ok(true)
    }
}
