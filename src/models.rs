//! Core domain types for the group order aggregation engine.
//!
//! Prices are integer paise throughout; quantities are whole units of the
//! offer's unit label (bags, tins, crates). Timestamps are Utc epoch seconds.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};

/// One bulk-pricing rule: at `min_quantity` accumulated units the whole
/// group pays `unit_price_paise` per unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceTier {
    pub min_quantity: u32,
    pub unit_price_paise: i64,
}

/// Immutable purchasable unit as published by the catalog. The engine never
/// mutates an offer; malformed tier tables are rejected at load time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Offer {
    pub id: String,
    pub supplier: String,
    pub product: String,
    /// e.g. "25kg bag", "5L tin"
    pub unit_label: String,
    pub base_price_paise: i64,
    /// Strictly increasing min_quantity, strictly non-increasing price.
    pub tiers: Vec<PriceTier>,
    /// Pincode partition the offer is sold into, e.g. "110001".
    pub cell: String,
    /// Length of each group order window in seconds.
    pub window_secs: i64,
    /// Supplier-configured minimum distinct vendor count for completion.
    pub min_vendors: u32,
}

impl Offer {
    /// Quantity the group must accumulate to qualify for the deepest tier.
    /// `None` for base-price-only offers, which can only expire.
    pub fn completion_quantity(&self) -> Option<u32> {
        self.tiers.last().map(|t| t.min_quantity)
    }
}

/// At most one group order is OPEN per key at any time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupOrderKey {
    pub offer_id: String,
    pub cell: String,
}

impl GroupOrderKey {
    pub fn new(offer_id: impl Into<String>, cell: impl Into<String>) -> Self {
        Self {
            offer_id: offer_id.into(),
            cell: cell.into(),
        }
    }
}

impl std::fmt::Display for GroupOrderKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.offer_id, self.cell)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupState {
    Open,
    Complete,
    Expired,
}

impl GroupState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, GroupState::Open)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GroupState::Open => "open",
            GroupState::Complete => "complete",
            GroupState::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(GroupState::Open),
            "complete" => Some(GroupState::Complete),
            "expired" => Some(GroupState::Expired),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitmentStatus {
    Active,
    Withdrawn,
}

impl CommitmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommitmentStatus::Active => "active",
            CommitmentStatus::Withdrawn => "withdrawn",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(CommitmentStatus::Active),
            "withdrawn" => Some(CommitmentStatus::Withdrawn),
            _ => None,
        }
    }
}

/// One vendor's stake in a group order. History rows are append-only: a
/// withdrawn commitment is never overwritten by a later re-join.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Commitment {
    pub vendor_id: String,
    pub quantity: u32,
    pub joined_at: i64,
    pub updated_at: i64,
    pub status: CommitmentStatus,
}

/// Live view of a group order, returned from every vendor action and pushed
/// to websocket watchers. Presentation fields (progress %, savings, time-left
/// strings) are derived by consumers, never stored here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSnapshot {
    pub group_id: String,
    pub offer_id: String,
    pub cell: String,
    pub state: GroupState,
    pub member_count: u32,
    pub min_vendors: u32,
    pub total_quantity: u32,
    /// Quantity needed for the deepest tier; None for base-price-only offers.
    pub completion_quantity: Option<u32>,
    pub unit_price_paise: i64,
    /// -1 when the total is still below the first tier.
    pub tier_index: i32,
    pub base_price_paise: i64,
    pub created_at: i64,
    pub deadline: i64,
    /// Monotone per-group version; bumps on every applied mutation.
    pub seq: u64,
}

/// Events pushed to websocket subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum WsServerEvent {
    GroupUpdate(GroupSnapshot),
    Settlement(crate::settlement::SettlementRecord),
}

/// Process-wide source of time. Injected so expiry decisions are
/// deterministic under test.
pub trait Clock: Send + Sync {
    fn now_ts(&self) -> i64;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ts(&self) -> i64 {
        Utc::now().timestamp()
    }
}

/// Manually advanced clock for tests.
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start: i64) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    pub fn advance(&self, secs: i64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }

    pub fn set(&self, ts: i64) {
        self.now.store(ts, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ts(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub port: u16,
    /// Bounded transparent retries while acquiring a group's exclusive
    /// section; exhaustion surfaces as a transient Busy error.
    pub lock_retry_attempts: u32,
    pub lock_retry_delay_ms: u64,
    /// Optional JSON file of offers; falls back to the built-in demo seed.
    pub offers_path: Option<String>,
    /// Optional JSON file mapping vendor id -> home pincode cell.
    pub vendors_path: Option<String>,
    pub broadcast_capacity: usize,
}

impl Config {
    pub fn from_env() -> Self {
        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./groupgrocer.db".to_string());

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .unwrap_or(3000);

        let lock_retry_attempts = std::env::var("LOCK_RETRY_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .filter(|v| *v >= 1)
            .unwrap_or(50);

        let lock_retry_delay_ms = std::env::var("LOCK_RETRY_DELAY_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v >= 1)
            .unwrap_or(2);

        let offers_path = std::env::var("OFFERS_PATH")
            .ok()
            .filter(|v| !v.trim().is_empty());

        let vendors_path = std::env::var("VENDORS_PATH")
            .ok()
            .filter(|v| !v.trim().is_empty());

        let broadcast_capacity = std::env::var("BROADCAST_CAPACITY")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|v| *v >= 16)
            .unwrap_or(1024);

        Self {
            database_path,
            port,
            lock_retry_attempts,
            lock_retry_delay_ms,
            offers_path,
            vendors_path,
            broadcast_capacity,
        }
    }
}
