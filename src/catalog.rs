//! Catalog and vendor-directory collaborators.
//!
//! The engine consumes these as narrow read interfaces: offer lookup by id
//! and vendor id -> home pincode cell. The real services live elsewhere;
//! the implementations here are a validated in-memory snapshot loaded from
//! JSON (or the built-in demo seed) at process start.

use anyhow::{Context, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::error::EngineError;
use crate::models::{Offer, PriceTier};
use crate::pricing::validate_offer;

pub trait OfferCatalog: Send + Sync {
    fn offer(&self, id: &str) -> Option<Arc<Offer>>;
    fn offers(&self) -> Vec<Arc<Offer>>;
}

pub trait VendorDirectory: Send + Sync {
    fn home_cell(&self, vendor_id: &str) -> Option<String>;
}

/// Immutable offer snapshot. Every offer is validated on the way in, so the
/// engine never sees a malformed tier table.
pub struct StaticCatalog {
    offers: HashMap<String, Arc<Offer>>,
}

impl StaticCatalog {
    pub fn from_offers(offers: Vec<Offer>) -> Result<Self, EngineError> {
        let mut map = HashMap::with_capacity(offers.len());
        for offer in offers {
            validate_offer(&offer)?;
            if map.insert(offer.id.clone(), Arc::new(offer)).is_some() {
                return Err(EngineError::Config("duplicate offer id".into()));
            }
        }
        Ok(Self { offers: map })
    }

    pub fn load(path: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read offers file {}", path))?;
        let offers: Vec<Offer> =
            serde_json::from_str(&raw).with_context(|| format!("parse offers file {}", path))?;
        let catalog = Self::from_offers(offers)
            .map_err(|e| anyhow::anyhow!("{}", e))
            .context("validate offers")?;
        info!(path, offers = catalog.offers.len(), "offer catalog loaded");
        Ok(catalog)
    }

    /// Built-in GroupGrocer demo offers (Delhi pincode cells).
    pub fn seed() -> Self {
        let offers = vec![
            Offer {
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
            },
            Offer {
                id: "oil-refined-5l".into(),
                supplier: "Golden Oil Co.".into(),
                product: "Refined Cooking Oil".into(),
                unit_label: "5L tin".into(),
                base_price_paise: 45_000,
                tiers: vec![PriceTier {
                    min_quantity: 5,
                    unit_price_paise: 38_000,
                }],
                cell: "110001".into(),
                window_secs: 4 * 3600,
                min_vendors: 5,
            },
            Offer {
                id: "onions-red-50kg".into(),
                supplier: "Fresh Veggies Ltd".into(),
                product: "Red Onions".into(),
                unit_label: "50kg sack".into(),
                base_price_paise: 80_000,
                tiers: vec![
                    PriceTier {
                        min_quantity: 4,
                        unit_price_paise: 70_000,
                    },
                    PriceTier {
                        min_quantity: 8,
                        unit_price_paise: 65_000,
                    },
                ],
                cell: "110001".into(),
                window_secs: 10 * 3600,
                min_vendors: 4,
            },
            Offer {
                id: "flour-wheat-50kg".into(),
                supplier: "Grain Mills Co.".into(),
                product: "Whole Wheat Flour".into(),
                unit_label: "50kg bag".into(),
                base_price_paise: 90_000,
                tiers: vec![PriceTier {
                    min_quantity: 3,
                    unit_price_paise: 75_000,
                }],
                cell: "110002".into(),
                window_secs: 12 * 3600,
                min_vendors: 3,
            },
        ];

        // Seed offers are hand-maintained; a malformed one is a programmer
        // error worth failing loudly on at startup.
        Self::from_offers(offers).expect("built-in seed offers are valid")
    }
}

impl OfferCatalog for StaticCatalog {
    fn offer(&self, id: &str) -> Option<Arc<Offer>> {
        self.offers.get(id).cloned()
    }

    fn offers(&self) -> Vec<Arc<Offer>> {
        let mut all: Vec<_> = self.offers.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }
}

/// Vendor id -> home cell registry. Registration is open so demos and tests
/// can add vendors at runtime; the production collaborator would be the
/// identity service.
#[derive(Default)]
pub struct InMemoryVendorDirectory {
    cells: RwLock<HashMap<String, String>>,
}

impl InMemoryVendorDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read vendors file {}", path))?;
        let cells: HashMap<String, String> =
            serde_json::from_str(&raw).with_context(|| format!("parse vendors file {}", path))?;
        info!(path, vendors = cells.len(), "vendor directory loaded");
        Ok(Self {
            cells: RwLock::new(cells),
        })
    }

    pub fn seed() -> Self {
        let dir = Self::new();
        for (vendor, cell) in [
            ("raju-chaat", "110001"),
            ("anita-dosa", "110001"),
            ("mohan-juice", "110001"),
            ("sita-snacks", "110001"),
            ("farid-rolls", "110001"),
            ("lakshmi-tiffin", "110002"),
        ] {
            dir.register(vendor, cell);
        }
        dir
    }

    pub fn register(&self, vendor_id: &str, cell: &str) {
        self.cells
            .write()
            .insert(vendor_id.trim().to_string(), cell.trim().to_string());
    }
}

impl VendorDirectory for InMemoryVendorDirectory {
    fn home_cell(&self, vendor_id: &str) -> Option<String> {
        self.cells.read().get(vendor_id.trim()).cloned()
    }
}
