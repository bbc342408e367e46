//! Pricing tier table.
//!
//! Pure tier resolution over an offer's `(min_quantity, unit_price)` list.
//! Malformed tables are a configuration error caught when the offer is
//! loaded into the catalog, never at commitment time.

use crate::error::EngineError;
use crate::models::Offer;

/// Returns `(unit_price_paise, tier_index)` for the given accumulated
/// quantity: the last tier whose `min_quantity <= total_quantity`, or the
/// base price with index -1 when the total is below the first tier.
///
/// Assumes a validated offer (see [`validate_offer`]); on a validated tier
/// list the result is deterministic and the price is non-increasing in
/// `total_quantity`.
pub fn resolve_tier(offer: &Offer, total_quantity: u32) -> (i64, i32) {
    let mut price = offer.base_price_paise;
    let mut index = -1i32;
    for (i, tier) in offer.tiers.iter().enumerate() {
        if tier.min_quantity > total_quantity {
            break;
        }
        price = tier.unit_price_paise;
        index = i as i32;
    }
    (price, index)
}

/// Structural validation of an offer at catalog-load time.
///
/// Rejects non-positive prices, zero quantities/windows, tier tables that
/// are not strictly increasing in quantity or not non-increasing in price,
/// and tiers that do not actually undercut the base price.
pub fn validate_offer(offer: &Offer) -> Result<(), EngineError> {
    if offer.id.trim().is_empty() {
        return Err(EngineError::Config("offer id is empty".into()));
    }
    if offer.cell.trim().is_empty() {
        return Err(EngineError::Config(format!("offer {}: cell is empty", offer.id)));
    }
    if offer.base_price_paise <= 0 {
        return Err(EngineError::Config(format!(
            "offer {}: base price {} must be positive",
            offer.id, offer.base_price_paise
        )));
    }
    if offer.window_secs <= 0 {
        return Err(EngineError::Config(format!(
            "offer {}: window {}s must be positive",
            offer.id, offer.window_secs
        )));
    }
    if offer.min_vendors == 0 {
        return Err(EngineError::Config(format!(
            "offer {}: min_vendors must be at least 1",
            offer.id
        )));
    }

    let mut prev_quantity = 0u32;
    let mut prev_price = offer.base_price_paise;
    for (i, tier) in offer.tiers.iter().enumerate() {
        if tier.min_quantity == 0 {
            return Err(EngineError::Config(format!(
                "offer {}: tier {} has zero min_quantity",
                offer.id, i
            )));
        }
        if i > 0 && tier.min_quantity <= prev_quantity {
            return Err(EngineError::Config(format!(
                "offer {}: tier quantities must be strictly increasing ({} after {})",
                offer.id, tier.min_quantity, prev_quantity
            )));
        }
        if tier.unit_price_paise <= 0 {
            return Err(EngineError::Config(format!(
                "offer {}: tier {} price {} must be positive",
                offer.id, i, tier.unit_price_paise
            )));
        }
        if tier.unit_price_paise > prev_price {
            return Err(EngineError::Config(format!(
                "offer {}: tier prices must be non-increasing ({} after {})",
                offer.id, tier.unit_price_paise, prev_price
            )));
        }
        prev_quantity = tier.min_quantity;
        prev_price = tier.unit_price_paise;
    }

    Ok(())
}
