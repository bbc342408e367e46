//! Engine error taxonomy.
//!
//! Caller errors are returned synchronously and never retried by the engine.
//! `Busy` is the one transient variant: lock-acquisition retries were
//! exhausted and the caller may safely resubmit. No error leaves the ledger
//! partially mutated.

use std::fmt;

#[derive(Debug)]
pub enum EngineError {
    /// Quantity was zero or above the accepted cap (quantities are positive
    /// whole units, bounded per commitment and per group).
    InvalidQuantity { quantity: u32 },
    /// Vendor already holds an ACTIVE commitment in this group order.
    AlreadyCommitted { vendor_id: String },
    /// Offer, vendor, or active commitment was not found.
    NotFound { what: String },
    /// The group order is no longer accepting mutations. When
    /// `retry_forms_new_group` is set, a fresh join against the same offer
    /// and cell will open a new group order.
    WindowClosed { retry_forms_new_group: bool },
    /// Vendor's home cell does not match the offer's cell.
    CellMismatch { vendor_cell: String, offer_cell: String },
    /// Per-group exclusive section could not be acquired within the bounded
    /// retry budget. Transient; safe to retry.
    Busy,
    /// Malformed offer surfaced at load time; the engine refuses to open
    /// group orders for such an offer.
    Config(String),
    /// Infrastructure failure (storage, serialization).
    Internal(anyhow::Error),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::InvalidQuantity { quantity } => {
                write!(
                    f,
                    "invalid quantity {} (must be a positive integer within the accepted limit)",
                    quantity
                )
            }
            EngineError::AlreadyCommitted { vendor_id } => {
                write!(f, "vendor {} already has an active commitment", vendor_id)
            }
            EngineError::NotFound { what } => write!(f, "{} not found", what),
            EngineError::WindowClosed {
                retry_forms_new_group,
            } => {
                if *retry_forms_new_group {
                    write!(f, "window closed; a new group order will form on the next join")
                } else {
                    write!(f, "window closed")
                }
            }
            EngineError::CellMismatch {
                vendor_cell,
                offer_cell,
            } => write!(
                f,
                "vendor cell {} does not match offer cell {}",
                vendor_cell, offer_cell
            ),
            EngineError::Busy => write!(f, "group order busy, retry"),
            EngineError::Config(msg) => write!(f, "offer configuration error: {}", msg),
            EngineError::Internal(err) => write!(f, "internal error: {}", err),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Internal(err) => err.source(),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError::Internal(err)
    }
}

impl EngineError {
    pub fn not_found(what: impl Into<String>) -> Self {
        EngineError::NotFound { what: what.into() }
    }

    /// Stable machine-readable code used by the HTTP layer and logs.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InvalidQuantity { .. } => "invalid_quantity",
            EngineError::AlreadyCommitted { .. } => "already_committed",
            EngineError::NotFound { .. } => "not_found",
            EngineError::WindowClosed { .. } => "window_closed",
            EngineError::CellMismatch { .. } => "cell_mismatch",
            EngineError::Busy => "busy",
            EngineError::Config(_) => "configuration_error",
            EngineError::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_closed_carries_retry_hint() {
        let err = EngineError::WindowClosed {
            retry_forms_new_group: true,
        };
        assert_eq!(err.code(), "window_closed");
        assert!(err.to_string().contains("new group order"));
    }

    #[test]
    fn internal_wraps_anyhow() {
        let err: EngineError = anyhow::anyhow!("disk full").into();
        assert_eq!(err.code(), "internal");
        assert!(err.to_string().contains("disk full"));
    }
}
