//! GroupGrocer Backend Library
//!
//! Collective procurement engine for street vendors: vendors in the same
//! delivery cell pool commitments against a supplier offer, unlocking bulk
//! price tiers when the group crosses the tier threshold before the order
//! window closes.

pub mod api;
pub mod catalog;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod models;
pub mod pricing;
pub mod settlement;

pub use engine::AggregationEngine;
pub use error::EngineError;
