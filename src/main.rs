//! GroupGrocer - Collective Procurement Engine for Street Vendors
//!
//! Vendors in the same delivery cell pool commitments against supplier
//! offers. When a group's total crosses a bulk tier before the order window
//! closes, everyone in the group pays the tier price. This binary wires the
//! aggregation engine to a persistent ledger and serves the vendor API.

use anyhow::{Context, Result};
use dotenv::dotenv;
use std::path::Path;
use std::sync::Arc;
use tokio::{net::TcpListener, sync::broadcast};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use groupgrocer_backend::api::create_router;
use groupgrocer_backend::catalog::{InMemoryVendorDirectory, StaticCatalog};
use groupgrocer_backend::engine::AggregationEngine;
use groupgrocer_backend::ledger::{Ledger, LedgerConfig};
use groupgrocer_backend::ledger::store::LedgerStore;
use groupgrocer_backend::models::{Clock, Config, SystemClock, WsServerEvent};
use groupgrocer_backend::settlement::SettlementDispatcher;

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    let config = Config::from_env();

    info!("🛒 GroupGrocer aggregation engine starting");

    // Persistent ledger
    let store = Arc::new(LedgerStore::new(&config.database_path)?);
    info!("📊 Ledger database initialized at: {}", config.database_path);

    // Offer catalog and vendor directory: file-backed when configured,
    // seeded demo data otherwise.
    let catalog: Arc<StaticCatalog> = match &config.offers_path {
        Some(path) => {
            let catalog = StaticCatalog::load(path)
                .with_context(|| format!("load offer catalog from {}", path))?;
            Arc::new(catalog)
        }
        None => {
            warn!("OFFERS_PATH not set - using seeded demo offers");
            Arc::new(StaticCatalog::seed())
        }
    };
    let directory: Arc<InMemoryVendorDirectory> = match &config.vendors_path {
        Some(path) => {
            let directory = InMemoryVendorDirectory::load(path)
                .with_context(|| format!("load vendor directory from {}", path))?;
            Arc::new(directory)
        }
        None => {
            warn!("VENDORS_PATH not set - using seeded demo vendors");
            Arc::new(InMemoryVendorDirectory::seed())
        }
    };

    // Broadcast channel for websocket fan-out (group updates + settlements)
    let (event_tx, _event_rx) = broadcast::channel::<WsServerEvent>(config.broadcast_capacity);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let ledger = Arc::new(Ledger::new(
        store.clone(),
        clock.clone(),
        LedgerConfig {
            lock_retry_attempts: config.lock_retry_attempts,
            lock_retry_delay_ms: config.lock_retry_delay_ms,
        },
    ));

    let dispatcher = Arc::new(SettlementDispatcher::new(
        store.clone(),
        event_tx.clone(),
        config.broadcast_capacity,
    ));

    let engine = AggregationEngine::new(
        ledger.clone(),
        catalog.clone(),
        directory,
        dispatcher,
        clock,
        event_tx.clone(),
    );

    // Re-arm expiry timers for groups that were open when we last shut down.
    // Past-due deadlines fire immediately.
    let recovered = ledger.recover(catalog.as_ref())?;
    if !recovered.is_empty() {
        info!("🔁 Recovered {} open groups from ledger", recovered.len());
    }
    engine.reschedule_recovered(recovered);

    let app = create_router(engine, event_tx);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("🎯 API server listening on {}", addr);

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "groupgrocer_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    // Standard dotenv search (cwd + parents), then the crate directory so
    // running with --manifest-path from elsewhere still picks up .env.
    let _ = dotenv();

    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    let candidate = manifest_dir.join(".env");
    if candidate.exists() {
        let _ = dotenv::from_path(&candidate);
    }
}
