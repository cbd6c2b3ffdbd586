//! dbsync demo
//!
//! Runs a product catalogue cache over an in-memory store, mutates the store in
//! rounds and logs what the cache and its secondary views look like after each
//! refresh.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          dbsync demo                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────────┐   │
//! │  │ MemoryStore  │───▶│  Snapshot    │───▶│ catalogue cache  │   │
//! │  │  (mutated    │    │  Refresher   │    │  by-price sort   │   │
//! │  │  per round)  │    │   (diff)     │    │  by-category idx │   │
//! │  └──────────────┘    └──────────────┘    └──────────────────┘   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use dbsync::{
    CacheBuilder, CacheStats, DataRefresher, MemoryStore, MruCache, PersistentObject,
    PersistentObjectCache, RefreshResults, ShutdownHooks, SnapshotRefresher, SortKey, WithShutdown,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// dbsync - refreshable in-memory object cache demo
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Cache name used in logs
    #[arg(long, env = "DBSYNC_CACHE_NAME", default_value = "catalogue")]
    name: String,

    /// Background refresh interval in milliseconds (0 disables it)
    #[arg(long, env = "DBSYNC_REFRESH_INTERVAL_MS", default_value = "500")]
    refresh_interval_ms: u64,

    /// Count cache hits and misses
    #[arg(long, env = "DBSYNC_RECORD_STATS")]
    record_stats: bool,

    /// Number of mutation rounds to run
    #[arg(long, env = "DBSYNC_ROUNDS", default_value = "5")]
    rounds: u32,

    /// Pause between rounds in milliseconds
    #[arg(long, env = "DBSYNC_ROUND_PAUSE_MS", default_value = "250")]
    round_pause_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Demo Entity
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct Product {
    id: u64,
    name: String,
    category: String,
    price_cents: u64,
}

impl PersistentObject for Product {
    type Id = u64;

    fn id(&self) -> &u64 {
        &self.id
    }
}

const CATEGORIES: [&str; 3] = ["books", "games", "tools"];

fn product(id: u64, round: u32) -> Product {
    Product {
        id,
        name: format!("product-{}", id),
        category: CATEGORIES[(id as usize) % CATEGORIES.len()].to_string(),
        price_cents: 100 + (id * 37 + round as u64 * 11) % 900,
    }
}

// =============================================================================
// Round Report
// =============================================================================

#[derive(Debug, Serialize)]
struct RoundReport {
    round: u32,
    refresh: RefreshResults,
    size: usize,
    cheapest: Vec<u64>,
    by_category: Vec<(String, usize)>,
    most_recent: Vec<u64>,
    stats: CacheStats,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    info!("Starting dbsync {}", dbsync::version());
    info!("  Cache name: {}", args.name);
    info!("  Refresh interval: {} ms", args.refresh_interval_ms);
    info!("  Record stats: {}", args.record_stats);
    info!("  Rounds: {}", args.rounds);

    let store = Arc::new(MemoryStore::new());
    for id in 1..=6 {
        store.insert(product(id, 0));
    }

    let (catalogue, recent) = build_caches(&args, &store)?;
    let hooks = ShutdownHooks::new();
    hooks.register("catalogue cache", Arc::clone(&catalogue) as Arc<dyn WithShutdown>);
    hooks.register("recent cache", Arc::clone(&recent) as Arc<dyn WithShutdown>);

    let pause = Duration::from_millis(args.round_pause_ms);
    let rounds = args.rounds;
    let worker = tokio::task::spawn_blocking(move || {
        run_rounds(rounds, pause, &store, &catalogue, &recent)
    });

    tokio::select! {
        result = worker => {
            result.context("demo worker panicked")??;
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, shutting down");
        }
    }

    hooks.run();
    info!("dbsync demo complete");
    Ok(())
}

fn build_caches(
    args: &Args,
    store: &Arc<MemoryStore<Product>>,
) -> anyhow::Result<(
    Arc<PersistentObjectCache<Product>>,
    Arc<MruCache<Product>>,
)> {
    let interval = Duration::from_millis(args.refresh_interval_ms);

    let mut builder = CacheBuilder::new(DataRefresher::<Product>::new(
        format!("{}-store", args.name),
        SnapshotRefresher::new(Arc::clone(store)),
    ))
    .name(&args.name)
    .refresh_on_construction(true)
    .refresh_every(interval);
    if args.record_stats {
        builder = builder.with_stats();
    }
    let catalogue = builder
        .build()
        .with_context(|| format!("failed to load cache {}", args.name))?;

    catalogue
        .add_sort("by-price", |p: &Product, _| SortKey::Sort((p.price_cents, p.id)))?
        .wait()?;
    catalogue
        .add_index("by-category", |p: &Product| Some(p.category.clone()))?
        .wait()?;

    let recent = CacheBuilder::new(DataRefresher::<Product>::new(
        format!("{}-recent", args.name),
        SnapshotRefresher::new(Arc::clone(store)),
    ))
    .with_mru_sort()
    .name(format!("{}-recent", args.name))
    .promote_when_new_or_updated()
    .refresh_on_construction(true)
    .build()
    .context("failed to load MRU cache")?;

    Ok((Arc::new(catalogue), Arc::new(recent)))
}

fn run_rounds(
    rounds: u32,
    pause: Duration,
    store: &MemoryStore<Product>,
    catalogue: &PersistentObjectCache<Product>,
    recent: &MruCache<Product>,
) -> anyhow::Result<()> {
    let timeout = Some(Duration::from_secs(10));
    let mut next_id = 7;

    for round in 1..=rounds {
        // One new product, one repriced, one discontinued.
        store.insert(product(next_id, round));
        next_id += 1;
        let repriced = u64::from(round) + 1;
        if store.get(&repriced).is_some() {
            store.insert(product(repriced, round));
        }
        store.remove(&(u64::from(round) * 2));

        let refresh = catalogue.refresh_and_wait(timeout)?;
        recent.refresh_and_wait(timeout)?;
        if let Some(first) = catalogue.ids().first() {
            catalogue.get(first);
            recent.touch_id(first);
        }

        let report = report(round, refresh, catalogue, recent)?;
        match serde_json::to_string(&report) {
            Ok(json) => info!(round, "{}", json),
            Err(e) => error!("Failed to serialize round report: {}", e),
        }
        std::thread::sleep(pause);
    }
    Ok(())
}

fn report(
    round: u32,
    refresh: RefreshResults,
    catalogue: &PersistentObjectCache<Product>,
    recent: &MruCache<Product>,
) -> anyhow::Result<RoundReport> {
    let by_category = CATEGORIES
        .iter()
        .map(|category| {
            catalogue
                .indexed("by-category", &category.to_string())
                .map(|products| (category.to_string(), products.len()))
        })
        .collect::<dbsync::Result<Vec<_>>>()?;

    Ok(RoundReport {
        round,
        refresh,
        size: catalogue.size(),
        cheapest: catalogue.sorted_ids("by-price")?.into_iter().take(3).collect(),
        by_category,
        most_recent: recent.mru_ids().into_iter().take(3).collect(),
        stats: catalogue.stats(),
    })
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.to_lowercase()));

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
