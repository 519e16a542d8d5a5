//! Algo Engine - headless algo execution core
//!
//! Replays the algo journal, restores live algos and runs the strands until
//! Ctrl+C. Adapters are the in-process mocks; `--demo` spawns a TWAP against a
//! synthetic feed and fills every order it sends.
//!
//! # Usage
//! ```sh
//! ALGO_THREADS=4 cargo run -- --demo
//! ```
//!
//! # Environment Variables
//! - `ALGO_THREADS` - Worker threads (default: available parallelism)
//! - `ALGO_JOURNAL_PATH` - Journal file (default: algo_journal.jsonl)
//! - `ALGO_RESTORE_ON_BOOT` - Respawn live algos from the journal (default: true)
//! - `ALGO_REPLAY_FROM` - First journal sequence replayed (default: 0)
//! - `ALGO_LOG` - Log filter when `RUST_LOG` is unset (default: info)

use algo_engine::application::{AlgoManager, AlgoRegistry};
use algo_engine::config::EngineConfig;
use algo_engine::domain::params::{ParamMap, SecurityTuple};
use algo_engine::domain::types::{Confirmation, DataSrc, ExecType, MarketData, Order, OrderSide, User};
use algo_engine::infrastructure::{JournalStore, MockExecutionService, MockMarketDataService};
use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::Receiver;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

const DEMO_SECURITY: u32 = 1;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Worker threads, one strand each
    #[arg(long)]
    threads: Option<usize>,

    /// Path to the algo journal
    #[arg(long)]
    journal: Option<PathBuf>,

    /// Do not respawn the algos found live in the journal
    #[arg(long)]
    no_restore: bool,

    /// First journal sequence to replay
    #[arg(long)]
    replay_from: Option<u32>,

    /// Spawn a TWAP algo on a simulated feed
    #[arg(long)]
    demo: bool,
}

fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let mut config = EngineConfig::from_env().context("Failed to load engine config")?;
    if let Some(threads) = args.threads {
        config.threads = threads.max(1);
    }
    if let Some(journal) = args.journal {
        config.journal_path = journal;
    }
    if args.no_restore {
        config.restore_on_boot = false;
    }
    if let Some(seq0) = args.replay_from {
        config.replay_from = seq0;
    }

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.observability.log_filter));
    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_target(config.observability.with_target)
        .with_ansi(config.observability.ansi);
    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .init();

    info!("Algo engine {} starting...", env!("CARGO_PKG_VERSION"));
    info!(
        "Configuration loaded: threads={}, journal={:?}, restore={}, replay_from={}",
        config.threads, config.journal_path, config.restore_on_boot, config.replay_from
    );

    let store = Arc::new(
        JournalStore::open(&config.journal_path).context("Failed to open algo journal")?,
    );
    let (order_tx, order_rx) = crossbeam_channel::unbounded();
    let execution = Arc::new(MockExecutionService::with_notify(order_tx));
    let market_data = Arc::new(MockMarketDataService::new());
    let manager = AlgoManager::new(AlgoRegistry::with_builtin(), execution, market_data, store);

    let recovery = manager
        .load_store(config.replay_from, None)
        .context("Failed to replay algo journal")?;
    manager
        .start(config.threads)
        .context("Failed to start algo manager")?;

    if config.restore_on_boot {
        manager.restore(&recovery);
    } else if !recovery.live.is_empty() {
        warn!("{} live algos in the journal were not restored", recovery.live.len());
    }

    spawn_fill_simulator(Arc::downgrade(&manager), order_rx);
    if args.demo {
        spawn_demo(&manager)?;
    }
    spawn_signal_watcher(Arc::downgrade(&manager));

    info!("Engine running. Press Ctrl+C to shutdown.");
    manager.wait();

    if manager.is_durability_compromised() {
        warn!("Some journal writes failed during this run; the journal is incomplete");
    }
    info!("Shutdown complete.");
    Ok(())
}

/// Acks and fully fills every order the mock execution adapter receives.
fn spawn_fill_simulator(manager: Weak<AlgoManager>, orders: Receiver<Order>) {
    thread::spawn(move || {
        for order in orders {
            let Some(manager) = manager.upgrade() else {
                break;
            };
            manager.handle(Confirmation::new(order.id, ExecType::New));
            manager.handle(Confirmation::fill(
                order.id,
                order.contract.qty,
                order.contract.price,
                true,
            ));
        }
    });
}

fn spawn_demo(manager: &Arc<AlgoManager>) -> Result<()> {
    let params = ParamMap::new()
        .with(
            "security",
            SecurityTuple {
                src: DataSrc::DEFAULT,
                sec: DEMO_SECURITY,
                acc: 0,
                side: OrderSide::Buy,
                qty: 1_000.0,
            },
        )
        .with("duration_secs", 60)
        .with("slices", 12);
    let raw = params.to_json()?;
    let token = format!("demo-twap-{}", chrono::Utc::now().timestamp_millis());
    manager
        .spawn(params, "TWAP", &User::new(0, "demo"), &raw, &token)
        .context("Failed to spawn demo TWAP")?;

    let feed = Arc::downgrade(manager);
    thread::spawn(move || {
        let mut md = MarketData::default();
        let mut step = 0u32;
        while let Some(manager) = feed.upgrade() {
            if !manager.is_running() {
                break;
            }
            let mid = 100.0 + (f64::from(step) / 10.0).sin();
            md.tm = chrono::Utc::now().timestamp_millis();
            md.quote.bid_price = mid - 0.05;
            md.quote.ask_price = mid + 0.05;
            md.quote.bid_size = 500.0;
            md.quote.ask_size = 500.0;
            if step % 5 == 0 {
                md.trade.update(mid, 10.0);
            }
            manager.update(DataSrc::DEFAULT, DEMO_SECURITY, md);
            drop(manager);

            step = step.wrapping_add(1);
            thread::sleep(Duration::from_millis(200));
        }
    });
    Ok(())
}

fn spawn_signal_watcher(manager: Weak<AlgoManager>) {
    thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                error!("Failed to build signal runtime: {}", e);
                return;
            }
        };
        if let Err(e) = runtime.block_on(tokio::signal::ctrl_c()) {
            error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        info!("Shutdown signal received.");
        if let Some(manager) = manager.upgrade() {
            manager.shutdown();
        }
    });
}
