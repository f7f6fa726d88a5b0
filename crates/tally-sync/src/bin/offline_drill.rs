//! # Offline Drill
//!
//! Runs a shift against the simulated backend with the terminal offline,
//! then reconnects and watches the queue drain.
//!
//! ## Usage
//! ```bash
//! # In-memory state
//! cargo run -p tally-sync --bin offline-drill
//!
//! # SQLite database and config file
//! cargo run -p tally-sync --bin offline-drill -- --db ./data/drill.db --config ./sync.toml
//!
//! # More detail
//! RUST_LOG=tally=trace cargo run -p tally-sync --bin offline-drill
//! ```
//!
//! ## Scenario
//! 1. Open a session, seat table T4, ring up two lines, submit, pay, complete
//! 2. Everything lands in the pending queue with placeholder ids
//! 3. Reconnect; the agent replays the queue and remaps the placeholders
//! 4. Print the backend's ledger and the sync status
//!
//! The simulated backend starts empty on every run. Reusing a database whose
//! session was confirmed by an earlier run leaves the order rejected.

use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tally_core::{OrderStatus, PaymentMethod, ProductSnapshot, Table, TableStatus};
use tally_db::{KvStore, MemoryKvStore};
use tally_sync::{SimulatedBackend, SyncAgent, SyncConfig};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tally=debug,sqlx=warn"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let args: Vec<String> = env::args().collect();

    let mut db_path: Option<PathBuf> = None;
    let mut config_path: Option<PathBuf> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--db" | "-d" => {
                if i + 1 < args.len() {
                    db_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!("Tally POS Offline Drill");
                println!();
                println!("Usage: offline-drill [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -d, --db <PATH>      Database file path (default: in memory)");
                println!("  -c, --config <PATH>  sync.toml to load (default: platform config dir)");
                println!("  -h, --help           Show this help message");
                return Ok(());
            }
            other => warn!(argument = other, "Ignoring unknown argument"),
        }
        i += 1;
    }

    let mut config = SyncConfig::load_or_default(config_path);
    info!(
        db = ?db_path,
        terminal_id = %config.terminal_id(),
        "Offline drill starting"
    );

    let backend = Arc::new(SimulatedBackend::new());
    backend
        .seed_tables([("T4".to_string(), TableStatus::Available)])
        .await;

    let in_memory = db_path.is_none();
    config.storage.database_path = db_path;
    let mut builder = SyncAgent::builder(config)
        .with_backend(backend.clone())
        .initially_online(false);
    if in_memory {
        builder = builder.with_kv(Arc::new(MemoryKvStore::new()) as Arc<dyn KvStore>);
    }
    let mut agent = builder.build().await?;
    agent.start().await?;

    // =========================================================================
    // Offline shift
    // =========================================================================

    let router = agent.router();
    router.load_tables(vec![Table::new("T4", "Table 4", 4)]).await?;

    if router.snapshot().await.current_session.is_none() {
        let session = router.start_session(20_000).await?;
        info!(session_id = %session.session_id, "Session opened offline");
    }

    router
        .add_to_cart(ProductSnapshot::new("p-burger", "Burger", 1_250, 420), 2, vec![], None)
        .await?;
    router
        .add_to_cart(
            ProductSnapshot::new("p-lemonade", "Lemonade", 350, 60),
            1,
            vec![],
            Some("no ice".to_string()),
        )
        .await?;
    router.set_table(Some("T4".to_string())).await?;

    let order = router.create_order().await?;
    router
        .update_order_status(&order.order_id, OrderStatus::InProgress)
        .await?;
    let payment = router
        .process_payment(&order.order_id, PaymentMethod::Card, 2_850, 300)
        .await?;
    router
        .update_order_status(&order.order_id, OrderStatus::Completed)
        .await?;

    let pending = agent.queue().len().await;
    info!(
        order_id = %order.order_id,
        transaction_ref = %payment.transaction_ref,
        pending,
        "Offline shift recorded"
    );

    // =========================================================================
    // Reconnect
    // =========================================================================

    agent.monitor().report_reachability(true);

    let queue = agent.queue();
    let engine = agent.engine();
    let drained = tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            if queue.is_empty().await && !engine.is_draining() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    if drained.is_err() {
        let pending = queue.len().await;
        warn!(pending, "Queue did not drain in time");
    }

    let status = agent.status().await;
    println!();
    println!("Sync status");
    println!("  online:        {}", status.is_online);
    println!("  engine:        {}", status.engine);
    println!("  pending:       {}", status.pending_count);
    println!("  dead letters:  {}", status.dead_letters);

    let remote = backend.snapshot().await;
    println!();
    println!("Backend ledger");
    for (id, session) in &remote.sessions {
        println!("  session {} (opening {} cents)", id, session.opening_balance_cents);
    }
    for (id, order) in &remote.orders {
        println!("  order {} -> {} ({} lines)", id, order.status, order.lines.len());
    }
    for payment in &remote.payments {
        println!(
            "  payment {} on {}: {} + {} tip ({})",
            payment.transaction_id,
            payment.order_id,
            payment.amount_cents,
            payment.tip_cents,
            payment.method
        );
    }
    for (id, table_status) in &remote.tables {
        println!("  table {} is {}", id, table_status);
    }

    agent.shutdown().await?;
    Ok(())
}
