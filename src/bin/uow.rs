//! uow CLI: run a sample operation and inspect the SQLite outbox.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::info;
use uow_rs::config::Config;
use uow_rs::event::{ChannelPublisher, EventPublisher, FanoutPublisher};
use uow_rs::storage::{OutboxPublisher, SqliteStore};
use uow_rs::telemetry::{TelemetryConfig, init_telemetry};
use uow_rs::{BaseWorkUnit, Error, RecordWorkUnit, UnitOfWorkManager};

#[derive(Parser)]
#[command(name = "uow", about = "Transactional unit of work")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Place sample orders in one unit of work and print the published batch
    Demo {
        /// Number of orders to place
        #[arg(long, default_value_t = 3)]
        orders: usize,
        /// Register a failing unit so the whole operation rolls back
        #[arg(long)]
        fail: bool,
    },
    /// List outbox events
    Events {
        /// Only events with a sequence number greater than this
        #[arg(long, default_value_t = 0)]
        since: u64,
    },
    /// List stored records
    Records,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;
    let _telemetry = init_telemetry(TelemetryConfig::from_config(&config))?;

    let store = Arc::new(match &config.database_path {
        Some(path) => SqliteStore::open(path)?,
        None => SqliteStore::temporary()?,
    });

    match cli.command {
        Command::Demo { orders, fail } => cmd_demo(store, orders, fail).await,
        Command::Events { since } => cmd_events(store, since),
        Command::Records => cmd_records(&store),
    }
}

async fn cmd_demo(store: Arc<SqliteStore>, orders: usize, fail: bool) -> anyhow::Result<()> {
    let (channel, mut batches) = ChannelPublisher::new();
    let publishers: Vec<Arc<dyn EventPublisher>> = vec![
        Arc::new(OutboxPublisher::new(Arc::clone(&store))),
        Arc::new(channel),
    ];
    let manager = UnitOfWorkManager::new(Arc::new(FanoutPublisher::new(publishers)));

    let printer = tokio::spawn(async move {
        while let Some(batch) = batches.recv().await {
            println!("Published batch of {} event(s):", batch.len());
            for event in &batch {
                println!("  {:<16}  {:<12}  {}", event.kind, event.subject, event.data);
            }
        }
    });

    let result = manager.run(|uow| {
        for n in 0..orders {
            // Later orders get lower priorities, so they run first.
            let priority = i32::try_from(orders - n).unwrap_or(i32::MAX);
            uow.register(
                RecordWorkUnit::upsert(
                    store.clone(),
                    format!("order/{n}"),
                    json!({ "number": n, "status": "placed" }),
                )
                .with_kind("order.placed")
                .with_priority(priority),
            )?;
        }
        uow.register(
            BaseWorkUnit::new("audit/demo", "audit.logged", json!({ "orders": orders }), || {
                info!("audit entry written");
                Ok(())
            })
            .with_priority(100),
        )?;
        if fail {
            uow.register(
                BaseWorkUnit::new("demo/failure", "demo.failed", json!(null), || {
                    Err(Error::Other("requested failure".to_string()))
                })
                .with_priority(50),
            )?;
        }
        Ok(uow.pending_len())
    });

    // Dropping the manager closes the channel and ends the printer.
    drop(manager);
    printer.await?;

    let units = result?;
    println!("\nCommitted {units} work unit(s).");
    cmd_records(&store)
}

fn cmd_events(store: Arc<SqliteStore>, since: u64) -> anyhow::Result<()> {
    let outbox = OutboxPublisher::new(store);
    let events = outbox.replay(since)?;

    if events.is_empty() {
        println!("No events found.");
        return Ok(());
    }

    println!("{:<6}  {:<16}  {:<16}  RECORDED", "SEQ", "KIND", "SUBJECT");
    println!("{}", "-".repeat(70));
    for (stored, decoded) in &events {
        println!(
            "{:<6}  {:<16}  {:<16}  {}{}",
            stored.seq,
            stored.kind,
            stored.subject,
            stored.recorded_at.format("%Y-%m-%d %H:%M:%S"),
            if decoded.is_some() { "" } else { "  (undecodable)" }
        );
    }
    println!("\n{} event(s)", events.len());
    Ok(())
}

fn cmd_records(store: &SqliteStore) -> anyhow::Result<()> {
    let records = store.records()?;
    if records.is_empty() {
        println!("No records found.");
        return Ok(());
    }
    for (key, value) in &records {
        println!("{key:<16}  {value}");
    }
    println!("\n{} record(s)", records.len());
    Ok(())
}
