//! workpool CLI: operator interface to a workpool database.

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use workpool::config::{Config, ConfigOverride};
use workpool::handler::HandlerRegistry;
use workpool::model::ItemId;
use workpool::telemetry::{TelemetryConfig, init_telemetry};
use workpool::{Engine, Watchdog};

#[derive(Parser)]
#[command(name = "workpool", about = "Durable multi-tenant work queue")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show item counts for a queue
    Stats {
        /// Queue identifier
        queue: String,
    },
    /// Show a queue item
    Show {
        /// Item ID (full UUID)
        id: String,
    },
    /// Delete pointers of queues that have stayed empty
    Gc {
        /// Maximum pointers to examine
        #[arg(long, default_value_t = 64)]
        limit: usize,
    },
    /// Run pointer garbage collection until interrupted, reporting a stalled
    /// scanner. Recovery is left to processes that run the handlers.
    Maintain,
    /// Engine configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the resolved configuration and the stored override
    Show,
    /// Store a partial override read from a TOML file
    Set {
        /// Path to the TOML override
        file: PathBuf,
    },
    /// Remove the stored override
    Clear,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig::from_config(&config))?;

    // The CLI never executes work, so it registers no handlers and must
    // never start a scanner: any item it dispatched would fail for lack of
    // a handler.
    let engine = Engine::open(&config.db_path, HandlerRegistry::new())?;

    match cli.command {
        Command::Stats { queue } => cmd_stats(&engine, &queue),
        Command::Show { id } => cmd_show(&engine, &id),
        Command::Gc { limit } => {
            let deleted = engine.garbage_collect_pointers(limit)?;
            println!("Deleted {deleted} idle queue pointer(s)");
            Ok(())
        }
        Command::Maintain => cmd_maintain(engine).await,
        Command::Config { action } => match action {
            ConfigAction::Show => cmd_config_show(&engine),
            ConfigAction::Set { file } => {
                let overrides = ConfigOverride::from_toml_file(&file)?;
                engine.set_stored_config(&overrides)?;
                println!("Stored override from {}", file.display());
                Ok(())
            }
            ConfigAction::Clear => {
                engine.clear_stored_config()?;
                println!("Stored override cleared");
                Ok(())
            }
        },
    }
}

fn cmd_stats(engine: &Engine, queue: &str) -> anyhow::Result<()> {
    let stats = engine.get_queue_stats(queue)?;
    println!("Queue:    {queue}");
    println!("Items:    {}", stats.item_count);
    println!("Pending:  {}", stats.pending_count);
    println!("Leased:   {}", stats.leased_count);

    match engine.get_pointer(queue)? {
        Some(pointer) => {
            println!("---");
            println!("Next:     {}", format_ms(pointer.vesting_time));
            println!("Active:   {}", format_ms(pointer.last_active_time));
            println!(
                "Order:    {}",
                pointer
                    .order_by
                    .map(|o| o.to_string())
                    .unwrap_or("default".to_string())
            );
        }
        None => println!("No pointer (queue idle)"),
    }
    Ok(())
}

fn cmd_show(engine: &Engine, id: &str) -> anyhow::Result<()> {
    let id: ItemId = id.parse()?;
    let Some(item) = engine.get_item(id)? else {
        anyhow::bail!("no queue item {id}");
    };

    println!("ID:         {}", item.id);
    println!("Queue:      {}", item.queue_id);
    println!("Handler:    {} ({})", item.handler, item.handler_kind);
    println!("Phase:      {}", item.phase);
    println!("Vesting:    {}", format_ms(item.vesting_time));
    println!("Errors:     {}", item.error_count);
    println!(
        "Retry:      {}",
        if item.retry_enabled {
            format!(
                "up to {} attempts, {}ms x{}",
                item.retry_behavior.max_attempts,
                item.retry_behavior.initial_backoff_ms,
                item.retry_behavior.base
            )
        } else {
            "disabled".to_string()
        }
    );
    println!("Created:    {}", format_ms(item.created_at));
    println!("Payload:    {}", serde_json::to_string_pretty(&item.payload)?);
    if let Some(lease) = item.lease {
        println!("Lease:      {} until {}", lease.id, format_ms(lease.expiry));
    }
    if let Some(ref callback) = item.on_complete {
        println!("---");
        println!("Callback:   {callback}");
        if let Some(status) = item.completion_status {
            println!("Status:     {status}");
        }
        if let Some(ref result) = item.completion_result {
            println!("Result:     {}", serde_json::to_string_pretty(result)?);
        }
        println!("Timeouts:   {}", item.on_complete_timeout_retries);
    }
    Ok(())
}

async fn cmd_maintain(engine: Engine) -> anyhow::Result<()> {
    let shutdown = Arc::new(tokio::sync::Notify::new());
    let signal = Arc::clone(&shutdown);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        signal.notify_one();
    });

    engine.run_maintenance(shutdown, Watchdog::Report).await;
    Ok(())
}

fn cmd_config_show(engine: &Engine) -> anyhow::Result<()> {
    println!("Resolved:");
    println!("{}", serde_json::to_string_pretty(&engine.config()?)?);
    match engine.stored_config()? {
        Some(stored) => {
            println!("Stored override:");
            println!("{}", serde_json::to_string_pretty(&stored)?);
        }
        None => println!("No stored override"),
    }
    Ok(())
}

fn format_ms(ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
        .unwrap_or_else(|| ms.to_string())
}
