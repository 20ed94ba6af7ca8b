//! # Chorely: Household Message Scheduler
//!
//! Runs the dispatch loop and administers the SQLite-backed message store.
//!
//! Usage:
//!   chorely run                              # Start the dispatch loop
//!   chorely schedule --recipient kid --message-type reminder --at 2026-03-01T18:00:00Z
//!   chorely upcoming --hours 48              # Pending messages due soon
//!   chorely next-runs "weekly sun 18:00"     # Preview a recurrence

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chorely_core::ChorelyConfig;
use chorely_scheduler::{DeliveryRequest, Recurrence, SchedulerEngine, SqliteMessageStore};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "chorely",
    version,
    about = "📅 Chorely: reminders, digests and status updates for household chores"
)]
struct Cli {
    /// Config file (default: ~/.chorely/config.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the dispatch loop (Ctrl-C to stop)
    Run,
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Schedule a one-off message
    Schedule {
        #[arg(long)]
        recipient: String,
        #[arg(long, default_value = "reminder")]
        message_type: String,
        /// When to send (RFC 3339)
        #[arg(long)]
        at: String,
        #[arg(long)]
        channel: Option<String>,
        /// JSON payload
        #[arg(long, default_value = "{}")]
        payload: String,
        #[arg(long)]
        max_attempts: Option<u32>,
    },
    /// Cancel a pending message
    Cancel { id: String },
    /// List pending messages due within the next hours
    Upcoming {
        #[arg(long, default_value = "24")]
        hours: u64,
    },
    /// Message counts by status
    Stats,
    /// Print the next trigger instants of a recurrence expression
    NextRuns {
        expression: String,
        #[arg(long, default_value = "5")]
        count: usize,
    },
}

fn expand_path(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).to_string())
}

fn config_path(cli: &Cli) -> PathBuf {
    cli.config
        .as_deref()
        .map(expand_path)
        .unwrap_or_else(ChorelyConfig::default_path)
}

fn load_config(cli: &Cli) -> Result<ChorelyConfig> {
    let config = match &cli.config {
        Some(path) => ChorelyConfig::load_from(&expand_path(path))?,
        None => ChorelyConfig::load()?,
    };
    Ok(config)
}

/// Engine over the SQLite database regardless of the configured backend, so
/// admin commands see what a running daemon sees.
async fn admin_engine(config: &ChorelyConfig) -> Result<SchedulerEngine> {
    let path = config.storage.expanded_sqlite_path();
    let db = Arc::new(
        SqliteMessageStore::open(&path).with_context(|| format!("opening {}", path.display()))?,
    );
    let engine = SchedulerEngine::builder()
        .store(db.clone())
        .rule_store(db)
        .build();
    engine.load_rules().await?;
    Ok(engine)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        "chorely=debug,chorely_scheduler=debug,chorely_core=debug"
    } else {
        "chorely=info,chorely_scheduler=info"
    };
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false);
    if cli.json_logs {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    match &cli.command {
        Command::Run => {
            let config = load_config(&cli)?;
            let engine = Arc::new(SchedulerEngine::from_config(&config).await?);
            tracing::info!(
                "📅 Chorely scheduler: storage={}, gateway={}",
                config.storage.backend,
                config.gateway.kind
            );

            let handle = engine.start(config.scheduler.tick_interval());
            tokio::signal::ctrl_c().await?;
            tracing::info!("🛑 Shutting down, waiting for the current tick");
            handle.stop().await;
        }
        Command::Init { force } => {
            let path = config_path(&cli);
            if path.exists() && !force {
                println!("⚠️  {} already exists (use --force to overwrite)", path.display());
                return Ok(());
            }
            ChorelyConfig::default().save_to(&path)?;
            println!("✅ Config written to {}", path.display());
        }
        Command::Schedule {
            recipient,
            message_type,
            at,
            channel,
            payload,
            max_attempts,
        } => {
            let config = load_config(&cli)?;
            let engine = admin_engine(&config).await?;

            let at: DateTime<Utc> = DateTime::parse_from_rfc3339(at)
                .with_context(|| format!("--at '{at}' is not RFC 3339"))?
                .with_timezone(&Utc);
            let payload: serde_json::Value =
                serde_json::from_str(payload).context("--payload is not valid JSON")?;

            let mut request = DeliveryRequest::new(recipient, message_type, payload);
            if let Some(channel) = channel {
                request = request.via(channel);
            }
            let id = engine.schedule_message(request, at, *max_attempts).await?;
            println!("{id}");
        }
        Command::Cancel { id } => {
            let config = load_config(&cli)?;
            let engine = admin_engine(&config).await?;
            if engine.cancel_scheduled_message(id).await? {
                println!("✅ Cancelled {id}");
            } else {
                println!("⚠️  {id} not found or no longer pending");
            }
        }
        Command::Upcoming { hours } => {
            let config = load_config(&cli)?;
            let engine = admin_engine(&config).await?;
            let upcoming = engine.get_upcoming_messages(*hours).await?;
            if upcoming.is_empty() {
                println!("Nothing due in the next {hours}h");
            }
            for msg in upcoming {
                println!(
                    "{}  {}  {:<12} {:<10} attempts {}/{}",
                    msg.scheduled_for.to_rfc3339(),
                    msg.id,
                    msg.recipient_id,
                    msg.message_type,
                    msg.attempts,
                    msg.max_attempts
                );
            }
        }
        Command::Stats => {
            let config = load_config(&cli)?;
            let engine = admin_engine(&config).await?;
            let stats = engine.get_stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::NextRuns { expression, count } => {
            let recurrence = Recurrence::parse(expression)?;
            let mut after = Utc::now();
            for _ in 0..*count {
                match recurrence.next_after(after) {
                    Some(next) => {
                        println!("{}", next.to_rfc3339());
                        after = next;
                    }
                    None => {
                        println!("(no further runs)");
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}
