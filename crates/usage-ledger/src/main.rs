//! usage-ledger CLI
//!
//! Thin command surface over `usage-ledger-core`: every command opens the
//! configured database, runs one core operation, and prints JSON on stdout.
//! Logs go to stderr.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::debug;

use usage_ledger_core::config::{Config, LogFormat};
use usage_ledger_core::error::{ConsumerError, SnapshotError, format_error_with_remediation};
use usage_ledger_core::jobs::{LedgerCleanupJob, SnapshotCleanupJob, SnapshotGeneratorJob};
use usage_ledger_core::ledger::{self, EventState, LedgerKind, NewLedgerEvent};
use usage_ledger_core::logging::init_logging;
use usage_ledger_core::retention::RetentionEngine;
use usage_ledger_core::schema::SCHEMA_VERSION;
use usage_ledger_core::snapshot_engine::SnapshotEngine;
use usage_ledger_core::telemetry::MetricRegistry;
use usage_ledger_core::{consumers, snapshot_store};

const CONFIG_ENV: &str = "USAGE_LEDGER_CONFIG";
const DB_ENV: &str = "USAGE_LEDGER_DB";

#[derive(Parser, Debug)]
#[command(name = "usage-ledger", version, about = "Usage event ledgers with snapshots and retention")]
struct Cli {
    /// Config file (TOML). Defaults to the user config dir when present.
    #[arg(long, global = true, env = CONFIG_ENV)]
    config: Option<PathBuf>,

    /// SQLite database path, overriding the config file.
    #[arg(long, global = true, env = DB_ENV)]
    db: Option<PathBuf>,

    #[arg(long, global = true, value_name = "pretty|json")]
    log_format: Option<LogFormat>,

    /// Log level filter (RUST_LOG still wins).
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the database schema.
    Init,

    /// Request, generate, inspect, and clean up usage snapshots.
    #[command(subcommand)]
    Snapshot(SnapshotCommand),

    /// Delete old ledger events.
    #[command(subcommand)]
    Retention(RetentionCommand),

    /// Manage consumer watermarks.
    #[command(subcommand)]
    Consumer(ConsumerCommand),

    /// Append to and read from the ledgers.
    #[command(subcommand)]
    Events(EventsCommand),
}

#[derive(Args, Debug)]
struct Page {
    #[arg(long, default_value_t = 0)]
    offset: u64,

    #[arg(long, default_value_t = 50)]
    limit: u64,
}

#[derive(Subcommand, Debug)]
enum SnapshotCommand {
    /// Request a snapshot and generate it.
    Create {
        kind: LedgerKind,

        /// Only create the placeholder.
        #[arg(long)]
        no_generate: bool,
    },
    /// Generate a previously requested snapshot.
    Generate { guid: String },
    Show { guid: String },
    List {
        #[arg(long)]
        kind: Option<LedgerKind>,

        #[command(flatten)]
        page: Page,
    },
    /// Chunks of a completed snapshot.
    Chunks {
        guid: String,

        #[command(flatten)]
        page: Page,
    },
    Delete { guid: String },
    /// Delete old snapshots and abandoned placeholders.
    Cleanup {
        kind: LedgerKind,

        /// Overrides `snapshots.retention_days`.
        #[arg(long)]
        days: Option<u32>,
    },
}

#[derive(Subcommand, Debug)]
enum RetentionCommand {
    /// Run the configured retention policy for one ledger.
    Run {
        kind: LedgerKind,

        /// Report what would be deleted without deleting.
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Subcommand, Debug)]
enum ConsumerCommand {
    Register {
        kind: LedgerKind,
        consumer_guid: String,
        last_processed_guid: String,
    },
    Show {
        kind: LedgerKind,
        consumer_guid: String,
    },
    /// Move a consumer's watermark.
    Update {
        kind: LedgerKind,
        consumer_guid: String,
        last_processed_guid: String,
    },
    Deregister {
        kind: LedgerKind,
        consumer_guid: String,
    },
    List { kind: LedgerKind },
}

#[derive(Subcommand, Debug)]
enum EventsCommand {
    /// Append one event (producer side).
    Append {
        kind: LedgerKind,
        resource_guid: String,

        #[arg(long)]
        state: EventState,

        #[arg(long)]
        guid: Option<String>,

        #[arg(long)]
        name: Option<String>,

        #[arg(long, requires_all = ["space"])]
        org: Option<String>,

        #[arg(long, requires_all = ["org"])]
        space: Option<String>,

        #[arg(long)]
        space_name: Option<String>,

        /// JSON object stored with the event.
        #[arg(long)]
        payload: Option<String>,
    },
    /// Events after a watermark, oldest first.
    Tail {
        kind: LedgerKind,

        #[arg(long)]
        after: Option<String>,

        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
}

fn default_config_path() -> Option<PathBuf> {
    let path = dirs::config_dir()?.join("usage-ledger").join("config.toml");
    path.exists().then_some(path)
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = match cli.config.clone().or_else(default_config_path) {
        Some(path) => Config::load_from(&path)?,
        None => Config::default(),
    };
    if let Some(db) = &cli.db {
        config.storage.db_path.clone_from(db);
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    if let Some(level) = &cli.log_level {
        config.logging.level.clone_from(level);
    }
    config.validate()?;
    Ok(config)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn missing_snapshot(guid: &str) -> usage_ledger_core::Error {
    SnapshotError::NotFound(guid.to_string()).into()
}

fn missing_consumer(guid: &str) -> usage_ledger_core::Error {
    ConsumerError::NotFound(guid.to_string()).into()
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli)?;
    init_logging(&config.logging).context("failed to initialize logging")?;
    debug!(db = %config.storage.db_path.display(), "Loaded configuration");

    let storage = config.storage.clone();
    let conn = storage.open()?;

    match cli.command {
        Command::Init => print_json(&serde_json::json!({
            "db_path": storage.db_path,
            "schema_version": SCHEMA_VERSION,
        })),

        Command::Snapshot(cmd) => {
            let metrics = Arc::new(MetricRegistry::new());
            let engine = Arc::new(SnapshotEngine::new(
                config.snapshots.generation_settings(),
                metrics.clone(),
            ));
            match cmd {
                SnapshotCommand::Create { kind, no_generate } => {
                    let placeholder = engine.request_snapshot(&conn, kind)?;
                    if no_generate {
                        return print_json(&placeholder);
                    }
                    let snapshot = SnapshotGeneratorJob::new(placeholder.guid)
                        .perform_async(storage, engine)
                        .await?;
                    debug!(metrics = ?metrics.snapshot(), "Generation metrics");
                    print_json(&snapshot)
                }
                SnapshotCommand::Generate { guid } => {
                    let snapshot = SnapshotGeneratorJob::new(guid).perform_async(storage, engine).await?;
                    print_json(&snapshot)
                }
                SnapshotCommand::Show { guid } => {
                    let snapshot = snapshot_store::find_snapshot(&conn, &guid)?
                        .ok_or_else(|| missing_snapshot(&guid))?;
                    print_json(&snapshot)
                }
                SnapshotCommand::List { kind, page } => {
                    print_json(&snapshot_store::list_snapshots(&conn, kind, page.offset, page.limit)?)
                }
                SnapshotCommand::Chunks { guid, page } => {
                    let snapshot = snapshot_store::find_snapshot(&conn, &guid)?
                        .ok_or_else(|| missing_snapshot(&guid))?;
                    print_json(&snapshot_store::chunks_page(&conn, &snapshot, page.offset, page.limit)?)
                }
                SnapshotCommand::Delete { guid } => {
                    if !snapshot_store::delete_snapshot(&conn, &guid)? {
                        return Err(missing_snapshot(&guid).into());
                    }
                    print_json(&serde_json::json!({ "deleted": guid }))
                }
                SnapshotCommand::Cleanup { kind, days } => {
                    let job = SnapshotCleanupJob::new(kind, days.unwrap_or(config.snapshots.retention_days))
                        .with_stale_after_minutes(config.snapshots.stale_after_minutes);
                    print_json(&job.perform_async(storage).await?)
                }
            }
        }

        Command::Retention(RetentionCommand::Run { kind, dry_run }) => {
            let policy = config.retention.policy_for(kind).clone();
            let report = if dry_run {
                RetentionEngine::for_kind(kind, policy).dry_run(&conn)?
            } else {
                LedgerCleanupJob::new(kind, policy).perform_async(storage).await?
            };
            print_json(&report)
        }

        Command::Consumer(cmd) => match cmd {
            ConsumerCommand::Register {
                kind,
                consumer_guid,
                last_processed_guid,
            } => print_json(&consumers::register(&conn, kind, &consumer_guid, &last_processed_guid)?),
            ConsumerCommand::Show { kind, consumer_guid } => {
                let registration = consumers::find(&conn, kind, &consumer_guid)?
                    .ok_or_else(|| missing_consumer(&consumer_guid))?;
                print_json(&registration)
            }
            ConsumerCommand::Update {
                kind,
                consumer_guid,
                last_processed_guid,
            } => print_json(&consumers::update_watermark(
                &conn,
                kind,
                &consumer_guid,
                &last_processed_guid,
            )?),
            ConsumerCommand::Deregister { kind, consumer_guid } => {
                consumers::deregister(&conn, kind, &consumer_guid)?;
                print_json(&serde_json::json!({ "deregistered": consumer_guid }))
            }
            ConsumerCommand::List { kind } => print_json(&consumers::list(&conn, kind)?),
        },

        Command::Events(cmd) => match cmd {
            EventsCommand::Append {
                kind,
                resource_guid,
                state,
                guid,
                name,
                org,
                space,
                space_name,
                payload,
            } => {
                let mut event = NewLedgerEvent::new(state, resource_guid);
                event.guid = guid;
                event.resource_name = name;
                event.org_guid = org;
                event.space_guid = space;
                event.space_name = space_name;
                if let Some(raw) = payload {
                    let value: serde_json::Value = serde_json::from_str(&raw)
                        .map_err(usage_ledger_core::Error::from)?;
                    event = event.with_payload(value);
                }
                print_json(&ledger::append_event(&conn, kind, &event)?)
            }
            EventsCommand::Tail { kind, after, limit } => {
                print_json(&ledger::events_after(&conn, kind, after.as_deref(), limit)?)
            }
        },
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            match err.downcast_ref::<usage_ledger_core::Error>() {
                Some(core) => eprintln!("{}", format_error_with_remediation(core)),
                None => eprintln!("Error: {err:#}"),
            }
            ExitCode::FAILURE
        }
    }
}
