//! Command surface for the database log sink.
//!
//! Host tooling drives the sink through [`run_cli`] with a parsed [`Cli`];
//! every command opens the configured table, migrates it and runs exactly
//! one operation. Machine-readable output goes to stdout, diagnostics go to
//! stderr through `tracing`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use dblog_core::{
    format_record, garbage_collect, remove_duplicates, text_search, AlertNotifier,
    ListenerRegistry, LogWriter, MaintenanceBudget, RecordStore, RequestContext, SinkConfig,
};
use dblog_store_sqlite::SqliteLogStore;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "dblog")]
#[command(about = "Persistent database log sink")]
pub struct Cli {
    #[arg(long, default_value = "./dblog.sqlite3")]
    db: PathBuf,

    /// JSON sink configuration (`type`, `file`, `model`, `maxLength`, `limit`,
    /// `monitorCallback`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Overrides `model` from the config file.
    #[arg(long)]
    table: Option<String>,

    /// Print search and type listings as JSON instead of text.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Write(WriteArgs),
    Search(SearchArgs),
    Types,
    Dedup(DedupArgs),
    Gc(GcArgs),
    Truncate,
    Monitor(MonitorArgs),
}

#[derive(Debug, Args)]
pub struct WriteArgs {
    #[arg(long = "type")]
    log_type: String,
    #[arg(long)]
    message: String,
    #[arg(long, default_value = "{}")]
    context: String,
    /// Request snapshot: `{"server": {...}, "data": ..., "query": {...}, "user_id": ...}`.
    #[arg(long)]
    request: Option<String>,
}

#[derive(Debug, Args)]
pub struct SearchArgs {
    #[arg(long, default_value = "")]
    query: String,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Args)]
pub struct DedupArgs {
    #[arg(long)]
    timeout_ms: Option<u64>,
}

#[derive(Debug, Args)]
pub struct GcArgs {
    #[arg(long)]
    max_length: Option<String>,
    #[arg(long)]
    limit: Option<u64>,
    #[arg(long)]
    timeout_ms: Option<u64>,
}

#[derive(Debug, Args)]
pub struct MonitorArgs {
    #[arg(long)]
    query: String,
    /// Listener name; overrides `monitorCallback` from the config file.
    #[arg(long)]
    callback: Option<String>,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct GcOutput {
    by_age: u64,
    by_count: u64,
    total: u64,
}

#[derive(Debug, Serialize)]
struct TruncateOutput {
    deleted: u64,
}

#[derive(Debug, Serialize)]
struct MonitorOutput {
    matched: usize,
    delivered: usize,
}

/// Installs the stderr `tracing` subscriber, filtered by `RUST_LOG`
/// (default `info`).
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr),
        )
        .init();
}

/// Executes a parsed CLI invocation.
///
/// # Errors
/// Returns an error when configuration is invalid, the store cannot be
/// opened or migrated, or the requested command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let mut config = load_config(cli.config.as_deref())?;
    if let Some(table) = cli.table {
        config.model = Some(table);
    }

    match cli.command {
        Command::Gc(args) => {
            if args.max_length.is_some() {
                config.max_length = args.max_length;
            }
            if args.limit.is_some() {
                config.limit = args.limit;
            }
            config.validate()?;
            let mut store = open_store(&cli.db, &config)?;
            let budget = budget_from_timeout(args.timeout_ms);
            let now = store.now();
            let report = garbage_collect(&mut store, &config.retention_policy(), now, &budget)?;
            print_json(&GcOutput {
                by_age: report.by_age,
                by_count: report.by_count,
                total: report.total(),
            })
        }
        Command::Monitor(args) => {
            if args.callback.is_some() {
                config.monitor_callback = args.callback;
            }
            config.validate()?;
            let store = open_store(&cli.db, &config)?;
            run_monitor(&store, &config, &args.query, args.limit)
        }
        command => {
            config.validate()?;
            let mut store = open_store(&cli.db, &config)?;
            run_command(command, &mut store, &config, cli.json)
        }
    }
}

/// Executes a parsed command against an existing store handle.
///
/// # Errors
/// Returns an error when input parsing or the store operation fails.
pub fn run_command(
    command: Command,
    store: &mut SqliteLogStore,
    config: &SinkConfig,
    json: bool,
) -> Result<()> {
    match command {
        Command::Write(args) => {
            let context = parse_context_json(&args.context)?;
            let request = args
                .request
                .as_deref()
                .map(parse_request_json)
                .transpose()?;
            let mut writer = LogWriter::new(store, config);
            let record = writer.try_write(
                &args.log_type,
                Value::String(args.message),
                context,
                request.as_ref(),
            )?;
            print_json(&record)
        }
        Command::Search(args) => {
            let records = store.find_where(&text_search(&args.query), args.limit)?;
            if json {
                return print_json(&records);
            }
            let rendered: Vec<String> = records.iter().map(format_record).collect();
            println!("{}", rendered.join("\n\n"));
            Ok(())
        }
        Command::Types => {
            let types = store.distinct_types()?;
            if json {
                return print_json(&types);
            }
            for log_type in types {
                println!("{log_type}");
            }
            Ok(())
        }
        Command::Dedup(args) => {
            let report = remove_duplicates(store, &budget_from_timeout(args.timeout_ms))?;
            print_json(&report)
        }
        Command::Truncate => {
            let deleted = store.truncate_all()?;
            print_json(&TruncateOutput { deleted })
        }
        Command::Gc(_) | Command::Monitor(_) => Err(anyhow!(
            "internal dispatch error: gc and monitor are handled before store dispatch"
        )),
    }
}

fn run_monitor(
    store: &SqliteLogStore,
    config: &SinkConfig,
    query: &str,
    limit: Option<usize>,
) -> Result<()> {
    let notifier = AlertNotifier::from_config(config, &ListenerRegistry::with_builtins())?;
    let logs = store.find_where(&text_search(query), limit)?;
    let delivered = if logs.is_empty() {
        0
    } else {
        notifier.notify(&logs)?
    };

    print_json(&MonitorOutput {
        matched: logs.len(),
        delivered,
    })
}

fn load_config(path: Option<&Path>) -> Result<SinkConfig> {
    let Some(path) = path else {
        return Ok(SinkConfig::default());
    };

    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config = SinkConfig::from_json_str(&raw)
        .with_context(|| format!("invalid config file {}", path.display()))?;
    Ok(config)
}

fn open_store(db_path: &Path, config: &SinkConfig) -> Result<SqliteLogStore> {
    let store = SqliteLogStore::open_with_table(db_path, config.table_name())?;
    store.migrate()?;
    tracing::debug!(db = %db_path.display(), table = store.table_name(), "log store ready");
    Ok(store)
}

fn budget_from_timeout(timeout_ms: Option<u64>) -> MaintenanceBudget {
    match timeout_ms {
        Some(value) => MaintenanceBudget::with_timeout(Duration::from_millis(value)),
        None => MaintenanceBudget::unbounded(),
    }
}

fn parse_context_json(raw: &str) -> Result<Map<String, Value>> {
    let value: Value = serde_json::from_str(raw).context("--context must be valid JSON")?;
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(anyhow!("--context must be a JSON object")),
    }
}

fn parse_request_json(raw: &str) -> Result<RequestContext> {
    serde_json::from_str(raw).context("--request must be a JSON request snapshot")
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
