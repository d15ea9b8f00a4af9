// ☕ Roastery Warehouse - CLI
// init, reference loading, one-off and scheduled ETL runs, status

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, TimeZone, Utc};
use clap::{Args, Parser, Subcommand};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{info, warn};

use roastery_warehouse::config::DEFAULT_CONFIG_PATH;
use roastery_warehouse::db::count_orphaned_transactions;
use roastery_warehouse::logging::LogLevel;
use roastery_warehouse::scheduler::backfill_with_retry;
use roastery_warehouse::{
    build_connector, fail_abandoned_batches, get_all_watermarks, get_recent_batches,
    get_source_totals, get_unresolved_lines, init_logging, open_database, replace_reference_data,
    retry_unresolved, run_scheduler, run_with_retry, ExtractWindow, Pipeline, ReferenceData,
    RunReport, SkuMap, Source, WarehouseConfig,
};

#[derive(Parser)]
#[command(name = "roastery-warehouse", version, about = "Coffee roastery ETL warehouse")]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH, env = "ROASTERY_CONFIG")]
    config: PathBuf,

    /// Debug-level logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the warehouse file and schema
    Init,
    /// Replace items, mappings, aliases and profiles from the reference CSVs
    LoadRefs,
    /// Incremental run from each source's watermark up to now
    Run(RunArgs),
    /// Re-extract an explicit date range for one source
    Backfill {
        source: Source,
        /// First day, inclusive (YYYY-MM-DD)
        #[arg(long)]
        from: NaiveDate,
        /// Last day, exclusive (YYYY-MM-DD)
        #[arg(long)]
        to: NaiveDate,
    },
    /// Run every enabled source on its cron schedule until Ctrl+C
    Schedule,
    /// Watermarks, row counts and recent batches
    Status {
        /// Number of recent batches to show
        #[arg(long, default_value_t = 10)]
        batches: usize,
    },
    /// Re-resolve quarantined lines against the current catalog
    ResolvePending,
}

#[derive(Args)]
struct RunArgs {
    /// Source to run
    #[arg(required_unless_present = "all", conflicts_with = "all")]
    source: Option<Source>,

    /// Run every enabled source
    #[arg(long)]
    all: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = WarehouseConfig::load(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;

    let mut log_config = config.logging.clone().with_env_overrides()?;
    if cli.verbose {
        log_config.level = LogLevel::Debug;
    }
    let _guard = init_logging(&log_config)?;

    let conn = open_database(&config.database.path).with_context(|| {
        format!("Failed to open warehouse at {}", config.database.path.display())
    })?;

    let abandoned = fail_abandoned_batches(&conn)?;
    if abandoned > 0 {
        warn!(batches = abandoned, "Marked batches left running by a previous process as failed");
    }

    match cli.command {
        Command::Init => run_init(&config.database.path),
        Command::LoadRefs => run_load_refs(conn, &config),
        Command::Run(args) => run_sources(conn, &config, args).await,
        Command::Backfill { source, from, to } => run_backfill(conn, &config, source, from, to).await,
        Command::Schedule => run_schedule(conn, &config).await,
        Command::Status { batches } => run_status(&conn, batches),
        Command::ResolvePending => run_resolve_pending(conn),
    }
}

fn run_init(path: &Path) -> Result<()> {
    println!("🗄️  Warehouse ready at {}", path.display());
    println!("   Next: roastery-warehouse load-refs");
    Ok(())
}

fn run_load_refs(mut conn: Connection, config: &WarehouseConfig) -> Result<()> {
    println!("📂 Loading reference data...");
    let data = ReferenceData::load(&config.reference).context("Failed to read reference CSVs")?;
    let summary = replace_reference_data(&mut conn, &data).context("Failed to replace reference data")?;

    println!("✓ Items:    {}", summary.items);
    println!("✓ Mappings: {}", summary.mappings);
    println!("✓ Aliases:  {}", summary.aliases);
    println!("✓ Profiles: {}", summary.profiles);
    if summary.removed_items > 0 {
        println!("✓ Removed:  {} unused items", summary.removed_items);
    }
    Ok(())
}

fn shared(conn: Connection) -> Arc<Pipeline> {
    Arc::new(Pipeline::new(Arc::new(Mutex::new(conn))))
}

async fn run_sources(conn: Connection, config: &WarehouseConfig, args: RunArgs) -> Result<()> {
    let sources = match args.source {
        Some(source) => vec![source],
        None => config.sources.enabled(),
    };
    if sources.is_empty() {
        bail!("No sources are enabled; pass a source or enable one in the configuration");
    }

    let pipeline = shared(conn);
    let mut failures = 0;
    for source in sources {
        if !config.sources.settings(source).enabled {
            warn!(source = %source, "Running a source that is disabled in the configuration");
        }

        let connector = build_connector(source, config)?;
        let settings = config.sources.settings(source);
        match run_with_retry(&pipeline, connector.as_ref(), settings, &config.retry).await {
            Ok(report) => print_report(&report),
            Err(err) => {
                failures += 1;
                println!("❌ {}: {}", source.name(), err);
            }
        }
    }

    if failures > 0 {
        bail!("{} source run(s) failed", failures);
    }
    Ok(())
}

async fn run_backfill(
    conn: Connection,
    config: &WarehouseConfig,
    source: Source,
    from: NaiveDate,
    to: NaiveDate,
) -> Result<()> {
    if from >= to {
        bail!("--from must be before --to");
    }
    let window = ExtractWindow::new(
        Utc.from_utc_datetime(&from.and_time(chrono::NaiveTime::MIN)),
        Utc.from_utc_datetime(&to.and_time(chrono::NaiveTime::MIN)),
    );

    let pipeline = shared(conn);
    let connector = build_connector(source, config)?;
    let report = backfill_with_retry(&pipeline, connector.as_ref(), window, &config.retry)
        .await
        .with_context(|| format!("Backfill of {} {} failed", source.name(), window))?;

    print_report(&report);
    Ok(())
}

async fn run_schedule(conn: Connection, config: &WarehouseConfig) -> Result<()> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            let _ = tx.send(true);
        }
    });

    println!("⏰ Scheduler running (Ctrl+C to stop)");
    run_scheduler(shared(conn), config, rx).await?;
    println!("✅ Scheduler stopped");
    Ok(())
}

fn run_status(conn: &Connection, batches: usize) -> Result<()> {
    println!("📊 Warehouse status");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    println!("\nWatermarks:");
    let watermarks = get_all_watermarks(conn)?;
    if watermarks.is_empty() {
        println!("   (no committed batches yet)");
    }
    for mark in watermarks {
        println!("   {:<11} {}", mark.source.name(), mark.watermark.to_rfc3339());
    }

    println!("\nRows:");
    for totals in get_source_totals(conn)? {
        println!(
            "   {:<11} {:>7} documents {:>8} transactions {:>6} unresolved",
            totals.source, totals.documents, totals.transactions, totals.unresolved
        );
    }

    let orphaned = count_orphaned_transactions(conn)?;
    if orphaned > 0 {
        println!("\n❌ {} transactions reference missing items", orphaned);
    }

    let pending = get_unresolved_lines(conn, None, 5)?;
    if !pending.is_empty() {
        println!("\nOldest unresolved lines:");
        for line in pending {
            println!(
                "   {} {} #{} {:?}: {}",
                line.source, line.external_id, line.line_no, line.product_name, line.reason
            );
        }
    }

    println!("\nRecent batches:");
    for batch in get_recent_batches(conn, None, batches)? {
        println!(
            "   {} {:<11} {:<9} attempt {} loaded {:>5} {}",
            batch.started_at.format("%Y-%m-%d %H:%M"),
            batch.source.name(),
            batch.status.as_str(),
            batch.attempt,
            batch.counts.loaded(),
            batch.error_message.unwrap_or_default()
        );
    }

    Ok(())
}

fn run_resolve_pending(mut conn: Connection) -> Result<()> {
    let sku_map = SkuMap::from_db(&conn)?;
    let summary = retry_unresolved(&mut conn, &sku_map).context("Failed to re-resolve lines")?;

    println!("🔁 Examined {} quarantined lines", summary.examined);
    println!("✓ Resolved:         {}", summary.resolved);
    println!("✓ Still unresolved: {}", summary.still_unresolved);
    Ok(())
}

fn print_report(report: &RunReport) {
    match &report.batch_id {
        None => println!("⏭️  {}: nothing to do for {}", report.source.name(), report.window_start.to_rfc3339()),
        Some(batch_id) => {
            println!("✅ {} batch {} (attempt {})", report.source.name(), batch_id, report.attempt);
            println!(
                "   extracted {} | inserted {} | updated {} | unchanged {} | unresolved {} | rejected {}",
                report.counts.extracted,
                report.counts.inserted,
                report.counts.updated,
                report.counts.unchanged,
                report.counts.unresolved,
                report.counts.rejected
            );
            if let Some(result) = &report.reconciliation {
                if result.has_discrepancy() {
                    println!("   ⚠️  reconciliation: {:?}", result);
                }
            }
        }
    }
}
