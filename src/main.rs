use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use pgcopydb::catalog::Catalog;
use pgcopydb::cdc::{self, sentinel::SentinelField, StreamMode};
use pgcopydb::config::RunConfig;
use pgcopydb::filters::Filters;
use pgcopydb::plan::WorkPlan;
use pgcopydb::schema::{SchemaBridge, Section};
use pgcopydb::{ConnectionOpts, RunOpts, SourceOpts, StreamOpts};

#[derive(Parser)]
#[command(name = "pgcopydb")]
#[command(about = "Clone a PostgreSQL database into another live instance")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Clone the whole database: schema, data, indexes, constraints,
    /// sequences, and blobs
    Clone {
        #[command(flatten)]
        conn: ConnectionOpts,
        #[command(flatten)]
        run: RunOpts,
        #[command(flatten)]
        stream: StreamOpts,
        /// Keep the target synchronized through logical decoding after
        /// the bulk copy
        #[arg(long)]
        follow: bool,
    },
    /// Run individual phases of a clone
    Copy {
        #[command(subcommand)]
        command: CopyCommands,
    },
    /// Change data capture operations
    Stream {
        #[command(subcommand)]
        command: StreamCommands,
    },
    /// Compare source and target
    Compare {
        #[command(subcommand)]
        command: CompareCommands,
    },
    /// Inspect the source database or run progress
    List {
        #[command(subcommand)]
        command: ListCommands,
    },
    /// Dump pre-data and post-data schema sections from the source
    Dump {
        #[command(flatten)]
        source: SourceOpts,
        #[command(flatten)]
        run: RunOpts,
    },
    /// Restore previously dumped schema sections into the target
    Restore {
        #[command(flatten)]
        conn: ConnectionOpts,
        #[command(flatten)]
        run: RunOpts,
    },
    /// Export a snapshot and hold it open until interrupted
    Snapshot {
        #[command(flatten)]
        source: SourceOpts,
    },
}

#[derive(Subcommand)]
enum CopyCommands {
    /// Copy the schema only (pre-data and post-data)
    Schema {
        #[command(flatten)]
        conn: ConnectionOpts,
        #[command(flatten)]
        run: RunOpts,
    },
    /// Copy table data, indexes, constraints, sequences, and blobs
    Data {
        #[command(flatten)]
        conn: ConnectionOpts,
        #[command(flatten)]
        run: RunOpts,
    },
    /// Copy table data only
    TableData {
        #[command(flatten)]
        conn: ConnectionOpts,
        #[command(flatten)]
        run: RunOpts,
    },
    /// Copy large objects only
    Blobs {
        #[command(flatten)]
        conn: ConnectionOpts,
        #[command(flatten)]
        run: RunOpts,
    },
    /// Reset sequence values on the target
    Sequences {
        #[command(flatten)]
        conn: ConnectionOpts,
        #[command(flatten)]
        run: RunOpts,
    },
    /// Build indexes (and their backing constraints) on the target
    Indexes {
        #[command(flatten)]
        conn: ConnectionOpts,
        #[command(flatten)]
        run: RunOpts,
    },
    /// Apply foreign key constraints on the target
    Constraints {
        #[command(flatten)]
        conn: ConnectionOpts,
        #[command(flatten)]
        run: RunOpts,
    },
}

#[derive(Subcommand)]
enum StreamCommands {
    /// Create the replication slot and initialize stream state
    Setup {
        #[command(flatten)]
        conn: ConnectionOpts,
        #[command(flatten)]
        run: RunOpts,
        #[command(flatten)]
        stream: StreamOpts,
    },
    /// Drop the replication slot and target-side progress
    Cleanup {
        #[command(flatten)]
        conn: ConnectionOpts,
        #[command(flatten)]
        run: RunOpts,
        #[command(flatten)]
        stream: StreamOpts,
    },
    /// Receive and transform changes without applying them
    Prefetch {
        #[command(flatten)]
        conn: ConnectionOpts,
        #[command(flatten)]
        run: RunOpts,
        #[command(flatten)]
        stream: StreamOpts,
    },
    /// Apply already-received changes up to the stop position
    Catchup {
        #[command(flatten)]
        conn: ConnectionOpts,
        #[command(flatten)]
        run: RunOpts,
        #[command(flatten)]
        stream: StreamOpts,
    },
    /// Receive, transform, and apply changes continuously
    Replay {
        #[command(flatten)]
        conn: ConnectionOpts,
        #[command(flatten)]
        run: RunOpts,
        #[command(flatten)]
        stream: StreamOpts,
    },
    /// Read or change the stream sentinel
    Sentinel {
        #[command(subcommand)]
        command: SentinelCommands,
    },
}

#[derive(Subcommand)]
enum SentinelCommands {
    /// Print the sentinel
    Get {
        #[command(flatten)]
        run: RunOpts,
    },
    /// Set one sentinel field
    Set {
        #[command(flatten)]
        run: RunOpts,
        /// Field to set
        #[arg(value_enum)]
        field: SentinelField,
        /// New value (an LSN, or true/false for apply)
        value: String,
    },
}

#[derive(Subcommand)]
enum CompareCommands {
    /// Compare object inventories
    Schema {
        #[command(flatten)]
        conn: ConnectionOpts,
        #[command(flatten)]
        run: RunOpts,
    },
    /// Compare row counts, optionally with checksums
    Data {
        #[command(flatten)]
        conn: ConnectionOpts,
        #[command(flatten)]
        run: RunOpts,
        /// Also compute per-table checksums (slow)
        #[arg(long)]
        checksum: bool,
    },
}

#[derive(Subcommand)]
enum ListCommands {
    Tables {
        #[command(flatten)]
        source: SourceOpts,
        #[command(flatten)]
        run: RunOpts,
    },
    Indexes {
        #[command(flatten)]
        source: SourceOpts,
        #[command(flatten)]
        run: RunOpts,
    },
    Schemas {
        #[command(flatten)]
        source: SourceOpts,
        #[command(flatten)]
        run: RunOpts,
    },
    Collations {
        #[command(flatten)]
        source: SourceOpts,
    },
    Extensions {
        #[command(flatten)]
        source: SourceOpts,
    },
    /// Show the current run's progress from the catalog
    Progress {
        #[command(flatten)]
        run: RunOpts,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cancel = cancel_on_ctrl_c();

    match cli.command {
        Commands::Clone {
            conn,
            run,
            stream,
            follow,
        } => {
            let config = run.to_config();
            let filters = run.load_filters()?;
            pgcopydb::clone::run_clone(
                config,
                stream.to_stream_config(),
                &conn.source,
                &conn.target,
                filters,
                follow,
                cancel,
            )
            .await?;
        }

        Commands::Copy { command } => run_copy_command(command, cancel).await?,
        Commands::Stream { command } => run_stream_command(command, cancel).await?,

        Commands::Compare { command } => match command {
            CompareCommands::Schema { conn, run } => {
                let filters = run.load_filters()?;
                let diff =
                    pgcopydb::compare::compare_schema(&conn.source, &conn.target, &filters).await?;
                print!("{}", diff.render());
                if !diff.is_empty() {
                    std::process::exit(1);
                }
            }
            CompareCommands::Data {
                conn,
                run,
                checksum,
            } => {
                let filters = run.load_filters()?;
                let report =
                    pgcopydb::compare::compare_data(&conn.source, &conn.target, &filters, checksum)
                        .await?;
                print!("{}", pgcopydb::compare::render_data_report(&report));
                if report.iter().any(|row| !row.matches()) {
                    std::process::exit(1);
                }
            }
        },

        Commands::List { command } => match command {
            ListCommands::Tables { source, run } => {
                let filters = run.load_filters()?;
                print!("{}", pgcopydb::list::list_tables(&source.source, &filters).await?);
            }
            ListCommands::Indexes { source, run } => {
                let filters = run.load_filters()?;
                print!(
                    "{}",
                    pgcopydb::list::list_indexes(&source.source, &filters).await?
                );
            }
            ListCommands::Schemas { source, run } => {
                let filters = run.load_filters()?;
                print!(
                    "{}",
                    pgcopydb::list::list_schemas(&source.source, &filters).await?
                );
            }
            ListCommands::Collations { source } => {
                print!("{}", pgcopydb::list::list_collations(&source.source).await?);
            }
            ListCommands::Extensions { source } => {
                print!("{}", pgcopydb::list::list_extensions(&source.source).await?);
            }
            ListCommands::Progress { run } => {
                let catalog = Catalog::open(&run.dir)?;
                print!("{}", pgcopydb::list::list_progress(&catalog)?);
            }
        },

        Commands::Dump { source, run } => {
            let config = run.to_config();
            config.ensure_dirs()?;
            let bridge =
                SchemaBridge::new(config, source.source.clone(), String::new());
            bridge.dump(Section::PreData, run.snapshot.as_deref()).await?;
            bridge.dump(Section::PostData, run.snapshot.as_deref()).await?;
        }

        Commands::Restore { conn, run } => {
            let config = run.to_config();
            let filters = run.load_filters()?;
            let catalog = Catalog::open(&config.dir)?;
            // Without a plan nothing was copied out-of-band, so the whole
            // archive restores as-is.
            let plan = catalog.plan()?.unwrap_or_else(empty_plan);
            let bridge = SchemaBridge::new(config, conn.source.clone(), conn.target.clone());
            bridge.restore(Section::PreData, &plan, &filters).await?;
            bridge.restore(Section::PostData, &plan, &filters).await?;
        }

        Commands::Snapshot { source } => {
            let client = pgcopydb::pgsql::connect(&source.source).await?;
            let snapshot = pgcopydb::pgsql::export_snapshot(&client).await?;
            println!("{snapshot}");
            tracing::info!("holding snapshot {snapshot} until interrupted");
            cancel.cancelled().await;
        }
    }

    Ok(())
}

async fn run_copy_command(command: CopyCommands, cancel: CancellationToken) -> Result<()> {
    match command {
        CopyCommands::Schema { conn, run } => {
            let config = run.to_config();
            let filters = run.load_filters()?;
            config.ensure_dirs()?;
            let catalog = Arc::new(Catalog::open(&config.dir)?);
            let (plan, snapshot, _guard) =
                ensure_plan(&catalog, &config, &filters, &conn.source).await?;
            let bridge =
                SchemaBridge::new(config, conn.source.clone(), conn.target.clone());
            bridge.dump(Section::PreData, Some(&snapshot)).await?;
            bridge.dump(Section::PostData, Some(&snapshot)).await?;
            bridge.restore(Section::PreData, &plan, &filters).await?;
            bridge.restore(Section::PostData, &plan, &filters).await?;
        }
        CopyCommands::Data { conn, run } => {
            let config = run.to_config();
            let filters = run.load_filters()?;
            config.ensure_dirs()?;
            let catalog = Arc::new(Catalog::open(&config.dir)?);
            let (_plan, snapshot, _guard) =
                ensure_plan(&catalog, &config, &filters, &conn.source).await?;

            let (done_tx, done_rx) = tokio::sync::mpsc::unbounded_channel();
            let index_task = {
                let catalog = Arc::clone(&catalog);
                let config = config.clone();
                let target = conn.target.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    pgcopydb::indexes::run_index_phase(catalog, &config, &target, done_rx, cancel)
                        .await
                })
            };
            pgcopydb::copy::run_copy_phase(
                Arc::clone(&catalog),
                &config,
                &conn.source,
                &conn.target,
                &snapshot,
                done_tx,
                cancel.clone(),
            )
            .await?;
            index_task.await??;
            pgcopydb::blobs::run_blob_phase(
                Arc::clone(&catalog),
                &config,
                &conn.source,
                &conn.target,
                &snapshot,
                cancel.clone(),
            )
            .await?;
            pgcopydb::sequences::run_sequence_phase(catalog, &conn.target, cancel).await?;
        }
        CopyCommands::TableData { conn, run } => {
            let config = run.to_config();
            let filters = run.load_filters()?;
            config.ensure_dirs()?;
            let catalog = Arc::new(Catalog::open(&config.dir)?);
            let (_plan, snapshot, _guard) =
                ensure_plan(&catalog, &config, &filters, &conn.source).await?;
            // No index supervisor: completed-table signals go nowhere.
            let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel();
            tokio::spawn(async move { while done_rx.recv().await.is_some() {} });
            pgcopydb::copy::run_copy_phase(
                catalog,
                &config,
                &conn.source,
                &conn.target,
                &snapshot,
                done_tx,
                cancel,
            )
            .await?;
        }
        CopyCommands::Blobs { conn, run } => {
            let config = run.to_config();
            let filters = run.load_filters()?;
            config.ensure_dirs()?;
            let catalog = Arc::new(Catalog::open(&config.dir)?);
            let (_plan, snapshot, _guard) =
                ensure_plan(&catalog, &config, &filters, &conn.source).await?;
            pgcopydb::blobs::run_blob_phase(
                catalog,
                &config,
                &conn.source,
                &conn.target,
                &snapshot,
                cancel,
            )
            .await?;
        }
        CopyCommands::Sequences { conn, run } => {
            let config = run.to_config();
            let filters = run.load_filters()?;
            config.ensure_dirs()?;
            let catalog = Arc::new(Catalog::open(&config.dir)?);
            ensure_plan(&catalog, &config, &filters, &conn.source).await?;
            pgcopydb::sequences::run_sequence_phase(catalog, &conn.target, cancel).await?;
        }
        CopyCommands::Indexes { conn, run } => {
            let config = run.to_config();
            let filters = run.load_filters()?;
            config.ensure_dirs()?;
            let catalog = Arc::new(Catalog::open(&config.dir)?);
            let (plan, _snapshot, _guard) =
                ensure_plan(&catalog, &config, &filters, &conn.source).await?;
            let (done_tx, done_rx) = tokio::sync::mpsc::unbounded_channel();
            for table in &plan.tables {
                if table.parent_oid.is_none() {
                    let _ = done_tx.send(table.oid);
                }
            }
            drop(done_tx);
            pgcopydb::indexes::run_index_phase(catalog, &config, &conn.target, done_rx, cancel)
                .await?;
        }
        CopyCommands::Constraints { conn, run } => {
            let config = run.to_config();
            let filters = run.load_filters()?;
            config.ensure_dirs()?;
            let catalog = Arc::new(Catalog::open(&config.dir)?);
            ensure_plan(&catalog, &config, &filters, &conn.source).await?;
            // An empty completion stream skips index builds; the foreign
            // key phase still runs once the channel closes.
            let (done_tx, done_rx) = tokio::sync::mpsc::unbounded_channel::<u32>();
            drop(done_tx);
            pgcopydb::indexes::run_index_phase(catalog, &config, &conn.target, done_rx, cancel)
                .await?;
        }
    }
    Ok(())
}

async fn run_stream_command(command: StreamCommands, cancel: CancellationToken) -> Result<()> {
    match command {
        StreamCommands::Setup { conn, run, stream } => {
            let config = run.to_config();
            config.ensure_dirs()?;
            let catalog = Catalog::open(&config.dir)?;
            let slot =
                cdc::stream_setup(&catalog, &conn.source, &stream.to_stream_config()).await?;
            println!(
                "slot {} created at {} (plugin {})",
                slot.slot_name, slot.consistent_point, slot.plugin
            );
        }
        StreamCommands::Cleanup { conn, run, stream } => {
            let _ = run;
            cdc::stream_cleanup(&conn.source, &conn.target, &stream.to_stream_config()).await?;
        }
        StreamCommands::Prefetch { conn, run, stream } => {
            run_stream_mode(conn, run, stream, StreamMode::Prefetch, cancel).await?;
        }
        StreamCommands::Catchup { conn, run, stream } => {
            run_stream_mode(conn, run, stream, StreamMode::Catchup, cancel).await?;
        }
        StreamCommands::Replay { conn, run, stream } => {
            run_stream_mode(conn, run, stream, StreamMode::Replay, cancel).await?;
        }
        StreamCommands::Sentinel { command } => match command {
            SentinelCommands::Get { run } => {
                let catalog = Catalog::open(&run.dir)?;
                let sentinel = cdc::sentinel::get(&catalog)?;
                println!("{}", cdc::sentinel::render(&sentinel));
            }
            SentinelCommands::Set { run, field, value } => {
                let catalog = Catalog::open(&run.dir)?;
                let sentinel = cdc::sentinel::set(&catalog, field, &value)?;
                println!("{}", cdc::sentinel::render(&sentinel));
            }
        },
    }
    Ok(())
}

async fn run_stream_mode(
    conn: ConnectionOpts,
    run: RunOpts,
    stream: StreamOpts,
    mode: StreamMode,
    cancel: CancellationToken,
) -> Result<()> {
    let config = run.to_config();
    config.ensure_dirs()?;
    let catalog = Arc::new(Catalog::open(&config.dir)?);
    let stream_config = stream.to_stream_config();

    if stream_config.create_slot {
        cdc::stream_setup(&catalog, &conn.source, &stream_config).await?;
    }

    // Catchup and replay apply; prefetch only buffers.
    let mut sentinel = catalog.sentinel_read()?;
    sentinel.apply = mode != StreamMode::Prefetch;
    catalog.sentinel_write(sentinel)?;

    cdc::run_stream(
        catalog,
        &config,
        &stream_config,
        &conn.source,
        &conn.target,
        mode,
        cancel,
    )
    .await
}

/// Make sure the catalog has a Work Plan, introspecting under a fresh (or
/// operator-provided) snapshot when it does not. The returned client holds
/// the snapshot open; keep it alive through any data phase.
async fn ensure_plan(
    catalog: &Catalog,
    config: &RunConfig,
    filters: &Filters,
    source_uri: &str,
) -> Result<(WorkPlan, String, tokio_postgres::Client)> {
    let client = pgcopydb::pgsql::connect(source_uri).await?;
    let snapshot = match &config.snapshot {
        Some(snapshot) => {
            client
                .batch_execute("BEGIN ISOLATION LEVEL REPEATABLE READ READ ONLY")
                .await?;
            client
                .batch_execute(&format!(
                    "SET TRANSACTION SNAPSHOT {}",
                    pgcopydb::pgsql::quote_literal(snapshot)
                ))
                .await
                .with_context(|| format!("failed to attach to snapshot {snapshot}"))?;
            snapshot.clone()
        }
        None => pgcopydb::pgsql::export_snapshot(&client).await?,
    };

    let plan =
        pgcopydb::introspect::introspect(&client, filters, config, snapshot.clone()).await?;
    // Individual phases layer onto whatever run state exists already.
    let plan = match catalog.plan_init(&plan, true, true)? {
        pgcopydb::catalog::PlanInit::Fresh => plan,
        pgcopydb::catalog::PlanInit::Resumed => {
            catalog.plan()?.context("resumed catalog has no plan")?
        }
    };
    catalog.requeue_interrupted()?;
    Ok((plan, snapshot, client))
}

fn empty_plan() -> WorkPlan {
    WorkPlan {
        system_identifier: String::new(),
        timeline_id: 0,
        snapshot: String::new(),
        created_at: chrono::Utc::now(),
        filters_fingerprint: String::new(),
        tables: vec![],
        table_parts: vec![],
        indexes: vec![],
        constraints: vec![],
        sequences: vec![],
        matviews: vec![],
        blobs: Default::default(),
        extensions: vec![],
    }
}

/// One cancellation token for the whole process; Ctrl-C trips it and every
/// worker drains.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, draining workers");
            trigger.cancel();
        }
    });
    cancel
}
