//! Orchestration of a full clone run: introspect under one snapshot,
//! install pre-data schema, run the copy/index/blob supervisors
//! concurrently, install post-data, reset sequences, and (in follow mode)
//! keep the target synchronized through the CDC pipeline.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::catalog::{Catalog, PlanInit};
use crate::cdc::{self, StreamMode};
use crate::config::{RunConfig, StreamConfig};
use crate::filters::Filters;
use crate::plan::WorkPlan;
use crate::schema::{SchemaBridge, Section};
use crate::summary::RunSummary;

/// How the run's snapshot is being kept alive. Dropping this releases it,
/// so it must outlive the copy phase.
enum SnapshotHolder {
    /// We exported it on this idle connection.
    Exported(#[allow(dead_code)] tokio_postgres::Client),
    /// The replication slot's creating connection holds it.
    Slot(#[allow(dead_code)] cdc::SlotSetup),
    /// The operator exported it elsewhere (`--snapshot`); their session
    /// owns its lifetime.
    External,
}

pub async fn run_clone(
    config: RunConfig,
    stream_config: StreamConfig,
    source_uri: &str,
    target_uri: &str,
    filters: Filters,
    follow: bool,
    cancel: CancellationToken,
) -> Result<RunSummary> {
    let started_at = chrono::Utc::now();
    config.ensure_dirs()?;
    let catalog = Arc::new(Catalog::open(&config.dir)?);

    if follow && config.resume && config.not_consistent {
        anyhow::bail!(
            "--follow cannot be combined with --resume --not-consistent: \
             the slot's consistent point no longer matches any copy snapshot"
        );
    }
    if follow && config.resume && catalog.slot_read()?.is_some() {
        anyhow::bail!(
            "the replication slot from the interrupted run still exists and its \
             snapshot cannot be re-pinned; finish the copy with `pgcopydb clone \
             --resume` and continue streaming with `pgcopydb stream replay`"
        );
    }

    // Acquire the snapshot. In follow mode the slot must exist before the
    // first row is copied, so its consistent point bounds the bulk copy.
    let (snapshot, holder) = if follow {
        let setup = cdc::create_slot(source_uri, &stream_config).await?;
        catalog.slot_write(&setup.slot)?;
        let snapshot = setup
            .snapshot
            .clone()
            .context("slot creation returned no snapshot")?;
        (snapshot, SnapshotHolder::Slot(setup))
    } else if let Some(snapshot) = &config.snapshot {
        (snapshot.clone(), SnapshotHolder::External)
    } else {
        let client = crate::pgsql::connect(source_uri).await?;
        let snapshot = crate::pgsql::export_snapshot(&client).await?;
        (snapshot, SnapshotHolder::Exported(client))
    };
    tracing::info!("cloning under snapshot {snapshot}");

    // Introspect under the snapshot, then either seed the catalog or
    // validate a resume against it.
    let plan = {
        let client = crate::pgsql::connect_at_snapshot(source_uri, &snapshot).await?;
        crate::introspect::introspect(&client, &filters, &config, snapshot.clone()).await?
    };
    let plan: WorkPlan = match catalog.plan_init(&plan, config.resume, config.not_consistent)? {
        PlanInit::Fresh => plan,
        PlanInit::Resumed => {
            tracing::info!("resuming previous run");
            catalog.plan()?.context("resumed catalog has no plan")?
        }
    };
    let requeued = catalog.requeue_interrupted()?;
    if requeued > 0 {
        tracing::info!("requeued {requeued} tasks interrupted by a previous run");
    }
    std::fs::write(
        config.run_dir().join("plan.json"),
        serde_json::to_vec_pretty(&plan)?,
    )?;
    tracing::info!(
        "planned {} tables, {} indexes, {} constraints, {} sequences",
        plan.tables.len(),
        plan.indexes.len(),
        plan.constraints.len(),
        plan.sequences.len()
    );

    // Schema first: types and empty tables must exist before COPY.
    let bridge = SchemaBridge::new(config.clone(), source_uri.to_string(), target_uri.to_string());
    bridge.dump(Section::PreData, Some(&snapshot)).await?;
    bridge.dump(Section::PostData, Some(&snapshot)).await?;
    bridge.restore(Section::PreData, &plan, &filters).await?;

    // In follow mode the receiver buffers changes to disk while the copy
    // runs; the sentinel's apply flag keeps the applier idle until the
    // bulk copy is consistent.
    let mut sentinel = catalog.sentinel_read()?;
    sentinel.apply = false;
    sentinel.start_pos = catalog
        .slot_read()?
        .map(|s| s.consistent_point)
        .unwrap_or(sentinel.start_pos);
    if let Some(endpos) = stream_config.end_pos {
        sentinel.end_pos = endpos;
    }
    catalog.sentinel_write(sentinel)?;

    let follow_task = if follow {
        let catalog = Arc::clone(&catalog);
        let config = config.clone();
        let stream_config = stream_config.clone();
        let source_uri = source_uri.to_string();
        let target_uri = target_uri.to_string();
        let cancel = cancel.clone();
        Some(tokio::spawn(async move {
            cdc::run_stream(
                catalog,
                &config,
                &stream_config,
                &source_uri,
                &target_uri,
                StreamMode::Replay,
                cancel,
            )
            .await
        }))
    } else {
        None
    };

    // Copy, index, and blob supervisors run concurrently. Completed
    // tables flow into the index supervisor as they land.
    let (done_tx, done_rx) = mpsc::unbounded_channel();
    let index_task = {
        let catalog = Arc::clone(&catalog);
        let config = config.clone();
        let target_uri = target_uri.to_string();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            crate::indexes::run_index_phase(catalog, &config, &target_uri, done_rx, cancel).await
        })
    };
    let blob_task = {
        let catalog = Arc::clone(&catalog);
        let config = config.clone();
        let source_uri = source_uri.to_string();
        let target_uri = target_uri.to_string();
        let snapshot = snapshot.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            crate::blobs::run_blob_phase(
                catalog,
                &config,
                &source_uri,
                &target_uri,
                &snapshot,
                cancel,
            )
            .await
        })
    };

    let mut first_error: Option<anyhow::Error> = None;
    let copy_result = crate::copy::run_copy_phase(
        Arc::clone(&catalog),
        &config,
        source_uri,
        target_uri,
        &snapshot,
        done_tx,
        cancel.clone(),
    )
    .await;
    if let Err(e) = copy_result {
        first_error.get_or_insert(e);
    }

    match index_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            first_error.get_or_insert(e);
        }
        Err(e) => {
            first_error.get_or_insert(anyhow::anyhow!("index supervisor panicked: {e}"));
        }
    }
    match blob_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            first_error.get_or_insert(e);
        }
        Err(e) => {
            first_error.get_or_insert(anyhow::anyhow!("blob supervisor panicked: {e}"));
        }
    }

    // The snapshot is no longer needed once every copy worker has
    // finished reading.
    drop(holder);

    if first_error.is_none() && !cancel.is_cancelled() {
        bridge.restore(Section::PostData, &plan, &filters).await?;
        refresh_matviews(target_uri, &plan).await?;
        crate::sequences::run_sequence_phase(Arc::clone(&catalog), target_uri, cancel.clone())
            .await?;
    }

    // Bulk copy is consistent; let the applier loose to catch up and
    // stay live until the stop position.
    if let Some(handle) = follow_task {
        if first_error.is_none() && !cancel.is_cancelled() {
            let mut sentinel = catalog.sentinel_read()?;
            sentinel.apply = true;
            catalog.sentinel_write(sentinel)?;
            tracing::info!("bulk copy complete, applying buffered changes");
        } else {
            // The copy failed: stop streaming, keep what is buffered.
            cancel.cancel();
        }
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                first_error.get_or_insert(e);
            }
            Err(e) => {
                first_error.get_or_insert(anyhow::anyhow!("stream pipeline panicked: {e}"));
            }
        }
    }

    let mut summary = catalog.summary()?;
    summary.started_at = Some(started_at);
    summary.finished_at = Some(chrono::Utc::now());
    std::fs::write(
        config.run_dir().join("summary.json"),
        serde_json::to_vec_pretty(&summary)?,
    )?;
    tracing::info!("\n{}", summary.render());

    match first_error {
        Some(e) => Err(e),
        None if !summary.is_success() => {
            anyhow::bail!("{} tasks failed; see summary above", summary.failed.len())
        }
        None => Ok(summary),
    }
}

async fn refresh_matviews(target_uri: &str, plan: &WorkPlan) -> Result<()> {
    if plan.matviews.is_empty() {
        return Ok(());
    }
    let client = crate::pgsql::connect(target_uri).await?;
    for matview in &plan.matviews {
        let name = format!(
            "{}.{}",
            crate::pgsql::quote_ident(&matview.schema),
            crate::pgsql::quote_ident(&matview.name)
        );
        tracing::info!("refreshing materialized view {name}");
        client
            .batch_execute(&format!("REFRESH MATERIALIZED VIEW {name}"))
            .await
            .with_context(|| format!("failed to refresh {name}"))?;
    }
    Ok(())
}
