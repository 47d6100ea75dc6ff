//! The Index & Constraint Supervisor.
//!
//! Wakes as each table finishes loading: constraint-backing unique indexes
//! build first, the remaining indexes fan out in parallel, then primary
//! key/unique constraints are promoted onto their freshly built indexes.
//! Foreign keys wait behind a global barrier (every referenced table
//! copied) and drain from a shared queue at the end. Vacuum/analyze runs
//! opportunistically per table behind its own semaphore.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::catalog::{Catalog, TaskKind};
use crate::config::RunConfig;
use crate::error::is_transient;
use crate::plan::{IndexTask, TaskState};

struct IndexContext {
    catalog: Arc<Catalog>,
    config: RunConfig,
    target_uri: String,
    /// Table oid -> quoted qualified name, for ALTER/VACUUM statements.
    table_names: HashMap<u32, String>,
    index_sem: Arc<Semaphore>,
    vacuum_sem: Arc<Semaphore>,
    cancel: CancellationToken,
}

/// Consume completed-table notifications until the copy phase closes the
/// channel, building each table's indexes as it lands; then apply foreign
/// keys. Individual index failures fail only that index.
pub async fn run_index_phase(
    catalog: Arc<Catalog>,
    config: &RunConfig,
    target_uri: &str,
    mut done_rx: mpsc::UnboundedReceiver<u32>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut by_table: HashMap<u32, Vec<(IndexTask, TaskState)>> = HashMap::new();
    for (task, state) in catalog.index_tasks()? {
        by_table.entry(task.table_oid).or_default().push((task, state));
    }
    let table_names: HashMap<u32, String> = catalog
        .table_tasks()?
        .iter()
        .map(|(t, _)| (t.oid, t.qualified_name()))
        .collect();

    let ctx = Arc::new(IndexContext {
        catalog,
        config: config.clone(),
        target_uri: target_uri.to_string(),
        table_names,
        index_sem: Arc::new(Semaphore::new(config.index_jobs.max(1))),
        vacuum_sem: Arc::new(Semaphore::new(config.vacuum_jobs.max(1))),
        cancel: cancel.clone(),
    });

    let mut tables = JoinSet::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = done_rx.recv() => match next {
                Some(table_oid) => {
                    let indexes = by_table.remove(&table_oid).unwrap_or_default();
                    let ctx = Arc::clone(&ctx);
                    tables.spawn(async move { table_pipeline(ctx, table_oid, indexes).await });
                }
                None => break,
            }
        }
    }

    let mut first_error = None;
    while let Some(joined) = tables.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) if first_error.is_none() => first_error = Some(e),
            Ok(Err(_)) => {}
            Err(e) if first_error.is_none() => {
                first_error = Some(anyhow::anyhow!("index worker panicked: {e}"))
            }
            Err(_) => {}
        }
    }

    if !cancel.is_cancelled() {
        if let Err(e) = foreign_key_phase(&ctx).await {
            if first_error.is_none() {
                first_error = Some(e);
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Everything that happens to one table after its rows land.
async fn table_pipeline(
    ctx: Arc<IndexContext>,
    table_oid: u32,
    indexes: Vec<(IndexTask, TaskState)>,
) -> Result<()> {
    let pending: Vec<IndexTask> = indexes
        .into_iter()
        .filter(|(_, state)| *state == TaskState::Planned)
        .map(|(task, _)| task)
        .collect();

    // Unique indexes that back constraints first: primary keys are what
    // foreign keys and upserts will lean on.
    let (backing, plain): (Vec<_>, Vec<_>) =
        pending.into_iter().partition(|i| i.constraint.is_some());

    build_group(&ctx, backing).await?;
    build_group(&ctx, plain).await?;

    if !ctx.config.skip_vacuum && !ctx.cancel.is_cancelled() {
        if let Some(table) = ctx.table_names.get(&table_oid) {
            let _permit = ctx.vacuum_sem.acquire().await.expect("vacuum semaphore");
            let client = crate::pgsql::connect(&ctx.target_uri).await?;
            tracing::info!("vacuum analyze {table}");
            if let Err(e) = client.batch_execute(&format!("VACUUM ANALYZE {table}")).await {
                // Analyze is an optimization, not part of the contract.
                tracing::warn!("vacuum analyze {table} failed: {e}");
            }
        }
    }

    Ok(())
}

/// Build a set of same-table indexes in parallel under the global
/// index-jobs budget.
async fn build_group(ctx: &Arc<IndexContext>, group: Vec<IndexTask>) -> Result<()> {
    let mut set = JoinSet::new();
    for index in group {
        let ctx = Arc::clone(ctx);
        set.spawn(async move {
            let _permit = ctx.index_sem.acquire().await.expect("index semaphore");
            build_index(&ctx, index).await
        });
    }
    let mut first_error = None;
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) if first_error.is_none() => first_error = Some(e),
            Ok(Err(_)) => {}
            Err(e) if first_error.is_none() => {
                first_error = Some(anyhow::anyhow!("index build panicked: {e}"))
            }
            Err(_) => {}
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Create one index and, when it backs a constraint, promote the
/// constraint onto it. The task is done only after both steps, so a crash
/// in between replays the promotion on resume.
async fn build_index(ctx: &IndexContext, index: IndexTask) -> Result<()> {
    if !ctx.catalog.task_claim(TaskKind::Index, index.oid)? {
        return Ok(());
    }

    let index_label = format!("{}.{}", index.schema, index.name);
    loop {
        match try_build_index(ctx, &index).await {
            Ok(()) => {
                ctx.catalog.task_done(TaskKind::Index, index.oid)?;
                tracing::info!("created index {}", index_label);
                return Ok(());
            }
            Err(e) => {
                let message = format!("{e:#}");
                let attempts = ctx.catalog.attempts(TaskKind::Index, index.oid)?;
                let transient = e
                    .downcast_ref::<tokio_postgres::Error>()
                    .map(is_transient)
                    .unwrap_or(false);
                if ctx.cancel.is_cancelled() {
                    ctx.catalog
                        .task_requeue(TaskKind::Index, index.oid, "cancelled")?;
                    return Ok(());
                }
                if transient && attempts < ctx.config.max_attempts {
                    ctx.catalog
                        .task_requeue(TaskKind::Index, index.oid, &message)?;
                    crate::retry::wait_before_retry(
                        "index build",
                        attempts,
                        ctx.config.max_attempts,
                    )
                    .await;
                    if !ctx.catalog.task_claim(TaskKind::Index, index.oid)? {
                        return Ok(());
                    }
                    continue;
                }
                // One bad index definition must not sink the table.
                tracing::error!("index {} failed: {}", index_label, message);
                ctx.catalog
                    .task_failed(TaskKind::Index, index.oid, &message)?;
                return Ok(());
            }
        }
    }
}

async fn try_build_index(ctx: &IndexContext, index: &IndexTask) -> Result<()> {
    let client = crate::pgsql::connect(&ctx.target_uri).await?;

    if let Err(e) = client.batch_execute(&index.definition).await {
        // A resumed run may find the index already there from a previous
        // attempt that died before its task update landed.
        if e.code().map(|c| c.code()) != Some("42P07") {
            return Err(anyhow::Error::new(e).context("CREATE INDEX failed"));
        }
    }

    if let Some(constraint) = &index.constraint {
        let table = ctx
            .table_names
            .get(&index.table_oid)
            .context("index references unknown table")?;
        let kind = if constraint.is_primary {
            "PRIMARY KEY"
        } else {
            "UNIQUE"
        };
        let sql = format!(
            "ALTER TABLE {table} ADD CONSTRAINT {} {kind} USING INDEX {}",
            crate::pgsql::quote_ident(&constraint.name),
            crate::pgsql::quote_ident(&index.name),
        );
        if let Err(e) = client.batch_execute(&sql).await {
            // 42710 duplicate_object, 42P16 invalid_table_definition
            // ("multiple primary keys") both mean an earlier attempt
            // already promoted it.
            let code = e.code().map(|c| c.code());
            if code != Some("42710") && code != Some("42P16") {
                return Err(anyhow::Error::new(e).context("constraint promotion failed"));
            }
        }
    }

    Ok(())
}

/// Apply every planned foreign key. Runs only after the copy phase is
/// fully drained: each FK checks that both endpoint tables actually made
/// it before touching the target.
async fn foreign_key_phase(ctx: &Arc<IndexContext>) -> Result<()> {
    let table_states: HashMap<u32, TaskState> = ctx
        .catalog
        .table_tasks()?
        .into_iter()
        .map(|(t, s)| (t.oid, s))
        .collect();

    let loaded = |oid: u32| {
        matches!(
            table_states.get(&oid),
            Some(TaskState::Copied) | Some(TaskState::Skipped)
        )
    };

    let mut set = JoinSet::new();
    for (constraint, state) in ctx.catalog.constraint_tasks()? {
        if state != TaskState::Planned {
            continue;
        }
        if !loaded(constraint.table_oid) || !loaded(constraint.referenced_table_oid) {
            ctx.catalog.task_failed(
                TaskKind::Constraint,
                constraint.oid,
                "endpoint table was not copied",
            )?;
            continue;
        }

        let ctx = Arc::clone(ctx);
        set.spawn(async move {
            let _permit = ctx.index_sem.acquire().await.expect("index semaphore");
            if !ctx.catalog.task_claim(TaskKind::Constraint, constraint.oid)? {
                return Ok::<(), anyhow::Error>(());
            }
            let sql = format!(
                "ALTER TABLE {}.{} ADD CONSTRAINT {} {}",
                crate::pgsql::quote_ident(&constraint.schema),
                crate::pgsql::quote_ident(&constraint.table),
                crate::pgsql::quote_ident(&constraint.name),
                constraint.definition,
            );
            let client = crate::pgsql::connect(&ctx.target_uri).await?;
            match client.batch_execute(&sql).await {
                Ok(()) => {
                    ctx.catalog.task_done(TaskKind::Constraint, constraint.oid)?;
                    tracing::info!("added foreign key {}", constraint.name);
                }
                Err(e) if e.code().map(|c| c.code()) == Some("42710") => {
                    // Already added by a previous run.
                    ctx.catalog.task_done(TaskKind::Constraint, constraint.oid)?;
                }
                Err(e) => {
                    let message = format!("{e:#}");
                    tracing::error!("foreign key {} failed: {message}", constraint.name);
                    ctx.catalog
                        .task_failed(TaskKind::Constraint, constraint.oid, &message)?;
                }
            }
            Ok(())
        });
    }

    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(e) => return Err(anyhow::anyhow!("constraint worker panicked: {e}")),
        }
    }
    Ok(())
}
