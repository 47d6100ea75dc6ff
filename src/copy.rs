//! The Copy Supervisor: a fixed-size worker pool that streams table rows
//! from source to target over the binary COPY protocol, with no
//! intermediate storage.
//!
//! Scheduling is largest-first: the catalog hands back tasks ordered by
//! size, so the longest copies start earliest and the pool's makespan stays
//! close to the biggest single table. Split tables contribute one queue
//! item per range; the table itself counts as copied only when its last
//! range lands.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use futures::{pin_mut, SinkExt, TryStreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_postgres::Client;
use tokio_util::sync::CancellationToken;

use crate::catalog::{Catalog, TaskKind};
use crate::config::{CopyPolicy, RunConfig};
use crate::error::is_transient;
use crate::plan::{SplitStrategy, TablePart, TableTask, TaskState};

/// One unit of copy work: a whole table, or one range of a split table.
#[derive(Debug, Clone)]
struct CopyItem {
    table: TableTask,
    part: Option<TablePart>,
}

impl CopyItem {
    fn display(&self) -> String {
        match &self.part {
            Some(part) => format!("{} part {}", self.table.display_name(), part.part),
            None => self.table.display_name(),
        }
    }
}

/// Everything the worker pool shares.
struct CopyContext {
    catalog: Arc<Catalog>,
    config: RunConfig,
    source_uri: String,
    target_uri: String,
    snapshot: String,
    queue: Mutex<VecDeque<CopyItem>>,
    /// Completed ordinary tables flow to the index supervisor.
    done_tx: mpsc::UnboundedSender<u32>,
    cancel: CancellationToken,
}

/// Run the bulk copy phase to completion. Completed table OIDs are pushed
/// into `done_tx` as they finish (including, at startup, tables a previous
/// run already copied) so index builds overlap with the remaining copies.
pub async fn run_copy_phase(
    catalog: Arc<Catalog>,
    config: &RunConfig,
    source_uri: &str,
    target_uri: &str,
    snapshot: &str,
    done_tx: mpsc::UnboundedSender<u32>,
    cancel: CancellationToken,
) -> Result<()> {
    let tasks = catalog.table_tasks()?;
    let mut queue = VecDeque::new();

    for (table, state) in &tasks {
        match state {
            TaskState::Copied => {
                // Resumed run: the data is there, but its indexes may not be.
                let _ = done_tx.send(table.oid);
                continue;
            }
            TaskState::Skipped => {
                // Structure-only tables still get their indexes.
                if table.parent_oid.is_none() {
                    let _ = done_tx.send(table.oid);
                }
                continue;
            }
            TaskState::Failed => continue,
            TaskState::Planned | TaskState::InProgress => {}
        }

        match &table.split {
            SplitStrategy::None => queue.push_back(CopyItem {
                table: table.clone(),
                part: None,
            }),
            SplitStrategy::CtidRange { .. } | SplitStrategy::IntegerColumn { .. } => {
                let parts = catalog.table_parts(table.oid)?;
                // Truncation cannot be left to the racing range workers;
                // do it once up front, and only when no range has landed
                // yet (a resumed run must keep what it has).
                if config.copy_policy == CopyPolicy::Truncate
                    && parts.iter().all(|(_, s)| *s != TaskState::Copied)
                {
                    truncate_table(target_uri, table).await?;
                }
                for (part, part_state) in parts {
                    if part_state == TaskState::Copied {
                        continue;
                    }
                    queue.push_back(CopyItem {
                        table: table.clone(),
                        part: Some(part),
                    });
                }
            }
        }
    }

    if queue.is_empty() {
        tracing::info!("no tables need copying");
        return Ok(());
    }
    tracing::info!(
        "copying {} table tasks with {} workers",
        queue.len(),
        config.table_jobs
    );

    let ctx = Arc::new(CopyContext {
        catalog,
        config: config.clone(),
        source_uri: source_uri.to_string(),
        target_uri: target_uri.to_string(),
        snapshot: snapshot.to_string(),
        queue: Mutex::new(queue),
        done_tx,
        cancel,
    });

    let mut workers = JoinSet::new();
    for worker in 0..ctx.config.table_jobs.max(1) {
        let ctx = Arc::clone(&ctx);
        workers.spawn(async move { copy_worker(worker, ctx).await });
    }

    let mut first_error = None;
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                // Peers keep draining so their progress persists; the
                // phase still reports the first failure.
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
            Err(e) => {
                if first_error.is_none() {
                    first_error = Some(anyhow::anyhow!("copy worker panicked: {e}"));
                }
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn truncate_table(target_uri: &str, table: &TableTask) -> Result<()> {
    let target = crate::pgsql::connect(target_uri).await?;
    target
        .batch_execute(&format!("TRUNCATE ONLY {}", table.qualified_name()))
        .await
        .with_context(|| format!("failed to truncate {}", table.display_name()))?;
    Ok(())
}

async fn copy_worker(worker: usize, ctx: Arc<CopyContext>) -> Result<()> {
    loop {
        if ctx.cancel.is_cancelled() {
            return Ok(());
        }
        let item = match ctx.queue.lock().expect("copy queue lock").pop_front() {
            Some(item) => item,
            None => return Ok(()),
        };

        let claimed = match &item.part {
            Some(part) => ctx.catalog.part_claim(part.table_oid, part.part)?,
            None => ctx.catalog.task_claim(TaskKind::Table, item.table.oid)?,
        };
        if !claimed {
            continue;
        }
        ctx.catalog.table_started(item.table.oid)?;

        tracing::info!("worker {worker} copying {}", item.display());
        match copy_one(&ctx, &item).await {
            Ok((bytes, rows)) => {
                let table_complete = match &item.part {
                    Some(part) => ctx.catalog.part_done(part.table_oid, part.part, bytes, rows)?,
                    None => {
                        ctx.catalog.table_done(item.table.oid, bytes, rows)?;
                        true
                    }
                };
                tracing::info!(
                    "worker {worker} copied {} ({bytes} bytes, {rows} rows)",
                    item.display()
                );
                if table_complete {
                    if item.part.is_some() {
                        ctx.catalog.table_done(item.table.oid, 0, 0)?;
                    }
                    let _ = ctx.done_tx.send(item.table.oid);
                }
            }
            Err(e) => handle_copy_failure(&ctx, &item, e).await?,
        }
    }
}

/// Decide between requeue and terminal failure after a copy attempt died.
async fn handle_copy_failure(ctx: &CopyContext, item: &CopyItem, e: anyhow::Error) -> Result<()> {
    let message = format!("{e:#}");
    let transient = e
        .downcast_ref::<tokio_postgres::Error>()
        .map(is_transient)
        .unwrap_or(false);
    let attempts = match &item.part {
        Some(part) => ctx.catalog.part_attempts(part.table_oid, part.part)?,
        None => ctx.catalog.attempts(TaskKind::Table, item.table.oid)?,
    };

    if ctx.cancel.is_cancelled() {
        // Shutdown, not a real failure: leave the task claimable.
        requeue(ctx, item, "cancelled")?;
        return Ok(());
    }

    if transient && attempts < ctx.config.max_attempts {
        tracing::warn!(
            "copy of {} failed (attempt {attempts}/{}): {message}",
            item.display(),
            ctx.config.max_attempts
        );
        requeue(ctx, item, &message)?;
        crate::retry::wait_before_retry("table copy", attempts, ctx.config.max_attempts).await;
        ctx.queue
            .lock()
            .expect("copy queue lock")
            .push_back(item.clone());
        return Ok(());
    }

    tracing::error!(
        "copy of {} failed permanently after {attempts} attempts: {message}",
        item.display()
    );
    if let Some(part) = &item.part {
        ctx.catalog.part_failed(part.table_oid, part.part, &message)?;
    }
    ctx.catalog
        .task_failed(TaskKind::Table, item.table.oid, &message)?;
    Ok(())
}

fn requeue(ctx: &CopyContext, item: &CopyItem, message: &str) -> Result<()> {
    match &item.part {
        Some(part) => ctx.catalog.part_requeue(part.table_oid, part.part, message)?,
        None => ctx
            .catalog
            .task_requeue(TaskKind::Table, item.table.oid, message)?,
    }
    Ok(())
}

/// Copy one item: claim connections, optionally truncate, stream binary
/// COPY from source to target. Connections drop on every exit path.
async fn copy_one(ctx: &CopyContext, item: &CopyItem) -> Result<(u64, u64)> {
    let source = crate::pgsql::connect_at_snapshot(&ctx.source_uri, &ctx.snapshot).await?;
    let target = crate::pgsql::connect(&ctx.target_uri).await?;

    // Whole-table copies truncate here; split ranges were handled by the
    // supervisor before the ranges were queued.
    if item.part.is_none() && ctx.config.copy_policy == CopyPolicy::Truncate {
        target
            .batch_execute(&format!("TRUNCATE ONLY {}", item.table.qualified_name()))
            .await
            .with_context(|| format!("failed to truncate {}", item.table.display_name()))?;
    }

    let source_sql = copy_source_query(&item.table, item.part.as_ref());
    let target_sql = format!(
        "COPY {} FROM STDIN (FORMAT binary)",
        item.table.qualified_name()
    );

    pump(&source, &target, &source_sql, &target_sql, &ctx.cancel).await
}

/// Stream every COPY buffer from the source to the target. Cancellation
/// aborts mid-stream; dropping the sink without finish() makes the target
/// abort the COPY and roll back.
async fn pump(
    source: &Client,
    target: &Client,
    source_sql: &str,
    target_sql: &str,
    cancel: &CancellationToken,
) -> Result<(u64, u64)> {
    let stream = source
        .copy_out(source_sql)
        .await
        .context("COPY TO STDOUT failed")?;
    let sink = target
        .copy_in(target_sql)
        .await
        .context("COPY FROM STDIN failed")?;
    pin_mut!(stream);
    pin_mut!(sink);

    let mut bytes: u64 = 0;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                anyhow::bail!("copy cancelled");
            }
            chunk = stream.try_next() => {
                match chunk.context("reading COPY stream")? {
                    Some(buf) => {
                        bytes += buf.len() as u64;
                        sink.send(buf).await.context("writing COPY stream")?;
                    }
                    None => break,
                }
            }
        }
    }

    let rows = sink.finish().await.context("finishing COPY")?;
    Ok((bytes, rows))
}

/// The source-side COPY statement for a table or one of its ranges.
fn copy_source_query(table: &TableTask, part: Option<&TablePart>) -> String {
    let name = table.qualified_name();
    let Some(part) = part else {
        return format!("COPY {name} TO STDOUT (FORMAT binary)");
    };

    let predicate = match &table.split {
        SplitStrategy::CtidRange { .. } => match part.upper {
            Some(upper) => format!(
                "ctid >= '({},0)'::tid AND ctid < '({},0)'::tid",
                part.lower, upper
            ),
            None => format!("ctid >= '({},0)'::tid", part.lower),
        },
        SplitStrategy::IntegerColumn { column, .. } => {
            let col = crate::pgsql::quote_ident(column);
            match part.upper {
                Some(upper) => format!("{col} >= {} AND {col} < {}", part.lower, upper),
                None => format!("{col} >= {}", part.lower),
            }
        }
        SplitStrategy::None => String::from("true"),
    };

    format!("COPY (SELECT * FROM {name} WHERE {predicate}) TO STDOUT (FORMAT binary)")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::ReplicaIdentity;

    fn table(split: SplitStrategy) -> TableTask {
        TableTask {
            oid: 100,
            schema: "public".into(),
            name: "events".into(),
            bytes: 1 << 30,
            reltuples: 1_000_000,
            replica_identity: ReplicaIdentity::Default,
            parent_oid: None,
            split,
            relpages: 131072,
            copy_data: true,
            identity_columns: vec!["id".into()],
        }
    }

    #[test]
    fn test_whole_table_copy_query() {
        let t = table(SplitStrategy::None);
        assert_eq!(
            copy_source_query(&t, None),
            "COPY public.events TO STDOUT (FORMAT binary)"
        );
    }

    #[test]
    fn test_ctid_range_copy_query() {
        let t = table(SplitStrategy::CtidRange { parts: 4 });
        let bounded = TablePart {
            table_oid: 100,
            part: 0,
            lower: 0,
            upper: Some(32768),
        };
        assert_eq!(
            copy_source_query(&t, Some(&bounded)),
            "COPY (SELECT * FROM public.events WHERE ctid >= '(0,0)'::tid \
             AND ctid < '(32768,0)'::tid) TO STDOUT (FORMAT binary)"
        );

        let unbounded = TablePart {
            table_oid: 100,
            part: 3,
            lower: 98304,
            upper: None,
        };
        assert_eq!(
            copy_source_query(&t, Some(&unbounded)),
            "COPY (SELECT * FROM public.events WHERE ctid >= '(98304,0)'::tid) \
             TO STDOUT (FORMAT binary)"
        );
    }

    #[test]
    fn test_integer_column_copy_query() {
        let t = table(SplitStrategy::IntegerColumn {
            column: "id".into(),
            parts: 2,
        });
        let bounded = TablePart {
            table_oid: 100,
            part: 0,
            lower: 1,
            upper: Some(500_001),
        };
        assert_eq!(
            copy_source_query(&t, Some(&bounded)),
            "COPY (SELECT * FROM public.events WHERE id >= 1 AND id < 500001) \
             TO STDOUT (FORMAT binary)"
        );
    }
}
