//! The Blob Supervisor: copy large objects in OID order through the
//! server-side `lo_*` functions, fanning each batch out across workers.
//! The highest fully copied OID is checkpointed after every batch, which
//! is the resume point.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinSet;
use tokio_postgres::Client;
use tokio_util::sync::CancellationToken;

use crate::catalog::Catalog;
use crate::config::RunConfig;

/// OIDs fetched per catalog round-trip and checkpointed together.
const BATCH_SIZE: i64 = 1000;

/// Chunk size for reading/writing large object content.
const CHUNK: i32 = 4 * 1024 * 1024;

pub async fn run_blob_phase(
    catalog: Arc<Catalog>,
    config: &RunConfig,
    source_uri: &str,
    target_uri: &str,
    snapshot: &str,
    cancel: CancellationToken,
) -> Result<()> {
    if config.skip_large_objects {
        return Ok(());
    }

    let source = crate::pgsql::connect_at_snapshot(source_uri, snapshot).await?;
    let mut last = catalog.blob_state()?.last_copied_oid;
    let mut total: u64 = 0;

    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }

        let rows = source
            .query(
                "SELECT oid FROM pg_largeobject_metadata WHERE oid > $1::oid
                 ORDER BY oid LIMIT $2",
                &[&last, &BATCH_SIZE],
            )
            .await
            .context("failed to list large objects")?;
        if rows.is_empty() {
            break;
        }

        let oids: Vec<u32> = rows.iter().map(|row| row.get(0)).collect();
        let batch_max = *oids.last().expect("non-empty batch");

        // Fan the batch out over lo-jobs workers, each with its own pair
        // of connections; blobs use a distinct protocol from table COPY.
        let jobs = config.lo_jobs.max(1);
        let mut set = JoinSet::new();
        for chunk in oids.chunks(oids.len().div_ceil(jobs)) {
            let chunk = chunk.to_vec();
            let source_uri = source_uri.to_string();
            let target_uri = target_uri.to_string();
            let snapshot = snapshot.to_string();
            let no_owner = config.no_owner;
            let cancel = cancel.clone();
            set.spawn(async move {
                let source = crate::pgsql::connect_at_snapshot(&source_uri, &snapshot).await?;
                let target = crate::pgsql::connect(&target_uri).await?;
                let mut copied = 0u64;
                for oid in chunk {
                    if cancel.is_cancelled() {
                        anyhow::bail!("cancelled");
                    }
                    copy_blob(&source, &target, oid, no_owner)
                        .await
                        .with_context(|| format!("failed to copy large object {oid}"))?;
                    copied += 1;
                }
                Ok::<u64, anyhow::Error>(copied)
            });
        }

        while let Some(joined) = set.join_next().await {
            total += joined.context("blob worker panicked")??;
        }

        catalog.blob_advance(batch_max)?;
        last = batch_max;
        tracing::info!("copied {total} large objects, checkpoint at oid {last}");
    }

    catalog.blob_done()?;
    tracing::info!("large object copy complete: {total} objects");
    Ok(())
}

/// Copy one large object's content and metadata. Content moves in chunks
/// so a multi-gigabyte blob never lives in memory at once.
async fn copy_blob(source: &Client, target: &Client, oid: u32, no_owner: bool) -> Result<()> {
    // Recreate from scratch so a partially written blob from a crashed
    // run cannot leave trailing garbage.
    target
        .execute(
            "SELECT lo_unlink($1::oid) FROM pg_largeobject_metadata WHERE oid = $1::oid",
            &[&oid],
        )
        .await?;
    target.execute("SELECT lo_create($1::oid)", &[&oid]).await?;

    let mut offset: i64 = 0;
    loop {
        let row = source
            .query_one("SELECT lo_get($1::oid, $2, $3)", &[&oid, &offset, &CHUNK])
            .await?;
        let data: Vec<u8> = row.get(0);
        if !data.is_empty() {
            target
                .execute("SELECT lo_put($1::oid, $2, $3)", &[&oid, &offset, &data])
                .await?;
        }
        if (data.len() as i32) < CHUNK {
            break;
        }
        offset += data.len() as i64;
    }

    if !no_owner {
        let row = source
            .query_one(
                "SELECT lomowner::regrole::text FROM pg_largeobject_metadata WHERE oid = $1::oid",
                &[&oid],
            )
            .await?;
        let owner: String = row.get(0);
        if let Err(e) = target
            .batch_execute(&format!("ALTER LARGE OBJECT {oid} OWNER TO {owner}"))
            .await
        {
            // Missing role on the target; the object itself arrived.
            tracing::warn!("could not set owner of large object {oid}: {e}");
        }
    }

    let row = source
        .query_one(
            "SELECT obj_description($1::oid, 'pg_largeobject')",
            &[&oid],
        )
        .await?;
    let comment: Option<String> = row.get(0);
    if let Some(comment) = comment {
        target
            .batch_execute(&format!(
                "COMMENT ON LARGE OBJECT {oid} IS {}",
                crate::pgsql::quote_literal(&comment)
            ))
            .await?;
    }

    Ok(())
}
