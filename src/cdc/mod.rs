//! Change data capture: receive, transform, and apply logical decoding
//! output so the target stays synchronized with the source after the bulk
//! copy.
//!
//! The three stages are decoupled through the filesystem: the receiver
//! appends raw plugin messages to segment files, the transformer turns
//! them into per-transaction SQL, and the single applier replays those in
//! commit order. Each stage is independently resumable; coordination
//! happens through the catalog (apply cursor + sentinel), not through
//! in-memory channels.

pub mod apply;
pub mod change;
pub mod proto;
pub mod receive;
pub mod segment;
pub mod sentinel;
pub mod test_decoding;
pub mod transform;
pub mod wal2json;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::catalog::Catalog;
use crate::cdc::apply::{Applier, ApplyOutcome};
use crate::cdc::proto::ReplicationClient;
use crate::cdc::transform::Transformer;
use crate::config::{RunConfig, StreamConfig};
use crate::lsn::Lsn;
use crate::plan::SlotState;

/// Which stages a `stream` invocation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    /// Receive and transform only; changes buffer on disk.
    Prefetch,
    /// Transform leftovers and apply; no receiving.
    Catchup,
    /// The full pipeline.
    Replay,
}

/// A freshly created replication slot. The connection is kept alive
/// because the exported snapshot dies with it; hold this for as long as
/// bulk-copy workers need to attach.
pub struct SlotSetup {
    pub slot: SlotState,
    pub snapshot: Option<String>,
    pub keepalive: ReplicationClient,
}

/// Create the logical slot before any data is copied, pinning the
/// snapshot that makes "everything before the consistent point is in the
/// bulk copy, everything after is in the stream" true.
pub async fn create_slot(source_uri: &str, stream_config: &StreamConfig) -> Result<SlotSetup> {
    let mut client = ReplicationClient::connect(source_uri).await?;
    let identity = client.identify_system().await?;
    let created = client
        .create_slot(&stream_config.slot_name, stream_config.plugin.as_str())
        .await
        .with_context(|| format!("failed to create slot {}", stream_config.slot_name))?;

    tracing::info!(
        "created replication slot {} at {} (snapshot {:?})",
        created.slot_name,
        created.consistent_point,
        created.snapshot_name
    );

    Ok(SlotSetup {
        slot: SlotState {
            slot_name: created.slot_name,
            plugin: created.plugin,
            consistent_point: created.consistent_point,
            write_lsn: Lsn::INVALID,
            flush_lsn: Lsn::INVALID,
            timeline_id: identity.timeline,
        },
        snapshot: created.snapshot_name,
        keepalive: client,
    })
}

/// `stream setup`: create the slot and persist its state, without holding
/// a snapshot open.
pub async fn stream_setup(
    catalog: &Catalog,
    source_uri: &str,
    stream_config: &StreamConfig,
) -> Result<SlotState> {
    let setup = create_slot(source_uri, stream_config).await?;
    catalog.slot_write(&setup.slot)?;
    let mut sentinel = catalog.sentinel_read()?;
    sentinel.start_pos = setup.slot.consistent_point;
    if let Some(endpos) = stream_config.end_pos {
        sentinel.end_pos = endpos;
    }
    catalog.sentinel_write(sentinel)?;
    Ok(setup.slot)
}

/// `stream cleanup`: drop the slot and the target-side progress row.
pub async fn stream_cleanup(
    source_uri: &str,
    target_uri: &str,
    stream_config: &StreamConfig,
) -> Result<()> {
    let mut client = ReplicationClient::connect(source_uri).await?;
    match client.drop_slot(&stream_config.slot_name).await {
        Ok(()) => tracing::info!("dropped replication slot {}", stream_config.slot_name),
        Err(e) => tracing::warn!("could not drop slot {}: {e:#}", stream_config.slot_name),
    }

    let target = crate::pgsql::connect(target_uri).await?;
    let deleted = target
        .execute(
            "DELETE FROM pgcopydb.apply_progress WHERE origin = $1",
            &[&stream_config.origin],
        )
        .await
        .unwrap_or(0);
    if deleted > 0 {
        tracing::info!("removed apply progress for origin {}", stream_config.origin);
    }
    Ok(())
}

/// Run the CDC pipeline in the requested mode until the stop position is
/// reached, the stream drains (catchup), or the run is cancelled.
pub async fn run_stream(
    catalog: Arc<Catalog>,
    config: &RunConfig,
    stream_config: &StreamConfig,
    source_uri: &str,
    target_uri: &str,
    mode: StreamMode,
    cancel: CancellationToken,
) -> Result<()> {
    let cdc_dir = config.cdc_dir(&stream_config.slot_name);
    std::fs::create_dir_all(&cdc_dir)?;

    // Seed the sentinel from explicit flags; a live `sentinel set` later
    // overrides these.
    let mut sentinel = catalog.sentinel_read()?;
    if let Some(endpos) = stream_config.end_pos {
        sentinel.end_pos = endpos;
    }
    if let Some(startpos) = stream_config.start_pos {
        sentinel.start_pos = startpos;
    }
    catalog.sentinel_write(sentinel)?;

    let slot = catalog.slot_read()?;
    let cursor = catalog.cursor_read()?;
    let start_lsn = if cursor.flushed_lsn.is_valid() {
        cursor.flushed_lsn
    } else if sentinel.start_pos.is_valid() {
        sentinel.start_pos
    } else if let Some(slot) = &slot {
        slot.consistent_point
    } else {
        anyhow::bail!(
            "no stream position: run `stream setup` first or pass --startpos"
        );
    };

    let receiver_cancel = cancel.child_token();
    let mut receiver = if mode != StreamMode::Catchup {
        let catalog = Arc::clone(&catalog);
        let source_uri = source_uri.to_string();
        let stream_config = stream_config.clone();
        let cdc_dir = cdc_dir.clone();
        let token = receiver_cancel.clone();
        Some(tokio::spawn(async move {
            receive::run_receiver(catalog, &source_uri, &stream_config, &cdc_dir, start_lsn, token)
                .await
        }))
    } else {
        None
    };

    let identities = match catalog.plan()? {
        Some(plan) => transform::identity_map(&plan),
        None => transform::IdentityMap::new(),
    };
    let mut transformer = Transformer::new(&cdc_dir, stream_config.plugin, identities)?;
    let mut applier = (mode != StreamMode::Prefetch).then(|| {
        Applier::new(
            Arc::clone(&catalog),
            target_uri,
            &stream_config.origin,
            cdc_dir.clone(),
            config.max_attempts,
        )
    });

    let outcome = loop {
        let report = transformer.process_available(&cdc_dir)?;
        if report.transactions_written > 0 {
            tracing::debug!("transformed {} transactions", report.transactions_written);
        }

        let sentinel = catalog.sentinel_read()?;
        let endpos = Some(sentinel.end_pos).filter(|l| l.is_valid());

        if let Some(applier) = applier.as_mut() {
            if sentinel.apply {
                match applier.apply_available(endpos, &cancel).await? {
                    ApplyOutcome::ReachedEndpos => break Ok(()),
                    ApplyOutcome::UpToDate => {}
                }
            }
        }

        if cancel.is_cancelled() {
            break Ok(());
        }

        let receiver_finished = match receiver.as_mut() {
            Some(handle) if handle.is_finished() => {
                let result = handle.await;
                receiver = None;
                match result {
                    Ok(Ok(last)) => {
                        tracing::info!("receiver finished at {last}");
                        true
                    }
                    Ok(Err(e)) => break Err(e.context("receiver failed")),
                    Err(e) => break Err(anyhow::anyhow!("receiver panicked: {e}")),
                }
            }
            Some(_) => false,
            None => true,
        };

        if receiver_finished {
            // Drain whatever is left, then stop. In prefetch mode there
            // is no applier, so a drained transformer is the end.
            let report = transformer.process_available(&cdc_dir)?;
            let drained_apply = match applier.as_mut() {
                Some(applier) if catalog.sentinel_read()?.apply => {
                    matches!(
                        applier.apply_available(endpos, &cancel).await?,
                        ApplyOutcome::UpToDate
                    )
                }
                _ => true,
            };
            if report.transactions_written == 0 && drained_apply {
                break Ok(());
            }
        }

        tokio::time::sleep(Duration::from_millis(500)).await;
    };

    // Shut the receiver down on every exit path so its connection and
    // open segment are released.
    receiver_cancel.cancel();
    if let Some(handle) = receiver {
        match handle.await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::warn!("receiver shutdown error: {e:#}"),
            Err(e) => tracing::warn!("receiver join error: {e}"),
        }
    }

    outcome
}
