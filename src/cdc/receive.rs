//! The Receiver: stream logical decoding output into segment files.
//!
//! Receiving is deliberately decoupled from apply: messages land on disk
//! as fast as the source produces them, and a lagging applier is absorbed
//! by the segment store. Status updates report `(write, flush, apply)`
//! positions so the source can recycle WAL behind us.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::catalog::Catalog;
use crate::cdc::proto::{ReplicationClient, WalMessage};
use crate::cdc::segment::{SegmentRecord, SegmentWriter};
use crate::config::{Plugin, StreamConfig};
use crate::lsn::Lsn;
use crate::plan::ApplyCursor;

/// Idle interval after which we proactively rotate the open segment and
/// send a status update, even if the server stays quiet.
const IDLE_TICK: Duration = Duration::from_secs(10);

/// Decoding options requested from each plugin. Version 2 of wal2json
/// emits one JSON document per message, which is what the parser expects.
fn plugin_options(plugin: Plugin) -> Vec<(&'static str, &'static str)> {
    match plugin {
        Plugin::Wal2json => vec![
            ("format-version", "2"),
            ("include-xids", "true"),
            ("include-timestamp", "true"),
            ("include-lsn", "true"),
            ("include-pk", "true"),
        ],
        Plugin::TestDecoding => vec![("include-xids", "on"), ("include-timestamp", "on")],
    }
}

/// Stream from `start_lsn` until cancellation or until the sentinel's
/// stop position has been fully received. Returns the last received LSN.
pub async fn run_receiver(
    catalog: Arc<Catalog>,
    source_uri: &str,
    stream_config: &StreamConfig,
    cdc_dir: &Path,
    start_lsn: Lsn,
    cancel: CancellationToken,
) -> Result<Lsn> {
    let client = ReplicationClient::connect(source_uri).await?;
    let mut stream = client
        .start_replication(
            &stream_config.slot_name,
            start_lsn,
            &plugin_options(stream_config.plugin),
        )
        .await
        .context("failed to start replication")?;

    let mut writer = SegmentWriter::open(cdc_dir, stream_config.segment_size)?;
    let mut last_received = start_lsn;
    let mut end_pos = effective_endpos(&catalog, stream_config)?;

    tracing::info!(
        "receiving slot {} ({}) from {start_lsn}",
        stream_config.slot_name,
        stream_config.plugin.as_str()
    );

    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("receiver cancelled at {last_received}");
                break;
            }
            message = tokio::time::timeout(IDLE_TICK, stream.next_message()) => message,
        };

        match message {
            Err(_elapsed) => {
                // Idle: make buffered data visible to the transformer and
                // keep the source's WAL reservation moving.
                writer.rotate()?;
                send_status(&catalog, &mut stream, &writer, last_received, false).await?;
                end_pos = effective_endpos(&catalog, stream_config)?;
            }
            Ok(Err(e)) => return Err(e),
            Ok(Ok(WalMessage::Done)) => {
                tracing::info!("source ended the replication stream at {last_received}");
                break;
            }
            Ok(Ok(WalMessage::KeepAlive {
                wal_end,
                reply_requested,
            })) => {
                last_received = last_received.max(wal_end);
                if reply_requested {
                    send_status(&catalog, &mut stream, &writer, last_received, false).await?;
                }
            }
            Ok(Ok(WalMessage::XLogData {
                wal_start,
                wal_end,
                data,
            })) => {
                let data = String::from_utf8_lossy(&data).into_owned();
                writer.append(&SegmentRecord {
                    lsn: wal_start,
                    data,
                })?;
                last_received = last_received.max(wal_end).max(wal_start);

                // Decoded output arrives in commit order, so the first
                // message at or past the stop position is the commit of
                // the transaction spanning it; with it on disk the
                // applier can finish that transaction and stop.
                if end_pos.is_valid() && wal_start >= end_pos {
                    tracing::info!("stop position {end_pos} received at {wal_start}");
                    break;
                }
            }
        }
    }

    writer.rotate()?;
    // The stream may already be gone (server shutdown, endpos); what
    // matters is that the segments are durable.
    if let Err(e) = send_status(&catalog, &mut stream, &writer, last_received, false).await {
        tracing::debug!("final status update not sent: {e:#}");
    }
    Ok(last_received)
}

fn effective_endpos(catalog: &Catalog, stream_config: &StreamConfig) -> Result<Lsn> {
    // The sentinel can be set while we run; an explicit --endpos is
    // seeded there before the stream starts.
    let sentinel = catalog.sentinel_read()?;
    Ok(stream_config
        .end_pos
        .filter(|l| l.is_valid())
        .unwrap_or(sentinel.end_pos))
}

async fn send_status(
    catalog: &Catalog,
    stream: &mut crate::cdc::proto::ReplicationStream,
    writer: &SegmentWriter,
    last_received: Lsn,
    reply_requested: bool,
) -> Result<()> {
    let applied = catalog.cursor_read()?.applied_commit_lsn;
    let flushed = writer.flushed_lsn(last_received);

    let cursor = catalog.cursor_write(ApplyCursor {
        applied_commit_lsn: Lsn::INVALID,
        written_lsn: last_received,
        flushed_lsn: flushed,
    })?;

    stream
        .standby_status_update(
            cursor.written_lsn,
            cursor.flushed_lsn,
            applied,
            reply_requested,
        )
        .await
        .context("failed to send standby status update")?;

    if let Some(mut slot) = catalog.slot_read()? {
        slot.write_lsn = cursor.written_lsn;
        slot.flush_lsn = cursor.flushed_lsn;
        catalog.slot_write(&slot)?;
    }
    Ok(())
}
