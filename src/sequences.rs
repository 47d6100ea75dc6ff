//! Reset target sequences to the values captured at plan time.

use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::catalog::{Catalog, TaskKind};
use crate::plan::TaskState;

pub async fn run_sequence_phase(
    catalog: Arc<Catalog>,
    target_uri: &str,
    cancel: CancellationToken,
) -> Result<()> {
    let pending: Vec<_> = catalog
        .sequence_tasks()?
        .into_iter()
        .filter(|(_, state)| *state == TaskState::Planned)
        .map(|(task, _)| task)
        .collect();
    if pending.is_empty() {
        return Ok(());
    }

    let client = crate::pgsql::connect(target_uri).await?;
    for seq in pending {
        if cancel.is_cancelled() {
            return Ok(());
        }
        if !catalog.task_claim(TaskKind::Sequence, seq.oid)? {
            continue;
        }
        let regclass = format!(
            "{}.{}",
            crate::pgsql::quote_ident(&seq.schema),
            crate::pgsql::quote_ident(&seq.name)
        );
        match client
            .execute(
                "SELECT pg_catalog.setval($1::regclass, $2, $3)",
                &[&regclass, &seq.last_value, &seq.is_called],
            )
            .await
        {
            Ok(_) => {
                catalog.task_done(TaskKind::Sequence, seq.oid)?;
                tracing::debug!("set {regclass} to {}", seq.last_value);
            }
            Err(e) => {
                let message = format!("setval failed: {e}");
                tracing::error!("sequence {regclass}: {message}");
                catalog.task_failed(TaskKind::Sequence, seq.oid, &message)?;
            }
        }
    }

    tracing::info!("sequence values restored");
    Ok(())
}
