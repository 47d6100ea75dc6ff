//! The Applier: replay transformed transactions on the target in commit
//! order.
//!
//! There is exactly one applier; logical consistency beats throughput.
//! Each source transaction becomes one target transaction that also
//! upserts the apply-progress row in `pgcopydb.apply_progress`, so the
//! replay frontier survives a target restart independently of the local
//! catalog. On startup the frontier is the max of both records, which
//! makes re-applying any suffix of transactions a no-op.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_postgres::Client;
use tokio_util::sync::CancellationToken;

use crate::catalog::Catalog;
use crate::cdc::segment;
use crate::cdc::transform::{self, TxnHeader};
use crate::error::{is_data_error, is_transient, Error};
use crate::lsn::Lsn;
use crate::plan::ApplyCursor;

const PROGRESS_DDL: &str = "
CREATE SCHEMA IF NOT EXISTS pgcopydb;
CREATE TABLE IF NOT EXISTS pgcopydb.apply_progress (
    origin     text PRIMARY KEY,
    commit_lsn text NOT NULL,
    applied_at timestamptz NOT NULL DEFAULT now()
);
";

/// What to do with one transaction relative to the stop position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndposDecision {
    /// Entirely before the stop position.
    Apply,
    /// Spans the stop position: apply fully, then stop.
    ApplyThenStop,
    /// Starts at or past the stop position: do not apply.
    StopBefore,
}

fn endpos_decision(header: &TxnHeader, endpos: Option<Lsn>) -> EndposDecision {
    let Some(endpos) = endpos.filter(|e| e.is_valid()) else {
        return EndposDecision::Apply;
    };
    if header.first_lsn >= endpos {
        EndposDecision::StopBefore
    } else if header.commit_lsn >= endpos {
        EndposDecision::ApplyThenStop
    } else {
        EndposDecision::Apply
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// All available transactions applied; more may arrive.
    UpToDate,
    /// The stop position was reached; the pipeline should shut down.
    ReachedEndpos,
}

pub struct Applier {
    catalog: Arc<Catalog>,
    target_uri: String,
    origin: String,
    cdc_dir: PathBuf,
    sql_dir: PathBuf,
    max_attempts: u32,
    client: Option<Client>,
}

impl Applier {
    pub fn new(
        catalog: Arc<Catalog>,
        target_uri: &str,
        origin: &str,
        cdc_dir: PathBuf,
        max_attempts: u32,
    ) -> Applier {
        let sql_dir = cdc_dir.join("sql");
        Applier {
            catalog,
            target_uri: target_uri.to_string(),
            origin: origin.to_string(),
            cdc_dir,
            sql_dir,
            max_attempts,
            client: None,
        }
    }

    async fn client(&mut self) -> Result<&Client> {
        if self.client.is_none() {
            let client = crate::pgsql::connect(&self.target_uri).await?;
            client
                .batch_execute(PROGRESS_DDL)
                .await
                .context("failed to create apply progress table")?;
            self.client = Some(client);
        }
        Ok(self.client.as_ref().expect("client connected"))
    }

    /// The replay frontier: transactions at or below this commit LSN are
    /// already in the target.
    pub async fn frontier(&mut self) -> Result<Lsn> {
        let catalog_lsn = self.catalog.cursor_read()?.applied_commit_lsn;
        let origin = self.origin.clone();
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT commit_lsn FROM pgcopydb.apply_progress WHERE origin = $1",
                &[&origin],
            )
            .await?;
        let target_lsn = match row {
            Some(row) => row
                .get::<_, String>(0)
                .parse()
                .context("bad commit_lsn in apply_progress")?,
            None => Lsn::INVALID,
        };
        Ok(catalog_lsn.max(target_lsn))
    }

    /// Apply every transformed transaction past the frontier, in commit
    /// order, honoring the stop position.
    pub async fn apply_available(
        &mut self,
        endpos: Option<Lsn>,
        cancel: &CancellationToken,
    ) -> Result<ApplyOutcome> {
        let frontier = self.frontier().await?;
        let transactions = transform::list_transactions(&self.sql_dir)?;

        for (commit_lsn, path) in transactions {
            if commit_lsn <= frontier {
                continue;
            }
            if cancel.is_cancelled() {
                return Ok(ApplyOutcome::UpToDate);
            }

            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let (header_line, statements) = content
                .split_once('\n')
                .with_context(|| format!("empty transaction file {}", path.display()))?;
            let header = TxnHeader::parse(header_line)?;

            match endpos_decision(&header, endpos) {
                EndposDecision::StopBefore => {
                    tracing::info!(
                        "stop position {} reached before transaction at {}",
                        endpos.unwrap_or_default(),
                        header.commit_lsn
                    );
                    return Ok(ApplyOutcome::ReachedEndpos);
                }
                EndposDecision::Apply => {
                    self.apply_transaction(&header, statements).await?;
                }
                EndposDecision::ApplyThenStop => {
                    self.apply_transaction(&header, statements).await?;
                    tracing::info!(
                        "stop position {} reached at commit {}",
                        endpos.unwrap_or_default(),
                        header.commit_lsn
                    );
                    return Ok(ApplyOutcome::ReachedEndpos);
                }
            }
        }

        Ok(ApplyOutcome::UpToDate)
    }

    /// One source transaction, one target transaction, plus the progress
    /// row; retried on transient failures, once on data errors, fatal
    /// after that.
    async fn apply_transaction(&mut self, header: &TxnHeader, statements: &str) -> Result<()> {
        let script = format!(
            "BEGIN;\n{statements}\
             INSERT INTO pgcopydb.apply_progress (origin, commit_lsn) VALUES ({origin}, {lsn})\n\
             ON CONFLICT (origin) DO UPDATE\n\
             SET commit_lsn = EXCLUDED.commit_lsn, applied_at = now();\n\
             COMMIT;",
            origin = crate::pgsql::quote_literal(&self.origin),
            lsn = crate::pgsql::quote_literal(&header.commit_lsn.to_string()),
        );

        let mut data_retries = 0u32;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = match self.client().await {
                Ok(client) => client.batch_execute(&script).await,
                Err(e) => {
                    // Target unreachable counts as a transient attempt.
                    if attempt < self.max_attempts {
                        crate::retry::wait_before_retry("apply", attempt, self.max_attempts).await;
                        continue;
                    }
                    return Err(e);
                }
            };

            match result {
                Ok(()) => break,
                Err(e) => {
                    // The failed script leaves the session in an aborted
                    // transaction; clean it or drop the connection.
                    if let Some(client) = &self.client {
                        if client.batch_execute("ROLLBACK").await.is_err() {
                            self.client = None;
                        }
                    }

                    if is_transient(&e) {
                        self.client = None;
                        if attempt < self.max_attempts {
                            tracing::warn!(
                                "transaction at {} hit transient error: {e}",
                                header.commit_lsn
                            );
                            crate::retry::wait_before_retry("apply", attempt, self.max_attempts)
                                .await;
                            continue;
                        }
                    } else if is_data_error(&e) && data_retries == 0 {
                        // One replay: the first failure may race an
                        // unfinished constraint build on the target.
                        data_retries = 1;
                        tracing::warn!(
                            "transaction at {} hit data error, retrying once: {e}",
                            header.commit_lsn
                        );
                        continue;
                    }

                    tracing::error!(
                        "transaction at {} (first lsn {}) failed: {e}",
                        header.commit_lsn,
                        header.first_lsn
                    );
                    return Err(Error::Data {
                        lsn: header.commit_lsn,
                        message: e.to_string(),
                    }
                    .into());
                }
            }
        }

        self.catalog.cursor_write(ApplyCursor {
            applied_commit_lsn: header.commit_lsn,
            written_lsn: Lsn::INVALID,
            flushed_lsn: Lsn::INVALID,
        })?;
        let removed = segment::truncate_below(&self.cdc_dir, header.commit_lsn)?;
        if removed > 0 {
            tracing::debug!("pruned {removed} consumed segments");
        }
        tracing::debug!("applied transaction at {}", header.commit_lsn);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(first: u64, commit: u64) -> TxnHeader {
        TxnHeader {
            commit_lsn: Lsn(commit),
            first_lsn: Lsn(first),
            xid: None,
            timestamp: None,
        }
    }

    #[test]
    fn test_no_endpos_always_applies() {
        assert_eq!(
            endpos_decision(&header(0x100, 0x200), None),
            EndposDecision::Apply
        );
        assert_eq!(
            endpos_decision(&header(0x100, 0x200), Some(Lsn::INVALID)),
            EndposDecision::Apply
        );
    }

    #[test]
    fn test_endpos_between_transactions_stops_before() {
        // endpos falls between two transactions: the next one is skipped.
        assert_eq!(
            endpos_decision(&header(0x300, 0x400), Some(Lsn(0x250))),
            EndposDecision::StopBefore
        );
        assert_eq!(
            endpos_decision(&header(0x300, 0x400), Some(Lsn(0x300))),
            EndposDecision::StopBefore
        );
    }

    #[test]
    fn test_endpos_inside_transaction_applies_fully() {
        // endpos lands mid-transaction: it is applied, never split.
        assert_eq!(
            endpos_decision(&header(0x100, 0x500), Some(Lsn(0x300))),
            EndposDecision::ApplyThenStop
        );
        assert_eq!(
            endpos_decision(&header(0x100, 0x500), Some(Lsn(0x500))),
            EndposDecision::ApplyThenStop
        );
    }

    #[test]
    fn test_endpos_after_transaction_applies_and_continues() {
        assert_eq!(
            endpos_decision(&header(0x100, 0x200), Some(Lsn(0x900))),
            EndposDecision::Apply
        );
    }
}
