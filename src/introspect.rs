//! Source introspection: walk the system catalogs under the run's
//! REPEATABLE READ snapshot and materialize the Work Plan.
//!
//! Runs single-threaded on the snapshot-holding connection so every query
//! observes the same source state. The resulting plan is deterministic for
//! a fixed snapshot and filter manifest: relations are visited in OID order
//! and nothing depends on wall-clock or catalog cache state.

use std::collections::{BTreeSet, HashMap};

use anyhow::{Context, Result};
use chrono::Utc;
use tokio_postgres::Client;

use crate::config::RunConfig;
use crate::filters::Filters;
use crate::plan::{
    BackingConstraint, BlobTask, ConstraintTask, IndexTask, MatviewTask, ReplicaIdentity,
    SequenceTask, SplitStrategy, TablePart, TableTask, WorkPlan,
};

/// Build the Work Plan. `snapshot` is the name every copy worker will
/// attach to; the caller owns the transaction that exported it.
pub async fn introspect(
    client: &Client,
    filters: &Filters,
    config: &RunConfig,
    snapshot: String,
) -> Result<WorkPlan> {
    let identity = crate::pgsql::server_identity(client).await?;

    let mut plan = WorkPlan {
        system_identifier: identity.system_identifier,
        timeline_id: identity.timeline_id,
        snapshot,
        created_at: Utc::now(),
        filters_fingerprint: filters.fingerprint(),
        tables: Vec::new(),
        table_parts: Vec::new(),
        indexes: Vec::new(),
        constraints: Vec::new(),
        sequences: Vec::new(),
        matviews: Vec::new(),
        blobs: BlobTask::default(),
        extensions: Vec::new(),
    };

    let block_size = block_size(client).await?;
    let identities = identity_columns(client).await?;
    enumerate_relations(client, filters, config, block_size, &identities, &mut plan).await?;
    enumerate_indexes(client, filters, &mut plan).await?;
    enumerate_foreign_keys(client, &mut plan).await?;
    enumerate_sequences(client, filters, &mut plan).await?;

    if !config.skip_large_objects {
        plan.blobs.estimated_count = client
            .query_one("SELECT count(*) FROM pg_largeobject_metadata", &[])
            .await?
            .get(0);
    }

    if !config.skip_extensions {
        let rows = client
            .query(
                "SELECT extname FROM pg_extension WHERE extname <> 'plpgsql' ORDER BY extname",
                &[],
            )
            .await?;
        plan.extensions = rows
            .iter()
            .map(|row| row.get::<_, String>(0))
            .filter(|name| filters.include_extension(name))
            .collect();
    }

    plan.validate()?;
    Ok(plan)
}

async fn block_size(client: &Client) -> Result<u64> {
    let row = client
        .query_one("SELECT current_setting('block_size')::bigint", &[])
        .await?;
    Ok(row.get::<_, i64>(0) as u64)
}

/// Replica identity columns per relation: the designated identity index
/// when one exists, otherwise the primary key.
async fn identity_columns(client: &Client) -> Result<HashMap<u32, Vec<String>>> {
    let rows = client
        .query(
            "SELECT i.indrelid, i.indisreplident, a.attname
             FROM pg_index i
             JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey)
             WHERE i.indisreplident OR i.indisprimary
             ORDER BY i.indrelid, i.indisreplident DESC, a.attnum",
            &[],
        )
        .await
        .context("failed to enumerate replica identities")?;

    let mut identities: HashMap<u32, (bool, Vec<String>)> = HashMap::new();
    for row in rows {
        let table_oid: u32 = row.get(0);
        let is_replident: bool = row.get(1);
        let column: String = row.get(2);
        let entry = identities.entry(table_oid).or_insert((is_replident, Vec::new()));
        // A designated identity index beats the primary key.
        if is_replident && !entry.0 {
            *entry = (true, Vec::new());
        }
        if entry.0 == is_replident {
            entry.1.push(column);
        }
    }
    Ok(identities
        .into_iter()
        .map(|(oid, (_, columns))| (oid, columns))
        .collect())
}

async fn enumerate_relations(
    client: &Client,
    filters: &Filters,
    config: &RunConfig,
    block_size: u64,
    identities: &HashMap<u32, Vec<String>>,
    plan: &mut WorkPlan,
) -> Result<()> {
    let rows = client
        .query(
            "SELECT c.oid, n.nspname, c.relname, c.relkind, c.relpages,
                    c.reltuples::bigint, c.relreplident, c.relispartition,
                    i.inhparent
             FROM pg_class c
             JOIN pg_namespace n ON n.oid = c.relnamespace
             LEFT JOIN pg_inherits i ON i.inhrelid = c.oid
             WHERE c.relkind IN ('r', 'p', 'm')
             ORDER BY c.oid",
            &[],
        )
        .await
        .context("failed to enumerate relations")?;

    for row in rows {
        let oid: u32 = row.get(0);
        let schema: String = row.get(1);
        let name: String = row.get(2);
        let relkind: i8 = row.get(3);
        let relpages: i32 = row.get(4);
        let reltuples: i64 = row.get(5);
        let relreplident: i8 = row.get(6);
        let is_partition: bool = row.get(7);
        let parent_oid: Option<u32> = row.get(8);

        if !filters.include_table(&schema, &name) {
            continue;
        }

        match relkind as u8 {
            b'm' => {
                plan.matviews.push(MatviewTask { oid, schema, name });
                continue;
            }
            b'p' => {
                // Partitioned parents hold no rows; planned so indexes and
                // foreign keys can reference them, never copied.
                plan.tables.push(TableTask {
                    oid,
                    schema,
                    name,
                    bytes: 0,
                    reltuples: 0,
                    replica_identity: ReplicaIdentity::from_char(relreplident),
                    parent_oid: None,
                    split: SplitStrategy::None,
                    relpages: 0,
                    copy_data: false,
                    identity_columns: identities.get(&oid).cloned().unwrap_or_default(),
                });
                continue;
            }
            _ => {}
        }

        let copy_data = filters.include_table_data(&schema, &name);
        let mut bytes = relpages.max(0) as u64 * block_size;

        let mut split = SplitStrategy::None;
        if copy_data {
            if let Some(threshold) = config.split_tables_larger_than {
                if bytes >= threshold {
                    // The page-count estimate decided this table is a
                    // candidate; get the real size before committing to a
                    // partition count.
                    bytes = client
                        .query_one("SELECT pg_relation_size($1::oid)", &[&oid])
                        .await?
                        .get::<_, i64>(0) as u64;
                    if bytes >= threshold {
                        split = decide_split(client, oid, bytes, threshold).await?;
                    }
                }
            }
        }

        let task = TableTask {
            oid,
            schema,
            name,
            bytes,
            reltuples: reltuples.max(0),
            replica_identity: ReplicaIdentity::from_char(relreplident),
            parent_oid: if is_partition { parent_oid } else { None },
            split: split.clone(),
            relpages: relpages.max(0) as u32,
            copy_data,
            identity_columns: identities.get(&oid).cloned().unwrap_or_default(),
        };

        match &split {
            SplitStrategy::None => {}
            SplitStrategy::CtidRange { parts } => {
                plan.table_parts
                    .extend(ctid_ranges(oid, task.relpages, *parts));
            }
            SplitStrategy::IntegerColumn { column, parts } => {
                match key_range(client, &task, column).await? {
                    Some((min, max)) => {
                        plan.table_parts.extend(key_ranges(oid, min, max, *parts));
                    }
                    None => {
                        // Empty table; nothing to split after all.
                        plan.tables.push(TableTask {
                            split: SplitStrategy::None,
                            ..task
                        });
                        continue;
                    }
                }
            }
        }

        plan.tables.push(task);
    }

    Ok(())
}

/// Pick the COPY partitioning strategy for a table above the threshold: an
/// integer-typed single-column primary key gives key ranges, anything else
/// falls back to physical CTID ranges.
async fn decide_split(
    client: &Client,
    oid: u32,
    bytes: u64,
    threshold: u64,
) -> Result<SplitStrategy> {
    let parts = bytes.div_ceil(threshold).clamp(2, 1024) as u32;

    let pk_column = client
        .query_opt(
            "SELECT a.attname
             FROM pg_index x
             JOIN pg_attribute a ON a.attrelid = x.indrelid AND a.attnum = x.indkey[0]
             JOIN pg_type t ON t.oid = a.atttypid
             WHERE x.indrelid = $1::oid AND x.indisprimary AND x.indnatts = 1
               AND a.attnotnull AND t.typname IN ('int2', 'int4', 'int8')",
            &[&oid],
        )
        .await?;

    Ok(match pk_column {
        Some(row) => SplitStrategy::IntegerColumn {
            column: row.get(0),
            parts,
        },
        None => SplitStrategy::CtidRange { parts },
    })
}

async fn key_range(client: &Client, task: &TableTask, column: &str) -> Result<Option<(i64, i64)>> {
    let query = format!(
        "SELECT min({col})::bigint, max({col})::bigint FROM {}",
        task.qualified_name(),
        col = crate::pgsql::quote_ident(column),
    );
    let row = client.query_one(&query, &[]).await?;
    let min: Option<i64> = row.get(0);
    let max: Option<i64> = row.get(1);
    Ok(min.zip(max))
}

/// Divide `[0, relpages)` into `parts` contiguous page ranges. The final
/// range is unbounded so pages appended after planning still copy.
fn ctid_ranges(table_oid: u32, relpages: u32, parts: u32) -> Vec<TablePart> {
    let parts = parts.max(1);
    let relpages = relpages as i64;
    let parts_i64 = parts as i64;
    let pages_per_part = ((relpages + parts_i64 - 1) / parts_i64).max(1);
    let mut ranges = Vec::new();
    for part in 0..parts {
        let lower = part as i64 * pages_per_part;
        let upper = if part == parts - 1 {
            None
        } else {
            Some(lower + pages_per_part)
        };
        ranges.push(TablePart {
            table_oid,
            part,
            lower,
            upper,
        });
        if upper.is_none() {
            break;
        }
    }
    ranges
}

/// Divide `[min, max]` key space into `parts` ranges. The last range is
/// unbounded above so keys inserted past max at plan time still copy.
fn key_ranges(table_oid: u32, min: i64, max: i64, parts: u32) -> Vec<TablePart> {
    let parts = parts.max(1) as i64;
    let span = max.saturating_sub(min).saturating_add(1);
    let step = (span / parts).max(1);
    let mut ranges = Vec::new();
    let mut lower = min;
    for part in 0..parts {
        let is_last = part == parts - 1 || lower.saturating_add(step) > max;
        ranges.push(TablePart {
            table_oid,
            part: part as u32,
            lower,
            upper: if is_last { None } else { Some(lower + step) },
        });
        if is_last {
            break;
        }
        lower += step;
    }
    ranges
}

async fn enumerate_indexes(client: &Client, filters: &Filters, plan: &mut WorkPlan) -> Result<()> {
    // Index tasks are planned for ordinary tables only; indexes on
    // partitioned trees are cascading DDL and stay in the post-data
    // restore, which handles attachment.
    let table_oids: BTreeSet<u32> = plan.tables.iter().map(|t| t.oid).collect();

    let rows = client
        .query(
            "SELECT x.indexrelid, x.indrelid, n.nspname, ic.relname,
                    pg_get_indexdef(x.indexrelid), con.conname, con.contype
             FROM pg_index x
             JOIN pg_class ic ON ic.oid = x.indexrelid
             JOIN pg_class tc ON tc.oid = x.indrelid
             JOIN pg_namespace n ON n.oid = ic.relnamespace
             LEFT JOIN pg_constraint con
                    ON con.conindid = x.indexrelid AND con.contype IN ('p', 'u')
             WHERE tc.relkind = 'r' AND NOT tc.relispartition
             ORDER BY x.indexrelid",
            &[],
        )
        .await
        .context("failed to enumerate indexes")?;

    for row in rows {
        let oid: u32 = row.get(0);
        let table_oid: u32 = row.get(1);
        let schema: String = row.get(2);
        let name: String = row.get(3);
        let definition: String = row.get(4);
        let constraint_name: Option<String> = row.get(5);
        let contype: Option<i8> = row.get(6);

        if !table_oids.contains(&table_oid) {
            continue;
        }
        if !filters.include_index(&schema, &name) {
            continue;
        }

        plan.indexes.push(IndexTask {
            oid,
            table_oid,
            schema,
            name,
            definition,
            constraint: constraint_name.map(|name| BackingConstraint {
                name,
                is_primary: contype.map(|c| c as u8 == b'p').unwrap_or(false),
            }),
        });
    }

    Ok(())
}

async fn enumerate_foreign_keys(client: &Client, plan: &mut WorkPlan) -> Result<()> {
    let table_oids: BTreeSet<u32> = plan.tables.iter().map(|t| t.oid).collect();

    let rows = client
        .query(
            "SELECT con.oid, con.conrelid, n.nspname, c.relname, con.conname,
                    pg_get_constraintdef(con.oid), con.confrelid
             FROM pg_constraint con
             JOIN pg_class c ON c.oid = con.conrelid
             JOIN pg_namespace n ON n.oid = c.relnamespace
             WHERE con.contype = 'f' AND con.conparentid = 0
             ORDER BY con.oid",
            &[],
        )
        .await
        .context("failed to enumerate foreign keys")?;

    for row in rows {
        let table_oid: u32 = row.get(1);
        let referenced: u32 = row.get(6);
        // A foreign key whose endpoints are not both planned cannot be
        // applied; leave it to the operator rather than fail mid-run.
        if !table_oids.contains(&table_oid) || !table_oids.contains(&referenced) {
            tracing::warn!(
                "skipping foreign key {} on filtered table",
                row.get::<_, String>(4)
            );
            continue;
        }
        plan.constraints.push(ConstraintTask {
            oid: row.get(0),
            table_oid,
            schema: row.get(2),
            table: row.get(3),
            name: row.get(4),
            definition: row.get(5),
            referenced_table_oid: referenced,
        });
    }

    Ok(())
}

async fn enumerate_sequences(
    client: &Client,
    filters: &Filters,
    plan: &mut WorkPlan,
) -> Result<()> {
    let rows = client
        .query(
            "SELECT c.oid, s.schemaname, s.sequencename,
                    COALESCE(s.last_value, s.start_value), s.last_value IS NOT NULL
             FROM pg_sequences s
             JOIN pg_namespace n ON n.nspname = s.schemaname
             JOIN pg_class c ON c.relnamespace = n.oid AND c.relname = s.sequencename
             WHERE c.relkind = 'S'
             ORDER BY c.oid",
            &[],
        )
        .await
        .context("failed to enumerate sequences")?;

    for row in rows {
        let schema: String = row.get(1);
        let name: String = row.get(2);
        if !filters.include_schema(&schema) {
            continue;
        }
        plan.sequences.push(SequenceTask {
            oid: row.get(0),
            schema,
            name,
            last_value: row.get(3),
            is_called: row.get(4),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ctid_ranges_cover_all_pages() {
        let ranges = ctid_ranges(100, 10, 3);
        assert_eq!(ranges.len(), 3);
        assert_eq!((ranges[0].lower, ranges[0].upper), (0, Some(4)));
        assert_eq!((ranges[1].lower, ranges[1].upper), (4, Some(8)));
        assert_eq!((ranges[2].lower, ranges[2].upper), (8, None));
    }

    #[test]
    fn test_ctid_ranges_single_part() {
        let ranges = ctid_ranges(100, 10, 1);
        assert_eq!(ranges.len(), 1);
        assert_eq!((ranges[0].lower, ranges[0].upper), (0, None));
    }

    #[test]
    fn test_ctid_ranges_more_parts_than_pages() {
        // Tiny table, absurd part count: ranges collapse early and the
        // last emitted range is unbounded.
        let ranges = ctid_ranges(100, 2, 8);
        assert!(ranges.len() <= 8);
        assert_eq!(ranges.last().unwrap().upper, None);
        assert_eq!(ranges[0].lower, 0);
    }

    #[test]
    fn test_key_ranges_are_contiguous() {
        let ranges = key_ranges(100, 1, 100, 4);
        assert_eq!(ranges.len(), 4);
        assert_eq!(ranges[0].lower, 1);
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].upper, Some(pair[1].lower));
        }
        assert_eq!(ranges.last().unwrap().upper, None);
    }

    #[test]
    fn test_key_ranges_narrow_key_space() {
        // Fewer distinct keys than parts: stops early, still unbounded at
        // the top.
        let ranges = key_ranges(100, 5, 6, 10);
        assert_eq!(ranges.last().unwrap().upper, None);
        assert_eq!(ranges[0].lower, 5);
    }
}
