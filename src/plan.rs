//! The Work Plan: every unit of work a run will perform, as materialized by
//! the introspector and persisted in the Progress Catalog.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::lsn::Lsn;

/// Lifecycle of a planned unit of work. Workers move their own task
/// `Planned -> InProgress -> Copied | Failed` through catalog CAS updates;
/// `Skipped` is set at plan time for filtered-out work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Planned,
    InProgress,
    Copied,
    Failed,
    Skipped,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Planned => "planned",
            TaskState::InProgress => "in-progress",
            TaskState::Copied => "copied",
            TaskState::Failed => "failed",
            TaskState::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<TaskState> {
        match s {
            "planned" => Some(TaskState::Planned),
            "in-progress" => Some(TaskState::InProgress),
            "copied" => Some(TaskState::Copied),
            "failed" => Some(TaskState::Failed),
            "skipped" => Some(TaskState::Skipped),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a table's rows identify themselves in logical decoding output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaIdentity {
    /// `d` - primary key columns.
    Default,
    /// `f` - all columns.
    Full,
    /// `i` - a designated unique index.
    Index,
    /// `n` - no identity; UPDATE/DELETE cannot be decoded for this table.
    Nothing,
}

impl ReplicaIdentity {
    pub fn from_char(c: i8) -> ReplicaIdentity {
        match c as u8 {
            b'f' => ReplicaIdentity::Full,
            b'i' => ReplicaIdentity::Index,
            b'n' => ReplicaIdentity::Nothing,
            _ => ReplicaIdentity::Default,
        }
    }
}

/// How a large table's COPY is partitioned across workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SplitStrategy {
    None,
    /// Contiguous page ranges: `ctid >= '(lo,0)' AND ctid < '(hi,0)'`.
    CtidRange { parts: u32 },
    /// Ranges over a not-null integer primary key column.
    IntegerColumn { column: String, parts: u32 },
}

/// One table (or leaf partition) to copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableTask {
    pub oid: u32,
    pub schema: String,
    pub name: String,
    pub bytes: u64,
    pub reltuples: i64,
    pub replica_identity: ReplicaIdentity,
    /// Set on leaf partitions to the partitioned root's OID.
    pub parent_oid: Option<u32>,
    pub split: SplitStrategy,
    /// Relation pages, used to derive CTID ranges.
    pub relpages: u32,
    /// False for tables matched by `exclude-table-data` and for
    /// partitioned parents: structure and indexes exist but no rows move.
    pub copy_data: bool,
    /// Column names of the replica identity (the designated identity
    /// index, or the primary key). The transformer keys idempotent SQL on
    /// these.
    #[serde(default)]
    pub identity_columns: Vec<String>,
}

impl TableTask {
    pub fn qualified_name(&self) -> String {
        format!(
            "{}.{}",
            crate::pgsql::quote_ident(&self.schema),
            crate::pgsql::quote_ident(&self.name)
        )
    }

    pub fn display_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }
}

/// One range of a split table task. Parts share the parent's task row but
/// carry independent byte counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TablePart {
    pub table_oid: u32,
    pub part: u32,
    /// Lower bound, inclusive. For CTID splits this is a page number, for
    /// integer splits a key value.
    pub lower: i64,
    /// Upper bound, exclusive. `None` means unbounded (the last range).
    pub upper: Option<i64>,
}

/// One index to create once its table's data has landed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexTask {
    pub oid: u32,
    pub table_oid: u32,
    pub schema: String,
    pub name: String,
    /// Complete `CREATE [UNIQUE] INDEX` statement from pg_get_indexdef.
    pub definition: String,
    /// Set when the index backs a primary key or unique constraint; the
    /// constraint is promoted with `ALTER TABLE .. ADD CONSTRAINT .. USING
    /// INDEX` after the index is built.
    pub constraint: Option<BackingConstraint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackingConstraint {
    pub name: String,
    pub is_primary: bool,
}

/// A foreign key, applied only after every referenced table is copied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstraintTask {
    pub oid: u32,
    pub table_oid: u32,
    pub schema: String,
    pub table: String,
    pub name: String,
    /// `FOREIGN KEY (..) REFERENCES ..` from pg_get_constraintdef.
    pub definition: String,
    pub referenced_table_oid: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceTask {
    pub oid: u32,
    pub schema: String,
    pub name: String,
    pub last_value: i64,
    pub is_called: bool,
}

/// Large objects are a single logical unit resumable at OID granularity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlobTask {
    pub estimated_count: i64,
    pub last_copied_oid: u32,
}

/// A materialized view, refreshed after post-data restore.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatviewTask {
    pub oid: u32,
    pub schema: String,
    pub name: String,
}

/// The immutable output of one introspection pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkPlan {
    /// Source server system identifier from pg_control_system(), used to
    /// refuse resuming against a different server.
    pub system_identifier: String,
    pub timeline_id: u32,
    /// The exported snapshot every copy worker attaches to.
    pub snapshot: String,
    pub created_at: DateTime<Utc>,
    pub filters_fingerprint: String,
    pub tables: Vec<TableTask>,
    pub table_parts: Vec<TablePart>,
    pub indexes: Vec<IndexTask>,
    pub constraints: Vec<ConstraintTask>,
    pub sequences: Vec<SequenceTask>,
    pub matviews: Vec<MatviewTask>,
    pub blobs: BlobTask,
    pub extensions: Vec<String>,
}

impl WorkPlan {
    /// Every index and constraint must reference a planned table; the
    /// introspector enforces this before the plan reaches the catalog.
    pub fn validate(&self) -> anyhow::Result<()> {
        let table_oids: std::collections::BTreeSet<u32> =
            self.tables.iter().map(|t| t.oid).collect();
        for index in &self.indexes {
            if !table_oids.contains(&index.table_oid) {
                anyhow::bail!(
                    "index {}.{} references unplanned table oid {}",
                    index.schema,
                    index.name,
                    index.table_oid
                );
            }
        }
        for constraint in &self.constraints {
            if !table_oids.contains(&constraint.table_oid) {
                anyhow::bail!(
                    "constraint {} references unplanned table oid {}",
                    constraint.name,
                    constraint.table_oid
                );
            }
            if !table_oids.contains(&constraint.referenced_table_oid) {
                anyhow::bail!(
                    "constraint {} references unplanned table oid {}",
                    constraint.name,
                    constraint.referenced_table_oid
                );
            }
        }
        Ok(())
    }
}

/// State of the logical replication slot driving follow mode. Created once
/// and persisted for the life of the replication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotState {
    pub slot_name: String,
    pub plugin: String,
    /// The LSN at which the slot became consistent; bulk copy runs under
    /// the snapshot exported at this point, so CDC apply begins here.
    pub consistent_point: Lsn,
    pub write_lsn: Lsn,
    pub flush_lsn: Lsn,
    pub timeline_id: u32,
}

/// Apply-side progress. Invariant: flushed <= written <= applied_commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyCursor {
    pub applied_commit_lsn: Lsn,
    pub written_lsn: Lsn,
    pub flushed_lsn: Lsn,
}

/// Operator-controlled stream bounds, readable and settable while live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sentinel {
    pub start_pos: Lsn,
    pub end_pos: Lsn,
    /// Whether the applier should currently apply (catchup/replay) or only
    /// prefetch.
    pub apply: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(oid: u32) -> TableTask {
        TableTask {
            oid,
            schema: "public".into(),
            name: format!("t{oid}"),
            bytes: 0,
            reltuples: 0,
            replica_identity: ReplicaIdentity::Default,
            parent_oid: None,
            split: SplitStrategy::None,
            relpages: 0,
            copy_data: true,
            identity_columns: vec![],
        }
    }

    fn empty_plan() -> WorkPlan {
        WorkPlan {
            system_identifier: "7000000000000000001".into(),
            timeline_id: 1,
            snapshot: "00000003-00000002-1".into(),
            created_at: Utc::now(),
            filters_fingerprint: String::new(),
            tables: vec![],
            table_parts: vec![],
            indexes: vec![],
            constraints: vec![],
            sequences: vec![],
            matviews: vec![],
            blobs: BlobTask::default(),
            extensions: vec![],
        }
    }

    #[test]
    fn test_task_state_round_trip() {
        for state in [
            TaskState::Planned,
            TaskState::InProgress,
            TaskState::Copied,
            TaskState::Failed,
            TaskState::Skipped,
        ] {
            assert_eq!(TaskState::parse(state.as_str()), Some(state));
        }
        assert_eq!(TaskState::parse("bogus"), None);
    }

    #[test]
    fn test_plan_validation_catches_dangling_index() {
        let mut plan = empty_plan();
        plan.tables.push(table(100));
        plan.indexes.push(IndexTask {
            oid: 900,
            table_oid: 999,
            schema: "public".into(),
            name: "bad_idx".into(),
            definition: "CREATE INDEX bad_idx ON public.t999 (id)".into(),
            constraint: None,
        });
        assert!(plan.validate().is_err());
    }

    #[test]
    fn test_plan_validation_catches_dangling_fk_endpoint() {
        let mut plan = empty_plan();
        plan.tables.push(table(100));
        plan.constraints.push(ConstraintTask {
            oid: 901,
            table_oid: 100,
            schema: "public".into(),
            table: "t100".into(),
            name: "fk".into(),
            definition: "FOREIGN KEY (a) REFERENCES public.missing(id)".into(),
            referenced_table_oid: 999,
        });
        assert!(plan.validate().is_err());

        plan.tables.push(table(999));
        assert!(plan.validate().is_ok());
    }

    #[test]
    fn test_replica_identity_from_char() {
        assert_eq!(
            ReplicaIdentity::from_char(b'd' as i8),
            ReplicaIdentity::Default
        );
        assert_eq!(
            ReplicaIdentity::from_char(b'f' as i8),
            ReplicaIdentity::Full
        );
        assert_eq!(
            ReplicaIdentity::from_char(b'n' as i8),
            ReplicaIdentity::Nothing
        );
    }

    #[test]
    fn test_quoted_names() {
        let mut t = table(1);
        t.schema = "Mixed".into();
        t.name = "user table".into();
        assert_eq!(t.qualified_name(), "\"Mixed\".\"user table\"");
    }
}
