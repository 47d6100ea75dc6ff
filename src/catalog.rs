//! The Progress Catalog: a local SQLite database that owns every piece of
//! persistent run state — the Work Plan, per-task progress, the replication
//! slot state, the apply cursor, and the stream sentinel.
//!
//! The catalog is the only shared mutable store in the system. All access
//! goes through short transactions behind an internal lock; no caller holds
//! the lock across network I/O. Schema changes bump `CATALOG_VERSION`; a
//! version mismatch discards the file and rebuilds from a fresh
//! introspection, so resumability is promised within one format version
//! only.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use crate::plan::{
    ApplyCursor, BlobTask, ConstraintTask, IndexTask, ReplicaIdentity, Sentinel, SequenceTask,
    SlotState, SplitStrategy, TablePart, TableTask, TaskState, WorkPlan,
};
use crate::summary::{FailedTask, RunSummary, TaskCounts};

const CATALOG_VERSION: i32 = 1;

const SCHEMA: &str = "
CREATE TABLE run_setup (
    id                  INTEGER PRIMARY KEY CHECK (id = 1),
    system_identifier   TEXT NOT NULL,
    timeline_id         INTEGER NOT NULL,
    snapshot            TEXT NOT NULL,
    filters_fingerprint TEXT NOT NULL,
    created_at          TEXT NOT NULL,
    plan_json           TEXT NOT NULL
);

CREATE TABLE table_task (
    oid               INTEGER PRIMARY KEY,
    schema_name       TEXT NOT NULL,
    table_name        TEXT NOT NULL,
    bytes             INTEGER NOT NULL,
    reltuples         INTEGER NOT NULL,
    relpages          INTEGER NOT NULL,
    replica_identity  TEXT NOT NULL,
    identity_json     TEXT NOT NULL DEFAULT '[]',
    parent_oid        INTEGER,
    split_json        TEXT NOT NULL,
    copy_data         INTEGER NOT NULL,
    state             TEXT NOT NULL,
    attempts          INTEGER NOT NULL DEFAULT 0,
    bytes_transferred INTEGER NOT NULL DEFAULT 0,
    rows_copied       INTEGER NOT NULL DEFAULT 0,
    started_at        TEXT,
    finished_at       TEXT,
    error             TEXT
);

CREATE TABLE table_part (
    table_oid         INTEGER NOT NULL,
    part              INTEGER NOT NULL,
    lower_bound       INTEGER NOT NULL,
    upper_bound       INTEGER,
    state             TEXT NOT NULL,
    attempts          INTEGER NOT NULL DEFAULT 0,
    bytes_transferred INTEGER NOT NULL DEFAULT 0,
    rows_copied       INTEGER NOT NULL DEFAULT 0,
    error             TEXT,
    PRIMARY KEY (table_oid, part)
);

CREATE TABLE index_task (
    oid             INTEGER PRIMARY KEY,
    table_oid       INTEGER NOT NULL,
    schema_name     TEXT NOT NULL,
    index_name      TEXT NOT NULL,
    definition      TEXT NOT NULL,
    constraint_name TEXT,
    is_primary      INTEGER NOT NULL DEFAULT 0,
    state           TEXT NOT NULL,
    attempts        INTEGER NOT NULL DEFAULT 0,
    error           TEXT
);

CREATE TABLE constraint_task (
    oid                  INTEGER PRIMARY KEY,
    table_oid            INTEGER NOT NULL,
    schema_name          TEXT NOT NULL,
    table_name           TEXT NOT NULL,
    constraint_name      TEXT NOT NULL,
    definition           TEXT NOT NULL,
    referenced_table_oid INTEGER NOT NULL,
    state                TEXT NOT NULL,
    attempts             INTEGER NOT NULL DEFAULT 0,
    error                TEXT
);

CREATE TABLE sequence_task (
    oid         INTEGER PRIMARY KEY,
    schema_name TEXT NOT NULL,
    name        TEXT NOT NULL,
    last_value  INTEGER NOT NULL,
    is_called   INTEGER NOT NULL,
    state       TEXT NOT NULL,
    attempts    INTEGER NOT NULL DEFAULT 0,
    error       TEXT
);

CREATE TABLE blob_state (
    id              INTEGER PRIMARY KEY CHECK (id = 1),
    estimated_count INTEGER NOT NULL,
    last_copied_oid INTEGER NOT NULL,
    state           TEXT NOT NULL
);

CREATE TABLE slot_state (
    id               INTEGER PRIMARY KEY CHECK (id = 1),
    slot_name        TEXT NOT NULL,
    plugin           TEXT NOT NULL,
    consistent_point TEXT NOT NULL,
    write_lsn        TEXT NOT NULL,
    flush_lsn        TEXT NOT NULL,
    timeline_id      INTEGER NOT NULL
);

CREATE TABLE apply_cursor (
    id                 INTEGER PRIMARY KEY CHECK (id = 1),
    applied_commit_lsn TEXT NOT NULL,
    written_lsn        TEXT NOT NULL,
    flushed_lsn        TEXT NOT NULL
);

CREATE TABLE sentinel (
    id        INTEGER PRIMARY KEY CHECK (id = 1),
    start_pos TEXT NOT NULL,
    end_pos   TEXT NOT NULL,
    apply     INTEGER NOT NULL
);
";

/// Which task table an update targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Table,
    Index,
    Constraint,
    Sequence,
}

impl TaskKind {
    fn table(&self) -> &'static str {
        match self {
            TaskKind::Table => "table_task",
            TaskKind::Index => "index_task",
            TaskKind::Constraint => "constraint_task",
            TaskKind::Sequence => "sequence_task",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Table => "table",
            TaskKind::Index => "index",
            TaskKind::Constraint => "constraint",
            TaskKind::Sequence => "sequence",
        }
    }
}

/// Outcome of `plan_init` against an existing catalog.
#[derive(Debug, PartialEq, Eq)]
pub enum PlanInit {
    Fresh,
    Resumed,
}

pub struct Catalog {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl Catalog {
    /// Open (or create) the catalog under the working directory. A format
    /// version mismatch discards the file: the run re-plans from scratch.
    pub fn open(dir: &Path) -> Result<Catalog> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        let path = dir.join("pgcopydb.db");

        let mut conn = Connection::open(&path)
            .with_context(|| format!("failed to open catalog {}", path.display()))?;
        let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

        if version != 0 && version != CATALOG_VERSION {
            tracing::warn!(
                "catalog format version {version} != {CATALOG_VERSION}, rebuilding {}",
                path.display()
            );
            drop(conn);
            std::fs::remove_file(&path)?;
            conn = Connection::open(&path)?;
        }

        let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if version == 0 {
            let tx = conn.transaction()?;
            tx.execute_batch(SCHEMA)?;
            tx.pragma_update(None, "user_version", CATALOG_VERSION)?;
            tx.commit()?;
        }

        // Task and cursor writes must survive a crash immediately after the
        // call returns.
        conn.pragma_update(None, "synchronous", "FULL")?;

        Ok(Catalog {
            conn: Mutex::new(conn),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("catalog lock poisoned")
    }

    /// Persist a freshly introspected Work Plan, or validate that a resumed
    /// run still matches the stored one. The plan is written once; task
    /// rows are never deleted.
    pub fn plan_init(
        &self,
        plan: &WorkPlan,
        resume: bool,
        not_consistent: bool,
    ) -> Result<PlanInit> {
        plan.validate()?;
        let mut conn = self.lock();

        let existing: Option<(String, String, String)> = conn
            .query_row(
                "SELECT system_identifier, snapshot, filters_fingerprint
                 FROM run_setup WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        if let Some((sysid, snapshot, fingerprint)) = existing {
            if !resume {
                anyhow::bail!(
                    "catalog {} already contains a run; use --resume to continue it",
                    self.path.display()
                );
            }
            if sysid != plan.system_identifier {
                anyhow::bail!(
                    "catalog belongs to source server {sysid}, not {}",
                    plan.system_identifier
                );
            }
            if fingerprint != plan.filters_fingerprint {
                anyhow::bail!("filters changed since the previous run; refusing to resume");
            }
            if snapshot != plan.snapshot && !not_consistent {
                anyhow::bail!(
                    "previous run used snapshot {snapshot}; it has expired. \
                     Use --not-consistent to resume against a new snapshot"
                );
            }
            return Ok(PlanInit::Resumed);
        }

        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO run_setup (id, system_identifier, timeline_id, snapshot,
                                    filters_fingerprint, created_at, plan_json)
             VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                plan.system_identifier,
                plan.timeline_id,
                plan.snapshot,
                plan.filters_fingerprint,
                plan.created_at.to_rfc3339(),
                serde_json::to_string(plan)?,
            ],
        )?;

        for t in &plan.tables {
            let state = if t.copy_data {
                TaskState::Planned
            } else {
                TaskState::Skipped
            };
            tx.execute(
                "INSERT INTO table_task (oid, schema_name, table_name, bytes, reltuples,
                                         relpages, replica_identity, identity_json,
                                         parent_oid, split_json, copy_data, state)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    t.oid,
                    t.schema,
                    t.name,
                    t.bytes as i64,
                    t.reltuples,
                    t.relpages,
                    replica_identity_str(t.replica_identity),
                    serde_json::to_string(&t.identity_columns)?,
                    t.parent_oid,
                    serde_json::to_string(&t.split)?,
                    t.copy_data,
                    state.as_str(),
                ],
            )?;
        }
        for p in &plan.table_parts {
            tx.execute(
                "INSERT INTO table_part (table_oid, part, lower_bound, upper_bound, state)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    p.table_oid,
                    p.part,
                    p.lower,
                    p.upper,
                    TaskState::Planned.as_str()
                ],
            )?;
        }
        for i in &plan.indexes {
            tx.execute(
                "INSERT INTO index_task (oid, table_oid, schema_name, index_name, definition,
                                         constraint_name, is_primary, state)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    i.oid,
                    i.table_oid,
                    i.schema,
                    i.name,
                    i.definition,
                    i.constraint.as_ref().map(|c| c.name.clone()),
                    i.constraint.as_ref().map(|c| c.is_primary).unwrap_or(false),
                    TaskState::Planned.as_str(),
                ],
            )?;
        }
        for c in &plan.constraints {
            tx.execute(
                "INSERT INTO constraint_task (oid, table_oid, schema_name, table_name,
                                              constraint_name, definition,
                                              referenced_table_oid, state)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    c.oid,
                    c.table_oid,
                    c.schema,
                    c.table,
                    c.name,
                    c.definition,
                    c.referenced_table_oid,
                    TaskState::Planned.as_str(),
                ],
            )?;
        }
        for s in &plan.sequences {
            tx.execute(
                "INSERT INTO sequence_task (oid, schema_name, name, last_value, is_called, state)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    s.oid,
                    s.schema,
                    s.name,
                    s.last_value,
                    s.is_called,
                    TaskState::Planned.as_str(),
                ],
            )?;
        }
        tx.execute(
            "INSERT INTO blob_state (id, estimated_count, last_copied_oid, state)
             VALUES (1, ?1, ?2, ?3)",
            params![
                plan.blobs.estimated_count,
                plan.blobs.last_copied_oid,
                TaskState::Planned.as_str(),
            ],
        )?;
        tx.execute(
            "INSERT INTO apply_cursor (id, applied_commit_lsn, written_lsn, flushed_lsn)
             VALUES (1, '0/0', '0/0', '0/0')",
            [],
        )?;
        tx.execute(
            "INSERT INTO sentinel (id, start_pos, end_pos, apply) VALUES (1, '0/0', '0/0', 0)",
            [],
        )?;
        tx.commit()?;

        Ok(PlanInit::Fresh)
    }

    /// The stored Work Plan, if this catalog has one.
    pub fn plan(&self) -> Result<Option<WorkPlan>> {
        let conn = self.lock();
        let json: Option<String> = conn
            .query_row("SELECT plan_json FROM run_setup WHERE id = 1", [], |row| {
                row.get(0)
            })
            .optional()?;
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    // ------------------------------------------------------------------
    // Task claiming and state transitions
    // ------------------------------------------------------------------

    /// Atomically claim a planned task. Exactly one worker wins the
    /// planned -> in-progress transition; everybody else moves on.
    pub fn task_claim(&self, kind: TaskKind, oid: u32) -> Result<bool> {
        let conn = self.lock();
        let changed = conn.execute(
            &format!(
                "UPDATE {} SET state = 'in-progress', attempts = attempts + 1
                 WHERE oid = ?1 AND state = 'planned'",
                kind.table()
            ),
            params![oid],
        )?;
        Ok(changed == 1)
    }

    pub fn part_claim(&self, table_oid: u32, part: u32) -> Result<bool> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE table_part SET state = 'in-progress', attempts = attempts + 1
             WHERE table_oid = ?1 AND part = ?2 AND state = 'planned'",
            params![table_oid, part],
        )?;
        Ok(changed == 1)
    }

    pub fn table_started(&self, oid: u32) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE table_task SET started_at = COALESCE(started_at, ?2) WHERE oid = ?1",
            params![oid, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Mark a whole-table copy complete with its final counters.
    pub fn table_done(&self, oid: u32, bytes: u64, rows: u64) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE table_task
             SET state = 'copied', bytes_transferred = bytes_transferred + ?2,
                 rows_copied = rows_copied + ?3, finished_at = ?4, error = NULL
             WHERE oid = ?1",
            params![oid, bytes as i64, rows as i64, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Mark one range of a split table complete. Returns true when this
    /// was the last outstanding part, at which point the caller promotes
    /// the table itself.
    pub fn part_done(&self, table_oid: u32, part: u32, bytes: u64, rows: u64) -> Result<bool> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE table_part
             SET state = 'copied', bytes_transferred = ?3, rows_copied = ?4, error = NULL
             WHERE table_oid = ?1 AND part = ?2",
            params![table_oid, part, bytes as i64, rows as i64],
        )?;
        tx.execute(
            "UPDATE table_task
             SET bytes_transferred = bytes_transferred + ?2, rows_copied = rows_copied + ?3
             WHERE oid = ?1",
            params![table_oid, bytes as i64, rows as i64],
        )?;
        let remaining: i64 = tx.query_row(
            "SELECT count(*) FROM table_part WHERE table_oid = ?1 AND state <> 'copied'",
            params![table_oid],
            |row| row.get(0),
        )?;
        tx.commit()?;
        Ok(remaining == 0)
    }

    /// Put a task back in the queue after a transient failure.
    pub fn task_requeue(&self, kind: TaskKind, oid: u32, error: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            &format!(
                "UPDATE {} SET state = 'planned', error = ?2 WHERE oid = ?1",
                kind.table()
            ),
            params![oid, error],
        )?;
        Ok(())
    }

    pub fn part_requeue(&self, table_oid: u32, part: u32, error: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE table_part SET state = 'planned', error = ?3
             WHERE table_oid = ?1 AND part = ?2",
            params![table_oid, part, error],
        )?;
        Ok(())
    }

    pub fn part_failed(&self, table_oid: u32, part: u32, error: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE table_part SET state = 'failed', error = ?3
             WHERE table_oid = ?1 AND part = ?2",
            params![table_oid, part, error],
        )?;
        Ok(())
    }

    /// Crash recovery: anything still in-progress was abandoned by a dead
    /// worker and goes back in the queue. Runs once at startup, before
    /// any pool exists.
    pub fn requeue_interrupted(&self) -> Result<u64> {
        let conn = self.lock();
        let mut total = 0;
        for table in [
            "table_task",
            "table_part",
            "index_task",
            "constraint_task",
            "sequence_task",
        ] {
            total += conn.execute(
                &format!(
                    "UPDATE {table} SET state = 'planned', error = 'interrupted'
                     WHERE state = 'in-progress'"
                ),
                [],
            )? as u64;
        }
        Ok(total)
    }

    pub fn task_failed(&self, kind: TaskKind, oid: u32, error: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            &format!(
                "UPDATE {} SET state = 'failed', error = ?2 WHERE oid = ?1",
                kind.table()
            ),
            params![oid, error],
        )?;
        Ok(())
    }

    pub fn task_done(&self, kind: TaskKind, oid: u32) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            &format!(
                "UPDATE {} SET state = 'copied', error = NULL WHERE oid = ?1",
                kind.table()
            ),
            params![oid],
        )?;
        Ok(())
    }

    pub fn task_state(&self, kind: TaskKind, oid: u32) -> Result<Option<TaskState>> {
        let conn = self.lock();
        let state: Option<String> = conn
            .query_row(
                &format!("SELECT state FROM {} WHERE oid = ?1", kind.table()),
                params![oid],
                |row| row.get(0),
            )
            .optional()?;
        Ok(state.and_then(|s| TaskState::parse(&s)))
    }

    pub fn attempts(&self, kind: TaskKind, oid: u32) -> Result<u32> {
        let conn = self.lock();
        Ok(conn.query_row(
            &format!("SELECT attempts FROM {} WHERE oid = ?1", kind.table()),
            params![oid],
            |row| row.get(0),
        )?)
    }

    pub fn part_attempts(&self, table_oid: u32, part: u32) -> Result<u32> {
        let conn = self.lock();
        Ok(conn.query_row(
            "SELECT attempts FROM table_part WHERE table_oid = ?1 AND part = ?2",
            params![table_oid, part],
            |row| row.get(0),
        )?)
    }

    // ------------------------------------------------------------------
    // Typed readers
    // ------------------------------------------------------------------

    /// All table tasks with their current state, ordered largest first so
    /// the copy scheduler can dequeue by longest-processing-time.
    pub fn table_tasks(&self) -> Result<Vec<(TableTask, TaskState)>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT oid, schema_name, table_name, bytes, reltuples, relpages,
                    replica_identity, identity_json, parent_oid, split_json, copy_data, state
             FROM table_task ORDER BY bytes DESC, oid",
        )?;
        let rows = stmt.query_map([], |row| {
            let identity: String = row.get(6)?;
            let identity_json: String = row.get(7)?;
            let split_json: String = row.get(9)?;
            let state: String = row.get(11)?;
            Ok((
                TableTask {
                    oid: row.get(0)?,
                    schema: row.get(1)?,
                    name: row.get(2)?,
                    bytes: row.get::<_, i64>(3)? as u64,
                    reltuples: row.get(4)?,
                    relpages: row.get(5)?,
                    replica_identity: parse_replica_identity(&identity),
                    parent_oid: row.get(8)?,
                    split: serde_json::from_str(&split_json).unwrap_or(SplitStrategy::None),
                    copy_data: row.get(10)?,
                    identity_columns: serde_json::from_str(&identity_json).unwrap_or_default(),
                },
                state,
            ))
        })?;
        let mut tasks = Vec::new();
        for row in rows {
            let (task, state) = row?;
            let state = TaskState::parse(&state)
                .with_context(|| format!("bad task state {state} for table {}", task.oid))?;
            tasks.push((task, state));
        }
        Ok(tasks)
    }

    pub fn table_parts(&self, table_oid: u32) -> Result<Vec<(TablePart, TaskState)>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT table_oid, part, lower_bound, upper_bound, state
             FROM table_part WHERE table_oid = ?1 ORDER BY part",
        )?;
        let rows = stmt.query_map(params![table_oid], |row| {
            let state: String = row.get(4)?;
            Ok((
                TablePart {
                    table_oid: row.get(0)?,
                    part: row.get(1)?,
                    lower: row.get(2)?,
                    upper: row.get(3)?,
                },
                state,
            ))
        })?;
        let mut parts = Vec::new();
        for row in rows {
            let (part, state) = row?;
            let state = TaskState::parse(&state).context("bad part state in catalog")?;
            parts.push((part, state));
        }
        Ok(parts)
    }

    pub fn index_tasks(&self) -> Result<Vec<(IndexTask, TaskState)>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT oid, table_oid, schema_name, index_name, definition,
                    constraint_name, is_primary, state
             FROM index_task ORDER BY oid",
        )?;
        let rows = stmt.query_map([], |row| {
            let constraint_name: Option<String> = row.get(5)?;
            let is_primary: bool = row.get(6)?;
            let state: String = row.get(7)?;
            Ok((
                IndexTask {
                    oid: row.get(0)?,
                    table_oid: row.get(1)?,
                    schema: row.get(2)?,
                    name: row.get(3)?,
                    definition: row.get(4)?,
                    constraint: constraint_name.map(|name| crate::plan::BackingConstraint {
                        name,
                        is_primary,
                    }),
                },
                state,
            ))
        })?;
        let mut tasks = Vec::new();
        for row in rows {
            let (task, state) = row?;
            let state = TaskState::parse(&state).context("bad index state in catalog")?;
            tasks.push((task, state));
        }
        Ok(tasks)
    }

    pub fn constraint_tasks(&self) -> Result<Vec<(ConstraintTask, TaskState)>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT oid, table_oid, schema_name, table_name, constraint_name, definition,
                    referenced_table_oid, state
             FROM constraint_task ORDER BY oid",
        )?;
        let rows = stmt.query_map([], |row| {
            let state: String = row.get(7)?;
            Ok((
                ConstraintTask {
                    oid: row.get(0)?,
                    table_oid: row.get(1)?,
                    schema: row.get(2)?,
                    table: row.get(3)?,
                    name: row.get(4)?,
                    definition: row.get(5)?,
                    referenced_table_oid: row.get(6)?,
                },
                state,
            ))
        })?;
        let mut tasks = Vec::new();
        for row in rows {
            let (task, state) = row?;
            let state = TaskState::parse(&state).context("bad constraint state in catalog")?;
            tasks.push((task, state));
        }
        Ok(tasks)
    }

    pub fn sequence_tasks(&self) -> Result<Vec<(SequenceTask, TaskState)>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT oid, schema_name, name, last_value, is_called, state
             FROM sequence_task ORDER BY oid",
        )?;
        let rows = stmt.query_map([], |row| {
            let state: String = row.get(5)?;
            Ok((
                SequenceTask {
                    oid: row.get(0)?,
                    schema: row.get(1)?,
                    name: row.get(2)?,
                    last_value: row.get(3)?,
                    is_called: row.get(4)?,
                },
                state,
            ))
        })?;
        let mut tasks = Vec::new();
        for row in rows {
            let (task, state) = row?;
            let state = TaskState::parse(&state).context("bad sequence state in catalog")?;
            tasks.push((task, state));
        }
        Ok(tasks)
    }

    // ------------------------------------------------------------------
    // Blob resume point
    // ------------------------------------------------------------------

    pub fn blob_state(&self) -> Result<BlobTask> {
        let conn = self.lock();
        Ok(conn
            .query_row(
                "SELECT estimated_count, last_copied_oid FROM blob_state WHERE id = 1",
                [],
                |row| {
                    Ok(BlobTask {
                        estimated_count: row.get(0)?,
                        last_copied_oid: row.get(1)?,
                    })
                },
            )
            .optional()?
            .unwrap_or_default())
    }

    pub fn blob_advance(&self, last_copied_oid: u32) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE blob_state SET last_copied_oid = max(last_copied_oid, ?1) WHERE id = 1",
            params![last_copied_oid],
        )?;
        Ok(())
    }

    pub fn blob_done(&self) -> Result<()> {
        let conn = self.lock();
        conn.execute("UPDATE blob_state SET state = 'copied' WHERE id = 1", [])?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // CDC state: slot, cursor, sentinel
    // ------------------------------------------------------------------

    pub fn slot_write(&self, slot: &SlotState) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO slot_state (id, slot_name, plugin, consistent_point,
                                     write_lsn, flush_lsn, timeline_id)
             VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (id) DO UPDATE SET
                 slot_name = excluded.slot_name,
                 plugin = excluded.plugin,
                 consistent_point = excluded.consistent_point,
                 write_lsn = excluded.write_lsn,
                 flush_lsn = excluded.flush_lsn,
                 timeline_id = excluded.timeline_id",
            params![
                slot.slot_name,
                slot.plugin,
                slot.consistent_point.to_string(),
                slot.write_lsn.to_string(),
                slot.flush_lsn.to_string(),
                slot.timeline_id,
            ],
        )?;
        Ok(())
    }

    pub fn slot_read(&self) -> Result<Option<SlotState>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT slot_name, plugin, consistent_point, write_lsn, flush_lsn, timeline_id
                 FROM slot_state WHERE id = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, u32>(5)?,
                    ))
                },
            )
            .optional()?;
        match row {
            None => Ok(None),
            Some((slot_name, plugin, consistent, write, flush, timeline_id)) => Ok(Some(SlotState {
                slot_name,
                plugin,
                consistent_point: consistent.parse().context("bad consistent_point")?,
                write_lsn: write.parse().context("bad write_lsn")?,
                flush_lsn: flush.parse().context("bad flush_lsn")?,
                timeline_id,
            })),
        }
    }

    /// Advance the Apply Cursor. Each component is clamped so it never
    /// moves backwards, which keeps applied-commit LSN monotonic across
    /// restarts no matter what the caller read before a crash.
    pub fn cursor_write(&self, cursor: ApplyCursor) -> Result<ApplyCursor> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let current = read_cursor(&tx)?;
        let merged = ApplyCursor {
            applied_commit_lsn: cursor.applied_commit_lsn.max(current.applied_commit_lsn),
            written_lsn: cursor.written_lsn.max(current.written_lsn),
            flushed_lsn: cursor.flushed_lsn.max(current.flushed_lsn),
        };
        tx.execute(
            "INSERT INTO apply_cursor (id, applied_commit_lsn, written_lsn, flushed_lsn)
             VALUES (1, ?1, ?2, ?3)
             ON CONFLICT (id) DO UPDATE SET
                 applied_commit_lsn = excluded.applied_commit_lsn,
                 written_lsn = excluded.written_lsn,
                 flushed_lsn = excluded.flushed_lsn",
            params![
                merged.applied_commit_lsn.to_string(),
                merged.written_lsn.to_string(),
                merged.flushed_lsn.to_string(),
            ],
        )?;
        tx.commit()?;
        Ok(merged)
    }

    pub fn cursor_read(&self) -> Result<ApplyCursor> {
        let conn = self.lock();
        read_cursor(&conn)
    }

    pub fn sentinel_write(&self, sentinel: Sentinel) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO sentinel (id, start_pos, end_pos, apply) VALUES (1, ?1, ?2, ?3)
             ON CONFLICT (id) DO UPDATE SET
                 start_pos = excluded.start_pos,
                 end_pos = excluded.end_pos,
                 apply = excluded.apply",
            params![
                sentinel.start_pos.to_string(),
                sentinel.end_pos.to_string(),
                sentinel.apply,
            ],
        )?;
        Ok(())
    }

    pub fn sentinel_read(&self) -> Result<Sentinel> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT start_pos, end_pos, apply FROM sentinel WHERE id = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, bool>(2)?,
                    ))
                },
            )
            .optional()?;
        match row {
            None => Ok(Sentinel::default()),
            Some((start, end, apply)) => Ok(Sentinel {
                start_pos: start.parse().context("bad start_pos")?,
                end_pos: end.parse().context("bad end_pos")?,
                apply,
            }),
        }
    }

    // ------------------------------------------------------------------
    // Reporting
    // ------------------------------------------------------------------

    pub fn summary(&self) -> Result<RunSummary> {
        let conn = self.lock();
        let mut summary = RunSummary::default();

        for kind in [
            TaskKind::Table,
            TaskKind::Index,
            TaskKind::Constraint,
            TaskKind::Sequence,
        ] {
            let mut counts = TaskCounts::default();
            let mut stmt = conn.prepare(&format!(
                "SELECT state, count(*) FROM {} GROUP BY state",
                kind.table()
            ))?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })?;
            for row in rows {
                let (state, count) = row?;
                match TaskState::parse(&state) {
                    Some(TaskState::Planned) => counts.planned = count,
                    Some(TaskState::InProgress) => counts.in_progress = count,
                    Some(TaskState::Copied) => counts.copied = count,
                    Some(TaskState::Failed) => counts.failed = count,
                    Some(TaskState::Skipped) => counts.skipped = count,
                    None => {}
                }
            }
            summary.counts.insert(kind.as_str().to_string(), counts);
        }

        let (bytes, rows): (i64, i64) = conn.query_row(
            "SELECT COALESCE(sum(bytes_transferred), 0), COALESCE(sum(rows_copied), 0)
             FROM table_task",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        summary.bytes_transferred = bytes as u64;
        summary.rows_copied = rows as u64;

        let mut stmt = conn.prepare(
            "SELECT 'table', schema_name || '.' || table_name, attempts, COALESCE(error, '')
               FROM table_task WHERE state = 'failed'
             UNION ALL
             SELECT 'index', schema_name || '.' || index_name, attempts, COALESCE(error, '')
               FROM index_task WHERE state = 'failed'
             UNION ALL
             SELECT 'constraint', schema_name || '.' || constraint_name, attempts,
                    COALESCE(error, '')
               FROM constraint_task WHERE state = 'failed'",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(FailedTask {
                kind: row.get(0)?,
                name: row.get(1)?,
                attempts: row.get(2)?,
                error: row.get(3)?,
            })
        })?;
        for row in rows {
            summary.failed.push(row?);
        }

        Ok(summary)
    }
}

fn read_cursor(conn: &Connection) -> Result<ApplyCursor> {
    let row = conn
        .query_row(
            "SELECT applied_commit_lsn, written_lsn, flushed_lsn FROM apply_cursor WHERE id = 1",
            [],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            },
        )
        .optional()?;
    match row {
        None => Ok(ApplyCursor::default()),
        Some((applied, written, flushed)) => Ok(ApplyCursor {
            applied_commit_lsn: applied.parse().context("bad applied_commit_lsn")?,
            written_lsn: written.parse().context("bad written_lsn")?,
            flushed_lsn: flushed.parse().context("bad flushed_lsn")?,
        }),
    }
}

fn replica_identity_str(identity: ReplicaIdentity) -> &'static str {
    match identity {
        ReplicaIdentity::Default => "default",
        ReplicaIdentity::Full => "full",
        ReplicaIdentity::Index => "index",
        ReplicaIdentity::Nothing => "nothing",
    }
}

fn parse_replica_identity(s: &str) -> ReplicaIdentity {
    match s {
        "full" => ReplicaIdentity::Full,
        "index" => ReplicaIdentity::Index,
        "nothing" => ReplicaIdentity::Nothing,
        _ => ReplicaIdentity::Default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lsn::Lsn;
    use chrono::Utc;

    fn test_plan() -> WorkPlan {
        WorkPlan {
            system_identifier: "7000000000000000001".into(),
            timeline_id: 1,
            snapshot: "00000003-00000002-1".into(),
            created_at: Utc::now(),
            filters_fingerprint: "{}".into(),
            tables: vec![
                TableTask {
                    oid: 100,
                    schema: "public".into(),
                    name: "users".into(),
                    bytes: 4096,
                    reltuples: 100,
                    relpages: 1,
                    replica_identity: ReplicaIdentity::Default,
                    parent_oid: None,
                    split: SplitStrategy::None,
                    copy_data: true,
                    identity_columns: vec![],
                },
                TableTask {
                    oid: 101,
                    schema: "public".into(),
                    name: "orders".into(),
                    bytes: 8192,
                    reltuples: 50,
                    relpages: 2,
                    replica_identity: ReplicaIdentity::Full,
                    parent_oid: None,
                    split: SplitStrategy::CtidRange { parts: 2 },
                    copy_data: true,
                    identity_columns: vec![],
                },
            ],
            table_parts: vec![
                TablePart {
                    table_oid: 101,
                    part: 0,
                    lower: 0,
                    upper: Some(1),
                },
                TablePart {
                    table_oid: 101,
                    part: 1,
                    lower: 1,
                    upper: None,
                },
            ],
            indexes: vec![IndexTask {
                oid: 200,
                table_oid: 100,
                schema: "public".into(),
                name: "users_pkey".into(),
                definition: "CREATE UNIQUE INDEX users_pkey ON public.users (id)".into(),
                constraint: Some(crate::plan::BackingConstraint {
                    name: "users_pkey".into(),
                    is_primary: true,
                }),
            }],
            constraints: vec![ConstraintTask {
                oid: 300,
                table_oid: 101,
                schema: "public".into(),
                table: "orders".into(),
                name: "orders_user_fk".into(),
                definition: "FOREIGN KEY (user_id) REFERENCES public.users(id)".into(),
                referenced_table_oid: 100,
            }],
            sequences: vec![SequenceTask {
                oid: 400,
                schema: "public".into(),
                name: "users_id_seq".into(),
                last_value: 100,
                is_called: true,
            }],
            matviews: vec![],
            blobs: BlobTask {
                estimated_count: 3,
                last_copied_oid: 0,
            },
            extensions: vec![],
        }
    }

    fn open_catalog() -> (tempfile::TempDir, Catalog) {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(dir.path()).unwrap();
        (dir, catalog)
    }

    #[test]
    fn test_plan_init_and_read_back() {
        let (_dir, catalog) = open_catalog();
        assert_eq!(
            catalog.plan_init(&test_plan(), false, false).unwrap(),
            PlanInit::Fresh
        );
        let plan = catalog.plan().unwrap().unwrap();
        assert_eq!(plan.tables.len(), 2);

        let tasks = catalog.table_tasks().unwrap();
        assert_eq!(tasks.len(), 2);
        // Largest first.
        assert_eq!(tasks[0].0.oid, 101);
        assert!(tasks.iter().all(|(_, s)| *s == TaskState::Planned));
    }

    #[test]
    fn test_claim_is_exactly_once() {
        let (_dir, catalog) = open_catalog();
        catalog.plan_init(&test_plan(), false, false).unwrap();

        assert!(catalog.task_claim(TaskKind::Table, 100).unwrap());
        assert!(!catalog.task_claim(TaskKind::Table, 100).unwrap());
        assert_eq!(
            catalog.task_state(TaskKind::Table, 100).unwrap(),
            Some(TaskState::InProgress)
        );
        assert_eq!(catalog.attempts(TaskKind::Table, 100).unwrap(), 1);

        // Requeue makes it claimable again, bumping attempts.
        catalog
            .task_requeue(TaskKind::Table, 100, "connection reset")
            .unwrap();
        assert!(catalog.task_claim(TaskKind::Table, 100).unwrap());
        assert_eq!(catalog.attempts(TaskKind::Table, 100).unwrap(), 2);

        // Done tasks cannot be claimed.
        catalog.table_done(100, 4096, 100).unwrap();
        assert!(!catalog.task_claim(TaskKind::Table, 100).unwrap());
    }

    #[test]
    fn test_part_done_promotes_on_last_part() {
        let (_dir, catalog) = open_catalog();
        catalog.plan_init(&test_plan(), false, false).unwrap();

        assert!(catalog.part_claim(101, 0).unwrap());
        assert!(!catalog.part_done(101, 0, 4000, 25).unwrap());
        assert!(catalog.part_claim(101, 1).unwrap());
        assert!(catalog.part_done(101, 1, 4192, 25).unwrap());

        // Counters accumulate on the owning table.
        let summary = catalog.summary().unwrap();
        assert_eq!(summary.bytes_transferred, 8192);
        assert_eq!(summary.rows_copied, 50);
    }

    #[test]
    fn test_resume_validation() {
        let (_dir, catalog) = open_catalog();
        let plan = test_plan();
        catalog.plan_init(&plan, false, false).unwrap();

        // Same plan without --resume refuses.
        catalog.plan_init(&plan, false, false).unwrap_err();

        // Resume with the same snapshot succeeds and keeps states.
        catalog.table_done(100, 1, 1).unwrap();
        assert_eq!(
            catalog.plan_init(&plan, true, false).unwrap(),
            PlanInit::Resumed
        );
        assert_eq!(
            catalog.task_state(TaskKind::Table, 100).unwrap(),
            Some(TaskState::Copied)
        );

        // A new snapshot needs --not-consistent.
        let mut newer = plan.clone();
        newer.snapshot = "00000004-00000009-1".into();
        catalog.plan_init(&newer, true, false).unwrap_err();
        assert_eq!(
            catalog.plan_init(&newer, true, true).unwrap(),
            PlanInit::Resumed
        );

        // A different source server is always refused.
        let mut other = plan.clone();
        other.system_identifier = "123".into();
        catalog.plan_init(&other, true, false).unwrap_err();
    }

    #[test]
    fn test_cursor_is_monotonic() {
        let (_dir, catalog) = open_catalog();
        catalog.plan_init(&test_plan(), false, false).unwrap();

        let advanced = catalog
            .cursor_write(ApplyCursor {
                applied_commit_lsn: Lsn(0x2000),
                written_lsn: Lsn(0x3000),
                flushed_lsn: Lsn(0x1000),
            })
            .unwrap();
        assert_eq!(advanced.applied_commit_lsn, Lsn(0x2000));

        // A stale write cannot move anything backwards.
        let merged = catalog
            .cursor_write(ApplyCursor {
                applied_commit_lsn: Lsn(0x1000),
                written_lsn: Lsn(0x1000),
                flushed_lsn: Lsn(0x500),
            })
            .unwrap();
        assert_eq!(merged.applied_commit_lsn, Lsn(0x2000));
        assert_eq!(merged.written_lsn, Lsn(0x3000));
        assert_eq!(merged.flushed_lsn, Lsn(0x1000));
        assert_eq!(catalog.cursor_read().unwrap(), merged);
    }

    #[test]
    fn test_slot_and_sentinel_round_trip() {
        let (_dir, catalog) = open_catalog();
        catalog.plan_init(&test_plan(), false, false).unwrap();

        let slot = SlotState {
            slot_name: "pgcopydb".into(),
            plugin: "wal2json".into(),
            consistent_point: Lsn(0x16B374D848),
            write_lsn: Lsn::INVALID,
            flush_lsn: Lsn::INVALID,
            timeline_id: 1,
        };
        catalog.slot_write(&slot).unwrap();
        let read = catalog.slot_read().unwrap().unwrap();
        assert_eq!(read.consistent_point, slot.consistent_point);
        assert_eq!(read.plugin, "wal2json");

        let sentinel = Sentinel {
            start_pos: Lsn(0x100),
            end_pos: Lsn(0x9000),
            apply: true,
        };
        catalog.sentinel_write(sentinel).unwrap();
        assert_eq!(catalog.sentinel_read().unwrap(), sentinel);
    }

    #[test]
    fn test_blob_resume_point() {
        let (_dir, catalog) = open_catalog();
        catalog.plan_init(&test_plan(), false, false).unwrap();

        assert_eq!(catalog.blob_state().unwrap().last_copied_oid, 0);
        catalog.blob_advance(5000).unwrap();
        catalog.blob_advance(4000).unwrap();
        assert_eq!(catalog.blob_state().unwrap().last_copied_oid, 5000);
    }

    #[test]
    fn test_version_mismatch_rebuilds() {
        let dir = tempfile::tempdir().unwrap();
        {
            let catalog = Catalog::open(dir.path()).unwrap();
            catalog.plan_init(&test_plan(), false, false).unwrap();
        }
        // Bump the version marker on disk; reopening must rebuild empty.
        {
            let conn = Connection::open(dir.path().join("pgcopydb.db")).unwrap();
            conn.pragma_update(None, "user_version", 999).unwrap();
        }
        let catalog = Catalog::open(dir.path()).unwrap();
        assert!(catalog.plan().unwrap().is_none());
    }

    #[test]
    fn test_summary_counts_failures() {
        let (_dir, catalog) = open_catalog();
        catalog.plan_init(&test_plan(), false, false).unwrap();

        catalog.task_claim(TaskKind::Table, 100).unwrap();
        catalog
            .task_failed(TaskKind::Table, 100, "out of disk")
            .unwrap();

        let summary = catalog.summary().unwrap();
        assert_eq!(summary.counts["table"].failed, 1);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].name, "public.users");
        assert!(!summary.is_success());
    }
}
