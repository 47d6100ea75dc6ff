//! pgcopydb: clone a live PostgreSQL database into another live instance.
//!
//! The orchestrator automates the classic `dump | restore` pipeline while
//! eliminating intermediate table storage, parallelizing every independent
//! unit of work (per-table COPY, per-index CREATE, per-constraint ALTER,
//! per-blob fetch), and optionally keeping the target synchronized with
//! the source through logical decoding until an operator-chosen stop LSN.
//!
//! Components, leaves first:
//!
//! - [`catalog`] - the Progress Catalog, a local SQLite store owning all
//!   persistent run state and resume points
//! - [`introspect`] - the source introspector producing the Work Plan
//! - [`schema`] - the pg_dump/pg_restore bridge for pre/post-data DDL
//! - [`copy`] - the parallel binary-COPY supervisor
//! - [`indexes`] - index and constraint builds in dependency order
//! - [`blobs`] - the large-object pipeline
//! - [`cdc`] - the receive/transform/apply change data capture pipeline
//!
//! The [`clone`] module wires them into a full run.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

pub mod blobs;
pub mod catalog;
pub mod cdc;
pub mod clone;
pub mod compare;
pub mod config;
pub mod copy;
pub mod error;
pub mod filters;
pub mod indexes;
pub mod introspect;
pub mod list;
pub mod lsn;
pub mod pgsql;
pub mod plan;
pub mod retry;
pub mod schema;
pub mod sequences;
pub mod summary;

use config::{Plugin, RunConfig, StreamConfig};
use filters::Filters;
use lsn::Lsn;

/// Source and target connection strings, with the usual environment
/// fallbacks.
#[derive(Args, Clone, Debug)]
pub struct ConnectionOpts {
    /// Source database connection string
    #[arg(long, env = "PGCOPYDB_SOURCE_PGURI")]
    pub source: String,

    /// Target database connection string
    #[arg(long, env = "PGCOPYDB_TARGET_PGURI")]
    pub target: String,
}

/// Source-only connection, for inspection commands.
#[derive(Args, Clone, Debug)]
pub struct SourceOpts {
    /// Source database connection string
    #[arg(long, env = "PGCOPYDB_SOURCE_PGURI")]
    pub source: String,
}

/// Options shared by every command that touches the working directory.
#[derive(Args, Clone, Debug)]
pub struct RunOpts {
    /// Working directory for the catalog, segments, and artifacts
    #[arg(long, default_value = config::DEFAULT_DIR)]
    pub dir: PathBuf,

    /// Number of concurrent table copy workers
    #[arg(long, default_value_t = 4)]
    pub table_jobs: usize,

    /// Number of concurrent index build workers
    #[arg(long, default_value_t = 4)]
    pub index_jobs: usize,

    /// Number of pg_restore jobs
    #[arg(long, default_value_t = 4)]
    pub restore_jobs: usize,

    /// Number of concurrent large-object workers
    #[arg(long = "large-objects-jobs", default_value_t = 4)]
    pub large_objects_jobs: usize,

    /// Number of concurrent vacuum analyze jobs
    #[arg(long, default_value_t = 1)]
    pub vacuum_jobs: usize,

    /// Split tables larger than this into concurrently copied ranges
    /// (e.g. 1GB)
    #[arg(long, value_parser = config::parse_byte_size)]
    pub split_tables_larger_than: Option<u64>,

    /// Path to a YAML filter manifest
    #[arg(long)]
    pub filters: Option<PathBuf>,

    /// Reuse an externally exported snapshot
    #[arg(long)]
    pub snapshot: Option<String>,

    /// Continue a previously interrupted run
    #[arg(long)]
    pub resume: bool,

    /// Allow resuming under a new snapshot (consistency not guaranteed)
    #[arg(long)]
    pub not_consistent: bool,

    #[arg(long)]
    pub skip_large_objects: bool,

    #[arg(long)]
    pub skip_extensions: bool,

    #[arg(long)]
    pub skip_collations: bool,

    #[arg(long)]
    pub skip_vacuum: bool,

    /// Do not fail on database property restore errors
    #[arg(long)]
    pub skip_db_properties: bool,

    #[arg(long)]
    pub no_owner: bool,

    #[arg(long)]
    pub no_acl: bool,

    /// Restore with --clean --if-exists
    #[arg(long)]
    pub drop_if_exists: bool,

    /// Retry budget for transient failures
    #[arg(long, default_value_t = 5)]
    pub max_attempts: u32,
}

impl RunOpts {
    pub fn to_config(&self) -> RunConfig {
        RunConfig {
            dir: self.dir.clone(),
            table_jobs: self.table_jobs,
            index_jobs: self.index_jobs,
            restore_jobs: self.restore_jobs,
            lo_jobs: self.large_objects_jobs,
            vacuum_jobs: self.vacuum_jobs,
            split_tables_larger_than: self.split_tables_larger_than,
            copy_policy: config::CopyPolicy::Truncate,
            max_attempts: self.max_attempts,
            resume: self.resume,
            not_consistent: self.not_consistent,
            skip_large_objects: self.skip_large_objects,
            skip_extensions: self.skip_extensions,
            skip_collations: self.skip_collations,
            skip_vacuum: self.skip_vacuum,
            skip_db_properties: self.skip_db_properties,
            no_owner: self.no_owner,
            no_acl: self.no_acl,
            drop_if_exists: self.drop_if_exists,
            snapshot: self.snapshot.clone(),
        }
    }

    pub fn load_filters(&self) -> Result<Filters> {
        match &self.filters {
            Some(path) => Filters::load(path)
                .with_context(|| format!("failed to load filters from {}", path.display())),
            None => Ok(Filters::default()),
        }
    }
}

/// Change data capture options for `clone --follow` and the `stream`
/// command family.
#[derive(Args, Clone, Debug)]
pub struct StreamOpts {
    /// Logical replication slot name
    #[arg(long, default_value = config::DEFAULT_SLOT)]
    pub slot_name: String,

    /// Create the replication slot
    #[arg(long)]
    pub create_slot: bool,

    /// Logical decoding output plugin
    #[arg(long, value_enum, default_value = "wal2json")]
    pub plugin: Plugin,

    /// Replication origin name on the target (defaults to the slot name)
    #[arg(long)]
    pub origin: Option<String>,

    /// Stop applying at this LSN
    #[arg(long)]
    pub endpos: Option<Lsn>,

    /// Start streaming at this LSN instead of the slot position
    #[arg(long)]
    pub startpos: Option<Lsn>,

    /// Segment file rotation threshold
    #[arg(long, value_parser = config::parse_byte_size, default_value = "16MB")]
    pub segment_size: u64,
}

impl StreamOpts {
    pub fn to_stream_config(&self) -> StreamConfig {
        StreamConfig {
            slot_name: self.slot_name.clone(),
            plugin: self.plugin,
            origin: self
                .origin
                .clone()
                .unwrap_or_else(|| self.slot_name.clone()),
            create_slot: self.create_slot,
            start_pos: self.startpos,
            end_pos: self.endpos,
            segment_size: self.segment_size,
        }
    }
}
