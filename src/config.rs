//! Run configuration: working directory layout, parallelism knobs, and the
//! policies that shape a clone run.

use std::path::PathBuf;

use anyhow::Context;

use crate::lsn::Lsn;

/// Default working directory, shared by every subcommand unless `--dir`
/// points elsewhere.
pub const DEFAULT_DIR: &str = "/tmp/pgcopydb";

/// Default logical replication slot name.
pub const DEFAULT_SLOT: &str = "pgcopydb";

/// How an existing target table is treated before COPY.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyPolicy {
    /// `TRUNCATE ONLY` the target table first.
    Truncate,
    /// Assume the target table is empty and append.
    Append,
}

/// Logical decoding output plugins we can transcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Plugin {
    #[value(name = "wal2json")]
    Wal2json,
    #[value(name = "test_decoding")]
    TestDecoding,
}

impl Plugin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Plugin::Wal2json => "wal2json",
            Plugin::TestDecoding => "test_decoding",
        }
    }
}

/// Everything a run needs to know beyond the two connection strings.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub dir: PathBuf,
    pub table_jobs: usize,
    pub index_jobs: usize,
    pub restore_jobs: usize,
    pub lo_jobs: usize,
    pub vacuum_jobs: usize,
    /// Tables larger than this are split into concurrently copied ranges.
    /// `None` disables splitting.
    pub split_tables_larger_than: Option<u64>,
    pub copy_policy: CopyPolicy,
    pub max_attempts: u32,
    pub resume: bool,
    pub not_consistent: bool,
    pub skip_large_objects: bool,
    pub skip_extensions: bool,
    pub skip_collations: bool,
    pub skip_vacuum: bool,
    pub skip_db_properties: bool,
    pub no_owner: bool,
    pub no_acl: bool,
    pub drop_if_exists: bool,
    /// Reuse an externally exported snapshot instead of exporting our own.
    pub snapshot: Option<String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            dir: PathBuf::from(DEFAULT_DIR),
            table_jobs: 4,
            index_jobs: 4,
            restore_jobs: 4,
            lo_jobs: 4,
            vacuum_jobs: 1,
            split_tables_larger_than: None,
            copy_policy: CopyPolicy::Truncate,
            max_attempts: 5,
            resume: false,
            not_consistent: false,
            skip_large_objects: false,
            skip_extensions: false,
            skip_collations: false,
            skip_vacuum: false,
            skip_db_properties: false,
            no_owner: false,
            no_acl: false,
            drop_if_exists: false,
            snapshot: None,
        }
    }
}

impl RunConfig {
    /// `schema/` holds the pg_dump artifacts and the restore list.
    pub fn schema_dir(&self) -> PathBuf {
        self.dir.join("schema")
    }

    /// `run/` holds the plan snapshot and the final summary.
    pub fn run_dir(&self) -> PathBuf {
        self.dir.join("run")
    }

    /// `cdc/<slot>/` holds segment files and transformed SQL.
    pub fn cdc_dir(&self, slot: &str) -> PathBuf {
        self.dir.join("cdc").join(slot)
    }

    /// The Progress Catalog database file.
    pub fn catalog_path(&self) -> PathBuf {
        self.dir.join("pgcopydb.db")
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.schema_dir())?;
        std::fs::create_dir_all(self.run_dir())?;
        std::fs::create_dir_all(self.dir.join("cdc"))?;
        Ok(())
    }
}

/// CDC stream options for follow mode and the `stream` command family.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub slot_name: String,
    pub plugin: Plugin,
    pub origin: String,
    pub create_slot: bool,
    pub start_pos: Option<Lsn>,
    pub end_pos: Option<Lsn>,
    /// Segment rotation threshold in bytes.
    pub segment_size: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            slot_name: DEFAULT_SLOT.to_string(),
            plugin: Plugin::Wal2json,
            origin: DEFAULT_SLOT.to_string(),
            create_slot: false,
            start_pos: None,
            end_pos: None,
            segment_size: 16 * 1024 * 1024,
        }
    }
}

/// Parse a human byte size like "1MB", "512 kB", "4GB", or a plain number
/// of bytes. Suffixes follow PostgreSQL's GUC conventions.
pub fn parse_byte_size(s: &str) -> anyhow::Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        anyhow::bail!("empty byte size");
    }

    let (num, multiplier) = if let Some(n) = strip_unit(s, &["TB"]) {
        (n, 1024 * 1024 * 1024 * 1024)
    } else if let Some(n) = strip_unit(s, &["GB"]) {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = strip_unit(s, &["MB"]) {
        (n, 1024 * 1024)
    } else if let Some(n) = strip_unit(s, &["kB", "KB"]) {
        (n, 1024)
    } else if let Some(n) = strip_unit(s, &["B"]) {
        (n, 1)
    } else {
        (s, 1)
    };

    let value: u64 = num
        .trim()
        .parse()
        .with_context(|| format!("invalid byte size: {s}"))?;
    Ok(value * multiplier)
}

fn strip_unit<'a>(s: &'a str, units: &[&str]) -> Option<&'a str> {
    units.iter().find_map(|u| s.strip_suffix(u))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_parse_byte_size() {
        assert_eq!(parse_byte_size("1024").unwrap(), 1024);
        assert_eq!(parse_byte_size("512B").unwrap(), 512);
        assert_eq!(parse_byte_size("1kB").unwrap(), 1024);
        assert_eq!(parse_byte_size("1MB").unwrap(), 1024 * 1024);
        assert_eq!(parse_byte_size("2 GB").unwrap(), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_byte_size(" 10MB ").unwrap(), 10 * 1024 * 1024);

        parse_byte_size("").unwrap_err();
        parse_byte_size("abc").unwrap_err();
        parse_byte_size("1XB").unwrap_err();
    }

    #[test]
    fn test_dir_layout() {
        let config = RunConfig {
            dir: PathBuf::from("/tmp/x"),
            ..Default::default()
        };
        assert_eq!(config.catalog_path(), Path::new("/tmp/x/pgcopydb.db"));
        assert_eq!(config.cdc_dir("pgcopydb"), Path::new("/tmp/x/cdc/pgcopydb"));
        assert_eq!(config.schema_dir(), Path::new("/tmp/x/schema"));
    }
}
