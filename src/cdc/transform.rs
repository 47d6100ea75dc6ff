//! The Transformer: turn received plugin messages into per-transaction SQL
//! files the applier can replay idempotently.
//!
//! Output lands in `sql/<commit-lsn>.sql` next to the segments. Each file
//! is written under a `.partial` name and renamed once the transaction's
//! COMMIT record is seen, so the rename is the commit sentinel: files
//! without it do not exist as far as the applier is concerned, and a
//! transformer restart simply rebuilds them.
//!
//! Idempotency strategy: INSERT becomes an upsert keyed on the relation's
//! replica identity, UPDATE and DELETE key on the identity columns, and
//! TRUNCATE passes through. Replaying any suffix of transactions yields
//! the same target state.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::cdc::change::{Change, ChangeRecord, Column, Relation, TupleValue};
use crate::cdc::segment::{self, SegmentRecord};
use crate::config::Plugin;
use crate::lsn::Lsn;
use crate::plan::WorkPlan;

/// Replica identity columns keyed by (schema, table), sourced from the
/// Work Plan for relations whose decoded messages omit key metadata.
pub type IdentityMap = HashMap<(String, String), Vec<String>>;

pub fn identity_map(plan: &WorkPlan) -> IdentityMap {
    plan.tables
        .iter()
        .filter(|t| !t.identity_columns.is_empty())
        .map(|t| {
            (
                (t.schema.clone(), t.name.clone()),
                t.identity_columns.clone(),
            )
        })
        .collect()
}

/// Tagged dispatch over the two supported output plugins. Both produce
/// the same Change Record shape.
pub fn parse_record(plugin: Plugin, record: &SegmentRecord) -> Result<ChangeRecord> {
    match plugin {
        Plugin::Wal2json => crate::cdc::wal2json::parse(record.lsn, &record.data),
        Plugin::TestDecoding => crate::cdc::test_decoding::parse(record.lsn, &record.data),
    }
}

/// Metadata line at the top of every transformed SQL file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxnHeader {
    pub commit_lsn: Lsn,
    pub first_lsn: Lsn,
    pub xid: Option<u64>,
    pub timestamp: Option<String>,
}

impl TxnHeader {
    pub fn render(&self) -> String {
        format!("-- {}", serde_json::to_string(self).expect("header serialize"))
    }

    pub fn parse(line: &str) -> Result<TxnHeader> {
        let json = line
            .strip_prefix("-- ")
            .context("transformed file missing header line")?;
        serde_json::from_str(json).context("bad transformed file header")
    }
}

struct TxnBuffer {
    first_lsn: Lsn,
    xid: Option<u64>,
    statements: Vec<String>,
}

/// Streams segments into transaction files. Keeps in-memory position so a
/// long-running follow loop does not rescan finished segments; a restart
/// rescans everything and skips transactions that already exist on disk.
pub struct Transformer {
    plugin: Plugin,
    sql_dir: PathBuf,
    identities: IdentityMap,
    buffer: Option<TxnBuffer>,
    /// Segments whose records are fully consumed (by start LSN).
    processed_through: Option<Lsn>,
    pub last_commit_lsn: Lsn,
}

#[derive(Debug, Default)]
pub struct TransformReport {
    pub transactions_written: usize,
    pub last_commit_lsn: Lsn,
}

impl Transformer {
    pub fn new(cdc_dir: &Path, plugin: Plugin, identities: IdentityMap) -> Result<Transformer> {
        let sql_dir = cdc_dir.join("sql");
        fs::create_dir_all(&sql_dir)
            .with_context(|| format!("failed to create {}", sql_dir.display()))?;
        Ok(Transformer {
            plugin,
            sql_dir,
            identities,
            buffer: None,
            processed_through: None,
            last_commit_lsn: Lsn::INVALID,
        })
    }

    pub fn sql_dir(&self) -> &Path {
        &self.sql_dir
    }

    /// Process every finalized segment we have not seen yet. Transactions
    /// still open when the data runs out stay buffered for the next call;
    /// a COMMIT in a later segment closes them.
    pub fn process_available(&mut self, cdc_dir: &Path) -> Result<TransformReport> {
        let mut report = TransformReport {
            transactions_written: 0,
            last_commit_lsn: self.last_commit_lsn,
        };

        for (start_lsn, path) in segment::list_segments(cdc_dir)? {
            if Some(start_lsn) <= self.processed_through {
                continue;
            }
            for record in segment::read_segment(&path)? {
                let parsed = parse_record(self.plugin, &record).map_err(|e| {
                    anyhow::anyhow!("unparseable plugin message at {}: {e:#}", record.lsn)
                })?;
                self.apply_record(parsed, &mut report)?;
            }
            self.processed_through = Some(start_lsn);
        }

        report.last_commit_lsn = self.last_commit_lsn;
        Ok(report)
    }

    fn apply_record(&mut self, record: ChangeRecord, report: &mut TransformReport) -> Result<()> {
        match record.change {
            Change::Begin { xid, .. } => {
                if self.buffer.is_some() {
                    tracing::warn!("BEGIN at {} with open transaction, dropping it", record.lsn);
                }
                self.buffer = Some(TxnBuffer {
                    first_lsn: record.lsn,
                    xid: xid.or(record.xid),
                    statements: Vec::new(),
                });
            }
            Change::Commit {
                timestamp,
                end_lsn: _,
            } => {
                let Some(buffer) = self.buffer.take() else {
                    // Mid-transaction stream start: the server will resend
                    // the whole transaction after a restart, so an orphan
                    // commit carries nothing we need.
                    tracing::debug!("COMMIT at {} with no open transaction", record.lsn);
                    return Ok(());
                };
                let header = TxnHeader {
                    commit_lsn: record.lsn,
                    first_lsn: buffer.first_lsn,
                    xid: buffer.xid,
                    timestamp,
                };
                if self.write_transaction(&header, &buffer.statements)? {
                    report.transactions_written += 1;
                }
                self.last_commit_lsn = record.lsn;
            }
            Change::Message { ref prefix, .. } => {
                tracing::debug!("skipping logical message (prefix {prefix:?})");
            }
            Change::SwitchWal => {}
            ref change => {
                let statement = render_change(change, &self.identities)?;
                match self.buffer.as_mut() {
                    Some(buffer) => buffer.statements.push(statement),
                    // Stream picked up mid-transaction; the full
                    // transaction replays on the next reconnect.
                    None => tracing::warn!(
                        "{} at {} outside a transaction, skipping",
                        record.action_name(),
                        record.lsn
                    ),
                }
            }
        }
        Ok(())
    }

    /// Atomically materialize one transaction file. Returns false when the
    /// file already exists from an earlier pass.
    fn write_transaction(&self, header: &TxnHeader, statements: &[String]) -> Result<bool> {
        let final_path = self
            .sql_dir
            .join(format!("{}.sql", header.commit_lsn.filename()));
        if final_path.exists() {
            return Ok(false);
        }

        let mut content = header.render();
        content.push('\n');
        for statement in statements {
            content.push_str(statement);
            content.push_str(";\n");
        }

        let partial = final_path.with_extension("sql.partial");
        fs::write(&partial, &content)
            .with_context(|| format!("failed to write {}", partial.display()))?;
        fs::rename(&partial, &final_path)
            .with_context(|| format!("failed to finalize {}", final_path.display()))?;
        tracing::debug!(
            "transformed transaction {} ({} statements)",
            header.commit_lsn,
            statements.len()
        );
        Ok(true)
    }
}

/// Transformed transaction files in commit-LSN order.
pub fn list_transactions(sql_dir: &Path) -> Result<Vec<(Lsn, PathBuf)>> {
    let mut files = Vec::new();
    if !sql_dir.exists() {
        return Ok(files);
    }
    for entry in fs::read_dir(sql_dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(stem) = name.strip_suffix(".sql") else {
            continue;
        };
        if let Ok(lsn) = Lsn::from_filename(stem) {
            files.push((lsn, path));
        }
    }
    files.sort_by_key(|(lsn, _)| *lsn);
    Ok(files)
}

/// Render one data change as a single idempotent SQL statement.
fn render_change(change: &Change, identities: &IdentityMap) -> Result<String> {
    match change {
        Change::Insert {
            relation,
            new,
            identity,
        } => render_insert(relation, new, identity, identities),
        Change::Update {
            relation,
            key,
            new,
            identity,
        } => render_update(relation, key, new, identity, identities),
        Change::Delete { relation, key } => render_delete(relation, key),
        Change::Truncate { relations } => {
            let names: Vec<String> = relations.iter().map(Relation::qualified).collect();
            Ok(format!("TRUNCATE ONLY {}", names.join(", ")))
        }
        other => bail!("not a data change: {other:?}"),
    }
}

fn identity_for<'a>(
    relation: &Relation,
    from_record: &'a [String],
    identities: &'a IdentityMap,
) -> &'a [String] {
    if !from_record.is_empty() {
        return from_record;
    }
    identities
        .get(&(relation.schema.clone(), relation.table.clone()))
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn render_insert(
    relation: &Relation,
    new: &[Column],
    identity: &[String],
    identities: &IdentityMap,
) -> Result<String> {
    // TOASTed columns absent from the decoded insert take their defaults;
    // this only occurs on replays of rows that already exist, where the
    // conflict arm wins anyway.
    let present: Vec<&Column> = new
        .iter()
        .filter(|c| c.value != TupleValue::Unchanged)
        .collect();
    if present.is_empty() {
        bail!("INSERT into {} carries no columns", relation.qualified());
    }

    let names: Vec<String> = present
        .iter()
        .map(|c| crate::pgsql::quote_ident(&c.name))
        .collect();
    let values: Vec<String> = present.iter().map(|c| render_value(c)).collect();

    let key = identity_for(relation, identity, identities);
    let conflict = if key.is_empty() {
        // No replica identity known: the conflict target cannot be named,
        // so replays fall back to ignoring duplicate rows.
        "ON CONFLICT DO NOTHING".to_string()
    } else {
        let key_idents: Vec<String> = key
            .iter()
            .map(|name| crate::pgsql::quote_ident(name))
            .collect();
        let updates: Vec<String> = present
            .iter()
            .filter(|c| !key.contains(&c.name))
            .map(|c| {
                let ident = crate::pgsql::quote_ident(&c.name);
                format!("{ident} = EXCLUDED.{ident}")
            })
            .collect();
        if updates.is_empty() {
            format!("ON CONFLICT ({}) DO NOTHING", key_idents.join(", "))
        } else {
            format!(
                "ON CONFLICT ({}) DO UPDATE SET {}",
                key_idents.join(", "),
                updates.join(", ")
            )
        }
    };

    Ok(format!(
        "INSERT INTO {} ({}) VALUES ({}) {}",
        relation.qualified(),
        names.join(", "),
        values.join(", "),
        conflict
    ))
}

fn render_update(
    relation: &Relation,
    key: &[Column],
    new: &[Column],
    identity: &[String],
    identities: &IdentityMap,
) -> Result<String> {
    let assignments: Vec<String> = new
        .iter()
        .filter(|c| c.value != TupleValue::Unchanged)
        .map(|c| format!("{} = {}", crate::pgsql::quote_ident(&c.name), render_value(c)))
        .collect();
    if assignments.is_empty() {
        bail!("UPDATE on {} changes no columns", relation.qualified());
    }

    let key_columns: Vec<&Column> = if !key.is_empty() {
        key.iter().collect()
    } else {
        // Identity unchanged: its values ride along in the new tuple.
        let names = identity_for(relation, identity, identities);
        if names.is_empty() {
            bail!(
                "cannot key UPDATE on {}: no replica identity",
                relation.qualified()
            );
        }
        let picked: Vec<&Column> = new.iter().filter(|c| names.contains(&c.name)).collect();
        if picked.len() != names.len() {
            bail!(
                "UPDATE on {} is missing replica identity columns",
                relation.qualified()
            );
        }
        picked
    };

    Ok(format!(
        "UPDATE {} SET {} WHERE {}",
        relation.qualified(),
        assignments.join(", "),
        where_clause(&key_columns)
    ))
}

fn render_delete(relation: &Relation, key: &[Column]) -> Result<String> {
    if key.is_empty() {
        bail!(
            "cannot key DELETE on {}: no replica identity",
            relation.qualified()
        );
    }
    let key_columns: Vec<&Column> = key.iter().collect();
    Ok(format!(
        "DELETE FROM {} WHERE {}",
        relation.qualified(),
        where_clause(&key_columns)
    ))
}

fn where_clause(columns: &[&Column]) -> String {
    let predicates: Vec<String> = columns
        .iter()
        .map(|c| {
            let ident = crate::pgsql::quote_ident(&c.name);
            match &c.value {
                TupleValue::Null => format!("{ident} IS NULL"),
                _ => format!("{ident} = {}", render_value(c)),
            }
        })
        .collect();
    predicates.join(" AND ")
}

/// Render a column value as a literal cast back through its declared
/// type: `'123'::integer`, `'{a,b}'::text[]`. The text round-trip is how
/// the plugins serialized the value in the first place.
fn render_value(column: &Column) -> String {
    match &column.value {
        TupleValue::Null => "NULL".to_string(),
        TupleValue::Unchanged => "NULL".to_string(),
        TupleValue::Text(text) => {
            let literal = crate::pgsql::quote_literal(text);
            if is_safe_type_name(&column.type_name) {
                format!("{literal}::{}", column.type_name)
            } else {
                literal
            }
        }
    }
}

/// Type names come from decoded output and are interpolated into SQL;
/// anything outside the catalog's usual alphabet loses its cast rather
/// than risking injection.
fn is_safe_type_name(type_name: &str) -> bool {
    !type_name.is_empty()
        && type_name.chars().all(|c| {
            c.is_ascii_alphanumeric() || matches!(c, '_' | ' ' | '(' | ')' | ',' | '[' | ']' | '.')
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdc::segment::SegmentWriter;

    fn column(name: &str, type_name: &str, value: Option<&str>) -> Column {
        Column {
            name: name.to_string(),
            type_name: type_name.to_string(),
            value: match value {
                Some(v) => TupleValue::Text(v.to_string()),
                None => TupleValue::Null,
            },
        }
    }

    #[test]
    fn test_insert_renders_as_upsert() {
        let sql = render_change(
            &Change::Insert {
                relation: Relation::new("public", "users"),
                new: vec![
                    column("id", "integer", Some("1")),
                    column("name", "text", Some("Alice")),
                ],
                identity: vec!["id".to_string()],
            },
            &IdentityMap::new(),
        )
        .unwrap();
        assert_eq!(
            sql,
            "INSERT INTO public.users (id, name) VALUES ('1'::integer, 'Alice'::text) \
             ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name"
        );
    }

    #[test]
    fn test_insert_without_identity_does_nothing_on_conflict() {
        let sql = render_change(
            &Change::Insert {
                relation: Relation::new("public", "log"),
                new: vec![column("line", "text", Some("x"))],
                identity: vec![],
            },
            &IdentityMap::new(),
        )
        .unwrap();
        assert!(sql.ends_with("ON CONFLICT DO NOTHING"));
    }

    #[test]
    fn test_insert_identity_falls_back_to_plan() {
        let mut identities = IdentityMap::new();
        identities.insert(
            ("public".to_string(), "users".to_string()),
            vec!["id".to_string()],
        );
        let sql = render_change(
            &Change::Insert {
                relation: Relation::new("public", "users"),
                new: vec![
                    column("id", "integer", Some("1")),
                    column("name", "text", Some("A")),
                ],
                identity: vec![],
            },
            &identities,
        )
        .unwrap();
        assert!(sql.contains("ON CONFLICT (id) DO UPDATE"));
    }

    #[test]
    fn test_update_keys_on_old_key() {
        let sql = render_change(
            &Change::Update {
                relation: Relation::new("public", "users"),
                key: vec![column("id", "integer", Some("1"))],
                new: vec![
                    column("id", "integer", Some("2")),
                    column("name", "text", Some("Bob")),
                ],
                identity: vec![],
            },
            &IdentityMap::new(),
        )
        .unwrap();
        assert_eq!(
            sql,
            "UPDATE public.users SET id = '2'::integer, name = 'Bob'::text \
             WHERE id = '1'::integer"
        );
    }

    #[test]
    fn test_update_without_old_key_uses_identity_from_new_tuple() {
        let sql = render_change(
            &Change::Update {
                relation: Relation::new("public", "users"),
                key: vec![],
                new: vec![
                    column("id", "integer", Some("1")),
                    column("name", "text", Some("Bob")),
                ],
                identity: vec!["id".to_string()],
            },
            &IdentityMap::new(),
        )
        .unwrap();
        assert!(sql.contains("WHERE id = '1'::integer"));
    }

    #[test]
    fn test_update_unchanged_toast_not_assigned() {
        let sql = render_change(
            &Change::Update {
                relation: Relation::new("public", "t"),
                key: vec![column("id", "integer", Some("1"))],
                new: vec![
                    column("id", "integer", Some("1")),
                    Column {
                        name: "big".into(),
                        type_name: "text".into(),
                        value: TupleValue::Unchanged,
                    },
                ],
                identity: vec![],
            },
            &IdentityMap::new(),
        )
        .unwrap();
        assert!(!sql.contains("big"));
    }

    #[test]
    fn test_update_without_any_identity_is_an_error() {
        render_change(
            &Change::Update {
                relation: Relation::new("public", "noid"),
                key: vec![],
                new: vec![column("v", "text", Some("x"))],
                identity: vec![],
            },
            &IdentityMap::new(),
        )
        .unwrap_err();
    }

    #[test]
    fn test_delete_null_key_uses_is_null() {
        let sql = render_change(
            &Change::Delete {
                relation: Relation::new("public", "t"),
                key: vec![column("id", "integer", Some("1")), column("k", "text", None)],
            },
            &IdentityMap::new(),
        )
        .unwrap();
        assert_eq!(
            sql,
            "DELETE FROM public.t WHERE id = '1'::integer AND k IS NULL"
        );
    }

    #[test]
    fn test_truncate_lists_relations() {
        let sql = render_change(
            &Change::Truncate {
                relations: vec![
                    Relation::new("public", "a"),
                    Relation::new("public", "b"),
                ],
            },
            &IdentityMap::new(),
        )
        .unwrap();
        assert_eq!(sql, "TRUNCATE ONLY public.a, public.b");
    }

    #[test]
    fn test_hostile_type_name_loses_cast() {
        let sql = render_change(
            &Change::Insert {
                relation: Relation::new("public", "t"),
                new: vec![column("v", "text; DROP TABLE x--", Some("boom"))],
                identity: vec![],
            },
            &IdentityMap::new(),
        )
        .unwrap();
        assert!(!sql.contains("DROP TABLE"));
        assert!(sql.contains("'boom'"));
    }

    #[test]
    fn test_header_round_trip() {
        let header = TxnHeader {
            commit_lsn: Lsn(0x2000),
            first_lsn: Lsn(0x1000),
            xid: Some(734),
            timestamp: Some("2026-01-10 11:00:00+00".into()),
        };
        let line = header.render();
        assert!(line.starts_with("-- {"));
        assert_eq!(TxnHeader::parse(&line).unwrap(), header);
        TxnHeader::parse("INSERT INTO x").unwrap_err();
    }

    fn seg_record(lsn: u64, json: &str) -> SegmentRecord {
        SegmentRecord {
            lsn: Lsn(lsn),
            data: json.to_string(),
        }
    }

    #[test]
    fn test_transform_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SegmentWriter::open(dir.path(), 1 << 20).unwrap();
        writer
            .append(&seg_record(0x1000, r#"{"action":"B","xid":7}"#))
            .unwrap();
        writer
            .append(&seg_record(
                0x1100,
                r#"{"action":"I","schema":"public","table":"a",
                   "columns":[{"name":"id","type":"integer","value":101}],
                   "pk":[{"name":"id","type":"integer"}]}"#,
            ))
            .unwrap();
        writer
            .append(&seg_record(0x1200, r#"{"action":"C","xid":7}"#))
            .unwrap();
        writer.rotate().unwrap();

        let mut transformer =
            Transformer::new(dir.path(), Plugin::Wal2json, IdentityMap::new()).unwrap();
        let report = transformer.process_available(dir.path()).unwrap();
        assert_eq!(report.transactions_written, 1);
        assert_eq!(report.last_commit_lsn, Lsn(0x1200));

        let files = list_transactions(transformer.sql_dir()).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].0, Lsn(0x1200));

        let content = fs::read_to_string(&files[0].1).unwrap();
        let mut lines = content.lines();
        let header = TxnHeader::parse(lines.next().unwrap()).unwrap();
        assert_eq!(header.first_lsn, Lsn(0x1000));
        assert_eq!(header.commit_lsn, Lsn(0x1200));
        assert_eq!(header.xid, Some(7));
        assert!(lines.next().unwrap().starts_with("INSERT INTO public.a"));

        // Re-running is a no-op: the commit file is the sentinel.
        let report = transformer.process_available(dir.path()).unwrap();
        assert_eq!(report.transactions_written, 0);
    }

    #[test]
    fn test_transaction_spanning_segments() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SegmentWriter::open(dir.path(), 1 << 20).unwrap();
        writer
            .append(&seg_record(0x1000, r#"{"action":"B","xid":8}"#))
            .unwrap();
        writer
            .append(&seg_record(
                0x1100,
                r#"{"action":"D","schema":"public","table":"a",
                   "identity":[{"name":"id","type":"integer","value":5}]}"#,
            ))
            .unwrap();
        writer.rotate().unwrap();

        let mut transformer =
            Transformer::new(dir.path(), Plugin::Wal2json, IdentityMap::new()).unwrap();
        // First half: transaction still open, nothing written.
        let report = transformer.process_available(dir.path()).unwrap();
        assert_eq!(report.transactions_written, 0);

        let mut writer = SegmentWriter::open(dir.path(), 1 << 20).unwrap();
        writer
            .append(&seg_record(0x2000, r#"{"action":"C","xid":8}"#))
            .unwrap();
        writer.rotate().unwrap();

        let report = transformer.process_available(dir.path()).unwrap();
        assert_eq!(report.transactions_written, 1);
        let files = list_transactions(transformer.sql_dir()).unwrap();
        assert_eq!(files[0].0, Lsn(0x2000));
    }

    #[test]
    fn test_empty_transaction_still_materializes() {
        // Keepalive-only traffic must still advance the apply cursor.
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SegmentWriter::open(dir.path(), 1 << 20).unwrap();
        writer
            .append(&seg_record(0x1000, r#"{"action":"B","xid":9}"#))
            .unwrap();
        writer
            .append(&seg_record(0x1100, r#"{"action":"C","xid":9}"#))
            .unwrap();
        writer.rotate().unwrap();

        let mut transformer =
            Transformer::new(dir.path(), Plugin::Wal2json, IdentityMap::new()).unwrap();
        let report = transformer.process_available(dir.path()).unwrap();
        assert_eq!(report.transactions_written, 1);
    }
}
