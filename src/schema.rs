//! The Schema Bridge: drive the vendor pg_dump/pg_restore binaries to move
//! schema DDL, with a filtered object list so we only restore what the
//! Work Plan wants and never what the supervisors build themselves.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::process::Command;

use crate::config::RunConfig;
use crate::error::Error;
use crate::filters::Filters;
use crate::plan::WorkPlan;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    PreData,
    PostData,
}

impl Section {
    pub fn as_str(&self) -> &'static str {
        match self {
            Section::PreData => "pre-data",
            Section::PostData => "post-data",
        }
    }

    fn artifact(&self) -> &'static str {
        match self {
            Section::PreData => "pre.dump",
            Section::PostData => "post.dump",
        }
    }
}

pub struct SchemaBridge {
    config: RunConfig,
    source: String,
    target: String,
}

impl SchemaBridge {
    pub fn new(config: RunConfig, source: String, target: String) -> SchemaBridge {
        SchemaBridge {
            config,
            source,
            target,
        }
    }

    fn artifact_path(&self, section: Section) -> PathBuf {
        self.config.schema_dir().join(section.artifact())
    }

    /// Dump one schema section from the source in custom format. When a
    /// snapshot name is given the dump runs under it, so DDL matches the
    /// data the copy workers will read.
    pub async fn dump(&self, section: Section, snapshot: Option<&str>) -> Result<PathBuf> {
        let path = self.artifact_path(section);
        std::fs::create_dir_all(self.config.schema_dir())?;

        let mut cmd = Command::new("pg_dump");
        cmd.arg("--format=custom")
            .arg(format!("--section={}", section.as_str()))
            .arg("--file")
            .arg(&path);
        if let Some(snapshot) = snapshot {
            cmd.arg(format!("--snapshot={snapshot}"));
        }
        cmd.arg("--dbname").arg(&self.source);

        run_tool(cmd, "pg_dump").await?;
        tracing::info!("dumped {} schema to {}", section.as_str(), path.display());
        Ok(path)
    }

    /// Restore one section into the target, filtered through an object
    /// list derived from the Work Plan.
    pub async fn restore(&self, section: Section, plan: &WorkPlan, filters: &Filters) -> Result<()> {
        let dump = self.artifact_path(section);

        // pg_restore -l gives us the archive's table of contents; we
        // comment out what we don't want and feed it back with -L.
        let mut list_cmd = Command::new("pg_restore");
        list_cmd.arg("--list").arg(&dump);
        let list = run_tool(list_cmd, "pg_restore").await?;

        let filtered = filter_restore_list(&list, plan, filters, &self.config);
        let list_path = self
            .config
            .schema_dir()
            .join(format!("{}.list", section.as_str()));
        std::fs::write(&list_path, &filtered)
            .with_context(|| format!("failed to write {}", list_path.display()))?;

        let mut cmd = Command::new("pg_restore");
        cmd.arg("--use-list")
            .arg(&list_path)
            .arg(format!("--jobs={}", self.config.restore_jobs))
            .arg(format!("--section={}", section.as_str()));
        if self.config.no_owner {
            cmd.arg("--no-owner");
        }
        if self.config.no_acl {
            cmd.arg("--no-acl");
        }
        if self.config.drop_if_exists && section == Section::PreData {
            cmd.arg("--clean").arg("--if-exists");
        }
        cmd.arg("--dbname").arg(&self.target).arg(&dump);

        run_tool(cmd, "pg_restore").await?;
        tracing::info!("restored {} schema into target", section.as_str());
        Ok(())
    }
}

/// Run an external tool, surfacing its stderr verbatim on failure.
async fn run_tool(mut cmd: Command, tool: &str) -> Result<String> {
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    tracing::debug!("running {cmd:?}");

    let output = cmd
        .output()
        .await
        .with_context(|| format!("failed to spawn {tool}; is it on PATH?"))?;

    if !output.status.success() {
        return Err(Error::Tool {
            tool: tool.to_string(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
        .into());
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Comment out unwanted entries in a `pg_restore --list` table of
/// contents: data entries (COPY moves the rows), everything the
/// supervisors build themselves (indexes, constraints, foreign keys), and
/// whatever the filters or skip policies exclude.
///
/// Entry lines look like:
///
/// ```text
/// 215; 1259 16392 TABLE public users postgres
/// 3504; 2606 16412 CONSTRAINT public users users_pkey postgres
/// ```
pub fn filter_restore_list(
    list: &str,
    plan: &WorkPlan,
    filters: &Filters,
    config: &RunConfig,
) -> String {
    let planned_indexes: BTreeSet<(&str, &str)> = plan
        .indexes
        .iter()
        .map(|i| (i.schema.as_str(), i.name.as_str()))
        .collect();
    let planned_constraints: BTreeSet<(&str, &str)> = plan
        .indexes
        .iter()
        .filter_map(|i| {
            i.constraint
                .as_ref()
                .map(|c| (i.schema.as_str(), c.name.as_str()))
        })
        .chain(
            plan.constraints
                .iter()
                .map(|c| (c.schema.as_str(), c.name.as_str())),
        )
        .collect();

    let mut out = String::with_capacity(list.len());
    for line in list.lines() {
        let keep = match parse_list_entry(line) {
            None => true,
            Some(entry) => keep_entry(
                &entry,
                filters,
                config,
                &planned_indexes,
                &planned_constraints,
            ),
        };
        if !keep {
            out.push_str("; ");
        }
        out.push_str(line);
        out.push('\n');
    }
    out
}

struct ListEntry<'a> {
    kind: &'a str,
    /// Whatever follows the kind: usually `schema name [owner]`.
    rest: Vec<&'a str>,
}

/// Archive description keywords, longest first so multi-word kinds match
/// before their prefixes.
const KINDS: &[&str] = &[
    "DATABASE PROPERTIES",
    "MATERIALIZED VIEW DATA",
    "MATERIALIZED VIEW",
    "FK CONSTRAINT",
    "TABLE DATA",
    "SEQUENCE SET",
    "DEFAULT ACL",
    "CONSTRAINT",
    "EXTENSION",
    "COLLATION",
    "SEQUENCE",
    "FUNCTION",
    "DATABASE",
    "TRIGGER",
    "COMMENT",
    "SCHEMA",
    "DOMAIN",
    "INDEX",
    "TABLE",
    "VIEW",
    "RULE",
    "TYPE",
    "ACL",
];

fn parse_list_entry(line: &str) -> Option<ListEntry<'_>> {
    if line.starts_with(';') || line.trim().is_empty() {
        return None;
    }
    // "<dumpid>; <catalogid> <oid> <KIND> <schema> <name> <owner>"
    let (_dumpid, rest) = line.split_once(';')?;
    let mut fields = rest.trim().splitn(3, ' ');
    fields.next()?; // catalog id
    fields.next()?; // object oid
    let tail = fields.next()?.trim();

    let kind = KINDS.iter().find(|k| tail.starts_with(**k))?;
    let remainder = tail[kind.len()..].trim();
    Some(ListEntry {
        kind,
        rest: remainder.split_whitespace().collect(),
    })
}

fn keep_entry(
    entry: &ListEntry<'_>,
    filters: &Filters,
    config: &RunConfig,
    planned_indexes: &BTreeSet<(&str, &str)>,
    planned_constraints: &BTreeSet<(&str, &str)>,
) -> bool {
    let schema = entry.rest.first().copied().unwrap_or("");
    let name = entry.rest.get(1).copied().unwrap_or("");

    match entry.kind {
        // Data never travels through the archive; COPY moves it.
        "TABLE DATA" | "MATERIALIZED VIEW DATA" => false,
        "DATABASE PROPERTIES" | "DATABASE" => !config.skip_db_properties,
        // Extensions are listed as "- <name>"; schema holds the dash.
        "EXTENSION" => !config.skip_extensions && filters.include_extension(name),
        "COLLATION" => !config.skip_collations && filters.include_schema(schema),
        "SCHEMA" => filters.include_schema(name),
        "TABLE" | "VIEW" | "MATERIALIZED VIEW" | "SEQUENCE" | "SEQUENCE SET" => {
            filters.include_table(schema, name)
        }
        "INDEX" => {
            filters.include_index(schema, name) && !planned_indexes.contains(&(schema, name))
        }
        "CONSTRAINT" | "FK CONSTRAINT" => {
            // The list names constraints as "schema table constraint".
            let cname = entry.rest.get(2).copied().unwrap_or(name);
            !planned_constraints.contains(&(schema, cname))
        }
        "ACL" | "DEFAULT ACL" => !config.no_acl,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{BackingConstraint, BlobTask, ConstraintTask, IndexTask};
    use chrono::Utc;

    fn plan_with_index() -> WorkPlan {
        WorkPlan {
            system_identifier: "1".into(),
            timeline_id: 1,
            snapshot: "snap".into(),
            created_at: Utc::now(),
            filters_fingerprint: String::new(),
            tables: vec![],
            table_parts: vec![],
            indexes: vec![IndexTask {
                oid: 1,
                table_oid: 2,
                schema: "public".into(),
                name: "users_pkey".into(),
                definition: String::new(),
                constraint: Some(BackingConstraint {
                    name: "users_pkey".into(),
                    is_primary: true,
                }),
            }],
            constraints: vec![ConstraintTask {
                oid: 3,
                table_oid: 4,
                schema: "public".into(),
                table: "orders".into(),
                name: "orders_user_fk".into(),
                definition: String::new(),
                referenced_table_oid: 2,
            }],
            sequences: vec![],
            matviews: vec![],
            blobs: BlobTask::default(),
            extensions: vec![],
        }
    }

    const LIST: &str = "\
;
; Archive created at 2026-01-10 12:00:00 UTC
;
10; 2615 2200 SCHEMA - public postgres
20; 3079 16390 EXTENSION - pg_trgm
215; 1259 16392 TABLE public users postgres
216; 1259 16398 TABLE public audit_log postgres
230; 0 16392 TABLE DATA public users postgres
3504; 1259 16410 INDEX public users_email_idx postgres
3505; 1259 16411 INDEX public users_pkey postgres
3506; 2606 16412 CONSTRAINT public users users_pkey postgres
3507; 2606 16413 FK CONSTRAINT public orders orders_user_fk postgres
3600; 0 0 ACL public TABLE users postgres
";

    #[test]
    fn test_planned_objects_are_commented_out() {
        let plan = plan_with_index();
        let out = filter_restore_list(LIST, &plan, &Filters::default(), &RunConfig::default());

        // Our own index and constraints are dropped, foreign indexes kept.
        assert!(out.contains("; 3505; 1259 16411 INDEX public users_pkey"));
        assert!(out.contains("; 3506; 2606 16412 CONSTRAINT public users users_pkey"));
        assert!(out.contains("; 3507; 2606 16413 FK CONSTRAINT public orders orders_user_fk"));
        assert!(out.contains("\n3504; 1259 16410 INDEX public users_email_idx"));

        // Table data always filtered: the copy supervisor moves rows.
        assert!(out.contains("; 230; 0 16392 TABLE DATA"));

        // Tables and schema survive.
        assert!(out.contains("\n215; 1259 16392 TABLE public users"));
        assert!(out.contains("\n10; 2615 2200 SCHEMA - public"));
    }

    #[test]
    fn test_filters_drop_excluded_tables_and_extensions() {
        let filters: Filters =
            serde_yaml::from_str("exclude-table: [public.audit_log]\nexclude-extension: [pg_trgm]")
                .unwrap();
        let out = filter_restore_list(LIST, &plan_with_index(), &filters, &RunConfig::default());
        assert!(out.contains("; 216; 1259 16398 TABLE public audit_log"));
        assert!(out.contains("; 20; 3079 16390 EXTENSION - pg_trgm"));
    }

    #[test]
    fn test_no_acl_drops_acl_entries() {
        let config = RunConfig {
            no_acl: true,
            ..Default::default()
        };
        let out = filter_restore_list(LIST, &plan_with_index(), &Filters::default(), &config);
        assert!(out.contains("; 3600; 0 0 ACL"));
    }

    #[test]
    fn test_comment_lines_pass_through() {
        let out = filter_restore_list(
            LIST,
            &plan_with_index(),
            &Filters::default(),
            &RunConfig::default(),
        );
        assert!(out.contains("; Archive created at"));
    }

    #[test]
    fn test_multiword_kind_parsing() {
        let entry =
            parse_list_entry("3507; 2606 16413 FK CONSTRAINT public orders fk_x me").unwrap();
        assert_eq!(entry.kind, "FK CONSTRAINT");
        assert_eq!(entry.rest[0], "public");
        assert_eq!(entry.rest[2], "fk_x");

        let entry = parse_list_entry("230; 0 16392 TABLE DATA public users me").unwrap();
        assert_eq!(entry.kind, "TABLE DATA");

        assert!(parse_list_entry("; a comment").is_none());
        assert!(parse_list_entry("").is_none());
    }
}
