//! Object filtering for clone runs.
//!
//! The `--filters` manifest is a YAML file with up to seven sections, each
//! listing fully qualified names:
//!
//! ```yaml
//! include-only-schema: [app]
//! exclude-table: [app.audit_log]
//! exclude-index: [app.users_email_key]
//! exclude-table-data: [app.sessions]
//! exclude-extension: [postgis]
//! ```
//!
//! Filters decide which schemas and relations enter the Work Plan at all,
//! which indexes are skipped, and which tables keep their structure but not
//! their rows.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Filters {
    #[serde(rename = "include-only-schema", default)]
    pub include_only_schema: BTreeSet<String>,
    #[serde(rename = "exclude-schema", default)]
    pub exclude_schema: BTreeSet<String>,
    #[serde(rename = "include-only-table", default)]
    pub include_only_table: BTreeSet<String>,
    #[serde(rename = "exclude-table", default)]
    pub exclude_table: BTreeSet<String>,
    #[serde(rename = "exclude-index", default)]
    pub exclude_index: BTreeSet<String>,
    #[serde(rename = "exclude-table-data", default)]
    pub exclude_table_data: BTreeSet<String>,
    #[serde(rename = "exclude-extension", default)]
    pub exclude_extension: BTreeSet<String>,
}

impl Filters {
    pub fn load(path: &Path) -> Result<Filters> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read filters file {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse filters file {}", path.display()))
    }

    /// System schemas are never cloned, independent of the manifest.
    fn is_system_schema(schema: &str) -> bool {
        schema == "information_schema" || schema.starts_with("pg_")
    }

    pub fn include_schema(&self, schema: &str) -> bool {
        if Self::is_system_schema(schema) || self.exclude_schema.contains(schema) {
            return false;
        }
        if !self.include_only_schema.is_empty() {
            return self.include_only_schema.contains(schema);
        }
        true
    }

    /// Whether a table belongs in the Work Plan at all (structure + data).
    pub fn include_table(&self, schema: &str, table: &str) -> bool {
        if !self.include_schema(schema) {
            return false;
        }
        let qualified = format!("{schema}.{table}");
        if self.exclude_table.contains(&qualified) {
            return false;
        }
        if !self.include_only_table.is_empty() {
            return self.include_only_table.contains(&qualified);
        }
        true
    }

    /// Whether a table's rows are copied. A table excluded from data still
    /// gets its structure, indexes, and constraints.
    pub fn include_table_data(&self, schema: &str, table: &str) -> bool {
        self.include_table(schema, table)
            && !self.exclude_table_data.contains(&format!("{schema}.{table}"))
    }

    pub fn include_index(&self, schema: &str, index: &str) -> bool {
        !self.exclude_index.contains(&format!("{schema}.{index}"))
    }

    pub fn include_extension(&self, name: &str) -> bool {
        !self.exclude_extension.contains(name)
    }

    /// Stable digest of the manifest, stored in the catalog so a resumed
    /// run can detect that it is being driven by different filters.
    pub fn fingerprint(&self) -> String {
        // BTreeSet iteration is sorted, so serialization is deterministic.
        serde_json::to_string(self).expect("filters serialize")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(yaml: &str) -> Filters {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_empty_filters_include_user_schemas_only() {
        let filters = Filters::default();
        assert!(filters.include_schema("public"));
        assert!(filters.include_table("public", "users"));
        assert!(!filters.include_schema("pg_catalog"));
        assert!(!filters.include_schema("pg_toast"));
        assert!(!filters.include_schema("information_schema"));
    }

    #[test]
    fn test_include_only_schema() {
        let filters = manifest("include-only-schema: [app]");
        assert!(filters.include_table("app", "users"));
        assert!(!filters.include_table("public", "users"));
    }

    #[test]
    fn test_exclude_wins_over_include() {
        let filters = manifest(
            "include-only-schema: [app]\n\
             exclude-schema: [app]",
        );
        assert!(!filters.include_schema("app"));
    }

    #[test]
    fn test_table_filters_are_qualified() {
        let filters = manifest("exclude-table: [app.audit_log]");
        assert!(!filters.include_table("app", "audit_log"));
        assert!(filters.include_table("public", "audit_log"));
    }

    #[test]
    fn test_exclude_table_data_keeps_structure() {
        let filters = manifest("exclude-table-data: [public.sessions]");
        assert!(filters.include_table("public", "sessions"));
        assert!(!filters.include_table_data("public", "sessions"));
        assert!(filters.include_table_data("public", "users"));
    }

    #[test]
    fn test_include_only_table() {
        let filters = manifest("include-only-table: [public.users, public.orders]");
        assert!(filters.include_table("public", "users"));
        assert!(!filters.include_table("public", "sessions"));
    }

    #[test]
    fn test_fingerprint_is_deterministic() {
        let a = manifest("exclude-table: [b.t, a.t]");
        let b = manifest("exclude-table: [a.t, b.t]");
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), Filters::default().fingerprint());
    }

    #[test]
    fn test_unknown_section_rejected() {
        serde_yaml::from_str::<Filters>("exclude-tables: [a.t]").unwrap_err();
    }
}
