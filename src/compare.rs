//! `compare schema` and `compare data`: sanity checks between source and
//! target after (or during) a migration.

use std::collections::BTreeSet;

use anyhow::Result;
use tokio_postgres::Client;

use crate::filters::Filters;

/// Object inventories compared by identity, not definition: a migration
/// preserves names, and missing names are what operators care about
/// first.
#[derive(Debug, Default, PartialEq)]
pub struct SchemaDiff {
    pub missing_tables: Vec<String>,
    pub extra_tables: Vec<String>,
    pub missing_indexes: Vec<String>,
    pub missing_sequences: Vec<String>,
}

impl SchemaDiff {
    pub fn is_empty(&self) -> bool {
        self.missing_tables.is_empty()
            && self.extra_tables.is_empty()
            && self.missing_indexes.is_empty()
            && self.missing_sequences.is_empty()
    }

    pub fn render(&self) -> String {
        if self.is_empty() {
            return "schemas match".to_string();
        }
        let mut out = String::new();
        for (label, names) in [
            ("missing table", &self.missing_tables),
            ("extra table", &self.extra_tables),
            ("missing index", &self.missing_indexes),
            ("missing sequence", &self.missing_sequences),
        ] {
            for name in names {
                out.push_str(&format!("{label}: {name}\n"));
            }
        }
        out
    }
}

pub async fn compare_schema(
    source_uri: &str,
    target_uri: &str,
    filters: &Filters,
) -> Result<SchemaDiff> {
    let source = crate::pgsql::connect(source_uri).await?;
    let target = crate::pgsql::connect(target_uri).await?;

    let source_tables = table_names(&source, filters).await?;
    let target_tables = table_names(&target, filters).await?;
    let source_indexes = index_names(&source, filters).await?;
    let target_indexes = index_names(&target, filters).await?;
    let source_sequences = sequence_names(&source, filters).await?;
    let target_sequences = sequence_names(&target, filters).await?;

    Ok(SchemaDiff {
        missing_tables: source_tables.difference(&target_tables).cloned().collect(),
        extra_tables: target_tables.difference(&source_tables).cloned().collect(),
        missing_indexes: source_indexes
            .difference(&target_indexes)
            .cloned()
            .collect(),
        missing_sequences: source_sequences
            .difference(&target_sequences)
            .cloned()
            .collect(),
    })
}

#[derive(Debug)]
pub struct TableComparison {
    pub table: String,
    pub source_rows: i64,
    pub target_rows: i64,
    pub source_checksum: Option<String>,
    pub target_checksum: Option<String>,
}

impl TableComparison {
    pub fn matches(&self) -> bool {
        self.source_rows == self.target_rows && self.source_checksum == self.target_checksum
    }
}

/// Compare row counts (and optionally whole-table checksums) for every
/// table both sides have.
pub async fn compare_data(
    source_uri: &str,
    target_uri: &str,
    filters: &Filters,
    checksum: bool,
) -> Result<Vec<TableComparison>> {
    let source = crate::pgsql::connect(source_uri).await?;
    let target = crate::pgsql::connect(target_uri).await?;

    let source_tables = table_names(&source, filters).await?;
    let target_tables = table_names(&target, filters).await?;
    let common: BTreeSet<_> = source_tables.intersection(&target_tables).collect();

    let mut report = Vec::new();
    for table in common {
        let (schema, name) = table.split_once('.').unwrap_or(("public", table.as_str()));
        let qualified = format!(
            "{}.{}",
            crate::pgsql::quote_ident(schema),
            crate::pgsql::quote_ident(name)
        );

        let source_rows = row_count(&source, &qualified).await?;
        let target_rows = row_count(&target, &qualified).await?;
        let (source_checksum, target_checksum) = if checksum {
            (
                Some(table_checksum(&source, &qualified).await?),
                Some(table_checksum(&target, &qualified).await?),
            )
        } else {
            (None, None)
        };

        report.push(TableComparison {
            table: table.clone(),
            source_rows,
            target_rows,
            source_checksum,
            target_checksum,
        });
    }
    Ok(report)
}

pub fn render_data_report(report: &[TableComparison]) -> String {
    let mut out = format!(
        "{:<40} {:>12} {:>12} {:>8}\n",
        "table", "source", "target", "match"
    );
    for row in report {
        out.push_str(&format!(
            "{:<40} {:>12} {:>12} {:>8}\n",
            row.table,
            row.source_rows,
            row.target_rows,
            if row.matches() { "ok" } else { "DIFFER" }
        ));
    }
    out
}

async fn table_names(client: &Client, filters: &Filters) -> Result<BTreeSet<String>> {
    let rows = client
        .query(
            "SELECT n.nspname, c.relname FROM pg_class c
             JOIN pg_namespace n ON n.oid = c.relnamespace
             WHERE c.relkind = 'r'",
            &[],
        )
        .await?;
    Ok(rows
        .iter()
        .map(|row| (row.get::<_, String>(0), row.get::<_, String>(1)))
        .filter(|(schema, table)| filters.include_table(schema, table))
        .map(|(schema, table)| format!("{schema}.{table}"))
        .collect())
}

async fn index_names(client: &Client, filters: &Filters) -> Result<BTreeSet<String>> {
    let rows = client
        .query(
            "SELECT n.nspname, c.relname FROM pg_class c
             JOIN pg_namespace n ON n.oid = c.relnamespace
             WHERE c.relkind = 'i'",
            &[],
        )
        .await?;
    Ok(rows
        .iter()
        .map(|row| (row.get::<_, String>(0), row.get::<_, String>(1)))
        .filter(|(schema, index)| {
            filters.include_schema(schema) && filters.include_index(schema, index)
        })
        .map(|(schema, index)| format!("{schema}.{index}"))
        .collect())
}

async fn sequence_names(client: &Client, filters: &Filters) -> Result<BTreeSet<String>> {
    let rows = client
        .query(
            "SELECT n.nspname, c.relname FROM pg_class c
             JOIN pg_namespace n ON n.oid = c.relnamespace
             WHERE c.relkind = 'S'",
            &[],
        )
        .await?;
    Ok(rows
        .iter()
        .map(|row| (row.get::<_, String>(0), row.get::<_, String>(1)))
        .filter(|(schema, _)| filters.include_schema(schema))
        .map(|(schema, seq)| format!("{schema}.{seq}"))
        .collect())
}

async fn row_count(client: &Client, qualified: &str) -> Result<i64> {
    let row = client
        .query_one(&format!("SELECT count(*) FROM {qualified}"), &[])
        .await?;
    Ok(row.get(0))
}

/// Order-independent whole-table digest: md5 of the sorted row texts.
/// Expensive by design; only `compare data --checksum` asks for it.
async fn table_checksum(client: &Client, qualified: &str) -> Result<String> {
    let row = client
        .query_one(
            &format!(
                "SELECT COALESCE(md5(string_agg(t::text, E'\\n' ORDER BY t::text)), '')
                 FROM {qualified} t"
            ),
            &[],
        )
        .await?;
    Ok(row.get(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_diff_render() {
        let diff = SchemaDiff {
            missing_tables: vec!["public.users".into()],
            ..Default::default()
        };
        assert!(!diff.is_empty());
        assert!(diff.render().contains("missing table: public.users"));
        assert_eq!(SchemaDiff::default().render(), "schemas match");
    }

    #[test]
    fn test_data_report_flags_differences() {
        let report = vec![
            TableComparison {
                table: "public.a".into(),
                source_rows: 10,
                target_rows: 10,
                source_checksum: None,
                target_checksum: None,
            },
            TableComparison {
                table: "public.b".into(),
                source_rows: 10,
                target_rows: 9,
                source_checksum: None,
                target_checksum: None,
            },
        ];
        let rendered = render_data_report(&report);
        assert!(rendered.contains("ok"));
        assert!(rendered.contains("DIFFER"));
    }
}
