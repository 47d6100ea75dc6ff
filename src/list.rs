//! The `list` command family: quick inventories of the source database
//! and of a run's progress.

use anyhow::Result;

use crate::catalog::Catalog;
use crate::filters::Filters;

pub async fn list_tables(source_uri: &str, filters: &Filters) -> Result<String> {
    let client = crate::pgsql::connect(source_uri).await?;
    let rows = client
        .query(
            "SELECT n.nspname, c.relname,
                    pg_size_pretty(pg_table_size(c.oid)), c.reltuples::bigint
             FROM pg_class c
             JOIN pg_namespace n ON n.oid = c.relnamespace
             WHERE c.relkind = 'r' AND NOT c.relispartition
             ORDER BY pg_table_size(c.oid) DESC, n.nspname, c.relname",
            &[],
        )
        .await?;

    let mut out = format!(
        "{:<48} {:>12} {:>14}\n",
        "table", "size", "row estimate"
    );
    for row in rows {
        let schema: String = row.get(0);
        let name: String = row.get(1);
        if !filters.include_table(&schema, &name) {
            continue;
        }
        out.push_str(&format!(
            "{:<48} {:>12} {:>14}\n",
            format!("{schema}.{name}"),
            row.get::<_, String>(2),
            row.get::<_, i64>(3).max(0)
        ));
    }
    Ok(out)
}

pub async fn list_indexes(source_uri: &str, filters: &Filters) -> Result<String> {
    let client = crate::pgsql::connect(source_uri).await?;
    let rows = client
        .query(
            "SELECT n.nspname, ic.relname, tc.relname, x.indisunique
             FROM pg_index x
             JOIN pg_class ic ON ic.oid = x.indexrelid
             JOIN pg_class tc ON tc.oid = x.indrelid
             JOIN pg_namespace n ON n.oid = ic.relnamespace
             ORDER BY n.nspname, tc.relname, ic.relname",
            &[],
        )
        .await?;

    let mut out = format!("{:<48} {:<32} {:>8}\n", "index", "table", "unique");
    for row in rows {
        let schema: String = row.get(0);
        let index: String = row.get(1);
        let table: String = row.get(2);
        if !filters.include_schema(&schema) || !filters.include_index(&schema, &index) {
            continue;
        }
        out.push_str(&format!(
            "{:<48} {:<32} {:>8}\n",
            format!("{schema}.{index}"),
            table,
            if row.get::<_, bool>(3) { "yes" } else { "no" }
        ));
    }
    Ok(out)
}

pub async fn list_schemas(source_uri: &str, filters: &Filters) -> Result<String> {
    let client = crate::pgsql::connect(source_uri).await?;
    let rows = client
        .query(
            "SELECT nspname, pg_get_userbyid(nspowner) FROM pg_namespace ORDER BY nspname",
            &[],
        )
        .await?;
    let mut out = format!("{:<32} {:<24}\n", "schema", "owner");
    for row in rows {
        let name: String = row.get(0);
        if !filters.include_schema(&name) {
            continue;
        }
        out.push_str(&format!(
            "{:<32} {:<24}\n",
            name,
            row.get::<_, String>(1)
        ));
    }
    Ok(out)
}

pub async fn list_extensions(source_uri: &str) -> Result<String> {
    let client = crate::pgsql::connect(source_uri).await?;
    let rows = client
        .query(
            "SELECT e.extname, e.extversion, n.nspname
             FROM pg_extension e
             JOIN pg_namespace n ON n.oid = e.extnamespace
             ORDER BY e.extname",
            &[],
        )
        .await?;
    let mut out = format!("{:<32} {:<12} {:<24}\n", "extension", "version", "schema");
    for row in rows {
        out.push_str(&format!(
            "{:<32} {:<12} {:<24}\n",
            row.get::<_, String>(0),
            row.get::<_, String>(1),
            row.get::<_, String>(2)
        ));
    }
    Ok(out)
}

pub async fn list_collations(source_uri: &str) -> Result<String> {
    let client = crate::pgsql::connect(source_uri).await?;
    let rows = client
        .query(
            "SELECT n.nspname, c.collname, c.collcollate
             FROM pg_collation c
             JOIN pg_namespace n ON n.oid = c.collnamespace
             WHERE n.nspname NOT IN ('pg_catalog', 'information_schema')
             ORDER BY n.nspname, c.collname",
            &[],
        )
        .await?;
    let mut out = format!("{:<48} {:<24}\n", "collation", "collate");
    for row in rows {
        let schema: String = row.get(0);
        let name: String = row.get(1);
        let collate: Option<String> = row.get(2);
        out.push_str(&format!(
            "{:<48} {:<24}\n",
            format!("{schema}.{name}"),
            collate.unwrap_or_default()
        ));
    }
    Ok(out)
}

/// Current per-kind progress from the catalog, the live view behind
/// `list progress`.
pub fn list_progress(catalog: &Catalog) -> Result<String> {
    let summary = catalog.summary()?;
    let cursor = catalog.cursor_read()?;
    let mut out = summary.render();
    if cursor.applied_commit_lsn.is_valid() || cursor.written_lsn.is_valid() {
        out.push_str(&format!(
            "\nstream: written {} flushed {} applied {}\n",
            cursor.written_lsn, cursor.flushed_lsn, cursor.applied_commit_lsn
        ));
    }
    Ok(out)
}
