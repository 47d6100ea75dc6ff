//! Shared PostgreSQL connection and SQL helpers.

use anyhow::{Context, Result};
use tokio_postgres::{Client, NoTls};

use crate::lsn::Lsn;

/// Connect and drive the connection on a background task. The driver task
/// owns the socket; dropping the client tears it down.
pub async fn connect(uri: &str) -> Result<Client> {
    let (client, connection) = tokio_postgres::connect(uri, NoTls)
        .await
        .context("failed to connect to PostgreSQL")?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::debug!("connection closed: {e}");
        }
    });

    Ok(client)
}

/// Connect and attach to an exported snapshot inside a REPEATABLE READ
/// read-only transaction. Every bulk-copy worker reads through one of
/// these, so all workers observe the same source state.
pub async fn connect_at_snapshot(uri: &str, snapshot: &str) -> Result<Client> {
    let client = connect(uri).await?;
    client
        .batch_execute("BEGIN ISOLATION LEVEL REPEATABLE READ READ ONLY")
        .await
        .context("failed to begin snapshot transaction")?;
    client
        .batch_execute(&format!(
            "SET TRANSACTION SNAPSHOT {}",
            quote_literal(snapshot)
        ))
        .await
        .with_context(|| format!("failed to attach to snapshot {snapshot}"))?;
    Ok(client)
}

/// Export a snapshot from an open REPEATABLE READ transaction. The
/// exporting connection must stay alive for as long as the snapshot is
/// imported elsewhere.
pub async fn export_snapshot(client: &Client) -> Result<String> {
    client
        .batch_execute("BEGIN ISOLATION LEVEL REPEATABLE READ READ ONLY")
        .await?;
    let row = client
        .query_one("SELECT pg_export_snapshot()", &[])
        .await
        .context("failed to export snapshot")?;
    Ok(row.get(0))
}

/// Source server identity, used to pin a catalog to one server.
pub struct ServerIdentity {
    pub system_identifier: String,
    pub timeline_id: u32,
    pub current_lsn: Lsn,
}

pub async fn server_identity(client: &Client) -> Result<ServerIdentity> {
    let row = client
        .query_one(
            "SELECT system_identifier::text, timeline_id, pg_current_wal_lsn()::text
             FROM pg_control_system(), pg_control_checkpoint()",
            &[],
        )
        .await
        .context("failed to read server identity")?;
    let lsn: String = row.get(2);
    Ok(ServerIdentity {
        system_identifier: row.get(0),
        timeline_id: row.get::<_, i32>(1) as u32,
        current_lsn: lsn.parse().context("bad pg_current_wal_lsn")?,
    })
}

pub async fn current_wal_lsn(client: &Client) -> Result<Lsn> {
    let row = client
        .query_one("SELECT pg_current_wal_lsn()::text", &[])
        .await?;
    let lsn: String = row.get(0);
    Ok(lsn.parse()?)
}

/// Quote an identifier the way the server would: double quotes when the
/// name is not a safe lower-case identifier, embedded quotes doubled.
pub fn quote_ident(name: &str) -> String {
    let safe = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && !name.chars().next().unwrap().is_ascii_digit();
    if safe {
        name.to_string()
    } else {
        format!("\"{}\"", name.replace('"', "\"\""))
    }
}

/// Quote a string literal, doubling embedded quotes. Backslashes force the
/// E'' form so the literal survives standard_conforming_strings settings.
pub fn quote_literal(value: &str) -> String {
    let escaped = value.replace('\'', "''");
    if escaped.contains('\\') {
        format!("E'{}'", escaped.replace('\\', "\\\\"))
    } else {
        format!("'{escaped}'")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("users"), "users");
        assert_eq!(quote_ident("user_2"), "user_2");
        assert_eq!(quote_ident("Users"), "\"Users\"");
        assert_eq!(quote_ident("user table"), "\"user table\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(quote_ident("2fast"), "\"2fast\"");
    }

    #[test]
    fn test_quote_literal() {
        assert_eq!(quote_literal("plain"), "'plain'");
        assert_eq!(quote_literal("O'Brien"), "'O''Brien'");
        assert_eq!(quote_literal("a\\b"), "E'a\\\\b'");
        assert_eq!(quote_literal(""), "''");
    }
}
