//! Minimal PostgreSQL streaming-replication wire client.
//!
//! `tokio-postgres` cannot open a connection with the `replication=database`
//! startup parameter, so the receiver speaks the wire protocol directly:
//! startup + cleartext/MD5 authentication, simple queries for
//! IDENTIFY_SYSTEM and slot management, then CopyBoth for the WAL stream.
//! Connection parameters are parsed with `tokio_postgres::Config`, so both
//! URI and key/value connection strings behave exactly like the rest of
//! the program.

use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use md5::{Digest, Md5};
use postgres_protocol::message::frontend;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::lsn::Lsn;

/// Microseconds between the Unix and PostgreSQL epochs (2000-01-01).
const PG_EPOCH_UNIX_SECS: u64 = 946_684_800;

pub struct ReplicationClient {
    stream: BufReader<TcpStream>,
}

#[derive(Debug, Clone)]
pub struct IdentifySystem {
    pub system_id: String,
    pub timeline: u32,
    pub xlog_pos: Lsn,
}

#[derive(Debug, Clone)]
pub struct CreatedSlot {
    pub slot_name: String,
    pub consistent_point: Lsn,
    /// Exported snapshot, valid while this connection stays idle in its
    /// creating transaction.
    pub snapshot_name: Option<String>,
    pub plugin: String,
}

impl ReplicationClient {
    /// Connect in replication mode using an ordinary connection string.
    pub async fn connect(uri: &str) -> Result<ReplicationClient> {
        let config =
            tokio_postgres::Config::from_str(uri).context("invalid connection string")?;

        let host = config
            .get_hosts()
            .iter()
            .find_map(|h| match h {
                tokio_postgres::config::Host::Tcp(host) => Some(host.clone()),
                #[allow(unreachable_patterns)]
                _ => None,
            })
            .context("replication requires a TCP host")?;
        let port = config.get_ports().first().copied().unwrap_or(5432);
        let user = config.get_user().context("connection string has no user")?;
        let database = config.get_dbname().unwrap_or(user);
        let password = config
            .get_password()
            .map(|p| String::from_utf8_lossy(p).into_owned());

        tracing::debug!("replication connect to {host}:{port} as {user}");
        let stream = TcpStream::connect((host.as_str(), port))
            .await
            .with_context(|| format!("failed to connect to {host}:{port}"))?;
        let mut stream = BufReader::new(stream);

        let params = vec![
            ("user", user),
            ("database", database),
            ("replication", "database"),
        ];
        let mut buf = BytesMut::new();
        frontend::startup_message(params, &mut buf)?;
        stream.write_all(&buf).await?;
        stream.flush().await?;

        authenticate(&mut stream, user, password.as_deref()).await?;
        wait_ready(&mut stream).await?;

        Ok(ReplicationClient { stream })
    }

    pub async fn identify_system(&mut self) -> Result<IdentifySystem> {
        let rows = self.simple_query("IDENTIFY_SYSTEM").await?;
        let row = rows.first().context("IDENTIFY_SYSTEM returned no row")?;
        let field = |i: usize, name: &str| -> Result<&str> {
            row.get(i)
                .and_then(|v| v.as_deref())
                .with_context(|| format!("IDENTIFY_SYSTEM missing {name}"))
        };
        Ok(IdentifySystem {
            system_id: field(0, "systemid")?.to_string(),
            timeline: field(1, "timeline")?.parse().context("bad timeline")?,
            xlog_pos: field(2, "xlogpos")?.parse().context("bad xlogpos")?,
        })
    }

    /// Create a logical slot, exporting a snapshot that pins the state the
    /// bulk copy will read. The slot's consistent point is where apply
    /// will start.
    pub async fn create_slot(&mut self, slot: &str, plugin: &str) -> Result<CreatedSlot> {
        let sql = format!(
            "CREATE_REPLICATION_SLOT {} LOGICAL {} EXPORT_SNAPSHOT",
            quote_replication_ident(slot),
            quote_replication_ident(plugin),
        );
        let rows = self.simple_query(&sql).await?;
        let row = rows
            .first()
            .context("CREATE_REPLICATION_SLOT returned no row")?;
        let consistent: &str = row
            .get(1)
            .and_then(|v| v.as_deref())
            .context("missing consistent_point")?;
        Ok(CreatedSlot {
            slot_name: slot.to_string(),
            consistent_point: consistent.parse().context("bad consistent_point")?,
            snapshot_name: row.get(2).and_then(|v| v.clone()),
            plugin: plugin.to_string(),
        })
    }

    pub async fn drop_slot(&mut self, slot: &str) -> Result<()> {
        let sql = format!("DROP_REPLICATION_SLOT {} WAIT", quote_replication_ident(slot));
        self.simple_query(&sql).await?;
        Ok(())
    }

    /// Enter CopyBoth mode streaming from `start` with per-plugin options.
    pub async fn start_replication(
        mut self,
        slot: &str,
        start: Lsn,
        options: &[(&str, &str)],
    ) -> Result<ReplicationStream> {
        let mut sql = format!(
            "START_REPLICATION SLOT {} LOGICAL {start}",
            quote_replication_ident(slot),
        );
        if !options.is_empty() {
            let rendered: Vec<String> = options
                .iter()
                .map(|(k, v)| format!("\"{k}\" '{v}'"))
                .collect();
            sql.push_str(&format!(" ({})", rendered.join(", ")));
        }

        let mut buf = BytesMut::new();
        frontend::query(&sql, &mut buf)?;
        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;

        loop {
            let (code, body) = read_frame(&mut self.stream).await?;
            match code {
                b'W' => {
                    tracing::debug!("entered CopyBoth mode at {start}");
                    return Ok(ReplicationStream {
                        stream: self.stream,
                    });
                }
                b'E' => bail!("START_REPLICATION failed: {}", error_message(&body)),
                // NoticeResponse and ParameterStatus may precede the
                // CopyBothResponse.
                b'N' | b'S' => continue,
                other => bail!("unexpected response to START_REPLICATION: {}", other as char),
            }
        }
    }

    /// Run a simple query, returning data rows as text columns. Row
    /// descriptions and command tags are consumed and discarded.
    async fn simple_query(&mut self, sql: &str) -> Result<Vec<Vec<Option<String>>>> {
        let mut buf = BytesMut::new();
        frontend::query(sql, &mut buf)?;
        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;

        let mut rows = Vec::new();
        loop {
            let (code, body) = read_frame(&mut self.stream).await?;
            match code {
                b'T' | b'C' | b'N' | b'S' => {} // row description, tag, notice
                b'D' => rows.push(parse_data_row(body)?),
                b'Z' => return Ok(rows),
                b'E' => {
                    let message = error_message(&body);
                    // Drain until ReadyForQuery so the connection stays
                    // usable for the caller's error handling.
                    loop {
                        let (code, _) = read_frame(&mut self.stream).await?;
                        if code == b'Z' {
                            break;
                        }
                    }
                    bail!("replication command failed: {message}");
                }
                other => bail!("unexpected message {} during query", other as char),
            }
        }
    }
}

/// The CopyBoth phase of a replication connection.
pub struct ReplicationStream {
    stream: BufReader<TcpStream>,
}

#[derive(Debug)]
pub enum WalMessage {
    /// One decoded-plugin payload with its WAL coordinates.
    XLogData {
        wal_start: Lsn,
        wal_end: Lsn,
        data: Bytes,
    },
    /// Server heartbeat; answer promptly when a reply is requested.
    KeepAlive { wal_end: Lsn, reply_requested: bool },
    /// Server ended the stream (CopyDone).
    Done,
}

impl ReplicationStream {
    pub async fn next_message(&mut self) -> Result<WalMessage> {
        loop {
            let (code, body) = read_frame(&mut self.stream).await?;
            match code {
                b'd' => {
                    let mut body = Bytes::from(body);
                    if body.is_empty() {
                        continue;
                    }
                    match body.get_u8() {
                        b'w' => {
                            if body.remaining() < 24 {
                                bail!("short XLogData frame");
                            }
                            let wal_start = Lsn(body.get_u64());
                            let wal_end = Lsn(body.get_u64());
                            let _server_time = body.get_i64();
                            return Ok(WalMessage::XLogData {
                                wal_start,
                                wal_end,
                                data: body,
                            });
                        }
                        b'k' => {
                            if body.remaining() < 17 {
                                bail!("short keepalive frame");
                            }
                            let wal_end = Lsn(body.get_u64());
                            let _server_time = body.get_i64();
                            let reply_requested = body.get_u8() == 1;
                            return Ok(WalMessage::KeepAlive {
                                wal_end,
                                reply_requested,
                            });
                        }
                        other => {
                            tracing::debug!("ignoring stream message {}", other as char);
                        }
                    }
                }
                b'c' => return Ok(WalMessage::Done),
                b'E' => bail!("replication stream error: {}", error_message(&body)),
                other => {
                    tracing::debug!("ignoring protocol message {}", other as char);
                }
            }
        }
    }

    /// Standby status update: tells the source how far we have written,
    /// flushed, and applied, so it can recycle WAL behind us.
    pub async fn standby_status_update(
        &mut self,
        write: Lsn,
        flush: Lsn,
        apply: Lsn,
        reply_requested: bool,
    ) -> Result<()> {
        let mut payload = BytesMut::with_capacity(34);
        payload.put_u8(b'r');
        payload.put_u64(write.0);
        payload.put_u64(flush.0);
        payload.put_u64(apply.0);
        payload.put_i64(pg_now_micros());
        payload.put_u8(u8::from(reply_requested));

        let mut frame = BytesMut::with_capacity(payload.len() + 5);
        frame.put_u8(b'd');
        frame.put_i32((payload.len() + 4) as i32);
        frame.put_slice(&payload);

        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        Ok(())
    }
}

fn pg_now_micros() -> i64 {
    let pg_epoch = UNIX_EPOCH + Duration::from_secs(PG_EPOCH_UNIX_SECS);
    SystemTime::now()
        .duration_since(pg_epoch)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

async fn read_frame(stream: &mut BufReader<TcpStream>) -> Result<(u8, Vec<u8>)> {
    let code = stream.read_u8().await.context("connection closed")?;
    let len = stream.read_i32().await.context("connection closed")? as usize;
    if len < 4 {
        bail!("invalid frame length {len}");
    }
    let mut body = vec![0u8; len - 4];
    stream
        .read_exact(&mut body)
        .await
        .context("connection closed mid-frame")?;
    Ok((code, body))
}

async fn authenticate(
    stream: &mut BufReader<TcpStream>,
    user: &str,
    password: Option<&str>,
) -> Result<()> {
    loop {
        let (code, body) = read_frame(stream).await?;
        match code {
            b'R' => {
                let mut body = Bytes::from(body);
                match body.get_i32() {
                    0 => return Ok(()),
                    3 => {
                        let password = password.context("server requires a password")?;
                        send_password(stream, password).await?;
                    }
                    5 => {
                        let password = password.context("server requires a password")?;
                        let mut salt = [0u8; 4];
                        body.copy_to_slice(&mut salt);
                        let hashed = md5_password(user, password, &salt);
                        send_password(stream, &hashed).await?;
                    }
                    10 => bail!("server requires SCRAM authentication, which the \
                                 replication client does not speak; use md5 or trust"),
                    other => bail!("unsupported authentication request {other}"),
                }
            }
            b'E' => bail!("authentication failed: {}", error_message(&body)),
            other => bail!("unexpected message {} during authentication", other as char),
        }
    }
}

async fn send_password(stream: &mut BufReader<TcpStream>, password: &str) -> Result<()> {
    let mut buf = BytesMut::new();
    frontend::password_message(password.as_bytes(), &mut buf)?;
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

async fn wait_ready(stream: &mut BufReader<TcpStream>) -> Result<()> {
    loop {
        let (code, body) = read_frame(stream).await?;
        match code {
            b'Z' => return Ok(()),
            b'E' => bail!("connection rejected: {}", error_message(&body)),
            // ParameterStatus, BackendKeyData, NoticeResponse
            b'S' | b'K' | b'N' => {}
            other => bail!("unexpected message {} before ready", other as char),
        }
    }
}

/// MD5 password response: md5(md5(password + user) + salt), hex, prefixed.
fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    let inner = md5_hex(format!("{password}{user}").as_bytes());
    let mut outer_input = inner.into_bytes();
    outer_input.extend_from_slice(salt);
    format!("md5{}", md5_hex(&outer_input))
}

fn md5_hex(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Pull the human-readable message (field 'M') out of an ErrorResponse.
fn error_message(body: &[u8]) -> String {
    let mut fields = body;
    let mut message = None;
    let mut code = None;
    while let Some((&field, rest)) = fields.split_first() {
        if field == 0 {
            break;
        }
        let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        let value = String::from_utf8_lossy(&rest[..end]).into_owned();
        match field {
            b'M' => message = Some(value),
            b'C' => code = Some(value),
            _ => {}
        }
        fields = &rest[(end + 1).min(rest.len())..];
    }
    match (code, message) {
        (Some(code), Some(message)) => format!("{code}: {message}"),
        (None, Some(message)) => message,
        _ => "unknown server error".to_string(),
    }
}

/// Parse a DataRow frame into text columns.
fn parse_data_row(body: Vec<u8>) -> Result<Vec<Option<String>>> {
    let mut body = Bytes::from(body);
    if body.remaining() < 2 {
        bail!("short DataRow");
    }
    let count = body.get_i16();
    let mut row = Vec::with_capacity(count.max(0) as usize);
    for _ in 0..count {
        if body.remaining() < 4 {
            bail!("short DataRow field header");
        }
        let len = body.get_i32();
        if len < 0 {
            row.push(None);
        } else {
            let len = len as usize;
            if body.remaining() < len {
                bail!("short DataRow field");
            }
            let value = body.copy_to_bytes(len);
            row.push(Some(String::from_utf8_lossy(&value).into_owned()));
        }
    }
    Ok(row)
}

/// Replication command identifiers take double quotes.
fn quote_replication_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_md5_password_shape() {
        // Known-answer: md5(md5("secretalice") + salt).
        let hashed = md5_password("alice", "secret", &[1, 2, 3, 4]);
        assert!(hashed.starts_with("md5"));
        assert_eq!(hashed.len(), 35);
        // Deterministic.
        assert_eq!(hashed, md5_password("alice", "secret", &[1, 2, 3, 4]));
        assert_ne!(hashed, md5_password("alice", "secret", &[4, 3, 2, 1]));
    }

    #[test]
    fn test_error_message_parsing() {
        let mut body = Vec::new();
        body.push(b'S');
        body.extend_from_slice(b"ERROR\0");
        body.push(b'C');
        body.extend_from_slice(b"42601\0");
        body.push(b'M');
        body.extend_from_slice(b"syntax error\0");
        body.push(0);
        assert_eq!(error_message(&body), "42601: syntax error");
    }

    #[test]
    fn test_parse_data_row() {
        let mut body = BytesMut::new();
        body.put_i16(3);
        body.put_i32(2);
        body.put_slice(b"ab");
        body.put_i32(-1);
        body.put_i32(0);
        let row = parse_data_row(body.to_vec()).unwrap();
        assert_eq!(
            row,
            vec![Some("ab".to_string()), None, Some(String::new())]
        );
    }

    #[test]
    fn test_quote_replication_ident() {
        assert_eq!(quote_replication_ident("pgcopydb"), "\"pgcopydb\"");
        assert_eq!(quote_replication_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
