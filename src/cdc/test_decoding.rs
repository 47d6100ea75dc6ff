//! Parser for the textual `test_decoding` output plugin.
//!
//! Example lines, as produced with include-xids and include-timestamp:
//!
//! ```text
//! BEGIN 734
//! table public.users: INSERT: id[integer]:1 name[text]:'Alice'
//! table public.users: UPDATE: old-key: id[integer]:1 new-tuple: id[integer]:2 name[text]:'Bob'
//! table public.users: DELETE: id[integer]:1
//! table public.users: TRUNCATE: (no-flags)
//! COMMIT 734 (at 2026-01-10 11:00:00.000000+00)
//! ```
//!
//! Column values are `name[type]:value` with single-quoted strings using
//! doubled-quote escaping. The plugin gives no primary key metadata, so
//! inserts degrade to conflict-ignoring upserts downstream.

use anyhow::{bail, Context, Result};

use crate::cdc::change::{Change, ChangeRecord, Column, Relation, TupleValue};
use crate::lsn::Lsn;

pub fn parse(lsn: Lsn, payload: &str) -> Result<ChangeRecord> {
    let line = payload.trim_end_matches('\n');

    if let Some(rest) = line.strip_prefix("BEGIN") {
        let xid = rest.trim().parse::<u64>().ok();
        return Ok(ChangeRecord {
            lsn,
            xid,
            change: Change::Begin {
                xid,
                timestamp: None,
            },
        });
    }

    if let Some(rest) = line.strip_prefix("COMMIT") {
        let rest = rest.trim();
        let (xid_part, ts_part) = match rest.split_once("(at ") {
            Some((xid, ts)) => (xid.trim(), Some(ts.trim_end_matches(')').to_string())),
            None => (rest, None),
        };
        let xid = xid_part.trim().parse::<u64>().ok();
        return Ok(ChangeRecord {
            lsn,
            xid,
            change: Change::Commit {
                timestamp: ts_part,
                end_lsn: None,
            },
        });
    }

    if let Some(rest) = line.strip_prefix("message:") {
        // "message: transactional: true prefix: app, sz: 5 content:hello"
        let prefix = rest
            .split_once("prefix:")
            .map(|(_, p)| p.split(',').next().unwrap_or("").trim().to_string())
            .unwrap_or_default();
        let content = rest
            .split_once("content:")
            .map(|(_, c)| c.to_string())
            .unwrap_or_default();
        return Ok(ChangeRecord {
            lsn,
            xid: None,
            change: Change::Message { prefix, content },
        });
    }

    let rest = line
        .strip_prefix("table ")
        .with_context(|| format!("unrecognized test_decoding line: {line:?}"))?;
    let (relation, rest) = rest
        .split_once(": ")
        .context("test_decoding line missing relation separator")?;
    let relation = parse_relation(relation)?;

    if let Some(cols) = rest.strip_prefix("INSERT: ") {
        return Ok(ChangeRecord {
            lsn,
            xid: None,
            change: Change::Insert {
                relation,
                new: parse_columns(cols)?,
                identity: Vec::new(),
            },
        });
    }
    if let Some(rest) = rest.strip_prefix("UPDATE: ") {
        let (key, new) = match rest.strip_prefix("old-key: ") {
            Some(rest) => {
                let (old, new) = rest
                    .split_once(" new-tuple: ")
                    .context("UPDATE with old-key but no new-tuple")?;
                (parse_columns(old)?, parse_columns(new)?)
            }
            None => (Vec::new(), parse_columns(rest)?),
        };
        return Ok(ChangeRecord {
            lsn,
            xid: None,
            change: Change::Update {
                relation,
                key,
                new,
                identity: Vec::new(),
            },
        });
    }
    if let Some(cols) = rest.strip_prefix("DELETE: ") {
        let key = if cols.trim() == "(no-tuple-data)" {
            Vec::new()
        } else {
            parse_columns(cols)?
        };
        return Ok(ChangeRecord {
            lsn,
            xid: None,
            change: Change::Delete { relation, key },
        });
    }
    if rest.starts_with("TRUNCATE") {
        return Ok(ChangeRecord {
            lsn,
            xid: None,
            change: Change::Truncate {
                relations: vec![relation],
            },
        });
    }

    bail!("unrecognized test_decoding action in line: {line:?}")
}

fn parse_relation(spec: &str) -> Result<Relation> {
    let (schema, table) = spec
        .split_once('.')
        .with_context(|| format!("relation {spec:?} is not schema-qualified"))?;
    Ok(Relation::new(unquote_ident(schema), unquote_ident(table)))
}

fn unquote_ident(ident: &str) -> String {
    let trimmed = ident.trim();
    if trimmed.len() >= 2 && trimmed.starts_with('"') && trimmed.ends_with('"') {
        trimmed[1..trimmed.len() - 1].replace("\"\"", "\"")
    } else {
        trimmed.to_string()
    }
}

/// Tokenize `name[type]:value` pairs. Values are either single-quoted
/// strings with doubled-quote escaping or bare tokens ending at the next
/// space.
fn parse_columns(input: &str) -> Result<Vec<Column>> {
    let mut columns = Vec::new();
    let bytes = input.as_bytes();
    let mut pos = 0;

    while pos < bytes.len() {
        while pos < bytes.len() && bytes[pos] == b' ' {
            pos += 1;
        }
        if pos >= bytes.len() {
            break;
        }

        let bracket = input[pos..]
            .find('[')
            .map(|i| pos + i)
            .with_context(|| format!("missing '[' in column spec near {:?}", &input[pos..]))?;
        let name = input[pos..bracket].to_string();

        // Type names can nest brackets only in array suffixes like
        // integer[]; scan for the ']' that is followed by ':'.
        let mut close = bracket + 1;
        let mut type_end = None;
        while let Some(i) = input[close..].find(']') {
            let candidate = close + i;
            if input[candidate + 1..].starts_with(':') {
                type_end = Some(candidate);
                break;
            }
            close = candidate + 1;
        }
        let type_end =
            type_end.with_context(|| format!("missing ']:' in column spec for {name:?}"))?;
        let type_name = input[bracket + 1..type_end].to_string();

        let value_start = type_end + 2;
        let (value, next) = parse_value(input, value_start)?;
        columns.push(Column {
            name,
            type_name,
            value,
        });
        pos = next;
    }

    Ok(columns)
}

/// Parse one value starting at `start`; returns the value and the index
/// just past it.
fn parse_value(input: &str, start: usize) -> Result<(TupleValue, usize)> {
    let bytes = input.as_bytes();
    if start >= bytes.len() {
        return Ok((TupleValue::Text(String::new()), start));
    }

    if bytes[start] == b'\'' {
        // Quoted: scan for a closing quote that is not doubled.
        let mut value = String::new();
        let mut i = start + 1;
        loop {
            match input[i..].find('\'') {
                Some(q) => {
                    let quote = i + q;
                    value.push_str(&input[i..quote]);
                    if input[quote + 1..].starts_with('\'') {
                        value.push('\'');
                        i = quote + 2;
                    } else {
                        return Ok((TupleValue::Text(value), quote + 1));
                    }
                }
                None => bail!("unterminated quoted value"),
            }
        }
    }

    let end = input[start..]
        .find(' ')
        .map(|i| start + i)
        .unwrap_or(input.len());
    let token = &input[start..end];
    let value = match token {
        "null" => TupleValue::Null,
        "unchanged-toast-datum" => TupleValue::Unchanged,
        other => TupleValue::Text(other.to_string()),
    };
    Ok((value, end))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_begin_commit() {
        let begin = parse(Lsn(0x10), "BEGIN 734").unwrap();
        assert_eq!(begin.xid, Some(734));

        let commit = parse(
            Lsn(0x20),
            "COMMIT 734 (at 2026-01-10 11:00:00.000000+00)",
        )
        .unwrap();
        match commit.change {
            Change::Commit { timestamp, .. } => {
                assert_eq!(timestamp.as_deref(), Some("2026-01-10 11:00:00.000000+00"));
            }
            other => panic!("expected commit, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_insert() {
        let record = parse(
            Lsn(0x30),
            "table public.users: INSERT: id[integer]:1 name[text]:'Alice' bio[text]:null",
        )
        .unwrap();
        match record.change {
            Change::Insert { relation, new, .. } => {
                assert_eq!(relation, Relation::new("public", "users"));
                assert_eq!(new.len(), 3);
                assert_eq!(new[0].type_name, "integer");
                assert_eq!(new[0].value, TupleValue::Text("1".into()));
                assert_eq!(new[1].value, TupleValue::Text("Alice".into()));
                assert_eq!(new[2].value, TupleValue::Null);
            }
            other => panic!("expected insert, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_quoted_value_with_spaces_and_quotes() {
        let record = parse(
            Lsn(0x30),
            "table public.users: INSERT: name[text]:'O''Brien, Anna' note[character varying(40)]:'two words'",
        )
        .unwrap();
        match record.change {
            Change::Insert { new, .. } => {
                assert_eq!(new[0].value, TupleValue::Text("O'Brien, Anna".into()));
                assert_eq!(new[1].type_name, "character varying(40)");
                assert_eq!(new[1].value, TupleValue::Text("two words".into()));
            }
            other => panic!("expected insert, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_update_with_old_key() {
        let record = parse(
            Lsn(0x30),
            "table public.users: UPDATE: old-key: id[integer]:1 new-tuple: id[integer]:2 name[text]:'Bob'",
        )
        .unwrap();
        match record.change {
            Change::Update { key, new, .. } => {
                assert_eq!(key.len(), 1);
                assert_eq!(key[0].value, TupleValue::Text("1".into()));
                assert_eq!(new.len(), 2);
                assert_eq!(new[0].value, TupleValue::Text("2".into()));
            }
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_update_without_old_key() {
        let record = parse(
            Lsn(0x30),
            "table public.users: UPDATE: id[integer]:1 name[text]:'Bob'",
        )
        .unwrap();
        match record.change {
            Change::Update { key, new, .. } => {
                assert!(key.is_empty());
                assert_eq!(new.len(), 2);
            }
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_delete_and_truncate() {
        let record = parse(Lsn(0x30), "table public.users: DELETE: id[integer]:7").unwrap();
        match record.change {
            Change::Delete { key, .. } => assert_eq!(key[0].value, TupleValue::Text("7".into())),
            other => panic!("expected delete, got {other:?}"),
        }

        let record = parse(Lsn(0x30), "table public.users: TRUNCATE: (no-flags)").unwrap();
        assert!(matches!(record.change, Change::Truncate { .. }));
    }

    #[test]
    fn test_parse_array_type() {
        let record = parse(
            Lsn(0x30),
            "table public.t: INSERT: tags[text[]]:'{a,b}' nums[integer[]]:'{1,2,3}'",
        )
        .unwrap();
        match record.change {
            Change::Insert { new, .. } => {
                assert_eq!(new[0].type_name, "text[]");
                assert_eq!(new[0].value, TupleValue::Text("{a,b}".into()));
                assert_eq!(new[1].type_name, "integer[]");
            }
            other => panic!("expected insert, got {other:?}"),
        }
    }

    #[test]
    fn test_unchanged_toast_value() {
        let record = parse(
            Lsn(0x30),
            "table public.t: UPDATE: id[integer]:1 big[text]:unchanged-toast-datum",
        )
        .unwrap();
        match record.change {
            Change::Update { new, .. } => {
                assert_eq!(new[1].value, TupleValue::Unchanged);
            }
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn test_quoted_relation_names() {
        let record = parse(
            Lsn(0x30),
            "table \"Company\".\"User Data\": DELETE: id[integer]:1",
        )
        .unwrap();
        match record.change {
            Change::Delete { relation, .. } => {
                assert_eq!(relation, Relation::new("Company", "User Data"));
            }
            other => panic!("expected delete, got {other:?}"),
        }
    }

    #[test]
    fn test_garbage_is_rejected() {
        parse(Lsn(0x1), "nonsense line").unwrap_err();
        parse(Lsn(0x1), "table public.users: EXPLODE: id[integer]:1").unwrap_err();
        parse(Lsn(0x1), "table public.users: INSERT: malformed").unwrap_err();
    }
}
