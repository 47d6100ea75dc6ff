//! Parser for wal2json format-version 2 output.
//!
//! In version 2 every decoded message is one standalone JSON document:
//! `B`/`C` transaction markers and `I`/`U`/`D`/`T`/`M` actions with
//! `columns`, `identity`, and `pk` arrays. We request include-xids,
//! include-timestamp, include-pk, and include-lsn, but treat all of them
//! as optional so a differently configured slot still parses.

use anyhow::{Context, Result};
use serde_json::Value;

use crate::cdc::change::{Change, ChangeRecord, Column, Relation, TupleValue};
use crate::lsn::Lsn;

/// Parse one wal2json message into a Change Record. `lsn` is the WAL
/// position the receiver framed the message with; an `lsn` field inside
/// the payload wins when present.
pub fn parse(lsn: Lsn, payload: &str) -> Result<ChangeRecord> {
    let value: Value = serde_json::from_str(payload).context("wal2json payload is not JSON")?;
    let obj = value
        .as_object()
        .context("wal2json payload is not a JSON object")?;

    let action = obj
        .get("action")
        .and_then(Value::as_str)
        .context("wal2json message missing 'action'")?;

    let lsn = obj
        .get("lsn")
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
        .unwrap_or(lsn);
    let xid = obj.get("xid").and_then(Value::as_u64);
    let timestamp = obj
        .get("timestamp")
        .and_then(Value::as_str)
        .map(String::from);

    let change = match action {
        "B" => Change::Begin { xid, timestamp },
        "C" => Change::Commit {
            timestamp,
            end_lsn: obj
                .get("nextlsn")
                .and_then(Value::as_str)
                .and_then(|s| s.parse().ok()),
        },
        "I" => Change::Insert {
            relation: relation(obj)?,
            new: columns(obj.get("columns"))?,
            identity: pk_names(obj),
        },
        "U" => Change::Update {
            relation: relation(obj)?,
            key: columns(obj.get("identity"))?,
            new: columns(obj.get("columns"))?,
            identity: pk_names(obj),
        },
        "D" => {
            let key = match obj.get("identity") {
                Some(identity) => columns(Some(identity))?,
                // Older configurations put the old tuple in "columns".
                None => columns(obj.get("columns"))?,
            };
            Change::Delete {
                relation: relation(obj)?,
                key,
            }
        }
        "T" => Change::Truncate {
            relations: vec![relation(obj)?],
        },
        "M" => Change::Message {
            prefix: obj
                .get("prefix")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            content: obj
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        },
        other => anyhow::bail!("unknown wal2json action {other:?}"),
    };

    Ok(ChangeRecord { lsn, xid, change })
}

fn relation(obj: &serde_json::Map<String, Value>) -> Result<Relation> {
    let schema = obj
        .get("schema")
        .and_then(Value::as_str)
        .unwrap_or("public");
    let table = obj
        .get("table")
        .and_then(Value::as_str)
        .context("wal2json message missing 'table'")?;
    Ok(Relation::new(schema, table))
}

fn pk_names(obj: &serde_json::Map<String, Value>) -> Vec<String> {
    obj.get("pk")
        .and_then(Value::as_array)
        .map(|pks| {
            pks.iter()
                .filter_map(|pk| pk.get("name").and_then(Value::as_str).map(String::from))
                .collect()
        })
        .unwrap_or_default()
}

fn columns(value: Option<&Value>) -> Result<Vec<Column>> {
    let Some(array) = value.and_then(Value::as_array) else {
        return Ok(Vec::new());
    };
    let mut out = Vec::with_capacity(array.len());
    for entry in array {
        let entry = entry.as_object().context("column entry is not an object")?;
        let name = entry
            .get("name")
            .and_then(Value::as_str)
            .context("column missing 'name'")?
            .to_string();
        let type_name = entry
            .get("type")
            .and_then(Value::as_str)
            .context("column missing 'type'")?
            .to_string();
        let value = match entry.get("value") {
            None | Some(Value::Null) => TupleValue::Null,
            Some(Value::String(s)) => TupleValue::Text(s.clone()),
            Some(Value::Bool(b)) => TupleValue::Text(b.to_string()),
            Some(Value::Number(n)) => TupleValue::Text(n.to_string()),
            // Nested arrays/objects do not occur in wal2json v2 output;
            // columns of json type arrive as strings.
            Some(other) => TupleValue::Text(other.to_string()),
        };
        out.push(Column {
            name,
            type_name,
            value,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_begin_and_commit() {
        let begin = parse(
            Lsn(0x100),
            r#"{"action":"B","xid":734,"timestamp":"2026-01-10 11:00:00.000000+00"}"#,
        )
        .unwrap();
        assert_eq!(begin.xid, Some(734));
        assert!(matches!(begin.change, Change::Begin { .. }));

        let commit = parse(
            Lsn(0x200),
            r#"{"action":"C","xid":734,"lsn":"0/1949F68","nextlsn":"0/1949F98"}"#,
        )
        .unwrap();
        assert_eq!(commit.lsn, Lsn(0x1949F68));
        match commit.change {
            Change::Commit { end_lsn, .. } => assert_eq!(end_lsn, Some(Lsn(0x1949F98))),
            other => panic!("expected commit, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_insert_with_pk() {
        let record = parse(
            Lsn(0x150),
            r#"{"action":"I","schema":"public","table":"users",
                "columns":[
                    {"name":"id","type":"integer","value":1},
                    {"name":"name","type":"text","value":"Alice"},
                    {"name":"active","type":"boolean","value":true},
                    {"name":"score","type":"numeric","value":3.25},
                    {"name":"bio","type":"text","value":null}],
                "pk":[{"name":"id","type":"integer"}]}"#,
        )
        .unwrap();

        match record.change {
            Change::Insert {
                relation,
                new,
                identity,
            } => {
                assert_eq!(relation, Relation::new("public", "users"));
                assert_eq!(identity, vec!["id".to_string()]);
                assert_eq!(new.len(), 5);
                assert_eq!(new[0].value, TupleValue::Text("1".into()));
                assert_eq!(new[1].value, TupleValue::Text("Alice".into()));
                assert_eq!(new[2].value, TupleValue::Text("true".into()));
                assert_eq!(new[3].value, TupleValue::Text("3.25".into()));
                assert_eq!(new[4].value, TupleValue::Null);
            }
            other => panic!("expected insert, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_update_keys_by_identity() {
        let record = parse(
            Lsn(0x150),
            r#"{"action":"U","schema":"public","table":"users",
                "columns":[{"name":"id","type":"integer","value":1},
                           {"name":"name","type":"text","value":"Bob"}],
                "identity":[{"name":"id","type":"integer","value":1}],
                "pk":[{"name":"id","type":"integer"}]}"#,
        )
        .unwrap();

        match record.change {
            Change::Update { key, new, .. } => {
                assert_eq!(key.len(), 1);
                assert_eq!(key[0].name, "id");
                assert_eq!(new.len(), 2);
            }
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_delete_uses_identity() {
        let record = parse(
            Lsn(0x150),
            r#"{"action":"D","schema":"public","table":"users",
                "identity":[{"name":"id","type":"integer","value":7}]}"#,
        )
        .unwrap();
        match record.change {
            Change::Delete { key, .. } => {
                assert_eq!(key[0].value, TupleValue::Text("7".into()));
            }
            other => panic!("expected delete, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_truncate_and_message() {
        let truncate = parse(
            Lsn(0x150),
            r#"{"action":"T","schema":"public","table":"users"}"#,
        )
        .unwrap();
        assert!(matches!(truncate.change, Change::Truncate { .. }));

        let message = parse(
            Lsn(0x150),
            r#"{"action":"M","transactional":true,"prefix":"app","content":"hello"}"#,
        )
        .unwrap();
        match message.change {
            Change::Message { prefix, content } => {
                assert_eq!(prefix, "app");
                assert_eq!(content, "hello");
            }
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[test]
    fn test_garbage_is_rejected() {
        parse(Lsn(0x1), "not json").unwrap_err();
        parse(Lsn(0x1), "[1,2,3]").unwrap_err();
        parse(Lsn(0x1), r#"{"action":"X"}"#).unwrap_err();
        parse(Lsn(0x1), r#"{"action":"I","schema":"s"}"#).unwrap_err();
    }
}
