//! Change Records: the plugin-independent shape both logical decoding
//! parsers produce and the transformer consumes.

use crate::lsn::Lsn;

/// A relation named in decoded output. Always schema-qualified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    pub schema: String,
    pub table: String,
}

impl Relation {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Relation {
        Relation {
            schema: schema.into(),
            table: table.into(),
        }
    }

    pub fn qualified(&self) -> String {
        format!(
            "{}.{}",
            crate::pgsql::quote_ident(&self.schema),
            crate::pgsql::quote_ident(&self.table)
        )
    }
}

/// One column of a decoded tuple. The value keeps the plugin's text form;
/// rendering casts it back through the column's declared type, which is
/// lossless for every type the plugins can emit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub type_name: String,
    pub value: TupleValue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TupleValue {
    Null,
    Text(String),
    /// TOASTed value not present in the decoded output; the target's
    /// current value must be left untouched.
    Unchanged,
}

/// The decoded action stream. Within a transaction, data changes appear
/// strictly between Begin and Commit.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Begin {
        xid: Option<u64>,
        timestamp: Option<String>,
    },
    Commit {
        timestamp: Option<String>,
        /// LSN of the position right after the commit record, when the
        /// plugin reports it.
        end_lsn: Option<Lsn>,
    },
    Insert {
        relation: Relation,
        new: Vec<Column>,
        /// Replica identity column names, when the plugin reports them.
        identity: Vec<String>,
    },
    Update {
        relation: Relation,
        /// Old key (replica identity) columns; empty when the identity is
        /// unchanged and the plugin omitted it.
        key: Vec<Column>,
        new: Vec<Column>,
        identity: Vec<String>,
    },
    Delete {
        relation: Relation,
        key: Vec<Column>,
    },
    Truncate {
        relations: Vec<Relation>,
    },
    /// A logical decoding message (pg_logical_emit_message).
    Message {
        prefix: String,
        content: String,
    },
    /// Timeline/WAL file boundary marker; carries no data.
    SwitchWal,
}

/// A change with its WAL coordinates, as framed by the receiver.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    pub lsn: Lsn,
    pub xid: Option<u64>,
    pub change: Change,
}

impl ChangeRecord {
    pub fn action_name(&self) -> &'static str {
        match self.change {
            Change::Begin { .. } => "BEGIN",
            Change::Commit { .. } => "COMMIT",
            Change::Insert { .. } => "INSERT",
            Change::Update { .. } => "UPDATE",
            Change::Delete { .. } => "DELETE",
            Change::Truncate { .. } => "TRUNCATE",
            Change::Message { .. } => "MESSAGE",
            Change::SwitchWal => "SWITCH-WAL",
        }
    }
}
