use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Map, Value};

/// Attribute bag of one entity. The entity id is never stored inside it.
pub type Row = Map<String, Value>;

/// Entity id -> attributes.
pub type Table = BTreeMap<String, Row>;

/// Table name -> table. This is the unit exchanged between loaders, the
/// in-memory store and the persisters.
pub type Tables = BTreeMap<String, Table>;

/// Table name -> ids of the rows touched since the last notification.
pub type ChangedTables = BTreeMap<String, BTreeSet<String>>;

/// Content crossing the boundary between disk and the store.
#[derive(Debug, Clone, PartialEq)]
pub enum TableChanges {
    /// Replace every table named here with the given rows.
    Snapshot(Tables),
    /// Upsert the given rows, leaving everything else untouched.
    Delta(Tables),
}

impl TableChanges {
    pub fn delta_for(table_name: &str, table: Table) -> Self {
        let mut tables = Tables::new();
        tables.insert(table_name.to_string(), table);
        TableChanges::Delta(tables)
    }

    pub fn tables(&self) -> &Tables {
        match self {
            TableChanges::Snapshot(tables) | TableChanges::Delta(tables) => tables,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tables().values().all(|table| table.is_empty())
    }
}

/// Shallow per-table union; rows in `other` replace rows with the same id.
pub fn merge_tables(into: &mut Tables, other: Tables) {
    for (name, rows) in other {
        into.entry(name).or_default().extend(rows);
    }
}

/// Splits `{id, ...fields}` into the id and the remaining fields.
pub fn split_id(mut record: Row) -> Option<(String, Row)> {
    let id = match record.remove("id")? {
        Value::String(id) => id,
        Value::Number(id) => id.to_string(),
        _ => return None,
    };
    if id.trim().is_empty() {
        return None;
    }
    Some((id, record))
}

/// Inverse of [`split_id`].
pub fn with_id(id: &str, row: &Row) -> Row {
    let mut record = Row::with_capacity(row.len() + 1);
    record.insert("id".to_string(), Value::String(id.to_string()));
    for (key, value) in row {
        record.insert(key.clone(), value.clone());
    }
    record
}

pub fn changed_rows<'a>(changed: &'a ChangedTables, table_name: &str) -> Option<&'a BTreeSet<String>> {
    changed.get(table_name).filter(|rows| !rows.is_empty())
}
