use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde_json::Value;
use tokio::sync::broadcast;

use super::table::{ChangedTables, Row, Table, TableChanges, Tables};

const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// In-memory tables shared by every persister.
///
/// Local mutations publish a [`ChangedTables`] to subscribers, which is what
/// drives auto-save. Content coming back from disk goes through
/// [`TableStore::apply_persisted`] and publishes nothing, so a reload never
/// echoes back into a write.
pub struct TableStore {
    tables: RwLock<Tables>,
    changes_tx: broadcast::Sender<ChangedTables>,
}

impl Default for TableStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TableStore {
    pub fn new() -> Self {
        let (changes_tx, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            tables: RwLock::new(Tables::new()),
            changes_tx,
        }
    }

    pub fn with_tables(tables: Tables) -> Self {
        let store = Self::new();
        *store.write() = tables;
        store
    }

    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangedTables> {
        self.changes_tx.subscribe()
    }

    pub fn get_tables(&self) -> Tables {
        self.read().clone()
    }

    /// Rows of `table_name`, empty when the table does not exist.
    pub fn get_table(&self, table_name: &str) -> Table {
        self.read().get(table_name).cloned().unwrap_or_default()
    }

    pub fn get_row(&self, table_name: &str, row_id: &str) -> Option<Row> {
        self.read().get(table_name)?.get(row_id).cloned()
    }

    pub fn get_cell(&self, table_name: &str, row_id: &str, cell_id: &str) -> Option<Value> {
        self.read().get(table_name)?.get(row_id)?.get(cell_id).cloned()
    }

    pub fn set_row(&self, table_name: &str, row_id: &str, row: Row) {
        self.transaction(|tx| tx.set_row(table_name, row_id, row));
    }

    pub fn set_cell(&self, table_name: &str, row_id: &str, cell_id: &str, value: Value) {
        self.transaction(|tx| tx.set_cell(table_name, row_id, cell_id, value));
    }

    pub fn del_row(&self, table_name: &str, row_id: &str) {
        self.transaction(|tx| tx.del_row(table_name, row_id));
    }

    pub fn set_table(&self, table_name: &str, table: Table) {
        self.transaction(|tx| tx.set_table(table_name, table));
    }

    /// Runs several mutations under one lock and publishes a single change
    /// notification covering all of them.
    pub fn transaction<R>(&self, f: impl FnOnce(&mut Transaction<'_>) -> R) -> R {
        let (result, changed) = {
            let mut tables = self.write();
            let mut tx = Transaction {
                tables: &mut *tables,
                changed: ChangedTables::new(),
            };
            let result = f(&mut tx);
            (result, tx.changed)
        };

        if !changed.is_empty() {
            // No receivers simply means nothing is auto-saving yet.
            let _ = self.changes_tx.send(changed);
        }
        result
    }

    /// Applies content loaded from disk without publishing a change.
    pub fn apply_persisted(&self, changes: TableChanges) {
        let mut tables = self.write();
        match changes {
            TableChanges::Snapshot(incoming) => {
                for (name, rows) in incoming {
                    if rows.is_empty() {
                        tables.remove(&name);
                    } else {
                        tables.insert(name, rows);
                    }
                }
            }
            TableChanges::Delta(incoming) => {
                for (name, rows) in incoming {
                    if rows.is_empty() {
                        continue;
                    }
                    tables.entry(name).or_default().extend(rows);
                }
            }
        }
    }
}

pub struct Transaction<'a> {
    tables: &'a mut Tables,
    changed: ChangedTables,
}

impl Transaction<'_> {
    fn mark(&mut self, table_name: &str, row_id: &str) {
        self.changed
            .entry(table_name.to_string())
            .or_default()
            .insert(row_id.to_string());
    }

    pub fn get_row(&self, table_name: &str, row_id: &str) -> Option<&Row> {
        self.tables.get(table_name)?.get(row_id)
    }

    pub fn set_row(&mut self, table_name: &str, row_id: &str, row: Row) {
        let table = self.tables.entry(table_name.to_string()).or_default();
        if table.get(row_id) == Some(&row) {
            return;
        }
        table.insert(row_id.to_string(), row);
        self.mark(table_name, row_id);
    }

    pub fn set_cell(&mut self, table_name: &str, row_id: &str, cell_id: &str, value: Value) {
        let row = self
            .tables
            .entry(table_name.to_string())
            .or_default()
            .entry(row_id.to_string())
            .or_default();
        if row.get(cell_id) == Some(&value) {
            return;
        }
        row.insert(cell_id.to_string(), value);
        self.mark(table_name, row_id);
    }

    pub fn del_row(&mut self, table_name: &str, row_id: &str) {
        let Some(table) = self.tables.get_mut(table_name) else {
            return;
        };
        if table.remove(row_id).is_none() {
            return;
        }
        if table.is_empty() {
            self.tables.remove(table_name);
        }
        self.mark(table_name, row_id);
    }

    pub fn set_table(&mut self, table_name: &str, table: Table) {
        let previous = self.tables.remove(table_name).unwrap_or_default();
        let touched: Vec<String> = previous
            .iter()
            .filter(|(id, row)| table.get(*id) != Some(*row))
            .map(|(id, _)| id.clone())
            .chain(
                table
                    .iter()
                    .filter(|(id, row)| previous.get(*id) != Some(*row))
                    .map(|(id, _)| id.clone()),
            )
            .collect();

        if !table.is_empty() {
            self.tables.insert(table_name.to_string(), table);
        }
        for row_id in touched {
            self.mark(table_name, &row_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().cloned().expect("object")
    }

    #[test]
    fn transaction_publishes_one_notification_for_all_tables() {
        let store = TableStore::new();
        let mut rx = store.subscribe();

        store.transaction(|tx| {
            tx.set_row("chat_groups", "g1", row(json!({"title": "Standup"})));
            tx.set_row("chat_messages", "m1", row(json!({"chat_group_id": "g1"})));
        });

        let changed = rx.try_recv().expect("one change");
        assert!(changed["chat_groups"].contains("g1"));
        assert!(changed["chat_messages"].contains("m1"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn unchanged_writes_publish_nothing() {
        let store = TableStore::new();
        store.set_row("sessions", "s1", row(json!({"title": "a"})));
        let mut rx = store.subscribe();

        store.set_row("sessions", "s1", row(json!({"title": "a"})));
        store.set_cell("sessions", "s1", "title", json!("a"));
        store.del_row("sessions", "missing");

        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn apply_persisted_is_silent_and_delta_upserts() {
        let store = TableStore::new();
        store.set_row("templates", "t1", row(json!({"title": "old"})));
        store.set_row("templates", "t2", row(json!({"title": "kept"})));
        let mut rx = store.subscribe();

        let mut table = Table::new();
        table.insert("t1".to_string(), row(json!({"title": "new"})));
        store.apply_persisted(TableChanges::delta_for("templates", table));

        assert!(rx.try_recv().is_err());
        assert_eq!(store.get_row("templates", "t1"), Some(row(json!({"title": "new"}))));
        assert!(store.get_row("templates", "t2").is_some());
    }

    #[test]
    fn snapshot_replaces_named_tables_only() {
        let store = TableStore::new();
        store.set_row("chat_groups", "old", row(json!({})));
        store.set_row("sessions", "s1", row(json!({})));

        let mut tables = Tables::new();
        tables.insert(
            "chat_groups".to_string(),
            Table::from([("new".to_string(), row(json!({"title": "x"})))]),
        );
        store.apply_persisted(TableChanges::Snapshot(tables));

        assert!(store.get_row("chat_groups", "old").is_none());
        assert!(store.get_row("chat_groups", "new").is_some());
        assert!(store.get_row("sessions", "s1").is_some());
    }

    #[test]
    fn set_table_marks_added_changed_and_removed_rows() {
        let store = TableStore::new();
        store.set_table(
            "tags",
            Table::from([
                ("a".to_string(), row(json!({"name": "a"}))),
                ("b".to_string(), row(json!({"name": "b"}))),
            ]),
        );
        let mut rx = store.subscribe();

        store.set_table(
            "tags",
            Table::from([
                ("b".to_string(), row(json!({"name": "b"}))),
                ("c".to_string(), row(json!({"name": "c"}))),
            ]),
        );

        let changed = rx.try_recv().expect("change");
        let ids: Vec<&str> = changed["tags"].iter().map(String::as_str).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }
}
