//! Row/column table abstraction.
//!
//! The object store keeps three tables: object rows keyed by UUID, the
//! FQN index keyed by type, and the user-agent K/V table. The trait
//! mirrors a wide-column store: batched mutations across rows and
//! tables apply atomically.

use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::error::StoreError;

/// Identifies one of the control-plane tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TableId {
    /// `obj_uuid_table` — rows keyed by object UUID.
    ObjUuid,
    /// `obj_fq_name_table` — rows keyed by resource type.
    ObjFqName,
    /// `useragent_keyval_table` — opaque adapter K/V.
    UserAgent,
}

/// A single mutation in an atomic batch.
#[derive(Clone, Debug)]
pub enum RowOp {
    /// Insert or overwrite a column.
    Put {
        /// Target table.
        table: TableId,
        /// Row key.
        row: String,
        /// Column name.
        column: String,
        /// Column value.
        value: String,
    },
    /// Remove a column if present.
    Delete {
        /// Target table.
        table: TableId,
        /// Row key.
        row: String,
        /// Column name.
        column: String,
    },
    /// Remove an entire row.
    DeleteRow {
        /// Target table.
        table: TableId,
        /// Row key.
        row: String,
    },
}

/// Wide-column table access.
pub trait ObjectTable: Send + Sync {
    /// Reads every column of a row. Returns None if the row is absent.
    fn get_row(&self, table: TableId, row: &str) -> Result<Option<BTreeMap<String, String>>, StoreError>;

    /// Reads one column of a row.
    fn get_column(&self, table: TableId, row: &str, column: &str) -> Result<Option<String>, StoreError>;

    /// Reads all columns of a row whose names start with `prefix`,
    /// in column order.
    fn get_columns_prefixed(
        &self,
        table: TableId,
        row: &str,
        prefix: &str,
    ) -> Result<Vec<(String, String)>, StoreError>;

    /// Lists row keys of a table, sorted, optionally starting after
    /// `start` and bounded by `limit`.
    fn row_keys(
        &self,
        table: TableId,
        start: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<String>, StoreError>;

    /// Applies a batch of mutations atomically.
    fn write_batch(&self, ops: Vec<RowOp>) -> Result<(), StoreError>;
}

/// In-memory `ObjectTable`. Thread-safe via RwLock.
pub struct MemoryObjectTable {
    tables: RwLock<BTreeMap<TableId, BTreeMap<String, BTreeMap<String, String>>>>,
}

impl MemoryObjectTable {
    /// Creates an empty table set.
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(BTreeMap::new()),
        }
    }
}

impl Default for MemoryObjectTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectTable for MemoryObjectTable {
    fn get_row(
        &self,
        table: TableId,
        row: &str,
    ) -> Result<Option<BTreeMap<String, String>>, StoreError> {
        let tables = self.tables.read().expect("lock poisoned");
        Ok(tables.get(&table).and_then(|t| t.get(row)).cloned())
    }

    fn get_column(
        &self,
        table: TableId,
        row: &str,
        column: &str,
    ) -> Result<Option<String>, StoreError> {
        let tables = self.tables.read().expect("lock poisoned");
        Ok(tables
            .get(&table)
            .and_then(|t| t.get(row))
            .and_then(|r| r.get(column))
            .cloned())
    }

    fn get_columns_prefixed(
        &self,
        table: TableId,
        row: &str,
        prefix: &str,
    ) -> Result<Vec<(String, String)>, StoreError> {
        let tables = self.tables.read().expect("lock poisoned");
        let mut out = Vec::new();
        if let Some(r) = tables.get(&table).and_then(|t| t.get(row)) {
            for (k, v) in r.range(prefix.to_string()..) {
                if !k.starts_with(prefix) {
                    break;
                }
                out.push((k.clone(), v.clone()));
            }
        }
        Ok(out)
    }

    fn row_keys(
        &self,
        table: TableId,
        start: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<String>, StoreError> {
        let tables = self.tables.read().expect("lock poisoned");
        let mut out = Vec::new();
        if let Some(t) = tables.get(&table) {
            let iter: Box<dyn Iterator<Item = &String>> = match start {
                Some(s) => Box::new(
                    t.range(s.to_string()..)
                        .map(|(k, _)| k)
                        .filter(move |k| k.as_str() != s),
                ),
                None => Box::new(t.keys()),
            };
            for k in iter {
                out.push(k.clone());
                if limit.is_some_and(|l| out.len() >= l) {
                    break;
                }
            }
        }
        Ok(out)
    }

    fn write_batch(&self, ops: Vec<RowOp>) -> Result<(), StoreError> {
        let mut tables = self.tables.write().expect("lock poisoned");
        for op in ops {
            match op {
                RowOp::Put {
                    table,
                    row,
                    column,
                    value,
                } => {
                    tables
                        .entry(table)
                        .or_default()
                        .entry(row)
                        .or_default()
                        .insert(column, value);
                }
                RowOp::Delete { table, row, column } => {
                    if let Some(r) = tables.get_mut(&table).and_then(|t| t.get_mut(&row)) {
                        r.remove(&column);
                    }
                }
                RowOp::DeleteRow { table, row } => {
                    if let Some(t) = tables.get_mut(&table) {
                        t.remove(&row);
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(table: TableId, row: &str, column: &str, value: &str) -> RowOp {
        RowOp::Put {
            table,
            row: row.to_string(),
            column: column.to_string(),
            value: value.to_string(),
        }
    }

    #[test]
    fn test_batch_put_get() {
        let t = MemoryObjectTable::new();
        t.write_batch(vec![
            put(TableId::ObjUuid, "u1", "type", "\"virtual-network\""),
            put(TableId::ObjUuid, "u1", "prop:display_name", "\"vn1\""),
        ])
        .unwrap();
        let row = t.get_row(TableId::ObjUuid, "u1").unwrap().unwrap();
        assert_eq!(row.len(), 2);
        assert_eq!(
            t.get_column(TableId::ObjUuid, "u1", "type").unwrap(),
            Some("\"virtual-network\"".to_string())
        );
    }

    #[test]
    fn test_prefix_scan() {
        let t = MemoryObjectTable::new();
        t.write_batch(vec![
            put(TableId::ObjUuid, "u1", "ref:a:x", "{}"),
            put(TableId::ObjUuid, "u1", "ref:b:y", "{}"),
            put(TableId::ObjUuid, "u1", "backref:c:z", "{}"),
        ])
        .unwrap();
        let refs = t.get_columns_prefixed(TableId::ObjUuid, "u1", "ref:").unwrap();
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].0, "ref:a:x");
    }

    #[test]
    fn test_delete_column_and_row() {
        let t = MemoryObjectTable::new();
        t.write_batch(vec![
            put(TableId::ObjUuid, "u1", "a", "1"),
            put(TableId::ObjUuid, "u1", "b", "2"),
        ])
        .unwrap();
        t.write_batch(vec![RowOp::Delete {
            table: TableId::ObjUuid,
            row: "u1".to_string(),
            column: "a".to_string(),
        }])
        .unwrap();
        assert!(t.get_column(TableId::ObjUuid, "u1", "a").unwrap().is_none());
        t.write_batch(vec![RowOp::DeleteRow {
            table: TableId::ObjUuid,
            row: "u1".to_string(),
        }])
        .unwrap();
        assert!(t.get_row(TableId::ObjUuid, "u1").unwrap().is_none());
    }

    #[test]
    fn test_row_keys_pagination() {
        let t = MemoryObjectTable::new();
        for key in ["a", "b", "c", "d"] {
            t.write_batch(vec![put(TableId::ObjUuid, key, "type", "\"x\"")])
                .unwrap();
        }
        assert_eq!(t.row_keys(TableId::ObjUuid, None, Some(2)).unwrap(), vec!["a", "b"]);
        assert_eq!(
            t.row_keys(TableId::ObjUuid, Some("b"), None).unwrap(),
            vec!["c", "d"]
        );
    }

    #[test]
    fn test_tables_independent() {
        let t = MemoryObjectTable::new();
        t.write_batch(vec![put(TableId::UserAgent, "k", "value", "v")])
            .unwrap();
        assert!(t.get_row(TableId::ObjUuid, "k").unwrap().is_none());
        assert!(t.get_row(TableId::UserAgent, "k").unwrap().is_some());
    }
}
