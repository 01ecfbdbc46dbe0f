//! Deterministic application of delta fragments onto a staging table.

use std::collections::BTreeMap;

use stratadb_lib::{DeltaRow, FragmentPayload, Row, TableSchema, Value};

/// An in-memory materialization target, keyed by the table's logical
/// primary key (the whole tuple when none is declared).
#[derive(Clone, Debug)]
pub struct StagingTable {
    schema: TableSchema,
    key_positions: Vec<usize>,
    rows: BTreeMap<Vec<Value>, Row>,
}

impl StagingTable {
    pub fn new(schema: TableSchema) -> Self {
        let key_positions = schema.change_key_positions();
        StagingTable {
            schema,
            key_positions,
            rows: BTreeMap::new(),
        }
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    fn key_of(&self, row: &[Value]) -> Vec<Value> {
        self.key_positions
            .iter()
            .map(|&i| row.get(i).cloned().unwrap_or(Value::Null))
            .collect()
    }

    /// Merge one fragment: first delete every row whose key the fragment
    /// mentions (covering updates and deletes alike), then insert the
    /// upsert rows. Row order within a fragment does not matter because the
    /// write path conflates to one change per key.
    pub fn apply_fragment(&mut self, fragment: &FragmentPayload) {
        for row in &fragment.rows {
            self.rows.remove(&self.key_of(&row.values));
        }
        for row in &fragment.rows {
            if row.upsert {
                self.rows
                    .insert(self.key_of(&row.values), row.values.clone());
            }
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows in key order.
    pub fn rows(&self) -> impl Iterator<Item = &Row> {
        self.rows.values()
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows.into_values().collect()
    }

    /// The table as an all-upsert fragment (used to collapse a chain into a
    /// snapshot).
    pub fn to_snapshot_rows(&self) -> Vec<DeltaRow> {
        self.rows.values().cloned().map(DeltaRow::upsert).collect()
    }
}

/// Fold payloads into a fresh staging table, snapshot first, oldest delta to
/// newest.
pub fn materialize(
    schema: &TableSchema,
    payloads: impl IntoIterator<Item = FragmentPayload>,
) -> StagingTable {
    let mut staging = StagingTable::new(schema.clone());
    for payload in payloads {
        staging.apply_fragment(&payload);
    }
    staging
}
