//! The write path: conflating a change log into a delta fragment (or a
//! no-op), and snapshotting tables verbatim.

use std::collections::{BTreeMap, HashMap};

use stratadb_lib::{
    DeltaRow, FragmentPayload, IndexSettings, ObjectId, ObjectIndex, Row, TableSchema, Value,
};

use crate::error::{ChangeLogError, Result};
use crate::meta::{MetaStore, ObjectFormat, ObjectMeta, TableKey, TableRef};
use crate::ostorage::ObjectStore;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeAction {
    Insert,
    Delete,
    Update,
}

/// One captured change, in audit-log convention: `row_data` is the new row
/// for inserts and the old row for updates and deletes; `changed_fields`
/// holds the new values of updated columns. `key` lists the change-key
/// values in the schema's change-key column order.
#[derive(Clone, Debug, PartialEq)]
pub struct ChangeEntry {
    pub key: Vec<Value>,
    pub action: ChangeAction,
    pub row_data: HashMap<String, Value>,
    pub changed_fields: HashMap<String, Value>,
}

impl ChangeEntry {
    pub fn insert(key: Vec<Value>, row_data: HashMap<String, Value>) -> Self {
        ChangeEntry {
            key,
            action: ChangeAction::Insert,
            row_data,
            changed_fields: HashMap::new(),
        }
    }

    pub fn delete(key: Vec<Value>, row_data: HashMap<String, Value>) -> Self {
        ChangeEntry {
            key,
            action: ChangeAction::Delete,
            row_data,
            changed_fields: HashMap::new(),
        }
    }

    pub fn update(
        key: Vec<Value>,
        row_data: HashMap<String, Value>,
        changed_fields: HashMap<String, Value>,
    ) -> Self {
        ChangeEntry {
            key,
            action: ChangeAction::Update,
            row_data,
            changed_fields,
        }
    }
}

/// Where pending changes come from (the change-capture collaborator).
pub trait ChangeSource: Send + Sync {
    fn get_pending_changes(&self, schema: &str, table: &str) -> Result<Vec<ChangeEntry>>;
    fn discard_pending_changes(&self, schema: &str, table: &str) -> Result<()>;
}

/// The net effect on one key after conflation.
#[derive(Clone, Debug, PartialEq)]
enum Conflated {
    Insert {
        row: HashMap<String, Value>,
    },
    Update {
        old_row: HashMap<String, Value>,
        fields: HashMap<String, Value>,
    },
    Delete {
        old_row: HashMap<String, Value>,
    },
}

fn key_string(key: &[Value]) -> String {
    let parts: Vec<String> = key.iter().map(|v| v.to_string()).collect();
    format!("({})", parts.join(","))
}

/// An update that moves a row to a new key is recorded as a delete of the
/// old key plus an insert of the new one before conflation.
fn split_key_changing_update(entry: ChangeEntry, key_names: &[&str]) -> Vec<ChangeEntry> {
    if entry.action != ChangeAction::Update {
        return vec![entry];
    }
    if entry.changed_fields.is_empty() {
        // Nothing actually changed.
        return Vec::new();
    }
    let key_changed = entry.changed_fields.keys().any(|c| key_names.contains(&c.as_str()));
    if !key_changed {
        return vec![entry];
    }
    let mut new_row = entry.row_data.clone();
    for (column, value) in &entry.changed_fields {
        new_row.insert(column.clone(), value.clone());
    }
    let new_key: Vec<Value> = key_names
        .iter()
        .map(|name| new_row.get(*name).cloned().unwrap_or(Value::Null))
        .collect();
    vec![
        ChangeEntry::delete(entry.key.clone(), entry.row_data.clone()),
        ChangeEntry::insert(new_key, new_row),
    ]
}

/// Collapse a change log to one net change per key, applying the rules:
/// insert-over-delete becomes an update (dropped when it restores the old
/// row), updates merge, delete-over-insert cancels, delete-over-update
/// deletes. Inserting an existing key or deleting a deleted key means the
/// log is malformed.
fn conflate(
    schema: &TableSchema,
    entries: Vec<ChangeEntry>,
) -> Result<BTreeMap<Vec<Value>, Conflated>, ChangeLogError> {
    let key_names: Vec<&str> = schema.change_key().iter().map(|c| c.name.as_str()).collect();
    let mut changeset: BTreeMap<Vec<Value>, Conflated> = BTreeMap::new();

    for entry in entries
        .into_iter()
        .flat_map(|e| split_key_changing_update(e, &key_names))
    {
        let key = entry.key.clone();
        let prior = changeset.remove(&key);
        let next = match (prior, entry.action) {
            (None, ChangeAction::Insert) => Some(Conflated::Insert { row: entry.row_data }),
            (None, ChangeAction::Delete) => Some(Conflated::Delete { old_row: entry.row_data }),
            (None, ChangeAction::Update) => Some(Conflated::Update {
                old_row: entry.row_data,
                fields: entry.changed_fields,
            }),
            (Some(Conflated::Delete { old_row }), ChangeAction::Insert) => {
                // Re-inserting over a delete is an update; dropping the pair
                // entirely when the row comes back identical.
                let fields: HashMap<String, Value> = entry
                    .row_data
                    .iter()
                    .filter(|(column, value)| old_row.get(*column) != Some(*value))
                    .map(|(c, v)| (c.clone(), v.clone()))
                    .collect();
                if fields.is_empty() {
                    None
                } else {
                    Some(Conflated::Update { old_row, fields })
                }
            }
            (Some(Conflated::Insert { mut row }), ChangeAction::Update) => {
                row.extend(entry.changed_fields);
                Some(Conflated::Insert { row })
            }
            (Some(Conflated::Update { old_row, mut fields }), ChangeAction::Update) => {
                fields.extend(entry.changed_fields);
                Some(Conflated::Update { old_row, fields })
            }
            (Some(Conflated::Insert { .. }), ChangeAction::Delete) => None,
            (Some(Conflated::Update { .. }), ChangeAction::Delete) => {
                Some(Conflated::Delete { old_row: entry.row_data })
            }
            (Some(Conflated::Delete { .. }), ChangeAction::Delete) => {
                return Err(ChangeLogError::DoubleDelete(key_string(&key)));
            }
            (Some(Conflated::Delete { .. }), ChangeAction::Update) => {
                return Err(ChangeLogError::UpdateAfterDelete(key_string(&key)));
            }
            (Some(Conflated::Insert { .. } | Conflated::Update { .. }), ChangeAction::Insert) => {
                return Err(ChangeLogError::DuplicateInsert(key_string(&key)));
            }
        };
        if let Some(next) = next {
            changeset.insert(key, next);
        }
    }
    Ok(changeset)
}

/// Render the conflated changeset as fragment rows: upserts carry the full
/// new row, deletes carry the key columns and nulls elsewhere.
fn build_delta_rows(
    schema: &TableSchema,
    changeset: &BTreeMap<Vec<Value>, Conflated>,
) -> Vec<DeltaRow> {
    let key_positions = schema.change_key_positions();
    let mut rows = Vec::with_capacity(changeset.len());
    for (key, change) in changeset {
        let row = match change {
            Conflated::Insert { row } => {
                DeltaRow::upsert(full_row(schema, row, &HashMap::new()))
            }
            Conflated::Update { old_row, fields } => {
                DeltaRow::upsert(full_row(schema, old_row, fields))
            }
            Conflated::Delete { .. } => {
                let mut values: Row = vec![Value::Null; schema.len()];
                for (value, &position) in key.iter().zip(&key_positions) {
                    values[position] = value.clone();
                }
                DeltaRow::delete(values)
            }
        };
        rows.push(row);
    }
    rows
}

fn full_row(
    schema: &TableSchema,
    base: &HashMap<String, Value>,
    overlay: &HashMap<String, Value>,
) -> Row {
    schema
        .columns()
        .iter()
        .map(|column| {
            overlay
                .get(&column.name)
                .or_else(|| base.get(&column.name))
                .cloned()
                .unwrap_or(Value::Null)
        })
        .collect()
}

/// Flush the pending changes of `old_table` and bind the table at
/// `new_image`: to a fresh delta fragment, or to the prior head when the
/// changes cancel out. Returns the bound object.
pub fn record_table_as_delta(
    meta: &MetaStore,
    store: &dyn ObjectStore,
    source: &dyn ChangeSource,
    old_table: &TableRef,
    new_image: &str,
    settings: &IndexSettings,
) -> Result<ObjectId> {
    let schema_name = old_table.key.schema_name();
    let table_name = &old_table.key.table_name;
    let entries = source.get_pending_changes(&schema_name, table_name)?;
    source.discard_pending_changes(&schema_name, table_name)?;

    let changeset = conflate(&old_table.schema, entries)?;
    let new_key = old_table.key.at_image(new_image);
    if changeset.is_empty() {
        // The log cancelled itself out; the new image sees the old head.
        log::info!("no net changes for {schema_name}/{table_name}, rebinding {}", old_table.object_id);
        meta.register_table(new_key, old_table.schema.clone(), old_table.object_id)?;
        return Ok(old_table.object_id);
    }

    let payload = FragmentPayload::new(build_delta_rows(&old_table.schema, &changeset));
    let bytes = payload.encode()?;
    let object_id = ObjectId::random();
    store.write(&object_id, &bytes)?;
    meta.register_object(ObjectMeta {
        object_id,
        format: ObjectFormat::Diff,
        parent_id: Some(old_table.object_id),
        namespace: old_table.key.namespace.clone(),
        size: bytes.len() as u64,
        index: ObjectIndex::build(&old_table.schema, &payload.rows, settings),
    })?;
    meta.register_table(new_key, old_table.schema.clone(), object_id)?;
    log::info!(
        "recorded {} change(s) to {schema_name}/{table_name} as {object_id}",
        payload.rows.len()
    );
    Ok(object_id)
}

/// Store the full contents of a table as a fresh snapshot fragment and bind
/// it at `key`'s image. A table already bound to a snapshot at that image is
/// left alone.
pub fn record_table_as_snapshot(
    meta: &MetaStore,
    store: &dyn ObjectStore,
    key: TableKey,
    schema: TableSchema,
    rows: Vec<Row>,
    settings: &IndexSettings,
) -> Result<ObjectId> {
    if let Some(existing) = meta.get_table(&key) {
        if meta
            .get_object(&existing.object_id)
            .is_some_and(|m| m.format == ObjectFormat::Snap)
        {
            return Ok(existing.object_id);
        }
    }

    let payload = FragmentPayload::snapshot(rows);
    let bytes = payload.encode()?;
    let object_id = ObjectId::random();
    store.write(&object_id, &bytes)?;
    meta.register_object(ObjectMeta {
        object_id,
        format: ObjectFormat::Snap,
        parent_id: None,
        namespace: key.namespace.clone(),
        size: bytes.len() as u64,
        index: ObjectIndex::build(&schema, &payload.rows, settings),
    })?;
    log::info!("stored table {}/{} as snapshot {object_id}", key.schema_name(), key.table_name);
    meta.register_table(key, schema, object_id)?;
    Ok(object_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use stratadb_lib::{ColumnSchema, ColumnType};

    fn schema() -> TableSchema {
        TableSchema::new(vec![
            ColumnSchema::new(0, "id", ColumnType::Integer, true),
            ColumnSchema::new(1, "name", ColumnType::Text, false),
        ])
    }

    fn row_map(id: i64, name: &str) -> HashMap<String, Value> {
        HashMap::from([
            ("id".to_owned(), Value::Int(id)),
            ("name".to_owned(), Value::Str(name.to_owned())),
        ])
    }

    fn fields(name: &str) -> HashMap<String, Value> {
        HashMap::from([("name".to_owned(), Value::Str(name.to_owned()))])
    }

    fn key(id: i64) -> Vec<Value> {
        vec![Value::Int(id)]
    }

    #[test]
    fn single_changes_pass_through() {
        let changeset = conflate(
            &schema(),
            vec![
                ChangeEntry::insert(key(1), row_map(1, "a")),
                ChangeEntry::delete(key(2), row_map(2, "b")),
                ChangeEntry::update(key(3), row_map(3, "c"), fields("C")),
            ],
        )
        .unwrap();
        assert_eq!(changeset.len(), 3);
        assert_eq!(changeset[&key(1)], Conflated::Insert { row: row_map(1, "a") });
        assert_eq!(changeset[&key(2)], Conflated::Delete { old_row: row_map(2, "b") });
        assert_eq!(
            changeset[&key(3)],
            Conflated::Update { old_row: row_map(3, "c"), fields: fields("C") }
        );
    }

    #[test]
    fn insert_over_delete_becomes_update() {
        let changeset = conflate(
            &schema(),
            vec![
                ChangeEntry::delete(key(1), row_map(1, "a")),
                ChangeEntry::insert(key(1), row_map(1, "z")),
            ],
        )
        .unwrap();
        assert_eq!(
            changeset[&key(1)],
            Conflated::Update { old_row: row_map(1, "a"), fields: fields("z") }
        );
    }

    #[test]
    fn reinsert_of_identical_row_cancels_out() {
        let changeset = conflate(
            &schema(),
            vec![
                ChangeEntry::delete(key(1), row_map(1, "a")),
                ChangeEntry::insert(key(1), row_map(1, "a")),
            ],
        )
        .unwrap();
        assert!(changeset.is_empty());
    }

    #[test]
    fn updates_merge_field_maps() {
        let changeset = conflate(
            &schema(),
            vec![
                ChangeEntry::update(key(1), row_map(1, "a"), fields("b")),
                ChangeEntry::update(key(1), row_map(1, "b"), fields("c")),
            ],
        )
        .unwrap();
        assert_eq!(
            changeset[&key(1)],
            Conflated::Update { old_row: row_map(1, "a"), fields: fields("c") }
        );
    }

    #[test]
    fn update_then_insert_keeps_inserted_row() {
        let changeset = conflate(
            &schema(),
            vec![
                ChangeEntry::insert(key(1), row_map(1, "a")),
                ChangeEntry::update(key(1), row_map(1, "a"), fields("b")),
            ],
        )
        .unwrap();
        assert_eq!(changeset[&key(1)], Conflated::Insert { row: row_map(1, "b") });
    }

    #[test]
    fn delete_cancels_insert_and_supersedes_update() {
        let changeset = conflate(
            &schema(),
            vec![
                ChangeEntry::insert(key(1), row_map(1, "a")),
                ChangeEntry::delete(key(1), row_map(1, "a")),
                ChangeEntry::update(key(2), row_map(2, "b"), fields("B")),
                ChangeEntry::delete(key(2), row_map(2, "B")),
            ],
        )
        .unwrap();
        assert!(!changeset.contains_key(&key(1)));
        assert_eq!(changeset[&key(2)], Conflated::Delete { old_row: row_map(2, "B") });
    }

    #[test]
    fn malformed_logs_are_rejected() {
        let err = conflate(
            &schema(),
            vec![
                ChangeEntry::insert(key(1), row_map(1, "a")),
                ChangeEntry::insert(key(1), row_map(1, "b")),
            ],
        )
        .unwrap_err();
        assert_eq!(err, ChangeLogError::DuplicateInsert("(1)".into()));

        let err = conflate(
            &schema(),
            vec![
                ChangeEntry::delete(key(1), row_map(1, "a")),
                ChangeEntry::delete(key(1), row_map(1, "a")),
            ],
        )
        .unwrap_err();
        assert_eq!(err, ChangeLogError::DoubleDelete("(1)".into()));
    }

    #[test]
    fn key_changing_update_splits_into_delete_plus_insert() {
        let changed = HashMap::from([("id".to_owned(), Value::Int(9))]);
        let changeset = conflate(
            &schema(),
            vec![ChangeEntry::update(key(1), row_map(1, "a"), changed)],
        )
        .unwrap();
        assert_eq!(changeset[&key(1)], Conflated::Delete { old_row: row_map(1, "a") });
        assert_eq!(changeset[&key(9)], Conflated::Insert { row: row_map(9, "a") });
    }

    #[test]
    fn empty_update_is_dropped() {
        let changeset = conflate(
            &schema(),
            vec![ChangeEntry::update(key(1), row_map(1, "a"), HashMap::new())],
        )
        .unwrap();
        assert!(changeset.is_empty());
    }

    #[test]
    fn delta_rows_pad_deletes_with_nulls() {
        let changeset = conflate(
            &schema(),
            vec![
                ChangeEntry::delete(key(1), row_map(1, "a")),
                ChangeEntry::update(key(2), row_map(2, "b"), fields("B")),
            ],
        )
        .unwrap();
        let rows = build_delta_rows(&schema(), &changeset);
        assert_eq!(
            rows,
            vec![
                DeltaRow::delete(vec![Value::Int(1), Value::Null]),
                DeltaRow::upsert(vec![Value::Int(2), "B".into()]),
            ]
        );
    }

    mod properties {
        use super::*;
        use crate::apply::StagingTable;
        use proptest::prelude::*;
        use stratadb_lib::FragmentPayload;

        /// A model table state and a valid audit log over it.
        fn arbitrary_log() -> impl Strategy<Value = (Vec<(i64, String)>, Vec<ChangeEntry>)> {
            let base = proptest::collection::btree_map(0i64..8, "[a-d]{1,3}", 0..6);
            (base, proptest::collection::vec((0i64..8, 0u8..3, "[a-d]{1,3}"), 0..12)).prop_map(
                |(base, ops)| {
                    let mut state: std::collections::BTreeMap<i64, String> = base.clone();
                    let mut log = Vec::new();
                    for (id, op, text) in ops {
                        match state.get(&id).cloned() {
                            None if op == 0 => {
                                state.insert(id, text.clone());
                                log.push(ChangeEntry::insert(key(id), row_map(id, &text)));
                            }
                            Some(old) if op == 1 => {
                                state.remove(&id);
                                log.push(ChangeEntry::delete(key(id), row_map(id, &old)));
                            }
                            Some(old) if op == 2 => {
                                state.insert(id, text.clone());
                                log.push(ChangeEntry::update(
                                    key(id),
                                    row_map(id, &old),
                                    fields(&text),
                                ));
                            }
                            _ => (),
                        }
                    }
                    (base.into_iter().collect(), log)
                },
            )
        }

        proptest! {
            /// Conflating the same log twice yields byte-identical payloads.
            #[test]
            fn conflation_is_deterministic((_, log) in arbitrary_log()) {
                let a = conflate(&schema(), log.clone()).unwrap();
                let b = conflate(&schema(), log).unwrap();
                let bytes_a = FragmentPayload::new(build_delta_rows(&schema(), &a)).encode().unwrap();
                let bytes_b = FragmentPayload::new(build_delta_rows(&schema(), &b)).encode().unwrap();
                prop_assert_eq!(bytes_a, bytes_b);
            }

            /// Applying the conflated fragment equals replaying the raw log.
            #[test]
            fn conflation_preserves_final_state((base, log) in arbitrary_log()) {
                let mut direct: std::collections::BTreeMap<i64, String> =
                    base.iter().cloned().collect();
                for entry in &log {
                    let &Value::Int(id) = &entry.key[0] else { unreachable!() };
                    match entry.action {
                        ChangeAction::Insert | ChangeAction::Update => {
                            let mut row = entry.row_data.clone();
                            row.extend(entry.changed_fields.clone());
                            let Some(Value::Str(name)) = row.get("name").cloned() else {
                                unreachable!()
                            };
                            direct.insert(id, name);
                        }
                        ChangeAction::Delete => {
                            direct.remove(&id);
                        }
                    }
                }

                let mut staging = StagingTable::new(schema());
                staging.apply_fragment(&FragmentPayload::snapshot(
                    base.iter().map(|(id, name)| vec![Value::Int(*id), name.as_str().into()]),
                ));
                let changeset = conflate(&schema(), log).unwrap();
                staging.apply_fragment(&FragmentPayload::new(
                    build_delta_rows(&schema(), &changeset),
                ));

                let expected: Vec<Vec<Value>> = direct
                    .into_iter()
                    .map(|(id, name)| vec![Value::Int(id), name.into()])
                    .collect();
                prop_assert_eq!(staging.into_rows(), expected);
            }
        }
    }
}
