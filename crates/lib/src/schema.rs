use serde::{Deserialize, Serialize};

/// Declared type of a table column.
///
/// The portable forms of `Numeric`, `Date`, `Time` and `Timestamp` values are
/// strings (see [`crate::value::Value`]); the column type decides how index
/// comparisons interpret them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Boolean,
    Integer,
    Real,
    Numeric,
    Text,
    Date,
    Time,
    Timestamp,
    Json,
}

impl ColumnType {
    /// Whether min/max range indexing is meaningful for this type.
    pub fn is_indexable(self) -> bool {
        !matches!(self, ColumnType::Boolean | ColumnType::Json)
    }
}

/// One column of a table schema: `(ordinal, name, type, is_pk)`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub ordinal: u32,
    pub name: String,
    pub col_type: ColumnType,
    pub is_pk: bool,
}

impl ColumnSchema {
    pub fn new(ordinal: u32, name: impl Into<String>, col_type: ColumnType, is_pk: bool) -> Self {
        ColumnSchema {
            ordinal,
            name: name.into(),
            col_type,
            is_pk,
        }
    }
}

/// Full schema of a table, ordered by ordinal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema(Vec<ColumnSchema>);

impl TableSchema {
    pub fn new(mut columns: Vec<ColumnSchema>) -> Self {
        columns.sort_by_key(|c| c.ordinal);
        TableSchema(columns)
    }

    pub fn columns(&self) -> &[ColumnSchema] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.0.iter().find(|c| c.name == name)
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.0.iter().position(|c| c.name == name)
    }

    /// Columns forming the logical change key: the declared primary key, or
    /// the whole tuple when the table has none.
    pub fn change_key(&self) -> Vec<&ColumnSchema> {
        let pks: Vec<_> = self.0.iter().filter(|c| c.is_pk).collect();
        if pks.is_empty() {
            self.0.iter().collect()
        } else {
            pks
        }
    }

    /// Positions of the change-key columns within the row tuple.
    pub fn change_key_positions(&self) -> Vec<usize> {
        let key: Vec<&str> = self.change_key().iter().map(|c| c.name.as_str()).collect();
        self.0
            .iter()
            .enumerate()
            .filter(|(_, c)| key.contains(&c.name.as_str()))
            .map(|(i, _)| i)
            .collect()
    }

    pub fn has_declared_pk(&self) -> bool {
        self.0.iter().any(|c| c.is_pk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> TableSchema {
        TableSchema::new(vec![
            ColumnSchema::new(1, "name", ColumnType::Text, false),
            ColumnSchema::new(0, "id", ColumnType::Integer, true),
        ])
    }

    #[test]
    fn columns_sorted_by_ordinal() {
        let s = schema();
        assert_eq!(s.columns()[0].name, "id");
        assert_eq!(s.columns()[1].name, "name");
    }

    #[test]
    fn change_key_is_pk() {
        let s = schema();
        assert_eq!(s.change_key_positions(), vec![0]);
    }

    #[test]
    fn change_key_falls_back_to_whole_tuple() {
        let s = TableSchema::new(vec![
            ColumnSchema::new(0, "a", ColumnType::Integer, false),
            ColumnSchema::new(1, "b", ColumnType::Text, false),
        ]);
        assert!(!s.has_declared_pk());
        assert_eq!(s.change_key_positions(), vec![0, 1]);
    }
}
