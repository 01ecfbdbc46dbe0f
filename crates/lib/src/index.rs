use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::bloom::BloomFilter;
use crate::object_id::ObjectId;
use crate::payload::DeltaRow;
use crate::schema::TableSchema;
use crate::value::Value;

/// Comparison operator of a qualifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum QualOp {
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
    Ne,
    /// Pattern match; the index can never disprove it.
    Like,
}

impl fmt::Display for QualOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            QualOp::Gt => ">",
            QualOp::Ge => ">=",
            QualOp::Lt => "<",
            QualOp::Le => "<=",
            QualOp::Eq => "=",
            QualOp::Ne => "<>",
            QualOp::Like => "~~",
        })
    }
}

impl FromStr for QualOp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            ">" => QualOp::Gt,
            ">=" => QualOp::Ge,
            "<" => QualOp::Lt,
            "<=" => QualOp::Le,
            "=" | "==" => QualOp::Eq,
            "<>" | "!=" => QualOp::Ne,
            "~~" => QualOp::Like,
            other => return Err(format!("unknown qualifier operator `{other}`")),
        })
    }
}

/// One predicate atom: `(column, op, value)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Qual {
    pub column: String,
    pub op: QualOp,
    pub value: Value,
}

impl Qual {
    pub fn new(column: impl Into<String>, op: QualOp, value: impl Into<Value>) -> Self {
        Qual {
            column: column.into(),
            op,
            value: value.into(),
        }
    }
}

/// Qualifiers in conjunctive normal form: the outer list is ANDed, each
/// inner list is ORed. `[[a, b], [c]]` means `(a OR b) AND c`.
pub type Quals = Vec<Vec<Qual>>;

/// Which columns get bloom filters, and at what target false-positive rate.
#[derive(Clone, Debug, PartialEq)]
pub struct IndexSettings {
    pub bloom_columns: Vec<String>,
    pub bloom_fp_rate: f64,
}

impl Default for IndexSettings {
    fn default() -> Self {
        IndexSettings {
            bloom_columns: Vec::new(),
            bloom_fp_rate: 0.01,
        }
    }
}

impl IndexSettings {
    pub fn with_bloom(columns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        IndexSettings {
            bloom_columns: columns.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }
}

/// The queryable summary of one fragment: per-column min/max ranges and
/// optional bloom filters.
///
/// The index acts as a one-sided test: it may claim a fragment matches a
/// predicate when it does not (false positive), but must never claim a
/// match is impossible when one exists.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectIndex {
    pub range: BTreeMap<String, (Value, Value)>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub bloom: BTreeMap<String, BloomFilter>,
}

impl ObjectIndex {
    /// Summarize a fragment's rows. Non-indexable column types are omitted;
    /// nulls (e.g. the padding of delete rows) never contribute.
    pub fn build(schema: &TableSchema, rows: &[DeltaRow], settings: &IndexSettings) -> Self {
        let mut index = ObjectIndex::default();
        for (position, column) in schema.columns().iter().enumerate() {
            if !column.col_type.is_indexable() {
                continue;
            }
            let mut bounds: Option<(Value, Value)> = None;
            for row in rows {
                let value = match row.values.get(position) {
                    Some(v) if !v.is_null() => v,
                    _ => continue,
                };
                bounds = Some(match bounds {
                    None => (value.clone(), value.clone()),
                    Some((min, max)) => {
                        let min = match value.cmp_typed(&min, column.col_type) {
                            Some(Ordering::Less) => value.clone(),
                            _ => min,
                        };
                        let max = match value.cmp_typed(&max, column.col_type) {
                            Some(Ordering::Greater) => value.clone(),
                            _ => max,
                        };
                        (min, max)
                    }
                });
            }
            if let Some(bounds) = bounds {
                index.range.insert(column.name.clone(), bounds);
            }
            if settings.bloom_columns.iter().any(|c| c == &column.name) {
                let values: Vec<&Value> = rows
                    .iter()
                    .filter_map(|r| r.values.get(position))
                    .filter(|v| !v.is_null())
                    .collect();
                if !values.is_empty() {
                    let mut filter =
                        BloomFilter::with_capacity(values.len(), settings.bloom_fp_rate);
                    for value in values {
                        filter.insert(value.to_string().as_bytes());
                    }
                    index.bloom.insert(column.name.clone(), filter);
                }
            }
        }
        index
    }

    /// Whether the fragment might contain rows satisfying `qual`.
    ///
    /// Columns with no index entry, operators the index cannot reason about
    /// and values that fail to cast to the column type are all satisfiable.
    pub fn may_match_qual(&self, schema: &TableSchema, qual: &Qual) -> bool {
        let Some(column) = schema.column(&qual.column) else {
            return true;
        };
        let ty = column.col_type;
        let range_ok = match self.range.get(&qual.column) {
            None => true,
            Some((min, max)) => {
                let le = |a: &Value, b: &Value| {
                    a.cmp_typed(b, ty).map_or(true, |o| o != Ordering::Greater)
                };
                let lt = |a: &Value, b: &Value| {
                    a.cmp_typed(b, ty).map_or(true, |o| o == Ordering::Less)
                };
                // Defaults to false so an unparseable value leaves `<>` satisfiable.
                let eq = |a: &Value, b: &Value| {
                    a.cmp_typed(b, ty).map_or(false, |o| o == Ordering::Equal)
                };
                match qual.op {
                    // Rows greater than v can only exist if the max is.
                    QualOp::Gt => lt(&qual.value, max),
                    QualOp::Ge => le(&qual.value, max),
                    // And symmetrically for the min.
                    QualOp::Lt => lt(min, &qual.value),
                    QualOp::Le => le(min, &qual.value),
                    QualOp::Eq => le(min, &qual.value) && le(&qual.value, max),
                    QualOp::Ne => !(eq(min, &qual.value) && eq(max, &qual.value)),
                    QualOp::Like => true,
                }
            }
        };
        if !range_ok {
            return false;
        }
        if qual.op == QualOp::Eq {
            if let Some(filter) = self.bloom.get(&qual.column) {
                return filter.contains(qual.value.to_string().as_bytes());
            }
        }
        true
    }

    /// Evaluate a CNF qualifier list against this fragment.
    pub fn may_match(&self, schema: &TableSchema, quals: &Quals) -> bool {
        quals.iter().all(|any_of| {
            any_of.is_empty() || any_of.iter().any(|q| self.may_match_qual(schema, q))
        })
    }
}

/// Keep the candidates whose index cannot disprove `quals`. Objects without
/// an index (e.g. collapsed snapshots) are always kept.
pub fn filter_objects<'a>(
    candidates: impl IntoIterator<Item = (ObjectId, Option<&'a ObjectIndex>)>,
    schema: &TableSchema,
    quals: &Quals,
) -> Vec<ObjectId> {
    candidates
        .into_iter()
        .filter(|(_, index)| index.map_or(true, |i| i.may_match(schema, quals)))
        .map(|(id, _)| id)
        .collect()
}
