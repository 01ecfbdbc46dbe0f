use serde::ser::SerializeSeq;
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;

use crate::value::{Row, Value};

/// One row of a fragment payload: the upsert/delete flag followed by all
/// declared columns, in ordinal order.
///
/// Delete rows carry the change-key columns; the remaining columns are null.
/// Serialized as a flat JSON array with the flag first.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(try_from = "Vec<Value>")]
pub struct DeltaRow {
    pub upsert: bool,
    pub values: Row,
}

impl DeltaRow {
    pub fn upsert(values: Row) -> Self {
        DeltaRow {
            upsert: true,
            values,
        }
    }

    pub fn delete(values: Row) -> Self {
        DeltaRow {
            upsert: false,
            values,
        }
    }
}

impl Serialize for DeltaRow {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.values.len() + 1))?;
        seq.serialize_element(&self.upsert)?;
        for value in &self.values {
            seq.serialize_element(value)?;
        }
        seq.end()
    }
}

impl TryFrom<Vec<Value>> for DeltaRow {
    type Error = String;

    fn try_from(mut row: Vec<Value>) -> Result<Self, Self::Error> {
        if row.is_empty() {
            return Err("empty fragment row".into());
        }
        let values = row.split_off(1);
        match row.pop() {
            Some(Value::Bool(upsert)) => Ok(DeltaRow { upsert, values }),
            other => Err(format!("fragment row must start with a flag, got {other:?}")),
        }
    }
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("failed to decode fragment payload: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("failed to encode fragment payload: {0}")]
    Encode(#[source] serde_json::Error),
}

/// The byte payload of a fragment.
///
/// Snapshots are all-upsert payloads; applying one to an empty staging table
/// reproduces the table verbatim.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FragmentPayload {
    pub rows: Vec<DeltaRow>,
}

impl FragmentPayload {
    pub fn new(rows: Vec<DeltaRow>) -> Self {
        FragmentPayload { rows }
    }

    pub fn snapshot(rows: impl IntoIterator<Item = Row>) -> Self {
        FragmentPayload {
            rows: rows.into_iter().map(DeltaRow::upsert).collect(),
        }
    }

    /// Deterministic for a given row order, so identical change sets encode
    /// to identical bytes.
    pub fn encode(&self) -> Result<Vec<u8>, PayloadError> {
        serde_json::to_vec(self).map_err(PayloadError::Encode)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, PayloadError> {
        serde_json::from_slice(bytes).map_err(PayloadError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn flag_leads_each_row() {
        let payload = FragmentPayload::new(vec![
            DeltaRow::upsert(vec![Value::Int(3), Value::Str("c".into())]),
            DeltaRow::delete(vec![Value::Int(1), Value::Null]),
        ]);
        let json = String::from_utf8(payload.encode().unwrap()).unwrap();
        assert_eq!(json, r#"{"rows":[[true,3,"c"],[false,1,null]]}"#);
        assert_eq!(FragmentPayload::decode(json.as_bytes()).unwrap(), payload);
    }

    #[test]
    fn decode_rejects_flagless_rows() {
        assert!(FragmentPayload::decode(br#"{"rows":[[1,"a"]]}"#).is_err());
        assert!(FragmentPayload::decode(br#"{"rows":[[]]}"#).is_err());
    }

    #[test]
    fn snapshot_rows_are_upserts() {
        let payload = FragmentPayload::snapshot(vec![vec![Value::Int(1)], vec![Value::Int(2)]]);
        assert!(payload.rows.iter().all(|r| r.upsert));
    }
}
