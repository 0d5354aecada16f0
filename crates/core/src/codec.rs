use std::collections::BTreeMap;
use std::io::{Read, Write};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Reserved key marking an entry as a columnar batch. Its value is the list
/// of column names in the order the columns were encoded; every other key in
/// the entry map is itself a column (a list of the column's N values). Its
/// presence disambiguates a columnar batch from a row whose fields all
/// happen to be equal-length lists (see module docs for the structural
/// ambiguity this resolves).
const COLS_KEY: &str = "__cols";

/// One logical sample decoded from the append log, in write order.
#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    pub data: BTreeMap<String, Value>,
}

impl Sample {
    pub fn ts(&self) -> Option<f64> {
        self.data.get("_ts").and_then(Value::as_f64)
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum ColumnOrNames {
    Names(Vec<String>),
    Values(Vec<Value>),
}

/// Encode a single sample as a row entry and append it to `w`.
pub fn encode_row(w: &mut impl Write, sample: &BTreeMap<String, Value>) -> Result<()> {
    rmp_serde::encode::write_named(w, sample).map_err(|e| Error::serialization("track row", "<stream>", e))
}

/// Encode `samples` as one columnar batch and append it to `w`.
///
/// All samples must share the same length N > 0. Missing fields in a given
/// row are encoded as `null` in that row's column slot.
pub fn encode_columnar(w: &mut impl Write, samples: &[BTreeMap<String, Value>]) -> Result<()> {
    assert!(!samples.is_empty(), "columnar batch must be non-empty");

    let mut names: Vec<String> = Vec::new();
    for s in samples {
        for k in s.keys() {
            if !names.contains(k) {
                names.push(k.clone());
            }
        }
    }

    let mut entry: BTreeMap<String, ColumnOrNames> = BTreeMap::new();
    entry.insert(COLS_KEY.to_string(), ColumnOrNames::Names(names.clone()));
    for name in &names {
        let column: Vec<Value> = samples.iter().map(|s| s.get(name).cloned().unwrap_or(Value::Null)).collect();
        entry.insert(name.clone(), ColumnOrNames::Values(column));
    }

    rmp_serde::encode::write_named(w, &entry).map_err(|e| Error::serialization("track columnar batch", "<stream>", e))
}

/// Decode every entry in `r`, expanding columnar batches into their
/// constituent rows, and return the samples in write order.
pub fn decode_all(r: &mut impl Read) -> Result<Vec<Sample>> {
    let mut bytes = Vec::new();
    r.read_to_end(&mut bytes).map_err(|e| Error::storage_io("<stream>", e))?;

    let mut cursor = std::io::Cursor::new(&bytes[..]);
    let mut out = Vec::new();
    let len = bytes.len() as u64;
    while cursor.position() < len {
        let mut de = rmp_serde::Deserializer::new(&mut cursor);
        let value: Value = Deserialize::deserialize(&mut de)
            .map_err(|e| Error::serialization("track entry", "<stream>", e))?;
        out.extend(decode_entry(value)?);
    }
    Ok(out)
}

fn decode_entry(v: Value) -> Result<Vec<Sample>> {
    let obj = v.as_object().ok_or_else(|| Error::serialization("track entry", "<stream>", DecodeShapeError))?;

    if let Some(names_val) = obj.get(COLS_KEY) {
        let names: Vec<String> = names_val
            .as_array()
            .ok_or_else(|| Error::serialization("track entry", "<stream>", DecodeShapeError))?
            .iter()
            .map(|n| n.as_str().unwrap_or_default().to_string())
            .collect();

        let n = names
            .iter()
            .filter_map(|name| obj.get(name).and_then(Value::as_array).map(Vec::len))
            .max()
            .unwrap_or(0);

        let mut rows = Vec::with_capacity(n);
        for i in 0..n {
            let mut row = BTreeMap::new();
            for name in &names {
                if let Some(col) = obj.get(name).and_then(Value::as_array) {
                    row.insert(name.clone(), col.get(i).cloned().unwrap_or(Value::Null));
                }
            }
            rows.push(Sample { data: row });
        }
        Ok(rows)
    } else {
        let row: BTreeMap<String, Value> = obj.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        Ok(vec![Sample { data: row }])
    }
}

#[derive(Debug)]
struct DecodeShapeError;

impl std::fmt::Display for DecodeShapeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "entry was not a map of string keys")
    }
}

impl std::error::Error for DecodeShapeError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn row_round_trip() {
        let mut buf = Vec::new();
        let a = row(&[("v", Value::from(1)), ("_ts", Value::from(1.0))]);
        let b = row(&[("v", Value::from(2)), ("_ts", Value::from(2.0))]);
        encode_row(&mut buf, &a).unwrap();
        encode_row(&mut buf, &b).unwrap();

        let decoded = decode_all(&mut std::io::Cursor::new(buf)).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].data, a);
        assert_eq!(decoded[1].data, b);
    }

    #[test]
    fn columnar_round_trip() {
        let mut buf = Vec::new();
        let samples = vec![
            row(&[("v", Value::from(1)), ("_ts", Value::from(1.0))]),
            row(&[("v", Value::from(2)), ("_ts", Value::from(2.0))]),
            row(&[("v", Value::from(3)), ("_ts", Value::from(3.0))]),
        ];
        encode_columnar(&mut buf, &samples).unwrap();

        let decoded = decode_all(&mut std::io::Cursor::new(buf)).unwrap();
        assert_eq!(decoded.len(), 3);
        for (got, want) in decoded.iter().zip(samples.iter()) {
            assert_eq!(&got.data, want);
        }
    }

    #[test]
    fn columnar_missing_fields_become_null() {
        let mut buf = Vec::new();
        let samples = vec![row(&[("a", Value::from(1))]), row(&[("b", Value::from(2))])];
        encode_columnar(&mut buf, &samples).unwrap();

        let decoded = decode_all(&mut std::io::Cursor::new(buf)).unwrap();
        assert_eq!(decoded[0].data.get("b"), Some(&Value::Null));
        assert_eq!(decoded[1].data.get("a"), Some(&Value::Null));
    }

    #[test]
    fn row_all_equal_length_lists_is_not_mistaken_for_columnar() {
        // Every field happens to be a length-2 list: without the __cols
        // sentinel this would be structurally indistinguishable from a
        // columnar batch of 2 rows.
        let mut buf = Vec::new();
        let tricky = row(&[
            ("q", Value::Array(vec![Value::from(1), Value::from(2)])),
            ("_ts", Value::from(1.0)),
        ]);
        encode_row(&mut buf, &tricky).unwrap();

        let decoded = decode_all(&mut std::io::Cursor::new(buf)).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].data, tricky);
    }

    #[test]
    fn mixed_stream_preserves_write_order() {
        let mut buf = Vec::new();
        let batch = vec![row(&[("v", Value::from(1))]), row(&[("v", Value::from(2))])];
        encode_columnar(&mut buf, &batch).unwrap();
        let single = row(&[("v", Value::from(3))]);
        encode_row(&mut buf, &single).unwrap();

        let decoded = decode_all(&mut std::io::Cursor::new(buf)).unwrap();
        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded[2].data, single);
    }
}
