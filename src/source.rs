use crate::error::SyncError;
use crate::models::{normalize_key, DividendEntry, PricePoint, Record, SourcedRecord};
use async_trait::async_trait;
use log::warn;
use serde_json::{Map, Value};

/// A lazy, finite sequence of records handed out in chunks.
///
/// Sources are restartable: each implementation can be constructed at a source
/// offset, and `position` reports the offset of the next record it will yield.
#[async_trait]
pub trait RecordSource: Send {
    fn describe(&self) -> String;

    fn position(&self) -> u64;

    /// Next chunk of records, or `None` once the source is exhausted.
    async fn next_chunk(&mut self) -> Result<Option<Vec<SourcedRecord>>, SyncError>;
}

#[path = "sources/file.rs"]
pub mod file;

pub use file::FileSource;

#[path = "sources/table.rs"]
pub mod table;

pub use table::TableSource;

#[path = "sources/api.rs"]
pub mod api;

pub use api::ApiSource;

#[path = "sources/provider.rs"]
pub mod provider;

pub use provider::ProviderSource;

/// Records already in memory.
pub struct VecSource {
    records: Vec<Record>,
    chunk_size: usize,
    position: u64,
}

impl VecSource {
    pub fn new(records: Vec<Record>, chunk_size: usize) -> Self {
        Self {
            records,
            chunk_size: chunk_size.max(1),
            position: 0,
        }
    }

    pub fn starting_at(mut self, offset: u64) -> Self {
        self.position = offset;
        self
    }
}

#[async_trait]
impl RecordSource for VecSource {
    fn describe(&self) -> String {
        format!("{} in-memory record(s)", self.records.len())
    }

    fn position(&self) -> u64 {
        self.position
    }

    async fn next_chunk(&mut self) -> Result<Option<Vec<SourcedRecord>>, SyncError> {
        let start = self.position as usize;
        if start >= self.records.len() {
            return Ok(None);
        }
        let end = (start + self.chunk_size).min(self.records.len());
        let chunk = self.records[start..end]
            .iter()
            .enumerate()
            .map(|(idx, record)| SourcedRecord {
                offset: (start + idx) as u64,
                record: record.clone(),
            })
            .collect();
        self.position = end as u64;
        Ok(Some(chunk))
    }
}

/// Builds a record from a flat JSON object: `key_field` becomes the key,
/// `prices`/`dividends` arrays become history, everything else becomes fields.
pub fn record_from_object(mut object: Map<String, Value>, key_field: &str) -> Option<Record> {
    let key = match object.remove(key_field)? {
        Value::String(value) => normalize_key(&value)?,
        Value::Number(value) => value.to_string(),
        _ => return None,
    };

    let prices = take_history::<PricePoint>(&mut object, "prices", &key);
    let dividends = take_history::<DividendEntry>(&mut object, "dividends", &key);

    Some(Record {
        key,
        fields: object.into_iter().collect(),
        prices,
        dividends,
    })
}

fn take_history<T: serde::de::DeserializeOwned>(
    object: &mut Map<String, Value>,
    name: &str,
    key: &str,
) -> Vec<T> {
    let Some(value) = object.remove(name) else {
        return Vec::new();
    };
    match serde_json::from_value::<Vec<T>>(value) {
        Ok(entries) => entries,
        Err(err) => {
            warn!("Ignoring malformed {} for {}: {}", name, key, err);
            Vec::new()
        }
    }
}

/// Parses a flat-file cell into the narrowest JSON value.
pub fn parse_cell(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("null") || trimmed == "NaN" {
        return Value::Null;
    }
    if let Ok(value) = trimmed.parse::<i64>() {
        return Value::from(value);
    }
    if let Ok(value) = trimmed.parse::<f64>() {
        if value.is_finite() {
            return Value::from(value);
        }
    }
    match trimmed.to_ascii_lowercase().as_str() {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::String(trimmed.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn vec_source_resumes_from_offset() {
        let records: Vec<Record> = ["A", "B", "C", "D", "E"]
            .iter()
            .map(|key| Record::new(key).expect("valid key"))
            .collect();
        let mut source = VecSource::new(records, 2).starting_at(3);

        let chunk = source.next_chunk().await.expect("chunk").expect("records");
        let offsets: Vec<u64> = chunk.iter().map(|item| item.offset).collect();
        assert_eq!(offsets, vec![3, 4]);
        assert_eq!(chunk[0].record.key, "D");
        assert!(source.next_chunk().await.expect("end").is_none());
        assert_eq!(source.position(), 5);
    }

    #[test]
    fn flat_object_splits_key_fields_and_history() {
        let object = json!({
            "symbol": " vti ",
            "name": "Vanguard Total Stock Market",
            "expense_ratio": 0.03,
            "prices": [{"date": "2024-01-02", "close": 236.5}],
            "dividends": [{"ex_date": "2023-12-21", "amount": 1.0}]
        });
        let Value::Object(map) = object else {
            panic!("object expected");
        };

        let record = record_from_object(map, "symbol").expect("record");
        assert_eq!(record.key, "VTI");
        assert_eq!(record.fields.len(), 2);
        assert_eq!(record.prices.len(), 1);
        assert_eq!(record.dividends[0].amount, 1.0);
    }

    #[test]
    fn object_without_key_is_rejected() {
        let Value::Object(map) = json!({"name": "orphan"}) else {
            panic!("object expected");
        };
        assert!(record_from_object(map, "symbol").is_none());
    }

    #[test]
    fn cells_parse_to_narrowest_type() {
        assert_eq!(parse_cell("42"), json!(42));
        assert_eq!(parse_cell("0.35"), json!(0.35));
        assert_eq!(parse_cell("TRUE"), json!(true));
        assert_eq!(parse_cell(""), Value::Null);
        assert_eq!(parse_cell("Equity"), json!("Equity"));
    }
}
