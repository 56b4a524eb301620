use crate::config::DividendTarget;
use crate::error::SyncError;
use crate::models::{Record, TargetState};
use crate::store::{dividend_aggregate, TargetStore, WriteOutcome};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoredInstrument {
    pub fields: BTreeMap<String, Value>,
    pub prices: BTreeMap<NaiveDate, (f64, Option<i64>)>,
    pub dividends: BTreeMap<NaiveDate, f64>,
    pub dividend_value: Option<f64>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl StoredInstrument {
    fn state(&self) -> TargetState {
        TargetState {
            fields: self.fields.clone(),
            price_points: self.prices.len(),
            first_price_date: self.prices.keys().next().copied(),
            last_price_date: self.prices.keys().next_back().copied(),
            dividend_count: self.dividends.len(),
            last_dividend_date: self.dividends.keys().next_back().copied(),
            updated_at: self.updated_at,
        }
    }

    /// Same content with timestamp metadata cleared, for state comparisons.
    pub fn without_timestamps(&self) -> Self {
        Self {
            updated_at: None,
            ..self.clone()
        }
    }
}

/// In-process target store with the same upsert semantics as the Postgres store.
///
/// Faults can be scripted: queued errors are returned by the next `write_batch`
/// calls before anything is applied.
#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: BTreeMap<String, StoredInstrument>,
    dividend_target: Option<DividendTarget>,
    scripted_failures: VecDeque<SyncError>,
    lost_keys: HashSet<String>,
    write_calls: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dividend_target(mut self, target: Option<DividendTarget>) -> Self {
        self.dividend_target = target;
        self
    }

    /// Pre-populates the store as if `records` had been written earlier.
    pub fn seeded(records: &[Record]) -> Self {
        let mut store = Self::new();
        for record in records {
            store.apply(record, Utc::now());
        }
        store
    }

    pub fn fail_next_write(&mut self, error: SyncError) {
        self.scripted_failures.push_back(error);
    }

    /// Writes for `key` are acknowledged but never stored.
    pub fn lose_writes_for<S: Into<String>>(&mut self, key: S) {
        self.lost_keys.insert(key.into());
    }

    pub fn write_calls(&self) -> usize {
        self.write_calls
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&StoredInstrument> {
        self.rows.get(key)
    }

    pub fn snapshot_without_timestamps(&self) -> BTreeMap<String, StoredInstrument> {
        self.rows
            .iter()
            .map(|(key, row)| (key.clone(), row.without_timestamps()))
            .collect()
    }

    fn apply(&mut self, record: &Record, now: DateTime<Utc>) -> u64 {
        let dividend_value = self
            .dividend_target
            .and_then(|target| dividend_aggregate(record, target));
        let mut affected = 0u64;
        if !self.rows.contains_key(&record.key) {
            affected += 1;
        }
        let row = self.rows.entry(record.key.clone()).or_default();

        let mut instrument_changed = false;
        for (name, value) in &record.fields {
            if row.fields.get(name) != Some(value) {
                row.fields.insert(name.clone(), value.clone());
                instrument_changed = true;
            }
        }
        if let Some(value) = dividend_value {
            if row.dividend_value != Some(value) {
                row.dividend_value = Some(value);
                instrument_changed = true;
            }
        }
        if instrument_changed || row.updated_at.is_none() {
            row.updated_at = Some(now);
            if affected == 0 && instrument_changed {
                affected += 1;
            }
        }

        for point in &record.prices {
            let next = (point.close, point.volume);
            if row.prices.insert(point.date, next) != Some(next) {
                affected += 1;
            }
        }
        for entry in &record.dividends {
            if row.dividends.insert(entry.ex_date, entry.amount) != Some(entry.amount) {
                affected += 1;
            }
        }

        affected
    }
}

#[async_trait]
impl TargetStore for MemoryStore {
    fn describe(&self) -> String {
        format!("in-memory store ({} instrument(s))", self.rows.len())
    }

    async fn fetch_state(
        &self,
        keys: &[String],
    ) -> Result<HashMap<String, TargetState>, SyncError> {
        Ok(keys
            .iter()
            .filter_map(|key| self.rows.get(key).map(|row| (key.clone(), row.state())))
            .collect())
    }

    async fn write_batch(&mut self, records: &[Record]) -> Result<WriteOutcome, SyncError> {
        self.write_calls += 1;
        if let Some(error) = self.scripted_failures.pop_front() {
            return Err(error);
        }

        let now = Utc::now();
        let mut records_affected = 0u64;
        for record in records {
            if self.lost_keys.contains(&record.key) {
                continue;
            }
            records_affected += self.apply(record, now);
        }
        Ok(WriteOutcome { records_affected })
    }
}
