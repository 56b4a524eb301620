use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub date: NaiveDate,
    pub close: f64,
    #[serde(default)]
    pub volume: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DividendEntry {
    pub ex_date: NaiveDate,
    pub amount: f64,
}

/// A uniquely keyed instrument with its attributes and price/dividend history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub key: String,
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
    #[serde(default)]
    pub prices: Vec<PricePoint>,
    #[serde(default)]
    pub dividends: Vec<DividendEntry>,
}

impl Record {
    pub fn new<S: AsRef<str>>(key: S) -> Option<Self> {
        let key = normalize_key(key.as_ref())?;
        Some(Self {
            key,
            fields: BTreeMap::new(),
            prices: Vec::new(),
            dividends: Vec::new(),
        })
    }

    pub fn with_field<S: Into<String>>(mut self, name: S, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn with_prices(mut self, prices: Vec<PricePoint>) -> Self {
        self.prices = prices;
        self
    }

    pub fn with_dividends(mut self, dividends: Vec<DividendEntry>) -> Self {
        self.dividends = dividends;
        self
    }

    /// True when the record carries anything worth writing.
    pub fn has_payload(&self) -> bool {
        !self.fields.is_empty() || !self.prices.is_empty() || !self.dividends.is_empty()
    }

    pub fn last_price(&self) -> Option<&PricePoint> {
        self.prices.iter().max_by_key(|point| point.date)
    }

    /// Sum of dividends with an ex-date in the 365 days up to `as_of`.
    pub fn trailing_dividends(&self, as_of: NaiveDate) -> f64 {
        let window_start = as_of - chrono::Duration::days(365);
        self.dividends
            .iter()
            .filter(|entry| entry.ex_date > window_start && entry.ex_date <= as_of)
            .map(|entry| entry.amount)
            .sum()
    }
}

/// Trims and upper-cases a symbol, rejecting empty keys.
pub fn normalize_key(value: &str) -> Option<String> {
    let normalized = value.trim().to_uppercase();
    if normalized.is_empty() {
        None
    } else {
        Some(normalized)
    }
}

/// What the target store currently holds for one key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetState {
    pub fields: BTreeMap<String, Value>,
    pub price_points: usize,
    pub first_price_date: Option<NaiveDate>,
    pub last_price_date: Option<NaiveDate>,
    pub dividend_count: usize,
    pub last_dividend_date: Option<NaiveDate>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoverageStatus {
    Present,
    Absent,
    Stale,
}

impl CoverageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoverageStatus::Present => "present",
            CoverageStatus::Absent => "absent",
            CoverageStatus::Stale => "stale",
        }
    }

    pub fn needs_write(&self) -> bool {
        !matches!(self, CoverageStatus::Present)
    }
}

/// A record together with its absolute position in the source sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct SourcedRecord {
    pub offset: u64,
    pub record: Record,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub index: usize,
    pub records: Vec<Record>,
    /// Half-open range of source offsets this batch covers.
    pub source_start: u64,
    pub source_end: u64,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.records.iter().map(|record| record.key.clone()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Success,
    Failed,
    Skipped,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Success => "success",
            BatchStatus::Failed => "failed",
            BatchStatus::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub batch_index: usize,
    pub status: BatchStatus,
    #[serde(default)]
    pub error_kind: Option<String>,
    #[serde(default)]
    pub error_detail: Option<String>,
    pub records_affected: u64,
    pub record_count: usize,
    pub retries: u32,
    pub first_key: Option<String>,
    pub last_key: Option<String>,
    pub source_start: u64,
    pub source_end: u64,
    pub duration_ms: u64,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    NotStarted,
    Running,
    Completed,
    Interrupted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::NotStarted => "not_started",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Interrupted => "interrupted",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoverageTally {
    pub present: usize,
    pub absent: usize,
    pub stale: usize,
    pub no_data: usize,
}

impl CoverageTally {
    pub fn add(&mut self, status: CoverageStatus) {
        match status {
            CoverageStatus::Present => self.present += 1,
            CoverageStatus::Absent => self.absent += 1,
            CoverageStatus::Stale => self.stale += 1,
        }
    }

    pub fn merge(&mut self, other: CoverageTally) {
        self.present += other.present;
        self.absent += other.absent;
        self.stale += other.stale;
        self.no_data += other.no_data;
    }

    pub fn needing_write(&self) -> usize {
        self.absent + self.stale
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub total_attempted: usize,
    pub total_succeeded: usize,
    pub total_failed: usize,
    pub total_skipped: usize,
    pub records_attempted: usize,
    pub records_succeeded: usize,
    pub records_failed: usize,
    pub records_affected: u64,
    pub success_rate: f64,
    pub elapsed_seconds: f64,
    pub throughput_records_per_sec: f64,
    pub failed_batch_indices: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub run_id: String,
    pub label: String,
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub planned_batches: Option<usize>,
    pub first_batch_index: usize,
    pub batches: Vec<BatchResult>,
    pub summary: RunSummary,
    pub coverage: CoverageTally,
    pub resume_batch_index: usize,
    pub resume_source_offset: u64,
}

impl RunReport {
    /// A run is fully resolved when it completed and no batch failed.
    pub fn is_resolved(&self) -> bool {
        self.status == RunStatus::Completed && self.summary.total_failed == 0
    }
}
