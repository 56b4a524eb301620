use crate::config::DividendTarget;
use crate::error::SyncError;
use crate::models::{Record, TargetState};
use async_trait::async_trait;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOutcome {
    /// Rows inserted or changed; zero when the batch was already applied.
    pub records_affected: u64,
}

/// Keyed insert-or-update interface the executor writes batches into.
#[async_trait]
pub trait TargetStore: Send + Sync {
    fn describe(&self) -> String;

    /// Current state for each key the store knows; unknown keys are omitted.
    async fn fetch_state(
        &self,
        keys: &[String],
    ) -> Result<HashMap<String, TargetState>, SyncError>;

    /// Applies all records as one atomic, idempotent write.
    async fn write_batch(&mut self, records: &[Record]) -> Result<WriteOutcome, SyncError>;
}

/// Trailing-twelve-month dividend value for the configured column, if the
/// record carries dividends.
pub fn dividend_aggregate(record: &Record, target: DividendTarget) -> Option<f64> {
    if record.dividends.is_empty() {
        return None;
    }
    let last_dividend = record.dividends.iter().map(|entry| entry.ex_date).max()?;
    let last_price = record.last_price();
    let as_of = last_price
        .map(|point| point.date.max(last_dividend))
        .unwrap_or(last_dividend);
    let trailing = record.trailing_dividends(as_of);

    match target {
        DividendTarget::Dividends12m => Some(trailing),
        DividendTarget::DividendYield => {
            let close = last_price?.close;
            if close.is_finite() && close > 0.0 {
                Some(trailing / close)
            } else {
                None
            }
        }
    }
}
