use crate::error::SyncError;
use crate::market_data::MarketDataProvider;
use crate::models::{normalize_key, Record, SourcedRecord};
use crate::retry::retry_transient_operation;
use crate::source::RecordSource;
use async_trait::async_trait;
use log::{debug, warn};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

/// Fetches history for a fixed symbol list from a market-data provider.
///
/// A symbol the provider knows nothing about becomes a record without payload,
/// which the pipeline counts as `no_data`.
pub struct ProviderSource<P: MarketDataProvider> {
    provider: P,
    symbols: Vec<String>,
    chunk_size: usize,
    retry_backoff: Duration,
    position: u64,
}

impl<P: MarketDataProvider> ProviderSource<P> {
    pub fn new<I, S>(provider: P, symbols: I, chunk_size: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen = HashSet::new();
        let symbols: Vec<String> = symbols
            .into_iter()
            .filter_map(|symbol| normalize_key(symbol.as_ref()))
            .filter(|symbol| seen.insert(symbol.clone()))
            .collect();
        Self {
            provider,
            symbols,
            chunk_size: chunk_size.max(1),
            retry_backoff: Duration::from_millis(1500),
            position: 0,
        }
    }

    pub fn with_retry_backoff(mut self, retry_backoff: Duration) -> Self {
        self.retry_backoff = retry_backoff;
        self
    }

    pub fn starting_at(mut self, offset: u64) -> Self {
        self.position = offset;
        self
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    async fn fetch_record(&self, symbol: &str) -> Result<Record, SyncError> {
        let (outcome, retries) = retry_transient_operation!(
            format!("history for {}", symbol),
            self.retry_backoff,
            self.provider.fetch_history(symbol)
        );

        let record = Record {
            key: symbol.to_string(),
            fields: BTreeMap::new(),
            prices: Vec::new(),
            dividends: Vec::new(),
        };
        match outcome {
            Ok(history) => {
                if retries > 0 {
                    debug!("History for {} fetched after {} retry", symbol, retries);
                }
                Ok(record
                    .with_prices(history.prices)
                    .with_dividends(history.dividends))
            }
            Err(err) if err.is_transient() => Err(SyncError::SourceUnavailable(format!(
                "{} failed for {}: {}",
                self.provider.describe(),
                symbol,
                err
            ))),
            Err(err) => {
                warn!("No usable history for {}: {}", symbol, err);
                Ok(record)
            }
        }
    }
}

#[async_trait]
impl<P: MarketDataProvider> RecordSource for ProviderSource<P> {
    fn describe(&self) -> String {
        format!("{} for {} symbol(s)", self.provider.describe(), self.symbols.len())
    }

    fn position(&self) -> u64 {
        self.position
    }

    async fn next_chunk(&mut self) -> Result<Option<Vec<SourcedRecord>>, SyncError> {
        let start = self.position as usize;
        if start >= self.symbols.len() {
            return Ok(None);
        }
        let end = (start + self.chunk_size).min(self.symbols.len());

        let mut chunk = Vec::with_capacity(end - start);
        for offset in start..end {
            let record = self.fetch_record(&self.symbols[offset]).await?;
            chunk.push(SourcedRecord {
                offset: offset as u64,
                record,
            });
        }
        self.position = end as u64;
        Ok(Some(chunk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::History;
    use crate::models::PricePoint;
    use chrono::NaiveDate;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct ScriptedProvider {
        histories: HashMap<String, History>,
        failures: Mutex<HashMap<String, Vec<SyncError>>>,
    }

    impl ScriptedProvider {
        fn new() -> Self {
            Self {
                histories: HashMap::new(),
                failures: Mutex::new(HashMap::new()),
            }
        }

        fn with_history(mut self, symbol: &str, closes: &[f64]) -> Self {
            let start = NaiveDate::from_ymd_opt(2024, 1, 1).expect("valid date");
            let prices = closes
                .iter()
                .enumerate()
                .map(|(idx, close)| PricePoint {
                    date: start + chrono::Duration::days(idx as i64),
                    close: *close,
                    volume: None,
                })
                .collect();
            self.histories.insert(
                symbol.to_string(),
                History {
                    prices,
                    dividends: Vec::new(),
                },
            );
            self
        }

        fn failing(self, symbol: &str, errors: Vec<SyncError>) -> Self {
            self.failures
                .lock()
                .expect("failures lock")
                .insert(symbol.to_string(), errors);
            self
        }
    }

    #[async_trait]
    impl MarketDataProvider for ScriptedProvider {
        fn describe(&self) -> String {
            "scripted provider".to_string()
        }

        async fn fetch_history(&self, symbol: &str) -> Result<History, SyncError> {
            let next_failure = {
                let mut failures = self.failures.lock().expect("failures lock");
                failures.get_mut(symbol).and_then(|queue| {
                    if queue.is_empty() {
                        None
                    } else {
                        Some(queue.remove(0))
                    }
                })
            };
            if let Some(err) = next_failure {
                return Err(err);
            }
            Ok(self.histories.get(symbol).cloned().unwrap_or_default())
        }
    }

    #[tokio::test]
    async fn unknown_symbols_become_records_without_payload() {
        let provider = ScriptedProvider::new().with_history("SPY", &[470.0, 471.5]);
        let mut source = ProviderSource::new(provider, ["spy", "NEWETF"], 10);

        let chunk = source.next_chunk().await.expect("chunk").expect("records");
        assert_eq!(chunk.len(), 2);
        assert_eq!(chunk[0].record.key, "SPY");
        assert_eq!(chunk[0].record.prices.len(), 2);
        assert!(!chunk[1].record.has_payload());
        assert!(source.next_chunk().await.expect("end").is_none());
    }

    #[tokio::test]
    async fn single_transient_failure_is_retried() {
        let provider = ScriptedProvider::new()
            .with_history("QQQ", &[400.0])
            .failing("QQQ", vec![SyncError::TransientRead("timeout".into())]);
        let mut source =
            ProviderSource::new(provider, ["QQQ"], 10).with_retry_backoff(Duration::ZERO);

        let chunk = source.next_chunk().await.expect("chunk").expect("records");
        assert!(chunk[0].record.has_payload());
    }

    #[tokio::test]
    async fn repeated_transient_failure_makes_source_unavailable() {
        let provider = ScriptedProvider::new().failing(
            "QQQ",
            vec![
                SyncError::TransientRead("timeout".into()),
                SyncError::TransientRead("timeout".into()),
            ],
        );
        let mut source =
            ProviderSource::new(provider, ["QQQ"], 10).with_retry_backoff(Duration::ZERO);

        let err = source.next_chunk().await.expect_err("unavailable");
        assert!(matches!(err, SyncError::SourceUnavailable(_)));
        assert_eq!(source.position(), 0);
    }

    #[tokio::test]
    async fn permanent_failure_counts_as_no_data() {
        let provider = ScriptedProvider::new()
            .failing("BAD", vec![SyncError::PermanentRead("400 Bad Request".into())]);
        let mut source =
            ProviderSource::new(provider, ["BAD"], 10).with_retry_backoff(Duration::ZERO);

        let chunk = source.next_chunk().await.expect("chunk").expect("records");
        assert!(!chunk[0].record.has_payload());
    }

    #[tokio::test]
    async fn resumes_from_offset() {
        let provider = ScriptedProvider::new();
        let mut source = ProviderSource::new(provider, ["A", "B", "C"], 1).starting_at(2);
        let chunk = source.next_chunk().await.expect("chunk").expect("records");
        assert_eq!(chunk[0].offset, 2);
        assert_eq!(chunk[0].record.key, "C");
    }
}
