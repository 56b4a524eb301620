use crate::error::SyncError;
use crate::http_client::{auth_headers, encode_path_segment, join_url};
use crate::models::{DividendEntry, PricePoint};
use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use log::{debug, warn};
use reqwest::header::HeaderMap;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tokio::time::sleep;

const REQUEST_DELAY: Duration = Duration::from_millis(350);

#[derive(Debug, Clone, Default, PartialEq)]
pub struct History {
    pub prices: Vec<PricePoint>,
    pub dividends: Vec<DividendEntry>,
}

impl History {
    pub fn is_empty(&self) -> bool {
        self.prices.is_empty() && self.dividends.is_empty()
    }
}

/// Keyed read interface of a third-party market-data API.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    fn describe(&self) -> String;

    /// Full price and dividend history; an unknown symbol yields an empty history.
    async fn fetch_history(&self, symbol: &str) -> Result<History, SyncError>;
}

pub struct HttpMarketDataProvider {
    http: Client,
    base_url: String,
    headers: HeaderMap,
    request_delay: Duration,
}

impl HttpMarketDataProvider {
    pub fn new(http: Client, base_url: &str, api_key: Option<&str>) -> Result<Self> {
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            headers: auth_headers(api_key)?,
            request_delay: REQUEST_DELAY,
        })
    }

    pub fn with_request_delay(mut self, request_delay: Duration) -> Self {
        self.request_delay = request_delay;
        self
    }
}

#[async_trait]
impl MarketDataProvider for HttpMarketDataProvider {
    fn describe(&self) -> String {
        format!("market data API {}", self.base_url)
    }

    async fn fetch_history(&self, symbol: &str) -> Result<History, SyncError> {
        if !self.request_delay.is_zero() {
            sleep(self.request_delay).await;
        }
        let url = history_url(&self.base_url, symbol);
        let response = self
            .http
            .get(&url)
            .headers(self.headers.clone())
            .send()
            .await
            .map_err(SyncError::from_http)?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::NO_CONTENT {
            debug!("No history for {} (status {})", symbol, status);
            return Ok(History::default());
        }
        let response = response.error_for_status().map_err(SyncError::from_http)?;

        let body = response.bytes().await.map_err(SyncError::from_http)?;
        let payload: HistoryPayload = serde_json::from_slice(&body).map_err(|err| {
            SyncError::PermanentRead(format!("invalid history payload for {}: {}", symbol, err))
        })?;
        Ok(payload.into_history(symbol))
    }
}

fn history_url(base_url: &str, symbol: &str) -> String {
    join_url(base_url, &format!("history/{}", encode_path_segment(symbol)))
}

#[derive(Debug, Default, Deserialize)]
struct HistoryPayload {
    #[serde(default)]
    prices: Option<Vec<PricePayload>>,
    #[serde(default)]
    dividends: Option<Vec<DividendPayload>>,
}

#[derive(Debug, Deserialize)]
struct PricePayload {
    date: String,
    #[serde(alias = "adj_close", alias = "price")]
    close: Option<f64>,
    #[serde(default)]
    volume: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct DividendPayload {
    #[serde(alias = "date", alias = "exDate")]
    ex_date: String,
    #[serde(alias = "dividend", alias = "value")]
    amount: Option<f64>,
}

impl HistoryPayload {
    fn into_history(self, symbol: &str) -> History {
        let mut dropped = 0usize;
        let mut prices: Vec<PricePoint> = self
            .prices
            .unwrap_or_default()
            .into_iter()
            .filter_map(|entry| {
                let point = parse_date(&entry.date).zip(entry.close.filter(|c| c.is_finite()));
                if point.is_none() {
                    dropped += 1;
                }
                point.map(|(date, close)| PricePoint {
                    date,
                    close,
                    volume: entry.volume.filter(|v| v.is_finite()).map(|v| v.round() as i64),
                })
            })
            .collect();
        let mut dividends: Vec<DividendEntry> = self
            .dividends
            .unwrap_or_default()
            .into_iter()
            .filter_map(|entry| {
                let dividend = parse_date(&entry.ex_date).zip(entry.amount.filter(|a| a.is_finite()));
                if dividend.is_none() {
                    dropped += 1;
                }
                dividend.map(|(ex_date, amount)| DividendEntry { ex_date, amount })
            })
            .collect();

        if dropped > 0 {
            warn!("Dropped {} unparseable history row(s) for {}", dropped, symbol);
        }
        prices.sort_by_key(|point| point.date);
        dividends.sort_by_key(|entry| entry.ex_date);
        History { prices, dividends }
    }
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    let date_part = trimmed.get(..10).unwrap_or(trimmed);
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(trimmed, "%Y%m%d"))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn payload_parsing_tolerates_aliases_and_bad_rows() {
        let payload: HistoryPayload = serde_json::from_value(json!({
            "prices": [
                {"date": "2024-01-03T00:00:00Z", "adj_close": 471.2, "volume": 1.2e6},
                {"date": "2024-01-02", "close": 470.0},
                {"date": "garbage", "close": 1.0},
                {"date": "2024-01-04", "close": null}
            ],
            "dividends": [{"exDate": "20231215", "dividend": 1.91}]
        }))
        .expect("payload parses");

        let history = payload.into_history("SPY");
        assert_eq!(history.prices.len(), 2);
        assert_eq!(history.prices[0].close, 470.0);
        assert_eq!(history.prices[1].volume, Some(1_200_000));
        assert_eq!(
            history.dividends,
            vec![DividendEntry {
                ex_date: NaiveDate::from_ymd_opt(2023, 12, 15).expect("valid date"),
                amount: 1.91
            }]
        );
    }

    #[test]
    fn symbols_are_encoded_as_one_path_segment() {
        assert_eq!(
            history_url("https://data.example.com/v1/", "BRK/B"),
            "https://data.example.com/v1/history/BRK%2FB"
        );
        assert_eq!(
            history_url("https://data.example.com/v1", "^GSPC"),
            "https://data.example.com/v1/history/%5EGSPC"
        );
        assert_eq!(
            history_url("https://data.example.com/v1", "BF.B"),
            "https://data.example.com/v1/history/BF.B"
        );
    }

    #[test]
    fn missing_sections_mean_empty_history() {
        let payload: HistoryPayload = serde_json::from_value(json!({})).expect("payload parses");
        assert!(payload.into_history("NEW").is_empty());
    }
}
