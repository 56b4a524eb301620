use crate::error::SyncError;
use crate::models::SourcedRecord;
use crate::source::{record_from_object, RecordSource};
use async_trait::async_trait;
use log::{debug, warn};
use reqwest::header::HeaderMap;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tokio::time::sleep;

const PAGE_ARRAY_KEYS: [&str; 4] = ["data", "items", "results", "records"];

/// Walks a paginated JSON endpoint using `offset`/`limit` query parameters.
///
/// A page shorter than `page_size` ends the stream.
pub struct ApiSource {
    http: Client,
    url: String,
    headers: HeaderMap,
    key_field: String,
    page_size: usize,
    page_delay: Duration,
    position: u64,
    pages_fetched: usize,
    exhausted: bool,
}

impl ApiSource {
    pub fn new<S: Into<String>>(http: Client, url: S, page_size: usize, page_delay: Duration) -> Self {
        Self {
            http,
            url: url.into(),
            headers: HeaderMap::new(),
            key_field: "symbol".to_string(),
            page_size: page_size.max(1),
            page_delay,
            position: 0,
            pages_fetched: 0,
            exhausted: false,
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_key_field<S: Into<String>>(mut self, key_field: S) -> Self {
        self.key_field = key_field.into();
        self
    }

    pub fn starting_at(mut self, offset: u64) -> Self {
        self.position = offset;
        self
    }

    async fn fetch_page(&self) -> Result<Vec<Value>, SyncError> {
        let offset = self.position.to_string();
        let limit = self.page_size.to_string();
        let response = self
            .http
            .get(&self.url)
            .headers(self.headers.clone())
            .query(&[("offset", offset.as_str()), ("limit", limit.as_str())])
            .send()
            .await
            .map_err(|err| {
                SyncError::SourceUnavailable(format!("request to {} failed: {}", self.url, err))
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::SourceUnavailable(format!(
                "{} returned {} at offset {}",
                self.url, status, self.position
            )));
        }

        let body: Value = response.json().await.map_err(|err| {
            SyncError::SourceUnavailable(format!("invalid JSON from {}: {}", self.url, err))
        })?;
        Ok(extract_page_items(body))
    }
}

/// Accepts either a bare array or an envelope with a known array property.
pub fn extract_page_items(body: Value) -> Vec<Value> {
    match body {
        Value::Array(items) => items,
        Value::Object(mut object) => PAGE_ARRAY_KEYS
            .iter()
            .find_map(|key| match object.remove(*key) {
                Some(Value::Array(items)) => Some(items),
                _ => None,
            })
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

#[async_trait]
impl RecordSource for ApiSource {
    fn describe(&self) -> String {
        format!("paginated endpoint {}", self.url)
    }

    fn position(&self) -> u64 {
        self.position
    }

    async fn next_chunk(&mut self) -> Result<Option<Vec<SourcedRecord>>, SyncError> {
        if self.exhausted {
            return Ok(None);
        }
        if self.pages_fetched > 0 && !self.page_delay.is_zero() {
            sleep(self.page_delay).await;
        }

        let items = self.fetch_page().await?;
        self.pages_fetched += 1;
        debug!(
            "Fetched page {} ({} item(s)) from {}",
            self.pages_fetched,
            items.len(),
            self.url
        );

        if items.len() < self.page_size {
            self.exhausted = true;
        }
        if items.is_empty() {
            return Ok(None);
        }

        let mut chunk = Vec::with_capacity(items.len());
        for item in items {
            let offset = self.position;
            self.position += 1;
            let Value::Object(object) = item else {
                warn!("Skipping non-object item at offset {} from {}", offset, self.url);
                continue;
            };
            match record_from_object(object, &self.key_field) {
                Some(record) => chunk.push(SourcedRecord { offset, record }),
                None => warn!(
                    "Item at offset {} from {} has no usable {}",
                    offset, self.url, self.key_field
                ),
            }
        }
        Ok(Some(chunk))
    }
}
