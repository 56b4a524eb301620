use crate::error::SyncError;
use chrono::NaiveDate;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_BATCH_SIZE: usize = 50;
const DEFAULT_RETRY_BACKOFF_MS: u64 = 1500;
const DEFAULT_BATCH_DELAY_MS: u64 = 500;
const DEFAULT_PAGE_SIZE: usize = 500;
const DEFAULT_PAGE_DELAY_MS: u64 = 350;
const DEFAULT_REPORT_PATH: &str = "reports/run-report.json";
const DEFAULT_COVERAGE_PATH: &str = "reports/coverage.csv";
const SETTINGS_PREFIX: &str = "SYNC_";

/// Which `instruments` column receives the trailing-twelve-month dividend aggregate.
///
/// Both columns exist in the platform schema; there is no default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DividendTarget {
    /// Sum of dividend amounts over the trailing 365 days.
    Dividends12m,
    /// Trailing dividends divided by the latest close.
    DividendYield,
}

impl DividendTarget {
    pub fn parse(raw: &str) -> Result<Self, SyncError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "dividends_12m" => Ok(Self::Dividends12m),
            "dividendyield" => Ok(Self::DividendYield),
            other => Err(SyncError::Config(format!(
                "SYNC_DIVIDEND_TARGET must be dividends_12m or dividendyield (value: {})",
                other
            ))),
        }
    }

    pub fn column(self) -> &'static str {
        match self {
            Self::Dividends12m => "dividends_12m",
            Self::DividendYield => "dividendyield",
        }
    }
}

/// Rules deciding when a present target row is stale. Every enabled rule is checked.
#[derive(Debug, Clone, PartialEq)]
pub struct StalenessPolicy {
    pub min_price_points: Option<usize>,
    pub max_price_age_days: Option<i64>,
    /// Reference date for age checks; fixed per run so classification stays pure.
    pub as_of: Option<NaiveDate>,
    pub required_fields: Vec<String>,
    pub compare_fields: bool,
    pub require_dividends: bool,
}

impl Default for StalenessPolicy {
    fn default() -> Self {
        Self {
            min_price_points: None,
            max_price_age_days: None,
            as_of: None,
            required_fields: Vec::new(),
            compare_fields: true,
            require_dividends: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub retry_backoff: Duration,
    pub min_batch_interval: Duration,
    pub verify_writes: bool,
    pub dry_run: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            retry_backoff: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
            min_batch_interval: Duration::from_millis(DEFAULT_BATCH_DELAY_MS),
            verify_writes: false,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub page_size: usize,
    pub page_delay: Duration,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            page_delay: Duration::from_millis(DEFAULT_PAGE_DELAY_MS),
        }
    }
}

/// Run configuration passed explicitly into every component.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub max_batch_size: usize,
    pub executor: ExecutorConfig,
    pub source: SourceConfig,
    pub staleness: StalenessPolicy,
    pub dividend_target: Option<DividendTarget>,
    pub report_path: PathBuf,
    pub coverage_path: PathBuf,
    pub market_data_url: Option<String>,
    pub market_data_api_key: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_batch_size: DEFAULT_BATCH_SIZE,
            executor: ExecutorConfig::default(),
            source: SourceConfig::default(),
            staleness: StalenessPolicy::default(),
            dividend_target: None,
            report_path: PathBuf::from(DEFAULT_REPORT_PATH),
            coverage_path: PathBuf::from(DEFAULT_COVERAGE_PATH),
            market_data_url: None,
            market_data_api_key: None,
        }
    }
}

impl SyncConfig {
    /// Reads `SYNC_*` and `MARKET_DATA_*` keys from the process environment.
    pub fn from_env() -> Result<Self, SyncError> {
        let settings: HashMap<String, String> = std::env::vars()
            .filter(|(key, _)| key.starts_with(SETTINGS_PREFIX) || key.starts_with("MARKET_DATA_"))
            .collect();
        Self::from_settings_map(&settings)
    }

    pub fn from_settings_map(settings: &HashMap<String, String>) -> Result<Self, SyncError> {
        let max_batch_size = optional_setting_usize(settings, "SYNC_BATCH_SIZE", 1)?
            .unwrap_or(DEFAULT_BATCH_SIZE);
        let retry_backoff_ms = optional_setting_u64(settings, "SYNC_RETRY_BACKOFF_MS")?
            .unwrap_or(DEFAULT_RETRY_BACKOFF_MS);
        let batch_delay_ms = optional_setting_u64(settings, "SYNC_BATCH_DELAY_MS")?
            .unwrap_or(DEFAULT_BATCH_DELAY_MS);
        let page_size =
            optional_setting_usize(settings, "SYNC_PAGE_SIZE", 1)?.unwrap_or(DEFAULT_PAGE_SIZE);
        let page_delay_ms = optional_setting_u64(settings, "SYNC_PAGE_DELAY_MS")?
            .unwrap_or(DEFAULT_PAGE_DELAY_MS);
        let verify_writes = optional_setting_bool(settings, "SYNC_VERIFY_WRITES")?.unwrap_or(false);

        let defaults = StalenessPolicy::default();
        let staleness = StalenessPolicy {
            min_price_points: optional_setting_usize(settings, "SYNC_MIN_PRICE_POINTS", 0)?,
            max_price_age_days: optional_setting_u64(settings, "SYNC_MAX_PRICE_AGE_DAYS")?
                .map(|days| days as i64),
            as_of: optional_setting_date(settings, "SYNC_AS_OF")?,
            required_fields: optional_setting_list(settings, "SYNC_REQUIRED_FIELDS"),
            compare_fields: optional_setting_bool(settings, "SYNC_COMPARE_FIELDS")?
                .unwrap_or(defaults.compare_fields),
            require_dividends: optional_setting_bool(settings, "SYNC_REQUIRE_DIVIDENDS")?
                .unwrap_or(defaults.require_dividends),
        };

        let dividend_target = optional_setting(settings, "SYNC_DIVIDEND_TARGET")
            .map(DividendTarget::parse)
            .transpose()?;

        Ok(Self {
            max_batch_size,
            executor: ExecutorConfig {
                retry_backoff: Duration::from_millis(retry_backoff_ms),
                min_batch_interval: Duration::from_millis(batch_delay_ms),
                verify_writes,
                dry_run: false,
            },
            source: SourceConfig {
                page_size,
                page_delay: Duration::from_millis(page_delay_ms),
            },
            staleness,
            dividend_target,
            report_path: optional_setting(settings, "SYNC_REPORT_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_REPORT_PATH)),
            coverage_path: optional_setting(settings, "SYNC_COVERAGE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_COVERAGE_PATH)),
            market_data_url: optional_setting(settings, "MARKET_DATA_URL").map(str::to_string),
            market_data_api_key: optional_setting(settings, "MARKET_DATA_API_KEY")
                .map(str::to_string),
        })
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.max_batch_size == 0 {
            return Err(SyncError::Config(
                "batch size must be at least 1".to_string(),
            ));
        }
        if self.source.page_size == 0 {
            return Err(SyncError::Config("page size must be at least 1".to_string()));
        }
        if self.staleness.max_price_age_days.is_some() && self.staleness.as_of.is_none() {
            return Err(SyncError::Config(
                "price age checks need a reference date (SYNC_AS_OF)".to_string(),
            ));
        }
        Ok(())
    }
}

fn optional_setting<'a>(settings: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    settings
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

fn optional_setting_usize(
    settings: &HashMap<String, String>,
    key: &str,
    min: usize,
) -> Result<Option<usize>, SyncError> {
    let Some(raw) = optional_setting(settings, key) else {
        return Ok(None);
    };
    let value = raw.parse::<usize>().map_err(|_| {
        SyncError::Config(format!(
            "Setting {} must be a non-negative integer (value: {})",
            key, raw
        ))
    })?;
    if value < min {
        return Err(SyncError::Config(format!(
            "Setting {} must be >= {} (value: {})",
            key, min, raw
        )));
    }
    Ok(Some(value))
}

fn optional_setting_u64(
    settings: &HashMap<String, String>,
    key: &str,
) -> Result<Option<u64>, SyncError> {
    let Some(raw) = optional_setting(settings, key) else {
        return Ok(None);
    };
    raw.parse::<u64>().map(Some).map_err(|_| {
        SyncError::Config(format!(
            "Setting {} must be a non-negative integer (value: {})",
            key, raw
        ))
    })
}

fn optional_setting_bool(
    settings: &HashMap<String, String>,
    key: &str,
) -> Result<Option<bool>, SyncError> {
    let Some(raw) = optional_setting(settings, key) else {
        return Ok(None);
    };
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(SyncError::Config(format!(
            "Setting {} must be a boolean (value: {})",
            key, raw
        ))),
    }
}

fn optional_setting_date(
    settings: &HashMap<String, String>,
    key: &str,
) -> Result<Option<NaiveDate>, SyncError> {
    let Some(raw) = optional_setting(settings, key) else {
        return Ok(None);
    };
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map(Some)
        .map_err(|_| {
            SyncError::Config(format!(
                "Setting {} must be a date in YYYY-MM-DD format (value: {})",
                key, raw
            ))
        })
}

fn optional_setting_list(settings: &HashMap<String, String>, key: &str) -> Vec<String> {
    let Some(raw) = optional_setting(settings, key) else {
        return Vec::new();
    };
    raw.trim_matches(|c| c == '[' || c == ']')
        .split(|c: char| c == ',' || c.is_whitespace())
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn empty_settings_fall_back_to_defaults() {
        let config = SyncConfig::from_settings_map(&HashMap::new()).expect("defaults parse");
        assert_eq!(config.max_batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(config.executor.retry_backoff, Duration::from_millis(1500));
        assert_eq!(config.dividend_target, None);
        assert!(config.staleness.compare_fields);
        config.validate().expect("defaults are valid");
    }

    #[test]
    fn library_and_settings_defaults_agree() {
        let from_settings = SyncConfig::from_settings_map(&HashMap::new()).expect("defaults parse");
        assert_eq!(from_settings.staleness, StalenessPolicy::default());
        assert_eq!(SyncConfig::default().staleness, from_settings.staleness);
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let err = SyncConfig::from_settings_map(&settings(&[("SYNC_BATCH_SIZE", "0")]))
            .expect_err("zero batch size should fail");
        assert!(err.to_string().contains("SYNC_BATCH_SIZE"));
    }

    #[test]
    fn dividend_target_accepts_only_known_columns() {
        let config =
            SyncConfig::from_settings_map(&settings(&[("SYNC_DIVIDEND_TARGET", "DividendYield")]))
                .expect("known column parses");
        assert_eq!(config.dividend_target, Some(DividendTarget::DividendYield));

        let err = SyncConfig::from_settings_map(&settings(&[("SYNC_DIVIDEND_TARGET", "yield")]))
            .expect_err("unknown column should fail");
        assert!(err.to_string().contains("dividends_12m"));
    }

    #[test]
    fn staleness_rules_parse_from_settings() {
        let config = SyncConfig::from_settings_map(&settings(&[
            ("SYNC_MIN_PRICE_POINTS", "250"),
            ("SYNC_MAX_PRICE_AGE_DAYS", "7"),
            ("SYNC_AS_OF", "2024-03-01"),
            ("SYNC_REQUIRED_FIELDS", "[name, expense_ratio]"),
            ("SYNC_COMPARE_FIELDS", "no"),
        ]))
        .expect("settings parse");

        assert_eq!(config.staleness.min_price_points, Some(250));
        assert_eq!(config.staleness.max_price_age_days, Some(7));
        assert_eq!(
            config.staleness.as_of,
            NaiveDate::from_ymd_opt(2024, 3, 1)
        );
        assert_eq!(
            config.staleness.required_fields,
            vec!["name".to_string(), "expense_ratio".to_string()]
        );
        assert!(!config.staleness.compare_fields);
        config.validate().expect("complete policy is valid");
    }

    #[test]
    fn price_age_without_reference_date_is_invalid() {
        let config =
            SyncConfig::from_settings_map(&settings(&[("SYNC_MAX_PRICE_AGE_DAYS", "3")]))
                .expect("settings parse");
        assert!(config.validate().is_err());
    }
}
