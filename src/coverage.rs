use crate::error::SyncError;
use crate::models::{CoverageStatus, TargetState};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

pub const NO_DATA_STATUS: &str = "no_data";

/// One line of the coverage CSV: what the target held for a key before the run wrote it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageRow {
    pub key: String,
    pub status: String,
    pub price_points: usize,
    pub first_price_date: Option<NaiveDate>,
    pub last_price_date: Option<NaiveDate>,
    pub dividend_count: usize,
    pub last_dividend_date: Option<NaiveDate>,
}

impl CoverageRow {
    pub fn classified(key: &str, status: CoverageStatus, target: Option<&TargetState>) -> Self {
        Self::with_status(key, status.as_str(), target)
    }

    pub fn no_data(key: &str, target: Option<&TargetState>) -> Self {
        Self::with_status(key, NO_DATA_STATUS, target)
    }

    fn with_status(key: &str, status: &str, target: Option<&TargetState>) -> Self {
        Self {
            key: key.to_string(),
            status: status.to_string(),
            price_points: target.map(|state| state.price_points).unwrap_or(0),
            first_price_date: target.and_then(|state| state.first_price_date),
            last_price_date: target.and_then(|state| state.last_price_date),
            dividend_count: target.map(|state| state.dividend_count).unwrap_or(0),
            last_dividend_date: target.and_then(|state| state.last_dividend_date),
        }
    }
}

/// Writes rows sorted by key, replacing any previous file.
pub fn write_coverage(rows: &[CoverageRow], path: &Path) -> Result<(), SyncError> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|err| {
            SyncError::Report(format!("failed to create {}: {}", parent.display(), err))
        })?;
    }

    let mut sorted: Vec<&CoverageRow> = rows.iter().collect();
    sorted.sort_by(|a, b| a.key.cmp(&b.key));

    let mut writer = csv::Writer::from_path(path).map_err(|err| {
        SyncError::Report(format!("failed to open {}: {}", path.display(), err))
    })?;
    if sorted.is_empty() {
        writer
            .write_record([
                "key",
                "status",
                "price_points",
                "first_price_date",
                "last_price_date",
                "dividend_count",
                "last_dividend_date",
            ])
            .map_err(|err| coverage_write_error(path, err))?;
    }
    for row in sorted {
        writer
            .serialize(row)
            .map_err(|err| coverage_write_error(path, err))?;
    }
    writer.flush().map_err(|err| {
        SyncError::Report(format!("failed to flush {}: {}", path.display(), err))
    })
}

pub fn read_coverage(path: &Path) -> Result<Vec<CoverageRow>, SyncError> {
    let mut reader = csv::Reader::from_path(path).map_err(|err| {
        SyncError::Report(format!("failed to open {}: {}", path.display(), err))
    })?;
    reader
        .deserialize()
        .collect::<Result<Vec<CoverageRow>, _>>()
        .map_err(|err| SyncError::Report(format!("failed to parse {}: {}", path.display(), err)))
}

/// Rows from an earlier artifact with every key reclassified in `current` replaced.
pub fn merge_coverage(previous: Vec<CoverageRow>, current: &[CoverageRow]) -> Vec<CoverageRow> {
    let fresh: HashSet<&str> = current.iter().map(|row| row.key.as_str()).collect();
    let mut merged: Vec<CoverageRow> = previous
        .into_iter()
        .filter(|row| !fresh.contains(row.key.as_str()))
        .collect();
    merged.extend(current.iter().cloned());
    merged
}

fn coverage_write_error(path: &Path, err: csv::Error) -> SyncError {
    SyncError::Report(format!("failed to write {}: {}", path.display(), err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn temp_path() -> std::path::PathBuf {
        std::env::temp_dir()
            .join(format!("etf-sync-coverage-{}", Uuid::new_v4()))
            .join("coverage.csv")
    }

    #[test]
    fn merge_keeps_earlier_keys_and_replaces_reclassified_ones() {
        let previous = vec![
            CoverageRow::classified("AGG", CoverageStatus::Present, None),
            CoverageRow::classified("SPY", CoverageStatus::Absent, None),
        ];
        let current = vec![
            CoverageRow::classified("SPY", CoverageStatus::Present, None),
            CoverageRow::classified("VTI", CoverageStatus::Stale, None),
        ];
        let mut merged = merge_coverage(previous, &current);
        merged.sort_by(|a, b| a.key.cmp(&b.key));
        let statuses: Vec<(&str, &str)> = merged
            .iter()
            .map(|row| (row.key.as_str(), row.status.as_str()))
            .collect();
        assert_eq!(
            statuses,
            vec![("AGG", "present"), ("SPY", "present"), ("VTI", "stale")]
        );
    }

    #[test]
    fn rows_are_written_sorted_with_header() {
        let path = temp_path();
        let target = TargetState {
            price_points: 250,
            first_price_date: NaiveDate::from_ymd_opt(2023, 1, 3),
            last_price_date: NaiveDate::from_ymd_opt(2023, 12, 29),
            dividend_count: 4,
            ..TargetState::default()
        };
        let rows = vec![
            CoverageRow::classified("VTI", CoverageStatus::Stale, Some(&target)),
            CoverageRow::classified("BND", CoverageStatus::Absent, None),
            CoverageRow::no_data("ZZZ", None),
        ];

        write_coverage(&rows, &path).expect("write coverage");
        let raw = fs::read_to_string(&path).expect("read coverage");
        let mut lines = raw.lines();
        assert_eq!(
            lines.next(),
            Some("key,status,price_points,first_price_date,last_price_date,dividend_count,last_dividend_date")
        );
        assert_eq!(lines.next(), Some("BND,absent,0,,,0,"));
        assert_eq!(lines.next(), Some("VTI,stale,250,2023-01-03,2023-12-29,4,"));
        assert_eq!(lines.next(), Some("ZZZ,no_data,0,,,0,"));

        let parsed = read_coverage(&path).expect("read back");
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[1].price_points, 250);

        let _ = fs::remove_dir_all(path.parent().expect("parent"));
    }

    #[test]
    fn empty_report_still_has_header() {
        let path = temp_path();
        write_coverage(&[], &path).expect("write coverage");
        let raw = fs::read_to_string(&path).expect("read coverage");
        assert!(raw.starts_with("key,status,price_points"));
        let _ = fs::remove_dir_all(path.parent().expect("parent"));
    }
}
