use crate::error::SyncError;
use crate::models::{
    BatchResult, BatchStatus, CoverageStatus, CoverageTally, RunReport, RunStatus, RunSummary,
};
use chrono::{DateTime, Utc};
use log::{info, warn};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Where a follow-up run should pick up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumePoint {
    pub batch_index: usize,
    pub source_offset: u64,
}

/// Accumulates batch outcomes for one run and produces the run report.
pub struct ProgressTracker {
    run_id: String,
    label: String,
    status: RunStatus,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    planned_batches: Option<usize>,
    first_batch_index: usize,
    first_source_offset: u64,
    results: BTreeMap<usize, BatchResult>,
    coverage: CoverageTally,
    checkpoint_path: Option<PathBuf>,
}

impl ProgressTracker {
    pub fn new<S: Into<String>>(label: S) -> Self {
        Self::resuming_from(
            label,
            ResumePoint {
                batch_index: 0,
                source_offset: 0,
            },
        )
    }

    pub fn resuming_from<S: Into<String>>(label: S, resume: ResumePoint) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            label: label.into(),
            status: RunStatus::NotStarted,
            started_at: None,
            ended_at: None,
            planned_batches: None,
            first_batch_index: resume.batch_index,
            first_source_offset: resume.source_offset,
            results: BTreeMap::new(),
            coverage: CoverageTally::default(),
            checkpoint_path: None,
        }
    }

    /// Re-saves the report to `path` after every recorded batch.
    pub fn with_checkpoint<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.checkpoint_path = Some(path.into());
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn first_batch_index(&self) -> usize {
        self.first_batch_index
    }

    pub fn recorded(&self) -> usize {
        self.results.len()
    }

    pub fn start(&mut self) {
        if self.status == RunStatus::NotStarted {
            self.status = RunStatus::Running;
            self.started_at = Some(Utc::now());
        }
    }

    pub fn observe(&mut self, status: CoverageStatus) {
        self.coverage.add(status);
    }

    pub fn observe_no_data(&mut self) {
        self.coverage.no_data += 1;
    }

    pub fn observe_tally(&mut self, tally: CoverageTally) {
        self.coverage.merge(tally);
    }

    /// Fixes the number of batches this run will produce once the source is drained.
    pub fn set_planned(&mut self, planned_batches: usize) {
        self.planned_batches = Some(planned_batches);
        self.complete_if_done();
    }

    pub fn record(&mut self, batch_index: usize, result: BatchResult) -> Result<(), SyncError> {
        if self.status != RunStatus::Running {
            return Err(SyncError::Report(format!(
                "cannot record batch {} while run is {}",
                batch_index,
                self.status.as_str()
            )));
        }
        if result.batch_index != batch_index {
            return Err(SyncError::Report(format!(
                "result for batch {} recorded under index {}",
                result.batch_index, batch_index
            )));
        }
        if self.results.contains_key(&batch_index) {
            return Err(SyncError::Report(format!(
                "batch {} already recorded",
                batch_index
            )));
        }

        self.results.insert(batch_index, result);
        self.complete_if_done();
        self.checkpoint();
        Ok(())
    }

    /// Marks a running run as stopped before every planned batch reported.
    pub fn interrupt(&mut self) {
        if self.status == RunStatus::Running {
            self.status = RunStatus::Interrupted;
            self.ended_at = Some(Utc::now());
            self.checkpoint();
        }
    }

    pub fn resume_point(&self) -> ResumePoint {
        let mut point = ResumePoint {
            batch_index: self.first_batch_index,
            source_offset: self.first_source_offset,
        };
        for (index, result) in &self.results {
            if result.status != BatchStatus::Success {
                return ResumePoint {
                    batch_index: *index,
                    source_offset: result.source_start,
                };
            }
            point = ResumePoint {
                batch_index: index + 1,
                source_offset: result.source_end,
            };
        }
        point
    }

    /// Snapshot of the run so far; never changes recorded results.
    pub fn finalize(&self) -> RunReport {
        let resume = self.resume_point();
        RunReport {
            run_id: self.run_id.clone(),
            label: self.label.clone(),
            status: self.status,
            started_at: self.started_at,
            ended_at: self.ended_at,
            planned_batches: self.planned_batches,
            first_batch_index: self.first_batch_index,
            batches: self.results.values().cloned().collect(),
            summary: self.summarize(),
            coverage: self.coverage,
            resume_batch_index: resume.batch_index,
            resume_source_offset: resume.source_offset,
        }
    }

    fn summarize(&self) -> RunSummary {
        let mut summary = RunSummary::default();
        for result in self.results.values() {
            match result.status {
                BatchStatus::Success => {
                    summary.total_succeeded += 1;
                    summary.records_succeeded += result.record_count;
                }
                BatchStatus::Failed => {
                    summary.total_failed += 1;
                    summary.records_failed += result.record_count;
                    summary.failed_batch_indices.push(result.batch_index);
                }
                BatchStatus::Skipped => {
                    summary.total_skipped += 1;
                }
            }
            summary.records_affected += result.records_affected;
        }
        summary.total_attempted = summary.total_succeeded + summary.total_failed;
        summary.records_attempted = summary.records_succeeded + summary.records_failed;
        summary.success_rate = if summary.total_attempted == 0 {
            0.0
        } else {
            summary.total_succeeded as f64 / summary.total_attempted as f64
        };

        if let Some(started_at) = self.started_at {
            let ended_at = self.ended_at.unwrap_or_else(Utc::now);
            let elapsed_ms = (ended_at - started_at).num_milliseconds().max(0);
            summary.elapsed_seconds = elapsed_ms as f64 / 1000.0;
        }
        summary.throughput_records_per_sec = if summary.elapsed_seconds > 0.0 {
            summary.records_succeeded as f64 / summary.elapsed_seconds
        } else {
            0.0
        };

        summary
    }

    fn complete_if_done(&mut self) {
        if self.status != RunStatus::Running {
            return;
        }
        if let Some(planned) = self.planned_batches {
            if self.results.len() >= planned {
                self.status = RunStatus::Completed;
                self.ended_at = Some(Utc::now());
                info!("Run {} completed: {} batch(es)", self.run_id, planned);
            }
        }
    }

    fn checkpoint(&self) {
        let Some(path) = self.checkpoint_path.as_deref() else {
            return;
        };
        if let Err(err) = save_report(&self.finalize(), path) {
            warn!("Failed to checkpoint run report to {}: {}", path.display(), err);
        }
    }
}

/// Writes the report as pretty JSON via a temporary file and rename.
pub fn save_report(report: &RunReport, path: &Path) -> Result<(), SyncError> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|err| {
            SyncError::Report(format!("failed to create {}: {}", parent.display(), err))
        })?;
    }
    let payload = serde_json::to_string_pretty(report)
        .map_err(|err| SyncError::Report(format!("failed to serialize run report: {}", err)))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, payload).map_err(|err| {
        SyncError::Report(format!("failed to write {}: {}", tmp_path.display(), err))
    })?;
    fs::rename(&tmp_path, path).map_err(|err| {
        SyncError::Report(format!("failed to move report into {}: {}", path.display(), err))
    })
}

pub fn load_report(path: &Path) -> Result<RunReport, SyncError> {
    let raw = fs::read_to_string(path)
        .map_err(|err| SyncError::Report(format!("failed to read {}: {}", path.display(), err)))?;
    serde_json::from_str(&raw)
        .map_err(|err| SyncError::Report(format!("failed to parse {}: {}", path.display(), err)))
}

/// Resume point stored in a previous report, if one exists at `path`.
pub fn resume_point_from(path: &Path) -> Result<Option<ResumePoint>, SyncError> {
    if !path.exists() {
        return Ok(None);
    }
    let report = load_report(path)?;
    Ok(Some(ResumePoint {
        batch_index: report.resume_batch_index,
        source_offset: report.resume_source_offset,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(index: usize, status: BatchStatus, records: usize) -> BatchResult {
        let start = (index * 20) as u64;
        BatchResult {
            batch_index: index,
            status,
            error_kind: None,
            error_detail: match status {
                BatchStatus::Failed => Some("timeout".to_string()),
                _ => None,
            },
            records_affected: records as u64,
            record_count: records,
            retries: 0,
            first_key: None,
            last_key: None,
            source_start: start,
            source_end: start + records as u64,
            duration_ms: 5,
            warnings: Vec::new(),
            completed_at: Utc::now(),
        }
    }

    #[test]
    fn partial_finalize_counts_only_recorded_batches() {
        let mut tracker = ProgressTracker::new("partial");
        tracker.start();
        tracker.set_planned(5);
        tracker.record(0, result(0, BatchStatus::Success, 20)).expect("record");
        tracker.record(1, result(1, BatchStatus::Failed, 20)).expect("record");
        tracker.record(2, result(2, BatchStatus::Success, 20)).expect("record");

        let report = tracker.finalize();
        assert_eq!(report.status, RunStatus::Running);
        assert_eq!(report.summary.total_attempted, 3);
        assert_eq!(report.summary.total_succeeded, 2);
        assert_eq!(report.summary.total_failed, 1);
        assert_eq!(report.summary.failed_batch_indices, vec![1]);
        assert_eq!(report.summary.records_succeeded, 40);
        assert!((report.summary.success_rate - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn finalize_is_idempotent() {
        let mut tracker = ProgressTracker::new("idempotent");
        tracker.start();
        tracker.record(0, result(0, BatchStatus::Success, 20)).expect("record");
        let first = tracker.finalize();
        let second = tracker.finalize();
        assert_eq!(first.batches, second.batches);
        assert_eq!(first.summary.total_attempted, second.summary.total_attempted);
        assert_eq!(tracker.recorded(), 1);
    }

    #[test]
    fn run_completes_when_all_planned_batches_report() {
        let mut tracker = ProgressTracker::new("complete");
        assert_eq!(tracker.status(), RunStatus::NotStarted);
        tracker.start();
        tracker.set_planned(2);
        tracker.record(0, result(0, BatchStatus::Success, 20)).expect("record");
        assert_eq!(tracker.status(), RunStatus::Running);
        tracker.record(1, result(1, BatchStatus::Success, 5)).expect("record");
        assert_eq!(tracker.status(), RunStatus::Completed);
        assert!(tracker
            .record(2, result(2, BatchStatus::Success, 1))
            .is_err());
    }

    #[test]
    fn zero_planned_batches_complete_immediately() {
        let mut tracker = ProgressTracker::new("empty");
        tracker.start();
        tracker.set_planned(0);
        let report = tracker.finalize();
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.summary.total_attempted, 0);
        assert!(report.is_resolved());
    }

    #[test]
    fn duplicate_and_mislabelled_results_are_rejected() {
        let mut tracker = ProgressTracker::new("dupes");
        tracker.start();
        tracker.record(0, result(0, BatchStatus::Success, 20)).expect("record");
        assert!(tracker.record(0, result(0, BatchStatus::Failed, 20)).is_err());
        assert!(tracker.record(3, result(1, BatchStatus::Success, 20)).is_err());
        assert_eq!(tracker.finalize().batches[0].status, BatchStatus::Success);
    }

    #[test]
    fn resume_point_lands_on_first_unsuccessful_batch() {
        let mut tracker = ProgressTracker::new("resume");
        tracker.start();
        tracker.set_planned(4);
        tracker.record(0, result(0, BatchStatus::Success, 20)).expect("record");
        tracker.record(1, result(1, BatchStatus::Success, 20)).expect("record");
        tracker.record(2, result(2, BatchStatus::Failed, 20)).expect("record");
        tracker.interrupt();

        assert_eq!(tracker.status(), RunStatus::Interrupted);
        assert_eq!(
            tracker.resume_point(),
            ResumePoint {
                batch_index: 2,
                source_offset: 40
            }
        );
    }

    #[test]
    fn resume_point_after_clean_prefix_is_end_of_last_batch() {
        let mut tracker = ProgressTracker::resuming_from(
            "continued",
            ResumePoint {
                batch_index: 2,
                source_offset: 40,
            },
        );
        assert_eq!(tracker.resume_point().batch_index, 2);
        tracker.start();
        tracker.record(2, result(2, BatchStatus::Success, 20)).expect("record");
        assert_eq!(
            tracker.resume_point(),
            ResumePoint {
                batch_index: 3,
                source_offset: 60
            }
        );
    }

    #[test]
    fn report_survives_save_and_load() {
        let mut tracker = ProgressTracker::new("persisted");
        tracker.start();
        tracker.observe(CoverageStatus::Absent);
        tracker.observe_no_data();
        tracker.set_planned(1);
        tracker.record(0, result(0, BatchStatus::Success, 3)).expect("record");
        let report = tracker.finalize();

        let path = std::env::temp_dir()
            .join(format!("etf-sync-{}", Uuid::new_v4()))
            .join("run-report.json");
        save_report(&report, &path).expect("save");
        let loaded = load_report(&path).expect("load");
        assert_eq!(loaded.run_id, report.run_id);
        assert_eq!(loaded.status, RunStatus::Completed);
        assert_eq!(loaded.batches, report.batches);
        assert_eq!(loaded.coverage, report.coverage);
        assert_eq!(
            loaded.summary.failed_batch_indices,
            report.summary.failed_batch_indices
        );
        assert_eq!(loaded.summary.total_attempted, 1);
        assert_eq!(
            resume_point_from(&path).expect("resume"),
            Some(ResumePoint {
                batch_index: 1,
                source_offset: 3
            })
        );

        if let Some(dir) = path.parent() {
            let _ = fs::remove_dir_all(dir);
        }
    }

    #[test]
    fn missing_report_means_fresh_start() {
        let path = std::env::temp_dir().join(format!("etf-sync-missing-{}.json", Uuid::new_v4()));
        assert_eq!(resume_point_from(&path).expect("no report"), None);
    }
}
