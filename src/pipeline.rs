use crate::batcher::Batcher;
use crate::config::SyncConfig;
use crate::coverage::{merge_coverage, read_coverage, write_coverage, CoverageRow};
use crate::differencer::{classify, stale_reason};
use crate::error::SyncError;
use crate::executor::UpsertExecutor;
use crate::models::{
    Batch, BatchStatus, CoverageStatus, CoverageTally, RunReport, SourcedRecord, TargetState,
};
use crate::retry::retry_transient_operation;
use crate::source::RecordSource;
use crate::store::TargetStore;
use crate::tracker::{save_report, ProgressTracker, ResumePoint};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::io::IsTerminal;
use std::path::PathBuf;

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub label: String,
    pub resume: Option<ResumePoint>,
    /// Checkpointed after every batch and written again at the end.
    pub report_path: Option<PathBuf>,
    pub coverage_path: Option<PathBuf>,
    pub show_progress: bool,
}

pub struct RunOutcome {
    pub report: RunReport,
    pub coverage: Vec<CoverageRow>,
    /// Set when the source or the state lookup failed and the run was interrupted.
    pub abort_reason: Option<SyncError>,
}

impl RunOutcome {
    pub fn is_resolved(&self) -> bool {
        self.abort_reason.is_none() && self.report.is_resolved()
    }
}

/// Classified view of one source chunk.
struct ClassifiedChunk {
    to_write: Vec<SourcedRecord>,
    rows: Vec<CoverageRow>,
    tally: CoverageTally,
}

/// Streams `source` through classification, batching and execution into `store`.
///
/// Per-batch failures are recorded and the run continues; a failing source or
/// state lookup interrupts the run with a resumable report.
pub async fn run_sync<R, S>(
    source: &mut R,
    store: &mut S,
    config: &SyncConfig,
    options: RunOptions,
) -> Result<RunOutcome, SyncError>
where
    R: RecordSource + ?Sized,
    S: TargetStore + ?Sized,
{
    config.validate()?;
    let resume = options.resume.unwrap_or(ResumePoint {
        batch_index: 0,
        source_offset: 0,
    });
    if source.position() != resume.source_offset {
        return Err(SyncError::Config(format!(
            "source is positioned at offset {} but the run resumes at {}",
            source.position(),
            resume.source_offset
        )));
    }

    let mut tracker = ProgressTracker::resuming_from(options.label.clone(), resume);
    if let Some(path) = options.report_path.as_ref() {
        tracker = tracker.with_checkpoint(path.clone());
    }
    let mut batcher = Batcher::starting_at(config.max_batch_size, resume.batch_index)?;
    let mut executor = UpsertExecutor::new(config.executor.clone());
    let progress = progress_bar(options.show_progress);

    info!(
        "Run {} ({}) syncing {} into {}; batch size {}, starting at batch {} / offset {}{}",
        tracker.run_id(),
        options.label,
        source.describe(),
        store.describe(),
        config.max_batch_size,
        resume.batch_index,
        resume.source_offset,
        if config.executor.dry_run { " [dry run]" } else { "" }
    );
    tracker.start();

    let mut coverage = Vec::new();
    let mut abort_reason = None;

    loop {
        let chunk = match source.next_chunk().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(err) => {
                error!("Source failed at offset {}: {}", source.position(), err);
                abort_reason = Some(err);
                break;
            }
        };

        let classified = match classify_chunk(chunk, store, config).await {
            Ok(classified) => classified,
            Err(err) => {
                error!("Target state lookup failed: {}", err);
                abort_reason = Some(SyncError::SourceUnavailable(format!(
                    "target state lookup failed: {}",
                    err
                )));
                break;
            }
        };
        tracker.observe_tally(classified.tally);
        coverage.extend(classified.rows);

        for item in classified.to_write {
            if let Some(batch) = batcher.push(item) {
                execute_batch(&batch, &mut executor, store, &mut tracker, &progress).await?;
            }
        }
    }

    if abort_reason.is_none() {
        if let Some(batch) = batcher.finish() {
            execute_batch(&batch, &mut executor, store, &mut tracker, &progress).await?;
        }
        tracker.set_planned(batcher.next_index() - resume.batch_index);
    } else {
        if batcher.pending() > 0 {
            warn!(
                "{} classified record(s) were not batched before the interruption",
                batcher.pending()
            );
        }
        tracker.interrupt();
    }

    let report = tracker.finalize();
    progress.finish_with_message(format!(
        "{} batch(es), {} failed",
        report.batches.len(),
        report.summary.total_failed
    ));

    if let Some(path) = options.report_path.as_deref() {
        save_report(&report, path)?;
        info!("Run report written to {}", path.display());
    }
    if let Some(path) = options.coverage_path.as_deref() {
        let resumed = resume.batch_index > 0 || resume.source_offset > 0;
        if resumed && path.exists() {
            match read_coverage(path) {
                Ok(previous) => write_coverage(&merge_coverage(previous, &coverage), path)?,
                Err(err) => {
                    warn!("Previous coverage unreadable, rewriting it from this run: {}", err);
                    write_coverage(&coverage, path)?;
                }
            }
        } else {
            write_coverage(&coverage, path)?;
        }
        info!("Coverage report written to {}", path.display());
    }
    log_summary(&report);

    Ok(RunOutcome {
        report,
        coverage,
        abort_reason,
    })
}

/// Classifies every record of `source` without writing anything.
pub async fn survey<R, S>(
    source: &mut R,
    store: &S,
    config: &SyncConfig,
) -> Result<(CoverageTally, Vec<CoverageRow>), SyncError>
where
    R: RecordSource + ?Sized,
    S: TargetStore + ?Sized,
{
    config.validate()?;
    let mut tally = CoverageTally::default();
    let mut rows = Vec::new();
    while let Some(chunk) = source.next_chunk().await? {
        let classified = classify_chunk(chunk, store, config).await?;
        tally.merge(classified.tally);
        rows.extend(classified.rows);
    }
    info!(
        "Coverage of {} in {}: {} present, {} absent, {} stale, {} without data",
        source.describe(),
        store.describe(),
        tally.present,
        tally.absent,
        tally.stale,
        tally.no_data
    );
    Ok((tally, rows))
}

async fn classify_chunk<S>(
    chunk: Vec<SourcedRecord>,
    store: &S,
    config: &SyncConfig,
) -> Result<ClassifiedChunk, SyncError>
where
    S: TargetStore + ?Sized,
{
    let keys: Vec<String> = chunk.iter().map(|item| item.record.key.clone()).collect();
    let states: HashMap<String, TargetState> = if keys.is_empty() {
        HashMap::new()
    } else {
        let (outcome, _) = retry_transient_operation!(
            format!("state lookup for {} key(s)", keys.len()),
            config.executor.retry_backoff,
            store.fetch_state(&keys)
        );
        outcome?
    };

    let mut classified = ClassifiedChunk {
        to_write: Vec::new(),
        rows: Vec::with_capacity(chunk.len()),
        tally: CoverageTally::default(),
    };
    for item in chunk {
        let existing = states.get(&item.record.key);
        if !item.record.has_payload() {
            debug!("{} has no data to sync", item.record.key);
            classified.tally.no_data += 1;
            classified
                .rows
                .push(CoverageRow::no_data(&item.record.key, existing));
            continue;
        }

        let status = classify(&item.record, existing, &config.staleness);
        if status == CoverageStatus::Stale {
            if let Some(reason) =
                existing.and_then(|state| stale_reason(&item.record, state, &config.staleness))
            {
                debug!("{} is stale: {}", item.record.key, reason);
            }
        }
        classified.tally.add(status);
        classified
            .rows
            .push(CoverageRow::classified(&item.record.key, status, existing));
        if status.needs_write() {
            classified.to_write.push(item);
        }
    }
    Ok(classified)
}

async fn execute_batch<S>(
    batch: &Batch,
    executor: &mut UpsertExecutor,
    store: &mut S,
    tracker: &mut ProgressTracker,
    progress: &ProgressBar,
) -> Result<(), SyncError>
where
    S: TargetStore + ?Sized,
{
    let result = executor.execute(batch, store).await;
    match result.status {
        BatchStatus::Success => info!(
            "Batch {}: {} record(s) [{}..{}], {} affected, {} retr{}, {}ms",
            batch.index,
            result.record_count,
            result.first_key.as_deref().unwrap_or("-"),
            result.last_key.as_deref().unwrap_or("-"),
            result.records_affected,
            result.retries,
            if result.retries == 1 { "y" } else { "ies" },
            result.duration_ms
        ),
        BatchStatus::Failed => warn!(
            "Batch {} left unresolved ({} record(s), source offsets {}..{})",
            batch.index, result.record_count, result.source_start, result.source_end
        ),
        BatchStatus::Skipped => debug!("Batch {} skipped", batch.index),
    }
    progress.inc(1);
    progress.set_message(format!("batch {}", batch.index));
    tracker.record(batch.index, result)
}

fn progress_bar(show: bool) -> ProgressBar {
    if !show || !std::io::stderr().is_terminal() {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner()
        .template("{spinner:.green} [{elapsed_precise}] {pos} batch(es) {msg}")
    {
        bar.set_style(style);
    }
    bar
}

fn log_summary(report: &RunReport) {
    let summary = &report.summary;
    info!(
        "Run {} {}: {} attempted, {} succeeded, {} failed, {} skipped; {} record(s) affected; success rate {:.1}%; {:.1} records/s",
        report.run_id,
        report.status.as_str(),
        summary.total_attempted,
        summary.total_succeeded,
        summary.total_failed,
        summary.total_skipped,
        summary.records_affected,
        summary.success_rate * 100.0,
        summary.throughput_records_per_sec
    );
    info!(
        "Coverage: {} present, {} absent, {} stale, {} without data",
        report.coverage.present,
        report.coverage.absent,
        report.coverage.stale,
        report.coverage.no_data
    );
    if !summary.failed_batch_indices.is_empty() {
        warn!(
            "Unresolved batches: {:?}; resume at batch {} (source offset {})",
            summary.failed_batch_indices, report.resume_batch_index, report.resume_source_offset
        );
    }
}
