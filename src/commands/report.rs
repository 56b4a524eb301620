use crate::models::{BatchStatus, RunReport};
use crate::tracker::load_report;
use anyhow::{Context, Result};
use std::fmt::Write;
use std::path::Path;

/// Prints the summary of a saved run report to stdout.
pub fn run(path: &Path, show_batches: bool) -> Result<()> {
    let report = load_report(path).with_context(|| format!("cannot show {}", path.display()))?;
    print!("{}", render_summary(&report, show_batches));
    Ok(())
}

pub fn render_summary(report: &RunReport, show_batches: bool) -> String {
    let summary = &report.summary;
    let mut out = String::new();
    let _ = writeln!(out, "Run {} ({})", report.run_id, report.label);
    let _ = writeln!(out, "  status:            {}", report.status.as_str());
    if let Some(started_at) = report.started_at {
        let _ = writeln!(out, "  started:           {}", started_at.to_rfc3339());
    }
    if let Some(ended_at) = report.ended_at {
        let _ = writeln!(out, "  ended:             {}", ended_at.to_rfc3339());
    }
    let planned = report
        .planned_batches
        .map(|planned| planned.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let _ = writeln!(out, "  planned batches:   {}", planned);
    let _ = writeln!(
        out,
        "  batches:           {} attempted, {} succeeded, {} failed, {} skipped",
        summary.total_attempted, summary.total_succeeded, summary.total_failed, summary.total_skipped
    );
    let _ = writeln!(
        out,
        "  records:           {} attempted, {} succeeded, {} affected",
        summary.records_attempted, summary.records_succeeded, summary.records_affected
    );
    let _ = writeln!(out, "  success rate:      {:.1}%", summary.success_rate * 100.0);
    let _ = writeln!(
        out,
        "  elapsed:           {:.1}s ({:.1} records/s)",
        summary.elapsed_seconds, summary.throughput_records_per_sec
    );
    let _ = writeln!(
        out,
        "  coverage:          {} present, {} absent, {} stale, {} no data",
        report.coverage.present, report.coverage.absent, report.coverage.stale, report.coverage.no_data
    );
    if !summary.failed_batch_indices.is_empty() {
        let _ = writeln!(out, "  failed batches:    {:?}", summary.failed_batch_indices);
    }
    if !report.is_resolved() {
        let _ = writeln!(
            out,
            "  resume at:         batch {} (source offset {})",
            report.resume_batch_index, report.resume_source_offset
        );
    }

    if show_batches {
        for batch in &report.batches {
            let _ = write!(
                out,
                "  #{:<5} {:<8} {:>4} record(s) {:>3} retr. [{}..{}]",
                batch.batch_index,
                batch.status.as_str(),
                batch.record_count,
                batch.retries,
                batch.first_key.as_deref().unwrap_or("-"),
                batch.last_key.as_deref().unwrap_or("-"),
            );
            if batch.status == BatchStatus::Failed {
                let _ = write!(
                    out,
                    " {}: {}",
                    batch.error_kind.as_deref().unwrap_or("error"),
                    batch.error_detail.as_deref().unwrap_or("")
                );
            }
            for warning in &batch.warnings {
                let _ = write!(out, " (warning: {})", warning);
            }
            out.push('\n');
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BatchResult, CoverageStatus};
    use crate::tracker::ProgressTracker;
    use chrono::Utc;

    fn failed_result(index: usize) -> BatchResult {
        BatchResult {
            batch_index: index,
            status: BatchStatus::Failed,
            error_kind: Some("permanent_write".to_string()),
            error_detail: Some("value too long".to_string()),
            records_affected: 0,
            record_count: 5,
            retries: 0,
            first_key: Some("AAA".to_string()),
            last_key: Some("EEE".to_string()),
            source_start: 0,
            source_end: 5,
            duration_ms: 3,
            warnings: Vec::new(),
            completed_at: Utc::now(),
        }
    }

    #[test]
    fn summary_names_failures_and_resume_point() {
        let mut tracker = ProgressTracker::new("sync test");
        tracker.start();
        tracker.observe(CoverageStatus::Absent);
        tracker.record(0, failed_result(0)).expect("record");
        tracker.set_planned(1);

        let rendered = render_summary(&tracker.finalize(), true);
        assert!(rendered.contains("1 attempted, 0 succeeded, 1 failed"));
        assert!(rendered.contains("failed batches:    [0]"));
        assert!(rendered.contains("resume at:         batch 0 (source offset 0)"));
        assert!(rendered.contains("permanent_write: value too long"));
    }
}
