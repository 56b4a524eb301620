use crate::config::ExecutorConfig;
use crate::error::SyncError;
use crate::models::{Batch, BatchResult, BatchStatus};
use crate::retry::retry_transient_operation;
use crate::store::TargetStore;
use chrono::Utc;
use log::{error, info, warn};
use std::time::Instant;

/// Turns each batch into one store write, with a single retry on transient errors
/// and a minimum gap between consecutive executions.
pub struct UpsertExecutor {
    config: ExecutorConfig,
    last_execution: Option<Instant>,
}

impl UpsertExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            config,
            last_execution: None,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    async fn throttle(&mut self) {
        if let Some(last) = self.last_execution {
            let elapsed = last.elapsed();
            if elapsed < self.config.min_batch_interval {
                tokio::time::sleep(self.config.min_batch_interval - elapsed).await;
            }
        }
        self.last_execution = Some(Instant::now());
    }

    pub async fn execute<S>(&mut self, batch: &Batch, store: &mut S) -> BatchResult
    where
        S: TargetStore + ?Sized,
    {
        let started = Instant::now();
        let mut result = BatchResult {
            batch_index: batch.index,
            status: BatchStatus::Skipped,
            error_kind: None,
            error_detail: None,
            records_affected: 0,
            record_count: batch.len(),
            retries: 0,
            first_key: batch.records.first().map(|record| record.key.clone()),
            last_key: batch.records.last().map(|record| record.key.clone()),
            source_start: batch.source_start,
            source_end: batch.source_end,
            duration_ms: 0,
            warnings: Vec::new(),
            completed_at: Utc::now(),
        };

        if self.config.dry_run {
            info!(
                "Dry run: skipping batch {} ({} record(s))",
                batch.index,
                batch.len()
            );
            result.completed_at = Utc::now();
            return result;
        }

        self.throttle().await;

        let context = format!("batch {}", batch.index);
        let (outcome, retries) = retry_transient_operation!(
            context,
            self.config.retry_backoff,
            store.write_batch(&batch.records)
        );
        result.retries = retries;

        match outcome {
            Ok(outcome) => {
                result.status = BatchStatus::Success;
                result.records_affected = outcome.records_affected;
                if self.config.verify_writes {
                    if let Some(warning) = verify_batch(batch, store).await {
                        warn!("Batch {}: {}", batch.index, warning);
                        result.warnings.push(warning);
                    }
                }
            }
            Err(err) => {
                error!(
                    "Batch {} failed after {} retr{}: {}",
                    batch.index,
                    retries,
                    if retries == 1 { "y" } else { "ies" },
                    err
                );
                result.status = BatchStatus::Failed;
                result.error_kind = Some(err.kind().to_string());
                result.error_detail = Some(err.to_string());
            }
        }

        result.duration_ms = started.elapsed().as_millis() as u64;
        result.completed_at = Utc::now();
        result
    }
}

/// Re-reads the batch keys and reports a mismatch instead of failing the batch.
async fn verify_batch<S>(batch: &Batch, store: &S) -> Option<String>
where
    S: TargetStore + ?Sized,
{
    let keys = batch.keys();
    match store.fetch_state(&keys).await {
        Ok(states) if states.len() == keys.len() => None,
        Ok(states) => Some(
            SyncError::ReconciliationMismatch {
                expected: keys.len(),
                found: states.len(),
            }
            .to_string(),
        ),
        Err(err) => Some(format!("post-write verification skipped: {}", err)),
    }
}
