use crate::commands::confirm::confirm;
use crate::config::SyncConfig;
use crate::context::AppContext;
use crate::http_client::auth_headers;
use crate::pipeline::{run_sync, RunOptions, RunOutcome};
use crate::source::{ApiSource, FileSource, RecordSource, TableSource};
use crate::tracker::{load_report, ResumePoint};
use anyhow::{anyhow, Context, Result};
use log::{info, warn};
use std::path::PathBuf;

/// Where `sync` and `coverage` read records from.
#[derive(Debug, Clone)]
pub enum SourceSpec {
    File {
        path: PathBuf,
        key_field: Option<String>,
    },
    Table {
        name: String,
        key_column: String,
    },
    Api {
        url: String,
        key_field: Option<String>,
    },
}

impl SourceSpec {
    pub fn label(&self) -> String {
        match self {
            SourceSpec::File { path, .. } => format!("file:{}", path.display()),
            SourceSpec::Table { name, .. } => format!("table:{}", name),
            SourceSpec::Api { url, .. } => format!("api:{}", url),
        }
    }
}

/// Command-line switches shared by the write commands.
#[derive(Debug, Clone, Default)]
pub struct RunFlags {
    pub yes: bool,
    /// Ignore the previous run report and start at the first record.
    pub fresh: bool,
    pub dry_run: bool,
    pub batch_size: Option<usize>,
}

impl RunFlags {
    /// Configuration with CLI overrides applied on top of the environment.
    pub fn apply(&self, base: &SyncConfig) -> Result<SyncConfig> {
        let mut config = base.clone();
        if let Some(batch_size) = self.batch_size {
            config.max_batch_size = batch_size;
        }
        config.executor.dry_run = self.dry_run;
        config.validate()?;
        Ok(config)
    }

    /// Where this run writes its report. Dry runs get a sibling file so they
    /// never replace the report of a real run.
    pub fn report_path(&self, config: &SyncConfig) -> PathBuf {
        if !self.dry_run {
            return config.report_path.clone();
        }
        let path = &config.report_path;
        let stem = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "run-report".to_string());
        let file_name = match path.extension() {
            Some(ext) => format!("{}.dry-run.{}", stem, ext.to_string_lossy()),
            None => format!("{}.dry-run", stem),
        };
        path.with_file_name(file_name)
    }

    /// Starting point read from the previous run report.
    ///
    /// A run resumes only when the previous report carries the same label and
    /// left work unresolved; otherwise it starts at the beginning. Dry runs
    /// always cover the whole source.
    pub fn resume_point(&self, config: &SyncConfig, label: &str) -> Result<ResumePoint> {
        let start = ResumePoint {
            batch_index: 0,
            source_offset: 0,
        };
        if self.fresh || self.dry_run || !config.report_path.exists() {
            return Ok(start);
        }

        let previous = load_report(&config.report_path)?;
        if previous.label != label {
            info!(
                "Previous run report at {} belongs to '{}'; starting from the beginning",
                config.report_path.display(),
                previous.label
            );
            return Ok(start);
        }
        if previous.is_resolved() {
            return Ok(start);
        }

        warn!(
            "Previous run {} ended {} with {} failed batch(es); resuming at batch {} (source offset {})",
            previous.run_id,
            previous.status.as_str(),
            previous.summary.total_failed,
            previous.resume_batch_index,
            previous.resume_source_offset
        );
        Ok(ResumePoint {
            batch_index: previous.resume_batch_index,
            source_offset: previous.resume_source_offset,
        })
    }
}

pub async fn open_source(
    app: &AppContext,
    spec: &SourceSpec,
    config: &SyncConfig,
    offset: u64,
) -> Result<Box<dyn RecordSource>> {
    let source: Box<dyn RecordSource> = match spec {
        SourceSpec::File { path, key_field } => {
            let mut source = FileSource::new(path.clone(), config.source.page_size)?;
            if let Some(key_field) = key_field {
                source = source.with_key_field(key_field.clone());
            }
            Box::new(source.starting_at(offset))
        }
        SourceSpec::Table { name, key_column } => {
            let db = app.database().await?;
            let source = TableSource::new(db, name, key_column, config.source.page_size)?;
            Box::new(source.starting_at(offset))
        }
        SourceSpec::Api { url, key_field } => {
            let headers = auth_headers(config.market_data_api_key.as_deref())?;
            let mut source = ApiSource::new(
                app.http_client()?,
                url.clone(),
                config.source.page_size,
                config.source.page_delay,
            )
            .with_headers(headers);
            if let Some(key_field) = key_field {
                source = source.with_key_field(key_field.clone());
            }
            Box::new(source.starting_at(offset))
        }
    };
    Ok(source)
}

pub async fn run(app: &AppContext, spec: &SourceSpec, flags: &RunFlags) -> Result<()> {
    let config = flags.apply(app.config())?;
    let label = format!("sync {}", spec.label());
    let resume = flags.resume_point(&config, &label)?;
    let mut source = open_source(app, spec, &config, resume.source_offset).await?;
    let mut store = app.target_store().await?;

    info!("Syncing {} into {}", source.describe(), store_label(app));
    if !config.executor.dry_run {
        confirm(
            &format!(
                "Upsert changed records from {} into the target database?",
                spec.label()
            ),
            flags.yes,
        )?;
    }

    let outcome = run_sync(
        source.as_mut(),
        &mut store,
        &config,
        RunOptions {
            label,
            resume: Some(resume),
            report_path: Some(flags.report_path(&config)),
            coverage_path: Some(config.coverage_path.clone()),
            show_progress: true,
        },
    )
    .await
    .context("sync run failed")?;

    ensure_resolved(&outcome)
}

/// Turns an unresolved run into an error so the process exits non-zero.
pub fn ensure_resolved(outcome: &RunOutcome) -> Result<()> {
    if let Some(reason) = outcome.abort_reason.as_ref() {
        return Err(anyhow!(
            "run {} interrupted: {}; rerun to continue at batch {} (source offset {})",
            outcome.report.run_id,
            reason,
            outcome.report.resume_batch_index,
            outcome.report.resume_source_offset
        ));
    }
    if !outcome.is_resolved() {
        return Err(anyhow!(
            "run {} left {} batch(es) unresolved: {:?}; rerun to retry from batch {}",
            outcome.report.run_id,
            outcome.report.summary.total_failed,
            outcome.report.summary.failed_batch_indices,
            outcome.report.resume_batch_index
        ));
    }
    Ok(())
}

fn store_label(app: &AppContext) -> String {
    app.database_url()
        .map(crate::database::redact)
        .unwrap_or_else(|| "the target database".to_string())
}
