use crate::commands::sync::{open_source, SourceSpec};
use crate::context::AppContext;
use crate::coverage::write_coverage;
use crate::pipeline::survey;
use anyhow::{Context, Result};
use log::info;
use std::path::PathBuf;

/// Classifies the source against the target and writes the coverage CSV. Never writes to the target.
pub async fn run(app: &AppContext, spec: &SourceSpec, output: Option<PathBuf>) -> Result<()> {
    let config = app.config();
    let output = output.unwrap_or_else(|| config.coverage_path.clone());
    let mut source = open_source(app, spec, config, 0).await?;
    let store = app.target_store().await?;

    let (tally, rows) = survey(source.as_mut(), &store, config)
        .await
        .context("coverage survey failed")?;
    write_coverage(&rows, &output)?;

    info!(
        "{} key(s) surveyed; {} would be written. Coverage report: {}",
        rows.len(),
        tally.needing_write(),
        output.display()
    );
    Ok(())
}
