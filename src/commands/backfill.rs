use crate::commands::confirm::confirm;
use crate::commands::sync::{ensure_resolved, RunFlags};
use crate::context::AppContext;
use crate::market_data::HttpMarketDataProvider;
use crate::pipeline::{run_sync, RunOptions};
use crate::source::ProviderSource;
use anyhow::{anyhow, Context, Result};
use log::info;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;

/// Fetches price and dividend history from the market-data provider and
/// fills whatever the target is missing.
///
/// Symbols come from `symbols`, then `symbols_file`, and otherwise from the
/// instruments already present in the target.
pub async fn run(
    app: &AppContext,
    symbols: &[String],
    symbols_file: Option<&Path>,
    flags: &RunFlags,
) -> Result<()> {
    let config = flags.apply(app.config())?;
    let base_url = config.market_data_url.as_deref().ok_or_else(|| {
        anyhow!("MARKET_DATA_URL must be set to backfill from the market-data provider.")
    })?;
    let mut store = app.target_store().await?;

    let symbols = if !symbols.is_empty() {
        symbols.to_vec()
    } else if let Some(path) = symbols_file {
        read_symbols_file(path)?
    } else {
        store.list_symbols().await?
    };
    if symbols.is_empty() {
        info!("No symbols to backfill");
        return Ok(());
    }

    let provider = HttpMarketDataProvider::new(
        app.http_client()?,
        base_url,
        config.market_data_api_key.as_deref(),
    )?
    .with_request_delay(config.source.page_delay);
    let source = ProviderSource::new(provider, &symbols, config.source.page_size)
        .with_retry_backoff(config.executor.retry_backoff);
    let label = backfill_label(source.symbols());
    let resume = flags.resume_point(&config, &label)?;
    let mut source = source.starting_at(resume.source_offset);

    info!(
        "Backfilling {} symbol(s) from {}",
        source.symbols().len(),
        base_url
    );
    if !config.executor.dry_run {
        confirm(
            &format!(
                "Backfill history for {} symbol(s) into the target database?",
                source.symbols().len()
            ),
            flags.yes,
        )?;
    }

    let outcome = run_sync(
        &mut source,
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
    .context("backfill run failed")?;

    ensure_resolved(&outcome)
}

/// Run label naming the exact ordered symbol list, so a resume offset is only
/// ever applied to the list it was recorded against.
pub fn backfill_label(symbols: &[String]) -> String {
    let mut hasher = Sha256::new();
    for symbol in symbols {
        hasher.update(symbol.as_bytes());
        hasher.update(b"\n");
    }
    let digest = hex::encode(hasher.finalize());
    format!("backfill {} symbol(s) [{}]", symbols.len(), &digest[..16])
}

/// One symbol per line or comma separated; `#` starts a comment.
fn read_symbols_file(path: &Path) -> Result<Vec<String>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read symbols from {}", path.display()))?;
    Ok(parse_symbol_list(&raw))
}

fn parse_symbol_list(raw: &str) -> Vec<String> {
    raw.lines()
        .map(|line| line.split('#').next().unwrap_or(""))
        .flat_map(|line| line.split(','))
        .map(str::trim)
        .filter(|symbol| !symbol.is_empty())
        .map(str::to_string)
        .collect()
}
