use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use etf_sync::{
    commands::{
        backfill, coverage, report,
        sync::{self, RunFlags, SourceSpec},
    },
    config::SyncConfig,
    context::AppContext,
};
use log::info;
use std::env;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "etf-sync")]
#[command(about = "Batch synchronization of instrument data into the ETF platform database")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct SourceArgs {
    /// CSV or JSON Lines file with one record per row
    #[arg(long, value_name = "PATH", conflicts_with_all = ["table", "api"])]
    file: Option<PathBuf>,
    /// Postgres table (optionally schema-qualified) read in key order
    #[arg(long, value_name = "NAME", conflicts_with = "api")]
    table: Option<String>,
    /// Paginated JSON endpoint taking offset/limit query parameters
    #[arg(long, value_name = "URL")]
    api: Option<String>,
    /// Field or column holding the record key
    #[arg(long = "key-field", value_name = "NAME")]
    key_field: Option<String>,
}

impl SourceArgs {
    fn into_spec(self) -> Result<SourceSpec> {
        let SourceArgs {
            file,
            table,
            api,
            key_field,
        } = self;
        if let Some(path) = file {
            return Ok(SourceSpec::File { path, key_field });
        }
        if let Some(name) = table {
            return Ok(SourceSpec::Table {
                name,
                key_column: key_field.unwrap_or_else(|| "symbol".to_string()),
            });
        }
        if let Some(url) = api {
            return Ok(SourceSpec::Api { url, key_field });
        }
        Err(anyhow!("one of --file, --table or --api is required"))
    }
}

#[derive(Args, Clone)]
struct WriteArgs {
    /// Skip the interactive confirmation
    #[arg(short, long)]
    yes: bool,
    /// Ignore the previous run report and start at the first record
    #[arg(long)]
    fresh: bool,
    /// Classify and batch without writing; every batch is recorded as skipped
    #[arg(long = "dry-run")]
    dry_run: bool,
    /// Maximum records per batch (overrides SYNC_BATCH_SIZE)
    #[arg(long = "batch-size", value_name = "N")]
    batch_size: Option<usize>,
}

impl From<WriteArgs> for RunFlags {
    fn from(args: WriteArgs) -> Self {
        RunFlags {
            yes: args.yes,
            fresh: args.fresh,
            dry_run: args.dry_run,
            batch_size: args.batch_size,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Upsert absent or stale records from a file, table or API into the target
    Sync {
        #[command(flatten)]
        source: SourceArgs,
        #[command(flatten)]
        write: WriteArgs,
    },
    /// Fill missing price and dividend history from the market-data provider
    Backfill {
        /// Symbols to backfill (comma separated); defaults to every tracked instrument
        #[arg(long, value_delimiter = ',')]
        symbols: Vec<String>,
        /// File listing symbols, one per line
        #[arg(long = "symbols-file", value_name = "PATH", conflicts_with = "symbols")]
        symbols_file: Option<PathBuf>,
        #[command(flatten)]
        write: WriteArgs,
    },
    /// Write the coverage report for a source without touching the target
    Coverage {
        #[command(flatten)]
        source: SourceArgs,
        /// Destination CSV (defaults to SYNC_COVERAGE_PATH)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
    /// Print the summary of a saved run report
    Report {
        /// Report file (defaults to SYNC_REPORT_PATH)
        #[arg(value_name = "PATH")]
        path: Option<PathBuf>,
        /// List every batch
        #[arg(long)]
        batches: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let Cli { command } = cli;

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let database_url = env::var("DATABASE_URL").ok();
    if database_url.is_none() && command_requires_database(&command) {
        return Err(anyhow!("DATABASE_URL must be set for this command."));
    }
    let config = SyncConfig::from_env()?;
    let app_context = AppContext::initialize(database_url, config).await?;

    match command {
        Commands::Sync { source, write } => {
            let spec = source.into_spec()?;
            info!("Starting sync from {}", spec.label());
            sync::run(&app_context, &spec, &write.into()).await?;
        }
        Commands::Backfill {
            symbols,
            symbols_file,
            write,
        } => {
            backfill::run(
                &app_context,
                &symbols,
                symbols_file.as_deref(),
                &write.into(),
            )
            .await?;
        }
        Commands::Coverage { source, output } => {
            let spec = source.into_spec()?;
            coverage::run(&app_context, &spec, output).await?;
        }
        Commands::Report { path, batches } => {
            let path = path.unwrap_or_else(|| app_context.config().report_path.clone());
            report::run(&path, batches)?;
        }
    }

    Ok(())
}

fn command_requires_database(command: &Commands) -> bool {
    match command {
        Commands::Sync { .. } | Commands::Backfill { .. } | Commands::Coverage { .. } => true,
        Commands::Report { .. } => false,
    }
}
