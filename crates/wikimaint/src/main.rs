use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use wikimaint_core::applier::MutationTask;
use wikimaint_core::checkpoint::CheckpointStore;
use wikimaint_core::config::{
    DEFAULT_CONFIG_FILENAME, LagSettings, RunOverrides, load_config, process_env, resolve_config,
};
use wikimaint_core::gate::LagOracle;
use wikimaint_core::interrupt::Interrupt;
use wikimaint_core::lag::{ApiLagOracle, HeartbeatLagOracle, NoReplicas};
use wikimaint_core::report::{JsonReporter, Reporter, TextReporter};
use wikimaint_core::run::BatchRunner;
use wikimaint_core::sqlite::{SqliteRowSource, SqliteWriteSink};
use wikimaint_core::tasks::{
    Backfill, CleanupProperties, ColumnCopy, MigrateBlobRefs, RewriteField,
};

const LAG_API_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Parser)]
#[command(
    name = "wikimaint",
    version,
    about = "Batched, replication-aware bulk maintenance for wiki databases"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH", help = "TOML config file")]
    config: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH", help = "Primary (writable) database")]
    db: Option<PathBuf>,
    #[arg(
        long,
        global = true,
        value_name = "PATH",
        help = "Replica database to read from (defaults to --db)"
    )]
    replica_db: Option<PathBuf>,
    #[arg(long, global = true, value_name = "N", allow_negative_numbers = true)]
    batch_size: Option<i64>,
    #[arg(
        long,
        global = true,
        value_name = "KEY",
        allow_negative_numbers = true,
        help = "Resume from this key"
    )]
    start: Option<i64>,
    #[arg(long, global = true, help = "Decide and log, but write nothing")]
    dry_run: bool,
    #[arg(long, global = true, value_name = "SECONDS", help = "Pause after every window")]
    sleep: Option<f64>,
    #[arg(long, global = true, help = "Abort on the first row error")]
    fail_fast: bool,
    #[arg(long, global = true, value_name = "SECONDS")]
    max_lag: Option<f64>,
    #[arg(long, global = true, value_name = "SECONDS")]
    lag_timeout: Option<f64>,
    #[arg(
        long = "replica-heartbeat",
        global = true,
        value_name = "PATH",
        help = "Replica database with a heartbeat table (repeatable)"
    )]
    replica_heartbeats: Vec<PathBuf>,
    #[arg(long, global = true, value_name = "URL", help = "MediaWiki api.php for dbrepllag")]
    lag_api_url: Option<String>,
    #[arg(long, global = true, value_name = "PATH", help = "Write a checkpoint after every window")]
    checkpoint: Option<PathBuf>,
    #[arg(long, global = true, help = "Start from the checkpoint cursor")]
    resume: bool,
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,
    #[arg(short, long, global = true, help = "Debug logging")]
    verbose: bool,
    #[arg(long, global = true, help = "Print resolved settings and their sources")]
    diagnostics: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Set a column to a new value where it equals an old one")]
    RewriteField(RewriteFieldArgs),
    #[command(about = "Delete property rows that restate the default value")]
    CleanupProperties(CleanupPropertiesArgs),
    #[command(about = "Move blob addresses from one storage prefix to another")]
    MigrateBlobRefs(MigrateBlobRefsArgs),
    #[command(about = "Insert missing rows into a target table")]
    Backfill(BackfillArgs),
}

#[derive(Debug, Args)]
struct RewriteFieldArgs {
    #[arg(long)]
    table: String,
    #[arg(long)]
    key_column: String,
    #[arg(long)]
    column: String,
    #[arg(long)]
    from: String,
    #[arg(long)]
    to: String,
}

#[derive(Debug, Args)]
struct CleanupPropertiesArgs {
    #[arg(long, default_value = "user_properties")]
    table: String,
    #[arg(long, default_value = "rowid")]
    key_column: String,
    #[arg(long, default_value = "up_property")]
    property_column: String,
    #[arg(long, default_value = "up_value")]
    value_column: String,
    #[arg(long = "property", value_name = "NAME", required = true)]
    properties: Vec<String>,
    #[arg(long)]
    default_value: String,
}

#[derive(Debug, Args)]
struct MigrateBlobRefsArgs {
    #[arg(long, default_value = "text")]
    table: String,
    #[arg(long, default_value = "old_id")]
    key_column: String,
    #[arg(long, default_value = "old_text")]
    column: String,
    #[arg(long)]
    from_prefix: String,
    #[arg(long)]
    to_prefix: String,
}

#[derive(Debug, Args)]
struct BackfillArgs {
    #[arg(long)]
    table: String,
    #[arg(long)]
    key_column: String,
    #[arg(long)]
    marker_column: String,
    #[arg(long)]
    target_table: String,
    #[arg(
        long = "copy",
        value_name = "SOURCE[:TARGET]",
        required = true,
        value_parser = parse_column_copy
    )]
    copies: Vec<ColumnCopy>,
}

fn parse_column_copy(raw: &str) -> Result<ColumnCopy, String> {
    ColumnCopy::parse(raw).ok_or_else(|| format!("expected SOURCE[:TARGET], got {raw:?}"))
}

impl Commands {
    fn into_task(self) -> Box<dyn MutationTask> {
        match self {
            Self::RewriteField(args) => Box::new(RewriteField {
                table: args.table,
                key_column: args.key_column,
                column: args.column,
                from: args.from,
                to: args.to,
            }),
            Self::CleanupProperties(args) => Box::new(CleanupProperties {
                table: args.table,
                key_column: args.key_column,
                property_column: args.property_column,
                value_column: args.value_column,
                properties: args.properties,
                default_value: args.default_value,
            }),
            Self::MigrateBlobRefs(args) => Box::new(MigrateBlobRefs {
                table: args.table,
                key_column: args.key_column,
                column: args.column,
                from_prefix: args.from_prefix,
                to_prefix: args.to_prefix,
            }),
            Self::Backfill(args) => Box::new(Backfill {
                table: args.table,
                key_column: args.key_column,
                marker_column: args.marker_column,
                target_table: args.target_table,
                copies: args.copies,
            }),
        }
    }
}

impl Cli {
    fn overrides(&self) -> RunOverrides {
        RunOverrides {
            batch_size: self.batch_size,
            start: self.start,
            dry_run: self.dry_run,
            sleep_secs: self.sleep,
            fail_fast: self.fail_fast,
            max_lag_secs: self.max_lag,
            lag_timeout_secs: self.lag_timeout,
            checkpoint: self.checkpoint.clone(),
            heartbeat_replicas: self.replica_heartbeats.clone(),
            lag_api_url: self.lag_api_url.clone(),
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(cli.verbose, None))
        .with_writer(io::stderr)
        .with_target(false)
        .init();

    match run(cli) {
        Ok(code) => code,
        Err(error) => {
            error!("{error:#}");
            ExitCode::FAILURE
        }
    }
}

/// Loads `.env` (or `env_file`) first so a `RUST_LOG` set there takes effect.
fn log_filter(verbose: bool, env_file: Option<&Path>) -> EnvFilter {
    if let Some(path) = env_file {
        dotenvy::from_path(path).ok();
    } else {
        dotenvy::dotenv().ok();
    }
    let default_level = if verbose { "debug" } else { "info" };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

fn run(cli: Cli) -> Result<ExitCode> {
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILENAME));
    let file = load_config(&config_path)?;
    let resolved = resolve_config(&file, &cli.overrides(), &process_env)?;
    if cli.diagnostics {
        eprintln!("[diagnostics]\n{}", resolved.diagnostics());
    }

    let Some(db) = cli.db.clone() else {
        bail!("--db is required");
    };
    let replica_db = cli.replica_db.clone().unwrap_or_else(|| db.clone());
    let task = cli.command.into_task();
    let mut run_config = resolved.run;

    let checkpoint = run_config
        .checkpoint
        .as_deref()
        .map(|path| CheckpointStore::new(path, &task));
    if cli.resume {
        let Some(store) = &checkpoint else {
            bail!("--resume needs --checkpoint");
        };
        if run_config.start.is_none() {
            run_config.start = store.resume_cursor()?;
            if let Some(start) = run_config.start {
                info!("resuming from checkpoint {} at key {start}", store.path().display());
            }
        }
    }

    let source = SqliteRowSource::open(&replica_db, task.table(), task.key_column(), task.columns())?;
    let sink = SqliteWriteSink::open(&db)?;
    let oracle = build_oracle(&resolved.lag)?;

    let interrupt = Interrupt::new();
    let handler = interrupt.clone();
    ctrlc::set_handler(move || handler.trigger())
        .context("failed to install interrupt handler")?;

    let mut reporter: Box<dyn Reporter> = match cli.format {
        OutputFormat::Text => Box::new(TextReporter::new(io::stdout(), run_config.dry_run)),
        OutputFormat::Json => Box::new(JsonReporter::new(io::stdout())),
    };

    let mut runner =
        BatchRunner::new(run_config, source, task, sink, oracle).with_interrupt(interrupt);
    if let Some(store) = checkpoint {
        runner = runner.with_checkpoint(store);
    }

    match runner.run(reporter.as_mut()) {
        Ok(_) => Ok(ExitCode::SUCCESS),
        Err(_) => Ok(ExitCode::FAILURE),
    }
}

fn build_oracle(lag: &LagSettings) -> Result<Box<dyn LagOracle>> {
    if !lag.heartbeat_replicas.is_empty() {
        return Ok(Box::new(HeartbeatLagOracle::new(
            lag.heartbeat_replicas.clone(),
        )));
    }
    if let Some(api_url) = &lag.api_url {
        return Ok(Box::new(ApiLagOracle::new(
            api_url,
            &lag.user_agent,
            LAG_API_TIMEOUT,
        )?));
    }
    Ok(Box::new(NoReplicas))
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_flags_follow_the_subcommand() {
        let cli = Cli::try_parse_from([
            "wikimaint",
            "rewrite-field",
            "--table",
            "page",
            "--key-column",
            "page_id",
            "--column",
            "page_lang",
            "--from",
            "X",
            "--to",
            "Y",
            "--batch-size",
            "50",
            "--start=101",
            "--dry-run",
        ])
        .expect("parse");

        let overrides = cli.overrides();
        assert_eq!(overrides.batch_size, Some(50));
        assert_eq!(overrides.start, Some(101));
        assert!(overrides.dry_run);

        let task = cli.command.into_task();
        assert_eq!(task.name(), "rewrite-field");
        assert_eq!(task.table(), "page");
    }

    #[test]
    fn negative_batch_size_reaches_validation() {
        let cli = Cli::try_parse_from([
            "wikimaint",
            "--batch-size=-5",
            "migrate-blob-refs",
            "--from-prefix",
            "DB://cluster1/",
            "--to-prefix",
            "DB://cluster7/",
        ])
        .expect("parse");
        assert_eq!(cli.batch_size, Some(-5));
    }

    #[test]
    fn backfill_copies_are_parsed() {
        let cli = Cli::try_parse_from([
            "wikimaint",
            "backfill",
            "--table",
            "revision",
            "--key-column",
            "rev_id",
            "--marker-column",
            "rev_content_id",
            "--target-table",
            "slots",
            "--copy",
            "rev_id:slot_revision_id",
            "--copy",
            "rev_sha1",
        ])
        .expect("parse");
        let task = cli.command.into_task();
        assert_eq!(task.columns(), vec!["rev_content_id", "rev_id", "rev_sha1"]);

        let error = Cli::try_parse_from([
            "wikimaint",
            "backfill",
            "--table",
            "revision",
            "--key-column",
            "rev_id",
            "--marker-column",
            "rev_content_id",
            "--target-table",
            "slots",
            "--copy",
            ":slot_revision_id",
        ])
        .expect_err("bad copy");
        assert!(error.to_string().contains("SOURCE[:TARGET]"));
    }

    #[test]
    fn env_file_log_level_reaches_the_filter() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let temp = tempfile::tempdir().expect("tempdir");
        let env_file = temp.path().join(".env");
        std::fs::write(&env_file, "RUST_LOG=wikimaint_core=trace\n").expect("write .env");

        let filter = log_filter(false, Some(&env_file));
        assert!(filter.to_string().contains("wikimaint_core=trace"), "{filter}");
    }

    #[test]
    fn cleanup_properties_requires_a_property() {
        assert!(
            Cli::try_parse_from(["wikimaint", "cleanup-properties", "--default-value", "0"])
                .is_err()
        );
    }
}
