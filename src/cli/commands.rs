//! CLI command definitions for nmt-pool.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use crate::config::DecoderConfig;
use crate::decoder::NeuralDecoder;
use crate::metrics::{export_metrics, init_metrics};
use crate::model::{Alignment, LanguageDirection, Sentence};
use crate::pool::AvailabilityListener;
use crate::process::PythonLauncher;
use crate::scheduler::TranslationSplit;

/// Default number of sentences scheduled on one worker at a time.
const DEFAULT_BATCH_SIZE: usize = 16;

/// Pool of neural decoder processes.
#[derive(Parser)]
#[command(name = "nmt-pool")]
#[command(about = "Run translation requests on a pool of neural decoder processes")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Translate sentences read from stdin, one per line.
    #[command(alias = "tr")]
    Translate(TranslateArgs),

    /// Validate a configuration file and print the planned pool layout.
    Check(CheckArgs),
}

/// Arguments for `nmt-pool translate`.
#[derive(Parser, Debug)]
pub struct TranslateArgs {
    /// Decoder configuration file (YAML).
    #[arg(short, long, env = "NMT_POOL_CONFIG")]
    pub config: PathBuf,

    /// Language direction, e.g. `en-it`.
    #[arg(short, long)]
    pub direction: String,

    /// Sentences scheduled on one worker per call.
    #[arg(short, long, default_value_t = DEFAULT_BATCH_SIZE)]
    pub batch_size: usize,

    /// Print one JSON object per sentence instead of plain text.
    #[arg(short, long)]
    pub json: bool,

    /// Print Prometheus metrics to stderr when done.
    #[arg(long)]
    pub metrics: bool,
}

/// Arguments for `nmt-pool check`.
#[derive(Parser, Debug)]
pub struct CheckArgs {
    /// Decoder configuration file (YAML).
    #[arg(short, long, env = "NMT_POOL_CONFIG")]
    pub config: PathBuf,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Translate(args) => run_translate_command(args).await,
        Commands::Check(args) => run_check_command(args),
    }
}

/// Logs every change in the number of alive workers.
struct LoggingListener;

impl AvailabilityListener for LoggingListener {
    fn on_availability_changed(&self, available: usize, capacity: usize) {
        if available == 0 {
            warn!(available, capacity, "No decoder workers alive");
        } else {
            info!(available, capacity, "Decoder availability changed");
        }
    }
}

#[derive(Debug, Serialize)]
struct TranslationLine<'a> {
    source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    translation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    alignment: Option<&'a Alignment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    decode_ms: u64,
}

async fn run_translate_command(args: TranslateArgs) -> anyhow::Result<()> {
    let direction: LanguageDirection = args
        .direction
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;

    let config = DecoderConfig::load(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;

    if args.metrics {
        init_metrics().context("Failed to initialize metrics")?;
    }

    let launcher = Arc::new(PythonLauncher::from_config(&config));
    let decoder = NeuralDecoder::new(&config, launcher).await?;
    decoder.set_availability_listener(Arc::new(LoggingListener));

    let mut splits = Vec::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        splits.push(TranslationSplit::new(Sentence::from_text(&line)));
    }
    info!(sentences = splits.len(), direction = %direction, "Translating");

    let batch_size = args.batch_size.max(1);
    let parallelism = config.capacity().max(1);
    let batches: Vec<Vec<TranslationSplit>> = splits
        .chunks(batch_size)
        .map(|chunk| chunk.to_vec())
        .collect();

    let results = stream::iter(batches.into_iter().map(|mut batch| {
        let decoder = &decoder;
        let direction = &direction;
        async move {
            let result = decoder.translate_splits(direction, &mut batch).await;
            (batch, result)
        }
    }))
    .buffered(parallelism)
    .collect::<Vec<_>>()
    .await;

    let mut failure = None;
    for (batch, result) in &results {
        for split in batch {
            print_split(split, args.json)?;
        }
        if let Err(e) = result {
            warn!(error = %e, "Batch aborted");
            failure.get_or_insert_with(|| e.clone());
        }
    }

    decoder.close().await;

    if args.metrics {
        eprint!("{}", export_metrics());
    }

    match failure {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

fn print_split(split: &TranslationSplit, json: bool) -> anyhow::Result<()> {
    let translation = split.translation();

    if json {
        let line = TranslationLine {
            source: split.sentence.serialize(),
            translation: translation.map(|t| t.text()),
            alignment: translation.and_then(|t| t.alignment.as_ref()),
            error: match &split.output {
                Some(Err(e)) => Some(e.to_string()),
                _ => None,
            },
            decode_ms: split.timing.decode_time.as_millis() as u64,
        };
        println!("{}", serde_json::to_string(&line)?);
    } else {
        println!("{}", translation.map(|t| t.text()).unwrap_or_default());
    }

    Ok(())
}

fn run_check_command(args: CheckArgs) -> anyhow::Result<()> {
    let config = DecoderConfig::load(&args.config)
        .with_context(|| format!("Invalid configuration {}", args.config.display()))?;

    println!("Configuration: {}", args.config.display());
    if config.echo {
        println!("Mode:          echo (no decoder workers)");
    } else {
        println!("Placement:     {}", config.placement());
        println!("Capacity:      {}", config.capacity());
    }
    println!("Timeout:       {}s per request", config.request_timeout_secs);
    println!(
        "Respawn:       {} attempts, {}ms backoff",
        config.respawn.max_attempts, config.respawn.backoff_ms
    );

    let mut directions: Vec<_> = config.checkpoint_map()?.into_iter().collect();
    directions.sort_by_key(|(direction, _)| direction.to_string());
    for (direction, checkpoint) in directions {
        println!("  {:<10} {}", direction.to_string(), checkpoint);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_translate() {
        let cli = Cli::try_parse_from([
            "nmt-pool",
            "translate",
            "--config",
            "decoder.yaml",
            "--direction",
            "en-it",
            "--json",
        ])
        .unwrap();

        match cli.command {
            Commands::Translate(args) => {
                assert_eq!(args.direction, "en-it");
                assert_eq!(args.batch_size, DEFAULT_BATCH_SIZE);
                assert!(args.json);
            }
            _ => panic!("expected translate"),
        }
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_check_command() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "threads: 2\ncheckpoints:\n  - direction: en-it\n    path: /models/en-it.pt\n"
        )
        .unwrap();

        let args = CheckArgs {
            config: file.path().to_path_buf(),
        };
        assert!(run_check_command(args).is_ok());
    }
}
