use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Local, SecondsFormat, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use smartvision_contracts::events::{
    ChannelSink, EventSink, EventWriter, FanoutSink, LogLevel, PipelineEvent,
};
use smartvision_contracts::runs::summary::{write_summary, BatchSummary};
use smartvision_contracts::{BatchRequest, CommitStrategy, KeywordPolicy};
use smartvision_engine::{
    discover_images, ApiKeySource, BatchOrchestrator, CredentialStore, EngineConfig,
    OpenAiVisionClient,
};

#[derive(Debug, Parser)]
#[command(
    name = "smartvision",
    version,
    about = "Describe a folder of images with a vision model and record the results"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Describe every image in a folder and embed or tabulate the results.
    Enrich(EnrichArgs),
    /// List the images a batch over this folder would process.
    Discover(DiscoverArgs),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StrategyArg {
    Embed,
    Ledger,
}

impl From<StrategyArg> for CommitStrategy {
    fn from(value: StrategyArg) -> Self {
        match value {
            StrategyArg::Embed => CommitStrategy::Embed,
            StrategyArg::Ledger => CommitStrategy::Ledger,
        }
    }
}

#[derive(Debug, Parser)]
struct EnrichArgs {
    #[arg(long, required_unless_present = "prompt_file", conflicts_with = "prompt_file")]
    prompt: Option<String>,
    #[arg(long)]
    prompt_file: Option<PathBuf>,
    #[arg(long)]
    source: PathBuf,
    #[arg(long)]
    dest: Option<PathBuf>,
    #[arg(long)]
    author: Option<String>,
    #[arg(long, value_enum, default_value = "embed")]
    strategy: StrategyArg,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    summary: Option<PathBuf>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    timeout_secs: Option<u64>,
    #[arg(long)]
    credentials: Option<PathBuf>,
    #[arg(long)]
    case_sensitive_keywords: bool,
    /// Also print debug-level events.
    #[arg(long, short)]
    verbose: bool,
}

#[derive(Debug, Parser)]
struct DiscoverArgs {
    #[arg(long)]
    source: PathBuf,
    #[arg(long)]
    dest: Option<PathBuf>,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("smartvision error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Enrich(args) => run_enrich(args),
        Command::Discover(args) => run_discover(args),
    }
}

fn run_enrich(args: EnrichArgs) -> Result<i32> {
    let prompt = match (&args.prompt, &args.prompt_file) {
        (Some(prompt), _) => prompt.clone(),
        (None, Some(path)) => fs::read_to_string(path)
            .with_context(|| format!("failed reading prompt file {}", path.display()))?,
        (None, None) => return Err(anyhow!("either --prompt or --prompt-file is required")),
    };

    let mut config = EngineConfig::from_env();
    if let Some(model) = &args.model {
        config.model = model.clone();
    }
    if let Some(secs) = args.timeout_secs {
        config.request_timeout = Duration::from_secs(secs);
    }
    let store = match &args.credentials {
        Some(path) => Some(CredentialStore::new(path)),
        None => CredentialStore::locate(config.data_dir.as_deref()),
    };
    let client = OpenAiVisionClient::new(&config, ApiKeySource::from_env(store))?;

    let strategy: CommitStrategy = args.strategy.into();
    let mut request = BatchRequest::new(prompt, &args.source, strategy);
    if let Some(dest) = &args.dest {
        request = request.with_destination(dest);
    }
    if let Some(author) = &args.author {
        request = request.with_author(author);
    }
    request.keyword_policy = KeywordPolicy {
        case_sensitive: args.case_sensitive_keywords,
    };

    let (sender, receiver) = mpsc::channel::<PipelineEvent>();
    let mut sink = FanoutSink::default();
    sink.push(Arc::new(ChannelSink::new(sender)));
    if let Some(path) = &args.events {
        sink.push(Arc::new(EventWriter::new(path)));
    }
    let sink: Arc<dyn EventSink> = Arc::new(sink);

    let mut orchestrator = BatchOrchestrator::new(request, config, Arc::new(client), sink);
    let batch_id = orchestrator.batch_id().to_string();
    let started_at = now_utc_iso();
    let worker = thread::Builder::new()
        .name("smartvision-batch".to_string())
        .spawn(move || orchestrator.run())
        .context("failed to start batch worker")?;

    // The channel closes once the worker drops its orchestrator.
    let stderr = io::stderr();
    for event in receiver {
        if event.level == LogLevel::Debug && !args.verbose {
            continue;
        }
        let mut out = stderr.lock();
        let _ = writeln!(out, "{}", render_event(&event));
    }

    let outcome = worker
        .join()
        .map_err(|_| anyhow!("batch worker panicked"))?;
    match outcome {
        Ok(stats) => {
            println!("{}", stats.summary_line());
            if let Some(path) = &args.summary {
                let summary = BatchSummary::from_stats(
                    &batch_id,
                    &started_at,
                    &now_utc_iso(),
                    strategy.as_str(),
                    &stats,
                );
                write_summary(path, &summary, None)
                    .with_context(|| format!("failed writing summary {}", path.display()))?;
            }
            Ok(0)
        }
        Err(err) => {
            eprintln!("smartvision: batch aborted: {err}");
            Ok(err.exit_code())
        }
    }
}

fn run_discover(args: DiscoverArgs) -> Result<i32> {
    let config = EngineConfig::from_env();
    let dest = args.dest.clone().unwrap_or_else(|| args.source.clone());
    let tasks = discover_images(&args.source, &dest, &config.extensions)?;
    if tasks.is_empty() {
        eprintln!(
            "smartvision: no image files found in {}",
            args.source.display()
        );
        return Ok(2);
    }
    for task in &tasks {
        println!(
            "{}\t{}",
            task.name(),
            task.destination_path().display()
        );
    }
    Ok(0)
}

fn render_event(event: &PipelineEvent) -> String {
    let stamp = DateTime::parse_from_rfc3339(&event.ts)
        .map(|ts| ts.with_timezone(&Local))
        .unwrap_or_else(|_| Local::now());
    format!(
        "{} - {} - {}",
        stamp.format("%d/%m/%Y %H:%M:%S"),
        event.level.as_str().to_ascii_uppercase(),
        event.message
    )
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use smartvision_contracts::events::{EventPayload, LogLevel, PipelineEvent};

    use super::{render_event, Cli, Command, StrategyArg};

    #[test]
    fn enrich_requires_a_prompt_source() {
        assert!(Cli::try_parse_from(["smartvision", "enrich", "--source", "/in"]).is_err());
        assert!(Cli::try_parse_from([
            "smartvision",
            "enrich",
            "--prompt",
            "p",
            "--prompt-file",
            "p.txt",
            "--source",
            "/in",
        ])
        .is_err());
    }

    #[test]
    fn enrich_parses_ledger_strategy() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from([
            "smartvision",
            "enrich",
            "--prompt",
            "Describe",
            "--source",
            "/in",
            "--strategy",
            "ledger",
            "--case-sensitive-keywords",
        ])?;
        let Command::Enrich(args) = cli.command else {
            anyhow::bail!("expected enrich");
        };
        assert!(matches!(args.strategy, StrategyArg::Ledger));
        assert!(args.case_sensitive_keywords);
        assert_eq!(args.dest, None);
        Ok(())
    }

    #[test]
    fn events_render_as_console_lines() {
        let event = PipelineEvent {
            kind: "item_failed".to_string(),
            level: LogLevel::Error,
            message: "Error processing a.jpg: boom".to_string(),
            batch_id: "batch-1".to_string(),
            ts: "2026-10-19T14:05:09.000000+00:00".to_string(),
            fields: EventPayload::new(),
        };
        let line = render_event(&event);
        assert!(line.ends_with(" - ERROR - Error processing a.jpg: boom"));
        assert_eq!(line.split(" - ").next().map(str::len), Some(19));
    }
}
