mod archive;
mod classifier;
mod config;
mod error;
mod pipeline;
mod report;
mod sink;
mod taxonomy;
mod years;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use classifier::{Classifier, ClassifierAdapter, OfflineClassifier, OpenAiClassifier};
use config::{LoadedConfig, locate_config};
use pipeline::{Pipeline, RunOptions};
use sink::EventSink;
use taxonomy::{MatchMode, Taxonomy};

#[derive(Parser)]
#[command(
    name = "sophism_audit",
    about = "Detect and report rhetorical manipulation in yearly message archives"
)]
struct Cli {
    /// Relation id or name (defaults to the only configured relation)
    relation: Option<String>,

    /// Years to process: all, 2023, 2019-2021, 2018,2020-2022
    #[arg(long, visible_alias = "year", default_value = "all")]
    years: String,

    /// Read emails_YYYY_NORMALIZED.txt instead of emails_YYYY.txt
    #[arg(long)]
    normalized: bool,

    /// Classify at most N messages in this run (0 = only render)
    #[arg(long)]
    max: Option<usize>,

    /// Empty the light (per-message) CSV once the archives are validated
    #[arg(long)]
    clear_light: bool,

    /// Empty the rich (per-event) CSV once the archives are validated
    #[arg(long)]
    clear_events: bool,

    /// YAML taxonomy replacing the bundled one
    #[arg(long)]
    taxonomy_file: Option<PathBuf>,

    /// How sophism names in classifier replies are matched to the taxonomy
    #[arg(long, value_enum, default_value_t = MatchMode::Normalize)]
    taxonomy_mode: MatchMode,

    /// Environment file loaded before reading OPENAI_API_KEY (default: .env)
    #[arg(long)]
    env_file: Option<PathBuf>,

    /// Config file (default: $SOPHISM_CONFIG, then config/sophism.yaml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Archive directory, overriding the configured one
    #[arg(long)]
    base_dir: Option<PathBuf>,

    #[arg(long)]
    model: Option<String>,

    #[arg(long)]
    temperature: Option<f64>,

    /// Seconds between two classifier calls
    #[arg(long)]
    sleep: Option<f64>,

    /// Characters of a body sent to the classifier
    #[arg(long)]
    max_body_chars: Option<usize>,

    /// Classifier attempts per message
    #[arg(long)]
    retries: Option<usize>,

    /// Check that the light CSV matches the rich CSV, then exit
    #[arg(long)]
    verify: bool,

    /// Rebuild the light CSV from the rich CSV, then exit
    #[arg(long)]
    rederive_light: bool,

    /// Print the taxonomy, then exit
    #[arg(long)]
    list_taxonomy: bool,
}

fn log_filter() -> tracing_subscriber::EnvFilter {
    let level = if let Ok(v) = std::env::var("RUST_LOG") {
        v
    } else if let Ok(v) = std::env::var("SOPHISM_LOG") {
        match v.as_str() {
            "silent" => "off".to_string(),
            other => other.to_string(),
        }
    } else {
        "info".to_string()
    };

    tracing_subscriber::EnvFilter::try_new(level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
}

/// Load `path`, or the nearest `.env`, into the process environment.
/// Variables already set are left alone.
fn load_env_file(path: Option<&Path>) -> Option<PathBuf> {
    match path {
        Some(path) => dotenvy::from_path(path).ok().map(|_| path.to_path_buf()),
        None => dotenvy::dotenv().ok(),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let env_file = load_env_file(cli.env_file.as_deref());

    tracing_subscriber::registry()
        .with(log_filter())
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Some(path) = &env_file {
        info!(path = %path.display(), "environment file loaded");
    } else if let Some(path) = &cli.env_file {
        warn!(path = %path.display(), "environment file not loaded");
    }
    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  RUN
// ═══════════════════════════════════════════════════════════════════════

fn run(cli: Cli) -> Result<ExitCode> {
    let taxonomy = match &cli.taxonomy_file {
        Some(path) => Taxonomy::load(path)?,
        None => Taxonomy::bundled()?,
    }
    .with_mode(cli.taxonomy_mode);
    info!(
        source = taxonomy.source(),
        entries = taxonomy.len(),
        mode = ?taxonomy.mode(),
        "taxonomy loaded"
    );

    if cli.list_taxonomy {
        print_taxonomy(&taxonomy);
        return Ok(ExitCode::SUCCESS);
    }

    let loaded = match locate_config(cli.config.as_deref()) {
        Some(path) => LoadedConfig::load(&path)?,
        None => LoadedConfig::default(),
    };
    match &loaded.path {
        Some(path) => info!(path = %path.display(), "config loaded"),
        None => info!("no config file; using defaults"),
    }
    let relation = loaded.relation(cli.relation.as_deref(), cli.base_dir.as_deref())?;
    info!(relation = %relation.id, archives = %relation.archives_dir.display(), "relation selected");

    let mut sink = EventSink::open(&relation.csv_events, &relation.csv_light)
        .context("opening the event store")?;

    if cli.verify {
        return Ok(verify(&sink));
    }
    if cli.rederive_light {
        let report = sink.rederive_light()?;
        println!(
            "Light view rebuilt: {} kept, {} rebuilt from events, {} dropped",
            report.kept, report.rebuilt, report.dropped
        );
        return Ok(ExitCode::SUCCESS);
    }

    let selected_years = years::resolve_years(&cli.years, &relation.archives_dir, cli.normalized)?;

    let mut llm = loaded.config.llm.clone();
    if let Some(model) = cli.model {
        llm.model = model;
    }
    if let Some(t) = cli.temperature {
        llm.temperature = t;
    }
    if let Some(s) = cli.sleep {
        llm.sleep_between_requests = s;
    }
    if let Some(n) = cli.max_body_chars {
        llm.max_body_chars = n;
    }
    if let Some(n) = cli.retries {
        llm.max_attempts = n;
    }

    let classifier: Box<dyn Classifier> = if cli.max == Some(0) {
        Box::new(OfflineClassifier)
    } else {
        Box::new(OpenAiClassifier::from_env(llm.llm_settings()).context("setting up the classifier")?)
    };

    let adapter = ClassifierAdapter::new(
        classifier.as_ref(),
        &taxonomy,
        &relation.context_history,
        &loaded.config.owner.name,
        &relation.name,
        llm.adapter_settings(),
    );
    let pipeline = Pipeline {
        relation: &relation,
        owner: &loaded.config.owner,
        taxonomy: &taxonomy,
        adapter,
        options: RunOptions {
            years: selected_years,
            normalized: cli.normalized,
            max: cli.max,
            throttle: llm.throttle(),
            clear_events: cli.clear_events,
            clear_light: cli.clear_light,
        },
    };
    let summary = pipeline.run(&mut sink)?;

    print!("{summary}");
    if !summary.failed.is_empty() {
        warn!(
            count = summary.failed.len(),
            "some messages could not be classified; rerun to retry them"
        );
    }
    Ok(ExitCode::SUCCESS)
}

// ═══════════════════════════════════════════════════════════════════════
//  MAINTENANCE MODES
// ═══════════════════════════════════════════════════════════════════════

fn print_taxonomy(taxonomy: &Taxonomy) {
    println!("{} ({} entries)", taxonomy.source(), taxonomy.len());
    for entry in taxonomy.entries() {
        let category = entry.category.as_deref().unwrap_or("-");
        println!("  {:<24} {} [{}]", entry.key, entry.label, category);
        if !entry.aliases.is_empty() {
            println!("  {:<24} aussi : {}", "", entry.aliases.join(", "));
        }
    }
    println!("  {:<24} {}", sophism_types::HIDDEN_TOPIC_KEY, taxonomy::HIDDEN_TOPIC_LABEL);
}

/// Exit status 2 when the two views disagree.
fn verify(sink: &EventSink) -> ExitCode {
    let issues = sink.verify();
    if issues.is_empty() {
        println!(
            "OK: {} light rows consistent with {} events",
            sink.light_rows().len(),
            sink.rich_rows().len()
        );
        return ExitCode::SUCCESS;
    }
    for issue in &issues {
        match &issue.recorded {
            Some(recorded) => println!(
                "{}: light says {} event(s) / {:?}, events give {} / {:?}",
                issue.message_id,
                recorded.event_count,
                recorded.max_severity,
                issue.derived.event_count,
                issue.derived.max_severity
            ),
            None => println!(
                "{}: {} event(s) without a light row",
                issue.message_id, issue.derived.event_count
            ),
        }
    }
    println!("{} inconsistent message(s); --rederive-light rebuilds the light view", issues.len());
    ExitCode::from(2)
}
