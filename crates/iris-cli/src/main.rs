use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use iris_core::TriagedIssue;
use iris_sources::{bundle_to_records, load_fixture_bundle, FixtureSource, RecordSource};
use iris_storage::{InMemoryStore, IssueStore, PgStore};
use iris_sync::{engine_from_config, EngineHandle, IngestPipeline, IngestRunner, PipelineConfig};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "iris")]
#[command(about = "Issue relevance scoring, dedup and classification")]
struct Cli {
    /// Fixture bundles to ingest before running the command.
    #[arg(long = "fixture", global = true)]
    fixtures: Vec<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest the given fixture bundles and print the run summary.
    Ingest,
    /// Classify fixture records without touching the store.
    Classify { path: PathBuf },
    /// Print store totals and their breakdowns as JSON.
    Stats,
    /// Find stored records whose title or body contains the text.
    Search {
        text: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// List the highest scoring stored records.
    Top {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Recompute duplicate groups across a repository's stored records.
    Regroup { repository: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("iris=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env().context("loading pipeline configuration")?;
    let engine = engine_from_config(&config).context("building triage engine")?;

    if let Some(Commands::Classify { path }) = &cli.command {
        let bundle = load_fixture_bundle(path)?;
        let batch = engine.classifier().classify_batch(&bundle_to_records(&bundle));
        println!("{}", serde_json::to_string_pretty(&batch)?);
        return Ok(());
    }

    let store = open_store(&config).await?;
    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; pending batches will stop before persisting");
            let _ = cancel_tx.send(true);
        }
    });

    let pipeline = Arc::new(
        IngestPipeline::new(Arc::clone(&store), Arc::new(EngineHandle::new(engine)))
            .with_backoff(config.backoff)
            .with_cancellation(cancel_rx),
    );

    if !cli.fixtures.is_empty() {
        let mut sources: Vec<Box<dyn RecordSource>> = Vec::with_capacity(cli.fixtures.len());
        for path in &cli.fixtures {
            let source = FixtureSource::open(path).with_context(|| format!("opening fixture {}", path.display()))?;
            sources.push(Box::new(source));
        }
        let summary = IngestRunner::from_config(Arc::clone(&pipeline), &config)
            .run(sources)
            .await;
        info!(
            committed = summary.committed_records(),
            skipped = summary.skipped_records(),
            failed_batches = summary.failed_batches(),
            "fixtures ingested"
        );
        if matches!(cli.command, None | Some(Commands::Ingest)) {
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

    match cli.command.unwrap_or(Commands::Ingest) {
        Commands::Ingest | Commands::Classify { .. } => {}
        Commands::Stats => {
            let stats = store.get_stats().await.context("reading stats")?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::Search { text, limit } => {
            print_issues(&store.search(&text, limit).await.context("searching issues")?);
        }
        Commands::Top { limit } => {
            print_issues(&store.top_by_score(limit).await.context("reading top issues")?);
        }
        Commands::Regroup { repository } => {
            let report = pipeline
                .regroup_repository(&repository)
                .await
                .with_context(|| format!("regrouping {repository}"))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

async fn open_store(config: &PipelineConfig) -> Result<Arc<dyn IssueStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PgStore::connect(url, config.workers as u32 + 1)
                .await
                .context("connecting to postgres")?;
            store.ensure_schema().await.context("creating schema")?;
            Ok(Arc::new(store))
        }
        None => {
            info!("DATABASE_URL not set; using the in-memory store");
            Ok(Arc::new(InMemoryStore::new()))
        }
    }
}

fn print_issues(issues: &[TriagedIssue]) {
    for issue in issues {
        println!(
            "{:>6.1}  {:<13} {:<8} {}  {}{}",
            issue.score.total,
            issue.classification.category.as_str(),
            issue.classification.priority.as_str(),
            issue.record.key(),
            issue.record.title,
            issue
                .duplicate_of
                .map(|master| format!("  (duplicate of {master})"))
                .unwrap_or_default()
        );
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn every_subcommand_has_help_text() {
        let cli = Cli::command();
        cli.clone().debug_assert();
        for sub in cli.get_subcommands() {
            assert!(sub.get_about().is_some(), "{} has no help text", sub.get_name());
        }
    }
}
