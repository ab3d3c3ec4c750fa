//! Concurrent ingestion across record sources.

use std::sync::Arc;

use iris_sources::RecordSource;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, info_span, Instrument};

use crate::config::PipelineConfig;
use crate::pipeline::{BatchReport, IngestPipeline};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceRun {
    pub repository: String,
    pub batches: Vec<BatchReport>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct RunSummary {
    pub sources: Vec<SourceRun>,
}

impl RunSummary {
    pub fn batches(&self) -> impl Iterator<Item = &BatchReport> {
        self.sources.iter().flat_map(|s| s.batches.iter())
    }

    pub fn committed_records(&self) -> usize {
        self.batches().map(|b| b.succeeded.len()).sum()
    }

    pub fn skipped_records(&self) -> usize {
        self.batches().map(|b| b.skipped.len()).sum()
    }

    pub fn failed_batches(&self) -> usize {
        self.batches().filter(|b| !b.is_committed()).count()
    }

    pub fn source_errors(&self) -> usize {
        self.sources.iter().filter(|s| s.error.is_some()).count()
    }
}

/// Runs one task per source, at most `workers` at a time. Each source's records are cut
/// into `batch_size` batches and ingested in arrival order.
pub struct IngestRunner {
    pipeline: Arc<IngestPipeline>,
    batch_size: usize,
    permits: Arc<Semaphore>,
}

impl IngestRunner {
    pub fn new(pipeline: Arc<IngestPipeline>, batch_size: usize, workers: usize) -> Self {
        Self {
            pipeline,
            batch_size: batch_size.max(1),
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    pub fn from_config(pipeline: Arc<IngestPipeline>, config: &PipelineConfig) -> Self {
        Self::new(pipeline, config.batch_size, config.workers)
    }

    pub async fn run(&self, sources: Vec<Box<dyn RecordSource>>) -> RunSummary {
        let mut tasks = JoinSet::new();
        for source in sources {
            let pipeline = Arc::clone(&self.pipeline);
            let permits = Arc::clone(&self.permits);
            let batch_size = self.batch_size;
            let span = info_span!("ingest_source", repository = source.repository());
            tasks.spawn(
                async move {
                    let _permit = match permits.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => {
                            return SourceRun {
                                repository: source.repository().to_string(),
                                batches: Vec::new(),
                                error: Some("worker pool closed".into()),
                            }
                        }
                    };
                    ingest_source(pipeline, source, batch_size).await
                }
                .instrument(span),
            );
        }

        let mut summary = RunSummary::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(run) => summary.sources.push(run),
                Err(err) => error!(error = %err, "ingest task failed"),
            }
        }
        summary.sources.sort_by(|a, b| a.repository.cmp(&b.repository));
        info!(
            sources = summary.sources.len(),
            committed = summary.committed_records(),
            failed_batches = summary.failed_batches(),
            "ingest run finished"
        );
        summary
    }
}

async fn ingest_source(pipeline: Arc<IngestPipeline>, mut source: Box<dyn RecordSource>, batch_size: usize) -> SourceRun {
    let mut run = SourceRun {
        repository: source.repository().to_string(),
        batches: Vec::new(),
        error: None,
    };
    loop {
        let records = match source.fetch().await {
            Ok(records) => records,
            Err(err) => {
                error!(error = %err, "source fetch failed");
                run.error = Some(err.to_string());
                break;
            }
        };
        if records.is_empty() {
            break;
        }
        let mut records = records.into_iter().peekable();
        while records.peek().is_some() {
            let batch: Vec<_> = records.by_ref().take(batch_size).collect();
            run.batches.push(pipeline.ingest_batch(batch).await);
        }
    }
    run
}
