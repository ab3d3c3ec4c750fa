//! Triage engines and the transactional ingest pipeline.
//!
//! Records flow `score -> classify -> dedup plan -> commit`. The engines are pure and
//! built once from a [`RuleSet`]; the pipeline is the only writer to the store.

pub mod classify;
pub mod config;
pub mod dedup;
pub mod engine;
pub mod fingerprint;
pub mod pipeline;
pub mod scoring;
pub mod similarity;
pub mod terms;
pub mod workers;

pub use classify::{BatchClassification, Classifier, SkippedRecord};
pub use config::{ConfigError, PipelineConfig, RuleSet};
pub use dedup::{DedupEngine, DuplicateAssignment, DuplicateMatch, UnionFind, DEFAULT_SIMILARITY_THRESHOLD};
pub use engine::{EngineHandle, TriageEngine};
pub use fingerprint::{fingerprint, normalize_text};
pub use pipeline::{
    BatchReport, BatchStage, BatchStatus, FailureKind, IngestPipeline, PipelineError, RegroupReport, Sleeper,
    TokioSleeper,
};
pub use scoring::Scorer;
pub use similarity::{similarity, SimilarityWeights};
pub use terms::Term;
pub use workers::{IngestRunner, RunSummary, SourceRun};

pub const CRATE_NAME: &str = "iris-sync";

/// Engine built from the configured rule directory (or the bundled rules) and threshold.
pub fn engine_from_config(config: &PipelineConfig) -> Result<TriageEngine, ConfigError> {
    let rules = config.load_rules()?;
    TriageEngine::from_rules(&rules, config.similarity_threshold)
}
