//! Immutable triage engine and its hot-swappable handle.

use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use iris_core::{IssueRecord, TriagedIssue};
use tracing::info;

use crate::classify::Classifier;
use crate::config::{ConfigError, RuleSet};
use crate::dedup::DedupEngine;
use crate::fingerprint::fingerprint;
use crate::scoring::Scorer;
use crate::similarity::SimilarityWeights;

/// Scoring, classification and dedup built from one rule set. Never mutated; a rule
/// reload builds a new engine.
#[derive(Debug, Clone)]
pub struct TriageEngine {
    scorer: Scorer,
    classifier: Classifier,
    dedup: DedupEngine,
}

impl TriageEngine {
    pub fn new(scorer: Scorer, classifier: Classifier, dedup: DedupEngine) -> Self {
        Self {
            scorer,
            classifier,
            dedup,
        }
    }

    pub fn from_rules(rules: &RuleSet, similarity_threshold: f64) -> Result<Self, ConfigError> {
        Ok(Self::new(
            Scorer::from_rules(&rules.scoring)?,
            Classifier::from_rules(&rules.classification)?,
            DedupEngine::new(SimilarityWeights::default(), similarity_threshold)?,
        ))
    }

    pub fn builtin() -> Result<Self, ConfigError> {
        Self::from_rules(&RuleSet::builtin()?, crate::dedup::DEFAULT_SIMILARITY_THRESHOLD)
    }

    pub fn scorer(&self) -> &Scorer {
        &self.scorer
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    pub fn dedup(&self) -> &DedupEngine {
        &self.dedup
    }

    /// Fingerprint, score and classify one validated record. Group membership is left
    /// empty for the dedup plan to fill in.
    pub fn triage(&self, record: IssueRecord, now: DateTime<Utc>) -> TriagedIssue {
        let score = self.scorer.score(&record);
        let classification = self.classifier.classify_with_score(&record, &score);
        TriagedIssue {
            fingerprint: fingerprint(&record),
            score,
            classification,
            duplicate_of: None,
            duplicate_similarity: None,
            first_seen_at: now,
            last_ingested_at: now,
            record,
        }
    }
}

/// Shared pointer to the current engine. Readers take an owned `Arc` so a batch keeps a
/// consistent engine even if a reload lands mid-batch.
pub struct EngineHandle {
    inner: ArcSwap<TriageEngine>,
}

impl EngineHandle {
    pub fn new(engine: TriageEngine) -> Self {
        Self {
            inner: ArcSwap::new(Arc::new(engine)),
        }
    }

    pub fn load_full(&self) -> Arc<TriageEngine> {
        self.inner.load_full()
    }

    /// Installs `engine` and returns the one it replaced.
    pub fn swap(&self, engine: TriageEngine) -> Arc<TriageEngine> {
        self.inner.swap(Arc::new(engine))
    }

    /// Builds an engine from `rules` and installs it. On error the current engine stays.
    pub fn reload(&self, rules: &RuleSet, similarity_threshold: f64) -> Result<(), ConfigError> {
        let engine = TriageEngine::from_rules(rules, similarity_threshold)?;
        self.inner.store(Arc::new(engine));
        info!(similarity_threshold, "triage engine reloaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use iris_core::{Category, IssueState};

    fn mk_record() -> IssueRecord {
        let ts = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().unwrap();
        IssueRecord {
            id: 1,
            repository: "acme/widgets".into(),
            number: 1,
            title: "Memory leak in cache implementation".into(),
            body: "crash after a day of uptime".into(),
            state: IssueState::Open,
            labels: vec!["bug".into()],
            author: None,
            assignee: None,
            milestone: None,
            created_at: ts,
            updated_at: ts,
            closed_at: None,
            comment_count: 2,
            reaction_count: 0,
            url: None,
        }
    }

    #[test]
    fn triage_fills_every_derived_field() {
        let engine = TriageEngine::builtin().expect("engine");
        let now = Utc::now();
        let issue = engine.triage(mk_record(), now);
        assert_eq!(issue.fingerprint, fingerprint(&issue.record));
        assert_eq!(issue.score.keyword, 30.0);
        assert_eq!(issue.classification.category, Category::Bug);
        assert!(issue.duplicate_of.is_none());
        assert_eq!(issue.first_seen_at, now);
    }

    #[test]
    fn reload_swaps_without_touching_held_engines() {
        let handle = EngineHandle::new(TriageEngine::builtin().expect("engine"));
        let held = handle.load_full();
        assert_eq!(held.dedup().threshold(), 0.75);

        let rules = RuleSet::builtin().expect("rules");
        handle.reload(&rules, 0.9).expect("reload");
        assert_eq!(handle.load_full().dedup().threshold(), 0.9);
        assert_eq!(held.dedup().threshold(), 0.75);

        assert!(handle.reload(&rules, 2.0).is_err());
        assert_eq!(handle.load_full().dedup().threshold(), 0.9);

        let previous = handle.swap(TriageEngine::builtin().expect("engine"));
        assert_eq!(previous.dedup().threshold(), 0.9);
    }
}
