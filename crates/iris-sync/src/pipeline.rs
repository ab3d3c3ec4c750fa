//! Transactional batch ingest.
//!
//! A batch moves through `Received -> Scored -> Classified -> DedupChecked -> Persisting`
//! and ends `Committed`, `RolledBack` or `Cancelled`. Scoring and classification run once;
//! a write conflict re-runs only the dedup plan and the commit, against fresh snapshots,
//! until the backoff policy runs out of retries. The store applies a batch whole or not at
//! all, so a rolled-back batch leaves nothing behind.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use iris_core::{BatchId, DuplicateGroup, IssueRecord, TriagedIssue};
use iris_storage::{
    BackoffPolicy, BatchWrite, CommitReceipt, IssueStore, RepositorySnapshot, RepositoryWrite, StoreError,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::classify::SkippedRecord;
use crate::dedup::{membership_for_groups, DuplicateAssignment};
use crate::engine::EngineHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStage {
    Received,
    Scored,
    Classified,
    DedupChecked,
    Persisting,
    Committed,
    RolledBack,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Committed,
    RolledBack,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Transient,
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PipelineError {
    #[error("configuration error: {message}")]
    Configuration { message: String },
    #[error("write conflict persisted after {attempts} attempts: {source}")]
    Conflict { attempts: u32, source: StoreError },
    #[error("store failure: {source}")]
    Persistence { source: StoreError },
    #[error("engine task failed: {message}")]
    Worker { message: String },
    #[error("batch cancelled before persisting")]
    Cancelled,
}

impl PipelineError {
    pub fn kind(&self) -> FailureKind {
        match self {
            PipelineError::Conflict { .. } => FailureKind::Transient,
            _ => FailureKind::Fatal,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == FailureKind::Transient
    }
}

/// Outcome of one batch. Always produced, whatever the final status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchReport {
    pub batch_id: BatchId,
    pub status: BatchStatus,
    pub attempts: u32,
    pub succeeded: Vec<u64>,
    pub skipped: Vec<SkippedRecord>,
    pub duplicates: Vec<DuplicateAssignment>,
    pub trace: Vec<BatchStage>,
    pub receipt: Option<CommitReceipt>,
    pub error: Option<PipelineError>,
}

impl BatchReport {
    fn new(batch_id: BatchId) -> Self {
        Self {
            batch_id,
            status: BatchStatus::RolledBack,
            attempts: 0,
            succeeded: Vec::new(),
            skipped: Vec::new(),
            duplicates: Vec::new(),
            trace: Vec::new(),
            receipt: None,
            error: None,
        }
    }

    fn enter(&mut self, stage: BatchStage) {
        debug!(batch_id = %self.batch_id, stage = ?stage, "batch stage");
        self.trace.push(stage);
    }

    fn skip(&mut self, id: u64, reason: impl Into<String>) {
        self.skipped.push(SkippedRecord {
            id,
            reason: reason.into(),
        });
    }

    pub fn is_committed(&self) -> bool {
        self.status == BatchStatus::Committed
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.error.as_ref().map(PipelineError::kind)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegroupReport {
    pub repository: String,
    pub attempts: u32,
    pub groups: Vec<DuplicateGroup>,
    pub membership_updates: usize,
}

/// Waits out a backoff delay. Swapped for a recording implementation in tests.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, delay: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, delay: Duration) {
        tokio::time::sleep(delay).await;
    }
}

pub struct IngestPipeline {
    store: Arc<dyn IssueStore>,
    engine: Arc<EngineHandle>,
    backoff: BackoffPolicy,
    sleeper: Arc<dyn Sleeper>,
    cancel: watch::Receiver<bool>,
}

impl IngestPipeline {
    pub fn new(store: Arc<dyn IssueStore>, engine: Arc<EngineHandle>) -> Self {
        let (_never_cancelled, cancel) = watch::channel(false);
        Self {
            store,
            engine,
            backoff: BackoffPolicy::default(),
            sleeper: Arc::new(TokioSleeper),
            cancel,
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Batches stop before their next commit once `true` is sent on the channel. A commit
    /// already submitted always completes.
    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn store(&self) -> &Arc<dyn IssueStore> {
        &self.store
    }

    pub fn engine(&self) -> &Arc<EngineHandle> {
        &self.engine
    }

    fn cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    pub async fn ingest_batch(&self, records: Vec<IssueRecord>) -> BatchReport {
        let batch_id = Uuid::new_v4();
        let span = info_span!("ingest_batch", %batch_id, records = records.len());
        async move {
            let mut report = BatchReport::new(batch_id);
            match self.run_batch(records, &mut report).await {
                Ok(()) => {
                    report.status = BatchStatus::Committed;
                    report.enter(BatchStage::Committed);
                    info!(
                        attempts = report.attempts,
                        succeeded = report.succeeded.len(),
                        skipped = report.skipped.len(),
                        duplicates = report.duplicates.len(),
                        "batch committed"
                    );
                }
                Err(PipelineError::Cancelled) => {
                    report.status = BatchStatus::Cancelled;
                    report.enter(BatchStage::Cancelled);
                    report.error = Some(PipelineError::Cancelled);
                    warn!("batch cancelled before persisting");
                }
                Err(err) => {
                    report.status = BatchStatus::RolledBack;
                    report.enter(BatchStage::RolledBack);
                    report.succeeded.clear();
                    report.duplicates.clear();
                    error!(attempts = report.attempts, kind = ?err.kind(), error = %err, "batch rolled back");
                    report.error = Some(err);
                }
            }
            report
        }
        .instrument(span)
        .await
    }

    async fn run_batch(&self, records: Vec<IssueRecord>, report: &mut BatchReport) -> Result<(), PipelineError> {
        report.enter(BatchStage::Received);
        let valid = self.receive(records, report);
        if self.cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let engine = self.engine.load_full();
        let triage_engine = Arc::clone(&engine);
        let now = Utc::now();
        let triaged = tokio::task::spawn_blocking(move || {
            valid
                .into_iter()
                .map(|record| triage_engine.triage(record, now))
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| PipelineError::Worker { message: e.to_string() })?;
        report.enter(BatchStage::Scored);
        report.enter(BatchStage::Classified);
        if self.cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let mut by_repository: BTreeMap<String, Vec<TriagedIssue>> = BTreeMap::new();
        for issue in triaged {
            by_repository.entry(issue.repository().to_string()).or_default().push(issue);
        }
        if by_repository.is_empty() {
            report.attempts = 1;
            return Ok(());
        }

        let skipped_on_receive = report.skipped.len();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            report.attempts = attempt;
            report.skipped.truncate(skipped_on_receive);
            report.duplicates.clear();

            let mut write = BatchWrite {
                batch_id: report.batch_id,
                repositories: Vec::with_capacity(by_repository.len()),
            };
            for (repository, drafts) in &by_repository {
                let snapshot = self.load_snapshot(repository).await?;
                let drafts = reject_taken_numbers(&snapshot, drafts, report);
                let plan = engine.dedup().plan_repository(&snapshot, drafts);
                report.duplicates.extend(plan.assignments);
                if !plan.write.is_empty() {
                    write.repositories.push(plan.write);
                }
            }
            report.enter(BatchStage::DedupChecked);

            if self.cancelled() {
                return Err(PipelineError::Cancelled);
            }

            report.enter(BatchStage::Persisting);
            if write.repositories.is_empty() {
                return Ok(());
            }
            match self.store.commit(&write).await {
                Ok(receipt) => {
                    report.succeeded = write
                        .repositories
                        .iter()
                        .flat_map(|w| w.upserts.iter().map(TriagedIssue::id))
                        .collect();
                    report.receipt = Some(receipt);
                    return Ok(());
                }
                Err(err) if err.is_conflict() => self.back_off(attempt, err).await?,
                Err(err) => return Err(PipelineError::Persistence { source: err }),
            }
        }
    }

    /// Validates records and keeps the last observation of each identifier.
    fn receive(&self, records: Vec<IssueRecord>, report: &mut BatchReport) -> Vec<IssueRecord> {
        let mut valid = Vec::with_capacity(records.len());
        for record in records {
            match record.validate() {
                Ok(()) => valid.push(record),
                Err(err) => {
                    debug!(id = record.id, error = %err, "record skipped");
                    report.skip(record.id, err.to_string());
                }
            }
        }

        let last_index: HashMap<u64, usize> = valid
            .iter()
            .enumerate()
            .map(|(index, record)| (record.id, index))
            .collect();
        let mut kept = Vec::with_capacity(last_index.len());
        for (index, record) in valid.into_iter().enumerate() {
            if last_index.get(&record.id) == Some(&index) {
                kept.push(record);
            } else {
                report.skip(record.id, "superseded by a later observation in the same batch");
            }
        }
        kept
    }

    async fn load_snapshot(&self, repository: &str) -> Result<RepositorySnapshot, PipelineError> {
        self.store
            .load_repository(repository)
            .await
            .map_err(|source| PipelineError::Persistence { source })
    }

    /// Sleeps before the next attempt, or gives up once the retry bound is reached.
    async fn back_off(&self, attempt: u32, err: StoreError) -> Result<(), PipelineError> {
        if attempt as usize >= self.backoff.max_attempts() {
            return Err(PipelineError::Conflict { attempts: attempt, source: err });
        }
        let delay = self.backoff.delay_for_attempt(attempt as usize - 1);
        warn!(
            attempt,
            max_attempts = self.backoff.max_attempts(),
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "write conflict; retrying"
        );
        self.sleeper.sleep(delay).await;
        Ok(())
    }

    /// Recomputes duplicate groups over every stored record of `repository` and persists
    /// the memberships that changed.
    pub async fn regroup_repository(&self, repository: &str) -> Result<RegroupReport, PipelineError> {
        let span = info_span!("regroup_repository", repository);
        async move {
            let mut attempt: u32 = 0;
            loop {
                attempt += 1;
                let snapshot = self.load_snapshot(repository).await?;
                let engine = self.engine.load_full();
                let records: Vec<IssueRecord> = snapshot.issues.iter().map(|i| i.record.clone()).collect();
                let groups = tokio::task::spawn_blocking(move || engine.dedup().find_duplicates(&records))
                    .await
                    .map_err(|e| PipelineError::Worker { message: e.to_string() })?;
                let membership = membership_for_groups(&snapshot.issues, &groups);

                let report = RegroupReport {
                    repository: repository.to_string(),
                    attempts: attempt,
                    membership_updates: membership.len(),
                    groups,
                };
                if membership.is_empty() {
                    return Ok(report);
                }
                if self.cancelled() {
                    return Err(PipelineError::Cancelled);
                }

                let write = BatchWrite {
                    batch_id: Uuid::new_v4(),
                    repositories: vec![RepositoryWrite {
                        repository: repository.to_string(),
                        expected_version: snapshot.version,
                        upserts: Vec::new(),
                        membership,
                    }],
                };
                match self.store.commit(&write).await {
                    Ok(_) => {
                        info!(
                            groups = report.groups.len(),
                            updates = report.membership_updates,
                            "repository regrouped"
                        );
                        return Ok(report);
                    }
                    Err(err) if err.is_conflict() => self.back_off(attempt, err).await?,
                    Err(err) => return Err(PipelineError::Persistence { source: err }),
                }
            }
        }
        .instrument(span)
        .await
    }
}

/// Drops drafts whose issue number already belongs to a different identifier, either in
/// the store or earlier in the batch.
fn reject_taken_numbers(
    snapshot: &RepositorySnapshot,
    drafts: &[TriagedIssue],
    report: &mut BatchReport,
) -> Vec<TriagedIssue> {
    let mut owners: HashMap<u64, u64> = snapshot
        .issues
        .iter()
        .map(|stored| (stored.record.number, stored.id()))
        .collect();
    let draft_ids: HashSet<u64> = drafts.iter().map(TriagedIssue::id).collect();
    // Numbers held by records this batch re-observes are free to move with them.
    owners.retain(|_, owner| !draft_ids.contains(owner));

    let mut accepted = Vec::with_capacity(drafts.len());
    for draft in drafts {
        match owners.get(&draft.record.number) {
            Some(&owner) if owner != draft.id() => {
                report.skip(
                    draft.id(),
                    format!("issue number {} already belongs to record {owner}", draft.record.number),
                );
            }
            _ => {
                owners.insert(draft.record.number, draft.id());
                accepted.push(draft.clone());
            }
        }
    }
    accepted
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone};
    use iris_core::IssueState;
    use iris_storage::InMemoryStore;
    use std::sync::Mutex;

    use crate::engine::TriageEngine;

    #[derive(Default)]
    struct RecordingSleeper {
        delays: Mutex<Vec<Duration>>,
    }

    #[async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, delay: Duration) {
            self.delays.lock().unwrap().push(delay);
        }
    }

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().unwrap()
    }

    fn mk_record(id: u64, number: u64, title: &str, hours: i64) -> IssueRecord {
        let ts = base_time() + ChronoDuration::hours(hours);
        IssueRecord {
            id,
            repository: "acme/widgets".into(),
            number,
            title: title.into(),
            body: String::new(),
            state: IssueState::Open,
            labels: vec![],
            author: None,
            assignee: None,
            milestone: None,
            created_at: ts,
            updated_at: ts,
            closed_at: None,
            comment_count: 0,
            reaction_count: 0,
            url: None,
        }
    }

    fn pipeline(store: Arc<InMemoryStore>) -> IngestPipeline {
        let engine = Arc::new(EngineHandle::new(TriageEngine::builtin().expect("engine")));
        IngestPipeline::new(store, engine).with_sleeper(Arc::new(RecordingSleeper::default()))
    }

    #[tokio::test]
    async fn invalid_and_superseded_records_are_skipped() {
        let store = Arc::new(InMemoryStore::new());
        let mut untitled = mk_record(2, 2, "", 0);
        untitled.title = "   ".into();
        let records = vec![
            mk_record(1, 1, "Crash on save", 0),
            untitled,
            mk_record(1, 1, "Crash on save (edited)", 0),
        ];

        let report = pipeline(store.clone()).ingest_batch(records).await;
        assert!(report.is_committed());
        assert_eq!(report.succeeded, vec![1]);
        assert_eq!(report.skipped.len(), 2);
        assert_eq!(
            report.trace,
            vec![
                BatchStage::Received,
                BatchStage::Scored,
                BatchStage::Classified,
                BatchStage::DedupChecked,
                BatchStage::Persisting,
                BatchStage::Committed,
            ]
        );
        let stored = store.get_by_repository("acme/widgets").await.expect("stored");
        assert_eq!(stored[0].record.title, "Crash on save (edited)");
    }

    #[tokio::test]
    async fn taken_issue_numbers_are_rejected() {
        let store = Arc::new(InMemoryStore::new());
        let pipeline = pipeline(store.clone());
        pipeline.ingest_batch(vec![mk_record(1, 7, "Crash on save", 0)]).await;

        let report = pipeline.ingest_batch(vec![mk_record(2, 7, "Slow build", 1)]).await;
        assert!(report.is_committed());
        assert!(report.succeeded.is_empty());
        assert_eq!(report.skipped[0].id, 2);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn cancelled_batches_never_persist() {
        let store = Arc::new(InMemoryStore::new());
        let (tx, rx) = watch::channel(false);
        let pipeline = pipeline(store.clone()).with_cancellation(rx);
        tx.send(true).expect("send");

        let report = pipeline.ingest_batch(vec![mk_record(1, 1, "Crash on save", 0)]).await;
        assert_eq!(report.status, BatchStatus::Cancelled);
        assert_eq!(report.error, Some(PipelineError::Cancelled));
        assert!(!report.trace.contains(&BatchStage::Persisting));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn reingest_keeps_first_seen_and_refreshes_content() {
        let store = Arc::new(InMemoryStore::new());
        let pipeline = pipeline(store.clone());
        pipeline.ingest_batch(vec![mk_record(1, 1, "Crash on save", 0)]).await;
        let first = store.get_by_repository("acme/widgets").await.expect("stored")[0].clone();

        let mut edited = mk_record(1, 1, "Crash on save with large files", 0);
        edited.comment_count = 10;
        let report = pipeline.ingest_batch(vec![edited]).await;
        assert!(report.is_committed());
        assert_eq!(report.receipt.as_ref().map(|r| r.updated), Some(1));

        let second = store.get_by_repository("acme/widgets").await.expect("stored")[0].clone();
        assert_eq!(second.first_seen_at, first.first_seen_at);
        assert_ne!(second.fingerprint, first.fingerprint);
        assert!(second.score.activity > first.score.activity);
    }

    #[tokio::test]
    async fn regroup_matches_ingest_grouping() {
        let store = Arc::new(InMemoryStore::new());
        let pipeline = pipeline(store.clone());
        let leak = "Memory leak in cache implementation";
        pipeline
            .ingest_batch(vec![mk_record(1, 1, leak, 0), mk_record(2, 2, leak, 1), mk_record(3, 3, "Add dark mode", 2)])
            .await;

        let report = pipeline.regroup_repository("acme/widgets").await.expect("regroup");
        assert_eq!(report.groups.len(), 1);
        assert_eq!(report.groups[0].master_id, 1);
        // Ingest already linked the pair, so nothing changes.
        assert_eq!(report.membership_updates, 0);
    }

    #[test]
    fn only_conflicts_are_transient() {
        let conflict = PipelineError::Conflict {
            attempts: 4,
            source: StoreError::conflict("acme/widgets", "stale"),
        };
        assert!(conflict.is_transient());
        let fatal = PipelineError::Persistence {
            source: StoreError::Unavailable("down".into()),
        };
        assert_eq!(fatal.kind(), FailureKind::Fatal);
    }
}
