//! In-memory [`IssueStore`] with per-repository optimistic versioning.
//!
//! A single `tokio::sync::RwLock` guards all repositories, so a commit validates every
//! expected version and applies every change under one write guard.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use iris_core::{Category, TriagedIssue};
use tokio::sync::RwLock;
use tracing::debug;

use crate::{
    rank_by_score, BatchWrite, CommitReceipt, IssueStore, RepositorySnapshot, RepositoryWrite, StoreError,
    StoreStats,
};

#[derive(Debug, Default, Clone)]
struct RepositoryState {
    version: u64,
    issues: BTreeMap<u64, TriagedIssue>,
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    repositories: RwLock<BTreeMap<String, RepositoryState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current version of a repository; 0 if it was never written.
    pub async fn version_of(&self, repository: &str) -> u64 {
        self.repositories
            .read()
            .await
            .get(repository)
            .map(|r| r.version)
            .unwrap_or(0)
    }

    pub async fn len(&self) -> usize {
        self.repositories.read().await.values().map(|r| r.issues.len()).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn collect<F>(&self, mut keep: F) -> Vec<TriagedIssue>
    where
        F: FnMut(&TriagedIssue) -> bool,
    {
        let guard = self.repositories.read().await;
        let mut out = guard
            .values()
            .flat_map(|r| r.issues.values())
            .filter(|issue| keep(issue))
            .cloned()
            .collect::<Vec<_>>();
        rank_by_score(&mut out);
        out
    }
}

fn check_write(state: Option<&RepositoryState>, write: &RepositoryWrite) -> Result<(), StoreError> {
    let current = state.map(|s| s.version).unwrap_or(0);
    if current != write.expected_version {
        return Err(StoreError::conflict(
            &write.repository,
            format!("expected version {} but found {}", write.expected_version, current),
        ));
    }

    let upserted: HashSet<u64> = write.upserts.iter().map(|i| i.id()).collect();
    for issue in &write.upserts {
        if issue.repository() != write.repository {
            return Err(StoreError::Backend(format!(
                "record {} belongs to {} but was written under {}",
                issue.id(),
                issue.repository(),
                write.repository
            )));
        }
    }
    for update in &write.membership {
        let known = upserted.contains(&update.id)
            || state.is_some_and(|s| s.issues.contains_key(&update.id));
        if !known {
            return Err(StoreError::Backend(format!(
                "membership update for unknown record {} in {}",
                update.id, write.repository
            )));
        }
    }
    Ok(())
}

fn compute_stats<'a>(issues: impl Iterator<Item = &'a TriagedIssue>) -> StoreStats {
    let mut stats = StoreStats::default();
    let mut score_sum = 0.0;
    for issue in issues {
        stats.total += 1;
        if issue.record.is_open() {
            stats.open += 1;
        } else {
            stats.closed += 1;
        }
        if issue.is_duplicate() {
            stats.duplicates += 1;
        }
        score_sum += issue.score.total;
        *stats
            .by_category
            .entry(issue.classification.category.as_str().to_string())
            .or_default() += 1;
        *stats
            .by_priority
            .entry(issue.classification.priority.as_str().to_string())
            .or_default() += 1;
        for tag in &issue.classification.stack {
            *stats.by_stack.entry(tag.clone()).or_default() += 1;
        }
        *stats.by_repository.entry(issue.repository().to_string()).or_default() += 1;
    }
    if stats.total > 0 {
        stats.average_score = score_sum / stats.total as f64;
    }
    stats
}

#[async_trait]
impl IssueStore for InMemoryStore {
    async fn load_repository(&self, repository: &str) -> Result<RepositorySnapshot, StoreError> {
        let guard = self.repositories.read().await;
        Ok(match guard.get(repository) {
            Some(state) => RepositorySnapshot {
                repository: repository.to_string(),
                version: state.version,
                issues: state.issues.values().cloned().collect(),
            },
            None => RepositorySnapshot {
                repository: repository.to_string(),
                ..Default::default()
            },
        })
    }

    async fn commit(&self, write: &BatchWrite) -> Result<CommitReceipt, StoreError> {
        let mut guard = self.repositories.write().await;

        for repo_write in &write.repositories {
            check_write(guard.get(&repo_write.repository), repo_write)?;
        }

        let mut receipt = CommitReceipt::default();
        for repo_write in &write.repositories {
            let state = guard.entry(repo_write.repository.clone()).or_default();
            for issue in &repo_write.upserts {
                match state.issues.insert(issue.id(), issue.clone()) {
                    Some(_) => receipt.updated += 1,
                    None => receipt.inserted += 1,
                }
            }
            for update in &repo_write.membership {
                if let Some(issue) = state.issues.get_mut(&update.id) {
                    issue.duplicate_of = update.duplicate_of;
                    issue.duplicate_similarity = update.duplicate_similarity;
                    receipt.membership_updates += 1;
                }
            }
            state.version += 1;
            receipt.versions.insert(repo_write.repository.clone(), state.version);
        }

        debug!(
            batch_id = %write.batch_id,
            inserted = receipt.inserted,
            updated = receipt.updated,
            membership_updates = receipt.membership_updates,
            "in-memory commit applied"
        );
        Ok(receipt)
    }

    async fn get_by_repository(&self, repository: &str) -> Result<Vec<TriagedIssue>, StoreError> {
        let guard = self.repositories.read().await;
        Ok(guard
            .get(repository)
            .map(|s| s.issues.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_by_score_range(&self, min: f64, max: f64) -> Result<Vec<TriagedIssue>, StoreError> {
        Ok(self
            .collect(|i| i.score.total >= min && i.score.total <= max)
            .await)
    }

    async fn get_by_category(&self, category: Category) -> Result<Vec<TriagedIssue>, StoreError> {
        Ok(self.collect(|i| i.classification.category == category).await)
    }

    async fn search(&self, text: &str, limit: usize) -> Result<Vec<TriagedIssue>, StoreError> {
        let needle = text.trim().to_lowercase();
        if needle.is_empty() {
            return Ok(Vec::new());
        }
        let mut hits = self
            .collect(|i| {
                i.record.title.to_lowercase().contains(&needle) || i.record.body.to_lowercase().contains(&needle)
            })
            .await;
        hits.truncate(limit);
        Ok(hits)
    }

    async fn top_by_score(&self, limit: usize) -> Result<Vec<TriagedIssue>, StoreError> {
        let mut top = self.collect(|i| !i.is_duplicate()).await;
        top.truncate(limit);
        Ok(top)
    }

    async fn get_stats(&self) -> Result<StoreStats, StoreError> {
        let guard = self.repositories.read().await;
        Ok(compute_stats(guard.values().flat_map(|r| r.issues.values())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MembershipUpdate;
    use chrono::{TimeZone, Utc};
    use iris_core::{
        ClassificationResult, Fingerprint, IssueRecord, IssueState, Priority, ScoreBreakdown,
    };
    use uuid::Uuid;

    fn mk_issue(repository: &str, id: u64, title: &str, total: f64) -> TriagedIssue {
        let ts = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap();
        TriagedIssue {
            record: IssueRecord {
                id,
                repository: repository.to_string(),
                number: id,
                title: title.to_string(),
                body: format!("{title} body"),
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
            },
            fingerprint: Fingerprint::from_hex(format!("{id:064x}")),
            score: ScoreBreakdown::from_components(total, 0.0, 0.0, 0.0, 0.0),
            classification: ClassificationResult {
                category: Category::Bug,
                priority: Priority::High,
                stack: ["rust".to_string()].into_iter().collect(),
                confidence: 1.0,
            },
            duplicate_of: None,
            duplicate_similarity: None,
            first_seen_at: ts,
            last_ingested_at: ts,
        }
    }

    fn write(repository: &str, expected_version: u64, upserts: Vec<TriagedIssue>) -> BatchWrite {
        BatchWrite {
            batch_id: Uuid::new_v4(),
            repositories: vec![RepositoryWrite {
                repository: repository.to_string(),
                expected_version,
                upserts,
                membership: vec![],
            }],
        }
    }

    #[tokio::test]
    async fn commit_bumps_version_and_counts_inserts() {
        let store = InMemoryStore::new();
        let receipt = store
            .commit(&write("acme/widgets", 0, vec![mk_issue("acme/widgets", 1, "Crash on start", 40.0)]))
            .await
            .expect("first commit");
        assert_eq!(receipt.inserted, 1);
        assert_eq!(receipt.versions["acme/widgets"], 1);

        let receipt = store
            .commit(&write("acme/widgets", 1, vec![mk_issue("acme/widgets", 1, "Crash on start", 45.0)]))
            .await
            .expect("second commit");
        assert_eq!(receipt.updated, 1);
        assert_eq!(store.version_of("acme/widgets").await, 2);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn stale_version_conflicts_without_partial_writes() {
        let store = InMemoryStore::new();
        store
            .commit(&write("acme/widgets", 0, vec![mk_issue("acme/widgets", 1, "Crash", 10.0)]))
            .await
            .expect("seed");

        let mut batch = write("acme/gadgets", 0, vec![mk_issue("acme/gadgets", 2, "Slow", 10.0)]);
        batch.repositories.push(RepositoryWrite {
            repository: "acme/widgets".into(),
            expected_version: 0,
            upserts: vec![mk_issue("acme/widgets", 3, "Leak", 10.0)],
            membership: vec![],
        });

        let err = store.commit(&batch).await.expect_err("stale");
        assert!(err.is_conflict());
        assert!(store.get_by_repository("acme/gadgets").await.unwrap().is_empty());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn membership_updates_require_known_records() {
        let store = InMemoryStore::new();
        let mut batch = write("acme/widgets", 0, vec![mk_issue("acme/widgets", 1, "Crash", 10.0)]);
        batch.repositories[0].membership.push(MembershipUpdate {
            id: 99,
            duplicate_of: Some(1),
            duplicate_similarity: Some(0.9),
        });
        let err = store.commit(&batch).await.expect_err("unknown member");
        assert!(!err.is_conflict());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn queries_rank_and_filter() {
        let store = InMemoryStore::new();
        let mut dup = mk_issue("acme/widgets", 3, "Cache leak again", 90.0);
        dup.duplicate_of = Some(1);
        store
            .commit(&write(
                "acme/widgets",
                0,
                vec![
                    mk_issue("acme/widgets", 1, "Cache leak", 70.0),
                    mk_issue("acme/widgets", 2, "Docs typo", 20.0),
                    dup,
                ],
            ))
            .await
            .unwrap();

        let ranged = store.get_by_score_range(50.0, 100.0).await.unwrap();
        assert_eq!(ranged.iter().map(|i| i.id()).collect::<Vec<_>>(), vec![3, 1]);

        let top = store.top_by_score(5).await.unwrap();
        assert_eq!(top.iter().map(|i| i.id()).collect::<Vec<_>>(), vec![1, 2]);

        let hits = store.search("CACHE", 1).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id(), 3);

        let stats = store.get_stats().await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.by_category["bug"], 3);
        assert_eq!(stats.by_stack["rust"], 3);
        assert!((stats.average_score - 60.0).abs() < 1e-9);
    }
}
