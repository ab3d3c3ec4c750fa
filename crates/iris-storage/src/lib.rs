//! Versioned issue store contracts plus the in-memory and postgres backends.
//!
//! Every write goes through [`IssueStore::commit`], which applies a whole [`BatchWrite`] or
//! nothing. Each repository in a write carries the version its plan was computed against;
//! a stale version is reported as [`StoreError::Conflict`] so the caller can re-plan.

pub mod memory;
pub mod postgres;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use iris_core::{BatchId, Category, TriagedIssue};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use memory::InMemoryStore;
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "iris-storage";

#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum StoreError {
    #[error("write conflict on {repository}: {detail}")]
    Conflict { repository: String, detail: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("stored row could not be decoded: {0}")]
    Decode(String),
}

impl StoreError {
    pub fn conflict(repository: impl Into<String>, detail: impl Into<String>) -> Self {
        StoreError::Conflict {
            repository: repository.into(),
            detail: detail.into(),
        }
    }

    pub fn disposition(&self) -> RetryDisposition {
        match self {
            StoreError::Conflict { .. } => RetryDisposition::Retryable,
            StoreError::Unavailable(_) | StoreError::Backend(_) | StoreError::Decode(_) => {
                RetryDisposition::NonRetryable
            }
        }
    }

    pub fn is_conflict(&self) -> bool {
        self.disposition() == RetryDisposition::Retryable
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    pub fn max_attempts(&self) -> usize {
        self.max_retries + 1
    }
}

/// Stored records of one repository and the version they were read at.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RepositorySnapshot {
    pub repository: String,
    pub version: u64,
    pub issues: Vec<TriagedIssue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MembershipUpdate {
    pub id: u64,
    pub duplicate_of: Option<u64>,
    pub duplicate_similarity: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RepositoryWrite {
    pub repository: String,
    pub expected_version: u64,
    pub upserts: Vec<TriagedIssue>,
    pub membership: Vec<MembershipUpdate>,
}

impl RepositoryWrite {
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.membership.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchWrite {
    pub batch_id: BatchId,
    pub repositories: Vec<RepositoryWrite>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct CommitReceipt {
    pub inserted: usize,
    pub updated: usize,
    pub membership_updates: usize,
    pub versions: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct StoreStats {
    pub total: usize,
    pub open: usize,
    pub closed: usize,
    pub duplicates: usize,
    pub average_score: f64,
    pub by_category: BTreeMap<String, usize>,
    pub by_priority: BTreeMap<String, usize>,
    pub by_stack: BTreeMap<String, usize>,
    pub by_repository: BTreeMap<String, usize>,
}

/// Storage backend shared by the ingest pipeline (sole writer) and read-only callers.
#[async_trait]
pub trait IssueStore: Send + Sync {
    /// Read every stored record of `repository` together with the repository version.
    async fn load_repository(&self, repository: &str) -> Result<RepositorySnapshot, StoreError>;

    /// Atomically apply `write`. Fails with [`StoreError::Conflict`] without applying
    /// anything when any repository's version moved past `expected_version`.
    async fn commit(&self, write: &BatchWrite) -> Result<CommitReceipt, StoreError>;

    async fn get_by_repository(&self, repository: &str) -> Result<Vec<TriagedIssue>, StoreError>;

    /// Records whose total score lies in `[min, max]`, highest first.
    async fn get_by_score_range(&self, min: f64, max: f64) -> Result<Vec<TriagedIssue>, StoreError>;

    async fn get_by_category(&self, category: Category) -> Result<Vec<TriagedIssue>, StoreError>;

    /// Case-insensitive substring search over title and body, highest score first.
    async fn search(&self, text: &str, limit: usize) -> Result<Vec<TriagedIssue>, StoreError>;

    /// Highest-scoring non-duplicate records.
    async fn top_by_score(&self, limit: usize) -> Result<Vec<TriagedIssue>, StoreError>;

    async fn get_stats(&self) -> Result<StoreStats, StoreError>;
}

/// Ordering used by every score-ranked query: total score descending, then id ascending.
pub fn rank_by_score(issues: &mut [TriagedIssue]) {
    issues.sort_by(|a, b| {
        b.score
            .total
            .total_cmp(&a.score.total)
            .then_with(|| a.id().cmp(&b.id()))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
        assert_eq!(policy.max_attempts(), 6);
    }

    #[test]
    fn only_conflicts_are_retryable() {
        assert!(StoreError::conflict("acme/widgets", "stale version").is_conflict());
        assert_eq!(
            StoreError::Unavailable("pool closed".into()).disposition(),
            RetryDisposition::NonRetryable
        );
        assert_eq!(StoreError::Backend("syntax".into()).disposition(), RetryDisposition::NonRetryable);
    }
}
