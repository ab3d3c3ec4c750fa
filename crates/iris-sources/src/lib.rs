//! Record source contracts + fixture-backed sources.
//!
//! Sources hand the pipeline one bounded, ordered batch of issues per repository per
//! invocation. Fetch retries belong to the source; the pipeline never re-requests.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use iris_core::{IssueRecord, IssueState};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "iris-sources";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[async_trait]
pub trait RecordSource: Send {
    fn repository(&self) -> &str;

    /// Next bounded batch of normalized records, in source order. An empty vector means
    /// the source is exhausted for this invocation.
    async fn fetch(&mut self) -> Result<Vec<IssueRecord>, SourceError>;
}

/// Label entries arrive either as plain names or as label objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawLabel {
    Name(String),
    Object { name: String },
}

impl RawLabel {
    pub fn name(&self) -> &str {
        match self {
            RawLabel::Name(name) | RawLabel::Object { name } => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawUser {
    pub login: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMilestone {
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawReactions {
    #[serde(default)]
    pub total_count: u32,
}

/// Issue payload in the shape the upstream issue API emits it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawIssue {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub number: Option<u64>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub labels: Vec<RawLabel>,
    #[serde(default)]
    pub user: Option<RawUser>,
    #[serde(default)]
    pub assignee: Option<RawUser>,
    #[serde(default)]
    pub milestone: Option<RawMilestone>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub comments: u32,
    #[serde(default)]
    pub reactions: Option<RawReactions>,
    #[serde(default)]
    pub html_url: Option<String>,
    #[serde(default)]
    pub pull_request: Option<JsonValue>,
}

impl RawIssue {
    pub fn is_pull_request(&self) -> bool {
        self.pull_request.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureBundle {
    pub repository: String,
    pub fetched_at: DateTime<Utc>,
    pub issues: Vec<RawIssue>,
    #[serde(default)]
    pub notes: Option<String>,
}

pub fn load_fixture_bundle(path: impl AsRef<Path>) -> Result<FixtureBundle> {
    let path = path.as_ref();
    let bundle: FixtureBundle = read_json_file(path)?;
    if bundle.repository.trim().is_empty() {
        anyhow::bail!("fixture {} has an empty repository", path.display());
    }
    Ok(bundle)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

fn text_or_none(value: Option<&str>) -> Option<String> {
    let trimmed = value?.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Map a raw payload onto the record model. Missing identifiers and titles are carried
/// through as zero/empty so the pipeline's validation reports them per record.
pub fn normalize_issue(repository: &str, raw: &RawIssue, fetched_at: DateTime<Utc>) -> IssueRecord {
    let created_at = raw.created_at.or(raw.updated_at).unwrap_or(fetched_at);
    let updated_at = raw.updated_at.unwrap_or(created_at).max(created_at);
    let state = match raw.state.as_deref().map(str::parse::<IssueState>) {
        Some(Ok(state)) => state,
        _ if raw.closed_at.is_some() => IssueState::Closed,
        _ => IssueState::Open,
    };

    let mut labels: Vec<String> = Vec::with_capacity(raw.labels.len());
    for label in &raw.labels {
        let name = label.name().trim();
        if !name.is_empty() && !labels.iter().any(|l| l.eq_ignore_ascii_case(name)) {
            labels.push(name.to_string());
        }
    }

    IssueRecord {
        id: raw.id.unwrap_or(0),
        repository: repository.to_string(),
        number: raw.number.unwrap_or(0),
        title: raw.title.as_deref().map(str::trim).unwrap_or_default().to_string(),
        body: raw.body.clone().unwrap_or_default(),
        state,
        labels,
        author: raw.user.as_ref().and_then(|u| text_or_none(Some(u.login.as_str()))),
        assignee: raw.assignee.as_ref().and_then(|u| text_or_none(Some(u.login.as_str()))),
        milestone: raw.milestone.as_ref().and_then(|m| text_or_none(Some(m.title.as_str()))),
        created_at,
        updated_at,
        closed_at: raw.closed_at,
        comment_count: raw.comments,
        reaction_count: raw.reactions.as_ref().map(|r| r.total_count).unwrap_or(0),
        url: text_or_none(raw.html_url.as_deref()),
    }
}

/// Normalize a bundle, dropping pull requests the issue API mixes into its listing.
pub fn bundle_to_records(bundle: &FixtureBundle) -> Vec<IssueRecord> {
    bundle
        .issues
        .iter()
        .filter(|raw| !raw.is_pull_request())
        .map(|raw| normalize_issue(&bundle.repository, raw, bundle.fetched_at))
        .collect()
}

/// Serves a fixture bundle from disk, once.
#[derive(Debug)]
pub struct FixtureSource {
    path: PathBuf,
    bundle: FixtureBundle,
    served: bool,
}

impl FixtureSource {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let bundle = load_fixture_bundle(&path)?;
        Ok(Self {
            path,
            bundle,
            served: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RecordSource for FixtureSource {
    fn repository(&self) -> &str {
        &self.bundle.repository
    }

    async fn fetch(&mut self) -> Result<Vec<IssueRecord>, SourceError> {
        if self.served {
            return Ok(Vec::new());
        }
        self.served = true;
        let records = bundle_to_records(&self.bundle);
        debug!(
            repository = self.bundle.repository.as_str(),
            path = %self.path.display(),
            records = records.len(),
            "fixture source served bundle"
        );
        Ok(records)
    }
}

/// Serves pre-built records, once. Used to feed the pipeline from memory.
#[derive(Debug, Clone)]
pub struct StaticSource {
    repository: String,
    records: Option<Vec<IssueRecord>>,
}

impl StaticSource {
    pub fn new(repository: impl Into<String>, records: Vec<IssueRecord>) -> Self {
        Self {
            repository: repository.into(),
            records: Some(records),
        }
    }
}

#[async_trait]
impl RecordSource for StaticSource {
    fn repository(&self) -> &str {
        &self.repository
    }

    async fn fetch(&mut self) -> Result<Vec<IssueRecord>, SourceError> {
        Ok(self.records.take().unwrap_or_default())
    }
}
