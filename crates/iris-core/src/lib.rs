//! Core domain model for IRIS: issue records and the triage results attached to them.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "iris-core";

/// Identifier of one ingest batch, shared by reports and store receipts.
pub type BatchId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueState {
    Open,
    Closed,
}

impl IssueState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueState::Open => "open",
            IssueState::Closed => "closed",
        }
    }
}

impl fmt::Display for IssueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IssueState {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" | "opened" | "reopened" => Ok(IssueState::Open),
            "closed" => Ok(IssueState::Closed),
            _ => Err(ParseEnumError::new("issue state", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} `{value}`")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Repository-scoped natural key of an issue (`owner/name#number`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IssueKey {
    pub repository: String,
    pub number: u64,
}

impl fmt::Display for IssueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.repository, self.number)
    }
}

/// One externally-sourced issue report as observed at ingest time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueRecord {
    /// Identifier assigned by the source, unique per source + number.
    pub id: u64,
    pub repository: String,
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub body: String,
    pub state: IssueState,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub milestone: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub comment_count: u32,
    #[serde(default)]
    pub reaction_count: u32,
    #[serde(default)]
    pub url: Option<String>,
}

impl IssueRecord {
    pub fn key(&self) -> IssueKey {
        IssueKey {
            repository: self.repository.clone(),
            number: self.number,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == IssueState::Open
    }

    /// Combined activity used when ranking duplicate-group masters.
    pub fn activity(&self) -> u64 {
        u64::from(self.comment_count) + u64::from(self.reaction_count)
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l.trim().eq_ignore_ascii_case(label.trim()))
    }

    /// Checks the fields every downstream engine relies on. Scoring, classification and
    /// similarity assume a record that passed this check.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id == 0 {
            return Err(ValidationError::MissingIdentifier);
        }
        if self.repository.trim().is_empty() {
            return Err(ValidationError::MissingRepository { id: self.id });
        }
        if self.number == 0 {
            return Err(ValidationError::MissingNumber { id: self.id });
        }
        if self.title.trim().is_empty() {
            return Err(ValidationError::MissingTitle { id: self.id });
        }
        if self.updated_at < self.created_at {
            return Err(ValidationError::UpdatedBeforeCreated { id: self.id });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ValidationError {
    #[error("record has no identifier")]
    MissingIdentifier,
    #[error("record {id} has no repository")]
    MissingRepository { id: u64 },
    #[error("record {id} has no issue number")]
    MissingNumber { id: u64 },
    #[error("record {id} has an empty title")]
    MissingTitle { id: u64 },
    #[error("record {id} was updated before it was created")]
    UpdatedBeforeCreated { id: u64 },
}

/// Hex-encoded content hash over normalized title and body.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-signal relevance components. `total` is always the sum of the five components.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub keyword: f64,
    pub pattern: f64,
    pub label: f64,
    pub state: f64,
    pub activity: f64,
    pub total: f64,
}

impl ScoreBreakdown {
    pub fn from_components(keyword: f64, pattern: f64, label: f64, state: f64, activity: f64) -> Self {
        Self {
            keyword,
            pattern,
            label,
            state,
            activity,
            total: keyword + pattern + label + state + activity,
        }
    }

    pub fn components_sum(&self) -> f64 {
        self.keyword + self.pattern + self.label + self.state + self.activity
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Bug,
    Documentation,
    Feature,
    Performance,
    Security,
    Other,
    Uncategorized,
}

impl Category {
    pub const ALL: [Category; 7] = [
        Category::Bug,
        Category::Documentation,
        Category::Feature,
        Category::Performance,
        Category::Security,
        Category::Other,
        Category::Uncategorized,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Bug => "bug",
            Category::Documentation => "documentation",
            Category::Feature => "feature",
            Category::Performance => "performance",
            Category::Security => "security",
            Category::Other => "other",
            Category::Uncategorized => "uncategorized",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        Category::ALL
            .into_iter()
            .find(|c| c.as_str() == needle)
            .ok_or_else(|| ParseEnumError::new("category", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    pub const ALL: [Priority; 4] = [Priority::Critical, Priority::High, Priority::Medium, Priority::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }

    /// Higher is more severe.
    pub fn severity(&self) -> u8 {
        match self {
            Priority::Critical => 3,
            Priority::High => 2,
            Priority::Medium => 1,
            Priority::Low => 0,
        }
    }

    /// One level more severe, saturating at critical.
    pub fn escalated(self) -> Self {
        match self {
            Priority::Low => Priority::Medium,
            Priority::Medium => Priority::High,
            Priority::High | Priority::Critical => Priority::Critical,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        Priority::ALL
            .into_iter()
            .find(|p| p.as_str() == needle)
            .ok_or_else(|| ParseEnumError::new("priority", s))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub category: Category,
    pub priority: Priority,
    pub stack: BTreeSet<String>,
    pub confidence: f64,
}

impl ClassificationResult {
    /// Result for a record no rule matched.
    pub fn unclassified() -> Self {
        Self {
            category: Category::Uncategorized,
            priority: Priority::Medium,
            stack: BTreeSet::new(),
            confidence: 0.0,
        }
    }
}

impl Default for ClassificationResult {
    fn default() -> Self {
        Self::unclassified()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateMember {
    pub id: u64,
    pub similarity_to_master: f64,
}

/// A master record and its near-duplicates. Members never include the master.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub repository: String,
    pub master_id: u64,
    pub members: Vec<DuplicateMember>,
}

impl DuplicateGroup {
    /// Number of records in the group, master included.
    pub fn size(&self) -> usize {
        self.members.len() + 1
    }

    pub fn contains(&self, id: u64) -> bool {
        self.master_id == id || self.members.iter().any(|m| m.id == id)
    }
}

/// Persisted row: the record plus everything the pipeline derived for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriagedIssue {
    pub record: IssueRecord,
    pub fingerprint: Fingerprint,
    pub score: ScoreBreakdown,
    pub classification: ClassificationResult,
    pub duplicate_of: Option<u64>,
    pub duplicate_similarity: Option<f64>,
    pub first_seen_at: DateTime<Utc>,
    pub last_ingested_at: DateTime<Utc>,
}

impl TriagedIssue {
    pub fn id(&self) -> u64 {
        self.record.id
    }

    pub fn repository(&self) -> &str {
        &self.record.repository
    }

    pub fn is_duplicate(&self) -> bool {
        self.duplicate_of.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn mk_record() -> IssueRecord {
        let ts = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().unwrap();
        IssueRecord {
            id: 42,
            repository: "acme/widgets".into(),
            number: 7,
            title: "Memory leak in cache implementation".into(),
            body: String::new(),
            state: IssueState::Open,
            labels: vec!["Bug".into()],
            author: None,
            assignee: None,
            milestone: None,
            created_at: ts,
            updated_at: ts,
            closed_at: None,
            comment_count: 2,
            reaction_count: 3,
            url: None,
        }
    }

    #[test]
    fn validation_rejects_missing_fields() {
        let mut record = mk_record();
        assert!(record.validate().is_ok());

        record.title = "   ".into();
        assert_eq!(record.validate(), Err(ValidationError::MissingTitle { id: 42 }));

        record.id = 0;
        assert_eq!(record.validate(), Err(ValidationError::MissingIdentifier));
    }

    #[test]
    fn labels_match_case_insensitively() {
        let record = mk_record();
        assert!(record.has_label("bug"));
        assert!(!record.has_label("performance"));
        assert_eq!(record.activity(), 5);
        assert_eq!(record.key().to_string(), "acme/widgets#7");
    }

    #[test]
    fn breakdown_total_is_component_sum() {
        let b = ScoreBreakdown::from_components(30.0, 5.0, 10.0, 10.0, 2.5);
        assert_eq!(b.total, b.components_sum());
        assert_eq!(b.total, 57.5);
    }

    #[test]
    fn enums_round_trip_through_strings() {
        for category in Category::ALL {
            assert_eq!(category.as_str().parse::<Category>(), Ok(category));
        }
        assert_eq!("HIGH".parse::<Priority>(), Ok(Priority::High));
        assert!("urgent".parse::<Priority>().is_err());
        assert_eq!(Priority::High.escalated(), Priority::Critical);
        assert_eq!(Priority::Critical.escalated(), Priority::Critical);
    }

    #[test]
    fn serde_uses_lowercase_names() {
        let json = serde_json::to_string(&ClassificationResult::unclassified()).unwrap();
        assert!(json.contains("\"uncategorized\""));
        assert!(json.contains("\"medium\""));
    }
}
