//! Pairwise similarity between issue records.
//!
//! Three signals are combined with [`SimilarityWeights`]: a normalized Levenshtein ratio of
//! the titles, Jaccard overlap of the body token sets, and an exact-fingerprint boost.
//! Records whose normalized title and body are identical always score exactly `1.0`.

use std::collections::HashSet;

use iris_core::{Fingerprint, IssueRecord};
use serde::{Deserialize, Serialize};
use strsim::normalized_levenshtein;

use crate::config::ConfigError;
use crate::fingerprint::{fingerprint_parts, normalize_text};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimilarityWeights {
    pub title: f64,
    pub body: f64,
    pub fingerprint: f64,
}

impl Default for SimilarityWeights {
    fn default() -> Self {
        Self {
            title: 0.4,
            body: 0.4,
            fingerprint: 0.2,
        }
    }
}

impl SimilarityWeights {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let weights = [self.title, self.body, self.fingerprint];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(ConfigError::Invalid(format!(
                "similarity weights must be non-negative, got {self:?}"
            )));
        }
        let sum: f64 = weights.iter().sum();
        if (sum - 1.0).abs() > 1e-9 {
            return Err(ConfigError::Invalid(format!(
                "similarity weights must sum to 1.0, got {sum}"
            )));
        }
        Ok(())
    }

    pub fn score(&self, a: &SimilarityProfile, b: &SimilarityProfile) -> f64 {
        if a.title == b.title && a.body == b.body {
            return 1.0;
        }
        let boost = if a.fingerprint == b.fingerprint { 1.0 } else { 0.0 };
        let raw = self.title * normalized_levenshtein(&a.title, &b.title)
            + self.body * jaccard(&a.tokens, &b.tokens)
            + self.fingerprint * boost;
        raw.clamp(0.0, 1.0)
    }
}

/// Normalized text of one record, prepared once so a record can be compared against
/// many peers without re-tokenizing.
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarityProfile {
    title: String,
    body: String,
    tokens: HashSet<String>,
    fingerprint: Fingerprint,
}

impl SimilarityProfile {
    pub fn of(record: &IssueRecord) -> Self {
        Self::from_parts(&record.title, &record.body)
    }

    pub fn from_parts(title: &str, body: &str) -> Self {
        Self {
            title: normalize_text(title),
            body: normalize_text(body),
            tokens: tokenize(body),
            fingerprint: fingerprint_parts(title, body),
        }
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }
}

/// Lower-case alphanumeric tokens.
pub fn tokenize(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let shared = a.intersection(b).count();
    let union = a.len() + b.len() - shared;
    shared as f64 / union as f64
}

pub fn title_ratio(a: &IssueRecord, b: &IssueRecord) -> f64 {
    normalized_levenshtein(&normalize_text(&a.title), &normalize_text(&b.title))
}

pub fn body_overlap(a: &IssueRecord, b: &IssueRecord) -> f64 {
    jaccard(&tokenize(&a.body), &tokenize(&b.body))
}

pub fn fingerprint_boost(a: &IssueRecord, b: &IssueRecord) -> f64 {
    if fingerprint_parts(&a.title, &a.body) == fingerprint_parts(&b.title, &b.body) {
        1.0
    } else {
        0.0
    }
}

/// Similarity under the default weights.
pub fn similarity(a: &IssueRecord, b: &IssueRecord) -> f64 {
    SimilarityWeights::default().score(&SimilarityProfile::of(a), &SimilarityProfile::of(b))
}
