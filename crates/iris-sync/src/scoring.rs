//! Relevance scoring.

use iris_core::{IssueRecord, ScoreBreakdown};
use regex::Regex;

use crate::config::{ConfigError, ScoringPoints, ScoringRules};
use crate::fingerprint::normalize_text;
use crate::terms::Term;

#[derive(Debug, Clone)]
pub struct Scorer {
    keywords: Vec<Term>,
    patterns: Vec<Regex>,
    high_value_labels: Vec<String>,
    points: ScoringPoints,
}

impl Scorer {
    pub fn new(
        keywords: &[String],
        patterns: &[String],
        high_value_labels: &[String],
        points: ScoringPoints,
    ) -> Result<Self, ConfigError> {
        points.validate()?;

        let terms = Term::parse_all(keywords)?;
        if terms.is_empty() {
            return Err(ConfigError::EmptyKeywords);
        }

        let patterns = patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|source| ConfigError::InvalidPattern {
                    pattern: pattern.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut labels: Vec<String> = Vec::with_capacity(high_value_labels.len());
        for label in high_value_labels {
            let label = label.trim().to_lowercase();
            if !label.is_empty() && !labels.contains(&label) {
                labels.push(label);
            }
        }

        Ok(Self {
            keywords: terms,
            patterns,
            high_value_labels: labels,
            points,
        })
    }

    pub fn from_rules(rules: &ScoringRules) -> Result<Self, ConfigError> {
        Self::new(&rules.keywords, &rules.patterns, &rules.high_value_labels, rules.points)
    }

    pub fn score(&self, record: &IssueRecord) -> ScoreBreakdown {
        let points = &self.points;
        let text = normalize_text(&format!("{} {}", record.title, record.body));
        let raw = format!("{}\n{}", record.title, record.body);

        let keyword_hits = self.keywords.iter().filter(|k| k.is_match(&text)).count();
        let pattern_hits = self.patterns.iter().filter(|p| p.is_match(&raw)).count();
        let label_hits = self
            .high_value_labels
            .iter()
            .filter(|label| record.has_label(label))
            .count();

        let keyword = (keyword_hits as f64 * points.per_keyword).min(points.keyword_cap);
        let pattern = (pattern_hits as f64 * points.per_pattern).min(points.pattern_cap);
        let label = (label_hits as f64 * points.per_label).min(points.label_cap);
        let state = if record.is_open() { points.open_bonus } else { 0.0 };
        let activity = (f64::from(record.comment_count) * points.per_comment
            + f64::from(record.reaction_count) * points.per_reaction)
            .min(points.activity_cap);

        ScoreBreakdown::from_components(keyword, pattern, label, state, activity)
    }
}
