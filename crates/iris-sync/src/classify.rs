//! Rule-based classification into category, priority and technology stack.
//!
//! Every matching rule adds its weight to the accumulator of its target. The heaviest
//! category wins (ties go to the alphabetically first name) and the heaviest priority wins
//! (ties go to the more severe level). Stack tags are independent of the vote.

use std::collections::{BTreeMap, BTreeSet};

use iris_core::{Category, ClassificationResult, IssueRecord, Priority, ScoreBreakdown};
use regex::Regex;
use serde::Serialize;

use crate::config::{ClassificationRules, ConfigError, RuleSpec, StackRuleSpec};
use crate::fingerprint::normalize_text;
use crate::terms::Term;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleTarget {
    Category(Category),
    Priority(Priority),
}

#[derive(Debug, Clone)]
pub enum RuleMatcher {
    Keywords(Vec<Term>),
    Pattern(Regex),
}

impl RuleMatcher {
    fn matches(&self, text: &str) -> bool {
        match self {
            RuleMatcher::Keywords(keywords) => keywords.iter().any(|k| k.is_match(text)),
            RuleMatcher::Pattern(regex) => regex.is_match(text),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClassificationRule {
    pub name: String,
    pub matcher: RuleMatcher,
    pub target: RuleTarget,
    pub weight: f64,
}

impl ClassificationRule {
    pub fn from_spec(spec: &RuleSpec) -> Result<Self, ConfigError> {
        let target = match (spec.category, spec.priority) {
            (Some(Category::Uncategorized), None) => {
                return Err(ConfigError::Invalid(format!(
                    "rule `{}` cannot target the uncategorized bucket",
                    spec.name
                )))
            }
            (Some(category), None) => RuleTarget::Category(category),
            (None, Some(priority)) => RuleTarget::Priority(priority),
            _ => return Err(ConfigError::RuleTarget { rule: spec.name.clone() }),
        };

        let keywords = Term::parse_all(&spec.contains_any)?;
        let matcher = match (&spec.pattern, keywords.is_empty()) {
            (Some(pattern), true) => RuleMatcher::Pattern(Regex::new(pattern).map_err(|source| {
                ConfigError::InvalidPattern {
                    pattern: pattern.clone(),
                    source,
                }
            })?),
            (None, false) => RuleMatcher::Keywords(keywords),
            _ => return Err(ConfigError::RuleMatcher { rule: spec.name.clone() }),
        };

        if !spec.weight.is_finite() || spec.weight <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "rule `{}` has non-positive weight {}",
                spec.name, spec.weight
            )));
        }

        Ok(Self {
            name: spec.name.clone(),
            matcher,
            target,
            weight: spec.weight,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StackRule {
    pub tag: String,
    pub keywords: Vec<Term>,
}

impl StackRule {
    pub fn from_spec(spec: &StackRuleSpec) -> Result<Self, ConfigError> {
        let tag = spec.tag.trim().to_lowercase();
        let keywords = Term::parse_all(&spec.contains_any)?;
        if tag.is_empty() || keywords.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "stack rule `{}` needs a tag and at least one keyword",
                spec.tag
            )));
        }
        Ok(Self { tag, keywords })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassifiedRecord {
    pub id: u64,
    pub result: ClassificationResult,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedRecord {
    pub id: u64,
    pub reason: String,
}

/// Outcome of [`Classifier::classify_batch`]: per-record results plus aggregate counts.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct BatchClassification {
    pub results: Vec<ClassifiedRecord>,
    pub skipped: Vec<SkippedRecord>,
    pub by_category: BTreeMap<String, usize>,
    pub by_priority: BTreeMap<String, usize>,
    pub by_stack: BTreeMap<String, usize>,
}

impl BatchClassification {
    pub fn error_count(&self) -> usize {
        self.skipped.len()
    }
}

#[derive(Debug, Clone)]
pub struct Classifier {
    rules: Vec<ClassificationRule>,
    stacks: Vec<StackRule>,
    escalation_threshold: f64,
}

impl Classifier {
    pub fn new(rules: Vec<ClassificationRule>, stacks: Vec<StackRule>, escalation_threshold: f64) -> Self {
        Self {
            rules,
            stacks,
            escalation_threshold,
        }
    }

    pub fn from_rules(config: &ClassificationRules) -> Result<Self, ConfigError> {
        if !config.escalation_threshold.is_finite() || config.escalation_threshold < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "escalation threshold {} must be non-negative",
                config.escalation_threshold
            )));
        }
        let rules = config
            .rules
            .iter()
            .map(ClassificationRule::from_spec)
            .collect::<Result<Vec<_>, _>>()?;
        let stacks = config
            .stacks
            .iter()
            .map(StackRule::from_spec)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(rules, stacks, config.escalation_threshold))
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    pub fn classify(&self, record: &IssueRecord) -> ClassificationResult {
        self.vote(record).0
    }

    /// Classifies, then raises priority one level when a rule matched and the relevance
    /// total reaches the escalation threshold.
    pub fn classify_with_score(&self, record: &IssueRecord, breakdown: &ScoreBreakdown) -> ClassificationResult {
        let (mut result, matched) = self.vote(record);
        if matched && breakdown.total >= self.escalation_threshold {
            result.priority = result.priority.escalated();
        }
        result
    }

    /// Classifies every valid record; invalid records are skipped and reported.
    pub fn classify_batch(&self, records: &[IssueRecord]) -> BatchClassification {
        let mut batch = BatchClassification::default();
        for record in records {
            if let Err(err) = record.validate() {
                batch.skipped.push(SkippedRecord {
                    id: record.id,
                    reason: err.to_string(),
                });
                continue;
            }
            let result = self.classify(record);
            *batch.by_category.entry(result.category.to_string()).or_default() += 1;
            *batch.by_priority.entry(result.priority.to_string()).or_default() += 1;
            for tag in &result.stack {
                *batch.by_stack.entry(tag.clone()).or_default() += 1;
            }
            batch.results.push(ClassifiedRecord { id: record.id, result });
        }
        batch
    }

    fn vote(&self, record: &IssueRecord) -> (ClassificationResult, bool) {
        let text = normalize_text(&format!(
            "{} {} {}",
            record.title,
            record.body,
            record.labels.join(" ")
        ));

        let mut categories: Vec<(Category, f64)> = Vec::new();
        let mut priorities: Vec<(Priority, f64)> = Vec::new();
        let mut matched = false;

        for rule in &self.rules {
            if !rule.matcher.matches(&text) {
                continue;
            }
            matched = true;
            match rule.target {
                RuleTarget::Category(category) => add_weight(&mut categories, category, rule.weight),
                RuleTarget::Priority(priority) => add_weight(&mut priorities, priority, rule.weight),
            }
        }

        let stack: BTreeSet<String> = self
            .stacks
            .iter()
            .filter(|s| s.keywords.iter().any(|k| k.is_match(&text)))
            .map(|s| s.tag.clone())
            .collect();

        let mut result = ClassificationResult::unclassified();
        result.stack = stack;

        let category_total: f64 = categories.iter().map(|(_, w)| w).sum();
        if let Some(&(category, weight)) = categories.iter().reduce(|best, candidate| {
            if candidate.1 > best.1 || (candidate.1 == best.1 && candidate.0.as_str() < best.0.as_str()) {
                candidate
            } else {
                best
            }
        }) {
            result.category = category;
            result.confidence = (weight / category_total).clamp(0.0, 1.0);
        }

        if let Some(&(priority, _)) = priorities.iter().reduce(|best, candidate| {
            if candidate.1 > best.1 || (candidate.1 == best.1 && candidate.0.severity() > best.0.severity()) {
                candidate
            } else {
                best
            }
        }) {
            result.priority = priority;
        }

        (result, matched)
    }
}

fn add_weight<T: PartialEq>(acc: &mut Vec<(T, f64)>, key: T, weight: f64) {
    match acc.iter_mut().find(|(k, _)| *k == key) {
        Some((_, total)) => *total += weight,
        None => acc.push((key, weight)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use iris_core::IssueState;

    fn mk_record(id: u64, title: &str, body: &str, labels: &[&str]) -> IssueRecord {
        let ts = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().unwrap();
        IssueRecord {
            id,
            repository: "acme/widgets".into(),
            number: id,
            title: title.into(),
            body: body.into(),
            state: IssueState::Open,
            labels: labels.iter().map(|l| l.to_string()).collect(),
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

    fn rule(name: &str, target: RuleTarget, keywords: &[&str], weight: f64) -> ClassificationRule {
        ClassificationRule {
            name: name.into(),
            matcher: RuleMatcher::Keywords(keywords.iter().map(|k| Term::new(k).expect("term")).collect()),
            target,
            weight,
        }
    }

    fn classifier() -> Classifier {
        Classifier::new(
            vec![
                rule("crash", RuleTarget::Category(Category::Bug), &["crash", "leak"], 3.0),
                rule("slow", RuleTarget::Category(Category::Performance), &["slow", "memory"], 1.0),
                rule("docs", RuleTarget::Category(Category::Documentation), &["readme"], 3.0),
                rule("crash-priority", RuleTarget::Priority(Priority::High), &["crash", "leak"], 2.0),
                rule("typo", RuleTarget::Priority(Priority::Low), &["typo"], 2.0),
            ],
            vec![StackRule {
                tag: "rust".into(),
                keywords: vec![Term::new("tokio").expect("term"), Term::new("cargo").expect("term")],
            }],
            75.0,
        )
    }

    #[test]
    fn no_matching_rule_is_uncategorized() {
        let result = classifier().classify(&mk_record(1, "Add dark mode", "", &[]));
        assert_eq!(result.category, Category::Uncategorized);
        assert_eq!(result.priority, Priority::Medium);
        assert_eq!(result.confidence, 0.0);
        assert!(result.stack.is_empty());
    }

    #[test]
    fn heaviest_category_wins_with_confidence() {
        let record = mk_record(1, "Memory leak in cache", "seen under tokio", &[]);
        let result = classifier().classify(&record);
        assert_eq!(result.category, Category::Bug);
        assert_eq!(result.priority, Priority::High);
        assert!((result.confidence - 0.75).abs() < 1e-12);
        assert_eq!(result.stack, BTreeSet::from(["rust".to_string()]));
    }

    #[test]
    fn ties_break_by_name_and_severity() {
        let record = mk_record(1, "Crash mentioned in README typo", "", &[]);
        let result = classifier().classify(&record);
        // bug and documentation both weigh 3; "bug" sorts first.
        assert_eq!(result.category, Category::Bug);
        // high and low both weigh 2; high is more severe.
        assert_eq!(result.priority, Priority::High);
        assert!((result.confidence - 0.5).abs() < 1e-12);
    }

    #[test]
    fn labels_participate_in_matching() {
        let record = mk_record(1, "Setup instructions", "", &["readme"]);
        assert_eq!(classifier().classify(&record).category, Category::Documentation);
    }

    #[test]
    fn escalation_needs_a_match_and_a_high_score() {
        let classifier = classifier();
        let high = ScoreBreakdown::from_components(30.0, 20.0, 10.0, 10.0, 10.0);
        let low = ScoreBreakdown::from_components(10.0, 0.0, 0.0, 10.0, 0.0);

        let leak = mk_record(1, "Memory leak", "", &[]);
        assert_eq!(classifier.classify_with_score(&leak, &high).priority, Priority::Critical);
        assert_eq!(classifier.classify_with_score(&leak, &low).priority, Priority::High);

        let unmatched = mk_record(2, "Add dark mode", "", &[]);
        assert_eq!(classifier.classify_with_score(&unmatched, &high).priority, Priority::Medium);

        // Same inputs, same output.
        assert_eq!(
            classifier.classify_with_score(&leak, &high),
            classifier.classify_with_score(&leak, &high)
        );
    }

    #[test]
    fn batch_skips_invalid_records_and_counts() {
        let records = vec![
            mk_record(1, "Crash on save", "", &[]),
            mk_record(2, "  ", "", &[]),
            mk_record(3, "Slow build with cargo", "", &[]),
            mk_record(4, "Add dark mode", "", &[]),
        ];
        let batch = classifier().classify_batch(&records);
        assert_eq!(batch.results.len(), 3);
        assert_eq!(batch.error_count(), 1);
        assert_eq!(batch.skipped[0].id, 2);
        assert_eq!(batch.by_category.get("bug"), Some(&1));
        assert_eq!(batch.by_category.get("performance"), Some(&1));
        assert_eq!(batch.by_category.get("uncategorized"), Some(&1));
        assert_eq!(batch.by_priority.get("medium"), Some(&2));
        assert_eq!(batch.by_stack.get("rust"), Some(&1));
    }

    #[test]
    fn rule_specs_are_validated() {
        let spec = |category: Option<Category>, priority: Option<Priority>, pattern: Option<&str>, kw: &[&str]| RuleSpec {
            name: "r".into(),
            category,
            priority,
            contains_any: kw.iter().map(|k| k.to_string()).collect(),
            pattern: pattern.map(str::to_string),
            weight: 1.0,
        };

        assert!(ClassificationRule::from_spec(&spec(Some(Category::Bug), None, None, &["crash"])).is_ok());
        assert!(matches!(
            ClassificationRule::from_spec(&spec(None, None, None, &["crash"])),
            Err(ConfigError::RuleTarget { .. })
        ));
        assert!(matches!(
            ClassificationRule::from_spec(&spec(Some(Category::Bug), Some(Priority::High), None, &["crash"])),
            Err(ConfigError::RuleTarget { .. })
        ));
        assert!(matches!(
            ClassificationRule::from_spec(&spec(Some(Category::Bug), None, Some("crash"), &["crash"])),
            Err(ConfigError::RuleMatcher { .. })
        ));
        assert!(matches!(
            ClassificationRule::from_spec(&spec(None, Some(Priority::Low), Some("(bad"), &[])),
            Err(ConfigError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn builtin_rules_build_a_classifier() {
        let rules = crate::config::RuleSet::builtin().expect("rules");
        let classifier = Classifier::from_rules(&rules.classification).expect("classifier");
        assert!(classifier.rule_count() > 0);
        let result = classifier.classify(&mk_record(
            1,
            "SQL injection in search endpoint",
            "user input reaches the postgres query",
            &["security"],
        ));
        assert_eq!(result.category, Category::Security);
        assert_eq!(result.priority, Priority::Critical);
        assert!(result.stack.contains("database"));
    }

    #[test]
    fn stack_tags_ignore_partial_words() {
        let rules = crate::config::RuleSet::builtin().expect("rules");
        let classifier = Classifier::from_rules(&rules.classification).expect("classifier");

        let noisy = mk_record(1, "Ingest pipeline hangs on anode sensor nodes", "backed by a nosql cache", &[]);
        assert!(classifier.classify(&noisy).stack.is_empty());

        let real = mk_record(2, "Crash in the node service", "pip install fails, then sql errors", &[]);
        assert_eq!(
            classifier.classify(&real).stack,
            BTreeSet::from(["database".to_string(), "javascript".to_string(), "python".to_string()])
        );
    }
}
