//! Runtime configuration: environment-driven pipeline settings and YAML rule files.

use std::path::{Path, PathBuf};
use std::time::Duration;

use iris_core::{Category, Priority};
use iris_storage::BackoffPolicy;
use serde::Deserialize;
use thiserror::Error;

use crate::dedup::DEFAULT_SIMILARITY_THRESHOLD;

pub const KEYWORDS_FILE: &str = "keywords.yaml";
pub const CLASSIFICATION_FILE: &str = "classification.yaml";

const BUILTIN_KEYWORDS: &str = include_str!("../rules/keywords.yaml");
const BUILTIN_CLASSIFICATION: &str = include_str!("../rules/classification.yaml");

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {file}: {source}")]
    Yaml {
        file: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("keyword list is empty")]
    EmptyKeywords,
    #[error("invalid pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("rule `{rule}` must target exactly one of category or priority")]
    RuleTarget { rule: String },
    #[error("rule `{rule}` must declare exactly one of contains_any or pattern")]
    RuleMatcher { rule: String },
    #[error("environment variable {var}=`{value}`: {reason}")]
    Env {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("{0}")]
    Invalid(String),
}

/// Point values and caps of the relevance score components.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct ScoringPoints {
    pub per_keyword: f64,
    pub keyword_cap: f64,
    pub per_pattern: f64,
    pub pattern_cap: f64,
    pub per_label: f64,
    pub label_cap: f64,
    pub open_bonus: f64,
    pub per_comment: f64,
    pub per_reaction: f64,
    pub activity_cap: f64,
}

impl Default for ScoringPoints {
    fn default() -> Self {
        Self {
            per_keyword: 10.0,
            keyword_cap: 30.0,
            per_pattern: 5.0,
            pattern_cap: 25.0,
            per_label: 10.0,
            label_cap: 20.0,
            open_bonus: 10.0,
            per_comment: 0.5,
            per_reaction: 0.3,
            activity_cap: 15.0,
        }
    }
}

impl ScoringPoints {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let values = [
            self.per_keyword,
            self.keyword_cap,
            self.per_pattern,
            self.pattern_cap,
            self.per_label,
            self.label_cap,
            self.open_bonus,
            self.per_comment,
            self.per_reaction,
            self.activity_cap,
        ];
        if values.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(ConfigError::Invalid("scoring points must be non-negative".into()));
        }
        if self.open_bonus > 10.0 {
            return Err(ConfigError::Invalid("open bonus is capped at 10".into()));
        }
        let ceiling =
            self.keyword_cap + self.pattern_cap + self.label_cap + self.open_bonus + self.activity_cap;
        if ceiling > 100.0 {
            return Err(ConfigError::Invalid(format!(
                "score caps add up to {ceiling}, above 100"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ScoringRules {
    #[allow(dead_code)]
    version: u32,
    pub keywords: Vec<String>,
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub high_value_labels: Vec<String>,
    #[serde(default)]
    pub points: ScoringPoints,
}

/// One classification rule as written in YAML. Exactly one of `category`/`priority` and
/// exactly one of `contains_any`/`pattern` must be set.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RuleSpec {
    pub name: String,
    #[serde(default)]
    pub category: Option<Category>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub contains_any: Vec<String>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default = "default_rule_weight")]
    pub weight: f64,
}

fn default_rule_weight() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StackRuleSpec {
    pub tag: String,
    pub contains_any: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClassificationRules {
    #[allow(dead_code)]
    version: u32,
    #[serde(default = "default_escalation_threshold")]
    pub escalation_threshold: f64,
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
    #[serde(default)]
    pub stacks: Vec<StackRuleSpec>,
}

fn default_escalation_threshold() -> f64 {
    75.0
}

/// Scoring and classification rules, loaded together and never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleSet {
    pub scoring: ScoringRules,
    pub classification: ClassificationRules,
}

impl RuleSet {
    /// Rules bundled with the crate.
    pub fn builtin() -> Result<Self, ConfigError> {
        Self::from_yaml(BUILTIN_KEYWORDS, BUILTIN_CLASSIFICATION)
    }

    /// Reads `keywords.yaml` and `classification.yaml` from `dir`.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let dir = dir.as_ref();
        let keywords = read_rule_file(&dir.join(KEYWORDS_FILE))?;
        let classification = read_rule_file(&dir.join(CLASSIFICATION_FILE))?;
        Self::from_yaml(&keywords, &classification)
    }

    pub fn from_yaml(keywords: &str, classification: &str) -> Result<Self, ConfigError> {
        let scoring: ScoringRules = serde_yaml::from_str(keywords).map_err(|source| ConfigError::Yaml {
            file: KEYWORDS_FILE.to_string(),
            source,
        })?;
        let classification: ClassificationRules =
            serde_yaml::from_str(classification).map_err(|source| ConfigError::Yaml {
                file: CLASSIFICATION_FILE.to_string(),
                source,
            })?;
        Ok(Self {
            scoring,
            classification,
        })
    }
}

fn read_rule_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub similarity_threshold: f64,
    pub backoff: BackoffPolicy,
    pub batch_size: usize,
    pub workers: usize,
    pub database_url: Option<String>,
    pub rules_dir: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            backoff: BackoffPolicy::default(),
            batch_size: 100,
            workers: default_workers(),
            database_url: None,
            rules_dir: None,
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable lookup; `from_env` passes the
    /// process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let config = Self {
            similarity_threshold: parse_var(&lookup, "IRIS_SIMILARITY_THRESHOLD")?
                .unwrap_or(defaults.similarity_threshold),
            backoff: BackoffPolicy {
                max_retries: parse_var(&lookup, "IRIS_MAX_RETRIES")?.unwrap_or(defaults.backoff.max_retries),
                base_delay: parse_var(&lookup, "IRIS_RETRY_BASE_MS")?
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.backoff.base_delay),
                max_delay: parse_var(&lookup, "IRIS_RETRY_MAX_MS")?
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.backoff.max_delay),
            },
            batch_size: parse_var(&lookup, "IRIS_BATCH_SIZE")?.unwrap_or(defaults.batch_size),
            workers: parse_var(&lookup, "IRIS_WORKERS")?.unwrap_or(defaults.workers),
            database_url: lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()),
            rules_dir: lookup("IRIS_RULES_DIR")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            return Err(ConfigError::Invalid(format!(
                "similarity threshold {} is outside [0, 1]",
                self.similarity_threshold
            )));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch size must be at least 1".into()));
        }
        if self.workers == 0 {
            return Err(ConfigError::Invalid("worker count must be at least 1".into()));
        }
        if self.backoff.base_delay > self.backoff.max_delay {
            return Err(ConfigError::Invalid(
                "retry base delay exceeds the maximum delay".into(),
            ));
        }
        Ok(())
    }

    /// Rule files from `rules_dir` when set, otherwise the bundled rules.
    pub fn load_rules(&self) -> Result<RuleSet, ConfigError> {
        match &self.rules_dir {
            Some(dir) => RuleSet::from_dir(dir),
            None => RuleSet::builtin(),
        }
    }
}

fn parse_var<T, F>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(None),
        Some(value) if value.trim().is_empty() => Ok(None),
        Some(value) => match value.trim().parse::<T>() {
            Ok(parsed) => Ok(Some(parsed)),
            Err(e) => Err(ConfigError::Env {
                var,
                reason: e.to_string(),
                value,
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = PipelineConfig::from_lookup(lookup(&[])).expect("config");
        assert_eq!(config.similarity_threshold, 0.75);
        assert_eq!(config.backoff.max_retries, 3);
        assert_eq!(config.batch_size, 100);
        assert!(config.workers >= 1);
        assert!(config.database_url.is_none());
    }

    #[test]
    fn env_values_override_defaults() {
        let config = PipelineConfig::from_lookup(lookup(&[
            ("IRIS_SIMILARITY_THRESHOLD", "0.9"),
            ("IRIS_MAX_RETRIES", "5"),
            ("IRIS_RETRY_BASE_MS", "10"),
            ("IRIS_RETRY_MAX_MS", "80"),
            ("IRIS_WORKERS", "2"),
            ("DATABASE_URL", "postgres://iris@localhost/iris"),
        ]))
        .expect("config");
        assert_eq!(config.similarity_threshold, 0.9);
        assert_eq!(config.backoff.max_attempts(), 6);
        assert_eq!(config.backoff.delay_for_attempt(4), Duration::from_millis(80));
        assert_eq!(config.workers, 2);
        assert_eq!(config.database_url.as_deref(), Some("postgres://iris@localhost/iris"));
    }

    #[test]
    fn invalid_values_fail_startup() {
        let err = PipelineConfig::from_lookup(lookup(&[("IRIS_SIMILARITY_THRESHOLD", "1.5")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        let err = PipelineConfig::from_lookup(lookup(&[("IRIS_BATCH_SIZE", "many")])).unwrap_err();
        assert!(matches!(err, ConfigError::Env { var: "IRIS_BATCH_SIZE", .. }));
        assert!(PipelineConfig::from_lookup(lookup(&[("IRIS_BATCH_SIZE", "0")])).is_err());
    }

    #[test]
    fn builtin_rules_parse() {
        let rules = RuleSet::builtin().expect("builtin rules");
        assert!(!rules.scoring.keywords.is_empty());
        assert!(!rules.classification.rules.is_empty());
        assert_eq!(rules.classification.escalation_threshold, 75.0);
        assert!(rules.scoring.points.validate().is_ok());
    }

    #[test]
    fn rules_load_from_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join(KEYWORDS_FILE),
            "version: 1\nkeywords: [memory, leak]\nhigh_value_labels: [bug]\n",
        )
        .expect("write keywords");
        std::fs::write(
            dir.path().join(CLASSIFICATION_FILE),
            "version: 1\nrules:\n  - name: leak\n    category: bug\n    contains_any: [leak]\n    weight: 2\n",
        )
        .expect("write classification");

        let rules = RuleSet::from_dir(dir.path()).expect("rules");
        assert_eq!(rules.scoring.keywords, vec!["memory".to_string(), "leak".to_string()]);
        assert_eq!(rules.classification.rules[0].category, Some(Category::Bug));
        assert_eq!(rules.classification.rules[0].weight, 2.0);
        assert_eq!(rules.scoring.points, ScoringPoints::default());
    }

    #[test]
    fn missing_rule_file_is_an_io_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(matches!(RuleSet::from_dir(dir.path()), Err(ConfigError::Io { .. })));
    }
}
