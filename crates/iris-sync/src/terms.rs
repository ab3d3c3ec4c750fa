//! Keyword terms matched as whole words of normalized text.

use regex::Regex;

use crate::config::ConfigError;
use crate::fingerprint::normalize_text;

/// A normalized keyword and the regex that finds it. Word boundaries are only required on
/// sides that end in a word character, so terms like `c++` still match.
#[derive(Debug, Clone)]
pub struct Term {
    text: String,
    regex: Regex,
}

impl Term {
    pub fn new(raw: &str) -> Result<Self, ConfigError> {
        let text = normalize_text(raw);
        if text.is_empty() {
            return Err(ConfigError::Invalid("keyword terms must not be blank".into()));
        }
        let lead = if text.starts_with(is_word_char) { r"\b" } else { "" };
        let tail = if text.ends_with(is_word_char) { r"\b" } else { "" };
        let pattern = format!("{lead}{}{tail}", regex::escape(&text));
        let regex = Regex::new(&pattern).map_err(|source| ConfigError::InvalidPattern { pattern, source })?;
        Ok(Self { text, regex })
    }

    /// Builds terms from a configured list, dropping blanks and repeats.
    pub fn parse_all(raw: &[String]) -> Result<Vec<Self>, ConfigError> {
        let mut terms: Vec<Term> = Vec::with_capacity(raw.len());
        for item in raw {
            if normalize_text(item).is_empty() {
                continue;
            }
            let term = Term::new(item)?;
            if !terms.contains(&term) {
                terms.push(term);
            }
        }
        Ok(terms)
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// `normalized` must already have gone through [`normalize_text`].
    pub fn is_match(&self, normalized: &str) -> bool {
        self.regex.is_match(normalized)
    }
}

impl PartialEq for Term {
    fn eq(&self, other: &Self) -> bool {
        self.text == other.text
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}
