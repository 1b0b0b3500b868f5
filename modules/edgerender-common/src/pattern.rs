//! URL pattern compilation and matching.
//!
//! Pattern forms, chosen by prefix:
//! - no prefix, no `*`: exact match, case-sensitive
//! - contains `*`: glob, each `*` matches any run of characters
//! - `~regex`: case-sensitive regex
//! - `~*regex`: case-insensitive regex
//!
//! Patterns are compiled once at config load and evaluated on the hot path
//! without allocation.

use std::collections::HashMap;

use regex::{Regex, RegexBuilder};

use crate::error::PatternError;

#[derive(Debug, Clone)]
pub enum UrlPattern {
    Exact(String),
    Glob(Regex),
    Regex(Regex),
}

impl UrlPattern {
    pub fn compile(pattern: &str) -> Result<Self, PatternError> {
        if pattern.is_empty() {
            return Err(PatternError::Empty);
        }

        if let Some(re) = pattern.strip_prefix("~*") {
            let compiled = RegexBuilder::new(re)
                .case_insensitive(true)
                .build()
                .map_err(|source| PatternError::Regex {
                    pattern: pattern.to_string(),
                    source,
                })?;
            return Ok(UrlPattern::Regex(compiled));
        }

        if let Some(re) = pattern.strip_prefix('~') {
            let compiled = Regex::new(re).map_err(|source| PatternError::Regex {
                pattern: pattern.to_string(),
                source,
            })?;
            return Ok(UrlPattern::Regex(compiled));
        }

        if pattern.contains('*') {
            let compiled = Regex::new(&glob_to_regex(pattern)).map_err(|source| {
                PatternError::Regex {
                    pattern: pattern.to_string(),
                    source,
                }
            })?;
            return Ok(UrlPattern::Glob(compiled));
        }

        Ok(UrlPattern::Exact(pattern.to_string()))
    }

    pub fn matches(&self, input: &str) -> bool {
        match self {
            UrlPattern::Exact(s) => s == input,
            UrlPattern::Glob(re) => re.is_match(input),
            UrlPattern::Regex(re) => re.is_match(input),
        }
    }
}

/// Translate a glob into an anchored regex. Only `*` is special; everything
/// else is escaped literally.
fn glob_to_regex(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len() + 8);
    out.push('^');
    for (i, part) in glob.split('*').enumerate() {
        if i > 0 {
            out.push_str(".*");
        }
        out.push_str(&regex::escape(part));
    }
    out.push('$');
    out
}

/// Query-parameter filter attached to a URL rule. Matching is AND across
/// keys and OR across each key's value list. An empty value list matches
/// when the key is present with any value.
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    required: HashMap<String, Vec<String>>,
}

impl QueryFilter {
    pub fn new(required: HashMap<String, Vec<String>>) -> Self {
        Self { required }
    }

    pub fn is_empty(&self) -> bool {
        self.required.is_empty()
    }

    pub fn matches(&self, pairs: &[(String, String)]) -> bool {
        self.required.iter().all(|(key, values)| {
            let present: Vec<&str> = pairs
                .iter()
                .filter(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
                .collect();
            if present.is_empty() {
                return false;
            }
            values.is_empty() || present.iter().any(|v| values.iter().any(|want| want == v))
        })
    }
}

/// Normalize a configured domain for table lookup: lowercase, trailing dot
/// and port stripped.
pub fn normalize_domain(domain: &str) -> String {
    let d = domain.trim().trim_end_matches('.');
    let d = d.rsplit_once(':').map_or(d, |(host, port)| {
        if port.chars().all(|c| c.is_ascii_digit()) {
            host
        } else {
            d
        }
    });
    d.to_ascii_lowercase()
}
