//! Metadata filters for search.
//!
//! A [`Filter`] holds `must` (AND) and `must_not` (AND-NOT) conditions over
//! string metadata. Graph searches evaluate the filter during traversal:
//! rejected nodes still serve as stepping stones but never appear in results.

use crate::record::Metadata;
use serde::{Deserialize, Serialize};

/// A single condition on one metadata key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Condition {
    /// Key present with exactly this value.
    Eq(String, String),
    /// Key present with a different value.
    Ne(String, String),
    /// Key present with one of the values.
    In(String, Vec<String>),
    /// Key present, any value.
    Exists(String),
    /// Key present and its value starts with the prefix.
    Prefix(String, String),
}

impl Condition {
    fn matches(&self, metadata: &Metadata) -> bool {
        match self {
            Condition::Eq(key, value) => metadata.get(key).is_some_and(|v| v == value),
            Condition::Ne(key, value) => metadata.get(key).is_some_and(|v| v != value),
            Condition::In(key, values) => metadata
                .get(key)
                .is_some_and(|v| values.iter().any(|candidate| candidate == v)),
            Condition::Exists(key) => metadata.contains_key(key),
            Condition::Prefix(key, prefix) => {
                metadata.get(key).is_some_and(|v| v.starts_with(prefix.as_str()))
            }
        }
    }
}

/// Metadata filter: every `must` condition holds and no `must_not` condition holds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default)]
    pub must: Vec<Condition>,
    #[serde(default)]
    pub must_not: Vec<Condition>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter matching records whose metadata contains every pair of `pairs`.
    pub fn equals<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self {
            must: pairs
                .into_iter()
                .map(|(k, v)| Condition::Eq(k.into(), v.into()))
                .collect(),
            must_not: Vec::new(),
        }
    }

    pub fn must(mut self, condition: Condition) -> Self {
        self.must.push(condition);
        self
    }

    pub fn must_not(mut self, condition: Condition) -> Self {
        self.must_not.push(condition);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.must.is_empty() && self.must_not.is_empty()
    }

    pub fn matches(&self, metadata: &Metadata) -> bool {
        self.must.iter().all(|c| c.matches(metadata))
            && !self.must_not.iter().any(|c| c.matches(metadata))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(pairs: &[(&str, &str)]) -> Metadata {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_equals_requires_every_pair() {
        let f = Filter::equals([("lang", "en"), ("kind", "doc")]);
        assert!(f.matches(&meta(&[("lang", "en"), ("kind", "doc"), ("x", "y")])));
        assert!(!f.matches(&meta(&[("lang", "en")])));
    }

    #[test]
    fn test_must_not_excludes() {
        let f = Filter::new()
            .must(Condition::Exists("lang".into()))
            .must_not(Condition::In("lang".into(), vec!["de".into(), "fr".into()]));
        assert!(f.matches(&meta(&[("lang", "en")])));
        assert!(!f.matches(&meta(&[("lang", "fr")])));
        assert!(!f.matches(&meta(&[])));
    }

    #[test]
    fn test_ne_requires_presence() {
        let f = Filter::new().must(Condition::Ne("lang".into(), "en".into()));
        assert!(!f.matches(&meta(&[])));
        assert!(f.matches(&meta(&[("lang", "sv")])));
    }

    #[test]
    fn test_prefix() {
        let f = Filter::new().must(Condition::Prefix("path".into(), "/docs/".into()));
        assert!(f.matches(&meta(&[("path", "/docs/a.md")])));
        assert!(!f.matches(&meta(&[("path", "/src/a.rs")])));
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        assert!(Filter::new().matches(&meta(&[])));
    }
}
