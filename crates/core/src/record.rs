//! Record types exchanged with callers.
//!
//! A record is an id, a vector and a flat `String → String` metadata map.
//! Metadata values are plain strings with a fixed bincode encoding; there is
//! no dynamic value type.

use crate::config;
use crate::error::{IndexError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// String key/value metadata attached to a vector.
pub type Metadata = HashMap<String, String>;

/// Internal dense slot number of a stored vector.
pub type Slot = u32;

/// A stored vector with its id and metadata, as returned by [`VectorIndex::get_record`](crate::VectorIndex::get_record).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: String,
    pub vector: Vec<f32>,
    pub metadata: Metadata,
}

impl VectorRecord {
    pub fn new(id: impl Into<String>, vector: Vec<f32>) -> Self {
        Self {
            id: id.into(),
            vector,
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn dimension(&self) -> usize {
        self.vector.len()
    }
}

/// One search result.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub id: String,
    /// Similarity derived from `distance` by the index metric (higher is closer).
    pub score: f32,
    pub distance: f32,
    pub metadata: Metadata,
    /// Present only when requested through [`SearchOptions::include_vectors`](crate::SearchOptions).
    pub vector: Option<Vec<f32>>,
}

/// How much a result list can be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confidence {
    /// Produced by an exhaustive scan.
    Exact,
    /// Produced by a graph search that saturated its beam or visited every
    /// candidate it could have returned.
    Approximate,
    /// The graph beam ran dry before saturating, so part of the graph was
    /// never reached. Missing results may have been backfilled by a scan.
    Low,
}

/// Results of a search, ascending by distance.
#[derive(Debug, Clone)]
pub struct SearchResponse {
    pub hits: Vec<SearchHit>,
    pub confidence: Confidence,
}

impl SearchResponse {
    pub(crate) fn empty() -> Self {
        Self {
            hits: Vec::new(),
            confidence: Confidence::Exact,
        }
    }

    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.hits.iter().map(|h| h.id.as_str()).collect()
    }

    pub fn is_low_confidence(&self) -> bool {
        self.confidence == Confidence::Low
    }
}

impl IntoIterator for SearchResponse {
    type Item = SearchHit;
    type IntoIter = std::vec::IntoIter<SearchHit>;

    fn into_iter(self) -> Self::IntoIter {
        self.hits.into_iter()
    }
}

/// Rejects empty, oversized or control-character ids.
pub fn validate_id(id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(IndexError::InvalidId("id must be a non-empty string".into()));
    }
    if id.len() > config::MAX_ID_LEN {
        return Err(IndexError::InvalidId(format!(
            "id is {} bytes, limit is {}",
            id.len(),
            config::MAX_ID_LEN
        )));
    }
    if id.chars().any(char::is_control) {
        return Err(IndexError::InvalidId("id contains control characters".into()));
    }
    Ok(())
}

/// Rejects empty, oversized or non-finite vectors.
pub fn validate_vector(vector: &[f32]) -> Result<()> {
    if vector.is_empty() {
        return Err(IndexError::InvalidVector("vector is empty".into()));
    }
    if vector.len() > config::MAX_DIMENSION {
        return Err(IndexError::InvalidVector(format!(
            "vector has {} components, limit is {}",
            vector.len(),
            config::MAX_DIMENSION
        )));
    }
    if let Some(pos) = vector.iter().position(|x| !x.is_finite()) {
        return Err(IndexError::InvalidVector(format!(
            "component {pos} is not finite ({})",
            vector[pos]
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_non_finite_components() {
        assert!(validate_vector(&[1.0, f32::NAN]).is_err());
        assert!(validate_vector(&[f32::INFINITY]).is_err());
        assert!(validate_vector(&[]).is_err());
        assert!(validate_vector(&[0.0, -1.5]).is_ok());
    }

    #[test]
    fn test_rejects_blank_ids() {
        assert!(validate_id("").is_err());
        assert!(validate_id("   ").is_err());
        assert!(validate_id("a\nb").is_err());
        assert!(validate_id("doc-1").is_ok());
    }
}
