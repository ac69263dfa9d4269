/// Boost manifests: multiplicative score adjustments by source type, header term and topic term.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::RetrievalConfig;
use crate::errors::GroundrankError;
use crate::types::{Chunk, SourceType};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BoostManifest {
    #[serde(default)]
    pub source_boosts: BTreeMap<SourceType, f64>,
    /// Applied when the term is a case-insensitive substring of any chunk header
    #[serde(default)]
    pub header_boosts: BTreeMap<String, f64>,
    /// Applied when the term is a case-insensitive substring of the chunk content
    #[serde(default)]
    pub topic_boosts: BTreeMap<String, f64>,
}

impl BoostManifest {
    /// The boosts configured under `[retrieval]`.
    pub fn from_config(config: &RetrievalConfig) -> Self {
        BoostManifest {
            source_boosts: config.source_boosts.clone(),
            header_boosts: config.header_boosts.clone(),
            topic_boosts: config.topic_boosts.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.source_boosts.is_empty() && self.header_boosts.is_empty() && self.topic_boosts.is_empty()
    }

    /// Every factor must be finite and non-negative, every term non-empty.
    pub fn validate(&self) -> Result<(), GroundrankError> {
        for (source, factor) in &self.source_boosts {
            check_factor("source_boosts", &source.to_string(), *factor)?;
        }
        for (field, map) in [("header_boosts", &self.header_boosts), ("topic_boosts", &self.topic_boosts)] {
            for (term, factor) in map {
                if term.trim().is_empty() {
                    return Err(GroundrankError::validation(field, "boost terms cannot be empty"));
                }
                check_factor(field, term, *factor)?;
            }
        }
        Ok(())
    }

    /// Lowercase the terms once so scoring does not repeat it per chunk.
    pub fn prepare(&self) -> PreparedBoosts {
        PreparedBoosts {
            source: self.source_boosts.clone(),
            header: lowercase_terms(&self.header_boosts),
            topic: lowercase_terms(&self.topic_boosts),
        }
    }
}

fn check_factor(field: &str, key: &str, factor: f64) -> Result<(), GroundrankError> {
    if !factor.is_finite() || factor < 0.0 {
        return Err(GroundrankError::validation(
            field,
            &format!("boost for '{}' must be a finite non-negative number, got {}", key, factor),
        ));
    }
    Ok(())
}

fn lowercase_terms(map: &BTreeMap<String, f64>) -> Vec<(String, f64)> {
    map.iter().map(|(t, f)| (t.to_lowercase(), *f)).collect()
}

/// A validated manifest ready for scoring.
#[derive(Debug, Clone, Default)]
pub struct PreparedBoosts {
    source: BTreeMap<SourceType, f64>,
    header: Vec<(String, f64)>,
    topic: Vec<(String, f64)>,
}

impl PreparedBoosts {
    /// Product of every boost that applies to `chunk`; 1.0 when none do.
    pub fn multiplier(&self, chunk: &Chunk) -> f64 {
        let mut factor = self.source.get(&chunk.source_type).copied().unwrap_or(1.0);

        if !self.header.is_empty() && !chunk.headers.is_empty() {
            let headers: Vec<String> = chunk.headers.iter().map(|h| h.to_lowercase()).collect();
            for (term, boost) in &self.header {
                if headers.iter().any(|h| h.contains(term.as_str())) {
                    factor *= boost;
                }
            }
        }

        if !self.topic.is_empty() {
            let content = chunk.content.to_lowercase();
            for (term, boost) in &self.topic {
                if content.contains(term.as_str()) {
                    factor *= boost;
                }
            }
        }
        factor
    }
}
