//! Structural filtering of event sequences.
//!
//! A filter query is a JSONPath expression evaluated with the candidate
//! sequence itself as the root document, so `$[*]` selects every event,
//! `$[?@.a == 2]` selects events whose `a` field equals 2, and
//! `$[*].f.g` projects a nested field out of each event. The empty query
//! matches everything without projection.

use crate::error::{BusError, Result};
use crate::types::Event;
use serde_json::Value;
use serde_json_path::JsonPath;

/// A compiled, immutable filter query.
#[derive(Clone, Debug)]
pub struct FilterQuery {
    source: String,
    path: Option<JsonPath>,
}

impl FilterQuery {
    /// Compile a query. Fails fast on syntax errors so a subscriber is never
    /// registered with a filter that would silently drop events later.
    pub fn parse(query: &str) -> Result<Self> {
        if query.trim().is_empty() {
            return Ok(Self::match_all());
        }

        let path = JsonPath::parse(query).map_err(|e| BusError::InvalidFilter {
            query: query.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            source: query.to_string(),
            path: Some(path),
        })
    }

    /// The empty query.
    pub fn match_all() -> Self {
        Self {
            source: String::new(),
            path: None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Evaluate against a candidate sequence, returning matches in
    /// evaluation order. No match is an empty result, not an error.
    pub fn apply(&self, candidates: &[Event]) -> Vec<Event> {
        let Some(path) = &self.path else {
            return candidates.to_vec();
        };

        let root = Value::Array(candidates.iter().map(|e| e.as_value().clone()).collect());
        path.query(&root)
            .all()
            .into_iter()
            .cloned()
            .map(Event::json)
            .collect()
    }
}

impl Default for FilterQuery {
    fn default() -> Self {
        Self::match_all()
    }
}

/// Parse `query` and apply it to `candidates` in one step.
pub fn apply(query: &str, candidates: &[Event]) -> Result<Vec<Event>> {
    Ok(FilterQuery::parse(query)?.apply(candidates))
}
