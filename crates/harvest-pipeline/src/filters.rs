//! Source listing filters
//!
//! Filters use the JSON:API query-string form, e.g.
//! `filter[date_modified][gte]=2024-01-01&filter[public]=true`.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{PipelineError, Result};
use crate::model::RecordKind;

const TIME_FILTER_FIELDS: [&str; 3] = ["date_modified", "date_created", "date_registered"];
const RANGE_SUFFIXES: [&str; 3] = ["", "[gte]", "[lte]"];
const PUBLIC_FILTER: &str = "filter[public]";

/// Flat, string-keyed listing filter set
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterParams {
    params: BTreeMap<String, String>,
}

impl FilterParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a query string; an empty string yields no filters
    pub fn parse(query: &str) -> Result<Self> {
        let query = query.trim().trim_start_matches('?');
        let mut params = BTreeMap::new();
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            if key.is_empty() {
                return Err(PipelineError::config(format!(
                    "Filter '{}' has an empty key",
                    query
                )));
            }
            params.insert(key.into_owned(), value.into_owned());
        }
        Ok(Self { params })
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.params.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Whether any explicit time-range filter is present
    pub fn has_time_range(&self) -> bool {
        TIME_FILTER_FIELDS.iter().any(|field| {
            RANGE_SUFFIXES
                .iter()
                .any(|suffix| self.params.contains_key(&format!("filter[{}]{}", field, suffix)))
        })
    }

    /// Add `filter[public]=true` unless already set or the kind is exempt
    pub fn apply_kind_defaults(&mut self, kind: RecordKind) {
        if kind.public_by_default() && !self.params.contains_key(PUBLIC_FILTER) {
            self.insert(PUBLIC_FILTER, "true");
        }
    }

    /// Set the query-level lower bound on the kind's filter field, at day granularity
    pub fn set_lower_bound(&mut self, kind: RecordKind, bound: DateTime<Utc>) {
        self.insert(
            format!("filter[{}][gte]", kind.filter_field()),
            bound.format("%Y-%m-%d").to_string(),
        );
    }
}

impl fmt::Display for FilterParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let encoded = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(self.params.iter())
            .finish();
        f.write_str(&encoded)
    }
}
