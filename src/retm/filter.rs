use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{Facet, FacetChange};

/// Which changed facets an effector wants to see.
///
/// A single filter is a conjunction: type match (any of `types`, or any type
/// when empty), equality on every entry of `aspects`, and equality on every
/// entry of `state`. A list of filters is a disjunction; an empty list matches
/// everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FacetFilter {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub types: Vec<String>,
    /// Aspect wire name → expected value (`agentId`, `streamId`, `entityId`, ...).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub aspects: BTreeMap<String, Value>,
    /// State key → expected value.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub state: BTreeMap<String, Value>,
}

impl FacetFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn of_type(facet_type: impl Into<String>) -> Self {
        Self::new().with_type(facet_type)
    }

    pub fn with_type(mut self, facet_type: impl Into<String>) -> Self {
        self.types.push(facet_type.into());
        self
    }

    pub fn with_aspect(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.aspects.insert(name.into(), value.into());
        self
    }

    pub fn with_state(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.state.insert(key.into(), value.into());
        self
    }

    pub fn matches(&self, facet: &Facet) -> bool {
        if !self.types.is_empty() && !self.types.iter().any(|t| *t == facet.facet_type) {
            return false;
        }
        let aspects_match = self
            .aspects
            .iter()
            .all(|(name, expected)| facet.aspect(name).as_ref() == Some(expected));
        let state_match = self
            .state
            .iter()
            .all(|(key, expected)| facet.state_value(key) == Some(expected));
        aspects_match && state_match
    }
}

pub fn matches_any(filters: &[FacetFilter], facet: &Facet) -> bool {
    filters.is_empty() || filters.iter().any(|f| f.matches(facet))
}

/// The subset of a change set an effector with `filters` receives.
pub fn select_changes(filters: &[FacetFilter], changes: &[FacetChange]) -> Vec<FacetChange> {
    changes
        .iter()
        .filter(|c| matches_any(filters, &c.facet))
        .cloned()
        .collect()
}
