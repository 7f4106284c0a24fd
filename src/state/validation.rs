use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{ConnectomeError, VeilResult};
use crate::types::Facet;

/// What happens to an `addFacet` whose facet fails validation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationMode {
    /// Drop the delta and log an error.
    Strict,
    /// Log a warning and apply it anyway.
    #[default]
    Lenient,
}

/// Required aspects per facet type. Types without a rule always pass.
#[derive(Debug, Clone)]
pub struct FacetValidator {
    rules: BTreeMap<String, Vec<String>>,
}

impl FacetValidator {
    /// A validator with no rules.
    pub fn empty() -> Self {
        Self {
            rules: BTreeMap::new(),
        }
    }

    /// Rules for the facet types the runtime itself renders.
    pub fn builtin() -> Self {
        Self::empty()
            .with_rule("speech", &["content", "agentId"])
            .with_rule("thought", &["content", "agentId"])
            .with_rule("action", &["agentId", "state"])
            .with_rule("event", &["content"])
            .with_rule("state", &["state"])
    }

    /// Add or replace the rule for `facet_type`.
    pub fn with_rule(mut self, facet_type: impl Into<String>, required: &[&str]) -> Self {
        self.rules.insert(
            facet_type.into(),
            required.iter().map(|s| s.to_string()).collect(),
        );
        self
    }

    pub fn missing_aspects(&self, facet: &Facet) -> Vec<String> {
        let Some(required) = self.rules.get(&facet.facet_type) else {
            return Vec::new();
        };
        required
            .iter()
            .filter(|aspect| matches!(facet.aspect(aspect), None | Some(serde_json::Value::Null)))
            .cloned()
            .collect()
    }

    pub fn validate(&self, facet: &Facet) -> VeilResult<()> {
        let missing = self.missing_aspects(facet);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ConnectomeError::InvalidFacet {
                id: facet.id.clone(),
                facet_type: facet.facet_type.clone(),
                missing,
            })
        }
    }
}

impl Default for FacetValidator {
    fn default() -> Self {
        Self::builtin()
    }
}
