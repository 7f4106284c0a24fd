use serde::{Deserialize, Serialize};

use crate::error::VeilResult;
use crate::state::ValidationMode;

/// Tuning for a [`Space`](super::Space).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpaceConfig {
    /// Productive Phase 2 passes allowed before a frame fails with
    /// `TransformLoopExceeded`.
    #[serde(default = "default_max_transform_passes")]
    pub max_transform_passes: usize,
    /// Per-effector timeout; `None` waits indefinitely.
    #[serde(default = "default_effector_timeout_ms")]
    pub effector_timeout_ms: Option<u64>,
    #[serde(default)]
    pub validation: ValidationMode,
    /// Queue a diagnostic event when an effector or maintainer fails.
    #[serde(default = "default_emit_diagnostic_events")]
    pub emit_diagnostic_events: bool,
    #[serde(default = "default_diagnostic_topic")]
    pub diagnostic_topic: String,
    /// Seed for deterministic ids; random ids when unset.
    #[serde(default)]
    pub id_seed: Option<u64>,
}

fn default_max_transform_passes() -> usize {
    100
}

fn default_effector_timeout_ms() -> Option<u64> {
    Some(30_000)
}

fn default_emit_diagnostic_events() -> bool {
    true
}

fn default_diagnostic_topic() -> String {
    "system:error".into()
}

impl SpaceConfig {
    pub fn new() -> Self {
        Self {
            max_transform_passes: default_max_transform_passes(),
            effector_timeout_ms: default_effector_timeout_ms(),
            validation: ValidationMode::default(),
            emit_diagnostic_events: default_emit_diagnostic_events(),
            diagnostic_topic: default_diagnostic_topic(),
            id_seed: None,
        }
    }

    pub fn from_json(json: &str) -> VeilResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn with_max_transform_passes(mut self, passes: usize) -> Self {
        self.max_transform_passes = passes;
        self
    }

    pub fn with_effector_timeout_ms(mut self, timeout_ms: Option<u64>) -> Self {
        self.effector_timeout_ms = timeout_ms;
        self
    }

    pub fn with_validation(mut self, mode: ValidationMode) -> Self {
        self.validation = mode;
        self
    }

    pub fn with_diagnostic_events(mut self, enabled: bool) -> Self {
        self.emit_diagnostic_events = enabled;
        self
    }

    pub fn with_id_seed(mut self, seed: u64) -> Self {
        self.id_seed = Some(seed);
        self
    }
}

impl Default for SpaceConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = SpaceConfig::default();
        assert_eq!(config.max_transform_passes, 100);
        assert_eq!(config.effector_timeout_ms, Some(30_000));
        assert_eq!(config.validation, ValidationMode::Lenient);
        assert!(config.emit_diagnostic_events);
        assert_eq!(config.diagnostic_topic, "system:error");
        assert!(config.id_seed.is_none());
    }

    #[test]
    fn from_json_fills_missing_fields() {
        let config = SpaceConfig::from_json(r#"{"max_transform_passes": 8, "validation": "strict"}"#)
            .unwrap();
        assert_eq!(config.max_transform_passes, 8);
        assert_eq!(config.validation, ValidationMode::Strict);
        assert_eq!(config.effector_timeout_ms, Some(30_000));
    }

    #[test]
    fn null_timeout_disables_it() {
        let config = SpaceConfig::from_json(r#"{"effector_timeout_ms": null}"#).unwrap();
        assert!(config.effector_timeout_ms.is_none());
    }

    #[test]
    fn bad_json_is_a_serialization_error() {
        let err = SpaceConfig::from_json("{not json").unwrap_err();
        assert!(matches!(err, crate::error::ConnectomeError::Serialization(_)));
    }

    #[test]
    fn builders() {
        let config = SpaceConfig::new()
            .with_max_transform_passes(5)
            .with_effector_timeout_ms(None)
            .with_diagnostic_events(false)
            .with_id_seed(7);
        assert_eq!(config.max_transform_passes, 5);
        assert!(config.effector_timeout_ms.is_none());
        assert!(!config.emit_diagnostic_events);
        assert_eq!(config.id_seed, Some(7));
    }
}
