use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConnectomeError {
    #[error("Frame out of sequence: expected {expected}, got {got}")]
    Sequence { expected: u64, got: u64 },

    #[error("Transform loop exceeded: frame {sequence} still producing deltas after {passes} passes")]
    TransformLoopExceeded { sequence: u64, passes: usize },

    #[error("Receptor error: receptor={name}, {message}")]
    Receptor { name: String, message: String },

    #[error("Transform error: transform={name}, {message}")]
    Transform { name: String, message: String },

    #[error("Effector error: effector={name}, {message}")]
    Effector { name: String, message: String },

    #[error("Effector timed out: effector={name}, after {timeout_ms}ms")]
    EffectorTimeout { name: String, timeout_ms: u64 },

    #[error("Maintainer error: maintainer={name}, {message}")]
    Maintainer { name: String, message: String },

    #[error("Invalid facet: id={id}, type={facet_type}, missing {}", missing.join(", "))]
    InvalidFacet {
        id: String,
        facet_type: String,
        missing: Vec<String>,
    },

    #[error("Unknown delta: {0}")]
    UnknownDelta(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl ConnectomeError {
    /// Errors that halt the Space instead of degrading a single component.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ConnectomeError::Sequence { .. } | ConnectomeError::TransformLoopExceeded { .. }
        )
    }
}

pub type VeilResult<T> = Result<T, ConnectomeError>;
