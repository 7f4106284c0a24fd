use std::sync::Arc;

use crate::error::{ConnectomeError, VeilResult};
use crate::snapshot::VeilSnapshot;
use crate::types::*;
use crate::veillog::{LogLevel, VeilLogger};

use super::validation::{FacetValidator, ValidationMode};
use super::{DeltaOutcome, VeilState};

const SOURCE: &str = "state";

/// Sole owner and mutator of [`VeilState`].
///
/// The live state sits behind an `Arc` so snapshots handed to effectors are
/// cheap; a commit copies on write only while such a snapshot is still held.
pub struct VeilStateManager {
    state: Arc<VeilState>,
    frame_ephemerals: Vec<Facet>,
    validator: FacetValidator,
    validation: ValidationMode,
    logger: Arc<VeilLogger>,
}

impl VeilStateManager {
    pub fn new() -> Self {
        Self {
            state: Arc::new(VeilState::new()),
            frame_ephemerals: Vec::new(),
            validator: FacetValidator::builtin(),
            validation: ValidationMode::Lenient,
            logger: Arc::new(VeilLogger::default()),
        }
    }

    pub fn with_logger(mut self, logger: Arc<VeilLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_validation(mut self, mode: ValidationMode) -> Self {
        self.validation = mode;
        self
    }

    pub fn with_validator(mut self, validator: FacetValidator) -> Self {
        self.validator = validator;
        self
    }

    /// Committed state. Ephemeral facets of the last frame are not in it.
    pub fn state(&self) -> &VeilState {
        &self.state
    }

    /// Shared handle on the committed state.
    pub fn shared_state(&self) -> Arc<VeilState> {
        self.state.clone()
    }

    /// Committed state plus the ephemeral facets of the frame just committed.
    ///
    /// This is what Phase 3 and Phase 4 of that frame observe.
    pub fn frame_view(&self) -> Arc<VeilState> {
        if self.frame_ephemerals.is_empty() {
            return self.state.clone();
        }
        let mut view = (*self.state).clone();
        view.overlay(&self.frame_ephemerals);
        Arc::new(view)
    }

    pub fn current_sequence(&self) -> u64 {
        self.state.current_sequence()
    }

    pub fn next_sequence(&self) -> u64 {
        self.state.current_sequence() + 1
    }

    pub fn validator(&self) -> &FacetValidator {
        &self.validator
    }

    pub fn validation_mode(&self) -> ValidationMode {
        self.validation
    }

    /// Whether an `addFacet` for `facet` survives validation. Silent.
    pub fn admits(&self, facet: &Facet) -> bool {
        self.validation == ValidationMode::Lenient || self.validator.validate(facet).is_ok()
    }

    /// Apply one frame atomically and return its change set.
    ///
    /// Fails only when `frame.sequence` is not the next sequence; nothing is
    /// applied in that case. Deltas against unknown, hidden or deleted ids are
    /// skipped with a warning, and history records only the deltas that applied.
    pub fn apply_frame(&mut self, mut frame: Frame) -> VeilResult<Vec<FacetChange>> {
        let expected = self.next_sequence();
        if frame.sequence != expected {
            self.logger.record_at(
                LogLevel::Fatal,
                SOURCE,
                frame.sequence,
                format!("frame {} rejected, expected {expected}", frame.sequence),
            );
            return Err(ConnectomeError::Sequence {
                expected,
                got: frame.sequence,
            });
        }

        let sequence = frame.sequence;
        let deltas = std::mem::take(&mut frame.deltas);
        let mut applied = Vec::with_capacity(deltas.len());
        let mut changes = Vec::with_capacity(deltas.len());
        let state = Arc::make_mut(&mut self.state);

        for delta in deltas {
            if let VeilDelta::AddFacet { facet } = &delta {
                if let Err(e) = self.validator.validate(facet) {
                    match self.validation {
                        ValidationMode::Strict => {
                            self.logger.record_at(
                                LogLevel::Error,
                                SOURCE,
                                sequence,
                                format!("rejected: {e}"),
                            );
                            continue;
                        }
                        ValidationMode::Lenient => {
                            self.logger
                                .record_at(LogLevel::Warn, SOURCE, sequence, e.to_string());
                        }
                    }
                }
            }

            match state.apply_delta(&delta) {
                DeltaOutcome::Applied(change) => {
                    changes.push(change);
                    applied.push(delta);
                }
                DeltaOutcome::Ignored(reason) => {
                    self.logger.record_at(LogLevel::Warn, SOURCE, sequence, reason);
                }
            }
        }

        self.frame_ephemerals = state.strip_ephemeral();
        frame.deltas = applied;
        frame.transition = Some(FrameTransition::from_changes(&changes));
        state.record_frame(Arc::new(frame));

        self.logger.record_at(
            LogLevel::Debug,
            SOURCE,
            sequence,
            format!("frame {sequence} committed with {} changes", changes.len()),
        );

        Ok(changes)
    }

    pub fn register_agent(&mut self, agent: AgentInfo) {
        Arc::make_mut(&mut self.state).insert_agent(agent);
    }

    pub fn register_stream(&mut self, stream: StreamInfo) {
        Arc::make_mut(&mut self.state).insert_stream(stream);
    }

    pub fn add_scope(&mut self, scope: impl Into<String>) -> bool {
        Arc::make_mut(&mut self.state).insert_scope(scope.into())
    }

    pub fn remove_scope(&mut self, scope: &str) -> bool {
        Arc::make_mut(&mut self.state).drop_scope(scope)
    }

    /// Drop frames older than `before_sequence` from history. Returns how many went.
    pub fn prune_history(&mut self, before_sequence: u64) -> usize {
        Arc::make_mut(&mut self.state).prune_history(before_sequence)
    }

    pub fn snapshot(&self) -> VeilSnapshot {
        VeilSnapshot::from_state(&self.state)
    }

    /// Rebuild a manager from a snapshot. History starts empty; the next frame
    /// must carry `snapshot.sequence + 1`.
    pub fn restore(snapshot: VeilSnapshot) -> Self {
        let mut manager = Self::new();
        manager.state = Arc::new(snapshot.into_state());
        manager
    }

    /// Rebuild state by re-applying `frames` in order from empty.
    pub fn replay(frames: &[Frame]) -> VeilResult<Self> {
        let mut manager = Self::new().with_logger(Arc::new(VeilLogger::new()));
        manager.replay_onto(frames)?;
        Ok(manager)
    }

    /// Re-apply `frames` on top of the current state.
    pub fn replay_onto(&mut self, frames: &[Frame]) -> VeilResult<()> {
        for frame in frames {
            self.apply_frame(frame.clone())?;
        }
        Ok(())
    }
}

impl Default for VeilStateManager {
    fn default() -> Self {
        Self::new()
    }
}
