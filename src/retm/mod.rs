//! RETM contracts: the four phase roles a collaborator can plug into a Space.
//!
//! | Phase | Trait | Sees | Produces |
//! |-------|-------|------|----------|
//! | 1 | [`Receptor`] | one event + committed state | deltas |
//! | 2 | [`Transform`] | in-frame working state | deltas, until quiescent |
//! | 3 | [`Effector`] | filtered change set + frame view | events, external actions (async) |
//! | 4 | [`Maintainer`] | frame view | events |
//!
//! Roles are declared by implementing a trait and registering through the
//! matching [`RetmComponent`] variant; nothing is inferred from shape.

mod filter;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::VeilResult;
use crate::state::VeilState;
use crate::types::{ExternalAction, FacetChange, SpaceEvent, VeilDelta};

pub use filter::{matches_any, select_changes, FacetFilter};

/// Phase 1: turns events on its topics into deltas.
pub trait Receptor: Send + Sync {
    fn name(&self) -> &str;

    /// Exact topics this receptor handles. Read once, at registration.
    fn topics(&self) -> Vec<String>;

    fn transform(&self, event: &SpaceEvent, state: &VeilState) -> VeilResult<Vec<VeilDelta>>;
}

/// Phase 2: derives deltas from the full state. Called repeatedly within a
/// frame until every transform returns nothing, so it must converge.
pub trait Transform: Send + Sync {
    fn name(&self) -> &str;

    fn process(&self, state: &VeilState) -> VeilResult<Vec<VeilDelta>>;
}

/// Phase 3: reacts to committed changes. The only phase allowed to await I/O.
#[async_trait]
pub trait Effector: Send + Sync {
    fn name(&self) -> &str;

    /// Read once, at registration. Empty means every change.
    fn facet_filters(&self) -> Vec<FacetFilter> {
        Vec::new()
    }

    async fn process(
        &self,
        changes: &[FacetChange],
        state: &VeilState,
    ) -> VeilResult<EffectorResult>;
}

/// Phase 4: periodic consistency checks, once per frame.
pub trait Maintainer: Send + Sync {
    fn name(&self) -> &str;

    fn maintain(&self, state: &VeilState) -> VeilResult<Vec<SpaceEvent>>;
}

/// What an effector hands back to the Space.
#[derive(Debug, Clone, Default)]
pub struct EffectorResult {
    /// Queued for the next frame, in this order.
    pub events: Vec<SpaceEvent>,
    pub external_actions: Vec<ExternalAction>,
}

impl EffectorResult {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_event(mut self, event: SpaceEvent) -> Self {
        self.events.push(event);
        self
    }

    pub fn with_action(mut self, action: ExternalAction) -> Self {
        self.external_actions.push(action);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.external_actions.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetmRole {
    Receptor,
    Transform,
    Effector,
    Maintainer,
}

impl RetmRole {
    pub fn label(&self) -> &'static str {
        match self {
            RetmRole::Receptor => "receptor",
            RetmRole::Transform => "transform",
            RetmRole::Effector => "effector",
            RetmRole::Maintainer => "maintainer",
        }
    }
}

impl std::fmt::Display for RetmRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// A component tagged with its phase role.
#[derive(Clone)]
pub enum RetmComponent {
    Receptor(Arc<dyn Receptor>),
    Transform(Arc<dyn Transform>),
    Effector(Arc<dyn Effector>),
    Maintainer(Arc<dyn Maintainer>),
}

impl RetmComponent {
    pub fn role(&self) -> RetmRole {
        match self {
            RetmComponent::Receptor(_) => RetmRole::Receptor,
            RetmComponent::Transform(_) => RetmRole::Transform,
            RetmComponent::Effector(_) => RetmRole::Effector,
            RetmComponent::Maintainer(_) => RetmRole::Maintainer,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            RetmComponent::Receptor(r) => r.name(),
            RetmComponent::Transform(t) => t.name(),
            RetmComponent::Effector(e) => e.name(),
            RetmComponent::Maintainer(m) => m.name(),
        }
    }

    /// Log source label, e.g. `effector:llm`.
    pub fn source(&self) -> String {
        format!("{}:{}", self.role(), self.name())
    }
}
