//! VEIL state: the versioned facet store and its sole mutator.
//!
//! [`VeilState`] is the read-only view every RETM component receives. Only
//! [`VeilStateManager`] (and the Space's in-frame working copy) can change it,
//! through [`VeilDelta`]s.

mod manager;
mod validation;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::types::*;

pub use manager::VeilStateManager;
pub use validation::{FacetValidator, ValidationMode};

/// Result of applying one delta to the store.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum DeltaOutcome {
    Applied(FacetChange),
    Ignored(String),
}

/// The aggregate VEIL document.
///
/// Hidden facets stay in storage but are skipped by [`facets`](Self::facets),
/// [`facet`](Self::facet) and friends; deleted facets are gone. All getters hand
/// out shared references, so a component holding `&VeilState` cannot mutate it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VeilState {
    facets: BTreeMap<String, Facet>,
    removals: BTreeMap<String, RemovalMode>,
    scopes: BTreeSet<String>,
    streams: BTreeMap<String, StreamInfo>,
    agents: BTreeMap<String, AgentInfo>,
    frame_history: Vec<Arc<Frame>>,
    current_sequence: u64,
}

impl VeilState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Visible facets in id order.
    pub fn facets(&self) -> impl Iterator<Item = &Facet> + '_ {
        self.facets
            .values()
            .filter(move |f| !self.removals.contains_key(&f.id))
    }

    pub fn facet(&self, id: &str) -> Option<&Facet> {
        if self.removals.contains_key(id) {
            return None;
        }
        self.facets.get(id)
    }

    pub fn has_facet(&self, id: &str) -> bool {
        self.facet(id).is_some()
    }

    pub fn facets_by_type(&self, facet_type: &str) -> Vec<&Facet> {
        self.facets()
            .filter(|f| f.facet_type == facet_type)
            .collect()
    }

    pub fn facet_count(&self) -> usize {
        self.facets().count()
    }

    /// A facet removed with [`RemovalMode::Hide`], still retained in storage.
    pub fn hidden_facet(&self, id: &str) -> Option<&Facet> {
        match self.removals.get(id) {
            Some(RemovalMode::Hide) => self.facets.get(id),
            _ => None,
        }
    }

    /// Every stored facet, hidden ones included.
    pub fn stored_facets(&self) -> &BTreeMap<String, Facet> {
        &self.facets
    }

    pub fn removal(&self, id: &str) -> Option<RemovalMode> {
        self.removals.get(id).copied()
    }

    pub fn removals(&self) -> &BTreeMap<String, RemovalMode> {
        &self.removals
    }

    pub fn scopes(&self) -> &BTreeSet<String> {
        &self.scopes
    }

    pub fn streams(&self) -> &BTreeMap<String, StreamInfo> {
        &self.streams
    }

    pub fn agents(&self) -> &BTreeMap<String, AgentInfo> {
        &self.agents
    }

    pub fn frame_history(&self) -> &[Arc<Frame>] {
        &self.frame_history
    }

    pub fn current_sequence(&self) -> u64 {
        self.current_sequence
    }

    // ─── Mutation (crate-internal) ──────────────────────────────────────────

    pub(crate) fn from_parts(
        facets: BTreeMap<String, Facet>,
        removals: BTreeMap<String, RemovalMode>,
        scopes: BTreeSet<String>,
        streams: BTreeMap<String, StreamInfo>,
        agents: BTreeMap<String, AgentInfo>,
        current_sequence: u64,
    ) -> Self {
        Self {
            facets,
            removals,
            scopes,
            streams,
            agents,
            frame_history: Vec::new(),
            current_sequence,
        }
    }

    pub(crate) fn apply_delta(&mut self, delta: &VeilDelta) -> DeltaOutcome {
        match delta {
            VeilDelta::AddFacet { facet } => self.add_facet(facet),
            VeilDelta::ChangeFacet { id, changes } => self.change_facet(id, changes),
            VeilDelta::RemoveFacet { id, mode } => self.remove_facet(id, *mode),
        }
    }

    fn add_facet(&mut self, facet: &Facet) -> DeltaOutcome {
        let unhidden = match self.removals.get(&facet.id) {
            Some(RemovalMode::Delete) => {
                return DeltaOutcome::Ignored(format!(
                    "addFacet for deleted facet '{}' ignored",
                    facet.id
                ))
            }
            Some(RemovalMode::Hide) => {
                self.removals.remove(&facet.id);
                true
            }
            None => false,
        };

        for scope in &facet.scopes {
            self.scopes.insert(scope.clone());
        }

        let existed = self
            .facets
            .insert(facet.id.clone(), facet.clone())
            .is_some();
        if existed && !unhidden {
            DeltaOutcome::Applied(FacetChange::changed(facet.clone()))
        } else {
            DeltaOutcome::Applied(FacetChange::added(facet.clone()))
        }
    }

    fn change_facet(&mut self, id: &str, changes: &FacetChanges) -> DeltaOutcome {
        if let Some(mode) = self.removals.get(id) {
            return DeltaOutcome::Ignored(format!(
                "changeFacet for {} facet '{id}' ignored",
                match mode {
                    RemovalMode::Hide => "hidden",
                    RemovalMode::Delete => "deleted",
                }
            ));
        }
        match self.facets.get_mut(id) {
            Some(facet) => {
                facet.apply_changes(changes);
                DeltaOutcome::Applied(FacetChange::changed(facet.clone()))
            }
            None => DeltaOutcome::Ignored(format!("changeFacet for unknown facet '{id}' ignored")),
        }
    }

    fn remove_facet(&mut self, id: &str, mode: RemovalMode) -> DeltaOutcome {
        match (self.removals.get(id).copied(), mode) {
            (Some(RemovalMode::Delete), _) => {
                DeltaOutcome::Ignored(format!("removeFacet for deleted facet '{id}' ignored"))
            }
            (Some(RemovalMode::Hide), RemovalMode::Hide) => {
                DeltaOutcome::Ignored(format!("facet '{id}' is already hidden"))
            }
            (_, RemovalMode::Hide) => match self.facets.get(id) {
                Some(facet) => {
                    let last = facet.clone();
                    self.removals.insert(id.to_string(), RemovalMode::Hide);
                    DeltaOutcome::Applied(FacetChange::removed(last, RemovalMode::Hide))
                }
                None => DeltaOutcome::Ignored(format!(
                    "removeFacet for unknown facet '{id}' ignored"
                )),
            },
            (_, RemovalMode::Delete) => match self.facets.remove(id) {
                Some(last) => {
                    self.removals.insert(id.to_string(), RemovalMode::Delete);
                    DeltaOutcome::Applied(FacetChange::removed(last, RemovalMode::Delete))
                }
                None => DeltaOutcome::Ignored(format!(
                    "removeFacet for unknown facet '{id}' ignored"
                )),
            },
        }
    }

    /// Take every ephemeral facet out of the live map.
    pub(crate) fn strip_ephemeral(&mut self) -> Vec<Facet> {
        let ids: Vec<String> = self
            .facets
            .values()
            .filter(|f| f.ephemeral)
            .map(|f| f.id.clone())
            .collect();
        ids.iter().filter_map(|id| self.facets.remove(id)).collect()
    }

    /// Put ephemeral facets back for the same-frame view.
    pub(crate) fn overlay(&mut self, facets: &[Facet]) {
        for facet in facets {
            self.facets.insert(facet.id.clone(), facet.clone());
        }
    }

    pub(crate) fn record_frame(&mut self, frame: Arc<Frame>) {
        self.current_sequence = frame.sequence;
        self.frame_history.push(frame);
    }

    pub(crate) fn prune_history(&mut self, before_sequence: u64) -> usize {
        let before = self.frame_history.len();
        self.frame_history.retain(|f| f.sequence >= before_sequence);
        before - self.frame_history.len()
    }

    pub(crate) fn insert_agent(&mut self, agent: AgentInfo) {
        self.agents.insert(agent.id.clone(), agent);
    }

    pub(crate) fn insert_stream(&mut self, stream: StreamInfo) {
        self.streams.insert(stream.id.clone(), stream);
    }

    pub(crate) fn insert_scope(&mut self, scope: String) -> bool {
        self.scopes.insert(scope)
    }

    pub(crate) fn drop_scope(&mut self, scope: &str) -> bool {
        self.scopes.remove(scope)
    }
}
