//! Serializable VEIL snapshots.
//!
//! A [`VeilSnapshot`] captures everything needed to resume a Space except the
//! frame history: stored facets (hidden ones included), removal records, scopes,
//! streams, agents and the sequence number. Encoding and storage belong to the
//! host; any serde format works.
//!
//! # Example
//!
//! ```rust
//! use connectome_core::state::VeilStateManager;
//! use connectome_core::types::{Facet, Frame, VeilDelta};
//!
//! let mut manager = VeilStateManager::new();
//! manager
//!     .apply_frame(Frame::new(1, vec![], vec![VeilDelta::add(Facet::new("n1", "note"))]))
//!     .unwrap();
//!
//! let json = serde_json::to_string(&manager.snapshot()).unwrap();
//! let restored = VeilStateManager::restore(serde_json::from_str(&json).unwrap());
//! assert!(restored.state().has_facet("n1"));
//! assert_eq!(restored.next_sequence(), 2);
//! ```

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::state::VeilState;
use crate::types::{AgentInfo, Facet, RemovalMode, StreamInfo};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VeilSnapshot {
    /// Sequence of the last frame folded into this snapshot.
    pub sequence: u64,
    #[serde(default)]
    pub facets: BTreeMap<String, Facet>,
    #[serde(default)]
    pub removals: BTreeMap<String, RemovalMode>,
    #[serde(default)]
    pub scopes: BTreeSet<String>,
    #[serde(default)]
    pub streams: BTreeMap<String, StreamInfo>,
    #[serde(default)]
    pub agents: BTreeMap<String, AgentInfo>,
}

impl VeilSnapshot {
    pub fn from_state(state: &VeilState) -> Self {
        Self {
            sequence: state.current_sequence(),
            facets: state.stored_facets().clone(),
            removals: state.removals().clone(),
            scopes: state.scopes().clone(),
            streams: state.streams().clone(),
            agents: state.agents().clone(),
        }
    }

    pub fn into_state(self) -> VeilState {
        // A deleted id must never come back through a hand-edited snapshot.
        let mut facets = self.facets;
        for (id, mode) in &self.removals {
            if *mode == RemovalMode::Delete {
                facets.remove(id);
            }
        }
        VeilState::from_parts(
            facets,
            self.removals,
            self.scopes,
            self.streams,
            self.agents,
            self.sequence,
        )
    }

    pub fn facet_count(&self) -> usize {
        self.facets
            .keys()
            .filter(|id| !self.removals.contains_key(*id))
            .count()
    }
}
