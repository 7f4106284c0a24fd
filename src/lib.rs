//! # connectome-core
//!
//! Deterministic frame engine for agent environments. External stimuli enter a
//! priority queue as events; each frame drains the queue and runs four phases
//! (Receptors, Transforms, Effectors, Maintainers) over a single versioned,
//! append-only VEIL state.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use connectome_core::error::VeilResult;
//! use connectome_core::retm::Receptor;
//! use connectome_core::space::{Space, SpaceConfig};
//! use connectome_core::state::VeilState;
//! use connectome_core::types::{Facet, SpaceEvent, VeilDelta};
//! use serde_json::json;
//!
//! struct Notes;
//!
//! impl Receptor for Notes {
//!     fn name(&self) -> &str {
//!         "notes"
//!     }
//!
//!     fn topics(&self) -> Vec<String> {
//!         vec!["note:add".into()]
//!     }
//!
//!     fn transform(&self, event: &SpaceEvent, _state: &VeilState) -> VeilResult<Vec<VeilDelta>> {
//!         let text = event
//!             .payload_field("text")
//!             .and_then(|v| v.as_str())
//!             .unwrap_or_default();
//!         Ok(vec![VeilDelta::add(
//!             Facet::new(event.id.clone(), "note").with_content(text),
//!         )])
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> VeilResult<()> {
//!     let mut space = Space::new(SpaceConfig::default());
//!     space.add_receptor(Arc::new(Notes));
//!     space.emit(SpaceEvent::new("note:add", json!({"text": "hello"})));
//!
//!     space.run_until_idle().await?;
//!     assert_eq!(space.state().facets_by_type("note").len(), 1);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`types`] | Facets, deltas, events, frames, change sets |
//! | [`queue`] | `EventPriorityQueue`: four FIFO lanes, atomic drain |
//! | [`state`] | `VeilState` read-only view and `VeilStateManager`, the only mutator |
//! | [`retm`] | Receptor / Transform / Effector / Maintainer contracts and facet filters |
//! | [`space`] | Frame scheduler, `SpaceHandle`, `FrameReport`, `SpaceConfig` |
//! | [`component`] | Elements that buffer operations until attached |
//! | [`snapshot`] | Serializable state snapshots, restore and replay |
//! | [`ids`] | Seeded or random id minting |
//! | [`veillog`] | Structured diagnostics with pluggable sinks |
//! | [`error`] | `ConnectomeError` and `VeilResult` |
//!
//! ## Frame guarantees
//!
//! - Frame sequences are contiguous from 1; a gap is fatal.
//! - A frame commits completely or not at all.
//! - Phase 2 is bounded by `SpaceConfig::max_transform_passes`.
//! - Events produced during a frame are processed in the next one.

pub mod component;
pub mod error;
pub mod ids;
pub mod queue;
pub mod retm;
pub mod snapshot;
pub mod space;
pub mod state;
pub mod types;
pub mod veillog;

pub use error::{ConnectomeError, VeilResult};
pub use space::{Space, SpaceConfig, SpaceHandle};
pub use state::{VeilState, VeilStateManager};
pub use types::*;
