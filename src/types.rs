use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::ConnectomeError;

fn is_false(b: &bool) -> bool {
    !*b
}

// ─── Facets ─────────────────────────────────────────────────────────────────

/// The atomic unit of VEIL state.
///
/// A facet is an envelope: an id, an open-ended type tag and a set of optional
/// aspects. Any aspect not modelled as a field lands in `attributes`, so new
/// facet kinds never require touching this type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Facet {
    pub id: String,
    #[serde(rename = "type")]
    pub facet_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_type: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub ephemeral: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
    /// Aspects without a dedicated field (e.g. `entityId`).
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl Facet {
    pub fn new(id: impl Into<String>, facet_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            facet_type: facet_type.into(),
            content: None,
            state: None,
            agent_id: None,
            agent_name: None,
            stream_id: None,
            stream_type: None,
            ephemeral: false,
            scopes: Vec::new(),
            attributes: Map::new(),
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    /// Replace the state aspect. Non-object values are stored under `value`.
    pub fn with_state(mut self, state: Value) -> Self {
        self.state = Some(match state {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".into(), other);
                map
            }
        });
        self
    }

    pub fn with_state_entry(mut self, key: impl Into<String>, value: Value) -> Self {
        self.state
            .get_or_insert_with(Map::new)
            .insert(key.into(), value);
        self
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>, agent_name: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self.agent_name = Some(agent_name.into());
        self
    }

    pub fn with_stream(mut self, stream_id: impl Into<String>, stream_type: impl Into<String>) -> Self {
        self.stream_id = Some(stream_id.into());
        self.stream_type = Some(stream_type.into());
        self
    }

    pub fn ephemeral(mut self) -> Self {
        self.ephemeral = true;
        self
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scopes.push(scope.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn has_content(&self) -> bool {
        self.content.is_some()
    }

    pub fn has_state(&self) -> bool {
        self.state.is_some()
    }

    pub fn has_agent_info(&self) -> bool {
        self.agent_id.is_some()
    }

    pub fn has_stream_info(&self) -> bool {
        self.stream_id.is_some()
    }

    /// Read a key from the state aspect.
    pub fn state_value(&self, key: &str) -> Option<&Value> {
        self.state.as_ref().and_then(|s| s.get(key))
    }

    /// Resolve an aspect by its wire name (`agentId`, `streamType`, `entityId`, ...).
    pub fn aspect(&self, name: &str) -> Option<Value> {
        let text = |v: &Option<String>| v.as_ref().map(|s| Value::String(s.clone()));
        match name {
            "id" => Some(Value::String(self.id.clone())),
            "type" => Some(Value::String(self.facet_type.clone())),
            "content" => text(&self.content),
            "state" => self.state.clone().map(Value::Object),
            "agentId" => text(&self.agent_id),
            "agentName" => text(&self.agent_name),
            "streamId" => text(&self.stream_id),
            "streamType" => text(&self.stream_type),
            "ephemeral" => Some(Value::Bool(self.ephemeral)),
            "scopes" => Some(Value::from(self.scopes.clone())),
            other => self.attributes.get(other).cloned(),
        }
    }

    /// Shallow-merge a change set into this facet.
    pub fn apply_changes(&mut self, changes: &FacetChanges) {
        if let Some(content) = &changes.content {
            self.content = Some(content.clone());
        }
        if let Some(state) = &changes.state {
            let target = self.state.get_or_insert_with(Map::new);
            for (k, v) in state {
                target.insert(k.clone(), v.clone());
            }
        }
        for (k, v) in &changes.attributes {
            self.attributes.insert(k.clone(), v.clone());
        }
    }
}

/// Partial update carried by a `changeFacet` delta.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FacetChanges {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attributes: Map<String, Value>,
}

impl FacetChanges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn state(mut self, key: impl Into<String>, value: Value) -> Self {
        self.state
            .get_or_insert_with(Map::new)
            .insert(key.into(), value);
        self
    }

    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_none() && self.state.is_none() && self.attributes.is_empty()
    }
}

/// How a `removeFacet` delta takes a facet out of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemovalMode {
    /// Excluded from the current view, retained in storage.
    Hide,
    /// Purged.
    Delete,
}

// ─── Deltas ─────────────────────────────────────────────────────────────────

/// One instruction against the facet store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum VeilDelta {
    AddFacet {
        facet: Facet,
    },
    ChangeFacet {
        id: String,
        changes: FacetChanges,
    },
    RemoveFacet {
        id: String,
        mode: RemovalMode,
    },
}

const DELTA_KINDS: [&str; 3] = ["addFacet", "changeFacet", "removeFacet"];

impl VeilDelta {
    pub fn add(facet: Facet) -> Self {
        VeilDelta::AddFacet { facet }
    }

    pub fn change(id: impl Into<String>, changes: FacetChanges) -> Self {
        VeilDelta::ChangeFacet {
            id: id.into(),
            changes,
        }
    }

    pub fn remove(id: impl Into<String>, mode: RemovalMode) -> Self {
        VeilDelta::RemoveFacet {
            id: id.into(),
            mode,
        }
    }

    /// Id of the facet this delta targets.
    pub fn facet_id(&self) -> &str {
        match self {
            VeilDelta::AddFacet { facet } => &facet.id,
            VeilDelta::ChangeFacet { id, .. } | VeilDelta::RemoveFacet { id, .. } => id,
        }
    }

    /// Decode deltas produced by an external collaborator.
    ///
    /// Entries with an unrecognized or missing `type` tag, or a malformed body,
    /// are rejected individually; the rest of the batch still decodes.
    pub fn decode_batch(values: &[Value]) -> (Vec<VeilDelta>, Vec<ConnectomeError>) {
        let mut deltas = Vec::with_capacity(values.len());
        let mut rejected = Vec::new();

        for value in values {
            let kind = value.get("type").and_then(|t| t.as_str());
            match kind {
                Some(k) if DELTA_KINDS.contains(&k) => {
                    match serde_json::from_value::<VeilDelta>(value.clone()) {
                        Ok(delta) => deltas.push(delta),
                        Err(e) => rejected.push(ConnectomeError::UnknownDelta(format!(
                            "malformed {k} delta: {e}"
                        ))),
                    }
                }
                Some(k) => rejected.push(ConnectomeError::UnknownDelta(format!(
                    "unrecognized delta type '{k}'"
                ))),
                None => rejected.push(ConnectomeError::UnknownDelta(
                    "delta without a type tag".into(),
                )),
            }
        }

        (deltas, rejected)
    }
}

// ─── Events ─────────────────────────────────────────────────────────────────

/// Queue tier of an event. `Immediate` always drains first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Immediate,
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Tiers in drain order.
    pub const ALL: [Priority; 4] = [
        Priority::Immediate,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    pub fn index(self) -> usize {
        match self {
            Priority::Immediate => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }
}

/// Reference to the element that emitted an event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementRef {
    pub id: String,
    #[serde(default)]
    pub path: Vec<String>,
}

impl ElementRef {
    pub fn new(id: impl Into<String>, path: Vec<String>) -> Self {
        Self {
            id: id.into(),
            path,
        }
    }

    /// The space itself as an event source.
    pub fn space() -> Self {
        Self::new("space", vec!["space".into()])
    }
}

/// The unit flowing through the event queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpaceEvent {
    pub id: String,
    pub topic: String,
    pub source: ElementRef,
    #[serde(default)]
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub priority: Priority,
}

impl SpaceEvent {
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            topic: topic.into(),
            source: ElementRef::space(),
            payload,
            timestamp: Utc::now(),
            priority: Priority::Normal,
        }
    }

    /// Replace the random id, e.g. with one minted by an [`IdGenerator`](crate::ids::IdGenerator).
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_source(mut self, source: ElementRef) -> Self {
        self.source = source;
        self
    }

    pub fn payload_field(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }
}

// ─── Frames ─────────────────────────────────────────────────────────────────

/// Structured diff of one frame, for persistence collaborators.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameTransition {
    #[serde(default)]
    pub added: Vec<String>,
    #[serde(default)]
    pub changed: Vec<String>,
    #[serde(default)]
    pub removed: Vec<String>,
}

impl FrameTransition {
    pub fn from_changes(changes: &[FacetChange]) -> Self {
        let mut transition = Self::default();
        for change in changes {
            let id = change.facet.id.clone();
            match change.kind {
                ChangeKind::Added => transition.added.push(id),
                ChangeKind::Changed => transition.changed.push(id),
                ChangeKind::Removed => transition.removed.push(id),
            }
        }
        transition
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty() && self.removed.is_empty()
    }
}

/// One sequenced, atomic unit of state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub events: Vec<SpaceEvent>,
    #[serde(default)]
    pub deltas: Vec<VeilDelta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition: Option<FrameTransition>,
}

impl Frame {
    pub fn new(sequence: u64, events: Vec<SpaceEvent>, deltas: Vec<VeilDelta>) -> Self {
        Self {
            sequence,
            timestamp: Utc::now(),
            events,
            deltas,
            transition: None,
        }
    }
}

// ─── Change Sets ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Changed,
    Removed,
}

/// Effect of one applied delta, as handed to Phase 3.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FacetChange {
    pub kind: ChangeKind,
    /// Resulting facet, or its last-known value for removals.
    pub facet: Facet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub removal: Option<RemovalMode>,
}

impl FacetChange {
    pub fn added(facet: Facet) -> Self {
        Self {
            kind: ChangeKind::Added,
            facet,
            removal: None,
        }
    }

    pub fn changed(facet: Facet) -> Self {
        Self {
            kind: ChangeKind::Changed,
            facet,
            removal: None,
        }
    }

    pub fn removed(facet: Facet, mode: RemovalMode) -> Self {
        Self {
            kind: ChangeKind::Removed,
            facet,
            removal: Some(mode),
        }
    }
}

// ─── Registry Descriptors ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub metadata: Value,
}

impl AgentInfo {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            metadata: Value::Null,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub id: String,
    pub stream_type: String,
    #[serde(default)]
    pub metadata: Value,
}

impl StreamInfo {
    pub fn new(id: impl Into<String>, stream_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            stream_type: stream_type.into(),
            metadata: Value::Null,
        }
    }
}

/// Side effect requested by an effector, executed by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalAction {
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

impl ExternalAction {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }
}
