//! Space: the frame scheduler.
//!
//! One call to [`Space::process_frame`] runs one frame:
//!
//! 1. drain the event queue (and deltas submitted by attached components);
//! 2. Phase 1, receptors turn events into deltas against the committed state;
//! 3. Phase 2, transforms run to quiescence on an in-frame working copy;
//! 4. commit through the [`VeilStateManager`];
//! 5. Phase 3, matching effectors run concurrently on their own tasks and are
//!    joined in registration order;
//! 6. Phase 4, maintainers run;
//! 7. every event produced in Phases 3 and 4 is queued for the next frame.
//!
//! Component failures are isolated to the call that failed. Only a sequence
//! mismatch or a runaway transform loop fails the frame.

mod config;

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{oneshot, Notify};

use crate::component::Component;
use crate::error::{ConnectomeError, VeilResult};
use crate::ids::IdGenerator;
use crate::queue::EventPriorityQueue;
use crate::retm::{
    select_changes, Effector, FacetFilter, Maintainer, Receptor, RetmComponent, RetmRole,
    Transform,
};
use crate::state::{FacetValidator, VeilState, VeilStateManager};
use crate::types::*;
use crate::veillog::{LogEntry, LogLevel, VeilLogger};

pub use config::SpaceConfig;

const SOURCE: &str = "space";

// ─── Handle ─────────────────────────────────────────────────────────────────

/// Cloneable, `Send` entry point into a running Space.
///
/// Anything submitted through a handle lands in the next frame to drain, never
/// the one in flight.
#[derive(Clone)]
pub struct SpaceHandle {
    queue: Arc<EventPriorityQueue>,
    pending_deltas: Arc<Mutex<Vec<VeilDelta>>>,
    wake: Arc<Notify>,
    ids: Arc<IdGenerator>,
}

impl SpaceHandle {
    pub fn emit(&self, event: SpaceEvent) {
        self.queue.push(event);
        self.wake.notify_one();
    }

    /// Build an event whose id comes from the Space's generator.
    pub fn new_event(&self, topic: impl Into<String>, payload: Value) -> SpaceEvent {
        SpaceEvent::new(topic, payload).with_id(self.ids.next_id("event"))
    }

    /// Queue a delta for the next frame's Phase 1, ahead of receptor output.
    pub fn submit_delta(&self, delta: VeilDelta) {
        self.pending_deltas
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(delta);
        self.wake.notify_one();
    }

    pub fn pending_events(&self) -> usize {
        self.queue.len()
    }
}

// ─── Reports ────────────────────────────────────────────────────────────────

/// A component failure caught during a frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameDiagnostic {
    pub role: String,
    /// `role:name`, matching the log source.
    pub source: String,
    pub message: String,
}

/// Summary of one processed frame.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FrameReport {
    pub sequence: u64,
    pub events_processed: usize,
    /// Deltas that actually applied at commit.
    pub deltas_applied: usize,
    pub changes: Vec<FacetChange>,
    /// Productive Phase 2 passes.
    pub transform_passes: usize,
    /// Events queued for the next frame, diagnostics included.
    pub emitted_events: Vec<SpaceEvent>,
    pub external_actions: Vec<ExternalAction>,
    pub diagnostics: Vec<FrameDiagnostic>,
}

impl FrameReport {
    pub fn emitted_topics(&self) -> Vec<&str> {
        self.emitted_events.iter().map(|e| e.topic.as_str()).collect()
    }

    pub fn is_clean(&self) -> bool {
        self.diagnostics.is_empty()
    }
}

struct RegisteredEffector {
    filters: Vec<FacetFilter>,
    effector: Arc<dyn Effector>,
}

// ─── Space ──────────────────────────────────────────────────────────────────

pub struct Space {
    config: SpaceConfig,
    queue: Arc<EventPriorityQueue>,
    pending_deltas: Arc<Mutex<Vec<VeilDelta>>>,
    wake: Arc<Notify>,
    state: VeilStateManager,
    receptors: Vec<Arc<dyn Receptor>>,
    /// topic → receptor indices, in registration order.
    topic_index: HashMap<String, Vec<usize>>,
    transforms: Vec<Arc<dyn Transform>>,
    effectors: Vec<RegisteredEffector>,
    maintainers: Vec<Arc<dyn Maintainer>>,
    ids: Arc<IdGenerator>,
    logger: Arc<VeilLogger>,
}

impl Space {
    pub fn new(config: SpaceConfig) -> Self {
        let logger = Arc::new(VeilLogger::default());
        let ids = match config.id_seed {
            Some(seed) => IdGenerator::seeded(seed),
            None => IdGenerator::random(),
        };
        let state = VeilStateManager::new()
            .with_logger(logger.clone())
            .with_validation(config.validation);
        Self {
            config,
            queue: Arc::new(EventPriorityQueue::new()),
            pending_deltas: Arc::new(Mutex::new(Vec::new())),
            wake: Arc::new(Notify::new()),
            state,
            receptors: Vec::new(),
            topic_index: HashMap::new(),
            transforms: Vec::new(),
            effectors: Vec::new(),
            maintainers: Vec::new(),
            ids: Arc::new(ids),
            logger,
        }
    }

    /// Route Space and state diagnostics to `logger`.
    pub fn with_logger(mut self, logger: Arc<VeilLogger>) -> Self {
        self.state = std::mem::take(&mut self.state).with_logger(logger.clone());
        self.logger = logger;
        self
    }

    pub fn with_validator(mut self, validator: FacetValidator) -> Self {
        self.state = std::mem::take(&mut self.state).with_validator(validator);
        self
    }

    /// Resume from an existing manager, e.g. one rebuilt with
    /// [`VeilStateManager::restore`]. Its validation mode follows this config.
    pub fn with_state_manager(mut self, manager: VeilStateManager) -> Self {
        self.state = manager
            .with_logger(self.logger.clone())
            .with_validation(self.config.validation);
        self
    }

    // ─── Registration ───────────────────────────────────────────────────────

    pub fn add_receptor(&mut self, receptor: Arc<dyn Receptor>) {
        let index = self.receptors.len();
        let mut topics = receptor.topics();
        topics.sort();
        topics.dedup();
        for topic in topics {
            self.topic_index.entry(topic).or_default().push(index);
        }
        self.receptors.push(receptor);
    }

    pub fn add_transform(&mut self, transform: Arc<dyn Transform>) {
        self.transforms.push(transform);
    }

    pub fn add_effector(&mut self, effector: Arc<dyn Effector>) {
        self.effectors.push(RegisteredEffector {
            filters: effector.facet_filters(),
            effector,
        });
    }

    pub fn add_maintainer(&mut self, maintainer: Arc<dyn Maintainer>) {
        self.maintainers.push(maintainer);
    }

    /// Register a component under its declared role.
    pub fn add(&mut self, component: RetmComponent) {
        match component {
            RetmComponent::Receptor(r) => self.add_receptor(r),
            RetmComponent::Transform(t) => self.add_transform(t),
            RetmComponent::Effector(e) => self.add_effector(e),
            RetmComponent::Maintainer(m) => self.add_maintainer(m),
        }
    }

    /// Attach a component: flush its deferred operations into the next frame
    /// and let it forward directly from now on. Returns how many ops flushed.
    pub fn attach(&self, component: &mut Component) -> usize {
        let flushed = component.attach(self.handle());
        if flushed > 0 {
            self.logger.record(
                LogLevel::Debug,
                SOURCE,
                format!("attached {} with {flushed} deferred ops", component.element().id),
            );
        }
        flushed
    }

    // ─── Accessors ──────────────────────────────────────────────────────────

    pub fn emit(&self, event: SpaceEvent) {
        self.queue.push(event);
        self.wake.notify_one();
    }

    /// Build an event whose id comes from this Space's generator, so a
    /// seeded config yields reproducible event ids.
    pub fn new_event(&self, topic: impl Into<String>, payload: Value) -> SpaceEvent {
        SpaceEvent::new(topic, payload).with_id(self.ids.next_id("event"))
    }

    pub fn handle(&self) -> SpaceHandle {
        SpaceHandle {
            queue: self.queue.clone(),
            pending_deltas: self.pending_deltas.clone(),
            wake: self.wake.clone(),
            ids: self.ids.clone(),
        }
    }

    pub fn config(&self) -> &SpaceConfig {
        &self.config
    }

    pub fn state(&self) -> &VeilState {
        self.state.state()
    }

    /// Read-only access to the manager. Frames commit only inside
    /// [`Space::process_frame`]:
    ///
    /// ```compile_fail
    /// use connectome_core::{Frame, Space};
    ///
    /// let space = Space::default();
    /// space.state_manager().apply_frame(Frame::new(1, vec![], vec![]));
    /// ```
    pub fn state_manager(&self) -> &VeilStateManager {
        &self.state
    }

    pub fn ids(&self) -> Arc<IdGenerator> {
        self.ids.clone()
    }

    pub fn logger(&self) -> Arc<VeilLogger> {
        self.logger.clone()
    }

    pub fn pending_events(&self) -> usize {
        self.queue.len()
    }

    pub fn has_pending_work(&self) -> bool {
        !self.queue.is_empty() || !self.lock_pending().is_empty()
    }

    pub fn register_agent(&mut self, agent: AgentInfo) {
        self.state.register_agent(agent);
    }

    pub fn register_stream(&mut self, stream: StreamInfo) {
        self.state.register_stream(stream);
    }

    pub fn add_scope(&mut self, scope: impl Into<String>) -> bool {
        self.state.add_scope(scope)
    }

    pub fn remove_scope(&mut self, scope: &str) -> bool {
        self.state.remove_scope(scope)
    }

    /// Decode raw delta objects, logging each unrecognized entry as a warning.
    pub fn decode_deltas(&self, values: &[Value]) -> Vec<VeilDelta> {
        let (deltas, rejected) = VeilDelta::decode_batch(values);
        for error in rejected {
            self.logger.record(LogLevel::Warn, SOURCE, error.to_string());
        }
        deltas
    }

    // ─── Frame loop ─────────────────────────────────────────────────────────

    /// Process one frame. `Ok(None)` when there was nothing to do.
    pub async fn process_frame(&mut self) -> VeilResult<Option<FrameReport>> {
        let events = self.queue.drain();
        let submitted = std::mem::take(&mut *self.lock_pending());
        if events.is_empty() && submitted.is_empty() {
            return Ok(None);
        }

        let sequence = self.state.next_sequence();
        let mut diagnostics = Vec::new();

        let mut deltas = submitted;
        deltas.extend(self.run_receptors(sequence, &events, &mut diagnostics));

        let (deltas, transform_passes) =
            self.run_transforms(sequence, deltas, &mut diagnostics)?;

        let events_processed = events.len();
        let changes = self.state.apply_frame(Frame::new(sequence, events, deltas))?;
        let deltas_applied = self
            .state
            .state()
            .frame_history()
            .last()
            .map(|f| f.deltas.len())
            .unwrap_or(0);
        let view = self.state.frame_view();

        let (mut emitted, external_actions) = self
            .run_effectors(sequence, &changes, &view, &mut diagnostics)
            .await;
        emitted.extend(self.run_maintainers(sequence, &view, &mut diagnostics));

        if self.config.emit_diagnostic_events {
            emitted.extend(
                diagnostics
                    .iter()
                    .filter(|d| matches!(d.role.as_str(), "effector" | "maintainer"))
                    .map(|d| self.diagnostic_event(sequence, d)),
            );
        }

        for event in &emitted {
            self.queue.push(event.clone());
        }

        self.logger.record_at(
            LogLevel::Debug,
            SOURCE,
            sequence,
            format!(
                "{events_processed} events, {} changes, {transform_passes} passes, {} emitted",
                changes.len(),
                emitted.len()
            ),
        );

        Ok(Some(FrameReport {
            sequence,
            events_processed,
            deltas_applied,
            changes,
            transform_passes,
            emitted_events: emitted,
            external_actions,
            diagnostics,
        }))
    }

    /// Process frames until the queue stays empty.
    pub async fn run_until_idle(&mut self) -> VeilResult<Vec<FrameReport>> {
        let mut reports = Vec::new();
        while let Some(report) = self.process_frame().await? {
            reports.push(report);
        }
        Ok(reports)
    }

    /// Process frames as work arrives until `shutdown` fires or its sender is
    /// dropped. Returns the number of frames processed.
    pub async fn run_until_shutdown(
        &mut self,
        mut shutdown: oneshot::Receiver<()>,
    ) -> VeilResult<u64> {
        let mut frames = 0;
        'run: loop {
            while self.process_frame().await?.is_some() {
                frames += 1;
                if shutdown.try_recv() != Err(oneshot::error::TryRecvError::Empty) {
                    break 'run;
                }
            }
            let wake = self.wake.clone();
            tokio::select! {
                _ = wake.notified() => {}
                _ = &mut shutdown => break 'run,
            }
        }
        self.logger
            .record(LogLevel::Info, SOURCE, format!("shutdown after {frames} frames"));
        self.logger.flush();
        Ok(frames)
    }

    // ─── Phases ─────────────────────────────────────────────────────────────

    fn run_receptors(
        &self,
        sequence: u64,
        events: &[SpaceEvent],
        diagnostics: &mut Vec<FrameDiagnostic>,
    ) -> Vec<VeilDelta> {
        let state = self.state.state();
        let mut deltas = Vec::new();
        for event in events {
            let Some(indices) = self.topic_index.get(&event.topic) else {
                continue;
            };
            for &index in indices {
                let receptor = &self.receptors[index];
                let outcome = guarded(RetmRole::Receptor, receptor.name(), || {
                    receptor.transform(event, state)
                });
                match outcome {
                    Ok(produced) => deltas.extend(produced),
                    Err(e) => self.record_failure(
                        sequence,
                        RetmRole::Receptor,
                        receptor.name(),
                        &e,
                        diagnostics,
                    ),
                }
            }
        }
        deltas
    }

    /// Run transforms to quiescence on a working copy of the committed state.
    /// Returns the frame's full delta list and the number of productive passes.
    fn run_transforms(
        &self,
        sequence: u64,
        mut deltas: Vec<VeilDelta>,
        diagnostics: &mut Vec<FrameDiagnostic>,
    ) -> VeilResult<(Vec<VeilDelta>, usize)> {
        deltas.retain(|d| self.screen(sequence, d));
        if self.transforms.is_empty() {
            return Ok((deltas, 0));
        }

        let mut working = self.state.state().clone();
        for delta in &deltas {
            working.apply_delta(delta);
        }

        let limit = self.config.max_transform_passes;
        let mut passes = 0;
        loop {
            let mut produced = false;
            for transform in &self.transforms {
                let outcome = guarded(RetmRole::Transform, transform.name(), || {
                    transform.process(&working)
                });
                match outcome {
                    Ok(out) => {
                        for delta in out {
                            if !self.screen(sequence, &delta) {
                                continue;
                            }
                            produced = true;
                            working.apply_delta(&delta);
                            deltas.push(delta);
                        }
                    }
                    Err(e) => self.record_failure(
                        sequence,
                        RetmRole::Transform,
                        transform.name(),
                        &e,
                        diagnostics,
                    ),
                }
            }
            if !produced {
                return Ok((deltas, passes));
            }
            if passes == limit {
                let error = ConnectomeError::TransformLoopExceeded {
                    sequence,
                    passes: limit,
                };
                self.logger
                    .record_at(LogLevel::Fatal, SOURCE, sequence, error.to_string());
                return Err(error);
            }
            passes += 1;
        }
    }

    async fn run_effectors(
        &self,
        sequence: u64,
        changes: &[FacetChange],
        view: &Arc<VeilState>,
        diagnostics: &mut Vec<FrameDiagnostic>,
    ) -> (Vec<SpaceEvent>, Vec<ExternalAction>) {
        let timeout_ms = self.config.effector_timeout_ms;
        let mut tasks = Vec::new();

        for registered in &self.effectors {
            let selected = select_changes(&registered.filters, changes);
            if selected.is_empty() {
                continue;
            }
            let effector = registered.effector.clone();
            let state = view.clone();
            let task = tokio::spawn(async move {
                let call = effector.process(&selected, &state);
                match timeout_ms {
                    Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), call).await {
                        Ok(result) => result,
                        Err(_) => Err(ConnectomeError::EffectorTimeout {
                            name: effector.name().to_string(),
                            timeout_ms: ms,
                        }),
                    },
                    None => call.await,
                }
            });
            tasks.push((registered.effector.clone(), task));
        }

        let mut events = Vec::new();
        let mut actions = Vec::new();
        for (effector, task) in tasks {
            let outcome = match task.await {
                Ok(outcome) => outcome,
                Err(join_error) => Err(ConnectomeError::Effector {
                    name: effector.name().to_string(),
                    message: if join_error.is_panic() {
                        panic_message(join_error.into_panic().as_ref())
                    } else {
                        format!("task failed: {join_error}")
                    },
                }),
            };
            match outcome {
                Ok(result) => {
                    events.extend(result.events);
                    actions.extend(result.external_actions);
                }
                Err(e) => self.record_failure(
                    sequence,
                    RetmRole::Effector,
                    effector.name(),
                    &e,
                    diagnostics,
                ),
            }
        }
        (events, actions)
    }

    fn run_maintainers(
        &self,
        sequence: u64,
        view: &VeilState,
        diagnostics: &mut Vec<FrameDiagnostic>,
    ) -> Vec<SpaceEvent> {
        let mut events = Vec::new();
        for maintainer in &self.maintainers {
            let outcome = guarded(RetmRole::Maintainer, maintainer.name(), || {
                maintainer.maintain(view)
            });
            match outcome {
                Ok(out) => events.extend(out),
                Err(e) => self.record_failure(
                    sequence,
                    RetmRole::Maintainer,
                    maintainer.name(),
                    &e,
                    diagnostics,
                ),
            }
        }
        events
    }

    // ─── Helpers ────────────────────────────────────────────────────────────

    /// Drop an `addFacet` that strict validation would reject at commit, so
    /// transforms never see a facet that will not exist.
    fn screen(&self, sequence: u64, delta: &VeilDelta) -> bool {
        let VeilDelta::AddFacet { facet } = delta else {
            return true;
        };
        if self.state.admits(facet) {
            return true;
        }
        if let Err(e) = self.state.validator().validate(facet) {
            self.logger
                .record_at(LogLevel::Error, SOURCE, sequence, format!("rejected: {e}"));
        }
        false
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Vec<VeilDelta>> {
        self.pending_deltas
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn record_failure(
        &self,
        sequence: u64,
        role: RetmRole,
        name: &str,
        error: &ConnectomeError,
        diagnostics: &mut Vec<FrameDiagnostic>,
    ) {
        let source = format!("{role}:{name}");
        let message = error.to_string();
        self.logger.log(
            &LogEntry::new(LogLevel::Error, source.clone(), message.clone())
                .with_frame(sequence)
                .with_payload(json!({
                    "role": role.label(),
                    "component": name,
                    "fatal": error.is_fatal(),
                })),
        );
        diagnostics.push(FrameDiagnostic {
            role: role.label().to_string(),
            source,
            message,
        });
    }

    fn diagnostic_event(&self, sequence: u64, diagnostic: &FrameDiagnostic) -> SpaceEvent {
        self.new_event(
            self.config.diagnostic_topic.clone(),
            json!({
                "frame": sequence,
                "source": diagnostic.source,
                "message": diagnostic.message,
            }),
        )
        .with_priority(Priority::High)
    }
}

impl Default for Space {
    fn default() -> Self {
        Self::new(SpaceConfig::default())
    }
}

/// Run a synchronous component call, turning a panic into that role's error.
fn guarded<T>(
    role: RetmRole,
    name: &str,
    call: impl FnOnce() -> VeilResult<T>,
) -> VeilResult<T> {
    match panic::catch_unwind(AssertUnwindSafe(call)) {
        Ok(outcome) => outcome,
        Err(payload) => {
            let name = name.to_string();
            let message = panic_message(payload.as_ref());
            Err(match role {
                RetmRole::Receptor => ConnectomeError::Receptor { name, message },
                RetmRole::Transform => ConnectomeError::Transform { name, message },
                RetmRole::Effector => ConnectomeError::Effector { name, message },
                RetmRole::Maintainer => ConnectomeError::Maintainer { name, message },
            })
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown cause".to_string());
    format!("panicked: {detail}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retm::EffectorResult;
    use crate::state::ValidationMode;
    use crate::veillog::MemorySink;
    use async_trait::async_trait;
    use std::time::Duration;

    // ─── Doubles ────────────────────────────────────────────────────────────

    /// Adds one `note` facet per event, id = event id.
    struct NoteReceptor {
        name: &'static str,
        topic: &'static str,
    }

    impl Receptor for NoteReceptor {
        fn name(&self) -> &str {
            self.name
        }

        fn topics(&self) -> Vec<String> {
            vec![self.topic.into()]
        }

        fn transform(&self, event: &SpaceEvent, _state: &VeilState) -> VeilResult<Vec<VeilDelta>> {
            Ok(vec![VeilDelta::add(
                Facet::new(format!("{}-{}", self.name, event.id), "note")
                    .with_content(event.topic.clone()),
            )])
        }
    }

    struct FailingReceptor;

    impl Receptor for FailingReceptor {
        fn name(&self) -> &str {
            "broken"
        }

        fn topics(&self) -> Vec<String> {
            vec!["ping".into()]
        }

        fn transform(&self, _event: &SpaceEvent, _state: &VeilState) -> VeilResult<Vec<VeilDelta>> {
            Err(ConnectomeError::Receptor {
                name: "broken".into(),
                message: "boom".into(),
            })
        }
    }

    /// Adds a fresh facet on every call; never converges.
    struct Runaway;

    impl Transform for Runaway {
        fn name(&self) -> &str {
            "runaway"
        }

        fn process(&self, state: &VeilState) -> VeilResult<Vec<VeilDelta>> {
            let n = state.facet_count();
            Ok(vec![VeilDelta::add(Facet::new(format!("r{n}"), "note"))])
        }
    }

    /// Tags every untagged note, one facet per call.
    struct TagOne;

    impl Transform for TagOne {
        fn name(&self) -> &str {
            "tag-one"
        }

        fn process(&self, state: &VeilState) -> VeilResult<Vec<VeilDelta>> {
            Ok(state
                .facets_by_type("note")
                .into_iter()
                .find(|f| f.state_value("tagged").is_none())
                .map(|f| {
                    VeilDelta::change(f.id.clone(), FacetChanges::new().state("tagged", json!(true)))
                })
                .into_iter()
                .collect())
        }
    }

    struct Recorder {
        name: &'static str,
        filters: Vec<FacetFilter>,
        delay: Option<Duration>,
        fail: bool,
    }

    impl Recorder {
        fn new(name: &'static str) -> Self {
            Self {
                name,
                filters: Vec::new(),
                delay: None,
                fail: false,
            }
        }
    }

    #[async_trait]
    impl Effector for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        fn facet_filters(&self) -> Vec<FacetFilter> {
            self.filters.clone()
        }

        async fn process(
            &self,
            changes: &[FacetChange],
            _state: &VeilState,
        ) -> VeilResult<EffectorResult> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                return Err(ConnectomeError::Effector {
                    name: self.name.into(),
                    message: "failed".into(),
                });
            }
            Ok(EffectorResult::none()
                .with_event(SpaceEvent::new(
                    format!("{}:seen", self.name),
                    json!({ "changes": changes.len() }),
                ))
                .with_action(ExternalAction::new("log", json!(self.name))))
        }
    }

    #[derive(Clone, Copy)]
    enum Fault {
        Error,
        Panic,
    }

    struct FaultyTransform(Fault);

    impl Transform for FaultyTransform {
        fn name(&self) -> &str {
            "faulty"
        }

        fn process(&self, _state: &VeilState) -> VeilResult<Vec<VeilDelta>> {
            match self.0 {
                Fault::Error => Err(ConnectomeError::Transform {
                    name: "faulty".into(),
                    message: "bad state".into(),
                }),
                Fault::Panic => panic!("transform exploded"),
            }
        }
    }

    struct FaultyMaintainer(Fault);

    impl Maintainer for FaultyMaintainer {
        fn name(&self) -> &str {
            "janitor"
        }

        fn maintain(&self, _state: &VeilState) -> VeilResult<Vec<SpaceEvent>> {
            match self.0 {
                Fault::Error => Err(ConnectomeError::Maintainer {
                    name: "janitor".into(),
                    message: "sweep failed".into(),
                }),
                Fault::Panic => panic!("maintainer exploded"),
            }
        }
    }

    /// Panics with a formatted (`String`) payload.
    struct VolatileReceptor;

    impl Receptor for VolatileReceptor {
        fn name(&self) -> &str {
            "volatile"
        }

        fn topics(&self) -> Vec<String> {
            vec!["ping".into()]
        }

        fn transform(&self, event: &SpaceEvent, _state: &VeilState) -> VeilResult<Vec<VeilDelta>> {
            panic!("cannot handle {}", event.topic)
        }
    }

    fn logged_space(config: SpaceConfig) -> (Space, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let logger = Arc::new(VeilLogger::new().with_sink(sink.clone()));
        (Space::new(config).with_logger(logger), sink)
    }

    // ─── Tests ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn empty_queue_yields_no_frame() {
        let mut space = Space::default();
        assert!(space.process_frame().await.unwrap().is_none());
        assert_eq!(space.state().current_sequence(), 0);
    }

    #[tokio::test]
    async fn receptor_output_is_committed() {
        let mut space = Space::default();
        space.add_receptor(Arc::new(NoteReceptor { name: "a", topic: "ping" }));
        space.emit(SpaceEvent::new("ping", json!({})));
        space.emit(SpaceEvent::new("unrouted", json!({})));

        let report = space.process_frame().await.unwrap().unwrap();
        assert_eq!(report.sequence, 1);
        assert_eq!(report.events_processed, 2);
        assert_eq!(report.deltas_applied, 1);
        assert_eq!(space.state().facets_by_type("note").len(), 1);
        assert_eq!(space.state().frame_history()[0].events.len(), 2);
    }

    #[tokio::test]
    async fn phase_one_orders_by_event_then_receptor() {
        let mut space = Space::default();
        space.add(RetmComponent::Receptor(Arc::new(NoteReceptor { name: "first", topic: "ping" })));
        space.add(RetmComponent::Receptor(Arc::new(NoteReceptor { name: "second", topic: "ping" })));
        let e1 = SpaceEvent::new("ping", json!(1));
        let e2 = SpaceEvent::new("ping", json!(2));
        let (id1, id2) = (e1.id.clone(), e2.id.clone());
        space.emit(e1);
        space.emit(e2);

        space.process_frame().await.unwrap();
        let order: Vec<String> = space.state().frame_history()[0]
            .deltas
            .iter()
            .map(|d| d.facet_id().to_string())
            .collect();
        assert_eq!(
            order,
            vec![
                format!("first-{id1}"),
                format!("second-{id1}"),
                format!("first-{id2}"),
                format!("second-{id2}"),
            ]
        );
    }

    #[tokio::test]
    async fn failing_receptor_is_isolated() {
        let (mut space, sink) = logged_space(SpaceConfig::default());
        space.add_receptor(Arc::new(FailingReceptor));
        space.add_receptor(Arc::new(NoteReceptor { name: "ok", topic: "ping" }));
        space.emit(SpaceEvent::new("ping", json!({})));

        let report = space.process_frame().await.unwrap().unwrap();
        assert_eq!(report.diagnostics.len(), 1);
        assert_eq!(report.diagnostics[0].source, "receptor:broken");
        assert_eq!(space.state().facet_count(), 1);
        assert!(sink
            .at_least(LogLevel::Error)
            .iter()
            .any(|e| e.source == "receptor:broken"));
        // Receptor failures are not re-queued as events.
        assert!(report.emitted_events.is_empty());
    }

    #[tokio::test]
    async fn runaway_transform_fails_frame_without_commit() {
        let (mut space, sink) = logged_space(SpaceConfig::default().with_max_transform_passes(5));
        space.add_receptor(Arc::new(NoteReceptor { name: "a", topic: "ping" }));
        space.add_transform(Arc::new(Runaway));
        space.emit(SpaceEvent::new("ping", json!({})));

        let err = space.process_frame().await.unwrap_err();
        assert!(matches!(
            err,
            ConnectomeError::TransformLoopExceeded { sequence: 1, passes: 5 }
        ));
        assert!(err.is_fatal());
        assert_eq!(space.state().current_sequence(), 0);
        assert_eq!(space.state().facet_count(), 0);
        assert_eq!(sink.at_least(LogLevel::Fatal).len(), 1);
    }

    #[tokio::test]
    async fn converging_transform_counts_productive_passes() {
        let mut space = Space::default();
        space.add_receptor(Arc::new(NoteReceptor { name: "a", topic: "ping" }));
        space.add_transform(Arc::new(TagOne));
        for _ in 0..3 {
            space.emit(SpaceEvent::new("ping", json!({})));
        }

        let report = space.process_frame().await.unwrap().unwrap();
        assert_eq!(report.transform_passes, 3);
        assert!(space
            .state()
            .facets()
            .all(|f| f.state_value("tagged") == Some(&json!(true))));
    }

    #[tokio::test]
    async fn pass_cap_equal_to_need_still_converges() {
        let mut space = Space::new(SpaceConfig::default().with_max_transform_passes(2));
        space.add_receptor(Arc::new(NoteReceptor { name: "a", topic: "ping" }));
        space.add_transform(Arc::new(TagOne));
        space.emit(SpaceEvent::new("ping", json!({})));
        space.emit(SpaceEvent::new("ping", json!({})));
        assert_eq!(space.process_frame().await.unwrap().unwrap().transform_passes, 2);
    }

    #[tokio::test]
    async fn effectors_see_only_matching_changes() {
        let mut space = Space::default();
        space.add_receptor(Arc::new(NoteReceptor { name: "a", topic: "ping" }));
        let mut notes = Recorder::new("notes");
        notes.filters = vec![FacetFilter::of_type("note")];
        let mut speech = Recorder::new("speech");
        speech.filters = vec![FacetFilter::of_type("speech")];
        space.add_effector(Arc::new(notes));
        space.add_effector(Arc::new(speech));
        space.emit(SpaceEvent::new("ping", json!({})));

        let report = space.process_frame().await.unwrap().unwrap();
        assert_eq!(report.emitted_topics(), vec!["notes:seen"]);
        assert_eq!(report.external_actions.len(), 1);
        assert_eq!(space.pending_events(), 1);
    }

    #[tokio::test]
    async fn effector_events_merge_in_registration_order() {
        let mut space = Space::default();
        space.add_receptor(Arc::new(NoteReceptor { name: "a", topic: "ping" }));
        let mut slow = Recorder::new("slow");
        slow.delay = Some(Duration::from_millis(30));
        space.add_effector(Arc::new(slow));
        space.add_effector(Arc::new(Recorder::new("fast")));
        space.emit(SpaceEvent::new("ping", json!({})));

        let report = space.process_frame().await.unwrap().unwrap();
        assert_eq!(report.emitted_topics(), vec!["slow:seen", "fast:seen"]);
    }

    #[tokio::test]
    async fn effector_failure_becomes_diagnostic_event() {
        let mut space = Space::default();
        space.add_receptor(Arc::new(NoteReceptor { name: "a", topic: "ping" }));
        let mut bad = Recorder::new("bad");
        bad.fail = true;
        space.add_effector(Arc::new(bad));
        space.add_effector(Arc::new(Recorder::new("good")));
        space.emit(SpaceEvent::new("ping", json!({})));

        let report = space.process_frame().await.unwrap().unwrap();
        assert_eq!(report.emitted_topics(), vec!["good:seen", "system:error"]);
        let diagnostic = report.emitted_events.last().unwrap();
        assert_eq!(diagnostic.payload_field("source"), Some(&json!("effector:bad")));
        assert_eq!(diagnostic.payload_field("frame"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn diagnostic_events_can_be_disabled() {
        let mut space = Space::new(SpaceConfig::default().with_diagnostic_events(false));
        space.add_receptor(Arc::new(NoteReceptor { name: "a", topic: "ping" }));
        let mut bad = Recorder::new("bad");
        bad.fail = true;
        space.add_effector(Arc::new(bad));
        space.emit(SpaceEvent::new("ping", json!({})));

        let report = space.process_frame().await.unwrap().unwrap();
        assert_eq!(report.diagnostics.len(), 1);
        assert!(report.emitted_events.is_empty());
    }

    #[tokio::test]
    async fn slow_effector_times_out() {
        let mut space = Space::new(SpaceConfig::default().with_effector_timeout_ms(Some(20)));
        space.add_receptor(Arc::new(NoteReceptor { name: "a", topic: "ping" }));
        let mut slow = Recorder::new("slow");
        slow.delay = Some(Duration::from_secs(5));
        space.add_effector(Arc::new(slow));
        space.emit(SpaceEvent::new("ping", json!({})));

        let report = space.process_frame().await.unwrap().unwrap();
        assert_eq!(report.diagnostics.len(), 1);
        assert!(report.diagnostics[0].message.contains("timed out"));
        assert!(report.diagnostics[0].message.contains("after 20ms"));
        assert_eq!(space.state().current_sequence(), 1);
    }

    #[tokio::test]
    async fn failing_transform_is_isolated_and_frame_commits() {
        let (mut space, sink) = logged_space(SpaceConfig::default());
        space.add_receptor(Arc::new(NoteReceptor { name: "a", topic: "ping" }));
        space.add_transform(Arc::new(FaultyTransform(Fault::Error)));
        space.add_transform(Arc::new(TagOne));
        space.emit(SpaceEvent::new("ping", json!({})));

        let report = space.process_frame().await.unwrap().unwrap();
        assert_eq!(report.sequence, 1);
        assert_eq!(report.transform_passes, 1);
        assert!(!report.diagnostics.is_empty());
        assert!(report
            .diagnostics
            .iter()
            .all(|d| d.source == "transform:faulty" && d.role == "transform"));
        // The receptor's facet and the healthy transform's tag both commit.
        assert_eq!(space.state().facet_count(), 1);
        assert!(space
            .state()
            .facets()
            .all(|f| f.state_value("tagged") == Some(&json!(true))));
        assert!(report.emitted_events.is_empty());

        let errors = sink.at_least(LogLevel::Error);
        assert_eq!(errors[0].frame, Some(1));
        let payload = errors[0].payload.as_ref().unwrap();
        assert_eq!(payload["role"], "transform");
        assert_eq!(payload["component"], "faulty");
        assert_eq!(payload["fatal"], false);
    }

    #[tokio::test]
    async fn failing_maintainer_becomes_diagnostic_event() {
        let mut space = Space::default();
        space.add_receptor(Arc::new(NoteReceptor { name: "a", topic: "ping" }));
        space.add_maintainer(Arc::new(FaultyMaintainer(Fault::Error)));
        space.emit(SpaceEvent::new("ping", json!({})));

        let report = space.process_frame().await.unwrap().unwrap();
        assert_eq!(space.state().facet_count(), 1);
        assert_eq!(report.diagnostics.len(), 1);
        assert_eq!(report.emitted_topics(), vec!["system:error"]);
        let event = &report.emitted_events[0];
        assert_eq!(event.priority, Priority::High);
        assert_eq!(event.payload_field("source"), Some(&json!("maintainer:janitor")));
        assert!(event.payload_field("message").unwrap().as_str().unwrap().contains("sweep failed"));
        assert_eq!(space.pending_events(), 1);
    }

    #[tokio::test]
    async fn panicking_components_are_isolated() {
        let mut space = Space::default();
        space.add_receptor(Arc::new(VolatileReceptor));
        space.add_receptor(Arc::new(NoteReceptor { name: "ok", topic: "ping" }));
        space.add_transform(Arc::new(FaultyTransform(Fault::Panic)));
        space.add_maintainer(Arc::new(FaultyMaintainer(Fault::Panic)));
        space.emit(SpaceEvent::new("ping", json!({})));

        let report = space.process_frame().await.unwrap().unwrap();
        let sources: Vec<&str> = report.diagnostics.iter().map(|d| d.source.as_str()).collect();
        assert_eq!(
            sources,
            vec!["receptor:volatile", "transform:faulty", "maintainer:janitor"]
        );
        assert!(report.diagnostics[0].message.contains("panicked: cannot handle ping"));
        assert!(report.diagnostics[1].message.contains("panicked: transform exploded"));
        assert_eq!(space.state().facet_count(), 1);
        assert_eq!(report.emitted_topics(), vec!["system:error"]);

        // The Space keeps running afterwards.
        space.emit(SpaceEvent::new("unrouted", json!({})));
        assert!(space.process_frame().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn strict_mode_screens_invalid_adds_before_transforms() {
        let (mut space, sink) =
            logged_space(SpaceConfig::default().with_validation(ValidationMode::Strict));

        struct SpeechWithoutAgent;
        impl Receptor for SpeechWithoutAgent {
            fn name(&self) -> &str {
                "speech"
            }
            fn topics(&self) -> Vec<String> {
                vec!["say".into()]
            }
            fn transform(&self, _e: &SpaceEvent, _s: &VeilState) -> VeilResult<Vec<VeilDelta>> {
                Ok(vec![
                    VeilDelta::add(Facet::new("s1", "speech").with_content("hi")),
                    VeilDelta::add(Facet::new("n1", "note")),
                ])
            }
        }

        space.add_receptor(Arc::new(SpeechWithoutAgent));
        space.emit(SpaceEvent::new("say", json!({})));
        let report = space.process_frame().await.unwrap().unwrap();
        assert_eq!(report.deltas_applied, 1);
        assert!(!space.state().has_facet("s1"));
        assert!(space.state().has_facet("n1"));
        let errors = sink.at_least(LogLevel::Error);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("s1"));
    }

    #[tokio::test]
    async fn handle_emits_land_in_next_frame() {
        let mut space = Space::default();
        space.add_receptor(Arc::new(NoteReceptor { name: "a", topic: "ping" }));
        let handle = space.handle();
        handle.emit(SpaceEvent::new("ping", json!({})));
        handle.submit_delta(VeilDelta::add(Facet::new("direct", "note")));
        assert!(space.has_pending_work());

        let report = space.process_frame().await.unwrap().unwrap();
        assert_eq!(report.deltas_applied, 2);
        // Submitted deltas precede receptor output.
        assert_eq!(space.state().frame_history()[0].deltas[0].facet_id(), "direct");
        assert!(!space.has_pending_work());
    }

    #[tokio::test]
    async fn run_until_idle_follows_effector_chain() {
        let mut space = Space::default();
        space.add_receptor(Arc::new(NoteReceptor { name: "a", topic: "ping" }));
        space.add_receptor(Arc::new(NoteReceptor { name: "b", topic: "echo:seen" }));
        let mut echo = Recorder::new("echo");
        echo.filters = vec![FacetFilter::new().with_aspect("content", "ping")];
        space.add_effector(Arc::new(echo));
        space.emit(SpaceEvent::new("ping", json!({})));

        let reports = space.run_until_idle().await.unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(space.state().facet_count(), 2);
        assert_eq!(space.state().current_sequence(), 2);
    }

    #[tokio::test]
    async fn run_until_shutdown_processes_handle_emits() {
        let mut space = Space::default();
        space.add_receptor(Arc::new(NoteReceptor { name: "a", topic: "ping" }));
        let handle = space.handle();
        let (stop_tx, stop_rx) = oneshot::channel();

        let runner = tokio::spawn(async move {
            let frames = space.run_until_shutdown(stop_rx).await.unwrap();
            (frames, space)
        });

        handle.emit(SpaceEvent::new("ping", json!({})));
        for _ in 0..50 {
            if handle.pending_events() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        stop_tx.send(()).unwrap();

        let (frames, space) = runner.await.unwrap();
        assert_eq!(frames, 1);
        assert_eq!(space.state().facet_count(), 1);
    }

    #[tokio::test]
    async fn decode_deltas_warns_on_unknown_types() {
        let (space, sink) = logged_space(SpaceConfig::default());
        let deltas = space.decode_deltas(&[
            json!({"type": "addFacet", "facet": {"id": "a", "type": "note"}}),
            json!({"type": "teleportFacet", "id": "a"}),
        ]);
        assert_eq!(deltas.len(), 1);
        assert_eq!(sink.at_least(LogLevel::Warn).len(), 1);
    }

    #[tokio::test]
    async fn seeded_ids_are_deterministic() {
        let space = Space::new(SpaceConfig::default().with_id_seed(1));
        assert_eq!(space.ids().next_id("facet"), "facet-1");
        assert_eq!(space.ids().next_id("facet"), "facet-2");
    }

    #[tokio::test]
    async fn seeded_space_mints_component_and_diagnostic_event_ids() {
        let mut space = Space::new(SpaceConfig::default().with_id_seed(1));
        space.add_receptor(Arc::new(NoteReceptor { name: "a", topic: "ping" }));
        let mut bad = Recorder::new("bad");
        bad.fail = true;
        space.add_effector(Arc::new(bad));

        let mut pinger = Component::new("pinger", vec!["space".into(), "pinger".into()]);
        pinger.emit("ping", json!({}));
        space.attach(&mut pinger);

        let report = space.process_frame().await.unwrap().unwrap();
        assert_eq!(space.state().frame_history()[0].events[0].id, "event-1");
        assert_eq!(report.emitted_topics(), vec!["system:error"]);
        assert_eq!(report.emitted_events[0].id, "event-2");

        // Space and handles draw from the same generator.
        assert_eq!(space.new_event("tick", json!(null)).id, "event-3");
        assert_eq!(space.handle().new_event("tick", json!(null)).id, "event-4");
    }

    #[tokio::test]
    async fn shutdown_flushes_the_logger() {
        struct CountingSink(std::sync::atomic::AtomicUsize);
        impl crate::veillog::LogSink for CountingSink {
            fn write(&self, _entry: &crate::veillog::LogEntry) {}
            fn flush(&self) {
                self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        }

        let sink = Arc::new(CountingSink(std::sync::atomic::AtomicUsize::new(0)));
        let logger = Arc::new(VeilLogger::new().with_sink(sink.clone()));
        let mut space = Space::default().with_logger(logger);
        let (stop_tx, stop_rx) = oneshot::channel();
        stop_tx.send(()).unwrap();

        assert_eq!(space.run_until_shutdown(stop_rx).await.unwrap(), 0);
        assert_eq!(sink.0.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
