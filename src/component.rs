//! Elements that can act before they are attached to a Space.
//!
//! An unattached [`Component`] buffers what it wants to do in an owned queue.
//! [`Space::attach`](crate::space::Space::attach) flushes that queue, in
//! order, into the next frame; afterwards the component forwards directly.

use std::collections::VecDeque;

use serde_json::Value;

use crate::space::SpaceHandle;
use crate::types::*;

/// One buffered operation.
#[derive(Debug, Clone, PartialEq)]
pub enum DeferredOp {
    /// An event still to be minted; it gets its id from the Space it reaches.
    Emit { topic: String, payload: Value },
    /// A fully built event, forwarded as is.
    Event(SpaceEvent),
    Delta(VeilDelta),
}

pub struct Component {
    element: ElementRef,
    deferred: VecDeque<DeferredOp>,
    handle: Option<SpaceHandle>,
}

impl Component {
    pub fn new(id: impl Into<String>, path: Vec<String>) -> Self {
        Self {
            element: ElementRef::new(id, path),
            deferred: VecDeque::new(),
            handle: None,
        }
    }

    pub fn element(&self) -> &ElementRef {
        &self.element
    }

    pub fn is_attached(&self) -> bool {
        self.handle.is_some()
    }

    pub fn deferred(&self) -> impl Iterator<Item = &DeferredOp> + '_ {
        self.deferred.iter()
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    /// Emit an event sourced from this component. Its id is minted by the
    /// Space's generator when the event is forwarded.
    pub fn emit(&mut self, topic: impl Into<String>, payload: Value) {
        self.submit(DeferredOp::Emit {
            topic: topic.into(),
            payload,
        });
    }

    pub fn emit_event(&mut self, event: SpaceEvent) {
        self.submit(DeferredOp::Event(event));
    }

    pub fn add_facet(&mut self, facet: Facet) {
        self.submit(DeferredOp::Delta(VeilDelta::add(facet)));
    }

    pub fn change_facet(&mut self, id: impl Into<String>, changes: FacetChanges) {
        self.submit(DeferredOp::Delta(VeilDelta::change(id, changes)));
    }

    pub fn remove_facet(&mut self, id: impl Into<String>, mode: RemovalMode) {
        self.submit(DeferredOp::Delta(VeilDelta::remove(id, mode)));
    }

    /// Push every buffered op through `handle`, oldest first.
    pub fn flush(&mut self, handle: &SpaceHandle) -> usize {
        let count = self.deferred.len();
        while let Some(op) = self.deferred.pop_front() {
            forward(handle, &self.element, op);
        }
        count
    }

    /// Flush and keep `handle` for direct forwarding. Returns how many ops flushed.
    pub fn attach(&mut self, handle: SpaceHandle) -> usize {
        let flushed = self.flush(&handle);
        self.handle = Some(handle);
        flushed
    }

    /// Stop forwarding; later ops buffer again.
    pub fn detach(&mut self) -> Option<SpaceHandle> {
        self.handle.take()
    }

    fn submit(&mut self, op: DeferredOp) {
        match &self.handle {
            Some(handle) => forward(handle, &self.element, op),
            None => self.deferred.push_back(op),
        }
    }
}

fn forward(handle: &SpaceHandle, element: &ElementRef, op: DeferredOp) {
    match op {
        DeferredOp::Emit { topic, payload } => {
            handle.emit(handle.new_event(topic, payload).with_source(element.clone()))
        }
        DeferredOp::Event(event) => handle.emit(event),
        DeferredOp::Delta(delta) => handle.submit_delta(delta),
    }
}
