//! Facet and element id minting.

use std::sync::atomic::{AtomicU64, Ordering};

use uuid::Uuid;

/// Mints ids of the form `{prefix}-{n}` (seeded) or `{prefix}-{uuid}` (random).
///
/// Owned by the Space and shared by `Arc`; seed it in tests to get stable ids.
#[derive(Debug)]
pub struct IdGenerator {
    next: Option<AtomicU64>,
}

impl IdGenerator {
    pub fn seeded(seed: u64) -> Self {
        Self {
            next: Some(AtomicU64::new(seed)),
        }
    }

    pub fn random() -> Self {
        Self { next: None }
    }

    pub fn is_deterministic(&self) -> bool {
        self.next.is_some()
    }

    pub fn next_id(&self, prefix: &str) -> String {
        match &self.next {
            Some(counter) => {
                let n = counter.fetch_add(1, Ordering::Relaxed);
                format!("{prefix}-{n}")
            }
            None => format!("{prefix}-{}", Uuid::new_v4()),
        }
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::random()
    }
}
