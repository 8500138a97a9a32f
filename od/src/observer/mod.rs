//! Observer - per-iteration evaluation of worker output
//!
//! The observer scores alignment, spots discoveries, drift, and issues,
//! and raises ambiguities. It is stateless over its inputs and never
//! mutates tasks; the supervisor acts on what it returns.

mod homr;

use async_trait::async_trait;

use crate::domain::Observation;

pub use homr::HomrObserver;

/// Inputs the observer evaluates against
#[derive(Debug, Clone)]
pub struct ObservationContext {
    pub worker_id: String,
    pub outcome_id: String,
    pub task_id: String,
    pub iteration: u32,
    /// Outcome-level approach text
    pub approach: String,
    pub task_intent: String,
    pub task_approach: String,
}

/// Score-alignment capability
///
/// Implementations may be fully deterministic or delegate to an LLM, but
/// the structure of the returned observation is deterministic either way.
#[async_trait]
pub trait Observer: Send + Sync {
    async fn observe(&self, ctx: &ObservationContext, raw_output: &str) -> Observation;
}
