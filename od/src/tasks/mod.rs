//! Task engine - priority, dependencies, atomic claim
//!
//! Pure selection/validation logic lives here; the state actor executes
//! it transactionally. See `state::manager` for the mutation side.

pub mod deps;
pub mod engine;

pub use deps::{validate_dependencies, validate_dependency_graph};
pub use engine::{TaskStats, select_claimable, task_stats};
