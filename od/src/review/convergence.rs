//! Convergence tracking
//!
//! An outcome converges after N consecutive full review cycles with zero
//! issues (default two). Criteria-only cycles never move the counter.

use crate::domain::{Convergence, ReviewCycle};

/// Fold a finished cycle into the convergence state
///
/// Criteria-only cycles return the state unchanged.
pub fn fold_cycle(current: &Convergence, cycle: &ReviewCycle) -> Convergence {
    if cycle.criteria_only {
        return current.clone();
    }
    let consecutive = if cycle.issues_found == 0 {
        current.consecutive_zero_issues + 1
    } else {
        0
    };
    Convergence {
        consecutive_zero_issues: consecutive,
        last_cycle_index: cycle.cycle_index,
    }
}

/// Whether the outcome has converged
pub fn is_converged(convergence: &Convergence, required_cycles: u32) -> bool {
    convergence.consecutive_zero_issues >= required_cycles
}
