//! Task dependency validation
//!
//! Dependencies are validated at mutation time: entries must reference
//! tasks of the same outcome, never self, and the full closure must stay
//! acyclic. Traversal runs over integer indices into the task slice.

use std::collections::HashMap;

use crate::domain::Task;

/// Validate the dependency graph of an outcome's full task set
///
/// Returns the cycle path (task ids, first repeated at the end) when a
/// cycle exists.
pub fn validate_dependency_graph(tasks: &[Task]) -> Result<(), Vec<String>> {
    let index_of: HashMap<&str, usize> = tasks.iter().enumerate().map(|(i, t)| (t.id.as_str(), i)).collect();

    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    fn dfs(
        idx: usize,
        tasks: &[Task],
        index_of: &HashMap<&str, usize>,
        colors: &mut [Color],
        path: &mut Vec<usize>,
    ) -> Option<Vec<String>> {
        colors[idx] = Color::Gray;
        path.push(idx);

        for dep_id in &tasks[idx].depends_on {
            let Some(&dep_idx) = index_of.get(dep_id.as_str()) else {
                continue;
            };
            match colors[dep_idx] {
                Color::White => {
                    if let Some(cycle) = dfs(dep_idx, tasks, index_of, colors, path) {
                        return Some(cycle);
                    }
                }
                Color::Gray => {
                    // Cycle closes at dep_idx; report the path from there
                    let start = path.iter().position(|&i| i == dep_idx).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        path[start..].iter().map(|&i| tasks[i].id.clone()).collect();
                    cycle.push(tasks[dep_idx].id.clone());
                    return Some(cycle);
                }
                Color::Black => {}
            }
        }

        path.pop();
        colors[idx] = Color::Black;
        None
    }

    let mut colors = vec![Color::White; tasks.len()];
    for idx in 0..tasks.len() {
        if colors[idx] == Color::White {
            let mut path = Vec::new();
            if let Some(cycle) = dfs(idx, tasks, &index_of, &mut colors, &mut path) {
                return Err(cycle);
            }
        }
    }
    Ok(())
}

/// Validate dependency entries plus the combined graph
///
/// `candidates` are the tasks being created or updated; `existing` the
/// outcome's already persisted tasks. Every entry check runs before
/// anything persists: same outcome, no self-reference, known target,
/// acyclic closure.
pub fn validate_dependencies(candidates: &[Task], existing: &[Task]) -> Result<(), String> {
    let mut combined: Vec<Task> = Vec::with_capacity(candidates.len() + existing.len());
    combined.extend(candidates.iter().cloned());
    combined.extend(
        existing
            .iter()
            .filter(|e| !candidates.iter().any(|c| c.id == e.id))
            .cloned(),
    );

    let known: HashMap<&str, &Task> = combined.iter().map(|t| (t.id.as_str(), t)).collect();

    for task in candidates {
        for dep_id in &task.depends_on {
            if dep_id == &task.id {
                return Err(format!("task {} depends on itself", task.id));
            }
            let Some(dep) = known.get(dep_id.as_str()) else {
                return Err(format!("task {} depends on unknown task {}", task.id, dep_id));
            };
            if dep.outcome_id != task.outcome_id {
                return Err(format!(
                    "task {} depends on {} from another outcome",
                    task.id, dep_id
                ));
            }
        }
    }

    validate_dependency_graph(&combined)
        .map_err(|cycle| format!("cycle detected: {}", cycle.join(" -> ")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, deps: &[&str]) -> Task {
        let mut t = Task::new("outcome-1", id);
        t.id = id.to_string();
        t.depends_on = deps.iter().map(|s| s.to_string()).collect();
        t
    }

    #[test]
    fn test_no_cycle() {
        let tasks = vec![task("t1", &[]), task("t2", &["t1"]), task("t3", &["t1", "t2"])];
        assert!(validate_dependency_graph(&tasks).is_ok());
    }

    #[test]
    fn test_two_task_cycle() {
        let tasks = vec![task("t1", &["t2"]), task("t2", &["t1"])];
        let cycle = validate_dependency_graph(&tasks).unwrap_err();
        assert!(cycle.len() >= 3);
        assert_eq!(cycle.first(), cycle.last());
    }

    #[test]
    fn test_self_reference_rejected() {
        let err = validate_dependencies(&[task("t1", &["t1"])], &[]).unwrap_err();
        assert!(err.contains("depends on itself"));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let err = validate_dependencies(&[task("t1", &["ghost"])], &[]).unwrap_err();
        assert!(err.contains("unknown task"));
    }

    #[test]
    fn test_cross_outcome_rejected() {
        let mut other = task("t2", &[]);
        other.outcome_id = "outcome-2".to_string();
        let err = validate_dependencies(&[task("t1", &["t2"])], &[other]).unwrap_err();
        assert!(err.contains("another outcome"));
    }

    #[test]
    fn test_cycle_through_existing() {
        // New task closes a cycle with a persisted one
        let existing = task("t1", &["t2"]);
        let err = validate_dependencies(&[task("t2", &["t1"])], &[existing]).unwrap_err();
        assert!(err.contains("cycle detected"));
    }

    #[test]
    fn test_batch_create_cycle_rejected() {
        let err = validate_dependencies(&[task("t1", &["t2"]), task("t2", &["t1"])], &[]).unwrap_err();
        assert!(err.contains("cycle detected"));
    }

    #[test]
    fn test_update_replaces_existing_entry() {
        // Updating t2 to drop its dependency must validate the new graph,
        // not the stale persisted one
        let existing = vec![task("t1", &[]), task("t2", &["t1"])];
        let updated = task("t2", &[]);
        assert!(validate_dependencies(&[updated], &existing).is_ok());
    }
}
