//! Per-outcome workspace layout
//!
//! Every outcome owns a directory with `skills/`, `tools/`, `docs/`, and
//! `outputs/`. External collaborators (the LLM sidecar above all) read
//! and write these paths, so the layout is part of the contract.

use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use tracing::debug;

pub const SKILLS_DIR: &str = "skills";
pub const TOOLS_DIR: &str = "tools";
pub const DOCS_DIR: &str = "docs";
pub const OUTPUTS_DIR: &str = "outputs";

/// Workspace root manager
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory for one outcome
    pub fn outcome_dir(&self, outcome_id: &str) -> PathBuf {
        self.root.join(outcome_id)
    }

    pub fn skills_dir(&self, outcome_id: &str) -> PathBuf {
        self.outcome_dir(outcome_id).join(SKILLS_DIR)
    }

    pub fn tools_dir(&self, outcome_id: &str) -> PathBuf {
        self.outcome_dir(outcome_id).join(TOOLS_DIR)
    }

    pub fn docs_dir(&self, outcome_id: &str) -> PathBuf {
        self.outcome_dir(outcome_id).join(DOCS_DIR)
    }

    pub fn outputs_dir(&self, outcome_id: &str) -> PathBuf {
        self.outcome_dir(outcome_id).join(OUTPUTS_DIR)
    }

    /// Create the directory layout, idempotently
    pub fn ensure_layout(&self, outcome_id: &str) -> Result<PathBuf> {
        let dir = self.outcome_dir(outcome_id);
        for sub in [SKILLS_DIR, TOOLS_DIR, DOCS_DIR, OUTPUTS_DIR] {
            std::fs::create_dir_all(dir.join(sub))
                .context(format!("Failed to create workspace dir {}", sub))?;
        }
        debug!(outcome_id, dir = %dir.display(), "Workspace layout ensured");
        Ok(dir)
    }

    /// Collect the relative paths of files under `outputs/`
    pub fn list_outputs(&self, outcome_id: &str) -> Result<Vec<String>> {
        let dir = self.outputs_dir(outcome_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut outputs = Vec::new();
        for entry in walkdir::WalkDir::new(&dir).into_iter().filter_map(|e| e.ok()) {
            if entry.file_type().is_file() {
                let rel = entry
                    .path()
                    .strip_prefix(&dir)
                    .unwrap_or(entry.path())
                    .to_string_lossy()
                    .to_string();
                outputs.push(rel);
            }
        }
        outputs.sort();
        Ok(outputs)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_ensure_layout_idempotent() {
        let temp = tempdir().unwrap();
        let ws = Workspace::new(temp.path());

        let dir = ws.ensure_layout("outcome-1").unwrap();
        assert!(dir.join("skills").is_dir());
        assert!(dir.join("tools").is_dir());
        assert!(dir.join("docs").is_dir());
        assert!(dir.join("outputs").is_dir());

        // Second call is a no-op
        ws.ensure_layout("outcome-1").unwrap();
    }

    #[test]
    fn test_list_outputs() {
        let temp = tempdir().unwrap();
        let ws = Workspace::new(temp.path());
        ws.ensure_layout("outcome-1").unwrap();

        std::fs::write(ws.outputs_dir("outcome-1").join("report.md"), "done").unwrap();
        std::fs::create_dir_all(ws.outputs_dir("outcome-1").join("sub")).unwrap();
        std::fs::write(ws.outputs_dir("outcome-1").join("sub/data.json"), "{}").unwrap();

        let outputs = ws.list_outputs("outcome-1").unwrap();
        assert_eq!(outputs, vec!["report.md".to_string(), "sub/data.json".to_string()]);
    }

    #[test]
    fn test_list_outputs_missing_dir() {
        let temp = tempdir().unwrap();
        let ws = Workspace::new(temp.path());
        assert!(ws.list_outputs("ghost").unwrap().is_empty());
    }
}
