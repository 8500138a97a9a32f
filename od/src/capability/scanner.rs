//! Workspace capability scanner
//!
//! Discovers skills (markdown with YAML frontmatter under `skills/`) and
//! tools (executable files under `tools/`) and syncs them into the store
//! so the claim gate sees what actually exists on disk.

use std::path::Path;

use eyre::{Context, Result};
use tracing::{debug, warn};

use crate::domain::{Capability, CapabilityType, SkillFrontmatter};
use crate::state::StateManager;
use crate::workspace::Workspace;

/// Parse the YAML frontmatter block of a skill file
///
/// Expects the file to open with a `---` fence. Files without frontmatter
/// are not skills and return None.
pub fn parse_skill_frontmatter(content: &str) -> Option<SkillFrontmatter> {
    let rest = content.strip_prefix("---")?;
    let end = rest.find("\n---")?;
    let yaml = &rest[..end];
    match serde_yaml::from_str::<SkillFrontmatter>(yaml) {
        Ok(fm) if !fm.name.trim().is_empty() => Some(fm),
        Ok(_) => None,
        Err(e) => {
            warn!(error = %e, "Malformed skill frontmatter");
            None
        }
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    true
}

/// Scans outcome workspaces for capability artifacts
#[derive(Clone)]
pub struct CapabilityScanner {
    state: StateManager,
    workspace: Workspace,
}

impl CapabilityScanner {
    pub fn new(state: StateManager, workspace: Workspace) -> Self {
        Self { state, workspace }
    }

    /// Scan one outcome's workspace and upsert what is found
    ///
    /// Returns the number of capabilities seen on disk.
    pub async fn sync(&self, outcome_id: &str) -> Result<usize> {
        let mut found = 0usize;

        let skills_dir = self.workspace.skills_dir(outcome_id);
        if skills_dir.exists() {
            for entry in std::fs::read_dir(&skills_dir).context("Failed to read skills dir")? {
                let path = entry?.path();
                if path.extension().map(|e| e == "md").unwrap_or(false) {
                    let content = std::fs::read_to_string(&path)?;
                    let Some(fm) = parse_skill_frontmatter(&content) else {
                        debug!(path = %path.display(), "Skipping markdown without frontmatter");
                        continue;
                    };
                    let mut capability =
                        Capability::new(outcome_id, CapabilityType::Skill, &fm.name);
                    capability.description = fm.description;
                    capability.triggers = fm.triggers;
                    capability.requires = fm.requires;
                    capability.path = Some(path.to_string_lossy().to_string());
                    self.state
                        .put_capability(capability)
                        .await
                        .map_err(|e| eyre::eyre!("Failed to store skill: {}", e))?;
                    found += 1;
                }
            }
        }

        let tools_dir = self.workspace.tools_dir(outcome_id);
        if tools_dir.exists() {
            for entry in std::fs::read_dir(&tools_dir).context("Failed to read tools dir")? {
                let path = entry?.path();
                if path.is_file() && is_executable(&path) {
                    let name = path
                        .file_stem()
                        .map(|s| s.to_string_lossy().to_string())
                        .unwrap_or_default();
                    if name.is_empty() {
                        continue;
                    }
                    let mut capability = Capability::new(outcome_id, CapabilityType::Tool, &name);
                    capability.path = Some(path.to_string_lossy().to_string());
                    self.state
                        .put_capability(capability)
                        .await
                        .map_err(|e| eyre::eyre!("Failed to store tool: {}", e))?;
                    found += 1;
                }
            }
        }

        debug!(outcome_id, found, "Workspace capability scan complete");
        Ok(found)
    }
}
