//! Domain ID generation and resolution
//!
//! All IDs use the format: `{6-char-hex}-{type}-{slug}`
//! Example: `0194af-outcome-build-todo-app`
//!
//! The type segment is one of: outcome, task, worker, escalation,
//! observation, progress, cycle, merge, job.

use std::collections::HashMap;

/// Generate a domain ID from type and title
pub fn generate_id(domain_type: &str, title: &str) -> String {
    let uuid = uuid::Uuid::now_v7();
    let hex_prefix = &uuid.to_string()[..6];
    let slug = slugify(title);
    if slug.is_empty() {
        format!("{}-{}", hex_prefix, domain_type)
    } else {
        format!("{}-{}-{}", hex_prefix, domain_type, slug)
    }
}

/// Slugify a title for use in IDs
pub fn slugify(title: &str) -> String {
    title
        .to_lowercase()
        .chars()
        .filter_map(|c| {
            if c.is_alphanumeric() {
                Some(c)
            } else if c == '\'' || c == '\u{2019}' || c == '\u{2018}' {
                None
            } else {
                Some('-')
            }
        })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .take(6)
        .collect::<Vec<_>>()
        .join("-")
}

/// Extract the type segment of an ID, if well-formed
pub fn id_type(id: &str) -> Option<&str> {
    id.splitn(3, '-').nth(1)
}

/// ID resolution for partial references typed at the CLI
pub struct IdResolver<'a> {
    ids: &'a HashMap<String, String>, // id -> display name
}

impl<'a> IdResolver<'a> {
    pub fn new(ids: &'a HashMap<String, String>) -> Self {
        Self { ids }
    }

    /// Resolve a partial reference to a full ID
    ///
    /// Returns:
    /// - Ok(Some(id)) if exactly one match
    /// - Ok(None) if no matches
    /// - Err with candidates if ambiguous
    pub fn resolve(&self, reference: &str) -> Result<Option<String>, Vec<String>> {
        let matches: Vec<String> = self
            .ids
            .keys()
            .filter(|id| Self::matches(id, reference))
            .cloned()
            .collect();

        match matches.len() {
            0 => Ok(None),
            1 => Ok(Some(matches.into_iter().next().unwrap())),
            _ => Err(matches),
        }
    }

    fn matches(id: &str, reference: &str) -> bool {
        if id == reference || id.starts_with(reference) {
            return true;
        }
        // Match against the slug portion
        if let Some(slug_start) = id.find('-') {
            let slug_part = &id[slug_start + 1..];
            if slug_part.contains(reference) {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_id() {
        let id = generate_id("outcome", "Build TODO App");
        assert!(id.len() > 10);
        assert!(id.contains("-outcome-"));
        assert!(id.contains("build-todo-app"));
    }

    #[test]
    fn test_generate_id_empty_title() {
        let id = generate_id("worker", "");
        assert!(id.ends_with("-worker"));
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Hello World"), "hello-world");
        assert_eq!(slugify("Add OAuth!"), "add-oauth");
        assert_eq!(slugify("Multiple   Spaces"), "multiple-spaces");
        assert_eq!(slugify("don't stop"), "dont-stop");
        // Long titles are capped at six words
        assert_eq!(
            slugify("one two three four five six seven eight"),
            "one-two-three-four-five-six"
        );
    }

    #[test]
    fn test_id_type() {
        assert_eq!(id_type("0194af-task-do-thing"), Some("task"));
        assert_eq!(id_type("0194af-outcome"), Some("outcome"));
        assert_eq!(id_type("nodash"), None);
    }

    #[test]
    fn test_id_resolver() {
        let mut ids = HashMap::new();
        ids.insert("019430-outcome-build-todo".to_string(), "Build TODO".to_string());
        ids.insert("019431-task-add-items".to_string(), "Add items".to_string());
        ids.insert("019432-task-delete-items".to_string(), "Delete items".to_string());

        let resolver = IdResolver::new(&ids);
        assert_eq!(
            resolver.resolve("019430").unwrap(),
            Some("019430-outcome-build-todo".to_string())
        );
        assert_eq!(
            resolver.resolve("delete-items").unwrap(),
            Some("019432-task-delete-items".to_string())
        );
        assert_eq!(resolver.resolve("nonexistent").unwrap(), None);
        assert!(resolver.resolve("items").is_err());
    }
}
