//! Reviewer - evaluate-criteria capability
//!
//! The production reviewer is deterministic: a criterion passes when
//! enough of its significant terms show up in the evidence (completed
//! task text and workspace outputs). Implementations backed by an LLM
//! plug in through the same trait.

use async_trait::async_trait;

use crate::domain::{CriterionResult, IssueSeverity, Outcome, ReviewIssue, Task, TaskStatus};

/// What a review run evaluates against
#[derive(Debug, Clone, Default)]
pub struct Evidence {
    /// Every task of the outcome, terminal or not
    pub tasks: Vec<Task>,
    /// Relative paths under the outcome's `outputs/` directory
    pub outputs: Vec<String>,
}

/// What a reviewer produces
#[derive(Debug, Clone, Default)]
pub struct ReviewFindings {
    pub item_results: Vec<CriterionResult>,
    pub criterion_results: Vec<CriterionResult>,
    pub issues: Vec<ReviewIssue>,
}

/// Evaluate-criteria capability
#[async_trait]
pub trait Reviewer: Send + Sync {
    async fn evaluate(&self, outcome: &Outcome, evidence: &Evidence) -> ReviewFindings;
}

const STOPWORDS: &[&str] = &[
    "the", "and", "can", "for", "with", "are", "has", "have", "its", "this", "that", "all", "any",
    "will", "must", "should",
];

/// Significant lowercase terms of a criterion
fn terms(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() >= 3 && !STOPWORDS.contains(w))
        .map(String::from)
        .collect()
}

/// Deterministic evidence-overlap reviewer
pub struct EvidenceReviewer;

impl EvidenceReviewer {
    fn check(criterion: &str, evidence_text: &str) -> CriterionResult {
        let terms = terms(criterion);
        if terms.is_empty() {
            return CriterionResult {
                subject: criterion.to_string(),
                passed: false,
                evidence: "criterion has no checkable terms".to_string(),
            };
        }

        let matched: Vec<&String> = terms.iter().filter(|t| evidence_text.contains(t.as_str())).collect();
        let passed = matched.len() * 2 >= terms.len();
        let evidence = if passed {
            format!("evidence covers: {}", matched.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", "))
        } else {
            format!(
                "missing evidence for: {}",
                terms
                    .iter()
                    .filter(|t| !matched.contains(t))
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        };
        CriterionResult {
            subject: criterion.to_string(),
            passed,
            evidence,
        }
    }
}

#[async_trait]
impl Reviewer for EvidenceReviewer {
    async fn evaluate(&self, outcome: &Outcome, evidence: &Evidence) -> ReviewFindings {
        // Completed work and produced files form the searchable evidence
        let mut evidence_text = String::new();
        for task in evidence.tasks.iter().filter(|t| t.status == TaskStatus::Completed) {
            evidence_text.push_str(&task.title.to_lowercase());
            evidence_text.push('\n');
            evidence_text.push_str(&task.description.to_lowercase());
            evidence_text.push('\n');
            evidence_text.push_str(&task.task_intent.to_lowercase());
            evidence_text.push('\n');
        }
        for output in &evidence.outputs {
            evidence_text.push_str(&output.to_lowercase());
            evidence_text.push('\n');
        }

        let mut findings = ReviewFindings::default();

        for item in &outcome.intent.items {
            for criterion in &item.acceptance_criteria {
                let mut result = Self::check(criterion, &evidence_text);
                result.subject = format!("{}: {}", item.title, criterion);
                if !result.passed {
                    findings.issues.push(ReviewIssue {
                        severity: IssueSeverity::Medium,
                        description: format!(
                            "acceptance criterion unmet for {}: {}",
                            item.title, criterion
                        ),
                    });
                }
                findings.item_results.push(result);
            }
        }

        for criterion in &outcome.intent.success_criteria {
            let result = Self::check(criterion, &evidence_text);
            if !result.passed {
                findings.issues.push(ReviewIssue {
                    severity: IssueSeverity::High,
                    description: format!("success criterion unmet: {}", criterion),
                });
            }
            findings.criterion_results.push(result);
        }

        // Permanently failed tasks are findings even when criteria pass
        for task in evidence.tasks.iter().filter(|t| t.status == TaskStatus::Failed) {
            findings.issues.push(ReviewIssue {
                severity: IssueSeverity::Medium,
                description: format!("task failed permanently: {}", task.title),
            });
        }

        findings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Intent, IntentItem};

    fn outcome_with_criterion(criterion: &str) -> Outcome {
        let mut outcome = Outcome::new("Build TODO");
        let mut intent = Intent::default();
        intent.summary = "A single-user todo app".to_string();
        intent.success_criteria = vec![criterion.to_string()];
        outcome.set_intent(intent);
        outcome
    }

    fn completed_task(outcome: &Outcome, title: &str, intent: &str) -> Task {
        let mut task = Task::new(&outcome.id, title).with_intent(intent);
        task.set_status(TaskStatus::Completed);
        task
    }

    #[tokio::test]
    async fn test_criterion_passes_on_evidence() {
        let outcome = outcome_with_criterion("can add and delete items");
        let evidence = Evidence {
            tasks: vec![completed_task(
                &outcome,
                "Implement add/delete",
                "Users can add and delete todo items",
            )],
            outputs: vec![],
        };

        let findings = EvidenceReviewer.evaluate(&outcome, &evidence).await;
        assert_eq!(findings.criterion_results.len(), 1);
        assert!(findings.criterion_results[0].passed);
        assert!(findings.issues.is_empty());
    }

    #[tokio::test]
    async fn test_criterion_fails_without_evidence() {
        let outcome = outcome_with_criterion("items persist across restarts");
        let evidence = Evidence::default();

        let findings = EvidenceReviewer.evaluate(&outcome, &evidence).await;
        assert!(!findings.criterion_results[0].passed);
        assert_eq!(findings.issues.len(), 1);
        assert_eq!(findings.issues[0].severity, IssueSeverity::High);
    }

    #[tokio::test]
    async fn test_item_acceptance_criteria_checked() {
        let mut outcome = Outcome::new("Build TODO");
        let mut item = IntentItem::new("Persistence", "Store items durably");
        item.acceptance_criteria = vec!["items survive process restart".to_string()];
        let mut intent = Intent::default();
        intent.items = vec![item];
        outcome.set_intent(intent);

        let findings = EvidenceReviewer.evaluate(&outcome, &Evidence::default()).await;
        assert_eq!(findings.item_results.len(), 1);
        assert!(!findings.item_results[0].passed);
        assert_eq!(findings.issues[0].severity, IssueSeverity::Medium);
    }

    #[tokio::test]
    async fn test_failed_task_is_an_issue() {
        let outcome = outcome_with_criterion("can add and delete items");
        let mut failed = Task::new(&outcome.id, "Implement add/delete");
        failed.set_status(TaskStatus::Failed);
        let passing = completed_task(&outcome, "Implement add/delete", "add and delete items");

        let findings = EvidenceReviewer
            .evaluate(
                &outcome,
                &Evidence {
                    tasks: vec![passing, failed],
                    outputs: vec![],
                },
            )
            .await;
        assert!(findings.criterion_results[0].passed);
        assert!(
            findings
                .issues
                .iter()
                .any(|i| i.description.contains("failed permanently"))
        );
    }

    #[tokio::test]
    async fn test_outputs_count_as_evidence() {
        let outcome = outcome_with_criterion("produces a summary report");
        let evidence = Evidence {
            tasks: vec![],
            outputs: vec!["summary-report.md".to_string()],
        };
        let findings = EvidenceReviewer.evaluate(&outcome, &evidence).await;
        assert!(findings.criterion_results[0].passed);
    }
}
