//! Retrospective engine - escalation clustering into improvement proposals
//!
//! A background job per outcome groups historical escalations by trigger
//! type and question similarity, distills each sizable cluster into an
//! improvement proposal, and on acceptance materializes proposals as
//! child outcomes under a synthesized "Self-Improvement" parent.

use std::collections::HashMap;
use std::collections::HashSet;

use tracing::{info, warn};

use crate::domain::{
    AnalysisJob, Escalation, EscalationCluster, ImprovementProposal, Intent, JobStatus, Outcome,
    ProposedTask, Task, generate_id,
};
use crate::error::{EngineError, EngineResult};
use crate::state::StateManager;

/// Name of the synthesized parent outcome for accepted proposals
pub const SELF_IMPROVEMENT_OUTCOME: &str = "Self-Improvement";

/// Minimum escalations for a cluster to become a proposal
const MIN_CLUSTER_SIZE: usize = 3;

/// Similarity floor for two questions to share a cluster
const CLUSTER_SIMILARITY: f64 = 0.2;

/// Background retrospective jobs
#[derive(Clone)]
pub struct RetroEngine {
    state: StateManager,
}

impl RetroEngine {
    pub fn new(state: StateManager) -> Self {
        Self { state }
    }

    /// Start an analysis job for an outcome
    ///
    /// Rejects with Conflict while another job for the outcome is still
    /// pending or running. The returned id can be polled via `status`.
    pub async fn trigger(&self, outcome_id: &str) -> EngineResult<String> {
        let job = AnalysisJob::new(outcome_id);
        let job_id = self.state.create_analysis_job(job).await?;

        let engine = self.clone();
        let spawned_id = job_id.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.run_job(&spawned_id).await {
                warn!(job_id = %spawned_id, error = %e, "Analysis job failed");
                if let Ok(mut job) = engine.state.get_analysis_job(&spawned_id).await
                    && let Some(job) = job.as_mut()
                {
                    job.error = Some(e.to_string());
                    job.set_status(JobStatus::Failed);
                    let _ = engine.state.update_analysis_job(job.clone()).await;
                }
            }
        });

        Ok(job_id)
    }

    pub async fn status(&self, job_id: &str) -> EngineResult<AnalysisJob> {
        self.state
            .get_analysis_job(job_id)
            .await?
            .ok_or_else(|| EngineError::not_found(job_id))
    }

    /// The actual analysis; runs on the spawned task
    pub(crate) async fn run_job(&self, job_id: &str) -> EngineResult<()> {
        let mut job = self.status(job_id).await?;
        job.set_status(JobStatus::Running);
        job.set_progress("loading escalations");
        self.state.update_analysis_job(job.clone()).await?;

        let escalations = self
            .state
            .list_escalations(Some(job.outcome_id.clone()), false)
            .await?;

        job.set_progress(format!("clustering {} escalations", escalations.len()));
        self.state.update_analysis_job(job.clone()).await?;

        let clusters = cluster_escalations(&escalations);
        let proposals: Vec<ImprovementProposal> =
            clusters.iter().map(build_proposal).collect();

        job.clusters = clusters;
        job.proposals = proposals;
        job.set_progress("done");
        job.set_status(JobStatus::Completed);
        self.state.update_analysis_job(job.clone()).await?;

        info!(
            job_id,
            outcome_id = %job.outcome_id,
            clusters = job.clusters.len(),
            proposals = job.proposals.len(),
            "Retrospective analysis complete"
        );
        Ok(())
    }

    /// Materialize one proposal as a child outcome
    ///
    /// Creates (or reuses) the Self-Improvement parent, creates a child
    /// outcome carrying the proposal's intent and approach sketches plus
    /// its proposed tasks, and marks the source escalations incorporated.
    pub async fn accept_proposal(&self, job_id: &str, proposal_id: &str) -> EngineResult<String> {
        let job = self.status(job_id).await?;
        if job.status != JobStatus::Completed {
            return Err(EngineError::conflict(format!(
                "analysis job {} is {}",
                job_id, job.status
            )));
        }
        let proposal = job
            .proposals
            .iter()
            .find(|p| p.id == proposal_id)
            .ok_or_else(|| EngineError::not_found(proposal_id))?;

        self.materialize(proposal).await
    }

    /// Materialize every proposal of a job as one consolidated child
    pub async fn accept_consolidated(&self, job_id: &str) -> EngineResult<String> {
        let job = self.status(job_id).await?;
        if job.status != JobStatus::Completed {
            return Err(EngineError::conflict(format!(
                "analysis job {} is {}",
                job_id, job.status
            )));
        }
        if job.proposals.is_empty() {
            return Err(EngineError::validation("job produced no proposals"));
        }

        let consolidated = ImprovementProposal {
            id: generate_id("proposal", "consolidated"),
            root_cause: job
                .proposals
                .iter()
                .map(|p| p.root_cause.clone())
                .collect::<Vec<_>>()
                .join("; "),
            problem_summary: format!("{} recurring problem areas", job.proposals.len()),
            proposed_tasks: job
                .proposals
                .iter()
                .flat_map(|p| p.proposed_tasks.clone())
                .collect(),
            intent_sketch: "Address the recurring escalation causes of this outcome".to_string(),
            approach_sketch: job
                .proposals
                .iter()
                .map(|p| p.approach_sketch.clone())
                .collect::<Vec<_>>()
                .join("\n"),
            source_escalations: job
                .proposals
                .iter()
                .flat_map(|p| p.source_escalations.clone())
                .collect(),
        };
        self.materialize(&consolidated).await
    }

    async fn materialize(&self, proposal: &ImprovementProposal) -> EngineResult<String> {
        let parent_id = self.ensure_parent().await?;

        let mut child = Outcome::new(&proposal.problem_summary).with_parent(parent_id);
        child.brief = proposal.root_cause.clone();
        let mut intent = Intent::default();
        intent.summary = proposal.intent_sketch.clone();
        child.set_intent(intent);
        child.append_design_doc(&proposal.approach_sketch);
        let child_id = self.state.create_outcome(child).await?;

        let tasks: Vec<Task> = proposal
            .proposed_tasks
            .iter()
            .map(|p| {
                Task::new(&child_id, &p.title)
                    .with_description(p.description.clone())
                    .with_intent(p.description.clone())
            })
            .collect();
        if !tasks.is_empty() {
            self.state.create_tasks(tasks).await?;
        }

        for escalation_id in &proposal.source_escalations {
            if let Some(mut escalation) = self.state.get_escalation(escalation_id).await? {
                escalation.incorporated = true;
                escalation.updated_at = outcomestore::now_ms();
                self.state.update_escalation(escalation).await?;
            }
        }

        info!(child_outcome = %child_id, "Proposal materialized");
        Ok(child_id)
    }

    /// Find or create the top-level Self-Improvement outcome
    async fn ensure_parent(&self) -> EngineResult<String> {
        let outcomes = self.state.list_outcomes(None, None).await?;
        if let Some(parent) = outcomes
            .iter()
            .find(|o| o.name == SELF_IMPROVEMENT_OUTCOME && o.parent.is_none())
        {
            return Ok(parent.id.clone());
        }
        let mut parent = Outcome::new(SELF_IMPROVEMENT_OUTCOME);
        parent.brief = "Improvements distilled from recurring escalations".to_string();
        Ok(self.state.create_outcome(parent).await?)
    }
}

/// Group escalations by trigger type and question similarity
pub fn cluster_escalations(escalations: &[Escalation]) -> Vec<EscalationCluster> {
    let mut by_trigger: HashMap<&str, Vec<&Escalation>> = HashMap::new();
    for escalation in escalations {
        if escalation.incorporated {
            continue;
        }
        by_trigger
            .entry(escalation.trigger_type.as_str())
            .or_default()
            .push(escalation);
    }

    let mut clusters = Vec::new();
    for (trigger_type, group) in by_trigger {
        // Greedy clustering: an escalation joins the first cluster whose
        // seed question is similar enough
        let mut seeds: Vec<(&Escalation, Vec<&Escalation>)> = Vec::new();
        for escalation in group {
            match seeds
                .iter_mut()
                .find(|(seed, _)| similarity(&seed.question, &escalation.question) >= CLUSTER_SIMILARITY)
            {
                Some((_, members)) => members.push(escalation),
                None => seeds.push((escalation, vec![escalation])),
            }
        }

        for (_, members) in seeds {
            if members.len() < MIN_CLUSTER_SIZE {
                continue;
            }
            clusters.push(EscalationCluster {
                trigger_type: trigger_type.to_string(),
                root_cause: synthesize_root_cause(trigger_type, &members),
                escalation_ids: members.iter().map(|e| e.id.clone()).collect(),
            });
        }
    }

    clusters.sort_by_key(|c| std::cmp::Reverse(c.escalation_ids.len()));
    clusters
}

/// Most frequent question terms become the synthesized root cause
fn synthesize_root_cause(trigger_type: &str, members: &[&Escalation]) -> String {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for escalation in members {
        for token in tokens(&escalation.question) {
            *counts.entry(token).or_default() += 1;
        }
    }
    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    let topics: Vec<String> = ranked.into_iter().take(3).map(|(t, _)| t).collect();
    format!(
        "{} questions recur around: {}",
        trigger_type,
        topics.join(", ")
    )
}

fn tokens(text: &str) -> Vec<String> {
    const STOPWORDS: &[&str] = &["the", "and", "should", "would", "could", "this", "that", "are", "for"];
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 3 && !STOPWORDS.contains(w))
        .map(String::from)
        .collect()
}

fn similarity(a: &str, b: &str) -> f64 {
    let a: HashSet<String> = tokens(a).into_iter().collect();
    let b: HashSet<String> = tokens(b).into_iter().collect();
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    a.intersection(&b).count() as f64 / a.union(&b).count() as f64
}

/// Distill a cluster into an actionable proposal
pub fn build_proposal(cluster: &EscalationCluster) -> ImprovementProposal {
    let topic = cluster
        .root_cause
        .split(": ")
        .nth(1)
        .unwrap_or("recurring questions")
        .to_string();

    ImprovementProposal {
        id: generate_id("proposal", &cluster.trigger_type),
        root_cause: cluster.root_cause.clone(),
        problem_summary: format!(
            "{} {} escalations share a root cause",
            cluster.escalation_ids.len(),
            cluster.trigger_type
        ),
        proposed_tasks: vec![
            ProposedTask {
                title: format!("Document decisions about {}", topic),
                description: format!(
                    "Write a decision record covering {} so workers stop asking",
                    topic
                ),
            },
            ProposedTask {
                title: format!("Add a skill capturing {} guidance", topic),
                description: format!(
                    "Create a skill file with triggers for {} that answers the recurring questions",
                    topic
                ),
            },
            ProposedTask {
                title: "Fold the answers into the outcome approach".to_string(),
                description: format!(
                    "Update the approach text so future {} escalations are pre-empted",
                    cluster.trigger_type
                ),
            },
        ],
        intent_sketch: format!("Eliminate recurring {} escalations", cluster.trigger_type),
        approach_sketch: format!(
            "Capture the repeated answers about {} as durable skills and docs.",
            topic
        ),
        source_escalations: cluster.escalation_ids.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::EscalationOption;
    use std::time::Duration;

    fn escalation(outcome: &str, trigger: &str, question: &str) -> Escalation {
        Escalation::new(
            outcome,
            trigger,
            question,
            vec![
                EscalationOption::new("a", "option a"),
                EscalationOption::new("b", "option b"),
            ],
            vec![],
        )
    }

    #[test]
    fn test_clustering_groups_similar_questions() {
        let escalations = vec![
            escalation("o", "unclear_requirement", "Should items persist across restarts?"),
            escalation("o", "unclear_requirement", "Should completed items persist after restarts?"),
            escalation("o", "unclear_requirement", "Do deleted items persist across restarts too?"),
            escalation("o", "missing_capability", "Where is the search key?"),
        ];

        let clusters = cluster_escalations(&escalations);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].trigger_type, "unclear_requirement");
        assert_eq!(clusters[0].escalation_ids.len(), 3);
        assert!(clusters[0].root_cause.contains("unclear_requirement"));
    }

    #[test]
    fn test_small_groups_do_not_cluster() {
        let escalations = vec![
            escalation("o", "unclear_requirement", "Should items persist?"),
            escalation("o", "unclear_requirement", "Should items persist please?"),
        ];
        assert!(cluster_escalations(&escalations).is_empty());
    }

    #[test]
    fn test_incorporated_escalations_ignored() {
        let mut escalations = vec![
            escalation("o", "unclear_requirement", "Should items persist across restarts?"),
            escalation("o", "unclear_requirement", "Should items persist across restarts?"),
            escalation("o", "unclear_requirement", "Should items persist across restarts?"),
        ];
        escalations[0].incorporated = true;
        assert!(cluster_escalations(&escalations).is_empty());
    }

    #[test]
    fn test_proposal_has_three_tasks() {
        let cluster = EscalationCluster {
            trigger_type: "unclear_requirement".to_string(),
            root_cause: "unclear_requirement questions recur around: persist, items, restarts".to_string(),
            escalation_ids: vec!["e1".to_string(), "e2".to_string(), "e3".to_string()],
        };
        let proposal = build_proposal(&cluster);
        assert!(proposal.proposed_tasks.len() >= 3);
        assert_eq!(proposal.source_escalations.len(), 3);
    }

    async fn wait_terminal(engine: &RetroEngine, job_id: &str) -> AnalysisJob {
        for _ in 0..100 {
            let job = engine.status(job_id).await.unwrap();
            if job.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job never finished");
    }

    #[tokio::test]
    async fn test_trigger_runs_to_completion_and_accept() {
        let state = StateManager::spawn_in_memory().unwrap();
        let engine = RetroEngine::new(state.clone());

        let outcome_id = state.create_outcome(Outcome::new("retro-me")).await.unwrap();
        for i in 0..8 {
            let esc = escalation(
                &outcome_id,
                "unclear_requirement",
                &format!("Should items persist across restarts in case {}?", i),
            );
            state.open_escalation(esc).await.unwrap();
        }
        for i in 0..4 {
            let esc = escalation(&outcome_id, "missing_capability", &format!("totally different thing {}", i));
            state.open_escalation(esc).await.unwrap();
        }

        let job_id = engine.trigger(&outcome_id).await.unwrap();
        let job = wait_terminal(&engine, &job_id).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert!(!job.proposals.is_empty());

        let big = &job.proposals[0];
        assert_eq!(big.source_escalations.len(), 8);
        assert!(big.proposed_tasks.len() >= 3);

        // Accept: creates a child under Self-Improvement with tasks and
        // marks sources incorporated
        let child_id = engine.accept_proposal(&job_id, &big.id).await.unwrap();
        let child = state.get_outcome_required(&child_id).await.unwrap();
        let parent = state.get_outcome_required(child.parent.as_ref().unwrap()).await.unwrap();
        assert_eq!(parent.name, SELF_IMPROVEMENT_OUTCOME);

        let tasks = state.list_tasks(&child_id, None).await.unwrap();
        assert!(tasks.len() >= 3);

        for esc_id in &big.source_escalations {
            let esc = state.get_escalation_required(esc_id).await.unwrap();
            assert!(esc.incorporated);
        }
    }

    #[tokio::test]
    async fn test_second_trigger_conflicts() {
        let state = StateManager::spawn_in_memory().unwrap();
        let engine = RetroEngine::new(state.clone());
        let outcome_id = state.create_outcome(Outcome::new("retro-me")).await.unwrap();

        // A live (pending) job blocks another trigger for the outcome
        let blocking = AnalysisJob::new(&outcome_id);
        state.create_analysis_job(blocking).await.unwrap();

        let err = engine.trigger(&outcome_id).await.unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
    }
}
