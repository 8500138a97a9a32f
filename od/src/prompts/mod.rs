//! Prompt assembly for worker iterations
//!
//! Prompts are deterministic given their inputs: outcome intent and
//! approach, task intent and approach, compacted recent observations, and
//! the capability set the task references. Raw LLM output never feeds
//! back in.

mod embedded;

use eyre::{Context, Result};
use handlebars::Handlebars;
use serde::Serialize;

pub use embedded::ITERATION_TEMPLATE;

/// Capability summary handed to the template
#[derive(Debug, Clone, Serialize)]
pub struct CapabilityContext {
    pub reference: String,
    pub description: String,
    pub triggers: Vec<String>,
}

/// Everything an iteration prompt is built from
#[derive(Debug, Clone, Serialize)]
pub struct IterationContext {
    pub outcome_name: String,
    pub intent_summary: String,
    pub approach: String,
    pub task_title: String,
    pub task_intent: String,
    pub task_approach: String,
    /// Compacted observation summaries, newest last
    pub recent_observations: String,
    pub capabilities: Vec<CapabilityContext>,
}

/// Template-backed prompt builder
pub struct PromptBuilder {
    handlebars: Handlebars<'static>,
}

impl PromptBuilder {
    pub fn new() -> Result<Self> {
        let mut handlebars = Handlebars::new();
        handlebars.register_escape_fn(handlebars::no_escape);
        handlebars
            .register_template_string("iteration", ITERATION_TEMPLATE)
            .context("Failed to register iteration template")?;
        Ok(Self { handlebars })
    }

    /// Render the per-iteration prompt
    pub fn iteration_prompt(&self, ctx: &IterationContext) -> Result<String> {
        self.handlebars
            .render("iteration", ctx)
            .context("Failed to render iteration prompt")
    }
}
