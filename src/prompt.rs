//! Prompt assembly for task execution.
//!
//! The user prompt always carries *some* context for every dependency:
//! the artifact content when it exists, otherwise the dependency's status
//! or an unreadable-artifact note. Downstream tasks never fail for lack of
//! upstream context.

use std::sync::Arc;

use crate::config::RETRY_OUTPUT_BUDGET;
use crate::core::{Task, TaskGraph, TaskStatus};
use crate::error::Result;
use crate::worker::TemplateLoader;

/// The system/user prompt pair sent to the worker.
#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

/// Truncate text to a character budget, marking the cut.
pub fn truncate(text: &str, budget: usize) -> String {
    if text.len() <= budget {
        return text.to_string();
    }
    let mut end = budget;
    // Back off to a char boundary.
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n[... truncated ...]", &text[..end])
}

pub struct PromptBuilder {
    templates: Arc<dyn TemplateLoader>,
}

impl PromptBuilder {
    pub fn new(templates: Arc<dyn TemplateLoader>) -> Self {
        Self { templates }
    }

    /// Build the execution prompt for a task.
    ///
    /// The system prompt comes from the agent's template. The user prompt
    /// concatenates the task header and one section per dependency.
    pub fn build(&self, task: &Task, graph: &TaskGraph) -> Result<Prompt> {
        let system = self.templates.system_prompt(&task.agent)?;

        let mut user = String::new();
        user.push_str(&format!("# Task: {}\n\n", task.title));
        user.push_str(&format!("{}\n\n", task.description));
        user.push_str(&format!("Agent: {}\nPhase: {}\n", task.agent, task.phase));

        if !task.context.is_empty() {
            user.push_str("\n## Context\n");
            for (key, value) in &task.context {
                user.push_str(&format!("- {}: {}\n", key, value));
            }
        }

        if !task.dependencies.is_empty() {
            user.push_str("\n## Completed dependencies\n");
            for dep_id in &task.dependencies {
                match graph.task(dep_id) {
                    Some(dep) => {
                        user.push_str(&format!("\n### {} ({})\n", dep.title, dep.id));
                        user.push_str(&self.dependency_section(dep));
                    }
                    None => {
                        user.push_str(&format!("\n### {} (unknown task)\n", dep_id));
                    }
                }
            }
        }

        Ok(Prompt { system, user })
    }

    fn dependency_section(&self, dep: &Task) -> String {
        if dep.status != TaskStatus::Done {
            return format!("Status: {} (no output yet)\n", dep.status);
        }
        match &dep.output {
            Some(path) => match std::fs::read_to_string(path) {
                Ok(content) => format!("Output:\n{}\n", content),
                Err(e) => format!("Output at {} is unreadable: {}\n", path.display(), e),
            },
            None => "Done, but no output artifact was recorded.\n".to_string(),
        }
    }

    /// Build the failure-aware retry prompt after a gate failure.
    ///
    /// The previous output is truncated to `RETRY_OUTPUT_BUDGET` to respect
    /// downstream context-window limits.
    pub fn build_retry(&self, task: &Task, failure_summary: &str, previous_output: &str) -> String {
        format!(
            "# Retry: {}\n\n{}\n\nYour previous output failed validation:\n{}\n\n\
             ## Previous output (truncated)\n{}\n\n\
             Produce a corrected output that addresses the failure.",
            task.title,
            task.description,
            failure_summary,
            truncate(previous_output, RETRY_OUTPUT_BUDGET)
        )
    }
}
