//! The semantic validator gate ("mercury-validator").
//!
//! Asks the worker a yes/no-with-reason question about the output and
//! parses the verdict. If the call itself fails, validation degrades to
//! the deterministic keyword heuristic instead of blocking the pipeline
//! on infrastructure failure.

use crate::core::Task;
use crate::verdict::{self, Decision, Verdict};
use crate::worker::Worker;
use crate::{mlog_debug, mlog_warn};

/// Agent name under which the validator call is made.
pub const VALIDATOR_AGENT: &str = "mercury-validator";

const VALIDATOR_SYSTEM_PROMPT: &str = "You are a strict output validator. \
Given a task and an output produced for it, answer with APPROVE or REJECT \
on the first line, a one-line reason, and a line 'Confidence: <0..1>'.";

/// Validate an output semantically.
pub async fn validate(worker: &dyn Worker, task: &Task, output: &str) -> Verdict {
    let user_prompt = format!(
        "## Task\n{}\n\n{}\n\n## Output to validate\n{}\n\nDoes the output satisfy the task?",
        task.title, task.description, output
    );

    match worker
        .call(VALIDATOR_SYSTEM_PROMPT, &user_prompt, VALIDATOR_AGENT)
        .await
    {
        Ok(reply) => {
            let v = verdict::parse_verdict(&reply.content);
            mlog_debug!(
                "Semantic validation for {}: {} (confidence {:.2})",
                task.id,
                v.decision,
                v.confidence
            );
            v
        }
        Err(e) => {
            mlog_warn!(
                "Semantic validator call failed for {} ({}); falling back to keyword heuristic",
                task.id,
                e
            );
            verdict::keyword_heuristic(output)
        }
    }
}

/// Map a verdict to a pass/fail for the gate pipeline.
///
/// Only an explicit rejection fails the gate; an abstention (no clear
/// verdict in the reply) passes with a warning so a flaky validator
/// cannot fail good output.
pub fn verdict_passes(v: &Verdict) -> bool {
    match v.decision {
        Decision::Reject => false,
        Decision::Approve => true,
        Decision::Abstain => {
            mlog_warn!("Semantic validator gave no clear verdict; treating as pass");
            true
        }
    }
}
