//! Council review: a fixed panel of independent evaluators.
//!
//! Each member reviews the task output on its own and returns an
//! approve/reject/abstain verdict with a confidence score. A member whose
//! worker call fails abstains with confidence 0; the vote always completes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::core::Task;
use crate::verdict::{self, Decision, Verdict};
use crate::worker::Worker;
use crate::{mlog, mlog_warn};

/// The fixed review panel. Each member gets its own system prompt and
/// votes independently.
const MEMBERS: &[(&str, &str)] = &[
    (
        "architecture-reviewer",
        "You are an architecture reviewer. Judge whether the output fits the \
         system's structure and boundaries. Reply APPROVE or REJECT on the \
         first line, one line of reasoning, and a line 'Confidence: <0..1>'.",
    ),
    (
        "quality-reviewer",
        "You are a code quality reviewer. Judge correctness, clarity and \
         test coverage of the output. Reply APPROVE or REJECT on the first \
         line, one line of reasoning, and a line 'Confidence: <0..1>'.",
    ),
    (
        "implementation-reviewer",
        "You are an implementation reviewer. Judge whether the output \
         actually accomplishes the task as described. Reply APPROVE or \
         REJECT on the first line, one line of reasoning, and a line \
         'Confidence: <0..1>'.",
    ),
];

/// How the panel's votes relate to each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Consensus {
    Unanimous,
    Majority,
    Split,
    Deadlock,
}

/// The panel's aggregate verdict on a task output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CouncilVerdict {
    Approved,
    Rejected,
    Pending,
}

/// One member's recorded vote.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vote {
    pub member: String,
    pub verdict: Verdict,
}

/// Immutable record of one council review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouncilDecision {
    pub consensus: Consensus,
    pub verdict: CouncilVerdict,
    pub votes: Vec<Vote>,
    pub decided_at: DateTime<Utc>,
}

impl CouncilDecision {
    pub fn approved(&self) -> bool {
        self.verdict == CouncilVerdict::Approved
    }

    pub fn rejected(&self) -> bool {
        self.verdict == CouncilVerdict::Rejected
    }
}

/// Fold a set of votes into the aggregate decision.
///
/// With approve count `a`, reject count `r`, panel size `n`:
/// all approve is unanimous/approved; `a > r` is majority/approved;
/// `r > a` is majority/rejected; a tie (including all abstentions) is a
/// deadlock left pending.
pub fn aggregate(votes: Vec<Vote>) -> CouncilDecision {
    let n = votes.len();
    let a = votes
        .iter()
        .filter(|v| v.verdict.decision == Decision::Approve)
        .count();
    let r = votes
        .iter()
        .filter(|v| v.verdict.decision == Decision::Reject)
        .count();

    let (consensus, verdict) = if n > 0 && a == n {
        (Consensus::Unanimous, CouncilVerdict::Approved)
    } else if a > r {
        (Consensus::Majority, CouncilVerdict::Approved)
    } else if r > a {
        (Consensus::Majority, CouncilVerdict::Rejected)
    } else {
        (Consensus::Deadlock, CouncilVerdict::Pending)
    };

    CouncilDecision {
        consensus,
        verdict,
        votes,
        decided_at: Utc::now(),
    }
}

/// Runs the review panel over task outputs.
pub struct Council {
    enabled: bool,
    phase_threshold: u32,
}

impl Council {
    pub fn from_config(config: &Config) -> Self {
        Self {
            enabled: config.council_enabled,
            phase_threshold: config.council_phase_threshold,
        }
    }

    /// Whether this task's output needs a council review.
    ///
    /// Only early-phase tasks and tasks on a repeat attempt (including an
    /// in-run gate retry) are reviewed; running the full panel on every
    /// task would triple worker cost.
    pub fn required_for(&self, task: &Task) -> bool {
        self.enabled && (task.phase <= self.phase_threshold || task.attempts > 1)
    }

    /// Put an output before the panel and aggregate the votes.
    pub async fn review(&self, worker: &dyn Worker, task: &Task, output: &str) -> CouncilDecision {
        let user_prompt = format!(
            "## Task\n{}\n\n{}\n\n## Output under review\n{}",
            task.title, task.description, output
        );

        let mut votes = Vec::with_capacity(MEMBERS.len());
        for (member, system_prompt) in MEMBERS {
            let verdict = match worker.call(system_prompt, &user_prompt, member).await {
                Ok(reply) => verdict::parse_verdict(&reply.content),
                Err(e) => {
                    mlog_warn!("Council member {} call failed ({}); recording abstain", member, e);
                    Verdict::abstained(&format!("call failed: {}", e))
                }
            };
            votes.push(Vote {
                member: member.to_string(),
                verdict,
            });
        }

        let decision = aggregate(votes);
        mlog!(
            "Council on {}: {:?}/{:?} ({} votes)",
            task.id,
            decision.consensus,
            decision.verdict,
            decision.votes.len()
        );
        decision
    }
}
