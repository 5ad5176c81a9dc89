//! Output validation: the two-tier, fail-fast gate pipeline.
//!
//! Tier 1 is the fixed hard-limit rule set; a `Severe` match stops
//! everything. Tier 2 is the configurable gate list, run in order and
//! stopped at the first failure. A disabled pipeline short-circuits the
//! configurable tier to a single synthetic "all passed" result.

pub mod hard_limits;
pub mod semantic;

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::Config;
use crate::core::Task;
use crate::error::Result;
use crate::mlog_warn;
use crate::worker::Worker;
use hard_limits::{CheckRegistry, HardLimits};

/// Result of one validation check. Transient: lives only long enough to
/// produce an event and, on failure, a retry prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateResult {
    pub gate: String,
    pub passed: bool,
    pub message: String,
}

impl GateResult {
    pub fn passed(gate: &str, message: &str) -> Self {
        Self {
            gate: gate.to_string(),
            passed: true,
            message: message.to_string(),
        }
    }

    pub fn failed(gate: &str, message: &str) -> Self {
        Self {
            gate: gate.to_string(),
            passed: false,
            message: message.to_string(),
        }
    }
}

/// All gate results for one validation run.
#[derive(Debug, Clone, Default)]
pub struct GateReport {
    pub results: Vec<GateResult>,
}

impl GateReport {
    pub fn passed(&self) -> bool {
        self.results.iter().all(|r| r.passed)
    }

    pub fn first_failure(&self) -> Option<&GateResult> {
        self.results.iter().find(|r| !r.passed)
    }

    /// One-line summary of every failure, for retry prompts and events.
    pub fn failure_summary(&self) -> String {
        self.results
            .iter()
            .filter(|r| !r.passed)
            .map(|r| format!("{}: {}", r.gate, r.message))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// The closed set of built-in configurable gates.
enum BuiltinGate {
    OutputNonEmpty,
    MercuryValidator,
}

impl BuiltinGate {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "output-nonempty" => Some(Self::OutputNonEmpty),
            "mercury-validator" => Some(Self::MercuryValidator),
            _ => None,
        }
    }
}

/// Runs the validation pipeline for a task's output.
pub struct GateRunner {
    enabled: bool,
    gate_order: Vec<String>,
    hard_limits: HardLimits,
    worker: Arc<dyn Worker>,
}

impl GateRunner {
    /// Build the runner from configuration, compiling hard-limit patterns
    /// up front so bad rules fail at startup rather than mid-run.
    pub fn from_config(config: &Config, worker: Arc<dyn Worker>) -> Result<Self> {
        Ok(Self {
            enabled: config.gates_enabled,
            gate_order: config.gate_order.clone(),
            hard_limits: HardLimits::compile(
                config.hard_limits.clone(),
                CheckRegistry::builtin(),
            )?,
            worker,
        })
    }

    /// Validate an output. Hard limits always run first; configurable
    /// gates run in order, fail-fast, only when no `Severe` rule matched.
    pub async fn run(&self, task: &Task, output: &str) -> GateReport {
        let (mut results, severe) = self.hard_limits.run(output);

        if severe {
            // No configurable gate ever runs after a severe violation.
            return GateReport { results };
        }

        if !self.enabled {
            results.push(GateResult::passed("gates-disabled", "gate pipeline disabled"));
            return GateReport { results };
        }

        for name in &self.gate_order {
            let Some(gate) = BuiltinGate::from_name(name) else {
                mlog_warn!("Unknown gate '{}' in gate_order; skipping", name);
                continue;
            };
            let result = match gate {
                BuiltinGate::OutputNonEmpty => {
                    if output.trim().is_empty() {
                        GateResult::failed(name, "worker produced empty output")
                    } else {
                        GateResult::passed(name, "ok")
                    }
                }
                BuiltinGate::MercuryValidator => {
                    let verdict = semantic::validate(self.worker.as_ref(), task, output).await;
                    if semantic::verdict_passes(&verdict) {
                        GateResult::passed(name, &verdict.reasoning)
                    } else {
                        GateResult::failed(name, &verdict.reasoning)
                    }
                }
            };

            let failed = !result.passed;
            results.push(result);
            if failed {
                break; // fail-fast: later gates never run
            }
        }

        GateReport { results }
    }
}
