//! Non-negotiable hard limits checked before any configurable gate.
//!
//! Rules come from configuration. Each rule is either a regex pattern
//! matched against the worker's output or a named custom check looked up
//! in the check registry. A `Severe` match aborts the whole gate pipeline
//! for the task.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;

use crate::error::{Error, Result};
use crate::gates::GateResult;
use crate::mlog_warn;

/// How bad a rule violation is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    /// Aborts the gate pipeline for the task immediately.
    Severe,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Severe => write!(f, "severe"),
        }
    }
}

/// One configured hard-limit rule.
///
/// Exactly one of `pattern` / `check` is expected; a rule with neither
/// never matches and is reported at load time by `HardLimits::compile`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardLimitRule {
    pub name: String,
    /// Regex matched against the output; a match is a violation.
    #[serde(default)]
    pub pattern: Option<String>,
    /// Name of a custom check in the registry.
    #[serde(default)]
    pub check: Option<String>,
    /// Parameters passed to the custom check.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    pub severity: Severity,
    pub message: String,
}

/// A custom check: returns true when the rule is violated.
pub type CustomCheck = fn(output: &str, rule: &HardLimitRule) -> bool;

/// Named custom checks referenced by hard-limit rules.
#[derive(Debug)]
pub struct CheckRegistry {
    checks: HashMap<String, CustomCheck>,
}

impl CheckRegistry {
    /// Registry with the built-in checks.
    pub fn builtin() -> Self {
        let mut checks: HashMap<String, CustomCheck> = HashMap::new();
        checks.insert("min_state_branches".to_string(), min_state_branches);
        checks.insert("integer_floor_math".to_string(), integer_floor_math);
        Self { checks }
    }

    pub fn register(&mut self, name: &str, check: CustomCheck) {
        self.checks.insert(name.to_string(), check);
    }

    pub fn get(&self, name: &str) -> Option<&CustomCheck> {
        self.checks.get(name)
    }
}

impl Default for CheckRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Violated when any named UI-state branch is missing from the output.
///
/// Params: `states` is a comma-separated list of branch names that must all appear
/// (case-insensitive).
fn min_state_branches(output: &str, rule: &HardLimitRule) -> bool {
    let Some(states) = rule.params.get("states") else {
        return false;
    };
    let lower = output.to_lowercase();
    states
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .any(|state| !lower.contains(&state.to_lowercase()))
}

fn fractional_math_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"Math\.(?:round|ceil)\(|/\s*\d+\.\d+|\*\s*0\.\d+").unwrap()
    })
}

/// Violated when the output uses fractional math where integer floor math
/// is required (rounding helpers, float division/scaling).
fn integer_floor_math(output: &str, _rule: &HardLimitRule) -> bool {
    fractional_math_re().is_match(output)
}

/// Hard-limit rules with their patterns compiled once at startup.
#[derive(Debug)]
pub struct HardLimits {
    rules: Vec<(HardLimitRule, Option<Regex>)>,
    registry: CheckRegistry,
}

impl HardLimits {
    /// Compile the configured rules. Bad patterns are load-time errors.
    pub fn compile(rules: Vec<HardLimitRule>, registry: CheckRegistry) -> Result<Self> {
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            let regex = match &rule.pattern {
                Some(p) => Some(Regex::new(p).map_err(|source| Error::Pattern {
                    rule: rule.name.clone(),
                    source,
                })?),
                None => {
                    if rule.check.is_none() {
                        mlog_warn!("Hard limit '{}' has neither pattern nor check", rule.name);
                    }
                    None
                }
            };
            compiled.push((rule, regex));
        }
        Ok(Self {
            rules: compiled,
            registry,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Run every rule against the output.
    ///
    /// Returns one `GateResult` per rule plus a flag set when any matched
    /// rule is `Severe`.
    pub fn run(&self, output: &str) -> (Vec<GateResult>, bool) {
        let mut results = Vec::with_capacity(self.rules.len());
        let mut severe = false;

        for (rule, regex) in &self.rules {
            let matched = match (regex, &rule.check) {
                (Some(re), _) => re.is_match(output),
                (None, Some(check_name)) => match self.registry.get(check_name) {
                    Some(check) => check(output, rule),
                    None => {
                        mlog_warn!(
                            "Hard limit '{}' references unknown check '{}'",
                            rule.name,
                            check_name
                        );
                        false
                    }
                },
                (None, None) => false,
            };

            if matched && rule.severity == Severity::Severe {
                severe = true;
            }
            results.push(GateResult {
                gate: format!("hard-limit:{}", rule.name),
                passed: !matched,
                message: if matched {
                    format!("[{}] {}", rule.severity, rule.message)
                } else {
                    "ok".to_string()
                },
            });
        }

        (results, severe)
    }
}
