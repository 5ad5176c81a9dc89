//! Test-fix loop for code-producing agents.
//!
//! After a code agent finishes, run the project's type-check and test
//! commands. Failures are captured as structured results, folded into a
//! fix prompt, and sent back to the worker for a bounded number of rounds.
//! An infrastructure failure during a fix attempt returns the best output
//! obtained so far instead of raising.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::config::{FAILURE_LINE_CAP, FIX_OUTPUT_BUDGET, TEST_TIMEOUT, TYPECHECK_TIMEOUT};
use crate::core::Task;
use crate::prompt::truncate;
use crate::worker::Worker;
use crate::{mlog, mlog_debug, mlog_warn};

/// Agents whose output is code and therefore subject to the fix loop.
/// Everything else passes through unchanged.
pub const CODE_AGENTS: &[&str] = &[
    "backend-developer",
    "frontend-developer",
    "fullstack-developer",
    "test-engineer",
];

pub fn is_code_agent(agent: &str) -> bool {
    CODE_AGENTS.contains(&agent)
}

/// What kind of check produced a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckKind {
    TypeCheck,
    Test,
}

impl std::fmt::Display for CheckKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckKind::TypeCheck => write!(f, "type-check"),
            CheckKind::Test => write!(f, "test"),
        }
    }
}

/// One captured check failure. Output is capped at `FAILURE_LINE_CAP`
/// lines when it enters a fix prompt.
#[derive(Debug, Clone)]
pub struct CheckFailure {
    pub kind: CheckKind,
    pub command: String,
    pub output: String,
}

impl CheckFailure {
    /// The failure text as embedded in a fix prompt.
    fn capped(&self) -> String {
        let lines: Vec<&str> = self.output.lines().take(FAILURE_LINE_CAP).collect();
        let mut text = lines.join("\n");
        if self.output.lines().count() > FAILURE_LINE_CAP {
            text.push_str("\n[... more lines omitted ...]");
        }
        text
    }
}

/// The project's check commands, auto-detected from its build files.
#[derive(Debug, Clone, Default)]
pub struct CheckCommands {
    pub typecheck: Option<Vec<String>>,
    pub test: Option<Vec<String>>,
}

impl CheckCommands {
    /// Detect which toolchain the project directory uses.
    ///
    /// Cargo projects get `cargo check` / `cargo test`; Node projects get
    /// `tsc --noEmit` (when tsc is on PATH) and `npm test`. A directory
    /// with neither build file gets no checks, which makes the fix loop a
    /// no-op for it.
    pub fn detect(project_dir: &Path) -> Self {
        if project_dir.join("Cargo.toml").exists() && which::which("cargo").is_ok() {
            return Self {
                typecheck: Some(vec!["cargo".into(), "check".into()]),
                test: Some(vec!["cargo".into(), "test".into()]),
            };
        }
        if project_dir.join("package.json").exists() {
            let typecheck = which::which("tsc")
                .is_ok()
                .then(|| vec!["tsc".into(), "--noEmit".into()]);
            let test = which::which("npm")
                .is_ok()
                .then(|| vec!["npm".into(), "test".into()]);
            return Self { typecheck, test };
        }
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.typecheck.is_none() && self.test.is_none()
    }
}

/// Run one check command under its timeout. `Ok(None)` means the check
/// passed; `Ok(Some(failure))` captures the failing output. A command
/// that cannot be spawned or times out is also a captured failure, not
/// an error: the fix prompt is the recovery path.
async fn run_check(
    kind: CheckKind,
    argv: &[String],
    project_dir: &Path,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Option<CheckFailure> {
    let command_line = argv.join(" ");
    mlog_debug!("Running {} command: {}", kind, command_line);

    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..])
        .current_dir(project_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            return Some(CheckFailure {
                kind,
                command: command_line,
                output: format!("failed to start: {}", e),
            });
        }
    };

    let output = tokio::select! {
        result = tokio::time::timeout(timeout, child.wait_with_output()) => match result {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Some(CheckFailure {
                    kind,
                    command: command_line,
                    output: format!("failed to run: {}", e),
                });
            }
            Err(_) => {
                return Some(CheckFailure {
                    kind,
                    command: command_line,
                    output: format!("timed out after {:?}", timeout),
                });
            }
        },
        _ = cancel.cancelled() => {
            return Some(CheckFailure {
                kind,
                command: command_line,
                output: "cancelled".to_string(),
            });
        }
    };

    if output.status.success() {
        return None;
    }
    let mut text = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(stderr.trim_end());
    }
    Some(CheckFailure {
        kind,
        command: command_line,
        output: text,
    })
}

/// Run both checks, collecting every failure.
async fn run_checks(
    commands: &CheckCommands,
    project_dir: &Path,
    cancel: &CancellationToken,
) -> Vec<CheckFailure> {
    let mut failures = Vec::new();
    if let Some(argv) = &commands.typecheck {
        if let Some(f) =
            run_check(CheckKind::TypeCheck, argv, project_dir, TYPECHECK_TIMEOUT, cancel).await
        {
            failures.push(f);
        }
    }
    if let Some(argv) = &commands.test {
        if let Some(f) = run_check(CheckKind::Test, argv, project_dir, TEST_TIMEOUT, cancel).await {
            failures.push(f);
        }
    }
    failures
}

fn fix_prompt(task: &Task, previous_output: &str, failures: &[CheckFailure]) -> String {
    let mut prompt = format!(
        "# Fix required: {}\n\n{}\n\n## Previous output (truncated)\n{}\n\n## Check failures\n",
        task.title,
        task.description,
        truncate(previous_output, FIX_OUTPUT_BUDGET)
    );
    for failure in failures {
        prompt.push_str(&format!(
            "\n### {} (`{}`)\n```\n{}\n```\n",
            failure.kind,
            failure.command,
            failure.capped()
        ));
    }
    prompt.push_str("\nProduce a corrected output that makes every check pass.");
    prompt
}

/// Runs the type-check/test/fix cycle after a code agent's task.
pub struct FixLoop {
    project_dir: PathBuf,
    commands: CheckCommands,
    max_retries: u32,
}

impl FixLoop {
    pub fn new(project_dir: impl Into<PathBuf>, max_retries: u32) -> Self {
        let project_dir = project_dir.into();
        let commands = CheckCommands::detect(&project_dir);
        Self {
            project_dir,
            commands,
            max_retries,
        }
    }

    #[cfg(test)]
    fn with_commands(project_dir: impl Into<PathBuf>, commands: CheckCommands, max_retries: u32) -> Self {
        Self {
            project_dir: project_dir.into(),
            commands,
            max_retries,
        }
    }

    /// Run the loop for a task, returning the best output obtained.
    ///
    /// Non-code agents and projects with no detectable checks pass through
    /// unchanged. A worker failure during a fix round stops the loop and
    /// returns whatever the last successful round produced.
    pub async fn run(
        &self,
        worker: &dyn Worker,
        system_prompt: &str,
        task: &Task,
        output: &str,
        cancel: &CancellationToken,
    ) -> String {
        if !is_code_agent(&task.agent) || self.commands.is_empty() {
            return output.to_string();
        }

        let mut best = output.to_string();
        for round in 0..=self.max_retries {
            let failures = run_checks(&self.commands, &self.project_dir, cancel).await;
            if failures.is_empty() {
                if round > 0 {
                    mlog!("Checks pass for {} after {} fix round(s)", task.id, round);
                }
                return best;
            }
            if round == self.max_retries {
                mlog_warn!(
                    "Fix budget exhausted for {} with {} check(s) still failing",
                    task.id,
                    failures.len()
                );
                return best;
            }

            mlog!(
                "Fix round {}/{} for {}: {} check(s) failing",
                round + 1,
                self.max_retries,
                task.id,
                failures.len()
            );
            let prompt = fix_prompt(task, &best, &failures);
            let reply = tokio::select! {
                reply = worker.call(system_prompt, &prompt, &task.agent) => reply,
                _ = cancel.cancelled() => {
                    mlog_warn!(
                        "Fix round cancelled for {}; returning best output so far",
                        task.id
                    );
                    return best;
                }
            };
            match reply {
                Ok(reply) => best = reply.content,
                Err(e) => {
                    mlog_warn!(
                        "Fix-round worker call failed for {} ({}); returning best output so far",
                        task.id,
                        e
                    );
                    return best;
                }
            }
        }
        best
    }
}
