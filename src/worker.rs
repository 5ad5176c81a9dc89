//! External collaborator seams: the worker call and agent templates.
//!
//! The concrete model client stays outside this crate. `Worker` is the
//! narrow async interface the orchestrator depends on; `CommandWorker`
//! shells out to a configured CLI so any agent binary can stand behind it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::{mlog_debug, mlog_warn};

/// One reply from the external worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerReply {
    /// The text content produced by the worker.
    pub content: String,
    /// Parsed JSON payload, present only when the schema-validating call
    /// path could parse the content.
    #[serde(default)]
    pub structured: Option<Value>,
}

impl WorkerReply {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            structured: None,
        }
    }
}

/// The external executor that actually produces a task's output.
///
/// Calls may fail transiently; every call site that can degrade (council
/// votes, semantic validation, the fix loop) catches the error instead of
/// propagating it.
#[async_trait]
pub trait Worker: Send + Sync {
    async fn call(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        agent: &str,
    ) -> Result<WorkerReply>;
}

/// Expected shape of an agent's structured output.
///
/// Deliberately shallow: the registry checks that a JSON object carries the
/// required top-level fields. Unknown agents take the unstructured path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentSchema {
    pub required_fields: Vec<String>,
}

/// Registry mapping agent names to their output schemas.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<String, AgentSchema>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, agent: &str, schema: AgentSchema) {
        self.schemas.insert(agent.to_string(), schema);
    }

    pub fn get(&self, agent: &str) -> Option<&AgentSchema> {
        self.schemas.get(agent)
    }

    /// Call the worker, then attempt to parse and validate the reply as
    /// JSON against the agent's schema. Mismatches and parse failures are
    /// warned about, never fatal; the raw content always comes back.
    pub async fn call_structured(
        &self,
        worker: &dyn Worker,
        system_prompt: &str,
        user_prompt: &str,
        agent: &str,
    ) -> Result<WorkerReply> {
        let mut reply = worker.call(system_prompt, user_prompt, agent).await?;

        let Some(schema) = self.get(agent) else {
            // No schema registered: untyped path.
            return Ok(reply);
        };

        match serde_json::from_str::<Value>(reply.content.trim()) {
            Ok(value) => {
                let missing: Vec<&String> = schema
                    .required_fields
                    .iter()
                    .filter(|f| value.get(f.as_str()).is_none())
                    .collect();
                if missing.is_empty() {
                    reply.structured = Some(value);
                } else {
                    mlog_warn!(
                        "Agent {} output missing schema fields {:?}; keeping raw content",
                        agent,
                        missing
                    );
                }
            }
            Err(e) => {
                mlog_warn!("Agent {} output is not valid JSON ({}); keeping raw content", agent, e);
            }
        }
        Ok(reply)
    }
}

/// Resolves an agent name to its system-prompt text.
pub trait TemplateLoader: Send + Sync {
    fn system_prompt(&self, agent: &str) -> Result<String>;
}

/// Loads system prompts from `<dir>/<agent>.md`.
pub struct FileTemplateLoader {
    dir: PathBuf,
}

impl FileTemplateLoader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl TemplateLoader for FileTemplateLoader {
    fn system_prompt(&self, agent: &str) -> Result<String> {
        let path = self.dir.join(format!("{}.md", agent));
        if !path.exists() {
            return Err(Error::TemplateNotFound(agent.to_string()));
        }
        Ok(std::fs::read_to_string(&path)?)
    }
}

/// Worker backed by a CLI command.
///
/// The system prompt and agent name go in as arguments; the user prompt is
/// written to stdin; stdout is the reply content. Nonzero exit status is a
/// worker-call failure.
pub struct CommandWorker {
    base_command: Vec<String>,
}

impl CommandWorker {
    pub fn from_config(config: &Config) -> Self {
        let mut base_command: Vec<String> = config
            .effective_worker_command()
            .split_whitespace()
            .map(String::from)
            .collect();
        // A blank configured command would leave an empty argv.
        if base_command.is_empty() {
            base_command.push("claude".to_string());
        }
        Self { base_command }
    }

    pub fn binary(&self) -> &str {
        self.base_command
            .first()
            .map(|s| s.as_str())
            .unwrap_or("claude")
    }

    pub fn is_available(&self) -> bool {
        which::which(self.binary()).is_ok()
    }
}

#[async_trait]
impl Worker for CommandWorker {
    async fn call(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        agent: &str,
    ) -> Result<WorkerReply> {
        if !self.is_available() {
            return Err(Error::WorkerUnavailable(self.binary().to_string()));
        }
        mlog_debug!("CommandWorker::call agent={} binary={}", agent, self.binary());

        let mut cmd = Command::new(self.binary());
        cmd.args(self.base_command.get(1..).unwrap_or(&[]))
            .arg("--system-prompt")
            .arg(system_prompt)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| Error::WorkerCall(e.to_string()))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(user_prompt.as_bytes())
                .await
                .map_err(|e| Error::WorkerCall(e.to_string()))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| Error::WorkerCall(e.to_string()))?;
        if !output.status.success() {
            return Err(Error::WorkerCall(format!(
                "{} exited with {}: {}",
                self.binary(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(WorkerReply::text(
            String::from_utf8_lossy(&output.stdout).to_string(),
        ))
    }
}

/// Template loader wired to the configured templates directory, with a
/// built-in fallback prompt so missing template files never stall a run.
pub struct ConfigTemplateLoader {
    inner: FileTemplateLoader,
}

impl ConfigTemplateLoader {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            inner: FileTemplateLoader::new(config.templates_dir_path()?),
        })
    }
}

impl TemplateLoader for ConfigTemplateLoader {
    fn system_prompt(&self, agent: &str) -> Result<String> {
        match self.inner.system_prompt(agent) {
            Ok(prompt) => Ok(prompt),
            Err(Error::TemplateNotFound(_)) => {
                mlog_warn!("No template for agent {}, using generic prompt", agent);
                Ok(format!(
                    "You are {}, a specialized software agent. Complete the task you are given.",
                    agent
                ))
            }
            Err(e) => Err(e),
        }
    }
}
