//! Lifecycle hooks and declarative feature wiring.
//!
//! The registry is a per-session instance owned by the driver, never a
//! process-wide singleton; `reset` empties it between runs. Handlers are
//! fault-isolated: a failing hook is logged and skipped, the rest of the
//! phase still runs.

use std::collections::BTreeMap;
use uuid::Uuid;

use crate::config::DEFAULT_HOOK_PRIORITY;
use crate::core::{Task, TaskId};
use crate::error::Result;
use crate::{mlog, mlog_debug, mlog_warn};

/// The six fixed points in a build where hooks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuildPhase {
    BeforeBuild,
    BeforeTask,
    AfterTask,
    OnTaskError,
    OnHandoff,
    AfterBuild,
}

impl std::fmt::Display for BuildPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildPhase::BeforeBuild => write!(f, "before-build"),
            BuildPhase::BeforeTask => write!(f, "before-task"),
            BuildPhase::AfterTask => write!(f, "after-task"),
            BuildPhase::OnTaskError => write!(f, "on-task-error"),
            BuildPhase::OnHandoff => write!(f, "on-handoff"),
            BuildPhase::AfterBuild => write!(f, "after-build"),
        }
    }
}

/// Handle returned by `register`, used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(Uuid);

/// What a handler gets to look at when its phase fires.
#[derive(Debug, Clone, Default)]
pub struct HookContext {
    pub session_id: String,
    pub task: Option<Task>,
    pub error: Option<String>,
    /// On a handoff, the agent the previous task ran under.
    pub previous_agent: Option<String>,
    pub completed_tasks: usize,
    pub total_tasks: usize,
}

impl HookContext {
    pub fn for_session(session_id: &str, total_tasks: usize) -> Self {
        Self {
            session_id: session_id.to_string(),
            total_tasks,
            ..Default::default()
        }
    }

    pub fn with_task(mut self, task: &Task) -> Self {
        self.task = Some(task.clone());
        self
    }

    pub fn with_error(mut self, error: &str) -> Self {
        self.error = Some(error.to_string());
        self
    }

    pub fn task_id(&self) -> Option<&TaskId> {
        self.task.as_ref().map(|t| &t.id)
    }
}

type Handler = Box<dyn Fn(&HookContext) -> Result<()> + Send + Sync>;

struct Hook {
    id: HookId,
    phase: BuildPhase,
    module: String,
    priority: i32,
    handler: Handler,
}

/// Per-session hook registry.
#[derive(Default)]
pub struct HookRegistry {
    hooks: Vec<Hook>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a phase. Lower priority runs earlier;
    /// `DEFAULT_HOOK_PRIORITY` when the caller has no ordering needs.
    pub fn register(
        &mut self,
        phase: BuildPhase,
        module: &str,
        priority: i32,
        handler: impl Fn(&HookContext) -> Result<()> + Send + Sync + 'static,
    ) -> HookId {
        let id = HookId(Uuid::new_v4());
        self.hooks.push(Hook {
            id,
            phase,
            module: module.to_string(),
            priority,
            handler: Box::new(handler),
        });
        mlog_debug!("Hook registered: {} at {} (priority {})", module, phase, priority);
        id
    }

    pub fn register_default(
        &mut self,
        phase: BuildPhase,
        module: &str,
        handler: impl Fn(&HookContext) -> Result<()> + Send + Sync + 'static,
    ) -> HookId {
        self.register(phase, module, DEFAULT_HOOK_PRIORITY, handler)
    }

    /// Remove a previously registered hook. Returns whether it existed.
    pub fn unregister(&mut self, id: HookId) -> bool {
        let before = self.hooks.len();
        self.hooks.retain(|h| h.id != id);
        self.hooks.len() < before
    }

    /// Run every hook for a phase in ascending priority order.
    ///
    /// A failing handler is logged and skipped; it never aborts the
    /// remaining hooks or the build. Returns how many handlers ran
    /// cleanly.
    pub fn execute_phase(&self, phase: BuildPhase, context: &HookContext) -> usize {
        let mut hooks: Vec<&Hook> = self.hooks.iter().filter(|h| h.phase == phase).collect();
        // Stable: equal priorities keep registration order.
        hooks.sort_by_key(|h| h.priority);

        let mut succeeded = 0;
        for hook in hooks {
            match (hook.handler)(context) {
                Ok(()) => succeeded += 1,
                Err(e) => {
                    mlog_warn!("Hook {} failed at {}: {} (continuing)", hook.module, phase, e);
                }
            }
        }
        succeeded
    }

    pub fn count(&self, phase: BuildPhase) -> usize {
        self.hooks.iter().filter(|h| h.phase == phase).count()
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Drop every registered hook. Called between sessions.
    pub fn reset(&mut self) {
        self.hooks.clear();
    }
}

/// One feature's place in the lifecycle.
struct FeatureSpec {
    name: &'static str,
    phases: &'static [(BuildPhase, i32)],
}

/// The declarative table of auxiliary features and where they attach.
/// Wiring reads this table against the config's feature flags.
const FEATURES: &[FeatureSpec] = &[
    FeatureSpec {
        name: "progress-reporter",
        phases: &[
            (BuildPhase::BeforeBuild, 10),
            (BuildPhase::AfterTask, 10),
            (BuildPhase::AfterBuild, 10),
        ],
    },
    FeatureSpec {
        name: "cost-tracker",
        phases: &[(BuildPhase::AfterTask, 50), (BuildPhase::AfterBuild, 50)],
    },
    FeatureSpec {
        name: "handoff-notes",
        phases: &[(BuildPhase::OnHandoff, DEFAULT_HOOK_PRIORITY)],
    },
    FeatureSpec {
        name: "error-digest",
        phases: &[
            (BuildPhase::OnTaskError, DEFAULT_HOOK_PRIORITY),
            (BuildPhase::AfterBuild, 200),
        ],
    },
];

fn feature_handler(feature: &'static str, phase: BuildPhase) -> impl Fn(&HookContext) -> Result<()> {
    move |ctx: &HookContext| {
        match (feature, phase) {
            ("progress-reporter", _) => {
                mlog!(
                    "[progress] {}/{} tasks done{}",
                    ctx.completed_tasks,
                    ctx.total_tasks,
                    ctx.task
                        .as_ref()
                        .map(|t| format!(" (last: {})", t.id))
                        .unwrap_or_default()
                );
            }
            ("cost-tracker", _) => {
                if let Some(task) = &ctx.task {
                    mlog!("[cost] task {} ran {} attempt(s)", task.id, task.attempts);
                }
            }
            ("handoff-notes", _) => {
                if let (Some(task), Some(prev)) = (&ctx.task, &ctx.previous_agent) {
                    mlog!("[handoff] {} -> {} at task {}", prev, task.agent, task.id);
                }
            }
            ("error-digest", BuildPhase::OnTaskError) => {
                mlog!(
                    "[errors] task {} failed: {}",
                    ctx.task_id().map(|i| i.to_string()).unwrap_or_default(),
                    ctx.error.as_deref().unwrap_or("unknown")
                );
            }
            ("error-digest", _) => {
                mlog!("[errors] build finished; see failed tasks above");
            }
            _ => {}
        }
        Ok(())
    }
}

/// Register hooks for every enabled feature in the table.
///
/// Unrecognized flag names are warned about and ignored so a stale config
/// entry never blocks a run.
pub fn wire_features(registry: &mut HookRegistry, flags: &BTreeMap<String, bool>) -> usize {
    let mut wired = 0;
    for (name, enabled) in flags {
        let Some(spec) = FEATURES.iter().find(|f| f.name == name) else {
            mlog_warn!("Unrecognized feature flag '{}' ignored", name);
            continue;
        };
        if !*enabled {
            mlog_debug!("Feature {} disabled; not wiring", name);
            continue;
        }
        for (phase, priority) in spec.phases {
            registry.register(*phase, spec.name, *priority, feature_handler(spec.name, *phase));
        }
        wired += 1;
    }
    wired
}

/// Dry-run report of what `wire_features` would do.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WiringSummary {
    pub wired: Vec<String>,
    pub skipped: Vec<String>,
    pub unrecognized: Vec<String>,
}

/// Report which features would be wired, skipped, or are unrecognized,
/// without registering anything.
pub fn wiring_summary(flags: &BTreeMap<String, bool>) -> WiringSummary {
    let mut summary = WiringSummary::default();
    for (name, enabled) in flags {
        if !FEATURES.iter().any(|f| f.name == name) {
            summary.unrecognized.push(name.clone());
        } else if *enabled {
            summary.wired.push(name.clone());
        } else {
            summary.skipped.push(name.clone());
        }
    }
    summary
}
