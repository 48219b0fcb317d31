// THEORY:
// The `HookDispatcher` is the side channel through which the outside world hears
// about events. Each lifecycle point has an optional command template; when the
// point is reached, the template is filled in and handed to a `CommandRunner`.
//
// Key principles:
// 1.  **Off the Critical Path**: `dispatch` renders the command, spawns it on the
//     runtime and returns. Detection never waits on a hook, however slow or broken.
// 2.  **Bounded**: Every execution runs under the hook budget. A command that
//     overruns is dropped, which kills the child process.
// 3.  **Failures Are Logged, Never Propagated**: A non-zero exit, a spawn error or
//     a timeout becomes a `HookFault` log record and nothing else.
// 4.  **Ordered Dispatch**: The runner is invoked synchronously inside `dispatch`,
//     so commands are *started* in exactly the order the lifecycle produced them,
//     even though they finish in any order.
//
// Placeholders: `{event_id}`, `{filename}`, `{segment}`, `{timestamp}`,
// `{start_time}`, `{end_time}`. A placeholder with no value in the current
// context renders as an empty string. Values are substituted verbatim.

use chrono::{DateTime, Local};
use futures::future::{BoxFuture, join_all};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::config::{EventConfig, seconds};
use crate::error::{FaultKind, HookError};

const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookName {
    EventStart,
    EventEnd,
    MovieStart,
    MovieEnd,
    PictureTaken,
}

impl HookName {
    pub const ALL: [HookName; 5] = [
        HookName::EventStart,
        HookName::EventEnd,
        HookName::MovieStart,
        HookName::MovieEnd,
        HookName::PictureTaken,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HookName::EventStart => "on_event_start",
            HookName::EventEnd => "on_event_end",
            HookName::MovieStart => "on_movie_start",
            HookName::MovieEnd => "on_movie_end",
            HookName::PictureTaken => "on_picture_taken",
        }
    }

    fn template(&self, config: &EventConfig) -> String {
        match self {
            HookName::EventStart => config.on_event_start.clone(),
            HookName::EventEnd => config.on_event_end.clone(),
            HookName::MovieStart => config.on_movie_start.clone(),
            HookName::MovieEnd => config.on_movie_end.clone(),
            HookName::PictureTaken => config.on_picture_taken.clone(),
        }
    }
}

/// Values available to a hook template.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HookContext {
    pub event_id: Option<u64>,
    pub filename: Option<PathBuf>,
    pub segment: Option<u32>,
    pub timestamp: Option<DateTime<Local>>,
    pub start_time: Option<DateTime<Local>>,
    pub end_time: Option<DateTime<Local>>,
}

impl HookContext {
    /// Fills in every known placeholder in one left-to-right pass, so text that
    /// arrives inside a value is never expanded again. Unknown placeholders are
    /// left as written.
    pub fn render(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let tail = &rest[open..];
            let substituted = tail
                .find('}')
                .and_then(|close| self.value(&tail[1..close]).map(|value| (close, value)));
            match substituted {
                Some((close, value)) => {
                    out.push_str(&value);
                    rest = &tail[close + 1..];
                }
                None => {
                    out.push('{');
                    rest = &tail[1..];
                }
            }
        }
        out.push_str(rest);
        out
    }

    fn value(&self, placeholder: &str) -> Option<String> {
        let time = |t: Option<DateTime<Local>>| t.map(|t| t.format(TIME_FORMAT).to_string()).unwrap_or_default();
        let value = match placeholder {
            "event_id" => self.event_id.map(|id| id.to_string()).unwrap_or_default(),
            "filename" => self.filename.as_ref().map(|p| p.display().to_string()).unwrap_or_default(),
            "segment" => self.segment.map(|s| s.to_string()).unwrap_or_default(),
            "timestamp" => time(self.timestamp),
            "start_time" => time(self.start_time),
            "end_time" => time(self.end_time),
            _ => return None,
        };
        Some(value)
    }
}

/// Executes a rendered hook command.
///
/// `run` is called synchronously by the dispatcher and must only *prepare* the
/// execution; the returned future does the work and is driven on a spawned task.
pub trait CommandRunner: Send + Sync {
    fn run(&self, hook: HookName, command: String) -> BoxFuture<'static, Result<(), HookError>>;
}

/// Runs commands through `sh -c`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellRunner;

impl CommandRunner for ShellRunner {
    fn run(&self, _hook: HookName, command: String) -> BoxFuture<'static, Result<(), HookError>> {
        Box::pin(async move {
            let output = tokio::process::Command::new("sh")
                .arg("-c")
                .arg(&command)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .output()
                .await
                .map_err(HookError::Spawn)?;

            if output.status.success() {
                Ok(())
            } else {
                Err(HookError::Exit {
                    code: output.status.code(),
                    stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                })
            }
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HookStats {
    pub dispatched: u64,
    pub failed: u64,
}

pub struct HookDispatcher {
    templates: HashMap<HookName, String>,
    runner: Arc<dyn CommandRunner>,
    budget: Duration,
    in_flight: Mutex<Vec<JoinHandle<()>>>,
    dispatched: AtomicU64,
    failed: Arc<AtomicU64>,
}

impl HookDispatcher {
    pub fn new(config: &EventConfig, runner: Arc<dyn CommandRunner>) -> Self {
        let templates = HookName::ALL
            .iter()
            .filter_map(|hook| {
                let template = hook.template(config);
                (!template.trim().is_empty()).then_some((*hook, template))
            })
            .collect();
        Self {
            templates,
            runner,
            budget: seconds(config.hook_timeout_seconds),
            in_flight: Mutex::new(Vec::new()),
            dispatched: AtomicU64::new(0),
            failed: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn is_configured(&self, hook: HookName) -> bool {
        self.templates.contains_key(&hook)
    }

    /// Starts the hook in the background. Never waits for it.
    pub fn dispatch(&self, hook: HookName, context: &HookContext) {
        let Some(template) = self.templates.get(&hook) else {
            return;
        };
        let command = context.render(template);
        tracing::debug!(hook = hook.as_str(), event_id = context.event_id, %command, "dispatching hook");

        let work = self.runner.run(hook, command);
        let budget = self.budget;
        let failed = Arc::clone(&self.failed);
        let event_id = context.event_id;
        let handle = tokio::spawn(async move {
            let outcome = match timeout(budget, work).await {
                Ok(result) => result,
                Err(_) => Err(HookError::Timeout(budget.as_secs_f64())),
            };
            if let Err(err) = outcome {
                failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    fault = %FaultKind::HookFault,
                    hook = hook.as_str(),
                    event_id,
                    error = %err,
                    "hook failed"
                );
            }
        });

        self.dispatched.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut in_flight) = self.in_flight.lock() {
            in_flight.retain(|h| !h.is_finished());
            in_flight.push(handle);
        }
    }

    /// Waits for every hook still running. Each is bounded by the hook budget.
    pub async fn shutdown(&self) {
        let pending: Vec<JoinHandle<()>> = match self.in_flight.lock() {
            Ok(mut in_flight) => in_flight.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        if !pending.is_empty() {
            tracing::info!(count = pending.len(), "waiting for running hooks");
        }
        join_all(pending).await;
    }

    pub fn stats(&self) -> HookStats {
        HookStats {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}
