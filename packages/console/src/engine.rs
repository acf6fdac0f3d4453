//! Streaming execution engine: spawns the external agent process, pumps its
//! output into append-only buffers, and commits the finished transcript to
//! the session store exactly once.
//!
//! One lock guards the job table. Store calls are never made while it is
//! held, so the store lock and the job-table lock cannot deadlock. Every
//! terminal transition (process exit, stop, launch failure) is a guarded
//! compare-and-set on the `saved` flag under the job-table lock.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Map;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;
use utoipa::ToSchema;
use uuid::Uuid;

use agent_console_error::ConsoleError;

use crate::config::Config;
use crate::context;
use crate::settings::{escape_toml_string, SettingsService};
use crate::store::{Message, Role, SessionStore};

/// Exit code recorded when the agent command cannot be launched.
pub const LAUNCH_FAILURE_EXIT_CODE: i32 = 127;
/// Exit code recorded when the user stops a job.
pub const CANCEL_EXIT_CODE: i32 = 130;

const MONITOR_INTERVAL: Duration = Duration::from_millis(100);
const STOP_MARKER: &str = "[stopped by user]";
const STOPPED_EMPTY_TEXT: &str = "Stopped by user.";
const GENERIC_FAILURE_TEXT: &str = "Agent run failed.";

#[derive(Debug)]
struct Job {
    session_id: String,
    output: String,
    error: String,
    done: bool,
    cancelled: bool,
    saved: bool,
    exit_code: Option<i32>,
    child: Option<tokio::process::Child>,
    created_at_ms: i64,
    updated_at_ms: i64,
}

impl Job {
    fn new(session_id: String) -> Self {
        let now = now_ms();
        Self {
            session_id,
            output: String::new(),
            error: String::new(),
            done: false,
            cancelled: false,
            saved: false,
            exit_code: None,
            child: None,
            created_at_ms: now,
            updated_at_ms: now,
        }
    }

    fn active(&self) -> bool {
        !self.done && !self.cancelled
    }

    fn touch(&mut self) {
        self.updated_at_ms = now_ms();
    }

    fn duration_ms(&self) -> i64 {
        (self.updated_at_ms - self.created_at_ms).max(0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct StartTurnResponse {
    pub job_id: String,
    pub user_message: Message,
}

/// Incremental view of a job. Offsets and lengths are character counts.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct PollResponse {
    pub output: String,
    pub error: String,
    pub output_length: usize,
    pub error_length: usize,
    pub done: bool,
    pub exit_code: Option<i32>,
    pub saved: bool,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub saved_message: Option<Message>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct JobSummary {
    pub id: String,
    pub session_id: String,
    pub done: bool,
    pub cancelled: bool,
    pub output_length: usize,
    pub error_length: usize,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StopStatus {
    Stopped,
    AlreadyCancelled,
    AlreadyFinished,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct StopResponse {
    pub status: StopStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub saved_message: Option<Message>,
}

/// Outcome of the synchronous (non-streaming) execution path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecOutcome {
    Success(String),
    Failure(String),
}

#[derive(Debug, Clone, Copy)]
enum StreamKind {
    Output,
    Error,
}

#[derive(Debug)]
pub struct StreamEngine {
    jobs: Mutex<HashMap<String, Job>>,
    store: Arc<SessionStore>,
    settings: Arc<SettingsService>,
    config: Config,
}

impl StreamEngine {
    pub fn new(store: Arc<SessionStore>, settings: Arc<SettingsService>, config: Config) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            store,
            settings,
            config,
        }
    }

    /// Begin a streaming turn: reject if the conversation already has an
    /// active job (returning that job's id), persist the user message, and
    /// launch the agent process in the background.
    pub async fn start_turn(
        self: &Arc<Self>,
        session_id: &str,
        prompt: &str,
    ) -> Result<StartTurnResponse, ConsoleError> {
        let session = self.store.get(session_id)?;
        let job_id = new_id();
        {
            let mut jobs = self.jobs.lock().await;
            if let Some((active_id, _)) = jobs
                .iter()
                .find(|(_, job)| job.session_id == session_id && job.active())
            {
                return Err(ConsoleError::AlreadyRunning {
                    session_id: session_id.to_string(),
                    job_id: active_id.clone(),
                });
            }
            jobs.insert(job_id.clone(), Job::new(session_id.to_string()));
        }

        let payload = context::build_agent_prompt(
            &session.messages,
            prompt,
            self.config.context_max_chars,
        );
        let user_message = match self
            .store
            .ensure_default_title(session_id, prompt)
            .and_then(|_| self.store.append_message(session_id, Role::User, prompt, None))
        {
            Ok(message) => message,
            Err(err) => {
                self.jobs.lock().await.remove(&job_id);
                return Err(err);
            }
        };

        let engine = Arc::clone(self);
        let run_id = job_id.clone();
        tokio::spawn(async move {
            engine.run_job(run_id, payload).await;
        });
        Ok(StartTurnResponse {
            job_id,
            user_message,
        })
    }

    async fn run_job(self: Arc<Self>, job_id: String, payload: String) {
        let _ = std::fs::create_dir_all(&self.config.workspace_dir);
        let mut command = self.build_command(&payload, None);
        command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .current_dir(&self.config.workspace_dir);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                {
                    let mut jobs = self.jobs.lock().await;
                    if let Some(job) = jobs.get_mut(&job_id) {
                        job.error
                            .push_str(&format!("failed to launch agent command: {err}\n"));
                        job.done = true;
                        job.exit_code = Some(LAUNCH_FAILURE_EXIT_CODE);
                        job.touch();
                    }
                }
                if let Err(err) = self.finalize(&job_id).await {
                    tracing::warn!(job_id = %job_id, error = %err, "failed to finalize unlaunchable job");
                }
                return;
            }
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        {
            let mut jobs = self.jobs.lock().await;
            match jobs.get_mut(&job_id) {
                Some(job) => {
                    if job.cancelled {
                        let _ = child.start_kill();
                    }
                    job.child = Some(child);
                }
                None => {
                    let _ = child.start_kill();
                    return;
                }
            }
        }
        let mut pumps = Vec::new();
        if let Some(stdout) = stdout {
            pumps.push(self.spawn_pump(job_id.clone(), stdout, StreamKind::Output));
        }
        if let Some(stderr) = stderr {
            pumps.push(self.spawn_pump(job_id.clone(), stderr, StreamKind::Error));
        }
        self.monitor(job_id, pumps).await;
    }

    fn spawn_pump<R>(
        self: &Arc<Self>,
        job_id: String,
        reader: R,
        kind: StreamKind,
    ) -> tokio::task::JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let mut jobs = engine.jobs.lock().await;
                let Some(job) = jobs.get_mut(&job_id) else {
                    return;
                };
                // Chunks arriving after cancellation are dropped, not buffered.
                if job.cancelled {
                    continue;
                }
                let buffer = match kind {
                    StreamKind::Output => &mut job.output,
                    StreamKind::Error => &mut job.error,
                };
                buffer.push_str(&line);
                buffer.push('\n');
                job.touch();
            }
        })
    }

    async fn monitor(self: Arc<Self>, job_id: String, pumps: Vec<tokio::task::JoinHandle<()>>) {
        let exit_code = loop {
            tokio::time::sleep(MONITOR_INTERVAL).await;
            let mut jobs = self.jobs.lock().await;
            let Some(job) = jobs.get_mut(&job_id) else {
                return;
            };
            if job.saved {
                // The stop path already finalized this job.
                job.child = None;
                return;
            }
            match job.child.as_mut() {
                Some(child) => match child.try_wait() {
                    Ok(Some(status)) => {
                        job.child = None;
                        break status.code().unwrap_or(-1);
                    }
                    Ok(None) => {}
                    Err(err) => {
                        tracing::warn!(job_id = %job_id, error = %err, "failed to poll agent process");
                        job.child = None;
                        break -1;
                    }
                },
                None => return,
            }
        };

        // The pipes are closed once the process exits; drain both pump tasks
        // so the buffers hold the complete streams before the job goes done.
        for pump in pumps {
            let _ = pump.await;
        }

        {
            let mut jobs = self.jobs.lock().await;
            let Some(job) = jobs.get_mut(&job_id) else {
                return;
            };
            if job.saved {
                return;
            }
            job.done = true;
            job.exit_code = Some(exit_code);
            job.touch();
        }
        if let Err(err) = self.finalize(&job_id).await {
            tracing::warn!(job_id = %job_id, error = %err, "failed to finalize completed job");
        }
    }

    /// Read buffered output past the given character offsets. Offsets beyond
    /// the buffer yield empty suffixes; bytes already returned never change.
    pub async fn poll(
        &self,
        job_id: &str,
        output_offset: usize,
        error_offset: usize,
    ) -> Result<PollResponse, ConsoleError> {
        let jobs = self.jobs.lock().await;
        let job = jobs.get(job_id).ok_or_else(|| ConsoleError::JobNotFound {
            job_id: job_id.to_string(),
        })?;
        Ok(PollResponse {
            output: suffix_from(&job.output, output_offset),
            error: suffix_from(&job.error, error_offset),
            output_length: job.output.chars().count(),
            error_length: job.error.chars().count(),
            done: job.done,
            exit_code: job.exit_code,
            saved: job.saved,
            session_id: job.session_id.clone(),
            saved_message: None,
        })
    }

    /// Commit a finished job's transcript to the conversation, exactly once.
    /// Not-done and already-saved jobs (and unknown ids) are a quiet no-op so
    /// that any number of pollers can race to call this.
    pub async fn finalize(&self, job_id: &str) -> Result<Option<Message>, ConsoleError> {
        let (session_id, output, error, exit_code, duration_ms) = {
            let mut jobs = self.jobs.lock().await;
            let Some(job) = jobs.get_mut(job_id) else {
                return Ok(None);
            };
            if !job.done || job.saved {
                return Ok(None);
            }
            job.saved = true;
            (
                job.session_id.clone(),
                job.output.trim().to_string(),
                job.error.trim().to_string(),
                job.exit_code,
                job.duration_ms(),
            )
        };

        let metadata = duration_metadata(duration_ms);
        let result = if exit_code == Some(0) {
            self.store
                .append_message(&session_id, Role::Assistant, &output, Some(metadata))
        } else {
            let text = if !error.is_empty() {
                error
            } else if !output.is_empty() {
                output
            } else {
                GENERIC_FAILURE_TEXT.to_string()
            };
            self.store
                .append_message(&session_id, Role::Error, &text, Some(metadata))
        };
        match result {
            Ok(message) => Ok(Some(message)),
            Err(ConsoleError::SessionNotFound { session_id }) => {
                tracing::warn!(job_id = %job_id, session_id = %session_id, "conversation deleted before finalize");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Cancel a running job. The terminal transition happens in one critical
    /// section so the process-exit path can never finalize the same job.
    pub async fn stop(&self, job_id: &str) -> Result<StopResponse, ConsoleError> {
        let (session_id, output, error, duration_ms) = {
            let mut jobs = self.jobs.lock().await;
            let job = jobs.get_mut(job_id).ok_or_else(|| ConsoleError::JobNotFound {
                job_id: job_id.to_string(),
            })?;
            if job.cancelled {
                return Ok(StopResponse {
                    status: StopStatus::AlreadyCancelled,
                    saved_message: None,
                });
            }
            if job.saved {
                return Ok(StopResponse {
                    status: StopStatus::AlreadyFinished,
                    saved_message: None,
                });
            }
            job.cancelled = true;
            job.done = true;
            job.saved = true;
            job.exit_code = Some(CANCEL_EXIT_CODE);
            job.touch();
            if let Some(child) = job.child.as_mut() {
                // Best effort; stop never waits for the process to exit.
                let _ = child.start_kill();
            }
            (
                job.session_id.clone(),
                job.output.trim().to_string(),
                job.error.trim().to_string(),
                job.duration_ms(),
            )
        };

        let text = match (output.is_empty(), error.is_empty()) {
            (true, true) => STOPPED_EMPTY_TEXT.to_string(),
            (false, true) => format!("{output}\n\n{STOP_MARKER}"),
            (true, false) => format!("{error}\n\n{STOP_MARKER}"),
            (false, false) => format!("{output}\n{error}\n\n{STOP_MARKER}"),
        };
        let metadata = duration_metadata(duration_ms);
        let saved_message = match self
            .store
            .append_message(&session_id, Role::Error, &text, Some(metadata))
        {
            Ok(message) => Some(message),
            Err(ConsoleError::SessionNotFound { .. }) => None,
            Err(err) => return Err(err),
        };
        Ok(StopResponse {
            status: StopStatus::Stopped,
            saved_message,
        })
    }

    pub async fn list_jobs(&self, include_done: bool) -> Vec<JobSummary> {
        let jobs = self.jobs.lock().await;
        let mut summaries: Vec<JobSummary> = jobs
            .iter()
            .filter(|(_, job)| include_done || job.active())
            .map(|(id, job)| JobSummary {
                id: id.clone(),
                session_id: job.session_id.clone(),
                done: job.done,
                cancelled: job.cancelled,
                output_length: job.output.chars().count(),
                error_length: job.error.chars().count(),
                created_at: job.created_at_ms,
                updated_at: job.updated_at_ms,
            })
            .collect();
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        summaries
    }

    pub async fn active_job_id(&self, session_id: &str) -> Option<String> {
        let jobs = self.jobs.lock().await;
        jobs.iter()
            .find(|(_, job)| job.session_id == session_id && job.active())
            .map(|(id, _)| id.clone())
    }

    /// Evict jobs that finished longer than the retention window ago.
    pub async fn reap(&self) -> usize {
        let now = now_ms();
        let retention = self.config.job_retention.as_millis() as i64;
        let mut jobs = self.jobs.lock().await;
        let before = jobs.len();
        jobs.retain(|_, job| !(job.done && now - job.updated_at_ms > retention));
        let evicted = before - jobs.len();
        if evicted > 0 {
            tracing::debug!(evicted, "evicted retention-expired jobs");
        }
        evicted
    }

    /// Synchronous path: run the agent to completion under a hard wall-clock
    /// timeout. A nonzero exit is a `Failure` outcome; a timeout or a command
    /// that never launched is a `ConsoleError`. Hitting the timeout kills the
    /// agent process, it must not keep mutating the workspace.
    pub async fn execute_once(&self, payload: &str) -> Result<ExecOutcome, ConsoleError> {
        let _ = std::fs::create_dir_all(&self.config.workspace_dir);
        let output_path = self
            .config
            .workspace_dir
            .join(format!("agent_output_{}.txt", new_id()));
        let mut command = self.build_command(payload, Some(&output_path));
        command.current_dir(&self.config.workspace_dir);
        command.kill_on_drop(true);

        let result = tokio::time::timeout(self.config.exec_timeout, command.output()).await;
        let output = match result {
            Err(_) => {
                let _ = std::fs::remove_file(&output_path);
                return Err(ConsoleError::Timeout {
                    message: Some(format!(
                        "agent run timed out after {} seconds",
                        self.config.exec_timeout.as_secs()
                    )),
                });
            }
            Ok(Err(err)) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConsoleError::LaunchFailure {
                    message: format!("agent command not found: {}", self.config.agent_bin),
                });
            }
            Ok(Err(err)) => {
                return Err(ConsoleError::LaunchFailure {
                    message: err.to_string(),
                });
            }
            Ok(Ok(output)) => output,
        };

        let mut text = std::fs::read_to_string(&output_path)
            .map(|content| content.trim().to_string())
            .unwrap_or_default();
        let _ = std::fs::remove_file(&output_path);
        if text.is_empty() {
            text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let message = if !stderr.is_empty() {
                stderr
            } else if !text.is_empty() {
                text
            } else {
                GENERIC_FAILURE_TEXT.to_string()
            };
            return Ok(ExecOutcome::Failure(message));
        }
        Ok(ExecOutcome::Success(text))
    }

    fn build_command(&self, payload: &str, output_path: Option<&Path>) -> Command {
        let settings = self.settings.get();
        let mut command = Command::new(&self.config.agent_bin);
        command.args(&self.config.agent_args);
        if self.config.skip_repo_check {
            command.arg("--skip-git-repo-check");
        }
        if let Some(model) = settings.model {
            command.arg("--model").arg(model);
        }
        if let Some(reasoning) = settings.reasoning_effort {
            command.arg("--config").arg(format!(
                "model_reasoning_effort=\"{}\"",
                escape_toml_string(&reasoning)
            ));
        }
        if let Some(path) = output_path {
            command.arg("--output-last-message").arg(path);
        }
        command.arg(payload);
        command
    }
}

fn suffix_from(buffer: &str, offset: usize) -> String {
    buffer.chars().skip(offset).collect()
}

fn duration_metadata(duration_ms: i64) -> Map<String, serde_json::Value> {
    let mut metadata = Map::new();
    metadata.insert("duration_ms".to_string(), duration_ms.into());
    metadata
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}
