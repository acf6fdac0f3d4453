//! Git helper for the workspace checkout. Actions shell out to `git` and are
//! single-flight: one action at a time, process-wide.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use agent_console_error::ConsoleError;

use crate::store::{Role, SessionStore};

const MAX_COMMIT_TITLE_CHARS: usize = 72;
const COMMIT_TITLE_PREFIX: &str = "agent:";
const FALLBACK_COMMIT_TITLE: &str = "agent: workspace update";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum VcsAction {
    Sync,
    Submit,
}

impl VcsAction {
    pub fn parse(value: &str) -> Result<Self, ConsoleError> {
        match value {
            "sync" => Ok(Self::Sync),
            "submit" => Ok(Self::Submit),
            other => Err(ConsoleError::InvalidArgument {
                message: format!("unknown vcs action: {other}"),
            }),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Submit => "submit",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct VcsActionResult {
    pub ok: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub command: String,
    pub repo_root: String,
    pub duration_ms: i64,
}

#[derive(Debug)]
struct ActiveAction {
    name: &'static str,
    started: Instant,
}

#[derive(Debug)]
pub struct VcsService {
    workspace_dir: PathBuf,
    store: Arc<SessionStore>,
    active: Mutex<Option<ActiveAction>>,
}

impl VcsService {
    pub fn new(workspace_dir: PathBuf, store: Arc<SessionStore>) -> Self {
        Self {
            workspace_dir,
            store,
            active: Mutex::new(None),
        }
    }

    pub fn run(&self, action: VcsAction) -> Result<VcsActionResult, ConsoleError> {
        let _guard = self.acquire(action)?;
        let repo_root = self.discover_repo()?;
        let started = Instant::now();
        let result = match action {
            VcsAction::Sync => self.sync(&repo_root),
            VcsAction::Submit => self.submit(&repo_root),
        };
        result.map(|mut result| {
            result.duration_ms = started.elapsed().as_millis() as i64;
            result.repo_root = repo_root.display().to_string();
            result
        })
    }

    fn sync(&self, repo_root: &Path) -> Result<VcsActionResult, ConsoleError> {
        run_git(repo_root, &["fetch", "--prune"])
    }

    /// Stage everything and commit with a title derived from the newest
    /// conversation. A clean worktree is an error, not an empty commit.
    fn submit(&self, repo_root: &Path) -> Result<VcsActionResult, ConsoleError> {
        let status = run_git(repo_root, &["status", "--porcelain"])?;
        if !status.ok {
            return Ok(status);
        }
        if status.stdout.trim().is_empty() {
            return Err(ConsoleError::InvalidArgument {
                message: "nothing to submit: working tree is clean".to_string(),
            });
        }
        let staged = run_git(repo_root, &["add", "-A"])?;
        if !staged.ok {
            return Ok(staged);
        }
        let title = self.commit_title();
        run_git(repo_root, &["commit", "-m", &title])
    }

    fn commit_title(&self) -> String {
        let sessions = match self.store.list() {
            Ok(sessions) => sessions,
            Err(_) => return FALLBACK_COMMIT_TITLE.to_string(),
        };
        // Sessions are kept sorted by recency, so the first one is newest.
        let Some(newest) = sessions.first() else {
            return FALLBACK_COMMIT_TITLE.to_string();
        };
        let session = match self.store.get(&newest.id) {
            Ok(session) => session,
            Err(_) => return FALLBACK_COMMIT_TITLE.to_string(),
        };
        let source = session
            .messages
            .iter()
            .rev()
            .find(|message| matches!(message.role, Role::User | Role::Assistant))
            .map(|message| message.content.as_str())
            .unwrap_or("");
        derive_commit_title(source)
    }

    fn discover_repo(&self) -> Result<PathBuf, ConsoleError> {
        let result = run_git(&self.workspace_dir, &["rev-parse", "--show-toplevel"])?;
        let root = result.stdout.trim();
        if !result.ok || root.is_empty() {
            return Err(ConsoleError::InvalidArgument {
                message: format!(
                    "workspace is not a git repository: {}",
                    self.workspace_dir.display()
                ),
            });
        }
        Ok(PathBuf::from(root))
    }

    fn acquire(&self, action: VcsAction) -> Result<ActionSlot<'_>, ConsoleError> {
        let mut active = self.active.lock().unwrap();
        if let Some(current) = active.as_ref() {
            return Err(ConsoleError::Busy {
                action: current.name.to_string(),
                elapsed_seconds: current.started.elapsed().as_secs(),
            });
        }
        *active = Some(ActiveAction {
            name: action.name(),
            started: Instant::now(),
        });
        Ok(ActionSlot { slot: &self.active })
    }
}

struct ActionSlot<'a> {
    slot: &'a Mutex<Option<ActiveAction>>,
}

impl Drop for ActionSlot<'_> {
    fn drop(&mut self) {
        *self.slot.lock().unwrap() = None;
    }
}

fn run_git(directory: &Path, args: &[&str]) -> Result<VcsActionResult, ConsoleError> {
    let output = Command::new("git")
        .arg("-C")
        .arg(directory)
        .args(args)
        .env("GIT_TERMINAL_PROMPT", "0")
        .output()
        .map_err(|err| ConsoleError::Internal {
            message: format!("git execution failed: {err}"),
        })?;
    Ok(VcsActionResult {
        ok: output.status.success(),
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        command: format!("git {}", args.join(" ")),
        repo_root: directory.display().to_string(),
        duration_ms: 0,
    })
}

/// Single line, printable characters only, clamped to 72 chars with the
/// `agent:` prefix included.
pub fn derive_commit_title(source: &str) -> String {
    let cleaned: String = source
        .chars()
        .map(|ch| if ch.is_whitespace() { ' ' } else { ch })
        .filter(|ch| !ch.is_control())
        .collect();
    let cleaned = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    if cleaned.is_empty() {
        return FALLBACK_COMMIT_TITLE.to_string();
    }
    let mut title = format!("{COMMIT_TITLE_PREFIX} {cleaned}");
    if title.chars().count() > MAX_COMMIT_TITLE_CHARS {
        title = title.chars().take(MAX_COMMIT_TITLE_CHARS).collect();
        title = title.trim_end().to_string();
    }
    title
}
