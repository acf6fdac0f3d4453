use std::env;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_AGENT_BIN: &str = "codex";
const DEFAULT_REASONING_OPTIONS: &str = "low,medium,high";

pub const MAX_PROMPT_CHARS: usize = 4000;
pub const CONTEXT_MAX_CHARS: usize = 12000;
pub const MAX_TITLE_CHARS: usize = 80;
pub const MAX_MODEL_CHARS: usize = 80;
pub const MAX_REASONING_CHARS: usize = 40;

pub const EXEC_TIMEOUT: Duration = Duration::from_secs(600);
pub const JOB_RETENTION: Duration = Duration::from_secs(900);

/// Runtime configuration, resolved once at startup from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory the agent process runs in; also holds the store document.
    pub workspace_dir: PathBuf,
    pub store_path: PathBuf,
    pub settings_path: PathBuf,
    /// External agent CLI binary and the fixed arguments of its exec mode.
    pub agent_bin: String,
    pub agent_args: Vec<String>,
    /// The agent's own home directory (config.toml, auth.json, session logs).
    pub agent_home: PathBuf,
    pub skip_repo_check: bool,
    pub context_max_chars: usize,
    pub exec_timeout: Duration,
    pub job_retention: Duration,
    pub model_options: Vec<String>,
    pub reasoning_options: Vec<String>,
}

impl Config {
    pub fn from_env() -> Self {
        let workspace_dir = env::var("AGENT_CONSOLE_WORKSPACE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("workspace"));
        Self::for_workspace(workspace_dir)
    }

    pub fn for_workspace(workspace_dir: PathBuf) -> Self {
        let store_path = workspace_dir.join("chat_sessions.json");
        let settings_path = workspace_dir.join("agent_settings.json");
        let agent_bin =
            env::var("AGENT_CONSOLE_AGENT_BIN").unwrap_or_else(|_| DEFAULT_AGENT_BIN.to_string());
        let agent_home = env::var("AGENT_CONSOLE_AGENT_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::home_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(".codex")
            });
        let skip_repo_check = env::var("AGENT_CONSOLE_SKIP_REPO_CHECK")
            .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE"))
            .unwrap_or(true);
        Self {
            workspace_dir,
            store_path,
            settings_path,
            agent_bin,
            agent_args: vec![
                "exec".to_string(),
                "--full-auto".to_string(),
                "--color".to_string(),
                "never".to_string(),
            ],
            agent_home,
            skip_repo_check,
            context_max_chars: CONTEXT_MAX_CHARS,
            exec_timeout: EXEC_TIMEOUT,
            job_retention: JOB_RETENTION,
            model_options: options_from_env("AGENT_CONSOLE_MODEL_OPTIONS", ""),
            reasoning_options: options_from_env(
                "AGENT_CONSOLE_REASONING_OPTIONS",
                DEFAULT_REASONING_OPTIONS,
            ),
        }
    }
}

fn options_from_env(key: &str, default: &str) -> Vec<String> {
    let raw = env::var(key).unwrap_or_else(|_| default.to_string());
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspace_config_derives_paths() {
        let config = Config::for_workspace(PathBuf::from("/tmp/ws"));
        assert_eq!(config.store_path, PathBuf::from("/tmp/ws/chat_sessions.json"));
        assert_eq!(
            config.settings_path,
            PathBuf::from("/tmp/ws/agent_settings.json")
        );
        assert!(!config.reasoning_options.is_empty());
    }
}
