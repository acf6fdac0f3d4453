use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    NotFound,
    InvalidArgument,
    AlreadyRunning,
    Busy,
    LaunchFailure,
    Timeout,
    Internal,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::NotFound => "urn:agent-console:error:not_found",
            Self::InvalidArgument => "urn:agent-console:error:invalid_argument",
            Self::AlreadyRunning => "urn:agent-console:error:already_running",
            Self::Busy => "urn:agent-console:error:busy",
            Self::LaunchFailure => "urn:agent-console:error:launch_failure",
            Self::Timeout => "urn:agent-console:error:timeout",
            Self::Internal => "urn:agent-console:error:internal",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::NotFound => "Not Found",
            Self::InvalidArgument => "Invalid Argument",
            Self::AlreadyRunning => "Already Running",
            Self::Busy => "Busy",
            Self::LaunchFailure => "Launch Failure",
            Self::Timeout => "Timeout",
            Self::Internal => "Internal Error",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::NotFound => 404,
            Self::InvalidArgument => 400,
            Self::AlreadyRunning => 409,
            Self::Busy => 409,
            Self::LaunchFailure => 502,
            Self::Timeout => 504,
            Self::Internal => 500,
        }
    }
}

/// RFC 7807 problem document returned on every error response.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            extensions: Map::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConsoleError {
    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },
    #[error("job not found: {job_id}")]
    JobNotFound { job_id: String },
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },
    #[error("a job is already running for session {session_id}")]
    AlreadyRunning { session_id: String, job_id: String },
    #[error("vcs action already running: {action}")]
    Busy { action: String, elapsed_seconds: u64 },
    #[error("failed to launch agent: {message}")]
    LaunchFailure { message: String },
    #[error("agent run timed out")]
    Timeout { message: Option<String> },
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl ConsoleError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::SessionNotFound { .. } | Self::JobNotFound { .. } => ErrorType::NotFound,
            Self::InvalidArgument { .. } => ErrorType::InvalidArgument,
            Self::AlreadyRunning { .. } => ErrorType::AlreadyRunning,
            Self::Busy { .. } => ErrorType::Busy,
            Self::LaunchFailure { .. } => ErrorType::LaunchFailure,
            Self::Timeout { .. } => ErrorType::Timeout,
            Self::Internal { .. } => ErrorType::Internal,
        }
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.to_string()));
        let mut extensions = Map::new();
        match self {
            Self::SessionNotFound { session_id } => {
                extensions.insert("sessionId".to_string(), Value::String(session_id.clone()));
            }
            Self::JobNotFound { job_id } => {
                extensions.insert("jobId".to_string(), Value::String(job_id.clone()));
            }
            Self::AlreadyRunning { session_id, job_id } => {
                extensions.insert("sessionId".to_string(), Value::String(session_id.clone()));
                // Callers are expected to attach to this job instead of retrying.
                extensions.insert("jobId".to_string(), Value::String(job_id.clone()));
            }
            Self::Busy {
                action,
                elapsed_seconds,
            } => {
                extensions.insert("activeAction".to_string(), Value::String(action.clone()));
                extensions.insert(
                    "activeElapsedSeconds".to_string(),
                    Value::Number((*elapsed_seconds).into()),
                );
            }
            Self::Timeout { message } => {
                if let Some(message) = message {
                    extensions.insert("message".to_string(), Value::String(message.clone()));
                }
            }
            Self::InvalidArgument { .. } | Self::LaunchFailure { .. } | Self::Internal { .. } => {}
        }
        problem.extensions = extensions;
        problem
    }
}

impl From<ConsoleError> for ProblemDetails {
    fn from(value: ConsoleError) -> Self {
        value.to_problem_details()
    }
}

impl From<std::io::Error> for ConsoleError {
    fn from(value: std::io::Error) -> Self {
        Self::Internal {
            message: value.to_string(),
        }
    }
}

impl From<serde_json::Error> for ConsoleError {
    fn from(value: serde_json::Error) -> Self {
        Self::Internal {
            message: value.to_string(),
        }
    }
}
