//! Durable session store: the whole conversation collection is one JSON
//! document, rewritten atomically on every mutation.

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{SecondsFormat, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use utoipa::ToSchema;
use uuid::Uuid;

use agent_console_error::ConsoleError;

use crate::config::MAX_TITLE_CHARS;
use crate::usage;

pub const DEFAULT_TITLE: &str = "New session";
const DERIVED_TITLE_CHARS: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Error,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
            Self::Error => "error",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::User => "User",
            Self::Assistant => "Assistant",
            Self::System => "System",
            Self::Error => "Error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub created_at: String,
    /// Extra fields (e.g. duration_ms, token counts) stored alongside the
    /// message rather than nested under a metadata key.
    #[serde(flatten)]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct Session {
    pub id: String,
    pub title: String,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct SessionSummary {
    pub id: String,
    pub title: String,
    pub created_at: String,
    pub updated_at: String,
    pub message_count: usize,
    pub token_count: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreDocument {
    #[serde(default)]
    sessions: Vec<Session>,
}

/// Single-writer store. Every operation takes the lock, loads the document,
/// mutates it in memory, and rewrites it as one unit, so concurrent mutations
/// are fully serialized and readers always see a consistent snapshot.
#[derive(Debug)]
pub struct SessionStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl SessionStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    pub fn list(&self) -> Result<Vec<SessionSummary>, ConsoleError> {
        let _guard = self.lock.lock().unwrap();
        let document = self.load();
        Ok(document
            .sessions
            .iter()
            .map(|session| SessionSummary {
                id: session.id.clone(),
                title: if session.title.is_empty() {
                    DEFAULT_TITLE.to_string()
                } else {
                    session.title.clone()
                },
                created_at: session.created_at.clone(),
                updated_at: session.updated_at.clone(),
                message_count: session.messages.len(),
                token_count: usage::estimate_session_tokens(&session.messages),
            })
            .collect())
    }

    pub fn get(&self, session_id: &str) -> Result<Session, ConsoleError> {
        let _guard = self.lock.lock().unwrap();
        let document = self.load();
        document
            .sessions
            .iter()
            .find(|session| session.id == session_id)
            .cloned()
            .ok_or_else(|| ConsoleError::SessionNotFound {
                session_id: session_id.to_string(),
            })
    }

    pub fn create(&self, title: Option<&str>) -> Result<Session, ConsoleError> {
        let now = now_timestamp();
        let title = title.map(str::trim).filter(|t| !t.is_empty());
        let session = Session {
            id: new_id(),
            title: title.unwrap_or(DEFAULT_TITLE).to_string(),
            created_at: now.clone(),
            updated_at: now,
            messages: Vec::new(),
        };
        let _guard = self.lock.lock().unwrap();
        let mut document = self.load();
        document.sessions.push(session.clone());
        sort_sessions(&mut document.sessions);
        self.persist(&document)?;
        Ok(session)
    }

    pub fn rename(&self, session_id: &str, title: &str) -> Result<Session, ConsoleError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(ConsoleError::InvalidArgument {
                message: "session title must not be empty".to_string(),
            });
        }
        if title.chars().count() > MAX_TITLE_CHARS {
            return Err(ConsoleError::InvalidArgument {
                message: format!("session title exceeds {MAX_TITLE_CHARS} characters"),
            });
        }
        let _guard = self.lock.lock().unwrap();
        let mut document = self.load();
        let session = find_session_mut(&mut document.sessions, session_id)?;
        session.title = title.to_string();
        session.updated_at = now_timestamp();
        let session = session.clone();
        sort_sessions(&mut document.sessions);
        self.persist(&document)?;
        Ok(session)
    }

    pub fn delete(&self, session_id: &str) -> Result<(), ConsoleError> {
        let _guard = self.lock.lock().unwrap();
        let mut document = self.load();
        let before = document.sessions.len();
        document.sessions.retain(|session| session.id != session_id);
        if document.sessions.len() == before {
            return Err(ConsoleError::SessionNotFound {
                session_id: session_id.to_string(),
            });
        }
        self.persist(&document)?;
        Ok(())
    }

    pub fn append_message(
        &self,
        session_id: &str,
        role: Role,
        content: &str,
        metadata: Option<Map<String, Value>>,
    ) -> Result<Message, ConsoleError> {
        let mut message = Message {
            id: new_id(),
            role,
            content: content.to_string(),
            created_at: now_timestamp(),
            metadata: Map::new(),
        };
        if let Some(metadata) = metadata {
            for (key, value) in metadata {
                // Reserved field names stay authoritative.
                if matches!(key.as_str(), "id" | "role" | "content" | "created_at") {
                    continue;
                }
                message.metadata.insert(key, value);
            }
        }
        let _guard = self.lock.lock().unwrap();
        let mut document = self.load();
        let session = find_session_mut(&mut document.sessions, session_id)?;
        session.messages.push(message.clone());
        session.updated_at = now_timestamp();
        sort_sessions(&mut document.sessions);
        self.persist(&document)?;
        Ok(message)
    }

    /// Set a derived title from the first prompt, exactly once: a session with
    /// a custom title or any user-authored message is left alone.
    pub fn ensure_default_title(
        &self,
        session_id: &str,
        prompt: &str,
    ) -> Result<Session, ConsoleError> {
        let _guard = self.lock.lock().unwrap();
        let mut document = self.load();
        let session = find_session_mut(&mut document.sessions, session_id)?;
        let has_custom_title = !session.title.trim().is_empty() && session.title != DEFAULT_TITLE;
        let has_user_message = session
            .messages
            .iter()
            .any(|message| message.role == Role::User);
        if has_custom_title || has_user_message {
            return Ok(session.clone());
        }
        session.title = derive_title(prompt);
        session.updated_at = now_timestamp();
        let session = session.clone();
        sort_sessions(&mut document.sessions);
        self.persist(&document)?;
        Ok(session)
    }

    fn load(&self) -> StoreDocument {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(_) => return StoreDocument::default(),
        };
        match serde_json::from_str(&raw) {
            Ok(document) => document,
            Err(err) => {
                tracing::warn!(path = %self.path.display(), error = %err, "store document unreadable, starting empty");
                StoreDocument::default()
            }
        }
    }

    fn persist(&self, document: &StoreDocument) -> Result<(), ConsoleError> {
        let content = serde_json::to_string_pretty(document)?;
        let dir = self.path.parent().unwrap_or_else(|| std::path::Path::new("."));
        fs::create_dir_all(dir)?;
        // Write the whole document to a sibling temp file and rename it into
        // place so a failed write never leaves a half-written store visible.
        let mut file = tempfile::NamedTempFile::new_in(dir)?;
        file.write_all(content.as_bytes())?;
        file.persist(&self.path)
            .map_err(|err| ConsoleError::from(err.error))?;
        Ok(())
    }
}

fn find_session_mut<'a>(
    sessions: &'a mut [Session],
    session_id: &str,
) -> Result<&'a mut Session, ConsoleError> {
    sessions
        .iter_mut()
        .find(|session| session.id == session_id)
        .ok_or_else(|| ConsoleError::SessionNotFound {
            session_id: session_id.to_string(),
        })
}

fn sort_sessions(sessions: &mut [Session]) {
    sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
}

pub fn derive_title(prompt: &str) -> String {
    let normalized = prompt.split_whitespace().collect::<Vec<_>>().join(" ");
    if normalized.is_empty() {
        return DEFAULT_TITLE.to_string();
    }
    if normalized.chars().count() > DERIVED_TITLE_CHARS {
        let head: String = normalized.chars().take(DERIVED_TITLE_CHARS).collect();
        format!("{head}...")
    } else {
        normalized
    }
}

fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}
