//! Token estimation and account usage reporting scraped from the agent CLI's
//! own on-disk state.

use std::fs;
use std::path::{Path, PathBuf};

use base64::Engine;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

use crate::store::Message;

const TOKEN_COUNT_KEYS: [&str; 3] = ["total_tokens", "token_count", "tokens"];
const TOKEN_USAGE_KEYS: [&str; 4] = ["token_usage", "usage", "total_token_usage", "last_token_usage"];
const TOKEN_PART_KEYS: [&str; 4] = [
    "input_tokens",
    "cached_input_tokens",
    "output_tokens",
    "reasoning_output_tokens",
];

const FIVE_HOUR_WINDOW_MINUTES: i64 = 300;
const WEEKLY_WINDOW_MINUTES: i64 = 10_080;
const MAX_LOG_FILES: usize = 80;

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct RateWindow {
    pub used_percent: Option<f64>,
    pub window_minutes: Option<i64>,
    pub resets_at: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct UsageSummary {
    pub five_hour: Option<RateWindow>,
    pub weekly: Option<RateWindow>,
    pub account_name: String,
}

/// Rough GPT-family approximation: one token per four normalized characters.
pub fn estimate_text_tokens(text: &str) -> u64 {
    let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if normalized.is_empty() {
        return 0;
    }
    ((normalized.chars().count() as u64) + 3) / 4
}

pub fn estimate_message_tokens(message: &Message) -> u64 {
    for key in TOKEN_COUNT_KEYS {
        if let Some(count) = non_negative_int(message.metadata.get(key)) {
            return count;
        }
    }
    for key in TOKEN_USAGE_KEYS {
        if let Some(count) = usage_bag_total(message.metadata.get(key)) {
            return count;
        }
    }
    let mut parts = Vec::new();
    for key in TOKEN_PART_KEYS {
        if let Some(count) = non_negative_int(message.metadata.get(key)) {
            parts.push(count);
        }
    }
    if !parts.is_empty() {
        return parts.iter().sum();
    }
    estimate_text_tokens(&message.content)
}

pub fn estimate_session_tokens(messages: &[Message]) -> u64 {
    messages.iter().map(estimate_message_tokens).sum()
}

fn non_negative_int(value: Option<&Value>) -> Option<u64> {
    let value = value?;
    if value.is_boolean() {
        return None;
    }
    if let Some(number) = value.as_u64() {
        return Some(number);
    }
    let number = value.as_f64().or_else(|| value.as_str()?.parse().ok())?;
    if number.is_finite() && number >= 0.0 {
        Some(number as u64)
    } else {
        None
    }
}

fn usage_bag_total(value: Option<&Value>) -> Option<u64> {
    let bag = value?.as_object()?;
    if let Some(total) = non_negative_int(bag.get("total_tokens")) {
        return Some(total);
    }
    let mut parts = Vec::new();
    for key in TOKEN_PART_KEYS {
        if let Some(count) = non_negative_int(bag.get(key)) {
            parts.push(count);
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.iter().sum())
    }
}

/// Best-effort summary of the account's rate-limit windows, read from the
/// newest session logs under the agent home. Returns an empty summary when
/// the agent has never run here.
pub fn usage_summary(agent_home: &Path) -> UsageSummary {
    let account_name = read_account_name(agent_home);
    let sessions_dir = agent_home.join("sessions");
    let mut summary = UsageSummary {
        five_hour: None,
        weekly: None,
        account_name,
    };
    let mut files = jsonl_files(&sessions_dir);
    files.sort_by_key(|(mtime, _)| std::cmp::Reverse(*mtime));
    for (_, path) in files.into_iter().take(MAX_LOG_FILES) {
        if let Some((five_hour, weekly)) = read_rate_limits(&path) {
            summary.five_hour = five_hour;
            summary.weekly = weekly;
            if summary.five_hour.is_some() || summary.weekly.is_some() {
                return summary;
            }
        }
    }
    summary
}

fn jsonl_files(dir: &Path) -> Vec<(std::time::SystemTime, PathBuf)> {
    let mut files = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let Ok(entries) = fs::read_dir(&current) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().is_some_and(|ext| ext == "jsonl") {
                let mtime = entry
                    .metadata()
                    .and_then(|meta| meta.modified())
                    .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
                files.push((mtime, path));
            }
        }
    }
    files
}

fn read_rate_limits(path: &Path) -> Option<(Option<RateWindow>, Option<RateWindow>)> {
    let raw = fs::read_to_string(path).ok()?;
    // Later records supersede earlier ones within a log; prefer records that
    // show actual usage over empty placeholders.
    let mut best: Option<(bool, Value)> = None;
    for line in raw.lines() {
        if !line.contains("\"rate_limits\"") {
            continue;
        }
        let Ok(payload) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        let Some(rate_limits) = payload.pointer("/payload/rate_limits") else {
            continue;
        };
        let has_usage = window_from(rate_limits.get("primary"))
            .and_then(|window| window.used_percent)
            .unwrap_or(0.0)
            > 0.0
            || window_from(rate_limits.get("secondary"))
                .and_then(|window| window.used_percent)
                .unwrap_or(0.0)
                > 0.0;
        match &best {
            Some((best_usage, _)) if *best_usage && !has_usage => {}
            _ => best = Some((has_usage, rate_limits.clone())),
        }
    }
    let (_, rate_limits) = best?;
    let entries: Vec<RateWindow> = [rate_limits.get("primary"), rate_limits.get("secondary")]
        .into_iter()
        .flatten()
        .filter_map(|entry| window_from(Some(entry)))
        .collect();
    let mut five_hour = entries
        .iter()
        .find(|entry| entry.window_minutes == Some(FIVE_HOUR_WINDOW_MINUTES))
        .cloned();
    let mut weekly = entries
        .iter()
        .find(|entry| entry.window_minutes == Some(WEEKLY_WINDOW_MINUTES))
        .cloned();
    if five_hour.is_none() {
        five_hour = entries.first().cloned();
    }
    if weekly.is_none() && entries.len() > 1 {
        weekly = entries.get(1).cloned();
    }
    Some((five_hour, weekly))
}

fn window_from(value: Option<&Value>) -> Option<RateWindow> {
    let entry = value?.as_object()?;
    let used_percent = entry
        .get("used_percent")
        .and_then(Value::as_f64)
        .map(normalize_used_percent);
    let window_minutes = entry.get("window_minutes").and_then(Value::as_i64);
    let resets_at = entry
        .get("resets_at")
        .and_then(Value::as_str)
        .map(str::to_string);
    Some(RateWindow {
        used_percent,
        window_minutes,
        resets_at,
    })
}

fn normalize_used_percent(value: f64) -> f64 {
    // Some payloads report a 0..1 ratio, others a 0..100 percentage.
    let value = if value > 0.0 && value < 1.0 {
        value * 100.0
    } else {
        value
    };
    value.clamp(0.0, 100.0)
}

fn read_account_name(agent_home: &Path) -> String {
    let Ok(raw) = fs::read_to_string(agent_home.join("auth.json")) else {
        return String::new();
    };
    let Ok(auth) = serde_json::from_str::<Value>(&raw) else {
        return String::new();
    };
    let tokens = auth.get("tokens").cloned().unwrap_or(Value::Null);
    if let Some(id_token) = tokens.get("id_token").and_then(Value::as_str) {
        let claims = decode_jwt_payload(id_token);
        for key in ["name", "email", "preferred_username", "nickname"] {
            if let Some(value) = claims.get(key).and_then(Value::as_str) {
                let value = value.trim();
                if !value.is_empty() {
                    return value.to_string();
                }
            }
        }
    }
    tokens
        .get("account_id")
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default()
        .to_string()
}

fn decode_jwt_payload(token: &str) -> Value {
    let mut parts = token.split('.');
    let payload = match (parts.next(), parts.next()) {
        (Some(_), Some(payload)) => payload,
        _ => return Value::Null,
    };
    let engine = base64::engine::general_purpose::URL_SAFE_NO_PAD;
    match engine
        .decode(payload)
        .ok()
        .and_then(|bytes| serde_json::from_slice::<Value>(&bytes).ok())
    {
        Some(Value::Object(map)) => Value::Object(map),
        _ => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Role;
    use serde_json::{json, Map};

    fn message(content: &str, metadata: Map<String, Value>) -> Message {
        Message {
            id: "m".to_string(),
            role: Role::Assistant,
            content: content.to_string(),
            created_at: String::new(),
            metadata,
        }
    }

    #[test]
    fn text_estimate_rounds_up() {
        assert_eq!(estimate_text_tokens(""), 0);
        assert_eq!(estimate_text_tokens("a"), 1);
        assert_eq!(estimate_text_tokens("abcdefgh"), 2);
        assert_eq!(estimate_text_tokens("  spaced    out  "), 3);
    }

    #[test]
    fn explicit_counts_beat_estimates() {
        let mut metadata = Map::new();
        metadata.insert("total_tokens".to_string(), json!(42));
        assert_eq!(estimate_message_tokens(&message("ignored text", metadata)), 42);
    }

    #[test]
    fn usage_bag_sums_parts() {
        let mut metadata = Map::new();
        metadata.insert(
            "token_usage".to_string(),
            json!({"input_tokens": 10, "output_tokens": 5}),
        );
        assert_eq!(estimate_message_tokens(&message("x", metadata)), 15);
    }

    #[test]
    fn rate_limit_windows_parse_from_log() {
        let dir = tempfile::tempdir().unwrap();
        let sessions = dir.path().join("sessions");
        std::fs::create_dir_all(&sessions).unwrap();
        let line = json!({
            "timestamp": "2026-08-30T10:00:00Z",
            "payload": {"rate_limits": {
                "primary": {"used_percent": 0.25, "window_minutes": 300},
                "secondary": {"used_percent": 12.0, "window_minutes": 10080}
            }}
        });
        std::fs::write(sessions.join("log.jsonl"), format!("{line}\n")).unwrap();
        let summary = usage_summary(dir.path());
        let five_hour = summary.five_hour.expect("five hour window");
        assert_eq!(five_hour.window_minutes, Some(300));
        assert_eq!(five_hour.used_percent, Some(25.0));
        assert_eq!(summary.weekly.unwrap().window_minutes, Some(10080));
    }

    #[test]
    fn missing_agent_home_yields_empty_summary() {
        let summary = usage_summary(Path::new("/nonexistent/agent/home"));
        assert!(summary.five_hour.is_none());
        assert!(summary.account_name.is_empty());
    }
}
