//! Mutable session state persisted to `state.json`.
use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::warn;

use crate::category::Category;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionState {
    pub paused: bool,
    /// Category wire name → sound identifier last played for it.
    pub last_played: BTreeMap<String, String>,
    /// Recent prompt times in ms since the epoch, oldest first.
    pub prompt_timestamps: Vec<i64>,
    pub last_stop_time: i64,
    pub session_start_time: i64,
}

impl SessionState {
    /// Field-by-field merge over the defaults, mirroring [`crate::config::Config::from_value`].
    pub fn from_value(raw: Value) -> Self {
        let mut state = SessionState::default();
        let Value::Object(map) = raw else {
            return state;
        };

        if let Some(v) = map.get("paused").and_then(Value::as_bool) {
            state.paused = v;
        }
        if let Some(Value::Object(played)) = map.get("last_played") {
            state.last_played = played
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect();
        }
        if let Some(Value::Array(stamps)) = map.get("prompt_timestamps") {
            let mut stamps: Vec<i64> = stamps.iter().filter_map(as_millis).collect();
            stamps.sort_unstable();
            state.prompt_timestamps = stamps;
        }
        if let Some(v) = map.get("last_stop_time").and_then(as_millis) {
            state.last_stop_time = v;
        }
        if let Some(v) = map.get("session_start_time").and_then(as_millis) {
            state.session_start_time = v;
        }
        state
    }

    /// Drops prompt timestamps that are `window_ms` or more older than `now`.
    pub fn prune_prompts(&mut self, now: i64, window_ms: i64) {
        self.prompt_timestamps.retain(|&t| now.saturating_sub(t) < window_ms);
    }

    /// Appends `now`, never letting the list go backwards if the clock did.
    pub fn push_prompt(&mut self, now: i64) {
        let stamp = self
            .prompt_timestamps
            .last()
            .map_or(now, |&last| last.max(now));
        self.prompt_timestamps.push(stamp);
    }

    pub fn last_played_for(&self, category: Category) -> Option<&str> {
        self.last_played.get(category.as_str()).map(String::as_str)
    }

    pub fn record_played(&mut self, category: Category, sound_id: &str) {
        self.last_played
            .insert(category.as_str().to_string(), sound_id.to_string());
    }
}

/// Epoch milliseconds; anything negative is not a timestamp soundcue wrote.
fn as_millis(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))
        .filter(|&ms| ms >= 0)
}

/// Loads state from `path`; a missing file is the default state.
pub fn load_or_default(path: &Path) -> Result<SessionState> {
    if !path.exists() {
        return Ok(SessionState::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read state file: {}", path.display()))?;
    let raw: Value = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse state file: {}", path.display()))?;
    Ok(SessionState::from_value(raw))
}

pub fn load(path: &Path) -> SessionState {
    load_or_default(path).unwrap_or_else(|e| {
        warn!("{e:#} (starting fresh)");
        SessionState::default()
    })
}

pub fn save(path: &Path, state: &SessionState) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }
    let mut content = serde_json::to_string_pretty(state).context("Failed to serialize state")?;
    content.push('\n');
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write state file: {}", path.display()))
}

/// [`save`] for the event path, where a failed write must not stop anything.
pub fn save_or_warn(path: &Path, state: &SessionState) {
    if let Err(e) = save(path, state) {
        warn!("{e:#}");
    }
}
