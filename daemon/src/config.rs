use anyhow::{Context, Result};
use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::category::Category;
use crate::event::RelayEvent;

pub const DEFAULT_PACK: &str = "peon";
pub const DEFAULT_VOLUME: f64 = 0.5;
pub const DEFAULT_ANNOYED_THRESHOLD: u32 = 3;
pub const DEFAULT_ANNOYED_WINDOW_SECS: u64 = 10;

/// Where playback and notifications are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayMode {
    /// Forward only when a remote session is detected.
    #[default]
    Auto,
    /// Always play on this machine.
    Local,
    /// Always forward to the relay.
    Relay,
}

impl FromStr for RelayMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(RelayMode::Auto),
            "local" => Ok(RelayMode::Local),
            "relay" => Ok(RelayMode::Relay),
            other => Err(format!("unknown relay mode '{other}'")),
        }
    }
}

impl fmt::Display for RelayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RelayMode::Auto => "auto",
            RelayMode::Local => "local",
            RelayMode::Relay => "relay",
        })
    }
}

/// User settings, stored as `config.json`. Always built through
/// [`Config::from_value`] so that every field falls back to its default
/// independently.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Config {
    /// Identifier of the active sound pack (directory name under `packs/`).
    pub default_pack: String,
    /// Output volume, 0.0–1.0. Backends clamp before use.
    pub volume: f64,
    /// Master switch.
    pub enabled: bool,
    pub desktop_notifications: bool,
    /// Per-category toggles. Categories missing here are enabled.
    pub categories: BTreeMap<Category, bool>,
    /// Prompts within the window needed to escalate to `user.spam`.
    pub annoyed_threshold: u32,
    pub annoyed_window_seconds: u64,
    /// `task.complete` stays silent when the last prompt is younger than
    /// this. 0 disables the check.
    pub silent_window_seconds: u64,
    pub relay_mode: RelayMode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_pack: DEFAULT_PACK.to_string(),
            volume: DEFAULT_VOLUME,
            enabled: true,
            desktop_notifications: true,
            categories: Category::ALL.into_iter().map(|c| (c, true)).collect(),
            annoyed_threshold: DEFAULT_ANNOYED_THRESHOLD,
            annoyed_window_seconds: DEFAULT_ANNOYED_WINDOW_SECS,
            silent_window_seconds: 0,
            relay_mode: RelayMode::Auto,
        }
    }
}

impl Config {
    /// Applies stored JSON over the defaults, field by field. Fields with the
    /// wrong type, unknown keys and unknown categories are ignored.
    pub fn from_value(raw: Value) -> Self {
        let mut config = Config::default();
        let Value::Object(mut map) = raw else {
            return config;
        };
        migrate_legacy_keys(&mut map);

        if let Some(v) = map.get("default_pack").and_then(Value::as_str) {
            config.default_pack = v.to_string();
        }
        if let Some(v) = map.get("volume").and_then(Value::as_f64) {
            config.volume = v;
        }
        if let Some(v) = map.get("enabled").and_then(Value::as_bool) {
            config.enabled = v;
        }
        if let Some(v) = map.get("desktop_notifications").and_then(Value::as_bool) {
            config.desktop_notifications = v;
        }
        if let Some(v) = map.get("annoyed_threshold").and_then(as_whole_number) {
            config.annoyed_threshold = u32::try_from(v).unwrap_or(u32::MAX);
        }
        if let Some(v) = map.get("annoyed_window_seconds").and_then(as_whole_number) {
            config.annoyed_window_seconds = v;
        }
        if let Some(v) = map.get("silent_window_seconds").and_then(as_whole_number) {
            config.silent_window_seconds = v;
        }
        if let Some(mode) = map
            .get("relay_mode")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
        {
            config.relay_mode = mode;
        }
        if let Some(Value::Object(categories)) = map.get("categories") {
            for (key, value) in categories {
                if let (Ok(category), Some(on)) = (key.parse::<Category>(), value.as_bool()) {
                    config.categories.insert(category, on);
                }
            }
        }
        config
    }

    pub fn is_category_enabled(&self, category: Category) -> bool {
        self.categories.get(&category).copied().unwrap_or(true)
    }

    pub fn annoyed_window_ms(&self) -> i64 {
        seconds_to_ms(self.annoyed_window_seconds)
    }

    pub fn silent_window_ms(&self) -> i64 {
        seconds_to_ms(self.silent_window_seconds)
    }
}

/// Moves the pre-rename `active_pack` key to `default_pack`, keeping an
/// existing `default_pack` if both are present.
pub fn migrate_legacy_keys(map: &mut Map<String, Value>) {
    if let Some(old) = map.remove("active_pack") {
        map.entry("default_pack").or_insert(old);
    }
}

/// Accepts non-negative integers and floats (rounded), since hand-edited
/// files sometimes carry `10.0`.
fn as_whole_number(value: &Value) -> Option<u64> {
    value.as_u64().or_else(|| {
        value
            .as_f64()
            .filter(|f| f.is_finite() && *f >= 0.0)
            .map(|f| f.round() as u64)
    })
}

fn seconds_to_ms(secs: u64) -> i64 {
    i64::try_from(secs.saturating_mul(1000)).unwrap_or(i64::MAX)
}

/// Loads the config file at `path`, returning `Config::default()` if the file does not exist.
/// Returns an error if the file exists but cannot be read or is not JSON.
pub fn load_or_default(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let raw: Value = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    Ok(Config::from_value(raw))
}

/// Like [`load_or_default`] but never fails: a broken file yields defaults.
pub fn load(path: &Path) -> Config {
    load_or_default(path).unwrap_or_else(|e| {
        warn!("{e:#} (using defaults)");
        Config::default()
    })
}

/// Writes the whole config as pretty JSON, creating the parent directory.
pub fn save(path: &Path, config: &Config) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }
    let mut content = serde_json::to_string_pretty(config).context("Failed to serialize config")?;
    content.push('\n');
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write config file: {}", path.display()))
}

/// Spawns a file watcher on the parent directory of `path`.  Whenever the config
/// file is created or modified, reloads it and sends a `ConfigReloaded` event.
pub async fn watch_config(path: PathBuf, tx: mpsc::Sender<RelayEvent>) {
    let (watch_tx, mut watch_rx) = mpsc::channel::<notify::Event>(16);

    let mut watcher = match RecommendedWatcher::new(
        move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                let _ = watch_tx.blocking_send(event);
            }
        },
        NotifyConfig::default(),
    ) {
        Ok(w) => w,
        Err(e) => {
            warn!("Failed to create config watcher: {e}");
            return;
        }
    };

    // Watch the parent directory rather than the file directly so we catch
    // editor-style atomic saves (write-new + rename).
    let Some(watch_dir) = path.parent().map(Path::to_path_buf) else {
        warn!("Config path has no parent directory");
        return;
    };

    if let Err(e) = watcher.watch(&watch_dir, RecursiveMode::NonRecursive) {
        warn!("Failed to watch {}: {e}", watch_dir.display());
        return;
    }

    while let Some(event) = watch_rx.recv().await {
        let affects_config = event.paths.iter().any(|p| p == path.as_path());
        let is_write = matches!(
            event.kind,
            notify::EventKind::Create(_) | notify::EventKind::Modify(_)
        );

        if affects_config && is_write {
            match load_or_default(&path) {
                Ok(config) => {
                    info!("Config reloaded");
                    if tx.send(RelayEvent::ConfigReloaded(config)).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!("Failed to reload config: {e:#}"),
            }
        }
    }
}
