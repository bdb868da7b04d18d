use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

use crate::category::Category;

/// Lifecycle state of the relay daemon.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum RelayState {
    /// Bound and accepting requests.
    Listening,
    /// Shut down cleanly.
    Stopped,
}

/// Runtime status written by the relay daemon to `relay-status.toml`.
/// `soundcue status` reads it to show whether a relay is up on this machine.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RelayStatus {
    /// Binary version (set from Cargo.toml at compile time).
    pub version: String,
    pub state: RelayState,
    /// `host:port` the listener is bound to.
    pub bind_address: String,
    /// Wire name of the most recently played category, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_category: Option<String>,
    /// RFC 3339 timestamp of the most recent request, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_request_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RelayStatus {
    pub fn listening(bind_address: impl Into<String>) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            state: RelayState::Listening,
            bind_address: bind_address.into(),
            last_category: None,
            last_request_time: None,
            error: None,
        }
    }

    /// Records a handled request. Notify requests leave `last_category` as is.
    pub fn record_request(&mut self, category: Option<Category>) {
        if let Some(category) = category {
            self.last_category = Some(category.as_str().to_string());
        }
        self.last_request_time = Some(chrono::Utc::now().to_rfc3339());
    }
}

/// Serializes `status` to TOML and writes it to `path`, creating the parent
/// directory. Failures are logged; a status write never stops the relay.
pub fn write_status(path: &Path, status: &RelayStatus) {
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            warn!("Failed to create directory {}: {e}", parent.display());
            return;
        }
    }
    match toml::to_string_pretty(status) {
        Ok(content) => {
            if let Err(e) = std::fs::write(path, content) {
                warn!("Failed to write status file: {e}");
            }
        }
        Err(e) => warn!("Failed to serialize status: {e}"),
    }
}

/// Reads a status file written by [`write_status`]; `None` if absent or
/// unreadable.
pub fn read_status(path: &Path) -> Option<RelayStatus> {
    let content = std::fs::read_to_string(path).ok()?;
    toml::from_str(&content).ok()
}
