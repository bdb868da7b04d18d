//! Local-vs-remote routing and the HTTP client side of the relay protocol.
//!
//! When the agent runs over SSH or inside a container, the machine with the
//! speakers is elsewhere. A relay (`soundcue relay`) runs there, and play and
//! notify requests are forwarded to it instead of being executed here.
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tracing::debug;

use crate::category::Category;
use crate::config::RelayMode;

pub const RELAY_URL_VAR: &str = "SOUNDCUE_RELAY_URL";
pub const RELAY_HOST_VAR: &str = "SOUNDCUE_RELAY_HOST";
pub const RELAY_PORT_VAR: &str = "SOUNDCUE_RELAY_PORT";

pub const DEFAULT_RELAY_PORT: u16 = 19998;
pub const DEFAULT_RELAY_HOST: &str = "127.0.0.1";
/// How containers reach the host they run on.
pub const CONTAINER_GATEWAY_HOST: &str = "host.docker.internal";

const CODESPACES_VARS: [&str; 1] = ["CODESPACES"];
const DEVCONTAINER_VARS: [&str; 1] = ["REMOTE_CONTAINERS"];
const SSH_VARS: [&str; 3] = ["SSH_CONNECTION", "SSH_TTY", "SSH_CLIENT"];

const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Ssh,
    Devcontainer,
    Codespaces,
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionKind::Ssh => "ssh",
            SessionKind::Devcontainer => "devcontainer",
            SessionKind::Codespaces => "codespaces",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSession {
    pub kind: SessionKind,
    pub relay_url: String,
}

/// Where a play or notify call goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Local,
    /// Base URL of the relay, without a trailing slash.
    Remote(String),
}

/// Snapshot of the environment variables relay routing looks at. Take a
/// fresh one per decision; the host process may outlive an environment
/// change.
#[derive(Debug, Clone, Default)]
pub struct RelayEnv {
    vars: HashMap<String, String>,
}

impl RelayEnv {
    pub fn from_process() -> Self {
        let keys = [RELAY_URL_VAR, RELAY_HOST_VAR, RELAY_PORT_VAR]
            .into_iter()
            .chain(CODESPACES_VARS)
            .chain(DEVCONTAINER_VARS)
            .chain(SSH_VARS);
        Self::from_pairs(keys.filter_map(|k| std::env::var(k).ok().map(|v| (k, v))))
    }

    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Value of `key`; empty strings count as unset.
    pub fn var(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    fn any(&self, keys: &[&str]) -> bool {
        keys.iter().any(|k| self.var(k).is_some())
    }

    fn port(&self) -> u16 {
        match self.var(RELAY_PORT_VAR) {
            None => DEFAULT_RELAY_PORT,
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                debug!("Ignoring invalid {RELAY_PORT_VAR}={raw}");
                DEFAULT_RELAY_PORT
            }),
        }
    }

    fn url_for(&self, default_host: &str) -> String {
        let host = self.var(RELAY_HOST_VAR).unwrap_or(default_host);
        format!("http://{host}:{}", self.port())
    }

    fn explicit_url(&self) -> Option<String> {
        self.var(RELAY_URL_VAR)
            .map(|u| u.trim_end_matches('/').to_string())
    }
}

/// Session kind from environment signals alone; containers win over SSH.
pub fn detect_session_kind(env: &RelayEnv) -> Option<SessionKind> {
    if env.any(&CODESPACES_VARS) {
        Some(SessionKind::Codespaces)
    } else if env.any(&DEVCONTAINER_VARS) {
        Some(SessionKind::Devcontainer)
    } else if env.any(&SSH_VARS) {
        Some(SessionKind::Ssh)
    } else {
        None
    }
}

pub fn detect_remote_session(env: &RelayEnv) -> Option<RemoteSession> {
    if let Some(relay_url) = env.explicit_url() {
        let kind = detect_session_kind(env).unwrap_or(SessionKind::Ssh);
        return Some(RemoteSession { kind, relay_url });
    }
    let kind = detect_session_kind(env)?;
    let default_host = match kind {
        SessionKind::Codespaces | SessionKind::Devcontainer => CONTAINER_GATEWAY_HOST,
        SessionKind::Ssh => DEFAULT_RELAY_HOST,
    };
    Some(RemoteSession {
        kind,
        relay_url: env.url_for(default_host),
    })
}

pub fn resolve_target(mode: RelayMode, env: &RelayEnv) -> Target {
    match mode {
        RelayMode::Local => Target::Local,
        RelayMode::Relay => Target::Remote(configured_relay_url(env)),
        RelayMode::Auto => match detect_remote_session(env) {
            Some(session) => Target::Remote(session.relay_url),
            None => Target::Local,
        },
    }
}

/// The relay the environment points at, ignoring session detection.
pub fn configured_relay_url(env: &RelayEnv) -> String {
    env.explicit_url()
        .unwrap_or_else(|| env.url_for(DEFAULT_RELAY_HOST))
}

pub fn setup_instructions(kind: SessionKind) -> String {
    match kind {
        SessionKind::Ssh => format!(
            "Run 'soundcue relay' on your local machine, then connect with \
             'ssh -R {DEFAULT_RELAY_PORT}:localhost:{DEFAULT_RELAY_PORT} ...'"
        ),
        SessionKind::Devcontainer | SessionKind::Codespaces => {
            format!(
                "Run 'soundcue relay --bind 172.17.0.1' on the host (the docker bridge address) \
                 so the container can reach it at {CONTAINER_GATEWAY_HOST}:{DEFAULT_RELAY_PORT}"
            )
        }
    }
}

#[derive(Serialize)]
struct NotifyPayload<'a> {
    title: &'a str,
    body: &'a str,
}

/// Best-effort client for a relay. Every call reports success as a bool and
/// never returns an error.
#[derive(Clone, Default)]
pub struct RelayClient {
    client: reqwest::Client,
}

impl RelayClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn health(&self, base: &str) -> bool {
        let result = self
            .client
            .get(format!("{base}/health"))
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await;
        ok_or_log("health", result)
    }

    pub async fn play_category(&self, base: &str, category: Category) -> bool {
        let result = self
            .client
            .get(format!("{base}/play"))
            .query(&[("category", category.as_str())])
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await;
        ok_or_log("play", result)
    }

    pub async fn notify(&self, base: &str, title: &str, body: &str) -> bool {
        let result = self
            .client
            .post(format!("{base}/notify"))
            .json(&NotifyPayload { title, body })
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await;
        ok_or_log("notify", result)
    }
}

fn ok_or_log(what: &str, result: reqwest::Result<reqwest::Response>) -> bool {
    match result {
        Ok(resp) if resp.status().is_success() => true,
        Ok(resp) => {
            debug!("Relay {what} returned {}", resp.status());
            false
        }
        Err(e) => {
            debug!("Relay {what} failed: {e}");
            false
        }
    }
}
