//! Canonical file locations for soundcue data.
//!
//! Everything lives under `~/.config/soundcue/` unless `SOUNDCUE_HOME` points
//! somewhere else:
//!   - config.json         User settings, read on every event.
//!   - state.json          Session state, rewritten on every mutation.
//!   - relay-status.toml   Written by the relay daemon.
//!   - player.json         PID of the clip currently playing, if any.
//!   - packs/<id>/         Installed sound packs.
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

pub const APP_NAME: &str = "soundcue";
pub const HOME_ENV: &str = "SOUNDCUE_HOME";
pub const CONFIG_FILE_NAME: &str = "config.json";
pub const STATE_FILE_NAME: &str = "state.json";
pub const RELAY_STATUS_FILE_NAME: &str = "relay-status.toml";
pub const PLAYER_FILE_NAME: &str = "player.json";
pub const PACKS_DIR_NAME: &str = "packs";
pub const ICON_FILE_NAME: &str = "icon.png";

/// Resolved set of directories. Built once in `main` and handed to whoever
/// needs a path, so tests can point everything at a temp dir.
#[derive(Debug, Clone)]
pub struct Paths {
    root: PathBuf,
    /// Packs installed by an earlier peon-ping hook setup, if the home
    /// directory is known.
    legacy_packs: Option<PathBuf>,
    /// Per-user data dir (`~/.local/share` on Linux) for the shared icon.
    user_data: Option<PathBuf>,
}

impl Paths {
    /// Uses `$SOUNDCUE_HOME` when set, else `~/.config/soundcue`.
    pub fn from_env() -> Result<Self> {
        let home = dirs::home_dir();
        let root = match std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
            Some(dir) => PathBuf::from(dir),
            None => home
                .as_ref()
                .map(|h| h.join(".config").join(APP_NAME))
                .context("Could not determine the home directory")?,
        };
        Ok(Self {
            root,
            legacy_packs: home.map(|h| {
                h.join(".claude")
                    .join("hooks")
                    .join("peon-ping")
                    .join(PACKS_DIR_NAME)
            }),
            user_data: dirs::data_dir(),
        })
    }

    /// Everything rooted at `root`, with no legacy or shared locations.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            legacy_packs: None,
            user_data: None,
        }
    }

    pub fn with_user_data(mut self, dir: impl Into<PathBuf>) -> Self {
        self.user_data = Some(dir.into());
        self
    }

    pub fn data_dir(&self) -> &Path {
        &self.root
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join(CONFIG_FILE_NAME)
    }

    pub fn state_file(&self) -> PathBuf {
        self.root.join(STATE_FILE_NAME)
    }

    pub fn relay_status_file(&self) -> PathBuf {
        self.root.join(RELAY_STATUS_FILE_NAME)
    }

    pub fn player_file(&self) -> PathBuf {
        self.root.join(PLAYER_FILE_NAME)
    }

    pub fn packs_dir(&self) -> PathBuf {
        self.root.join(PACKS_DIR_NAME)
    }

    pub fn legacy_packs_dir(&self) -> Option<&Path> {
        self.legacy_packs.as_deref()
    }

    /// Raw path of the bundled default notification icon.
    pub fn default_icon(&self) -> PathBuf {
        self.root.join(ICON_FILE_NAME)
    }

    /// Icon installed into the freedesktop theme so notifiers can reference
    /// it by name.
    pub fn shared_icon(&self) -> Option<PathBuf> {
        self.user_data.as_ref().map(|d| {
            d.join("icons")
                .join("hicolor")
                .join("256x256")
                .join("apps")
                .join(format!("{APP_NAME}.png"))
        })
    }

    /// Creates the data and packs directories if missing.
    pub fn ensure_dirs(&self) -> Result<()> {
        let packs = self.packs_dir();
        std::fs::create_dir_all(&packs)
            .with_context(|| format!("Failed to create {}", packs.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn files_share_the_data_dir() {
        let paths = Paths::at("/tmp/soundcue-test");
        assert_eq!(paths.config_file().parent(), Some(paths.data_dir()));
        assert_eq!(paths.state_file().parent(), Some(paths.data_dir()));
        assert_eq!(paths.relay_status_file().parent(), Some(paths.data_dir()));
        assert_eq!(paths.player_file().parent(), Some(paths.data_dir()));
    }

    #[test]
    fn file_names_are_fixed() {
        let paths = Paths::at("/tmp/x");
        assert_eq!(paths.config_file().file_name().unwrap(), CONFIG_FILE_NAME);
        assert_eq!(paths.state_file().file_name().unwrap(), STATE_FILE_NAME);
        assert_eq!(paths.packs_dir().file_name().unwrap(), PACKS_DIR_NAME);
        assert_eq!(paths.player_file().file_name().unwrap(), PLAYER_FILE_NAME);
    }

    #[test]
    fn at_has_no_external_locations() {
        let paths = Paths::at("/tmp/x");
        assert!(paths.legacy_packs_dir().is_none());
        assert!(paths.shared_icon().is_none());
    }

    #[test]
    fn shared_icon_is_named_after_the_app() {
        let paths = Paths::at("/tmp/x").with_user_data("/tmp/share");
        let icon = paths.shared_icon().unwrap();
        assert!(icon.starts_with("/tmp/share/icons/hicolor"));
        assert_eq!(icon.file_name().unwrap(), "soundcue.png");
    }

    #[test]
    fn ensure_dirs_creates_packs_dir() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::at(dir.path().join("nested"));
        paths.ensure_dirs().unwrap();
        assert!(paths.packs_dir().is_dir());
    }
}
