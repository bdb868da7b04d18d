//! Host environment detection: which OS class we are on, which local
//! command-line audio player exists, and whether `notify-send` is installed.
//!
//! Probing runs external commands, so results are memoized inside the
//! [`PlatformProbe`] instance. Build one at startup and share it.
use std::process::{Command, Stdio};
use std::sync::OnceLock;
use sysinfo::System;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Mac,
    Linux,
    /// Linux userland under Windows Subsystem for Linux; audio and
    /// notifications go through `powershell.exe`.
    Wsl,
    Unknown,
}

/// Linux playback utilities in preference order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinuxPlayer {
    PwPlay,
    Paplay,
    Ffplay,
    Mpv,
    /// sox
    Play,
    Aplay,
}

pub const LINUX_PLAYERS: [LinuxPlayer; 6] = [
    LinuxPlayer::PwPlay,
    LinuxPlayer::Paplay,
    LinuxPlayer::Ffplay,
    LinuxPlayer::Mpv,
    LinuxPlayer::Play,
    LinuxPlayer::Aplay,
];

impl LinuxPlayer {
    pub fn binary(self) -> &'static str {
        match self {
            LinuxPlayer::PwPlay => "pw-play",
            LinuxPlayer::Paplay => "paplay",
            LinuxPlayer::Ffplay => "ffplay",
            LinuxPlayer::Mpv => "mpv",
            LinuxPlayer::Play => "play",
            LinuxPlayer::Aplay => "aplay",
        }
    }
}

type CommandCheck = Box<dyn Fn(&str) -> bool + Send + Sync>;

pub struct PlatformProbe {
    platform_override: Option<Platform>,
    platform: OnceLock<Platform>,
    linux_player: OnceLock<Option<LinuxPlayer>>,
    notify_send: OnceLock<bool>,
    command_exists: CommandCheck,
}

impl Default for PlatformProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl PlatformProbe {
    pub fn new() -> Self {
        Self {
            platform_override: None,
            platform: OnceLock::new(),
            linux_player: OnceLock::new(),
            notify_send: OnceLock::new(),
            command_exists: Box::new(command_exists),
        }
    }

    /// A probe with a fixed platform and a fake command lookup, for tests and
    /// for callers that already know the answer.
    pub fn with_overrides(
        platform: Platform,
        command_exists: impl Fn(&str) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            platform_override: Some(platform),
            platform: OnceLock::new(),
            linux_player: OnceLock::new(),
            notify_send: OnceLock::new(),
            command_exists: Box::new(command_exists),
        }
    }

    pub fn platform(&self) -> Platform {
        if let Some(p) = self.platform_override {
            return p;
        }
        *self.platform.get_or_init(detect_platform)
    }

    /// First available Linux player. Probed once per probe instance.
    pub fn linux_player(&self) -> Option<LinuxPlayer> {
        *self.linux_player.get_or_init(|| {
            let found = LINUX_PLAYERS
                .into_iter()
                .find(|p| (self.command_exists)(p.binary()));
            debug!("Linux audio player: {:?}", found.map(LinuxPlayer::binary));
            found
        })
    }

    /// Whether `notify-send` is on the PATH. Probed once per probe instance.
    pub fn has_notify_send(&self) -> bool {
        *self
            .notify_send
            .get_or_init(|| (self.command_exists)("notify-send"))
    }

    /// Forgets memoized results so the next call probes again.
    pub fn reset(&mut self) {
        self.platform = OnceLock::new();
        self.linux_player = OnceLock::new();
        self.notify_send = OnceLock::new();
    }
}

pub fn detect_platform() -> Platform {
    if cfg!(target_os = "macos") {
        return Platform::Mac;
    }
    if cfg!(target_os = "linux") {
        let release = System::kernel_version()
            .or_else(|| std::fs::read_to_string("/proc/version").ok())
            .unwrap_or_default();
        return if is_wsl_kernel(&release) {
            Platform::Wsl
        } else {
            Platform::Linux
        };
    }
    Platform::Unknown
}

/// WSL kernels carry "microsoft" in their release string.
pub fn is_wsl_kernel(release: &str) -> bool {
    release.to_ascii_lowercase().contains("microsoft")
}

/// `command -v` through the shell, so builtins and PATH lookups agree with
/// what an interactive user would see.
pub fn command_exists(cmd: &str) -> bool {
    Command::new("sh")
        .args(["-c", "command -v \"$1\"", "sh", cmd])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}
