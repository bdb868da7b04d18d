//! Local sound playback through whatever command-line player the host has.
//!
//! Players run as detached child processes that outlive the call. At most one
//! is "current": starting a clip kills the previous one, and a background task
//! clears the marker when a clip ends on its own.
//!
//! Each hook invocation is its own short-lived process, so the current clip is
//! also recorded on disk (`player.json`). Stopping reads that record and kills
//! the clip even when another soundcue process started it.
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use sysinfo::{Pid, Process, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System};
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::debug;

use crate::platform::{LinuxPlayer, Platform, PlatformProbe};

/// Playback seam used by the pipeline and the relay server.
pub trait SoundPlayer: Send + Sync {
    /// Starts `file` at `volume` (0.0–1.0) without waiting for it.
    fn play(&self, file: &Path, volume: f64);
    /// Kills the current clip, if any.
    fn stop(&self);
}

/// How a clip gets played on this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// macOS `afplay`.
    Afplay,
    /// `System.Windows.Media.MediaPlayer` driven from `powershell.exe` (WSL).
    MediaPlayer,
    Linux(LinuxPlayer),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl PlayCommand {
    fn new(program: &str, args: Vec<String>) -> Self {
        Self {
            program: program.to_string(),
            args,
        }
    }
}

fn unit_volume(volume: f64) -> f64 {
    if volume.is_nan() {
        0.0
    } else {
        volume.clamp(0.0, 1.0)
    }
}

/// `volume` scaled to `0..=max` and rounded.
fn scaled_volume(volume: f64, max: u32) -> u32 {
    (unit_volume(volume) * f64::from(max)).round() as u32
}

/// Builds the player invocation. `file` is already in the form the backend
/// expects (a Windows path for [`Backend::MediaPlayer`]).
pub fn build_play_command(backend: Backend, file: &str, volume: f64) -> PlayCommand {
    let unit = format!("{:.2}", unit_volume(volume));
    match backend {
        Backend::Afplay => PlayCommand::new("afplay", vec!["-v".into(), unit, file.into()]),
        Backend::MediaPlayer => {
            let uri = format!("file:///{}", file.replace('\\', "/"));
            let script = format!(
                "Add-Type -AssemblyName PresentationCore\n\
                 $p = New-Object System.Windows.Media.MediaPlayer\n\
                 $p.Open([Uri]::new('{}'))\n\
                 $p.Volume = {unit}\n\
                 Start-Sleep -Milliseconds 200\n\
                 $p.Play()\n\
                 Start-Sleep -Seconds 3\n\
                 $p.Close()",
                uri.replace('\'', "''"),
            );
            PlayCommand::new(
                "powershell.exe",
                vec![
                    "-NoProfile".into(),
                    "-NonInteractive".into(),
                    "-Command".into(),
                    script,
                ],
            )
        }
        Backend::Linux(player) => {
            let args = match player {
                LinuxPlayer::PwPlay => vec!["--volume".into(), unit, file.into()],
                LinuxPlayer::Paplay => vec![
                    format!("--volume={}", scaled_volume(volume, 65_536)),
                    file.into(),
                ],
                LinuxPlayer::Ffplay => vec![
                    "-nodisp".into(),
                    "-autoexit".into(),
                    "-loglevel".into(),
                    "quiet".into(),
                    "-volume".into(),
                    scaled_volume(volume, 100).to_string(),
                    file.into(),
                ],
                LinuxPlayer::Mpv => vec![
                    "--no-video".into(),
                    "--really-quiet".into(),
                    format!("--volume={}", scaled_volume(volume, 100)),
                    file.into(),
                ],
                LinuxPlayer::Play => vec!["-q".into(), "-v".into(), unit, file.into()],
                // aplay has no volume control.
                LinuxPlayer::Aplay => vec!["-q".into(), file.into()],
            };
            PlayCommand::new(player.binary(), args)
        }
    }
}

/// Converts a WSL path for Windows tools, preferring `wslpath -w`.
fn windows_path(file: &Path) -> String {
    let converted = std::process::Command::new("wslpath")
        .arg("-w")
        .arg(file)
        .stderr(Stdio::null())
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .filter(|s| !s.is_empty());
    converted.unwrap_or_else(|| file.to_string_lossy().replace('/', "\\"))
}

/// On-disk record of the clip started last. `start_time` (seconds since the
/// epoch) tells a live clip apart from an unrelated process that reused its PID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct PlayerRecord {
    pid: u32,
    start_time: u64,
}

/// Runs `f` on process `pid` if it exists and has not exited. Zombies count
/// as exited.
fn with_live_process<T>(pid: u32, f: impl FnOnce(&Process) -> T) -> Option<T> {
    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[pid]),
        true,
        ProcessRefreshKind::new(),
    );
    sys.process(pid)
        .filter(|p| p.status() != ProcessStatus::Zombie)
        .map(f)
}

fn read_record(path: &Path) -> Option<PlayerRecord> {
    let content = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

fn write_record(path: &Path, pid: u32) {
    // Already gone: nothing to stop later.
    let Some(record) = with_live_process(pid, |p| PlayerRecord {
        pid,
        start_time: p.start_time(),
    }) else {
        return;
    };
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            debug!("Failed to create {}: {e}", parent.display());
            return;
        }
    }
    match serde_json::to_string(&record) {
        Ok(content) => {
            if let Err(e) = std::fs::write(path, content) {
                debug!("Failed to write player record: {e}");
            }
        }
        Err(e) => debug!("Failed to serialize player record: {e}"),
    }
}

/// Removes the record at `path` and kills the clip it names, provided that
/// PID still belongs to the process that was recorded.
fn stop_recorded(path: &Path) {
    let Some(record) = read_record(path) else {
        return;
    };
    let _ = std::fs::remove_file(path);
    let killed = with_live_process(record.pid, |p| {
        p.start_time() == record.start_time && p.kill()
    });
    if killed == Some(true) {
        debug!("Stopped clip {}", record.pid);
    }
}

/// Removes the record at `path` if it still names `pid`.
fn clear_record(path: &Path, pid: u32) {
    if read_record(path).is_some_and(|r| r.pid == pid) {
        let _ = std::fs::remove_file(path);
    }
}

struct CurrentSound {
    id: u64,
    kill_tx: oneshot::Sender<()>,
}

/// The process-wide playback dispatcher. Construct once and share.
pub struct Player {
    probe: Arc<PlatformProbe>,
    current: Arc<Mutex<Option<CurrentSound>>>,
    next_id: AtomicU64,
    pid_file: Option<PathBuf>,
}

impl Player {
    pub fn new(probe: Arc<PlatformProbe>) -> Self {
        Self {
            probe,
            current: Arc::new(Mutex::new(None)),
            next_id: AtomicU64::new(0),
            pid_file: None,
        }
    }

    /// Shares the current clip with other soundcue processes through `path`.
    pub fn with_pid_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.pid_file = Some(path.into());
        self
    }

    /// Backend for this host, or `None` when nothing can play sound.
    pub fn backend(&self) -> Option<Backend> {
        match self.probe.platform() {
            Platform::Mac => Some(Backend::Afplay),
            Platform::Wsl => Some(Backend::MediaPlayer),
            Platform::Linux => self.probe.linux_player().map(Backend::Linux),
            Platform::Unknown => None,
        }
    }

    pub fn is_playing(&self) -> bool {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Spawns `command` as the new current clip. Must run inside a Tokio
    /// runtime. Spawn failures are logged and dropped.
    pub fn spawn(&self, command: &PlayCommand) {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        // Own process group so the clip survives a Ctrl+C aimed at the caller.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                debug!("Failed to start {}: {e}", command.program);
                return;
            }
        };

        let pid = child.id();
        if let (Some(path), Some(pid)) = (&self.pid_file, pid) {
            write_record(path, pid);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (kill_tx, kill_rx) = oneshot::channel();
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(CurrentSound { id, kill_tx });

        let current = Arc::clone(&self.current);
        let pid_file = self.pid_file.clone();
        tokio::spawn(async move {
            let killed = tokio::select! {
                _ = child.wait() => false,
                Ok(()) = kill_rx => true,
            };
            if killed {
                // Already exited is fine.
                let _ = child.kill().await;
            }
            if let (Some(path), Some(pid)) = (&pid_file, pid) {
                clear_record(path, pid);
            }
            let mut guard = current.lock().unwrap_or_else(PoisonError::into_inner);
            if guard.as_ref().is_some_and(|c| c.id == id) {
                *guard = None;
            }
        });
    }
}

impl SoundPlayer for Player {
    fn play(&self, file: &Path, volume: f64) {
        self.stop();
        let Some(backend) = self.backend() else {
            debug!("No audio backend available; skipping {}", file.display());
            return;
        };
        let file = match backend {
            Backend::MediaPlayer => windows_path(file),
            _ => file.to_string_lossy().into_owned(),
        };
        self.spawn(&build_play_command(backend, &file, volume));
    }

    fn stop(&self) {
        let previous = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sound) = previous {
            let _ = sound.kill_tx.send(());
        }
        if let Some(path) = &self.pid_file {
            stop_recorded(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn volume_arg(cmd: &PlayCommand) -> &str {
        cmd.args
            .iter()
            .find(|a| a.starts_with("--volume="))
            .map(String::as_str)
            .unwrap()
    }

    // ── build_play_command ────────────────────────────────────────────────────

    #[test]
    fn afplay_uses_unit_volume() {
        let cmd = build_play_command(Backend::Afplay, "/tmp/a.wav", 0.5);
        assert_eq!(cmd.program, "afplay");
        assert_eq!(cmd.args, vec!["-v", "0.50", "/tmp/a.wav"]);
    }

    #[test]
    fn out_of_range_volume_is_clamped_for_every_backend() {
        let backends = [
            Backend::Afplay,
            Backend::MediaPlayer,
            Backend::Linux(LinuxPlayer::PwPlay),
            Backend::Linux(LinuxPlayer::Play),
        ];
        for backend in backends {
            let loud = build_play_command(backend, "f.wav", 1.5);
            assert!(loud.args.iter().any(|a| a.contains("1.00")), "{backend:?}");
            assert!(!loud.args.iter().any(|a| a.contains("1.5")), "{backend:?}");
            let quiet = build_play_command(backend, "f.wav", -0.3);
            assert!(quiet.args.iter().any(|a| a.contains("0.00")), "{backend:?}");
        }
    }

    #[test]
    fn paplay_scale_is_clamped() {
        let loud = build_play_command(Backend::Linux(LinuxPlayer::Paplay), "f.wav", 1.5);
        assert_eq!(volume_arg(&loud), "--volume=65536");
        let half = build_play_command(Backend::Linux(LinuxPlayer::Paplay), "f.wav", 0.5);
        assert_eq!(volume_arg(&half), "--volume=32768");
        let neg = build_play_command(Backend::Linux(LinuxPlayer::Paplay), "f.wav", -1.0);
        assert_eq!(volume_arg(&neg), "--volume=0");
    }

    #[test]
    fn percent_backends_are_clamped() {
        let mpv = build_play_command(Backend::Linux(LinuxPlayer::Mpv), "f.wav", 2.0);
        assert_eq!(volume_arg(&mpv), "--volume=100");

        let ffplay = build_play_command(Backend::Linux(LinuxPlayer::Ffplay), "f.wav", 7.0);
        let idx = ffplay.args.iter().position(|a| a == "-volume").unwrap();
        assert_eq!(ffplay.args[idx + 1], "100");
    }

    #[test]
    fn nan_volume_is_silent() {
        let cmd = build_play_command(Backend::Linux(LinuxPlayer::Paplay), "f.wav", f64::NAN);
        assert_eq!(volume_arg(&cmd), "--volume=0");
    }

    #[test]
    fn aplay_ignores_volume() {
        let cmd = build_play_command(Backend::Linux(LinuxPlayer::Aplay), "f.wav", 0.2);
        assert_eq!(cmd.args, vec!["-q", "f.wav"]);
    }

    #[test]
    fn media_player_script_quotes_path() {
        let cmd = build_play_command(Backend::MediaPlayer, r"C:\Users\o'neil\a.wav", 0.25);
        assert_eq!(cmd.program, "powershell.exe");
        let script = cmd.args.last().unwrap();
        assert!(script.contains("[Uri]::new('file:///C:/Users/o''neil/a.wav')"));
        assert!(script.contains("$p.Volume = 0.25"));
    }

    // ── Player ────────────────────────────────────────────────────────────────

    #[test]
    fn backend_follows_platform() {
        let mac = Player::new(Arc::new(PlatformProbe::with_overrides(Platform::Mac, |_| false)));
        assert_eq!(mac.backend(), Some(Backend::Afplay));

        let wsl = Player::new(Arc::new(PlatformProbe::with_overrides(Platform::Wsl, |_| false)));
        assert_eq!(wsl.backend(), Some(Backend::MediaPlayer));

        let bare = Player::new(Arc::new(PlatformProbe::with_overrides(Platform::Linux, |_| false)));
        assert_eq!(bare.backend(), None);

        let unknown =
            Player::new(Arc::new(PlatformProbe::with_overrides(Platform::Unknown, |_| true)));
        assert_eq!(unknown.backend(), None);
    }

    #[tokio::test]
    async fn play_without_backend_is_a_noop() {
        let player = Player::new(Arc::new(PlatformProbe::with_overrides(Platform::Linux, |_| false)));
        player.play(Path::new("/tmp/whatever.wav"), 0.5);
        assert!(!player.is_playing());
    }

    #[tokio::test]
    async fn spawn_failure_is_silent() {
        let player = Player::new(Arc::new(PlatformProbe::new()));
        player.spawn(&PlayCommand::new("definitely-not-a-player-9931", vec![]));
        assert!(!player.is_playing());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn marker_clears_when_clip_finishes() {
        let player = Player::new(Arc::new(PlatformProbe::new()));
        player.spawn(&PlayCommand::new("true", vec![]));
        assert!(player.is_playing());

        for _ in 0..100 {
            if !player.is_playing() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("marker was never cleared");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stop_kills_the_current_clip() {
        let player = Player::new(Arc::new(PlatformProbe::new()));
        player.spawn(&PlayCommand::new("sleep", vec!["30".into()]));
        assert!(player.is_playing());

        player.stop();
        assert!(!player.is_playing());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn new_clip_replaces_the_previous_one() {
        let player = Player::new(Arc::new(PlatformProbe::new()));
        player.spawn(&PlayCommand::new("sleep", vec!["30".into()]));
        player.stop();
        player.spawn(&PlayCommand::new("sleep", vec!["30".into()]));

        // Give the first clip's watcher time to run; it must not clear the
        // second clip's marker.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(player.is_playing());
        player.stop();
    }

    // ── player record ─────────────────────────────────────────────────────────

    #[cfg(unix)]
    async fn wait_until_exited(pid: u32) -> bool {
        for _ in 0..100 {
            if with_live_process(pid, |_| ()).is_none() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stop_kills_a_clip_started_by_another_player() {
        // Two players sharing one record stand in for two hook invocations.
        let dir = tempfile::tempdir().unwrap();
        let record = dir.path().join("player.json");
        let earlier = Player::new(Arc::new(PlatformProbe::new())).with_pid_file(&record);
        let later = Player::new(Arc::new(PlatformProbe::new())).with_pid_file(&record);

        earlier.spawn(&PlayCommand::new("sleep", vec!["30".into()]));
        let earlier_pid = read_record(&record).unwrap().pid;

        later.stop();
        later.spawn(&PlayCommand::new("sleep", vec!["30".into()]));
        let later_pid = read_record(&record).unwrap().pid;
        assert_ne!(earlier_pid, later_pid);

        assert!(wait_until_exited(earlier_pid).await, "earlier clip still playing");
        assert!(with_live_process(later_pid, |_| ()).is_some());

        later.stop();
        assert!(wait_until_exited(later_pid).await);
        assert!(!record.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn record_is_removed_when_clip_finishes() {
        let dir = tempfile::tempdir().unwrap();
        let record = dir.path().join("player.json");
        let player = Player::new(Arc::new(PlatformProbe::new())).with_pid_file(&record);

        player.spawn(&PlayCommand::new("sleep", vec!["0.2".into()]));
        assert!(record.exists());

        for _ in 0..150 {
            if !record.exists() && !player.is_playing() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("record was never removed");
    }

    #[test]
    fn stale_record_does_not_kill_a_reused_pid() {
        let dir = tempfile::tempdir().unwrap();
        let record = dir.path().join("player.json");
        // Our own PID with a start time it never had.
        let stale = PlayerRecord {
            pid: std::process::id(),
            start_time: 1,
        };
        std::fs::write(&record, serde_json::to_string(&stale).unwrap()).unwrap();

        stop_recorded(&record);
        assert!(!record.exists());
    }

    #[test]
    fn garbage_record_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let record = dir.path().join("player.json");
        std::fs::write(&record, "not json").unwrap();
        stop_recorded(&record);
        assert!(read_record(&record).is_none());
    }
}
