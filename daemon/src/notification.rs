//! Native desktop notifications.
//!
//! macOS goes through AppleScript, Linux through `notify-send` when it is
//! installed, and WSL through a PowerShell toast. Anything else reports
//! "not delivered" so the caller can fall back to an on-screen notice.
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::debug;

use crate::paths::{Paths, APP_NAME};
use crate::platform::{Platform, PlatformProbe};

/// Notification seam used by the pipeline and the relay server.
pub trait DesktopNotify: Send + Sync {
    /// Returns whether a notifier was actually started.
    fn notify(&self, title: &str, body: &str, icon: Option<&Icon>) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notifier {
    Osascript,
    NotifySend,
    PowerShell,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Icon {
    /// A file on disk.
    Path(PathBuf),
    /// An icon-theme name (only meaningful to `notify-send`).
    Named(String),
}

impl Icon {
    fn as_arg(&self) -> String {
        match self {
            Icon::Path(p) => p.to_string_lossy().into_owned(),
            Icon::Named(n) => n.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyCommand {
    pub program: String,
    pub args: Vec<String>,
}

/// Escapes text for a double-quoted AppleScript string: backslashes first,
/// then double quotes.
pub fn escape_notification_text(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Escapes text for a single-quoted PowerShell literal.
fn escape_powershell_literal(text: &str) -> String {
    text.replace('\'', "''")
}

pub fn detect_notifier(probe: &PlatformProbe) -> Option<Notifier> {
    match probe.platform() {
        Platform::Mac => Some(Notifier::Osascript),
        Platform::Linux => probe.has_notify_send().then_some(Notifier::NotifySend),
        Platform::Wsl => Some(Notifier::PowerShell),
        Platform::Unknown => None,
    }
}

pub fn build_notify_command(
    notifier: Notifier,
    title: &str,
    body: &str,
    icon: Option<&Icon>,
) -> NotifyCommand {
    match notifier {
        Notifier::Osascript => {
            let script = format!(
                "display notification \"{}\" with title \"{}\"",
                escape_notification_text(body),
                escape_notification_text(title),
            );
            NotifyCommand {
                program: "osascript".to_string(),
                args: vec!["-e".to_string(), script],
            }
        }
        Notifier::NotifySend => {
            // Separate argv entries; no shell or script parsing involved.
            let mut args = vec!["-a".to_string(), APP_NAME.to_string()];
            if let Some(icon) = icon {
                args.push("-i".to_string());
                args.push(icon.as_arg());
            }
            args.push(title.to_string());
            args.push(body.to_string());
            NotifyCommand {
                program: "notify-send".to_string(),
                args,
            }
        }
        Notifier::PowerShell => {
            let script = format!(
                "[Windows.UI.Notifications.ToastNotificationManager, Windows.UI.Notifications, ContentType = WindowsRuntime] > $null\n\
                 $template = [Windows.UI.Notifications.ToastNotificationManager]::GetTemplateContent([Windows.UI.Notifications.ToastTemplateType]::ToastText02)\n\
                 $text = $template.GetElementsByTagName('text')\n\
                 $text.Item(0).AppendChild($template.CreateTextNode('{}')) > $null\n\
                 $text.Item(1).AppendChild($template.CreateTextNode('{}')) > $null\n\
                 $toast = [Windows.UI.Notifications.ToastNotification]::new($template)\n\
                 [Windows.UI.Notifications.ToastNotificationManager]::CreateToastNotifier('{APP_NAME}').Show($toast)",
                escape_powershell_literal(title),
                escape_powershell_literal(body),
            );
            NotifyCommand {
                program: "powershell.exe".to_string(),
                args: vec![
                    "-NoProfile".to_string(),
                    "-NonInteractive".to_string(),
                    "-Command".to_string(),
                    script,
                ],
            }
        }
    }
}

/// Picks the icon for a notification: an explicit path, then the pack's own
/// icon, then the shared icon installed into the desktop theme (by name),
/// then the raw default icon path.
pub fn resolve_icon(explicit: Option<&Path>, pack_icon: Option<PathBuf>, paths: &Paths) -> Icon {
    if let Some(path) = explicit {
        return Icon::Path(path.to_path_buf());
    }
    if let Some(path) = pack_icon {
        return Icon::Path(path);
    }
    if paths.shared_icon().is_some_and(|p| p.is_file()) {
        return Icon::Named(APP_NAME.to_string());
    }
    Icon::Path(paths.default_icon())
}

pub struct DesktopNotifier {
    probe: Arc<PlatformProbe>,
}

impl DesktopNotifier {
    pub fn new(probe: Arc<PlatformProbe>) -> Self {
        Self { probe }
    }
}

impl DesktopNotify for DesktopNotifier {
    fn notify(&self, title: &str, body: &str, icon: Option<&Icon>) -> bool {
        let Some(notifier) = detect_notifier(&self.probe) else {
            return false;
        };
        let command = build_notify_command(notifier, title, body, icon);
        let spawned = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        match spawned {
            // Dropped without waiting; Tokio reaps it in the background.
            Ok(_child) => true,
            Err(e) => {
                debug!("Failed to start {}: {e}", command.program);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Reverses one level of [`escape_notification_text`].
    fn unescape_once(text: &str) -> String {
        let mut out = String::new();
        let mut chars = text.chars();
        while let Some(c) = chars.next() {
            if c == '\\' {
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            } else {
                out.push(c);
            }
        }
        out
    }

    fn probe(platform: Platform, has_notify_send: bool) -> PlatformProbe {
        PlatformProbe::with_overrides(platform, move |cmd| {
            has_notify_send && cmd == "notify-send"
        })
    }

    // ── detect_notifier ───────────────────────────────────────────────────────

    #[test]
    fn notifier_per_platform() {
        assert_eq!(detect_notifier(&probe(Platform::Mac, false)), Some(Notifier::Osascript));
        assert_eq!(detect_notifier(&probe(Platform::Linux, true)), Some(Notifier::NotifySend));
        assert_eq!(detect_notifier(&probe(Platform::Linux, false)), None);
        assert_eq!(detect_notifier(&probe(Platform::Wsl, false)), Some(Notifier::PowerShell));
        assert_eq!(detect_notifier(&probe(Platform::Unknown, true)), None);
    }

    #[test]
    fn repeated_detection_looks_up_notify_send_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let probe = PlatformProbe::with_overrides(Platform::Linux, move |cmd| {
            if cmd == "notify-send" {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            true
        });
        for _ in 0..3 {
            assert_eq!(detect_notifier(&probe), Some(Notifier::NotifySend));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    // ── escaping ──────────────────────────────────────────────────────────────

    #[test]
    fn escapes_quotes_and_backslashes() {
        assert_eq!(escape_notification_text(r#"say "hello""#), r#"say \"hello\""#);
        assert_eq!(escape_notification_text(r"path\to\file"), r"path\\to\\file");
        assert_eq!(escape_notification_text("Task complete"), "Task complete");
    }

    #[test]
    fn escaping_round_trips() {
        for original in [r#"a "quoted" \ body"#, r#"\""#, r"trailing\", "plain"] {
            assert_eq!(unescape_once(&escape_notification_text(original)), original);
        }
    }

    #[test]
    fn osascript_body_cannot_break_out_of_its_string() {
        let body = r#"done" & do shell script "rm -rf ~" & "\"#;
        let cmd = build_notify_command(Notifier::Osascript, "Title", body, None);
        assert_eq!(cmd.program, "osascript");
        let script = &cmd.args[1];
        let prefix = "display notification \"";
        let suffix = "\" with title \"Title\"";
        assert!(script.starts_with(prefix) && script.ends_with(suffix));
        let inner = &script[prefix.len()..script.len() - suffix.len()];
        assert_eq!(unescape_once(inner), body);
    }

    #[test]
    fn powershell_doubles_single_quotes() {
        let cmd = build_notify_command(Notifier::PowerShell, "it's", "don't", None);
        assert_eq!(cmd.program, "powershell.exe");
        let script = cmd.args.last().unwrap();
        assert!(script.contains("CreateTextNode('it''s')"));
        assert!(script.contains("CreateTextNode('don''t')"));
    }

    #[test]
    fn notify_send_passes_raw_text_and_icon() {
        let icon = Icon::Named("soundcue".to_string());
        let cmd = build_notify_command(Notifier::NotifySend, "Hello \"x\"", "World", Some(&icon));
        assert_eq!(cmd.program, "notify-send");
        assert_eq!(
            cmd.args,
            vec!["-a", "soundcue", "-i", "soundcue", "Hello \"x\"", "World"]
        );
    }

    // ── resolve_icon ──────────────────────────────────────────────────────────

    #[test]
    fn icon_resolution_order() {
        let dir = tempfile::tempdir().unwrap();
        let share = dir.path().join("share");
        let paths = Paths::at(dir.path().join("cfg")).with_user_data(&share);

        let explicit = dir.path().join("mine.png");
        assert_eq!(
            resolve_icon(Some(explicit.as_path()), Some(dir.path().join("pack.png")), &paths),
            Icon::Path(explicit)
        );
        assert_eq!(
            resolve_icon(None, Some(dir.path().join("pack.png")), &paths),
            Icon::Path(dir.path().join("pack.png"))
        );
        assert_eq!(resolve_icon(None, None, &paths), Icon::Path(paths.default_icon()));

        let shared = paths.shared_icon().unwrap();
        std::fs::create_dir_all(shared.parent().unwrap()).unwrap();
        std::fs::write(&shared, b"png").unwrap();
        assert_eq!(
            resolve_icon(None, None, &paths),
            Icon::Named("soundcue".to_string())
        );
    }

    // ── DesktopNotifier ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn unsupported_platform_is_not_delivered() {
        let notifier = DesktopNotifier::new(Arc::new(probe(Platform::Unknown, true)));
        assert!(!notifier.notify("Title", "Body", None));
    }

    #[tokio::test]
    async fn linux_without_notify_send_is_not_delivered() {
        let notifier = DesktopNotifier::new(Arc::new(probe(Platform::Linux, false)));
        assert!(!notifier.notify("Title", "Body", None));
    }
}
