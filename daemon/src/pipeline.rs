//! Event-to-playback dispatch for a single decided category.
//!
//! The gate has already decided *whether* to act; the `Dispatcher` decides
//! *where* (local or relay) and *what* (which clip), then hands off to the
//! player and notifier. Both the hook CLI and the relay server drive one.
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::audio::SoundPlayer;
use crate::category::Category;
use crate::config::Config;
use crate::event::HookEvent;
use crate::gate;
use crate::notification::{resolve_icon, DesktopNotify};
use crate::packs::{PackCatalog, SoundRef};
use crate::paths::Paths;
use crate::relay::{resolve_target, RelayClient, RelayEnv, Target};
use crate::state::SessionState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayOutcome {
    /// Handed to a relay; `delivered` is whether it answered 2xx.
    Forwarded { delivered: bool },
    /// Played on this machine.
    Played(SoundRef),
    /// Disabled, paused, or no sound available.
    Nothing,
}

/// What one hook invocation reads besides the session state.
pub struct HookContext<'a> {
    pub config: &'a Config,
    pub env: &'a RelayEnv,
    /// Notification title, `soundcue · <project>`.
    pub title: &'a str,
    /// Epoch milliseconds.
    pub now: i64,
}

pub struct Dispatcher {
    player: Arc<dyn SoundPlayer>,
    notifier: Arc<dyn DesktopNotify>,
    catalog: PackCatalog,
    relay: RelayClient,
    paths: Paths,
}

impl Dispatcher {
    pub fn new(player: Arc<dyn SoundPlayer>, notifier: Arc<dyn DesktopNotify>, paths: Paths) -> Self {
        let catalog = PackCatalog::new(
            paths.packs_dir(),
            paths.legacy_packs_dir().map(Path::to_path_buf),
        );
        Self {
            player,
            notifier,
            catalog,
            relay: RelayClient::new(),
            paths,
        }
    }

    pub fn catalog(&self) -> &PackCatalog {
        &self.catalog
    }

    pub fn player(&self) -> &dyn SoundPlayer {
        self.player.as_ref()
    }

    /// Runs `event` through the gate and, when it acts, plays the category
    /// and sends the event's notification. Returns whether `state` changed
    /// and needs saving; it does even when nothing could be played.
    pub async fn handle_event(
        &self,
        event: HookEvent,
        ctx: &HookContext<'_>,
        state: &mut SessionState,
        fallback: impl FnOnce(&str),
    ) -> bool {
        let decision = gate::decide(event.category(), ctx.config, state, ctx.now);
        let mut state_dirty = decision.state_changed;
        debug!("{event:?} -> {decision:?}");

        if event == HookEvent::SessionStart
            && resolve_target(ctx.config.relay_mode, ctx.env) == Target::Local
            && !self.catalog.has_packs()
        {
            warn!(
                "No sound packs installed in {}; nothing will play",
                self.catalog.packs_dir().display()
            );
        }

        if !decision.act {
            return state_dirty;
        }
        match self
            .play_category(decision.category, ctx.config, state, ctx.env)
            .await
        {
            PlayOutcome::Played(_) => state_dirty = true,
            PlayOutcome::Forwarded { delivered: false } => {
                debug!("Relay did not accept {}", decision.category)
            }
            PlayOutcome::Forwarded { delivered: true } | PlayOutcome::Nothing => {}
        }
        if let Some(body) = event.notification_body() {
            self.send_notification(ctx.title, body, ctx.config, ctx.env, fallback)
                .await;
        }
        state_dirty
    }

    /// Routes `category` to the relay or to local playback. Remote failures
    /// never fall back to local playback.
    pub async fn play_category(
        &self,
        category: Category,
        config: &Config,
        state: &mut SessionState,
        env: &RelayEnv,
    ) -> PlayOutcome {
        if !config.enabled || state.paused {
            return PlayOutcome::Nothing;
        }
        match resolve_target(config.relay_mode, env) {
            Target::Remote(base) => {
                let delivered = self.relay.play_category(&base, category).await;
                PlayOutcome::Forwarded { delivered }
            }
            Target::Local => match self.play_local(category, config, state) {
                Some(sound) => PlayOutcome::Played(sound),
                None => PlayOutcome::Nothing,
            },
        }
    }

    /// Picks a clip from the active pack, plays it, and records it in
    /// `state.last_played`. The caller persists `state`.
    pub fn play_local(
        &self,
        category: Category,
        config: &Config,
        state: &mut SessionState,
    ) -> Option<SoundRef> {
        let sound = self.catalog.pick_sound(
            category,
            &config.default_pack,
            state.last_played_for(category),
        )?;
        debug!("Playing {} ({})", sound.label, sound.path.display());
        self.player.play(&sound.path, config.volume);
        state.record_played(category, &sound.id);
        Some(sound)
    }

    /// Sends a desktop notification through the relay or locally. When a
    /// local notification cannot be shown, `fallback` receives
    /// `"<title>: <body>"` instead.
    pub async fn send_notification(
        &self,
        title: &str,
        body: &str,
        config: &Config,
        env: &RelayEnv,
        fallback: impl FnOnce(&str),
    ) -> bool {
        if !config.desktop_notifications {
            return false;
        }
        match resolve_target(config.relay_mode, env) {
            Target::Remote(base) => self.relay.notify(&base, title, body).await,
            Target::Local => {
                let delivered = self.notify_local(title, body, config);
                if !delivered {
                    fallback(&format!("{title}: {body}"));
                }
                delivered
            }
        }
    }

    pub fn notify_local(&self, title: &str, body: &str, config: &Config) -> bool {
        let icon = resolve_icon(None, self.catalog.pack_icon(&config.default_pack), &self.paths);
        self.notifier.notify(title, body, Some(&icon))
    }

    pub async fn relay_health(&self, base: &str) -> bool {
        self.relay.health(base).await
    }
}
