mod audio;
mod category;
mod config;
mod event;
mod gate;
mod notification;
mod packs;
mod paths;
mod pipeline;
mod platform;
mod relay;
mod relay_server;
mod state;
mod status;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::audio::{Player, SoundPlayer};
use crate::category::Category;
use crate::event::{HookEvent, RelayEvent};
use crate::notification::DesktopNotifier;
use crate::paths::{Paths, APP_NAME};
use crate::pipeline::{Dispatcher, HookContext, PlayOutcome};
use crate::platform::PlatformProbe;
use crate::relay::{
    configured_relay_url, detect_remote_session, resolve_target, setup_instructions, RelayEnv,
    Target, DEFAULT_RELAY_HOST, DEFAULT_RELAY_PORT,
};
use crate::relay_server::{RelayContext, RelayServer};
use crate::status::{RelayState, RelayStatus};

const LOG_ENV: &str = "SOUNDCUE_LOG";
const PREVIEW_POLL: Duration = Duration::from_millis(100);

#[derive(Parser)]
#[command(name = "soundcue", version, about = "Themed sounds and desktop notifications for agent lifecycle events")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Deliver a lifecycle event from the host.
    Hook {
        #[arg(value_enum)]
        event: HookEvent,
        /// Project name for the notification title (defaults to the working directory name).
        #[arg(long)]
        project: Option<String>,
    },
    /// Play one category, e.g. `task.complete`.
    Play { category: Category },
    /// Show a desktop notification.
    Notify { title: String, body: String },
    /// Run the relay that remote sessions forward to.
    Relay {
        #[arg(long, default_value = DEFAULT_RELAY_HOST)]
        bind: IpAddr,
        #[arg(long, default_value_t = DEFAULT_RELAY_PORT)]
        port: u16,
    },
    /// Check that the relay is reachable.
    Health,
    Pause,
    Resume,
    Toggle,
    /// Print configuration, pause state and relay routing.
    Status,
    /// Manage installed sound packs.
    Packs {
        #[command(subcommand)]
        command: PacksCommand,
    },
}

#[derive(Subcommand)]
enum PacksCommand {
    List,
    /// Make a pack the active one.
    Use { id: String },
    /// Play a sample clip from a pack.
    Preview { id: String },
}

fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(match cli.command {
        Command::Relay { .. } => "info",
        _ => "warn",
    });

    let paths = Paths::from_env()?;
    let probe = Arc::new(PlatformProbe::new());
    let player = Arc::new(Player::new(Arc::clone(&probe)).with_pid_file(paths.player_file()));
    let notifier = Arc::new(DesktopNotifier::new(probe));
    let dispatcher = Dispatcher::new(player.clone(), notifier, paths.clone());

    match cli.command {
        Command::Hook { event, project } => run_hook(&dispatcher, &paths, event, project).await,
        Command::Play { category } => play(&dispatcher, &paths, category).await,
        Command::Notify { title, body } => {
            let config = config::load(&paths.config_file());
            let env = RelayEnv::from_process();
            dispatcher
                .send_notification(&title, &body, &config, &env, |m| eprintln!("{m}"))
                .await;
            Ok(())
        }
        Command::Relay { bind, port } => {
            run_relay(dispatcher, &paths, SocketAddr::new(bind, port)).await
        }
        Command::Health => health(&dispatcher, &paths).await,
        Command::Pause => set_paused(&paths, |_| true),
        Command::Resume => set_paused(&paths, |_| false),
        Command::Toggle => set_paused(&paths, |paused| !paused),
        Command::Status => {
            print_status(&dispatcher, &paths);
            Ok(())
        }
        Command::Packs { command } => match command {
            PacksCommand::List => {
                list_packs(&dispatcher, &paths);
                Ok(())
            }
            PacksCommand::Use { id } => use_pack(&dispatcher, &paths, &id),
            PacksCommand::Preview { id } => preview_pack(&dispatcher, &player, &paths, &id).await,
        },
    }
}

// ── hook ──────────────────────────────────────────────────────────────────────

fn notification_title(project: Option<String>) -> String {
    let project = project.filter(|p| !p.is_empty()).or_else(|| {
        std::env::current_dir()
            .ok()
            .and_then(|d| d.file_name().map(|n| n.to_string_lossy().into_owned()))
    });
    match project {
        Some(name) => format!("{APP_NAME} · {name}"),
        None => APP_NAME.to_string(),
    }
}

async fn run_hook(
    dispatcher: &Dispatcher,
    paths: &Paths,
    event: HookEvent,
    project: Option<String>,
) -> Result<()> {
    let config = config::load(&paths.config_file());
    let mut state = state::load(&paths.state_file());
    let env = RelayEnv::from_process();
    let title = notification_title(project);
    let ctx = HookContext {
        config: &config,
        env: &env,
        title: &title,
        now: chrono::Utc::now().timestamp_millis(),
    };

    if dispatcher
        .handle_event(event, &ctx, &mut state, |m| eprintln!("{m}"))
        .await
    {
        state::save_or_warn(&paths.state_file(), &state);
    }
    Ok(())
}

// ── play ──────────────────────────────────────────────────────────────────────

async fn play(dispatcher: &Dispatcher, paths: &Paths, category: Category) -> Result<()> {
    let config = config::load(&paths.config_file());
    if !config.is_category_enabled(category) {
        println!("{category} is disabled");
        return Ok(());
    }
    let mut state = state::load(&paths.state_file());
    let env = RelayEnv::from_process();
    match dispatcher
        .play_category(category, &config, &mut state, &env)
        .await
    {
        PlayOutcome::Played(sound) => {
            state::save_or_warn(&paths.state_file(), &state);
            println!("Playing {} ({})", sound.label, category.label());
        }
        PlayOutcome::Forwarded { delivered: true } => println!("Forwarded {category} to relay"),
        PlayOutcome::Forwarded { delivered: false } => bail!("Relay did not accept {category}"),
        PlayOutcome::Nothing => println!("Nothing to play for {category}"),
    }
    Ok(())
}

// ── relay ─────────────────────────────────────────────────────────────────────

async fn run_relay(dispatcher: Dispatcher, paths: &Paths, addr: SocketAddr) -> Result<()> {
    paths.ensure_dirs()?;
    let config_path = paths.config_file();
    let status_path = paths.relay_status_file();
    let shared_config = Arc::new(RwLock::new(config::load(&config_path)));
    let dispatcher = Arc::new(dispatcher);

    let (event_tx, mut event_rx) = mpsc::channel::<RelayEvent>(32);

    let ctx = Arc::new(RelayContext::new(
        Arc::clone(&dispatcher),
        Arc::clone(&shared_config),
        paths.state_file(),
        event_tx.clone(),
    ));
    let server = match RelayServer::bind(addr, ctx).await {
        Ok(server) => server,
        Err(e) => {
            let mut failed = RelayStatus::listening(addr.to_string());
            failed.state = RelayState::Stopped;
            failed.error = Some(format!("{e:#}"));
            status::write_status(&status_path, &failed);
            return Err(e);
        }
    };
    let local_addr = server.local_addr()?;

    let mut current_status = RelayStatus::listening(local_addr.to_string());
    status::write_status(&status_path, &current_status);

    // ── Background tasks ──────────────────────────────────────────────────────
    tokio::spawn(server.run());
    tokio::spawn(config::watch_config(config_path, event_tx.clone()));

    // Graceful shutdown on Ctrl+C.
    {
        let tx = event_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = tx.send(RelayEvent::Shutdown).await;
            }
        });
    }
    drop(event_tx);

    info!("{APP_NAME} relay v{} listening on http://{local_addr}", env!("CARGO_PKG_VERSION"));
    if !dispatcher.catalog().has_packs() {
        warn!(
            "No sound packs installed in {}; play requests will be silent",
            dispatcher.catalog().packs_dir().display()
        );
    }

    // ── Event loop ────────────────────────────────────────────────────────────
    while let Some(evt) = event_rx.recv().await {
        match evt {
            RelayEvent::ConfigReloaded(new_config) => {
                *shared_config.write().await = new_config;
            }
            RelayEvent::Served(category) => {
                current_status.record_request(category);
                status::write_status(&status_path, &current_status);
            }
            RelayEvent::Shutdown => {
                info!("Shutting down");
                dispatcher.player().stop();
                current_status.state = RelayState::Stopped;
                current_status.error = None;
                status::write_status(&status_path, &current_status);
                break;
            }
        }
    }
    Ok(())
}

async fn health(dispatcher: &Dispatcher, paths: &Paths) -> Result<()> {
    let config = config::load(&paths.config_file());
    let env = RelayEnv::from_process();
    // With local routing there is no relay in use; probe the one the
    // environment would point at.
    let base = match resolve_target(config.relay_mode, &env) {
        Target::Remote(base) => base,
        Target::Local => configured_relay_url(&env),
    };
    if dispatcher.relay_health(&base).await {
        println!("Relay at {base} is healthy");
        Ok(())
    } else {
        bail!("Relay at {base} is not reachable")
    }
}

// ── pause / status ────────────────────────────────────────────────────────────

fn set_paused(paths: &Paths, update: impl FnOnce(bool) -> bool) -> Result<()> {
    let path = paths.state_file();
    let mut state = state::load(&path);
    state.paused = update(state.paused);
    state::save(&path, &state)?;
    println!("{APP_NAME} {}", if state.paused { "paused" } else { "resumed" });
    Ok(())
}

fn print_status(dispatcher: &Dispatcher, paths: &Paths) {
    let config = config::load(&paths.config_file());
    let state = state::load(&paths.state_file());
    let env = RelayEnv::from_process();

    println!("enabled:        {}", config.enabled);
    println!("paused:         {}", state.paused);
    println!("pack:           {}", config.default_pack);
    println!("volume:         {:.2}", config.volume);
    println!("notifications:  {}", config.desktop_notifications);
    let disabled: Vec<&str> = Category::ALL
        .into_iter()
        .filter(|c| !config.is_category_enabled(*c))
        .map(Category::as_str)
        .collect();
    if !disabled.is_empty() {
        println!("disabled:       {}", disabled.join(", "));
    }

    println!("relay mode:     {}", config.relay_mode);
    match resolve_target(config.relay_mode, &env) {
        Target::Local => println!("routing:        local playback"),
        Target::Remote(base) => println!("routing:        relay at {base}"),
    }
    if let Some(session) = detect_remote_session(&env) {
        println!("session:        {} ({})", session.kind, session.relay_url);
        println!();
        println!("{}", setup_instructions(session.kind));
    }

    if let Some(relay) = status::read_status(&paths.relay_status_file()) {
        let state = match relay.state {
            RelayState::Listening => "listening",
            RelayState::Stopped => "stopped",
        };
        println!("local relay:    {state} on {}", relay.bind_address);
        if let Some(error) = relay.error {
            println!("relay error:    {error}");
        }
    }

    if !dispatcher.catalog().has_packs() {
        println!();
        println!(
            "No sound packs installed in {}",
            dispatcher.catalog().packs_dir().display()
        );
    }
}

// ── packs ─────────────────────────────────────────────────────────────────────

fn list_packs(dispatcher: &Dispatcher, paths: &Paths) {
    let active = config::load(&paths.config_file()).default_pack;
    let packs = dispatcher.catalog().list_packs();
    if packs.is_empty() {
        println!(
            "No sound packs installed in {}",
            dispatcher.catalog().packs_dir().display()
        );
        return;
    }
    for pack in packs {
        let marker = if pack.id == active { "*" } else { " " };
        println!("{marker} {:<20} {}", pack.id, pack.display_name);
    }
}

fn use_pack(dispatcher: &Dispatcher, paths: &Paths, id: &str) -> Result<()> {
    if dispatcher.catalog().manifest(id).is_none() {
        bail!(
            "Pack '{id}' is not installed in {}",
            dispatcher.catalog().packs_dir().display()
        );
    }
    let path = paths.config_file();
    // Refuse to overwrite a config file we could not parse.
    let mut config = config::load_or_default(&path)?;
    config.default_pack = id.to_string();
    config::save(&path, &config)?;
    println!("Active pack: {id}");
    Ok(())
}

async fn preview_pack(dispatcher: &Dispatcher, player: &Player, paths: &Paths, id: &str) -> Result<()> {
    let Some(sound) = dispatcher.catalog().preview_sound(id) else {
        bail!("Pack '{id}' has no playable sounds");
    };
    let config = config::load(&paths.config_file());
    player.play(&sound, config.volume);
    if !player.is_playing() {
        bail!("No audio player available on this machine");
    }
    println!("Previewing {} (Ctrl+C to stop)", sound.display());

    let finished = async {
        while player.is_playing() {
            tokio::time::sleep(PREVIEW_POLL).await;
        }
    };
    tokio::select! {
        _ = finished => {}
        _ = tokio::signal::ctrl_c() => {
            player.stop();
            // Give the watcher task a moment to deliver the kill.
            tokio::time::sleep(PREVIEW_POLL).await;
        }
    }
    Ok(())
}
