use clap::ValueEnum;

use crate::category::Category;
use crate::config::Config;

/// Lifecycle triggers delivered by the host through `soundcue hook <event>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum HookEvent {
    /// A new agent session began.
    SessionStart,
    /// The user submitted a prompt; rapid repeats escalate to `user.spam`.
    Prompt,
    /// The agent finished its turn.
    Stop,
    /// A tool call failed.
    ToolError,
    /// The agent is blocked waiting for the user (permission, question).
    InputRequired,
    /// Context or rate limit reached.
    ResourceLimit,
}

impl HookEvent {
    pub fn category(self) -> Category {
        match self {
            HookEvent::SessionStart => Category::SessionStart,
            HookEvent::Prompt => Category::TaskAcknowledge,
            HookEvent::Stop => Category::TaskComplete,
            HookEvent::ToolError => Category::TaskError,
            HookEvent::InputRequired => Category::InputRequired,
            HookEvent::ResourceLimit => Category::ResourceLimit,
        }
    }

    /// Desktop notification body for events that warrant one.
    pub fn notification_body(self) -> Option<&'static str> {
        match self {
            HookEvent::Stop => Some("Task complete"),
            HookEvent::InputRequired => Some("Input required"),
            _ => None,
        }
    }
}

/// Events consumed by the relay daemon's main loop.
pub enum RelayEvent {
    /// The config file changed on disk and was successfully re-parsed.
    ConfigReloaded(Config),
    /// A play request was handled; `None` for notify requests.
    Served(Option<Category>),
    /// Ctrl+C received; the daemon should write its final status and exit.
    Shutdown,
}
