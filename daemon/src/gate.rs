//! Decides whether an incoming category should produce any sound at all, and
//! applies the session-state bookkeeping that goes with it.
//!
//! Pure over its inputs: the caller supplies `now` and persists the state
//! afterwards when [`Decision::state_changed`] is set, whether or not anything
//! ends up playing.
use crate::category::Category;
use crate::config::Config;
use crate::state::SessionState;

/// Minimum spacing between two `task.complete` sounds.
pub const TASK_COMPLETE_DEBOUNCE_MS: i64 = 5_000;
/// Completions this soon after session start are treated as spurious.
pub const SESSION_START_GRACE_MS: i64 = 3_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub act: bool,
    /// Category to play; differs from the requested one only on escalation.
    pub category: Category,
    pub escalated: bool,
    pub state_changed: bool,
}

impl Decision {
    fn new(category: Category) -> Self {
        Self {
            act: false,
            category,
            escalated: false,
            state_changed: false,
        }
    }
}

pub fn decide(requested: Category, config: &Config, state: &mut SessionState, now: i64) -> Decision {
    let mut decision = Decision::new(requested);

    match requested {
        Category::SessionStart => {
            state.session_start_time = now;
            state.prompt_timestamps.clear();
            decision.state_changed = true;
        }
        Category::TaskAcknowledge => {
            state.prune_prompts(now, config.annoyed_window_ms());
            state.push_prompt(now);
            decision.state_changed = true;
            let recent = u64::try_from(state.prompt_timestamps.len()).unwrap_or(u64::MAX);
            if recent >= u64::from(config.annoyed_threshold) {
                decision.category = Category::UserSpam;
                decision.escalated = true;
            }
        }
        Category::TaskComplete => {
            if now.saturating_sub(state.last_stop_time) < TASK_COMPLETE_DEBOUNCE_MS {
                return decision;
            }
            state.last_stop_time = now;
            decision.state_changed = true;

            if now.saturating_sub(state.session_start_time) < SESSION_START_GRACE_MS {
                return decision;
            }
            let silent_ms = config.silent_window_ms();
            if silent_ms > 0 {
                if let Some(&last_prompt) = state.prompt_timestamps.last() {
                    if now.saturating_sub(last_prompt) < silent_ms {
                        return decision;
                    }
                }
            }
        }
        _ => {}
    }

    if !config.enabled || state.paused {
        return decision;
    }
    if !config.is_category_enabled(requested) || !config.is_category_enabled(decision.category) {
        return decision;
    }

    decision.act = true;
    decision
}
