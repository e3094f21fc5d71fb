use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use serde_json::Value as JsonValue;
use serde_json::json;
use tracing::warn;

const WINDOW: Duration = Duration::from_secs(60);
const BLOCK_DURATION: Duration = Duration::from_secs(300);
const DEFAULT_LIMIT: u32 = 30;

/// Per-command request limits inside the sliding window.
fn default_limits() -> HashMap<String, u32> {
    let mut limits = HashMap::new();
    for (cmd, limit) in [
        ("tunnel_start", 5),
        ("tunnel_stop", 5),
        ("tunnel_generate_token", 3),
        ("analyze_repository", 3),
        ("grant_permission", 10),
        ("tunnel_validate_custom_token", 2),
        ("tunnel_set_custom_token", 2),
    ] {
        limits.insert(cmd.to_string(), limit);
    }
    limits
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    /// Denied; the caller may retry after this many seconds.
    Denied { retry_after: u64 },
}

struct State {
    limits: HashMap<String, u32>,
    history: HashMap<(String, String), VecDeque<Instant>>,
    blocked: HashMap<String, Instant>,
}

/// Sliding-window limiter keyed by (command, client id). Exceeding a limit
/// puts the client id on a temporary block list.
pub struct RateLimiter {
    state: Mutex<State>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                limits: default_limits(),
                history: HashMap::new(),
                blocked: HashMap::new(),
            }),
        }
    }

    pub fn check(&self, command: &str, client_id: &str) -> RateDecision {
        let now = Instant::now();
        let mut state = self.lock();

        if let Some(unblock_at) = state.blocked.get(client_id).copied() {
            if now < unblock_at {
                return RateDecision::Denied {
                    retry_after: (unblock_at - now).as_secs(),
                };
            }
            state.blocked.remove(client_id);
        }

        let limit = state
            .limits
            .get(command)
            .copied()
            .unwrap_or(DEFAULT_LIMIT);
        let key = (command.to_string(), client_id.to_string());
        let history = state.history.entry(key).or_default();
        while let Some(front) = history.front()
            && now.duration_since(*front) > WINDOW
        {
            history.pop_front();
        }
        if history.len() as u32 >= limit {
            warn!("rate limiter: blocking '{client_id}' for {}s (command {command})", BLOCK_DURATION.as_secs());
            state
                .blocked
                .insert(client_id.to_string(), now + BLOCK_DURATION);
            return RateDecision::Denied {
                retry_after: BLOCK_DURATION.as_secs(),
            };
        }
        history.push_back(now);
        RateDecision::Allowed
    }

    pub fn is_blocked(&self, client_id: &str) -> bool {
        let now = Instant::now();
        let mut state = self.lock();
        match state.blocked.get(client_id).copied() {
            Some(unblock_at) if now < unblock_at => true,
            Some(_) => {
                state.blocked.remove(client_id);
                false
            }
            None => false,
        }
    }

    /// Blocked client ids with seconds remaining.
    pub fn blocked(&self) -> HashMap<String, u64> {
        let now = Instant::now();
        let mut state = self.lock();
        state.blocked.retain(|_, unblock_at| *unblock_at > now);
        state
            .blocked
            .iter()
            .map(|(id, unblock_at)| (id.clone(), (*unblock_at - now).as_secs()))
            .collect()
    }

    pub fn unblock(&self, client_id: &str) -> bool {
        self.lock().blocked.remove(client_id).is_some()
    }

    pub fn set_limit(&self, command: &str, limit: u32) {
        self.lock().limits.insert(command.to_string(), limit);
    }

    pub fn limits(&self) -> HashMap<String, u32> {
        self.lock().limits.clone()
    }

    pub fn reset(&self) {
        let mut state = self.lock();
        state.limits = default_limits();
        state.history.clear();
        state.blocked.clear();
    }

    pub fn stats(&self) -> JsonValue {
        let state = self.lock();
        json!({
            "blocked_count": state.blocked.len(),
            "keys_tracked": state.history.len(),
            "limits": state.limits,
            "default_limit": DEFAULT_LIMIT,
            "time_window": WINDOW.as_secs(),
            "block_duration": BLOCK_DURATION.as_secs(),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
