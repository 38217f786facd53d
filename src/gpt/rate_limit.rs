use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::RateLimits;
use crate::error::{GptError, Result};

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(60 * 60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy)]
struct Window {
    length: Duration,
    capacity: u32,
}

#[derive(Debug, Clone, Copy)]
struct WindowState {
    started: Instant,
    used: u32,
}

impl WindowState {
    fn roll(&mut self, window: &Window, now: Instant) {
        if now.duration_since(self.started) >= window.length {
            self.started = now;
            self.used = 0;
        }
    }

    fn resets_in(&self, window: &Window, now: Instant) -> Duration {
        (self.started + window.length).saturating_duration_since(now)
    }
}

/// Per-caller request budget over a minute, an hour and a day.
///
/// A request goes through only if all three windows have room, and then it
/// is charged to all three. A rejected request is not charged.
#[derive(Debug)]
pub struct RateLimiter {
    windows: [Window; 3],
    callers: Mutex<HashMap<String, [WindowState; 3]>>,
}

impl RateLimiter {
    pub fn new(limits: RateLimits) -> Self {
        Self {
            windows: [
                Window { length: MINUTE, capacity: limits.per_minute },
                Window { length: HOUR, capacity: limits.per_hour },
                Window { length: DAY, capacity: limits.per_day },
            ],
            callers: Mutex::new(HashMap::new()),
        }
    }

    pub fn check(&self, caller: &str) -> Result<()> {
        self.check_at(caller, Instant::now())
    }

    pub fn check_at(&self, caller: &str, now: Instant) -> Result<()> {
        let mut callers = self.callers.lock().unwrap_or_else(|e| e.into_inner());
        // Callers with every window expired have nothing left to remember
        callers.retain(|_, states| !self.all_expired(states, now));
        let states = callers
            .entry(caller.to_string())
            .or_insert([WindowState { started: now, used: 0 }; 3]);

        let mut retry_after: Option<Duration> = None;
        for (state, window) in states.iter_mut().zip(&self.windows) {
            state.roll(window, now);
            if state.used >= window.capacity {
                let wait = state.resets_in(window, now);
                retry_after = Some(retry_after.map_or(wait, |w| w.max(wait)));
            }
        }

        if let Some(retry_after) = retry_after {
            log::info!("Rate limit hit for {}, retry in {:?}", caller, retry_after);
            return Err(GptError::RateLimited { retry_after });
        }

        for state in states.iter_mut() {
            state.used += 1;
        }
        Ok(())
    }

    fn all_expired(&self, states: &[WindowState; 3], now: Instant) -> bool {
        states
            .iter()
            .zip(&self.windows)
            .all(|(state, window)| now.duration_since(state.started) >= window.length)
    }
}
