//! Progressive-backoff log throttling.
//!
//! Keyed by a normalized message pattern (numeric runs collapsed to
//! `#`, truncated to 100 chars). Each key passes through phases: the
//! first N occurrences log verbatim, then every K-th for a window of M
//! occurrences with a `(repeated X times)` suffix, then every L-th for
//! a wider window, then at most once per a fixed interval.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

const MAX_KEY_LEN: usize = 100;

/// A named backoff shape: how many verbatim logs, then the two
/// progressively wider (interval, window) phases, then the terminal
/// once-per-interval rate.
#[derive(Debug, Clone, Copy)]
pub struct Profile {
    pub first: u64,
    pub medium_interval: u64,
    pub medium_window: u64,
    pub large_interval: u64,
    pub large_window: u64,
    pub terminal_interval: Duration,
}

impl Profile {
    pub const GENERAL: Profile = Profile {
        first: 5,
        medium_interval: 20,
        medium_window: 20,
        large_interval: 100,
        large_window: 100,
        terminal_interval: Duration::from_secs(24 * 3600),
    };

    pub const FFMPEG_ISH: Profile = Profile {
        first: 1,
        medium_interval: 100,
        medium_window: 1000,
        large_interval: 1000,
        large_window: 100_000,
        terminal_interval: Duration::from_secs(3600),
    };
}

struct KeyState {
    total: u64,
    since_last_log: u64,
    last_logged_at: Option<Instant>,
}

impl KeyState {
    fn new() -> Self {
        Self {
            total: 0,
            since_last_log: 0,
            last_logged_at: None,
        }
    }
}

/// Progressive-backoff throttler. One instance typically covers all
/// keys for a given profile; distinct error sources pass distinct keys.
pub struct LogThrottler {
    state: RwLock<HashMap<String, KeyState>>,
    profile: Profile,
}

impl LogThrottler {
    pub fn new(profile: Profile) -> Self {
        Self {
            state: RwLock::new(HashMap::new()),
            profile,
        }
    }

    pub fn general() -> Self {
        Self::new(Profile::GENERAL)
    }

    pub fn ffmpeg_ish() -> Self {
        Self::new(Profile::FFMPEG_ISH)
    }

    /// Returns `Some(suffix)` (empty string in the first phase) if this
    /// occurrence should be logged, `None` if it should be suppressed.
    pub fn should_log(&self, raw_key: &str) -> Option<String> {
        let key = normalize(raw_key);
        let mut map = self.state.write();
        let entry = map.entry(key).or_insert_with(KeyState::new);
        entry.total += 1;
        entry.since_last_log += 1;

        let p = &self.profile;
        let log = if entry.total <= p.first {
            true
        } else if entry.total <= p.first + p.medium_window {
            (entry.total - p.first) % p.medium_interval == 0
        } else if entry.total <= p.first + p.medium_window + p.large_window {
            (entry.total - p.first - p.medium_window) % p.large_interval == 0
        } else {
            entry
                .last_logged_at
                .map(|t| t.elapsed() >= p.terminal_interval)
                .unwrap_or(true)
        };

        if !log {
            return None;
        }

        let suffix = if entry.since_last_log > 1 {
            format!(" (repeated {} times)", entry.since_last_log)
        } else {
            String::new()
        };
        entry.since_last_log = 0;
        entry.last_logged_at = Some(Instant::now());
        Some(suffix)
    }

    /// Clear state for one key (e.g. on successful reconnect).
    pub fn reset(&self, raw_key: &str) {
        self.state.write().remove(&normalize(raw_key));
    }

    pub fn reset_all(&self) {
        self.state.write().clear();
    }

    pub fn len(&self) -> usize {
        self.state.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LogThrottler {
    fn default() -> Self {
        Self::general()
    }
}

/// Collapse runs of ASCII digits to `#` and cap at 100 chars, so
/// messages that only differ by an embedded counter or timestamp share
/// one throttling key.
fn normalize(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len().min(MAX_KEY_LEN));
    let mut in_run = false;
    for ch in raw.chars() {
        if ch.is_ascii_digit() {
            if !in_run {
                out.push('#');
                in_run = true;
            }
        } else {
            out.push(ch);
            in_run = false;
        }
        if out.len() >= MAX_KEY_LEN {
            break;
        }
    }
    out.truncate(MAX_KEY_LEN);
    out
}

/// Macro for throttled warning logging.
#[macro_export]
macro_rules! warn_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if let Some(suffix) = $throttler.should_log($key) {
            tracing::warn!(concat!($($arg)*, "{suffix}"), suffix = suffix);
        }
    };
}

/// Macro for throttled error logging.
#[macro_export]
macro_rules! error_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if let Some(suffix) = $throttler.should_log($key) {
            tracing::error!(concat!($($arg)*, "{suffix}"), suffix = suffix);
        }
    };
}

/// Macro for throttled info logging.
#[macro_export]
macro_rules! info_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if let Some(suffix) = $throttler.should_log($key) {
            tracing::info!(concat!($($arg)*, "{suffix}"), suffix = suffix);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn general_profile_logs_first_five_verbatim() {
        let throttler = LogThrottler::general();
        for _ in 0..5 {
            assert!(throttler.should_log("boom").is_some());
        }
        assert!(throttler.should_log("boom").is_none());
    }

    #[test]
    fn general_profile_logs_every_20th_in_medium_phase() {
        let throttler = LogThrottler::general();
        for _ in 0..5 {
            throttler.should_log("boom");
        }
        for i in 1..=20u64 {
            let logged = throttler.should_log("boom").is_some();
            assert_eq!(logged, i % 20 == 0, "occurrence {i}");
        }
    }

    #[test]
    fn numeric_runs_are_normalized_to_a_shared_key() {
        let throttler = LogThrottler::general();
        assert!(throttler.should_log("retry attempt 1 failed").is_some());
        assert!(throttler.should_log("retry attempt 2 failed").is_none());
    }

    #[test]
    fn reset_clears_state_for_a_key() {
        let throttler = LogThrottler::general();
        for _ in 0..5 {
            throttler.should_log("boom");
        }
        assert!(throttler.should_log("boom").is_none());
        throttler.reset("boom");
        assert!(throttler.should_log("boom").is_some());
    }

    #[test]
    fn different_keys_are_independent() {
        let throttler = LogThrottler::general();
        assert!(throttler.should_log("key1").is_some());
        assert!(throttler.should_log("key2").is_some());
    }
}
