use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartSettings {
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
    /// A crash this long after the previous restart starts a fresh sequence.
    pub reset_after_secs: u64,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for RestartSettings {
    fn default() -> Self {
        Self {
            base_delay_secs: 1,
            max_delay_secs: 30,
            reset_after_secs: 60,
            max_attempts: None,
        }
    }
}

/// Exponential backoff bookkeeping for one process.
///
/// delay = min(base * 2^(attempt - 1), max), where `attempt` counts
/// consecutive crashes and falls back to 1 once the process stayed up longer
/// than the reset window.
#[derive(Debug, Clone, Default)]
pub struct RestartBackoff {
    attempt: u32,
    last_restart: Option<Instant>,
}

impl RestartBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Records a crash at `now` and returns the delay before the next start,
    /// or `None` when the configured attempt ceiling has been reached.
    pub fn next_delay(&mut self, settings: &RestartSettings, now: Instant) -> Option<Duration> {
        let window = Duration::from_secs(settings.reset_after_secs);
        if let Some(last) = self.last_restart {
            if now.saturating_duration_since(last) > window {
                self.attempt = 0;
            }
        }

        if let Some(max) = settings.max_attempts {
            if self.attempt >= max {
                return None;
            }
        }

        self.attempt = self.attempt.saturating_add(1);
        self.last_restart = Some(now);

        let exponent = (self.attempt - 1).min(31);
        let secs = settings
            .base_delay_secs
            .saturating_mul(1u64 << exponent)
            .min(settings.max_delay_secs);
        Some(Duration::from_secs(secs))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.last_restart = None;
    }
}
