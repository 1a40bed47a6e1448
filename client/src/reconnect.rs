//! Change-stream liveness: heartbeats to notice a dead connection, and
//! reconnection with exponential backoff.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// How a live table re-establishes a lost change stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// Whether to reconnect at all; when false a lost stream is surfaced at once.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Delay before the first attempt.
    #[serde(default = "default_initial_delay", with = "duration_millis")]
    pub initial_delay: Duration,

    /// Upper bound on the delay between attempts.
    #[serde(default = "default_max_delay", with = "duration_millis")]
    pub max_delay: Duration,

    /// Factor applied to the delay after each attempt.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Attempts before giving up (`None` retries forever).
    #[serde(default = "default_max_retries")]
    pub max_retries: Option<u32>,

    /// Spread attempts by up to a quarter of the delay.
    #[serde(default)]
    pub jitter: bool,
}

fn default_enabled() -> bool {
    true
}

fn default_initial_delay() -> Duration {
    Duration::from_millis(250)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_retries() -> Option<u32> {
    Some(8)
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            max_retries: default_max_retries(),
            jitter: false,
        }
    }
}

impl ReconnectPolicy {
    /// Never reconnect.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

/// Keep-alive for a WebSocket change stream.
///
/// After `interval` without a frame the client sends a ping; if nothing
/// arrives within `timeout` after that, the stream is reported lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Idle time before a ping is sent.
    #[serde(default = "default_ping_interval", with = "duration_millis")]
    pub interval: Duration,

    /// How long to wait for any frame after a ping.
    #[serde(default = "default_ping_timeout", with = "duration_millis")]
    pub timeout: Duration,
}

fn default_ping_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_ping_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self {
            interval: default_ping_interval(),
            timeout: default_ping_timeout(),
        }
    }
}

/// Retry state for one change stream.
#[derive(Debug)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
    current_delay: Duration,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        let current_delay = policy.initial_delay;
        Self {
            policy,
            attempt: 0,
            current_delay,
        }
    }

    /// Attempts made since the last successful connection.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Whether the retry budget is used up.
    pub fn exhausted(&self) -> bool {
        !self.policy.enabled
            || self
                .policy
                .max_retries
                .is_some_and(|max| self.attempt >= max)
    }

    /// Reset after a successful connection.
    pub fn reset(&mut self) {
        if self.attempt > 0 {
            debug!(attempts = self.attempt, "change stream re-established, reset retry state");
        }
        self.attempt = 0;
        self.current_delay = self.policy.initial_delay;
    }

    /// The delay before the next attempt, or `None` when the caller should
    /// give up.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.exhausted() {
            warn!(
                attempts = self.attempt,
                max = ?self.policy.max_retries,
                "reconnection retries exhausted"
            );
            return None;
        }

        self.attempt += 1;
        let delay = self.current_delay;

        let delay = if self.policy.jitter {
            let range = delay.as_millis() as f64 * 0.25;
            // Deterministic spread keyed on the attempt number.
            let offset = if range > 0.0 {
                (f64::from(self.attempt) * 7.0 % range) - range / 2.0
            } else {
                0.0
            };
            Duration::from_millis((delay.as_millis() as f64 + offset).max(1.0) as u64)
        } else {
            delay
        };

        let next_ms = (self.current_delay.as_millis() as f64 * self.policy.backoff_multiplier) as u64;
        self.current_delay = Duration::from_millis(next_ms).min(self.policy.max_delay);

        debug!(
            attempt = self.attempt,
            delay_ms = delay.as_millis() as u64,
            "scheduling change stream reconnect"
        );
        Some(delay)
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
