//! Tunables for a [`crate::connection::Connection`].
//!
//! Unlike `kimberlite-config`'s hierarchical TOML loader, this crate is
//! embedded into a host process rather than run as its own daemon: callers
//! construct a [`Config`] value directly (or take the documented defaults)
//! rather than pointing the crate at a config file on disk.

use serde::{Deserialize, Serialize};
use tracing::Level;

/// Tunables a conforming implementation exposes, per spec §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Period between keepalive pings sent on an idle stream.
    pub keepalive_period_ms: u64,

    /// Ceiling on concurrently in-flight correlated requests (I2).
    pub max_open_requests: usize,

    /// How long a blocking call waits for its response before `Timeout`.
    pub request_timeout_s: u64,

    /// Delay between reconnect attempts while `Reconnecting`.
    pub reconnect_backoff_s: u64,

    /// Attempts `send_blocking` makes to hand a stanza to the transport
    /// before giving up and waiting out the remaining request timeout.
    pub send_retries: u32,

    /// Budget given to one `run_once` tick of the wire session.
    pub event_loop_timeout_ms: u64,

    /// How long `send_nonblocking` waits to nudge the event loop.
    pub send_request_timeout_us: u64,

    /// Notification queue bound (I3).
    pub notify_queue_max: usize,

    /// Verbosity the connection records for its own diagnostics; actual
    /// emission always goes through the process's `tracing` subscriber.
    #[serde(with = "level_serde")]
    pub log_level: Level,

    /// Cap on reconnect attempts before `Reconnecting` gives up and
    /// transitions to `Disconnected`. `None` retries forever, matching the
    /// historical (likely unintentional) behaviour documented in spec §9;
    /// the default resolves that Open Question with a finite cap.
    pub reconnect_max: Option<u32>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            keepalive_period_ms: 30_000,
            max_open_requests: 100,
            request_timeout_s: 1000,
            reconnect_backoff_s: 5,
            send_retries: 3,
            event_loop_timeout_ms: 1,
            send_request_timeout_us: 1000,
            notify_queue_max: 100,
            log_level: Level::INFO,
            reconnect_max: Some(12),
        }
    }
}

impl Config {
    /// Configuration for tests: short timeouts and small bounds so tests
    /// that exercise timeout/overflow paths run quickly.
    pub fn testing() -> Self {
        Self {
            keepalive_period_ms: 100,
            max_open_requests: 4,
            request_timeout_s: 1,
            reconnect_backoff_s: 0,
            send_retries: 1,
            event_loop_timeout_ms: 1,
            send_request_timeout_us: 100,
            notify_queue_max: 3,
            log_level: Level::DEBUG,
            reconnect_max: Some(2),
        }
    }
}

mod level_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use tracing::Level;

    pub fn serialize<S: Serializer>(level: &Level, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(level.as_str())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Level, D::Error> {
        let raw = String::deserialize(d)?;
        raw.parse::<Level>().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_spec_defaults() {
        let config = Config::default();
        assert_eq!(config.keepalive_period_ms, 30_000);
        assert_eq!(config.max_open_requests, 100);
        assert_eq!(config.request_timeout_s, 1000);
        assert_eq!(config.reconnect_backoff_s, 5);
        assert_eq!(config.send_retries, 3);
        assert_eq!(config.event_loop_timeout_ms, 1);
        assert_eq!(config.send_request_timeout_us, 1000);
        assert_eq!(config.notify_queue_max, 100);
        assert_eq!(config.reconnect_max, Some(12));
    }

    #[test]
    fn testing_config_has_small_bounds() {
        let config = Config::testing();
        assert_eq!(config.max_open_requests, 4);
        assert_eq!(config.notify_queue_max, 3);
    }
}
