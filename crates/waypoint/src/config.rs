//! Matchmaking configuration.
//!
//! Every timing constant used by the backends, the registration state
//! machine and the handshake lives here so it can be tuned from the
//! launcher's TOML file. Durations are stored as integer milliseconds or
//! seconds (TOML has no duration type) and exposed as [`Duration`]s.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for discovery, hosting and admission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchmakingConfig {
    /// Game version string advertised and compared on handshake
    pub game_version: String,
    /// Network protocol version; peers must match exactly
    pub network_version: u32,
    /// Minimum interval between public list searches on one backend
    pub refresh_interval_ms: u64,
    /// Public list searches not completed within this window are abandoned
    pub search_timeout_ms: u64,
    /// Pings not answered within this window resolve as "none"
    pub ping_timeout_ms: u64,
    /// Upper bound on concurrently pending pings per backend
    pub max_pending_pings: usize,
    /// Entity-session searches fetch at most this many pages
    pub search_page_limit: u32,
    /// Minimum delay between two submissions from the entity search queue
    pub search_submit_spacing_ms: u64,
    /// Join-code regenerations before hosting gives up
    pub join_code_retries: u32,
    /// Lobby liveness refresh is scheduled uniformly within [min, max]
    pub lobby_refresh_min_secs: u64,
    pub lobby_refresh_max_secs: u64,
    /// Wait before recreating a lost network session
    pub reconnect_delay_ms: u64,
    /// Shorter wait for disconnects that allow fast recovery
    pub fast_reconnect_delay_ms: u64,
    /// Waits longer than this force a network reset halfway through
    pub forced_reset_threshold_ms: u64,
    /// Registration request retry: min(base * 2^(attempt-1), cap) * jitter
    pub retry_base_ms: u64,
    pub retry_cap_ms: u64,
    /// Lower bound of the jitter factor; the upper bound is 1.0
    pub retry_jitter_min: f64,
    /// Failed registration attempts before hosting gives up
    pub registration_max_attempts: u32,
    /// Admission cap on a hosted session
    pub max_players: u32,
}

impl Default for MatchmakingConfig {
    fn default() -> Self {
        Self {
            game_version: "0.1.0".to_string(),
            network_version: 1,
            refresh_interval_ms: 2_000,
            search_timeout_ms: 10_000,
            ping_timeout_ms: 5_000,
            max_pending_pings: 32,
            search_page_limit: 4,
            search_submit_spacing_ms: 1_000,
            join_code_retries: 5,
            lobby_refresh_min_secs: 240,
            lobby_refresh_max_secs: 300,
            reconnect_delay_ms: 30_000,
            fast_reconnect_delay_ms: 5_000,
            forced_reset_threshold_ms: 10_000,
            retry_base_ms: 2_000,
            retry_cap_ms: 60_000,
            retry_jitter_min: 0.5,
            registration_max_attempts: 10,
            max_players: 10,
        }
    }
}

impl MatchmakingConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn search_timeout(&self) -> Duration {
        Duration::from_millis(self.search_timeout_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn search_submit_spacing(&self) -> Duration {
        Duration::from_millis(self.search_submit_spacing_ms)
    }

    pub fn lobby_refresh_window(&self) -> (Duration, Duration) {
        (
            Duration::from_secs(self.lobby_refresh_min_secs),
            Duration::from_secs(self.lobby_refresh_max_secs),
        )
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn fast_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.fast_reconnect_delay_ms)
    }

    pub fn forced_reset_threshold(&self) -> Duration {
        Duration::from_millis(self.forced_reset_threshold_ms)
    }

    /// Checks the configuration for values the state machines cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network_version == 0 {
            return Err(ConfigError::Zero {
                field: "network_version",
            });
        }
        if self.ping_timeout_ms == 0 {
            return Err(ConfigError::Zero {
                field: "ping_timeout_ms",
            });
        }
        if self.search_page_limit == 0 {
            return Err(ConfigError::Zero {
                field: "search_page_limit",
            });
        }
        if self.max_players == 0 {
            return Err(ConfigError::Zero {
                field: "max_players",
            });
        }
        if self.max_pending_pings == 0 {
            return Err(ConfigError::Zero {
                field: "max_pending_pings",
            });
        }
        if self.lobby_refresh_min_secs > self.lobby_refresh_max_secs {
            return Err(ConfigError::Invalid(format!(
                "lobby_refresh_min_secs ({}) exceeds lobby_refresh_max_secs ({})",
                self.lobby_refresh_min_secs, self.lobby_refresh_max_secs
            )));
        }
        if self.retry_base_ms > self.retry_cap_ms {
            return Err(ConfigError::Invalid(format!(
                "retry_base_ms ({}) exceeds retry_cap_ms ({})",
                self.retry_base_ms, self.retry_cap_ms
            )));
        }
        if !(0.0..=1.0).contains(&self.retry_jitter_min) {
            return Err(ConfigError::Invalid(format!(
                "retry_jitter_min must be within [0, 1], got {}",
                self.retry_jitter_min
            )));
        }
        if self.fast_reconnect_delay_ms > self.reconnect_delay_ms {
            return Err(ConfigError::Invalid(
                "fast_reconnect_delay_ms must not exceed reconnect_delay_ms".to_string(),
            ));
        }
        Ok(())
    }
}
