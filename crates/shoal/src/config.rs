use std::env;
use std::time::Duration;

use shoal_proto::DEFAULT_ROOM;

/// Tunables for one mirroring session. Every field has a working default;
/// `from_env` is for deployments that want to adjust without recompiling.
#[derive(Debug, Clone)]
pub struct MirrorConfig {
    /// Room name stamped on every envelope and connection.
    pub room: String,
    /// Host the relay hub binds on. Loopback unless explicitly overridden;
    /// the hub has no authentication layer.
    pub bind_host: String,
    /// How long a follower's viewport measurement stays fresh. Bounds the
    /// cost of translating high-frequency pointer moves.
    pub viewport_cache_ttl: Duration,
    /// Leader-socket reopen attempts before falling back to a full rebuild.
    pub leader_retry_max: u32,
    /// First reopen delay; doubles per attempt.
    pub leader_retry_base_delay: Duration,
}

impl MirrorConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            room: env::var("SHOAL_ROOM").unwrap_or(defaults.room),
            bind_host: env::var("SHOAL_BIND_HOST").unwrap_or(defaults.bind_host),
            viewport_cache_ttl: env::var("SHOAL_VIEWPORT_CACHE_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.viewport_cache_ttl),
            leader_retry_max: env::var("SHOAL_LEADER_RETRY_MAX")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.leader_retry_max),
            leader_retry_base_delay: env::var("SHOAL_LEADER_RETRY_BASE_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.leader_retry_base_delay),
        }
    }
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            room: DEFAULT_ROOM.to_string(),
            bind_host: "127.0.0.1".to_string(),
            viewport_cache_ttl: Duration::from_millis(250),
            leader_retry_max: 5,
            leader_retry_base_delay: Duration::from_millis(100),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_loopback_and_bounded() {
        let config = MirrorConfig::default();
        assert_eq!(config.bind_host, "127.0.0.1");
        assert_eq!(config.room, DEFAULT_ROOM);
        assert_eq!(config.viewport_cache_ttl, Duration::from_millis(250));
        assert!(config.leader_retry_max > 0);
    }

    #[test]
    fn env_overrides_apply() {
        env::set_var("SHOAL_ROOM", "room-b");
        env::set_var("SHOAL_VIEWPORT_CACHE_MS", "500");
        env::set_var("SHOAL_LEADER_RETRY_MAX", "2");

        let config = MirrorConfig::from_env();
        assert_eq!(config.room, "room-b");
        assert_eq!(config.viewport_cache_ttl, Duration::from_millis(500));
        assert_eq!(config.leader_retry_max, 2);

        env::remove_var("SHOAL_ROOM");
        env::remove_var("SHOAL_VIEWPORT_CACHE_MS");
        env::remove_var("SHOAL_LEADER_RETRY_MAX");
    }

    #[test]
    fn unparseable_env_values_fall_back() {
        env::set_var("SHOAL_LEADER_RETRY_BASE_MS", "not-a-number");
        let config = MirrorConfig::from_env();
        assert_eq!(
            config.leader_retry_base_delay,
            MirrorConfig::default().leader_retry_base_delay
        );
        env::remove_var("SHOAL_LEADER_RETRY_BASE_MS");
    }
}
