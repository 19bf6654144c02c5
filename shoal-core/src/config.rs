//! Centralized configuration for Shoal.
//!
//! Every timeout, connection bound and retry policy used by the tracker and
//! the peer engine lives here, so no suspension point waits on an implicit value.

use std::time::Duration;

/// Central configuration for all Shoal components.
///
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct ShoalConfig {
    pub tracker: TrackerConfig,
    pub peer: PeerConfig,
    pub download: DownloadConfig,
}

/// Tracker service and tracker client settings.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Maximum concurrently served tracker connections
    pub max_connections: usize,
    /// Idle time after which the tracker drops a silent connection
    pub idle_timeout: Duration,
    /// Bound on a full tracker round-trip from the client side
    pub client_timeout: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_connections: 256,
            idle_timeout: Duration::from_secs(120),
            client_timeout: Duration::from_secs(10),
        }
    }
}

/// Peer listener and peer connection settings.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Maximum concurrently served inbound peer connections
    pub max_inbound_connections: usize,
    /// TCP connect timeout for outbound peer connections
    pub connect_timeout: Duration,
    /// Timeout for a single request/response exchange
    pub io_timeout: Duration,
    /// Idle time after which the listener drops a silent connection
    pub idle_timeout: Duration,
    /// Largest frame accepted on any connection
    pub max_frame_len: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            max_inbound_connections: 64,
            connect_timeout: Duration::from_secs(5),
            io_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
            max_frame_len: 16 * 1024 * 1024, // 16 MiB
        }
    }
}

/// Download session behavior.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Pieces fetched concurrently per session
    pub max_concurrent_pieces: usize,
    /// Piece size used when sharing new content
    pub default_piece_length: u32,
    /// Rounds over all peers before a piece fails the session (None = unlimited)
    pub max_piece_rounds: Option<u32>,
    /// First backoff delay after a round of peers is exhausted
    pub initial_backoff: Duration,
    /// Upper bound on the backoff delay
    pub max_backoff: Duration,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_concurrent_pieces: 4,
            default_piece_length: 512 * 1024, // 512 KiB
            max_piece_rounds: None,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.trim().parse().ok()
}

impl ShoalConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Unset or unparsable variables leave the default in place.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(count) = env_parse::<usize>("SHOAL_TRACKER_MAX_CONNECTIONS") {
            config.tracker.max_connections = count;
        }
        if let Some(seconds) = env_parse::<u64>("SHOAL_TRACKER_IDLE_TIMEOUT") {
            config.tracker.idle_timeout = Duration::from_secs(seconds);
        }
        if let Some(seconds) = env_parse::<u64>("SHOAL_TRACKER_TIMEOUT") {
            config.tracker.client_timeout = Duration::from_secs(seconds);
        }

        if let Some(count) = env_parse::<usize>("SHOAL_MAX_INBOUND") {
            config.peer.max_inbound_connections = count;
        }
        if let Some(seconds) = env_parse::<u64>("SHOAL_CONNECT_TIMEOUT") {
            config.peer.connect_timeout = Duration::from_secs(seconds);
        }
        if let Some(seconds) = env_parse::<u64>("SHOAL_IO_TIMEOUT") {
            config.peer.io_timeout = Duration::from_secs(seconds);
        }
        if let Some(seconds) = env_parse::<u64>("SHOAL_PEER_IDLE_TIMEOUT") {
            config.peer.idle_timeout = Duration::from_secs(seconds);
        }

        if let Some(count) = env_parse::<usize>("SHOAL_MAX_CONCURRENT_PIECES") {
            config.download.max_concurrent_pieces = count.max(1);
        }
        if let Some(length) = env_parse::<u32>("SHOAL_PIECE_LENGTH").filter(|&length| length > 0) {
            config.download.default_piece_length = length;
        }
        if let Some(rounds) = env_parse::<u32>("SHOAL_MAX_PIECE_ROUNDS") {
            config.download.max_piece_rounds = (rounds > 0).then_some(rounds);
        }

        config
    }

    /// Creates a configuration optimized for testing: short timeouts and backoff.
    pub fn for_testing() -> Self {
        Self {
            tracker: TrackerConfig {
                max_connections: 32,
                idle_timeout: Duration::from_secs(5),
                client_timeout: Duration::from_secs(2),
            },
            peer: PeerConfig {
                max_inbound_connections: 16,
                connect_timeout: Duration::from_millis(500),
                io_timeout: Duration::from_secs(2),
                idle_timeout: Duration::from_secs(5),
                ..PeerConfig::default()
            },
            download: DownloadConfig {
                initial_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(100),
                ..DownloadConfig::default()
            },
        }
    }
}
