//! Tracker service and client.
//!
//! The tracker keeps per-swarm membership keyed by content id and answers
//! announces with the other members of the swarm. It never touches piece data.

pub mod client;
pub mod server;
pub mod swarm;

use async_trait::async_trait;

pub use client::TcpTrackerClient;
pub use server::{TrackerHandle, TrackerServer};
pub use swarm::{SwarmRegistry, SwarmSummary};

pub use super::protocol::{AnnounceEvent, AnnounceRequest};
use super::TorrentError;
use super::metainfo::TrackerEndpoint;
use super::protocol::PeerAddress;

/// Abstract tracker communication interface.
///
/// Lets the peer engine run against the TCP tracker or an in-process stand-in.
#[async_trait]
pub trait TrackerClient: Send + Sync {
    /// Announces membership changes and returns the other members of the swarm.
    ///
    /// # Errors
    ///
    /// - `TorrentError::Rejected` - If the tracker answered with an error response
    /// - `TorrentError::PeerUnreachable` / `TorrentError::Timeout` - If the tracker is unreachable
    async fn announce(&self, request: AnnounceRequest) -> Result<Vec<PeerAddress>, TorrentError>;

    /// Lists every swarm the tracker knows.
    ///
    /// # Errors
    ///
    /// - `TorrentError::PeerUnreachable` / `TorrentError::Timeout` - If the tracker is unreachable
    /// - `TorrentError::MalformedMessage` - If the response cannot be parsed
    async fn list_swarms(&self) -> Result<Vec<SwarmSummary>, TorrentError>;

    /// Returns the tracker endpoint for logging.
    fn endpoint(&self) -> &TrackerEndpoint;
}
