//! Shoal Core - content distribution over a tracker and a swarm of peers
//!
//! This crate provides the canonical metadata codec, content splitting and
//! identification, the tracker service and the peer engine that shares and
//! downloads verified pieces.

pub mod codec;
pub mod config;
pub mod torrent;
pub mod tracing_setup;

pub use codec::{CodecError, Value};
pub use config::ShoalConfig;
pub use torrent::{ContentId, Metainfo, PeerEngine, TorrentError, TrackerServer};

/// Core errors that can bubble up from any Shoal subsystem.
#[derive(Debug, thiserror::Error)]
pub enum ShoalError {
    #[error("Torrent error: {0}")]
    Torrent(#[from] TorrentError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ShoalError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            ShoalError::Torrent(e) => match e {
                TorrentError::InvalidMetainfo { reason } => {
                    format!("Invalid metainfo: {reason}")
                }
                TorrentError::UnknownSwarm { content_id } => {
                    format!("Tracker does not know content {content_id}")
                }
                TorrentError::PeerUnreachable { address, .. } => {
                    format!("Could not reach {address}")
                }
                TorrentError::Timeout { address, .. } => {
                    format!("Timed out talking to {address}")
                }
                TorrentError::NoPeersAvailable => "No peers available for download".to_string(),
                TorrentError::Cancelled => "Download cancelled".to_string(),
                _ => "Transfer error occurred".to_string(),
            },
            ShoalError::Codec(_) => "Received malformed data".to_string(),
            ShoalError::Configuration { reason } => format!("Configuration error: {reason}"),
            ShoalError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            ShoalError::Configuration { .. }
                | ShoalError::Torrent(TorrentError::InvalidMetainfo { .. })
                | ShoalError::Torrent(TorrentError::UnknownSwarm { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, ShoalError>;
