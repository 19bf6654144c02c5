//! Content distribution: splitting, metainfo, tracker service and peer engine

pub mod creation;
pub mod downloader;
pub mod engine;
pub mod error_recovery;
pub mod listener;
pub mod metainfo;
pub mod piece_store;
pub mod protocol;
pub mod tracker;

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

pub use creation::{
    ContentSplitter, DEFAULT_PIECE_LENGTH, Piece, PieceReader, SplitOutcome, TorrentCreator,
};
pub use downloader::{DownloadHandle, DownloadReport, DownloadSession, PieceStatus};
pub use engine::PeerEngine;
pub use listener::{ListenerHandle, PeerListener};
pub use metainfo::{Metainfo, TrackerEndpoint};
pub use piece_store::{PieceStore, SharedFile, SharedFiles};
pub use protocol::{ErrorCode, PeerAddress};
pub use tracker::{
    AnnounceEvent, AnnounceRequest, SwarmRegistry, SwarmSummary, TcpTrackerClient, TrackerClient,
    TrackerHandle, TrackerServer,
};

use crate::codec::CodecError;

/// SHA-1 digest of one piece's raw bytes.
pub type PieceDigest = [u8; 20];

/// SHA-1 hash identifying a unique piece of shared content.
///
/// Computed over the canonical encoding of the metainfo `info` map, so the
/// same content announced through different trackers has the same identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContentId([u8; 20]);

impl ContentId {
    /// Creates ContentId from 20-byte SHA-1 hash.
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    /// Returns reference to underlying 20-byte hash.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Creates ContentId from a byte slice that must be exactly 20 bytes long.
    ///
    /// # Errors
    /// - `TorrentError::MalformedMessage` - If the slice has the wrong length
    pub fn from_slice(bytes: &[u8]) -> Result<Self, TorrentError> {
        let hash: [u8; 20] = bytes
            .try_into()
            .map_err(|_| TorrentError::MalformedMessage {
                reason: format!("content id must be 20 bytes, got {}", bytes.len()),
            })?;
        Ok(Self(hash))
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for ContentId {
    type Err = TorrentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim()).map_err(|e| TorrentError::InvalidMetainfo {
            reason: format!("invalid content id '{s}': {e}"),
        })?;
        Self::from_slice(&bytes).map_err(|_| TorrentError::InvalidMetainfo {
            reason: format!("content id '{s}' is not 40 hex characters"),
        })
    }
}

impl serde::Serialize for ContentId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

/// Zero-based index of a piece within shared content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PieceIndex(pub u32);

impl PieceIndex {
    /// Creates PieceIndex from zero-based index.
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the underlying piece index as u32.
    pub fn as_u32(self) -> u32 {
        self.0
    }

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PieceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors that can occur during content distribution.
///
/// Network and integrity failures are recoverable and handled inside the
/// downloader's retry loop; protocol rejections are reported to the caller
/// while the connection stays open.
#[derive(Debug, thiserror::Error)]
pub enum TorrentError {
    #[error("Invalid metainfo: {reason}")]
    InvalidMetainfo { reason: String },

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Piece {index} hash mismatch")]
    PieceHashMismatch { index: PieceIndex },

    #[error("Unknown swarm {content_id}")]
    UnknownSwarm { content_id: ContentId },

    #[error("Content {content_id} is not shared here")]
    ContentNotFound { content_id: ContentId },

    #[error("Piece index {index} out of range for {count} pieces")]
    InvalidPieceIndex { index: PieceIndex, count: u32 },

    #[error("Unknown request type '{kind}'")]
    UnknownRequestType { kind: String },

    #[error("Malformed message: {reason}")]
    MalformedMessage { reason: String },

    #[error("Metainfo hashes to {actual}, announced as {announced}")]
    ContentIdMismatch {
        announced: ContentId,
        actual: ContentId,
    },

    #[error("Remote rejected request ({code}): {reason}")]
    Rejected { code: ErrorCode, reason: String },

    #[error("Peer {address} unreachable: {reason}")]
    PeerUnreachable { address: SocketAddr, reason: String },

    #[error("Timed out during {operation} with {address}")]
    Timeout {
        operation: &'static str,
        address: SocketAddr,
    },

    #[error("No peers available for content")]
    NoPeersAvailable,

    #[error("Piece {index} still missing after {rounds} retry rounds")]
    RetriesExhausted { index: PieceIndex, rounds: u32 },

    #[error("Assembly error: {reason}")]
    AssemblyError { reason: String },

    #[error("Download cancelled")]
    Cancelled,

    #[error("Frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Connection closed by remote")]
    ConnectionClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TorrentError {
    /// Whether the downloader may retry after this error, possibly with another peer.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            TorrentError::PieceHashMismatch { .. }
                | TorrentError::PeerUnreachable { .. }
                | TorrentError::Timeout { .. }
                | TorrentError::ConnectionClosed
                | TorrentError::Rejected { .. }
                | TorrentError::MalformedMessage { .. }
                | TorrentError::UnknownRequestType { .. }
                | TorrentError::FrameTooLarge { .. }
                | TorrentError::Codec(_)
                | TorrentError::NoPeersAvailable
                | TorrentError::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_id_display() {
        let hash = [
            0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef, 0x01, 0x23, 0x45, 0x67, 0x89, 0xab,
            0xcd, 0xef, 0x01, 0x23, 0x45, 0x67,
        ];
        let content_id = ContentId::new(hash);
        assert_eq!(
            content_id.to_string(),
            "0123456789abcdef0123456789abcdef01234567"
        );
    }

    #[test]
    fn test_content_id_parse() {
        let content_id: ContentId = "0123456789abcdef0123456789abcdef01234567".parse().unwrap();
        assert_eq!(content_id.as_bytes()[0], 0x01);
        assert_eq!(content_id.as_bytes()[19], 0x67);

        assert!("0123".parse::<ContentId>().is_err());
        assert!("zz23456789abcdef0123456789abcdef01234567".parse::<ContentId>().is_err());
    }

    #[test]
    fn test_content_id_from_slice_length() {
        assert!(ContentId::from_slice(&[0u8; 20]).is_ok());
        assert!(ContentId::from_slice(&[0u8; 19]).is_err());
    }

    #[test]
    fn test_piece_index_ordering() {
        let piece1 = PieceIndex::new(5);
        let piece2 = PieceIndex::new(10);
        assert!(piece1 < piece2);
        assert_eq!(piece1.as_u32(), 5);
        assert_eq!(piece2.to_string(), "10");
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(TorrentError::PieceHashMismatch { index: PieceIndex(0) }.is_recoverable());
        assert!(TorrentError::ConnectionClosed.is_recoverable());
        assert!(!TorrentError::Cancelled.is_recoverable());
        assert!(
            !TorrentError::AssemblyError {
                reason: "early".to_string()
            }
            .is_recoverable()
        );
    }
}
