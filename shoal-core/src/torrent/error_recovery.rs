//! Retry bookkeeping for piece downloads
//!
//! A piece is attempted against every known peer once per round. When a round
//! is exhausted the downloader backs off, refreshes its peer list and starts
//! another. Only rounds that hit the network wall back off exponentially;
//! rounds where every peer answered, just with bad data, wait the base delay.
//! A fatal error ends the piece immediately.

use std::collections::HashSet;
use std::time::Duration;

use crate::config::DownloadConfig;
use crate::torrent::protocol::PeerAddress;
use crate::torrent::{PieceIndex, TorrentError};

/// Broad classes of piece-fetch failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Connect failure, timeout or dropped connection
    Network,
    /// Piece bytes did not match the expected digest
    Integrity,
    /// Peer answered with an error or an unexpected message
    Protocol,
    /// Not worth retrying
    Fatal,
}

impl ErrorCategory {
    pub fn from_torrent_error(error: &TorrentError) -> Self {
        if !error.is_recoverable() {
            return Self::Fatal;
        }
        match error {
            TorrentError::PieceHashMismatch { .. } => Self::Integrity,
            TorrentError::Rejected { .. }
            | TorrentError::MalformedMessage { .. }
            | TorrentError::UnknownRequestType { .. }
            | TorrentError::FrameTooLarge { .. }
            | TorrentError::Codec(_) => Self::Protocol,
            _ => Self::Network,
        }
    }
}

/// How a finished retry round went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundOutcome {
    /// Rounds completed so far, this one included
    pub rounds: u32,
    /// A peer was unreachable or timed out, or there was no peer to try
    pub unreachable: bool,
}

/// Round limit and exponential backoff between rounds.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Rounds allowed per piece; `None` retries forever.
    pub max_rounds: Option<u32>,
}

impl RetryPolicy {
    pub fn from_config(config: &DownloadConfig) -> Self {
        Self {
            base_delay: config.initial_backoff,
            max_delay: config.max_backoff,
            max_rounds: config.max_piece_rounds,
        }
    }

    /// Delay before starting round `round + 1` after `round` rounds failed.
    pub fn delay_after(&self, round: u32) -> Duration {
        let factor = 2u32.saturating_pow(round.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Delay before the round following `outcome`.
    pub fn delay_for(&self, outcome: RoundOutcome) -> Duration {
        if outcome.unreachable {
            self.delay_after(outcome.rounds)
        } else {
            self.base_delay.min(self.max_delay)
        }
    }

    /// Whether another round may start after `completed` failed rounds.
    pub fn allows_another_round(&self, completed: u32) -> bool {
        self.max_rounds.is_none_or(|max| completed < max)
    }
}

/// Attempts made for one piece in the current round.
#[derive(Debug)]
pub struct PieceAttempts {
    pub index: PieceIndex,
    rounds: u32,
    tried: HashSet<PeerAddress>,
    unreachable: bool,
}

impl PieceAttempts {
    pub fn new(index: PieceIndex) -> Self {
        Self {
            index,
            rounds: 0,
            tried: HashSet::new(),
            unreachable: false,
        }
    }

    /// Picks the next untried peer, scanning from `start` and wrapping around.
    pub fn next_peer(&mut self, peers: &[PeerAddress], start: usize) -> Option<PeerAddress> {
        if peers.is_empty() {
            return None;
        }
        let peer = (0..peers.len())
            .map(|offset| &peers[(start + offset) % peers.len()])
            .find(|peer| !self.tried.contains(*peer))?
            .clone();
        self.tried.insert(peer.clone());
        Some(peer)
    }

    pub fn record_failure(&mut self, peer: &PeerAddress, error: &TorrentError) -> ErrorCategory {
        let category = ErrorCategory::from_torrent_error(error);
        match category {
            ErrorCategory::Integrity => {
                tracing::warn!("Discarded piece {} from {peer}: {error}", self.index)
            }
            ErrorCategory::Fatal => {
                tracing::error!("Giving up on piece {} after {peer} failed: {error}", self.index)
            }
            ErrorCategory::Network => {
                self.unreachable = true;
                tracing::warn!("Piece {} from {peer} failed ({category:?}): {error}", self.index)
            }
            ErrorCategory::Protocol => {
                tracing::warn!("Piece {} from {peer} failed ({category:?}): {error}", self.index)
            }
        }
        category
    }

    /// Closes the current round.
    pub fn finish_round(&mut self) -> RoundOutcome {
        self.rounds += 1;
        let outcome = RoundOutcome {
            rounds: self.rounds,
            unreachable: self.unreachable || self.tried.is_empty(),
        };
        self.tried.clear();
        self.unreachable = false;
        outcome
    }

    pub fn rounds(&self) -> u32 {
        self.rounds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peers() -> Vec<PeerAddress> {
        (1..=3).map(|port| PeerAddress::new("127.0.0.1", port)).collect()
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            max_rounds: None,
        };

        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3), Duration::from_millis(350));
        assert_eq!(policy.delay_after(60), Duration::from_millis(350));
    }

    #[test]
    fn test_round_limit() {
        let unlimited = RetryPolicy::from_config(&DownloadConfig::default());
        assert!(unlimited.allows_another_round(u32::MAX - 1));

        let limited = RetryPolicy {
            max_rounds: Some(2),
            ..unlimited
        };
        assert!(limited.allows_another_round(1));
        assert!(!limited.allows_another_round(2));
    }

    #[test]
    fn test_each_peer_tried_once_per_round() {
        let peers = peers();
        let mut attempts = PieceAttempts::new(PieceIndex::new(0));

        let order: Vec<u16> = std::iter::from_fn(|| attempts.next_peer(&peers, 1))
            .map(|peer| peer.port)
            .collect();
        assert_eq!(order, vec![2, 3, 1]);

        assert_eq!(attempts.finish_round().rounds, 1);
        assert!(attempts.next_peer(&peers, 0).is_some());
    }

    #[test]
    fn test_record_failure_classifies() {
        let peers = peers();
        let mut attempts = PieceAttempts::new(PieceIndex::new(4));
        let peer = attempts.next_peer(&peers, 0).unwrap();

        assert_eq!(
            attempts.record_failure(&peer, &TorrentError::ConnectionClosed),
            ErrorCategory::Network
        );
        assert_eq!(
            attempts.finish_round(),
            RoundOutcome {
                rounds: 1,
                unreachable: true
            }
        );
        assert_eq!(attempts.finish_round().rounds, 2);
        assert_eq!(attempts.rounds(), 2);
    }

    #[test]
    fn test_integrity_rounds_skip_exponential_backoff() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            max_rounds: None,
        };
        let peers = peers();
        let mut attempts = PieceAttempts::new(PieceIndex::new(2));

        for _ in 0..3 {
            while let Some(peer) = attempts.next_peer(&peers, 0) {
                let mismatch = TorrentError::PieceHashMismatch {
                    index: PieceIndex::new(2),
                };
                assert_eq!(attempts.record_failure(&peer, &mismatch), ErrorCategory::Integrity);
            }
            let outcome = attempts.finish_round();
            assert!(!outcome.unreachable);
            assert_eq!(policy.delay_for(outcome), Duration::from_millis(100));
        }

        let peer = attempts.next_peer(&peers, 0).unwrap();
        attempts.record_failure(&peer, &TorrentError::ConnectionClosed);
        let outcome = attempts.finish_round();
        assert_eq!(outcome.rounds, 4);
        assert_eq!(policy.delay_for(outcome), Duration::from_millis(800));
    }

    #[test]
    fn test_round_without_peers_backs_off() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            max_rounds: None,
        };
        let mut attempts = PieceAttempts::new(PieceIndex::new(0));
        assert!(attempts.next_peer(&[], 0).is_none());

        attempts.finish_round();
        let outcome = attempts.finish_round();
        assert!(outcome.unreachable);
        assert_eq!(policy.delay_for(outcome), Duration::from_millis(200));
    }

    #[test]
    fn test_unrecoverable_error_is_fatal() {
        let peers = peers();
        let mut attempts = PieceAttempts::new(PieceIndex::new(1));
        let peer = attempts.next_peer(&peers, 0).unwrap();
        let error = TorrentError::InvalidMetainfo {
            reason: "zero piece length".to_string(),
        };

        assert!(!error.is_recoverable());
        assert_eq!(attempts.record_failure(&peer, &error), ErrorCategory::Fatal);
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(
            ErrorCategory::from_torrent_error(&TorrentError::PieceHashMismatch {
                index: PieceIndex::new(0)
            }),
            ErrorCategory::Integrity
        );
        assert_eq!(
            ErrorCategory::from_torrent_error(&TorrentError::Cancelled),
            ErrorCategory::Fatal
        );
        assert_eq!(
            ErrorCategory::from_torrent_error(&TorrentError::UnknownRequestType {
                kind: "bitfield".to_string()
            }),
            ErrorCategory::Protocol
        );
        assert_eq!(
            ErrorCategory::from_torrent_error(&TorrentError::NoPeersAvailable),
            ErrorCategory::Network
        );
    }
}
