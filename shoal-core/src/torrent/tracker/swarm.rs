//! Swarm membership registry.

use std::collections::{BTreeSet, HashMap};

use parking_lot::Mutex;

use super::{AnnounceEvent, AnnounceRequest};
use crate::torrent::metainfo::{Metainfo, TrackerEndpoint};
use crate::torrent::protocol::PeerAddress;
use crate::torrent::{ContentId, PieceDigest, TorrentError};

/// Read-only snapshot of one swarm.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct SwarmSummary {
    pub content_id: ContentId,
    pub name: String,
    pub total_length: u64,
    pub piece_length: u32,
    #[serde(serialize_with = "serialize_digests")]
    pub pieces: Vec<PieceDigest>,
    pub members: Vec<PeerAddress>,
}

impl SwarmSummary {
    /// Rebuilds the metainfo this swarm was created from.
    ///
    /// # Errors
    /// - `TorrentError::InvalidMetainfo` - If the summary's layout is invalid
    /// - `TorrentError::ContentIdMismatch` - If the layout does not hash to the swarm's id
    pub fn to_metainfo(&self, tracker: TrackerEndpoint) -> Result<Metainfo, TorrentError> {
        let metainfo = Metainfo::build(
            self.name.clone(),
            self.total_length,
            self.piece_length,
            self.pieces.clone(),
            tracker,
        )?;
        let actual = metainfo.content_id();
        if actual != self.content_id {
            return Err(TorrentError::ContentIdMismatch {
                announced: self.content_id,
                actual,
            });
        }
        Ok(metainfo)
    }
}

fn serialize_digests<S: serde::Serializer>(
    digests: &[PieceDigest],
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(digests.iter().map(hex::encode))
}

struct SwarmEntry {
    metainfo: Metainfo,
    members: BTreeSet<PeerAddress>,
}

/// Swarm membership keyed by content id.
///
/// All state sits behind one mutex that is never held across an await.
/// Members that vanish without announcing `stopped` are never evicted.
#[derive(Default)]
pub struct SwarmRegistry {
    swarms: Mutex<HashMap<ContentId, SwarmEntry>>,
}

impl SwarmRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies an announce and returns the swarm's members other than the caller.
    ///
    /// # Errors
    /// - `TorrentError::ContentIdMismatch` - If attached metainfo hashes to a different id
    /// - `TorrentError::UnknownSwarm` - If the swarm does not exist and cannot be created
    pub fn announce(&self, request: &AnnounceRequest) -> Result<Vec<PeerAddress>, TorrentError> {
        let content_id = request.content_id;
        if let Some(metainfo) = &request.metainfo {
            let actual = metainfo.content_id();
            if actual != content_id {
                return Err(TorrentError::ContentIdMismatch {
                    announced: content_id,
                    actual,
                });
            }
        }

        let mut swarms = self.swarms.lock();
        if request.event == AnnounceEvent::Started && !swarms.contains_key(&content_id) {
            let metainfo = request
                .metainfo
                .clone()
                .ok_or(TorrentError::UnknownSwarm { content_id })?;
            tracing::info!("Created swarm {content_id} for {}", metainfo.name);
            swarms.insert(
                content_id,
                SwarmEntry {
                    metainfo,
                    members: BTreeSet::new(),
                },
            );
        }

        let entry = swarms
            .get_mut(&content_id)
            .ok_or(TorrentError::UnknownSwarm { content_id })?;

        match request.event {
            AnnounceEvent::Started => {
                if entry.members.insert(request.peer.clone()) {
                    tracing::debug!("{} joined swarm {content_id}", request.peer);
                }
            }
            AnnounceEvent::Stopped => {
                if entry.members.remove(&request.peer) {
                    tracing::debug!("{} left swarm {content_id}", request.peer);
                }
            }
            AnnounceEvent::Completed => {
                tracing::info!("{} completed {content_id}", request.peer);
            }
        }

        Ok(entry
            .members
            .iter()
            .filter(|member| **member != request.peer)
            .cloned()
            .collect())
    }

    /// Copies the current state of every swarm.
    pub fn list_swarms(&self) -> Vec<SwarmSummary> {
        let swarms = self.swarms.lock();
        let mut summaries: Vec<SwarmSummary> = swarms
            .iter()
            .map(|(content_id, entry)| SwarmSummary {
                content_id: *content_id,
                name: entry.metainfo.name.clone(),
                total_length: entry.metainfo.total_length,
                piece_length: entry.metainfo.piece_length,
                pieces: entry.metainfo.pieces.clone(),
                members: entry.members.iter().cloned().collect(),
            })
            .collect();
        summaries.sort_by_key(|summary| summary.content_id);
        summaries
    }

    pub fn swarm_count(&self) -> usize {
        self.swarms.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::creation::digest;

    fn metainfo(name: &str) -> Metainfo {
        Metainfo::build(
            name,
            10,
            8,
            vec![digest(b"a"), digest(b"b")],
            TrackerEndpoint::new("127.0.0.1", 6969),
        )
        .unwrap()
    }

    fn peer(port: u16) -> PeerAddress {
        PeerAddress::new("127.0.0.1", port)
    }

    #[test]
    fn test_started_without_metainfo_on_unknown_swarm() {
        let registry = SwarmRegistry::new();
        let request = AnnounceRequest::new(
            metainfo("a").content_id(),
            peer(1),
            AnnounceEvent::Started,
        );

        assert!(matches!(
            registry.announce(&request),
            Err(TorrentError::UnknownSwarm { .. })
        ));
        assert_eq!(registry.swarm_count(), 0);
    }

    #[test]
    fn test_stopped_and_completed_on_unknown_swarm() {
        let registry = SwarmRegistry::new();
        let content_id = metainfo("a").content_id();

        for event in [AnnounceEvent::Stopped, AnnounceEvent::Completed] {
            let request = AnnounceRequest::new(content_id, peer(1), event);
            assert!(matches!(
                registry.announce(&request),
                Err(TorrentError::UnknownSwarm { .. })
            ));
        }
    }

    #[test]
    fn test_peer_list_excludes_caller() {
        let registry = SwarmRegistry::new();
        let metainfo = metainfo("a");
        let content_id = metainfo.content_id();

        assert!(registry
            .announce(&AnnounceRequest::started(&metainfo, peer(1)))
            .unwrap()
            .is_empty());
        assert_eq!(
            registry
                .announce(&AnnounceRequest::new(content_id, peer(2), AnnounceEvent::Started))
                .unwrap(),
            vec![peer(1)]
        );

        let mut others = registry
            .announce(&AnnounceRequest::new(content_id, peer(3), AnnounceEvent::Started))
            .unwrap();
        others.sort();
        assert_eq!(others, vec![peer(1), peer(2)]);
    }

    #[test]
    fn test_stopped_is_idempotent() {
        let registry = SwarmRegistry::new();
        let metainfo = metainfo("a");
        let content_id = metainfo.content_id();
        registry
            .announce(&AnnounceRequest::started(&metainfo, peer(1)))
            .unwrap();

        let stop = AnnounceRequest::new(content_id, peer(1), AnnounceEvent::Stopped);
        assert!(registry.announce(&stop).unwrap().is_empty());
        assert!(registry.announce(&stop).unwrap().is_empty());
        assert!(registry.list_swarms()[0].members.is_empty());
    }

    #[test]
    fn test_completed_keeps_membership() {
        let registry = SwarmRegistry::new();
        let metainfo = metainfo("a");
        let content_id = metainfo.content_id();
        registry
            .announce(&AnnounceRequest::started(&metainfo, peer(1)))
            .unwrap();
        registry
            .announce(&AnnounceRequest::new(content_id, peer(2), AnnounceEvent::Completed))
            .unwrap();

        assert_eq!(registry.list_swarms()[0].members, vec![peer(1)]);
    }

    #[test]
    fn test_metainfo_must_match_content_id() {
        let registry = SwarmRegistry::new();
        let mut request = AnnounceRequest::started(&metainfo("a"), peer(1));
        request.content_id = metainfo("b").content_id();

        assert!(matches!(
            registry.announce(&request),
            Err(TorrentError::ContentIdMismatch { .. })
        ));
    }

    #[test]
    fn test_summary_rebuilds_metainfo() {
        let registry = SwarmRegistry::new();
        let metainfo = metainfo("a");
        registry
            .announce(&AnnounceRequest::started(&metainfo, peer(1)))
            .unwrap();

        let summary = &registry.list_swarms()[0];
        let rebuilt = summary.to_metainfo(metainfo.tracker.clone()).unwrap();
        assert_eq!(rebuilt, metainfo);

        let mut tampered = summary.clone();
        tampered.name = "other".to_string();
        assert!(matches!(
            tampered.to_metainfo(metainfo.tracker.clone()),
            Err(TorrentError::ContentIdMismatch { .. })
        ));
    }
}
