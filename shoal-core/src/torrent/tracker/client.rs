//! Tracker client over the framed TCP protocol.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;

use super::{AnnounceRequest, SwarmSummary, TrackerClient};
use crate::config::ShoalConfig;
use crate::torrent::TorrentError;
use crate::torrent::metainfo::TrackerEndpoint;
use crate::torrent::protocol::{Connection, PeerAddress, TrackerRequest, TrackerResponse};

/// Tracker client opening one short-lived connection per request.
#[derive(Debug, Clone)]
pub struct TcpTrackerClient {
    endpoint: TrackerEndpoint,
    connect_timeout: Duration,
    io_timeout: Duration,
    round_trip_timeout: Duration,
    max_frame_len: usize,
}

impl TcpTrackerClient {
    pub fn new(endpoint: TrackerEndpoint, config: &ShoalConfig) -> Self {
        Self {
            endpoint,
            connect_timeout: config.peer.connect_timeout,
            io_timeout: config.peer.io_timeout,
            round_trip_timeout: config.tracker.client_timeout,
            max_frame_len: config.peer.max_frame_len,
        }
    }

    /// Sends one request and returns the tracker's response.
    ///
    /// Error responses are turned into `TorrentError::Rejected`.
    async fn exchange(&self, request: TrackerRequest) -> Result<TrackerResponse, TorrentError> {
        let round_trip = async {
            let address = self.endpoint.resolve().await?;
            let mut connection = Connection::connect(
                address,
                self.connect_timeout,
                self.io_timeout,
                self.max_frame_len,
            )
            .await?;
            let value = connection.request(&request.to_value()).await?;
            TrackerResponse::from_value(&value)
        };

        let response = tokio::time::timeout(self.round_trip_timeout, round_trip)
            .await
            .map_err(|_| TorrentError::Timeout {
                operation: "tracker request",
                address: SocketAddr::from(([0, 0, 0, 0], self.endpoint.port)),
            })??;

        match response {
            TrackerResponse::Error { code, reason } => Err(TorrentError::Rejected { code, reason }),
            response => Ok(response),
        }
    }
}

#[async_trait]
impl TrackerClient for TcpTrackerClient {
    async fn announce(&self, request: AnnounceRequest) -> Result<Vec<PeerAddress>, TorrentError> {
        let event = request.event;
        let content_id = request.content_id;
        match self.exchange(TrackerRequest::Announce(request)).await? {
            TrackerResponse::Peers(peers) => {
                tracing::debug!(
                    "Announced {event} for {content_id} to {}: {} peers",
                    self.endpoint,
                    peers.len()
                );
                Ok(peers)
            }
            _ => Err(TorrentError::MalformedMessage {
                reason: "expected a peer list in response to announce".to_string(),
            }),
        }
    }

    async fn list_swarms(&self) -> Result<Vec<SwarmSummary>, TorrentError> {
        match self.exchange(TrackerRequest::ListSwarms).await? {
            TrackerResponse::Swarms(swarms) => Ok(swarms),
            _ => Err(TorrentError::MalformedMessage {
                reason: "expected a swarm list in response to list_swarms".to_string(),
            }),
        }
    }

    fn endpoint(&self) -> &TrackerEndpoint {
        &self.endpoint
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::creation::digest;
    use crate::torrent::metainfo::Metainfo;
    use crate::torrent::protocol::ErrorCode;
    use crate::torrent::tracker::{AnnounceEvent, TrackerServer};

    #[tokio::test]
    async fn test_announce_and_list_through_tracker() {
        let config = ShoalConfig::for_testing();
        let tracker = TrackerServer::bind("127.0.0.1:0".parse().unwrap(), &config)
            .await
            .unwrap()
            .spawn();
        let endpoint = TrackerEndpoint::from(tracker.local_addr());
        let client = TcpTrackerClient::new(endpoint.clone(), &config);

        let metainfo =
            Metainfo::build("f.bin", 5, 4, vec![digest(b"f"), digest(b"g")], endpoint).unwrap();
        let peers = client
            .announce(AnnounceRequest::started(&metainfo, PeerAddress::new("127.0.0.1", 9001)))
            .await
            .unwrap();
        assert!(peers.is_empty());

        let swarms = client.list_swarms().await.unwrap();
        assert_eq!(swarms.len(), 1);
        assert_eq!(swarms[0].content_id, metainfo.content_id());
        assert_eq!(swarms[0].members, vec![PeerAddress::new("127.0.0.1", 9001)]);

        tracker.shutdown().await;
    }

    #[tokio::test]
    async fn test_rejection_surfaces_error_code() {
        let config = ShoalConfig::for_testing();
        let tracker = TrackerServer::bind("127.0.0.1:0".parse().unwrap(), &config)
            .await
            .unwrap()
            .spawn();
        let client = TcpTrackerClient::new(TrackerEndpoint::from(tracker.local_addr()), &config);

        let request = AnnounceRequest::new(
            crate::torrent::ContentId::new([3u8; 20]),
            PeerAddress::new("127.0.0.1", 9001),
            AnnounceEvent::Stopped,
        );
        assert!(matches!(
            client.announce(request).await,
            Err(TorrentError::Rejected {
                code: ErrorCode::UnknownSwarm,
                ..
            })
        ));

        tracker.shutdown().await;
    }

    #[tokio::test]
    async fn test_unreachable_tracker() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);

        let client =
            TcpTrackerClient::new(TrackerEndpoint::from(address), &ShoalConfig::for_testing());
        let error = client.list_swarms().await.unwrap_err();
        assert!(error.is_recoverable());
    }

    #[test]
    fn test_slow_name_resolution_hits_request_timeout() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .max_blocking_threads(1)
            .build()
            .unwrap();
        runtime.block_on(async {
            let busy =
                tokio::task::spawn_blocking(|| std::thread::sleep(Duration::from_millis(500)));

            let mut config = ShoalConfig::for_testing();
            config.tracker.client_timeout = Duration::from_millis(50);
            let client = TcpTrackerClient::new(TrackerEndpoint::new("localhost", 6969), &config);

            let started = std::time::Instant::now();
            assert!(matches!(
                client.list_swarms().await,
                Err(TorrentError::Timeout {
                    operation: "tracker request",
                    ..
                })
            ));
            assert!(started.elapsed() < Duration::from_millis(400));
            busy.await.unwrap();
        });
    }
}
