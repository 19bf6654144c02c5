//! Peer engine: shares local files, serves pieces and runs downloads

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::creation::{TorrentCreator, metainfo_path};
use super::downloader::{DownloadHandle, DownloadReport, DownloadSession};
use super::listener::{ListenerHandle, PeerListener};
use super::metainfo::{Metainfo, TrackerEndpoint};
use super::piece_store::SharedFiles;
use super::protocol::{Connection, PeerAddress, PeerRequest, PeerResponse};
use super::tracker::{
    AnnounceEvent, AnnounceRequest, SwarmSummary, TcpTrackerClient, TrackerClient,
};
use super::{ContentId, TorrentError};
use crate::config::ShoalConfig;

/// A running peer: the listener, the files it shares and the downloads it starts.
///
/// Downloaded content is shared as soon as it is assembled, so every
/// completed download turns this peer into a source for the swarm.
pub struct PeerEngine {
    config: ShoalConfig,
    shared: Arc<SharedFiles>,
    listener: ListenerHandle,
    local_peer: PeerAddress,
}

impl PeerEngine {
    /// Binds the peer listener and starts serving.
    ///
    /// An unspecified bind address (`0.0.0.0`) is advertised to trackers as loopback.
    ///
    /// # Errors
    /// - `TorrentError::Io` - If the listener cannot be bound
    pub async fn start(bind_addr: SocketAddr, config: ShoalConfig) -> Result<Self, TorrentError> {
        let shared = Arc::new(SharedFiles::new());
        let listener = PeerListener::bind(bind_addr, shared.clone(), &config)
            .await?
            .spawn();

        let local_addr = listener.local_addr();
        let host = if local_addr.ip().is_unspecified() {
            "127.0.0.1".to_string()
        } else {
            local_addr.ip().to_string()
        };
        let local_peer = PeerAddress::new(host, local_addr.port());
        tracing::info!("Peer engine started, advertising {local_peer}");

        Ok(Self {
            config,
            shared,
            listener,
            local_peer,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    /// Address announced to trackers.
    pub fn local_peer(&self) -> &PeerAddress {
        &self.local_peer
    }

    pub fn shared_files(&self) -> &SharedFiles {
        &self.shared
    }

    pub fn config(&self) -> &ShoalConfig {
        &self.config
    }

    fn tracker_client(&self, endpoint: TrackerEndpoint) -> Arc<dyn TrackerClient> {
        Arc::new(TcpTrackerClient::new(endpoint, &self.config))
    }

    /// Hashes `path`, writes `<path>.torrent`, starts serving the file and
    /// announces it to `tracker`.
    ///
    /// # Errors
    /// - `TorrentError::Io` - If the file is missing or unreadable
    /// - `TorrentError::InvalidMetainfo` - If the file is empty
    /// - Any tracker error from the announce
    pub async fn share_file(
        &self,
        path: &Path,
        tracker: TrackerEndpoint,
    ) -> Result<(Metainfo, ContentId), TorrentError> {
        let metainfo = TorrentCreator::with_piece_length(self.config.download.default_piece_length)?
            .create_from_file(path, tracker.clone())
            .await?;
        let content_id = metainfo.content_id();

        metainfo.save(&metainfo_path(path)).await?;
        self.shared.insert(metainfo.clone(), path);

        self.tracker_client(tracker)
            .announce(AnnounceRequest::started(&metainfo, self.local_peer.clone()))
            .await?;

        tracing::info!(
            "Sharing {} as {content_id} ({} bytes, {} pieces)",
            path.display(),
            metainfo.total_length,
            metainfo.piece_count()
        );
        Ok((metainfo, content_id))
    }

    fn session(&self, metainfo: Metainfo) -> Arc<DownloadSession> {
        let tracker = self.tracker_client(metainfo.tracker.clone());
        DownloadSession::new(metainfo, self.local_peer.clone(), tracker, self.config.clone())
    }

    /// Downloads `metainfo`'s content into `output_dir` and shares the result.
    ///
    /// # Errors
    /// - Any error the download session ends with
    pub async fn download(
        &self,
        metainfo: Metainfo,
        output_dir: &Path,
    ) -> Result<DownloadReport, TorrentError> {
        let destination = output_dir.join(&metainfo.name);
        let report = self.session(metainfo.clone()).run(&destination).await?;
        self.shared.insert(metainfo, &report.destination);
        Ok(report)
    }

    /// Starts a download on a background task; the result is shared once assembled.
    pub fn spawn_download(&self, metainfo: Metainfo, output_dir: &Path) -> DownloadHandle {
        let destination = output_dir.join(&metainfo.name);
        let shared = Arc::clone(&self.shared);
        self.session(metainfo)
            .spawn_with(destination, move |session, report| {
                shared.insert(session.metainfo().clone(), &report.destination);
            })
    }

    /// Looks `content_id` up on `tracker` and downloads it.
    ///
    /// # Errors
    /// - `TorrentError::UnknownSwarm` - If the tracker has no such swarm
    /// - `TorrentError::ContentIdMismatch` - If the advertised layout hashes differently
    /// - Any error the download session ends with
    pub async fn download_by_id(
        &self,
        tracker: TrackerEndpoint,
        content_id: ContentId,
        output_dir: &Path,
    ) -> Result<DownloadReport, TorrentError> {
        let summary = self
            .list_swarms(tracker.clone())
            .await?
            .into_iter()
            .find(|summary| summary.content_id == content_id)
            .ok_or(TorrentError::UnknownSwarm { content_id })?;
        let metainfo = summary.to_metainfo(tracker)?;
        self.download(metainfo, output_dir).await
    }

    /// Lists every swarm `tracker` knows about.
    ///
    /// # Errors
    /// - Any tracker error
    pub async fn list_swarms(
        &self,
        tracker: TrackerEndpoint,
    ) -> Result<Vec<SwarmSummary>, TorrentError> {
        self.tracker_client(tracker).list_swarms().await
    }

    /// Checks that `peer` answers a handshake and returns the round-trip time.
    ///
    /// # Errors
    /// - `TorrentError::PeerUnreachable` / `TorrentError::Timeout` - If the peer cannot be reached
    /// - `TorrentError::MalformedMessage` - If the peer answers with something else
    pub async fn handshake(&self, peer: &PeerAddress) -> Result<Duration, TorrentError> {
        let started = Instant::now();
        let address = peer.resolve_within(self.config.peer.connect_timeout).await?;
        let mut connection = Connection::connect(
            address,
            self.config.peer.connect_timeout,
            self.config.peer.io_timeout,
            self.config.peer.max_frame_len,
        )
        .await?;

        let response = connection.request(&PeerRequest::Handshake.to_value()).await?;
        match PeerResponse::from_value(&response)?.into_result()? {
            PeerResponse::HandshakeAck => {
                let elapsed = started.elapsed();
                tracing::debug!("Handshake with {peer} took {elapsed:.2?}");
                Ok(elapsed)
            }
            _ => Err(TorrentError::MalformedMessage {
                reason: format!("{peer} answered the handshake with a non-ack message"),
            }),
        }
    }

    /// Announces `stopped` for every shared file, then stops the listener.
    pub async fn stop_all(self) {
        for (content_id, file) in self.shared.all() {
            let request =
                AnnounceRequest::new(content_id, self.local_peer.clone(), AnnounceEvent::Stopped);
            if let Err(e) = self
                .tracker_client(file.metainfo.tracker.clone())
                .announce(request)
                .await
            {
                tracing::warn!("Failed to announce stop of {content_id}: {e}");
            }
        }
        self.listener.shutdown().await;
        tracing::info!("Peer engine on {} stopped", self.local_peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::PieceIndex;
    use crate::torrent::piece_store::PieceStore;
    use crate::torrent::tracker::{TrackerHandle, TrackerServer};

    async fn start_tracker() -> TrackerHandle {
        TrackerServer::bind("127.0.0.1:0".parse().unwrap(), &ShoalConfig::for_testing())
            .await
            .unwrap()
            .spawn()
    }

    async fn start_engine() -> PeerEngine {
        let mut config = ShoalConfig::for_testing();
        config.download.default_piece_length = 4096;
        PeerEngine::start("127.0.0.1:0".parse().unwrap(), config)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_share_registers_and_writes_metainfo() {
        let tracker = start_tracker().await;
        let engine = start_engine().await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        tokio::fs::write(&path, vec![b'n'; 10_000]).await.unwrap();

        let (metainfo, content_id) = engine
            .share_file(&path, TrackerEndpoint::from(tracker.local_addr()))
            .await
            .unwrap();

        assert_eq!(metainfo.piece_count(), 3);
        assert!(engine.shared_files().has_content(content_id));
        let saved = Metainfo::load(&dir.path().join("notes.txt.torrent")).await.unwrap();
        assert_eq!(saved, metainfo);

        let swarms = tracker.registry().list_swarms();
        assert_eq!(swarms[0].members, vec![engine.local_peer().clone()]);

        engine.stop_all().await;
        assert!(tracker.registry().list_swarms()[0].members.is_empty());
        tracker.shutdown().await;
    }

    #[tokio::test]
    async fn test_download_by_id_then_serves() {
        let tracker = start_tracker().await;
        let endpoint = TrackerEndpoint::from(tracker.local_addr());
        let seeder = start_engine().await;
        let leecher = start_engine().await;
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("clip.bin");
        let data: Vec<u8> = (0..9_000u32).map(|i| (i % 199) as u8).collect();
        tokio::fs::write(&source, &data).await.unwrap();
        let output = tempfile::tempdir().unwrap();

        let (_, content_id) = seeder.share_file(&source, endpoint.clone()).await.unwrap();
        let report = leecher
            .download_by_id(endpoint, content_id, output.path())
            .await
            .unwrap();

        assert_eq!(report.destination, output.path().join("clip.bin"));
        assert_eq!(tokio::fs::read(&report.destination).await.unwrap(), data);
        let served = leecher
            .shared_files()
            .piece_data(content_id, PieceIndex::new(2))
            .await
            .unwrap();
        assert_eq!(&served[..], &data[8192..]);

        leecher.stop_all().await;
        seeder.stop_all().await;
        tracker.shutdown().await;
    }

    #[tokio::test]
    async fn test_download_unknown_id() {
        let tracker = start_tracker().await;
        let engine = start_engine().await;
        let output = tempfile::tempdir().unwrap();

        let result = engine
            .download_by_id(
                TrackerEndpoint::from(tracker.local_addr()),
                ContentId::new([9u8; 20]),
                output.path(),
            )
            .await;
        assert!(matches!(result, Err(TorrentError::UnknownSwarm { .. })));

        engine.stop_all().await;
        tracker.shutdown().await;
    }

    #[tokio::test]
    async fn test_handshake_round_trip() {
        let engine = start_engine().await;
        let other = start_engine().await;

        let rtt = engine
            .handshake(&PeerAddress::from(other.local_addr()))
            .await
            .unwrap();
        assert!(rtt < Duration::from_secs(2));

        other.stop_all().await;
        let unreachable = engine.handshake(&PeerAddress::new("127.0.0.1", 1)).await;
        assert!(unreachable.unwrap_err().is_recoverable());

        engine.stop_all().await;
    }
}
