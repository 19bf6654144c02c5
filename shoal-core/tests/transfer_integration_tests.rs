//! Integration tests for complete transfers between peer engines.
//!
//! Every test runs a real tracker and real peers on loopback, shares a file
//! from one engine and downloads it with another.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use shoal_core::config::ShoalConfig;
use shoal_core::torrent::{
    AnnounceRequest, ContentId, ListenerHandle, Metainfo, PeerAddress, PeerEngine, PeerListener,
    PieceIndex, PieceStore, SharedFiles, TcpTrackerClient, TorrentError, TrackerClient,
    TrackerEndpoint, TrackerHandle, TrackerServer,
};
use tokio::time::timeout;
use tokio_test::assert_ok;

const FILE_SIZE: usize = 1_050_000;

/// Serves real content with the first byte of every piece flipped.
struct CorruptStore {
    inner: SharedFiles,
}

#[async_trait]
impl PieceStore for CorruptStore {
    async fn piece_data(
        &self,
        content_id: ContentId,
        index: PieceIndex,
    ) -> Result<Bytes, TorrentError> {
        let mut data = self.inner.piece_data(content_id, index).await?.to_vec();
        data[0] ^= 0xff;
        Ok(Bytes::from(data))
    }

    fn has_content(&self, content_id: ContentId) -> bool {
        self.inner.has_content(content_id)
    }

    fn piece_count(&self, content_id: ContentId) -> Result<u32, TorrentError> {
        self.inner.piece_count(content_id)
    }
}

struct TransferFixture {
    tracker: TrackerHandle,
    workspace: tempfile::TempDir,
}

impl TransferFixture {
    async fn new() -> Self {
        let config = ShoalConfig::for_testing();
        let tracker = TrackerServer::bind("127.0.0.1:0".parse().unwrap(), &config)
            .await
            .unwrap()
            .spawn();
        Self {
            tracker,
            workspace: tempfile::tempdir().unwrap(),
        }
    }

    fn endpoint(&self) -> TrackerEndpoint {
        TrackerEndpoint::from(self.tracker.local_addr())
    }

    async fn engine(&self) -> PeerEngine {
        PeerEngine::start("127.0.0.1:0".parse().unwrap(), ShoalConfig::for_testing())
            .await
            .unwrap()
    }

    /// Writes a deterministic source file and returns its path and contents.
    async fn source_file(&self, name: &str) -> (PathBuf, Vec<u8>) {
        let data: Vec<u8> = (0..FILE_SIZE).map(|i| (i * 31 % 251) as u8).collect();
        let path = self.workspace.path().join(name);
        tokio::fs::write(&path, &data).await.unwrap();
        (path, data)
    }

    fn output_dir(&self, name: &str) -> PathBuf {
        let dir = self.workspace.path().join(name);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    /// Starts a listener serving corrupted pieces of `path` and joins it to the swarm.
    async fn corrupt_peer(&self, metainfo: &Metainfo, path: &Path) -> ListenerHandle {
        let inner = SharedFiles::new();
        inner.insert(metainfo.clone(), path);
        let listener = PeerListener::bind(
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(CorruptStore { inner }),
            &ShoalConfig::for_testing(),
        )
        .await
        .unwrap()
        .spawn();

        let client = TcpTrackerClient::new(self.endpoint(), &ShoalConfig::for_testing());
        client
            .announce(AnnounceRequest::started(
                metainfo,
                PeerAddress::from(listener.local_addr()),
            ))
            .await
            .unwrap();
        listener
    }
}

#[tokio::test]
async fn test_end_to_end_transfer() {
    let fixture = TransferFixture::new().await;
    let (source, data) = fixture.source_file("payload.bin").await;
    let seeder = fixture.engine().await;
    let leecher = fixture.engine().await;

    let (metainfo, content_id) = assert_ok!(seeder.share_file(&source, fixture.endpoint()).await);
    assert_eq!(metainfo.piece_count(), 3);
    assert_eq!(metainfo.piece_size(PieceIndex::new(0)), Some(524_288));
    assert_eq!(metainfo.piece_size(PieceIndex::new(1)), Some(524_288));
    assert_eq!(metainfo.piece_size(PieceIndex::new(2)), Some(1_424));

    let saved = Metainfo::load(&source.with_file_name("payload.bin.torrent"))
        .await
        .unwrap();
    assert_eq!(saved.content_id(), content_id);

    let output = fixture.output_dir("downloads");
    let report = timeout(Duration::from_secs(30), leecher.download(saved, &output))
        .await
        .expect("download timed out")
        .unwrap();

    assert_eq!(report.content_id, content_id);
    assert_eq!(report.pieces, 3);
    assert_eq!(report.bytes, FILE_SIZE as u64);
    let downloaded = tokio::fs::read(&report.destination).await.unwrap();
    assert_eq!(downloaded, data);

    // The rebuilt file hashes to the same content id.
    let rehashed = shoal_core::torrent::TorrentCreator::default()
        .create_from_file(&report.destination, fixture.endpoint())
        .await
        .unwrap();
    assert_eq!(rehashed.content_id(), content_id);

    leecher.stop_all().await;
    seeder.stop_all().await;
    fixture.tracker.shutdown().await;
}

#[tokio::test]
async fn test_corrupt_peer_never_reaches_disk() {
    let fixture = TransferFixture::new().await;
    let (source, data) = fixture.source_file("payload.bin").await;
    let seeder = fixture.engine().await;
    let leecher = fixture.engine().await;

    let (metainfo, _) = seeder.share_file(&source, fixture.endpoint()).await.unwrap();
    let corrupt = fixture.corrupt_peer(&metainfo, &source).await;

    let output = fixture.output_dir("downloads");
    let report = timeout(Duration::from_secs(30), leecher.download(metainfo, &output))
        .await
        .expect("download timed out")
        .unwrap();

    assert_eq!(tokio::fs::read(&report.destination).await.unwrap(), data);

    corrupt.shutdown().await;
    leecher.stop_all().await;
    seeder.stop_all().await;
    fixture.tracker.shutdown().await;
}

#[tokio::test]
async fn test_session_retries_until_honest_peer_joins() {
    let fixture = TransferFixture::new().await;
    let (source, data) = fixture.source_file("payload.bin").await;
    let metainfo = shoal_core::torrent::TorrentCreator::default()
        .create_from_file(&source, fixture.endpoint())
        .await
        .unwrap();
    let corrupt = fixture.corrupt_peer(&metainfo, &source).await;
    let leecher = fixture.engine().await;

    let output = fixture.output_dir("downloads");
    let handle = leecher.spawn_download(metainfo.clone(), &output);

    // Let a few rounds fail against the corrupt peer before a real seeder appears.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!output.join("payload.bin").exists());
    let seeder = fixture.engine().await;
    seeder.share_file(&source, fixture.endpoint()).await.unwrap();

    let report = timeout(Duration::from_secs(30), handle.wait())
        .await
        .expect("download timed out")
        .unwrap();
    assert_eq!(tokio::fs::read(&report.destination).await.unwrap(), data);
    assert!(leecher.shared_files().has_content(metainfo.content_id()));

    corrupt.shutdown().await;
    leecher.stop_all().await;
    seeder.stop_all().await;
    fixture.tracker.shutdown().await;
}

#[tokio::test]
async fn test_cancelled_download_leaves_swarm() {
    let fixture = TransferFixture::new().await;
    let (source, _) = fixture.source_file("payload.bin").await;
    let metainfo = shoal_core::torrent::TorrentCreator::default()
        .create_from_file(&source, fixture.endpoint())
        .await
        .unwrap();
    let corrupt = fixture.corrupt_peer(&metainfo, &source).await;
    let leecher = fixture.engine().await;

    let handle = leecher.spawn_download(metainfo.clone(), &fixture.output_dir("downloads"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.cancel();

    let result = timeout(Duration::from_secs(10), handle.wait())
        .await
        .expect("cancellation timed out");
    assert!(matches!(result, Err(TorrentError::Cancelled)));

    let swarms = fixture.tracker.registry().list_swarms();
    assert!(!swarms[0].members.contains(leecher.local_peer()));

    corrupt.shutdown().await;
    leecher.stop_all().await;
    fixture.tracker.shutdown().await;
}
