//! Download sessions: concurrent piece fetching, verification and assembly
//!
//! A session announces itself to the tracker, then a bounded pool of workers
//! claims pieces in random order and fetches each from the swarm's peers.
//! Every piece is checked against its digest before it is recorded, and the
//! destination file is written once, after all pieces are verified.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::future::join_all;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::creation::digest;
use super::error_recovery::{ErrorCategory, PieceAttempts, RetryPolicy};
use super::metainfo::Metainfo;
use super::protocol::{Connection, PeerAddress, PeerRequest, PeerResponse};
use super::tracker::{AnnounceEvent, AnnounceRequest, TrackerClient};
use super::{ContentId, PieceIndex, TorrentError};
use crate::config::ShoalConfig;

/// Lifecycle of one piece within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceStatus {
    Pending,
    InFlight,
    Verified,
}

/// Summary of a finished download.
#[derive(Debug, Clone)]
pub struct DownloadReport {
    pub content_id: ContentId,
    pub name: String,
    pub pieces: u32,
    pub bytes: u64,
    pub elapsed: Duration,
    pub destination: PathBuf,
}

struct SessionState {
    status: Vec<PieceStatus>,
    verified: HashMap<PieceIndex, Bytes>,
    /// Claim order; pieces are popped from the back.
    order: Vec<PieceIndex>,
    peers: Vec<PeerAddress>,
    assembled: bool,
}

/// One download of one shared file.
pub struct DownloadSession {
    content_id: ContentId,
    metainfo: Arc<Metainfo>,
    local_peer: PeerAddress,
    tracker: Arc<dyn TrackerClient>,
    config: ShoalConfig,
    state: Mutex<SessionState>,
    cancel: Arc<watch::Sender<bool>>,
}

impl DownloadSession {
    /// Creates a session for `metainfo`.
    ///
    /// `local_peer` is the address this engine announces; it is never used as a source.
    pub fn new(
        metainfo: Metainfo,
        local_peer: PeerAddress,
        tracker: Arc<dyn TrackerClient>,
        config: ShoalConfig,
    ) -> Arc<Self> {
        let count = metainfo.piece_count();
        let mut order: Vec<PieceIndex> = (0..count).map(PieceIndex::new).collect();
        order.shuffle(&mut rand::rng());

        let (cancel, _) = watch::channel(false);
        Arc::new(Self {
            content_id: metainfo.content_id(),
            metainfo: Arc::new(metainfo),
            local_peer,
            tracker,
            config,
            state: Mutex::new(SessionState {
                status: vec![PieceStatus::Pending; count as usize],
                verified: HashMap::new(),
                order,
                peers: Vec::new(),
                assembled: false,
            }),
            cancel: Arc::new(cancel),
        })
    }

    pub fn content_id(&self) -> ContentId {
        self.content_id
    }

    pub fn metainfo(&self) -> &Metainfo {
        &self.metainfo
    }

    pub fn piece_status(&self, index: PieceIndex) -> Option<PieceStatus> {
        self.state.lock().status.get(index.as_usize()).copied()
    }

    pub fn verified_count(&self) -> u32 {
        self.state.lock().verified.len() as u32
    }

    /// Stops claiming new pieces; the session ends with `TorrentError::Cancelled`.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Runs the session on a background task.
    pub fn spawn(self: Arc<Self>, destination: PathBuf) -> DownloadHandle {
        self.spawn_with(destination, |_, _| {})
    }

    /// Runs the session on a background task and calls `on_complete` after a
    /// successful assembly.
    pub fn spawn_with<F>(self: Arc<Self>, destination: PathBuf, on_complete: F) -> DownloadHandle
    where
        F: FnOnce(&DownloadSession, &DownloadReport) + Send + 'static,
    {
        let content_id = self.content_id;
        let cancel = Arc::clone(&self.cancel);
        let task = tokio::spawn(async move {
            let report = Arc::clone(&self).run(&destination).await?;
            on_complete(self.as_ref(), &report);
            Ok(report)
        });
        DownloadHandle {
            content_id,
            cancel,
            task,
        }
    }

    /// Downloads, verifies and assembles the content into `destination`.
    ///
    /// # Errors
    /// - `TorrentError::Cancelled` - If the session was cancelled first
    /// - `TorrentError::RetriesExhausted` - If a piece ran out of retry rounds
    /// - `TorrentError::AssemblyError` / `TorrentError::Io` - If writing the file fails
    /// - Any tracker error from the initial announce
    pub async fn run(self: Arc<Self>, destination: &Path) -> Result<DownloadReport, TorrentError> {
        let started = Instant::now();
        tracing::info!(
            "Downloading {} ({}, {} pieces) into {}",
            self.metainfo.name,
            self.content_id,
            self.metainfo.piece_count(),
            destination.display()
        );

        let peers = self.announce(AnnounceEvent::Started).await?;
        self.set_peers(peers);

        if let Err(e) = self.fetch_all().await {
            if let Err(announce_error) = self.announce(AnnounceEvent::Stopped).await {
                tracing::debug!(
                    "Failed to announce stop for {}: {announce_error}",
                    self.content_id
                );
            }
            return Err(e);
        }

        self.assemble(destination).await?;

        if let Err(e) = self.announce(AnnounceEvent::Completed).await {
            tracing::warn!("Failed to announce completion of {}: {e}", self.content_id);
        }

        let report = DownloadReport {
            content_id: self.content_id,
            name: self.metainfo.name.clone(),
            pieces: self.metainfo.piece_count(),
            bytes: self.metainfo.total_length,
            elapsed: started.elapsed(),
            destination: destination.to_path_buf(),
        };
        tracing::info!(
            "Downloaded {} ({} bytes) in {:.2?}",
            report.name,
            report.bytes,
            report.elapsed
        );
        Ok(report)
    }

    async fn announce(&self, event: AnnounceEvent) -> Result<Vec<PeerAddress>, TorrentError> {
        let request = match event {
            AnnounceEvent::Started => {
                AnnounceRequest::started(&self.metainfo, self.local_peer.clone())
            }
            event => AnnounceRequest::new(self.content_id, self.local_peer.clone(), event),
        };
        self.tracker.announce(request).await
    }

    fn set_peers(&self, mut peers: Vec<PeerAddress>) {
        peers.retain(|peer| *peer != self.local_peer);
        tracing::debug!("{} peers available for {}", peers.len(), self.content_id);
        self.state.lock().peers = peers;
    }

    async fn refresh_peers(&self) {
        match self.announce(AnnounceEvent::Started).await {
            Ok(peers) => self.set_peers(peers),
            Err(e) => tracing::warn!("Peer refresh for {} failed: {e}", self.content_id),
        }
    }

    /// Drives the worker pool until every piece is verified or the session stops.
    ///
    /// Cancellation only stops workers from claiming; a request already sent to
    /// a peer is allowed to finish, and its piece is kept if it verifies.
    async fn fetch_all(&self) -> Result<(), TorrentError> {
        let piece_count = self.metainfo.piece_count() as usize;
        let workers = self
            .config
            .download
            .max_concurrent_pieces
            .clamp(1, piece_count.max(1));

        let outcomes = join_all((0..workers).map(|_| self.worker())).await;
        if let Some(error) = outcomes
            .into_iter()
            .filter_map(Result::err)
            .find(|e| !matches!(e, TorrentError::Cancelled))
        {
            return Err(error);
        }
        if self.verified_count() < self.metainfo.piece_count() {
            return Err(TorrentError::Cancelled);
        }
        Ok(())
    }

    /// Fetches claimed pieces until none are left. A worker that fails
    /// cancels the session so its siblings stop claiming.
    async fn worker(&self) -> Result<(), TorrentError> {
        while let Some(index) = self.claim_next_piece() {
            if let Err(e) = self.fetch_piece(index).await {
                self.release(index);
                if !matches!(e, TorrentError::Cancelled) {
                    self.cancel();
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn claim_next_piece(&self) -> Option<PieceIndex> {
        if self.is_cancelled() {
            return None;
        }
        let mut state = self.state.lock();
        while let Some(index) = state.order.pop() {
            let status = &mut state.status[index.as_usize()];
            if *status == PieceStatus::Pending {
                *status = PieceStatus::InFlight;
                return Some(index);
            }
        }
        None
    }

    /// Returns an unfinished piece to the claim queue.
    fn release(&self, index: PieceIndex) {
        let mut state = self.state.lock();
        if state.status[index.as_usize()] == PieceStatus::InFlight {
            state.status[index.as_usize()] = PieceStatus::Pending;
            state.order.push(index);
        }
    }

    async fn fetch_piece(&self, index: PieceIndex) -> Result<(), TorrentError> {
        let policy = RetryPolicy::from_config(&self.config.download);
        let mut attempts = PieceAttempts::new(index);

        loop {
            let peers = self.state.lock().peers.clone();
            let start = if peers.is_empty() {
                0
            } else {
                (index.as_usize() + attempts.rounds() as usize) % peers.len()
            };

            while let Some(peer) = attempts.next_peer(&peers, start) {
                if self.is_cancelled() {
                    return Err(TorrentError::Cancelled);
                }
                match self.request_piece(&peer, index).await {
                    Ok(data) => {
                        self.record_verified(index, data);
                        return Ok(());
                    }
                    Err(e) => {
                        if attempts.record_failure(&peer, &e) == ErrorCategory::Fatal {
                            return Err(e);
                        }
                    }
                }
            }

            if peers.is_empty() {
                tracing::warn!("No peers available for piece {index} of {}", self.content_id);
            }

            let outcome = attempts.finish_round();
            if !policy.allows_another_round(outcome.rounds) {
                return Err(if peers.is_empty() {
                    TorrentError::NoPeersAvailable
                } else {
                    TorrentError::RetriesExhausted {
                        index,
                        rounds: outcome.rounds,
                    }
                });
            }

            self.pause(policy.delay_for(outcome)).await?;
            self.refresh_peers().await;
        }
    }

    /// Sleeps for `delay` unless the session is cancelled first.
    async fn pause(&self, delay: Duration) -> Result<(), TorrentError> {
        let mut cancelled = self.cancel.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = cancelled.wait_for(|cancelled| *cancelled) => Err(TorrentError::Cancelled),
        }
    }

    /// Fetches one piece from one peer and verifies it.
    async fn request_piece(
        &self,
        peer: &PeerAddress,
        index: PieceIndex,
    ) -> Result<Bytes, TorrentError> {
        let address = peer.resolve_within(self.config.peer.connect_timeout).await?;
        let mut connection = Connection::connect(
            address,
            self.config.peer.connect_timeout,
            self.config.peer.io_timeout,
            self.config.peer.max_frame_len,
        )
        .await?;

        let ack = connection.request(&PeerRequest::Handshake.to_value()).await?;
        if PeerResponse::from_value(&ack)?.into_result()? != PeerResponse::HandshakeAck {
            return Err(TorrentError::MalformedMessage {
                reason: format!("{peer} did not acknowledge the handshake"),
            });
        }

        let request = PeerRequest::RequestPiece {
            content_id: self.content_id,
            index,
        };
        let response = connection.request(&request.to_value()).await?;
        let PeerResponse::Piece {
            index: received,
            data,
        } = PeerResponse::from_value(&response)?.into_result()?
        else {
            return Err(TorrentError::MalformedMessage {
                reason: format!("{peer} answered piece {index} with a non-piece message"),
            });
        };
        if received != index {
            return Err(TorrentError::MalformedMessage {
                reason: format!("{peer} sent piece {received} when asked for {index}"),
            });
        }

        self.verify(index, &data)?;
        Ok(data)
    }

    fn verify(&self, index: PieceIndex, data: &[u8]) -> Result<(), TorrentError> {
        let expected_size = self.metainfo.piece_size(index);
        let expected_digest = self.metainfo.piece_digest(index);
        if expected_size != Some(data.len() as u32) || expected_digest != Some(&digest(data)) {
            return Err(TorrentError::PieceHashMismatch { index });
        }
        Ok(())
    }

    /// Records a verified piece. A piece already verified is left untouched.
    fn record_verified(&self, index: PieceIndex, data: Bytes) {
        let mut state = self.state.lock();
        if state.status[index.as_usize()] == PieceStatus::Verified {
            return;
        }
        state.status[index.as_usize()] = PieceStatus::Verified;
        state.verified.insert(index, data);
        tracing::info!(
            "Verified piece {index} of {} ({}/{})",
            self.metainfo.name,
            state.verified.len(),
            state.status.len()
        );
    }

    /// Writes every verified piece into `destination` at its offset.
    ///
    /// The verified pieces are released only once the file is written; a
    /// failed write leaves the session ready to assemble again.
    ///
    /// # Errors
    /// - `TorrentError::AssemblyError` - If a piece is not verified or the
    ///   session was already assembled
    /// - `TorrentError::Io` - If the destination cannot be written
    pub async fn assemble(&self, destination: &Path) -> Result<(), TorrentError> {
        let mut pieces: Vec<(PieceIndex, Bytes)> = {
            let mut state = self.state.lock();
            if state.assembled {
                return Err(TorrentError::AssemblyError {
                    reason: "session already assembled".to_string(),
                });
            }
            if let Some(missing) = state
                .status
                .iter()
                .position(|status| *status != PieceStatus::Verified)
            {
                return Err(TorrentError::AssemblyError {
                    reason: format!("piece {missing} is not verified"),
                });
            }
            state.assembled = true;
            state
                .verified
                .iter()
                .map(|(index, data)| (*index, data.clone()))
                .collect()
        };
        pieces.sort_by_key(|(index, _)| *index);

        let written = self.write_pieces(destination, &pieces).await;
        let mut state = self.state.lock();
        match &written {
            Ok(()) => {
                state.verified.clear();
                tracing::debug!("Assembled {} into {}", self.metainfo.name, destination.display());
            }
            Err(e) => {
                state.assembled = false;
                tracing::warn!("Assembling {} failed: {e}", self.metainfo.name);
            }
        }
        written
    }

    async fn write_pieces(
        &self,
        destination: &Path,
        pieces: &[(PieceIndex, Bytes)],
    ) -> Result<(), TorrentError> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(destination)
            .await?;
        file.set_len(self.metainfo.total_length).await?;

        for (index, data) in pieces {
            file.seek(SeekFrom::Start(self.metainfo.piece_offset(*index)))
                .await?;
            file.write_all(data).await?;
        }
        file.sync_all().await?;
        Ok(())
    }
}

/// Handle to a download running on a background task.
pub struct DownloadHandle {
    content_id: ContentId,
    cancel: Arc<watch::Sender<bool>>,
    task: JoinHandle<Result<DownloadReport, TorrentError>>,
}

impl DownloadHandle {
    pub fn content_id(&self) -> ContentId {
        self.content_id
    }

    /// Requests cooperative cancellation; in-flight requests finish or time out.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    /// Waits for the download to finish.
    ///
    /// # Errors
    /// - Any error the session ended with
    pub async fn wait(self) -> Result<DownloadReport, TorrentError> {
        self.task
            .await
            .map_err(|e| TorrentError::Io(std::io::Error::other(e)))?
    }
}
