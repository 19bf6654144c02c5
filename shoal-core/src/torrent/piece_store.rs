//! Locally held content served to other peers
//!
//! Shared files are never modified; each request opens the backing file and
//! reads exactly the requested piece's byte range.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use super::metainfo::Metainfo;
use super::{ContentId, PieceIndex, TorrentError};

/// Abstract interface for piece retrieval.
///
/// The peer listener serves whatever a `PieceStore` holds.
#[async_trait]
pub trait PieceStore: Send + Sync {
    /// Retrieves the bytes of one piece.
    ///
    /// # Errors
    ///
    /// - `TorrentError::ContentNotFound` - If the content is not held
    /// - `TorrentError::InvalidPieceIndex` - If the index is out of range
    /// - `TorrentError::Io` - If the backing storage cannot be read
    async fn piece_data(
        &self,
        content_id: ContentId,
        index: PieceIndex,
    ) -> Result<Bytes, TorrentError>;

    /// Checks whether the content is held at all.
    fn has_content(&self, content_id: ContentId) -> bool;

    /// Returns the number of pieces of held content.
    ///
    /// # Errors
    ///
    /// - `TorrentError::ContentNotFound` - If the content is not held
    fn piece_count(&self, content_id: ContentId) -> Result<u32, TorrentError>;
}

/// A complete file on disk together with its metainfo.
#[derive(Debug, Clone)]
pub struct SharedFile {
    pub metainfo: Arc<Metainfo>,
    pub path: PathBuf,
}

/// Table of shared files keyed by content id.
#[derive(Default)]
pub struct SharedFiles {
    files: RwLock<HashMap<ContentId, SharedFile>>,
}

impl SharedFiles {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts serving `path` as the content described by `metainfo`.
    ///
    /// Re-sharing the same content replaces the previous backing path.
    pub fn insert(&self, metainfo: Metainfo, path: &Path) -> ContentId {
        let content_id = metainfo.content_id();
        tracing::debug!("Sharing {} as {content_id}", path.display());
        self.files.write().insert(
            content_id,
            SharedFile {
                metainfo: Arc::new(metainfo),
                path: path.to_path_buf(),
            },
        );
        content_id
    }

    pub fn remove(&self, content_id: ContentId) -> Option<SharedFile> {
        self.files.write().remove(&content_id)
    }

    pub fn get(&self, content_id: ContentId) -> Option<SharedFile> {
        self.files.read().get(&content_id).cloned()
    }

    /// Snapshot of every shared file.
    pub fn all(&self) -> Vec<(ContentId, SharedFile)> {
        self.files
            .read()
            .iter()
            .map(|(content_id, file)| (*content_id, file.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.files.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.read().is_empty()
    }
}

#[async_trait]
impl PieceStore for SharedFiles {
    async fn piece_data(
        &self,
        content_id: ContentId,
        index: PieceIndex,
    ) -> Result<Bytes, TorrentError> {
        let shared = self
            .get(content_id)
            .ok_or(TorrentError::ContentNotFound { content_id })?;
        let metainfo = &shared.metainfo;
        let size = metainfo
            .piece_size(index)
            .ok_or(TorrentError::InvalidPieceIndex {
                index,
                count: metainfo.piece_count(),
            })?;

        let mut file = File::open(&shared.path).await?;
        file.seek(SeekFrom::Start(metainfo.piece_offset(index)))
            .await?;
        let mut data = vec![0u8; size as usize];
        file.read_exact(&mut data).await?;
        Ok(Bytes::from(data))
    }

    fn has_content(&self, content_id: ContentId) -> bool {
        self.files.read().contains_key(&content_id)
    }

    fn piece_count(&self, content_id: ContentId) -> Result<u32, TorrentError> {
        self.files
            .read()
            .get(&content_id)
            .map(|shared| shared.metainfo.piece_count())
            .ok_or(TorrentError::ContentNotFound { content_id })
    }
}
