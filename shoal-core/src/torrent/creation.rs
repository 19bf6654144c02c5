//! Content splitting, piece hashing and metainfo creation from local files
//!
//! Files are streamed one piece at a time, so sharing a large file only ever
//! holds a single piece in memory.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use sha1::{Digest, Sha1};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::metainfo::{Metainfo, TrackerEndpoint};
use super::{PieceDigest, PieceIndex, TorrentError};

/// Piece size used when none is configured (512 KiB)
pub const DEFAULT_PIECE_LENGTH: u32 = 524_288;

/// Computes the SHA-1 digest of one piece.
pub fn digest(bytes: &[u8]) -> PieceDigest {
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&Sha1::digest(bytes));
    hash
}

/// One piece produced by [`PieceReader`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Piece {
    pub index: PieceIndex,
    pub digest: PieceDigest,
    pub data: Bytes,
}

/// Piece digests and total size of streamed content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitOutcome {
    pub digests: Vec<PieceDigest>,
    pub total_length: u64,
}

/// Splits content into fixed-size pieces and hashes each one.
///
/// Every piece has exactly `piece_length` bytes except the last, which holds
/// the remainder.
#[derive(Debug, Clone, Copy)]
pub struct ContentSplitter {
    piece_length: u32,
}

impl ContentSplitter {
    /// Creates a splitter for the given piece length.
    ///
    /// # Errors
    /// - `TorrentError::InvalidMetainfo` - If `piece_length` is zero
    pub fn new(piece_length: u32) -> Result<Self, TorrentError> {
        if piece_length == 0 {
            return Err(TorrentError::InvalidMetainfo {
                reason: "piece_length must be positive".to_string(),
            });
        }
        Ok(Self { piece_length })
    }

    pub fn piece_length(&self) -> u32 {
        self.piece_length
    }

    /// Splits in-memory content, returning the piece slices alongside their digests.
    pub fn split<'a>(&self, data: &'a [u8]) -> (Vec<&'a [u8]>, Vec<PieceDigest>) {
        let pieces: Vec<&[u8]> = data.chunks(self.piece_length as usize).collect();
        let digests = pieces.iter().map(|piece| digest(piece)).collect();
        (pieces, digests)
    }

    /// Hashes everything `reader` yields without materializing it.
    ///
    /// # Errors
    /// - `TorrentError::Io` - If reading fails
    pub async fn hash_reader<R>(&self, reader: R) -> Result<SplitOutcome, TorrentError>
    where
        R: AsyncRead + Unpin,
    {
        let mut pieces = PieceReader::new(reader, self.piece_length);
        let mut outcome = SplitOutcome {
            digests: Vec::new(),
            total_length: 0,
        };
        while let Some(piece) = pieces.next_piece().await? {
            outcome.total_length += piece.data.len() as u64;
            outcome.digests.push(piece.digest);
        }
        Ok(outcome)
    }

    /// Hashes a file on disk piece by piece.
    ///
    /// # Errors
    /// - `TorrentError::Io` - If the file cannot be opened or read
    pub async fn hash_file(&self, path: &Path) -> Result<SplitOutcome, TorrentError> {
        let file = File::open(path).await?;
        self.hash_reader(file).await
    }
}

/// Streams pieces out of any async reader.
pub struct PieceReader<R> {
    reader: R,
    piece_length: usize,
    next_index: u32,
    exhausted: bool,
}

impl<R: AsyncRead + Unpin> PieceReader<R> {
    pub fn new(reader: R, piece_length: u32) -> Self {
        Self {
            reader,
            piece_length: piece_length as usize,
            next_index: 0,
            exhausted: false,
        }
    }

    /// Reads the next piece, filling it completely unless the stream ends first.
    ///
    /// Returns `None` once the reader is exhausted.
    ///
    /// # Errors
    /// - `TorrentError::Io` - If the underlying read fails
    pub async fn next_piece(&mut self) -> Result<Option<Piece>, TorrentError> {
        if self.exhausted {
            return Ok(None);
        }

        let mut data = vec![0u8; self.piece_length];
        let mut filled = 0;
        while filled < data.len() {
            let read = self.reader.read(&mut data[filled..]).await?;
            if read == 0 {
                self.exhausted = true;
                break;
            }
            filled += read;
        }

        if filled == 0 {
            return Ok(None);
        }
        data.truncate(filled);

        let piece = Piece {
            index: PieceIndex::new(self.next_index),
            digest: digest(&data),
            data: Bytes::from(data),
        };
        self.next_index += 1;
        Ok(Some(piece))
    }
}

/// Builds metainfo for local files that are about to be shared.
#[derive(Debug, Clone, Copy)]
pub struct TorrentCreator {
    splitter: ContentSplitter,
}

impl Default for TorrentCreator {
    fn default() -> Self {
        Self {
            splitter: ContentSplitter {
                piece_length: DEFAULT_PIECE_LENGTH,
            },
        }
    }
}

impl TorrentCreator {
    /// Creates a creator with a custom piece length.
    ///
    /// # Errors
    /// - `TorrentError::InvalidMetainfo` - If `piece_length` is zero
    pub fn with_piece_length(piece_length: u32) -> Result<Self, TorrentError> {
        Ok(Self {
            splitter: ContentSplitter::new(piece_length)?,
        })
    }

    /// Streams a file through the splitter and builds its metainfo.
    ///
    /// The metainfo name is the file name without its directory.
    ///
    /// # Errors
    /// - `TorrentError::Io` - File read error or access denied
    /// - `TorrentError::InvalidMetainfo` - Missing, empty or unnamed file
    pub async fn create_from_file(
        &self,
        file_path: &Path,
        tracker: TrackerEndpoint,
    ) -> Result<Metainfo, TorrentError> {
        if !file_path.is_file() {
            return Err(TorrentError::InvalidMetainfo {
                reason: format!("File does not exist: {}", file_path.display()),
            });
        }

        let name = file_path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| TorrentError::InvalidMetainfo {
                reason: format!("Invalid filename: {}", file_path.display()),
            })?
            .to_string();

        let outcome = self.splitter.hash_file(file_path).await?;
        if outcome.total_length == 0 {
            return Err(TorrentError::InvalidMetainfo {
                reason: "Cannot share an empty file".to_string(),
            });
        }

        tracing::debug!(
            "Split {name} into {} pieces of {} bytes",
            outcome.digests.len(),
            self.splitter.piece_length
        );

        Metainfo::build(
            name,
            outcome.total_length,
            self.splitter.piece_length,
            outcome.digests,
            tracker,
        )
    }
}

/// Path of the metainfo artifact written next to shared content (`<file>.torrent`).
pub fn metainfo_path(content_path: &Path) -> PathBuf {
    let mut path = content_path.as_os_str().to_owned();
    path.push(".torrent");
    PathBuf::from(path)
}
