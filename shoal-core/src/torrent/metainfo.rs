//! Metainfo descriptors, content identifiers and their canonical persistence

use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;

use bytes::Bytes;
use sha1::{Digest, Sha1};

use super::{ContentId, PieceDigest, PieceIndex, TorrentError};
use crate::codec::{self, Value};

/// Host and port of the tracker a swarm announces to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TrackerEndpoint {
    pub host: String,
    pub port: u16,
}

impl TrackerEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Resolves the endpoint to a socket address, taking the first result.
    ///
    /// # Errors
    /// - `TorrentError::Io` - If name resolution fails
    /// - `TorrentError::InvalidMetainfo` - If the host resolves to nothing
    pub async fn resolve(&self) -> Result<SocketAddr, TorrentError> {
        tokio::net::lookup_host((self.host.as_str(), self.port))
            .await?
            .next()
            .ok_or_else(|| TorrentError::InvalidMetainfo {
                reason: format!("tracker host {} did not resolve", self.host),
            })
    }

    fn to_value(&self) -> Value {
        Value::map([
            ("host", Value::from(self.host.as_str())),
            ("port", Value::Integer(i64::from(self.port))),
        ])
    }

    fn from_value(value: &Value) -> Result<Self, TorrentError> {
        let host = required_str(value, "host")?;
        let port = required_int(value, "port")?;
        let port = u16::try_from(port).map_err(|_| invalid(format!("port {port} out of range")))?;
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for TrackerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for TrackerEndpoint {
    type Err = TorrentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| invalid(format!("tracker '{s}' must be HOST:PORT")))?;
        if host.is_empty() {
            return Err(invalid(format!("tracker '{s}' has an empty host")));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| invalid(format!("tracker '{s}' has an invalid port")))?;
        Ok(Self::new(host, port))
    }
}

impl From<SocketAddr> for TrackerEndpoint {
    fn from(address: SocketAddr) -> Self {
        Self::new(address.ip().to_string(), address.port())
    }
}

/// Descriptor of shared content: its size, piece layout and piece digests.
///
/// Every constructor validates the layout, so a `Metainfo` in hand always has
/// exactly `ceil(total_length / piece_length)` digests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metainfo {
    pub tracker: TrackerEndpoint,
    pub name: String,
    pub total_length: u64,
    pub piece_length: u32,
    pub pieces: Vec<PieceDigest>,
}

impl Metainfo {
    /// Builds a validated metainfo.
    ///
    /// # Errors
    /// - `TorrentError::InvalidMetainfo` - If the layout invariants do not hold
    pub fn build(
        name: impl Into<String>,
        total_length: u64,
        piece_length: u32,
        pieces: Vec<PieceDigest>,
        tracker: TrackerEndpoint,
    ) -> Result<Self, TorrentError> {
        let metainfo = Self {
            tracker,
            name: name.into(),
            total_length,
            piece_length,
            pieces,
        };
        metainfo.validate()?;
        Ok(metainfo)
    }

    /// Checks the layout invariants.
    ///
    /// # Errors
    /// - `TorrentError::InvalidMetainfo` - Zero lengths, a digest count that does not
    ///   match the piece layout, or a name that is not a plain file name
    pub fn validate(&self) -> Result<(), TorrentError> {
        if self.piece_length == 0 {
            return Err(invalid("piece_length must be positive"));
        }
        if self.total_length == 0 {
            return Err(invalid("length must be positive"));
        }
        let expected = self.total_length.div_ceil(u64::from(self.piece_length));
        if self.pieces.len() as u64 != expected {
            return Err(invalid(format!(
                "expected {expected} piece digests for {} bytes, found {}",
                self.total_length,
                self.pieces.len()
            )));
        }
        if u32::try_from(expected).is_err() {
            return Err(invalid(format!("{expected} pieces exceed the index range")));
        }
        if self.name.is_empty()
            || self.name == "."
            || self.name == ".."
            || self.name.contains(['/', '\\'])
        {
            return Err(invalid(format!("'{}' is not a plain file name", self.name)));
        }
        Ok(())
    }

    pub fn piece_count(&self) -> u32 {
        self.pieces.len() as u32
    }

    /// Returns the byte length of a piece, or `None` if the index is out of range.
    pub fn piece_size(&self, index: PieceIndex) -> Option<u32> {
        let count = self.piece_count();
        if index.as_u32() >= count {
            return None;
        }
        if index.as_u32() + 1 < count {
            return Some(self.piece_length);
        }
        let before_last = u64::from(self.piece_length) * u64::from(count - 1);
        Some((self.total_length - before_last) as u32)
    }

    /// Byte offset of a piece within the content.
    pub fn piece_offset(&self, index: PieceIndex) -> u64 {
        u64::from(index.as_u32()) * u64::from(self.piece_length)
    }

    pub fn piece_digest(&self, index: PieceIndex) -> Option<&PieceDigest> {
        self.pieces.get(index.as_usize())
    }

    /// The `info` map: everything that identifies the content, without the tracker.
    pub fn info_value(&self) -> Value {
        let concatenated: Vec<u8> = self.pieces.concat();
        Value::map([
            ("length", Value::Integer(self.total_length as i64)),
            ("name", Value::from(self.name.as_str())),
            ("piece_length", Value::Integer(i64::from(self.piece_length))),
            ("pieces", Value::from(concatenated)),
        ])
    }

    /// SHA-1 over the canonical encoding of the `info` map.
    ///
    /// Independent of the tracker endpoint, so re-announcing the same content
    /// elsewhere keeps its identity.
    pub fn content_id(&self) -> ContentId {
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&Sha1::digest(self.info_value().encode()));
        ContentId::new(hash)
    }

    pub fn to_value(&self) -> Value {
        Value::map([
            ("announce", self.tracker.to_value()),
            ("info", self.info_value()),
        ])
    }

    /// Rebuilds a metainfo from its full value form (`announce` plus `info`).
    ///
    /// # Errors
    /// - `TorrentError::InvalidMetainfo` - Missing fields, wrong types or invalid layout
    pub fn from_value(value: &Value) -> Result<Self, TorrentError> {
        let tracker = TrackerEndpoint::from_value(required(value, "announce")?)?;
        Self::from_info_value(required(value, "info")?, tracker)
    }

    /// Rebuilds a metainfo from an `info` map, attaching the given tracker.
    ///
    /// # Errors
    /// - `TorrentError::InvalidMetainfo` - Missing fields, wrong types or invalid layout
    pub fn from_info_value(info: &Value, tracker: TrackerEndpoint) -> Result<Self, TorrentError> {
        let name = required_str(info, "name")?;
        let total_length = required_int(info, "length")?;
        let total_length = u64::try_from(total_length)
            .map_err(|_| invalid(format!("length {total_length} is negative")))?;
        let piece_length = required_int(info, "piece_length")?;
        let piece_length = u32::try_from(piece_length)
            .map_err(|_| invalid(format!("piece_length {piece_length} out of range")))?;
        let pieces = split_digests(
            required(info, "pieces")?
                .as_bytes()
                .ok_or_else(|| invalid("pieces must be a byte string"))?,
        )?;

        Self::build(name, total_length, piece_length, pieces, tracker)
    }

    /// Canonical byte form used for `.torrent` files.
    pub fn encode(&self) -> Vec<u8> {
        self.to_value().encode()
    }

    /// # Errors
    /// - `TorrentError::Codec` - If the bytes are not a canonical encoding
    /// - `TorrentError::InvalidMetainfo` - If the decoded value is not a metainfo
    pub fn decode(data: &[u8]) -> Result<Self, TorrentError> {
        Self::from_value(&codec::decode(data)?)
    }

    /// Writes the metainfo file.
    ///
    /// # Errors
    /// - `TorrentError::Io` - If the file cannot be written
    pub async fn save(&self, path: &Path) -> Result<(), TorrentError> {
        tokio::fs::write(path, self.encode()).await?;
        tracing::debug!("Wrote metainfo for {} to {}", self.name, path.display());
        Ok(())
    }

    /// Reads a metainfo file.
    ///
    /// # Errors
    /// - `TorrentError::Io` - If the file cannot be read
    /// - `TorrentError::Codec` / `TorrentError::InvalidMetainfo` - If its contents are invalid
    pub async fn load(path: &Path) -> Result<Self, TorrentError> {
        let data = tokio::fs::read(path).await?;
        Self::decode(&data)
    }
}

/// Splits a concatenated digest string into 20-byte digests.
pub(crate) fn split_digests(concatenated: &Bytes) -> Result<Vec<PieceDigest>, TorrentError> {
    if concatenated.len() % 20 != 0 {
        return Err(invalid(format!(
            "pieces length {} is not a multiple of 20",
            concatenated.len()
        )));
    }
    Ok(concatenated
        .chunks_exact(20)
        .map(|chunk| {
            let mut digest = [0u8; 20];
            digest.copy_from_slice(chunk);
            digest
        })
        .collect())
}

fn invalid(reason: impl Into<String>) -> TorrentError {
    TorrentError::InvalidMetainfo {
        reason: reason.into(),
    }
}

fn required<'a>(value: &'a Value, key: &str) -> Result<&'a Value, TorrentError> {
    value
        .get(key.as_bytes())
        .ok_or_else(|| invalid(format!("missing field '{key}'")))
}

fn required_int(value: &Value, key: &str) -> Result<i64, TorrentError> {
    required(value, key)?
        .as_integer()
        .ok_or_else(|| invalid(format!("field '{key}' must be an integer")))
}

fn required_str<'a>(value: &'a Value, key: &str) -> Result<&'a str, TorrentError> {
    required(value, key)?
        .as_str()
        .ok_or_else(|| invalid(format!("field '{key}' must be UTF-8 text")))
}
