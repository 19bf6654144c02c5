//! Framed wire messages for tracker and peer conversations
//!
//! Every frame is a big-endian `u32` length followed by the canonical encoding
//! of a map carrying a `type` key. Message sets are closed enums; unknown
//! types are rejected explicitly rather than ignored.

mod framing;
mod peer_messages;
mod tracker_messages;

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use bytes::Bytes;

pub use framing::{Connection, read_frame, write_frame};
pub use peer_messages::{PeerRequest, PeerResponse};
pub use tracker_messages::{AnnounceEvent, AnnounceRequest, TrackerRequest, TrackerResponse};

use super::TorrentError;
use crate::codec::Value;

/// Machine-readable code carried by `error` responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    UnknownSwarm,
    UnknownRequestType,
    MalformedRequest,
    ContentIdMismatch,
    NotFound,
    InvalidIndex,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::UnknownSwarm => "unknown_swarm",
            ErrorCode::UnknownRequestType => "unknown_request_type",
            ErrorCode::MalformedRequest => "malformed_request",
            ErrorCode::ContentIdMismatch => "content_id_mismatch",
            ErrorCode::NotFound => "not_found",
            ErrorCode::InvalidIndex => "invalid_index",
        }
    }

    /// Maps a local error onto the code a server reports for it.
    pub fn for_error(error: &TorrentError) -> Self {
        match error {
            TorrentError::UnknownSwarm { .. } => ErrorCode::UnknownSwarm,
            TorrentError::UnknownRequestType { .. } => ErrorCode::UnknownRequestType,
            TorrentError::ContentIdMismatch { .. } => ErrorCode::ContentIdMismatch,
            TorrentError::ContentNotFound { .. } => ErrorCode::NotFound,
            TorrentError::InvalidPieceIndex { .. } => ErrorCode::InvalidIndex,
            _ => ErrorCode::MalformedRequest,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorCode {
    type Err = TorrentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown_swarm" => Ok(ErrorCode::UnknownSwarm),
            "unknown_request_type" => Ok(ErrorCode::UnknownRequestType),
            "malformed_request" => Ok(ErrorCode::MalformedRequest),
            "content_id_mismatch" => Ok(ErrorCode::ContentIdMismatch),
            "not_found" => Ok(ErrorCode::NotFound),
            "invalid_index" => Ok(ErrorCode::InvalidIndex),
            other => Err(malformed(format!("unknown error code '{other}'"))),
        }
    }
}

/// Address a peer listens on, as announced to the tracker.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
pub struct PeerAddress {
    pub host: String,
    pub port: u16,
}

impl PeerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Resolves the announced host to a socket address.
    ///
    /// # Errors
    /// - `TorrentError::PeerUnreachable` - If the host does not resolve
    pub async fn resolve(&self) -> Result<SocketAddr, TorrentError> {
        if let Ok(ip) = self.host.parse() {
            return Ok(SocketAddr::new(ip, self.port));
        }
        let unreachable = |reason: String| TorrentError::PeerUnreachable {
            address: SocketAddr::from(([0, 0, 0, 0], self.port)),
            reason,
        };
        tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|e| unreachable(format!("cannot resolve {}: {e}", self.host)))?
            .next()
            .ok_or_else(|| unreachable(format!("{} resolved to nothing", self.host)))
    }

    /// Resolves the host, giving up after `limit`.
    ///
    /// # Errors
    /// - `TorrentError::Timeout` - If resolution does not finish in time
    /// - `TorrentError::PeerUnreachable` - If the host does not resolve
    pub async fn resolve_within(&self, limit: Duration) -> Result<SocketAddr, TorrentError> {
        tokio::time::timeout(limit, self.resolve())
            .await
            .map_err(|_| TorrentError::Timeout {
                operation: "resolve",
                address: SocketAddr::from(([0, 0, 0, 0], self.port)),
            })?
    }

    pub(crate) fn to_value(&self) -> Value {
        Value::map([
            ("host", Value::from(self.host.as_str())),
            ("port", Value::Integer(i64::from(self.port))),
        ])
    }

    pub(crate) fn from_value(value: &Value) -> Result<Self, TorrentError> {
        Ok(Self::new(str_field(value, "host")?, port_field(value, "port")?))
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for PeerAddress {
    type Err = TorrentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .filter(|(host, _)| !host.is_empty())
            .ok_or_else(|| malformed(format!("peer '{s}' must be HOST:PORT")))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| malformed(format!("peer '{s}' has an invalid port")))?;
        Ok(Self::new(host, port))
    }
}

impl From<SocketAddr> for PeerAddress {
    fn from(address: SocketAddr) -> Self {
        Self::new(address.ip().to_string(), address.port())
    }
}

fn error_value(code: ErrorCode, reason: &str) -> Value {
    Value::map([
        ("type", Value::from("error")),
        ("code", Value::from(code.as_str())),
        ("reason", Value::from(reason)),
    ])
}

fn error_from_value(value: &Value) -> Result<(ErrorCode, String), TorrentError> {
    let code = str_field(value, "code")?.parse::<ErrorCode>()?;
    let reason = str_field(value, "reason")?.to_string();
    Ok((code, reason))
}

fn malformed(reason: impl Into<String>) -> TorrentError {
    TorrentError::MalformedMessage {
        reason: reason.into(),
    }
}

fn message_type(value: &Value) -> Result<&str, TorrentError> {
    if value.as_map().is_none() {
        return Err(malformed("message is not a map"));
    }
    str_field(value, "type")
}

fn field<'a>(value: &'a Value, key: &str) -> Result<&'a Value, TorrentError> {
    value
        .get(key.as_bytes())
        .ok_or_else(|| malformed(format!("missing field '{key}'")))
}

fn int_field(value: &Value, key: &str) -> Result<i64, TorrentError> {
    field(value, key)?
        .as_integer()
        .ok_or_else(|| malformed(format!("field '{key}' must be an integer")))
}

fn str_field<'a>(value: &'a Value, key: &str) -> Result<&'a str, TorrentError> {
    field(value, key)?
        .as_str()
        .ok_or_else(|| malformed(format!("field '{key}' must be UTF-8 text")))
}

fn bytes_field<'a>(value: &'a Value, key: &str) -> Result<&'a Bytes, TorrentError> {
    field(value, key)?
        .as_bytes()
        .ok_or_else(|| malformed(format!("field '{key}' must be a byte string")))
}

fn port_field(value: &Value, key: &str) -> Result<u16, TorrentError> {
    let port = int_field(value, key)?;
    u16::try_from(port).map_err(|_| malformed(format!("port {port} out of range")))
}
