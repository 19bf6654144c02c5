//! Peer-to-peer requests and responses.

use bytes::Bytes;

use super::{
    ErrorCode, bytes_field, error_from_value, error_value, int_field, malformed, message_type,
};
use crate::codec::Value;
use crate::torrent::{ContentId, PieceIndex, TorrentError};

/// Requests a peer listener accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerRequest {
    /// Liveness check answered with `HandshakeAck`.
    Handshake,
    RequestPiece {
        content_id: ContentId,
        index: PieceIndex,
    },
}

impl PeerRequest {
    pub fn to_value(&self) -> Value {
        match self {
            PeerRequest::Handshake => Value::map([("type", Value::from("handshake"))]),
            PeerRequest::RequestPiece { content_id, index } => Value::map([
                ("type", Value::from("request_piece")),
                (
                    "content_id",
                    Value::from(Bytes::copy_from_slice(content_id.as_bytes())),
                ),
                ("index", Value::Integer(i64::from(index.as_u32()))),
            ]),
        }
    }

    /// # Errors
    /// - `TorrentError::UnknownRequestType` - If `type` names no peer request
    /// - `TorrentError::MalformedMessage` - If fields are missing or mistyped
    pub fn from_value(value: &Value) -> Result<Self, TorrentError> {
        match message_type(value)? {
            "handshake" => Ok(PeerRequest::Handshake),
            "request_piece" => {
                let content_id = ContentId::from_slice(bytes_field(value, "content_id")?)?;
                let index = int_field(value, "index")?;
                let index = u32::try_from(index)
                    .map_err(|_| malformed(format!("piece index {index} out of range")))?;
                Ok(PeerRequest::RequestPiece {
                    content_id,
                    index: PieceIndex::new(index),
                })
            }
            other => Err(TorrentError::UnknownRequestType {
                kind: other.to_string(),
            }),
        }
    }
}

/// Responses a peer listener sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerResponse {
    HandshakeAck,
    Piece { index: PieceIndex, data: Bytes },
    Error { code: ErrorCode, reason: String },
}

impl PeerResponse {
    pub fn error(code: ErrorCode, reason: impl Into<String>) -> Self {
        PeerResponse::Error {
            code,
            reason: reason.into(),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            PeerResponse::HandshakeAck => Value::map([("type", Value::from("handshake_ack"))]),
            PeerResponse::Piece { index, data } => Value::map([
                ("type", Value::from("piece")),
                ("index", Value::Integer(i64::from(index.as_u32()))),
                ("data", Value::Bytes(data.clone())),
            ]),
            PeerResponse::Error { code, reason } => error_value(*code, reason),
        }
    }

    /// # Errors
    /// - `TorrentError::MalformedMessage` - If the value is not a peer response
    pub fn from_value(value: &Value) -> Result<Self, TorrentError> {
        match message_type(value)? {
            "handshake_ack" => Ok(PeerResponse::HandshakeAck),
            "piece" => {
                let index = int_field(value, "index")?;
                let index = u32::try_from(index)
                    .map_err(|_| malformed(format!("piece index {index} out of range")))?;
                Ok(PeerResponse::Piece {
                    index: PieceIndex::new(index),
                    data: bytes_field(value, "data")?.clone(),
                })
            }
            "error" => {
                let (code, reason) = error_from_value(value)?;
                Ok(PeerResponse::Error { code, reason })
            }
            other => Err(malformed(format!("unexpected peer response '{other}'"))),
        }
    }

    /// Turns an `error` response into `TorrentError::Rejected`.
    ///
    /// # Errors
    /// - `TorrentError::Rejected` - If this is an error response
    pub fn into_result(self) -> Result<Self, TorrentError> {
        match self {
            PeerResponse::Error { code, reason } => Err(TorrentError::Rejected { code, reason }),
            other => Ok(other),
        }
    }
}
