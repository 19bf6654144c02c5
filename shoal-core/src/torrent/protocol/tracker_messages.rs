//! Tracker requests and responses.

use std::collections::BTreeMap;

use bytes::Bytes;

use super::{
    ErrorCode, PeerAddress, bytes_field, error_from_value, error_value, field, int_field,
    malformed, message_type, port_field, str_field,
};
use crate::codec::Value;
use crate::torrent::metainfo::{Metainfo, split_digests};
use crate::torrent::tracker::SwarmSummary;
use crate::torrent::{ContentId, TorrentError};

/// Membership change reported by an announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnnounceEvent {
    Started,
    Completed,
    Stopped,
}

impl AnnounceEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            AnnounceEvent::Started => "started",
            AnnounceEvent::Completed => "completed",
            AnnounceEvent::Stopped => "stopped",
        }
    }

    fn parse(text: &str) -> Result<Self, TorrentError> {
        match text {
            "started" => Ok(AnnounceEvent::Started),
            "completed" => Ok(AnnounceEvent::Completed),
            "stopped" => Ok(AnnounceEvent::Stopped),
            other => Err(malformed(format!("unknown announce event '{other}'"))),
        }
    }
}

impl std::fmt::Display for AnnounceEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A peer announcing its membership in a swarm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceRequest {
    pub content_id: ContentId,
    pub peer: PeerAddress,
    pub event: AnnounceEvent,
    /// Required when `started` creates a new swarm.
    pub metainfo: Option<Metainfo>,
}

impl AnnounceRequest {
    pub fn new(content_id: ContentId, peer: PeerAddress, event: AnnounceEvent) -> Self {
        Self {
            content_id,
            peer,
            event,
            metainfo: None,
        }
    }

    /// A `started` announce carrying the metainfo, so the tracker can create the swarm.
    pub fn started(metainfo: &Metainfo, peer: PeerAddress) -> Self {
        Self {
            content_id: metainfo.content_id(),
            peer,
            event: AnnounceEvent::Started,
            metainfo: Some(metainfo.clone()),
        }
    }
}

/// Requests a tracker accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerRequest {
    Announce(AnnounceRequest),
    ListSwarms,
}

impl TrackerRequest {
    pub fn to_value(&self) -> Value {
        match self {
            TrackerRequest::Announce(announce) => {
                let mut entries = vec![
                    ("type", Value::from("announce")),
                    (
                        "content_id",
                        Value::from(Bytes::copy_from_slice(announce.content_id.as_bytes())),
                    ),
                    ("host", Value::from(announce.peer.host.as_str())),
                    ("port", Value::Integer(i64::from(announce.peer.port))),
                    ("event", Value::from(announce.event.as_str())),
                ];
                if let Some(metainfo) = &announce.metainfo {
                    entries.push(("metainfo", metainfo.to_value()));
                }
                Value::map(entries)
            }
            TrackerRequest::ListSwarms => Value::map([("type", Value::from("list_swarms"))]),
        }
    }

    /// # Errors
    /// - `TorrentError::UnknownRequestType` - If `type` names no tracker request
    /// - `TorrentError::MalformedMessage` - If fields are missing or mistyped
    /// - `TorrentError::InvalidMetainfo` - If attached metainfo is invalid
    pub fn from_value(value: &Value) -> Result<Self, TorrentError> {
        match message_type(value)? {
            "announce" => {
                let content_id = ContentId::from_slice(bytes_field(value, "content_id")?)?;
                let peer = PeerAddress::new(str_field(value, "host")?, port_field(value, "port")?);
                let event = AnnounceEvent::parse(str_field(value, "event")?)?;
                let metainfo = value
                    .get(b"metainfo")
                    .map(Metainfo::from_value)
                    .transpose()?;
                Ok(TrackerRequest::Announce(AnnounceRequest {
                    content_id,
                    peer,
                    event,
                    metainfo,
                }))
            }
            "list_swarms" => Ok(TrackerRequest::ListSwarms),
            other => Err(TorrentError::UnknownRequestType {
                kind: other.to_string(),
            }),
        }
    }
}

/// Responses a tracker sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerResponse {
    Peers(Vec<PeerAddress>),
    Swarms(Vec<SwarmSummary>),
    Error { code: ErrorCode, reason: String },
}

impl TrackerResponse {
    pub fn error(error: &TorrentError) -> Self {
        TrackerResponse::Error {
            code: ErrorCode::for_error(error),
            reason: error.to_string(),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            TrackerResponse::Peers(peers) => Value::map([
                ("type", Value::from("peers")),
                (
                    "peers",
                    Value::List(peers.iter().map(PeerAddress::to_value).collect()),
                ),
            ]),
            TrackerResponse::Swarms(swarms) => {
                let swarms: BTreeMap<Bytes, Value> = swarms
                    .iter()
                    .map(|summary| {
                        (
                            Bytes::copy_from_slice(summary.content_id.as_bytes()),
                            summary_to_value(summary),
                        )
                    })
                    .collect();
                Value::map([
                    ("type", Value::from("swarms")),
                    ("swarms", Value::Map(swarms)),
                ])
            }
            TrackerResponse::Error { code, reason } => error_value(*code, reason),
        }
    }

    /// # Errors
    /// - `TorrentError::MalformedMessage` - If the response is not a tracker response
    /// - `TorrentError::InvalidMetainfo` - If a swarm summary carries an invalid digest list
    pub fn from_value(value: &Value) -> Result<Self, TorrentError> {
        match message_type(value)? {
            "peers" => {
                let peers = field(value, "peers")?
                    .as_list()
                    .ok_or_else(|| malformed("peers must be a list"))?
                    .iter()
                    .map(PeerAddress::from_value)
                    .collect::<Result<_, _>>()?;
                Ok(TrackerResponse::Peers(peers))
            }
            "swarms" => {
                let swarms = field(value, "swarms")?
                    .as_map()
                    .ok_or_else(|| malformed("swarms must be a map"))?
                    .iter()
                    .map(|(content_id, summary)| {
                        summary_from_value(ContentId::from_slice(content_id)?, summary)
                    })
                    .collect::<Result<_, _>>()?;
                Ok(TrackerResponse::Swarms(swarms))
            }
            "error" => {
                let (code, reason) = error_from_value(value)?;
                Ok(TrackerResponse::Error { code, reason })
            }
            other => Err(malformed(format!("unexpected tracker response '{other}'"))),
        }
    }
}

fn summary_to_value(summary: &SwarmSummary) -> Value {
    Value::map([
        ("name", Value::from(summary.name.as_str())),
        ("length", Value::Integer(summary.total_length as i64)),
        ("piece_length", Value::Integer(i64::from(summary.piece_length))),
        ("pieces", Value::from(summary.pieces.concat())),
        (
            "peers",
            Value::List(summary.members.iter().map(PeerAddress::to_value).collect()),
        ),
    ])
}

fn summary_from_value(content_id: ContentId, value: &Value) -> Result<SwarmSummary, TorrentError> {
    let total_length = int_field(value, "length")?;
    let piece_length = int_field(value, "piece_length")?;
    let members = field(value, "peers")?
        .as_list()
        .ok_or_else(|| malformed("peers must be a list"))?
        .iter()
        .map(PeerAddress::from_value)
        .collect::<Result<_, _>>()?;

    Ok(SwarmSummary {
        content_id,
        name: str_field(value, "name")?.to_string(),
        total_length: u64::try_from(total_length)
            .map_err(|_| malformed(format!("length {total_length} is negative")))?,
        piece_length: u32::try_from(piece_length)
            .map_err(|_| malformed(format!("piece_length {piece_length} out of range")))?,
        pieces: split_digests(bytes_field(value, "pieces")?)?,
        members,
    })
}
