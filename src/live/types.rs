//! Shared types for live-class sessions

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::transport::LinkId;

/// Generate a random identifier for a session participant
pub fn generate_peer_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..20)
        .map(|_| {
            let idx = rng.gen_range(0..36u32);
            char::from_digit(idx, 36).unwrap_or('0')
        })
        .collect()
}

/// Caller-chosen name of one participant in a live session
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn random() -> Self {
        Self(generate_peer_id())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Truncated form for log lines
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(12)
            .map(|(i, _)| i)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Media kind of a single track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
        }
    }
}

/// One track of a media stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaTrack {
    pub id: String,
    pub kind: TrackKind,
}

impl MediaTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self { id: id.into(), kind }
    }

    pub fn audio(id: impl Into<String>) -> Self {
        Self::new(id, TrackKind::Audio)
    }

    pub fn video(id: impl Into<String>) -> Self {
        Self::new(id, TrackKind::Video)
    }
}

/// A set of tracks sent or received together (camera + microphone)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaStream {
    pub id: String,
    pub tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>, tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    /// First track of the given kind
    pub fn track(&self, kind: TrackKind) -> Option<&MediaTrack> {
        self.tracks.iter().find(|t| t.kind == kind)
    }
}

/// Events a live session reports to its owner
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Media from a remote participant became available
    RemoteStream { peer_id: PeerId, stream: MediaStream },
    /// A participant's connection was closed
    PeerLeft { peer_id: PeerId },
    /// A data-channel message arrived, forwarded verbatim
    Data {
        peer_id: PeerId,
        data: serde_json::Value,
    },
}

impl SessionEvent {
    pub fn peer_id(&self) -> &PeerId {
        match self {
            SessionEvent::RemoteStream { peer_id, .. } => peer_id,
            SessionEvent::PeerLeft { peer_id } => peer_id,
            SessionEvent::Data { peer_id, .. } => peer_id,
        }
    }
}

/// Direction of peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerDirection {
    Inbound,
    Outbound,
}

impl std::fmt::Display for PeerDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerDirection::Inbound => write!(f, "inbound"),
            PeerDirection::Outbound => write!(f, "outbound"),
        }
    }
}

/// Snapshot of one registered connection
#[derive(Debug, Clone)]
pub struct PeerStatus {
    pub peer_id: PeerId,
    /// Id of the link currently serving the peer
    pub link: LinkId,
    pub direction: PeerDirection,
    pub open: bool,
    pub age: Duration,
}

/// Messages exchanged with the signaling broker
///
/// `src` is filled in by the broker from the socket owner; clients may
/// leave it empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignalMessage {
    /// Broker accepted our identity
    #[serde(rename = "open")]
    Open { id: String },
    /// Another socket already holds this identity
    #[serde(rename = "id-taken")]
    IdTaken { id: String },
    #[serde(rename = "offer")]
    Offer {
        sdp: serde_json::Value,
        #[serde(default)]
        src: String,
        dst: String,
    },
    #[serde(rename = "answer")]
    Answer {
        sdp: serde_json::Value,
        #[serde(default)]
        src: String,
        dst: String,
    },
    #[serde(rename = "candidate")]
    Candidate {
        candidate: serde_json::Value,
        #[serde(default)]
        src: String,
        dst: String,
    },
    /// Sender hung up
    #[serde(rename = "leave")]
    Leave {
        #[serde(default)]
        src: String,
        dst: String,
    },
    /// Destination is not connected to the broker
    #[serde(rename = "expire")]
    Expire { dst: String },
}

impl SignalMessage {
    pub fn msg_type(&self) -> &str {
        match self {
            SignalMessage::Open { .. } => "open",
            SignalMessage::IdTaken { .. } => "id-taken",
            SignalMessage::Offer { .. } => "offer",
            SignalMessage::Answer { .. } => "answer",
            SignalMessage::Candidate { .. } => "candidate",
            SignalMessage::Leave { .. } => "leave",
            SignalMessage::Expire { .. } => "expire",
        }
    }

    /// Destination for relayed messages
    pub fn dst(&self) -> Option<&str> {
        match self {
            SignalMessage::Offer { dst, .. }
            | SignalMessage::Answer { dst, .. }
            | SignalMessage::Candidate { dst, .. }
            | SignalMessage::Leave { dst, .. } => Some(dst),
            _ => None,
        }
    }

    pub fn src(&self) -> Option<&str> {
        match self {
            SignalMessage::Offer { src, .. }
            | SignalMessage::Answer { src, .. }
            | SignalMessage::Candidate { src, .. }
            | SignalMessage::Leave { src, .. } => Some(src),
            _ => None,
        }
    }

    /// Stamp the sender identity on relayed messages
    pub fn with_src(mut self, owner: &str) -> Self {
        match &mut self {
            SignalMessage::Offer { src, .. }
            | SignalMessage::Answer { src, .. }
            | SignalMessage::Candidate { src, .. }
            | SignalMessage::Leave { src, .. } => *src = owner.to_string(),
            _ => {}
        }
        self
    }

    pub fn offer(sdp: serde_json::Value, dst: &str) -> Self {
        SignalMessage::Offer {
            sdp,
            src: String::new(),
            dst: dst.to_string(),
        }
    }

    pub fn answer(sdp: serde_json::Value, dst: &str) -> Self {
        SignalMessage::Answer {
            sdp,
            src: String::new(),
            dst: dst.to_string(),
        }
    }

    pub fn candidate(candidate: serde_json::Value, dst: &str) -> Self {
        SignalMessage::Candidate {
            candidate,
            src: String::new(),
            dst: dst.to_string(),
        }
    }

    pub fn leave(dst: &str) -> Self {
        SignalMessage::Leave {
            src: String::new(),
            dst: dst.to_string(),
        }
    }
}

/// Configuration for live-class sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveConfig {
    /// Base websocket URL of the signaling broker (peer id is appended)
    #[serde(default = "default_signaling_url")]
    pub signaling_url: String,
    /// STUN servers for NAT traversal
    #[serde(default = "default_stun_servers")]
    pub stun_servers: Vec<String>,
    /// Label of the data channel opened alongside each call
    #[serde(default = "default_channel_label")]
    pub channel_label: String,
    /// Capacity of the network event channel
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_signaling_url() -> String {
    "ws://127.0.0.1:8080/live".to_string()
}

fn default_stun_servers() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun.cloudflare.com:3478".to_string(),
    ]
}

fn default_channel_label() -> String {
    "live".to_string()
}

fn default_event_buffer() -> usize {
    100
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            signaling_url: default_signaling_url(),
            stun_servers: default_stun_servers(),
            channel_label: default_channel_label(),
            event_buffer: default_event_buffer(),
        }
    }
}
