//! Seam between a live session and the peer-connection library underneath

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use super::types::{MediaStream, MediaTrack, PeerId};

/// Identifies one link among every link a network has handed out.
///
/// A peer that reconnects gets a new link with a new id, so events still in
/// flight from the old connection can be told apart.
pub type LinkId = u64;

/// Events a network raises toward the session that owns it
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkEvent {
    /// A remote peer is calling us and waits for `PeerNetwork::answer`
    IncomingCall { peer_id: PeerId },
    /// The data path to `peer_id` is ready
    Open { peer_id: PeerId },
    /// Remote media was negotiated on link `link`
    Stream {
        peer_id: PeerId,
        link: LinkId,
        stream: MediaStream,
    },
    /// A data message arrived on link `link`
    Data {
        peer_id: PeerId,
        link: LinkId,
        data: serde_json::Value,
    },
    /// The remote end closed link `link`
    Closed { peer_id: PeerId, link: LinkId },
}

impl NetworkEvent {
    pub fn peer_id(&self) -> &PeerId {
        match self {
            NetworkEvent::IncomingCall { peer_id }
            | NetworkEvent::Open { peer_id }
            | NetworkEvent::Stream { peer_id, .. }
            | NetworkEvent::Data { peer_id, .. }
            | NetworkEvent::Closed { peer_id, .. } => peer_id,
        }
    }

    /// Link the event belongs to, for events tied to one connection
    pub fn link(&self) -> Option<LinkId> {
        match self {
            NetworkEvent::Stream { link, .. }
            | NetworkEvent::Data { link, .. }
            | NetworkEvent::Closed { link, .. } => Some(*link),
            NetworkEvent::IncomingCall { .. } | NetworkEvent::Open { .. } => None,
        }
    }
}

/// The local peer identity: places and answers calls
#[async_trait]
pub trait PeerNetwork: Send + Sync + 'static {
    /// Identity other peers use to reach us
    fn local_id(&self) -> &PeerId;

    /// Place an outbound call carrying `stream`
    async fn call(&self, peer_id: &PeerId, stream: &MediaStream) -> Result<Arc<dyn PeerLink>>;

    /// Answer a pending inbound call, sending `stream` if there is one
    async fn answer(
        &self,
        peer_id: &PeerId,
        stream: Option<&MediaStream>,
    ) -> Result<Arc<dyn PeerLink>>;

    /// Tear down the local identity
    async fn destroy(&self) -> Result<()>;
}

/// One established (or establishing) connection to a remote peer
#[async_trait]
pub trait PeerLink: Send + Sync {
    fn peer_id(&self) -> &PeerId;

    /// Id carried by every `NetworkEvent` this link raises
    fn id(&self) -> LinkId;

    /// Whether data messages can be delivered right now
    fn is_open(&self) -> bool;

    /// Send a structured message over the data path
    async fn send(&self, data: &serde_json::Value) -> Result<()>;

    /// Swap the outbound track of the same kind as `track`.
    /// Returns false when no sender of that kind exists.
    async fn replace_track(&self, track: &MediaTrack) -> Result<bool>;

    async fn close(&self) -> Result<()>;
}
