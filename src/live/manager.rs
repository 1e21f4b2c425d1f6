//! Live-class session manager: owns the connection table for one local identity

use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::transport::{LinkId, NetworkEvent, PeerLink, PeerNetwork};
use super::types::{MediaStream, MediaTrack, PeerDirection, PeerId, PeerStatus, SessionEvent};

/// Entry in the connection table
struct Connection {
    link: Arc<dyn PeerLink>,
    direction: PeerDirection,
    stream_surfaced: bool,
    created_at: Instant,
}

/// Relays media and data between the local participant and any number of peers.
///
/// The manager is the only owner of its connection table; network callbacks
/// reach it as `NetworkEvent`s through `handle_event`, and everything it
/// reports goes out on the `SessionEvent` channel returned by `new`.
pub struct LiveClassManager {
    network: Arc<dyn PeerNetwork>,
    local_stream: Option<MediaStream>,
    connections: HashMap<PeerId, Connection>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    destroyed: bool,
}

impl LiveClassManager {
    pub fn new(network: Arc<dyn PeerNetwork>) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let manager = Self {
            network,
            local_stream: None,
            connections: HashMap::new(),
            events_tx,
            destroyed: false,
        };
        (manager, events_rx)
    }

    pub fn local_id(&self) -> &PeerId {
        self.network.local_id()
    }

    pub fn local_stream(&self) -> Option<&MediaStream> {
        self.local_stream.as_ref()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Record the outbound stream used for every later call and answer
    pub fn start(&mut self, stream: MediaStream) {
        info!(
            "[{}] Local stream {} with {} track(s)",
            self.local_id().short(),
            stream.id,
            stream.tracks.len()
        );
        self.local_stream = Some(stream);
    }

    /// Call `peer_id` with the local stream.
    ///
    /// Returns `Ok(false)` without touching the network when no local
    /// stream was set. A peer that is already registered keeps its link.
    pub async fn connect(&mut self, peer_id: &PeerId) -> Result<bool> {
        if self.destroyed {
            anyhow::bail!("live session {} was destroyed", self.local_id());
        }

        let Some(stream) = self.local_stream.as_ref() else {
            warn!(
                "[{}] connect({}) before start, ignoring",
                self.local_id().short(),
                peer_id
            );
            return Ok(false);
        };

        if self.connections.contains_key(peer_id) {
            debug!("[{}] Already connected to {}", self.local_id().short(), peer_id);
            return Ok(true);
        }

        let link = self.network.call(peer_id, stream).await?;
        info!("[{}] Calling {}", self.local_id().short(), peer_id);
        self.register(peer_id.clone(), link, PeerDirection::Outbound);
        Ok(true)
    }

    /// Close and forget the connection to `peer_id`.
    ///
    /// Emits `PeerLeft` and returns true if the peer was known.
    pub async fn disconnect(&mut self, peer_id: &PeerId) -> bool {
        let Some(conn) = self.connections.remove(peer_id) else {
            return false;
        };

        if let Err(e) = conn.link.close().await {
            debug!("[{}] Error closing {}: {}", self.local_id().short(), peer_id, e);
        }
        info!("[{}] Disconnected {}", self.local_id().short(), peer_id);
        self.emit(SessionEvent::PeerLeft {
            peer_id: peer_id.clone(),
        });
        true
    }

    /// Send `data` to every open connection; returns how many received it.
    ///
    /// Connections that are not open yet are skipped and the message is
    /// not queued for them.
    pub async fn broadcast(&self, data: &serde_json::Value) -> usize {
        let mut delivered = 0;
        for (peer_id, conn) in &self.connections {
            if !conn.link.is_open() {
                debug!("[{}] Skipping {} (not open)", self.local_id().short(), peer_id);
                continue;
            }
            match conn.link.send(data).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!("[{}] Send to {} failed: {}", self.local_id().short(), peer_id, e),
            }
        }
        delivered
    }

    /// Swap the outbound track of `track.kind` on the connection to `peer_id`
    pub async fn replace_track(&self, peer_id: &PeerId, track: &MediaTrack) -> Result<bool> {
        let Some(conn) = self.connections.get(peer_id) else {
            return Ok(false);
        };
        let replaced = conn.link.replace_track(track).await?;
        if replaced {
            debug!(
                "[{}] Replaced {} track for {} with {}",
                self.local_id().short(),
                track.kind,
                peer_id,
                track.id
            );
        }
        Ok(replaced)
    }

    /// Swap the outbound track on every connection; returns how many matched
    pub async fn replace_track_all(&self, track: &MediaTrack) -> usize {
        let mut replaced = 0;
        for (peer_id, conn) in &self.connections {
            match conn.link.replace_track(track).await {
                Ok(true) => replaced += 1,
                Ok(false) => {}
                Err(e) => warn!(
                    "[{}] Track replacement for {} failed: {}",
                    self.local_id().short(),
                    peer_id,
                    e
                ),
            }
        }
        replaced
    }

    /// Tear down the local identity. Individual links are not closed first.
    pub async fn destroy(&mut self) -> Result<()> {
        if self.destroyed {
            return Ok(());
        }
        self.destroyed = true;
        self.connections.clear();
        info!("[{}] Destroying live session", self.local_id().short());
        self.network.destroy().await
    }

    /// Apply one event coming from the network
    pub async fn handle_event(&mut self, event: NetworkEvent) {
        if self.destroyed {
            debug!("Dropping {:?} after destroy", event);
            return;
        }

        match event {
            NetworkEvent::IncomingCall { peer_id } => {
                info!("[{}] Incoming call from {}", self.local_id().short(), peer_id);
                let answered = self
                    .network
                    .answer(&peer_id, self.local_stream.as_ref())
                    .await;
                match answered {
                    Ok(link) => {
                        if let Some(old) = self.connections.remove(&peer_id) {
                            let _ = old.link.close().await;
                        }
                        self.register(peer_id, link, PeerDirection::Inbound);
                    }
                    Err(e) => warn!(
                        "[{}] Failed to answer {}: {}",
                        self.local_id().short(),
                        peer_id,
                        e
                    ),
                }
            }
            NetworkEvent::Open { peer_id } => {
                debug!("[{}] Connection to {} open", self.local_id().short(), peer_id);
            }
            NetworkEvent::Stream {
                peer_id,
                link,
                stream,
            } => {
                let Some(conn) = self.current(&peer_id, link) else {
                    return;
                };
                if conn.stream_surfaced {
                    return;
                }
                conn.stream_surfaced = true;
                self.emit(SessionEvent::RemoteStream { peer_id, stream });
            }
            NetworkEvent::Data {
                peer_id,
                link,
                data,
            } => {
                if self.current(&peer_id, link).is_some() {
                    self.emit(SessionEvent::Data { peer_id, data });
                }
            }
            NetworkEvent::Closed { peer_id, link } => {
                if self.current(&peer_id, link).is_some() {
                    self.connections.remove(&peer_id);
                    info!("[{}] {} hung up", self.local_id().short(), peer_id);
                    self.emit(SessionEvent::PeerLeft { peer_id });
                }
            }
        }
    }

    /// Registered connection to `peer_id`, if `link` is still the one in use
    fn current(&mut self, peer_id: &PeerId, link: LinkId) -> Option<&mut Connection> {
        let local = self.network.local_id().short().to_string();
        match self.connections.get_mut(peer_id) {
            Some(conn) if conn.link.id() == link => Some(conn),
            Some(_) => {
                debug!("[{}] Ignoring event from retired link {} of {}", local, link, peer_id);
                None
            }
            None => {
                debug!("[{}] Event from unknown peer {}", local, peer_id);
                None
            }
        }
    }

    pub fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.connections.keys().cloned().collect();
        peers.sort();
        peers
    }

    pub fn is_connected(&self, peer_id: &PeerId) -> bool {
        self.connections.contains_key(peer_id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn statuses(&self) -> Vec<PeerStatus> {
        self.connections
            .iter()
            .map(|(peer_id, conn)| PeerStatus {
                peer_id: peer_id.clone(),
                link: conn.link.id(),
                direction: conn.direction,
                open: conn.link.is_open(),
                age: conn.created_at.elapsed(),
            })
            .collect()
    }

    fn register(&mut self, peer_id: PeerId, link: Arc<dyn PeerLink>, direction: PeerDirection) {
        self.connections.insert(
            peer_id,
            Connection {
                link,
                direction,
                stream_surfaced: false,
                created_at: Instant::now(),
            },
        );
    }

    fn emit(&self, event: SessionEvent) {
        // Owner may have stopped listening
        let _ = self.events_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live::loopback::LoopbackHub;
    use crate::live::types::TrackKind;
    use serde_json::json;

    fn camera(id: &str) -> MediaStream {
        MediaStream::new(
            id,
            vec![MediaTrack::video(format!("{id}-video")), MediaTrack::audio(format!("{id}-audio"))],
        )
    }

    /// Deliver every pending network event to the manager
    async fn pump(manager: &mut LiveClassManager, rx: &mut mpsc::Receiver<NetworkEvent>) {
        while let Ok(event) = rx.try_recv() {
            manager.handle_event(event).await;
        }
    }

    #[tokio::test]
    async fn test_connect_before_start_is_noop() -> Result<()> {
        let hub = LoopbackHub::new();
        let (teacher_net, _teacher_rx) = hub.join("teacher-1")?;
        let (_student_net, mut student_rx) = hub.join("student-7")?;

        let (mut manager, _events) = LiveClassManager::new(teacher_net);
        let connected = manager.connect(&PeerId::from("student-7")).await?;

        assert!(!connected);
        assert_eq!(manager.connection_count(), 0);
        assert!(student_rx.try_recv().is_err(), "no call should be placed");
        Ok(())
    }

    #[tokio::test]
    async fn test_connect_registers_call_and_surfaces_stream_once() -> Result<()> {
        let hub = LoopbackHub::new();
        let (teacher_net, mut teacher_rx) = hub.join("teacher-1")?;
        let (student_net, mut student_rx) = hub.join("student-7")?;

        let (mut teacher, mut teacher_events) = LiveClassManager::new(teacher_net);
        let (mut student, _student_events) = LiveClassManager::new(student_net);

        teacher.start(camera("teacher-cam"));
        student.start(camera("student-cam"));

        assert!(teacher.connect(&PeerId::from("student-7")).await?);
        assert!(teacher.is_connected(&PeerId::from("student-7")));

        pump(&mut student, &mut student_rx).await;
        pump(&mut teacher, &mut teacher_rx).await;

        // A duplicate stream notification must not surface twice
        hub.emit_stream("student-7", "teacher-1", camera("student-cam"))?;
        pump(&mut teacher, &mut teacher_rx).await;

        let mut streams = Vec::new();
        while let Ok(event) = teacher_events.try_recv() {
            if let SessionEvent::RemoteStream { peer_id, stream } = event {
                streams.push((peer_id, stream));
            }
        }
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].0, PeerId::from("student-7"));
        assert_eq!(streams[0].1.id, "student-cam");
        Ok(())
    }

    #[tokio::test]
    async fn test_disconnect_emits_peer_left_once() -> Result<()> {
        let hub = LoopbackHub::new();
        let (teacher_net, _teacher_rx) = hub.join("teacher-1")?;
        let (_student_net, _student_rx) = hub.join("student-7")?;

        let (mut manager, mut events) = LiveClassManager::new(teacher_net);
        manager.start(camera("cam"));
        manager.connect(&PeerId::from("student-7")).await?;

        assert!(manager.disconnect(&PeerId::from("student-7")).await);
        assert!(!manager.is_connected(&PeerId::from("student-7")));
        assert!(!manager.disconnect(&PeerId::from("student-7")).await);

        let left: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
            .filter(|e| matches!(e, SessionEvent::PeerLeft { .. }))
            .collect();
        assert_eq!(left.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_disconnect_unknown_peer_is_noop() -> Result<()> {
        let hub = LoopbackHub::new();
        let (net, _rx) = hub.join("teacher-1")?;
        let (mut manager, mut events) = LiveClassManager::new(net);

        assert!(!manager.disconnect(&PeerId::from("nobody")).await);
        assert!(events.try_recv().is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_broadcast_skips_connections_not_open() -> Result<()> {
        let hub = LoopbackHub::new();
        let (teacher_net, _teacher_rx) = hub.join("teacher-1")?;
        let (_student_net, mut student_rx) = hub.join("student-7")?;

        let (mut teacher, _events) = LiveClassManager::new(teacher_net);
        teacher.start(camera("cam"));
        teacher.connect(&PeerId::from("student-7")).await?;

        // Student never answered, so the link is not open
        let delivered = teacher.broadcast(&json!({"kind": "chat", "text": "hello"})).await;
        assert_eq!(delivered, 0);

        let data: Vec<_> = std::iter::from_fn(|| student_rx.try_recv().ok())
            .filter(|e| matches!(e, NetworkEvent::Data { .. }))
            .collect();
        assert!(data.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_broadcast_reaches_open_peers_verbatim() -> Result<()> {
        let hub = LoopbackHub::new();
        let (teacher_net, mut teacher_rx) = hub.join("teacher-1")?;
        let (student_net, mut student_rx) = hub.join("student-7")?;

        let (mut teacher, _teacher_events) = LiveClassManager::new(teacher_net);
        let (mut student, mut student_events) = LiveClassManager::new(student_net);
        teacher.start(camera("cam"));

        teacher.connect(&PeerId::from("student-7")).await?;
        pump(&mut student, &mut student_rx).await;
        pump(&mut teacher, &mut teacher_rx).await;

        let message = json!({"kind": "hand-raise", "nested": {"n": 1}});
        assert_eq!(teacher.broadcast(&message).await, 1);

        pump(&mut student, &mut student_rx).await;
        let received: Vec<_> = std::iter::from_fn(|| student_events.try_recv().ok())
            .filter_map(|e| match e {
                SessionEvent::Data { peer_id, data } => Some((peer_id, data)),
                _ => None,
            })
            .collect();
        assert_eq!(received, vec![(PeerId::from("teacher-1"), message)]);
        Ok(())
    }

    #[tokio::test]
    async fn test_inbound_call_answered_without_local_stream() -> Result<()> {
        let hub = LoopbackHub::new();
        let (teacher_net, _teacher_rx) = hub.join("teacher-1")?;
        let (student_net, mut student_rx) = hub.join("student-7")?;

        let (mut teacher, _) = LiveClassManager::new(teacher_net);
        let (mut student, _) = LiveClassManager::new(student_net);
        teacher.start(camera("cam"));
        teacher.connect(&PeerId::from("student-7")).await?;

        pump(&mut student, &mut student_rx).await;
        assert_eq!(student.peers(), vec![PeerId::from("teacher-1")]);
        let statuses = student.statuses();
        assert_eq!(statuses[0].direction, PeerDirection::Inbound);
        assert!(statuses[0].open);
        Ok(())
    }

    #[tokio::test]
    async fn test_remote_close_removes_peer() -> Result<()> {
        let hub = LoopbackHub::new();
        let (teacher_net, mut teacher_rx) = hub.join("teacher-1")?;
        let (student_net, mut student_rx) = hub.join("student-7")?;

        let (mut teacher, mut teacher_events) = LiveClassManager::new(teacher_net);
        let (mut student, _) = LiveClassManager::new(student_net);
        teacher.start(camera("cam"));
        teacher.connect(&PeerId::from("student-7")).await?;
        pump(&mut student, &mut student_rx).await;

        student.disconnect(&PeerId::from("teacher-1")).await;
        pump(&mut teacher, &mut teacher_rx).await;

        assert_eq!(teacher.connection_count(), 0);
        let left: Vec<_> = std::iter::from_fn(|| teacher_events.try_recv().ok())
            .filter(|e| matches!(e, SessionEvent::PeerLeft { .. }))
            .collect();
        assert_eq!(left.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_late_events_from_replaced_link_are_ignored() -> Result<()> {
        let hub = LoopbackHub::new();
        let (student_net, mut student_rx) = hub.join("student-7")?;
        let (mut student, mut student_events) = LiveClassManager::new(student_net);
        let teacher_id = PeerId::from("teacher-1");

        let (first_net, _first_rx) = hub.join("teacher-1")?;
        let (mut first, _) = LiveClassManager::new(first_net);
        first.start(camera("cam"));
        first.connect(&PeerId::from("student-7")).await?;
        pump(&mut student, &mut student_rx).await;
        let old_link = student.statuses()[0].link;

        // Same teacher id calls again from a fresh process
        first.destroy().await?;
        let (second_net, _second_rx) = hub.join("teacher-1")?;
        let (mut second, _) = LiveClassManager::new(second_net);
        second.start(camera("cam"));
        second.connect(&PeerId::from("student-7")).await?;
        pump(&mut student, &mut student_rx).await;
        let new_link = student.statuses()[0].link;
        assert_ne!(old_link, new_link);
        while student_events.try_recv().is_ok() {}

        // The old connection's close and data arrive late
        student
            .handle_event(NetworkEvent::Data {
                peer_id: teacher_id.clone(),
                link: old_link,
                data: json!("stale"),
            })
            .await;
        student
            .handle_event(NetworkEvent::Closed {
                peer_id: teacher_id.clone(),
                link: old_link,
            })
            .await;
        assert!(student.is_connected(&teacher_id));
        assert!(student_events.try_recv().is_err());

        student
            .handle_event(NetworkEvent::Closed {
                peer_id: teacher_id.clone(),
                link: new_link,
            })
            .await;
        assert!(!student.is_connected(&teacher_id));
        assert_eq!(
            student_events.try_recv()?,
            SessionEvent::PeerLeft { peer_id: teacher_id }
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_replace_track_targets_named_peer() -> Result<()> {
        let hub = LoopbackHub::new();
        let (teacher_net, _rx) = hub.join("teacher-1")?;
        let (_a, _a_rx) = hub.join("student-a")?;
        let (_b, _b_rx) = hub.join("student-b")?;

        let (mut teacher, _) = LiveClassManager::new(teacher_net);
        teacher.start(camera("cam"));
        teacher.connect(&PeerId::from("student-a")).await?;
        teacher.connect(&PeerId::from("student-b")).await?;

        let screen = MediaTrack::video("screen-share");
        assert!(teacher.replace_track(&PeerId::from("student-b"), &screen).await?);
        assert!(!teacher.replace_track(&PeerId::from("nobody"), &screen).await?);

        assert_eq!(
            hub.outbound_track("teacher-1", "student-b", TrackKind::Video)?,
            Some("screen-share".to_string())
        );
        assert_eq!(
            hub.outbound_track("teacher-1", "student-a", TrackKind::Video)?,
            Some("cam-video".to_string())
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_destroy_drops_later_events() -> Result<()> {
        let hub = LoopbackHub::new();
        let (teacher_net, mut teacher_rx) = hub.join("teacher-1")?;
        let (student_net, _student_rx) = hub.join("student-7")?;

        let (mut teacher, mut events) = LiveClassManager::new(teacher_net);
        let (mut student, _) = LiveClassManager::new(student_net);
        teacher.start(camera("cam"));
        student.start(camera("student-cam"));

        teacher.destroy().await?;
        assert!(teacher.is_destroyed());
        assert!(teacher.connect(&PeerId::from("student-7")).await.is_err());

        // Calls toward a destroyed identity never reach it
        assert!(student.connect(&PeerId::from("teacher-1")).await.is_err());

        teacher
            .handle_event(NetworkEvent::Data {
                peer_id: PeerId::from("student-7"),
                link: 0,
                data: json!("late"),
            })
            .await;
        pump(&mut teacher, &mut teacher_rx).await;
        assert!(events.try_recv().is_err());
        Ok(())
    }
}
