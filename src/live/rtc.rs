//! WebRTC backend: one RTCPeerConnection per remote participant
//!
//! Each call carries the local stream's tracks plus a data channel for JSON
//! messages. Offers, answers and ICE candidates travel through the
//! signaling broker served at `/live/:peer_id`.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::transport::{LinkId, NetworkEvent, PeerLink, PeerNetwork};
use super::types::{LiveConfig, MediaStream, MediaTrack, PeerId, SignalMessage, TrackKind};

type LocalTracks = Arc<std::sync::Mutex<HashMap<String, Arc<TrackLocalStaticSample>>>>;
type RemoteTracks = Arc<std::sync::Mutex<Vec<Arc<TrackRemote>>>>;

fn codec_type(kind: TrackKind) -> RTPCodecType {
    match kind {
        TrackKind::Audio => RTPCodecType::Audio,
        TrackKind::Video => RTPCodecType::Video,
    }
}

fn track_kind(codec: RTPCodecType) -> Option<TrackKind> {
    match codec {
        RTPCodecType::Audio => Some(TrackKind::Audio),
        RTPCodecType::Video => Some(TrackKind::Video),
        _ => None,
    }
}

/// Get or create the sample track backing `track`
fn local_track(
    tracks: &LocalTracks,
    track: &MediaTrack,
    stream_id: &str,
) -> Result<Arc<TrackLocalStaticSample>> {
    let mut tracks = tracks
        .lock()
        .map_err(|_| anyhow!("local track table poisoned"))?;
    if let Some(existing) = tracks.get(&track.id) {
        return Ok(Arc::clone(existing));
    }

    let capability = match track.kind {
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90000,
            ..Default::default()
        },
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            ..Default::default()
        },
    };
    let sample = Arc::new(TrackLocalStaticSample::new(
        capability,
        track.id.clone(),
        stream_id.to_string(),
    ));
    tracks.insert(track.id.clone(), Arc::clone(&sample));
    Ok(sample)
}

/// Media the remote side sends according to its session description.
///
/// Reads the audio and video sections that are not `recvonly`/`inactive`,
/// taking stream and track ids from `a=msid`. Returns `None` when the
/// remote sends no media.
fn remote_stream(desc: &RTCSessionDescription, peer_id: &PeerId) -> Result<Option<MediaStream>> {
    let parsed = desc.unmarshal()?;
    let mut stream_id = None;
    let mut tracks = Vec::new();

    for media in &parsed.media_descriptions {
        let kind = match media.media_name.media.as_str() {
            "audio" => TrackKind::Audio,
            "video" => TrackKind::Video,
            _ => continue,
        };
        let rejected = media.media_name.port.value == 0;
        let not_sending =
            media.attribute("recvonly").is_some() || media.attribute("inactive").is_some();
        if rejected || not_sending {
            continue;
        }

        let msid = media
            .attribute("msid")
            .flatten()
            .and_then(|v| v.split_once(' '));
        let track_id = match msid {
            Some((stream, track)) => {
                if stream != "-" {
                    stream_id.get_or_insert_with(|| stream.to_string());
                }
                track.to_string()
            }
            None => media
                .attribute("mid")
                .flatten()
                .map(|mid| format!("{}-{}", peer_id, mid))
                .unwrap_or_else(|| format!("{}-{}{}", peer_id, kind, tracks.len())),
        };
        tracks.push(MediaTrack::new(track_id, kind));
    }

    if tracks.is_empty() {
        return Ok(None);
    }
    let id = stream_id.unwrap_or_else(|| format!("{}-stream", peer_id));
    Ok(Some(MediaStream::new(id, tracks)))
}

/// Data-channel text as JSON, or as a JSON string when it doesn't parse
fn decode_data(text: String) -> serde_json::Value {
    serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text))
}

/// State shared between the network handle and its signaling task
struct RtcShared {
    local: PeerId,
    config: LiveConfig,
    events_tx: mpsc::Sender<NetworkEvent>,
    signaling_tx: mpsc::Sender<SignalMessage>,
    links: RwLock<HashMap<PeerId, Arc<RtcLink>>>,
    /// Offers waiting for `answer`
    pending_offers: Mutex<HashMap<PeerId, serde_json::Value>>,
    /// Candidates that arrived before their link existed
    early_candidates: Mutex<HashMap<PeerId, Vec<serde_json::Value>>>,
    local_tracks: LocalTracks,
    next_link: AtomicU64,
}

impl RtcShared {
    fn new(
        local: PeerId,
        config: LiveConfig,
        events_tx: mpsc::Sender<NetworkEvent>,
        signaling_tx: mpsc::Sender<SignalMessage>,
    ) -> Self {
        Self {
            local,
            config,
            events_tx,
            signaling_tx,
            links: RwLock::new(HashMap::new()),
            pending_offers: Mutex::new(HashMap::new()),
            early_candidates: Mutex::new(HashMap::new()),
            local_tracks: Arc::new(std::sync::Mutex::new(HashMap::new())),
            next_link: AtomicU64::new(0),
        }
    }

    async fn new_peer_connection(&self) -> Result<Arc<RTCPeerConnection>> {
        let mut m = MediaEngine::default();
        m.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut m)?;

        let api = APIBuilder::new()
            .with_media_engine(m)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers: Vec<RTCIceServer> = self
            .config
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();

        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        Ok(Arc::new(api.new_peer_connection(config).await?))
    }

    async fn handle_signal(&self, msg: SignalMessage) -> Result<()> {
        match msg {
            SignalMessage::Open { id } => debug!("Signaling broker confirmed {}", id),
            SignalMessage::IdTaken { id } => warn!("Signaling broker says {} is taken", id),
            SignalMessage::Offer { sdp, src, .. } => {
                let peer_id = PeerId::from(src);
                info!("[{}] Offer from {}", self.local.short(), peer_id);
                self.pending_offers.lock().await.insert(peer_id.clone(), sdp);
                let _ = self
                    .events_tx
                    .send(NetworkEvent::IncomingCall { peer_id })
                    .await;
            }
            SignalMessage::Answer { sdp, src, .. } => {
                let peer_id = PeerId::from(src);
                let link = self.links.read().await.get(&peer_id).cloned();
                match link {
                    Some(link) => link.apply_answer(sdp).await?,
                    None => debug!("[{}] Answer from unknown {}", self.local.short(), peer_id),
                }
            }
            SignalMessage::Candidate { candidate, src, .. } => {
                let peer_id = PeerId::from(src);
                let link = self.links.read().await.get(&peer_id).cloned();
                match link {
                    Some(link) => link.add_candidate(candidate).await?,
                    None => self
                        .early_candidates
                        .lock()
                        .await
                        .entry(peer_id)
                        .or_default()
                        .push(candidate),
                }
            }
            SignalMessage::Leave { src, .. } => {
                self.drop_peer(PeerId::from(src)).await;
            }
            SignalMessage::Expire { dst } => {
                debug!("[{}] {} is not reachable", self.local.short(), dst);
                self.drop_peer(PeerId::from(dst)).await;
            }
        }
        Ok(())
    }

    /// Forget a peer whose remote end went away
    async fn drop_peer(&self, peer_id: PeerId) {
        self.pending_offers.lock().await.remove(&peer_id);
        self.early_candidates.lock().await.remove(&peer_id);
        let link = self.links.write().await.remove(&peer_id);
        if let Some(link) = link {
            link.retire().await;
            let _ = self
                .events_tx
                .send(NetworkEvent::Closed {
                    peer_id,
                    link: link.id,
                })
                .await;
        }
    }

    /// Remove `link` from the table unless a newer link took its place
    async fn forget(&self, link: &RtcLink) {
        let mut links = self.links.write().await;
        if links.get(&link.peer_id).is_some_and(|current| current.id == link.id) {
            links.remove(&link.peer_id);
        }
    }

    fn new_link(self: &Arc<Self>, peer_id: &PeerId, pc: Arc<RTCPeerConnection>) -> Arc<RtcLink> {
        Arc::new(RtcLink {
            id: self.next_link.fetch_add(1, Ordering::SeqCst),
            peer_id: peer_id.clone(),
            pc,
            shared: Arc::downgrade(self),
            data_channel: Arc::new(std::sync::Mutex::new(None)),
            signaling_tx: self.signaling_tx.clone(),
            events_tx: self.events_tx.clone(),
            remote_set: AtomicBool::new(false),
            pending_candidates: Mutex::new(Vec::new()),
            stream_raised: AtomicBool::new(false),
            closed: Arc::new(AtomicBool::new(false)),
            local_tracks: Arc::clone(&self.local_tracks),
            remote_tracks: Arc::new(std::sync::Mutex::new(Vec::new())),
        })
    }

    async fn add_stream(&self, pc: &RTCPeerConnection, stream: &MediaStream) -> Result<()> {
        for track in &stream.tracks {
            let sample = local_track(&self.local_tracks, track, &stream.id)?;
            pc.add_track(sample as Arc<dyn TrackLocal + Send + Sync>)
                .await?;
        }
        Ok(())
    }

    async fn flush_early_candidates(&self, link: &RtcLink) {
        let early = self
            .early_candidates
            .lock()
            .await
            .remove(&link.peer_id)
            .unwrap_or_default();
        for candidate in early {
            if let Err(e) = link.add_candidate(candidate).await {
                debug!("Failed to add early candidate: {}", e);
            }
        }
    }
}

/// Live-session network backed by webrtc-rs
pub struct RtcNetwork {
    shared: Arc<RtcShared>,
    shutdown: watch::Sender<bool>,
}

impl RtcNetwork {
    /// Register `local_id` with the signaling broker and start relaying
    pub async fn connect(
        local_id: PeerId,
        config: LiveConfig,
    ) -> Result<(Arc<Self>, mpsc::Receiver<NetworkEvent>)> {
        let url = format!(
            "{}/{}",
            config.signaling_url.trim_end_matches('/'),
            local_id
        );
        info!("Connecting to signaling broker: {}", url);

        let (ws_stream, _) = connect_async(url.as_str()).await?;
        let (mut write, mut read) = ws_stream.split();

        // The broker answers with open or id-taken before anything else
        let greeting = tokio::time::timeout(Duration::from_secs(10), read.next())
            .await
            .map_err(|_| anyhow!("signaling broker did not greet us"))?;
        match greeting {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<SignalMessage>(&text)? {
                SignalMessage::Open { .. } => {}
                SignalMessage::IdTaken { id } => anyhow::bail!("peer id {} is already taken", id),
                other => anyhow::bail!("unexpected greeting: {}", other.msg_type()),
            },
            Some(Ok(other)) => anyhow::bail!("unexpected greeting frame: {:?}", other),
            Some(Err(e)) => return Err(e.into()),
            None => anyhow::bail!("signaling broker closed the connection"),
        }

        let (events_tx, events_rx) = mpsc::channel(config.event_buffer);
        let (signaling_tx, mut signaling_rx) = mpsc::channel::<SignalMessage>(100);
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let shared = Arc::new(RtcShared::new(local_id, config, events_tx, signaling_tx));

        let task_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            let _ = write.send(Message::Close(None)).await;
                            break;
                        }
                    }
                    Some(msg) = signaling_rx.recv() => {
                        match serde_json::to_string(&msg) {
                            Ok(json) => {
                                if let Err(e) = write.send(Message::Text(json)).await {
                                    error!("Failed to send {}: {}", msg.msg_type(), e);
                                    break;
                                }
                                trace!("Sent {} to {:?}", msg.msg_type(), msg.dst());
                            }
                            Err(e) => error!("Failed to encode {}: {}", msg.msg_type(), e),
                        }
                    }
                    incoming = read.next() => {
                        match incoming {
                            Some(Ok(Message::Text(text))) => {
                                match serde_json::from_str::<SignalMessage>(&text) {
                                    Ok(msg) => {
                                        if let Err(e) = task_shared.handle_signal(msg).await {
                                            debug!("Error handling signal: {}", e);
                                        }
                                    }
                                    Err(e) => debug!("Ignoring malformed signal: {}", e),
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                warn!("Signaling connection closed");
                                break;
                            }
                            Some(Err(e)) => {
                                error!("Signaling websocket error: {}", e);
                                break;
                            }
                            _ => {}
                        }
                    }
                }
            }
        });

        Ok((Arc::new(Self { shared, shutdown }), events_rx))
    }

    /// Sample writer for one of our outbound tracks, once it has been sent
    pub fn sample_track(&self, track_id: &str) -> Option<Arc<TrackLocalStaticSample>> {
        self.shared
            .local_tracks
            .lock()
            .ok()
            .and_then(|tracks| tracks.get(track_id).cloned())
    }

    /// Tracks received so far on the current connection to `peer_id`
    pub async fn remote_tracks(&self, peer_id: &PeerId) -> Vec<Arc<TrackRemote>> {
        let link = self.shared.links.read().await.get(peer_id).cloned();
        link.map(|link| link.received_tracks()).unwrap_or_default()
    }
}

#[async_trait]
impl PeerNetwork for RtcNetwork {
    fn local_id(&self) -> &PeerId {
        &self.shared.local
    }

    async fn call(&self, peer_id: &PeerId, stream: &MediaStream) -> Result<Arc<dyn PeerLink>> {
        let shared = &self.shared;
        let pc = shared.new_peer_connection().await?;
        let link = shared.new_link(peer_id, Arc::clone(&pc));
        link.setup_handlers();

        shared.add_stream(&pc, stream).await?;

        let dc = pc.create_data_channel(&shared.config.channel_label, None).await?;
        link.attach_data_channel(dc);

        let offer = pc.create_offer(None).await?;
        pc.set_local_description(offer.clone()).await?;

        shared
            .links
            .write()
            .await
            .insert(peer_id.clone(), Arc::clone(&link));

        let sdp = serde_json::json!({ "type": "offer", "sdp": offer.sdp });
        shared
            .signaling_tx
            .send(SignalMessage::offer(sdp, peer_id.as_str()))
            .await
            .map_err(|_| anyhow!("signaling task has stopped"))?;
        info!("[{}] Sent offer to {}", shared.local.short(), peer_id);

        Ok(link)
    }

    async fn answer(
        &self,
        peer_id: &PeerId,
        stream: Option<&MediaStream>,
    ) -> Result<Arc<dyn PeerLink>> {
        let shared = &self.shared;
        let offer = shared
            .pending_offers
            .lock()
            .await
            .remove(peer_id)
            .ok_or_else(|| anyhow!("no pending offer from {}", peer_id))?;
        let sdp = offer
            .get("sdp")
            .and_then(|s| s.as_str())
            .ok_or_else(|| anyhow!("Missing SDP in offer"))?;

        let pc = shared.new_peer_connection().await?;
        let link = shared.new_link(peer_id, Arc::clone(&pc));
        link.setup_handlers();

        let incoming_link = Arc::downgrade(&link);
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let link = incoming_link.upgrade();
            Box::pin(async move {
                let Some(link) = link else {
                    return;
                };
                info!("[Peer {}] received data channel: {}", link.peer_id.short(), dc.label());
                link.attach_data_channel(dc);
            })
        }));

        if let Some(stream) = stream {
            shared.add_stream(&pc, stream).await?;
        }

        let offer = RTCSessionDescription::offer(sdp.to_string())?;
        let remote = remote_stream(&offer, peer_id)?;
        pc.set_remote_description(offer).await?;
        link.remote_description_set().await;

        let superseded = shared
            .links
            .write()
            .await
            .insert(peer_id.clone(), Arc::clone(&link));
        if let Some(old) = superseded {
            // The caller replaced its end; close ours without a leave
            old.retire().await;
        }
        shared.flush_early_candidates(&link).await;
        link.raise_stream(remote).await;

        let answer = pc.create_answer(None).await?;
        pc.set_local_description(answer.clone()).await?;

        let sdp = serde_json::json!({ "type": "answer", "sdp": answer.sdp });
        shared
            .signaling_tx
            .send(SignalMessage::answer(sdp, peer_id.as_str()))
            .await
            .map_err(|_| anyhow!("signaling task has stopped"))?;
        info!("[{}] Sent answer to {}", shared.local.short(), peer_id);

        Ok(link)
    }

    async fn destroy(&self) -> Result<()> {
        // Links are torn down with the connections, without per-peer leave messages
        let links: Vec<Arc<RtcLink>> = self.shared.links.write().await.drain().map(|(_, l)| l).collect();
        for link in links {
            link.retire().await;
        }
        let _ = self.shutdown.send(true);
        info!("[{}] Left signaling broker", self.shared.local.short());
        Ok(())
    }
}

/// One webrtc-rs peer connection plus its data channel
pub struct RtcLink {
    id: LinkId,
    peer_id: PeerId,
    pc: Arc<RTCPeerConnection>,
    shared: Weak<RtcShared>,
    data_channel: Arc<std::sync::Mutex<Option<Arc<RTCDataChannel>>>>,
    signaling_tx: mpsc::Sender<SignalMessage>,
    events_tx: mpsc::Sender<NetworkEvent>,
    remote_set: AtomicBool,
    /// Candidates received before the remote description was applied
    pending_candidates: Mutex<Vec<RTCIceCandidateInit>>,
    stream_raised: AtomicBool,
    /// Set once we tear the link down ourselves
    closed: Arc<AtomicBool>,
    local_tracks: LocalTracks,
    remote_tracks: RemoteTracks,
}

impl RtcLink {
    pub fn state(&self) -> RTCPeerConnectionState {
        self.pc.connection_state()
    }

    fn received_tracks(&self) -> Vec<Arc<TrackRemote>> {
        self.remote_tracks
            .lock()
            .map(|tracks| tracks.clone())
            .unwrap_or_default()
    }

    /// Close the connection without telling the remote side
    async fn retire(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Ok(mut tracks) = self.remote_tracks.lock() {
            tracks.clear();
        }
        if let Err(e) = self.pc.close().await {
            debug!("Error closing connection to {}: {}", self.peer_id, e);
        }
    }

    /// Report the negotiated remote media, once per link
    async fn raise_stream(&self, stream: Option<MediaStream>) {
        let Some(stream) = stream else {
            return;
        };
        if self.stream_raised.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(
            "[Peer {}] remote stream {} with {} track(s)",
            self.peer_id.short(),
            stream.id,
            stream.tracks.len()
        );
        let _ = self
            .events_tx
            .send(NetworkEvent::Stream {
                peer_id: self.peer_id.clone(),
                link: self.id,
                stream,
            })
            .await;
    }

    /// Setup event handlers for the peer connection
    fn setup_handlers(&self) {
        let signaling_tx = self.signaling_tx.clone();
        let recipient = self.peer_id.to_string();

        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let signaling_tx = signaling_tx.clone();
                let recipient = recipient.clone();

                Box::pin(async move {
                    if let Some(c) = candidate {
                        if let Ok(init) = c.to_json() {
                            let msg = SignalMessage::candidate(
                                serde_json::to_value(&init).unwrap_or_default(),
                                &recipient,
                            );
                            let _ = signaling_tx.send(msg).await;
                        }
                    }
                })
            }));

        let peer_log = self.peer_id.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let peer_id = peer_log.clone();
                Box::pin(async move {
                    info!("Peer {} connection state: {:?}", peer_id.short(), state);
                })
            }));

        // Media is announced from the session description; this only keeps
        // the receiving end of each track once RTP starts flowing
        let peer_id = self.peer_id.clone();
        let remote_tracks = Arc::clone(&self.remote_tracks);
        self.pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let peer_id = peer_id.clone();
            let kind = track_kind(track.kind());
            if kind.is_some() {
                if let Ok(mut tracks) = remote_tracks.lock() {
                    tracks.push(Arc::clone(&track));
                }
            }
            let track_id = track.id();
            Box::pin(async move {
                if let Some(kind) = kind {
                    trace!("[Peer {}] receiving {} track {}", peer_id.short(), kind, track_id);
                }
            })
        }));
    }

    /// Setup handlers for a data channel (shared between outbound and inbound)
    fn attach_data_channel(&self, dc: Arc<RTCDataChannel>) {
        let label = dc.label().to_string();
        let events_tx = self.events_tx.clone();

        let open_peer = self.peer_id.clone();
        let open_tx = events_tx.clone();
        dc.on_open(Box::new(move || {
            let peer_id = open_peer.clone();
            let events_tx = open_tx.clone();
            let label = label.clone();
            Box::pin(async move {
                info!("[Peer {}] Data channel '{}' open", peer_id.short(), label);
                let _ = events_tx.send(NetworkEvent::Open { peer_id }).await;
            })
        }));

        let link = self.id;
        let msg_peer = self.peer_id.clone();
        let msg_tx = events_tx.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let peer_id = msg_peer.clone();
            let events_tx = msg_tx.clone();
            Box::pin(async move {
                if !msg.is_string {
                    trace!("[Peer {}] Ignoring {} binary bytes", peer_id.short(), msg.data.len());
                    return;
                }
                let Ok(text) = String::from_utf8(msg.data.to_vec()) else {
                    return;
                };
                trace!("[Peer {}] Received: {}", peer_id.short(), text);
                let data = decode_data(text);
                let _ = events_tx
                    .send(NetworkEvent::Data {
                        peer_id,
                        link,
                        data,
                    })
                    .await;
            })
        }));

        let close_peer = self.peer_id.clone();
        let closed = Arc::clone(&self.closed);
        dc.on_close(Box::new(move || {
            let peer_id = close_peer.clone();
            let events_tx = events_tx.clone();
            let local_close = closed.load(Ordering::SeqCst);
            Box::pin(async move {
                debug!("[Peer {}] Data channel closed", peer_id.short());
                if !local_close {
                    let _ = events_tx.send(NetworkEvent::Closed { peer_id, link }).await;
                }
            })
        }));

        if let Ok(mut slot) = self.data_channel.lock() {
            *slot = Some(dc);
        }
    }

    fn channel(&self) -> Option<Arc<RTCDataChannel>> {
        self.data_channel.lock().ok().and_then(|dc| dc.clone())
    }

    /// Handle incoming answer
    async fn apply_answer(&self, answer: serde_json::Value) -> Result<()> {
        let sdp = answer
            .get("sdp")
            .and_then(|s| s.as_str())
            .ok_or_else(|| anyhow!("Missing SDP in answer"))?;

        let answer = RTCSessionDescription::answer(sdp.to_string())?;
        let remote = remote_stream(&answer, &self.peer_id)?;
        self.pc.set_remote_description(answer).await?;
        self.remote_description_set().await;
        self.raise_stream(remote).await;
        Ok(())
    }

    async fn remote_description_set(&self) {
        self.remote_set.store(true, Ordering::SeqCst);
        let pending: Vec<RTCIceCandidateInit> = self.pending_candidates.lock().await.drain(..).collect();
        for init in pending {
            if let Err(e) = self.pc.add_ice_candidate(init).await {
                debug!("Failed to add buffered candidate: {}", e);
            }
        }
    }

    /// Handle incoming ICE candidate
    async fn add_candidate(&self, candidate: serde_json::Value) -> Result<()> {
        let candidate_str = candidate
            .get("candidate")
            .and_then(|c| c.as_str())
            .unwrap_or("");
        if candidate_str.is_empty() {
            return Ok(());
        }

        let init = RTCIceCandidateInit {
            candidate: candidate_str.to_string(),
            sdp_mid: candidate
                .get("sdpMid")
                .and_then(|m| m.as_str())
                .map(|s| s.to_string()),
            sdp_mline_index: candidate
                .get("sdpMLineIndex")
                .and_then(|i| i.as_u64())
                .map(|i| i as u16),
            username_fragment: candidate
                .get("usernameFragment")
                .and_then(|u| u.as_str())
                .map(|s| s.to_string()),
        };

        if self.remote_set.load(Ordering::SeqCst) {
            self.pc.add_ice_candidate(init).await?;
        } else {
            self.pending_candidates.lock().await.push(init);
        }
        Ok(())
    }
}

#[async_trait]
impl PeerLink for RtcLink {
    fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    fn id(&self) -> LinkId {
        self.id
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
            && self
                .channel()
                .map(|dc| dc.ready_state() == RTCDataChannelState::Open)
                .unwrap_or(false)
    }

    async fn send(&self, data: &serde_json::Value) -> Result<()> {
        let dc = self.channel().ok_or_else(|| anyhow!("No data channel"))?;
        let json = serde_json::to_string(data)?;
        dc.send_text(json).await?;
        Ok(())
    }

    async fn replace_track(&self, track: &MediaTrack) -> Result<bool> {
        let wanted = codec_type(track.kind);
        for sender in self.pc.get_senders().await {
            let Some(current) = sender.track().await else {
                continue;
            };
            if current.kind() != wanted {
                continue;
            }
            let stream_id = current.stream_id().to_string();
            let replacement = local_track(&self.local_tracks, track, &stream_id)?;
            sender
                .replace_track(Some(replacement as Arc<dyn TrackLocal + Send + Sync>))
                .await?;
            return Ok(true);
        }
        Ok(false)
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self
            .signaling_tx
            .send(SignalMessage::leave(self.peer_id.as_str()))
            .await;
        if let Some(shared) = self.shared.upgrade() {
            shared.forget(self).await;
        }
        if let Ok(mut tracks) = self.remote_tracks.lock() {
            tracks.clear();
        }
        if let Some(dc) = self.channel() {
            dc.close().await?;
        }
        self.pc.close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const OFFER_SDP: &str = "v=0\r\n\
        o=- 4215775240449105457 2 IN IP4 127.0.0.1\r\n\
        s=-\r\n\
        t=0 0\r\n\
        m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
        c=IN IP4 0.0.0.0\r\n\
        a=mid:0\r\n\
        a=sendrecv\r\n\
        a=msid:student-7-cam student-7-mic\r\n\
        a=rtpmap:111 opus/48000/2\r\n\
        m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
        c=IN IP4 0.0.0.0\r\n\
        a=mid:1\r\n\
        a=sendonly\r\n\
        a=msid:student-7-cam student-7-video\r\n\
        a=rtpmap:96 VP8/90000\r\n\
        m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n\
        c=IN IP4 0.0.0.0\r\n\
        a=mid:2\r\n";

    fn camera(owner: &str) -> MediaStream {
        MediaStream::new(
            format!("{owner}-cam"),
            vec![
                MediaTrack::audio(format!("{owner}-mic")),
                MediaTrack::video(format!("{owner}-video")),
            ],
        )
    }

    /// Network with no broker behind it; signals are relayed by the test
    fn offline(id: &str) -> (RtcNetwork, mpsc::Receiver<NetworkEvent>, mpsc::Receiver<SignalMessage>) {
        let (events_tx, events_rx) = mpsc::channel(100);
        let (signaling_tx, signaling_rx) = mpsc::channel(100);
        let (shutdown, _) = watch::channel(false);
        let config = LiveConfig {
            stun_servers: vec![],
            ..Default::default()
        };
        let shared = Arc::new(RtcShared::new(PeerId::from(id), config, events_tx, signaling_tx));
        (RtcNetwork { shared, shutdown }, events_rx, signaling_rx)
    }

    /// Next signal of type `msg_type`, stamped as coming from `src`
    async fn next_signal(
        rx: &mut mpsc::Receiver<SignalMessage>,
        msg_type: &str,
        src: &str,
    ) -> Result<SignalMessage> {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await?
                .ok_or_else(|| anyhow!("signaling channel closed"))?;
            if msg.msg_type() == msg_type {
                return Ok(msg.with_src(src));
            }
        }
    }

    async fn next_stream(rx: &mut mpsc::Receiver<NetworkEvent>) -> Result<(LinkId, MediaStream)> {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await?
                .ok_or_else(|| anyhow!("event channel closed"))?;
            if let NetworkEvent::Stream { link, stream, .. } = event {
                return Ok((link, stream));
            }
        }
    }

    #[test]
    fn test_codec_kind_mapping() {
        assert_eq!(codec_type(TrackKind::Audio), RTPCodecType::Audio);
        assert_eq!(codec_type(TrackKind::Video), RTPCodecType::Video);
        assert_eq!(track_kind(RTPCodecType::Video), Some(TrackKind::Video));
        assert_eq!(track_kind(RTPCodecType::Unspecified), None);
    }

    #[test]
    fn test_local_track_is_cached_by_id() -> Result<()> {
        let tracks: LocalTracks = Arc::new(std::sync::Mutex::new(HashMap::new()));
        let video = MediaTrack::video("cam-video");

        let first = local_track(&tracks, &video, "cam")?;
        let second = local_track(&tracks, &video, "cam")?;
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.kind(), RTPCodecType::Video);
        assert_eq!(first.id(), "cam-video");
        assert_eq!(first.stream_id(), "cam");

        let audio = local_track(&tracks, &MediaTrack::audio("mic"), "cam")?;
        assert_eq!(audio.kind(), RTPCodecType::Audio);
        Ok(())
    }

    #[test]
    fn test_remote_stream_lists_every_sending_track() -> Result<()> {
        let peer = PeerId::from("student-7");
        let offer = RTCSessionDescription::offer(OFFER_SDP.to_string())?;
        let stream = remote_stream(&offer, &peer)?.ok_or_else(|| anyhow!("no stream"))?;
        assert_eq!(stream, camera("student-7"));

        let receive_only = OFFER_SDP.replace("a=sendrecv", "a=recvonly").replace("a=sendonly", "a=inactive");
        let offer = RTCSessionDescription::offer(receive_only)?;
        assert_eq!(remote_stream(&offer, &peer)?, None);
        Ok(())
    }

    #[test]
    fn test_non_json_data_is_forwarded_as_string() {
        assert_eq!(decode_data(r#"{"slide": 2}"#.to_string()), json!({"slide": 2}));
        assert_eq!(decode_data("raise hand".to_string()), json!("raise hand"));
        assert_eq!(decode_data("42".to_string()), json!(42));
    }

    #[tokio::test]
    async fn test_negotiation_reports_streams_and_flushes_early_candidates() -> Result<()> {
        let (teacher, mut teacher_events, mut teacher_signals) = offline("teacher-1");
        let (student, mut student_events, mut student_signals) = offline("student-7");
        let student_id = PeerId::from("student-7");
        let teacher_id = PeerId::from("teacher-1");

        let call = teacher.call(&student_id, &camera("teacher-1")).await?;
        let offer = next_signal(&mut teacher_signals, "offer", "teacher-1").await?;

        // A candidate overtakes the offer
        let candidate = SignalMessage::Candidate {
            candidate: json!({
                "candidate": "candidate:1 1 udp 2130706431 192.0.2.10 50000 typ host",
                "sdpMid": "0",
                "sdpMLineIndex": 0,
            }),
            src: "teacher-1".to_string(),
            dst: "student-7".to_string(),
        };
        student.shared.handle_signal(candidate).await?;
        assert_eq!(
            student.shared.early_candidates.lock().await.get(&teacher_id).map(Vec::len),
            Some(1)
        );

        student.shared.handle_signal(offer).await?;
        assert_eq!(
            student_events.recv().await,
            Some(NetworkEvent::IncomingCall { peer_id: teacher_id.clone() })
        );
        let answer_link = student.answer(&teacher_id, Some(&camera("student-7"))).await?;
        assert!(student.shared.early_candidates.lock().await.is_empty());

        // Both sides learn the full remote stream without any media flowing
        let (link, stream) = next_stream(&mut student_events).await?;
        assert_eq!(link, answer_link.id());
        assert_eq!(stream, camera("teacher-1"));

        let answer = next_signal(&mut student_signals, "answer", "student-7").await?;
        teacher.shared.handle_signal(answer).await?;
        let (link, stream) = next_stream(&mut teacher_events).await?;
        assert_eq!(link, call.id());
        assert_eq!(stream.tracks.len(), 2);
        assert_eq!(stream, camera("student-7"));

        teacher.destroy().await?;
        student.destroy().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_close_forgets_only_its_own_link() -> Result<()> {
        let (first, _first_events, mut first_signals) = offline("teacher-1");
        let (student, mut student_events, _student_signals) = offline("student-7");
        let student_id = PeerId::from("student-7");
        let teacher_id = PeerId::from("teacher-1");

        first.call(&student_id, &camera("teacher-1")).await?;
        let offer = next_signal(&mut first_signals, "offer", "teacher-1").await?;
        student.shared.handle_signal(offer).await?;
        let old = student.answer(&teacher_id, None).await?;

        // The teacher calls again from a new connection
        let (second, _second_events, mut second_signals) = offline("teacher-1");
        let second_call = second.call(&student_id, &camera("teacher-1")).await?;
        let offer = next_signal(&mut second_signals, "offer", "teacher-1").await?;
        student.shared.handle_signal(offer).await?;
        let new = student.answer(&teacher_id, None).await?;
        assert_ne!(old.id(), new.id());

        old.close().await?;
        let current = student.shared.links.read().await.get(&teacher_id).map(|l| l.id);
        assert_eq!(current, Some(new.id()));

        // Hanging up removes the caller's link and tells the student
        second_call.close().await?;
        assert!(second.shared.links.read().await.is_empty());
        let leave = next_signal(&mut second_signals, "leave", "teacher-1").await?;

        while student_events.try_recv().is_ok() {}
        student.shared.handle_signal(leave).await?;
        assert_eq!(
            student_events.recv().await,
            Some(NetworkEvent::Closed { peer_id: teacher_id.clone(), link: new.id() })
        );
        assert!(student.shared.links.read().await.is_empty());
        assert!(student.remote_tracks(&teacher_id).await.is_empty());

        // Closing the already retired link again leaves the table alone
        new.close().await?;
        assert!(student.shared.links.read().await.is_empty());

        first.destroy().await?;
        second.destroy().await?;
        student.destroy().await?;
        Ok(())
    }
}
