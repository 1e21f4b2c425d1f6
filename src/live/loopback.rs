//! In-process network joining several local identities
//!
//! Every participant of a `LoopbackHub` can call every other one; calls,
//! answers, data and hang-ups are delivered as `NetworkEvent`s the same way
//! a real peer-connection backend would deliver them, minus the media.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::transport::{LinkId, NetworkEvent, PeerLink, PeerNetwork};
use super::types::{MediaStream, MediaTrack, PeerId, TrackKind};

const EVENT_BUFFER: usize = 100;

struct CallState {
    caller: PeerId,
    callee: PeerId,
    answered: bool,
    closed: bool,
    /// (sending side, kind) -> track id
    outbound: HashMap<(PeerId, TrackKind), String>,
}

#[derive(Default)]
struct HubState {
    members: HashMap<PeerId, mpsc::Sender<NetworkEvent>>,
    calls: HashMap<u64, CallState>,
    /// (callee, caller) -> call waiting for an answer
    pending: HashMap<(PeerId, PeerId), u64>,
    next_call: u64,
}

impl HubState {
    fn deliver(&self, to: &PeerId, event: NetworkEvent) {
        let Some(tx) = self.members.get(to) else {
            debug!("Loopback: {} is gone, dropping {:?}", to, event);
            return;
        };
        if let Err(e) = tx.try_send(event) {
            warn!("Loopback: event for {} dropped: {}", to, e);
        }
    }

    /// Most recent live call between two participants, in either direction
    fn latest_call(&self, a: &PeerId, b: &PeerId) -> Option<u64> {
        self.calls
            .iter()
            .filter(|(_, c)| {
                !c.closed
                    && ((&c.caller == a && &c.callee == b) || (&c.caller == b && &c.callee == a))
            })
            .map(|(id, _)| *id)
            .max()
    }
}

/// Shared switchboard for loopback participants
#[derive(Clone, Default)]
pub struct LoopbackHub {
    state: Arc<Mutex<HubState>>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a participant and return its network plus event receiver
    pub fn join(
        &self,
        peer_id: impl Into<PeerId>,
    ) -> Result<(Arc<dyn PeerNetwork>, mpsc::Receiver<NetworkEvent>)> {
        let peer_id = peer_id.into();
        let mut state = lock(&self.state)?;
        if state.members.contains_key(&peer_id) {
            anyhow::bail!("peer id {} is already taken", peer_id);
        }
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        state.members.insert(peer_id.clone(), tx);
        debug!("Loopback: {} joined", peer_id);

        let network = LoopbackNetwork {
            state: Arc::clone(&self.state),
            local: peer_id,
        };
        Ok((Arc::new(network), rx))
    }

    pub fn members(&self) -> Result<Vec<PeerId>> {
        let state = lock(&self.state)?;
        let mut members: Vec<PeerId> = state.members.keys().cloned().collect();
        members.sort();
        Ok(members)
    }

    /// Raise a `Stream` event at `to` as if `from` had sent media again
    /// on their current call
    pub fn emit_stream(
        &self,
        from: impl Into<PeerId>,
        to: impl Into<PeerId>,
        stream: MediaStream,
    ) -> Result<()> {
        let (from, to) = (from.into(), to.into());
        let state = lock(&self.state)?;
        let link = state
            .latest_call(&from, &to)
            .ok_or_else(|| anyhow!("no call between {} and {}", from, to))?;
        state.deliver(
            &to,
            NetworkEvent::Stream {
                peer_id: from,
                link,
                stream,
            },
        );
        Ok(())
    }

    /// Track id `from` currently sends to `to` for `kind`
    pub fn outbound_track(
        &self,
        from: impl Into<PeerId>,
        to: impl Into<PeerId>,
        kind: TrackKind,
    ) -> Result<Option<String>> {
        let (from, to) = (from.into(), to.into());
        let state = lock(&self.state)?;
        Ok(state
            .latest_call(&from, &to)
            .and_then(|id| state.calls.get(&id))
            .and_then(|call| call.outbound.get(&(from, kind)).cloned()))
    }
}

fn lock(state: &Mutex<HubState>) -> Result<MutexGuard<'_, HubState>> {
    state.lock().map_err(|_| anyhow!("loopback hub lock poisoned"))
}

fn outbound_tracks(side: &PeerId, stream: Option<&MediaStream>) -> Vec<((PeerId, TrackKind), String)> {
    stream
        .map(|s| {
            s.tracks
                .iter()
                .map(|t| ((side.clone(), t.kind), t.id.clone()))
                .collect()
        })
        .unwrap_or_default()
}

struct LoopbackNetwork {
    state: Arc<Mutex<HubState>>,
    local: PeerId,
}

#[async_trait]
impl PeerNetwork for LoopbackNetwork {
    fn local_id(&self) -> &PeerId {
        &self.local
    }

    async fn call(&self, peer_id: &PeerId, stream: &MediaStream) -> Result<Arc<dyn PeerLink>> {
        let call_id = {
            let mut state = lock(&self.state)?;
            if !state.members.contains_key(&self.local) {
                anyhow::bail!("{} has left the hub", self.local);
            }
            if !state.members.contains_key(peer_id) {
                anyhow::bail!("peer {} is unavailable", peer_id);
            }

            let call_id = state.next_call;
            state.next_call += 1;
            state.calls.insert(
                call_id,
                CallState {
                    caller: self.local.clone(),
                    callee: peer_id.clone(),
                    answered: false,
                    closed: false,
                    outbound: outbound_tracks(&self.local, Some(stream)).into_iter().collect(),
                },
            );
            state
                .pending
                .insert((peer_id.clone(), self.local.clone()), call_id);
            state.deliver(
                peer_id,
                NetworkEvent::IncomingCall {
                    peer_id: self.local.clone(),
                },
            );
            call_id
        };

        Ok(Arc::new(LoopbackLink {
            state: Arc::clone(&self.state),
            call_id,
            local: self.local.clone(),
            remote: peer_id.clone(),
        }))
    }

    async fn answer(
        &self,
        peer_id: &PeerId,
        stream: Option<&MediaStream>,
    ) -> Result<Arc<dyn PeerLink>> {
        let call_id = {
            let mut state = lock(&self.state)?;
            let call_id = state
                .pending
                .remove(&(self.local.clone(), peer_id.clone()))
                .ok_or_else(|| anyhow!("no pending call from {}", peer_id))?;

            let caller_stream = {
                let call = state
                    .calls
                    .get_mut(&call_id)
                    .ok_or_else(|| anyhow!("call {} vanished", call_id))?;
                if call.closed {
                    anyhow::bail!("call from {} was already closed", peer_id);
                }
                call.answered = true;
                call.outbound
                    .extend(outbound_tracks(&self.local, stream));
                let tracks: Vec<MediaTrack> = call
                    .outbound
                    .iter()
                    .filter(|((side, _), _)| side == peer_id)
                    .map(|((_, kind), id)| MediaTrack::new(id.clone(), *kind))
                    .collect();
                (!tracks.is_empty()).then(|| MediaStream::new(format!("{}-stream", peer_id), tracks))
            };

            // Earlier calls between the pair are superseded without a close event
            let local = self.local.clone();
            for (id, call) in state.calls.iter_mut() {
                let same_pair = (call.caller == local && call.callee == *peer_id)
                    || (call.caller == *peer_id && call.callee == local);
                if *id != call_id && same_pair {
                    call.closed = true;
                }
            }

            state.deliver(peer_id, NetworkEvent::Open { peer_id: self.local.clone() });
            if let Some(stream) = stream {
                state.deliver(
                    peer_id,
                    NetworkEvent::Stream {
                        peer_id: self.local.clone(),
                        link: call_id,
                        stream: stream.clone(),
                    },
                );
            }
            state.deliver(&self.local, NetworkEvent::Open { peer_id: peer_id.clone() });
            if let Some(stream) = caller_stream {
                state.deliver(
                    &self.local,
                    NetworkEvent::Stream {
                        peer_id: peer_id.clone(),
                        link: call_id,
                        stream,
                    },
                );
            }
            call_id
        };

        Ok(Arc::new(LoopbackLink {
            state: Arc::clone(&self.state),
            call_id,
            local: self.local.clone(),
            remote: peer_id.clone(),
        }))
    }

    async fn destroy(&self) -> Result<()> {
        let mut state = lock(&self.state)?;
        state.members.remove(&self.local);
        let local = self.local.clone();
        state
            .pending
            .retain(|(callee, caller), _| callee != &local && caller != &local);
        debug!("Loopback: {} left", self.local);
        Ok(())
    }
}

struct LoopbackLink {
    state: Arc<Mutex<HubState>>,
    call_id: u64,
    local: PeerId,
    remote: PeerId,
}

#[async_trait]
impl PeerLink for LoopbackLink {
    fn peer_id(&self) -> &PeerId {
        &self.remote
    }

    fn id(&self) -> LinkId {
        self.call_id
    }

    fn is_open(&self) -> bool {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.calls.get(&self.call_id).map(|c| c.answered && !c.closed))
            .unwrap_or(false)
    }

    async fn send(&self, data: &serde_json::Value) -> Result<()> {
        let state = lock(&self.state)?;
        let call = state
            .calls
            .get(&self.call_id)
            .ok_or_else(|| anyhow!("call {} vanished", self.call_id))?;
        if !call.answered || call.closed {
            anyhow::bail!("connection to {} is not open", self.remote);
        }
        state.deliver(
            &self.remote,
            NetworkEvent::Data {
                peer_id: self.local.clone(),
                link: self.call_id,
                data: data.clone(),
            },
        );
        Ok(())
    }

    async fn replace_track(&self, track: &MediaTrack) -> Result<bool> {
        let mut state = lock(&self.state)?;
        let call = state
            .calls
            .get_mut(&self.call_id)
            .ok_or_else(|| anyhow!("call {} vanished", self.call_id))?;
        match call.outbound.get_mut(&(self.local.clone(), track.kind)) {
            Some(current) => {
                *current = track.id.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn close(&self) -> Result<()> {
        let mut state = lock(&self.state)?;
        let Some(call) = state.calls.get_mut(&self.call_id) else {
            return Ok(());
        };
        if call.closed {
            return Ok(());
        }
        call.closed = true;
        let key = (call.callee.clone(), call.caller.clone());
        state.pending.remove(&key);
        state.deliver(
            &self.remote,
            NetworkEvent::Closed {
                peer_id: self.local.clone(),
                link: self.call_id,
            },
        );
        Ok(())
    }
}
