//! Task wrapper that drives a `LiveClassManager` from channels

use anyhow::{anyhow, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::manager::LiveClassManager;
use super::transport::NetworkEvent;
use super::types::{MediaStream, MediaTrack, PeerId, PeerStatus};

enum Command {
    Start(MediaStream),
    Connect(PeerId, oneshot::Sender<Result<bool>>),
    Disconnect(PeerId, oneshot::Sender<bool>),
    Broadcast(serde_json::Value, oneshot::Sender<usize>),
    ReplaceTrack(PeerId, MediaTrack, oneshot::Sender<Result<bool>>),
    ReplaceTrackAll(MediaTrack, oneshot::Sender<usize>),
    Peers(oneshot::Sender<Vec<PeerStatus>>),
    Destroy(oneshot::Sender<Result<()>>),
}

/// Cloneable handle to a running live session
#[derive(Clone)]
pub struct LiveSessionHandle {
    local_id: PeerId,
    commands: mpsc::Sender<Command>,
}

pub struct LiveSession;

impl LiveSession {
    /// Move `manager` into its own task.
    ///
    /// The task applies commands and network events one at a time and
    /// exits after `destroy`, after which nothing more is delivered.
    pub fn spawn(
        mut manager: LiveClassManager,
        mut network_events: mpsc::Receiver<NetworkEvent>,
    ) -> (LiveSessionHandle, JoinHandle<()>) {
        let (commands, mut command_rx) = mpsc::channel::<Command>(32);
        let local_id = manager.local_id().clone();

        let task = tokio::spawn(async move {
            info!("Live session {} running", manager.local_id().short());
            loop {
                // Commands first so a queued start() precedes an answer
                tokio::select! {
                    biased;
                    command = command_rx.recv() => {
                        let Some(command) = command else {
                            debug!("All session handles dropped");
                            break;
                        };
                        if Self::apply(&mut manager, command).await {
                            break;
                        }
                    }
                    Some(event) = network_events.recv() => {
                        manager.handle_event(event).await;
                    }
                }
            }
            if !manager.is_destroyed() {
                let _ = manager.destroy().await;
            }
            info!("Live session {} stopped", manager.local_id().short());
        });

        (LiveSessionHandle { local_id, commands }, task)
    }

    /// Returns true when the loop should stop
    async fn apply(manager: &mut LiveClassManager, command: Command) -> bool {
        match command {
            Command::Start(stream) => manager.start(stream),
            Command::Connect(peer_id, reply) => {
                let _ = reply.send(manager.connect(&peer_id).await);
            }
            Command::Disconnect(peer_id, reply) => {
                let _ = reply.send(manager.disconnect(&peer_id).await);
            }
            Command::Broadcast(data, reply) => {
                let _ = reply.send(manager.broadcast(&data).await);
            }
            Command::ReplaceTrack(peer_id, track, reply) => {
                let _ = reply.send(manager.replace_track(&peer_id, &track).await);
            }
            Command::ReplaceTrackAll(track, reply) => {
                let _ = reply.send(manager.replace_track_all(&track).await);
            }
            Command::Peers(reply) => {
                let _ = reply.send(manager.statuses());
            }
            Command::Destroy(reply) => {
                let _ = reply.send(manager.destroy().await);
                return true;
            }
        }
        false
    }
}

impl LiveSessionHandle {
    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    pub async fn start(&self, stream: MediaStream) -> Result<()> {
        self.commands
            .send(Command::Start(stream))
            .await
            .map_err(|_| anyhow!("live session has stopped"))
    }

    pub async fn connect(&self, peer_id: impl Into<PeerId>) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Connect(peer_id.into(), tx)).await?;
        rx.await.map_err(|_| anyhow!("live session has stopped"))?
    }

    pub async fn disconnect(&self, peer_id: impl Into<PeerId>) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Disconnect(peer_id.into(), tx)).await?;
        rx.await.map_err(|_| anyhow!("live session has stopped"))
    }

    pub async fn broadcast(&self, data: serde_json::Value) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Broadcast(data, tx)).await?;
        rx.await.map_err(|_| anyhow!("live session has stopped"))
    }

    pub async fn replace_track(&self, peer_id: impl Into<PeerId>, track: MediaTrack) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::ReplaceTrack(peer_id.into(), track, tx)).await?;
        rx.await.map_err(|_| anyhow!("live session has stopped"))?
    }

    /// Swap the outbound track on every connection; returns how many matched
    pub async fn replace_track_all(&self, track: MediaTrack) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::ReplaceTrackAll(track, tx)).await?;
        rx.await.map_err(|_| anyhow!("live session has stopped"))
    }

    pub async fn peers(&self) -> Result<Vec<PeerStatus>> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Peers(tx)).await?;
        rx.await.map_err(|_| anyhow!("live session has stopped"))
    }

    pub async fn destroy(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Destroy(tx)).await?;
        rx.await.map_err(|_| anyhow!("live session has stopped"))?
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| anyhow!("live session has stopped"))
    }
}
