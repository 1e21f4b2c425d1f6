//! Live classes: peer-to-peer audio/video plus a JSON data channel
//!
//! A `LiveClassManager` tracks one connection per remote participant:
//! - Outbound calls carry the local stream set by `start`
//! - Inbound calls are always answered
//! - Remote media is reported once per connection
//! - Data messages are forwarded verbatim
//!
//! The peer-connection library sits behind `PeerNetwork`; `RtcNetwork`
//! uses webrtc-rs with the `/live/:peer_id` broker, `LoopbackHub` keeps
//! everything in process.

mod loopback;
mod manager;
mod rtc;
mod session;
mod transport;
mod types;

pub use loopback::LoopbackHub;
pub use manager::LiveClassManager;
pub use rtc::{RtcLink, RtcNetwork};
pub use session::{LiveSession, LiveSessionHandle};
pub use transport::{LinkId, NetworkEvent, PeerLink, PeerNetwork};
pub use types::{
    generate_peer_id, LiveConfig, MediaStream, MediaTrack, PeerDirection, PeerId, PeerStatus,
    SessionEvent, SignalMessage, TrackKind,
};
