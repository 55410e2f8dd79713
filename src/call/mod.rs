//! Call Module - P2P Sprachanrufe
//!
//! Dieses Modul verwaltet:
//! - Die Transport-Schnittstellen (Registrierung, Anruf)
//! - WebRTC als konkreten Transport mit WebSocket-Signaling
//! - Den Call Session Manager

mod manager;
pub mod messages;
mod rtc;
mod signaling;
mod transport;

pub use manager::{CallCallbacks, CallSessionManager, PeerCallbacks};
pub use rtc::{default_ice_servers, WebRtcCall, WebRtcPeer, WebRtcTransport};
pub use signaling::{SignalingClient, SignalingError, SignalingEvent, HEARTBEAT_INTERVAL};
pub use transport::{
    CallEvent, CallHandler, MediaCall, PeerEvent, PeerHandler, PeerRegistration, PeerTransport,
    TransportError,
};
