//! WebRTC Transport
//!
//! Implementiert `PeerTransport` über WebRTC Peer Connections und den
//! WebSocket-Signaling-Client. Audio läuft als G.711 µ-law (PCMU, 8kHz,
//! 20ms Pakete); ICE Candidates werden per Trickle ICE ausgetauscht.

use super::messages::ERROR_ID_TAKEN;
use super::signaling::{SignalingClient, SignalingError, SignalingEvent};
use super::transport::{
    CallEvent, CallHandler, MediaCall, PeerEvent, PeerHandler, PeerRegistration, PeerTransport,
    TransportError,
};
use crate::audio::codec::{decode_ulaw_frame, encode_ulaw_frame, resample_linear};
use crate::events::{EventEmitter, Subscription};
use crate::media::{AudioFrame, MediaStream};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_PCMU};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// PCMU Taktrate
const PCMU_RATE: u32 = 8000;

/// Samples pro RTP-Paket (20ms @ 8kHz)
const SAMPLES_PER_PACKET: usize = 160;

const PACKET_DURATION: Duration = Duration::from_millis(20);

// ============================================================================
// ICE SERVER CONFIGURATION
// ============================================================================

/// Standard STUN Server
pub fn default_ice_servers() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun1.l.google.com:19302".to_string(),
    ]
}

fn rtc_ice_servers(urls: &[String]) -> Vec<RTCIceServer> {
    if urls.is_empty() {
        return Vec::new();
    }
    vec![RTCIceServer {
        urls: urls.to_vec(),
        ..Default::default()
    }]
}

// ============================================================================
// TRANSPORT
// ============================================================================

/// WebRTC-Transport mit WebSocket-Signaling
#[derive(Debug, Clone)]
pub struct WebRtcTransport {
    signaling_url: String,
    ice_servers: Vec<String>,
}

impl WebRtcTransport {
    pub fn new(signaling_url: impl Into<String>) -> Self {
        Self {
            signaling_url: signaling_url.into(),
            ice_servers: default_ice_servers(),
        }
    }

    /// Ersetzt die ICE Server (STUN/TURN URLs)
    pub fn with_ice_servers(mut self, ice_servers: Vec<String>) -> Self {
        self.ice_servers = ice_servers;
        self
    }
}

impl PeerTransport for WebRtcTransport {
    fn register(&self, local_id: &str) -> Arc<dyn PeerRegistration> {
        Arc::new(WebRtcPeer::new(
            local_id.to_string(),
            SignalingClient::new(self.signaling_url.clone()),
            rtc_ice_servers(&self.ice_servers),
        ))
    }
}

// ============================================================================
// PEER REGISTRATION
// ============================================================================

struct PeerShared {
    id: String,
    client: Arc<SignalingClient>,
    ice_servers: Vec<RTCIceServer>,
    events: EventEmitter<PeerEvent>,
    calls: Mutex<HashMap<String, Arc<WebRtcCall>>>,
}

impl PeerShared {
    fn track_call(&self, call: &Arc<WebRtcCall>) {
        let mut calls = self.calls.lock();
        calls.retain(|_, c| !c.is_closed());
        calls.insert(call.call_id.clone(), Arc::clone(call));
    }

    fn find_call(&self, call_id: &str) -> Option<Arc<WebRtcCall>> {
        self.calls.lock().get(call_id).cloned()
    }

    fn forget_call(&self, call_id: &str) -> Option<Arc<WebRtcCall>> {
        self.calls.lock().remove(call_id)
    }

    /// Verteilt ein Signaling-Event auf Registrierung und Anrufe
    async fn dispatch(&self, event: SignalingEvent) {
        match event {
            SignalingEvent::Registered { .. } => {}

            SignalingEvent::IncomingOffer {
                from_peer_id,
                call_id,
                sdp,
            } => {
                tracing::info!("Incoming call from {} ({})", from_peer_id, call_id);
                let call = WebRtcCall::new(
                    from_peer_id,
                    call_id,
                    Some(sdp),
                    Arc::clone(&self.client),
                    self.ice_servers.clone(),
                );
                self.track_call(&call);
                self.events.emit(&PeerEvent::Call(call as Arc<dyn MediaCall>));
            }

            SignalingEvent::AnswerReceived { call_id, sdp, .. } => {
                if let Some(call) = self.find_call(&call_id) {
                    if let Err(e) = call.apply_answer(sdp).await {
                        tracing::warn!("Failed to apply answer for {}: {}", call_id, e);
                        call.events.emit(&CallEvent::Error(e));
                    }
                }
            }

            SignalingEvent::IceCandidateReceived {
                call_id, candidate, ..
            } => {
                if let Some(call) = self.find_call(&call_id) {
                    call.add_remote_candidate(candidate).await;
                }
            }

            SignalingEvent::CallEnded { by_peer_id, call_id } => {
                if let Some(call) = self.forget_call(&call_id) {
                    tracing::info!("Call {} ended by {}", call_id, by_peer_id);
                    call.shutdown(false);
                }
            }

            SignalingEvent::PeerUnavailable { peer_id, call_id } => {
                if let Some(call) = self.forget_call(&call_id) {
                    call.events
                        .emit(&CallEvent::Error(TransportError::PeerUnavailable(peer_id)));
                    call.shutdown(false);
                }
            }

            SignalingEvent::Error { code, message } => {
                self.events
                    .emit(&PeerEvent::Error(TransportError::Server { code, message }));
            }

            SignalingEvent::Disconnected => {
                self.events.emit(&PeerEvent::Disconnected);
            }
        }
    }
}

/// Registrierung einer Peer-ID beim Signaling-Server
pub struct WebRtcPeer {
    shared: Arc<PeerShared>,
    pump: Mutex<Option<JoinHandle<()>>>,
    destroyed: AtomicBool,
}

impl WebRtcPeer {
    fn new(id: String, client: SignalingClient, ice_servers: Vec<RTCIceServer>) -> Self {
        Self {
            shared: Arc::new(PeerShared {
                id,
                client: Arc::new(client),
                ice_servers,
                events: EventEmitter::new(),
                calls: Mutex::new(HashMap::new()),
            }),
            pump: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        }
    }
}

/// Übersetzt einen Registrierungsfehler in die Transport-Taxonomie
fn registration_error(local_id: &str, err: SignalingError) -> TransportError {
    match err {
        SignalingError::ServerError {
            code: ERROR_ID_TAKEN,
            ..
        } => TransportError::IdTaken(local_id.to_string()),
        SignalingError::ServerError { code, message } => TransportError::Server { code, message },
        SignalingError::ConnectionFailed(reason) => TransportError::Unreachable(reason),
        other => TransportError::Unreachable(other.to_string()),
    }
}

#[async_trait]
impl PeerRegistration for WebRtcPeer {
    fn id(&self) -> &str {
        &self.shared.id
    }

    fn on(&self, handler: PeerHandler) -> Subscription {
        self.shared.events.on(handler)
    }

    fn connect(&self) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }

        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move {
            // Vor der Registrierung abonnieren, sonst gehen frühe Offers verloren
            let mut events = shared.client.subscribe();

            match shared.client.connect_and_register(shared.id.clone()).await {
                Ok(id) => {
                    shared.client.start_heartbeat();
                    shared.events.emit(&PeerEvent::Open { id });
                }
                Err(e) => {
                    tracing::error!("Registration of '{}' failed: {}", shared.id, e);
                    shared.client.disconnect();
                    shared
                        .events
                        .emit(&PeerEvent::Error(registration_error(&shared.id, e)));
                    return;
                }
            }

            loop {
                match events.recv().await {
                    Ok(SignalingEvent::Disconnected) => {
                        shared.dispatch(SignalingEvent::Disconnected).await;
                        break;
                    }
                    Ok(event) => shared.dispatch(event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Signaling event pump lagged by {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        if let Some(previous) = self.pump.lock().replace(handle) {
            previous.abort();
        }
    }

    async fn call(
        &self,
        remote_id: &str,
        stream: MediaStream,
    ) -> Result<Arc<dyn MediaCall>, TransportError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if self.shared.client.peer_id().is_none() {
            return Err(TransportError::NotRegistered);
        }

        let call = WebRtcCall::new(
            remote_id.to_string(),
            uuid::Uuid::new_v4().to_string(),
            None,
            Arc::clone(&self.shared.client),
            self.shared.ice_servers.clone(),
        );
        self.shared.track_call(&call);

        if let Err(e) = call.start_outgoing(stream).await {
            self.shared.forget_call(&call.call_id);
            call.shutdown(false);
            return Err(e);
        }

        Ok(call as Arc<dyn MediaCall>)
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        let calls: Vec<Arc<WebRtcCall>> = self.shared.calls.lock().drain().map(|(_, c)| c).collect();
        for call in calls {
            call.shutdown(true);
        }
        self.shared.client.disconnect();
        tracing::info!("Peer '{}' destroyed", self.shared.id);
    }
}

impl Drop for WebRtcPeer {
    fn drop(&mut self) {
        self.destroy();
    }
}

// ============================================================================
// CALL
// ============================================================================

/// Ein WebRTC-Anruf (ausgehend oder eingehend)
pub struct WebRtcCall {
    me: Weak<WebRtcCall>,
    peer: String,
    call_id: String,
    /// Offer der Gegenseite (nur eingehende Anrufe)
    offer_sdp: Option<String>,
    client: Arc<SignalingClient>,
    ice_servers: Vec<RTCIceServer>,
    events: EventEmitter<CallEvent>,
    peer_connection: Mutex<Option<Arc<RTCPeerConnection>>>,
    pending_candidates: Mutex<Vec<RTCIceCandidateInit>>,
    remote_ready: AtomicBool,
    answered: AtomicBool,
    stream_emitted: AtomicBool,
    closed: AtomicBool,
    uplink: Mutex<Option<JoinHandle<()>>>,
    remote_stream: Mutex<Option<MediaStream>>,
}

impl WebRtcCall {
    fn new(
        peer: String,
        call_id: String,
        offer_sdp: Option<String>,
        client: Arc<SignalingClient>,
        ice_servers: Vec<RTCIceServer>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            peer,
            call_id,
            offer_sdp,
            client,
            ice_servers,
            events: EventEmitter::new(),
            peer_connection: Mutex::new(None),
            pending_candidates: Mutex::new(Vec::new()),
            remote_ready: AtomicBool::new(false),
            answered: AtomicBool::new(false),
            stream_emitted: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            uplink: Mutex::new(None),
            remote_stream: Mutex::new(None),
        })
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Baut die Verbindung auf und sendet das Offer
    async fn start_outgoing(&self, stream: MediaStream) -> Result<(), TransportError> {
        let pc = self.create_peer_connection().await?;
        self.attach_local_stream(&pc, stream).await?;

        let offer = pc.create_offer(None).await.map_err(negotiation_error)?;
        pc.set_local_description(offer.clone())
            .await
            .map_err(negotiation_error)?;

        self.client
            .send_offer(&self.peer, &self.call_id, offer.sdp)
            .map_err(|e| TransportError::Negotiation(e.to_string()))?;

        tracing::info!("Offer sent to {} ({})", self.peer, self.call_id);
        Ok(())
    }

    /// Verarbeitet das SDP Answer vom Angerufenen
    async fn apply_answer(&self, sdp: String) -> Result<(), TransportError> {
        let pc = self
            .peer_connection
            .lock()
            .clone()
            .ok_or(TransportError::Closed)?;

        let answer = RTCSessionDescription::answer(sdp).map_err(negotiation_error)?;
        match pc.set_remote_description(answer).await.map_err(negotiation_error) {
            Ok(()) => {}
            Err(TransportError::AlreadyStable) => {
                tracing::debug!("Answer for {} arrived on a stable connection", self.call_id);
            }
            Err(e) => return Err(e),
        }

        self.flush_candidates(&pc).await;
        Ok(())
    }

    /// Fügt einen ICE Candidate hinzu oder puffert ihn bis zur Remote Description
    async fn add_remote_candidate(&self, candidate_json: String) {
        let candidate: RTCIceCandidateInit = match serde_json::from_str(&candidate_json) {
            Ok(candidate) => candidate,
            Err(e) => {
                tracing::warn!("Invalid ICE candidate: {}", e);
                return;
            }
        };

        let pc = self.peer_connection.lock().clone();
        match pc {
            Some(pc) if self.remote_ready.load(Ordering::SeqCst) => {
                if let Err(e) = pc.add_ice_candidate(candidate).await {
                    tracing::warn!("Failed to add ICE candidate: {}", e);
                }
            }
            _ => self.pending_candidates.lock().push(candidate),
        }
    }

    async fn flush_candidates(&self, pc: &Arc<RTCPeerConnection>) {
        self.remote_ready.store(true, Ordering::SeqCst);
        let pending: Vec<RTCIceCandidateInit> = self.pending_candidates.lock().drain(..).collect();
        for candidate in pending {
            if let Err(e) = pc.add_ice_candidate(candidate).await {
                tracing::warn!("Failed to add buffered ICE candidate: {}", e);
            }
        }
    }

    /// Beendet den Anruf; `notify` sendet ein Hangup an die Gegenseite
    fn shutdown(&self, notify: bool) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(uplink) = self.uplink.lock().take() {
            uplink.abort();
        }
        if let Some(remote) = self.remote_stream.lock().take() {
            remote.stop_tracks();
        }
        if let Some(pc) = self.peer_connection.lock().take() {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    let _ = pc.close().await;
                });
            }
        }
        if notify {
            if let Err(e) = self.client.hangup(&self.peer, &self.call_id) {
                tracing::debug!("Hangup not delivered: {}", e);
            }
        }

        tracing::info!("Call {} with {} closed", self.call_id, self.peer);
        self.events.emit(&CallEvent::Close);
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    /// Erstellt eine neue Peer Connection
    async fn create_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, TransportError> {
        // Media Engine mit den Standard-Codecs (enthält PCMU)
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(negotiation_error)?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry =
            register_default_interceptors(registry, &mut media_engine).map_err(negotiation_error)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(negotiation_error)?,
        );

        self.setup_peer_connection_handlers(&pc);
        *self.peer_connection.lock() = Some(Arc::clone(&pc));

        Ok(pc)
    }

    /// Registriert Event Handler für die Peer Connection
    fn setup_peer_connection_handlers(&self, pc: &Arc<RTCPeerConnection>) {
        // Connection State Handler
        let me = self.me.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            tracing::info!("Peer connection state: {:?}", s);
            if let Some(call) = me.upgrade() {
                match s {
                    RTCPeerConnectionState::Failed => {
                        call.events.emit(&CallEvent::Error(TransportError::Negotiation(
                            "ICE connection failed".to_string(),
                        )));
                        call.shutdown(false);
                    }
                    RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Closed => {
                        call.shutdown(false);
                    }
                    _ => {}
                }
            }
            Box::pin(async {})
        }));

        // ICE Candidate Handler (Trickle ICE über Signaling)
        let client = Arc::clone(&self.client);
        let peer = self.peer.clone();
        let call_id = self.call_id.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            if let Some(c) = candidate {
                if let Ok(json) = c.to_json() {
                    if let Ok(candidate_str) = serde_json::to_string(&json) {
                        if let Err(e) = client.send_ice_candidate(&peer, &call_id, candidate_str) {
                            tracing::warn!("Failed to send ICE candidate: {}", e);
                        }
                    }
                }
            }
            Box::pin(async {})
        }));

        // Track Handler (eingehendes Audio)
        let me = self.me.clone();
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
            tracing::info!("Received track: {:?}", track.codec().capability.mime_type);
            if let Some(call) = me.upgrade() {
                call.attach_remote_track(track);
            }
            Box::pin(async {})
        }));
    }

    /// Fügt den lokalen Track hinzu und startet den Uplink
    async fn attach_local_stream(
        &self,
        pc: &Arc<RTCPeerConnection>,
        stream: MediaStream,
    ) -> Result<(), TransportError> {
        let audio_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_PCMU.to_string(),
                clock_rate: PCMU_RATE,
                channels: 1,
                ..Default::default()
            },
            "audio".to_string(),
            "voicelink".to_string(),
        ));

        pc.add_track(Arc::clone(&audio_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(negotiation_error)?;

        let uplink = tokio::spawn(run_uplink(
            audio_track,
            stream.subscribe(),
            stream.sample_rate(),
        ));
        if let Some(previous) = self.uplink.lock().replace(uplink) {
            previous.abort();
        }
        Ok(())
    }

    /// Dekodiert eingehende RTP-Pakete in einen entfernten MediaStream
    fn attach_remote_track(&self, track: Arc<TrackRemote>) {
        if self.is_closed() || self.stream_emitted.swap(true, Ordering::SeqCst) {
            return;
        }

        let remote = MediaStream::new(format!("remote:{}", self.peer), PCMU_RATE);
        *self.remote_stream.lock() = Some(remote.clone());

        let sink = remote.clone();
        tokio::spawn(async move {
            while let Ok((packet, _)) = track.read_rtp().await {
                if !sink.push(&decode_ulaw_frame(&packet.payload)) {
                    break;
                }
            }
            tracing::debug!("Remote track ended");
        });

        self.events.emit(&CallEvent::Stream(remote));
    }
}

#[async_trait]
impl MediaCall for WebRtcCall {
    fn peer(&self) -> &str {
        &self.peer
    }

    fn on(&self, handler: CallHandler) -> Subscription {
        self.events.on(handler)
    }

    async fn answer(&self, stream: MediaStream) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if self.answered.swap(true, Ordering::SeqCst) {
            return Err(TransportError::AlreadyStable);
        }
        let offer_sdp = self
            .offer_sdp
            .clone()
            .ok_or_else(|| TransportError::Negotiation("outgoing call cannot be answered".to_string()))?;

        let pc = self.create_peer_connection().await?;

        // Remote Description setzen (das Offer)
        let offer = RTCSessionDescription::offer(offer_sdp).map_err(negotiation_error)?;
        pc.set_remote_description(offer)
            .await
            .map_err(negotiation_error)?;

        self.attach_local_stream(&pc, stream).await?;

        let answer = pc.create_answer(None).await.map_err(negotiation_error)?;
        pc.set_local_description(answer.clone())
            .await
            .map_err(negotiation_error)?;

        self.client
            .send_answer(&self.peer, &self.call_id, answer.sdp)
            .map_err(|e| TransportError::Negotiation(e.to_string()))?;

        self.flush_candidates(&pc).await;
        tracing::info!("Answered call {} from {}", self.call_id, self.peer);
        Ok(())
    }

    fn close(&self) {
        self.shutdown(true);
    }
}

// ============================================================================
// HELPERS
// ============================================================================

/// Ordnet WebRTC-Fehler der Transport-Taxonomie zu
fn negotiation_error(err: webrtc::Error) -> TransportError {
    classify_negotiation(err.to_string())
}

fn classify_negotiation(text: String) -> TransportError {
    if text.to_lowercase().contains("stable") {
        TransportError::AlreadyStable
    } else {
        TransportError::Negotiation(text)
    }
}

/// Uplink: lokale Frames → 8kHz → µ-law → 20ms Samples
async fn run_uplink(
    track: Arc<TrackLocalStaticSample>,
    mut frames: broadcast::Receiver<AudioFrame>,
    source_rate: u32,
) {
    let mut pending: Vec<f32> = Vec::with_capacity(SAMPLES_PER_PACKET * 4);

    loop {
        match frames.recv().await {
            Ok(frame) => {
                pending.extend(resample_linear(&frame, source_rate, PCMU_RATE));
                while pending.len() >= SAMPLES_PER_PACKET {
                    let chunk: Vec<f32> = pending.drain(..SAMPLES_PER_PACKET).collect();
                    let sample = Sample {
                        data: Bytes::from(encode_ulaw_frame(&chunk)),
                        duration: PACKET_DURATION,
                        ..Default::default()
                    };
                    if let Err(e) = track.write_sample(&sample).await {
                        tracing::debug!("Failed to write audio sample: {}", e);
                    }
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("Uplink dropped {} frames", n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn test_call(offer: Option<&str>) -> Arc<WebRtcCall> {
        WebRtcCall::new(
            "bob".to_string(),
            "call-1".to_string(),
            offer.map(str::to_string),
            Arc::new(SignalingClient::new("http://localhost".to_string())),
            Vec::new(),
        )
    }

    #[test]
    fn test_registration_error_mapping() {
        let taken = registration_error(
            "alice",
            SignalingError::ServerError {
                code: ERROR_ID_TAKEN,
                message: "taken".to_string(),
            },
        );
        assert_eq!(taken, TransportError::IdTaken("alice".to_string()));

        let unreachable =
            registration_error("alice", SignalingError::ConnectionFailed("refused".to_string()));
        assert!(matches!(unreachable, TransportError::Unreachable(_)));
    }

    #[test]
    fn test_stable_state_is_race() {
        assert_eq!(
            classify_negotiation("InvalidModificationError: connection already stable".to_string()),
            TransportError::AlreadyStable
        );
        assert!(matches!(
            classify_negotiation("DTLS handshake failed".to_string()),
            TransportError::Negotiation(_)
        ));
    }

    #[test]
    fn test_ice_server_config() {
        assert!(rtc_ice_servers(&[]).is_empty());
        let servers = rtc_ice_servers(&default_ice_servers());
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].urls.len(), 2);
    }

    #[tokio::test]
    async fn test_close_emits_once() {
        let call = test_call(None);
        let closes = Arc::new(AtomicUsize::new(0));
        let closes_clone = Arc::clone(&closes);
        let _sub = call.on(Box::new(move |event| {
            if matches!(event, CallEvent::Close) {
                closes_clone.fetch_add(1, Ordering::SeqCst);
            }
        }));

        call.close();
        call.close();
        call.shutdown(false);

        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(call.is_closed());
    }

    #[tokio::test]
    async fn test_answer_twice_is_stable_race() {
        let call = test_call(None);
        call.answered.store(true, Ordering::SeqCst);
        let result = call.answer(MediaStream::new("mic", 48000)).await;
        assert_eq!(result, Err(TransportError::AlreadyStable));
    }

    #[tokio::test]
    async fn test_candidates_buffered_before_remote_description() {
        let call = test_call(Some("v=0"));
        call.add_remote_candidate(r#"{"candidate":"candidate:1 1 udp 1 127.0.0.1 9 typ host"}"#.to_string())
            .await;
        call.add_remote_candidate("not json".to_string()).await;
        assert_eq!(call.pending_candidates.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_call_requires_registration() {
        let transport = WebRtcTransport::new("http://127.0.0.1:9");
        let peer = transport.register("alice");
        let result = peer.call("bob", MediaStream::new("mic", 48000)).await;
        assert!(matches!(result, Err(TransportError::NotRegistered)));
        peer.destroy();
        peer.destroy();
    }

    #[tokio::test]
    async fn test_connect_to_unreachable_server_reports_error() {
        let transport = WebRtcTransport::new("http://127.0.0.1:9");
        let peer = transport.register("alice");
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let _sub = peer.on(Box::new(move |event| {
            let _ = tx.send(format!("{:?}", event));
        }));

        peer.connect();
        let event = tokio::time::timeout(Duration::from_secs(15), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(event.contains("Unreachable"), "got {event}");
        peer.destroy();
    }
}
