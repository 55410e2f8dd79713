//! In-Memory Fakes für die Integrationstests
//!
//! Zählen Mikrofon-Freigaben und Kontext-Schließungen, damit die Tests
//! vollständigen Abbau prüfen können.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use voicelink::agent::{AgentError, AgentTransport, LiveConfig, LiveEvent, LiveSession, MediaBlob};
use voicelink::audio::{AudioContext, AudioError, AudioHost, ContextKind, MixerContext};
use voicelink::call::{
    CallEvent, CallHandler, MediaCall, PeerEvent, PeerHandler, PeerRegistration, PeerTransport,
    TransportError,
};
use voicelink::media::{MediaDevices, MediaError, MediaStream};
use voicelink::{EventEmitter, Subscription};

// ============================================================================
// MEDIA DEVICES
// ============================================================================

#[derive(Default)]
pub struct FakeDevices {
    pub opens: AtomicUsize,
    pub releases: Arc<AtomicUsize>,
    pub deny: AtomicBool,
    /// Verzögert `get_user_media` (für Abbruch-Tests)
    pub delay: Mutex<Option<Duration>>,
    last: Mutex<Option<MediaStream>>,
}

impl FakeDevices {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    /// Zuletzt ausgegebener Mikrofon-Stream
    pub fn last_stream(&self) -> Option<MediaStream> {
        self.last.lock().clone()
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn get_user_media(&self) -> Result<MediaStream, MediaError> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.deny.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied);
        }

        self.opens.fetch_add(1, Ordering::SeqCst);
        let releases = Arc::clone(&self.releases);
        let stream = MediaStream::with_release("fake-mic", 16000, move || {
            releases.fetch_add(1, Ordering::SeqCst);
        });
        *self.last.lock() = Some(stream.clone());
        Ok(stream)
    }
}

// ============================================================================
// AUDIO HOST
// ============================================================================

#[derive(Default)]
pub struct FakeHost {
    pub closed: Arc<AtomicUsize>,
    contexts: Mutex<Vec<(ContextKind, Arc<MixerContext>)>>,
}

impl FakeHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn opened(&self) -> usize {
        self.contexts.lock().len()
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn context(&self, kind: ContextKind) -> Option<Arc<MixerContext>> {
        self.contexts
            .lock()
            .iter()
            .rev()
            .find(|(k, _)| *k == kind)
            .map(|(_, ctx)| Arc::clone(ctx))
    }

    pub fn rates(&self) -> Vec<(ContextKind, u32)> {
        self.contexts
            .lock()
            .iter()
            .map(|(kind, ctx)| (*kind, ctx.sample_rate()))
            .collect()
    }
}

impl AudioHost for FakeHost {
    fn create_context(
        &self,
        sample_rate: u32,
        kind: ContextKind,
    ) -> Result<Arc<dyn AudioContext>, AudioError> {
        let ctx = Arc::new(MixerContext::new(sample_rate));
        let closed = Arc::clone(&self.closed);
        ctx.set_close_hook(move || {
            closed.fetch_add(1, Ordering::SeqCst);
        });
        self.contexts.lock().push((kind, Arc::clone(&ctx)));
        Ok(ctx as Arc<dyn AudioContext>)
    }
}

// ============================================================================
// PEER NETWORK
// ============================================================================

/// Signaling-Ersatz: registrierte IDs, vergebene IDs, erreichbare Peers
#[derive(Default)]
pub struct FakeNetwork {
    pub taken: Mutex<HashSet<String>>,
    pub unavailable: Mutex<HashSet<String>>,
    /// `connect` meldet `Open` nicht von selbst
    pub manual_open: AtomicBool,
    registrations: Mutex<HashMap<String, Arc<FakeRegistration>>>,
}

impl FakeNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn registration(&self, id: &str) -> Option<Arc<FakeRegistration>> {
        self.registrations.lock().get(id).cloned()
    }
}

impl PeerTransport for FakeNetwork {
    fn register(&self, local_id: &str) -> Arc<dyn PeerRegistration> {
        let taken = self.taken.lock().contains(local_id);
        let registration = Arc::new(FakeRegistration {
            id: local_id.to_string(),
            taken,
            manual_open: self.manual_open.load(Ordering::SeqCst),
            unavailable: self.unavailable.lock().clone(),
            events: EventEmitter::new(),
            destroyed: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
            dial_delay: Mutex::new(None),
        });
        self.registrations
            .lock()
            .insert(local_id.to_string(), Arc::clone(&registration));
        registration
    }
}

pub struct FakeRegistration {
    id: String,
    taken: bool,
    manual_open: bool,
    unavailable: HashSet<String>,
    events: EventEmitter<PeerEvent>,
    destroyed: AtomicBool,
    calls: Mutex<Vec<Arc<FakeCall>>>,
    /// Verzögert `call`, bevor der Anruf zustande kommt
    pub dial_delay: Mutex<Option<Duration>>,
}

impl FakeRegistration {
    pub fn emit(&self, event: PeerEvent) {
        self.events.emit(&event);
    }

    /// Simuliert einen eingehenden Anruf
    pub fn ring(&self, from: &str) -> Arc<FakeCall> {
        let call = FakeCall::new(from);
        self.emit(PeerEvent::Call(Arc::clone(&call) as Arc<dyn MediaCall>));
        call
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn listener_count(&self) -> usize {
        self.events.listener_count()
    }

    pub fn placed_calls(&self) -> Vec<Arc<FakeCall>> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl PeerRegistration for FakeRegistration {
    fn id(&self) -> &str {
        &self.id
    }

    fn on(&self, handler: PeerHandler) -> Subscription {
        self.events.on(handler)
    }

    fn connect(&self) {
        if self.manual_open {
            return;
        }
        if self.taken {
            self.emit(PeerEvent::Error(TransportError::IdTaken(self.id.clone())));
        } else {
            self.emit(PeerEvent::Open {
                id: self.id.clone(),
            });
        }
    }

    async fn call(
        &self,
        remote_id: &str,
        _stream: MediaStream,
    ) -> Result<Arc<dyn MediaCall>, TransportError> {
        let delay = *self.dial_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if self.unavailable.contains(remote_id) {
            return Err(TransportError::PeerUnavailable(remote_id.to_string()));
        }
        let call = FakeCall::new(remote_id);
        self.calls.lock().push(Arc::clone(&call));
        Ok(call as Arc<dyn MediaCall>)
    }

    fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        self.events.clear();
    }
}

// ============================================================================
// MEDIA CALL
// ============================================================================

pub struct FakeCall {
    peer: String,
    events: EventEmitter<CallEvent>,
    pub answers: AtomicUsize,
    pub closes: AtomicUsize,
    pub answer_error: Mutex<Option<TransportError>>,
}

impl FakeCall {
    pub fn new(peer: &str) -> Arc<Self> {
        Arc::new(Self {
            peer: peer.to_string(),
            events: EventEmitter::new(),
            answers: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            answer_error: Mutex::new(None),
        })
    }

    /// Gegenstelle liefert ihren Stream
    pub fn deliver_stream(&self) -> MediaStream {
        let remote = MediaStream::new(format!("remote-{}", self.peer), 8000);
        self.events.emit(&CallEvent::Stream(remote.clone()));
        remote
    }

    pub fn remote_close(&self) {
        self.events.emit(&CallEvent::Close);
    }

    pub fn remote_error(&self, error: TransportError) {
        self.events.emit(&CallEvent::Error(error));
    }

    pub fn is_closed(&self) -> bool {
        self.closes.load(Ordering::SeqCst) > 0
    }

    pub fn listener_count(&self) -> usize {
        self.events.listener_count()
    }
}

#[async_trait]
impl MediaCall for FakeCall {
    fn peer(&self) -> &str {
        &self.peer
    }

    fn on(&self, handler: CallHandler) -> Subscription {
        self.events.on(handler)
    }

    async fn answer(&self, _stream: MediaStream) -> Result<(), TransportError> {
        self.answers.fetch_add(1, Ordering::SeqCst);
        match self.answer_error.lock().clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn close(&self) {
        // Wie ein echter Transport: lokales Schließen meldet ebenfalls `Close`
        if self.closes.fetch_add(1, Ordering::SeqCst) == 0 {
            self.events.emit(&CallEvent::Close);
        }
    }
}

// ============================================================================
// AGENT TRANSPORT
// ============================================================================

#[derive(Default)]
pub struct FakeAgent {
    pub refuse: AtomicBool,
    /// `Open` nicht automatisch melden
    pub manual_open: AtomicBool,
    pub connects: AtomicUsize,
    pub last_config: Mutex<Option<LiveConfig>>,
    events: Mutex<Option<mpsc::UnboundedSender<LiveEvent>>>,
    sessions: Mutex<Vec<Arc<FakeLiveSession>>>,
}

impl FakeAgent {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Schickt ein Event wie die Gegenseite
    pub fn emit(&self, event: LiveEvent) -> bool {
        match self.events.lock().as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    pub fn session(&self) -> Option<Arc<FakeLiveSession>> {
        self.sessions.lock().last().cloned()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentTransport for FakeAgent {
    async fn connect(
        &self,
        config: LiveConfig,
        events: mpsc::UnboundedSender<LiveEvent>,
    ) -> Result<Arc<dyn LiveSession>, AgentError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(AgentError::connection("refused"));
        }

        *self.last_config.lock() = Some(config);
        if !self.manual_open.load(Ordering::SeqCst) {
            let _ = events.send(LiveEvent::Open);
        }
        *self.events.lock() = Some(events);

        let session = Arc::new(FakeLiveSession::default());
        self.sessions.lock().push(Arc::clone(&session));
        Ok(session as Arc<dyn LiveSession>)
    }
}

#[derive(Default)]
pub struct FakeLiveSession {
    pub sent: Mutex<Vec<MediaBlob>>,
    pub closed: AtomicBool,
}

impl FakeLiveSession {
    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LiveSession for FakeLiveSession {
    async fn send_realtime_input(&self, blob: MediaBlob) -> Result<(), AgentError> {
        if self.is_closed() {
            return Err(AgentError::NotConnected);
        }
        self.sent.lock().push(blob);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

// ============================================================================
// HELPERS
// ============================================================================

/// Wartet (virtuelle Zeit) bis `condition` gilt
pub async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Zähler für Callback-Aufrufe
#[derive(Clone, Default)]
pub struct Counter(Arc<AtomicUsize>);

impl Counter {
    pub fn hit(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}
