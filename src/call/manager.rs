//! Call Session Manager (P2P)
//!
//! Besitzt die Signaling-Registrierung, das Mikrofon, den aktiven Anruf und
//! den Metering-Graphen beider Gesprächsseiten. Der komplette Zustand liegt
//! in einem `CallSession`-Record hinter einem Mutex, der nie über ein
//! `.await` gehalten wird. Ressourcen werden unter dem Lock herausgenommen
//! und erst danach freigegeben.

use super::transport::{
    CallEvent, CallHandler, MediaCall, PeerEvent, PeerHandler, PeerRegistration, PeerTransport,
    TransportError,
};
use crate::audio::{Analyser, MeteringGraph, VolumeMonitor, FFT_SIZE, METER_INTERVAL};
use crate::events::Subscription;
use crate::media::{MediaDevices, MediaStream};
use crate::session::{SessionError, SessionState};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

type IdCallback = Arc<dyn Fn(&str) + Send + Sync>;
type StreamCallback = Arc<dyn Fn(&MediaStream) + Send + Sync>;
type CloseCallback = Arc<dyn Fn() + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(&SessionError) + Send + Sync>;

// ============================================================================
// CALLBACKS
// ============================================================================

/// Callbacks der Registrierung
///
/// `on_stream` / `on_close` gelten als Vorgabe für Anrufe, deren eigene
/// `CallCallbacks` sie nicht setzen.
#[derive(Clone, Default)]
pub struct PeerCallbacks {
    on_open: Option<IdCallback>,
    on_incoming_call: Option<IdCallback>,
    on_error: Option<ErrorCallback>,
    on_stream: Option<StreamCallback>,
    on_close: Option<CloseCallback>,
}

impl PeerCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registrierung bestätigt (mit der vergebenen ID)
    pub fn on_open(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_open = Some(Arc::new(f));
        self
    }

    /// Eingehender Anruf (mit der ID des Anrufers)
    pub fn on_incoming_call(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_incoming_call = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&SessionError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    pub fn on_stream(mut self, f: impl Fn(&MediaStream) + Send + Sync + 'static) -> Self {
        self.on_stream = Some(Arc::new(f));
        self
    }

    pub fn on_close(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_close = Some(Arc::new(f));
        self
    }
}

impl std::fmt::Debug for PeerCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerCallbacks")
            .field("on_open", &self.on_open.is_some())
            .field("on_incoming_call", &self.on_incoming_call.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_stream", &self.on_stream.is_some())
            .field("on_close", &self.on_close.is_some())
            .finish()
    }
}

/// Callbacks eines einzelnen Anrufs
#[derive(Clone, Default)]
pub struct CallCallbacks {
    on_stream: Option<StreamCallback>,
    on_close: Option<CloseCallback>,
    on_error: Option<ErrorCallback>,
}

impl CallCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entfernter Audiostream ist verfügbar
    pub fn on_stream(mut self, f: impl Fn(&MediaStream) + Send + Sync + 'static) -> Self {
        self.on_stream = Some(Arc::new(f));
        self
    }

    /// Anruf beendet (genau einmal pro Anruf)
    pub fn on_close(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_close = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&SessionError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    fn with_fallback(self, defaults: &PeerCallbacks) -> Self {
        Self {
            on_stream: self.on_stream.or_else(|| defaults.on_stream.clone()),
            on_close: self.on_close.or_else(|| defaults.on_close.clone()),
            on_error: self.on_error.or_else(|| defaults.on_error.clone()),
        }
    }

    fn stream(&self, stream: &MediaStream) {
        if let Some(cb) = &self.on_stream {
            cb(stream);
        }
    }

    fn close(&self) {
        if let Some(cb) = &self.on_close {
            cb();
        }
    }

    fn error(&self, err: &SessionError) {
        if let Some(cb) = &self.on_error {
            cb(err);
        }
    }
}

impl std::fmt::Debug for CallCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallCallbacks")
            .field("on_stream", &self.on_stream.is_some())
            .field("on_close", &self.on_close.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

// ============================================================================
// SESSION RECORD
// ============================================================================

struct ActiveCall {
    call: Arc<dyn MediaCall>,
    subscription: Option<Subscription>,
    callbacks: CallCallbacks,
    generation: u64,
}

#[derive(Default)]
struct CallSession {
    state: SessionState,
    /// Wird bei jedem Shutdown erhöht; laufende Mikrofon-Anfragen erkennen so den Abbruch
    epoch: u64,
    /// Wird bei jedem Auflegen oder Ersetzen erhöht; laufende Verbindungsaufbauten
    /// erkennen so, dass sie nicht mehr gewollt sind
    call_epoch: u64,
    registration: Option<Arc<dyn PeerRegistration>>,
    peer_subscription: Option<Subscription>,
    callbacks: PeerCallbacks,
    local_stream: Option<MediaStream>,
    incoming: Option<Arc<dyn MediaCall>>,
    active: Option<ActiveCall>,
    remote_stream: Option<MediaStream>,
    graph: Option<MeteringGraph>,
    monitor: Option<VolumeMonitor>,
    muted: bool,
}

impl CallSession {
    fn is_current(&self, generation: u64) -> bool {
        self.active
            .as_ref()
            .is_some_and(|active| active.generation == generation)
    }

    /// Nimmt alle anrufbezogenen Ressourcen heraus (Mikrofon bleibt)
    fn take_call_resources(&mut self, include_incoming: bool) -> CallResources {
        CallResources {
            active: self.active.take(),
            incoming: if include_incoming {
                self.incoming.take()
            } else {
                None
            },
            remote_stream: self.remote_stream.take(),
            graph: self.graph.take(),
            monitor: self.monitor.take(),
        }
    }
}

/// Aus dem Record herausgenommene Ressourcen, freigegeben ohne Lock
#[derive(Default)]
struct CallResources {
    active: Option<ActiveCall>,
    incoming: Option<Arc<dyn MediaCall>>,
    remote_stream: Option<MediaStream>,
    graph: Option<MeteringGraph>,
    monitor: Option<VolumeMonitor>,
}

impl CallResources {
    /// Gibt in fester Reihenfolge frei: Timer, Graph, Handler, Transport
    ///
    /// Liefert die Callbacks des beendeten Anrufs zurück, falls einer aktiv war.
    fn release(self) -> Option<CallCallbacks> {
        if let Some(monitor) = self.monitor {
            monitor.stop();
        }
        if let Some(graph) = self.graph {
            graph.disconnect();
        }
        drop(self.remote_stream);

        let callbacks = self.active.map(|active| {
            // Erst abmelden, dann schließen: kein Close-Event an uns selbst
            if let Some(subscription) = active.subscription {
                subscription.revoke();
            }
            active.call.close();
            active.callbacks
        });

        if let Some(incoming) = self.incoming {
            incoming.close();
        }

        callbacks
    }
}

// ============================================================================
// CALL SESSION MANAGER
// ============================================================================

/// Lebenszyklus eines Zwei-Parteien-Anrufs
pub struct CallSessionManager {
    transport: Arc<dyn PeerTransport>,
    devices: Arc<dyn MediaDevices>,
    meter_interval: Duration,
    session: Arc<Mutex<CallSession>>,
    mic_lock: tokio::sync::Mutex<()>,
    generation: AtomicU64,
}

impl CallSessionManager {
    pub fn new(transport: Arc<dyn PeerTransport>, devices: Arc<dyn MediaDevices>) -> Self {
        Self::with_meter_interval(transport, devices, METER_INTERVAL)
    }

    pub fn with_meter_interval(
        transport: Arc<dyn PeerTransport>,
        devices: Arc<dyn MediaDevices>,
        meter_interval: Duration,
    ) -> Self {
        Self {
            transport,
            devices,
            meter_interval,
            session: Arc::new(Mutex::new(CallSession::default())),
            mic_lock: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> SessionState {
        self.session.lock().state
    }

    /// Registrierte Peer-ID
    pub fn local_id(&self) -> Option<String> {
        self.session
            .lock()
            .registration
            .as_ref()
            .map(|r| r.id().to_string())
    }

    pub fn has_incoming_call(&self) -> bool {
        self.session.lock().incoming.is_some()
    }

    /// Registriert die Session unter `local_id`
    ///
    /// Eine vorhandene Registrierung wird vorher komplett verworfen. Fehler
    /// (ID vergeben, Server nicht erreichbar) kommen asynchron über
    /// `on_error`. Muss innerhalb einer Tokio-Runtime aufgerufen werden.
    pub fn initialize(&self, local_id: &str, callbacks: PeerCallbacks) {
        if self.session.lock().registration.is_some() {
            tracing::info!("Re-initializing, discarding previous registration");
            self.shutdown();
        }

        let registration = self.transport.register(local_id);
        let subscription = registration.on(peer_handler(Arc::downgrade(&self.session)));

        {
            let mut session = self.session.lock();
            session.registration = Some(Arc::clone(&registration));
            session.peer_subscription = Some(subscription);
            session.callbacks = callbacks;
            session.state = SessionState::Idle;
        }

        tracing::info!("Registering as '{}'", local_id);
        registration.connect();
    }

    /// Fordert das Mikrofon an; das Ergebnis wird für die Session gemerkt
    pub async fn acquire_local_audio(&self) -> Result<MediaStream, SessionError> {
        let _guard = self.mic_lock.lock().await;

        let epoch = {
            let session = self.session.lock();
            if let Some(stream) = session.local_stream.as_ref().filter(|s| s.is_live()) {
                return Ok(stream.clone());
            }
            session.epoch
        };

        let stream = self.devices.get_user_media().await.map_err(|e| {
            tracing::warn!("Microphone unavailable: {}", e);
            SessionError::Permission(e)
        })?;

        let mut session = self.session.lock();
        if session.epoch != epoch {
            drop(session);
            stream.stop_tracks();
            return Err(SessionError::Cancelled);
        }
        stream.track().set_enabled(!session.muted);
        session.local_stream = Some(stream.clone());
        tracing::info!("Microphone acquired ({} Hz)", stream.sample_rate());
        Ok(stream)
    }

    /// Ruft `remote_id` an
    ///
    /// Ein bestehender Anruf (aus- oder eingehend) wird vorher geschlossen.
    pub async fn place_call(
        &self,
        remote_id: &str,
        callbacks: CallCallbacks,
    ) -> Result<(), SessionError> {
        let registration = self
            .session
            .lock()
            .registration
            .clone()
            .ok_or(SessionError::NotRegistered)?;

        let token = self.session.lock().call_epoch;
        let stream = self.acquire_local_audio().await?;
        let token = self.begin_connecting(token, true)?;

        tracing::info!("Calling {}", remote_id);
        match registration.call(remote_id, stream).await {
            Ok(call) => match self.attach_call(Arc::clone(&call), callbacks, token) {
                Some(_) => Ok(()),
                None => {
                    tracing::info!("Call to {} cancelled while connecting", remote_id);
                    call.close();
                    Err(SessionError::Cancelled)
                }
            },
            Err(e) => {
                tracing::error!("Call to {} failed: {}", remote_id, e);
                let mut session = self.session.lock();
                if session.call_epoch == token {
                    session.state = SessionState::Idle;
                }
                Err(SessionError::Connection(e))
            }
        }
    }

    /// Nimmt den zuletzt eingegangenen Anruf an
    ///
    /// "Bereits stabil" vom Transport gilt als Erfolg.
    pub async fn answer_incoming_call(&self, callbacks: CallCallbacks) -> Result<(), SessionError> {
        let incoming = self
            .session
            .lock()
            .incoming
            .take()
            .ok_or(SessionError::NoIncomingCall)?;

        let token = self.session.lock().call_epoch;
        let stream = match self.acquire_local_audio().await {
            Ok(stream) => stream,
            Err(e) => {
                // Anruf bleibt annehmbar, solange kein neuerer eingetroffen ist
                let mut session = self.session.lock();
                if session.incoming.is_none() {
                    session.incoming = Some(incoming);
                }
                return Err(e);
            }
        };

        // Aufgelegt während der Mikrofon-Anfrage: Anruf ablehnen
        let attached = self
            .begin_connecting(token, false)
            .ok()
            .and_then(|token| self.attach_call(Arc::clone(&incoming), callbacks, token));
        let Some(generation) = attached else {
            tracing::info!("Answering {} cancelled", incoming.peer());
            incoming.close();
            return Err(SessionError::Cancelled);
        };

        match incoming.answer(stream).await {
            Ok(()) => Ok(()),
            Err(TransportError::AlreadyStable) => {
                tracing::debug!("Answer raced with an already stable connection");
                Ok(())
            }
            Err(e) => {
                tracing::error!("Answering {} failed: {}", incoming.peer(), e);
                let resources = {
                    let mut session = self.session.lock();
                    if !session.is_current(generation) {
                        return Err(SessionError::Connection(e));
                    }
                    session.state = SessionState::Idle;
                    session.take_call_resources(false)
                };
                resources.release();
                Err(SessionError::Connection(e))
            }
        }
    }

    /// Startet die 100ms-Pegelmessung (lokal, entfernt); ersetzt eine laufende
    pub fn begin_volume_monitoring<F>(&self, callback: F)
    where
        F: Fn(f32, f32) + Send + Sync + 'static,
    {
        let previous = self.session.lock().monitor.take();
        if let Some(previous) = previous {
            previous.stop();
        }

        let weak = Arc::downgrade(&self.session);
        let monitor = VolumeMonitor::start(
            self.meter_interval,
            move || {
                let session = weak.upgrade()?;
                let session = session.lock();
                session.graph.as_ref().map(|graph| graph.levels())
            },
            Arc::new(callback),
        );

        let replaced = self.session.lock().monitor.replace(monitor);
        if let Some(replaced) = replaced {
            replaced.stop();
        }
    }

    /// Beendet den aktiven Anruf; das Mikrofon bleibt für weitere Anrufe erhalten
    pub fn end_call(&self) {
        let resources = {
            let mut session = self.session.lock();
            session.call_epoch += 1;
            if session.state.is_busy() {
                session.state = SessionState::Idle;
            }
            session.take_call_resources(true)
        };

        if let Some(callbacks) = resources.release() {
            tracing::info!("Call ended locally");
            callbacks.close();
        }
    }

    /// Beendet alles: Anruf, Mikrofon, Registrierung. Idempotent.
    pub fn shutdown(&self) {
        let (resources, local_stream, subscription, registration) = {
            let mut session = self.session.lock();
            session.epoch += 1;
            session.call_epoch += 1;
            session.state = SessionState::Idle;
            (
                session.take_call_resources(true),
                session.local_stream.take(),
                session.peer_subscription.take(),
                session.registration.take(),
            )
        };

        if let Some(callbacks) = resources.release() {
            callbacks.close();
        }
        if let Some(stream) = local_stream {
            stream.stop_tracks();
        }
        drop(subscription);
        if let Some(registration) = registration {
            registration.destroy();
            tracing::info!("Call session shut down");
        }
    }

    /// Setzt Mute-Status (gilt auch für später erworbene Mikrofone)
    pub fn set_muted(&self, muted: bool) {
        let mut session = self.session.lock();
        session.muted = muted;
        if let Some(stream) = &session.local_stream {
            stream.track().set_enabled(!muted);
        }
    }

    pub fn is_muted(&self) -> bool {
        self.session.lock().muted
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    /// Schließt den laufenden Anruf ohne `on_close` (wird ersetzt) und geht
    /// auf `Connecting`
    ///
    /// Schlägt mit `Cancelled` fehl, wenn seit `token` aufgelegt oder ein
    /// anderer Anruf begonnen wurde. Liefert das Token des neuen Versuchs.
    fn begin_connecting(&self, token: u64, include_incoming: bool) -> Result<u64, SessionError> {
        let (resources, token) = {
            let mut session = self.session.lock();
            if session.call_epoch != token {
                return Err(SessionError::Cancelled);
            }
            session.call_epoch += 1;
            session.state = SessionState::Connecting;
            let resources = if session.active.is_some() {
                session.take_call_resources(include_incoming)
            } else {
                // Kein Anruf: eine bereits laufende Pegelmessung bleibt bestehen
                CallResources {
                    incoming: if include_incoming {
                        session.incoming.take()
                    } else {
                        None
                    },
                    ..CallResources::default()
                }
            };
            (resources, session.call_epoch)
        };
        if resources.active.is_some() {
            tracing::info!("Closing existing call before starting a new one");
        }
        resources.release();
        Ok(token)
    }

    /// Macht `call` zum aktiven Anruf und meldet die Handler an
    ///
    /// `None`, wenn der Versuch `token` inzwischen abgebrochen wurde.
    fn attach_call(
        &self,
        call: Arc<dyn MediaCall>,
        callbacks: CallCallbacks,
        token: u64,
    ) -> Option<u64> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        {
            let mut session = self.session.lock();
            if session.call_epoch != token {
                return None;
            }
            let callbacks = callbacks.with_fallback(&session.callbacks);
            session.active = Some(ActiveCall {
                call: Arc::clone(&call),
                subscription: None,
                callbacks,
                generation,
            });
        }

        let subscription = call.on(call_handler(Arc::downgrade(&self.session), generation));

        let mut session = self.session.lock();
        match session.active.as_mut() {
            Some(active) if active.generation == generation => {
                active.subscription = Some(subscription);
            }
            _ => {
                drop(session);
                subscription.revoke();
            }
        }
        Some(generation)
    }
}

impl Drop for CallSessionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for CallSessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let session = self.session.lock();
        f.debug_struct("CallSessionManager")
            .field("state", &session.state)
            .field("registered", &session.registration.is_some())
            .field("in_call", &session.active.is_some())
            .field("muted", &session.muted)
            .finish()
    }
}

// ============================================================================
// EVENT HANDLERS
// ============================================================================

fn peer_handler(session: Weak<Mutex<CallSession>>) -> PeerHandler {
    Box::new(move |event: &PeerEvent| {
        let Some(session) = session.upgrade() else {
            return;
        };

        match event {
            PeerEvent::Open { id } => {
                tracing::info!("Registered as '{}'", id);
                let callback = session.lock().callbacks.on_open.clone();
                if let Some(cb) = callback {
                    cb(id);
                }
            }

            PeerEvent::Call(call) => {
                let callback = {
                    let mut session = session.lock();
                    if session.incoming.replace(Arc::clone(call)).is_some() {
                        tracing::warn!("Incoming call from {} replaces a pending one", call.peer());
                    }
                    session.callbacks.on_incoming_call.clone()
                };
                tracing::info!("Incoming call from {}", call.peer());
                if let Some(cb) = callback {
                    cb(call.peer());
                }
            }

            PeerEvent::Error(e) => {
                tracing::error!("Peer error: {}", e);
                let err = match e {
                    TransportError::IdTaken(_)
                    | TransportError::Unreachable(_)
                    | TransportError::NotRegistered => SessionError::Connection(e.clone()),
                    other => SessionError::Remote(other.clone()),
                };
                let callback = session.lock().callbacks.on_error.clone();
                if let Some(cb) = callback {
                    cb(&err);
                }
            }

            PeerEvent::Disconnected => {
                tracing::warn!("Signaling connection lost");
                let callback = session.lock().callbacks.on_error.clone();
                if let Some(cb) = callback {
                    cb(&SessionError::Connection(TransportError::Closed));
                }
            }
        }
    })
}

fn call_handler(session: Weak<Mutex<CallSession>>, generation: u64) -> CallHandler {
    Box::new(move |event: &CallEvent| {
        let Some(session) = session.upgrade() else {
            return;
        };

        match event {
            CallEvent::Stream(remote) => {
                let (callbacks, replaced_graph) = {
                    let mut guard = session.lock();
                    let session = &mut *guard;
                    let Some(active) = session.active.as_ref().filter(|a| a.generation == generation)
                    else {
                        return;
                    };
                    let callbacks = active.callbacks.clone();

                    session.remote_stream = Some(remote.clone());
                    session.state = SessionState::Active;

                    // Metering-Graph, sobald beide Seiten existieren
                    let replaced = session.graph.take();
                    if let Some(local) = &session.local_stream {
                        let graph = MeteringGraph::new(
                            Analyser::attach(FFT_SIZE, local.subscribe()),
                            Analyser::attach(FFT_SIZE, remote.subscribe()),
                        );
                        session.graph = Some(graph);
                    }
                    (callbacks, replaced)
                };

                if let Some(graph) = replaced_graph {
                    graph.disconnect();
                }
                tracing::info!("Remote stream received");
                callbacks.stream(remote);
            }

            CallEvent::Close | CallEvent::Error(_) => {
                let resources = {
                    let mut session = session.lock();
                    if !session.is_current(generation) {
                        return;
                    }
                    session.state = SessionState::Closed;
                    session.take_call_resources(false)
                };

                let Some(callbacks) = resources.release() else {
                    return;
                };
                if let CallEvent::Error(e) = event {
                    tracing::error!("Call error: {}", e);
                    callbacks.error(&SessionError::Remote(e.clone()));
                } else {
                    tracing::info!("Call closed by remote");
                }
                callbacks.close();
            }
        }
    })
}

// ============================================================================
// TESTS
// ============================================================================
