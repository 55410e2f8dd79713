//! WebSocket Client für den Signaling-Server
//!
//! Verwaltet die WebSocket-Verbindung zum Signaling-Server:
//! - Registrierung einer frei gewählten Peer-ID
//! - Weiterleitung von SDP / ICE zwischen den Peers
//! - Heartbeat-Keeping
//! - Event-basierte Kommunikation

use super::messages::*;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// Zeit bis zur Registrierungsbestätigung
const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Heartbeat-Intervall (Idle-Timeouts der Server-Seite)
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum SignalingError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to signaling server")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Server error: {code} - {message}")]
    ServerError { code: i32, message: String },
}

// ============================================================================
// SIGNALING EVENTS
// ============================================================================

/// Events die vom SignalingClient ausgelöst werden
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    /// Registrierung erfolgreich
    Registered { peer_id: String },

    /// Eingehender Anruf
    IncomingOffer {
        from_peer_id: String,
        call_id: String,
        sdp: String,
    },

    /// SDP Answer erhalten
    AnswerReceived {
        from_peer_id: String,
        call_id: String,
        sdp: String,
    },

    /// ICE Candidate erhalten
    IceCandidateReceived {
        from_peer_id: String,
        call_id: String,
        candidate: String,
    },

    /// Anruf von der Gegenseite beendet
    CallEnded { by_peer_id: String, call_id: String },

    /// Ziel nicht erreichbar
    PeerUnavailable { peer_id: String, call_id: String },

    /// Fehler vom Server
    Error { code: i32, message: String },

    /// Verbindung getrennt
    Disconnected,
}

// ============================================================================
// CLIENT STATE
// ============================================================================

#[derive(Debug, Clone, Default)]
struct ClientState {
    is_connected: bool,
    peer_id: Option<String>,
}

// ============================================================================
// SIGNALING CLIENT
// ============================================================================

/// WebSocket Client für Signaling-Server Kommunikation
pub struct SignalingClient {
    server_url: String,
    state: Arc<RwLock<ClientState>>,
    tx: RwLock<Option<mpsc::Sender<String>>>,
    event_tx: broadcast::Sender<SignalingEvent>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl SignalingClient {
    /// Erstellt einen neuen SignalingClient
    pub fn new(server_url: String) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            server_url,
            state: Arc::new(RwLock::new(ClientState::default())),
            tx: RwLock::new(None),
            event_tx,
            tasks: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.event_tx.subscribe()
    }

    /// Gibt die registrierte Peer-ID zurück
    pub fn peer_id(&self) -> Option<String> {
        self.state.read().peer_id.clone()
    }

    /// Prüft ob verbunden
    pub fn is_connected(&self) -> bool {
        self.state.read().is_connected
    }

    /// WebSocket-URL zum HTTP(S)-Basis-URL
    pub fn websocket_url(server_url: &str) -> String {
        let base = server_url.trim_end_matches('/');
        let ws = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        format!("{ws}/ws")
    }

    /// Verbindet mit dem Signaling-Server und registriert die Peer-ID
    pub async fn connect_and_register(&self, peer_id: String) -> Result<String, SignalingError> {
        let ws_url = Self::websocket_url(&self.server_url);

        tracing::info!("Connecting to signaling server: {}", ws_url);

        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        // Message-Sender erstellen
        let (tx, mut rx) = mpsc::channel::<String>(100);
        *self.tx.write() = Some(tx);

        self.state.write().is_connected = true;

        // Channel für Registrierungs-Response
        let (reg_tx, mut reg_rx) = mpsc::channel::<Result<String, SignalingError>>(1);

        // Read-Task starten
        let state_clone = Arc::clone(&self.state);
        let event_tx = self.event_tx.clone();

        let reader = tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(server_msg) => {
                            Self::handle_server_message(server_msg, &state_clone, &event_tx, &reg_tx)
                                .await;
                        }
                        Err(e) => tracing::warn!("Unparseable signaling message: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by server");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            state_clone.write().is_connected = false;
            let _ = event_tx.send(SignalingEvent::Disconnected);
        });

        // Write-Task starten
        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write.send(Message::Text(msg)).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
            let _ = write.close().await;
        });

        {
            let mut tasks = self.tasks.lock();
            tasks.push(reader);
            tasks.push(writer);
        }

        self.send(ClientMessage::Register { peer_id })?;

        tokio::select! {
            result = reg_rx.recv() => {
                match result {
                    Some(Ok(peer_id)) => Ok(peer_id),
                    Some(Err(e)) => Err(e),
                    None => Err(SignalingError::RegistrationFailed("No response".to_string())),
                }
            }
            _ = tokio::time::sleep(REGISTRATION_TIMEOUT) => {
                Err(SignalingError::RegistrationFailed("Timeout".to_string()))
            }
        }
    }

    /// Sendet ein SDP Offer
    pub fn send_offer(&self, to_peer_id: &str, call_id: &str, sdp: String) -> Result<(), SignalingError> {
        let from_peer_id = self.peer_id().ok_or(SignalingError::NotConnected)?;
        self.send(ClientMessage::Offer {
            from_peer_id,
            to_peer_id: to_peer_id.to_string(),
            call_id: call_id.to_string(),
            sdp,
        })
    }

    /// Sendet ein SDP Answer
    pub fn send_answer(&self, to_peer_id: &str, call_id: &str, sdp: String) -> Result<(), SignalingError> {
        let from_peer_id = self.peer_id().ok_or(SignalingError::NotConnected)?;
        self.send(ClientMessage::Answer {
            from_peer_id,
            to_peer_id: to_peer_id.to_string(),
            call_id: call_id.to_string(),
            sdp,
        })
    }

    /// Sendet einen ICE Candidate
    pub fn send_ice_candidate(
        &self,
        to_peer_id: &str,
        call_id: &str,
        candidate: String,
    ) -> Result<(), SignalingError> {
        let from_peer_id = self.peer_id().ok_or(SignalingError::NotConnected)?;
        self.send(ClientMessage::IceCandidate {
            from_peer_id,
            to_peer_id: to_peer_id.to_string(),
            call_id: call_id.to_string(),
            candidate,
        })
    }

    /// Beendet einen Anruf
    pub fn hangup(&self, to_peer_id: &str, call_id: &str) -> Result<(), SignalingError> {
        let from_peer_id = self.peer_id().ok_or(SignalingError::NotConnected)?;
        self.send(ClientMessage::Hangup {
            from_peer_id,
            to_peer_id: to_peer_id.to_string(),
            call_id: call_id.to_string(),
        })
    }

    /// Sendet einen Heartbeat
    pub fn send_heartbeat(&self) -> Result<(), SignalingError> {
        let peer_id = self.peer_id().ok_or(SignalingError::NotConnected)?;
        self.send(ClientMessage::Heartbeat { peer_id })
    }

    /// Sendet eine Nachricht mit Zeitstempel (non-blocking, try_send)
    fn send(&self, message: ClientMessage) -> Result<(), SignalingError> {
        let tx = self.tx.read().clone().ok_or(SignalingError::NotConnected)?;

        let envelope = Envelope {
            message: &message,
            timestamp: Utc::now().timestamp_millis(),
        };
        let msg_string = serde_json::to_string(&envelope)
            .map_err(|e| SignalingError::SendFailed(e.to_string()))?;

        tx.try_send(msg_string)
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }

    /// Verarbeitet eingehende Server-Nachrichten
    async fn handle_server_message(
        msg: ServerMessage,
        state: &Arc<RwLock<ClientState>>,
        event_tx: &broadcast::Sender<SignalingEvent>,
        reg_tx: &mpsc::Sender<Result<String, SignalingError>>,
    ) {
        match msg {
            ServerMessage::Registered { peer_id, .. } => {
                tracing::info!("Registered with peer_id {}", peer_id);
                state.write().peer_id = Some(peer_id.clone());
                let _ = reg_tx.send(Ok(peer_id.clone())).await;
                let _ = event_tx.send(SignalingEvent::Registered { peer_id });
            }

            ServerMessage::IncomingOffer {
                from_peer_id,
                call_id,
                sdp,
                ..
            } => {
                let _ = event_tx.send(SignalingEvent::IncomingOffer {
                    from_peer_id,
                    call_id,
                    sdp,
                });
            }

            ServerMessage::IncomingAnswer {
                from_peer_id,
                call_id,
                sdp,
                ..
            } => {
                let _ = event_tx.send(SignalingEvent::AnswerReceived {
                    from_peer_id,
                    call_id,
                    sdp,
                });
            }

            ServerMessage::IncomingIceCandidate {
                from_peer_id,
                call_id,
                candidate,
                ..
            } => {
                let _ = event_tx.send(SignalingEvent::IceCandidateReceived {
                    from_peer_id,
                    call_id,
                    candidate,
                });
            }

            ServerMessage::CallEnded {
                by_peer_id,
                call_id,
                ..
            } => {
                let _ = event_tx.send(SignalingEvent::CallEnded { by_peer_id, call_id });
            }

            ServerMessage::PeerUnavailable {
                peer_id, call_id, ..
            } => {
                let _ = event_tx.send(SignalingEvent::PeerUnavailable { peer_id, call_id });
            }

            ServerMessage::Error { code, message, .. } => {
                tracing::error!("Server error {}: {}", code, message);
                // Vor der Registrierung ist jeder Fehler ein Registrierungsfehler
                if state.read().peer_id.is_none() {
                    let _ = reg_tx
                        .send(Err(SignalingError::ServerError {
                            code,
                            message: message.clone(),
                        }))
                        .await;
                }
                let _ = event_tx.send(SignalingEvent::Error { code, message });
            }

            ServerMessage::Pong { .. } => {
                // Heartbeat-Response - nichts zu tun
            }
        }
    }

    /// Startet einen Heartbeat-Task
    pub fn start_heartbeat(self: &Arc<Self>) {
        let client = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(client) = client.upgrade() else {
                    break;
                };
                if !client.is_connected() {
                    tracing::info!("Heartbeat: Client disconnected, stopping heartbeat task");
                    break;
                }
                if let Err(e) = client.send_heartbeat() {
                    tracing::warn!("Failed to send heartbeat: {}", e);
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    /// Trennt die Verbindung. Idempotent.
    pub fn disconnect(&self) {
        // Sender fallen lassen beendet den Write-Task, der den Socket schließt
        self.tx.write().take();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for (i, task) in tasks.into_iter().enumerate() {
            // Der Write-Task (Index 1) darf den Close-Frame noch senden
            if i != 1 {
                task.abort();
            }
        }
        let mut state = self.state.write();
        state.is_connected = false;
        state.peer_id = None;
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl std::fmt::Debug for SignalingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingClient")
            .field("server_url", &self.server_url)
            .field("state", &*self.state.read())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_websocket_url() {
        assert_eq!(
            SignalingClient::websocket_url("https://signal.example.com/"),
            "wss://signal.example.com/ws"
        );
        assert_eq!(
            SignalingClient::websocket_url("http://localhost:8787"),
            "ws://localhost:8787/ws"
        );
        assert_eq!(
            SignalingClient::websocket_url("ws://localhost:9000"),
            "ws://localhost:9000/ws"
        );
    }

    #[test]
    fn test_send_without_connection_fails() {
        let client = SignalingClient::new("http://localhost".to_string());
        assert!(matches!(
            client.send_heartbeat(),
            Err(SignalingError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_unreachable_server() {
        let client = SignalingClient::new("http://127.0.0.1:9".to_string());
        let result = client.connect_and_register("alice".to_string()).await;
        assert!(matches!(result, Err(SignalingError::ConnectionFailed(_))));
        client.disconnect();
        client.disconnect();
    }

    #[tokio::test]
    async fn test_registration_error_before_registered() {
        let state = Arc::new(RwLock::new(ClientState::default()));
        let (event_tx, mut events) = broadcast::channel(4);
        let (reg_tx, mut reg_rx) = mpsc::channel(1);

        SignalingClient::handle_server_message(
            ServerMessage::Error {
                code: ERROR_ID_TAKEN,
                message: "taken".to_string(),
                timestamp: 0,
            },
            &state,
            &event_tx,
            &reg_tx,
        )
        .await;

        assert!(matches!(
            reg_rx.recv().await,
            Some(Err(SignalingError::ServerError { code: 409, .. }))
        ));
        assert!(matches!(
            events.recv().await,
            Ok(SignalingEvent::Error { code: 409, .. })
        ));
    }
}
