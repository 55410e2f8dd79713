//! Gemini Live Transport
//!
//! Öffnet eine WebSocket-Verbindung zur Gemini Live API, sendet das Setup
//! und liest Server-Nachrichten in einem eigenen Task. Ausgehende Chunks
//! laufen über einen Writer-Task, damit ein langsamer Socket den Aufrufer
//! nicht blockiert.

use super::messages::{LiveClientMessage, LiveServerMessage, MediaBlob};
use super::transport::{AgentError, AgentTransport, LiveConfig, LiveEvent, LiveSession};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// Öffentlicher Endpunkt der Live API
pub const GEMINI_LIVE_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1alpha.GenerativeService.BidiGenerateContent";

/// Kapazität des Writer-Kanals (Nachrichten)
const WRITER_CAPACITY: usize = 64;

// ============================================================================
// TRANSPORT
// ============================================================================

/// Live-Sessions gegen die Gemini API
#[derive(Clone)]
pub struct GeminiLiveTransport {
    api_key: String,
    endpoint: String,
}

impl GeminiLiveTransport {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            endpoint: GEMINI_LIVE_ENDPOINT.to_string(),
        }
    }

    /// Anderer Endpunkt (z.B. Proxy oder Test-Server)
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    fn url(&self) -> String {
        format!("{}?key={}", self.endpoint, self.api_key)
    }
}

impl std::fmt::Debug for GeminiLiveTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // API-Key nicht loggen
        f.debug_struct("GeminiLiveTransport")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

#[async_trait]
impl AgentTransport for GeminiLiveTransport {
    async fn connect(
        &self,
        config: LiveConfig,
        events: mpsc::UnboundedSender<LiveEvent>,
    ) -> Result<Arc<dyn LiveSession>, AgentError> {
        if self.api_key.is_empty() {
            return Err(AgentError::connection("No API key configured"));
        }

        let request = self.url().into_client_request().map_err(|e| {
            AgentError::connection(format!("Failed to create client request: {}", e))
        })?;

        tracing::info!("Connecting to live endpoint {}", self.endpoint);
        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(|e| AgentError::connection(format!("WebSocket connect error: {}", e)))?;

        let (mut write, mut read) = ws_stream.split();

        let setup = serde_json::to_string(&LiveClientMessage::setup(&config))
            .map_err(|e| AgentError::protocol(format!("JSON serialize error: {}", e)))?;
        tracing::info!(model_id = %config.model, "Sending setup message");
        write
            .send(Message::Text(setup))
            .await
            .map_err(|e| AgentError::connection(format!("Send error: {}", e)))?;

        let closed = Arc::new(AtomicBool::new(false));

        // Write-Task
        let (tx, mut rx) = mpsc::channel::<String>(WRITER_CAPACITY);
        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write.send(Message::Text(msg)).await {
                    tracing::error!("Failed to send live message: {}", e);
                    break;
                }
            }
            let _ = write.close().await;
        });

        // Der Socket ist offen und das Setup ist raus; `Open` geht jedem
        // Server-Event voraus
        let _ = events.send(LiveEvent::Open);

        // Read-Task
        let reader_events = events.clone();
        let reader_closed = Arc::clone(&closed);
        let reader = tokio::spawn(async move {
            let mut reason = None;
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => forward(&reader_events, &text),
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                        Ok(text) => forward(&reader_events, &text),
                        Err(e) => {
                            let _ = reader_events.send(LiveEvent::Error {
                                message: Some(format!("Invalid UTF-8 in binary message: {}", e)),
                            });
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        reason = frame.map(|f| f.reason.to_string()).filter(|r| !r.is_empty());
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let _ = reader_events.send(LiveEvent::Error {
                            message: Some(format!("Receive error: {}", e)),
                        });
                        break;
                    }
                }
            }

            reader_closed.store(true, Ordering::SeqCst);
            tracing::info!("Live session closed: {:?}", reason);
            let _ = reader_events.send(LiveEvent::Close { reason });
        });

        Ok(Arc::new(GeminiLiveSession {
            tx: Mutex::new(Some(tx)),
            closed,
            tasks: Mutex::new(vec![reader, writer]),
        }))
    }
}

fn forward(events: &mpsc::UnboundedSender<LiveEvent>, raw: &str) {
    match serde_json::from_str::<LiveServerMessage>(raw) {
        Ok(message) => {
            let _ = events.send(LiveEvent::Message(message));
        }
        Err(e) => {
            tracing::debug!(%raw, "Unparseable live message");
            let _ = events.send(LiveEvent::Error {
                message: Some(format!("Parse error: {}", e)),
            });
        }
    }
}

// ============================================================================
// SESSION
// ============================================================================

/// Offene Gemini Live-Session
pub struct GeminiLiveSession {
    tx: Mutex<Option<mpsc::Sender<String>>>,
    closed: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[async_trait]
impl LiveSession for GeminiLiveSession {
    async fn send_realtime_input(&self, blob: MediaBlob) -> Result<(), AgentError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AgentError::NotConnected);
        }
        let tx = self.tx.lock().clone().ok_or(AgentError::NotConnected)?;

        let msg = serde_json::to_string(&LiveClientMessage::realtime_input(blob))
            .map_err(|e| AgentError::protocol(format!("JSON serialize error: {}", e)))?;

        tx.send(msg)
            .await
            .map_err(|e| AgentError::Send(e.to_string()))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        // Sender fallen lassen beendet den Write-Task, der den Socket schließt
        self.tx.lock().take();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        // Reader abbrechen: kein Close-Event nach lokalem Abbau
        if let Some(reader) = tasks.into_iter().next() {
            reader.abort();
        }
    }
}

impl Drop for GeminiLiveSession {
    fn drop(&mut self) {
        self.close();
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> LiveConfig {
        LiveConfig {
            model: "models/test".to_string(),
            system_instruction: None,
            response_modality: "AUDIO".to_string(),
            voice_name: None,
        }
    }

    #[test]
    fn test_url_carries_key() {
        let transport = GeminiLiveTransport::new("secret").with_endpoint("ws://localhost:1/live");
        assert_eq!(transport.url(), "ws://localhost:1/live?key=secret");
        assert!(!format!("{:?}", transport).contains("secret"));
    }

    #[tokio::test]
    async fn test_missing_api_key() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = GeminiLiveTransport::new("").connect(config(), tx).await;
        assert!(matches!(result, Err(AgentError::Connection(_))));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = GeminiLiveTransport::new("key").with_endpoint("ws://127.0.0.1:9/live");
        let result = transport.connect(config(), tx).await;
        assert!(matches!(result, Err(AgentError::Connection(_))));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_forward_parse_error() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        forward(&tx, "not json");
        assert!(matches!(
            rx.try_recv(),
            Ok(LiveEvent::Error { message: Some(_) })
        ));

        forward(&tx, r#"{"serverContent":{"interrupted":true}}"#);
        match rx.try_recv() {
            Ok(LiveEvent::Message(msg)) => assert!(msg.interrupted()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_open_precedes_server_events() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Server antwortet sofort nach dem Setup und legt auf
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            let setup = ws.next().await.unwrap().unwrap();
            assert!(setup.to_text().unwrap().contains("models/test"));
            ws.send(Message::Text(r#"{"serverContent":{"interrupted":true}}"#.to_string()))
                .await
                .unwrap();
            ws.close(None).await.unwrap();
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport =
            GeminiLiveTransport::new("key").with_endpoint(format!("ws://{}/live", addr));
        let _session = transport.connect(config(), tx).await.unwrap();

        assert!(matches!(rx.recv().await, Some(LiveEvent::Open)));
        match rx.recv().await {
            Some(LiveEvent::Message(msg)) => assert!(msg.interrupted()),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(rx.recv().await, Some(LiveEvent::Close { reason: None })));
        server.await.unwrap();
    }
}
