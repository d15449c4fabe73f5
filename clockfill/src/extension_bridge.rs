use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex as StdMutex, PoisonError},
    time::Duration,
};

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::{
    net::TcpListener,
    sync::{mpsc, oneshot, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use uuid::Uuid;

use crate::messages::RelayMessage;
use crate::AutomationError;

pub const DEFAULT_WS_ADDR: &str = "127.0.0.1:17373";

type BridgeResult = Result<serde_json::Value, String>;
type PendingMap = HashMap<String, oneshot::Sender<BridgeResult>>;
type Pending = Arc<Mutex<PendingMap>>;
type Clients = Arc<Mutex<Vec<Client>>>;
// Watch teardown runs from Drop, so this map is behind a blocking mutex.
type Watches = Arc<StdMutex<HashMap<String, mpsc::UnboundedSender<()>>>>;

#[derive(Debug, Serialize, Deserialize)]
struct EvalRequest {
    id: String,
    action: String,
    code: String,
    #[serde(default)]
    await_promise: bool,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BridgeIncoming {
    EvalResult {
        id: String,
        ok: bool,
        result: Option<serde_json::Value>,
        error: Option<String>,
    },
    Typed(TypedIncoming),
    Relay(RelayMessage),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum TypedIncoming {
    #[serde(rename = "hello")]
    Hello { from: Option<String> },
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "mutation_event")]
    MutationEvent { watch_id: String },
}

struct Client {
    id: String,
    sender: mpsc::UnboundedSender<Message>,
}

/// Shared state the per-connection tasks write into
#[derive(Clone)]
struct Routes {
    clients: Clients,
    pending: Pending,
    watches: Watches,
    requests: mpsc::UnboundedSender<RelayMessage>,
}

impl Routes {
    async fn dispatch(&self, incoming: BridgeIncoming) {
        match incoming {
            BridgeIncoming::EvalResult {
                id,
                ok,
                result,
                error,
            } => {
                if ok {
                    let size = result.as_ref().map(|r| r.to_string().len()).unwrap_or(0);
                    tracing::debug!(id = %id, result_size = size, "Bridge received EvalResult");
                } else {
                    let head: String = error
                        .as_deref()
                        .unwrap_or("unknown error")
                        .chars()
                        .take(400)
                        .collect();
                    tracing::debug!(id = %id, error = %head, "Bridge received EvalResult error");
                }
                if let Some(tx) = self.pending.lock().await.remove(&id) {
                    let _ = tx.send(if ok {
                        Ok(result.unwrap_or(serde_json::Value::Null))
                    } else {
                        Err(error.unwrap_or_else(|| "unknown error".into()))
                    });
                }
            }
            BridgeIncoming::Typed(TypedIncoming::MutationEvent { watch_id }) => {
                let watches = self.watches.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(tx) = watches.get(&watch_id) {
                    let _ = tx.send(());
                }
            }
            BridgeIncoming::Typed(TypedIncoming::Hello { from }) => {
                tracing::info!(from = ?from, "Extension connected");
            }
            BridgeIncoming::Typed(TypedIncoming::Pong) => {}
            BridgeIncoming::Relay(message) => {
                tracing::info!(request_id = %message.request_id(), "Relay request received");
                if self.requests.send(message).is_err() {
                    tracing::warn!("No host is serving relay requests; dropping");
                }
            }
        }
    }
}

/// WebSocket endpoint the companion extension connects to. Scripts are
/// evaluated in the extension's active tab; the tab's content script
/// forwards mutation signals and popup requests back over the same socket.
pub struct ExtensionBridge {
    _server_task: JoinHandle<()>,
    local_addr: SocketAddr,
    routes: Routes,
    requests: Mutex<Option<mpsc::UnboundedReceiver<RelayMessage>>>,
}

impl ExtensionBridge {
    /// Binds `addr` (port 0 picks a free port) and starts accepting clients.
    pub async fn start(addr: &str) -> Result<ExtensionBridge, AutomationError> {
        let listener = match TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                tracing::warn!(
                    %addr,
                    ?e,
                    "Port in use, waiting 2 seconds and retrying once..."
                );
                tokio::time::sleep(Duration::from_secs(2)).await;
                TcpListener::bind(addr).await.map_err(|e2| {
                    AutomationError::PlatformError(format!(
                        "Failed to bind extension bridge on {addr} after retry: {e2}"
                    ))
                })?
            }
            Err(e) => {
                return Err(AutomationError::PlatformError(format!(
                    "Failed to bind extension bridge on {addr}: {e}"
                )))
            }
        };
        let local_addr = listener
            .local_addr()
            .map_err(|e| AutomationError::PlatformError(format!("bridge local addr: {e}")))?;
        tracing::info!("Clockfill extension bridge listening on {}", local_addr);

        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let routes = Routes {
            clients: Arc::new(Mutex::new(Vec::new())),
            pending: Arc::new(Mutex::new(HashMap::new())),
            watches: Arc::new(StdMutex::new(HashMap::new())),
            requests: requests_tx,
        };

        let server_routes = routes.clone();
        let server_task = tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!("ws accept error: {}", e);
                        continue;
                    }
                };
                let routes = server_routes.clone();
                tokio::spawn(async move {
                    let ws_stream = match accept_async(stream).await {
                        Ok(s) => s,
                        Err(e) => {
                            tracing::warn!("ws handshake error: {}", e);
                            return;
                        }
                    };
                    let (mut sink, mut stream) = ws_stream.split();
                    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

                    // writer task
                    let writer = tokio::spawn(async move {
                        while let Some(msg) = rx.recv().await {
                            if let Err(e) = sink.send(msg).await {
                                tracing::warn!("ws send error: {}", e);
                                break;
                            }
                        }
                    });

                    let client_id = Uuid::new_v4().to_string();
                    routes.clients.lock().await.push(Client {
                        id: client_id.clone(),
                        sender: tx,
                    });
                    tracing::debug!(%peer, %client_id, "Bridge client registered");

                    // reader loop
                    while let Some(Ok(msg)) = stream.next().await {
                        if !msg.is_text() {
                            continue;
                        }
                        let txt = msg.into_text().unwrap_or_default();
                        match serde_json::from_str::<BridgeIncoming>(&txt) {
                            Ok(incoming) => routes.dispatch(incoming).await,
                            Err(e) => tracing::warn!("Invalid incoming JSON: {}", e),
                        }
                    }

                    routes.clients.lock().await.retain(|c| c.id != client_id);
                    tracing::info!(%peer, "Extension disconnected");
                    writer.abort();
                });
            }
        });

        Ok(ExtensionBridge {
            _server_task: server_task,
            local_addr,
            routes,
            requests: Mutex::new(Some(requests_rx)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn is_client_connected(&self) -> bool {
        !self.routes.clients.lock().await.is_empty()
    }

    /// Polls for a client connection for up to `timeout`.
    pub async fn wait_for_client(&self, timeout: Duration) -> bool {
        let poll = Duration::from_millis(500);
        let mut waited = Duration::ZERO;
        loop {
            if self.is_client_connected().await {
                return true;
            }
            if waited >= timeout {
                return false;
            }
            tokio::time::sleep(poll).await;
            waited += poll;
            if waited.as_millis() % 3000 == 0 {
                tracing::info!("Still waiting for extension client... {}s", waited.as_secs());
            }
        }
    }

    /// Evaluates `code` in the active tab and returns its JSON result.
    pub async fn eval(
        &self,
        code: &str,
        timeout: Duration,
    ) -> Result<serde_json::Value, AutomationError> {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel::<BridgeResult>();
        self.routes.pending.lock().await.insert(id.clone(), tx);
        let req = EvalRequest {
            id: id.clone(),
            action: "eval".into(),
            code: code.to_string(),
            await_promise: true,
        };
        let payload = serde_json::to_string(&req)
            .map_err(|e| AutomationError::PlatformError(format!("bridge serialize: {e}")))?;

        // send over first client
        let sent = {
            let clients = self.routes.clients.lock().await;
            tracing::trace!(clients = clients.len(), preview = %payload.chars().take(120).collect::<String>(), "Sending eval to extension");
            clients
                .first()
                .map(|c| c.sender.send(Message::Text(payload)).is_ok())
        };
        match sent {
            Some(true) => {}
            Some(false) => {
                self.routes.pending.lock().await.remove(&id);
                return Err(AutomationError::PlatformError(
                    "failed to send eval to extension".into(),
                ));
            }
            None => {
                self.routes.pending.lock().await.remove(&id);
                return Err(AutomationError::PlatformError(
                    "no extension connected".into(),
                ));
            }
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(val))) => Ok(val),
            Ok(Ok(Err(err))) => Err(AutomationError::PlatformError(err)),
            Ok(Err(_canceled)) => Err(AutomationError::PlatformError(
                "extension dropped the eval request".into(),
            )),
            Err(_elapsed) => {
                let _ = self.routes.pending.lock().await.remove(&id);
                Err(AutomationError::Timeout(format!(
                    "Timed out after {timeout:?} waiting for EvalResult (id={id})"
                )))
            }
        }
    }

    /// Routes `mutation_event`s for `watch_id` into the returned receiver.
    pub fn register_watch(&self, watch_id: &str) -> mpsc::UnboundedReceiver<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes
            .watches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(watch_id.to_string(), tx);
        rx
    }

    pub fn unregister_watch(&self, watch_id: &str) {
        self.routes
            .watches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(watch_id);
    }

    /// Sends a relay message to every connected client.
    pub async fn broadcast(&self, message: &RelayMessage) -> Result<(), AutomationError> {
        let payload = serde_json::to_string(message)
            .map_err(|e| AutomationError::Internal(format!("relay serialize: {e}")))?;
        let clients = self.routes.clients.lock().await;
        for client in clients.iter() {
            let _ = client.sender.send(Message::Text(payload.clone()));
        }
        Ok(())
    }

    /// The queue of popup requests forwarded by the extension. Only one
    /// host may serve it; later calls return `None`.
    pub async fn take_requests(&self) -> Option<mpsc::UnboundedReceiver<RelayMessage>> {
        self.requests.lock().await.take()
    }
}
