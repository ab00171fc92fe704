//! WebSocket accept loop and session plumbing
//!
//! One axum task per session: the read half feeds records into the shared
//! state under its mutex, the write half drains a per-session unbounded
//! queue. Fanout never blocks on a peer's socket.

use super::state::{BrokerState, RegisterRequest};
use super::{HEARTBEAT_SWEEP_INTERVAL, HEARTBEAT_TIMEOUT};
use crate::protocol::{BrokerRecord, ClientRecord};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("failed to bind broker listener: {0}")]
    Bind(#[from] std::io::Error),
}

struct BrokerShared {
    state: Mutex<BrokerState>,
    shutdown: CancellationToken,
    local_addr: SocketAddr,
}

/// Handle to a running broker.
///
/// Owns no state directly; cloning the handle is cheap and all clones refer
/// to the same registry.
#[derive(Clone)]
pub struct Broker {
    shared: Arc<BrokerShared>,
}

impl Broker {
    /// Bind to a kernel-chosen loopback port and start accepting sessions.
    pub async fn bind() -> Result<Self, BrokerError> {
        let listener =
            tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let local_addr = listener.local_addr()?;

        let shared = Arc::new(BrokerShared {
            state: Mutex::new(BrokerState::new()),
            shutdown: CancellationToken::new(),
            local_addr,
        });

        let app = Router::new()
            .route("/", get(ws_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(shared.clone());

        let serve_shutdown = shared.shutdown.clone();
        tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { serve_shutdown.cancelled().await })
                .await;
            if let Err(e) = result {
                tracing::error!(error = %e, "Broker accept loop failed");
            }
        });

        let broker = Self { shared };
        broker.spawn_reaper();
        tracing::info!(addr = %local_addr, "Broker listening");
        Ok(broker)
    }

    /// The kernel-chosen port.
    pub fn port(&self) -> u16 {
        self.shared.local_addr.port()
    }

    /// Loopback WebSocket URL agents connect to.
    pub fn url(&self) -> String {
        format!("ws://127.0.0.1:{}/", self.port())
    }

    /// Administrative eviction hook for the hub. Not a wire record.
    pub fn disconnect_agent_by_name(&self, name: &str) -> bool {
        self.shared.state.lock().unwrap().disconnect_by_name(name)
    }

    /// Cancel the accept loop, the reaper, and every live session.
    pub fn shutdown(&self) {
        self.shared.shutdown.cancel();
    }

    fn spawn_reaper(&self) {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    () = shared.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = shared
                            .state
                            .lock()
                            .unwrap()
                            .sweep_stale(HEARTBEAT_TIMEOUT);
                        for (id, name) in evicted {
                            tracing::warn!(agent = %name, id = %id, "Evicting agent: heartbeat timed out");
                        }
                    }
                }
            }
        });
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(shared): State<Arc<BrokerShared>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_session(socket, shared))
}

async fn handle_session(socket: WebSocket, shared: Arc<BrokerShared>) {
    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<BrokerRecord>();
    let session_cancel = shared.shutdown.child_token();

    let writer_cancel = session_cancel.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                maybe = outbound_rx.recv() => {
                    let Some(record) = maybe else { break };
                    let Ok(text) = serde_json::to_string(&record) else { continue };
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                () = writer_cancel.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    let mut agent_id: Option<String> = None;
    loop {
        tokio::select! {
            () = session_cancel.cancelled() => break,
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        handle_frame(&shared, &outbound_tx, &session_cancel, &mut agent_id, &text);
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {} // binary/ping/pong: nothing to do
                }
            }
        }
    }

    if let Some(id) = agent_id {
        shared.state.lock().unwrap().disconnect(&id);
    }
    session_cancel.cancel();
    let _ = writer.await;
}

/// Decode one frame and apply it. Protocol errors answer on the session and
/// never close it.
fn handle_frame(
    shared: &Arc<BrokerShared>,
    outbound_tx: &mpsc::UnboundedSender<BrokerRecord>,
    session_cancel: &CancellationToken,
    agent_id: &mut Option<String>,
    text: &str,
) {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(_) => {
            BrokerState::reject_unregistered(outbound_tx, "Invalid JSON");
            return;
        }
    };

    let tag = value
        .get("type")
        .and_then(|t| t.as_str())
        .map(str::to_string);
    let record: ClientRecord = match serde_json::from_value(value) {
        Ok(record) => record,
        Err(_) => {
            // Unknown tags are ignored; a known tag with bad fields is a
            // protocol error on this session.
            if let Some(tag) = tag {
                if ClientRecord::is_known_type(&tag) {
                    BrokerState::reject_unregistered(
                        outbound_tx,
                        format!("Invalid {tag} record"),
                    );
                }
            }
            return;
        }
    };

    let mut state = shared.state.lock().unwrap();
    match (&*agent_id, record) {
        (
            None,
            ClientRecord::Register {
                id,
                name,
                role,
                parent_id,
                cwd,
                interactive,
            },
        ) => {
            let request = RegisterRequest {
                id,
                name,
                role,
                parent_id,
                cwd,
                interactive,
            };
            match state.register(request, outbound_tx.clone(), session_cancel.clone()) {
                Ok(id) => *agent_id = Some(id),
                Err(message) => BrokerState::reject_unregistered(outbound_tx, message),
            }
        }
        (None, _) => {
            BrokerState::reject_unregistered(outbound_tx, "Must register first");
        }
        (Some(id), record) => {
            let id = id.clone();
            state.handle_record(&id, record);
        }
    }
}
