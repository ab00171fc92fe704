//! Agent-side broker session
//!
//! Opens the WebSocket, performs the register handshake, keeps the roster
//! replica current, emits heartbeats, and exposes send/listen primitives
//! plus typed request helpers with per-class timeouts.

use super::replica::Replica;
use crate::protocol::{
    AgentInfo, BrokerRecord, ChannelInfo, ClientRecord, ReservationMap,
};
use crate::reservation::{find_conflict, normalize_path_in};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

/// Heartbeat cadence; the broker reaps after 60 s of silence.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);

/// Per-class reply timeouts.
pub const DM_TIMEOUT: Duration = Duration::from_secs(120);
pub const CHANNEL_TIMEOUT: Duration = Duration::from_secs(3);
pub const RESERVATION_TIMEOUT: Duration = Duration::from_secs(4);
pub const LIST_TIMEOUT: Duration = Duration::from_secs(2);

const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("broker discovery failed: {0}")]
    Discovery(#[from] crate::discovery::DiscoveryError),
    #[error("registration rejected: {0}")]
    Rejected(String),
    #[error("broker error: {0}")]
    Broker(String),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("operation aborted")]
    Aborted,
    #[error("session closed")]
    Closed,
    #[error("write to '{path}' is blocked: reserved by {owner}{}", reason.as_ref().map(|r| format!(" ({r})")).unwrap_or_default())]
    WriteBlocked {
        path: String,
        owner: String,
        reason: Option<String>,
    },
}

pub type SessionResult<T> = Result<T, SessionError>;

/// Registration fields sent in the first record.
#[derive(Debug, Clone)]
pub struct Registration {
    pub id: String,
    pub name: String,
    pub role: String,
    pub parent_id: Option<String>,
    pub cwd: String,
    pub interactive: bool,
}

/// Opaque handle for deregistering a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&BrokerRecord) + Send + Sync>;

/// A live session to the broker.
pub struct Session {
    agent_id: String,
    cwd: String,
    outbound: mpsc::UnboundedSender<ClientRecord>,
    replica: Mutex<Replica>,
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
    next_listener_id: AtomicU64,
    /// Cancelled by `close()` or transport loss.
    shutdown: CancellationToken,
    /// Host-provided abort signal; fails pending operations promptly.
    abort: CancellationToken,
}

impl Session {
    /// Connect, register, and return once the broker has acknowledged with
    /// the roster snapshot.
    pub async fn connect(url: &str, registration: Registration) -> SessionResult<Arc<Self>> {
        Self::connect_with_abort(url, registration, CancellationToken::new()).await
    }

    /// As [`connect`](Self::connect), with a host abort signal that fails
    /// any pending request promptly when cancelled.
    pub async fn connect_with_abort(
        url: &str,
        registration: Registration,
        abort: CancellationToken,
    ) -> SessionResult<Arc<Self>> {
        let (ws, _response) = tokio_tungstenite::connect_async(url).await?;
        let (mut sink, mut stream) = ws.split();

        let register = ClientRecord::Register {
            id: registration.id.clone(),
            name: registration.name.clone(),
            role: registration.role.clone(),
            parent_id: registration.parent_id.clone(),
            cwd: registration.cwd.clone(),
            interactive: registration.interactive,
        };
        let Ok(text) = serde_json::to_string(&register) else {
            return Err(SessionError::Rejected("unencodable registration".into()));
        };
        sink.send(Message::Text(text)).await?;

        // The only valid reply to `register` is `registered`; an `error`
        // here means the broker turned us away.
        let mut replica = Replica::new();
        let handshake = tokio::time::timeout(REGISTER_TIMEOUT, async {
            loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => {
                        let Ok(record) = serde_json::from_str::<BrokerRecord>(&text) else {
                            continue;
                        };
                        match record {
                            BrokerRecord::Registered { .. } => {
                                replica.apply(&record);
                                return Ok(());
                            }
                            BrokerRecord::Error { message, .. } => {
                                return Err(SessionError::Rejected(message));
                            }
                            _ => {}
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(SessionError::Transport(e)),
                    None => return Err(SessionError::Closed),
                }
            }
        })
        .await
        .map_err(|_| SessionError::Timeout("registration"))?;
        handshake?;

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ClientRecord>();
        let shutdown = CancellationToken::new();

        let session = Arc::new(Self {
            agent_id: registration.id,
            cwd: registration.cwd,
            outbound: outbound_tx,
            replica: Mutex::new(replica),
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
            shutdown: shutdown.clone(),
            abort,
        });

        // Writer: drain the outbound queue onto the socket.
        let writer_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    maybe = outbound_rx.recv() => {
                        let Some(record) = maybe else { break };
                        let Ok(text) = serde_json::to_string(&record) else { continue };
                        if sink.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    () = writer_shutdown.cancelled() => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        });

        // Reader: replica first, then listeners, in registration order.
        let reader_session = session.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = reader_session.shutdown.cancelled() => break,
                    frame = stream.next() => {
                        match frame {
                            Some(Ok(Message::Text(text))) => {
                                match serde_json::from_str::<BrokerRecord>(&text) {
                                    Ok(record) => reader_session.handle_inbound(&record),
                                    Err(_) => {
                                        tracing::debug!("Ignoring undecodable broker record");
                                    }
                                }
                            }
                            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                                reader_session.shutdown.cancel();
                                break;
                            }
                            Some(Ok(_)) => {}
                        }
                    }
                }
            }
        });

        // Heartbeat every 20 s; the first tick fires immediately, which is
        // harmless.
        let heartbeat_session = session.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                tokio::select! {
                    () = heartbeat_session.shutdown.cancelled() => break,
                    _ = ticker.tick() => heartbeat_session.send(ClientRecord::Heartbeat),
                }
            }
        });

        Ok(session)
    }

    fn handle_inbound(&self, record: &BrokerRecord) {
        self.replica.lock().unwrap().apply(record);
        // Snapshot so a listener may deregister (itself included) during
        // dispatch.
        let snapshot: Vec<Listener> = self
            .listeners
            .lock()
            .unwrap()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in snapshot {
            listener(record);
        }
    }

    /// The id this agent registered with.
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Current display name, as resolved (and possibly renamed) by the broker.
    pub fn resolved_name(&self) -> String {
        self.replica
            .lock()
            .unwrap()
            .agent(&self.agent_id)
            .map(|agent| agent.name.clone())
            .unwrap_or_default()
    }

    /// Roster snapshot from the cached replica.
    pub fn agents(&self) -> Vec<AgentInfo> {
        self.replica.lock().unwrap().agents()
    }

    /// Reservation snapshot from the cached replica.
    pub fn reservations(&self) -> ReservationMap {
        self.replica.lock().unwrap().reservations().clone()
    }

    /// Enqueue a record. A no-op once the session is closed.
    pub fn send(&self, record: ClientRecord) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let _ = self.outbound.send(record);
    }

    /// Register a listener invoked for every inbound record, after the
    /// replica has been updated.
    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&BrokerRecord) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().unwrap().push((id, Arc::new(listener)));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) {
        self.listeners.lock().unwrap().retain(|(lid, _)| *lid != id);
    }

    /// Stop the heartbeat and close the transport. Further sends are no-ops.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    // ========================================================================
    // Request helpers
    // ========================================================================

    /// Send `request` and wait for the first inbound record `matcher` accepts.
    /// An `error` record accepted by the matcher fails the call.
    async fn request<F>(
        &self,
        request: ClientRecord,
        matcher: F,
        timeout: Duration,
        what: &'static str,
    ) -> SessionResult<BrokerRecord>
    where
        F: Fn(&BrokerRecord) -> bool + Send + Sync + 'static,
    {
        if self.shutdown.is_cancelled() {
            return Err(SessionError::Closed);
        }

        let (tx, rx) = oneshot::channel::<BrokerRecord>();
        let slot = Mutex::new(Some(tx));
        let listener_id = self.add_listener(move |record| {
            if matcher(record) {
                if let Some(tx) = slot.lock().unwrap().take() {
                    let _ = tx.send(record.clone());
                }
            }
        });

        self.send(request);

        let outcome = tokio::select! {
            received = rx => match received {
                Ok(record) => Ok(record),
                Err(_) => Err(SessionError::Closed),
            },
            () = tokio::time::sleep(timeout) => Err(SessionError::Timeout(what)),
            () = self.abort.cancelled() => Err(SessionError::Aborted),
            () = self.shutdown.cancelled() => Err(SessionError::Closed),
        };
        self.remove_listener(listener_id);

        match outcome? {
            BrokerRecord::Error { message, .. } => Err(SessionError::Broker(message)),
            record => Ok(record),
        }
    }

    /// Fire-and-forget DM.
    pub fn send_dm(&self, to: &str, content: &str) {
        self.send(ClientRecord::Dm {
            to: to.to_string(),
            content: content.to_string(),
            correlation_id: None,
        });
    }

    /// Correlated DM: waits for the bound `dm_response` and returns its
    /// content.
    pub async fn request_dm(&self, to: &str, content: &str) -> SessionResult<String> {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        let wanted = correlation_id.clone();
        let record = self
            .request(
                ClientRecord::Dm {
                    to: to.to_string(),
                    content: content.to_string(),
                    correlation_id: Some(correlation_id),
                },
                move |record| match record {
                    BrokerRecord::DmResponse { correlation_id, .. } => *correlation_id == wanted,
                    BrokerRecord::Error { correlation_id, .. } => {
                        correlation_id.as_deref() == Some(wanted.as_str())
                    }
                    _ => false,
                },
                DM_TIMEOUT,
                "dm response",
            )
            .await?;
        match record {
            BrokerRecord::DmResponse { content, .. } => Ok(content),
            _ => Err(SessionError::Closed),
        }
    }

    /// Reply to a correlated DM.
    pub fn send_dm_response(&self, to: &str, correlation_id: &str, content: &str) {
        self.send(ClientRecord::DmResponse {
            to: to.to_string(),
            correlation_id: correlation_id.to_string(),
            content: content.to_string(),
        });
    }

    pub fn send_broadcast(&self, content: &str) {
        self.send(ClientRecord::Broadcast {
            content: content.to_string(),
        });
    }

    pub async fn create_channel(&self, channel: &str) -> SessionResult<()> {
        let wanted = channel.to_string();
        let name = self.resolved_name();
        self.request(
            ClientRecord::ChannelCreate {
                channel: channel.to_string(),
            },
            move |record| match record {
                BrokerRecord::ChannelCreated { channel, by } => *channel == wanted && *by == name,
                BrokerRecord::Error { .. } => true,
                _ => false,
            },
            CHANNEL_TIMEOUT,
            "channel_created",
        )
        .await
        .map(|_| ())
    }

    pub async fn join_channel(&self, channel: &str) -> SessionResult<()> {
        let wanted = channel.to_string();
        let me = self.agent_id.clone();
        self.request(
            ClientRecord::ChannelJoin {
                channel: channel.to_string(),
            },
            move |record| match record {
                BrokerRecord::ChannelJoined {
                    channel, agent_id, ..
                } => *channel == wanted && *agent_id == me,
                BrokerRecord::Error { .. } => true,
                _ => false,
            },
            CHANNEL_TIMEOUT,
            "channel_joined",
        )
        .await
        .map(|_| ())
    }

    pub async fn leave_channel(&self, channel: &str) -> SessionResult<()> {
        let wanted = channel.to_string();
        let me = self.agent_id.clone();
        self.request(
            ClientRecord::ChannelLeave {
                channel: channel.to_string(),
            },
            move |record| match record {
                BrokerRecord::ChannelLeft {
                    channel, agent_id, ..
                } => *channel == wanted && *agent_id == me,
                BrokerRecord::Error { .. } => true,
                _ => false,
            },
            CHANNEL_TIMEOUT,
            "channel_left",
        )
        .await
        .map(|_| ())
    }

    /// Send to a channel, resolving on the broker's `channel_sent` ack.
    pub async fn send_to_channel(&self, channel: &str, content: &str) -> SessionResult<()> {
        let wanted = channel.to_string();
        self.request(
            ClientRecord::ChannelSend {
                channel: channel.to_string(),
                content: content.to_string(),
            },
            move |record| match record {
                BrokerRecord::ChannelSent { channel } => *channel == wanted,
                BrokerRecord::Error { .. } => true,
                _ => false,
            },
            CHANNEL_TIMEOUT,
            "channel_sent",
        )
        .await
        .map(|_| ())
    }

    /// Reserve paths, resolving relative inputs against this agent's cwd.
    /// Returns the updated reservation map.
    pub async fn reserve(
        &self,
        paths: &[String],
        reason: Option<String>,
    ) -> SessionResult<ReservationMap> {
        let normalized: Vec<String> = paths
            .iter()
            .map(|path| normalize_path_in(&self.cwd, path))
            .collect();
        let record = self
            .request(
                ClientRecord::Reserve {
                    paths: normalized,
                    reason,
                },
                |record| {
                    matches!(
                        record,
                        BrokerRecord::ReservationsUpdated { .. } | BrokerRecord::Error { .. }
                    )
                },
                RESERVATION_TIMEOUT,
                "reservations_updated",
            )
            .await?;
        match record {
            BrokerRecord::ReservationsUpdated { reservations } => Ok(reservations),
            _ => Err(SessionError::Closed),
        }
    }

    /// Release some or all reserved paths. The broker re-broadcasts the map
    /// even for a no-op release, which is what resolves this call.
    pub async fn release(&self, paths: Option<&[String]>) -> SessionResult<ReservationMap> {
        let normalized = paths.map(|paths| {
            paths
                .iter()
                .map(|path| normalize_path_in(&self.cwd, path))
                .collect::<Vec<String>>()
        });
        let record = self
            .request(
                ClientRecord::Release { paths: normalized },
                |record| {
                    matches!(
                        record,
                        BrokerRecord::ReservationsUpdated { .. } | BrokerRecord::Error { .. }
                    )
                },
                RESERVATION_TIMEOUT,
                "reservations_updated",
            )
            .await?;
        match record {
            BrokerRecord::ReservationsUpdated { reservations } => Ok(reservations),
            _ => Err(SessionError::Closed),
        }
    }

    /// Request a new display name; resolves on the broker's `agent_renamed`.
    pub async fn rename(&self, new_name: &str) -> SessionResult<String> {
        let me = self.agent_id.clone();
        let record = self
            .request(
                ClientRecord::Rename {
                    name: new_name.to_string(),
                },
                move |record| match record {
                    BrokerRecord::AgentRenamed { id, .. } => *id == me,
                    BrokerRecord::Error { .. } => true,
                    _ => false,
                },
                CHANNEL_TIMEOUT,
                "agent_renamed",
            )
            .await?;
        match record {
            BrokerRecord::AgentRenamed { new_name, .. } => Ok(new_name),
            _ => Err(SessionError::Closed),
        }
    }

    pub async fn list_agents(&self) -> SessionResult<Vec<AgentInfo>> {
        let record = self
            .request(
                ClientRecord::ListAgents,
                |record| matches!(record, BrokerRecord::AgentList { .. }),
                LIST_TIMEOUT,
                "agent_list",
            )
            .await?;
        match record {
            BrokerRecord::AgentList { agents } => Ok(agents),
            _ => Err(SessionError::Closed),
        }
    }

    pub async fn list_channels(&self) -> SessionResult<Vec<ChannelInfo>> {
        let record = self
            .request(
                ClientRecord::ListChannels,
                |record| matches!(record, BrokerRecord::ChannelList { .. }),
                LIST_TIMEOUT,
                "channel_list",
            )
            .await?;
        match record {
            BrokerRecord::ChannelList { channels } => Ok(channels),
            _ => Err(SessionError::Closed),
        }
    }

    pub fn set_status(&self, status: crate::protocol::AgentStatus) {
        self.send(ClientRecord::StatusUpdate { status });
    }

    pub fn update_presence(&self, status_message: Option<String>, last_activity_at: DateTime<Utc>) {
        self.send(ClientRecord::PresenceUpdate {
            status_message,
            last_activity_at,
        });
    }

    /// Pre-flight write guard: block a file-writing tool call when another
    /// agent holds an overlapping reservation.
    pub fn check_write(&self, path: &str) -> SessionResult<()> {
        let normalized = normalize_path_in(&self.cwd, path);
        let replica = self.replica.lock().unwrap();
        if let Some((owner_id, reservation)) =
            find_conflict(replica.reservations(), &self.agent_id, &normalized)
        {
            let owner = replica
                .agent(owner_id)
                .map_or_else(|| owner_id.to_string(), |agent| agent.name.clone());
            return Err(SessionError::WriteBlocked {
                path: normalized,
                owner,
                reason: reservation.reason.clone(),
            });
        }
        Ok(())
    }
}
