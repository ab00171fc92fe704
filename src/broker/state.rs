//! Authoritative broker state: registry, channel table, reservation table
//!
//! All mutation happens under the broker's single mutex; each inbound record
//! is applied atomically and its fanout is enqueued onto per-session output
//! queues before the lock is released, so every recipient observes a
//! consistent ordering.

use crate::protocol::{AgentInfo, AgentStatus, BrokerRecord, ChannelInfo, ClientRecord};
use crate::reservation::{ReservationTable, ReserveError};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Registration request fields, as carried by the `register` record.
pub(crate) struct RegisterRequest {
    pub id: String,
    pub name: String,
    pub role: String,
    pub parent_id: Option<String>,
    pub cwd: String,
    pub interactive: bool,
}

/// A registered agent plus its session plumbing.
pub(crate) struct ConnectedAgent {
    pub info: AgentInfo,
    outbound: mpsc::UnboundedSender<BrokerRecord>,
    pub last_heartbeat_at: Instant,
    cancel: CancellationToken,
}

pub(crate) struct Channel {
    members: BTreeSet<String>,
    created_by: String,
}

#[derive(Default)]
pub(crate) struct BrokerState {
    /// Agent id -> connected agent. Keys mirror `names` values exactly.
    agents: HashMap<String, ConnectedAgent>,
    /// Display name -> agent id.
    names: HashMap<String, String>,
    channels: BTreeMap<String, Channel>,
    reservations: ReservationTable,
}

impl BrokerState {
    pub fn new() -> Self {
        Self::default()
    }

    fn send_to(&self, agent_id: &str, record: BrokerRecord) {
        if let Some(agent) = self.agents.get(agent_id) {
            // A full queue means the session is going away; disconnect cleanup
            // will handle it.
            let _ = agent.outbound.send(record);
        }
    }

    fn send_to_all(&self, record: &BrokerRecord) {
        for agent in self.agents.values() {
            let _ = agent.outbound.send(record.clone());
        }
    }

    fn send_to_all_except(&self, excluded_id: &str, record: &BrokerRecord) {
        for (id, agent) in &self.agents {
            if id != excluded_id {
                let _ = agent.outbound.send(record.clone());
            }
        }
    }

    fn error_to(&self, agent_id: &str, message: impl Into<String>, correlation_id: Option<String>) {
        self.send_to(
            agent_id,
            BrokerRecord::Error {
                message: message.into(),
                correlation_id,
            },
        );
    }

    /// Smallest free display name: the requested name, else `name-2`,
    /// `name-3`, ...
    fn resolve_name(&self, requested: &str) -> String {
        if !self.names.contains_key(requested) {
            return requested.to_string();
        }
        let mut k = 2u32;
        loop {
            let candidate = format!("{requested}-{k}");
            if !self.names.contains_key(&candidate) {
                return candidate;
            }
            k += 1;
        }
    }

    fn roster(&self) -> Vec<AgentInfo> {
        let mut agents: Vec<AgentInfo> =
            self.agents.values().map(|agent| agent.info.clone()).collect();
        agents.sort_by(|a, b| a.name.cmp(&b.name));
        agents
    }

    /// Install a new agent. Replies `registered` to the newcomer and fans out
    /// `agent_joined` to everyone else. Returns the resolved agent id, or
    /// `Err` with the rejection message.
    pub fn register(
        &mut self,
        request: RegisterRequest,
        outbound: mpsc::UnboundedSender<BrokerRecord>,
        cancel: CancellationToken,
    ) -> Result<String, String> {
        if self.agents.contains_key(&request.id) {
            return Err(format!("Agent id '{}' is already connected", request.id));
        }

        let name = self.resolve_name(&request.name);
        let info = AgentInfo {
            id: request.id.clone(),
            name: name.clone(),
            role: request.role,
            parent_id: request.parent_id,
            cwd: request.cwd,
            status: AgentStatus::Idle,
            channels: BTreeSet::new(),
            interactive: request.interactive,
            status_message: None,
            last_activity_at: Utc::now(),
        };

        tracing::info!(agent = %name, id = %request.id, "Agent registered");

        self.names.insert(name, request.id.clone());
        self.agents.insert(
            request.id.clone(),
            ConnectedAgent {
                info: info.clone(),
                outbound,
                last_heartbeat_at: Instant::now(),
                cancel,
            },
        );

        self.send_to(
            &request.id,
            BrokerRecord::Registered {
                id: request.id.clone(),
                agents: self.roster(),
                reservations: self.reservations.snapshot(),
            },
        );
        self.send_to_all_except(&request.id, &BrokerRecord::AgentJoined { agent: info });

        Ok(request.id)
    }

    /// Remove an agent and everything it owns. Idempotent.
    pub fn disconnect(&mut self, agent_id: &str) {
        let Some(agent) = self.agents.remove(agent_id) else {
            return;
        };
        let name = agent.info.name.clone();
        self.names.remove(&name);

        self.channels.retain(|_, channel| {
            channel.members.remove(agent_id);
            !channel.members.is_empty()
        });

        if self.reservations.remove_agent(agent_id) {
            self.send_to_all(&BrokerRecord::ReservationsUpdated {
                reservations: self.reservations.snapshot(),
            });
        }

        tracing::info!(agent = %name, id = %agent_id, "Agent disconnected");
        self.send_to_all(&BrokerRecord::AgentLeft {
            id: agent_id.to_string(),
            name,
        });

        agent.cancel.cancel();
    }

    /// Administrative eviction used by the hub. Returns whether the name was
    /// registered.
    pub fn disconnect_by_name(&mut self, name: &str) -> bool {
        match self.names.get(name).cloned() {
            Some(id) => {
                self.disconnect(&id);
                true
            }
            None => false,
        }
    }

    /// Force-disconnect every agent whose last heartbeat is older than
    /// `timeout`. Returns the evicted (id, name) pairs.
    pub fn sweep_stale(&mut self, timeout: Duration) -> Vec<(String, String)> {
        let stale: Vec<(String, String)> = self
            .agents
            .iter()
            .filter(|(_, agent)| agent.last_heartbeat_at.elapsed() > timeout)
            .map(|(id, agent)| (id.clone(), agent.info.name.clone()))
            .collect();
        for (id, _) in &stale {
            self.disconnect(id);
        }
        stale
    }

    /// Apply a post-registration record from `agent_id`.
    pub fn handle_record(&mut self, agent_id: &str, record: ClientRecord) {
        match record {
            ClientRecord::Register { .. } => {
                self.error_to(agent_id, "Already registered", None);
            }
            ClientRecord::Dm {
                to,
                content,
                correlation_id,
            } => self.handle_dm(agent_id, &to, content, correlation_id),
            ClientRecord::DmResponse {
                to,
                correlation_id,
                content,
            } => self.handle_dm_response(agent_id, &to, correlation_id, content),
            ClientRecord::Broadcast { content } => {
                let (from, from_name) = self.identity(agent_id);
                self.send_to_all_except(
                    agent_id,
                    &BrokerRecord::Broadcast {
                        from,
                        from_name,
                        content,
                    },
                );
            }
            ClientRecord::ChannelCreate { channel } => self.handle_channel_create(agent_id, channel),
            ClientRecord::ChannelJoin { channel } => self.handle_channel_join(agent_id, &channel),
            ClientRecord::ChannelLeave { channel } => self.handle_channel_leave(agent_id, &channel),
            ClientRecord::ChannelSend { channel, content } => {
                self.handle_channel_send(agent_id, &channel, content);
            }
            ClientRecord::ListAgents => {
                let agents = self.roster();
                self.send_to(agent_id, BrokerRecord::AgentList { agents });
            }
            ClientRecord::ListChannels => {
                let channels = self
                    .channels
                    .iter()
                    .map(|(name, channel)| ChannelInfo {
                        name: name.clone(),
                        members: channel.members.iter().cloned().collect(),
                        created_by: channel.created_by.clone(),
                    })
                    .collect();
                self.send_to(agent_id, BrokerRecord::ChannelList { channels });
            }
            ClientRecord::Reserve { paths, reason } => self.handle_reserve(agent_id, &paths, reason),
            ClientRecord::Release { paths } => {
                self.reservations.release(agent_id, paths.as_deref());
                self.send_to_all(&BrokerRecord::ReservationsUpdated {
                    reservations: self.reservations.snapshot(),
                });
            }
            ClientRecord::Rename { name } => self.handle_rename(agent_id, name),
            ClientRecord::PresenceUpdate {
                status_message,
                last_activity_at,
            } => self.handle_presence_update(agent_id, status_message, last_activity_at),
            ClientRecord::StatusUpdate { status } => self.handle_status_update(agent_id, status),
            ClientRecord::Heartbeat => {
                if let Some(agent) = self.agents.get_mut(agent_id) {
                    agent.last_heartbeat_at = Instant::now();
                }
                self.send_to(agent_id, BrokerRecord::HeartbeatAck);
            }
        }
    }

    fn identity(&self, agent_id: &str) -> (String, String) {
        self.agents
            .get(agent_id)
            .map(|agent| (agent.info.id.clone(), agent.info.name.clone()))
            .unwrap_or_else(|| (agent_id.to_string(), String::new()))
    }

    fn handle_dm(
        &mut self,
        sender_id: &str,
        to: &str,
        content: String,
        correlation_id: Option<String>,
    ) {
        let Some(target_id) = self.names.get(to).cloned() else {
            self.error_to(
                sender_id,
                format!("Agent '{to}' is not online"),
                correlation_id,
            );
            return;
        };
        let (from, from_name) = self.identity(sender_id);
        self.send_to(
            &target_id,
            BrokerRecord::Dm {
                from,
                from_name,
                content,
                correlation_id,
            },
        );
    }

    fn handle_dm_response(
        &mut self,
        sender_id: &str,
        to: &str,
        correlation_id: String,
        content: String,
    ) {
        let Some(target_id) = self.names.get(to).cloned() else {
            // Response to a requester that has since vanished.
            tracing::debug!(to = %to, correlation_id = %correlation_id, "Dropping dm_response to unknown agent");
            return;
        };
        let (from, from_name) = self.identity(sender_id);
        self.send_to(
            &target_id,
            BrokerRecord::DmResponse {
                from,
                from_name,
                correlation_id,
                content,
            },
        );
    }

    fn handle_channel_create(&mut self, sender_id: &str, channel: String) {
        if channel.is_empty() {
            self.error_to(sender_id, "Channel name cannot be empty", None);
            return;
        }
        if self.channels.contains_key(&channel) {
            self.error_to(sender_id, format!("Channel '{channel}' already exists"), None);
            return;
        }
        let (_, sender_name) = self.identity(sender_id);
        self.channels.insert(
            channel.clone(),
            Channel {
                members: BTreeSet::from([sender_id.to_string()]),
                created_by: sender_name.clone(),
            },
        );
        if let Some(agent) = self.agents.get_mut(sender_id) {
            agent.info.channels.insert(channel.clone());
        }
        tracing::debug!(channel = %channel, by = %sender_name, "Channel created");
        self.send_to_all(&BrokerRecord::ChannelCreated {
            channel,
            by: sender_name,
        });
    }

    fn handle_channel_join(&mut self, sender_id: &str, channel_name: &str) {
        let Some(channel) = self.channels.get_mut(channel_name) else {
            self.error_to(
                sender_id,
                format!("Channel '{channel_name}' does not exist"),
                None,
            );
            return;
        };
        channel.members.insert(sender_id.to_string());
        let members: Vec<String> = channel.members.iter().cloned().collect();
        let (agent_id, agent_name) = self.identity(sender_id);
        if let Some(agent) = self.agents.get_mut(sender_id) {
            agent.info.channels.insert(channel_name.to_string());
        }
        let record = BrokerRecord::ChannelJoined {
            channel: channel_name.to_string(),
            agent_id,
            agent_name,
        };
        for member in members {
            self.send_to(&member, record.clone());
        }
    }

    fn handle_channel_leave(&mut self, sender_id: &str, channel_name: &str) {
        let Some(channel) = self.channels.get_mut(channel_name) else {
            self.error_to(
                sender_id,
                format!("Channel '{channel_name}' does not exist"),
                None,
            );
            return;
        };
        if !channel.members.remove(sender_id) {
            self.error_to(
                sender_id,
                format!("Not a member of channel '{channel_name}'"),
                None,
            );
            return;
        }
        let remaining: Vec<String> = channel.members.iter().cloned().collect();
        if remaining.is_empty() {
            self.channels.remove(channel_name);
            tracing::debug!(channel = %channel_name, "Channel deleted (last member left)");
        }

        let (agent_id, agent_name) = self.identity(sender_id);
        if let Some(agent) = self.agents.get_mut(sender_id) {
            agent.info.channels.remove(channel_name);
        }

        let record = BrokerRecord::ChannelLeft {
            channel: channel_name.to_string(),
            agent_id,
            agent_name,
        };
        self.send_to(sender_id, record.clone());
        for member in remaining {
            self.send_to(&member, record.clone());
        }
    }

    fn handle_channel_send(&mut self, sender_id: &str, channel_name: &str, content: String) {
        let Some(channel) = self.channels.get(channel_name) else {
            self.error_to(
                sender_id,
                format!("Channel '{channel_name}' does not exist"),
                None,
            );
            return;
        };
        if !channel.members.contains(sender_id) {
            self.error_to(
                sender_id,
                format!("Not a member of channel '{channel_name}'"),
                None,
            );
            return;
        }
        let members: Vec<String> = channel.members.iter().cloned().collect();
        let (from, from_name) = self.identity(sender_id);
        let record = BrokerRecord::ChannelMessage {
            channel: channel_name.to_string(),
            from,
            from_name,
            content,
        };
        for member in members {
            if member != sender_id {
                self.send_to(&member, record.clone());
            }
        }
        self.send_to(
            sender_id,
            BrokerRecord::ChannelSent {
                channel: channel_name.to_string(),
            },
        );
    }

    fn handle_reserve(&mut self, sender_id: &str, paths: &[String], reason: Option<String>) {
        match self.reservations.reserve(sender_id, paths, reason) {
            Ok(()) => {
                self.send_to_all(&BrokerRecord::ReservationsUpdated {
                    reservations: self.reservations.snapshot(),
                });
            }
            Err(ReserveError::Conflict {
                path,
                owner_id,
                reason,
            }) => {
                // Attribute the conflict so the requester can negotiate.
                let owner_name = self
                    .agents
                    .get(&owner_id)
                    .map_or(owner_id.clone(), |agent| agent.info.name.clone());
                let message = match reason {
                    Some(reason) => {
                        format!("Path '{path}' is already reserved by {owner_name} ({reason})")
                    }
                    None => format!("Path '{path}' is already reserved by {owner_name}"),
                };
                self.error_to(sender_id, message, None);
            }
            Err(err) => self.error_to(sender_id, err.to_string(), None),
        }
    }

    fn handle_rename(&mut self, agent_id: &str, new_name: String) {
        let (_, old_name) = self.identity(agent_id);
        if new_name.is_empty() {
            self.error_to(agent_id, "Name cannot be empty", None);
            return;
        }
        if new_name != old_name {
            if self.names.contains_key(&new_name) {
                self.error_to(agent_id, format!("Name '{new_name}' is already taken"), None);
                return;
            }
            self.names.remove(&old_name);
            self.names.insert(new_name.clone(), agent_id.to_string());
            if let Some(agent) = self.agents.get_mut(agent_id) {
                agent.info.name = new_name.clone();
            }
            // createdBy is a display attribution; keep it pointing at the
            // current name.
            for channel in self.channels.values_mut() {
                if channel.created_by == old_name {
                    channel.created_by = new_name.clone();
                }
            }
        }
        // A no-op rename still acknowledges, so callers can await the
        // agent_renamed uniformly.
        self.send_to_all(&BrokerRecord::AgentRenamed {
            id: agent_id.to_string(),
            old_name,
            new_name,
        });
    }

    fn handle_presence_update(
        &mut self,
        agent_id: &str,
        status_message: Option<String>,
        last_activity_at: DateTime<Utc>,
    ) {
        let Some(agent) = self.agents.get_mut(agent_id) else {
            return;
        };
        agent.info.status_message = status_message;
        agent.info.last_activity_at = last_activity_at;
        self.emit_status_changed(agent_id);
    }

    fn handle_status_update(&mut self, agent_id: &str, status: AgentStatus) {
        let Some(agent) = self.agents.get_mut(agent_id) else {
            return;
        };
        agent.info.status = status;
        self.emit_status_changed(agent_id);
    }

    /// Full (status, statusMessage, lastActivityAt) snapshot to everyone but
    /// the agent itself.
    fn emit_status_changed(&self, agent_id: &str) {
        let Some(agent) = self.agents.get(agent_id) else {
            return;
        };
        self.send_to_all_except(
            agent_id,
            &BrokerRecord::StatusChanged {
                id: agent.info.id.clone(),
                name: agent.info.name.clone(),
                status: agent.info.status,
                status_message: agent.info.status_message.clone(),
                last_activity_at: Some(agent.info.last_activity_at),
            },
        );
    }

    /// Reply to a frame from a session that has not registered yet.
    pub fn reject_unregistered(
        outbound: &mpsc::UnboundedSender<BrokerRecord>,
        message: impl Into<String>,
    ) {
        let _ = outbound.send(BrokerRecord::Error {
            message: message.into(),
            correlation_id: None,
        });
    }

    #[cfg(test)]
    pub fn age_heartbeat(&mut self, agent_id: &str, age: Duration) {
        if let Some(agent) = self.agents.get_mut(agent_id) {
            if let Some(then) = Instant::now().checked_sub(age) {
                agent.last_heartbeat_at = then;
            }
        }
    }

    #[cfg(test)]
    pub fn names_and_registry_agree(&self) -> bool {
        use std::collections::HashSet;
        let from_names: HashSet<&String> = self.names.values().collect();
        let from_registry: HashSet<&String> = self.agents.keys().collect();
        from_names == from_registry && self.names.len() == self.agents.len()
    }

    #[cfg(test)]
    pub fn channel_members_are_registered(&self) -> bool {
        self.channels.values().all(|channel| {
            !channel.members.is_empty()
                && channel.members.iter().all(|id| self.agents.contains_key(id))
        })
    }
}
