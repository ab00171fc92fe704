//! Cached mirror of the broker's roster and reservation map
//!
//! Full snapshots (`registered`, `agent_list`, `reservations_updated`)
//! replace the cache; delta records refine it. Updates are applied before
//! user listeners run, so callbacks always observe consistent state.

use crate::protocol::{AgentInfo, BrokerRecord, ReservationMap};
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct Replica {
    agents: HashMap<String, AgentInfo>,
    reservations: ReservationMap,
}

impl Replica {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, record: &BrokerRecord) {
        match record {
            BrokerRecord::Registered {
                agents,
                reservations,
                ..
            } => {
                self.agents = agents
                    .iter()
                    .map(|agent| (agent.id.clone(), agent.clone()))
                    .collect();
                self.reservations = reservations.clone();
            }
            BrokerRecord::AgentJoined { agent } => {
                self.agents.insert(agent.id.clone(), agent.clone());
            }
            BrokerRecord::AgentLeft { id, .. } => {
                self.agents.remove(id);
            }
            BrokerRecord::AgentRenamed { id, new_name, .. } => {
                if let Some(agent) = self.agents.get_mut(id) {
                    agent.name = new_name.clone();
                }
            }
            BrokerRecord::AgentList { agents } => {
                self.agents = agents
                    .iter()
                    .map(|agent| (agent.id.clone(), agent.clone()))
                    .collect();
            }
            BrokerRecord::ReservationsUpdated { reservations } => {
                self.reservations = reservations.clone();
            }
            BrokerRecord::StatusChanged {
                id,
                status,
                status_message,
                last_activity_at,
                ..
            } => {
                if let Some(agent) = self.agents.get_mut(id) {
                    agent.status = *status;
                    agent.status_message = status_message.clone();
                    if let Some(at) = last_activity_at {
                        agent.last_activity_at = *at;
                    }
                }
            }
            BrokerRecord::ChannelCreated { channel, by } => {
                if let Some(agent) = self.agents.values_mut().find(|agent| agent.name == *by) {
                    agent.channels.insert(channel.clone());
                }
            }
            BrokerRecord::ChannelJoined {
                channel, agent_id, ..
            } => {
                if let Some(agent) = self.agents.get_mut(agent_id) {
                    agent.channels.insert(channel.clone());
                }
            }
            BrokerRecord::ChannelLeft {
                channel, agent_id, ..
            } => {
                if let Some(agent) = self.agents.get_mut(agent_id) {
                    agent.channels.remove(channel);
                }
            }
            _ => {}
        }
    }

    pub fn agent(&self, id: &str) -> Option<&AgentInfo> {
        self.agents.get(id)
    }

    pub fn agent_by_name(&self, name: &str) -> Option<&AgentInfo> {
        self.agents.values().find(|agent| agent.name == name)
    }

    /// Roster snapshot, sorted by display name.
    pub fn agents(&self) -> Vec<AgentInfo> {
        let mut agents: Vec<AgentInfo> = self.agents.values().cloned().collect();
        agents.sort_by(|a, b| a.name.cmp(&b.name));
        agents
    }

    pub fn reservations(&self) -> &ReservationMap {
        &self.reservations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{AgentStatus, Reservation};
    use chrono::Utc;
    use std::collections::BTreeSet;

    fn agent(id: &str, name: &str) -> AgentInfo {
        AgentInfo {
            id: id.into(),
            name: name.into(),
            role: "worker".into(),
            parent_id: None,
            cwd: "/repo".into(),
            status: AgentStatus::Idle,
            channels: BTreeSet::new(),
            interactive: true,
            status_message: None,
            last_activity_at: Utc::now(),
        }
    }

    #[test]
    fn snapshot_then_deltas() {
        let mut replica = Replica::new();
        replica.apply(&BrokerRecord::Registered {
            id: "a".into(),
            agents: vec![agent("a", "hub"), agent("b", "scout")],
            reservations: ReservationMap::new(),
        });
        assert_eq!(replica.agents().len(), 2);

        replica.apply(&BrokerRecord::AgentJoined {
            agent: agent("c", "worker"),
        });
        assert!(replica.agent_by_name("worker").is_some());

        replica.apply(&BrokerRecord::AgentLeft {
            id: "b".into(),
            name: "scout".into(),
        });
        assert!(replica.agent_by_name("scout").is_none());
    }

    #[test]
    fn rename_is_idempotent_under_replay() {
        let mut replica = Replica::new();
        replica.apply(&BrokerRecord::AgentJoined {
            agent: agent("a", "scout"),
        });

        let rename = BrokerRecord::AgentRenamed {
            id: "a".into(),
            old_name: "scout".into(),
            new_name: "scout".into(),
        };
        // The broker emits agent_renamed even for no-op renames; applying it
        // twice must not double-account.
        replica.apply(&rename);
        replica.apply(&rename);
        assert_eq!(replica.agents().len(), 1);
        assert_eq!(replica.agent("a").unwrap().name, "scout");
    }

    #[test]
    fn status_changed_updates_presence_triple() {
        let mut replica = Replica::new();
        replica.apply(&BrokerRecord::AgentJoined {
            agent: agent("a", "scout"),
        });

        let at = Utc::now();
        replica.apply(&BrokerRecord::StatusChanged {
            id: "a".into(),
            name: "scout".into(),
            status: AgentStatus::Busy,
            status_message: Some("exploring".into()),
            last_activity_at: Some(at),
        });

        let cached = replica.agent("a").unwrap();
        assert_eq!(cached.status, AgentStatus::Busy);
        assert_eq!(cached.status_message.as_deref(), Some("exploring"));
        assert_eq!(cached.last_activity_at, at);
    }

    #[test]
    fn channel_records_maintain_membership_sets() {
        let mut replica = Replica::new();
        replica.apply(&BrokerRecord::AgentJoined {
            agent: agent("a", "hub"),
        });
        replica.apply(&BrokerRecord::AgentJoined {
            agent: agent("b", "scout"),
        });

        replica.apply(&BrokerRecord::ChannelCreated {
            channel: "dev".into(),
            by: "hub".into(),
        });
        assert!(replica.agent("a").unwrap().channels.contains("dev"));

        replica.apply(&BrokerRecord::ChannelJoined {
            channel: "dev".into(),
            agent_id: "b".into(),
            agent_name: "scout".into(),
        });
        assert!(replica.agent("b").unwrap().channels.contains("dev"));

        replica.apply(&BrokerRecord::ChannelLeft {
            channel: "dev".into(),
            agent_id: "b".into(),
            agent_name: "scout".into(),
        });
        assert!(!replica.agent("b").unwrap().channels.contains("dev"));
    }

    #[test]
    fn reservations_updated_replaces_the_map() {
        let mut replica = Replica::new();
        let mut map = ReservationMap::new();
        map.insert(
            "a".into(),
            Reservation {
                paths: vec!["/repo/x".into()],
                reason: None,
            },
        );
        replica.apply(&BrokerRecord::ReservationsUpdated {
            reservations: map.clone(),
        });
        assert_eq!(replica.reservations(), &map);

        replica.apply(&BrokerRecord::ReservationsUpdated {
            reservations: ReservationMap::new(),
        });
        assert!(replica.reservations().is_empty());
    }
}
