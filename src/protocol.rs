//! Wire protocol for broker <-> agent sessions
//!
//! Every WebSocket text frame carries exactly one JSON object with a `type`
//! tag. Record tags are snake_case, field names camelCase.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Coarse agent lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Idle,
    Busy,
    Done,
}

/// Externally visible identity of a connected agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInfo {
    pub id: String,
    pub name: String,
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub cwd: String,
    pub status: AgentStatus,
    pub channels: BTreeSet<String>,
    pub interactive: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    pub last_activity_at: DateTime<Utc>,
}

/// One agent's advisory claim on a set of paths.
///
/// Paths are stored in normalized form (see the `reservation` module) and
/// deduplicated, preserving first-reserve order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reservation {
    pub paths: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Agent id -> that agent's reservation. Agents with no reservation are absent.
pub type ReservationMap = BTreeMap<String, Reservation>;

/// Channel summary returned by `list_channels`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelInfo {
    pub name: String,
    /// Member agent ids.
    pub members: Vec<String>,
    /// Display name of the creator at creation time (attribution, not identity).
    pub created_by: String,
}

/// Records an agent sends to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientRecord {
    Register {
        id: String,
        name: String,
        role: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_id: Option<String>,
        cwd: String,
        interactive: bool,
    },
    Dm {
        to: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        correlation_id: Option<String>,
    },
    DmResponse {
        to: String,
        correlation_id: String,
        content: String,
    },
    Broadcast {
        content: String,
    },
    ChannelCreate {
        channel: String,
    },
    ChannelJoin {
        channel: String,
    },
    ChannelLeave {
        channel: String,
    },
    ChannelSend {
        channel: String,
        content: String,
    },
    ListAgents,
    ListChannels,
    Reserve {
        paths: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Release {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        paths: Option<Vec<String>>,
    },
    Rename {
        name: String,
    },
    PresenceUpdate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status_message: Option<String>,
        last_activity_at: DateTime<Utc>,
    },
    StatusUpdate {
        status: AgentStatus,
    },
    Heartbeat,
}

impl ClientRecord {
    /// Tags this broker understands. A frame whose `type` is not listed here
    /// is ignored rather than answered with an error.
    pub const KNOWN_TYPES: &'static [&'static str] = &[
        "register",
        "dm",
        "dm_response",
        "broadcast",
        "channel_create",
        "channel_join",
        "channel_leave",
        "channel_send",
        "list_agents",
        "list_channels",
        "reserve",
        "release",
        "rename",
        "presence_update",
        "status_update",
        "heartbeat",
    ];

    pub fn is_known_type(tag: &str) -> bool {
        Self::KNOWN_TYPES.contains(&tag)
    }
}

/// Records the broker sends to an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum BrokerRecord {
    Registered {
        id: String,
        agents: Vec<AgentInfo>,
        reservations: ReservationMap,
    },
    AgentJoined {
        agent: AgentInfo,
    },
    AgentLeft {
        id: String,
        name: String,
    },
    AgentRenamed {
        id: String,
        old_name: String,
        new_name: String,
    },
    Dm {
        from: String,
        from_name: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        correlation_id: Option<String>,
    },
    DmResponse {
        from: String,
        from_name: String,
        correlation_id: String,
        content: String,
    },
    Broadcast {
        from: String,
        from_name: String,
        content: String,
    },
    ChannelCreated {
        channel: String,
        by: String,
    },
    ChannelJoined {
        channel: String,
        agent_id: String,
        agent_name: String,
    },
    ChannelLeft {
        channel: String,
        agent_id: String,
        agent_name: String,
    },
    ChannelMessage {
        channel: String,
        from: String,
        from_name: String,
        content: String,
    },
    ChannelSent {
        channel: String,
    },
    AgentList {
        agents: Vec<AgentInfo>,
    },
    ChannelList {
        channels: Vec<ChannelInfo>,
    },
    ReservationsUpdated {
        reservations: ReservationMap,
    },
    StatusChanged {
        id: String,
        name: String,
        status: AgentStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status_message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_activity_at: Option<DateTime<Utc>>,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        correlation_id: Option<String>,
    },
    HeartbeatAck,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_agent() -> AgentInfo {
        AgentInfo {
            id: "scout-001".into(),
            name: "scout".into(),
            role: "explorer".into(),
            parent_id: Some("hub-001".into()),
            cwd: "/repo".into(),
            status: AgentStatus::Idle,
            channels: BTreeSet::from(["dev".to_string()]),
            interactive: false,
            status_message: Some("exploring".into()),
            last_activity_at: Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn records_use_snake_case_tags_and_camel_case_fields() {
        let record = ClientRecord::Dm {
            to: "scout".into(),
            content: "hello".into(),
            correlation_id: Some("c1".into()),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["type"], "dm");
        assert_eq!(json["correlationId"], "c1");

        let record = BrokerRecord::AgentRenamed {
            id: "a".into(),
            old_name: "scout".into(),
            new_name: "worker".into(),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["type"], "agent_renamed");
        assert_eq!(json["oldName"], "scout");
        assert_eq!(json["newName"], "worker");
    }

    #[test]
    fn agent_info_round_trips_with_iso_timestamp() {
        let agent = sample_agent();
        let json = serde_json::to_value(&agent).unwrap();
        assert_eq!(json["parentId"], "hub-001");
        assert_eq!(json["lastActivityAt"], "2025-06-01T12:00:00Z");
        let back: AgentInfo = serde_json::from_value(json).unwrap();
        assert_eq!(back, agent);
    }

    #[test]
    fn optional_fields_may_be_absent() {
        let record: ClientRecord =
            serde_json::from_str(r#"{"type":"dm","to":"scout","content":"hi"}"#).unwrap();
        assert_eq!(
            record,
            ClientRecord::Dm {
                to: "scout".into(),
                content: "hi".into(),
                correlation_id: None,
            }
        );

        let record: ClientRecord = serde_json::from_str(r#"{"type":"release"}"#).unwrap();
        assert_eq!(record, ClientRecord::Release { paths: None });
    }

    #[test]
    fn unknown_fields_within_a_known_tag_are_ignored() {
        let record: ClientRecord =
            serde_json::from_str(r#"{"type":"heartbeat","extra":42}"#).unwrap();
        assert_eq!(record, ClientRecord::Heartbeat);
    }

    #[test]
    fn known_type_table_matches_serialization() {
        for record in [
            ClientRecord::ListAgents,
            ClientRecord::ListChannels,
            ClientRecord::Heartbeat,
            ClientRecord::Broadcast { content: "x".into() },
        ] {
            let json = serde_json::to_value(&record).unwrap();
            let tag = json["type"].as_str().unwrap();
            assert!(ClientRecord::is_known_type(tag), "missing tag {tag}");
        }
        assert!(!ClientRecord::is_known_type("shutdown"));
    }
}
