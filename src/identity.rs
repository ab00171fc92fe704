//! Agent identity inputs
//!
//! Every agent process learns who it is at startup from CLI flags or
//! environment variables carrying the same semantics; flags win. The broker
//! URL may be omitted entirely, in which case the discovery sidecar supplies
//! it.

use crate::client::{Registration, Session, SessionResult};
use crate::discovery;
use clap::Parser;
use std::sync::Arc;

#[derive(Parser, Debug, Clone)]
#[command(name = "pi-hive-agent", about = "Identity of one hive agent")]
pub struct AgentIdentity {
    /// Broker WebSocket URL. Falls back to the discovery sidecar.
    #[arg(long, env = "PI_HIVE_BROKER_URL")]
    pub broker_url: Option<String>,

    /// Requested display name; the broker may suffix it for uniqueness.
    #[arg(long = "agent-name", env = "PI_HIVE_NAME")]
    pub name: String,

    /// Self-assigned opaque id. Generated when omitted.
    #[arg(long = "agent-id", env = "PI_HIVE_ID")]
    pub id: Option<String>,

    /// Id of the agent that spawned this one, if any.
    #[arg(long, env = "PI_HIVE_PARENT_ID")]
    pub parent_id: Option<String>,

    /// Free-form role description.
    #[arg(long, env = "PI_HIVE_ROLE", default_value = "agent")]
    pub role: String,

    /// Non-interactive agents may self-terminate once done.
    #[arg(long, env = "PI_HIVE_INTERACTIVE")]
    pub interactive: bool,
}

impl AgentIdentity {
    /// Registration record fields for this identity, declaring the current
    /// working directory.
    pub fn registration(&self) -> Registration {
        Registration {
            id: self
                .id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            name: self.name.clone(),
            role: self.role.clone(),
            parent_id: self.parent_id.clone(),
            cwd: std::env::current_dir()
                .map(|dir| dir.display().to_string())
                .unwrap_or_else(|_| "/".to_string()),
            interactive: self.interactive,
        }
    }

    /// The configured broker URL, or the one advertised by the sidecar.
    pub fn resolve_broker_url(&self) -> SessionResult<String> {
        if let Some(url) = &self.broker_url {
            return Ok(url.clone());
        }
        let info = discovery::read()?;
        Ok(discovery::broker_url(&info))
    }

    /// Resolve the broker and open a registered session.
    pub async fn connect(&self) -> SessionResult<Arc<Session>> {
        let url = self.resolve_broker_url()?;
        Session::connect(&url, self.registration()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flags() {
        let identity = AgentIdentity::try_parse_from([
            "agent",
            "--broker-url",
            "ws://127.0.0.1:4500/",
            "--agent-name",
            "scout",
            "--agent-id",
            "scout-001",
            "--parent-id",
            "hub-001",
            "--role",
            "explorer",
            "--interactive",
        ])
        .unwrap();

        assert_eq!(identity.broker_url.as_deref(), Some("ws://127.0.0.1:4500/"));
        assert_eq!(identity.name, "scout");
        assert_eq!(identity.id.as_deref(), Some("scout-001"));
        assert_eq!(identity.parent_id.as_deref(), Some("hub-001"));
        assert_eq!(identity.role, "explorer");
        assert!(identity.interactive);
    }

    #[test]
    fn defaults_apply() {
        let identity =
            AgentIdentity::try_parse_from(["agent", "--agent-name", "scout"]).unwrap();
        assert_eq!(identity.role, "agent");
        assert!(!identity.interactive);
        assert!(identity.id.is_none());

        let registration = identity.registration();
        // Omitted ids are generated, 128-bit unique.
        assert!(!registration.id.is_empty());
        assert!(uuid::Uuid::parse_str(&registration.id).is_ok());
    }
}
