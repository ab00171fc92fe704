//! Broker discovery sidecar
//!
//! The hub writes `<system temp>/pi-hive/broker.json` once at startup and
//! removes it at shutdown. Child agents that were not handed a broker URL
//! read it to find one. Its absence is never fatal to a running broker.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("sidecar io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed sidecar: {0}")]
    Malformed(#[from] serde_json::Error),
}

pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// Contents of `broker.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerInfo {
    pub port: u16,
    pub pid: u32,
    pub hub_id: String,
    /// Epoch millis.
    pub started_at: i64,
}

impl BrokerInfo {
    /// Describe the current process as the hub for `port`.
    pub fn new(port: u16, hub_id: impl Into<String>) -> Self {
        Self {
            port,
            pid: std::process::id(),
            hub_id: hub_id.into(),
            started_at: Utc::now().timestamp_millis(),
        }
    }
}

/// Default sidecar location.
pub fn sidecar_path() -> PathBuf {
    std::env::temp_dir().join("pi-hive").join("broker.json")
}

/// Loopback WebSocket URL for a discovered broker.
pub fn broker_url(info: &BrokerInfo) -> String {
    format!("ws://127.0.0.1:{}/", info.port)
}

pub fn publish(info: &BrokerInfo) -> DiscoveryResult<PathBuf> {
    let path = sidecar_path();
    publish_at(&path, info)?;
    Ok(path)
}

pub fn publish_at(path: &Path, info: &BrokerInfo) -> DiscoveryResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_vec_pretty(info)?)?;
    Ok(())
}

pub fn read() -> DiscoveryResult<BrokerInfo> {
    read_at(&sidecar_path())
}

pub fn read_at(path: &Path) -> DiscoveryResult<BrokerInfo> {
    let bytes = std::fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Remove the sidecar. Already-absent is not an error.
pub fn remove() -> DiscoveryResult<()> {
    remove_at(&sidecar_path())
}

pub fn remove_at(path: &Path) -> DiscoveryResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_read_remove_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pi-hive").join("broker.json");

        let info = BrokerInfo::new(43210, "hub-001");
        publish_at(&path, &info).unwrap();

        let read_back = read_at(&path).unwrap();
        assert_eq!(read_back, info);
        assert_eq!(broker_url(&read_back), "ws://127.0.0.1:43210/");

        remove_at(&path).unwrap();
        assert!(read_at(&path).is_err());
        // Removing again is fine.
        remove_at(&path).unwrap();
    }

    #[test]
    fn sidecar_uses_camel_case_fields() {
        let info = BrokerInfo {
            port: 1,
            pid: 2,
            hub_id: "h".into(),
            started_at: 3,
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["hubId"], "h");
        assert_eq!(json["startedAt"], 3);
    }
}
