//! pi-hive: agent coordination broker for multi-agent chat networks
//!
//! A loopback WebSocket broker owns the live agent roster, routes direct,
//! broadcast, and channel messages, and arbitrates an advisory
//! file-reservation table. This crate provides both ends: the broker engine
//! the hub embeds (or runs via the `pi-hive-broker` binary) and the client
//! session library every agent links, including the inbox that serializes
//! inbound chat into an LLM conversation.

pub mod broker;
pub mod client;
pub mod discovery;
pub mod identity;
pub mod inbox;
pub mod protocol;
pub mod reservation;
