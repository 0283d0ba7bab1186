//! Read-only relay counters and the query datagrams used to fetch them

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelayStats {
    pub registered_hosts: usize,
    pub max_hosts: usize,
    pub active_sessions: usize,
    pub max_clients: usize,
    pub pending_handshakes: usize,
    pub max_pending_handshakes: usize,

    pub blocked_client_ips: usize,
    pub blocked_host_ips: usize,
    pub reject_cooldowns: usize,
    pub host_cooldowns: usize,
    pub authorized_ips: usize,

    pub rate_limited_packets: u64,
    pub handshake_timeouts: u64,
    pub idle_timeouts: u64,
    pub rejected_clients: u64,
    pub rejected_hosts: u64,
    pub rejected_host_packets: u64,

    pub bytes_to_hosts: u64,
    pub bytes_to_clients: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostInfo {
    /// Registration source endpoint, the host's identity inside the relay
    pub key: SocketAddr,
    pub host_id: String,
    /// Where client traffic is forwarded
    pub endpoint: SocketAddr,
    pub current_players: u32,
    pub max_players: u32,
    pub declared_max_players: u32,
    pub seconds_since_seen: f64,
    pub in_cooldown: bool,
    pub rejected_packets: u64,
    pub rate_limit_hits: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub client: SocketAddr,
    pub host_key: SocketAddr,
    pub host_id: String,
    pub bytes_to_host: u64,
    pub bytes_to_client: u64,
    pub handshake_pending: bool,
    pub seconds_since_created: f64,
    /// Seconds left before the idle timeout fires
    pub idle_timeout_remaining: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiagnosticsRequest {
    Stats,
    Hosts,
    Sessions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DiagnosticsResponse {
    Stats(RelayStats),
    Hosts(Vec<HostInfo>),
    Sessions(Vec<SessionInfo>),
}

impl DiagnosticsRequest {
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

impl DiagnosticsResponse {
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}
