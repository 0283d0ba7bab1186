//! Relay error and rejection types

use std::net::SocketAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to bind {what} socket on {addr}: {source}")]
    Bind {
        what: &'static str,
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("diagnostics encoding failed: {0}")]
    Diagnostics(#[from] bincode::Error),
    #[error("relay task failed: {0}")]
    Task(String),
}

/// Why a host datagram or a client packet was turned away.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    #[error("source is blacklisted or cooling down")]
    Denied,
    #[error("malformed datagram")]
    Malformed,
    #[error("authentication failed")]
    Unauthenticated,
    #[error("timestamp outside the replay window")]
    Stale,
    #[error("host registry is full")]
    RegistryFull,
    #[error("heartbeat from unregistered host")]
    UnknownHost,
    #[error("messages arrive faster than the minimum interval")]
    TooFrequent,
    #[error("relay is at client capacity")]
    ClientsFull,
    #[error("too many pending handshakes")]
    HandshakesFull,
    #[error("no authorization grant for source")]
    Unauthorized,
    #[error("wrong authorization token")]
    BadToken,
    #[error("no host has a free slot")]
    NoEligibleHost,
    #[error("host endpoint is unreachable")]
    HostUnreachable,
}

impl Rejection {
    /// Rejections that count against the source's strike budget.
    pub fn is_strike(&self) -> bool {
        matches!(self, Rejection::Unauthenticated | Rejection::TooFrequent)
    }
}
