pub mod crypto;
pub mod diagnostics;
pub mod protocol;

pub use crypto::{CryptoError, EnvelopeKeys};
pub use diagnostics::{
    DiagnosticsRequest, DiagnosticsResponse, HostInfo, RelayStats, SessionInfo,
};
pub use protocol::{
    auth_datagram, classify_client_datagram, AuthProfile, ClientDatagram, HostAuthenticator,
    HostCommand, ProtocolError, Registration,
};

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Largest UDP payload the relay will read in one receive.
pub const MAX_DATAGRAM_SIZE: usize = 65_535;

pub const DEFAULT_CLIENT_PORT: u16 = 7778;
pub const DEFAULT_HOST_REGISTER_PORT: u16 = 9001;
pub const DEFAULT_GAME_PORT: u16 = 9000;

/// Current Unix time in whole seconds, as carried in registration messages.
pub fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs() as i64
}
