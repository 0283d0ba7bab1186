//! # UDP Rendezvous Relay
//!
//! This library implements a public relay that sits between game clients and
//! game hosts that are usually hidden behind NAT. Hosts register with the
//! relay, clients connect to the relay's public port, and the relay binds
//! each client to a host and forwards datagrams in both directions.
//!
//! ## Core Responsibilities
//!
//! ### Host Registry
//! Hosts periodically send signed REGISTER/HEARTBEAT datagrams. The registry
//! authenticates them, rejects replays, enforces a minimum interval between
//! messages and keeps track of each host's capacity and current client count.
//! Hosts that stop sending heartbeats are dropped after the liveness timeout.
//!
//! ### Client Routing
//! The first packet from a new client endpoint creates a session bound to a
//! random host with a free slot. Each session owns a dedicated outbound
//! socket connected to its host; replies from that socket are sent back to
//! the client from the shared client port. Game payloads are never parsed.
//!
//! ### Admission Control
//! Clients and hosts are rate limited in fixed one-second windows. Repeated
//! violations accumulate strikes, and enough strikes blacklist the source IP.
//! Capacity exhaustion results in a short, non-punitive reject cooldown.
//! Optionally, clients must present a shared token before their first packet.
//!
//! ## Architecture Design
//!
//! ### Tasks
//! - **Client Listener**: receives on the client port and routes packets
//! - **Host Listener**: receives REGISTER/HEARTBEAT datagrams
//! - **Session Receivers**: one per session, forwarding host replies
//! - **Cleanup**: expires sessions, hosts and abuse-table entries
//! - **Diagnostics** (optional): answers read-only bincode queries
//!
//! ### Shared State
//! Every table lives behind its own lock in one [`state::RelayState`]. Locks
//! are taken in the fixed order sessions, hosts, admission tables, and the
//! capacity-check-then-insert sequence for new sessions runs entirely under
//! the session table's write lock.
//!
//! ## Module Organization
//!
//! - [`config`]: `RelayConfig` and the command-line arguments
//! - [`abuse`]: rate windows, expiry tables and strike counters
//! - [`admission`]: client and host admission profiles
//! - [`registry`]: host records and registration handling
//! - [`router`]: client sessions and forwarding
//! - [`cleanup`]: periodic expiry
//! - [`diagnostics`]: the read-only query socket
//! - [`network`]: socket setup and listener tasks
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use relay::config::RelayConfig;
//! use relay::network::RelayServer;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = RelayServer::bind(RelayConfig::default()).await?;
//!     let mut relay = server.spawn();
//!
//!     // Runs until one of the relay tasks fails
//!     relay.join().await?;
//!     Ok(())
//! }
//! ```

pub mod abuse;
pub mod admission;
pub mod cleanup;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod network;
pub mod registry;
pub mod router;
pub mod state;

pub use config::RelayConfig;
pub use error::{RelayError, Rejection};
pub use network::{RelayHandle, RelayServer};
