//! Shared relay state
//!
//! All tables sit behind their own lock inside one `Arc<RelayState>`.
//! Locks are always taken in the order sessions, hosts, admission tables.

use crate::admission::{ClientAdmission, HostAdmission};
use crate::config::RelayConfig;
use crate::error::Rejection;
use crate::registry::{HostRegistry, RegistrationOutcome};
use crate::router::SessionTable;
use shared::{unix_timestamp, HostAuthenticator, HostInfo, RelayStats, SessionInfo};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, RwLock};

/// Monotonic counters reported through diagnostics.
#[derive(Debug, Default)]
pub struct RelayCounters {
    pub handshake_timeouts: AtomicU64,
    pub idle_timeouts: AtomicU64,
    pub rejected_clients: AtomicU64,
    pub rejected_hosts: AtomicU64,
    pub bytes_to_hosts: AtomicU64,
    pub bytes_to_clients: AtomicU64,
}

pub struct RelayState {
    pub config: RelayConfig,
    pub(crate) authenticator: HostAuthenticator,
    /// Shared ingress socket; replies to clients leave from here too
    pub(crate) client_socket: Arc<UdpSocket>,
    pub(crate) sessions: RwLock<SessionTable>,
    pub(crate) hosts: RwLock<HostRegistry>,
    pub(crate) client_guard: Mutex<ClientAdmission>,
    pub(crate) host_guard: Mutex<HostAdmission>,
    pub(crate) counters: RelayCounters,
}

impl RelayState {
    pub fn new(config: RelayConfig, client_socket: Arc<UdpSocket>) -> Self {
        let authenticator = HostAuthenticator::new(config.auth_profile, &config.host_secret);
        let hosts = HostRegistry::new(
            config.max_hosts,
            config.max_players_per_host,
            config.replay_window,
            config.min_heartbeat_interval,
        );

        Self {
            authenticator,
            client_socket,
            sessions: RwLock::new(SessionTable::new()),
            hosts: RwLock::new(hosts),
            client_guard: Mutex::new(ClientAdmission::new(&config)),
            host_guard: Mutex::new(HostAdmission::new(&config)),
            counters: RelayCounters::default(),
            config,
        }
    }

    /// Entry point for every datagram arriving on the host registration port.
    pub async fn handle_host_datagram(
        &self,
        data: &[u8],
        source: SocketAddr,
    ) -> Result<RegistrationOutcome, Rejection> {
        let now = Instant::now();
        let mut hosts = self.hosts.write().await;
        let mut guard = self.host_guard.lock().await;

        let result = hosts.handle_registration(
            data,
            source,
            &self.authenticator,
            &mut guard,
            now,
            unix_timestamp(),
        );
        if result.is_err() {
            self.counters.rejected_hosts.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    pub async fn stats(&self) -> RelayStats {
        let now = Instant::now();
        let sessions = self.sessions.read().await;
        let hosts = self.hosts.read().await;
        let clients = self.client_guard.lock().await;
        let host_guard = self.host_guard.lock().await;

        RelayStats {
            registered_hosts: hosts.len(),
            max_hosts: self.config.max_hosts,
            active_sessions: sessions.len(),
            max_clients: self.config.max_clients,
            pending_handshakes: sessions.pending_count(),
            max_pending_handshakes: self.config.max_pending_handshakes,

            blocked_client_ips: clients.blocked_ip_count(now),
            blocked_host_ips: host_guard.blocked_ip_count(now),
            reject_cooldowns: clients.reject_cooldown_count(now),
            host_cooldowns: host_guard.cooldown_count(now),
            authorized_ips: clients.authorized_ip_count(now),

            rate_limited_packets: clients.rate_limited_packets(),
            handshake_timeouts: self.counters.handshake_timeouts.load(Ordering::Relaxed),
            idle_timeouts: self.counters.idle_timeouts.load(Ordering::Relaxed),
            rejected_clients: self.counters.rejected_clients.load(Ordering::Relaxed),
            rejected_hosts: self.counters.rejected_hosts.load(Ordering::Relaxed),
            rejected_host_packets: host_guard.rejected_packets(),

            bytes_to_hosts: self.counters.bytes_to_hosts.load(Ordering::Relaxed),
            bytes_to_clients: self.counters.bytes_to_clients.load(Ordering::Relaxed),
        }
    }

    /// Registered hosts, most recently registered last.
    pub async fn host_list(&self) -> Vec<HostInfo> {
        let now = Instant::now();
        let hosts = self.hosts.read().await;
        let guard = self.host_guard.lock().await;

        let mut records: Vec<_> = hosts.iter().collect();
        records.sort_by_key(|(_, record)| record.registered_at);
        records
            .into_iter()
            .map(|(key, record)| {
                let stats = guard.host_stats(*key);
                HostInfo {
                    key: *key,
                    host_id: record.host_id.clone(),
                    endpoint: record.endpoint,
                    current_players: record.current_clients,
                    max_players: record.max_players,
                    declared_max_players: record.declared_max_players,
                    seconds_since_seen: now.saturating_duration_since(record.last_seen).as_secs_f64(),
                    in_cooldown: guard.in_cooldown(*key, now),
                    rejected_packets: stats.rejected_packets,
                    rate_limit_hits: stats.rate_limit_hits,
                }
            })
            .collect()
    }

    pub async fn session_list(&self) -> Vec<SessionInfo> {
        let now = Instant::now();
        let sessions = self.sessions.read().await;

        let mut list: Vec<SessionInfo> = sessions
            .iter()
            .map(|session| SessionInfo {
                client: session.client,
                host_key: session.host.key,
                host_id: session.host_id.clone(),
                bytes_to_host: session.bytes_to_host,
                bytes_to_client: session.bytes_to_client,
                handshake_pending: session.handshake_pending,
                seconds_since_created: now
                    .saturating_duration_since(session.created_at)
                    .as_secs_f64(),
                idle_timeout_remaining: session
                    .idle_remaining(now, self.config.client_timeout)
                    .as_secs_f64(),
            })
            .collect();
        list.sort_by(|a, b| b.seconds_since_created.total_cmp(&a.seconds_since_created));
        list
    }

    /// Checks that every host's client count matches the sessions bound to it.
    pub async fn host_counts_consistent(&self) -> bool {
        let sessions = self.sessions.read().await;
        let hosts = self.hosts.read().await;
        let bound = sessions.bound_counts();

        let consistent = hosts.iter().all(|(key, record)| {
            let expected = bound
                .iter()
                .filter(|(binding, _)| binding.key == *key && binding.epoch == record.epoch)
                .map(|(_, count)| *count)
                .sum::<u32>();
            expected == record.current_clients
        });
        consistent
    }
}
