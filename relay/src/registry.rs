//! Host registry: validated registrations and per-host capacity
//!
//! Hosts are keyed by the endpoint their registration datagrams come from.
//! The self-reported host id is only a label. Forwarding goes to the
//! registration IP combined with the declared game port.
//!
//! Each record carries an epoch that changes whenever a host is newly
//! inserted. Sessions remember the epoch they were bound under, so a session
//! that outlives its host never decrements the count of a later host that
//! happens to register from the same endpoint.

use crate::admission::HostAdmission;
use crate::error::Rejection;
use log::{debug, info, warn};
use rand::seq::SliceRandom;
use rand::Rng;
use shared::{HostAuthenticator, HostCommand, Registration};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// A registered host.
///
/// The record lives from the first accepted REGISTER until the host has
/// been silent for longer than the liveness timeout.
#[derive(Debug, Clone)]
pub struct HostRecord {
    /// Self-reported label, not used for lookups
    pub host_id: String,
    /// Where client traffic for this host is sent
    pub endpoint: SocketAddr,
    /// Capacity as the host declared it
    pub declared_max_players: u32,
    /// Declared capacity clamped to the relay's per-host ceiling
    pub max_players: u32,
    /// Sessions currently bound to this record
    pub current_clients: u32,
    /// Last accepted REGISTER or HEARTBEAT
    pub last_seen: Instant,
    pub registered_at: Instant,
    /// Changes whenever the record is newly inserted
    pub epoch: u64,
}

impl HostRecord {
    /// True when another client can be bound to this host.
    pub fn has_free_slot(&self) -> bool {
        self.current_clients < self.max_players
    }

    /// Checks if the host has been silent for longer than `timeout`.
    pub fn is_timed_out(&self, timeout: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.last_seen) > timeout
    }
}

/// A session's claim on one slot of a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostBinding {
    pub key: SocketAddr,
    pub epoch: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationOutcome {
    Registered,
    Refreshed,
}

/// Registered hosts keyed by registration endpoint.
pub struct HostRegistry {
    hosts: HashMap<SocketAddr, HostRecord>,
    next_epoch: u64,
    max_hosts: usize,
    max_players_per_host: u32,
    replay_window: Duration,
    min_interval: Duration,
}

impl HostRegistry {
    pub fn new(
        max_hosts: usize,
        max_players_per_host: u32,
        replay_window: Duration,
        min_interval: Duration,
    ) -> Self {
        Self {
            hosts: HashMap::new(),
            next_epoch: 1,
            max_hosts,
            max_players_per_host,
            replay_window,
            min_interval,
        }
    }

    /// Runs one host datagram through admission, authentication and the
    /// registry rules, in that order.
    ///
    /// Every rejection past admission is tracked against the source.
    /// Rejections that count as strikes are struck, and a full registry
    /// puts the source into host cooldown.
    pub fn handle_registration(
        &mut self,
        datagram: &[u8],
        source: SocketAddr,
        authenticator: &HostAuthenticator,
        guard: &mut HostAdmission,
        now: Instant,
        unix_now: i64,
    ) -> Result<RegistrationOutcome, Rejection> {
        if !guard.admit(source, now) {
            return Err(Rejection::Denied);
        }

        match self.check_registration(datagram, source, authenticator, now, unix_now) {
            Ok(registration) => Ok(self.upsert(source, &registration, now)),
            Err(rejection) => {
                if rejection.is_strike() {
                    guard.strike(source, now);
                }
                if rejection == Rejection::RegistryFull {
                    guard.cooldown(source, now);
                }
                guard.track_reject(source);
                Err(rejection)
            }
        }
    }

    fn check_registration(
        &self,
        datagram: &[u8],
        source: SocketAddr,
        authenticator: &HostAuthenticator,
        now: Instant,
        unix_now: i64,
    ) -> Result<Registration, Rejection> {
        let registration = match authenticator.open(datagram) {
            Ok(registration) => registration,
            Err(e) if e.is_authentication_failure() => {
                warn!("Rejected registration from {}: {}", source, e);
                return Err(Rejection::Unauthenticated);
            }
            Err(e) => {
                debug!("Malformed registration from {}: {}", source, e);
                return Err(Rejection::Malformed);
            }
        };

        if unix_now.abs_diff(registration.timestamp) > self.replay_window.as_secs() {
            warn!(
                "Stale {} from {} (timestamp {}, now {})",
                registration.command, source, registration.timestamp, unix_now
            );
            return Err(Rejection::Stale);
        }

        match self.hosts.get(&source) {
            None if self.hosts.len() >= self.max_hosts => {
                warn!("Registry full, rejecting host {} ({})", source, registration.host_id);
                Err(Rejection::RegistryFull)
            }
            None if registration.command == HostCommand::Heartbeat => {
                debug!("Ignoring heartbeat from unregistered host {}", source);
                Err(Rejection::UnknownHost)
            }
            Some(record)
                if now.saturating_duration_since(record.last_seen) < self.min_interval =>
            {
                warn!("Host {} is sending {} too often", source, registration.command);
                Err(Rejection::TooFrequent)
            }
            _ => Ok(registration),
        }
    }

    fn upsert(
        &mut self,
        source: SocketAddr,
        registration: &Registration,
        now: Instant,
    ) -> RegistrationOutcome {
        let endpoint = SocketAddr::new(source.ip(), registration.game_port);
        let max_players = registration.max_players.min(self.max_players_per_host);

        if let Some(record) = self.hosts.get_mut(&source) {
            if record.endpoint != endpoint || record.max_players != max_players {
                info!(
                    "Host {} updated: endpoint {} -> {}, capacity {} -> {}",
                    source, record.endpoint, endpoint, record.max_players, max_players
                );
            }
            record.host_id.clone_from(&registration.host_id);
            record.endpoint = endpoint;
            record.declared_max_players = registration.max_players;
            record.max_players = max_players;
            record.last_seen = now;
            return RegistrationOutcome::Refreshed;
        }

        let epoch = self.next_epoch;
        self.next_epoch += 1;
        info!(
            "Registered host {} ({}) forwarding to {} with {} slots",
            source, registration.host_id, endpoint, max_players
        );
        self.hosts.insert(
            source,
            HostRecord {
                host_id: registration.host_id.clone(),
                endpoint,
                declared_max_players: registration.max_players,
                max_players,
                current_clients: 0,
                last_seen: now,
                registered_at: now,
                epoch,
            },
        );
        RegistrationOutcome::Registered
    }

    /// Picks a host with a free slot uniformly at random and claims the slot.
    pub fn bind_random<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Option<(HostBinding, SocketAddr)> {
        let eligible: Vec<SocketAddr> = self
            .hosts
            .iter()
            .filter(|(_, record)| record.has_free_slot())
            .map(|(key, _)| *key)
            .collect();

        let key = *eligible.choose(rng)?;
        let record = self.hosts.get_mut(&key)?;
        record.current_clients += 1;
        Some((
            HostBinding {
                key,
                epoch: record.epoch,
            },
            record.endpoint,
        ))
    }

    /// Gives a slot back. Bindings to a host that has since expired (or been
    /// replaced) are ignored.
    pub fn release(&mut self, binding: HostBinding) -> bool {
        match self.hosts.get_mut(&binding.key) {
            Some(record) if record.epoch == binding.epoch => {
                record.current_clients = record.current_clients.saturating_sub(1);
                true
            }
            _ => false,
        }
    }

    /// Removes every host not seen within `timeout`.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<(SocketAddr, HostRecord)> {
        let expired: Vec<SocketAddr> = self
            .hosts
            .iter()
            .filter(|(_, record)| record.is_timed_out(timeout, now))
            .map(|(key, _)| *key)
            .collect();

        expired
            .into_iter()
            .filter_map(|key| self.hosts.remove(&key).map(|record| (key, record)))
            .collect()
    }

    pub fn get(&self, key: &SocketAddr) -> Option<&HostRecord> {
        self.hosts.get(key)
    }

    pub fn contains(&self, key: &SocketAddr) -> bool {
        self.hosts.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SocketAddr, &HostRecord)> {
        self.hosts.iter()
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}
