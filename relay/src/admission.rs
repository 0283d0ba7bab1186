//! Admission control for client and host traffic
//!
//! Two independent profiles share the same table primitives:
//!
//! - **Clients** are counted per endpoint, but strikes and blacklisting
//!   apply to the whole IP. Exceeding the packet ceiling costs one strike per
//!   window and the packet still goes through; the packet that reaches the
//!   strike ceiling is the first one dropped.
//! - **Hosts** are counted per endpoint as well. Exceeding the (much lower)
//!   ceiling drops the packet, puts the endpoint in a short cooldown and
//!   strikes it. Enough strikes blacklist the host IP. Host traffic never
//!   consults the client blacklist.

use crate::abuse::{ExpiryTable, StrikeTable, WindowTable, WindowVerdict};
use crate::config::RelayConfig;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

/// Entries removed by one sweep of an admission profile.
///
/// Counts are per table. `trimmed` covers entries evicted because a table
/// was over the hard limit, on top of the ones that simply expired.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Rate windows idle for more than two window lengths
    pub windows: usize,
    /// Expired blacklist entries
    pub blocks: usize,
    pub cooldowns: usize,
    pub grants: usize,
    pub strikes: usize,
    /// Live entries evicted to get back under the hard limit
    pub trimmed: usize,
}

/// Outcome of admitting one client packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientVerdict {
    Admitted,
    Dropped,
    /// Dropped, and this packet got the source IP blacklisted
    Blacklisted,
}

impl ClientVerdict {
    pub fn is_admitted(&self) -> bool {
        matches!(self, ClientVerdict::Admitted)
    }
}

/// Admission profile for the client ingress port.
///
/// Rate windows and reject cooldowns are kept per endpoint. Strikes,
/// blacklisting and token grants apply to the whole IP.
pub struct ClientAdmission {
    windows: WindowTable<SocketAddr>,
    strikes: StrikeTable<IpAddr>,
    blacklist: ExpiryTable<IpAddr>,
    reject_cooldowns: ExpiryTable<SocketAddr>,
    grants: ExpiryTable<IpAddr>,

    max_strikes: u32,
    blacklist_duration: Duration,
    reject_cooldown: Duration,
    grace_window: Duration,
    strike_ttl: Duration,

    rate_limited_packets: u64,
}

impl ClientAdmission {
    /// Creates an empty client profile using the limits in `config`.
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            windows: WindowTable::new(config.rate_window, config.max_client_packets_per_window),
            strikes: StrikeTable::new(),
            blacklist: ExpiryTable::new(),
            reject_cooldowns: ExpiryTable::new(),
            grants: ExpiryTable::new(),
            max_strikes: config.max_strikes_per_ip,
            blacklist_duration: config.ip_blacklist_duration,
            reject_cooldown: config.reject_cooldown,
            grace_window: config.auth_grace_window,
            strike_ttl: config.strike_ttl,
            rate_limited_packets: 0,
        }
    }

    /// Decides whether a packet from `source` may be processed.
    ///
    /// Returns [`ClientVerdict::Blacklisted`] for the one packet that pushes
    /// the IP over the strike ceiling, so the caller can drop whatever the
    /// IP still holds.
    pub fn admit(&mut self, source: SocketAddr, now: Instant) -> ClientVerdict {
        let ip = source.ip();
        if self.blacklist.is_active(&ip, now) {
            debug!("Dropping packet from blacklisted IP {}", ip);
            return ClientVerdict::Dropped;
        }
        if self.reject_cooldowns.is_active(&source, now) {
            debug!("Dropping packet from {} during reject cooldown", source);
            return ClientVerdict::Dropped;
        }

        match self.windows.record(source, now) {
            WindowVerdict::Allowed => ClientVerdict::Admitted,
            WindowVerdict::OverLimit { first_breach } => {
                self.rate_limited_packets += 1;
                if !first_breach {
                    return ClientVerdict::Admitted;
                }

                let strikes = self.strikes.strike(ip, now);
                warn!(
                    "Client {} exceeded packet ceiling (strike {}/{})",
                    source, strikes, self.max_strikes
                );
                if strikes >= self.max_strikes {
                    self.blacklist_ip(ip, now);
                    return ClientVerdict::Blacklisted;
                }
                ClientVerdict::Admitted
            }
        }
    }

    fn blacklist_ip(&mut self, ip: IpAddr, now: Instant) {
        self.blacklist.insert(ip, now, self.blacklist_duration);
        self.strikes.clear(&ip);
        self.grants.remove(&ip);
        warn!(
            "IP {} blacklisted for {:.0}s",
            ip,
            self.blacklist_duration.as_secs_f64()
        );
    }

    /// Short non-punitive rejection of one endpoint.
    pub fn reject(&mut self, source: SocketAddr, now: Instant) {
        self.reject_cooldowns
            .insert(source, now, self.reject_cooldown);
    }

    /// A correct token opens the grace window for the whole IP.
    pub fn authorize(&mut self, ip: IpAddr, now: Instant) {
        self.grants.insert(ip, now, self.grace_window);
        info!("Authorized IP {}", ip);
    }

    /// True while the IP's grace window from a correct token is open.
    pub fn is_authorized(&self, ip: IpAddr, now: Instant) -> bool {
        self.grants.is_active(&ip, now)
    }

    /// A wrong token rejects the endpoint and blacklists its IP outright.
    pub fn reject_token(&mut self, source: SocketAddr, now: Instant) {
        warn!("Invalid token from {}", source);
        self.reject(source, now);
        self.blacklist_ip(source.ip(), now);
    }

    /// True while `ip` is blacklisted, whether for flooding or a wrong token.
    pub fn is_blacklisted(&self, ip: IpAddr, now: Instant) -> bool {
        self.blacklist.is_active(&ip, now)
    }

    /// True while `source` is cooling down after a capacity rejection.
    pub fn in_reject_cooldown(&self, source: SocketAddr, now: Instant) -> bool {
        self.reject_cooldowns.is_active(&source, now)
    }

    /// Strikes currently held against `ip`. Cleared when the IP is blacklisted.
    pub fn strikes(&self, ip: IpAddr) -> u32 {
        self.strikes.count(&ip)
    }

    /// Drops expired entries from every client table.
    ///
    /// Any table still holding more than `hard_limit` entries afterwards is
    /// trimmed, oldest first, down to `trim_target`.
    pub fn sweep(&mut self, now: Instant, hard_limit: usize, trim_target: usize) -> SweepReport {
        let mut report = SweepReport {
            windows: self.windows.sweep(now),
            blocks: self.blacklist.sweep(now),
            cooldowns: self.reject_cooldowns.sweep(now),
            grants: self.grants.sweep(now),
            strikes: self.strikes.sweep(now, self.strike_ttl),
            trimmed: 0,
        };

        if self.windows.len() > hard_limit {
            report.trimmed += self.windows.trim(trim_target);
        }
        if self.blacklist.len() > hard_limit {
            report.trimmed += self.blacklist.trim(trim_target);
        }
        if self.reject_cooldowns.len() > hard_limit {
            report.trimmed += self.reject_cooldowns.trim(trim_target);
        }
        if self.grants.len() > hard_limit {
            report.trimmed += self.grants.trim(trim_target);
        }
        if self.strikes.len() > hard_limit {
            report.trimmed += self.strikes.trim(trim_target);
        }
        report
    }

    /// Total client packets seen above the per-window ceiling.
    pub fn rate_limited_packets(&self) -> u64 {
        self.rate_limited_packets
    }

    /// Number of client IPs currently blacklisted.
    pub fn blocked_ip_count(&self, now: Instant) -> usize {
        self.blacklist.active_count(now)
    }

    pub fn reject_cooldown_count(&self, now: Instant) -> usize {
        self.reject_cooldowns.active_count(now)
    }

    pub fn authorized_ip_count(&self, now: Instant) -> usize {
        self.grants.active_count(now)
    }
}

/// Per-host packet accounting shown in diagnostics. Counters are dropped
/// when the host leaves the registry.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HostPacketStats {
    pub rejected_packets: u64,
    pub rate_limit_hits: u64,
}

/// Admission profile for the host registration port.
///
/// Windows, cooldowns and strikes are per endpoint; the blacklist is per
/// IP. Per-host packet stats are only kept for hosts in the registry.
pub struct HostAdmission {
    windows: WindowTable<SocketAddr>,
    cooldowns: ExpiryTable<SocketAddr>,
    strikes: StrikeTable<SocketAddr>,
    blacklist: ExpiryTable<IpAddr>,
    stats: HashMap<SocketAddr, HostPacketStats>,

    cooldown: Duration,
    max_strikes: u32,
    blacklist_duration: Duration,
    strike_ttl: Duration,

    rejected_packets: u64,
}

impl HostAdmission {
    /// Creates an empty host profile using the limits in `config`.
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            windows: WindowTable::new(config.rate_window, config.max_host_packets_per_window),
            cooldowns: ExpiryTable::new(),
            strikes: StrikeTable::new(),
            blacklist: ExpiryTable::new(),
            stats: HashMap::new(),
            cooldown: config.host_cooldown,
            max_strikes: config.max_host_strikes,
            blacklist_duration: config.host_blacklist_duration,
            strike_ttl: config.strike_ttl,
            rejected_packets: 0,
        }
    }

    /// Decides whether a registration datagram from `source` is looked at.
    pub fn admit(&mut self, source: SocketAddr, now: Instant) -> bool {
        if self.blacklist.is_active(&source.ip(), now) {
            debug!("Dropping host packet from blacklisted IP {}", source.ip());
            self.track_reject(source);
            return false;
        }
        if self.cooldowns.is_active(&source, now) {
            debug!("Dropping host packet from {} during cooldown", source);
            self.track_reject(source);
            return false;
        }

        match self.windows.record(source, now) {
            WindowVerdict::Allowed => true,
            WindowVerdict::OverLimit { .. } => {
                warn!("Host {} is flooding the registration port", source);
                self.stats.entry(source).or_default().rate_limit_hits += 1;
                self.cooldown(source, now);
                self.strike(source, now);
                self.track_reject(source);
                false
            }
        }
    }

    /// Puts `source` into host cooldown. An existing longer cooldown is kept.
    pub fn cooldown(&mut self, source: SocketAddr, now: Instant) {
        self.cooldowns.insert(source, now, self.cooldown);
    }

    /// Strikes the endpoint. Returns true when this strike blacklisted the IP.
    pub fn strike(&mut self, source: SocketAddr, now: Instant) -> bool {
        let strikes = self.strikes.strike(source, now);
        warn!(
            "Host {} struck ({}/{})",
            source, strikes, self.max_strikes
        );
        if strikes < self.max_strikes {
            return false;
        }

        self.strikes.clear(&source);
        self.blacklist
            .insert(source.ip(), now, self.blacklist_duration);
        warn!(
            "Host IP {} blacklisted for {:.0}s",
            source.ip(),
            self.blacklist_duration.as_secs_f64()
        );
        true
    }

    /// Counts a dropped host datagram against the sender.
    pub fn track_reject(&mut self, source: SocketAddr) {
        self.stats.entry(source).or_default().rejected_packets += 1;
        self.rejected_packets += 1;
    }

    /// True while `source` is in host cooldown.
    pub fn in_cooldown(&self, source: SocketAddr, now: Instant) -> bool {
        self.cooldowns.is_active(&source, now)
    }

    pub fn is_blacklisted(&self, ip: IpAddr, now: Instant) -> bool {
        self.blacklist.is_active(&ip, now)
    }

    pub fn strikes(&self, source: SocketAddr) -> u32 {
        self.strikes.count(&source)
    }

    /// Packet counters for one host endpoint, zero for unknown ones.
    pub fn host_stats(&self, source: SocketAddr) -> HostPacketStats {
        self.stats.get(&source).copied().unwrap_or_default()
    }

    /// Sweeps expired entries and keeps per-host counters only for `live`
    /// hosts.
    pub fn sweep<F>(
        &mut self,
        now: Instant,
        hard_limit: usize,
        trim_target: usize,
        live: F,
    ) -> SweepReport
    where
        F: Fn(&SocketAddr) -> bool,
    {
        self.stats.retain(|key, _| live(key));

        let mut report = SweepReport {
            windows: self.windows.sweep(now),
            blocks: self.blacklist.sweep(now),
            cooldowns: self.cooldowns.sweep(now),
            grants: 0,
            strikes: self.strikes.sweep(now, self.strike_ttl),
            trimmed: 0,
        };

        if self.windows.len() > hard_limit {
            report.trimmed += self.windows.trim(trim_target);
        }
        if self.cooldowns.len() > hard_limit {
            report.trimmed += self.cooldowns.trim(trim_target);
        }
        if self.strikes.len() > hard_limit {
            report.trimmed += self.strikes.trim(trim_target);
        }
        if self.blacklist.len() > hard_limit {
            report.trimmed += self.blacklist.trim(trim_target);
        }
        report
    }

    /// Total host datagrams dropped since startup.
    pub fn rejected_packets(&self) -> u64 {
        self.rejected_packets
    }

    pub fn blocked_ip_count(&self, now: Instant) -> usize {
        self.blacklist.active_count(now)
    }

    pub fn cooldown_count(&self, now: Instant) -> usize {
        self.cooldowns.active_count(now)
    }
}
