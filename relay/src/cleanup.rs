//! Periodic expiry of sessions, hosts and admission tables

use crate::admission::SweepReport;
use crate::router::SessionEnd;
use crate::state::RelayState;
use log::{debug, info, warn};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{interval, MissedTickBehavior};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupReport {
    pub handshake_timeouts: usize,
    pub idle_timeouts: usize,
    pub expired_hosts: usize,
    pub client_tables: SweepReport,
    pub host_tables: SweepReport,
}

impl RelayState {
    /// One cleanup pass as of `now`.
    ///
    /// Expired hosts are removed together with their per-host counters.
    /// Sessions still bound to them are not touched and age out on their own.
    pub async fn run_cleanup(&self, now: Instant) -> CleanupReport {
        let mut report = CleanupReport::default();

        let expired = self.sessions.read().await.expired(
            now,
            self.config.handshake_timeout,
            self.config.client_timeout,
        );
        for (client, session_id, _) in expired {
            // Re-checked under the write lock, a host reply may have landed
            let Some(reason) = self.expire_session(client, session_id, now).await else {
                continue;
            };
            match reason {
                SessionEnd::HandshakeTimeout => {
                    warn!("Handshake timeout for {}", client);
                    report.handshake_timeouts += 1;
                    self.counters
                        .handshake_timeouts
                        .fetch_add(1, Ordering::Relaxed);
                }
                _ => {
                    report.idle_timeouts += 1;
                    self.counters.idle_timeouts.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        let removed = self
            .hosts
            .write()
            .await
            .expire(now, self.config.host_timeout);
        for (key, record) in &removed {
            info!(
                "Host {} ({}) timed out with {} clients bound",
                key, record.host_id, record.current_clients
            );
        }
        report.expired_hosts = removed.len();

        let hard_limit = self.config.table_hard_limit;
        let trim_target = self.config.table_trim_target;
        report.client_tables = self
            .client_guard
            .lock()
            .await
            .sweep(now, hard_limit, trim_target);

        let hosts = self.hosts.read().await;
        report.host_tables = self
            .host_guard
            .lock()
            .await
            .sweep(now, hard_limit, trim_target, |key| hosts.contains(key));

        report
    }
}

/// Runs cleanup every `cleanup_interval` and logs a summary every
/// `stats_log_interval` ticks.
pub async fn run_cleanup_loop(state: Arc<RelayState>) {
    let mut ticker = interval(state.config.cleanup_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut ticks: u32 = 0;

    // Skip the first tick since it fires immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let report = state.run_cleanup(Instant::now()).await;
        if report.client_tables.trimmed > 0 || report.host_tables.trimmed > 0 {
            warn!(
                "Abuse tables over hard limit, trimmed {} client and {} host entries",
                report.client_tables.trimmed, report.host_tables.trimmed
            );
        }
        debug!("Cleanup pass: {:?}", report);

        ticks = ticks.wrapping_add(1);
        let every = state.config.stats_log_interval;
        if every > 0 && ticks % every == 0 {
            let stats = state.stats().await;
            info!(
                "Hosts {}/{} | sessions {}/{} ({} pending) | blocked IPs {} client, {} host | rejected {} clients, {} hosts | {} B up, {} B down",
                stats.registered_hosts,
                stats.max_hosts,
                stats.active_sessions,
                stats.max_clients,
                stats.pending_handshakes,
                stats.blocked_client_ips,
                stats.blocked_host_ips,
                stats.rejected_clients,
                stats.rejected_hosts,
                stats.bytes_to_hosts,
                stats.bytes_to_clients,
            );
        }
    }
}
