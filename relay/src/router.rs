//! Client sessions and bidirectional forwarding
//!
//! Every client endpoint that gets past admission is bound to one host and
//! given its own outbound socket connected to that host. Replies arriving on
//! that socket are sent back to the client from the shared client socket, so
//! the client only ever talks to the relay's public port.
//!
//! A session starts out handshake-pending. Until the host answers, client
//! traffic does not count as activity and the shorter handshake timeout
//! applies.

use crate::admission::ClientVerdict;
use crate::error::Rejection;
use crate::registry::HostBinding;
use crate::state::RelayState;
use log::{debug, info, warn};
use shared::crypto::constant_time_eq;
use shared::{classify_client_datagram, ClientDatagram, MAX_DATAGRAM_SIZE};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

/// One client endpoint's binding to a host.
///
/// The session owns the receiver task for its dedicated socket. Dropping
/// the session aborts that task.
pub struct ClientSession {
    /// Distinguishes successive sessions of the same client endpoint
    pub id: u64,
    /// Client endpoint as seen on the shared client port
    pub client: SocketAddr,
    /// Slot claimed on the host, released on teardown
    pub host: HostBinding,
    /// Host label at the time the session was opened
    pub host_id: String,
    /// Game endpoint the dedicated socket is connected to
    pub host_endpoint: SocketAddr,
    socket: Arc<UdpSocket>,
    receiver: Option<JoinHandle<()>>,
    /// Set until the host sends its first reply
    pub handshake_pending: bool,
    pub bytes_to_host: u64,
    pub bytes_to_client: u64,
    pub created_at: Instant,
    /// Last time traffic counted as activity, see [`ClientSession::record_from_client`]
    pub last_activity: Instant,
}

impl ClientSession {
    /// Creates a handshake-pending session. The receiver task is attached
    /// separately once it has been spawned.
    pub fn new(
        id: u64,
        client: SocketAddr,
        host: HostBinding,
        host_id: String,
        socket: Arc<UdpSocket>,
        host_endpoint: SocketAddr,
        now: Instant,
    ) -> Self {
        Self {
            id,
            client,
            host,
            host_id,
            host_endpoint,
            socket,
            receiver: None,
            handshake_pending: true,
            bytes_to_host: 0,
            bytes_to_client: 0,
            created_at: now,
            last_activity: now,
        }
    }

    /// Shared handle to the dedicated socket towards the host.
    pub fn socket(&self) -> Arc<UdpSocket> {
        Arc::clone(&self.socket)
    }

    /// Hands the session ownership of its receiver task.
    pub fn attach_receiver(&mut self, receiver: JoinHandle<()>) {
        self.receiver = Some(receiver);
    }

    /// Counts a forwarded client datagram.
    ///
    /// While the handshake is pending, client traffic does not refresh
    /// `last_activity`, so a client cannot keep an unanswered session alive.
    pub fn record_from_client(&mut self, len: usize, now: Instant) {
        self.bytes_to_host += len as u64;
        if !self.handshake_pending {
            self.last_activity = now;
        }
    }

    /// Counts a host reply. The first one completes the handshake.
    pub fn record_from_host(&mut self, len: usize, now: Instant) {
        self.bytes_to_client += len as u64;
        self.handshake_pending = false;
        self.last_activity = now;
    }

    /// Why the session is due for teardown as of `now`, if it is.
    pub fn expiry(
        &self,
        now: Instant,
        handshake_timeout: Duration,
        client_timeout: Duration,
    ) -> Option<SessionEnd> {
        if self.handshake_pending
            && now.saturating_duration_since(self.created_at) > handshake_timeout
        {
            return Some(SessionEnd::HandshakeTimeout);
        }
        if now.saturating_duration_since(self.last_activity) > client_timeout {
            return Some(SessionEnd::IdleTimeout);
        }
        None
    }

    /// Time left before the session would idle out.
    pub fn idle_remaining(&self, now: Instant, client_timeout: Duration) -> Duration {
        client_timeout.saturating_sub(now.saturating_duration_since(self.last_activity))
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        if let Some(receiver) = self.receiver.take() {
            receiver.abort();
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    HandshakeTimeout,
    IdleTimeout,
    SocketError,
    Rejected,
    Blacklisted,
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEnd::HandshakeTimeout => f.write_str("handshake timeout"),
            SessionEnd::IdleTimeout => f.write_str("idle timeout"),
            SessionEnd::SocketError => f.write_str("socket error"),
            SessionEnd::Rejected => f.write_str("rejected"),
            SessionEnd::Blacklisted => f.write_str("blacklisted"),
        }
    }
}

/// Live sessions keyed by client endpoint.
#[derive(Default)]
pub struct SessionTable {
    sessions: HashMap<SocketAddr, ClientSession>,
    next_id: u64,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates the id for the next session.
    pub fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Inserts a session, replacing any previous one for the same client.
    pub fn insert(&mut self, session: ClientSession) {
        self.sessions.insert(session.client, session);
    }

    pub fn get(&self, client: &SocketAddr) -> Option<&ClientSession> {
        self.sessions.get(client)
    }

    pub fn get_mut(&mut self, client: &SocketAddr) -> Option<&mut ClientSession> {
        self.sessions.get_mut(client)
    }

    /// Removes the session for `client`, optionally only if it is still the
    /// session with `id`.
    pub fn remove(&mut self, client: &SocketAddr, id: Option<u64>) -> Option<ClientSession> {
        match self.sessions.get(client) {
            Some(session) if id.map_or(true, |id| id == session.id) => {
                self.sessions.remove(client)
            }
            _ => None,
        }
    }

    /// Removes the session for `client` only if it is still the session
    /// with `id` and is still due to expire as of `now`.
    pub fn remove_expired(
        &mut self,
        client: &SocketAddr,
        id: u64,
        now: Instant,
        handshake_timeout: Duration,
        client_timeout: Duration,
    ) -> Option<(ClientSession, SessionEnd)> {
        let end = self
            .sessions
            .get(client)
            .filter(|session| session.id == id)?
            .expiry(now, handshake_timeout, client_timeout)?;
        self.sessions.remove(client).map(|session| (session, end))
    }

    /// Sessions still waiting for their host's first reply.
    pub fn pending_count(&self) -> usize {
        self.sessions
            .values()
            .filter(|session| session.handshake_pending)
            .count()
    }

    /// Sessions due for teardown, with the reason.
    pub fn expired(
        &self,
        now: Instant,
        handshake_timeout: Duration,
        client_timeout: Duration,
    ) -> Vec<(SocketAddr, u64, SessionEnd)> {
        self.sessions
            .values()
            .filter_map(|session| {
                session
                    .expiry(now, handshake_timeout, client_timeout)
                    .map(|end| (session.client, session.id, end))
            })
            .collect()
    }

    /// Number of sessions bound to each host binding.
    pub fn bound_counts(&self) -> HashMap<HostBinding, u32> {
        let mut counts = HashMap::new();
        for session in self.sessions.values() {
            *counts.entry(session.host).or_insert(0) += 1;
        }
        counts
    }

    /// Iterates over sessions in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &ClientSession> {
        self.sessions.values()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Opens the dedicated outbound socket for one session, connected to `host`.
pub fn connect_session_socket(host: SocketAddr) -> io::Result<UdpSocket> {
    let local: SocketAddr = if host.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = std::net::UdpSocket::bind(local)?;
    socket.connect(host)?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket)
}

/// Logs and drops a session already removed from the table.
///
/// Dropping the session aborts its receiver, which may be the current task,
/// so callers must not await anything afterwards.
fn close_session(session: ClientSession, reason: SessionEnd) {
    info!(
        "Session {} -> {} closed ({}), {} bytes up, {} bytes down",
        session.client,
        session.host_endpoint,
        reason,
        session.bytes_to_host,
        session.bytes_to_client
    );
    drop(session);
}

impl RelayState {
    /// Entry point for every datagram arriving on the client port.
    pub async fn handle_client_packet(
        self: &Arc<Self>,
        data: &[u8],
        source: SocketAddr,
    ) -> Result<(), Rejection> {
        let now = Instant::now();
        let verdict = self.client_guard.lock().await.admit(source, now);
        match verdict {
            ClientVerdict::Admitted => {}
            ClientVerdict::Dropped => return Err(Rejection::Denied),
            ClientVerdict::Blacklisted => {
                self.teardown_sessions_from(source.ip()).await;
                return Err(Rejection::Denied);
            }
        }

        let payload = match classify_client_datagram(data) {
            ClientDatagram::Auth(token) => return self.handle_auth(token, source, now).await,
            ClientDatagram::Payload(payload) => payload,
        };

        let existing = {
            let mut sessions = self.sessions.write().await;
            sessions.get_mut(&source).map(|session| {
                session.record_from_client(payload.len(), now);
                (session.id, session.socket())
            })
        };
        let (session_id, socket) = match existing {
            Some(found) => found,
            None => self.open_session(source, payload.len(), now).await?,
        };

        self.counters
            .bytes_to_hosts
            .fetch_add(payload.len() as u64, Ordering::Relaxed);
        if let Err(e) = socket.send(payload).await {
            warn!("Forwarding from {} failed: {}", source, e);
            self.teardown_session(source, Some(session_id), SessionEnd::SocketError)
                .await;
            return Err(Rejection::HostUnreachable);
        }
        Ok(())
    }

    /// `AUTH|<token>` is consumed here and never forwarded.
    async fn handle_auth(
        &self,
        token: &[u8],
        source: SocketAddr,
        now: Instant,
    ) -> Result<(), Rejection> {
        if !self.config.use_token_auth {
            debug!("Ignoring AUTH from {} (token auth disabled)", source);
            return Ok(());
        }

        if constant_time_eq(token, self.config.token.as_bytes()) {
            self.client_guard.lock().await.authorize(source.ip(), now);
            return Ok(());
        }

        self.client_guard.lock().await.reject_token(source, now);
        self.teardown_sessions_from(source.ip()).await;
        self.counters.rejected_clients.fetch_add(1, Ordering::Relaxed);
        Err(Rejection::BadToken)
    }

    /// Creates a session for `client`. Capacity checks, host selection and
    /// the insert all happen under the session table write lock.
    async fn open_session(
        self: &Arc<Self>,
        client: SocketAddr,
        first_len: usize,
        now: Instant,
    ) -> Result<(u64, Arc<UdpSocket>), Rejection> {
        let mut sessions = self.sessions.write().await;

        // Another packet from the same client may have won the race
        if let Some(session) = sessions.get_mut(&client) {
            session.record_from_client(first_len, now);
            return Ok((session.id, session.socket()));
        }

        let refusal = if sessions.len() >= self.config.max_clients {
            Some(Rejection::ClientsFull)
        } else if sessions.pending_count() >= self.config.max_pending_handshakes {
            Some(Rejection::HandshakesFull)
        } else if self.config.use_token_auth
            && !self.client_guard.lock().await.is_authorized(client.ip(), now)
        {
            Some(Rejection::Unauthorized)
        } else {
            None
        };
        if let Some(rejection) = refusal {
            drop(sessions);
            self.reject_client(client, rejection, now).await;
            return Err(rejection);
        }

        let mut hosts = self.hosts.write().await;
        let selected = hosts.bind_random(&mut rand::thread_rng());
        let Some((binding, endpoint)) = selected else {
            drop(hosts);
            drop(sessions);
            self.reject_client(client, Rejection::NoEligibleHost, now)
                .await;
            return Err(Rejection::NoEligibleHost);
        };
        let host_id = hosts
            .get(&binding.key)
            .map(|record| record.host_id.clone())
            .unwrap_or_default();

        let socket = match connect_session_socket(endpoint) {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                hosts.release(binding);
                warn!("Could not open socket towards host {}: {}", endpoint, e);
                self.counters.rejected_clients.fetch_add(1, Ordering::Relaxed);
                return Err(Rejection::HostUnreachable);
            }
        };
        drop(hosts);

        let id = sessions.next_id();
        let mut session = ClientSession::new(
            id,
            client,
            binding,
            host_id,
            Arc::clone(&socket),
            endpoint,
            now,
        );
        session.attach_receiver(self.spawn_session_receiver(client, id, Arc::clone(&socket)));
        session.record_from_client(first_len, now);
        info!(
            "Client {} -> host {} ({}) via {}",
            client,
            binding.key,
            session.host_id,
            endpoint
        );
        sessions.insert(session);

        Ok((id, socket))
    }

    fn spawn_session_receiver(
        self: &Arc<Self>,
        client: SocketAddr,
        session_id: u64,
        socket: Arc<UdpSocket>,
    ) -> JoinHandle<()> {
        let state = Arc::clone(self);

        tokio::spawn(async move {
            let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];

            loop {
                match socket.recv(&mut buffer).await {
                    Ok(len) => {
                        state
                            .handle_host_reply(client, session_id, &buffer[..len])
                            .await;
                    }
                    Err(e) => {
                        warn!("Session socket for {} failed: {}", client, e);
                        state
                            .teardown_session(client, Some(session_id), SessionEnd::SocketError)
                            .await;
                        break;
                    }
                }
            }
        })
    }

    /// Sends a host reply back to its client. A session torn down in the
    /// meantime makes this a no-op.
    pub async fn handle_host_reply(&self, client: SocketAddr, session_id: u64, data: &[u8]) {
        let now = Instant::now();
        {
            let mut sessions = self.sessions.write().await;
            match sessions.get_mut(&client) {
                Some(session) if session.id == session_id => {
                    session.record_from_host(data.len(), now);
                }
                _ => return,
            }
        }

        self.counters
            .bytes_to_clients
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        if let Err(e) = self.client_socket.send_to(data, client).await {
            debug!("Reply to {} failed: {}", client, e);
        }
    }

    /// Removes a session and gives its host slot back. With `session_id` set,
    /// a newer session for the same client is left alone.
    pub async fn teardown_session(
        &self,
        client: SocketAddr,
        session_id: Option<u64>,
        reason: SessionEnd,
    ) -> bool {
        let session = {
            let mut sessions = self.sessions.write().await;
            let Some(session) = sessions.remove(&client, session_id) else {
                return false;
            };
            self.hosts.write().await.release(session.host);
            session
        };

        close_session(session, reason);
        true
    }

    /// Tears down a session picked by cleanup, unless it has become live
    /// again since. Returns why it ended.
    pub async fn expire_session(
        &self,
        client: SocketAddr,
        session_id: u64,
        now: Instant,
    ) -> Option<SessionEnd> {
        let (session, reason) = {
            let mut sessions = self.sessions.write().await;
            let (session, reason) = sessions.remove_expired(
                &client,
                session_id,
                now,
                self.config.handshake_timeout,
                self.config.client_timeout,
            )?;
            self.hosts.write().await.release(session.host);
            (session, reason)
        };

        close_session(session, reason);
        Some(reason)
    }

    /// Tears down every session of a client IP, used once the IP is
    /// blacklisted. Returns how many were closed.
    pub async fn teardown_sessions_from(&self, ip: IpAddr) -> usize {
        let doomed: Vec<(SocketAddr, u64)> = self
            .sessions
            .read()
            .await
            .iter()
            .filter(|session| session.client.ip() == ip)
            .map(|session| (session.client, session.id))
            .collect();

        let mut closed = 0;
        for (client, session_id) in doomed {
            if self
                .teardown_session(client, Some(session_id), SessionEnd::Blacklisted)
                .await
            {
                closed += 1;
            }
        }
        if closed > 0 {
            warn!("Closed {} sessions of blacklisted IP {}", closed, ip);
        }
        closed
    }

    /// Turns a client away with a reject cooldown, killing any session it
    /// still has.
    pub async fn reject_client(&self, client: SocketAddr, reason: Rejection, now: Instant) {
        warn!("Rejecting client {}: {}", client, reason);
        self.teardown_session(client, None, SessionEnd::Rejected)
            .await;
        self.client_guard.lock().await.reject(client, now);
        self.counters.rejected_clients.fetch_add(1, Ordering::Relaxed);
    }
}
