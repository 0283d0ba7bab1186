//! Socket setup and the listener tasks
//!
//! The relay owns two public UDP sockets: the host registration port and
//! the client ingress port. Each gets one task that loops over `recv_from`.
//! An optional third socket answers diagnostics queries.

use crate::cleanup::run_cleanup_loop;
use crate::config::RelayConfig;
use crate::diagnostics::run_diagnostics_listener;
use crate::error::RelayError;
use crate::state::RelayState;
use log::{debug, error, info, warn};
use shared::MAX_DATAGRAM_SIZE;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinSet;

/// A bound but not yet running relay.
pub struct RelayServer {
    state: Arc<RelayState>,
    host_socket: UdpSocket,
    diagnostics_socket: Option<UdpSocket>,
}

async fn bind_socket(what: &'static str, addr: SocketAddr) -> Result<UdpSocket, RelayError> {
    UdpSocket::bind(addr)
        .await
        .map_err(|source| RelayError::Bind { what, addr, source })
}

impl RelayServer {
    /// Binds every listener. Failure to bind any of them is fatal.
    pub async fn bind(config: RelayConfig) -> Result<Self, RelayError> {
        config.validate()?;

        let client_socket = bind_socket("client", config.client_addr()).await?;
        let host_socket = bind_socket("host registration", config.host_addr()).await?;
        let diagnostics_socket = match config.diagnostics_addr {
            Some(addr) => Some(bind_socket("diagnostics", addr).await?),
            None => None,
        };

        info!(
            "Relay listening for clients on {} and hosts on {} ({} profile)",
            client_socket.local_addr()?,
            host_socket.local_addr()?,
            config.auth_profile
        );
        if let Some(socket) = &diagnostics_socket {
            info!("Diagnostics available on {}", socket.local_addr()?);
        }
        if config.use_token_auth {
            info!("Client token authorization enabled");
        }

        Ok(Self {
            state: Arc::new(RelayState::new(config, Arc::new(client_socket))),
            host_socket,
            diagnostics_socket,
        })
    }

    pub fn client_addr(&self) -> Result<SocketAddr, RelayError> {
        Ok(self.state.client_socket.local_addr()?)
    }

    pub fn host_addr(&self) -> Result<SocketAddr, RelayError> {
        Ok(self.host_socket.local_addr()?)
    }

    pub fn diagnostics_addr(&self) -> Option<SocketAddr> {
        self.diagnostics_socket
            .as_ref()
            .and_then(|socket| socket.local_addr().ok())
    }

    pub fn state(&self) -> Arc<RelayState> {
        Arc::clone(&self.state)
    }

    /// Starts the listener and cleanup tasks.
    pub fn spawn(self) -> RelayHandle {
        let mut tasks = JoinSet::new();

        let state = Arc::clone(&self.state);
        tasks.spawn(async move {
            run_client_listener(state).await;
            "client listener"
        });

        let state = Arc::clone(&self.state);
        let host_socket = self.host_socket;
        tasks.spawn(async move {
            run_host_listener(state, host_socket).await;
            "host listener"
        });

        let state = Arc::clone(&self.state);
        tasks.spawn(async move {
            run_cleanup_loop(state).await;
            "cleanup"
        });

        if let Some(socket) = self.diagnostics_socket {
            let state = Arc::clone(&self.state);
            tasks.spawn(async move {
                run_diagnostics_listener(state, socket).await;
                "diagnostics"
            });
        }

        info!("Relay started");
        RelayHandle {
            state: self.state,
            tasks,
        }
    }
}

/// Running relay. Dropping it stops every listener task.
pub struct RelayHandle {
    state: Arc<RelayState>,
    tasks: JoinSet<&'static str>,
}

impl RelayHandle {
    pub fn state(&self) -> &Arc<RelayState> {
        &self.state
    }

    /// Waits until any relay task ends, which only happens on failure.
    pub async fn join(&mut self) -> Result<(), RelayError> {
        match self.tasks.join_next().await {
            Some(Ok(name)) => {
                error!("Relay {} task exited", name);
                Err(RelayError::Task(format!("{name} exited")))
            }
            Some(Err(e)) => Err(RelayError::Task(e.to_string())),
            None => Ok(()),
        }
    }

    pub fn shutdown(&mut self) {
        self.tasks.abort_all();
    }
}

async fn run_client_listener(state: Arc<RelayState>) {
    let socket = Arc::clone(&state.client_socket);
    let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        match socket.recv_from(&mut buffer).await {
            Ok((len, addr)) => {
                if let Err(rejection) = state.handle_client_packet(&buffer[..len], addr).await {
                    debug!("Dropped {} bytes from client {}: {}", len, addr, rejection);
                }
            }
            Err(e) => {
                // ICMP errors from earlier replies surface here on some
                // platforms; they say nothing about the next datagram.
                warn!("Error receiving client packet: {}", e);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}

async fn run_host_listener(state: Arc<RelayState>, socket: UdpSocket) {
    let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        match socket.recv_from(&mut buffer).await {
            Ok((len, addr)) => match state.handle_host_datagram(&buffer[..len], addr).await {
                Ok(outcome) => debug!("Host {} {:?}", addr, outcome),
                Err(rejection) => debug!("Dropped host datagram from {}: {}", addr, rejection),
            },
            Err(e) => {
                error!("Error receiving host packet: {}", e);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}
