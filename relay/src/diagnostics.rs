//! Read-only diagnostics over UDP
//!
//! Each datagram is a bincode `DiagnosticsRequest`; the answer goes back to
//! the sender as a bincode `DiagnosticsResponse`. Nothing here can change
//! relay state.

use crate::error::RelayError;
use crate::state::RelayState;
use log::{debug, error, warn};
use shared::{DiagnosticsRequest, DiagnosticsResponse};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;

impl RelayState {
    pub async fn answer_diagnostics(&self, request: DiagnosticsRequest) -> DiagnosticsResponse {
        match request {
            DiagnosticsRequest::Stats => DiagnosticsResponse::Stats(self.stats().await),
            DiagnosticsRequest::Hosts => DiagnosticsResponse::Hosts(self.host_list().await),
            DiagnosticsRequest::Sessions => {
                DiagnosticsResponse::Sessions(self.session_list().await)
            }
        }
    }

    async fn diagnostics_reply(&self, data: &[u8]) -> Result<Vec<u8>, RelayError> {
        let request = DiagnosticsRequest::decode(data)?;
        Ok(self.answer_diagnostics(request).await.encode()?)
    }
}

pub async fn run_diagnostics_listener(state: Arc<RelayState>, socket: UdpSocket) {
    let mut buffer = [0u8; 512];

    loop {
        match socket.recv_from(&mut buffer).await {
            Ok((len, addr)) => match state.diagnostics_reply(&buffer[..len]).await {
                Ok(reply) => {
                    if let Err(e) = socket.send_to(&reply, addr).await {
                        warn!("Failed to send diagnostics to {}: {}", addr, e);
                    }
                }
                Err(e) => debug!("Bad diagnostics request from {}: {}", addr, e),
            },
            Err(e) => {
                error!("Error receiving diagnostics request: {}", e);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;

    #[tokio::test]
    async fn test_answers_each_request_kind() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let state = RelayState::new(RelayConfig::default(), Arc::new(socket));

        assert!(matches!(
            state.answer_diagnostics(DiagnosticsRequest::Stats).await,
            DiagnosticsResponse::Stats(_)
        ));
        assert_eq!(
            state.answer_diagnostics(DiagnosticsRequest::Hosts).await,
            DiagnosticsResponse::Hosts(Vec::new())
        );
        assert_eq!(
            state.answer_diagnostics(DiagnosticsRequest::Sessions).await,
            DiagnosticsResponse::Sessions(Vec::new())
        );
    }

    #[tokio::test]
    async fn test_listener_round_trip() {
        let relay_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let state = Arc::new(RelayState::new(
            RelayConfig::default(),
            Arc::new(relay_socket),
        ));
        let diagnostics = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = diagnostics.local_addr().unwrap();
        let listener = tokio::spawn(run_diagnostics_listener(Arc::clone(&state), diagnostics));

        let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        // Garbage is ignored, the next valid request is still answered
        probe.send_to(&[0xff; 8], addr).await.unwrap();
        probe
            .send_to(&DiagnosticsRequest::Stats.encode().unwrap(), addr)
            .await
            .unwrap();

        let mut buffer = vec![0u8; 4096];
        let len = tokio::time::timeout(Duration::from_secs(2), probe.recv(&mut buffer))
            .await
            .unwrap()
            .unwrap();
        match DiagnosticsResponse::decode(&buffer[..len]).unwrap() {
            DiagnosticsResponse::Stats(stats) => assert_eq!(stats.max_hosts, 50),
            other => panic!("Unexpected response: {:?}", other),
        }

        listener.abort();
    }
}
