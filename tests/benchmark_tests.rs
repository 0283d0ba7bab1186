//! Performance benchmarks for the relay's hot paths

use relay::admission::ClientAdmission;
use relay::config::RelayConfig;
use relay::network::RelayServer;
use shared::{AuthProfile, HostAuthenticator, HostCommand, Registration};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;

fn registration() -> Registration {
    Registration {
        command: HostCommand::Heartbeat,
        host_id: "BenchHost".to_string(),
        game_port: 9000,
        max_players: 16,
        timestamp: 1_700_000_000,
    }
}

/// Benchmarks signed-profile verification
#[test]
fn benchmark_signed_open() {
    let auth = HostAuthenticator::new(AuthProfile::Signed, "CHANGE_ME");
    let datagram = auth.seal(&registration()).unwrap();

    let iterations = 10_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let _ = auth.open(datagram.as_bytes()).unwrap();
    }

    let duration = start.elapsed();
    println!(
        "Signed open: {} iterations in {:?} ({:.2} μs/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    // Should complete in under 2 seconds
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks envelope verification and decryption
#[test]
fn benchmark_envelope_open() {
    let auth = HostAuthenticator::new(AuthProfile::Envelope, "CHANGE_ME");
    let datagram = auth.seal(&registration()).unwrap();

    let iterations = 2_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let _ = auth.open(datagram.as_bytes()).unwrap();
    }

    let duration = start.elapsed();
    println!(
        "Envelope open: {} iterations in {:?} ({:.2} μs/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert!(duration.as_millis() < 5000);
}

/// Benchmarks rejecting forged signatures, the path a flood would take
#[test]
fn benchmark_forged_rejection() {
    let auth = HostAuthenticator::new(AuthProfile::Signed, "CHANGE_ME");
    let forged = HostAuthenticator::new(AuthProfile::Signed, "WRONG")
        .seal(&registration())
        .unwrap();

    let iterations = 10_000;
    let start = Instant::now();

    for _ in 0..iterations {
        assert!(auth.open(forged.as_bytes()).is_err());
    }

    let duration = start.elapsed();
    println!("Forged rejection: {} iterations in {:?}", iterations, duration);
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks client admission across many endpoints
#[test]
fn benchmark_client_admission() {
    let config = RelayConfig::default();
    let mut admission = ClientAdmission::new(&config);
    let now = Instant::now();

    let endpoints: Vec<SocketAddr> = (0..1000u16)
        .map(|i| SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, (i / 250) as u8, (i % 250) as u8)), 20000 + i))
        .collect();

    let iterations = 100_000;
    let start = Instant::now();

    for i in 0..iterations {
        let _ = admission.admit(endpoints[i % endpoints.len()], now);
    }

    let duration = start.elapsed();
    println!(
        "Client admission: {} checks in {:?} ({:.2} ns/check)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    assert!(duration.as_millis() < 2000);
}

/// Benchmarks round trips through a live relay on loopback
#[tokio::test]
async fn benchmark_forwarding_round_trips() {
    let config = RelayConfig {
        bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        client_port: 0,
        host_port: 0,
        max_client_packets_per_window: 1_000_000,
        ..RelayConfig::default()
    };
    let server = RelayServer::bind(config).await.unwrap();
    let client_addr = server.client_addr().unwrap();
    let host_addr = server.host_addr().unwrap();
    let relay = server.spawn();

    // Echo host
    let game = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let control = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let datagram = HostAuthenticator::new(AuthProfile::Signed, "CHANGE_ME")
        .seal(&Registration {
            command: HostCommand::Register,
            host_id: "BenchHost".to_string(),
            game_port: game.local_addr().unwrap().port(),
            max_players: 16,
            timestamp: shared::unix_timestamp(),
        })
        .unwrap();
    control.send_to(datagram.as_bytes(), host_addr).await.unwrap();
    tokio::spawn(async move {
        let mut buffer = [0u8; 2048];
        while let Ok((len, from)) = game.recv_from(&mut buffer).await {
            let _ = game.send_to(&buffer[..len], from).await;
        }
    });

    for _ in 0..200 {
        if !relay.state().host_list().await.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let payload = [7u8; 256];
    let mut buffer = [0u8; 2048];

    let iterations = 1_000;
    let start = Instant::now();

    for _ in 0..iterations {
        client.send_to(&payload, client_addr).await.unwrap();
        let len = tokio::time::timeout(Duration::from_secs(2), client.recv(&mut buffer))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(len, payload.len());
    }

    let duration = start.elapsed();
    println!(
        "Forwarding: {} round trips in {:?} ({:.2} μs/round trip)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    // Should complete in under 5 seconds
    assert!(duration.as_millis() < 5000);
}
