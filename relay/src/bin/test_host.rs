//! Minimal host for manual smoke tests: registers with a relay, keeps
//! sending heartbeats and echoes every game datagram back to its sender.

use clap::Parser;
use env_logger::Env;
use log::{error, info, warn};
use shared::{
    unix_timestamp, AuthProfile, HostAuthenticator, HostCommand, Registration,
    DEFAULT_GAME_PORT, DEFAULT_HOST_REGISTER_PORT, MAX_DATAGRAM_SIZE,
};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::interval;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Registers a fake game host with a relay and echoes traffic")]
struct Args {
    /// Relay host registration address
    #[clap(short, long, default_value_t = SocketAddr::from(([127, 0, 0, 1], DEFAULT_HOST_REGISTER_PORT)))]
    relay: SocketAddr,
    /// Port the echo socket listens on
    #[clap(short, long, default_value_t = DEFAULT_GAME_PORT)]
    game_port: u16,
    #[clap(long, default_value = "TestHost")]
    host_id: String,
    #[clap(short, long, default_value_t = 8)]
    max_players: u32,
    #[clap(long, default_value = "signed")]
    auth_profile: AuthProfile,
    #[clap(long, env = "RELAY_HOST_SECRET", default_value = "CHANGE_ME", hide_env_values = true)]
    host_secret: String,
    /// Seconds between heartbeats
    #[clap(long, default_value_t = 2.0)]
    heartbeat_interval: f64,
}

fn registration(args: &Args, command: HostCommand) -> Registration {
    Registration {
        command,
        host_id: args.host_id.clone(),
        game_port: args.game_port,
        max_players: args.max_players,
        timestamp: unix_timestamp(),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let authenticator = HostAuthenticator::new(args.auth_profile, &args.host_secret);
    let heartbeat_every = Duration::try_from_secs_f64(args.heartbeat_interval)?;

    let game_socket = UdpSocket::bind(("0.0.0.0", args.game_port)).await?;
    let control_socket = UdpSocket::bind("0.0.0.0:0").await?;
    info!(
        "Echoing on {}, registering with {} from {}",
        game_socket.local_addr()?,
        args.relay,
        control_socket.local_addr()?
    );

    let datagram = authenticator.seal(&registration(&args, HostCommand::Register))?;
    control_socket.send_to(datagram.as_bytes(), args.relay).await?;
    info!("Sent REGISTER as {}", args.host_id);

    let mut heartbeat = interval(heartbeat_every);
    // Skip the first tick since it fires immediately
    heartbeat.tick().await;

    let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                match authenticator.seal(&registration(&args, HostCommand::Heartbeat)) {
                    Ok(datagram) => {
                        if let Err(e) = control_socket.send_to(datagram.as_bytes(), args.relay).await {
                            warn!("Failed to send heartbeat: {}", e);
                        }
                    }
                    Err(e) => error!("Failed to seal heartbeat: {}", e),
                }
            }
            received = game_socket.recv_from(&mut buffer) => {
                match received {
                    Ok((len, from)) => {
                        info!("Echoing {} bytes to {}", len, from);
                        if let Err(e) = game_socket.send_to(&buffer[..len], from).await {
                            warn!("Echo to {} failed: {}", from, e);
                        }
                    }
                    Err(e) => {
                        error!("Error receiving game packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
                return Ok(());
            }
        }
    }
}
