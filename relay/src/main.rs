use clap::Parser;
use env_logger::Env;
use log::{error, info};
use relay::config::{Args, RelayConfig};
use relay::network::RelayServer;

/// Parses arguments, binds the relay sockets and runs until Ctrl+C or a
/// task failure.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = RelayConfig::try_from(args)?;

    let server = RelayServer::bind(config).await?;
    let mut relay = server.spawn();

    tokio::select! {
        result = relay.join() => {
            if let Err(e) = result {
                error!("Relay stopped: {}", e);
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    relay.shutdown();
    Ok(())
}
