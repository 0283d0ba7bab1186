//! Relay configuration and its command-line surface
//!
//! Every limit, timeout, port and secret lives in one [`RelayConfig`] that is
//! built once at startup and shared by reference with every component.
//! Defaults mirror the values the relay has always shipped with.

use crate::error::RelayError;
use clap::Parser;
use shared::{AuthProfile, DEFAULT_CLIENT_PORT, DEFAULT_HOST_REGISTER_PORT};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind_address: IpAddr,
    pub client_port: u16,
    pub host_port: u16,
    /// Optional read-only diagnostics socket
    pub diagnostics_addr: Option<SocketAddr>,

    pub auth_profile: AuthProfile,
    pub host_secret: String,
    pub use_token_auth: bool,
    pub token: String,

    pub max_clients: usize,
    pub max_hosts: usize,
    pub max_pending_handshakes: usize,
    pub max_players_per_host: u32,

    pub handshake_timeout: Duration,
    pub client_timeout: Duration,
    pub host_timeout: Duration,
    /// Allowed skew between a registration timestamp and relay wall clock
    pub replay_window: Duration,
    pub min_heartbeat_interval: Duration,

    /// Length of the fixed packet-counting window for both profiles
    pub rate_window: Duration,
    pub max_client_packets_per_window: u32,
    pub max_strikes_per_ip: u32,
    pub ip_blacklist_duration: Duration,
    pub reject_cooldown: Duration,
    pub auth_grace_window: Duration,

    pub max_host_packets_per_window: u32,
    pub host_cooldown: Duration,
    pub max_host_strikes: u32,
    pub host_blacklist_duration: Duration,
    /// Strikes older than this are forgotten
    pub strike_ttl: Duration,

    pub cleanup_interval: Duration,
    pub table_hard_limit: usize,
    pub table_trim_target: usize,
    /// Cleanup ticks between summary log lines, 0 disables them
    pub stats_log_interval: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            client_port: DEFAULT_CLIENT_PORT,
            host_port: DEFAULT_HOST_REGISTER_PORT,
            diagnostics_addr: None,

            auth_profile: AuthProfile::Signed,
            host_secret: "CHANGE_ME".to_string(),
            use_token_auth: false,
            token: "MY_SECRET_TOKEN".to_string(),

            max_clients: 200,
            max_hosts: 50,
            max_pending_handshakes: 64,
            max_players_per_host: 200,

            handshake_timeout: Duration::from_secs(3),
            client_timeout: Duration::from_secs(15),
            host_timeout: Duration::from_secs(15),
            replay_window: Duration::from_secs(30),
            min_heartbeat_interval: Duration::from_millis(500),

            rate_window: Duration::from_secs(1),
            max_client_packets_per_window: 60,
            max_strikes_per_ip: 5,
            ip_blacklist_duration: Duration::from_secs(86_400),
            reject_cooldown: Duration::from_secs(11),
            auth_grace_window: Duration::from_secs(5),

            max_host_packets_per_window: 5,
            host_cooldown: Duration::from_secs(3),
            max_host_strikes: 5,
            host_blacklist_duration: Duration::from_secs(86_400),
            strike_ttl: Duration::from_secs(600),

            cleanup_interval: Duration::from_secs(1),
            table_hard_limit: 50_000,
            table_trim_target: 40_000,
            stats_log_interval: 30,
        }
    }
}

impl RelayConfig {
    pub fn client_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.client_port)
    }

    pub fn host_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.host_port)
    }

    /// Rejects combinations the relay cannot run with.
    pub fn validate(&self) -> Result<(), RelayError> {
        let zero_durations = [
            ("rate window", self.rate_window),
            ("cleanup interval", self.cleanup_interval),
            ("handshake timeout", self.handshake_timeout),
            ("client timeout", self.client_timeout),
            ("host timeout", self.host_timeout),
        ];
        for (name, value) in zero_durations {
            if value.is_zero() {
                return Err(RelayError::Config(format!("{name} must be positive")));
            }
        }

        if self.max_client_packets_per_window == 0 || self.max_host_packets_per_window == 0 {
            return Err(RelayError::Config(
                "packet ceilings must be at least 1".to_string(),
            ));
        }
        if self.max_strikes_per_ip == 0 || self.max_host_strikes == 0 {
            return Err(RelayError::Config("strike ceilings must be at least 1".to_string()));
        }
        if self.max_hosts == 0 || self.max_clients == 0 {
            return Err(RelayError::Config(
                "max hosts and max clients must be at least 1".to_string(),
            ));
        }
        if self.table_trim_target > self.table_hard_limit {
            return Err(RelayError::Config(format!(
                "table trim target {} exceeds hard limit {}",
                self.table_trim_target, self.table_hard_limit
            )));
        }
        if self.client_port != 0 && self.client_port == self.host_port {
            return Err(RelayError::Config(format!(
                "client and host ports must differ (both {})",
                self.client_port
            )));
        }
        if self.host_secret.is_empty() {
            return Err(RelayError::Config("host secret must not be empty".to_string()));
        }
        if self.use_token_auth && self.token.is_empty() {
            return Err(RelayError::Config(
                "token auth is enabled but the token is empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// UDP rendezvous relay between game clients and NAT'd hosts
#[derive(Parser, Debug)]
#[clap(author, version, about)]
pub struct Args {
    /// Address both listeners bind to
    #[clap(short, long, default_value = "0.0.0.0")]
    pub bind: IpAddr,
    /// Port clients connect to
    #[clap(short, long, default_value_t = DEFAULT_CLIENT_PORT)]
    pub client_port: u16,
    /// Port hosts send REGISTER/HEARTBEAT to
    #[clap(short = 'H', long, default_value_t = DEFAULT_HOST_REGISTER_PORT)]
    pub host_port: u16,
    /// Serve read-only diagnostics on this address
    #[clap(long)]
    pub diagnostics: Option<SocketAddr>,

    /// Registration profile: signed or envelope
    #[clap(long, default_value = "signed")]
    pub auth_profile: AuthProfile,
    #[clap(long, env = "RELAY_HOST_SECRET", default_value = "CHANGE_ME", hide_env_values = true)]
    pub host_secret: String,
    /// Require clients to send AUTH|<token> before their first packet
    #[clap(long)]
    pub token_auth: bool,
    #[clap(long, env = "RELAY_CLIENT_TOKEN", default_value = "MY_SECRET_TOKEN", hide_env_values = true)]
    pub token: String,

    #[clap(long, default_value_t = 200)]
    pub max_clients: usize,
    #[clap(long, default_value_t = 50)]
    pub max_hosts: usize,
    #[clap(long, default_value_t = 64)]
    pub max_pending_handshakes: usize,
    /// Upper bound applied to each host's declared capacity
    #[clap(long, default_value_t = 200)]
    pub max_players_per_host: u32,

    /// Seconds a session may wait for the host's first reply
    #[clap(long, default_value_t = 3.0)]
    pub handshake_timeout: f64,
    #[clap(long, default_value_t = 15.0)]
    pub client_timeout: f64,
    #[clap(long, default_value_t = 15.0)]
    pub host_timeout: f64,
    #[clap(long, default_value_t = 30.0)]
    pub replay_window: f64,
    #[clap(long, default_value_t = 0.5)]
    pub min_heartbeat_interval: f64,

    #[clap(long, default_value_t = 60)]
    pub max_packets_per_second: u32,
    #[clap(long, default_value_t = 5)]
    pub max_strikes_per_ip: u32,
    #[clap(long, default_value_t = 86_400.0)]
    pub ip_blacklist_duration: f64,
    #[clap(long, default_value_t = 11.0)]
    pub reject_cooldown: f64,
    #[clap(long, default_value_t = 5.0)]
    pub auth_grace_window: f64,

    #[clap(long, default_value_t = 5)]
    pub max_host_packets_per_second: u32,
    #[clap(long, default_value_t = 3.0)]
    pub host_cooldown: f64,
    #[clap(long, default_value_t = 5)]
    pub max_host_strikes: u32,
    #[clap(long, default_value_t = 86_400.0)]
    pub host_blacklist_duration: f64,
    #[clap(long, default_value_t = 600.0)]
    pub strike_ttl: f64,

    #[clap(long, default_value_t = 1.0)]
    pub cleanup_interval: f64,
    #[clap(long, default_value_t = 50_000)]
    pub table_hard_limit: usize,
    #[clap(long, default_value_t = 40_000)]
    pub table_trim_target: usize,
    #[clap(long, default_value_t = 30)]
    pub stats_log_interval: u32,
}

fn seconds(name: &str, value: f64) -> Result<Duration, RelayError> {
    Duration::try_from_secs_f64(value)
        .map_err(|_| RelayError::Config(format!("{name} must be a non-negative number of seconds")))
}

impl TryFrom<Args> for RelayConfig {
    type Error = RelayError;

    fn try_from(args: Args) -> Result<Self, Self::Error> {
        let config = RelayConfig {
            bind_address: args.bind,
            client_port: args.client_port,
            host_port: args.host_port,
            diagnostics_addr: args.diagnostics,

            auth_profile: args.auth_profile,
            host_secret: args.host_secret,
            use_token_auth: args.token_auth,
            token: args.token,

            max_clients: args.max_clients,
            max_hosts: args.max_hosts,
            max_pending_handshakes: args.max_pending_handshakes,
            max_players_per_host: args.max_players_per_host,

            handshake_timeout: seconds("handshake timeout", args.handshake_timeout)?,
            client_timeout: seconds("client timeout", args.client_timeout)?,
            host_timeout: seconds("host timeout", args.host_timeout)?,
            replay_window: seconds("replay window", args.replay_window)?,
            min_heartbeat_interval: seconds("min heartbeat interval", args.min_heartbeat_interval)?,

            rate_window: Duration::from_secs(1),
            max_client_packets_per_window: args.max_packets_per_second,
            max_strikes_per_ip: args.max_strikes_per_ip,
            ip_blacklist_duration: seconds("ip blacklist duration", args.ip_blacklist_duration)?,
            reject_cooldown: seconds("reject cooldown", args.reject_cooldown)?,
            auth_grace_window: seconds("auth grace window", args.auth_grace_window)?,

            max_host_packets_per_window: args.max_host_packets_per_second,
            host_cooldown: seconds("host cooldown", args.host_cooldown)?,
            max_host_strikes: args.max_host_strikes,
            host_blacklist_duration: seconds(
                "host blacklist duration",
                args.host_blacklist_duration,
            )?,
            strike_ttl: seconds("strike ttl", args.strike_ttl)?,

            cleanup_interval: seconds("cleanup interval", args.cleanup_interval)?,
            table_hard_limit: args.table_hard_limit,
            table_trim_target: args.table_trim_target,
            stats_log_interval: args.stats_log_interval,
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = RelayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.client_addr().port(), 7778);
        assert_eq!(config.host_addr().port(), 9001);
    }

    #[test]
    fn test_args_defaults_match_config_defaults() {
        let args = Args::try_parse_from(["relay"]).unwrap();
        let config = RelayConfig::try_from(args).unwrap();
        let defaults = RelayConfig::default();

        assert_eq!(config.client_port, defaults.client_port);
        assert_eq!(config.host_port, defaults.host_port);
        assert_eq!(config.max_clients, defaults.max_clients);
        assert_eq!(config.max_hosts, defaults.max_hosts);
        assert_eq!(config.handshake_timeout, defaults.handshake_timeout);
        assert_eq!(config.min_heartbeat_interval, defaults.min_heartbeat_interval);
        assert_eq!(config.ip_blacklist_duration, defaults.ip_blacklist_duration);
        assert_eq!(config.table_hard_limit, defaults.table_hard_limit);
        assert_eq!(config.auth_profile, AuthProfile::Signed);
        assert!(!config.use_token_auth);
    }

    #[test]
    fn test_args_override() {
        let args = Args::try_parse_from([
            "relay",
            "--client-port",
            "17778",
            "--host-port",
            "19001",
            "--auth-profile",
            "envelope",
            "--token-auth",
            "--token",
            "letmein",
            "--handshake-timeout",
            "1.5",
        ])
        .unwrap();
        let config = RelayConfig::try_from(args).unwrap();

        assert_eq!(config.client_port, 17778);
        assert_eq!(config.host_port, 19001);
        assert_eq!(config.auth_profile, AuthProfile::Envelope);
        assert!(config.use_token_auth);
        assert_eq!(config.token, "letmein");
        assert_eq!(config.handshake_timeout, Duration::from_millis(1500));
    }

    #[test]
    fn test_rejects_negative_durations() {
        let args =
            Args::try_parse_from(["relay", "--client-timeout=-1"]).unwrap();
        assert!(matches!(
            RelayConfig::try_from(args),
            Err(RelayError::Config(_))
        ));
    }

    #[test]
    fn test_rejects_unknown_profile() {
        assert!(Args::try_parse_from(["relay", "--auth-profile", "plain"]).is_err());
    }

    #[test]
    fn test_validate_catches_nonsense() {
        let mut config = RelayConfig::default();
        config.table_trim_target = config.table_hard_limit + 1;
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.rate_window = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.host_port = config.client_port;
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.use_token_auth = true;
        config.token.clear();
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.max_strikes_per_ip = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ephemeral_ports_are_allowed() {
        let config = RelayConfig {
            client_port: 0,
            host_port: 0,
            ..RelayConfig::default()
        };
        assert!(config.validate().is_ok());
    }
}
