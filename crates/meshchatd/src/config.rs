//! Configuration for meshchatd

use clap::Parser;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

/// Port every overlay node listens on
pub const MESHCHAT_PORT: u16 = 8008;

/// meshchatd - encrypted peer-to-peer chat overlay
#[derive(Parser, Debug, Clone)]
#[command(name = "meshchatd")]
#[command(about = "Encrypted peer-to-peer chat overlay node")]
pub struct Config {
    /// IP address to listen on and to originate connections from
    #[arg(short, long, default_value = "0.0.0.0", env = "MESHCHAT_LISTEN_IP")]
    pub listen_ip: IpAddr,

    /// Overlay port, shared by every node
    #[arg(short, long, default_value_t = MESHCHAT_PORT, env = "MESHCHAT_PORT")]
    pub port: u16,

    /// Directory holding the identity key and trust list
    #[arg(short, long, default_value = "./.key", env = "MESHCHAT_KEY_DIR")]
    pub key_dir: PathBuf,

    /// Newline-delimited list of bootstrap addresses
    #[arg(long, default_value = "./known_networks")]
    pub known_networks: PathBuf,

    /// Join the network through this address instead of hosting
    #[arg(short, long)]
    pub join: Option<IpAddr>,

    /// Generate a fresh identity before starting
    #[arg(long)]
    pub create_identity: bool,

    /// Seconds allowed for TCP connect plus handshake
    #[arg(long, default_value = "10")]
    pub handshake_timeout_secs: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.port == 0 {
            anyhow::bail!("Port cannot be zero: every node must listen on the same known port");
        }
        if self.handshake_timeout_secs == 0 {
            anyhow::bail!("Handshake timeout must be at least one second");
        }
        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            anyhow::bail!("Unknown log format: {}", self.log_format);
        }
        Ok(())
    }

    /// Runtime settings for the overlay
    pub fn overlay(&self) -> OverlayConfig {
        OverlayConfig {
            listen_ip: self.listen_ip,
            port: self.port,
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            known_networks: self.known_networks.clone(),
        }
    }
}

/// Settings the overlay needs at runtime
#[derive(Debug, Clone)]
pub struct OverlayConfig {
    /// Listen address; outbound sockets bind to it when specified
    pub listen_ip: IpAddr,
    /// Port used for listening and for every outbound connection
    pub port: u16,
    /// Upper bound on TCP connect plus handshake
    pub handshake_timeout: Duration,
    /// Bootstrap address list
    pub known_networks: PathBuf,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: MESHCHAT_PORT,
            handshake_timeout: Duration::from_secs(10),
            known_networks: PathBuf::from("./known_networks"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::parse_from(["meshchatd"]);
        assert_eq!(config.port, MESHCHAT_PORT);
        assert!(config.join.is_none());
        assert!(config.validate().is_ok());

        let overlay = config.overlay();
        assert_eq!(overlay.handshake_timeout, Duration::from_secs(10));
        assert!(overlay.listen_ip.is_unspecified());
    }

    #[test]
    fn test_join_and_validation() {
        let config = Config::parse_from(["meshchatd", "--join", "10.0.0.7", "--port", "0"]);
        assert_eq!(config.join, Some("10.0.0.7".parse().unwrap()));
        assert!(config.validate().is_err());

        let config = Config::parse_from(["meshchatd", "--log-format", "xml"]);
        assert!(config.validate().is_err());
    }
}
