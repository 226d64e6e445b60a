//! Network engine configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::chain::ChainProfile;
use crate::error::ConfigError;

/// Wire scheme of a server endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// Plain TCP.
    Tcp,
    /// TLS 1.2+ with SNI.
    Ssl,
}

impl std::fmt::Display for Scheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scheme::Tcp => write!(f, "tcp"),
            Scheme::Ssl => write!(f, "ssl"),
        }
    }
}

/// An ElectrumX server endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerAddr {
    /// Host name or IP.
    pub host: String,
    /// Port.
    pub port: u16,
    /// Wire scheme.
    pub scheme: Scheme,
}

impl ServerAddr {
    /// Constructs an endpoint from parts.
    pub fn new(host: impl Into<String>, port: u16, scheme: Scheme) -> Self {
        ServerAddr {
            host: host.into(),
            port,
            scheme,
        }
    }

    /// `host:port`, the dedup key in the known-peers set.
    #[must_use]
    pub fn host_port(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Tor hidden services are reachable only through the socks proxy.
    #[must_use]
    pub fn is_onion(&self) -> bool {
        self.host.ends_with(".onion")
    }
}

impl std::fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

impl FromStr for ServerAddr {
    type Err = ConfigError;

    /// Parses `ssl://host:port` or `tcp://host:port`. A bare `host:port`
    /// defaults to ssl, which every public server speaks.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || ConfigError::InvalidServerAddr(s.to_string());
        let (scheme, rest) = match s.split_once("://") {
            Some(("ssl", rest)) => (Scheme::Ssl, rest),
            Some(("tcp", rest)) => (Scheme::Tcp, rest),
            Some(_) => return Err(bad()),
            None => (Scheme::Ssl, s),
        };
        let (host, port) = rest.rsplit_once(':').ok_or_else(bad)?;
        if host.is_empty() {
            return Err(bad());
        }
        let port = port.parse::<u16>().map_err(|_| bad())?;
        Ok(ServerAddr::new(host, port, scheme))
    }
}

/// Per-request deadlines. Broadcast gets a longer one because some servers
/// relay synchronously.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    /// Ordinary request deadline.
    pub request: Duration,
    /// `blockchain.transaction.broadcast` deadline.
    pub broadcast: Duration,
    /// `server.ping` deadline.
    pub ping: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            request: Duration::from_secs(30),
            broadcast: Duration::from_secs(60),
            ping: Duration::from_secs(10),
        }
    }
}

/// Immutable engine configuration, threaded through constructors.
#[derive(Debug, Clone)]
pub struct ElectrumConfig {
    /// Coin and net specifics.
    pub chain: ChainProfile,
    /// Directory holding `blockchain_headers` for this coin and net.
    pub data_dir: PathBuf,
    /// Bootstrap server. Required.
    pub trusted_peer: ServerAddr,
    /// Local socks5 proxy port for onion endpoints. `None` disables onion
    /// routing entirely.
    pub proxy_port: Option<u16>,
    /// Accept self-signed server certificates. Explicitly opted into for dev
    /// servers.
    pub skip_tls_verify: bool,
    /// Request deadlines.
    pub timeouts: Timeouts,
}

impl ElectrumConfig {
    /// Validates cross-field constraints that a plain struct literal cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.trusted_peer.host.is_empty() {
            return Err(ConfigError::MissingTrustedPeer);
        }
        if self.trusted_peer.is_onion() && self.proxy_port.is_none() {
            return Err(ConfigError::OnionWithoutProxy);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_schemes() {
        let ssl: ServerAddr = "ssl://electrum.example.org:50002".parse().unwrap();
        assert_eq!(ssl.scheme, Scheme::Ssl);
        assert_eq!(ssl.port, 50002);

        let tcp: ServerAddr = "tcp://127.0.0.1:50001".parse().unwrap();
        assert_eq!(tcp.scheme, Scheme::Tcp);
        assert_eq!(tcp.host, "127.0.0.1");

        let bare: ServerAddr = "electrum.example.org:50002".parse().unwrap();
        assert_eq!(bare.scheme, Scheme::Ssl);
    }

    #[test]
    fn rejects_malformed_addresses() {
        assert!("".parse::<ServerAddr>().is_err());
        assert!("http://h:1".parse::<ServerAddr>().is_err());
        assert!("ssl://nohostport".parse::<ServerAddr>().is_err());
        assert!("ssl://:50002".parse::<ServerAddr>().is_err());
        assert!("ssl://h:notaport".parse::<ServerAddr>().is_err());
    }

    #[test]
    fn onion_detection() {
        let onion: ServerAddr = "tcp://abcdefg.onion:50001".parse().unwrap();
        assert!(onion.is_onion());
        assert!(!"tcp://example.org:50001"
            .parse::<ServerAddr>()
            .unwrap()
            .is_onion());
    }
}
