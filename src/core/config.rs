use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

use super::command::CommandRenames;
use super::connection::Connection;
use crate::proto::error::{Error, Result};

/// Default port used when an address omits one.
pub const DEFAULT_PORT: u16 = 6379;

/// Default connect, read and write timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Per-connection settings handed to the connection factory.
///
/// The configuration is immutable once built and shared by every
/// connection a client opens; there is no process-wide state.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// ACL username sent with AUTH.
    pub username: Option<String>,
    /// Password sent with AUTH.
    pub password: Option<String>,
    /// Database selected after connecting.
    pub database: Option<u8>,
    /// Name registered with CLIENT SETNAME.
    pub client_name: Option<String>,
    /// Maximum time to establish the TCP (and TLS) session.
    pub connect_timeout: Duration,
    /// Maximum time to wait for a reply. `None` waits forever.
    pub read_timeout: Option<Duration>,
    /// Maximum time to wait for a write. `None` waits forever.
    pub write_timeout: Option<Duration>,
    /// Wrap connections in TLS.
    pub tls: bool,
    /// Command-name remapping applied to every request.
    pub renames: Arc<CommandRenames>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            username: None,
            password: None,
            database: None,
            client_name: None,
            connect_timeout: DEFAULT_TIMEOUT,
            read_timeout: Some(DEFAULT_TIMEOUT),
            write_timeout: Some(DEFAULT_TIMEOUT),
            tls: false,
            renames: Arc::new(CommandRenames::default()),
        }
    }
}

/// Opens connections to nodes.
///
/// The pool and the cluster executor only depend on this contract, not on a
/// particular transport.
pub trait ConnectionFactory: Send + Sync + 'static {
    /// Opens a ready-to-use connection to `address` (`host:port`).
    fn connect<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Result<Connection>>;
}

/// Factory opening TCP (or TLS) connections with a fixed [`ClientConfig`].
#[derive(Debug, Clone, Default)]
pub struct TcpConnectionFactory {
    config: Arc<ClientConfig>,
}

impl TcpConnectionFactory {
    /// Creates a factory using `config` for every connection.
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// The configuration applied to new connections.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

impl ConnectionFactory for TcpConnectionFactory {
    fn connect<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Result<Connection>> {
        Box::pin(Connection::open(address, &self.config))
    }
}

/// Normalizes a user-supplied address into `host:port`.
///
/// Accepts `redis://host:port`, `rediss://host:port` and bare `host:port`.
/// The returned flag is true for the `rediss` scheme.
pub fn parse_address(address: &str) -> Result<(String, bool)> {
    let address = address.trim();
    let with_scheme = if address.contains("://") {
        address.to_string()
    } else {
        format!("redis://{}", address)
    };

    let parsed = url::Url::parse(&with_scheme).map_err(|_| Error::InvalidArgument {
        message: format!("invalid address format: {}", address),
    })?;

    let tls = match parsed.scheme() {
        "redis" => false,
        "rediss" => true,
        _ => {
            return Err(Error::InvalidArgument {
                message: "invalid scheme, expected redis:// or rediss://".to_string(),
            })
        }
    };

    let host = parsed.host_str().ok_or_else(|| Error::InvalidArgument {
        message: "missing host in address".to_string(),
    })?;
    let port = parsed.port().unwrap_or(DEFAULT_PORT);

    Ok((format!("{}:{}", host, port), tls))
}

/// Splits a comma-separated list of seed addresses.
pub fn parse_addresses(addresses: &str) -> Result<Vec<String>> {
    let parsed = addresses
        .split(',')
        .map(str::trim)
        .filter(|addr| !addr.is_empty())
        .map(|addr| parse_address(addr).map(|(addr, _)| addr))
        .collect::<Result<Vec<_>>>()?;

    if parsed.is_empty() {
        return Err(Error::InvalidArgument {
            message: "no valid addresses provided".to_string(),
        });
    }
    Ok(parsed)
}

/// Host part of a `host:port` address, without IPv6 brackets.
pub(crate) fn host_of(address: &str) -> &str {
    let host = address.rsplit_once(':').map_or(address, |(host, _)| host);
    host.trim_start_matches('[').trim_end_matches(']')
}
