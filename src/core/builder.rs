use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::debug;

use super::command::Command;
use super::config::{parse_address, ClientConfig, TcpConnectionFactory};
use crate::pool::{ConnectionManager, PoolConfig, ResourcePool};
use crate::{Client, Error};

/// Builder for configuring and creating a pooled [`Client`].
///
/// # Example
///
/// ```no_run
/// use shardis::core::builder::ClientBuilder;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let client = ClientBuilder::new()
///     .address("redis://localhost:6379")
///     .password("secret")
///     .database(0)
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct ClientBuilder {
    address: Option<String>,
    config: ClientConfig,
    pool: PoolConfig,
}

impl ClientBuilder {
    /// Creates a new [`ClientBuilder`] instance.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the server address.
    ///
    /// # Arguments
    ///
    /// * `address` - `redis://host:port`, `rediss://host:port` for TLS, or `host:port`
    #[inline]
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Sets the password for authentication.
    #[inline]
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.config.password = Some(password.into());
        self
    }

    /// Sets the username for ACL authentication.
    #[inline]
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.config.username = Some(username.into());
        self
    }

    /// Sets the database number to select after connection.
    ///
    /// # Arguments
    ///
    /// * `database` - Database number (0-15)
    #[inline]
    pub fn database(mut self, database: u8) -> Self {
        self.config.database = Some(database);
        self
    }

    /// Sets the client connection name.
    ///
    /// # Arguments
    ///
    /// * `name` - Client name displayed in `CLIENT LIST`
    #[inline]
    pub fn client_name(mut self, name: impl Into<String>) -> Self {
        self.config.client_name = Some(name.into());
        self
    }

    /// Sets the connection timeout.
    #[inline]
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Sets the read timeout for commands.
    ///
    /// # Arguments
    ///
    /// * `timeout` - Maximum time to wait for a response. `None` means no timeout.
    #[inline]
    pub fn read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.read_timeout = timeout;
        self
    }

    /// Sets the write timeout for commands.
    ///
    /// # Arguments
    ///
    /// * `timeout` - Maximum time to wait for writes. `None` means no timeout.
    #[inline]
    pub fn write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.write_timeout = timeout;
        self
    }

    /// Enables or disables TLS encryption.
    #[inline]
    pub fn tls(mut self, enabled: bool) -> Self {
        self.config.tls = enabled;
        self
    }

    /// Sets the pool settings.
    #[inline]
    pub fn pool_config(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Sends `command` under `wire_name`, for servers using `rename-command`.
    #[inline]
    pub fn rename_command(mut self, command: Command, wire_name: impl Into<Bytes>) -> Self {
        Arc::make_mut(&mut self.config.renames).rename(command, wire_name);
        self
    }

    /// Builds the [`Client`], opening a first connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if address is not set or invalid.
    /// Returns [`Error::ResourceCreation`] if the first connection fails.
    pub async fn build(self) -> Result<Client, Error> {
        let address = self.address.ok_or_else(|| Error::InvalidArgument {
            message: "address is required".to_string(),
        })?;
        let (address, tls) = parse_address(&address)?;

        let mut config = self.config;
        config.tls |= tls;

        let factory = Arc::new(TcpConnectionFactory::new(config));
        let pool = ResourcePool::new(ConnectionManager::new(address.as_str(), factory), self.pool);

        let conn = pool.acquire().await?;
        drop(conn);
        debug!(address = %address, "client ready");

        Ok(Client::from_pool(pool))
    }
}
