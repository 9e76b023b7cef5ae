//! # Core
//!
//! Single-node connections and the pooled standalone client.
//!
//! ## Modules
//!
//! - [`connection`] - One socket, its codec and handshake
//! - [`command`] - Command model, builders and reply decoders
//! - [`config`] - Connection settings, factory and address parsing
//! - [`builder`] - Client builder
//!

use std::time::Duration;

use bytes::Bytes;
use tracing::debug;

pub use crate::proto::error::{Error, Result};

use crate::pool::{ConnectionManager, PoolStats, Pooled, ResourcePool};
use command::{Cmd, FromFrame};

/// Client builder configuration.
pub mod builder;
/// Command construction helpers.
pub mod command;
/// Connection settings and factories.
pub mod config;
/// Low-level connection management.
pub mod connection;

cfg_if::cfg_if! {
    if #[cfg(feature = "tls")] {
        mod tls;
        pub use tls::TlsConnectorInner;
    }
}

/// Pooled client for a standalone server.
///
/// Every call leases a connection from the pool and returns it afterwards;
/// a connection that saw a transport failure is discarded instead. Cloning
/// is cheap and clones share the pool.
///
/// # Example
///
/// ```no_run
/// use shardis::Client;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let client = Client::connect("redis://localhost:6379").await?;
///     client.set("key", "value").await?;
///     let value = client.get("key").await?;
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct Client {
    pool: ResourcePool<ConnectionManager>,
}

impl Client {
    pub(crate) fn from_pool(pool: ResourcePool<ConnectionManager>) -> Self {
        Self { pool }
    }

    /// Connects to `addr` (`redis://host:port`, `rediss://host:port` or
    /// `host:port`) with default settings.
    ///
    /// A first connection is opened to surface configuration and network
    /// errors early.
    pub async fn connect<T: AsRef<str>>(addr: T) -> Result<Self> {
        builder::ClientBuilder::new()
            .address(addr.as_ref())
            .build()
            .await
    }

    /// Leases a connection for pipelines, transactions or raw commands.
    ///
    /// # Example
    ///
    /// ```no_run
    /// # async fn example(client: &shardis::Client) -> shardis::Result<()> {
    /// let mut conn = client.get_connection().await?;
    /// let mut tx = conn.transaction();
    /// tx.set("a", "1");
    /// let n = tx.incr("n");
    /// tx.exec().await?;
    /// println!("n = {}", n.get()?);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn get_connection(&self) -> Result<Pooled<ConnectionManager>> {
        self.pool.acquire().await
    }

    /// Runs `cmd` on a leased connection, decoding the reply as `T`.
    pub async fn execute<T: FromFrame>(&self, cmd: &Cmd) -> Result<T> {
        let mut conn = self.pool.acquire().await?;
        let result = conn.query(cmd).await;
        if let Err(e) = &result {
            if e.is_connection_error() {
                debug!(address = %conn.address(), error = %e, "discarding failed connection");
                conn.release_broken();
                return result;
            }
        }
        // a closed pool has already destroyed the connection
        let _ = conn.release();
        result
    }

    /// Pool counters.
    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Closes the pool. Leased connections are destroyed when returned.
    pub fn close(&self) {
        self.pool.close();
    }

    /// Sends a PING command to the server.
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        let result = conn.ping().await;
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_connection_error() => {
                conn.release_broken();
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Echoes the provided message back from the server.
    pub async fn echo(&self, msg: impl Into<Bytes>) -> Result<Bytes> {
        self.execute(&command::echo(msg)).await
    }

    /// Gets the value associated with the specified key.
    ///
    /// Returns `None` if the key does not exist.
    pub async fn get(&self, key: impl Into<Bytes>) -> Result<Option<Bytes>> {
        self.execute(&command::get(key)).await
    }

    /// Sets the string value of a key.
    pub async fn set(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Result<()> {
        self.execute(&command::set(key, value)).await
    }

    /// Sets the value of a key with an expiration time.
    pub async fn set_with_expiry(
        &self,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        expiry: Duration,
    ) -> Result<()> {
        self.execute(&command::set_with_expiry(key, value, expiry))
            .await
    }

    /// Removes the specified key.
    ///
    /// Returns `true` if the key was removed.
    pub async fn del(&self, key: impl Into<Bytes>) -> Result<bool> {
        self.execute(&command::del(key)).await
    }

    /// Returns true if the key exists.
    pub async fn exists(&self, key: impl Into<Bytes>) -> Result<bool> {
        self.execute(&command::exists(key)).await
    }

    /// Increments the number stored at key by one.
    pub async fn incr(&self, key: impl Into<Bytes>) -> Result<i64> {
        self.execute(&command::incr(key)).await
    }

    /// Increments the number stored at key by the specified amount.
    pub async fn incr_by(&self, key: impl Into<Bytes>, amount: i64) -> Result<i64> {
        self.execute(&command::incr_by(key, amount)).await
    }

    /// Decrements the number stored at key by one.
    pub async fn decr(&self, key: impl Into<Bytes>) -> Result<i64> {
        self.execute(&command::decr(key)).await
    }

    /// Decrements the number stored at key by the specified amount.
    pub async fn decr_by(&self, key: impl Into<Bytes>, amount: i64) -> Result<i64> {
        self.execute(&command::decr_by(key, amount)).await
    }
}
