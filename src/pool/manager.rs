use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::debug;

use super::ManageResource;
use crate::core::config::ConnectionFactory;
use crate::core::connection::Connection;
use crate::proto::error::Result;

/// Pools connections to a single node.
///
/// A connection is valid until it has seen a transport error or is left
/// owing replies (a request future dropped mid-flight); the idle health
/// check is a PING.
#[derive(Clone)]
pub struct ConnectionManager {
    address: Arc<str>,
    factory: Arc<dyn ConnectionFactory>,
}

impl ConnectionManager {
    /// Creates a manager opening connections to `address` through `factory`.
    pub fn new(address: impl Into<Arc<str>>, factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            address: address.into(),
            factory,
        }
    }

    /// The node address.
    pub fn address(&self) -> &str {
        &self.address
    }
}

impl ManageResource for ConnectionManager {
    type Resource = Connection;

    fn create(&self) -> BoxFuture<'_, Result<Connection>> {
        self.factory.connect(&self.address)
    }

    fn is_valid(&self, conn: &Connection) -> bool {
        if conn.is_broken() {
            return false;
        }
        if !conn.is_in_sync() {
            debug!(address = %self.address, in_flight = conn.in_flight(), "connection out of sync");
            return false;
        }
        true
    }

    fn check_health<'a>(&'a self, conn: &'a mut Connection) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            match conn.ping().await {
                Ok(()) => true,
                Err(e) => {
                    debug!(address = %self.address, error = %e, "idle connection failed health check");
                    false
                }
            }
        })
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("address", &self.address)
            .finish()
    }
}
