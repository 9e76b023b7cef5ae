use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use rand::seq::SliceRandom;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::topology::{ClusterTopology, SlotTable};
use crate::core::command;
use crate::core::config::ConnectionFactory;
use crate::core::connection::Connection;
use crate::pool::{ConnectionManager, PoolConfig, Pooled, ResourcePool};
use crate::proto::error::{Error, Result};
use crate::proto::frame::Frame;

/// A pooled connection to one cluster node.
pub type NodeConnection = Pooled<ConnectionManager>;

/// Hands out connections to cluster nodes and keeps the slot table fresh.
///
/// Holds one [`ResourcePool`] per node address, the seed addresses used when
/// no node is known, and the shared [`ClusterTopology`].
pub struct ClusterConnectionProvider {
    seeds: Vec<String>,
    factory: Arc<dyn ConnectionFactory>,
    pool_config: PoolConfig,
    pools: RwLock<HashMap<Arc<str>, ResourcePool<ConnectionManager>>>,
    topology: ClusterTopology,
    refresh: Mutex<()>,
    require_full_coverage: bool,
}

impl ClusterConnectionProvider {
    /// Creates a provider. No connection is opened until one is requested.
    pub fn new(
        seeds: Vec<String>,
        factory: Arc<dyn ConnectionFactory>,
        pool_config: PoolConfig,
        require_full_coverage: bool,
    ) -> Self {
        Self {
            seeds,
            factory,
            pool_config,
            pools: RwLock::new(HashMap::new()),
            topology: ClusterTopology::new(),
            refresh: Mutex::new(()),
            require_full_coverage,
        }
    }

    /// The shared slot table.
    pub fn topology(&self) -> &ClusterTopology {
        &self.topology
    }

    /// Seed addresses.
    pub fn seeds(&self) -> &[String] {
        &self.seeds
    }

    /// The pool for `address`, created on first use.
    pub fn pool_for(&self, address: &str) -> ResourcePool<ConnectionManager> {
        if let Some(pool) = self
            .pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(address)
        {
            return pool.clone();
        }

        let mut pools = self.pools.write().unwrap_or_else(PoisonError::into_inner);
        pools
            .entry(Arc::from(address))
            .or_insert_with(|| {
                debug!(address, "creating node pool");
                ResourcePool::new(
                    ConnectionManager::new(address, Arc::clone(&self.factory)),
                    self.pool_config.clone(),
                )
            })
            .clone()
    }

    /// A connection to the node at `address`.
    pub async fn connection_for_node(&self, address: &str) -> Result<NodeConnection> {
        self.pool_for(address).acquire().await
    }

    /// A connection to the owner of `slot`, or to any node while the owner
    /// is unknown (the node will redirect).
    pub async fn connection_for_slot(&self, slot: u16) -> Result<NodeConnection> {
        match self.topology.node_for_slot(slot) {
            Some(address) => self.connection_for_node(&address).await,
            None => {
                debug!(slot, "slot owner unknown, using a random node");
                self.random_connection().await
            }
        }
    }

    /// A connection to any reachable node, trying known nodes then seeds in
    /// random order.
    ///
    /// # Errors
    ///
    /// [`Error::NoReachableNode`] when every candidate fails.
    pub async fn random_connection(&self) -> Result<NodeConnection> {
        let mut candidates = self.candidates();
        candidates.shuffle(&mut rand::thread_rng());

        for address in &candidates {
            match self.connection_for_node(address).await {
                Ok(conn) => return Ok(conn),
                Err(e) => debug!(address = %address, error = %e, "node unreachable"),
            }
        }
        Err(Error::NoReachableNode)
    }

    /// Reloads the slot table with `CLUSTER SLOTS`.
    ///
    /// `hint` is asked first; the known nodes and the seeds follow. Only one
    /// refresh runs at a time: a call made while another is in flight
    /// returns `Ok(false)` without doing anything.
    pub async fn renew_topology(&self, hint: Option<&str>) -> Result<bool> {
        let Ok(_guard) = self.refresh.try_lock() else {
            debug!("topology refresh already running");
            return Ok(false);
        };

        let mut candidates = self.candidates();
        if let Some(hint) = hint {
            candidates.retain(|address| address != hint);
            candidates.insert(0, hint.to_string());
        }

        let mut last_error = None;
        for address in &candidates {
            match self.fetch_slots(address).await {
                Ok(table) => {
                    info!(
                        address = %address,
                        nodes = table.nodes().len(),
                        covered = table.covered(),
                        "cluster topology refreshed"
                    );
                    self.topology.replace(table);
                    self.prune_pools();
                    return Ok(true);
                }
                Err(e) => {
                    warn!(address = %address, error = %e, "topology refresh failed");
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if !e.is_connection_error() => Err(e),
            _ => Err(Error::NoReachableNode),
        }
    }

    /// Closes every node pool.
    pub fn close(&self) {
        let pools: Vec<_> = self
            .pools
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (_, pool) in pools {
            pool.close();
        }
    }

    /// Addresses with an open pool.
    pub fn pooled_nodes(&self) -> Vec<Arc<str>> {
        self.pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    async fn fetch_slots(&self, address: &str) -> Result<SlotTable> {
        let mut conn = self.connection_for_node(address).await?;
        let result = query_slots(&mut conn).await;
        match &result {
            Err(e) if e.is_connection_error() => conn.release_broken(),
            _ => drop(conn),
        }
        SlotTable::from_cluster_slots(result?, self.require_full_coverage)
    }

    /// Known primaries first, then seeds not already listed.
    fn candidates(&self) -> Vec<String> {
        let mut candidates: Vec<String> = self
            .topology
            .snapshot()
            .nodes()
            .iter()
            .map(|node| node.to_string())
            .collect();
        for seed in &self.seeds {
            if !candidates.contains(seed) {
                candidates.push(seed.clone());
            }
        }
        candidates
    }

    /// Drops idle pools of nodes no longer in the table.
    ///
    /// Pools with borrowed connections are kept until a later refresh.
    fn prune_pools(&self) {
        let table = self.topology.snapshot();
        let mut pools = self.pools.write().unwrap_or_else(PoisonError::into_inner);
        pools.retain(|address, pool| {
            let keep = table.nodes().contains(address)
                || self.seeds.iter().any(|seed| **seed == **address)
                || pool.stats().borrowed > 0;
            if !keep {
                debug!(address = %address, "closing pool of departed node");
                pool.close();
            }
            keep
        });
    }
}

async fn query_slots(conn: &mut Connection) -> Result<Frame> {
    conn.query::<Frame>(&command::cluster_slots()).await
}

impl fmt::Debug for ClusterConnectionProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterConnectionProvider")
            .field("seeds", &self.seeds)
            .field("topology", &self.topology.snapshot())
            .field("pools", &self.pooled_nodes())
            .finish()
    }
}
