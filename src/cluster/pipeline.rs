//! Pipelines spanning several cluster nodes.

use std::sync::Arc;

use bytes::Bytes;
use futures::future::join_all;
use tracing::{debug, instrument, warn};

use super::executor::Route;
use super::provider::ClusterConnectionProvider;
use crate::batch::{Response, Slot};
use crate::core::command::{self, Cmd, FromFrame};
use crate::proto::error::{Error, Result};

/// Commands bound for one node, in queue order.
struct NodeBatch {
    address: Arc<str>,
    commands: Vec<(Cmd, Slot)>,
}

/// A pipeline whose commands are routed to the nodes owning their slots.
///
/// Each command is assigned a node when it is queued, using the current
/// slot table. [`sync`](ClusterPipeline::sync) sends one pipeline per node,
/// all of them concurrently; every node's replies are read in order, so
/// each [`Response`] gets its own reply whatever node served it.
///
/// Redirects are not followed: a command answered with `MOVED` or `ASK`
/// resolves to that error.
///
/// # Example
///
/// ```no_run
/// # async fn example(client: &shardis::ClusterClient) -> shardis::Result<()> {
/// let mut pipeline = client.pipeline();
/// pipeline.set("foo", "1")?;
/// let bar = pipeline.get("bar")?;
/// let foo = pipeline.incr("foo")?;
/// pipeline.sync().await?;
/// println!("bar = {:?}, foo = {}", bar.get()?, foo.get()?);
/// # Ok(())
/// # }
/// ```
pub struct ClusterPipeline<'a> {
    provider: &'a ClusterConnectionProvider,
    batches: Vec<NodeBatch>,
    queued: usize,
}

impl<'a> ClusterPipeline<'a> {
    /// Creates an empty pipeline over `provider`.
    pub fn new(provider: &'a ClusterConnectionProvider) -> Self {
        Self {
            provider,
            batches: Vec::new(),
            queued: 0,
        }
    }

    /// Queues `cmd` for the node chosen by `route`.
    ///
    /// # Errors
    ///
    /// [`Error::NoReachableNode`] if the route resolves to no known node
    /// (for example a slot no node owns yet).
    pub fn queue<T: FromFrame>(&mut self, route: Route, cmd: Cmd) -> Result<Response<T>> {
        let address = self.resolve(&route)?;
        let slot = Slot::default();
        let response = Response::new(self.queued, Slot::clone(&slot));
        self.queued += 1;

        match self.batches.iter_mut().find(|batch| batch.address == address) {
            Some(batch) => batch.commands.push((cmd, slot)),
            None => self.batches.push(NodeBatch {
                address,
                commands: vec![(cmd, slot)],
            }),
        }
        Ok(response)
    }

    /// Number of queued commands.
    pub fn len(&self) -> usize {
        self.batches.iter().map(|batch| batch.commands.len()).sum()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Number of nodes the queued commands will be sent to.
    pub fn node_count(&self) -> usize {
        self.batches.len()
    }

    /// Queues GET.
    pub fn get(&mut self, key: impl Into<Bytes>) -> Result<Response<Option<Bytes>>> {
        let key = key.into();
        self.queue(Route::for_key(&key), command::get(key))
    }

    /// Queues SET.
    pub fn set(&mut self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Result<Response<()>> {
        let key = key.into();
        self.queue(Route::for_key(&key), command::set(key, value))
    }

    /// Queues DEL.
    pub fn del(&mut self, key: impl Into<Bytes>) -> Result<Response<i64>> {
        let key = key.into();
        self.queue(Route::for_key(&key), command::del(key))
    }

    /// Queues EXISTS.
    pub fn exists(&mut self, key: impl Into<Bytes>) -> Result<Response<bool>> {
        let key = key.into();
        self.queue(Route::for_key(&key), command::exists(key))
    }

    /// Queues INCR.
    pub fn incr(&mut self, key: impl Into<Bytes>) -> Result<Response<i64>> {
        let key = key.into();
        self.queue(Route::for_key(&key), command::incr(key))
    }

    /// Sends every node its commands and resolves the responses.
    ///
    /// Nodes are synchronized concurrently and independently. A node that
    /// fails leaves its responses unresolved without affecting the others;
    /// the first such failure is returned once every node is done.
    #[instrument(level = "debug", skip(self), fields(nodes = self.batches.len(), commands = self.queued))]
    pub async fn sync(&mut self) -> Result<()> {
        let batches = std::mem::take(&mut self.batches);
        self.queued = 0;
        let provider = self.provider;
        let results = join_all(batches.into_iter().map(|batch| sync_node(provider, batch))).await;

        match results.into_iter().find_map(Result::err) {
            Some(e) => Err(e),
            None => {
                debug!("cluster pipeline synchronized");
                Ok(())
            }
        }
    }

    fn resolve(&self, route: &Route) -> Result<Arc<str>> {
        let topology = self.provider.topology();
        match route {
            Route::Slot(slot) => topology.node_for_slot(*slot).ok_or(Error::NoReachableNode),
            Route::Node(address) => Ok(Arc::from(address.as_str())),
            Route::Any => topology
                .snapshot()
                .nodes()
                .first()
                .cloned()
                .or_else(|| self.provider.seeds().first().map(|seed| Arc::from(seed.as_str())))
                .ok_or(Error::NoReachableNode),
        }
    }
}

async fn sync_node(provider: &ClusterConnectionProvider, batch: NodeBatch) -> Result<()> {
    let mut conn = match provider.connection_for_node(&batch.address).await {
        Ok(conn) => conn,
        Err(e) => {
            warn!(address = %batch.address, error = %e, "no connection for pipelined commands");
            return Err(e);
        }
    };

    let result = {
        let mut pipeline = conn.pipeline();
        for (cmd, slot) in batch.commands {
            pipeline.queue_into(cmd, slot);
        }
        pipeline.sync().await
    };

    match result {
        Ok(()) => Ok(()),
        Err(e) => {
            warn!(address = %batch.address, error = %e, "pipelined commands failed");
            if e.is_connection_error() {
                conn.release_broken();
            }
            Err(e)
        }
    }
}
