use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use super::aggregate::ReplyPolicy;
use super::config::ClusterConfig;
use super::executor::{Backoff, ClusterCommandExecutor, Route};
use super::pipeline::ClusterPipeline;
use super::provider::{ClusterConnectionProvider, NodeConnection};
use super::slot::key_slot;
use crate::core::command::{self, Cmd, Command, FromFrame};
use crate::core::config::{parse_addresses, TcpConnectionFactory};
use crate::core::connection::Connection;
use crate::pool::PoolConfig;
use crate::proto::error::{Error, Result};

/// Cluster client.
///
/// Routes each command to the node owning its key, following `MOVED` and
/// `ASK` redirects and retrying transport failures within the configured
/// attempt and time budget. Cloning is cheap; clones share connections and
/// topology.
#[derive(Clone)]
pub struct ClusterClient {
    inner: Arc<ClusterInner>,
}

struct ClusterInner {
    executor: ClusterCommandExecutor,
    refresher: Option<JoinHandle<()>>,
}

impl Drop for ClusterInner {
    fn drop(&mut self) {
        if let Some(refresher) = &self.refresher {
            refresher.abort();
        }
        self.executor.provider().close();
    }
}

impl ClusterClient {
    /// Connects using comma-separated seed addresses and default settings.
    ///
    /// # Errors
    ///
    /// Fails if the addresses are invalid or no seed returns a usable slot
    /// table.
    pub async fn connect(addresses: &str) -> Result<Self> {
        Self::builder().addresses(addresses).build().await
    }

    /// Starts a [`ClusterClientBuilder`].
    #[inline]
    pub fn builder() -> ClusterClientBuilder {
        ClusterClientBuilder::new()
    }

    /// The executor driving every command.
    pub fn executor(&self) -> &ClusterCommandExecutor {
        &self.inner.executor
    }

    fn provider(&self) -> &ClusterConnectionProvider {
        self.inner.executor.provider()
    }

    /// Runs `cmd` on the node chosen by `route`.
    pub async fn execute<T>(&self, route: Route, cmd: &Cmd) -> Result<T>
    where
        T: FromFrame + Send + 'static,
    {
        self.inner.executor.execute(route, cmd).await
    }

    /// Runs `op` with redirect handling and retries; see
    /// [`ClusterCommandExecutor::run`].
    pub async fn run<R, F>(&self, route: Route, op: F) -> Result<R>
    where
        R: Send,
        F: for<'c> FnMut(&'c mut Connection) -> BoxFuture<'c, Result<R>> + Send,
    {
        self.inner.executor.run(route, op).await
    }

    /// Runs `cmd` on every primary; see [`ClusterCommandExecutor::broadcast`].
    pub async fn broadcast<T>(&self, cmd: &Cmd) -> Result<T>
    where
        T: FromFrame + Send + 'static,
    {
        self.inner.executor.broadcast(cmd).await
    }

    /// Runs `cmd` on every primary, merging replies with `policy`.
    pub async fn broadcast_with<T>(&self, cmd: &Cmd, policy: ReplyPolicy) -> Result<T>
    where
        T: FromFrame + Send + 'static,
    {
        self.inner.executor.broadcast_with(cmd, policy).await
    }

    /// Number of keys across every primary.
    pub async fn dbsize(&self) -> Result<i64> {
        self.broadcast_with(&Cmd::named("DBSIZE"), ReplyPolicy::Sum).await
    }

    /// Keys matching `pattern` on every primary.
    pub async fn keys(&self, pattern: impl Into<Bytes>) -> Result<Vec<Bytes>> {
        self.broadcast_with(&Cmd::named("KEYS").arg(pattern), ReplyPolicy::Concat)
            .await
    }

    /// A pipeline routing each command to the node owning its key.
    pub fn pipeline(&self) -> ClusterPipeline<'_> {
        ClusterPipeline::new(self.inner.executor.provider())
    }

    /// GET.
    pub async fn get(&self, key: impl Into<Bytes>) -> Result<Option<Bytes>> {
        let key = key.into();
        self.execute(Route::for_key(&key), &command::get(key)).await
    }

    /// SET.
    pub async fn set(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Result<()> {
        let key = key.into();
        self.execute(Route::for_key(&key), &command::set(key, value))
            .await
    }

    /// SET with an expiry.
    pub async fn set_with_expiry(
        &self,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        expiry: Duration,
    ) -> Result<()> {
        let key = key.into();
        self.execute(
            Route::for_key(&key),
            &command::set_with_expiry(key, value, expiry),
        )
        .await
    }

    /// DEL. Returns the number of removed keys.
    pub async fn del(&self, key: impl Into<Bytes>) -> Result<i64> {
        let key = key.into();
        self.execute(Route::for_key(&key), &command::del(key)).await
    }

    /// EXISTS.
    pub async fn exists(&self, key: impl Into<Bytes>) -> Result<bool> {
        let key = key.into();
        self.execute(Route::for_key(&key), &command::exists(key))
            .await
    }

    /// INCR.
    pub async fn incr(&self, key: impl Into<Bytes>) -> Result<i64> {
        let key = key.into();
        self.execute(Route::for_key(&key), &command::incr(key)).await
    }

    /// INCRBY.
    pub async fn incr_by(&self, key: impl Into<Bytes>, amount: i64) -> Result<i64> {
        let key = key.into();
        self.execute(Route::for_key(&key), &command::incr_by(key, amount))
            .await
    }

    /// MGET over keys sharing one slot.
    ///
    /// # Errors
    ///
    /// [`Error::CrossSlot`] before anything is sent if the keys span
    /// several slots.
    pub async fn mget<K: Into<Bytes>>(
        &self,
        keys: impl IntoIterator<Item = K>,
    ) -> Result<Vec<Option<Bytes>>> {
        let keys: Vec<Bytes> = keys.into_iter().map(Into::into).collect();
        let route = Route::for_keys(&keys)?;
        self.execute(route, &command::mget(keys)).await
    }

    /// PINGs every primary.
    pub async fn ping_all(&self) -> Result<()> {
        self.broadcast::<()>(&command::ping()).await
    }

    /// A pooled connection to the node currently owning `key`.
    ///
    /// Used to run a pipeline or transaction on keys sharing one slot.
    /// Redirects are not followed on this connection.
    ///
    /// # Example
    ///
    /// ```no_run
    /// # async fn example(client: &shardis::ClusterClient) -> shardis::Result<()> {
    /// let mut conn = client.connection_for_key("{user:1}").await?;
    /// let mut pipeline = conn.pipeline();
    /// pipeline.set("{user:1}.name", "ada");
    /// let visits = pipeline.incr("{user:1}.visits");
    /// pipeline.sync().await?;
    /// println!("visits = {}", visits.get()?);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn connection_for_key(&self, key: impl AsRef<[u8]>) -> Result<NodeConnection> {
        self.provider().connection_for_slot(key_slot(key)).await
    }

    /// Number of known primaries.
    pub fn node_count(&self) -> usize {
        self.provider().topology().snapshot().nodes().len()
    }

    /// Returns true if every slot has a known owner.
    pub fn is_fully_covered(&self) -> bool {
        self.provider().topology().snapshot().is_fully_covered()
    }

    /// Address of the node owning `slot`, if known.
    pub fn node_for_slot(&self, slot: u16) -> Option<Arc<str>> {
        self.provider().topology().node_for_slot(slot)
    }

    /// Reloads the slot table now.
    ///
    /// Returns `Ok(false)` if another refresh was already running.
    pub async fn refresh_topology(&self) -> Result<bool> {
        self.provider().renew_topology(None).await
    }

    /// Stops the background refresh and closes every pooled connection.
    pub fn close(&self) {
        if let Some(refresher) = &self.inner.refresher {
            refresher.abort();
        }
        self.provider().close();
    }
}

impl fmt::Debug for ClusterClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterClient")
            .field("executor", &self.inner.executor)
            .field("provider", self.provider())
            .finish()
    }
}

fn spawn_refresher(provider: Weak<ClusterConnectionProvider>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(provider) = provider.upgrade() else {
                return;
            };
            match provider.renew_topology(None).await {
                Ok(_) => {}
                Err(e) => warn!(error = %e, "periodic topology refresh failed"),
            }
        }
    })
}

/// Builder for [`ClusterClient`].
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use shardis::cluster::ClusterClientBuilder;
///
/// # async fn example() -> shardis::Result<()> {
/// let client = ClusterClientBuilder::new()
///     .addresses("127.0.0.1:7000,127.0.0.1:7001")
///     .max_attempts(3)
///     .max_total_retry_duration(Duration::from_secs(2))
///     .topology_refresh_interval(Duration::from_secs(30))
///     .build()
///     .await?;
/// client.set("key", "value").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct ClusterClientBuilder {
    addresses: Option<String>,
    config: ClusterConfig,
}

impl ClusterClientBuilder {
    /// Creates a builder with default settings.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed addresses, comma-separated (`host:port`, `redis://` or
    /// `rediss://`).
    #[inline]
    pub fn addresses(mut self, addresses: impl Into<String>) -> Self {
        self.addresses = Some(addresses.into());
        self
    }

    /// Replaces every setting at once.
    #[inline]
    pub fn config(mut self, config: ClusterConfig) -> Self {
        self.config = config;
        self
    }

    /// Attempts per command.
    #[inline]
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    /// Deadline for one command across its retries.
    #[inline]
    pub fn max_total_retry_duration(mut self, duration: Duration) -> Self {
        self.config.max_total_retry_duration = duration;
        self
    }

    /// Reloads the slot table periodically in the background.
    #[inline]
    pub fn topology_refresh_interval(mut self, period: Duration) -> Self {
        self.config.topology_refresh_interval = Some(period);
        self
    }

    /// Delay policy after transport failures.
    #[inline]
    pub fn backoff(mut self, backoff: impl Backoff + 'static) -> Self {
        self.config.backoff = Arc::new(backoff);
        self
    }

    /// Accept slot tables with unassigned slots.
    #[inline]
    pub fn require_full_coverage(mut self, required: bool) -> Self {
        self.config.require_full_coverage = required;
        self
    }

    /// Settings of the per-node pools.
    #[inline]
    pub fn pool_config(mut self, pool: PoolConfig) -> Self {
        self.config.pool = pool;
        self
    }

    /// Password for AUTH.
    #[inline]
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.config.client.password = Some(password.into());
        self
    }

    /// Username for ACL AUTH.
    #[inline]
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.config.client.username = Some(username.into());
        self
    }

    /// Name registered with CLIENT SETNAME.
    #[inline]
    pub fn client_name(mut self, name: impl Into<String>) -> Self {
        self.config.client.client_name = Some(name.into());
        self
    }

    /// Connect timeout.
    #[inline]
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.client.connect_timeout = timeout;
        self
    }

    /// Reply timeout. `None` waits forever.
    #[inline]
    pub fn read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.client.read_timeout = timeout;
        self
    }

    /// Enables TLS on every connection.
    #[inline]
    pub fn tls(mut self, enabled: bool) -> Self {
        self.config.client.tls = enabled;
        self
    }

    /// Sends `command` under another name on every node.
    #[inline]
    pub fn rename_command(mut self, command: Command, wire_name: impl Into<Bytes>) -> Self {
        Arc::make_mut(&mut self.config.client.renames).rename(command, wire_name);
        self
    }

    /// Loads the slot table from the seeds and returns the client.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] without addresses; otherwise the error of
    /// the initial topology load.
    pub async fn build(self) -> Result<ClusterClient> {
        let addresses = self.addresses.ok_or_else(|| Error::InvalidArgument {
            message: "address is required".to_string(),
        })?;
        let seeds = parse_addresses(&addresses)?;

        let mut config = self.config;
        if addresses
            .split(',')
            .any(|address| address.trim().starts_with("rediss://"))
        {
            config.client.tls = true;
        }

        let provider = Arc::new(ClusterConnectionProvider::new(
            seeds,
            Arc::new(TcpConnectionFactory::new(config.client)),
            config.pool,
            config.require_full_coverage,
        ));
        if let Err(e) = provider.renew_topology(None).await {
            provider.close();
            return Err(e);
        }
        debug!(
            nodes = provider.topology().snapshot().nodes().len(),
            "cluster client ready"
        );

        let refresher = config
            .topology_refresh_interval
            .map(|period| spawn_refresher(Arc::downgrade(&provider), period));
        let executor = ClusterCommandExecutor::new(
            provider,
            config.max_attempts,
            config.max_total_retry_duration,
            config.backoff,
        );

        Ok(ClusterClient {
            inner: Arc::new(ClusterInner {
                executor,
                refresher,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::mock::{cluster_slots_reply, unused_address, MockNode};
    use crate::proto::frame::Frame;

    type Layout = Arc<Mutex<Vec<(u16, u16, String)>>>;

    /// A key/value node serving `CLUSTER SLOTS` from `layout`.
    async fn kv_node(layout: &Layout) -> MockNode {
        let layout = Arc::clone(layout);
        let store: Arc<Mutex<std::collections::HashMap<String, String>>> = Arc::default();
        MockNode::start(move |cmd| match cmd[0].as_str() {
            "CLUSTER" => {
                let layout = layout.lock().unwrap();
                let ranges: Vec<(u16, u16, &str)> = layout
                    .iter()
                    .map(|(start, end, address)| (*start, *end, address.as_str()))
                    .collect();
                cluster_slots_reply(&ranges)
            }
            "PING" => Frame::simple("PONG"),
            "SET" => {
                store.lock().unwrap().insert(cmd[1].clone(), cmd[2].clone());
                Frame::simple("OK")
            }
            "GET" => match store.lock().unwrap().get(&cmd[1]) {
                Some(value) => Frame::bulk(value.clone()),
                None => Frame::Null,
            },
            "MGET" => {
                let store = store.lock().unwrap();
                Frame::Array(
                    cmd[1..]
                        .iter()
                        .map(|key| store.get(key).map_or(Frame::Null, |v| Frame::bulk(v.clone())))
                        .collect(),
                )
            }
            "DBSIZE" => Frame::Integer(store.lock().unwrap().len() as i64),
            "KEYS" => Frame::Array(store.lock().unwrap().keys().map(|k| Frame::bulk(k.clone())).collect()),
            _ => Frame::error("ERR unknown command"),
        })
        .await
    }

    #[tokio::test]
    async fn test_connect_and_route_commands() {
        let layout = Layout::default();
        let a = kv_node(&layout).await;
        let b = kv_node(&layout).await;
        *layout.lock().unwrap() = vec![
            (0, 8191, a.address().to_string()),
            (8192, 16383, b.address().to_string()),
        ];

        let client = ClusterClient::connect(a.address()).await.unwrap();
        assert_eq!(client.node_count(), 2);
        assert!(client.is_fully_covered());

        // foo hashes to 12182, bar to 5061
        client.set("foo", "1").await.unwrap();
        client.set("bar", "2").await.unwrap();
        assert_eq!(client.get("foo").await.unwrap(), Some(Bytes::from("1")));
        assert_eq!(client.get("bar").await.unwrap(), Some(Bytes::from("2")));
        assert_eq!(client.get("missing").await.unwrap(), None);

        let sets_on = |node: &MockNode| {
            node.commands()
                .iter()
                .filter(|cmd| cmd[0] == "SET")
                .map(|cmd| cmd[1].clone())
                .collect::<Vec<_>>()
        };
        assert_eq!(sets_on(&a), vec!["bar"]);
        assert_eq!(sets_on(&b), vec!["foo"]);

        client.ping_all().await.unwrap();
    }

    #[tokio::test]
    async fn test_pipeline_and_merged_broadcasts_span_nodes() {
        let layout = Layout::default();
        let a = kv_node(&layout).await;
        let b = kv_node(&layout).await;
        *layout.lock().unwrap() = vec![
            (0, 8191, a.address().to_string()),
            (8192, 16383, b.address().to_string()),
        ];
        let client = ClusterClient::connect(a.address()).await.unwrap();

        let mut pipeline = client.pipeline();
        pipeline.set("foo", "1").unwrap();
        pipeline.set("bar", "2").unwrap();
        let foo = pipeline.get("foo").unwrap();
        let bar = pipeline.get("bar").unwrap();
        assert_eq!(pipeline.node_count(), 2);
        pipeline.sync().await.unwrap();

        assert_eq!(foo.get().unwrap(), Some(Bytes::from("1")));
        assert_eq!(bar.get().unwrap(), Some(Bytes::from("2")));

        assert_eq!(client.dbsize().await.unwrap(), 2);
        let mut keys = client.keys("*").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec![Bytes::from("bar"), Bytes::from("foo")]);
    }

    #[tokio::test]
    async fn test_mget_rejects_cross_slot_keys_locally() {
        let layout = Layout::default();
        let a = kv_node(&layout).await;
        *layout.lock().unwrap() = vec![(0, 16383, a.address().to_string())];
        let client = ClusterClient::connect(a.address()).await.unwrap();

        let err = client.mget(["foo", "bar"]).await.unwrap_err();
        assert!(matches!(err, Error::CrossSlot));
        assert!(a.commands().iter().all(|cmd| cmd[0] != "MGET"));

        client.set("{t}.a", "1").await.unwrap();
        let values = client.mget(["{t}.a", "{t}.b"]).await.unwrap();
        assert_eq!(values, vec![Some(Bytes::from("1")), None]);
    }

    #[tokio::test]
    async fn test_connect_fails_without_reachable_seed() {
        let address = unused_address().await;
        let err = ClusterClient::connect(&address).await.unwrap_err();
        assert!(matches!(err, Error::NoReachableNode));
    }

    #[tokio::test]
    async fn test_build_requires_address() {
        let err = ClusterClientBuilder::new().build().await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
    }

    #[tokio::test]
    async fn test_periodic_refresh_follows_resharding() {
        let layout = Layout::default();
        let a = kv_node(&layout).await;
        let b = kv_node(&layout).await;
        *layout.lock().unwrap() = vec![(0, 16383, a.address().to_string())];

        let client = ClusterClient::builder()
            .addresses(a.address())
            .topology_refresh_interval(Duration::from_millis(20))
            .build()
            .await
            .unwrap();
        assert_eq!(client.node_for_slot(100).as_deref(), Some(a.address()));

        *layout.lock().unwrap() = vec![
            (0, 8191, b.address().to_string()),
            (8192, 16383, a.address().to_string()),
        ];
        let mut moved = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if client.node_for_slot(100).as_deref() == Some(b.address()) {
                moved = true;
                break;
            }
        }
        assert!(moved);
        client.close();
    }

    #[tokio::test]
    async fn test_connection_for_key_supports_pipelines() {
        let layout = Layout::default();
        let a = kv_node(&layout).await;
        *layout.lock().unwrap() = vec![(0, 16383, a.address().to_string())];
        let client = ClusterClient::connect(a.address()).await.unwrap();

        let mut conn = client.connection_for_key("{u}").await.unwrap();
        let mut pipeline = conn.pipeline();
        pipeline.set("{u}.name", "ada");
        let name = pipeline.get("{u}.name");
        pipeline.sync().await.unwrap();
        assert_eq!(name.get().unwrap(), Some(Bytes::from("ada")));
    }

    #[test]
    fn test_builder_settings() {
        let builder = ClusterClientBuilder::new()
            .addresses("127.0.0.1:7000")
            .max_attempts(3)
            .max_total_retry_duration(Duration::from_secs(1))
            .require_full_coverage(false)
            .password("secret")
            .rename_command(Command::Get, "FETCH");

        assert_eq!(builder.addresses.as_deref(), Some("127.0.0.1:7000"));
        assert_eq!(builder.config.max_attempts, 3);
        assert_eq!(builder.config.max_total_retry_duration, Duration::from_secs(1));
        assert!(!builder.config.require_full_coverage);
        assert_eq!(builder.config.client.password.as_deref(), Some("secret"));
        assert_eq!(
            builder.config.client.renames.resolve(&Command::Get),
            Bytes::from("FETCH")
        );
    }
}
