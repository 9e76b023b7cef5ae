//! Command execution with redirects and retries.
//!
//! Each call runs an attempt loop:
//!
//! - success returns at once;
//! - `MOVED` refreshes the topology, records the new owner of the slot and
//!   retries on that node (one attempt);
//! - `ASK` is served within the same attempt: `ASKING` then the operation
//!   on a connection to the importing node, released right after;
//! - a transport failure refreshes the topology, sleeps a backoff interval
//!   and retries (one attempt);
//! - anything else is returned unchanged.
//!
//! The loop stops when attempts run out ([`Error::MaxAttemptsExceeded`]) or
//! when the deadline has passed before the next attempt
//! ([`Error::DeadlineExceeded`]); both carry the last error.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::aggregate::ReplyPolicy;
use super::provider::{ClusterConnectionProvider, NodeConnection};
use super::slot::{common_slot, key_slot};
use crate::core::command::{Cmd, FromFrame};
use crate::core::connection::Connection;
use crate::proto::error::{Error, Result};
use crate::proto::frame::Frame;

/// Where a command should run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// The node owning this slot.
    Slot(u16),
    /// A specific node, by address.
    Node(String),
    /// Any node.
    Any,
}

impl Route {
    /// Routes to the owner of `key`.
    pub fn for_key(key: impl AsRef<[u8]>) -> Self {
        Route::Slot(key_slot(key))
    }

    /// Routes to the owner of every key in `keys`.
    ///
    /// # Errors
    ///
    /// [`Error::CrossSlot`] if the keys span several slots.
    pub fn for_keys<'a>(keys: impl IntoIterator<Item = &'a Bytes>) -> Result<Self> {
        common_slot(keys).map(Route::Slot)
    }
}

/// Delay policy between retries after a transport failure.
pub trait Backoff: Send + Sync + fmt::Debug {
    /// Delay before the next attempt, given the attempts left after it and
    /// the time remaining before the deadline.
    fn delay(&self, attempts_left: u32, remaining: Duration) -> Duration;
}

/// Random delay in `[0, remaining / attempts_left²]`.
///
/// Early retries wait little; as attempts run out the share of the
/// remaining time grows.
#[derive(Debug, Clone, Copy, Default)]
pub struct JitteredBackoff;

impl Backoff for JitteredBackoff {
    fn delay(&self, attempts_left: u32, remaining: Duration) -> Duration {
        if attempts_left == 0 {
            return Duration::ZERO;
        }
        let ceiling = remaining / attempts_left.saturating_mul(attempts_left);
        rand::thread_rng().gen_range(Duration::ZERO..=ceiling)
    }
}

enum Target {
    Slot(u16),
    Node(String),
    Any,
    Ask(String),
}

impl From<&Route> for Target {
    fn from(route: &Route) -> Self {
        match route {
            Route::Slot(slot) => Target::Slot(*slot),
            Route::Node(address) => Target::Node(address.clone()),
            Route::Any => Target::Any,
        }
    }
}

struct RetryBudget {
    attempts: u32,
    max_attempts: u32,
    deadline: Instant,
}

impl RetryBudget {
    fn new(max_attempts: u32, max_duration: Duration) -> Self {
        Self {
            attempts: 0,
            max_attempts: max_attempts.max(1),
            deadline: Instant::now() + max_duration,
        }
    }

    fn exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    fn attempts_left(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts)
    }

    fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// Runs operations against the cluster, following redirects and retrying
/// transport failures.
#[derive(Clone)]
pub struct ClusterCommandExecutor {
    provider: Arc<ClusterConnectionProvider>,
    max_attempts: u32,
    max_total_retry_duration: Duration,
    backoff: Arc<dyn Backoff>,
}

impl ClusterCommandExecutor {
    /// Creates an executor over `provider`.
    pub fn new(
        provider: Arc<ClusterConnectionProvider>,
        max_attempts: u32,
        max_total_retry_duration: Duration,
        backoff: Arc<dyn Backoff>,
    ) -> Self {
        Self {
            provider,
            max_attempts,
            max_total_retry_duration,
            backoff,
        }
    }

    /// The connection provider.
    pub fn provider(&self) -> &Arc<ClusterConnectionProvider> {
        &self.provider
    }

    /// Runs `op` on a connection chosen by `route`.
    ///
    /// `op` may run several times, on different nodes.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use shardis::cluster::{ClusterCommandExecutor, Route};
    /// use shardis::core::command;
    ///
    /// # async fn example(executor: &ClusterCommandExecutor) -> shardis::Result<()> {
    /// let value: Option<String> = executor
    ///     .run(Route::for_key("user:1"), |conn| {
    ///         Box::pin(async move { conn.query(&command::get("user:1")).await })
    ///     })
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn run<R, F>(&self, route: Route, mut op: F) -> Result<R>
    where
        R: Send,
        F: for<'c> FnMut(&'c mut Connection) -> BoxFuture<'c, Result<R>> + Send,
    {
        let mut budget = RetryBudget::new(self.max_attempts, self.max_total_retry_duration);
        let mut target = Target::from(&route);
        let mut last_error: Option<Error> = None;

        loop {
            if let Some(error) = last_error.take() {
                if budget.remaining().is_zero() {
                    warn!(attempts = budget.attempts, error = %error, "cluster retry deadline exceeded");
                    return Err(Error::DeadlineExceeded {
                        source: Box::new(error),
                    });
                }
            }

            budget.attempts += 1;
            let error = match self.attempt(&target, &mut op).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_redirect() || e.is_connection_error() => e,
                Err(e) => return Err(e),
            };

            if budget.exhausted() {
                warn!(attempts = budget.attempts, error = %error, "no cluster attempts left");
                return Err(Error::MaxAttemptsExceeded {
                    attempts: budget.attempts,
                    source: Box::new(error),
                });
            }

            target = match &error {
                Error::Moved { slot, address } => {
                    debug!(slot, address = %address, "MOVED redirect");
                    self.renew_quietly(Some(address.as_str())).await;
                    self.provider.topology().assign_slot(*slot, address);
                    Target::Node(address.clone())
                }
                Error::Ask { slot, address } => {
                    debug!(slot, address = %address, "nested ASK redirect");
                    Target::Ask(address.clone())
                }
                _ => {
                    let renewed = self.renew_quietly(None).await;
                    let remaining = budget.remaining();
                    if remaining.is_zero() {
                        return Err(Error::DeadlineExceeded {
                            source: Box::new(error),
                        });
                    }
                    let delay = self
                        .backoff
                        .delay(budget.attempts_left(), remaining)
                        .min(remaining);
                    info!(
                        attempt = budget.attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "connection failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    match &route {
                        Route::Node(address) => Target::Node(address.clone()),
                        Route::Slot(slot) if renewed => Target::Slot(*slot),
                        _ => Target::Any,
                    }
                }
            };
            last_error = Some(error);
        }
    }

    /// Runs `cmd` on the node chosen by `route`, decoding the reply as `T`.
    pub async fn execute<T>(&self, route: Route, cmd: &Cmd) -> Result<T>
    where
        T: FromFrame + Send + 'static,
    {
        self.run(route, |conn| {
            let cmd = cmd.clone();
            Box::pin(async move { conn.query::<T>(&cmd).await })
        })
        .await
    }

    /// Runs `cmd` on every primary and returns their common reply.
    ///
    /// # Errors
    ///
    /// The first node error is returned as is; nodes answering differently
    /// yield [`Error::BroadcastMismatch`].
    pub async fn broadcast<T>(&self, cmd: &Cmd) -> Result<T>
    where
        T: FromFrame + Send + 'static,
    {
        self.broadcast_with(cmd, ReplyPolicy::AllSucceeded).await
    }

    /// Runs `cmd` on every primary, one after the other, and merges the
    /// replies with `policy`.
    ///
    /// # Errors
    ///
    /// The first node error is returned as is, as are merge failures
    /// (see [`ReplyPolicy::merge`]). [`Error::NoReachableNode`] when the
    /// slot table lists no node.
    pub async fn broadcast_with<T>(&self, cmd: &Cmd, policy: ReplyPolicy) -> Result<T>
    where
        T: FromFrame + Send + 'static,
    {
        let nodes = self.provider.topology().snapshot().nodes().to_vec();
        let mut merged: Option<Frame> = None;

        for node in nodes {
            let reply = self.execute::<Frame>(Route::Node(node.to_string()), cmd).await?;
            merged = Some(match merged {
                Some(merged) => policy.merge(merged, reply, &node)?,
                None => reply,
            });
        }
        T::from_frame(merged.ok_or(Error::NoReachableNode)?)
    }

    async fn attempt<R, F>(&self, target: &Target, op: &mut F) -> Result<R>
    where
        F: for<'c> FnMut(&'c mut Connection) -> BoxFuture<'c, Result<R>> + Send,
    {
        let mut conn = match target {
            Target::Slot(slot) => self.provider.connection_for_slot(*slot).await?,
            Target::Node(address) => self.provider.connection_for_node(address).await?,
            Target::Any => self.provider.random_connection().await?,
            Target::Ask(address) => return self.ask(address, op).await,
        };

        let result = op(&mut *conn).await;
        settle(conn, &result);

        match result {
            Err(Error::Ask { slot, address }) => {
                debug!(slot, address = %address, "ASK redirect");
                self.ask(&address, op).await
            }
            other => other,
        }
    }

    async fn ask<R, F>(&self, address: &str, op: &mut F) -> Result<R>
    where
        F: for<'c> FnMut(&'c mut Connection) -> BoxFuture<'c, Result<R>> + Send,
    {
        let mut conn = self.provider.connection_for_node(address).await?;
        let result = match conn.asking().await {
            Ok(()) => op(&mut *conn).await,
            Err(e) => Err(e),
        };
        settle(conn, &result);
        result
    }

    async fn renew_quietly(&self, hint: Option<&str>) -> bool {
        match self.provider.renew_topology(hint).await {
            Ok(renewed) => renewed,
            Err(e) => {
                warn!(error = %e, "topology refresh after failure did not succeed");
                false
            }
        }
    }
}

/// Returns the connection to its pool, or discards it after a transport
/// failure.
fn settle<R>(conn: NodeConnection, result: &Result<R>) {
    match result {
        Err(e) if e.is_connection_error() => conn.release_broken(),
        _ => {
            if let Err(e) = conn.release() {
                debug!(error = %e, "connection not returned to its pool");
            }
        }
    }
}

impl fmt::Debug for ClusterCommandExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterCommandExecutor")
            .field("max_attempts", &self.max_attempts)
            .field("max_total_retry_duration", &self.max_total_retry_duration)
            .field("backoff", &self.backoff)
            .finish()
    }
}
