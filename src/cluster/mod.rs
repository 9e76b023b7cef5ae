//! # Cluster
//!
//! Slot-routed execution against a sharded deployment.
//!
//! - [`key_slot`] maps keys (honouring `{hash tags}`) to one of 16384 slots.
//! - [`ClusterTopology`] holds the current slot table and swaps it whole.
//! - [`ClusterConnectionProvider`] keeps a [`ResourcePool`] per node and
//!   reloads the table with `CLUSTER SLOTS`.
//! - [`ClusterCommandExecutor`] runs operations with `MOVED`/`ASK` handling,
//!   bounded retries, backoff and a deadline.
//! - [`ClusterPipeline`] batches commands for several nodes, one pipeline
//!   per node.
//! - [`ClusterClient`] is the typed surface on top.
//!
//! ## Example
//!
//! ```no_run
//! # async fn example() -> shardis::Result<()> {
//! use shardis::ClusterClient;
//!
//! let client = ClusterClient::connect("127.0.0.1:7000,127.0.0.1:7001").await?;
//! client.set("key", "value").await?;
//! let value = client.get("key").await?;
//! # Ok(())
//! # }
//! ```
//!
//! [`ResourcePool`]: crate::pool::ResourcePool

mod aggregate;
mod client;
mod config;
mod executor;
mod pipeline;
mod provider;
mod slot;
mod topology;

pub use aggregate::ReplyPolicy;
pub use client::{ClusterClient, ClusterClientBuilder};
pub use config::{ClusterConfig, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_TOTAL_RETRY_DURATION};
pub use executor::{Backoff, ClusterCommandExecutor, JitteredBackoff, Route};
pub use pipeline::ClusterPipeline;
pub use provider::{ClusterConnectionProvider, NodeConnection};
pub use slot::{common_slot, key_slot, SLOT_COUNT};
pub use topology::{ClusterTopology, SlotTable};
