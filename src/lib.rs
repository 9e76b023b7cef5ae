//! # Shardis
//!
//! Redis client with pooled connections, slot-routed cluster execution and
//! pipelined batches.
//!
//! - [`pool`] - Generic resource pool with an idle sweeper
//! - [`cluster`] - Slot table, redirect handling, retries and backoff
//! - [`batch`] - Pipelines and transactions with deferred responses
//! - [`core`] - Connections, commands and the standalone client
//! - [`proto`] - RESP frames and codec
//!
//! ## Features
//!
//! - `cluster` (default) - Cluster support
//! - `tls` - TLS via rustls
//!
//! ## Example
//!
//! ```no_run
//! use shardis::Client;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::connect("redis://localhost:6379").await?;
//!     client.ping().await?;
//!
//!     let mut conn = client.get_connection().await?;
//!     let mut pipeline = conn.pipeline();
//!     pipeline.set("a", "1");
//!     let a = pipeline.get("a");
//!     pipeline.sync().await?;
//!     assert_eq!(a.get()?.as_deref(), Some(&b"1"[..]));
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]

pub mod batch;
pub mod core;
pub mod pool;
pub mod proto;

#[cfg(feature = "cluster")]
pub mod cluster;

#[cfg(test)]
mod mock;

pub use crate::batch::{Pipeline, Response, Transaction};
pub use crate::core::builder::ClientBuilder;
pub use crate::core::{Client, Error, Result};

#[cfg(feature = "cluster")]
pub use crate::cluster::key_slot;
#[cfg(feature = "cluster")]
pub use crate::cluster::{ClusterClient, ClusterClientBuilder};
