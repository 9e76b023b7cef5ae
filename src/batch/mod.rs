//! # Batches
//!
//! Pipelines and MULTI/EXEC transactions over one [`Connection`].
//!
//! Queuing a command returns a deferred [`Response`]. Nothing is sent until
//! the batch is synchronized ([`Pipeline::sync`], [`Transaction::exec`]);
//! replies are then read in queue order and each response is resolved with
//! its own reply.
//!
//! [`Connection`]: crate::core::connection::Connection

mod pipeline;
mod response;
mod transaction;

pub use pipeline::Pipeline;
pub use response::Response;
pub(crate) use response::Slot;
pub use transaction::Transaction;
