//! RESP wire format.
//!
//! The byte-level reply grammar is treated as an already-solved
//! serialization: the core only needs frames in and frames out.
//!
//! - [`codec`] - Streaming encoder and decoder
//! - [`error`] - Crate-wide error type
//! - [`frame`] - Raw reply representation

pub mod codec;
/// Error types.
pub mod error;
pub mod frame;
