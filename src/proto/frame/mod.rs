//! RESP frame types.
//!
//! A [`Frame`] is the raw reply the core hands to decoders. Only error
//! frames are inspected by the core itself, to detect cluster redirects.

/// Frame type definitions.
pub mod types;

pub use types::Frame;
