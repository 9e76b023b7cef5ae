//! RESP encoder and decoder.
//!
//! - [`encoder`] - Frames to bytes, batched into one buffer
//! - [`decoder`] - Incremental bytes-to-frames decoding

pub mod decoder;
pub mod encoder;

pub use decoder::Decoder;
pub use encoder::Encoder;
