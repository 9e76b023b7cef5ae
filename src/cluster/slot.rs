//! Cluster slot calculation.
//!
//! Keys map to one of 16384 slots by CRC16 (XMODEM) modulo 16384.

use bytes::Bytes;
use crc::{Crc, CRC_16_XMODEM};

use crate::proto::error::{Error, Result};

/// Number of hash slots in a cluster.
pub const SLOT_COUNT: u16 = 16384;

/// CRC-16/XMODEM, the checksum the server uses for slots.
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Calculates the cluster slot for a key.
///
/// If the key contains a non-empty `{...}` section, only its content is
/// hashed (hash tags), so related keys can be forced onto one slot.
///
/// # Examples
///
/// ```
/// use shardis::cluster::key_slot;
///
/// assert_eq!(key_slot("foo"), 12182);
/// assert_eq!(key_slot("{user1000}.following"), key_slot("{user1000}.followers"));
/// assert_ne!(key_slot("user1000"), key_slot("user2000"));
/// ```
pub fn key_slot(key: impl AsRef<[u8]>) -> u16 {
    let hash_key = extract_hash_tag(key.as_ref());
    CRC16.checksum(hash_key) % SLOT_COUNT
}

/// Returns the common slot of `keys`.
///
/// # Errors
///
/// [`Error::CrossSlot`] if two keys hash to different slots and
/// [`Error::InvalidArgument`] if `keys` is empty.
pub fn common_slot<'a>(keys: impl IntoIterator<Item = &'a Bytes>) -> Result<u16> {
    let mut keys = keys.into_iter();
    let first = keys.next().ok_or_else(|| Error::InvalidArgument {
        message: "at least one key is required".to_string(),
    })?;
    let slot = key_slot(first);
    if keys.all(|key| key_slot(key) == slot) {
        Ok(slot)
    } else {
        Err(Error::CrossSlot)
    }
}

/// Extracts the hash tag from a key.
///
/// - `{user1000}.following` hashes `user1000`
/// - `foo{bar}baz` hashes `bar`
/// - `foo{}{bar}` hashes the whole key (the first tag is empty)
/// - `foo` hashes the whole key
fn extract_hash_tag(key: &[u8]) -> &[u8] {
    if let Some(start) = key.iter().position(|&b| b == b'{') {
        if let Some(len) = key[start + 1..].iter().position(|&b| b == b'}') {
            if len > 0 {
                return &key[start + 1..start + 1 + len];
            }
        }
    }
    key
}
