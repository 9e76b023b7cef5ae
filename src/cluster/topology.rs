//! Slot ownership.
//!
//! A [`SlotTable`] maps every one of the 16384 slots to the address of its
//! primary. [`ClusterTopology`] holds the current table behind an `Arc` and
//! swaps it whole on refresh, so a lookup never sees a half-updated table.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use crate::proto::error::{Error, Result};
use crate::proto::frame::Frame;

use super::slot::SLOT_COUNT;

/// Immutable slot-to-node mapping.
#[derive(Clone)]
pub struct SlotTable {
    slots: Box<[Option<Arc<str>>]>,
    nodes: Vec<Arc<str>>,
}

impl SlotTable {
    /// A table with no slot assigned.
    pub fn empty() -> Self {
        Self {
            slots: vec![None; SLOT_COUNT as usize].into_boxed_slice(),
            nodes: Vec::new(),
        }
    }

    /// Builds a table from `(start, end, address)` ranges (inclusive).
    pub fn from_ranges<'a>(ranges: impl IntoIterator<Item = (u16, u16, &'a str)>) -> Result<Self> {
        let mut table = Self::empty();
        let mut nodes = BTreeSet::new();
        for (start, end, address) in ranges {
            if start > end || end >= SLOT_COUNT {
                return Err(Error::Protocol {
                    message: format!("invalid slot range {}-{}", start, end),
                });
            }
            let address: Arc<str> = Arc::from(address);
            for slot in &mut table.slots[start as usize..=end as usize] {
                *slot = Some(Arc::clone(&address));
            }
            nodes.insert(address);
        }
        table.nodes = nodes.into_iter().collect();
        Ok(table)
    }

    /// Parses a `CLUSTER SLOTS` reply.
    ///
    /// Each entry is `[start, end, [host, port, id?], replicas...]`; only
    /// the primary is kept. An empty reply is always rejected, and so is a
    /// reply leaving slots unassigned when `require_full_coverage` is set.
    pub fn from_cluster_slots(frame: Frame, require_full_coverage: bool) -> Result<Self> {
        let entries = match frame {
            Frame::Array(entries) => entries,
            other => return Err(Error::unexpected("CLUSTER SLOTS array", other.kind())),
        };

        let mut ranges = Vec::with_capacity(entries.len());
        for entry in entries {
            let Frame::Array(fields) = entry else {
                return Err(Error::unexpected("slot range array", "other frame"));
            };
            if fields.len() < 3 {
                return Err(Error::Protocol {
                    message: "slot range must have at least 3 elements".to_string(),
                });
            }
            let start = slot_number(&fields[0])?;
            let end = slot_number(&fields[1])?;
            let address = parse_node_address(&fields[2])?;
            ranges.push((start, end, address));
        }

        let table = Self::from_ranges(ranges.iter().map(|(s, e, a)| (*s, *e, a.as_str())))?;
        let covered = table.covered();
        if covered == 0 || (require_full_coverage && covered < SLOT_COUNT as usize) {
            return Err(Error::Protocol {
                message: format!("CLUSTER SLOTS covers {} of {} slots", covered, SLOT_COUNT),
            });
        }
        Ok(table)
    }

    /// Address of the primary owning `slot`.
    pub fn node_for_slot(&self, slot: u16) -> Option<&Arc<str>> {
        self.slots.get(slot as usize)?.as_ref()
    }

    /// Distinct primary addresses, sorted.
    pub fn nodes(&self) -> &[Arc<str>] {
        &self.nodes
    }

    /// Number of assigned slots.
    pub fn covered(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Returns true if every slot has an owner.
    pub fn is_fully_covered(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }

    /// Returns true if no slot is assigned.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn with_slot(&self, slot: u16, address: &str) -> Self {
        let mut table = self.clone();
        let address = match table.nodes.iter().find(|node| &***node == address) {
            Some(node) => Arc::clone(node),
            None => {
                let node: Arc<str> = Arc::from(address);
                table.nodes.push(Arc::clone(&node));
                table.nodes.sort();
                node
            }
        };
        table.slots[slot as usize] = Some(address);
        table
    }
}

impl fmt::Debug for SlotTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotTable")
            .field("nodes", &self.nodes)
            .field("covered", &self.covered())
            .finish()
    }
}

fn slot_number(frame: &Frame) -> Result<u16> {
    match frame {
        Frame::Integer(n) => u16::try_from(*n)
            .ok()
            .filter(|slot| *slot < SLOT_COUNT)
            .ok_or_else(|| Error::Protocol {
                message: format!("slot {} out of range", n),
            }),
        other => Err(Error::unexpected("slot number", other.kind())),
    }
}

fn parse_node_address(frame: &Frame) -> Result<String> {
    let Frame::Array(fields) = frame else {
        return Err(Error::unexpected("node array", frame.kind()));
    };
    let host = match fields.first() {
        Some(Frame::BulkString(Some(data))) => String::from_utf8_lossy(data).into_owned(),
        _ => {
            return Err(Error::Protocol {
                message: "node host must be a bulk string".to_string(),
            })
        }
    };
    let port = match fields.get(1) {
        Some(Frame::Integer(port)) => *port,
        _ => {
            return Err(Error::Protocol {
                message: "node port must be an integer".to_string(),
            })
        }
    };
    if host.contains(':') {
        Ok(format!("[{}]:{}", host, port))
    } else {
        Ok(format!("{}:{}", host, port))
    }
}

/// The current slot table, shared by every caller.
///
/// Lookups clone an `Arc` under a read lock and never wait on the network.
#[derive(Debug)]
pub struct ClusterTopology {
    current: RwLock<Arc<SlotTable>>,
}

impl ClusterTopology {
    /// Creates a topology with no slot known.
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(SlotTable::empty())),
        }
    }

    /// The current table.
    pub fn snapshot(&self) -> Arc<SlotTable> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Owner of `slot`, or `None` while it is unknown.
    pub fn node_for_slot(&self, slot: u16) -> Option<Arc<str>> {
        self.snapshot().node_for_slot(slot).cloned()
    }

    /// Replaces the whole table.
    pub fn replace(&self, table: SlotTable) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(table);
    }

    /// Records that `slot` moved to `address`.
    ///
    /// Copies the table with one slot changed and swaps the copy in.
    pub fn assign_slot(&self, slot: u16, address: &str) {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        if current.node_for_slot(slot).map(|node| &**node) == Some(address) {
            return;
        }
        *current = Arc::new(current.with_slot(slot, address));
    }

    /// Returns true once at least one refresh succeeded.
    pub fn is_ready(&self) -> bool {
        !self.snapshot().is_empty()
    }
}

impl Default for ClusterTopology {
    fn default() -> Self {
        Self::new()
    }
}
