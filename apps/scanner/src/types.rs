use alloy::primitives::{Address, B256};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Closed interval of block numbers. Both ends are inclusive everywhere in
/// the engine; an empty range cannot be constructed through `new`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct BlockRange {
    pub from: u64,
    pub to: u64,
}

impl BlockRange {
    pub fn new(from: u64, to: u64) -> Self {
        debug_assert!(from <= to, "inverted block range {from}-{to}");
        Self { from, to }
    }

    pub fn len(&self) -> u64 {
        self.to - self.from + 1
    }

    pub fn contains(&self, block: u64) -> bool {
        self.from <= block && block <= self.to
    }

    /// Splits into `parts` disjoint ranges covering exactly `self`. Each part
    /// is `ceil(len/parts)` long except the last, which is truncated at `to`.
    pub fn split(&self, parts: u64) -> Vec<BlockRange> {
        let parts = parts.max(1);
        let part_len = self.len().div_ceil(parts).max(1);
        let mut out = Vec::new();
        let mut from = self.from;
        while from <= self.to {
            let to = self.to.min(from.saturating_add(part_len - 1));
            out.push(BlockRange::new(from, to));
            if to == u64::MAX {
                break;
            }
            from = to + 1;
        }
        out
    }
}

impl fmt::Display for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.from, self.to)
    }
}

/// Decoded argument values of one log, keyed by argument name.
pub type EventArgs = serde_json::Map<String, Value>;

/// tx hash → contract address → "<event name> <log index>" → args.
pub type BlockEvents = BTreeMap<String, BTreeMap<String, BTreeMap<String, Value>>>;

/// Block number → events emitted in that block, in the nested shape the
/// store persists.
pub type EventMap = BTreeMap<u64, BlockEvents>;

/// One log decoded against its matched event schema.
#[derive(Debug, Clone)]
pub struct DecodedEvent {
    pub block_number: u64,
    pub tx_hash: B256,
    pub address: Address,
    pub log_index: u64,
    pub name: String,
    pub args: EventArgs,
}

/// The unit an endpoint hands back to the controller: decoded events plus a
/// coverage claim for the whole closed range, not just the blocks that
/// yielded events.
#[derive(Debug, Clone)]
pub struct ChunkResult {
    pub range: BlockRange,
    pub blocks: EventMap,
}

impl ChunkResult {
    pub fn empty(range: BlockRange) -> Self {
        Self {
            range,
            blocks: EventMap::new(),
        }
    }

    pub fn event_count(&self) -> usize {
        self.blocks
            .values()
            .flat_map(|txs| txs.values())
            .flat_map(|addrs| addrs.values())
            .map(|events| events.len())
            .sum()
    }
}

/// Shared phase variable driven by the controller and re-read by every
/// endpoint between jobs. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Fixed,
    Live { start: u64 },
    Stopped,
}
