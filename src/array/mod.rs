pub mod std_array;

pub use std_array::StdArray;

use super::address;
use crate::config;
use crate::state::{BlockState, CoherenceState};

/// Result of an array lookup.
///
/// A lookup stays valid until the next allocation into the same set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Lookup {
    /// Block address that was looked up.
    pub addr: address,
    pub set: usize,
    /// Way holding the block's tag, valid or not.
    pub way: Option<usize>,
}

impl Lookup {
    /// Whether the array holds a way for the block.
    #[must_use]
    pub fn found(&self) -> bool {
        self.way.is_some()
    }
}

/// A block displaced by an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Victim {
    pub addr: address,
    pub state: BlockState,
}

#[derive(thiserror::Error, Debug)]
pub enum CheckpointError {
    #[error("checkpoint associativity {found} does not match the configured {expected}")]
    Associativity { expected: usize, found: usize },
    #[error("checkpoint has {found} sets, the array has {expected}")]
    Sets { expected: usize, found: usize },
    #[error("set {set} of the checkpoint has {found} blocks, more than the associativity {assoc}")]
    SetOverflow {
        set: usize,
        found: usize,
        assoc: usize,
    },
    #[error("malformed checkpoint")]
    Json(#[from] serde_json::Error),
}

/// Tag and state array of a cache.
///
/// Coherence protocols see the array only through this interface. Setting
/// a state replaces the whole block state, including its `prefetched` and
/// `protected` bits.
pub trait Array: std::fmt::Debug + Send {
    #[must_use]
    fn lookup(&self, addr: address) -> Lookup;

    /// State of a looked up block, `Invalid` on a miss.
    #[must_use]
    fn state(&self, lookup: &Lookup) -> BlockState;

    fn set_state(&mut self, lookup: &Lookup, state: CoherenceState);

    fn set_protected(&mut self, lookup: &Lookup, protected: bool);

    fn set_prefetched(&mut self, lookup: &Lookup, prefetched: bool);

    #[must_use]
    fn can_allocate(&self, lookup: &Lookup) -> bool;

    /// Make room for the looked up block.
    ///
    /// Afterwards the lookup refers to the block's way, whose state is
    /// `Invalid` if the block was not present before. Returns the displaced
    /// block if it was valid.
    fn allocate(&mut self, lookup: &mut Lookup) -> Option<Victim>;

    /// Move the block to the most recently used position.
    fn record_access(&mut self, lookup: &Lookup);

    /// Move the block to the least recently used position.
    ///
    /// Only the replacement order changes, the state is left alone.
    fn invalidate_block(&mut self, lookup: &Lookup);

    #[must_use]
    fn block_size(&self) -> u64;

    #[must_use]
    fn block_address(&self, addr: address) -> address {
        addr & !(self.block_size() - 1)
    }

    #[must_use]
    fn block_offset(&self, addr: address) -> u64 {
        addr & (self.block_size() - 1)
    }

    #[must_use]
    fn set_index(&self, addr: address) -> usize;

    #[must_use]
    fn same_set(&self, a: address, b: address) -> bool {
        self.set_index(a) == self.set_index(b)
    }

    /// Addresses of the valid blocks in the set of `addr`.
    #[must_use]
    fn set_tags(&self, addr: address) -> Vec<address>;

    #[must_use]
    fn requests_per_set(&self) -> usize;

    #[must_use]
    fn free_eviction_resources(&self) -> usize {
        usize::MAX
    }

    #[must_use]
    fn eviction_resource_pressure(&self) -> bool {
        false
    }

    #[must_use]
    fn eviction_resources_available(&self) -> bool {
        true
    }

    fn reserve_eviction_resource(&mut self) {}

    fn unreserve_eviction_resource(&mut self) {}

    /// A block the array wants to give up ahead of demand.
    fn preemptive_eviction(&mut self) -> Option<Victim> {
        None
    }

    fn save_state(&self) -> Result<String, CheckpointError>;

    fn load_state(&mut self, checkpoint: &str) -> Result<(), CheckpointError>;
}

/// Build the array described by `config`.
pub fn build(config: &str, block_size: u64) -> Result<Box<dyn Array>, config::Error> {
    let parsed: config::Spec = config.parse().map_err(|_| config::Error::Array {
        config: config.to_string(),
        reason: "missing array type".to_string(),
    })?;
    match parsed.name.to_ascii_lowercase().as_str() {
        "std" => Ok(Box::new(StdArray::new(block_size, &parsed.params)?)),
        other => Err(config::Error::Array {
            config: config.to_string(),
            reason: format!("unsupported array type {other:?}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_build_from_config() {
        assert!(super::build("RT:size=1024:assoc=2", 64).is_err());
        assert!(super::build("std:size=4096:assoc=2:bogus=1", 64).is_err());
        assert!(super::build("STD:size=4096:associativity=2:replacement=LRU", 64)
            .is_ok_and(|array| array.requests_per_set() == 2));
        assert!(super::build("STD:size=0x1000:assoc=2:repl=lru", 64)
            .is_ok_and(|array| array.set_index(0x40) == 1));
    }
}
