use super::{Array, CheckpointError, Lookup, Victim};
use crate::address;
use crate::config::{self, parse_int};
use crate::state::{BlockState, CoherenceState};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default)]
struct Block {
    tag: Option<address>,
    state: BlockState,
}

/// One set with true LRU replacement.
#[derive(Debug, Clone)]
struct Set {
    blocks: Vec<Block>,
    /// Ways ordered from most to least recently used.
    mru: Vec<usize>,
}

impl Set {
    fn new(assoc: usize) -> Self {
        Self {
            blocks: vec![Block::default(); assoc],
            mru: (0..assoc).collect(),
        }
    }

    fn find(&self, addr: address) -> Option<usize> {
        self.blocks.iter().position(|b| b.tag == Some(addr))
    }

    /// Least recently used way that may be replaced.
    ///
    /// Protected blocks are skipped unless they are invalid, in which case
    /// they lose their protection.
    fn victim_way(&self) -> Option<usize> {
        self.mru.iter().rev().copied().find(|&way| {
            let state = &self.blocks[way].state;
            !state.protected || !state.is_valid()
        })
    }

    fn move_to_head(&mut self, way: usize) {
        if let Some(pos) = self.mru.iter().position(|w| *w == way) {
            self.mru.remove(pos);
            self.mru.insert(0, way);
        }
    }

    fn move_to_tail(&mut self, way: usize) {
        if let Some(pos) = self.mru.iter().position(|w| *w == way) {
            self.mru.remove(pos);
            self.mru.push(way);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct CheckpointBlock {
    tag: u64,
    dirty: bool,
    writable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Checkpoint {
    associativity: usize,
    /// Valid blocks per set, least recently used first.
    tags: Vec<Vec<CheckpointBlock>>,
}

/// Set-associative array with LRU replacement.
///
/// Address layout: `| tag | set index | block offset |`.
#[derive(Debug, Clone)]
pub struct StdArray {
    size: u64,
    assoc: usize,
    block_size: u64,
    set_shift: u32,
    set_mask: u64,
    tag_shift: u32,
    sets: Vec<Set>,
}

impl StdArray {
    /// Build an array from `key=value` parameters.
    ///
    /// Accepts `size`, `assoc` (or `associativity`) and `repl` (or
    /// `replacement`, only `lru`). Keys are case-insensitive.
    pub fn new(block_size: u64, params: &[(String, String)]) -> Result<Self, config::Error> {
        let invalid = |reason: String| config::Error::Array {
            config: params
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(":"),
            reason,
        };
        let mut size = None;
        let mut assoc = None;
        for (key, value) in params {
            match key.to_ascii_lowercase().as_str() {
                "size" => {
                    size = Some(
                        parse_int(value).ok_or_else(|| invalid(format!("bad size {value:?}")))?,
                    );
                }
                "assoc" | "associativity" => {
                    assoc = Some(
                        parse_int(value)
                            .ok_or_else(|| invalid(format!("bad associativity {value:?}")))?
                            as usize,
                    );
                }
                "repl" | "replacement" => {
                    if !value.eq_ignore_ascii_case("lru") {
                        return Err(invalid(format!("invalid replacement policy {value:?}")));
                    }
                }
                other => {
                    return Err(invalid(format!(
                        "unknown parameter {other:?}, valid are size, assoc and repl"
                    )));
                }
            }
        }
        let size = size.ok_or_else(|| invalid("missing size".to_string()))?;
        let assoc = assoc.ok_or_else(|| invalid("missing associativity".to_string()))?;
        Self::with_geometry(size, assoc, block_size).map_err(invalid)
    }

    /// Build an array of `size` bytes and `assoc` ways.
    pub fn with_geometry(size: u64, assoc: usize, block_size: u64) -> Result<Self, String> {
        if size == 0 || assoc == 0 || block_size == 0 {
            return Err(format!(
                "size ({size}), associativity ({assoc}) and block size ({block_size}) must be positive"
            ));
        }
        if !block_size.is_power_of_two() {
            return Err(format!("block size {block_size} is not a power of two"));
        }
        let set_count = size / assoc as u64 / block_size;
        if set_count == 0 || !set_count.is_power_of_two() {
            return Err(format!("set count {set_count} is not a power of two"));
        }
        let offset_bits = block_size.trailing_zeros();
        let index_bits = set_count.trailing_zeros();
        Ok(Self {
            size,
            assoc,
            block_size,
            set_shift: offset_bits,
            set_mask: set_count - 1,
            tag_shift: offset_bits + index_bits,
            sets: (0..set_count).map(|_| Set::new(assoc)).collect(),
        })
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub fn associativity(&self) -> usize {
        self.assoc
    }

    #[must_use]
    pub fn num_sets(&self) -> usize {
        self.sets.len()
    }

    fn block_mut(&mut self, lookup: &Lookup) -> Option<&mut Block> {
        let way = lookup.way?;
        Some(&mut self.sets[lookup.set].blocks[way])
    }

    /// Whether a victim could be found in the set of `addr`.
    #[must_use]
    pub fn victim_available(&self, addr: address) -> bool {
        self.sets[self.set_index(addr)].victim_way().is_some()
    }
}

impl Array for StdArray {
    fn lookup(&self, addr: address) -> Lookup {
        let addr = self.block_address(addr);
        let set = self.set_index(addr);
        let way = self.sets[set].find(addr);
        log::trace!("array: lookup {:#x} in set {} -> {:?}", addr, set, way);
        Lookup { addr, set, way }
    }

    fn state(&self, lookup: &Lookup) -> BlockState {
        lookup
            .way
            .map(|way| self.sets[lookup.set].blocks[way].state)
            .unwrap_or_default()
    }

    fn set_state(&mut self, lookup: &Lookup, state: CoherenceState) {
        match self.block_mut(lookup) {
            Some(block) => block.state = state.into(),
            None if state == CoherenceState::Invalid => {}
            None => panic!(
                "state {} for {:#x}, which has no way allocated",
                state, lookup.addr
            ),
        }
    }

    fn set_protected(&mut self, lookup: &Lookup, protected: bool) {
        if let Some(block) = self.block_mut(lookup) {
            block.state.protected = protected;
        }
    }

    fn set_prefetched(&mut self, lookup: &Lookup, prefetched: bool) {
        if let Some(block) = self.block_mut(lookup) {
            block.state.prefetched = prefetched;
        }
    }

    fn can_allocate(&self, lookup: &Lookup) -> bool {
        lookup.found() || self.sets[lookup.set].victim_way().is_some()
    }

    fn allocate(&mut self, lookup: &mut Lookup) -> Option<Victim> {
        if lookup.found() {
            self.record_access(lookup);
            return None;
        }
        let set = &mut self.sets[lookup.set];
        let way = set.victim_way().unwrap_or_else(|| {
            panic!(
                "all blocks in set {} are protected and valid (allocating {:#x})",
                lookup.set, lookup.addr
            )
        });
        let old = std::mem::replace(
            &mut set.blocks[way],
            Block {
                tag: Some(lookup.addr),
                state: BlockState::default(),
            },
        );
        set.move_to_head(way);
        lookup.way = Some(way);
        match old.tag {
            Some(addr) if old.state.is_valid() => Some(Victim {
                addr,
                state: old.state,
            }),
            _ => None,
        }
    }

    fn record_access(&mut self, lookup: &Lookup) {
        let way = lookup
            .way
            .unwrap_or_else(|| panic!("access to missing block {:#x}", lookup.addr));
        self.sets[lookup.set].move_to_head(way);
    }

    fn invalidate_block(&mut self, lookup: &Lookup) {
        let way = lookup
            .way
            .unwrap_or_else(|| panic!("invalidation of missing block {:#x}", lookup.addr));
        self.sets[lookup.set].move_to_tail(way);
    }

    fn block_size(&self) -> u64 {
        self.block_size
    }

    fn set_index(&self, addr: address) -> usize {
        ((addr >> self.set_shift) & self.set_mask) as usize
    }

    fn set_tags(&self, addr: address) -> Vec<address> {
        self.sets[self.set_index(addr)]
            .blocks
            .iter()
            .filter(|b| b.state.is_valid())
            .filter_map(|b| b.tag)
            .collect()
    }

    fn requests_per_set(&self) -> usize {
        self.assoc
    }

    fn save_state(&self) -> Result<String, CheckpointError> {
        let tags = self
            .sets
            .iter()
            .map(|set| {
                set.mru
                    .iter()
                    .rev()
                    .map(|&way| set.blocks[way])
                    .filter(|b| b.state.is_valid())
                    .filter_map(|b| {
                        Some(CheckpointBlock {
                            tag: b.tag? >> self.tag_shift,
                            dirty: b.state.is_dirty(),
                            writable: b.state.is_writable(),
                        })
                    })
                    .collect()
            })
            .collect();
        let checkpoint = Checkpoint {
            associativity: self.assoc,
            tags,
        };
        Ok(serde_json::to_string(&checkpoint)?)
    }

    fn load_state(&mut self, checkpoint: &str) -> Result<(), CheckpointError> {
        let checkpoint: Checkpoint = serde_json::from_str(checkpoint)?;
        if checkpoint.associativity != self.assoc {
            return Err(CheckpointError::Associativity {
                expected: self.assoc,
                found: checkpoint.associativity,
            });
        }
        if checkpoint.tags.len() != self.sets.len() {
            return Err(CheckpointError::Sets {
                expected: self.sets.len(),
                found: checkpoint.tags.len(),
            });
        }
        for (idx, (set, blocks)) in self.sets.iter_mut().zip(&checkpoint.tags).enumerate() {
            if blocks.len() > self.assoc {
                return Err(CheckpointError::SetOverflow {
                    set: idx,
                    found: blocks.len(),
                    assoc: self.assoc,
                });
            }
            *set = Set::new(self.assoc);
            for (way, block) in blocks.iter().enumerate() {
                set.blocks[way] = Block {
                    tag: Some((block.tag << self.tag_shift) | ((idx as u64) << self.set_shift)),
                    state: BlockState::from_checkpoint(block.dirty, block.writable),
                };
            }
            // the last block listed is the most recently used one
            set.mru = (0..blocks.len()).rev().chain(blocks.len()..self.assoc).collect();
        }
        Ok(())
    }
}
