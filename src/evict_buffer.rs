use super::address;
use crate::message::{Message, MessageKind};
use crate::state::CoherenceState;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub addr: address,
    pub kind: MessageKind,
    pub state: CoherenceState,
    /// No protocol work remains before the eviction may be sent.
    pub evictable: bool,
    /// The eviction was sent and awaits its acknowledgement.
    pub pending: bool,
    pub snoop_required: bool,
    pub snoop_scheduled: bool,
}

impl std::fmt::Display for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({:#x}, {}", self.kind, self.addr, self.state)?;
        if self.evictable {
            write!(f, ", evictable")?;
        }
        if self.pending {
            write!(f, ", pending")?;
        }
        if self.snoop_required {
            write!(f, ", snoop required")?;
        }
        write!(f, ")")
    }
}

/// Persisted form of one evict buffer entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub addr: address,
    pub kind: MessageKind,
    pub evictable: bool,
    pub state: CoherenceState,
}

/// Blocks displaced from the array whose eviction is not yet retired.
///
/// Entries keep their allocation order, so the buffer drains oldest first.
#[derive(Debug, Clone)]
pub struct EvictBuffer {
    entries: IndexMap<address, Entry>,
    size: usize,
    reserve: usize,
}

impl std::fmt::Display for EvictBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "EvictBuffer({}/{}, reserved={})",
            self.entries.len(),
            self.size,
            self.reserve
        )?;
        for entry in self.entries.values() {
            writeln!(f, "  {entry}")?;
        }
        Ok(())
    }
}

impl EvictBuffer {
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            entries: IndexMap::with_capacity(size),
            size,
            reserve: 0,
        }
    }

    #[must_use]
    pub fn full(&self) -> bool {
        self.entries.len() + self.reserve >= self.size
    }

    /// Slots neither occupied nor reserved.
    #[must_use]
    pub fn free_entries(&self) -> usize {
        self.size
            .saturating_sub(self.entries.len())
            .saturating_sub(self.reserve)
    }

    pub fn reserve(&mut self) {
        self.reserve += 1;
        debug_assert!(
            self.entries.len() + self.reserve <= self.size,
            "evict buffer over-reserved"
        );
    }

    pub fn unreserve(&mut self) {
        assert!(self.reserve > 0, "unreserve of an evict buffer without reservations");
        self.reserve -= 1;
    }

    #[must_use]
    pub fn reserved(&self) -> usize {
        self.reserve
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether the entry `offset` places behind the head is ready to be sent.
    #[must_use]
    pub fn head_evictable(&self, offset: usize) -> bool {
        self.entries
            .get_index(offset)
            .is_some_and(|(_, e)| e.evictable && !e.pending)
    }

    /// Add a displaced block.
    ///
    /// A block that is already buffered keeps its position and only takes
    /// over the new eviction type and state. Its `evictable`, `pending` and
    /// `snoop_required` flags stay as they were.
    pub fn alloc_entry(
        &mut self,
        addr: address,
        kind: MessageKind,
        state: CoherenceState,
        evictable: bool,
    ) -> &mut Entry {
        debug_assert!(kind.is_evict(), "{kind} is not an eviction");
        if self.entries.contains_key(&addr) {
            log::trace!("evict buffer: merge {} into {:#x}", kind, addr);
        } else {
            assert!(
                self.entries.len() < self.size,
                "allocation into a full evict buffer ({})",
                self.size
            );
            log::trace!("evict buffer: alloc {} for {:#x} ({})", kind, addr, state);
        }
        let entry = self.entries.entry(addr).or_insert_with(|| Entry {
            addr,
            kind,
            state,
            evictable,
            pending: false,
            snoop_required: !evictable,
            snoop_scheduled: false,
        });
        entry.kind = kind;
        entry.state = state;
        entry
    }

    fn eviction(entry: &Entry) -> Message {
        let mut msg = Message::new(entry.kind, entry.addr);
        msg.evict_has_data = entry.kind == MessageKind::EvictDirty;
        msg
    }

    /// Remove the head entry and return its eviction.
    ///
    /// # Panics
    /// If the head is missing or not evictable.
    pub fn pop_front(&mut self) -> Message {
        let (_, entry) = self
            .entries
            .shift_remove_index(0)
            .unwrap_or_else(|| panic!("pop from an empty evict buffer"));
        assert!(entry.evictable, "pop of a non-evictable entry {entry}");
        Self::eviction(&entry)
    }

    /// Mark the `index`-th entry pending and return its eviction.
    ///
    /// # Panics
    /// If the entry is missing or not evictable.
    pub fn pop(&mut self, index: usize) -> Message {
        let (_, entry) = self
            .entries
            .get_index_mut(index)
            .unwrap_or_else(|| panic!("pop of missing evict buffer slot {index}"));
        assert!(entry.evictable, "pop of a non-evictable entry {entry}");
        entry.pending = true;
        Self::eviction(entry)
    }

    pub fn remove(&mut self, addr: address) -> Option<Entry> {
        let entry = self.entries.shift_remove(&addr);
        if let Some(ref entry) = entry {
            log::trace!("evict buffer: remove {}", entry);
        }
        entry
    }

    #[must_use]
    pub fn find(&self, addr: address) -> Option<&Entry> {
        self.entries.get(&addr)
    }

    pub fn find_mut(&mut self, addr: address) -> Option<&mut Entry> {
        self.entries.get_mut(&addr)
    }

    #[must_use]
    pub fn contains(&self, addr: address) -> bool {
        self.entries.contains_key(&addr)
    }

    pub fn set_evictable(&mut self, addr: address, evictable: bool) {
        if let Some(entry) = self.entries.get_mut(&addr) {
            entry.evictable = evictable;
        }
    }

    #[must_use]
    pub fn evict_type(&self, addr: address) -> MessageKind {
        self.entries
            .get(&addr)
            .map_or(MessageKind::EvictClean, |e| e.kind)
    }

    pub fn set_evict_type(&mut self, addr: address, kind: MessageKind) {
        if let Some(entry) = self.entries.get_mut(&addr) {
            entry.kind = kind;
        }
    }

    /// Oldest entry whose higher-level copies have not been invalidated yet.
    pub fn oldest_requiring_snoops(&mut self) -> Option<&mut Entry> {
        self.entries.values_mut().find(|e| e.snoop_required)
    }

    #[must_use]
    pub fn back(&self) -> Option<&Entry> {
        self.entries.last().map(|(_, e)| e)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.entries.values()
    }

    #[must_use]
    pub fn save_state(&self) -> Vec<CheckpointEntry> {
        self.entries
            .values()
            .map(|e| CheckpointEntry {
                addr: e.addr,
                kind: e.kind,
                evictable: e.evictable,
                state: e.state,
            })
            .collect()
    }

    pub fn load_state(&mut self, checkpoint: &[CheckpointEntry]) {
        self.entries.clear();
        for e in checkpoint {
            self.alloc_entry(e.addr, e.kind, e.state, e.evictable);
        }
    }
}
