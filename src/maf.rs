use super::address;
use crate::message::{Message, MessageKind, Transport};
use crate::process::Grant;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::BTreeMap;

/// Wait state of a miss address file entry.
///
/// `WaitResponse` is the active state: at most one entry per block is in it.
/// All other states are blocked entries that are retried later.
#[derive(
    Debug,
    strum::EnumIter,
    strum::Display,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
pub enum WaitState {
    WaitResponse,
    WaitAddress,
    Waking,
    WaitProbe,
    ProbeHit,
    ProbeMiss,
    Completed,
    WaitSnoop,
    WaitEvict,
    WaitRegion,
}

/// Request class of an entry, used for occupancy accounting.
#[derive(
    Debug, strum::EnumIter, strum::Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub enum EntryKind {
    Read,
    Write,
    Atomic,
    Fetch,
    ReadPrefetch,
    WritePrefetch,
}

impl EntryKind {
    #[must_use]
    pub fn classify(kind: MessageKind) -> Option<Self> {
        use MessageKind as K;
        match kind {
            K::AtomicPreloadReq | K::LoadReq | K::ReadReq | K::StreamFetch => Some(Self::Read),
            K::StoreReq
            | K::WriteReq
            | K::WriteAllocate
            | K::UpgradeReq
            | K::UpgradeAllocate
            | K::NonAllocatingStoreReq => Some(Self::Write),
            K::RMWReq | K::CmpxReq => Some(Self::Atomic),
            K::FetchReq => Some(Self::Fetch),
            K::PrefetchReadNoAllocReq | K::PrefetchReadAllocReq => Some(Self::ReadPrefetch),
            K::StorePrefetchReq => Some(Self::WritePrefetch),
            _ => None,
        }
    }
}

/// Handle to a MAF entry.
///
/// Stays valid while the entry is in the file, regardless of state changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId {
    pub addr: address,
    serial: u64,
}

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "maf#{}@{:#x}", self.serial, self.addr)
    }
}

#[derive(Debug)]
pub struct Entry {
    id: EntryId,
    pub state: WaitState,
    pub transport: Transport,
    pub kind: EntryKind,
    /// Acknowledgements still expected before the transaction completes.
    pub outstanding_msgs: i32,
    pub data_received: bool,
    /// Evict buffer slot the request reserved at admission, held while
    /// the entry waits for its response.
    pub(crate) evict_grant: Option<Grant>,
}

impl Entry {
    #[must_use]
    pub fn id(&self) -> EntryId {
        self.id
    }

    #[must_use]
    pub fn addr(&self) -> address {
        self.id.addr
    }

    #[must_use]
    pub fn message(&self) -> &Message {
        &self.transport.message
    }
}

impl std::fmt::Display for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}] {}", self.id, self.state, self.transport)
    }
}

/// Occupancy statistics of the miss address file.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub peak_misses: usize,
    pub peak_entries: usize,
    pub allocations: u64,
}

/// Miss address file.
///
/// Entries are grouped per block address and kept in allocation order, so a
/// search for a given state always finds the oldest matching entry first.
#[derive(Debug)]
pub struct Maf {
    entries: BTreeMap<address, SmallVec<[Entry; 2]>>,
    size: usize,
    reserve: usize,
    len: usize,
    wait_response: usize,
    next_serial: u64,
    occupancy: [usize; 6],
    pub stats: Stats,
}

impl Maf {
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            size,
            reserve: 0,
            len: 0,
            wait_response: 0,
            next_serial: 0,
            occupancy: [0; 6],
            stats: Stats::default(),
        }
    }

    #[must_use]
    pub fn full(&self) -> bool {
        self.len + self.reserve >= self.size
    }

    pub fn reserve(&mut self) {
        self.reserve += 1;
        debug_assert!(self.reserve + self.len <= self.size);
    }

    pub fn unreserve(&mut self) {
        assert!(self.reserve > 0, "unreserve of a MAF without reservations");
        self.reserve -= 1;
    }

    #[must_use]
    pub fn reserved(&self) -> usize {
        self.reserve
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of entries in the active `WaitResponse` state.
    #[must_use]
    pub fn active_entries(&self) -> usize {
        self.wait_response
    }

    /// Number of entries of the given request class.
    #[must_use]
    pub fn occupancy(&self, kind: EntryKind) -> usize {
        self.occupancy[kind as usize]
    }

    /// Allocate an entry for the request carried by `transport`.
    ///
    /// # Panics
    /// If the file has no room or the message is not a request.
    pub fn alloc(&mut self, addr: address, transport: Transport, state: WaitState) -> EntryId {
        let kind = EntryKind::classify(transport.kind()).unwrap_or_else(|| {
            panic!("cannot allocate MAF entry for non-request {}", transport)
        });
        self.insert(addr, transport, state, kind)
    }

    fn insert(
        &mut self,
        addr: address,
        transport: Transport,
        state: WaitState,
        kind: EntryKind,
    ) -> EntryId {
        assert!(
            self.len + self.reserve < self.size,
            "allocation into a full MAF ({} entries, {} reserved, size {})",
            self.len,
            self.reserve,
            self.size
        );
        if state == WaitState::WaitResponse {
            assert!(
                !self.contains_state(addr, WaitState::WaitResponse),
                "second active MAF entry for {addr:#x}"
            );
        }
        self.next_serial += 1;
        let id = EntryId {
            addr,
            serial: self.next_serial,
        };
        log::trace!("maf: alloc {} [{}] for {}", id, state, transport);
        self.entries.entry(addr).or_default().push(Entry {
            id,
            state,
            transport,
            kind,
            outstanding_msgs: 0,
            data_received: false,
            evict_grant: None,
        });
        self.len += 1;
        self.occupancy[kind as usize] += 1;
        if state == WaitState::WaitResponse {
            self.wait_response += 1;
        }
        self.stats.allocations += 1;
        self.stats.peak_misses = self.stats.peak_misses.max(self.wait_response);
        self.stats.peak_entries = self.stats.peak_entries.max(self.len);
        id
    }

    #[must_use]
    pub fn get(&self, id: EntryId) -> Option<&Entry> {
        self.entries.get(&id.addr)?.iter().find(|e| e.id == id)
    }

    pub fn get_mut(&mut self, id: EntryId) -> Option<&mut Entry> {
        self.entries.get_mut(&id.addr)?.iter_mut().find(|e| e.id == id)
    }

    fn find(&self, addr: address, state: WaitState) -> Option<&Entry> {
        self.entries.get(&addr)?.iter().find(|e| e.state == state)
    }

    fn find_mut(&mut self, addr: address, state: WaitState) -> Option<&mut Entry> {
        self.entries
            .get_mut(&addr)?
            .iter_mut()
            .find(|e| e.state == state)
    }

    /// Change the wait state of an entry.
    ///
    /// # Panics
    /// If the entry does not exist or a second active entry would result.
    pub fn set_state(&mut self, id: EntryId, state: WaitState) {
        if state == WaitState::WaitResponse {
            let other_active = self
                .find(id.addr, WaitState::WaitResponse)
                .is_some_and(|e| e.id != id);
            assert!(!other_active, "second active MAF entry for {:#x}", id.addr);
        }
        let entry = self
            .get_mut(id)
            .unwrap_or_else(|| panic!("state change of missing MAF entry {id}"));
        let previous = entry.state;
        entry.state = state;
        log::trace!("maf: {} {} -> {}", id, previous, state);
        if previous == WaitState::WaitResponse {
            self.wait_response -= 1;
        }
        if state == WaitState::WaitResponse {
            self.wait_response += 1;
            self.stats.peak_misses = self.stats.peak_misses.max(self.wait_response);
        }
    }

    /// Remove an entry, returning it.
    pub fn remove(&mut self, id: EntryId) -> Option<Entry> {
        let slot = self.entries.get_mut(&id.addr)?;
        let idx = slot.iter().position(|e| e.id == id)?;
        let entry = slot.remove(idx);
        if slot.is_empty() {
            self.entries.remove(&id.addr);
        }
        self.len -= 1;
        self.occupancy[entry.kind as usize] -= 1;
        if entry.state == WaitState::WaitResponse {
            self.wait_response -= 1;
        }
        debug_assert!(
            entry.evict_grant.is_none(),
            "MAF entry {id} removed while holding an evict buffer reservation"
        );
        log::trace!("maf: remove {}", entry);
        Some(entry)
    }

    #[must_use]
    pub fn contains(&self, addr: address) -> bool {
        self.entries.contains_key(&addr)
    }

    #[must_use]
    pub fn contains_state(&self, addr: address, state: WaitState) -> bool {
        self.find(addr, state).is_some()
    }

    /// The active entry of a block, if there is an outstanding miss.
    #[must_use]
    pub fn waiting_entry(&self, addr: address) -> Option<&Entry> {
        self.find(addr, WaitState::WaitResponse)
    }

    pub fn waiting_entry_mut(&mut self, addr: address) -> Option<&mut Entry> {
        self.find_mut(addr, WaitState::WaitResponse)
    }

    #[must_use]
    pub fn probing_entry(&self, addr: address) -> Option<EntryId> {
        self.find(addr, WaitState::WaitProbe).map(Entry::id)
    }

    /// Remove the active entry of a block.
    pub fn remove_waiting_entry(&mut self, addr: address) -> Option<Entry> {
        let id = self.waiting_entry(addr)?.id;
        self.remove(id)
    }

    /// Pick the next blocked entry of a block to retry.
    ///
    /// Region waits win over snoop waits, which win over evict waits, which
    /// win over address waits. Snoop- and evict-blocked winners move to
    /// `Waking` so that only one of them is retried at a time.
    pub fn blocked_entry(&mut self, addr: address) -> Option<EntryId> {
        if let Some(entry) = self.find(addr, WaitState::WaitRegion) {
            return Some(entry.id);
        }
        for state in [WaitState::WaitSnoop, WaitState::WaitEvict] {
            if let Some(id) = self.find(addr, state).map(Entry::id) {
                self.set_state(id, WaitState::Waking);
                return Some(id);
            }
        }
        self.find(addr, WaitState::WaitAddress).map(Entry::id)
    }

    fn sorted_entries(&self, addr: address) -> Vec<&Entry> {
        let mut entries: Vec<&Entry> = self
            .entries
            .get(&addr)
            .map(|slot| slot.iter().collect())
            .unwrap_or_default();
        entries.sort_by_key(|e| e.state);
        entries
    }

    /// Messages of all entries of a block, ordered by wait state.
    #[must_use]
    pub fn all_messages(&self, addr: address) -> Vec<&Message> {
        self.sorted_entries(addr)
            .into_iter()
            .map(Entry::message)
            .collect()
    }

    #[must_use]
    pub fn all_uncompleted_messages(&self, addr: address) -> Vec<&Message> {
        self.sorted_entries(addr)
            .into_iter()
            .filter(|e| e.state != WaitState::Completed)
            .map(Entry::message)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.entries.values().flat_map(|slot| slot.iter())
    }
}

impl std::fmt::Display for Maf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "MAF({}/{}, reserved={}, active={})",
            self.len, self.size, self.reserve, self.wait_response
        )?;
        for entry in self.iter().sorted_by_key(|entry| entry.id.serial) {
            writeln!(f, "  {entry}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{Maf, WaitState};
    use crate::message::{Message, MessageKind, Transport};
    use color_eyre::eyre;

    fn request(kind: MessageKind, addr: u64) -> Transport {
        Message::new(kind, addr).into()
    }

    #[test]
    fn test_alloc_and_fullness() -> eyre::Result<()> {
        let mut maf = Maf::new(2);
        assert!(!maf.full());
        maf.reserve();
        maf.unreserve();
        let a = maf.alloc(0x40, request(MessageKind::ReadReq, 0x40), WaitState::WaitResponse);
        assert!(maf.contains(0x40));
        assert_eq!(maf.active_entries(), 1);
        maf.reserve();
        assert!(maf.full());
        maf.unreserve();
        let b = maf.alloc(0x40, request(MessageKind::WriteReq, 0x40), WaitState::WaitAddress);
        assert!(maf.full());
        assert_eq!(maf.waiting_entry(0x40).map(|e| e.id()), Some(a));
        assert!(maf.remove(a).is_some());
        assert_eq!(maf.active_entries(), 0);
        assert_eq!(maf.blocked_entry(0x40), Some(b));
        assert_eq!(maf.stats.peak_entries, 2);
        Ok(())
    }

    #[test]
    fn test_blocked_entry_priority() {
        let mut maf = Maf::new(8);
        let addr = 0x80;
        let wait_addr = maf.alloc(addr, request(MessageKind::ReadReq, addr), WaitState::WaitAddress);
        let wait_evict = maf.alloc(addr, request(MessageKind::ReadReq, addr), WaitState::WaitEvict);
        let wait_snoop = maf.alloc(addr, request(MessageKind::ReadReq, addr), WaitState::WaitSnoop);

        assert_eq!(maf.blocked_entry(addr), Some(wait_snoop));
        assert_eq!(maf.get(wait_snoop).map(|e| e.state), Some(WaitState::Waking));

        assert_eq!(maf.blocked_entry(addr), Some(wait_evict));
        assert_eq!(maf.get(wait_evict).map(|e| e.state), Some(WaitState::Waking));

        // address waits are handed out without a state change
        assert_eq!(maf.blocked_entry(addr), Some(wait_addr));
        assert_eq!(maf.get(wait_addr).map(|e| e.state), Some(WaitState::WaitAddress));

        let region = maf.alloc(addr, request(MessageKind::ReadReq, addr), WaitState::WaitRegion);
        assert_eq!(maf.blocked_entry(addr), Some(region));
        assert_eq!(maf.get(region).map(|e| e.state), Some(WaitState::WaitRegion));
    }

    #[test]
    #[should_panic(expected = "second active MAF entry")]
    fn test_single_active_entry_per_block() {
        let mut maf = Maf::new(4);
        maf.alloc(0x40, request(MessageKind::ReadReq, 0x40), WaitState::WaitResponse);
        let other = maf.alloc(0x40, request(MessageKind::ReadReq, 0x40), WaitState::WaitAddress);
        maf.set_state(other, WaitState::WaitResponse);
    }

    #[test]
    #[should_panic(expected = "non-request")]
    fn test_alloc_rejects_non_requests() {
        let mut maf = Maf::new(4);
        maf.alloc(0x40, request(MessageKind::MissReply, 0x40), WaitState::WaitAddress);
    }

    #[test]
    fn test_uncompleted_messages() {
        let mut maf = Maf::new(4);
        let done = maf.alloc(0x40, request(MessageKind::ReadReq, 0x40), WaitState::WaitAddress);
        maf.set_state(done, WaitState::Completed);
        maf.alloc(0x40, request(MessageKind::WriteReq, 0x40), WaitState::WaitSnoop);
        assert_eq!(maf.all_messages(0x40).len(), 2);
        let open: Vec<_> = maf
            .all_uncompleted_messages(0x40)
            .into_iter()
            .map(|m| m.kind)
            .collect();
        assert_eq!(open, vec![MessageKind::WriteReq]);
    }
}
