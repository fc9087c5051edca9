use super::address;
use crate::message::{MessageKind, Transport};
use std::collections::{BTreeMap, VecDeque};

/// A snoop this cache issued to the levels above and still waits on.
#[derive(Debug, Clone)]
pub struct SnoopEntry {
    pub addr: address,
    /// The message that caused the snoop.
    pub transport: Transport,
    /// Strongest reply seen so far. An update ack outranks a plain one.
    pub snoop_state: MessageKind,
    pub i_outstanding: bool,
    pub d_outstanding: bool,
}

impl SnoopEntry {
    fn new(transport: Transport) -> Self {
        Self {
            addr: transport.addr(),
            transport,
            snoop_state: MessageKind::ProbedNotPresent,
            i_outstanding: false,
            d_outstanding: true,
        }
    }

    /// Whether either side still owes a reply.
    #[must_use]
    pub fn outstanding(&self) -> bool {
        self.i_outstanding || self.d_outstanding
    }

    /// Fold the reply of one side into the snoop state.
    pub fn record_reply(&mut self, kind: MessageKind) {
        if kind.is_update_ack() || !self.snoop_state.is_update_ack() {
            self.snoop_state = kind;
        }
    }
}

impl std::fmt::Display for SnoopEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Snoop({}, d={}, i={})",
            self.transport, self.d_outstanding, self.i_outstanding
        )
    }
}

#[derive(Debug, Default, Clone)]
struct Slot {
    outstanding: Option<SnoopEntry>,
    waiting: VecDeque<Transport>,
}

impl Slot {
    fn is_empty(&self) -> bool {
        self.outstanding.is_none() && self.waiting.is_empty()
    }
}

/// Outstanding snoops per block, plus the messages queued behind them.
///
/// Occupancy counts outstanding, waiting and woken entries alike; a woken
/// entry frees its slot only when it is handed back for processing.
#[derive(Debug, Clone)]
pub struct SnoopBuffer {
    slots: BTreeMap<address, Slot>,
    wake_list: VecDeque<Transport>,
    size: usize,
    len: usize,
    reserve: usize,
}

impl SnoopBuffer {
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            slots: BTreeMap::new(),
            wake_list: VecDeque::new(),
            size,
            len: 0,
            reserve: 0,
        }
    }

    #[must_use]
    pub fn full(&self) -> bool {
        self.len + self.reserve >= self.size
    }

    pub fn reserve(&mut self) {
        self.reserve += 1;
        debug_assert!(self.len + self.reserve <= self.size, "snoop buffer over-reserved");
    }

    pub fn unreserve(&mut self) {
        assert!(self.reserve > 0, "unreserve of a snoop buffer without reservations");
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

    fn occupy(&mut self) {
        assert!(
            self.len < self.size,
            "allocation into a full snoop buffer ({})",
            self.size
        );
        self.len += 1;
    }

    /// Open the outstanding snoop of a block.
    ///
    /// # Panics
    /// If the buffer is full or the block already has an outstanding snoop.
    pub fn alloc_entry(&mut self, transport: Transport) -> &mut SnoopEntry {
        self.occupy();
        let addr = transport.addr();
        log::trace!("snoop buffer: alloc {}", transport);
        let slot = self.slots.entry(addr).or_default();
        assert!(
            slot.outstanding.is_none(),
            "second outstanding snoop for {addr:#x}"
        );
        slot.outstanding.insert(SnoopEntry::new(transport))
    }

    /// Queue a message behind the outstanding snoop of its block.
    pub fn add_waiting_entry(&mut self, transport: Transport) {
        self.occupy();
        log::trace!("snoop buffer: {} waits", transport);
        self.slots
            .entry(transport.addr())
            .or_default()
            .waiting
            .push_back(transport);
    }

    /// Move all messages waiting on `addr` to the wake list.
    pub fn wake_waiting_entries(&mut self, addr: address) -> bool {
        let Some(slot) = self.slots.get_mut(&addr) else {
            return false;
        };
        let woken = !slot.waiting.is_empty();
        self.wake_list.extend(slot.waiting.drain(..));
        if slot.is_empty() {
            self.slots.remove(&addr);
        }
        woken
    }

    #[must_use]
    pub fn has_waking_snoops(&self) -> bool {
        !self.wake_list.is_empty()
    }

    #[must_use]
    pub fn waking_snoop(&self) -> Option<&Transport> {
        self.wake_list.front()
    }

    /// Hand the oldest woken message back for processing.
    pub fn wake_snoop(&mut self) -> Option<Transport> {
        let transport = self.wake_list.pop_front()?;
        self.len -= 1;
        Some(transport)
    }

    #[must_use]
    pub fn has_entry(&self, addr: address) -> bool {
        self.slots.contains_key(&addr) || self.wake_list.iter().any(|t| t.addr() == addr)
    }

    #[must_use]
    pub fn has_snoops_outstanding(&self, addr: address) -> bool {
        self.active_entry(addr).is_some()
    }

    #[must_use]
    pub fn active_entry(&self, addr: address) -> Option<&SnoopEntry> {
        self.slots.get(&addr)?.outstanding.as_ref()
    }

    pub fn find_entry_mut(&mut self, addr: address) -> Option<&mut SnoopEntry> {
        self.slots.get_mut(&addr)?.outstanding.as_mut()
    }

    /// Close the outstanding snoop of a block.
    pub fn remove_active(&mut self, addr: address) -> Option<SnoopEntry> {
        let slot = self.slots.get_mut(&addr)?;
        let entry = slot.outstanding.take()?;
        if slot.is_empty() {
            self.slots.remove(&addr);
        }
        self.len -= 1;
        log::trace!("snoop buffer: remove {}", entry);
        Some(entry)
    }

    /// Drop one queued eviction of a block.
    pub fn remove_waiting_evict(&mut self, addr: address) -> Option<Transport> {
        let slot = self.slots.get_mut(&addr)?;
        let idx = slot.waiting.iter().position(|t| t.kind().is_evict())?;
        let transport = slot.waiting.remove(idx)?;
        if slot.is_empty() {
            self.slots.remove(&addr);
        }
        self.len -= 1;
        Some(transport)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SnoopEntry> {
        self.slots.values().filter_map(|slot| slot.outstanding.as_ref())
    }
}

impl std::fmt::Display for SnoopBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "SnoopBuffer({}/{}, reserved={}, waking={})",
            self.len,
            self.size,
            self.reserve,
            self.wake_list.len()
        )?;
        for (addr, slot) in &self.slots {
            if let Some(entry) = &slot.outstanding {
                writeln!(f, "  {entry}")?;
            }
            if !slot.waiting.is_empty() {
                writeln!(f, "  {:#x}: {} waiting", addr, slot.waiting.len())?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::SnoopBuffer;
    use crate::message::{Message, MessageKind, Transport};

    fn transport(kind: MessageKind, addr: u64) -> Transport {
        Message::new(kind, addr).into()
    }

    #[test]
    fn test_outstanding_then_wake() {
        let mut sb = SnoopBuffer::new(4);
        let entry = sb.alloc_entry(transport(MessageKind::WriteFwd, 0x40));
        assert!(entry.d_outstanding);
        assert!(!entry.i_outstanding);
        entry.i_outstanding = true;

        sb.add_waiting_entry(transport(MessageKind::ReadReq, 0x40));
        sb.add_waiting_entry(transport(MessageKind::ReadFwd, 0x40));
        assert_eq!(sb.len(), 3);
        assert!(sb.has_snoops_outstanding(0x40));

        let closed = sb.remove_active(0x40);
        assert!(closed.is_some_and(|e| e.outstanding()));
        assert!(sb.wake_waiting_entries(0x40));
        assert!(!sb.has_snoops_outstanding(0x40));
        // woken entries still count until handed back
        assert!(sb.has_entry(0x40));
        assert_eq!(sb.len(), 2);

        assert_eq!(sb.wake_snoop().map(|t| t.kind()), Some(MessageKind::ReadReq));
        assert_eq!(sb.wake_snoop().map(|t| t.kind()), Some(MessageKind::ReadFwd));
        assert!(sb.wake_snoop().is_none());
        assert!(sb.is_empty());
        assert!(!sb.has_entry(0x40));
    }

    #[test]
    fn test_update_ack_outranks_plain_ack() {
        let mut sb = SnoopBuffer::new(2);
        let entry = sb.alloc_entry(transport(MessageKind::Invalidate, 0x40));
        entry.record_reply(MessageKind::InvUpdateAck);
        entry.record_reply(MessageKind::InvalidateAck);
        assert_eq!(entry.snoop_state, MessageKind::InvUpdateAck);

        let entry = sb.alloc_entry(transport(MessageKind::Downgrade, 0x80));
        entry.record_reply(MessageKind::DowngradeAck);
        assert!(!entry.snoop_state.is_update_ack());
        entry.record_reply(MessageKind::DownUpdateAck);
        assert_eq!(entry.snoop_state, MessageKind::DownUpdateAck);
    }

    #[test]
    fn test_remove_waiting_evict() {
        let mut sb = SnoopBuffer::new(4);
        sb.alloc_entry(transport(MessageKind::Invalidate, 0x80));
        sb.add_waiting_entry(transport(MessageKind::ReadReq, 0x80));
        sb.add_waiting_entry(transport(MessageKind::EvictDirty, 0x80));
        let evict = sb.remove_waiting_evict(0x80);
        assert_eq!(evict.map(|t| t.kind()), Some(MessageKind::EvictDirty));
        assert!(sb.remove_waiting_evict(0x80).is_none());
        assert_eq!(sb.len(), 2);
    }

    #[test]
    fn test_full_counts_reservations() {
        let mut sb = SnoopBuffer::new(2);
        sb.reserve();
        sb.alloc_entry(transport(MessageKind::Invalidate, 0x40));
        assert!(sb.full());
        sb.unreserve();
        assert!(!sb.full());
        assert!(!sb.wake_waiting_entries(0x1000));
    }

    #[test]
    #[should_panic(expected = "second outstanding snoop")]
    fn test_single_outstanding_snoop_per_block() {
        let mut sb = SnoopBuffer::new(4);
        sb.alloc_entry(transport(MessageKind::Invalidate, 0x40));
        sb.alloc_entry(transport(MessageKind::ReadFwd, 0x40));
    }

    #[test]
    #[should_panic(expected = "full snoop buffer")]
    fn test_overflow_is_fatal() {
        let mut sb = SnoopBuffer::new(1);
        sb.alloc_entry(transport(MessageKind::Invalidate, 0x40));
        sb.add_waiting_entry(transport(MessageKind::ReadReq, 0x40));
    }
}
