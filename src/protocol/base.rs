use crate::array::{self, Array, Lookup};
use crate::evict_buffer::EvictBuffer;
use crate::message::{Message, Transport};
use crate::request_tracker::RequestTracker;
use crate::snoop_buffer::SnoopBuffer;
use crate::state::{CacheLevel, CoherenceState, FillLevel};
use crate::stats::Stats;
use crate::{address, config};

/// Evictions that may be in flight before the buffer stops draining.
pub const EVICT_THRESHOLD: usize = 4;

/// State shared by every protocol: the array, the evict and snoop buffers
/// and the per-set request count.
#[derive(Debug)]
pub struct Base {
    pub name: String,
    pub node: usize,
    pub level: CacheLevel,
    pub cores: usize,
    pub block_size: u64,
    pub array: Box<dyn Array>,
    pub evict_buffer: EvictBuffer,
    pub snoop_buffer: SnoopBuffer,
    pub requests: RequestTracker,
    pub stats: Stats,
    /// Evictions sent and not yet acknowledged.
    pub pending_evicts: usize,
    pub writable_evicts_have_data: bool,
    pub evict_acks_required: bool,
}

impl Base {
    pub fn new(config: &config::Cache, evict_acks_required: bool) -> Result<Self, config::Error> {
        Ok(Self {
            name: config.name.clone(),
            node: config.node_id,
            level: config.level,
            cores: config.cores,
            block_size: config.block_size,
            array: array::build(&config.array, config.block_size)?,
            evict_buffer: EvictBuffer::new(config.eb_size),
            snoop_buffer: SnoopBuffer::new(config.sb_size),
            requests: RequestTracker::new(),
            stats: Stats::new(config.name.clone()),
            pending_evicts: 0,
            writable_evicts_have_data: config.writable_evicts_have_data,
            evict_acks_required,
        })
    }

    #[must_use]
    pub fn block_address(&self, addr: address) -> address {
        self.array.block_address(addr)
    }

    #[must_use]
    pub fn set(&self, addr: address) -> usize {
        self.array.set_index(addr)
    }

    #[must_use]
    pub fn lookup(&self, addr: address) -> Lookup {
        self.array.lookup(addr)
    }

    #[must_use]
    pub fn state(&self, lookup: &Lookup) -> CoherenceState {
        self.array.state(lookup).state
    }

    #[must_use]
    pub fn fill_level(&self) -> FillLevel {
        self.level.into()
    }

    /// A request of `kind` for the block of `msg`, sized to a full block.
    #[must_use]
    pub fn block_request(&self, msg: &Message, kind: crate::MessageKind) -> Message {
        let mut request = msg.derive(kind).with_req_size(self.block_size as u32);
        request.addr = self.block_address(msg.addr);
        request
    }

    /// Evict buffer slots beyond those kept for in-flight evictions.
    #[must_use]
    pub fn free_evict_buffer(&self) -> usize {
        (self.evict_buffer.free_entries() + self.pending_evicts).saturating_sub(EVICT_THRESHOLD)
    }

    #[must_use]
    pub fn evictable_block_exists(&self, scheduled: usize) -> bool {
        if self.pending_evicts + scheduled >= EVICT_THRESHOLD {
            return false;
        }
        self.evict_buffer
            .head_evictable(scheduled + self.pending_evicts)
    }

    #[must_use]
    pub fn full_evict_buffer(&self) -> bool {
        self.evict_buffer.full() || !self.array.eviction_resources_available()
    }

    pub fn reserve_evict_buffer(&mut self) {
        self.evict_buffer.reserve();
        self.array.reserve_eviction_resource();
    }

    pub fn unreserve_evict_buffer(&mut self) {
        self.evict_buffer.unreserve();
        self.array.unreserve_eviction_resource();
    }

    #[must_use]
    pub fn can_start_request(&self, addr: address) -> bool {
        self.requests.active_requests(self.set(addr)) < self.array.requests_per_set()
    }

    #[must_use]
    pub fn idle_work_available(&self, front_side_out_full: bool) -> bool {
        if front_side_out_full || self.snoop_buffer.full() {
            return false;
        }
        let snoop_required = self
            .evict_buffer
            .back()
            .is_some_and(|entry| entry.snoop_required);
        snoop_required || (!self.evict_buffer.full() && self.array.eviction_resource_pressure())
    }

    pub fn idle_work_message(&mut self) -> Option<Transport> {
        let entry = self.evict_buffer.oldest_requiring_snoops()?;
        entry.snoop_required = false;
        let msg = Message::new(entry.kind, entry.addr);
        Some(msg.into())
    }

    /// Eviction message kind for a block leaving in `state`.
    #[must_use]
    pub fn evict_kind(state: CoherenceState, owned: bool) -> crate::MessageKind {
        use crate::MessageKind;
        match state {
            CoherenceState::Modified => MessageKind::EvictDirty,
            CoherenceState::Owned if owned => MessageKind::EvictDirty,
            CoherenceState::Exclusive => MessageKind::EvictWritable,
            _ => MessageKind::EvictClean,
        }
    }

    /// Remove a block from the array and note it in the evict buffer.
    ///
    /// Returns whether the block was dirty.
    pub fn evict_block(
        &mut self,
        addr: address,
        state: CoherenceState,
        owned: bool,
        evictable: bool,
    ) -> bool {
        let kind = Self::evict_kind(state, owned);
        log::trace!("{}: evict {:#x} in {} as {}", self.name, addr, state, kind);
        self.evict_buffer.alloc_entry(addr, kind, state, evictable);
        kind == crate::MessageKind::EvictDirty
    }

    /// Make room for the looked up block, moving any victim into the evict
    /// buffer.
    pub fn allocate_block(&mut self, lookup: &mut Lookup, owned: bool, evictable: bool) {
        if let Some(victim) = self.array.allocate(lookup) {
            self.evict_block(victim.addr, victim.state.state, owned, evictable);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Base;
    use crate::config;
    use crate::message::MessageKind;
    use crate::state::CoherenceState;
    use color_eyre::eyre;

    fn base(eb_size: usize) -> eyre::Result<Base> {
        let config = config::Cache {
            array: "STD:size=1024:assoc=2:repl=lru".to_string(),
            eb_size,
            ..config::Cache::default()
        };
        Ok(Base::new(&config, true)?)
    }

    #[test]
    fn test_evict_threshold() -> eyre::Result<()> {
        let mut base = base(8)?;
        assert_eq!(base.free_evict_buffer(), 4);
        base.evict_block(0x40, CoherenceState::Modified, false, true);
        base.evict_block(0x80, CoherenceState::Shared, false, false);
        assert_eq!(base.free_evict_buffer(), 2);
        assert!(base.evictable_block_exists(0));
        assert!(!base.evictable_block_exists(1));
        base.pending_evicts = 4;
        assert!(!base.evictable_block_exists(0));

        // fewer free slots than the threshold leave nothing to spare
        let mut base = self::base(4)?;
        base.evict_block(0x40, CoherenceState::Modified, false, true);
        assert_eq!(base.evict_buffer.free_entries(), 3);
        assert_eq!(base.free_evict_buffer(), 0);
        Ok(())
    }

    #[test]
    fn test_evict_kinds() {
        assert_eq!(
            Base::evict_kind(CoherenceState::Modified, false),
            MessageKind::EvictDirty
        );
        assert_eq!(
            Base::evict_kind(CoherenceState::Owned, true),
            MessageKind::EvictDirty
        );
        assert_eq!(
            Base::evict_kind(CoherenceState::Exclusive, true),
            MessageKind::EvictWritable
        );
        assert_eq!(
            Base::evict_kind(CoherenceState::Shared, false),
            MessageKind::EvictClean
        );
    }

    #[test]
    fn test_allocation_moves_victim_to_evict_buffer() -> eyre::Result<()> {
        // 8 sets of 2 ways, set stride 0x200
        let mut base = base(4)?;
        for addr in [0x0, 0x200] {
            let mut lookup = base.lookup(addr);
            base.allocate_block(&mut lookup, false, false);
            base.array.set_state(&lookup, CoherenceState::Modified);
        }
        assert!(base.evict_buffer.is_empty());
        let mut lookup = base.lookup(0x400);
        base.allocate_block(&mut lookup, false, false);
        let entry = base.evict_buffer.find(0x0).cloned();
        assert_eq!(entry.map(|e| (e.kind, e.snoop_required)), Some((MessageKind::EvictDirty, true)));
        assert!(base.idle_work_available(false));
        assert!(!base.idle_work_available(true));
        let work = base.idle_work_message();
        assert_eq!(work.map(|t| t.kind()), Some(MessageKind::EvictDirty));
        assert!(base.idle_work_message().is_none());
        Ok(())
    }

    #[test]
    fn test_can_start_request() -> eyre::Result<()> {
        let mut base = base(4)?;
        assert!(base.can_start_request(0x40));
        base.requests.start_request(base.set(0x40));
        base.requests.start_request(base.set(0x240));
        assert!(!base.can_start_request(0x40));
        assert!(base.can_start_request(0x80));
        Ok(())
    }
}
