use super::hasher::BucketHasher;
use super::{tagless, Base, Options, Protocol, ProtocolKind};
use crate::action::{Action, ActionKind};
use crate::array::Lookup;
use crate::maf::Maf;
use crate::message::{DirectoryHint, Message, MessageKind, Tracker, Transport};
use crate::state::{CacheLevel, CoherenceState, FillType, PreviousState};
use crate::stats::Outcome;
use crate::{address, config};

/// Member of the inclusive protocol family.
#[derive(Debug, Clone)]
pub enum Flavor {
    Mesi,
    Moesi,
    /// MOESI below a tagless directory. Evictions and invalidations carry
    /// hints about the directory buckets the block no longer occupies.
    Tagless(BucketHasher),
}

/// Inclusive cache protocol: every block cached above is also present here
/// or in the evict buffer.
#[derive(Debug)]
pub struct Inclusive {
    kind: ProtocolKind,
    flavor: Flavor,
    options: Options,
    base: Base,
}

/// A block as the protocol sees it: in the array or in the evict buffer.
#[derive(Debug, Clone, Copy)]
struct Block {
    lookup: Lookup,
    state: CoherenceState,
    from_eb: bool,
    pending: bool,
    evictable: bool,
}

fn restore_request(msg: &mut Message, original: &Message) {
    msg.req_size = original.req_size;
    msg.addr = original.addr;
    msg.pc = original.pc;
    msg.core = original.core;
}

fn store_reply(kind: MessageKind) -> Option<MessageKind> {
    match kind {
        MessageKind::StoreReq => Some(MessageKind::StoreReply),
        MessageKind::StorePrefetchReq => Some(MessageKind::StorePrefetchReply),
        MessageKind::CmpxReq => Some(MessageKind::CmpxReply),
        MessageKind::RMWReq => Some(MessageKind::RMWReply),
        _ => None,
    }
}

impl Inclusive {
    pub fn new(
        kind: ProtocolKind,
        mut options: Options,
        config: &config::Cache,
    ) -> Result<Self, config::Error> {
        let flavor = match kind {
            ProtocolKind::InclusiveMesi => Flavor::Mesi,
            ProtocolKind::InclusiveMoesi => Flavor::Moesi,
            ProtocolKind::TaglessMoesi => {
                if config.cores != 1 {
                    return Err(config::Error::Invalid(format!(
                        "{kind} supports a single core, {} has {}",
                        config.name, config.cores
                    )));
                }
                if matches!(config.level, CacheLevel::L1 | CacheLevel::L1I) {
                    return Err(config::Error::Invalid(format!(
                        "{kind} cannot run at level {}",
                        config.level
                    )));
                }
                let hasher = config.directory.clone().unwrap_or_default();
                options.evict_acks_required = true;
                Flavor::Tagless(BucketHasher::new(&hasher)?)
            }
        };
        let base = Base::new(config, options.evict_acks_required)?;
        Ok(Self {
            kind,
            flavor,
            options,
            base,
        })
    }

    #[must_use]
    pub fn options(&self) -> &Options {
        &self.options
    }

    #[must_use]
    pub fn flavor(&self) -> &Flavor {
        &self.flavor
    }

    /// Whether the protocol has an owned state.
    fn owned(&self) -> bool {
        !matches!(self.flavor, Flavor::Mesi)
    }

    fn tagless(&self) -> bool {
        matches!(self.flavor, Flavor::Tagless(_))
    }

    fn is_l1(&self) -> bool {
        matches!(self.flavor, Flavor::Mesi) && self.base.level == CacheLevel::L1
    }

    fn is_l1i(&self) -> bool {
        matches!(self.flavor, Flavor::Mesi) && self.base.level == CacheLevel::L1I
    }

    /// Only level one caches built on MESI bound their misses per set.
    fn start_request(&mut self, addr: address) {
        if matches!(self.flavor, Flavor::Mesi) {
            let set = self.base.set(addr);
            self.base.requests.start_request(set);
        }
    }

    fn end_request(&mut self, addr: address) {
        if matches!(self.flavor, Flavor::Mesi) {
            let set = self.base.set(addr);
            self.base.requests.end_request(set);
        }
    }

    /// Dirty blocks must be written back when they leave this cache.
    fn holds_dirty(&self, state: CoherenceState) -> bool {
        if self.owned() {
            state.is_dirty()
        } else {
            state == CoherenceState::Modified
        }
    }

    fn block(&self, addr: address) -> Block {
        let lookup = self.base.lookup(addr);
        let state = self.base.state(&lookup);
        match self.base.evict_buffer.find(addr) {
            Some(entry) if !state.is_valid() => Block {
                lookup,
                state: entry.state,
                from_eb: true,
                pending: entry.pending,
                evictable: entry.evictable,
            },
            _ => Block {
                lookup,
                state,
                from_eb: false,
                pending: false,
                evictable: false,
            },
        }
    }

    /// Change the state of a block, keeping it protected if it was.
    fn transition(&mut self, lookup: &Lookup, state: CoherenceState) {
        let protected = self.base.array.state(lookup).protected;
        self.base.array.set_state(lookup, state);
        if protected && state.is_valid() {
            self.base.array.set_protected(lookup, true);
        }
    }

    fn allocate(&mut self, lookup: &mut Lookup) {
        let owned = self.owned();
        let evictable = self.is_l1i();
        self.base.allocate_block(lookup, owned, evictable);
    }

    /// Note that this cache supplied the block of a forwarded request.
    fn supplied(&self, tracker: &mut Tracker, state: CoherenceState) {
        tracker.network_traffic_required = Some(true);
        tracker.responder = Some(self.base.node);
        if tracker.fill_level.is_none() {
            tracker.fill_level = Some(self.base.level.peer());
            tracker.previous_state = Some(state.into());
        }
    }

    fn coherence_miss(tracker: &mut Tracker) {
        if tracker.fill_type.is_none() {
            tracker.fill_type = Some(FillType::Coherence);
        }
    }

    fn reply_back(mut transport: Transport, kind: MessageKind, data: u32) -> Action {
        transport.message.kind = kind;
        Action::new(ActionKind::Send, data).with_back(transport)
    }

    fn nack(&self, transport: Transport, kind: MessageKind) -> Action {
        if self.options.always_nack {
            Self::reply_back(transport, kind, 0)
        } else {
            Action::new(ActionKind::NoAction, 0)
        }
    }

    /// Send `kind` to the levels above and remember `transport` until all
    /// of them answered.
    fn snoop_up(&mut self, transport: Transport, kind: MessageKind, to_d: bool, to_i: bool) -> Action {
        let msg = Message {
            pc: transport.message.pc,
            core: transport.message.core,
            ..Message::new(kind, transport.addr())
        }
        .with_req_size(0);
        let front = Transport::new(msg, transport.tracker.clone());
        let entry = self.base.snoop_buffer.alloc_entry(transport);
        entry.d_outstanding = to_d;
        entry.i_outstanding = to_i;
        let mut action = Action::new(ActionKind::Send, 0).with_front(front);
        action.front_to_d = to_d;
        action.front_to_i = to_i;
        action
    }

    fn wait_for_snoop(&mut self, transport: Transport) -> Action {
        self.base.snoop_buffer.add_waiting_entry(transport);
        Action::new(ActionKind::NoAction, 0)
    }

    /// A write from elsewhere overtook our upgrade, which now has to fetch
    /// the data as well.
    fn convert_upgrade(&mut self, maf: &mut Maf, block: &Block) {
        let Some(entry) = maf.waiting_entry_mut(block.lookup.addr) else {
            return;
        };
        if entry.transport.kind() == MessageKind::UpgradeReq {
            log::debug!(
                "{}: upgrade of {:#x} overtaken, converting to a write",
                self.base.name,
                block.lookup.addr
            );
            entry.transport.message.kind = MessageKind::WriteReq;
            self.base.array.set_protected(&block.lookup, false);
        }
    }

    /// Give up a block of the instruction cache, which never holds dirty
    /// data and has nothing above it.
    fn drop_block(&mut self, block: &Block) {
        if !block.from_eb {
            self.base.array.set_state(&block.lookup, CoherenceState::Invalid);
            self.base.array.invalidate_block(&block.lookup);
        } else if !block.pending {
            self.base.evict_buffer.remove(block.lookup.addr);
        }
    }

    fn read_forward(&mut self, mut transport: Transport) -> Action {
        let addr = transport.addr();
        let block = self.block(addr);
        match block.state {
            CoherenceState::Invalid => Self::reply_back(transport, MessageKind::FwdNAck, 0),
            CoherenceState::Shared => {
                let tracker = &mut transport.tracker;
                tracker.network_traffic_required = Some(false);
                tracker.responder = Some(self.base.node);
                tracker.fill_level = Some(self.base.level.peer());
                tracker.previous_state = Some(PreviousState::Shared);
                Self::reply_back(transport, MessageKind::FwdReply, 1)
            }
            CoherenceState::Exclusive => {
                if self.base.snoop_buffer.has_entry(addr) {
                    self.wait_for_snoop(transport)
                } else {
                    self.snoop_up(transport, MessageKind::Downgrade, true, false)
                }
            }
            CoherenceState::Modified | CoherenceState::Owned => {
                let previous = PreviousState::from(block.state);
                if block.from_eb {
                    let mesi = !self.owned();
                    if let Some(entry) = self.base.evict_buffer.find_mut(addr) {
                        entry.state = CoherenceState::Shared;
                        if mesi {
                            entry.kind = MessageKind::EvictClean;
                        }
                    }
                } else {
                    self.transition(&block.lookup, CoherenceState::Shared);
                }
                let tracker = &mut transport.tracker;
                tracker.network_traffic_required = Some(true);
                tracker.responder = Some(self.base.node);
                tracker.fill_level = Some(self.base.level.peer());
                tracker.previous_state = Some(previous);
                Self::reply_back(transport, MessageKind::FwdReplyOwned, 1)
            }
        }
    }

    fn write_forward(&mut self, mut transport: Transport, maf: &mut Maf) -> Action {
        let addr = transport.addr();
        let block = self.block(addr);
        if !block.state.is_valid() {
            return self.nack(transport, MessageKind::FwdNAck);
        }
        self.convert_upgrade(maf, &block);
        if self.is_l1i() || (block.from_eb && block.pending) {
            let tracker = &mut transport.tracker;
            tracker.network_traffic_required = Some(true);
            tracker.responder = Some(self.base.node);
            tracker.fill_level = Some(self.base.fill_level());
            let kind = if self.is_l1i() {
                self.drop_block(&block);
                MessageKind::FwdReplyWritable
            } else if block.state == CoherenceState::Modified {
                MessageKind::FwdReplyDirty
            } else {
                MessageKind::FwdReplyWritable
            };
            return Self::reply_back(transport, kind, 1);
        }
        if self.base.snoop_buffer.has_entry(addr) {
            return self.wait_for_snoop(transport);
        }
        let l1 = self.is_l1();
        let array_state = self.base.state(&block.lookup);
        // a modified block cannot also be cached in the data cache above
        let to_d = l1 || array_state != CoherenceState::Modified;
        self.snoop_up(transport, MessageKind::Invalidate, to_d, !l1)
    }

    /// An exclusive copy is taken away with a forward, never with a plain
    /// invalidate, and no read of an invalidated block can be in flight.
    ///
    /// # Panics
    /// On either protocol violation. Below a tagless directory, which cannot
    /// tell exclusive from shared copies, an exclusive block may be
    /// invalidated as long as no request for it is outstanding.
    fn check_invalidate(&self, transport: &Transport, block: &Block, maf: &Maf) {
        let name = &self.base.name;
        let waiting = maf
            .waiting_entry(block.lookup.addr)
            .map(|entry| entry.message().kind);
        let exclusive = matches!(
            block.state,
            CoherenceState::Exclusive | CoherenceState::Modified
        );
        if exclusive && self.tagless() {
            if let Some(kind) = waiting {
                panic!(
                    "{name}: received {transport} while in {} and waiting for {kind}",
                    block.state
                );
            }
            return;
        }
        if exclusive && !self.options.two_level_private {
            panic!("{name}: received {transport} while in {}", block.state);
        }
        if let Some(kind) = waiting.filter(|kind| !kind.is_write()) {
            panic!(
                "{name}: received {transport} in {} while waiting for {kind}",
                block.state
            );
        }
    }

    fn invalidate(&mut self, mut transport: Transport, maf: &mut Maf) -> Action {
        let addr = transport.addr();
        let block = self.block(addr);
        if !block.state.is_valid() {
            return self.nack(transport, MessageKind::InvalidateNAck);
        }
        let back_invalidate = transport.kind() == MessageKind::BackInvalidate;
        if !back_invalidate {
            self.check_invalidate(&transport, &block, maf);
        }
        self.convert_upgrade(maf, &block);
        if self.is_l1i() {
            Self::coherence_miss(&mut transport.tracker);
            self.drop_block(&block);
            return Self::reply_back(transport, MessageKind::InvalidateAck, 0);
        }
        if block.from_eb && block.pending {
            return Self::reply_back(transport, MessageKind::InvalidateAck, 0);
        }
        if !back_invalidate && block.from_eb && block.evictable {
            self.base.evict_buffer.remove(addr);
            return Self::reply_back(transport, MessageKind::InvalidateAck, 0);
        }
        if self.base.snoop_buffer.has_entry(addr) {
            return self.wait_for_snoop(transport);
        }
        let l1 = self.is_l1();
        let to_d = !back_invalidate || l1 || block.state != CoherenceState::Modified;
        self.snoop_up(transport, MessageKind::Invalidate, to_d, !l1)
    }

    fn evict_ack(&mut self, addr: address) -> Action {
        if let Some(entry) = self.base.evict_buffer.remove(addr) {
            if entry.pending {
                self.base.pending_evicts = self.base.pending_evicts.saturating_sub(1);
            }
        }
        let mut action = Action::new(ActionKind::NoAction, 0);
        action.wake_evicts = true;
        action
    }

    fn non_allocating_store_reply(&mut self, transport: Transport) -> Action {
        let kind = if self.owned() {
            ActionKind::ReplyAndRemoveResponseMaf
        } else {
            ActionKind::Send
        };
        let mut action = Action::new(kind, 0);
        if transport.message.ack_required {
            let ack = transport.message.derive(MessageKind::NASAck);
            action = action.with_back(transport.with_message(ack));
        }
        action.with_front(transport)
    }

    /// A write may only complete with the data in hand. Below a tagless
    /// directory the data may never have been sent, so ask again.
    fn write_retry(&mut self, transport: Transport, maf: &mut Maf, addr: address) -> Action {
        if let Some(entry) = maf.waiting_entry_mut(addr) {
            entry.outstanding_msgs += 1;
        }
        self.base.stats.write_retries += 1;
        let retry = transport
            .message
            .derive(MessageKind::WriteRetry)
            .with_req_size(self.base.block_size as u32);
        let mut retry = transport.with_message(retry);
        retry.message.addr = addr;
        retry.hint = None;
        Action::new(ActionKind::Send, 0).with_back(retry)
    }

    fn write_ack(
        &self,
        transport: &Transport,
        sent_upgrade: bool,
        hint: Option<DirectoryHint>,
    ) -> Transport {
        let kind = if sent_upgrade {
            MessageKind::UpgradeAck
        } else {
            MessageKind::WriteAck
        };
        let mut ack = transport.with_message(transport.message.derive(kind));
        ack.message.ack_requires_data = false;
        ack.hint = if self.tagless() {
            Some(hint.unwrap_or_default())
        } else {
            None
        };
        ack
    }

    fn miss_notify(&mut self, mut transport: Transport, maf: &mut Maf) -> Action {
        let addr = self.base.block_address(transport.addr());
        let name = self.base.name.clone();
        let Some(entry) = maf.waiting_entry_mut(addr) else {
            panic!("{name}: {transport} without an outstanding miss");
        };
        entry.outstanding_msgs += transport.message.outstanding_msgs;
        if self.tagless() {
            tagless::merge_hint(&mut entry.transport, &transport);
        }
        if entry.outstanding_msgs != 0 {
            return Action::new(ActionKind::NoAction, 1);
        }
        let original = entry.message().clone();
        let lookup = self.base.lookup(addr);
        let state = self.base.state(&lookup);
        let mut sent_upgrade = original.kind == MessageKind::UpgradeReq;
        if !entry.data_received && state.is_valid() {
            let tracker = &mut transport.tracker;
            tracker.network_traffic_required = Some(true);
            tracker.responder = Some(self.base.node);
            if tracker.fill_level.is_none() {
                tracker.fill_level = Some(self.base.fill_level());
            }
            entry.data_received = true;
            sent_upgrade = true;
        }
        if !entry.data_received {
            if self.tagless() {
                return self.write_retry(transport, maf, addr);
            }
            log::warn!("{name}: {transport} completes a write without data");
        }
        let hint = entry.transport.hint.clone();

        self.base.array.set_protected(&lookup, false);
        if let Some(reply) = store_reply(original.kind) {
            transport.message.kind = reply;
            self.base.array.set_state(&lookup, CoherenceState::Modified);
        } else {
            transport.message.kind = if original.kind == MessageKind::UpgradeReq {
                MessageKind::UpgradeReply
            } else if state == CoherenceState::Modified {
                MessageKind::MissReplyDirty
            } else {
                MessageKind::MissReplyWritable
            };
            if lookup.found() {
                self.base.array.set_state(&lookup, CoherenceState::Exclusive);
            }
        }
        if self.is_l1() {
            restore_request(&mut transport.message, &original);
        } else {
            transport.message.req_size = self.base.block_size as u32;
        }
        self.end_request(addr);
        self.base.stats.fills += 1;

        let ack = self.write_ack(&transport, sent_upgrade, hint);
        Action::new(ActionKind::ReplyAndRemoveResponseMaf, 1)
            .with_back(ack)
            .with_front(transport)
    }

    /// Reply to one of our own misses.
    fn reply(&mut self, mut transport: Transport, maf: &mut Maf) -> Action {
        use MessageKind as K;
        let addr = self.base.block_address(transport.addr());
        let name = self.base.name.clone();
        let Some(entry) = maf.waiting_entry_mut(addr) else {
            panic!("{name}: reply {transport} without an outstanding miss");
        };
        if self.tagless() {
            tagless::merge_hint(&mut entry.transport, &transport);
        }
        let original = entry.message().clone();
        let is_prefetch = original.kind == K::PrefetchReadAllocReq
            || entry.transport.tracker.from_prefetcher;
        let reply = transport.kind();
        let block_size = self.base.block_size as u32;
        let owned = self.owned();
        let mut lookup = self.base.lookup(addr);

        let mut action = Action::new(ActionKind::ReplyAndRemoveResponseMaf, 1);
        let mut back: Option<Transport> = None;
        let mut is_final = false;
        let mut upgrade = false;

        let read_ack = |transport: &Transport, kind: MessageKind| {
            let mut ack = transport.message.derive(kind).with_req_size(block_size);
            ack.ack_requires_data = transport.message.ack_requires_data;
            transport.with_message(ack)
        };

        match original.kind {
            K::FetchReq => {
                self.allocate(&mut lookup);
                let state = match reply {
                    K::FwdReplyOwned if owned => CoherenceState::Owned,
                    K::FetchReply | K::FwdReply | K::MissReply | K::FwdReplyOwned => {
                        CoherenceState::Shared
                    }
                    _ => panic!("{name}: invalid reply {transport} to a fetch"),
                };
                self.base.array.set_state(&lookup, state);
                is_final = true;
                if transport.message.ack_required {
                    let kind = if reply == K::FwdReplyOwned {
                        K::FetchAckDirty
                    } else {
                        K::FetchAck
                    };
                    back = Some(read_ack(&transport, kind));
                }
                transport.message.kind = K::FetchReply;
                if self.is_l1i() {
                    restore_request(&mut transport.message, &original);
                }
                action = action.to_icache();
            }
            K::LoadReq | K::ReadReq => {
                self.allocate(&mut lookup);
                let load = original.kind == K::LoadReq;
                let (state, dirty) = match reply {
                    K::MissReply | K::FwdReply => (CoherenceState::Shared, false),
                    K::MissReplyWritable => (CoherenceState::Exclusive, false),
                    K::MissReplyDirty if load => (CoherenceState::Modified, false),
                    K::FwdReplyOwned | K::MissReplyDirty if owned => (CoherenceState::Owned, false),
                    K::FwdReplyOwned | K::MissReplyDirty => (CoherenceState::Shared, true),
                    _ => panic!("{name}: invalid reply {transport} to a read"),
                };
                self.base.array.set_state(&lookup, state);
                is_final = true;
                if transport.message.ack_required {
                    let kind = if dirty { K::ReadAckDirty } else { K::ReadAck };
                    back = Some(read_ack(&transport, kind));
                }
                if load {
                    transport.message.kind = K::LoadReply;
                    restore_request(&mut transport.message, &original);
                } else if reply != K::MissReplyWritable {
                    transport.message.kind = K::MissReply;
                }
            }
            K::StoreReq | K::StorePrefetchReq | K::CmpxReq | K::RMWReq | K::WriteReq => {
                let Some(entry) = maf.waiting_entry_mut(addr) else {
                    unreachable!("waiting entry disappeared");
                };
                if reply == K::MissNotifyData {
                    entry.outstanding_msgs += transport.message.outstanding_msgs;
                } else {
                    entry.outstanding_msgs -= 1;
                }
                let (dirty, mut has_data) = match reply {
                    K::UpgradeReply => {
                        entry.outstanding_msgs = 0;
                        (false, false)
                    }
                    K::InvalidateAck | K::InvalidateNAck => (false, false),
                    K::FwdNAck if self.tagless() => (false, false),
                    K::MissNotifyData
                    | K::FwdReplyOwned
                    | K::FwdReplyDirty
                    | K::InvUpdateAck
                    | K::MissReplyDirty => (true, true),
                    K::FwdReplyWritable | K::MissReplyWritable => (false, true),
                    _ => panic!("{name}: invalid reply {transport} to a write"),
                };
                if has_data {
                    let fill = !self.base.state(&lookup).is_valid();
                    if fill {
                        entry.data_received = true;
                        self.allocate(&mut lookup);
                    } else if !dirty {
                        has_data = false;
                    }
                    let state = if dirty {
                        CoherenceState::Modified
                    } else {
                        CoherenceState::Exclusive
                    };
                    self.transition(&lookup, state);
                    if fill {
                        self.base.array.set_protected(&lookup, true);
                    }
                }
                let writable = matches!(reply, K::MissReplyWritable | K::MissReplyDirty);
                if writable && (!transport.message.ack_required || transport.message.outstanding_msgs == -1) {
                    entry.outstanding_msgs = 0;
                }
                let complete = entry.outstanding_msgs == 0
                    || (owned && !self.options.require_miss_notify);
                if complete {
                    let state = self.base.state(&lookup);
                    let mut sent_upgrade = false;
                    if !entry.data_received && state.is_valid() {
                        let tracker = &mut transport.tracker;
                        tracker.network_traffic_required = Some(true);
                        tracker.responder = Some(self.base.node);
                        if tracker.fill_level.is_none() {
                            tracker.fill_level = Some(self.base.fill_level());
                        }
                        entry.data_received = true;
                        sent_upgrade = true;
                    }
                    if !entry.data_received && self.tagless() {
                        return self.write_retry(transport, maf, addr);
                    }
                    let hint = entry.transport.hint.clone();
                    if transport.message.ack_required {
                        back = Some(self.write_ack(&transport, sent_upgrade, hint));
                    }
                    transport.message.req_size = block_size;
                    if let Some(kind) = store_reply(original.kind) {
                        transport.message.kind = kind;
                        self.base.array.set_state(&lookup, CoherenceState::Modified);
                        restore_request(&mut transport.message, &original);
                    } else if state == CoherenceState::Modified {
                        transport.message.kind = K::MissReplyDirty;
                        self.base.array.set_state(&lookup, CoherenceState::Exclusive);
                    } else {
                        transport.message.kind = K::MissReplyWritable;
                        self.base.array.set_state(&lookup, CoherenceState::Exclusive);
                    }
                    self.base.array.set_protected(&lookup, false);
                    self.base.array.record_access(&lookup);
                    is_final = true;
                } else {
                    action = Action::new(ActionKind::NoAction, u32::from(has_data));
                }
            }
            K::UpgradeReq => {
                let Some(entry) = maf.waiting_entry_mut(addr) else {
                    unreachable!("waiting entry disappeared");
                };
                entry.outstanding_msgs -= 1;
                match reply {
                    K::UpgradeReply => entry.outstanding_msgs = 0,
                    K::InvalidateAck | K::InvalidateNAck => {}
                    K::FwdReplyOwned => self.transition(&lookup, CoherenceState::Modified),
                    K::MissReplyWritable | K::MissReplyDirty => {}
                    _ => panic!("{name}: invalid reply {transport} to an upgrade"),
                }
                if transport.message.outstanding_msgs == -1
                    && matches!(reply, K::MissReplyWritable | K::MissReplyDirty)
                {
                    entry.outstanding_msgs = 0;
                }
                upgrade = true;
                if entry.outstanding_msgs == 0 {
                    self.base.array.set_state(&lookup, CoherenceState::Exclusive);
                    self.base.array.record_access(&lookup);
                    is_final = true;
                    let hint = entry.transport.hint.clone();
                    if transport.message.ack_required {
                        back = Some(self.write_ack(&transport, true, hint));
                    }
                    transport.message.kind = K::UpgradeReply;
                    transport.message.req_size = block_size;
                    let tracker = &mut transport.tracker;
                    tracker.network_traffic_required = Some(true);
                    tracker.responder = Some(self.base.node);
                    if tracker.fill_level.is_none() {
                        tracker.fill_level = Some(self.base.fill_level());
                    }
                    action = Action::new(ActionKind::ReplyAndRemoveResponseMaf, 0);
                } else {
                    action = Action::new(ActionKind::NoAction, 0);
                }
            }
            K::NonAllocatingStoreReq => {
                restore_request(&mut transport.message, &original);
                if transport.message.ack_required {
                    let mut ack = transport.message.derive(K::NASAck);
                    ack.addr = addr;
                    back = Some(transport.with_message(ack));
                }
            }
            _ => panic!("{name}: reply {transport} to unexpected miss {original}"),
        }

        if is_final {
            self.end_request(addr);
            if upgrade {
                self.base.stats.upgrade_replies += 1;
            } else {
                self.base.stats.fills += 1;
            }
        }
        if self.base.state(&lookup).is_valid() {
            self.base.array.set_prefetched(&lookup, is_prefetch);
        }
        if let Some(back) = back {
            action = action.with_back(back);
        }
        if !action.is(ActionKind::NoAction) {
            action = action.with_front(transport);
        }
        action
    }

    /// Every cache above answered a snoop of ours.
    fn finalize_snoop(&mut self, transport: Transport) -> Action {
        use MessageKind as K;
        self.base.stats.snoops += 1;
        let addr = transport.addr();
        let name = self.base.name.clone();
        let lookup = self.base.lookup(addr);
        let in_array = self.base.state(&lookup).is_valid();
        let mut requires_data = transport.kind().is_update_ack();

        let Some(entry) = self.base.snoop_buffer.find_entry_mut(addr) else {
            panic!("{name}: snoop reply {transport} without an outstanding snoop");
        };
        entry.record_reply(transport.kind());
        if transport.message.dstream {
            entry.d_outstanding = false;
        } else {
            entry.i_outstanding = false;
        }
        if entry.outstanding() {
            return Action::new(ActionKind::NoAction, u32::from(requires_data));
        }
        let Some(snoop) = self.base.snoop_buffer.remove_active(addr) else {
            unreachable!("active snoop disappeared");
        };

        // a cache above handed back newer data
        if snoop.snoop_state.is_update_ack() {
            if in_array {
                self.transition(&lookup, CoherenceState::Modified);
            } else if let Some(entry) = self.base.evict_buffer.find_mut(addr) {
                entry.state = CoherenceState::Modified;
                entry.kind = K::EvictDirty;
            }
        }
        let mut original = snoop.transport;

        let block_state = if in_array {
            self.base.state(&lookup)
        } else {
            self.base
                .evict_buffer
                .find(addr)
                .map_or(CoherenceState::Invalid, |entry| entry.state)
        };
        let dirty = self.holds_dirty(block_state);
        let mut wake_evicts = false;

        match original.kind() {
            K::ReadFwd | K::FetchFwd => {
                original.message.kind = if dirty {
                    if self.options.snoop_lru && in_array {
                        self.base.array.invalidate_block(&lookup);
                    }
                    K::FwdReplyOwned
                } else {
                    K::FwdReply
                };
                self.supplied(&mut original.tracker, block_state);
                if in_array {
                    self.transition(&lookup, CoherenceState::Shared);
                } else {
                    let mesi = !self.owned();
                    if let Some(entry) = self.base.evict_buffer.find_mut(addr) {
                        entry.state = CoherenceState::Shared;
                        if mesi {
                            entry.kind = K::EvictClean;
                        }
                    }
                }
                requires_data = true;
            }
            kind @ (K::WriteFwd | K::Invalidate | K::BackInvalidate) => {
                if kind == K::WriteFwd {
                    requires_data = !requires_data;
                }
                let tracker = &mut original.tracker;
                let previous = PreviousState::from(block_state);
                let (reply, data) = match kind {
                    K::BackInvalidate if dirty || block_state == CoherenceState::Exclusive => {
                        tracker.previous_state.get_or_insert(previous);
                        (K::InvUpdateAck, true)
                    }
                    K::WriteFwd if dirty => {
                        self.supplied(tracker, block_state);
                        (K::FwdReplyOwned, true)
                    }
                    K::WriteFwd if block_state == CoherenceState::Exclusive => {
                        self.supplied(tracker, block_state);
                        (K::FwdReplyWritable, true)
                    }
                    K::WriteFwd => {
                        tracker.network_traffic_required = Some(true);
                        tracker.responder = Some(self.base.node);
                        tracker.fill_level = Some(self.base.fill_level());
                        (K::FwdReplyWritable, true)
                    }
                    K::Invalidate if dirty || block_state == CoherenceState::Exclusive => {
                        if tracker.fill_level.is_none() {
                            tracker.fill_level = Some(self.base.level.peer());
                            tracker.previous_state = Some(previous);
                        }
                        Self::coherence_miss(tracker);
                        (K::InvalidateAck, false)
                    }
                    _ => {
                        Self::coherence_miss(tracker);
                        (K::InvalidateAck, requires_data)
                    }
                };
                original.message.kind = reply;
                requires_data = data;

                if in_array {
                    self.base.array.set_state(&lookup, CoherenceState::Invalid);
                    self.base.array.invalidate_block(&lookup);
                } else if let Some(entry) = self.base.evict_buffer.find(addr) {
                    let pending = entry.pending;
                    if self.owned() {
                        if pending {
                            self.base.pending_evicts = self.base.pending_evicts.saturating_sub(1);
                            wake_evicts = true;
                        }
                        self.base.evict_buffer.remove(addr);
                        self.base.snoop_buffer.remove_waiting_evict(addr);
                    } else if !pending {
                        self.base.evict_buffer.remove(addr);
                        self.base.snoop_buffer.remove_waiting_evict(addr);
                    }
                }
                if let Flavor::Tagless(hasher) = &self.flavor {
                    original.hint = Some(tagless::invalidation_hint(&self.base, hasher, addr));
                }
            }
            K::EvictClean | K::EvictWritable | K::EvictDirty => {
                if block_state == CoherenceState::Modified {
                    original.message.kind = K::EvictDirty;
                    self.base.evict_buffer.set_evict_type(addr, K::EvictDirty);
                }
                self.base.evict_buffer.set_evictable(addr, true);
            }
            _ => panic!("{name}: snoop for unexpected message {original}"),
        }

        self.base.snoop_buffer.wake_waiting_entries(addr);
        let kind = if original.kind().is_evict() {
            ActionKind::NoAction
        } else {
            ActionKind::Send
        };
        let mut action = Action::new(kind, u32::from(requires_data));
        action.wake_snoops = true;
        action.wake_evicts = wake_evicts;
        if kind == ActionKind::Send {
            action = action.with_back(original);
        }
        action
    }

    /// Invalidate the copies above of a block that is leaving this cache.
    fn snoop_eviction(&mut self, transport: Transport) -> Action {
        let addr = transport.addr();
        let Some(state) = self.base.evict_buffer.find(addr).map(|entry| entry.state) else {
            let mut action = Action::new(ActionKind::NoAction, 0);
            action.remember_snoop_transport = false;
            return action;
        };
        let l1 = self.is_l1();
        self.snoop_up(
            transport,
            MessageKind::Invalidate,
            l1 || state != CoherenceState::Modified,
            !l1,
        )
    }
}

impl Protocol for Inclusive {
    fn kind(&self) -> ProtocolKind {
        self.kind
    }

    fn base(&self) -> &Base {
        &self.base
    }

    fn base_mut(&mut self) -> &mut Base {
        &mut self.base
    }

    fn do_request(
        &mut self,
        transport: &mut Transport,
        has_maf: bool,
    ) -> (Option<Outcome>, Action) {
        use CoherenceState as S;
        use MessageKind as K;
        if has_maf {
            return (None, Action::new(ActionKind::InsertMafWaitAddress, 0));
        }
        let name = self.base.name.clone();
        let addr = self.base.block_address(transport.addr());
        let mut lookup = self.base.lookup(addr);

        if !self.base.state(&lookup).is_valid() {
            if let Some(entry) = self.base.evict_buffer.find(addr) {
                if entry.pending {
                    return (None, Action::new(ActionKind::InsertMafWaitEvict, 0));
                }
                // take the block back from the evict buffer
                let state = entry.state;
                self.base.evict_buffer.remove(addr);
                self.allocate(&mut lookup);
                self.base.array.set_state(&lookup, state);
            }
        }

        let block = self.base.array.state(&lookup);
        let was_prefetched = block.is_valid() && block.prefetched;
        if self.base.snoop_buffer.has_entry(addr) {
            return (None, Action::new(ActionKind::InsertMafWaitSnoop, 0));
        }
        if transport.kind() == K::UpgradeReq && !block.is_valid() {
            transport.message.kind = K::WriteReq;
        }

        let state = block.state;
        let l1 = self.is_l1();
        let mut action = Action::new(ActionKind::ReplyAndRemoveMaf, 1);
        let mut back: Option<Message> = None;
        let mut miss = false;
        let mut upgrade = false;
        let mut probe = false;

        match transport.kind() {
            K::NonAllocatingStoreReq => {
                if matches!(state, S::Exclusive | S::Modified) {
                    self.base.array.record_access(&lookup);
                    if state != S::Modified {
                        self.transition(&lookup, S::Modified);
                    }
                    transport.message.kind = K::NonAllocatingStoreReply;
                } else {
                    miss = true;
                    if self.owned() {
                        action = Action::new(ActionKind::InsertMafWaitResponse, 0);
                    } else if l1 {
                        back = Some(self.base.block_request(&transport.message, K::NonAllocatingStoreReq));
                        action = Action::new(ActionKind::InsertMafWaitResponse, 0);
                    } else {
                        action = Action::new(ActionKind::Send, 0);
                    }
                }
            }
            K::FetchReq => match state {
                S::Exclusive => {
                    // the data cache above may hold a newer copy
                    probe = true;
                    let msg = Message {
                        pc: transport.message.pc,
                        core: transport.message.core,
                        ..Message::new(K::Probe, addr)
                    };
                    action = Action::new(ActionKind::InsertMafWaitProbe, 0)
                        .with_front(transport.with_message(msg.with_req_size(0)));
                    self.base.array.set_protected(&lookup, true);
                }
                S::Invalid => {
                    miss = true;
                    if self.is_l1i() {
                        back = Some(self.base.block_request(&transport.message, K::FetchReq));
                    }
                    action = Action::new(ActionKind::InsertMafWaitResponse, 0);
                }
                _ => {
                    self.base.array.record_access(&lookup);
                    transport.message.kind = K::FetchReply;
                    action = action.to_icache();
                }
            },
            K::LoadReq => {
                if state == S::Invalid {
                    miss = true;
                    back = Some(self.base.block_request(&transport.message, K::ReadReq));
                    action = Action::new(ActionKind::InsertMafWaitResponse, 0);
                } else {
                    self.base.array.record_access(&lookup);
                    transport.message.kind = K::LoadReply;
                }
            }
            K::ReadReq => match state {
                S::Invalid => {
                    miss = true;
                    action = Action::new(ActionKind::InsertMafWaitResponse, 0);
                }
                S::Modified => {
                    self.transition(&lookup, S::Exclusive);
                    self.base.array.record_access(&lookup);
                    transport.message.kind = K::MissReplyDirty;
                }
                S::Exclusive => {
                    self.base.array.record_access(&lookup);
                    transport.message.kind = K::MissReplyWritable;
                }
                S::Shared | S::Owned => {
                    self.base.array.record_access(&lookup);
                    transport.message.kind = K::MissReply;
                }
            },
            kind @ (K::WriteReq | K::RMWReq | K::CmpxReq | K::StoreReq | K::StorePrefetchReq) => {
                let reply = store_reply(kind);
                match state {
                    S::Modified => {
                        match reply {
                            Some(reply) => transport.message.kind = reply,
                            None => {
                                self.transition(&lookup, S::Exclusive);
                                transport.message.kind = K::MissReplyDirty;
                            }
                        }
                        self.base.array.record_access(&lookup);
                    }
                    S::Exclusive => {
                        match reply {
                            Some(reply) => {
                                self.transition(&lookup, S::Modified);
                                transport.message.kind = reply;
                            }
                            None => transport.message.kind = K::MissReplyWritable,
                        }
                        self.base.array.record_access(&lookup);
                    }
                    S::Invalid => {
                        miss = true;
                        if reply.is_some() {
                            back = Some(self.base.block_request(&transport.message, K::WriteReq));
                        }
                        action = Action::new(ActionKind::InsertMafWaitResponse, 0);
                    }
                    S::Shared | S::Owned => {
                        miss = true;
                        upgrade = true;
                        let mut request = transport.message.derive(K::UpgradeReq);
                        request.addr = addr;
                        back = Some(request);
                        action = Action::new(ActionKind::InsertMafWaitResponse, 0);
                        self.base.array.set_prefetched(&lookup, false);
                        self.base.array.set_protected(&lookup, true);
                    }
                }
            }
            K::UpgradeReq => match state {
                S::Shared | S::Owned => {
                    miss = true;
                    upgrade = true;
                    action = Action::new(ActionKind::InsertMafWaitResponse, 0);
                    self.base.array.set_prefetched(&lookup, false);
                    self.base.array.set_protected(&lookup, true);
                }
                _ => {
                    log::debug!("{name}: upgrade {transport} of a block held in {state}");
                    upgrade = true;
                    transport.message.kind = K::UpgradeReply;
                    self.base.array.record_access(&lookup);
                }
            },
            K::PrefetchReadNoAllocReq | K::PrefetchReadAllocReq => {
                if state == S::Invalid {
                    miss = true;
                    action = Action::new(ActionKind::Send, 0);
                } else {
                    transport.message.kind = K::PrefetchReadRedundant;
                    action = Action::new(ActionKind::ReplyAndRemoveMaf, 0);
                }
            }
            _ => panic!("{name}: unexpected request {transport}"),
        }

        let hit = !miss && !probe;
        if hit && was_prefetched {
            self.base.array.set_prefetched(&lookup, false);
        }
        if hit {
            transport.tracker.fill_locally(self.base.node, self.base.fill_level());
        }
        if upgrade {
            transport.tracker.fill_type = Some(FillType::Coherence);
            self.base.stats.upgrades += 1;
        }

        match action.kind {
            ActionKind::InsertMafWaitResponse => {
                let back = match back {
                    Some(msg) => transport.with_message(msg),
                    None => transport.clone(),
                };
                action = action.with_back(back);
                self.start_request(addr);
            }
            ActionKind::ReplyAndRemoveMaf => action = action.with_front(transport.clone()),
            ActionKind::Send => action = action.with_back(transport.clone()),
            ActionKind::InsertMafWaitProbe => self.start_request(addr),
            _ => {}
        }

        let outcome = if probe {
            None
        } else if miss {
            Some(Outcome::Miss)
        } else if was_prefetched {
            Some(Outcome::PrefetchedHit)
        } else {
            Some(Outcome::Hit)
        };
        (outcome, action)
    }

    fn handle_back_message(&mut self, transport: Transport, maf: &mut Maf) -> Action {
        use MessageKind as K;
        self.base.stats.accesses += 1;
        match transport.kind() {
            K::ProtocolMessage => Action::new(ActionKind::Send, 0).with_back(transport),
            K::ReadFwd | K::FetchFwd => self.read_forward(transport),
            K::WriteFwd => self.write_forward(transport, maf),
            K::Invalidate | K::BackInvalidate => self.invalidate(transport, maf),
            K::EvictAck => self.evict_ack(transport.addr()),
            K::PrefetchReadReply | K::PrefetchWritableReply | K::PrefetchReadRedundant => {
                Action::new(ActionKind::Send, 0).with_front(transport)
            }
            K::NonAllocatingStoreReply if !self.is_l1() => {
                self.non_allocating_store_reply(transport)
            }
            K::NonAllocatingStoreReply => {
                let addr = self.base.block_address(transport.addr());
                self.end_request(addr);
                self.reply(transport, maf)
            }
            K::MissNotify => self.miss_notify(transport, maf),
            K::FwdReply
            | K::FwdReplyOwned
            | K::FwdReplyWritable
            | K::FwdReplyDirty
            | K::InvalidateAck
            | K::InvalidateNAck
            | K::InvUpdateAck
            | K::MissNotifyData
            | K::FetchReply
            | K::UpgradeReply
            | K::MissReply
            | K::MissReplyWritable
            | K::MissReplyDirty => self.reply(transport, maf),
            K::FwdNAck if self.tagless() => self.reply(transport, maf),
            _ => panic!(
                "{}: unexpected message {} from below",
                self.base.name, transport
            ),
        }
    }

    fn handle_snoop_message(&mut self, transport: Transport) -> Action {
        use MessageKind as K;
        self.base.stats.accesses += 1;
        match transport.kind() {
            K::InvalidateAck | K::InvalidateNAck | K::InvUpdateAck | K::DowngradeAck
            | K::DownUpdateAck => self.finalize_snoop(transport),
            K::EvictDirty => {
                let addr = self.base.block_address(transport.addr());
                let lookup = self.base.lookup(addr);
                if self.base.state(&lookup).is_valid() {
                    self.transition(&lookup, CoherenceState::Modified);
                    self.base.array.record_access(&lookup);
                } else if let Some(entry) = self.base.evict_buffer.find_mut(addr) {
                    entry.kind = K::EvictDirty;
                    entry.state = CoherenceState::Modified;
                }
                Action::new(ActionKind::NoAction, 1)
            }
            _ => Action::new(ActionKind::NoAction, 0),
        }
    }

    fn handle_iprobe(&mut self, hit: bool, transport: &mut Transport) -> Action {
        self.base.stats.accesses += 1;
        self.base.stats.iprobes += 1;
        let addr = self.base.block_address(transport.addr());
        let lookup = self.base.lookup(addr);
        self.base.array.set_protected(&lookup, false);
        self.end_request(addr);
        log::trace!(
            "{}: probe for {} {}",
            self.base.name,
            transport,
            if hit { "hit" } else { "missed" }
        );
        if self.base.snoop_buffer.has_snoops_outstanding(addr) {
            return Action::new(ActionKind::InsertMafWaitSnoop, 0);
        }
        transport.message.kind = MessageKind::FetchReply;
        transport
            .tracker
            .fill_locally(self.base.node, self.base.fill_level());
        self.base.stats.record(MessageKind::FetchReq, Outcome::Hit);
        Action::new(ActionKind::ReplyAndRemoveMaf, 1)
            .with_front(transport.clone())
            .to_icache()
    }

    fn handle_idle_work(&mut self, transport: Option<Transport>) -> Action {
        let mut transport = transport;
        if !self.base.evict_buffer.full() && self.base.array.eviction_resource_pressure() {
            if let Some(victim) = self.base.array.preemptive_eviction() {
                if victim.state.is_valid() {
                    let kind = Base::evict_kind(victim.state.state, self.owned());
                    let entry = self.base.evict_buffer.alloc_entry(
                        victim.addr,
                        kind,
                        victim.state.state,
                        false,
                    );
                    if transport.is_none() {
                        entry.snoop_required = false;
                        transport = Some(Message::new(kind, victim.addr).into());
                    }
                }
            }
        }
        let mut nothing = Action::new(ActionKind::NoAction, 0);
        nothing.remember_snoop_transport = false;
        let Some(transport) = transport else {
            return nothing;
        };
        let addr = transport.addr();
        let Some(entry) = self.base.evict_buffer.find_mut(addr) else {
            return nothing;
        };
        entry.snoop_scheduled = true;
        if self.base.snoop_buffer.has_entry(addr) {
            return self.wait_for_snoop(transport);
        }
        self.snoop_eviction(transport)
    }

    fn handle_wake_snoop(&mut self, transport: Transport, maf: &mut Maf) -> Action {
        if transport.kind().is_evict() {
            self.snoop_eviction(transport)
        } else {
            self.handle_back_message(transport, maf)
        }
    }

    fn do_eviction(&mut self) -> Action {
        let base = &mut self.base;
        if !base.evict_buffer.head_evictable(base.pending_evicts) {
            return Action::new(ActionKind::NoAction, 0);
        }
        let mut msg = base
            .evict_buffer
            .pop(base.pending_evicts)
            .with_req_size(base.block_size as u32);
        let addr = msg.addr;

        let mut tracker = Tracker::new(addr);
        tracker.initiator = Some(base.node);
        tracker.source = Some(format!("{} Evict", base.name));
        tracker.set_delay_cause(&base.name, "Evict");

        let mut hint = None;
        if let Flavor::Tagless(hasher) = &self.flavor {
            let buckets = tagless::eviction_buckets(&self.base, hasher, addr);
            if buckets.is_empty() && msg.kind != MessageKind::EvictDirty {
                // the directory keeps tracking the bucket for the other blocks
                log::trace!("{}: dropping clean eviction of {:#x}", self.base.name, addr);
                self.base.evict_buffer.remove(addr);
                self.base.stats.evicts_dropped += 1;
                return Action::new(ActionKind::NoAction, 0);
            }
            let mut directory_hint = DirectoryHint::default();
            directory_hint.add_conflict_free_set(self.base.node, buckets);
            hint = Some(directory_hint);
        }

        let base = &mut self.base;
        match msg.kind {
            MessageKind::EvictDirty => {
                msg.evict_has_data = true;
                base.stats.evicts_dirty += 1;
                base.stats.evicts_with_data += 1;
            }
            MessageKind::EvictWritable if base.writable_evicts_have_data => {
                msg.evict_has_data = true;
                base.stats.evicts_with_data += 1;
                base.stats.evicts_clean += 1;
            }
            _ => base.stats.evicts_clean += 1,
        }
        base.pending_evicts += 1;
        if !base.evict_acks_required {
            base.evict_buffer.remove(addr);
            base.pending_evicts -= 1;
        }
        let mut transport = Transport::new(msg, tracker);
        transport.hint = hint;
        Action::new(ActionKind::Send, 0).with_back(transport)
    }

    fn is_quiesced(&self) -> bool {
        self.base.snoop_buffer.is_empty() && self.base.pending_evicts == 0
    }
}

#[cfg(test)]
mod tests {
    use super::{Flavor, Inclusive};
    use crate::action::ActionKind;
    use crate::config;
    use crate::maf::{Maf, WaitState};
    use crate::message::{Message, MessageKind, Transport};
    use crate::protocol::{Options, Protocol, ProtocolKind};
    use crate::state::{CacheLevel, CoherenceState};
    use crate::stats::{Outcome, RequestClass};
    use color_eyre::eyre;
    use pretty_assertions_sorted as diff;
    use std::collections::BTreeSet;

    fn protocol(kind: ProtocolKind, options: Options, level: CacheLevel) -> eyre::Result<Inclusive> {
        crate::testing::init_logging();
        let config = config::Cache {
            level,
            array: "STD:size=1024:assoc=2:repl=lru".to_string(),
            ..config::Cache::default()
        };
        Ok(Inclusive::new(kind, options, &config)?)
    }

    fn mesi() -> eyre::Result<Inclusive> {
        protocol(ProtocolKind::InclusiveMesi, Options::default(), CacheLevel::L2)
    }

    fn fill(protocol: &mut Inclusive, addr: u64, state: CoherenceState) {
        let owned = protocol.owned();
        let base = protocol.base_mut();
        let mut lookup = base.lookup(addr);
        base.allocate_block(&mut lookup, owned, false);
        base.array.set_state(&lookup, state);
    }

    fn state(protocol: &Inclusive, addr: u64) -> CoherenceState {
        let base = protocol.base();
        base.state(&base.lookup(addr))
    }

    fn message(kind: MessageKind, addr: u64) -> Transport {
        Message::new(kind, addr).with_req_size(64).into()
    }

    /// Run a request through the protocol, parking it in the MAF if asked.
    fn request(protocol: &mut Inclusive, maf: &mut Maf, transport: Transport) -> (Option<Outcome>, crate::action::Action) {
        let mut transport = transport;
        let (outcome, action) = protocol.do_request(&mut transport, false);
        if action.is(ActionKind::InsertMafWaitResponse) {
            let addr = protocol.block_address(transport.addr());
            maf.alloc(addr, transport, WaitState::WaitResponse);
        }
        (outcome, action)
    }

    #[test]
    fn test_read_miss_fills_exclusive() -> eyre::Result<()> {
        let mut protocol = mesi()?;
        let mut maf = Maf::new(4);
        let (outcome, action) = request(&mut protocol, &mut maf, message(MessageKind::ReadReq, 0x40));
        assert_eq!(outcome, Some(Outcome::Miss));
        assert_eq!(action.kind, ActionKind::InsertMafWaitResponse);
        assert_eq!(action.back.as_ref().map(Transport::kind), Some(MessageKind::ReadReq));
        assert_eq!(action.requires_data, 0);

        let reply = message(MessageKind::MissReplyWritable, 0x40);
        let action = protocol.handle_back_message(reply, &mut maf);
        assert_eq!(action.kind, ActionKind::ReplyAndRemoveResponseMaf);
        assert_eq!(
            action.front.as_ref().map(Transport::kind),
            Some(MessageKind::MissReplyWritable)
        );
        assert_eq!(state(&protocol, 0x40), CoherenceState::Exclusive);
        assert_eq!(protocol.base().stats.fills, 1);

        // a second read hits
        maf.remove_waiting_entry(0x40);
        let (outcome, action) = request(&mut protocol, &mut maf, message(MessageKind::ReadReq, 0x40));
        assert_eq!(outcome, Some(Outcome::Hit));
        assert_eq!(action.kind, ActionKind::ReplyAndRemoveMaf);
        let front = action.front.as_ref().map(|t| (t.kind(), t.tracker.responder));
        assert_eq!(front, Some((MessageKind::MissReplyWritable, Some(0))));
        Ok(())
    }

    #[test]
    fn test_store_miss_on_level_one_restores_request() -> eyre::Result<()> {
        let mut protocol = protocol(ProtocolKind::InclusiveMesi, Options::default(), CacheLevel::L1)?;
        let mut maf = Maf::new(4);
        let store = Message::new(MessageKind::StoreReq, 0x48)
            .with_req_size(8)
            .with_core(0);
        let (_, action) = request(&mut protocol, &mut maf, store.into());
        let back = action.back.as_ref().map(|t| (t.kind(), t.addr(), t.message.req_size));
        assert_eq!(back, Some((MessageKind::WriteReq, 0x40, 64)));
        assert_eq!(protocol.base().requests.active_requests(1), 1);

        let reply = message(MessageKind::MissReplyWritable, 0x40);
        let action = protocol.handle_back_message(reply, &mut maf);
        let front = action.front.as_ref().map(|t| (t.kind(), t.addr(), t.message.req_size));
        assert_eq!(front, Some((MessageKind::StoreReply, 0x48, 8)));
        assert_eq!(state(&protocol, 0x40), CoherenceState::Modified);
        assert!(protocol.base().requests.is_empty());
        Ok(())
    }

    #[test]
    fn test_invalidate_overtakes_upgrade() -> eyre::Result<()> {
        let mut protocol = mesi()?;
        let mut maf = Maf::new(4);
        fill(&mut protocol, 0x40, CoherenceState::Shared);

        let (outcome, action) = request(&mut protocol, &mut maf, message(MessageKind::UpgradeReq, 0x40));
        assert_eq!(outcome, Some(Outcome::Miss));
        assert_eq!(action.back.as_ref().map(Transport::kind), Some(MessageKind::UpgradeReq));
        let base = protocol.base();
        assert!(base.array.state(&base.lookup(0x40)).protected);
        assert_eq!(base.stats.upgrades, 1);

        // the invalidate converts the upgrade and is sent to both sides
        let action = protocol.handle_back_message(message(MessageKind::Invalidate, 0x40), &mut maf);
        assert_eq!(action.kind, ActionKind::Send);
        assert!(action.front_to_d && action.front_to_i);
        assert_eq!(action.front.as_ref().map(Transport::kind), Some(MessageKind::Invalidate));
        let entry = maf.waiting_entry(0x40).map(|e| e.message().kind);
        assert_eq!(entry, Some(MessageKind::WriteReq));
        let base = protocol.base();
        assert!(!base.array.state(&base.lookup(0x40)).protected);

        // the reply is sent once both sides answered
        let d_ack = message(MessageKind::InvalidateAck, 0x40);
        let action = protocol.handle_snoop_message(d_ack);
        assert_eq!(action.kind, ActionKind::NoAction);
        let mut i_ack = message(MessageKind::InvalidateAck, 0x40);
        i_ack.message.dstream = false;
        let action = protocol.handle_snoop_message(i_ack);
        assert_eq!(action.kind, ActionKind::Send);
        assert!(action.wake_snoops);
        assert_eq!(action.back.as_ref().map(Transport::kind), Some(MessageKind::InvalidateAck));
        assert_eq!(state(&protocol, 0x40), CoherenceState::Invalid);
        assert!(protocol.base().snoop_buffer.is_empty());

        // the converted write completes with data
        let action = protocol.handle_back_message(message(MessageKind::MissReplyWritable, 0x40), &mut maf);
        assert_eq!(action.kind, ActionKind::ReplyAndRemoveResponseMaf);
        assert_eq!(
            action.front.as_ref().map(Transport::kind),
            Some(MessageKind::MissReplyWritable)
        );
        assert_eq!(state(&protocol, 0x40), CoherenceState::Exclusive);
        let base = protocol.base();
        assert!(!base.array.state(&base.lookup(0x40)).protected);
        Ok(())
    }

    #[test]
    #[should_panic(expected = "while in Exclusive")]
    fn test_invalidate_of_exclusive_block_is_fatal() {
        let mut protocol = mesi().unwrap();
        let mut maf = Maf::new(4);
        fill(&mut protocol, 0x40, CoherenceState::Exclusive);
        protocol.handle_back_message(message(MessageKind::Invalidate, 0x40), &mut maf);
    }

    #[test]
    #[should_panic(expected = "while in Modified")]
    fn test_moesi_invalidate_of_modified_block_is_fatal() {
        let mut protocol =
            protocol(ProtocolKind::InclusiveMoesi, Options::default(), CacheLevel::L2).unwrap();
        let mut maf = Maf::new(4);
        fill(&mut protocol, 0x40, CoherenceState::Modified);
        protocol.handle_back_message(message(MessageKind::Invalidate, 0x40), &mut maf);
    }

    #[test]
    #[should_panic(expected = "while waiting for ReadReq")]
    fn test_invalidate_during_read_miss_is_fatal() {
        let mut protocol = mesi().unwrap();
        let mut maf = Maf::new(4);
        fill(&mut protocol, 0x40, CoherenceState::Shared);
        maf.alloc(0x40, message(MessageKind::ReadReq, 0x40), WaitState::WaitResponse);
        protocol.handle_back_message(message(MessageKind::Invalidate, 0x40), &mut maf);
    }

    #[test]
    fn test_private_hierarchy_invalidates_exclusive_block() -> eyre::Result<()> {
        let options = Options {
            two_level_private: true,
            evict_acks_required: false,
            ..Options::default()
        };
        let mut protocol = protocol(ProtocolKind::InclusiveMesi, options, CacheLevel::L2)?;
        let mut maf = Maf::new(4);
        fill(&mut protocol, 0x40, CoherenceState::Exclusive);
        let action = protocol.handle_back_message(message(MessageKind::Invalidate, 0x40), &mut maf);
        assert_eq!(action.kind, ActionKind::Send);
        assert_eq!(action.front.as_ref().map(Transport::kind), Some(MessageKind::Invalidate));
        assert!(action.front_to_d && action.front_to_i);
        assert_eq!(protocol.base().snoop_buffer.len(), 1);
        Ok(())
    }

    #[test]
    fn test_upgrade_waits_for_acknowledgements() -> eyre::Result<()> {
        let mut protocol = mesi()?;
        let mut maf = Maf::new(4);
        fill(&mut protocol, 0x40, CoherenceState::Shared);
        request(&mut protocol, &mut maf, message(MessageKind::UpgradeReq, 0x40));
        if let Some(entry) = maf.waiting_entry_mut(0x40) {
            entry.outstanding_msgs = 2;
        }
        let action = protocol.handle_back_message(message(MessageKind::InvalidateAck, 0x40), &mut maf);
        assert_eq!(action.kind, ActionKind::NoAction);
        let action = protocol.handle_back_message(message(MessageKind::UpgradeReply, 0x40), &mut maf);
        assert_eq!(action.kind, ActionKind::ReplyAndRemoveResponseMaf);
        assert_eq!(action.front.as_ref().map(Transport::kind), Some(MessageKind::UpgradeReply));
        assert_eq!(state(&protocol, 0x40), CoherenceState::Exclusive);
        assert_eq!(protocol.base().stats.upgrade_replies, 1);
        Ok(())
    }

    #[test]
    fn test_read_forward_downgrades_exclusive_block() -> eyre::Result<()> {
        let mut protocol = mesi()?;
        let mut maf = Maf::new(4);
        fill(&mut protocol, 0x40, CoherenceState::Exclusive);
        let action = protocol.handle_back_message(message(MessageKind::ReadFwd, 0x40), &mut maf);
        assert_eq!(action.front.as_ref().map(Transport::kind), Some(MessageKind::Downgrade));
        assert!(action.front_to_d && !action.front_to_i);

        // a second forward waits behind the first
        let action = protocol.handle_back_message(message(MessageKind::ReadFwd, 0x40), &mut maf);
        assert_eq!(action.kind, ActionKind::NoAction);
        assert_eq!(protocol.base().snoop_buffer.len(), 2);

        let action = protocol.handle_snoop_message(message(MessageKind::DownUpdateAck, 0x40));
        assert_eq!(action.back.as_ref().map(Transport::kind), Some(MessageKind::FwdReplyOwned));
        assert_eq!(action.requires_data, 1);
        assert_eq!(state(&protocol, 0x40), CoherenceState::Shared);
        assert!(protocol.has_waking_snoops());
        let woken = protocol.waking_snoop_transport();
        assert_eq!(woken.as_ref().map(Transport::kind), Some(MessageKind::ReadFwd));
        assert!(protocol.base().snoop_buffer.is_empty());
        Ok(())
    }

    #[test]
    fn test_eviction_waits_for_ack() -> eyre::Result<()> {
        let mut protocol = mesi()?;
        let mut maf = Maf::new(4);
        protocol.base_mut().evict_block(0x40, CoherenceState::Modified, false, true);
        assert!(protocol.evictable_block_exists(0));

        let action = protocol.do_eviction();
        let back = action.back.as_ref().map(|t| (t.kind(), t.message.evict_has_data));
        assert_eq!(back, Some((MessageKind::EvictDirty, true)));
        assert_eq!(protocol.base().pending_evicts, 1);
        assert!(!protocol.evictable_block_exists(0));

        // requests for the block wait for the eviction to finish
        let (outcome, action) = request(&mut protocol, &mut maf, message(MessageKind::ReadReq, 0x40));
        assert_eq!(outcome, None);
        assert_eq!(action.kind, ActionKind::InsertMafWaitEvict);

        let action = protocol.handle_back_message(message(MessageKind::EvictAck, 0x40), &mut maf);
        assert!(action.wake_evicts);
        assert_eq!(protocol.base().pending_evicts, 0);
        assert!(protocol.base().evict_buffer.is_empty());
        assert_eq!(protocol.base().stats.evicts_dirty, 1);
        Ok(())
    }

    #[test]
    fn test_eviction_without_acks() -> eyre::Result<()> {
        let options = Options {
            evict_acks_required: false,
            ..Options::default()
        };
        let mut protocol = protocol(ProtocolKind::InclusiveMesi, options, CacheLevel::L2)?;
        protocol.base_mut().evict_block(0x40, CoherenceState::Shared, false, true);
        let action = protocol.do_eviction();
        assert_eq!(action.back.as_ref().map(Transport::kind), Some(MessageKind::EvictClean));
        assert_eq!(protocol.base().pending_evicts, 0);
        assert!(protocol.base().evict_buffer.is_empty());
        assert!(protocol.is_quiesced());
        Ok(())
    }

    #[test]
    fn test_request_reclaims_block_from_evict_buffer() -> eyre::Result<()> {
        let mut protocol = mesi()?;
        let mut maf = Maf::new(4);
        protocol.base_mut().evict_block(0x40, CoherenceState::Modified, false, false);
        let (outcome, action) = request(&mut protocol, &mut maf, message(MessageKind::ReadReq, 0x40));
        assert_eq!(outcome, Some(Outcome::Hit));
        assert_eq!(action.front.as_ref().map(Transport::kind), Some(MessageKind::MissReplyDirty));
        assert_eq!(state(&protocol, 0x40), CoherenceState::Exclusive);
        assert!(protocol.base().evict_buffer.is_empty());
        Ok(())
    }

    #[test]
    fn test_idle_work_invalidates_copies_above() -> eyre::Result<()> {
        let mut protocol = mesi()?;
        // 8 sets of 2 ways, set stride 0x200
        fill(&mut protocol, 0x0, CoherenceState::Modified);
        fill(&mut protocol, 0x200, CoherenceState::Shared);
        fill(&mut protocol, 0x400, CoherenceState::Shared);
        assert!(protocol.idle_work_available(false));
        let work = protocol.idle_work_message();
        assert_eq!(work.as_ref().map(Transport::kind), Some(MessageKind::EvictDirty));

        let action = protocol.handle_idle_work(work);
        assert_eq!(action.front.as_ref().map(Transport::kind), Some(MessageKind::Invalidate));
        // a modified block is not cached in the data cache above
        assert!(!action.front_to_d && action.front_to_i);
        assert!(!protocol.evictable_block_exists(0));

        let mut ack = message(MessageKind::InvalidateAck, 0x0);
        ack.message.dstream = false;
        let action = protocol.handle_snoop_message(ack);
        assert_eq!(action.kind, ActionKind::NoAction);
        assert!(protocol.evictable_block_exists(0));
        let action = protocol.do_eviction();
        assert_eq!(action.back.as_ref().map(Transport::kind), Some(MessageKind::EvictDirty));
        Ok(())
    }

    #[test]
    fn test_fetch_probes_exclusive_block() -> eyre::Result<()> {
        let mut protocol = mesi()?;
        let mut maf = Maf::new(4);
        fill(&mut protocol, 0x40, CoherenceState::Exclusive);
        let mut fetch = message(MessageKind::FetchReq, 0x40);
        let (outcome, action) = protocol.do_request(&mut fetch, false);
        assert_eq!(outcome, None);
        assert_eq!(action.kind, ActionKind::InsertMafWaitProbe);
        assert_eq!(action.front.as_ref().map(Transport::kind), Some(MessageKind::Probe));
        let id = maf.alloc(0x40, fetch, WaitState::ProbeMiss);

        let Some(entry) = maf.get_mut(id) else {
            eyre::bail!("missing probe entry");
        };
        let action = protocol.handle_iprobe(false, &mut entry.transport);
        assert_eq!(action.kind, ActionKind::ReplyAndRemoveMaf);
        assert!(action.front_to_i && !action.front_to_d);
        assert_eq!(action.front.as_ref().map(Transport::kind), Some(MessageKind::FetchReply));
        let base = protocol.base();
        assert!(!base.array.state(&base.lookup(0x40)).protected);
        assert_eq!(base.stats.count(RequestClass::Fetch, Outcome::Hit), 1);
        Ok(())
    }

    #[test]
    fn test_redundant_prefetch() -> eyre::Result<()> {
        let mut protocol = mesi()?;
        let mut prefetch = message(MessageKind::PrefetchReadNoAllocReq, 0x40);
        let action = protocol.handle_request(&mut prefetch, true);
        assert_eq!(action.kind, ActionKind::Send);
        assert_eq!(
            action.back.as_ref().map(Transport::kind),
            Some(MessageKind::PrefetchReadRedundant)
        );
        assert_eq!(protocol.base().stats.prefetch_redundant, 1);
        Ok(())
    }

    #[test]
    fn test_tagless_configuration() -> eyre::Result<()> {
        let config = config::Cache {
            cores: 2,
            ..config::Cache::default()
        };
        assert!(Inclusive::new(ProtocolKind::TaglessMoesi, Options::default(), &config).is_err());
        let config = config::Cache {
            level: CacheLevel::L1,
            ..config::Cache::default()
        };
        assert!(Inclusive::new(ProtocolKind::TaglessMoesi, Options::default(), &config).is_err());

        let options = Options {
            evict_acks_required: false,
            ..Options::default()
        };
        let protocol = Inclusive::new(ProtocolKind::TaglessMoesi, options, &config::Cache::default())?;
        assert!(matches!(protocol.flavor(), Flavor::Tagless(_)));
        assert!(protocol.options().evict_acks_required);
        Ok(())
    }

    fn tagless() -> eyre::Result<Inclusive> {
        crate::testing::init_logging();
        let config = config::Cache {
            array: "STD:size=1024:assoc=2:repl=lru".to_string(),
            directory: Some(config::Hasher {
                functions: vec!["simple".to_string()],
                initial_shift: 6,
                buckets_per_hash: 64,
                partitioned: false,
            }),
            ..config::Cache::default()
        };
        Ok(Inclusive::new(ProtocolKind::TaglessMoesi, Options::default(), &config)?)
    }

    #[test]
    fn test_tagless_drops_clean_eviction_sharing_buckets() -> eyre::Result<()> {
        let mut protocol = tagless()?;
        // same set and bucket as 0x40
        fill(&mut protocol, 0x1040, CoherenceState::Shared);
        protocol.base_mut().evict_block(0x40, CoherenceState::Shared, true, true);
        let action = protocol.do_eviction();
        assert_eq!(action.kind, ActionKind::NoAction);
        assert_eq!(protocol.base().stats.evicts_dropped, 1);
        assert_eq!(protocol.base().pending_evicts, 0);
        assert!(protocol.base().evict_buffer.is_empty());

        protocol.base_mut().evict_block(0x80, CoherenceState::Shared, true, true);
        let action = protocol.do_eviction();
        let hint = action.back.as_ref().and_then(|t| t.hint.clone());
        let buckets = hint.and_then(|hint| hint.conflict_free.get(&0).cloned());
        diff::assert_eq!(buckets, Some(BTreeSet::from([2])));
        assert_eq!(protocol.base().pending_evicts, 1);
        Ok(())
    }

    #[test]
    fn test_tagless_invalidates_exclusive_block() -> eyre::Result<()> {
        let mut protocol = tagless()?;
        let mut maf = Maf::new(4);
        fill(&mut protocol, 0x40, CoherenceState::Exclusive);
        let action = protocol.handle_back_message(message(MessageKind::Invalidate, 0x40), &mut maf);
        assert_eq!(action.kind, ActionKind::Send);
        assert_eq!(action.front.as_ref().map(Transport::kind), Some(MessageKind::Invalidate));
        assert!(action.front_to_d && action.front_to_i);
        Ok(())
    }

    #[test]
    #[should_panic(expected = "while in Exclusive and waiting for WriteReq")]
    fn test_tagless_invalidate_of_exclusive_block_with_open_miss_is_fatal() {
        let mut protocol = tagless().unwrap();
        let mut maf = Maf::new(4);
        fill(&mut protocol, 0x40, CoherenceState::Exclusive);
        maf.alloc(0x40, message(MessageKind::WriteReq, 0x40), WaitState::WaitResponse);
        protocol.handle_back_message(message(MessageKind::Invalidate, 0x40), &mut maf);
    }

    #[test]
    fn test_tagless_retries_write_without_data() -> eyre::Result<()> {
        let mut protocol = tagless()?;
        let mut maf = Maf::new(4);
        request(&mut protocol, &mut maf, message(MessageKind::WriteReq, 0x40));
        let notify = Message::new(MessageKind::MissNotify, 0x40).with_outstanding_msgs(0);
        let action = protocol.handle_back_message(notify.into(), &mut maf);
        assert_eq!(action.kind, ActionKind::Send);
        assert_eq!(action.back.as_ref().map(Transport::kind), Some(MessageKind::WriteRetry));
        assert_eq!(protocol.base().stats.write_retries, 1);
        assert_eq!(maf.waiting_entry(0x40).map(|e| e.outstanding_msgs), Some(1));

        let reply = Message::new(MessageKind::MissReplyWritable, 0x40).with_ack_required(true);
        let action = protocol.handle_back_message(reply.into(), &mut maf);
        assert_eq!(action.kind, ActionKind::ReplyAndRemoveResponseMaf);
        let ack = action.back.as_ref().map(|t| (t.kind(), t.hint.is_some()));
        assert_eq!(ack, Some((MessageKind::WriteAck, true)));
        assert_eq!(state(&protocol, 0x40), CoherenceState::Exclusive);
        Ok(())
    }

    #[test]
    fn test_moesi_keeps_ownership_on_read_forward() -> eyre::Result<()> {
        let mut protocol = protocol(ProtocolKind::InclusiveMoesi, Options::default(), CacheLevel::L2)?;
        let mut maf = Maf::new(4);
        request(&mut protocol, &mut maf, message(MessageKind::ReadReq, 0x40));
        let action = protocol.handle_back_message(message(MessageKind::FwdReplyOwned, 0x40), &mut maf);
        assert_eq!(action.front.as_ref().map(Transport::kind), Some(MessageKind::MissReply));
        assert_eq!(state(&protocol, 0x40), CoherenceState::Owned);

        // an owned block is evicted with its data
        fill(&mut protocol, 0x240, CoherenceState::Shared);
        fill(&mut protocol, 0x440, CoherenceState::Shared);
        let entry = protocol.base().evict_buffer.find(0x40).map(|e| e.kind);
        assert_eq!(entry, Some(MessageKind::EvictDirty));
        Ok(())
    }
}
