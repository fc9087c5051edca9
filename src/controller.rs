use crate::action::{Action, ActionKind};
use crate::array::CheckpointError;
use crate::fifo::MessageQueue;
use crate::maf::{EntryId, Maf, WaitState};
use crate::message::{Message, Tracker, Transport};
use crate::pipeline::Pipeline;
use crate::process::{Grant, ProcessEntry, ProcessKind, Resource};
use crate::protocol::{self, Protocol};
use crate::stats::Stats;
use crate::{address, config, SimContext};
use console::style;
use std::collections::VecDeque;

/// Address bits below the bank index.
pub const BANK_SHIFT: u32 = 6;

/// Bank serving an address.
#[must_use]
pub fn bank_index(addr: address, banks: usize) -> usize {
    ((addr >> BANK_SHIFT) % banks as u64) as usize
}

/// Input channels from the cores above.
#[derive(
    Debug, strum::EnumIter, strum::Display, strum::IntoStaticStr, Clone, Copy, PartialEq, Eq, Hash,
)]
pub enum FrontChannel {
    Snoop,
    Request,
    Prefetch,
}

/// Output channels towards the next level.
#[derive(
    Debug, strum::EnumIter, strum::Display, strum::IntoStaticStr, Clone, Copy, PartialEq, Eq, Hash,
)]
pub enum BackChannel {
    Request,
    Prefetch,
    Snoop,
    Reply,
}

impl BackChannel {
    /// The reservation that covers a slot of this channel.
    #[must_use]
    pub fn resource(self) -> Resource {
        match self {
            Self::Request => Resource::BackSideOutRequest,
            Self::Prefetch => Resource::BackSideOutPrefetch,
            Self::Snoop => Resource::BackSideOutSnoop,
            Self::Reply => Resource::BackSideOutReply,
        }
    }

    #[must_use]
    pub fn of(resource: Resource) -> Option<Self> {
        match resource {
            Resource::BackSideOutRequest => Some(Self::Request),
            Resource::BackSideOutPrefetch => Some(Self::Prefetch),
            Resource::BackSideOutSnoop => Some(Self::Snoop),
            Resource::BackSideOutReply => Some(Self::Reply),
            _ => None,
        }
    }
}

/// Per-bank queues, pipelines and wake lists.
#[derive(Debug)]
struct Bank {
    maf_pipe: Pipeline<ProcessEntry>,
    tag_pipe: Pipeline<ProcessEntry>,
    data_pipe: Pipeline<ProcessEntry>,
    /// Blocked MAF entries to retry, with the transaction that woke them.
    wake_maf: VecDeque<(address, Option<Tracker>)>,
    iprobes: VecDeque<EntryId>,
    snoop_in: MessageQueue<Transport>,
    request_in: MessageQueue<Transport>,
    prefetch_in: MessageQueue<Transport>,
    back_request_in: MessageQueue<Transport>,
    back_reply_in: MessageQueue<Transport>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BankQueue {
    Snoop,
    Request,
    Prefetch,
    BackRequest,
    BackReply,
}

impl Bank {
    fn new(name: &str, config: &config::Cache) -> Self {
        let size = config.queue_size;
        Self {
            maf_pipe: Pipeline::new(format!("{name}-MafServer"), config.ports, 1, 0),
            tag_pipe: Pipeline::new(
                format!("{name}-TagServer"),
                config.ports,
                config.tag_issue_latency,
                config.tag_latency,
            ),
            data_pipe: Pipeline::new(
                format!("{name}-DataServer"),
                config.ports,
                config.data_issue_latency,
                config.data_latency,
            ),
            wake_maf: VecDeque::new(),
            iprobes: VecDeque::new(),
            snoop_in: MessageQueue::new(size),
            request_in: MessageQueue::new(size),
            prefetch_in: MessageQueue::new(size),
            back_request_in: MessageQueue::new(size),
            back_reply_in: MessageQueue::new(size),
        }
    }

    fn queue_mut(&mut self, which: BankQueue) -> &mut MessageQueue<Transport> {
        match which {
            BankQueue::Snoop => &mut self.snoop_in,
            BankQueue::Request => &mut self.request_in,
            BankQueue::Prefetch => &mut self.prefetch_in,
            BankQueue::BackRequest => &mut self.back_request_in,
            BankQueue::BackReply => &mut self.back_reply_in,
        }
    }

    /// A snoop that arrived no later than the head of `queue` must go first.
    fn older_snoop_waiting(&self, queue: &MessageQueue<Transport>) -> bool {
        match (self.snoop_in.head_timestamp(), queue.head_timestamp()) {
            (Some(snoop), Some(head)) => snoop <= head,
            _ => false,
        }
    }

    fn is_empty(&self) -> bool {
        self.maf_pipe.is_empty()
            && self.tag_pipe.is_empty()
            && self.data_pipe.is_empty()
            && self.wake_maf.is_empty()
            && self.iprobes.is_empty()
            && self.snoop_in.is_empty()
            && self.request_in.is_empty()
            && self.prefetch_in.is_empty()
            && self.back_request_in.is_empty()
            && self.back_reply_in.is_empty()
    }
}

/// Move messages from per-source input queues into the queues of their bank.
///
/// Sources are visited round-robin starting at `last_queue`, repeatedly,
/// until no message moves. A message whose bank queue is full blocks its
/// source.
fn distribute(
    sources: &mut [MessageQueue<Transport>],
    banks: &mut [Bank],
    which: BankQueue,
    last_queue: &mut usize,
    cycle: u64,
) {
    let num_sources = sources.len();
    let num_banks = banks.len();
    let mut sent = true;
    while sent {
        sent = false;
        for offset in 0..num_sources {
            let i = (*last_queue + offset) % num_sources;
            let Some(addr) = sources[i].peek().map(Transport::addr) else {
                continue;
            };
            let bank = bank_index(addr, num_banks);
            let target = banks[bank].queue_mut(which);
            if target.full() {
                log::trace!("bank[{bank}] conflict for {which:?} queue {i}");
                continue;
            }
            if let Some(transport) = sources[i].dequeue() {
                log::trace!("scheduling {} to bank {}", transport, bank);
                target.enqueue(transport, cycle);
                sent = true;
            }
        }
    }
    *last_queue = (*last_queue + num_sources - 1) % num_sources;
}

/// A banked cache controller.
///
/// Admits work into per-bank MAF, tag and data pipelines under explicit
/// resource reservations, and leaves every coherence decision to its
/// [`Protocol`].
#[derive(Debug)]
pub struct CacheController {
    pub name: String,
    cores: usize,
    ports: usize,
    block_size: u64,
    evict_on_snoop: bool,
    use_reply_channel: bool,
    trace_address: Option<address>,

    protocol: Box<dyn Protocol>,
    maf: Maf,
    banks: Vec<Bank>,

    front_snoop_in: Vec<MessageQueue<Transport>>,
    front_request_in: Vec<MessageQueue<Transport>>,
    front_prefetch_in: Vec<MessageQueue<Transport>>,
    back_reply_in: MessageQueue<Transport>,
    back_request_in: MessageQueue<Transport>,

    front_out_d: Vec<MessageQueue<Transport>>,
    front_out_i: Vec<MessageQueue<Transport>>,
    back_out_request: MessageQueue<Transport>,
    back_out_prefetch: MessageQueue<Transport>,
    back_out_snoop: MessageQueue<Transport>,
    back_out_reply: MessageQueue<Transport>,

    /// Front side out slots held by processes, shared by all cores.
    front_side_out_reserve: usize,
    scheduled_evicts: usize,

    last_snoop_queue: usize,
    last_request_queue: usize,
    last_prefetch_queue: usize,
    last_scheduled_bank: usize,
    last_tag_pipeline: usize,
    last_data_pipeline: usize,
}

impl CacheController {
    pub fn new(config: &config::Cache) -> Result<Self, config::Error> {
        config.validate()?;
        let protocol = protocol::build(config)?;
        Ok(Self::with_protocol(config, protocol))
    }

    /// A controller running the given protocol instance.
    #[must_use]
    pub fn with_protocol(config: &config::Cache, protocol: Box<dyn Protocol>) -> Self {
        let queues = |count: usize, size: usize| -> Vec<MessageQueue<Transport>> {
            (0..count).map(|_| MessageQueue::new(size)).collect()
        };
        let block_mask = !(config.block_size - 1);
        Self {
            name: config.name.clone(),
            cores: config.cores,
            ports: config.ports,
            block_size: config.block_size,
            evict_on_snoop: config.evict_on_snoop,
            use_reply_channel: config.use_reply_channel,
            trace_address: config.trace_address.map(|addr| addr & block_mask),
            protocol,
            maf: Maf::new(config.maf_size),
            banks: (0..config.banks)
                .map(|_| Bank::new(&config.name, config))
                .collect(),
            front_snoop_in: queues(config.cores, config.prequeue_size),
            front_request_in: queues(config.cores, config.prequeue_size),
            front_prefetch_in: queues(config.cores, config.prequeue_size),
            back_reply_in: MessageQueue::new(config.queue_size),
            back_request_in: MessageQueue::new(config.queue_size),
            front_out_d: queues(config.cores, config.queue_size),
            front_out_i: queues(config.cores, config.queue_size),
            back_out_request: MessageQueue::new(config.queue_size),
            back_out_prefetch: MessageQueue::new(config.queue_size),
            back_out_snoop: MessageQueue::new(config.queue_size + 1),
            back_out_reply: MessageQueue::new(config.queue_size + 1),
            front_side_out_reserve: 0,
            scheduled_evicts: 0,
            last_snoop_queue: 0,
            last_request_queue: 0,
            last_prefetch_queue: 0,
            last_scheduled_bank: 0,
            last_tag_pipeline: 0,
            last_data_pipeline: 0,
        }
    }

    #[must_use]
    pub fn protocol(&self) -> &dyn Protocol {
        self.protocol.as_ref()
    }

    #[must_use]
    pub fn maf(&self) -> &Maf {
        &self.maf
    }

    /// Requests the miss address file holds for the block of `addr`.
    #[must_use]
    pub fn all_messages(&self, addr: address) -> Vec<&Message> {
        self.maf.all_messages(self.block(addr))
    }

    /// Requests for the block of `addr` that have not completed yet.
    #[must_use]
    pub fn all_uncompleted_messages(&self, addr: address) -> Vec<&Message> {
        self.maf.all_uncompleted_messages(self.block(addr))
    }

    #[must_use]
    pub fn cores(&self) -> usize {
        self.cores
    }

    #[must_use]
    pub fn banks(&self) -> usize {
        self.banks.len()
    }

    #[must_use]
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    #[must_use]
    pub fn scheduled_evicts(&self) -> usize {
        self.scheduled_evicts
    }

    /// Another eviction may be scheduled only while the scheduled ones and
    /// the free evict buffer slots fit in the ports.
    #[must_use]
    pub fn forced_eviction_allowed(&self) -> bool {
        self.protocol.free_evict_buffer() + self.scheduled_evicts <= self.ports
    }

    #[must_use]
    pub fn front_side_out_reserve(&self) -> usize {
        self.front_side_out_reserve
    }

    #[must_use]
    pub fn stats(&self) -> Stats {
        let mut stats = self.protocol.stats();
        stats.peak_maf_misses = self.maf.stats.peak_misses;
        stats.peak_maf_entries = self.maf.stats.peak_entries;
        stats
    }

    pub fn save_state(&self) -> Result<String, CheckpointError> {
        self.protocol.save_state()
    }

    pub fn load_state(&mut self, checkpoint: &str) -> Result<(), CheckpointError> {
        self.protocol.load_state(checkpoint)
    }

    fn level(&self, addr: Option<address>) -> log::Level {
        match (self.trace_address, addr) {
            (Some(traced), Some(addr)) if traced == addr => log::Level::Debug,
            _ => log::Level::Trace,
        }
    }

    fn bank_of(&self, addr: address) -> usize {
        bank_index(addr, self.banks.len())
    }

    fn block(&self, addr: address) -> address {
        self.protocol.block_address(addr)
    }

    // host interface

    fn front_in_mut(&mut self, channel: FrontChannel) -> &mut Vec<MessageQueue<Transport>> {
        match channel {
            FrontChannel::Snoop => &mut self.front_snoop_in,
            FrontChannel::Request => &mut self.front_request_in,
            FrontChannel::Prefetch => &mut self.front_prefetch_in,
        }
    }

    #[must_use]
    pub fn front_side_in_full(&self, channel: FrontChannel, core: usize) -> bool {
        let queues = match channel {
            FrontChannel::Snoop => &self.front_snoop_in,
            FrontChannel::Request => &self.front_request_in,
            FrontChannel::Prefetch => &self.front_prefetch_in,
        };
        queues[core].full()
    }

    /// Accept a message from core `core`, handing it back if the queue is full.
    pub fn push_front(
        &mut self,
        channel: FrontChannel,
        core: usize,
        transport: Transport,
        cycle: u64,
    ) -> Result<(), Transport> {
        assert!(core < self.cores, "{}: no core {}", self.name, core);
        let queue = &mut self.front_in_mut(channel)[core];
        if queue.full() {
            return Err(transport);
        }
        queue.enqueue(transport, cycle);
        Ok(())
    }

    pub fn push_front_request(
        &mut self,
        core: usize,
        transport: Transport,
        cycle: u64,
    ) -> Result<(), Transport> {
        self.push_front(FrontChannel::Request, core, transport, cycle)
    }

    pub fn push_front_prefetch(
        &mut self,
        core: usize,
        transport: Transport,
        cycle: u64,
    ) -> Result<(), Transport> {
        self.push_front(FrontChannel::Prefetch, core, transport, cycle)
    }

    pub fn push_front_snoop(
        &mut self,
        core: usize,
        transport: Transport,
        cycle: u64,
    ) -> Result<(), Transport> {
        self.push_front(FrontChannel::Snoop, core, transport, cycle)
    }

    /// Reply from the level below to one of our requests.
    pub fn push_back_reply(&mut self, transport: Transport, cycle: u64) -> Result<(), Transport> {
        if self.back_reply_in.full() {
            return Err(transport);
        }
        self.back_reply_in.enqueue(transport, cycle);
        Ok(())
    }

    /// Request from the level below, such as a forwarded snoop.
    pub fn push_back_request(&mut self, transport: Transport, cycle: u64) -> Result<(), Transport> {
        if self.back_request_in.full() {
            return Err(transport);
        }
        self.back_request_in.enqueue(transport, cycle);
        Ok(())
    }

    pub fn pop_front_d(&mut self, core: usize) -> Option<Transport> {
        self.front_out_d[core].dequeue()
    }

    pub fn pop_front_i(&mut self, core: usize) -> Option<Transport> {
        self.front_out_i[core].dequeue()
    }

    pub fn pop_back(&mut self, channel: BackChannel) -> Option<Transport> {
        self.back_out_mut(channel).dequeue()
    }

    fn back_out_mut(&mut self, channel: BackChannel) -> &mut MessageQueue<Transport> {
        match channel {
            BackChannel::Request => &mut self.back_out_request,
            BackChannel::Prefetch => &mut self.back_out_prefetch,
            BackChannel::Snoop => &mut self.back_out_snoop,
            BackChannel::Reply => &mut self.back_out_reply,
        }
    }

    fn back_out(&self, channel: BackChannel) -> &MessageQueue<Transport> {
        match channel {
            BackChannel::Request => &self.back_out_request,
            BackChannel::Prefetch => &self.back_out_prefetch,
            BackChannel::Snoop => &self.back_out_snoop,
            BackChannel::Reply => &self.back_out_reply,
        }
    }

    /// Any per-core front side output queue could overflow with the
    /// outstanding reservations.
    #[must_use]
    pub fn is_front_side_out_full(&self) -> bool {
        self.front_out_d
            .iter()
            .chain(self.front_out_i.iter())
            .any(|queue| queue.full_with(self.front_side_out_reserve))
    }

    #[must_use]
    pub fn is_quiesced(&self) -> bool {
        let empty = |queues: &[MessageQueue<Transport>]| queues.iter().all(MessageQueue::is_empty);
        self.maf.is_empty()
            && self.banks.iter().all(Bank::is_empty)
            && empty(&self.front_snoop_in)
            && empty(&self.front_request_in)
            && empty(&self.front_prefetch_in)
            && self.back_reply_in.is_empty()
            && self.back_request_in.is_empty()
            && empty(&self.front_out_d)
            && empty(&self.front_out_i)
            && self.back_out_request.is_empty()
            && self.back_out_prefetch.is_empty()
            && self.back_out_snoop.is_empty()
            && self.back_out_reply.is_empty()
            && self.protocol.is_quiesced()
    }

    // reservations

    /// Channel that snoop replies leave on.
    fn snoop_channel(&self) -> BackChannel {
        if self.use_reply_channel {
            BackChannel::Reply
        } else {
            BackChannel::Snoop
        }
    }

    fn evict_channel(&self) -> BackChannel {
        if self.evict_on_snoop {
            BackChannel::Snoop
        } else {
            BackChannel::Request
        }
    }

    /// Back side channel a process of `kind` sends on.
    fn channel_of(&self, kind: ProcessKind) -> BackChannel {
        match kind {
            ProcessKind::Prefetch => BackChannel::Prefetch,
            ProcessKind::Snoop
            | ProcessKind::WakeSnoop
            | ProcessKind::BackRequest
            | ProcessKind::BackReply => self.snoop_channel(),
            ProcessKind::Eviction => self.evict_channel(),
            ProcessKind::Request | ProcessKind::IProbe | ProcessKind::MAFWakeup => {
                BackChannel::Request
            }
            ProcessKind::NoMoreWork | ProcessKind::IdleWork => {
                panic!("{}: {kind} processes have no back side channel", self.name)
            }
        }
    }

    fn reserve(&mut self, process: &mut ProcessEntry, resource: Resource) {
        match resource {
            Resource::FrontSideOut => self.front_side_out_reserve += 1,
            Resource::EvictBuffer => self.protocol.reserve_evict_buffer(),
            Resource::ScheduledEvict => self.scheduled_evicts += 1,
            Resource::Maf => self.maf.reserve(),
            Resource::SnoopBuffer => self.protocol.reserve_snoop_buffer(),
            Resource::BackSideOutRequest
            | Resource::BackSideOutSnoop
            | Resource::BackSideOutPrefetch
            | Resource::BackSideOutReply => {
                if let Some(channel) = BackChannel::of(resource) {
                    self.back_out_mut(channel).reserve();
                }
            }
        }
        process.reservations.hold(Grant::new(resource));
    }

    fn release_grant(&mut self, grant: Grant) {
        let resource = grant.release();
        match resource {
            Resource::FrontSideOut => {
                assert!(
                    self.front_side_out_reserve > 0,
                    "{}: front side out released more often than reserved",
                    self.name
                );
                self.front_side_out_reserve -= 1;
            }
            Resource::EvictBuffer => self.protocol.unreserve_evict_buffer(),
            Resource::ScheduledEvict => self.scheduled_evicts -= 1,
            Resource::Maf => self.maf.unreserve(),
            Resource::SnoopBuffer => self.protocol.unreserve_snoop_buffer(),
            Resource::BackSideOutRequest
            | Resource::BackSideOutSnoop
            | Resource::BackSideOutPrefetch
            | Resource::BackSideOutReply => {
                if let Some(channel) = BackChannel::of(resource) {
                    self.back_out_mut(channel).unreserve();
                }
            }
        }
    }

    /// Release a resource the process must be holding.
    fn release(&mut self, process: &mut ProcessEntry, resource: Resource) {
        let Some(grant) = process.reservations.take(resource) else {
            panic!(
                "{}: {} releases {} without holding it (holds {:#x})",
                self.name,
                process,
                resource,
                process.reservations.mask()
            );
        };
        self.release_grant(grant);
    }

    fn release_channel(&mut self, process: &mut ProcessEntry) {
        let channel = self.channel_of(process.kind);
        self.release(process, channel.resource());
    }

    fn finish(&self, process: ProcessEntry) {
        if let Err(leaked) = process.finish() {
            panic!("{}: {}", self.name, leaked);
        }
    }

    fn enqueue_wake(&mut self, addr: address, tracker: Option<Tracker>) {
        log::log!(self.level(Some(addr)), "{}: wake MAF {:#x}", self.name, addr);
        let bank = self.bank_of(addr);
        self.banks[bank].wake_maf.push_back((addr, tracker));
    }

    // cycle

    /// Run one cycle of the controller.
    pub fn process_messages(&mut self, ctx: &mut SimContext) {
        let cycle = ctx.cycle;
        let mut single = 0;
        distribute(
            std::slice::from_mut(&mut self.back_reply_in),
            &mut self.banks,
            BankQueue::BackReply,
            &mut single,
            cycle,
        );
        distribute(
            std::slice::from_mut(&mut self.back_request_in),
            &mut self.banks,
            BankQueue::BackRequest,
            &mut single,
            cycle,
        );
        distribute(
            &mut self.front_snoop_in,
            &mut self.banks,
            BankQueue::Snoop,
            &mut self.last_snoop_queue,
            cycle,
        );
        distribute(
            &mut self.front_request_in,
            &mut self.banks,
            BankQueue::Request,
            &mut self.last_request_queue,
            cycle,
        );
        distribute(
            &mut self.front_prefetch_in,
            &mut self.banks,
            BankQueue::Prefetch,
            &mut self.last_prefetch_queue,
            cycle,
        );

        self.schedule_new_processes(ctx);

        for bank in 0..self.banks.len() {
            while self.banks[bank].maf_pipe.ready(cycle)
                && self.banks[bank].tag_pipe.server_avail(cycle)
            {
                let Some(process) = self.banks[bank].maf_pipe.dequeue() else {
                    break;
                };
                self.run_process(process, bank, cycle);
            }
        }

        self.advance_pipelines(cycle);
    }

    fn run_process(&mut self, process: ProcessEntry, bank: usize, now: u64) {
        log::log!(
            self.level(process.addr().map(|addr| self.block(addr))),
            "{}: run {}",
            self.name,
            process
        );
        match process.kind {
            ProcessKind::Request | ProcessKind::Prefetch => self.run_request(process, bank, now),
            ProcessKind::Snoop => self.run_snoop(process, bank, now),
            ProcessKind::BackRequest | ProcessKind::BackReply => self.run_back(process, bank, now),
            ProcessKind::MAFWakeup => self.run_wake_maf(process, bank, now),
            ProcessKind::IProbe => self.run_iprobe(process, bank, now),
            ProcessKind::Eviction => self.run_evict(process, now),
            ProcessKind::IdleWork => self.run_idle_work(process, bank, now),
            ProcessKind::WakeSnoop => self.run_wake_snoop(process, bank, now),
            ProcessKind::NoMoreWork => panic!("{}: {} in the MAF pipeline", self.name, process),
        }
    }

    fn schedule_new_processes(&mut self, ctx: &mut SimContext) {
        let num_banks = self.banks.len();
        for offset in 0..num_banks {
            let bank = (self.last_scheduled_bank + offset) % num_banks;
            self.schedule_wakeups(bank, ctx);
            self.schedule_iprobes(bank, ctx);
            self.schedule_waking_snoops(bank, ctx);
            self.schedule_evictions(bank, ctx);
            self.schedule_back_replies(bank, ctx);
            self.schedule_back_requests(bank, ctx);
            self.schedule_requests(bank, ctx);
            self.schedule_prefetches(bank, ctx);
            self.schedule_snoops(bank, ctx);
            self.schedule_idle_work(bank, ctx);
        }
        self.last_scheduled_bank = (self.last_scheduled_bank + num_banks - 1) % num_banks;
    }

    fn maf_server_avail(&self, bank: usize, now: u64) -> bool {
        self.banks[bank].maf_pipe.server_avail(now)
    }

    fn admit(&mut self, mut process: ProcessEntry, bank: usize, resources: &[Resource], now: u64) {
        for resource in resources {
            self.reserve(&mut process, *resource);
        }
        log::log!(
            self.level(process.addr().map(|addr| self.block(addr))),
            "{}: schedule {} in bank {}",
            self.name,
            process,
            bank
        );
        self.banks[bank].maf_pipe.enqueue(process, now, 1);
    }

    /// Woken MAF entries reserve what a request does, except the MAF slot.
    fn schedule_wakeups(&mut self, bank: usize, ctx: &mut SimContext) {
        let now = ctx.cycle;
        while self.maf_server_avail(bank, now) {
            let Some(&(addr, _)) = self.banks[bank].wake_maf.front() else {
                break;
            };
            if self.back_out_request.full()
                || self.is_front_side_out_full()
                || self.protocol.full_evict_buffer()
                || !self.protocol.can_start_request(addr)
            {
                log::trace!(
                    "{}: wakeup of {:#x} stalled (bso request full={}, fso full={}, eb full={})",
                    self.name,
                    addr,
                    self.back_out_request.full(),
                    self.is_front_side_out_full(),
                    self.protocol.full_evict_buffer()
                );
                break;
            }
            if self.maf.contains_state(addr, WaitState::Waking) {
                // one retry per block at a time
                break;
            }
            let Some((addr, tracker)) = self.banks[bank].wake_maf.pop_front() else {
                break;
            };
            let Some(id) = self.maf.blocked_entry(addr) else {
                log::trace!("{}: woke {:#x} without a blocked MAF entry", self.name, addr);
                continue;
            };
            let Some(entry) = self.maf.get(id) else {
                continue;
            };
            let transport = entry.transport.clone();
            if entry.state != WaitState::Waking {
                self.maf.set_state(id, WaitState::Waking);
            }
            let process = ProcessEntry::waking(
                ProcessKind::MAFWakeup,
                id,
                transport,
                tracker,
                ctx.next_serial(),
            );
            self.admit(
                process,
                bank,
                &[
                    Resource::FrontSideOut,
                    Resource::BackSideOutRequest,
                    Resource::EvictBuffer,
                ],
                now,
            );
            self.protocol.add_pending_request(addr);
        }
    }

    fn schedule_iprobes(&mut self, bank: usize, ctx: &mut SimContext) {
        let now = ctx.cycle;
        while self.maf_server_avail(bank, now)
            && !self.banks[bank].iprobes.is_empty()
            && !self.back_out_request.full()
            && !self.is_front_side_out_full()
        {
            let Some(id) = self.banks[bank].iprobes.pop_front() else {
                break;
            };
            let Some(entry) = self.maf.get(id) else {
                panic!("{}: probed MAF entry {} disappeared", self.name, id);
            };
            let transport = entry.transport.clone();
            let tracker = Some(transport.tracker.clone());
            let process =
                ProcessEntry::waking(ProcessKind::IProbe, id, transport, tracker, ctx.next_serial());
            self.admit(
                process,
                bank,
                &[Resource::FrontSideOut, Resource::BackSideOutRequest],
                now,
            );
        }
    }

    fn schedule_waking_snoops(&mut self, bank: usize, ctx: &mut SimContext) {
        let now = ctx.cycle;
        let channel = self.snoop_channel();
        while self.maf_server_avail(bank, now)
            && self.protocol.has_waking_snoops()
            && !self.is_front_side_out_full()
            && !self.back_out(channel).full()
        {
            let Some(transport) = self.protocol.waking_snoop_transport() else {
                break;
            };
            let process = ProcessEntry::new(ProcessKind::WakeSnoop, Some(transport), ctx.next_serial());
            self.admit(
                process,
                bank,
                &[
                    Resource::FrontSideOut,
                    channel.resource(),
                    Resource::SnoopBuffer,
                ],
                now,
            );
        }
    }

    /// Forced evictions keep the evict buffer from filling up with
    /// reservations.
    fn schedule_evictions(&mut self, bank: usize, ctx: &mut SimContext) {
        let now = ctx.cycle;
        let channel = self.evict_channel();
        while self.maf_server_avail(bank, now)
            && self.protocol.evictable_block_exists(self.scheduled_evicts)
            && self.forced_eviction_allowed()
            && !self.back_out(channel).full()
        {
            let process = ProcessEntry::new(ProcessKind::Eviction, None, ctx.next_serial());
            self.admit(
                process,
                bank,
                &[channel.resource(), Resource::ScheduledEvict],
                now,
            );
        }
    }

    fn schedule_back_replies(&mut self, bank: usize, ctx: &mut SimContext) {
        let now = ctx.cycle;
        let channel = self.snoop_channel();
        while self.maf_server_avail(bank, now)
            && !self.banks[bank].back_reply_in.is_empty()
            && !self.is_front_side_out_full()
            && !self.back_out(channel).full()
        {
            let Some(transport) = self.banks[bank].back_reply_in.dequeue() else {
                break;
            };
            let process = ProcessEntry::new(ProcessKind::BackReply, Some(transport), ctx.next_serial());
            self.admit(
                process,
                bank,
                &[Resource::FrontSideOut, channel.resource()],
                now,
            );
        }
    }

    fn schedule_back_requests(&mut self, bank: usize, ctx: &mut SimContext) {
        let now = ctx.cycle;
        let channel = self.snoop_channel();
        while self.maf_server_avail(bank, now)
            && !self.banks[bank].back_request_in.is_empty()
            && !self.is_front_side_out_full()
            && !self.back_out(channel).full()
            && !self.protocol.full_snoop_buffer()
        {
            let Some(transport) = self.banks[bank].back_request_in.dequeue() else {
                break;
            };
            let process =
                ProcessEntry::new(ProcessKind::BackRequest, Some(transport), ctx.next_serial());
            self.admit(
                process,
                bank,
                &[
                    Resource::FrontSideOut,
                    Resource::SnoopBuffer,
                    channel.resource(),
                ],
                now,
            );
        }
    }

    /// Requests go only once every older snoop of the bank was admitted.
    fn schedule_requests(&mut self, bank: usize, ctx: &mut SimContext) {
        let now = ctx.cycle;
        loop {
            let Some(addr) = self.banks[bank].request_in.peek().map(Transport::addr) else {
                break;
            };
            let admissible = self.maf_server_avail(bank, now)
                && !self.back_out_request.full()
                && !self.is_front_side_out_full()
                && !self.maf.full()
                && !self.protocol.full_evict_buffer()
                && self.protocol.can_start_request(addr)
                && !self.banks[bank].older_snoop_waiting(&self.banks[bank].request_in);
            if !admissible {
                log::trace!(
                    "{}: request {:#x} stalled (maf full={}, eb full={}, fso full={})",
                    self.name,
                    addr,
                    self.maf.full(),
                    self.protocol.full_evict_buffer(),
                    self.is_front_side_out_full()
                );
                break;
            }
            let Some(transport) = self.banks[bank].request_in.dequeue() else {
                break;
            };
            let process = ProcessEntry::new(ProcessKind::Request, Some(transport), ctx.next_serial());
            self.admit(
                process,
                bank,
                &[
                    Resource::BackSideOutRequest,
                    Resource::FrontSideOut,
                    Resource::EvictBuffer,
                    Resource::Maf,
                ],
                now,
            );
            self.protocol.add_pending_request(addr);
        }
    }

    fn schedule_prefetches(&mut self, bank: usize, ctx: &mut SimContext) {
        let now = ctx.cycle;
        while self.maf_server_avail(bank, now)
            && !self.banks[bank].prefetch_in.is_empty()
            && !self.back_out_prefetch.full()
            && !self.is_front_side_out_full()
            && !self.maf.full()
            && !self.protocol.full_evict_buffer()
            && !self.banks[bank].older_snoop_waiting(&self.banks[bank].prefetch_in)
        {
            let Some(transport) = self.banks[bank].prefetch_in.dequeue() else {
                break;
            };
            let process =
                ProcessEntry::new(ProcessKind::Prefetch, Some(transport), ctx.next_serial());
            self.admit(
                process,
                bank,
                &[
                    Resource::BackSideOutPrefetch,
                    Resource::FrontSideOut,
                    Resource::EvictBuffer,
                    Resource::Maf,
                ],
                now,
            );
        }
    }

    fn schedule_snoops(&mut self, bank: usize, ctx: &mut SimContext) {
        let now = ctx.cycle;
        let channel = self.snoop_channel();
        loop {
            let available = match self.banks[bank].snoop_in.peek() {
                Some(transport) => self.protocol.snoop_resources_available(transport),
                None => break,
            };
            if !self.maf_server_avail(bank, now) || self.back_out(channel).full() || !available {
                break;
            }
            let Some(transport) = self.banks[bank].snoop_in.dequeue() else {
                break;
            };
            self.protocol.reserve_snoop_resources(&transport);
            let process = ProcessEntry::new(ProcessKind::Snoop, Some(transport), ctx.next_serial());
            self.admit(process, bank, &[channel.resource()], now);
        }
    }

    fn schedule_idle_work(&mut self, bank: usize, ctx: &mut SimContext) {
        let now = ctx.cycle;
        while self.maf_server_avail(bank, now)
            && self
                .protocol
                .idle_work_available(self.is_front_side_out_full())
        {
            let mut process = ProcessEntry::new(ProcessKind::IdleWork, None, ctx.next_serial());
            self.reserve(&mut process, Resource::SnoopBuffer);
            self.reserve(&mut process, Resource::FrontSideOut);
            process.transport = self.protocol.idle_work_message();
            self.admit(process, bank, &[], now);
        }
    }

    // process handlers

    fn consume(process: &mut ProcessEntry, action: &Action) {
        process.requires_data = action.requires_data;
        process.requires_tag = action.requires_tag;
    }

    fn take_front(&self, process: &mut ProcessEntry, action: &mut Action) {
        let Some(front) = action.front.take() else {
            panic!(
                "{}: {} for {} sends nothing to the front",
                self.name, action, process
            );
        };
        process.set_front(front, action.front_to_d, action.front_to_i);
    }

    fn take_back(&self, process: &mut ProcessEntry, action: &mut Action) {
        let Some(back) = action.back.take() else {
            panic!(
                "{}: {} for {} sends nothing to the back",
                self.name, action, process
            );
        };
        process.back = Some(back);
    }

    fn enqueue_tag(&mut self, process: ProcessEntry, bank: usize, now: u64) {
        if process.requires_tag == 0 {
            self.transmit(process, now);
            return;
        }
        let repeat = process.requires_tag;
        self.banks[bank].tag_pipe.enqueue(process, now, repeat);
    }

    fn run_request(&mut self, mut process: ProcessEntry, bank: usize, now: u64) {
        let Some(mut transport) = process.transport.take() else {
            panic!("{}: {} without a message", self.name, process);
        };
        let block = self.block(transport.addr());
        if process.kind == ProcessKind::Request {
            self.protocol.remove_pending_request(transport.addr());
        }
        let has_maf = self.maf.contains(block);
        let mut action = self.protocol.handle_request(&mut transport, has_maf);
        log::log!(
            self.level(Some(block)),
            "{}: {} -> {}",
            self.name,
            transport,
            action
        );
        Self::consume(&mut process, &action);

        if let Some(state) = action.kind.blocked_state() {
            self.release(&mut process, Resource::Maf);
            self.release(&mut process, Resource::FrontSideOut);
            self.release_channel(&mut process);
            self.release(&mut process, Resource::EvictBuffer);
            self.maf.alloc(block, transport, state);
            self.finish(process);
            return;
        }

        match action.kind {
            ActionKind::Send => {
                self.release(&mut process, Resource::Maf);
                self.release(&mut process, Resource::EvictBuffer);
                self.release(&mut process, Resource::FrontSideOut);
                self.take_back(&mut process, &mut action);
                process.transport = Some(transport);
                self.enqueue_tag(process, bank, now);
            }
            ActionKind::InsertMafWaitResponse => {
                self.release(&mut process, Resource::Maf);
                self.release(&mut process, Resource::FrontSideOut);
                self.take_back(&mut process, &mut action);
                let id = self
                    .maf
                    .alloc(block, transport.clone(), WaitState::WaitResponse);
                process.maf_entry = Some(id);
                process.transport = Some(transport);
                self.enqueue_tag(process, bank, now);
            }
            ActionKind::InsertMafWaitProbe => {
                self.release(&mut process, Resource::Maf);
                self.release_channel(&mut process);
                self.release(&mut process, Resource::EvictBuffer);
                self.take_front(&mut process, &mut action);
                let id = self
                    .maf
                    .alloc(block, transport.clone(), WaitState::WaitProbe);
                process.maf_entry = Some(id);
                process.transport = Some(transport);
                self.enqueue_tag(process, bank, now);
            }
            ActionKind::ReplyAndRemoveMaf => {
                self.take_front(&mut process, &mut action);
                self.release(&mut process, Resource::Maf);
                self.release_channel(&mut process);
                self.release(&mut process, Resource::EvictBuffer);
                process.transport = Some(transport);
                self.enqueue_tag(process, bank, now);
            }
            other => panic!(
                "{}: unexpected {} for request {}",
                self.name, other, transport
            ),
        }
    }

    fn run_wake_maf(&mut self, mut process: ProcessEntry, bank: usize, now: u64) {
        let Some(id) = process.maf_entry else {
            panic!("{}: {} without a MAF entry", self.name, process);
        };
        self.protocol.remove_pending_request(id.addr);
        let tracker = process.waking_tracker.clone();
        let Some(entry) = self.maf.get_mut(id) else {
            panic!("{}: woken MAF entry {} disappeared", self.name, id);
        };
        let mut action = self.protocol.wake_maf(&mut entry.transport, tracker.as_ref());
        let transport = entry.transport.clone();
        log::log!(
            self.level(Some(id.addr)),
            "{}: woken {} -> {}",
            self.name,
            transport,
            action
        );
        Self::consume(&mut process, &action);
        process.transport = Some(transport);

        if let Some(state) = action.kind.blocked_state() {
            self.release(&mut process, Resource::FrontSideOut);
            self.release_channel(&mut process);
            self.release(&mut process, Resource::EvictBuffer);
            self.maf.set_state(id, state);
            self.finish(process);
            return;
        }

        match action.kind {
            ActionKind::InsertMafWaitResponse => {
                self.release(&mut process, Resource::FrontSideOut);
                self.take_back(&mut process, &mut action);
                self.maf.set_state(id, WaitState::WaitResponse);
                self.enqueue_tag(process, bank, now);
            }
            ActionKind::InsertMafWaitProbe => {
                self.release_channel(&mut process);
                self.release(&mut process, Resource::EvictBuffer);
                self.maf.set_state(id, WaitState::WaitProbe);
                self.take_front(&mut process, &mut action);
                self.enqueue_tag(process, bank, now);
            }
            ActionKind::ReplyAndRemoveMaf => {
                process.remove_maf_entry = true;
                self.maf.set_state(id, WaitState::Completed);
                self.take_front(&mut process, &mut action);
                self.release_channel(&mut process);
                self.release(&mut process, Resource::EvictBuffer);
                self.enqueue_tag(process, bank, now);
            }
            ActionKind::Send => {
                self.release(&mut process, Resource::EvictBuffer);
                self.release(&mut process, Resource::FrontSideOut);
                self.take_back(&mut process, &mut action);
                process.remove_maf_entry = true;
                self.maf.set_state(id, WaitState::Completed);
                self.enqueue_tag(process, bank, now);
            }
            other => panic!("{}: unexpected {} for woken MAF entry {}", self.name, other, id),
        }
    }

    fn run_snoop(&mut self, mut process: ProcessEntry, bank: usize, now: u64) {
        let Some(transport) = process.transport.clone() else {
            panic!("{}: {} without a message", self.name, process);
        };
        let block = self.block(transport.addr());

        if transport.kind().is_probe() {
            if let Some(id) = self.maf.probing_entry(block) {
                let state = match transport.kind() {
                    crate::MessageKind::ProbedNotPresent => WaitState::ProbeMiss,
                    _ => WaitState::ProbeHit,
                };
                self.maf.set_state(id, state);
                self.release_channel(&mut process);
                self.protocol.unreserve_snoop_resources(&transport);
                let probe_bank = self.bank_of(block);
                self.banks[probe_bank].iprobes.push_back(id);
                self.finish(process);
                return;
            }
        }

        let mut action = self.protocol.handle_snoop_message(transport);
        Self::consume(&mut process, &action);
        process.wake_after_snoop = action.wake_snoops;
        process.wake_after_evict = action.wake_evicts;
        match action.kind {
            ActionKind::NoAction => {
                self.release_channel(&mut process);
                process.kind = ProcessKind::NoMoreWork;
                self.enqueue_tag(process, bank, now);
            }
            ActionKind::Send => {
                self.take_back(&mut process, &mut action);
                self.enqueue_tag(process, bank, now);
            }
            other => panic!("{}: unexpected {} for snoop {}", self.name, other, process),
        }
    }

    /// Give back the evict buffer slot a request reserved for its fill.
    fn release_entry_grant(&mut self, id: EntryId) {
        let grant = self.maf.get_mut(id).and_then(|entry| entry.evict_grant.take());
        match grant {
            Some(grant) => self.release_grant(grant),
            None => log::warn!(
                "{}: MAF entry {} left its response wait without an evict buffer reservation",
                self.name,
                id
            ),
        }
    }

    fn waiting_entry(&self, block: address) -> EntryId {
        match self.maf.waiting_entry(block) {
            Some(entry) => entry.id(),
            None => panic!("{}: no outstanding miss for {:#x}", self.name, block),
        }
    }

    fn run_back(&mut self, mut process: ProcessEntry, bank: usize, now: u64) {
        let Some(transport) = process.transport.clone() else {
            panic!("{}: {} without a message", self.name, process);
        };
        let block = self.block(transport.addr());
        let mut action = self.protocol.handle_back_message(transport, &mut self.maf);
        log::log!(
            self.level(Some(block)),
            "{}: {} -> {}",
            self.name,
            process,
            action
        );
        Self::consume(&mut process, &action);
        if process.kind == ProcessKind::BackRequest {
            self.release(&mut process, Resource::SnoopBuffer);
        }

        match action.kind {
            ActionKind::Send => {
                if action.front.is_some() {
                    self.take_front(&mut process, &mut action);
                    if action.back.is_some() {
                        self.take_back(&mut process, &mut action);
                    } else {
                        self.release_channel(&mut process);
                    }
                } else {
                    self.take_back(&mut process, &mut action);
                    self.release(&mut process, Resource::FrontSideOut);
                }
                process.wake_region = action.wake_region;
                self.enqueue_tag(process, bank, now);
            }
            ActionKind::ReplyAndRemoveResponseMaf => {
                let id = self.waiting_entry(block);
                self.release_entry_grant(id);
                self.maf.set_state(id, WaitState::Completed);
                process.maf_entry = Some(id);
                process.remove_maf_entry = true;
                self.take_front(&mut process, &mut action);
                if action.back.is_some() {
                    self.take_back(&mut process, &mut action);
                } else {
                    self.release_channel(&mut process);
                }
                process.transport = self.maf.get(id).map(|entry| entry.transport.clone());
                process.wake_region = action.wake_region;
                self.enqueue_tag(process, bank, now);
            }
            ActionKind::ReplyAndRetryMaf => {
                let id = self.waiting_entry(block);
                self.release_entry_grant(id);
                self.maf.set_state(id, WaitState::WaitAddress);
                process.maf_entry = Some(id);
                process.wake_maf = true;
                self.release(&mut process, Resource::FrontSideOut);
                self.take_back(&mut process, &mut action);
                process.transport = self.maf.get(id).map(|entry| entry.transport.clone());
                process.wake_region = action.wake_region;
                self.enqueue_tag(process, bank, now);
            }
            ActionKind::RetryRequest => {
                let id = self.waiting_entry(block);
                self.release_channel(&mut process);
                self.release(&mut process, Resource::FrontSideOut);
                self.release_entry_grant(id);
                self.maf.set_state(id, WaitState::WaitAddress);
                let tracker = process.transport.as_ref().map(|t| t.tracker.clone());
                self.finish(process);
                self.enqueue_wake(block, tracker);
            }
            ActionKind::NoAction => {
                self.release_channel(&mut process);
                self.release(&mut process, Resource::FrontSideOut);
                process.wake_after_evict = action.wake_evicts;
                process.kind = ProcessKind::NoMoreWork;
                if process.wake_after_evict {
                    self.transmit(process, now);
                } else {
                    self.enqueue_tag(process, bank, now);
                }
            }
            other => panic!("{}: unexpected {} for {}", self.name, other, process),
        }
    }

    fn run_iprobe(&mut self, mut process: ProcessEntry, bank: usize, now: u64) {
        let Some(id) = process.maf_entry else {
            panic!("{}: {} without a MAF entry", self.name, process);
        };
        let Some(entry) = self.maf.get_mut(id) else {
            panic!("{}: probed MAF entry {} disappeared", self.name, id);
        };
        let hit = entry.state == WaitState::ProbeHit;
        let mut action = self.protocol.handle_iprobe(hit, &mut entry.transport);
        Self::consume(&mut process, &action);
        match action.kind {
            ActionKind::InsertMafWaitSnoop => {
                self.release(&mut process, Resource::FrontSideOut);
                self.release(&mut process, Resource::BackSideOutRequest);
                self.maf.set_state(id, WaitState::WaitSnoop);
                self.finish(process);
            }
            ActionKind::ReplyAndRemoveMaf => {
                process.remove_maf_entry = true;
                self.maf.set_state(id, WaitState::Completed);
                self.take_front(&mut process, &mut action);
                self.release(&mut process, Resource::BackSideOutRequest);
                self.enqueue_tag(process, bank, now);
            }
            other => panic!("{}: unexpected {} for probe of {}", self.name, other, id),
        }
    }

    /// Evictions use no tag or data access of their own.
    fn run_evict(&mut self, mut process: ProcessEntry, now: u64) {
        let action = self.protocol.do_eviction();
        let channel = self.evict_channel();
        self.release(&mut process, channel.resource());
        self.release(&mut process, Resource::ScheduledEvict);
        self.finish(process);
        if action.is(ActionKind::NoAction) {
            // the block was reclaimed by a request in the meantime
            return;
        }
        let Some(mut back) = action.back else {
            panic!("{}: eviction without a message", self.name);
        };
        back.tracker.set_delay_cause(&self.name, "Back Tx");
        log::log!(
            self.level(Some(back.addr())),
            "{}: evict {}",
            self.name,
            back
        );
        self.back_out_mut(channel).enqueue(back, now);
    }

    fn run_idle_work(&mut self, mut process: ProcessEntry, bank: usize, now: u64) {
        if let Some(transport) = process.transport.as_mut() {
            let mut tracker = Tracker::new(transport.addr());
            tracker.initiator = Some(self.protocol.base().node);
            tracker.source = Some(format!("{} IdleWork", self.name));
            tracker.set_delay_cause(&self.name, "IdleWork");
            transport.tracker = tracker;
        }
        let mut action = self.protocol.handle_idle_work(process.transport.clone());
        Self::consume(&mut process, &action);
        if !action.remember_snoop_transport {
            process.transport = None;
        }
        self.release(&mut process, Resource::SnoopBuffer);

        match action.kind {
            ActionKind::NoAction => {
                self.release(&mut process, Resource::FrontSideOut);
                if process.requires_tag > 0 {
                    self.enqueue_tag(process, bank, now);
                } else {
                    self.finish(process);
                }
            }
            ActionKind::Send => {
                if action.front.is_some() {
                    self.take_front(&mut process, &mut action);
                } else {
                    self.release(&mut process, Resource::FrontSideOut);
                }
                if let Some(back) = action.back.take() {
                    panic!("{}: idle work cannot send {} to the back", self.name, back);
                }
                self.enqueue_tag(process, bank, now);
            }
            other => panic!("{}: unexpected {} for idle work", self.name, other),
        }
    }

    fn run_wake_snoop(&mut self, mut process: ProcessEntry, bank: usize, now: u64) {
        let Some(transport) = process.transport.clone() else {
            panic!("{}: {} without a message", self.name, process);
        };
        let mut action = self.protocol.handle_wake_snoop(transport, &mut self.maf);
        Self::consume(&mut process, &action);
        self.release(&mut process, Resource::SnoopBuffer);

        match action.kind {
            ActionKind::NoAction => {
                self.release(&mut process, Resource::FrontSideOut);
                self.release_channel(&mut process);
                if process.requires_tag > 0 {
                    self.enqueue_tag(process, bank, now);
                } else {
                    self.finish(process);
                }
            }
            ActionKind::Send => {
                if action.front.is_some() {
                    self.take_front(&mut process, &mut action);
                } else {
                    self.release(&mut process, Resource::FrontSideOut);
                }
                if action.back.is_some() {
                    self.take_back(&mut process, &mut action);
                } else {
                    self.release_channel(&mut process);
                }
                self.enqueue_tag(process, bank, now);
            }
            other => panic!("{}: unexpected {} for woken snoop", self.name, other),
        }
    }

    // pipelines

    fn advance_pipelines(&mut self, now: u64) {
        let num_banks = self.banks.len();

        let start = self.last_tag_pipeline;
        self.last_tag_pipeline = (start + 1) % num_banks;
        for offset in 0..num_banks {
            let bank = (start + offset) % num_banks;
            while self.banks[bank].tag_pipe.ready(now) {
                let requires_data = self.banks[bank]
                    .tag_pipe
                    .peek()
                    .map_or(0, |process| process.requires_data);
                if requires_data > 0 {
                    if !self.banks[bank].data_pipe.server_avail(now) {
                        self.banks[bank].tag_pipe.stall();
                        break;
                    }
                    let Some(mut process) = self.banks[bank].tag_pipe.dequeue() else {
                        break;
                    };
                    if process.transmit_after_tag {
                        self.send_messages(&mut process, now);
                    }
                    self.banks[bank].data_pipe.enqueue(process, now, requires_data);
                } else {
                    let Some(process) = self.banks[bank].tag_pipe.dequeue() else {
                        break;
                    };
                    self.transmit(process, now);
                }
            }
        }

        let start = self.last_data_pipeline;
        self.last_data_pipeline = (start + 1) % num_banks;
        for offset in 0..num_banks {
            let bank = (start + offset) % num_banks;
            while self.banks[bank].data_pipe.ready(now) {
                let Some(process) = self.banks[bank].data_pipe.dequeue() else {
                    break;
                };
                self.transmit(process, now);
            }
        }
    }

    fn send_front(&mut self, mut transport: Transport, to_d: bool, to_i: bool, now: u64) {
        let core = transport.message.core;
        assert!(
            core < self.cores,
            "{}: front message {} for core {} of {}",
            self.name,
            transport,
            core,
            self.cores
        );
        transport.tracker.set_delay_cause(&self.name, "Front Tx");
        log::log!(
            self.level(Some(self.block(transport.addr()))),
            "{}: send front (D={}, I={}) {}",
            self.name,
            to_d,
            to_i,
            transport
        );
        if to_i {
            let mut i_transport = transport.clone();
            i_transport.message.dstream = false;
            self.front_out_i[core].enqueue(i_transport, now);
        }
        if to_d {
            self.front_out_d[core].enqueue(transport, now);
        }
    }

    /// Hand the messages of a process to their output queues.
    fn send_messages(&mut self, process: &mut ProcessEntry, now: u64) {
        if let Some(mut back) = process.back.take() {
            let channel = self.channel_of(process.kind);
            self.release(process, channel.resource());
            back.tracker.set_delay_cause(&self.name, "Back Tx");
            log::log!(
                self.level(Some(self.block(back.addr()))),
                "{}: send back ({}) {}",
                self.name,
                channel,
                back
            );
            self.back_out_mut(channel).enqueue(back, now);
        }
        if let Some(front) = process.front.take() {
            self.release(process, Resource::FrontSideOut);
            self.send_front(front, process.front_to_d, process.front_to_i, now);
        }
    }

    /// Send the messages of a process, close it and wake whatever waited
    /// for it.
    fn transmit(&mut self, mut process: ProcessEntry, now: u64) {
        self.send_messages(&mut process, now);

        if process.kind == ProcessKind::IdleWork {
            self.protocol.complete_idle_work(process.transport.as_ref());
        }

        if matches!(
            process.kind,
            ProcessKind::Request | ProcessKind::Prefetch | ProcessKind::MAFWakeup
        ) {
            if let Some(grant) = process.reservations.take(Resource::EvictBuffer) {
                // the slot stays reserved until the response arrives
                let entry = process
                    .maf_entry
                    .and_then(|id| self.maf.get_mut(id))
                    .filter(|entry| entry.state == WaitState::WaitResponse);
                match entry {
                    Some(entry) => entry.evict_grant = Some(grant),
                    None => self.release_grant(grant),
                }
            }
        }

        let addr = process.addr().map(|addr| self.block(addr));
        let tracker = process.transport.as_ref().map(|t| t.tracker.clone());
        let maf_entry = process.maf_entry;
        let remove_maf_entry = process.remove_maf_entry;
        let wake_maf = process.wake_maf;
        let wake_after_snoop = process.wake_after_snoop;
        let wake_after_evict = process.wake_after_evict;
        let wake_region = process.wake_region;
        self.finish(process);

        let Some(addr) = addr else {
            return;
        };

        if wake_region {
            for block in self.protocol.region_blocks(addr) {
                if self.maf.contains_state(block, WaitState::WaitRegion) {
                    self.enqueue_wake(block, tracker.clone());
                }
            }
        }

        if remove_maf_entry {
            let Some(id) = maf_entry else {
                panic!("{}: MAF entry removal without an entry", self.name);
            };
            debug_assert_eq!(
                self.maf.get(id).map(|entry| entry.state),
                Some(WaitState::Completed)
            );
            if self.maf.contains_state(addr, WaitState::WaitAddress) {
                self.enqueue_wake(addr, tracker);
            }
            self.maf.remove(id);
        } else if wake_maf {
            if self.maf.contains_state(addr, WaitState::WaitAddress) {
                self.enqueue_wake(addr, tracker);
            }
        } else if wake_after_snoop {
            self.protocol.wake_waiting_snoops(addr);
            if self.maf.contains_state(addr, WaitState::WaitSnoop)
                || (wake_after_evict && self.maf.contains_state(addr, WaitState::WaitEvict))
            {
                self.enqueue_wake(addr, tracker);
            }
        } else if wake_after_evict && self.maf.contains_state(addr, WaitState::WaitEvict) {
            self.enqueue_wake(addr, tracker);
        }
    }
}

impl std::fmt::Display for CacheController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}[{} banks, maf {}/{}, fso reserved {}, scheduled evicts {}]",
            style(&self.name).cyan(),
            self.banks.len(),
            self.maf.len(),
            self.maf.active_entries(),
            self.front_side_out_reserve,
            self.scheduled_evicts
        )
    }
}

#[cfg(test)]
mod tests {
    use super::{bank_index, BackChannel, CacheController, FrontChannel};
    use crate::config;
    use crate::maf::WaitState;
    use crate::message::{Message, MessageKind, Transport};
    use crate::state::CoherenceState;
    use crate::stats::{Outcome, RequestClass};
    use crate::SimContext;
    use color_eyre::eyre;
    use strum::IntoEnumIterator;

    fn controller(config: config::Cache) -> eyre::Result<CacheController> {
        crate::testing::init_logging();
        Ok(CacheController::new(&config)?)
    }

    fn l2() -> config::Cache {
        config::Cache {
            array: "STD:size=1024:assoc=2:repl=lru".to_string(),
            cores: 2,
            ..config::Cache::default()
        }
    }

    fn request(kind: MessageKind, addr: u64, core: usize) -> Transport {
        Message::new(kind, addr).with_core(core).with_req_size(64).into()
    }

    fn reply_to(request: &Transport, kind: MessageKind) -> Transport {
        request.with_message(request.message.derive(kind).with_req_size(64))
    }

    /// Run cycles until `pop` yields a message.
    fn run_until<F>(
        ctrl: &mut CacheController,
        ctx: &mut SimContext,
        max_cycles: u64,
        mut pop: F,
    ) -> eyre::Result<Transport>
    where
        F: FnMut(&mut CacheController) -> Option<Transport>,
    {
        for _ in 0..max_cycles {
            ctrl.process_messages(ctx);
            ctx.tick();
            if let Some(transport) = pop(ctrl) {
                return Ok(transport);
            }
        }
        eyre::bail!("no message after {max_cycles} cycles: {ctrl}")
    }

    fn run(ctrl: &mut CacheController, ctx: &mut SimContext, cycles: u64) {
        for _ in 0..cycles {
            ctrl.process_messages(ctx);
            ctx.tick();
        }
    }

    fn state(ctrl: &CacheController, addr: u64) -> CoherenceState {
        let base = ctrl.protocol().base();
        base.state(&base.lookup(addr))
    }

    #[test]
    fn test_bank_index() {
        assert_eq!(bank_index(0x0, 4), 0);
        assert_eq!(bank_index(0x40, 4), 1);
        assert_eq!(bank_index(0x7f, 4), 1);
        assert_eq!(bank_index(0x100, 4), 0);
        assert_eq!(bank_index(0x1c0, 1), 0);
    }

    #[test]
    fn test_read_miss_then_hit() -> eyre::Result<()> {
        let mut ctrl = controller(l2())?;
        let mut ctx = SimContext::new();

        ctrl.push_front_request(0, request(MessageKind::ReadReq, 0x1000, 0), ctx.cycle)
            .map_err(|t| eyre::eyre!("rejected {t}"))?;
        let miss = run_until(&mut ctrl, &mut ctx, 20, |c| c.pop_back(BackChannel::Request))?;
        assert_eq!(miss.kind(), MessageKind::ReadReq);
        assert_eq!(miss.addr(), 0x1000);
        assert!(ctrl.maf().contains_state(0x1000, WaitState::WaitResponse));
        assert_eq!(ctrl.front_side_out_reserve(), 0);

        let fill = reply_to(&miss, MessageKind::MissReplyWritable);
        ctrl.push_back_reply(fill, ctx.cycle)
            .map_err(|t| eyre::eyre!("rejected {t}"))?;
        let reply = run_until(&mut ctrl, &mut ctx, 20, |c| c.pop_front_d(0))?;
        assert_eq!(reply.kind(), MessageKind::MissReplyWritable);
        assert!(ctrl.maf().is_empty());
        assert_eq!(state(&ctrl, 0x1000), CoherenceState::Exclusive);

        ctrl.push_front_request(1, request(MessageKind::ReadReq, 0x1000, 1), ctx.cycle)
            .map_err(|t| eyre::eyre!("rejected {t}"))?;
        let hit = run_until(&mut ctrl, &mut ctx, 20, |c| c.pop_front_d(1))?;
        assert_eq!(hit.kind(), MessageKind::MissReplyWritable);
        assert_eq!(hit.message.core, 1);
        assert!(ctrl.pop_back(BackChannel::Request).is_none());

        run(&mut ctrl, &mut ctx, 5);
        assert!(ctrl.is_quiesced(), "{ctrl}");
        let stats = ctrl.stats();
        assert_eq!(stats.count(RequestClass::Read, Outcome::Miss), 1);
        assert_eq!(stats.count(RequestClass::Read, Outcome::Hit), 1);
        assert_eq!(stats.peak_maf_misses, 1);
        Ok(())
    }

    #[test]
    fn test_same_block_requests_wait_for_address() -> eyre::Result<()> {
        let mut ctrl = controller(l2())?;
        let mut ctx = SimContext::new();
        ctrl.push_front_request(0, request(MessageKind::ReadReq, 0x2000, 0), ctx.cycle)
            .map_err(|t| eyre::eyre!("rejected {t}"))?;
        ctrl.push_front_request(1, request(MessageKind::WriteReq, 0x2000, 1), ctx.cycle)
            .map_err(|t| eyre::eyre!("rejected {t}"))?;
        let miss = run_until(&mut ctrl, &mut ctx, 20, |c| c.pop_back(BackChannel::Request))?;
        run(&mut ctrl, &mut ctx, 5);
        assert!(ctrl.pop_back(BackChannel::Request).is_none());
        assert!(ctrl.maf().contains_state(0x2000, WaitState::WaitResponse));
        assert!(ctrl.maf().contains_state(0x2000, WaitState::WaitAddress));
        assert_eq!(
            ctrl.maf()
                .iter()
                .filter(|entry| entry.state == WaitState::WaitResponse)
                .count(),
            1
        );
        let queued: Vec<_> = ctrl.all_messages(0x2010).iter().map(|m| m.kind).collect();
        assert_eq!(queued, vec![MessageKind::ReadReq, MessageKind::WriteReq]);
        assert_eq!(ctrl.all_uncompleted_messages(0x2000).len(), 2);

        ctrl.push_back_reply(reply_to(&miss, MessageKind::MissReplyWritable), ctx.cycle)
            .map_err(|t| eyre::eyre!("rejected {t}"))?;
        let read = run_until(&mut ctrl, &mut ctx, 20, |c| c.pop_front_d(0))?;
        assert_eq!(read.kind(), MessageKind::MissReplyWritable);
        // the woken write hits the exclusive block
        let write = run_until(&mut ctrl, &mut ctx, 20, |c| c.pop_front_d(1))?;
        assert_eq!(write.kind(), MessageKind::MissReplyWritable);
        run(&mut ctrl, &mut ctx, 5);
        assert!(ctrl.is_quiesced(), "{ctrl}");
        Ok(())
    }

    #[test]
    fn test_older_snoop_goes_first() -> eyre::Result<()> {
        let mut ctrl = controller(config::Cache {
            ports: 1,
            ..l2()
        })?;
        let mut ctx = SimContext::new();
        // an eviction notice arriving with a request to another block
        let evict = request(MessageKind::EvictClean, 0x3000, 0);
        ctrl.push_front_snoop(0, evict, ctx.cycle)
            .map_err(|t| eyre::eyre!("rejected {t}"))?;
        ctrl.push_front_request(0, request(MessageKind::ReadReq, 0x3000, 0), ctx.cycle)
            .map_err(|t| eyre::eyre!("rejected {t}"))?;

        ctrl.process_messages(&mut ctx);
        ctx.tick();
        // the request shares the snoop's timestamp and has to wait a cycle
        assert!(ctrl.maf().is_empty());
        let miss = run_until(&mut ctrl, &mut ctx, 20, |c| c.pop_back(BackChannel::Request))?;
        assert_eq!(miss.kind(), MessageKind::ReadReq);
        Ok(())
    }

    #[test]
    fn test_forced_evictions_follow_free_ports() -> eyre::Result<()> {
        crate::testing::init_logging();
        let config = config::Cache {
            ports: 2,
            eb_size: 8,
            ..l2()
        };
        let with_evictions = |count: u64| -> eyre::Result<CacheController> {
            let mut protocol = crate::protocol::build(&config)?;
            for i in 0..count {
                let addr = 0x1000 + i * 0x40;
                protocol.base_mut().evict_block(addr, CoherenceState::Modified, false, true);
            }
            Ok(CacheController::with_protocol(&config, protocol))
        };
        let sent = |ctrl: &mut CacheController| {
            BackChannel::iter()
                .map(|channel| std::iter::from_fn(|| ctrl.pop_back(channel)).count())
                .sum::<usize>()
        };
        let mut ctx = SimContext::new();

        // plenty of room left, nothing is pushed out
        let mut ctrl = with_evictions(1)?;
        assert_eq!(ctrl.protocol().free_evict_buffer(), 3);
        assert!(!ctrl.forced_eviction_allowed());
        run(&mut ctrl, &mut ctx, 10);
        assert_eq!(sent(&mut ctrl), 0);
        assert_eq!(ctrl.protocol().base().evict_buffer.len(), 1);

        let mut ctrl = with_evictions(6)?;
        assert_eq!(ctrl.protocol().free_evict_buffer(), 0);
        assert!(ctrl.forced_eviction_allowed());
        let mut evicted = 0;
        for _ in 0..20 {
            run(&mut ctrl, &mut ctx, 1);
            evicted += sent(&mut ctrl);
        }
        assert!(evicted > 0);
        assert_eq!(ctrl.scheduled_evicts(), 0);
        assert!(ctrl.protocol().free_evict_buffer() > config.ports);
        assert!(!ctrl.forced_eviction_allowed());
        assert_eq!(ctrl.protocol().base().evict_buffer.len(), 6 - evicted);
        Ok(())
    }

    #[test]
    fn test_front_side_in_backpressure() -> eyre::Result<()> {
        let mut ctrl = controller(config::Cache {
            prequeue_size: 2,
            ..l2()
        })?;
        for i in 0..2 {
            ctrl.push_front_request(0, request(MessageKind::ReadReq, 0x40 * i, 0), 0)
                .map_err(|t| eyre::eyre!("rejected {t}"))?;
        }
        assert!(ctrl.front_side_in_full(FrontChannel::Request, 0));
        let rejected = ctrl.push_front_request(0, request(MessageKind::ReadReq, 0x80, 0), 0);
        assert_eq!(rejected.map_err(|t| t.addr()), Err(0x80));
        assert!(!ctrl.front_side_in_full(FrontChannel::Request, 1));
        Ok(())
    }

    #[test]
    fn test_eviction_invalidates_cores_above() -> eyre::Result<()> {
        let mut ctrl = controller(config::Cache {
            array: "STD:size=128:assoc=1:repl=lru".to_string(),
            cores: 1,
            eb_size: 5,
            ..config::Cache::default()
        })?;
        let mut ctx = SimContext::new();
        // two sets of one way: 0x0 and 0x80 conflict
        let mut early = Vec::new();
        for addr in [0x0, 0x80] {
            ctrl.push_front_request(0, request(MessageKind::ReadReq, addr, 0), ctx.cycle)
                .map_err(|t| eyre::eyre!("rejected {t}"))?;
            let miss = run_until(&mut ctrl, &mut ctx, 20, |c| c.pop_back(BackChannel::Request))?;
            ctrl.push_back_reply(reply_to(&miss, MessageKind::MissReply), ctx.cycle)
                .map_err(|t| eyre::eyre!("rejected {t}"))?;
            let reply = run_until(&mut ctrl, &mut ctx, 20, |c| {
                while let Some(transport) = c.pop_front_d(0) {
                    if transport.kind() != MessageKind::Invalidate {
                        return Some(transport);
                    }
                    early.push(transport);
                }
                None
            })?;
            assert_eq!(reply.kind(), MessageKind::MissReply);
            assert_eq!(reply.addr(), addr);
        }
        assert_eq!(state(&ctrl, 0x80), CoherenceState::Shared);
        assert_eq!(state(&ctrl, 0x0), CoherenceState::Invalid);

        // the victim is invalidated above on both sides before it leaves
        let inv_i = run_until(&mut ctrl, &mut ctx, 20, |c| c.pop_front_i(0))?;
        assert_eq!(inv_i.kind(), MessageKind::Invalidate);
        assert!(!inv_i.message.dstream);
        let inv_d = early
            .pop()
            .or_else(|| ctrl.pop_front_d(0))
            .ok_or_else(|| eyre::eyre!("no data side invalidate"))?;
        assert_eq!(inv_d.kind(), MessageKind::Invalidate);
        assert_eq!(inv_d.addr(), 0x0);
        for inv in [inv_d, inv_i] {
            let mut ack = inv.message.derive(MessageKind::InvalidateAck);
            ack.dstream = inv.message.dstream;
            ctrl.push_front_snoop(0, inv.with_message(ack), ctx.cycle)
                .map_err(|t| eyre::eyre!("rejected {t}"))?;
        }
        let evict = run_until(&mut ctrl, &mut ctx, 20, |c| c.pop_back(BackChannel::Snoop))?;
        assert_eq!(evict.kind(), MessageKind::EvictClean);
        assert_eq!(evict.addr(), 0x0);
        assert!(!ctrl.is_quiesced());

        let ack = evict.with_message(evict.message.derive(MessageKind::EvictAck));
        ctrl.push_back_reply(ack, ctx.cycle)
            .map_err(|t| eyre::eyre!("rejected {t}"))?;
        run(&mut ctrl, &mut ctx, 10);
        assert!(ctrl.is_quiesced(), "{ctrl}");
        assert_eq!(ctrl.stats().evicts_clean, 1);
        assert_eq!(ctrl.scheduled_evicts(), 0);
        Ok(())
    }

    #[test]
    fn test_fetch_probes_data_side() -> eyre::Result<()> {
        let mut ctrl = controller(config::Cache {
            cores: 1,
            ..l2()
        })?;
        let mut ctx = SimContext::new();
        ctrl.push_front_request(0, request(MessageKind::ReadReq, 0x4000, 0), ctx.cycle)
            .map_err(|t| eyre::eyre!("rejected {t}"))?;
        let miss = run_until(&mut ctrl, &mut ctx, 20, |c| c.pop_back(BackChannel::Request))?;
        ctrl.push_back_reply(reply_to(&miss, MessageKind::MissReplyWritable), ctx.cycle)
            .map_err(|t| eyre::eyre!("rejected {t}"))?;
        run_until(&mut ctrl, &mut ctx, 20, |c| c.pop_front_d(0))?;

        // instruction fetch of a block the data side may have modified
        ctrl.push_front_request(0, request(MessageKind::FetchReq, 0x4000, 0), ctx.cycle)
            .map_err(|t| eyre::eyre!("rejected {t}"))?;
        let probe = run_until(&mut ctrl, &mut ctx, 20, |c| c.pop_front_d(0))?;
        assert_eq!(probe.kind(), MessageKind::Probe);
        assert!(ctrl.maf().contains_state(0x4000, WaitState::WaitProbe));

        let answer = probe.with_message(probe.message.derive(MessageKind::ProbedNotPresent));
        ctrl.push_front_snoop(0, answer, ctx.cycle)
            .map_err(|t| eyre::eyre!("rejected {t}"))?;
        let fetch = run_until(&mut ctrl, &mut ctx, 20, |c| c.pop_front_i(0))?;
        assert_eq!(fetch.kind(), MessageKind::FetchReply);
        assert!(!fetch.message.dstream);
        run(&mut ctrl, &mut ctx, 5);
        assert!(ctrl.is_quiesced(), "{ctrl}");
        assert_eq!(ctrl.stats().iprobes, 1);
        Ok(())
    }

    #[test]
    fn test_channels_map_to_resources() {
        for channel in BackChannel::iter() {
            assert_eq!(BackChannel::of(channel.resource()), Some(channel));
        }
        assert_eq!(BackChannel::of(crate::process::Resource::Maf), None);
    }
}
