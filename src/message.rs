use super::address;
use crate::state::{CacheLevel, FillLevel, FillType, PreviousState};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Memory message kind.
///
/// This is the complete vocabulary exchanged between cache levels, the
/// cores above and the directory or memory below.
#[derive(
    Debug,
    strum::EnumIter,
    strum::EnumString,
    strum::IntoStaticStr,
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
pub enum MessageKind {
    LoadReq,
    StoreReq,
    StorePrefetchReq,
    FetchReq,
    NonAllocatingStoreReq,
    RMWReq,
    CmpxReq,
    AtomicPreloadReq,
    FlushReq,
    ReadReq,
    WriteReq,
    WriteAllocate,
    UpgradeReq,
    UpgradeAllocate,
    Flush,
    EvictDirty,
    EvictWritable,
    EvictClean,
    SVBClean,
    LoadReply,
    StoreReply,
    StorePrefetchReply,
    FetchReply,
    RMWReply,
    CmpxReply,
    AtomicPreloadReply,
    MissReply,
    MissReplyWritable,
    MissReplyDirty,
    UpgradeReply,
    NonAllocatingStoreReply,
    Invalidate,
    Downgrade,
    Probe,
    DownProbe,
    ReturnReq,
    InvalidateAck,
    InvUpdateAck,
    DowngradeAck,
    DownUpdateAck,
    ProbedNotPresent,
    ProbedClean,
    ProbedWritable,
    ProbedDirty,
    DownProbePresent,
    DownProbeNotPresent,
    ReturnReply,
    StreamFetch,
    PrefetchReadNoAllocReq,
    PrefetchReadAllocReq,
    PrefetchInsert,
    PrefetchInsertWritable,
    PrefetchReadReply,
    PrefetchWritableReply,
    PrefetchDirtyReply,
    PrefetchReadRedundant,
    StreamFetchWritableReply,
    StreamFetchRejected,
    ReturnNAck,
    ReturnReplyDirty,
    FetchFwd,
    ReadFwd,
    WriteFwd,
    FwdNAck,
    FwdReply,
    FwdReplyOwned,
    FwdReplyWritable,
    FwdReplyDirty,
    ReadAck,
    ReadAckDirty,
    FetchAck,
    FetchAckDirty,
    WriteAck,
    UpgradeAck,
    NASAck,
    ReadNAck,
    FetchNAck,
    WriteNAck,
    UpgradeNAck,
    NASNAck,
    MissNotify,
    MissNotifyData,
    BackInvalidate,
    InvalidateNAck,
    ProtocolMessage,
    EvictAck,
    WriteRetry,
}

impl MessageKind {
    #[must_use]
    pub fn is_evict(self) -> bool {
        matches!(
            self,
            Self::EvictDirty | Self::EvictWritable | Self::EvictClean | Self::SVBClean
        )
    }

    #[must_use]
    pub fn is_probe(self) -> bool {
        matches!(
            self,
            Self::ProbedNotPresent | Self::ProbedClean | Self::ProbedWritable | Self::ProbedDirty
        )
    }

    #[must_use]
    pub fn is_prefetch(self) -> bool {
        matches!(
            self,
            Self::PrefetchReadNoAllocReq
                | Self::PrefetchReadAllocReq
                | Self::PrefetchInsert
                | Self::PrefetchInsertWritable
        )
    }

    #[must_use]
    pub fn is_write(self) -> bool {
        matches!(
            self,
            Self::StoreReq
                | Self::StorePrefetchReq
                | Self::NonAllocatingStoreReq
                | Self::RMWReq
                | Self::CmpxReq
                | Self::WriteReq
                | Self::WriteAllocate
                | Self::UpgradeReq
                | Self::UpgradeAllocate
        )
    }

    /// Requests travel downward on the request channel.
    #[must_use]
    pub fn is_request(self) -> bool {
        matches!(
            self,
            Self::LoadReq
                | Self::StoreReq
                | Self::StorePrefetchReq
                | Self::FetchReq
                | Self::NonAllocatingStoreReq
                | Self::RMWReq
                | Self::CmpxReq
                | Self::AtomicPreloadReq
                | Self::FlushReq
                | Self::ReadReq
                | Self::WriteReq
                | Self::WriteAllocate
                | Self::UpgradeReq
                | Self::UpgradeAllocate
                | Self::StreamFetch
                | Self::PrefetchReadNoAllocReq
                | Self::PrefetchReadAllocReq
        )
    }

    /// Messages that a higher level sends up to us on its snoop channel.
    #[must_use]
    pub fn uses_snoop_channel(self) -> bool {
        matches!(
            self,
            Self::Flush
                | Self::EvictDirty
                | Self::EvictWritable
                | Self::EvictClean
                | Self::SVBClean
                | Self::InvalidateAck
                | Self::InvUpdateAck
                | Self::DowngradeAck
                | Self::DownUpdateAck
                | Self::ProbedNotPresent
                | Self::ProbedClean
                | Self::ProbedWritable
                | Self::ProbedDirty
                | Self::DownProbePresent
                | Self::DownProbeNotPresent
                | Self::ReturnReply
                | Self::PrefetchInsert
                | Self::PrefetchInsertWritable
                | Self::InvalidateNAck
        )
    }

    /// Snoop acknowledgements that carry modified data back down.
    #[must_use]
    pub fn is_update_ack(self) -> bool {
        matches!(self, Self::InvUpdateAck | Self::DownUpdateAck)
    }
}

/// Memory message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Message {
    pub kind: MessageKind,
    pub addr: address,
    pub pc: address,
    pub core: usize,
    /// Data stream (as opposed to instruction stream).
    pub dstream: bool,
    pub req_size: u32,
    pub evict_has_data: bool,
    pub ack_required: bool,
    pub ack_requires_data: bool,
    /// Number of further acknowledgements announced by the directory,
    /// `-1` if the sender did not say.
    pub outstanding_msgs: i32,
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}({:#x}, core={}{})",
            self.kind,
            self.addr,
            self.core,
            if self.dstream { "" } else { ", I" }
        )
    }
}

impl Message {
    #[must_use]
    pub fn new(kind: MessageKind, addr: address) -> Self {
        Self {
            kind,
            addr,
            pc: 0,
            core: 0,
            dstream: true,
            req_size: 0,
            evict_has_data: false,
            ack_required: false,
            ack_requires_data: false,
            outstanding_msgs: -1,
        }
    }

    #[must_use]
    pub fn with_core(mut self, core: usize) -> Self {
        self.core = core;
        self
    }

    #[must_use]
    pub fn with_req_size(mut self, req_size: u32) -> Self {
        self.req_size = req_size;
        self
    }

    #[must_use]
    pub fn with_ack_required(mut self, ack_required: bool) -> Self {
        self.ack_required = ack_required;
        self
    }

    #[must_use]
    pub fn with_outstanding_msgs(mut self, outstanding_msgs: i32) -> Self {
        self.outstanding_msgs = outstanding_msgs;
        self
    }

    /// A new message of the given kind for the same block, core and pc.
    #[must_use]
    pub fn derive(&self, kind: MessageKind) -> Self {
        Self {
            kind,
            addr: self.addr,
            pc: self.pc,
            core: self.core,
            ..Self::new(kind, self.addr)
        }
    }
}

/// Transaction context that accompanies a message through the hierarchy.
///
/// Records where a transaction was eventually satisfied, which is what the
/// statistics of a full-system run are built from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tracker {
    pub addr: address,
    pub initiator: Option<usize>,
    pub source: Option<String>,
    pub fill_level: Option<FillLevel>,
    pub fill_type: Option<FillType>,
    pub previous_state: Option<PreviousState>,
    pub responder: Option<usize>,
    pub network_traffic_required: Option<bool>,
    pub originator_level: Option<CacheLevel>,
    /// Issued by a prefetcher rather than a core.
    pub from_prefetcher: bool,
    pub is_fetch: bool,
    pub is_os: bool,
    pub delay_cause: Option<(String, String)>,
}

impl Tracker {
    #[must_use]
    pub fn new(addr: address) -> Self {
        Self {
            addr,
            ..Self::default()
        }
    }

    /// Records a local fill unless an earlier level already claimed it.
    pub fn fill_locally(&mut self, node: usize, level: FillLevel) {
        if self.fill_level.is_none() {
            self.network_traffic_required = Some(false);
            self.responder = Some(node);
            self.fill_level = Some(level);
        }
    }

    pub fn set_delay_cause(&mut self, component: &str, cause: &str) {
        self.delay_cause = Some((component.to_string(), cause.to_string()));
    }
}

/// Directory buckets that a node no longer maps to.
///
/// Tagless directories keep approximate sharer sets per hash bucket; a hint
/// lists per node the buckets it can be cleared from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DirectoryHint {
    pub conflict_free: BTreeMap<usize, BTreeSet<u32>>,
}

impl DirectoryHint {
    pub fn add_conflict_free_set(&mut self, node: usize, buckets: BTreeSet<u32>) {
        self.conflict_free.entry(node).or_default().extend(buckets);
    }

    pub fn merge(&mut self, other: &Self) {
        for (node, buckets) in &other.conflict_free {
            self.conflict_free
                .entry(*node)
                .or_default()
                .extend(buckets.iter().copied());
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.conflict_free.values().all(BTreeSet::is_empty)
    }
}

/// A message together with its transaction context.
///
/// A transport has exactly one holder at any time: a process, a MAF entry,
/// a snoop buffer entry or a queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Transport {
    pub message: Message,
    pub tracker: Tracker,
    pub hint: Option<DirectoryHint>,
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.message, f)
    }
}

impl From<Message> for Transport {
    fn from(message: Message) -> Self {
        let tracker = Tracker::new(message.addr);
        Self {
            message,
            tracker,
            hint: None,
        }
    }
}

impl Transport {
    #[must_use]
    pub fn new(message: Message, tracker: Tracker) -> Self {
        Self {
            message,
            tracker,
            hint: None,
        }
    }

    #[must_use]
    pub fn kind(&self) -> MessageKind {
        self.message.kind
    }

    #[must_use]
    pub fn addr(&self) -> address {
        self.message.addr
    }

    /// Same tracker and hint, different message.
    #[must_use]
    pub fn with_message(&self, message: Message) -> Self {
        Self {
            message,
            tracker: self.tracker.clone(),
            hint: self.hint.clone(),
        }
    }
}
