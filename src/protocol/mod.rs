pub mod base;
pub mod hasher;
pub mod inclusive;
mod tagless;

pub use base::Base;
pub use inclusive::{Flavor, Inclusive};

use crate::action::{Action, ActionKind};
use crate::array::CheckpointError;
use crate::evict_buffer::CheckpointEntry;
use crate::maf::Maf;
use crate::message::{MessageKind, Tracker, Transport};
use crate::stats::{Outcome, Stats};
use crate::{address, config};
use serde::{Deserialize, Serialize};

/// Coherence protocol run by a controller.
#[derive(
    Debug,
    strum::EnumString,
    strum::Display,
    strum::EnumIter,
    strum::IntoStaticStr,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
)]
#[strum(ascii_case_insensitive)]
pub enum ProtocolKind {
    #[strum(to_string = "InclusiveMESI")]
    InclusiveMesi,
    #[strum(to_string = "InclusiveMOESI")]
    InclusiveMoesi,
    #[strum(to_string = "TaglessInclusiveMOESI", serialize = "TaglessMOESI")]
    TaglessMoesi,
}

/// Protocol arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    /// Answer forwards and invalidates for absent blocks with a NAck
    /// instead of dropping them.
    pub always_nack: bool,
    /// Move a block to the LRU position after supplying it to a reader.
    pub snoop_lru: bool,
    pub evict_acks_required: bool,
    pub two_level_private: bool,
    pub require_miss_notify: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            always_nack: false,
            snoop_lru: false,
            evict_acks_required: true,
            two_level_private: false,
            require_miss_notify: true,
        }
    }
}

impl Options {
    /// Parse the `key=value` arguments of a protocol.
    pub fn parse(kind: ProtocolKind, args: &[(String, String)]) -> Result<Self, config::Error> {
        let mut options = Self::default();
        for (arg, value) in args {
            let flag = match (kind, arg.to_ascii_lowercase().as_str()) {
                (_, "alwaysnack") => &mut options.always_nack,
                (ProtocolKind::InclusiveMesi | ProtocolKind::InclusiveMoesi, "snoop_lru") => {
                    &mut options.snoop_lru
                }
                (
                    ProtocolKind::InclusiveMesi | ProtocolKind::InclusiveMoesi,
                    "evict_acks_required",
                ) => &mut options.evict_acks_required,
                (ProtocolKind::InclusiveMesi, "two_level_private") => {
                    &mut options.two_level_private
                }
                (ProtocolKind::InclusiveMoesi, "require_miss_notify") => {
                    &mut options.require_miss_notify
                }
                _ => {
                    return Err(config::Error::ProtocolArgument {
                        protocol: kind,
                        arg: arg.clone(),
                        reason: "unknown argument".to_string(),
                    })
                }
            };
            *flag = config::parse_bool(value).ok_or_else(|| config::Error::ProtocolArgument {
                protocol: kind,
                arg: arg.clone(),
                reason: format!("{value:?} is not a boolean"),
            })?;
        }
        if options.two_level_private {
            options.evict_acks_required = false;
        }
        Ok(options)
    }
}

/// Persisted protocol state: the array plus the evict buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub array: String,
    pub evict_buffer: Vec<CheckpointEntry>,
}

/// Protocol decision logic behind a cache controller.
///
/// The controller stays protocol agnostic: it admits work, reserves
/// resources and moves messages, while every coherence decision is made
/// through this interface.
pub trait Protocol: std::fmt::Debug + Send {
    fn kind(&self) -> ProtocolKind;

    fn base(&self) -> &Base;

    fn base_mut(&mut self) -> &mut Base;

    /// Look up a request and decide how to serve it.
    ///
    /// The request is updated in place. Returns the hit or miss outcome,
    /// or `None` if the request was blocked.
    fn do_request(&mut self, transport: &mut Transport, has_maf: bool)
        -> (Option<Outcome>, Action);

    /// Message from the level below: forwarded snoops and replies to our
    /// own misses.
    fn handle_back_message(&mut self, transport: Transport, maf: &mut Maf) -> Action;

    /// Message from the level above on its snoop channel.
    fn handle_snoop_message(&mut self, transport: Transport) -> Action;

    /// Completion of an instruction fetch probe into the data side.
    fn handle_iprobe(&mut self, hit: bool, transport: &mut Transport) -> Action;

    fn handle_idle_work(&mut self, transport: Option<Transport>) -> Action;

    fn handle_wake_snoop(&mut self, transport: Transport, maf: &mut Maf) -> Action;

    fn do_eviction(&mut self) -> Action;

    fn handle_request(&mut self, transport: &mut Transport, has_maf: bool) -> Action {
        self.base_mut().stats.accesses += 1;
        if has_maf
            && matches!(
                transport.kind(),
                MessageKind::PrefetchReadNoAllocReq | MessageKind::PrefetchReadAllocReq
            )
        {
            transport.message.kind = MessageKind::PrefetchReadRedundant;
            self.base_mut().stats.prefetch_redundant += 1;
            return Action::new(ActionKind::Send, 0).with_back(transport.clone());
        }
        self.examine_request(transport, has_maf, None)
    }

    /// Retry a request that was parked in the MAF.
    fn wake_maf(&mut self, transport: &mut Transport, waking: Option<&Tracker>) -> Action {
        self.base_mut().stats.accesses += 1;
        self.examine_request(transport, false, waking)
    }

    fn examine_request(
        &mut self,
        transport: &mut Transport,
        has_maf: bool,
        waking: Option<&Tracker>,
    ) -> Action {
        let name = self.base().name.clone();
        transport.tracker.set_delay_cause(&name, "Processing");
        let original = transport.kind();
        let (outcome, mut action) = self.do_request(transport, has_maf);
        let Some(outcome) = outcome else {
            return action;
        };
        self.base_mut().stats.record(original, outcome);
        if outcome != Outcome::Miss {
            if let (Some(waking), Some(front)) = (waking, action.front.as_mut()) {
                front.tracker.network_traffic_required = waking.network_traffic_required;
                front.tracker.responder = waking.responder;
                front.tracker.fill_level = waking.fill_level;
                front.tracker.fill_type = waking.fill_type;
                front.tracker.previous_state = waking.previous_state;
            }
        }
        log::trace!("{}: {} -> {} ({})", name, original, action, outcome);
        action
    }

    fn free_evict_buffer(&self) -> usize {
        self.base().free_evict_buffer()
    }

    fn evictable_block_exists(&self, scheduled: usize) -> bool {
        self.base().evictable_block_exists(scheduled)
    }

    fn full_evict_buffer(&self) -> bool {
        self.base().full_evict_buffer()
    }

    fn reserve_evict_buffer(&mut self) {
        self.base_mut().reserve_evict_buffer();
    }

    fn unreserve_evict_buffer(&mut self) {
        self.base_mut().unreserve_evict_buffer();
    }

    fn full_snoop_buffer(&self) -> bool {
        self.base().snoop_buffer.full()
    }

    fn reserve_snoop_buffer(&mut self) {
        self.base_mut().snoop_buffer.reserve();
    }

    fn unreserve_snoop_buffer(&mut self) {
        self.base_mut().snoop_buffer.unreserve();
    }

    fn can_start_request(&self, addr: address) -> bool {
        self.base().can_start_request(addr)
    }

    fn add_pending_request(&mut self, addr: address) {
        let base = self.base_mut();
        let set = base.set(addr);
        base.requests.start_request(set);
    }

    fn remove_pending_request(&mut self, addr: address) {
        let base = self.base_mut();
        let set = base.set(addr);
        base.requests.end_request(set);
    }

    fn snoop_resources_available(&self, _transport: &Transport) -> bool {
        true
    }

    fn reserve_snoop_resources(&mut self, _transport: &Transport) {}

    fn unreserve_snoop_resources(&mut self, _transport: &Transport) {}

    fn has_waking_snoops(&self) -> bool {
        self.base().snoop_buffer.has_waking_snoops()
    }

    fn waking_snoop_transport(&mut self) -> Option<Transport> {
        self.base_mut().snoop_buffer.wake_snoop()
    }

    fn wake_waiting_snoops(&mut self, addr: address) {
        self.base_mut().snoop_buffer.wake_waiting_entries(addr);
    }

    fn idle_work_available(&self, front_side_out_full: bool) -> bool {
        self.base().idle_work_available(front_side_out_full)
    }

    /// Message for the next piece of idle work, `None` if the work only
    /// moves a block out of the array.
    fn idle_work_message(&mut self) -> Option<Transport> {
        self.base_mut().idle_work_message()
    }

    fn complete_idle_work(&mut self, _transport: Option<&Transport>) {}

    /// Blocks woken together with `addr` when a region completes.
    fn region_blocks(&self, addr: address) -> Vec<address> {
        vec![addr]
    }

    fn block_address(&self, addr: address) -> address {
        self.base().block_address(addr)
    }

    fn is_quiesced(&self) -> bool {
        self.base().snoop_buffer.is_empty()
    }

    fn stats(&self) -> Stats {
        self.base().stats.clone()
    }

    fn save_state(&self) -> Result<String, CheckpointError> {
        let base = self.base();
        let checkpoint = Checkpoint {
            array: base.array.save_state()?,
            evict_buffer: base.evict_buffer.save_state(),
        };
        Ok(serde_json::to_string(&checkpoint)?)
    }

    fn load_state(&mut self, checkpoint: &str) -> Result<(), CheckpointError> {
        let checkpoint: Checkpoint = serde_json::from_str(checkpoint)?;
        let base = self.base_mut();
        base.array.load_state(&checkpoint.array)?;
        base.evict_buffer.load_state(&checkpoint.evict_buffer);
        base.pending_evicts = 0;
        Ok(())
    }
}

/// Build the protocol a controller is configured with.
pub fn build(config: &config::Cache) -> Result<Box<dyn Protocol>, config::Error> {
    let (kind, args) = config.protocol()?;
    let options = Options::parse(kind, &args)?;
    let protocol = Inclusive::new(kind, options, config)?;
    log::debug!("{}: {} with {:?}", config.name, kind, protocol.options());
    Ok(Box::new(protocol))
}
