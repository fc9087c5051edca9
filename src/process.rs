use crate::maf::EntryId;
use crate::message::{Tracker, Transport};
use smallvec::SmallVec;

/// What caused a process to be scheduled.
#[derive(
    Debug,
    strum::EnumIter,
    strum::Display,
    strum::IntoStaticStr,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
)]
pub enum ProcessKind {
    Request,
    Prefetch,
    Snoop,
    BackRequest,
    BackReply,
    MAFWakeup,
    IProbe,
    Eviction,
    NoMoreWork,
    IdleWork,
    WakeSnoop,
}

/// A resource a process may hold a slot of.
#[derive(
    Debug,
    strum::EnumIter,
    strum::Display,
    strum::IntoStaticStr,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
)]
#[repr(u16)]
pub enum Resource {
    FrontSideOut = 0x01,
    BackSideOutRequest = 0x02,
    BackSideOutSnoop = 0x04,
    BackSideOutPrefetch = 0x08,
    EvictBuffer = 0x10,
    ScheduledEvict = 0x20,
    Maf = 0x40,
    SnoopBuffer = 0x80,
    BackSideOutReply = 0x100,
}

impl Resource {
    #[must_use]
    pub fn mask(self) -> u16 {
        self as u16
    }
}

/// Proof that one slot of a resource was reserved.
///
/// Only the controller hands out grants, and releasing the slot consumes
/// the grant, so a slot can be released at most once.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a grant must be held or released"]
pub struct Grant {
    resource: Resource,
}

impl Grant {
    pub(crate) fn new(resource: Resource) -> Self {
        Self { resource }
    }

    #[must_use]
    pub fn resource(&self) -> Resource {
        self.resource
    }

    /// Consume the grant, returning the resource whose slot is released.
    pub(crate) fn release(self) -> Resource {
        self.resource
    }
}

/// Grants currently held by a process.
#[derive(Debug, Default)]
pub struct Reservations {
    grants: SmallVec<[Grant; 4]>,
}

impl Reservations {
    pub fn hold(&mut self, grant: Grant) {
        if self.holds(grant.resource) {
            log::warn!("second reservation of {} held by one process", grant.resource);
        }
        self.grants.push(grant);
    }

    #[must_use]
    pub fn holds(&self, resource: Resource) -> bool {
        self.grants.iter().any(|g| g.resource == resource)
    }

    /// Hand over the grant of a resource.
    pub fn take(&mut self, resource: Resource) -> Option<Grant> {
        let idx = self.grants.iter().position(|g| g.resource == resource)?;
        Some(self.grants.swap_remove(idx))
    }

    #[must_use]
    pub fn mask(&self) -> u16 {
        self.grants.iter().fold(0, |mask, g| mask | g.resource.mask())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = Grant> + '_ {
        self.grants.drain(..)
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("process {serial} ({kind}) finished holding reservations {mask:#x}")]
pub struct LeakedReservations {
    pub serial: u64,
    pub kind: ProcessKind,
    pub mask: u16,
}

/// A unit of work flowing through the MAF, tag and data pipelines of a bank.
///
/// A process sends at most one message in each direction: `front` towards
/// the cores and `back` towards the next level.
#[derive(Debug)]
pub struct ProcessEntry {
    pub kind: ProcessKind,
    /// The message that started the process.
    pub transport: Option<Transport>,
    pub front: Option<Transport>,
    pub back: Option<Transport>,
    pub front_to_d: bool,
    pub front_to_i: bool,
    pub maf_entry: Option<EntryId>,
    pub waking_tracker: Option<Tracker>,
    pub requires_data: u32,
    pub requires_tag: u32,
    /// Messages may leave after the tag check, before the data access.
    pub transmit_after_tag: bool,
    pub wake_maf: bool,
    pub wake_after_snoop: bool,
    pub wake_after_evict: bool,
    pub wake_region: bool,
    pub remove_maf_entry: bool,
    pub reservations: Reservations,
    serial: u64,
}

impl std::fmt::Display for ProcessEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Process#{}[{}]", self.serial, self.kind)?;
        if let Some(transport) = &self.transport {
            write!(f, " {transport}")?;
        }
        Ok(())
    }
}

impl ProcessEntry {
    #[must_use]
    pub fn new(kind: ProcessKind, transport: Option<Transport>, serial: u64) -> Self {
        Self {
            kind,
            transport,
            front: None,
            back: None,
            front_to_d: false,
            front_to_i: false,
            maf_entry: None,
            waking_tracker: None,
            requires_data: 0,
            requires_tag: 0,
            transmit_after_tag: false,
            wake_maf: false,
            wake_after_snoop: false,
            wake_after_evict: false,
            wake_region: false,
            remove_maf_entry: false,
            reservations: Reservations::default(),
            serial,
        }
    }

    /// A process retrying a blocked MAF entry.
    #[must_use]
    pub fn waking(
        kind: ProcessKind,
        entry: EntryId,
        transport: Transport,
        waking_tracker: Option<Tracker>,
        serial: u64,
    ) -> Self {
        let mut process = Self::new(kind, Some(transport), serial);
        process.maf_entry = Some(entry);
        process.waking_tracker = waking_tracker;
        process
    }

    #[must_use]
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Address of the block this process works on.
    #[must_use]
    pub fn addr(&self) -> Option<crate::address> {
        self.transport
            .as_ref()
            .map(Transport::addr)
            .or(self.maf_entry.map(|id| id.addr))
    }

    /// Set the front message together with its D/I routing.
    pub fn set_front(&mut self, transport: Transport, to_d: bool, to_i: bool) {
        self.front = Some(transport);
        self.front_to_d = to_d;
        self.front_to_i = to_i;
    }

    /// Close the process, checking that every reservation was released.
    pub fn finish(mut self) -> Result<(), LeakedReservations> {
        let kind = std::mem::replace(&mut self.kind, ProcessKind::NoMoreWork);
        if self.reservations.is_empty() {
            Ok(())
        } else {
            let leaked = LeakedReservations {
                serial: self.serial,
                kind,
                mask: self.reservations.mask(),
            };
            // checked, nothing to report on drop
            let _ = self.reservations.drain().map(Grant::release).count();
            Err(leaked)
        }
    }
}

impl Drop for ProcessEntry {
    fn drop(&mut self) {
        if !self.reservations.is_empty() {
            log::warn!(
                "{} dropped holding reservations {:#x}",
                self,
                self.reservations.mask()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Grant, LeakedReservations, ProcessEntry, ProcessKind, Resource};
    use crate::message::{Message, MessageKind};
    use strum::IntoEnumIterator;

    #[test]
    fn test_resource_masks_are_distinct_bits() {
        let mut seen = 0u16;
        for resource in Resource::iter() {
            let mask = resource.mask();
            assert_eq!(mask.count_ones(), 1, "{resource} is not a single bit");
            assert_eq!(seen & mask, 0, "{resource} shares a bit");
            seen |= mask;
        }
        assert_eq!(seen, 0x1ff);
    }

    #[test]
    fn test_finish_without_reservations() {
        let transport = Message::new(MessageKind::ReadReq, 0x40).into();
        let mut process = ProcessEntry::new(ProcessKind::Request, Some(transport), 1);
        process.reservations.hold(Grant::new(Resource::Maf));
        let grant = process.reservations.take(Resource::Maf);
        assert_eq!(grant.map(Grant::release), Some(Resource::Maf));
        assert!(process.finish().is_ok());
    }

    #[test]
    fn test_finish_reports_leaks() {
        let mut process = ProcessEntry::new(ProcessKind::Snoop, None, 7);
        process.reservations.hold(Grant::new(Resource::FrontSideOut));
        process.reservations.hold(Grant::new(Resource::BackSideOutReply));
        assert!(process.reservations.holds(Resource::FrontSideOut));
        assert_eq!(
            process.finish(),
            Err(LeakedReservations {
                serial: 7,
                kind: ProcessKind::Snoop,
                mask: 0x101,
            })
        );
    }

    #[test]
    fn test_take_missing_grant() {
        let mut process = ProcessEntry::new(ProcessKind::Eviction, None, 2);
        assert!(process.reservations.take(Resource::EvictBuffer).is_none());
        assert!(process.addr().is_none());
    }
}
