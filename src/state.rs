use serde::{Deserialize, Serialize};

/// Coherence state of a block.
#[derive(
    Debug,
    Default,
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
pub enum CoherenceState {
    #[default]
    Invalid,
    Shared,
    Exclusive,
    Owned,
    Modified,
}

impl CoherenceState {
    #[must_use]
    pub fn is_valid(self) -> bool {
        self != Self::Invalid
    }

    /// Whether the holder must supply data when it gives up the block.
    #[must_use]
    pub fn is_dirty(self) -> bool {
        matches!(self, Self::Modified | Self::Owned)
    }
}

/// Per-block state stored in the array.
///
/// The `prefetched` and `protected` bits ride along with the coherence
/// state but do not take part in comparisons.
#[derive(Debug, Default, Clone, Copy, Eq, Serialize, Deserialize)]
pub struct BlockState {
    pub state: CoherenceState,
    pub prefetched: bool,
    pub protected: bool,
}

impl PartialEq for BlockState {
    fn eq(&self, other: &Self) -> bool {
        self.state == other.state
    }
}

impl PartialEq<CoherenceState> for BlockState {
    fn eq(&self, other: &CoherenceState) -> bool {
        self.state == *other
    }
}

impl std::hash::Hash for BlockState {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.state.hash(state);
    }
}

impl std::fmt::Display for BlockState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.state)?;
        if self.prefetched {
            write!(f, "(prefetched)")?;
        }
        if self.protected {
            write!(f, "(protected)")?;
        }
        Ok(())
    }
}

impl From<CoherenceState> for BlockState {
    fn from(state: CoherenceState) -> Self {
        Self {
            state,
            prefetched: false,
            protected: false,
        }
    }
}

impl BlockState {
    /// State of a block restored from a checkpoint.
    #[must_use]
    pub fn from_checkpoint(dirty: bool, writable: bool) -> Self {
        match (dirty, writable) {
            (true, _) => CoherenceState::Modified.into(),
            (false, true) => CoherenceState::Exclusive.into(),
            (false, false) => CoherenceState::Shared.into(),
        }
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.state.is_valid()
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.state == CoherenceState::Modified
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        matches!(
            self.state,
            CoherenceState::Modified | CoherenceState::Exclusive
        )
    }
}

/// Level of a cache in the hierarchy.
#[derive(
    Debug,
    Default,
    strum::EnumString,
    strum::Display,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
)]
pub enum CacheLevel {
    L1,
    L1I,
    #[default]
    L2,
    L3,
}

impl CacheLevel {
    /// The level from which a peer of this cache would supply a block.
    #[must_use]
    pub fn peer(self) -> FillLevel {
        match self {
            Self::L1 | Self::L1I => FillLevel::PeerL1,
            Self::L2 => FillLevel::PeerL2,
            Self::L3 => FillLevel::LocalMem,
        }
    }
}

impl From<CacheLevel> for FillLevel {
    fn from(level: CacheLevel) -> Self {
        match level {
            CacheLevel::L1 => Self::L1,
            CacheLevel::L1I => Self::L1I,
            CacheLevel::L2 => Self::L2,
            CacheLevel::L3 => Self::L3,
        }
    }
}

/// Where a transaction was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FillLevel {
    L1,
    L1I,
    L2,
    L3,
    PeerL1,
    PeerL2,
    LocalMem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FillType {
    Replacement,
    Coherence,
    Cold,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PreviousState {
    Modified,
    Shared,
}

impl From<CoherenceState> for PreviousState {
    fn from(state: CoherenceState) -> Self {
        if state == CoherenceState::Modified {
            Self::Modified
        } else {
            Self::Shared
        }
    }
}
