use crate::message::MessageKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum::IntoEnumIterator;

/// Class of a request as counted by the protocol.
#[derive(
    Debug,
    strum::EnumIter,
    strum::Display,
    Clone,
    Copy,
    Hash,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
pub enum RequestClass {
    Read,
    Write,
    Atomic,
    Fetch,
    Prefetch,
    Upgrade,
    NonAllocatingStore,
}

impl RequestClass {
    #[must_use]
    pub fn of(kind: MessageKind) -> Option<Self> {
        use MessageKind as K;
        match kind {
            K::LoadReq | K::ReadReq | K::AtomicPreloadReq | K::StreamFetch => Some(Self::Read),
            K::StoreReq | K::StorePrefetchReq | K::WriteReq | K::WriteAllocate => Some(Self::Write),
            K::RMWReq | K::CmpxReq => Some(Self::Atomic),
            K::FetchReq => Some(Self::Fetch),
            K::PrefetchReadNoAllocReq | K::PrefetchReadAllocReq => Some(Self::Prefetch),
            K::UpgradeReq | K::UpgradeAllocate => Some(Self::Upgrade),
            K::NonAllocatingStoreReq => Some(Self::NonAllocatingStore),
            _ => None,
        }
    }
}

#[derive(
    Debug,
    strum::EnumIter,
    strum::Display,
    Clone,
    Copy,
    Hash,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
pub enum Outcome {
    Hit,
    Miss,
    /// Hit on a block that was brought in by a prefetch.
    PrefetchedHit,
}

/// Counters of one cache controller.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub name: String,
    pub accesses: u64,
    #[serde(with = "request_counts")]
    pub requests: BTreeMap<(RequestClass, Outcome), u64>,
    pub snoops: u64,
    pub iprobes: u64,
    pub fills: u64,
    pub upgrades: u64,
    pub upgrade_replies: u64,
    pub evicts_clean: u64,
    pub evicts_dirty: u64,
    pub evicts_with_data: u64,
    pub evicts_dropped: u64,
    pub prefetch_redundant: u64,
    pub write_retries: u64,
    pub peak_maf_misses: usize,
    pub peak_maf_entries: usize,
}

/// Tuple keys have no JSON map representation, requests serialize as pairs.
mod request_counts {
    use super::{Outcome, RequestClass};
    use serde::{Deserialize, Deserializer, Serializer};
    use std::collections::BTreeMap;

    type Counts = BTreeMap<(RequestClass, Outcome), u64>;

    pub fn serialize<S: Serializer>(counts: &Counts, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(counts.iter())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Counts, D::Error> {
        let pairs: Vec<((RequestClass, Outcome), u64)> = Vec::deserialize(deserializer)?;
        Ok(pairs.into_iter().collect())
    }
}

impl Stats {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let mut requests = BTreeMap::new();
        for class in RequestClass::iter() {
            for outcome in Outcome::iter() {
                requests.insert((class, outcome), 0);
            }
        }
        Self {
            name: name.into(),
            accesses: 0,
            requests,
            snoops: 0,
            iprobes: 0,
            fills: 0,
            upgrades: 0,
            upgrade_replies: 0,
            evicts_clean: 0,
            evicts_dirty: 0,
            evicts_with_data: 0,
            evicts_dropped: 0,
            prefetch_redundant: 0,
            write_retries: 0,
            peak_maf_misses: 0,
            peak_maf_entries: 0,
        }
    }

    /// Count a request of the given kind, ignoring non-requests.
    pub fn record(&mut self, kind: MessageKind, outcome: Outcome) {
        if let Some(class) = RequestClass::of(kind) {
            *self.requests.entry((class, outcome)).or_insert(0) += 1;
        }
    }

    #[must_use]
    pub fn count(&self, class: RequestClass, outcome: Outcome) -> u64 {
        self.requests.get(&(class, outcome)).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn hits(&self) -> u64 {
        self.requests
            .iter()
            .filter(|((_, outcome), _)| *outcome != Outcome::Miss)
            .map(|(_, count)| count)
            .sum()
    }

    #[must_use]
    pub fn misses(&self) -> u64 {
        self.requests
            .iter()
            .filter(|((_, outcome), _)| *outcome == Outcome::Miss)
            .map(|(_, count)| count)
            .sum()
    }

    #[must_use]
    pub fn hit_rate(&self) -> Option<f64> {
        let total = self.hits() + self.misses();
        if total == 0 {
            None
        } else {
            Some(self.hits() as f64 / total as f64)
        }
    }

    /// Non-zero request counters in key order.
    #[must_use]
    pub fn flatten(&self) -> Vec<((RequestClass, Outcome), u64)> {
        self.requests
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(key, count)| (*key, *count))
            .collect()
    }

    #[must_use]
    pub fn evicts(&self) -> u64 {
        self.evicts_clean + self.evicts_dirty
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new("")
    }
}

impl std::ops::AddAssign for Stats {
    fn add_assign(&mut self, other: Self) {
        for (key, count) in other.requests {
            *self.requests.entry(key).or_insert(0) += count;
        }
        self.accesses += other.accesses;
        self.snoops += other.snoops;
        self.iprobes += other.iprobes;
        self.fills += other.fills;
        self.upgrades += other.upgrades;
        self.upgrade_replies += other.upgrade_replies;
        self.evicts_clean += other.evicts_clean;
        self.evicts_dirty += other.evicts_dirty;
        self.evicts_with_data += other.evicts_with_data;
        self.evicts_dropped += other.evicts_dropped;
        self.prefetch_redundant += other.prefetch_redundant;
        self.write_retries += other.write_retries;
        self.peak_maf_misses = self.peak_maf_misses.max(other.peak_maf_misses);
        self.peak_maf_entries = self.peak_maf_entries.max(other.peak_maf_entries);
    }
}

impl std::fmt::Debug for Stats {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mut out = f.debug_struct("Stats");
        out.field("name", &self.name);
        out.field("accesses", &self.accesses);
        for ((class, outcome), count) in &self.requests {
            if *count > 0 {
                out.field(&format!("{class}[{outcome}]"), count);
            }
        }
        out.finish_non_exhaustive()
    }
}

impl std::fmt::Display for Stats {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        writeln!(f, "---- {} ----", self.name)?;
        writeln!(
            f,
            "{:<20} {:>10} {:>10} {:>14}",
            "class", "hits", "misses", "prefetch hits"
        )?;
        for class in RequestClass::iter() {
            let hits = self.count(class, Outcome::Hit);
            let misses = self.count(class, Outcome::Miss);
            let prefetched = self.count(class, Outcome::PrefetchedHit);
            if hits + misses + prefetched == 0 {
                continue;
            }
            writeln!(
                f,
                "{:<20} {hits:>10} {misses:>10} {prefetched:>14}",
                class.to_string()
            )?;
        }
        let rows = [
            ("accesses", self.accesses),
            ("snoops", self.snoops),
            ("iprobes", self.iprobes),
            ("fills", self.fills),
            ("upgrades", self.upgrades),
            ("upgrade replies", self.upgrade_replies),
            ("evicts clean", self.evicts_clean),
            ("evicts dirty", self.evicts_dirty),
            ("evicts with data", self.evicts_with_data),
            ("evicts dropped", self.evicts_dropped),
            ("prefetch redundant", self.prefetch_redundant),
            ("write retries", self.write_retries),
            ("peak maf misses", self.peak_maf_misses as u64),
            ("peak maf entries", self.peak_maf_entries as u64),
        ];
        for (label, value) in rows {
            if value > 0 {
                writeln!(f, "{label:<20} {value:>10}")?;
            }
        }
        if let Some(rate) = self.hit_rate() {
            writeln!(f, "{:<20} {:>9.2}%", "hit rate", rate * 100.0)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{Outcome, RequestClass, Stats};
    use crate::message::MessageKind;

    #[test]
    fn test_record_and_merge() {
        let mut l2 = Stats::new("L2");
        l2.record(MessageKind::ReadReq, Outcome::Hit);
        l2.record(MessageKind::ReadReq, Outcome::Miss);
        l2.record(MessageKind::UpgradeReq, Outcome::Miss);
        l2.record(MessageKind::EvictDirty, Outcome::Hit);
        assert_eq!(l2.hits(), 1);
        assert_eq!(l2.misses(), 2);

        let mut other = Stats::new("L2");
        other.record(MessageKind::FetchReq, Outcome::PrefetchedHit);
        other.evicts_dirty = 3;
        other.peak_maf_entries = 4;
        l2 += other;
        assert_eq!(l2.count(RequestClass::Fetch, Outcome::PrefetchedHit), 1);
        assert_eq!(l2.evicts(), 3);
        assert_eq!(l2.peak_maf_entries, 4);
        assert_eq!(l2.hit_rate(), Some(0.5));
    }

    #[test]
    fn test_display_skips_empty_rows() {
        let mut stats = Stats::new("L1d");
        assert_eq!(stats.hit_rate(), None);
        stats.record(MessageKind::LoadReq, Outcome::Hit);
        stats.fills = 2;
        let table = stats.to_string();
        assert!(table.starts_with("---- L1d ----"), "{table}");
        assert!(table.contains("Read"), "{table}");
        assert!(!table.contains("Atomic"), "{table}");
        assert!(table.contains("fills"), "{table}");
        assert!(!table.contains("snoops"), "{table}");
        assert!(table.contains("100.00%"), "{table}");
    }

    #[test]
    fn test_json_round_trip() -> color_eyre::eyre::Result<()> {
        let mut stats = Stats::new("L2");
        stats.record(MessageKind::WriteReq, Outcome::Miss);
        stats.evicts_clean = 1;
        let json = serde_json::to_string(&stats)?;
        let back: Stats = serde_json::from_str(&json)?;
        assert_eq!(back.flatten(), vec![((RequestClass::Write, Outcome::Miss), 1)]);
        pretty_assertions_sorted::assert_eq!(back, stats);
        Ok(())
    }
}
