use super::hasher::BucketHasher;
use super::Base;
use crate::address;
use crate::message::{DirectoryHint, Transport};
use std::collections::BTreeSet;

/// Blocks of the set of `addr` that still map to the directory, other than
/// `addr` itself.
fn set_peers(base: &Base, addr: address, include_pending: bool) -> Vec<address> {
    let mut peers = base.array.set_tags(addr);
    peers.extend(
        base.evict_buffer
            .iter()
            .filter(|entry| include_pending || !entry.pending)
            .filter(|entry| base.array.same_set(entry.addr, addr))
            .map(|entry| entry.addr),
    );
    peers.retain(|peer| *peer != addr);
    peers
}

/// Buckets an eviction of `addr` may clear.
///
/// Evictions already on their way out no longer pin their buckets.
pub(super) fn eviction_buckets(base: &Base, hasher: &BucketHasher, addr: address) -> BTreeSet<u32> {
    hasher.conflict_free(addr, set_peers(base, addr, false))
}

/// Hint sent along with an invalidation reply for `addr`.
pub(super) fn invalidation_hint(base: &Base, hasher: &BucketHasher, addr: address) -> DirectoryHint {
    let mut hint = DirectoryHint::default();
    hint.add_conflict_free_set(base.node, hasher.conflict_free(addr, set_peers(base, addr, true)));
    hint
}

/// Fold the hint carried by `incoming` into the one kept with a miss.
pub(super) fn merge_hint(kept: &mut Transport, incoming: &Transport) {
    if let Some(hint) = &incoming.hint {
        kept.hint.get_or_insert_with(DirectoryHint::default).merge(hint);
    }
}

#[cfg(test)]
mod tests {
    use super::{eviction_buckets, invalidation_hint, merge_hint};
    use crate::config;
    use crate::message::{DirectoryHint, Message, MessageKind, Transport};
    use crate::protocol::hasher::BucketHasher;
    use crate::protocol::Base;
    use crate::state::CoherenceState;
    use color_eyre::eyre;
    use std::collections::BTreeSet;

    fn setup() -> eyre::Result<(Base, BucketHasher)> {
        let config = config::Cache {
            array: "STD:size=1024:assoc=2:repl=lru".to_string(),
            ..config::Cache::default()
        };
        let hasher = BucketHasher::new(&config::Hasher {
            functions: vec!["simple".to_string()],
            initial_shift: 6,
            buckets_per_hash: 64,
            partitioned: false,
        })?;
        Ok((Base::new(&config, true)?, hasher))
    }

    #[test]
    fn test_pending_evictions_do_not_pin_buckets() -> eyre::Result<()> {
        let (mut base, hasher) = setup()?;
        // 8 sets with stride 0x200; 0x40 and 0x1040 share set and bucket 1
        base.evict_buffer
            .alloc_entry(0x1040, MessageKind::EvictClean, CoherenceState::Shared, true);
        base.evict_buffer
            .alloc_entry(0x40, MessageKind::EvictClean, CoherenceState::Shared, true);
        assert!(eviction_buckets(&base, &hasher, 0x40).is_empty());

        base.evict_buffer.pop(0);
        assert_eq!(eviction_buckets(&base, &hasher, 0x40), BTreeSet::from([1]));

        let hint = invalidation_hint(&base, &hasher, 0x40);
        assert!(hint.is_empty());
        Ok(())
    }

    #[test]
    fn test_array_peers_pin_buckets() -> eyre::Result<()> {
        let (mut base, hasher) = setup()?;
        let mut lookup = base.lookup(0x1040);
        base.allocate_block(&mut lookup, true, false);
        base.array.set_state(&lookup, CoherenceState::Shared);
        assert!(eviction_buckets(&base, &hasher, 0x40).is_empty());
        assert_eq!(eviction_buckets(&base, &hasher, 0x80), BTreeSet::from([2]));
        Ok(())
    }

    #[test]
    fn test_merge_hint() {
        let mut kept: Transport = Message::new(MessageKind::WriteReq, 0x40).into();
        let mut incoming: Transport = Message::new(MessageKind::InvalidateAck, 0x40).into();
        merge_hint(&mut kept, &incoming);
        assert_eq!(kept.hint, None);

        let mut hint = DirectoryHint::default();
        hint.add_conflict_free_set(3, BTreeSet::from([7]));
        incoming.hint = Some(hint.clone());
        merge_hint(&mut kept, &incoming);
        merge_hint(&mut kept, &incoming);
        assert_eq!(kept.hint, Some(hint));
    }
}
