use std::collections::HashMap;

use nimble_mesh_core::rpl::{Rpl, RplRx};
use nimble_mesh_core::MemoryStore;
use proptest::prelude::*;

fn rx(src: u16, seq: u32) -> RplRx {
    RplRx {
        src,
        seq,
        old_iv: false,
        local_if: false,
        local_match: true,
    }
}

proptest! {
    /// Accepted sequence numbers strictly increase per source
    #[test]
    fn prop_accepted_seq_strictly_increases(
        msgs in prop::collection::vec((1u16..6, 0u32..64), 1..200)
    ) {
        let mut rpl = Rpl::new(8);
        let mut last: HashMap<u16, u32> = HashMap::new();

        for (src, seq) in msgs {
            let replay = rpl.check(&rx(src, seq));
            let expected_replay = last.get(&src).is_some_and(|&prev| seq <= prev);
            prop_assert_eq!(replay, expected_replay);
            if !replay {
                last.insert(src, seq);
            }
            prop_assert_eq!(rpl.get(src).map(|e| e.seq), last.get(&src).copied());
        }
    }

    /// After the first message, a non-increasing run from one source on one
    /// IV index is all replays
    #[test]
    fn prop_non_increasing_run_replayed(
        src in 1u16..0x7fff,
        old_iv in any::<bool>(),
        mut seqs in prop::collection::vec(0u32..0x00ff_ffff, 2..20),
    ) {
        seqs.sort_unstable_by(|a, b| b.cmp(a));
        let mut rpl = Rpl::new(4);
        let mut msgs = seqs.into_iter().map(|seq| RplRx { old_iv, ..rx(src, seq) });

        let first = msgs.next().unwrap();
        prop_assert!(!rpl.check(&first));
        for msg in msgs {
            prop_assert!(rpl.check(&msg));
        }
        prop_assert_eq!(rpl.get(src).map(|e| e.seq), Some(first.seq));
    }

    /// Old IV index traffic is refused once the source was heard on the new one
    #[test]
    fn prop_old_iv_after_new_rejected(
        src in 1u16..0x7fff,
        new_seq in 0u32..0x00ff_ffff,
        old_seqs in prop::collection::vec(0u32..0x00ff_ffff, 1..20),
    ) {
        let mut rpl = Rpl::new(4);
        prop_assert!(!rpl.check(&rx(src, new_seq)));

        for seq in old_seqs {
            let old = RplRx { old_iv: true, ..rx(src, seq) };
            prop_assert!(rpl.check(&old));
        }
        let entry = rpl.get(src).unwrap();
        prop_assert_eq!((entry.seq, entry.old_iv), (new_seq, false));
    }

    /// Messages that bypass the list never change it
    #[test]
    fn prop_bypassed_messages_leave_no_entry(src in 1u16..0x7fff, seq in 0u32..0x00ff_ffff) {
        let mut rpl = Rpl::new(4);
        let local = RplRx { local_if: true, ..rx(src, seq) };
        let foreign = RplRx { local_match: false, ..rx(src, seq) };

        prop_assert!(!rpl.check(&local));
        prop_assert!(!rpl.check(&foreign));
        prop_assert!(!rpl.check(&foreign));
        prop_assert_eq!(rpl.entries().count(), 0);
    }
}

#[test]
fn test_full_list_fails_closed() {
    let mut rpl = Rpl::new(2);
    assert!(!rpl.check(&rx(1, 1)));
    assert!(!rpl.check(&rx(2, 1)));

    // Unknown source with no room left is treated as a replay
    assert!(rpl.check(&rx(3, 1)));
    assert!(rpl.get(3).is_none());

    // Known sources keep working
    assert!(!rpl.check(&rx(1, 2)));
}

#[test]
fn test_iv_update_ages_entries() {
    let store = MemoryStore::new();
    let mut rpl = Rpl::new(4);
    assert!(!rpl.check(&rx(1, 100)));

    rpl.reset(&store);
    assert!(rpl.get(1).unwrap().old_iv);

    // A lower sequence number on the new IV index is fresh
    assert!(!rpl.check(&rx(1, 5)));
    assert!(!rpl.get(1).unwrap().old_iv);

    // Old IV traffic after new IV traffic is a replay
    let old = RplRx { old_iv: true, ..rx(1, 200) };
    assert!(rpl.check(&old));

    // A second IV update drops entries that were already aged
    rpl.reset(&store);
    rpl.reset(&store);
    assert!(rpl.get(1).is_none());
}
