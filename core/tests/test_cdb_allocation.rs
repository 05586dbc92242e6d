use nimble_mesh_core::cdb::{Cdb, CdbError};
use nimble_mesh_core::settings::keys;
use nimble_mesh_core::{MemoryStore, SettingsStore};
use proptest::prelude::*;

const NET_KEY: [u8; 16] = [0x5a; 16];

fn uuid(n: u8) -> [u8; 16] {
    [n; 16]
}

fn cdb(store: &MemoryStore) -> Cdb {
    let mut cdb = Cdb::new(4, 2, 2);
    cdb.create(&NET_KEY, store).unwrap();
    cdb
}

#[test]
fn test_lowest_free_range_allocated() {
    let store = MemoryStore::new();
    let mut cdb = cdb(&store);

    assert_eq!(cdb.node_alloc(&uuid(1), 0, 2, 0).unwrap().addr, 0x0001);
    assert_eq!(cdb.node_alloc(&uuid(2), 0, 1, 0).unwrap().addr, 0x0003);

    // A hole left by a deleted node is reused when the range fits
    cdb.node_del(0x0001, None);
    assert_eq!(cdb.node_alloc(&uuid(3), 0, 3, 0).unwrap().addr, 0x0004);
    assert_eq!(cdb.node_alloc(&uuid(4), 0, 2, 0).unwrap().addr, 0x0001);
}

/// One step against the database: allocate at the lowest free address,
/// allocate at an explicit address, or delete the n-th node
#[derive(Debug, Clone, Copy)]
enum Step {
    Auto(u8),
    At(u16, u8),
    Del(usize),
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        3 => (1u8..=4).prop_map(Step::Auto),
        2 => (0x0001u16..0x0030, 1u8..=4).prop_map(|(addr, n)| Step::At(addr, n)),
        1 => (0usize..8).prop_map(Step::Del),
    ]
}

fn snapshot(cdb: &Cdb) -> Vec<([u8; 16], u16, u8)> {
    let mut nodes: Vec<_> = cdb.nodes().map(|n| (n.uuid, n.addr, n.num_elem)).collect();
    nodes.sort_by_key(|n| n.1);
    nodes
}

proptest! {
    /// Element ranges never overlap, and a refused allocation changes nothing
    #[test]
    fn prop_allocated_ranges_disjoint(steps in prop::collection::vec(step(), 1..60)) {
        let store = MemoryStore::new();
        let mut cdb = Cdb::new(8, 1, 1);
        cdb.create(&NET_KEY, &store).unwrap();

        for (i, step) in steps.into_iter().enumerate() {
            let before = snapshot(&cdb);
            let id = uuid(i as u8);
            let res = match step {
                Step::Auto(n) => cdb.node_alloc(&id, 0, n, 0).map(|node| (node.addr, node.num_elem)),
                Step::At(addr, n) => cdb.node_alloc(&id, addr, n, 0).map(|node| (node.addr, node.num_elem)),
                Step::Del(idx) => {
                    if let Some(&(_, addr, _)) = before.get(idx) {
                        cdb.node_del(addr, None);
                    }
                    continue;
                }
            };

            match res {
                Ok((addr, n)) => {
                    prop_assert_eq!(cdb.nodes().count(), before.len() + 1);
                    if let Step::At(want, _) = step {
                        prop_assert_eq!(addr, want);
                    }
                    prop_assert_eq!(cdb.node_get(addr + n as u16 - 1).map(|node| node.uuid), Some(id));
                }
                Err(_) => prop_assert_eq!(snapshot(&cdb), before),
            }

            let nodes = snapshot(&cdb);
            for pair in nodes.windows(2) {
                let (_, addr, n) = pair[0];
                prop_assert!(addr + n as u16 <= pair[1].1);
            }
        }
    }
}

#[test]
fn test_node_lookup_covers_element_range() {
    let store = MemoryStore::new();
    let mut cdb = cdb(&store);
    cdb.node_alloc(&uuid(1), 0x0010, 3, 0).unwrap();

    for addr in 0x0010..=0x0012 {
        assert_eq!(cdb.node_get(addr).map(|n| n.addr), Some(0x0010));
    }
    assert!(cdb.node_get(0x0013).is_none());
    assert_eq!(cdb.node_get(0x0011).unwrap().last_addr(), 0x0012);
}

#[test]
fn test_explicit_range_validation() {
    let store = MemoryStore::new();
    let mut cdb = cdb(&store);
    cdb.node_alloc(&uuid(1), 0x0010, 3, 0).unwrap();

    assert_eq!(
        cdb.node_alloc(&uuid(2), 0x0012, 1, 0).unwrap_err(),
        CdbError::AddressConflict {
            addr: 0x0012,
            num_elem: 1
        }
    );
    assert_eq!(
        cdb.node_alloc(&uuid(2), 0x7fff, 2, 0).unwrap_err(),
        CdbError::InvalidRange {
            addr: 0x7fff,
            num_elem: 2
        }
    );
    assert_eq!(
        cdb.node_alloc(&uuid(2), 0xc000, 1, 0).unwrap_err(),
        CdbError::InvalidRange {
            addr: 0xc000,
            num_elem: 1
        }
    );
    assert!(cdb.node_alloc(&uuid(2), 0x0013, 1, 0).is_ok());
}

#[test]
fn test_exhaustion() {
    let store = MemoryStore::new();
    let mut cdb = cdb(&store);
    for n in 0..4 {
        cdb.node_alloc(&uuid(n), 0, 1, 0).unwrap();
    }
    let err = cdb.node_alloc(&uuid(9), 0, 1, 0).unwrap_err();
    assert_eq!(err, CdbError::NoFreeSlot);
    assert!(err.is_exhaustion());

    // 128 nodes of 255 elements leave too short a tail for another one
    let mut cdb = Cdb::new(130, 1, 1);
    cdb.create(&NET_KEY, &store).unwrap();
    for n in 0..128u8 {
        cdb.node_alloc(&uuid(n), 0, 255, 0).unwrap();
    }
    assert_eq!(cdb.node_alloc(&uuid(200), 0, 127, 0).unwrap().addr, 0x7f81);
    let err = cdb.node_alloc(&uuid(201), 0, 255, 0).unwrap_err();
    assert_eq!(err, CdbError::NoFreeAddress);
    assert!(err.is_exhaustion());
    assert!(!CdbError::NotFound.is_exhaustion());
}

#[test]
fn test_create_twice_rejected() {
    let store = MemoryStore::new();
    let mut cdb = cdb(&store);
    assert_eq!(cdb.create(&NET_KEY, &store), Err(CdbError::AlreadyCreated));

    cdb.clear(&store);
    assert!(!cdb.is_valid());
    assert!(cdb.subnet_get(0).is_none());
    cdb.create(&NET_KEY, &store).unwrap();
    assert_eq!(cdb.subnet_get(0).unwrap().keys[0], NET_KEY);
}

#[test]
fn test_nodes_survive_restore() {
    let store = MemoryStore::new();
    {
        let mut cdb = cdb(&store);
        let node = cdb.node_alloc(&uuid(7), 0x0100, 2, 0).unwrap();
        node.dev_key = [0x44; 16];
        cdb.node_store(0x0100, &store);
        cdb.node_alloc(&uuid(8), 0x0200, 1, 0).unwrap();
        cdb.node_store(0x0200, &store);
        assert!(cdb.take_store_request());
        cdb.pending_store(&store);

        cdb.node_del(0x0200, Some(&store));
        cdb.pending_store(&store);
    }
    assert!(store.load(&keys::cdb_node(0x0200)).unwrap().is_none());

    let mut cdb = Cdb::new(4, 2, 2);
    cdb.restore_net(store.load(keys::CDB_NET).unwrap().as_deref())
        .unwrap();
    for (key, value) in store.load_all("bt_mesh/cdb/Node/").unwrap() {
        let addr = u16::from_str_radix(key.rsplit('/').next().unwrap(), 16).unwrap();
        cdb.restore_node(addr, Some(&value)).unwrap();
    }

    assert!(cdb.is_valid());
    let node = cdb.node_get(0x0101).unwrap();
    assert_eq!(node.uuid, uuid(7));
    assert_eq!(node.num_elem, 2);
    assert_eq!(node.dev_key, [0x44; 16]);
    assert_eq!(cdb.nodes().count(), 1);
}
