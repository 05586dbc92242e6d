//! Configuration database
//!
//! The provisioner's record of the network: nodes with their unicast
//! address ranges and device keys, subnets and application keys. Changes
//! are persisted through a small table of pending updates so repeated
//! changes to one entry collapse into a single store or clear; when that
//! table is full the change is written through immediately.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::addr;
use crate::settings::keys;
use crate::store::{decode_record, encode_record, SettingsStore, StoreError};

pub const PRIMARY_NET_IDX: u16 = 0x000;

/// Key refresh phase in which the new key is used for transmission
const KR_PHASE_2: u8 = 0x02;

/// Beacon flag: key refresh in progress
pub const FLAG_KEY_REFRESH: u8 = 0x01;
/// Beacon flag: IV update in progress
pub const FLAG_IV_UPDATE: u8 = 0x02;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CdbError {
    #[error("Database already created")]
    AlreadyCreated,
    #[error("Index 0x{0:03x} already in use")]
    AlreadyExists(u16),
    #[error("No free slot")]
    NoFreeSlot,
    #[error("No free unicast range")]
    NoFreeAddress,
    #[error("Range 0x{addr:04x}+{num_elem} overlaps an existing node")]
    AddressConflict { addr: u16, num_elem: u8 },
    #[error("Invalid unicast range 0x{addr:04x}+{num_elem}")]
    InvalidRange { addr: u16, num_elem: u8 },
    #[error("Entry not found")]
    NotFound,
}

impl CdbError {
    pub fn is_exhaustion(&self) -> bool {
        matches!(self, CdbError::NoFreeSlot | CdbError::NoFreeAddress)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct CdbNode {
    pub uuid: [u8; 16],
    pub addr: u16,
    pub num_elem: u8,
    pub net_idx: u16,
    pub dev_key: [u8; 16],
    pub configured: bool,
}

impl CdbNode {
    /// Last unicast address of the node's element range
    pub fn last_addr(&self) -> u16 {
        self.addr + self.num_elem as u16 - 1
    }

    fn covers(&self, addr: u16) -> bool {
        addr >= self.addr && addr <= self.last_addr()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct CdbSubnet {
    pub net_idx: u16,
    pub kr_phase: u8,
    /// Old and new key of a key refresh
    pub keys: [[u8; 16]; 2],
}

#[derive(Debug, Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct CdbAppKey {
    pub net_idx: u16,
    pub app_idx: u16,
    pub keys: [[u8; 16]; 2],
}

#[derive(Debug, Serialize, Deserialize)]
struct NetRecord {
    iv_index: u32,
    iv_update: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct NodeRecord {
    net_idx: u16,
    num_elem: u8,
    configured: bool,
    uuid: [u8; 16],
    dev_key: [u8; 16],
}

#[derive(Debug, Serialize, Deserialize)]
struct SubnetRecord {
    kr_phase: u8,
    keys: [[u8; 16]; 2],
}

#[derive(Debug, Serialize, Deserialize)]
struct AppKeyRecord {
    net_idx: u16,
    keys: [[u8; 16]; 2],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct NodeUpdate {
    addr: u16,
    clear: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct KeyUpdate {
    key_idx: u16,
    app_key: bool,
    clear: bool,
}

/// Outcome of probing one candidate range
enum Probe {
    Free,
    /// Overlaps a node; the next candidate starts right after it
    Next(u32),
    Invalid,
}

pub struct Cdb {
    valid: bool,
    iv_index: u32,
    ivu_in_progress: bool,
    net_pending: bool,
    nodes_pending: bool,
    keys_pending: bool,
    store_requested: bool,
    nodes: Vec<Option<CdbNode>>,
    subnets: Vec<Option<CdbSubnet>>,
    app_keys: Vec<Option<CdbAppKey>>,
    node_updates: Vec<Option<NodeUpdate>>,
    key_updates: Vec<Option<KeyUpdate>>,
}

impl Cdb {
    pub fn new(node_count: usize, subnet_count: usize, app_key_count: usize) -> Self {
        Self {
            valid: false,
            iv_index: 0,
            ivu_in_progress: false,
            net_pending: false,
            nodes_pending: false,
            keys_pending: false,
            store_requested: false,
            nodes: vec![None; node_count],
            subnets: vec![None; subnet_count],
            app_keys: vec![None; app_key_count],
            node_updates: vec![None; node_count],
            key_updates: vec![None; subnet_count + app_key_count],
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn iv_index(&self) -> u32 {
        self.iv_index
    }

    pub fn ivu_in_progress(&self) -> bool {
        self.ivu_in_progress
    }

    /// Create the database with `key` as the primary network key
    pub fn create(&mut self, key: &[u8; 16], store: &dyn SettingsStore) -> Result<(), CdbError> {
        if self.valid {
            return Err(CdbError::AlreadyCreated);
        }

        self.subnet_alloc(PRIMARY_NET_IDX)?.keys[0] = *key;
        self.valid = true;
        self.iv_index = 0;
        self.schedule_net();
        self.subnet_store(PRIMARY_NET_IDX, store);
        debug!("CDB created");
        Ok(())
    }

    /// Delete every entry and invalidate the database
    pub fn clear(&mut self, store: &dyn SettingsStore) {
        self.valid = false;

        let addrs: Vec<u16> = self.nodes().map(|n| n.addr).collect();
        for addr in addrs {
            self.node_del(addr, Some(store));
        }
        let net_idxs: Vec<u16> = self.subnets().map(|s| s.net_idx).collect();
        for net_idx in net_idxs {
            self.subnet_del(net_idx, Some(store));
        }
        let app_idxs: Vec<u16> = self.app_keys().map(|k| k.app_idx).collect();
        for app_idx in app_idxs {
            self.app_key_del(app_idx, Some(store));
        }

        self.schedule_net();
    }

    pub fn iv_update(&mut self, iv_index: u32, iv_update: bool) {
        debug!("CDB IV index 0x{:08x} update {}", iv_index, iv_update);
        self.iv_index = iv_index;
        self.ivu_in_progress = iv_update;
        self.schedule_net();
    }

    // ========================================================================
    // Subnets
    // ========================================================================

    pub fn subnet_alloc(&mut self, net_idx: u16) -> Result<&mut CdbSubnet, CdbError> {
        if self.subnet_get(net_idx).is_some() {
            return Err(CdbError::AlreadyExists(net_idx));
        }
        let slot = self
            .subnets
            .iter_mut()
            .find(|s| s.is_none())
            .ok_or(CdbError::NoFreeSlot)?;
        Ok(slot.insert(CdbSubnet {
            net_idx,
            kr_phase: 0,
            keys: [[0; 16]; 2],
        }))
    }

    pub fn subnet_get(&self, net_idx: u16) -> Option<&CdbSubnet> {
        self.subnets().find(|s| s.net_idx == net_idx)
    }

    pub fn subnet_get_mut(&mut self, net_idx: u16) -> Option<&mut CdbSubnet> {
        self.subnets
            .iter_mut()
            .flatten()
            .find(|s| s.net_idx == net_idx)
    }

    pub fn subnets(&self) -> impl Iterator<Item = &CdbSubnet> {
        self.subnets.iter().flatten()
    }

    /// Delete a subnet; `store` also clears its persisted record
    pub fn subnet_del(&mut self, net_idx: u16, store: Option<&dyn SettingsStore>) {
        debug!("NetIdx 0x{:03x} store {}", net_idx, store.is_some());
        if let Some(store) = store {
            self.update_key(net_idx, false, true, store);
        }
        if let Some(slot) = self
            .subnets
            .iter_mut()
            .find(|s| matches!(s, Some(s) if s.net_idx == net_idx))
        {
            if let Some(mut sub) = slot.take() {
                sub.zeroize();
            }
        }
    }

    pub fn subnet_store(&mut self, net_idx: u16, store: &dyn SettingsStore) {
        self.update_key(net_idx, false, false, store);
    }

    /// Beacon flags of the subnet
    pub fn subnet_flags(&self, net_idx: u16) -> u8 {
        let mut flags = 0;
        if matches!(self.subnet_get(net_idx), Some(s) if s.kr_phase == KR_PHASE_2) {
            flags |= FLAG_KEY_REFRESH;
        }
        if self.ivu_in_progress {
            flags |= FLAG_IV_UPDATE;
        }
        flags
    }

    // ========================================================================
    // Nodes
    // ========================================================================

    /// Allocate a node. An unassigned `addr` picks the lowest free range.
    pub fn node_alloc(
        &mut self,
        uuid: &[u8; 16],
        addr: u16,
        num_elem: u8,
        net_idx: u16,
    ) -> Result<&mut CdbNode, CdbError> {
        let addr = if addr::is_unassigned(addr) {
            self.find_lowest_free_addr(num_elem)
                .ok_or(CdbError::NoFreeAddress)?
        } else {
            match self.probe(addr, num_elem) {
                Probe::Free => addr,
                Probe::Next(_) => return Err(CdbError::AddressConflict { addr, num_elem }),
                Probe::Invalid => return Err(CdbError::InvalidRange { addr, num_elem }),
            }
        };

        let slot = self
            .nodes
            .iter_mut()
            .find(|n| n.is_none())
            .ok_or(CdbError::NoFreeSlot)?;
        debug!("Allocated node 0x{:04x}+{}", addr, num_elem);
        Ok(slot.insert(CdbNode {
            uuid: *uuid,
            addr,
            num_elem,
            net_idx,
            dev_key: [0; 16],
            configured: false,
        }))
    }

    /// Node whose element range contains `addr`
    pub fn node_get(&self, addr: u16) -> Option<&CdbNode> {
        self.nodes().find(|n| n.covers(addr))
    }

    pub fn node_get_mut(&mut self, addr: u16) -> Option<&mut CdbNode> {
        self.nodes.iter_mut().flatten().find(|n| n.covers(addr))
    }

    pub fn nodes(&self) -> impl Iterator<Item = &CdbNode> {
        self.nodes.iter().flatten()
    }

    /// Delete the node at `addr`; `store` also clears its persisted record
    pub fn node_del(&mut self, addr: u16, store: Option<&dyn SettingsStore>) {
        let Some(idx) = self
            .nodes
            .iter()
            .position(|n| matches!(n, Some(n) if n.addr == addr))
        else {
            return;
        };
        debug!("Node 0x{:04x} store {}", addr, store.is_some());
        if let Some(store) = store {
            self.update_node(addr, true, store);
        }
        if let Some(mut node) = self.nodes[idx].take() {
            node.zeroize();
        }
    }

    pub fn node_store(&mut self, addr: u16, store: &dyn SettingsStore) {
        self.update_node(addr, false, store);
    }

    fn probe(&self, start: u16, num_elem: u8) -> Probe {
        if num_elem == 0 {
            return Probe::Invalid;
        }
        let start = start as u32;
        let end = start + num_elem as u32 - 1;
        if end > u16::MAX as u32 || !addr::is_unicast(start as u16) || !addr::is_unicast(end as u16)
        {
            return Probe::Invalid;
        }

        for node in self.nodes() {
            let other_start = node.addr as u32;
            let other_end = node.last_addr() as u32;
            if end >= other_start && start <= other_end {
                return Probe::Next(other_end + 1);
            }
        }
        Probe::Free
    }

    fn find_lowest_free_addr(&self, num_elem: u8) -> Option<u16> {
        let mut addr: u32 = 1;
        // Each probe skips past at least one node
        for _ in 0..self.nodes.len() + 2 {
            if addr > u16::MAX as u32 {
                return None;
            }
            match self.probe(addr as u16, num_elem) {
                Probe::Free => return Some(addr as u16),
                Probe::Next(next) => addr = next,
                Probe::Invalid => return None,
            }
        }
        None
    }

    // ========================================================================
    // Application keys
    // ========================================================================

    pub fn app_key_alloc(&mut self, net_idx: u16, app_idx: u16) -> Result<&mut CdbAppKey, CdbError> {
        if self.app_key_get(app_idx).is_some() {
            return Err(CdbError::AlreadyExists(app_idx));
        }
        let slot = self
            .app_keys
            .iter_mut()
            .find(|k| k.is_none())
            .ok_or(CdbError::NoFreeSlot)?;
        Ok(slot.insert(CdbAppKey {
            net_idx,
            app_idx,
            keys: [[0; 16]; 2],
        }))
    }

    pub fn app_key_get(&self, app_idx: u16) -> Option<&CdbAppKey> {
        self.app_keys().find(|k| k.app_idx == app_idx)
    }

    pub fn app_key_get_mut(&mut self, app_idx: u16) -> Option<&mut CdbAppKey> {
        self.app_keys
            .iter_mut()
            .flatten()
            .find(|k| k.app_idx == app_idx)
    }

    pub fn app_keys(&self) -> impl Iterator<Item = &CdbAppKey> {
        self.app_keys.iter().flatten()
    }

    pub fn app_key_del(&mut self, app_idx: u16, store: Option<&dyn SettingsStore>) {
        debug!("AppIdx 0x{:03x} store {}", app_idx, store.is_some());
        if let Some(store) = store {
            self.update_key(app_idx, true, true, store);
        }
        if let Some(slot) = self
            .app_keys
            .iter_mut()
            .find(|k| matches!(k, Some(k) if k.app_idx == app_idx))
        {
            if let Some(mut key) = slot.take() {
                key.zeroize();
            }
        }
    }

    pub fn app_key_store(&mut self, app_idx: u16, store: &dyn SettingsStore) {
        self.update_key(app_idx, true, false, store);
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// True once after any change that needs the CDB flag scheduled
    pub fn take_store_request(&mut self) -> bool {
        std::mem::take(&mut self.store_requested)
    }

    fn schedule_net(&mut self) {
        self.net_pending = true;
        self.store_requested = true;
    }

    fn update_node(&mut self, addr: u16, clear: bool, store: &dyn SettingsStore) {
        if let Some(update) = self
            .node_updates
            .iter_mut()
            .flatten()
            .find(|u| u.addr == addr)
        {
            update.clear = clear;
            return;
        }

        match self.node_updates.iter_mut().find(|u| u.is_none()) {
            Some(slot) => {
                *slot = Some(NodeUpdate { addr, clear });
                self.nodes_pending = true;
                self.store_requested = true;
            }
            None => {
                warn!("Node update table full, writing 0x{:04x} through", addr);
                if clear {
                    clear_record(store, &keys::cdb_node(addr));
                } else if let Some(node) = self.node_get(addr) {
                    store_node(node, store);
                }
            }
        }
    }

    fn update_key(&mut self, key_idx: u16, app_key: bool, clear: bool, store: &dyn SettingsStore) {
        if let Some(update) = self
            .key_updates
            .iter_mut()
            .flatten()
            .find(|u| u.key_idx == key_idx && u.app_key == app_key)
        {
            update.clear = clear;
            return;
        }

        match self.key_updates.iter_mut().find(|u| u.is_none()) {
            Some(slot) => {
                *slot = Some(KeyUpdate {
                    key_idx,
                    app_key,
                    clear,
                });
                self.keys_pending = true;
                self.store_requested = true;
            }
            None => {
                warn!("Key update table full, writing 0x{:03x} through", key_idx);
                self.apply_key_update(
                    KeyUpdate {
                        key_idx,
                        app_key,
                        clear,
                    },
                    store,
                );
            }
        }
    }

    fn apply_key_update(&self, update: KeyUpdate, store: &dyn SettingsStore) {
        match (update.app_key, update.clear) {
            (true, true) => clear_record(store, &keys::cdb_app_key(update.key_idx)),
            (false, true) => clear_record(store, &keys::cdb_subnet(update.key_idx)),
            (true, false) => match self.app_key_get(update.key_idx) {
                Some(key) => store_app_key(key, store),
                None => warn!("AppKeyIndex 0x{:03x} not found", update.key_idx),
            },
            (false, false) => match self.subnet_get(update.key_idx) {
                Some(sub) => store_subnet(sub, store),
                None => warn!("NetKeyIndex 0x{:03x} not found", update.key_idx),
            },
        }
    }

    /// Flush pending changes: network state, then nodes, then keys
    pub fn pending_store(&mut self, store: &dyn SettingsStore) {
        if std::mem::take(&mut self.net_pending) {
            if self.valid {
                let record = NetRecord {
                    iv_index: self.iv_index,
                    iv_update: self.ivu_in_progress,
                };
                save_record(store, keys::CDB_NET, &record);
            } else {
                clear_record(store, keys::CDB_NET);
            }
        }

        if std::mem::take(&mut self.nodes_pending) {
            for idx in 0..self.node_updates.len() {
                let Some(update) = self.node_updates[idx].take() else {
                    continue;
                };
                debug!("addr: 0x{:04x}, clear: {}", update.addr, update.clear);
                if update.clear {
                    clear_record(store, &keys::cdb_node(update.addr));
                } else {
                    match self.node_get(update.addr) {
                        Some(node) => store_node(node, store),
                        None => warn!("Node 0x{:04x} not found", update.addr),
                    }
                }
            }
        }

        if std::mem::take(&mut self.keys_pending) {
            for idx in 0..self.key_updates.len() {
                if let Some(update) = self.key_updates[idx].take() {
                    self.apply_key_update(update, store);
                }
            }
        }
    }

    // ========================================================================
    // Restore
    // ========================================================================

    pub fn restore_net(&mut self, value: Option<&[u8]>) -> Result<(), StoreError> {
        let Some(value) = value else {
            self.valid = false;
            return Ok(());
        };
        let record: NetRecord = decode_record(value)?;
        self.iv_index = record.iv_index;
        self.ivu_in_progress = record.iv_update;
        self.valid = true;
        debug!("Restored CDB IV index 0x{:08x}", record.iv_index);
        Ok(())
    }

    pub fn restore_node(&mut self, addr: u16, value: Option<&[u8]>) -> Result<(), StoreError> {
        let Some(value) = value else {
            self.node_del(addr, None);
            return Ok(());
        };
        let record: NodeRecord = decode_record(value)?;

        if self.node_get(addr).is_none() {
            self.node_alloc(&record.uuid, addr, record.num_elem, record.net_idx)
                .map_err(|e| {
                    error!("Failed to allocate node 0x{:04x}: {}", addr, e);
                    StoreError::Backend(e.to_string())
                })?;
        }
        if let Some(node) = self.node_get_mut(addr) {
            node.configured = record.configured;
            node.uuid = record.uuid;
            node.dev_key = record.dev_key;
        }
        debug!("Restored node 0x{:04x}", addr);
        Ok(())
    }

    pub fn restore_subnet(&mut self, net_idx: u16, value: Option<&[u8]>) -> Result<(), StoreError> {
        let Some(value) = value else {
            self.subnet_del(net_idx, None);
            return Ok(());
        };
        let record: SubnetRecord = decode_record(value)?;

        if self.subnet_get(net_idx).is_none() {
            self.subnet_alloc(net_idx).map_err(|e| {
                error!("No space to allocate a new subnet 0x{:03x}", net_idx);
                StoreError::Backend(e.to_string())
            })?;
        }
        if let Some(sub) = self.subnet_get_mut(net_idx) {
            sub.kr_phase = record.kr_phase;
            sub.keys = record.keys;
        }
        debug!("Restored NetKeyIndex 0x{:03x}", net_idx);
        Ok(())
    }

    pub fn restore_app_key(&mut self, app_idx: u16, value: Option<&[u8]>) -> Result<(), StoreError> {
        let Some(value) = value else {
            self.app_key_del(app_idx, None);
            return Ok(());
        };
        let record: AppKeyRecord = decode_record(value)?;

        if self.app_key_get(app_idx).is_none() {
            self.app_key_alloc(record.net_idx, app_idx).map_err(|e| {
                error!("Failed to allocate AppKeyIndex 0x{:03x}", app_idx);
                StoreError::Backend(e.to_string())
            })?;
        }
        if let Some(key) = self.app_key_get_mut(app_idx) {
            key.net_idx = record.net_idx;
            key.keys = record.keys;
        }
        debug!("Restored AppKeyIndex 0x{:03x}", app_idx);
        Ok(())
    }
}

fn save_record<T: Serialize>(store: &dyn SettingsStore, key: &str, record: &T) {
    let result = encode_record(record).and_then(|bytes| store.save(key, Some(&bytes)));
    match result {
        Ok(()) => debug!("Stored {}", key),
        Err(e) => error!("Failed to store {}: {}", key, e),
    }
}

fn clear_record(store: &dyn SettingsStore, key: &str) {
    match store.save(key, None) {
        Ok(()) => debug!("Cleared {}", key),
        Err(e) => error!("Failed to clear {}: {}", key, e),
    }
}

fn store_node(node: &CdbNode, store: &dyn SettingsStore) {
    let record = NodeRecord {
        net_idx: node.net_idx,
        num_elem: node.num_elem,
        configured: node.configured,
        uuid: node.uuid,
        dev_key: node.dev_key,
    };
    save_record(store, &keys::cdb_node(node.addr), &record);
}

fn store_subnet(sub: &CdbSubnet, store: &dyn SettingsStore) {
    let record = SubnetRecord {
        kr_phase: sub.kr_phase,
        keys: sub.keys,
    };
    save_record(store, &keys::cdb_subnet(sub.net_idx), &record);
}

fn store_app_key(key: &CdbAppKey, store: &dyn SettingsStore) {
    let record = AppKeyRecord {
        net_idx: key.net_idx,
        keys: key.keys,
    };
    save_record(store, &keys::cdb_app_key(key.app_idx), &record);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    const UUID: [u8; 16] = [0xaa; 16];

    fn created() -> (Cdb, MemoryStore) {
        let store = MemoryStore::new();
        let mut cdb = Cdb::new(4, 2, 2);
        cdb.create(&[0x11; 16], &store).unwrap();
        (cdb, store)
    }

    #[test]
    fn test_create_twice_fails() {
        let (mut cdb, store) = created();
        assert_eq!(cdb.create(&[0; 16], &store), Err(CdbError::AlreadyCreated));
        assert_eq!(cdb.subnet_get(PRIMARY_NET_IDX).unwrap().keys[0], [0x11; 16]);
        assert!(cdb.take_store_request());
    }

    #[test]
    fn test_node_alloc_picks_lowest_free_range() {
        let mut cdb = Cdb::new(4, 1, 1);
        assert_eq!(cdb.node_alloc(&UUID, 0, 2, 0).unwrap().addr, 1);
        assert_eq!(cdb.node_alloc(&UUID, 5, 1, 0).unwrap().addr, 5);
        assert_eq!(cdb.node_alloc(&UUID, 0, 2, 0).unwrap().addr, 3);
        assert_eq!(cdb.node_alloc(&UUID, 0, 1, 0).unwrap().addr, 6);
    }

    #[test]
    fn test_node_alloc_explicit_conflict() {
        let mut cdb = Cdb::new(4, 1, 1);
        cdb.node_alloc(&UUID, 0x10, 3, 0).unwrap();
        assert_eq!(
            cdb.node_alloc(&UUID, 0x12, 1, 0),
            Err(CdbError::AddressConflict {
                addr: 0x12,
                num_elem: 1
            })
        );
        assert!(cdb.node_alloc(&UUID, 0x13, 1, 0).is_ok());
    }

    #[test]
    fn test_node_alloc_rejects_invalid_range() {
        let mut cdb = Cdb::new(4, 1, 1);
        assert!(matches!(
            cdb.node_alloc(&UUID, 0x7fff, 2, 0),
            Err(CdbError::InvalidRange { .. })
        ));
        assert!(matches!(
            cdb.node_alloc(&UUID, 1, 0, 0),
            Err(CdbError::InvalidRange { .. })
        ));
    }

    #[test]
    fn test_node_table_full() {
        let mut cdb = Cdb::new(1, 1, 1);
        cdb.node_alloc(&UUID, 0, 1, 0).unwrap();
        let err = cdb.node_alloc(&UUID, 0, 1, 0).unwrap_err();
        assert_eq!(err, CdbError::NoFreeSlot);
        assert!(err.is_exhaustion());
    }

    #[test]
    fn test_node_get_matches_range() {
        let mut cdb = Cdb::new(2, 1, 1);
        cdb.node_alloc(&UUID, 0x20, 3, 0).unwrap();
        assert_eq!(cdb.node_get(0x22).map(|n| n.addr), Some(0x20));
        assert!(cdb.node_get(0x23).is_none());
    }

    #[test]
    fn test_deleted_slot_does_not_leak_keys() {
        let store = MemoryStore::new();
        let mut cdb = Cdb::new(1, 1, 1);
        cdb.node_alloc(&UUID, 0, 1, 0).unwrap().dev_key = [0x5a; 16];
        cdb.node_del(1, Some(&store));
        assert!(cdb.node_get(1).is_none());
        let node = cdb.node_alloc(&[0; 16], 0, 1, 0).unwrap();
        assert_eq!(node.dev_key, [0; 16]);

        cdb.app_key_alloc(0, 3).unwrap().keys[0] = [0x77; 16];
        cdb.app_key_del(3, Some(&store));
        assert!(cdb.app_key_get(3).is_none());
        assert_eq!(cdb.app_key_alloc(0, 4).unwrap().keys, [[0; 16]; 2]);
    }

    #[test]
    fn test_duplicate_indexes_rejected() {
        let (mut cdb, _store) = created();
        assert_eq!(
            cdb.subnet_alloc(PRIMARY_NET_IDX).unwrap_err(),
            CdbError::AlreadyExists(0)
        );
        cdb.app_key_alloc(0, 1).unwrap();
        assert_eq!(cdb.app_key_alloc(0, 1).unwrap_err(), CdbError::AlreadyExists(1));
    }

    #[test]
    fn test_subnet_flags() {
        let (mut cdb, _store) = created();
        assert_eq!(cdb.subnet_flags(0), 0);
        cdb.subnet_get_mut(0).unwrap().kr_phase = KR_PHASE_2;
        cdb.iv_update(5, true);
        assert_eq!(cdb.subnet_flags(0), FLAG_KEY_REFRESH | FLAG_IV_UPDATE);
    }

    #[test]
    fn test_pending_store_persists_and_restores() {
        let (mut cdb, store) = created();
        let node = cdb.node_alloc(&UUID, 0, 2, 0).unwrap();
        node.dev_key = [0x42; 16];
        node.configured = true;
        let addr = node.addr;
        cdb.node_store(addr, &store);
        cdb.app_key_alloc(0, 7).unwrap().keys[0] = [0x33; 16];
        cdb.app_key_store(7, &store);
        cdb.pending_store(&store);

        assert!(store.load(keys::CDB_NET).unwrap().is_some());
        assert!(store.load(&keys::cdb_node(addr)).unwrap().is_some());
        assert!(store.load(&keys::cdb_subnet(0)).unwrap().is_some());

        let mut restored = Cdb::new(4, 2, 2);
        for (key, value) in store.load_all(keys::ROOT).unwrap() {
            match crate::settings::SettingsKey::parse(&key).unwrap() {
                crate::settings::SettingsKey::CdbNet => restored.restore_net(Some(&value)).unwrap(),
                crate::settings::SettingsKey::CdbNode(a) => {
                    restored.restore_node(a, Some(&value)).unwrap()
                }
                crate::settings::SettingsKey::CdbSubnet(i) => {
                    restored.restore_subnet(i, Some(&value)).unwrap()
                }
                crate::settings::SettingsKey::CdbAppKey(i) => {
                    restored.restore_app_key(i, Some(&value)).unwrap()
                }
                other => panic!("unexpected key {:?}", other),
            }
        }
        assert!(restored.is_valid());
        let node = restored.node_get(addr).unwrap();
        assert_eq!(node.dev_key, [0x42; 16]);
        assert!(node.configured);
        assert_eq!(restored.app_key_get(7).unwrap().keys[0], [0x33; 16]);
        assert_eq!(restored.subnet_get(0).unwrap().keys[0], [0x11; 16]);
    }

    #[test]
    fn test_updates_collapse_per_entry() {
        let (mut cdb, store) = created();
        cdb.pending_store(&store);
        let addr = cdb.node_alloc(&UUID, 0, 1, 0).unwrap().addr;
        cdb.node_store(addr, &store);
        cdb.node_del(addr, Some(&store));
        cdb.pending_store(&store);
        assert!(store.load(&keys::cdb_node(addr)).unwrap().is_none());
    }

    #[test]
    fn test_full_update_table_writes_through() {
        let store = MemoryStore::new();
        let mut cdb = Cdb::new(1, 2, 0);
        cdb.subnet_alloc(0).unwrap();
        cdb.subnet_alloc(1).unwrap();
        cdb.subnet_store(0, &store);
        cdb.subnet_store(1, &store);
        cdb.subnet_del(0, Some(&store));

        // Both update slots are taken, so the new subnet is written at once
        cdb.subnet_alloc(2).unwrap();
        cdb.subnet_store(2, &store);
        assert!(store.load(&keys::cdb_subnet(2)).unwrap().is_some());
        assert!(store.load(&keys::cdb_subnet(1)).unwrap().is_none());

        cdb.pending_store(&store);
        assert!(store.load(&keys::cdb_subnet(1)).unwrap().is_some());
        assert!(store.load(&keys::cdb_subnet(0)).unwrap().is_none());
    }

    #[test]
    fn test_clear_removes_everything() {
        let (mut cdb, store) = created();
        cdb.node_alloc(&UUID, 0, 1, 0).unwrap();
        cdb.node_store(1, &store);
        cdb.pending_store(&store);
        assert!(!store.is_empty());

        cdb.clear(&store);
        cdb.pending_store(&store);
        assert!(!cdb.is_valid());
        assert_eq!(cdb.nodes().count(), 0);
        assert!(store.is_empty());
    }
}
