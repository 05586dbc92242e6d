//! Network layer boundary and node network state
//!
//! Network PDU encryption, obfuscation and lower-transport segmentation are
//! provided by a [`NetworkLayer`] implementation. This module owns the state
//! that layer works against: IV index, sequence number, primary address and
//! device key, the node's subnets, application keys and virtual address
//! labels, together with their persistence.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, error, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::addr::{self, KeyRef};
use crate::crypto::{self, CryptoError, MeshCrypto};
use crate::settings::{keys, PendingFlag, PendingFlags};
use crate::store::{decode_record, encode_record, SettingsStore, StoreError};

/// Sequence numbers are persisted once per this many allocations
pub const SEQ_STORE_RATE: u32 = 128;
pub const SEQ_MAX: u32 = 0x00ff_ffff;

/// Transport control opcode of a heartbeat
pub const CTL_HEARTBEAT: u8 = 0x0a;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetError {
    #[error("Unknown NetKeyIndex 0x{0:03x}")]
    UnknownNetKey(u16),
    #[error("Unknown AppKeyIndex 0x{0:03x}")]
    UnknownAppKey(u16),
    #[error("Key index 0x{0:03x} already in use")]
    AlreadyExists(u16),
    #[error("No free slot")]
    NoFreeSlot,
    #[error("Sequence number space exhausted")]
    SeqExhausted,
    #[error("Malformed PDU")]
    Malformed,
    #[error("Crypto: {0}")]
    Crypto(#[from] CryptoError),
}

/// Interface a PDU arrived on or leaves through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetIf {
    Adv,
    /// GATT proxy connection
    Proxy(u16),
    /// Loopback for messages addressed to this node
    Local,
}

/// Addressing and security context of one message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgCtx {
    pub net_idx: u16,
    /// None for transport control messages
    pub key: Option<KeyRef>,
    /// Remote address: source on receive, destination on send
    pub addr: u16,
    pub recv_dst: u16,
    pub recv_ttl: u8,
    pub send_ttl: u8,
}

impl MsgCtx {
    pub fn to(net_idx: u16, key: KeyRef, dst: u16, ttl: u8) -> Self {
        Self {
            net_idx,
            key: Some(key),
            addr: dst,
            recv_dst: addr::ADDR_UNASSIGNED,
            recv_ttl: 0,
            send_ttl: ttl,
        }
    }

    /// Context of a transport control message
    pub fn control(net_idx: u16, dst: u16, ttl: u8) -> Self {
        Self {
            key: None,
            ..Self::to(net_idx, KeyRef::DevLocal, dst, ttl)
        }
    }
}

/// Decoded network PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetRx {
    pub ctx: MsgCtx,
    pub seq: u32,
    /// Sent under the previous IV index
    pub old_iv: bool,
    /// Transport control message; `payload[0]` is the control opcode
    pub ctl: bool,
    pub net_if: NetIf,
    /// Destination is an address of this node
    pub local_match: bool,
    pub friend_match: bool,
    /// Upper transport payload
    pub payload: Vec<u8>,
}

/// Outgoing network PDU parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetTx {
    pub src: u16,
    pub seq: u32,
    pub ctl: bool,
    pub ctx: MsgCtx,
    /// Packed network transmit parameters
    pub xmit: u8,
}

/// Network PDU codec
pub trait NetworkLayer: Send {
    /// Authenticate and decrypt a network PDU
    fn decode(&self, state: &NetState, net_if: NetIf, pdu: &[u8]) -> Option<NetRx>;

    /// Build a network PDU carrying `payload`
    fn encode(&self, state: &NetState, tx: &NetTx, payload: &[u8]) -> Result<Vec<u8>, NetError>;

    /// Secure network beacon of a subnet
    fn beacon(&self, state: &NetState, sub: &Subnet) -> Option<Vec<u8>>;
}

/// Unencrypted network framing for loopback setups and tests.
///
/// Layout: `iv_lsb, ctl << 7 | ttl, seq[3], src[2], dst[2], net_idx[2],
/// key[2], payload`, all big-endian.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainNetwork;

const PLAIN_HDR_LEN: usize = 13;

impl NetworkLayer for PlainNetwork {
    fn decode(&self, state: &NetState, net_if: NetIf, pdu: &[u8]) -> Option<NetRx> {
        if pdu.len() < PLAIN_HDR_LEN {
            return None;
        }
        let iv_lsb = pdu[0] & 0x01;
        let ctl = pdu[1] & 0x80 != 0;
        let ttl = pdu[1] & 0x7f;
        let seq = u32::from_be_bytes([0, pdu[2], pdu[3], pdu[4]]);
        let src = u16::from_be_bytes([pdu[5], pdu[6]]);
        let dst = u16::from_be_bytes([pdu[7], pdu[8]]);
        let net_idx = u16::from_be_bytes([pdu[9], pdu[10]]);
        let key = match u16::from_be_bytes([pdu[11], pdu[12]]) {
            addr::KEY_UNUSED => None,
            raw => Some(KeyRef::from_raw(raw)?),
        };

        state.subnet_get(net_idx)?;
        if !addr::is_unicast(src) {
            return None;
        }

        let old_iv = iv_lsb != (state.iv_index() & 0x01) as u8;
        let local_match = if addr::is_unicast(dst) {
            state.has_addr(dst)
        } else {
            !addr::is_unassigned(dst) || (ctl && matches!(net_if, NetIf::Proxy(_)))
        };

        Some(NetRx {
            ctx: MsgCtx {
                net_idx,
                key,
                addr: src,
                recv_dst: dst,
                recv_ttl: ttl,
                send_ttl: 0,
            },
            seq,
            old_iv,
            ctl,
            net_if,
            local_match,
            friend_match: false,
            payload: pdu[PLAIN_HDR_LEN..].to_vec(),
        })
    }

    fn encode(&self, state: &NetState, tx: &NetTx, payload: &[u8]) -> Result<Vec<u8>, NetError> {
        if state.subnet_get(tx.ctx.net_idx).is_none() {
            return Err(NetError::UnknownNetKey(tx.ctx.net_idx));
        }
        let mut pdu = Vec::with_capacity(PLAIN_HDR_LEN + payload.len());
        pdu.push((state.iv_index() & 0x01) as u8);
        pdu.push(((tx.ctl as u8) << 7) | (tx.ctx.send_ttl & 0x7f));
        pdu.extend_from_slice(&tx.seq.to_be_bytes()[1..]);
        pdu.extend_from_slice(&tx.src.to_be_bytes());
        pdu.extend_from_slice(&tx.ctx.addr.to_be_bytes());
        pdu.extend_from_slice(&tx.ctx.net_idx.to_be_bytes());
        let key = tx.ctx.key.map_or(addr::KEY_UNUSED, KeyRef::to_raw);
        pdu.extend_from_slice(&key.to_be_bytes());
        pdu.extend_from_slice(payload);
        Ok(pdu)
    }

    fn beacon(&self, state: &NetState, sub: &Subnet) -> Option<Vec<u8>> {
        let mut beacon = vec![0x01, state.beacon_flags(sub)];
        beacon.extend_from_slice(&sub.keys[sub.tx_idx()].net_id);
        beacon.extend_from_slice(&state.iv_index().to_be_bytes());
        Some(beacon)
    }
}

// ============================================================================
// Subnets, application keys and labels
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeIdState {
    Stopped,
    Running,
    NotSupported,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Zeroize, ZeroizeOnDrop)]
pub struct SubnetKeys {
    pub net_key: [u8; 16],
    pub net_id: [u8; 8],
    pub identity: [u8; 16],
}

impl SubnetKeys {
    fn derive(crypto: &dyn MeshCrypto, net_key: &[u8; 16]) -> Result<Self, CryptoError> {
        Ok(Self {
            net_key: *net_key,
            net_id: crypto::k3(crypto, net_key)?,
            identity: crypto::identity_key(crypto, net_key)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subnet {
    pub net_idx: u16,
    pub kr_phase: u8,
    pub keys: [SubnetKeys; 2],
    pub node_id: NodeIdState,
    /// Time node identity advertising was started
    pub node_id_start: u64,
}

impl Subnet {
    /// Index of the key used for transmission
    pub fn tx_idx(&self) -> usize {
        (self.kr_phase == 0x02) as usize
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct AppKey {
    pub app_idx: u16,
    pub net_idx: u16,
    pub updated: bool,
    pub keys: [[u8; 16]; 2],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Label {
    pub uuid: [u8; 16],
    pub addr: u16,
    pub ref_count: u16,
    changed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyChange {
    Store,
    Clear,
}

#[derive(Debug, Serialize, Deserialize)]
struct NetRecord {
    primary_addr: u16,
    dev_key: [u8; 16],
}

#[derive(Debug, Serialize, Deserialize)]
struct IvRecord {
    iv_index: u32,
    iv_update: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct SeqRecord {
    seq: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct NetKeyRecord {
    kr_phase: u8,
    keys: [[u8; 16]; 2],
}

#[derive(Debug, Serialize, Deserialize)]
struct AppKeyRecord {
    net_idx: u16,
    updated: bool,
    keys: [[u8; 16]; 2],
}

#[derive(Debug, Serialize, Deserialize)]
struct VaRecord {
    uuid: [u8; 16],
    addr: u16,
    ref_count: u16,
}

// ============================================================================
// Node network state
// ============================================================================

pub struct NetState {
    iv_index: u32,
    iv_update: bool,
    seq: u32,
    primary_addr: u16,
    elem_count: u8,
    dev_key: [u8; 16],
    valid: bool,
    subnets: Vec<Option<Subnet>>,
    app_keys: Vec<Option<AppKey>>,
    labels: Vec<Option<Label>>,
    subnet_changes: BTreeMap<u16, KeyChange>,
    app_key_changes: BTreeMap<u16, KeyChange>,
    requests: PendingFlags,
}

impl Drop for NetState {
    fn drop(&mut self) {
        self.dev_key.zeroize();
    }
}

impl NetState {
    pub fn new(subnet_count: usize, app_key_count: usize, label_count: usize) -> Self {
        Self {
            iv_index: 0,
            iv_update: false,
            seq: 0,
            primary_addr: addr::ADDR_UNASSIGNED,
            elem_count: 0,
            dev_key: [0; 16],
            valid: false,
            subnets: vec![None; subnet_count],
            app_keys: vec![None; app_key_count],
            labels: vec![None; label_count],
            subnet_changes: BTreeMap::new(),
            app_key_changes: BTreeMap::new(),
            requests: PendingFlags::default(),
        }
    }

    /// Provisioned and holding valid network state
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn set_valid(&mut self, valid: bool) {
        self.valid = valid;
    }

    pub fn iv_index(&self) -> u32 {
        self.iv_index
    }

    pub fn iv_update(&self) -> bool {
        self.iv_update
    }

    pub fn seq(&self) -> u32 {
        self.seq
    }

    pub fn primary_addr(&self) -> u16 {
        self.primary_addr
    }

    pub fn dev_key(&self) -> &[u8; 16] {
        &self.dev_key
    }

    /// Record the element range assigned to this node
    pub fn set_elem_count(&mut self, count: u8) {
        self.elem_count = count;
    }

    /// Whether `addr` is one of this node's element addresses
    pub fn has_addr(&self, addr: u16) -> bool {
        addr::is_unicast(self.primary_addr)
            && addr >= self.primary_addr
            && (addr - self.primary_addr) < self.elem_count as u16
    }

    /// Install the result of provisioning
    pub fn provision(&mut self, primary_addr: u16, dev_key: &[u8; 16], iv_index: u32, iv_update: bool) {
        self.primary_addr = primary_addr;
        self.dev_key = *dev_key;
        self.iv_index = iv_index;
        self.iv_update = iv_update;
        self.seq = 0;
        self.requests.set(PendingFlag::Net);
        self.requests.set(PendingFlag::Iv);
        self.requests.set(PendingFlag::Seq);
    }

    /// Forget everything; persisted state is cleared on the next flush
    pub fn reset(&mut self) {
        let net_idxs: Vec<u16> = self.subnets().map(|s| s.net_idx).collect();
        for net_idx in net_idxs {
            self.subnet_del(net_idx);
        }
        let app_idxs: Vec<u16> = self.app_keys().map(|k| k.app_idx).collect();
        for app_idx in app_idxs {
            let _ = self.app_key_del(app_idx);
        }
        for label in self.labels.iter_mut().flatten() {
            label.ref_count = 0;
            label.changed = true;
        }
        self.valid = false;
        self.primary_addr = addr::ADDR_UNASSIGNED;
        self.elem_count = 0;
        self.dev_key.zeroize();
        self.iv_index = 0;
        self.iv_update = false;
        self.seq = 0;
        for flag in [PendingFlag::Net, PendingFlag::Iv, PendingFlag::Seq, PendingFlag::Va] {
            self.requests.set(flag);
        }
    }

    /// Allocate the next sequence number for an outgoing PDU
    pub fn next_seq(&mut self) -> Result<u32, NetError> {
        if self.seq > SEQ_MAX {
            return Err(NetError::SeqExhausted);
        }
        let seq = self.seq;
        self.seq += 1;
        if self.seq % SEQ_STORE_RATE == 0 {
            self.requests.set(PendingFlag::Seq);
        }
        Ok(seq)
    }

    /// Move to a new IV index or IV update state. Returns true if the IV
    /// index itself changed, which resets the sequence number.
    pub fn iv_set(&mut self, iv_index: u32, iv_update: bool) -> bool {
        let changed = iv_index != self.iv_index;
        self.iv_index = iv_index;
        self.iv_update = iv_update;
        if changed && !iv_update {
            self.seq = 0;
            self.requests.set(PendingFlag::Seq);
        }
        self.requests.set(PendingFlag::Iv);
        changed
    }

    pub fn beacon_flags(&self, sub: &Subnet) -> u8 {
        let mut flags = 0;
        if sub.kr_phase == 0x02 {
            flags |= 0x01;
        }
        if self.iv_update {
            flags |= 0x02;
        }
        flags
    }

    // ------------------------------------------------------------------------
    // Subnets
    // ------------------------------------------------------------------------

    pub fn subnet_add(
        &mut self,
        crypto: &dyn MeshCrypto,
        net_idx: u16,
        net_key: &[u8; 16],
    ) -> Result<&mut Subnet, NetError> {
        if self.subnet_get(net_idx).is_some() {
            return Err(NetError::AlreadyExists(net_idx));
        }
        let keys = SubnetKeys::derive(crypto, net_key)?;
        let slot = self
            .subnets
            .iter_mut()
            .find(|s| s.is_none())
            .ok_or(NetError::NoFreeSlot)?;
        self.subnet_changes.insert(net_idx, KeyChange::Store);
        self.requests.set(PendingFlag::NetKeys);
        debug!("NetKeyIndex 0x{:03x} added", net_idx);
        Ok(slot.insert(Subnet {
            net_idx,
            kr_phase: 0,
            keys: [keys, SubnetKeys::default()],
            node_id: NodeIdState::Stopped,
            node_id_start: 0,
        }))
    }

    pub fn subnet_del(&mut self, net_idx: u16) {
        let Some(slot) = self
            .subnets
            .iter_mut()
            .find(|s| matches!(s, Some(s) if s.net_idx == net_idx))
        else {
            return;
        };
        *slot = None;
        self.subnet_changes.insert(net_idx, KeyChange::Clear);
        self.requests.set(PendingFlag::NetKeys);

        let bound: Vec<u16> = self
            .app_keys()
            .filter(|k| k.net_idx == net_idx)
            .map(|k| k.app_idx)
            .collect();
        for app_idx in bound {
            let _ = self.app_key_del(app_idx);
        }
    }

    pub fn subnet_get(&self, net_idx: u16) -> Option<&Subnet> {
        self.subnets().find(|s| s.net_idx == net_idx)
    }

    pub fn subnet_get_mut(&mut self, net_idx: u16) -> Option<&mut Subnet> {
        self.subnets
            .iter_mut()
            .flatten()
            .find(|s| s.net_idx == net_idx)
    }

    pub fn subnets(&self) -> impl Iterator<Item = &Subnet> {
        self.subnets.iter().flatten()
    }

    pub fn subnets_mut(&mut self) -> impl Iterator<Item = &mut Subnet> {
        self.subnets.iter_mut().flatten()
    }

    pub fn subnet_count(&self) -> usize {
        self.subnets().count()
    }

    // ------------------------------------------------------------------------
    // Application keys
    // ------------------------------------------------------------------------

    pub fn app_key_add(&mut self, app_idx: u16, net_idx: u16, key: &[u8; 16]) -> Result<(), NetError> {
        if self.subnet_get(net_idx).is_none() {
            return Err(NetError::UnknownNetKey(net_idx));
        }
        if self.app_key_get(app_idx).is_some() {
            return Err(NetError::AlreadyExists(app_idx));
        }
        let slot = self
            .app_keys
            .iter_mut()
            .find(|k| k.is_none())
            .ok_or(NetError::NoFreeSlot)?;
        *slot = Some(AppKey {
            app_idx,
            net_idx,
            updated: false,
            keys: [*key, [0; 16]],
        });
        self.app_key_changes.insert(app_idx, KeyChange::Store);
        self.requests.set(PendingFlag::AppKeys);
        debug!("AppKeyIndex 0x{:03x} added", app_idx);
        Ok(())
    }

    pub fn app_key_del(&mut self, app_idx: u16) -> Result<(), NetError> {
        let slot = self
            .app_keys
            .iter_mut()
            .find(|k| matches!(k, Some(k) if k.app_idx == app_idx))
            .ok_or(NetError::UnknownAppKey(app_idx))?;
        *slot = None;
        self.app_key_changes.insert(app_idx, KeyChange::Clear);
        self.requests.set(PendingFlag::AppKeys);
        Ok(())
    }

    pub fn app_key_get(&self, app_idx: u16) -> Option<&AppKey> {
        self.app_keys().find(|k| k.app_idx == app_idx)
    }

    pub fn app_key_exists(&self, app_idx: u16) -> bool {
        self.app_key_get(app_idx).is_some()
    }

    pub fn app_keys(&self) -> impl Iterator<Item = &AppKey> {
        self.app_keys.iter().flatten()
    }

    // ------------------------------------------------------------------------
    // Virtual address labels
    // ------------------------------------------------------------------------

    /// Reference a Label UUID, returning its virtual address
    pub fn va_add(&mut self, crypto: &dyn MeshCrypto, uuid: &[u8; 16]) -> Result<u16, NetError> {
        if let Some(label) = self
            .labels
            .iter_mut()
            .flatten()
            .find(|l| l.ref_count > 0 && l.uuid == *uuid)
        {
            label.ref_count += 1;
            label.changed = true;
            self.requests.set(PendingFlag::Va);
            return Ok(label.addr);
        }

        let addr = crypto::virtual_addr(crypto, uuid)?;
        let slot = self
            .labels
            .iter_mut()
            .find(|l| !matches!(l, Some(l) if l.ref_count > 0))
            .ok_or(NetError::NoFreeSlot)?;
        *slot = Some(Label {
            uuid: *uuid,
            addr,
            ref_count: 1,
            changed: true,
        });
        self.requests.set(PendingFlag::Va);
        Ok(addr)
    }

    /// Drop one reference to a Label UUID
    pub fn va_del(&mut self, uuid: &[u8; 16]) -> Option<u16> {
        let label = self
            .labels
            .iter_mut()
            .flatten()
            .find(|l| l.ref_count > 0 && l.uuid == *uuid)?;
        label.ref_count -= 1;
        label.changed = true;
        let addr = label.addr;
        self.requests.set(PendingFlag::Va);
        Some(addr)
    }

    pub fn label_uuid(&self, addr: u16) -> Option<&[u8; 16]> {
        self.labels
            .iter()
            .flatten()
            .find(|l| l.ref_count > 0 && l.addr == addr)
            .map(|l| &l.uuid)
    }

    // ------------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------------

    /// Store categories requested since the last call
    pub fn take_store_requests(&mut self) -> PendingFlags {
        std::mem::take(&mut self.requests)
    }

    pub fn pending_net_store(&self, store: &dyn SettingsStore) {
        if self.valid {
            let record = NetRecord {
                primary_addr: self.primary_addr,
                dev_key: self.dev_key,
            };
            save_record(store, keys::NET, &record);
        } else {
            clear_record(store, keys::NET);
        }
    }

    pub fn pending_iv_store(&self, store: &dyn SettingsStore) {
        if self.valid {
            let record = IvRecord {
                iv_index: self.iv_index,
                iv_update: self.iv_update,
            };
            save_record(store, keys::IV, &record);
        } else {
            clear_record(store, keys::IV);
        }
    }

    /// The stored value is the next sequence number a restart may use
    pub fn pending_seq_store(&self, store: &dyn SettingsStore) {
        if self.valid {
            save_record(store, keys::SEQ, &SeqRecord { seq: self.seq });
        } else {
            clear_record(store, keys::SEQ);
        }
    }

    pub fn pending_net_keys_store(&mut self, store: &dyn SettingsStore) {
        let changes = std::mem::take(&mut self.subnet_changes);
        for (net_idx, change) in changes {
            let sub = self.subnet_get(net_idx);
            match (change, sub) {
                (KeyChange::Store, Some(sub)) if self.valid => {
                    let record = NetKeyRecord {
                        kr_phase: sub.kr_phase,
                        keys: [sub.keys[0].net_key, sub.keys[1].net_key],
                    };
                    save_record(store, &keys::net_key(net_idx), &record);
                }
                _ => clear_record(store, &keys::net_key(net_idx)),
            }
        }
    }

    pub fn pending_app_keys_store(&mut self, store: &dyn SettingsStore) {
        let changes = std::mem::take(&mut self.app_key_changes);
        for (app_idx, change) in changes {
            let key = self.app_key_get(app_idx);
            match (change, key) {
                (KeyChange::Store, Some(key)) if self.valid => {
                    let record = AppKeyRecord {
                        net_idx: key.net_idx,
                        updated: key.updated,
                        keys: key.keys,
                    };
                    save_record(store, &keys::app_key(app_idx), &record);
                }
                _ => clear_record(store, &keys::app_key(app_idx)),
            }
        }
    }

    pub fn pending_va_store(&mut self, store: &dyn SettingsStore) {
        for (idx, slot) in self.labels.iter_mut().enumerate() {
            let Some(label) = slot else {
                continue;
            };
            if !std::mem::take(&mut label.changed) {
                continue;
            }
            let path = keys::label(idx as u16);
            if label.ref_count > 0 {
                let record = VaRecord {
                    uuid: label.uuid,
                    addr: label.addr,
                    ref_count: label.ref_count,
                };
                save_record(store, &path, &record);
            } else {
                clear_record(store, &path);
                *slot = None;
            }
        }
    }

    pub fn restore_net(&mut self, value: Option<&[u8]>) -> Result<(), StoreError> {
        let Some(value) = value else {
            self.primary_addr = addr::ADDR_UNASSIGNED;
            self.dev_key.zeroize();
            return Ok(());
        };
        let record: NetRecord = decode_record(value)?;
        self.primary_addr = record.primary_addr;
        self.dev_key = record.dev_key;
        debug!("Restored primary address 0x{:04x}", record.primary_addr);
        Ok(())
    }

    pub fn restore_iv(&mut self, value: Option<&[u8]>) -> Result<(), StoreError> {
        let Some(value) = value else {
            self.iv_index = 0;
            self.iv_update = false;
            return Ok(());
        };
        let record: IvRecord = decode_record(value)?;
        self.iv_index = record.iv_index;
        self.iv_update = record.iv_update;
        debug!("Restored IV index 0x{:08x} update {}", record.iv_index, record.iv_update);
        Ok(())
    }

    /// Resume past every sequence number that may have been used before
    /// the last store.
    pub fn restore_seq(&mut self, value: Option<&[u8]>) -> Result<(), StoreError> {
        let Some(value) = value else {
            self.seq = 0;
            return Ok(());
        };
        let record: SeqRecord = decode_record(value)?;
        self.seq = record.seq.saturating_add(SEQ_STORE_RATE);
        if self.seq > SEQ_MAX {
            warn!("Restored sequence number 0x{:06x} exhausted", self.seq);
        }
        self.requests.set(PendingFlag::Seq);
        Ok(())
    }

    pub fn restore_net_key(
        &mut self,
        crypto: &dyn MeshCrypto,
        net_idx: u16,
        value: Option<&[u8]>,
    ) -> Result<(), StoreError> {
        let Some(value) = value else {
            if let Some(slot) = self
                .subnets
                .iter_mut()
                .find(|s| matches!(s, Some(s) if s.net_idx == net_idx))
            {
                *slot = None;
            }
            return Ok(());
        };
        let record: NetKeyRecord = decode_record(value)?;
        let crypto_err = |e: CryptoError| StoreError::Decode(e.to_string());

        if self.subnet_get(net_idx).is_none() {
            self.subnet_add(crypto, net_idx, &record.keys[0])
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            // Restoring is not a change
            self.subnet_changes.remove(&net_idx);
        }
        let new_keys = if record.kr_phase != 0 {
            SubnetKeys::derive(crypto, &record.keys[1]).map_err(crypto_err)?
        } else {
            SubnetKeys::default()
        };
        let old_keys = SubnetKeys::derive(crypto, &record.keys[0]).map_err(crypto_err)?;
        if let Some(sub) = self.subnet_get_mut(net_idx) {
            sub.kr_phase = record.kr_phase;
            sub.keys = [old_keys, new_keys];
        }
        debug!("Restored NetKeyIndex 0x{:03x}", net_idx);
        Ok(())
    }

    pub fn restore_app_key(&mut self, app_idx: u16, value: Option<&[u8]>) -> Result<(), StoreError> {
        let Some(value) = value else {
            let _ = self.app_key_del(app_idx);
            self.app_key_changes.remove(&app_idx);
            return Ok(());
        };
        let record: AppKeyRecord = decode_record(value)?;
        let idx = self
            .app_keys
            .iter()
            .position(|k| matches!(k, Some(k) if k.app_idx == app_idx))
            .or_else(|| self.app_keys.iter().position(Option::is_none))
            .ok_or_else(|| StoreError::Backend("AppKey table full".to_string()))?;
        self.app_keys[idx] = Some(AppKey {
            app_idx,
            net_idx: record.net_idx,
            updated: record.updated,
            keys: record.keys,
        });
        debug!("Restored AppKeyIndex 0x{:03x}", app_idx);
        Ok(())
    }

    pub fn restore_label(&mut self, idx: u16, value: Option<&[u8]>) -> Result<(), StoreError> {
        let Some(slot) = self.labels.get_mut(idx as usize) else {
            error!("Invalid label index 0x{:x}", idx);
            return Err(StoreError::InvalidKey(keys::label(idx)));
        };
        let Some(value) = value else {
            *slot = None;
            return Ok(());
        };
        let record: VaRecord = decode_record(value)?;
        *slot = Some(Label {
            uuid: record.uuid,
            addr: record.addr,
            ref_count: record.ref_count,
            changed: false,
        });
        debug!("Restored virtual address 0x{:04x}", record.addr);
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
