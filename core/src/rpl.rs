//! Replay protection list
//!
//! Fixed-size table of the last sequence number seen per source address.
//! Accepted sequence numbers must strictly increase within one IV index,
//! and nothing under the previous IV index is accepted from a source once
//! it has been heard on the current one. A full table fails closed.

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::addr;
use crate::settings::keys;
use crate::store::{decode_record, encode_record, SettingsStore, StoreError};

/// Persisted form of one entry, keyed by `bt_mesh/RPL/<src>`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RplRecord {
    pub seq: u32,
    pub old_iv: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RplEntry {
    pub src: u16,
    /// 24-bit sequence number
    pub seq: u32,
    /// Entry was last updated under the previous IV index
    pub old_iv: bool,
    /// SeqZero of the last segmented message from this source
    pub seg: u32,
}

/// Replay-relevant view of a received network PDU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RplRx {
    pub src: u16,
    pub seq: u32,
    pub old_iv: bool,
    /// Received on the local interface (sent by this node)
    pub local_if: bool,
    /// Destination matched this node
    pub local_match: bool,
}

/// Slot a deferred check resolved to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RplSlot(usize);

#[derive(Debug)]
pub struct Rpl {
    entries: Vec<Option<RplEntry>>,
    store: Vec<bool>,
    store_requested: bool,
}

impl Rpl {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: vec![None; capacity],
            store: vec![false; capacity],
            store_requested: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, src: u16) -> Option<&RplEntry> {
        self.entries.iter().flatten().find(|e| e.src == src)
    }

    pub fn entries(&self) -> impl Iterator<Item = &RplEntry> {
        self.entries.iter().flatten()
    }

    /// Check `rx` and commit it immediately if accepted.
    ///
    /// Returns true if the message is a replay.
    pub fn check(&mut self, rx: &RplRx) -> bool {
        match self.lookup(rx) {
            Ok(Some(slot)) => {
                self.update(slot, rx);
                false
            }
            Ok(None) => false,
            Err(()) => true,
        }
    }

    /// Check `rx` without committing; the caller commits with [`Rpl::update`]
    /// once the message (e.g. all of its segments) has been processed.
    ///
    /// `Err(())` means replay; `Ok(None)` means the RPL does not apply.
    pub fn check_deferred(&mut self, rx: &RplRx) -> Result<Option<RplSlot>, ()> {
        self.lookup(rx)
    }

    fn lookup(&mut self, rx: &RplRx) -> Result<Option<RplSlot>, ()> {
        // Don't bother checking messages from ourselves
        if rx.local_if {
            return Ok(None);
        }
        // The RPL is used only for the local node
        if !rx.local_match {
            return Ok(None);
        }

        if let Some(idx) = self
            .entries
            .iter()
            .position(|e| matches!(e, Some(e) if e.src == rx.src))
        {
            let entry = self.entries[idx].as_ref().ok_or(())?;
            if rx.old_iv && !entry.old_iv {
                debug!("Replay from 0x{:04x}: old IV after new", rx.src);
                return Err(());
            }
            if (!rx.old_iv && entry.old_iv) || entry.seq < rx.seq {
                return Ok(Some(RplSlot(idx)));
            }
            debug!(
                "Replay from 0x{:04x}: seq 0x{:06x} <= 0x{:06x}",
                rx.src, rx.seq, entry.seq
            );
            return Err(());
        }

        match self.entries.iter().position(Option::is_none) {
            Some(idx) => Ok(Some(RplSlot(idx))),
            None => {
                error!("RPL is full!");
                Err(())
            }
        }
    }

    /// Commit `rx` into `slot`
    pub fn update(&mut self, slot: RplSlot, rx: &RplRx) {
        let RplSlot(idx) = slot;
        let seg = match &self.entries[idx] {
            // First message on the new IV index resets the segment state
            Some(prev) if prev.src == rx.src && !(prev.old_iv && !rx.old_iv) => prev.seg,
            _ => 0,
        };
        self.entries[idx] = Some(RplEntry {
            src: rx.src,
            seq: rx.seq,
            old_iv: rx.old_iv,
            seg,
        });
        self.schedule_entry_store(idx);
    }

    pub fn set_seg(&mut self, src: u16, seg: u32) {
        if let Some(entry) = self.entries.iter_mut().flatten().find(|e| e.src == src) {
            entry.seg = seg;
        }
    }

    /// IV index changed: drop entries already on the old IV, age the rest.
    pub fn reset(&mut self, store: &dyn SettingsStore) {
        for idx in 0..self.entries.len() {
            let Some(entry) = self.entries[idx].as_mut() else {
                continue;
            };
            if entry.old_iv {
                let src = entry.src;
                self.clear_entry(idx, src, store);
            } else {
                entry.old_iv = true;
                self.schedule_entry_store(idx);
            }
        }
    }

    /// Forget every entry; persisted entries are cleared on the next flush.
    pub fn clear(&mut self) {
        self.store_requested = true;
    }

    /// True once after any change that needs the RPL flag scheduled
    pub fn take_store_request(&mut self) -> bool {
        std::mem::take(&mut self.store_requested)
    }

    /// Flush pending entries. `addr` is a unicast source or all-nodes.
    ///
    /// A valid (provisioned) node stores dirty entries; otherwise entries
    /// are erased from the store and memory.
    pub fn pending_store(&mut self, addr: u16, valid: bool, store: &dyn SettingsStore) {
        if !addr::is_unicast(addr) && addr != addr::ADDR_ALL_NODES {
            return;
        }

        for idx in 0..self.entries.len() {
            let Some(entry) = self.entries[idx] else {
                continue;
            };
            if addr != addr::ADDR_ALL_NODES && addr != entry.src {
                continue;
            }
            if valid {
                if std::mem::take(&mut self.store[idx]) {
                    store_entry(&entry, store);
                }
            } else {
                self.clear_entry(idx, entry.src, store);
            }
            if addr != addr::ADDR_ALL_NODES {
                break;
            }
        }
    }

    /// Restore one persisted entry; `None` deletes it.
    pub fn restore(&mut self, src: u16, value: Option<&[u8]>) -> Result<(), StoreError> {
        let existing = self
            .entries
            .iter()
            .position(|e| matches!(e, Some(e) if e.src == src));

        let Some(value) = value else {
            match existing {
                Some(idx) => self.entries[idx] = None,
                None => warn!("Unable to find RPL entry for 0x{:04x}", src),
            }
            return Ok(());
        };

        let record: RplRecord = decode_record(value)?;
        let idx = match existing.or_else(|| self.entries.iter().position(Option::is_none)) {
            Some(idx) => idx,
            None => {
                error!("Unable to allocate RPL entry for 0x{:04x}", src);
                return Err(StoreError::Backend("RPL full".to_string()));
            }
        };
        self.entries[idx] = Some(RplEntry {
            src,
            seq: record.seq,
            old_iv: record.old_iv,
            seg: 0,
        });
        debug!(
            "RPL entry for 0x{:04x}: Seq 0x{:06x} old_iv {}",
            src, record.seq, record.old_iv
        );
        Ok(())
    }

    fn schedule_entry_store(&mut self, idx: usize) {
        self.store[idx] = true;
        self.store_requested = true;
    }

    fn clear_entry(&mut self, idx: usize, src: u16, store: &dyn SettingsStore) {
        match store.save(&keys::rpl(src), None) {
            Ok(()) => debug!("Cleared RPL 0x{:04x}", src),
            Err(e) => error!("Failed to clear RPL 0x{:04x}: {}", src, e),
        }
        self.entries[idx] = None;
        self.store[idx] = false;
    }
}

fn store_entry(entry: &RplEntry, store: &dyn SettingsStore) {
    let record = RplRecord {
        seq: entry.seq,
        old_iv: entry.old_iv,
    };
    let result = encode_record(&record).and_then(|bytes| store.save(&keys::rpl(entry.src), Some(&bytes)));
    match result {
        Ok(()) => debug!("Stored RPL 0x{:04x}", entry.src),
        Err(e) => error!("Failed to store RPL 0x{:04x}: {}", entry.src, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn rx(src: u16, seq: u32, old_iv: bool) -> RplRx {
        RplRx {
            src,
            seq,
            old_iv,
            local_if: false,
            local_match: true,
        }
    }

    #[test]
    fn test_increasing_seq_accepted() {
        let mut rpl = Rpl::new(4);
        assert!(!rpl.check(&rx(4, 10, false)));
        assert!(rpl.check(&rx(4, 9, false)));
        assert!(rpl.check(&rx(4, 10, false)));
        assert!(!rpl.check(&rx(4, 11, false)));
        assert_eq!(rpl.get(4).map(|e| e.seq), Some(11));
    }

    #[test]
    fn test_old_iv_rejected_after_new() {
        let mut rpl = Rpl::new(4);
        assert!(!rpl.check(&rx(4, 10, false)));
        assert!(rpl.check(&rx(4, 1000, true)));
    }

    #[test]
    fn test_new_iv_accepted_after_old_with_lower_seq() {
        let mut rpl = Rpl::new(4);
        assert!(!rpl.check(&rx(4, 500, true)));
        assert!(!rpl.check(&rx(4, 1, false)));
        assert!(!rpl.get(4).unwrap().old_iv);
    }

    #[test]
    fn test_local_and_unmatched_messages_skip_rpl() {
        let mut rpl = Rpl::new(1);
        let mut local = rx(4, 1, false);
        local.local_if = true;
        assert!(!rpl.check(&local));
        assert!(!rpl.check(&local));

        let mut relayed = rx(5, 1, false);
        relayed.local_match = false;
        assert!(!rpl.check(&relayed));
        assert_eq!(rpl.entries().count(), 0);
    }

    #[test]
    fn test_full_table_fails_closed() {
        let mut rpl = Rpl::new(2);
        assert!(!rpl.check(&rx(1, 1, false)));
        assert!(!rpl.check(&rx(2, 1, false)));
        assert!(rpl.check(&rx(3, 1, false)));
        // Known sources keep working
        assert!(!rpl.check(&rx(1, 2, false)));
    }

    #[test]
    fn test_deferred_check_commits_only_on_update() {
        let mut rpl = Rpl::new(2);
        let msg = rx(7, 20, false);
        let slot = rpl.check_deferred(&msg).unwrap().unwrap();
        assert!(rpl.get(7).is_none());
        rpl.update(slot, &msg);
        assert_eq!(rpl.get(7).map(|e| e.seq), Some(20));
        assert!(rpl.check_deferred(&msg).is_err());
    }

    #[test]
    fn test_update_resets_seg_on_iv_transition() {
        let mut rpl = Rpl::new(2);
        assert!(!rpl.check(&rx(7, 20, true)));
        rpl.set_seg(7, 0x55);
        assert!(!rpl.check(&rx(7, 21, true)));
        assert_eq!(rpl.get(7).unwrap().seg, 0x55);
        assert!(!rpl.check(&rx(7, 1, false)));
        assert_eq!(rpl.get(7).unwrap().seg, 0);
    }

    #[test]
    fn test_reset_drops_old_and_ages_current() {
        let store = MemoryStore::new();
        let mut rpl = Rpl::new(4);
        assert!(!rpl.check(&rx(1, 5, true)));
        assert!(!rpl.check(&rx(2, 5, false)));
        rpl.pending_store(addr::ADDR_ALL_NODES, true, &store);
        assert_eq!(store.len(), 2);

        rpl.reset(&store);
        assert!(rpl.get(1).is_none());
        assert!(rpl.get(2).unwrap().old_iv);
        assert!(store.load(&keys::rpl(1)).unwrap().is_none());
        assert!(rpl.take_store_request());
    }

    #[test]
    fn test_hole_after_reset_does_not_hide_existing_entry() {
        let store = MemoryStore::new();
        let mut rpl = Rpl::new(3);
        assert!(!rpl.check(&rx(1, 5, true)));
        assert!(!rpl.check(&rx(2, 5, false)));
        rpl.reset(&store);
        // Slot 0 is now empty; source 2 still lives in slot 1
        assert!(rpl.check(&rx(2, 4, true)));
        assert!(!rpl.check(&rx(2, 6, false)));
    }

    #[test]
    fn test_pending_store_and_restore() {
        let store = MemoryStore::new();
        let mut rpl = Rpl::new(4);
        assert!(!rpl.check(&rx(0x10, 0x123456, false)));
        assert!(rpl.take_store_request());
        rpl.pending_store(addr::ADDR_ALL_NODES, true, &store);

        let value = store.load(&keys::rpl(0x10)).unwrap().unwrap();
        let mut restored = Rpl::new(4);
        restored.restore(0x10, Some(&value)).unwrap();
        assert_eq!(restored.get(0x10).map(|e| e.seq), Some(0x123456));
        assert!(restored.check(&rx(0x10, 0x123456, false)));

        restored.restore(0x10, None).unwrap();
        assert!(restored.get(0x10).is_none());
    }

    #[test]
    fn test_pending_store_when_invalid_clears() {
        let store = MemoryStore::new();
        let mut rpl = Rpl::new(4);
        assert!(!rpl.check(&rx(0x10, 1, false)));
        rpl.pending_store(addr::ADDR_ALL_NODES, true, &store);
        assert_eq!(store.len(), 1);

        rpl.pending_store(addr::ADDR_ALL_NODES, false, &store);
        assert!(store.is_empty());
        assert_eq!(rpl.entries().count(), 0);
    }

    #[test]
    fn test_restore_rejects_malformed_value() {
        let mut rpl = Rpl::new(4);
        assert!(rpl.restore(0x10, Some(&[1, 2])).is_err());
    }
}
