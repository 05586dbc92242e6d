//! Deferred, coalesced persistence of mesh state
//!
//! Components mark a category dirty with [`Settings::schedule_store`]; a
//! single delayed work item later drains every dirty category in
//! [`FLUSH_ORDER`]. Immediate categories (net, IV, seq, CDB) flush on the
//! next scheduler pass, a lone RPL update uses its own short timeout, and
//! everything else waits for the generic store timeout. A later request can
//! only pull the flush earlier.

pub mod keys;

pub use keys::SettingsKey;

use tracing::debug;

use crate::scheduler::{Scheduler, Work};

/// Category of pending state to persist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PendingFlag {
    Rpl = 0,
    NetKeys,
    AppKeys,
    Net,
    Iv,
    Seq,
    HbPub,
    Cfg,
    Mod,
    Va,
    Cdb,
}

/// Order in which pending categories are drained
pub const FLUSH_ORDER: [PendingFlag; 11] = [
    PendingFlag::Rpl,
    PendingFlag::NetKeys,
    PendingFlag::AppKeys,
    PendingFlag::Net,
    PendingFlag::Iv,
    PendingFlag::Seq,
    PendingFlag::HbPub,
    PendingFlag::Cfg,
    PendingFlag::Mod,
    PendingFlag::Va,
    PendingFlag::Cdb,
];

impl PendingFlag {
    fn bit(self) -> u16 {
        1 << self as u8
    }
}

/// Bitset of pending categories
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingFlags(u16);

const NO_WAIT_BITS: u16 = (1 << PendingFlag::Net as u8)
    | (1 << PendingFlag::Iv as u8)
    | (1 << PendingFlag::Seq as u8)
    | (1 << PendingFlag::Cdb as u8);

const GENERIC_BITS: u16 = (1 << PendingFlag::NetKeys as u8)
    | (1 << PendingFlag::AppKeys as u8)
    | (1 << PendingFlag::HbPub as u8)
    | (1 << PendingFlag::Cfg as u8)
    | (1 << PendingFlag::Mod as u8)
    | (1 << PendingFlag::Va as u8);

impl PendingFlags {
    pub fn set(&mut self, flag: PendingFlag) {
        self.0 |= flag.bit();
    }

    pub fn clear(&mut self, flag: PendingFlag) {
        self.0 &= !flag.bit();
    }

    pub fn contains(&self, flag: PendingFlag) -> bool {
        self.0 & flag.bit() != 0
    }

    pub fn test_and_clear(&mut self, flag: PendingFlag) -> bool {
        let was_set = self.contains(flag);
        self.clear(flag);
        was_set
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    fn any(&self, mask: u16) -> bool {
        self.0 & mask != 0
    }
}

/// Pending-store bookkeeping for one stack instance
#[derive(Debug, Clone)]
pub struct Settings {
    flags: PendingFlags,
    store_timeout_ms: u64,
    rpl_timeout_ms: Option<u64>,
}

impl Settings {
    pub fn new(store_timeout_ms: u32, rpl_timeout_ms: Option<u32>) -> Self {
        Self {
            flags: PendingFlags::default(),
            store_timeout_ms: store_timeout_ms as u64,
            rpl_timeout_ms: rpl_timeout_ms.map(u64::from),
        }
    }

    /// Delay the flush would use for the currently pending categories
    pub fn timeout(&self) -> u64 {
        if self.flags.any(NO_WAIT_BITS) {
            return 0;
        }
        match self.rpl_timeout_ms {
            Some(rpl) if self.flags.contains(PendingFlag::Rpl) && !self.flags.any(GENERIC_BITS) => {
                rpl
            }
            _ => self.store_timeout_ms,
        }
    }

    pub fn schedule_store(&mut self, flag: PendingFlag, sched: &mut Scheduler) {
        self.flags.set(flag);
        let timeout = self.timeout();
        let remaining = sched.reschedule_earlier(Work::SettingsStore, timeout);
        debug!(
            "Store {:?} pending, waiting {} ms vs requested {} ms",
            flag, remaining, timeout
        );
    }

    pub fn cancel(&mut self, flag: PendingFlag) {
        self.flags.clear(flag);
    }

    /// Claim `flag` for flushing; the caller runs the flush right after.
    pub fn take(&mut self, flag: PendingFlag) -> bool {
        self.flags.test_and_clear(flag)
    }

    pub fn pending(&self) -> PendingFlags {
        self.flags
    }
}
