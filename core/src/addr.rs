//! Mesh address space and key index helpers
//!
//! Addresses are 16-bit values split into unicast, virtual and group
//! ranges. Key indexes are 12-bit; values above that range only appear at
//! the persistence boundary, where [`KeyRef`] and [`BoundKey`] are mapped to
//! and from their raw encodings.

use serde::{Deserialize, Serialize};

pub const ADDR_UNASSIGNED: u16 = 0x0000;
pub const ADDR_PROXIES: u16 = 0xfffc;
pub const ADDR_FRIENDS: u16 = 0xfffd;
pub const ADDR_RELAYS: u16 = 0xfffe;
pub const ADDR_ALL_NODES: u16 = 0xffff;

/// Send TTL placeholder resolved to the configured default TTL
pub const TTL_DEFAULT: u8 = 0xff;

/// Raw key index meaning "no key" on disk
pub const KEY_UNUSED: u16 = 0xffff;
pub const KEY_DEV_LOCAL: u16 = 0xfffe;
pub const KEY_DEV_REMOTE: u16 = 0xfffd;
pub const KEY_DEV_ANY: u16 = 0xfffc;

/// Highest valid NetKey/AppKey index
pub const KEY_IDX_MAX: u16 = 0x0fff;

pub fn is_unassigned(addr: u16) -> bool {
    addr == ADDR_UNASSIGNED
}

pub fn is_unicast(addr: u16) -> bool {
    addr != ADDR_UNASSIGNED && addr & 0x8000 == 0
}

pub fn is_virtual(addr: u16) -> bool {
    addr & 0xc000 == 0x8000
}

pub fn is_group(addr: u16) -> bool {
    addr & 0xc000 == 0xc000
}

/// Fixed group addresses (0xff00..=0xffff), including the RFU block
pub fn is_fixed_group(addr: u16) -> bool {
    addr >= 0xff00
}

pub fn is_rfu(addr: u16) -> bool {
    (0xff00..ADDR_PROXIES).contains(&addr)
}

pub fn key_idx_valid(idx: u16) -> bool {
    idx <= KEY_IDX_MAX
}

/// Key a received or outgoing message is secured with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyRef {
    App(u16),
    DevLocal,
    DevRemote,
}

impl KeyRef {
    pub fn is_dev_key(&self) -> bool {
        matches!(self, KeyRef::DevLocal | KeyRef::DevRemote)
    }

    pub fn to_raw(self) -> u16 {
        match self {
            KeyRef::App(idx) => idx,
            KeyRef::DevLocal => KEY_DEV_LOCAL,
            KeyRef::DevRemote => KEY_DEV_REMOTE,
        }
    }

    pub fn from_raw(raw: u16) -> Option<Self> {
        match raw {
            KEY_DEV_LOCAL => Some(KeyRef::DevLocal),
            KEY_DEV_REMOTE => Some(KeyRef::DevRemote),
            idx if key_idx_valid(idx) => Some(KeyRef::App(idx)),
            _ => None,
        }
    }
}

/// Key a model is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BoundKey {
    App(u16),
    /// Matches messages secured with either device key
    AnyDevKey,
}

impl BoundKey {
    pub fn accepts(&self, key: KeyRef) -> bool {
        match (self, key) {
            (BoundKey::App(bound), KeyRef::App(idx)) => *bound == idx,
            (BoundKey::AnyDevKey, key) => key.is_dev_key(),
            _ => false,
        }
    }

    pub fn to_raw(self) -> u16 {
        match self {
            BoundKey::App(idx) => idx,
            BoundKey::AnyDevKey => KEY_DEV_ANY,
        }
    }

    pub fn from_raw(raw: u16) -> Option<Self> {
        match raw {
            KEY_DEV_ANY => Some(BoundKey::AnyDevKey),
            idx if key_idx_valid(idx) => Some(BoundKey::App(idx)),
            _ => None,
        }
    }
}
