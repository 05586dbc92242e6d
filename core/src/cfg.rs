//! Node configuration states
//!
//! Relay, secure network beacon, GATT proxy and friend feature states, the
//! default TTL and the network/relay transmit parameters. Changes to a
//! heartbeat-relevant feature are queued for the heartbeat layer, and every
//! change requests a `CFG` store.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error};

use crate::addr;
use crate::config::MeshConfig;
use crate::heartbeat::{FEAT_FRIEND, FEAT_PROXY, FEAT_RELAY};
use crate::settings::keys;
use crate::store::{decode_record, encode_record, SettingsStore, StoreError};

pub const TTL_MAX: u8 = 0x7f;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CfgError {
    #[error("Invalid feature state {0}")]
    InvalidState(u8),
    #[error("Already set")]
    AlreadySet,
    #[error("Invalid TTL {0}")]
    InvalidTtl(u8),
}

/// Pack a transmit count and interval (10 ms steps) into one octet
pub fn transmit(count: u8, interval_ms: u16) -> u8 {
    (count & 0x07) | ((((interval_ms / 10).saturating_sub(1)) as u8) << 3)
}

pub fn transmit_count(xmit: u8) -> u8 {
    xmit & 0x07
}

pub fn transmit_interval(xmit: u8) -> u16 {
    ((xmit >> 3) as u16 + 1) * 10
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FeatureState {
    Disabled = 0,
    Enabled = 1,
    NotSupported = 2,
}

impl FeatureState {
    pub fn from_raw(raw: u8) -> Result<Self, CfgError> {
        match raw {
            0 => Ok(FeatureState::Disabled),
            1 => Ok(FeatureState::Enabled),
            2 => Ok(FeatureState::NotSupported),
            other => Err(CfgError::InvalidState(other)),
        }
    }

    fn from_flag(enabled: bool) -> Self {
        if enabled {
            FeatureState::Enabled
        } else {
            FeatureState::Disabled
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CfgRecord {
    net_transmit: u8,
    relay: u8,
    relay_retransmit: u8,
    beacon: u8,
    gatt_proxy: u8,
    frnd: u8,
    default_ttl: u8,
}

#[derive(Debug, Clone)]
pub struct Cfg {
    net_transmit: u8,
    relay: bool,
    relay_retransmit: u8,
    beacon: bool,
    gatt_proxy: bool,
    friend: bool,
    default_ttl: u8,
    changed_features: u16,
    store_requested: bool,
}

fn feature_set(flag: &mut bool, state: FeatureState) -> Result<(), CfgError> {
    if state == FeatureState::NotSupported {
        return Err(CfgError::InvalidState(state as u8));
    }
    let enable = state == FeatureState::Enabled;
    if *flag == enable {
        return Err(CfgError::AlreadySet);
    }
    *flag = enable;
    Ok(())
}

impl Cfg {
    pub fn new(config: &MeshConfig) -> Self {
        Self {
            net_transmit: config.net_transmit.encode(),
            relay: config.features.relay,
            relay_retransmit: config.relay_retransmit.encode(),
            beacon: config.features.beacon,
            gatt_proxy: config.features.gatt_proxy,
            friend: config.features.friend,
            default_ttl: config.default_ttl,
            changed_features: 0,
            store_requested: false,
        }
    }

    pub fn beacon_enabled(&self) -> bool {
        self.beacon
    }

    pub fn beacon_set(&mut self, beacon: bool) {
        if self.beacon == beacon {
            return;
        }
        self.beacon = beacon;
        self.store_requested = true;
    }

    pub fn gatt_proxy_get(&self) -> FeatureState {
        FeatureState::from_flag(self.gatt_proxy)
    }

    pub fn gatt_proxy_set(&mut self, state: FeatureState) -> Result<(), CfgError> {
        feature_set(&mut self.gatt_proxy, state)?;
        self.feature_changed(FEAT_PROXY);
        Ok(())
    }

    pub fn friend_get(&self) -> FeatureState {
        FeatureState::from_flag(self.friend)
    }

    pub fn friend_set(&mut self, state: FeatureState) -> Result<(), CfgError> {
        feature_set(&mut self.friend, state)?;
        self.feature_changed(FEAT_FRIEND);
        Ok(())
    }

    pub fn relay_get(&self) -> FeatureState {
        FeatureState::from_flag(self.relay)
    }

    pub fn relay_retransmit_get(&self) -> u8 {
        self.relay_retransmit
    }

    /// Set the relay state and retransmit parameters. Only a call that
    /// changes neither is rejected as already set.
    pub fn relay_set(&mut self, state: FeatureState, xmit: u8) -> Result<(), CfgError> {
        match feature_set(&mut self.relay, state) {
            Err(CfgError::AlreadySet) if self.relay_retransmit == xmit => {
                return Err(CfgError::AlreadySet)
            }
            Err(CfgError::AlreadySet) | Ok(()) => {}
            Err(e) => return Err(e),
        }
        self.relay_retransmit = xmit;
        self.feature_changed(FEAT_RELAY);
        Ok(())
    }

    pub fn default_ttl_get(&self) -> u8 {
        self.default_ttl
    }

    pub fn default_ttl_set(&mut self, ttl: u8) -> Result<(), CfgError> {
        if ttl == 1 || ttl > TTL_MAX {
            return Err(CfgError::InvalidTtl(ttl));
        }
        if ttl != self.default_ttl {
            self.default_ttl = ttl;
            self.store_requested = true;
        }
        Ok(())
    }

    pub fn net_transmit_get(&self) -> u8 {
        self.net_transmit
    }

    pub fn net_transmit_set(&mut self, xmit: u8) {
        if self.net_transmit != xmit {
            self.net_transmit = xmit;
            self.store_requested = true;
        }
    }

    /// Whether a fixed group address addresses this node
    pub fn fixed_group_match(&self, dst: u16) -> bool {
        match dst {
            addr::ADDR_ALL_NODES => true,
            addr::ADDR_PROXIES => self.gatt_proxy,
            addr::ADDR_FRIENDS => self.friend,
            addr::ADDR_RELAYS => self.relay,
            _ => false,
        }
    }

    fn feature_changed(&mut self, feat: u16) {
        self.changed_features |= feat;
        self.store_requested = true;
    }

    /// Heartbeat feature bits changed since the last call
    pub fn take_feature_changes(&mut self) -> u16 {
        std::mem::take(&mut self.changed_features)
    }

    pub fn take_store_request(&mut self) -> bool {
        std::mem::take(&mut self.store_requested)
    }

    pub fn pending_store(&self, valid: bool, store: &dyn SettingsStore) {
        if !valid {
            match store.save(keys::CFG, None) {
                Ok(()) => debug!("Cleared configuration"),
                Err(e) => error!("Failed to clear configuration: {}", e),
            }
            return;
        }

        let record = CfgRecord {
            net_transmit: self.net_transmit,
            relay: self.relay_get() as u8,
            relay_retransmit: self.relay_retransmit,
            beacon: self.beacon as u8,
            gatt_proxy: self.gatt_proxy_get() as u8,
            frnd: self.friend_get() as u8,
            default_ttl: self.default_ttl,
        };
        let result = encode_record(&record).and_then(|bytes| store.save(keys::CFG, Some(&bytes)));
        match result {
            Ok(()) => debug!("Stored configuration"),
            Err(e) => error!("Failed to store configuration: {}", e),
        }
    }

    /// Replay a stored configuration through the setters
    pub fn restore(&mut self, value: Option<&[u8]>) -> Result<(), StoreError> {
        let Some(value) = value else {
            debug!("Cleared configuration state");
            return Ok(());
        };
        let record: CfgRecord = decode_record(value)?;

        self.net_transmit_set(record.net_transmit);
        if let Ok(state) = FeatureState::from_raw(record.relay) {
            if let Err(e) = self.relay_set(state, record.relay_retransmit) {
                debug!("Stored relay state not applied: {}", e);
            }
        }
        self.beacon_set(record.beacon != 0);
        if let Ok(state) = FeatureState::from_raw(record.gatt_proxy) {
            if let Err(e) = self.gatt_proxy_set(state) {
                debug!("Stored GATT proxy state not applied: {}", e);
            }
        }
        if let Ok(state) = FeatureState::from_raw(record.frnd) {
            if let Err(e) = self.friend_set(state) {
                debug!("Stored friend state not applied: {}", e);
            }
        }
        if let Err(e) = self.default_ttl_set(record.default_ttl) {
            error!("Ignoring stored default TTL: {}", e);
        }
        debug!("Restored configuration state");
        Ok(())
    }
}
