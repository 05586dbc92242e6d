//! Construction-time mesh configuration
//!
//! Capacities and timeouts that a firmware build would fix at compile time:
//! - Table sizes (RPL, CDB, proxy clients and filters, ADV buffers)
//! - Settings flush timeouts (generic and RPL-specific)
//! - Advertising bearer variant and controller generation
//! - Default feature states for the configuration server

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::adv::AdvVariant;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Errors that can occur during configuration validation
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Capacity '{0}' must be non-zero")]
    ZeroCapacity(&'static str),

    #[error("Invalid default TTL: must be 0 or 2-127, got {0}")]
    InvalidDefaultTtl(u8),

    #[error("Invalid transmit interval: must be 10-320ms in 10ms steps, got {0}")]
    InvalidTransmitInterval(u16),

    #[error("Invalid transmit count: must be 0-7, got {0}")]
    InvalidTransmitCount(u8),

    #[error("RPL store timeout {rpl}ms exceeds generic store timeout {generic}ms")]
    RplTimeoutTooLong { rpl: u32, generic: u32 },

    #[error("Unable to read configuration: {0}")]
    Io(String),

    #[error("Unable to parse configuration: {0}")]
    Parse(String),
}

// ============================================================================
// FEATURE DEFAULTS
// ============================================================================

/// Feature states a freshly provisioned node starts with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureDefaults {
    pub relay: bool,
    pub beacon: bool,
    pub gatt_proxy: bool,
    pub friend: bool,
}

impl Default for FeatureDefaults {
    fn default() -> Self {
        Self {
            relay: true,
            beacon: true,
            gatt_proxy: true,
            friend: false,
        }
    }
}

/// Count/interval pair for network and relay retransmission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransmitParams {
    /// Number of retransmissions beyond the first (0-7)
    pub count: u8,
    /// Interval between transmissions in milliseconds (10-320)
    pub interval_ms: u16,
}

impl TransmitParams {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.count > 7 {
            return Err(ConfigError::InvalidTransmitCount(self.count));
        }
        if self.interval_ms < 10 || self.interval_ms > 320 || self.interval_ms % 10 != 0 {
            return Err(ConfigError::InvalidTransmitInterval(self.interval_ms));
        }
        Ok(())
    }

    /// Packed network transmit state: count in the low 3 bits, 10ms steps above
    pub fn encode(&self) -> u8 {
        crate::cfg::transmit(self.count, self.interval_ms)
    }
}

// ============================================================================
// MESH CONFIG
// ============================================================================

/// Mesh stack configuration
///
/// Every capacity must be non-zero. The RPL-specific store timeout, when
/// present, must not exceed the generic store timeout or the RPL would be
/// flushed later than everything else it is batched with.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Replay protection list entries
    pub rpl_capacity: usize,

    /// Configuration database capacities (provisioner only)
    pub cdb_node_count: usize,
    pub cdb_subnet_count: usize,
    pub cdb_app_key_count: usize,

    /// Node-side key tables
    pub subnet_count: usize,
    pub app_key_count: usize,
    pub label_count: usize,

    /// Per-model binding and subscription list sizes
    pub model_key_count: usize,
    pub model_group_count: usize,

    /// Concurrent GATT proxy connections
    pub max_conn: usize,

    /// Addresses per proxy filter list
    pub proxy_filter_size: usize,

    /// Outbound advertising buffers
    pub adv_buf_count: usize,

    /// Delay before generic pending settings are flushed
    pub store_timeout_ms: u32,

    /// Delay before a lone RPL update is flushed; None uses the generic timeout
    pub rpl_store_timeout_ms: Option<u32>,

    /// How long node identity advertising runs once enabled
    pub node_id_timeout_ms: u32,

    /// Advertising bearer implementation
    pub adv_variant: AdvVariant,

    /// Controller supports Bluetooth 5 advertising intervals
    pub bt5_controller: bool,

    pub default_ttl: u8,
    pub net_transmit: TransmitParams,
    pub relay_retransmit: TransmitParams,
    pub features: FeatureDefaults,
}

impl MeshConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let capacities = [
            ("rpl_capacity", self.rpl_capacity),
            ("cdb_node_count", self.cdb_node_count),
            ("cdb_subnet_count", self.cdb_subnet_count),
            ("cdb_app_key_count", self.cdb_app_key_count),
            ("subnet_count", self.subnet_count),
            ("app_key_count", self.app_key_count),
            ("label_count", self.label_count),
            ("model_key_count", self.model_key_count),
            ("model_group_count", self.model_group_count),
            ("max_conn", self.max_conn),
            ("proxy_filter_size", self.proxy_filter_size),
            ("adv_buf_count", self.adv_buf_count),
        ];
        for (name, value) in capacities {
            if value == 0 {
                return Err(ConfigError::ZeroCapacity(name));
            }
        }

        if self.default_ttl == 1 || self.default_ttl > 127 {
            return Err(ConfigError::InvalidDefaultTtl(self.default_ttl));
        }

        self.net_transmit.validate()?;
        self.relay_retransmit.validate()?;

        if let Some(rpl) = self.rpl_store_timeout_ms {
            if rpl > self.store_timeout_ms {
                return Err(ConfigError::RplTimeoutTooLong {
                    rpl,
                    generic: self.store_timeout_ms,
                });
            }
        }

        Ok(())
    }

    /// Load and validate a JSON configuration file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: MeshConfig =
            serde_json::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            rpl_capacity: 10,
            cdb_node_count: 8,
            cdb_subnet_count: 2,
            cdb_app_key_count: 4,
            subnet_count: 2,
            app_key_count: 4,
            label_count: 3,
            model_key_count: 2,
            model_group_count: 2,
            max_conn: 1,
            proxy_filter_size: 3,
            adv_buf_count: 6,
            store_timeout_ms: 2000,
            rpl_store_timeout_ms: Some(5),
            node_id_timeout_ms: 60_000,
            adv_variant: AdvVariant::Legacy,
            bt5_controller: false,
            default_ttl: 7,
            net_transmit: TransmitParams {
                count: 2,
                interval_ms: 20,
            },
            relay_retransmit: TransmitParams {
                count: 2,
                interval_ms: 20,
            },
            features: FeatureDefaults::default(),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
