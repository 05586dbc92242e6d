//! GATT bearer: proxy protocol and provisioning over GATT
//!
//! - [`msg`] segments and reassembles proxy PDUs over ATT notifications
//! - [`server`] serves the Mesh Proxy service: client filters, beacons,
//!   relaying and Network ID / Node Identity advertising
//! - [`pb_gatt`] serves the Mesh Provisioning service for unprovisioned
//!   devices

pub mod msg;
pub mod pb_gatt;
pub mod server;

pub use msg::{ProxyPdu, ProxyRole};
pub use pb_gatt::PbGatt;
pub use server::{FilterType, ProxyServer};

use thiserror::Error;

use crate::adv::{AD_FLAGS, AD_SERVICE_DATA16, AD_UUID16_ALL};
use crate::bearer::{AdData, AdvParams, BearerError};
use crate::crypto::CryptoError;

/// Mesh Provisioning service
pub const UUID_MESH_PROV: u16 = 0x1827;
/// Mesh Proxy service
pub const UUID_MESH_PROXY: u16 = 0x1828;
pub const PROV_DATA_IN: u16 = 0x2adb;
pub const PROV_DATA_OUT: u16 = 0x2adc;
pub const PROXY_DATA_IN: u16 = 0x2add;
pub const PROXY_DATA_OUT: u16 = 0x2ade;

/// Fast connectable advertising interval
pub const ADV_FAST_INT_MS: u16 = 100;
/// Slow connectable advertising interval
pub const ADV_SLOW_INT_MS: u16 = 1_000;

/// LE General Discoverable, BR/EDR not supported
const AD_FLAGS_GENERAL: u8 = 0x06;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProxyError {
    #[error("Proxy PDU too short")]
    TooShort,
    #[error("{0} PDU while a pending incomplete one")]
    InProgress(&'static str),
    #[error("{0} PDU with no prior data")]
    NoPriorData(&'static str),
    #[error("Unexpected message type 0x{got:02x}, expected 0x{expected:02x}")]
    TypeMismatch { expected: u8, got: u8 },
    #[error("Reassembled PDU exceeds {0} bytes")]
    Overflow(usize),
    #[error("Proxy PDU type 0x{0:02x} doesn't match GATT service")]
    WrongService(u8),
    #[error("MTU {0} too small to segment")]
    MtuTooSmall(usize),
    #[error("No client on connection 0x{0:04x}")]
    NotConnected(u16),
    #[error("No free client slot")]
    NoFreeClient,
    #[error("No subnets to advertise on")]
    NoSubnet,
    #[error("Not supported")]
    NotSupported,
    #[error("Already enabled")]
    Busy,
    #[error("Already disabled")]
    AlreadyDisabled,
    #[error("Local node is not provisioned")]
    NotProvisioned,
    #[error("Bearer: {0}")]
    Bearer(#[from] BearerError),
    #[error("Crypto: {0}")]
    Crypto(#[from] CryptoError),
}

impl ProxyError {
    /// Failure of the underlying connection rather than of the peer's data
    pub fn is_transport(&self) -> bool {
        matches!(self, ProxyError::Bearer(_) | ProxyError::NotConnected(_))
    }
}

/// Connectable advertisement for one of the GATT services
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattAdv {
    pub params: AdvParams,
    pub ad: Vec<AdData>,
    pub sd: Vec<AdData>,
}

impl GattAdv {
    /// Flags, complete 16-bit service list and service data of `service`
    fn service(service: u16, interval_ms: u16, duration_ms: Option<u64>, svc_data: &[u8]) -> Self {
        let uuid = service.to_le_bytes();
        let mut data = uuid.to_vec();
        data.extend_from_slice(svc_data);
        Self {
            params: AdvParams {
                interval_ms,
                connectable: true,
                duration_ms: duration_ms.map(|d| d.min(u32::MAX as u64) as u32),
                num_events: None,
            },
            ad: vec![
                AdData::new(AD_FLAGS, [AD_FLAGS_GENERAL]),
                AdData::new(AD_UUID16_ALL, uuid),
                AdData::new(AD_SERVICE_DATA16, data),
            ],
            sd: Vec::new(),
        }
    }

    /// Service data including the 16-bit service UUID
    pub fn service_data(&self) -> Option<&[u8]> {
        self.ad
            .iter()
            .find(|ad| ad.ad_type == AD_SERVICE_DATA16)
            .map(|ad| ad.data.as_slice())
    }
}
