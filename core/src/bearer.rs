//! Radio capability consumed by the stack
//!
//! The host controller is reached through one [`Bearer`]: advertising
//! start/stop for the ADV bearer and GATT advertising, plus notifications and
//! disconnects on GATT connections.

use thiserror::Error;

/// Connection handle of a free proxy client slot
pub const CONN_NONE: u16 = 0xffff;

/// Legacy report type of non-connectable undirected advertising
pub const ADV_NONCONN_IND: u8 = 0x03;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BearerError {
    #[error("Controller rejected request: {0}")]
    Rejected(String),
    #[error("Connection 0x{0:04x} not found")]
    NotConnected(u16),
    #[error("Controller busy")]
    Busy,
}

/// One AD structure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdData {
    pub ad_type: u8,
    pub data: Vec<u8>,
}

impl AdData {
    pub fn new(ad_type: u8, data: impl Into<Vec<u8>>) -> Self {
        Self {
            ad_type,
            data: data.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvParams {
    pub interval_ms: u16,
    pub connectable: bool,
    /// None advertises until stopped
    pub duration_ms: Option<u32>,
    /// Number of advertising events (extended advertising only)
    pub num_events: Option<u8>,
}

#[cfg_attr(test, mockall::automock)]
pub trait Bearer: Send {
    fn adv_start(&mut self, params: &AdvParams, ad: &[AdData], sd: &[AdData]) -> Result<(), BearerError>;

    fn adv_stop(&mut self) -> Result<(), BearerError>;

    /// Send a notification on characteristic `chr` of connection `conn`
    fn gatt_notify(&mut self, conn: u16, chr: u16, data: &[u8]) -> Result<(), BearerError>;

    fn disconnect(&mut self, conn: u16) -> Result<(), BearerError>;

    /// Negotiated ATT MTU of `conn`
    fn att_mtu(&self, conn: u16) -> u16;
}
