// Mesh Provisioning service (PB-GATT)
//
// Visible only while the node is unprovisioned. One connection at a time
// carries provisioning PDUs; a subscription to Data Out opens the
// provisioning link and the disconnect closes it.

use tracing::{debug, error, warn};

use super::msg::{self, ProxyRole, TYPE_PROV};
use super::{GattAdv, ProxyError, ADV_FAST_INT_MS, ADV_SLOW_INT_MS, PROV_DATA_OUT, UUID_MESH_PROV};
use crate::adv::{ADV_DATA_SIZE, AD_URI};
use crate::bearer::{AdData, Bearer};
use crate::scheduler::Scheduler;

/// Fast advertising period after the service is enabled
pub const FAST_ADV_MS: u64 = 60_000;

#[derive(Debug, Default)]
pub struct PbGatt {
    registered: bool,
    fast_adv: bool,
    role: Option<ProxyRole>,
}

impl PbGatt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.registered
    }

    /// Connection currently carrying provisioning
    pub fn conn(&self) -> Option<u16> {
        self.role.as_ref().map(ProxyRole::conn)
    }

    pub fn enable(&mut self, provisioned: bool) -> Result<(), ProxyError> {
        debug!("Enabling provisioning service");
        if provisioned {
            return Err(ProxyError::NotSupported);
        }
        if self.registered {
            return Err(ProxyError::Busy);
        }
        self.registered = true;
        self.fast_adv = true;
        Ok(())
    }

    pub fn disable(&mut self) -> Result<(), ProxyError> {
        debug!("Disabling provisioning service");
        if !self.registered {
            return Err(ProxyError::AlreadyDisabled);
        }
        self.registered = false;
        Ok(())
    }

    /// A central connected. Returns true if the connection now serves
    /// provisioning.
    pub fn connected(&mut self, conn: u16, provisioned: bool) -> bool {
        if !self.registered || provisioned {
            return false;
        }
        debug!("conn {}", conn);
        self.role = Some(ProxyRole::new(conn));
        true
    }

    /// Returns true if `conn` was the provisioning connection; the caller
    /// closes the provisioning link.
    pub fn disconnected(&mut self, conn: u16, sched: &mut Scheduler) -> bool {
        match self.role.take() {
            Some(mut role) if role.conn() == conn => {
                role.cleanup(sched);
                debug!("conn_handle {} disconnected", conn);
                true
            }
            other => {
                self.role = other;
                false
            }
        }
    }

    /// Subscription to Data Out; the caller opens the provisioning link
    pub fn ccc_write(&self, conn: u16) -> Result<(), ProxyError> {
        if self.conn() != Some(conn) {
            error!("No PB-GATT Client found");
            return Err(ProxyError::NotConnected(conn));
        }
        Ok(())
    }

    /// A write to Data In. Returns a complete provisioning PDU.
    pub fn recv(&mut self, conn: u16, data: &[u8], sched: &mut Scheduler) -> Result<Option<Vec<u8>>, ProxyError> {
        let role = match self.role.as_mut() {
            Some(role) if role.conn() == conn => role,
            _ => {
                warn!("Write from unexpected connection 0x{:04x}", conn);
                return Err(ProxyError::NotConnected(conn));
            }
        };
        match msg::pdu_type(data) {
            None => {
                warn!("Too small Proxy PDU");
                Err(ProxyError::TooShort)
            }
            Some(TYPE_PROV) => Ok(role.recv(data, sched)?.map(|pdu| pdu.data)),
            Some(other) => {
                warn!("Proxy PDU type doesn't match GATT service");
                Err(ProxyError::WrongService(other))
            }
        }
    }

    /// `Work::ProxySar` expiry on the provisioning connection
    pub fn sar_timeout(&mut self, conn: u16, bearer: &mut dyn Bearer) -> bool {
        match self.role.as_mut() {
            Some(role) if role.conn() == conn => {
                msg::sar_timeout(bearer, role);
                true
            }
            _ => false,
        }
    }

    pub fn send(&self, bearer: &mut dyn Bearer, conn: u16, pdu: &[u8]) -> Result<(), ProxyError> {
        if self.conn() != Some(conn) {
            error!("No PB-GATT Client found");
            return Err(ProxyError::NotConnected(conn));
        }
        msg::send(bearer, conn, PROV_DATA_OUT, TYPE_PROV, pdu)
    }

    /// Connectable advertisement: fast for the first minute, slow after.
    ///
    /// Service data is the device UUID and OOB information; a URI that fits
    /// goes in the scan response.
    pub fn adv_start(
        &self,
        provisioned: bool,
        uuid: &[u8; 16],
        oob_info: u16,
        uri: Option<&str>,
    ) -> Result<GattAdv, ProxyError> {
        if !self.registered || provisioned {
            return Err(ProxyError::NotSupported);
        }

        let mut svc_data = uuid.to_vec();
        svc_data.extend_from_slice(&oob_info.to_be_bytes());

        let mut adv = if self.fast_adv {
            GattAdv::service(UUID_MESH_PROV, ADV_FAST_INT_MS, Some(FAST_ADV_MS), &svc_data)
        } else {
            GattAdv::service(UUID_MESH_PROV, ADV_SLOW_INT_MS, None, &svc_data)
        };

        if let Some(uri) = uri {
            if uri.len() > ADV_DATA_SIZE {
                warn!("Too long URI to fit advertising packet");
            } else {
                adv.sd.push(AdData::new(AD_URI, uri.as_bytes()));
            }
        }
        Ok(adv)
    }

    /// The fast advertisement went on air
    pub fn adv_started(&mut self) {
        self.fast_adv = false;
    }
}
