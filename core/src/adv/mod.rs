//! Advertising bearer
//!
//! Outbound mesh PDUs are queued as [`AdvBuf`]s drawn from a fixed pool and
//! sent one burst at a time by either the legacy or the extended variant.
//! While the queue is empty the bearer reports [`AdvEvent::Idle`] so the
//! stack can fall back to GATT advertising (proxy or PB-GATT).
//!
//! Inbound advertising reports are split into AD structures by
//! [`scan_recv`].

mod extended;
mod legacy;

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use thiserror::Error;
use tracing::{debug, warn};

use crate::access::ModelRef;
use crate::bearer::{AdData, AdvParams, Bearer, BearerError, ADV_NONCONN_IND};
use crate::cfg;
use crate::config::MeshConfig;
use crate::scheduler::{Scheduler, Work};

pub const AD_MESH_PROV: u8 = 0x29;
pub const AD_MESH_MESSAGE: u8 = 0x2a;
pub const AD_MESH_BEACON: u8 = 0x2b;
pub const AD_URI: u8 = 0x24;
pub const AD_FLAGS: u8 = 0x01;
pub const AD_UUID16_ALL: u8 = 0x03;
pub const AD_SERVICE_DATA16: u8 = 0x16;
pub const AD_NAME_COMPLETE: u8 = 0x09;

/// Largest payload of one AD structure
pub const ADV_DATA_SIZE: usize = 29;

const ADV_INT_DEFAULT_MS: u16 = 100;
const ADV_INT_FAST_MS: u16 = 20;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdvError {
    #[error("No free advertising buffers")]
    NoBuffers,
    #[error("Refusing to allocate buffer while suspended")]
    Suspended,
    #[error("Advertising data of {0} bytes too long")]
    TooLong(usize),
    #[error("Bearer: {0}")]
    Bearer(#[from] BearerError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AdvVariant {
    /// One burst at a time, bounded by a host-side sleep
    #[default]
    Legacy,
    /// Controller-counted advertising events
    Extended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvType {
    Prov,
    Data,
    Beacon,
    Uri,
}

impl AdvType {
    pub fn ad_type(self) -> u8 {
        match self {
            AdvType::Prov => AD_MESH_PROV,
            AdvType::Data => AD_MESH_MESSAGE,
            AdvType::Beacon => AD_MESH_BEACON,
            AdvType::Uri => AD_URI,
        }
    }
}

/// Sender to notify about a buffer's transmission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendCb {
    ModelPublish(ModelRef),
    Heartbeat,
    /// PB-ADV transaction segment or ack
    PbAdv,
    /// PB-ADV link close; the link is torn down once it is sent
    PbAdvClose,
}

/// Transmission progress reported to the stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvEvent {
    /// Burst started and lasts about `duration` ms
    Started { cb: SendCb, duration: u64 },
    /// Burst finished, or failed to start
    Sent { cb: SendCb },
    /// Nothing queued; GATT advertising may run
    Idle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvBuf {
    pub adv_type: AdvType,
    /// Packed transmit count and interval
    pub xmit: u8,
    pub data: Vec<u8>,
    pub cb: Option<SendCb>,
    busy: bool,
}

impl AdvBuf {
    fn ad(&self) -> AdData {
        AdData::new(self.adv_type.ad_type(), self.data.clone())
    }
}

/// Extended advertiser state bits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct ExtFlags {
    /// Controller is currently advertising
    active: bool,
    /// Currently performing GATT advertising
    proxy: bool,
    /// A deferred send has been scheduled
    scheduled: bool,
    /// Interval changed; reconfigure on the next start
    update_params: bool,
}

pub struct Adv {
    variant: AdvVariant,
    adv_int_min: u16,
    bt5: bool,
    capacity: usize,
    queue: VecDeque<AdvBuf>,
    /// Buffer on air
    current: Option<AdvBuf>,
    /// Legacy: GATT advertising running
    gatt_active: bool,
    flags: ExtFlags,
    /// Extended: end of the previous advertising event
    timestamp: Option<u64>,
    interval_ms: u16,
    suspended: bool,
}

impl Adv {
    pub fn new(config: &MeshConfig) -> Self {
        Self {
            variant: config.adv_variant,
            adv_int_min: if config.bt5_controller {
                ADV_INT_FAST_MS
            } else {
                ADV_INT_DEFAULT_MS
            },
            bt5: config.bt5_controller,
            capacity: config.adv_buf_count,
            queue: VecDeque::new(),
            current: None,
            gatt_active: false,
            flags: ExtFlags::default(),
            timestamp: None,
            interval_ms: ADV_INT_FAST_MS,
            suspended: false,
        }
    }

    pub fn variant(&self) -> AdvVariant {
        self.variant
    }

    /// Buffers queued or on air
    pub fn in_use(&self) -> usize {
        self.queue.len() + self.current.is_some() as usize
    }

    pub fn set_suspended(&mut self, suspended: bool) {
        self.suspended = suspended;
    }

    /// Queue a PDU for transmission
    pub fn send(
        &mut self,
        adv_type: AdvType,
        xmit: u8,
        data: Vec<u8>,
        cb: Option<SendCb>,
    ) -> Result<(), AdvError> {
        if self.suspended {
            warn!("Refusing to allocate buffer while suspended");
            return Err(AdvError::Suspended);
        }
        if data.len() > ADV_DATA_SIZE {
            return Err(AdvError::TooLong(data.len()));
        }
        if self.in_use() >= self.capacity {
            return Err(AdvError::NoBuffers);
        }
        debug!("type {:?} len {}: {}", adv_type, data.len(), hex::encode(&data));
        self.queue.push_back(AdvBuf {
            adv_type,
            xmit,
            data,
            cb,
            busy: true,
        });
        Ok(())
    }

    /// Buffers waiting for their turn on air
    pub fn queued(&self) -> impl Iterator<Item = &AdvBuf> {
        self.queue.iter().filter(|b| b.busy)
    }

    /// Drop queued buffers belonging to `cb`
    pub fn cancel(&mut self, cb: SendCb) {
        for buf in self.queue.iter_mut().filter(|b| b.cb == Some(cb)) {
            buf.busy = false;
        }
    }

    /// Start sending if the bearer is free
    pub fn process(&mut self, bearer: &mut dyn Bearer, sched: &mut Scheduler) -> Vec<AdvEvent> {
        match self.variant {
            AdvVariant::Legacy => self.legacy_process(bearer, sched),
            AdvVariant::Extended => {
                self.ext_schedule_send(bearer, sched);
                Vec::new()
            }
        }
    }

    /// `Work::AdvSend` expiry
    pub fn send_timeout(&mut self, bearer: &mut dyn Bearer, sched: &mut Scheduler) -> Vec<AdvEvent> {
        match self.variant {
            AdvVariant::Legacy => self.legacy_burst_end(bearer, sched),
            AdvVariant::Extended => self.ext_send_pending(bearer, sched),
        }
    }

    /// Controller reported the end of an extended advertising set
    pub fn adv_complete(&mut self, bearer: &mut dyn Bearer, sched: &mut Scheduler) -> Vec<AdvEvent> {
        match self.variant {
            AdvVariant::Legacy => Vec::new(),
            AdvVariant::Extended => self.ext_complete(bearer, sched),
        }
    }

    /// Start connectable GATT advertising while the queue is idle
    pub fn gatt_start(
        &mut self,
        params: &AdvParams,
        ad: &[AdData],
        sd: &[AdData],
        bearer: &mut dyn Bearer,
        sched: &mut Scheduler,
    ) -> Result<(), AdvError> {
        match self.variant {
            AdvVariant::Legacy => self.legacy_gatt_start(params, ad, sd, bearer, sched),
            AdvVariant::Extended => self.ext_gatt_start(params, ad, sd, bearer, sched),
        }
    }

    /// `Work::AdvGattTimeout` expiry
    pub fn gatt_timeout(&mut self, bearer: &mut dyn Bearer) -> Vec<AdvEvent> {
        if !self.gatt_active {
            return Vec::new();
        }
        self.gatt_active = false;
        if let Err(e) = bearer.adv_stop() {
            warn!("Stopping GATT advertising failed: {}", e);
        }
        if self.queue.is_empty() {
            vec![AdvEvent::Idle]
        } else {
            Vec::new()
        }
    }

    /// A central connected to our connectable advertisement
    pub fn gatt_connected(&mut self, bearer: &mut dyn Bearer, sched: &mut Scheduler) -> Vec<AdvEvent> {
        match self.variant {
            AdvVariant::Legacy => {
                self.gatt_active = false;
                sched.cancel(Work::AdvGattTimeout);
                self.legacy_process(bearer, sched)
            }
            AdvVariant::Extended => {
                if std::mem::take(&mut self.flags.proxy) {
                    self.flags.active = false;
                    self.ext_schedule_send(bearer, sched);
                }
                Vec::new()
            }
        }
    }

    /// Re-evaluate GATT advertising content
    pub fn update(&mut self, bearer: &mut dyn Bearer, sched: &mut Scheduler) -> Vec<AdvEvent> {
        match self.variant {
            AdvVariant::Legacy => {
                if self.gatt_active {
                    sched.cancel(Work::AdvGattTimeout);
                    return self.gatt_timeout(bearer);
                }
                Vec::new()
            }
            AdvVariant::Extended => {
                self.ext_schedule_send(bearer, sched);
                Vec::new()
            }
        }
    }

    fn next_busy(&mut self) -> Option<AdvBuf> {
        while let Some(buf) = self.queue.pop_front() {
            // Cancelled while queued
            if buf.busy {
                return Some(buf);
            }
        }
        None
    }
}

fn transmit_count(xmit: u8) -> u64 {
    cfg::transmit_count(xmit) as u64
}

/// Mesh payloads found in one advertising report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanPdu<'a> {
    Message(&'a [u8]),
    Prov(&'a [u8]),
    Beacon(&'a [u8]),
}

/// Split a report into AD structures, keeping the mesh ones
pub fn scan_recv(adv_type: u8, data: &[u8]) -> Vec<ScanPdu<'_>> {
    let mut pdus = Vec::new();
    if adv_type != ADV_NONCONN_IND {
        return pdus;
    }

    let mut rest = data;
    while rest.len() > 1 {
        let len = rest[0] as usize;
        // Early termination
        if len == 0 {
            break;
        }
        if len > rest.len() - 1 {
            warn!("AD malformed");
            break;
        }
        let (ad_type, payload) = (rest[1], &rest[2..1 + len]);
        match ad_type {
            AD_MESH_MESSAGE => pdus.push(ScanPdu::Message(payload)),
            AD_MESH_PROV => pdus.push(ScanPdu::Prov(payload)),
            AD_MESH_BEACON => pdus.push(ScanPdu::Beacon(payload)),
            _ => {}
        }
        rest = &rest[1 + len..];
    }
    pdus
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::bearer::MockBearer;

    pub fn quiet_bearer() -> MockBearer {
        let mut bearer = MockBearer::new();
        bearer.expect_adv_start().returning(|_, _, _| Ok(()));
        bearer.expect_adv_stop().returning(|| Ok(()));
        bearer
    }

    #[test]
    fn test_scan_recv_routes_mesh_types() {
        let report = [
            0x02, 0x01, 0x06, // flags
            0x03, AD_MESH_MESSAGE, 0xaa, 0xbb, //
            0x02, AD_MESH_BEACON, 0x01, //
            0x02, AD_MESH_PROV, 0x07,
        ];
        assert_eq!(
            scan_recv(ADV_NONCONN_IND, &report),
            vec![
                ScanPdu::Message(&[0xaa, 0xbb]),
                ScanPdu::Beacon(&[0x01]),
                ScanPdu::Prov(&[0x07]),
            ]
        );
        assert!(scan_recv(0x00, &report).is_empty());
    }

    #[test]
    fn test_scan_recv_stops_on_zero_or_truncated() {
        let zero = [0x02, AD_MESH_BEACON, 0x01, 0x00, 0x02, AD_MESH_PROV, 0x07];
        assert_eq!(scan_recv(ADV_NONCONN_IND, &zero).len(), 1);
        let truncated = [0x02, AD_MESH_BEACON, 0x01, 0x09, AD_MESH_MESSAGE, 0x01];
        assert_eq!(scan_recv(ADV_NONCONN_IND, &truncated).len(), 1);
    }

    #[test]
    fn test_pool_exhaustion_and_suspend() {
        let config = MeshConfig {
            adv_buf_count: 2,
            ..MeshConfig::default()
        };
        let mut adv = Adv::new(&config);
        adv.send(AdvType::Data, 0, vec![1], None).unwrap();
        adv.send(AdvType::Data, 0, vec![2], None).unwrap();
        assert_eq!(adv.send(AdvType::Data, 0, vec![3], None), Err(AdvError::NoBuffers));
        assert_eq!(
            adv.send(AdvType::Data, 0, vec![0; ADV_DATA_SIZE + 1], None),
            Err(AdvError::TooLong(ADV_DATA_SIZE + 1))
        );

        let mut adv = Adv::new(&config);
        adv.set_suspended(true);
        assert_eq!(adv.send(AdvType::Data, 0, vec![1], None), Err(AdvError::Suspended));
    }

    #[test]
    fn test_cancelled_buffers_are_skipped() {
        let mut bearer = MockBearer::new();
        bearer
            .expect_adv_start()
            .withf(|_, ad, _| ad[0].ad_type == AD_MESH_MESSAGE)
            .times(1)
            .returning(|_, _, _| Ok(()));
        let mut sched = Scheduler::new();
        let mut adv = Adv::new(&MeshConfig::default());
        adv.send(AdvType::Prov, 0, vec![1], Some(SendCb::PbAdv)).unwrap();
        adv.send(AdvType::Data, 0, vec![2], None).unwrap();
        adv.cancel(SendCb::PbAdv);
        let events = adv.process(&mut bearer, &mut sched);
        assert!(events.is_empty());
        assert!(sched.is_pending(Work::AdvSend));
    }
}
