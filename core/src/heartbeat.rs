//! Heartbeat publication and subscription
//!
//! Publication sends a periodic transport control message carrying the
//! initial TTL and the active feature set. Subscription counts heartbeats
//! from one source to one destination for a bounded period and tracks the
//! hop range they arrived with.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::addr;
use crate::cfg::TTL_MAX;
use crate::net::{MsgCtx, NetRx, CTL_HEARTBEAT};
use crate::scheduler::{Scheduler, Work};
use crate::settings::keys;
use crate::store::{decode_record, encode_record, SettingsStore, StoreError};

pub const FEAT_RELAY: u16 = 1 << 0;
pub const FEAT_PROXY: u16 = 1 << 1;
pub const FEAT_FRIEND: u16 = 1 << 2;
pub const FEAT_LOW_POWER: u16 = 1 << 3;
pub const FEAT_SUPPORTED: u16 = FEAT_RELAY | FEAT_PROXY | FEAT_FRIEND | FEAT_LOW_POWER;

/// Publication count meaning "publish forever"
pub const COUNT_INDEFINITE: u16 = 0xffff;

const SUB_PERIOD_MAX: u32 = 1 << 16;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HeartbeatError {
    #[error("Unknown NetKeyIndex 0x{0:03x}")]
    InvalidNetKey(u16),
    #[error("Prohibited address 0x{0:04x}")]
    InvalidAddress(u16),
    #[error("Prohibited subscription period {0}s")]
    CannotSet(u32),
    #[error("Heartbeat too short ({0} bytes)")]
    TooShort(usize),
}

/// Heartbeat publication parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HbPub {
    pub dst: u16,
    /// Remaining publications, [`COUNT_INDEFINITE`] for no limit
    pub count: u16,
    pub ttl: u8,
    pub feat: u16,
    pub net_idx: u16,
    /// Period in seconds
    pub period: u16,
}

impl Default for HbPub {
    fn default() -> Self {
        Self {
            dst: addr::ADDR_UNASSIGNED,
            count: 0,
            ttl: 0,
            feat: 0,
            net_idx: addr::KEY_UNUSED,
            period: 0,
        }
    }
}

/// Heartbeat subscription state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HbSub {
    pub src: u16,
    pub dst: u16,
    /// Period in seconds
    pub period: u32,
    /// Seconds left of the subscription period
    pub remaining: u32,
    pub count: u16,
    pub min_hops: u8,
    pub max_hops: u8,
}

pub trait HeartbeatCb: Send {
    fn recv(&mut self, sub: &HbSub, hops: u8, feat: u16);
    fn sub_end(&mut self, sub: &HbSub);
}

/// A heartbeat ready for the network layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HbMessage {
    pub ctx: MsgCtx,
    /// Control payload including the opcode octet
    pub payload: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct HbPubRecord {
    dst: u16,
    period_log: u8,
    ttl: u8,
    feat: u16,
    net_idx: u16,
    indefinite: bool,
}

/// Encode a count or period as its log2 form
pub fn hb_log(val: u32) -> u8 {
    match val {
        0 => 0,
        0xffff => 0xff,
        v => (32 - v.leading_zeros()) as u8,
    }
}

pub fn hb_pwr2(log: u8) -> u32 {
    match log {
        0 => 0,
        0xff => 0xffff,
        l => 1u32 << (l - 1),
    }
}

#[derive(Default)]
pub struct Heartbeat {
    publication: HbPub,
    sub: HbSub,
    cb: Option<Box<dyn HeartbeatCb>>,
    store_requested: bool,
}

impl Heartbeat {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_callbacks(&mut self, cb: Box<dyn HeartbeatCb>) {
        self.cb = Some(cb);
    }

    pub fn pub_get(&self) -> HbPub {
        self.publication
    }

    pub fn sub_get(&self, sched: &Scheduler) -> HbSub {
        let mut sub = self.sub;
        sub.remaining = self.sub_remaining(sched);
        sub
    }

    fn sub_remaining(&self, sched: &Scheduler) -> u32 {
        if addr::is_unassigned(self.sub.dst) {
            return 0;
        }
        sched
            .remaining(Work::HeartbeatSubscription)
            .map(|ms| (ms / 1000) as u32)
            .unwrap_or(0)
    }

    /// Configure publication. `subnet_known` reports whether the NetKey
    /// index exists; `provisioned` gates the timer and the store.
    pub fn pub_set(
        &mut self,
        mut new_pub: HbPub,
        subnet_known: bool,
        provisioned: bool,
        sched: &mut Scheduler,
    ) -> Result<(), HeartbeatError> {
        if addr::is_unassigned(new_pub.dst) {
            self.pub_disable(sched);
            if provisioned {
                self.store_requested = true;
            }
            return Ok(());
        }

        if !subnet_known {
            error!("Unknown NetKey 0x{:04x}", new_pub.net_idx);
            return Err(HeartbeatError::InvalidNetKey(new_pub.net_idx));
        }

        new_pub.feat &= FEAT_SUPPORTED;
        self.publication = new_pub;

        if !provisioned {
            return Ok(());
        }

        // First heartbeat goes out as soon as possible
        sched.reschedule(Work::HeartbeatPublish, 0);
        self.store_requested = true;
        Ok(())
    }

    fn pub_disable(&mut self, sched: &mut Scheduler) {
        debug!("Heartbeat publication disabled");
        self.publication.dst = addr::ADDR_UNASSIGNED;
        self.publication.count = 0;
        self.publication.ttl = 0;
        self.publication.period = 0;
        sched.cancel(Work::HeartbeatPublish);
    }

    /// Publication timer fired. Returns the heartbeat to send, if any.
    ///
    /// `subnet_known` reports whether the publication NetKey still exists.
    pub fn publish(&mut self, subnet_known: bool, feat: u16) -> Option<HbMessage> {
        debug!("hb_pub.count: {}", self.publication.count);
        if self.publication.period == 0 || self.publication.count == 0 {
            return None;
        }
        if !subnet_known {
            error!(
                "No matching subnet for idx 0x{:02x}",
                self.publication.net_idx
            );
            self.publication.dst = addr::ADDR_UNASSIGNED;
            return None;
        }
        self.message(feat)
    }

    /// The published heartbeat has been sent
    pub fn publish_end(&mut self, sched: &mut Scheduler) {
        if self.publication.period != 0 && self.publication.count > 1 {
            sched.reschedule(
                Work::HeartbeatPublish,
                self.publication.period as u64 * 1000,
            );
        }
        if self.publication.count != COUNT_INDEFINITE {
            self.publication.count = self.publication.count.saturating_sub(1);
        }
    }

    fn message(&self, feat: u16) -> Option<HbMessage> {
        if addr::is_unassigned(self.publication.dst) {
            return None;
        }
        debug!("InitTTL {} feat 0x{:04x}", self.publication.ttl, feat);
        let feat = feat.to_be_bytes();
        Some(HbMessage {
            ctx: MsgCtx::control(
                self.publication.net_idx,
                self.publication.dst,
                self.publication.ttl,
            ),
            payload: vec![CTL_HEARTBEAT, self.publication.ttl, feat[0], feat[1]],
        })
    }

    /// A feature changed state; send an extra heartbeat if subscribed to it
    pub fn feature_changed(&self, features: u16, current: u16) -> Option<HbMessage> {
        if addr::is_unassigned(self.publication.dst) {
            return None;
        }
        if self.publication.feat & features == 0 {
            return None;
        }
        self.message(current)
    }

    /// Configure subscription. `primary_addr` is this node's address.
    pub fn sub_set(
        &mut self,
        src: u16,
        dst: u16,
        period: u32,
        primary_addr: u16,
        sched: &mut Scheduler,
    ) -> Result<(), HeartbeatError> {
        if !addr::is_unassigned(src) && !addr::is_unicast(src) {
            warn!("Prohibited source address");
            return Err(HeartbeatError::InvalidAddress(src));
        }
        if addr::is_virtual(dst)
            || addr::is_rfu(dst)
            || (addr::is_unicast(dst) && dst != primary_addr)
        {
            warn!("Prohibited destination address");
            return Err(HeartbeatError::InvalidAddress(dst));
        }
        if period > SUB_PERIOD_MAX {
            warn!("Prohibited subscription period {}s", period);
            return Err(HeartbeatError::CannotSet(period));
        }

        if addr::is_unassigned(src) || addr::is_unassigned(dst) {
            self.sub = HbSub::default();
        } else if period != 0 {
            self.sub = HbSub {
                src,
                dst,
                period,
                remaining: 0,
                count: 0,
                min_hops: TTL_MAX,
                max_hops: 0,
            };
        } else {
            // Stop without clearing, so the parameters stay readable
            self.sub.period = 0;
        }

        sched.reschedule(Work::HeartbeatSubscription, self.sub.period as u64 * 1000);
        Ok(())
    }

    pub fn sub_reset_count(&mut self) {
        self.sub.count = 0;
    }

    /// Subscription period ended
    pub fn sub_end(&mut self) {
        self.sub.remaining = 0;
        if let Some(cb) = self.cb.as_mut() {
            cb.sub_end(&self.sub);
        }
    }

    /// Process a received heartbeat; `payload` excludes the control opcode
    pub fn recv(&mut self, rx: &NetRx, payload: &[u8], sched: &Scheduler) -> Result<(), HeartbeatError> {
        if payload.len() < 3 {
            error!("Too short heartbeat message");
            return Err(HeartbeatError::TooShort(payload.len()));
        }
        let init_ttl = payload[0] & 0x7f;
        let feat = u16::from_be_bytes([payload[1], payload[2]]);
        let hops = init_ttl.wrapping_sub(rx.ctx.recv_ttl).wrapping_add(1);

        if rx.ctx.addr != self.sub.src || rx.ctx.recv_dst != self.sub.dst {
            debug!("No subscription for received heartbeat");
            return Ok(());
        }
        if !sched.is_pending(Work::HeartbeatSubscription) {
            debug!("Heartbeat subscription inactive");
            return Ok(());
        }

        self.sub.min_hops = self.sub.min_hops.min(hops);
        self.sub.max_hops = self.sub.max_hops.max(hops);
        if self.sub.count < 0xffff {
            self.sub.count += 1;
        }
        debug!(
            "src 0x{:04x} TTL {} InitTTL {} ({} hops) feat 0x{:04x}",
            rx.ctx.addr, rx.ctx.recv_ttl, init_ttl, hops, feat
        );

        self.sub.remaining = self.sub_remaining(sched);
        if let Some(cb) = self.cb.as_mut() {
            cb.recv(&self.sub, hops, feat);
        }
        Ok(())
    }

    /// Restart publication after provisioning or a settings load
    pub fn start(&self, sched: &mut Scheduler) {
        if self.publication.count != 0 && self.publication.period != 0 {
            debug!("Starting heartbeat publication");
            sched.reschedule(Work::HeartbeatPublish, 0);
        }
    }

    pub fn suspend(&self, sched: &mut Scheduler) {
        sched.cancel(Work::HeartbeatPublish);
    }

    pub fn resume(&self, sched: &mut Scheduler) {
        self.start(sched);
    }

    pub fn take_store_request(&mut self) -> bool {
        std::mem::take(&mut self.store_requested)
    }

    pub fn pending_store(&self, store: &dyn SettingsStore) {
        let result = if addr::is_unassigned(self.publication.dst) {
            store.save(keys::HB_PUB, None)
        } else {
            let record = HbPubRecord {
                dst: self.publication.dst,
                period_log: hb_log(self.publication.period as u32),
                ttl: self.publication.ttl,
                feat: self.publication.feat,
                net_idx: self.publication.net_idx,
                indefinite: self.publication.count == COUNT_INDEFINITE,
            };
            encode_record(&record).and_then(|bytes| store.save(keys::HB_PUB, Some(&bytes)))
        };
        match result {
            Ok(()) => debug!("Stored Heartbeat Publication"),
            Err(e) => error!("Failed to store Heartbeat Publication: {}", e),
        }
    }

    /// Restore stored publication. The timer is started later by [`Heartbeat::start`].
    pub fn restore(&mut self, value: Option<&[u8]>) -> Result<(), StoreError> {
        let Some(value) = value else {
            self.publication = HbPub::default();
            return Ok(());
        };
        let record: HbPubRecord = decode_record(value)?;
        self.publication = HbPub {
            dst: record.dst,
            count: if record.indefinite { COUNT_INDEFINITE } else { 0 },
            ttl: record.ttl,
            feat: record.feat & FEAT_SUPPORTED,
            net_idx: record.net_idx,
            period: hb_pwr2(record.period_log) as u16,
        };
        debug!("Restored heartbeat publication");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::NetIf;
    use crate::store::MemoryStore;
    use std::sync::{Arc, Mutex};

    fn hb_rx(src: u16, dst: u16, recv_ttl: u8) -> NetRx {
        NetRx {
            ctx: MsgCtx {
                net_idx: 0,
                key: None,
                addr: src,
                recv_dst: dst,
                recv_ttl,
                send_ttl: 0,
            },
            seq: 1,
            old_iv: false,
            ctl: true,
            net_if: NetIf::Adv,
            local_match: true,
            friend_match: false,
            payload: vec![],
        }
    }

    fn active_pub() -> HbPub {
        HbPub {
            dst: 0xc000,
            count: 3,
            ttl: 5,
            feat: FEAT_RELAY,
            net_idx: 0,
            period: 2,
        }
    }

    #[test]
    fn test_log_encoding() {
        assert_eq!(hb_log(0), 0);
        assert_eq!(hb_log(1), 1);
        assert_eq!(hb_log(2), 2);
        assert_eq!(hb_log(0x8000), 16);
        assert_eq!(hb_log(0xffff), 0xff);
        assert_eq!(hb_pwr2(hb_log(16)), 16);
        assert_eq!(hb_pwr2(0xff), 0xffff);
    }

    #[test]
    fn test_pub_set_rejects_unknown_subnet() {
        let mut sched = Scheduler::new();
        let mut hb = Heartbeat::new();
        assert_eq!(
            hb.pub_set(active_pub(), false, true, &mut sched),
            Err(HeartbeatError::InvalidNetKey(0))
        );
    }

    #[test]
    fn test_publication_counts_down() {
        let mut sched = Scheduler::new();
        let mut hb = Heartbeat::new();
        hb.pub_set(active_pub(), true, true, &mut sched).unwrap();
        assert_eq!(sched.remaining(Work::HeartbeatPublish), Some(0));
        assert!(hb.take_store_request());

        let msg = hb.publish(true, FEAT_RELAY).unwrap();
        assert_eq!(msg.payload, vec![CTL_HEARTBEAT, 5, 0x00, 0x01]);
        assert_eq!(msg.ctx.addr, 0xc000);
        hb.publish_end(&mut sched);
        assert_eq!(hb.pub_get().count, 2);
        assert_eq!(sched.remaining(Work::HeartbeatPublish), Some(2000));

        hb.publish(true, 0).unwrap();
        hb.publish_end(&mut sched);
        hb.publish(true, 0).unwrap();
        sched.cancel(Work::HeartbeatPublish);
        hb.publish_end(&mut sched);
        // Last one: nothing rescheduled
        assert!(!sched.is_pending(Work::HeartbeatPublish));
        assert!(hb.publish(true, 0).is_none());
    }

    #[test]
    fn test_feature_changed_only_for_subscribed_features() {
        let mut sched = Scheduler::new();
        let mut hb = Heartbeat::new();
        hb.pub_set(active_pub(), true, true, &mut sched).unwrap();
        assert!(hb.feature_changed(FEAT_PROXY, 0).is_none());
        assert!(hb.feature_changed(FEAT_RELAY, FEAT_RELAY).is_some());
    }

    #[test]
    fn test_sub_set_validation() {
        let mut sched = Scheduler::new();
        let mut hb = Heartbeat::new();
        assert_eq!(
            hb.sub_set(0x8001, 0x0001, 10, 0x0001, &mut sched),
            Err(HeartbeatError::InvalidAddress(0x8001))
        );
        assert_eq!(
            hb.sub_set(0x0002, 0x0005, 10, 0x0001, &mut sched),
            Err(HeartbeatError::InvalidAddress(0x0005))
        );
        assert_eq!(
            hb.sub_set(0x0002, 0x0001, SUB_PERIOD_MAX + 1, 0x0001, &mut sched),
            Err(HeartbeatError::CannotSet(SUB_PERIOD_MAX + 1))
        );
    }

    struct Recorder(Arc<Mutex<Vec<(u8, u16)>>>);

    impl HeartbeatCb for Recorder {
        fn recv(&mut self, _sub: &HbSub, hops: u8, feat: u16) {
            self.0.lock().unwrap().push((hops, feat));
        }
        fn sub_end(&mut self, _sub: &HbSub) {}
    }

    #[test]
    fn test_recv_tracks_hops_while_active() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut sched = Scheduler::new();
        let mut hb = Heartbeat::new();
        hb.set_callbacks(Box::new(Recorder(seen.clone())));
        hb.sub_set(0x0002, 0xc001, 10, 0x0001, &mut sched).unwrap();

        hb.recv(&hb_rx(0x0002, 0xc001, 3), &[5, 0x00, 0x03], &sched)
            .unwrap();
        hb.recv(&hb_rx(0x0002, 0xc001, 5), &[5, 0x00, 0x03], &sched)
            .unwrap();
        // Wrong source is ignored
        hb.recv(&hb_rx(0x0009, 0xc001, 5), &[5, 0x00, 0x03], &sched)
            .unwrap();

        let sub = hb.sub_get(&sched);
        assert_eq!(sub.count, 2);
        assert_eq!(sub.min_hops, 1);
        assert_eq!(sub.max_hops, 3);
        assert_eq!(sub.remaining, 10);
        assert_eq!(*seen.lock().unwrap(), vec![(3, 3), (1, 3)]);

        assert_eq!(
            hb.recv(&hb_rx(0x0002, 0xc001, 5), &[5, 0x00], &sched),
            Err(HeartbeatError::TooShort(2))
        );
    }

    #[test]
    fn test_recv_ignored_after_period() {
        let mut sched = Scheduler::new();
        let mut hb = Heartbeat::new();
        hb.sub_set(0x0002, 0xc001, 1, 0x0001, &mut sched).unwrap();
        sched.advance_to(1000);
        while sched.pop_due().is_some() {}
        hb.recv(&hb_rx(0x0002, 0xc001, 5), &[5, 0, 0], &sched).unwrap();
        assert_eq!(hb.sub_get(&sched).count, 0);
    }

    #[test]
    fn test_store_and_restore_publication() {
        let store = MemoryStore::new();
        let mut sched = Scheduler::new();
        let mut hb = Heartbeat::new();
        let mut params = active_pub();
        params.count = COUNT_INDEFINITE;
        params.period = 16;
        hb.pub_set(params, true, true, &mut sched).unwrap();
        hb.pending_store(&store);

        let mut restored = Heartbeat::new();
        restored
            .restore(store.load(keys::HB_PUB).unwrap().as_deref())
            .unwrap();
        assert_eq!(restored.pub_get(), params);

        hb.pub_set(HbPub::default(), true, true, &mut sched).unwrap();
        hb.pending_store(&store);
        assert!(store.is_empty());
    }
}
