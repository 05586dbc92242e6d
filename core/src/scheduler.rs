//! Cooperative delayed-work scheduler
//!
//! Every timer in the stack (publication, heartbeat, SAR timeout, settings
//! flush, advertising) is a [`Work`] item with at most one pending deadline.
//! The queue is ordered by `(deadline, insertion sequence)` so items due at
//! the same millisecond run in the order they were scheduled. Time is a
//! monotonically increasing millisecond counter supplied by the driver,
//! which keeps the whole stack deterministic under test.

use std::collections::{BTreeMap, HashMap};

use crate::access::ModelRef;

/// Identity of a delayed work item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Work {
    /// Pending settings flush
    SettingsStore,
    /// Publication retransmit or period timer of one model
    ModelPublish(ModelRef),
    HeartbeatPublish,
    HeartbeatSubscription,
    /// Legacy bearer: end of the current burst. Extended: deferred send.
    AdvSend,
    /// End of a time-boxed GATT (proxy or PB-GATT) advertisement
    AdvGattTimeout,
    /// 20-second reassembly timer of one proxy connection
    ProxySar(u16),
    /// Push all beacons to a newly subscribed proxy client
    ProxyBeacons(u16),
    /// Provisioning protocol timeout
    ProvTimeout,
    /// PB-ADV transaction retransmission
    PbAdvRetransmit,
    /// PB-ADV link inactivity timeout
    PbAdvLinkTimeout,
}

type Slot = (u64, u64);

#[derive(Debug, Default)]
pub struct Scheduler {
    now: u64,
    seq: u64,
    queue: BTreeMap<Slot, Work>,
    index: HashMap<Work, Slot>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current time in milliseconds
    pub fn now(&self) -> u64 {
        self.now
    }

    /// Move the clock forward. Time never runs backwards.
    pub fn advance_to(&mut self, now: u64) {
        if now > self.now {
            self.now = now;
        }
    }

    /// Schedule `work` unless it is already pending.
    ///
    /// Returns true if a new deadline was set.
    pub fn schedule(&mut self, work: Work, delay_ms: u64) -> bool {
        if self.index.contains_key(&work) {
            return false;
        }
        self.insert(work, delay_ms);
        true
    }

    /// Set the deadline of `work`, replacing any pending one.
    pub fn reschedule(&mut self, work: Work, delay_ms: u64) {
        self.cancel(work);
        self.insert(work, delay_ms);
    }

    /// Pull the deadline of `work` earlier, never later.
    ///
    /// Returns the remaining delay after the call.
    pub fn reschedule_earlier(&mut self, work: Work, delay_ms: u64) -> u64 {
        match self.remaining(work) {
            Some(remaining) if remaining <= delay_ms => remaining,
            _ => {
                self.reschedule(work, delay_ms);
                delay_ms
            }
        }
    }

    pub fn cancel(&mut self, work: Work) -> bool {
        match self.index.remove(&work) {
            Some(slot) => {
                self.queue.remove(&slot);
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self, work: Work) -> bool {
        self.index.contains_key(&work)
    }

    /// Milliseconds until `work` fires, if pending
    pub fn remaining(&self, work: Work) -> Option<u64> {
        self.index
            .get(&work)
            .map(|(deadline, _)| deadline.saturating_sub(self.now))
    }

    /// Earliest pending deadline
    pub fn next_deadline(&self) -> Option<u64> {
        self.queue.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Remove and return the earliest item that is due at the current time.
    pub fn pop_due(&mut self) -> Option<Work> {
        let (&slot, _) = self.queue.iter().next()?;
        if slot.0 > self.now {
            return None;
        }
        let work = self.queue.remove(&slot)?;
        self.index.remove(&work);
        Some(work)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    fn insert(&mut self, work: Work, delay_ms: u64) {
        let slot = (self.now.saturating_add(delay_ms), self.seq);
        self.seq += 1;
        self.queue.insert(slot, work);
        self.index.insert(work, slot);
    }
}
