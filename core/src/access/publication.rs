//! Periodic and one-shot model publication
//!
//! Each publishing model owns one `ModelPublish` timer. A publish burst is
//! the initial transmission plus `count` retransmissions spaced by the
//! publish retransmit interval; once the burst drains the timer is re-armed
//! for the remainder of the publish period, measured from the first
//! transmission of the burst.

use tracing::{debug, error, warn};

use super::{Access, AccessError, AccessTx, ModelRef, MIC_SHORT, TX_SDU_MAX};
use crate::addr::{self, KeyRef};
use crate::net::MsgCtx;
use crate::scheduler::{Scheduler, Work};

/// Pack a publish retransmit count and interval (50 ms steps)
pub fn pub_transmit(count: u8, interval_ms: u16) -> u8 {
    (count & 0x07) | ((((interval_ms / 50).saturating_sub(1)) as u8) << 3)
}

pub fn pub_transmit_count(retransmit: u8) -> u8 {
    retransmit & 0x07
}

pub fn pub_transmit_interval(retransmit: u8) -> u64 {
    ((retransmit >> 3) as u64 + 1) * 50
}

/// Publication state of one model
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelPub {
    pub addr: u16,
    /// AppKey index
    pub key: u16,
    /// Friendship credentials
    pub cred: bool,
    pub ttl: u8,
    pub retransmit: u8,
    /// Step resolution in the top two bits, step count below
    pub period: u8,
    pub period_div: u8,
    pub fast_period: bool,
    /// Transmissions left in the current burst
    pub count: u8,
    /// Start of the current period in scheduler milliseconds
    pub period_start: u64,
    /// Message published on every transmission, opcode included
    pub msg: Vec<u8>,
    pub(crate) update: bool,
}

impl ModelPub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the model to refresh `msg` at the start of every period
    pub fn with_update(mut self) -> Self {
        self.update = true;
        self
    }

    pub(crate) fn clear(&mut self) {
        self.addr = addr::ADDR_UNASSIGNED;
        self.key = 0;
        self.cred = false;
        self.ttl = 0;
        self.retransmit = 0;
        self.period = 0;
        self.period_div = 0;
        self.fast_period = false;
        self.count = 0;
    }

    /// Publish period in milliseconds, 0 when periodic publishing is off
    pub fn period_ms(&self) -> u64 {
        let steps = (self.period & 0x3f) as u64;
        let period = match self.period >> 6 {
            0x00 => steps * 100,
            0x01 => steps * 1_000,
            0x02 => steps * 10_000,
            _ => steps * 600_000,
        };
        if self.fast_period && period != 0 {
            // Fast publication never drops below 100 ms
            (period >> self.period_div).max(100)
        } else {
            period
        }
    }

    fn next_period(&self, now: u64) -> u64 {
        let period = self.period_ms();
        if period == 0 {
            return 0;
        }
        let elapsed = now.saturating_sub(self.period_start);
        debug!("Publishing took {}ms", elapsed);
        if elapsed > period {
            warn!("Publication sending took longer than the period");
            // Smallest positive delay; 0 means disabled
            return 1;
        }
        period - elapsed
    }
}

/// Parameters written by a configuration client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubParams {
    pub addr: u16,
    pub key: u16,
    pub cred: bool,
    pub ttl: u8,
    pub retransmit: u8,
    pub period: u8,
}

/// One publication transmission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubTx {
    pub model: ModelRef,
    /// `ctx.net_idx` is resolved from the AppKey by the sender
    pub tx: AccessTx,
    pub cred: bool,
}

impl Access {
    pub fn pub_get(&self, model: ModelRef) -> Option<&ModelPub> {
        self.model(model)?.publication()
    }

    /// Trigger an immediate publication burst
    pub fn model_publish(&mut self, model: ModelRef, sched: &mut Scheduler) -> Result<(), AccessError> {
        let m = self.model_mut(model).ok_or(AccessError::InvalidModel)?;
        let publication = m.publication.as_mut().ok_or(AccessError::NotSupported)?;

        if addr::is_unassigned(publication.addr) {
            return Err(AccessError::AddrNotAvail);
        }
        if publication.msg.is_empty() {
            error!("No publication message");
            return Err(AccessError::InvalidArgument("empty publication message"));
        }
        if publication.msg.len() + MIC_SHORT > TX_SDU_MAX {
            error!("Message does not fit maximum SDU size");
            return Err(AccessError::MsgSize(publication.msg.len()));
        }
        if publication.count > 0 {
            warn!("Clearing publish retransmit timer");
        }

        // Account for the initial transmission
        publication.count = pub_transmit_count(publication.retransmit) + 1;
        debug!(
            "Publish Retransmit Count {} Interval {}ms",
            publication.count,
            pub_transmit_interval(publication.retransmit)
        );
        sched.reschedule(Work::ModelPublish(model), 0);
        Ok(())
    }

    /// Publication timer expiry; returns the message to transmit, if any
    pub fn publish_timeout(&mut self, model: ModelRef, sched: &mut Scheduler) -> Option<PubTx> {
        let suspended = self.suspended;
        let now = sched.now();
        let src = self.comp.elements.get(model.elem_idx as usize)?.addr;
        let m = self.model_mut(model)?;
        let publication = m.publication.as_mut()?;

        if addr::is_unassigned(publication.addr) || suspended {
            // Publication is no longer active; abandon the recurring timer
            return None;
        }

        if publication.count > 0 {
            publication.count -= 1;
        } else {
            // First publication in this period
            publication.count = pub_transmit_count(publication.retransmit);
            if publication.update {
                if let Err(e) = m.handler.update(&mut publication.msg) {
                    debug!("Update failed, skipping publish (err: {})", e);
                    publication.count = 0;
                    publication.period_start = now;
                    self.publish_sent(model, sched);
                    return None;
                }
            }
        }

        let ctx = MsgCtx::to(0, KeyRef::App(publication.key), publication.addr, publication.ttl);
        Some(PubTx {
            model,
            tx: AccessTx {
                src,
                ctx,
                payload: publication.msg.clone(),
            },
            cred: publication.cred,
        })
    }

    /// The bearer started the transmission
    pub fn publish_start(&mut self, model: ModelRef, now: u64) {
        if let Some(publication) = self.model_mut(model).and_then(|m| m.publication.as_mut()) {
            // Beginning of a new period
            if publication.count == pub_transmit_count(publication.retransmit) {
                publication.period_start = now;
            }
        }
    }

    /// Sending failed before the bearer took the message
    pub fn publish_failed(&mut self, model: ModelRef, sched: &mut Scheduler) {
        error!("Failed to publish");
        let now = sched.now();
        self.publish_start(model, now);
        self.publish_sent(model, sched);
    }

    /// The bearer finished the transmission; arm the next one
    pub fn publish_sent(&mut self, model: ModelRef, sched: &mut Scheduler) {
        let now = sched.now();
        let Some(publication) = self.pub_get(model) else {
            return;
        };
        let delay = if publication.count > 0 {
            pub_transmit_interval(publication.retransmit)
        } else {
            publication.next_period(now)
        };
        if delay > 0 {
            debug!("Publishing next time in {}ms", delay);
            sched.schedule(Work::ModelPublish(model), delay);
        }
    }

    /// Apply new publication parameters from a configuration client
    pub fn pub_set(&mut self, model: ModelRef, params: PubParams, sched: &mut Scheduler) -> Result<(), AccessError> {
        let m = self.model_mut(model).ok_or(AccessError::InvalidModel)?;
        let publication = m.publication.as_mut().ok_or(AccessError::NotSupported)?;

        if addr::is_unassigned(params.addr) {
            if addr::is_unassigned(publication.addr) {
                return Ok(());
            }
            publication.clear();
            m.pending.publication = true;
            self.store_requested = true;
            sched.cancel(Work::ModelPublish(model));
            return Ok(());
        }

        publication.addr = params.addr;
        publication.key = params.key;
        publication.cred = params.cred;
        publication.ttl = params.ttl;
        publication.retransmit = params.retransmit;
        publication.period = params.period;
        publication.count = 0;

        if publication.update {
            let period = publication.period_ms();
            debug!("period {} ms", period);
            if period > 0 {
                sched.reschedule(Work::ModelPublish(model), period);
            } else {
                sched.cancel(Work::ModelPublish(model));
            }
        }

        m.pending.publication = true;
        self.store_requested = true;
        Ok(())
    }

    /// Arm periodic publication for every model after settings restore
    pub fn commit(&mut self, sched: &mut Scheduler) {
        for model in self.model_refs() {
            let Some(publication) = self.pub_get(model) else {
                continue;
            };
            if !publication.update || addr::is_unassigned(publication.addr) {
                continue;
            }
            let period = publication.period_ms();
            if period > 0 {
                debug!("Starting publish timer (period {}ms)", period);
                sched.schedule(Work::ModelPublish(model), period);
            }
        }
    }

    /// Stop every publication timer
    pub fn suspend(&mut self, sched: &mut Scheduler) {
        self.suspended = true;
        for model in self.model_refs() {
            sched.cancel(Work::ModelPublish(model));
        }
    }

    pub fn resume(&mut self, sched: &mut Scheduler) {
        self.suspended = false;
        for model in self.model_refs() {
            let Some(publication) = self.pub_get(model) else {
                continue;
            };
            let period = publication.period_ms();
            if !addr::is_unassigned(publication.addr) && period > 0 {
                sched.schedule(Work::ModelPublish(model), period);
            }
        }
    }
}
