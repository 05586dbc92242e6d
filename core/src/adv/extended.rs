// Extended advertising: the controller counts the advertising events of a
// buffer and reports completion. A new buffer is never started sooner than
// ADV_INT_FAST_MS after the previous advertising event ended.

use tracing::{debug, error};

use super::{transmit_count, Adv, AdvBuf, AdvError, AdvEvent, ADV_INT_FAST_MS};
use crate::bearer::{AdData, AdvParams, Bearer, BearerError};
use crate::cfg;
use crate::scheduler::{Scheduler, Work};

impl Adv {
    pub(super) fn ext_schedule_send(&mut self, bearer: &mut dyn Bearer, sched: &mut Scheduler) {
        if std::mem::take(&mut self.flags.proxy) {
            if let Err(e) = bearer.adv_stop() {
                error!("Stopping GATT advertising failed: {}", e);
            }
            self.flags.active = false;
        }

        if self.flags.active || self.flags.scheduled {
            return;
        }
        self.flags.scheduled = true;

        // The controller sends the next advertisement immediately; keep the
        // minimum spacing from the end of the previous one
        let delay = match self.timestamp {
            Some(end) => (ADV_INT_FAST_MS as u64).saturating_sub(sched.now().saturating_sub(end)),
            None => 0,
        };
        sched.reschedule(Work::AdvSend, delay);
    }

    fn ext_adv_start(
        &mut self,
        params: &AdvParams,
        custom: bool,
        ad: &[AdData],
        sd: &[AdData],
        bearer: &mut dyn Bearer,
        sched: &Scheduler,
    ) -> Result<(), AdvError> {
        if self.flags.active {
            error!("Advertiser is busy");
            return Err(BearerError::Busy.into());
        }
        self.flags.active = true;

        if self.flags.update_params {
            debug!("Updating advertising parameters");
            self.flags.update_params = custom;
        }

        self.timestamp = Some(sched.now());
        if let Err(e) = bearer.adv_start(params, ad, sd) {
            error!("Advertising failed: err {}", e);
            self.flags.active = false;
            return Err(e.into());
        }
        Ok(())
    }

    fn ext_buf_send(
        &mut self,
        buf: AdvBuf,
        bearer: &mut dyn Bearer,
        sched: &Scheduler,
        events: &mut Vec<AdvEvent>,
    ) -> bool {
        let num_events = transmit_count(buf.xmit) as u8 + 1;
        let adv_int = ADV_INT_FAST_MS.max(cfg::transmit_interval(buf.xmit));
        // Upper bound estimate
        let duration = num_events as u64 * (adv_int as u64 + 10);
        debug!(
            "count {} interval {}ms duration {}ms",
            num_events, adv_int, duration
        );

        if self.interval_ms != adv_int {
            self.interval_ms = adv_int;
            self.flags.update_params = true;
        }
        let params = AdvParams {
            interval_ms: adv_int,
            connectable: false,
            duration_ms: Some(duration as u32),
            num_events: Some(num_events),
        };

        match self.ext_adv_start(&params, false, &[buf.ad()], &[], bearer, sched) {
            Ok(()) => {
                if let Some(cb) = buf.cb {
                    events.push(AdvEvent::Started { cb, duration });
                }
                self.current = Some(buf);
                true
            }
            Err(_) => {
                if let Some(cb) = buf.cb {
                    events.push(AdvEvent::Sent { cb });
                }
                false
            }
        }
    }

    pub(super) fn ext_send_pending(&mut self, bearer: &mut dyn Bearer, sched: &mut Scheduler) -> Vec<AdvEvent> {
        self.flags.scheduled = false;
        let mut events = Vec::new();

        while let Some(buf) = self.next_busy() {
            if self.ext_buf_send(buf, bearer, sched, &mut events) {
                // Wait for advertising to finish
                return events;
            }
        }

        if !self.flags.active {
            events.push(AdvEvent::Idle);
        }
        events
    }

    pub(super) fn ext_complete(&mut self, bearer: &mut dyn Bearer, sched: &mut Scheduler) -> Vec<AdvEvent> {
        debug!(
            "Advertising stopped after {} ms",
            sched.now().saturating_sub(self.timestamp.unwrap_or_default())
        );
        // schedule_send spaces the next buffer from the end of this event
        self.timestamp = Some(sched.now());
        self.flags.active = false;

        let mut events = Vec::new();
        if !std::mem::take(&mut self.flags.proxy) {
            if let Some(cb) = self.current.take().and_then(|buf| buf.cb) {
                events.push(AdvEvent::Sent { cb });
            }
        }
        self.ext_schedule_send(bearer, sched);
        events
    }

    pub(super) fn ext_gatt_start(
        &mut self,
        params: &AdvParams,
        ad: &[AdData],
        sd: &[AdData],
        bearer: &mut dyn Bearer,
        sched: &mut Scheduler,
    ) -> Result<(), AdvError> {
        debug!("Start advertising {:?} ms", params.duration_ms);
        self.flags.update_params = true;
        self.ext_adv_start(params, true, ad, sd, bearer, sched)?;
        self.flags.proxy = true;
        Ok(())
    }
}
