// Legacy advertising: each buffer is advertised for a computed burst
// duration, then advertising is stopped and the next buffer starts. GATT
// advertising fills the gaps and is stopped as soon as a buffer is queued.

use tracing::{debug, error};

use super::{transmit_count, Adv, AdvBuf, AdvError, AdvEvent};
use crate::bearer::{AdData, AdvParams, Bearer};
use crate::cfg;
use crate::scheduler::{Scheduler, Work};

impl Adv {
    /// Burst length in ms for one buffer
    pub(super) fn legacy_duration(&self, xmit: u8) -> (u16, u64) {
        let adv_int = self.adv_int_min.max(cfg::transmit_interval(xmit));
        let mut duration = (transmit_count(xmit) + 1) * (adv_int as u64 + 10);
        // A stopped and restarted advertiser may lose up to one interval
        if !self.bt5 {
            duration += adv_int as u64;
        }
        (adv_int, duration)
    }

    pub(super) fn legacy_process(&mut self, bearer: &mut dyn Bearer, sched: &mut Scheduler) -> Vec<AdvEvent> {
        let mut events = Vec::new();
        if self.current.is_some() {
            return events;
        }

        while let Some(buf) = self.next_busy() {
            if self.gatt_active {
                self.gatt_active = false;
                sched.cancel(Work::AdvGattTimeout);
                if let Err(e) = bearer.adv_stop() {
                    error!("Stopping GATT advertising failed: {}", e);
                }
            }
            if self.legacy_send(buf, bearer, sched, &mut events) {
                return events;
            }
        }

        if !self.gatt_active {
            events.push(AdvEvent::Idle);
        }
        events
    }

    fn legacy_send(
        &mut self,
        buf: AdvBuf,
        bearer: &mut dyn Bearer,
        sched: &mut Scheduler,
        events: &mut Vec<AdvEvent>,
    ) -> bool {
        let (adv_int, duration) = self.legacy_duration(buf.xmit);
        debug!(
            "count {} interval {}ms duration {}ms",
            transmit_count(buf.xmit) + 1,
            adv_int,
            duration
        );

        let params = AdvParams {
            interval_ms: adv_int,
            connectable: false,
            duration_ms: None,
            num_events: None,
        };
        match bearer.adv_start(&params, &[buf.ad()], &[]) {
            Ok(()) => {
                if let Some(cb) = buf.cb {
                    events.push(AdvEvent::Started { cb, duration });
                }
                debug!("Advertising started. Sleeping {} ms", duration);
                self.current = Some(buf);
                sched.reschedule(Work::AdvSend, duration);
                true
            }
            Err(e) => {
                error!("Advertising failed: err {}", e);
                if let Some(cb) = buf.cb {
                    events.push(AdvEvent::Sent { cb });
                }
                false
            }
        }
    }

    pub(super) fn legacy_burst_end(&mut self, bearer: &mut dyn Bearer, sched: &mut Scheduler) -> Vec<AdvEvent> {
        let Some(buf) = self.current.take() else {
            return Vec::new();
        };
        if let Err(e) = bearer.adv_stop() {
            error!("Stopping advertising failed: err {}", e);
        }
        debug!("Advertising stopped");

        let mut events = Vec::new();
        if let Some(cb) = buf.cb {
            events.push(AdvEvent::Sent { cb });
        }
        events.extend(self.legacy_process(bearer, sched));
        events
    }

    pub(super) fn legacy_gatt_start(
        &mut self,
        params: &AdvParams,
        ad: &[AdData],
        sd: &[AdData],
        bearer: &mut dyn Bearer,
        sched: &mut Scheduler,
    ) -> Result<(), AdvError> {
        bearer.adv_start(params, ad, sd)?;
        self.gatt_active = true;
        if let Some(duration) = params.duration_ms {
            debug!("GATT advertising up to {} ms", duration);
            sched.reschedule(Work::AdvGattTimeout, duration as u64);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::quiet_bearer;
    use super::super::{AdvType, SendCb};
    use super::*;
    use crate::access::ModelRef;
    use crate::bearer::MockBearer;
    use crate::config::MeshConfig;

    const M: ModelRef = ModelRef {
        elem_idx: 0,
        vnd: false,
        mod_idx: 0,
    };

    #[test]
    fn test_duration_follows_controller_generation() {
        let adv = Adv::new(&MeshConfig::default());
        // 3 transmissions at the 100 ms floor plus one interval of slack
        assert_eq!(adv.legacy_duration(cfg::transmit(2, 20)), (100, 430));

        let bt5 = Adv::new(&MeshConfig {
            bt5_controller: true,
            ..MeshConfig::default()
        });
        assert_eq!(bt5.legacy_duration(cfg::transmit(2, 20)), (20, 90));
        assert_eq!(bt5.legacy_duration(cfg::transmit(0, 50)), (50, 60));
    }

    #[test]
    fn test_bursts_run_back_to_back() {
        let mut bearer = quiet_bearer();
        let mut sched = Scheduler::new();
        let mut adv = Adv::new(&MeshConfig::default());
        adv.send(AdvType::Data, 0, vec![1], Some(SendCb::ModelPublish(M)))
            .unwrap();
        adv.send(AdvType::Data, 0, vec![2], Some(SendCb::Heartbeat)).unwrap();

        let events = adv.process(&mut bearer, &mut sched);
        assert_eq!(
            events,
            vec![AdvEvent::Started {
                cb: SendCb::ModelPublish(M),
                duration: 210
            }]
        );
        // Already busy
        assert!(adv.process(&mut bearer, &mut sched).is_empty());

        sched.advance_to(210);
        assert_eq!(sched.pop_due(), Some(Work::AdvSend));
        let events = adv.send_timeout(&mut bearer, &mut sched);
        assert_eq!(
            events,
            vec![
                AdvEvent::Sent {
                    cb: SendCb::ModelPublish(M)
                },
                AdvEvent::Started {
                    cb: SendCb::Heartbeat,
                    duration: 210
                },
            ]
        );

        sched.advance_to(420);
        assert_eq!(sched.pop_due(), Some(Work::AdvSend));
        let events = adv.send_timeout(&mut bearer, &mut sched);
        assert_eq!(
            events,
            vec![AdvEvent::Sent { cb: SendCb::Heartbeat }, AdvEvent::Idle]
        );
        assert_eq!(adv.in_use(), 0);
    }

    #[test]
    fn test_failed_start_reports_sent() {
        let mut bearer = MockBearer::new();
        bearer
            .expect_adv_start()
            .returning(|_, _, _| Err(crate::bearer::BearerError::Busy));
        let mut sched = Scheduler::new();
        let mut adv = Adv::new(&MeshConfig::default());
        adv.send(AdvType::Beacon, 0, vec![1], Some(SendCb::Heartbeat)).unwrap();
        let events = adv.process(&mut bearer, &mut sched);
        assert_eq!(
            events,
            vec![AdvEvent::Sent { cb: SendCb::Heartbeat }, AdvEvent::Idle]
        );
        assert!(!sched.is_pending(Work::AdvSend));
    }

    #[test]
    fn test_queued_buffer_preempts_gatt_advertising() {
        let mut bearer = quiet_bearer();
        let mut sched = Scheduler::new();
        let mut adv = Adv::new(&MeshConfig::default());
        let params = AdvParams {
            interval_ms: 100,
            connectable: true,
            duration_ms: Some(1_000),
            num_events: None,
        };
        adv.gatt_start(&params, &[], &[], &mut bearer, &mut sched).unwrap();
        assert!(sched.is_pending(Work::AdvGattTimeout));
        assert!(adv.process(&mut bearer, &mut sched).is_empty());

        adv.send(AdvType::Data, 0, vec![1], None).unwrap();
        adv.process(&mut bearer, &mut sched);
        assert!(!sched.is_pending(Work::AdvGattTimeout));
        assert!(sched.is_pending(Work::AdvSend));
    }
}
