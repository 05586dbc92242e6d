// PB-ADV: provisioning bearer over advertising packets
//
// Each packet is `link_id (4) | xact (1) | generic provisioning PDU`. A
// provisioning PDU travels as one transaction: a Start segment with the
// total length and FCS, then Continuation segments, acknowledged as a whole.
// One transaction is in flight at a time; the sender repeats it until the
// ack arrives.

use std::collections::VecDeque;

use tracing::{debug, error, warn};

use super::{reason, CloseReason, ProvError, PDU_MAX_LEN};
use crate::adv::{Adv, AdvType, SendCb};
use crate::cfg;
use crate::scheduler::{Scheduler, Work};

pub const RETRANSMIT_TIMEOUT_MS: u64 = 500;
/// Link dropped when a transaction stays unacknowledged this long
pub const LINK_TIMEOUT_MS: u64 = 30_000;

const GPCF_START: u8 = 0x00;
const GPCF_ACK: u8 = 0x01;
const GPCF_CONT: u8 = 0x02;
const GPCF_CTL: u8 = 0x03;

const LINK_OPEN: u8 = 0x00;
const LINK_ACK: u8 = 0x01;
const LINK_CLOSE: u8 = 0x02;

/// link id + transaction number
const HDR_LEN: usize = 5;
/// Data carried by a Start segment
const START_PAYLOAD_MAX: usize = 20;
/// Data carried by a Continuation segment
const CONT_PAYLOAD_MAX: usize = 23;

const XACT_DEVICE_BASE: u8 = 0x80;

fn reliable_xmit() -> u8 {
    cfg::transmit(4, 20)
}

fn ack_xmit() -> u8 {
    cfg::transmit(2, 20)
}

/// CRC-8 of 3GPP TS 27.010, reversed polynomial 0xE0
fn crc8(data: &[u8]) -> u8 {
    let mut crc = 0xffu8;
    for &byte in data {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x01 != 0 {
                (crc >> 1) ^ 0xe0
            } else {
                crc >> 1
            };
        }
    }
    crc
}

pub fn fcs(data: &[u8]) -> u8 {
    0xff - crc8(data)
}

/// CRC over data followed by its FCS equals this constant
const FCS_CHECK: u8 = 0xcf;

pub fn fcs_check(data: &[u8], fcs: u8) -> bool {
    let mut buf = data.to_vec();
    buf.push(fcs);
    crc8(&buf) == FCS_CHECK
}

fn last_seg(total: usize) -> u8 {
    if total <= START_PAYLOAD_MAX {
        0
    } else {
        (total - START_PAYLOAD_MAX).div_ceil(CONT_PAYLOAD_MAX) as u8
    }
}

/// Split `pdu` into Start and Continuation generic provisioning PDUs
fn segment(pdu: &[u8]) -> Vec<Vec<u8>> {
    let first = pdu.len().min(START_PAYLOAD_MAX);
    let mut start = Vec::with_capacity(4 + first);
    start.push((last_seg(pdu.len()) << 2) | GPCF_START);
    start.extend_from_slice(&(pdu.len() as u16).to_be_bytes());
    start.push(fcs(pdu));
    start.extend_from_slice(&pdu[..first]);

    let mut segs = vec![start];
    for (i, chunk) in pdu[first..].chunks(CONT_PAYLOAD_MAX).enumerate() {
        let mut cont = Vec::with_capacity(1 + chunk.len());
        cont.push((((i + 1) as u8) << 2) | GPCF_CONT);
        cont.extend_from_slice(chunk);
        segs.push(cont);
    }
    segs
}

/// Link event for the provisioning layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PbAdvEvent {
    Opened,
    Closed(CloseReason),
    /// A complete provisioning PDU
    Pdu(Vec<u8>),
    /// The peer sent a transaction the protocol rejects with this reason
    Error(u8),
}

#[derive(Debug)]
struct Transaction {
    xact: u8,
    segs: Vec<Vec<u8>>,
}

#[derive(Debug, Default)]
struct Rx {
    /// Last transaction delivered
    last: Option<u8>,
    /// Transaction being reassembled
    xact: Option<u8>,
    buf: Vec<u8>,
    fcs: u8,
    last_seg: u8,
    seg_mask: u64,
}

impl Rx {
    fn complete(&self) -> bool {
        let all = if self.last_seg >= 63 {
            u64::MAX
        } else {
            (1u64 << (self.last_seg + 1)) - 1
        };
        self.seg_mask == all
    }
}

#[derive(Debug)]
struct Link {
    id: u32,
    provisioner: bool,
    /// Provisioner: the device acknowledged our Link Open
    opened: bool,
    /// Provisioner: device the link is opened to
    uuid: [u8; 16],
    next_xact: u8,
    tx: Option<Transaction>,
    queue: VecDeque<Vec<u8>>,
    rx: Rx,
    closing: Option<CloseReason>,
}

impl Link {
    fn new(id: u32, provisioner: bool, uuid: [u8; 16]) -> Self {
        Self {
            id,
            provisioner,
            opened: !provisioner,
            uuid,
            next_xact: if provisioner { 0 } else { XACT_DEVICE_BASE },
            tx: None,
            queue: VecDeque::new(),
            rx: Rx::default(),
            closing: None,
        }
    }

    /// Transaction numbers stay in the sender's half of the range
    fn take_xact(&mut self) -> u8 {
        let xact = self.next_xact;
        self.next_xact = ((xact + 1) & 0x7f) | (xact & XACT_DEVICE_BASE);
        xact
    }

    fn packet(&self, xact: u8, gpdu: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HDR_LEN + gpdu.len());
        buf.extend_from_slice(&self.id.to_be_bytes());
        buf.push(xact);
        buf.extend_from_slice(gpdu);
        buf
    }
}

#[derive(Debug, Default)]
pub struct PbAdv {
    link: Option<Link>,
}

impl PbAdv {
    pub fn new() -> Self {
        Self::default()
    }

    /// A link exists, opened or being opened
    pub fn is_active(&self) -> bool {
        self.link.is_some()
    }

    pub fn link_id(&self) -> Option<u32> {
        self.link.as_ref().map(|l| l.id)
    }

    fn send_packet(
        adv: &mut Adv,
        xmit: u8,
        data: Vec<u8>,
        cb: SendCb,
    ) -> Result<(), ProvError> {
        adv.send(AdvType::Prov, xmit, data, Some(cb)).map_err(|e| {
            error!("Failed to send PB-ADV packet: {}", e);
            ProvError::Bearer(e.to_string())
        })
    }

    fn send_ctl(link: &Link, op: u8, params: &[u8], adv: &mut Adv, xmit: u8, cb: SendCb) -> Result<(), ProvError> {
        let mut gpdu = Vec::with_capacity(1 + params.len());
        gpdu.push((op << 2) | GPCF_CTL);
        gpdu.extend_from_slice(params);
        Self::send_packet(adv, xmit, link.packet(0, &gpdu), cb)
    }

    fn send_ack(link: &Link, xact: u8, adv: &mut Adv) -> Result<(), ProvError> {
        Self::send_packet(adv, ack_xmit(), link.packet(xact, &[GPCF_ACK]), SendCb::PbAdv)
    }

    /// Open a link to the unprovisioned device `uuid`
    pub fn open(
        &mut self,
        link_id: u32,
        uuid: &[u8; 16],
        adv: &mut Adv,
        sched: &mut Scheduler,
    ) -> Result<(), ProvError> {
        if self.link.is_some() {
            return Err(ProvError::Busy);
        }
        debug!("Opening link 0x{:08x} to {}", link_id, hex::encode(uuid));
        let link = Link::new(link_id, true, *uuid);
        Self::send_ctl(&link, LINK_OPEN, uuid, adv, reliable_xmit(), SendCb::PbAdv)?;
        self.link = Some(link);
        sched.reschedule(Work::PbAdvRetransmit, RETRANSMIT_TIMEOUT_MS);
        sched.reschedule(Work::PbAdvLinkTimeout, LINK_TIMEOUT_MS);
        Ok(())
    }

    /// Send a provisioning PDU; it waits while another transaction is
    /// unacknowledged
    pub fn send(&mut self, pdu: &[u8], adv: &mut Adv, sched: &mut Scheduler) -> Result<(), ProvError> {
        let link = match self.link.as_mut() {
            Some(link) if link.opened && link.closing.is_none() => link,
            _ => return Err(ProvError::NotActive),
        };
        if pdu.is_empty() || pdu.len() > PDU_MAX_LEN {
            return Err(ProvError::InvalidArgument);
        }
        if link.tx.is_some() {
            link.queue.push_back(pdu.to_vec());
            return Ok(());
        }
        Self::start_tx(link, pdu, adv, sched)
    }

    fn start_tx(link: &mut Link, pdu: &[u8], adv: &mut Adv, sched: &mut Scheduler) -> Result<(), ProvError> {
        let xact = link.take_xact();
        let segs = segment(pdu);
        debug!("xact 0x{:02x} len {} segs {}", xact, pdu.len(), segs.len());
        for seg in &segs {
            Self::send_packet(adv, reliable_xmit(), link.packet(xact, seg), SendCb::PbAdv)?;
        }
        link.tx = Some(Transaction { xact, segs });
        sched.reschedule(Work::PbAdvRetransmit, RETRANSMIT_TIMEOUT_MS);
        sched.schedule(Work::PbAdvLinkTimeout, LINK_TIMEOUT_MS);
        Ok(())
    }

    /// `Work::PbAdvRetransmit` expiry
    pub fn retransmit(&mut self, adv: &mut Adv, sched: &mut Scheduler) {
        let Some(link) = self.link.as_ref() else {
            return;
        };
        if link.closing.is_some() {
            return;
        }

        let result = if !link.opened {
            Self::send_ctl(link, LINK_OPEN, &link.uuid, adv, reliable_xmit(), SendCb::PbAdv)
        } else if let Some(tx) = &link.tx {
            debug!("Retransmitting xact 0x{:02x}", tx.xact);
            tx.segs.iter().try_for_each(|seg| {
                Self::send_packet(adv, reliable_xmit(), link.packet(tx.xact, seg), SendCb::PbAdv)
            })
        } else {
            return;
        };
        if let Err(e) = result {
            warn!("Retransmission failed: {}", e);
        }
        sched.reschedule(Work::PbAdvRetransmit, RETRANSMIT_TIMEOUT_MS);
    }

    /// `Work::PbAdvLinkTimeout` expiry
    pub fn link_timeout(&mut self, adv: &mut Adv, sched: &mut Scheduler) -> Vec<PbAdvEvent> {
        if self.link.is_none() {
            return Vec::new();
        }
        warn!("Link timeout");
        self.close(CloseReason::Timeout, adv, sched)
    }

    /// Close the link. [`PbAdvEvent::Closed`] follows once the Link Close
    /// went on air, or immediately if it could not be queued.
    pub fn close(&mut self, reason: CloseReason, adv: &mut Adv, sched: &mut Scheduler) -> Vec<PbAdvEvent> {
        let Some(link) = self.link.as_mut() else {
            return Vec::new();
        };
        if link.closing.is_some() {
            return Vec::new();
        }
        debug!("Closing link 0x{:08x}: {:?}", link.id, reason);
        adv.cancel(SendCb::PbAdv);
        sched.cancel(Work::PbAdvRetransmit);
        sched.cancel(Work::PbAdvLinkTimeout);
        link.tx = None;
        link.queue.clear();
        link.closing = Some(reason);

        let sent = Self::send_ctl(
            link,
            LINK_CLOSE,
            &[reason as u8],
            adv,
            ack_xmit(),
            SendCb::PbAdvClose,
        );
        if sent.is_err() {
            self.reset(adv, sched);
            return vec![PbAdvEvent::Closed(reason)];
        }
        Vec::new()
    }

    /// The advertising bearer finished sending our Link Close
    pub fn close_sent(&mut self, adv: &mut Adv, sched: &mut Scheduler) -> Vec<PbAdvEvent> {
        match self.link.as_ref().and_then(|l| l.closing) {
            Some(reason) => {
                self.reset(adv, sched);
                vec![PbAdvEvent::Closed(reason)]
            }
            None => Vec::new(),
        }
    }

    /// Forget the link without telling the peer
    pub fn reset(&mut self, adv: &mut Adv, sched: &mut Scheduler) {
        sched.cancel(Work::PbAdvRetransmit);
        sched.cancel(Work::PbAdvLinkTimeout);
        adv.cancel(SendCb::PbAdv);
        self.link = None;
    }

    /// A Mesh Provisioning AD structure arrived. `own_uuid` is set while
    /// this node accepts links as an unprovisioned device.
    pub fn recv(
        &mut self,
        data: &[u8],
        own_uuid: Option<&[u8; 16]>,
        adv: &mut Adv,
        sched: &mut Scheduler,
    ) -> Vec<PbAdvEvent> {
        if data.len() < HDR_LEN + 1 {
            warn!("Too short PB-ADV packet ({} bytes)", data.len());
            return Vec::new();
        }
        let link_id = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let xact = data[4];
        let gpdu = &data[HDR_LEN..];

        if gpdu[0] & 0x03 == GPCF_CTL {
            return self.recv_ctl(link_id, gpdu, own_uuid, adv, sched);
        }

        let link = match self.link.as_mut() {
            Some(link) if link.id == link_id && link.opened && link.closing.is_none() => link,
            _ => return Vec::new(),
        };

        let result = match gpdu[0] & 0x03 {
            GPCF_ACK => {
                Self::recv_ack(link, xact, adv, sched);
                Ok(None)
            }
            GPCF_START => Self::recv_start(link, xact, gpdu, adv),
            _ => Self::recv_cont(link, xact, gpdu, adv),
        };
        match result {
            Ok(Some(pdu)) => vec![PbAdvEvent::Pdu(pdu)],
            Ok(None) => Vec::new(),
            Err(reason) => vec![PbAdvEvent::Error(reason)],
        }
    }

    fn recv_ctl(
        &mut self,
        link_id: u32,
        gpdu: &[u8],
        own_uuid: Option<&[u8; 16]>,
        adv: &mut Adv,
        sched: &mut Scheduler,
    ) -> Vec<PbAdvEvent> {
        let params = &gpdu[1..];
        match gpdu[0] >> 2 {
            LINK_OPEN => {
                if params.len() != 16 {
                    warn!("Invalid Link Open length {}", params.len());
                    return Vec::new();
                }
                match self.link.as_ref() {
                    // Our ack got lost
                    Some(link) if link.id == link_id && !link.provisioner => {
                        if let Err(e) = Self::send_ctl(link, LINK_ACK, &[], adv, ack_xmit(), SendCb::PbAdv) {
                            warn!("Failed to ack Link Open: {}", e);
                        }
                        Vec::new()
                    }
                    Some(_) => {
                        debug!("Ignoring Link Open for 0x{:08x} while busy", link_id);
                        Vec::new()
                    }
                    None => {
                        let Some(uuid) = own_uuid.filter(|uuid| uuid.as_slice() == params) else {
                            return Vec::new();
                        };
                        debug!("Link 0x{:08x} opened", link_id);
                        let link = Link::new(link_id, false, *uuid);
                        if let Err(e) = Self::send_ctl(&link, LINK_ACK, &[], adv, ack_xmit(), SendCb::PbAdv) {
                            warn!("Failed to ack Link Open: {}", e);
                        }
                        self.link = Some(link);
                        vec![PbAdvEvent::Opened]
                    }
                }
            }
            LINK_ACK => match self.link.as_mut() {
                Some(link) if link.id == link_id && link.provisioner && !link.opened => {
                    debug!("Link 0x{:08x} acknowledged", link_id);
                    link.opened = true;
                    sched.cancel(Work::PbAdvRetransmit);
                    sched.cancel(Work::PbAdvLinkTimeout);
                    vec![PbAdvEvent::Opened]
                }
                _ => Vec::new(),
            },
            LINK_CLOSE => {
                if !matches!(&self.link, Some(link) if link.id == link_id) {
                    return Vec::new();
                }
                let reason = params
                    .first()
                    .and_then(|&r| CloseReason::from_raw(r))
                    .unwrap_or(CloseReason::Fail);
                debug!("Link 0x{:08x} closed by peer: {:?}", link_id, reason);
                self.reset(adv, sched);
                vec![PbAdvEvent::Closed(reason)]
            }
            op => {
                warn!("Unknown bearer opcode 0x{:02x}", op);
                Vec::new()
            }
        }
    }

    fn recv_ack(link: &mut Link, xact: u8, adv: &mut Adv, sched: &mut Scheduler) {
        if !matches!(&link.tx, Some(tx) if tx.xact == xact) {
            return;
        }
        debug!("xact 0x{:02x} acknowledged", xact);
        link.tx = None;
        sched.cancel(Work::PbAdvRetransmit);
        sched.cancel(Work::PbAdvLinkTimeout);

        if let Some(next) = link.queue.pop_front() {
            if let Err(e) = Self::start_tx(link, &next, adv, sched) {
                warn!("Failed to send queued PDU: {}", e);
            }
        }
    }

    fn recv_start(link: &mut Link, xact: u8, gpdu: &[u8], adv: &mut Adv) -> Result<Option<Vec<u8>>, u8> {
        if link.rx.last == Some(xact) {
            debug!("Resending ack for xact 0x{:02x}", xact);
            if let Err(e) = Self::send_ack(link, xact, adv) {
                warn!("Failed to ack xact 0x{:02x}: {}", xact, e);
            }
            return Ok(None);
        }
        if link.rx.xact == Some(xact) && link.rx.seg_mask & 0x01 != 0 {
            return Ok(None);
        }
        if gpdu.len() < 5 {
            warn!("Too short Transaction Start");
            return Ok(None);
        }

        let total = u16::from_be_bytes([gpdu[1], gpdu[2]]) as usize;
        let seg_last = gpdu[0] >> 2;
        let payload = &gpdu[4..];
        if total == 0 || total > PDU_MAX_LEN {
            error!("Invalid transaction length {}", total);
            return Err(reason::INVALID_FORMAT);
        }
        if seg_last != last_seg(total) || payload.len() != total.min(START_PAYLOAD_MAX) {
            error!("Transaction of {} bytes with last segment {}", total, seg_last);
            return Err(reason::INVALID_FORMAT);
        }

        let rx = &mut link.rx;
        rx.xact = Some(xact);
        rx.buf = vec![0; total];
        rx.buf[..payload.len()].copy_from_slice(payload);
        rx.fcs = gpdu[3];
        rx.last_seg = seg_last;
        rx.seg_mask = 0x01;
        Ok(Self::rx_finish(link, adv))
    }

    fn recv_cont(link: &mut Link, xact: u8, gpdu: &[u8], adv: &mut Adv) -> Result<Option<Vec<u8>>, u8> {
        let rx = &mut link.rx;
        // Continuations ahead of their Start are dropped; the sender repeats
        if rx.xact != Some(xact) || rx.seg_mask & 0x01 == 0 {
            return Ok(None);
        }
        let seg = gpdu[0] >> 2;
        if seg == 0 || seg > rx.last_seg {
            error!("Invalid segment index {}", seg);
            return Err(reason::INVALID_FORMAT);
        }
        if rx.seg_mask & (1 << seg) != 0 {
            return Ok(None);
        }

        let offset = START_PAYLOAD_MAX + (seg as usize - 1) * CONT_PAYLOAD_MAX;
        let expected = if seg == rx.last_seg {
            rx.buf.len() - offset
        } else {
            CONT_PAYLOAD_MAX
        };
        let payload = &gpdu[1..];
        if payload.len() != expected {
            error!("Segment {} of {} bytes, expected {}", seg, payload.len(), expected);
            return Err(reason::INVALID_FORMAT);
        }
        rx.buf[offset..offset + expected].copy_from_slice(payload);
        rx.seg_mask |= 1 << seg;
        Ok(Self::rx_finish(link, adv))
    }

    fn rx_finish(link: &mut Link, adv: &mut Adv) -> Option<Vec<u8>> {
        if !link.rx.complete() {
            return None;
        }
        let xact = link.rx.xact.take()?;
        let buf = std::mem::take(&mut link.rx.buf);
        link.rx.seg_mask = 0;

        if !fcs_check(&buf, link.rx.fcs) {
            warn!("Incorrect FCS for xact 0x{:02x}", xact);
            return None;
        }
        link.rx.last = Some(xact);
        if let Err(e) = Self::send_ack(link, xact, adv) {
            warn!("Failed to ack xact 0x{:02x}: {}", xact, e);
        }
        Some(buf)
    }
}
