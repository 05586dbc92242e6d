// Proxy PDU segmentation and reassembly
//
// Every fragment starts with one header octet: SAR code in the top two bits,
// message type in the low six. A reassembly that stalls for 20 seconds gets
// the connection dropped.

use tracing::{debug, warn};

use super::ProxyError;
use crate::bearer::Bearer;
use crate::scheduler::{Scheduler, Work};

pub const SAR_TIMEOUT_MS: u64 = 20_000;

/// Largest reassembled proxy PDU
pub const MSG_LEN: usize = 68;

pub const TYPE_NET_PDU: u8 = 0x00;
pub const TYPE_BEACON: u8 = 0x01;
pub const TYPE_CONFIG: u8 = 0x02;
pub const TYPE_PROV: u8 = 0x03;

const SAR_COMPLETE: u8 = 0x00;
const SAR_FIRST: u8 = 0x01;
const SAR_CONT: u8 = 0x02;
const SAR_LAST: u8 = 0x03;

fn pdu_hdr(sar: u8, msg_type: u8) -> u8 {
    (sar << 6) | (msg_type & 0x3f)
}

pub fn pdu_type(data: &[u8]) -> Option<u8> {
    data.first().map(|b| b & 0x3f)
}

fn pdu_sar(hdr: u8) -> u8 {
    hdr >> 6
}

/// A reassembled proxy PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyPdu {
    pub msg_type: u8,
    pub data: Vec<u8>,
}

/// Reassembly state of one GATT connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRole {
    conn: u16,
    /// Type and data of the message being reassembled
    pending: Option<(u8, Vec<u8>)>,
}

impl ProxyRole {
    pub fn new(conn: u16) -> Self {
        Self { conn, pending: None }
    }

    pub fn conn(&self) -> u16 {
        self.conn
    }

    /// Message type and bytes buffered so far
    pub fn pending(&self) -> Option<(u8, &[u8])> {
        self.pending.as_ref().map(|(t, buf)| (*t, buf.as_slice()))
    }

    /// Feed one written fragment. Returns the message once it is complete.
    ///
    /// A rejected fragment leaves any reassembly in progress untouched.
    pub fn recv(&mut self, data: &[u8], sched: &mut Scheduler) -> Result<Option<ProxyPdu>, ProxyError> {
        let (&hdr, payload) = data.split_first().ok_or(ProxyError::TooShort)?;
        let msg_type = hdr & 0x3f;

        match pdu_sar(hdr) {
            SAR_COMPLETE => {
                if self.pending.is_some() {
                    warn!("Complete PDU while a pending incomplete one");
                    return Err(ProxyError::InProgress("Complete"));
                }
                check_len(payload.len())?;
                Ok(Some(ProxyPdu {
                    msg_type,
                    data: payload.to_vec(),
                }))
            }
            SAR_FIRST => {
                if self.pending.is_some() {
                    warn!("First PDU while a pending incomplete one");
                    return Err(ProxyError::InProgress("First"));
                }
                check_len(payload.len())?;
                sched.reschedule(Work::ProxySar(self.conn), SAR_TIMEOUT_MS);
                self.pending = Some((msg_type, payload.to_vec()));
                Ok(None)
            }
            sar => {
                let last = sar == SAR_LAST;
                let what = if last { "Last" } else { "Continuation" };
                let Some((expected, buf)) = self.pending.as_mut() else {
                    warn!("{} PDU with no prior data", what);
                    return Err(ProxyError::NoPriorData(what));
                };
                if *expected != msg_type {
                    warn!("Unexpected message type in {} PDU", what);
                    return Err(ProxyError::TypeMismatch {
                        expected: *expected,
                        got: msg_type,
                    });
                }
                check_len(buf.len() + payload.len())?;
                buf.extend_from_slice(payload);

                if !last {
                    sched.reschedule(Work::ProxySar(self.conn), SAR_TIMEOUT_MS);
                    return Ok(None);
                }
                sched.cancel(Work::ProxySar(self.conn));
                Ok(self.pending.take().map(|(msg_type, data)| ProxyPdu { msg_type, data }))
            }
        }
    }

    /// Drop any reassembly and its timer
    pub fn cleanup(&mut self, sched: &mut Scheduler) {
        sched.cancel(Work::ProxySar(self.conn));
        self.pending = None;
    }
}

fn check_len(len: usize) -> Result<(), ProxyError> {
    if len > MSG_LEN {
        warn!("Proxy PDU of {} bytes too long", len);
        return Err(ProxyError::Overflow(MSG_LEN));
    }
    Ok(())
}

/// Split `payload` into fragments of at most `mtu` bytes, header included.
///
/// Once a FIRST fragment has been emitted the final fragment is always LAST,
/// including when the remainder exactly fills one fragment.
pub fn segment(msg_type: u8, payload: &[u8], mtu: usize) -> Result<Vec<Vec<u8>>, ProxyError> {
    if mtu < 2 {
        return Err(ProxyError::MtuTooSmall(mtu));
    }

    let fragment = |sar: u8, chunk: &[u8]| {
        let mut frag = Vec::with_capacity(chunk.len() + 1);
        frag.push(pdu_hdr(sar, msg_type));
        frag.extend_from_slice(chunk);
        frag
    };

    if payload.len() < mtu {
        return Ok(vec![fragment(SAR_COMPLETE, payload)]);
    }

    let chunk_len = mtu - 1;
    let (first, mut rest) = payload.split_at(chunk_len);
    let mut fragments = vec![fragment(SAR_FIRST, first)];
    loop {
        if rest.len() <= chunk_len {
            fragments.push(fragment(SAR_LAST, rest));
            return Ok(fragments);
        }
        let (chunk, tail) = rest.split_at(chunk_len);
        fragments.push(fragment(SAR_CONT, chunk));
        rest = tail;
    }
}

/// Notify `payload` to `conn` on characteristic `chr`, segmenting it to the
/// connection's ATT MTU. Stops at the first failed notification.
pub fn send(
    bearer: &mut dyn Bearer,
    conn: u16,
    chr: u16,
    msg_type: u8,
    payload: &[u8],
) -> Result<(), ProxyError> {
    // ATT_MTU - opcode (1 byte) - handle (2 bytes)
    let mtu = bearer.att_mtu(conn).saturating_sub(3) as usize;
    debug!(
        "conn_handle {} type 0x{:02x} len {}: {}",
        conn,
        msg_type,
        payload.len(),
        hex::encode(payload)
    );
    for frag in segment(msg_type, payload, mtu)? {
        bearer.gatt_notify(conn, chr, &frag)?;
    }
    Ok(())
}

/// `Work::ProxySar` expiry: the peer stalled mid-message
pub fn sar_timeout(bearer: &mut dyn Bearer, role: &mut ProxyRole) {
    warn!("Proxy SAR timeout");
    role.pending = None;
    if let Err(e) = bearer.disconnect(role.conn) {
        warn!("Failed to disconnect 0x{:04x}: {}", role.conn, e);
    }
}
