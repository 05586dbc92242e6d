// Provisioner role: provisions a remote device and records it in the
// configuration database.
//
// On any failure the provisioner does not send a Failed PDU; it closes the
// link, which also drops the node it allocated.

use tracing::{debug, warn};
use zeroize::Zeroize;

use super::*;
use crate::addr::ADDR_UNASSIGNED;
use crate::cdb::{CdbError, FLAG_KEY_REFRESH};

/// Authentication the provisioner asks the device to perform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    NoOob,
    Static,
    /// The device outputs a value the provisioner's user enters
    Output { action: OutputAction, size: u8 },
    /// The provisioner outputs a value the device's user enters
    Input { action: InputAction, size: u8 },
}

impl AuthMethod {
    /// Method, action and size fields of a Start PDU
    fn start_fields(self) -> [u8; 3] {
        match self {
            AuthMethod::NoOob => [AUTH_NO_OOB, 0, 0],
            AuthMethod::Static => [AUTH_STATIC, 0, 0],
            AuthMethod::Output { action, size } => [AUTH_OUTPUT, action.index(), size],
            AuthMethod::Input { action, size } => [AUTH_INPUT, action.index(), size],
        }
    }

    /// Whether the device's Capabilities allow this method
    fn supported_by(self, caps: &[u8]) -> bool {
        match self {
            AuthMethod::NoOob => true,
            AuthMethod::Static => caps[4] & 0x01 != 0,
            AuthMethod::Output { action, size } => {
                u16::from_be_bytes([caps[6], caps[7]]) & action.bit() != 0 && size <= caps[5]
            }
            AuthMethod::Input { action, size } => {
                u16::from_be_bytes([caps[9], caps[10]]) & action.bit() != 0 && size <= caps[8]
            }
        }
    }
}

/// Device to provision and where to put it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRequest {
    pub uuid: [u8; 16],
    pub net_idx: u16,
    /// Primary address; unassigned picks the lowest free range
    pub addr: u16,
    /// Attention timer sent in the Invite
    pub attention: u8,
    pub auth: AuthMethod,
}

impl NodeRequest {
    pub fn new(uuid: [u8; 16], net_idx: u16) -> Self {
        Self {
            uuid,
            net_idx,
            addr: ADDR_UNASSIGNED,
            attention: 0,
            auth: AuthMethod::NoOob,
        }
    }
}

#[derive(Debug)]
pub struct Provisioner {
    req: NodeRequest,
    /// Primary address of the node allocated in the CDB
    node: Option<u16>,
    done: bool,
}

impl Provisioner {
    pub fn new(req: NodeRequest) -> Self {
        Self {
            req,
            node: None,
            done: false,
        }
    }

    pub fn request(&self) -> &NodeRequest {
        &self.req
    }

    fn send_confirm(&mut self, ctx: &mut ProvCtx<'_>) -> Result<(), ProvError> {
        let conf = ctx.local_confirm()?;
        ctx.send(PROV_CONFIRM, &conf);
        ctx.link.expect = Some(PROV_CONFIRM);
        Ok(())
    }

    fn close(&mut self, ctx: &mut ProvCtx<'_>, reason: CloseReason) {
        ctx.link.expect = None;
        ctx.actions.push(ProvAction::Close(reason));
    }
}

impl ProvRole for Provisioner {
    fn is_provisioner(&self) -> bool {
        true
    }

    fn handles(&self, pdu_type: u8) -> bool {
        matches!(
            pdu_type,
            PROV_CAPABILITIES
                | PROV_PUB_KEY
                | PROV_INPUT_COMPLETE
                | PROV_CONFIRM
                | PROV_RANDOM
                | PROV_COMPLETE
                | PROV_FAILED
        )
    }

    fn link_opened(&mut self, ctx: &mut ProvCtx<'_>) -> Result<(), ProvError> {
        let invite = [self.req.attention];
        ctx.link.conf_inputs.invite = invite;
        ctx.send(PROV_INVITE, &invite);
        ctx.link.expect = Some(PROV_CAPABILITIES);
        Ok(())
    }

    fn link_closed(&mut self, ctx: &mut ProvCtx<'_>) {
        if self.done {
            return;
        }
        if let Some(addr) = self.node.take() {
            debug!("Dropping unfinished node 0x{:04x}", addr);
            ctx.cdb.node_del(addr, None);
        }
    }

    fn error(&mut self, ctx: &mut ProvCtx<'_>, reason: u8) {
        warn!("Provisioning failed with reason 0x{:02x}", reason);
        self.close(ctx, CloseReason::Fail);
    }

    fn input_complete(&mut self, ctx: &mut ProvCtx<'_>) -> Result<(), ProvError> {
        // Before the key exchange the confirm follows the device's key
        if ctx.link.dhkey.is_none() {
            return Ok(());
        }
        self.send_confirm(ctx)
    }

    fn on_capabilities(&mut self, ctx: &mut ProvCtx<'_>, data: &[u8]) -> Result<(), ProvError> {
        let num_elem = data[0];
        let algorithms = u16::from_be_bytes([data[1], data[2]]);
        debug!(
            "Elements: {} Algorithms: 0x{:04x} PubKey: 0x{:02x} Static OOB: 0x{:02x}",
            num_elem, algorithms, data[3], data[4]
        );
        debug!(
            "Output OOB: size {} actions 0x{:04x} Input OOB: size {} actions 0x{:04x}",
            data[5],
            u16::from_be_bytes([data[6], data[7]]),
            data[8],
            u16::from_be_bytes([data[9], data[10]])
        );

        if num_elem == 0 {
            warn!("Invalid number of elements");
            return Err(ProvError::InvalidFormat("element count"));
        }
        if algorithms & ALG_P256 == 0 {
            warn!("Device doesn't support P-256");
            return Err(ProvError::InvalidFormat("algorithms"));
        }
        if !self.req.auth.supported_by(data) {
            warn!("Device doesn't support {:?}", self.req.auth);
            return Err(ProvError::InvalidFormat("authentication"));
        }
        ctx.link.conf_inputs.capabilities.copy_from_slice(data);

        let requested = self.req.addr;
        let node = ctx
            .cdb
            .node_alloc(&self.req.uuid, requested, num_elem, self.req.net_idx)
            .map_err(|e| {
                warn!("Failed allocating node 0x{:04x}: {}", requested, e);
                match e {
                    CdbError::AddressConflict { .. } | CdbError::InvalidRange { .. } => {
                        ProvError::Address(requested)
                    }
                    _ => ProvError::Resources,
                }
            })?;
        self.node = Some(node.addr);

        let [method, action, size] = self.req.auth.start_fields();
        let start = [0x00, 0x00, method, action, size];
        ctx.link.conf_inputs.start = start;
        ctx.auth(true, method, action, size)?;
        ctx.send(PROV_START, &start);

        let local = ctx.local_public_key()?;
        ctx.link.conf_inputs.pub_key_prov = local;
        ctx.send(PROV_PUB_KEY, &local);
        ctx.link.expect = Some(PROV_PUB_KEY);
        Ok(())
    }

    fn on_pub_key(&mut self, ctx: &mut ProvCtx<'_>, data: &[u8]) -> Result<(), ProvError> {
        ctx.link.conf_inputs.pub_key_dev.copy_from_slice(data);
        ctx.dh(data)?;

        if ctx.waiting_for_input() {
            ctx.link.expect = None;
            return Ok(());
        }
        if ctx.link.notify_input_complete {
            ctx.link.expect = Some(PROV_INPUT_COMPLETE);
            return Ok(());
        }
        self.send_confirm(ctx)
    }

    fn on_input_complete(&mut self, ctx: &mut ProvCtx<'_>) -> Result<(), ProvError> {
        ctx.notify_input_complete();
        self.send_confirm(ctx)
    }

    fn on_confirm(&mut self, ctx: &mut ProvCtx<'_>, data: &[u8]) -> Result<(), ProvError> {
        ctx.peer_confirm(data)?;
        let rand = ctx.link.rand;
        ctx.send(PROV_RANDOM, &rand);
        ctx.link.expect = Some(PROV_RANDOM);
        Ok(())
    }

    fn on_random(&mut self, ctx: &mut ProvCtx<'_>, data: &[u8]) -> Result<(), ProvError> {
        ctx.check_confirm(data)?;
        let rand_prov = ctx.link.rand;
        let keys = ctx.session_keys(&rand_prov, data)?;

        let addr = self.node.ok_or(ProvError::Resources)?;
        let net_idx = self.req.net_idx;
        let flags = ctx.cdb.subnet_flags(net_idx);
        let sub = ctx.cdb.subnet_get(net_idx).ok_or_else(|| {
            warn!("No subnet with net_idx 0x{:03x}", net_idx);
            ProvError::Resources
        })?;
        let net_key = sub.keys[(flags & FLAG_KEY_REFRESH != 0) as usize];

        let mut plain = Vec::with_capacity(25);
        plain.extend_from_slice(&net_key);
        plain.extend_from_slice(&net_idx.to_be_bytes());
        plain.push(flags);
        plain.extend_from_slice(&ctx.cdb.iv_index().to_be_bytes());
        plain.extend_from_slice(&addr.to_be_bytes());
        let sealed = ctx.crypto.ccm_encrypt(&keys.key, &keys.nonce, &plain);
        plain.zeroize();
        let sealed = sealed?;

        if let Some(node) = ctx.cdb.node_get_mut(addr) {
            node.dev_key = keys.dev_key;
        }

        ctx.send(PROV_DATA, &sealed);
        ctx.link.expect = Some(PROV_COMPLETE);
        Ok(())
    }

    fn on_complete(&mut self, ctx: &mut ProvCtx<'_>) -> Result<(), ProvError> {
        let addr = self.node.ok_or(ProvError::Resources)?;
        self.done = true;
        let num_elem = ctx.cdb.node_get(addr).map_or(0, |n| n.num_elem);
        debug!("Node 0x{:04x} provisioned with {} elements", addr, num_elem);

        ctx.actions.push(ProvAction::NodeAdded { addr });
        ctx.app
            .node_added(self.req.net_idx, &self.req.uuid, addr, num_elem);
        self.close(ctx, CloseReason::Success);
        Ok(())
    }

    fn on_failed(&mut self, ctx: &mut ProvCtx<'_>, reason: u8) -> Result<(), ProvError> {
        warn!("Device failed provisioning with reason 0x{:02x}", reason);
        self.close(ctx, CloseReason::Fail);
        Ok(())
    }
}
