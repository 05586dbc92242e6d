//! Access layer
//!
//! Owns the node composition (elements and their SIG and vendor models) and
//! dispatches decrypted access messages to every model whose opcode table,
//! key bindings and subscriptions match. Publication timers live in
//! [`publication`], persistence of bindings, subscriptions and publication
//! parameters in [`persist`].

pub mod persist;
pub mod publication;

pub use publication::{pub_transmit, ModelPub, PubParams, PubTx};

use thiserror::Error;
use tracing::{debug, error, warn};

use crate::addr::{self, BoundKey, KeyRef};
use crate::config::MeshConfig;
use crate::net::MsgCtx;

/// Largest upper transport SDU
pub const TX_SDU_MAX: usize = 384;
/// Transport MIC appended to application messages
pub const MIC_SHORT: usize = 4;

/// Reserved single-octet opcode
const OP_RFU: u8 = 0x7f;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AccessError {
    #[error("Unable to decode opcode")]
    InvalidOpcode,
    #[error("Invalid length {len} for opcode 0x{opcode:06x}")]
    InvalidLength { opcode: u32, len: usize },
    #[error("No free slot")]
    NoResources,
    #[error("Not supported")]
    NotSupported,
    #[error("Publication address not assigned")]
    AddrNotAvail,
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("Message of {0} bytes does not fit the maximum SDU")]
    MsgSize(usize),
    #[error("Model not bound to key 0x{0:04x}")]
    NotBound(u16),
    #[error("No such model")]
    InvalidModel,
    #[error("Invalid address 0x{0:04x}")]
    InvalidAddress(u16),
    #[error("Local node is not provisioned")]
    NotProvisioned,
    #[error("Model handler failed: {0}")]
    Handler(String),
}

// ============================================================================
// Opcodes
// ============================================================================

pub const fn op_1(b0: u8) -> u32 {
    b0 as u32
}

pub const fn op_2(b0: u8, b1: u8) -> u32 {
    ((b0 as u32) << 8) | b1 as u32
}

/// Vendor opcode: one octet followed by the company identifier
pub const fn op_3(b0: u8, company: u16) -> u32 {
    ((b0 as u32) << 16) | company as u32
}

pub fn op_len(opcode: u32) -> usize {
    if opcode < 0x100 {
        1
    } else if opcode < 0x10000 {
        2
    } else {
        3
    }
}

/// Split the opcode off an access payload, returning it and the parameters
pub fn parse_opcode(buf: &[u8]) -> Result<(u32, &[u8]), AccessError> {
    let first = *buf.first().ok_or(AccessError::InvalidOpcode)?;
    match first >> 6 {
        0x00 | 0x01 => {
            if first == OP_RFU {
                error!("Ignoring RFU OpCode");
                return Err(AccessError::InvalidOpcode);
            }
            Ok((first as u32, &buf[1..]))
        }
        0x02 => {
            if buf.len() < 2 {
                error!("Too short payload for 2-octet OpCode");
                return Err(AccessError::InvalidOpcode);
            }
            Ok((op_2(buf[0], buf[1]), &buf[2..]))
        }
        _ => {
            if buf.len() < 3 {
                error!("Too short payload for 3-octet OpCode");
                return Err(AccessError::InvalidOpcode);
            }
            // Company identifier is little-endian on the air
            let company = u16::from_le_bytes([buf[1], buf[2]]);
            Ok((op_3(buf[0], company), &buf[3..]))
        }
    }
}

/// Start an access payload with `opcode`
pub fn encode_opcode(opcode: u32, buf: &mut Vec<u8>) {
    match op_len(opcode) {
        1 => buf.push(opcode as u8),
        2 => buf.extend_from_slice(&(opcode as u16).to_be_bytes()),
        _ => {
            buf.push((opcode >> 16) as u8);
            buf.extend_from_slice(&(opcode as u16).to_le_bytes());
        }
    }
}

// ============================================================================
// Models and composition
// ============================================================================

/// Stable reference to a model in the composition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelRef {
    pub elem_idx: u8,
    pub vnd: bool,
    pub mod_idx: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelId {
    Sig(u16),
    Vendor { company: u16, id: u16 },
}

/// Length requirement of an opcode's parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgLen {
    Min(usize),
    Exact(usize),
}

impl MsgLen {
    fn accepts(&self, len: usize) -> bool {
        match *self {
            MsgLen::Min(min) => len >= min,
            MsgLen::Exact(exact) => len == exact,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelOp {
    pub opcode: u32,
    pub len: MsgLen,
}

/// Behavior of one model
pub trait ModelHandler: Send {
    /// Opcodes this model handles
    fn ops(&self) -> &[ModelOp];

    /// Handle a message; a returned payload is sent back to the source
    fn handle(&mut self, opcode: u32, ctx: &MsgCtx, params: &[u8]) -> Option<Vec<u8>>;

    /// Refresh the publication message at the start of a period
    fn update(&mut self, _msg: &mut Vec<u8>) -> Result<(), AccessError> {
        Ok(())
    }

    /// Restore model-private data stored with `model_data_store`
    fn settings_set(&mut self, _name: Option<&str>, _data: Option<&[u8]>) -> Result<(), AccessError> {
        Ok(())
    }

    fn init(&mut self) -> Result<(), AccessError> {
        Ok(())
    }

    /// Node reset
    fn reset(&mut self) {}
}

/// Change categories pending a store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct ModPending {
    pub bind: bool,
    pub sub: bool,
    pub publication: bool,
}

pub struct Model {
    pub id: ModelId,
    elem_idx: u8,
    mod_idx: u8,
    keys: Vec<Option<BoundKey>>,
    groups: Vec<Option<u16>>,
    publication: Option<ModelPub>,
    handler: Box<dyn ModelHandler>,
    ring: Option<usize>,
    extended: bool,
    pub(crate) pending: ModPending,
}

impl Model {
    pub fn sig(id: u16, handler: Box<dyn ModelHandler>) -> Self {
        Self::new(ModelId::Sig(id), handler)
    }

    pub fn vendor(company: u16, id: u16, handler: Box<dyn ModelHandler>) -> Self {
        Self::new(ModelId::Vendor { company, id }, handler)
    }

    fn new(id: ModelId, handler: Box<dyn ModelHandler>) -> Self {
        Self {
            id,
            elem_idx: 0,
            mod_idx: 0,
            keys: Vec::new(),
            groups: Vec::new(),
            publication: None,
            handler,
            ring: None,
            extended: false,
            pending: ModPending::default(),
        }
    }

    /// Give the model a publication context
    pub fn with_pub(mut self, publication: ModelPub) -> Self {
        self.publication = Some(publication);
        self
    }

    pub fn model_ref(&self) -> ModelRef {
        ModelRef {
            elem_idx: self.elem_idx,
            vnd: matches!(self.id, ModelId::Vendor { .. }),
            mod_idx: self.mod_idx,
        }
    }

    pub fn is_vnd(&self) -> bool {
        matches!(self.id, ModelId::Vendor { .. })
    }

    pub fn has_key(&self, key: KeyRef) -> bool {
        self.keys.iter().flatten().any(|bound| bound.accepts(key))
    }

    pub fn keys(&self) -> impl Iterator<Item = BoundKey> + '_ {
        self.keys.iter().flatten().copied()
    }

    pub fn groups(&self) -> impl Iterator<Item = u16> + '_ {
        self.groups.iter().flatten().copied()
    }

    fn has_group(&self, addr: u16) -> bool {
        self.groups.iter().flatten().any(|g| *g == addr)
    }

    pub fn publication(&self) -> Option<&ModelPub> {
        self.publication.as_ref()
    }

    pub fn publication_mut(&mut self) -> Option<&mut ModelPub> {
        self.publication.as_mut()
    }

    pub fn is_extended(&self) -> bool {
        self.extended
    }

    fn find_op(&self, opcode: u32) -> Option<ModelOp> {
        self.handler.ops().iter().copied().find(|op| op.opcode == opcode)
    }
}

pub struct Element {
    /// Location descriptor
    pub loc: u16,
    addr: u16,
    models: Vec<Model>,
    vnd_models: Vec<Model>,
}

impl Element {
    pub fn new(loc: u16, models: Vec<Model>) -> Self {
        let (vnd_models, models) = models.into_iter().partition(Model::is_vnd);
        Self {
            loc,
            addr: addr::ADDR_UNASSIGNED,
            models,
            vnd_models,
        }
    }

    pub fn addr(&self) -> u16 {
        self.addr
    }

    pub fn models(&self) -> &[Model] {
        &self.models
    }

    pub fn vnd_models(&self) -> &[Model] {
        &self.vnd_models
    }

    fn all_models(&self) -> impl Iterator<Item = &Model> {
        self.models.iter().chain(self.vnd_models.iter())
    }

    fn find_group(&self, group: u16) -> bool {
        self.all_models().any(|m| m.has_group(group))
    }
}

/// Node composition data
pub struct Composition {
    pub cid: u16,
    pub pid: u16,
    pub vid: u16,
    pub elements: Vec<Element>,
}

/// Outgoing access message produced by the access layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessTx {
    pub src: u16,
    pub ctx: MsgCtx,
    pub payload: Vec<u8>,
}

/// Result of dispatching one message
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Dispatch {
    pub opcode: u32,
    /// Models that handled the message
    pub handled: Vec<ModelRef>,
    pub replies: Vec<AccessTx>,
}

pub type MsgCb = Box<dyn FnMut(u32, &MsgCtx, &[u8]) + Send>;

pub struct Access {
    comp: Composition,
    /// Extension rings: ring id to members in ring order
    rings: Vec<Vec<ModelRef>>,
    primary_addr: u16,
    msg_cb: Option<MsgCb>,
    suspended: bool,
    store_requested: bool,
}

impl Access {
    /// Register the composition and initialize every model
    pub fn new(mut comp: Composition, config: &MeshConfig) -> Result<Self, AccessError> {
        if comp.elements.is_empty() {
            return Err(AccessError::InvalidArgument("no elements"));
        }
        if comp.elements.len() > u8::MAX as usize {
            return Err(AccessError::InvalidArgument("too many elements"));
        }

        for (elem_idx, elem) in comp.elements.iter_mut().enumerate() {
            let lists = [&mut elem.models, &mut elem.vnd_models];
            for models in lists {
                for (mod_idx, model) in models.iter_mut().enumerate() {
                    model.elem_idx = elem_idx as u8;
                    model.mod_idx = mod_idx as u8;
                    model.keys = vec![None; config.model_key_count];
                    model.groups = vec![None; config.model_group_count];
                    if let ModelId::Vendor { company, id } = model.id {
                        let foreign = model
                            .handler
                            .ops()
                            .iter()
                            .any(|op| op_len(op.opcode) == 3 && (op.opcode & 0xffff) as u16 != company);
                        if foreign {
                            error!(
                                "Invalid vendor model(company:0x{:04x} id:0x{:04x}) opcode",
                                company, id
                            );
                            return Err(AccessError::InvalidArgument("vendor opcode company"));
                        }
                    }
                    model.handler.init()?;
                }
            }
        }

        Ok(Self {
            comp,
            rings: Vec::new(),
            primary_addr: addr::ADDR_UNASSIGNED,
            msg_cb: None,
            suspended: false,
            store_requested: false,
        })
    }

    pub fn composition(&self) -> &Composition {
        &self.comp
    }

    pub fn elem_count(&self) -> u8 {
        self.comp.elements.len() as u8
    }

    pub fn primary_addr(&self) -> u16 {
        self.primary_addr
    }

    /// Assign consecutive unicast addresses to the elements
    pub fn comp_provision(&mut self, addr: u16) {
        self.primary_addr = addr;
        debug!("addr 0x{:04x} elem_count {}", addr, self.comp.elements.len());
        for (i, elem) in self.comp.elements.iter_mut().enumerate() {
            elem.addr = addr + i as u16;
        }
    }

    pub fn comp_unprovision(&mut self) {
        debug!("Unprovisioned composition");
        self.primary_addr = addr::ADDR_UNASSIGNED;
        for elem in self.comp.elements.iter_mut() {
            elem.addr = addr::ADDR_UNASSIGNED;
        }
    }

    /// Element with unicast address `addr`
    pub fn elem_find(&self, addr: u16) -> Option<&Element> {
        if !addr::is_unicast(addr) || !addr::is_unicast(self.primary_addr) {
            return None;
        }
        let index = addr.checked_sub(self.primary_addr)? as usize;
        self.comp.elements.get(index)
    }

    /// Whether `addr` is an element address or a subscribed group
    pub fn has_addr(&self, addr: u16) -> bool {
        if addr::is_unicast(addr) {
            return self.elem_find(addr).is_some();
        }
        if self.msg_cb.is_some() {
            return true;
        }
        self.comp.elements.iter().any(|e| e.find_group(addr))
    }

    pub fn set_msg_cb(&mut self, cb: MsgCb) {
        self.msg_cb = Some(cb);
    }

    pub fn model(&self, model: ModelRef) -> Option<&Model> {
        let elem = self.comp.elements.get(model.elem_idx as usize)?;
        let list = if model.vnd { &elem.vnd_models } else { &elem.models };
        list.get(model.mod_idx as usize)
    }

    pub fn model_mut(&mut self, model: ModelRef) -> Option<&mut Model> {
        let elem = self.comp.elements.get_mut(model.elem_idx as usize)?;
        let list = if model.vnd {
            &mut elem.vnd_models
        } else {
            &mut elem.models
        };
        list.get_mut(model.mod_idx as usize)
    }

    fn model_or_err(&mut self, model: ModelRef) -> Result<&mut Model, AccessError> {
        self.model_mut(model).ok_or(AccessError::InvalidModel)
    }

    pub fn model_find(&self, elem_idx: u8, id: u16) -> Option<ModelRef> {
        let elem = self.comp.elements.get(elem_idx as usize)?;
        elem.models
            .iter()
            .find(|m| m.id == ModelId::Sig(id))
            .map(Model::model_ref)
    }

    pub fn model_find_vnd(&self, elem_idx: u8, company: u16, id: u16) -> Option<ModelRef> {
        let elem = self.comp.elements.get(elem_idx as usize)?;
        elem.vnd_models
            .iter()
            .find(|m| m.id == ModelId::Vendor { company, id })
            .map(Model::model_ref)
    }

    pub fn models(&self) -> impl Iterator<Item = &Model> {
        self.comp.elements.iter().flat_map(|e| e.all_models())
    }

    fn model_refs(&self) -> Vec<ModelRef> {
        self.models().map(Model::model_ref).collect()
    }

    // ------------------------------------------------------------------------
    // Model extension
    // ------------------------------------------------------------------------

    /// Make `extending` extend `base`; both then share one extension ring
    pub fn extend(&mut self, extending: ModelRef, base: ModelRef) -> Result<(), AccessError> {
        let ring_a = self.model(extending).ok_or(AccessError::InvalidModel)?.ring;
        let ring_b = self.model_or_err(base)?.ring;
        if let Some(model) = self.model_mut(base) {
            model.extended = true;
        }
        if extending == base {
            return Ok(());
        }

        match (ring_a, ring_b) {
            (Some(a), Some(b)) if a == b => {}
            (Some(a), Some(b)) => {
                let moved = std::mem::take(&mut self.rings[b]);
                for member in &moved {
                    if let Some(model) = self.model_mut(*member) {
                        model.ring = Some(a);
                    }
                }
                self.rings[a].extend(moved);
            }
            (Some(a), None) => self.join_ring(a, base),
            (None, Some(b)) => self.join_ring(b, extending),
            (None, None) => {
                let id = match self.rings.iter().position(Vec::is_empty) {
                    Some(id) => id,
                    None => {
                        self.rings.push(Vec::new());
                        self.rings.len() - 1
                    }
                };
                self.join_ring(id, extending);
                self.join_ring(id, base);
            }
        }
        Ok(())
    }

    fn join_ring(&mut self, ring: usize, member: ModelRef) {
        self.rings[ring].push(member);
        if let Some(model) = self.model_mut(member) {
            model.ring = Some(ring);
        }
    }

    /// `model` followed by the other members of its extension ring
    pub fn extensions(&self, model: ModelRef) -> Vec<ModelRef> {
        let mut walk = vec![model];
        if let Some(ring) = self.model(model).and_then(|m| m.ring) {
            walk.extend(self.rings[ring].iter().copied().filter(|m| *m != model));
        }
        walk
    }

    /// Model in `model`'s extension ring on the same element that is
    /// subscribed to `group`
    pub fn find_group(&self, model: ModelRef, group: u16) -> Option<ModelRef> {
        self.extensions(model)
            .into_iter()
            .filter(|m| m.elem_idx == model.elem_idx)
            .find(|m| self.model(*m).is_some_and(|m| m.has_group(group)))
    }

    /// Fixed group addresses match every primary element model here. The
    /// feature gating (relays, proxies, friends) belongs to the caller,
    /// which must check `Cfg::fixed_group_match` before dispatching.
    fn model_has_dst(&self, model: &Model, dst: u16) -> bool {
        if addr::is_unicast(dst) {
            return self
                .comp
                .elements
                .get(model.elem_idx as usize)
                .is_some_and(|e| e.addr == dst);
        }
        if addr::is_group(dst) || addr::is_virtual(dst) {
            if addr::is_fixed_group(dst) {
                return model.elem_idx == 0;
            }
            return self.find_group(model.model_ref(), dst).is_some();
        }
        model.elem_idx == 0
    }

    // ------------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------------

    /// Deliver an access message to every matching model
    ///
    /// A fixed group `recv_dst` is taken as already accepted for the
    /// node's enabled features.
    pub fn recv(&mut self, ctx: &MsgCtx, buf: &[u8]) -> Result<Dispatch, AccessError> {
        debug!(
            "key {:?} src 0x{:04x} dst 0x{:04x} len {}",
            ctx.key,
            ctx.addr,
            ctx.recv_dst,
            buf.len()
        );
        let (opcode, params) = parse_opcode(buf).map_err(|e| {
            warn!("Unable to decode OpCode");
            e
        })?;
        debug!("OpCode 0x{:08x}", opcode);

        let vendor = op_len(opcode) == 3;
        let mut dispatch = Dispatch {
            opcode,
            ..Dispatch::default()
        };

        for elem_idx in 0..self.comp.elements.len() {
            let Some(target) = self.find_op(elem_idx, vendor, opcode) else {
                debug!("No OpCode 0x{:08x} for elem {}", opcode, elem_idx);
                continue;
            };
            let Some(model) = self.model(target.0) else {
                continue;
            };
            let Some(key) = ctx.key else {
                continue;
            };
            if !model.has_key(key) {
                continue;
            }
            if !self.model_has_dst(model, ctx.recv_dst) {
                continue;
            }
            if !target.1.len.accepts(params.len()) {
                error!(
                    "Invalid message size for OpCode 0x{:08x}: {}",
                    opcode,
                    params.len()
                );
                continue;
            }

            let src = self.comp.elements[elem_idx].addr;
            let Some(model) = self.model_mut(target.0) else {
                continue;
            };
            // Each handler gets its own view of the parameters
            if let Some(reply) = model.handler.handle(opcode, ctx, params) {
                dispatch.replies.push(AccessTx {
                    src,
                    ctx: MsgCtx::to(ctx.net_idx, key, ctx.addr, addr::TTL_DEFAULT),
                    payload: reply,
                });
            }
            dispatch.handled.push(target.0);
        }

        if let Some(cb) = self.msg_cb.as_mut() {
            cb(opcode, ctx, params);
        }
        Ok(dispatch)
    }

    /// First model on the element whose opcode table holds `opcode`. SIG
    /// opcodes only match SIG models and vendor opcodes only vendor models
    /// of the same company.
    fn find_op(&self, elem_idx: usize, vendor: bool, opcode: u32) -> Option<(ModelRef, ModelOp)> {
        let elem = &self.comp.elements[elem_idx];
        let models = if vendor { &elem.vnd_models } else { &elem.models };
        models.iter().find_map(|model| {
            if let ModelId::Vendor { company, .. } = model.id {
                if (opcode & 0xffff) as u16 != company {
                    return None;
                }
            }
            model.find_op(opcode).map(|op| (model.model_ref(), op))
        })
    }

    /// Prepare a message from `model`, checking the key binding
    pub fn model_send(&self, model: ModelRef, ctx: MsgCtx, payload: Vec<u8>) -> Result<AccessTx, AccessError> {
        let m = self.model(model).ok_or(AccessError::InvalidModel)?;
        let key = ctx.key.ok_or(AccessError::InvalidArgument("no key"))?;
        if !m.has_key(key) {
            error!("Model not bound to key 0x{:04x}", key.to_raw());
            return Err(AccessError::NotBound(key.to_raw()));
        }
        if !addr::is_unicast(self.primary_addr) {
            error!("Local node is not yet provisioned");
            return Err(AccessError::NotProvisioned);
        }
        let src = self.comp.elements[model.elem_idx as usize].addr;
        Ok(AccessTx { src, ctx, payload })
    }

    // ------------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------------

    pub fn bind(&mut self, model: ModelRef, key: BoundKey) -> Result<(), AccessError> {
        let m = self.model_or_err(model)?;
        if m.keys.iter().flatten().any(|k| *k == key) {
            return Ok(());
        }
        let slot = m
            .keys
            .iter_mut()
            .find(|k| k.is_none())
            .ok_or(AccessError::NoResources)?;
        *slot = Some(key);
        m.pending.bind = true;
        self.store_requested = true;
        Ok(())
    }

    /// Remove a binding; a publication using the key is cleared with it
    pub fn unbind(&mut self, model: ModelRef, key: BoundKey) -> Result<(), AccessError> {
        let m = self.model_or_err(model)?;
        let slot = m
            .keys
            .iter_mut()
            .find(|k| **k == Some(key))
            .ok_or(AccessError::InvalidArgument("key not bound"))?;
        *slot = None;
        m.pending.bind = true;
        if let (Some(publication), BoundKey::App(idx)) = (m.publication.as_mut(), key) {
            if publication.key == idx && !addr::is_unassigned(publication.addr) {
                publication.clear();
                m.pending.publication = true;
            }
        }
        self.store_requested = true;
        Ok(())
    }

    pub fn sub_add(&mut self, model: ModelRef, group: u16) -> Result<(), AccessError> {
        if !addr::is_group(group) && !addr::is_virtual(group) {
            return Err(AccessError::InvalidAddress(group));
        }
        let m = self.model_or_err(model)?;
        if m.has_group(group) {
            return Ok(());
        }
        let slot = m
            .groups
            .iter_mut()
            .find(|g| g.is_none())
            .ok_or(AccessError::NoResources)?;
        *slot = Some(group);
        m.pending.sub = true;
        self.store_requested = true;
        Ok(())
    }

    pub fn sub_del(&mut self, model: ModelRef, group: u16) -> Result<(), AccessError> {
        let m = self.model_or_err(model)?;
        if let Some(slot) = m.groups.iter_mut().find(|g| **g == Some(group)) {
            *slot = None;
            m.pending.sub = true;
            self.store_requested = true;
        }
        Ok(())
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// True once after any change that needs the MOD flag scheduled
    pub fn take_store_request(&mut self) -> bool {
        std::mem::take(&mut self.store_requested)
    }

    /// Clear every binding, subscription and publication
    pub fn reset(&mut self, sched: &mut crate::scheduler::Scheduler) {
        for model in self.model_refs() {
            sched.cancel(crate::scheduler::Work::ModelPublish(model));
            if let Some(m) = self.model_mut(model) {
                m.keys.iter_mut().for_each(|k| *k = None);
                m.groups.iter_mut().for_each(|g| *g = None);
                if let Some(publication) = m.publication.as_mut() {
                    publication.clear();
                }
                m.pending = ModPending {
                    bind: true,
                    sub: true,
                    publication: m.publication.is_some(),
                };
                m.handler.reset();
            }
        }
        self.store_requested = true;
    }
}
