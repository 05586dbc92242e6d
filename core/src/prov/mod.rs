//! Provisioning
//!
//! One provisioning link exists at a time. The link carries the
//! confirmation inputs, the OOB authentication value and the session
//! secrets; the PDU handlers live in a [`ProvRole`]: [`Device`] while this
//! node is being provisioned, [`Provisioner`] while it provisions another
//! node. Bearers ([`pb_adv`] and [`crate::proxy::pb_gatt`]) deliver complete
//! provisioning PDUs and carry out the [`ProvAction`]s returned here.

pub mod device;
pub mod pb_adv;
pub mod provisioner;

pub use device::Device;
pub use pb_adv::{PbAdv, PbAdvEvent};
pub use provisioner::{AuthMethod, NodeRequest, Provisioner};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, warn};
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::cdb::Cdb;
use crate::crypto::{self, CryptoError, MeshCrypto, DH_KEY_LEN, PUB_KEY_LEN};
use crate::scheduler::{Scheduler, Work};

pub const PROV_INVITE: u8 = 0x00;
pub const PROV_CAPABILITIES: u8 = 0x01;
pub const PROV_START: u8 = 0x02;
pub const PROV_PUB_KEY: u8 = 0x03;
pub const PROV_INPUT_COMPLETE: u8 = 0x04;
pub const PROV_CONFIRM: u8 = 0x05;
pub const PROV_RANDOM: u8 = 0x06;
pub const PROV_DATA: u8 = 0x07;
pub const PROV_COMPLETE: u8 = 0x08;
pub const PROV_FAILED: u8 = 0x09;

/// Parameter length of each PDU, indexed by type
const PDU_LEN: [usize; 10] = [1, 11, 5, PUB_KEY_LEN, 0, 16, 16, 33, 0, 1];

/// Longest provisioning PDU: a public key plus the type octet
pub const PDU_MAX_LEN: usize = 1 + PUB_KEY_LEN;

/// Provisioning fails if the peer makes no progress for this long
pub const PROTOCOL_TIMEOUT_MS: u64 = 60_000;

pub const AUTH_NO_OOB: u8 = 0x00;
pub const AUTH_STATIC: u8 = 0x01;
pub const AUTH_OUTPUT: u8 = 0x02;
pub const AUTH_INPUT: u8 = 0x03;

/// Longest numeric or alphanumeric OOB value
pub const OOB_SIZE_MAX: u8 = 8;

/// FIPS P-256 Elliptic Curve, the only defined algorithm
const ALG_P256: u16 = 0x0001;

const CONF_INPUTS_LEN: usize = 145;

/// Reason codes of a Provisioning Failed PDU
pub mod reason {
    pub const INVALID_PDU: u8 = 0x01;
    pub const INVALID_FORMAT: u8 = 0x02;
    pub const UNEXPECTED_PDU: u8 = 0x03;
    pub const CONFIRMATION_FAILED: u8 = 0x04;
    pub const OUT_OF_RESOURCES: u8 = 0x05;
    pub const DECRYPTION_FAILED: u8 = 0x06;
    pub const UNEXPECTED_ERROR: u8 = 0x07;
    pub const CANNOT_ASSIGN_ADDR: u8 = 0x08;
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProvError {
    #[error("Unknown provisioning PDU type 0x{0:02x}")]
    InvalidPdu(u8),
    #[error("Unexpected provisioning PDU 0x{0:02x}")]
    UnexpectedPdu(u8),
    #[error("Invalid {0}")]
    InvalidFormat(&'static str),
    #[error("Confirmation failed")]
    ConfirmFailed,
    #[error("Out of resources")]
    Resources,
    #[error("Provisioning data decryption failed")]
    Decrypt,
    #[error("Cannot assign address 0x{0:04x}")]
    Address(u16),
    #[error("Crypto: {0}")]
    Crypto(#[from] CryptoError),
    #[error("Peer failed provisioning with reason 0x{0:02x}")]
    Failed(u8),
    #[error("Invalid argument")]
    InvalidArgument,
    #[error("Not supported")]
    NotSupported,
    #[error("No active provisioning link")]
    NotActive,
    #[error("Provisioning link busy")]
    Busy,
    #[error("Bearer: {0}")]
    Bearer(String),
}

impl ProvError {
    /// Reason code reported to the peer for a failure of the protocol
    pub fn reason(&self) -> Option<u8> {
        match self {
            ProvError::InvalidPdu(_) => Some(reason::INVALID_PDU),
            ProvError::UnexpectedPdu(_) => Some(reason::UNEXPECTED_PDU),
            ProvError::InvalidFormat(_) => Some(reason::INVALID_FORMAT),
            ProvError::ConfirmFailed => Some(reason::CONFIRMATION_FAILED),
            ProvError::Resources => Some(reason::OUT_OF_RESOURCES),
            ProvError::Decrypt => Some(reason::DECRYPTION_FAILED),
            ProvError::Address(_) => Some(reason::CANNOT_ASSIGN_ADDR),
            ProvError::Crypto(_) => Some(reason::UNEXPECTED_ERROR),
            _ => None,
        }
    }
}

// ============================================================================
// OOB ACTIONS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputAction {
    Blink,
    Beep,
    Vibrate,
    DisplayNumber,
    DisplayString,
}

impl OutputAction {
    /// Action field of a Start PDU
    pub fn from_index(idx: u8) -> Option<Self> {
        match idx {
            0 => Some(OutputAction::Blink),
            1 => Some(OutputAction::Beep),
            2 => Some(OutputAction::Vibrate),
            3 => Some(OutputAction::DisplayNumber),
            4 => Some(OutputAction::DisplayString),
            _ => None,
        }
    }

    pub fn index(self) -> u8 {
        self as u8
    }

    /// Bit in the capabilities' output action mask
    pub fn bit(self) -> u16 {
        1 << self.index()
    }

    /// Counted actions cannot show zero
    fn excludes_zero(self) -> bool {
        matches!(
            self,
            OutputAction::Blink | OutputAction::Beep | OutputAction::Vibrate
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputAction {
    Push,
    Twist,
    EnterNumber,
    EnterString,
}

impl InputAction {
    pub fn from_index(idx: u8) -> Option<Self> {
        match idx {
            0 => Some(InputAction::Push),
            1 => Some(InputAction::Twist),
            2 => Some(InputAction::EnterNumber),
            3 => Some(InputAction::EnterString),
            _ => None,
        }
    }

    pub fn index(self) -> u8 {
        self as u8
    }

    pub fn bit(self) -> u16 {
        1 << self.index()
    }

    fn excludes_zero(self) -> bool {
        matches!(self, InputAction::Push | InputAction::Twist)
    }
}

// ============================================================================
// APPLICATION INTERFACE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvBearerType {
    Adv,
    Gatt,
}

/// Reason carried by a link close
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Success = 0x00,
    Timeout = 0x01,
    Fail = 0x02,
}

impl CloseReason {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0x00 => Some(CloseReason::Success),
            0x01 => Some(CloseReason::Timeout),
            0x02 => Some(CloseReason::Fail),
            _ => None,
        }
    }
}

/// Device capabilities and identity advertised to provisioners
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvInfo {
    pub uuid: Uuid,
    pub uri: Option<String>,
    pub oob_info: u16,
    pub output_size: u8,
    /// Mask of [`OutputAction::bit`]
    pub output_actions: u16,
    pub input_size: u8,
    /// Mask of [`InputAction::bit`]
    pub input_actions: u16,
}

/// Application side of provisioning
///
/// OOB callbacks return an error when the application cannot perform the
/// requested action; the link then fails with an invalid format.
pub trait ProvApp: Send {
    fn output_number(&mut self, _action: OutputAction, _number: u32) -> Result<(), ProvError> {
        Err(ProvError::NotSupported)
    }

    fn output_string(&mut self, _value: &str) -> Result<(), ProvError> {
        Err(ProvError::NotSupported)
    }

    /// Ask the user for a value; it comes back through `input_number` or
    /// `input_string`
    fn input(&mut self, _action: InputAction, _size: u8) -> Result<(), ProvError> {
        Err(ProvError::NotSupported)
    }

    /// The peer finished entering the value we output
    fn input_complete(&mut self) {}

    /// Attention timer from an Invite, in seconds. Zero turns it off.
    fn attention(&mut self, _secs: u8) {}

    fn link_open(&mut self, _bearer: ProvBearerType) {}

    fn link_close(&mut self, _bearer: ProvBearerType) {}

    /// This node was provisioned
    fn complete(&mut self, _net_idx: u16, _addr: u16) {}

    /// A node provisioned by us was added to the configuration database
    fn node_added(&mut self, _net_idx: u16, _uuid: &[u8; 16], _addr: u16, _num_elem: u8) {}

    /// Provisioning state was reset
    fn reset(&mut self) {}

    /// Static OOB value, if the device has one
    fn static_oob(&self) -> Option<[u8; 16]> {
        None
    }
}

/// Application with no OOB capabilities
#[derive(Debug, Default)]
pub struct NoOobApp;

impl ProvApp for NoOobApp {}

/// Provisioning parameters delivered to a device
#[derive(Debug, Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct ProvData {
    pub net_key: [u8; 16],
    pub net_idx: u16,
    pub flags: u8,
    pub iv_index: u32,
    pub addr: u16,
    pub dev_key: [u8; 16],
}

/// Work for the stack after a provisioning event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvAction {
    /// Send a PDU over the link's bearer
    Send(Vec<u8>),
    /// This device received its network parameters
    Provisioned(ProvData),
    /// A node we provisioned is ready to be persisted
    NodeAdded { addr: u16 },
    /// Close the link's bearer
    Close(CloseReason),
}

// ============================================================================
// LINK STATE
// ============================================================================

#[derive(Clone)]
struct ConfInputs {
    invite: [u8; 1],
    capabilities: [u8; 11],
    start: [u8; 5],
    pub_key_prov: [u8; PUB_KEY_LEN],
    pub_key_dev: [u8; PUB_KEY_LEN],
}

impl Default for ConfInputs {
    fn default() -> Self {
        Self {
            invite: [0; 1],
            capabilities: [0; 11],
            start: [0; 5],
            pub_key_prov: [0; PUB_KEY_LEN],
            pub_key_dev: [0; PUB_KEY_LEN],
        }
    }
}

impl ConfInputs {
    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(CONF_INPUTS_LEN);
        buf.extend_from_slice(&self.invite);
        buf.extend_from_slice(&self.capabilities);
        buf.extend_from_slice(&self.start);
        buf.extend_from_slice(&self.pub_key_prov);
        buf.extend_from_slice(&self.pub_key_dev);
        buf
    }
}

#[derive(Default)]
pub struct ProvLink {
    active: bool,
    bearer: Option<ProvBearerType>,
    /// Next PDU type accepted, besides Failed
    expect: Option<u8>,
    wait_number: bool,
    wait_string: bool,
    notify_input_complete: bool,
    oob_method: u8,
    oob_size: u8,
    conf_inputs: ConfInputs,
    auth: [u8; 16],
    dhkey: Option<[u8; DH_KEY_LEN]>,
    conf_salt: [u8; 16],
    conf_key: [u8; 16],
    /// Confirmation received from the peer
    conf: [u8; 16],
    /// Confirmation we sent
    local_conf: [u8; 16],
    /// Random we generated
    rand: [u8; 16],
    peer_rand: [u8; 16],
}

impl Drop for ProvLink {
    fn drop(&mut self) {
        self.auth.zeroize();
        self.dhkey.zeroize();
        self.conf_key.zeroize();
        self.rand.zeroize();
    }
}

struct SessionKeys {
    key: [u8; 16],
    nonce: [u8; 13],
    dev_key: [u8; 16],
}

impl Drop for SessionKeys {
    fn drop(&mut self) {
        self.key.zeroize();
        self.dev_key.zeroize();
    }
}

/// Capabilities the stack lends to a provisioning call
pub struct ProvEnv<'a> {
    pub crypto: &'a mut dyn MeshCrypto,
    pub cdb: &'a mut Cdb,
    pub sched: &'a mut Scheduler,
}

/// State available to a role's handlers
pub struct ProvCtx<'a> {
    link: &'a mut ProvLink,
    info: &'a ProvInfo,
    app: &'a mut dyn ProvApp,
    crypto: &'a mut dyn MeshCrypto,
    cdb: &'a mut Cdb,
    elem_count: u8,
    actions: Vec<ProvAction>,
}

impl ProvCtx<'_> {
    fn send(&mut self, pdu_type: u8, params: &[u8]) {
        let mut pdu = Vec::with_capacity(1 + params.len());
        pdu.push(pdu_type);
        pdu.extend_from_slice(params);
        self.actions.push(ProvAction::Send(pdu));
    }

    fn waiting_for_input(&self) -> bool {
        self.link.wait_number || self.link.wait_string
    }

    fn notify_input_complete(&mut self) {
        if std::mem::take(&mut self.link.notify_input_complete) {
            self.app.input_complete();
        }
    }

    fn local_public_key(&self) -> Result<[u8; PUB_KEY_LEN], ProvError> {
        self.crypto
            .public_key()
            .ok_or(ProvError::Crypto(CryptoError::NoKeyPair))
    }

    /// ECDH with the peer's public key
    fn dh(&mut self, peer: &[u8]) -> Result<(), ProvError> {
        let peer: &[u8; PUB_KEY_LEN] = peer
            .try_into()
            .map_err(|_| ProvError::InvalidFormat("public key"))?;
        let dhkey = self.crypto.dh_key(peer).map_err(|e| {
            error!("Failed to generate DHKey: {}", e);
            ProvError::InvalidFormat("public key")
        })?;
        self.link.dhkey = Some(dhkey);
        Ok(())
    }

    fn dhkey(&self) -> Result<[u8; DH_KEY_LEN], ProvError> {
        self.link
            .dhkey
            .ok_or(ProvError::Crypto(CryptoError::NoKeyPair))
    }

    /// Derive the confirmation key, draw our random and compute our
    /// confirmation value
    fn local_confirm(&mut self) -> Result<[u8; 16], ProvError> {
        let dhkey = self.dhkey()?;
        let salt = crypto::s1(&*self.crypto, &self.link.conf_inputs.to_bytes())?;
        let key = crypto::k1(&*self.crypto, &dhkey, &salt, b"prck")?;
        self.crypto.rand(&mut self.link.rand);
        let conf = self
            .crypto
            .aes_cmac(&key, &[&self.link.rand, &self.link.auth])?;
        self.link.conf_salt = salt;
        self.link.conf_key = key;
        self.link.local_conf = conf;
        Ok(conf)
    }

    /// Store the peer's confirmation. A reflected value is rejected.
    fn peer_confirm(&mut self, data: &[u8]) -> Result<(), ProvError> {
        self.link.conf.copy_from_slice(data);
        if self.link.dhkey.is_some() && self.link.conf == self.link.local_conf {
            warn!("Confirmation value is identical to ours");
            return Err(ProvError::ConfirmFailed);
        }
        Ok(())
    }

    /// Check the peer's random against its confirmation
    fn check_confirm(&self, peer_rand: &[u8]) -> Result<(), ProvError> {
        let expected = self
            .crypto
            .aes_cmac(&self.link.conf_key, &[peer_rand, &self.link.auth])?;
        if expected != self.link.conf {
            error!("Invalid confirmation value");
            return Err(ProvError::ConfirmFailed);
        }
        Ok(())
    }

    fn session_keys(&self, rand_prov: &[u8], rand_dev: &[u8]) -> Result<SessionKeys, ProvError> {
        let dhkey = self.dhkey()?;
        let crypto = &*self.crypto;

        let mut m = Vec::with_capacity(48);
        m.extend_from_slice(&self.link.conf_salt);
        m.extend_from_slice(rand_prov);
        m.extend_from_slice(rand_dev);
        let prov_salt = crypto::s1(crypto, &m)?;

        let key = crypto::k1(crypto, &dhkey, &prov_salt, b"prsk")?;
        let nonce_full = crypto::k1(crypto, &dhkey, &prov_salt, b"prsn")?;
        let dev_key = crypto::k1(crypto, &dhkey, &prov_salt, b"prdk")?;

        let mut nonce = [0u8; 13];
        nonce.copy_from_slice(&nonce_full[3..]);
        Ok(SessionKeys {
            key,
            nonce,
            dev_key,
        })
    }

    /// Set up OOB authentication for the method chosen in a Start PDU
    fn auth(&mut self, is_provisioner: bool, method: u8, action: u8, size: u8) -> Result<(), ProvError> {
        self.link.oob_method = method;
        self.link.oob_size = size;

        match method {
            AUTH_NO_OOB => {
                if action != 0 || size != 0 {
                    return Err(ProvError::InvalidArgument);
                }
                self.link.auth = [0; 16];
                Ok(())
            }
            AUTH_STATIC => {
                if action != 0 || size != 0 {
                    return Err(ProvError::InvalidArgument);
                }
                self.link.auth = self.app.static_oob().ok_or(ProvError::NotSupported)?;
                Ok(())
            }
            AUTH_OUTPUT => {
                let output = OutputAction::from_index(action).ok_or(ProvError::InvalidArgument)?;
                check_size(size)?;

                if is_provisioner {
                    let input = if output == OutputAction::DisplayString {
                        self.link.wait_string = true;
                        InputAction::EnterString
                    } else {
                        self.link.wait_number = true;
                        InputAction::EnterNumber
                    };
                    return self.app.input(input, size);
                }

                if self.info.output_actions & output.bit() == 0 || size > self.info.output_size {
                    return Err(ProvError::InvalidArgument);
                }
                self.link.notify_input_complete = true;
                if output == OutputAction::DisplayString {
                    let value = self.auth_string(size);
                    return self.app.output_string(&value);
                }
                let num = self.auth_number(output.excludes_zero(), size);
                self.app.output_number(output, num)
            }
            AUTH_INPUT => {
                let input = InputAction::from_index(action).ok_or(ProvError::InvalidArgument)?;
                check_size(size)?;

                if !is_provisioner {
                    if self.info.input_actions & input.bit() == 0 || size > self.info.input_size {
                        return Err(ProvError::InvalidArgument);
                    }
                    if input == InputAction::EnterString {
                        self.link.wait_string = true;
                    } else {
                        self.link.wait_number = true;
                    }
                    return self.app.input(input, size);
                }

                self.link.notify_input_complete = true;
                if input == InputAction::EnterString {
                    let value = self.auth_string(size);
                    return self.app.output_string(&value);
                }
                let num = self.auth_number(input.excludes_zero(), size);
                self.app.output_number(OutputAction::DisplayNumber, num)
            }
            _ => Err(ProvError::InvalidArgument),
        }
    }

    /// Random decimal OOB value of `size` digits, placed in the auth value
    fn auth_number(&mut self, excludes_zero: bool, size: u8) -> u32 {
        const DIVIDER: [u32; OOB_SIZE_MAX as usize] = [
            10,
            100,
            1_000,
            10_000,
            100_000,
            1_000_000,
            10_000_000,
            100_000_000,
        ];

        let mut raw = [0u8; 4];
        self.crypto.rand(&mut raw);
        let bound = DIVIDER[size as usize - 1];
        let num = if excludes_zero {
            u32::from_le_bytes(raw) % (bound - 1) + 1
        } else {
            u32::from_le_bytes(raw) % bound
        };

        self.link.auth = [0; 16];
        self.link.auth[12..].copy_from_slice(&num.to_be_bytes());
        num
    }

    /// Random alphanumeric OOB value of `size` characters
    fn auth_string(&mut self, size: u8) -> String {
        const CHARACTERS: &[u8; 36] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

        let mut raw = [0u8; 8];
        self.crypto.rand(&mut raw);
        let mut value = u64::from_le_bytes(raw);

        let mut out = String::with_capacity(size as usize);
        for _ in 0..size {
            out.push(CHARACTERS[(value % 36) as usize] as char);
            value /= 36;
        }

        self.link.auth = [0; 16];
        self.link.auth[..out.len()].copy_from_slice(out.as_bytes());
        out
    }
}

fn check_size(size: u8) -> Result<(), ProvError> {
    if size == 0 || size > OOB_SIZE_MAX {
        return Err(ProvError::InvalidArgument);
    }
    Ok(())
}

// ============================================================================
// ROLES
// ============================================================================

/// PDU handlers of one side of the provisioning protocol
///
/// Every handler receives the PDU parameters with the type octet stripped
/// and the length already checked. Handlers a role does not implement
/// reject the PDU as unexpected.
pub trait ProvRole: Send {
    fn is_provisioner(&self) -> bool;

    /// Whether the role has a handler for `pdu_type`
    fn handles(&self, pdu_type: u8) -> bool;

    fn link_opened(&mut self, _ctx: &mut ProvCtx<'_>) -> Result<(), ProvError> {
        Ok(())
    }

    fn link_closed(&mut self, _ctx: &mut ProvCtx<'_>) {}

    /// The link failed with `reason`
    fn error(&mut self, ctx: &mut ProvCtx<'_>, reason: u8);

    /// Local OOB input finished
    fn input_complete(&mut self, ctx: &mut ProvCtx<'_>) -> Result<(), ProvError>;

    fn on_invite(&mut self, _ctx: &mut ProvCtx<'_>, _data: &[u8]) -> Result<(), ProvError> {
        Err(ProvError::UnexpectedPdu(PROV_INVITE))
    }

    fn on_capabilities(&mut self, _ctx: &mut ProvCtx<'_>, _data: &[u8]) -> Result<(), ProvError> {
        Err(ProvError::UnexpectedPdu(PROV_CAPABILITIES))
    }

    fn on_start(&mut self, _ctx: &mut ProvCtx<'_>, _data: &[u8]) -> Result<(), ProvError> {
        Err(ProvError::UnexpectedPdu(PROV_START))
    }

    fn on_pub_key(&mut self, _ctx: &mut ProvCtx<'_>, _data: &[u8]) -> Result<(), ProvError> {
        Err(ProvError::UnexpectedPdu(PROV_PUB_KEY))
    }

    fn on_input_complete(&mut self, _ctx: &mut ProvCtx<'_>) -> Result<(), ProvError> {
        Err(ProvError::UnexpectedPdu(PROV_INPUT_COMPLETE))
    }

    fn on_confirm(&mut self, _ctx: &mut ProvCtx<'_>, _data: &[u8]) -> Result<(), ProvError> {
        Err(ProvError::UnexpectedPdu(PROV_CONFIRM))
    }

    fn on_random(&mut self, _ctx: &mut ProvCtx<'_>, _data: &[u8]) -> Result<(), ProvError> {
        Err(ProvError::UnexpectedPdu(PROV_RANDOM))
    }

    fn on_data(&mut self, _ctx: &mut ProvCtx<'_>, _data: &[u8]) -> Result<(), ProvError> {
        Err(ProvError::UnexpectedPdu(PROV_DATA))
    }

    fn on_complete(&mut self, _ctx: &mut ProvCtx<'_>) -> Result<(), ProvError> {
        Err(ProvError::UnexpectedPdu(PROV_COMPLETE))
    }

    fn on_failed(&mut self, _ctx: &mut ProvCtx<'_>, _reason: u8) -> Result<(), ProvError> {
        Err(ProvError::UnexpectedPdu(PROV_FAILED))
    }
}

fn dispatch(
    role: &mut dyn ProvRole,
    ctx: &mut ProvCtx<'_>,
    pdu_type: u8,
    data: &[u8],
) -> Result<(), ProvError> {
    match pdu_type {
        PROV_INVITE => role.on_invite(ctx, data),
        PROV_CAPABILITIES => role.on_capabilities(ctx, data),
        PROV_START => role.on_start(ctx, data),
        PROV_PUB_KEY => role.on_pub_key(ctx, data),
        PROV_INPUT_COMPLETE => role.on_input_complete(ctx),
        PROV_CONFIRM => role.on_confirm(ctx, data),
        PROV_RANDOM => role.on_random(ctx, data),
        PROV_DATA => role.on_data(ctx, data),
        PROV_COMPLETE => role.on_complete(ctx),
        PROV_FAILED => role.on_failed(ctx, data[0]),
        other => Err(ProvError::InvalidPdu(other)),
    }
}

// ============================================================================
// PROVISIONING STATE
// ============================================================================

pub struct Prov {
    info: ProvInfo,
    app: Box<dyn ProvApp>,
    elem_count: u8,
    link: ProvLink,
    role: Box<dyn ProvRole>,
}

impl Prov {
    pub fn new(info: ProvInfo, app: Box<dyn ProvApp>) -> Self {
        Self {
            info,
            app,
            elem_count: 1,
            link: ProvLink::default(),
            role: Box::new(Device),
        }
    }

    pub fn info(&self) -> &ProvInfo {
        &self.info
    }

    /// Number of elements reported in Capabilities
    pub fn set_elem_count(&mut self, count: u8) {
        self.elem_count = count;
    }

    pub fn is_active(&self) -> bool {
        self.link.active
    }

    /// Bearer of the open link
    pub fn bearer(&self) -> Option<ProvBearerType> {
        self.link.bearer.filter(|_| self.link.active)
    }

    pub fn is_provisioner(&self) -> bool {
        self.role.is_provisioner()
    }

    /// Next PDU type the link accepts
    pub fn expect(&self) -> Option<u8> {
        self.link.expect
    }

    /// Clear the link and generate a fresh key pair
    pub fn reset_state(&mut self, crypto: &mut dyn MeshCrypto) -> Result<(), ProvError> {
        debug!("Resetting provisioning state");
        // A received Invite may have started the attention timer
        if !self.role.is_provisioner() && self.link.conf_inputs.invite[0] != 0 {
            self.app.attention(0);
        }
        self.link = ProvLink::default();
        if let Err(e) = crypto.generate_key_pair() {
            error!("Failed to generate public key ({})", e);
            return Err(e.into());
        }
        debug!("Local public key ready");
        Ok(())
    }

    /// Tear down provisioning entirely. Bearer state is reset by the caller.
    pub fn reset(&mut self, crypto: &mut dyn MeshCrypto, sched: &mut Scheduler) -> Result<(), ProvError> {
        sched.cancel(Work::ProvTimeout);
        let res = self.reset_state(crypto);
        self.role = Box::new(Device);
        res?;
        self.app.reset();
        Ok(())
    }

    /// Switch to the provisioner role for the next link
    pub fn provision(&mut self, req: NodeRequest, cdb: &Cdb) -> Result<(), ProvError> {
        if self.link.active {
            return Err(ProvError::Busy);
        }
        if !cdb.is_valid() || cdb.subnet_get(req.net_idx).is_none() {
            warn!("No CDB subnet 0x{:03x} to provision into", req.net_idx);
            return Err(ProvError::InvalidArgument);
        }
        if cdb.nodes().any(|n| n.uuid == req.uuid) {
            warn!("Node {} already provisioned", hex::encode(req.uuid));
            return Err(ProvError::InvalidArgument);
        }
        self.role = Box::new(Provisioner::new(req));
        Ok(())
    }

    fn run<T>(
        &mut self,
        env: &mut ProvEnv<'_>,
        f: impl FnOnce(&mut dyn ProvRole, &mut ProvCtx<'_>) -> T,
    ) -> (T, Vec<ProvAction>) {
        let mut ctx = ProvCtx {
            link: &mut self.link,
            info: &self.info,
            app: self.app.as_mut(),
            crypto: &mut *env.crypto,
            cdb: &mut *env.cdb,
            elem_count: self.elem_count,
            actions: Vec::new(),
        };
        let out = f(self.role.as_mut(), &mut ctx);
        (out, ctx.actions)
    }

    /// Run `f` and report a failure to the role
    fn run_checked(
        &mut self,
        env: &mut ProvEnv<'_>,
        f: impl FnOnce(&mut dyn ProvRole, &mut ProvCtx<'_>) -> Result<(), ProvError>,
    ) -> Vec<ProvAction> {
        let (_, actions) = self.run(env, |role, ctx| {
            if let Err(e) = f(role, ctx) {
                warn!("Provisioning failed: {}", e);
                let reason = e.reason().unwrap_or(reason::UNEXPECTED_ERROR);
                role.error(ctx, reason);
            }
        });
        actions
    }

    /// The bearer opened a link
    pub fn link_opened(&mut self, bearer: ProvBearerType, env: &mut ProvEnv<'_>) -> Vec<ProvAction> {
        debug!("Link opened on {:?}", bearer);
        self.link.active = true;
        self.link.bearer = Some(bearer);
        self.app.link_open(bearer);
        env.sched.reschedule(Work::ProvTimeout, PROTOCOL_TIMEOUT_MS);
        self.run_checked(env, |role, ctx| role.link_opened(ctx))
    }

    /// The bearer closed the link. The local key pair is regenerated.
    pub fn link_closed(&mut self, env: &mut ProvEnv<'_>) {
        let Some(bearer) = self.bearer() else {
            return;
        };
        debug!("Link closed on {:?}", bearer);
        self.run(env, |role, ctx| role.link_closed(ctx));
        self.app.link_close(bearer);

        env.sched.cancel(Work::ProvTimeout);
        // A failure leaves the link inactive; the next open retries
        if let Err(e) = self.reset_state(&mut *env.crypto) {
            warn!("Provisioning state reset failed: {}", e);
        }
        self.role = Box::new(Device);
    }

    /// The bearer failed in a way the protocol reports with `reason`
    pub fn bearer_error(&mut self, reason: u8, env: &mut ProvEnv<'_>) -> Vec<ProvAction> {
        if !self.link.active {
            return Vec::new();
        }
        let (_, actions) = self.run(env, |role, ctx| role.error(ctx, reason));
        actions
    }

    /// A complete provisioning PDU arrived on the link
    pub fn recv(&mut self, buf: &[u8], env: &mut ProvEnv<'_>) -> Vec<ProvAction> {
        if !self.link.active {
            warn!("Provisioning PDU without an open link");
            return Vec::new();
        }
        let Some((&pdu_type, data)) = buf.split_first() else {
            warn!("Empty provisioning PDU");
            return Vec::new();
        };
        debug!("type 0x{:02x} len {}", pdu_type, buf.len());

        let expect = self.link.expect;
        let handled = self.role.handles(pdu_type);
        if (pdu_type as usize) < PDU_LEN.len()
            && (pdu_type == PROV_FAILED || Some(pdu_type) == expect)
            && handled
            && data.len() == PDU_LEN[pdu_type as usize]
        {
            env.sched.reschedule(Work::ProvTimeout, PROTOCOL_TIMEOUT_MS);
        }

        self.run_checked(env, |role, ctx| {
            if pdu_type as usize >= PDU_LEN.len() {
                error!("Unknown provisioning PDU type 0x{:02x}", pdu_type);
                return Err(ProvError::InvalidPdu(pdu_type));
            }
            if (pdu_type != PROV_FAILED && Some(pdu_type) != expect) || !handled {
                warn!("Unexpected msg 0x{:02x} != {:?}", pdu_type, expect);
                return Err(ProvError::UnexpectedPdu(pdu_type));
            }
            if data.len() != PDU_LEN[pdu_type as usize] {
                error!("Invalid length {} for type 0x{:02x}", buf.len(), pdu_type);
                return Err(ProvError::InvalidFormat("PDU length"));
            }
            dispatch(role, ctx, pdu_type, data)
        })
    }

    /// `Work::ProvTimeout` expiry
    pub fn timeout(&mut self) -> Vec<ProvAction> {
        if !self.link.active {
            return Vec::new();
        }
        warn!("Provisioning protocol timeout");
        vec![ProvAction::Close(CloseReason::Timeout)]
    }

    /// The user entered the number we asked for
    pub fn input_number(&mut self, num: u32, env: &mut ProvEnv<'_>) -> Result<Vec<ProvAction>, ProvError> {
        debug!("{}", num);
        if !std::mem::take(&mut self.link.wait_number) {
            return Err(ProvError::InvalidArgument);
        }
        self.link.auth = [0; 16];
        self.link.auth[12..].copy_from_slice(&num.to_be_bytes());
        Ok(self.run_checked(env, |role, ctx| role.input_complete(ctx)))
    }

    /// The user entered the string we asked for
    pub fn input_string(&mut self, value: &str, env: &mut ProvEnv<'_>) -> Result<Vec<ProvAction>, ProvError> {
        debug!("{}", value);
        if value.len() > OOB_SIZE_MAX as usize || value.len() > self.link.oob_size as usize {
            return Err(ProvError::NotSupported);
        }
        if !std::mem::take(&mut self.link.wait_string) {
            return Err(ProvError::InvalidArgument);
        }
        self.link.auth = [0; 16];
        self.link.auth[..value.len()].copy_from_slice(value.as_bytes());
        Ok(self.run_checked(env, |role, ctx| role.input_complete(ctx)))
    }

    /// Report completion of our own provisioning to the application
    pub fn complete(&mut self, net_idx: u16, addr: u16) {
        self.app.complete(net_idx, addr);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::crypto::SoftCrypto;
    use crate::store::MemoryStore;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Application recording what the stack asked of it
    #[derive(Default)]
    pub(crate) struct AppLog {
        pub numbers: Vec<(OutputAction, u32)>,
        pub strings: Vec<String>,
        pub inputs: Vec<(InputAction, u8)>,
        pub input_complete: usize,
        pub opened: usize,
        pub closed: usize,
        pub added: Vec<u16>,
        pub resets: usize,
        pub attention: Vec<u8>,
    }

    pub(crate) struct TestApp {
        pub log: Arc<Mutex<AppLog>>,
        pub static_oob: Option<[u8; 16]>,
    }

    impl TestApp {
        pub fn new() -> (Self, Arc<Mutex<AppLog>>) {
            let log = Arc::new(Mutex::new(AppLog::default()));
            (
                Self {
                    log: log.clone(),
                    static_oob: None,
                },
                log,
            )
        }
    }

    impl ProvApp for TestApp {
        fn output_number(&mut self, action: OutputAction, number: u32) -> Result<(), ProvError> {
            self.log.lock().numbers.push((action, number));
            Ok(())
        }

        fn output_string(&mut self, value: &str) -> Result<(), ProvError> {
            self.log.lock().strings.push(value.to_string());
            Ok(())
        }

        fn input(&mut self, action: InputAction, size: u8) -> Result<(), ProvError> {
            self.log.lock().inputs.push((action, size));
            Ok(())
        }

        fn input_complete(&mut self) {
            self.log.lock().input_complete += 1;
        }

        fn attention(&mut self, secs: u8) {
            self.log.lock().attention.push(secs);
        }

        fn link_open(&mut self, _bearer: ProvBearerType) {
            self.log.lock().opened += 1;
        }

        fn link_close(&mut self, _bearer: ProvBearerType) {
            self.log.lock().closed += 1;
        }

        fn node_added(&mut self, _net_idx: u16, _uuid: &[u8; 16], addr: u16, _num_elem: u8) {
            self.log.lock().added.push(addr);
        }

        fn reset(&mut self) {
            self.log.lock().resets += 1;
        }

        fn static_oob(&self) -> Option<[u8; 16]> {
            self.static_oob
        }
    }

    /// One side of a provisioning exchange with everything it needs
    pub(crate) struct Side {
        pub prov: Prov,
        pub crypto: SoftCrypto,
        pub cdb: Cdb,
        pub sched: Scheduler,
        pub log: Arc<Mutex<AppLog>>,
    }

    impl Side {
        pub fn new(info: ProvInfo, static_oob: Option<[u8; 16]>) -> Self {
            let (mut app, log) = TestApp::new();
            app.static_oob = static_oob;
            let mut side = Self {
                prov: Prov::new(info, Box::new(app)),
                crypto: SoftCrypto::new(),
                cdb: Cdb::new(4, 2, 2),
                sched: Scheduler::new(),
                log,
            };
            side.prov.reset_state(&mut side.crypto).unwrap();
            side
        }

        pub fn provisioner() -> Self {
            let mut side = Self::new(ProvInfo::default(), None);
            side.cdb.create(&[0x5a; 16], &MemoryStore::new()).unwrap();
            side
        }

        pub fn with<T>(&mut self, f: impl FnOnce(&mut Prov, &mut ProvEnv<'_>) -> T) -> T {
            let mut env = ProvEnv {
                crypto: &mut self.crypto,
                cdb: &mut self.cdb,
                sched: &mut self.sched,
            };
            f(&mut self.prov, &mut env)
        }

        pub fn open(&mut self) -> Vec<ProvAction> {
            self.with(|prov, env| prov.link_opened(ProvBearerType::Adv, env))
        }

        pub fn recv(&mut self, pdu: &[u8]) -> Vec<ProvAction> {
            self.with(|prov, env| prov.recv(pdu, env))
        }
    }

    pub(crate) fn sent(actions: &[ProvAction]) -> Vec<Vec<u8>> {
        actions
            .iter()
            .filter_map(|a| match a {
                ProvAction::Send(pdu) => Some(pdu.clone()),
                _ => None,
            })
            .collect()
    }

    fn device_info() -> ProvInfo {
        ProvInfo {
            uuid: Uuid::from_bytes([0x11; 16]),
            output_size: 4,
            output_actions: OutputAction::Blink.bit() | OutputAction::DisplayNumber.bit(),
            input_size: 6,
            input_actions: InputAction::EnterString.bit(),
            ..ProvInfo::default()
        }
    }

    #[test]
    fn test_conf_inputs_length() {
        assert_eq!(ConfInputs::default().to_bytes().len(), CONF_INPUTS_LEN);
    }

    #[test]
    fn test_invite_returns_capabilities() {
        let mut dev = Side::new(device_info(), Some([7; 16]));
        dev.prov.set_elem_count(2);
        assert!(dev.open().is_empty());
        assert_eq!(dev.prov.expect(), Some(PROV_INVITE));

        let actions = dev.recv(&[PROV_INVITE, 5]);
        assert_eq!(
            sent(&actions),
            vec![vec![
                PROV_CAPABILITIES,
                2,
                0x00,
                0x01,
                0x00,
                0x01,
                4,
                0x00,
                0x09,
                6,
                0x00,
                0x08
            ]]
        );
        assert_eq!(dev.prov.expect(), Some(PROV_START));
        assert_eq!(dev.sched.remaining(Work::ProvTimeout), Some(PROTOCOL_TIMEOUT_MS));
    }

    #[test]
    fn test_malformed_pdus_fail_the_link() {
        let mut dev = Side::new(device_info(), None);
        dev.open();

        assert_eq!(
            sent(&dev.recv(&[0x0a])),
            vec![vec![PROV_FAILED, reason::INVALID_PDU]]
        );

        let mut dev = Side::new(device_info(), None);
        dev.open();
        assert_eq!(
            sent(&dev.recv(&[PROV_START, 0, 0, 0, 0, 0])),
            vec![vec![PROV_FAILED, reason::UNEXPECTED_PDU]]
        );
        // Failed link accepts nothing more
        assert_eq!(dev.prov.expect(), None);

        let mut dev = Side::new(device_info(), None);
        dev.open();
        assert_eq!(
            sent(&dev.recv(&[PROV_INVITE, 0, 0])),
            vec![vec![PROV_FAILED, reason::INVALID_FORMAT]]
        );
    }

    #[test]
    fn test_pdu_without_link_ignored() {
        let mut dev = Side::new(device_info(), None);
        assert!(dev.recv(&[PROV_INVITE, 0]).is_empty());
    }

    #[test]
    fn test_counted_output_never_zero() {
        let mut dev = Side::new(device_info(), None);
        for _ in 0..200 {
            let mut env = ProvEnv {
                crypto: &mut dev.crypto,
                cdb: &mut dev.cdb,
                sched: &mut dev.sched,
            };
            let (num, _) = dev.prov.run(&mut env, |_, ctx| ctx.auth_number(true, 1));
            assert!((1..=9).contains(&num));
        }
    }

    #[test]
    fn test_output_number_written_to_auth() {
        let mut dev = Side::new(device_info(), None);
        dev.open();
        dev.recv(&[PROV_INVITE, 0]);
        let actions = dev.recv(&[PROV_START, 0, 0, AUTH_OUTPUT, OutputAction::DisplayNumber.index(), 4]);
        assert!(sent(&actions).is_empty());

        let (action, num) = dev.log.lock().numbers[0];
        assert_eq!(action, OutputAction::DisplayNumber);
        assert!(num < 10_000);
        assert_eq!(&dev.prov.link.auth[12..], &num.to_be_bytes());
        assert_eq!(&dev.prov.link.auth[..12], &[0; 12]);
        assert_eq!(dev.prov.expect(), Some(PROV_PUB_KEY));
    }

    #[test]
    fn test_unsupported_output_action_rejected() {
        let mut dev = Side::new(device_info(), None);
        dev.open();
        dev.recv(&[PROV_INVITE, 0]);
        let actions = dev.recv(&[PROV_START, 0, 0, AUTH_OUTPUT, OutputAction::Beep.index(), 1]);
        assert_eq!(sent(&actions), vec![vec![PROV_FAILED, reason::INVALID_FORMAT]]);
    }

    #[test]
    fn test_input_string_rules() {
        let mut dev = Side::new(device_info(), None);
        dev.open();
        dev.recv(&[PROV_INVITE, 0]);
        dev.recv(&[PROV_START, 0, 0, AUTH_INPUT, InputAction::EnterString.index(), 4]);
        assert_eq!(dev.log.lock().inputs, vec![(InputAction::EnterString, 4)]);

        assert_eq!(
            dev.with(|prov, env| prov.input_string("ABCDEFGHI", env)),
            Err(ProvError::NotSupported)
        );
        // Longer than the negotiated size
        assert_eq!(
            dev.with(|prov, env| prov.input_string("ABCDE", env)),
            Err(ProvError::NotSupported)
        );
        assert_eq!(
            dev.with(|prov, env| prov.input_number(5, env)),
            Err(ProvError::InvalidArgument)
        );

        // Public key not exchanged yet; Input Complete follows it
        let actions = dev.with(|prov, env| prov.input_string("AB12", env)).unwrap();
        assert!(actions.is_empty());
        assert_eq!(&dev.prov.link.auth[..4], b"AB12");
        assert_eq!(
            dev.with(|prov, env| prov.input_string("AB12", env)),
            Err(ProvError::InvalidArgument)
        );
    }

    #[test]
    fn test_static_oob_requires_value() {
        let mut dev = Side::new(device_info(), None);
        dev.open();
        dev.recv(&[PROV_INVITE, 0]);
        let actions = dev.recv(&[PROV_START, 0, 0, AUTH_STATIC, 0, 0]);
        assert_eq!(sent(&actions), vec![vec![PROV_FAILED, reason::INVALID_FORMAT]]);
    }

    #[test]
    fn test_timeout_closes_active_link() {
        let mut dev = Side::new(device_info(), None);
        assert!(dev.prov.timeout().is_empty());
        dev.open();
        assert_eq!(dev.prov.timeout(), vec![ProvAction::Close(CloseReason::Timeout)]);

        dev.with(|prov, env| prov.link_closed(env));
        assert!(!dev.prov.is_active());
        assert!(!dev.sched.is_pending(Work::ProvTimeout));
        assert_eq!(dev.log.lock().closed, 1);
    }

    #[test]
    fn test_attention_stopped_when_link_closes() {
        let mut dev = Side::new(device_info(), None);
        dev.open();
        dev.recv(&[PROV_INVITE, 5]);
        assert_eq!(dev.log.lock().attention, vec![5]);

        dev.with(|prov, env| prov.link_closed(env));
        assert_eq!(dev.log.lock().attention, vec![5, 0]);

        // Nothing left to stop on a later reset
        dev.with(|prov, env| prov.reset(&mut *env.crypto, &mut *env.sched))
            .unwrap();
        assert_eq!(dev.log.lock().attention, vec![5, 0]);
    }

    #[test]
    fn test_zero_attention_duration_leaves_timer_alone() {
        let mut dev = Side::new(device_info(), None);
        dev.open();
        dev.recv(&[PROV_INVITE, 0]);
        dev.with(|prov, env| prov.link_closed(env));
        assert!(dev.log.lock().attention.is_empty());
    }

    #[test]
    fn test_reset_regenerates_key_pair() {
        let mut dev = Side::new(device_info(), None);
        let before = dev.crypto.public_key().unwrap();
        dev.with(|prov, env| prov.reset(&mut *env.crypto, &mut *env.sched))
            .unwrap();
        assert_ne!(dev.crypto.public_key().unwrap(), before);
        assert_eq!(dev.log.lock().resets, 1);
    }

    #[test]
    fn test_error_reasons() {
        assert_eq!(ProvError::Resources.reason(), Some(reason::OUT_OF_RESOURCES));
        assert_eq!(ProvError::Decrypt.reason(), Some(reason::DECRYPTION_FAILED));
        assert_eq!(ProvError::NotSupported.reason(), None);
    }
}
