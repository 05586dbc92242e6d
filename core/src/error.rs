// Crate-wide error taxonomy
//
// Each layer owns a thiserror enum; MeshError folds them together and
// classifies every failure into one of the recovery classes the stack
// acts on (drop, deny, tear down, retry on next flush).

use thiserror::Error;

use crate::access::AccessError;
use crate::adv::AdvError;
use crate::cdb::CdbError;
use crate::cfg::CfgError;
use crate::config::ConfigError;
use crate::crypto::CryptoError;
use crate::heartbeat::HeartbeatError;
use crate::net::NetError;
use crate::hci::HciError;
use crate::prov::ProvError;
use crate::proxy::ProxyError;
use crate::store::StoreError;

/// Recovery class of a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or out-of-sequence input; dropped, link may be torn down
    Protocol,
    /// Replayed network message; dropped silently
    Replay,
    /// No free slot, address range or buffer; fail closed
    ResourceExhausted,
    /// Bearer or controller failure
    Transport,
    /// Persistent store failure; retried on the next flush
    Storage,
    /// Caller supplied an invalid argument or called in the wrong state
    InvalidArgument,
}

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("Access layer: {0}")]
    Access(#[from] AccessError),
    #[error("Advertising bearer: {0}")]
    Adv(#[from] AdvError),
    #[error("Configuration database: {0}")]
    Cdb(#[from] CdbError),
    #[error("Node configuration: {0}")]
    Cfg(#[from] CfgError),
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Crypto: {0}")]
    Crypto(#[from] CryptoError),
    #[error("Heartbeat: {0}")]
    Heartbeat(#[from] HeartbeatError),
    #[error("HCI: {0}")]
    Hci(#[from] HciError),
    #[error("Network: {0}")]
    Net(#[from] NetError),
    #[error("Provisioning: {0}")]
    Prov(#[from] ProvError),
    #[error("Proxy: {0}")]
    Proxy(#[from] ProxyError),
    #[error("Storage: {0}")]
    Store(#[from] StoreError),
    #[error("Replayed message from 0x{src:04x} seq 0x{seq:06x}")]
    Replay { src: u16, seq: u32 },
    #[error("Stack not provisioned")]
    NotProvisioned,
    #[error("Stack already provisioned")]
    AlreadyProvisioned,
}

impl MeshError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MeshError::Replay { .. } => ErrorKind::Replay,
            MeshError::Store(_) => ErrorKind::Storage,
            MeshError::Hci(_) => ErrorKind::Transport,
            MeshError::Net(NetError::NoFreeSlot | NetError::SeqExhausted) => {
                ErrorKind::ResourceExhausted
            }
            MeshError::Net(NetError::Malformed) => ErrorKind::Protocol,
            MeshError::Adv(AdvError::NoBuffers) => ErrorKind::ResourceExhausted,
            MeshError::Adv(_) => ErrorKind::Transport,
            MeshError::Cdb(e) if e.is_exhaustion() => ErrorKind::ResourceExhausted,
            MeshError::Access(AccessError::NoResources) => ErrorKind::ResourceExhausted,
            MeshError::Access(AccessError::InvalidOpcode)
            | MeshError::Access(AccessError::InvalidLength { .. }) => ErrorKind::Protocol,
            MeshError::Proxy(e) if e.is_transport() => ErrorKind::Transport,
            MeshError::Proxy(ProxyError::NoFreeClient) => ErrorKind::ResourceExhausted,
            MeshError::Proxy(_) => ErrorKind::Protocol,
            MeshError::Prov(ProvError::Resources) => ErrorKind::ResourceExhausted,
            MeshError::Prov(ProvError::Bearer(_)) => ErrorKind::Transport,
            MeshError::Prov(e) if e.reason().is_some() => ErrorKind::Protocol,
            _ => ErrorKind::InvalidArgument,
        }
    }
}

pub type Result<T> = std::result::Result<T, MeshError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert_eq!(
            MeshError::Replay { src: 4, seq: 9 }.kind(),
            ErrorKind::Replay
        );
        assert_eq!(
            MeshError::from(CdbError::NoFreeAddress).kind(),
            ErrorKind::ResourceExhausted
        );
        assert_eq!(
            MeshError::from(ProxyError::TypeMismatch {
                expected: 0,
                got: 1
            })
            .kind(),
            ErrorKind::Protocol
        );
        assert_eq!(
            MeshError::from(StoreError::Backend("disk full".into())).kind(),
            ErrorKind::Storage
        );
    }
}
