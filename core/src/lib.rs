// NimBLE Mesh Core
//
// Bluetooth Mesh network layer and provisioning for a BLE host stack. One
// `Mesh` instance owns all node state and is driven by a deterministic
// millisecond scheduler; `runtime` runs it on tokio.

pub mod access;
pub mod addr;
pub mod adv;
pub mod bearer;
pub mod cdb;
pub mod cfg;
pub mod config;
pub mod crypto;
pub mod error;
pub mod hci;
pub mod heartbeat;
pub mod logging;
pub mod mesh;
pub mod net;
pub mod prov;
pub mod proxy;
pub mod rpl;
pub mod runtime;
pub mod scheduler;
pub mod settings;
pub mod store;

pub use access::{Composition, Element, Model, ModelHandler, ModelOp, ModelPub, ModelRef, MsgLen, PubParams};
pub use addr::{BoundKey, KeyRef};
pub use bearer::{AdData, AdvParams, Bearer, BearerError};
pub use cfg::FeatureState;
pub use config::MeshConfig;
pub use crypto::{MeshCrypto, SoftCrypto};
pub use error::{ErrorKind, MeshError, Result};
pub use heartbeat::{HbPub, HbSub, HeartbeatCb};
pub use mesh::Mesh;
pub use net::{MsgCtx, NetworkLayer, PlainNetwork};
pub use prov::{NoOobApp, NodeRequest, ProvApp, ProvData, ProvInfo};
pub use runtime::{start_mesh, MeshCommand, MeshHandle};
pub use scheduler::{Scheduler, Work};
pub use store::{MemoryStore, SettingsStore, SledStore, StoreError};
