// Shared fixtures for the integration tests: a recording bearer, a test
// model and a shared advertising medium several nodes can talk over.
#![allow(dead_code)]

use std::sync::Arc;

use nimble_mesh_core::access::op_2;
use nimble_mesh_core::adv::{AD_MESH_MESSAGE, AD_MESH_PROV};
use nimble_mesh_core::bearer::ADV_NONCONN_IND;
use nimble_mesh_core::{
    AdData, AdvParams, Bearer, BearerError, Composition, Element, Mesh, MeshConfig, Model,
    ModelHandler, ModelOp, ModelPub, ModelRef, MsgCtx, MsgLen, NoOobApp, ProvData, ProvInfo,
    SettingsStore,
};
use parking_lot::Mutex;

pub const NET_KEY: [u8; 16] = [0x11; 16];
pub const APP_KEY: [u8; 16] = [0x22; 16];

pub const OP_GET: u32 = op_2(0x82, 0x01);
pub const OP_SET: u32 = op_2(0x82, 0x02);
pub const OP_STATUS: u32 = op_2(0x82, 0x04);

pub const MODEL: ModelRef = ModelRef {
    elem_idx: 0,
    vnd: false,
    mod_idx: 0,
};

pub use nimble_mesh_core::logging::init_tracing;

/// Bearer recording everything the stack puts on air
#[derive(Default, Clone)]
pub struct AirBearer {
    pub adv: Arc<Mutex<Vec<(AdvParams, Vec<AdData>)>>>,
    pub notify: Arc<Mutex<Vec<(u16, u16, Vec<u8>)>>>,
    pub disconnects: Arc<Mutex<Vec<u16>>>,
}

impl AirBearer {
    /// Every AD of `ad_type` advertised so far, in order
    pub fn ads(&self, ad_type: u8) -> Vec<Vec<u8>> {
        self.adv
            .lock()
            .iter()
            .flat_map(|(_, ad)| ad.iter())
            .filter(|ad| ad.ad_type == ad_type)
            .map(|ad| ad.data.clone())
            .collect()
    }

    pub fn messages(&self) -> Vec<Vec<u8>> {
        self.ads(AD_MESH_MESSAGE)
    }

    /// Notifications sent on `conn`
    pub fn notified(&self, conn: u16) -> Vec<(u16, Vec<u8>)> {
        self.notify
            .lock()
            .iter()
            .filter(|(c, _, _)| *c == conn)
            .map(|(_, chr, data)| (*chr, data.clone()))
            .collect()
    }
}

impl Bearer for AirBearer {
    fn adv_start(&mut self, params: &AdvParams, ad: &[AdData], _sd: &[AdData]) -> Result<(), BearerError> {
        self.adv.lock().push((*params, ad.to_vec()));
        Ok(())
    }

    fn adv_stop(&mut self) -> Result<(), BearerError> {
        Ok(())
    }

    fn gatt_notify(&mut self, conn: u16, chr: u16, data: &[u8]) -> Result<(), BearerError> {
        self.notify.lock().push((conn, chr, data.to_vec()));
        Ok(())
    }

    fn disconnect(&mut self, conn: u16) -> Result<(), BearerError> {
        self.disconnects.lock().push(conn);
        Ok(())
    }

    fn att_mtu(&self, _conn: u16) -> u16 {
        69
    }
}

/// Message seen by a [`TestModel`]: opcode, source, destination, parameters
pub type Seen = Arc<Mutex<Vec<(u32, u16, u16, Vec<u8>)>>>;

/// Server model recording what it handles, optionally answering
pub struct TestModel {
    ops: Vec<ModelOp>,
    seen: Seen,
    reply: Option<Vec<u8>>,
}

impl TestModel {
    pub fn new() -> (Self, Seen) {
        let seen = Seen::default();
        let model = Self {
            ops: vec![
                ModelOp {
                    opcode: OP_GET,
                    len: MsgLen::Exact(0),
                },
                ModelOp {
                    opcode: OP_SET,
                    len: MsgLen::Min(1),
                },
            ],
            seen: seen.clone(),
            reply: None,
        };
        (model, seen)
    }

    pub fn replying(mut self, reply: Vec<u8>) -> Self {
        self.reply = Some(reply);
        self
    }
}

impl ModelHandler for TestModel {
    fn ops(&self) -> &[ModelOp] {
        &self.ops
    }

    fn handle(&mut self, opcode: u32, ctx: &MsgCtx, params: &[u8]) -> Option<Vec<u8>> {
        self.seen
            .lock()
            .push((opcode, ctx.addr, ctx.recv_dst, params.to_vec()));
        self.reply.clone()
    }
}

/// Build a node with one element holding a [`TestModel`]
pub fn node(store: impl SettingsStore + 'static, info: ProvInfo, reply: Option<Vec<u8>>) -> (Mesh, AirBearer, Seen) {
    let (model, seen) = TestModel::new();
    let model = match reply {
        Some(reply) => model.replying(reply),
        None => model,
    };
    let comp = Composition {
        cid: 0x05f1,
        pid: 0x0001,
        vid: 0x0001,
        elements: vec![Element::new(
            0,
            vec![Model::sig(0x1000, Box::new(model)).with_pub(ModelPub::new())],
        )],
    };
    let air = AirBearer::default();
    let mesh = Mesh::new(
        MeshConfig::default(),
        comp,
        info,
        Box::new(NoOobApp),
        Box::new(air.clone()),
        Box::new(store),
    )
    .unwrap();
    (mesh, air, seen)
}

pub fn prov_data(addr: u16) -> ProvData {
    ProvData {
        net_key: NET_KEY,
        net_idx: 0,
        flags: 0,
        iv_index: 0,
        addr,
        dev_key: [addr as u8; 16],
    }
}

/// Provision `mesh` at `addr` with AppKey 0 bound to [`MODEL`]
pub fn configure(mesh: &mut Mesh, addr: u16) {
    mesh.provision(&prov_data(addr)).unwrap();
    mesh.app_key_add(0, 0, &APP_KEY).unwrap();
    mesh.model_bind(MODEL, nimble_mesh_core::BoundKey::App(0)).unwrap();
}

/// AD structure as seen by a scanner
pub fn adv_report(ad_type: u8, data: &[u8]) -> Vec<u8> {
    let mut report = vec![data.len() as u8 + 1, ad_type];
    report.extend_from_slice(data);
    report
}

struct Station {
    mesh: Mesh,
    air: AirBearer,
    cursor: usize,
}

/// Shared advertising channel. Every mesh message or PB-ADV AD one node
/// advertises is reported to all the others; time moves in lockstep.
pub struct Medium {
    stations: Vec<Station>,
    now: u64,
}

pub const STEP_MS: u64 = 10;

impl Medium {
    pub fn new() -> Self {
        Self {
            stations: Vec::new(),
            now: 0,
        }
    }

    /// Returns the node's index
    pub fn join(&mut self, mesh: Mesh, air: AirBearer) -> usize {
        let cursor = air.adv.lock().len();
        self.stations.push(Station { mesh, air, cursor });
        self.stations.len() - 1
    }

    pub fn mesh(&mut self, idx: usize) -> &mut Mesh {
        &mut self.stations[idx].mesh
    }

    pub fn now(&self) -> u64 {
        self.now
    }

    /// Deliver everything advertised since the last call
    pub fn deliver(&mut self) {
        // Bounded so a relay storm fails the test instead of hanging it
        for _ in 0..64 {
            let mut reports = Vec::new();
            for (idx, station) in self.stations.iter_mut().enumerate() {
                let adv = station.air.adv.lock();
                for (_, ads) in &adv[station.cursor..] {
                    for ad in ads {
                        if ad.ad_type == AD_MESH_MESSAGE || ad.ad_type == AD_MESH_PROV {
                            reports.push((idx, adv_report(ad.ad_type, &ad.data)));
                        }
                    }
                }
                station.cursor = adv.len();
            }
            if reports.is_empty() {
                return;
            }
            for (from, report) in reports {
                for (idx, station) in self.stations.iter_mut().enumerate() {
                    if idx != from {
                        station.mesh.scan_recv(ADV_NONCONN_IND, &report);
                    }
                }
            }
        }
        panic!("advertising never settled");
    }

    /// Run for `ms` of simulated time
    pub fn run(&mut self, ms: u64) {
        self.run_until(ms, |_| false);
    }

    /// Run until `done` holds or `ms` elapsed. Returns whether `done` held.
    pub fn run_until(&mut self, ms: u64, mut done: impl FnMut(&mut Medium) -> bool) -> bool {
        let end = self.now + ms;
        loop {
            self.deliver();
            if done(self) {
                return true;
            }
            if self.now >= end {
                return false;
            }
            self.now += STEP_MS;
            let now = self.now;
            for station in &mut self.stations {
                station.mesh.advance_to(now);
            }
        }
    }
}
