//! Mesh stack instance
//!
//! [`Mesh`] owns every piece of stack state and is the only place where the
//! layers meet. Entry points are host events (advertising reports, GATT
//! writes and connection changes), application calls (provisioning,
//! configuration, publishing) and the passage of time. Each entry point
//! runs to completion, then the scheduler's due work is drained and dirty
//! state is handed to the settings flush.

use std::collections::VecDeque;

use tracing::{debug, error, info, warn};

use crate::access::{Access, AccessError, AccessTx, Composition, ModelRef, PubParams};
use crate::addr::{self, BoundKey, KeyRef};
use crate::adv::{self, Adv, AdvEvent, AdvType, ScanPdu, SendCb};
use crate::bearer::Bearer;
use crate::cdb::{Cdb, FLAG_IV_UPDATE, FLAG_KEY_REFRESH};
use crate::cfg::{Cfg, FeatureState};
use crate::config::MeshConfig;
use crate::crypto::{MeshCrypto, SoftCrypto};
use crate::error::{MeshError, Result};
use crate::heartbeat::{HbMessage, HbPub, HbSub, Heartbeat, HeartbeatCb, FEAT_FRIEND, FEAT_PROXY, FEAT_RELAY};
use crate::net::{MsgCtx, NetIf, NetRx, NetState, NetTx, NetworkLayer, PlainNetwork, CTL_HEARTBEAT};
use crate::prov::{
    NodeRequest, PbAdv, PbAdvEvent, Prov, ProvAction, ProvApp, ProvBearerType, ProvData, ProvEnv,
    ProvError, ProvInfo,
};
use crate::proxy::msg::{TYPE_BEACON, TYPE_CONFIG, TYPE_NET_PDU};
use crate::proxy::{PbGatt, ProxyError, ProxyServer};
use crate::rpl::{Rpl, RplRx};
use crate::scheduler::{Scheduler, Work};
use crate::settings::keys::{self, ModelRecord};
use crate::settings::{PendingFlag, Settings, SettingsKey, FLUSH_ORDER};
use crate::store::{SettingsStore, StoreError};

/// Loopback deliveries handled per entry point before the rest is dropped
const LOOPBACK_MAX: usize = 32;

pub struct Mesh {
    config: MeshConfig,
    sched: Scheduler,
    settings: Settings,
    store: Box<dyn SettingsStore>,
    crypto: Box<dyn MeshCrypto>,
    bearer: Box<dyn Bearer>,
    network: Box<dyn NetworkLayer>,
    net: NetState,
    cfg: Cfg,
    access: Access,
    heartbeat: Heartbeat,
    rpl: Rpl,
    cdb: Cdb,
    adv: Adv,
    proxy: ProxyServer,
    pb_gatt: PbGatt,
    prov: Prov,
    pb_adv: PbAdv,
    /// Network PDUs addressed to this node, awaiting local delivery
    loopback: VecDeque<Vec<u8>>,
}

impl Mesh {
    /// Build a stack with the software crypto provider and the plain
    /// network codec
    pub fn new(
        config: MeshConfig,
        comp: Composition,
        info: ProvInfo,
        app: Box<dyn ProvApp>,
        bearer: Box<dyn Bearer>,
        store: Box<dyn SettingsStore>,
    ) -> Result<Self> {
        Self::with_parts(
            config,
            comp,
            info,
            app,
            bearer,
            store,
            Box::new(SoftCrypto::new()),
            Box::new(PlainNetwork),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn with_parts(
        config: MeshConfig,
        comp: Composition,
        info: ProvInfo,
        app: Box<dyn ProvApp>,
        bearer: Box<dyn Bearer>,
        store: Box<dyn SettingsStore>,
        mut crypto: Box<dyn MeshCrypto>,
        network: Box<dyn NetworkLayer>,
    ) -> Result<Self> {
        config.validate()?;

        let access = Access::new(comp, &config)?;
        let mut prov = Prov::new(info, app);
        prov.set_elem_count(access.elem_count());
        prov.reset_state(crypto.as_mut())?;

        info!(
            "Mesh stack initialized ({} elements, {:?} advertising)",
            access.elem_count(),
            config.adv_variant
        );

        Ok(Self {
            sched: Scheduler::new(),
            settings: Settings::new(config.store_timeout_ms, config.rpl_store_timeout_ms),
            store,
            crypto,
            bearer,
            network,
            net: NetState::new(config.subnet_count, config.app_key_count, config.label_count),
            cfg: Cfg::new(&config),
            access,
            heartbeat: Heartbeat::new(),
            rpl: Rpl::new(config.rpl_capacity),
            cdb: Cdb::new(
                config.cdb_node_count,
                config.cdb_subnet_count,
                config.cdb_app_key_count,
            ),
            adv: Adv::new(&config),
            proxy: ProxyServer::new(&config),
            pb_gatt: PbGatt::new(),
            prov,
            pb_adv: PbAdv::new(),
            loopback: VecDeque::new(),
            config,
        })
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn is_provisioned(&self) -> bool {
        self.net.is_valid()
    }

    pub fn net(&self) -> &NetState {
        &self.net
    }

    pub fn access(&self) -> &Access {
        &self.access
    }

    pub fn cfg(&self) -> &Cfg {
        &self.cfg
    }

    pub fn cdb(&self) -> &Cdb {
        &self.cdb
    }

    pub fn rpl(&self) -> &Rpl {
        &self.rpl
    }

    pub fn proxy(&self) -> &ProxyServer {
        &self.proxy
    }

    pub fn pb_gatt(&self) -> &PbGatt {
        &self.pb_gatt
    }

    pub fn prov(&self) -> &Prov {
        &self.prov
    }

    pub fn pb_adv(&self) -> &PbAdv {
        &self.pb_adv
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.sched
    }

    /// Current stack time in milliseconds
    pub fn now(&self) -> u64 {
        self.sched.now()
    }

    /// Deadline of the earliest pending work item
    pub fn next_deadline(&self) -> Option<u64> {
        self.sched.next_deadline()
    }

    pub fn set_heartbeat_callbacks(&mut self, cb: Box<dyn HeartbeatCb>) {
        self.heartbeat.set_callbacks(cb);
    }

    pub fn set_msg_cb(&mut self, cb: crate::access::MsgCb) {
        self.access.set_msg_cb(cb);
    }

    // ========================================================================
    // TIME
    // ========================================================================

    /// Move the clock to `now`, running each work item at its own deadline
    pub fn advance_to(&mut self, now: u64) {
        self.process();
        while let Some(deadline) = self.sched.next_deadline() {
            if deadline > now {
                break;
            }
            self.sched.advance_to(deadline);
            self.process();
        }
        self.sched.advance_to(now);
        self.process();
    }

    /// Run due work until nothing is left at the current time
    pub fn process(&mut self) {
        loop {
            self.drain_loopback();
            self.collect_store_requests();
            let Some(work) = self.sched.pop_due() else {
                break;
            };
            self.run_work(work);
        }
    }

    fn run_work(&mut self, work: Work) {
        debug!("Running {:?} at {} ms", work, self.sched.now());
        match work {
            Work::SettingsStore => self.store_pending(),
            Work::ModelPublish(model) => self.publish(model),
            Work::HeartbeatPublish => self.heartbeat_publish(),
            Work::HeartbeatSubscription => self.heartbeat.sub_end(),
            Work::AdvSend => {
                let events = self.adv.send_timeout(self.bearer.as_mut(), &mut self.sched);
                self.handle_adv_events(events);
            }
            Work::AdvGattTimeout => {
                let events = self.adv.gatt_timeout(self.bearer.as_mut());
                self.handle_adv_events(events);
            }
            Work::ProxySar(conn) => {
                if !self.proxy.sar_timeout(conn, self.bearer.as_mut())
                    && !self.pb_gatt.sar_timeout(conn, self.bearer.as_mut())
                {
                    debug!("SAR timeout for unknown connection 0x{:04x}", conn);
                }
            }
            Work::ProxyBeacons(conn) => {
                let beacons: Vec<Vec<u8>> = self
                    .net
                    .subnets()
                    .filter_map(|sub| self.network.beacon(&self.net, sub))
                    .collect();
                self.proxy.send_beacons(self.bearer.as_mut(), conn, &beacons);
            }
            Work::ProvTimeout => {
                let actions = self.prov.timeout();
                self.handle_prov_actions(actions);
            }
            Work::PbAdvRetransmit => {
                self.pb_adv.retransmit(&mut self.adv, &mut self.sched);
                self.adv_process();
            }
            Work::PbAdvLinkTimeout => {
                let events = self.pb_adv.link_timeout(&mut self.adv, &mut self.sched);
                self.handle_pb_adv_events(events);
                self.adv_process();
            }
        }
    }

    // ========================================================================
    // PROVISIONING
    // ========================================================================

    /// Make this unprovisioned node visible to provisioners. PB-ADV links
    /// are accepted whenever the node is unprovisioned; this enables the
    /// PB-GATT service as well.
    pub fn prov_enable(&mut self) -> Result<()> {
        if self.net.is_valid() {
            return Err(MeshError::AlreadyProvisioned);
        }
        self.pb_gatt.enable(false)?;
        let events = self.adv.update(self.bearer.as_mut(), &mut self.sched);
        self.handle_adv_events(events);
        self.adv_process();
        self.process();
        Ok(())
    }

    pub fn prov_disable(&mut self) -> Result<()> {
        self.pb_gatt.disable()?;
        let events = self.adv.update(self.bearer.as_mut(), &mut self.sched);
        self.handle_adv_events(events);
        self.process();
        Ok(())
    }

    /// Provision this node directly with known network parameters
    pub fn provision(&mut self, data: &ProvData) -> Result<()> {
        self.provision_local(data)?;
        self.process();
        Ok(())
    }

    fn provision_local(&mut self, data: &ProvData) -> Result<()> {
        if self.net.is_valid() {
            return Err(MeshError::AlreadyProvisioned);
        }
        info!("Primary Element: 0x{:04x}", data.addr);
        debug!(
            "net_idx 0x{:04x} flags 0x{:02x} iv_index 0x{:04x}",
            data.net_idx, data.flags, data.iv_index
        );

        self.net.subnet_add(self.crypto.as_ref(), data.net_idx, &data.net_key)?;
        if data.flags & FLAG_KEY_REFRESH != 0 {
            // Both key slots hold the provisioned key; phase 2 transmits on the new one
            if let Some(sub) = self.net.subnet_get_mut(data.net_idx) {
                sub.keys[1] = sub.keys[0].clone();
                sub.kr_phase = 0x02;
            }
        }
        self.net.provision(
            data.addr,
            &data.dev_key,
            data.iv_index,
            data.flags & FLAG_IV_UPDATE != 0,
        );
        self.access.comp_provision(data.addr);
        self.net.set_elem_count(self.access.elem_count());
        self.net.set_valid(true);
        self.prov.complete(data.net_idx, data.addr);
        self.start();
        Ok(())
    }

    /// Provision the device `req.uuid` over PB-ADV. Returns the link ID.
    pub fn provision_adv(&mut self, req: NodeRequest) -> Result<u32> {
        if self.pb_adv.is_active() || self.prov.is_active() {
            return Err(ProvError::Busy.into());
        }
        let uuid = req.uuid;
        self.prov.provision(req, &self.cdb)?;

        let mut raw = [0u8; 4];
        self.crypto.rand(&mut raw);
        let link_id = u32::from_be_bytes(raw);

        if let Err(e) = self.pb_adv.open(link_id, &uuid, &mut self.adv, &mut self.sched) {
            error!("Failed to open PB-ADV link: {}", e);
            self.prov.reset(self.crypto.as_mut(), &mut self.sched)?;
            return Err(e.into());
        }
        self.adv_process();
        self.process();
        Ok(link_id)
    }

    /// The user entered the number the device output
    pub fn input_number(&mut self, num: u32) -> Result<()> {
        let mut env = ProvEnv {
            crypto: self.crypto.as_mut(),
            cdb: &mut self.cdb,
            sched: &mut self.sched,
        };
        let actions = self.prov.input_number(num, &mut env)?;
        self.handle_prov_actions(actions);
        self.process();
        Ok(())
    }

    pub fn input_string(&mut self, value: &str) -> Result<()> {
        let mut env = ProvEnv {
            crypto: self.crypto.as_mut(),
            cdb: &mut self.cdb,
            sched: &mut self.sched,
        };
        let actions = self.prov.input_string(value, &mut env)?;
        self.handle_prov_actions(actions);
        self.process();
        Ok(())
    }

    /// Create the configuration database with `net_key` as primary key
    pub fn cdb_create(&mut self, net_key: &[u8; 16]) -> Result<()> {
        self.cdb.create(net_key, self.store.as_ref())?;
        self.process();
        Ok(())
    }

    pub fn cdb_clear(&mut self) {
        self.cdb.clear(self.store.as_ref());
        self.process();
    }

    /// Forget a provisioned node
    pub fn cdb_node_del(&mut self, addr: u16) {
        self.cdb.node_del(addr, Some(self.store.as_ref()));
        self.process();
    }

    fn handle_pb_adv_events(&mut self, events: Vec<PbAdvEvent>) {
        for event in events {
            let mut env = ProvEnv {
                crypto: self.crypto.as_mut(),
                cdb: &mut self.cdb,
                sched: &mut self.sched,
            };
            let actions = match event {
                PbAdvEvent::Opened => self.prov.link_opened(ProvBearerType::Adv, &mut env),
                PbAdvEvent::Pdu(pdu) => self.prov.recv(&pdu, &mut env),
                PbAdvEvent::Error(reason) => self.prov.bearer_error(reason, &mut env),
                PbAdvEvent::Closed(reason) => {
                    debug!("PB-ADV link closed ({:?})", reason);
                    self.prov.link_closed(&mut env);
                    self.gatt_services_update();
                    Vec::new()
                }
            };
            self.handle_prov_actions(actions);
        }
    }

    fn handle_prov_actions(&mut self, actions: Vec<ProvAction>) {
        for action in actions {
            match action {
                ProvAction::Send(pdu) => {
                    if let Err(e) = self.prov_send(&pdu) {
                        warn!("Failed to send provisioning PDU: {}", e);
                    }
                }
                ProvAction::Provisioned(data) => {
                    if let Err(e) = self.provision_local(&data) {
                        error!("Applying provisioning data failed: {}", e);
                    }
                }
                ProvAction::NodeAdded { addr } => {
                    self.cdb.node_store(addr, self.store.as_ref());
                }
                ProvAction::Close(reason) => match self.prov.bearer() {
                    Some(ProvBearerType::Adv) => {
                        let events = self.pb_adv.close(reason, &mut self.adv, &mut self.sched);
                        self.handle_pb_adv_events(events);
                    }
                    Some(ProvBearerType::Gatt) => {
                        if let Some(conn) = self.pb_gatt.conn() {
                            if let Err(e) = self.bearer.disconnect(conn) {
                                error!("Failed to disconnect 0x{:04x}: {}", conn, e);
                            }
                        }
                    }
                    None => debug!("Close without an open link"),
                },
            }
        }
        self.adv_process();
    }

    fn prov_send(&mut self, pdu: &[u8]) -> std::result::Result<(), ProvError> {
        match self.prov.bearer() {
            Some(ProvBearerType::Adv) => self.pb_adv.send(pdu, &mut self.adv, &mut self.sched),
            Some(ProvBearerType::Gatt) => {
                let conn = self.pb_gatt.conn().ok_or(ProvError::NotActive)?;
                self.pb_gatt
                    .send(self.bearer.as_mut(), conn, pdu)
                    .map_err(|e| ProvError::Bearer(e.to_string()))
            }
            None => Err(ProvError::NotActive),
        }
    }

    // ========================================================================
    // STACK LIFECYCLE
    // ========================================================================

    /// Start everything a provisioned node runs
    fn start(&mut self) {
        self.access.commit(&mut self.sched);
        self.heartbeat.start(&mut self.sched);
        self.gatt_services_update();
    }

    /// Swap PB-GATT for the proxy service once provisioned. A provisioning
    /// connection keeps PB-GATT until it is closed.
    fn gatt_services_update(&mut self) {
        if !self.net.is_valid() || self.prov.bearer() == Some(ProvBearerType::Gatt) {
            return;
        }
        if self.pb_gatt.is_enabled() {
            if let Err(e) = self.pb_gatt.disable() {
                debug!("Provisioning service: {}", e);
            }
        }
        if !self.proxy.is_enabled() {
            match self.proxy.gatt_enable(true) {
                Ok(()) => {
                    let now = self.sched.now();
                    if let Err(e) = self.proxy.identity_enable(&mut self.net, now) {
                        warn!("Node identity not started: {}", e);
                    }
                }
                Err(e) => warn!("Failed to enable proxy service: {}", e),
            }
        }
        let events = self.adv.update(self.bearer.as_mut(), &mut self.sched);
        self.handle_adv_events(events);
        self.adv_process();
    }

    /// Unprovision the node. Persisted node state is erased on the next
    /// flush; the configuration database is kept.
    pub fn reset(&mut self) -> Result<()> {
        if !self.net.is_valid() {
            return Err(MeshError::NotProvisioned);
        }
        info!("Resetting node");

        self.pb_adv.reset(&mut self.adv, &mut self.sched);
        self.prov.reset(self.crypto.as_mut(), &mut self.sched)?;

        let primary = self.net.primary_addr();
        self.heartbeat.pub_set(HbPub::default(), false, true, &mut self.sched)?;
        self.heartbeat
            .sub_set(addr::ADDR_UNASSIGNED, addr::ADDR_UNASSIGNED, 0, primary, &mut self.sched)?;

        self.access.reset(&mut self.sched);
        self.access.comp_unprovision();
        self.net.reset();
        self.rpl.clear();
        self.cfg = Cfg::new(&self.config);
        self.settings.schedule_store(PendingFlag::Cfg, &mut self.sched);

        if let Err(e) = self.proxy.gatt_disable(self.bearer.as_mut()) {
            debug!("Proxy service: {}", e);
        }
        let events = self.adv.update(self.bearer.as_mut(), &mut self.sched);
        self.handle_adv_events(events);
        self.process();
        Ok(())
    }

    /// Stop publishing and refuse new advertising buffers
    pub fn suspend(&mut self) {
        info!("Suspending mesh");
        self.access.suspend(&mut self.sched);
        self.heartbeat.suspend(&mut self.sched);
        self.adv.set_suspended(true);
    }

    pub fn resume(&mut self) {
        info!("Resuming mesh");
        self.adv.set_suspended(false);
        self.access.resume(&mut self.sched);
        self.heartbeat.resume(&mut self.sched);
        self.process();
    }

    /// Move to a new IV index or IV update state
    pub fn iv_set(&mut self, iv_index: u32, iv_update: bool) {
        if self.net.iv_set(iv_index, iv_update) {
            info!("IV index now 0x{:08x}", iv_index);
            self.rpl.reset(self.store.as_ref());
        }
        self.cdb.iv_update(iv_index, iv_update);
        self.process();
    }

    // ========================================================================
    // KEYS AND CONFIGURATION
    // ========================================================================

    pub fn subnet_add(&mut self, net_idx: u16, key: &[u8; 16]) -> Result<()> {
        self.net.subnet_add(self.crypto.as_ref(), net_idx, key)?;
        self.process();
        Ok(())
    }

    pub fn subnet_del(&mut self, net_idx: u16) {
        self.net.subnet_del(net_idx);
        self.proxy.subnet_deleted(net_idx);
        self.process();
    }

    pub fn app_key_add(&mut self, app_idx: u16, net_idx: u16, key: &[u8; 16]) -> Result<()> {
        self.net.app_key_add(app_idx, net_idx, key)?;
        self.process();
        Ok(())
    }

    pub fn model_bind(&mut self, model: ModelRef, key: BoundKey) -> Result<()> {
        self.access.bind(model, key)?;
        self.process();
        Ok(())
    }

    pub fn model_unbind(&mut self, model: ModelRef, key: BoundKey) -> Result<()> {
        self.access.unbind(model, key)?;
        self.process();
        Ok(())
    }

    pub fn model_sub_add(&mut self, model: ModelRef, group: u16) -> Result<()> {
        self.access.sub_add(model, group)?;
        self.process();
        Ok(())
    }

    pub fn model_sub_del(&mut self, model: ModelRef, group: u16) -> Result<()> {
        self.access.sub_del(model, group)?;
        self.process();
        Ok(())
    }

    pub fn model_pub_set(&mut self, model: ModelRef, params: PubParams) -> Result<()> {
        if !addr::is_unassigned(params.addr) && !self.net.app_key_exists(params.key) {
            return Err(AccessError::InvalidArgument("unknown AppKey").into());
        }
        self.access.pub_set(model, params, &mut self.sched)?;
        self.process();
        Ok(())
    }

    /// Replace the message `model` publishes, opcode included
    pub fn model_pub_msg_set(&mut self, model: ModelRef, msg: Vec<u8>) -> Result<()> {
        let publication = self
            .access
            .model_mut(model)
            .ok_or(AccessError::InvalidModel)?
            .publication_mut()
            .ok_or(AccessError::NotSupported)?;
        publication.msg = msg;
        Ok(())
    }

    /// Persist model-private data under the model's settings key
    pub fn model_data_store(&mut self, model: ModelRef, name: Option<&str>, data: Option<&[u8]>) -> Result<()> {
        self.access
            .model_data_store(model, name, data, self.store.as_ref())?;
        Ok(())
    }

    pub fn heartbeat_pub_set(&mut self, publication: HbPub) -> Result<()> {
        let known = self.net.subnet_get(publication.net_idx).is_some();
        let provisioned = self.net.is_valid();
        self.heartbeat
            .pub_set(publication, known, provisioned, &mut self.sched)?;
        self.process();
        Ok(())
    }

    pub fn heartbeat_pub_get(&self) -> HbPub {
        self.heartbeat.pub_get()
    }

    pub fn heartbeat_sub_set(&mut self, src: u16, dst: u16, period: u32) -> Result<()> {
        let primary = self.net.primary_addr();
        self.heartbeat
            .sub_set(src, dst, period, primary, &mut self.sched)?;
        self.process();
        Ok(())
    }

    pub fn heartbeat_sub_get(&self) -> HbSub {
        self.heartbeat.sub_get(&self.sched)
    }

    pub fn relay_set(&mut self, state: FeatureState, xmit: u8) -> Result<()> {
        self.cfg.relay_set(state, xmit)?;
        self.features_changed();
        Ok(())
    }

    pub fn friend_set(&mut self, state: FeatureState) -> Result<()> {
        self.cfg.friend_set(state)?;
        self.features_changed();
        Ok(())
    }

    /// Turning GATT proxy off closes every client with a filter
    pub fn gatt_proxy_set(&mut self, state: FeatureState) -> Result<()> {
        self.cfg.gatt_proxy_set(state)?;
        if state == FeatureState::Disabled {
            self.proxy.gatt_disconnect(self.bearer.as_mut());
        }
        let events = self.adv.update(self.bearer.as_mut(), &mut self.sched);
        self.handle_adv_events(events);
        self.features_changed();
        Ok(())
    }

    pub fn beacon_set(&mut self, enabled: bool) {
        self.cfg.beacon_set(enabled);
        self.process();
    }

    pub fn default_ttl_set(&mut self, ttl: u8) -> Result<()> {
        self.cfg.default_ttl_set(ttl)?;
        self.process();
        Ok(())
    }

    pub fn net_transmit_set(&mut self, xmit: u8) {
        self.cfg.net_transmit_set(xmit);
        self.process();
    }

    /// Start node identity advertising on every subnet
    pub fn proxy_identity_enable(&mut self) -> Result<()> {
        let now = self.sched.now();
        if self.proxy.identity_enable(&mut self.net, now)? {
            let events = self.adv.update(self.bearer.as_mut(), &mut self.sched);
            self.handle_adv_events(events);
        }
        self.process();
        Ok(())
    }

    fn features(&self) -> u16 {
        let mut feat = 0;
        if self.cfg.relay_get() == FeatureState::Enabled {
            feat |= FEAT_RELAY;
        }
        if self.cfg.gatt_proxy_get() == FeatureState::Enabled {
            feat |= FEAT_PROXY;
        }
        if self.cfg.friend_get() == FeatureState::Enabled {
            feat |= FEAT_FRIEND;
        }
        feat
    }

    fn features_changed(&mut self) {
        let changes = self.cfg.take_feature_changes();
        if changes != 0 && self.net.is_valid() {
            if let Some(msg) = self.heartbeat.feature_changed(changes, self.features()) {
                if let Err(e) = self.heartbeat_send(msg, None) {
                    warn!("Failed to send heartbeat: {}", e);
                }
            }
        }
        self.process();
    }

    // ========================================================================
    // OUTBOUND
    // ========================================================================

    /// Trigger an immediate publication burst of `model`
    pub fn model_publish(&mut self, model: ModelRef) -> Result<()> {
        self.access.model_publish(model, &mut self.sched)?;
        self.process();
        Ok(())
    }

    /// Send an access message from `model`
    pub fn model_send(&mut self, model: ModelRef, ctx: MsgCtx, payload: Vec<u8>) -> Result<()> {
        let tx = self.access.model_send(model, ctx, payload)?;
        self.access_send(tx, None)?;
        self.process();
        Ok(())
    }

    fn publish(&mut self, model: ModelRef) {
        let Some(ptx) = self.access.publish_timeout(model, &mut self.sched) else {
            return;
        };
        debug!("Publishing from {:?} to 0x{:04x}", model, ptx.tx.ctx.addr);
        if ptx.cred {
            debug!("Friendship credentials unavailable, using master credentials");
        }
        match self.access_send(ptx.tx, Some(SendCb::ModelPublish(model))) {
            Ok(true) => {}
            Ok(false) => {
                // Delivered locally only; the burst continues without the bearer
                let now = self.sched.now();
                self.access.publish_start(model, now);
                self.access.publish_sent(model, &mut self.sched);
            }
            Err(e) => {
                warn!("Publication from {:?} failed: {}", model, e);
                self.access.publish_failed(model, &mut self.sched);
            }
        }
    }

    /// Send an access message. Returns true if it went to the advertising
    /// bearer.
    fn access_send(&mut self, mut tx: AccessTx, cb: Option<SendCb>) -> Result<bool> {
        if let Some(KeyRef::App(app_idx)) = tx.ctx.key {
            let app_key = self
                .net
                .app_key_get(app_idx)
                .ok_or(AccessError::InvalidArgument("unknown AppKey"))?;
            tx.ctx.net_idx = app_key.net_idx;
        }
        self.net_send(tx.src, tx.ctx, false, &tx.payload, cb)
    }

    fn heartbeat_publish(&mut self) {
        let publication = self.heartbeat.pub_get();
        let known = self.net.subnet_get(publication.net_idx).is_some();
        let Some(msg) = self.heartbeat.publish(known, self.features()) else {
            return;
        };
        match self.heartbeat_send(msg, Some(SendCb::Heartbeat)) {
            Ok(true) => {}
            Ok(false) => self.heartbeat.publish_end(&mut self.sched),
            Err(e) => {
                warn!("Unable to send heartbeat: {}", e);
                self.heartbeat.publish_end(&mut self.sched);
            }
        }
    }

    fn heartbeat_send(&mut self, msg: HbMessage, cb: Option<SendCb>) -> Result<bool> {
        let src = self.net.primary_addr();
        self.net_send(src, msg.ctx, true, &msg.payload, cb)
    }

    /// Encode and send a network PDU. Local destinations are delivered
    /// through the loopback queue; a unicast to one of our own elements
    /// never reaches the bearer.
    fn net_send(
        &mut self,
        src: u16,
        mut ctx: MsgCtx,
        ctl: bool,
        payload: &[u8],
        cb: Option<SendCb>,
    ) -> Result<bool> {
        if !self.net.is_valid() {
            return Err(MeshError::NotProvisioned);
        }
        if ctx.send_ttl == addr::TTL_DEFAULT {
            ctx.send_ttl = self.cfg.default_ttl_get();
        }
        let tx = NetTx {
            src,
            seq: self.net.next_seq()?,
            ctl,
            ctx,
            xmit: self.cfg.net_transmit_get(),
        };
        debug!(
            "src 0x{:04x} dst 0x{:04x} ttl {} seq 0x{:06x} len {}",
            src,
            ctx.addr,
            ctx.send_ttl,
            tx.seq,
            payload.len()
        );
        let pdu = self.network.encode(&self.net, &tx, payload)?;

        let dst = ctx.addr;
        let local_unicast = self.net.has_addr(dst);
        if local_unicast || self.access.has_addr(dst) || self.cfg.fixed_group_match(dst) {
            self.loopback.push_back(pdu.clone());
        }
        if local_unicast {
            return Ok(false);
        }

        self.proxy.relay(self.bearer.as_mut(), &pdu, dst);
        // A TTL of 1 or less never leaves the node over the air
        if ctx.send_ttl <= 1 && !addr::is_unicast(dst) && self.proxy.conn_count() > 0 {
            return Ok(false);
        }
        self.adv.send(AdvType::Data, tx.xmit, pdu, cb)?;
        self.adv_process();
        Ok(true)
    }

    fn adv_process(&mut self) {
        let events = self.adv.process(self.bearer.as_mut(), &mut self.sched);
        self.handle_adv_events(events);
    }

    /// The controller finished an extended advertising set
    pub fn adv_complete(&mut self) {
        let events = self.adv.adv_complete(self.bearer.as_mut(), &mut self.sched);
        self.handle_adv_events(events);
        self.process();
    }

    fn handle_adv_events(&mut self, events: Vec<AdvEvent>) {
        for event in events {
            match event {
                AdvEvent::Started {
                    cb: SendCb::ModelPublish(model),
                    ..
                } => {
                    let now = self.sched.now();
                    self.access.publish_start(model, now);
                }
                AdvEvent::Started { .. } => {}
                AdvEvent::Sent { cb } => match cb {
                    SendCb::ModelPublish(model) => self.access.publish_sent(model, &mut self.sched),
                    SendCb::Heartbeat => self.heartbeat.publish_end(&mut self.sched),
                    SendCb::PbAdv => {}
                    SendCb::PbAdvClose => {
                        let events = self.pb_adv.close_sent(&mut self.adv, &mut self.sched);
                        self.handle_pb_adv_events(events);
                    }
                },
                AdvEvent::Idle => self.gatt_adv_start(),
            }
        }
    }

    /// Connectable advertising while the advertising queue is idle
    fn gatt_adv_start(&mut self) {
        if self.pb_gatt.conn().is_some() {
            return;
        }
        let provisioned = self.net.is_valid();
        let (adv, pb) = if self.pb_gatt.is_enabled() && !provisioned {
            let info = self.prov.info();
            let adv = self.pb_gatt.adv_start(
                provisioned,
                info.uuid.as_bytes(),
                info.oob_info,
                info.uri.as_deref(),
            );
            (adv, true)
        } else if self.proxy.is_enabled() {
            let gatt_proxy = self.cfg.gatt_proxy_get() == FeatureState::Enabled;
            let now = self.sched.now();
            let adv = self
                .proxy
                .adv_start(&mut self.net, gatt_proxy, self.crypto.as_mut(), now);
            (adv, false)
        } else {
            return;
        };

        let adv = match adv {
            Ok(adv) => adv,
            Err(e) => {
                debug!("No GATT advertising: {}", e);
                return;
            }
        };
        match self
            .adv
            .gatt_start(&adv.params, &adv.ad, &adv.sd, self.bearer.as_mut(), &mut self.sched)
        {
            Ok(()) if pb => self.pb_gatt.adv_started(),
            Ok(()) => {}
            Err(e) => error!("Failed to start GATT advertising: {}", e),
        }
    }

    // ========================================================================
    // INBOUND
    // ========================================================================

    /// An advertising report from the scanner
    pub fn scan_recv(&mut self, adv_type: u8, data: &[u8]) {
        for pdu in adv::scan_recv(adv_type, data) {
            match pdu {
                ScanPdu::Message(pdu) => self.net_recv(NetIf::Adv, pdu),
                ScanPdu::Prov(pdu) => self.pb_adv_recv(pdu),
                ScanPdu::Beacon(beacon) => debug!("Beacon ({} bytes)", beacon.len()),
            }
        }
        self.process();
    }

    fn pb_adv_recv(&mut self, data: &[u8]) {
        // Links to this node are only accepted while unprovisioned
        let own_uuid = (!self.net.is_valid()).then(|| *self.prov.info().uuid.as_bytes());
        let events = self
            .pb_adv
            .recv(data, own_uuid.as_ref(), &mut self.adv, &mut self.sched);
        self.handle_pb_adv_events(events);
        self.adv_process();
    }

    fn drain_loopback(&mut self) {
        let mut budget = LOOPBACK_MAX;
        while let Some(pdu) = self.loopback.pop_front() {
            if budget == 0 {
                warn!("Dropping {} looped back PDUs", self.loopback.len() + 1);
                self.loopback.clear();
                return;
            }
            budget -= 1;
            self.net_recv(NetIf::Local, &pdu);
        }
    }

    fn net_recv(&mut self, net_if: NetIf, pdu: &[u8]) {
        if !self.net.is_valid() {
            return;
        }
        let Some(rx) = self.network.decode(&self.net, net_if, pdu) else {
            debug!("Dropping undecodable network PDU on {:?}", net_if);
            return;
        };
        if net_if != NetIf::Local && self.net.has_addr(rx.ctx.addr) {
            debug!("Dropping locally originated packet");
            return;
        }
        if let NetIf::Proxy(conn) = net_if {
            self.proxy.addr_add(conn, rx.ctx.addr);
        }

        let rpl_rx = RplRx {
            src: rx.ctx.addr,
            seq: rx.seq,
            old_iv: rx.old_iv,
            local_if: net_if == NetIf::Local,
            local_match: rx.local_match,
        };
        if self.rpl.check(&rpl_rx) {
            debug!("Replayed message from 0x{:04x} seq 0x{:06x}", rx.ctx.addr, rx.seq);
            return;
        }

        if rx.local_match {
            self.deliver(&rx);
        }
        // Unicasts to our own elements end here
        if net_if != NetIf::Local && !self.net.has_addr(rx.ctx.recv_dst) {
            self.relay(&rx);
        }
    }

    fn deliver(&mut self, rx: &NetRx) {
        if rx.ctl {
            match rx.payload.split_first() {
                Some((&CTL_HEARTBEAT, params)) => {
                    if let Err(e) = self.heartbeat.recv(rx, params, &self.sched) {
                        warn!("Bad heartbeat: {}", e);
                    }
                }
                Some((op, _)) => debug!("Unhandled control opcode 0x{:02x}", op),
                None => debug!("Empty control message"),
            }
            return;
        }

        let dst = rx.ctx.recv_dst;
        if !self.access.has_addr(dst) && !self.cfg.fixed_group_match(dst) {
            return;
        }
        match self.access.recv(&rx.ctx, &rx.payload) {
            Ok(dispatch) => {
                for reply in dispatch.replies {
                    if let Err(e) = self.access_send(reply, None) {
                        warn!("Failed to send reply: {}", e);
                    }
                }
            }
            Err(e) => debug!("Access message dropped: {}", e),
        }
    }

    /// Forward a received PDU. Advertising traffic is relayed with a lower
    /// TTL when the relay feature is on; proxy traffic goes to the
    /// advertising bearer unchanged.
    fn relay(&mut self, rx: &NetRx) {
        let from_proxy = matches!(rx.net_if, NetIf::Proxy(_));
        let relay_enabled = self.cfg.relay_get() == FeatureState::Enabled;
        let proxy_enabled = self.cfg.gatt_proxy_get() == FeatureState::Enabled;

        if rx.ctx.recv_ttl <= 1 && !from_proxy {
            return;
        }
        if !from_proxy && !relay_enabled && !proxy_enabled {
            return;
        }

        let (ttl, xmit) = if from_proxy {
            (rx.ctx.recv_ttl, self.cfg.net_transmit_get())
        } else {
            (rx.ctx.recv_ttl - 1, self.cfg.relay_retransmit_get())
        };
        let tx = NetTx {
            src: rx.ctx.addr,
            seq: rx.seq,
            ctl: rx.ctl,
            ctx: MsgCtx {
                addr: rx.ctx.recv_dst,
                send_ttl: ttl,
                ..rx.ctx
            },
            xmit,
        };
        let pdu = match self.network.encode(&self.net, &tx, &rx.payload) {
            Ok(pdu) => pdu,
            Err(e) => {
                warn!("Unable to re-encode relayed PDU: {}", e);
                return;
            }
        };

        if !from_proxy && proxy_enabled {
            self.proxy.relay(self.bearer.as_mut(), &pdu, rx.ctx.recv_dst);
        }
        if from_proxy || relay_enabled {
            debug!("Relaying packet from 0x{:04x} TTL {}", rx.ctx.addr, ttl);
            if let Err(e) = self.adv.send(AdvType::Data, xmit, pdu, None) {
                warn!("Out of relay buffers: {}", e);
                return;
            }
            self.adv_process();
        }
    }

    // ========================================================================
    // GATT
    // ========================================================================

    /// A central connected to our connectable advertisement
    pub fn gatt_connected(&mut self, conn: u16) {
        let events = self.adv.gatt_connected(self.bearer.as_mut(), &mut self.sched);
        if self.net.is_valid() {
            match self.proxy.connected(conn) {
                Ok(true) => info!("Proxy client connected (0x{:04x})", conn),
                Ok(false) => debug!("Proxy service not registered"),
                Err(e) => warn!("Rejecting proxy client 0x{:04x}: {}", conn, e),
            }
        } else if self.pb_gatt.connected(conn, false) {
            info!("Provisioning client connected (0x{:04x})", conn);
        }
        self.handle_adv_events(events);
        self.process();
    }

    pub fn gatt_disconnected(&mut self, conn: u16) {
        if self.proxy.disconnected(conn, &mut self.sched) {
            info!("Proxy client disconnected (0x{:04x})", conn);
        } else if self.pb_gatt.disconnected(conn, &mut self.sched) {
            info!("Provisioning client disconnected (0x{:04x})", conn);
            if self.prov.bearer() == Some(ProvBearerType::Gatt) {
                let mut env = ProvEnv {
                    crypto: self.crypto.as_mut(),
                    cdb: &mut self.cdb,
                    sched: &mut self.sched,
                };
                self.prov.link_closed(&mut env);
            }
            self.gatt_services_update();
        }
        let events = self.adv.update(self.bearer.as_mut(), &mut self.sched);
        self.handle_adv_events(events);
        self.adv_process();
        self.process();
    }

    /// The client subscribed to our Data Out characteristic
    pub fn gatt_ccc_write(&mut self, conn: u16) -> Result<()> {
        if self.pb_gatt.conn() == Some(conn) {
            self.pb_gatt.ccc_write(conn)?;
            if self.prov.is_active() {
                return Err(ProvError::Busy.into());
            }
            let mut env = ProvEnv {
                crypto: self.crypto.as_mut(),
                cdb: &mut self.cdb,
                sched: &mut self.sched,
            };
            let actions = self.prov.link_opened(ProvBearerType::Gatt, &mut env);
            self.handle_prov_actions(actions);
        } else {
            self.proxy.ccc_write(conn, &mut self.sched)?;
        }
        self.process();
        Ok(())
    }

    /// A write to one of our Data In characteristics
    pub fn gatt_write(&mut self, conn: u16, data: &[u8]) -> Result<()> {
        let result = self.gatt_recv(conn, data);
        self.process();
        result
    }

    fn gatt_recv(&mut self, conn: u16, data: &[u8]) -> Result<()> {
        if self.pb_gatt.conn() == Some(conn) {
            if let Some(pdu) = self.pb_gatt.recv(conn, data, &mut self.sched)? {
                let mut env = ProvEnv {
                    crypto: self.crypto.as_mut(),
                    cdb: &mut self.cdb,
                    sched: &mut self.sched,
                };
                let actions = self.prov.recv(&pdu, &mut env);
                self.handle_prov_actions(actions);
            }
            return Ok(());
        }

        let Some(pdu) = self.proxy.recv(conn, data, &mut self.sched)? else {
            return Ok(());
        };
        match pdu.msg_type {
            TYPE_NET_PDU => self.net_recv(NetIf::Proxy(conn), &pdu.data),
            TYPE_BEACON => debug!("Beacon from proxy client 0x{:04x}", conn),
            TYPE_CONFIG => self.proxy_cfg_recv(conn, &pdu.data)?,
            other => {
                warn!("Unhandled proxy message type 0x{:02x}", other);
                return Err(ProxyError::WrongService(other).into());
            }
        }
        Ok(())
    }

    /// Proxy configuration: decode, apply to the client's filter and answer
    /// with the filter status
    fn proxy_cfg_recv(&mut self, conn: u16, data: &[u8]) -> Result<()> {
        let Some(rx) = self.network.decode(&self.net, NetIf::Proxy(conn), data) else {
            warn!("Failed to decode proxy configuration PDU");
            return Ok(());
        };
        if !rx.ctl || !addr::is_unassigned(rx.ctx.recv_dst) {
            warn!("Proxy configuration PDU with wrong header");
            return Ok(());
        }
        self.proxy.addr_add(conn, rx.ctx.addr);

        let Some(status) = self.proxy.filter_recv(conn, &rx.payload)? else {
            return Ok(());
        };
        let tx = NetTx {
            src: self.net.primary_addr(),
            seq: self.net.next_seq()?,
            ctl: true,
            ctx: MsgCtx::control(rx.ctx.net_idx, addr::ADDR_UNASSIGNED, 0),
            xmit: self.cfg.net_transmit_get(),
        };
        let pdu = self.network.encode(&self.net, &tx, &status)?;
        self.proxy
            .send(self.bearer.as_mut(), conn, TYPE_CONFIG, &pdu)?;
        Ok(())
    }

    // ========================================================================
    // SETTINGS
    // ========================================================================

    /// Schedule the flush of everything a component marked dirty
    fn collect_store_requests(&mut self) {
        let mut flags = self.net.take_store_requests();
        if self.rpl.take_store_request() {
            flags.set(PendingFlag::Rpl);
        }
        if self.access.take_store_request() {
            flags.set(PendingFlag::Mod);
        }
        if self.heartbeat.take_store_request() {
            flags.set(PendingFlag::HbPub);
        }
        if self.cfg.take_store_request() {
            flags.set(PendingFlag::Cfg);
        }
        if self.cdb.take_store_request() {
            flags.set(PendingFlag::Cdb);
        }
        for flag in FLUSH_ORDER {
            if flags.contains(flag) {
                self.settings.schedule_store(flag, &mut self.sched);
            }
        }
    }

    /// `Work::SettingsStore`: write every pending category
    fn store_pending(&mut self) {
        debug!("Storing pending settings");
        let valid = self.net.is_valid();
        let store = self.store.as_ref();
        for flag in FLUSH_ORDER {
            if !self.settings.take(flag) {
                continue;
            }
            match flag {
                PendingFlag::Rpl => self.rpl.pending_store(addr::ADDR_ALL_NODES, valid, store),
                PendingFlag::NetKeys => self.net.pending_net_keys_store(store),
                PendingFlag::AppKeys => self.net.pending_app_keys_store(store),
                PendingFlag::Net => self.net.pending_net_store(store),
                PendingFlag::Iv => self.net.pending_iv_store(store),
                PendingFlag::Seq => self.net.pending_seq_store(store),
                PendingFlag::HbPub => self.heartbeat.pending_store(store),
                PendingFlag::Cfg => self.cfg.pending_store(valid, store),
                PendingFlag::Mod => self.access.pending_store(store),
                PendingFlag::Va => self.net.pending_va_store(store),
                PendingFlag::Cdb => self.cdb.pending_store(store),
            }
        }
    }

    /// Write all pending settings now and flush the backing store
    pub fn settings_flush(&mut self) -> Result<()> {
        self.collect_store_requests();
        self.sched.cancel(Work::SettingsStore);
        self.store_pending();
        self.store.flush()?;
        Ok(())
    }

    /// Restore every stored `bt_mesh/` key. A value that fails to apply is
    /// logged and skipped. Returns the number of keys applied.
    pub fn settings_load(&mut self) -> Result<usize> {
        let entries = self.store.load_all(keys::ROOT)?;
        let mut applied = 0;
        for (path, value) in entries {
            let Some(key) = SettingsKey::parse(&path) else {
                warn!("Unknown settings key {}", path);
                continue;
            };
            match self.restore(&key, Some(&value)) {
                Ok(()) => applied += 1,
                Err(e) => error!("Failed to restore {}: {}", path, e),
            }
        }
        // Replaying stored configuration is not a change
        self.cfg.take_feature_changes();
        self.cfg.take_store_request();
        self.access.take_store_request();
        self.heartbeat.take_store_request();
        info!("Restored {} settings", applied);
        Ok(applied)
    }

    fn restore(&mut self, key: &SettingsKey, value: Option<&[u8]>) -> std::result::Result<(), StoreError> {
        match key {
            SettingsKey::Net => self.net.restore_net(value),
            SettingsKey::Iv => self.net.restore_iv(value),
            SettingsKey::Seq => self.net.restore_seq(value),
            SettingsKey::HbPub => self.heartbeat.restore(value),
            SettingsKey::Cfg => self.cfg.restore(value),
            SettingsKey::Rpl(src) => self.rpl.restore(*src, value),
            SettingsKey::NetKey(net_idx) => self.net.restore_net_key(self.crypto.as_ref(), *net_idx, value),
            SettingsKey::AppKey(app_idx) => self.net.restore_app_key(*app_idx, value),
            SettingsKey::Label(idx) => self.net.restore_label(*idx, value),
            SettingsKey::Model {
                vnd,
                elem_idx,
                mod_idx,
                record,
            } => {
                let model = ModelRef {
                    elem_idx: *elem_idx,
                    vnd: *vnd,
                    mod_idx: *mod_idx,
                };
                self.access.restore(model, record, value)
            }
            SettingsKey::CdbNet => self.cdb.restore_net(value),
            SettingsKey::CdbNode(addr) => self.cdb.restore_node(*addr, value),
            SettingsKey::CdbSubnet(net_idx) => self.cdb.restore_subnet(*net_idx, value),
            SettingsKey::CdbAppKey(app_idx) => self.cdb.restore_app_key(*app_idx, value),
        }
    }

    /// Bring a restored node up. Returns false if nothing was provisioned.
    pub fn settings_commit(&mut self) -> bool {
        if self.net.subnet_count() == 0 {
            debug!("No subnets restored; node stays unprovisioned");
            return false;
        }
        let primary = self.net.primary_addr();
        if !addr::is_unicast(primary) {
            warn!("Subnets restored without a primary address");
            return false;
        }
        self.access.comp_provision(primary);
        self.net.set_elem_count(self.access.elem_count());
        self.net.set_valid(true);
        info!("Restored provisioned node 0x{:04x}", primary);
        self.start();
        self.process();
        true
    }

    /// Data stored under a model record, for hosts inspecting persistence
    pub fn model_record_key(model: ModelRef, record: &ModelRecord) -> String {
        keys::model(model.vnd, model.elem_idx, model.mod_idx, record)
    }
}
