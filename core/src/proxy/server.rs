// Mesh Proxy service
//
// One client slot per GATT connection, each with an address filter and a SAR
// role. While connections are free the node advertises the service, cycling
// through the subnets it may advertise on with Node Identity or Network ID
// service data.

use tracing::{debug, error, warn};

use super::msg::{self, ProxyPdu, ProxyRole, TYPE_BEACON, TYPE_NET_PDU, TYPE_PROV};
use super::{GattAdv, ProxyError, ADV_FAST_INT_MS, ADV_SLOW_INT_MS, PROXY_DATA_OUT, UUID_MESH_PROXY};
use crate::addr;
use crate::bearer::Bearer;
use crate::config::MeshConfig;
use crate::crypto::{CryptoError, MeshCrypto};
use crate::net::{NetState, NodeIdState, Subnet};
use crate::scheduler::{Scheduler, Work};

pub const CFG_FILTER_SET: u8 = 0x00;
pub const CFG_FILTER_ADD: u8 = 0x01;
pub const CFG_FILTER_REMOVE: u8 = 0x02;
pub const CFG_FILTER_STATUS: u8 = 0x03;

const ID_TYPE_NET: u8 = 0x00;
const ID_TYPE_NODE: u8 = 0x01;

/// Service data lengths including the service UUID
pub const NET_ID_LEN: usize = 11;
pub const NODE_ID_LEN: usize = 19;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterType {
    /// Notifications not enabled yet; nothing is relayed
    None,
    /// Relay only to listed addresses
    Accept,
    /// Relay to everything except listed addresses
    Reject,
}

#[derive(Debug)]
struct Client {
    filter_type: FilterType,
    filter: Vec<Option<u16>>,
    role: ProxyRole,
}

impl Client {
    fn filter_add(&mut self, addr: u16) {
        debug!("addr 0x{:04x}", addr);
        if addr::is_unassigned(addr) || self.filter.contains(&Some(addr)) {
            return;
        }
        if let Some(slot) = self.filter.iter_mut().find(|a| a.is_none()) {
            *slot = Some(addr);
        }
    }

    fn filter_remove(&mut self, addr: u16) {
        debug!("addr 0x{:04x}", addr);
        if let Some(slot) = self.filter.iter_mut().find(|a| **a == Some(addr)) {
            *slot = None;
        }
    }

    fn filter_clear(&mut self) {
        self.filter.iter_mut().for_each(|a| *a = None);
    }

    fn filter_match(&self, addr: u16) -> bool {
        debug!("filter_type {:?} addr 0x{:04x}", self.filter_type, addr);
        match self.filter_type {
            FilterType::Reject => !self.filter.contains(&Some(addr)),
            FilterType::Accept => addr == addr::ADDR_ALL_NODES || self.filter.contains(&Some(addr)),
            FilterType::None => false,
        }
    }

    fn status(&self) -> Vec<u8> {
        let count = self.filter.iter().flatten().count() as u16;
        let filter_type = match self.filter_type {
            FilterType::Accept => 0x00,
            _ => 0x01,
        };
        let mut status = vec![CFG_FILTER_STATUS, filter_type];
        status.extend_from_slice(&count.to_be_bytes());
        status
    }
}

/// Last 8 bytes of `AES(identity_key, 0x00 * 6 || random || addr)`
pub fn node_id_hash(
    crypto: &dyn MeshCrypto,
    identity: &[u8; 16],
    random: &[u8; 8],
    addr: u16,
) -> Result<[u8; 8], CryptoError> {
    let mut block = [0u8; 16];
    block[6..14].copy_from_slice(random);
    block[14..].copy_from_slice(&addr.to_be_bytes());
    let enc = crypto.aes_encrypt(identity, &block)?;
    let mut hash = [0u8; 8];
    hash.copy_from_slice(&enc[8..]);
    Ok(hash)
}

fn advertise_subnet(sub: &Subnet, gatt_proxy: bool) -> bool {
    sub.node_id == NodeIdState::Running || gatt_proxy
}

pub struct ProxyServer {
    clients: Vec<Option<(u16, Client)>>,
    filter_size: usize,
    node_id_timeout_ms: u64,
    registered: bool,
    /// Next subnet to advertise
    beacon_sub: Option<u16>,
}

impl ProxyServer {
    pub fn new(config: &MeshConfig) -> Self {
        Self {
            clients: (0..config.max_conn).map(|_| None).collect(),
            filter_size: config.proxy_filter_size,
            node_id_timeout_ms: config.node_id_timeout_ms as u64,
            registered: false,
            beacon_sub: None,
        }
    }

    /// Proxy service visible
    pub fn is_enabled(&self) -> bool {
        self.registered
    }

    pub fn conn_count(&self) -> usize {
        self.clients.iter().flatten().count()
    }

    pub fn is_client(&self, conn: u16) -> bool {
        self.client(conn).is_some()
    }

    pub fn filter_type(&self, conn: u16) -> Option<FilterType> {
        self.client(conn).map(|c| c.filter_type)
    }

    pub fn filter(&self, conn: u16) -> Vec<u16> {
        self.client(conn)
            .map(|c| c.filter.iter().flatten().copied().collect())
            .unwrap_or_default()
    }

    fn client(&self, conn: u16) -> Option<&Client> {
        self.clients
            .iter()
            .flatten()
            .find(|(c, _)| *c == conn)
            .map(|(_, client)| client)
    }

    fn client_mut(&mut self, conn: u16) -> Option<&mut Client> {
        self.clients
            .iter_mut()
            .flatten()
            .find(|(c, _)| *c == conn)
            .map(|(_, client)| client)
    }

    fn connected_clients(&self) -> impl Iterator<Item = (u16, &Client)> {
        self.clients.iter().flatten().map(|(conn, client)| (*conn, client))
    }

    // ------------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------------

    /// A central connected to the proxy advertisement.
    ///
    /// Returns false if the proxy service is not registered.
    pub fn connected(&mut self, conn: u16) -> Result<bool, ProxyError> {
        if !self.registered {
            return Ok(false);
        }
        let filter_size = self.filter_size;
        let slot = self
            .clients
            .iter_mut()
            .find(|c| c.is_none())
            .ok_or(ProxyError::NoFreeClient)?;
        debug!("conn {}", conn);
        *slot = Some((
            conn,
            Client {
                filter_type: FilterType::None,
                filter: vec![None; filter_size],
                role: ProxyRole::new(conn),
            },
        ));
        Ok(true)
    }

    /// Returns true if `conn` was a proxy client
    pub fn disconnected(&mut self, conn: u16, sched: &mut Scheduler) -> bool {
        let Some(slot) = self
            .clients
            .iter_mut()
            .find(|slot| matches!(slot, Some((c, _)) if *c == conn))
        else {
            return false;
        };
        if let Some((_, mut client)) = slot.take() {
            client.role.cleanup(sched);
        }
        sched.cancel(Work::ProxyBeacons(conn));
        debug!("conn {} disconnected", conn);
        true
    }

    /// The client enabled notifications on Proxy Data Out
    pub fn ccc_write(&mut self, conn: u16, sched: &mut Scheduler) -> Result<(), ProxyError> {
        debug!("conn_handle {}", conn);
        let client = self.client_mut(conn).ok_or(ProxyError::NotConnected(conn))?;
        if client.filter_type == FilterType::None {
            client.filter_type = FilterType::Accept;
            sched.schedule(Work::ProxyBeacons(conn), 0);
        }
        Ok(())
    }

    /// A write to Proxy Data In
    pub fn recv(&mut self, conn: u16, data: &[u8], sched: &mut Scheduler) -> Result<Option<ProxyPdu>, ProxyError> {
        let client = self.client_mut(conn).ok_or(ProxyError::NotConnected(conn))?;
        match msg::pdu_type(data) {
            None => {
                warn!("Too small Proxy PDU");
                Err(ProxyError::TooShort)
            }
            Some(TYPE_PROV) => {
                warn!("Proxy PDU type doesn't match GATT service");
                Err(ProxyError::WrongService(TYPE_PROV))
            }
            Some(_) => client.role.recv(data, sched),
        }
    }

    /// `Work::ProxySar` expiry
    pub fn sar_timeout(&mut self, conn: u16, bearer: &mut dyn Bearer) -> bool {
        match self.client_mut(conn) {
            Some(client) => {
                msg::sar_timeout(bearer, &mut client.role);
                true
            }
            None => false,
        }
    }

    pub fn send(&self, bearer: &mut dyn Bearer, conn: u16, msg_type: u8, payload: &[u8]) -> Result<(), ProxyError> {
        if self.client(conn).is_none() {
            return Err(ProxyError::NotConnected(conn));
        }
        msg::send(bearer, conn, PROXY_DATA_OUT, msg_type, payload)
    }

    // ------------------------------------------------------------------------
    // Filters
    // ------------------------------------------------------------------------

    /// Handle a decrypted proxy configuration message. Returns the Filter
    /// Status reply, or None for an unknown opcode.
    pub fn filter_recv(&mut self, conn: u16, payload: &[u8]) -> Result<Option<Vec<u8>>, ProxyError> {
        let client = self.client_mut(conn).ok_or(ProxyError::NotConnected(conn))?;
        let (&opcode, params) = payload.split_first().ok_or_else(|| {
            warn!("Too short proxy configuration PDU");
            ProxyError::TooShort
        })?;

        match opcode {
            CFG_FILTER_SET => match params.first() {
                Some(0x00) => {
                    client.filter_clear();
                    client.filter_type = FilterType::Accept;
                }
                Some(0x01) => {
                    client.filter_clear();
                    client.filter_type = FilterType::Reject;
                }
                Some(other) => warn!("Prohibited Filter Type 0x{:02x}", other),
                None => warn!("Too short Filter Set message"),
            },
            CFG_FILTER_ADD => {
                for addr in params.chunks_exact(2) {
                    client.filter_add(u16::from_be_bytes([addr[0], addr[1]]));
                }
            }
            CFG_FILTER_REMOVE => {
                for addr in params.chunks_exact(2) {
                    client.filter_remove(u16::from_be_bytes([addr[0], addr[1]]));
                }
            }
            other => {
                warn!("Unhandled configuration OpCode 0x{:02x}", other);
                return Ok(None);
            }
        }
        Ok(Some(client.status()))
    }

    /// Learn the source of a message received from `conn`
    pub fn addr_add(&mut self, conn: u16, addr: u16) {
        let Some(client) = self.client_mut(conn) else {
            return;
        };
        debug!("filter_type {:?} addr 0x{:04x}", client.filter_type, addr);
        match client.filter_type {
            FilterType::Accept => client.filter_add(addr),
            FilterType::Reject => client.filter_remove(addr),
            FilterType::None => {}
        }
    }

    /// Send a network PDU to every client whose filter passes `dst`
    pub fn relay(&self, bearer: &mut dyn Bearer, pdu: &[u8], dst: u16) -> bool {
        debug!("{} bytes to dst 0x{:04x}", pdu.len(), dst);
        let mut relayed = false;
        for (conn, client) in self.connected_clients() {
            if !client.filter_match(dst) {
                continue;
            }
            match msg::send(bearer, conn, PROXY_DATA_OUT, TYPE_NET_PDU, pdu) {
                Ok(()) => relayed = true,
                Err(e) => error!("Failed to send proxy message (err {})", e),
            }
        }
        relayed
    }

    // ------------------------------------------------------------------------
    // Beacons
    // ------------------------------------------------------------------------

    /// Send a beacon to every connected client
    pub fn beacon_send(&self, bearer: &mut dyn Bearer, beacon: &[u8]) {
        for (conn, _) in self.connected_clients() {
            if let Err(e) = msg::send(bearer, conn, PROXY_DATA_OUT, TYPE_BEACON, beacon) {
                warn!("Failed to send beacon to 0x{:04x}: {}", conn, e);
            }
        }
    }

    /// `Work::ProxyBeacons`: push the beacons of all subnets to `conn`
    pub fn send_beacons(&self, bearer: &mut dyn Bearer, conn: u16, beacons: &[Vec<u8>]) {
        if self.client(conn).is_none() {
            return;
        }
        for beacon in beacons {
            if let Err(e) = msg::send(bearer, conn, PROXY_DATA_OUT, TYPE_BEACON, beacon) {
                warn!("Failed to send beacon to 0x{:04x}: {}", conn, e);
                return;
            }
        }
    }

    // ------------------------------------------------------------------------
    // Service lifecycle
    // ------------------------------------------------------------------------

    pub fn gatt_enable(&mut self, provisioned: bool) -> Result<(), ProxyError> {
        debug!("Enabling proxy service");
        if !provisioned {
            return Err(ProxyError::NotSupported);
        }
        if self.registered {
            return Err(ProxyError::Busy);
        }
        self.registered = true;
        for (_, client) in self.clients.iter_mut().flatten() {
            client.filter_type = FilterType::Accept;
        }
        Ok(())
    }

    /// Close every connection that has a filter configured
    pub fn gatt_disconnect(&mut self, bearer: &mut dyn Bearer) {
        for (conn, client) in self.clients.iter_mut().flatten() {
            if matches!(client.filter_type, FilterType::Accept | FilterType::Reject) {
                client.filter_type = FilterType::None;
                if let Err(e) = bearer.disconnect(*conn) {
                    error!("Failed to disconnect 0x{:04x}: {}", conn, e);
                }
            }
        }
    }

    pub fn gatt_disable(&mut self, bearer: &mut dyn Bearer) -> Result<(), ProxyError> {
        debug!("Disabling proxy service");
        if !self.registered {
            return Err(ProxyError::AlreadyDisabled);
        }
        self.gatt_disconnect(bearer);
        self.registered = false;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Node identity
    // ------------------------------------------------------------------------

    pub fn identity_start(&mut self, net: &mut NetState, net_idx: u16, now: u64) {
        if let Some(sub) = net.subnet_get_mut(net_idx) {
            sub.node_id = NodeIdState::Running;
            sub.node_id_start = now;
            // Prioritize the recently enabled subnet
            self.beacon_sub = Some(net_idx);
        }
    }

    pub fn identity_stop(&mut self, net: &mut NetState, net_idx: u16) {
        if let Some(sub) = net.subnet_get_mut(net_idx) {
            sub.node_id = NodeIdState::Stopped;
            sub.node_id_start = 0;
        }
    }

    /// Start node identity advertising on every subnet. Returns true if any
    /// subnet was started, in which case advertising should be refreshed.
    pub fn identity_enable(&mut self, net: &mut NetState, now: u64) -> Result<bool, ProxyError> {
        if !net.is_valid() {
            return Err(ProxyError::NotProvisioned);
        }
        let mut count = 0;
        for sub in net.subnets_mut() {
            sub.node_id = NodeIdState::Running;
            sub.node_id_start = now;
            count += 1;
        }
        Ok(count > 0)
    }

    /// A subnet was removed
    pub fn subnet_deleted(&mut self, net_idx: u16) {
        if self.beacon_sub == Some(net_idx) {
            self.beacon_sub = None;
        }
    }

    // ------------------------------------------------------------------------
    // Advertising
    // ------------------------------------------------------------------------

    fn next_sub(&mut self, net: &NetState, gatt_proxy: bool) -> Option<u16> {
        let subs: Vec<&Subnet> = net.subnets().collect();
        let start = self
            .beacon_sub
            .and_then(|idx| subs.iter().position(|s| s.net_idx == idx))
            .unwrap_or(0);
        let found = (0..subs.len())
            .map(|off| subs[(start + off) % subs.len()])
            .find(|s| advertise_subnet(s, gatt_proxy))
            .map(|s| s.net_idx);
        if found.is_some() {
            self.beacon_sub = found;
        }
        found
    }

    fn sub_count(net: &NetState, gatt_proxy: bool) -> usize {
        net.subnets().filter(|s| advertise_subnet(s, gatt_proxy)).count()
    }

    /// Connectable advertisement for the next subnet in rotation
    pub fn adv_start(
        &mut self,
        net: &mut NetState,
        gatt_proxy: bool,
        crypto: &mut dyn MeshCrypto,
        now: u64,
    ) -> Result<GattAdv, ProxyError> {
        if !self.registered || !net.is_valid() {
            return Err(ProxyError::NotSupported);
        }
        if self.conn_count() == self.clients.len() {
            debug!("Connectable advertising deferred (max connections {})", self.conn_count());
            return Err(ProxyError::NoFreeClient);
        }
        let net_idx = self.next_sub(net, gatt_proxy).ok_or_else(|| {
            warn!("No subnets to advertise on");
            ProxyError::NoSubnet
        })?;

        let mut remaining = None;
        let subnet_count = Self::sub_count(net, gatt_proxy);
        debug!("sub_count {}", subnet_count);
        if subnet_count > 1 {
            // Slice the node identity period between the subnets, at least
            // one second each
            let max_timeout = (self.node_id_timeout_ms / subnet_count.max(6) as u64).max(1_000);
            remaining = Some(max_timeout);
        }

        let primary = net.primary_addr();
        let node_id_timeout = self.node_id_timeout_ms;
        let sub = net.subnet_get_mut(net_idx).ok_or(ProxyError::NoSubnet)?;
        let mut adv = Err(ProxyError::Busy);

        if sub.node_id == NodeIdState::Running {
            let active = now.saturating_sub(sub.node_id_start);
            if active < node_id_timeout {
                let left = node_id_timeout - active;
                debug!("Node ID active for {} ms, {} ms remaining", active, left);
                remaining = Some(left);
                adv = node_id_adv(sub, primary, crypto, left);
            } else {
                sub.node_id = NodeIdState::Stopped;
                sub.node_id_start = 0;
                debug!("Node ID stopped");
            }
        }

        if sub.node_id == NodeIdState::Stopped {
            adv = Ok(net_id_adv(sub, remaining));
        }

        debug!("Advertising {:?} ms for net_idx 0x{:04x}", remaining, net_idx);

        // Move on to the next subnet
        let subs: Vec<u16> = net.subnets().map(|s| s.net_idx).collect();
        self.beacon_sub = subs
            .iter()
            .position(|&idx| idx == net_idx)
            .map(|pos| subs[(pos + 1) % subs.len()]);

        adv
    }
}

fn node_id_adv(
    sub: &Subnet,
    primary: u16,
    crypto: &mut dyn MeshCrypto,
    duration: u64,
) -> Result<GattAdv, ProxyError> {
    let mut random = [0u8; 8];
    crypto.rand(&mut random);
    let hash = node_id_hash(crypto, &sub.keys[sub.tx_idx()].identity, &random, primary)?;

    let mut svc_data = vec![ID_TYPE_NODE];
    svc_data.extend_from_slice(&hash);
    svc_data.extend_from_slice(&random);
    Ok(GattAdv::service(UUID_MESH_PROXY, ADV_FAST_INT_MS, Some(duration), &svc_data))
}

fn net_id_adv(sub: &Subnet, duration: Option<u64>) -> GattAdv {
    let net_id = &sub.keys[sub.tx_idx()].net_id;
    debug!("Advertising with NetId {}", hex::encode(net_id));
    let mut svc_data = vec![ID_TYPE_NET];
    svc_data.extend_from_slice(net_id);
    GattAdv::service(UUID_MESH_PROXY, ADV_SLOW_INT_MS, duration, &svc_data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bearer::MockBearer;
    use crate::crypto::SoftCrypto;
    use std::sync::{Arc, Mutex};

    type Sent = Arc<Mutex<Vec<(u16, Vec<u8>)>>>;

    fn recording_bearer() -> (MockBearer, Sent) {
        let sent: Sent = Arc::default();
        let mut bearer = MockBearer::new();
        bearer.expect_att_mtu().return_const(69u16);
        let log = sent.clone();
        bearer.expect_gatt_notify().returning(move |conn, _, data| {
            log.lock().unwrap().push((conn, data.to_vec()));
            Ok(())
        });
        bearer.expect_disconnect().returning(|_| Ok(()));
        (bearer, sent)
    }

    fn server() -> ProxyServer {
        let mut server = ProxyServer::new(&MeshConfig {
            max_conn: 2,
            proxy_filter_size: 3,
            ..MeshConfig::default()
        });
        server.gatt_enable(true).unwrap();
        server
    }

    fn net(subnets: &[u16]) -> NetState {
        let crypto = SoftCrypto::new();
        let mut net = NetState::new(4, 1, 1);
        for &idx in subnets {
            net.subnet_add(&crypto, idx, &[idx as u8 + 1; 16]).unwrap();
        }
        net.provision(0x0100, &[0; 16], 0, false);
        net.set_elem_count(1);
        net.set_valid(true);
        net
    }

    #[test]
    fn test_client_table_and_service_state() {
        let mut sched = Scheduler::new();
        let mut unregistered = ProxyServer::new(&MeshConfig::default());
        assert_eq!(unregistered.connected(1), Ok(false));
        assert_eq!(unregistered.gatt_enable(false), Err(ProxyError::NotSupported));

        let mut server = server();
        assert_eq!(server.gatt_enable(true), Err(ProxyError::Busy));
        assert_eq!(server.connected(1), Ok(true));
        assert_eq!(server.connected(2), Ok(true));
        assert_eq!(server.connected(3), Err(ProxyError::NoFreeClient));
        assert_eq!(server.filter_type(1), Some(FilterType::None));

        assert!(server.disconnected(1, &mut sched));
        assert!(!server.disconnected(1, &mut sched));
        assert_eq!(server.connected(3), Ok(true));
        assert_eq!(server.conn_count(), 2);
    }

    #[test]
    fn test_ccc_write_accepts_and_queues_beacons() {
        let mut sched = Scheduler::new();
        let mut server = server();
        server.connected(4).unwrap();
        server.ccc_write(4, &mut sched).unwrap();
        assert_eq!(server.filter_type(4), Some(FilterType::Accept));
        assert_eq!(sched.pop_due(), Some(Work::ProxyBeacons(4)));

        // Only the first subscription flips the filter
        server.ccc_write(4, &mut sched).unwrap();
        assert!(!sched.is_pending(Work::ProxyBeacons(4)));
        assert_eq!(server.ccc_write(9, &mut sched), Err(ProxyError::NotConnected(9)));
    }

    #[test]
    fn test_filter_messages_reply_with_status() {
        let mut server = server();
        server.connected(1).unwrap();

        let status = server.filter_recv(1, &[CFG_FILTER_SET, 0x01]).unwrap();
        assert_eq!(status, Some(vec![CFG_FILTER_STATUS, 0x01, 0x00, 0x00]));
        assert_eq!(server.filter_type(1), Some(FilterType::Reject));

        let add = [CFG_FILTER_ADD, 0x00, 0x05, 0xc0, 0x01, 0x00, 0x05, 0x00, 0x00];
        let status = server.filter_recv(1, &add).unwrap();
        assert_eq!(status, Some(vec![CFG_FILTER_STATUS, 0x01, 0x00, 0x02]));
        assert_eq!(server.filter(1), vec![0x0005, 0xc001]);

        let status = server.filter_recv(1, &[CFG_FILTER_REMOVE, 0x00, 0x05]).unwrap();
        assert_eq!(status, Some(vec![CFG_FILTER_STATUS, 0x01, 0x00, 0x01]));

        // Prohibited type leaves the filter alone but still reports it
        let status = server.filter_recv(1, &[CFG_FILTER_SET, 0x02]).unwrap();
        assert_eq!(status, Some(vec![CFG_FILTER_STATUS, 0x01, 0x00, 0x01]));

        assert_eq!(server.filter_recv(1, &[0x07]), Ok(None));
        assert_eq!(server.filter_recv(1, &[]), Err(ProxyError::TooShort));
    }

    #[test]
    fn test_filter_capacity() {
        let mut server = server();
        server.connected(1).unwrap();
        server.filter_recv(1, &[CFG_FILTER_SET, 0x00]).unwrap();
        for addr in 1..=5u16 {
            server.addr_add(1, addr);
        }
        assert_eq!(server.filter(1), vec![1, 2, 3]);
    }

    #[test]
    fn test_relay_follows_filters() {
        let mut sched = Scheduler::new();
        let (mut bearer, sent) = recording_bearer();
        let mut server = server();
        server.connected(1).unwrap();
        server.connected(2).unwrap();

        // No filter yet: nothing relayed
        assert!(!server.relay(&mut bearer, &[0xaa], addr::ADDR_ALL_NODES));

        server.ccc_write(1, &mut sched).unwrap();
        server.addr_add(1, 0x0007);
        server.filter_recv(2, &[CFG_FILTER_SET, 0x01]).unwrap();
        server.filter_recv(2, &[CFG_FILTER_ADD, 0x00, 0x07]).unwrap();

        assert!(server.relay(&mut bearer, &[0x01], 0x0007));
        assert!(server.relay(&mut bearer, &[0x02], 0x0008));
        assert!(server.relay(&mut bearer, &[0x03], addr::ADDR_ALL_NODES));
        assert_eq!(
            *sent.lock().unwrap(),
            vec![
                (1, vec![0x00, 0x01]),
                (2, vec![0x00, 0x02]),
                (1, vec![0x00, 0x03]),
                (2, vec![0x00, 0x03]),
            ]
        );

        // Reject filters learn by removal
        server.addr_add(2, 0x0007);
        assert!(server.filter(2).is_empty());
    }

    #[test]
    fn test_prov_pdu_rejected_on_proxy_service() {
        let mut sched = Scheduler::new();
        let mut server = server();
        server.connected(1).unwrap();
        assert_eq!(
            server.recv(1, &[0x03, 0x00], &mut sched),
            Err(ProxyError::WrongService(TYPE_PROV))
        );
        let pdu = server.recv(1, &[0x01, 0xbb], &mut sched).unwrap().unwrap();
        assert_eq!((pdu.msg_type, pdu.data), (TYPE_BEACON, vec![0xbb]));
    }

    #[test]
    fn test_disable_disconnects_filtered_clients() {
        let mut sched = Scheduler::new();
        let mut bearer = MockBearer::new();
        bearer
            .expect_disconnect()
            .with(mockall::predicate::eq(1))
            .times(1)
            .returning(|_| Ok(()));
        let mut server = server();
        server.connected(1).unwrap();
        server.connected(2).unwrap();
        server.ccc_write(1, &mut sched).unwrap();

        server.gatt_disable(&mut bearer).unwrap();
        assert_eq!(server.filter_type(1), Some(FilterType::None));
        assert_eq!(server.gatt_disable(&mut bearer), Err(ProxyError::AlreadyDisabled));
    }

    #[test]
    fn test_net_id_advertising() {
        let mut crypto = SoftCrypto::new();
        let mut net = net(&[0]);
        let mut server = server();
        let adv = server.adv_start(&mut net, true, &mut crypto, 0).unwrap();
        let svc = adv.service_data().unwrap();
        assert_eq!(svc.len(), NET_ID_LEN);
        assert_eq!(&svc[..3], &[0x28, 0x18, ID_TYPE_NET]);
        assert_eq!(&svc[3..], &net.subnet_get(0).unwrap().keys[0].net_id);
        assert_eq!(adv.params.interval_ms, ADV_SLOW_INT_MS);
        assert_eq!(adv.params.duration_ms, None);
        assert!(adv.params.connectable);

        // Proxy feature off and no node identity: nothing to advertise
        assert_eq!(
            server.adv_start(&mut net, false, &mut crypto, 0),
            Err(ProxyError::NoSubnet)
        );
    }

    #[test]
    fn test_node_identity_advertising_and_timeout() {
        let mut crypto = SoftCrypto::new();
        let mut net = net(&[0]);
        let mut server = server();
        assert!(server.identity_enable(&mut net, 1_000).unwrap());

        let adv = server.adv_start(&mut net, false, &mut crypto, 11_000).unwrap();
        let svc = adv.service_data().unwrap().to_vec();
        assert_eq!(svc.len(), NODE_ID_LEN);
        assert_eq!(svc[2], ID_TYPE_NODE);
        assert_eq!(adv.params.duration_ms, Some(50_000));
        assert_eq!(adv.params.interval_ms, ADV_FAST_INT_MS);

        let random: [u8; 8] = svc[11..19].try_into().unwrap();
        let identity = net.subnet_get(0).unwrap().keys[0].identity;
        let hash = node_id_hash(&crypto, &identity, &random, 0x0100).unwrap();
        assert_eq!(&svc[3..11], &hash);

        // Past the timeout node identity stops and Network ID takes over
        let adv = server.adv_start(&mut net, true, &mut crypto, 61_000).unwrap();
        assert_eq!(adv.service_data().unwrap()[2], ID_TYPE_NET);
        assert_eq!(net.subnet_get(0).unwrap().node_id, NodeIdState::Stopped);
    }

    #[test]
    fn test_rotation_slices_between_subnets() {
        let mut crypto = SoftCrypto::new();
        let mut net = net(&[0, 1]);
        let mut server = server();
        let first = server.adv_start(&mut net, true, &mut crypto, 0).unwrap();
        let second = server.adv_start(&mut net, true, &mut crypto, 0).unwrap();
        let third = server.adv_start(&mut net, true, &mut crypto, 0).unwrap();

        assert_eq!(first.params.duration_ms, Some(10_000));
        assert_eq!(&first.service_data().unwrap()[3..], &net.subnet_get(0).unwrap().keys[0].net_id);
        assert_eq!(&second.service_data().unwrap()[3..], &net.subnet_get(1).unwrap().keys[0].net_id);
        assert_eq!(first.service_data(), third.service_data());
    }

    #[test]
    fn test_advertising_deferred_at_connection_limit() {
        let mut crypto = SoftCrypto::new();
        let mut net = net(&[0]);
        let mut server = server();
        server.connected(1).unwrap();
        server.connected(2).unwrap();
        assert_eq!(
            server.adv_start(&mut net, true, &mut crypto, 0),
            Err(ProxyError::NoFreeClient)
        );
    }

    #[test]
    fn test_send_beacons_to_new_client() {
        let (mut bearer, sent) = recording_bearer();
        let mut server = server();
        server.connected(3).unwrap();
        server.send_beacons(&mut bearer, 3, &[vec![0x01, 0x00], vec![0x01, 0x02]]);
        server.beacon_send(&mut bearer, &[0x01, 0x03]);
        assert_eq!(
            *sent.lock().unwrap(),
            vec![
                (3, vec![0x01, 0x01, 0x00]),
                (3, vec![0x01, 0x01, 0x02]),
                (3, vec![0x01, 0x01, 0x03]),
            ]
        );
    }
}
