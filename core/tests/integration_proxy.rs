// GATT proxy server: beacons on subscribe, network PDUs in both
// directions, filter configuration and shutdown.

mod common;

use common::*;
use nimble_mesh_core::addr::ADDR_UNASSIGNED;
use nimble_mesh_core::net::{NetIf, NetTx};
use nimble_mesh_core::proxy::server::FilterType;
use nimble_mesh_core::proxy::PROXY_DATA_OUT;
use nimble_mesh_core::{
    FeatureState, KeyRef, MemoryStore, Mesh, MsgCtx, NetworkLayer, PlainNetwork, ProvInfo,
};

const CLIENT: u16 = 0x0100;
const CONN: u16 = 1;

fn proxy_node() -> (Mesh, AirBearer, Seen) {
    init_tracing();
    let (mut mesh, air, seen) = node(MemoryStore::new(), ProvInfo::default(), Some(vec![0x82, 0x04, 0x01]));
    configure(&mut mesh, 0x0003);
    mesh.gatt_connected(CONN);
    mesh.gatt_ccc_write(CONN).unwrap();
    (mesh, air, seen)
}

fn client_pdu(mesh: &Mesh, seq: u32, dst: u16, payload: &[u8]) -> Vec<u8> {
    let tx = NetTx {
        src: CLIENT,
        seq,
        ctl: false,
        ctx: MsgCtx::to(0, KeyRef::App(0), dst, 5),
        xmit: 0,
    };
    let mut write = vec![0x00];
    write.extend(PlainNetwork.encode(mesh.net(), &tx, payload).unwrap());
    write
}

fn filter_msg(mesh: &Mesh, seq: u32, payload: &[u8]) -> Vec<u8> {
    let tx = NetTx {
        src: CLIENT,
        seq,
        ctl: true,
        ctx: MsgCtx::control(0, ADDR_UNASSIGNED, 0),
        xmit: 0,
    };
    let mut write = vec![0x02];
    write.extend(PlainNetwork.encode(mesh.net(), &tx, payload).unwrap());
    write
}

#[test]
fn test_subscribe_sends_beacon() {
    let (mesh, air, _) = proxy_node();

    assert_eq!(mesh.proxy().filter_type(CONN), Some(FilterType::Accept));
    let notified = air.notified(CONN);
    let (chr, beacon) = notified.first().expect("beacon on subscribe");
    assert_eq!(*chr, PROXY_DATA_OUT);
    assert_eq!(beacon[0], 0x01);
}

#[test]
fn test_message_from_client_answered_through_proxy() {
    let (mut mesh, air, seen) = proxy_node();
    let write = client_pdu(&mesh, 1, 0x0003, &[0x82, 0x02, 0x07]);
    mesh.gatt_write(CONN, &write).unwrap();

    assert_eq!(seen.lock().len(), 1);
    assert_eq!(seen.lock()[0].1, CLIENT);
    assert_eq!(mesh.proxy().filter(CONN), vec![CLIENT]);

    let notified = air.notified(CONN);
    let (_, reply) = notified.last().unwrap();
    assert_eq!(reply[0], 0x00);
    let rx = PlainNetwork
        .decode(mesh.net(), NetIf::Proxy(CONN), &reply[1..])
        .unwrap();
    assert_eq!(rx.ctx.addr, 0x0003);
    assert_eq!(rx.ctx.recv_dst, CLIENT);
    assert_eq!(rx.payload, vec![0x82, 0x04, 0x01]);
}

#[test]
fn test_filter_add_answers_with_status() {
    let (mut mesh, air, _) = proxy_node();
    let write = filter_msg(&mesh, 1, &[0x01, 0xc0, 0x01]);
    mesh.gatt_write(CONN, &write).unwrap();

    let notified = air.notified(CONN);
    let (_, status) = notified.last().unwrap();
    assert_eq!(status[0], 0x02);
    let rx = PlainNetwork
        .decode(mesh.net(), NetIf::Proxy(CONN), &status[1..])
        .unwrap();
    assert!(rx.ctl);
    assert_eq!(rx.ctx.recv_dst, ADDR_UNASSIGNED);
    // Accept list with the client and the group
    assert_eq!(rx.payload, vec![0x03, 0x00, 0x00, 0x02]);

    // Group traffic now reaches the client
    let before = air.notified(CONN).len();
    let ctx = MsgCtx::to(0, KeyRef::App(0), 0xc001, 3);
    mesh.model_send(MODEL, ctx, vec![0x82, 0x01]).unwrap();
    assert_eq!(air.notified(CONN).len(), before + 1);
}

#[test]
fn test_filter_unknown_opcode_ignored() {
    let (mut mesh, air, _) = proxy_node();
    let before = air.notified(CONN).len();
    let write = filter_msg(&mesh, 1, &[0x07]);
    mesh.gatt_write(CONN, &write).unwrap();
    assert_eq!(air.notified(CONN).len(), before);
}

#[test]
fn test_prov_pdu_on_proxy_rejected() {
    let (mut mesh, _, _) = proxy_node();
    assert!(mesh.gatt_write(CONN, &[0x03, 0x00, 0x05]).is_err());
    assert!(mesh.gatt_write(9, &[0x00, 0x00]).is_err());
}

#[test]
fn test_disabling_proxy_disconnects_clients() {
    let (mut mesh, air, _) = proxy_node();
    mesh.gatt_proxy_set(FeatureState::Disabled).unwrap();
    assert_eq!(*air.disconnects.lock(), vec![CONN]);

    mesh.gatt_disconnected(CONN);
    assert!(!mesh.proxy().is_client(CONN));
}
