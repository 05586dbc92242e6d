// Provisioning a device end to end: PB-ADV between two stacks sharing an
// advertising channel, and the device side of PB-GATT.

mod common;

use common::*;
use nimble_mesh_core::adv::AD_SERVICE_DATA16;
use nimble_mesh_core::proxy::PROV_DATA_OUT;
use nimble_mesh_core::{MemoryStore, MeshError, NodeRequest, ProvInfo};
use uuid::Uuid;

const DEV_UUID: [u8; 16] = [
    0xd0, 0x5e, 0x1c, 0x3a, 0x42, 0x77, 0x4b, 0x18, 0x9e, 0x01, 0x5a, 0x6c, 0x10, 0x20, 0x30, 0x40,
];

fn device_info() -> ProvInfo {
    ProvInfo {
        uuid: Uuid::from_bytes(DEV_UUID),
        ..Default::default()
    }
}

#[test]
fn test_pb_adv_provisioning() {
    init_tracing();
    let mut medium = Medium::new();

    let (mut prov, prov_air, _) = node(MemoryStore::new(), ProvInfo::default(), None);
    prov.cdb_create(&NET_KEY).unwrap();
    let prov = medium.join(prov, prov_air);

    let (mut dev, dev_air, _) = node(MemoryStore::new(), device_info(), None);
    dev.prov_enable().unwrap();
    let dev = medium.join(dev, dev_air);

    let request = NodeRequest {
        addr: 0x0100,
        ..NodeRequest::new(DEV_UUID, 0)
    };
    medium.mesh(prov).provision_adv(request).unwrap();

    let done = medium.run_until(60_000, |m| {
        m.mesh(dev).is_provisioned() && !m.mesh(prov).pb_adv().is_active()
    });
    assert!(done, "device not provisioned within the protocol timeout");

    let dev_key = *medium.mesh(dev).net().dev_key();
    assert_eq!(medium.mesh(dev).net().primary_addr(), 0x0100);
    assert!(medium.mesh(dev).net().subnet_get(0).is_some());

    let node = medium.mesh(prov).cdb().node_get(0x0100).unwrap().clone();
    assert_eq!(node.uuid, DEV_UUID);
    assert_eq!(node.num_elem, 1);
    assert_eq!(node.dev_key, dev_key);

    // A provisioned device no longer answers link requests
    assert!(matches!(
        medium.mesh(dev).prov_enable(),
        Err(MeshError::AlreadyProvisioned)
    ));
}

#[test]
fn test_provisioning_known_device_rejected() {
    let (mut prov, _, _) = node(MemoryStore::new(), ProvInfo::default(), None);

    // No CDB yet
    assert!(prov.provision_adv(NodeRequest::new(DEV_UUID, 0)).is_err());

    prov.cdb_create(&NET_KEY).unwrap();
    assert!(prov.provision_adv(NodeRequest::new(DEV_UUID, 1)).is_err());
    assert!(!prov.pb_adv().is_active());
}

#[test]
fn test_pb_gatt_invite() {
    init_tracing();
    let (mut dev, air, _) = node(MemoryStore::new(), device_info(), None);
    dev.prov_enable().unwrap();
    dev.advance_to(STEP_MS);

    let svc = air.ads(AD_SERVICE_DATA16);
    let prov_svc = svc
        .iter()
        .find(|data| data.starts_with(&[0x27, 0x18]))
        .expect("provisioning service advertised");
    assert_eq!(&prov_svc[2..18], &DEV_UUID);

    dev.gatt_connected(1);
    dev.gatt_ccc_write(1).unwrap();
    assert!(dev.prov().is_active());

    // Invite with a five second attention timer
    dev.gatt_write(1, &[0x03, 0x00, 0x05]).unwrap();
    let notified = air.notified(1);
    let (chr, caps) = notified.last().expect("capabilities notified");
    assert_eq!(*chr, PROV_DATA_OUT);
    assert_eq!(&caps[..3], &[0x03, 0x01, 0x01]);

    dev.gatt_disconnected(1);
    assert!(!dev.prov().is_active());
    assert!(!dev.is_provisioned());
}
