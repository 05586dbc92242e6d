// Model bindings, subscriptions and publication parameters in the settings
// store. Each kind is flushed separately under
// `bt_mesh/{s|v}/<elem<<8|mod>/{bind,sub,pub}`; model-private data lives
// beside them under `data[/name]` and is written through immediately.

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use super::{Access, AccessError, ModPending, ModelRef};
use crate::addr::{self, BoundKey};
use crate::settings::keys::{self, ModelRecord};
use crate::store::{decode_record, encode_record, SettingsStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct PubRecord {
    addr: u16,
    key: u16,
    ttl: u8,
    retransmit: u8,
    period: u8,
    period_div: u8,
    cred: bool,
}

fn save(store: &dyn SettingsStore, path: &str, value: Option<&[u8]>, what: &str) {
    match store.save(path, value) {
        Ok(()) => debug!("Stored {} value as {}", what, path),
        Err(e) => error!("Failed to store {} value at {}: {}", what, path, e),
    }
}

fn save_record<T: Serialize>(store: &dyn SettingsStore, path: &str, record: Option<&T>, what: &str) {
    let bytes = match record.map(encode_record).transpose() {
        Ok(bytes) => bytes,
        Err(e) => {
            error!("Unable to encode {} record: {}", what, e);
            return;
        }
    };
    save(store, path, bytes.as_deref(), what);
}

impl Access {
    /// Write every model's pending bind, sub and pub records
    pub fn pending_store(&mut self, store: &dyn SettingsStore) {
        for model in self.model_refs() {
            let Some(m) = self.model_mut(model) else {
                continue;
            };
            let pending = std::mem::take(&mut m.pending);
            if pending == ModPending::default() {
                continue;
            }
            let m = &*m;
            let path = |record| keys::model(model.vnd, model.elem_idx, model.mod_idx, &record);

            if pending.bind {
                let bound: Vec<u16> = m.keys().map(BoundKey::to_raw).collect();
                let record = (!bound.is_empty()).then_some(&bound);
                save_record(store, &path(ModelRecord::Bind), record, "bind");
            }

            if pending.sub {
                let groups: Vec<u16> = m.groups().collect();
                let record = (!groups.is_empty()).then_some(&groups);
                save_record(store, &path(ModelRecord::Sub), record, "sub");
            }

            if pending.publication {
                let record = m
                    .publication()
                    .filter(|p| !addr::is_unassigned(p.addr))
                    .map(|p| PubRecord {
                        addr: p.addr,
                        key: p.key,
                        ttl: p.ttl,
                        retransmit: p.retransmit,
                        period: p.period,
                        period_div: p.period_div,
                        cred: p.cred,
                    });
                save_record(store, &path(ModelRecord::Pub), record.as_ref(), "pub");
            }
        }
    }

    /// Write model-private data straight to the store
    pub fn model_data_store(
        &self,
        model: ModelRef,
        name: Option<&str>,
        data: Option<&[u8]>,
        store: &dyn SettingsStore,
    ) -> Result<(), StoreError> {
        if self.model(model).is_none() {
            return Err(StoreError::InvalidKey(format!("{:?}", model)));
        }
        let path = keys::model(
            model.vnd,
            model.elem_idx,
            model.mod_idx,
            &ModelRecord::Data(name.map(str::to_string)),
        );
        store.save(&path, data)?;
        debug!("Stored model data at {}", path);
        Ok(())
    }

    /// Apply one stored model record
    pub fn restore(
        &mut self,
        model: ModelRef,
        record: &ModelRecord,
        value: Option<&[u8]>,
    ) -> Result<(), StoreError> {
        let m = self.model_mut(model).ok_or_else(|| {
            error!("Failed to get model for {:?}", model);
            StoreError::InvalidKey(format!("{:?}", model))
        })?;

        match record {
            ModelRecord::Bind => {
                let bound: Vec<u16> = value.map(decode_record).transpose()?.unwrap_or_default();
                m.keys.iter_mut().for_each(|k| *k = None);
                for (slot, raw) in m.keys.iter_mut().zip(bound) {
                    *slot = BoundKey::from_raw(raw);
                }
                debug!("Decoded bindings for {:?}", model);
            }
            ModelRecord::Sub => {
                let groups: Vec<u16> = value.map(decode_record).transpose()?.unwrap_or_default();
                m.groups.iter_mut().for_each(|g| *g = None);
                for (slot, group) in m.groups.iter_mut().zip(groups) {
                    *slot = Some(group);
                }
                debug!("Decoded subscriptions for {:?}", model);
            }
            ModelRecord::Pub => {
                let Some(publication) = m.publication.as_mut() else {
                    warn!("Model does not support publication");
                    return Err(StoreError::InvalidKey(format!("{:?}/pub", model)));
                };
                match value.map(decode_record::<PubRecord>).transpose()? {
                    None => {
                        publication.clear();
                        debug!("Cleared publication for {:?}", model);
                    }
                    Some(record) => {
                        publication.addr = record.addr;
                        publication.key = record.key;
                        publication.ttl = record.ttl;
                        publication.retransmit = record.retransmit;
                        publication.period = record.period;
                        publication.period_div = record.period_div;
                        publication.cred = record.cred;
                        publication.count = 0;
                        debug!(
                            "Restored model publication, dst 0x{:04x} app_idx 0x{:03x}",
                            record.addr, record.key
                        );
                    }
                }
            }
            ModelRecord::Data(name) => {
                m.handler
                    .settings_set(name.as_deref(), value)
                    .map_err(|e: AccessError| StoreError::Decode(e.to_string()))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::tests::Recorder;
    use crate::access::{Composition, Element, Model, ModelHandler, ModelOp, ModelPub, PubParams};
    use crate::config::MeshConfig;
    use crate::net::MsgCtx;
    use crate::scheduler::{Scheduler, Work};
    use crate::settings::keys::SettingsKey;
    use crate::store::MemoryStore;
    use std::sync::{Arc, Mutex};

    const M: ModelRef = ModelRef {
        elem_idx: 0,
        vnd: false,
        mod_idx: 0,
    };

    struct Counter {
        value: Arc<Mutex<Option<Vec<u8>>>>,
    }

    impl ModelHandler for Counter {
        fn ops(&self) -> &[ModelOp] {
            &[]
        }

        fn handle(&mut self, _: u32, _: &MsgCtx, _: &[u8]) -> Option<Vec<u8>> {
            None
        }

        fn settings_set(&mut self, name: Option<&str>, data: Option<&[u8]>) -> Result<(), AccessError> {
            if name != Some("count") {
                return Err(AccessError::InvalidArgument("unknown entry"));
            }
            *self.value.lock().unwrap() = data.map(<[u8]>::to_vec);
            Ok(())
        }
    }

    fn access() -> Access {
        let (handler, _) = Recorder::new(vec![]);
        let comp = Composition {
            cid: 0,
            pid: 0,
            vid: 0,
            elements: vec![Element::new(
                0,
                vec![Model::sig(0x1000, Box::new(handler)).with_pub(ModelPub::new().with_update())],
            )],
        };
        let mut access = Access::new(comp, &MeshConfig::default()).unwrap();
        access.comp_provision(0x0040);
        access
    }

    fn replay(store: &MemoryStore, access: &mut Access) {
        for (path, value) in store.load_all(keys::ROOT).unwrap() {
            if let Some(SettingsKey::Model {
                vnd,
                elem_idx,
                mod_idx,
                record,
            }) = SettingsKey::parse(&path)
            {
                let model = ModelRef {
                    elem_idx,
                    vnd,
                    mod_idx,
                };
                access.restore(model, &record, Some(&value)).unwrap();
            }
        }
    }

    #[test]
    fn test_store_and_restore_model_state() {
        let store = MemoryStore::new();
        let mut sched = Scheduler::new();
        let mut original = access();
        original.bind(M, BoundKey::App(1)).unwrap();
        original.bind(M, BoundKey::AnyDevKey).unwrap();
        original.sub_add(M, 0xc010).unwrap();
        original
            .pub_set(
                M,
                PubParams {
                    addr: 0xc010,
                    key: 1,
                    cred: false,
                    ttl: 3,
                    retransmit: 0x09,
                    period: 0x42,
                },
                &mut sched,
            )
            .unwrap();
        assert!(original.take_store_request());
        original.pending_store(&store);
        assert_eq!(store.len(), 3);

        let mut restored = access();
        replay(&store, &mut restored);
        let m = restored.model(M).unwrap();
        assert_eq!(
            m.keys().collect::<Vec<_>>(),
            vec![BoundKey::App(1), BoundKey::AnyDevKey]
        );
        assert_eq!(m.groups().collect::<Vec<_>>(), vec![0xc010]);
        let p = m.publication().unwrap();
        assert_eq!((p.addr, p.key, p.ttl, p.retransmit, p.period), (0xc010, 1, 3, 0x09, 0x42));

        let mut sched = Scheduler::new();
        restored.commit(&mut sched);
        assert_eq!(sched.remaining(Work::ModelPublish(M)), Some(2_000));
    }

    #[test]
    fn test_emptied_lists_are_deleted() {
        let store = MemoryStore::new();
        let mut access = access();
        access.bind(M, BoundKey::App(1)).unwrap();
        access.sub_add(M, 0xc010).unwrap();
        access.pending_store(&store);
        assert_eq!(store.len(), 2);

        access.unbind(M, BoundKey::App(1)).unwrap();
        access.sub_del(M, 0xc010).unwrap();
        access.pending_store(&store);
        assert!(store.is_empty());
    }

    #[test]
    fn test_unbind_clears_publication_using_key() {
        let mut sched = Scheduler::new();
        let mut access = access();
        access.bind(M, BoundKey::App(2)).unwrap();
        access
            .pub_set(
                M,
                PubParams {
                    addr: 0xc001,
                    key: 2,
                    cred: false,
                    ttl: 1,
                    retransmit: 0,
                    period: 0,
                },
                &mut sched,
            )
            .unwrap();
        access.unbind(M, BoundKey::App(2)).unwrap();
        assert!(addr::is_unassigned(access.pub_get(M).unwrap().addr));
    }

    #[test]
    fn test_model_data_reaches_handler() {
        let value = Arc::new(Mutex::new(None));
        let comp = Composition {
            cid: 0,
            pid: 0,
            vid: 0,
            elements: vec![Element::new(
                0,
                vec![Model::vendor(0x0059, 7, Box::new(Counter { value: value.clone() }))],
            )],
        };
        let mut access = Access::new(comp, &MeshConfig::default()).unwrap();
        let vnd = access.model_find_vnd(0, 0x0059, 7).unwrap();
        let store = MemoryStore::new();
        access
            .model_data_store(vnd, Some("count"), Some(&[0x2a]), &store)
            .unwrap();
        assert_eq!(store.keys(), vec!["bt_mesh/v/0/data/count".to_string()]);

        replay(&store, &mut access);
        assert_eq!(*value.lock().unwrap(), Some(vec![0x2a]));

        let err = access.restore(vnd, &ModelRecord::Data(None), Some(&[1]));
        assert!(err.is_err());
    }

    #[test]
    fn test_restore_unknown_model_fails() {
        let mut access = access();
        let missing = ModelRef {
            elem_idx: 3,
            vnd: false,
            mod_idx: 0,
        };
        assert!(access.restore(missing, &ModelRecord::Bind, None).is_err());
    }
}
