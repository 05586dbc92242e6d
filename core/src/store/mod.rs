// Persistent settings backing store

pub mod backend;

pub use backend::{decode_record, encode_record, MemoryStore, SettingsStore, SledStore, StoreError};
