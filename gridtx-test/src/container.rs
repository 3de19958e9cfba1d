use dashmap::DashMap;
use gridtx_common::{EntryVersion, Key, Value};
use gridtx_transaction::{DataContainer, InternalEntry};

/// Data container keeping every entry in memory.
#[derive(Debug, Default)]
pub struct MemoryDataContainer {
    entries: DashMap<Key, InternalEntry>,
}

impl MemoryDataContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value(&self, key: &Key) -> Option<Value> {
        self.entries.get(key).map(|entry| entry.value.clone())
    }

    pub fn version(&self, key: &Key) -> Option<EntryVersion> {
        self.entries.get(key).map(|entry| entry.version)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl DataContainer for MemoryDataContainer {
    fn get(&self, key: &Key) -> Option<InternalEntry> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    fn put(&self, key: Key, value: Value, version: EntryVersion) {
        self.entries.insert(key, InternalEntry::new(value, version));
    }

    fn remove(&self, key: &Key) {
        self.entries.remove(key);
    }
}
