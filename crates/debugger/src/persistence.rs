use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

/// The storage the debugger persists its state into.
#[async_trait(?Send)]
pub trait KeyValueStore {
    async fn read_kvp(&self, key: &str) -> Result<Option<String>>;
    async fn write_kvp(&self, key: String, value: String) -> Result<()>;
}

#[derive(Default)]
pub struct InMemoryKeyValueStore {
    values: Mutex<HashMap<String, String>>,
}

impl InMemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.values.lock().get(key).cloned()
    }
}

#[async_trait(?Send)]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn read_kvp(&self, key: &str) -> Result<Option<String>> {
        Ok(self.get(key))
    }

    async fn write_kvp(&self, key: String, value: String) -> Result<()> {
        self.values.lock().insert(key, value);
        Ok(())
    }
}
